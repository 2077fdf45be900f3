// Dispatch tables for the next element of the layer chain
//
// At instance/device creation we greedily resolve every entrypoint
// we may ever forward to through the next layer's GetProcAddr. Each
// entrypoint carries the extension it belongs to and the core
// version it was promoted in, so vkGet*ProcAddr can refuse to hand
// out functions of extensions the application never enabled.
use ash::vk;
use std::collections::{HashMap, HashSet};
use std::ffi::CString;
use std::os::raw::{c_char, c_void};

use crate::{Result, WsiError};
use utils::log;

/// Marker for entrypoints that are not part of any core version.
pub const API_VERSION_MAX: u32 = u32::MAX;

pub struct EntrypointDesc {
    pub name: &'static str,
    pub ext: &'static str,
    pub core_version: u32,
    pub required: bool,
}

const fn ep(
    name: &'static str,
    ext: &'static str,
    core_version: u32,
    required: bool,
) -> EntrypointDesc {
    EntrypointDesc {
        name,
        ext,
        core_version,
        required,
    }
}

const V1_0: u32 = vk::API_VERSION_1_0;
const V1_1: u32 = vk::API_VERSION_1_1;

/* Entrypoints the layer resolves on the instance chain. The loader
 * implements some of these itself, so a non-null pointer does not
 * imply the ICD supports them. Entries marked required fail layer
 * initialization when they resolve null. */
pub const INSTANCE_ENTRYPOINTS: &[EntrypointDesc] = &[
    ep("vkGetInstanceProcAddr", "", V1_0, true),
    ep("vkDestroyInstance", "", V1_0, true),
    ep("vkGetPhysicalDeviceProperties", "", V1_0, true),
    ep("vkGetPhysicalDeviceMemoryProperties", "", V1_0, true),
    ep("vkGetPhysicalDeviceImageFormatProperties", "", V1_0, true),
    ep("vkEnumerateDeviceExtensionProperties", "", V1_0, true),
    ep("vkDestroySurfaceKHR", "VK_KHR_surface", API_VERSION_MAX, false),
    ep("vkGetPhysicalDeviceSurfaceCapabilitiesKHR", "VK_KHR_surface", API_VERSION_MAX, false),
    ep("vkGetPhysicalDeviceSurfaceFormatsKHR", "VK_KHR_surface", API_VERSION_MAX, false),
    ep("vkGetPhysicalDeviceSurfacePresentModesKHR", "VK_KHR_surface", API_VERSION_MAX, false),
    ep("vkGetPhysicalDeviceSurfaceSupportKHR", "VK_KHR_surface", API_VERSION_MAX, false),
    ep("vkCreateHeadlessSurfaceEXT", "VK_EXT_headless_surface", API_VERSION_MAX, false),
    ep("vkCreateWaylandSurfaceKHR", "VK_KHR_wayland_surface", API_VERSION_MAX, false),
    ep(
        "vkGetPhysicalDeviceWaylandPresentationSupportKHR",
        "VK_KHR_wayland_surface",
        API_VERSION_MAX,
        false,
    ),
    ep("vkCreateXcbSurfaceKHR", "VK_KHR_xcb_surface", API_VERSION_MAX, false),
    ep(
        "vkGetPhysicalDeviceXcbPresentationSupportKHR",
        "VK_KHR_xcb_surface",
        API_VERSION_MAX,
        false,
    ),
    ep("vkCreateXlibSurfaceKHR", "VK_KHR_xlib_surface", API_VERSION_MAX, false),
    ep(
        "vkGetPhysicalDeviceXlibPresentationSupportKHR",
        "VK_KHR_xlib_surface",
        API_VERSION_MAX,
        false,
    ),
    ep("vkCreateDisplayPlaneSurfaceKHR", "VK_KHR_display", API_VERSION_MAX, false),
    ep("vkGetPhysicalDeviceDisplayPropertiesKHR", "VK_KHR_display", API_VERSION_MAX, false),
    ep(
        "vkGetPhysicalDeviceDisplayPlanePropertiesKHR",
        "VK_KHR_display",
        API_VERSION_MAX,
        false,
    ),
    ep("vkGetDisplayPlaneSupportedDisplaysKHR", "VK_KHR_display", API_VERSION_MAX, false),
    ep("vkGetDisplayModePropertiesKHR", "VK_KHR_display", API_VERSION_MAX, false),
    ep("vkCreateDisplayModeKHR", "VK_KHR_display", API_VERSION_MAX, false),
    ep("vkGetDisplayPlaneCapabilitiesKHR", "VK_KHR_display", API_VERSION_MAX, false),
    ep(
        "vkGetPhysicalDeviceSurfaceCapabilities2KHR",
        "VK_KHR_get_surface_capabilities2",
        API_VERSION_MAX,
        false,
    ),
    ep(
        "vkGetPhysicalDeviceSurfaceFormats2KHR",
        "VK_KHR_get_surface_capabilities2",
        API_VERSION_MAX,
        false,
    ),
    ep(
        "vkGetPhysicalDeviceImageFormatProperties2KHR",
        "VK_KHR_get_physical_device_properties2",
        V1_1,
        false,
    ),
    ep(
        "vkGetPhysicalDeviceFormatProperties2KHR",
        "VK_KHR_get_physical_device_properties2",
        V1_1,
        false,
    ),
    ep(
        "vkGetPhysicalDeviceFeatures2KHR",
        "VK_KHR_get_physical_device_properties2",
        V1_1,
        false,
    ),
    ep(
        "vkGetPhysicalDeviceProperties2KHR",
        "VK_KHR_get_physical_device_properties2",
        V1_1,
        false,
    ),
    ep(
        "vkGetPhysicalDeviceQueueFamilyProperties2KHR",
        "VK_KHR_get_physical_device_properties2",
        V1_1,
        false,
    ),
    ep(
        "vkGetPhysicalDeviceMemoryProperties2KHR",
        "VK_KHR_get_physical_device_properties2",
        V1_1,
        false,
    ),
    ep("vkGetPhysicalDevicePresentRectanglesKHR", "VK_KHR_device_group", V1_1, false),
    ep(
        "vkGetPhysicalDeviceExternalFencePropertiesKHR",
        "VK_KHR_external_fence_capabilities",
        V1_1,
        false,
    ),
    ep(
        "vkGetPhysicalDeviceExternalBufferPropertiesKHR",
        "VK_KHR_external_memory_capabilities",
        V1_1,
        false,
    ),
];

/* Entrypoints the layer resolves on the device chain. */
pub const DEVICE_ENTRYPOINTS: &[EntrypointDesc] = &[
    ep("vkGetDeviceProcAddr", "", V1_0, true),
    ep("vkGetDeviceQueue", "", V1_0, true),
    ep("vkQueueSubmit", "", V1_0, true),
    ep("vkQueueWaitIdle", "", V1_0, true),
    ep("vkCreateImage", "", V1_0, true),
    ep("vkDestroyImage", "", V1_0, true),
    ep("vkGetImageMemoryRequirements", "", V1_0, true),
    ep("vkGetImageSubresourceLayout", "", V1_0, true),
    ep("vkBindImageMemory", "", V1_0, true),
    ep("vkAllocateMemory", "", V1_0, true),
    ep("vkFreeMemory", "", V1_0, true),
    ep("vkMapMemory", "", V1_0, true),
    ep("vkUnmapMemory", "", V1_0, true),
    ep("vkCreateFence", "", V1_0, true),
    ep("vkDestroyFence", "", V1_0, true),
    ep("vkResetFences", "", V1_0, true),
    ep("vkWaitForFences", "", V1_0, true),
    ep("vkCreateSemaphore", "", V1_0, true),
    ep("vkDestroySemaphore", "", V1_0, true),
    ep("vkDestroyDevice", "", V1_0, true),
    ep("vkCreateSwapchainKHR", "VK_KHR_swapchain", API_VERSION_MAX, false),
    ep("vkDestroySwapchainKHR", "VK_KHR_swapchain", API_VERSION_MAX, false),
    ep("vkGetSwapchainImagesKHR", "VK_KHR_swapchain", API_VERSION_MAX, false),
    ep("vkAcquireNextImageKHR", "VK_KHR_swapchain", API_VERSION_MAX, false),
    ep("vkQueuePresentKHR", "VK_KHR_swapchain", API_VERSION_MAX, false),
    ep("vkGetSwapchainStatusKHR", "VK_KHR_shared_presentable_image", API_VERSION_MAX, false),
    ep("vkReleaseSwapchainImagesEXT", "VK_EXT_swapchain_maintenance1", API_VERSION_MAX, false),
    ep("vkAcquireNextImage2KHR", "VK_KHR_device_group", V1_1, false),
    ep("vkGetDeviceGroupSurfacePresentModesKHR", "VK_KHR_device_group", V1_1, false),
    ep("vkGetDeviceGroupPresentCapabilitiesKHR", "VK_KHR_device_group", V1_1, false),
    ep("vkGetMemoryFdKHR", "VK_KHR_external_memory_fd", API_VERSION_MAX, false),
    ep("vkGetMemoryFdPropertiesKHR", "VK_KHR_external_memory_fd", API_VERSION_MAX, false),
    ep("vkBindImageMemory2KHR", "VK_KHR_bind_memory2", V1_1, false),
    ep("vkGetFenceFdKHR", "VK_KHR_external_fence_fd", API_VERSION_MAX, false),
    ep("vkImportFenceFdKHR", "VK_KHR_external_fence_fd", API_VERSION_MAX, false),
    ep("vkImportSemaphoreFdKHR", "VK_KHR_external_semaphore_fd", API_VERSION_MAX, false),
    ep("vkGetSemaphoreFdKHR", "VK_KHR_external_semaphore_fd", API_VERSION_MAX, false),
    ep(
        "vkGetImageDrmFormatModifierPropertiesEXT",
        "VK_EXT_image_drm_format_modifier",
        API_VERSION_MAX,
        false,
    ),
];

struct Entrypoint {
    desc: &'static EntrypointDesc,
    fp: vk::PFN_vkVoidFunction,
    user_visible: bool,
}

/// Common half of both dispatch tables: the resolved entrypoints and
/// the visibility gating shared by vkGet*ProcAddr.
pub struct EntrypointTable {
    entrypoints: HashMap<&'static str, Entrypoint>,
}

impl EntrypointTable {
    unsafe fn populate<F>(descs: &'static [EntrypointDesc], mut resolve: F) -> Result<EntrypointTable>
    where
        F: FnMut(*const c_char) -> vk::PFN_vkVoidFunction,
    {
        let mut entrypoints = HashMap::with_capacity(descs.len());
        for desc in descs {
            let cname = CString::new(desc.name).map_err(|_| WsiError::INITIALIZATION_FAILED)?;
            let fp = resolve(cname.as_ptr());
            if fp.is_none() && desc.required {
                log::error!("Required entrypoint {} did not resolve", desc.name);
                return Err(WsiError::INITIALIZATION_FAILED);
            }
            entrypoints.insert(
                desc.name,
                Entrypoint {
                    desc,
                    fp,
                    user_visible: false,
                },
            );
        }
        Ok(EntrypointTable { entrypoints })
    }

    /// Record which extensions the application itself enabled so the
    /// proc-addr gating can tell layer-enabled extensions apart.
    pub fn set_user_enabled_extensions(&mut self, extensions: &HashSet<String>) {
        for entry in self.entrypoints.values_mut() {
            entry.user_visible =
                !entry.desc.ext.is_empty() && extensions.contains(entry.desc.ext);
        }
    }

    /// Look up a typed function pointer by name.
    pub unsafe fn get_fn<F: Copy>(&self, name: &str) -> Option<F> {
        debug_assert_eq!(
            std::mem::size_of::<F>(),
            std::mem::size_of::<unsafe extern "system" fn()>()
        );
        match self.entrypoints.get(name) {
            Some(entry) => entry.fp.map(|fp| std::mem::transmute_copy(&fp)),
            None => None,
        }
    }

    pub fn has_fn(&self, name: &str) -> bool {
        matches!(self.entrypoints.get(name), Some(e) if e.fp.is_some())
    }

    /// Proc-addr gating: an entrypoint is visible when the app enabled
    /// its extension, or when it is core in the app's API version.
    pub fn get_user_enabled_entrypoint(
        &self,
        api_version: u32,
        name: &str,
    ) -> Option<vk::PFN_vkVoidFunction> {
        self.entrypoints
            .get(name)
            .map(|e| {
                if entrypoint_is_visible(e.desc, e.user_visible, api_version) {
                    e.fp
                } else {
                    None
                }
            })
            .filter(|fp| fp.is_some())
    }
}

pub fn entrypoint_is_visible(desc: &EntrypointDesc, user_visible: bool, api_version: u32) -> bool {
    user_visible || desc.core_version <= api_version || desc.core_version == vk::API_VERSION_1_0
}

fn load_closure(
    gipa: vk::PFN_vkGetInstanceProcAddr,
    instance: vk::Instance,
) -> impl Fn(&std::ffi::CStr) -> *const c_void {
    move |name| match unsafe { gipa(instance, name.as_ptr()) } {
        Some(f) => f as *const c_void,
        None => std::ptr::null(),
    }
}

/// Everything we may call on the instance chain below us.
pub struct InstanceDispatchTable {
    pub handle: vk::Instance,
    pub gipa: vk::PFN_vkGetInstanceProcAddr,
    /// Core entrypoints, loaded through the next layer's proc-addr
    pub inst: ash::Instance,
    pub surface_fn: vk::KhrSurfaceFn,
    pub surface_caps2_fn: vk::KhrGetSurfaceCapabilities2Fn,
    pub props2_fn: vk::KhrGetPhysicalDeviceProperties2Fn,
    pub external_fence_caps_fn: vk::KhrExternalFenceCapabilitiesFn,
    pub swapchain_fn: vk::KhrSwapchainFn,
    pub wayland_surface_fn: vk::KhrWaylandSurfaceFn,
    pub xcb_surface_fn: vk::KhrXcbSurfaceFn,
    pub xlib_surface_fn: vk::KhrXlibSurfaceFn,
    pub headless_surface_fn: vk::ExtHeadlessSurfaceFn,
    pub display_fn: vk::KhrDisplayFn,
    pub table: EntrypointTable,
}

impl InstanceDispatchTable {
    pub unsafe fn populate(
        instance: vk::Instance,
        gipa: vk::PFN_vkGetInstanceProcAddr,
    ) -> Result<InstanceDispatchTable> {
        let table = EntrypointTable::populate(INSTANCE_ENTRYPOINTS, |name| gipa(instance, name))?;

        let static_fn = vk::StaticFn {
            get_instance_proc_addr: gipa,
        };
        let inst = ash::Instance::load(&static_fn, instance);
        let load = load_closure(gipa, instance);

        Ok(InstanceDispatchTable {
            handle: instance,
            gipa,
            inst,
            surface_fn: vk::KhrSurfaceFn::load(&load),
            surface_caps2_fn: vk::KhrGetSurfaceCapabilities2Fn::load(&load),
            props2_fn: vk::KhrGetPhysicalDeviceProperties2Fn::load(&load),
            external_fence_caps_fn: vk::KhrExternalFenceCapabilitiesFn::load(&load),
            swapchain_fn: vk::KhrSwapchainFn::load(&load),
            wayland_surface_fn: vk::KhrWaylandSurfaceFn::load(&load),
            xcb_surface_fn: vk::KhrXcbSurfaceFn::load(&load),
            xlib_surface_fn: vk::KhrXlibSurfaceFn::load(&load),
            headless_surface_fn: vk::ExtHeadlessSurfaceFn::load(&load),
            display_fn: vk::KhrDisplayFn::load(&load),
            table,
        })
    }
}

/// Everything we may call on the device chain below us.
pub struct DeviceDispatchTable {
    pub handle: vk::Device,
    pub gdpa: vk::PFN_vkGetDeviceProcAddr,
    /// Core entrypoints, loaded through the next layer's proc-addr
    pub dev: ash::Device,
    pub swapchain_fn: vk::KhrSwapchainFn,
    pub external_memory_fd_fn: vk::KhrExternalMemoryFdFn,
    pub external_fence_fd_fn: vk::KhrExternalFenceFdFn,
    pub external_semaphore_fd_fn: vk::KhrExternalSemaphoreFdFn,
    pub bind_memory2_fn: vk::KhrBindMemory2Fn,
    pub shared_presentable_fn: vk::KhrSharedPresentableImageFn,
    pub table: EntrypointTable,
}

impl DeviceDispatchTable {
    pub unsafe fn populate(
        device: vk::Device,
        instance_fn: &vk::InstanceFnV1_0,
        gdpa: vk::PFN_vkGetDeviceProcAddr,
    ) -> Result<DeviceDispatchTable> {
        let table = EntrypointTable::populate(DEVICE_ENTRYPOINTS, |name| gdpa(device, name))?;

        let dev = ash::Device::load(instance_fn, device);
        let load = move |name: &std::ffi::CStr| match gdpa(device, name.as_ptr()) {
            Some(f) => f as *const c_void,
            None => std::ptr::null(),
        };

        Ok(DeviceDispatchTable {
            handle: device,
            gdpa,
            dev,
            swapchain_fn: vk::KhrSwapchainFn::load(&load),
            external_memory_fd_fn: vk::KhrExternalMemoryFdFn::load(&load),
            external_fence_fd_fn: vk::KhrExternalFenceFdFn::load(&load),
            external_semaphore_fd_fn: vk::KhrExternalSemaphoreFdFn::load(&load),
            bind_memory2_fn: vk::KhrBindMemory2Fn::load(&load),
            shared_presentable_fn: vk::KhrSharedPresentableImageFn::load(&load),
            table,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_entrypoints_always_visible() {
        let desc = ep("vkDestroyInstance", "", V1_0, true);
        assert!(entrypoint_is_visible(&desc, false, vk::API_VERSION_1_0));
    }

    #[test]
    fn extension_entrypoints_gated_on_user_enable() {
        let desc = ep("vkCreateSwapchainKHR", "VK_KHR_swapchain", API_VERSION_MAX, false);
        assert!(!entrypoint_is_visible(&desc, false, vk::API_VERSION_1_3));
        assert!(entrypoint_is_visible(&desc, true, vk::API_VERSION_1_0));
    }

    #[test]
    fn promoted_entrypoints_visible_from_core_version() {
        let desc = ep(
            "vkGetPhysicalDeviceFeatures2KHR",
            "VK_KHR_get_physical_device_properties2",
            V1_1,
            false,
        );
        assert!(!entrypoint_is_visible(&desc, false, vk::API_VERSION_1_0));
        assert!(entrypoint_is_visible(&desc, false, vk::API_VERSION_1_1));
    }
}
