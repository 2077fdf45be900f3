// Surface entrypoints
//
// Every vkGetPhysicalDeviceSurface* intercept starts with the same
// question: does the layer own a surface object for this handle? If
// yes the attached properties answer; if not the call is forwarded
// unchanged, because the surface necessarily came from the ICDs (or
// a layer below) which therefore support it.
use ash::vk;
use std::os::raw::c_void;
use std::sync::Arc;

use super::pfn;
use super::private_data::InstanceData;
use crate::helpers::{fill_vk_array, find_in_chain_mut};
use crate::wsi::display::DisplaySurface;
use crate::wsi::headless::HeadlessSurface;
use crate::wsi::surface::Surface;
use crate::wsi::wayland::WaylandSurface;
use crate::wsi::x11::X11Surface;
use utils::log;

pub type PfnGetPhysicalDeviceSurfaceSupportKHR = unsafe extern "system" fn(
    vk::PhysicalDevice,
    u32,
    vk::SurfaceKHR,
    *mut vk::Bool32,
) -> vk::Result;
pub type PfnGetPhysicalDeviceSurfaceCapabilitiesKHR = unsafe extern "system" fn(
    vk::PhysicalDevice,
    vk::SurfaceKHR,
    *mut vk::SurfaceCapabilitiesKHR,
) -> vk::Result;
pub type PfnGetPhysicalDeviceSurfaceCapabilities2KHR = unsafe extern "system" fn(
    vk::PhysicalDevice,
    *const vk::PhysicalDeviceSurfaceInfo2KHR,
    *mut vk::SurfaceCapabilities2KHR,
) -> vk::Result;
pub type PfnGetPhysicalDeviceSurfaceFormatsKHR = unsafe extern "system" fn(
    vk::PhysicalDevice,
    vk::SurfaceKHR,
    *mut u32,
    *mut vk::SurfaceFormatKHR,
) -> vk::Result;
pub type PfnGetPhysicalDeviceSurfaceFormats2KHR = unsafe extern "system" fn(
    vk::PhysicalDevice,
    *const vk::PhysicalDeviceSurfaceInfo2KHR,
    *mut u32,
    *mut vk::SurfaceFormat2KHR,
) -> vk::Result;
pub type PfnGetPhysicalDeviceSurfacePresentModesKHR = unsafe extern "system" fn(
    vk::PhysicalDevice,
    vk::SurfaceKHR,
    *mut u32,
    *mut vk::PresentModeKHR,
) -> vk::Result;
pub type PfnDestroySurfaceKHR =
    unsafe extern "system" fn(vk::Instance, vk::SurfaceKHR, *const vk::AllocationCallbacks);
pub type PfnCreateHeadlessSurfaceEXT = unsafe extern "system" fn(
    vk::Instance,
    *const vk::HeadlessSurfaceCreateInfoEXT,
    *const vk::AllocationCallbacks,
    *mut vk::SurfaceKHR,
) -> vk::Result;
pub type PfnCreateWaylandSurfaceKHR = unsafe extern "system" fn(
    vk::Instance,
    *const vk::WaylandSurfaceCreateInfoKHR,
    *const vk::AllocationCallbacks,
    *mut vk::SurfaceKHR,
) -> vk::Result;
pub type PfnCreateXcbSurfaceKHR = unsafe extern "system" fn(
    vk::Instance,
    *const vk::XcbSurfaceCreateInfoKHR,
    *const vk::AllocationCallbacks,
    *mut vk::SurfaceKHR,
) -> vk::Result;
pub type PfnCreateXlibSurfaceKHR = unsafe extern "system" fn(
    vk::Instance,
    *const vk::XlibSurfaceCreateInfoKHR,
    *const vk::AllocationCallbacks,
    *mut vk::SurfaceKHR,
) -> vk::Result;
pub type PfnCreateDisplayPlaneSurfaceKHR = unsafe extern "system" fn(
    vk::Instance,
    *const vk::DisplaySurfaceCreateInfoKHR,
    *const vk::AllocationCallbacks,
    *mut vk::SurfaceKHR,
) -> vk::Result;
pub type PfnGetPhysicalDeviceWaylandPresentationSupportKHR =
    unsafe extern "system" fn(vk::PhysicalDevice, u32, *mut c_void) -> vk::Bool32;
pub type PfnGetPhysicalDeviceXcbPresentationSupportKHR =
    unsafe extern "system" fn(vk::PhysicalDevice, u32, *mut c_void, u32) -> vk::Bool32;
pub type PfnGetPhysicalDeviceXlibPresentationSupportKHR =
    unsafe extern "system" fn(vk::PhysicalDevice, u32, *mut c_void, u64) -> vk::Bool32;

pub extern "system" fn get_physical_device_surface_support(
    physical_device: vk::PhysicalDevice,
    queue_family_index: u32,
    surface: vk::SurfaceKHR,
    p_supported: *mut vk::Bool32,
) -> vk::Result {
    let instance_data = InstanceData::get(physical_device);
    if instance_data.should_layer_handle_surface(surface) {
        unsafe { *p_supported = vk::TRUE };
        return vk::Result::SUCCESS;
    }

    unsafe {
        (instance_data
            .disp
            .surface_fn
            .get_physical_device_surface_support_khr)(
            physical_device,
            queue_family_index,
            surface,
            p_supported,
        )
    }
}

pub extern "system" fn get_physical_device_surface_capabilities(
    physical_device: vk::PhysicalDevice,
    surface: vk::SurfaceKHR,
    p_surface_capabilities: *mut vk::SurfaceCapabilitiesKHR,
) -> vk::Result {
    let instance_data = InstanceData::get(physical_device);
    if let Some(layer_surface) = instance_data.get_surface(surface) {
        return match layer_surface
            .get_properties()
            .get_surface_capabilities(&instance_data, physical_device)
        {
            Ok(caps) => {
                unsafe { *p_surface_capabilities = caps };
                vk::Result::SUCCESS
            }
            Err(e) => e.as_vk(),
        };
    }

    unsafe {
        (instance_data
            .disp
            .surface_fn
            .get_physical_device_surface_capabilities_khr)(
            physical_device,
            surface,
            p_surface_capabilities,
        )
    }
}

pub extern "system" fn get_physical_device_surface_capabilities2(
    physical_device: vk::PhysicalDevice,
    p_surface_info: *const vk::PhysicalDeviceSurfaceInfo2KHR,
    p_surface_capabilities: *mut vk::SurfaceCapabilities2KHR,
) -> vk::Result {
    let instance_data = InstanceData::get(physical_device);
    let surface = unsafe { (*p_surface_info).surface };

    if let Some(layer_surface) = instance_data.get_surface(surface) {
        let caps = match layer_surface
            .get_properties()
            .get_surface_capabilities(&instance_data, physical_device)
        {
            Ok(caps) => caps,
            Err(e) => return e.as_vk(),
        };
        unsafe {
            (*p_surface_capabilities).surface_capabilities = caps;

            if let Some(shared_present) =
                find_in_chain_mut::<vk::SharedPresentSurfaceCapabilitiesKHR>(
                    (*p_surface_capabilities).p_next,
                    vk::StructureType::SHARED_PRESENT_SURFACE_CAPABILITIES_KHR,
                )
            {
                shared_present.shared_present_supported_usage_flags =
                    vk::ImageUsageFlags::COLOR_ATTACHMENT;
            }
        }
        return vk::Result::SUCCESS;
    }

    unsafe {
        (instance_data
            .disp
            .surface_caps2_fn
            .get_physical_device_surface_capabilities2_khr)(
            physical_device,
            p_surface_info,
            p_surface_capabilities,
        )
    }
}

pub extern "system" fn get_physical_device_surface_formats(
    physical_device: vk::PhysicalDevice,
    surface: vk::SurfaceKHR,
    p_surface_format_count: *mut u32,
    p_surface_formats: *mut vk::SurfaceFormatKHR,
) -> vk::Result {
    let instance_data = InstanceData::get(physical_device);
    if let Some(layer_surface) = instance_data.get_surface(surface) {
        return match layer_surface
            .get_properties()
            .get_surface_formats(&instance_data, physical_device)
        {
            Ok(formats) => unsafe {
                fill_vk_array(&formats, p_surface_format_count, p_surface_formats)
            },
            Err(e) => e.as_vk(),
        };
    }

    unsafe {
        (instance_data
            .disp
            .surface_fn
            .get_physical_device_surface_formats_khr)(
            physical_device,
            surface,
            p_surface_format_count,
            p_surface_formats,
        )
    }
}

pub extern "system" fn get_physical_device_surface_formats2(
    physical_device: vk::PhysicalDevice,
    p_surface_info: *const vk::PhysicalDeviceSurfaceInfo2KHR,
    p_surface_format_count: *mut u32,
    p_surface_formats: *mut vk::SurfaceFormat2KHR,
) -> vk::Result {
    let instance_data = InstanceData::get(physical_device);
    let surface = unsafe { (*p_surface_info).surface };

    if let Some(layer_surface) = instance_data.get_surface(surface) {
        let formats = match layer_surface
            .get_properties()
            .get_surface_formats(&instance_data, physical_device)
        {
            Ok(formats) => formats,
            Err(e) => return e.as_vk(),
        };

        unsafe {
            if p_surface_formats.is_null() {
                *p_surface_format_count = formats.len() as u32;
                return vk::Result::SUCCESS;
            }

            let capacity = *p_surface_format_count as usize;
            let written = std::cmp::min(capacity, formats.len());
            for (i, format) in formats.iter().take(written).enumerate() {
                let out = &mut *p_surface_formats.add(i);
                out.surface_format = *format;

                /* Compression queries get the conservative default. */
                if let Some(compression) = find_in_chain_mut::<vk::ImageCompressionPropertiesEXT>(
                    out.p_next,
                    vk::StructureType::IMAGE_COMPRESSION_PROPERTIES_EXT,
                ) {
                    compression.image_compression_flags = vk::ImageCompressionFlagsEXT::DEFAULT;
                    compression.image_compression_fixed_rate_flags =
                        vk::ImageCompressionFixedRateFlagsEXT::NONE;
                }
            }
            *p_surface_format_count = written as u32;

            if written < formats.len() {
                return vk::Result::INCOMPLETE;
            }
        }
        return vk::Result::SUCCESS;
    }

    unsafe {
        (instance_data
            .disp
            .surface_caps2_fn
            .get_physical_device_surface_formats2_khr)(
            physical_device,
            p_surface_info,
            p_surface_format_count,
            p_surface_formats,
        )
    }
}

pub extern "system" fn get_physical_device_surface_present_modes(
    physical_device: vk::PhysicalDevice,
    surface: vk::SurfaceKHR,
    p_present_mode_count: *mut u32,
    p_present_modes: *mut vk::PresentModeKHR,
) -> vk::Result {
    let instance_data = InstanceData::get(physical_device);
    if let Some(layer_surface) = instance_data.get_surface(surface) {
        let modes = layer_surface.get_properties().get_surface_present_modes();
        return unsafe { fill_vk_array(modes, p_present_mode_count, p_present_modes) };
    }

    unsafe {
        (instance_data
            .disp
            .surface_fn
            .get_physical_device_surface_present_modes_khr)(
            physical_device,
            surface,
            p_present_mode_count,
            p_present_modes,
        )
    }
}

pub extern "system" fn destroy_surface(
    instance: vk::Instance,
    surface: vk::SurfaceKHR,
    p_allocator: *const vk::AllocationCallbacks,
) {
    if surface == vk::SurfaceKHR::null() {
        return;
    }
    let instance_data = InstanceData::get(instance);

    unsafe {
        (instance_data.disp.surface_fn.destroy_surface_khr)(instance, surface, p_allocator);
    }

    instance_data.remove_surface(surface);
}

/// Forward a surface constructor down the chain and attach our own
/// surface object to the returned handle. If we cannot service the
/// surface, the downstream handle is destroyed again.
fn attach_surface(
    instance_data: &InstanceData,
    instance: vk::Instance,
    vk_surface: vk::SurfaceKHR,
    p_allocator: *const vk::AllocationCallbacks,
    surface: crate::Result<Arc<dyn Surface>>,
) -> vk::Result {
    match surface {
        Ok(surface) => match instance_data.add_surface(vk_surface, surface) {
            Ok(()) => vk::Result::SUCCESS,
            Err(e) => {
                unsafe {
                    (instance_data.disp.surface_fn.destroy_surface_khr)(
                        instance, vk_surface, p_allocator,
                    );
                }
                e.as_vk()
            }
        },
        Err(e) => {
            log::error!("Failed to create a layer surface: {}", e);
            unsafe {
                (instance_data.disp.surface_fn.destroy_surface_khr)(
                    instance, vk_surface, p_allocator,
                );
            }
            e.as_vk()
        }
    }
}

pub extern "system" fn create_headless_surface(
    instance: vk::Instance,
    p_create_info: *const vk::HeadlessSurfaceCreateInfoEXT,
    p_allocator: *const vk::AllocationCallbacks,
    p_surface: *mut vk::SurfaceKHR,
) -> vk::Result {
    let instance_data = InstanceData::get(instance);
    let res = unsafe {
        (instance_data.disp.headless_surface_fn.create_headless_surface_ext)(
            instance,
            p_create_info,
            p_allocator,
            p_surface,
        )
    };
    if res != vk::Result::SUCCESS {
        return res;
    }

    let surface: crate::Result<Arc<dyn Surface>> = Ok(Arc::new(HeadlessSurface::new()));
    attach_surface(
        &instance_data,
        instance,
        unsafe { *p_surface },
        p_allocator,
        surface,
    )
}

pub extern "system" fn create_wayland_surface(
    instance: vk::Instance,
    p_create_info: *const vk::WaylandSurfaceCreateInfoKHR,
    p_allocator: *const vk::AllocationCallbacks,
    p_surface: *mut vk::SurfaceKHR,
) -> vk::Result {
    let instance_data = InstanceData::get(instance);
    let res = unsafe {
        (instance_data.disp.wayland_surface_fn.create_wayland_surface_khr)(
            instance,
            p_create_info,
            p_allocator,
            p_surface,
        )
    };
    if res != vk::Result::SUCCESS {
        return res;
    }

    let info = unsafe { &*p_create_info };
    let surface = WaylandSurface::new(info.display as *mut c_void, info.surface as *mut c_void)
        .map(|s| Arc::new(s) as Arc<dyn Surface>);
    attach_surface(
        &instance_data,
        instance,
        unsafe { *p_surface },
        p_allocator,
        surface,
    )
}

pub extern "system" fn create_xcb_surface(
    instance: vk::Instance,
    p_create_info: *const vk::XcbSurfaceCreateInfoKHR,
    p_allocator: *const vk::AllocationCallbacks,
    p_surface: *mut vk::SurfaceKHR,
) -> vk::Result {
    let instance_data = InstanceData::get(instance);
    let res = unsafe {
        (instance_data.disp.xcb_surface_fn.create_xcb_surface_khr)(
            instance,
            p_create_info,
            p_allocator,
            p_surface,
        )
    };
    if res != vk::Result::SUCCESS {
        return res;
    }

    let info = unsafe { &*p_create_info };
    let surface = X11Surface::from_xcb(info.connection as *mut c_void, info.window)
        .map(|s| Arc::new(s) as Arc<dyn Surface>);
    attach_surface(
        &instance_data,
        instance,
        unsafe { *p_surface },
        p_allocator,
        surface,
    )
}

pub extern "system" fn create_xlib_surface(
    instance: vk::Instance,
    p_create_info: *const vk::XlibSurfaceCreateInfoKHR,
    p_allocator: *const vk::AllocationCallbacks,
    p_surface: *mut vk::SurfaceKHR,
) -> vk::Result {
    let instance_data = InstanceData::get(instance);
    let res = unsafe {
        (instance_data.disp.xlib_surface_fn.create_xlib_surface_khr)(
            instance,
            p_create_info,
            p_allocator,
            p_surface,
        )
    };
    if res != vk::Result::SUCCESS {
        return res;
    }

    let info = unsafe { &*p_create_info };
    let surface = X11Surface::from_xlib(info.dpy as *mut c_void, info.window as u32)
        .map(|s| Arc::new(s) as Arc<dyn Surface>);
    attach_surface(
        &instance_data,
        instance,
        unsafe { *p_surface },
        p_allocator,
        surface,
    )
}

pub extern "system" fn create_display_plane_surface(
    instance: vk::Instance,
    p_create_info: *const vk::DisplaySurfaceCreateInfoKHR,
    p_allocator: *const vk::AllocationCallbacks,
    p_surface: *mut vk::SurfaceKHR,
) -> vk::Result {
    let instance_data = InstanceData::get(instance);
    let res = unsafe {
        (instance_data.disp.display_fn.create_display_plane_surface_khr)(
            instance,
            p_create_info,
            p_allocator,
            p_surface,
        )
    };
    if res != vk::Result::SUCCESS {
        return res;
    }

    let info = unsafe { &*p_create_info };
    let surface = DisplaySurface::new(info.display_mode).map(|s| Arc::new(s) as Arc<dyn Surface>);
    attach_surface(
        &instance_data,
        instance,
        unsafe { *p_surface },
        p_allocator,
        surface,
    )
}

pub extern "system" fn get_physical_device_wayland_presentation_support(
    _physical_device: vk::PhysicalDevice,
    _queue_family_index: u32,
    _display: *mut c_void,
) -> vk::Bool32 {
    vk::TRUE
}

pub extern "system" fn get_physical_device_xcb_presentation_support(
    _physical_device: vk::PhysicalDevice,
    _queue_family_index: u32,
    _connection: *mut c_void,
    _visual_id: u32,
) -> vk::Bool32 {
    vk::TRUE
}

pub extern "system" fn get_physical_device_xlib_presentation_support(
    _physical_device: vk::PhysicalDevice,
    _queue_family_index: u32,
    _dpy: *mut c_void,
    _visual_id: u64,
) -> vk::Bool32 {
    vk::TRUE
}

/* Name lookups for the per-platform entrypoints, used both by the
 * platform properties and by vkGetInstanceProcAddr. */

pub fn headless_get_proc_addr(name: &str) -> Option<unsafe extern "system" fn()> {
    match name {
        "vkCreateHeadlessSurfaceEXT" => {
            pfn(create_headless_surface as PfnCreateHeadlessSurfaceEXT)
        }
        _ => None,
    }
}

pub fn wayland_get_proc_addr(name: &str) -> Option<unsafe extern "system" fn()> {
    match name {
        "vkCreateWaylandSurfaceKHR" => pfn(create_wayland_surface as PfnCreateWaylandSurfaceKHR),
        "vkGetPhysicalDeviceWaylandPresentationSupportKHR" => pfn(
            get_physical_device_wayland_presentation_support
                as PfnGetPhysicalDeviceWaylandPresentationSupportKHR,
        ),
        _ => None,
    }
}

pub fn x11_get_proc_addr(name: &str) -> Option<unsafe extern "system" fn()> {
    match name {
        "vkCreateXcbSurfaceKHR" => pfn(create_xcb_surface as PfnCreateXcbSurfaceKHR),
        "vkCreateXlibSurfaceKHR" => pfn(create_xlib_surface as PfnCreateXlibSurfaceKHR),
        "vkGetPhysicalDeviceXcbPresentationSupportKHR" => pfn(
            get_physical_device_xcb_presentation_support
                as PfnGetPhysicalDeviceXcbPresentationSupportKHR,
        ),
        "vkGetPhysicalDeviceXlibPresentationSupportKHR" => pfn(
            get_physical_device_xlib_presentation_support
                as PfnGetPhysicalDeviceXlibPresentationSupportKHR,
        ),
        _ => None,
    }
}

pub fn display_get_proc_addr(name: &str) -> Option<unsafe extern "system" fn()> {
    use crate::wsi::display as dp;
    match name {
        "vkCreateDisplayPlaneSurfaceKHR" => {
            pfn(create_display_plane_surface as PfnCreateDisplayPlaneSurfaceKHR)
        }
        "vkGetPhysicalDeviceDisplayPropertiesKHR" => pfn(
            dp::get_physical_device_display_properties
                as dp::PfnGetPhysicalDeviceDisplayPropertiesKHR,
        ),
        "vkGetPhysicalDeviceDisplayPlanePropertiesKHR" => pfn(
            dp::get_physical_device_display_plane_properties
                as dp::PfnGetPhysicalDeviceDisplayPlanePropertiesKHR,
        ),
        "vkGetDisplayPlaneSupportedDisplaysKHR" => pfn(
            dp::get_display_plane_supported_displays as dp::PfnGetDisplayPlaneSupportedDisplaysKHR,
        ),
        "vkGetDisplayModePropertiesKHR" => {
            pfn(dp::get_display_mode_properties as dp::PfnGetDisplayModePropertiesKHR)
        }
        "vkCreateDisplayModeKHR" => pfn(dp::create_display_mode as dp::PfnCreateDisplayModeKHR),
        "vkGetDisplayPlaneCapabilitiesKHR" => pfn(
            dp::get_display_plane_capabilities as dp::PfnGetDisplayPlaneCapabilitiesKHR,
        ),
        _ => None,
    }
}
