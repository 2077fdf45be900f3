// Layer entry and interception fabric
//
// The loader calls us through the proc-addr hooks negotiated at load
// time. vkCreateInstance/vkCreateDevice splice us into the dispatch
// chain: we find the next link in the loader's pNext sub-chain,
// resolve everything we will ever forward through it, and file the
// result in the side-data registry keyed by dispatch pointer.
pub mod dispatch;
pub mod loader;
pub mod private_data;
pub mod surface_api;
pub mod swapchain_api;

use ash::vk;
use std::collections::HashSet;
use std::ffi::{CStr, CString};
use std::os::raw::c_char;

use crate::helpers::find_in_chain;
use crate::wsi;
use dispatch::{DeviceDispatchTable, InstanceDispatchTable};
use loader::{
    get_device_chain_info, get_instance_chain_info, VK_LAYER_LINK_INFO, VK_LOADER_DATA_CALLBACK,
};
use private_data::{DeviceData, InstanceData};
use utils::log;

/* Typed signatures for the entrypoints we intercept or forward by
 * hand. ash only provides aliases for a handful of special PFNs. */
pub type PfnCreateInstance = unsafe extern "system" fn(
    *const vk::InstanceCreateInfo,
    *const vk::AllocationCallbacks,
    *mut vk::Instance,
) -> vk::Result;
pub type PfnDestroyInstance =
    unsafe extern "system" fn(vk::Instance, *const vk::AllocationCallbacks);
pub type PfnCreateDevice = unsafe extern "system" fn(
    vk::PhysicalDevice,
    *const vk::DeviceCreateInfo,
    *const vk::AllocationCallbacks,
    *mut vk::Device,
) -> vk::Result;
pub type PfnDestroyDevice = unsafe extern "system" fn(vk::Device, *const vk::AllocationCallbacks);
pub type PfnGetPhysicalDeviceFeatures2 =
    unsafe extern "system" fn(vk::PhysicalDevice, *mut vk::PhysicalDeviceFeatures2);

pub(crate) fn pfn<F: Copy>(f: F) -> vk::PFN_vkVoidFunction {
    debug_assert_eq!(
        std::mem::size_of::<F>(),
        std::mem::size_of::<unsafe extern "system" fn()>()
    );
    unsafe { Some(std::mem::transmute_copy(&f)) }
}

macro_rules! get_proc {
    ($request:expr, $name:literal, $f:expr) => {
        if $request == $name {
            return pfn($f);
        }
    };
}

unsafe fn extension_list(names: *const *const c_char, count: u32) -> HashSet<String> {
    let mut out = HashSet::with_capacity(count as usize);
    if names.is_null() {
        return out;
    }
    for i in 0..count as usize {
        let name = CStr::from_ptr(*names.add(i));
        if let Ok(s) = name.to_str() {
            out.insert(s.to_owned());
        }
    }
    out
}

/// This is where the layer is initialised and the instance dispatch
/// table is constructed.
pub extern "system" fn create_instance(
    p_create_info: *const vk::InstanceCreateInfo,
    p_allocator: *const vk::AllocationCallbacks,
    p_instance: *mut vk::Instance,
) -> vk::Result {
    unsafe {
        let create_info = match p_create_info.as_ref() {
            Some(info) => info,
            None => return vk::Result::ERROR_INITIALIZATION_FAILED,
        };

        let link_info = match get_instance_chain_info(create_info, VK_LAYER_LINK_INFO) {
            Some(info) if !info.u.p_layer_info.is_null() => info,
            _ => {
                log::error!("Missing loader link info during vkCreateInstance");
                return vk::Result::ERROR_INITIALIZATION_FAILED;
            }
        };
        let loader_data_info = match get_instance_chain_info(create_info, VK_LOADER_DATA_CALLBACK) {
            Some(info) => info,
            None => {
                log::error!("Missing loader data callback during vkCreateInstance");
                return vk::Result::ERROR_INITIALIZATION_FAILED;
            }
        };

        let layer_info = &*link_info.u.p_layer_info;
        let gipa = match layer_info.pfn_next_get_instance_proc_addr {
            Some(f) => f,
            None => return vk::Result::ERROR_INITIALIZATION_FAILED,
        };
        let loader_callback = match loader_data_info.u.pfn_set_instance_loader_data {
            Some(f) => f,
            None => return vk::Result::ERROR_INITIALIZATION_FAILED,
        };

        let create_name = CStr::from_bytes_with_nul_unchecked(b"vkCreateInstance\0");
        let fp_create_instance: PfnCreateInstance =
            match gipa(vk::Instance::null(), create_name.as_ptr()) {
                Some(f) => std::mem::transmute(f),
                None => return vk::Result::ERROR_INITIALIZATION_FAILED,
            };

        let user_extensions = extension_list(
            create_info.pp_enabled_extension_names,
            create_info.enabled_extension_count,
        );

        /* Find the WSI platforms implied by the enabled surface
         * extensions and augment the extension list with whatever
         * those platforms additionally need. */
        let platforms = wsi::find_enabled_layer_platforms(&user_extensions);

        let mut modified_info = *create_info;
        let mut extension_cstrings: Vec<CString> = Vec::new();
        let mut extension_ptrs: Vec<*const c_char> = Vec::new();
        if !platforms.is_empty() {
            if !user_extensions.contains("VK_KHR_surface") {
                return vk::Result::ERROR_EXTENSION_NOT_PRESENT;
            }

            let mut extensions = user_extensions.clone();
            wsi::add_instance_extensions_required_by_layer(platforms, &mut extensions);

            extension_cstrings = extensions
                .iter()
                .filter_map(|s| CString::new(s.as_str()).ok())
                .collect();
            extension_ptrs = extension_cstrings.iter().map(|s| s.as_ptr()).collect();
            modified_info.pp_enabled_extension_names = extension_ptrs.as_ptr();
            modified_info.enabled_extension_count = extension_ptrs.len() as u32;
        }
        /* The CStrings only need to outlive the call below. */
        let _keep_alive = (&extension_cstrings, &extension_ptrs);

        /* Advance the link info for the next element of the chain. */
        link_info.u.p_layer_info = layer_info.p_next;

        let res = fp_create_instance(&modified_info, p_allocator, p_instance);
        if res != vk::Result::SUCCESS {
            log::error!("Next layer's vkCreateInstance failed: {:?}", res);
            return res;
        }
        let instance = *p_instance;

        let mut table = match InstanceDispatchTable::populate(instance, gipa) {
            Ok(table) => table,
            Err(e) => {
                destroy_downstream_instance(gipa, instance, p_allocator);
                return e.as_vk();
            }
        };
        table.table.set_user_enabled_extensions(&user_extensions);

        let api_version = match create_info.p_application_info.as_ref() {
            Some(info) if info.api_version != 0 => info.api_version,
            _ => vk::API_VERSION_1_3,
        };

        InstanceData::associate(
            instance,
            table,
            loader_callback,
            platforms,
            api_version,
            user_extensions,
        );

        vk::Result::SUCCESS
    }
}

unsafe fn destroy_downstream_instance(
    gipa: vk::PFN_vkGetInstanceProcAddr,
    instance: vk::Instance,
    p_allocator: *const vk::AllocationCallbacks,
) {
    let name = CStr::from_bytes_with_nul_unchecked(b"vkDestroyInstance\0");
    if let Some(f) = gipa(instance, name.as_ptr()) {
        let destroy: PfnDestroyInstance = std::mem::transmute(f);
        destroy(instance, p_allocator);
    }
}

pub extern "system" fn destroy_instance(
    instance: vk::Instance,
    p_allocator: *const vk::AllocationCallbacks,
) {
    if instance == vk::Instance::null() {
        return;
    }

    let destroy_fn = {
        let instance_data = InstanceData::get(instance);
        unsafe {
            instance_data
                .disp
                .table
                .get_fn::<PfnDestroyInstance>("vkDestroyInstance")
        }
    };

    /* Disassociate before calling down: another thread's create may
     * reuse the same dispatch pointer immediately after. */
    InstanceData::disassociate(instance);

    if let Some(destroy) = destroy_fn {
        unsafe { destroy(instance, p_allocator) };
    }
}

pub extern "system" fn create_device(
    physical_device: vk::PhysicalDevice,
    p_create_info: *const vk::DeviceCreateInfo,
    p_allocator: *const vk::AllocationCallbacks,
    p_device: *mut vk::Device,
) -> vk::Result {
    unsafe {
        let create_info = match p_create_info.as_ref() {
            Some(info) => info,
            None => return vk::Result::ERROR_INITIALIZATION_FAILED,
        };

        let link_info = match get_device_chain_info(create_info, VK_LAYER_LINK_INFO) {
            Some(info) if !info.u.p_layer_info.is_null() => info,
            _ => {
                log::error!("Missing loader link info during vkCreateDevice");
                return vk::Result::ERROR_INITIALIZATION_FAILED;
            }
        };
        let loader_data_info = match get_device_chain_info(create_info, VK_LOADER_DATA_CALLBACK) {
            Some(info) => info,
            None => {
                log::error!("Missing loader data callback during vkCreateDevice");
                return vk::Result::ERROR_INITIALIZATION_FAILED;
            }
        };

        let layer_info = &*link_info.u.p_layer_info;
        let (gipa, gdpa) = match (
            layer_info.pfn_next_get_instance_proc_addr,
            layer_info.pfn_next_get_device_proc_addr,
        ) {
            (Some(a), Some(b)) => (a, b),
            _ => return vk::Result::ERROR_INITIALIZATION_FAILED,
        };
        let loader_callback = match loader_data_info.u.pfn_set_device_loader_data {
            Some(f) => f,
            None => return vk::Result::ERROR_INITIALIZATION_FAILED,
        };

        let create_name = CStr::from_bytes_with_nul_unchecked(b"vkCreateDevice\0");
        let fp_create_device: PfnCreateDevice = match gipa(vk::Instance::null(), create_name.as_ptr())
        {
            Some(f) => std::mem::transmute(f),
            None => return vk::Result::ERROR_INITIALIZATION_FAILED,
        };

        /* Advance the link info for the next element of the chain. */
        link_info.u.p_layer_info = layer_info.p_next;

        let instance_data = InstanceData::get(physical_device);
        let user_extensions = extension_list(
            create_info.pp_enabled_extension_names,
            create_info.enabled_extension_count,
        );

        let mut modified_info = *create_info;
        let mut enabled_extensions = user_extensions.clone();
        let mut extension_cstrings: Vec<CString> = Vec::new();
        let mut extension_ptrs: Vec<*const c_char> = Vec::new();
        if !instance_data.enabled_platforms.is_empty() {
            if let Err(e) = wsi::add_device_extensions_required_by_layer(
                &instance_data,
                physical_device,
                instance_data.enabled_platforms,
                &mut enabled_extensions,
            ) {
                return e.as_vk();
            }

            extension_cstrings = enabled_extensions
                .iter()
                .filter_map(|s| CString::new(s.as_str()).ok())
                .collect();
            extension_ptrs = extension_cstrings.iter().map(|s| s.as_ptr()).collect();
            modified_info.pp_enabled_extension_names = extension_ptrs.as_ptr();
            modified_info.enabled_extension_count = extension_ptrs.len() as u32;
        }
        let _keep_alive = (&extension_cstrings, &extension_ptrs);

        let res = fp_create_device(physical_device, &modified_info, p_allocator, p_device);
        if res != vk::Result::SUCCESS {
            log::error!("Next layer's vkCreateDevice failed: {:?}", res);
            return res;
        }
        let device = *p_device;

        let mut table =
            match DeviceDispatchTable::populate(device, instance_data.disp.inst.fp_v1_0(), gdpa) {
                Ok(table) => table,
                Err(e) => {
                    destroy_downstream_device(gdpa, device, p_allocator);
                    return e.as_vk();
                }
            };
        table.table.set_user_enabled_extensions(&user_extensions);

        /* Record the compression-control opt-in from the feature chain. */
        let compression_control_enabled = find_in_chain::<
            vk::PhysicalDeviceImageCompressionControlSwapchainFeaturesEXT,
        >(
            create_info.p_next,
            vk::StructureType::PHYSICAL_DEVICE_IMAGE_COMPRESSION_CONTROL_SWAPCHAIN_FEATURES_EXT,
        )
        .map(|f| f.image_compression_control_swapchain == vk::TRUE)
        .unwrap_or(false);

        DeviceData::associate(
            device,
            table,
            instance_data,
            physical_device,
            loader_callback,
            enabled_extensions,
            compression_control_enabled,
        );

        vk::Result::SUCCESS
    }
}

unsafe fn destroy_downstream_device(
    gdpa: vk::PFN_vkGetDeviceProcAddr,
    device: vk::Device,
    p_allocator: *const vk::AllocationCallbacks,
) {
    let name = CStr::from_bytes_with_nul_unchecked(b"vkDestroyDevice\0");
    if let Some(f) = gdpa(device, name.as_ptr()) {
        let destroy: PfnDestroyDevice = std::mem::transmute(f);
        destroy(device, p_allocator);
    }
}

pub extern "system" fn destroy_device(device: vk::Device, p_allocator: *const vk::AllocationCallbacks) {
    if device == vk::Device::null() {
        return;
    }

    let destroy_fn = {
        let device_data = DeviceData::get(device);
        unsafe {
            device_data
                .disp
                .table
                .get_fn::<PfnDestroyDevice>("vkDestroyDevice")
        }
    };

    DeviceData::disassociate(device);

    if let Some(destroy) = destroy_fn {
        unsafe { destroy(device, p_allocator) };
    }
}

/// Forward the feature query and advertise swapchain compression
/// control when the physical device can actually compress.
pub extern "system" fn get_physical_device_features2(
    physical_device: vk::PhysicalDevice,
    p_features: *mut vk::PhysicalDeviceFeatures2,
) {
    let instance_data = InstanceData::get(physical_device);
    unsafe {
        (instance_data
            .disp
            .props2_fn
            .get_physical_device_features2_khr)(physical_device, p_features);

        if let Some(compression) = crate::helpers::find_in_chain_mut::<
            vk::PhysicalDeviceImageCompressionControlSwapchainFeaturesEXT,
        >(
            (*p_features).p_next,
            vk::StructureType::PHYSICAL_DEVICE_IMAGE_COMPRESSION_CONTROL_SWAPCHAIN_FEATURES_EXT,
        ) {
            let supported = wsi::device_supports_compression_control(&instance_data, physical_device);
            compression.image_compression_control_swapchain = supported as vk::Bool32;
        }
    }
}

/// The layer's vkGetInstanceProcAddr.
pub unsafe fn get_instance_proc_addr(
    instance: vk::Instance,
    p_name: *const c_char,
) -> vk::PFN_vkVoidFunction {
    if p_name.is_null() {
        return None;
    }
    let name = match CStr::from_ptr(p_name).to_str() {
        Ok(name) => name,
        Err(_) => return None,
    };

    get_proc!(name, "vkGetInstanceProcAddr", crate::wsi_layer_vkGetInstanceProcAddr
        as unsafe extern "system" fn(vk::Instance, *const c_char) -> vk::PFN_vkVoidFunction);
    get_proc!(name, "vkGetDeviceProcAddr", crate::wsi_layer_vkGetDeviceProcAddr
        as unsafe extern "system" fn(vk::Device, *const c_char) -> vk::PFN_vkVoidFunction);
    get_proc!(name, "vkCreateInstance", create_instance as PfnCreateInstance);
    get_proc!(name, "vkDestroyInstance", destroy_instance as PfnDestroyInstance);
    get_proc!(name, "vkCreateDevice", create_device as PfnCreateDevice);
    get_proc!(
        name,
        "vkGetPhysicalDevicePresentRectanglesKHR",
        swapchain_api::get_physical_device_present_rectangles
            as swapchain_api::PfnGetPhysicalDevicePresentRectanglesKHR
    );
    if name == "vkGetPhysicalDeviceFeatures2" {
        return pfn(get_physical_device_features2 as PfnGetPhysicalDeviceFeatures2);
    }

    if instance == vk::Instance::null() {
        return None;
    }
    let instance_data = match InstanceData::try_get(instance) {
        Some(data) => data,
        None => return None,
    };

    if instance_data.is_instance_extension_enabled("VK_KHR_get_physical_device_properties2") {
        get_proc!(
            name,
            "vkGetPhysicalDeviceFeatures2KHR",
            get_physical_device_features2 as PfnGetPhysicalDeviceFeatures2
        );
    }

    if instance_data.is_instance_extension_enabled("VK_KHR_surface") {
        if let Some(f) = wsi::get_proc_addr(name, &instance_data) {
            return Some(f);
        }

        get_proc!(
            name,
            "vkGetPhysicalDeviceSurfaceSupportKHR",
            surface_api::get_physical_device_surface_support
                as surface_api::PfnGetPhysicalDeviceSurfaceSupportKHR
        );
        get_proc!(
            name,
            "vkGetPhysicalDeviceSurfaceCapabilitiesKHR",
            surface_api::get_physical_device_surface_capabilities
                as surface_api::PfnGetPhysicalDeviceSurfaceCapabilitiesKHR
        );
        get_proc!(
            name,
            "vkGetPhysicalDeviceSurfaceFormatsKHR",
            surface_api::get_physical_device_surface_formats
                as surface_api::PfnGetPhysicalDeviceSurfaceFormatsKHR
        );
        get_proc!(
            name,
            "vkGetPhysicalDeviceSurfacePresentModesKHR",
            surface_api::get_physical_device_surface_present_modes
                as surface_api::PfnGetPhysicalDeviceSurfacePresentModesKHR
        );
        get_proc!(
            name,
            "vkDestroySurfaceKHR",
            surface_api::destroy_surface as surface_api::PfnDestroySurfaceKHR
        );

        if instance_data.is_instance_extension_enabled("VK_KHR_get_surface_capabilities2") {
            get_proc!(
                name,
                "vkGetPhysicalDeviceSurfaceCapabilities2KHR",
                surface_api::get_physical_device_surface_capabilities2
                    as surface_api::PfnGetPhysicalDeviceSurfaceCapabilities2KHR
            );
            get_proc!(
                name,
                "vkGetPhysicalDeviceSurfaceFormats2KHR",
                surface_api::get_physical_device_surface_formats2
                    as surface_api::PfnGetPhysicalDeviceSurfaceFormats2KHR
            );
        }
    }

    if instance_data.disp.table.has_fn(name) {
        return instance_data
            .disp
            .table
            .get_user_enabled_entrypoint(instance_data.api_version, name)
            .flatten();
    }

    /* Unknown name: fall through to the next layer. */
    (instance_data.disp.gipa)(instance, p_name)
}

/// The layer's vkGetDeviceProcAddr.
pub unsafe fn get_device_proc_addr(
    device: vk::Device,
    p_name: *const c_char,
) -> vk::PFN_vkVoidFunction {
    if p_name.is_null() {
        return None;
    }
    let name = match CStr::from_ptr(p_name).to_str() {
        Ok(name) => name,
        Err(_) => return None,
    };

    if device == vk::Device::null() {
        return None;
    }
    let device_data = match DeviceData::try_get(device) {
        Some(data) => data,
        None => return None,
    };

    if device_data.is_device_extension_enabled("VK_KHR_swapchain") {
        get_proc!(
            name,
            "vkCreateSwapchainKHR",
            swapchain_api::create_swapchain as swapchain_api::PfnCreateSwapchainKHR
        );
        get_proc!(
            name,
            "vkDestroySwapchainKHR",
            swapchain_api::destroy_swapchain as swapchain_api::PfnDestroySwapchainKHR
        );
        get_proc!(
            name,
            "vkGetSwapchainImagesKHR",
            swapchain_api::get_swapchain_images as swapchain_api::PfnGetSwapchainImagesKHR
        );
        get_proc!(
            name,
            "vkAcquireNextImageKHR",
            swapchain_api::acquire_next_image as swapchain_api::PfnAcquireNextImageKHR
        );
        get_proc!(
            name,
            "vkAcquireNextImage2KHR",
            swapchain_api::acquire_next_image2 as swapchain_api::PfnAcquireNextImage2KHR
        );
        get_proc!(
            name,
            "vkQueuePresentKHR",
            swapchain_api::queue_present as swapchain_api::PfnQueuePresentKHR
        );
        get_proc!(
            name,
            "vkGetDeviceGroupPresentCapabilitiesKHR",
            swapchain_api::get_device_group_present_capabilities
                as swapchain_api::PfnGetDeviceGroupPresentCapabilitiesKHR
        );
        get_proc!(
            name,
            "vkGetDeviceGroupSurfacePresentModesKHR",
            swapchain_api::get_device_group_surface_present_modes
                as swapchain_api::PfnGetDeviceGroupSurfacePresentModesKHR
        );
    }

    if device_data.is_device_extension_enabled("VK_KHR_shared_presentable_image") {
        get_proc!(
            name,
            "vkGetSwapchainStatusKHR",
            swapchain_api::get_swapchain_status as swapchain_api::PfnGetSwapchainStatusKHR
        );
    }

    if device_data.is_device_extension_enabled("VK_EXT_swapchain_maintenance1") {
        get_proc!(
            name,
            "vkReleaseSwapchainImagesEXT",
            swapchain_api::release_swapchain_images as swapchain_api::PfnReleaseSwapchainImagesEXT
        );
    }

    get_proc!(name, "vkDestroyDevice", destroy_device as PfnDestroyDevice);
    get_proc!(
        name,
        "vkCreateImage",
        swapchain_api::create_image as swapchain_api::PfnCreateImage
    );
    get_proc!(
        name,
        "vkBindImageMemory2",
        swapchain_api::bind_image_memory2 as swapchain_api::PfnBindImageMemory2
    );
    get_proc!(
        name,
        "vkBindImageMemory2KHR",
        swapchain_api::bind_image_memory2 as swapchain_api::PfnBindImageMemory2
    );

    if device_data.disp.table.has_fn(name) {
        return device_data
            .disp
            .table
            .get_user_enabled_entrypoint(device_data.instance.api_version, name)
            .flatten();
    }

    (device_data.disp.gdpa)(device, p_name)
}
