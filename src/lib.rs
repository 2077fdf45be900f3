// Vulkan WSI layer
//
// This library sits between the application and the driver and
// implements the VK_KHR_swapchain family of extensions on top of
// platform buffer sharing (dma-buf), for window systems the driver
// itself does not need to know about.
//
// The loader dlopens us and negotiates the layer interface through
// the three exported symbols at the bottom of this file. Everything
// else is reached through vkGetInstanceProcAddr/vkGetDeviceProcAddr.
#![allow(clippy::missing_safety_doc)]

extern crate ash;
#[macro_use]
extern crate lazy_static;
extern crate utils;

mod error;
mod helpers;
pub mod layer;
pub mod wsi;

pub use error::{Result, WsiError};

use ash::vk;
use std::os::raw::c_char;

use layer::loader::{VkNegotiateLayerInterface, LAYER_NEGOTIATE_INTERFACE_STRUCT};

/// Entry point handed to the loader during negotiation.
#[no_mangle]
pub unsafe extern "system" fn wsi_layer_vkGetInstanceProcAddr(
    instance: vk::Instance,
    p_name: *const c_char,
) -> vk::PFN_vkVoidFunction {
    layer::get_instance_proc_addr(instance, p_name)
}

/// Entry point handed to the loader during negotiation.
#[no_mangle]
pub unsafe extern "system" fn wsi_layer_vkGetDeviceProcAddr(
    device: vk::Device,
    p_name: *const c_char,
) -> vk::PFN_vkVoidFunction {
    layer::get_device_proc_addr(device, p_name)
}

/// Loader-layer interface negotiation. We only speak version 2.
#[no_mangle]
pub unsafe extern "system" fn wsi_layer_vkNegotiateLoaderLayerInterfaceVersion(
    p_version_struct: *mut VkNegotiateLayerInterface,
) -> vk::Result {
    if p_version_struct.is_null() {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    }
    let version_struct = &mut *p_version_struct;
    if version_struct.s_type != LAYER_NEGOTIATE_INTERFACE_STRUCT
        || version_struct.loader_layer_interface_version < 2
    {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    }

    version_struct.loader_layer_interface_version = 2;
    version_struct.pfn_get_instance_proc_addr = Some(wsi_layer_vkGetInstanceProcAddr);
    version_struct.pfn_get_device_proc_addr = Some(wsi_layer_vkGetDeviceProcAddr);
    version_struct.pfn_get_physical_device_proc_addr = None;

    vk::Result::SUCCESS
}
