// FFI structures of the loader-layer interface
//
// These come from vk_layer.h, which ash does not generate bindings
// for. The loader threads them through the pNext chains of
// vkCreateInstance/vkCreateDevice so each layer can find the next
// link of the dispatch chain.
use ash::vk;
use std::os::raw::{c_char, c_void};

pub const LAYER_NEGOTIATE_INTERFACE_STRUCT: i32 = 1;

pub const VK_LAYER_LINK_INFO: i32 = 0;
pub const VK_LOADER_DATA_CALLBACK: i32 = 1;

pub type PfnSetInstanceLoaderData =
    unsafe extern "system" fn(instance: vk::Instance, object: *mut c_void) -> vk::Result;
pub type PfnSetDeviceLoaderData =
    unsafe extern "system" fn(device: vk::Device, object: *mut c_void) -> vk::Result;
pub type PfnGetPhysicalDeviceProcAddr =
    unsafe extern "system" fn(instance: vk::Instance, p_name: *const c_char) -> vk::PFN_vkVoidFunction;

#[repr(C)]
pub struct VkLayerInstanceLink {
    pub p_next: *mut VkLayerInstanceLink,
    pub pfn_next_get_instance_proc_addr: Option<vk::PFN_vkGetInstanceProcAddr>,
    pub pfn_next_get_physical_device_proc_addr: Option<PfnGetPhysicalDeviceProcAddr>,
}

#[repr(C)]
pub union VkLayerInstanceInfo {
    pub p_layer_info: *mut VkLayerInstanceLink,
    pub pfn_set_instance_loader_data: Option<PfnSetInstanceLoaderData>,
}

#[repr(C)]
pub struct VkLayerInstanceCreateInfo {
    pub s_type: vk::StructureType,
    pub p_next: *const c_void,
    pub function: i32,
    pub u: VkLayerInstanceInfo,
}

#[repr(C)]
pub struct VkLayerDeviceLink {
    pub p_next: *mut VkLayerDeviceLink,
    pub pfn_next_get_instance_proc_addr: Option<vk::PFN_vkGetInstanceProcAddr>,
    pub pfn_next_get_device_proc_addr: Option<vk::PFN_vkGetDeviceProcAddr>,
}

#[repr(C)]
pub union VkLayerDeviceInfo {
    pub p_layer_info: *mut VkLayerDeviceLink,
    pub pfn_set_device_loader_data: Option<PfnSetDeviceLoaderData>,
}

#[repr(C)]
pub struct VkLayerDeviceCreateInfo {
    pub s_type: vk::StructureType,
    pub p_next: *const c_void,
    pub function: i32,
    pub u: VkLayerDeviceInfo,
}

#[repr(C)]
pub struct VkNegotiateLayerInterface {
    pub s_type: i32,
    pub p_next: *mut c_void,
    pub loader_layer_interface_version: u32,
    pub pfn_get_instance_proc_addr: Option<vk::PFN_vkGetInstanceProcAddr>,
    pub pfn_get_device_proc_addr: Option<vk::PFN_vkGetDeviceProcAddr>,
    pub pfn_get_physical_device_proc_addr: Option<PfnGetPhysicalDeviceProcAddr>,
}

/// Walk the create-info chain for the loader struct carrying `function`.
pub unsafe fn get_instance_chain_info(
    create_info: &vk::InstanceCreateInfo,
    function: i32,
) -> Option<&mut VkLayerInstanceCreateInfo> {
    let mut chain = create_info.p_next as *mut VkLayerInstanceCreateInfo;
    while !chain.is_null() {
        let info = &mut *chain;
        if info.s_type == vk::StructureType::LOADER_INSTANCE_CREATE_INFO && info.function == function
        {
            return Some(info);
        }
        chain = info.p_next as *mut VkLayerInstanceCreateInfo;
    }
    None
}

/// Walk the create-info chain for the loader struct carrying `function`.
pub unsafe fn get_device_chain_info(
    create_info: &vk::DeviceCreateInfo,
    function: i32,
) -> Option<&mut VkLayerDeviceCreateInfo> {
    let mut chain = create_info.p_next as *mut VkLayerDeviceCreateInfo;
    while !chain.is_null() {
        let info = &mut *chain;
        if info.s_type == vk::StructureType::LOADER_DEVICE_CREATE_INFO && info.function == function {
            return Some(info);
        }
        chain = info.p_next as *mut VkLayerDeviceCreateInfo;
    }
    None
}
