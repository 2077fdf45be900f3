// Swapchain entrypoints
//
// A VkSwapchainKHR handle minted here points straight at the layer's
// swapchain object; ownership is tracked per device so calls about
// foreign swapchains (on surfaces we do not handle) forward down
// untouched.
use ash::vk;
use ash::vk::Handle;
use std::os::raw::c_void;

use super::private_data::DeviceData;
use crate::helpers::{find_in_chain, find_in_chain_mut};
use crate::wsi::swapchain::{swapchain_from_handle, Swapchain};
use crate::{wsi, WsiError};
use utils::log;

pub type PfnCreateSwapchainKHR = unsafe extern "system" fn(
    vk::Device,
    *const vk::SwapchainCreateInfoKHR,
    *const vk::AllocationCallbacks,
    *mut vk::SwapchainKHR,
) -> vk::Result;
pub type PfnDestroySwapchainKHR =
    unsafe extern "system" fn(vk::Device, vk::SwapchainKHR, *const vk::AllocationCallbacks);
pub type PfnGetSwapchainImagesKHR =
    unsafe extern "system" fn(vk::Device, vk::SwapchainKHR, *mut u32, *mut vk::Image) -> vk::Result;
pub type PfnAcquireNextImageKHR = unsafe extern "system" fn(
    vk::Device,
    vk::SwapchainKHR,
    u64,
    vk::Semaphore,
    vk::Fence,
    *mut u32,
) -> vk::Result;
pub type PfnAcquireNextImage2KHR = unsafe extern "system" fn(
    vk::Device,
    *const vk::AcquireNextImageInfoKHR,
    *mut u32,
) -> vk::Result;
pub type PfnQueuePresentKHR =
    unsafe extern "system" fn(vk::Queue, *const vk::PresentInfoKHR) -> vk::Result;
pub type PfnGetDeviceGroupPresentCapabilitiesKHR = unsafe extern "system" fn(
    vk::Device,
    *mut vk::DeviceGroupPresentCapabilitiesKHR,
) -> vk::Result;
pub type PfnGetDeviceGroupSurfacePresentModesKHR = unsafe extern "system" fn(
    vk::Device,
    vk::SurfaceKHR,
    *mut vk::DeviceGroupPresentModeFlagsKHR,
) -> vk::Result;
pub type PfnGetPhysicalDevicePresentRectanglesKHR = unsafe extern "system" fn(
    vk::PhysicalDevice,
    vk::SurfaceKHR,
    *mut u32,
    *mut vk::Rect2D,
) -> vk::Result;
pub type PfnCreateImage = unsafe extern "system" fn(
    vk::Device,
    *const vk::ImageCreateInfo,
    *const vk::AllocationCallbacks,
    *mut vk::Image,
) -> vk::Result;
pub type PfnBindImageMemory2 =
    unsafe extern "system" fn(vk::Device, u32, *const vk::BindImageMemoryInfo) -> vk::Result;
pub type PfnGetSwapchainStatusKHR =
    unsafe extern "system" fn(vk::Device, vk::SwapchainKHR) -> vk::Result;
pub type PfnReleaseSwapchainImagesEXT =
    unsafe extern "system" fn(vk::Device, *const ReleaseSwapchainImagesInfoEXT) -> vk::Result;

/* VK_EXT_swapchain_maintenance1 and VK_KHR_maintenance6 structures,
 * declared locally while the bindings lag behind the headers. */

pub const STRUCTURE_TYPE_RELEASE_SWAPCHAIN_IMAGES_INFO_EXT: i32 = 1000275001;
pub const STRUCTURE_TYPE_BIND_MEMORY_STATUS_KHR: i32 = 1000545002;

#[repr(C)]
pub struct ReleaseSwapchainImagesInfoEXT {
    pub s_type: vk::StructureType,
    pub p_next: *const c_void,
    pub swapchain: vk::SwapchainKHR,
    pub image_index_count: u32,
    pub p_image_indices: *const u32,
}

#[repr(C)]
pub struct BindMemoryStatusKHR {
    pub s_type: vk::StructureType,
    pub p_next: *const c_void,
    pub p_result: *mut vk::Result,
}

pub extern "system" fn create_swapchain(
    device: vk::Device,
    p_swapchain_create_info: *const vk::SwapchainCreateInfoKHR,
    p_allocator: *const vk::AllocationCallbacks,
    p_swapchain: *mut vk::SwapchainKHR,
) -> vk::Result {
    let device_data = DeviceData::get(device);
    let create_info = unsafe { &*p_swapchain_create_info };
    let surface = create_info.surface;

    if !device_data.should_layer_create_swapchain(surface) {
        if !device_data.can_icds_create_swapchain(surface) {
            return vk::Result::ERROR_INITIALIZATION_FAILED;
        }
        return unsafe {
            (device_data.disp.swapchain_fn.create_swapchain_khr)(
                device,
                p_swapchain_create_info,
                p_allocator,
                p_swapchain,
            )
        };
    }

    let layer_surface = match device_data.instance.get_surface(surface) {
        Some(layer_surface) => layer_surface,
        None => return vk::Result::ERROR_SURFACE_LOST_KHR,
    };

    let backend = match layer_surface.create_backend(&device_data) {
        Ok(backend) => backend,
        Err(e) => {
            log::error!("Failed to create the swapchain backend: {}", e);
            return e.as_vk();
        }
    };

    let swapchain = match Swapchain::new(device_data.clone(), create_info, backend) {
        Ok(swapchain) => swapchain,
        Err(e) => {
            log::error!("Failed to initialise the swapchain: {}", e);
            return e.as_vk();
        }
    };

    let handle =
        vk::SwapchainKHR::from_raw(Box::into_raw(Box::new(swapchain)) as usize as u64);

    /* The retiring swapchain releases what memory it can right away
     * and is drained by our first present. */
    if create_info.old_swapchain != vk::SwapchainKHR::null() {
        let new = unsafe { swapchain_from_handle(handle) };
        new.adopt_old_swapchain(handle, create_info.old_swapchain);
    }

    if device_data.add_layer_swapchain(handle).is_err() {
        unsafe { drop(Box::from_raw(handle.as_raw() as usize as *mut Swapchain)) };
        return vk::Result::ERROR_OUT_OF_HOST_MEMORY;
    }

    unsafe { *p_swapchain = handle };
    vk::Result::SUCCESS
}

pub extern "system" fn destroy_swapchain(
    device: vk::Device,
    swapchain: vk::SwapchainKHR,
    p_allocator: *const vk::AllocationCallbacks,
) {
    let device_data = DeviceData::get(device);

    if !device_data.layer_owns_swapchain(swapchain) {
        unsafe {
            (device_data.disp.swapchain_fn.destroy_swapchain_khr)(device, swapchain, p_allocator);
        }
        return;
    }

    assert!(swapchain != vk::SwapchainKHR::null());
    device_data.remove_layer_swapchain(swapchain);

    /* Teardown happens as the box drops: drain, stop the worker,
     * unlink and release the images. */
    unsafe { drop(Box::from_raw(swapchain.as_raw() as usize as *mut Swapchain)) };
}

pub extern "system" fn get_swapchain_images(
    device: vk::Device,
    swapchain: vk::SwapchainKHR,
    p_swapchain_image_count: *mut u32,
    p_swapchain_images: *mut vk::Image,
) -> vk::Result {
    let device_data = DeviceData::get(device);

    if !device_data.layer_owns_swapchain(swapchain) {
        return unsafe {
            (device_data.disp.swapchain_fn.get_swapchain_images_khr)(
                device,
                swapchain,
                p_swapchain_image_count,
                p_swapchain_images,
            )
        };
    }

    let sc = unsafe { swapchain_from_handle(swapchain) };
    let images = sc.images();
    unsafe { crate::helpers::fill_vk_array(&images, p_swapchain_image_count, p_swapchain_images) }
}

pub extern "system" fn acquire_next_image(
    device: vk::Device,
    swapchain: vk::SwapchainKHR,
    timeout: u64,
    semaphore: vk::Semaphore,
    fence: vk::Fence,
    p_image_index: *mut u32,
) -> vk::Result {
    let device_data = DeviceData::get(device);

    if !device_data.layer_owns_swapchain(swapchain) {
        return unsafe {
            (device_data.disp.swapchain_fn.acquire_next_image_khr)(
                device,
                swapchain,
                timeout,
                semaphore,
                fence,
                p_image_index,
            )
        };
    }

    debug_assert!(semaphore != vk::Semaphore::null() || fence != vk::Fence::null());

    let sc = unsafe { swapchain_from_handle(swapchain) };
    match sc.acquire_next_image(timeout, semaphore, fence) {
        Ok(index) => {
            unsafe { *p_image_index = index };
            vk::Result::SUCCESS
        }
        Err(e) => e.as_vk(),
    }
}

pub extern "system" fn acquire_next_image2(
    device: vk::Device,
    p_acquire_info: *const vk::AcquireNextImageInfoKHR,
    p_image_index: *mut u32,
) -> vk::Result {
    let device_data = DeviceData::get(device);
    let info = unsafe { &*p_acquire_info };

    if !device_data.layer_owns_swapchain(info.swapchain) {
        return unsafe {
            (device_data.disp.swapchain_fn.acquire_next_image2_khr)(
                device,
                p_acquire_info,
                p_image_index,
            )
        };
    }

    let sc = unsafe { swapchain_from_handle(info.swapchain) };
    match sc.acquire_next_image(info.timeout, info.semaphore, info.fence) {
        Ok(index) => {
            unsafe { *p_image_index = index };
            vk::Result::SUCCESS
        }
        Err(e) => e.as_vk(),
    }
}

/// With several swapchains in one present we cannot hand the same
/// application semaphores to every backend, so one submission routes
/// them into each image's own present semaphore first.
fn submit_wait_request(
    queue: vk::Queue,
    present_info: &vk::PresentInfoKHR,
    device_data: &DeviceData,
) -> crate::Result<()> {
    let swapchains = unsafe {
        std::slice::from_raw_parts(present_info.p_swapchains, present_info.swapchain_count as usize)
    };
    let indices = unsafe {
        std::slice::from_raw_parts(
            present_info.p_image_indices,
            present_info.swapchain_count as usize,
        )
    };

    let signal_semaphores: Vec<vk::Semaphore> = swapchains
        .iter()
        .zip(indices)
        .map(|(swapchain, index)| {
            unsafe { swapchain_from_handle(*swapchain) }.image_present_semaphore(*index)
        })
        .collect();

    let wait_semaphores = unsafe {
        std::slice::from_raw_parts(
            present_info.p_wait_semaphores,
            present_info.wait_semaphore_count as usize,
        )
    };
    let wait_stages =
        vec![vk::PipelineStageFlags::BOTTOM_OF_PIPE; wait_semaphores.len()];

    let submit = vk::SubmitInfo::builder()
        .wait_semaphores(wait_semaphores)
        .wait_dst_stage_mask(&wait_stages)
        .signal_semaphores(&signal_semaphores)
        .build();

    unsafe {
        device_data
            .disp
            .dev
            .queue_submit(queue, &[submit], vk::Fence::null())
            .map_err(WsiError::from)
    }
}

pub extern "system" fn queue_present(
    queue: vk::Queue,
    p_present_info: *const vk::PresentInfoKHR,
) -> vk::Result {
    let device_data = DeviceData::get(queue);
    let present_info = unsafe { &*p_present_info };

    let swapchains = unsafe {
        std::slice::from_raw_parts(present_info.p_swapchains, present_info.swapchain_count as usize)
    };
    if !device_data.layer_owns_all_swapchains(swapchains) {
        return unsafe {
            (device_data.disp.swapchain_fn.queue_present_khr)(queue, p_present_info)
        };
    }

    let indices = unsafe {
        std::slice::from_raw_parts(
            present_info.p_image_indices,
            present_info.swapchain_count as usize,
        )
    };
    let wait_semaphores = unsafe {
        std::slice::from_raw_parts(
            present_info.p_wait_semaphores,
            present_info.wait_semaphore_count as usize,
        )
    };

    /* One swapchain can take the application's semaphores directly. */
    let mut app_semaphores: Option<&[vk::Semaphore]> = Some(wait_semaphores);
    if present_info.swapchain_count > 1 {
        if let Err(e) = submit_wait_request(queue, present_info, &device_data) {
            log::error!("Failed to chain the present wait semaphores: {}", e);
            return e.as_vk();
        }
        app_semaphores = None;
    }

    let mut first_error = vk::Result::SUCCESS;
    for (i, (swapchain, index)) in swapchains.iter().zip(indices).enumerate() {
        let sc = unsafe { swapchain_from_handle(*swapchain) };
        let res = sc.queue_present(queue, app_semaphores, *index);

        if !present_info.p_results.is_null() {
            unsafe { *present_info.p_results.add(i) = res };
        }
        if res != vk::Result::SUCCESS && first_error == vk::Result::SUCCESS {
            first_error = res;
        }
    }

    first_error
}

pub extern "system" fn get_device_group_present_capabilities(
    _device: vk::Device,
    p_capabilities: *mut vk::DeviceGroupPresentCapabilitiesKHR,
) -> vk::Result {
    let capabilities = unsafe { &mut *p_capabilities };
    capabilities.present_mask = [0; vk::MAX_DEVICE_GROUP_SIZE];
    capabilities.present_mask[0] = 1;
    capabilities.modes = vk::DeviceGroupPresentModeFlagsKHR::LOCAL;
    vk::Result::SUCCESS
}

pub extern "system" fn get_device_group_surface_present_modes(
    device: vk::Device,
    surface: vk::SurfaceKHR,
    p_modes: *mut vk::DeviceGroupPresentModeFlagsKHR,
) -> vk::Result {
    let device_data = DeviceData::get(device);

    if !device_data.instance.should_layer_handle_surface(surface) {
        return unsafe {
            (device_data
                .disp
                .swapchain_fn
                .get_device_group_surface_present_modes_khr)(device, surface, p_modes)
        };
    }

    unsafe { *p_modes = vk::DeviceGroupPresentModeFlagsKHR::LOCAL };
    vk::Result::SUCCESS
}

pub extern "system" fn get_physical_device_present_rectangles(
    physical_device: vk::PhysicalDevice,
    surface: vk::SurfaceKHR,
    p_rect_count: *mut u32,
    p_rects: *mut vk::Rect2D,
) -> vk::Result {
    let instance_data = super::private_data::InstanceData::get(physical_device);

    if !instance_data.should_layer_handle_surface(surface) {
        return unsafe {
            (instance_data
                .disp
                .swapchain_fn
                .get_physical_device_present_rectangles_khr)(
                physical_device,
                surface,
                p_rect_count,
                p_rects,
            )
        };
    }

    let layer_surface = match wsi::get_surface_properties(&instance_data, surface) {
        Some(layer_surface) => layer_surface,
        None => return vk::Result::ERROR_SURFACE_LOST_KHR,
    };
    let caps = match layer_surface
        .get_properties()
        .get_surface_capabilities(&instance_data, physical_device)
    {
        Ok(caps) => caps,
        Err(e) => return e.as_vk(),
    };

    let rect = vk::Rect2D {
        offset: vk::Offset2D { x: 0, y: 0 },
        extent: caps.current_extent,
    };
    unsafe { crate::helpers::fill_vk_array(&[rect], p_rect_count, p_rects) }
}

/// Intercept to service VkImageSwapchainCreateInfoKHR: images that
/// alias a swapchain's storage must match its creation parameters.
pub extern "system" fn create_image(
    device: vk::Device,
    p_create_info: *const vk::ImageCreateInfo,
    p_allocator: *const vk::AllocationCallbacks,
    p_image: *mut vk::Image,
) -> vk::Result {
    let device_data = DeviceData::get(device);

    let swapchain_info = unsafe {
        find_in_chain::<vk::ImageSwapchainCreateInfoKHR>(
            (*p_create_info).p_next,
            vk::StructureType::IMAGE_SWAPCHAIN_CREATE_INFO_KHR,
        )
    };

    match swapchain_info {
        Some(info) if device_data.layer_owns_swapchain(info.swapchain) => {
            let sc = unsafe { swapchain_from_handle(info.swapchain) };
            match sc.create_aliased_image() {
                Ok(image) => {
                    unsafe { *p_image = image };
                    vk::Result::SUCCESS
                }
                Err(e) => e.as_vk(),
            }
        }
        _ => unsafe {
            (device_data.disp.dev.fp_v1_0().create_image)(
                device,
                p_create_info,
                p_allocator,
                p_image,
            )
        },
    }
}

/// Intercept to service VkBindImageMemorySwapchainInfoKHR. Every
/// bind is attempted even after a failure so per-bind statuses can
/// be reported when VK_KHR_maintenance6 is enabled.
pub extern "system" fn bind_image_memory2(
    device: vk::Device,
    bind_info_count: u32,
    p_bind_infos: *const vk::BindImageMemoryInfo,
) -> vk::Result {
    let device_data = DeviceData::get(device);
    let bind_infos =
        unsafe { std::slice::from_raw_parts(p_bind_infos, bind_info_count as usize) };
    let maintenance6 = device_data.is_device_extension_enabled("VK_KHR_maintenance6");

    let mut endpoint_result = vk::Result::SUCCESS;
    for bind_info in bind_infos {
        let swapchain_bind = unsafe {
            find_in_chain::<vk::BindImageMemorySwapchainInfoKHR>(
                bind_info.p_next,
                vk::StructureType::BIND_IMAGE_MEMORY_SWAPCHAIN_INFO_KHR,
            )
        };

        let result = match swapchain_bind {
            Some(info)
                if info.swapchain != vk::SwapchainKHR::null()
                    && device_data.layer_owns_swapchain(info.swapchain) =>
            {
                let sc = unsafe { swapchain_from_handle(info.swapchain) };
                match sc.bind_aliased_image(bind_info.image, info.image_index) {
                    Ok(()) => vk::Result::SUCCESS,
                    Err(e) => {
                        log::error!("Failed to bind an image to the swapchain");
                        e.as_vk()
                    }
                }
            }
            _ => unsafe {
                (device_data.disp.bind_memory2_fn.bind_image_memory2_khr)(device, 1, bind_info)
            },
        };

        if maintenance6 {
            let status = unsafe {
                find_in_chain_mut::<BindMemoryStatusKHR>(
                    bind_info.p_next as *mut c_void,
                    vk::StructureType::from_raw(STRUCTURE_TYPE_BIND_MEMORY_STATUS_KHR),
                )
            };
            if let Some(status) = status {
                assert!(!status.p_result.is_null());
                unsafe { *status.p_result = result };
            }
        }

        if result != vk::Result::SUCCESS {
            endpoint_result = result;
        }
    }

    endpoint_result
}

pub extern "system" fn get_swapchain_status(
    device: vk::Device,
    swapchain: vk::SwapchainKHR,
) -> vk::Result {
    let device_data = DeviceData::get(device);

    if !device_data.layer_owns_swapchain(swapchain) {
        return unsafe {
            (device_data
                .disp
                .shared_presentable_fn
                .get_swapchain_status_khr)(device, swapchain)
        };
    }

    unsafe { swapchain_from_handle(swapchain) }.get_swapchain_status()
}

pub extern "system" fn release_swapchain_images(
    device: vk::Device,
    p_release_info: *const ReleaseSwapchainImagesInfoEXT,
) -> vk::Result {
    let device_data = DeviceData::get(device);
    let release_info = unsafe { &*p_release_info };

    if !device_data.layer_owns_swapchain(release_info.swapchain) {
        /* Never ours: nothing sensible to forward to, the extension
         * is implemented by the layer alone. */
        return vk::Result::ERROR_OUT_OF_DATE_KHR;
    }

    let indices = unsafe {
        std::slice::from_raw_parts(
            release_info.p_image_indices,
            release_info.image_index_count as usize,
        )
    };
    unsafe { swapchain_from_handle(release_info.swapchain) }.release_images(indices);
    vk::Result::SUCCESS
}
