// Headless presentation backend
//
// No display anywhere: images are plain device-local allocations and
// presenting one simply hands it straight back. Useful for testing
// the swapchain machinery and for offscreen rendering loops.
use ash::vk;
use std::sync::{Arc, Mutex};

use crate::layer::private_data::{DeviceData, InstanceData};
use crate::{Result, WsiError};

use super::surface::Surface;
use super::surface_properties::{base_surface_capabilities, SurfaceProperties};
use super::swapchain::{ImageCreateParams, SwapchainBackend, SwapchainInner};
use super::synchronization::FenceSync;

pub struct HeadlessSurface;

impl HeadlessSurface {
    pub fn new() -> HeadlessSurface {
        HeadlessSurface
    }
}

impl Surface for HeadlessSurface {
    fn get_properties(&self) -> &dyn SurfaceProperties {
        surface_properties()
    }

    fn create_backend(&self, device_data: &Arc<DeviceData>) -> Result<Box<dyn SwapchainBackend>> {
        Ok(Box::new(HeadlessBackend {
            hb_device_data: device_data.clone(),
            hb_images: Vec::new(),
        }))
    }
}

pub struct HeadlessSurfaceProperties;

static PROPERTIES: HeadlessSurfaceProperties = HeadlessSurfaceProperties;

pub fn surface_properties() -> &'static dyn SurfaceProperties {
    &PROPERTIES
}

const PRESENT_MODES: &[vk::PresentModeKHR] = &[
    vk::PresentModeKHR::FIFO,
    vk::PresentModeKHR::FIFO_RELAXED,
    vk::PresentModeKHR::SHARED_DEMAND_REFRESH,
    vk::PresentModeKHR::SHARED_CONTINUOUS_REFRESH,
];

const SURFACE_FORMATS: &[vk::Format] = &[
    vk::Format::B8G8R8A8_UNORM,
    vk::Format::B8G8R8A8_SRGB,
    vk::Format::R8G8B8A8_UNORM,
    vk::Format::R8G8B8A8_SRGB,
    vk::Format::R5G6B5_UNORM_PACK16,
    vk::Format::A2B10G10R10_UNORM_PACK32,
    vk::Format::R16G16B16A16_SFLOAT,
];

impl SurfaceProperties for HeadlessSurfaceProperties {
    fn get_surface_capabilities(
        &self,
        instance_data: &InstanceData,
        physical_device: vk::PhysicalDevice,
    ) -> Result<vk::SurfaceCapabilitiesKHR> {
        Ok(base_surface_capabilities(instance_data, physical_device))
    }

    fn get_surface_formats(
        &self,
        instance_data: &InstanceData,
        physical_device: vk::PhysicalDevice,
    ) -> Result<Vec<vk::SurfaceFormatKHR>> {
        /* Anything the device can render to is presentable here. */
        let mut formats = Vec::new();
        for format in SURFACE_FORMATS {
            let supported = unsafe {
                instance_data
                    .disp
                    .inst
                    .get_physical_device_image_format_properties(
                        physical_device,
                        *format,
                        vk::ImageType::TYPE_2D,
                        vk::ImageTiling::OPTIMAL,
                        vk::ImageUsageFlags::COLOR_ATTACHMENT,
                        vk::ImageCreateFlags::empty(),
                    )
                    .is_ok()
            };
            if supported {
                formats.push(vk::SurfaceFormatKHR {
                    format: *format,
                    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
                });
            }
        }
        Ok(formats)
    }

    fn get_surface_present_modes(&self) -> &'static [vk::PresentModeKHR] {
        PRESENT_MODES
    }

    fn get_required_device_extensions(&self) -> &'static [&'static str] {
        &[]
    }

    fn get_required_instance_extensions(&self) -> &'static [&'static str] {
        &[]
    }

    fn get_proc_addr(&self, name: &str) -> Option<unsafe extern "system" fn()> {
        crate::layer::surface_api::headless_get_proc_addr(name)
    }

    fn is_surface_extension_enabled(&self, instance_data: &InstanceData) -> bool {
        instance_data.is_instance_extension_enabled("VK_EXT_headless_surface")
    }
}

struct HeadlessImageData {
    memory: vk::DeviceMemory,
    present_fence: FenceSync,
}

pub struct HeadlessBackend {
    hb_device_data: Arc<DeviceData>,
    hb_images: Vec<Mutex<Option<HeadlessImageData>>>,
}

impl HeadlessBackend {
    fn create_image(&self, params: &ImageCreateParams) -> Result<vk::Image> {
        let mut info = params.base_info();

        let mut fixed_rate_flags;
        let mut compression_info;
        if let Some(compression) = &params.compression {
            fixed_rate_flags = compression.fixed_rate_flags.clone();
            compression_info = vk::ImageCompressionControlEXT::builder()
                .flags(compression.flags)
                .fixed_rate_flags(&mut fixed_rate_flags)
                .build();
            info.p_next = &mut compression_info as *mut _ as *mut std::os::raw::c_void;
        }

        unsafe {
            self.hb_device_data
                .disp
                .dev
                .create_image(&info, None)
                .map_err(WsiError::from)
        }
    }
}

impl SwapchainBackend for HeadlessBackend {
    fn init_platform(&mut self, create_info: &vk::SwapchainCreateInfoKHR) -> Result<bool> {
        /* Shared demand refresh presents inline from the present
         * call, everything else goes through the worker. */
        Ok(create_info.present_mode != vk::PresentModeKHR::SHARED_DEMAND_REFRESH)
    }

    fn create_and_bind_swapchain_image(
        &mut self,
        params: &ImageCreateParams,
        index: u32,
    ) -> Result<vk::Image> {
        assert_eq!(self.hb_images.len(), index as usize);
        let dev = &self.hb_device_data.disp.dev;

        let image = self.create_image(params)?;

        let requirements = unsafe { dev.get_image_memory_requirements(image) };
        if requirements.memory_type_bits == 0 {
            unsafe { dev.destroy_image(image, None) };
            return Err(WsiError::OUT_OF_DEVICE_MEMORY);
        }
        let mem_type_index = requirements.memory_type_bits.trailing_zeros();

        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(requirements.size)
            .memory_type_index(mem_type_index);
        let memory = match unsafe { dev.allocate_memory(&alloc_info, None) } {
            Ok(memory) => memory,
            Err(e) => {
                unsafe { dev.destroy_image(image, None) };
                return Err(WsiError::from(e));
            }
        };

        if let Err(e) = unsafe { dev.bind_image_memory(image, memory, 0) } {
            unsafe {
                dev.free_memory(memory, None);
                dev.destroy_image(image, None);
            }
            return Err(WsiError::from(e));
        }

        let present_fence = match FenceSync::new(self.hb_device_data.clone()) {
            Ok(fence) => fence,
            Err(e) => {
                unsafe {
                    dev.free_memory(memory, None);
                    dev.destroy_image(image, None);
                }
                return Err(e);
            }
        };

        self.hb_images.push(Mutex::new(Some(HeadlessImageData {
            memory,
            present_fence,
        })));

        Ok(image)
    }

    fn create_aliased_image(&self, params: &ImageCreateParams) -> Result<vk::Image> {
        self.create_image(params)
    }

    fn bind_aliased_image(&self, image: vk::Image, image_index: u32) -> Result<()> {
        let payload = self.hb_images[image_index as usize].lock().unwrap();
        let data = payload.as_ref().ok_or(WsiError::INITIALIZATION_FAILED)?;
        unsafe {
            self.hb_device_data
                .disp
                .dev
                .bind_image_memory(image, data.memory, 0)
                .map_err(WsiError::from)
        }
    }

    fn present_image(&self, chain: &SwapchainInner, index: u32) {
        /* Nothing consumes the image, it is immediately reusable. */
        chain.unpresent_image(index);
    }

    fn image_set_present_payload(
        &self,
        index: u32,
        queue: vk::Queue,
        wait_semaphores: &[vk::Semaphore],
    ) -> Result<()> {
        let mut payload = self.hb_images[index as usize].lock().unwrap();
        let data = payload.as_mut().ok_or(WsiError::INITIALIZATION_FAILED)?;
        data.present_fence.set_payload(queue, wait_semaphores)
    }

    fn image_wait_present(&self, index: u32, timeout: u64) -> vk::Result {
        let mut payload = self.hb_images[index as usize].lock().unwrap();
        match payload.as_mut() {
            Some(data) => data.present_fence.wait_payload(timeout),
            None => vk::Result::SUCCESS,
        }
    }

    fn destroy_image(&self, index: u32) {
        let slot = match self.hb_images.get(index as usize) {
            Some(slot) => slot,
            None => return,
        };
        let data = slot.lock().unwrap().take();
        if let Some(data) = data {
            unsafe {
                self.hb_device_data.disp.dev.free_memory(data.memory, None);
            }
            /* The fence waits for its payload as it drops. */
        }
    }
}
