// X11 presentation backend (DRI3 + Present)
//
// The fast path exports each image's device memory as a dma-buf and
// turns it into a GEM pixmap with DRI3, presented through the
// Present extension. Servers without DRI3 1.2 / Present 1.2 fall
// back to streaming pixels with PutImage.
pub mod surface;
pub mod swapchain;

pub use surface::X11Surface;

use ash::vk;

use crate::layer::private_data::InstanceData;
use crate::wsi::surface_properties::{base_surface_capabilities, SurfaceProperties};
use crate::Result;

use std::sync::Arc;
use surface::X11SurfaceShared;

pub struct X11SurfaceProperties {
    xsp_shared: Option<Arc<X11SurfaceShared>>,
}

impl X11SurfaceProperties {
    pub(crate) fn new(shared: Arc<X11SurfaceShared>) -> X11SurfaceProperties {
        X11SurfaceProperties {
            xsp_shared: Some(shared),
        }
    }
}

static PROPERTIES: X11SurfaceProperties = X11SurfaceProperties { xsp_shared: None };

pub fn surface_properties() -> &'static dyn SurfaceProperties {
    &PROPERTIES
}

const PRESENT_MODES: &[vk::PresentModeKHR] =
    &[vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX];

const SURFACE_FORMATS: &[vk::Format] = &[
    vk::Format::B8G8R8A8_UNORM,
    vk::Format::B8G8R8A8_SRGB,
    vk::Format::R8G8B8A8_UNORM,
    vk::Format::R8G8B8A8_SRGB,
];

const REQUIRED_DEVICE_EXTENSIONS: &[&str] = &[
    "VK_KHR_external_memory",
    "VK_KHR_external_memory_fd",
    "VK_EXT_external_memory_dma_buf",
];

const REQUIRED_INSTANCE_EXTENSIONS: &[&str] = &[
    "VK_KHR_get_physical_device_properties2",
    "VK_KHR_external_memory_capabilities",
    "VK_KHR_external_fence_capabilities",
];

impl SurfaceProperties for X11SurfaceProperties {
    fn get_surface_capabilities(
        &self,
        instance_data: &InstanceData,
        physical_device: vk::PhysicalDevice,
    ) -> Result<vk::SurfaceCapabilitiesKHR> {
        let mut caps = base_surface_capabilities(instance_data, physical_device);
        caps.min_image_count = 2;

        if let Some(shared) = &self.xsp_shared {
            if let Ok(geometry) = shared.window_geometry() {
                let extent = vk::Extent2D {
                    width: u32::from(geometry.width),
                    height: u32::from(geometry.height),
                };
                caps.current_extent = extent;
            }
        }
        Ok(caps)
    }

    fn get_surface_formats(
        &self,
        _instance_data: &InstanceData,
        _physical_device: vk::PhysicalDevice,
    ) -> Result<Vec<vk::SurfaceFormatKHR>> {
        Ok(SURFACE_FORMATS
            .iter()
            .map(|format| vk::SurfaceFormatKHR {
                format: *format,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            })
            .collect())
    }

    fn get_surface_present_modes(&self) -> &'static [vk::PresentModeKHR] {
        PRESENT_MODES
    }

    fn get_required_device_extensions(&self) -> &'static [&'static str] {
        REQUIRED_DEVICE_EXTENSIONS
    }

    fn get_required_instance_extensions(&self) -> &'static [&'static str] {
        REQUIRED_INSTANCE_EXTENSIONS
    }

    fn get_proc_addr(&self, name: &str) -> Option<unsafe extern "system" fn()> {
        crate::layer::surface_api::x11_get_proc_addr(name)
    }

    fn is_surface_extension_enabled(&self, instance_data: &InstanceData) -> bool {
        instance_data.is_instance_extension_enabled("VK_KHR_xcb_surface")
            || instance_data.is_instance_extension_enabled("VK_KHR_xlib_surface")
    }
}
