// Direct display presentation (VK_KHR_display over KMS)
//
// No window server: the layer owns the display controller. The
// VK_KHR_display enumeration is answered from the DRM connector and
// its mode list, and the swapchain page flips the primary plane.
pub mod drm_display;
pub mod swapchain;

use ash::vk;
use ash::vk::Handle;
use std::sync::Arc;

use crate::layer::private_data::{DeviceData, InstanceData};
use crate::wsi::formats::vk_surface_formats;
use crate::wsi::surface::Surface;
use crate::wsi::surface_properties::{base_surface_capabilities, SurfaceProperties};
use crate::wsi::swapchain::SwapchainBackend;
use crate::{Result, WsiError};

use drm_display::{DrmDisplay, DrmDisplayMode};
use swapchain::DisplayBackend;

/// The one display the layer exposes through VK_KHR_display.
const DISPLAY_HANDLE: u64 = 1;

fn display_handle() -> vk::DisplayKHR {
    vk::DisplayKHR::from_raw(DISPLAY_HANDLE)
}

/// Display mode handles encode the index into the connector's mode
/// list, offset so index zero is not a null handle.
fn mode_handle(index: usize) -> vk::DisplayModeKHR {
    vk::DisplayModeKHR::from_raw(index as u64 + 1)
}

fn mode_index(handle: vk::DisplayModeKHR) -> Option<usize> {
    let raw = handle.as_raw();
    if raw == 0 {
        return None;
    }
    Some(raw as usize - 1)
}

pub struct DisplaySurface {
    ds_display: Arc<DrmDisplay>,
    ds_mode_index: usize,
    ds_properties: DisplaySurfaceProperties,
}

impl DisplaySurface {
    pub fn new(display_mode: vk::DisplayModeKHR) -> Result<DisplaySurface> {
        let display = DrmDisplay::get().ok_or(WsiError::INITIALIZATION_FAILED)?;
        let index = mode_index(display_mode).ok_or(WsiError::INITIALIZATION_FAILED)?;
        if index >= display.modes().len() {
            return Err(WsiError::INITIALIZATION_FAILED);
        }

        Ok(DisplaySurface {
            ds_properties: DisplaySurfaceProperties {
                dsp_display: Some((display.clone(), index)),
            },
            ds_display: display,
            ds_mode_index: index,
        })
    }

    pub fn mode(&self) -> DrmDisplayMode {
        self.ds_display.modes()[self.ds_mode_index]
    }
}

impl Surface for DisplaySurface {
    fn get_properties(&self) -> &dyn SurfaceProperties {
        &self.ds_properties
    }

    fn create_backend(&self, device_data: &Arc<DeviceData>) -> Result<Box<dyn SwapchainBackend>> {
        Ok(Box::new(DisplayBackend::new(
            device_data.clone(),
            self.ds_display.clone(),
            self.mode(),
        )))
    }
}

pub struct DisplaySurfaceProperties {
    dsp_display: Option<(Arc<DrmDisplay>, usize)>,
}

static PROPERTIES: DisplaySurfaceProperties = DisplaySurfaceProperties { dsp_display: None };

pub fn surface_properties() -> &'static dyn SurfaceProperties {
    &PROPERTIES
}

const PRESENT_MODES: &[vk::PresentModeKHR] = &[vk::PresentModeKHR::FIFO];

const REQUIRED_DEVICE_EXTENSIONS: &[&str] = &[
    "VK_EXT_image_drm_format_modifier",
    "VK_KHR_bind_memory2",
    "VK_KHR_external_memory",
    "VK_KHR_external_memory_fd",
    "VK_EXT_external_memory_dma_buf",
];

const REQUIRED_INSTANCE_EXTENSIONS: &[&str] = &[
    "VK_KHR_get_physical_device_properties2",
    "VK_KHR_external_memory_capabilities",
    "VK_KHR_external_fence_capabilities",
];

impl SurfaceProperties for DisplaySurfaceProperties {
    fn get_surface_capabilities(
        &self,
        instance_data: &InstanceData,
        physical_device: vk::PhysicalDevice,
    ) -> Result<vk::SurfaceCapabilitiesKHR> {
        let mut caps = base_surface_capabilities(instance_data, physical_device);

        if let Some((display, mode_index)) = &self.dsp_display {
            let mode = display.modes()[*mode_index];
            let extent = vk::Extent2D {
                width: u32::from(mode.width()),
                height: u32::from(mode.height()),
            };
            caps.current_extent = extent;
            caps.min_image_extent = extent;
            caps.max_image_extent = extent;
        }
        caps.min_image_count = 2;
        Ok(caps)
    }

    fn get_surface_formats(
        &self,
        _instance_data: &InstanceData,
        _physical_device: vk::PhysicalDevice,
    ) -> Result<Vec<vk::SurfaceFormatKHR>> {
        let display = match &self.dsp_display {
            Some((display, _)) => display.clone(),
            None => DrmDisplay::get().ok_or(WsiError::SURFACE_LOST)?,
        };
        Ok(vk_surface_formats(display.supported_formats()))
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
        crate::layer::surface_api::display_get_proc_addr(name)
    }

    fn is_surface_extension_enabled(&self, instance_data: &InstanceData) -> bool {
        instance_data.is_instance_extension_enabled("VK_KHR_display")
    }
}

/* VK_KHR_display enumeration, answered entirely from the DRM
 * connector. */

pub type PfnGetPhysicalDeviceDisplayPropertiesKHR = unsafe extern "system" fn(
    vk::PhysicalDevice,
    *mut u32,
    *mut vk::DisplayPropertiesKHR,
) -> vk::Result;
pub type PfnGetPhysicalDeviceDisplayPlanePropertiesKHR = unsafe extern "system" fn(
    vk::PhysicalDevice,
    *mut u32,
    *mut vk::DisplayPlanePropertiesKHR,
) -> vk::Result;
pub type PfnGetDisplayPlaneSupportedDisplaysKHR =
    unsafe extern "system" fn(vk::PhysicalDevice, u32, *mut u32, *mut vk::DisplayKHR) -> vk::Result;
pub type PfnGetDisplayModePropertiesKHR = unsafe extern "system" fn(
    vk::PhysicalDevice,
    vk::DisplayKHR,
    *mut u32,
    *mut vk::DisplayModePropertiesKHR,
) -> vk::Result;
pub type PfnCreateDisplayModeKHR = unsafe extern "system" fn(
    vk::PhysicalDevice,
    vk::DisplayKHR,
    *const vk::DisplayModeCreateInfoKHR,
    *const vk::AllocationCallbacks,
    *mut vk::DisplayModeKHR,
) -> vk::Result;
pub type PfnGetDisplayPlaneCapabilitiesKHR = unsafe extern "system" fn(
    vk::PhysicalDevice,
    vk::DisplayModeKHR,
    u32,
    *mut vk::DisplayPlaneCapabilitiesKHR,
) -> vk::Result;

static DISPLAY_NAME: &[u8] = b"drm-display\0";

pub extern "system" fn get_physical_device_display_properties(
    _physical_device: vk::PhysicalDevice,
    p_property_count: *mut u32,
    p_properties: *mut vk::DisplayPropertiesKHR,
) -> vk::Result {
    let display = match DrmDisplay::get() {
        Some(display) => display,
        None => {
            unsafe { *p_property_count = 0 };
            return vk::Result::SUCCESS;
        }
    };

    let physical_mm = display.connector().size().unwrap_or((0, 0));
    let properties = vk::DisplayPropertiesKHR {
        display: display_handle(),
        display_name: DISPLAY_NAME.as_ptr() as *const std::os::raw::c_char,
        physical_dimensions: vk::Extent2D {
            width: physical_mm.0,
            height: physical_mm.1,
        },
        physical_resolution: vk::Extent2D {
            width: display.max_width(),
            height: display.max_height(),
        },
        supported_transforms: vk::SurfaceTransformFlagsKHR::IDENTITY,
        plane_reorder_possible: vk::FALSE,
        persistent_content: vk::FALSE,
    };

    unsafe { crate::helpers::fill_vk_array(&[properties], p_property_count, p_properties) }
}

pub extern "system" fn get_physical_device_display_plane_properties(
    _physical_device: vk::PhysicalDevice,
    p_property_count: *mut u32,
    p_properties: *mut vk::DisplayPlanePropertiesKHR,
) -> vk::Result {
    if DrmDisplay::get().is_none() {
        unsafe { *p_property_count = 0 };
        return vk::Result::SUCCESS;
    }

    let properties = vk::DisplayPlanePropertiesKHR {
        current_display: display_handle(),
        current_stack_index: 0,
    };
    unsafe { crate::helpers::fill_vk_array(&[properties], p_property_count, p_properties) }
}

pub extern "system" fn get_display_plane_supported_displays(
    _physical_device: vk::PhysicalDevice,
    plane_index: u32,
    p_display_count: *mut u32,
    p_displays: *mut vk::DisplayKHR,
) -> vk::Result {
    if plane_index != 0 || DrmDisplay::get().is_none() {
        unsafe { *p_display_count = 0 };
        return vk::Result::SUCCESS;
    }
    unsafe { crate::helpers::fill_vk_array(&[display_handle()], p_display_count, p_displays) }
}

pub extern "system" fn get_display_mode_properties(
    _physical_device: vk::PhysicalDevice,
    display: vk::DisplayKHR,
    p_property_count: *mut u32,
    p_properties: *mut vk::DisplayModePropertiesKHR,
) -> vk::Result {
    let drm = match DrmDisplay::get() {
        Some(drm) if display == display_handle() => drm,
        _ => {
            unsafe { *p_property_count = 0 };
            return vk::Result::SUCCESS;
        }
    };

    let properties: Vec<vk::DisplayModePropertiesKHR> = drm
        .modes()
        .iter()
        .enumerate()
        .map(|(index, mode)| vk::DisplayModePropertiesKHR {
            display_mode: mode_handle(index),
            parameters: vk::DisplayModeParametersKHR {
                visible_region: vk::Extent2D {
                    width: u32::from(mode.width()),
                    height: u32::from(mode.height()),
                },
                refresh_rate: mode.refresh_rate(),
            },
        })
        .collect();

    unsafe { crate::helpers::fill_vk_array(&properties, p_property_count, p_properties) }
}

pub extern "system" fn create_display_mode(
    _physical_device: vk::PhysicalDevice,
    display: vk::DisplayKHR,
    p_create_info: *const vk::DisplayModeCreateInfoKHR,
    _p_allocator: *const vk::AllocationCallbacks,
    p_mode: *mut vk::DisplayModeKHR,
) -> vk::Result {
    let drm = match DrmDisplay::get() {
        Some(drm) if display == display_handle() => drm,
        _ => return vk::Result::ERROR_INITIALIZATION_FAILED,
    };

    let wanted = unsafe { (*p_create_info).parameters };
    for (index, mode) in drm.modes().iter().enumerate() {
        if u32::from(mode.width()) == wanted.visible_region.width
            && u32::from(mode.height()) == wanted.visible_region.height
            && mode.refresh_rate() == wanted.refresh_rate
        {
            unsafe { *p_mode = mode_handle(index) };
            return vk::Result::SUCCESS;
        }
    }

    vk::Result::ERROR_INITIALIZATION_FAILED
}

pub extern "system" fn get_display_plane_capabilities(
    _physical_device: vk::PhysicalDevice,
    mode: vk::DisplayModeKHR,
    _plane_index: u32,
    p_capabilities: *mut vk::DisplayPlaneCapabilitiesKHR,
) -> vk::Result {
    let drm = match DrmDisplay::get() {
        Some(drm) => drm,
        None => return vk::Result::ERROR_INITIALIZATION_FAILED,
    };
    let index = match mode_index(mode) {
        Some(index) if index < drm.modes().len() => index,
        _ => return vk::Result::ERROR_INITIALIZATION_FAILED,
    };
    let mode = drm.modes()[index];
    let extent = vk::Extent2D {
        width: u32::from(mode.width()),
        height: u32::from(mode.height()),
    };

    unsafe {
        *p_capabilities = vk::DisplayPlaneCapabilitiesKHR {
            supported_alpha: vk::DisplayPlaneAlphaFlagsKHR::OPAQUE,
            min_src_position: vk::Offset2D { x: 0, y: 0 },
            max_src_position: vk::Offset2D { x: 0, y: 0 },
            min_src_extent: extent,
            max_src_extent: extent,
            min_dst_position: vk::Offset2D { x: 0, y: 0 },
            max_dst_position: vk::Offset2D { x: 0, y: 0 },
            min_dst_extent: extent,
            max_dst_extent: extent,
        };
    }
    vk::Result::SUCCESS
}
