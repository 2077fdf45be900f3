// Wayland presentation backend
//
// Images are dma-bufs wrapped in wl_buffers through the
// zwp_linux_dmabuf_v1 protocol, presented with explicit sync fds so
// the compositor never has to trust implicit fences. All layer side
// event traffic runs on private event queues so the application's
// own dispatching is never disturbed.
pub mod surface;
pub mod swapchain;

pub use surface::WaylandSurface;

use ash::vk;
use wayland_client::{Display, EventQueue};

use crate::layer::private_data::InstanceData;
use crate::Result;
use utils::fdwatch::{FdWatch, WaitStatus};

use super::formats::vk_surface_formats;
use super::surface_properties::{base_surface_capabilities, SurfaceProperties};
use surface::SurfaceShared;
use std::sync::Arc;

/// Dispatch one private queue, waiting at most `timeout_ms` for
/// something to arrive. Returns the number of events dispatched.
pub(crate) fn dispatch_queue(
    display: &Display,
    queue: &mut EventQueue,
    timeout_ms: i32,
) -> std::result::Result<usize, ()> {
    /* Deliver anything already buffered first. */
    let mut dispatched = queue
        .dispatch_pending(&mut (), |_, _, _| {})
        .map_err(|_| ())? as usize;
    if dispatched > 0 {
        return Ok(dispatched);
    }

    display.flush().map_err(|_| ())?;

    let guard = match queue.prepare_read() {
        Some(guard) => guard,
        /* Another thread read events for us in the meantime. */
        None => {
            return queue
                .dispatch_pending(&mut (), |_, _, _| {})
                .map(|n| n as usize)
                .map_err(|_| ());
        }
    };

    let mut watch = FdWatch::new();
    watch.add_fd(display.get_connection_fd());
    match watch.wait_for_events(Some(timeout_ms.max(0) as usize)) {
        WaitStatus::Ready => {
            guard.read_events().map_err(|_| ())?;
        }
        WaitStatus::TimedOut | WaitStatus::Interrupted => {
            drop(guard);
            return Ok(0);
        }
        WaitStatus::Error => {
            drop(guard);
            return Err(());
        }
    }

    dispatched = queue
        .dispatch_pending(&mut (), |_, _, _| {})
        .map_err(|_| ())? as usize;
    Ok(dispatched)
}

pub struct WaylandSurfaceProperties {
    wsp_shared: Option<Arc<SurfaceShared>>,
}

impl WaylandSurfaceProperties {
    pub(crate) fn new(shared: Arc<SurfaceShared>) -> WaylandSurfaceProperties {
        WaylandSurfaceProperties {
            wsp_shared: Some(shared),
        }
    }
}

static PROPERTIES: WaylandSurfaceProperties = WaylandSurfaceProperties { wsp_shared: None };

pub fn surface_properties() -> &'static dyn SurfaceProperties {
    &PROPERTIES
}

const PRESENT_MODES: &[vk::PresentModeKHR] =
    &[vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX];

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

impl SurfaceProperties for WaylandSurfaceProperties {
    fn get_surface_capabilities(
        &self,
        instance_data: &InstanceData,
        physical_device: vk::PhysicalDevice,
    ) -> Result<vk::SurfaceCapabilitiesKHR> {
        let mut caps = base_surface_capabilities(instance_data, physical_device);
        caps.min_image_count = 2;
        caps.supported_composite_alpha =
            vk::CompositeAlphaFlagsKHR::PRE_MULTIPLIED | vk::CompositeAlphaFlagsKHR::INHERIT;
        Ok(caps)
    }

    fn get_surface_formats(
        &self,
        _instance_data: &InstanceData,
        _physical_device: vk::PhysicalDevice,
    ) -> Result<Vec<vk::SurfaceFormatKHR>> {
        match &self.wsp_shared {
            Some(shared) => Ok(vk_surface_formats(shared.formats())),
            None => Ok(Vec::new()),
        }
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
        crate::layer::surface_api::wayland_get_proc_addr(name)
    }

    fn is_surface_extension_enabled(&self, instance_data: &InstanceData) -> bool {
        instance_data.is_instance_extension_enabled("VK_KHR_wayland_surface")
    }
}
