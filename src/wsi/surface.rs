// The layer's view of a VkSurfaceKHR
//
// One of these is attached to every surface handle the layer is
// responsible for. It answers capability queries through its
// properties object and mints swapchain backends.
use std::sync::Arc;

use super::surface_properties::SurfaceProperties;
use super::swapchain::SwapchainBackend;
use crate::layer::private_data::DeviceData;
use crate::Result;

pub trait Surface: Send + Sync {
    /// The capability implementation bound to this surface.
    fn get_properties(&self) -> &dyn SurfaceProperties;

    /// Create the platform half of a swapchain presenting to this
    /// surface. The scheduling core drives the returned backend.
    fn create_backend(&self, device_data: &Arc<DeviceData>) -> Result<Box<dyn SwapchainBackend>>;
}
