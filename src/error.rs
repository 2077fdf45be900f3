// Layer error type
//
// Internally everything flows through Result<T>, and the Vulkan
// entrypoints translate back to a VkResult at the ABI boundary.
use ash::vk;
use thiserror::Error;

#[allow(non_camel_case_types)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Error)]
pub enum WsiError {
    #[error("layer initialization failed")]
    INITIALIZATION_FAILED,
    #[error("out of host memory")]
    OUT_OF_HOST_MEMORY,
    #[error("out of device memory")]
    OUT_OF_DEVICE_MEMORY,
    #[error("the surface was lost")]
    SURFACE_LOST,
    #[error("the swapchain is out of date")]
    OUT_OF_DATE,
    #[error("the surface has become suboptimal for the swapchain")]
    SUBOPTIMAL,
    #[error("timed out")]
    TIMEOUT,
    #[error("not ready")]
    NOT_READY,
    #[error("no supported format found")]
    FORMAT_NOT_SUPPORTED,
    #[error("extension not present")]
    EXTENSION_NOT_PRESENT,
    #[error("the device was lost")]
    DEVICE_LOST,
    #[error("vulkan error {0:?}")]
    VK(vk::Result),
}

pub type Result<T> = std::result::Result<T, WsiError>;

impl WsiError {
    /// The VkResult this error surfaces to the application as.
    pub fn as_vk(&self) -> vk::Result {
        match self {
            WsiError::INITIALIZATION_FAILED => vk::Result::ERROR_INITIALIZATION_FAILED,
            WsiError::OUT_OF_HOST_MEMORY => vk::Result::ERROR_OUT_OF_HOST_MEMORY,
            WsiError::OUT_OF_DEVICE_MEMORY => vk::Result::ERROR_OUT_OF_DEVICE_MEMORY,
            WsiError::SURFACE_LOST => vk::Result::ERROR_SURFACE_LOST_KHR,
            WsiError::OUT_OF_DATE => vk::Result::ERROR_OUT_OF_DATE_KHR,
            WsiError::SUBOPTIMAL => vk::Result::SUBOPTIMAL_KHR,
            WsiError::TIMEOUT => vk::Result::TIMEOUT,
            WsiError::NOT_READY => vk::Result::NOT_READY,
            WsiError::FORMAT_NOT_SUPPORTED => vk::Result::ERROR_FORMAT_NOT_SUPPORTED,
            WsiError::EXTENSION_NOT_PRESENT => vk::Result::ERROR_EXTENSION_NOT_PRESENT,
            WsiError::DEVICE_LOST => vk::Result::ERROR_DEVICE_LOST,
            WsiError::VK(res) => *res,
        }
    }
}

impl From<vk::Result> for WsiError {
    fn from(res: vk::Result) -> WsiError {
        match res {
            vk::Result::ERROR_INITIALIZATION_FAILED => WsiError::INITIALIZATION_FAILED,
            vk::Result::ERROR_OUT_OF_HOST_MEMORY => WsiError::OUT_OF_HOST_MEMORY,
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => WsiError::OUT_OF_DEVICE_MEMORY,
            vk::Result::ERROR_SURFACE_LOST_KHR => WsiError::SURFACE_LOST,
            vk::Result::ERROR_OUT_OF_DATE_KHR => WsiError::OUT_OF_DATE,
            vk::Result::SUBOPTIMAL_KHR => WsiError::SUBOPTIMAL,
            vk::Result::TIMEOUT => WsiError::TIMEOUT,
            vk::Result::NOT_READY => WsiError::NOT_READY,
            vk::Result::ERROR_FORMAT_NOT_SUPPORTED => WsiError::FORMAT_NOT_SUPPORTED,
            vk::Result::ERROR_EXTENSION_NOT_PRESENT => WsiError::EXTENSION_NOT_PRESENT,
            vk::Result::ERROR_DEVICE_LOST => WsiError::DEVICE_LOST,
            other => WsiError::VK(other),
        }
    }
}

/// Turn a raw VkResult into a Result, treating anything that is not
/// VK_SUCCESS as an error.
pub fn vk_try(res: vk::Result) -> Result<()> {
    match res {
        vk::Result::SUCCESS => Ok(()),
        err => Err(WsiError::from(err)),
    }
}

/// Collapse a Result into the VkResult an entrypoint returns.
pub fn vk_complete(res: Result<()>) -> vk::Result {
    match res {
        Ok(()) => vk::Result::SUCCESS,
        Err(e) => e.as_vk(),
    }
}
