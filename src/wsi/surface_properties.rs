// Surface capability facade
//
// Each platform implements this trait once per surface (or as a
// stateless singleton for the queries that need no surface). The
// interception fabric routes vkGetPhysicalDeviceSurface* calls here
// whenever the layer owns the surface being queried.
use ash::vk;

use crate::layer::private_data::InstanceData;
use crate::Result;

/// Largest image count any backend will admit in its capabilities.
pub const MAX_SWAPCHAIN_IMAGE_COUNT: u32 = 6;

pub trait SurfaceProperties: Send + Sync {
    fn get_surface_capabilities(
        &self,
        instance_data: &InstanceData,
        physical_device: vk::PhysicalDevice,
    ) -> Result<vk::SurfaceCapabilitiesKHR>;

    fn get_surface_formats(
        &self,
        instance_data: &InstanceData,
        physical_device: vk::PhysicalDevice,
    ) -> Result<Vec<vk::SurfaceFormatKHR>>;

    fn get_surface_present_modes(&self) -> &'static [vk::PresentModeKHR];

    fn get_required_device_extensions(&self) -> &'static [&'static str];

    fn get_required_instance_extensions(&self) -> &'static [&'static str];

    /// Platform specific entrypoints (surface constructors and
    /// friends). Stateless, also callable on the singleton.
    fn get_proc_addr(&self, name: &str) -> Option<unsafe extern "system" fn()>;

    /// Whether the extension owning this platform's entrypoints was
    /// enabled on the instance.
    fn is_surface_extension_enabled(&self, instance_data: &InstanceData) -> bool;
}

/// Capability fields every backend shares. Backends patch extents and
/// counts afterwards.
pub fn base_surface_capabilities(
    instance_data: &InstanceData,
    physical_device: vk::PhysicalDevice,
) -> vk::SurfaceCapabilitiesKHR {
    let dev_props = unsafe {
        instance_data
            .disp
            .inst
            .get_physical_device_properties(physical_device)
    };
    let max_dim = dev_props.limits.max_image_dimension2_d;

    vk::SurfaceCapabilitiesKHR::builder()
        .min_image_count(1)
        .max_image_count(MAX_SWAPCHAIN_IMAGE_COUNT)
        .current_extent(vk::Extent2D {
            width: 0xffffffff,
            height: 0xffffffff,
        })
        .min_image_extent(vk::Extent2D { width: 1, height: 1 })
        .max_image_extent(vk::Extent2D {
            width: max_dim,
            height: max_dim,
        })
        .max_image_array_layers(1)
        .supported_transforms(vk::SurfaceTransformFlagsKHR::IDENTITY)
        .current_transform(vk::SurfaceTransformFlagsKHR::IDENTITY)
        .supported_composite_alpha(
            vk::CompositeAlphaFlagsKHR::OPAQUE | vk::CompositeAlphaFlagsKHR::INHERIT,
        )
        .supported_usage_flags(
            vk::ImageUsageFlags::TRANSFER_SRC
                | vk::ImageUsageFlags::TRANSFER_DST
                | vk::ImageUsageFlags::SAMPLED
                | vk::ImageUsageFlags::STORAGE
                | vk::ImageUsageFlags::COLOR_ATTACHMENT
                | vk::ImageUsageFlags::INPUT_ATTACHMENT,
        )
        .build()
}
