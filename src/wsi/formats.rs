// drm_fourcc <-> VkFormat translation and format/modifier queries
//
// The allocator, the compositor protocols and KMS all speak fourcc
// codes, Vulkan speaks VkFormat. The table below covers the formats
// presentable images are made of.
use ash::vk;

use crate::layer::private_data::DeviceData;
use crate::layer::private_data::InstanceData;
use crate::{Result, WsiError};

use super::swapchain::ImageCreateParams;
use super::wsialloc::{WsiallocFormat, WSIALLOC_FORMAT_NON_DISJOINT};

const fn fourcc_code(a: u8, b: u8, c: u8, d: u8) -> u32 {
    (a as u32) | ((b as u32) << 8) | ((c as u32) << 16) | ((d as u32) << 24)
}

pub const DRM_FORMAT_MOD_LINEAR: u64 = 0;
pub const DRM_FORMAT_MOD_INVALID: u64 = 0x00ff_ffff_ffff_ffff;

pub const DRM_FORMAT_ARGB8888: u32 = fourcc_code(b'A', b'R', b'2', b'4');
pub const DRM_FORMAT_XRGB8888: u32 = fourcc_code(b'X', b'R', b'2', b'4');
pub const DRM_FORMAT_ABGR8888: u32 = fourcc_code(b'A', b'B', b'2', b'4');
pub const DRM_FORMAT_XBGR8888: u32 = fourcc_code(b'X', b'B', b'2', b'4');
pub const DRM_FORMAT_RGB565: u32 = fourcc_code(b'R', b'G', b'1', b'6');
pub const DRM_FORMAT_BGR565: u32 = fourcc_code(b'B', b'G', b'1', b'6');
pub const DRM_FORMAT_ARGB2101010: u32 = fourcc_code(b'A', b'R', b'3', b'0');
pub const DRM_FORMAT_ABGR2101010: u32 = fourcc_code(b'A', b'B', b'3', b'0');
pub const DRM_FORMAT_ABGR16161616F: u32 = fourcc_code(b'A', b'B', b'4', b'H');
pub const DRM_FORMAT_R8: u32 = fourcc_code(b'R', b'8', b' ', b' ');
pub const DRM_FORMAT_GR88: u32 = fourcc_code(b'G', b'R', b'8', b'8');

/// A fourcc together with the layout modifier applied to all planes.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DrmFormatPair {
    pub fourcc: u32,
    pub modifier: u64,
}

pub fn drm_to_vk_format(fourcc: u32) -> vk::Format {
    match fourcc {
        DRM_FORMAT_ARGB8888 => vk::Format::B8G8R8A8_UNORM,
        DRM_FORMAT_XRGB8888 => vk::Format::B8G8R8A8_UNORM,
        DRM_FORMAT_ABGR8888 => vk::Format::R8G8B8A8_UNORM,
        DRM_FORMAT_XBGR8888 => vk::Format::R8G8B8A8_UNORM,
        DRM_FORMAT_RGB565 => vk::Format::R5G6B5_UNORM_PACK16,
        DRM_FORMAT_BGR565 => vk::Format::B5G6R5_UNORM_PACK16,
        DRM_FORMAT_ARGB2101010 => vk::Format::A2R10G10B10_UNORM_PACK32,
        DRM_FORMAT_ABGR2101010 => vk::Format::A2B10G10R10_UNORM_PACK32,
        DRM_FORMAT_ABGR16161616F => vk::Format::R16G16B16A16_SFLOAT,
        DRM_FORMAT_R8 => vk::Format::R8_UNORM,
        DRM_FORMAT_GR88 => vk::Format::R8G8_UNORM,
        _ => vk::Format::UNDEFINED,
    }
}

pub fn drm_to_vk_srgb_format(fourcc: u32) -> vk::Format {
    match fourcc {
        DRM_FORMAT_ARGB8888 | DRM_FORMAT_XRGB8888 => vk::Format::B8G8R8A8_SRGB,
        DRM_FORMAT_ABGR8888 | DRM_FORMAT_XBGR8888 => vk::Format::R8G8B8A8_SRGB,
        _ => vk::Format::UNDEFINED,
    }
}

pub fn vk_to_drm_format(format: vk::Format) -> u32 {
    match format {
        vk::Format::B8G8R8A8_UNORM | vk::Format::B8G8R8A8_SRGB => DRM_FORMAT_ARGB8888,
        vk::Format::R8G8B8A8_UNORM | vk::Format::R8G8B8A8_SRGB => DRM_FORMAT_ABGR8888,
        vk::Format::R5G6B5_UNORM_PACK16 => DRM_FORMAT_RGB565,
        vk::Format::B5G6R5_UNORM_PACK16 => DRM_FORMAT_BGR565,
        vk::Format::A2R10G10B10_UNORM_PACK32 => DRM_FORMAT_ARGB2101010,
        vk::Format::A2B10G10R10_UNORM_PACK32 => DRM_FORMAT_ABGR2101010,
        vk::Format::R16G16B16A16_SFLOAT => DRM_FORMAT_ABGR16161616F,
        vk::Format::R8_UNORM => DRM_FORMAT_R8,
        vk::Format::R8G8_UNORM => DRM_FORMAT_GR88,
        _ => 0,
    }
}

/// Map a set of fourcc/modifier pairs to the VkFormats a surface can
/// advertise, adding the sRGB siblings where they exist.
pub fn vk_surface_formats(pairs: &[DrmFormatPair]) -> Vec<vk::SurfaceFormatKHR> {
    let mut formats: Vec<vk::Format> = Vec::new();
    for pair in pairs {
        for format in [drm_to_vk_format(pair.fourcc), drm_to_vk_srgb_format(pair.fourcc)] {
            if format != vk::Format::UNDEFINED && !formats.contains(&format) {
                formats.push(format);
            }
        }
    }

    formats
        .into_iter()
        .map(|format| vk::SurfaceFormatKHR {
            format,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        })
        .collect()
}

/// The DRM modifiers the physical device supports for a format,
/// using the usual two-call enumeration.
pub fn get_drm_format_properties(
    instance_data: &InstanceData,
    physical_device: vk::PhysicalDevice,
    format: vk::Format,
) -> Vec<vk::DrmFormatModifierPropertiesEXT> {
    unsafe {
        let mut modifier_list = vk::DrmFormatModifierPropertiesListEXT::default();
        let mut props = vk::FormatProperties2::builder()
            .push_next(&mut modifier_list)
            .build();
        (instance_data
            .disp
            .props2_fn
            .get_physical_device_format_properties2_khr)(physical_device, format, &mut props);

        let mut modifiers =
            vec![
                vk::DrmFormatModifierPropertiesEXT::default();
                modifier_list.drm_format_modifier_count as usize
            ];
        modifier_list.p_drm_format_modifier_properties = modifiers.as_mut_ptr();
        (instance_data
            .disp
            .props2_fn
            .get_physical_device_format_properties2_khr)(physical_device, format, &mut props);

        modifiers
    }
}

/// Intersect the device's importable dma-buf format/modifier pairs
/// with what the presentation target supports, producing the
/// candidate list handed to the allocator.
pub fn get_surface_compatible_formats<F>(
    device_data: &DeviceData,
    params: &ImageCreateParams,
    target_supports: F,
) -> Result<Vec<WsiallocFormat>>
where
    F: Fn(&DrmFormatPair) -> bool,
{
    let instance_data = &device_data.instance;
    let fourcc = vk_to_drm_format(params.format);
    if fourcc == 0 {
        return Err(WsiError::FORMAT_NOT_SUPPORTED);
    }

    let mut importable = Vec::new();
    for prop in get_drm_format_properties(instance_data, device_data.physical_device, params.format)
    {
        let pair = DrmFormatPair {
            fourcc,
            modifier: prop.drm_format_modifier,
        };
        if !target_supports(&pair) {
            continue;
        }

        let mut external_props = vk::ExternalImageFormatProperties::default();
        let mut format_props = vk::ImageFormatProperties2::builder()
            .push_next(&mut external_props)
            .build();

        let mut external_info = vk::PhysicalDeviceExternalImageFormatInfo::builder()
            .handle_type(vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT)
            .build();
        let mut modifier_info = vk::PhysicalDeviceImageDrmFormatModifierInfoEXT::builder()
            .drm_format_modifier(prop.drm_format_modifier)
            .sharing_mode(params.sharing_mode)
            .queue_family_indices(&params.queue_family_indices)
            .build();
        modifier_info.p_next = &mut external_info as *mut _ as *mut std::os::raw::c_void;
        let mut image_info = vk::PhysicalDeviceImageFormatInfo2::builder()
            .format(params.format)
            .ty(vk::ImageType::TYPE_2D)
            .tiling(vk::ImageTiling::DRM_FORMAT_MODIFIER_EXT)
            .usage(params.usage)
            .flags(params.flags)
            .build();
        image_info.p_next = &mut modifier_info as *mut _ as *mut std::os::raw::c_void;

        let res = unsafe {
            (instance_data
                .disp
                .props2_fn
                .get_physical_device_image_format_properties2_khr)(
                device_data.physical_device,
                &image_info,
                &mut format_props,
            )
        };
        if res != vk::Result::SUCCESS {
            continue;
        }

        let limits = format_props.image_format_properties;
        if limits.max_extent.width < params.extent.width
            || limits.max_extent.height < params.extent.height
            || limits.max_array_layers < params.array_layers
        {
            continue;
        }

        if external_props
            .external_memory_properties
            .external_memory_features
            .contains(vk::ExternalMemoryFeatureFlags::IMPORTABLE)
        {
            let flags = if prop
                .drm_format_modifier_tiling_features
                .contains(vk::FormatFeatureFlags::DISJOINT)
            {
                0
            } else {
                WSIALLOC_FORMAT_NON_DISJOINT
            };
            importable.push(WsiallocFormat {
                fourcc,
                modifier: prop.drm_format_modifier,
                flags,
            });
        }
    }

    Ok(importable)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fourcc_round_trips_through_vk() {
        for fourcc in [
            DRM_FORMAT_ARGB8888,
            DRM_FORMAT_ABGR8888,
            DRM_FORMAT_RGB565,
            DRM_FORMAT_ARGB2101010,
        ] {
            let vk_format = drm_to_vk_format(fourcc);
            assert_ne!(vk_format, vk::Format::UNDEFINED);
            assert_eq!(vk_to_drm_format(vk_format), fourcc);
        }
    }

    #[test]
    fn srgb_siblings_share_the_fourcc() {
        assert_eq!(
            vk_to_drm_format(vk::Format::B8G8R8A8_SRGB),
            vk_to_drm_format(vk::Format::B8G8R8A8_UNORM)
        );
        assert_eq!(drm_to_vk_srgb_format(DRM_FORMAT_RGB565), vk::Format::UNDEFINED);
    }

    #[test]
    fn surface_formats_deduplicate_x_and_a_variants() {
        let pairs = [
            DrmFormatPair { fourcc: DRM_FORMAT_ARGB8888, modifier: 0 },
            DrmFormatPair { fourcc: DRM_FORMAT_XRGB8888, modifier: 0 },
        ];
        let formats = vk_surface_formats(&pairs);
        assert_eq!(formats.len(), 2);
        assert!(formats.iter().any(|f| f.format == vk::Format::B8G8R8A8_UNORM));
        assert!(formats.iter().any(|f| f.format == vk::Format::B8G8R8A8_SRGB));
    }
}
