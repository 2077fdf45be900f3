// Platform backends and the machinery shared between them
//
// Each supported window system contributes a surface type, a
// surface-properties implementation and a swapchain backend. This
// module owns the mapping from surface extensions to platforms and
// the factory functions the interception fabric calls.
pub mod display;
pub mod external_memory;
pub mod formats;
pub mod headless;
pub mod surface;
pub mod surface_properties;
pub mod swapchain;
pub mod synchronization;
pub mod wayland;
pub mod wsialloc;
pub mod x11;

use ash::vk;
use std::collections::HashSet;
use std::sync::Arc;

use crate::layer::private_data::InstanceData;
use crate::{Result, WsiError};
use surface_properties::SurfaceProperties;
use utils::log;

bitflags::bitflags! {
    /// The set of WSI platforms enabled on an instance.
    pub struct PlatformSet: u32 {
        const HEADLESS = 0b0001;
        const WAYLAND  = 0b0010;
        const DISPLAY  = 0b0100;
        const X11      = 0b1000;
    }
}

struct WsiExtension {
    name: &'static str,
    platform: PlatformSet,
}

/// Surface extensions the layer implements, and the platform each
/// one selects.
const SUPPORTED_WSI_EXTENSIONS: &[WsiExtension] = &[
    WsiExtension {
        name: "VK_EXT_headless_surface",
        platform: PlatformSet::HEADLESS,
    },
    WsiExtension {
        name: "VK_KHR_wayland_surface",
        platform: PlatformSet::WAYLAND,
    },
    WsiExtension {
        name: "VK_KHR_display",
        platform: PlatformSet::DISPLAY,
    },
    WsiExtension {
        name: "VK_KHR_xcb_surface",
        platform: PlatformSet::X11,
    },
    WsiExtension {
        name: "VK_KHR_xlib_surface",
        platform: PlatformSet::X11,
    },
];

/// Stateless per-platform properties, used before any surface exists
/// (extension requirements and proc-addr lookups).
fn get_platform_properties(platform: PlatformSet) -> Option<&'static dyn SurfaceProperties> {
    match platform {
        PlatformSet::HEADLESS => Some(headless::surface_properties()),
        PlatformSet::WAYLAND => Some(wayland::surface_properties()),
        PlatformSet::DISPLAY => Some(display::surface_properties()),
        PlatformSet::X11 => Some(x11::surface_properties()),
        _ => None,
    }
}

/// The platforms implied by the application's instance extension list.
pub fn find_enabled_layer_platforms(enabled_extensions: &HashSet<String>) -> PlatformSet {
    let mut platforms = PlatformSet::empty();
    for ext in SUPPORTED_WSI_EXTENSIONS {
        if enabled_extensions.contains(ext.name) {
            platforms |= ext.platform;
        }
    }
    platforms
}

/// Instance extensions the layer itself needs for the given platforms.
///
/// The loader does not let layers enumerate instance extensions at
/// this point, so these are added blindly.
pub fn add_instance_extensions_required_by_layer(
    platforms: PlatformSet,
    extensions: &mut HashSet<String>,
) {
    for ext in SUPPORTED_WSI_EXTENSIONS {
        if !platforms.contains(ext.platform) {
            continue;
        }
        if let Some(props) = get_platform_properties(ext.platform) {
            for required in props.get_required_instance_extensions() {
                extensions.insert((*required).to_owned());
            }
        }
    }
}

fn get_available_device_extensions(
    instance_data: &InstanceData,
    physical_device: vk::PhysicalDevice,
) -> Result<HashSet<String>> {
    let props = unsafe {
        instance_data
            .disp
            .inst
            .enumerate_device_extension_properties(physical_device)
            .map_err(WsiError::from)?
    };

    let mut available = HashSet::with_capacity(props.len());
    for prop in &props {
        let name = unsafe { std::ffi::CStr::from_ptr(prop.extension_name.as_ptr()) };
        if let Ok(s) = name.to_str() {
            available.insert(s.to_owned());
        }
    }
    Ok(available)
}

/// Device extensions the layer needs for the given platforms, checked
/// against what the physical device actually offers.
pub fn add_device_extensions_required_by_layer(
    instance_data: &InstanceData,
    physical_device: vk::PhysicalDevice,
    platforms: PlatformSet,
    extensions: &mut HashSet<String>,
) -> Result<()> {
    let available = get_available_device_extensions(instance_data, physical_device)?;

    /* Optional sync extensions, wanted on every platform. */
    const OPTIONAL_EXTENSIONS: &[&str] = &[
        "VK_KHR_external_fence",
        "VK_KHR_external_fence_fd",
        "VK_KHR_external_semaphore",
        "VK_KHR_external_semaphore_fd",
    ];
    for ext in OPTIONAL_EXTENSIONS {
        if available.contains(*ext) {
            extensions.insert((*ext).to_owned());
        }
    }

    for ext in SUPPORTED_WSI_EXTENSIONS {
        if !platforms.contains(ext.platform) {
            continue;
        }
        let props = match get_platform_properties(ext.platform) {
            Some(props) => props,
            None => return Err(WsiError::INITIALIZATION_FAILED),
        };

        for required in props.get_required_device_extensions() {
            /* We advertise this platform unconditionally, so a missing
             * requirement cannot be silently dropped. */
            if !available.contains(*required) {
                log::error!(
                    "Physical device is missing {} required for presentation",
                    required
                );
                return Err(WsiError::INITIALIZATION_FAILED);
            }
            extensions.insert((*required).to_owned());
        }
    }

    Ok(())
}

/// Platform specific entrypoint lookup (surface constructors,
/// presentation-support queries, display enumeration).
pub fn get_proc_addr(
    name: &str,
    instance_data: &InstanceData,
) -> Option<unsafe extern "system" fn()> {
    for ext in SUPPORTED_WSI_EXTENSIONS {
        let props = get_platform_properties(ext.platform)?;
        if let Some(f) = props.get_proc_addr(name) {
            if props.is_surface_extension_enabled(instance_data) {
                return Some(f);
            }
        }
    }
    None
}

/// Properties of the surface attached to the given handle, if the
/// layer owns one.
pub fn get_surface_properties(
    instance_data: &InstanceData,
    vk_surface: vk::SurfaceKHR,
) -> Option<Arc<dyn surface::Surface>> {
    instance_data.get_surface(vk_surface)
}

/// Whether the ICD can compress swapchain images, used to answer the
/// compression-control feature query.
pub fn device_supports_compression_control(
    instance_data: &InstanceData,
    physical_device: vk::PhysicalDevice,
) -> bool {
    match get_available_device_extensions(instance_data, physical_device) {
        Ok(available) => available.contains("VK_EXT_image_compression_control"),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(names: &[&str]) -> HashSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn platforms_follow_surface_extensions() {
        let exts = set(&["VK_KHR_surface", "VK_KHR_wayland_surface"]);
        assert_eq!(find_enabled_layer_platforms(&exts), PlatformSet::WAYLAND);

        let exts = set(&["VK_KHR_surface", "VK_KHR_xcb_surface", "VK_KHR_xlib_surface"]);
        assert_eq!(find_enabled_layer_platforms(&exts), PlatformSet::X11);

        let exts = set(&["VK_KHR_get_physical_device_properties2"]);
        assert!(find_enabled_layer_platforms(&exts).is_empty());
    }

    #[test]
    fn instance_extensions_added_per_platform() {
        let mut exts = set(&["VK_KHR_surface", "VK_KHR_wayland_surface"]);
        add_instance_extensions_required_by_layer(PlatformSet::WAYLAND, &mut exts);
        assert!(exts.contains("VK_KHR_get_physical_device_properties2"));
    }
}
