// The process-wide DRM display
//
// Direct display presentation drives one connector of one card. The
// card is opened once, on first use: master is acquired, a connected
// connector and a CRTC that can drive it are chosen, and the primary
// plane's format/modifier list is read from the IN_FORMATS blob when
// the driver can take modifiers in AddFB2.
use std::fs::{File, OpenOptions};
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::sync::{Arc, Mutex};

use drm::buffer::{DrmFourcc, DrmModifier, Handle as BufferHandle, PlanarBuffer};
use drm::control::{connector, crtc, framebuffer, property, Device as ControlDevice, Mode};
use drm::Device as DrmDevice;

use crate::wsi::formats::{DrmFormatPair, DRM_FORMAT_MOD_LINEAR};
use utils::log;

pub struct Card(File);

impl AsFd for Card {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

impl DrmDevice for Card {}
impl ControlDevice for Card {}

/// One entry of the IN_FORMATS property blob.
#[repr(C)]
struct FormatModifierBlobHeader {
    version: u32,
    flags: u32,
    count_formats: u32,
    formats_offset: u32,
    count_modifiers: u32,
    modifiers_offset: u32,
}

#[repr(C)]
struct FormatModifierEntry {
    formats: u64,
    offset: u32,
    pad: u32,
    modifier: u64,
}

/// Walk the IN_FORMATS blob of the primary plane. The blob has no
/// alignment guarantees, so every access goes through read_unaligned.
fn formats_from_in_formats_blob(card: &Card, plane: drm::control::plane::Handle) -> Option<Vec<DrmFormatPair>> {
    let plane_props = card.get_properties(plane).ok()?;
    let props_map = plane_props.as_hashmap(card).ok()?;
    let in_formats = props_map.get("IN_FORMATS")?.handle();
    let prop_info = card.get_property(in_formats).ok()?;

    let (handles, raw_values) = plane_props.as_props_and_values();
    let raw_value = raw_values[handles.iter().position(|h| *h == in_formats)?];

    let blob_id = match prop_info.value_type().convert_value(raw_value) {
        property::Value::Blob(blob) => blob,
        _ => return None,
    };
    let data = card.get_property_blob(blob_id).ok()?;
    if data.len() < std::mem::size_of::<FormatModifierBlobHeader>() {
        return None;
    }

    let mut pairs = Vec::new();
    unsafe {
        let header_ptr = data.as_ptr() as *const FormatModifierBlobHeader;
        let header = header_ptr.read_unaligned();

        let formats_ptr =
            data.as_ptr().offset(header.formats_offset as isize) as *const u32;
        let modifiers_ptr =
            data.as_ptr().offset(header.modifiers_offset as isize) as *const FormatModifierEntry;

        for i in 0..header.count_modifiers {
            let entry = modifiers_ptr.offset(i as isize).read_unaligned();
            for bit in 0..64u32 {
                if entry.formats & (1u64 << bit) == 0 {
                    continue;
                }
                let index = u64::from(entry.offset) + u64::from(bit);
                if index >= u64::from(header.count_formats) {
                    continue;
                }
                let fourcc = formats_ptr.offset(index as isize).read_unaligned();
                let pair = DrmFormatPair {
                    fourcc,
                    modifier: entry.modifier,
                };
                if !pairs.contains(&pair) {
                    pairs.push(pair);
                }
            }
        }
    }

    Some(pairs)
}

#[derive(Debug, Copy, Clone)]
pub struct DrmDisplayMode {
    dm_mode: Mode,
    dm_preferred: bool,
}

impl DrmDisplayMode {
    pub fn width(&self) -> u16 {
        self.dm_mode.size().0
    }

    pub fn height(&self) -> u16 {
        self.dm_mode.size().1
    }

    /// Refresh rate in mHz, the unit VK_KHR_display speaks.
    pub fn refresh_rate(&self) -> u32 {
        self.dm_mode.vrefresh() * 1000
    }

    pub fn drm_mode(&self) -> Mode {
        self.dm_mode
    }

    pub fn is_preferred(&self) -> bool {
        self.dm_preferred
    }
}

pub struct DrmDisplay {
    dd_card: Card,
    dd_crtc: crtc::Handle,
    dd_connector: connector::Info,
    dd_modes: Vec<DrmDisplayMode>,
    dd_formats: Vec<DrmFormatPair>,
    dd_supports_fb_modifiers: bool,
    dd_max_width: u32,
    dd_max_height: u32,
}

impl DrmDisplay {
    fn open(path: &str) -> Option<DrmDisplay> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| log::error!("Failed to open DRM device {}: {}", path, e))
            .ok()?;
        let card = Card(file);

        /* Mode setting needs master. */
        if card.acquire_master_lock().is_err() {
            log::error!("Failed to become DRM master on {}", path);
            return None;
        }

        let resources = card
            .resource_handles()
            .map_err(|e| log::error!("Failed to get DRM resources: {}", e))
            .ok()?;

        /* First connected connector with a CRTC an encoder can
         * route to it. */
        let mut chosen: Option<(connector::Info, crtc::Handle)> = None;
        for conn_handle in resources.connectors() {
            let conn = match card.get_connector(*conn_handle, false) {
                Ok(conn) => conn,
                Err(_) => continue,
            };
            if conn.state() != connector::State::Connected {
                continue;
            }
            for enc_handle in conn.encoders() {
                if let Ok(encoder) = card.get_encoder(*enc_handle) {
                    let compatible = resources.filter_crtcs(encoder.possible_crtcs());
                    if let Some(crtc) = compatible.first() {
                        chosen = Some((conn, *crtc));
                        break;
                    }
                }
            }
            if chosen.is_some() {
                break;
            }
        }
        let (conn, crtc) = match chosen {
            Some(pair) => pair,
            None => {
                log::error!("No connected connector with a usable CRTC");
                return None;
            }
        };

        let mut max_width = 0u32;
        let mut max_height = 0u32;
        let modes: Vec<DrmDisplayMode> = conn
            .modes()
            .iter()
            .map(|mode| {
                let (w, h) = mode.size();
                if u32::from(w) * u32::from(h) >= max_width * max_height {
                    max_width = u32::from(w);
                    max_height = u32::from(h);
                }
                DrmDisplayMode {
                    dm_mode: *mode,
                    dm_preferred: mode
                        .mode_type()
                        .contains(drm::control::ModeTypeFlags::PREFERRED),
                }
            })
            .collect();
        if modes.is_empty() {
            log::error!("Connector has no modes");
            return None;
        }

        if card
            .set_client_capability(drm::ClientCapability::UniversalPlanes, true)
            .is_err()
        {
            return None;
        }

        let planes = card.plane_handles().ok()?;
        let mut primary_plane = None;
        for plane_handle in planes.iter() {
            let info = match card.get_plane(*plane_handle) {
                Ok(info) => info,
                Err(_) => continue,
            };
            if !resources.filter_crtcs(info.possible_crtcs()).contains(&crtc) {
                continue;
            }
            let props = match card.get_properties(*plane_handle) {
                Ok(props) => props,
                Err(_) => continue,
            };
            let map = match props.as_hashmap(&card) {
                Ok(map) => map,
                Err(_) => continue,
            };
            if let Some(type_prop) = map.get("type") {
                let (handles, values) = props.as_props_and_values();
                let raw = handles
                    .iter()
                    .position(|h| *h == type_prop.handle())
                    .map(|i| values[i]);
                if raw == Some(u64::from(drm::control::PlaneType::Primary as u32)) {
                    primary_plane = Some(*plane_handle);
                    break;
                }
            }
        }
        let primary_plane = match primary_plane {
            Some(plane) => plane,
            None => {
                log::error!("No primary plane for the chosen CRTC");
                return None;
            }
        };

        let supports_fb_modifiers = matches!(
            card.get_driver_capability(drm::DriverCapability::AddFB2Modifiers),
            Ok(cap) if cap != 0
        );

        let formats = if supports_fb_modifiers {
            formats_from_in_formats_blob(&card, primary_plane)
        } else {
            None
        }
        .unwrap_or_else(|| {
            /* Linear-only fallback from the plane's format array. */
            card.get_plane(primary_plane)
                .map(|info| {
                    info.formats()
                        .iter()
                        .map(|fourcc| DrmFormatPair {
                            fourcc: *fourcc,
                            modifier: DRM_FORMAT_MOD_LINEAR,
                        })
                        .collect()
                })
                .unwrap_or_default()
        });

        Some(DrmDisplay {
            dd_card: card,
            dd_crtc: crtc,
            dd_connector: conn,
            dd_modes: modes,
            dd_formats: formats,
            dd_supports_fb_modifiers: supports_fb_modifiers,
            dd_max_width: max_width,
            dd_max_height: max_height,
        })
    }

    /// The singleton, opened on first call. The device path comes
    /// from WSI_DISPLAY_DRI_DEV, defaulting to /dev/dri/card0.
    pub fn get() -> Option<Arc<DrmDisplay>> {
        struct Cell {
            tried: bool,
            display: Option<Arc<DrmDisplay>>,
        }
        lazy_static! {
            static ref DISPLAY: Mutex<Cell> = Mutex::new(Cell {
                tried: false,
                display: None,
            });
        }

        let mut cell = DISPLAY.lock().unwrap();
        if !cell.tried {
            cell.tried = true;
            let path = std::env::var("WSI_DISPLAY_DRI_DEV")
                .unwrap_or_else(|_| "/dev/dri/card0".to_owned());
            cell.display = DrmDisplay::open(&path).map(Arc::new);
        }
        cell.display.clone()
    }

    pub fn card(&self) -> &Card {
        &self.dd_card
    }

    pub fn drm_fd(&self) -> RawFd {
        self.dd_card.0.as_raw_fd()
    }

    pub fn crtc(&self) -> crtc::Handle {
        self.dd_crtc
    }

    pub fn connector(&self) -> &connector::Info {
        &self.dd_connector
    }

    pub fn modes(&self) -> &[DrmDisplayMode] {
        &self.dd_modes
    }

    pub fn supported_formats(&self) -> &[DrmFormatPair] {
        &self.dd_formats
    }

    pub fn is_format_supported(&self, pair: &DrmFormatPair) -> bool {
        self.dd_formats.contains(pair)
    }

    pub fn supports_fb_modifiers(&self) -> bool {
        self.dd_supports_fb_modifiers
    }

    pub fn max_width(&self) -> u32 {
        self.dd_max_width
    }

    pub fn max_height(&self) -> u32 {
        self.dd_max_height
    }
}

impl Drop for DrmDisplay {
    fn drop(&mut self) {
        let _ = self.dd_card.release_master_lock();
    }
}

/// One presentable buffer expressed the way AddFB2 wants it.
pub struct DisplayFramebuffer {
    pub size: (u32, u32),
    pub format: DrmFourcc,
    pub pitches: [u32; 4],
    pub handles: [Option<BufferHandle>; 4],
    pub offsets: [u32; 4],
    pub modifier: Option<DrmModifier>,
}

impl PlanarBuffer for DisplayFramebuffer {
    fn size(&self) -> (u32, u32) {
        self.size
    }

    fn format(&self) -> DrmFourcc {
        self.format
    }

    fn modifier(&self) -> Option<DrmModifier> {
        self.modifier
    }

    fn pitches(&self) -> [u32; 4] {
        self.pitches
    }

    fn handles(&self) -> [Option<BufferHandle>; 4] {
        self.handles
    }

    fn offsets(&self) -> [u32; 4] {
        self.offsets
    }
}

/// Turn a dma-buf fd into a GEM handle on the display device.
pub fn prime_fd_to_handle(display: &DrmDisplay, fd: RawFd) -> std::io::Result<BufferHandle> {
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    display.dd_card.prime_fd_to_buffer(borrowed)
}

/// Create the KMS framebuffer for one image.
pub fn add_framebuffer(
    display: &DrmDisplay,
    buffer: &DisplayFramebuffer,
) -> std::io::Result<framebuffer::Handle> {
    let flags = if display.supports_fb_modifiers() && buffer.modifier.is_some() {
        drm::control::FbCmd2Flags::MODIFIERS
    } else {
        drm::control::FbCmd2Flags::empty()
    };
    display.dd_card.add_planar_framebuffer(buffer, flags)
}
