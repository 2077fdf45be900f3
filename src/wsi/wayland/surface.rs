// A Wayland surface as seen by the layer
//
// Built around the application's foreign wl_display/wl_surface
// pointers. We never touch the application's default event queue:
// a private queue and wrapper proxies carry the registry roundtrip,
// the dmabuf format events and the frame callbacks.
use std::os::raw::c_void;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use wayland_client::protocol::{wl_callback, wl_surface::WlSurface};
use wayland_client::{Display, EventQueue, GlobalManager, Main, Proxy};
use wayland_protocols::unstable::linux_dmabuf::v1::client::zwp_linux_dmabuf_v1::{
    self, ZwpLinuxDmabufV1,
};
use wayland_protocols::unstable::linux_explicit_synchronization::v1::client::{
    zwp_linux_explicit_synchronization_v1::ZwpLinuxExplicitSynchronizationV1,
    zwp_linux_surface_synchronization_v1::ZwpLinuxSurfaceSynchronizationV1,
};

use crate::layer::private_data::DeviceData;
use crate::wsi::formats::DrmFormatPair;
use crate::wsi::surface::Surface;
use crate::wsi::surface_properties::SurfaceProperties;
use crate::wsi::swapchain::SwapchainBackend;
use crate::{Result, WsiError};
use utils::log;

use super::swapchain::WaylandBackend;
use super::{dispatch_queue, WaylandSurfaceProperties};

/// How long a present waits for the previous frame callback before
/// going ahead anyway. Keeps a minimised window from blocking the
/// application forever.
pub(crate) const FRAME_EVENT_TIMEOUT_MS: i32 = 1000;

/// zwp_linux_dmabuf_v1 version carrying modifier events.
const DMABUF_MODIFIER_VERSION: u32 = 3;

/// The per-surface state both the surface and its swapchains need.
pub struct SurfaceShared {
    ws_display: Display,
    /// The application's wl_surface, usable for requests from any
    /// thread.
    ws_surface: WlSurface,
    /// Wrapper of the same surface whose child objects (frame
    /// callbacks) deliver to the private queue.
    ws_surface_wrapper: WlSurface,
    ws_dmabuf: Main<ZwpLinuxDmabufV1>,
    ws_surface_sync: Main<ZwpLinuxSurfaceSynchronizationV1>,
    ws_queue: Mutex<EventQueue>,
    ws_formats: Vec<DrmFormatPair>,
    ws_frame_pending: Arc<AtomicBool>,
    ws_frame_callback: Mutex<Option<Main<wl_callback::WlCallback>>>,
}

/* Wayland requests are thread safe; events for our objects are only
 * ever dispatched while holding the queue mutex next to them. */
unsafe impl Send for SurfaceShared {}
unsafe impl Sync for SurfaceShared {}

impl SurfaceShared {
    pub fn display(&self) -> &Display {
        &self.ws_display
    }

    pub fn wl_surface(&self) -> &WlSurface {
        &self.ws_surface
    }

    pub fn dmabuf(&self) -> &Main<ZwpLinuxDmabufV1> {
        &self.ws_dmabuf
    }

    pub fn surface_sync(&self) -> &Main<ZwpLinuxSurfaceSynchronizationV1> {
        &self.ws_surface_sync
    }

    pub fn formats(&self) -> &[DrmFormatPair] {
        &self.ws_formats
    }

    pub fn supports_format(&self, pair: &DrmFormatPair) -> bool {
        self.ws_formats.contains(pair)
    }

    pub fn queue_token(&self) -> wayland_client::QueueToken {
        self.ws_queue.lock().unwrap().token()
    }

    /// Request a hint for when the next frame should be drawn.
    pub fn set_frame_callback(&self) -> bool {
        let callback = self.ws_surface_wrapper.frame();
        self.ws_frame_pending.store(true, Ordering::SeqCst);

        let pending = self.ws_frame_pending.clone();
        callback.quick_assign(move |_, event, _| {
            if let wl_callback::Event::Done { .. } = event {
                pending.store(false, Ordering::SeqCst);
            }
        });

        /* Replacing the handle also drops the previous callback. */
        *self.ws_frame_callback.lock().unwrap() = Some(callback);
        true
    }

    /// Wait for the frame callback of the previous present. On
    /// timeout the present proceeds anyway.
    pub fn wait_next_frame_event(&self) -> bool {
        while self.ws_frame_pending.load(Ordering::SeqCst) {
            let mut queue = self.ws_queue.lock().unwrap();
            match dispatch_queue(&self.ws_display, &mut queue, FRAME_EVENT_TIMEOUT_MS) {
                Err(()) => {
                    log::error!("Error while waiting for the next frame event");
                    return false;
                }
                Ok(0) => {
                    log::info!("Wait for frame event timed out, presenting anyway");
                    self.ws_frame_pending.store(false, Ordering::SeqCst);
                }
                Ok(_) => {}
            }
        }
        true
    }
}

pub struct WaylandSurface {
    wls_shared: Arc<SurfaceShared>,
    wls_properties: WaylandSurfaceProperties,
}

impl WaylandSurface {
    /// Wrap the application's display and surface. Binds the dmabuf
    /// and explicit-sync globals on a private queue and collects the
    /// compositor's format/modifier list.
    pub fn new(display_ptr: *mut c_void, surface_ptr: *mut c_void) -> Result<WaylandSurface> {
        if display_ptr.is_null() || surface_ptr.is_null() {
            return Err(WsiError::INITIALIZATION_FAILED);
        }

        unsafe {
            let display = Display::from_external_display(
                display_ptr as *mut wayland_sys::client::wl_display,
            );
            let mut queue = display.create_event_queue();
            let attached = display.attach(queue.token());

            let globals = GlobalManager::new(&attached);
            queue
                .sync_roundtrip(&mut (), |_, _, _| {})
                .map_err(|_| WsiError::SURFACE_LOST)?;

            let dmabuf = globals
                .instantiate_exact::<ZwpLinuxDmabufV1>(DMABUF_MODIFIER_VERSION)
                .map_err(|e| {
                    log::error!("Compositor does not offer zwp_linux_dmabuf_v1 v3: {}", e);
                    WsiError::INITIALIZATION_FAILED
                })?;

            let format_list: Arc<Mutex<Vec<DrmFormatPair>>> = Arc::new(Mutex::new(Vec::new()));
            {
                let format_list = format_list.clone();
                dmabuf.quick_assign(move |_, event, _| {
                    if let zwp_linux_dmabuf_v1::Event::Modifier {
                        format,
                        modifier_hi,
                        modifier_lo,
                    } = event
                    {
                        format_list.lock().unwrap().push(DrmFormatPair {
                            fourcc: format,
                            modifier: (u64::from(modifier_hi) << 32) | u64::from(modifier_lo),
                        });
                    }
                });
            }

            let explicit_sync = globals
                .instantiate_exact::<ZwpLinuxExplicitSynchronizationV1>(1)
                .map_err(|e| {
                    log::error!(
                        "Compositor does not offer zwp_linux_explicit_synchronization_v1: {}",
                        e
                    );
                    WsiError::INITIALIZATION_FAILED
                })?;

            /* Collect all the modifier events. */
            queue
                .sync_roundtrip(&mut (), |_, _, _| {})
                .map_err(|_| WsiError::SURFACE_LOST)?;

            let surface_proxy = Proxy::<WlSurface>::from_c_ptr(
                surface_ptr as *mut wayland_sys::client::wl_proxy,
            );
            let surface: WlSurface = surface_proxy.into();

            let surface_sync = explicit_sync.get_synchronization(&surface);

            let wrapper_proxy = surface
                .as_ref()
                .make_wrapper(&queue.token())
                .map_err(|_| WsiError::INITIALIZATION_FAILED)?;
            let surface_wrapper: WlSurface = wrapper_proxy.into();

            let formats = std::mem::take(&mut *format_list.lock().unwrap());
            if formats.is_empty() {
                log::warning!("Compositor advertised no dmabuf formats");
            }

            let shared = Arc::new(SurfaceShared {
                ws_display: display,
                ws_surface: surface,
                ws_surface_wrapper: surface_wrapper,
                ws_dmabuf: dmabuf,
                ws_surface_sync: surface_sync,
                ws_queue: Mutex::new(queue),
                ws_formats: formats,
                ws_frame_pending: Arc::new(AtomicBool::new(false)),
                ws_frame_callback: Mutex::new(None),
            });

            Ok(WaylandSurface {
                wls_properties: WaylandSurfaceProperties::new(shared.clone()),
                wls_shared: shared,
            })
        }
    }
}

impl Surface for WaylandSurface {
    fn get_properties(&self) -> &dyn SurfaceProperties {
        &self.wls_properties
    }

    fn create_backend(&self, device_data: &Arc<DeviceData>) -> Result<Box<dyn SwapchainBackend>> {
        Ok(Box::new(WaylandBackend::new(
            device_data.clone(),
            self.wls_shared.clone(),
        )))
    }
}
