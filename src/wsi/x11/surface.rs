// An X11 window as seen by the layer
//
// Wraps the application's xcb connection (possibly reached through
// Xlib) and window. The connection is foreign: it must never be
// disconnected by us.
use std::mem::ManuallyDrop;
use std::os::raw::c_void;
use std::sync::Arc;

use xcb::x;

use crate::layer::private_data::DeviceData;
use crate::wsi::surface::Surface;
use crate::wsi::surface_properties::SurfaceProperties;
use crate::wsi::swapchain::SwapchainBackend;
use crate::{Result, WsiError};

use super::swapchain::X11Backend;
use super::X11SurfaceProperties;

pub struct WindowGeometry {
    pub width: u16,
    pub height: u16,
    pub depth: u8,
}

pub struct X11SurfaceShared {
    xs_connection: ManuallyDrop<xcb::Connection>,
    xs_window: x::Window,
}

impl X11SurfaceShared {
    pub fn connection(&self) -> &xcb::Connection {
        &self.xs_connection
    }

    pub fn window(&self) -> x::Window {
        self.xs_window
    }

    pub fn window_geometry(&self) -> Result<WindowGeometry> {
        let cookie = self.xs_connection.send_request(&x::GetGeometry {
            drawable: x::Drawable::Window(self.xs_window),
        });
        let reply = self
            .xs_connection
            .wait_for_reply(cookie)
            .map_err(|_| WsiError::SURFACE_LOST)?;
        Ok(WindowGeometry {
            width: reply.width(),
            height: reply.height(),
            depth: reply.depth(),
        })
    }
}

pub struct X11Surface {
    xls_shared: Arc<X11SurfaceShared>,
    xls_properties: X11SurfaceProperties,
}

impl X11Surface {
    /// From VkXcbSurfaceCreateInfoKHR.
    pub fn from_xcb(connection: *mut c_void, window: u32) -> Result<X11Surface> {
        if connection.is_null() {
            return Err(WsiError::INITIALIZATION_FAILED);
        }
        let conn = unsafe { xcb::Connection::from_raw_conn(connection as *mut _) };
        Self::new(conn, window)
    }

    /// From VkXlibSurfaceCreateInfoKHR, through the Xlib-xcb bridge.
    pub fn from_xlib(display: *mut c_void, window: u32) -> Result<X11Surface> {
        if display.is_null() {
            return Err(WsiError::INITIALIZATION_FAILED);
        }
        let conn = unsafe { xcb::Connection::from_xlib_display(display as *mut _) };
        Self::new(conn, window)
    }

    fn new(connection: xcb::Connection, window: u32) -> Result<X11Surface> {
        let window = unsafe { <x::Window as xcb::XidNew>::new(window) };
        let shared = Arc::new(X11SurfaceShared {
            xs_connection: ManuallyDrop::new(connection),
            xs_window: window,
        });

        Ok(X11Surface {
            xls_properties: X11SurfaceProperties::new(shared.clone()),
            xls_shared: shared,
        })
    }
}

impl Surface for X11Surface {
    fn get_properties(&self) -> &dyn SurfaceProperties {
        &self.xls_properties
    }

    fn create_backend(&self, device_data: &Arc<DeviceData>) -> Result<Box<dyn SwapchainBackend>> {
        Ok(Box::new(X11Backend::new(
            device_data.clone(),
            self.xls_shared.clone(),
        )))
    }
}
