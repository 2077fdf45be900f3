// X11 swapchain backend
//
// DRI3 path: image memory is exported as a dma-buf and becomes a
// server-side pixmap, presented with xcb_present_pixmap. Idle events
// return pixmaps to the free pool; configure events report resizes
// and dead windows. When DRI3/Present are too old, or pixmap
// creation fails, pixels are streamed with PutImage instead.
use ash::vk;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use xcb::x;
use xcb::Xid;

use crate::layer::private_data::DeviceData;
use crate::wsi::swapchain::{ImageCreateParams, SwapchainBackend, SwapchainInner};
use crate::wsi::synchronization::FenceSync;
use crate::{Result, WsiError};
use utils::fdwatch::{FdWatch, WaitStatus};
use utils::log;
use utils::timing::get_monotonic_nanos;

use super::surface::X11SurfaceShared;

struct X11ImageData {
    memory: vk::DeviceMemory,
    layout: vk::SubresourceLayout,
    pixmap: Option<x::Pixmap>,
    present_fence: FenceSync,
}

pub struct X11Backend {
    xb_device_data: Arc<DeviceData>,
    xb_shared: Arc<X11SurfaceShared>,
    xb_gc: Option<x::Gcontext>,
    xb_window_extent: (u16, u16),
    xb_depth: u8,
    /// Set when the server cannot do DRI3 pixmaps, before or during
    /// image creation.
    xb_sw_wsi: AtomicBool,
    xb_send_sbc: AtomicU64,
    xb_images: Vec<Mutex<Option<X11ImageData>>>,
}

fn find_memory_type(
    props: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    required: vk::MemoryPropertyFlags,
) -> Option<u32> {
    for (i, mem_type) in props.memory_types.iter().enumerate() {
        if (type_bits >> i) & 1 == 1 && mem_type.property_flags.contains(required) {
            return Some(i as u32);
        }
    }
    None
}

impl X11Backend {
    pub fn new(device_data: Arc<DeviceData>, shared: Arc<X11SurfaceShared>) -> X11Backend {
        X11Backend {
            xb_device_data: device_data,
            xb_shared: shared,
            xb_gc: None,
            xb_window_extent: (0, 0),
            xb_depth: 24,
            xb_sw_wsi: AtomicBool::new(false),
            xb_send_sbc: AtomicU64::new(0),
            xb_images: Vec::new(),
        }
    }

    fn is_sw(&self) -> bool {
        self.xb_sw_wsi.load(Ordering::SeqCst)
    }

    /// Probe DRI3 >= 1.2 and Present >= 1.2, register for Present
    /// events on success.
    fn setup_present(&mut self) -> bool {
        let conn = self.xb_shared.connection();

        let dri3_cookie = conn.send_request(&xcb::dri3::QueryVersion {
            major_version: 1,
            minor_version: 2,
        });
        let has_dri3 = match conn.wait_for_reply(dri3_cookie) {
            Ok(reply) => reply.major_version() > 1 || reply.minor_version() >= 2,
            Err(_) => false,
        };

        let present_cookie = conn.send_request(&xcb::present::QueryVersion {
            major_version: 1,
            minor_version: 2,
        });
        let has_present = match conn.wait_for_reply(present_cookie) {
            Ok(reply) => reply.major_version() > 1 || reply.minor_version() >= 2,
            Err(_) => false,
        };

        if !(has_dri3 && has_present) {
            log::warning!("DRI3 1.2/Present 1.2 not available, using PutImage");
            return false;
        }

        let eid = conn.generate_id();
        let res = conn.send_and_check_request(&xcb::present::SelectInput {
            eid,
            window: self.xb_shared.window(),
            event_mask: xcb::present::EventMask::IDLE_NOTIFY
                | xcb::present::EventMask::COMPLETE_NOTIFY
                | xcb::present::EventMask::CONFIGURE_NOTIFY,
        });
        if res.is_err() {
            log::warning!("Could not select Present input, using PutImage");
            return false;
        }

        true
    }

    fn create_pixmap(&self, data: &X11ImageData, params: &ImageCreateParams) -> Result<x::Pixmap> {
        let conn = self.xb_shared.connection();

        /* Export the image memory as a dma-buf for the server. The
         * request owns the fd afterwards. */
        let get_fd_info = vk::MemoryGetFdInfoKHR::builder()
            .memory(data.memory)
            .handle_type(vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT)
            .build();
        let mut fd: i32 = -1;
        let res = unsafe {
            (self.xb_device_data.disp.external_memory_fd_fn.get_memory_fd_khr)(
                self.xb_device_data.handle,
                &get_fd_info,
                &mut fd,
            )
        };
        if res != vk::Result::SUCCESS || fd < 0 {
            return Err(WsiError::from(res));
        }

        let pixmap: x::Pixmap = conn.generate_id();
        let cookie = conn.send_request_checked(&xcb::dri3::PixmapFromBuffers {
            pixmap,
            window: self.xb_shared.window(),
            width: params.extent.width as u16,
            height: params.extent.height as u16,
            stride0: data.layout.row_pitch as u32,
            offset0: data.layout.offset as u32,
            stride1: 0,
            offset1: 0,
            stride2: 0,
            offset2: 0,
            stride3: 0,
            offset3: 0,
            depth: self.xb_depth,
            bpp: 32,
            modifier: crate::wsi::formats::DRM_FORMAT_MOD_LINEAR,
            buffers: &[fd],
        });
        conn.flush().map_err(|_| WsiError::SURFACE_LOST)?;

        if conn.check_request(cookie).is_err() {
            return Err(WsiError::INITIALIZATION_FAILED);
        }
        Ok(pixmap)
    }

    fn handle_present_event(
        &self,
        chain: &SwapchainInner,
        event: &xcb::present::Event,
        timeout: &mut u64,
    ) -> Option<vk::Result> {
        match event {
            xcb::present::Event::ConfigureNotify(config) => {
                /* Bit zero flags the pixmaps as unusable: the window
                 * is gone. */
                if config.pixmap_flags() & 1 != 0 {
                    return Some(vk::Result::ERROR_SURFACE_LOST_KHR);
                }
                if config.width() != self.xb_window_extent.0
                    || config.height() != self.xb_window_extent.1
                {
                    return Some(vk::Result::SUBOPTIMAL_KHR);
                }
                None
            }
            xcb::present::Event::IdleNotify(idle) => {
                for (index, slot) in self.xb_images.iter().enumerate() {
                    let payload = slot.lock().unwrap();
                    let matches = payload
                        .as_ref()
                        .and_then(|data| data.pixmap)
                        .map(|pixmap| pixmap == idle.pixmap())
                        .unwrap_or(false);
                    drop(payload);
                    if matches && !chain.is_image_free(index as u32) {
                        chain.unpresent_image(index as u32);
                        *timeout = 0;
                        return Some(vk::Result::SUCCESS);
                    }
                }
                None
            }
            /* Completion is only interesting for pacing statistics. */
            _ => None,
        }
    }

    fn present_sw(&self, chain: &SwapchainInner, index: u32) {
        let conn = self.xb_shared.connection();
        let gc = match self.xb_gc {
            Some(gc) => gc,
            None => return,
        };

        let payload = self.xb_images[index as usize].lock().unwrap();
        let data = match payload.as_ref() {
            Some(data) => data,
            None => return,
        };

        let dev = &self.xb_device_data.disp.dev;
        let map = match unsafe {
            dev.map_memory(data.memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())
        } {
            Ok(map) => map as *const u8,
            Err(e) => {
                log::error!("vkMapMemory failed: {:?}", e);
                return;
            }
        };

        let stride = data.layout.row_pitch as usize;
        let width = (stride / 4) as u16;
        let height = self.xb_window_extent.1 as usize;

        /* PutImage payloads are bounded by the server's maximum
         * request length. */
        let max_request_bytes = conn.get_maximum_request_length() as usize * 4;
        let max_rows = std::cmp::max(1, (max_request_bytes.saturating_sub(1024)) / stride);

        let mut y = 0usize;
        while y < height {
            let rows = std::cmp::min(max_rows, height - y);
            let chunk =
                unsafe { std::slice::from_raw_parts(map.add(y * stride), rows * stride) };
            conn.send_request(&x::PutImage {
                format: x::ImageFormat::ZPixmap,
                drawable: x::Drawable::Window(self.xb_shared.window()),
                gc,
                width,
                height: rows as u16,
                dst_x: 0,
                dst_y: y as i16,
                left_pad: 0,
                depth: self.xb_depth,
                data: chunk,
            });
            y += rows;
        }

        unsafe { dev.unmap_memory(data.memory) };
        drop(payload);

        let _ = conn.flush();
        chain.unpresent_image(index);
    }
}

impl SwapchainBackend for X11Backend {
    fn init_platform(&mut self, _create_info: &vk::SwapchainCreateInfoKHR) -> Result<bool> {
        let geometry = self.xb_shared.window_geometry()?;
        self.xb_window_extent = (geometry.width, geometry.height);
        self.xb_depth = geometry.depth;

        let conn = self.xb_shared.connection();
        let gc: x::Gcontext = conn.generate_id();
        let res = conn.send_and_check_request(&x::CreateGc {
            cid: gc,
            drawable: x::Drawable::Window(self.xb_shared.window()),
            value_list: &[x::Gc::GraphicsExposures(false)],
        });
        if res.is_err() {
            return Err(WsiError::INITIALIZATION_FAILED);
        }
        self.xb_gc = Some(gc);

        if !self.setup_present() {
            self.xb_sw_wsi.store(true, Ordering::SeqCst);
        }

        Ok(true)
    }

    fn create_and_bind_swapchain_image(
        &mut self,
        params: &ImageCreateParams,
        index: u32,
    ) -> Result<vk::Image> {
        assert_eq!(self.xb_images.len(), index as usize);
        let dev = &self.xb_device_data.disp.dev;
        let sw = self.is_sw();

        let mut info = params.base_info();
        info.tiling = vk::ImageTiling::LINEAR;
        let mut external_info = vk::ExternalMemoryImageCreateInfo::builder()
            .handle_types(vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT)
            .build();
        if !sw {
            info.p_next = &mut external_info as *mut _ as *mut std::os::raw::c_void;
        }

        let image = unsafe { dev.create_image(&info, None).map_err(WsiError::from)? };

        let requirements = unsafe { dev.get_image_memory_requirements(image) };
        let memory_props = unsafe {
            self.xb_device_data
                .instance
                .disp
                .inst
                .get_physical_device_memory_properties(self.xb_device_data.physical_device)
        };
        let wanted = if sw {
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT
        } else {
            vk::MemoryPropertyFlags::DEVICE_LOCAL
        };
        let mem_type_index =
            match find_memory_type(&memory_props, requirements.memory_type_bits, wanted)
                .or_else(|| {
                    find_memory_type(
                        &memory_props,
                        requirements.memory_type_bits,
                        vk::MemoryPropertyFlags::empty(),
                    )
                }) {
                Some(index) => index,
                None => {
                    unsafe { dev.destroy_image(image, None) };
                    return Err(WsiError::OUT_OF_DEVICE_MEMORY);
                }
            };

        let mut dedicated_info = vk::MemoryDedicatedAllocateInfo::builder()
            .image(image)
            .build();
        let mut export_info = vk::ExportMemoryAllocateInfo::builder()
            .handle_types(vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT)
            .build();
        export_info.p_next = &mut dedicated_info as *mut _ as *mut std::os::raw::c_void;

        let mut alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(requirements.size)
            .memory_type_index(mem_type_index)
            .build();
        if !sw {
            alloc_info.p_next = &mut export_info as *mut _ as *mut std::os::raw::c_void;
        }

        let memory = match unsafe { dev.allocate_memory(&alloc_info, None) } {
            Ok(memory) => memory,
            Err(e) => {
                log::error!("vkAllocateMemory failed: {:?}", e);
                unsafe { dev.destroy_image(image, None) };
                return Err(WsiError::from(e));
            }
        };

        if let Err(e) = unsafe { dev.bind_image_memory(image, memory, 0) } {
            unsafe {
                dev.free_memory(memory, None);
                dev.destroy_image(image, None);
            }
            return Err(WsiError::from(e));
        }

        let subresource = vk::ImageSubresource {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            mip_level: 0,
            array_layer: 0,
        };
        let layout = unsafe { dev.get_image_subresource_layout(image, subresource) };

        let present_fence = match FenceSync::new(self.xb_device_data.clone()) {
            Ok(fence) => fence,
            Err(e) => {
                unsafe {
                    dev.free_memory(memory, None);
                    dev.destroy_image(image, None);
                }
                return Err(e);
            }
        };

        let mut data = X11ImageData {
            memory,
            layout,
            pixmap: None,
            present_fence,
        };

        if !self.is_sw() {
            match self.create_pixmap(&data, params) {
                Ok(pixmap) => data.pixmap = Some(pixmap),
                Err(_) => {
                    log::warning!("DRI3 pixmap creation failed, falling back to PutImage");
                    self.xb_sw_wsi.store(true, Ordering::SeqCst);
                }
            }
        }

        self.xb_images.push(Mutex::new(Some(data)));
        Ok(image)
    }

    fn create_aliased_image(&self, params: &ImageCreateParams) -> Result<vk::Image> {
        let mut info = params.base_info();
        info.tiling = vk::ImageTiling::LINEAR;
        unsafe {
            self.xb_device_data
                .disp
                .dev
                .create_image(&info, None)
                .map_err(WsiError::from)
        }
    }

    fn bind_aliased_image(&self, image: vk::Image, image_index: u32) -> Result<()> {
        let payload = self.xb_images[image_index as usize].lock().unwrap();
        let data = payload.as_ref().ok_or(WsiError::INITIALIZATION_FAILED)?;
        unsafe {
            self.xb_device_data
                .disp
                .dev
                .bind_image_memory(image, data.memory, 0)
                .map_err(WsiError::from)
        }
    }

    fn present_image(&self, chain: &SwapchainInner, index: u32) {
        if self.is_sw() {
            self.present_sw(chain, index);
            return;
        }

        let conn = self.xb_shared.connection();
        let pixmap = {
            let payload = self.xb_images[index as usize].lock().unwrap();
            match payload.as_ref().and_then(|data| data.pixmap) {
                Some(pixmap) => pixmap,
                None => {
                    /* Raced with the fallback switch. */
                    self.present_sw(chain, index);
                    return;
                }
            }
        };

        let serial = self.xb_send_sbc.fetch_add(1, Ordering::SeqCst) + 1;
        conn.send_request(&xcb::present::Pixmap {
            window: self.xb_shared.window(),
            pixmap,
            serial: serial as u32,
            valid: Xid::none(),
            update: Xid::none(),
            x_off: 0,
            y_off: 0,
            target_crtc: Xid::none(),
            wait_fence: Xid::none(),
            idle_fence: Xid::none(),
            options: 0,
            target_msc: 0,
            divisor: 0,
            remainder: 0,
            notifies: &[],
        });

        if conn.flush().is_err() {
            chain.set_error_state(vk::Result::ERROR_SURFACE_LOST_KHR);
        }
    }

    fn image_set_present_payload(
        &self,
        index: u32,
        queue: vk::Queue,
        wait_semaphores: &[vk::Semaphore],
    ) -> Result<()> {
        let mut payload = self.xb_images[index as usize].lock().unwrap();
        let data = payload.as_mut().ok_or(WsiError::INITIALIZATION_FAILED)?;
        data.present_fence.set_payload(queue, wait_semaphores)
    }

    fn image_wait_present(&self, index: u32, timeout: u64) -> vk::Result {
        let mut payload = self.xb_images[index as usize].lock().unwrap();
        match payload.as_mut() {
            Some(data) => data.present_fence.wait_payload(timeout),
            None => vk::Result::SUCCESS,
        }
    }

    fn get_free_buffer(&self, chain: &SwapchainInner, timeout: &mut u64) -> vk::Result {
        if self.is_sw() {
            if chain.any_image_free() {
                *timeout = 0;
            }
            return vk::Result::SUCCESS;
        }

        let conn = self.xb_shared.connection();
        let budget = *timeout;
        let start = get_monotonic_nanos();

        loop {
            /* Drain whatever the server already sent. */
            while let Ok(Some(event)) = conn.poll_for_event() {
                if let xcb::Event::Present(present_event) = event {
                    if let Some(res) = self.handle_present_event(chain, &present_event, timeout) {
                        return res;
                    }
                }
            }

            if chain.any_image_free() {
                *timeout = 0;
                return vk::Result::SUCCESS;
            }

            let elapsed = get_monotonic_nanos().saturating_sub(start);
            if elapsed >= budget {
                break;
            }

            let remaining_ms = ((budget - elapsed) / 1_000_000).min(i32::MAX as u64) as usize;
            let mut watch = FdWatch::new();
            watch.add_fd(conn.as_raw_fd());
            match watch.wait_for_events(Some(std::cmp::max(1, remaining_ms))) {
                WaitStatus::Ready | WaitStatus::Interrupted => {}
                WaitStatus::TimedOut => break,
                WaitStatus::Error => return vk::Result::ERROR_SURFACE_LOST_KHR,
            }
        }

        if *timeout == 0 {
            vk::Result::NOT_READY
        } else {
            vk::Result::TIMEOUT
        }
    }

    fn destroy_image(&self, index: u32) {
        let slot = match self.xb_images.get(index as usize) {
            Some(slot) => slot,
            None => return,
        };
        if let Some(data) = slot.lock().unwrap().take() {
            let conn = self.xb_shared.connection();
            if let Some(pixmap) = data.pixmap {
                conn.send_request(&x::FreePixmap { pixmap });
                let _ = conn.flush();
            }
            unsafe {
                self.xb_device_data.disp.dev.free_memory(data.memory, None);
            }
        }
    }
}
