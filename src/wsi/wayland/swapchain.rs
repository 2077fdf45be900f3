// Wayland swapchain backend
//
// Allocates dma-bufs the compositor and the GPU agree on, wraps them
// in wl_buffers and commits them with an explicit acquire fence.
// FIFO paces itself with wl_surface::frame callbacks; MAILBOX
// presents inline from vkQueuePresentKHR without a worker thread.
use ash::vk;
use std::sync::{Arc, Mutex};

use wayland_client::protocol::wl_buffer::{self, WlBuffer};
use wayland_client::{EventQueue, Main};
use wayland_protocols::unstable::linux_dmabuf::v1::client::{
    zwp_linux_buffer_params_v1, zwp_linux_dmabuf_v1::ZwpLinuxDmabufV1,
};

use crate::layer::private_data::DeviceData;
use crate::wsi::external_memory::ExternalMemory;
use crate::wsi::formats::{get_surface_compatible_formats, vk_to_drm_format};
use crate::wsi::swapchain::{ImageCreateParams, SwapchainBackend, SwapchainInner};
use crate::wsi::synchronization::SyncFdFenceSync;
use crate::wsi::wsialloc::{AllocFlags, WsiAllocator, WsiallocFormat};
use crate::{Result, WsiError};
use utils::log;

use super::surface::SurfaceShared;
use super::dispatch_queue;

struct WaylandImageData {
    external: ExternalMemory,
    buffer: Main<WlBuffer>,
    present_fence: SyncFdFenceSync,
}

struct ChosenFormat {
    format: WsiallocFormat,
}

pub struct WaylandBackend {
    wb_device_data: Arc<DeviceData>,
    wb_shared: Arc<SurfaceShared>,
    wb_present_mode: vk::PresentModeKHR,
    wb_allocator: Option<WsiAllocator>,
    /// Queue carrying wl_buffer release events, dispatched from
    /// get_free_buffer.
    wb_buffer_queue: Option<Mutex<EventQueue>>,
    /// dmabuf wrapper whose buffer params (and so the buffers) are
    /// bound to the buffer queue.
    wb_dmabuf_wrapper: Option<ZwpLinuxDmabufV1>,
    wb_chosen: Option<ChosenFormat>,
    wb_images: Vec<Mutex<Option<WaylandImageData>>>,
    /// Indices whose buffers the compositor released, drained under
    /// the buffer queue dispatch.
    wb_released: Arc<Mutex<Vec<u32>>>,
}

/* See SurfaceShared: requests are thread safe, events are dispatched
 * only under the queue locks. */
unsafe impl Send for WaylandBackend {}
unsafe impl Sync for WaylandBackend {}

impl WaylandBackend {
    pub fn new(device_data: Arc<DeviceData>, shared: Arc<SurfaceShared>) -> WaylandBackend {
        WaylandBackend {
            wb_device_data: device_data,
            wb_shared: shared,
            wb_present_mode: vk::PresentModeKHR::FIFO,
            wb_allocator: None,
            wb_buffer_queue: None,
            wb_dmabuf_wrapper: None,
            wb_chosen: None,
            wb_images: Vec::new(),
            wb_released: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn allocator(&self) -> &WsiAllocator {
        self.wb_allocator.as_ref().expect("backend not initialized")
    }

    /// Pick the fourcc/modifier the compositor, the device and the
    /// allocator all agree on. Decided once, before the first image.
    fn choose_format(&mut self, params: &ImageCreateParams) -> Result<WsiallocFormat> {
        if let Some(chosen) = &self.wb_chosen {
            return Ok(chosen.format);
        }

        let shared = self.wb_shared.clone();
        let importable =
            get_surface_compatible_formats(&self.wb_device_data, params, |pair| {
                shared.supports_format(pair)
            })?;
        if importable.is_empty() {
            log::error!("No common dma-buf format between device and compositor");
            return Err(WsiError::INITIALIZATION_FAILED);
        }

        let probe = self.allocator().alloc(
            &importable,
            params.extent.width,
            params.extent.height,
            AllocFlags::NO_MEMORY,
        )?;

        self.wb_chosen = Some(ChosenFormat {
            format: probe.format,
        });
        Ok(probe.format)
    }

    fn create_wl_buffer(
        &self,
        params: &ImageCreateParams,
        external: &ExternalMemory,
        modifier: u64,
        index: u32,
    ) -> Result<Main<WlBuffer>> {
        let dmabuf = self
            .wb_dmabuf_wrapper
            .as_ref()
            .ok_or(WsiError::INITIALIZATION_FAILED)?;

        let buffer_params = dmabuf.create_params();
        let modifier_hi = (modifier >> 32) as u32;
        let modifier_lo = (modifier & 0xffff_ffff) as u32;
        for plane in 0..external.num_planes() {
            buffer_params.add(
                external.buffer_fds()[plane],
                plane as u32,
                external.offsets()[plane],
                external.strides()[plane] as u32,
                modifier_hi,
                modifier_lo,
            );
        }

        let fourcc = vk_to_drm_format(params.format);
        let buffer = buffer_params.create_immed(
            params.extent.width as i32,
            params.extent.height as i32,
            fourcc,
            zwp_linux_buffer_params_v1::Flags::empty(),
        );
        buffer_params.destroy();

        let released = self.wb_released.clone();
        buffer.quick_assign(move |_, event, _| {
            if let wl_buffer::Event::Release = event {
                released.lock().unwrap().push(index);
            }
        });

        Ok(buffer)
    }
}

impl SwapchainBackend for WaylandBackend {
    fn init_platform(&mut self, create_info: &vk::SwapchainCreateInfoKHR) -> Result<bool> {
        self.wb_present_mode = create_info.present_mode;

        let buffer_queue = self.wb_shared.display().create_event_queue();
        let wrapper_proxy = self
            .wb_shared
            .dmabuf()
            .as_ref()
            .make_wrapper(&buffer_queue.token())
            .map_err(|_| {
                log::error!("Failed to create a dmabuf proxy on the buffer queue");
                WsiError::INITIALIZATION_FAILED
            })?;
        self.wb_dmabuf_wrapper = Some(wrapper_proxy.into());
        self.wb_buffer_queue = Some(Mutex::new(buffer_queue));

        self.wb_allocator = Some(WsiAllocator::new()?);

        /* MAILBOX presents inline, everything else uses the worker. */
        Ok(create_info.present_mode != vk::PresentModeKHR::MAILBOX)
    }

    fn create_and_bind_swapchain_image(
        &mut self,
        params: &ImageCreateParams,
        index: u32,
    ) -> Result<vk::Image> {
        assert_eq!(self.wb_images.len(), index as usize);

        let format = self.choose_format(params)?;

        let allocation = self.allocator().alloc(
            &[format],
            params.extent.width,
            params.extent.height,
            AllocFlags::empty(),
        )?;
        let num_planes = allocation.num_planes();
        let mut external =
            ExternalMemory::new(self.wb_device_data.clone(), &allocation, num_planes);

        let image = external.create_drm_modifier_image(params, format.modifier)?;

        let buffer = match self.create_wl_buffer(params, &external, format.modifier, index) {
            Ok(buffer) => buffer,
            Err(e) => {
                unsafe { self.wb_device_data.disp.dev.destroy_image(image, None) };
                return Err(e);
            }
        };

        if let Err(e) = external.import_memory_and_bind_swapchain_image(image) {
            log::error!("Failed to import and bind swapchain image: {}", e);
            buffer.destroy();
            unsafe { self.wb_device_data.disp.dev.destroy_image(image, None) };
            return Err(e);
        }

        let present_fence = match SyncFdFenceSync::new(self.wb_device_data.clone()) {
            Ok(fence) => fence,
            Err(e) => {
                buffer.destroy();
                unsafe { self.wb_device_data.disp.dev.destroy_image(image, None) };
                return Err(e);
            }
        };

        self.wb_images.push(Mutex::new(Some(WaylandImageData {
            external,
            buffer,
            present_fence,
        })));

        Ok(image)
    }

    fn create_aliased_image(&self, params: &ImageCreateParams) -> Result<vk::Image> {
        let chosen = self.wb_chosen.as_ref().ok_or(WsiError::INITIALIZATION_FAILED)?;
        let payload = self.wb_images[0].lock().unwrap();
        let data = payload.as_ref().ok_or(WsiError::INITIALIZATION_FAILED)?;
        data.external
            .create_drm_modifier_image(params, chosen.format.modifier)
    }

    fn bind_aliased_image(&self, image: vk::Image, image_index: u32) -> Result<()> {
        let payload = self.wb_images[image_index as usize].lock().unwrap();
        let data = payload.as_ref().ok_or(WsiError::INITIALIZATION_FAILED)?;
        data.external.bind_aliased_image(image)
    }

    fn present_image(&self, chain: &SwapchainInner, index: u32) {
        /* If a frame hint is still outstanding from the previous
         * FIFO present, wait for it before committing again. */
        if !self.wb_shared.wait_next_frame_event() {
            chain.set_error_state(vk::Result::ERROR_SURFACE_LOST_KHR);
        }

        let mut payload = self.wb_images[index as usize].lock().unwrap();
        let data = match payload.as_mut() {
            Some(data) => data,
            None => return,
        };

        self.wb_shared.wl_surface().attach(Some(&data.buffer), 0, 0);

        match data.present_fence.export_sync_fd() {
            Err(_) => {
                log::error!("Failed to export the present fence");
                chain.set_error_state(vk::Result::ERROR_SURFACE_LOST_KHR);
            }
            Ok(fd) if fd >= 0 => {
                self.wb_shared.surface_sync().set_acquire_fence(fd);
                /* The protocol dups the fd into the message. */
                let _ = nix::unistd::close(fd);
            }
            /* -1 means already signalled: nothing to tell the
             * compositor. */
            Ok(_) => {}
        }

        self.wb_shared
            .wl_surface()
            .damage(0, 0, i32::MAX, i32::MAX);

        if self.wb_present_mode == vk::PresentModeKHR::FIFO && !self.wb_shared.set_frame_callback()
        {
            chain.set_error_state(vk::Result::ERROR_SURFACE_LOST_KHR);
        }

        self.wb_shared.wl_surface().commit();
        if self.wb_shared.display().flush().is_err() {
            log::error!("Error flushing the display");
            chain.set_error_state(vk::Result::ERROR_SURFACE_LOST_KHR);
        }
    }

    fn image_set_present_payload(
        &self,
        index: u32,
        queue: vk::Queue,
        wait_semaphores: &[vk::Semaphore],
    ) -> Result<()> {
        let mut payload = self.wb_images[index as usize].lock().unwrap();
        let data = payload.as_mut().ok_or(WsiError::INITIALIZATION_FAILED)?;
        data.present_fence.set_payload(queue, wait_semaphores)
    }

    fn image_wait_present(&self, _index: u32, _timeout: u64) -> vk::Result {
        /* Explicit sync hands the wait to the compositor. */
        vk::Result::SUCCESS
    }

    fn get_free_buffer(&self, chain: &SwapchainInner, timeout: &mut u64) -> vk::Result {
        let queue_mutex = match &self.wb_buffer_queue {
            Some(queue) => queue,
            None => return vk::Result::ERROR_INITIALIZATION_FAILED,
        };

        let ms_timeout = std::cmp::min(*timeout / 1_000_000, i32::MAX as u64) as i32;

        /* Dispatching can return events that free no buffer, so
         * keep going until one does or nothing more arrives. */
        let mut res;
        loop {
            res = {
                let mut queue = queue_mutex.lock().unwrap();
                dispatch_queue(self.wb_shared.display(), &mut queue, ms_timeout)
            };

            let released = std::mem::take(&mut *self.wb_released.lock().unwrap());
            for index in released {
                chain.unpresent_image(index);
            }

            match res {
                Ok(n) if n > 0 && !chain.any_image_free() => continue,
                _ => break,
            }
        }

        match res {
            Ok(n) if n > 0 => {
                *timeout = 0;
                vk::Result::SUCCESS
            }
            Ok(_) => {
                if *timeout == 0 {
                    vk::Result::NOT_READY
                } else {
                    vk::Result::TIMEOUT
                }
            }
            Err(()) => vk::Result::ERROR_SURFACE_LOST_KHR,
        }
    }

    fn destroy_image(&self, index: u32) {
        let slot = match self.wb_images.get(index as usize) {
            Some(slot) => slot,
            None => return,
        };
        if let Some(data) = slot.lock().unwrap().take() {
            data.buffer.destroy();
            /* external memory and the fence clean up as they drop */
        }
    }
}
