// DRM display swapchain backend
//
// Images become KMS framebuffers: each dma-buf plane is imported as
// a GEM handle and wrapped with AddFB2. The first present installs
// the mode, later ones page flip and block on the flip event, so at
// most one image is ever on scanout.
use ash::vk;
use std::sync::{Arc, Mutex};

use drm::control::{framebuffer, Device as ControlDevice, PageFlipFlags};

use crate::layer::private_data::DeviceData;
use crate::wsi::external_memory::ExternalMemory;
use crate::wsi::formats::get_surface_compatible_formats;
use crate::wsi::swapchain::{ImageCreateParams, SwapchainBackend, SwapchainInner};
use crate::wsi::synchronization::SyncFdFenceSync;
use crate::wsi::wsialloc::{AllocFlags, WsiAllocator, WsiallocFormat};
use crate::{Result, WsiError};
use utils::fdwatch::{FdWatch, WaitStatus};
use utils::log;

use super::drm_display::{
    add_framebuffer, prime_fd_to_handle, DisplayFramebuffer, DrmDisplay, DrmDisplayMode,
};

/// Page flip waits poll the card in slices this long so a wedged
/// display cannot block forever without a log trail.
const PAGE_FLIP_SLICE_MS: usize = 1000;

struct DisplayImageData {
    external: ExternalMemory,
    fb: framebuffer::Handle,
    present_fence: SyncFdFenceSync,
}

pub struct DisplayBackend {
    db_device_data: Arc<DeviceData>,
    db_display: Arc<DrmDisplay>,
    db_mode: DrmDisplayMode,
    db_allocator: Option<WsiAllocator>,
    db_chosen: Option<WsiallocFormat>,
    db_images: Vec<Mutex<Option<DisplayImageData>>>,
}

impl DisplayBackend {
    pub fn new(
        device_data: Arc<DeviceData>,
        display: Arc<DrmDisplay>,
        mode: DrmDisplayMode,
    ) -> DisplayBackend {
        DisplayBackend {
            db_device_data: device_data,
            db_display: display,
            db_mode: mode,
            db_allocator: None,
            db_chosen: None,
            db_images: Vec::new(),
        }
    }

    fn allocator(&self) -> &WsiAllocator {
        self.db_allocator.as_ref().expect("backend not initialized")
    }

    fn choose_format(&mut self, params: &ImageCreateParams) -> Result<WsiallocFormat> {
        if let Some(chosen) = &self.db_chosen {
            return Ok(*chosen);
        }

        let display = self.db_display.clone();
        let importable = get_surface_compatible_formats(&self.db_device_data, params, |pair| {
            display.is_format_supported(pair)
        })?;
        if importable.is_empty() {
            log::error!("No common dma-buf format between device and display");
            return Err(WsiError::INITIALIZATION_FAILED);
        }

        let probe = self.allocator().alloc(
            &importable,
            params.extent.width,
            params.extent.height,
            AllocFlags::NO_MEMORY,
        )?;
        self.db_chosen = Some(probe.format);
        Ok(probe.format)
    }

    fn create_framebuffer(
        &self,
        params: &ImageCreateParams,
        external: &ExternalMemory,
        format: WsiallocFormat,
    ) -> Result<framebuffer::Handle> {
        use drm::buffer::DrmFourcc;
        use std::convert::TryFrom;

        let fourcc = DrmFourcc::try_from(format.fourcc).map_err(|_| {
            log::error!("Allocator picked a fourcc KMS does not know");
            WsiError::INITIALIZATION_FAILED
        })?;

        let mut fb = DisplayFramebuffer {
            size: (params.extent.width, params.extent.height),
            format: fourcc,
            pitches: [0; 4],
            handles: [None; 4],
            offsets: [0; 4],
            modifier: if self.db_display.supports_fb_modifiers() {
                Some(drm::buffer::DrmModifier::from(format.modifier))
            } else {
                None
            },
        };

        for plane in 0..external.num_planes() {
            assert!(external.strides()[plane] > 0);
            fb.pitches[plane] = external.strides()[plane] as u32;
            fb.offsets[plane] = external.offsets()[plane];
            let handle = prime_fd_to_handle(&self.db_display, external.buffer_fds()[plane])
                .map_err(|e| {
                    log::error!("Failed to convert buffer fd to GEM handle: {}", e);
                    WsiError::INITIALIZATION_FAILED
                })?;
            fb.handles[plane] = Some(handle);
        }

        add_framebuffer(&self.db_display, &fb).map_err(|e| {
            log::error!("Failed to create framebuffer: {}", e);
            WsiError::INITIALIZATION_FAILED
        })
    }

    /// Block until the flip we queued has been applied.
    fn wait_page_flip(&self, chain: &SwapchainInner) {
        let mut watch = FdWatch::new();
        watch.add_fd(self.db_display.drm_fd());

        loop {
            match watch.wait_for_events(Some(PAGE_FLIP_SLICE_MS)) {
                WaitStatus::Ready => {
                    let events = match self.db_display.card().receive_events() {
                        Ok(events) => events,
                        Err(e) => {
                            log::error!("Failed to read DRM events: {}", e);
                            chain.set_error_state(vk::Result::ERROR_SURFACE_LOST_KHR);
                            return;
                        }
                    };
                    for event in events {
                        if let drm::control::Event::PageFlip(_) = event {
                            return;
                        }
                    }
                }
                WaitStatus::TimedOut => {
                    log::warning!("Page flip wait timed out, polling again");
                }
                WaitStatus::Interrupted => {}
                WaitStatus::Error => {
                    log::error!("Waiting on the DRM fd failed");
                    chain.set_error_state(vk::Result::ERROR_SURFACE_LOST_KHR);
                    return;
                }
            }
        }
    }
}

impl SwapchainBackend for DisplayBackend {
    fn init_platform(&mut self, _create_info: &vk::SwapchainCreateInfoKHR) -> Result<bool> {
        self.db_allocator = Some(WsiAllocator::new()?);
        Ok(true)
    }

    fn create_and_bind_swapchain_image(
        &mut self,
        params: &ImageCreateParams,
        index: u32,
    ) -> Result<vk::Image> {
        assert_eq!(self.db_images.len(), index as usize);

        let format = self.choose_format(params)?;

        let allocation = self.allocator().alloc(
            &[format],
            params.extent.width,
            params.extent.height,
            AllocFlags::empty(),
        )?;
        let num_planes = allocation.num_planes();
        let mut external =
            ExternalMemory::new(self.db_device_data.clone(), &allocation, num_planes);

        let image = external.create_drm_modifier_image(params, format.modifier)?;

        let fb = match self.create_framebuffer(params, &external, format) {
            Ok(fb) => fb,
            Err(e) => {
                unsafe { self.db_device_data.disp.dev.destroy_image(image, None) };
                return Err(e);
            }
        };

        if let Err(e) = external.import_memory_and_bind_swapchain_image(image) {
            log::error!("Failed to import and bind swapchain image: {}", e);
            let _ = self.db_display.card().destroy_framebuffer(fb);
            unsafe { self.db_device_data.disp.dev.destroy_image(image, None) };
            return Err(e);
        }

        let present_fence = match SyncFdFenceSync::new(self.db_device_data.clone()) {
            Ok(fence) => fence,
            Err(e) => {
                let _ = self.db_display.card().destroy_framebuffer(fb);
                unsafe { self.db_device_data.disp.dev.destroy_image(image, None) };
                return Err(e);
            }
        };

        self.db_images.push(Mutex::new(Some(DisplayImageData {
            external,
            fb,
            present_fence,
        })));

        Ok(image)
    }

    fn create_aliased_image(&self, params: &ImageCreateParams) -> Result<vk::Image> {
        let chosen = self.db_chosen.ok_or(WsiError::INITIALIZATION_FAILED)?;
        let payload = self.db_images[0].lock().unwrap();
        let data = payload.as_ref().ok_or(WsiError::INITIALIZATION_FAILED)?;
        data.external.create_drm_modifier_image(params, chosen.modifier)
    }

    fn bind_aliased_image(&self, image: vk::Image, image_index: u32) -> Result<()> {
        let payload = self.db_images[image_index as usize].lock().unwrap();
        let data = payload.as_ref().ok_or(WsiError::INITIALIZATION_FAILED)?;
        data.external.bind_aliased_image(image)
    }

    fn present_image(&self, chain: &SwapchainInner, index: u32) {
        let fb = {
            let payload = self.db_images[index as usize].lock().unwrap();
            match payload.as_ref() {
                Some(data) => data.fb,
                None => return,
            }
        };

        if chain.is_first_present() {
            /* Install the framebuffer together with the mode the
             * surface was created for. */
            let res = self.db_display.card().set_crtc(
                self.db_display.crtc(),
                Some(fb),
                (0, 0),
                &[self.db_display.connector().handle()],
                Some(self.db_mode.drm_mode()),
            );
            if let Err(e) = res {
                log::error!("Setting the display mode failed: {}", e);
                chain.set_error_state(vk::Result::ERROR_SURFACE_LOST_KHR);
                return;
            }
        } else {
            let res = self.db_display.card().page_flip(
                self.db_display.crtc(),
                fb,
                PageFlipFlags::EVENT,
                None,
            );
            if let Err(e) = res {
                log::error!("Page flip failed: {}", e);
                chain.set_error_state(vk::Result::ERROR_SURFACE_LOST_KHR);
                return;
            }

            self.wait_page_flip(chain);
            if chain.error_has_occurred() {
                return;
            }
        }

        /* The new image is on scanout, the previously presented one
         * is free again. */
        chain.swap_presented_image(index);
    }

    fn image_set_present_payload(
        &self,
        index: u32,
        queue: vk::Queue,
        wait_semaphores: &[vk::Semaphore],
    ) -> Result<()> {
        let mut payload = self.db_images[index as usize].lock().unwrap();
        let data = payload.as_mut().ok_or(WsiError::INITIALIZATION_FAILED)?;
        data.present_fence.set_payload(queue, wait_semaphores)
    }

    fn image_wait_present(&self, index: u32, timeout: u64) -> vk::Result {
        let mut payload = self.db_images[index as usize].lock().unwrap();
        match payload.as_mut() {
            Some(data) => data.present_fence.wait_payload(timeout),
            None => vk::Result::SUCCESS,
        }
    }

    fn destroy_image(&self, index: u32) {
        let slot = match self.db_images.get(index as usize) {
            Some(slot) => slot,
            None => return,
        };
        if let Some(data) = slot.lock().unwrap().take() {
            if self.db_display.card().destroy_framebuffer(data.fb).is_err() {
                log::warning!("Failed to remove a KMS framebuffer");
            }
        }
    }
}
