// Swapchain scheduling core
//
// Everything here is platform independent: the presentable image
// state machine, the acquire/present traffic between the application
// and the page flip worker, and the retirement handover when a
// swapchain is replaced through oldSwapchain. Platform backends only
// allocate storage and push pixels.
//
// Image life cycle:
//
//   FREE -> ACQUIRED -> PENDING -> (PRESENTED ->) FREE
//
// with INVALID as the teardown state. One mutex guards every status
// transition together with the pending FIFO. Backends never take
// that mutex themselves, they go through the helpers on
// SwapchainInner, so no lock recursion can occur.
use ash::vk;
use ash::vk::Handle;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::helpers::find_in_chain;
use crate::layer::private_data::DeviceData;
use crate::{Result, WsiError};
use utils::log;
use utils::semaphore::{SemWait, TimedSemaphore};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ImageStatus {
    Invalid,
    Free,
    Acquired,
    Pending,
    Presented,
}

/// An owned copy of everything from VkSwapchainCreateInfoKHR needed
/// to create presentable images later. The application's pointers do
/// not survive the create call, so nothing raw is kept.
#[derive(Clone)]
pub struct ImageCreateParams {
    pub flags: vk::ImageCreateFlags,
    pub format: vk::Format,
    pub extent: vk::Extent3D,
    pub array_layers: u32,
    pub usage: vk::ImageUsageFlags,
    pub sharing_mode: vk::SharingMode,
    pub queue_family_indices: Vec<u32>,
    pub compression: Option<CompressionParams>,
}

#[derive(Clone)]
pub struct CompressionParams {
    pub flags: vk::ImageCompressionFlagsEXT,
    pub fixed_rate_flags: Vec<vk::ImageCompressionFixedRateFlagsEXT>,
}

impl ImageCreateParams {
    pub fn from_swapchain_info(
        create_info: &vk::SwapchainCreateInfoKHR,
        compression_control_enabled: bool,
    ) -> ImageCreateParams {
        let queue_family_indices = if create_info.queue_family_index_count > 0
            && !create_info.p_queue_family_indices.is_null()
        {
            unsafe {
                std::slice::from_raw_parts(
                    create_info.p_queue_family_indices,
                    create_info.queue_family_index_count as usize,
                )
                .to_vec()
            }
        } else {
            Vec::new()
        };

        let compression = if compression_control_enabled {
            unsafe {
                find_in_chain::<vk::ImageCompressionControlEXT>(
                    create_info.p_next,
                    vk::StructureType::IMAGE_COMPRESSION_CONTROL_EXT,
                )
            }
            .map(|control| {
                let fixed_rate_flags = if control.compression_control_plane_count > 0
                    && !control.p_fixed_rate_flags.is_null()
                {
                    unsafe {
                        std::slice::from_raw_parts(
                            control.p_fixed_rate_flags,
                            control.compression_control_plane_count as usize,
                        )
                        .to_vec()
                    }
                } else {
                    Vec::new()
                };
                CompressionParams {
                    flags: control.flags,
                    fixed_rate_flags,
                }
            })
        } else {
            None
        };

        ImageCreateParams {
            flags: vk::ImageCreateFlags::empty(),
            format: create_info.image_format,
            extent: vk::Extent3D {
                width: create_info.image_extent.width,
                height: create_info.image_extent.height,
                depth: 1,
            },
            array_layers: create_info.image_array_layers,
            usage: create_info.image_usage,
            sharing_mode: create_info.image_sharing_mode,
            queue_family_indices,
            compression,
        }
    }

    /// The plain part of the image create info. Backends chain their
    /// external-memory and modifier structs on top.
    pub fn base_info(&self) -> vk::ImageCreateInfo {
        vk::ImageCreateInfo::builder()
            .flags(self.flags)
            .image_type(vk::ImageType::TYPE_2D)
            .format(self.format)
            .extent(self.extent)
            .mip_levels(1)
            .array_layers(self.array_layers)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(self.usage)
            .sharing_mode(self.sharing_mode)
            .queue_family_indices(&self.queue_family_indices)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .build()
    }
}

pub struct SwapchainImage {
    pub image: vk::Image,
    pub present_semaphore: vk::Semaphore,
}

/// Status of every image plus the FIFO of indices queued for the
/// worker. All mutation happens under one mutex.
pub struct ImageTracker {
    statuses: Vec<ImageStatus>,
    pending: VecDeque<u32>,
}

impl ImageTracker {
    pub fn new(count: usize) -> ImageTracker {
        ImageTracker {
            statuses: vec![ImageStatus::Invalid; count],
            pending: VecDeque::with_capacity(count),
        }
    }

    pub fn status(&self, index: u32) -> ImageStatus {
        self.statuses[index as usize]
    }

    pub fn set_status(&mut self, index: u32, status: ImageStatus) {
        self.statuses[index as usize] = status;
    }

    pub fn first_free(&self) -> Option<u32> {
        self.statuses
            .iter()
            .position(|s| *s == ImageStatus::Free)
            .map(|i| i as u32)
    }

    pub fn find(&self, status: ImageStatus) -> Option<u32> {
        self.statuses
            .iter()
            .position(|s| *s == status)
            .map(|i| i as u32)
    }

    pub fn count(&self, status: ImageStatus) -> usize {
        self.statuses.iter().filter(|s| **s == status).count()
    }

    pub fn push_pending(&mut self, index: u32) {
        self.pending.push_back(index);
    }

    pub fn pop_pending(&mut self) -> Option<u32> {
        self.pending.pop_front()
    }
}

/// The platform half of a swapchain.
///
/// The `&mut self` methods run during initialization only, before
/// the worker thread exists. Everything else may be called from the
/// worker and from application threads concurrently; per-image
/// payloads are expected to live behind their own locks.
pub trait SwapchainBackend: Send + Sync {
    /// Inspect the create info and decide whether presentation runs
    /// on the worker thread.
    fn init_platform(&mut self, create_info: &vk::SwapchainCreateInfoKHR) -> Result<bool>;

    /// Allocate storage for one image, create the VkImage and bind
    /// the storage to it. Returns the image handle; the backend keeps
    /// the storage as its per-image payload.
    fn create_and_bind_swapchain_image(
        &mut self,
        params: &ImageCreateParams,
        index: u32,
    ) -> Result<vk::Image>;

    /// Create another VkImage compatible with this swapchain, for
    /// VkImageSwapchainCreateInfoKHR.
    fn create_aliased_image(&self, params: &ImageCreateParams) -> Result<vk::Image>;

    /// Bind an aliased image to the storage of the image at
    /// `image_index`, for VkBindImageMemorySwapchainInfoKHR.
    fn bind_aliased_image(&self, image: vk::Image, image_index: u32) -> Result<()>;

    /// Push one image to the display. May block. By the time the
    /// image leaves the screen the backend must return it to FREE
    /// through the helpers on `chain`, and must record any fatal
    /// failure in the chain's error state.
    fn present_image(&self, chain: &SwapchainInner, index: u32);

    /// Reset the image's present fence and queue a wait on the given
    /// semaphores that signals it.
    fn image_set_present_payload(
        &self,
        index: u32,
        queue: vk::Queue,
        wait_semaphores: &[vk::Semaphore],
    ) -> Result<()>;

    /// Wait until the rendering feeding the image has finished.
    fn image_wait_present(&self, index: u32, timeout: u64) -> vk::Result;

    /// Give the backend a chance to return an image to FREE out of
    /// band (compositor buffer releases, DRI3 idle events). On
    /// success with `timeout` reset to zero the caller re-checks the
    /// free counter immediately.
    fn get_free_buffer(&self, _chain: &SwapchainInner, _timeout: &mut u64) -> vk::Result {
        vk::Result::SUCCESS
    }

    /// Drop the per-image payload. Must be idempotent.
    fn destroy_image(&self, index: u32);
}

struct ChainLinks {
    ancestor: vk::SwapchainKHR,
    descendant: vk::SwapchainKHR,
}

pub struct SwapchainInner {
    pub device_data: Arc<DeviceData>,
    pub surface: vk::SurfaceKHR,
    pub present_mode: vk::PresentModeKHR,
    pub image_create_params: ImageCreateParams,
    sc_queue: vk::Queue,
    sc_images: Vec<Mutex<SwapchainImage>>,
    sc_tracker: Mutex<ImageTracker>,
    sc_free_image_sem: TimedSemaphore,
    sc_page_flip_sem: TimedSemaphore,
    sc_start_present_sem: TimedSemaphore,
    sc_run_worker: AtomicBool,
    sc_has_worker: bool,
    sc_first_present: AtomicBool,
    sc_started_presenting: AtomicBool,
    sc_error_state: Mutex<vk::Result>,
    sc_acquire_lock: Mutex<()>,
    sc_links: Mutex<ChainLinks>,
    sc_backend: Box<dyn SwapchainBackend>,
}

/// What a VkSwapchainKHR handle points at.
pub struct Swapchain {
    inner: Arc<SwapchainInner>,
    worker: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl std::ops::Deref for Swapchain {
    type Target = SwapchainInner;

    fn deref(&self) -> &SwapchainInner {
        &self.inner
    }
}

/// Resolve a handle the layer minted back to the swapchain. Only
/// valid between vkCreateSwapchainKHR and vkDestroySwapchainKHR of
/// that handle, which the application guarantees.
pub unsafe fn swapchain_from_handle<'a>(handle: vk::SwapchainKHR) -> &'a Swapchain {
    &*(handle.as_raw() as usize as *const Swapchain)
}

const WORKER_SEMAPHORE_TIMEOUT_NS: u64 = 250_000_000;

fn page_flip_thread(inner: Arc<SwapchainInner>) {
    while inner.sc_run_worker.load(Ordering::SeqCst) {
        /* Wait for an image queued for present. The timeout only
         * exists so shutdown is observed promptly. */
        if inner.sc_page_flip_sem.wait(WORKER_SEMAPHORE_TIMEOUT_NS) == SemWait::TimedOut {
            continue;
        }

        let pending_index = {
            let mut tracker = inner.sc_tracker.lock().unwrap();
            tracker.pop_pending()
        };
        let pending_index = match pending_index {
            Some(index) => index,
            None => continue,
        };

        /* The application's rendering must have landed before the
         * backend shows the image. */
        let mut res;
        loop {
            res = inner.sc_backend.image_wait_present(pending_index, u64::MAX);
            if res != vk::Result::TIMEOUT {
                break;
            }
            log::warning!("Timeout waiting for an image's present fence, retrying");
        }
        if res != vk::Result::SUCCESS {
            inner.set_error_state(res);
            inner.sc_free_image_sem.post();
            continue;
        }

        inner.call_present(pending_index);
    }
}

impl SwapchainInner {
    pub fn images(&self) -> Vec<vk::Image> {
        self.sc_images
            .iter()
            .map(|img| img.lock().unwrap().image)
            .collect()
    }

    pub fn image_count(&self) -> u32 {
        self.sc_images.len() as u32
    }

    pub fn image_present_semaphore(&self, index: u32) -> vk::Semaphore {
        self.sc_images[index as usize].lock().unwrap().present_semaphore
    }

    pub fn set_error_state(&self, error: vk::Result) {
        *self.sc_error_state.lock().unwrap() = error;
    }

    pub fn error_state(&self) -> vk::Result {
        *self.sc_error_state.lock().unwrap()
    }

    pub fn error_has_occurred(&self) -> bool {
        self.error_state() != vk::Result::SUCCESS
    }

    pub fn has_started_presenting(&self) -> bool {
        self.sc_started_presenting.load(Ordering::SeqCst)
    }

    /// Whether the next present is this swapchain's first. Only
    /// meaningful on the presenting thread.
    pub fn is_first_present(&self) -> bool {
        self.sc_first_present.load(Ordering::SeqCst)
    }

    fn ancestor(&self) -> vk::SwapchainKHR {
        self.sc_links.lock().unwrap().ancestor
    }

    fn descendant(&self) -> vk::SwapchainKHR {
        self.sc_links.lock().unwrap().descendant
    }

    pub fn set_ancestor(&self, ancestor: vk::SwapchainKHR) {
        self.sc_links.lock().unwrap().ancestor = ancestor;
    }

    pub fn clear_ancestor(&self) {
        self.sc_links.lock().unwrap().ancestor = vk::SwapchainKHR::null();
    }

    pub fn clear_descendant(&self) {
        self.sc_links.lock().unwrap().descendant = vk::SwapchainKHR::null();
    }

    fn has_descendant_started_presenting(&self) -> bool {
        let descendant = self.descendant();
        if descendant == vk::SwapchainKHR::null() {
            return false;
        }
        unsafe { swapchain_from_handle(descendant) }.has_started_presenting()
    }

    /// Return an image to FREE and wake one acquire.
    pub fn unpresent_image(&self, index: u32) {
        {
            let mut tracker = self.sc_tracker.lock().unwrap();
            tracker.set_status(index, ImageStatus::Free);
        }
        self.sc_free_image_sem.post();
    }

    /// Display backends keep exactly one image on screen: the newly
    /// flipped image becomes PRESENTED and the previous one, if any,
    /// returns to FREE.
    pub fn swap_presented_image(&self, pending_index: u32) {
        let previous = {
            let mut tracker = self.sc_tracker.lock().unwrap();
            let previous = tracker.find(ImageStatus::Presented);
            tracker.set_status(pending_index, ImageStatus::Presented);
            if let Some(prev) = previous {
                tracker.set_status(prev, ImageStatus::Free);
            }
            previous
        };
        if previous.is_some() {
            self.sc_free_image_sem.post();
        }
    }

    pub fn image_status(&self, index: u32) -> ImageStatus {
        self.sc_tracker.lock().unwrap().status(index)
    }

    pub fn is_image_free(&self, index: u32) -> bool {
        self.image_status(index) == ImageStatus::Free
    }

    pub fn any_image_free(&self) -> bool {
        self.sc_tracker.lock().unwrap().first_free().is_some()
    }

    fn wait_for_free_buffer(&self, timeout: u64) -> Result<()> {
        /* A buffer may already be marked free. */
        if self.sc_free_image_sem.wait(0) == SemWait::Ready {
            return Ok(());
        }

        /* Even with a zero timeout the backend may be able to free a
         * buffer without waiting. */
        let mut timeout = timeout;
        let res = self.sc_backend.get_free_buffer(self, &mut timeout);
        if res != vk::Result::SUCCESS {
            return Err(WsiError::from(res));
        }

        match self.sc_free_image_sem.wait(timeout) {
            SemWait::Ready => Ok(()),
            SemWait::TimedOut if timeout == 0 => Err(WsiError::NOT_READY),
            SemWait::TimedOut => Err(WsiError::TIMEOUT),
        }
    }

    /// Signal the acquire fence/semaphore. The fast path imports the
    /// "already signalled" sentinel sync fd; the fallback submits an
    /// empty batch on the internal queue.
    fn signal_acquire(&self, semaphore: vk::Semaphore, fence: vk::Fence) -> Result<()> {
        let disp = &self.device_data.disp;
        let mut semaphore = semaphore;
        let mut fence = fence;

        if disp.table.has_fn("vkImportFenceFdKHR") && disp.table.has_fn("vkImportSemaphoreFdKHR") {
            const ALREADY_SIGNALLED_SENTINEL_FD: i32 = -1;

            if fence != vk::Fence::null() {
                let info = vk::ImportFenceFdInfoKHR::builder()
                    .fence(fence)
                    .handle_type(vk::ExternalFenceHandleTypeFlags::SYNC_FD)
                    .flags(vk::FenceImportFlags::TEMPORARY)
                    .fd(ALREADY_SIGNALLED_SENTINEL_FD)
                    .build();
                let res =
                    unsafe { (disp.external_fence_fd_fn.import_fence_fd_khr)(disp.handle, &info) };
                match res {
                    vk::Result::SUCCESS => fence = vk::Fence::null(),
                    /* Leave to the fallback. */
                    vk::Result::ERROR_INVALID_EXTERNAL_HANDLE => {}
                    err => return Err(WsiError::from(err)),
                }
            }

            if semaphore != vk::Semaphore::null() {
                let info = vk::ImportSemaphoreFdInfoKHR::builder()
                    .semaphore(semaphore)
                    .handle_type(vk::ExternalSemaphoreHandleTypeFlags::SYNC_FD)
                    .flags(vk::SemaphoreImportFlags::TEMPORARY)
                    .fd(ALREADY_SIGNALLED_SENTINEL_FD)
                    .build();
                let res = unsafe {
                    (disp.external_semaphore_fd_fn.import_semaphore_fd_khr)(disp.handle, &info)
                };
                match res {
                    vk::Result::SUCCESS => semaphore = vk::Semaphore::null(),
                    vk::Result::ERROR_INVALID_EXTERNAL_HANDLE => {}
                    err => return Err(WsiError::from(err)),
                }
            }
        }

        if semaphore != vk::Semaphore::null() || fence != vk::Fence::null() {
            let semaphores = [semaphore];
            let mut submit = vk::SubmitInfo::builder();
            if semaphore != vk::Semaphore::null() {
                submit = submit.signal_semaphores(&semaphores);
            }
            let submit = submit.build();
            unsafe {
                disp.dev
                    .queue_submit(self.sc_queue, &[submit], fence)
                    .map_err(WsiError::from)?;
            }
        }

        Ok(())
    }

    pub fn acquire_next_image(
        &self,
        timeout: u64,
        semaphore: vk::Semaphore,
        fence: vk::Fence,
    ) -> Result<u32> {
        /* Serialize concurrent acquires. */
        let _acquire_guard = self.sc_acquire_lock.lock().unwrap();

        self.wait_for_free_buffer(timeout)?;
        if self.error_has_occurred() {
            return Err(WsiError::from(self.error_state()));
        }

        let index = {
            let mut tracker = self.sc_tracker.lock().unwrap();
            let index = tracker
                .first_free()
                .expect("free image counter out of sync with statuses");
            tracker.set_status(index, ImageStatus::Acquired);
            index
        };

        self.signal_acquire(semaphore, fence)?;

        Ok(index)
    }

    fn notify_presentation_engine(&self, index: u32) -> vk::Result {
        let mut tracker = self.sc_tracker.lock().unwrap();

        /* The application replaced this swapchain and its successor
         * is live: release the image instead of showing it. */
        if self.has_descendant_started_presenting() {
            tracker.set_status(index, ImageStatus::Free);
            drop(tracker);
            self.sc_free_image_sem.post();
            return vk::Result::ERROR_OUT_OF_DATE_KHR;
        }

        tracker.set_status(index, ImageStatus::Pending);
        self.sc_started_presenting.store(true, Ordering::SeqCst);

        if self.sc_has_worker {
            tracker.push_pending(index);
            drop(tracker);
            self.sc_page_flip_sem.post();
        } else {
            drop(tracker);
            self.call_present(index);
        }

        vk::Result::SUCCESS
    }

    /// One swapchain's slice of vkQueuePresentKHR.
    ///
    /// `wait_semaphores` carries the application's semaphores in the
    /// single-swapchain case; with several swapchains the caller has
    /// already chained them into each image's present semaphore.
    pub fn queue_present(
        &self,
        queue: vk::Queue,
        wait_semaphores: Option<&[vk::Semaphore]>,
        index: u32,
    ) -> vk::Result {
        let own_semaphore = [self.image_present_semaphore(index)];
        let semaphores = wait_semaphores.unwrap_or(&own_semaphore);

        if let Err(e) = self
            .sc_backend
            .image_set_present_payload(index, queue, semaphores)
        {
            log::error!("Failed to set the present payload: {}", e);
            return e.as_vk();
        }

        self.notify_presentation_engine(index)
    }

    fn call_present(&self, index: u32) {
        if self.sc_first_present.load(Ordering::SeqCst) {
            /* Wait for the replaced swapchain to drain before the
             * first image of this one goes up. */
            let ancestor = self.ancestor();
            if ancestor != vk::SwapchainKHR::null() {
                unsafe { swapchain_from_handle(ancestor) }.wait_for_pending_buffers();
            }

            self.sc_start_present_sem.post();
            self.sc_backend.present_image(self, index);
            self.sc_first_present.store(false, Ordering::SeqCst);
        } else {
            self.sc_backend.present_image(self, index);
        }
    }

    /// Block until every image that can come back is back. One image
    /// may be held by the compositor indefinitely, so all but one of
    /// the non-acquired images are waited for.
    pub fn wait_for_pending_buffers(&self) {
        let _acquire_guard = self.sc_acquire_lock.lock().unwrap();

        let wait = {
            let tracker = self.sc_tracker.lock().unwrap();
            let acquired = tracker.count(ImageStatus::Acquired);
            self.sc_images.len() as i64 - acquired as i64 - 1
        };

        for _ in 0..wait {
            let _ = self.wait_for_free_buffer(u64::MAX);
        }
    }

    /// Called on the old swapchain when a new one takes over its
    /// surface. Frees display memory early by destroying every image
    /// the application does not hold.
    pub fn deprecate(&self, descendant: vk::SwapchainKHR) {
        let count = self.sc_images.len() as u32;
        for index in 0..count {
            if self.image_status(index) == ImageStatus::Free {
                self.destroy_image(index);
            }
        }

        self.sc_links.lock().unwrap().descendant = descendant;
    }

    pub fn destroy_image(&self, index: u32) {
        {
            let mut tracker = self.sc_tracker.lock().unwrap();
            if tracker.status(index) == ImageStatus::Invalid {
                return;
            }
            tracker.set_status(index, ImageStatus::Invalid);
        }

        self.sc_backend.destroy_image(index);

        let mut image = self.sc_images[index as usize].lock().unwrap();
        if image.image != vk::Image::null() {
            unsafe {
                self.device_data.disp.dev.destroy_image(image.image, None);
            }
            image.image = vk::Image::null();
        }
    }

    pub fn create_aliased_image(&self) -> Result<vk::Image> {
        self.sc_backend.create_aliased_image(&self.image_create_params)
    }

    pub fn bind_aliased_image(&self, image: vk::Image, image_index: u32) -> Result<()> {
        self.sc_backend.bind_aliased_image(image, image_index)
    }

    /// Release acquired images without presenting them.
    pub fn release_images(&self, indices: &[u32]) {
        for index in indices {
            let released = {
                let mut tracker = self.sc_tracker.lock().unwrap();
                if tracker.status(*index) == ImageStatus::Acquired {
                    tracker.set_status(*index, ImageStatus::Free);
                    true
                } else {
                    false
                }
            };
            if released {
                self.sc_free_image_sem.post();
            }
        }
    }

    pub fn start_present_sem(&self) -> &TimedSemaphore {
        &self.sc_start_present_sem
    }
}

impl Swapchain {
    /// Build a swapchain over the given backend: allocate and bind
    /// every image, resolve the internal queue and start the page
    /// flip worker unless the backend opted out.
    pub fn new(
        device_data: Arc<DeviceData>,
        create_info: &vk::SwapchainCreateInfoKHR,
        mut backend: Box<dyn SwapchainBackend>,
    ) -> Result<Swapchain> {
        assert!(create_info.surface != vk::SurfaceKHR::null());

        let params = ImageCreateParams::from_swapchain_info(
            create_info,
            device_data.compression_control_enabled,
        );

        let use_worker = backend.init_platform(create_info)?;

        let image_count = create_info.min_image_count as usize;
        let mut images: Vec<Mutex<SwapchainImage>> = Vec::with_capacity(image_count);

        let destroy_partial = |backend: &dyn SwapchainBackend,
                               images: &[Mutex<SwapchainImage>],
                               device_data: &DeviceData| {
            for (index, slot) in images.iter().enumerate() {
                backend.destroy_image(index as u32);
                let image = slot.lock().unwrap();
                unsafe {
                    if image.image != vk::Image::null() {
                        device_data.disp.dev.destroy_image(image.image, None);
                    }
                    if image.present_semaphore != vk::Semaphore::null() {
                        device_data
                            .disp
                            .dev
                            .destroy_semaphore(image.present_semaphore, None);
                    }
                }
            }
        };

        for index in 0..image_count {
            let image = match backend.create_and_bind_swapchain_image(&params, index as u32) {
                Ok(image) => image,
                Err(e) => {
                    log::error!("Failed to create presentable image {}: {}", index, e);
                    destroy_partial(backend.as_ref(), &images, &device_data);
                    return Err(e);
                }
            };

            let semaphore_info = vk::SemaphoreCreateInfo::builder();
            let present_semaphore = match unsafe {
                device_data.disp.dev.create_semaphore(&semaphore_info, None)
            } {
                Ok(semaphore) => semaphore,
                Err(e) => {
                    unsafe { device_data.disp.dev.destroy_image(image, None) };
                    backend.destroy_image(index as u32);
                    destroy_partial(backend.as_ref(), &images, &device_data);
                    return Err(WsiError::from(e));
                }
            };

            images.push(Mutex::new(SwapchainImage {
                image,
                present_semaphore,
            }));
        }

        let queue = unsafe { device_data.disp.dev.get_device_queue(0, 0) };
        device_data.set_device_loader_data(queue)?;

        let mut tracker = ImageTracker::new(image_count);
        for index in 0..image_count {
            tracker.set_status(index as u32, ImageStatus::Free);
        }

        let inner = Arc::new(SwapchainInner {
            device_data,
            surface: create_info.surface,
            present_mode: create_info.present_mode,
            image_create_params: params,
            sc_queue: queue,
            sc_images: images,
            sc_tracker: Mutex::new(tracker),
            sc_free_image_sem: TimedSemaphore::new(image_count as u64),
            sc_page_flip_sem: TimedSemaphore::new(0),
            sc_start_present_sem: TimedSemaphore::new(0),
            sc_run_worker: AtomicBool::new(use_worker),
            sc_has_worker: use_worker,
            sc_first_present: AtomicBool::new(true),
            sc_started_presenting: AtomicBool::new(false),
            sc_error_state: Mutex::new(vk::Result::SUCCESS),
            sc_acquire_lock: Mutex::new(()),
            sc_links: Mutex::new(ChainLinks {
                ancestor: vk::SwapchainKHR::null(),
                descendant: vk::SwapchainKHR::null(),
            }),
            sc_backend: backend,
        });

        let worker = if use_worker {
            let worker_inner = inner.clone();
            match std::thread::Builder::new()
                .name("wsi-page-flip".to_owned())
                .spawn(move || page_flip_thread(worker_inner))
            {
                Ok(handle) => Some(handle),
                Err(_) => {
                    inner.sc_run_worker.store(false, Ordering::SeqCst);
                    for index in 0..inner.image_count() {
                        inner.destroy_image(index);
                    }
                    return Err(WsiError::INITIALIZATION_FAILED);
                }
            }
        } else {
            None
        };

        Ok(Swapchain {
            inner,
            worker: Mutex::new(worker),
        })
    }

    /// Link this freshly created swapchain to the one it replaces.
    /// Called with the handle the application will see.
    pub fn adopt_old_swapchain(&self, own_handle: vk::SwapchainKHR, old: vk::SwapchainKHR) {
        self.inner.set_ancestor(old);
        unsafe { swapchain_from_handle(old) }.deprecate(own_handle);
    }

    pub fn get_swapchain_status(&self) -> vk::Result {
        self.inner.error_state()
    }

    fn teardown(&mut self) {
        let inner = &self.inner;

        /* Images in ACQUIRED or FREE can go immediately. PENDING
         * images belong to the presentation engine until it is
         * finished with them. */
        if inner.has_descendant_started_presenting() {
            /* The replacement swapchain's first present consumes our
             * pending images; wait for it so nothing is destroyed
             * under it. */
            let descendant = inner.descendant();
            unsafe { swapchain_from_handle(descendant) }
                .start_present_sem()
                .wait(u64::MAX);
        } else if !inner.error_has_occurred() {
            inner.wait_for_pending_buffers();
        }

        if inner.sc_queue != vk::Queue::null() {
            let _ = unsafe { inner.device_data.disp.dev.queue_wait_idle(inner.sc_queue) };
        }

        inner.sc_run_worker.store(false, Ordering::SeqCst);
        if let Some(handle) = self.worker.lock().unwrap().take() {
            if handle.join().is_err() {
                log::error!("Page flip worker panicked during teardown");
            }
        }

        let descendant = inner.descendant();
        if descendant != vk::SwapchainKHR::null() {
            unsafe { swapchain_from_handle(descendant) }.clear_ancestor();
        }
        let ancestor = inner.ancestor();
        if ancestor != vk::SwapchainKHR::null() {
            unsafe { swapchain_from_handle(ancestor) }.clear_descendant();
        }

        for index in 0..inner.image_count() {
            inner.destroy_image(index);
            let mut image = inner.sc_images[index as usize].lock().unwrap();
            if image.present_semaphore != vk::Semaphore::null() {
                unsafe {
                    inner
                        .device_data
                        .disp
                        .dev
                        .destroy_semaphore(image.present_semaphore, None);
                }
                image.present_semaphore = vk::Semaphore::null();
            }
        }
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// The tracker and the two counters, exercised the way the
    /// scheduling core drives them.
    struct Harness {
        tracker: Mutex<ImageTracker>,
        free_sem: TimedSemaphore,
    }

    impl Harness {
        fn new(count: usize) -> Harness {
            let mut tracker = ImageTracker::new(count);
            for i in 0..count {
                tracker.set_status(i as u32, ImageStatus::Free);
            }
            Harness {
                tracker: Mutex::new(tracker),
                free_sem: TimedSemaphore::new(count as u64),
            }
        }

        fn acquire(&self) -> Option<u32> {
            if self.free_sem.wait(0) != SemWait::Ready {
                return None;
            }
            let mut tracker = self.tracker.lock().unwrap();
            let index = tracker.first_free().expect("counter out of sync");
            tracker.set_status(index, ImageStatus::Acquired);
            Some(index)
        }

        fn present(&self, index: u32) {
            let mut tracker = self.tracker.lock().unwrap();
            tracker.set_status(index, ImageStatus::Pending);
            tracker.push_pending(index);
        }

        fn complete_present(&self, index: u32) {
            let mut tracker = self.tracker.lock().unwrap();
            assert_eq!(tracker.pop_pending(), Some(index));
            tracker.set_status(index, ImageStatus::Free);
            drop(tracker);
            self.free_sem.post();
        }

        fn swap_presented(&self, index: u32) {
            let mut tracker = self.tracker.lock().unwrap();
            assert_eq!(tracker.pop_pending(), Some(index));
            let previous = tracker.find(ImageStatus::Presented);
            tracker.set_status(index, ImageStatus::Presented);
            if let Some(prev) = previous {
                tracker.set_status(prev, ImageStatus::Free);
                drop(tracker);
                self.free_sem.post();
            }
        }
    }

    #[test]
    fn acquire_returns_lowest_free_index() {
        let h = Harness::new(3);
        assert_eq!(h.acquire(), Some(0));
        assert_eq!(h.acquire(), Some(1));
        assert_eq!(h.acquire(), Some(2));
        assert_eq!(h.acquire(), None);
    }

    #[test]
    fn fifo_cycle_reuses_the_oldest_image() {
        /* Three images, present each between acquires: the fourth
         * acquire gets index 0 back. */
        let h = Harness::new(3);
        let mut seen = Vec::new();
        for _ in 0..3 {
            let i = h.acquire().unwrap();
            seen.push(i);
            h.present(i);
        }
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2]);

        assert_eq!(h.acquire(), None);
        h.complete_present(0);
        assert_eq!(h.acquire(), Some(0));
    }

    #[test]
    fn free_counter_matches_free_statuses_at_quiescence() {
        let h = Harness::new(4);
        let a = h.acquire().unwrap();
        let b = h.acquire().unwrap();
        h.present(a);
        h.present(b);
        h.complete_present(a);

        let tracker = h.tracker.lock().unwrap();
        assert_eq!(tracker.count(ImageStatus::Free) as u64, h.free_sem.count());
    }

    #[test]
    fn display_style_present_keeps_exactly_one_on_screen() {
        /* The page-flip pattern: 3 images, the free counter moves
         * 3 -> 2 -> 2 -> 1 -> 2. */
        let h = Harness::new(3);
        assert_eq!(h.free_sem.count(), 3);

        let first = h.acquire().unwrap();
        assert_eq!(h.free_sem.count(), 2);
        h.present(first);
        h.swap_presented(first);
        assert_eq!(h.free_sem.count(), 2);

        let second = h.acquire().unwrap();
        assert_eq!(h.free_sem.count(), 1);
        h.present(second);
        h.swap_presented(second);
        assert_eq!(h.free_sem.count(), 2);

        let tracker = h.tracker.lock().unwrap();
        assert_eq!(tracker.count(ImageStatus::Presented), 1);
        assert_eq!(tracker.status(first), ImageStatus::Free);
        assert_eq!(tracker.status(second), ImageStatus::Presented);
    }

    #[test]
    fn pending_images_appear_in_fifo_order() {
        let h = Harness::new(3);
        let a = h.acquire().unwrap();
        let b = h.acquire().unwrap();
        h.present(a);
        h.present(b);

        let mut tracker = h.tracker.lock().unwrap();
        assert_eq!(tracker.pop_pending(), Some(a));
        assert_eq!(tracker.pop_pending(), Some(b));
        assert_eq!(tracker.pop_pending(), None);
    }

    #[test]
    fn retirement_wait_count_leaves_one_for_the_compositor() {
        /* images - acquired - 1: with 3 images and 1 acquired the
         * replacement waits for exactly one buffer to come back. */
        let h = Harness::new(3);
        let _held = h.acquire().unwrap();
        let tracker = h.tracker.lock().unwrap();
        let acquired = tracker.count(ImageStatus::Acquired);
        assert_eq!(3i64 - acquired as i64 - 1, 1);
    }
}
