// Presentation synchronization primitives
//
// Every presentable image carries a fence that is signalled when the
// application's rendering to it has finished. Backends that talk to
// an explicit-sync compositor use the sync-fd flavour, which can
// export the fence payload as a file descriptor.
use ash::vk;
use std::os::unix::io::RawFd;
use std::sync::Arc;

use crate::error::vk_try;
use crate::layer::private_data::{DeviceData, InstanceData};
use crate::Result;
use utils::log;

/// A Vulkan fence together with a payload bit telling whether a
/// submission is outstanding against it.
pub struct FenceSync {
    fs_device_data: Arc<DeviceData>,
    fs_fence: vk::Fence,
    fs_has_payload: bool,
    fs_payload_finished: bool,
}

impl FenceSync {
    pub fn new(device_data: Arc<DeviceData>) -> Result<FenceSync> {
        let info = vk::FenceCreateInfo::builder();
        let fence = unsafe {
            device_data
                .disp
                .dev
                .create_fence(&info, None)
                .map_err(crate::WsiError::from)?
        };
        Ok(FenceSync {
            fs_device_data: device_data,
            fs_fence: fence,
            fs_has_payload: false,
            fs_payload_finished: false,
        })
    }

    fn new_exportable(device_data: Arc<DeviceData>) -> Result<FenceSync> {
        let mut export_info = vk::ExportFenceCreateInfo::builder()
            .handle_types(vk::ExternalFenceHandleTypeFlags::SYNC_FD);
        let info = vk::FenceCreateInfo::builder().push_next(&mut export_info);
        let fence = unsafe {
            device_data
                .disp
                .dev
                .create_fence(&info, None)
                .map_err(crate::WsiError::from)?
        };
        Ok(FenceSync {
            fs_device_data: device_data,
            fs_fence: fence,
            fs_has_payload: false,
            fs_payload_finished: false,
        })
    }

    /// Reset the fence and submit an empty batch that waits on the
    /// given semaphores and signals it. The semaphores are signalled
    /// by completed work, so the wait stage can be the very end of
    /// the pipe.
    pub fn set_payload(&mut self, queue: vk::Queue, wait_semaphores: &[vk::Semaphore]) -> Result<()> {
        let dev = &self.fs_device_data.disp.dev;
        unsafe {
            dev.reset_fences(&[self.fs_fence])
                .map_err(crate::WsiError::from)?;
        }
        self.fs_has_payload = false;

        let wait_stages =
            vec![vk::PipelineStageFlags::BOTTOM_OF_PIPE; wait_semaphores.len()];
        let submit = vk::SubmitInfo::builder()
            .wait_semaphores(wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .build();

        unsafe {
            dev.queue_submit(queue, &[submit], self.fs_fence)
                .map_err(crate::WsiError::from)?;
        }
        self.fs_has_payload = true;
        self.fs_payload_finished = false;
        Ok(())
    }

    /// Wait for any outstanding payload. A fence with no payload, or
    /// one that has already been waited for, succeeds immediately.
    pub fn wait_payload(&mut self, timeout: u64) -> vk::Result {
        if !self.fs_has_payload || self.fs_payload_finished {
            return vk::Result::SUCCESS;
        }
        let res = unsafe {
            self.fs_device_data
                .disp
                .dev
                .wait_for_fences(&[self.fs_fence], true, timeout)
        };
        match res {
            Ok(()) => {
                self.fs_payload_finished = true;
                vk::Result::SUCCESS
            }
            Err(err) => err,
        }
    }

    /// Replace the payload bit, used when the payload leaves through
    /// an export. Returns the old value.
    fn swap_payload(&mut self, new_payload: bool) -> bool {
        let old = self.fs_has_payload;
        self.fs_has_payload = new_payload;
        self.fs_payload_finished = false;
        old
    }
}

impl Drop for FenceSync {
    fn drop(&mut self) {
        if self.fs_fence != vk::Fence::null() {
            self.wait_payload(u64::MAX);
            unsafe {
                self.fs_device_data
                    .disp
                    .dev
                    .destroy_fence(self.fs_fence, None);
            }
        }
    }
}

/// A fence whose payload can leave as a native sync fd.
pub struct SyncFdFenceSync {
    sf_fence: FenceSync,
}

impl SyncFdFenceSync {
    /// Whether the device can export SYNC_FD fence payloads at all.
    pub fn is_supported(instance_data: &InstanceData, physical_device: vk::PhysicalDevice) -> bool {
        let fence_info = vk::PhysicalDeviceExternalFenceInfo::builder()
            .handle_type(vk::ExternalFenceHandleTypeFlags::SYNC_FD)
            .build();
        let mut fence_props = vk::ExternalFenceProperties::default();
        unsafe {
            (instance_data
                .disp
                .external_fence_caps_fn
                .get_physical_device_external_fence_properties_khr)(
                physical_device,
                &fence_info,
                &mut fence_props,
            );
        }
        fence_props
            .external_fence_features
            .contains(vk::ExternalFenceFeatureFlags::EXPORTABLE)
    }

    pub fn new(device_data: Arc<DeviceData>) -> Result<SyncFdFenceSync> {
        Ok(SyncFdFenceSync {
            sf_fence: FenceSync::new_exportable(device_data)?,
        })
    }

    pub fn set_payload(&mut self, queue: vk::Queue, wait_semaphores: &[vk::Semaphore]) -> Result<()> {
        self.sf_fence.set_payload(queue, wait_semaphores)
    }

    pub fn wait_payload(&mut self, timeout: u64) -> vk::Result {
        self.sf_fence.wait_payload(timeout)
    }

    /// Export the pending payload as a sync fd owned by the caller.
    /// A fence whose payload has already signalled may legitimately
    /// export -1, meaning "already signalled".
    pub fn export_sync_fd(&mut self) -> Result<RawFd> {
        let info = vk::FenceGetFdInfoKHR::builder()
            .fence(self.sf_fence.fs_fence)
            .handle_type(vk::ExternalFenceHandleTypeFlags::SYNC_FD)
            .build();

        let mut fd: RawFd = -1;
        let res = unsafe {
            (self
                .sf_fence
                .fs_device_data
                .disp
                .external_fence_fd_fn
                .get_fence_fd_khr)(
                self.sf_fence.fs_device_data.handle, &info, &mut fd
            )
        };
        match vk_try(res) {
            Ok(()) => {
                self.sf_fence.swap_payload(false);
                Ok(fd)
            }
            Err(e) => {
                log::error!("Exporting present fence failed: {:?}", res);
                Err(e)
            }
        }
    }
}
