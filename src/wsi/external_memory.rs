// Importing allocator dma-bufs as Vulkan device memory
//
// Carries the per-plane fds, strides and offsets of one presentable
// image from the allocator to the driver. Fds are owned by this
// object until a successful import hands them to the driver; the
// same fd may appear for several planes and is then only closed (or
// imported) once, at its first occurrence.
use ash::vk;
use nix::unistd::{lseek, Whence};
use std::os::unix::io::RawFd;
use std::sync::Arc;

use crate::error::vk_try;
use crate::layer::private_data::DeviceData;
use crate::{Result, WsiError};
use utils::log;

use super::wsialloc::{AllocationResult, MAX_PLANES};

const PLANE_ASPECTS: [vk::ImageAspectFlags; MAX_PLANES] = [
    vk::ImageAspectFlags::MEMORY_PLANE_0_EXT,
    vk::ImageAspectFlags::MEMORY_PLANE_1_EXT,
    vk::ImageAspectFlags::MEMORY_PLANE_2_EXT,
    vk::ImageAspectFlags::MEMORY_PLANE_3_EXT,
];

/// For each plane, whether its fd first occurs at that index. Planes
/// sharing one buffer repeat the same fd and must be handled once.
fn unique_fd_planes(fds: &[RawFd; MAX_PLANES], num_planes: usize) -> [bool; MAX_PLANES] {
    let mut unique = [false; MAX_PLANES];
    for plane in 0..num_planes {
        unique[plane] = fds[..plane].iter().all(|fd| *fd != fds[plane]);
    }
    unique
}

pub struct ExternalMemory {
    em_device_data: Arc<DeviceData>,
    em_fds: [RawFd; MAX_PLANES],
    em_strides: [i32; MAX_PLANES],
    em_offsets: [u32; MAX_PLANES],
    em_num_planes: usize,
    em_memories: [vk::DeviceMemory; MAX_PLANES],
    em_num_memories: usize,
    /// Fds consumed by a successful import are owned by the driver.
    em_imported: [bool; MAX_PLANES],
    em_handle_type: vk::ExternalMemoryHandleTypeFlags,
}

impl ExternalMemory {
    /// Take ownership of an allocation's plane fds.
    pub fn new(
        device_data: Arc<DeviceData>,
        allocation: &AllocationResult,
        num_planes: usize,
    ) -> ExternalMemory {
        let unique = unique_fd_planes(&allocation.buffer_fds, num_planes);
        let num_memories = if allocation.is_disjoint {
            unique[..num_planes].iter().filter(|u| **u).count()
        } else {
            1
        };

        ExternalMemory {
            em_device_data: device_data,
            em_fds: allocation.buffer_fds,
            em_strides: allocation.average_row_strides,
            em_offsets: allocation.offsets,
            em_num_planes: num_planes,
            em_memories: [vk::DeviceMemory::null(); MAX_PLANES],
            em_num_memories: num_memories,
            em_imported: [false; MAX_PLANES],
            em_handle_type: vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT,
        }
    }

    pub fn num_planes(&self) -> usize {
        self.em_num_planes
    }

    pub fn is_disjoint(&self) -> bool {
        self.em_num_memories != 1
    }

    pub fn strides(&self) -> &[i32] {
        &self.em_strides[..self.em_num_planes]
    }

    pub fn offsets(&self) -> &[u32] {
        &self.em_offsets[..self.em_num_planes]
    }

    pub fn buffer_fds(&self) -> &[RawFd] {
        &self.em_fds[..self.em_num_planes]
    }

    /// The memory type a dma-buf can be imported as: the lowest set
    /// bit of the fd's compatibility mask.
    fn get_fd_mem_type_index(&self, fd: RawFd) -> Result<u32> {
        let mut props = vk::MemoryFdPropertiesKHR::default();
        let res = unsafe {
            (self
                .em_device_data
                .disp
                .external_memory_fd_fn
                .get_memory_fd_properties_khr)(
                self.em_device_data.handle,
                self.em_handle_type,
                fd,
                &mut props,
            )
        };
        vk_try(res).map_err(|e| {
            log::error!("Error querying dma-buf fd properties: {:?}", res);
            e
        })?;

        if props.memory_type_bits == 0 {
            return Err(WsiError::INITIALIZATION_FAILED);
        }
        Ok(props.memory_type_bits.trailing_zeros())
    }

    fn import_plane_memory(&mut self, fd: RawFd) -> Result<vk::DeviceMemory> {
        let mem_index = self.get_fd_mem_type_index(fd)?;

        let fd_size = lseek(fd, 0, Whence::SeekEnd).map_err(|e| {
            log::error!("Failed to get dma-buf size: {}", e);
            WsiError::OUT_OF_HOST_MEMORY
        })?;

        let mut import_info = vk::ImportMemoryFdInfoKHR::builder()
            .handle_type(self.em_handle_type)
            .fd(fd);
        let alloc_info = vk::MemoryAllocateInfo::builder()
            .push_next(&mut import_info)
            .allocation_size(fd_size as u64)
            .memory_type_index(mem_index);

        let memory = unsafe {
            self.em_device_data
                .disp
                .dev
                .allocate_memory(&alloc_info, None)
                .map_err(|e| {
                    log::error!("Failed to import device memory: {:?}", e);
                    WsiError::from(e)
                })?
        };
        Ok(memory)
    }

    fn import_plane_memories(&mut self) -> Result<()> {
        if self.is_disjoint() {
            let unique = unique_fd_planes(&self.em_fds, self.em_num_planes);
            let mut memory_plane = 0;
            for plane in 0..self.em_num_planes {
                if unique[plane] {
                    let memory = self.import_plane_memory(self.em_fds[plane])?;
                    self.em_memories[memory_plane] = memory;
                    self.em_imported[plane] = true;
                    memory_plane += 1;
                }
            }
            return Ok(());
        }

        let memory = self.import_plane_memory(self.em_fds[0])?;
        self.em_memories[0] = memory;
        for plane in 0..self.em_num_planes {
            self.em_imported[plane] = true;
        }
        Ok(())
    }

    fn bind_swapchain_image_memory(&self, image: vk::Image) -> Result<()> {
        let dev = &self.em_device_data.disp.dev;
        if self.is_disjoint() {
            let mut plane_infos: Vec<vk::BindImagePlaneMemoryInfo> = (0..self.em_num_memories)
                .map(|plane| {
                    vk::BindImagePlaneMemoryInfo::builder()
                        .plane_aspect(PLANE_ASPECTS[plane])
                        .build()
                })
                .collect();

            let bind_infos: Vec<vk::BindImageMemoryInfo> = (0..self.em_num_memories)
                .map(|plane| {
                    let mut info = vk::BindImageMemoryInfo::builder()
                        .image(image)
                        .memory(self.em_memories[plane])
                        .memory_offset(u64::from(self.em_offsets[plane]))
                        .build();
                    info.p_next =
                        &mut plane_infos[plane] as *mut _ as *mut std::os::raw::c_void;
                    info
                })
                .collect();

            let res = unsafe {
                (self.em_device_data.disp.bind_memory2_fn.bind_image_memory2_khr)(
                    self.em_device_data.handle,
                    bind_infos.len() as u32,
                    bind_infos.as_ptr(),
                )
            };
            return vk_try(res);
        }

        unsafe {
            dev.bind_image_memory(image, self.em_memories[0], u64::from(self.em_offsets[0]))
                .map_err(WsiError::from)
        }
    }

    /// Bind one plane of an application-aliased swapchain image.
    pub fn bind_aliased_image(&self, image: vk::Image) -> Result<()> {
        self.bind_swapchain_image_memory(image)
    }

    pub fn import_memory_and_bind_swapchain_image(&mut self, image: vk::Image) -> Result<()> {
        self.import_plane_memories()?;
        self.bind_swapchain_image_memory(image)
    }

    /// Per-plane subresource layouts for the modifier-explicit image
    /// create chain.
    pub fn plane_layouts(&self) -> Vec<vk::SubresourceLayout> {
        (0..self.em_num_planes)
            .map(|plane| {
                debug_assert!(self.em_strides[plane] >= 0);
                vk::SubresourceLayout {
                    offset: u64::from(self.em_offsets[plane]),
                    size: 0,
                    row_pitch: self.em_strides[plane] as u64,
                    array_pitch: 0,
                    depth_pitch: 0,
                }
            })
            .collect()
    }

    pub fn handle_type(&self) -> vk::ExternalMemoryHandleTypeFlags {
        self.em_handle_type
    }

    /// Create a VkImage whose layout matches this allocation: DRM
    /// modifier tiling with explicit per-plane layouts, external
    /// dma-buf memory, and the disjoint flag when the planes live in
    /// separate memories.
    pub fn create_drm_modifier_image(
        &self,
        params: &super::swapchain::ImageCreateParams,
        modifier: u64,
    ) -> Result<vk::Image> {
        let plane_layouts = self.plane_layouts();
        let mut modifier_info = vk::ImageDrmFormatModifierExplicitCreateInfoEXT::builder()
            .drm_format_modifier(modifier)
            .plane_layouts(&plane_layouts)
            .build();
        let mut external_info = vk::ExternalMemoryImageCreateInfo::builder()
            .handle_types(self.em_handle_type)
            .build();
        external_info.p_next = &mut modifier_info as *mut _ as *mut std::os::raw::c_void;

        let mut info = params.base_info();
        info.tiling = vk::ImageTiling::DRM_FORMAT_MODIFIER_EXT;
        if self.is_disjoint() {
            info.flags |= vk::ImageCreateFlags::DISJOINT;
        }
        info.p_next = &mut external_info as *mut _ as *mut std::os::raw::c_void;

        let mut fixed_rate_flags;
        let mut compression_info;
        if let Some(compression) = &params.compression {
            fixed_rate_flags = compression.fixed_rate_flags.clone();
            compression_info = vk::ImageCompressionControlEXT::builder()
                .flags(compression.flags)
                .fixed_rate_flags(&mut fixed_rate_flags)
                .build();
            compression_info.p_next = &mut external_info as *mut _ as *mut std::os::raw::c_void;
            info.p_next = &mut compression_info as *mut _ as *mut std::os::raw::c_void;
        }

        unsafe {
            self.em_device_data
                .disp
                .dev
                .create_image(&info, None)
                .map_err(|e| {
                    log::error!("Image creation failed: {:?}", e);
                    WsiError::from(e)
                })
        }
    }

    /// Number of memory planes the bound image has.
    pub fn num_memories(&self) -> usize {
        self.em_num_memories
    }
}

impl Drop for ExternalMemory {
    fn drop(&mut self) {
        let dev = &self.em_device_data.disp.dev;
        for memory in &self.em_memories[..self.em_num_memories] {
            if *memory != vk::DeviceMemory::null() {
                unsafe { dev.free_memory(*memory, None) };
            }
        }

        /* Close whatever the driver did not take, each unique fd
         * exactly once. */
        let unique = unique_fd_planes(&self.em_fds, self.em_num_planes);
        for plane in 0..self.em_num_planes {
            if unique[plane] && !self.em_imported[plane] && self.em_fds[plane] >= 0 {
                let _ = nix::unistd::close(self.em_fds[plane]);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_fd_planes_are_deduplicated() {
        let fds = [7, 7, 7, -1];
        let unique = unique_fd_planes(&fds, 3);
        assert_eq!(&unique[..3], &[true, false, false]);
    }

    #[test]
    fn distinct_fds_are_all_unique() {
        let fds = [3, 4, 5, -1];
        let unique = unique_fd_planes(&fds, 3);
        assert_eq!(&unique[..3], &[true, true, true]);
    }

    #[test]
    fn mixed_sharing_counts_first_occurrence_only() {
        let fds = [3, 4, 3, 4];
        let unique = unique_fd_planes(&fds, 4);
        assert_eq!(unique, [true, true, false, false]);
    }
}
