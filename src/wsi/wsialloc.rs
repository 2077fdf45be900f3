// Window-system agnostic dma-buf allocation
//
// Presentable images are backed by dma-bufs so the compositor or the
// display controller can scan them out directly. GBM does the actual
// allocation: it understands format modifiers and produces buffers
// the rest of the DRM world can import.
//
// The allocation contract: the caller hands in a list of candidate
// fourcc/modifier pairs, the allocator picks the first it can satisfy
// and reports per-plane fds, strides and offsets. The same fd may
// back several planes, in which case offsets tell them apart and the
// fd must only be closed once.
use std::convert::TryFrom;
use std::fs::{File, OpenOptions};
use std::os::unix::io::{IntoRawFd, RawFd};

use gbm::{BufferObjectFlags, Device as GbmDevice, Format as GbmFormat, Modifier};

use crate::{Result, WsiError};
use utils::log;

pub const MAX_PLANES: usize = 4;

/// The format requires one memory allocation shared by all planes.
pub const WSIALLOC_FORMAT_NON_DISJOINT: u64 = 0x1;

bitflags::bitflags! {
    pub struct AllocFlags: u64 {
        /// Allocate from protected memory.
        const PROTECTED = 0x1;
        /// Select a format and compute the layout without keeping
        /// any memory around.
        const NO_MEMORY = 0x2;
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct WsiallocFormat {
    pub fourcc: u32,
    pub modifier: u64,
    pub flags: u64,
}

#[derive(Debug)]
pub struct AllocationResult {
    pub format: WsiallocFormat,
    pub average_row_strides: [i32; MAX_PLANES],
    pub offsets: [u32; MAX_PLANES],
    /// Owned by the caller. -1 marks unused planes; a probe
    /// allocation reports -1 everywhere.
    pub buffer_fds: [RawFd; MAX_PLANES],
    pub is_disjoint: bool,
}

impl AllocationResult {
    /// How many planes the selected format occupies, deduced from
    /// the filled stride slots.
    pub fn num_planes(&self) -> usize {
        self.average_row_strides
            .iter()
            .take_while(|stride| **stride >= 0)
            .count()
            .max(1)
    }
}

pub struct WsiAllocator {
    wa_gbm: GbmDevice<File>,
}

fn open_allocator_node() -> Result<File> {
    let env = std::env::var("WSI_ALLOC_DRI_DEV").ok();
    let candidates: Vec<&str> = match env.as_deref() {
        Some(path) => vec![path],
        None => vec!["/dev/dri/renderD128", "/dev/dri/card0"],
    };

    for candidate in candidates {
        match OpenOptions::new().read(true).write(true).open(candidate) {
            Ok(file) => return Ok(file),
            Err(e) => log::info!("Could not open {}: {}", candidate, e),
        }
    }

    log::error!("No usable DRM node for buffer allocation");
    Err(WsiError::INITIALIZATION_FAILED)
}

impl WsiAllocator {
    pub fn new() -> Result<WsiAllocator> {
        let node = open_allocator_node()?;
        let gbm = GbmDevice::new(node).map_err(|e| {
            log::error!("Could not create GBM device: {}", e);
            WsiError::INITIALIZATION_FAILED
        })?;

        Ok(WsiAllocator { wa_gbm: gbm })
    }

    /// Allocate a buffer of `width` x `height`, choosing the first
    /// candidate format GBM can satisfy.
    pub fn alloc(
        &self,
        formats: &[WsiallocFormat],
        width: u32,
        height: u32,
        flags: AllocFlags,
    ) -> Result<AllocationResult> {
        if formats.is_empty() || width == 0 || height == 0 {
            return Err(WsiError::FORMAT_NOT_SUPPORTED);
        }

        let mut bo_flags = BufferObjectFlags::SCANOUT | BufferObjectFlags::RENDERING;
        if flags.contains(AllocFlags::PROTECTED) {
            bo_flags |= BufferObjectFlags::PROTECTED;
        }

        for candidate in formats {
            let gbm_format = match GbmFormat::try_from(candidate.fourcc) {
                Ok(format) => format,
                Err(_) => continue,
            };

            let bo = match self.wa_gbm.create_buffer_object_with_modifiers2::<()>(
                width,
                height,
                gbm_format,
                std::iter::once(Modifier::from(candidate.modifier)),
                bo_flags,
            ) {
                Ok(bo) => bo,
                Err(_) => continue,
            };

            let plane_count = bo.plane_count().map_err(|_| WsiError::OUT_OF_HOST_MEMORY)? as usize;
            assert!(plane_count <= MAX_PLANES);

            let mut result = AllocationResult {
                format: WsiallocFormat {
                    fourcc: candidate.fourcc,
                    modifier: u64::from(
                        bo.modifier().map_err(|_| WsiError::OUT_OF_HOST_MEMORY)?,
                    ),
                    flags: candidate.flags,
                },
                average_row_strides: [-1; MAX_PLANES],
                offsets: [0; MAX_PLANES],
                buffer_fds: [-1; MAX_PLANES],
                is_disjoint: false,
            };

            for plane in 0..plane_count {
                result.average_row_strides[plane] = bo
                    .stride_for_plane(plane as i32)
                    .map_err(|_| WsiError::OUT_OF_HOST_MEMORY)?
                    as i32;
                result.offsets[plane] = bo
                    .offset(plane as i32)
                    .map_err(|_| WsiError::OUT_OF_HOST_MEMORY)?;
            }

            if !flags.contains(AllocFlags::NO_MEMORY) {
                /* One fd backs every plane of a GBM buffer, with the
                 * per-plane offsets selecting into it. */
                let fd = bo
                    .fd()
                    .map_err(|_| WsiError::OUT_OF_HOST_MEMORY)?
                    .into_raw_fd();
                for plane in 0..plane_count {
                    result.buffer_fds[plane] = fd;
                }
            }

            return Ok(result);
        }

        log::error!("No candidate format could be allocated");
        Err(WsiError::FORMAT_NOT_SUPPORTED)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_rejects_empty_candidate_list() {
        /* Exercised without a device node: the argument check comes
         * first. */
        if let Ok(allocator) = WsiAllocator::new() {
            assert_eq!(
                allocator.alloc(&[], 64, 64, AllocFlags::empty()).unwrap_err(),
                WsiError::FORMAT_NOT_SUPPORTED
            );
        }
    }
}
