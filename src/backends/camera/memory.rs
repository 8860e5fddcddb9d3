// SPDX-License-Identifier: GPL-3.0-only

//! Shared and contiguous memory collaborators
//!
//! Every buffer handed to the host (preview frames, compressed pictures,
//! recording records) comes from a [`MemoryAllocator`]. The pipeline never
//! allocates host-visible memory on its own. Memory is released when the last
//! `Arc<dyn SharedMemory>` is dropped.

use crate::errors::DeviceError;
use std::os::unix::io::RawFd;
use std::ptr::NonNull;
use std::sync::Arc;
use tracing::{debug, warn};

/// A mapped memory region shared with the host or the hardware
///
/// Implementors guarantee that `as_ptr()` stays valid for `len()` bytes for
/// as long as the value is alive.
pub trait SharedMemory: Send + Sync {
    /// Base of the mapping
    fn as_ptr(&self) -> *mut u8;

    /// Size of the mapping in bytes
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl dyn SharedMemory {
    /// Borrow `len` bytes at `offset`, if in bounds
    pub fn read(&self, offset: usize, len: usize) -> Option<&[u8]> {
        let end = offset.checked_add(len)?;
        if end > self.len() {
            return None;
        }
        // SAFETY: bounds checked above, mapping valid for self's lifetime
        Some(unsafe { std::slice::from_raw_parts(self.as_ptr().add(offset), len) })
    }

    /// Copy `data` into the mapping at `offset`
    pub fn write(&self, offset: usize, data: &[u8]) -> Result<(), DeviceError> {
        let end = offset.checked_add(data.len());
        match end {
            Some(end) if end <= self.len() => {
                // SAFETY: bounds checked, source and mapping never overlap
                unsafe {
                    std::ptr::copy_nonoverlapping(data.as_ptr(), self.as_ptr().add(offset), data.len());
                }
                Ok(())
            }
            _ => Err(DeviceError::Memory(format!(
                "write of {} bytes at {} exceeds mapping of {} bytes",
                data.len(),
                offset,
                self.len()
            ))),
        }
    }
}

/// Host-side shared memory allocator
pub trait MemoryAllocator: Send + Sync {
    /// Map `buffer_count` buffers of `buffer_size` bytes
    ///
    /// A non-negative `token` is a file descriptor whose memory should be
    /// mapped (a device node or a contiguous region). A negative token asks
    /// for fresh anonymous shared memory.
    fn request(
        &self,
        token: i32,
        buffer_size: usize,
        buffer_count: usize,
    ) -> Result<Arc<dyn SharedMemory>, DeviceError>;
}

/// DMA-capable region handed out by a [`ContiguousAllocator`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContiguousRegion {
    /// Token to pass to [`MemoryAllocator::request`] to map the region
    pub token: i32,
    pub size: usize,
    /// Allocator-specific handle
    pub handle: u64,
}

/// Physically contiguous memory allocator (ION-style)
pub trait ContiguousAllocator: Send + Sync {
    fn alloc(&self, size: usize) -> Result<ContiguousRegion, DeviceError>;
    fn free(&self, region: &ContiguousRegion);
    fn phys(&self, region: &ContiguousRegion) -> Result<u32, DeviceError>;
    fn flush(&self, region: &ContiguousRegion) -> Result<(), DeviceError>;
}

/// An `mmap`ed region, unmapped on drop
pub struct MappedMemory {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: the mapping is plain shared memory, synchronisation of its content
// is the pipeline's busy-flag protocol
unsafe impl Send for MappedMemory {}
unsafe impl Sync for MappedMemory {}

impl MappedMemory {
    /// Map `len` bytes of `fd` at offset 0
    fn map(fd: RawFd, len: usize) -> Result<Self, DeviceError> {
        if len == 0 {
            return Err(DeviceError::Memory("zero-sized mapping".to_string()));
        }

        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(DeviceError::Memory(std::io::Error::last_os_error().to_string()));
        }

        NonNull::new(ptr as *mut u8)
            .map(|ptr| MappedMemory { ptr, len })
            .ok_or_else(|| DeviceError::Memory("mmap returned null".to_string()))
    }
}

impl SharedMemory for MappedMemory {
    fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    fn len(&self) -> usize {
        self.len
    }
}

impl Drop for MappedMemory {
    fn drop(&mut self) {
        let rc = unsafe { libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len) };
        if rc < 0 {
            warn!(len = self.len, errno = ?std::io::Error::last_os_error(), "munmap failed");
        }
    }
}

/// Allocator backed by `mmap` of device nodes and anonymous `memfd`s
#[derive(Debug, Default, Clone, Copy)]
pub struct MmapAllocator;

impl MemoryAllocator for MmapAllocator {
    fn request(
        &self,
        token: i32,
        buffer_size: usize,
        buffer_count: usize,
    ) -> Result<Arc<dyn SharedMemory>, DeviceError> {
        let len = buffer_size
            .checked_mul(buffer_count)
            .ok_or_else(|| DeviceError::Memory("requested size overflows".to_string()))?;

        if token >= 0 {
            debug!(fd = token, len, "Mapping device memory");
            return Ok(Arc::new(MappedMemory::map(token, len)?));
        }

        let name = c"camera-pipeline";
        let fd = unsafe { libc::memfd_create(name.as_ptr(), libc::MFD_CLOEXEC) };
        if fd < 0 {
            return Err(DeviceError::Memory(std::io::Error::last_os_error().to_string()));
        }

        let result = if unsafe { libc::ftruncate(fd, len as libc::off_t) } < 0 {
            Err(DeviceError::Memory(std::io::Error::last_os_error().to_string()))
        } else {
            MappedMemory::map(fd, len)
        };

        // The mapping keeps the memory alive on its own
        unsafe { libc::close(fd) };

        debug!(len, "Mapped anonymous shared memory");
        Ok(Arc::new(result?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_anonymous_mapping_roundtrip() {
        let memory = MmapAllocator.request(-1, 64, 2).unwrap();
        assert_eq!(memory.len(), 128);

        memory.write(100, &[1, 2, 3]).unwrap();
        assert_eq!(memory.read(100, 3), Some(&[1u8, 2, 3][..]));
    }

    #[test]
    fn test_out_of_bounds_access() {
        let memory = MmapAllocator.request(-1, 16, 1).unwrap();
        assert!(memory.read(10, 10).is_none());
        assert!(memory.write(15, &[0, 0]).is_err());
        assert!(memory.read(usize::MAX, 2).is_none());
    }

    #[test]
    fn test_zero_size_rejected() {
        assert!(MmapAllocator.request(-1, 0, 4).is_err());
    }
}
