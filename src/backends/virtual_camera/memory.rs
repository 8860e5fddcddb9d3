// SPDX-License-Identifier: GPL-3.0-only

//! Heap-backed memory for the virtual backend
//!
//! Virtual nodes publish their buffer memory in a [`MemoryTable`] under their
//! token, the same way a real node's memory is reachable through its file
//! descriptor. [`HeapAllocator`] resolves tokens against that table.

use crate::backends::camera::frame_loop::lock;
use crate::backends::camera::memory::{
    ContiguousAllocator, ContiguousRegion, MemoryAllocator, SharedMemory,
};
use crate::errors::DeviceError;
use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Zero-initialised heap buffer
pub struct HeapMemory {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: access to the content is coordinated by the pipeline's busy flags,
// like any memory shared with hardware
unsafe impl Send for HeapMemory {}
unsafe impl Sync for HeapMemory {}

impl HeapMemory {
    pub fn new(len: usize) -> Self {
        let data: &'static mut [u8] = Box::leak(vec![0u8; len].into_boxed_slice());
        Self {
            ptr: NonNull::from(data).cast::<u8>(),
            len,
        }
    }
}

impl SharedMemory for HeapMemory {
    fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    fn len(&self) -> usize {
        self.len
    }
}

impl Drop for HeapMemory {
    fn drop(&mut self) {
        // SAFETY: ptr and len come from the boxed slice leaked in `new`
        unsafe {
            drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(
                self.ptr.as_ptr(),
                self.len,
            )));
        }
    }
}

/// Memory published by virtual nodes and regions, by token
#[derive(Default)]
pub struct MemoryTable {
    entries: Mutex<HashMap<i32, Arc<HeapMemory>>>,
}

impl MemoryTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish `memory` under `token`, replacing what was there
    pub fn publish(&self, token: i32, memory: Arc<HeapMemory>) {
        lock(&self.entries).insert(token, memory);
    }

    pub fn withdraw(&self, token: i32) {
        lock(&self.entries).remove(&token);
    }

    pub fn get(&self, token: i32) -> Option<Arc<HeapMemory>> {
        lock(&self.entries).get(&token).cloned()
    }
}

/// Allocator counterpart of `MmapAllocator` for the virtual backend
pub struct HeapAllocator {
    table: Arc<MemoryTable>,
    requests: AtomicUsize,
}

impl HeapAllocator {
    pub fn new(table: Arc<MemoryTable>) -> Self {
        Self {
            table,
            requests: AtomicUsize::new(0),
        }
    }

    /// Number of successful requests so far
    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

impl MemoryAllocator for HeapAllocator {
    fn request(
        &self,
        token: i32,
        buffer_size: usize,
        buffer_count: usize,
    ) -> Result<Arc<dyn SharedMemory>, DeviceError> {
        let len = buffer_size
            .checked_mul(buffer_count)
            .filter(|len| *len > 0)
            .ok_or_else(|| DeviceError::Memory(format!("invalid size {}x{}", buffer_size, buffer_count)))?;

        let memory: Arc<dyn SharedMemory> = if token >= 0 {
            let published = self
                .table
                .get(token)
                .ok_or_else(|| DeviceError::Memory(format!("nothing to map for token {}", token)))?;
            if published.len() < len {
                return Err(DeviceError::Memory(format!(
                    "token {} has {} bytes, {} requested",
                    token,
                    published.len(),
                    len
                )));
            }
            published
        } else {
            Arc::new(HeapMemory::new(len))
        };

        self.requests.fetch_add(1, Ordering::SeqCst);
        debug!(token, len, "Virtual memory request");
        Ok(memory)
    }
}

/// Contiguous allocator test double handing out fake physical addresses
pub struct VirtualContiguous {
    table: Arc<MemoryTable>,
    next_token: AtomicI32,
    /// Regions currently allocated, by token
    live: Mutex<HashMap<i32, u32>>,
    next_phys: Mutex<u32>,
}

/// Tokens of contiguous regions start here to stay clear of node tokens
const CONTIGUOUS_TOKEN_BASE: i32 = 1000;

impl VirtualContiguous {
    pub fn new(table: Arc<MemoryTable>) -> Self {
        Self {
            table,
            next_token: AtomicI32::new(CONTIGUOUS_TOKEN_BASE),
            live: Mutex::new(HashMap::new()),
            next_phys: Mutex::new(0x6000_0000),
        }
    }

    /// Number of regions allocated and not yet freed
    pub fn live_regions(&self) -> usize {
        lock(&self.live).len()
    }
}

impl ContiguousAllocator for VirtualContiguous {
    fn alloc(&self, size: usize) -> Result<ContiguousRegion, DeviceError> {
        if size == 0 {
            return Err(DeviceError::Memory("zero-sized contiguous region".to_string()));
        }

        let token = self.next_token.fetch_add(1, Ordering::SeqCst);
        let phys = {
            let mut next = lock(&self.next_phys);
            let phys = *next;
            *next = next.wrapping_add(crate::constants::memory::align(size) as u32);
            phys
        };

        self.table.publish(token, Arc::new(HeapMemory::new(size)));
        lock(&self.live).insert(token, phys);

        Ok(ContiguousRegion {
            token,
            size,
            handle: token as u64,
        })
    }

    fn free(&self, region: &ContiguousRegion) {
        self.table.withdraw(region.token);
        lock(&self.live).remove(&region.token);
    }

    fn phys(&self, region: &ContiguousRegion) -> Result<u32, DeviceError> {
        lock(&self.live)
            .get(&region.token)
            .copied()
            .ok_or_else(|| DeviceError::Memory(format!("region {} is not allocated", region.token)))
    }

    fn flush(&self, region: &ContiguousRegion) -> Result<(), DeviceError> {
        self.phys(region).map(|_| ())
    }
}
