// SPDX-License-Identifier: MPL-2.0

//! Metadata records handed to the host while recording
//!
//! In metadata mode the host does not receive frame copies. It gets a small
//! record naming the hardware buffer that holds the frame, and returns it
//! through `release_recording_frame` once its encoder is done.

use crate::backends::camera::memory::{MemoryAllocator, SharedMemory};
use crate::backends::camera::types::PlaneAddresses;
use crate::constants::buffers::RECORDING_BUFFERS_COUNT;
use crate::errors::CameraResult;
use bytemuck::{Pod, Zeroable};
use std::sync::Arc;
use tracing::debug;

/// Record type of a buffer living in camera memory
pub const RECORD_TYPE_CAMERA_SOURCE: u32 = 0;

/// One record as the host reads it
///
/// Four little-endian words: type, output index, luma address and chroma
/// address.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct MetadataRecord {
    pub kind: u32,
    pub index: u32,
    pub y: u32,
    pub cbcr: u32,
}

/// Size of one record in the pool
pub const RECORD_SIZE: usize = std::mem::size_of::<MetadataRecord>();

impl MetadataRecord {
    /// Record for output slot `index` whose planes start at `planes`
    pub fn camera_source(index: u32, planes: PlaneAddresses) -> Self {
        Self {
            kind: RECORD_TYPE_CAMERA_SOURCE,
            index,
            y: planes.y,
            cbcr: planes.cb,
        }
    }

    /// Little-endian wire form
    pub fn to_le_bytes(self) -> [u8; RECORD_SIZE] {
        let le = Self {
            kind: self.kind.to_le(),
            index: self.index.to_le(),
            y: self.y.to_le(),
            cbcr: self.cbcr.to_le(),
        };
        let mut bytes = [0u8; RECORD_SIZE];
        bytes.copy_from_slice(bytemuck::bytes_of(&le));
        bytes
    }

    /// Read a record back from its wire form
    pub fn from_le_bytes(bytes: &[u8]) -> Option<Self> {
        let raw: Self = bytemuck::try_pod_read_unaligned(bytes.get(..RECORD_SIZE)?).ok()?;
        Some(Self {
            kind: u32::from_le(raw.kind),
            index: u32::from_le(raw.index),
            y: u32::from_le(raw.y),
            cbcr: u32::from_le(raw.cbcr),
        })
    }
}

/// Ring of records in host-shared memory
pub struct RecordPool {
    memory: Arc<dyn SharedMemory>,
    count: u32,
    index: u32,
}

impl RecordPool {
    /// Allocate `RECORDING_BUFFERS_COUNT` records
    pub fn allocate(allocator: &dyn MemoryAllocator) -> CameraResult<Self> {
        let memory = allocator.request(-1, RECORD_SIZE, RECORDING_BUFFERS_COUNT as usize)?;
        debug!(count = RECORDING_BUFFERS_COUNT, "Record pool allocated");
        Ok(Self {
            memory,
            count: RECORDING_BUFFERS_COUNT,
            index: 0,
        })
    }

    pub fn memory(&self) -> &Arc<dyn SharedMemory> {
        &self.memory
    }

    /// Record slot the next frame goes to
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    /// Write `record` into the current slot
    pub fn write(&self, record: MetadataRecord) -> CameraResult<()> {
        let offset = RECORD_SIZE * self.index as usize;
        self.memory.write(offset, &record.to_le_bytes())?;
        Ok(())
    }

    /// Record currently in slot `index`
    pub fn read(&self, index: u32) -> Option<MetadataRecord> {
        let bytes = self.memory.read(RECORD_SIZE * index as usize, RECORD_SIZE)?;
        MetadataRecord::from_le_bytes(bytes)
    }

    pub fn advance(&mut self) {
        self.index = (self.index + 1) % self.count;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::virtual_camera::{HeapAllocator, MemoryTable};

    #[test]
    fn test_record_layout() {
        assert_eq!(RECORD_SIZE, 16);
        let record = MetadataRecord {
            kind: 0,
            index: 2,
            y: 0x6000_0000,
            cbcr: 0x6001_0000,
        };
        let bytes = record.to_le_bytes();
        assert_eq!(&bytes[4..8], &[2, 0, 0, 0]);
        assert_eq!(&bytes[8..12], &[0x00, 0x00, 0x00, 0x60]);
        assert_eq!(MetadataRecord::from_le_bytes(&bytes), Some(record));
    }

    #[test]
    fn test_pool_wraps() {
        let allocator = HeapAllocator::new(Arc::new(MemoryTable::new()));
        let mut pool = RecordPool::allocate(&allocator).unwrap();
        assert_eq!(pool.memory().len(), RECORD_SIZE * RECORDING_BUFFERS_COUNT as usize);

        for i in 0..RECORDING_BUFFERS_COUNT {
            let record = MetadataRecord::camera_source(
                i,
                PlaneAddresses {
                    y: i * 0x100,
                    cb: i * 0x100 + 0x80,
                    cr: i * 0x100 + 0x80,
                },
            );
            pool.write(record).unwrap();
            assert_eq!(pool.read(i), Some(record));
            pool.advance();
        }
        assert_eq!(pool.index(), 0);
    }
}
