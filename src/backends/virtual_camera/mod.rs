// SPDX-License-Identifier: GPL-3.0-only

//! Virtual camera backend
//!
//! An in-memory implementation of the device control channel and of the
//! memory collaborators. It drives the full pipeline without hardware and is
//! what the integration tests and the `simulate` command run on.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐     ┌──────────────────┐
//! │ VirtualProvider  │────▶│ VirtualDevice x4 │  ← capture + 3 reshaping nodes
//! └──────────────────┘     └────────┬─────────┘
//!                                   │ publish slot memory by token
//!                                   ▼
//!                          ┌──────────────────┐
//!                          │   MemoryTable    │
//!                          └────────┬─────────┘
//!                                   │ resolve tokens
//!                    ┌──────────────┴──────────────┐
//!                    ▼                             ▼
//!           ┌──────────────────┐         ┌───────────────────┐
//!           │  HeapAllocator   │         │ VirtualContiguous │
//!           └──────────────────┘         └───────────────────┘
//! ```

mod device;
mod memory;

pub use device::{
    CAPTURE_BASE_ADDRESS, DeviceCall, JPEG_MAIN_OFFSET, JPEG_SLOT_LENGTH, JPEG_THUMB_OFFSET,
    VirtualDevice, VirtualNodeConfig,
};
pub use memory::{HeapAllocator, HeapMemory, MemoryTable, VirtualContiguous};

use crate::backends::camera::frame_loop::lock;
use crate::backends::camera::types::NodeId;
use crate::backends::camera::v4l2_controls::ControlIds;
use crate::backends::camera::{DeviceProvider, DeviceResult, VideoDevice};
use crate::errors::DeviceError;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;

const NODES: [NodeId; 4] = [
    NodeId::Capture,
    NodeId::PreviewOutput,
    NodeId::PictureOutput,
    NodeId::RecordingOutput,
];

/// Provider of the four virtual nodes
///
/// Opening a node always hands out the same [`VirtualDevice`], reset to its
/// post-open state, so tests can keep a handle and inspect it.
pub struct VirtualProvider {
    nodes: [Arc<VirtualDevice>; 4],
    table: Arc<MemoryTable>,
    opens: AtomicUsize,
    failing: Mutex<HashSet<NodeId>>,
}

impl VirtualProvider {
    pub fn new(ids: ControlIds) -> Self {
        let table = Arc::new(MemoryTable::new());
        let nodes = NODES.map(|node| Arc::new(VirtualDevice::new(node, ids, Arc::clone(&table))));

        Self {
            nodes,
            table,
            opens: AtomicUsize::new(0),
            failing: Mutex::new(HashSet::new()),
        }
    }

    /// Handle on a node for configuration and inspection
    pub fn node(&self, node: NodeId) -> Arc<VirtualDevice> {
        Arc::clone(&self.nodes[node.index()])
    }

    /// Allocator resolving this provider's node tokens
    pub fn allocator(&self) -> HeapAllocator {
        HeapAllocator::new(Arc::clone(&self.table))
    }

    /// Contiguous allocator sharing this provider's memory table
    pub fn contiguous(&self) -> VirtualContiguous {
        VirtualContiguous::new(Arc::clone(&self.table))
    }

    /// Make every further open of `node` fail
    pub fn fail_open(&self, node: NodeId) {
        lock(&self.failing).insert(node);
    }

    /// Total successful opens across nodes
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

impl DeviceProvider for VirtualProvider {
    fn open(&self, node: NodeId) -> DeviceResult<Arc<dyn VideoDevice>> {
        if lock(&self.failing).contains(&node) {
            return Err(DeviceError::Open {
                path: format!("virtual:{}", node),
                reason: "injected failure".to_string(),
            });
        }

        let device = self.node(node);
        device.reopen();
        self.opens.fetch_add(1, Ordering::SeqCst);
        debug!(%node, "Opened virtual node");
        Ok(device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::camera::memory::MemoryAllocator;
    use crate::backends::camera::types::{BufferQueue, Geometry, PixelFormat};

    #[test]
    fn test_open_returns_same_node() {
        let provider = VirtualProvider::new(ControlIds::default());
        let device = provider.open(NodeId::PreviewOutput).unwrap();
        device
            .set_format(BufferQueue::Output, Geometry::new(8, 8), PixelFormat::Nv21, 1, 0)
            .unwrap();

        let calls = provider.node(NodeId::PreviewOutput).calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(provider.open_count(), 1);
    }

    #[test]
    fn test_fail_open() {
        let provider = VirtualProvider::new(ControlIds::default());
        provider.fail_open(NodeId::RecordingOutput);
        assert!(provider.open(NodeId::RecordingOutput).is_err());
        assert!(provider.open(NodeId::Capture).is_ok());
    }

    #[test]
    fn test_reserved_memory_is_mappable() {
        let provider = VirtualProvider::new(ControlIds::default());
        provider
            .node(NodeId::PreviewOutput)
            .configure(|c| c.reserved_memory = Some((0x5000_0000, 0x10_0000)));
        let device = provider.open(NodeId::PreviewOutput).unwrap();

        let memory = provider
            .allocator()
            .request(device.memory_token(), 0x1000, 16)
            .unwrap();
        assert_eq!(memory.len(), 0x10_0000);
    }
}
