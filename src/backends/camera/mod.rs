// SPDX-License-Identifier: MPL-2.0

//! Device control channel
//!
//! Everything the pipeline needs from the kernel goes through the
//! [`VideoDevice`] trait. Nodes are opened by [`NodeId`] through a
//! [`DeviceProvider`], so the whole pipeline can run against the in-memory
//! backend in `backends::virtual_camera`.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────┐
//! │  Pipelines (paths)  │
//! └──────────┬──────────┘
//!            │
//!            ▼
//! ┌─────────────────────┐
//! │  DeviceProvider     │  ← Opens node 0 (capture) and 1-3 (reshaping)
//! └──────────┬──────────┘
//!            │
//!            ▼
//! ┌─────────────────────┐
//! │  VideoDevice Trait  │  ← ioctl-level interface
//! └──────────┬──────────┘
//!            │
//!       ┌────┴─────┐
//!       ▼          ▼
//!  ┌────────┐ ┌─────────┐
//!  │  V4L2  │ │ Virtual │
//!  └────────┘ └─────────┘
//! ```

pub mod frame_loop;
pub mod memory;
pub mod types;
pub mod v4l2_controls;
pub mod v4l2_device;
pub mod v4l2_utils;

pub use types::*;

use crate::errors::DeviceError;
use std::sync::Arc;
use std::time::Duration;

/// Result type for device calls
pub type DeviceResult<T> = Result<T, DeviceError>;

/// One open V4L2 node
///
/// Methods map one-to-one onto ioctls. Implementations must be safe to call
/// from several pipeline threads; the pipeline serialises calls per node
/// through its own locks.
pub trait VideoDevice: Send + Sync {
    // ===== Identification =====

    /// VIDIOC_QUERYCAP, checking the node supports `queue`
    fn query_capabilities(&self, queue: BufferQueue) -> DeviceResult<DeviceInfo>;

    /// Whether `format` appears in the node's format enumeration for `queue`
    fn enum_format(&self, queue: BufferQueue, format: PixelFormat) -> DeviceResult<bool>;

    // ===== Formats and geometry =====

    /// VIDIOC_S_FMT. `field` and `mode` are only meaningful on the capture
    /// and private queues and are ignored elsewhere.
    fn set_format(
        &self,
        queue: BufferQueue,
        geometry: Geometry,
        format: PixelFormat,
        field: u32,
        mode: u32,
    ) -> DeviceResult<()>;

    /// VIDIOC_G_FMT
    fn get_format(&self, queue: BufferQueue) -> DeviceResult<(Geometry, PixelFormat)>;

    /// VIDIOC_S_FMT on the overlay queue
    fn set_window(&self, window: Rect) -> DeviceResult<()>;

    /// VIDIOC_S_CROP
    fn set_crop(&self, queue: BufferQueue, crop: Rect) -> DeviceResult<()>;

    /// VIDIOC_G_FBUF, returning the framebuffer base address
    fn get_framebuffer(&self) -> DeviceResult<u32>;

    /// VIDIOC_S_FBUF
    fn set_framebuffer(&self, base: u32, geometry: Geometry, format: PixelFormat)
    -> DeviceResult<()>;

    /// Destination planes of the next reshaping pass
    fn set_destination(&self, planes: &PlaneAddresses) -> DeviceResult<()>;

    // ===== Buffers =====

    /// VIDIOC_REQBUFS, returning the count the driver granted
    fn request_buffers(&self, queue: BufferQueue, count: u32) -> DeviceResult<u32>;

    /// VIDIOC_QUERYBUF, returning the slot length
    fn query_buffer(&self, queue: BufferQueue, index: u32) -> DeviceResult<u32>;

    /// VIDIOC_QBUF. `planes` is the user pointer for userptr output queues.
    fn queue_buffer(
        &self,
        queue: BufferQueue,
        index: u32,
        planes: Option<&PlaneAddresses>,
    ) -> DeviceResult<()>;

    /// VIDIOC_DQBUF, `None` when nothing is ready
    fn dequeue_buffer(&self, queue: BufferQueue) -> DeviceResult<Option<u32>>;

    fn stream_on(&self, queue: BufferQueue) -> DeviceResult<()>;

    fn stream_off(&self, queue: BufferQueue) -> DeviceResult<()>;

    /// VIDIOC_S_PARM with a `1/fps` time per frame
    fn set_frame_rate(&self, fps: u32) -> DeviceResult<()>;

    // ===== Controls =====

    fn get_control(&self, id: u32) -> DeviceResult<i32>;

    /// Set a control, returning the value the driver wrote back
    fn set_control(&self, id: u32, value: i32) -> DeviceResult<i32>;

    // ===== Events =====

    /// Wait for a frame. `Ok(false)` on timeout.
    fn poll(&self, timeout: Duration) -> DeviceResult<bool>;

    /// Token handed to the memory allocator to map this node's buffers
    fn memory_token(&self) -> i32;
}

/// Opens the device nodes the pipeline uses
pub trait DeviceProvider: Send + Sync {
    fn open(&self, node: NodeId) -> DeviceResult<Arc<dyn VideoDevice>>;
}
