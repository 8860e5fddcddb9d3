// SPDX-License-Identifier: GPL-3.0-only

//! In-memory FIMC node
//!
//! A [`VirtualDevice`] behaves like one of the four pipeline nodes:
//!
//! - as the capture node it produces paced frames into its queued slots,
//!   with compressed main/thumbnail payloads when streaming JPEG;
//! - as a reshaping node it accepts the output/overlay setup and completes
//!   every queued pass immediately.
//!
//! Every call is recorded with a timestamp so tests can assert ordering.

use super::memory::{HeapMemory, MemoryTable};
use crate::backends::camera::frame_loop::lock;
use crate::backends::camera::memory::SharedMemory;
use crate::backends::camera::types::{
    BufferQueue, DeviceInfo, Geometry, NodeId, PixelFormat, PlaneAddresses, Rect,
};
use crate::backends::camera::v4l2_controls::ControlIds;
use crate::backends::camera::{DeviceResult, VideoDevice};
use crate::constants::sensor;
use crate::errors::DeviceError;
use crate::pipelines::output::buffer_length;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::debug;

/// Physical base of the capture node's buffer memory
pub const CAPTURE_BASE_ADDRESS: u32 = 0x4000_0000;

/// Slot size used while streaming compressed frames
pub const JPEG_SLOT_LENGTH: usize = 0x10_0000;
/// Where the compressed main image sits in a JPEG slot
pub const JPEG_MAIN_OFFSET: usize = 0;
/// Where the compressed thumbnail sits in a JPEG slot
pub const JPEG_THUMB_OFFSET: usize = 0x8_0000;

const JPEG_MAIN_SIZE: usize = 4096;
const JPEG_THUMB_SIZE: usize = 1024;

/// A recorded device call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceCall {
    Open,
    SetFormat {
        queue: BufferQueue,
        geometry: Geometry,
        format: PixelFormat,
        field: u32,
        mode: u32,
    },
    SetWindow(Rect),
    SetCrop(Rect),
    SetFramebuffer {
        base: u32,
        geometry: Geometry,
    },
    SetDestination(PlaneAddresses),
    RequestBuffers {
        queue: BufferQueue,
        count: u32,
    },
    QueueBuffer {
        queue: BufferQueue,
        index: u32,
    },
    DequeueBuffer {
        queue: BufferQueue,
        index: u32,
    },
    StreamOn(BufferQueue),
    StreamOff(BufferQueue),
    SetFrameRate(u32),
    SetControl {
        id: u32,
        value: i32,
    },
}

/// Tunables of a virtual node
#[derive(Debug, Clone)]
pub struct VirtualNodeConfig {
    /// Formats the capture queue enumerates
    pub formats: Vec<PixelFormat>,
    /// Largest buffer count `request_buffers` accepts
    pub max_buffers: u32,
    /// Frame pacing override, otherwise `1 / fps`
    pub frame_interval: Option<Duration>,
    /// Reserved memory region `(base, size)` of a reshaping node
    pub reserved_memory: Option<(u32, usize)>,
}

impl Default for VirtualNodeConfig {
    fn default() -> Self {
        Self {
            formats: PixelFormat::ALL.to_vec(),
            max_buffers: 8,
            frame_interval: None,
            reserved_memory: None,
        }
    }
}

#[derive(Default)]
struct NodeState {
    capture_geometry: Geometry,
    capture_format: Option<PixelFormat>,
    output_geometry: Geometry,
    output_format: Option<PixelFormat>,
    framebuffer_base: u32,
    buffer_count: u32,
    stride: usize,
    memory: Option<Arc<HeapMemory>>,
    queued: VecDeque<u32>,
    pending_output: VecDeque<u32>,
    streaming: HashSet<u32>,
    fps: u32,
    last_frame: Option<Instant>,
    frames: u64,
    controls: HashMap<u32, i32>,
    focus_results: VecDeque<i32>,
    failing_controls: HashSet<u32>,
    failing_ops: HashSet<&'static str>,
    calls: Vec<(Instant, DeviceCall)>,
}

/// In-memory stand-in for one V4L2 node
pub struct VirtualDevice {
    node: NodeId,
    token: i32,
    ids: ControlIds,
    config: Mutex<VirtualNodeConfig>,
    table: Arc<MemoryTable>,
    state: Mutex<NodeState>,
}

impl VirtualDevice {
    pub fn new(node: NodeId, ids: ControlIds, table: Arc<MemoryTable>) -> Self {
        let state = NodeState {
            fps: 30,
            ..NodeState::default()
        };

        Self {
            node,
            token: 10 + node.index() as i32,
            ids,
            config: Mutex::new(VirtualNodeConfig::default()),
            table,
            state: Mutex::new(state),
        }
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Adjust the node's tunables
    pub fn configure(&self, apply: impl FnOnce(&mut VirtualNodeConfig)) {
        apply(&mut lock(&self.config));
    }

    /// Called by the provider on every open
    pub(super) fn reopen(&self) {
        let reserved = lock(&self.config).reserved_memory;
        let mut state = lock(&self.state);
        state.streaming.clear();
        state.queued.clear();
        state.pending_output.clear();
        state.buffer_count = 0;

        if let Some((base, size)) = reserved {
            state.controls.insert(self.ids.reserved_mem_base, base as i32);
            state
                .controls
                .insert(self.ids.reserved_mem_size, (size / 1024) as i32);
            self.table.publish(self.token, Arc::new(HeapMemory::new(size)));
        } else {
            state.controls.insert(self.ids.reserved_mem_base, 0);
            state.controls.insert(self.ids.reserved_mem_size, 0);
        }
        state.controls.insert(self.ids.fimc_version, 0x51);

        state.calls.push((Instant::now(), DeviceCall::Open));
    }

    /// Results returned by successive `AUTO_FOCUS_RESULT` reads
    pub fn push_focus_results(&self, results: &[i32]) {
        lock(&self.state).focus_results.extend(results.iter().copied());
    }

    /// Make a control fail on get and set
    pub fn fail_control(&self, id: u32) {
        lock(&self.state).failing_controls.insert(id);
    }

    /// Make an operation fail, by method name (e.g. `"stream_on"`)
    pub fn fail_op(&self, op: &'static str) {
        lock(&self.state).failing_ops.insert(op);
    }

    pub fn clear_failures(&self) {
        let mut state = lock(&self.state);
        state.failing_controls.clear();
        state.failing_ops.clear();
    }

    /// Current value of a control as last set
    pub fn control(&self, id: u32) -> Option<i32> {
        lock(&self.state).controls.get(&id).copied()
    }

    /// Snapshot of the recorded calls
    pub fn calls(&self) -> Vec<(Instant, DeviceCall)> {
        lock(&self.state).calls.clone()
    }

    pub fn clear_calls(&self) {
        lock(&self.state).calls.clear();
    }

    /// Number of frames produced since creation
    pub fn frames_produced(&self) -> u64 {
        lock(&self.state).frames
    }

    pub fn is_streaming(&self, queue: BufferQueue) -> bool {
        lock(&self.state).streaming.contains(&queue.raw())
    }

    /// Capture geometry and format last set
    pub fn capture_format(&self) -> Option<(Geometry, PixelFormat)> {
        let state = lock(&self.state);
        state.capture_format.map(|f| (state.capture_geometry, f))
    }

    fn check(&self, state: &NodeState, op: &'static str) -> DeviceResult<()> {
        if state.failing_ops.contains(op) {
            return Err(DeviceError::Ioctl {
                request: op,
                reason: "injected failure".to_string(),
            });
        }
        Ok(())
    }

    fn frame_interval(&self, state: &NodeState) -> Duration {
        lock(&self.config)
            .frame_interval
            .unwrap_or_else(|| Duration::from_millis(1000 / u64::from(state.fps.max(1))))
    }

    /// Write a synthetic frame into slot `index`
    fn produce(&self, state: &mut NodeState, index: u32) {
        state.frames += 1;
        let Some(memory) = state.memory.clone() else {
            return;
        };
        let offset = index as usize * state.stride;
        let memory: &dyn SharedMemory = memory.as_ref();

        if state.capture_format == Some(PixelFormat::Jpeg) {
            let main = synthetic_jpeg(JPEG_MAIN_SIZE, state.frames as u8);
            let thumb = synthetic_jpeg(JPEG_THUMB_SIZE, state.frames as u8);
            let _ = memory.write(offset + JPEG_MAIN_OFFSET, &main);
            let _ = memory.write(offset + JPEG_THUMB_OFFSET, &thumb);
            state.controls.insert(self.ids.jpeg_main_size, main.len() as i32);
            state
                .controls
                .insert(self.ids.jpeg_main_offset, JPEG_MAIN_OFFSET as i32);
            state.controls.insert(self.ids.jpeg_thumb_size, thumb.len() as i32);
            state
                .controls
                .insert(self.ids.jpeg_thumb_offset, JPEG_THUMB_OFFSET as i32);
        } else {
            let pattern = vec![(state.frames % 251) as u8 + 1; state.stride];
            let _ = memory.write(offset, &pattern);
        }
    }
}

/// SOI, filler, EOI
fn synthetic_jpeg(size: usize, fill: u8) -> Vec<u8> {
    let mut data = vec![fill; size];
    data[0] = 0xFF;
    data[1] = 0xD8;
    data[size - 2] = 0xFF;
    data[size - 1] = 0xD9;
    data
}

impl VideoDevice for VirtualDevice {
    fn query_capabilities(&self, _queue: BufferQueue) -> DeviceResult<DeviceInfo> {
        let state = lock(&self.state);
        self.check(&state, "query_capabilities")?;
        Ok(DeviceInfo {
            path: format!("virtual:{}", self.node),
            driver: "virtual-fimc".to_string(),
            card: format!("Virtual FIMC {}", self.node.index()),
            capabilities: 0x7,
        })
    }

    fn enum_format(&self, _queue: BufferQueue, format: PixelFormat) -> DeviceResult<bool> {
        let state = lock(&self.state);
        self.check(&state, "enum_format")?;
        Ok(lock(&self.config).formats.contains(&format))
    }

    fn set_format(
        &self,
        queue: BufferQueue,
        geometry: Geometry,
        format: PixelFormat,
        field: u32,
        mode: u32,
    ) -> DeviceResult<()> {
        let mut state = lock(&self.state);
        self.check(&state, "set_format")?;
        match queue {
            BufferQueue::Capture => {
                state.capture_geometry = geometry;
                state.capture_format = Some(format);
            }
            BufferQueue::Output => {
                state.output_geometry = geometry;
                state.output_format = Some(format);
            }
            _ => {}
        }
        state.calls.push((
            Instant::now(),
            DeviceCall::SetFormat {
                queue,
                geometry,
                format,
                field,
                mode,
            },
        ));
        Ok(())
    }

    fn get_format(&self, queue: BufferQueue) -> DeviceResult<(Geometry, PixelFormat)> {
        let state = lock(&self.state);
        self.check(&state, "get_format")?;
        let (geometry, format) = match queue {
            BufferQueue::Output => (state.output_geometry, state.output_format),
            _ => (state.capture_geometry, state.capture_format),
        };
        Ok((geometry, format.unwrap_or(PixelFormat::Nv21)))
    }

    fn set_window(&self, window: Rect) -> DeviceResult<()> {
        let mut state = lock(&self.state);
        self.check(&state, "set_window")?;
        state.calls.push((Instant::now(), DeviceCall::SetWindow(window)));
        Ok(())
    }

    fn set_crop(&self, _queue: BufferQueue, crop: Rect) -> DeviceResult<()> {
        let mut state = lock(&self.state);
        self.check(&state, "set_crop")?;
        state.calls.push((Instant::now(), DeviceCall::SetCrop(crop)));
        Ok(())
    }

    fn get_framebuffer(&self) -> DeviceResult<u32> {
        let state = lock(&self.state);
        self.check(&state, "get_framebuffer")?;
        Ok(state.framebuffer_base)
    }

    fn set_framebuffer(
        &self,
        base: u32,
        geometry: Geometry,
        _format: PixelFormat,
    ) -> DeviceResult<()> {
        let mut state = lock(&self.state);
        self.check(&state, "set_framebuffer")?;
        state.framebuffer_base = base;
        state
            .calls
            .push((Instant::now(), DeviceCall::SetFramebuffer { base, geometry }));
        Ok(())
    }

    fn set_destination(&self, planes: &PlaneAddresses) -> DeviceResult<()> {
        let mut state = lock(&self.state);
        self.check(&state, "set_destination")?;
        state
            .calls
            .push((Instant::now(), DeviceCall::SetDestination(*planes)));
        Ok(())
    }

    fn request_buffers(&self, queue: BufferQueue, count: u32) -> DeviceResult<u32> {
        let max = lock(&self.config).max_buffers;
        let mut state = lock(&self.state);
        self.check(&state, "request_buffers")?;
        state
            .calls
            .push((Instant::now(), DeviceCall::RequestBuffers { queue, count }));

        if count > max {
            return Err(DeviceError::Ioctl {
                request: "VIDIOC_REQBUFS",
                reason: format!("at most {} buffers", max),
            });
        }

        if queue == BufferQueue::Capture {
            state.buffer_count = count;
            state.queued.clear();
            if count == 0 {
                state.memory = None;
                self.table.withdraw(self.token);
                return Ok(0);
            }

            let stride = match state.capture_format {
                Some(PixelFormat::Jpeg) => JPEG_SLOT_LENGTH,
                Some(format) => {
                    buffer_length(state.capture_geometry, format).unwrap_or(JPEG_SLOT_LENGTH)
                }
                None => JPEG_SLOT_LENGTH,
            };
            state.stride = stride;
            let memory = Arc::new(HeapMemory::new(stride * count as usize));
            state.memory = Some(Arc::clone(&memory));
            self.table.publish(self.token, memory);
        }

        Ok(count)
    }

    fn query_buffer(&self, queue: BufferQueue, index: u32) -> DeviceResult<u32> {
        let state = lock(&self.state);
        self.check(&state, "query_buffer")?;
        if queue == BufferQueue::Capture && index >= state.buffer_count {
            return Err(DeviceError::Ioctl {
                request: "VIDIOC_QUERYBUF",
                reason: format!("index {} out of range", index),
            });
        }
        Ok(state.stride as u32)
    }

    fn queue_buffer(
        &self,
        queue: BufferQueue,
        index: u32,
        _planes: Option<&PlaneAddresses>,
    ) -> DeviceResult<()> {
        let mut state = lock(&self.state);
        self.check(&state, "queue_buffer")?;
        match queue {
            BufferQueue::Capture => {
                if index >= state.buffer_count {
                    return Err(DeviceError::Ioctl {
                        request: "VIDIOC_QBUF",
                        reason: format!("index {} out of range", index),
                    });
                }
                if !state.queued.contains(&index) {
                    state.queued.push_back(index);
                }
            }
            _ => state.pending_output.push_back(index),
        }
        state
            .calls
            .push((Instant::now(), DeviceCall::QueueBuffer { queue, index }));
        Ok(())
    }

    fn dequeue_buffer(&self, queue: BufferQueue) -> DeviceResult<Option<u32>> {
        let interval = {
            let state = lock(&self.state);
            self.frame_interval(&state)
        };
        let mut state = lock(&self.state);
        self.check(&state, "dequeue_buffer")?;

        if !state.streaming.contains(&queue.raw()) {
            return Ok(None);
        }

        let index = match queue {
            BufferQueue::Capture => {
                let due = state
                    .last_frame
                    .map(|last| last.elapsed() >= interval)
                    .unwrap_or(true);
                if !due {
                    return Ok(None);
                }
                let Some(index) = state.queued.pop_front() else {
                    return Ok(None);
                };
                state.last_frame = Some(Instant::now());
                self.produce(&mut state, index);
                index
            }
            _ => match state.pending_output.pop_front() {
                Some(index) => index,
                None => return Ok(None),
            },
        };

        state
            .calls
            .push((Instant::now(), DeviceCall::DequeueBuffer { queue, index }));
        Ok(Some(index))
    }

    fn stream_on(&self, queue: BufferQueue) -> DeviceResult<()> {
        let mut state = lock(&self.state);
        self.check(&state, "stream_on")?;
        state.streaming.insert(queue.raw());
        state.last_frame = None;
        state.calls.push((Instant::now(), DeviceCall::StreamOn(queue)));
        Ok(())
    }

    fn stream_off(&self, queue: BufferQueue) -> DeviceResult<()> {
        let mut state = lock(&self.state);
        self.check(&state, "stream_off")?;
        state.streaming.remove(&queue.raw());
        state.calls.push((Instant::now(), DeviceCall::StreamOff(queue)));
        Ok(())
    }

    fn set_frame_rate(&self, fps: u32) -> DeviceResult<()> {
        let mut state = lock(&self.state);
        self.check(&state, "set_frame_rate")?;
        state.fps = fps;
        state.calls.push((Instant::now(), DeviceCall::SetFrameRate(fps)));
        Ok(())
    }

    fn get_control(&self, id: u32) -> DeviceResult<i32> {
        let mut state = lock(&self.state);
        if state.failing_controls.contains(&id) {
            return Err(DeviceError::Control {
                id,
                reason: "injected failure".to_string(),
            });
        }

        if id == self.ids.auto_focus_result {
            let result = state
                .focus_results
                .pop_front()
                .unwrap_or(sensor::AF_STATUS_SUCCESS);
            return Ok(result);
        }

        Ok(state.controls.get(&id).copied().unwrap_or(0))
    }

    fn set_control(&self, id: u32, value: i32) -> DeviceResult<i32> {
        let mut state = lock(&self.state);
        if state.failing_controls.contains(&id) {
            return Err(DeviceError::Control {
                id,
                reason: "injected failure".to_string(),
            });
        }
        state
            .calls
            .push((Instant::now(), DeviceCall::SetControl { id, value }));

        // Address queries answer with the physical address of a slot
        if id == self.ids.paddr_y && self.node == NodeId::Capture {
            if state.memory.is_none() || value < 0 || value as u32 >= state.buffer_count.max(1) {
                return Ok(0);
            }
            let address = CAPTURE_BASE_ADDRESS + value as u32 * state.stride as u32;
            return Ok(address as i32);
        }
        if id == self.ids.paddr_cbcr && self.node == NodeId::Capture {
            let address = CAPTURE_BASE_ADDRESS
                + value.max(0) as u32 * state.stride as u32
                + state.capture_geometry.area() as u32;
            return Ok(address as i32);
        }

        state.controls.insert(id, value);
        debug!(node = %self.node, id, value, "Virtual control set");
        Ok(value)
    }

    fn poll(&self, timeout: Duration) -> DeviceResult<bool> {
        let (wait, ready) = {
            let state = lock(&self.state);
            self.check(&state, "poll")?;
            if !state.streaming.contains(&BufferQueue::Capture.raw()) || state.queued.is_empty() {
                (timeout, false)
            } else {
                let interval = self.frame_interval(&state);
                let remaining = state
                    .last_frame
                    .map(|last| interval.saturating_sub(last.elapsed()))
                    .unwrap_or_default();
                if remaining > timeout {
                    (timeout, false)
                } else {
                    (remaining, true)
                }
            }
        };

        // Idle waits are shortened so stop requests are noticed quickly
        let wait = if ready { wait } else { wait.min(Duration::from_millis(50)) };
        std::thread::sleep(wait);
        Ok(ready)
    }

    fn memory_token(&self) -> i32 {
        self.token
    }
}
