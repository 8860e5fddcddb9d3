// SPDX-License-Identifier: MPL-2.0

//! Recording path
//!
//! Recording frames always go through the recording output node, which
//! produces them at the recording geometry and format into a small ring.
//! Each ring slot is handed to the host, either directly or as a
//! [`MetadataRecord`] pointing at the slot, and stays in flight until the host
//! releases it. A frame whose ring slot is still held is dropped.
//!
//! While recording, the capture engine keeps its configuration even when
//! other listeners would want another one.

pub mod recorder;

pub use recorder::{MetadataRecord, RECORD_SIZE, RecordPool};

use super::output::{OutputConfig, OutputSession, yuv_planes};
use super::{PipelineContext, select_buffer, timestamp_ns};
use crate::backends::camera::frame_loop::{BusyFlag, Gate, GateWait, LoopAction, WorkerController, lock};
use crate::backends::camera::memory::SharedMemory;
use crate::backends::camera::types::{FrameBuffer, Geometry, NodeId, PixelFormat};
use crate::constants::buffers::RECORDING_BUFFERS_COUNT;
use crate::errors::{CameraError, CameraResult};
use crate::host::msg;
use crate::pipelines::capture::ListenerId;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, error, info, warn};

/// How recording frames reach the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecordingMode {
    /// Output ring buffers are delivered as they are
    #[default]
    Direct,
    /// Small records pointing at the output ring are delivered
    Metadata,
}

#[derive(Default)]
struct RecordingSlot {
    target: Geometry,
    format: Option<PixelFormat>,
    buffer: Option<FrameBuffer>,
    output: Option<OutputSession>,
    pool: Option<RecordPool>,
    /// Output ring slots the host still holds
    held: Vec<bool>,
}

struct Running {
    listener: ListenerId,
    worker: WorkerController,
}

struct RecordingShared {
    ctx: Arc<PipelineContext>,
    slot: Mutex<RecordingSlot>,
    busy: Arc<BusyFlag>,
    gate: Gate,
    mode: Mutex<RecordingMode>,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

/// Recording path
pub struct RecordingPath {
    shared: Arc<RecordingShared>,
    running: Mutex<Option<Running>>,
}

impl RecordingPath {
    pub fn new(ctx: Arc<PipelineContext>) -> Self {
        Self {
            shared: Arc::new(RecordingShared {
                ctx,
                slot: Mutex::new(RecordingSlot::default()),
                busy: Arc::new(BusyFlag::new()),
                gate: Gate::new(),
                mode: Mutex::new(RecordingMode::default()),
                delivered: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            }),
            running: Mutex::new(None),
        }
    }

    pub fn enabled(&self) -> bool {
        lock(&self.running).is_some()
    }

    pub fn mode(&self) -> RecordingMode {
        *lock(&self.shared.mode)
    }

    /// Choose between metadata records and direct buffers
    ///
    /// Refused while recording.
    pub fn store_metadata_in_buffers(&self, enable: bool) -> CameraResult<()> {
        if self.enabled() {
            error!("Recording is running, keeping buffer mode");
            return Err(CameraError::Busy(
                "cannot change buffer mode while recording".to_string(),
            ));
        }
        *lock(&self.shared.mode) = if enable {
            RecordingMode::Metadata
        } else {
            RecordingMode::Direct
        };
        debug!(enable, "Recording buffer mode set");
        Ok(())
    }

    /// Frames handed to the host so far
    pub fn delivered(&self) -> u64 {
        self.shared.delivered.load(Ordering::SeqCst)
    }

    /// Frames dropped because the host held their ring slot
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::SeqCst)
    }

    /// Current output ring slot, if the output runs
    pub fn output_index(&self) -> Option<u32> {
        lock(&self.shared.slot).output.as_ref().map(OutputSession::index)
    }

    /// Record slot the next frame goes to, in metadata mode
    pub fn record_index(&self) -> Option<u32> {
        lock(&self.shared.slot).pool.as_ref().map(RecordPool::index)
    }

    /// Record currently stored in slot `index`, in metadata mode
    pub fn record(&self, index: u32) -> Option<MetadataRecord> {
        lock(&self.shared.slot).pool.as_ref()?.read(index)
    }

    pub fn start(&self) -> CameraResult<()> {
        let mut running = lock(&self.running);
        if running.is_some() {
            error!("Recording was already started!");
            return Err(CameraError::AlreadyEnabled("Recording"));
        }

        let ctx = &self.shared.ctx;
        let settings = ctx.settings();
        let mode = self.mode();

        let pool = match mode {
            RecordingMode::Metadata => Some(RecordPool::allocate(ctx.outputs.allocator.as_ref())?),
            RecordingMode::Direct => None,
        };

        {
            let mut slot = lock(&self.shared.slot);
            *slot = RecordingSlot {
                target: settings.recording,
                format: Some(settings.recording_format),
                pool,
                ..RecordingSlot::default()
            };
        }
        self.shared.busy.clear();
        self.shared.gate.reset();

        let shared = Arc::clone(&self.shared);
        let mut worker = WorkerController::start("recording", ctx.timeouts.worker_join, move |stop| {
            shared.worker_iteration(stop)
        })?;

        let weak: Weak<RecordingShared> = Arc::downgrade(&self.shared);
        let listener = ctx.engine.register(
            settings.recording,
            settings.recording_format,
            Arc::clone(&self.shared.busy),
            Arc::new(move |buffers: &[FrameBuffer]| {
                if let Some(shared) = weak.upgrade() {
                    shared.on_frame(buffers);
                }
            }),
        );

        let listener = match listener {
            Ok(listener) => listener,
            Err(e) => {
                error!(error = %e, "Unable to register recording listener");
                self.shared.gate.shutdown();
                worker.stop();
                lock(&self.shared.slot).pool = None;
                return Err(e);
            }
        };

        ctx.engine.set_recording_active(true);
        *running = Some(Running { listener, worker });
        info!(
            geometry = %settings.recording,
            format = %settings.recording_format,
            ?mode,
            "Recording started"
        );
        Ok(())
    }

    pub fn stop(&self) -> CameraResult<()> {
        let Some(mut running) = lock(&self.running).take() else {
            error!("Recording was already stopped!");
            return Err(CameraError::NotEnabled("Recording"));
        };
        let ctx = &self.shared.ctx;

        // Unregistering renegotiates, which recording no longer holds back
        ctx.engine.set_recording_active(false);
        let unregistered = ctx.engine.unregister(running.listener);

        self.shared.gate.shutdown();
        if !running.worker.stop() {
            warn!("Recording thread is taking too long to end, something is going wrong");
        }

        {
            let mut slot = lock(&self.shared.slot);
            slot.buffer = None;
            if let Some(output) = slot.output.take() {
                output.stop();
            }
            slot.pool = None;
            slot.held.clear();
        }
        self.shared.busy.clear();

        info!("Recording stopped");
        unregistered
    }

    /// Host is done with frame `index`
    pub fn release_frame(&self, index: u32) -> CameraResult<()> {
        if !self.enabled() {
            return Err(CameraError::NotEnabled("Recording"));
        }

        let mut slot = lock(&self.shared.slot);
        let slot = &mut *slot;
        let Some(output) = slot.output.as_mut() else {
            return Err(CameraError::NotEnabled("Recording output"));
        };

        let current = output.index() as usize;
        if let Some(held) = slot.held.get_mut(current) {
            *held = false;
        }
        output.release();
        debug!(index, output = output.index(), "Recording frame released");
        Ok(())
    }
}

impl Drop for RecordingPath {
    fn drop(&mut self) {
        if self.enabled() {
            if let Err(e) = self.stop() {
                warn!(error = %e, "Unable to stop recording on drop");
            }
        }
    }
}

impl RecordingShared {
    fn on_frame(&self, buffers: &[FrameBuffer]) {
        if !self.busy.try_set() {
            debug!("Recording is busy, dropping frame");
            return;
        }

        if let Err(e) = self.accept(buffers) {
            error!(error = %e, "Unable to handle recording frame");
            self.busy.clear();
        }
    }

    fn accept(&self, buffers: &[FrameBuffer]) -> CameraResult<()> {
        let mut slot = lock(&self.slot);
        let Some(format) = slot.format else {
            self.busy.clear();
            return Ok(());
        };
        let target = slot.target;

        let Some(buffer) = select_buffer(buffers, target, format) else {
            self.busy.clear();
            return Ok(());
        };

        let restart = slot
            .output
            .as_ref()
            .map(|output| !output.accepts(buffer))
            .unwrap_or(true);
        if restart {
            if let Some(output) = slot.output.take() {
                debug!("Recording source changed, restarting output");
                output.stop();
            }
            let config = OutputConfig::for_buffer(
                NodeId::RecordingOutput,
                buffer,
                target,
                format,
                RECORDING_BUFFERS_COUNT,
            );
            let output = OutputSession::start(config, &self.ctx.outputs)?;
            slot.held = vec![false; output.count() as usize];
            slot.output = Some(output);
        }

        slot.buffer = Some(buffer.clone());
        drop(slot);
        self.gate.signal();
        Ok(())
    }

    fn worker_iteration(&self, stop: &AtomicBool) -> LoopAction {
        if self.gate.wait() == GateWait::Shutdown || stop.load(Ordering::SeqCst) {
            return LoopAction::Stop;
        }

        if let Err(e) = self.deliver_frame() {
            error!(error = %e, "Unable to deliver recording frame");
        }
        self.busy.clear();
        LoopAction::Continue
    }

    fn deliver_frame(&self) -> CameraResult<()> {
        let mut slot = lock(&self.slot);
        let slot = &mut *slot;
        let Some(buffer) = slot.buffer.take() else {
            return Ok(());
        };
        let Some(output) = slot.output.as_mut() else {
            return Ok(());
        };

        let ring = output.index() as usize;
        if slot.held.get(ring).copied().unwrap_or(false) {
            self.dropped.fetch_add(1, Ordering::SeqCst);
            debug!(ring, "Recording buffer still held by the host, dropping frame");
            return Ok(());
        }

        output.push(buffer.address)?;

        let (memory, index): (Arc<dyn SharedMemory>, u32) = match slot.pool.as_ref() {
            Some(pool) => {
                let config = output.config();
                let planes =
                    yuv_planes(config.target, config.target_format, output.current_address());
                pool.write(MetadataRecord::camera_source(pool.index(), planes))?;
                (Arc::clone(pool.memory()), pool.index())
            }
            None => (Arc::clone(output.memory()), output.index()),
        };

        let host = &self.ctx.host;
        let delivered = host.msg_type_enabled(msg::VIDEO_FRAME) != 0
            && host.data_timestamp(timestamp_ns(), msg::VIDEO_FRAME, &memory, index);
        if delivered {
            if let Some(held) = slot.held.get_mut(ring) {
                *held = true;
            }
            self.delivered.fetch_add(1, Ordering::SeqCst);
        } else {
            output.release();
        }

        if let Some(pool) = slot.pool.as_mut() {
            pool.advance();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::camera::types::BufferQueue;
    use crate::host::{EventRecorder, HostEvent};
    use crate::pipelines::test_support::{context, settings, wait_for};

    fn recording_context() -> (
        Arc<crate::backends::virtual_camera::VirtualProvider>,
        Arc<PipelineContext>,
        Arc<EventRecorder>,
    ) {
        let (provider, ctx) = context(settings());
        let recorder = Arc::new(EventRecorder::with_buffer_size(RECORD_SIZE));
        ctx.host.set_callbacks(Some(recorder.clone()));
        ctx.host.enable_msg_type(msg::VIDEO_FRAME);
        (provider, ctx, recorder)
    }

    #[test]
    fn test_metadata_ring_advances_on_release() {
        let (_provider, ctx, recorder) = recording_context();
        let recording = RecordingPath::new(ctx.clone());
        recording.store_metadata_in_buffers(true).unwrap();
        recording.start().unwrap();
        assert!(ctx.engine.recording_active());

        let mut seen = Vec::new();
        for k in 1..=8u64 {
            assert!(wait_for(|| recording.delivered() == k));
            let (index, payload) = match recorder.events().last().cloned() {
                Some(HostEvent::DataTimestamp { index, payload, .. }) => (index, payload),
                other => panic!("unexpected event {:?}", other),
            };
            let record = MetadataRecord::from_le_bytes(&payload).unwrap();
            assert_eq!(record.kind, 0);
            // The record names the pool slot it was delivered in
            assert_eq!(record.index, index);
            seen.push(index);

            recording.release_frame(index).unwrap();
            assert_eq!(recording.output_index(), Some((k % 6) as u32));
        }

        // Records rotate through the whole pool
        assert_eq!(seen, vec![0, 1, 2, 3, 4, 5, 0, 1]);
        recording.stop().unwrap();
        assert!(!ctx.engine.recording_active());
    }

    #[test]
    fn test_record_index_follows_pool_not_output_ring() {
        let (provider, ctx, recorder) = recording_context();
        // 64x48 NV12 takes 128 KiB, so 512 KiB holds a ring of three
        provider
            .node(NodeId::RecordingOutput)
            .configure(|c| c.reserved_memory = Some((0x5800_0000, 512 * 1024)));
        let recording = RecordingPath::new(ctx);
        recording.store_metadata_in_buffers(true).unwrap();
        recording.start().unwrap();

        let mut indices = Vec::new();
        let mut planes = Vec::new();
        for k in 1..=8u64 {
            assert!(wait_for(|| recording.delivered() == k));
            let Some(HostEvent::DataTimestamp { index, payload, .. }) = recorder.events().last().cloned()
            else {
                panic!("no recording frame");
            };
            let record = MetadataRecord::from_le_bytes(&payload).unwrap();
            assert_eq!(record.index, index);
            indices.push(index);
            planes.push(record.y);
            recording.release_frame(index).unwrap();
        }

        assert_eq!(indices, vec![0, 1, 2, 3, 4, 5, 0, 1]);
        // Image addresses cycle with the smaller output ring
        assert_ne!(planes[0], planes[1]);
        assert_ne!(planes[1], planes[2]);
        assert_eq!(planes[0], planes[3]);
        assert_eq!(planes[1], planes[4]);
        recording.stop().unwrap();
    }

    #[test]
    fn test_held_slot_drops_frames() {
        let (_provider, ctx, _recorder) = recording_context();
        let recording = RecordingPath::new(ctx);
        recording.store_metadata_in_buffers(true).unwrap();
        recording.start().unwrap();

        assert!(wait_for(|| recording.delivered() == 1));
        // Never released: later frames hit the held slot
        assert!(wait_for(|| recording.dropped() >= 3));
        assert_eq!(recording.delivered(), 1);
        assert_eq!(recording.output_index(), Some(0));
        recording.stop().unwrap();
    }

    #[test]
    fn test_direct_mode_without_host_releases_at_once() {
        let (_provider, ctx) = context(settings());
        let recording = RecordingPath::new(ctx);
        recording.start().unwrap();
        assert_eq!(recording.mode(), RecordingMode::Direct);
        assert!(recording.record_index().is_none());

        // Nobody enabled VIDEO_FRAME, so slots never stay in flight
        assert!(wait_for(|| recording.output_index().is_some_and(|i| i >= 2)));
        assert_eq!(recording.dropped(), 0);
        recording.stop().unwrap();
    }

    #[test]
    fn test_mode_locked_while_recording() {
        let (_provider, ctx) = context(settings());
        let recording = RecordingPath::new(ctx);
        recording.start().unwrap();
        assert!(matches!(
            recording.store_metadata_in_buffers(true),
            Err(CameraError::Busy(_))
        ));
        assert!(matches!(recording.start(), Err(CameraError::AlreadyEnabled(_))));
        recording.stop().unwrap();
        assert!(matches!(recording.stop(), Err(CameraError::NotEnabled(_))));
        assert!(matches!(recording.release_frame(0), Err(CameraError::NotEnabled(_))));
        recording.store_metadata_in_buffers(true).unwrap();
    }

    #[test]
    fn test_recording_defers_capture_changes() {
        let (provider, ctx) = context(settings());
        let recording = RecordingPath::new(ctx.clone());
        recording.start().unwrap();
        let before = ctx.engine.session().unwrap().geometry;

        let other = ctx
            .engine
            .register(
                Geometry::new(256, 192),
                PixelFormat::Nv21,
                Arc::new(BusyFlag::new()),
                Arc::new(|_: &[FrameBuffer]| {}),
            )
            .unwrap();
        assert_eq!(ctx.engine.session().unwrap().geometry, before);

        recording.stop().unwrap();
        assert_eq!(ctx.engine.session().unwrap().geometry, Geometry::new(256, 192));
        assert!(provider.node(NodeId::Capture).is_streaming(BufferQueue::Capture));
        ctx.engine.unregister(other).unwrap();
    }
}
