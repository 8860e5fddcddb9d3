// SPDX-License-Identifier: GPL-3.0-only

//! Live preview path
//!
//! The listener keeps the newest capture buffer in the slot and wakes the
//! worker, which posts it to the display surface and to the host. When the
//! capture session runs at another geometry or format than the preview, the
//! buffer goes through the preview output node first.

use super::output::{OutputConfig, OutputSession};
use super::{PipelineContext, select_buffer, slot_index};
use crate::backends::camera::frame_loop::{BusyFlag, Gate, GateWait, LoopAction, WorkerController, lock};
use crate::backends::camera::types::{FrameBuffer, Geometry, NodeId, PixelFormat};
use crate::constants::buffers::PREVIEW_BUFFERS_COUNT;
use crate::errors::{CameraError, CameraResult};
use crate::host::msg;
use crate::pipelines::capture::ListenerId;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, error, info, warn};

#[derive(Default)]
struct PreviewSlot {
    target: Geometry,
    format: Option<PixelFormat>,
    buffer: Option<FrameBuffer>,
    output: Option<OutputSession>,
}

struct Running {
    listener: ListenerId,
    worker: WorkerController,
}

struct PreviewShared {
    ctx: Arc<PipelineContext>,
    slot: Mutex<PreviewSlot>,
    busy: Arc<BusyFlag>,
    gate: Gate,
    frames: AtomicU64,
}

/// Preview path
pub struct PreviewPath {
    shared: Arc<PreviewShared>,
    running: Mutex<Option<Running>>,
}

impl PreviewPath {
    pub fn new(ctx: Arc<PipelineContext>) -> Self {
        Self {
            shared: Arc::new(PreviewShared {
                ctx,
                slot: Mutex::new(PreviewSlot::default()),
                busy: Arc::new(BusyFlag::new()),
                gate: Gate::new(),
                frames: AtomicU64::new(0),
            }),
            running: Mutex::new(None),
        }
    }

    pub fn enabled(&self) -> bool {
        lock(&self.running).is_some()
    }

    /// Frames posted since creation
    pub fn frames_posted(&self) -> u64 {
        self.shared.frames.load(Ordering::SeqCst)
    }

    /// Whether frames currently go through the output node
    pub fn reshaping(&self) -> bool {
        lock(&self.shared.slot).output.is_some()
    }

    pub fn start(&self) -> CameraResult<()> {
        let mut running = lock(&self.running);
        if running.is_some() {
            error!("Preview was already started!");
            return Err(CameraError::AlreadyEnabled("Preview"));
        }

        let ctx = &self.shared.ctx;
        let settings = ctx.settings();
        {
            let mut slot = lock(&self.shared.slot);
            slot.target = settings.preview;
            slot.format = Some(settings.preview_format);
            slot.buffer = None;
        }
        self.shared.busy.clear();
        self.shared.gate.reset();

        let shared = Arc::clone(&self.shared);
        let mut worker = WorkerController::start("preview", ctx.timeouts.worker_join, move |stop| {
            shared.worker_iteration(stop)
        })?;

        if let Some(window) = ctx.host.window() {
            if let Err(e) = window.set_geometry(settings.preview, settings.preview_format) {
                error!(error = %e, "Unable to set preview window geometry");
                self.shared.gate.shutdown();
                worker.stop();
                return Err(e);
            }
        }

        let weak: Weak<PreviewShared> = Arc::downgrade(&self.shared);
        let listener = ctx.engine.register(
            settings.preview,
            settings.preview_format,
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
                error!(error = %e, "Unable to register preview listener");
                self.shared.gate.shutdown();
                worker.stop();
                return Err(e);
            }
        };

        *running = Some(Running { listener, worker });
        info!(geometry = %settings.preview, format = %settings.preview_format, "Preview started");
        Ok(())
    }

    pub fn stop(&self) -> CameraResult<()> {
        let Some(mut running) = lock(&self.running).take() else {
            error!("Preview was already stopped!");
            return Err(CameraError::NotEnabled("Preview"));
        };
        let ctx = &self.shared.ctx;

        let unregistered = ctx.engine.unregister(running.listener);

        self.shared.gate.shutdown();
        if !running.worker.stop() {
            warn!("Preview thread is taking too long to end, something is going wrong");
        }

        {
            let mut slot = lock(&self.shared.slot);
            slot.buffer = None;
            if let Some(output) = slot.output.take() {
                output.stop();
            }
        }
        ctx.engine.set_preview_reshaping(false);
        self.shared.busy.clear();
        ctx.host.set_window(None);

        info!("Preview stopped");
        unregistered
    }
}

impl Drop for PreviewPath {
    fn drop(&mut self) {
        if self.enabled() {
            if let Err(e) = self.stop() {
                warn!(error = %e, "Unable to stop preview on drop");
            }
        }
    }
}

impl PreviewShared {
    fn on_frame(&self, buffers: &[FrameBuffer]) {
        if !self.busy.try_set() {
            debug!("Preview is busy, dropping frame");
            return;
        }

        if let Err(e) = self.accept(buffers) {
            error!(error = %e, "Unable to handle preview frame");
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

        let exact = buffer.geometry() == target && buffer.format == format;
        if exact {
            if let Some(output) = slot.output.take() {
                debug!("Preview matches capture, stopping output");
                output.stop();
                self.ctx.engine.set_preview_reshaping(false);
            }
        } else {
            let restart = slot
                .output
                .as_ref()
                .map(|output| !output.accepts(buffer))
                .unwrap_or(true);
            if restart {
                // One output per path: the old session goes first
                if let Some(output) = slot.output.take() {
                    output.stop();
                }
                let config = OutputConfig::for_buffer(
                    NodeId::PreviewOutput,
                    buffer,
                    target,
                    format,
                    PREVIEW_BUFFERS_COUNT,
                );
                slot.output = Some(OutputSession::start(config, &self.ctx.outputs)?);
                self.ctx.engine.set_preview_reshaping(true);
            }
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

        if let Err(e) = self.post_frame() {
            error!(error = %e, "Unable to post preview frame");
        }
        self.busy.clear();
        LoopAction::Continue
    }

    fn post_frame(&self) -> CameraResult<()> {
        let mut slot = lock(&self.slot);
        let Some(buffer) = slot.buffer.take() else {
            return Ok(());
        };

        let frame = match slot.output.as_ref() {
            Some(output) => {
                output.push(buffer.address)?;
                output.current_buffer()
            }
            None => buffer,
        };
        let index = match slot.output.as_ref() {
            Some(output) => output.index(),
            None => slot_index(&frame),
        };

        let host = &self.ctx.host;
        if let Some(window) = host.window() {
            match frame.data() {
                Some(bytes) => window.post(bytes, frame.geometry(), frame.format)?,
                None => warn!(?frame, "Preview frame outside of its memory"),
            }
        }

        if host.msg_type_enabled(msg::PREVIEW_FRAME) != 0 {
            host.data(msg::PREVIEW_FRAME, &frame.memory, index);
        }

        if let Some(output) = slot.output.as_mut() {
            output.release();
        }
        self.frames.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
