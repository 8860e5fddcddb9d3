// SPDX-License-Identifier: GPL-3.0-only

//! Still picture path
//!
//! A picture goes through four states:
//!
//! ```text
//! NotTriggered ──first frame──▶ Latched ──usable frame──▶ Collected ──worker──▶ Completed
//!                (capture latch set)      (roles stored)              (payload or error)
//! ```
//!
//! The first frame after start only arms the sensor's capture latch. The
//! next frame carrying a usable main image is kept; the worker compresses
//! and assembles it (see [`encoding`]), then stops the path itself. That
//! self-stop is what hands the picture to the host.

pub mod encoding;

pub use encoding::{PictureEncoder, PictureSources};

use super::PipelineContext;
use crate::backends::camera::frame_loop::{BusyFlag, Gate, GateWait, LoopAction, WorkerController, lock};
use crate::backends::camera::memory::SharedMemory;
use crate::backends::camera::types::{FrameBuffer, Geometry};
use crate::errors::{CameraError, CameraResult};
use crate::host::msg;
use crate::pipelines::capture::ListenerId;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, error, info, warn};

/// Progress of the picture being taken
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PictureState {
    #[default]
    NotTriggered,
    Latched,
    Collected,
    Completed,
}

#[derive(Default)]
struct PictureSlot {
    state: PictureState,
    /// Start count the slot belongs to
    generation: u64,
    main: Geometry,
    thumb: Geometry,
    sources: Option<PictureSources>,
    payload: Option<Arc<dyn SharedMemory>>,
}

struct Running {
    generation: u64,
    listener: ListenerId,
    worker: WorkerController,
}

struct PictureShared {
    ctx: Arc<PipelineContext>,
    slot: Mutex<PictureSlot>,
    running: Mutex<Option<Running>>,
    busy: Arc<BusyFlag>,
    gate: Gate,
    generation: AtomicU64,
    delivered: AtomicU64,
}

/// Picture path
pub struct PicturePath {
    shared: Arc<PictureShared>,
}

impl PicturePath {
    pub fn new(ctx: Arc<PipelineContext>) -> Self {
        Self {
            shared: Arc::new(PictureShared {
                ctx,
                slot: Mutex::new(PictureSlot::default()),
                running: Mutex::new(None),
                busy: Arc::new(BusyFlag::new()),
                gate: Gate::new(),
                generation: AtomicU64::new(0),
                delivered: AtomicU64::new(0),
            }),
        }
    }

    /// Whether a picture is in progress
    pub fn running(&self) -> bool {
        lock(&self.shared.running).is_some()
    }

    pub fn state(&self) -> PictureState {
        lock(&self.shared.slot).state
    }

    /// Pictures handed to the host so far
    pub fn delivered(&self) -> u64 {
        self.shared.delivered.load(Ordering::SeqCst)
    }

    pub fn start(&self) -> CameraResult<()> {
        let shared = &self.shared;
        let mut running = lock(&shared.running);
        if running.is_some() {
            error!("Picture was already started!");
            return Err(CameraError::AlreadyEnabled("Picture"));
        }

        let ctx = &shared.ctx;
        let settings = ctx.settings();
        let generation = shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *lock(&shared.slot) = PictureSlot {
            state: PictureState::NotTriggered,
            generation,
            main: settings.picture,
            thumb: settings.thumbnail,
            sources: None,
            payload: None,
        };
        shared.busy.clear();
        shared.gate.reset();

        let worker_shared = Arc::clone(shared);
        let mut worker = WorkerController::start("picture", ctx.timeouts.worker_join, move |stop| {
            worker_shared.worker_iteration(generation, stop)
        })?;

        let weak: Weak<PictureShared> = Arc::downgrade(shared);
        let listener = ctx.engine.register(
            settings.picture,
            settings.picture_format,
            Arc::clone(&shared.busy),
            Arc::new(move |buffers: &[FrameBuffer]| {
                if let Some(shared) = weak.upgrade() {
                    shared.on_frame(buffers);
                }
            }),
        );

        let listener = match listener {
            Ok(listener) => listener,
            Err(e) => {
                error!(error = %e, "Unable to register picture listener");
                shared.gate.shutdown();
                worker.stop();
                return Err(e);
            }
        };

        *running = Some(Running {
            generation,
            listener,
            worker,
        });
        info!(
            geometry = %settings.picture,
            format = %settings.picture_format,
            thumbnail = %settings.thumbnail,
            "Picture started"
        );
        Ok(())
    }

    /// Stop the path, delivering the picture if it was completed
    pub fn stop(&self) -> CameraResult<()> {
        self.shared.stop(None)
    }
}

impl Drop for PicturePath {
    fn drop(&mut self) {
        if self.running() {
            if let Err(e) = self.stop() {
                warn!(error = %e, "Unable to stop picture on drop");
            }
        }
    }
}

impl PictureShared {
    fn on_frame(&self, buffers: &[FrameBuffer]) {
        let mut slot = lock(&self.slot);

        match slot.state {
            PictureState::Completed => {
                debug!("Picture already completed, ignoring frame");
                return;
            }
            PictureState::Collected => return,
            _ => {}
        }

        if self.busy.is_busy() {
            debug!("Picture is busy, dropping frame");
            return;
        }

        if slot.state == PictureState::NotTriggered {
            let device = self.ctx.engine.device();
            let ids = self.ctx.engine.controls();
            match device.set_control(ids.capture, 0) {
                Ok(_) => {
                    debug!("Capture latched");
                    slot.state = PictureState::Latched;
                }
                Err(e) => error!(error = %e, "Unable to latch capture"),
            }
            return;
        }

        if !self.busy.try_set() {
            return;
        }

        let sources = PictureSources::classify(buffers, slot.main, slot.thumb);
        if !sources.has_main() {
            debug!(count = buffers.len(), "No main image in frame, waiting");
            self.busy.clear();
            return;
        }

        slot.sources = Some(sources);
        slot.state = PictureState::Collected;
        drop(slot);
        self.gate.signal();
    }

    fn worker_iteration(&self, generation: u64, stop: &AtomicBool) -> LoopAction {
        if self.gate.wait() == GateWait::Shutdown || stop.load(Ordering::SeqCst) {
            return LoopAction::Stop;
        }

        let (sources, main, thumb) = {
            let mut slot = lock(&self.slot);
            if slot.generation != generation {
                return LoopAction::Stop;
            }
            match slot.sources.take() {
                Some(sources) => (sources, slot.main, slot.thumb),
                None => return LoopAction::Continue,
            }
        };

        let settings = self.ctx.settings();
        let encoder = PictureEncoder::new(
            &self.ctx,
            main,
            thumb,
            settings.jpeg_quality,
            settings.thumbnail_quality,
        );
        let result = encoder.compose(&sources);
        drop(sources);

        let payload = match result {
            Ok(payload) => Some(payload),
            Err(e) => {
                error!(error = %e, "Unable to take picture");
                self.ctx.host.notify(msg::ERROR, -1, 0);
                None
            }
        };

        {
            let mut slot = lock(&self.slot);
            if slot.generation == generation {
                slot.state = PictureState::Completed;
                slot.payload = payload;
            }
        }
        self.busy.clear();

        if let Err(e) = self.stop(Some(generation)) {
            debug!(error = %e, "Picture was stopped by the host first");
        }
        LoopAction::Stop
    }

    /// Stop the running picture
    ///
    /// With `generation`, only that picture is stopped: a worker finishing
    /// late must not stop a newer one.
    fn stop(&self, generation: Option<u64>) -> CameraResult<()> {
        let running = {
            let mut running = lock(&self.running);
            match (running.as_ref(), generation) {
                (None, _) => return Err(CameraError::NotEnabled("Picture")),
                (Some(r), Some(g)) if r.generation != g => {
                    return Err(CameraError::NotEnabled("Picture"));
                }
                _ => running.take(),
            }
        };
        let Some(mut running) = running else {
            return Err(CameraError::NotEnabled("Picture"));
        };

        let ctx = &self.ctx;
        let unregistered = ctx.engine.unregister(running.listener);

        self.gate.shutdown();
        if !running.worker.stop() {
            warn!("Picture thread is taking too long to end, something is going wrong");
        }

        let payload = {
            let mut slot = lock(&self.slot);
            slot.sources = None;
            if slot.state == PictureState::Completed {
                slot.payload.take()
            } else {
                None
            }
        };
        self.busy.clear();

        if let Some(payload) = payload {
            ctx.host.notify(msg::SHUTTER, 0, 0);
            ctx.host.data(msg::COMPRESSED_IMAGE, &payload, 0);
            self.delivered.fetch_add(1, Ordering::SeqCst);
            info!(size = payload.len(), "Picture delivered");
        }

        info!("Picture stopped");
        unregistered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::camera::types::{NodeId, PixelFormat};
    use crate::backends::camera::v4l2_controls::ControlIds;
    use crate::host::{EventRecorder, HostEvent};
    use crate::media::{JpegEncoder, SoftwareJpegEncoder};
    use crate::pipelines::test_support::{context, context_with, settings, wait_for};
    use std::sync::atomic::AtomicUsize;

    /// Software encoder that counts its calls
    #[derive(Default)]
    struct CountingEncoder {
        calls: AtomicUsize,
        fail: bool,
    }

    impl JpegEncoder for CountingEncoder {
        fn encode(
            &self,
            raw: &[u8],
            width: u32,
            height: u32,
            format: PixelFormat,
            quality: u8,
        ) -> CameraResult<Vec<u8>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(CameraError::Encoding("injected".to_string()));
            }
            SoftwareJpegEncoder::new().encode(raw, width, height, format, quality)
        }
    }

    fn recorder(ctx: &PipelineContext) -> Arc<EventRecorder> {
        let recorder = Arc::new(EventRecorder::new());
        ctx.host.set_callbacks(Some(recorder.clone()));
        ctx.host.enable_msg_type(msg::ALL);
        recorder
    }

    #[test]
    fn test_raw_picture_compresses_twice() {
        let encoder = Arc::new(CountingEncoder::default());
        let (provider, ctx) = context_with(settings(), encoder.clone());
        let recorder = recorder(&ctx);

        let picture = PicturePath::new(ctx.clone());
        picture.start().unwrap();
        assert!(wait_for(|| picture.delivered() == 1));

        assert!(!picture.running());
        assert_eq!(picture.state(), PictureState::Completed);
        assert_eq!(encoder.calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            provider.node(NodeId::Capture).control(ControlIds::default().capture),
            Some(0)
        );

        assert_eq!(recorder.count(msg::SHUTTER), 1);
        assert_eq!(recorder.count(msg::COMPRESSED_IMAGE), 1);
        let payload = recorder
            .events()
            .into_iter()
            .find_map(|e| match e {
                HostEvent::Data { event, payload, .. } if event == msg::COMPRESSED_IMAGE => {
                    Some(payload)
                }
                _ => None,
            })
            .unwrap();
        assert_eq!(&payload[..4], &[0xFF, 0xD8, 0xFF, 0xE1]);
        assert_eq!(&payload[payload.len() - 2..], &[0xFF, 0xD9]);

        // Sole listener gone
        assert!(ctx.engine.session().is_none());
    }

    #[test]
    fn test_compressed_picture_skips_encoder() {
        let encoder = Arc::new(CountingEncoder::default());
        let mut wanted = settings();
        wanted.picture_format = PixelFormat::Jpeg;
        let (_provider, ctx) = context_with(wanted, encoder.clone());
        let recorder = recorder(&ctx);

        let picture = PicturePath::new(ctx);
        picture.start().unwrap();
        assert!(wait_for(|| picture.delivered() == 1));

        assert_eq!(encoder.calls.load(Ordering::SeqCst), 0);
        assert_eq!(recorder.count(msg::SHUTTER), 1);
        assert_eq!(recorder.count(msg::COMPRESSED_IMAGE), 1);
    }

    #[test]
    fn test_encoding_failure_reports_error() {
        let encoder = Arc::new(CountingEncoder {
            fail: true,
            ..CountingEncoder::default()
        });
        let (_provider, ctx) = context_with(settings(), encoder);
        let recorder = recorder(&ctx);

        let picture = PicturePath::new(ctx);
        picture.start().unwrap();
        assert!(wait_for(|| !picture.running()));

        assert_eq!(picture.state(), PictureState::Completed);
        assert_eq!(
            recorder.events(),
            vec![HostEvent::Notify {
                event: msg::ERROR,
                arg1: -1,
                arg2: 0
            }]
        );
        assert_eq!(picture.delivered(), 0);
    }

    #[test]
    fn test_cancel_before_completion() {
        let (provider, ctx) = context(settings());
        // Hold frames back so the picture cannot complete
        provider
            .node(NodeId::Capture)
            .configure(|c| c.frame_interval = Some(std::time::Duration::from_secs(60)));
        let recorder = recorder(&ctx);

        let picture = PicturePath::new(ctx);
        picture.start().unwrap();
        assert!(matches!(picture.start(), Err(CameraError::AlreadyEnabled(_))));
        picture.stop().unwrap();
        assert!(matches!(picture.stop(), Err(CameraError::NotEnabled(_))));
        assert!(recorder.events().is_empty());
    }
}
