// SPDX-License-Identifier: GPL-3.0-only

//! Capture dispatch engine
//!
//! The engine owns the capture node, the negotiated capture session and the
//! listener registry. One dispatch worker dequeues filled slots, fans each
//! one out to every listener and requeues it once all of them are done.
//!
//! ```text
//!   register / unregister ──▶ renegotiate ──▶ start / stop session
//!                                                   │ open gate
//!                                                   ▼
//!   dispatch worker:  dequeue ─▶ resolve address ─▶ listeners ─▶ wait idle ─▶ requeue
//! ```
//!
//! Register, unregister and every dispatch cycle take the same engine lock,
//! so the session never changes under a cycle.

pub mod listeners;

pub use listeners::{ListenerCallback, ListenerId, ListenerRegistry, Negotiated};

use crate::backends::camera::frame_loop::{BusyFlag, Gate, GateWait, LoopAction, WorkerController, lock};
use crate::backends::camera::memory::{MemoryAllocator, SharedMemory};
use crate::backends::camera::types::{BufferQueue, CaptureMode, FrameBuffer, Geometry, PixelFormat};
use crate::backends::camera::v4l2_controls::ControlIds;
use crate::backends::camera::VideoDevice;
use crate::config::{SensorResolution, Timeouts};
use crate::constants::buffers::{CAPTURE_BUFFERS_COUNT, PREVIEW_BUFFERS_COUNT};
use crate::constants::memory::is_invalid_address;
use crate::constants::sensor;
use crate::constants::timing::DISPATCH_YIELD;
use crate::errors::{CameraError, CameraResult, DeviceError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Camera state the engine needs to configure and describe a session
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    pub preview: Geometry,
    pub preview_fps: u32,
    pub picture: Geometry,
    pub picture_format: PixelFormat,
    pub thumbnail: Geometry,
    pub rotation: i32,
    /// Sensor bus geometry to use for a given capture geometry
    pub sensor_resolutions: Vec<SensorResolution>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            preview: Geometry::new(640, 480),
            preview_fps: 30,
            picture: Geometry::new(640, 480),
            picture_format: PixelFormat::Yuyv,
            thumbnail: Geometry::new(160, 120),
            rotation: 0,
            sensor_resolutions: Vec::new(),
        }
    }
}

/// The capture configuration currently streaming
#[derive(Clone)]
pub struct CaptureSession {
    pub geometry: Geometry,
    pub format: PixelFormat,
    pub buffer_count: u32,
    /// Length of one slot
    pub stride: usize,
    /// Physical address of slot 0
    pub base_address: u32,
    pub memory: Arc<dyn SharedMemory>,
    pub mode: CaptureMode,
    /// Set when listeners did not release a buffer in time
    pub faulted: bool,
    pub dispatched: u64,
}

impl std::fmt::Debug for CaptureSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureSession")
            .field("geometry", &self.geometry)
            .field("format", &self.format)
            .field("buffer_count", &self.buffer_count)
            .field("stride", &self.stride)
            .field("base_address", &format_args!("0x{:08x}", self.base_address))
            .field("mode", &self.mode)
            .field("faulted", &self.faulted)
            .field("dispatched", &self.dispatched)
            .finish()
    }
}

/// Result of one dispatch cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// No session, or nothing became ready before the poll timeout
    Idle,
    /// Slot `index` went through every listener and was requeued
    Dispatched { index: u32 },
}

struct EngineState {
    registry: ListenerRegistry,
    session: Option<CaptureSession>,
    settings: EngineSettings,
}

struct EngineShared {
    device: Arc<dyn VideoDevice>,
    allocator: Arc<dyn MemoryAllocator>,
    controls: ControlIds,
    timeouts: Timeouts,
    state: Mutex<EngineState>,
    gate: Gate,
    recording_active: AtomicBool,
    preview_reshaping: AtomicBool,
}

/// Capture dispatch engine
pub struct CaptureEngine {
    shared: Arc<EngineShared>,
    worker: Mutex<Option<WorkerController>>,
}

/// What a session start acquired, released in reverse on failure
struct StartGuard<'a> {
    device: &'a dyn VideoDevice,
    buffers_requested: bool,
    streaming: bool,
    armed: bool,
}

impl Drop for StartGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if self.streaming {
            if let Err(e) = self.device.stream_off(BufferQueue::Capture) {
                warn!(error = %e, "Unable to stop stream while unwinding");
            }
        }
        if self.buffers_requested {
            if let Err(e) = self.device.request_buffers(BufferQueue::Capture, 0) {
                warn!(error = %e, "Unable to release buffers while unwinding");
            }
        }
    }
}

impl CaptureEngine {
    pub fn new(
        device: Arc<dyn VideoDevice>,
        allocator: Arc<dyn MemoryAllocator>,
        controls: ControlIds,
        timeouts: Timeouts,
        settings: EngineSettings,
    ) -> Self {
        Self {
            shared: Arc::new(EngineShared {
                device,
                allocator,
                controls,
                timeouts,
                state: Mutex::new(EngineState {
                    registry: ListenerRegistry::new(),
                    session: None,
                    settings,
                }),
                gate: Gate::new(),
                recording_active: AtomicBool::new(false),
                preview_reshaping: AtomicBool::new(false),
            }),
            worker: Mutex::new(None),
        }
    }

    /// The capture node
    pub fn device(&self) -> &Arc<dyn VideoDevice> {
        &self.shared.device
    }

    pub fn controls(&self) -> &ControlIds {
        &self.shared.controls
    }

    pub fn settings(&self) -> EngineSettings {
        lock(&self.shared.state).settings.clone()
    }

    /// Replace the settings used by the next session start
    pub fn update_settings(&self, settings: EngineSettings) {
        lock(&self.shared.state).settings = settings;
    }

    /// Snapshot of the current session
    pub fn session(&self) -> Option<CaptureSession> {
        lock(&self.shared.state).session.clone()
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.shared.state).registry.len()
    }

    /// Defer geometry changes while recording
    pub fn set_recording_active(&self, active: bool) {
        self.shared.recording_active.store(active, Ordering::SeqCst);
    }

    pub fn recording_active(&self) -> bool {
        self.shared.recording_active.load(Ordering::SeqCst)
    }

    /// Whether the preview path currently reshapes capture buffers
    pub fn set_preview_reshaping(&self, reshaping: bool) {
        self.shared.preview_reshaping.store(reshaping, Ordering::SeqCst);
    }

    /// Add a listener and renegotiate the session
    ///
    /// On failure the listener is not left registered.
    pub fn register(
        &self,
        geometry: Geometry,
        format: PixelFormat,
        busy: Arc<BusyFlag>,
        callback: ListenerCallback,
    ) -> CameraResult<ListenerId> {
        let mut state = lock(&self.shared.state);
        let id = state.registry.add(geometry, format, busy, callback);
        debug!(%id, %geometry, %format, "Registered capture listener");

        if let Err(e) = self.shared.renegotiate(&mut state) {
            error!(%id, error = %e, "Unable to setup capture");
            state.registry.remove(id);
            return Err(e);
        }

        Ok(id)
    }

    /// Remove a listener and renegotiate the session
    pub fn unregister(&self, id: ListenerId) -> CameraResult<()> {
        let mut state = lock(&self.shared.state);
        if !state.registry.remove(id) {
            warn!(%id, "Unregistering unknown listener");
        }
        debug!(%id, "Unregistered capture listener");

        self.shared.renegotiate(&mut state).inspect_err(|e| {
            error!(%id, error = %e, "Unable to setup capture");
        })
    }

    /// Start a session for the current negotiation outcome
    pub fn start(&self, for_picture: bool) -> CameraResult<()> {
        let mut state = lock(&self.shared.state);
        let settings = state.settings.clone();
        let negotiated = state
            .registry
            .negotiate(settings.preview, settings.picture_format)
            .ok_or_else(|| CameraError::InvalidArgument("no listener registered".to_string()))?;
        self.shared.start_session(&mut state, negotiated, for_picture)
    }

    /// Stop the running session
    pub fn stop(&self) -> CameraResult<()> {
        let mut state = lock(&self.shared.state);
        self.shared.stop_session(&mut state)
    }

    /// Run a single dispatch cycle on the calling thread
    pub fn dispatch_cycle(&self) -> CameraResult<CycleOutcome> {
        let mut state = lock(&self.shared.state);
        self.shared.dispatch_cycle(&mut state)
    }

    /// Spawn the dispatch worker
    pub fn start_worker(&self) -> CameraResult<()> {
        let mut worker = lock(&self.worker);
        if worker.is_some() {
            return Err(CameraError::AlreadyEnabled("Capture thread"));
        }

        self.shared.gate.reset();
        if self.session().is_some() {
            self.shared.gate.signal();
        }

        let shared = Arc::clone(&self.shared);
        let controller = WorkerController::start(
            "capture-dispatch",
            self.shared.timeouts.worker_join,
            move |stop| shared.worker_iteration(stop),
        )?;
        *worker = Some(controller);
        Ok(())
    }

    pub fn worker_running(&self) -> bool {
        lock(&self.worker)
            .as_ref()
            .map(|w| w.is_running())
            .unwrap_or(false)
    }

    /// Stop the dispatch worker and any running session
    pub fn shutdown(&self) {
        if let Some(mut worker) = lock(&self.worker).take() {
            worker.request_stop();
            self.shared.gate.shutdown();
            if !worker.join() {
                warn!("Capture thread is taking too long to end, something is going wrong");
            }
        }

        let mut state = lock(&self.shared.state);
        if state.session.is_some() {
            if let Err(e) = self.shared.stop_session(&mut state) {
                warn!(error = %e, "Unable to stop capture on shutdown");
            }
        }
    }
}

impl Drop for CaptureEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl EngineShared {
    fn worker_iteration(&self, stop: &AtomicBool) -> LoopAction {
        if self.gate.wait() == GateWait::Shutdown {
            return LoopAction::Stop;
        }

        loop {
            if stop.load(Ordering::SeqCst) {
                return LoopAction::Stop;
            }

            let result = {
                let mut state = lock(&self.state);
                if state.session.is_none() {
                    break;
                }
                self.dispatch_cycle(&mut state)
            };

            if let Err(e) = result {
                error!(error = %e, "Unable to capture");
                break;
            }

            // Let register/unregister take the engine lock
            std::thread::sleep(DISPATCH_YIELD);
        }

        LoopAction::Continue
    }

    fn renegotiate(&self, state: &mut EngineState) -> CameraResult<()> {
        if state.registry.is_empty() {
            if state.session.is_some() {
                info!("No listener left, stopping capture");
                self.stop_session(state)?;
            }
            return Ok(());
        }

        let settings = &state.settings;
        let Some(negotiated) = state
            .registry
            .negotiate(settings.preview, settings.picture_format)
        else {
            return Ok(());
        };
        debug!(%negotiated, "Negotiated capture");

        let Some(session) = state.session.as_ref() else {
            return self.start_session(state, negotiated, false);
        };

        if session.faulted {
            warn!("Restarting faulted capture session");
            self.stop_session(state)?;
            return self.start_session(state, negotiated, false);
        }

        if session.geometry == negotiated.geometry && session.format == negotiated.format {
            return Ok(());
        }

        if self.recording_active.load(Ordering::SeqCst) {
            info!(
                current = %session.geometry,
                wanted = %negotiated,
                "Recording in progress, keeping capture configuration"
            );
            return Ok(());
        }

        self.stop_session(state)?;
        self.start_session(state, negotiated, true)
    }

    fn start_session(
        &self,
        state: &mut EngineState,
        negotiated: Negotiated,
        for_picture: bool,
    ) -> CameraResult<()> {
        if state.session.is_some() {
            error!("Capture was already started!");
            return Err(CameraError::AlreadyEnabled("Capture"));
        }

        let device = self.device.as_ref();
        let ids = &self.controls;
        let settings = &state.settings;
        let Negotiated { geometry, format } = negotiated;

        // Compressed-only requests borrow the preview geometry, which may be unset
        if geometry.is_empty() {
            error!(%format, "No capture geometry to negotiate");
            return Err(CameraError::InvalidArgument(format!(
                "empty capture geometry for {}",
                format
            )));
        }

        if !device.enum_format(BufferQueue::Capture, format)? {
            error!(%format, "Unable to enumerate formats");
            return Err(DeviceError::FormatUnsupported(format.fourcc()).into());
        }

        let sensor_geometry = SensorResolution::resolve(&settings.sensor_resolutions, geometry);

        let still = for_picture && !self.preview_reshaping.load(Ordering::SeqCst);
        let mode = if still {
            CaptureMode::Still
        } else {
            CaptureMode::Preview
        };

        let (field, pix_mode) = match mode {
            CaptureMode::Preview => (sensor::FIELD_NONE, sensor::PIX_FMT_MODE_PREVIEW),
            CaptureMode::Still => (sensor::FIELD_CAPTURE_STILL, sensor::PIX_FMT_MODE_CAPTURE),
        };

        device.set_format(BufferQueue::Capture, geometry, format, 0, pix_mode)?;
        device.set_format(BufferQueue::Private, sensor_geometry, format, field, pix_mode)?;

        if mode == CaptureMode::Preview {
            device.set_control(ids.embedded_data, 0)?;
        }

        let mut guard = StartGuard {
            device,
            buffers_requested: false,
            streaming: false,
            armed: true,
        };

        let most = match mode {
            CaptureMode::Preview => PREVIEW_BUFFERS_COUNT,
            CaptureMode::Still => CAPTURE_BUFFERS_COUNT,
        };
        let mut last_error = None;
        let mut buffer_count = 0;
        for count in (1..=most).rev() {
            match device.request_buffers(BufferQueue::Capture, count) {
                Ok(granted) if granted > 0 => {
                    buffer_count = granted;
                    break;
                }
                Ok(_) => {}
                Err(e) => last_error = Some(e),
            }
        }
        if buffer_count == 0 {
            error!("Unable to request buffers");
            return Err(match last_error {
                Some(e) => e.into(),
                None => CameraError::ResourceExhausted("no capture buffers".to_string()),
            });
        }
        guard.buffers_requested = true;
        debug!(buffer_count, "Found buffers available for capture");

        device.set_frame_rate(settings.preview_fps)?;

        let mut stride = 0;
        for index in 0..buffer_count {
            stride = device.query_buffer(BufferQueue::Capture, index)? as usize;
        }

        let base = device.set_control(ids.paddr_y, 0)?;
        if is_invalid_address(base) {
            error!("Unable to get address");
            return Err(DeviceError::InvalidAddress(base).into());
        }
        // The driver expects the chroma plane to be queried as well
        if let Err(e) = device.set_control(ids.paddr_cbcr, 0) {
            warn!(error = %e, "Unable to get chroma address");
        }

        let memory = self
            .allocator
            .request(device.memory_token(), stride, buffer_count as usize)?;

        for index in 0..buffer_count {
            device.queue_buffer(BufferQueue::Capture, index, None)?;
        }

        device.set_control(ids.rotation, settings.rotation)?;

        device.stream_on(BufferQueue::Capture)?;
        guard.streaming = true;

        if mode == CaptureMode::Preview {
            device.set_control(ids.capture_mode, sensor::UNKNOWN_CAPTURE_MODE)?;
        }

        guard.armed = false;
        state.session = Some(CaptureSession {
            geometry,
            format,
            buffer_count,
            stride,
            base_address: base as u32,
            memory,
            mode,
            faulted: false,
            dispatched: 0,
        });
        self.gate.signal();

        info!(
            %geometry,
            %format,
            %sensor_geometry,
            ?mode,
            buffer_count,
            stride,
            "Capture started"
        );
        Ok(())
    }

    fn stop_session(&self, state: &mut EngineState) -> CameraResult<()> {
        let Some(session) = state.session.take() else {
            error!("Capture was already stopped!");
            return Err(CameraError::NotEnabled("Capture"));
        };

        self.gate.close();

        if let Err(e) = self.device.stream_off(BufferQueue::Capture) {
            error!(error = %e, "Unable to stop stream");
        }
        if let Err(e) = self.device.request_buffers(BufferQueue::Capture, 0) {
            warn!(error = %e, "Unable to release capture buffers");
        }
        drop(session);

        info!("Capture stopped");
        Ok(())
    }

    fn dispatch_cycle(&self, state: &mut EngineState) -> CameraResult<CycleOutcome> {
        let Some(session) = state.session.as_ref() else {
            return Ok(CycleOutcome::Idle);
        };
        let device = self.device.as_ref();
        let ids = &self.controls;
        let count = session.buffer_count;

        let ready = |index: Option<u32>| index.filter(|i| *i < count);

        let index = match ready(device.dequeue_buffer(BufferQueue::Capture).ok().flatten()) {
            Some(index) => index,
            None => {
                if !device.poll(self.timeouts.poll)? {
                    return Ok(CycleOutcome::Idle);
                }
                ready(device.dequeue_buffer(BufferQueue::Capture)?).ok_or_else(|| {
                    error!("Unable to dequeue buffer");
                    CameraError::Device(DeviceError::Ioctl {
                        request: "VIDIOC_DQBUF",
                        reason: "no buffer after poll".to_string(),
                    })
                })?
            }
        };

        let address = device.set_control(ids.paddr_y, index as i32)?;
        if is_invalid_address(address) {
            error!(index, "Unable to get address");
            return Err(DeviceError::InvalidAddress(address).into());
        }
        let address = address as u32;

        let expected = index as usize * session.stride;
        let offset = address.wrapping_sub(session.base_address) as usize;
        if offset != expected {
            error!(offset, expected, "Inconsistent memory offset");
        }
        if let Err(e) = device.set_control(ids.paddr_cbcr, 0) {
            warn!(index, error = %e, "Unable to get chroma address");
        }

        let buffers = if session.format.is_compressed() {
            self.compressed_buffers(session, &state.settings, expected, address)?
        } else {
            vec![FrameBuffer {
                memory: Arc::clone(&session.memory),
                offset: expected,
                length: session.stride,
                address,
                width: session.geometry.width,
                height: session.geometry.height,
                format: session.format,
            }]
        };

        state.registry.dispatch(&buffers);

        let deadline = Instant::now() + self.timeouts.listener;
        if !state.registry.wait_idle(deadline) {
            if let Some(session) = state.session.as_mut() {
                session.faulted = true;
            }
            error!(index, waited = ?self.timeouts.listener, "Listeners did not release buffer");
            return Err(CameraError::ListenerTimeout {
                waited: self.timeouts.listener,
            });
        }

        device.queue_buffer(BufferQueue::Capture, index, None)?;
        if let Some(session) = state.session.as_mut() {
            session.dispatched += 1;
        }

        Ok(CycleOutcome::Dispatched { index })
    }

    /// Main image and thumbnail inside a compressed slot
    fn compressed_buffers(
        &self,
        session: &CaptureSession,
        settings: &EngineSettings,
        slot_offset: usize,
        address: u32,
    ) -> CameraResult<Vec<FrameBuffer>> {
        let device = self.device.as_ref();
        let ids = &self.controls;

        let main_size = device.get_control(ids.jpeg_main_size)?;
        if main_size <= 0 {
            error!(main_size, "Unable to get jpeg size");
            return Err(CameraError::Device(DeviceError::Control {
                id: ids.jpeg_main_size,
                reason: format!("invalid size {}", main_size),
            }));
        }
        let main_offset = device.get_control(ids.jpeg_main_offset)?.max(0) as usize;

        let thumb_size = device.get_control(ids.jpeg_thumb_size)?;
        if thumb_size <= 0 {
            error!(thumb_size, "Unable to get jpeg thumbnail size");
            return Err(CameraError::Device(DeviceError::Control {
                id: ids.jpeg_thumb_size,
                reason: format!("invalid size {}", thumb_size),
            }));
        }
        let thumb_offset = device.get_control(ids.jpeg_thumb_offset)?.max(0) as usize;

        let view = |offset: usize, size: i32, geometry: Geometry| FrameBuffer {
            memory: Arc::clone(&session.memory),
            offset: slot_offset + offset,
            length: size as usize,
            address: address.wrapping_add(offset as u32),
            width: geometry.width,
            height: geometry.height,
            format: PixelFormat::Jpeg,
        };

        Ok(vec![
            view(main_offset, main_size, settings.picture),
            view(thumb_offset, thumb_size, settings.thumbnail),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::camera::types::NodeId;
    use crate::backends::camera::DeviceProvider;
    use crate::backends::virtual_camera::{DeviceCall, VirtualProvider};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn engine() -> (VirtualProvider, CaptureEngine) {
        let ids = ControlIds::default();
        let provider = VirtualProvider::new(ids);
        provider
            .node(NodeId::Capture)
            .configure(|c| c.frame_interval = Some(Duration::from_millis(1)));
        let device = provider.open(NodeId::Capture).unwrap();
        let timeouts = Timeouts {
            listener: Duration::from_millis(200),
            ..Timeouts::default()
        };
        let engine = CaptureEngine::new(
            device,
            Arc::new(provider.allocator()),
            ids,
            timeouts,
            EngineSettings::default(),
        );
        (provider, engine)
    }

    fn counting(counter: &Arc<AtomicUsize>) -> ListenerCallback {
        let counter = Arc::clone(counter);
        Arc::new(move |_: &[FrameBuffer]| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_register_starts_session() {
        let (provider, engine) = engine();
        let counter = Arc::new(AtomicUsize::new(0));
        engine
            .register(
                Geometry::new(640, 480),
                PixelFormat::Nv21,
                Arc::new(BusyFlag::new()),
                counting(&counter),
            )
            .unwrap();

        let session = engine.session().unwrap();
        assert_eq!(session.geometry, Geometry::new(640, 480));
        assert_eq!(session.mode, CaptureMode::Preview);
        assert_eq!(session.buffer_count, PREVIEW_BUFFERS_COUNT);
        assert!(provider.node(NodeId::Capture).is_streaming(BufferQueue::Capture));

        let ids = ControlIds::default();
        assert_eq!(
            provider.node(NodeId::Capture).control(ids.capture_mode),
            Some(sensor::UNKNOWN_CAPTURE_MODE)
        );
    }

    #[test]
    fn test_start_refused_when_active() {
        let (_provider, engine) = engine();
        engine
            .register(
                Geometry::new(320, 240),
                PixelFormat::Nv21,
                Arc::new(BusyFlag::new()),
                Arc::new(|_: &[FrameBuffer]| {}),
            )
            .unwrap();

        let before = engine.session().unwrap().base_address;
        assert!(matches!(engine.start(false), Err(CameraError::AlreadyEnabled(_))));
        assert_eq!(engine.session().unwrap().base_address, before);

        engine.stop().unwrap();
        assert!(matches!(engine.stop(), Err(CameraError::NotEnabled(_))));
    }

    #[test]
    fn test_buffer_count_fallback() {
        let (provider, engine) = engine();
        provider.node(NodeId::Capture).configure(|c| c.max_buffers = 3);
        engine
            .register(
                Geometry::new(320, 240),
                PixelFormat::Nv21,
                Arc::new(BusyFlag::new()),
                Arc::new(|_: &[FrameBuffer]| {}),
            )
            .unwrap();
        assert_eq!(engine.session().unwrap().buffer_count, 3);
    }

    #[test]
    fn test_failed_start_unwinds() {
        let (provider, engine) = engine();
        let node = provider.node(NodeId::Capture);
        node.fail_op("stream_on");

        let result = engine.register(
            Geometry::new(320, 240),
            PixelFormat::Nv21,
            Arc::new(BusyFlag::new()),
            Arc::new(|_: &[FrameBuffer]| {}),
        );
        assert!(result.is_err());
        assert!(engine.session().is_none());
        assert_eq!(engine.listener_count(), 0);

        let released = node.calls().iter().any(|(_, call)| {
            matches!(
                call,
                DeviceCall::RequestBuffers {
                    queue: BufferQueue::Capture,
                    count: 0
                }
            )
        });
        assert!(released);
    }

    #[test]
    fn test_compressed_request_without_preview_is_refused() {
        let (_provider, engine) = engine();
        engine.update_settings(EngineSettings {
            preview: Geometry::default(),
            ..EngineSettings::default()
        });

        let result = engine.register(
            Geometry::default(),
            PixelFormat::Jpeg,
            Arc::new(BusyFlag::new()),
            Arc::new(|_: &[FrameBuffer]| {}),
        );
        assert!(matches!(result, Err(CameraError::InvalidArgument(_))));
        assert!(engine.session().is_none());
        assert_eq!(engine.listener_count(), 0);
    }

    #[test]
    fn test_chroma_address_failure_is_not_fatal() {
        let (provider, engine) = engine();
        let ids = ControlIds::default();
        provider.node(NodeId::Capture).fail_control(ids.paddr_cbcr);

        let counter = Arc::new(AtomicUsize::new(0));
        engine
            .register(
                Geometry::new(320, 240),
                PixelFormat::Nv21,
                Arc::new(BusyFlag::new()),
                counting(&counter),
            )
            .unwrap();

        let dispatched = loop {
            match engine.dispatch_cycle().unwrap() {
                CycleOutcome::Idle => continue,
                outcome => break outcome,
            }
        };
        assert!(matches!(dispatched, CycleOutcome::Dispatched { .. }));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dispatch_reaches_listeners_in_order() {
        let (_provider, engine) = engine();
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second"] {
            let order = Arc::clone(&order);
            engine
                .register(
                    Geometry::new(320, 240),
                    PixelFormat::Nv21,
                    Arc::new(BusyFlag::new()),
                    Arc::new(move |buffers: &[FrameBuffer]| {
                        assert_eq!(buffers.len(), 1);
                        lock(&order).push(tag);
                    }),
                )
                .unwrap();
        }

        let outcome = engine.dispatch_cycle().unwrap();
        assert!(matches!(outcome, CycleOutcome::Dispatched { .. }));
        assert_eq!(*lock(&order), vec!["first", "second"]);
        assert_eq!(engine.session().unwrap().dispatched, 1);
    }

    #[test]
    fn test_stuck_listener_faults_session() {
        let (provider, engine) = engine();
        let busy = Arc::new(BusyFlag::new());
        let flag = Arc::clone(&busy);
        engine
            .register(
                Geometry::new(320, 240),
                PixelFormat::Nv21,
                Arc::clone(&busy),
                Arc::new(move |_: &[FrameBuffer]| {
                    flag.try_set();
                }),
            )
            .unwrap();

        let node = provider.node(NodeId::Capture);
        node.clear_calls();
        let result = engine.dispatch_cycle();
        assert!(matches!(result, Err(CameraError::ListenerTimeout { .. })));
        assert!(engine.session().unwrap().faulted);

        // The slot was never handed back
        let requeued = node.calls().iter().any(|(_, call)| {
            matches!(
                call,
                DeviceCall::QueueBuffer {
                    queue: BufferQueue::Capture,
                    ..
                }
            )
        });
        assert!(!requeued);

        // Next renegotiation restarts it
        busy.clear();
        engine
            .register(
                Geometry::new(160, 120),
                PixelFormat::Nv21,
                Arc::new(BusyFlag::new()),
                Arc::new(|_: &[FrameBuffer]| {}),
            )
            .unwrap();
        assert!(!engine.session().unwrap().faulted);
    }

    #[test]
    fn test_recording_defers_reconfiguration() {
        let (_provider, engine) = engine();
        engine
            .register(
                Geometry::new(640, 480),
                PixelFormat::Nv21,
                Arc::new(BusyFlag::new()),
                Arc::new(|_: &[FrameBuffer]| {}),
            )
            .unwrap();
        engine.set_recording_active(true);

        engine
            .register(
                Geometry::new(1280, 960),
                PixelFormat::Nv21,
                Arc::new(BusyFlag::new()),
                Arc::new(|_: &[FrameBuffer]| {}),
            )
            .unwrap();
        assert_eq!(engine.session().unwrap().geometry, Geometry::new(640, 480));
    }

    #[test]
    fn test_worker_dispatches() {
        let (_provider, engine) = engine();
        let counter = Arc::new(AtomicUsize::new(0));
        engine.start_worker().unwrap();
        engine
            .register(
                Geometry::new(320, 240),
                PixelFormat::Nv21,
                Arc::new(BusyFlag::new()),
                counting(&counter),
            )
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while counter.load(Ordering::SeqCst) < 3 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(counter.load(Ordering::SeqCst) >= 3);

        engine.shutdown();
        assert!(engine.session().is_none());
        assert!(!engine.worker_running());
    }
}
