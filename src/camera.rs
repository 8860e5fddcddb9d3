// SPDX-License-Identifier: GPL-3.0-only

//! Host control surface
//!
//! [`Camera`] is what the host holds for one open sensor. It owns the capture
//! engine, the three frame paths and the focus monitor, and keeps the
//! parameter set the host reads and writes.
//!
//! Operations the host drives itself (starting or stopping a path) run with
//! host callbacks held back, so no event reaches the host from inside its own
//! call.

use crate::backends::camera::frame_loop::lock;
use crate::backends::camera::memory::{ContiguousAllocator, MemoryAllocator};
use crate::backends::camera::types::{BufferQueue, NodeId};
use crate::backends::camera::DeviceProvider;
use crate::config::{Config, Facing, SensorPreset};
use crate::errors::{CameraError, CameraResult};
use crate::host::{HostBridge, HostCallbacks, PreviewWindow};
use crate::media::{ExifWriter, JpegEncoder};
use crate::params::{CameraSettings, Parameters};
use crate::pipelines::capture::{CaptureEngine, EngineSettings};
use crate::pipelines::focus::FocusMonitor;
use crate::pipelines::output::OutputResources;
use crate::pipelines::photo::PicturePath;
use crate::pipelines::preview::PreviewPath;
use crate::pipelines::video::RecordingPath;
use crate::pipelines::{DeviceIdentity, PipelineContext};
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

/// What the host learns about a sensor before opening it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CameraInfo {
    pub facing: Facing,
    /// Mounting angle in degrees
    pub orientation: i32,
}

impl CameraInfo {
    pub fn from_preset(preset: &SensorPreset) -> Self {
        Self {
            facing: preset.facing,
            orientation: preset.orientation,
        }
    }
}

/// Number of sensors the host may open
pub fn camera_count(config: &Config) -> usize {
    config.presets.len()
}

/// Description of sensor `index`
pub fn camera_info(config: &Config, index: usize) -> CameraResult<CameraInfo> {
    Ok(CameraInfo::from_preset(config.preset(index)?))
}

fn engine_settings(settings: &CameraSettings, preset: &SensorPreset) -> EngineSettings {
    EngineSettings {
        preview: settings.preview,
        preview_fps: settings.preview_fps,
        picture: settings.picture,
        picture_format: settings.picture_format,
        thumbnail: settings.thumbnail,
        rotation: preset.rotation,
        sensor_resolutions: preset.sensor_resolutions.clone(),
    }
}

/// One open sensor
pub struct Camera {
    ctx: Arc<PipelineContext>,
    preset: SensorPreset,
    params: Mutex<Parameters>,
    preview: PreviewPath,
    picture: PicturePath,
    recording: RecordingPath,
    focus: FocusMonitor,
    released: AtomicBool,
}

impl Camera {
    /// Open sensor `preset_index` of `config`
    ///
    /// Opens the capture node, applies the preset parameters to it and starts
    /// the dispatch worker. Nothing streams until a path starts.
    pub fn open(
        config: &Config,
        preset_index: usize,
        provider: Arc<dyn DeviceProvider>,
        allocator: Arc<dyn MemoryAllocator>,
        contiguous: Option<Arc<dyn ContiguousAllocator>>,
        encoder: Arc<dyn JpegEncoder>,
        exif: Arc<dyn ExifWriter>,
    ) -> CameraResult<Self> {
        let preset = config.preset(preset_index)?.clone();
        let ids = config.controls;

        let device = provider.open(NodeId::Capture)?;
        let driver = device.query_capabilities(BufferQueue::Capture)?;
        info!(
            sensor = %preset.name,
            driver = %driver.driver,
            card = %driver.card,
            "Opened capture node"
        );

        let params = Parameters::from_preset(&preset);
        let mut settings = CameraSettings {
            fimc_is: preset.fimc_is,
            ..CameraSettings::default()
        };
        settings.apply(&params, device.as_ref(), &ids, true);
        debug!(?settings, "Initial settings");

        let engine = CaptureEngine::new(
            Arc::clone(&device),
            Arc::clone(&allocator),
            ids,
            config.timeouts,
            engine_settings(&settings, &preset),
        );
        engine.start_worker()?;

        let host = Arc::new(HostBridge::new());
        let outputs = OutputResources {
            provider,
            allocator,
            contiguous,
            controls: ids,
        };
        let identity = DeviceIdentity {
            make: driver.driver,
            model: preset.name.clone(),
            rotation: preset.rotation,
        };

        let ctx = Arc::new(PipelineContext::new(
            engine,
            outputs,
            Arc::clone(&host),
            encoder,
            exif,
            identity,
            config.timeouts,
            settings,
        ));
        let focus = FocusMonitor::new(device, ids, host, &config.timeouts);

        Ok(Self {
            preview: PreviewPath::new(Arc::clone(&ctx)),
            picture: PicturePath::new(Arc::clone(&ctx)),
            recording: RecordingPath::new(Arc::clone(&ctx)),
            focus,
            ctx,
            preset,
            params: Mutex::new(params),
            released: AtomicBool::new(false),
        })
    }

    pub fn info(&self) -> CameraInfo {
        CameraInfo::from_preset(&self.preset)
    }

    // ===== Host callbacks =====

    pub fn set_callbacks(&self, callbacks: Option<Arc<dyn HostCallbacks>>) {
        self.ctx.host.set_callbacks(callbacks);
    }

    pub fn enable_msg_type(&self, mask: i32) {
        self.ctx.host.enable_msg_type(mask);
    }

    pub fn disable_msg_type(&self, mask: i32) {
        self.ctx.host.disable_msg_type(mask);
    }

    pub fn msg_type_enabled(&self, mask: i32) -> i32 {
        self.ctx.host.msg_type_enabled(mask)
    }

    // ===== Preview =====

    /// Replace the display surface
    ///
    /// A running preview resizes the new surface right away.
    pub fn set_preview_window(&self, window: Option<Arc<dyn PreviewWindow>>) -> CameraResult<()> {
        self.ctx.host.set_window(window.clone());

        if let Some(window) = window {
            if self.preview.enabled() {
                let settings = self.ctx.settings();
                window.set_geometry(settings.preview, settings.preview_format)?;
            }
        }
        Ok(())
    }

    pub fn start_preview(&self) -> CameraResult<()> {
        let _callbacks = self.ctx.host.lock_callbacks();
        self.preview.start()
    }

    pub fn stop_preview(&self) -> CameraResult<()> {
        let _callbacks = self.ctx.host.lock_callbacks();
        self.preview.stop()
    }

    pub fn preview_enabled(&self) -> bool {
        self.preview.enabled()
    }

    // ===== Recording =====

    pub fn store_metadata_in_buffers(&self, enable: bool) -> CameraResult<()> {
        self.recording.store_metadata_in_buffers(enable)
    }

    pub fn start_recording(&self) -> CameraResult<()> {
        let _callbacks = self.ctx.host.lock_callbacks();
        self.recording.start()
    }

    pub fn stop_recording(&self) -> CameraResult<()> {
        let _callbacks = self.ctx.host.lock_callbacks();
        self.recording.stop()
    }

    pub fn recording_enabled(&self) -> bool {
        self.recording.enabled()
    }

    pub fn release_recording_frame(&self, index: u32) -> CameraResult<()> {
        self.recording.release_frame(index)
    }

    // ===== Focus =====

    pub fn auto_focus(&self) -> CameraResult<()> {
        self.focus.start()
    }

    pub fn cancel_auto_focus(&self) -> CameraResult<()> {
        self.focus.cancel()
    }

    // ===== Picture =====

    /// Take one picture
    ///
    /// Ignored while a picture is in progress or the lens is still focusing.
    pub fn take_picture(&self) -> CameraResult<()> {
        if self.picture.running() {
            debug!("Picture already in progress, ignoring request");
            return Ok(());
        }
        if self.focus.running() {
            debug!("Auto-focus in progress, ignoring picture request");
            return Ok(());
        }

        let _callbacks = self.ctx.host.lock_callbacks();
        self.picture.start()
    }

    pub fn cancel_picture(&self) -> CameraResult<()> {
        let _callbacks = self.ctx.host.lock_callbacks();
        match self.picture.stop() {
            Err(CameraError::NotEnabled(_)) => Ok(()),
            result => result,
        }
    }

    /// Whether a picture is in progress
    pub fn picture_running(&self) -> bool {
        self.picture.running()
    }

    // ===== Parameters =====

    /// Merge `text` into the parameter set and apply what changed
    ///
    /// A malformed blob leaves the parameter set untouched. New geometries
    /// take effect on the next path start.
    pub fn set_parameters(&self, text: &str) -> CameraResult<()> {
        let mut params = lock(&self.params);
        let mut merged = params.clone();
        merged.merge(text).inspect_err(|e| {
            error!(error = %e, "Unable to parse parameters");
        })?;

        let engine = &self.ctx.engine;
        let mut settings = self.ctx.settings();
        settings.apply(&merged, engine.device().as_ref(), engine.controls(), false);
        *params = merged;
        drop(params);

        let update = engine_settings(&settings, &self.preset);
        self.ctx.set_settings(settings);
        engine.update_settings(update);
        Ok(())
    }

    /// Current parameter set as `key=value;` text
    pub fn parameters(&self) -> String {
        lock(&self.params).to_string()
    }

    /// Snapshot of the applied settings
    pub fn settings(&self) -> CameraSettings {
        self.ctx.settings()
    }

    // ===== Misc =====

    /// Vendor commands are accepted and ignored
    pub fn send_command(&self, command: i32, arg1: i32, arg2: i32) -> CameraResult<()> {
        debug!(command, arg1, arg2, "Ignoring command");
        Ok(())
    }

    /// Human-readable state summary
    pub fn dump(&self) -> String {
        let settings = self.ctx.settings();
        let engine = &self.ctx.engine;
        let mut out = String::new();

        let _ = writeln!(out, "Sensor: {} ({:?})", self.preset.name, self.preset.facing);
        let _ = writeln!(out, "Driver: {}", self.ctx.identity.make);
        let _ = writeln!(
            out,
            "Preview: {} {} @ {} fps, enabled: {}",
            settings.preview,
            settings.preview_format,
            settings.preview_fps,
            self.preview.enabled()
        );
        let _ = writeln!(
            out,
            "Picture: {} {}, thumbnail {} q{}, jpeg q{}, running: {}",
            settings.picture,
            settings.picture_format,
            settings.thumbnail,
            settings.thumbnail_quality,
            settings.jpeg_quality,
            self.picture.running()
        );
        let _ = writeln!(
            out,
            "Recording: {} {}, {:?}, enabled: {}",
            settings.recording,
            settings.recording_format,
            self.recording.mode(),
            self.recording.enabled()
        );
        let _ = writeln!(out, "Auto-focus running: {}", self.focus.running());
        let _ = writeln!(out, "Listeners: {}", engine.listener_count());
        match engine.session() {
            Some(session) => {
                let _ = writeln!(
                    out,
                    "Capture: {} {} x{} {:?}, dispatched {}{}",
                    session.geometry,
                    session.format,
                    session.buffer_count,
                    session.mode,
                    session.dispatched,
                    if session.faulted { ", faulted" } else { "" }
                );
            }
            None => {
                let _ = writeln!(out, "Capture: stopped");
            }
        }
        out
    }

    /// Stop every path and the engine
    pub fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Err(e) = self.focus.cancel() {
            warn!(error = %e, "Unable to cancel auto-focus on release");
        }

        {
            let _callbacks = self.ctx.host.lock_callbacks();
            if self.picture.running() {
                if let Err(e) = self.picture.stop() {
                    warn!(error = %e, "Unable to stop picture on release");
                }
            }
            if self.recording.enabled() {
                if let Err(e) = self.recording.stop() {
                    warn!(error = %e, "Unable to stop recording on release");
                }
            }
            if self.preview.enabled() {
                if let Err(e) = self.preview.stop() {
                    warn!(error = %e, "Unable to stop preview on release");
                }
            }
        }

        self.ctx.engine.shutdown();
        info!(sensor = %self.preset.name, "Camera released");
    }
}

impl Drop for Camera {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::camera::types::{Geometry, PixelFormat};
    use crate::backends::virtual_camera::VirtualProvider;
    use crate::host::{EventRecorder, HostEvent, msg};
    use crate::media::{ExifBuilder, SoftwareJpegEncoder};
    use std::time::{Duration, Instant};

    fn small_config() -> Config {
        let mut config = Config::default();
        let params = &mut config.presets[0].params;
        params.preview_size = "64x48".to_string();
        params.picture_size = "128x96".to_string();
        params.recording_size = "64x48".to_string();
        params.jpeg_thumbnail_width = 32;
        params.jpeg_thumbnail_height = 24;
        config.timeouts.listener = Duration::from_millis(500);
        config.timeouts.focus_poll = Duration::from_millis(1);
        config
    }

    fn open() -> (Arc<VirtualProvider>, Camera) {
        let config = small_config();
        let provider = Arc::new(VirtualProvider::new(config.controls));
        provider
            .node(NodeId::Capture)
            .configure(|c| c.frame_interval = Some(Duration::from_millis(2)));

        let camera = Camera::open(
            &config,
            0,
            provider.clone(),
            Arc::new(provider.allocator()),
            Some(Arc::new(provider.contiguous())),
            Arc::new(SoftwareJpegEncoder::new()),
            Arc::new(ExifBuilder::new()),
        )
        .unwrap();
        (provider, camera)
    }

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    #[test]
    fn test_open_applies_preset() {
        let (provider, camera) = open();
        let settings = camera.settings();
        assert_eq!(settings.preview, Geometry::new(64, 48));
        assert_eq!(settings.preview_format, PixelFormat::Nv21);
        assert_eq!(settings.picture, Geometry::new(128, 96));
        assert_eq!(settings.picture_format, PixelFormat::Yuyv);
        assert_eq!(settings.recording_format, PixelFormat::Nv12);

        let ids = small_config().controls;
        assert_eq!(provider.node(NodeId::Capture).control(ids.jpeg_quality), Some(90));
        assert!(camera.parameters().contains("picture-size=128x96;"));
        assert_eq!(
            camera.info(),
            CameraInfo {
                facing: Facing::Back,
                orientation: 90
            }
        );
    }

    #[test]
    fn test_camera_info_by_index() {
        let config = Config::default();
        assert_eq!(camera_count(&config), 2);
        assert_eq!(camera_info(&config, 1).unwrap().facing, Facing::Front);
        assert!(camera_info(&config, 5).is_err());
    }

    #[test]
    fn test_picture_reaches_host() {
        let (_provider, camera) = open();
        let recorder = Arc::new(EventRecorder::new());
        camera.set_callbacks(Some(recorder.clone()));
        camera.enable_msg_type(msg::ALL & !msg::PREVIEW_FRAME);

        camera.start_preview().unwrap();
        camera.take_picture().unwrap();
        // A second request while the first runs is ignored
        camera.take_picture().unwrap();

        assert!(wait_for(|| recorder.count(msg::COMPRESSED_IMAGE) == 1));
        assert!(wait_for(|| !camera.picture_running()));
        let events = recorder.events();
        assert_eq!(
            events[0],
            HostEvent::Notify {
                event: msg::SHUTTER,
                arg1: 0,
                arg2: 0
            }
        );
        match &events[1] {
            HostEvent::Data { event, payload, .. } => {
                assert_eq!(*event, msg::COMPRESSED_IMAGE);
                assert_eq!(&payload[..4], &[0xFF, 0xD8, 0xFF, 0xE1]);
            }
            other => panic!("unexpected event {:?}", other),
        }

        // Preview keeps running after the picture
        assert!(camera.preview_enabled());
        camera.stop_preview().unwrap();
    }

    #[test]
    fn test_cancel_picture_without_picture() {
        let (_provider, camera) = open();
        camera.cancel_picture().unwrap();
        camera.cancel_auto_focus().unwrap();
        assert!(matches!(camera.stop_preview(), Err(CameraError::NotEnabled(_))));
        assert!(matches!(camera.stop_recording(), Err(CameraError::NotEnabled(_))));
    }

    #[test]
    fn test_picture_ignored_while_focusing() {
        let (provider, camera) = open();
        provider
            .node(NodeId::Capture)
            .push_focus_results(&[crate::constants::sensor::AF_STATUS_IN_PROGRESS; 100_000]);

        camera.auto_focus().unwrap();
        camera.take_picture().unwrap();
        assert!(!camera.picture_running());
        camera.cancel_auto_focus().unwrap();
    }

    #[test]
    fn test_set_parameters_updates_next_start() {
        let (_provider, camera) = open();
        camera
            .set_parameters("preview-size=128x96;jpeg-quality=75")
            .unwrap();
        let settings = camera.settings();
        assert_eq!(settings.preview, Geometry::new(128, 96));
        assert_eq!(settings.jpeg_quality, 75);
        assert!(camera.parameters().contains("preview-size=128x96;"));

        camera.start_preview().unwrap();
        assert_eq!(
            camera.ctx.engine.session().map(|s| s.geometry),
            Some(Geometry::new(128, 96))
        );
        camera.stop_preview().unwrap();
    }

    #[test]
    fn test_malformed_parameters_leave_state() {
        let (_provider, camera) = open();
        let before = camera.parameters();
        assert!(camera.set_parameters("preview-size=128x96;=5").is_err());
        assert_eq!(camera.parameters(), before);
    }

    #[test]
    fn test_release_stops_everything() {
        let (provider, camera) = open();
        let recorder = Arc::new(EventRecorder::new());
        camera.set_callbacks(Some(recorder.clone()));
        camera.enable_msg_type(msg::VIDEO_FRAME);
        camera.store_metadata_in_buffers(true).unwrap();

        camera.start_preview().unwrap();
        camera.start_recording().unwrap();
        assert!(camera.recording_enabled());
        assert!(matches!(
            camera.store_metadata_in_buffers(false),
            Err(CameraError::Busy(_))
        ));
        assert!(camera.dump().contains("Recording: 64x48"));

        camera.release();
        assert!(!camera.preview_enabled());
        assert!(!camera.recording_enabled());
        assert!(camera.dump().contains("Capture: stopped"));
        assert!(!provider.node(NodeId::Capture).is_streaming(BufferQueue::Capture));

        // Releasing twice is harmless
        camera.release();
    }

    #[test]
    fn test_send_command_is_accepted() {
        let (_provider, camera) = open();
        camera.send_command(1, 2, 3).unwrap();
    }
}
