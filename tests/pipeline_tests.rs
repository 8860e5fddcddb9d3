// SPDX-License-Identifier: GPL-3.0-only

//! Integration tests for the capture engine and the host surface

use camera_pipeline::backends::camera::frame_loop::{BusyFlag, lock};
use camera_pipeline::backends::camera::types::{BufferQueue, FrameBuffer, Geometry, NodeId, PixelFormat};
use camera_pipeline::backends::camera::DeviceProvider;
use camera_pipeline::backends::virtual_camera::{DeviceCall, VirtualProvider};
use camera_pipeline::config::Timeouts;
use camera_pipeline::constants::sensor;
use camera_pipeline::host::{EventRecorder, HostEvent};
use camera_pipeline::media::{ExifBuilder, SoftwareJpegEncoder};
use camera_pipeline::pipelines::capture::{CaptureEngine, CycleOutcome, EngineSettings};
use camera_pipeline::pipelines::video::{MetadataRecord, RECORD_SIZE};
use camera_pipeline::{Camera, CameraError, Config, PreviewWindow, msg};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

fn engine(provider: &VirtualProvider) -> CaptureEngine {
    let config = Config::default();
    let device = provider.open(NodeId::Capture).unwrap();
    CaptureEngine::new(
        device,
        Arc::new(provider.allocator()),
        config.controls,
        Timeouts {
            listener: Duration::from_millis(500),
            ..Timeouts::default()
        },
        EngineSettings {
            preview: Geometry::new(320, 240),
            ..EngineSettings::default()
        },
    )
}

fn noop(_: &[FrameBuffer]) {}

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

fn open_camera() -> (Arc<VirtualProvider>, Camera) {
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
fn test_negotiation_follows_listeners() {
    let provider = VirtualProvider::new(Config::default().controls);
    let engine = engine(&provider);

    let raw = engine
        .register(
            Geometry::new(640, 480),
            PixelFormat::Nv21,
            Arc::new(BusyFlag::new()),
            Arc::new(noop),
        )
        .unwrap();
    let session = engine.session().unwrap();
    assert_eq!((session.geometry, session.format), (Geometry::new(640, 480), PixelFormat::Nv21));

    let compressed = engine
        .register(
            Geometry::new(1280, 960),
            PixelFormat::Jpeg,
            Arc::new(BusyFlag::new()),
            Arc::new(noop),
        )
        .unwrap();
    let session = engine.session().unwrap();
    assert_eq!(
        (session.geometry, session.format),
        (Geometry::new(1280, 960), PixelFormat::Jpeg)
    );

    engine.unregister(compressed).unwrap();
    let session = engine.session().unwrap();
    assert_eq!((session.geometry, session.format), (Geometry::new(640, 480), PixelFormat::Nv21));

    engine.unregister(raw).unwrap();
    assert!(engine.session().is_none());
    assert!(!provider.node(NodeId::Capture).is_streaming(BufferQueue::Capture));
}

#[test]
fn test_covered_listener_keeps_session() {
    let provider = VirtualProvider::new(Config::default().controls);
    let engine = engine(&provider);

    let large = engine
        .register(
            Geometry::new(640, 480),
            PixelFormat::Nv21,
            Arc::new(BusyFlag::new()),
            Arc::new(noop),
        )
        .unwrap();
    provider.node(NodeId::Capture).clear_calls();

    let small = engine
        .register(
            Geometry::new(320, 240),
            PixelFormat::Nv21,
            Arc::new(BusyFlag::new()),
            Arc::new(noop),
        )
        .unwrap();
    engine.unregister(small).unwrap();

    // Nothing was restarted
    let restarted = provider
        .node(NodeId::Capture)
        .calls()
        .iter()
        .any(|(_, call)| matches!(call, DeviceCall::StreamOff(_) | DeviceCall::StreamOn(_)));
    assert!(!restarted);
    assert_eq!(engine.session().unwrap().geometry, Geometry::new(640, 480));
    engine.unregister(large).unwrap();
}

#[test]
fn test_requeue_waits_for_slow_listener() {
    let provider = VirtualProvider::new(Config::default().controls);
    let engine = engine(&provider);

    let busy = Arc::new(BusyFlag::new());
    let cleared_at = Arc::new(Mutex::new(None::<Instant>));
    let callback_busy = Arc::clone(&busy);
    let callback_cleared = Arc::clone(&cleared_at);
    engine
        .register(
            Geometry::new(320, 240),
            PixelFormat::Nv21,
            Arc::clone(&busy),
            Arc::new(move |_: &[FrameBuffer]| {
                assert!(callback_busy.try_set());
                let busy = Arc::clone(&callback_busy);
                let cleared = Arc::clone(&callback_cleared);
                std::thread::spawn(move || {
                    std::thread::sleep(Duration::from_millis(40));
                    *lock(&cleared) = Some(Instant::now());
                    busy.clear();
                });
            }),
        )
        .unwrap();
    provider.node(NodeId::Capture).clear_calls();

    let outcome = loop {
        match engine.dispatch_cycle().unwrap() {
            CycleOutcome::Idle => continue,
            dispatched => break dispatched,
        }
    };
    let CycleOutcome::Dispatched { index } = outcome else {
        unreachable!();
    };

    let cleared = lock(&cleared_at).expect("listener never finished");
    let requeued = provider
        .node(NodeId::Capture)
        .calls()
        .into_iter()
        .find_map(|(at, call)| match call {
            DeviceCall::QueueBuffer {
                queue: BufferQueue::Capture,
                index: queued,
            } if queued == index => Some(at),
            _ => None,
        })
        .expect("slot was not requeued");
    assert!(requeued >= cleared);
    assert!(!busy.is_busy());
}

#[derive(Default)]
struct RecordingWindow {
    frames: Mutex<Vec<(Geometry, usize)>>,
}

impl PreviewWindow for RecordingWindow {
    fn set_geometry(&self, _geometry: Geometry, _format: PixelFormat) -> camera_pipeline::CameraResult<()> {
        Ok(())
    }

    fn post(&self, frame: &[u8], geometry: Geometry, _format: PixelFormat) -> camera_pipeline::CameraResult<()> {
        lock(&self.frames).push((geometry, frame.len()));
        Ok(())
    }
}

#[test]
fn test_preview_and_recording_share_capture() {
    let (provider, camera) = open_camera();
    let window = Arc::new(RecordingWindow::default());
    camera.set_preview_window(Some(window.clone())).unwrap();

    let recorder = Arc::new(EventRecorder::with_buffer_size(RECORD_SIZE));
    camera.set_callbacks(Some(recorder.clone()));
    camera.enable_msg_type(msg::VIDEO_FRAME);
    camera.store_metadata_in_buffers(true).unwrap();

    camera.start_preview().unwrap();
    camera.start_recording().unwrap();
    assert!(matches!(camera.start_recording(), Err(CameraError::AlreadyEnabled(_))));

    // Each record names a recording output slot, released one by one
    for expected in 0..8u32 {
        assert!(wait_for(|| recorder.count(msg::VIDEO_FRAME) as u32 == expected + 1));
        let Some(HostEvent::DataTimestamp { index, payload, .. }) = recorder.events().last().cloned()
        else {
            panic!("no recording frame");
        };
        let record = MetadataRecord::from_le_bytes(&payload).unwrap();
        assert_eq!(index, expected % 6);
        assert_eq!(record.index, expected % 6);
        assert_ne!(record.y, 0);
        camera.release_recording_frame(index).unwrap();
    }

    assert!(wait_for(|| lock(&window.frames).len() >= 3));
    let (geometry, length) = lock(&window.frames)[0];
    assert_eq!(geometry, Geometry::new(64, 48));
    assert!(length > 0);

    camera.stop_recording().unwrap();
    camera.stop_preview().unwrap();
    assert!(!provider.node(NodeId::Capture).is_streaming(BufferQueue::Capture));
}

#[test]
fn test_auto_focus_outcome_reaches_host() {
    let (provider, camera) = open_camera();
    let recorder = Arc::new(EventRecorder::new());
    camera.set_callbacks(Some(recorder.clone()));
    camera.enable_msg_type(msg::FOCUS);

    provider.node(NodeId::Capture).push_focus_results(&[
        sensor::ISX012_AUTO_FOCUS_IN_PROGRESS,
        sensor::AF_STATUS_IN_PROGRESS,
        sensor::AF_STATUS_FAIL,
    ]);
    camera.auto_focus().unwrap();
    assert!(wait_for(|| recorder.count(msg::FOCUS) == 1));
    assert_eq!(
        recorder.events(),
        vec![HostEvent::Notify {
            event: msg::FOCUS,
            arg1: 0,
            arg2: 0
        }]
    );

    camera.auto_focus().unwrap();
    assert!(wait_for(|| recorder.count(msg::FOCUS) == 2));
    assert_eq!(
        recorder.events().last(),
        Some(&HostEvent::Notify {
            event: msg::FOCUS,
            arg1: 1,
            arg2: 0
        })
    );
}

#[test]
fn test_masked_events_are_not_delivered() {
    let (_provider, camera) = open_camera();
    let recorder = Arc::new(EventRecorder::new());
    camera.set_callbacks(Some(recorder.clone()));
    camera.enable_msg_type(msg::ALL);
    camera.disable_msg_type(msg::PREVIEW_FRAME | msg::SHUTTER);
    assert_eq!(camera.msg_type_enabled(msg::SHUTTER), 0);

    camera.start_preview().unwrap();
    camera.take_picture().unwrap();
    assert!(wait_for(|| recorder.count(msg::COMPRESSED_IMAGE) == 1));
    assert!(wait_for(|| !camera.picture_running()));

    assert_eq!(recorder.count(msg::SHUTTER), 0);
    assert_eq!(recorder.count(msg::PREVIEW_FRAME), 0);
    camera.stop_preview().unwrap();
}
