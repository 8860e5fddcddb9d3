// SPDX-License-Identifier: MPL-2.0

//! Frame routing pipelines
//!
//! One capture engine feeds every path. Each path registers a listener with
//! the geometry and format it wants, keeps the buffer it was handed in a slot
//! and does its work on its own worker thread.
//!
//! # Pipeline Architecture
//!
//! ```text
//!                      ┌─────────────────┐     ┌──────────────┐
//!                  ┌─▶ │  Preview path   │ ──▶ │ window, host │
//! ┌──────────────┐ │   └─────────────────┘     └──────────────┘
//! │ Capture      │ │   ┌─────────────────┐     ┌──────────────┐
//! │ engine       │─┼─▶ │  Picture path   │ ──▶ │ JPEG + EXIF  │
//! │ (node 0)     │ │   └─────────────────┘     └──────────────┘
//! └──────────────┘ │   ┌─────────────────┐     ┌──────────────┐
//!                  └─▶ │ Recording path  │ ──▶ │ host records │
//!                      └─────────────────┘     └──────────────┘
//! ```
//!
//! A path whose wanted shape differs from what the engine negotiated reshapes
//! the buffer through its own output node (see [`output`]).
//!
//! # Modules
//!
//! - [`capture`]: Listener registry, negotiation and the dispatch loop
//! - [`output`]: Buffer reshaping sessions
//! - [`preview`]: Live preview
//! - [`photo`]: Still picture state machine, compression and EXIF
//! - [`video`]: Recording, direct or through metadata records
//! - [`focus`]: Auto-focus status poller

pub mod capture;
pub mod focus;
pub mod output;
pub mod photo;
pub mod preview;
pub mod video;

use crate::backends::camera::frame_loop::lock;
use crate::backends::camera::types::{FrameBuffer, Geometry, PixelFormat};
use crate::config::Timeouts;
use crate::host::HostBridge;
use crate::media::{ExifWriter, JpegEncoder};
use crate::params::CameraSettings;
use capture::CaptureEngine;
use output::OutputResources;
use std::sync::{Arc, Mutex};

/// Names written into picture metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    /// Capture driver name
    pub make: String,
    /// Sensor name
    pub model: String,
    /// Rotation programmed into the capture node, in degrees
    pub rotation: i32,
}

/// Everything the paths share
pub struct PipelineContext {
    pub engine: CaptureEngine,
    pub outputs: OutputResources,
    pub host: Arc<HostBridge>,
    pub encoder: Arc<dyn JpegEncoder>,
    pub exif: Arc<dyn ExifWriter>,
    pub identity: DeviceIdentity,
    pub timeouts: Timeouts,
    settings: Mutex<CameraSettings>,
}

impl PipelineContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        engine: CaptureEngine,
        outputs: OutputResources,
        host: Arc<HostBridge>,
        encoder: Arc<dyn JpegEncoder>,
        exif: Arc<dyn ExifWriter>,
        identity: DeviceIdentity,
        timeouts: Timeouts,
        settings: CameraSettings,
    ) -> Self {
        Self {
            engine,
            outputs,
            host,
            encoder,
            exif,
            identity,
            timeouts,
            settings: Mutex::new(settings),
        }
    }

    /// Snapshot of the current settings
    pub fn settings(&self) -> CameraSettings {
        lock(&self.settings).clone()
    }

    pub fn set_settings(&self, settings: CameraSettings) {
        *lock(&self.settings) = settings;
    }
}

/// Buffer a reshaping path should read from
///
/// Compressed buffers are skipped. A buffer matching `target` exactly wins,
/// otherwise the last raw one is used.
pub fn select_buffer(
    buffers: &[FrameBuffer],
    target: Geometry,
    format: PixelFormat,
) -> Option<&FrameBuffer> {
    let mut chosen = None;
    for buffer in buffers.iter().filter(|b| !b.format.is_compressed()) {
        chosen = Some(buffer);
        if buffer.geometry() == target && buffer.format == format {
            break;
        }
    }
    chosen
}

/// Index of `buffer` among the equally sized buffers of its memory
pub(crate) fn slot_index(buffer: &FrameBuffer) -> u32 {
    if buffer.length == 0 {
        0
    } else {
        (buffer.offset / buffer.length) as u32
    }
}

/// Monotonic timestamp for host deliveries
pub(crate) fn timestamp_ns() -> i64 {
    use std::sync::OnceLock;
    use std::time::Instant;

    static EPOCH: OnceLock<Instant> = OnceLock::new();
    let epoch = EPOCH.get_or_init(Instant::now);
    epoch.elapsed().as_nanos() as i64
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Context wired to the virtual backend

    use super::*;
    use crate::backends::camera::types::NodeId;
    use crate::backends::camera::v4l2_controls::ControlIds;
    use crate::backends::camera::DeviceProvider;
    use crate::backends::virtual_camera::VirtualProvider;
    use crate::media::{ExifBuilder, SoftwareJpegEncoder};
    use capture::EngineSettings;
    use std::time::Duration;

    pub fn settings() -> CameraSettings {
        CameraSettings {
            preview: Geometry::new(64, 48),
            preview_format: PixelFormat::Nv21,
            preview_fps: 30,
            picture: Geometry::new(128, 96),
            picture_format: PixelFormat::Yuyv,
            thumbnail: Geometry::new(32, 24),
            thumbnail_quality: 80,
            jpeg_quality: 90,
            recording: Geometry::new(64, 48),
            recording_format: PixelFormat::Nv12,
            ..CameraSettings::default()
        }
    }

    pub fn context(settings: CameraSettings) -> (Arc<VirtualProvider>, Arc<PipelineContext>) {
        context_with(settings, Arc::new(SoftwareJpegEncoder::new()))
    }

    pub fn context_with(
        settings: CameraSettings,
        encoder: Arc<dyn JpegEncoder>,
    ) -> (Arc<VirtualProvider>, Arc<PipelineContext>) {
        let ids = ControlIds::default();
        let provider = Arc::new(VirtualProvider::new(ids));
        provider
            .node(NodeId::Capture)
            .configure(|c| c.frame_interval = Some(Duration::from_millis(2)));
        let device = provider.open(NodeId::Capture).unwrap();
        let allocator = Arc::new(provider.allocator());
        let timeouts = Timeouts {
            listener: Duration::from_millis(500),
            ..Timeouts::default()
        };

        let engine = CaptureEngine::new(
            device,
            allocator.clone(),
            ids,
            timeouts,
            EngineSettings {
                preview: settings.preview,
                preview_fps: settings.preview_fps,
                picture: settings.picture,
                picture_format: settings.picture_format,
                thumbnail: settings.thumbnail,
                rotation: 0,
                sensor_resolutions: Vec::new(),
            },
        );
        engine.start_worker().unwrap();

        let outputs = OutputResources {
            provider: provider.clone(),
            allocator,
            contiguous: Some(Arc::new(provider.contiguous())),
            controls: ids,
        };

        let ctx = PipelineContext::new(
            engine,
            outputs,
            Arc::new(HostBridge::new()),
            encoder,
            Arc::new(ExifBuilder::new()),
            DeviceIdentity {
                make: "virtual-fimc".to_string(),
                model: "test-sensor".to_string(),
                rotation: 0,
            },
            timeouts,
            settings,
        );
        (provider, Arc::new(ctx))
    }

    /// Poll `condition` for up to two seconds
    pub fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while std::time::Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        condition()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::virtual_camera::HeapMemory;
    use crate::backends::camera::memory::SharedMemory;

    fn buffer(width: u32, height: u32, format: PixelFormat) -> FrameBuffer {
        let memory: Arc<dyn SharedMemory> = Arc::new(HeapMemory::new(16));
        FrameBuffer {
            memory,
            offset: 0,
            length: 16,
            address: 0,
            width,
            height,
            format,
        }
    }

    #[test]
    fn test_select_prefers_exact_match() {
        let buffers = [
            buffer(640, 480, PixelFormat::Nv21),
            buffer(320, 240, PixelFormat::Nv21),
        ];
        let chosen = select_buffer(&buffers, Geometry::new(640, 480), PixelFormat::Nv21).unwrap();
        assert_eq!(chosen.width, 640);

        let chosen = select_buffer(&buffers, Geometry::new(800, 600), PixelFormat::Nv21).unwrap();
        assert_eq!(chosen.width, 320);
    }

    #[test]
    fn test_select_skips_compressed() {
        let buffers = [buffer(640, 480, PixelFormat::Jpeg)];
        assert!(select_buffer(&buffers, Geometry::new(640, 480), PixelFormat::Jpeg).is_none());
    }

    #[test]
    fn test_slot_index() {
        let mut b = buffer(4, 4, PixelFormat::Yuyv);
        b.offset = 48;
        assert_eq!(slot_index(&b), 3);
    }
}
