// SPDX-License-Identifier: GPL-3.0-only

//! Typed camera settings extracted from the parameter set
//!
//! [`CameraSettings::apply`] reads the parameters, updates the settings the
//! pipelines use and pushes sensor controls whose value changed (or all of
//! them when forced). A control the driver refuses is logged and skipped.

use super::Parameters;
use crate::backends::camera::types::{Geometry, PixelFormat};
use crate::backends::camera::v4l2_controls::{AE_UNLOCK, AWB_UNLOCK, ControlIds};
use crate::backends::camera::VideoDevice;
use tracing::{debug, error};

/// Sensor operating mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SensorMode {
    #[default]
    Camera,
    Movie,
}

impl SensorMode {
    pub fn raw(self) -> i32 {
        match self {
            SensorMode::Camera => 0,
            SensorMode::Movie => 1,
        }
    }
}

const FOCUS_MODE_AUTO: i32 = 0;
const FOCUS_MODE_TOUCH: i32 = 6;

const FOCUS_MODES: &[(&str, i32)] = &[
    ("auto", FOCUS_MODE_AUTO),
    ("macro", 1),
    ("facedetect", 2),
    ("infinity", 3),
    ("continuous-video", 4),
    ("continuous-picture", 5),
    ("fixed", 7),
];

const FLASH_MODES: &[(&str, i32)] = &[("off", 1), ("auto", 2), ("on", 3), ("torch", 4)];
const FLASH_MODE_AUTO: i32 = 2;

const ANTIBANDING_MODES: &[(&str, i32)] = &[("auto", 0), ("50hz", 1), ("60hz", 2), ("off", 3)];

const WHITE_BALANCE_MODES: &[(&str, i32)] = &[
    ("auto", 1),
    ("daylight", 2),
    ("cloudy-daylight", 3),
    ("incandescent", 4),
    ("fluorescent", 5),
];

const SCENE_MODES: &[(&str, i32)] = &[
    ("auto", 1),
    ("portrait", 2),
    ("night", 3),
    ("back-light", 4),
    ("landscape", 5),
    ("sports", 6),
    ("party", 7),
    ("beach", 8),
    ("snow", 8),
    ("sunset", 9),
    ("dusk-dawn", 10),
    ("fall-color", 11),
    ("fireworks", 12),
    ("text", 13),
    ("candlelight", 14),
];

const EFFECTS: &[(&str, i32)] = &[
    ("none", 1),
    ("auto", 1),
    ("mono", 2),
    ("sepia", 3),
    ("aqua", 4),
    ("negative", 6),
    ("solarize", 8),
    ("posterize", 9),
    ("washed", 10),
    ("sketch", 11),
    ("vintage-warm", 12),
    ("vintage-cold", 13),
    ("point-blue", 14),
    ("point-red-yellow", 15),
    ("point-green", 16),
];

const ISO_MODES: &[(&str, i32)] = &[
    ("auto", 0),
    ("ISO50", 1),
    ("ISO100", 2),
    ("ISO200", 3),
    ("ISO400", 4),
    ("ISO800", 5),
];

fn lookup(table: &[(&str, i32)], name: &str, fallback: i32) -> i32 {
    table
        .iter()
        .find(|(key, _)| *key == name)
        .map(|(_, value)| *value)
        .unwrap_or(fallback)
}

/// Preview format named by the host
fn preview_format(name: &str) -> PixelFormat {
    match name {
        "yuv420sp" => PixelFormat::Nv21,
        "yuv420p" => PixelFormat::Yuv420,
        "rgb565" => PixelFormat::Rgb565,
        "rgb8888" => PixelFormat::Rgb32,
        other => {
            error!(format = other, "Unsupported preview format");
            PixelFormat::Nv21
        }
    }
}

/// Recording format named by the host; semi-planar records are NV12
fn recording_format(name: &str) -> PixelFormat {
    match name {
        "yuv420sp" => PixelFormat::Nv12,
        "yuv420p" => PixelFormat::Yuv420,
        "rgb565" => PixelFormat::Rgb565,
        "rgb8888" => PixelFormat::Rgb32,
        other => {
            error!(format = other, "Unsupported recording format");
            PixelFormat::Nv12
        }
    }
}

fn picture_format(name: &str) -> PixelFormat {
    match name {
        "jpeg" => PixelFormat::Jpeg,
        "yuyv" => PixelFormat::Yuyv,
        other => {
            error!(format = other, "Unsupported picture format");
            PixelFormat::Jpeg
        }
    }
}

/// `(left,top,right,bottom,weight)` of the first focus area
fn focus_area(text: &str) -> Option<[i32; 5]> {
    let inner = text.strip_prefix('(')?;
    let inner = &inner[..inner.find(')')?];
    let mut values = [0; 5];
    let mut parts = inner.split(',');
    for value in values.iter_mut() {
        *value = parts.next()?.trim().parse().ok()?;
    }
    // Coordinates are in the -1000..=1000 preview space
    if !values[..4].iter().all(|v| (-1000..=1000).contains(v)) {
        return None;
    }
    Some(values)
}

/// Current camera settings
#[derive(Debug, Clone, PartialEq)]
pub struct CameraSettings {
    pub preview: Geometry,
    pub preview_format: PixelFormat,
    pub preview_fps: u32,

    pub picture: Geometry,
    pub picture_format: PixelFormat,
    pub thumbnail: Geometry,
    pub thumbnail_quality: u8,
    pub jpeg_quality: u8,

    pub recording: Geometry,
    pub recording_format: PixelFormat,

    pub sensor_mode: SensorMode,
    /// Sensor behind the FIMC-IS block, which manages its own AE/AWB locks
    pub fimc_is: bool,
    pub focus_mode: Option<i32>,
    pub focus_position: Option<(i32, i32)>,
    pub zoom: Option<i32>,
    pub flash_mode: Option<i32>,
    pub exposure_compensation: Option<i32>,
    pub antibanding: Option<i32>,
    pub white_balance: Option<i32>,
    pub scene_mode: Option<i32>,
    pub effect: Option<i32>,
    pub iso: Option<i32>,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            preview: Geometry::default(),
            preview_format: PixelFormat::Nv21,
            preview_fps: 0,
            picture: Geometry::default(),
            picture_format: PixelFormat::Jpeg,
            thumbnail: Geometry::default(),
            thumbnail_quality: 100,
            jpeg_quality: 100,
            recording: Geometry::default(),
            recording_format: PixelFormat::Nv12,
            sensor_mode: SensorMode::Camera,
            fimc_is: false,
            focus_mode: None,
            focus_position: None,
            zoom: None,
            flash_mode: None,
            exposure_compensation: None,
            antibanding: None,
            white_balance: None,
            scene_mode: None,
            effect: None,
            iso: None,
        }
    }
}

/// Pushes controls for one `apply` run
struct ControlWriter<'a> {
    device: &'a dyn VideoDevice,
    force: bool,
}

impl ControlWriter<'_> {
    /// Set `id` when `wanted` differs from `current` or when forced
    fn update(&self, what: &str, id: u32, current: &mut Option<i32>, wanted: i32) {
        if *current == Some(wanted) && !self.force {
            return;
        }
        *current = Some(wanted);
        match self.device.set_control(id, wanted) {
            Ok(_) => debug!(what, value = wanted, "Control applied"),
            Err(e) => error!(what, value = wanted, error = %e, "Unable to set control"),
        }
    }
}

impl CameraSettings {
    /// Update from `params`, pushing changed controls to `device`
    pub fn apply(
        &mut self,
        params: &Parameters,
        device: &dyn VideoDevice,
        ids: &ControlIds,
        force: bool,
    ) {
        let writer = ControlWriter { device, force };

        // Preview
        let mut preview = params.size("preview-size").unwrap_or_default();
        if preview.width != 0 {
            self.preview.width = preview.width;
        }
        if preview.height != 0 {
            self.preview.height = preview.height;
        }
        if let Some(name) = params.string("preview-format") {
            self.preview_format = preview_format(name);
        }
        self.preview_fps = params
            .int("preview-frame-rate")
            .filter(|fps| *fps > 0)
            .map(|fps| fps as u32)
            .unwrap_or(0);

        // Picture
        if let Some(size) = params.size("picture-size") {
            if !size.is_empty() {
                self.picture = size;
            }
        }
        if let Some(name) = params.string("picture-format") {
            self.picture_format = picture_format(name);
        }
        if let Some(width) = params.int("jpeg-thumbnail-width").filter(|v| *v > 0) {
            self.thumbnail.width = width as u32;
        }
        if let Some(height) = params.int("jpeg-thumbnail-height").filter(|v| *v > 0) {
            self.thumbnail.height = height as u32;
        }
        if let Some(quality) = params.int("jpeg-thumbnail-quality").filter(|v| *v > 0) {
            self.thumbnail_quality = quality.min(100) as u8;
        }
        if let Some(quality) = params.int("jpeg-quality").filter(|v| (0..=100).contains(v)) {
            if quality as u8 != self.jpeg_quality || force {
                self.jpeg_quality = quality as u8;
                if let Err(e) = device.set_control(ids.jpeg_quality, quality) {
                    error!(quality, error = %e, "Unable to set jpeg quality");
                }
            }
        }

        // Recording
        let recording = params
            .size("video-size")
            .or_else(|| params.size("preview-size"))
            .unwrap_or_default();
        if recording.width != 0 {
            self.recording.width = recording.width;
        }
        if recording.height != 0 {
            self.recording.height = recording.height;
        }
        if let Some(name) = params.string("video-frame-format") {
            self.recording_format = recording_format(name);
        }

        let sensor_mode = if params.string("recording-hint") == Some("true") {
            if let Some(size) = same_aspect_preview(params, recording) {
                preview = size;
                self.preview = size;
            }
            SensorMode::Movie
        } else {
            SensorMode::Camera
        };
        if sensor_mode != self.sensor_mode {
            self.sensor_mode = sensor_mode;
            if let Err(e) = device.set_control(ids.sensor_mode, sensor_mode.raw()) {
                error!(?sensor_mode, error = %e, "Unable to set sensor mode");
            }
        }

        // Focus
        let mut focus_mode = None;
        if let Some(text) = params.string("focus-areas") {
            match focus_area(text) {
                None => error!(areas = text, "Unable to scan focus areas"),
                Some([left, top, right, bottom, _])
                    if left != 0 && top != 0 && right != 0 && bottom != 0 =>
                {
                    let x = focus_coordinate(left, right, preview.width);
                    let y = focus_coordinate(top, bottom, preview.height);
                    let (mut cur_x, mut cur_y) = match self.focus_position {
                        Some((x, y)) => (Some(x), Some(y)),
                        None => (None, None),
                    };
                    writer.update("object position x", ids.object_position_x, &mut cur_x, x);
                    writer.update("object position y", ids.object_position_y, &mut cur_y, y);
                    self.focus_position = Some((x, y));
                    focus_mode = Some(FOCUS_MODE_TOUCH);
                }
                Some(_) => {}
            }
        }
        if let Some(name) = params.string("focus-mode") {
            let wanted = focus_mode.unwrap_or_else(|| lookup(FOCUS_MODES, name, FOCUS_MODE_AUTO));
            writer.update("focus mode", ids.focus_mode, &mut self.focus_mode, wanted);
        }

        // Zoom
        if params.string("zoom-supported") == Some("true") {
            let zoom = params.int("zoom").unwrap_or(-1);
            let max_zoom = params.int("max-zoom").unwrap_or(-1);
            if (0..=max_zoom).contains(&zoom) {
                writer.update("zoom", ids.zoom, &mut self.zoom, zoom);
            }
        }

        if let Some(name) = params.string("flash-mode") {
            let wanted = lookup(FLASH_MODES, name, FLASH_MODE_AUTO);
            writer.update("flash mode", ids.flash_mode, &mut self.flash_mode, wanted);
        }

        // Exposure
        if let (Some(value), Some(min), Some(max)) = (
            params.int("exposure-compensation"),
            params.int("min-exposure-compensation"),
            params.int("max-exposure-compensation"),
        ) {
            if (min..=max).contains(&value) {
                writer.update("exposure", ids.exposure, &mut self.exposure_compensation, value);
            }
        }

        if let Some(name) = params.string("antibanding") {
            let wanted = lookup(ANTIBANDING_MODES, name, 0);
            writer.update("antibanding", ids.anti_banding, &mut self.antibanding, wanted);
        }

        if !self.fimc_is {
            if let Err(e) = device.set_control(ids.ae_lock, AE_UNLOCK) {
                error!(error = %e, "Unable to unlock auto-exposure");
            }
            if let Err(e) = device.set_control(ids.awb_lock, AWB_UNLOCK) {
                error!(error = %e, "Unable to unlock auto-white-balance");
            }
        }
        if let Some(name) = params.string("whitebalance") {
            let wanted = lookup(WHITE_BALANCE_MODES, name, 1);
            writer.update("white balance", ids.white_balance, &mut self.white_balance, wanted);
        }
        if let Some(name) = params.string("scene-mode") {
            let wanted = lookup(SCENE_MODES, name, 1);
            writer.update("scene mode", ids.scene_mode, &mut self.scene_mode, wanted);
        }
        if let Some(name) = params.string("effect") {
            let wanted = lookup(EFFECTS, name, 1);
            writer.update("effect", ids.effect, &mut self.effect, wanted);
        }
        if let Some(name) = params.string("iso") {
            let wanted = lookup(ISO_MODES, name, 0);
            writer.update("iso", ids.iso, &mut self.iso, wanted);
        }
    }
}

/// First listed preview size with the aspect ratio of `recording`
/// Center of `low..high` mapped from the -1000..=1000 space onto `extent` pixels
fn focus_coordinate(low: i32, high: i32, extent: u32) -> i32 {
    let center = (i64::from(low) + i64::from(high)) / 2 + 1000;
    let pixel = center * i64::from(extent) / 2000;
    i32::try_from(pixel).unwrap_or(i32::MAX)
}

fn same_aspect_preview(params: &Parameters, recording: Geometry) -> Option<Geometry> {
    if recording.is_empty() {
        return None;
    }
    params
        .string("preview-size-values")?
        .split(',')
        .filter_map(|size| size.trim().parse::<Geometry>().ok())
        .find(|size| {
            u64::from(recording.width) * u64::from(size.height) / u64::from(recording.height)
                == u64::from(size.width)
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::camera::types::NodeId;
    use crate::backends::camera::DeviceProvider;
    use crate::backends::virtual_camera::{DeviceCall, VirtualProvider};
    use crate::config::SensorPreset;

    fn setup() -> (VirtualProvider, std::sync::Arc<dyn VideoDevice>) {
        let provider = VirtualProvider::new(ControlIds::default());
        let device = provider.open(NodeId::Capture).unwrap();
        (provider, device)
    }

    fn control_writes(provider: &VirtualProvider, id: u32) -> usize {
        provider
            .node(NodeId::Capture)
            .calls()
            .iter()
            .filter(|(_, call)| matches!(call, DeviceCall::SetControl { id: i, .. } if *i == id))
            .count()
    }

    #[test]
    fn test_preset_settings() {
        let (provider, device) = setup();
        let ids = ControlIds::default();
        let params = Parameters::from_preset(&SensorPreset::isx012());

        let mut settings = CameraSettings::default();
        settings.apply(&params, device.as_ref(), &ids, true);

        assert_eq!(settings.preview, Geometry::new(1024, 768));
        assert_eq!(settings.preview_format, PixelFormat::Nv21);
        assert_eq!(settings.preview_fps, 30);
        assert_eq!(settings.picture, Geometry::new(2560, 1920));
        assert_eq!(settings.picture_format, PixelFormat::Yuyv);
        assert_eq!(settings.thumbnail, Geometry::new(160, 120));
        assert_eq!(settings.jpeg_quality, 90);
        assert_eq!(settings.recording, Geometry::new(1280, 720));
        assert_eq!(settings.recording_format, PixelFormat::Nv12);
        assert_eq!(settings.focus_mode, Some(FOCUS_MODE_AUTO));
        assert_eq!(settings.zoom, None);

        let node = provider.node(NodeId::Capture);
        assert_eq!(node.control(ids.jpeg_quality), Some(90));
        assert_eq!(node.control(ids.exposure), Some(0));
        assert_eq!(node.control(ids.anti_banding), Some(1));
    }

    #[test]
    fn test_unforced_apply_skips_unchanged_controls() {
        let (provider, device) = setup();
        let ids = ControlIds::default();
        let mut params = Parameters::from_preset(&SensorPreset::isx012());
        let mut settings = CameraSettings::default();
        settings.apply(&params, device.as_ref(), &ids, true);
        provider.node(NodeId::Capture).clear_calls();

        params.merge("whitebalance=daylight").unwrap();
        settings.apply(&params, device.as_ref(), &ids, false);

        assert_eq!(control_writes(&provider, ids.white_balance), 1);
        assert_eq!(control_writes(&provider, ids.focus_mode), 0);
        assert_eq!(control_writes(&provider, ids.jpeg_quality), 0);
        assert_eq!(settings.white_balance, Some(2));
    }

    #[test]
    fn test_out_of_range_values_are_ignored() {
        let (_provider, device) = setup();
        let ids = ControlIds::default();
        let mut params = Parameters::from_preset(&SensorPreset::isx012());
        let mut settings = CameraSettings::default();
        settings.apply(&params, device.as_ref(), &ids, true);

        params.merge("jpeg-quality=150;exposure-compensation=9").unwrap();
        settings.apply(&params, device.as_ref(), &ids, false);
        assert_eq!(settings.jpeg_quality, 90);
        assert_eq!(settings.exposure_compensation, Some(0));
    }

    #[test]
    fn test_recording_hint_picks_matching_preview() {
        let (provider, device) = setup();
        let ids = ControlIds::default();
        let mut params = Parameters::parse(
            "preview-size-values=640x480,1280x720,640x360;preview-size=640x480;video-size=1920x1080;recording-hint=true",
        )
        .unwrap();
        let mut settings = CameraSettings::default();
        settings.apply(&params, device.as_ref(), &ids, false);

        assert_eq!(settings.sensor_mode, SensorMode::Movie);
        assert_eq!(settings.preview, Geometry::new(1280, 720));
        assert_eq!(provider.node(NodeId::Capture).control(ids.sensor_mode), Some(1));

        params.merge("recording-hint=false").unwrap();
        settings.apply(&params, device.as_ref(), &ids, false);
        assert_eq!(settings.sensor_mode, SensorMode::Camera);
        assert_eq!(settings.preview, Geometry::new(640, 480));
    }

    #[test]
    fn test_focus_area_sets_touch_focus() {
        let (provider, device) = setup();
        let ids = ControlIds::default();
        let params = Parameters::parse(
            "preview-size=1000x500;focus-areas=(-100,-100,100,100,1);focus-mode=auto",
        )
        .unwrap();
        let mut settings = CameraSettings::default();
        settings.apply(&params, device.as_ref(), &ids, false);

        assert_eq!(settings.focus_position, Some((500, 250)));
        assert_eq!(settings.focus_mode, Some(FOCUS_MODE_TOUCH));
        let node = provider.node(NodeId::Capture);
        assert_eq!(node.control(ids.object_position_x), Some(500));
        assert_eq!(node.control(ids.focus_mode), Some(FOCUS_MODE_TOUCH));
    }

    #[test]
    fn test_ae_awb_unlocked_unless_fimc_is() {
        let (provider, device) = setup();
        let ids = ControlIds::default();
        let params = Parameters::from_preset(&SensorPreset::isx012());

        let mut settings = CameraSettings::default();
        settings.apply(&params, device.as_ref(), &ids, false);
        assert_eq!(control_writes(&provider, ids.ae_lock), 1);
        assert_eq!(control_writes(&provider, ids.awb_lock), 1);
        let node = provider.node(NodeId::Capture);
        assert_eq!(node.control(ids.ae_lock), Some(AE_UNLOCK));
        assert_eq!(node.control(ids.awb_lock), Some(AWB_UNLOCK));

        node.clear_calls();
        let mut settings = CameraSettings {
            fimc_is: true,
            ..CameraSettings::default()
        };
        settings.apply(&params, device.as_ref(), &ids, true);
        assert_eq!(control_writes(&provider, ids.ae_lock), 0);
        assert_eq!(control_writes(&provider, ids.awb_lock), 0);
    }

    #[test]
    fn test_failing_control_is_not_fatal() {
        let (provider, device) = setup();
        let ids = ControlIds::default();
        provider.node(NodeId::Capture).fail_control(ids.flash_mode);
        let params = Parameters::parse("flash-mode=torch;iso=ISO400").unwrap();

        let mut settings = CameraSettings::default();
        settings.apply(&params, device.as_ref(), &ids, false);
        assert_eq!(settings.flash_mode, Some(4));
        assert_eq!(settings.iso, Some(4));
    }

    #[test]
    fn test_focus_area_parsing() {
        assert_eq!(focus_area("(1,2,3,4,5)"), Some([1, 2, 3, 4, 5]));
        assert_eq!(focus_area("(0,0,0,0,0),(1,1,1,1,1)"), Some([0; 5]));
        assert_eq!(focus_area("(1,2,3)"), None);
        assert_eq!(focus_area("junk"), None);
        assert_eq!(focus_area("(-1000,-1000,1000,1000,1)"), Some([-1000, -1000, 1000, 1000, 1]));
        assert_eq!(focus_area("(2000000000,1,2000000000,1,1)"), None);
        assert_eq!(focus_coordinate(1000, 1000, u32::MAX), i32::MAX);
    }

    #[test]
    fn test_out_of_range_focus_area_is_ignored() {
        let (provider, device) = setup();
        let ids = ControlIds::default();
        let params = Parameters::parse(
            "preview-size=1000x500;focus-areas=(2000000000,1,2000000000,1,1);focus-mode=auto",
        )
        .unwrap();
        let mut settings = CameraSettings::default();
        settings.apply(&params, device.as_ref(), &ids, false);

        assert_eq!(settings.focus_position, None);
        assert_eq!(settings.focus_mode, Some(FOCUS_MODE_AUTO));
        assert_eq!(provider.node(NodeId::Capture).control(ids.object_position_x), None);
    }

    #[test]
    fn test_same_aspect_preview_handles_large_sizes() {
        let params = Parameters::parse("preview-size-values=300000x100000,200000x100000").unwrap();
        assert_eq!(
            same_aspect_preview(&params, Geometry::new(100000, 50000)),
            Some(Geometry::new(200000, 100000))
        );
    }
}
