// SPDX-License-Identifier: GPL-3.0-only

//! Pipeline configuration
//!
//! Everything board specific lives here: the sensor presets, the V4L2 node of
//! each pipeline stage, the driver-private control IDs and the timeouts. A
//! [`Config`] is injected when a camera is opened, so several boards can be
//! driven from the same binary.

use crate::backends::camera::types::{Geometry, NodeId, PixelFormat};
use crate::backends::camera::v4l2_controls::ControlIds;
use crate::constants::timing;
use crate::errors::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Directory name under the user configuration directory
const CONFIG_DIR: &str = "camera-pipeline";
const CONFIG_FILE: &str = "config.json";

/// Which way a sensor looks
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Facing {
    #[default]
    Back,
    Front,
}

impl Facing {
    /// Value reported to the host
    pub fn raw(self) -> i32 {
        match self {
            Facing::Back => 0,
            Facing::Front => 1,
        }
    }
}

/// Sensor bus geometry to program for a capture geometry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorResolution {
    pub capture: Geometry,
    pub sensor: Geometry,
}

impl SensorResolution {
    /// Sensor geometry for `capture`, or `capture` itself when not listed
    pub fn resolve(table: &[SensorResolution], capture: Geometry) -> Geometry {
        table
            .iter()
            .find(|entry| entry.capture == capture)
            .map(|entry| entry.sensor)
            .unwrap_or(capture)
    }
}

/// Initial parameter values of a sensor
///
/// Lists are comma separated, as the host reads them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PresetParams {
    pub preview_size_values: String,
    pub preview_size: String,
    pub preview_format_values: String,
    pub preview_format: String,
    pub preview_frame_rate_values: String,
    pub preview_frame_rate: i32,
    pub preview_fps_range_values: String,
    pub preview_fps_range: String,

    pub picture_size_values: String,
    pub picture_size: String,
    pub picture_format_values: String,
    pub picture_format: String,
    pub jpeg_thumbnail_size_values: String,
    pub jpeg_thumbnail_width: i32,
    pub jpeg_thumbnail_height: i32,
    pub jpeg_thumbnail_quality: i32,
    pub jpeg_quality: i32,

    pub video_snapshot_supported: bool,
    pub full_video_snap_supported: bool,

    pub recording_size: String,
    pub recording_size_values: String,
    pub recording_format: String,

    pub focus_mode: String,
    pub focus_mode_values: String,
    pub focus_distances: String,
    pub focus_areas: Option<String>,
    pub max_num_focus_areas: i32,

    pub zoom_supported: bool,
    pub smooth_zoom_supported: bool,
    pub zoom_ratios: Option<String>,
    pub zoom: i32,
    pub max_zoom: i32,

    pub flash_mode: Option<String>,
    pub flash_mode_values: Option<String>,

    pub exposure_compensation: i32,
    pub exposure_compensation_step: f32,
    pub min_exposure_compensation: i32,
    pub max_exposure_compensation: i32,

    pub whitebalance: String,
    pub whitebalance_values: String,
    pub antibanding: String,
    pub antibanding_values: String,
    pub scene_mode: String,
    pub scene_mode_values: String,
    pub effect: String,
    pub effect_values: String,
    pub iso: String,
    pub iso_values: String,
}

impl Default for PresetParams {
    fn default() -> Self {
        Self {
            preview_size_values: "640x480".to_string(),
            preview_size: "640x480".to_string(),
            preview_format_values: "yuv420sp,yuv420p".to_string(),
            preview_format: "yuv420sp".to_string(),
            preview_frame_rate_values: "30,20,15".to_string(),
            preview_frame_rate: 30,
            preview_fps_range_values: "(15000,30000)".to_string(),
            preview_fps_range: "15000,30000".to_string(),

            picture_size_values: "640x480".to_string(),
            picture_size: "640x480".to_string(),
            picture_format_values: "jpeg".to_string(),
            picture_format: "yuyv".to_string(),
            jpeg_thumbnail_size_values: "160x120,0x0".to_string(),
            jpeg_thumbnail_width: 160,
            jpeg_thumbnail_height: 120,
            jpeg_thumbnail_quality: 100,
            jpeg_quality: 90,

            video_snapshot_supported: false,
            full_video_snap_supported: false,

            recording_size: "640x480".to_string(),
            recording_size_values: "640x480".to_string(),
            recording_format: "yuv420sp".to_string(),

            focus_mode: "fixed".to_string(),
            focus_mode_values: "fixed".to_string(),
            focus_distances: "0.20,0.25,Infinity".to_string(),
            focus_areas: None,
            max_num_focus_areas: 0,

            zoom_supported: false,
            smooth_zoom_supported: false,
            zoom_ratios: None,
            zoom: 0,
            max_zoom: 0,

            flash_mode: None,
            flash_mode_values: None,

            exposure_compensation: 0,
            exposure_compensation_step: 0.5,
            min_exposure_compensation: -4,
            max_exposure_compensation: 4,

            whitebalance: "auto".to_string(),
            whitebalance_values: "auto,fluorescent,daylight,cloudy-daylight".to_string(),
            antibanding: "50hz".to_string(),
            antibanding_values: "50hz,off".to_string(),
            scene_mode: "auto".to_string(),
            scene_mode_values: SCENE_MODE_VALUES.to_string(),
            effect: "none".to_string(),
            effect_values: EFFECT_VALUES.to_string(),
            iso: "auto".to_string(),
            iso_values: "auto,ISO100,ISO200,ISO400,ISO800".to_string(),
        }
    }
}

const SCENE_MODE_VALUES: &str = "auto,portrait,landscape,night,beach,snow,sunset,fireworks,sports,party,candlelight,dusk-dawn,fall-color,text,back-light";
const EFFECT_VALUES: &str = "none,mono,negative,sepia,solarize,sketch,pastel";

/// Description of one sensor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorPreset {
    pub name: String,
    pub facing: Facing,
    /// Mounting angle reported to the host
    pub orientation: i32,
    /// Rotation programmed into the capture node
    pub rotation: i32,
    pub capture_format: PixelFormat,
    pub picture_format: PixelFormat,
    pub focal_length: f32,
    pub horizontal_view_angle: f32,
    pub vertical_view_angle: f32,
    /// Sensor sits behind the FIMC-IS image signal processor
    #[serde(default)]
    pub fimc_is: bool,
    #[serde(default)]
    pub sensor_resolutions: Vec<SensorResolution>,
    pub params: PresetParams,
}

impl SensorPreset {
    /// Rear 8MP sensor
    pub fn isx012() -> Self {
        Self {
            name: "ISX012".to_string(),
            facing: Facing::Back,
            orientation: 90,
            rotation: 0,
            capture_format: PixelFormat::Nv21,
            picture_format: PixelFormat::Yuyv,
            focal_length: 3.43,
            horizontal_view_angle: 59.6,
            vertical_view_angle: 46.3,
            fimc_is: false,
            sensor_resolutions: Vec::new(),
            params: PresetParams {
                preview_size_values: "1024x768".to_string(),
                preview_size: "1024x768".to_string(),
                preview_fps_range_values: "(10000,30000)".to_string(),
                preview_fps_range: "10000,30000".to_string(),
                picture_size_values: "2560x1920,2048x1536,1600x1200,960x720,640x480".to_string(),
                picture_size: "2560x1920".to_string(),
                recording_size: "1280x720".to_string(),
                recording_size_values:
                    "1280x720,1920x1080,720x480,640x480,352x288,320x240,176x144".to_string(),
                focus_mode: "auto".to_string(),
                focus_mode_values: "auto,macro,fixed".to_string(),
                focus_distances: "0.15,1.20,Infinity".to_string(),
                max_num_focus_areas: 1,
                ..PresetParams::default()
            },
        }
    }

    /// Front 1.3MP sensor
    pub fn sr130pc20() -> Self {
        Self {
            name: "SR130PC20".to_string(),
            facing: Facing::Front,
            orientation: 270,
            rotation: 0,
            capture_format: PixelFormat::Nv21,
            picture_format: PixelFormat::Yuyv,
            focal_length: 2.17,
            horizontal_view_angle: 54.7,
            vertical_view_angle: 52.58,
            fimc_is: true,
            sensor_resolutions: Vec::new(),
            params: PresetParams {
                preview_size_values: "640x480,352x288,320x240".to_string(),
                preview_frame_rate_values: "30,20,15,8".to_string(),
                picture_size_values: "1280x960,640x480".to_string(),
                picture_size: "1280x960".to_string(),
                jpeg_thumbnail_size_values: "160x120,160x160,160x90,144x96".to_string(),
                jpeg_quality: 100,
                focus_mode_values: "infinity,fixed".to_string(),
                ..PresetParams::default()
            },
        }
    }
}

/// Device node of every pipeline stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodePaths {
    pub capture: PathBuf,
    pub preview_output: PathBuf,
    pub picture_output: PathBuf,
    pub recording_output: PathBuf,
}

impl Default for NodePaths {
    fn default() -> Self {
        Self {
            capture: PathBuf::from("/dev/video0"),
            preview_output: PathBuf::from("/dev/video1"),
            picture_output: PathBuf::from("/dev/video2"),
            recording_output: PathBuf::from("/dev/video3"),
        }
    }
}

impl NodePaths {
    pub fn path(&self, node: NodeId) -> &Path {
        match node {
            NodeId::Capture => &self.capture,
            NodeId::PreviewOutput => &self.preview_output,
            NodeId::PictureOutput => &self.picture_output,
            NodeId::RecordingOutput => &self.recording_output,
        }
    }

    /// Paths indexed by [`NodeId::index`]
    pub fn to_array(&self) -> [PathBuf; 4] {
        [
            self.capture.clone(),
            self.preview_output.clone(),
            self.picture_output.clone(),
            self.recording_output.clone(),
        ]
    }
}

/// Bounds on waits, stored as milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    /// Longest a dispatched buffer may stay with its listeners
    #[serde(with = "millis")]
    pub listener: Duration,
    /// Longest a worker stop waits for the thread
    #[serde(with = "millis")]
    pub worker_join: Duration,
    /// Readiness poll timeout of the capture node
    #[serde(with = "millis")]
    pub poll: Duration,
    /// Interval between auto-focus status reads
    #[serde(with = "millis")]
    pub focus_poll: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            listener: timing::LISTENER_TIMEOUT,
            worker_join: timing::WORKER_JOIN_TIMEOUT,
            poll: timing::POLL_TIMEOUT,
            focus_poll: timing::FOCUS_POLL_INTERVAL,
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Board configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub presets: Vec<SensorPreset>,
    pub nodes: NodePaths,
    pub controls: ControlIds,
    pub timeouts: Timeouts,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            presets: vec![SensorPreset::isx012(), SensorPreset::sr130pc20()],
            nodes: NodePaths::default(),
            controls: ControlIds::default(),
            timeouts: Timeouts::default(),
        }
    }
}

impl Config {
    /// `<config dir>/camera-pipeline/config.json`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(CONFIG_DIR).join(CONFIG_FILE))
    }

    /// Load from `path`, or from the default location
    ///
    /// A missing file at the default location yields the built-in
    /// configuration; a missing explicit file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let (path, explicit) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => match Self::default_path() {
                Some(path) => (path, false),
                None => {
                    debug!("No configuration directory, using defaults");
                    return Ok(Self::default());
                }
            },
        };

        if !explicit && !path.exists() {
            debug!(path = %path.display(), "No configuration file, using defaults");
            return Ok(Self::default());
        }

        let text = std::fs::read_to_string(&path)?;
        let config = Self::from_json(&text)?;
        info!(path = %path.display(), presets = config.presets.len(), "Loaded configuration");
        Ok(config)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        if config.presets.is_empty() {
            return Err(ConfigError::Parse("no sensor preset".to_string()));
        }
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn preset(&self, index: usize) -> Result<&SensorPreset, ConfigError> {
        self.presets.get(index).ok_or(ConfigError::NoPreset(index))
    }
}
