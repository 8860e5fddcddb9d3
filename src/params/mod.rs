// SPDX-License-Identifier: GPL-3.0-only

//! Host parameter set
//!
//! The host exchanges settings as one string of `key=value` entries joined by
//! `;`. [`Parameters`] keeps them in insertion order with a type sniffed from
//! the text, and [`settings`] turns them into typed camera settings.

pub mod settings;

pub use settings::{CameraSettings, SensorMode};

use crate::backends::camera::types::Geometry;
use crate::config::SensorPreset;
use crate::errors::ParamsError;
use std::fmt;
use tracing::warn;

/// Typed value of a parameter
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Int(i32),
    Float(f32),
    Str(String),
}

impl ParamValue {
    /// Sniff the type of a raw value
    ///
    /// A leading digit or `-` makes an integer, unless a later character is a
    /// `.` (float) or any other non-digit (string).
    pub fn sniff(raw: &str) -> Self {
        let bytes = raw.as_bytes();
        let numeric = bytes
            .first()
            .is_some_and(|b| b.is_ascii_digit() || *b == b'-');
        if !numeric {
            return ParamValue::Str(raw.to_string());
        }

        let mut float = false;
        for b in &bytes[1..] {
            if *b == b'.' {
                float = true;
            } else if !b.is_ascii_digit() {
                return ParamValue::Str(raw.to_string());
            }
        }

        if float {
            ParamValue::Float(leading_float(raw))
        } else {
            ParamValue::Int(raw.parse().unwrap_or(0))
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            ParamValue::Int(_) => "int",
            ParamValue::Float(_) => "float",
            ParamValue::Str(_) => "string",
        }
    }
}

/// Longest prefix that parses as a float, `0.0` when none does
fn leading_float(raw: &str) -> f32 {
    (1..=raw.len())
        .rev()
        .filter_map(|end| raw.get(..end))
        .find_map(|prefix| prefix.parse().ok())
        .unwrap_or(0.0)
}

/// `%g` with six significant digits
pub fn format_float(value: f32) -> String {
    let value = f64::from(value);
    if value == 0.0 {
        return "0".to_string();
    }
    if !value.is_finite() {
        return value.to_string();
    }

    let exponent = value.abs().log10().floor() as i32;
    if (-4..6).contains(&exponent) {
        let decimals = (5 - exponent).max(0) as usize;
        trim_fraction(format!("{:.*}", decimals, value))
    } else {
        let formatted = format!("{:.5e}", value);
        let (mantissa, exp) = formatted.split_once('e').unwrap_or((&formatted, "0"));
        let exp: i32 = exp.parse().unwrap_or(0);
        let sign = if exp < 0 { '-' } else { '+' };
        format!("{}e{}{:02}", trim_fraction(mantissa.to_string()), sign, exp.abs())
    }
}

fn trim_fraction(mut text: String) -> String {
    if text.contains('.') {
        while text.ends_with('0') {
            text.pop();
        }
        if text.ends_with('.') {
            text.pop();
        }
    }
    text
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Int(value) => write!(f, "{}", value),
            ParamValue::Float(value) => f.write_str(&format_float(*value)),
            ParamValue::Str(value) => f.write_str(value),
        }
    }
}

fn reserved(text: &str) -> bool {
    text.contains('=') || text.contains(';')
}

/// Ordered `key=value` set
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Parameters {
    entries: Vec<(String, ParamValue)>,
}

impl Parameters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Initial parameter set of a sensor
    pub fn from_preset(preset: &SensorPreset) -> Self {
        let p = &preset.params;
        let mut params = Self::new();
        let mut put = |key: &str, value: ParamValue| {
            if let Err(e) = params.set(key, value) {
                warn!(key, error = %e, "Skipping preset parameter");
            }
        };
        let text = |value: &str| ParamValue::Str(value.to_string());
        let flag = |value: bool| text(if value { "true" } else { "false" });

        put("preferred-preview-size-for-video", text(&p.preview_size));

        put("preview-size-values", text(&p.preview_size_values));
        put("preview-size", text(&p.preview_size));
        put("preview-format-values", text(&p.preview_format_values));
        put("preview-format", text(&p.preview_format));
        put("preview-frame-rate-values", text(&p.preview_frame_rate_values));
        put("preview-frame-rate", ParamValue::Int(p.preview_frame_rate));
        put("preview-fps-range-values", text(&p.preview_fps_range_values));
        put("preview-fps-range", text(&p.preview_fps_range));

        put("picture-size-values", text(&p.picture_size_values));
        put("picture-size", text(&p.picture_size));
        put("picture-format-values", text(&p.picture_format_values));
        put("picture-format", text(&p.picture_format));
        put("jpeg-thumbnail-size-values", text(&p.jpeg_thumbnail_size_values));
        put("jpeg-thumbnail-width", ParamValue::Int(p.jpeg_thumbnail_width));
        put("jpeg-thumbnail-height", ParamValue::Int(p.jpeg_thumbnail_height));
        put("jpeg-thumbnail-quality", ParamValue::Int(p.jpeg_thumbnail_quality));
        put("jpeg-quality", ParamValue::Int(p.jpeg_quality));

        if p.video_snapshot_supported {
            put("video-snapshot-supported", flag(true));
        }
        if p.full_video_snap_supported {
            put("full-video-snap-supported", flag(true));
        }

        put("video-size", text(&p.recording_size));
        put("video-size-values", text(&p.recording_size_values));
        put("video-frame-format", text(&p.recording_format));

        put("focus-mode", text(&p.focus_mode));
        put("focus-mode-values", text(&p.focus_mode_values));
        put("focus-distances", text(&p.focus_distances));
        if p.max_num_focus_areas > 0 {
            if let Some(areas) = &p.focus_areas {
                put("focus-areas", text(areas));
            }
            put("max-num-focus-areas", ParamValue::Int(p.max_num_focus_areas));
        }

        put("zoom-supported", flag(p.zoom_supported));
        if p.zoom_supported {
            if p.smooth_zoom_supported {
                put("smooth-zoom-supported", flag(true));
            }
            if let Some(ratios) = &p.zoom_ratios {
                put("zoom-ratios", text(ratios));
            }
            put("zoom", ParamValue::Int(p.zoom));
            put("max-zoom", ParamValue::Int(p.max_zoom));
        }

        if let Some(mode) = &p.flash_mode {
            put("flash-mode", text(mode));
        }
        if let Some(values) = &p.flash_mode_values {
            put("flash-mode-values", text(values));
        }

        put("exposure-compensation", ParamValue::Int(p.exposure_compensation));
        put(
            "exposure-compensation-step",
            ParamValue::Float(p.exposure_compensation_step),
        );
        put("min-exposure-compensation", ParamValue::Int(p.min_exposure_compensation));
        put("max-exposure-compensation", ParamValue::Int(p.max_exposure_compensation));

        put("antibanding", text(&p.antibanding));
        put("antibanding-values", text(&p.antibanding_values));
        put("whitebalance", text(&p.whitebalance));
        put("whitebalance-values", text(&p.whitebalance_values));
        put("scene-mode", text(&p.scene_mode));
        put("scene-mode-values", text(&p.scene_mode_values));
        put("effect", text(&p.effect));
        put("effect-values", text(&p.effect_values));
        put("iso", text(&p.iso));
        put("iso-values", text(&p.iso_values));

        put("focal-length", ParamValue::Float(preset.focal_length));
        put("horizontal-view-angle", ParamValue::Float(preset.horizontal_view_angle));
        put("vertical-view-angle", ParamValue::Float(preset.vertical_view_angle));

        params
    }

    /// Parse a `key=value;key=value` blob into a fresh set
    pub fn parse(text: &str) -> Result<Self, ParamsError> {
        let mut params = Self::new();
        params.merge(text)?;
        Ok(params)
    }

    /// Set every entry of a blob, updating existing keys in place
    ///
    /// Entries before a rejected one stay applied.
    pub fn merge(&mut self, text: &str) -> Result<(), ParamsError> {
        let mut rest = text;
        while let Some((key, tail)) = rest.split_once('=') {
            let (value, next) = match tail.split_once(';') {
                Some((value, next)) => (value, Some(next)),
                None => (tail, None),
            };

            self.set(key, ParamValue::sniff(value))?;

            match next {
                Some(next) => rest = next,
                None => break,
            }
        }
        Ok(())
    }

    /// Set a value, appending the key if it is new
    pub fn set(&mut self, key: &str, value: ParamValue) -> Result<(), ParamsError> {
        if key.is_empty() || reserved(key) {
            return Err(ParamsError::InvalidKey(key.to_string()));
        }
        if let ParamValue::Str(text) = &value {
            if reserved(text) {
                return Err(ParamsError::InvalidValue {
                    key: key.to_string(),
                    value: text.clone(),
                });
            }
        }

        match self.entries.iter_mut().find(|(k, _)| k == key) {
            Some((_, current)) => {
                if std::mem::discriminant(current) != std::mem::discriminant(&value) {
                    warn!(key, from = current.type_name(), to = value.type_name(), "Mismatching types");
                }
                *current = value;
            }
            None => self.entries.push((key.to_string(), value)),
        }
        Ok(())
    }

    pub fn set_int(&mut self, key: &str, value: i32) -> Result<(), ParamsError> {
        self.set(key, ParamValue::Int(value))
    }

    pub fn set_float(&mut self, key: &str, value: f32) -> Result<(), ParamsError> {
        self.set(key, ParamValue::Float(value))
    }

    pub fn set_str(&mut self, key: &str, value: &str) -> Result<(), ParamsError> {
        self.set(key, ParamValue::Str(value.to_string()))
    }

    pub fn get(&self, key: &str) -> Option<&ParamValue> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn int(&self, key: &str) -> Option<i32> {
        match self.get(key)? {
            ParamValue::Int(value) => Some(*value),
            _ => None,
        }
    }

    pub fn float(&self, key: &str) -> Option<f32> {
        match self.get(key)? {
            ParamValue::Float(value) => Some(*value),
            _ => None,
        }
    }

    pub fn string(&self, key: &str) -> Option<&str> {
        match self.get(key)? {
            ParamValue::Str(value) => Some(value),
            _ => None,
        }
    }

    /// A `WxH` string value
    pub fn size(&self, key: &str) -> Option<Geometry> {
        self.string(key)?.parse().ok()
    }

    pub fn remove(&mut self, key: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(k, _)| k != key);
        self.entries.len() != before
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Display for Parameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (key, value)) in self.entries.iter().enumerate() {
            if i > 0 {
                f.write_str(";")?;
            }
            write!(f, "{}={}", key, value)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_sniffing() {
        assert_eq!(ParamValue::sniff("30"), ParamValue::Int(30));
        assert_eq!(ParamValue::sniff("-4"), ParamValue::Int(-4));
        assert_eq!(ParamValue::sniff("0.5"), ParamValue::Float(0.5));
        assert_eq!(ParamValue::sniff("-0.25"), ParamValue::Float(-0.25));
        assert_eq!(ParamValue::sniff("1024x768"), ParamValue::Str("1024x768".into()));
        assert_eq!(ParamValue::sniff("30,20,15"), ParamValue::Str("30,20,15".into()));
        assert_eq!(ParamValue::sniff("auto"), ParamValue::Str("auto".into()));
        assert_eq!(ParamValue::sniff(""), ParamValue::Str(String::new()));
        // Same as atoi/atof on a lone sign or a doubled dot
        assert_eq!(ParamValue::sniff("-"), ParamValue::Int(0));
        assert_eq!(ParamValue::sniff("1.2.3"), ParamValue::Float(1.2));
    }

    #[test]
    fn test_rejects_reserved_characters() {
        let mut params = Parameters::new();
        assert!(matches!(
            params.set_int("a=b", 1),
            Err(ParamsError::InvalidKey(_))
        ));
        assert!(matches!(
            params.set_str("key", "x;y"),
            Err(ParamsError::InvalidValue { .. })
        ));
        assert!(params.is_empty());
    }

    #[test]
    fn test_updates_keep_order() {
        let mut params = Parameters::parse("a=1;b=two;c=3.5").unwrap();
        params.set_int("b", 2).unwrap();
        params.set_str("d", "new").unwrap();
        assert_eq!(params.to_string(), "a=1;b=2;c=3.5;d=new");
    }

    #[test]
    fn test_float_formatting() {
        assert_eq!(format_float(0.5), "0.5");
        assert_eq!(format_float(3.43), "3.43");
        assert_eq!(format_float(59.6), "59.6");
        assert_eq!(format_float(52.58), "52.58");
        assert_eq!(format_float(2.0), "2");
        assert_eq!(format_float(0.0), "0");
        assert_eq!(format_float(1234567.0), "1.23457e+06");
        assert_eq!(format_float(0.00001), "1e-05");
    }

    #[test]
    fn test_merge_updates_in_place() {
        let mut params = Parameters::parse("preview-size=640x480;jpeg-quality=90").unwrap();
        params.merge("jpeg-quality=70;zoom=2").unwrap();

        assert_eq!(params.int("jpeg-quality"), Some(70));
        assert_eq!(params.size("preview-size"), Some(Geometry::new(640, 480)));
        assert_eq!(params.to_string(), "preview-size=640x480;jpeg-quality=70;zoom=2");
    }

    #[test]
    fn test_trailing_separator_and_garbage() {
        let params = Parameters::parse("a=1;").unwrap();
        assert_eq!(params.len(), 1);
        assert_eq!(params.get("a"), Some(&ParamValue::Int(1)));

        // An entry without '=' ends parsing
        let params = Parameters::parse("a=1;orphan").unwrap();
        assert_eq!(params.len(), 1);
    }

    #[test]
    fn test_typed_getters_check_type() {
        let params = Parameters::parse("n=3;s=text").unwrap();
        assert_eq!(params.int("n"), Some(3));
        assert_eq!(params.string("n"), None);
        assert_eq!(params.float("n"), None);
        assert_eq!(params.string("s"), Some("text"));
        assert_eq!(params.int("missing"), None);
    }

    #[test]
    fn test_preset_parameters() {
        let params = Parameters::from_preset(&SensorPreset::isx012());
        assert_eq!(params.size("preview-size"), Some(Geometry::new(1024, 768)));
        assert_eq!(params.string("zoom-supported"), Some("false"));
        assert_eq!(params.int("max-num-focus-areas"), Some(1));
        assert_eq!(params.float("focal-length"), Some(3.43));
        assert!(params.get("flash-mode").is_none());

        let text = params.to_string();
        assert!(text.starts_with("preferred-preview-size-for-video=1024x768;preview-size-values="));
        assert!(text.contains(";exposure-compensation-step=0.5;"));
        assert_eq!(Parameters::parse(&text).unwrap(), params);
    }
}
