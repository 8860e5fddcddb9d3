// SPDX-License-Identifier: GPL-3.0-only

//! Shared types for the capture backends

use super::memory::SharedMemory;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Build a V4L2 fourcc code
const fn fourcc(code: &[u8; 4]) -> u32 {
    (code[0] as u32) | ((code[1] as u32) << 8) | ((code[2] as u32) << 16) | ((code[3] as u32) << 24)
}

/// Pixel formats the pipeline knows how to size and route
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    Rgb32,
    Rgb565,
    Yuyv,
    Uyvy,
    Vyuy,
    Yvyu,
    Yuv422p,
    Nv16,
    Nv61,
    Nv12,
    /// NV12 in the Samsung 64x32 tiled layout
    Nv12t,
    Nv21,
    Yuv420,
    Yvu420,
    /// Compressed stills, as produced by sensors with an on-chip encoder
    Jpeg,
}

impl PixelFormat {
    pub const ALL: [PixelFormat; 15] = [
        PixelFormat::Rgb32,
        PixelFormat::Rgb565,
        PixelFormat::Yuyv,
        PixelFormat::Uyvy,
        PixelFormat::Vyuy,
        PixelFormat::Yvyu,
        PixelFormat::Yuv422p,
        PixelFormat::Nv16,
        PixelFormat::Nv61,
        PixelFormat::Nv12,
        PixelFormat::Nv12t,
        PixelFormat::Nv21,
        PixelFormat::Yuv420,
        PixelFormat::Yvu420,
        PixelFormat::Jpeg,
    ];

    /// V4L2 fourcc of this format
    pub const fn fourcc(self) -> u32 {
        match self {
            PixelFormat::Rgb32 => fourcc(b"RGB4"),
            PixelFormat::Rgb565 => fourcc(b"RGBP"),
            PixelFormat::Yuyv => fourcc(b"YUYV"),
            PixelFormat::Uyvy => fourcc(b"UYVY"),
            PixelFormat::Vyuy => fourcc(b"VYUY"),
            PixelFormat::Yvyu => fourcc(b"YVYU"),
            PixelFormat::Yuv422p => fourcc(b"422P"),
            PixelFormat::Nv16 => fourcc(b"NV16"),
            PixelFormat::Nv61 => fourcc(b"NV61"),
            PixelFormat::Nv12 => fourcc(b"NV12"),
            PixelFormat::Nv12t => fourcc(b"TM12"),
            PixelFormat::Nv21 => fourcc(b"NV21"),
            PixelFormat::Yuv420 => fourcc(b"YU12"),
            PixelFormat::Yvu420 => fourcc(b"YV12"),
            PixelFormat::Jpeg => fourcc(b"JPEG"),
        }
    }

    /// Look up a format by its fourcc
    pub fn from_fourcc(code: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.fourcc() == code)
    }

    /// Whether buffers of this format carry a compressed payload
    pub fn is_compressed(self) -> bool {
        self == PixelFormat::Jpeg
    }

    /// Name used in the host parameter blob, where one exists
    pub fn param_name(self) -> Option<&'static str> {
        match self {
            PixelFormat::Nv21 => Some("yuv420sp"),
            PixelFormat::Yuv420 => Some("yuv420p"),
            PixelFormat::Rgb565 => Some("rgb565"),
            PixelFormat::Rgb32 => Some("rgb8888"),
            PixelFormat::Yuyv => Some("yuyv"),
            PixelFormat::Jpeg => Some("jpeg"),
            _ => None,
        }
    }

    /// Parse a parameter blob format name
    pub fn from_param_name(name: &str) -> Option<Self> {
        match name {
            "yuv420sp" => Some(PixelFormat::Nv21),
            "yuv420p" => Some(PixelFormat::Yuv420),
            "rgb565" => Some(PixelFormat::Rgb565),
            "rgb8888" => Some(PixelFormat::Rgb32),
            "yuyv" => Some(PixelFormat::Yuyv),
            "jpeg" => Some(PixelFormat::Jpeg),
            _ => None,
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = self.fourcc().to_le_bytes();
        write!(f, "{}", String::from_utf8_lossy(&bytes))
    }
}

/// Frame dimensions in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Geometry {
    pub width: u32,
    pub height: u32,
}

impl Geometry {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// True when both dimensions are at least those of `other`
    pub fn covers(&self, other: Geometry) -> bool {
        self.width >= other.width && self.height >= other.height
    }
}

impl fmt::Display for Geometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl FromStr for Geometry {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (w, h) = s
            .split_once('x')
            .ok_or_else(|| format!("'{}' is not of the form WxH", s))?;
        let width = w.trim().parse::<u32>().map_err(|e| e.to_string())?;
        let height = h.trim().parse::<u32>().map_err(|e| e.to_string())?;
        Ok(Geometry { width, height })
    }
}

/// Rectangle used for crop and overlay window setup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn full(geometry: Geometry) -> Self {
        Rect {
            left: 0,
            top: 0,
            width: geometry.width,
            height: geometry.height,
        }
    }
}

/// Physical plane addresses of a YUV buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PlaneAddresses {
    pub y: u32,
    pub cb: u32,
    pub cr: u32,
}

/// V4L2 buffer queues the pipeline talks to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferQueue {
    /// Sensor frames coming in
    Capture,
    /// Source side of a reshaping pass
    Output,
    /// Destination window of a reshaping pass
    Overlay,
    /// Sensor-facing bus format (driver private type)
    Private,
}

impl BufferQueue {
    /// Raw `v4l2_buf_type` value
    pub const fn raw(self) -> u32 {
        match self {
            BufferQueue::Capture => 1,
            BufferQueue::Output => 2,
            BufferQueue::Overlay => 3,
            BufferQueue::Private => 0x80,
        }
    }
}

/// Sensor operating mode for a capture session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureMode {
    /// Continuous streaming for preview and recording
    Preview,
    /// Single-frame still capture
    Still,
}

/// Device nodes the pipeline opens
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeId {
    /// Sensor capture node
    Capture,
    /// Reshaping node used by the preview path
    PreviewOutput,
    /// Reshaping node used by the picture path
    PictureOutput,
    /// Reshaping node used by the recording path
    RecordingOutput,
}

impl NodeId {
    pub const fn index(self) -> usize {
        match self {
            NodeId::Capture => 0,
            NodeId::PreviewOutput => 1,
            NodeId::PictureOutput => 2,
            NodeId::RecordingOutput => 3,
        }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeId::Capture => "capture",
            NodeId::PreviewOutput => "preview-output",
            NodeId::PictureOutput => "picture-output",
            NodeId::RecordingOutput => "recording-output",
        };
        write!(f, "{}", name)
    }
}

/// Information about a discovered V4L2 node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub path: String,
    pub driver: String,
    pub card: String,
    pub capabilities: u32,
}

/// Frame buffer descriptor
///
/// A view into memory owned by the capture engine or by a reshaping session.
/// The memory mapping is kept alive by the `Arc`, but the pixel content is
/// only meaningful until the engine requeues the hardware slot, which it does
/// once every listener has cleared its busy flag.
#[derive(Clone)]
pub struct FrameBuffer {
    pub memory: Arc<dyn SharedMemory>,
    pub offset: usize,
    pub length: usize,
    /// Physical address the hardware sees for `offset`
    pub address: u32,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

impl FrameBuffer {
    pub fn geometry(&self) -> Geometry {
        Geometry::new(self.width, self.height)
    }

    /// Same geometry and format
    pub fn same_shape(&self, other: &FrameBuffer) -> bool {
        self.width == other.width && self.height == other.height && self.format == other.format
    }

    /// Borrow the bytes this descriptor covers
    pub fn data(&self) -> Option<&[u8]> {
        self.memory.read(self.offset, self.length)
    }
}

impl fmt::Debug for FrameBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameBuffer")
            .field("offset", &self.offset)
            .field("length", &self.length)
            .field("address", &format_args!("0x{:08x}", self.address))
            .field("geometry", &self.geometry())
            .field("format", &self.format)
            .finish()
    }
}
