// SPDX-License-Identifier: MPL-2.0

//! Error types for the capture pipeline

use std::fmt;
use std::time::Duration;

/// Result type alias using CameraError
pub type CameraResult<T> = Result<T, CameraError>;

/// Main pipeline error type
#[derive(Debug, Clone)]
pub enum CameraError {
    /// Rejected input, nothing was changed
    InvalidArgument(String),
    /// Device control channel failure
    Device(DeviceError),
    /// No buffers or memory could be obtained
    ResourceExhausted(String),
    /// Start requested on something already running
    AlreadyEnabled(&'static str),
    /// Stop requested on something not running
    NotEnabled(&'static str),
    /// Operation refused while another one is in progress
    Busy(String),
    /// Listeners did not release a dispatched buffer in time
    ListenerTimeout { waited: Duration },
    /// Still image compression failed
    Encoding(String),
    /// Metadata block generation failed
    Exif(String),
    /// Parameter blob errors
    Params(ParamsError),
    /// Configuration errors
    Config(ConfigError),
    /// Worker thread could not be spawned
    ThreadSpawn(String),
}

/// Device control channel errors
#[derive(Debug, Clone)]
pub enum DeviceError {
    /// Device node could not be opened
    Open { path: String, reason: String },
    /// An ioctl returned an error
    Ioctl { request: &'static str, reason: String },
    /// Getting or setting a control failed
    Control { id: u32, reason: String },
    /// Requested pixel format is not offered by the node
    FormatUnsupported(u32),
    /// Driver reported an unusable physical address
    InvalidAddress(i32),
    /// Readiness poll reported an error condition
    Poll(String),
    /// Mapping shared memory failed
    Memory(String),
}

/// Parameter codec errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamsError {
    /// Key is empty or contains a reserved character
    InvalidKey(String),
    /// Value contains a reserved character or cannot be interpreted
    InvalidValue { key: String, value: String },
    /// Entry is not of the form key=value
    Malformed(String),
}

/// Configuration errors
#[derive(Debug, Clone)]
pub enum ConfigError {
    /// Config file could not be read
    Read(String),
    /// Config file is not valid JSON for our schema
    Parse(String),
    /// Preset index out of range
    NoPreset(usize),
}

impl fmt::Display for CameraError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CameraError::InvalidArgument(msg) => write!(f, "Invalid argument: {}", msg),
            CameraError::Device(e) => write!(f, "Device error: {}", e),
            CameraError::ResourceExhausted(msg) => write!(f, "Resources exhausted: {}", msg),
            CameraError::AlreadyEnabled(what) => write!(f, "{} was already started", what),
            CameraError::NotEnabled(what) => write!(f, "{} was already stopped", what),
            CameraError::Busy(msg) => write!(f, "Busy: {}", msg),
            CameraError::ListenerTimeout { waited } => {
                write!(f, "Listeners still busy after {:?}", waited)
            }
            CameraError::Encoding(msg) => write!(f, "Encoding failed: {}", msg),
            CameraError::Exif(msg) => write!(f, "EXIF generation failed: {}", msg),
            CameraError::Params(e) => write!(f, "Parameter error: {}", e),
            CameraError::Config(e) => write!(f, "Configuration error: {}", e),
            CameraError::ThreadSpawn(msg) => write!(f, "Unable to create thread: {}", msg),
        }
    }
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceError::Open { path, reason } => write!(f, "Unable to open {}: {}", path, reason),
            DeviceError::Ioctl { request, reason } => write!(f, "{} failed: {}", request, reason),
            DeviceError::Control { id, reason } => {
                write!(f, "Control 0x{:08x} failed: {}", id, reason)
            }
            DeviceError::FormatUnsupported(fourcc) => {
                write!(f, "Pixel format 0x{:08x} is not supported", fourcc)
            }
            DeviceError::InvalidAddress(value) => {
                write!(f, "Invalid hardware address 0x{:08x}", *value as u32)
            }
            DeviceError::Poll(msg) => write!(f, "Poll failed: {}", msg),
            DeviceError::Memory(msg) => write!(f, "Memory mapping failed: {}", msg),
        }
    }
}

impl fmt::Display for ParamsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamsError::InvalidKey(key) => write!(f, "Invalid key '{}'", key),
            ParamsError::InvalidValue { key, value } => {
                write!(f, "Invalid value '{}' for key '{}'", value, key)
            }
            ParamsError::Malformed(entry) => write!(f, "Malformed entry '{}'", entry),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Read(msg) => write!(f, "Unable to read config: {}", msg),
            ConfigError::Parse(msg) => write!(f, "Unable to parse config: {}", msg),
            ConfigError::NoPreset(index) => write!(f, "No sensor preset with index {}", index),
        }
    }
}

impl std::error::Error for CameraError {}
impl std::error::Error for DeviceError {}
impl std::error::Error for ParamsError {}
impl std::error::Error for ConfigError {}

impl DeviceError {
    /// Build an ioctl error from the calling thread's errno
    pub fn last_ioctl(request: &'static str) -> Self {
        DeviceError::Ioctl {
            request,
            reason: std::io::Error::last_os_error().to_string(),
        }
    }

    /// Build a control error from the calling thread's errno
    pub fn last_control(id: u32) -> Self {
        DeviceError::Control {
            id,
            reason: std::io::Error::last_os_error().to_string(),
        }
    }
}

// Conversions from sub-errors to CameraError
impl From<DeviceError> for CameraError {
    fn from(err: DeviceError) -> Self {
        CameraError::Device(err)
    }
}

impl From<ParamsError> for CameraError {
    fn from(err: ParamsError) -> Self {
        CameraError::Params(err)
    }
}

impl From<ConfigError> for CameraError {
    fn from(err: ConfigError) -> Self {
        CameraError::Config(err)
    }
}

impl From<image::ImageError> for CameraError {
    fn from(err: image::ImageError) -> Self {
        CameraError::Encoding(err.to_string())
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self {
        ConfigError::Parse(err.to_string())
    }
}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::Read(err.to_string())
    }
}
