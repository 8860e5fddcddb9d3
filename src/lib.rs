// SPDX-License-Identifier: MPL-2.0

//! Camera pipeline core
//!
//! Turns the frames of one V4L2 image sensor into simultaneous preview,
//! still-picture and recording streams, each with its own geometry and
//! format, while the capture source runs at a single negotiated
//! configuration.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - [`camera`]: Host control surface, one [`Camera`] per open sensor
//! - [`pipelines`]: Capture engine, reshaping sessions and the frame paths
//! - [`backends`]: Device control channel (V4L2 and in-memory)
//! - [`media`]: JPEG compression and EXIF metadata
//! - [`host`]: Callbacks and display surface the host provides
//! - [`params`]: The `key=value;` parameter codec and typed settings
//! - [`config`]: Sensor presets, node layout and timeouts
//!
//! # Example
//!
//! ```no_run
//! use camera_pipeline::backends::virtual_camera::VirtualProvider;
//! use camera_pipeline::media::{ExifBuilder, SoftwareJpegEncoder};
//! use camera_pipeline::{Camera, Config};
//! use std::sync::Arc;
//!
//! let config = Config::default();
//! let provider = Arc::new(VirtualProvider::new(config.controls));
//! let camera = Camera::open(
//!     &config,
//!     0,
//!     provider.clone(),
//!     Arc::new(provider.allocator()),
//!     Some(Arc::new(provider.contiguous())),
//!     Arc::new(SoftwareJpegEncoder::new()),
//!     Arc::new(ExifBuilder::new()),
//! )?;
//! camera.start_preview()?;
//! # Ok::<(), camera_pipeline::CameraError>(())
//! ```

pub mod backends;
pub mod camera;
pub mod config;
pub mod constants;
pub mod errors;
pub mod host;
pub mod media;
pub mod params;
pub mod pipelines;

// Re-export commonly used types
pub use camera::{Camera, CameraInfo, camera_count, camera_info};
pub use config::Config;
pub use errors::{CameraError, CameraResult};
pub use host::{HostCallbacks, PreviewWindow, msg};
pub use params::{CameraSettings, Parameters};
