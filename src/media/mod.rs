// SPDX-License-Identifier: MPL-2.0

//! Media collaborators of the picture path
//!
//! # Still Image Encoding
//!
//! The [`encoders`] module compresses raw frames into JPEG. Hardware with a
//! JPEG block plugs in its own [`JpegEncoder`]; the default runs on the CPU.
//!
//! # Metadata
//!
//! The [`exif`] module builds the APP1 segment (EXIF with an embedded
//! thumbnail) that is spliced into the main image.

pub mod encoders;
pub mod exif;

// Re-export commonly used types
pub use encoders::{JpegEncoder, SoftwareJpegEncoder};
pub use exif::{ExifBuilder, ExifContext, ExifWriter};
