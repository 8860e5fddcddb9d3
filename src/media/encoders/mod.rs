// SPDX-License-Identifier: MPL-2.0

//! Still image encoders

pub mod jpeg;

pub use jpeg::{JpegEncoder, SoftwareJpegEncoder};
