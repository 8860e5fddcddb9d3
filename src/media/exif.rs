// SPDX-License-Identifier: MPL-2.0

//! EXIF metadata for still pictures
//!
//! The picture path splices the APP1 segment produced here right after the
//! SOI marker of the main JPEG stream. The segment embeds the compressed
//! thumbnail in IFD1.
//!
//! Layout (TIFF, little endian):
//!
//! ```text
//! FF E1 <len> "Exif\0\0" | II 2A 00 08000000 | IFD0 | Exif IFD | IFD1 | thumbnail
//! ```

use crate::errors::{CameraError, CameraResult};
use chrono::NaiveDateTime;

/// Everything the metadata block describes
#[derive(Debug, Clone, PartialEq)]
pub struct ExifContext {
    pub make: String,
    pub model: String,
    pub software: String,
    /// Sensor rotation in degrees
    pub rotation: i32,
    pub width: u32,
    pub height: u32,
    pub captured_at: NaiveDateTime,
}

impl ExifContext {
    /// Context for a picture taken now
    pub fn now(make: &str, model: &str, rotation: i32, width: u32, height: u32) -> Self {
        Self {
            make: make.to_string(),
            model: model.to_string(),
            software: format!("camera-pipeline {}", crate::constants::app_info::version()),
            rotation,
            width,
            height,
            captured_at: chrono::Local::now().naive_local(),
        }
    }

    /// EXIF orientation tag value for the rotation
    pub fn orientation(&self) -> u16 {
        match self.rotation.rem_euclid(360) {
            90 => 6,
            180 => 3,
            270 => 8,
            _ => 1,
        }
    }
}

/// Produces the APP1 segment of a picture
pub trait ExifWriter: Send + Sync {
    /// APP1 segment, marker included, embedding `thumbnail`
    fn build(&self, context: &ExifContext, thumbnail: &[u8]) -> CameraResult<Vec<u8>>;
}

/// Default [`ExifWriter`]
#[derive(Debug, Default, Clone, Copy)]
pub struct ExifBuilder;

impl ExifBuilder {
    pub fn new() -> Self {
        Self
    }
}

const APP1_MARKER: [u8; 2] = [0xFF, 0xE1];
const EXIF_HEADER: &[u8; 6] = b"Exif\0\0";
const TIFF_HEADER_LEN: u32 = 8;

mod tag {
    pub const COMPRESSION: u16 = 0x0103;
    pub const MAKE: u16 = 0x010F;
    pub const MODEL: u16 = 0x0110;
    pub const ORIENTATION: u16 = 0x0112;
    pub const SOFTWARE: u16 = 0x0131;
    pub const DATE_TIME: u16 = 0x0132;
    pub const JPEG_INTERCHANGE_FORMAT: u16 = 0x0201;
    pub const JPEG_INTERCHANGE_FORMAT_LENGTH: u16 = 0x0202;
    pub const EXIF_IFD_POINTER: u16 = 0x8769;
    pub const EXIF_VERSION: u16 = 0x9000;
    pub const DATE_TIME_ORIGINAL: u16 = 0x9003;
    pub const PIXEL_X_DIMENSION: u16 = 0xA002;
    pub const PIXEL_Y_DIMENSION: u16 = 0xA003;
}

#[derive(Debug, Clone, Copy)]
enum FieldType {
    Ascii = 2,
    Short = 3,
    Long = 4,
    Undefined = 7,
}

struct Entry {
    tag: u16,
    kind: FieldType,
    count: u32,
    /// Little-endian value bytes
    value: Vec<u8>,
}

impl Entry {
    fn ascii(tag: u16, text: &str) -> Self {
        let mut value = text.as_bytes().to_vec();
        value.push(0);
        Self {
            tag,
            kind: FieldType::Ascii,
            count: value.len() as u32,
            value,
        }
    }

    fn short(tag: u16, value: u16) -> Self {
        Self {
            tag,
            kind: FieldType::Short,
            count: 1,
            value: value.to_le_bytes().to_vec(),
        }
    }

    fn long(tag: u16, value: u32) -> Self {
        Self {
            tag,
            kind: FieldType::Long,
            count: 1,
            value: value.to_le_bytes().to_vec(),
        }
    }

    fn undefined(tag: u16, bytes: &[u8]) -> Self {
        Self {
            tag,
            kind: FieldType::Undefined,
            count: bytes.len() as u32,
            value: bytes.to_vec(),
        }
    }

    /// Bytes stored out of line, padded to a word boundary
    fn external_len(&self) -> usize {
        if self.value.len() > 4 {
            self.value.len() + self.value.len() % 2
        } else {
            0
        }
    }
}

/// Size of an IFD including its out-of-line values
fn ifd_len(entries: &[Entry]) -> u32 {
    let external: usize = entries.iter().map(Entry::external_len).sum();
    (2 + 12 * entries.len() + 4 + external) as u32
}

/// Append an IFD starting at `tiff.len()`, entries sorted by tag
fn write_ifd(tiff: &mut Vec<u8>, entries: &[Entry], next_ifd: u32) {
    let start = tiff.len() as u32;
    let mut data_offset = start + 2 + 12 * entries.len() as u32 + 4;
    let mut data = Vec::new();

    tiff.extend_from_slice(&(entries.len() as u16).to_le_bytes());
    for entry in entries {
        tiff.extend_from_slice(&entry.tag.to_le_bytes());
        tiff.extend_from_slice(&(entry.kind as u16).to_le_bytes());
        tiff.extend_from_slice(&entry.count.to_le_bytes());

        if entry.value.len() <= 4 {
            let mut inline = [0u8; 4];
            inline[..entry.value.len()].copy_from_slice(&entry.value);
            tiff.extend_from_slice(&inline);
        } else {
            tiff.extend_from_slice(&data_offset.to_le_bytes());
            data.extend_from_slice(&entry.value);
            if entry.value.len() % 2 == 1 {
                data.push(0);
            }
            data_offset += entry.external_len() as u32;
        }
    }
    tiff.extend_from_slice(&next_ifd.to_le_bytes());
    tiff.extend_from_slice(&data);
}

impl ExifWriter for ExifBuilder {
    fn build(&self, context: &ExifContext, thumbnail: &[u8]) -> CameraResult<Vec<u8>> {
        let date = context.captured_at.format("%Y:%m:%d %H:%M:%S").to_string();

        // Pointer values are patched once every IFD size is known
        let mut ifd0 = vec![
            Entry::ascii(tag::MAKE, &context.make),
            Entry::ascii(tag::MODEL, &context.model),
            Entry::short(tag::ORIENTATION, context.orientation()),
            Entry::ascii(tag::SOFTWARE, &context.software),
            Entry::ascii(tag::DATE_TIME, &date),
            Entry::long(tag::EXIF_IFD_POINTER, 0),
        ];
        let exif = vec![
            Entry::undefined(tag::EXIF_VERSION, b"0220"),
            Entry::ascii(tag::DATE_TIME_ORIGINAL, &date),
            Entry::long(tag::PIXEL_X_DIMENSION, context.width),
            Entry::long(tag::PIXEL_Y_DIMENSION, context.height),
        ];
        let mut ifd1 = vec![
            Entry::short(tag::COMPRESSION, 6),
            Entry::long(tag::JPEG_INTERCHANGE_FORMAT, 0),
            Entry::long(tag::JPEG_INTERCHANGE_FORMAT_LENGTH, thumbnail.len() as u32),
        ];

        let exif_offset = TIFF_HEADER_LEN + ifd_len(&ifd0);
        let ifd1_offset = exif_offset + ifd_len(&exif);
        let thumbnail_offset = ifd1_offset + ifd_len(&ifd1);
        ifd0[5].value = exif_offset.to_le_bytes().to_vec();
        ifd1[1].value = thumbnail_offset.to_le_bytes().to_vec();

        let mut tiff = Vec::with_capacity(thumbnail_offset as usize + thumbnail.len());
        tiff.extend_from_slice(b"II");
        tiff.extend_from_slice(&42u16.to_le_bytes());
        tiff.extend_from_slice(&TIFF_HEADER_LEN.to_le_bytes());
        write_ifd(&mut tiff, &ifd0, ifd1_offset);
        write_ifd(&mut tiff, &exif, 0);
        write_ifd(&mut tiff, &ifd1, 0);
        tiff.extend_from_slice(thumbnail);

        // Segment length counts itself but not the marker
        let segment_len = 2 + EXIF_HEADER.len() + tiff.len();
        let segment_len = u16::try_from(segment_len).map_err(|_| {
            CameraError::Exif(format!(
                "APP1 segment of {} bytes exceeds 64 KiB, thumbnail is {} bytes",
                segment_len,
                thumbnail.len()
            ))
        })?;

        let mut app1 = Vec::with_capacity(2 + segment_len as usize);
        app1.extend_from_slice(&APP1_MARKER);
        app1.extend_from_slice(&segment_len.to_be_bytes());
        app1.extend_from_slice(EXIF_HEADER);
        app1.extend_from_slice(&tiff);
        Ok(app1)
    }
}

/// Insert `app1` right after the SOI marker of `jpeg`
pub fn splice_app1(jpeg: &[u8], app1: &[u8]) -> CameraResult<Vec<u8>> {
    if jpeg.len() < 2 || jpeg[..2] != [0xFF, 0xD8] {
        return Err(CameraError::Exif("main image does not start with SOI".to_string()));
    }

    let mut combined = Vec::with_capacity(jpeg.len() + app1.len());
    combined.extend_from_slice(&jpeg[..2]);
    combined.extend_from_slice(app1);
    combined.extend_from_slice(&jpeg[2..]);
    Ok(combined)
}
