// SPDX-License-Identifier: GPL-3.0-only

//! Picture assembly
//!
//! Turns the buffers collected for one picture into the final payload:
//! main JPEG with an APP1 segment carrying EXIF and the JPEG thumbnail.
//! Compressed buffers are used as they are; raw ones are reshaped when
//! needed and compressed on the way.

use crate::backends::camera::memory::SharedMemory;
use crate::backends::camera::types::{FrameBuffer, Geometry, NodeId};
use crate::constants::PICTURE_OUTPUT_FORMAT;
use crate::constants::buffers::PICTURE_BUFFERS_COUNT;
use crate::errors::{CameraError, CameraResult};
use crate::media::exif::{ExifContext, splice_app1};
use crate::pipelines::PipelineContext;
use crate::pipelines::output::{OutputConfig, OutputSession};
use std::sync::Arc;
use tracing::{debug, info};

/// Buffers the picture listener kept, by role
#[derive(Debug, Clone, Default)]
pub struct PictureSources {
    pub jpeg_main: Option<FrameBuffer>,
    pub jpeg_thumb: Option<FrameBuffer>,
    pub raw_main: Option<FrameBuffer>,
    pub raw_thumb: Option<FrameBuffer>,
}

impl PictureSources {
    /// Sort `buffers` into roles for a `main` picture with a `thumb`
    ///
    /// Compressed buffers must match exactly; raw buffers only need to be
    /// large enough. The first buffer fitting a role takes it.
    pub fn classify(buffers: &[FrameBuffer], main: Geometry, thumb: Geometry) -> Self {
        let mut sources = Self::default();

        for buffer in buffers {
            let geometry = buffer.geometry();
            if buffer.format.is_compressed() {
                if geometry == main && sources.jpeg_main.is_none() {
                    sources.jpeg_main = Some(buffer.clone());
                } else if geometry == thumb && sources.jpeg_thumb.is_none() {
                    sources.jpeg_thumb = Some(buffer.clone());
                }
                continue;
            }

            if geometry.covers(main) && sources.raw_main.is_none() {
                sources.raw_main = Some(buffer.clone());
            }
            if geometry.covers(thumb) && sources.raw_thumb.is_none() {
                sources.raw_thumb = Some(buffer.clone());
            }
        }

        sources
    }

    /// Whether a main image can be produced
    pub fn has_main(&self) -> bool {
        self.jpeg_main.is_some() || self.raw_main.is_some()
    }
}

/// Compresses and assembles one picture
pub struct PictureEncoder<'a> {
    ctx: &'a PipelineContext,
    main: Geometry,
    thumb: Geometry,
    jpeg_quality: u8,
    thumbnail_quality: u8,
}

impl<'a> PictureEncoder<'a> {
    pub fn new(
        ctx: &'a PipelineContext,
        main: Geometry,
        thumb: Geometry,
        jpeg_quality: u8,
        thumbnail_quality: u8,
    ) -> Self {
        Self {
            ctx,
            main,
            thumb,
            jpeg_quality,
            thumbnail_quality,
        }
    }

    /// Final payload in host memory, one buffer
    pub fn compose(&self, sources: &PictureSources) -> CameraResult<Arc<dyn SharedMemory>> {
        let main = self.image(
            "main",
            sources.jpeg_main.as_ref(),
            sources.raw_main.as_ref(),
            self.main,
            self.jpeg_quality,
        )?;
        let thumb = self.image(
            "thumbnail",
            sources.jpeg_thumb.as_ref(),
            sources.raw_thumb.as_ref(),
            self.thumb,
            self.thumbnail_quality,
        )?;

        let identity = &self.ctx.identity;
        let context = ExifContext::now(
            &identity.make,
            &identity.model,
            identity.rotation,
            self.main.width,
            self.main.height,
        );
        let app1 = self.ctx.exif.build(&context, &thumb)?;
        let combined = splice_app1(&main, &app1)?;

        let memory = self.ctx.outputs.allocator.request(-1, combined.len(), 1)?;
        memory.write(0, &combined)?;

        info!(
            size = combined.len(),
            main = main.len(),
            thumbnail = thumb.len(),
            exif = app1.len(),
            "Picture assembled"
        );
        Ok(memory)
    }

    /// JPEG stream for one role
    fn image(
        &self,
        role: &'static str,
        compressed: Option<&FrameBuffer>,
        raw: Option<&FrameBuffer>,
        target: Geometry,
        quality: u8,
    ) -> CameraResult<Vec<u8>> {
        if let Some(buffer) = compressed {
            debug!(role, length = buffer.length, "Using compressed buffer");
            return buffer
                .data()
                .map(<[u8]>::to_vec)
                .ok_or_else(|| CameraError::Encoding(format!("{} buffer outside of its memory", role)));
        }

        let raw = raw.ok_or_else(|| CameraError::Encoding(format!("no {} source", role)))?;

        if raw.width == target.width && raw.height == target.height {
            let data = raw
                .data()
                .ok_or_else(|| CameraError::Encoding(format!("{} buffer outside of its memory", role)))?;
            return self
                .ctx
                .encoder
                .encode(data, raw.width, raw.height, raw.format, quality);
        }

        debug!(role, source = %raw.geometry(), %target, "Reshaping before compression");
        let config = OutputConfig::for_buffer(
            NodeId::PictureOutput,
            raw,
            target,
            PICTURE_OUTPUT_FORMAT,
            PICTURE_BUFFERS_COUNT,
        );
        let output = OutputSession::start(config, &self.ctx.outputs)?;
        output.push(raw.address)?;

        let reshaped = output.current_buffer();
        let data = reshaped
            .data()
            .ok_or_else(|| CameraError::Encoding(format!("reshaped {} outside of its memory", role)))?;
        let jpeg = self.ctx.encoder.encode(
            data,
            target.width,
            target.height,
            PICTURE_OUTPUT_FORMAT,
            quality,
        );
        output.stop();
        jpeg
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::camera::types::PixelFormat;
    use crate::backends::virtual_camera::HeapMemory;

    fn buffer(width: u32, height: u32, format: PixelFormat) -> FrameBuffer {
        let memory: Arc<dyn SharedMemory> = Arc::new(HeapMemory::new(64));
        FrameBuffer {
            memory,
            offset: 0,
            length: 64,
            address: 0,
            width,
            height,
            format,
        }
    }

    #[test]
    fn test_classify_compressed_pair() {
        let main = Geometry::new(2560, 1920);
        let thumb = Geometry::new(160, 120);
        let sources = PictureSources::classify(
            &[
                buffer(2560, 1920, PixelFormat::Jpeg),
                buffer(160, 120, PixelFormat::Jpeg),
            ],
            main,
            thumb,
        );
        assert!(sources.jpeg_main.is_some());
        assert!(sources.jpeg_thumb.is_some());
        assert!(sources.raw_main.is_none());
        assert!(sources.has_main());
    }

    #[test]
    fn test_classify_raw_covers_both_roles() {
        let sources = PictureSources::classify(
            &[buffer(2560, 1920, PixelFormat::Yuyv)],
            Geometry::new(2048, 1536),
            Geometry::new(160, 120),
        );
        assert_eq!(sources.raw_main.as_ref().map(|b| b.width), Some(2560));
        assert_eq!(sources.raw_thumb.as_ref().map(|b| b.width), Some(2560));
    }

    #[test]
    fn test_classify_small_raw_has_no_main() {
        let sources = PictureSources::classify(
            &[buffer(640, 480, PixelFormat::Nv21)],
            Geometry::new(2560, 1920),
            Geometry::new(160, 120),
        );
        assert!(!sources.has_main());
        assert!(sources.raw_thumb.is_some());
    }

    #[test]
    fn test_classify_compressed_wrong_size_ignored() {
        let sources = PictureSources::classify(
            &[buffer(1280, 960, PixelFormat::Jpeg)],
            Geometry::new(2560, 1920),
            Geometry::new(160, 120),
        );
        assert!(!sources.has_main());
        assert!(sources.jpeg_thumb.is_none());
    }
}
