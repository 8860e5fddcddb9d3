// SPDX-License-Identifier: GPL-3.0-only

//! Buffer reshaping through a FIMC output node
//!
//! An [`OutputSession`] converts buffers of one geometry/format (the source,
//! usually a capture slot) into a small ring of buffers of another
//! geometry/format (the target). Each path owns at most one session.
//!
//! Target memory comes from the node's reserved region when it is large
//! enough, otherwise from the contiguous allocator.

use crate::backends::camera::memory::{
    ContiguousAllocator, ContiguousRegion, MemoryAllocator, SharedMemory,
};
use crate::backends::camera::types::{
    BufferQueue, FrameBuffer, Geometry, NodeId, PixelFormat, PlaneAddresses, Rect,
};
use crate::backends::camera::v4l2_controls::{ControlIds, FIMC_OVLY_NONE_MULTI_BUF};
use crate::backends::camera::{DeviceProvider, VideoDevice};
use crate::constants::memory::{RESERVED_MEM_UNIT, align, is_invalid_address};
use crate::errors::{CameraError, CameraResult, DeviceError};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Bytes needed for one `geometry` buffer of `format`
///
/// Returns `None` for compressed formats, which have no fixed size.
pub fn buffer_length(geometry: Geometry, format: PixelFormat) -> Option<usize> {
    let area = geometry.width as usize * geometry.height as usize;

    match format {
        PixelFormat::Rgb32 => Some(area * 4),
        PixelFormat::Rgb565
        | PixelFormat::Yuyv
        | PixelFormat::Uyvy
        | PixelFormat::Vyuy
        | PixelFormat::Yvyu
        | PixelFormat::Yuv422p
        | PixelFormat::Nv16
        | PixelFormat::Nv61 => Some(area * 2),
        PixelFormat::Nv12 | PixelFormat::Nv12t | PixelFormat::Yuv420 | PixelFormat::Yvu420 => {
            Some(align(area) + align(area / 2))
        }
        PixelFormat::Nv21 => Some(area * 3 / 2),
        PixelFormat::Jpeg => None,
    }
}

/// Plane addresses of a `geometry` buffer of `format` starting at `address`
pub fn yuv_planes(geometry: Geometry, format: PixelFormat, address: u32) -> PlaneAddresses {
    let area = geometry.width as usize * geometry.height as usize;
    let offset = |bytes: usize| address.wrapping_add(bytes as u32);

    match format {
        PixelFormat::Rgb32
        | PixelFormat::Rgb565
        | PixelFormat::Yuyv
        | PixelFormat::Uyvy
        | PixelFormat::Vyuy
        | PixelFormat::Yvyu => PlaneAddresses {
            y: address,
            cb: 0,
            cr: 0,
        },
        PixelFormat::Yuv420 => {
            let cb = offset(align(area));
            PlaneAddresses {
                y: address,
                cb,
                cr: cb.wrapping_add(align(area / 4) as u32),
            }
        }
        PixelFormat::Nv12 | PixelFormat::Nv12t => {
            let cbcr = offset(align(area));
            PlaneAddresses {
                y: address,
                cb: cbcr,
                cr: cbcr,
            }
        }
        _ => {
            let cbcr = offset(area);
            PlaneAddresses {
                y: address,
                cb: cbcr,
                cr: cbcr,
            }
        }
    }
}

/// Parameters of a reshaping session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputConfig {
    /// Node to open
    pub node: NodeId,
    /// Geometry of the buffers pushed in
    pub source: Geometry,
    pub source_format: PixelFormat,
    /// Geometry of the buffers produced
    pub target: Geometry,
    pub target_format: PixelFormat,
    /// Ring size requested
    pub count: u32,
}

impl OutputConfig {
    /// Config reshaping `buffer` into `target`/`target_format`
    pub fn for_buffer(
        node: NodeId,
        buffer: &FrameBuffer,
        target: Geometry,
        target_format: PixelFormat,
        count: u32,
    ) -> Self {
        Self {
            node,
            source: buffer.geometry(),
            source_format: buffer.format,
            target,
            target_format,
            count,
        }
    }
}

/// Collaborators a session needs to start
#[derive(Clone)]
pub struct OutputResources {
    pub provider: Arc<dyn DeviceProvider>,
    pub allocator: Arc<dyn MemoryAllocator>,
    pub contiguous: Option<Arc<dyn ContiguousAllocator>>,
    pub controls: ControlIds,
}

/// An enabled reshaping session
pub struct OutputSession {
    config: OutputConfig,
    device: Arc<dyn VideoDevice>,
    memory: Arc<dyn SharedMemory>,
    memory_address: u32,
    buffer_length: usize,
    /// Effective ring size, at most `config.count`
    count: u32,
    index: u32,
    region: Option<ContiguousRegion>,
    contiguous: Option<Arc<dyn ContiguousAllocator>>,
}

/// What `start` acquired so far, released in reverse on failure
struct Acquired {
    region: Option<ContiguousRegion>,
    contiguous: Option<Arc<dyn ContiguousAllocator>>,
}

impl Drop for Acquired {
    fn drop(&mut self) {
        if let (Some(region), Some(contiguous)) = (self.region.take(), self.contiguous.as_ref()) {
            contiguous.free(&region);
        }
    }
}

impl OutputSession {
    /// Open the node and set up the target ring
    pub fn start(config: OutputConfig, resources: &OutputResources) -> CameraResult<Self> {
        if config.count == 0 {
            return Err(CameraError::InvalidArgument(format!(
                "invalid buffers count {}",
                config.count
            )));
        }

        let buffer_length = buffer_length(config.target, config.target_format)
            .filter(|len| *len > 0)
            .ok_or_else(|| {
                CameraError::InvalidArgument(format!(
                    "no buffer length for {} {}",
                    config.target, config.target_format
                ))
            })?;

        let device = resources.provider.open(config.node)?;
        let ids = &resources.controls;

        device.query_capabilities(BufferQueue::Output)?;
        device.get_format(BufferQueue::Output)?;

        let reserved_address = device.get_control(ids.reserved_mem_base)?;
        let reserved_size =
            device.get_control(ids.reserved_mem_size)?.max(0) as usize * RESERVED_MEM_UNIT;
        let version = device.get_control(ids.fimc_version)?;
        debug!(node = %config.node, version, reserved_size, "Output node identified");

        device.set_control(ids.overlay_mode, FIMC_OVLY_NONE_MULTI_BUF)?;
        device.set_format(
            BufferQueue::Output,
            config.source,
            config.source_format,
            0,
            0,
        )?;
        device.set_crop(BufferQueue::Output, Rect::full(config.source))?;
        device.request_buffers(BufferQueue::Output, 1)?;

        let mut acquired = Acquired {
            region: None,
            contiguous: None,
        };

        let (memory, memory_address, count) =
            if !is_invalid_address(reserved_address) && reserved_size >= buffer_length {
                // Largest ring that fits strictly inside the region
                let count = (1..=config.count)
                    .rev()
                    .find(|i| buffer_length * (*i as usize) < reserved_size)
                    .ok_or_else(|| {
                        CameraError::ResourceExhausted(format!(
                            "reserved memory of {} bytes holds no {} byte buffer",
                            reserved_size, buffer_length
                        ))
                    })?;
                debug!(node = %config.node, count, "Found buffers available for output");

                let memory = resources.allocator.request(
                    device.memory_token(),
                    buffer_length,
                    count as usize,
                )?;
                (memory, reserved_address as u32, count)
            } else {
                let contiguous = resources.contiguous.as_ref().ok_or_else(|| {
                    CameraError::ResourceExhausted(format!(
                        "no reserved memory on {} and no contiguous allocator",
                        config.node
                    ))
                })?;

                let region = contiguous.alloc(buffer_length * config.count as usize)?;
                acquired.contiguous = Some(Arc::clone(contiguous));
                acquired.region = Some(region.clone());

                let memory =
                    resources
                        .allocator
                        .request(region.token, buffer_length, config.count as usize)?;
                let address = contiguous.phys(&region)?;
                (memory, address, config.count)
            };

        info!(
            node = %config.node,
            source = %config.source,
            target = %config.target,
            format = %config.target_format,
            count,
            "Output started"
        );

        Ok(Self {
            config,
            device,
            memory,
            memory_address,
            buffer_length,
            count,
            index: 0,
            region: acquired.region.take(),
            contiguous: acquired.contiguous.take(),
        })
    }

    pub fn config(&self) -> &OutputConfig {
        &self.config
    }

    /// Whether this session reshapes buffers shaped like `buffer`
    pub fn accepts(&self, buffer: &FrameBuffer) -> bool {
        self.config.source == buffer.geometry() && self.config.source_format == buffer.format
    }

    pub fn buffer_length(&self) -> usize {
        self.buffer_length
    }

    pub fn memory(&self) -> &Arc<dyn SharedMemory> {
        &self.memory
    }

    /// Physical address of the first ring buffer
    pub fn memory_address(&self) -> u32 {
        self.memory_address
    }

    /// Current ring slot
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    /// Physical address of the current ring slot
    pub fn current_address(&self) -> u32 {
        self.memory_address
            .wrapping_add((self.buffer_length * self.index as usize) as u32)
    }

    /// Descriptor of the current ring slot
    pub fn current_buffer(&self) -> FrameBuffer {
        FrameBuffer {
            memory: Arc::clone(&self.memory),
            offset: self.buffer_length * self.index as usize,
            length: self.buffer_length,
            address: self.current_address(),
            width: self.config.target.width,
            height: self.config.target.height,
            format: self.config.target_format,
        }
    }

    /// Reshape the source buffer at `source_address` into the current slot
    pub fn push(&self, source_address: u32) -> CameraResult<()> {
        let config = &self.config;
        let device = &self.device;

        let base = device.get_framebuffer()?;
        device.set_framebuffer(base, config.target, config.target_format)?;

        let destination = yuv_planes(config.target, config.target_format, self.current_address());
        device.set_destination(&destination)?;
        device.set_window(Rect::full(config.target))?;
        device.stream_on(BufferQueue::Output)?;

        // The node must leave streaming whether or not the conversion ran
        let converted = self.convert(source_address);
        let stopped = device.stream_off(BufferQueue::Output);
        converted?;
        stopped?;

        if let (Some(region), Some(contiguous)) = (self.region.as_ref(), self.contiguous.as_ref()) {
            contiguous.flush(region)?;
        }

        Ok(())
    }

    /// Queue the source and wait for the converted frame
    fn convert(&self, source_address: u32) -> CameraResult<()> {
        let config = &self.config;
        let device = &self.device;

        let source = yuv_planes(config.source, config.source_format, source_address);
        device.queue_buffer(BufferQueue::Output, 0, Some(&source))?;

        match device.dequeue_buffer(BufferQueue::Output)? {
            Some(_) => Ok(()),
            None => {
                error!(node = %config.node, "Unable to dequeue buffer");
                Err(DeviceError::Ioctl {
                    request: "VIDIOC_DQBUF",
                    reason: "nothing to dequeue".to_string(),
                }
                .into())
            }
        }
    }

    /// Advance the ring
    pub fn release(&mut self) {
        self.index = (self.index + 1) % self.count;
    }

    /// Release buffers, memory and the node
    pub fn stop(self) {
        drop(self);
    }
}

impl Drop for OutputSession {
    fn drop(&mut self) {
        if let Err(e) = self.device.stream_off(BufferQueue::Output) {
            warn!(node = %self.config.node, error = %e, "Unable to stop output stream");
        }
        if let Err(e) = self.device.request_buffers(BufferQueue::Output, 0) {
            warn!(node = %self.config.node, error = %e, "Unable to release output buffers");
        }

        if let (Some(region), Some(contiguous)) = (self.region.take(), self.contiguous.as_ref()) {
            contiguous.free(&region);
        }

        debug!(node = %self.config.node, "Output stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_length_table() {
        let g = Geometry::new(640, 480);
        let area = 640 * 480;
        assert_eq!(buffer_length(g, PixelFormat::Rgb32), Some(area * 4));
        assert_eq!(buffer_length(g, PixelFormat::Yuyv), Some(area * 2));
        assert_eq!(buffer_length(g, PixelFormat::Nv61), Some(area * 2));
        assert_eq!(buffer_length(g, PixelFormat::Nv21), Some(area * 3 / 2));
        // 307200 -> 327680, 153600 -> 196608
        assert_eq!(buffer_length(g, PixelFormat::Nv12), Some(327_680 + 196_608));
        assert_eq!(buffer_length(g, PixelFormat::Yvu420), Some(327_680 + 196_608));
        assert_eq!(buffer_length(g, PixelFormat::Jpeg), None);
    }

    #[test]
    fn test_yuv_planes_table() {
        let g = Geometry::new(640, 480);
        let base = 0x4000_0000;

        let packed = yuv_planes(g, PixelFormat::Yuyv, base);
        assert_eq!(packed, PlaneAddresses { y: base, cb: 0, cr: 0 });

        let planar = yuv_planes(g, PixelFormat::Yuv420, base);
        assert_eq!(planar.cb, base + 327_680);
        // 76800 -> 131072
        assert_eq!(planar.cr, base + 327_680 + 131_072);

        let nv12 = yuv_planes(g, PixelFormat::Nv12, base);
        assert_eq!(nv12.cb, base + 327_680);
        assert_eq!(nv12.cb, nv12.cr);

        let nv21 = yuv_planes(g, PixelFormat::Nv21, base);
        assert_eq!(nv21.cb, base + 307_200);
        assert_eq!(nv21.cb, nv21.cr);

        let nv16 = yuv_planes(g, PixelFormat::Nv16, base);
        assert_eq!(nv16.cb, base + 307_200);
    }

    #[test]
    fn test_failed_push_stops_stream() {
        let ids = ControlIds::default();
        let provider = Arc::new(crate::backends::virtual_camera::VirtualProvider::new(ids));
        let resources = OutputResources {
            provider: provider.clone(),
            allocator: Arc::new(provider.allocator()),
            contiguous: Some(Arc::new(provider.contiguous())),
            controls: ids,
        };
        let config = OutputConfig {
            node: NodeId::PreviewOutput,
            source: Geometry::new(128, 96),
            source_format: PixelFormat::Yuyv,
            target: Geometry::new(64, 48),
            target_format: PixelFormat::Nv21,
            count: 2,
        };
        let session = OutputSession::start(config, &resources).unwrap();

        let node = provider.node(NodeId::PreviewOutput);
        node.fail_op("dequeue_buffer");
        assert!(session.push(0x5000_0000).is_err());
        assert!(!node.is_streaming(BufferQueue::Output));

        node.clear_failures();
        session.push(0x5000_0000).unwrap();
        assert!(!node.is_streaming(BufferQueue::Output));

        session.stop();
        assert!(!node.is_streaming(BufferQueue::Output));
    }
}
