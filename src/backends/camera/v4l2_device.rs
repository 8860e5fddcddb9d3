// SPDX-License-Identifier: GPL-3.0-only

//! V4L2 implementation of the device control channel
//!
//! Nodes are opened through `v4l::Device`, which owns the file descriptor.
//! The FIMC pipeline relies on ioctls the `v4l` crate does not wrap (overlay
//! windows, framebuffer setup, userptr output queues, private buffer types),
//! so those go through `libc` with the kernel structures mirrored below.

use super::types::{
    BufferQueue, DeviceInfo, Geometry, NodeId, PixelFormat, PlaneAddresses, Rect,
};
use super::v4l2_controls::{self, ControlIds};
use super::{DeviceProvider, DeviceResult, VideoDevice};
use crate::errors::DeviceError;
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};
use v4l::video::Capture;

// ===== Kernel structures =====

#[repr(C)]
#[derive(Clone, Copy)]
struct V4l2Capability {
    driver: [u8; 16],
    card: [u8; 32],
    bus_info: [u8; 32],
    version: u32,
    capabilities: u32,
    device_caps: u32,
    reserved: [u32; 3],
}

#[repr(C)]
#[derive(Clone, Copy)]
struct V4l2PixFormat {
    width: u32,
    height: u32,
    pixelformat: u32,
    field: u32,
    bytesperline: u32,
    sizeimage: u32,
    colorspace: u32,
    priv_: u32,
    flags: u32,
    ycbcr_enc: u32,
    quantization: u32,
    xfer_func: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct V4l2Rect {
    left: i32,
    top: i32,
    width: u32,
    height: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct V4l2Window {
    w: V4l2Rect,
    field: u32,
    chromakey: u32,
    clips: *mut libc::c_void,
    clipcount: u32,
    bitmap: *mut libc::c_void,
    global_alpha: u8,
}

/// `fmt` member of `struct v4l2_format`, 200 bytes with pointer alignment
#[repr(C)]
#[derive(Clone, Copy)]
union V4l2FormatUnion {
    pix: V4l2PixFormat,
    win: V4l2Window,
    raw: [u8; 200],
}

#[repr(C)]
#[derive(Clone, Copy)]
struct V4l2Format {
    type_: u32,
    fmt: V4l2FormatUnion,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct V4l2FmtDesc {
    index: u32,
    type_: u32,
    flags: u32,
    description: [u8; 32],
    pixelformat: u32,
    mbus_code: u32,
    reserved: [u32; 3],
}

#[repr(C)]
#[derive(Clone, Copy)]
struct V4l2RequestBuffers {
    count: u32,
    type_: u32,
    memory: u32,
    capabilities: u32,
    flags: u8,
    reserved: [u8; 3],
}

#[repr(C)]
#[derive(Clone, Copy)]
struct V4l2Timecode {
    type_: u32,
    flags: u32,
    frames: u8,
    seconds: u8,
    minutes: u8,
    hours: u8,
    userbits: [u8; 4],
}

#[repr(C)]
#[derive(Clone, Copy)]
union V4l2BufferM {
    offset: u32,
    userptr: libc::c_ulong,
    fd: i32,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct V4l2Buffer {
    index: u32,
    type_: u32,
    bytesused: u32,
    flags: u32,
    field: u32,
    timestamp: libc::timeval,
    timecode: V4l2Timecode,
    sequence: u32,
    memory: u32,
    m: V4l2BufferM,
    length: u32,
    reserved2: u32,
    request_fd: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct V4l2Fract {
    numerator: u32,
    denominator: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct V4l2CaptureParm {
    capability: u32,
    capturemode: u32,
    timeperframe: V4l2Fract,
    extendedmode: u32,
    readbuffers: u32,
    reserved: [u32; 4],
}

#[repr(C)]
#[derive(Clone, Copy)]
union V4l2StreamParmUnion {
    capture: V4l2CaptureParm,
    raw: [u8; 200],
}

#[repr(C)]
#[derive(Clone, Copy)]
struct V4l2StreamParm {
    type_: u32,
    parm: V4l2StreamParmUnion,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct V4l2Crop {
    type_: u32,
    c: V4l2Rect,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct V4l2FramebufferFormat {
    width: u32,
    height: u32,
    pixelformat: u32,
    field: u32,
    bytesperline: u32,
    sizeimage: u32,
    colorspace: u32,
    priv_: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct V4l2Framebuffer {
    capability: u32,
    flags: u32,
    base: *mut libc::c_void,
    fmt: V4l2FramebufferFormat,
}

/// Destination descriptor handed to the FIMC driver through `DST_INFO`
#[repr(C)]
#[derive(Clone, Copy, Default)]
struct FimcBuffer {
    base: [u32; 3],
    length: [usize; 3],
}

// ===== ioctl numbers =====

const IOC_WRITE: libc::c_ulong = 1;
const IOC_READ: libc::c_ulong = 2;

const fn vidioc(dir: libc::c_ulong, nr: libc::c_ulong, size: usize) -> libc::c_ulong {
    (dir << 30) | ((size as libc::c_ulong) << 16) | ((b'V' as libc::c_ulong) << 8) | nr
}

const VIDIOC_QUERYCAP: libc::c_ulong = vidioc(IOC_READ, 0, size_of::<V4l2Capability>());
const VIDIOC_ENUM_FMT: libc::c_ulong =
    vidioc(IOC_READ | IOC_WRITE, 2, size_of::<V4l2FmtDesc>());
const VIDIOC_G_FMT: libc::c_ulong = vidioc(IOC_READ | IOC_WRITE, 4, size_of::<V4l2Format>());
const VIDIOC_S_FMT: libc::c_ulong = vidioc(IOC_READ | IOC_WRITE, 5, size_of::<V4l2Format>());
const VIDIOC_REQBUFS: libc::c_ulong =
    vidioc(IOC_READ | IOC_WRITE, 8, size_of::<V4l2RequestBuffers>());
const VIDIOC_QUERYBUF: libc::c_ulong = vidioc(IOC_READ | IOC_WRITE, 9, size_of::<V4l2Buffer>());
const VIDIOC_G_FBUF: libc::c_ulong = vidioc(IOC_READ, 10, size_of::<V4l2Framebuffer>());
const VIDIOC_S_FBUF: libc::c_ulong = vidioc(IOC_WRITE, 11, size_of::<V4l2Framebuffer>());
const VIDIOC_QBUF: libc::c_ulong = vidioc(IOC_READ | IOC_WRITE, 15, size_of::<V4l2Buffer>());
const VIDIOC_DQBUF: libc::c_ulong = vidioc(IOC_READ | IOC_WRITE, 17, size_of::<V4l2Buffer>());
const VIDIOC_STREAMON: libc::c_ulong = vidioc(IOC_WRITE, 18, size_of::<i32>());
const VIDIOC_STREAMOFF: libc::c_ulong = vidioc(IOC_WRITE, 19, size_of::<i32>());
const VIDIOC_S_PARM: libc::c_ulong =
    vidioc(IOC_READ | IOC_WRITE, 22, size_of::<V4l2StreamParm>());
const VIDIOC_S_CROP: libc::c_ulong = vidioc(IOC_WRITE, 60, size_of::<V4l2Crop>());

const V4L2_MEMORY_MMAP: u32 = 1;
const V4L2_MEMORY_USERPTR: u32 = 2;
const V4L2_FIELD_NONE: u32 = 1;

const V4L2_CAP_VIDEO_CAPTURE: u32 = 0x0000_0001;
const V4L2_CAP_VIDEO_OUTPUT: u32 = 0x0000_0002;
const V4L2_CAP_VIDEO_OVERLAY: u32 = 0x0000_0004;

/// Issue an ioctl, mapping failure to a `DeviceError` carrying errno
fn ioctl<T>(fd: RawFd, request: libc::c_ulong, name: &'static str, arg: &mut T) -> DeviceResult<()> {
    let rc = unsafe { libc::ioctl(fd, request as _, arg as *mut T) };
    if rc < 0 {
        Err(DeviceError::last_ioctl(name))
    } else {
        Ok(())
    }
}

fn c_string(bytes: &[u8]) -> String {
    let len = bytes.iter().position(|&c| c == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..len]).to_string()
}

fn memory_kind(queue: BufferQueue) -> u32 {
    match queue {
        BufferQueue::Output => V4L2_MEMORY_USERPTR,
        _ => V4L2_MEMORY_MMAP,
    }
}

/// Issue VIDIOC_QUERYCAP on an open descriptor
pub(crate) fn query_capabilities_fd(fd: RawFd, path: &str) -> DeviceResult<DeviceInfo> {
    let mut cap: V4l2Capability = unsafe { std::mem::zeroed() };
    ioctl(fd, VIDIOC_QUERYCAP, "VIDIOC_QUERYCAP", &mut cap)?;

    let capabilities = if cap.device_caps != 0 {
        cap.device_caps
    } else {
        cap.capabilities
    };

    Ok(DeviceInfo {
        path: path.to_string(),
        driver: c_string(&cap.driver),
        card: c_string(&cap.card),
        capabilities,
    })
}

/// One open V4L2 node
pub struct V4l2Device {
    device: v4l::Device,
    fd: RawFd,
    path: String,
    controls: ControlIds,
}

impl V4l2Device {
    /// Open a node by path
    pub fn open(path: &str, controls: ControlIds) -> DeviceResult<Self> {
        let device = v4l::Device::with_path(path).map_err(|e| DeviceError::Open {
            path: path.to_string(),
            reason: e.to_string(),
        })?;
        let fd = device.handle().fd();

        info!(path, fd, "Opened V4L2 node");

        Ok(Self {
            device,
            fd,
            path: path.to_string(),
            controls,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Raw ENUM_FMT walk for queues the `v4l` crate does not enumerate
    fn enum_format_raw(&self, queue: BufferQueue, fourcc: u32) -> DeviceResult<bool> {
        let mut index = 0;
        loop {
            let mut desc: V4l2FmtDesc = unsafe { std::mem::zeroed() };
            desc.index = index;
            desc.type_ = queue.raw();

            let rc = unsafe { libc::ioctl(self.fd, VIDIOC_ENUM_FMT as _, &mut desc as *mut _) };
            if rc < 0 {
                let errno = std::io::Error::last_os_error();
                // EINVAL marks the end of the list
                if errno.raw_os_error() == Some(libc::EINVAL) {
                    return Ok(false);
                }
                return Err(DeviceError::Ioctl {
                    request: "VIDIOC_ENUM_FMT",
                    reason: errno.to_string(),
                });
            }

            if desc.pixelformat == fourcc {
                return Ok(true);
            }
            index += 1;
        }
    }
}

impl VideoDevice for V4l2Device {
    fn query_capabilities(&self, queue: BufferQueue) -> DeviceResult<DeviceInfo> {
        let info = query_capabilities_fd(self.fd, &self.path)?;

        let required = match queue {
            BufferQueue::Capture | BufferQueue::Private => V4L2_CAP_VIDEO_CAPTURE,
            BufferQueue::Output => V4L2_CAP_VIDEO_OUTPUT,
            BufferQueue::Overlay => V4L2_CAP_VIDEO_OVERLAY,
        };
        if info.capabilities & required == 0 {
            error!(path = %self.path, capabilities = info.capabilities, "Node lacks required capability");
            return Err(DeviceError::Ioctl {
                request: "VIDIOC_QUERYCAP",
                reason: format!("capability 0x{:x} missing", required),
            });
        }

        debug!(path = %self.path, driver = %info.driver, card = %info.card, "Queried capabilities");
        Ok(info)
    }

    fn enum_format(&self, queue: BufferQueue, format: PixelFormat) -> DeviceResult<bool> {
        let fourcc = format.fourcc();
        if queue != BufferQueue::Capture {
            return self.enum_format_raw(queue, fourcc);
        }

        let formats = self.device.enum_formats().map_err(|e| DeviceError::Ioctl {
            request: "VIDIOC_ENUM_FMT",
            reason: e.to_string(),
        })?;
        Ok(formats
            .iter()
            .any(|desc| u32::from_le_bytes(desc.fourcc.repr) == fourcc))
    }

    fn set_format(
        &self,
        queue: BufferQueue,
        geometry: Geometry,
        format: PixelFormat,
        field: u32,
        mode: u32,
    ) -> DeviceResult<()> {
        let mut fmt: V4l2Format = unsafe { std::mem::zeroed() };
        fmt.type_ = queue.raw();

        let (field, mode) = match queue {
            BufferQueue::Capture | BufferQueue::Private => (field, mode),
            _ => (V4L2_FIELD_NONE, 0),
        };

        fmt.fmt.pix = V4l2PixFormat {
            width: geometry.width,
            height: geometry.height,
            pixelformat: format.fourcc(),
            field,
            bytesperline: 0,
            sizeimage: 0,
            colorspace: 0,
            priv_: mode,
            flags: 0,
            ycbcr_enc: 0,
            quantization: 0,
            xfer_func: 0,
        };

        ioctl(self.fd, VIDIOC_S_FMT, "VIDIOC_S_FMT", &mut fmt)?;
        debug!(path = %self.path, ?queue, %geometry, %format, "Set format");
        Ok(())
    }

    fn get_format(&self, queue: BufferQueue) -> DeviceResult<(Geometry, PixelFormat)> {
        let mut fmt: V4l2Format = unsafe { std::mem::zeroed() };
        fmt.type_ = queue.raw();
        fmt.fmt.pix.field = V4L2_FIELD_NONE;

        ioctl(self.fd, VIDIOC_G_FMT, "VIDIOC_G_FMT", &mut fmt)?;

        // SAFETY: pix is the active member for the queues we query
        let pix = unsafe { fmt.fmt.pix };
        let format = PixelFormat::from_fourcc(pix.pixelformat)
            .ok_or(DeviceError::FormatUnsupported(pix.pixelformat))?;
        Ok((Geometry::new(pix.width, pix.height), format))
    }

    fn set_window(&self, window: Rect) -> DeviceResult<()> {
        let mut fmt: V4l2Format = unsafe { std::mem::zeroed() };
        fmt.type_ = BufferQueue::Overlay.raw();
        fmt.fmt.win = V4l2Window {
            w: V4l2Rect {
                left: window.left,
                top: window.top,
                width: window.width,
                height: window.height,
            },
            field: 0,
            chromakey: 0,
            clips: std::ptr::null_mut(),
            clipcount: 0,
            bitmap: std::ptr::null_mut(),
            global_alpha: 0,
        };

        ioctl(self.fd, VIDIOC_S_FMT, "VIDIOC_S_FMT", &mut fmt)
    }

    fn set_crop(&self, queue: BufferQueue, crop: Rect) -> DeviceResult<()> {
        let mut arg = V4l2Crop {
            type_: queue.raw(),
            c: V4l2Rect {
                left: crop.left,
                top: crop.top,
                width: crop.width,
                height: crop.height,
            },
        };
        ioctl(self.fd, VIDIOC_S_CROP, "VIDIOC_S_CROP", &mut arg)
    }

    fn get_framebuffer(&self) -> DeviceResult<u32> {
        let mut fb: V4l2Framebuffer = unsafe { std::mem::zeroed() };
        ioctl(self.fd, VIDIOC_G_FBUF, "VIDIOC_G_FBUF", &mut fb)?;
        // Physical addresses on this hardware are 32 bits wide
        Ok(fb.base as usize as u32)
    }

    fn set_framebuffer(
        &self,
        base: u32,
        geometry: Geometry,
        format: PixelFormat,
    ) -> DeviceResult<()> {
        let mut fb: V4l2Framebuffer = unsafe { std::mem::zeroed() };
        fb.base = base as usize as *mut libc::c_void;
        fb.fmt.width = geometry.width;
        fb.fmt.height = geometry.height;
        fb.fmt.pixelformat = format.fourcc();

        ioctl(self.fd, VIDIOC_S_FBUF, "VIDIOC_S_FBUF", &mut fb)
    }

    fn set_destination(&self, planes: &PlaneAddresses) -> DeviceResult<()> {
        let info = FimcBuffer {
            base: [planes.y, planes.cb, planes.cr],
            length: [0; 3],
        };

        // The driver takes the descriptor's address as the control value,
        // which only round-trips on 32-bit targets
        let pointer = &info as *const FimcBuffer as usize;
        let value = i32::try_from(pointer).map_err(|_| DeviceError::Control {
            id: self.controls.dst_info,
            reason: "descriptor address does not fit the control value".to_string(),
        })?;

        v4l2_controls::set_control(self.fd, self.controls.dst_info, value)?;
        Ok(())
    }

    fn request_buffers(&self, queue: BufferQueue, count: u32) -> DeviceResult<u32> {
        let mut req = V4l2RequestBuffers {
            count,
            type_: queue.raw(),
            memory: memory_kind(queue),
            capabilities: 0,
            flags: 0,
            reserved: [0; 3],
        };

        ioctl(self.fd, VIDIOC_REQBUFS, "VIDIOC_REQBUFS", &mut req)?;
        debug!(path = %self.path, ?queue, requested = count, granted = req.count, "Requested buffers");
        Ok(req.count)
    }

    fn query_buffer(&self, queue: BufferQueue, index: u32) -> DeviceResult<u32> {
        let mut buf: V4l2Buffer = unsafe { std::mem::zeroed() };
        buf.type_ = queue.raw();
        buf.memory = memory_kind(queue);
        buf.index = index;

        ioctl(self.fd, VIDIOC_QUERYBUF, "VIDIOC_QUERYBUF", &mut buf)?;
        Ok(buf.length)
    }

    fn queue_buffer(
        &self,
        queue: BufferQueue,
        index: u32,
        planes: Option<&PlaneAddresses>,
    ) -> DeviceResult<()> {
        let mut buf: V4l2Buffer = unsafe { std::mem::zeroed() };
        buf.type_ = queue.raw();
        buf.memory = memory_kind(queue);
        buf.index = index;

        // Userptr output buffers point at a FIMC descriptor of the source planes
        let source = planes.map(|p| FimcBuffer {
            base: [p.y, p.cb, p.cr],
            length: [0; 3],
        });
        if let Some(source) = source.as_ref() {
            buf.m.userptr = source as *const FimcBuffer as libc::c_ulong;
        }

        ioctl(self.fd, VIDIOC_QBUF, "VIDIOC_QBUF", &mut buf)
    }

    fn dequeue_buffer(&self, queue: BufferQueue) -> DeviceResult<Option<u32>> {
        let mut buf: V4l2Buffer = unsafe { std::mem::zeroed() };
        buf.type_ = queue.raw();
        buf.memory = memory_kind(queue);

        let rc = unsafe { libc::ioctl(self.fd, VIDIOC_DQBUF as _, &mut buf as *mut V4l2Buffer) };
        if rc < 0 {
            let errno = std::io::Error::last_os_error();
            if errno.raw_os_error() == Some(libc::EAGAIN) {
                return Ok(None);
            }
            // Blocking nodes report an empty queue as EINVAL on this driver
            debug!(path = %self.path, ?errno, "Nothing dequeued");
            return Ok(None);
        }

        Ok(Some(buf.index))
    }

    fn stream_on(&self, queue: BufferQueue) -> DeviceResult<()> {
        let mut kind = queue.raw() as i32;
        ioctl(self.fd, VIDIOC_STREAMON, "VIDIOC_STREAMON", &mut kind)
    }

    fn stream_off(&self, queue: BufferQueue) -> DeviceResult<()> {
        let mut kind = queue.raw() as i32;
        ioctl(self.fd, VIDIOC_STREAMOFF, "VIDIOC_STREAMOFF", &mut kind)
    }

    fn set_frame_rate(&self, fps: u32) -> DeviceResult<()> {
        let mut parm: V4l2StreamParm = unsafe { std::mem::zeroed() };
        parm.type_ = BufferQueue::Capture.raw();
        parm.parm.capture = V4l2CaptureParm {
            capability: 0,
            capturemode: 0,
            timeperframe: V4l2Fract {
                numerator: 1,
                denominator: fps,
            },
            extendedmode: 0,
            readbuffers: 0,
            reserved: [0; 4],
        };

        ioctl(self.fd, VIDIOC_S_PARM, "VIDIOC_S_PARM", &mut parm)
    }

    fn get_control(&self, id: u32) -> DeviceResult<i32> {
        v4l2_controls::get_control(self.fd, id)
    }

    fn set_control(&self, id: u32, value: i32) -> DeviceResult<i32> {
        v4l2_controls::set_control(self.fd, id, value)
    }

    fn poll(&self, timeout: Duration) -> DeviceResult<bool> {
        let mut events = libc::pollfd {
            fd: self.fd,
            events: libc::POLLIN | libc::POLLERR,
            revents: 0,
        };

        let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;
        let rc = unsafe { libc::poll(&mut events, 1, timeout_ms) };
        if rc < 0 {
            return Err(DeviceError::Poll(std::io::Error::last_os_error().to_string()));
        }
        if events.revents & libc::POLLERR != 0 {
            return Err(DeviceError::Poll("POLLERR".to_string()));
        }

        Ok(rc > 0)
    }

    fn memory_token(&self) -> i32 {
        self.fd
    }
}

/// Opens nodes from the configured path table
pub struct V4l2Provider {
    nodes: [PathBuf; 4],
    controls: ControlIds,
}

impl V4l2Provider {
    pub fn new(nodes: [PathBuf; 4], controls: ControlIds) -> Self {
        Self { nodes, controls }
    }
}

impl DeviceProvider for V4l2Provider {
    fn open(&self, node: NodeId) -> DeviceResult<Arc<dyn VideoDevice>> {
        let path = self.nodes[node.index()].to_string_lossy().to_string();
        let device = V4l2Device::open(&path, self.controls)?;
        debug!(%node, path = %device.path(), "Opened pipeline node");
        Ok(Arc::new(device))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_struct_layouts() {
        assert_eq!(size_of::<V4l2Capability>(), 104);
        assert_eq!(size_of::<V4l2PixFormat>(), 48);
        assert_eq!(size_of::<V4l2FormatUnion>(), 200);
        assert_eq!(size_of::<V4l2FmtDesc>(), 64);
        assert_eq!(size_of::<V4l2RequestBuffers>(), 20);
        assert_eq!(size_of::<V4l2Crop>(), 20);
        assert_eq!(size_of::<V4l2StreamParm>(), 204);
    }

    #[test]
    fn test_ioctl_numbers() {
        assert_eq!(VIDIOC_QUERYCAP, 0x8068_5600);
        assert_eq!(VIDIOC_REQBUFS, 0xC014_5608);
        assert_eq!(VIDIOC_STREAMON, 0x4004_5612);
        assert_eq!(VIDIOC_S_CROP, 0x4014_563C);
        assert_eq!(VIDIOC_S_PARM, 0xC0CC_5616);
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn test_pointer_sized_layouts() {
        assert_eq!(size_of::<V4l2Format>(), 208);
        assert_eq!(size_of::<V4l2Buffer>(), 88);
        assert_eq!(size_of::<V4l2Framebuffer>(), 48);
    }

    #[test]
    fn test_open_missing_node() {
        let result = V4l2Device::open("/dev/does-not-exist", ControlIds::default());
        assert!(matches!(result, Err(DeviceError::Open { .. })));
    }
}
