// SPDX-License-Identifier: GPL-3.0-only

//! V4L2 control interface for the FIMC capture and reshaping nodes
//!
//! The sensor and FIMC drivers expose their pipeline knobs (physical buffer
//! addresses, compressed payload offsets, focus, capture latch) as private
//! controls. The IDs differ between kernel trees, so they are collected in
//! [`ControlIds`] which the configuration can override.

use crate::errors::DeviceError;
use serde::{Deserialize, Serialize};
use std::os::unix::io::RawFd;
use tracing::{debug, warn};

// ===== V4L2 Control Class Bases =====
const V4L2_CID_PRIVATE_BASE: u32 = 0x0800_0000;
const V4L2_CTRL_CLASS_CAMERA: u32 = 0x009a_0000;
const V4L2_CID_CAMERA_CLASS_BASE: u32 = V4L2_CTRL_CLASS_CAMERA | 0x900;

// ===== FIMC Private Control IDs =====

/// Rotation applied by the capture node
pub const V4L2_CID_ROTATION: u32 = V4L2_CID_PRIVATE_BASE;
/// Physical address of the Y plane of a buffer index (set with the index, read back the address)
pub const V4L2_CID_PADDR_Y: u32 = V4L2_CID_PRIVATE_BASE + 1;
/// Physical address of the interleaved CbCr plane
pub const V4L2_CID_PADDR_CBCR: u32 = V4L2_CID_PRIVATE_BASE + 4;
/// Overlay mode of a reshaping node
pub const V4L2_CID_OVLY_MODE: u32 = V4L2_CID_PRIVATE_BASE + 9;
/// Destination planes of a reshaping pass
pub const V4L2_CID_DST_INFO: u32 = V4L2_CID_PRIVATE_BASE + 10;
/// Base of the memory region reserved for a reshaping node
pub const V4L2_CID_RESERVED_MEM_BASE_ADDR: u32 = V4L2_CID_PRIVATE_BASE + 20;
/// FIMC IP revision
pub const V4L2_CID_FIMC_VERSION: u32 = V4L2_CID_PRIVATE_BASE + 21;
/// Size of the reserved region in KiB
pub const V4L2_CID_RESERVED_MEM_SIZE: u32 = V4L2_CID_PRIVATE_BASE + 22;
/// Compressed main image size inside a capture buffer
pub const V4L2_CID_CAM_JPEG_MAIN_SIZE: u32 = V4L2_CID_PRIVATE_BASE + 32;
/// Compressed main image offset inside a capture buffer
pub const V4L2_CID_CAM_JPEG_MAIN_OFFSET: u32 = V4L2_CID_PRIVATE_BASE + 33;
/// Compressed thumbnail size inside a capture buffer
pub const V4L2_CID_CAM_JPEG_THUMB_SIZE: u32 = V4L2_CID_PRIVATE_BASE + 34;
/// Compressed thumbnail offset inside a capture buffer
pub const V4L2_CID_CAM_JPEG_THUMB_OFFSET: u32 = V4L2_CID_PRIVATE_BASE + 35;
/// On-sensor encoder quality
pub const V4L2_CID_CAM_JPEG_QUALITY: u32 = V4L2_CID_PRIVATE_BASE + 37;
/// Metadata lines appended to frames by the sensor
pub const V4L2_CID_EMBEDDEDDATA_ENABLE: u32 = V4L2_CID_PRIVATE_BASE + 110;

// ===== Sensor Control IDs (Camera Class) =====

/// Sensor operating mode (camera, movie)
pub const V4L2_CID_CAMERA_SENSOR_MODE: u32 = V4L2_CID_CAMERA_CLASS_BASE + 14;
/// Focus mode (auto, macro, infinity...)
pub const V4L2_CID_CAMERA_FOCUS_MODE: u32 = V4L2_CID_CAMERA_CLASS_BASE + 15;
/// Flash mode
pub const V4L2_CID_CAMERA_FLASH_MODE: u32 = V4L2_CID_CAMERA_CLASS_BASE + 16;
/// Point of interest for touch focus
pub const V4L2_CID_CAMERA_OBJECT_POSITION_X: u32 = V4L2_CID_CAMERA_CLASS_BASE + 12;
pub const V4L2_CID_CAMERA_OBJECT_POSITION_Y: u32 = V4L2_CID_CAMERA_CLASS_BASE + 13;
/// Start/stop a single auto-focus sweep
pub const V4L2_CID_CAMERA_SET_AUTO_FOCUS: u32 = V4L2_CID_CAMERA_CLASS_BASE + 18;
/// Result of the current auto-focus sweep
pub const V4L2_CID_CAMERA_AUTO_FOCUS_RESULT: u32 = V4L2_CID_CAMERA_CLASS_BASE + 19;
/// White balance preset
pub const V4L2_CID_CAMERA_WHITE_BALANCE: u32 = V4L2_CID_CAMERA_CLASS_BASE + 20;
/// Colour effect
pub const V4L2_CID_CAMERA_EFFECT: u32 = V4L2_CID_CAMERA_CLASS_BASE + 21;
/// Exposure compensation
pub const V4L2_CID_CAMERA_BRIGHTNESS: u32 = V4L2_CID_CAMERA_CLASS_BASE + 22;
/// Sensor gain preset
pub const V4L2_CID_CAMERA_ISO: u32 = V4L2_CID_CAMERA_CLASS_BASE + 23;
/// Mains flicker filter
pub const V4L2_CID_CAMERA_ANTI_BANDING: u32 = V4L2_CID_CAMERA_CLASS_BASE + 25;
/// Scene program
pub const V4L2_CID_CAMERA_SCENE_MODE: u32 = V4L2_CID_CAMERA_CLASS_BASE + 26;
/// Digital zoom step
pub const V4L2_CID_CAMERA_ZOOM: u32 = V4L2_CID_CAMERA_CLASS_BASE + 33;
/// Latch a still frame
pub const V4L2_CID_CAMERA_CAPTURE: u32 = V4L2_CID_CAMERA_CLASS_BASE + 56;
/// Capture mode of a streaming session
pub const V4L2_CID_CAMERA_CAPTURE_MODE: u32 = V4L2_CID_CAMERA_CLASS_BASE + 57;
/// Auto-exposure lock
pub const V4L2_CID_CAMERA_AE_LOCK_UNLOCK: u32 = V4L2_CID_CAMERA_CLASS_BASE + 61;
/// Auto-white-balance lock
pub const V4L2_CID_CAMERA_AWB_LOCK_UNLOCK: u32 = V4L2_CID_CAMERA_CLASS_BASE + 62;

pub const AE_UNLOCK: i32 = 0;
pub const AWB_UNLOCK: i32 = 0;

// ===== FIMC Overlay Modes =====

/// Reshaping pass writes into caller-provided buffers
pub const FIMC_OVLY_NONE_MULTI_BUF: i32 = 5;

// ===== V4L2 ioctl Numbers =====
// Calculated as: (dir << 30) | (size << 16) | ('V' << 8) | nr
// where dir: 2=READ, 1=WRITE, 3=READ|WRITE

/// Get control value (v4l2_control: 8 bytes)
const VIDIOC_G_CTRL: libc::c_ulong = 0xC008561B;
/// Set control value (v4l2_control: 8 bytes)
const VIDIOC_S_CTRL: libc::c_ulong = 0xC008561C;

/// V4L2 control get/set structure
#[repr(C)]
struct V4l2Control {
    id: u32,
    value: i32,
}

/// Control IDs the pipeline uses, overridable per kernel tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlIds {
    pub rotation: u32,
    pub paddr_y: u32,
    pub paddr_cbcr: u32,
    pub overlay_mode: u32,
    pub dst_info: u32,
    pub reserved_mem_base: u32,
    pub reserved_mem_size: u32,
    pub fimc_version: u32,
    pub jpeg_main_size: u32,
    pub jpeg_main_offset: u32,
    pub jpeg_thumb_size: u32,
    pub jpeg_thumb_offset: u32,
    pub jpeg_quality: u32,
    pub embedded_data: u32,
    pub sensor_mode: u32,
    pub focus_mode: u32,
    pub flash_mode: u32,
    pub set_auto_focus: u32,
    pub auto_focus_result: u32,
    pub exposure: u32,
    pub white_balance: u32,
    pub effect: u32,
    pub iso: u32,
    pub anti_banding: u32,
    pub scene_mode: u32,
    pub object_position_x: u32,
    pub object_position_y: u32,
    pub zoom: u32,
    pub capture: u32,
    pub capture_mode: u32,
    pub ae_lock: u32,
    pub awb_lock: u32,
}

impl Default for ControlIds {
    fn default() -> Self {
        Self {
            rotation: V4L2_CID_ROTATION,
            paddr_y: V4L2_CID_PADDR_Y,
            paddr_cbcr: V4L2_CID_PADDR_CBCR,
            overlay_mode: V4L2_CID_OVLY_MODE,
            dst_info: V4L2_CID_DST_INFO,
            reserved_mem_base: V4L2_CID_RESERVED_MEM_BASE_ADDR,
            reserved_mem_size: V4L2_CID_RESERVED_MEM_SIZE,
            fimc_version: V4L2_CID_FIMC_VERSION,
            jpeg_main_size: V4L2_CID_CAM_JPEG_MAIN_SIZE,
            jpeg_main_offset: V4L2_CID_CAM_JPEG_MAIN_OFFSET,
            jpeg_thumb_size: V4L2_CID_CAM_JPEG_THUMB_SIZE,
            jpeg_thumb_offset: V4L2_CID_CAM_JPEG_THUMB_OFFSET,
            jpeg_quality: V4L2_CID_CAM_JPEG_QUALITY,
            embedded_data: V4L2_CID_EMBEDDEDDATA_ENABLE,
            sensor_mode: V4L2_CID_CAMERA_SENSOR_MODE,
            focus_mode: V4L2_CID_CAMERA_FOCUS_MODE,
            flash_mode: V4L2_CID_CAMERA_FLASH_MODE,
            set_auto_focus: V4L2_CID_CAMERA_SET_AUTO_FOCUS,
            auto_focus_result: V4L2_CID_CAMERA_AUTO_FOCUS_RESULT,
            exposure: V4L2_CID_CAMERA_BRIGHTNESS,
            white_balance: V4L2_CID_CAMERA_WHITE_BALANCE,
            effect: V4L2_CID_CAMERA_EFFECT,
            iso: V4L2_CID_CAMERA_ISO,
            anti_banding: V4L2_CID_CAMERA_ANTI_BANDING,
            scene_mode: V4L2_CID_CAMERA_SCENE_MODE,
            object_position_x: V4L2_CID_CAMERA_OBJECT_POSITION_X,
            object_position_y: V4L2_CID_CAMERA_OBJECT_POSITION_Y,
            zoom: V4L2_CID_CAMERA_ZOOM,
            capture: V4L2_CID_CAMERA_CAPTURE,
            capture_mode: V4L2_CID_CAMERA_CAPTURE_MODE,
            ae_lock: V4L2_CID_CAMERA_AE_LOCK_UNLOCK,
            awb_lock: V4L2_CID_CAMERA_AWB_LOCK_UNLOCK,
        }
    }
}

// ===== Public Functions =====

/// Get current value of a control on an open node
pub fn get_control(fd: RawFd, control_id: u32) -> Result<i32, DeviceError> {
    let mut ctrl = V4l2Control {
        id: control_id,
        value: 0,
    };

    let result = unsafe { libc::ioctl(fd, VIDIOC_G_CTRL, &mut ctrl as *mut V4l2Control) };

    if result < 0 {
        let err = DeviceError::last_control(control_id);
        debug!(fd, control_id, error = %err, "Failed to get V4L2 control");
        return Err(err);
    }

    Ok(ctrl.value)
}

/// Set value of a control on an open node
///
/// Returns the value the driver wrote back. Some private controls use this
/// as a query channel, e.g. setting `PADDR_Y` to a buffer index returns that
/// buffer's physical address.
pub fn set_control(fd: RawFd, control_id: u32, value: i32) -> Result<i32, DeviceError> {
    let mut ctrl = V4l2Control {
        id: control_id,
        value,
    };

    let result = unsafe { libc::ioctl(fd, VIDIOC_S_CTRL, &mut ctrl as *mut V4l2Control) };

    if result < 0 {
        let errno = std::io::Error::last_os_error();
        warn!(fd, control_id, value, ?errno, "Failed to set V4L2 control");
        return Err(DeviceError::Control {
            id: control_id,
            reason: errno.to_string(),
        });
    }

    Ok(ctrl.value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_id_values() {
        assert_eq!(V4L2_CID_PADDR_Y, 0x0800_0001);
        assert_eq!(V4L2_CID_RESERVED_MEM_BASE_ADDR, 0x0800_0014);
        assert_eq!(V4L2_CID_CAMERA_CLASS_BASE, 0x009a_0900);
    }

    #[test]
    fn test_ioctl_numbers() {
        // _IOWR('V', 27/28, struct v4l2_control)
        let size = std::mem::size_of::<V4l2Control>() as libc::c_ulong;
        assert_eq!(VIDIOC_G_CTRL, (3 << 30) | (size << 16) | (0x56 << 8) | 27);
        assert_eq!(VIDIOC_S_CTRL, (3 << 30) | (size << 16) | (0x56 << 8) | 28);
    }

    #[test]
    fn test_control_ids_override() {
        let ids: ControlIds = serde_json::from_str(r#"{"paddr_y": 1234}"#).unwrap();
        assert_eq!(ids.paddr_y, 1234);
        assert_eq!(ids.capture, V4L2_CID_CAMERA_CAPTURE);
    }

    #[test]
    fn test_get_control_on_bad_fd() {
        assert!(get_control(-1, V4L2_CID_PADDR_Y).is_err());
        assert!(set_control(-1, V4L2_CID_PADDR_Y, 0).is_err());
    }
}
