// SPDX-License-Identifier: GPL-3.0-only

//! Pipeline-wide constants

use crate::backends::camera::types::PixelFormat;
use std::time::Duration;

/// Hardware buffer slot counts
pub mod buffers {
    /// Slots requested for a still capture session (tried first, then fewer)
    pub const CAPTURE_BUFFERS_COUNT: u32 = 1;

    /// Slots requested for a continuous preview session
    pub const PREVIEW_BUFFERS_COUNT: u32 = 8;

    /// Slots in the recording output ring and the metadata record pool
    pub const RECORDING_BUFFERS_COUNT: u32 = 6;

    /// One-shot reshaping pass for still pictures
    pub const PICTURE_BUFFERS_COUNT: u32 = 1;
}

/// Sensor mode values understood by the capture driver
pub mod sensor {
    /// `priv` value of the capture format for continuous preview
    pub const PIX_FMT_MODE_PREVIEW: u32 = 0;
    /// `priv` value of the capture format for still capture
    pub const PIX_FMT_MODE_CAPTURE: u32 = 1;

    /// Field value used for the sensor-facing format in preview mode (V4L2_FIELD_NONE)
    pub const FIELD_NONE: u32 = 1;
    /// Field value used for the sensor-facing format in still mode
    pub const FIELD_CAPTURE_STILL: u32 = 2;

    /// Capture-mode control value set after a preview session streams on
    pub const UNKNOWN_CAPTURE_MODE: i32 = 167_774_080;

    /// Auto-focus enable values
    pub const AUTO_FOCUS_OFF: i32 = 0;
    pub const AUTO_FOCUS_ON: i32 = 1;

    /// Auto-focus result values
    pub const AF_STATUS_IN_PROGRESS: i32 = 0;
    pub const AF_STATUS_SUCCESS: i32 = 1;
    pub const AF_STATUS_FAIL: i32 = 2;

    /// ISX012 reports "in progress" with its own bit
    pub const ISX012_AUTO_FOCUS_IN_PROGRESS: i32 = 0x8;
}

/// Memory layout helpers
pub mod memory {
    /// Plane alignment used by the FIMC hardware (64 KiB)
    pub const PLANE_ALIGNMENT: usize = 0x10000;

    /// Reserved memory size control reports KiB
    pub const RESERVED_MEM_UNIT: usize = 1024;

    /// Round `value` up to the plane alignment
    pub const fn align(value: usize) -> usize {
        (value + (PLANE_ALIGNMENT - 1)) & !(PLANE_ALIGNMENT - 1)
    }

    /// Values the driver returns for an unmapped physical address
    pub fn is_invalid_address(value: i32) -> bool {
        value == 0 || value as u32 == 0xffff_ffff
    }
}

/// Timing constants
pub mod timing {
    use super::Duration;

    /// Readiness poll timeout when no capture buffer is ready
    pub const POLL_TIMEOUT: Duration = Duration::from_millis(1000);

    /// Upper bound for a worker thread to observe its stop signal
    /// (10000 polls of 100us)
    pub const WORKER_JOIN_TIMEOUT: Duration = Duration::from_secs(1);

    /// Upper bound for listeners to release a dispatched buffer
    pub const LISTENER_TIMEOUT: Duration = Duration::from_secs(10);

    /// Sleep between auto-focus result polls while focusing
    pub const FOCUS_POLL_INTERVAL: Duration = Duration::from_millis(10);

    /// Pause between dispatch cycles so renegotiation can take the lock
    pub const DISPATCH_YIELD: Duration = Duration::from_micros(10);
}

/// Format the still-picture reshaping pass produces before compression
pub const PICTURE_OUTPUT_FORMAT: PixelFormat = PixelFormat::Yuyv;

/// Application information utilities
pub mod app_info {
    /// Get the crate version from build-time environment
    pub fn version() -> &'static str {
        env!("GIT_VERSION")
    }
}
