// SPDX-License-Identifier: GPL-3.0-only

//! Shared V4L2 utility functions
//!
//! Node discovery through VIDIOC_QUERYCAP.

use super::types::DeviceInfo;
use super::v4l2_device::query_capabilities_fd;
use std::os::unix::io::AsRawFd;
use tracing::debug;

/// Open a node read-only and issue VIDIOC_QUERYCAP on it
///
/// Returns None if the device cannot be opened or the ioctl fails.
pub fn query_device_info(device_path: &str) -> Option<DeviceInfo> {
    let file = std::fs::File::open(device_path).ok()?;
    let info = query_capabilities_fd(file.as_raw_fd(), device_path).ok()?;

    debug!(device_path, driver = %info.driver, card = %info.card, "Queried V4L2 node");
    Some(info)
}

/// Enumerate `/dev/video*` nodes that answer QUERYCAP, sorted by path
pub fn list_nodes() -> Vec<DeviceInfo> {
    let entries = match std::fs::read_dir("/dev") {
        Ok(entries) => entries,
        Err(_) => return Vec::new(),
    };

    let mut nodes: Vec<DeviceInfo> = entries
        .flatten()
        .filter_map(|entry| {
            let name = entry.file_name();
            let name_str = name.to_string_lossy();
            if !name_str.starts_with("video") {
                return None;
            }
            query_device_info(&format!("/dev/{}", name_str))
        })
        .collect();

    // Natural order so video10 sorts after video2
    nodes.sort_by_key(|info| {
        let number = info
            .path
            .trim_start_matches("/dev/video")
            .parse::<u32>()
            .unwrap_or(u32::MAX);
        (number, info.path.clone())
    });
    nodes
}

/// Describe the capability bits the pipeline cares about
pub fn describe_capabilities(capabilities: u32) -> String {
    const FLAGS: [(u32, &str); 3] = [
        (0x0000_0001, "capture"),
        (0x0000_0002, "output"),
        (0x0000_0004, "overlay"),
    ];

    let names: Vec<&str> = FLAGS
        .iter()
        .filter(|(bit, _)| capabilities & bit != 0)
        .map(|(_, name)| *name)
        .collect();

    if names.is_empty() {
        "none".to_string()
    } else {
        names.join(",")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_node() {
        assert!(query_device_info("/dev/does-not-exist").is_none());
    }

    #[test]
    fn test_describe_capabilities() {
        assert_eq!(describe_capabilities(0), "none");
        assert_eq!(describe_capabilities(0x3), "capture,output");
        assert_eq!(describe_capabilities(0x8000_0004), "overlay");
    }
}
