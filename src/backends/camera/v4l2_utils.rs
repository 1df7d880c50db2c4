// SPDX-License-Identifier: GPL-3.0-only

//! Shared V4L2 utility functions
//!
//! Capability queries, sysfs USB id lookup and per-node format listing used by
//! enumeration and device setup.

use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use tracing::debug;
use v4l::video::Capture;

/// VIDIOC_QUERYCAP ioctl number
const VIDIOC_QUERYCAP: libc::c_ulong = 0x80685600;

/// Single-planar video capture capability
pub const V4L2_CAP_VIDEO_CAPTURE: u32 = 0x00000001;
/// Per-node capabilities are valid
const V4L2_CAP_DEVICE_CAPS: u32 = 0x80000000;

/// V4L2 capability structure for VIDIOC_QUERYCAP ioctl
#[repr(C)]
struct V4l2Capability {
    driver: [u8; 16],
    card: [u8; 32],
    bus_info: [u8; 32],
    version: u32,
    capabilities: u32,
    device_caps: u32,
    reserved: [u32; 3],
}

/// Decoded VIDIOC_QUERYCAP result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeCapabilities {
    pub driver: String,
    pub card: String,
    pub bus_info: String,
    /// Capabilities of this node (device_caps when reported, else the global set)
    pub caps: u32,
}

impl NodeCapabilities {
    pub fn is_video_capture(&self) -> bool {
        self.caps & V4L2_CAP_VIDEO_CAPTURE != 0
    }
}

fn c_string(bytes: &[u8]) -> String {
    let len = bytes.iter().position(|&c| c == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..len]).to_string()
}

fn query_v4l2_cap(fd: RawFd) -> Option<V4l2Capability> {
    let mut cap: V4l2Capability = unsafe { std::mem::zeroed() };
    let result = unsafe { libc::ioctl(fd, VIDIOC_QUERYCAP as _, &mut cap as *mut V4l2Capability) };
    if result < 0 { None } else { Some(cap) }
}

/// Query capabilities of a video node
pub fn query_capabilities(device_path: &str) -> Option<NodeCapabilities> {
    let file = std::fs::File::open(device_path).ok()?;
    let cap = query_v4l2_cap(file.as_raw_fd())?;

    let caps = if cap.capabilities & V4L2_CAP_DEVICE_CAPS != 0 && cap.device_caps != 0 {
        cap.device_caps
    } else {
        cap.capabilities
    };

    Some(NodeCapabilities {
        driver: c_string(&cap.driver),
        card: c_string(&cap.card),
        bus_info: c_string(&cap.bus_info),
        caps,
    })
}

/// Read the USB vendor/product id of a video node from sysfs
///
/// The node's `device` link points at the USB interface; `idVendor` and
/// `idProduct` live a few levels up on the USB device itself.
pub fn usb_ids_for_node(sysfs_class_dir: &Path, node_name: &str) -> Option<(u16, u16)> {
    let device_link = sysfs_class_dir.join(node_name).join("device");
    let mut path: PathBuf = std::fs::canonicalize(&device_link).ok()?;

    for _ in 0..5 {
        let vendor_file = path.join("idVendor");
        let product_file = path.join("idProduct");
        if vendor_file.exists() && product_file.exists() {
            let vendor = std::fs::read_to_string(&vendor_file).ok()?;
            let product = std::fs::read_to_string(&product_file).ok()?;
            let vid = u16::from_str_radix(vendor.trim(), 16).ok()?;
            let pid = u16::from_str_radix(product.trim(), 16).ok()?;
            debug!(node = node_name, vid, pid, "Resolved USB ids");
            return Some((vid, pid));
        }
        if !path.pop() {
            break;
        }
    }

    None
}

/// Pixel formats (fourcc strings) a node can produce
pub fn list_pixel_formats(device_path: &str) -> Vec<String> {
    let dev = match v4l::Device::with_path(device_path) {
        Ok(d) => d,
        Err(e) => {
            debug!(device_path, error = %e, "Cannot open node to list formats");
            return Vec::new();
        }
    };

    match dev.enum_formats() {
        Ok(formats) => formats
            .iter()
            .map(|desc| String::from_utf8_lossy(&desc.fourcc.repr).to_string())
            .collect(),
        Err(e) => {
            debug!(device_path, error = %e, "Format enumeration failed");
            Vec::new()
        }
    }
}

/// Numeric suffix of a node path (`/dev/video12` -> 12), used for ordering
pub fn node_number(device_path: &str) -> u32 {
    let digits: String = device_path
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_digit())
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    digits.parse().unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_number_orders_numerically() {
        let mut nodes = vec!["/dev/video10", "/dev/video2", "/dev/video0"];
        nodes.sort_by_key(|p| node_number(p));
        assert_eq!(nodes, vec!["/dev/video0", "/dev/video2", "/dev/video10"]);
    }

    #[test]
    fn test_c_string_stops_at_nul() {
        let mut raw = [0u8; 32];
        raw[..9].copy_from_slice(b"usb-1.2.3");
        assert_eq!(c_string(&raw), "usb-1.2.3");
    }

    #[test]
    fn test_usb_ids_from_fake_sysfs() {
        let root = tempfile::tempdir().unwrap();
        let usb_dev = root.path().join("devices/usb1/1-1");
        let interface = usb_dev.join("1-1:1.0");
        std::fs::create_dir_all(&interface).unwrap();
        std::fs::write(usb_dev.join("idVendor"), "0c45\n").unwrap();
        std::fs::write(usb_dev.join("idProduct"), "6366\n").unwrap();

        let class_dir = root.path().join("class");
        std::fs::create_dir_all(class_dir.join("video0")).unwrap();
        std::os::unix::fs::symlink(&interface, class_dir.join("video0/device")).unwrap();

        assert_eq!(usb_ids_for_node(&class_dir, "video0"), Some((0x0c45, 0x6366)));
        assert_eq!(usb_ids_for_node(&class_dir, "video9"), None);
    }
}
