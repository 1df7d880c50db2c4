// SPDX-License-Identifier: GPL-3.0-only

//! Shared types for camera enumeration and capture

use serde::{Deserialize, Serialize};
use std::fmt;

/// A physical camera attachment as reported by the OS
///
/// One USB camera usually exposes several video nodes (e.g. one for H.264 and
/// one for MJPEG); they share a bus identifier and are grouped here. Two
/// descriptors are equal only if every field matches, so a re-enumerated device
/// whose node set changed is treated as a removal plus an addition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// Stable attachment identifier (V4L2 `bus_info`)
    pub bus_info: String,
    /// USB vendor id
    pub vid: u16,
    /// USB product id
    pub pid: u16,
    /// Card name reported by the driver
    pub card: String,
    /// Capture-capable device nodes, sorted by node number
    pub device_paths: Vec<String>,
}

impl DeviceDescriptor {
    /// Node used for control and register access
    pub fn primary_path(&self) -> Option<&str> {
        self.device_paths.first().map(String::as_str)
    }
}

impl fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:04x}:{:04x})", self.bus_info, self.vid, self.pid)
    }
}

/// Four-character pixel format code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PixelFormat(pub [u8; 4]);

impl PixelFormat {
    pub const MJPG: PixelFormat = PixelFormat(*b"MJPG");
    pub const H264: PixelFormat = PixelFormat(*b"H264");

    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.0).unwrap_or("????")
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One captured frame
///
/// `data` is an owned copy of the bytes the driver reported as used; it never
/// points into a mapped capture buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    /// Kernel capture timestamp in microseconds
    pub timestamp_us: u64,
}

/// Result type for capture operations
pub type CaptureResult<T> = Result<T, CaptureError>;

/// Errors raised while opening or negotiating a capture device
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureError {
    /// The device node could not be opened
    Open { path: String, reason: String },
    /// The driver rejected the requested pixel format or resolution
    Format { path: String, reason: String },
    /// The driver cannot run at the requested frame rate
    FrameRate { path: String, reason: String },
    /// Buffer request, mapping or queueing failed
    Buffers { path: String, reason: String },
    /// STREAMON/STREAMOFF failed
    Stream { path: String, reason: String },
}

impl CaptureError {
    pub fn path(&self) -> &str {
        match self {
            CaptureError::Open { path, .. }
            | CaptureError::Format { path, .. }
            | CaptureError::FrameRate { path, .. }
            | CaptureError::Buffers { path, .. }
            | CaptureError::Stream { path, .. } => path,
        }
    }
}

impl fmt::Display for CaptureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureError::Open { reason, .. } => write!(f, "open failed: {}", reason),
            CaptureError::Format { reason, .. } => write!(f, "format rejected: {}", reason),
            CaptureError::FrameRate { reason, .. } => write!(f, "frame rate rejected: {}", reason),
            CaptureError::Buffers { reason, .. } => write!(f, "buffer setup failed: {}", reason),
            CaptureError::Stream { reason, .. } => write!(f, "stream toggle failed: {}", reason),
        }
    }
}

impl std::error::Error for CaptureError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_equality_covers_nodes() {
        let a = DeviceDescriptor {
            bus_info: "usb-1".to_string(),
            vid: 0x0c45,
            pid: 0x6366,
            card: "cam".to_string(),
            device_paths: vec!["/dev/video0".to_string()],
        };
        let mut b = a.clone();
        assert_eq!(a, b);
        b.device_paths.push("/dev/video2".to_string());
        assert_ne!(a, b);
    }

    #[test]
    fn test_pixel_format_display() {
        assert_eq!(PixelFormat::MJPG.to_string(), "MJPG");
        assert_eq!(PixelFormat(*b"H264"), PixelFormat::H264);
    }
}
