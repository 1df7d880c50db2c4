// SPDX-License-Identifier: GPL-3.0-only

//! Stream configuration types

use serde::{Deserialize, Serialize};
use std::fmt;

/// How frames leave the camera
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EncodeType {
    /// Camera-side MJPEG, payloaded as is
    #[default]
    Mjpg,
    /// Camera-side H.264
    H264,
    /// MJPEG from the camera, encoded to H.264 on the host
    SoftwareH264,
}

impl EncodeType {
    /// Pixel format the camera node must provide for this encode type
    pub fn source_fourcc(self) -> &'static str {
        match self {
            EncodeType::H264 => "H264",
            EncodeType::Mjpg | EncodeType::SoftwareH264 => "MJPG",
        }
    }

    /// Container used when recording
    pub fn recording_extension(self) -> &'static str {
        match self {
            EncodeType::Mjpg => "avi",
            EncodeType::H264 | EncodeType::SoftwareH264 => "mp4",
        }
    }
}

impl fmt::Display for EncodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncodeType::Mjpg => write!(f, "MJPG"),
            EncodeType::H264 => write!(f, "H264"),
            EncodeType::SoftwareH264 => write!(f, "SOFTWARE_H264"),
        }
    }
}

/// Where a stream goes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum StreamKind {
    #[default]
    #[serde(rename = "UDP")]
    Udp,
    #[serde(rename = "RECORDING")]
    Recording,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamEndpoint {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for StreamEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Frame interval as a fraction of a second (1/30 = 30 fps)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Interval {
    pub numerator: u32,
    pub denominator: u32,
}

impl Default for Interval {
    fn default() -> Self {
        Self {
            numerator: 1,
            denominator: 30,
        }
    }
}

impl Interval {
    /// Whole frames per second
    pub fn fps(&self) -> u32 {
        if self.numerator == 0 {
            return 0;
        }
        self.denominator / self.numerator
    }
}

/// Everything needed to launch one camera's stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Node the stream reads from, chosen by encode type
    pub device_path: String,
    pub encode_type: EncodeType,
    #[serde(rename = "stream_type")]
    pub kind: StreamKind,
    pub endpoints: Vec<StreamEndpoint>,
    pub width: u32,
    pub height: u32,
    pub interval: Interval,
    pub enabled: bool,
    /// Host encoder bitrate in kbit/s
    pub software_h264_bitrate: u32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            device_path: String::new(),
            encode_type: EncodeType::default(),
            kind: StreamKind::default(),
            endpoints: Vec::new(),
            width: 1920,
            height: 1080,
            interval: Interval::default(),
            enabled: false,
            software_h264_bitrate: 5000,
        }
    }
}

impl StreamConfig {
    pub fn is_recording(&self) -> bool {
        self.kind == StreamKind::Recording
    }

    /// Video node file name (`video0` for `/dev/video0`)
    pub fn node_name(&self) -> &str {
        self.device_path
            .rsplit('/')
            .next()
            .unwrap_or(self.device_path.as_str())
    }
}
