// SPDX-License-Identifier: GPL-3.0-only

//! Supported camera models

use serde::{Deserialize, Serialize};
use std::fmt;

/// Role a model can play in a capture rig
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    Standalone,
    Leader,
    Follower,
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceType::Standalone => write!(f, "standalone"),
            DeviceType::Leader => write!(f, "leader"),
            DeviceType::Follower => write!(f, "follower"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupportedModel {
    pub vid: u16,
    pub pid: u16,
    pub name: &'static str,
    pub device_type: DeviceType,
    /// Exposes the ASIC register window through the extension unit
    pub register_control: bool,
}

pub const SUPPORTED_MODELS: &[SupportedModel] = &[
    SupportedModel {
        vid: 0x0c45,
        pid: 0x6366,
        name: "exploreHD",
        device_type: DeviceType::Standalone,
        register_control: false,
    },
    SupportedModel {
        vid: 0x0c45,
        pid: 0x6367,
        name: "stellarHD Leader",
        device_type: DeviceType::Leader,
        register_control: true,
    },
    SupportedModel {
        vid: 0x0c45,
        pid: 0x6368,
        name: "stellarHD Follower",
        device_type: DeviceType::Follower,
        register_control: true,
    },
];

/// Model for a vendor/product pair, `None` if unsupported
pub fn lookup(vid: u16, pid: u16) -> Option<&'static SupportedModel> {
    SUPPORTED_MODELS
        .iter()
        .find(|model| model.vid == vid && model.pid == pid)
}
