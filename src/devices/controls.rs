// SPDX-License-Identifier: GPL-3.0-only

//! Device control list
//!
//! A device exposes its V4L2 controls plus a few synthetic "options" that are
//! not driver controls (software encoder bitrate, register-level sensor
//! settings). Options live in the same list under ids from a private range so
//! clients can treat both uniformly.

use crate::backends::camera::v4l2_controls::{self, ControlInfo, ControlType};
use crate::errors::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// First id of the synthetic option range (outside every V4L2 control class)
pub const OPTION_CONTROL_BASE: u32 = 0x0F00_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlKind {
    Integer,
    Boolean,
    Menu,
    Button,
    Integer64,
    IntegerMenu,
}

impl ControlKind {
    fn from_v4l2(ctrl_type: ControlType) -> Option<Self> {
        match ctrl_type {
            ControlType::Integer => Some(ControlKind::Integer),
            ControlType::Boolean => Some(ControlKind::Boolean),
            ControlType::Menu => Some(ControlKind::Menu),
            ControlType::Button => Some(ControlKind::Button),
            ControlType::Integer64 => Some(ControlKind::Integer64),
            ControlType::IntegerMenu => Some(ControlKind::IntegerMenu),
            ControlType::CtrlClass | ControlType::Unknown(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MenuEntry {
    pub index: i32,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlFlags {
    pub control_type: ControlKind,
    pub min_value: f64,
    pub max_value: f64,
    pub step: f64,
    pub default_value: f64,
    #[serde(default)]
    pub menu: Vec<MenuEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Control {
    pub control_id: u32,
    pub name: String,
    pub value: f64,
    pub flags: ControlFlags,
}

impl Control {
    fn from_info(device_path: &str, info: &ControlInfo) -> Option<Self> {
        let control_type = ControlKind::from_v4l2(info.ctrl_type)?;
        let menu = match control_type {
            ControlKind::Menu | ControlKind::IntegerMenu => {
                v4l2_controls::query_menu_items(device_path, info.id, info.maximum)
                    .into_iter()
                    .map(|item| MenuEntry {
                        index: item.index,
                        name: item.name,
                    })
                    .collect()
            }
            _ => Vec::new(),
        };
        let value = v4l2_controls::get_control(device_path, info.id).unwrap_or(info.default_value);

        Some(Self {
            control_id: info.id,
            name: info.name.clone(),
            value: f64::from(value),
            flags: ControlFlags {
                control_type,
                min_value: f64::from(info.minimum),
                max_value: f64::from(info.maximum),
                step: f64::from(info.step),
                default_value: f64::from(info.default_value),
                menu,
            },
        })
    }

    /// Check `value` against the control's range
    pub fn validate(&self, value: f64) -> AppResult<f64> {
        if !value.is_finite() || value < self.flags.min_value || value > self.flags.max_value {
            return Err(AppError::InvalidArgument(format!(
                "{} must be within {}..={}, got {}",
                self.name, self.flags.min_value, self.flags.max_value, value
            )));
        }
        Ok(value)
    }
}

/// Read the driver controls of a video node with their current values
pub fn load_v4l2_controls(device_path: &str) -> Vec<Control> {
    let controls: Vec<Control> = v4l2_controls::enumerate_controls(device_path)
        .iter()
        .filter_map(|info| Control::from_info(device_path, info))
        .collect();
    debug!(device = %device_path, count = controls.len(), "Loaded controls");
    controls
}

/// Non-driver settings a device exposes alongside its controls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceOption {
    /// Software H.264 bitrate in Mbit/s
    Bitrate,
    Shutter,
    AutoExposure,
    Iso,
    StrobeWidth,
}

impl DeviceOption {
    pub const ALL: [DeviceOption; 5] = [
        DeviceOption::Bitrate,
        DeviceOption::Shutter,
        DeviceOption::AutoExposure,
        DeviceOption::Iso,
        DeviceOption::StrobeWidth,
    ];

    pub fn key(self) -> &'static str {
        match self {
            DeviceOption::Bitrate => "bitrate",
            DeviceOption::Shutter => "shutter",
            DeviceOption::AutoExposure => "ae",
            DeviceOption::Iso => "iso",
            DeviceOption::StrobeWidth => "strobe_width",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|option| option.key() == key)
    }

    pub fn from_control_id(control_id: u32) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|option| option.control_id() == control_id)
    }

    pub fn control_id(self) -> u32 {
        OPTION_CONTROL_BASE
            + match self {
                DeviceOption::Bitrate => 1,
                DeviceOption::Shutter => 2,
                DeviceOption::AutoExposure => 3,
                DeviceOption::Iso => 4,
                DeviceOption::StrobeWidth => 5,
            }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            DeviceOption::Bitrate => "Software H.264 Bitrate",
            DeviceOption::Shutter => "Shutter Speed",
            DeviceOption::AutoExposure => "Auto Exposure (ASIC)",
            DeviceOption::Iso => "ISO",
            DeviceOption::StrobeWidth => "Strobe Width",
        }
    }

    /// Needs the register-level control path
    pub fn is_register_option(self) -> bool {
        !matches!(self, DeviceOption::Bitrate)
    }

    pub fn default_value(self) -> f64 {
        match self {
            DeviceOption::Bitrate => 5.0,
            DeviceOption::Shutter => 100.0,
            DeviceOption::AutoExposure => 0.0,
            DeviceOption::Iso => 400.0,
            DeviceOption::StrobeWidth => 0.0,
        }
    }

    pub fn control(self) -> Control {
        let (control_type, min_value, max_value, step) = match self {
            DeviceOption::Bitrate => (ControlKind::Integer, 0.1, 10.0, 0.1),
            DeviceOption::Shutter => (ControlKind::Integer, 10.0, 8000.0, 1.0),
            DeviceOption::AutoExposure => (ControlKind::Boolean, 0.0, 1.0, 1.0),
            DeviceOption::Iso => (ControlKind::Integer, 0.0, 4095.0, 1.0),
            DeviceOption::StrobeWidth => (ControlKind::Integer, 0.0, 4095.0, 1.0),
        };
        Control {
            control_id: self.control_id(),
            name: self.display_name().to_string(),
            value: self.default_value(),
            flags: ControlFlags {
                control_type,
                min_value,
                max_value,
                step,
                default_value: self.default_value(),
                menu: Vec::new(),
            },
        }
    }
}

/// Option controls for a model
pub fn option_controls(register_control: bool) -> Vec<Control> {
    DeviceOption::ALL
        .into_iter()
        .filter(|option| register_control || !option.is_register_option())
        .map(DeviceOption::control)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_option_keys_round_trip_through_ids() {
        for option in DeviceOption::ALL {
            assert_eq!(DeviceOption::from_key(option.key()), Some(option));
            assert_eq!(DeviceOption::from_control_id(option.control_id()), Some(option));
        }
        assert_eq!(DeviceOption::from_key("gain"), None);
        assert_eq!(DeviceOption::from_control_id(0x00980900), None);
    }

    #[test]
    fn test_standalone_models_only_get_bitrate() {
        let controls = option_controls(false);
        assert_eq!(controls.len(), 1);
        assert_eq!(controls[0].control_id, DeviceOption::Bitrate.control_id());
        assert_eq!(option_controls(true).len(), DeviceOption::ALL.len());
    }

    #[test]
    fn test_validate_range() {
        let shutter = DeviceOption::Shutter.control();
        assert_eq!(shutter.validate(500.0), Ok(500.0));
        assert!(shutter.validate(5.0).is_err());
        assert!(shutter.validate(9000.0).is_err());
        assert!(shutter.validate(f64::NAN).is_err());

        let bitrate = DeviceOption::Bitrate.control();
        assert_eq!(bitrate.value, 5.0);
        assert!(bitrate.validate(0.5).is_ok());
    }
}
