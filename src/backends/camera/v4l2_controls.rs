// SPDX-License-Identifier: GPL-3.0-only

//! V4L2 camera control interface
//!
//! Enumerates, reads and writes standard V4L2 controls, and issues UVC
//! extension-unit queries used for register-level access on cameras that
//! expose one.

use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use tracing::{debug, warn};

// ===== V4L2 Control Types =====
const V4L2_CTRL_TYPE_INTEGER: u32 = 1;
const V4L2_CTRL_TYPE_BOOLEAN: u32 = 2;
const V4L2_CTRL_TYPE_MENU: u32 = 3;
const V4L2_CTRL_TYPE_BUTTON: u32 = 4;
const V4L2_CTRL_TYPE_INTEGER64: u32 = 5;
const V4L2_CTRL_TYPE_CTRL_CLASS: u32 = 6;
const V4L2_CTRL_TYPE_INTEGER_MENU: u32 = 9;

// ===== V4L2 Control Flags =====
const V4L2_CTRL_FLAG_DISABLED: u32 = 0x0001;
const V4L2_CTRL_FLAG_NEXT_CTRL: u32 = 0x80000000;

// ===== ioctl Numbers =====
// Calculated as: (dir << 30) | (size << 16) | (type << 8) | nr
// where dir: 2=READ, 1=WRITE, 3=READ|WRITE

/// Get control value (v4l2_control: 8 bytes)
const VIDIOC_G_CTRL: libc::c_ulong = 0xC008561B;
/// Set control value (v4l2_control: 8 bytes)
const VIDIOC_S_CTRL: libc::c_ulong = 0xC008561C;
/// Query control info (v4l2_queryctrl: 68 bytes)
const VIDIOC_QUERYCTRL: libc::c_ulong = 0xC0445624;
/// Query menu item (v4l2_querymenu: 44 bytes)
const VIDIOC_QUERYMENU: libc::c_ulong = 0xC02C5625;

/// UVC extension unit query, `_IOWR('u', 0x21, struct uvc_xu_control_query)`
const fn uvcioc_ctrl_query() -> libc::c_ulong {
    let size = std::mem::size_of::<UvcXuControlQuery>() as libc::c_ulong;
    (3 << 30) | (size << 16) | ((b'u' as libc::c_ulong) << 8) | 0x21
}

/// UVC request codes
const UVC_SET_CUR: u8 = 0x01;
const UVC_GET_CUR: u8 = 0x81;

// ===== ioctl Structures =====

#[repr(C)]
struct V4l2Control {
    id: u32,
    value: i32,
}

#[repr(C)]
struct V4l2Queryctrl {
    id: u32,
    ctrl_type: u32,
    name: [u8; 32],
    minimum: i32,
    maximum: i32,
    step: i32,
    default_value: i32,
    flags: u32,
    reserved: [u32; 2],
}

#[repr(C)]
#[repr(packed)]
struct V4l2Querymenu {
    id: u32,
    index: u32,
    name: [u8; 32],
    reserved: u32,
}

#[repr(C)]
struct UvcXuControlQuery {
    unit: u8,
    selector: u8,
    query: u8,
    size: u16,
    data: *mut u8,
}

// ===== Public Types =====

/// Information about a V4L2 control
#[derive(Debug, Clone, PartialEq)]
pub struct ControlInfo {
    pub id: u32,
    pub name: String,
    pub ctrl_type: ControlType,
    pub minimum: i32,
    pub maximum: i32,
    pub step: i32,
    pub default_value: i32,
    pub flags: u32,
}

/// V4L2 control type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlType {
    Integer,
    Boolean,
    Menu,
    Button,
    Integer64,
    CtrlClass,
    IntegerMenu,
    Unknown(u32),
}

impl From<u32> for ControlType {
    fn from(value: u32) -> Self {
        match value {
            V4L2_CTRL_TYPE_INTEGER => ControlType::Integer,
            V4L2_CTRL_TYPE_BOOLEAN => ControlType::Boolean,
            V4L2_CTRL_TYPE_MENU => ControlType::Menu,
            V4L2_CTRL_TYPE_BUTTON => ControlType::Button,
            V4L2_CTRL_TYPE_INTEGER64 => ControlType::Integer64,
            V4L2_CTRL_TYPE_CTRL_CLASS => ControlType::CtrlClass,
            V4L2_CTRL_TYPE_INTEGER_MENU => ControlType::IntegerMenu,
            other => ControlType::Unknown(other),
        }
    }
}

impl ControlInfo {
    /// Check if control is disabled
    pub fn is_disabled(&self) -> bool {
        self.flags & V4L2_CTRL_FLAG_DISABLED != 0
    }
}

/// Menu item for menu-type controls
#[derive(Debug, Clone, PartialEq)]
pub struct MenuItem {
    pub index: i32,
    pub name: String,
}

fn extract_name(bytes: &[u8; 32]) -> String {
    let name_len = bytes.iter().position(|&c| c == 0).unwrap_or(32);
    String::from_utf8_lossy(&bytes[..name_len]).to_string()
}

fn queryctrl(file: &File, id: u32) -> Option<ControlInfo> {
    let mut qctrl = V4l2Queryctrl {
        id,
        ctrl_type: 0,
        name: [0; 32],
        minimum: 0,
        maximum: 0,
        step: 0,
        default_value: 0,
        flags: 0,
        reserved: [0; 2],
    };

    let result = unsafe {
        libc::ioctl(
            file.as_raw_fd(),
            VIDIOC_QUERYCTRL as _,
            &mut qctrl as *mut V4l2Queryctrl,
        )
    };
    if result < 0 {
        return None;
    }

    Some(ControlInfo {
        id: qctrl.id,
        name: extract_name(&qctrl.name),
        ctrl_type: qctrl.ctrl_type.into(),
        minimum: qctrl.minimum,
        maximum: qctrl.maximum,
        step: qctrl.step,
        default_value: qctrl.default_value,
        flags: qctrl.flags,
    })
}

// ===== Public Functions =====

/// Enumerate every user-visible control of a node
///
/// Walks the driver's control list with `V4L2_CTRL_FLAG_NEXT_CTRL`, skipping
/// class headers and disabled controls.
pub fn enumerate_controls(device_path: &str) -> Vec<ControlInfo> {
    let file = match File::open(device_path) {
        Ok(f) => f,
        Err(e) => {
            debug!(device_path, error = %e, "Cannot open node to enumerate controls");
            return Vec::new();
        }
    };

    let mut controls = Vec::new();
    let mut next_id = V4L2_CTRL_FLAG_NEXT_CTRL;
    while let Some(info) = queryctrl(&file, next_id) {
        next_id = info.id | V4L2_CTRL_FLAG_NEXT_CTRL;
        if info.ctrl_type == ControlType::CtrlClass || info.is_disabled() {
            continue;
        }
        controls.push(info);
    }

    debug!(device_path, count = controls.len(), "Enumerated V4L2 controls");
    controls
}

/// Get current value of a control
pub fn get_control(device_path: &str, control_id: u32) -> Option<i32> {
    let file = File::open(device_path).ok()?;

    let mut ctrl = V4l2Control {
        id: control_id,
        value: 0,
    };

    let result = unsafe {
        libc::ioctl(
            file.as_raw_fd(),
            VIDIOC_G_CTRL as _,
            &mut ctrl as *mut V4l2Control,
        )
    };

    if result < 0 {
        debug!(device_path, control_id, "Failed to get V4L2 control");
        return None;
    }

    Some(ctrl.value)
}

/// Set value of a control
pub fn set_control(device_path: &str, control_id: u32, value: i32) -> Result<(), String> {
    let file = File::open(device_path).map_err(|e| format!("Failed to open device: {}", e))?;

    let mut ctrl = V4l2Control {
        id: control_id,
        value,
    };

    let result = unsafe {
        libc::ioctl(
            file.as_raw_fd(),
            VIDIOC_S_CTRL as _,
            &mut ctrl as *mut V4l2Control,
        )
    };

    if result < 0 {
        let errno = std::io::Error::last_os_error();
        warn!(
            device_path,
            control_id,
            value,
            ?errno,
            "Failed to set V4L2 control"
        );
        return Err(format!("Failed to set control: {}", errno));
    }

    if ctrl.value != value {
        debug!(
            device_path,
            control_id,
            requested = value,
            actual = ctrl.value,
            "V4L2 control value was clamped"
        );
    }

    Ok(())
}

/// Query all menu items for a menu-type control
pub fn query_menu_items(device_path: &str, control_id: u32, max_index: i32) -> Vec<MenuItem> {
    let file = match File::open(device_path) {
        Ok(f) => f,
        Err(_) => return Vec::new(),
    };

    let mut items = Vec::new();

    for index in 0..=max_index.max(0) {
        let mut qmenu = V4l2Querymenu {
            id: control_id,
            index: index as u32,
            name: [0; 32],
            reserved: 0,
        };

        let result = unsafe {
            libc::ioctl(
                file.as_raw_fd(),
                VIDIOC_QUERYMENU as _,
                &mut qmenu as *mut V4l2Querymenu,
            )
        };

        if result >= 0 {
            let name = qmenu.name;
            items.push(MenuItem {
                index,
                name: extract_name(&name),
            });
        }
    }

    items
}

fn xu_query(
    device_path: &str,
    unit: u8,
    selector: u8,
    query: u8,
    data: &mut [u8],
) -> std::io::Result<()> {
    let file = OpenOptions::new().read(true).write(true).open(device_path)?;

    let mut request = UvcXuControlQuery {
        unit,
        selector,
        query,
        size: data.len() as u16,
        data: data.as_mut_ptr(),
    };

    let result = unsafe {
        libc::ioctl(
            file.as_raw_fd(),
            uvcioc_ctrl_query() as _,
            &mut request as *mut UvcXuControlQuery,
        )
    };

    if result < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Write an extension-unit control (UVC SET_CUR)
pub fn xu_set(device_path: &str, unit: u8, selector: u8, data: &mut [u8]) -> std::io::Result<()> {
    xu_query(device_path, unit, selector, UVC_SET_CUR, data)
}

/// Read an extension-unit control (UVC GET_CUR) into `data`
pub fn xu_get(device_path: &str, unit: u8, selector: u8, data: &mut [u8]) -> std::io::Result<()> {
    xu_query(device_path, unit, selector, UVC_GET_CUR, data)
}
