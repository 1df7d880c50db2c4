// SPDX-License-Identifier: GPL-3.0-only

//! Register-level access to the camera ASIC and its image sensor
//!
//! The ASIC is reached through one UVC extension-unit selector carrying a
//! 4-byte little-endian payload `[addr: u16][data: u8][mode: u8]`. Sensor
//! registers sit behind the ASIC: their address, data, and direction are
//! written to ASIC registers and then triggered.
//!
//! All writes from the rest of the crate go through [`AsicController`], which
//! runs them on the device's [`HardwareCommandQueue`].

use super::command_queue::HardwareCommandQueue;
use crate::backends::camera::v4l2_controls::{xu_get, xu_set};
use crate::constants::SENSOR_PAIR_SETTLE;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, trace};

/// Extension unit exposing the ASIC register window
pub const XU_UNIT_SYS_ID: u8 = 0x02;
/// Selector of the ASIC read/write control
pub const XU_SELECTOR_ASIC_RW: u8 = 0x01;

const MODE_NORMAL: u8 = 0x00;
const MODE_DUMMY: u8 = 0xFF;
const SENSOR_MODE_WRITE: u8 = 0x57; // 'W'
const SENSOR_MODE_READ: u8 = 0x52; // 'R'
const SENSOR_TRIGGER: u8 = 0x55;

/// ASIC register addresses
pub mod register {
    pub const REG_AE: u16 = 0xF0A5;
    pub const REG_ADDR_H: u16 = 0xF0A0;
    pub const REG_ADDR_L: u16 = 0xF0A1;
    pub const REG_DATA: u16 = 0xF0A2;
    pub const REG_MODE: u16 = 0xF0A3;
    pub const REG_TRIG: u16 = 0xF0A4;
}

/// Sensor register addresses (high/low pairs)
pub mod sensor {
    pub const SHUTTER_HIGH: u16 = 0x3501;
    pub const SHUTTER_LOW: u16 = 0x3502;
    pub const ISO_HIGH: u16 = 0x3508;
    pub const ISO_LOW: u16 = 0x3509;
    pub const STROBE_WIDTH_HIGH: u16 = 0x3926;
    pub const STROBE_WIDTH_LOW: u16 = 0x3927;
}

/// Encode one ASIC register payload
pub fn encode_payload(addr: u16, data: u8, mode: u8) -> [u8; 4] {
    let addr = addr.to_le_bytes();
    [addr[0], addr[1], data, mode]
}

/// Raw access to the ASIC read/write control
pub trait AsicTransport: Send + Sync {
    fn set(&self, payload: &mut [u8; 4]) -> Result<(), String>;
    fn get(&self, payload: &mut [u8; 4]) -> Result<(), String>;
}

/// Transport over the UVC extension unit of a video node
#[derive(Debug, Clone)]
pub struct UvcTransport {
    device_path: String,
}

impl UvcTransport {
    pub fn new(device_path: &str) -> Self {
        Self {
            device_path: device_path.to_string(),
        }
    }
}

impl AsicTransport for UvcTransport {
    fn set(&self, payload: &mut [u8; 4]) -> Result<(), String> {
        xu_set(
            &self.device_path,
            XU_UNIT_SYS_ID,
            XU_SELECTOR_ASIC_RW,
            payload,
        )
        .map_err(|e| format!("{}: XU SET_CUR failed: {}", self.device_path, e))
    }

    fn get(&self, payload: &mut [u8; 4]) -> Result<(), String> {
        xu_get(
            &self.device_path,
            XU_UNIT_SYS_ID,
            XU_SELECTOR_ASIC_RW,
            payload,
        )
        .map_err(|e| format!("{}: XU GET_CUR failed: {}", self.device_path, e))
    }
}

/// Register operations on top of a transport
#[derive(Clone)]
pub struct Asic {
    transport: Arc<dyn AsicTransport>,
    pair_settle: Duration,
}

impl Asic {
    pub fn new(transport: Arc<dyn AsicTransport>) -> Self {
        Self {
            transport,
            pair_settle: SENSOR_PAIR_SETTLE,
        }
    }

    /// Override the pause between the two halves of a 16-bit sensor write
    pub fn with_pair_settle(mut self, settle: Duration) -> Self {
        self.pair_settle = settle;
        self
    }

    pub fn asic_write(&self, addr: u16, data: u8) -> Result<(), String> {
        trace!(addr, data, "ASIC write");
        let mut payload = encode_payload(addr, data, MODE_NORMAL);
        self.transport.set(&mut payload)
    }

    /// Select `addr` with a dummy write, then read its data byte
    pub fn asic_read(&self, addr: u16) -> Result<u8, String> {
        let mut select = encode_payload(addr, 0, MODE_DUMMY);
        self.transport.set(&mut select)?;

        let mut payload = encode_payload(addr, 0, MODE_NORMAL);
        self.transport.get(&mut payload)?;
        trace!(addr, data = payload[2], "ASIC read");
        Ok(payload[2])
    }

    fn select_sensor_register(&self, reg: u16) -> Result<(), String> {
        let [high, low] = reg.to_be_bytes();
        self.asic_write(register::REG_ADDR_H, high)?;
        self.asic_write(register::REG_ADDR_L, low)
    }

    pub fn sensor_write(&self, reg: u16, value: u8) -> Result<(), String> {
        self.select_sensor_register(reg)?;
        self.asic_write(register::REG_DATA, value)?;
        self.asic_write(register::REG_MODE, SENSOR_MODE_WRITE)?;
        self.asic_write(register::REG_TRIG, SENSOR_TRIGGER)
    }

    pub fn sensor_read(&self, reg: u16) -> Result<u8, String> {
        self.select_sensor_register(reg)?;
        self.asic_write(register::REG_MODE, SENSOR_MODE_READ)?;
        self.asic_write(register::REG_TRIG, SENSOR_TRIGGER)?;
        self.asic_read(register::REG_DATA)
    }

    /// Write a 16-bit value across a high/low sensor register pair
    pub fn sensor_write_pair(&self, reg_high: u16, reg_low: u16, value: u16) -> Result<(), String> {
        let [high, low] = value.to_be_bytes();
        self.sensor_write(reg_high, high)?;
        thread::sleep(self.pair_settle);
        self.sensor_write(reg_low, low)
    }

    pub fn sensor_read_pair(&self, reg_high: u16, reg_low: u16) -> Result<u16, String> {
        let high = self.sensor_read(reg_high)?;
        let low = self.sensor_read(reg_low)?;
        Ok(u16::from_be_bytes([high, low]))
    }
}

/// Queued high-level register controls of one device
pub struct AsicController {
    asic: Asic,
    queue: HardwareCommandQueue<u16>,
}

impl AsicController {
    pub fn new(name: &str, asic: Asic) -> Self {
        debug!(name, "Starting register controller");
        Self {
            asic,
            queue: HardwareCommandQueue::new(name),
        }
    }

    /// Controller for a video node's extension unit
    pub fn for_node(device_path: &str) -> Self {
        Self::new(device_path, Asic::new(Arc::new(UvcTransport::new(device_path))))
    }

    fn write_pair(&self, key: &str, reg_high: u16, reg_low: u16, value: u16) {
        let asic = self.asic.clone();
        self.queue.submit(
            Some(key),
            move || asic.sensor_write_pair(reg_high, reg_low, value).map(|_| value),
            false,
        );
    }

    fn read_pair(&self, reg_high: u16, reg_low: u16) -> Option<u16> {
        let asic = self.asic.clone();
        self.queue
            .submit(None, move || asic.sensor_read_pair(reg_high, reg_low), true)
    }

    pub fn set_shutter(&self, value: u16) {
        self.write_pair("shutter", sensor::SHUTTER_HIGH, sensor::SHUTTER_LOW, value);
    }

    pub fn shutter(&self) -> Option<u16> {
        self.read_pair(sensor::SHUTTER_HIGH, sensor::SHUTTER_LOW)
    }

    pub fn set_iso(&self, value: u16) {
        self.write_pair("iso", sensor::ISO_HIGH, sensor::ISO_LOW, value);
    }

    pub fn iso(&self) -> Option<u16> {
        self.read_pair(sensor::ISO_HIGH, sensor::ISO_LOW)
    }

    pub fn set_strobe_width(&self, value: u16) {
        self.write_pair(
            "strobe",
            sensor::STROBE_WIDTH_HIGH,
            sensor::STROBE_WIDTH_LOW,
            value,
        );
    }

    pub fn strobe_width(&self) -> Option<u16> {
        self.read_pair(sensor::STROBE_WIDTH_HIGH, sensor::STROBE_WIDTH_LOW)
    }

    pub fn set_auto_exposure(&self, enabled: bool) {
        let asic = self.asic.clone();
        let data = u8::from(enabled);
        self.queue.submit(
            Some("ae"),
            move || asic.asic_write(register::REG_AE, data).map(|_| u16::from(data)),
            false,
        );
    }

    pub fn auto_exposure(&self) -> Option<bool> {
        let asic = self.asic.clone();
        self.queue
            .submit(
                None,
                move || asic.asic_read(register::REG_AE).map(u16::from),
                true,
            )
            .map(|value| value == 0x01)
    }
}
