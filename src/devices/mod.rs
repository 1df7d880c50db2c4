// SPDX-License-Identifier: GPL-3.0-only

//! Connected cameras
//!
//! A [`Device`] is created for every enumerated camera whose vendor/product id
//! is in the model table. It owns the camera's stream configuration, its
//! control list, the runner for its stream engine and, for register-capable
//! models, the queued register controller.
//!
//! Leader/follower links are plain bus identifiers. A Leader keeps the list of
//! followers it was asked to drive, which may name devices that are not
//! connected. A Follower records which Leader currently manages it, so
//! `is_managed` holds exactly while that Leader lists it.

pub mod asic;
pub mod command_queue;
pub mod controls;
pub mod manager;
pub mod models;

pub use asic::AsicController;
pub use command_queue::HardwareCommandQueue;
pub use controls::{Control, DeviceOption};
pub use manager::DeviceManager;
pub use models::{DeviceType, SupportedModel};

use crate::backends::camera::DeviceDescriptor;
use crate::backends::camera::v4l2_controls;
use crate::backends::camera::v4l2_utils::list_pixel_formats;
use crate::errors::{AppError, AppResult};
use crate::events::PendingErrors;
use crate::pipelines::stream::{
    EncodeType, EngineKind, EngineOptions, Interval, StreamConfig, StreamEndpoint, StreamKind,
    StreamRunner,
};
use crate::settings::{SavedControl, SavedDevice, SavedStream};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Relationship state of a device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceRole {
    Standalone,
    Leader {
        /// Followers to drive; entries may refer to unplugged devices
        followers: Vec<String>,
    },
    Follower {
        /// Bus identifier of the managing Leader
        leader: Option<String>,
    },
}

impl DeviceRole {
    fn for_type(device_type: DeviceType) -> Self {
        match device_type {
            DeviceType::Standalone => DeviceRole::Standalone,
            DeviceType::Leader => DeviceRole::Leader {
                followers: Vec::new(),
            },
            DeviceType::Follower => DeviceRole::Follower { leader: None },
        }
    }
}

/// Pixel formats offered by one video node
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeFormats {
    pub path: String,
    pub formats: Vec<String>,
}

/// Stream settings accepted from clients
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StreamUpdate {
    #[serde(default)]
    pub encode_type: EncodeType,
    #[serde(rename = "stream_type", default)]
    pub kind: StreamKind,
    #[serde(default)]
    pub endpoints: Vec<StreamEndpoint>,
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub interval: Interval,
    pub enabled: bool,
}

/// Serializable snapshot of a device
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceRecord {
    pub bus_info: String,
    pub vid: u16,
    pub pid: u16,
    pub model: String,
    pub nickname: String,
    pub device_type: DeviceType,
    pub nodes: Vec<NodeFormats>,
    pub stream: StreamConfig,
    pub streaming: bool,
    pub controls: Vec<Control>,
    pub followers: Vec<String>,
    pub is_managed: bool,
}

pub struct Device {
    descriptor: DeviceDescriptor,
    model: &'static SupportedModel,
    nickname: String,
    role: DeviceRole,
    stream: StreamConfig,
    controls: Vec<Control>,
    nodes: Vec<NodeFormats>,
    runner: StreamRunner,
    hardware: Option<AsicController>,
}

impl Device {
    /// Probe the camera behind `descriptor`
    ///
    /// Engine crashes are pushed onto `errors` under this device's bus id.
    pub fn new(
        descriptor: DeviceDescriptor,
        model: &'static SupportedModel,
        options: Arc<EngineOptions>,
        errors: PendingErrors,
    ) -> Self {
        let nodes: Vec<NodeFormats> = descriptor
            .device_paths
            .iter()
            .map(|path| NodeFormats {
                path: path.clone(),
                formats: list_pixel_formats(path),
            })
            .collect();

        let primary = descriptor.primary_path().unwrap_or_default().to_string();
        let mut control_list = controls::load_v4l2_controls(&primary);
        control_list.extend(controls::option_controls(model.register_control));

        let hardware = model
            .register_control
            .then(|| AsicController::for_node(&primary));

        let bus_info = descriptor.bus_info.clone();
        let runner = StreamRunner::new(
            options,
            Arc::new(move |message: String| errors.push(&bus_info, message)),
        );

        let mut device = Self {
            descriptor,
            model,
            nickname: String::new(),
            role: DeviceRole::for_type(model.device_type),
            stream: StreamConfig::default(),
            controls: control_list,
            nodes,
            runner,
            hardware,
        };
        device.stream.device_path = device.node_for(EncodeType::Mjpg);
        device.refresh_register_options();

        debug!(
            bus_info = %device.descriptor.bus_info,
            model = model.name,
            nodes = device.nodes.len(),
            controls = device.controls.len(),
            "Created device"
        );
        device
    }

    pub fn bus_info(&self) -> &str {
        &self.descriptor.bus_info
    }

    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    pub fn model(&self) -> &'static SupportedModel {
        self.model
    }

    pub fn device_type(&self) -> DeviceType {
        self.model.device_type
    }

    pub fn nickname(&self) -> &str {
        &self.nickname
    }

    pub fn set_nickname(&mut self, nickname: &str) {
        info!(bus_info = %self.descriptor.bus_info, nickname, "Setting nickname");
        self.nickname = nickname.to_string();
    }

    pub fn stream(&self) -> &StreamConfig {
        &self.stream
    }

    pub fn controls(&self) -> &[Control] {
        &self.controls
    }

    pub fn is_streaming(&self) -> bool {
        self.runner.is_started()
    }

    // ===== Relationship state =====

    /// Stored follower list (Leaders only)
    pub fn followers(&self) -> &[String] {
        match &self.role {
            DeviceRole::Leader { followers } => followers,
            _ => &[],
        }
    }

    /// Managing Leader (Followers only)
    pub fn leader(&self) -> Option<&str> {
        match &self.role {
            DeviceRole::Follower { leader } => leader.as_deref(),
            _ => None,
        }
    }

    pub fn is_managed(&self) -> bool {
        self.leader().is_some()
    }

    pub(crate) fn set_leader(&mut self, leader: Option<&str>) {
        if let DeviceRole::Follower { leader: current } = &mut self.role {
            *current = leader.map(str::to_string);
        }
    }

    /// Append `follower` unless already listed
    pub(crate) fn list_follower(&mut self, follower: &str) {
        if let DeviceRole::Leader { followers } = &mut self.role
            && !followers.iter().any(|f| f == follower)
        {
            followers.push(follower.to_string());
        }
    }

    /// Remove `follower` from the list, returning whether it was listed
    pub(crate) fn unlist_follower(&mut self, follower: &str) -> bool {
        match &mut self.role {
            DeviceRole::Leader { followers } => {
                let before = followers.len();
                followers.retain(|f| f != follower);
                followers.len() != before
            }
            _ => false,
        }
    }

    // ===== Streams =====

    /// Node providing the pixel format `encode_type` needs
    ///
    /// Falls back to the primary node when no node advertises it (formats are
    /// unknown for nodes that could not be opened).
    pub fn node_for(&self, encode_type: EncodeType) -> String {
        let fourcc = encode_type.source_fourcc();
        self.nodes
            .iter()
            .find(|node| node.formats.iter().any(|f| f == fourcc))
            .map(|node| node.path.clone())
            .or_else(|| self.descriptor.primary_path().map(str::to_string))
            .unwrap_or_default()
    }

    pub fn configure_stream(&mut self, update: &StreamUpdate) {
        self.stream.encode_type = update.encode_type;
        self.stream.kind = update.kind;
        self.stream.endpoints = update.endpoints.clone();
        self.stream.width = update.width;
        self.stream.height = update.height;
        self.stream.interval = update.interval;
        self.stream.enabled = update.enabled;
        self.stream.device_path = self.node_for(update.encode_type);
    }

    pub(crate) fn disable_stream(&mut self) {
        self.stream.enabled = false;
    }

    /// This device's part of a Leader's composed stream set
    ///
    /// Format, rate and destination follow the Leader; the node is picked from
    /// this device's own nodes.
    pub fn composed_stream(&self, leader: &StreamConfig) -> StreamConfig {
        StreamConfig {
            device_path: self.node_for(leader.encode_type),
            encode_type: leader.encode_type,
            kind: leader.kind,
            endpoints: Vec::new(),
            width: leader.width,
            height: leader.height,
            interval: leader.interval,
            enabled: true,
            software_h264_bitrate: leader.software_h264_bitrate,
        }
    }

    /// Start this device's stream, with `follower_streams` appended
    ///
    /// A managed Follower is driven by its Leader and never starts on its own;
    /// `Ok(None)` is returned in that case.
    pub fn start_stream(&mut self, follower_streams: Vec<StreamConfig>) -> AppResult<Option<EngineKind>> {
        if self.is_managed() {
            warn!(
                bus_info = %self.descriptor.bus_info,
                "Cannot start stream of a managed follower"
            );
            return Ok(None);
        }

        if let Some(bitrate) = self.option_value(DeviceOption::Bitrate) {
            // Mbit/s to kbit/s
            self.stream.software_h264_bitrate = (bitrate * 1000.0).round() as u32;
        }
        self.stream.device_path = self.node_for(self.stream.encode_type);

        let mut streams = Vec::with_capacity(1 + follower_streams.len());
        streams.push(self.stream.clone());
        streams.extend(follower_streams);

        self.runner.start(streams).map(Some)
    }

    /// Stop the stream engine, returning the kind that was running
    pub fn stop_stream(&mut self) -> Option<EngineKind> {
        let kind = self.runner.engine_kind();
        self.runner.stop();
        kind
    }

    // ===== Controls =====

    fn option_value(&self, option: DeviceOption) -> Option<f64> {
        self.controls
            .iter()
            .find(|c| c.control_id == option.control_id())
            .map(|c| c.value)
    }

    /// Current value of a device option
    ///
    /// Register options are read back from the camera first. A failed read
    /// keeps the last known value.
    pub fn read_option(&mut self, option: DeviceOption) -> AppResult<f64> {
        let Some(index) = self
            .controls
            .iter()
            .position(|c| c.control_id == option.control_id())
        else {
            return Err(AppError::InvalidArgument(format!(
                "{} does not support option {}",
                self.model.name,
                option.key()
            )));
        };

        if option.is_register_option()
            && let Some(value) = self.read_register(option)
        {
            self.controls[index].value = value;
        }
        Ok(self.controls[index].value)
    }

    /// Pull every register option's value from the camera
    pub fn refresh_register_options(&mut self) {
        if self.hardware.is_none() {
            return;
        }
        for option in DeviceOption::ALL.into_iter().filter(|o| o.is_register_option()) {
            let _ = self.read_option(option);
        }
    }

    fn read_register(&self, option: DeviceOption) -> Option<f64> {
        let hardware = self.hardware.as_ref()?;
        let value = match option {
            DeviceOption::Shutter => hardware.shutter().map(f64::from),
            DeviceOption::Iso => hardware.iso().map(f64::from),
            DeviceOption::StrobeWidth => hardware.strobe_width().map(f64::from),
            DeviceOption::AutoExposure => hardware.auto_exposure().map(|on| f64::from(u8::from(on))),
            DeviceOption::Bitrate => return None,
        };
        if value.is_none() {
            debug!(
                bus_info = %self.descriptor.bus_info,
                option = option.key(),
                "Register read failed, keeping last value"
            );
        }
        value
    }

    /// Set a device option; returns whether the running stream must restart
    pub fn set_option(&mut self, option: DeviceOption, value: f64) -> AppResult<bool> {
        let Some(control) = self
            .controls
            .iter_mut()
            .find(|c| c.control_id == option.control_id())
        else {
            return Err(AppError::InvalidArgument(format!(
                "{} does not support option {}",
                self.model.name,
                option.key()
            )));
        };

        let value = control.validate(value)?;
        control.value = value;
        debug!(bus_info = %self.descriptor.bus_info, option = option.key(), value, "Setting option");

        if option.is_register_option() {
            let Some(hardware) = &self.hardware else {
                return Err(AppError::HardwareCommand(format!(
                    "{} has no register access",
                    self.descriptor.bus_info
                )));
            };
            match option {
                DeviceOption::Shutter => hardware.set_shutter(value as u16),
                DeviceOption::Iso => hardware.set_iso(value as u16),
                DeviceOption::StrobeWidth => hardware.set_strobe_width(value as u16),
                DeviceOption::AutoExposure => hardware.set_auto_exposure(value != 0.0),
                DeviceOption::Bitrate => {}
            }
            return Ok(false);
        }

        Ok(self.stream.enabled && self.stream.encode_type == EncodeType::SoftwareH264)
    }

    /// Set a driver control or, for option ids, an option
    pub fn set_control(&mut self, control_id: u32, value: f64) -> AppResult<bool> {
        if let Some(option) = DeviceOption::from_control_id(control_id) {
            return self.set_option(option, value);
        }

        let path = self.descriptor.primary_path().unwrap_or_default().to_string();
        let Some(control) = self.controls.iter_mut().find(|c| c.control_id == control_id) else {
            return Err(AppError::InvalidArgument(format!(
                "Unknown control {:#010x}",
                control_id
            )));
        };

        let value = control.validate(value)?;
        v4l2_controls::set_control(&path, control_id, value.round() as i32)
            .map_err(AppError::HardwareCommand)?;
        control.value = value;
        Ok(false)
    }

    // ===== Persistence =====

    pub fn record(&self) -> DeviceRecord {
        DeviceRecord {
            bus_info: self.descriptor.bus_info.clone(),
            vid: self.descriptor.vid,
            pid: self.descriptor.pid,
            model: self.model.name.to_string(),
            nickname: self.nickname.clone(),
            device_type: self.device_type(),
            nodes: self.nodes.clone(),
            stream: self.stream.clone(),
            streaming: self.is_streaming(),
            controls: self.controls.clone(),
            followers: self.followers().to_vec(),
            is_managed: self.is_managed(),
        }
    }

    pub fn saved(&self) -> SavedDevice {
        SavedDevice {
            bus_info: self.descriptor.bus_info.clone(),
            vid: self.descriptor.vid,
            pid: self.descriptor.pid,
            nickname: self.nickname.clone(),
            stream: SavedStream {
                encode_type: self.stream.encode_type,
                stream_type: self.stream.kind,
                endpoints: self.stream.endpoints.clone(),
                width: self.stream.width,
                height: self.stream.height,
                interval: self.stream.interval,
                enabled: self.stream.enabled,
            },
            controls: self
                .controls
                .iter()
                .map(|c| SavedControl {
                    control_id: c.control_id,
                    name: c.name.clone(),
                    value: c.value,
                })
                .collect(),
            device_type: self.device_type(),
            followers: self.followers().to_vec(),
        }
    }

    /// Restore nickname, stream, controls and the stored follower list
    ///
    /// Controls that cannot be applied are logged and skipped. The stream is
    /// not started here.
    pub fn apply_saved(&mut self, saved: &SavedDevice) {
        self.nickname = saved.nickname.clone();
        self.configure_stream(&StreamUpdate {
            encode_type: saved.stream.encode_type,
            kind: saved.stream.stream_type,
            endpoints: saved.stream.endpoints.clone(),
            width: saved.stream.width,
            height: saved.stream.height,
            interval: saved.stream.interval,
            enabled: saved.stream.enabled,
        });

        for control in &saved.controls {
            if let Err(e) = self.set_control(control.control_id, control.value) {
                warn!(
                    bus_info = %self.descriptor.bus_info,
                    control = %control.name,
                    error = %e,
                    "Could not restore control"
                );
            }
        }

        if let DeviceRole::Leader { followers } = &mut self.role {
            followers.clone_from(&saved.followers);
            followers.retain(|f| *f != self.descriptor.bus_info);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::devices::asic::{Asic, AsicTransport};
    use crate::devices::models::lookup;
    use std::time::Duration;

    pub(crate) fn engine_options() -> Arc<EngineOptions> {
        Arc::new(EngineOptions {
            pipeline_program: "sh".to_string(),
            pipeline_args: vec!["-c".to_string(), "exec sleep 30".to_string(), "sh".to_string()],
            recordings_dir: std::env::temp_dir(),
            capture_buffers: 4,
            sync_queue_capacity: 8,
            grab_timeout: Duration::from_millis(10),
            mtu: 1400,
            restart_settle: Duration::ZERO,
        })
    }

    fn device(bus: &str, pid: u16) -> Device {
        let descriptor = DeviceDescriptor {
            bus_info: bus.to_string(),
            vid: 0x0c45,
            pid,
            card: "test".to_string(),
            device_paths: vec![format!("/nonexistent/{}/video0", bus)],
        };
        let model = lookup(0x0c45, pid).unwrap();
        Device::new(descriptor, model, engine_options(), PendingErrors::default())
    }

    #[test]
    fn test_unknown_nodes_fall_back_to_primary() {
        let device = device("usb-1", 0x6366);
        assert_eq!(device.node_for(EncodeType::H264), "/nonexistent/usb-1/video0");
        assert_eq!(device.stream().device_path, "/nonexistent/usb-1/video0");
    }

    #[test]
    fn test_standalone_options() {
        let mut device = device("usb-1", 0x6366);
        assert_eq!(device.set_option(DeviceOption::Bitrate, 2.5), Ok(false));
        assert!(matches!(
            device.set_option(DeviceOption::Shutter, 200.0),
            Err(AppError::InvalidArgument(_))
        ));
        assert!(matches!(
            device.set_option(DeviceOption::Bitrate, 50.0),
            Err(AppError::InvalidArgument(_))
        ));

        device.configure_stream(&StreamUpdate {
            encode_type: EncodeType::SoftwareH264,
            kind: StreamKind::Udp,
            endpoints: Vec::new(),
            width: 1280,
            height: 720,
            interval: Interval::default(),
            enabled: true,
        });
        assert_eq!(device.set_option(DeviceOption::Bitrate, 3.0), Ok(true));
    }

    /// Answers every register read with 0x01
    struct OnesTransport;

    impl AsicTransport for OnesTransport {
        fn set(&self, _payload: &mut [u8; 4]) -> Result<(), String> {
            Ok(())
        }

        fn get(&self, payload: &mut [u8; 4]) -> Result<(), String> {
            payload[2] = 0x01;
            Ok(())
        }
    }

    #[test]
    fn test_register_options_read_back_from_camera() {
        let mut leader = device("usb-1", 0x6367);
        leader.hardware = Some(AsicController::new(
            "usb-1",
            Asic::new(Arc::new(OnesTransport)),
        ));

        // Pair reads combine high and low bytes
        assert_eq!(leader.read_option(DeviceOption::Shutter), Ok(257.0));
        assert_eq!(leader.read_option(DeviceOption::StrobeWidth), Ok(257.0));
        assert_eq!(leader.read_option(DeviceOption::AutoExposure), Ok(1.0));
        assert_eq!(leader.option_value(DeviceOption::Shutter), Some(257.0));

        leader.set_option(DeviceOption::Bitrate, 4.0).unwrap();
        assert_eq!(leader.read_option(DeviceOption::Bitrate), Ok(4.0));
    }

    #[test]
    fn test_failed_register_read_keeps_last_value() {
        // No extension unit behind the node, so every read fails
        let mut leader = device("usb-1", 0x6367);
        let iso = DeviceOption::Iso.default_value();
        assert_eq!(leader.read_option(DeviceOption::Iso), Ok(iso));

        let mut standalone = device("usb-2", 0x6366);
        assert!(matches!(
            standalone.read_option(DeviceOption::Shutter),
            Err(AppError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_managed_follower_does_not_start() {
        let mut follower = device("usb-2", 0x6368);
        follower.set_leader(Some("usb-1"));
        assert!(follower.is_managed());
        assert_eq!(follower.start_stream(Vec::new()), Ok(None));
        assert!(!follower.is_streaming());
    }

    #[test]
    fn test_composed_stream_follows_leader() {
        let follower = device("usb-2", 0x6368);
        let leader = StreamConfig {
            device_path: "/dev/video0".to_string(),
            width: 1280,
            height: 800,
            endpoints: vec![StreamEndpoint {
                host: "192.168.2.1".to_string(),
                port: 5600,
            }],
            ..Default::default()
        };
        let stream = follower.composed_stream(&leader);
        assert_eq!(stream.device_path, "/nonexistent/usb-2/video0");
        assert_eq!((stream.width, stream.height), (1280, 800));
        assert!(stream.endpoints.is_empty());
    }

    #[test]
    fn test_follower_list_bookkeeping() {
        let mut leader = device("usb-1", 0x6367);
        leader.list_follower("usb-2");
        leader.list_follower("usb-2");
        assert_eq!(leader.followers(), &["usb-2".to_string()]);
        assert!(leader.unlist_follower("usb-2"));
        assert!(!leader.unlist_follower("usb-2"));

        let mut standalone = device("usb-3", 0x6366);
        standalone.list_follower("usb-2");
        assert!(standalone.followers().is_empty());
    }

    #[test]
    fn test_saved_round_trip() {
        let mut leader = device("usb-1", 0x6367);
        leader.set_nickname("port");
        leader.list_follower("usb-2");
        leader.set_option(DeviceOption::Bitrate, 8.0).unwrap();
        let saved = leader.saved();

        let mut restored = device("usb-1", 0x6367);
        restored.apply_saved(&saved);
        assert_eq!(restored.nickname(), "port");
        assert_eq!(restored.followers(), &["usb-2".to_string()]);
        assert_eq!(restored.option_value(DeviceOption::Bitrate), Some(8.0));

        let record = restored.record();
        assert_eq!(record.device_type, DeviceType::Leader);
        assert!(!record.is_managed);
    }
}
