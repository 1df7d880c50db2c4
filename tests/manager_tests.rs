// SPDX-License-Identifier: GPL-3.0-only

//! Integration tests for device reconciliation and leader/follower linking

use camrig::backends::camera::{DeviceDescriptor, DeviceEnumerator};
use camrig::devices::{DeviceManager, StreamUpdate};
use camrig::errors::AppError;
use camrig::events::{DeviceEvent, EventSender};
use camrig::pipelines::stream::{EncodeType, EngineOptions, Interval, StreamKind};
use camrig::settings::SettingsManager;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

const LEADER_PID: u16 = 0x6367;
const FOLLOWER_PID: u16 = 0x6368;
const STANDALONE_PID: u16 = 0x6366;

/// Enumerator whose device list is set by the test
#[derive(Clone, Default)]
struct FakeEnumerator {
    attached: Arc<Mutex<Vec<DeviceDescriptor>>>,
}

impl FakeEnumerator {
    fn set(&self, devices: Vec<DeviceDescriptor>) {
        *self.attached.lock().unwrap() = devices;
    }
}

impl DeviceEnumerator for FakeEnumerator {
    fn list_devices(&self) -> Vec<DeviceDescriptor> {
        self.attached.lock().unwrap().clone()
    }
}

fn descriptor(bus: &str, pid: u16) -> DeviceDescriptor {
    DeviceDescriptor {
        bus_info: bus.to_string(),
        vid: 0x0c45,
        pid,
        card: "test camera".to_string(),
        device_paths: vec![format!("/nonexistent/{}/video0", bus)],
    }
}

fn options() -> Arc<EngineOptions> {
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

fn manager(dir: &Path, enumerator: &FakeEnumerator) -> (DeviceManager, UnboundedReceiver<DeviceEvent>) {
    let settings = SettingsManager::open_with_interval(dir, Duration::from_secs(3600)).unwrap();
    let (events, rx) = EventSender::channel();
    let manager = DeviceManager::new(Box::new(enumerator.clone()), settings, events, options());
    (manager, rx)
}

fn drain(rx: &mut UnboundedReceiver<DeviceEvent>) -> Vec<DeviceEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn is_managed(manager: &DeviceManager, bus: &str) -> bool {
    manager.device(bus).unwrap().is_managed
}

fn udp_update(enabled: bool) -> StreamUpdate {
    StreamUpdate {
        encode_type: EncodeType::Mjpg,
        kind: StreamKind::Udp,
        endpoints: Vec::new(),
        width: 1280,
        height: 720,
        interval: Interval::default(),
        enabled,
    }
}

#[test]
fn test_reconcile_diff() {
    let dir = tempfile::tempdir().unwrap();
    let enumerator = FakeEnumerator::default();
    let (mut manager, mut rx) = manager(dir.path(), &enumerator);

    let a = vec![descriptor("usb-1", STANDALONE_PID), descriptor("usb-2", LEADER_PID)];
    let outcome = manager.reconcile(a.clone());
    assert_eq!(outcome.added, a);
    assert!(outcome.removed.is_empty());
    assert_eq!(manager.devices().len(), 2);

    let outcome = manager.reconcile(a.clone());
    assert!(outcome.added.is_empty());
    assert!(outcome.removed.is_empty());

    let b = vec![descriptor("usb-2", LEADER_PID), descriptor("usb-3", FOLLOWER_PID)];
    let outcome = manager.reconcile(b);
    assert_eq!(outcome.added, vec![descriptor("usb-3", FOLLOWER_PID)]);
    assert_eq!(outcome.removed, vec![descriptor("usb-1", STANDALONE_PID)]);

    let names: Vec<&str> = drain(&mut rx).iter().map(DeviceEvent::name).collect();
    assert_eq!(
        names,
        vec!["device_added", "device_added", "device_removed", "device_added"]
    );
}

#[test]
fn test_node_list_change_keeps_device() {
    let dir = tempfile::tempdir().unwrap();
    let enumerator = FakeEnumerator::default();
    let (mut manager, mut rx) = manager(dir.path(), &enumerator);

    manager.reconcile(vec![descriptor("usb-1", STANDALONE_PID)]);
    manager.set_nickname("usb-1", "bow").unwrap();

    // udev publishes the second node one cycle later
    let mut grown = descriptor("usb-1", STANDALONE_PID);
    grown.device_paths.push("/nonexistent/usb-1/video1".to_string());
    let outcome = manager.reconcile(vec![grown.clone()]);
    assert_eq!(outcome.added, vec![grown.clone()]);
    assert_eq!(outcome.removed, vec![descriptor("usb-1", STANDALONE_PID)]);

    let outcome = manager.reconcile(vec![grown]);
    assert!(outcome.added.is_empty());
    assert!(outcome.removed.is_empty());

    let record = manager.device("usb-1").unwrap();
    assert_eq!(record.nodes.len(), 2);
    assert_eq!(record.nickname, "bow");

    let names: Vec<&str> = drain(&mut rx).iter().map(DeviceEvent::name).collect();
    assert_eq!(names, vec!["device_added", "device_removed", "device_added"]);
}

#[test]
fn test_unsupported_cameras_are_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let enumerator = FakeEnumerator::default();
    let (mut manager, mut rx) = manager(dir.path(), &enumerator);

    let mut webcam = descriptor("usb-9", 0x0001);
    webcam.vid = 0x046d;
    enumerator.set(vec![webcam]);

    let outcome = manager.poll();
    assert_eq!(outcome.added.len(), 1);
    assert!(manager.devices().is_empty());
    assert!(drain(&mut rx).is_empty());
}

#[test]
fn test_add_follower_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let enumerator = FakeEnumerator::default();
    let (mut manager, _rx) = manager(dir.path(), &enumerator);
    manager.reconcile(vec![descriptor("usb-1", LEADER_PID), descriptor("usb-2", FOLLOWER_PID)]);

    assert_eq!(manager.add_follower("usb-1", "usb-2"), Ok(true));
    assert!(is_managed(&manager, "usb-2"));

    assert_eq!(manager.add_follower("usb-1", "usb-2"), Ok(true));
    assert_eq!(manager.device("usb-1").unwrap().followers, vec!["usb-2".to_string()]);
    assert!(is_managed(&manager, "usb-2"));
}

#[test]
fn test_add_follower_rejects_wrong_types() {
    let dir = tempfile::tempdir().unwrap();
    let enumerator = FakeEnumerator::default();
    let (mut manager, _rx) = manager(dir.path(), &enumerator);
    manager.reconcile(vec![
        descriptor("usb-1", LEADER_PID),
        descriptor("usb-2", FOLLOWER_PID),
        descriptor("usb-3", STANDALONE_PID),
    ]);

    assert_eq!(manager.add_follower("usb-2", "usb-1"), Ok(false));
    assert_eq!(manager.add_follower("usb-1", "usb-3"), Ok(false));
    assert_eq!(manager.add_follower("usb-1", "usb-1"), Ok(false));
    assert_eq!(
        manager.add_follower("usb-1", "usb-7"),
        Err(AppError::DeviceNotFound("usb-7".to_string()))
    );
    assert!(manager.device("usb-1").unwrap().followers.is_empty());
}

#[test]
fn test_follower_moves_between_leaders() {
    let dir = tempfile::tempdir().unwrap();
    let enumerator = FakeEnumerator::default();
    let (mut manager, _rx) = manager(dir.path(), &enumerator);
    manager.reconcile(vec![
        descriptor("usb-1", LEADER_PID),
        descriptor("usb-2", FOLLOWER_PID),
        descriptor("usb-4", LEADER_PID),
    ]);

    manager.add_follower("usb-1", "usb-2").unwrap();
    manager.add_follower("usb-4", "usb-2").unwrap();

    assert!(manager.device("usb-1").unwrap().followers.is_empty());
    assert_eq!(manager.device("usb-4").unwrap().followers, vec!["usb-2".to_string()]);
    assert!(is_managed(&manager, "usb-2"));
}

#[test]
fn test_remove_disconnected_follower_trims_list() {
    let dir = tempfile::tempdir().unwrap();
    let enumerator = FakeEnumerator::default();
    let (mut manager, _rx) = manager(dir.path(), &enumerator);
    manager.reconcile(vec![descriptor("usb-1", LEADER_PID), descriptor("usb-2", FOLLOWER_PID)]);
    manager.add_follower("usb-1", "usb-2").unwrap();

    manager.reconcile(vec![descriptor("usb-1", LEADER_PID)]);
    assert_eq!(manager.device("usb-1").unwrap().followers, vec!["usb-2".to_string()]);

    assert_eq!(manager.remove_follower("usb-1", "usb-2"), Ok(true));
    assert!(manager.device("usb-1").unwrap().followers.is_empty());
    assert!(manager.settings().saved("usb-1").unwrap().followers.is_empty());
}

#[test]
fn test_remove_connected_follower() {
    let dir = tempfile::tempdir().unwrap();
    let enumerator = FakeEnumerator::default();
    let (mut manager, _rx) = manager(dir.path(), &enumerator);
    manager.reconcile(vec![descriptor("usb-1", LEADER_PID), descriptor("usb-2", FOLLOWER_PID)]);
    manager.add_follower("usb-1", "usb-2").unwrap();

    assert_eq!(manager.remove_follower("usb-1", "usb-2"), Ok(true));
    assert!(!is_managed(&manager, "usb-2"));
    assert_eq!(manager.remove_follower("usb-1", "usb-2"), Ok(false));
}

#[test]
fn test_leader_unplug_detaches_followers() {
    let dir = tempfile::tempdir().unwrap();
    let enumerator = FakeEnumerator::default();
    let (mut manager, _rx) = manager(dir.path(), &enumerator);
    manager.reconcile(vec![descriptor("usb-1", LEADER_PID), descriptor("usb-2", FOLLOWER_PID)]);
    manager.add_follower("usb-1", "usb-2").unwrap();

    manager.reconcile(vec![descriptor("usb-2", FOLLOWER_PID)]);
    assert!(manager.device("usb-1").is_err());
    assert!(!is_managed(&manager, "usb-2"));
}

#[test]
fn test_replugged_follower_is_relinked() {
    let dir = tempfile::tempdir().unwrap();
    let enumerator = FakeEnumerator::default();
    let (mut manager, _rx) = manager(dir.path(), &enumerator);
    manager.reconcile(vec![descriptor("usb-1", LEADER_PID), descriptor("usb-2", FOLLOWER_PID)]);
    manager.add_follower("usb-1", "usb-2").unwrap();

    manager.reconcile(vec![descriptor("usb-1", LEADER_PID)]);
    manager.reconcile(vec![descriptor("usb-1", LEADER_PID), descriptor("usb-2", FOLLOWER_PID)]);
    assert!(is_managed(&manager, "usb-2"));
}

#[test]
fn test_links_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let enumerator = FakeEnumerator::default();
    {
        let (mut manager, _rx) = manager(dir.path(), &enumerator);
        manager.reconcile(vec![descriptor("usb-1", LEADER_PID), descriptor("usb-2", FOLLOWER_PID)]);
        manager.add_follower("usb-1", "usb-2").unwrap();
        manager.set_nickname("usb-1", "port camera").unwrap();
    }

    let (mut manager, _rx) = manager(dir.path(), &enumerator);
    // Follower first: it must still find its Leader once both are connected
    manager.reconcile(vec![descriptor("usb-2", FOLLOWER_PID), descriptor("usb-1", LEADER_PID)]);
    assert!(is_managed(&manager, "usb-2"));
    assert_eq!(manager.device("usb-1").unwrap().nickname, "port camera");
}

#[test]
fn test_changed_device_type_discards_settings() {
    let dir = tempfile::tempdir().unwrap();
    let enumerator = FakeEnumerator::default();
    {
        let (mut manager, _rx) = manager(dir.path(), &enumerator);
        manager.reconcile(vec![descriptor("usb-1", LEADER_PID)]);
        manager.set_nickname("usb-1", "old").unwrap();
    }

    let (mut manager, _rx) = manager(dir.path(), &enumerator);
    manager.reconcile(vec![descriptor("usb-1", STANDALONE_PID)]);
    assert_eq!(manager.device("usb-1").unwrap().nickname, "");
    assert!(manager.settings().saved("usb-1").is_none());
}

#[test]
fn test_engine_errors_become_hardware_errors() {
    let dir = tempfile::tempdir().unwrap();
    let enumerator = FakeEnumerator::default();
    let (mut manager, mut rx) = manager(dir.path(), &enumerator);
    enumerator.set(vec![descriptor("usb-1", STANDALONE_PID)]);
    manager.poll();
    drain(&mut rx);

    manager
        .pending_errors()
        .push("usb-1", "Process exited with code 7.".to_string());
    manager.pending_errors().push("usb-5", "gone".to_string());
    manager.poll();

    let events = drain(&mut rx);
    assert_eq!(
        events,
        vec![DeviceEvent::HardwareError {
            bus_info: "usb-1".to_string(),
            errors: vec!["Process exited with code 7.".to_string()],
        }]
    );
    assert!(!manager.device("usb-1").unwrap().stream.enabled);
}

#[test]
fn test_configure_stream_starts_and_stops() {
    let dir = tempfile::tempdir().unwrap();
    let enumerator = FakeEnumerator::default();
    let (mut manager, _rx) = manager(dir.path(), &enumerator);
    manager.reconcile(vec![descriptor("usb-1", STANDALONE_PID)]);

    manager.configure_stream("usb-1", &udp_update(true)).unwrap();
    let record = manager.device("usb-1").unwrap();
    assert!(record.streaming);
    assert_eq!(record.stream.width, 1280);

    manager.configure_stream("usb-1", &udp_update(false)).unwrap();
    assert!(!manager.device("usb-1").unwrap().streaming);
    assert!(!manager.settings().saved("usb-1").unwrap().stream.enabled);
}

#[test]
fn test_synchronized_start_failure_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let enumerator = FakeEnumerator::default();
    let (mut manager, mut rx) = manager(dir.path(), &enumerator);
    manager.reconcile(vec![descriptor("usb-1", LEADER_PID), descriptor("usb-2", FOLLOWER_PID)]);
    manager.add_follower("usb-1", "usb-2").unwrap();
    drain(&mut rx);

    let result = manager.configure_stream("usb-1", &udp_update(true));
    assert!(matches!(result, Err(AppError::CaptureOpen { .. })));
    assert!(!manager.device("usb-1").unwrap().streaming);
    assert!(
        drain(&mut rx)
            .iter()
            .any(|e| matches!(e, DeviceEvent::StreamError { bus_info, .. } if bus_info == "usb-1"))
    );
}

#[test]
fn test_follower_unplug_restarts_leader_alone() {
    let dir = tempfile::tempdir().unwrap();
    let enumerator = FakeEnumerator::default();
    let (mut manager, mut rx) = manager(dir.path(), &enumerator);
    manager.reconcile(vec![descriptor("usb-1", LEADER_PID), descriptor("usb-2", FOLLOWER_PID)]);
    manager.add_follower("usb-1", "usb-2").unwrap();

    // The set's nodes do not exist, so the synchronized start fails
    assert!(matches!(
        manager.configure_stream("usb-1", &udp_update(true)),
        Err(AppError::CaptureOpen { .. })
    ));
    assert!(!manager.device("usb-1").unwrap().streaming);
    drain(&mut rx);

    manager.reconcile(vec![descriptor("usb-1", LEADER_PID)]);

    // Alone again, the leader streams through the single-stream engine
    let record = manager.device("usb-1").unwrap();
    assert!(record.streaming);
    assert!(record.stream.enabled);
    assert!(manager.device("usb-2").is_err());
    assert!(
        !drain(&mut rx)
            .iter()
            .any(|e| matches!(e, DeviceEvent::StreamError { .. }))
    );
}

#[test]
fn test_options_by_name() {
    let dir = tempfile::tempdir().unwrap();
    let enumerator = FakeEnumerator::default();
    let (mut manager, _rx) = manager(dir.path(), &enumerator);
    manager.reconcile(vec![descriptor("usb-1", STANDALONE_PID)]);

    manager.set_option("usb-1", "bitrate", 2.0).unwrap();
    assert!(matches!(
        manager.set_option("usb-1", "warp", 1.0),
        Err(AppError::InvalidArgument(_))
    ));
    assert!(matches!(
        manager.set_option("usb-1", "shutter", 100.0),
        Err(AppError::InvalidArgument(_))
    ));
    assert_eq!(
        manager.set_option("usb-8", "bitrate", 1.0),
        Err(AppError::DeviceNotFound("usb-8".to_string()))
    );

    assert_eq!(manager.get_option("usb-1", "bitrate"), Ok(2.0));
    assert!(matches!(
        manager.get_option("usb-1", "iso"),
        Err(AppError::InvalidArgument(_))
    ));
}

#[test]
fn test_register_options_without_extension_unit_keep_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let enumerator = FakeEnumerator::default();
    let (mut manager, _rx) = manager(dir.path(), &enumerator);
    manager.reconcile(vec![descriptor("usb-1", LEADER_PID)]);

    // Reads go through the register queue and fail on the missing node
    assert_eq!(manager.get_option("usb-1", "shutter"), Ok(100.0));
    assert_eq!(manager.get_option("usb-1", "ae"), Ok(0.0));
}
