// SPDX-License-Identifier: GPL-3.0-only

//! Line-based JSON control channel
//!
//! While the daemon runs, each line on stdin is one request, for example
//! `{"request":"add_follower","leader":"usb-1","follower":"usb-2"}`. Every
//! request gets exactly one response line on stdout: `{"ok":true,...}` or
//! `{"ok":false,"error":"..."}`.

use crate::devices::{DeviceManager, StreamUpdate};
use crate::errors::AppResult;
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "request", rename_all = "snake_case")]
pub enum ControlRequest {
    ListDevices,
    AddFollower { leader: String, follower: String },
    RemoveFollower { leader: String, follower: String },
    SetNickname { bus_info: String, nickname: String },
    GetOption { bus_info: String, option: String },
    SetOption { bus_info: String, option: String, value: f64 },
    SetControl { bus_info: String, control_id: u32, value: f64 },
    ConfigureStream { bus_info: String, stream: StreamUpdate },
    RestartStream { bus_info: String },
}

fn respond(result: AppResult<Value>) -> Value {
    match result {
        Ok(Value::Object(mut fields)) => {
            fields.insert("ok".to_string(), Value::Bool(true));
            Value::Object(fields)
        }
        Ok(_) => json!({ "ok": true }),
        Err(e) => json!({ "ok": false, "error": e.to_string() }),
    }
}

fn relationship(result: AppResult<bool>) -> Value {
    match result {
        Ok(true) => json!({ "ok": true }),
        Ok(false) => json!({ "ok": false, "error": "Invalid leader/follower combination" }),
        Err(e) => json!({ "ok": false, "error": e.to_string() }),
    }
}

/// Execute one request against `manager`
pub fn handle(manager: &mut DeviceManager, request: ControlRequest) -> Value {
    debug!(?request, "Control request");
    match request {
        ControlRequest::ListDevices => respond(
            serde_json::to_value(manager.devices())
                .map(|devices| json!({ "devices": devices }))
                .map_err(Into::into),
        ),
        ControlRequest::AddFollower { leader, follower } => {
            relationship(manager.add_follower(&leader, &follower))
        }
        ControlRequest::RemoveFollower { leader, follower } => {
            relationship(manager.remove_follower(&leader, &follower))
        }
        ControlRequest::SetNickname { bus_info, nickname } => {
            respond(manager.set_nickname(&bus_info, &nickname).map(|_| Value::Null))
        }
        ControlRequest::GetOption { bus_info, option } => respond(
            manager
                .get_option(&bus_info, &option)
                .map(|value| json!({ "value": value })),
        ),
        ControlRequest::SetOption {
            bus_info,
            option,
            value,
        } => respond(manager.set_option(&bus_info, &option, value).map(|_| Value::Null)),
        ControlRequest::SetControl {
            bus_info,
            control_id,
            value,
        } => respond(manager.set_control(&bus_info, control_id, value).map(|_| Value::Null)),
        ControlRequest::ConfigureStream { bus_info, stream } => {
            respond(manager.configure_stream(&bus_info, &stream).map(|_| Value::Null))
        }
        ControlRequest::RestartStream { bus_info } => {
            respond(manager.restart_stream(&bus_info).map(|_| Value::Null))
        }
    }
}

/// Parse and execute one request line, returning the response line
pub fn handle_line(manager: &Mutex<DeviceManager>, line: &str) -> String {
    let response = match serde_json::from_str::<ControlRequest>(line) {
        Ok(request) => handle(&mut manager.lock().unwrap(), request),
        Err(e) => {
            warn!(error = %e, "Malformed control request");
            json!({ "ok": false, "error": format!("Invalid request: {}", e) })
        }
    };
    response.to_string()
}

/// Serve requests from stdin until it is closed
pub async fn serve_stdin(manager: Arc<Mutex<DeviceManager>>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "Control input failed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let manager = Arc::clone(&manager);
        match tokio::task::spawn_blocking(move || handle_line(&manager, &line)).await {
            Ok(response) => println!("{}", response),
            Err(e) => warn!(error = %e, "Control request panicked"),
        }
    }
    info!("Control input closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::camera::{DeviceDescriptor, DeviceEnumerator};
    use crate::events::EventSender;
    use crate::settings::SettingsManager;
    use std::time::Duration;

    struct NoDevices;

    impl DeviceEnumerator for NoDevices {
        fn list_devices(&self) -> Vec<DeviceDescriptor> {
            Vec::new()
        }
    }

    fn manager(dir: &std::path::Path) -> Mutex<DeviceManager> {
        let settings = SettingsManager::open_with_interval(dir, Duration::from_secs(3600)).unwrap();
        let (events, _rx) = EventSender::channel();
        Mutex::new(DeviceManager::new(
            Box::new(NoDevices),
            settings,
            events,
            crate::devices::tests::engine_options(),
        ))
    }

    #[test]
    fn test_parse_requests() {
        let request: ControlRequest =
            serde_json::from_str(r#"{"request":"add_follower","leader":"usb-1","follower":"usb-2"}"#).unwrap();
        assert_eq!(
            request,
            ControlRequest::AddFollower {
                leader: "usb-1".to_string(),
                follower: "usb-2".to_string(),
            }
        );

        let request: ControlRequest = serde_json::from_str(
            r#"{"request":"configure_stream","bus_info":"usb-1","stream":{"width":1280,"height":720,"enabled":true}}"#,
        )
        .unwrap();
        let ControlRequest::ConfigureStream { stream, .. } = request else {
            panic!("wrong variant");
        };
        assert_eq!((stream.width, stream.height), (1280, 720));
        assert!(stream.enabled);
    }

    #[test]
    fn test_responses() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());

        let response: Value =
            serde_json::from_str(&handle_line(&manager, r#"{"request":"list_devices"}"#)).unwrap();
        assert_eq!(response, json!({ "ok": true, "devices": [] }));

        let response: Value = serde_json::from_str(&handle_line(
            &manager,
            r#"{"request":"set_nickname","bus_info":"usb-1","nickname":"x"}"#,
        ))
        .unwrap();
        assert_eq!(response["ok"], false);
        assert_eq!(response["error"], "Device not found: usb-1");

        let response: Value = serde_json::from_str(&handle_line(&manager, "not json")).unwrap();
        assert_eq!(response["ok"], false);
    }

    #[test]
    fn test_option_get_after_set() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        manager.lock().unwrap().reconcile(vec![DeviceDescriptor {
            bus_info: "usb-1".to_string(),
            vid: 0x0c45,
            pid: 0x6366,
            card: "test".to_string(),
            device_paths: vec!["/nonexistent/usb-1/video0".to_string()],
        }]);

        let response: Value = serde_json::from_str(&handle_line(
            &manager,
            r#"{"request":"set_option","bus_info":"usb-1","option":"bitrate","value":2.5}"#,
        ))
        .unwrap();
        assert_eq!(response, json!({ "ok": true }));

        let response: Value = serde_json::from_str(&handle_line(
            &manager,
            r#"{"request":"get_option","bus_info":"usb-1","option":"bitrate"}"#,
        ))
        .unwrap();
        assert_eq!(response, json!({ "ok": true, "value": 2.5 }));

        let response: Value = serde_json::from_str(&handle_line(
            &manager,
            r#"{"request":"get_option","bus_info":"usb-1","option":"shutter"}"#,
        ))
        .unwrap();
        assert_eq!(response["ok"], false);
    }

    #[test]
    fn test_relationship_responses() {
        assert_eq!(relationship(Ok(true)), json!({ "ok": true }));
        assert_eq!(relationship(Ok(false))["ok"], false);
        let missing = relationship(Err(crate::errors::AppError::DeviceNotFound("usb-3".to_string())));
        assert_eq!(missing["error"], "Device not found: usb-3");
    }
}
