// SPDX-License-Identifier: GPL-3.0-only

//! Outbound notifications and the engine error buffer

use crate::devices::DeviceRecord;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tracing::trace;

/// Notification emitted by the device manager
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum DeviceEvent {
    DeviceAdded(Box<DeviceRecord>),
    DeviceRemoved { bus_info: String },
    HardwareError { bus_info: String, errors: Vec<String> },
    StreamError { bus_info: String, message: String },
}

impl DeviceEvent {
    pub fn name(&self) -> &'static str {
        match self {
            DeviceEvent::DeviceAdded(_) => "device_added",
            DeviceEvent::DeviceRemoved { .. } => "device_removed",
            DeviceEvent::HardwareError { .. } => "hardware_error",
            DeviceEvent::StreamError { .. } => "stream_error",
        }
    }
}

/// Sending half of the event channel; a closed receiver is ignored
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: UnboundedSender<DeviceEvent>,
}

impl EventSender {
    pub fn channel() -> (Self, UnboundedReceiver<DeviceEvent>) {
        let (tx, rx) = unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn emit(&self, event: DeviceEvent) {
        trace!(event = event.name(), "Emitting event");
        let _ = self.tx.send(event);
    }
}

/// Failure reported by an engine thread for a device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingError {
    pub bus_info: String,
    pub message: String,
}

/// Buffer filled from engine threads and drained by the manager once per cycle
#[derive(Debug, Clone, Default)]
pub struct PendingErrors {
    inner: Arc<Mutex<Vec<PendingError>>>,
}

impl PendingErrors {
    pub fn push(&self, bus_info: &str, message: String) {
        self.inner.lock().unwrap().push(PendingError {
            bus_info: bus_info.to_string(),
            message,
        });
    }

    pub fn drain(&self) -> Vec<PendingError> {
        std::mem::take(&mut *self.inner.lock().unwrap())
    }

    /// Errors grouped by bus identifier, in first-seen order
    pub fn drain_grouped(&self) -> Vec<(String, Vec<String>)> {
        let mut grouped: Vec<(String, Vec<String>)> = Vec::new();
        for error in self.drain() {
            match grouped.iter_mut().find(|(bus, _)| *bus == error.bus_info) {
                Some((_, messages)) => messages.push(error.message),
                None => grouped.push((error.bus_info, vec![error.message])),
            }
        }
        grouped
    }
}
