// SPDX-License-Identifier: GPL-3.0-only

//! Persisted per-device settings
//!
//! Records live in `device_settings.json` as a JSON array, one entry per bus
//! identifier. Saves are queued and written by a background thread once per
//! flush interval, on [`SettingsManager::flush`], and when the manager is
//! dropped. An unreadable file is reset to an empty list instead of failing
//! startup.

use crate::constants::{SETTINGS_FILE_NAME, SETTINGS_FLUSH_INTERVAL};
use crate::devices::DeviceType;
use crate::errors::{AppError, AppResult};
use crate::pipelines::stream::{EncodeType, Interval, StreamEndpoint, StreamKind};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedControl {
    pub control_id: u32,
    pub name: String,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedStream {
    pub encode_type: EncodeType,
    pub stream_type: StreamKind,
    pub endpoints: Vec<StreamEndpoint>,
    pub width: u32,
    pub height: u32,
    pub interval: Interval,
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedDevice {
    pub bus_info: String,
    pub vid: u16,
    pub pid: u16,
    pub nickname: String,
    pub stream: SavedStream,
    pub controls: Vec<SavedControl>,
    pub device_type: DeviceType,
    #[serde(default)]
    pub followers: Vec<String>,
}

#[derive(Debug, Default)]
struct SettingsState {
    saved: Vec<SavedDevice>,
    pending: Vec<SavedDevice>,
    dirty: bool,
}

impl SettingsState {
    fn upsert(list: &mut Vec<SavedDevice>, device: SavedDevice) {
        match list.iter_mut().find(|d| d.bus_info == device.bus_info) {
            Some(existing) => *existing = device,
            None => list.push(device),
        }
    }

    fn latest(&self, bus_info: &str) -> Option<&SavedDevice> {
        self.pending
            .iter()
            .chain(self.saved.iter())
            .find(|d| d.bus_info == bus_info)
    }
}

pub struct SettingsManager {
    path: PathBuf,
    state: Arc<Mutex<SettingsState>>,
    stop_tx: Option<Sender<()>>,
    flusher: Option<JoinHandle<()>>,
}

impl SettingsManager {
    /// Open (or create) the settings file in `dir` and start the flusher
    pub fn open(dir: &Path) -> AppResult<Self> {
        Self::open_with_interval(dir, SETTINGS_FLUSH_INTERVAL)
    }

    pub fn open_with_interval(dir: &Path, interval: Duration) -> AppResult<Self> {
        std::fs::create_dir_all(dir)
            .map_err(|e| AppError::Settings(format!("{}: {}", dir.display(), e)))?;
        let path = dir.join(SETTINGS_FILE_NAME);
        let saved = load_or_reset(&path)?;
        info!(path = %path.display(), devices = saved.len(), "Loaded device settings");

        let state = Arc::new(Mutex::new(SettingsState {
            saved,
            pending: Vec::new(),
            dirty: false,
        }));

        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let flusher_state = Arc::clone(&state);
        let flusher_path = path.clone();
        let flusher = thread::Builder::new()
            .name("settings-flush".to_string())
            .spawn(move || {
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {
                            if let Err(e) = flush_state(&flusher_path, &flusher_state) {
                                error!(error = %e, "Failed to write device settings");
                            }
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                debug!("Settings flusher exiting");
            })?;

        Ok(Self {
            path,
            state,
            stop_tx: Some(stop_tx),
            flusher: Some(flusher),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Most recent record for `bus_info`, including unflushed saves
    pub fn saved(&self, bus_info: &str) -> Option<SavedDevice> {
        self.state.lock().unwrap().latest(bus_info).cloned()
    }

    /// Queue `device` for the next flush
    pub fn save(&self, device: SavedDevice) {
        debug!(bus_info = %device.bus_info, "Queued device settings");
        let mut state = self.state.lock().unwrap();
        SettingsState::upsert(&mut state.pending, device);
        state.dirty = true;
    }

    /// Forget the record for `bus_info`
    pub fn discard(&self, bus_info: &str) {
        let mut state = self.state.lock().unwrap();
        state.saved.retain(|d| d.bus_info != bus_info);
        state.pending.retain(|d| d.bus_info != bus_info);
        state.dirty = true;
    }

    /// Drop `follower` from the follower list stored for `leader`
    pub fn forget_follower(&self, leader: &str, follower: &str) {
        let mut state = self.state.lock().unwrap();
        let SettingsState {
            saved,
            pending,
            dirty,
        } = &mut *state;
        for record in saved.iter_mut().chain(pending.iter_mut()) {
            if record.bus_info == leader {
                record.followers.retain(|f| f != follower);
                *dirty = true;
            }
        }
    }

    /// Write queued saves now
    pub fn flush(&self) -> AppResult<()> {
        flush_state(&self.path, &self.state)
    }
}

impl Drop for SettingsManager {
    fn drop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(handle) = self.flusher.take()
            && handle.join().is_err()
        {
            warn!("Settings flusher panicked");
        }
        if let Err(e) = self.flush() {
            error!(error = %e, "Failed to write device settings on shutdown");
        }
    }
}

fn load_or_reset(path: &Path) -> AppResult<Vec<SavedDevice>> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            write_records(path, &[])?;
            return Ok(Vec::new());
        }
        Err(e) => return Err(AppError::Settings(format!("{}: {}", path.display(), e))),
    };

    match serde_json::from_str::<Vec<SavedDevice>>(&contents) {
        Ok(saved) => Ok(saved),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Device settings unreadable, resetting");
            write_records(path, &[])?;
            Ok(Vec::new())
        }
    }
}

fn write_records(path: &Path, records: &[SavedDevice]) -> AppResult<()> {
    let json = serde_json::to_string_pretty(records)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json).map_err(|e| AppError::Settings(format!("{}: {}", tmp.display(), e)))?;
    std::fs::rename(&tmp, path).map_err(|e| AppError::Settings(format!("{}: {}", path.display(), e)))
}

fn flush_state(path: &Path, state: &Mutex<SettingsState>) -> AppResult<()> {
    let records = {
        let mut state = state.lock().unwrap();
        if !state.dirty {
            return Ok(());
        }
        state.dirty = false;
        let pending = std::mem::take(&mut state.pending);
        for device in pending {
            SettingsState::upsert(&mut state.saved, device);
        }
        state.saved.clone()
    };

    write_records(path, &records)?;
    debug!(devices = records.len(), "Wrote device settings");
    Ok(())
}
