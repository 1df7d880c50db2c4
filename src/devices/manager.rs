// SPDX-License-Identifier: GPL-3.0-only

//! Device set reconciliation and leader/follower linking
//!
//! The manager is driven by periodic [`DeviceManager::poll`] calls. Each cycle
//! enumerates the attached cameras, diffs them against the previous cycle,
//! creates or tears down [`Device`]s, re-links followers from persisted
//! settings and drains engine errors into events. The cycle runs to completion
//! before the next one is scheduled.
//!
//! Unplug policy: a removed Leader releases its Followers, which fall back to
//! their own stream configuration. A removed managed Follower drops out of its
//! Leader's composition and the Leader restarts with the remaining cameras.

use super::{Device, DeviceRecord, DeviceType, StreamUpdate};
use crate::backends::camera::{DeviceDescriptor, DeviceEnumerator, diff_descriptors};
use crate::devices::controls::DeviceOption;
use crate::devices::models;
use crate::errors::{AppError, AppResult};
use crate::events::{DeviceEvent, EventSender, PendingErrors};
use crate::pipelines::stream::{EngineKind, EngineOptions};
use crate::pwm::SerialPwmController;
use crate::settings::SettingsManager;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Descriptors added and removed by one reconciliation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub added: Vec<DeviceDescriptor>,
    pub removed: Vec<DeviceDescriptor>,
}

pub struct DeviceManager {
    enumerator: Box<dyn DeviceEnumerator>,
    settings: SettingsManager,
    events: EventSender,
    errors: PendingErrors,
    options: Arc<EngineOptions>,
    pwm: Option<SerialPwmController>,
    descriptors: Vec<DeviceDescriptor>,
    devices: Vec<Device>,
}

impl DeviceManager {
    pub fn new(
        enumerator: Box<dyn DeviceEnumerator>,
        settings: SettingsManager,
        events: EventSender,
        options: Arc<EngineOptions>,
    ) -> Self {
        Self {
            enumerator,
            settings,
            events,
            errors: PendingErrors::default(),
            options,
            pwm: None,
            descriptors: Vec::new(),
            devices: Vec::new(),
        }
    }

    /// Drive `pwm` from synchronized Leader streams
    pub fn with_pwm(mut self, pwm: SerialPwmController) -> Self {
        self.pwm = Some(pwm);
        self
    }

    /// Buffer engine threads report crashes into
    pub fn pending_errors(&self) -> &PendingErrors {
        &self.errors
    }

    pub fn settings(&self) -> &SettingsManager {
        &self.settings
    }

    /// One monitoring cycle: enumerate, reconcile, drain engine errors
    pub fn poll(&mut self) -> ReconcileOutcome {
        let current = self.enumerator.list_devices();
        let outcome = self.reconcile(current);
        self.drain_errors();
        outcome
    }

    /// Bring the device set in line with `current`
    pub fn reconcile(&mut self, current: Vec<DeviceDescriptor>) -> ReconcileOutcome {
        let (added, removed) = diff_descriptors(&self.descriptors, &current);
        self.descriptors = current;

        let mut to_start: BTreeSet<String> = BTreeSet::new();

        // Removals first: a changed descriptor shows up as removed plus added
        // under the same bus identifier
        for descriptor in &removed {
            to_start.extend(self.remove_device(descriptor));
        }

        for descriptor in &added {
            let Some(model) = models::lookup(descriptor.vid, descriptor.pid) else {
                debug!(device = %descriptor, "Skipping unsupported camera");
                continue;
            };
            if self.position(&descriptor.bus_info).is_some() {
                warn!(device = %descriptor, "Bus identifier already in use, skipping");
                continue;
            }

            let device = Device::new(
                descriptor.clone(),
                model,
                Arc::clone(&self.options),
                self.errors.clone(),
            );
            self.devices.push(device);
            to_start.extend(self.load_device(&descriptor.bus_info));
            to_start.insert(descriptor.bus_info.clone());

            info!(bus_info = %descriptor.bus_info, model = model.name, "Device added");
            if let Some(device) = self.find(&descriptor.bus_info) {
                self.events
                    .emit(DeviceEvent::DeviceAdded(Box::new(device.record())));
            }
        }

        if !added.is_empty() || !removed.is_empty() {
            to_start.extend(self.link_followers());
        }

        for bus_info in to_start {
            if let Some(index) = self.position(&bus_info) {
                let _ = self.relaunch(index);
            }
        }

        ReconcileOutcome { added, removed }
    }

    fn remove_device(&mut self, descriptor: &DeviceDescriptor) -> Vec<String> {
        let Some(index) = self.devices.iter().position(|d| d.descriptor() == descriptor) else {
            return Vec::new();
        };

        self.stop_at(index);
        let device = self.devices.remove(index);
        let bus_info = device.bus_info().to_string();
        let mut to_start = Vec::new();

        match device.device_type() {
            DeviceType::Leader => {
                for follower in device.followers() {
                    if let Some(fi) = self.position(follower)
                        && self.devices[fi].leader() == Some(bus_info.as_str())
                    {
                        info!(leader = %bus_info, follower = %follower, "Detaching follower");
                        self.devices[fi].set_leader(None);
                        to_start.push(follower.clone());
                    }
                }
            }
            DeviceType::Follower => {
                if let Some(leader) = device.leader() {
                    info!(leader, follower = %bus_info, "Managed follower removed, restarting leader");
                    to_start.push(leader.to_string());
                }
            }
            DeviceType::Standalone => {}
        }

        info!(bus_info = %bus_info, "Device removed");
        self.events.emit(DeviceEvent::DeviceRemoved { bus_info });
        to_start
    }

    /// Apply persisted settings to a newly created device and restore its links
    ///
    /// Returns Leaders whose composition changed.
    pub fn load_device(&mut self, bus_info: &str) -> Vec<String> {
        let Some(index) = self.position(bus_info) else {
            return Vec::new();
        };
        let Some(saved) = self.settings.saved(bus_info) else {
            return Vec::new();
        };

        let device_type = self.devices[index].device_type();
        if saved.device_type != device_type {
            info!(
                bus_info,
                saved = %saved.device_type,
                connected = %device_type,
                "Device type changed on this port, discarding stored settings"
            );
            self.settings.discard(bus_info);
            return Vec::new();
        }

        self.devices[index].apply_saved(&saved);
        let mut changed = Vec::new();

        match device_type {
            DeviceType::Leader => {
                for follower in saved.followers.iter().filter(|f| f.as_str() != bus_info) {
                    let Some(fi) = self.position(follower) else {
                        debug!(leader = bus_info, follower = %follower, "Saved follower not connected");
                        continue;
                    };
                    if self.devices[fi].device_type() != DeviceType::Follower {
                        warn!(leader = bus_info, follower = %follower, "Saved follower is not a follower, dropping");
                        self.devices[index].unlist_follower(follower);
                        continue;
                    }
                    if self.devices[fi].is_managed() {
                        info!(leader = bus_info, follower = %follower, "Saved follower already has a new leader");
                        self.devices[index].unlist_follower(follower);
                        continue;
                    }
                    self.attach(index, fi);
                }
                self.save_at(index);
            }
            DeviceType::Follower => {
                let leader = self
                    .devices
                    .iter()
                    .position(|d| {
                        d.device_type() == DeviceType::Leader
                            && d.bus_info() != bus_info
                            && d.followers().iter().any(|f| f == bus_info)
                    });
                if let Some(li) = leader {
                    self.attach(li, index);
                    changed.push(self.devices[li].bus_info().to_string());
                }
            }
            DeviceType::Standalone => {}
        }

        changed
    }

    /// Re-link every Leader with the connected Followers it lists
    ///
    /// Listed devices that turn out not to be Followers are dropped from the
    /// list. Followers managed by another Leader are left alone. Returns
    /// Leaders whose composition changed.
    pub fn link_followers(&mut self) -> Vec<String> {
        let mut changed = Vec::new();

        for li in 0..self.devices.len() {
            if self.devices[li].device_type() != DeviceType::Leader {
                continue;
            }
            let leader = self.devices[li].bus_info().to_string();
            let mut linked = false;
            let mut trimmed = false;

            for follower in self.devices[li].followers().to_vec() {
                let Some(fi) = self.position(&follower) else {
                    continue;
                };
                if self.devices[fi].device_type() != DeviceType::Follower {
                    warn!(leader = %leader, follower = %follower, "Listed follower is not a follower, dropping");
                    self.devices[li].unlist_follower(&follower);
                    trimmed = true;
                    continue;
                }
                if self.devices[fi].is_managed() {
                    continue;
                }
                self.attach(li, fi);
                linked = true;
            }

            if trimmed || linked {
                self.save_at(li);
            }
            if linked {
                changed.push(leader);
            }
        }

        changed
    }

    /// Link follower `fi` to leader `li`, without restarting anything
    fn attach(&mut self, li: usize, fi: usize) {
        let leader = self.devices[li].bus_info().to_string();
        let follower = self.devices[fi].bus_info().to_string();
        info!(leader = %leader, follower = %follower, "Linking follower");

        self.stop_at(fi);
        self.devices[li].list_follower(&follower);
        self.devices[fi].set_leader(Some(&leader));
        self.save_at(fi);
    }

    /// Make `follower` part of `leader`'s synchronized stream
    ///
    /// Returns `Ok(false)` for a wrong type combination or a device following
    /// itself. Linking an already linked pair is a no-op.
    pub fn add_follower(&mut self, leader: &str, follower: &str) -> AppResult<bool> {
        let li = self.index_of(leader)?;
        let fi = self.index_of(follower)?;

        if let Err(e) = self.check_pair(li, fi) {
            warn!(error = %e, "Rejected add_follower");
            return Ok(false);
        }

        if self.devices[fi].leader() == Some(leader) && self.devices[li].followers().iter().any(|f| f == follower) {
            info!(leader, follower, "Follower already linked, ignoring");
            return Ok(true);
        }

        if let Some(previous) = self.devices[fi].leader().map(str::to_string) {
            info!(follower, previous = %previous, "Moving follower to a new leader");
            if let Some(pi) = self.position(&previous) {
                self.devices[pi].unlist_follower(follower);
                self.devices[fi].set_leader(None);
                self.save_at(pi);
                let _ = self.relaunch(pi);
            }
        }

        let li = self.index_of(leader)?;
        let fi = self.index_of(follower)?;
        self.attach(li, fi);
        self.save_at(li);
        let _ = self.relaunch(li);
        Ok(true)
    }

    /// Detach `follower` from `leader`
    ///
    /// A follower that is not connected is only trimmed from the Leader's
    /// stored list; there is no guarantee a listed follower still exists.
    pub fn remove_follower(&mut self, leader: &str, follower: &str) -> AppResult<bool> {
        let li = self.index_of(leader)?;

        let Some(fi) = self.position(follower) else {
            info!(leader, follower, "Removing disconnected follower from stored list");
            self.devices[li].unlist_follower(follower);
            self.settings.forget_follower(leader, follower);
            self.save_at(li);
            return Ok(true);
        };

        if let Err(e) = self.check_pair(li, fi) {
            warn!(error = %e, "Rejected remove_follower");
            return Ok(false);
        }

        if !self.devices[li].unlist_follower(follower) {
            info!(leader, follower, "Leader does not list this follower");
            return Ok(false);
        }
        if self.devices[fi].leader() == Some(leader) {
            self.devices[fi].set_leader(None);
        }
        info!(leader, follower, "Removed follower");

        self.save_at(li);
        self.save_at(fi);
        let _ = self.relaunch(li);
        let _ = self.relaunch(fi);
        Ok(true)
    }

    fn check_pair(&self, li: usize, fi: usize) -> AppResult<()> {
        let leader = &self.devices[li];
        let follower = &self.devices[fi];
        if leader.device_type() != DeviceType::Leader {
            return Err(AppError::InvalidRelationship(format!(
                "{} is a {} device, not a leader",
                leader.bus_info(),
                leader.device_type()
            )));
        }
        if follower.device_type() != DeviceType::Follower {
            return Err(AppError::InvalidRelationship(format!(
                "{} is a {} device, not a follower",
                follower.bus_info(),
                follower.device_type()
            )));
        }
        if li == fi {
            return Err(AppError::InvalidRelationship(format!(
                "{} cannot follow itself",
                leader.bus_info()
            )));
        }
        Ok(())
    }

    /// Emit queued engine failures
    ///
    /// Failures of devices that are no longer enumerated are put down to the
    /// unplug. Otherwise the device's stream is disabled and a hardware error
    /// is emitted.
    pub fn drain_errors(&mut self) {
        for (bus_info, errors) in self.errors.drain_grouped() {
            let enumerated = self.descriptors.iter().any(|d| d.bus_info == bus_info);
            if !enumerated {
                debug!(bus_info = %bus_info, "Engine error ignored, device unplugged");
                continue;
            }

            error!(bus_info = %bus_info, ?errors, "Stream engine failed");
            if let Some(index) = self.position(&bus_info) {
                self.devices[index].disable_stream();
                self.stop_at(index);
                self.save_at(index);
            }
            self.events.emit(DeviceEvent::HardwareError { bus_info, errors });
        }
    }

    // ===== Device API =====

    pub fn devices(&self) -> Vec<DeviceRecord> {
        self.devices.iter().map(Device::record).collect()
    }

    pub fn device(&self, bus_info: &str) -> AppResult<DeviceRecord> {
        self.find(bus_info)
            .map(Device::record)
            .ok_or_else(|| AppError::DeviceNotFound(bus_info.to_string()))
    }

    pub fn set_nickname(&mut self, bus_info: &str, nickname: &str) -> AppResult<()> {
        let index = self.index_of(bus_info)?;
        self.devices[index].set_nickname(nickname);
        self.save_at(index);
        Ok(())
    }

    /// Current value of a named option, read from the camera for register options
    pub fn get_option(&mut self, bus_info: &str, option: &str) -> AppResult<f64> {
        let option = DeviceOption::from_key(option)
            .ok_or_else(|| AppError::InvalidArgument(format!("Unknown option {}", option)))?;
        let index = self.index_of(bus_info)?;
        self.devices[index].read_option(option)
    }

    pub fn set_option(&mut self, bus_info: &str, option: &str, value: f64) -> AppResult<()> {
        let option = DeviceOption::from_key(option)
            .ok_or_else(|| AppError::InvalidArgument(format!("Unknown option {}", option)))?;
        let index = self.index_of(bus_info)?;
        let restart = self.devices[index].set_option(option, value)?;
        self.save_at(index);
        if restart {
            self.relaunch(index)?;
        }
        Ok(())
    }

    pub fn set_control(&mut self, bus_info: &str, control_id: u32, value: f64) -> AppResult<()> {
        let index = self.index_of(bus_info)?;
        let restart = self.devices[index].set_control(control_id, value)?;
        self.save_at(index);
        if restart {
            self.relaunch(index)?;
        }
        Ok(())
    }

    /// Apply `update` and start or stop the stream to match `enabled`
    ///
    /// A managed Follower is streamed by its Leader, so the Leader is
    /// restarted instead.
    pub fn configure_stream(&mut self, bus_info: &str, update: &StreamUpdate) -> AppResult<()> {
        let index = self.index_of(bus_info)?;
        self.devices[index].configure_stream(update);
        self.save_at(index);

        if let Some(leader) = self.devices[index].leader().map(str::to_string) {
            let li = self.index_of(&leader)?;
            return self.relaunch(li);
        }
        self.relaunch(index)
    }

    pub fn restart_stream(&mut self, bus_info: &str) -> AppResult<()> {
        let index = self.index_of(bus_info)?;
        if let Some(leader) = self.devices[index].leader().map(str::to_string) {
            let li = self.index_of(&leader)?;
            return self.relaunch(li);
        }
        self.relaunch(index)
    }

    /// Stop every engine and write settings (shutdown path)
    pub fn stop_all(&mut self) {
        for index in 0..self.devices.len() {
            self.stop_at(index);
        }
        if let Some(pwm) = &self.pwm {
            pwm.stop();
        }
        if let Err(e) = self.settings.flush() {
            error!(error = %e, "Failed to write device settings");
        }
    }

    // ===== Helpers =====

    fn position(&self, bus_info: &str) -> Option<usize> {
        self.devices.iter().position(|d| d.bus_info() == bus_info)
    }

    fn index_of(&self, bus_info: &str) -> AppResult<usize> {
        self.position(bus_info)
            .ok_or_else(|| AppError::DeviceNotFound(bus_info.to_string()))
    }

    fn find(&self, bus_info: &str) -> Option<&Device> {
        self.devices.iter().find(|d| d.bus_info() == bus_info)
    }

    fn save_at(&self, index: usize) {
        self.settings.save(self.devices[index].saved());
    }

    fn stop_at(&mut self, index: usize) {
        if self.devices[index].stop_stream() == Some(EngineKind::Synchronized)
            && let Some(pwm) = &self.pwm
        {
            pwm.stop();
        }
    }

    /// (Re)start the stream at `index` with its linked followers, or stop it
    /// when disabled. Start failures are emitted as stream errors.
    fn relaunch(&mut self, index: usize) -> AppResult<()> {
        let device = &self.devices[index];
        if device.is_managed() {
            return Ok(());
        }
        if !device.stream().enabled {
            self.stop_at(index);
            return Ok(());
        }

        let leader = device.bus_info();
        let follower_streams: Vec<_> = device
            .followers()
            .iter()
            .filter_map(|f| self.find(f))
            .filter(|f| f.leader() == Some(leader))
            .map(|f| f.composed_stream(device.stream()))
            .collect();

        let bus_info = leader.to_string();
        let fps = device.stream().interval.fps();
        match self.devices[index].start_stream(follower_streams) {
            Ok(Some(EngineKind::Synchronized)) => {
                if let Some(pwm) = &self.pwm {
                    pwm.apply_from_fps(fps);
                }
                Ok(())
            }
            Ok(_) => Ok(()),
            Err(e) => {
                error!(bus_info = %bus_info, error = %e, "Failed to start stream");
                self.events.emit(DeviceEvent::StreamError {
                    bus_info,
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }
}

impl Drop for DeviceManager {
    fn drop(&mut self) {
        self.stop_all();
    }
}

/// Run `manager.poll()` every `period` until `shutdown` turns true
///
/// Each cycle runs on the blocking pool; a slow cycle delays the next tick
/// instead of queueing missed ones.
pub async fn run_monitor(
    manager: Arc<Mutex<DeviceManager>>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(period_ms = period.as_millis() as u64, "Device monitor started");

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let manager = Arc::clone(&manager);
                let cycle = tokio::task::spawn_blocking(move || {
                    manager.lock().unwrap().poll();
                });
                if let Err(e) = cycle.await {
                    error!(error = %e, "Device monitor cycle panicked");
                    break;
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    info!("Device monitor stopped");
}
