// SPDX-License-Identifier: GPL-3.0-only

//! Daemon configuration
//!
//! Loaded from a JSON file. Every field has a default so a partial (or absent)
//! file is valid.

use crate::constants::*;
use crate::errors::{AppError, AppResult};
use crate::pipelines::stream::EngineOptions;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory holding `device_settings.json`
    pub settings_dir: PathBuf,
    /// Directory recordings are written to
    pub recordings_dir: PathBuf,
    /// Reconciliation period in milliseconds
    pub poll_interval_ms: u64,
    /// External pipeline launcher
    pub pipeline_program: String,
    /// Arguments placed before the pipeline description
    pub pipeline_args: Vec<String>,
    /// Memory-mapped buffers requested per camera
    pub capture_buffers: u32,
    /// Per-source alignment queue depth
    pub sync_queue_capacity: usize,
    /// Per-frame grab timeout in milliseconds
    pub grab_timeout_ms: u64,
    /// Maximum RTP payload size for synchronized sets
    pub mtu: usize,
    /// Serial port of the timing-pulse generator, `None` to disable it
    pub pwm_port: Option<String>,
    /// Reconnect interval for the timing-pulse generator in seconds
    pub pwm_retry_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
        let recordings_dir = dirs::video_dir()
            .map(|dir| dir.join("camrig"))
            .unwrap_or_else(|| PathBuf::from("videos"));

        Self {
            settings_dir: data_dir.join("camrig"),
            recordings_dir,
            poll_interval_ms: DEVICE_POLL_INTERVAL.as_millis() as u64,
            pipeline_program: DEFAULT_PIPELINE_PROGRAM.to_string(),
            pipeline_args: Vec::new(),
            capture_buffers: DEFAULT_CAPTURE_BUFFERS,
            sync_queue_capacity: DEFAULT_SYNC_QUEUE_CAPACITY,
            grab_timeout_ms: DEFAULT_GRAB_TIMEOUT.as_millis() as u64,
            mtu: DEFAULT_MTU,
            pwm_port: Some(DEFAULT_PWM_PORT.to_string()),
            pwm_retry_secs: DEFAULT_PWM_RETRY.as_secs(),
        }
    }
}

impl Config {
    /// Default config file location (`$XDG_CONFIG_HOME/camrig/config.json`)
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("camrig").join("config.json"))
    }

    /// Load a config file. A missing file yields the defaults.
    pub fn load(path: &Path) -> AppResult<Self> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No config file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(AppError::Config(format!("{}: {}", path.display(), e))),
        };

        let config: Config = serde_json::from_str(&contents)
            .map_err(|e| AppError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;

        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    fn validate(&self) -> AppResult<()> {
        if self.mtu == 0 {
            return Err(AppError::Config("mtu must be greater than zero".to_string()));
        }
        if self.sync_queue_capacity == 0 {
            return Err(AppError::Config(
                "sync_queue_capacity must be greater than zero".to_string(),
            ));
        }
        if self.capture_buffers == 0 {
            return Err(AppError::Config(
                "capture_buffers must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn pwm_retry(&self) -> Duration {
        Duration::from_secs(self.pwm_retry_secs.max(1))
    }

    /// Stream engine parameters derived from this config
    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            pipeline_program: self.pipeline_program.clone(),
            pipeline_args: self.pipeline_args.clone(),
            recordings_dir: self.recordings_dir.clone(),
            capture_buffers: self.capture_buffers,
            sync_queue_capacity: self.sync_queue_capacity,
            grab_timeout: Duration::from_millis(self.grab_timeout_ms),
            mtu: self.mtu,
            restart_settle: ENGINE_RESTART_SETTLE,
        }
    }
}
