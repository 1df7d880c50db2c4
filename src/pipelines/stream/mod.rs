// SPDX-License-Identifier: GPL-3.0-only

//! Stream engines
//!
//! A device's stream set is handed to a [`StreamRunner`], which picks an engine
//! on every start:
//!
//! - one stream: [`PipelineEngine`] launches an external pipeline process
//! - several streams: [`SynchronizedEngine`] captures raw frames from every
//!   camera, aligns them by timestamp and ships each aligned set as one unit
//!
//! Engines report runtime failures through an [`ErrorCallback`] instead of
//! unwinding, so a crashed pipeline never takes the manager down.

pub mod gstreamer;
pub mod rtp;
pub mod synchronized;
pub mod types;

pub use gstreamer::{PipelineBuilder, PipelineEngine};
pub use synchronized::SynchronizedEngine;
pub use types::*;

use crate::errors::{AppError, AppResult};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{info, warn};

/// Invoked from engine threads with a human-readable failure description
pub type ErrorCallback = Arc<dyn Fn(String) + Send + Sync>;

/// A running (or stopped) stream backend
pub trait StreamEngine: Send {
    /// Start streaming; errors leave the engine stopped
    fn start(&mut self) -> AppResult<()>;

    /// Stop streaming and release every thread, process and device handle.
    /// Never reports through the error callback.
    fn stop(&mut self);

    fn is_started(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    Pipeline,
    Synchronized,
}

/// Engine for a composed stream set, `None` for an empty set
pub fn select_engine(stream_count: usize) -> Option<EngineKind> {
    match stream_count {
        0 => None,
        1 => Some(EngineKind::Pipeline),
        _ => Some(EngineKind::Synchronized),
    }
}

/// Parameters shared by every engine a runner creates
#[derive(Debug, Clone, PartialEq)]
pub struct EngineOptions {
    pub pipeline_program: String,
    pub pipeline_args: Vec<String>,
    pub recordings_dir: PathBuf,
    pub capture_buffers: u32,
    pub sync_queue_capacity: usize,
    pub grab_timeout: Duration,
    pub mtu: usize,
    /// Pause between stopping a running engine and starting its replacement
    pub restart_settle: Duration,
}

/// Owns the current engine of one device
pub struct StreamRunner {
    options: Arc<EngineOptions>,
    on_error: ErrorCallback,
    engine: Option<Box<dyn StreamEngine>>,
    engine_kind: Option<EngineKind>,
}

impl StreamRunner {
    pub fn new(options: Arc<EngineOptions>, on_error: ErrorCallback) -> Self {
        Self {
            options,
            on_error,
            engine: None,
            engine_kind: None,
        }
    }

    /// (Re)start with `streams`, building a fresh engine
    ///
    /// A running engine is stopped first and given `restart_settle` to let the
    /// driver release the device.
    pub fn start(&mut self, streams: Vec<StreamConfig>) -> AppResult<EngineKind> {
        let was_started = self.is_started();
        self.stop();
        if was_started {
            thread::sleep(self.options.restart_settle);
        }

        let kind = select_engine(streams.len())
            .ok_or_else(|| AppError::InvalidArgument("No streams to start".to_string()))?;

        info!(
            devices = ?streams.iter().map(|s| s.device_path.as_str()).collect::<Vec<_>>(),
            ?kind,
            "Starting streams"
        );

        let mut engine: Box<dyn StreamEngine> = match kind {
            EngineKind::Pipeline => Box::new(PipelineEngine::new(
                streams,
                Arc::clone(&self.options),
                Arc::clone(&self.on_error),
            )),
            EngineKind::Synchronized => Box::new(SynchronizedEngine::new(
                streams,
                Arc::clone(&self.options),
                Arc::clone(&self.on_error),
            )),
        };

        if let Err(e) = engine.start() {
            warn!(error = %e, "Failed to start engine");
            return Err(e);
        }

        self.engine = Some(engine);
        self.engine_kind = Some(kind);
        Ok(kind)
    }

    pub fn stop(&mut self) {
        if let Some(mut engine) = self.engine.take() {
            info!("Stopping streams");
            engine.stop();
        }
        self.engine_kind = None;
    }

    pub fn is_started(&self) -> bool {
        self.engine.as_ref().is_some_and(|engine| engine.is_started())
    }

    /// Engine kind of the last successful start, while it is held
    pub fn engine_kind(&self) -> Option<EngineKind> {
        self.engine_kind
    }
}

impl Drop for StreamRunner {
    fn drop(&mut self) {
        self.stop();
    }
}
