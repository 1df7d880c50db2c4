// SPDX-License-Identifier: GPL-3.0-only

//! camrig - hot-plug camera manager with synchronized multi-camera capture
//!
//! Watches for supported USB cameras, keeps their configuration persisted per
//! port and runs their streams. Leader/follower rigs are captured as one
//! source: frames from every camera are aligned by kernel timestamp and
//! shipped as a single unit.
//!
//! # Architecture
//!
//! - [`backends`]: V4L2 enumeration, raw capture and frame alignment
//! - [`devices`]: device set reconciliation, leader/follower links, register
//!   command queues
//! - [`pipelines`]: stream engines (external pipeline process or synchronized
//!   capture) and their wire formats
//! - [`settings`]: persisted per-device settings
//! - [`events`]: notifications for clients
//! - [`control`]: line-based JSON control channel
//! - [`pwm`]: serial timing-pulse generator
//! - [`config`]: daemon configuration

pub mod backends;
pub mod config;
pub mod constants;
pub mod control;
pub mod devices;
pub mod errors;
pub mod events;
pub mod pipelines;
pub mod pwm;
pub mod settings;

// Re-export commonly used types
pub use config::Config;
pub use devices::{DeviceManager, DeviceType};
pub use errors::{AppError, AppResult};
pub use events::DeviceEvent;
