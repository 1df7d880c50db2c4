// SPDX-License-Identifier: MPL-2.0

//! Camera access layer
//!
//! ```text
//! ┌──────────────────────┐      ┌───────────────────────┐
//! │   V4l2Enumerator     │      │  SynchronizedCamera   │
//! │ (sysfs + QUERYCAP)   │      │   (FrameAligner)      │
//! └──────────┬───────────┘      └──────────┬────────────┘
//!            │ DeviceDescriptor            │ FrameSource × N
//!            ▼                             ▼
//!      device manager               ┌──────────────┐
//!                                   │ V4l2Capture  │  ← mmap arena, DQBUF/QBUF
//!                                   └──────────────┘
//! ```
//!
//! Controls and UVC extension-unit access live in [`v4l2_controls`]; the
//! worker-thread helper shared by the stream engines is in [`frame_loop`].

pub mod capture;
pub mod enumeration;
pub mod frame_loop;
pub mod synchronizer;
pub mod types;
pub mod v4l2_controls;
pub mod v4l2_utils;

pub use capture::{CaptureSettings, FrameSource, V4l2Capture};
pub use enumeration::{DeviceEnumerator, V4l2Enumerator, diff_descriptors};
pub use frame_loop::{LoopAction, LoopController};
pub use synchronizer::{FrameAligner, SynchronizedCamera};
pub use types::*;
