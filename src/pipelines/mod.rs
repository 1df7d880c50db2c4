// SPDX-License-Identifier: MPL-2.0

//! Streaming pipelines
//!
//! ```text
//! ┌──────────────┐     ┌───────────────────┐     ┌────────────────────┐
//! │ 1 camera     │ ──▶ │  PipelineEngine   │ ──▶ │ UDP / AVI / MP4    │
//! │              │     │  (gst-launch)     │     │                    │
//! └──────────────┘     └───────────────────┘     └────────────────────┘
//!
//! ┌──────────────┐     ┌───────────────────┐     ┌────────────────────┐
//! │ N cameras    │ ──▶ │ SynchronizedEngine│ ──▶ │ RTP sets / .mjpegset│
//! │ (leader+fol.)│     │  (raw V4L2 + sync)│     │                    │
//! └──────────────┘     └───────────────────┘     └────────────────────┘
//! ```
//!
//! - [`stream`]: engine selection, both engines and their wire formats

pub mod stream;
