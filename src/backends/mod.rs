// SPDX-License-Identifier: MPL-2.0

//! Hardware access layer
//!
//! - [`camera`]: enumeration, controls, raw capture and frame alignment

pub mod camera;
