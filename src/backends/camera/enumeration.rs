// SPDX-License-Identifier: GPL-3.0-only

//! Attached camera discovery
//!
//! Walks `/sys/class/video4linux`, keeps capture-capable nodes, and groups
//! them by bus identifier into one [`DeviceDescriptor`] per physical camera.

use super::types::DeviceDescriptor;
use super::v4l2_utils::{node_number, query_capabilities, usb_ids_for_node};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{debug, trace};

/// Source of the currently attached camera set
pub trait DeviceEnumerator: Send {
    fn list_devices(&self) -> Vec<DeviceDescriptor>;
}

/// Enumerator backed by sysfs + V4L2 QUERYCAP
#[derive(Debug, Clone)]
pub struct V4l2Enumerator {
    sysfs_class_dir: PathBuf,
    dev_dir: PathBuf,
}

impl Default for V4l2Enumerator {
    fn default() -> Self {
        Self {
            sysfs_class_dir: PathBuf::from("/sys/class/video4linux"),
            dev_dir: PathBuf::from("/dev"),
        }
    }
}

impl V4l2Enumerator {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Partially built descriptor while nodes are being grouped
struct NodeGroup {
    vid: u16,
    pid: u16,
    card: String,
    paths: Vec<String>,
}

impl DeviceEnumerator for V4l2Enumerator {
    fn list_devices(&self) -> Vec<DeviceDescriptor> {
        let entries = match std::fs::read_dir(&self.sysfs_class_dir) {
            Ok(entries) => entries,
            Err(e) => {
                debug!(error = %e, "video4linux class directory unavailable");
                return Vec::new();
            }
        };

        let mut groups: BTreeMap<String, NodeGroup> = BTreeMap::new();

        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !name.starts_with("video") {
                continue;
            }

            let dev_path = self.dev_dir.join(name.as_ref());
            let dev_path = dev_path.to_string_lossy().to_string();

            let Some(caps) = query_capabilities(&dev_path) else {
                trace!(device = %dev_path, "QUERYCAP failed");
                continue;
            };
            if !caps.is_video_capture() {
                trace!(device = %dev_path, "Not a capture node");
                continue;
            }
            let Some((vid, pid)) = usb_ids_for_node(&self.sysfs_class_dir, &name) else {
                trace!(device = %dev_path, "No USB ids, skipping");
                continue;
            };

            groups
                .entry(caps.bus_info.clone())
                .or_insert_with(|| NodeGroup {
                    vid,
                    pid,
                    card: caps.card.clone(),
                    paths: Vec::new(),
                })
                .paths
                .push(dev_path);
        }

        groups
            .into_iter()
            .map(|(bus_info, mut group)| {
                group.paths.sort_by_key(|p| node_number(p));
                DeviceDescriptor {
                    bus_info,
                    vid: group.vid,
                    pid: group.pid,
                    card: group.card,
                    device_paths: group.paths,
                }
            })
            .collect()
    }
}

/// Symmetric difference between two enumeration snapshots
///
/// Returns `(added, removed)`: descriptors only in `current`, and descriptors
/// only in `previous`. Order follows the input lists.
pub fn diff_descriptors(
    previous: &[DeviceDescriptor],
    current: &[DeviceDescriptor],
) -> (Vec<DeviceDescriptor>, Vec<DeviceDescriptor>) {
    let added = current
        .iter()
        .filter(|d| !previous.contains(d))
        .cloned()
        .collect();
    let removed = previous
        .iter()
        .filter(|d| !current.contains(d))
        .cloned()
        .collect();
    (added, removed)
}
