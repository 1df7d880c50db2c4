// SPDX-License-Identifier: GPL-3.0-only

//! Application-wide constants

use std::time::Duration;

/// Device reconciliation period
pub const DEVICE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Minimum gap between two register-level commands on the same device
pub const HARDWARE_COMMAND_DELAY: Duration = Duration::from_millis(1);

/// Settle time between the high and low byte of a 16-bit sensor write
pub const SENSOR_PAIR_SETTLE: Duration = Duration::from_millis(100);

/// Interval at which queued settings are written to disk
pub const SETTINGS_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Pause between stopping an engine and starting its replacement
pub const ENGINE_RESTART_SETTLE: Duration = Duration::from_secs(1);

/// Graceful stop window for a pipeline that is writing a recording
pub const RECORDING_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Graceful stop window for a network-only pipeline
pub const STREAM_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// How long `stop()` waits for worker threads before detaching them
pub const THREAD_JOIN_TIMEOUT: Duration = Duration::from_secs(3);

/// Poll interval used while waiting on a child process or a worker thread
pub const REAP_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Sleep between non-blocking dequeue attempts while grabbing a frame
pub const GRAB_RETRY_INTERVAL: Duration = Duration::from_millis(1);

/// Default per-frame grab timeout
pub const DEFAULT_GRAB_TIMEOUT: Duration = Duration::from_secs(1);

/// Default number of memory-mapped capture buffers per camera
pub const DEFAULT_CAPTURE_BUFFERS: u32 = 4;

/// Default per-source queue depth used for frame alignment
pub const DEFAULT_SYNC_QUEUE_CAPACITY: usize = 8;

/// Maximum RTP payload bytes per datagram
pub const DEFAULT_MTU: usize = 1400;

/// RTP synchronization source used for synchronized sets ("DWE")
pub const SYNC_RTP_SSRC: u32 = 0x445745;

/// Dynamic RTP payload type used for synchronized sets
pub const SYNC_RTP_PAYLOAD_TYPE: u8 = 96;

/// Default external pipeline launcher
pub const DEFAULT_PIPELINE_PROGRAM: &str = "gst-launch-1.0";

/// Name of the persisted device settings file
pub const SETTINGS_FILE_NAME: &str = "device_settings.json";

/// Default serial port of the timing-pulse generator
pub const DEFAULT_PWM_PORT: &str = "/dev/ttyUSB0";

/// Reconnect interval for the timing-pulse generator
pub const DEFAULT_PWM_RETRY: Duration = Duration::from_secs(5);

/// Duty cycle (percent) used for frame trigger pulses
pub const PWM_TRIGGER_DUTY: u8 = 30;

/// Frame rates the timing-pulse generator can be driven at
pub const PWM_SUPPORTED_FPS: [u32; 5] = [60, 50, 40, 30, 15];

/// Sync threshold in microseconds for a target frame rate (one frame period, rounded)
pub fn sync_threshold_us(fps: u32) -> u64 {
    let fps = u64::from(fps.max(1));
    (1_000_000 + fps / 2) / fps
}
