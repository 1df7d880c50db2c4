// SPDX-License-Identifier: GPL-3.0-only

//! Integration tests for configuration module

use camrig::Config;
use camrig::errors::AppError;
use std::time::Duration;

#[test]
fn test_config_default() {
    let config = Config::default();

    assert_eq!(config.poll_interval(), Duration::from_millis(100));
    assert_eq!(config.pipeline_program, "gst-launch-1.0");
    assert_eq!(config.capture_buffers, 4);
    assert_eq!(config.sync_queue_capacity, 8);
    assert_eq!(config.mtu, 1400);
    assert_eq!(config.pwm_port.as_deref(), Some("/dev/ttyUSB0"));
}

#[test]
fn test_missing_file_yields_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::load(&dir.path().join("absent.json")).unwrap();
    assert_eq!(config, Config::default());
}

#[test]
fn test_partial_file_keeps_other_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.json");
    std::fs::write(&path, r#"{ "poll_interval_ms": 250, "pwm_port": null, "mtu": 9000 }"#).unwrap();

    let config = Config::load(&path).unwrap();
    assert_eq!(config.poll_interval(), Duration::from_millis(250));
    assert_eq!(config.pwm_port, None);
    assert_eq!(config.mtu, 9000);
    assert_eq!(config.capture_buffers, 4);
}

#[test]
fn test_invalid_files_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.json");

    std::fs::write(&path, "{ broken").unwrap();
    assert!(matches!(Config::load(&path), Err(AppError::Config(_))));

    std::fs::write(&path, r#"{ "mtu": 0 }"#).unwrap();
    assert!(matches!(Config::load(&path), Err(AppError::Config(_))));
}

#[test]
fn test_engine_options_follow_config() {
    let config = Config {
        grab_timeout_ms: 250,
        pipeline_args: vec!["-q".to_string()],
        ..Config::default()
    };
    let options = config.engine_options();
    assert_eq!(options.grab_timeout, Duration::from_millis(250));
    assert_eq!(options.pipeline_args, vec!["-q".to_string()]);
    assert_eq!(options.recordings_dir, config.recordings_dir);
}
