// SPDX-License-Identifier: GPL-3.0-only

//! CLI commands
//!
//! - `run`: the device manager daemon
//! - `list`: attached cameras
//! - `sync-capture`: alignment diagnostic for a multi-camera rig

use camrig::Config;
use camrig::backends::camera::{
    CaptureSettings, DeviceEnumerator, FrameSource, SynchronizedCamera, V4l2Capture, V4l2Enumerator,
};
use camrig::constants::sync_threshold_us;
use camrig::control;
use camrig::devices::{DeviceManager, manager::run_monitor, models};
use camrig::events::EventSender;
use camrig::pwm::SerialPwmController;
use camrig::settings::SettingsManager;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Run the device manager until Ctrl+C
///
/// Events are written to stdout as JSON lines; requests are read from stdin.
pub fn run_daemon(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        let settings = SettingsManager::open(&config.settings_dir)?;
        let (events, mut event_rx) = EventSender::channel();
        let mut manager = DeviceManager::new(
            Box::new(V4l2Enumerator::new()),
            settings,
            events,
            Arc::new(config.engine_options()),
        );

        if let Some(port) = &config.pwm_port {
            match SerialPwmController::start(port, config.pwm_retry()) {
                Ok(pwm) => manager = manager.with_pwm(pwm),
                Err(e) => warn!(port = %port, error = %e, "Timing-pulse generator disabled"),
            }
        }

        let manager = Arc::new(Mutex::new(manager));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let monitor = tokio::spawn(run_monitor(
            Arc::clone(&manager),
            config.poll_interval(),
            shutdown_rx,
        ));

        tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                match serde_json::to_string(&event) {
                    Ok(line) => println!("{}", line),
                    Err(e) => error!(error = %e, "Failed to serialize event"),
                }
            }
        });

        tokio::spawn(control::serve_stdin(Arc::clone(&manager)));

        info!(settings = %config.settings_dir.display(), "camrig running");
        tokio::signal::ctrl_c().await?;
        info!("Shutting down");

        let _ = shutdown_tx.send(true);
        if let Err(e) = monitor.await {
            error!(error = %e, "Device monitor task failed");
        }

        tokio::task::spawn_blocking(move || manager.lock().unwrap().stop_all()).await?;
        Ok::<(), Box<dyn std::error::Error>>(())
    })?;

    // stdin reader threads never finish on their own
    runtime.shutdown_background();
    Ok(())
}

/// List attached cameras
pub fn list_devices() -> Result<(), Box<dyn std::error::Error>> {
    let devices = V4l2Enumerator::new().list_devices();

    if devices.is_empty() {
        println!("No cameras found.");
        return Ok(());
    }

    println!("Attached cameras:");
    println!();
    for device in &devices {
        let model = models::lookup(device.vid, device.pid)
            .map(|m| format!("{} ({})", m.name, m.device_type))
            .unwrap_or_else(|| "unsupported".to_string());
        println!("  {}  {:04x}:{:04x}  {}", device.bus_info, device.vid, device.pid, model);
        println!("      Card:  {}", device.card);
        println!("      Nodes: {}", device.device_paths.join(", "));
        println!();
    }

    Ok(())
}

/// Capture aligned sets from `devices` and print each set's timestamp spread
pub fn sync_capture(
    config: &Config,
    devices: Vec<String>,
    width: u32,
    height: u32,
    fps: u32,
    frames: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    let settings = CaptureSettings {
        width,
        height,
        fps,
        buffer_count: config.capture_buffers,
    };

    let mut sources: Vec<Box<dyn FrameSource>> = Vec::with_capacity(devices.len());
    for path in &devices {
        sources.push(Box::new(V4l2Capture::open(path, &settings)?));
        println!("Opened {} at {}x{}@{}fps", path, width, height, fps);
    }

    let stop_flag = Arc::new(AtomicBool::new(false));
    let stop_flag_clone = stop_flag.clone();
    ctrlc::set_handler(move || {
        stop_flag_clone.store(true, Ordering::SeqCst);
    })?;

    let threshold = sync_threshold_us(fps);
    let mut camera = SynchronizedCamera::new(
        sources,
        config.sync_queue_capacity,
        threshold,
        config.engine_options().grab_timeout,
    )
    .with_stop_signal(stop_flag.clone());
    println!("Sync threshold: {} us", threshold);
    println!("Capturing... (press Ctrl+C to stop early)");
    println!();

    let start = Instant::now();
    let mut sets = 0u64;
    let mut worst_spread = 0u64;
    while sets < frames && !stop_flag.load(Ordering::SeqCst) {
        let Some(set) = camera.grab_synced() else {
            continue;
        };
        let timestamps: Vec<u64> = set.iter().map(|f| f.timestamp_us).collect();
        let spread = timestamps.iter().max().copied().unwrap_or(0)
            - timestamps.iter().min().copied().unwrap_or(0);
        worst_spread = worst_spread.max(spread);
        sets += 1;

        let sizes: Vec<String> = set.iter().map(|f| f.data.len().to_string()).collect();
        println!("set {:>5}  spread {:>6} us  bytes [{}]", sets, spread, sizes.join(", "));
    }

    let elapsed = start.elapsed().as_secs_f64();
    println!();
    println!(
        "{} sets in {:.1}s ({:.1} sets/s), worst spread {} us, {} frames dropped",
        sets,
        elapsed,
        if elapsed > 0.0 { sets as f64 / elapsed } else { 0.0 },
        worst_spread,
        camera.aligner().dropped()
    );

    Ok(())
}
