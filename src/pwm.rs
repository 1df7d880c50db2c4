// SPDX-License-Identifier: GPL-3.0-only

//! Serial timing-pulse generator
//!
//! An external microcontroller drives the camera trigger lines. It takes one
//! ASCII command per line, `<frequency>,<duty>\n`. The controller remembers the
//! last requested values while the port is missing and replays them once a
//! background thread manages to (re)open it.

use crate::constants::{PWM_SUPPORTED_FPS, PWM_TRIGGER_DUTY};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Open `path` and switch it to raw 9600 8N1
fn open_serial(path: &Path) -> io::Result<File> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NOCTTY)
        .open(path)?;

    let fd = file.as_raw_fd();
    // SAFETY: `fd` is a valid open descriptor for the lifetime of `file`, and
    // `termios` is fully initialised by tcgetattr before it is modified.
    unsafe {
        let mut tio: libc::termios = std::mem::zeroed();
        if libc::tcgetattr(fd, &mut tio) != 0 {
            return Err(io::Error::last_os_error());
        }
        libc::cfmakeraw(&mut tio);
        tio.c_cflag |= libc::CLOCAL | libc::CREAD;
        if libc::cfsetispeed(&mut tio, libc::B9600) != 0 || libc::cfsetospeed(&mut tio, libc::B9600) != 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::tcsetattr(fd, libc::TCSANOW, &tio) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(file)
}

struct PwmState {
    port: Option<Box<dyn Write + Send>>,
    frequency: f64,
    duty_cycle: u8,
}

impl PwmState {
    fn send(&mut self) {
        let command = format!("{:.1},{}\n", self.frequency, self.duty_cycle);
        let Some(port) = self.port.as_mut() else {
            debug!("No timing-pulse generator connected, command deferred");
            return;
        };
        debug!(command = command.trim_end(), "Sending PWM command");
        if let Err(e) = port.write_all(command.as_bytes()).and_then(|_| port.flush()) {
            warn!(error = %e, "Timing-pulse generator write failed, reconnecting");
            self.port = None;
        }
    }
}

pub struct SerialPwmController {
    path: PathBuf,
    state: Arc<Mutex<PwmState>>,
    stop_tx: Option<Sender<()>>,
    reconnect: Option<JoinHandle<()>>,
}

impl SerialPwmController {
    /// Start connecting to the generator at `path`, retrying every `retry`
    pub fn start(path: impl Into<PathBuf>, retry: Duration) -> io::Result<Self> {
        let path = path.into();
        let state = Arc::new(Mutex::new(PwmState {
            port: None,
            frequency: 0.0,
            duty_cycle: 0,
        }));

        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let thread_state = Arc::clone(&state);
        let thread_path = path.clone();
        let reconnect = thread::Builder::new()
            .name("pwm-reconnect".to_string())
            .spawn(move || {
                let mut reported = false;
                loop {
                    let connected = thread_state.lock().unwrap().port.is_some();
                    if !connected {
                        match open_serial(&thread_path) {
                            Ok(file) => {
                                info!(port = %thread_path.display(), "Timing-pulse generator connected");
                                reported = false;
                                let mut state = thread_state.lock().unwrap();
                                state.port = Some(Box::new(file));
                                state.send();
                            }
                            Err(e) if !reported => {
                                error!(port = %thread_path.display(), error = %e, "Timing-pulse generator unavailable");
                                reported = true;
                            }
                            Err(_) => {}
                        }
                    }

                    match stop_rx.recv_timeout(retry) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            })?;

        Ok(Self {
            path,
            state,
            stop_tx: Some(stop_tx),
            reconnect: Some(reconnect),
        })
    }

    /// Controller over an already open writer, without reconnect handling
    pub fn with_writer(writer: Box<dyn Write + Send>) -> Self {
        Self {
            path: PathBuf::new(),
            state: Arc::new(Mutex::new(PwmState {
                port: Some(writer),
                frequency: 0.0,
                duty_cycle: 0,
            })),
            stop_tx: None,
            reconnect: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().unwrap().port.is_some()
    }

    /// Request `frequency` Hz at `duty_cycle` percent
    pub fn apply(&self, frequency: f64, duty_cycle: u8) {
        let mut state = self.state.lock().unwrap();
        state.frequency = frequency;
        state.duty_cycle = duty_cycle;
        state.send();
    }

    /// Trigger at `fps`; rates the generator cannot produce are ignored
    pub fn apply_from_fps(&self, fps: u32) -> bool {
        if !PWM_SUPPORTED_FPS.contains(&fps) {
            warn!(fps, "Unsupported trigger frame rate");
            return false;
        }
        self.apply(f64::from(fps), PWM_TRIGGER_DUTY);
        true
    }

    pub fn stop(&self) {
        self.apply(0.0, 0);
    }

    /// Last requested (frequency, duty cycle)
    pub fn current(&self) -> (f64, u8) {
        let state = self.state.lock().unwrap();
        (state.frequency, state.duty_cycle)
    }
}

impl Drop for SerialPwmController {
    fn drop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(handle) = self.reconnect.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn test_commands_are_line_framed() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let writer = file.reopen().unwrap();
        let pwm = SerialPwmController::with_writer(Box::new(writer));

        assert!(pwm.apply_from_fps(60));
        assert!(!pwm.apply_from_fps(45));
        pwm.stop();

        let mut written = String::new();
        file.reopen().unwrap().read_to_string(&mut written).unwrap();
        assert_eq!(written, "60.0,30\n0.0,0\n");
        assert_eq!(pwm.current(), (0.0, 0));
    }

    #[test]
    fn test_values_are_remembered_while_disconnected() {
        let dir = tempfile::tempdir().unwrap();
        let pwm = SerialPwmController::start(dir.path().join("ttyMISSING"), Duration::from_secs(60)).unwrap();

        pwm.apply(30.0, 30);
        assert!(!pwm.is_connected());
        assert_eq!(pwm.current(), (30.0, 30));
    }

    #[test]
    fn test_regular_file_is_not_a_serial_port() {
        let file = tempfile::NamedTempFile::new().unwrap();
        assert!(open_serial(file.path()).is_err());
    }
}
