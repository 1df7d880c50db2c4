// SPDX-License-Identifier: GPL-3.0-only
//! Thread lifecycle management for engine worker loops
//!
//! The synchronized engine runs a capture loop and a transmit loop; both are
//! driven through [`LoopController`] so stopping is uniform: raise the stop
//! flag first, then join with a bounded timeout.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::constants::REAP_POLL_INTERVAL;

/// Action returned by the loop body to control loop behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopAction {
    /// Run another iteration
    Continue,
    /// Exit the loop
    Stop,
}

/// Controller for a loop running in its own thread
///
/// # Example
///
/// ```ignore
/// let mut capture = LoopController::start("sync-capture", move || {
///     if let Some(set) = camera.grab_synced() {
///         handoff.push(set);
///     }
///     LoopAction::Continue
/// });
///
/// capture.stop_within(Duration::from_secs(3));
/// ```
pub struct LoopController {
    thread_handle: Option<JoinHandle<()>>,
    stop_signal: Arc<AtomicBool>,
    name: String,
}

impl LoopController {
    /// Start `loop_fn` on a new thread
    ///
    /// The closure is called repeatedly until it returns [`LoopAction::Stop`]
    /// or a stop is requested. The stop flag is checked between iterations, so
    /// one iteration should not block for longer than the caller's stop
    /// timeout.
    pub fn start<F>(name: &str, loop_fn: F) -> Self
    where
        F: FnMut() -> LoopAction + Send + 'static,
    {
        Self::with_signal(name, Arc::new(AtomicBool::new(false)), loop_fn)
    }

    /// Like [`LoopController::start`], with a caller-owned stop flag
    ///
    /// Loop bodies that block internally hold a clone of `stop_signal` and
    /// check it between their own blocking steps.
    pub fn with_signal<F>(name: &str, stop_signal: Arc<AtomicBool>, mut loop_fn: F) -> Self
    where
        F: FnMut() -> LoopAction + Send + 'static,
    {
        let stop_signal_clone = Arc::clone(&stop_signal);
        let name_clone = name.to_string();

        info!(name = %name, "Starting worker loop");

        let thread_handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                debug!(name = %name_clone, "Worker loop thread started");

                loop {
                    if stop_signal_clone.load(Ordering::SeqCst) {
                        debug!(name = %name_clone, "Stop signal received");
                        break;
                    }

                    if loop_fn() == LoopAction::Stop {
                        debug!(name = %name_clone, "Loop requested stop");
                        break;
                    }
                }

                info!(name = %name_clone, "Worker loop thread exiting");
            });

        let thread_handle = match thread_handle {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!(name = %name, error = %e, "Failed to spawn worker thread");
                None
            }
        };

        Self {
            thread_handle,
            stop_signal,
            name: name.to_string(),
        }
    }

    /// Check if the loop thread is still alive
    pub fn is_running(&self) -> bool {
        self.thread_handle
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Signal the loop to stop without waiting
    pub fn request_stop(&self) {
        debug!(name = %self.name, "Requesting worker loop stop");
        self.stop_signal.store(true, Ordering::SeqCst);
    }

    /// Request a stop and wait up to `timeout` for the thread to exit
    ///
    /// Returns `false` if the thread was still running at the deadline; it is
    /// then detached and left to exit on its own.
    pub fn stop_within(&mut self, timeout: Duration) -> bool {
        self.request_stop();

        let Some(handle) = self.thread_handle.take() else {
            return true;
        };

        let deadline = Instant::now() + timeout;
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                warn!(name = %self.name, ?timeout, "Worker loop did not stop in time, detaching");
                return false;
            }
            thread::sleep(REAP_POLL_INTERVAL);
        }

        if let Err(e) = handle.join() {
            warn!(name = %self.name, "Worker loop thread panicked: {:?}", e);
        } else {
            debug!(name = %self.name, "Worker loop thread finished");
        }
        true
    }

}

impl Drop for LoopController {
    fn drop(&mut self) {
        if self.thread_handle.is_some() {
            debug!(name = %self.name, "LoopController dropped, stopping loop");
            self.stop_within(crate::constants::THREAD_JOIN_TIMEOUT);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn test_loop_stops_itself() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = Arc::clone(&counter);

        let mut controller = LoopController::start("test-loop", move || {
            let count = counter_clone.fetch_add(1, Ordering::SeqCst);
            if count >= 10 {
                LoopAction::Stop
            } else {
                LoopAction::Continue
            }
        });

        let deadline = Instant::now() + Duration::from_secs(2);
        while controller.is_running() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(!controller.is_running());
        assert_eq!(counter.load(Ordering::SeqCst), 11);
    }

    #[test]
    fn test_stop_within_joins_running_loop() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = Arc::clone(&counter);

        let mut controller = LoopController::start("test-loop", move || {
            counter_clone.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(5));
            LoopAction::Continue
        });

        thread::sleep(Duration::from_millis(30));
        assert!(controller.stop_within(Duration::from_secs(2)));
        assert!(!controller.is_running());
        assert!(counter.load(Ordering::SeqCst) > 0);
    }

    #[test]
    fn test_shared_signal_reaches_loop_body() {
        let signal = Arc::new(AtomicBool::new(false));
        let seen = Arc::new(AtomicBool::new(false));
        let (body_signal, body_seen) = (Arc::clone(&signal), Arc::clone(&seen));

        let mut controller = LoopController::with_signal("test-shared", signal, move || {
            // Blocks until the shared flag goes up, like a multi-step grab
            while !body_signal.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(2));
            }
            body_seen.store(true, Ordering::SeqCst);
            LoopAction::Continue
        });

        thread::sleep(Duration::from_millis(20));
        assert!(controller.stop_within(Duration::from_millis(500)));
        assert!(seen.load(Ordering::SeqCst));
    }

    #[test]
    fn test_stop_within_detaches_stuck_loop() {
        let mut controller = LoopController::start("test-stuck", || {
            thread::sleep(Duration::from_millis(400));
            LoopAction::Continue
        });

        thread::sleep(Duration::from_millis(20));
        let started = Instant::now();
        assert!(!controller.stop_within(Duration::from_millis(50)));
        assert!(started.elapsed() < Duration::from_millis(300));
    }
}
