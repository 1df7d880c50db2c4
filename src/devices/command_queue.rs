// SPDX-License-Identifier: GPL-3.0-only

//! Serialized register-level command dispatch
//!
//! Each register-capable device owns one [`HardwareCommandQueue`]. Commands run
//! strictly one at a time in submission order on a dedicated worker, with a
//! fixed pause after each one. A keyed submission supersedes any queued (not
//! yet executing) command with the same key, which keeps "set to latest value"
//! controls from replaying every intermediate value.

use crate::constants::HARDWARE_COMMAND_DELAY;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, warn};

/// A queued operation; `Err` or a panic is logged and reported as `None` to
/// the waiter
pub type CommandOp<T> = Box<dyn FnOnce() -> Result<T, String> + Send>;

struct QueuedCommand<T> {
    key: Option<String>,
    op: CommandOp<T>,
    reply: Option<SyncSender<Option<T>>>,
}

struct QueueState<T> {
    commands: VecDeque<QueuedCommand<T>>,
    running: bool,
}

struct Shared<T> {
    state: Mutex<QueueState<T>>,
    cond: Condvar,
}

pub struct HardwareCommandQueue<T: Send + 'static> {
    shared: Arc<Shared<T>>,
    worker: Option<JoinHandle<()>>,
    name: String,
}

impl<T: Send + 'static> HardwareCommandQueue<T> {
    /// Spawn the worker with the default inter-command delay
    pub fn new(name: &str) -> Self {
        Self::with_delay(name, HARDWARE_COMMAND_DELAY)
    }

    pub fn with_delay(name: &str, delay: Duration) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState {
                commands: VecDeque::new(),
                running: true,
            }),
            cond: Condvar::new(),
        });

        let worker_shared = Arc::clone(&shared);
        let worker_name = name.to_string();
        let worker = thread::Builder::new()
            .name(format!("hwcmd-{}", name))
            .spawn(move || worker_loop(worker_shared, worker_name, delay));

        let worker = match worker {
            Ok(handle) => Some(handle),
            Err(e) => {
                error!(name, error = %e, "Failed to spawn hardware command worker");
                shared.state.lock().unwrap().running = false;
                None
            }
        };

        Self {
            shared,
            worker,
            name: name.to_string(),
        }
    }

    /// Queue `op` for execution
    ///
    /// With a `key`, any queued command carrying the same key is dropped first
    /// and its waiter (if any) receives `None`. With `wait`, blocks the calling
    /// thread until the worker has run `op` and returns its result; otherwise
    /// returns `None` immediately.
    pub fn submit<F>(&self, key: Option<&str>, op: F, wait: bool) -> Option<T>
    where
        F: FnOnce() -> Result<T, String> + Send + 'static,
    {
        let (reply, receiver): (Option<SyncSender<Option<T>>>, Option<Receiver<Option<T>>>) =
            if wait {
                let (tx, rx) = mpsc::sync_channel(1);
                (Some(tx), Some(rx))
            } else {
                (None, None)
            };

        {
            let mut state = self.shared.state.lock().unwrap();
            if !state.running {
                warn!(name = %self.name, "Hardware command queue is shut down");
                return None;
            }

            if let Some(key) = key {
                let before = state.commands.len();
                state.commands.retain_mut(|queued| {
                    if queued.key.as_deref() != Some(key) {
                        return true;
                    }
                    if let Some(reply) = queued.reply.take() {
                        let _ = reply.send(None);
                    }
                    false
                });
                let superseded = before - state.commands.len();
                if superseded > 0 {
                    debug!(name = %self.name, key, superseded, "Superseded queued command");
                }
            }

            state.commands.push_back(QueuedCommand {
                key: key.map(str::to_string),
                op: Box::new(op),
                reply,
            });
            self.shared.cond.notify_one();
        }

        // A dropped sender (superseded or shutdown) counts as no result
        receiver.and_then(|rx| rx.recv().ok().flatten())
    }

    /// Commands queued but not yet picked up by the worker
    pub fn pending(&self) -> usize {
        self.shared.state.lock().unwrap().commands.len()
    }

    /// Stop the worker; queued commands are discarded and their waiters released
    pub fn shutdown(&mut self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.running = false;
            for queued in state.commands.drain(..) {
                if let Some(reply) = queued.reply {
                    let _ = reply.send(None);
                }
            }
            self.shared.cond.notify_all();
        }

        if let Some(handle) = self.worker.take()
            && handle.join().is_err()
        {
            warn!(name = %self.name, "Hardware command worker panicked");
        }
    }
}

impl<T: Send + 'static> Drop for HardwareCommandQueue<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop<T: Send>(shared: Arc<Shared<T>>, name: String, delay: Duration) {
    debug!(name = %name, "Hardware command worker started");

    loop {
        let command = {
            let mut state = shared.state.lock().unwrap();
            while state.commands.is_empty() && state.running {
                state = shared.cond.wait(state).unwrap();
            }
            if !state.running {
                break;
            }
            state.commands.pop_front()
        };

        let Some(command) = command else {
            continue;
        };

        let key = command.key.as_deref().unwrap_or("-");
        let result = match panic::catch_unwind(AssertUnwindSafe(command.op)) {
            Ok(Ok(value)) => Some(value),
            Ok(Err(e)) => {
                error!(name = %name, key, error = %e, "Hardware command failed");
                None
            }
            Err(payload) => {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_default();
                error!(name = %name, key, panic = %message, "Hardware command panicked");
                None
            }
        };

        if let Some(reply) = command.reply {
            let _ = reply.send(result);
        }

        thread::sleep(delay);
    }

    debug!(name = %name, "Hardware command worker exiting");
}
