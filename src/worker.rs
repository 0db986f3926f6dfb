// SPDX-License-Identifier: GPL-3.0-only

//! Thread lifecycle management for service loops
//!
//! Capture, streaming, recording, watchdog and timelapse loops all run on
//! plain OS threads with the same lifecycle: spawn, iterate until a stop
//! signal or the loop bows out, join with a timeout. This module keeps that
//! handling in one place so every loop stops the same way.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Action returned by a loop body to control further iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopAction {
    /// Run another iteration
    Continue,
    /// Exit the loop gracefully
    Stop,
}

/// Sleep in small slices so a stop signal interrupts the wait promptly
pub fn sleep_interruptible(stop: &AtomicBool, total: Duration) {
    const SLICE: Duration = Duration::from_millis(50);
    let deadline = Instant::now() + total;
    while Instant::now() < deadline {
        if stop.load(Ordering::SeqCst) {
            return;
        }
        thread::sleep(SLICE.min(deadline.saturating_duration_since(Instant::now())));
    }
}

/// Controller for a loop running on its own thread
pub struct LoopController {
    thread_handle: Option<JoinHandle<()>>,
    stop_signal: Arc<AtomicBool>,
    name: String,
}

impl LoopController {
    /// Spawn a thread that calls `loop_fn` until it returns
    /// [`LoopAction::Stop`] or [`stop`](Self::stop) is called.
    pub fn start<F>(name: &str, mut loop_fn: F) -> Self
    where
        F: FnMut(&AtomicBool) -> LoopAction + Send + 'static,
    {
        let stop_signal = Arc::new(AtomicBool::new(false));
        let stop_clone = Arc::clone(&stop_signal);
        let thread_name = name.to_string();

        debug!(name = %name, "starting worker loop");
        let thread_handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                loop {
                    if stop_clone.load(Ordering::SeqCst) {
                        break;
                    }
                    match loop_fn(&stop_clone) {
                        LoopAction::Continue => {}
                        LoopAction::Stop => break,
                    }
                }
                debug!(name = %thread_name, "worker loop exiting");
            })
            .expect("spawning a named thread cannot fail on supported platforms");

        Self {
            thread_handle: Some(thread_handle),
            stop_signal,
            name: name.to_string(),
        }
    }

    /// Spawn a loop whose thread first runs `init_fn` to build its state.
    /// When init fails the thread logs and exits without iterating.
    pub fn start_with_init<S, I, F>(name: &str, init_fn: I, mut loop_fn: F) -> Self
    where
        S: Send + 'static,
        I: FnOnce(&AtomicBool) -> Result<S, String> + Send + 'static,
        F: FnMut(&mut S, &AtomicBool) -> LoopAction + Send + 'static,
    {
        let stop_signal = Arc::new(AtomicBool::new(false));
        let stop_clone = Arc::clone(&stop_signal);
        let thread_name = name.to_string();

        debug!(name = %name, "starting worker loop with init");
        let thread_handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let mut state = match init_fn(&stop_clone) {
                    Ok(s) => s,
                    Err(e) => {
                        warn!(name = %thread_name, error = %e, "worker init failed");
                        return;
                    }
                };
                loop {
                    if stop_clone.load(Ordering::SeqCst) {
                        break;
                    }
                    match loop_fn(&mut state, &stop_clone) {
                        LoopAction::Continue => {}
                        LoopAction::Stop => break,
                    }
                }
                debug!(name = %thread_name, "worker loop exiting");
            })
            .expect("spawning a named thread cannot fail on supported platforms");

        Self {
            thread_handle: Some(thread_handle),
            stop_signal,
            name: name.to_string(),
        }
    }

    /// Whether the loop thread is still alive
    pub fn is_running(&self) -> bool {
        self.thread_handle
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Clone of the stop signal, for loops that need to check it inside
    /// long-running operations
    pub fn stop_signal(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop_signal)
    }

    /// Set the stop signal without waiting
    pub fn request_stop(&self) {
        self.stop_signal.store(true, Ordering::SeqCst);
    }

    /// Signal the loop and wait up to `timeout` for the thread to exit.
    /// Returns false when the budget ran out and the thread was detached;
    /// cleanup then proceeds best-effort rather than hanging the caller.
    pub fn stop(&mut self, timeout: Duration) -> bool {
        self.request_stop();
        self.join_timeout(timeout)
    }

    /// Wait up to `timeout` for the thread without signalling it
    pub fn join_timeout(&mut self, timeout: Duration) -> bool {
        let Some(handle) = self.thread_handle.take() else {
            return true;
        };
        let deadline = Instant::now() + timeout;
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                warn!(name = %self.name, ?timeout, "worker did not stop in time, detaching");
                return false;
            }
            thread::sleep(Duration::from_millis(10));
        }
        if handle.join().is_err() {
            warn!(name = %self.name, "worker thread panicked");
        }
        true
    }
}

impl Drop for LoopController {
    fn drop(&mut self) {
        if self.thread_handle.is_some() {
            info!(name = %self.name, "controller dropped, stopping loop");
            self.stop(Duration::from_secs(2));
        }
    }
}
