// SPDX-License-Identifier: GPL-3.0-only

//! Periodic photo capture
//!
//! A thin scheduler on top of the photo coordinator. Settings are re-read
//! every tick, so enabling timelapse or changing the interval takes effect
//! without a restart. Capture failures are logged and the schedule simply
//! continues; device recovery is the coordinator's and watchdog's job.

use crate::constants::shutdown;
use crate::photo::{PhotoCaptureCoordinator, PhotoMode};
use crate::settings::SettingsProvider;
use crate::worker::{LoopAction, LoopController, sleep_interruptible};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// How often to re-check settings while timelapse is disabled
const DISABLED_POLL: Duration = Duration::from_secs(10);

pub struct TimelapseScheduler {
    coordinator: Arc<PhotoCaptureCoordinator>,
    settings: Arc<dyn SettingsProvider>,
    /// Test hook: fixed interval instead of the configured minutes
    interval_override: Option<Duration>,
    disabled_poll: Duration,
    controller: Mutex<Option<LoopController>>,
    captures: Arc<AtomicU32>,
    failures: Arc<AtomicU32>,
}

impl TimelapseScheduler {
    pub fn new(
        coordinator: Arc<PhotoCaptureCoordinator>,
        settings: Arc<dyn SettingsProvider>,
    ) -> Self {
        Self {
            coordinator,
            settings,
            interval_override: None,
            disabled_poll: DISABLED_POLL,
            controller: Mutex::new(None),
            captures: Arc::new(AtomicU32::new(0)),
            failures: Arc::new(AtomicU32::new(0)),
        }
    }

    #[cfg(test)]
    fn with_timing(mut self, interval: Duration, disabled_poll: Duration) -> Self {
        self.interval_override = Some(interval);
        self.disabled_poll = disabled_poll;
        self
    }

    pub fn captures_taken(&self) -> u32 {
        self.captures.load(Ordering::SeqCst)
    }

    pub fn failures(&self) -> u32 {
        self.failures.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.controller
            .lock()
            .unwrap()
            .as_ref()
            .map(|c| c.is_running())
            .unwrap_or(false)
    }

    pub fn start(&self) {
        let mut guard = self.controller.lock().unwrap();
        if guard.as_ref().map(|c| c.is_running()).unwrap_or(false) {
            return;
        }

        let coordinator = Arc::clone(&self.coordinator);
        let settings = Arc::clone(&self.settings);
        let interval_override = self.interval_override;
        let disabled_poll = self.disabled_poll;
        let captures = Arc::clone(&self.captures);
        let failures = Arc::clone(&self.failures);

        *guard = Some(LoopController::start("timelapse", move |stop| {
            let timelapse = settings.snapshot().timelapse;
            if !timelapse.enabled {
                sleep_interruptible(stop, disabled_poll);
                return LoopAction::Continue;
            }

            match coordinator.capture(PhotoMode::Timelapse) {
                Ok(path) => {
                    captures.fetch_add(1, Ordering::SeqCst);
                    info!(path = %path.display(), "timelapse photo taken");
                }
                Err(e) if e.is_recoverable() => {
                    failures.fetch_add(1, Ordering::SeqCst);
                    warn!(error = %e, "timelapse capture failed, keeping schedule");
                }
                Err(e) => {
                    failures.fetch_add(1, Ordering::SeqCst);
                    // Device recovery cannot fix an encoder or disk problem
                    error!(error = %e, "timelapse capture failed");
                }
            }

            let interval = interval_override.unwrap_or_else(|| {
                Duration::from_secs(u64::from(timelapse.clamped_interval_min()) * 60)
            });
            debug!(?interval, "next timelapse capture scheduled");
            sleep_interruptible(stop, interval);
            LoopAction::Continue
        }));
        info!("timelapse scheduler started");
    }

    pub fn stop(&self) {
        if let Some(mut controller) = self.controller.lock().unwrap().take() {
            controller.stop(shutdown::JOIN_TIMEOUT);
            info!("timelapse scheduler stopped");
        }
    }
}

impl Drop for TimelapseScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}
