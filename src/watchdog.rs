// SPDX-License-Identifier: GPL-3.0-only

//! Health monitoring and escalation
//!
//! The watchdog periodically diagnoses a monitored target and tries one
//! repair per unhealthy tick. Repairs that keep failing escalate to an
//! out-of-band device reset, rate-limited so a dead camera cannot put the
//! USB port into a reset loop.

use crate::constants::{shutdown, watchdog};
use crate::device::CameraSource;
use crate::device::reset::ResetFacility;
use crate::errors::CameraResult;
use crate::worker::{LoopAction, LoopController, sleep_interruptible};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Something the watchdog can check and fix
pub trait Monitored: Send + Sync {
    /// `None` when healthy, otherwise what is wrong
    fn diagnose(&self) -> Option<String>;

    /// Try to bring the target back to a healthy state
    fn repair(&self) -> CameraResult<()>;
}

#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    pub check_interval: Duration,
    /// Consecutive failed repairs before a device reset
    pub escalation_threshold: u32,
    /// Minimum spacing between device resets
    pub reset_cooldown: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            check_interval: watchdog::CHECK_INTERVAL,
            escalation_threshold: watchdog::ESCALATION_THRESHOLD,
            reset_cooldown: watchdog::RESET_COOLDOWN,
        }
    }
}

pub struct Watchdog {
    target: Arc<dyn Monitored>,
    source: CameraSource,
    reset: Arc<dyn ResetFacility>,
    config: WatchdogConfig,
    controller: Mutex<Option<LoopController>>,
    repairs_attempted: Arc<AtomicU32>,
    resets_performed: Arc<AtomicU32>,
}

impl Watchdog {
    pub fn new(
        target: Arc<dyn Monitored>,
        source: CameraSource,
        reset: Arc<dyn ResetFacility>,
        config: WatchdogConfig,
    ) -> Self {
        Self {
            target,
            source,
            reset,
            config,
            controller: Mutex::new(None),
            repairs_attempted: Arc::new(AtomicU32::new(0)),
            resets_performed: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn repairs_attempted(&self) -> u32 {
        self.repairs_attempted.load(Ordering::SeqCst)
    }

    pub fn resets_performed(&self) -> u32 {
        self.resets_performed.load(Ordering::SeqCst)
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

        let mut ctx = WatchdogCtx {
            target: Arc::clone(&self.target),
            source: self.source.clone(),
            reset: Arc::clone(&self.reset),
            config: self.config.clone(),
            repairs_attempted: Arc::clone(&self.repairs_attempted),
            resets_performed: Arc::clone(&self.resets_performed),
            consecutive_failures: 0,
            last_reset: None,
        };
        *guard = Some(LoopController::start("watchdog", move |stop| ctx.tick(stop)));
        info!(source = %self.source, "watchdog started");
    }

    pub fn stop(&self) {
        if let Some(mut controller) = self.controller.lock().unwrap().take() {
            controller.stop(shutdown::JOIN_TIMEOUT);
            info!(source = %self.source, "watchdog stopped");
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.stop();
    }
}

struct WatchdogCtx {
    target: Arc<dyn Monitored>,
    source: CameraSource,
    reset: Arc<dyn ResetFacility>,
    config: WatchdogConfig,
    repairs_attempted: Arc<AtomicU32>,
    resets_performed: Arc<AtomicU32>,
    consecutive_failures: u32,
    last_reset: Option<Instant>,
}

impl WatchdogCtx {
    fn tick(&mut self, stop: &std::sync::atomic::AtomicBool) -> LoopAction {
        match self.target.diagnose() {
            None => {
                self.consecutive_failures = 0;
            }
            Some(problem) => {
                warn!(source = %self.source, %problem, "unhealthy, attempting repair");
                self.repairs_attempted.fetch_add(1, Ordering::SeqCst);

                let repaired = match self.target.repair() {
                    Ok(()) => self.target.diagnose().is_none(),
                    Err(e) => {
                        warn!(source = %self.source, error = %e, "repair failed");
                        false
                    }
                };

                if repaired {
                    info!(source = %self.source, "repair succeeded");
                    self.consecutive_failures = 0;
                } else {
                    self.consecutive_failures += 1;
                    if self.consecutive_failures >= self.config.escalation_threshold {
                        self.escalate();
                    }
                }
            }
        }

        sleep_interruptible(stop, self.config.check_interval);
        LoopAction::Continue
    }

    fn escalate(&mut self) {
        let cooled_down = self
            .last_reset
            .map(|at| at.elapsed() >= self.config.reset_cooldown)
            .unwrap_or(true);
        if !cooled_down {
            return;
        }

        warn!(
            source = %self.source,
            failures = self.consecutive_failures,
            "escalating to device reset"
        );
        match self.reset.reset(&self.source) {
            Ok(()) => {
                self.resets_performed.fetch_add(1, Ordering::SeqCst);
                self.consecutive_failures = 0;
            }
            Err(e) => {
                error!(source = %self.source, error = %e, "device reset failed");
            }
        }
        self.last_reset = Some(Instant::now());
    }
}
