// SPDX-License-Identifier: GPL-3.0-only

//! Camera lifecycle management
//!
//! [`CameraManager`] owns the device handle: it is the only component that
//! opens, restarts or releases it. Other components either consume frames
//! from the shared [`FrameBuffer`] or borrow the handle slot under the
//! operation lock.
//!
//! Locking protocol: `op_lock` serializes open/close/restart/settings
//! transitions. The capture loop takes it with `try_lock` each tick, so a
//! coordinator holding it (a photo capture, for example) pauses capture
//! without any extra signalling. The handle slot mutex is only ever taken
//! by a thread that holds `op_lock`, which rules out lock-order inversions.

use crate::constants::{capture, photo};
use crate::device::{CameraSource, CaptureBackend, CaptureDevice, SharedDevice};
use crate::errors::{CameraError, CameraResult};
use crate::frame::{Frame, FrameBuffer};
use crate::retry::RetryPolicy;
use crate::settings::{self, Profile, SettingsProvider};
use crate::worker::{LoopAction, LoopController, sleep_interruptible};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Owns the capture device and the loop that keeps the frame buffer warm
pub struct CameraManager {
    backend: Arc<dyn CaptureBackend>,
    source: CameraSource,
    policy: RetryPolicy,
    settings: Arc<dyn SettingsProvider>,
    buffer: Arc<FrameBuffer>,
    op_lock: Arc<Mutex<()>>,
    handle: SharedDevice,
    capture_loop: Mutex<Option<LoopController>>,
}

impl CameraManager {
    pub fn new(
        backend: Arc<dyn CaptureBackend>,
        source: CameraSource,
        settings: Arc<dyn SettingsProvider>,
    ) -> Self {
        Self::with_policy(backend, source, settings, RetryPolicy::default())
    }

    pub fn with_policy(
        backend: Arc<dyn CaptureBackend>,
        source: CameraSource,
        settings: Arc<dyn SettingsProvider>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            backend,
            source,
            policy,
            settings,
            buffer: Arc::new(FrameBuffer::new()),
            op_lock: Arc::new(Mutex::new(())),
            handle: Arc::new(Mutex::new(None)),
            capture_loop: Mutex::new(None),
        }
    }

    pub fn source(&self) -> &CameraSource {
        &self.source
    }

    /// Buffer the capture loop publishes into
    pub fn buffer(&self) -> Arc<FrameBuffer> {
        Arc::clone(&self.buffer)
    }

    /// Handle slot for sessions that borrow the open device
    pub fn shared_handle(&self) -> SharedDevice {
        Arc::clone(&self.handle)
    }

    /// Lock serializing device lifecycle transitions. Coordinators hold it
    /// across a pause-work-resume span.
    pub fn op_lock(&self) -> Arc<Mutex<()>> {
        Arc::clone(&self.op_lock)
    }

    /// Whether an open handle currently exists
    pub fn is_available(&self) -> bool {
        self.handle
            .lock()
            .unwrap()
            .as_ref()
            .map(|d| d.is_open())
            .unwrap_or(false)
    }

    /// Whether the capture loop thread is alive
    pub fn is_capturing(&self) -> bool {
        self.capture_loop
            .lock()
            .unwrap()
            .as_ref()
            .map(|c| c.is_running())
            .unwrap_or(false)
    }

    pub fn last_frame_age(&self) -> Option<Duration> {
        self.buffer.age()
    }

    /// Open the device, retrying per the policy. Idempotent.
    pub fn open(&self) -> CameraResult<()> {
        let _op = self.op_lock.lock().unwrap();
        self.open_inner(None)
    }

    /// Open without taking `op_lock`; the caller must hold it
    pub(crate) fn open_inner(&self, stop: Option<&AtomicBool>) -> CameraResult<()> {
        {
            let slot = self.handle.lock().unwrap();
            if slot.as_ref().map(|d| d.is_open()).unwrap_or(false) {
                return Ok(());
            }
        }

        let mut dev = open_with_retries(self.backend.as_ref(), &self.source, &self.policy, stop)?;
        settings::apply_profile(dev.as_mut(), &self.settings.snapshot(), Profile::Video);
        *self.handle.lock().unwrap() = Some(dev);
        info!(source = %self.source, "camera opened");
        Ok(())
    }

    /// Release and reopen the device
    pub fn restart(&self) -> CameraResult<()> {
        let _op = self.op_lock.lock().unwrap();
        self.restart_inner(None)
    }

    pub(crate) fn restart_inner(&self, stop: Option<&AtomicBool>) -> CameraResult<()> {
        info!(source = %self.source, "restarting camera");
        self.release_inner();
        settle(capture::RELEASE_SETTLE, stop);
        self.open_inner(stop)
    }

    /// Release the handle; the caller must hold `op_lock`
    pub(crate) fn release_inner(&self) {
        if let Some(mut dev) = self.handle.lock().unwrap().take() {
            dev.release();
            debug!(source = %self.source, "camera handle released");
        }
        self.buffer.clear();
    }

    /// Start the capture loop, opening the device first if needed.
    /// Calling it again while the loop runs is a no-op.
    pub fn start(&self) -> CameraResult<()> {
        self.open()?;

        let mut guard = self.capture_loop.lock().unwrap();
        if guard.as_ref().map(|c| c.is_running()).unwrap_or(false) {
            debug!(source = %self.source, "capture loop already running");
            return Ok(());
        }

        let mut ctx = CaptureCtx {
            backend: Arc::clone(&self.backend),
            source: self.source.clone(),
            policy: self.policy,
            settings: Arc::clone(&self.settings),
            buffer: Arc::clone(&self.buffer),
            op_lock: Arc::clone(&self.op_lock),
            handle: Arc::clone(&self.handle),
            consecutive_failures: 0,
        };
        *guard = Some(LoopController::start("capture", move |stop| {
            ctx.tick(stop)
        }));
        info!(source = %self.source, "capture loop started");
        Ok(())
    }

    /// Stop the capture loop and release the device
    pub fn stop(&self) {
        if let Some(mut controller) = self.capture_loop.lock().unwrap().take() {
            controller.stop(crate::constants::shutdown::JOIN_TIMEOUT);
        }
        let _op = self.op_lock.lock().unwrap();
        self.release_inner();
        info!(source = %self.source, "camera stopped");
    }

    /// Apply a settings profile to the open handle, if any. The caller must
    /// hold `op_lock`.
    pub(crate) fn apply_settings_inner(&self, profile: Profile) {
        if let Some(dev) = self.handle.lock().unwrap().as_mut() {
            settings::apply_profile(dev.as_mut(), &self.settings.snapshot(), profile);
        }
    }

    /// Read frames straight off the handle, discarding warmup frames first.
    /// Used for stills; the caller must hold `op_lock`.
    pub(crate) fn read_direct(&self, warmup: u32, attempts: u32) -> CameraResult<Frame> {
        let mut slot = self.handle.lock().unwrap();
        let dev = slot.as_mut().ok_or_else(|| {
            CameraError::DeviceUnavailable(format!("{} not open", self.source))
        })?;

        for _ in 0..warmup {
            if let Err(e) = dev.read_frame() {
                debug!(error = %e, "warmup read failed");
            }
        }

        let mut last_err = CameraError::ReadFailure("no attempts made".into());
        for attempt in 1..=attempts {
            match dev.read_frame() {
                Ok(frame) => return Ok(frame),
                Err(e) => {
                    warn!(attempt, error = %e, "direct read failed");
                    last_err = e;
                    if attempt < attempts {
                        std::thread::sleep(photo::READ_RETRY_PAUSE);
                    }
                }
            }
        }
        Err(last_err)
    }
}

impl Drop for CameraManager {
    fn drop(&mut self) {
        self.stop();
    }
}

/// State captured by the loop thread
struct CaptureCtx {
    backend: Arc<dyn CaptureBackend>,
    source: CameraSource,
    policy: RetryPolicy,
    settings: Arc<dyn SettingsProvider>,
    buffer: Arc<FrameBuffer>,
    op_lock: Arc<Mutex<()>>,
    handle: SharedDevice,
    consecutive_failures: u32,
}

impl CaptureCtx {
    fn tick(&mut self, stop: &AtomicBool) -> LoopAction {
        // A held op_lock means someone is transitioning the device; yield
        let Ok(op) = self.op_lock.try_lock() else {
            sleep_interruptible(stop, capture::FRAME_INTERVAL);
            return LoopAction::Continue;
        };

        let result = {
            let mut slot = self.handle.lock().unwrap();
            match slot.as_mut() {
                Some(dev) => dev.read_frame(),
                None => Err(CameraError::DeviceUnavailable(format!(
                    "{} not open",
                    self.source
                ))),
            }
        };

        match result {
            Ok(frame) => {
                self.consecutive_failures = 0;
                self.buffer.store(frame);
                drop(op);
                sleep_interruptible(stop, capture::FRAME_INTERVAL);
            }
            Err(e) => {
                self.consecutive_failures += 1;
                warn!(
                    source = %self.source,
                    failures = self.consecutive_failures,
                    error = %e,
                    "frame read failed"
                );
                if self.consecutive_failures >= capture::READ_FAILURE_THRESHOLD {
                    // Still holding op, so nobody else can touch the handle
                    if let Err(e) = self.reopen(stop) {
                        error!(source = %self.source, error = %e, "reopen failed, will keep trying");
                    } else {
                        self.consecutive_failures = 0;
                    }
                } else {
                    drop(op);
                    sleep_interruptible(stop, capture::READ_RETRY_PAUSE);
                }
            }
        }

        if stop.load(Ordering::SeqCst) {
            LoopAction::Stop
        } else {
            LoopAction::Continue
        }
    }

    fn reopen(&self, stop: &AtomicBool) -> CameraResult<()> {
        if let Some(mut dev) = self.handle.lock().unwrap().take() {
            dev.release();
        }
        self.buffer.clear();
        settle(capture::RELEASE_SETTLE, Some(stop));

        let mut dev = open_with_retries(self.backend.as_ref(), &self.source, &self.policy, Some(stop))?;
        settings::apply_profile(dev.as_mut(), &self.settings.snapshot(), Profile::Video);
        *self.handle.lock().unwrap() = Some(dev);
        info!(source = %self.source, "camera reopened after read failures");
        Ok(())
    }
}

fn settle(duration: Duration, stop: Option<&AtomicBool>) {
    match stop {
        Some(stop) => sleep_interruptible(stop, duration),
        None => std::thread::sleep(duration),
    }
}

/// Open a device with the policy's schedule. Every successful open is
/// verified with a test read before it counts; a handle that opens but
/// cannot produce frames is released and retried.
pub(crate) fn open_with_retries(
    backend: &dyn CaptureBackend,
    source: &CameraSource,
    policy: &RetryPolicy,
    stop: Option<&AtomicBool>,
) -> CameraResult<Box<dyn CaptureDevice>> {
    let mut last_err = CameraError::DeviceUnavailable(format!("{}: no attempts made", source));

    for attempt in 0..policy.max_attempts {
        if let Some(stop) = stop
            && stop.load(Ordering::SeqCst)
        {
            return Err(CameraError::DeviceUnavailable(format!(
                "{}: open interrupted by shutdown",
                source
            )));
        }

        match backend.open(source) {
            Ok(mut dev) => match dev.read_frame() {
                Ok(_) => {
                    debug!(%source, attempt = attempt + 1, "open verified with test read");
                    return Ok(dev);
                }
                Err(e) => {
                    warn!(%source, error = %e, "opened but test read failed, releasing");
                    dev.release();
                    last_err = e;
                }
            },
            Err(e) => {
                warn!(%source, attempt = attempt + 1, error = %e, "open failed");
                last_err = e;
            }
        }

        if attempt + 1 < policy.max_attempts {
            settle(policy.delay_for(attempt), stop);
        }
    }

    error!(%source, attempts = policy.max_attempts, "giving up on open");
    Err(last_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::virtual_dev::{VirtualBackend, VirtualConfig};
    use crate::settings::{CaptureSettings, StaticSettings};

    fn fast_policy() -> RetryPolicy {
        RetryPolicy::fixed(5, Duration::from_millis(5))
    }

    fn manager_with(config: VirtualConfig) -> (Arc<VirtualBackend>, CameraManager) {
        let backend = Arc::new(VirtualBackend::new(config));
        let manager = CameraManager::with_policy(
            Arc::clone(&backend) as Arc<dyn CaptureBackend>,
            CameraSource::Index(0),
            Arc::new(StaticSettings(CaptureSettings::default())),
            fast_policy(),
        );
        (backend, manager)
    }

    #[test]
    fn open_retries_until_success() {
        let (backend, manager) = manager_with(VirtualConfig {
            fail_first_opens: 2,
            ..Default::default()
        });
        manager.open().unwrap();
        assert!(manager.is_available());
        assert_eq!(backend.opens_attempted(), 3);
    }

    #[test]
    fn open_gives_up_after_budget() {
        let (backend, manager) = manager_with(VirtualConfig {
            fail_first_opens: 100,
            ..Default::default()
        });
        assert!(manager.open().is_err());
        assert!(!manager.is_available());
        assert_eq!(backend.opens_attempted(), 5);
    }

    #[test]
    fn open_is_idempotent() {
        let (backend, manager) = manager_with(VirtualConfig::default());
        manager.open().unwrap();
        manager.open().unwrap();
        assert_eq!(backend.live_sessions(), 1);
        assert_eq!(backend.opens_attempted(), 1);
    }

    #[test]
    fn capture_loop_fills_the_buffer() {
        let (_backend, manager) = manager_with(VirtualConfig::default());
        manager.start().unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while manager.buffer().latest().is_none() {
            assert!(std::time::Instant::now() < deadline, "no frame arrived");
            std::thread::sleep(Duration::from_millis(10));
        }

        manager.stop();
        assert!(!manager.is_capturing());
        assert!(manager.buffer().latest().is_none());
    }

    #[test]
    fn stop_releases_the_handle() {
        let (backend, manager) = manager_with(VirtualConfig::default());
        manager.start().unwrap();
        manager.stop();
        assert_eq!(backend.live_sessions(), 0);
        assert!(!manager.is_available());
    }

    #[test]
    fn at_most_one_live_session_across_restart() {
        let (backend, manager) = manager_with(VirtualConfig::default());
        manager.open().unwrap();
        manager.restart().unwrap();
        manager.restart().unwrap();
        assert_eq!(backend.peak_sessions(), 1);
        assert_eq!(backend.live_sessions(), 1);
    }

    #[test]
    fn read_failures_trigger_a_reopen() {
        let (backend, manager) = manager_with(VirtualConfig {
            // test read consumes one, a few good frames, then failures
            fail_reads_after: Some(3),
            frame_interval: Duration::from_millis(1),
            ..Default::default()
        });
        manager.start().unwrap();

        // Reopen resets the per-handle counter, so sessions accumulate
        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        while backend.releases() < 1 {
            assert!(std::time::Instant::now() < deadline, "no reopen happened");
            std::thread::sleep(Duration::from_millis(20));
        }

        manager.stop();
        assert_eq!(backend.live_sessions(), 0);
        assert!(backend.peak_sessions() <= 1);
    }
}
