// SPDX-License-Identifier: GPL-3.0-only

//! Continuous streaming sessions
//!
//! A [`StreamSession`] pulls frames on its own thread and publishes them to
//! a frame buffer plus an optional extra sink. It either borrows the
//! manager's shared handle or owns a private device that lives and dies
//! with the session thread.
//!
//! A borrowed handle is never released here; recovery of a broken shared
//! device is the manager's job and the session just backs off until frames
//! flow again. An owned device is reopened by the session itself, with a
//! bounded backoff schedule; when the schedule is exhausted the session
//! stops and stays stopped until something restarts it.

use crate::constants::{capture, shutdown};
use crate::device::{CameraSource, CaptureBackend, CaptureDevice, SharedDevice};
use crate::errors::CameraError;
use crate::frame::{Frame, FrameBuffer};
use crate::manager::open_with_retries;
use crate::retry::RetryPolicy;
use crate::settings::{self, Profile, SettingsProvider};
use crate::worker::{LoopAction, LoopController, sleep_interruptible};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Consumer of streamed frames
pub trait FrameSink: Send + Sync {
    fn on_frame(&self, frame: Frame);
}

impl FrameSink for FrameBuffer {
    fn on_frame(&self, frame: Frame) {
        self.store(frame);
    }
}

/// Where a session gets its frames from
#[derive(Clone)]
pub enum StreamSource {
    /// Borrow the manager's open handle; no ownership, no release
    Shared(SharedDevice),
    /// Open and own a private device for the lifetime of the session
    Owned {
        backend: Arc<dyn CaptureBackend>,
        source: CameraSource,
    },
}

pub struct StreamSession {
    name: String,
    source: StreamSource,
    policy: RetryPolicy,
    frame_interval: Duration,
    buffer: Arc<FrameBuffer>,
    extra_sink: Option<Arc<dyn FrameSink>>,
    /// Applied to an owned device after every open; borrowed handles are
    /// configured by their owner
    settings: Option<Arc<dyn SettingsProvider>>,
    controller: Mutex<Option<LoopController>>,
    retry_count: Arc<AtomicU32>,
    /// Set when an owned session exhausted its reconnect budget
    failed: Arc<AtomicBool>,
}

impl StreamSession {
    pub fn new(name: &str, source: StreamSource) -> Self {
        Self {
            name: name.to_string(),
            source,
            policy: RetryPolicy::default(),
            frame_interval: capture::FRAME_INTERVAL,
            buffer: Arc::new(FrameBuffer::new()),
            extra_sink: None,
            settings: None,
            controller: Mutex::new(None),
            retry_count: Arc::new(AtomicU32::new(0)),
            failed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_frame_interval(mut self, interval: Duration) -> Self {
        self.frame_interval = interval;
        self
    }

    /// Attach an extra consumer called for every frame, after the buffer
    /// update. A panicking sink is logged and skipped, never fatal.
    pub fn with_sink(mut self, sink: Arc<dyn FrameSink>) -> Self {
        self.extra_sink = Some(sink);
        self
    }

    /// Apply the video profile from this provider after every successful
    /// open of an owned device. Ignored for shared sources.
    pub fn with_settings(mut self, settings: Arc<dyn SettingsProvider>) -> Self {
        self.settings = Some(settings);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Copy of the latest streamed frame
    pub fn get_frame(&self) -> Option<Frame> {
        self.buffer.latest()
    }

    pub fn last_frame_age(&self) -> Option<Duration> {
        self.buffer.age()
    }

    /// Read failures and reconnect attempts since the session started
    pub fn retry_count(&self) -> u32 {
        self.retry_count.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.controller
            .lock()
            .unwrap()
            .as_ref()
            .map(|c| c.is_running())
            .unwrap_or(false)
    }

    /// Whether the session gave up after exhausting its reconnect budget
    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    /// Start the pull loop. A second call while running is a no-op.
    pub fn start(&self) {
        let mut guard = self.controller.lock().unwrap();
        if guard.as_ref().map(|c| c.is_running()).unwrap_or(false) {
            debug!(name = %self.name, "stream already running");
            return;
        }

        self.retry_count.store(0, Ordering::SeqCst);
        self.failed.store(false, Ordering::SeqCst);
        let thread_name = format!("stream-{}", self.name);

        let controller = match &self.source {
            StreamSource::Shared(handle) => {
                let mut ctx = SharedCtx {
                    name: self.name.clone(),
                    handle: Arc::clone(handle),
                    buffer: Arc::clone(&self.buffer),
                    extra_sink: self.extra_sink.clone(),
                    frame_interval: self.frame_interval,
                    policy: self.policy,
                    retry_count: Arc::clone(&self.retry_count),
                    failures: 0,
                };
                LoopController::start(&thread_name, move |stop| ctx.tick(stop))
            }
            StreamSource::Owned { backend, source } => {
                let init_backend = Arc::clone(backend);
                let init_source = source.clone();
                let init_policy = self.policy;
                let init_settings = self.settings.clone();
                let mut ctx = OwnedCtx {
                    name: self.name.clone(),
                    backend: Arc::clone(backend),
                    source: source.clone(),
                    buffer: Arc::clone(&self.buffer),
                    extra_sink: self.extra_sink.clone(),
                    settings: self.settings.clone(),
                    frame_interval: self.frame_interval,
                    policy: self.policy,
                    retry_count: Arc::clone(&self.retry_count),
                    failed: Arc::clone(&self.failed),
                    failures: 0,
                };
                LoopController::start_with_init(
                    &thread_name,
                    move |stop| {
                        let mut dev = open_with_retries(
                            init_backend.as_ref(),
                            &init_source,
                            &init_policy,
                            Some(stop),
                        )
                        .map_err(|e| e.to_string())?;
                        if let Some(provider) = &init_settings {
                            settings::apply_profile(
                                dev.as_mut(),
                                &provider.snapshot(),
                                Profile::Video,
                            );
                        }
                        Ok(dev)
                    },
                    // The device is dropped (and released) on the session
                    // thread when the loop exits
                    move |dev, stop| ctx.tick(dev, stop),
                )
            }
        };

        *guard = Some(controller);
        info!(name = %self.name, "stream started");
    }

    /// Stop the loop and wait for the thread. Safe to call repeatedly.
    pub fn stop(&self) {
        if let Some(mut controller) = self.controller.lock().unwrap().take() {
            controller.stop(shutdown::JOIN_TIMEOUT);
            info!(name = %self.name, "stream stopped");
        }
    }

    /// Stop, wait a moment, start again
    pub fn restart(&self) {
        info!(name = %self.name, "restarting stream");
        self.stop();
        std::thread::sleep(shutdown::RESTART_DELAY);
        self.start();
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        self.stop();
    }
}

fn publish(
    name: &str,
    frame: Frame,
    buffer: &FrameBuffer,
    extra_sink: &Option<Arc<dyn FrameSink>>,
) {
    buffer.store(frame.clone());
    if let Some(sink) = extra_sink {
        let result = std::panic::catch_unwind(AssertUnwindSafe(|| sink.on_frame(frame)));
        if result.is_err() {
            error!(name, "frame sink panicked, frame dropped");
        }
    }
}

struct SharedCtx {
    name: String,
    handle: SharedDevice,
    buffer: Arc<FrameBuffer>,
    extra_sink: Option<Arc<dyn FrameSink>>,
    frame_interval: Duration,
    policy: RetryPolicy,
    retry_count: Arc<AtomicU32>,
    failures: u32,
}

impl SharedCtx {
    fn tick(&mut self, stop: &AtomicBool) -> LoopAction {
        let result = {
            let mut slot = self.handle.lock().unwrap();
            match slot.as_mut() {
                Some(dev) => dev.read_frame(),
                None => Err(CameraError::DeviceUnavailable("handle slot empty".into())),
            }
        };

        match result {
            Ok(frame) => {
                self.failures = 0;
                publish(&self.name, frame, &self.buffer, &self.extra_sink);
                sleep_interruptible(stop, self.frame_interval);
            }
            Err(e) => {
                self.retry_count.fetch_add(1, Ordering::SeqCst);
                let delay = self.policy.delay_for(self.failures.min(16));
                self.failures = self.failures.saturating_add(1);
                debug!(name = %self.name, error = %e, ?delay, "shared read failed, backing off");
                sleep_interruptible(stop, delay);
            }
        }
        LoopAction::Continue
    }
}

struct OwnedCtx {
    name: String,
    backend: Arc<dyn CaptureBackend>,
    source: CameraSource,
    buffer: Arc<FrameBuffer>,
    extra_sink: Option<Arc<dyn FrameSink>>,
    settings: Option<Arc<dyn SettingsProvider>>,
    frame_interval: Duration,
    policy: RetryPolicy,
    retry_count: Arc<AtomicU32>,
    failed: Arc<AtomicBool>,
    failures: u32,
}

impl OwnedCtx {
    fn tick(&mut self, dev: &mut Box<dyn CaptureDevice>, stop: &AtomicBool) -> LoopAction {
        match dev.read_frame() {
            Ok(frame) => {
                self.failures = 0;
                publish(&self.name, frame, &self.buffer, &self.extra_sink);
                sleep_interruptible(stop, self.frame_interval);
                LoopAction::Continue
            }
            Err(e) => {
                self.failures += 1;
                self.retry_count.fetch_add(1, Ordering::SeqCst);
                warn!(
                    name = %self.name,
                    failures = self.failures,
                    error = %e,
                    "owned read failed"
                );

                if self.failures < capture::READ_FAILURE_THRESHOLD {
                    sleep_interruptible(stop, capture::READ_RETRY_PAUSE);
                    return LoopAction::Continue;
                }

                dev.release();
                sleep_interruptible(stop, capture::RELEASE_SETTLE);
                match open_with_retries(self.backend.as_ref(), &self.source, &self.policy, Some(stop))
                {
                    Ok(new_dev) => {
                        *dev = new_dev;
                        if let Some(provider) = &self.settings {
                            settings::apply_profile(
                                dev.as_mut(),
                                &provider.snapshot(),
                                Profile::Video,
                            );
                        }
                        self.failures = 0;
                        info!(name = %self.name, "owned device reopened");
                        LoopAction::Continue
                    }
                    Err(e) => {
                        error!(name = %self.name, error = %e, "reconnect budget exhausted, stream giving up");
                        self.failed.store(true, Ordering::SeqCst);
                        LoopAction::Stop
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::virtual_dev::{VirtualBackend, VirtualConfig};
    use crate::manager::CameraManager;
    use crate::settings::{CaptureSettings, StaticSettings};

    fn fast_policy() -> RetryPolicy {
        RetryPolicy::fixed(3, Duration::from_millis(5))
    }

    fn owned_session(backend: Arc<VirtualBackend>) -> StreamSession {
        StreamSession::new(
            "test",
            StreamSource::Owned {
                backend,
                source: CameraSource::Index(0),
            },
        )
        .with_policy(fast_policy())
        .with_frame_interval(Duration::from_millis(1))
    }

    fn wait_for<F: Fn() -> bool>(what: &str, cond: F) {
        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        while !cond() {
            assert!(std::time::Instant::now() < deadline, "timed out: {}", what);
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn owned_session_streams_frames() {
        let backend = Arc::new(VirtualBackend::default());
        let session = owned_session(Arc::clone(&backend));
        session.start();
        wait_for("first frame", || session.get_frame().is_some());
        session.stop();
        assert!(!session.is_running());
        assert_eq!(backend.live_sessions(), 0);
    }

    #[test]
    fn stop_is_repeatable_and_start_idempotent() {
        let backend = Arc::new(VirtualBackend::default());
        let session = owned_session(Arc::clone(&backend));
        session.start();
        session.start();
        wait_for("first frame", || session.get_frame().is_some());
        assert_eq!(backend.peak_sessions(), 1);
        session.stop();
        session.stop();
        assert!(!session.is_running());
    }

    #[test]
    fn flaky_open_succeeds_within_budget() {
        let backend = Arc::new(VirtualBackend::new(VirtualConfig {
            fail_first_opens: 2,
            ..Default::default()
        }));
        let session = owned_session(Arc::clone(&backend));
        session.start();
        wait_for("first frame", || session.get_frame().is_some());
        session.stop();
        assert_eq!(backend.opens_attempted(), 3);
        assert!(!session.has_failed());
    }

    #[test]
    fn retries_accumulate_across_reconnect_cycles() {
        let backend = Arc::new(VirtualBackend::new(VirtualConfig {
            fail_reads_after: Some(2),
            frame_interval: Duration::from_millis(1),
            fail_first_opens: 0,
            ..Default::default()
        }));
        // Make every reopen fail by exhausting the one good handle first
        let session = StreamSession::new(
            "flaky",
            StreamSource::Owned {
                backend: Arc::clone(&backend) as Arc<dyn CaptureBackend>,
                source: CameraSource::Index(0),
            },
        )
        .with_policy(RetryPolicy::fixed(2, Duration::from_millis(5)))
        .with_frame_interval(Duration::from_millis(1));

        session.start();
        // Every reopened handle also dies after 2 reads; the session keeps
        // cycling but each cycle counts retries
        wait_for("retries recorded", || session.retry_count() >= 3);
        session.stop();
    }

    #[test]
    fn shared_session_never_releases_the_borrowed_handle() {
        let backend = Arc::new(VirtualBackend::default());
        let manager = CameraManager::with_policy(
            Arc::clone(&backend) as Arc<dyn CaptureBackend>,
            CameraSource::Index(0),
            Arc::new(StaticSettings(CaptureSettings::default())),
            fast_policy(),
        );
        manager.open().unwrap();

        let session = StreamSession::new("borrower", StreamSource::Shared(manager.shared_handle()))
            .with_frame_interval(Duration::from_millis(1));
        session.start();
        wait_for("first frame", || session.get_frame().is_some());

        // Stopping the borrower must not touch the manager's handle
        session.stop();
        assert_eq!(backend.releases(), 0);
        assert_eq!(backend.live_sessions(), 1);
        assert!(manager.is_available());

        manager.stop();
        assert_eq!(backend.live_sessions(), 0);
    }

    #[test]
    fn sink_panic_does_not_kill_the_session() {
        struct PanickingSink;
        impl FrameSink for PanickingSink {
            fn on_frame(&self, _frame: Frame) {
                panic!("sink bug");
            }
        }

        let backend = Arc::new(VirtualBackend::default());
        let session = owned_session(Arc::clone(&backend)).with_sink(Arc::new(PanickingSink));
        session.start();
        wait_for("frames despite sink panic", || {
            session.get_frame().is_some()
        });
        assert!(session.is_running());
        session.stop();
    }
}
