// SPDX-License-Identifier: GPL-3.0-only

//! Service façade
//!
//! [`CameraService`] wires the manager, photo coordinator and recording
//! tasks together behind one cheaply clonable handle. Every public
//! operation here maps to something an operator or frontend would ask for;
//! the concurrency rules all live in the components underneath.

use crate::device::{CameraSource, CaptureBackend};
use crate::errors::{CameraError, CameraResult};
use crate::frame::Frame;
use crate::manager::CameraManager;
use crate::photo::{PhotoCaptureCoordinator, PhotoMode};
use crate::recording::{RecordingParams, RecordingTask};
use crate::retry::RetryPolicy;
use crate::settings::SettingsProvider;
use crate::sink::{JpegPhotoSink, open_video_file};
use crate::watchdog::Monitored;
use chrono::Local;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};

/// Streaming frames older than this mean the pipeline has stalled
const STALE_FRAME_AGE: Duration = Duration::from_secs(10);

pub type RecordingId = u64;

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub source: CameraSource,
    /// Base directory for photos and recordings
    pub output_dir: PathBuf,
    pub jpeg_quality: u8,
    pub recording_fps: u32,
    pub recording_resolution: (u32, u32),
    /// Open/reopen schedule for the underlying manager
    pub retry: RetryPolicy,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            source: CameraSource::Index(0),
            output_dir: dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("camkeeper"),
            jpeg_quality: 90,
            recording_fps: 20,
            recording_resolution: (1280, 720),
            retry: RetryPolicy::default(),
        }
    }
}

/// Point-in-time health snapshot
#[derive(Debug, Clone)]
pub struct CameraStatus {
    pub available: bool,
    pub streaming: bool,
    pub recording: bool,
    pub last_frame_age: Option<Duration>,
}

struct ServiceInner {
    config: ServiceConfig,
    manager: Arc<CameraManager>,
    coordinator: Arc<PhotoCaptureCoordinator>,
    recordings: Mutex<HashMap<RecordingId, RecordingTask>>,
    next_recording_id: AtomicU64,
    /// Whether streaming should be on, as opposed to whether it currently is
    streaming_desired: AtomicBool,
}

/// Clonable handle to the whole capture service
#[derive(Clone)]
pub struct CameraService {
    inner: Arc<ServiceInner>,
}

impl CameraService {
    pub fn new(
        backend: Arc<dyn CaptureBackend>,
        config: ServiceConfig,
        settings: Arc<dyn SettingsProvider>,
    ) -> Self {
        let manager = Arc::new(CameraManager::with_policy(
            backend,
            config.source.clone(),
            settings,
            config.retry,
        ));
        let photo_sink = Arc::new(JpegPhotoSink::new(
            config.output_dir.join("photos"),
            config.jpeg_quality,
        ));
        let coordinator = Arc::new(PhotoCaptureCoordinator::new(Arc::clone(&manager), photo_sink));

        Self {
            inner: Arc::new(ServiceInner {
                config,
                manager,
                coordinator,
                recordings: Mutex::new(HashMap::new()),
                next_recording_id: AtomicU64::new(1),
                streaming_desired: AtomicBool::new(false),
            }),
        }
    }

    pub fn manager(&self) -> Arc<CameraManager> {
        Arc::clone(&self.inner.manager)
    }

    /// Photo coordinator, for wiring up the timelapse scheduler
    pub fn photo_coordinator(&self) -> Arc<PhotoCaptureCoordinator> {
        Arc::clone(&self.inner.coordinator)
    }

    pub fn source(&self) -> &CameraSource {
        &self.inner.config.source
    }

    /// Open the device and start the capture loop
    pub fn start_stream(&self) -> CameraResult<()> {
        self.inner.streaming_desired.store(true, Ordering::SeqCst);
        self.inner.manager.start()
    }

    /// Stop capture and release the device
    pub fn stop_stream(&self) {
        self.inner.streaming_desired.store(false, Ordering::SeqCst);
        self.inner.manager.stop();
    }

    pub fn is_streaming(&self) -> bool {
        self.inner.manager.is_capturing()
    }

    /// Copy of the most recent frame
    pub fn get_latest_frame(&self) -> Option<Frame> {
        self.inner.manager.buffer().latest()
    }

    /// Capture a still; pauses and resumes streaming around the shot
    pub fn capture_photo(&self, mode: PhotoMode) -> CameraResult<PathBuf> {
        self.inner.coordinator.capture(mode)
    }

    /// Start a timed recording fed from the streaming buffer
    pub fn start_recording(&self, duration: Duration) -> CameraResult<RecordingId> {
        // Recordings consume buffered frames, so streaming must be up
        self.start_stream()?;

        let filename = format!("rec_{}.avi", Local::now().format("%Y%m%d_%H%M%S"));
        let filepath = self.inner.config.output_dir.join("recordings").join(filename);

        let mut params = RecordingParams::new(filepath.clone(), duration);
        params.fps = self.inner.config.recording_fps;
        params.resolution = self.inner.config.recording_resolution;

        let (width, height) = params.resolution;
        let fps = params.fps;
        let codec = params.codec;
        let factory_path = filepath.clone();
        let task = RecordingTask::start(
            params,
            self.inner.manager.buffer(),
            Box::new(move || open_video_file(&factory_path, codec, width, height, fps)),
        );

        let id = self.inner.next_recording_id.fetch_add(1, Ordering::SeqCst);
        self.inner.recordings.lock().unwrap().insert(id, task);
        info!(id, path = %filepath.display(), "recording registered");
        Ok(id)
    }

    /// Stop a recording and return how many frames it wrote
    pub fn stop_recording(&self, id: RecordingId) -> CameraResult<u64> {
        let task = self
            .inner
            .recordings
            .lock()
            .unwrap()
            .remove(&id)
            .ok_or_else(|| CameraError::Io(format!("no recording with id {}", id)))?;
        let frames = task.stop();
        info!(id, frames, "recording stopped");
        Ok(frames)
    }

    /// Drop bookkeeping for recordings that already finished on their own
    pub fn reap_finished_recordings(&self) -> usize {
        let mut recordings = self.inner.recordings.lock().unwrap();
        let before = recordings.len();
        recordings.retain(|id, task| {
            let running = task.is_running();
            if !running {
                info!(id, frames = task.frames_written(), "recording finished");
            }
            running
        });
        before - recordings.len()
    }

    pub fn active_recordings(&self) -> usize {
        let recordings = self.inner.recordings.lock().unwrap();
        recordings.values().filter(|t| t.is_running()).count()
    }

    /// Release and reopen the device. Streaming and recordings keep their
    /// threads and pick the new handle up automatically.
    pub fn restart_camera(&self) -> CameraResult<()> {
        self.inner.manager.restart()
    }

    pub fn status(&self) -> CameraStatus {
        CameraStatus {
            available: self.inner.manager.is_available(),
            streaming: self.inner.manager.is_capturing(),
            recording: self.active_recordings() > 0,
            last_frame_age: self.inner.manager.last_frame_age(),
        }
    }

    /// Stop everything in dependency order: recordings first, then capture
    pub fn shutdown(&self) {
        info!("service shutting down");
        let tasks: Vec<_> = {
            let mut recordings = self.inner.recordings.lock().unwrap();
            recordings.drain().collect()
        };
        for (id, task) in tasks {
            let frames = task.stop();
            info!(id, frames, "recording stopped for shutdown");
        }
        self.stop_stream();
    }
}

impl Monitored for CameraService {
    fn diagnose(&self) -> Option<String> {
        if !self.inner.streaming_desired.load(Ordering::SeqCst) {
            // Nothing to supervise while the service is idle
            return None;
        }
        if !self.inner.manager.is_available() {
            return Some("device handle not open".to_string());
        }
        if !self.inner.manager.is_capturing() {
            return Some("capture loop not running".to_string());
        }
        match self.inner.manager.last_frame_age() {
            Some(age) if age > STALE_FRAME_AGE => {
                Some(format!("frames stale for {:.1}s", age.as_secs_f64()))
            }
            None => Some("no frames in buffer".to_string()),
            Some(_) => None,
        }
    }

    fn repair(&self) -> CameraResult<()> {
        warn!("watchdog repair: restarting camera");
        self.inner.manager.restart()?;
        if self.inner.streaming_desired.load(Ordering::SeqCst) {
            self.inner.manager.start()?;
        }
        Ok(())
    }
}
