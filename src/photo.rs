// SPDX-License-Identifier: GPL-3.0-only

//! Still photo capture
//!
//! A photo needs exclusive device access: photo settings go on, a fresh
//! frame comes off the sensor, video settings go back. The coordinator
//! holds the manager's operation lock for that whole span, which pauses
//! the capture loop without stopping its thread; dropping the lock resumes
//! it. That makes the resume invariant structural rather than something a
//! cleanup path has to remember.
//!
//! When the buffer already holds a fresh frame the coordinator uses it
//! as-is and skips the settings churn entirely.

use crate::constants::photo;
use crate::errors::CameraResult;
use crate::manager::CameraManager;
use crate::settings::Profile;
use crate::sink::PhotoSink;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// What triggered the capture; decides where the file lands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhotoMode {
    Manual,
    Timelapse,
}

impl PhotoMode {
    fn subdir(&self) -> Option<&'static str> {
        match self {
            PhotoMode::Manual => None,
            PhotoMode::Timelapse => Some("timelapse"),
        }
    }
}

pub struct PhotoCaptureCoordinator {
    manager: Arc<CameraManager>,
    sink: Arc<dyn PhotoSink>,
}

impl PhotoCaptureCoordinator {
    pub fn new(manager: Arc<CameraManager>, sink: Arc<dyn PhotoSink>) -> Self {
        Self { manager, sink }
    }

    /// Capture one still and persist it
    pub fn capture(&self, mode: PhotoMode) -> CameraResult<PathBuf> {
        // Blocks until the capture loop finishes its current tick; the loop
        // then yields for as long as we hold the lock
        let op_lock = self.manager.op_lock();
        let _op = op_lock.lock().unwrap();

        // Fresh buffered frame: no device interaction needed
        if let Some(frame) = self
            .manager
            .buffer()
            .latest()
            .filter(|f| f.age() <= photo::FRESH_WINDOW)
        {
            info!(age_ms = frame.age().as_millis() as u64, ?mode, "using buffered frame for photo");
            return self.sink.save_photo(&frame, mode.subdir());
        }

        // No-op when the device is already open
        self.manager.open_inner(None)?;

        self.manager.apply_settings_inner(Profile::Photo);
        let first_try = self
            .manager
            .read_direct(photo::WARMUP_FRAMES, photo::READ_ATTEMPTS);

        let result = match first_try {
            Ok(frame) => Ok(frame),
            Err(e) => {
                warn!(error = %e, "direct read failed, restarting device for one more try");
                match self.manager.restart_inner(None) {
                    Ok(()) => {
                        self.manager.apply_settings_inner(Profile::Photo);
                        self.manager
                            .read_direct(photo::WARMUP_FRAMES, photo::READ_ATTEMPTS)
                    }
                    Err(restart_err) => {
                        warn!(error = %restart_err, "restart during photo capture failed");
                        Err(e)
                    }
                }
            }
        };

        // Video settings come back no matter how the capture went
        self.manager.apply_settings_inner(Profile::Video);

        let frame = result?;
        let path = self.sink.save_photo(&frame, mode.subdir())?;
        info!(path = %path.display(), ?mode, "photo captured");
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::virtual_dev::{VirtualBackend, VirtualConfig};
    use crate::device::{CameraSource, CaptureBackend};
    use crate::frame::Frame;
    use crate::retry::RetryPolicy;
    use crate::settings::{CaptureSettings, StaticSettings};
    use std::sync::Mutex;
    use std::time::Duration;

    struct MemorySink {
        saved: Mutex<Vec<Option<String>>>,
    }

    impl MemorySink {
        fn new() -> Self {
            Self {
                saved: Mutex::new(Vec::new()),
            }
        }
        fn count(&self) -> usize {
            self.saved.lock().unwrap().len()
        }
    }

    impl PhotoSink for MemorySink {
        fn save_photo(&self, _frame: &Frame, subdir: Option<&str>) -> CameraResult<PathBuf> {
            self.saved
                .lock()
                .unwrap()
                .push(subdir.map(|s| s.to_string()));
            Ok(PathBuf::from("/tmp/photo.jpg"))
        }
    }

    fn setup(config: VirtualConfig) -> (Arc<VirtualBackend>, Arc<CameraManager>, Arc<MemorySink>) {
        let backend = Arc::new(VirtualBackend::new(config));
        let manager = Arc::new(CameraManager::with_policy(
            Arc::clone(&backend) as Arc<dyn CaptureBackend>,
            CameraSource::Index(0),
            Arc::new(StaticSettings(CaptureSettings::default())),
            RetryPolicy::fixed(3, Duration::from_millis(5)),
        ));
        (backend, manager, Arc::new(MemorySink::new()))
    }

    #[test]
    fn fresh_buffered_frame_skips_the_device() {
        let (backend, manager, sink) = setup(VirtualConfig::default());
        manager.buffer().store(Frame::new(8, 8, vec![1; 8 * 8 * 3]));

        let coordinator = PhotoCaptureCoordinator::new(Arc::clone(&manager), sink.clone());
        coordinator.capture(PhotoMode::Manual).unwrap();

        assert_eq!(sink.count(), 1);
        assert_eq!(backend.opens_attempted(), 0);
    }

    #[test]
    fn empty_buffer_falls_back_to_direct_read() {
        let (backend, manager, sink) = setup(VirtualConfig::default());
        let coordinator = PhotoCaptureCoordinator::new(Arc::clone(&manager), sink.clone());

        coordinator.capture(PhotoMode::Manual).unwrap();

        assert_eq!(sink.count(), 1);
        assert!(backend.opens_attempted() >= 1);
        // The handle stays open for subsequent work
        assert!(manager.is_available());
    }

    #[test]
    fn timelapse_photos_land_in_their_subdirectory() {
        let (_backend, manager, sink) = setup(VirtualConfig::default());
        manager.buffer().store(Frame::new(8, 8, vec![1; 8 * 8 * 3]));

        let coordinator = PhotoCaptureCoordinator::new(manager, sink.clone());
        coordinator.capture(PhotoMode::Timelapse).unwrap();

        assert_eq!(
            sink.saved.lock().unwrap()[0],
            Some("timelapse".to_string())
        );
    }

    #[test]
    fn streaming_resumes_after_a_photo() {
        let (_backend, manager, sink) = setup(VirtualConfig {
            frame_interval: Duration::from_millis(1),
            ..Default::default()
        });
        manager.start().unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while manager.buffer().latest().is_none() {
            assert!(std::time::Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(5));
        }

        let coordinator = PhotoCaptureCoordinator::new(Arc::clone(&manager), sink);
        coordinator.capture(PhotoMode::Manual).unwrap();

        // Capture loop keeps publishing after the coordinator released the lock
        let marker = std::time::Instant::now();
        let deadline = marker + Duration::from_secs(5);
        loop {
            if let Some(frame) = manager.buffer().latest()
                && frame.captured_at > marker
            {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "stream never resumed");
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(manager.is_capturing());
        manager.stop();
    }

    #[test]
    fn failed_reads_leave_a_usable_restarted_handle() {
        let (_backend, manager, sink) = setup(VirtualConfig {
            // Every handle dies right after its open test read
            fail_reads_after: Some(1),
            ..Default::default()
        });
        manager.open().unwrap();

        let coordinator = PhotoCaptureCoordinator::new(Arc::clone(&manager), sink.clone());
        let result = coordinator.capture(PhotoMode::Manual);

        assert!(result.is_err());
        assert_eq!(sink.count(), 0);
        // The restart path still left an open handle behind
        assert!(manager.is_available());
    }
}
