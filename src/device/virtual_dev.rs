// SPDX-License-Identifier: GPL-3.0-only

//! Virtual camera backend
//!
//! Produces a moving gradient so the whole service can run without hardware.
//! Open failures and read failures can be scripted, which is what the
//! integration tests use to simulate flaky USB devices. The backend counts
//! attempts, live sessions and releases so tests can assert on handle
//! discipline.

use super::{CameraSource, CaptureBackend, CaptureDevice, ControlId};
use crate::errors::{CameraError, CameraResult};
use crate::frame::Frame;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tracing::debug;

/// Behaviour knobs for the virtual backend
#[derive(Debug, Clone)]
pub struct VirtualConfig {
    pub width: u32,
    pub height: u32,
    /// Simulated sensor pace; reads block this long
    pub frame_interval: Duration,
    /// Number of opens that fail before the first success
    pub fail_first_opens: u32,
    /// When set, every read past this count fails until the device is
    /// reopened
    pub fail_reads_after: Option<u64>,
}

impl Default for VirtualConfig {
    fn default() -> Self {
        Self {
            width: 64,
            height: 48,
            frame_interval: Duration::from_millis(5),
            fail_first_opens: 0,
            fail_reads_after: None,
        }
    }
}

/// Synthetic frame source
pub struct VirtualBackend {
    config: VirtualConfig,
    opens_attempted: Arc<AtomicU32>,
    live_sessions: Arc<AtomicU32>,
    peak_sessions: Arc<AtomicU32>,
    releases: Arc<AtomicU32>,
}

impl VirtualBackend {
    pub fn new(config: VirtualConfig) -> Self {
        Self {
            config,
            opens_attempted: Arc::new(AtomicU32::new(0)),
            live_sessions: Arc::new(AtomicU32::new(0)),
            peak_sessions: Arc::new(AtomicU32::new(0)),
            releases: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Total open attempts, including failed ones
    pub fn opens_attempted(&self) -> u32 {
        self.opens_attempted.load(Ordering::SeqCst)
    }

    /// Sessions currently open
    pub fn live_sessions(&self) -> u32 {
        self.live_sessions.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously open sessions observed
    pub fn peak_sessions(&self) -> u32 {
        self.peak_sessions.load(Ordering::SeqCst)
    }

    /// Times a session was released
    pub fn releases(&self) -> u32 {
        self.releases.load(Ordering::SeqCst)
    }
}

impl Default for VirtualBackend {
    fn default() -> Self {
        Self::new(VirtualConfig::default())
    }
}

impl CaptureBackend for VirtualBackend {
    fn name(&self) -> &str {
        "virtual"
    }

    fn open(&self, source: &CameraSource) -> CameraResult<Box<dyn CaptureDevice>> {
        let attempt = self.opens_attempted.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt <= self.config.fail_first_opens {
            debug!(%source, attempt, "virtual open scripted to fail");
            return Err(CameraError::DeviceUnavailable(format!(
                "virtual source {} scripted failure ({} of {})",
                source, attempt, self.config.fail_first_opens
            )));
        }

        let live = self.live_sessions.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_sessions.fetch_max(live, Ordering::SeqCst);
        debug!(%source, live, "virtual device opened");

        Ok(Box::new(VirtualDevice {
            config: self.config.clone(),
            controls: HashMap::new(),
            frame_counter: 0,
            open: true,
            live_sessions: Arc::clone(&self.live_sessions),
            releases: Arc::clone(&self.releases),
        }))
    }
}

/// One open virtual session
pub struct VirtualDevice {
    config: VirtualConfig,
    controls: HashMap<ControlId, f64>,
    frame_counter: u64,
    open: bool,
    live_sessions: Arc<AtomicU32>,
    releases: Arc<AtomicU32>,
}

impl VirtualDevice {
    fn render(&self) -> Vec<u8> {
        let (w, h) = (self.config.width, self.config.height);
        let phase = (self.frame_counter % 256) as u8;
        let mut data = Vec::with_capacity((w * h * 3) as usize);
        for y in 0..h {
            for x in 0..w {
                data.push(((x * 255 / w.max(1)) as u8).wrapping_add(phase));
                data.push((y * 255 / h.max(1)) as u8);
                data.push(phase);
            }
        }
        data
    }
}

impl CaptureDevice for VirtualDevice {
    fn read_frame(&mut self) -> CameraResult<Frame> {
        if !self.open {
            return Err(CameraError::ReadFailure("virtual device released".into()));
        }
        if let Some(limit) = self.config.fail_reads_after
            && self.frame_counter >= limit
        {
            return Err(CameraError::ReadFailure(
                "virtual device scripted read failure".into(),
            ));
        }
        std::thread::sleep(self.config.frame_interval);
        self.frame_counter += 1;
        Ok(Frame::new(
            self.config.width,
            self.config.height,
            self.render(),
        ))
    }

    fn set_control(&mut self, control: ControlId, value: f64) -> bool {
        self.controls.insert(control, value);
        true
    }

    fn get_control(&self, control: ControlId) -> Option<f64> {
        self.controls.get(&control).copied()
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn release(&mut self) {
        if self.open {
            self.open = false;
            self.live_sessions.fetch_sub(1, Ordering::SeqCst);
            self.releases.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl Drop for VirtualDevice {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_fails_then_succeeds_per_script() {
        let backend = VirtualBackend::new(VirtualConfig {
            fail_first_opens: 2,
            ..Default::default()
        });
        let source = CameraSource::Index(0);
        assert!(backend.open(&source).is_err());
        assert!(backend.open(&source).is_err());
        assert!(backend.open(&source).is_ok());
        assert_eq!(backend.opens_attempted(), 3);
    }

    #[test]
    fn frames_have_declared_dimensions() {
        let backend = VirtualBackend::default();
        let mut dev = backend.open(&CameraSource::Index(0)).unwrap();
        let frame = dev.read_frame().unwrap();
        assert_eq!(frame.width, 64);
        assert_eq!(frame.height, 48);
        assert_eq!(frame.data.len(), 64 * 48 * 3);
    }

    #[test]
    fn released_device_refuses_reads_and_is_counted() {
        let backend = VirtualBackend::default();
        let mut dev = backend.open(&CameraSource::Index(0)).unwrap();
        dev.release();
        dev.release();
        assert!(dev.read_frame().is_err());
        assert_eq!(backend.releases(), 1);
        assert_eq!(backend.live_sessions(), 0);
    }

    #[test]
    fn scripted_read_failure_kicks_in() {
        let backend = VirtualBackend::new(VirtualConfig {
            fail_reads_after: Some(2),
            ..Default::default()
        });
        let mut dev = backend.open(&CameraSource::Index(0)).unwrap();
        assert!(dev.read_frame().is_ok());
        assert!(dev.read_frame().is_ok());
        assert!(dev.read_frame().is_err());
    }
}
