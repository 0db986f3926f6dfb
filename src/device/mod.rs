// SPDX-License-Identifier: GPL-3.0-only

//! Capture device abstraction
//!
//! The rest of the crate talks to hardware through two narrow traits:
//! [`CaptureBackend`] opens a source and [`CaptureDevice`] is one open
//! session. The V4L2 backend is the production implementation; the virtual
//! backend produces synthetic frames for demos and tests.

pub mod reset;
pub mod virtual_dev;

#[cfg(target_os = "linux")]
pub mod v4l2;

use crate::errors::CameraResult;
use crate::frame::Frame;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

/// Where to find the camera: a device index or a filesystem path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CameraSource {
    Index(u32),
    Path(PathBuf),
}

impl CameraSource {
    /// Resolve to a device node path (`/dev/videoN` for indices)
    pub fn device_path(&self) -> PathBuf {
        match self {
            CameraSource::Index(n) => PathBuf::from(format!("/dev/video{}", n)),
            CameraSource::Path(p) => p.clone(),
        }
    }
}

impl fmt::Display for CameraSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CameraSource::Index(n) => write!(f, "{}", n),
            CameraSource::Path(p) => write!(f, "{}", p.display()),
        }
    }
}

impl FromStr for CameraSource {
    type Err = std::convert::Infallible;

    /// Digits parse as an index, anything else as a path
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.parse::<u32>() {
            Ok(n) => Ok(CameraSource::Index(n)),
            Err(_) => Ok(CameraSource::Path(PathBuf::from(s))),
        }
    }
}

/// Tunable per-device properties
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlId {
    Brightness,
    Contrast,
    Saturation,
    Gain,
    /// Manual exposure, log2-seconds convention (-13..=-1)
    Exposure,
    /// Exposure mode selector (auto vs. manual)
    AutoExposure,
}

impl fmt::Display for ControlId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ControlId::Brightness => "brightness",
            ControlId::Contrast => "contrast",
            ControlId::Saturation => "saturation",
            ControlId::Gain => "gain",
            ControlId::Exposure => "exposure",
            ControlId::AutoExposure => "auto_exposure",
        };
        write!(f, "{}", name)
    }
}

/// One open capture session
///
/// Implementations are driver-facing and must never panic; failures come
/// back as `CameraResult` errors or `false` for property writes, matching
/// how drivers silently ignore unsupported controls.
pub trait CaptureDevice: Send {
    /// Read and decode the next frame
    fn read_frame(&mut self) -> CameraResult<Frame>;

    /// Set a property; returns false when the driver rejects it
    fn set_control(&mut self, control: ControlId, value: f64) -> bool;

    /// Current value of a property, when the driver reports one
    fn get_control(&self, control: ControlId) -> Option<f64>;

    /// Whether the session is still open
    fn is_open(&self) -> bool;

    /// Close the session and free the device node. Safe to call twice.
    fn release(&mut self);
}

/// Factory for capture sessions on a given source
pub trait CaptureBackend: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &str;

    /// Open a session. One successful open at a time per physical device;
    /// a second open while the first is live should fail with `Busy`.
    fn open(&self, source: &CameraSource) -> CameraResult<Box<dyn CaptureDevice>>;
}

/// Handle slot shared between the manager (owner) and sessions that borrow
/// the open device without owning it
pub type SharedDevice = Arc<Mutex<Option<Box<dyn CaptureDevice>>>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_parses_index_and_path() {
        assert_eq!("0".parse::<CameraSource>().unwrap(), CameraSource::Index(0));
        assert_eq!(
            "/dev/video2".parse::<CameraSource>().unwrap(),
            CameraSource::Path(PathBuf::from("/dev/video2"))
        );
    }

    #[test]
    fn index_resolves_to_device_node() {
        assert_eq!(
            CameraSource::Index(3).device_path(),
            PathBuf::from("/dev/video3")
        );
    }
}
