// SPDX-License-Identifier: GPL-3.0-only

//! Last-resort device reset
//!
//! When reopening keeps failing the watchdog can ask for a harder reset.
//! On Linux the video node's USB parent can be power-cycled by writing to
//! its `authorized` attribute in sysfs, which forces a re-enumeration
//! without unplugging anything. Needs root, so failures are reported but
//! never treated as fatal.

use super::CameraSource;
use crate::errors::{CameraError, CameraResult};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// A way to reset a camera source out-of-band
pub trait ResetFacility: Send + Sync {
    fn reset(&self, source: &CameraSource) -> CameraResult<()>;
}

/// USB re-enumeration through sysfs `authorized`
///
/// Deauthorizes the device, waits for the kernel to tear it down, then
/// authorizes it again.
pub struct UsbAuthorizedReset {
    /// How long to leave the device deauthorized
    pub settle: Duration,
}

impl Default for UsbAuthorizedReset {
    fn default() -> Self {
        Self {
            settle: Duration::from_secs(1),
        }
    }
}

impl UsbAuthorizedReset {
    /// Walk from the video node to the USB device directory holding
    /// `authorized`. `/sys/class/video4linux/videoN/device` points at the
    /// USB interface; the attribute lives one level up on the device itself.
    fn authorized_path(&self, source: &CameraSource) -> CameraResult<PathBuf> {
        let node = source.device_path();
        let name = node
            .file_name()
            .ok_or_else(|| CameraError::Io(format!("no device node name in {}", node.display())))?;
        let iface = Path::new("/sys/class/video4linux")
            .join(name)
            .join("device");
        let iface = fs::canonicalize(&iface)
            .map_err(|e| CameraError::Io(format!("resolving {}: {}", iface.display(), e)))?;

        let mut dir = iface.as_path();
        loop {
            let candidate = dir.join("authorized");
            if candidate.exists() {
                return Ok(candidate);
            }
            dir = dir.parent().ok_or_else(|| {
                CameraError::Io(format!(
                    "no authorized attribute above {}",
                    iface.display()
                ))
            })?;
        }
    }
}

impl ResetFacility for UsbAuthorizedReset {
    fn reset(&self, source: &CameraSource) -> CameraResult<()> {
        let path = self.authorized_path(source)?;
        info!(%source, path = %path.display(), "power-cycling usb device");

        fs::write(&path, "0")
            .map_err(|e| CameraError::Io(format!("deauthorizing {}: {}", path.display(), e)))?;
        std::thread::sleep(self.settle);
        fs::write(&path, "1")
            .map_err(|e| CameraError::Io(format!("reauthorizing {}: {}", path.display(), e)))?;

        info!(%source, "usb device reauthorized");
        Ok(())
    }
}

/// Reset facility that does nothing, for sources with no reset path
pub struct NoopReset;

impl ResetFacility for NoopReset {
    fn reset(&self, source: &CameraSource) -> CameraResult<()> {
        warn!(%source, "no reset facility for this source");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingReset {
        calls: Mutex<Vec<CameraSource>>,
    }

    impl ResetFacility for RecordingReset {
        fn reset(&self, source: &CameraSource) -> CameraResult<()> {
            self.calls.lock().unwrap().push(source.clone());
            Ok(())
        }
    }

    #[test]
    fn missing_sysfs_node_is_an_io_error() {
        let reset = UsbAuthorizedReset::default();
        let err = reset
            .reset(&CameraSource::Path(PathBuf::from("/dev/video-nonexistent")))
            .unwrap_err();
        assert!(matches!(err, CameraError::Io(_)));
    }

    #[test]
    fn noop_reset_always_succeeds() {
        assert!(NoopReset.reset(&CameraSource::Index(0)).is_ok());
    }

    #[test]
    fn recording_reset_records() {
        let reset = RecordingReset::default();
        reset.reset(&CameraSource::Index(1)).unwrap();
        assert_eq!(reset.calls.lock().unwrap().len(), 1);
    }
}
