// SPDX-License-Identifier: GPL-3.0-only

//! Error types for the capture service
//!
//! Every hardware-facing operation classifies its failure into one of these
//! variants and reports it through `CameraResult`; nothing in this crate
//! panics across a thread boundary. The watchdog is the backstop for errors
//! that recur after local recovery has given up.

use std::fmt;
use std::time::Duration;

/// Result type alias used throughout the crate
pub type CameraResult<T> = Result<T, CameraError>;

/// Failure classification for camera operations
#[derive(Debug, Clone)]
pub enum CameraError {
    /// Open failed after all retries; recoverable by a later watchdog-driven
    /// retry, never fatal to the process
    DeviceUnavailable(String),
    /// Transient frame-read failure; recovered locally by the capture loop
    ReadFailure(String),
    /// Stream failed to come back after a pause (e.g. photo capture)
    ResumeFailure(String),
    /// Video writer failed to open or a write call failed; aborts the
    /// current recording only
    EncodingFailure(String),
    /// A bounded wait (join, settle, frame availability) ran out of budget
    Timeout { what: String, budget: Duration },
    /// The device is held by another session
    Busy(String),
    /// Underlying I/O error (filesystem, ioctl)
    Io(String),
}

impl fmt::Display for CameraError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CameraError::DeviceUnavailable(msg) => write!(f, "device unavailable: {}", msg),
            CameraError::ReadFailure(msg) => write!(f, "frame read failed: {}", msg),
            CameraError::ResumeFailure(msg) => write!(f, "stream resume failed: {}", msg),
            CameraError::EncodingFailure(msg) => write!(f, "encoding failed: {}", msg),
            CameraError::Timeout { what, budget } => {
                write!(f, "timed out after {:?} waiting for {}", budget, what)
            }
            CameraError::Busy(msg) => write!(f, "device busy: {}", msg),
            CameraError::Io(msg) => write!(f, "I/O error: {}", msg),
        }
    }
}

impl std::error::Error for CameraError {}

impl From<std::io::Error> for CameraError {
    fn from(err: std::io::Error) -> Self {
        CameraError::Io(err.to_string())
    }
}

impl CameraError {
    /// True for failures the watchdog is expected to repair on its own
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, CameraError::EncodingFailure(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_reason() {
        let err = CameraError::DeviceUnavailable("no /dev/video0".into());
        assert!(err.to_string().contains("no /dev/video0"));
    }

    #[test]
    fn encoding_failure_is_not_recoverable() {
        assert!(!CameraError::EncodingFailure("writer".into()).is_recoverable());
        assert!(CameraError::ReadFailure("eio".into()).is_recoverable());
    }
}
