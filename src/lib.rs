// SPDX-License-Identifier: GPL-3.0-only

//! camkeeper - resilient camera capture service
//!
//! Keeps a V4L2 camera usable for long-running unattended capture:
//! streaming into a shared frame buffer, timed recordings, still photos
//! and scheduled timelapse shots, with retry, restart and watchdog
//! escalation when the hardware misbehaves.
//!
//! # Architecture
//!
//! - [`device`]: capture backend abstraction (V4L2, virtual) and USB reset
//! - [`manager`]: device lifecycle and the capture loop
//! - [`stream`]: standalone streaming sessions with reconnect
//! - [`photo`]: still capture with settings switch and resume
//! - [`recording`]: timed recordings into a video sink
//! - [`timelapse`]: scheduled photo capture
//! - [`watchdog`]: health checks and reset escalation
//! - [`service`]: the façade wiring everything together

pub mod constants;
pub mod device;
pub mod errors;
pub mod frame;
pub mod manager;
pub mod photo;
pub mod recording;
pub mod retry;
pub mod service;
pub mod settings;
pub mod sink;
pub mod stream;
pub mod timelapse;
pub mod watchdog;
pub mod worker;

// Re-export commonly used types
pub use device::{CameraSource, CaptureBackend, CaptureDevice};
pub use errors::{CameraError, CameraResult};
pub use frame::{Frame, FrameBuffer};
pub use manager::CameraManager;
pub use photo::PhotoMode;
pub use service::{CameraService, CameraStatus, ServiceConfig};
