// SPDX-License-Identifier: GPL-3.0-only

//! V4L2 capture backend
//!
//! Frames come from a memory-mapped V4L2 stream. The stream borrows the
//! device for its whole lifetime, so both live on a dedicated pump thread
//! and the [`CaptureDevice`] handle talks to it over channels. Controls go
//! through VIDIOC_G_CTRL/VIDIOC_S_CTRL ioctls on a separate fd, which V4L2
//! allows while streaming.
//!
//! Control conventions:
//! - Manual exposure is exchanged as log2-seconds and mapped to
//!   V4L2_CID_EXPOSURE_ABSOLUTE (100 microsecond units).
//! - The auto-exposure selector maps 0 to aperture priority (the common
//!   "auto" for UVC webcams) and 1 to manual.

use super::{CameraSource, CaptureBackend, CaptureDevice, ControlId};
use crate::errors::{CameraError, CameraResult};
use crate::frame::Frame;
use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};
use v4l::buffer::Type;
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::{Format, FourCC};

const V4L2_CTRL_CLASS_USER: u32 = 0x0098_0000;
const V4L2_CTRL_CLASS_CAMERA: u32 = 0x009a_0000;

const V4L2_CID_BASE: u32 = V4L2_CTRL_CLASS_USER | 0x900;
const V4L2_CID_CAMERA_CLASS_BASE: u32 = V4L2_CTRL_CLASS_CAMERA | 0x900;

const V4L2_CID_BRIGHTNESS: u32 = V4L2_CID_BASE;
const V4L2_CID_CONTRAST: u32 = V4L2_CID_BASE + 1;
const V4L2_CID_SATURATION: u32 = V4L2_CID_BASE + 2;
const V4L2_CID_GAIN: u32 = V4L2_CID_BASE + 19;

const V4L2_CID_EXPOSURE_AUTO: u32 = V4L2_CID_CAMERA_CLASS_BASE + 1;
const V4L2_CID_EXPOSURE_ABSOLUTE: u32 = V4L2_CID_CAMERA_CLASS_BASE + 2;

const V4L2_EXPOSURE_MANUAL: i32 = 1;
const V4L2_EXPOSURE_APERTURE_PRIORITY: i32 = 3;

/// Get control value (v4l2_control: 8 bytes)
const VIDIOC_G_CTRL: libc::c_ulong = 0xC008561B;
/// Set control value (v4l2_control: 8 bytes)
const VIDIOC_S_CTRL: libc::c_ulong = 0xC008561C;

#[repr(C)]
struct V4l2Control {
    id: u32,
    value: i32,
}

/// How long to wait for the pump thread to deliver a frame
const READ_REPLY_TIMEOUT: Duration = Duration::from_secs(2);
/// How long to wait for the pump thread to finish opening the device
const OPEN_TIMEOUT: Duration = Duration::from_secs(5);

/// Production backend for `/dev/video*` nodes
pub struct V4l2Backend {
    /// Requested capture resolution; the driver may adjust it
    pub width: u32,
    pub height: u32,
}

impl Default for V4l2Backend {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
        }
    }
}

impl CaptureBackend for V4l2Backend {
    fn name(&self) -> &str {
        "v4l2"
    }

    fn open(&self, source: &CameraSource) -> CameraResult<Box<dyn CaptureDevice>> {
        let path = source.device_path();
        if !path.exists() {
            return Err(CameraError::DeviceUnavailable(format!(
                "{} does not exist",
                path.display()
            )));
        }

        let (request_tx, request_rx) = mpsc::channel::<PumpRequest>();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<(u32, u32), String>>();

        let pump_path = path.clone();
        let (width, height) = (self.width, self.height);
        let pump = std::thread::Builder::new()
            .name(format!("v4l2-pump-{}", source))
            .spawn(move || pump_loop(&pump_path, width, height, ready_tx, request_rx))
            .map_err(|e| CameraError::Io(format!("spawning pump thread: {}", e)))?;

        match ready_rx.recv_timeout(OPEN_TIMEOUT) {
            Ok(Ok((w, h))) => {
                info!(path = %path.display(), width = w, height = h, "v4l2 device opened");
                Ok(Box::new(V4l2Handle {
                    path,
                    requests: request_tx,
                    pump: Some(pump),
                    open: true,
                }))
            }
            Ok(Err(e)) => {
                let _ = pump.join();
                if e.contains("busy") || e.contains("Busy") {
                    Err(CameraError::Busy(format!("{}: {}", path.display(), e)))
                } else {
                    Err(CameraError::DeviceUnavailable(format!(
                        "{}: {}",
                        path.display(),
                        e
                    )))
                }
            }
            Err(_) => {
                drop(request_tx);
                Err(CameraError::Timeout {
                    what: format!("opening {}", path.display()),
                    budget: OPEN_TIMEOUT,
                })
            }
        }
    }
}

enum PumpRequest {
    Read(mpsc::Sender<Result<Frame, String>>),
    Shutdown,
}

/// Owns the device and its mmap stream; serves read requests until shutdown
fn pump_loop(
    path: &Path,
    width: u32,
    height: u32,
    ready: mpsc::Sender<Result<(u32, u32), String>>,
    requests: mpsc::Receiver<PumpRequest>,
) {
    let dev = match Device::with_path(path) {
        Ok(d) => d,
        Err(e) => {
            let _ = ready.send(Err(format!("open failed: {}", e)));
            return;
        }
    };

    // MJPG preferred; fall back to raw YUYV for cameras without an encoder
    let fourcc_mjpg = FourCC::new(b"MJPG");
    let fourcc_yuyv = FourCC::new(b"YUYV");

    let format = Format::new(width, height, fourcc_mjpg);
    let actual = match dev.set_format(&format) {
        Ok(f) if f.fourcc == fourcc_mjpg => f,
        _ => {
            let format = Format::new(width, height, fourcc_yuyv);
            match dev.set_format(&format) {
                Ok(f) => f,
                Err(e) => {
                    let _ = ready.send(Err(format!("set format failed: {}", e)));
                    return;
                }
            }
        }
    };

    debug!(
        path = %path.display(),
        width = actual.width,
        height = actual.height,
        fourcc = ?actual.fourcc,
        "v4l2 format configured"
    );

    let mut stream = match Stream::with_buffers(&dev, Type::VideoCapture, 4) {
        Ok(s) => s,
        Err(e) => {
            let _ = ready.send(Err(format!("stream setup failed: {}", e)));
            return;
        }
    };

    if ready.send(Ok((actual.width, actual.height))).is_err() {
        return;
    }

    loop {
        match requests.recv() {
            Ok(PumpRequest::Read(reply)) => {
                let result = match stream.next() {
                    Ok((buf, _meta)) => decode_frame(buf, &actual),
                    Err(e) => Err(format!("capture failed: {}", e)),
                };
                // A dropped reply channel just means the caller timed out
                let _ = reply.send(result);
            }
            Ok(PumpRequest::Shutdown) | Err(_) => break,
        }
    }

    debug!(path = %path.display(), "v4l2 pump exiting");
}

fn decode_frame(buf: &[u8], format: &Format) -> Result<Frame, String> {
    if format.fourcc == FourCC::new(b"MJPG") {
        let img = image::load_from_memory(buf).map_err(|e| format!("jpeg decode: {}", e))?;
        let rgb = img.to_rgb8();
        let (w, h) = rgb.dimensions();
        Ok(Frame::new(w, h, rgb.into_raw()))
    } else if format.fourcc == FourCC::new(b"YUYV") {
        let rgb = yuyv_to_rgb(buf, format.width, format.height);
        Ok(Frame::new(format.width, format.height, rgb))
    } else {
        Err(format!("unsupported fourcc {:?}", format.fourcc))
    }
}

/// Convert packed YUYV 4:2:2 to RGB24 (BT.601)
fn yuyv_to_rgb(data: &[u8], width: u32, height: u32) -> Vec<u8> {
    let pixel_count = (width * height) as usize;
    let mut rgb = Vec::with_capacity(pixel_count * 3);

    // YUYV: Y0 U0 Y1 V0 - two pixels per chunk
    for chunk in data.chunks_exact(4) {
        let y0 = chunk[0] as f32;
        let u = chunk[1] as f32 - 128.0;
        let y1 = chunk[2] as f32;
        let v = chunk[3] as f32 - 128.0;

        for y in [y0, y1] {
            rgb.push((y + 1.402 * v).clamp(0.0, 255.0) as u8);
            rgb.push((y - 0.344 * u - 0.714 * v).clamp(0.0, 255.0) as u8);
            rgb.push((y + 1.772 * u).clamp(0.0, 255.0) as u8);

            if rgb.len() >= pixel_count * 3 {
                break;
            }
        }
    }

    rgb.resize(pixel_count * 3, 0);
    rgb
}

/// One open V4L2 session
pub struct V4l2Handle {
    path: PathBuf,
    requests: mpsc::Sender<PumpRequest>,
    pump: Option<JoinHandle<()>>,
    open: bool,
}

impl V4l2Handle {
    fn map_control(&self, control: ControlId) -> u32 {
        match control {
            ControlId::Brightness => V4L2_CID_BRIGHTNESS,
            ControlId::Contrast => V4L2_CID_CONTRAST,
            ControlId::Saturation => V4L2_CID_SATURATION,
            ControlId::Gain => V4L2_CID_GAIN,
            ControlId::Exposure => V4L2_CID_EXPOSURE_ABSOLUTE,
            ControlId::AutoExposure => V4L2_CID_EXPOSURE_AUTO,
        }
    }

    fn ioctl_get(&self, cid: u32) -> Option<i32> {
        let file = File::open(&self.path).ok()?;
        let fd = file.as_raw_fd();
        let mut ctrl = V4l2Control { id: cid, value: 0 };
        let result = unsafe { libc::ioctl(fd, VIDIOC_G_CTRL, &mut ctrl as *mut V4l2Control) };
        if result < 0 {
            debug!(path = %self.path.display(), cid, "VIDIOC_G_CTRL failed");
            return None;
        }
        Some(ctrl.value)
    }

    fn ioctl_set(&self, cid: u32, value: i32) -> bool {
        let Ok(file) = File::open(&self.path) else {
            return false;
        };
        let fd = file.as_raw_fd();
        let mut ctrl = V4l2Control { id: cid, value };
        let result = unsafe { libc::ioctl(fd, VIDIOC_S_CTRL, &mut ctrl as *mut V4l2Control) };
        if result < 0 {
            let errno = std::io::Error::last_os_error();
            warn!(path = %self.path.display(), cid, value, ?errno, "VIDIOC_S_CTRL failed");
            return false;
        }
        if ctrl.value != value {
            debug!(
                path = %self.path.display(),
                cid,
                requested = value,
                actual = ctrl.value,
                "driver clamped control value"
            );
        }
        true
    }
}

/// log2-seconds to V4L2 exposure units (100 microseconds)
fn exposure_to_v4l2(log2_seconds: f64) -> i32 {
    (log2_seconds.exp2() * 10_000.0).round().max(1.0) as i32
}

/// V4L2 exposure units back to log2-seconds
fn exposure_from_v4l2(units: i32) -> f64 {
    (units.max(1) as f64 / 10_000.0).log2()
}

impl CaptureDevice for V4l2Handle {
    fn read_frame(&mut self) -> CameraResult<Frame> {
        if !self.open {
            return Err(CameraError::ReadFailure(format!(
                "{} released",
                self.path.display()
            )));
        }

        let (reply_tx, reply_rx) = mpsc::channel();
        self.requests
            .send(PumpRequest::Read(reply_tx))
            .map_err(|_| CameraError::ReadFailure(format!("{} pump gone", self.path.display())))?;

        match reply_rx.recv_timeout(READ_REPLY_TIMEOUT) {
            Ok(Ok(frame)) => Ok(frame),
            Ok(Err(e)) => Err(CameraError::ReadFailure(format!(
                "{}: {}",
                self.path.display(),
                e
            ))),
            Err(_) => Err(CameraError::Timeout {
                what: format!("reading frame from {}", self.path.display()),
                budget: READ_REPLY_TIMEOUT,
            }),
        }
    }

    fn set_control(&mut self, control: ControlId, value: f64) -> bool {
        let cid = self.map_control(control);
        let raw = match control {
            ControlId::Exposure => exposure_to_v4l2(value),
            ControlId::AutoExposure => {
                if value >= 0.5 {
                    V4L2_EXPOSURE_MANUAL
                } else {
                    V4L2_EXPOSURE_APERTURE_PRIORITY
                }
            }
            _ => value.round() as i32,
        };
        self.ioctl_set(cid, raw)
    }

    fn get_control(&self, control: ControlId) -> Option<f64> {
        let raw = self.ioctl_get(self.map_control(control))?;
        Some(match control {
            ControlId::Exposure => exposure_from_v4l2(raw),
            ControlId::AutoExposure => {
                if raw == V4L2_EXPOSURE_MANUAL {
                    1.0
                } else {
                    0.0
                }
            }
            _ => raw as f64,
        })
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn release(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;
        let _ = self.requests.send(PumpRequest::Shutdown);
        if let Some(pump) = self.pump.take()
            && pump.join().is_err()
        {
            warn!(path = %self.path.display(), "v4l2 pump thread panicked");
        }
        info!(path = %self.path.display(), "v4l2 device released");
    }
}

impl Drop for V4l2Handle {
    fn drop(&mut self) {
        self.release();
    }
}

/// List video nodes that look like cameras
pub fn enumerate_devices() -> Vec<PathBuf> {
    let mut nodes: Vec<PathBuf> = std::fs::read_dir("/dev")
        .into_iter()
        .flatten()
        .flatten()
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with("video"))
                .unwrap_or(false)
        })
        .collect();
    nodes.sort();
    nodes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_id_values() {
        assert_eq!(V4L2_CID_BRIGHTNESS, 0x00980900);
        assert_eq!(V4L2_CID_GAIN, 0x00980913);
        assert_eq!(V4L2_CID_EXPOSURE_AUTO, 0x009a0901);
        assert_eq!(V4L2_CID_EXPOSURE_ABSOLUTE, 0x009a0902);
    }

    #[test]
    fn exposure_mapping_round_trips() {
        // -5 log2-seconds is 1/32 s = 312.5 units
        assert_eq!(exposure_to_v4l2(-5.0), 313);
        let back = exposure_from_v4l2(313);
        assert!((back - -5.0).abs() < 0.01);
    }

    #[test]
    fn exposure_units_never_reach_zero() {
        assert_eq!(exposure_to_v4l2(-30.0), 1);
    }

    #[test]
    fn yuyv_converter_emits_rgb24() {
        // 2x1 image, both pixels mid gray
        let data = [128u8, 128, 128, 128];
        let rgb = yuyv_to_rgb(&data, 2, 1);
        assert_eq!(rgb.len(), 6);
        // zero chroma means r == g == b
        assert_eq!(rgb[0], rgb[1]);
        assert_eq!(rgb[1], rgb[2]);
    }

    #[test]
    fn missing_node_fails_to_open() {
        let backend = V4l2Backend::default();
        let err = backend
            .open(&CameraSource::Path(PathBuf::from("/dev/video-nonexistent")))
            .unwrap_err();
        assert!(matches!(err, CameraError::DeviceUnavailable(_)));
    }
}
