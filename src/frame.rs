// SPDX-License-Identifier: GPL-3.0-only

//! Frame type and the shared latest-frame buffer

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// One decoded image sample from the camera
///
/// Pixel data is tightly packed RGB24 (3 bytes per pixel, no padding).
/// Frames are plain owned values; cloning copies the pixel data, which is
/// what keeps consumers isolated from each other.
#[derive(Debug, Clone)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    /// RGB24 pixels, `width * height * 3` bytes
    pub data: Vec<u8>,
    /// When the frame was read from the device
    pub captured_at: Instant,
}

impl Frame {
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> Self {
        Self {
            width,
            height,
            data,
            captured_at: Instant::now(),
        }
    }

    /// Age of the frame relative to now
    pub fn age(&self) -> Duration {
        self.captured_at.elapsed()
    }

    /// Scale to the given resolution. Returns the frame unchanged when the
    /// size already matches; falls back to a black frame if the pixel data
    /// does not match the declared dimensions.
    pub fn resized(&self, width: u32, height: u32) -> Frame {
        if self.width == width && self.height == height {
            return self.clone();
        }
        let data = match image::RgbImage::from_raw(self.width, self.height, self.data.clone()) {
            Some(img) => {
                image::imageops::resize(&img, width, height, image::imageops::FilterType::Triangle)
                    .into_raw()
            }
            None => vec![0u8; (width * height * 3) as usize],
        };
        Frame {
            width,
            height,
            data,
            captured_at: self.captured_at,
        }
    }
}

/// Thread-safe holder of the most recently captured frame
///
/// Writers replace the whole frame atomically; readers always get an
/// independent copy, so mutating a returned frame never affects the stored
/// one. The lock is held only for the copy in/out, never across camera I/O.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    latest: Mutex<Option<Frame>>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the stored frame
    pub fn store(&self, frame: Frame) {
        *self.latest.lock().unwrap() = Some(frame);
    }

    /// Copy of the latest frame, if any
    pub fn latest(&self) -> Option<Frame> {
        self.latest.lock().unwrap().clone()
    }

    /// Age of the latest frame, `None` when empty
    pub fn age(&self) -> Option<Duration> {
        self.latest.lock().unwrap().as_ref().map(|f| f.age())
    }

    /// Drop the stored frame (used on shutdown/restart)
    pub fn clear(&self) {
        *self.latest.lock().unwrap() = None;
    }
}
