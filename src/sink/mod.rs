// SPDX-License-Identifier: GPL-3.0-only

//! Persistence boundary for stills and video
//!
//! The capture side hands decoded RGB frames to a sink and never touches
//! container or codec details itself. [`PhotoSink`] persists one still,
//! [`VideoSink`] accepts a frame sequence and must be finished exactly once.

pub mod avi;

use crate::errors::{CameraError, CameraResult};
use crate::frame::Frame;
use chrono::Local;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

/// Video codecs the recording pipeline can produce
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VideoCodec {
    #[default]
    Mjpeg,
}

impl fmt::Display for VideoCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VideoCodec::Mjpeg => write!(f, "MJPG"),
        }
    }
}

/// Writes one still image and reports where it landed
pub trait PhotoSink: Send + Sync {
    /// Persist the frame, optionally under a named subdirectory
    fn save_photo(&self, frame: &Frame, subdir: Option<&str>) -> CameraResult<PathBuf>;
}

/// Consumes an ordered frame sequence. `finish` finalizes the container;
/// frames written after it are an error.
pub trait VideoSink {
    fn write_frame(&mut self, frame: &Frame) -> CameraResult<()>;
    fn finish(&mut self) -> CameraResult<()>;
}

/// JPEG stills under a base directory, named by capture time
pub struct JpegPhotoSink {
    base_dir: PathBuf,
    quality: u8,
}

impl JpegPhotoSink {
    pub fn new(base_dir: PathBuf, quality: u8) -> Self {
        Self {
            base_dir,
            quality: quality.clamp(1, 100),
        }
    }
}

impl PhotoSink for JpegPhotoSink {
    fn save_photo(&self, frame: &Frame, subdir: Option<&str>) -> CameraResult<PathBuf> {
        let dir = match subdir {
            Some(sub) => self.base_dir.join(sub),
            None => self.base_dir.clone(),
        };
        fs::create_dir_all(&dir)
            .map_err(|e| CameraError::Io(format!("creating {}: {}", dir.display(), e)))?;

        let name = format!("photo_{}.jpg", Local::now().format("%Y%m%d_%H%M%S"));
        let path = dir.join(name);

        let mut out = Vec::new();
        let mut encoder =
            image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, self.quality);
        encoder
            .encode(
                &frame.data,
                frame.width,
                frame.height,
                image::ExtendedColorType::Rgb8,
            )
            .map_err(|e| CameraError::EncodingFailure(format!("jpeg encode: {}", e)))?;
        fs::write(&path, &out)
            .map_err(|e| CameraError::Io(format!("writing {}: {}", path.display(), e)))?;

        info!(path = %path.display(), bytes = out.len(), "photo saved");
        Ok(path)
    }
}

/// Open a video sink for the given codec, writing to the given path
pub fn open_video_file(
    path: &Path,
    codec: VideoCodec,
    width: u32,
    height: u32,
    fps: u32,
) -> CameraResult<Box<dyn VideoSink + Send>> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| CameraError::Io(format!("creating {}: {}", parent.display(), e)))?;
    }
    let file = fs::File::create(path)
        .map_err(|e| CameraError::EncodingFailure(format!("creating {}: {}", path.display(), e)))?;
    match codec {
        VideoCodec::Mjpeg => {
            let writer = avi::MjpegAviWriter::new(std::io::BufWriter::new(file), width, height, fps)?;
            Ok(Box::new(writer))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_frame() -> Frame {
        Frame::new(16, 8, vec![120; 16 * 8 * 3])
    }

    #[test]
    fn photo_sink_writes_a_jpeg() {
        let dir = std::env::temp_dir().join(format!("camkeeper-photo-{}", std::process::id()));
        let sink = JpegPhotoSink::new(dir.clone(), 90);

        let path = sink.save_photo(&test_frame(), None).unwrap();
        let bytes = fs::read(&path).unwrap();
        // JPEG SOI marker
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn video_file_opens_for_the_selected_codec() {
        let dir = std::env::temp_dir().join(format!("camkeeper-video-{}", std::process::id()));
        let path = dir.join("clip.avi");

        let mut sink = open_video_file(&path, VideoCodec::Mjpeg, 16, 8, 10).unwrap();
        sink.write_frame(&test_frame()).unwrap();
        sink.finish().unwrap();

        let bytes = fs::read(&path).unwrap();
        assert_eq!(&bytes[0..4], b"RIFF");
        assert!(bytes.windows(4).any(|w| w == b"MJPG"));

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn photo_sink_honors_subdirectory() {
        let dir = std::env::temp_dir().join(format!("camkeeper-photo-sub-{}", std::process::id()));
        let sink = JpegPhotoSink::new(dir.clone(), 90);

        let path = sink.save_photo(&test_frame(), Some("timelapse")).unwrap();
        assert!(path.starts_with(dir.join("timelapse")));

        fs::remove_dir_all(&dir).ok();
    }
}
