// SPDX-License-Identifier: GPL-3.0-only

//! MJPEG-in-AVI muxer
//!
//! Writes a classic RIFF AVI: one `vids` stream of JPEG-compressed frames
//! plus an `idx1` index. Sizes and frame counts are placeholders until
//! `finish` seeks back and patches them, so an unfinished file is invalid
//! on purpose rather than silently truncated.

use super::VideoSink;
use crate::errors::{CameraError, CameraResult};
use crate::frame::Frame;
use std::io::{Seek, SeekFrom, Write};
use tracing::debug;

const AVIF_HASINDEX: u32 = 0x10;
const AVIIF_KEYFRAME: u32 = 0x10;
const JPEG_QUALITY: u8 = 85;

/// Offsets of the size/count fields patched in `finish`
struct PatchOffsets {
    riff_size: u64,
    total_frames: u64,
    stream_length: u64,
    movi_size: u64,
}

pub struct MjpegAviWriter<W: Write + Seek> {
    out: W,
    width: u32,
    height: u32,
    frames: u32,
    /// (offset of chunk fourcc relative to the `movi` fourcc, payload size)
    index: Vec<(u32, u32)>,
    /// Stream position of the `movi` fourcc
    movi_data_start: u64,
    offsets: PatchOffsets,
    finished: bool,
}

fn io_err(what: &str, e: std::io::Error) -> CameraError {
    CameraError::EncodingFailure(format!("{}: {}", what, e))
}

/// idx1 offsets are 32-bit; past 4 GiB of movi data they would wrap, so
/// the writer refuses further frames instead
fn index_offset(chunk_pos: u64, movi_data_start: u64) -> CameraResult<u32> {
    u32::try_from(chunk_pos - movi_data_start)
        .map_err(|_| CameraError::EncodingFailure("movi data exceeds the 4 GiB AVI limit".into()))
}

impl<W: Write + Seek> MjpegAviWriter<W> {
    pub fn new(mut out: W, width: u32, height: u32, fps: u32) -> CameraResult<Self> {
        let fps = fps.max(1);
        let us_per_frame = 1_000_000 / fps;

        let mut write =
            |bytes: &[u8]| out.write_all(bytes).map_err(|e| io_err("avi header", e));

        // The header layout is fixed, so the patch offsets are constants:
        //   4: RIFF size
        //  48: avih total_frames (avih payload starts at 32)
        // 140: strh length (strh payload starts at 108)
        // 216: movi list size ("movi" fourcc at 220)
        write(b"RIFF")?;
        write(&0u32.to_le_bytes())?;
        write(b"AVI ")?;

        // hdrl list: avih (64) + strl list (124) + "hdrl" tag (4)
        write(b"LIST")?;
        write(&192u32.to_le_bytes())?;
        write(b"hdrl")?;

        write(b"avih")?;
        write(&56u32.to_le_bytes())?;
        write(&us_per_frame.to_le_bytes())?;
        write(&(width * height * 3 * fps).to_le_bytes())?; // max bytes/sec hint
        write(&0u32.to_le_bytes())?; // padding granularity
        write(&AVIF_HASINDEX.to_le_bytes())?;
        write(&0u32.to_le_bytes())?; // total frames, patched in finish
        write(&0u32.to_le_bytes())?; // initial frames
        write(&1u32.to_le_bytes())?; // streams
        write(&(width * height * 3).to_le_bytes())?; // suggested buffer
        write(&width.to_le_bytes())?;
        write(&height.to_le_bytes())?;
        write(&[0u8; 16])?; // reserved

        write(b"LIST")?;
        write(&116u32.to_le_bytes())?;
        write(b"strl")?;

        write(b"strh")?;
        write(&56u32.to_le_bytes())?;
        write(b"vids")?;
        write(b"MJPG")?;
        write(&0u32.to_le_bytes())?; // flags
        write(&0u32.to_le_bytes())?; // priority + language
        write(&0u32.to_le_bytes())?; // initial frames
        write(&1u32.to_le_bytes())?; // scale
        write(&fps.to_le_bytes())?; // rate
        write(&0u32.to_le_bytes())?; // start
        write(&0u32.to_le_bytes())?; // length in frames, patched in finish
        write(&(width * height * 3).to_le_bytes())?; // suggested buffer
        write(&u32::MAX.to_le_bytes())?; // quality (-1: default)
        write(&0u32.to_le_bytes())?; // sample size
        write(&[0u8; 8])?; // rcFrame

        write(b"strf")?;
        write(&40u32.to_le_bytes())?;
        write(&40u32.to_le_bytes())?; // biSize
        write(&width.to_le_bytes())?;
        write(&height.to_le_bytes())?;
        write(&1u16.to_le_bytes())?; // planes
        write(&24u16.to_le_bytes())?; // bit count
        write(b"MJPG")?; // compression
        write(&(width * height * 3).to_le_bytes())?; // image size
        write(&[0u8; 16])?; // resolution and palette fields

        write(b"LIST")?;
        write(&0u32.to_le_bytes())?; // movi list size, patched in finish
        write(b"movi")?;

        debug!(width, height, fps, "avi writer initialized");

        Ok(Self {
            out,
            width,
            height,
            frames: 0,
            index: Vec::new(),
            movi_data_start: 220,
            offsets: PatchOffsets {
                riff_size: 4,
                total_frames: 48,
                stream_length: 140,
                movi_size: 216,
            },
            finished: false,
        })
    }

    pub fn frames_written(&self) -> u32 {
        self.frames
    }

    fn encode_jpeg(&self, frame: &Frame) -> CameraResult<Vec<u8>> {
        let frame = frame.resized(self.width, self.height);
        let mut out = Vec::new();
        let mut encoder =
            image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY);
        encoder
            .encode(
                &frame.data,
                frame.width,
                frame.height,
                image::ExtendedColorType::Rgb8,
            )
            .map_err(|e| CameraError::EncodingFailure(format!("jpeg encode: {}", e)))?;
        Ok(out)
    }
}

impl<W: Write + Seek> VideoSink for MjpegAviWriter<W> {
    fn write_frame(&mut self, frame: &Frame) -> CameraResult<()> {
        if self.finished {
            return Err(CameraError::EncodingFailure(
                "write after finish".to_string(),
            ));
        }

        let jpeg = self.encode_jpeg(frame)?;
        let chunk_pos = self
            .out
            .stream_position()
            .map_err(|e| io_err("stream position", e))?;
        // Checked before anything is written so a refused frame leaves no
        // partial chunk behind
        let offset = index_offset(chunk_pos, self.movi_data_start)?;

        self.out
            .write_all(b"00dc")
            .and_then(|_| self.out.write_all(&(jpeg.len() as u32).to_le_bytes()))
            .and_then(|_| self.out.write_all(&jpeg))
            .map_err(|e| io_err("frame chunk", e))?;
        if jpeg.len() % 2 == 1 {
            self.out.write_all(&[0]).map_err(|e| io_err("pad", e))?;
        }

        // idx1 offsets are relative to the "movi" fourcc; the first chunk
        // therefore sits at offset 4
        self.index.push((offset, jpeg.len() as u32));
        self.frames += 1;
        Ok(())
    }

    fn finish(&mut self) -> CameraResult<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;

        let movi_end = self
            .out
            .stream_position()
            .map_err(|e| io_err("stream position", e))?;

        // idx1
        self.out
            .write_all(b"idx1")
            .and_then(|_| {
                self.out
                    .write_all(&(self.index.len() as u32 * 16).to_le_bytes())
            })
            .map_err(|e| io_err("idx1 header", e))?;
        for (offset, size) in &self.index {
            self.out
                .write_all(b"00dc")
                .and_then(|_| self.out.write_all(&AVIIF_KEYFRAME.to_le_bytes()))
                .and_then(|_| self.out.write_all(&offset.to_le_bytes()))
                .and_then(|_| self.out.write_all(&size.to_le_bytes()))
                .map_err(|e| io_err("idx1 entry", e))?;
        }

        let file_end = self
            .out
            .stream_position()
            .map_err(|e| io_err("stream position", e))?;

        let mut patch = |offset: u64, value: u32| -> CameraResult<()> {
            self.out
                .seek(SeekFrom::Start(offset))
                .and_then(|_| self.out.write_all(&value.to_le_bytes()))
                .map_err(|e| io_err("patching header", e))
        };

        patch(self.offsets.riff_size, (file_end - 8) as u32)?;
        patch(self.offsets.total_frames, self.frames)?;
        patch(self.offsets.stream_length, self.frames)?;
        // list size covers the "movi" fourcc plus all chunks
        patch(self.offsets.movi_size, (movi_end - self.movi_data_start) as u32)?;

        self.out
            .seek(SeekFrom::End(0))
            .map_err(|e| io_err("seek end", e))?;
        self.out.flush().map_err(|e| io_err("flush", e))?;

        debug!(frames = self.frames, bytes = file_end, "avi finalized");
        Ok(())
    }
}
