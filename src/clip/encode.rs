//! Clip encoding.
//!
//! `MjpegAviEncoder` writes Motion-JPEG inside a RIFF/AVI container: every
//! frame is an independent JPEG, so encoding needs nothing beyond the image
//! crate and the result plays in any mainstream player.

use anyhow::{anyhow, Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::RgbImage;

use crate::frame::Frame;

pub const DEFAULT_JPEG_QUALITY: u8 = 85;

/// Turns an ordered frame list into a playable video and a poster image.
pub trait ClipEncoder: Send + Sync {
    /// File extension of `encode_video` output, without the dot.
    fn video_extension(&self) -> &'static str;

    fn encode_video(&self, frames: &[Frame], fps: u32) -> Result<Vec<u8>>;

    /// Still JPEG representing the clip.
    fn encode_poster(&self, frame: &Frame) -> Result<Vec<u8>>;
}

#[derive(Clone, Copy, Debug)]
pub struct MjpegAviEncoder {
    quality: u8,
}

impl MjpegAviEncoder {
    pub fn new(quality: u8) -> Self {
        Self {
            quality: quality.clamp(1, 100),
        }
    }

    fn jpeg(&self, image: &RgbImage) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        JpegEncoder::new_with_quality(&mut out, self.quality)
            .encode_image(image)
            .context("jpeg encode failed")?;
        Ok(out)
    }
}

impl Default for MjpegAviEncoder {
    fn default() -> Self {
        Self::new(DEFAULT_JPEG_QUALITY)
    }
}

impl ClipEncoder for MjpegAviEncoder {
    fn video_extension(&self) -> &'static str {
        "avi"
    }

    fn encode_video(&self, frames: &[Frame], fps: u32) -> Result<Vec<u8>> {
        let first = frames
            .first()
            .ok_or_else(|| anyhow!("cannot encode a clip with no frames"))?;
        if fps == 0 {
            return Err(anyhow!("fps must be positive"));
        }
        let (width, height) = (first.width(), first.height());

        // Mid-clip resolution changes are scaled to the first frame's size.
        let mut jpegs = Vec::with_capacity(frames.len());
        for frame in frames {
            let jpeg = if frame.width() == width && frame.height() == height {
                self.jpeg(frame.image())?
            } else {
                let resized =
                    image::imageops::resize(frame.image(), width, height, FilterType::Triangle);
                self.jpeg(&resized)?
            };
            jpegs.push(jpeg);
        }

        write_avi(&jpegs, width, height, fps)
    }

    fn encode_poster(&self, frame: &Frame) -> Result<Vec<u8>> {
        self.jpeg(frame.image())
    }
}

// ----------------------------------------------------------------------------
// RIFF/AVI writer
// ----------------------------------------------------------------------------

const AVIF_HASINDEX: u32 = 0x10;
const AVIIF_KEYFRAME: u32 = 0x10;

struct RiffWriter {
    buf: Vec<u8>,
    open: Vec<usize>,
}

impl RiffWriter {
    fn new() -> Self {
        Self {
            buf: Vec::new(),
            open: Vec::new(),
        }
    }

    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn fourcc(&mut self, code: &[u8; 4]) {
        self.buf.extend_from_slice(code);
    }

    /// Open a `RIFF` or `LIST` with a form type; sizes are patched on close.
    fn begin(&mut self, kind: &[u8; 4], form: &[u8; 4]) {
        self.fourcc(kind);
        self.open.push(self.buf.len());
        self.u32(0);
        self.fourcc(form);
    }

    fn end(&mut self) -> Result<()> {
        let at = self
            .open
            .pop()
            .ok_or_else(|| anyhow!("unbalanced riff list"))?;
        let size = u32::try_from(self.buf.len() - at - 4).context("riff list too large")?;
        self.buf[at..at + 4].copy_from_slice(&size.to_le_bytes());
        Ok(())
    }

    /// Write a chunk and return the offset of its id.
    fn chunk(&mut self, id: &[u8; 4], data: &[u8]) -> Result<usize> {
        let start = self.buf.len();
        self.fourcc(id);
        self.u32(u32::try_from(data.len()).context("riff chunk too large")?);
        self.buf.extend_from_slice(data);
        if data.len() % 2 == 1 {
            self.buf.push(0);
        }
        Ok(start)
    }

    fn finish(self) -> Result<Vec<u8>> {
        if !self.open.is_empty() {
            return Err(anyhow!("riff list left open"));
        }
        Ok(self.buf)
    }
}

fn le_fields(values: &[u32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn write_avi(jpegs: &[Vec<u8>], width: u32, height: u32, fps: u32) -> Result<Vec<u8>> {
    let frame_count = u32::try_from(jpegs.len()).context("too many frames")?;
    let max_frame = jpegs.iter().map(Vec::len).max().unwrap_or(0) as u32;
    let micros_per_frame = 1_000_000 / fps;

    let mut w = RiffWriter::new();
    w.begin(b"RIFF", b"AVI ");

    w.begin(b"LIST", b"hdrl");
    let avih = le_fields(&[
        micros_per_frame,
        max_frame.saturating_mul(fps),
        0,
        AVIF_HASINDEX,
        frame_count,
        0,
        1,
        max_frame,
        width,
        height,
        0,
        0,
        0,
        0,
    ]);
    w.chunk(b"avih", &avih)?;

    w.begin(b"LIST", b"strl");
    let mut strh = Vec::with_capacity(56);
    strh.extend_from_slice(b"vids");
    strh.extend_from_slice(b"MJPG");
    strh.extend(le_fields(&[0, 0, 0, 1, fps, 0, frame_count, max_frame, u32::MAX, 0]));
    // rcFrame: left, top, right, bottom as 16-bit values.
    for v in [0u16, 0, width as u16, height as u16] {
        strh.extend_from_slice(&v.to_le_bytes());
    }
    w.chunk(b"strh", &strh)?;

    let mut strf = le_fields(&[40, width, height]);
    strf.extend_from_slice(&1u16.to_le_bytes());
    strf.extend_from_slice(&24u16.to_le_bytes());
    strf.extend_from_slice(b"MJPG");
    strf.extend(le_fields(&[width * height * 3, 0, 0, 0, 0]));
    w.chunk(b"strf", &strf)?;
    w.end()?; // strl
    w.end()?; // hdrl

    w.begin(b"LIST", b"movi");
    let movi_base = w.buf.len() - 4;
    let mut index = Vec::with_capacity(jpegs.len());
    for jpeg in jpegs {
        let at = w.chunk(b"00dc", jpeg)?;
        index.push(((at - movi_base) as u32, jpeg.len() as u32));
    }
    w.end()?; // movi

    w.fourcc(b"idx1");
    w.u32(frame_count * 16);
    for (offset, size) in index {
        w.fourcc(b"00dc");
        w.u32(AVIIF_KEYFRAME);
        w.u32(offset);
        w.u32(size);
    }
    w.end()?; // RIFF

    w.finish()
}
