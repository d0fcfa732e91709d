//! Frames and the bounded recent-history buffer.
//!
//! - `Frame`: RGB pixels plus capture timestamp. Pixels are immutable and shared,
//!   so a cloned frame is a stable copy that later buffer churn cannot touch.
//! - `FrameBuffer`: FIFO ring of recent frames with time-window extraction.
//!
//! The buffer never performs I/O while holding its lock.

use anyhow::{anyhow, Result};
use image::RgbImage;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Default frame buffer capacity.
/// At 30 fps, 300 frames = 10 seconds of history.
pub const DEFAULT_BUFFER_FRAMES: usize = 300;

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

#[derive(Clone)]
pub struct Frame {
    image: Arc<RgbImage>,
    captured_at: SystemTime,
}

impl Frame {
    pub fn new(image: RgbImage, captured_at: SystemTime) -> Self {
        Self {
            image: Arc::new(image),
            captured_at,
        }
    }

    /// Build a frame from packed RGB8 pixels.
    pub fn from_rgb(
        width: u32,
        height: u32,
        pixels: Vec<u8>,
        captured_at: SystemTime,
    ) -> Result<Self> {
        let expected = width as usize * height as usize * 3;
        let got = pixels.len();
        let image = RgbImage::from_raw(width, height, pixels).ok_or_else(|| {
            anyhow!(
                "rgb buffer is {} bytes, expected {} for {}x{}",
                got,
                expected,
                width,
                height
            )
        })?;
        Ok(Self::new(image, captured_at))
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn captured_at(&self) -> SystemTime {
        self.captured_at
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    /// Same pixels, different timestamp.
    pub fn restamped(&self, captured_at: SystemTime) -> Self {
        Self {
            image: Arc::clone(&self.image),
            captured_at,
        }
    }

    pub fn byte_len(&self) -> usize {
        self.image.as_raw().len()
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width())
            .field("height", &self.height())
            .field("captured_at", &self.captured_at)
            .finish()
    }
}

// ----------------------------------------------------------------------------
// FrameBuffer
// ----------------------------------------------------------------------------

/// Bounded, time-ordered store of recent frames.
///
/// - Capacity is a fixed frame count; inserting past it evicts the oldest frame.
/// - `window` returns copies, never more frames than are buffered, and never
///   anything outside the requested bounds.
/// - One mutex serializes all access; critical sections are O(1) for `add` and
///   O(len) for `window`.
pub struct FrameBuffer {
    frames: Mutex<VecDeque<Frame>>,
    capacity: usize,
}

impl FrameBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            frames: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Frame>> {
        // Entries are immutable frames; a panicked writer cannot leave one half-built.
        self.frames.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a frame, evicting the oldest entry when at capacity.
    pub fn add(&self, frame: Frame) {
        let mut frames = self.lock();
        while frames.len() >= self.capacity {
            frames.pop_front();
        }
        frames.push_back(frame);
    }

    /// Frames captured within `[trigger - duration/2, trigger + duration/2]`,
    /// ascending by timestamp.
    ///
    /// Returns whatever part of the window is buffered; an empty buffer or a
    /// window with no history yields an empty vector.
    pub fn window(&self, trigger: SystemTime, duration: Duration) -> Vec<Frame> {
        let half = duration / 2;
        let start = trigger.checked_sub(half).unwrap_or(UNIX_EPOCH);
        let end = trigger.checked_add(half);

        let mut out: Vec<Frame> = {
            let frames = self.lock();
            frames
                .iter()
                .filter(|frame| {
                    let ts = frame.captured_at();
                    ts >= start && end.map_or(true, |end| ts <= end)
                })
                .cloned()
                .collect()
        };
        // Arrival order is normally timestamp order; a stepped wall clock is the exception.
        out.sort_by_key(Frame::captured_at);
        out
    }

    /// Most recently added frame.
    pub fn latest(&self) -> Option<Frame> {
        self.lock().back().cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Pixel bytes currently held, for status reporting.
    pub fn memory_bytes(&self) -> usize {
        self.lock().iter().map(Frame::byte_len).sum()
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_FRAMES)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
