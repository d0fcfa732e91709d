//! Swing clipper
//!
//! This crate turns a single golf-course camera feed into short, round-tagged
//! video clips of each shot.
//!
//! # Architecture
//!
//! The pipeline is built from small owned pieces:
//!
//! 1. **Frame source**: polls a JPEG snapshot endpoint or reads an MJPEG stream,
//!    publishing the latest frame with exponential backoff on failure.
//! 2. **Frame buffer**: bounded FIFO of recent frames with time-window reads.
//! 3. **Motion detector**: adaptive background model + region-area threshold,
//!    debounced by a consecutive-frame counter and gated by a cooldown.
//! 4. **Clip assembler**: ingestion thread plus a bounded clip worker pool that
//!    encodes and persists one clip per active round.
//!
//! # Module Structure
//!
//! - `frame`: Frame, FrameBuffer
//! - `ingest`: frame grabbers, FrameSource, LatestFrame, backoff
//! - `detect`: background model and the MotionDetector state machine
//! - `clip`: clip records, encoding, the assembler and its workers
//! - `storage` / `rounds`: collaborator traits and their implementations
//! - `api`: loopback control surface used by `shotd`

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};

pub mod api;
pub mod clip;
pub mod config;
pub mod detect;
pub mod error;
pub mod frame;
pub mod ingest;
pub mod rounds;
pub mod storage;

pub use clip::{
    AssemblerControl, Clip, ClipAssembler, ClipDraft, ClipEncoder, ClipSettings, ClipSummary,
    DetectionMethod, MjpegAviEncoder, ProcessorStatus,
};
pub use detect::{DetectorConfig, MotionDetector, MotionSample, MotionState};
pub use error::ClipError;
pub use frame::{Frame, FrameBuffer, DEFAULT_BUFFER_FRAMES};
pub use ingest::{
    Backoff, FrameFeed, FrameGrabber, FrameSource, HttpSnapshotGrabber, LatestFrame,
    LatestFrameFeed, MjpegStreamGrabber, SourceHandle, SyntheticGrabber,
};
pub use rounds::{RoundId, RoundRegistry, SqliteRoundRegistry, StaticRoundRegistry};
pub use storage::{ClipStats, ClipStore, FilesystemClipStore, InMemoryClipStore, StoredArtifacts};

// -------------------- Clock --------------------

/// Time source for frame stamps, cooldowns and clip records.
///
/// Everything that reads "now" goes through a `Clock` so tests can run the
/// pipeline against a scripted timeline.
pub trait Clock: Send + Sync {
    fn now(&self) -> SystemTime;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// Manually advanced clock for deterministic tests and replays.
#[derive(Clone, Debug)]
pub struct ManualClock {
    now: Arc<Mutex<SystemTime>>,
}

impl ManualClock {
    pub fn new(start: SystemTime) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    /// Clock starting `secs` after the Unix epoch.
    pub fn at_unix_secs(secs: u64) -> Self {
        Self::new(UNIX_EPOCH + Duration::from_secs(secs))
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += by;
    }

    pub fn set(&self, to: SystemTime) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> SystemTime {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Milliseconds since the Unix epoch, saturating at zero for pre-epoch times.
pub fn unix_millis(t: SystemTime) -> u128 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

/// UTC view of a `SystemTime` for records and status payloads.
pub fn utc(t: SystemTime) -> DateTime<Utc> {
    DateTime::<Utc>::from(t)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::at_unix_secs(100);
        clock.advance(Duration::from_millis(1500));
        assert_eq!(unix_millis(clock.now()), 101_500);
        clock.set(UNIX_EPOCH);
        assert_eq!(unix_millis(clock.now()), 0);
    }

    #[test]
    fn utc_formats_rfc3339() {
        let t = UNIX_EPOCH + Duration::from_secs(86_400);
        assert_eq!(utc(t).to_rfc3339(), "1970-01-02T00:00:00+00:00");
    }
}
