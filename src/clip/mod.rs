//! Clip records and clip assembly.
//!
//! - `Clip`: the persisted, immutable record for one round's copy of a shot.
//! - `encode`: turning buffered frames into a video artifact and poster.
//! - `assembler`: the ingestion loop and its status/trigger surface.
//! - `workers`: bounded pool that runs clip creation off the ingestion thread.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::rounds::RoundId;
use crate::storage::StoredArtifacts;

mod assembler;
mod encode;
mod workers;

pub use assembler::{AssemblerControl, ClipAssembler, ProcessorStatus};
pub use encode::{ClipEncoder, MjpegAviEncoder, DEFAULT_JPEG_QUALITY};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMethod {
    MotionDetection,
    Manual,
}

impl DetectionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MotionDetection => "motion_detection",
            Self::Manual => "manual",
        }
    }
}

impl std::str::FromStr for DetectionMethod {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> anyhow::Result<Self> {
        match value {
            "motion_detection" => Ok(Self::MotionDetection),
            "manual" => Ok(Self::Manual),
            other => Err(anyhow::anyhow!("unknown detection method '{}'", other)),
        }
    }
}

/// Persisted clip record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Clip {
    pub id: String,
    pub round_id: RoundId,
    pub hole_number: u32,
    pub camera_id: String,
    pub video_locator: String,
    pub poster_locator: String,
    pub duration_seconds: u32,
    pub frame_count: u32,
    /// Hex SHA-256 of the video artifact.
    pub video_sha256: String,
    pub created_at: DateTime<Utc>,
    /// Detection (or trigger) time shared by every clip of one event.
    pub detected_at: DateTime<Utc>,
    pub auto_generated: bool,
    pub detection_method: DetectionMethod,
}

/// Everything about a clip that is known before storage hands back locators.
#[derive(Clone, Debug)]
pub struct ClipDraft {
    pub id: String,
    pub round_id: RoundId,
    pub hole_number: u32,
    pub camera_id: String,
    pub duration_seconds: u32,
    pub frame_count: u32,
    pub video_sha256: String,
    pub video_extension: &'static str,
    pub detected_at: DateTime<Utc>,
    pub detection_method: DetectionMethod,
}

impl ClipDraft {
    pub fn into_clip(self, artifacts: StoredArtifacts, created_at: DateTime<Utc>) -> Clip {
        Clip {
            id: self.id,
            round_id: self.round_id,
            hole_number: self.hole_number,
            camera_id: self.camera_id,
            video_locator: artifacts.video_locator,
            poster_locator: artifacts.poster_locator,
            duration_seconds: self.duration_seconds,
            frame_count: self.frame_count,
            video_sha256: self.video_sha256,
            created_at,
            detected_at: self.detected_at,
            auto_generated: self.detection_method == DetectionMethod::MotionDetection,
            detection_method: self.detection_method,
        }
    }
}

/// Result of a manual trigger.
#[derive(Clone, Debug, Serialize)]
pub struct ClipSummary {
    pub triggered_at: DateTime<Utc>,
    pub frame_count: usize,
    /// True when the latest frame was repeated to fill the clip.
    pub synthesized: bool,
    pub rounds: usize,
    pub clips: Vec<Clip>,
    pub failures: usize,
}

/// Clip shape and assembler tuning.
#[derive(Clone, Debug)]
pub struct ClipSettings {
    /// Clip length, centred on the detection time.
    pub duration: Duration,
    /// Nominal ingestion and playback rate.
    pub target_fps: u32,
    pub camera_id: String,
    pub hole_number: u32,
    pub workers: usize,
    pub queue_depth: usize,
    /// Wait for the trailing half of the window before extracting.
    pub post_roll: bool,
    /// How long `stop` waits for the ingestion thread.
    pub stop_timeout: Duration,
    /// JPEG quality (1-100) for video frames and posters.
    pub jpeg_quality: u8,
}

impl Default for ClipSettings {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(10),
            target_fps: 30,
            camera_id: "lexington_hole_1".to_string(),
            hole_number: 1,
            workers: 2,
            queue_depth: 8,
            post_roll: true,
            stop_timeout: Duration::from_secs(5),
            jpeg_quality: DEFAULT_JPEG_QUALITY,
        }
    }
}

impl ClipSettings {
    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs(1) / self.target_fps.max(1)
    }

    /// Frames a full clip holds at the nominal rate.
    pub fn nominal_frames(&self) -> usize {
        (self.duration.as_secs_f64() * self.target_fps as f64).round() as usize
    }

    pub fn duration_seconds(&self, frame_count: usize) -> u32 {
        (frame_count / self.target_fps.max(1) as usize) as u32
    }
}

/// Random version-4 UUID.
pub fn new_clip_id() -> String {
    Uuid::new_v4().to_string()
}
