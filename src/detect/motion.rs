use anyhow::Result;
use std::time::{Duration, SystemTime};

use super::background::{BackgroundModel, DEFAULT_LEARNING_RATE, DEFAULT_VAR_THRESHOLD};
use crate::error::ClipError;
use crate::frame::Frame;

/// Calibration knobs for one camera installation.
#[derive(Clone, Debug, PartialEq)]
pub struct DetectorConfig {
    /// Total foreground area (pixels) a frame must exceed to qualify.
    pub motion_threshold: f64,
    /// Consecutive qualifying frames needed to fire.
    pub consecutive_frames: u32,
    /// Minimum time between two fires.
    pub cooldown: Duration,
    /// Squared-distance multiple of variance that marks a pixel foreground.
    pub var_threshold: f32,
    /// Background adaptation rate per frame, in (0, 1].
    pub learning_rate: f32,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            motion_threshold: 5000.0,
            consecutive_frames: 3,
            cooldown: Duration::from_secs(10),
            var_threshold: DEFAULT_VAR_THRESHOLD,
            learning_rate: DEFAULT_LEARNING_RATE,
        }
    }
}

impl DetectorConfig {
    pub fn validate(&self) -> Result<(), ClipError> {
        if !(self.motion_threshold.is_finite() && self.motion_threshold > 0.0) {
            return Err(ClipError::InvalidDetectorConfig(format!(
                "motion_threshold must be positive, got {}",
                self.motion_threshold
            )));
        }
        if self.consecutive_frames == 0 {
            return Err(ClipError::InvalidDetectorConfig(
                "consecutive_frames must be at least 1".to_string(),
            ));
        }
        if !(self.var_threshold.is_finite() && self.var_threshold > 0.0) {
            return Err(ClipError::InvalidDetectorConfig(format!(
                "var_threshold must be positive, got {}",
                self.var_threshold
            )));
        }
        if !(self.learning_rate > 0.0 && self.learning_rate <= 1.0) {
            return Err(ClipError::InvalidDetectorConfig(format!(
                "learning_rate must be in (0, 1], got {}",
                self.learning_rate
            )));
        }
        Ok(())
    }
}

/// Hysteresis state derived from the counter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MotionState {
    Idle,
    Accumulating,
}

/// Foreground measurement for one frame.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct MotionSample {
    pub total_area: f64,
    pub regions: usize,
}

/// Per-camera swing detector.
///
/// Each frame is reduced to a total foreground area. A frame qualifies when
/// the area exceeds `motion_threshold` and the cooldown since the last fire
/// has elapsed; qualifying frames bump a counter, anything else decays it by
/// one (never below zero). When the counter reaches `consecutive_frames` the
/// detector fires once and returns to `Idle`.
///
/// Owned by exactly one ingestion loop. State is only cleared by `reset`.
pub struct MotionDetector {
    config: DetectorConfig,
    background: BackgroundModel,
    counter: u32,
    last_fire: Option<SystemTime>,
}

impl MotionDetector {
    pub fn new(config: DetectorConfig) -> Result<Self> {
        config.validate()?;
        let background = BackgroundModel::new(config.var_threshold, config.learning_rate);
        Ok(Self {
            config,
            background,
            counter: 0,
            last_fire: None,
        })
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Measure `frame` and advance the state machine at the frame's timestamp.
    pub fn classify(&mut self, frame: &Frame) -> bool {
        let sample = self.measure(frame);
        self.observe_area(sample.total_area, frame.captured_at())
    }

    /// Update the background with `frame` and report its foreground area.
    pub fn measure(&mut self, frame: &Frame) -> MotionSample {
        let luma = image::imageops::grayscale(frame.image());
        let mask = self.background.apply(&luma).open();
        let regions = mask.regions();
        MotionSample {
            total_area: regions.iter().map(|r| r.area as f64).sum(),
            regions: regions.len(),
        }
    }

    /// Advance the hysteresis counter with a precomputed area.
    pub fn observe_area(&mut self, total_area: f64, now: SystemTime) -> bool {
        if total_area > self.config.motion_threshold && self.cooldown_elapsed(now) {
            self.counter += 1;
        } else {
            self.counter = self.counter.saturating_sub(1);
        }

        if self.counter >= self.config.consecutive_frames {
            self.counter = 0;
            self.last_fire = Some(now);
            return true;
        }
        false
    }

    fn cooldown_elapsed(&self, now: SystemTime) -> bool {
        match self.last_fire {
            None => true,
            // A clock that stepped backwards keeps the detector in cooldown.
            Some(last) => now
                .duration_since(last)
                .map(|elapsed| elapsed > self.config.cooldown)
                .unwrap_or(false),
        }
    }

    pub fn counter(&self) -> u32 {
        self.counter
    }

    pub fn last_fire(&self) -> Option<SystemTime> {
        self.last_fire
    }

    pub fn state(&self) -> MotionState {
        if self.counter == 0 {
            MotionState::Idle
        } else {
            MotionState::Accumulating
        }
    }

    /// Re-initialize: forget the background, the counter and the last fire.
    pub fn reset(&mut self) {
        self.background.reset();
        self.counter = 0;
        self.last_fire = None;
    }
}
