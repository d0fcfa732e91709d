//! Swing detection.
//!
//! - `background`: adaptive per-pixel background model, mask opening and
//!   connected-region extraction.
//! - `motion`: the debounced, cooldown-gated `MotionDetector` built on top.

pub mod background;
mod motion;

pub use background::{BackgroundModel, ForegroundMask, Region};
pub use motion::{DetectorConfig, MotionDetector, MotionSample, MotionState};
