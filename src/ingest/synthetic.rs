//! Synthetic scene (`stub://` URLs) for tests and the demo binary.
//!
//! Renders a static fairway-coloured backdrop with light sensor noise. Every
//! `swing_every` frames a bright block sweeps across the frame for
//! `swing_frames` frames, which is enough foreground area to trip the default
//! motion threshold.

use anyhow::Result;
use image::{Rgb, RgbImage};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::FrameGrabber;

#[derive(Clone, Debug)]
pub struct SyntheticConfig {
    pub width: u32,
    pub height: u32,
    /// Frames between the starts of two swings.
    pub swing_every: u64,
    /// Frames each swing lasts.
    pub swing_frames: u64,
    pub seed: u64,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 360,
            swing_every: 150,
            swing_frames: 12,
            seed: 7,
        }
    }
}

pub struct SyntheticGrabber {
    config: SyntheticConfig,
    frame_count: u64,
    rng: StdRng,
}

const BLOCK_WIDTH: u32 = 96;
const BLOCK_HEIGHT: u32 = 128;

impl SyntheticGrabber {
    pub fn new(config: SyntheticConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        Self {
            config,
            frame_count: 0,
            rng,
        }
    }

    pub fn frames_generated(&self) -> u64 {
        self.frame_count
    }

    /// True when the frame about to be rendered contains the swing block.
    fn swing_phase(&self) -> Option<u64> {
        if self.config.swing_every == 0 {
            return None;
        }
        let phase = self.frame_count % self.config.swing_every;
        // Skip the very first cycle so background models can settle.
        if self.frame_count >= self.config.swing_every && phase < self.config.swing_frames {
            Some(phase)
        } else {
            None
        }
    }

    fn render(&mut self) -> RgbImage {
        let SyntheticConfig { width, height, .. } = self.config;
        let mut image = RgbImage::new(width, height);
        for (_, y, pixel) in image.enumerate_pixels_mut() {
            let shade = 60 + (y * 40 / height.max(1)) as i16;
            let noise: i16 = self.rng.gen_range(-3..=3);
            let g = (shade + 30 + noise).clamp(0, 255) as u8;
            let rb = (shade + noise).clamp(0, 255) as u8;
            *pixel = Rgb([rb, g, rb]);
        }

        if let Some(phase) = self.swing_phase() {
            let travel = width.saturating_sub(BLOCK_WIDTH) as u64;
            let steps = self.config.swing_frames.max(1);
            let x0 = (travel * phase / steps) as u32;
            let y0 = height.saturating_sub(BLOCK_HEIGHT) / 2;
            for y in y0..(y0 + BLOCK_HEIGHT).min(height) {
                for x in x0..(x0 + BLOCK_WIDTH).min(width) {
                    image.put_pixel(x, y, Rgb([235, 235, 230]));
                }
            }
        }
        image
    }
}

impl Default for SyntheticGrabber {
    fn default() -> Self {
        Self::new(SyntheticConfig::default())
    }
}

impl FrameGrabber for SyntheticGrabber {
    fn describe(&self) -> String {
        format!(
            "synthetic {}x{} swing every {} frames",
            self.config.width, self.config.height, self.config.swing_every
        )
    }

    fn grab(&mut self) -> Result<RgbImage> {
        let image = self.render();
        self.frame_count += 1;
        Ok(image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> SyntheticGrabber {
        SyntheticGrabber::new(SyntheticConfig {
            width: 200,
            height: 160,
            swing_every: 10,
            swing_frames: 3,
            seed: 1,
        })
    }

    fn bright_pixels(image: &RgbImage) -> usize {
        image.pixels().filter(|p| p.0[0] > 200).count()
    }

    #[test]
    fn first_cycle_is_static() {
        let mut grabber = small();
        for _ in 0..10 {
            let image = grabber.grab().unwrap();
            assert_eq!(bright_pixels(&image), 0);
        }
    }

    #[test]
    fn swing_block_appears_on_schedule() {
        let mut grabber = small();
        let counts: Vec<usize> = (0..20)
            .map(|_| bright_pixels(&grabber.grab().unwrap()))
            .collect();
        assert!(counts[10] > 0 && counts[11] > 0 && counts[12] > 0);
        assert_eq!(counts[13], 0);
        assert_eq!(grabber.frames_generated(), 20);
    }
}
