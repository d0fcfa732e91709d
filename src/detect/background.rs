//! Adaptive background model and mask post-processing.
//!
//! The model keeps a running Gaussian (mean + variance) of luma per pixel. A
//! pixel is foreground when its squared distance from the mean exceeds
//! `var_threshold` times its variance. Both statistics adapt at
//! `learning_rate`, so slow lighting changes fold into the background while a
//! swing does not.

use image::GrayImage;

/// Initial per-pixel variance.
const VARIANCE_INIT: f32 = 15.0;
const VARIANCE_MIN: f32 = 4.0;
const VARIANCE_MAX: f32 = 75.0;

pub const DEFAULT_VAR_THRESHOLD: f32 = 50.0;
/// Roughly a 500-frame memory.
pub const DEFAULT_LEARNING_RATE: f32 = 0.002;

/// Binary foreground mask, row-major.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ForegroundMask {
    width: u32,
    height: u32,
    bits: Vec<bool>,
}

impl ForegroundMask {
    pub fn empty(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            bits: vec![false; width as usize * height as usize],
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    fn index(&self, x: u32, y: u32) -> usize {
        y as usize * self.width as usize + x as usize
    }

    pub fn get(&self, x: u32, y: u32) -> bool {
        self.bits[self.index(x, y)]
    }

    pub fn set(&mut self, x: u32, y: u32, value: bool) {
        let i = self.index(x, y);
        self.bits[i] = value;
    }

    pub fn count(&self) -> usize {
        self.bits.iter().filter(|b| **b).count()
    }

    /// Neighbour lookup for the cross-shaped 3x3 kernel.
    ///
    /// Out-of-range neighbours read as `border`.
    fn cross(&self, x: u32, y: u32, border: bool) -> [bool; 5] {
        let at = |dx: i64, dy: i64| {
            let nx = x as i64 + dx;
            let ny = y as i64 + dy;
            if nx < 0 || ny < 0 || nx >= self.width as i64 || ny >= self.height as i64 {
                border
            } else {
                self.get(nx as u32, ny as u32)
            }
        };
        [at(0, 0), at(-1, 0), at(1, 0), at(0, -1), at(0, 1)]
    }

    fn erode(&self) -> Self {
        let mut out = Self::empty(self.width, self.height);
        for y in 0..self.height {
            for x in 0..self.width {
                let keep = self.cross(x, y, true).iter().all(|b| *b);
                out.set(x, y, keep);
            }
        }
        out
    }

    fn dilate(&self) -> Self {
        let mut out = Self::empty(self.width, self.height);
        for y in 0..self.height {
            for x in 0..self.width {
                let grow = self.cross(x, y, false).iter().any(|b| *b);
                out.set(x, y, grow);
            }
        }
        out
    }

    /// Morphological opening (erode then dilate) with a 3x3 cross.
    ///
    /// Removes isolated specks and one-pixel slivers while keeping the
    /// footprint of solid regions.
    pub fn open(&self) -> Self {
        self.erode().dilate()
    }

    /// 8-connected foreground regions.
    pub fn regions(&self) -> Vec<Region> {
        let mut visited = vec![false; self.bits.len()];
        let mut regions = Vec::new();
        let mut stack = Vec::new();

        for start in 0..self.bits.len() {
            if !self.bits[start] || visited[start] {
                continue;
            }
            visited[start] = true;
            stack.push(start);
            let mut region = Region::seeded(
                (start % self.width as usize) as u32,
                (start / self.width as usize) as u32,
            );

            while let Some(i) = stack.pop() {
                let x = (i % self.width as usize) as i64;
                let y = (i / self.width as usize) as i64;
                region.include(x as u32, y as u32);
                for dy in -1..=1 {
                    for dx in -1..=1 {
                        let nx = x + dx;
                        let ny = y + dy;
                        if nx < 0 || ny < 0 || nx >= self.width as i64 || ny >= self.height as i64 {
                            continue;
                        }
                        let ni = ny as usize * self.width as usize + nx as usize;
                        if self.bits[ni] && !visited[ni] {
                            visited[ni] = true;
                            stack.push(ni);
                        }
                    }
                }
            }
            regions.push(region);
        }
        regions
    }
}

/// Connected foreground region.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Region {
    /// Pixel count.
    pub area: usize,
    pub min_x: u32,
    pub min_y: u32,
    pub max_x: u32,
    pub max_y: u32,
}

impl Region {
    fn seeded(x: u32, y: u32) -> Self {
        Self {
            area: 0,
            min_x: x,
            min_y: y,
            max_x: x,
            max_y: y,
        }
    }

    fn include(&mut self, x: u32, y: u32) {
        self.area += 1;
        self.min_x = self.min_x.min(x);
        self.min_y = self.min_y.min(y);
        self.max_x = self.max_x.max(x);
        self.max_y = self.max_y.max(y);
    }
}

/// Per-pixel running Gaussian over luma.
pub struct BackgroundModel {
    width: u32,
    height: u32,
    mean: Vec<f32>,
    variance: Vec<f32>,
    var_threshold: f32,
    learning_rate: f32,
}

impl BackgroundModel {
    pub fn new(var_threshold: f32, learning_rate: f32) -> Self {
        Self {
            width: 0,
            height: 0,
            mean: Vec::new(),
            variance: Vec::new(),
            var_threshold,
            learning_rate,
        }
    }

    pub fn is_initialized(&self) -> bool {
        !self.mean.is_empty()
    }

    /// Forget everything learned so far.
    pub fn reset(&mut self) {
        self.width = 0;
        self.height = 0;
        self.mean.clear();
        self.variance.clear();
    }

    /// Classify `luma` against the model, then fold it into the model.
    ///
    /// The first frame, and any frame whose size differs from the model,
    /// re-seeds the model and reports no foreground.
    pub fn apply(&mut self, luma: &GrayImage) -> ForegroundMask {
        let (width, height) = luma.dimensions();
        if !self.is_initialized() || width != self.width || height != self.height {
            self.seed(luma);
            return ForegroundMask::empty(width, height);
        }

        let mut mask = ForegroundMask::empty(width, height);
        let rate = self.learning_rate;
        for (i, value) in luma.as_raw().iter().enumerate() {
            let value = *value as f32;
            let diff = value - self.mean[i];
            let dist2 = diff * diff;
            mask.bits[i] = dist2 > self.var_threshold * self.variance[i];

            self.mean[i] += rate * diff;
            self.variance[i] =
                (self.variance[i] + rate * (dist2 - self.variance[i])).clamp(VARIANCE_MIN, VARIANCE_MAX);
        }
        mask
    }

    fn seed(&mut self, luma: &GrayImage) {
        let (width, height) = luma.dimensions();
        self.width = width;
        self.height = height;
        self.mean = luma.as_raw().iter().map(|v| *v as f32).collect();
        self.variance = vec![VARIANCE_INIT; self.mean.len()];
    }
}

impl Default for BackgroundModel {
    fn default() -> Self {
        Self::new(DEFAULT_VAR_THRESHOLD, DEFAULT_LEARNING_RATE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn gray(width: u32, height: u32, value: u8) -> GrayImage {
        GrayImage::from_pixel(width, height, Luma([value]))
    }

    fn with_block(mut image: GrayImage, x0: u32, y0: u32, size: u32, value: u8) -> GrayImage {
        for y in y0..y0 + size {
            for x in x0..x0 + size {
                image.put_pixel(x, y, Luma([value]));
            }
        }
        image
    }

    #[test]
    fn first_frame_seeds_model() {
        let mut model = BackgroundModel::default();
        let mask = model.apply(&gray(16, 16, 80));
        assert_eq!(mask.count(), 0);
        assert!(model.is_initialized());
    }

    #[test]
    fn bright_block_is_foreground() {
        let mut model = BackgroundModel::default();
        model.apply(&gray(32, 32, 60));
        let mask = model.apply(&with_block(gray(32, 32, 60), 4, 4, 10, 220));
        assert_eq!(mask.count(), 100);
    }

    #[test]
    fn small_flicker_stays_background() {
        let mut model = BackgroundModel::default();
        model.apply(&gray(16, 16, 100));
        let mask = model.apply(&gray(16, 16, 104));
        assert_eq!(mask.count(), 0);
    }

    #[test]
    fn size_change_reseeds() {
        let mut model = BackgroundModel::default();
        model.apply(&gray(16, 16, 100));
        let mask = model.apply(&gray(8, 8, 250));
        assert_eq!(mask.count(), 0);
        model.reset();
        assert!(!model.is_initialized());
    }

    #[test]
    fn opening_removes_specks_and_keeps_blocks() {
        let mut mask = ForegroundMask::empty(20, 20);
        mask.set(1, 1, true);
        for y in 8..14 {
            for x in 8..14 {
                mask.set(x, y, true);
            }
        }
        let opened = mask.open();
        assert!(!opened.get(1, 1));
        // The cross kernel trims only the four block corners.
        assert_eq!(opened.count(), 36 - 4);
    }

    #[test]
    fn regions_are_eight_connected() {
        let mut mask = ForegroundMask::empty(10, 10);
        mask.set(0, 0, true);
        mask.set(1, 1, true);
        mask.set(8, 8, true);
        let mut regions = mask.regions();
        regions.sort_by_key(|r| r.area);
        assert_eq!(regions.len(), 2);
        assert_eq!(regions[0].area, 1);
        assert_eq!(regions[1].area, 2);
        assert_eq!((regions[1].max_x, regions[1].max_y), (1, 1));
    }
}
