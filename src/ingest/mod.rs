//! Frame ingestion.
//!
//! This module provides the sources of raw frames:
//! - HTTP JPEG snapshot polling (`HttpSnapshotGrabber`)
//! - HTTP MJPEG streams (`MjpegStreamGrabber`)
//! - Synthetic scenes for tests and demos (`SyntheticGrabber`, `stub://` URLs)
//!
//! A grabber only knows how to produce one decoded image. `FrameSource` owns a
//! grabber and adds the ingestion policy around it:
//! - downscaling wide images (aspect ratio preserved)
//! - stamping frames with the injected clock
//! - publishing the latest frame behind a lock (`LatestFrame`)
//! - exponential backoff between failed fetches
//!
//! The clip assembler consumes frames through the `FrameFeed` capability and
//! never talks to a grabber directly.

use anyhow::{anyhow, Context, Result};
use image::imageops::FilterType;
use image::RgbImage;
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime};

use crate::frame::Frame;
use crate::Clock;

mod mjpeg;
mod snapshot;
mod synthetic;

pub use mjpeg::MjpegStreamGrabber;
pub use snapshot::{cache_busted_url, HttpSnapshotGrabber};
pub use synthetic::{SyntheticConfig, SyntheticGrabber};

/// Upper bound on a single encoded image.
pub(crate) const MAX_JPEG_BYTES: usize = 5 * 1024 * 1024;

pub const BACKOFF_FLOOR: Duration = Duration::from_secs(1);
pub const BACKOFF_CEILING: Duration = Duration::from_secs(20);

const SLEEP_SLICE: Duration = Duration::from_millis(50);
const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(30);

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceMode {
    /// Poll a still-image endpoint.
    Snapshot,
    /// Read a continuous multipart JPEG stream.
    Mjpeg,
}

impl std::str::FromStr for SourceMode {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_lowercase().as_str() {
            "snapshot" => Ok(Self::Snapshot),
            "mjpeg" => Ok(Self::Mjpeg),
            other => Err(anyhow!(
                "unknown source mode '{}'; expected snapshot or mjpeg",
                other
            )),
        }
    }
}

/// Configuration for a frame source.
#[derive(Clone, Debug)]
pub struct SourceConfig {
    /// `http(s)://` endpoint or `stub://<name>` for the synthetic scene.
    pub url: String,
    pub mode: SourceMode,
    /// Pause between successful snapshot polls.
    pub poll_interval: Duration,
    /// Downscale frames wider than this. Zero disables scaling.
    pub max_width: u32,
    /// Network timeout per request.
    pub timeout: Duration,
    /// First retry delay after a failed fetch.
    pub backoff_floor: Duration,
    /// Retry delays double up to this.
    pub backoff_ceiling: Duration,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            url: "stub://hole_1".to_string(),
            mode: SourceMode::Snapshot,
            poll_interval: Duration::from_millis(500),
            max_width: 1280,
            timeout: Duration::from_secs(10),
            backoff_floor: BACKOFF_FLOOR,
            backoff_ceiling: BACKOFF_CEILING,
        }
    }
}

impl SourceConfig {
    /// Pause the reader takes after a successful fetch.
    ///
    /// Streams pace themselves, so only snapshot polling sleeps.
    pub fn reader_interval(&self) -> Duration {
        match self.mode {
            SourceMode::Snapshot => self.poll_interval,
            SourceMode::Mjpeg => Duration::ZERO,
        }
    }
}

/// Pick a grabber for the configured URL.
pub fn grabber_for(config: &SourceConfig, clock: Arc<dyn Clock>) -> Result<Box<dyn FrameGrabber>> {
    if config.url.starts_with("stub://") {
        return Ok(Box::new(SyntheticGrabber::new(SyntheticConfig::default())));
    }
    let url = url::Url::parse(&config.url).context("parse source url")?;
    match url.scheme() {
        "http" | "https" => match config.mode {
            SourceMode::Snapshot => Ok(Box::new(HttpSnapshotGrabber::new(
                url,
                config.timeout,
                clock,
            ))),
            SourceMode::Mjpeg => Ok(Box::new(MjpegStreamGrabber::new(url, config.timeout))),
        },
        other => Err(anyhow!(
            "unsupported source scheme '{}'; expected http(s) or stub",
            other
        )),
    }
}

// ----------------------------------------------------------------------------
// Grabber capability
// ----------------------------------------------------------------------------

/// Produces one decoded image per call.
///
/// Implementations should fail fast: network errors and undecodable payloads
/// are returned as errors and retried by `FrameSource` with backoff.
pub trait FrameGrabber: Send {
    /// Human-readable origin for logs.
    fn describe(&self) -> String;

    fn grab(&mut self) -> Result<RgbImage>;
}

pub(crate) fn decode_jpeg(bytes: &[u8]) -> Result<RgbImage> {
    if bytes.is_empty() {
        return Err(anyhow!("empty image payload"));
    }
    let image = image::load_from_memory(bytes).context("decode image")?;
    Ok(image.into_rgb8())
}

/// Shrink `image` to `max_width` columns, keeping the aspect ratio.
pub fn downscale(image: RgbImage, max_width: u32) -> RgbImage {
    let (width, height) = image.dimensions();
    if max_width == 0 || width <= max_width {
        return image;
    }
    let new_height = ((height as u64 * max_width as u64) / width as u64).max(1) as u32;
    image::imageops::resize(&image, max_width, new_height, FilterType::Triangle)
}

// ----------------------------------------------------------------------------
// Backoff
// ----------------------------------------------------------------------------

/// Doubling retry delay clamped to `[floor, ceiling]`.
#[derive(Clone, Debug)]
pub struct Backoff {
    floor: Duration,
    ceiling: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(floor: Duration, ceiling: Duration) -> Self {
        let ceiling = ceiling.max(floor);
        Self {
            floor,
            ceiling,
            current: floor,
        }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    /// Delay to wait now; the following call returns twice as much.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.ceiling);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.floor;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(BACKOFF_FLOOR, BACKOFF_CEILING)
    }
}

// ----------------------------------------------------------------------------
// LatestFrame: publication point
// ----------------------------------------------------------------------------

#[derive(Default)]
struct Published {
    frame: Option<Frame>,
    sequence: u64,
}

/// Lock-protected "latest frame" shared between the reader thread and any
/// consumer (ingestion loop, health checks, manual triggers).
///
/// Consumers always receive their own `Frame`; nothing hands out a reference
/// into the slot.
#[derive(Clone, Default)]
pub struct LatestFrame {
    slot: Arc<Mutex<Published>>,
}

impl LatestFrame {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Published> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the latest frame. Returns the new sequence number.
    pub fn publish(&self, frame: Frame) -> u64 {
        let mut slot = self.lock();
        slot.sequence += 1;
        slot.frame = Some(frame);
        slot.sequence
    }

    pub fn get(&self) -> Option<Frame> {
        self.lock().frame.clone()
    }

    /// The latest frame if it was published after `sequence`.
    pub fn newer_than(&self, sequence: u64) -> Option<(u64, Frame)> {
        let slot = self.lock();
        if slot.sequence <= sequence {
            return None;
        }
        slot.frame.clone().map(|frame| (slot.sequence, frame))
    }

    pub fn sequence(&self) -> u64 {
        self.lock().sequence
    }

    /// Age of the latest frame relative to `now`.
    pub fn age(&self, now: SystemTime) -> Option<Duration> {
        let captured_at = self.lock().frame.as_ref()?.captured_at();
        Some(now.duration_since(captured_at).unwrap_or_default())
    }
}

// ----------------------------------------------------------------------------
// FrameFeed: ingestion capability
// ----------------------------------------------------------------------------

/// Next-frame capability consumed by the ingestion loop.
///
/// `None` means "nothing new yet"; the loop keeps polling.
pub trait FrameFeed: Send {
    fn next_frame(&mut self) -> Option<Frame>;
}

/// Feed that yields each published frame once.
pub struct LatestFrameFeed {
    latest: LatestFrame,
    seen: u64,
}

impl LatestFrameFeed {
    pub fn new(latest: LatestFrame) -> Self {
        Self { latest, seen: 0 }
    }
}

impl FrameFeed for LatestFrameFeed {
    fn next_frame(&mut self) -> Option<Frame> {
        let (sequence, frame) = self.latest.newer_than(self.seen)?;
        self.seen = sequence;
        Some(frame)
    }
}

/// Adapts a closure into a feed.
pub struct FeedFn<F>(pub F);

impl<F> FrameFeed for FeedFn<F>
where
    F: FnMut() -> Option<Frame> + Send,
{
    fn next_frame(&mut self) -> Option<Frame> {
        (self.0)()
    }
}

// ----------------------------------------------------------------------------
// FrameSource
// ----------------------------------------------------------------------------

/// Statistics for a frame source.
#[derive(Clone, Debug)]
pub struct SourceStats {
    pub frames_published: u64,
    pub failures: u64,
    pub last_error: Option<String>,
    pub source: String,
}

/// Owned reader around a grabber: scaling, stamping, publishing and backoff.
pub struct FrameSource {
    grabber: Box<dyn FrameGrabber>,
    clock: Arc<dyn Clock>,
    latest: LatestFrame,
    backoff: Backoff,
    max_width: u32,
    interval: Duration,
    frames_published: u64,
    failures: u64,
    last_error: Option<String>,
}

impl FrameSource {
    pub fn new(grabber: Box<dyn FrameGrabber>, clock: Arc<dyn Clock>, config: &SourceConfig) -> Self {
        Self {
            grabber,
            clock,
            latest: LatestFrame::new(),
            backoff: Backoff::new(config.backoff_floor, config.backoff_ceiling),
            max_width: config.max_width,
            interval: config.reader_interval(),
            frames_published: 0,
            failures: 0,
            last_error: None,
        }
    }

    /// Handle to the publication point; clones share the slot.
    pub fn latest(&self) -> LatestFrame {
        self.latest.clone()
    }

    /// Grab, scale, stamp and publish one frame.
    ///
    /// On success the backoff returns to its floor. On failure nothing is
    /// published and the error is handed back for the caller to wait out.
    pub fn fetch(&mut self) -> Result<Frame> {
        let grabbed = self.grabber.grab();
        match grabbed {
            Ok(image) => {
                let image = downscale(image, self.max_width);
                let frame = Frame::new(image, self.clock.now());
                self.latest.publish(frame.clone());
                self.backoff.reset();
                self.frames_published += 1;
                self.last_error = None;
                Ok(frame)
            }
            Err(err) => {
                self.failures += 1;
                self.last_error = Some(format!("{:#}", err));
                Err(err)
            }
        }
    }

    /// Delay before the next attempt after a failed `fetch`.
    pub fn retry_delay(&mut self) -> Duration {
        self.backoff.next_delay()
    }

    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    pub fn stats(&self) -> SourceStats {
        SourceStats {
            frames_published: self.frames_published,
            failures: self.failures,
            last_error: self.last_error.clone(),
            source: self.grabber.describe(),
        }
    }

    /// Run the reader on a dedicated thread until the handle is stopped.
    pub fn spawn(mut self) -> Result<SourceHandle> {
        let running = Arc::new(AtomicBool::new(true));
        let running_thread = running.clone();
        let latest = self.latest();
        let join = std::thread::Builder::new()
            .name("frame-reader".to_string())
            .spawn(move || self.run(&running_thread))
            .context("spawn frame reader thread")?;
        Ok(SourceHandle {
            latest,
            running,
            join: Some(join),
        })
    }

    fn run(&mut self, running: &AtomicBool) {
        log::info!("frame source started: {}", self.grabber.describe());
        let mut last_health_log = Instant::now();
        while running.load(Ordering::SeqCst) {
            let outcome = self.fetch();
            match outcome {
                Ok(_) => sleep_while_running(running, self.interval),
                Err(err) => {
                    let delay = self.retry_delay();
                    log::warn!(
                        "frame source error: {:#}; retrying in {:.1}s",
                        err,
                        delay.as_secs_f32()
                    );
                    sleep_while_running(running, delay);
                }
            }
            if last_health_log.elapsed() >= HEALTH_LOG_INTERVAL {
                let stats = self.stats();
                log::info!(
                    "frame source health: published={} failures={} source={}",
                    stats.frames_published,
                    stats.failures,
                    stats.source
                );
                last_health_log = Instant::now();
            }
        }
        log::info!("frame source stopped: {}", self.grabber.describe());
    }
}

/// Running reader thread.
pub struct SourceHandle {
    latest: LatestFrame,
    running: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl SourceHandle {
    pub fn latest(&self) -> LatestFrame {
        self.latest.clone()
    }

    pub fn stop(mut self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("frame reader thread panicked"))?;
        }
        Ok(())
    }
}

/// Sleep up to `duration`, waking early once `running` goes false.
pub(crate) fn sleep_while_running(running: &AtomicBool, duration: Duration) {
    let deadline = Instant::now() + duration;
    loop {
        if !running.load(Ordering::SeqCst) {
            return;
        }
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        std::thread::sleep((deadline - now).min(SLEEP_SLICE));
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ManualClock;
    use std::collections::VecDeque;

    struct ScriptedGrabber {
        script: VecDeque<Result<RgbImage>>,
    }

    impl FrameGrabber for ScriptedGrabber {
        fn describe(&self) -> String {
            "scripted".to_string()
        }

        fn grab(&mut self) -> Result<RgbImage> {
            self.script
                .pop_front()
                .unwrap_or_else(|| Err(anyhow!("script exhausted")))
        }
    }

    fn source_with(script: Vec<Result<RgbImage>>, clock: &ManualClock) -> FrameSource {
        let config = SourceConfig {
            max_width: 64,
            ..SourceConfig::default()
        };
        FrameSource::new(
            Box::new(ScriptedGrabber {
                script: script.into(),
            }),
            Arc::new(clock.clone()),
            &config,
        )
    }

    #[test]
    fn backoff_doubles_to_ceiling_and_resets() {
        let mut backoff = Backoff::default();
        let delays: Vec<u64> = (0..7).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 20, 20]);
        backoff.reset();
        assert_eq!(backoff.current(), BACKOFF_FLOOR);
    }

    #[test]
    fn fetch_publishes_stamped_frame() {
        let clock = ManualClock::at_unix_secs(500);
        let mut source = source_with(vec![Ok(RgbImage::new(32, 16))], &clock);

        let frame = source.fetch().unwrap();
        assert_eq!(frame.captured_at(), clock.now());

        let latest = source.latest();
        assert_eq!(latest.sequence(), 1);
        assert_eq!(latest.get().unwrap().captured_at(), clock.now());
        clock.advance(Duration::from_secs(3));
        assert_eq!(latest.age(clock.now()), Some(Duration::from_secs(3)));
    }

    #[test]
    fn failed_fetch_keeps_previous_frame_and_backs_off() {
        let clock = ManualClock::at_unix_secs(10);
        let mut source = source_with(
            vec![
                Ok(RgbImage::new(8, 8)),
                Err(anyhow!("connection reset")),
                Err(anyhow!("decode image")),
                Ok(RgbImage::new(8, 8)),
            ],
            &clock,
        );

        source.fetch().unwrap();
        clock.advance(Duration::from_secs(1));
        assert!(source.fetch().is_err());
        assert_eq!(source.retry_delay(), Duration::from_secs(1));
        assert!(source.fetch().is_err());
        assert_eq!(source.retry_delay(), Duration::from_secs(2));
        assert_eq!(source.latest().sequence(), 1);
        assert_eq!(source.stats().failures, 2);

        source.fetch().unwrap();
        assert_eq!(source.backoff().current(), BACKOFF_FLOOR);
        assert_eq!(source.latest().sequence(), 2);
        assert!(source.stats().last_error.is_none());
    }

    #[test]
    fn configured_backoff_bounds_retries() {
        let clock = ManualClock::at_unix_secs(0);
        let config = SourceConfig {
            backoff_floor: Duration::from_millis(250),
            backoff_ceiling: Duration::from_secs(1),
            ..SourceConfig::default()
        };
        let mut source = FrameSource::new(
            Box::new(ScriptedGrabber {
                script: VecDeque::new(),
            }),
            Arc::new(clock),
            &config,
        );
        let delays: Vec<u128> = (0..4)
            .map(|_| {
                assert!(source.fetch().is_err());
                source.retry_delay().as_millis()
            })
            .collect();
        assert_eq!(delays, vec![250, 500, 1000, 1000]);
    }

    #[test]
    fn fetch_downscales_wide_images() {
        let clock = ManualClock::at_unix_secs(0);
        let mut source = source_with(vec![Ok(RgbImage::new(256, 128))], &clock);
        let frame = source.fetch().unwrap();
        assert_eq!((frame.width(), frame.height()), (64, 32));
    }

    #[test]
    fn downscale_leaves_narrow_images_alone() {
        let image = downscale(RgbImage::new(100, 50), 1280);
        assert_eq!(image.dimensions(), (100, 50));
        let image = downscale(RgbImage::new(2000, 1000), 0);
        assert_eq!(image.dimensions(), (2000, 1000));
    }

    #[test]
    fn latest_feed_yields_each_frame_once() {
        let latest = LatestFrame::new();
        let mut feed = LatestFrameFeed::new(latest.clone());
        assert!(feed.next_frame().is_none());

        let clock = ManualClock::at_unix_secs(1);
        latest.publish(Frame::new(RgbImage::new(2, 2), clock.now()));
        assert!(feed.next_frame().is_some());
        assert!(feed.next_frame().is_none());
    }

    #[test]
    fn source_mode_parses() {
        assert_eq!("MJPEG".parse::<SourceMode>().unwrap(), SourceMode::Mjpeg);
        assert!("rtsp".parse::<SourceMode>().is_err());
    }

    #[test]
    fn grabber_for_rejects_unknown_scheme() {
        let config = SourceConfig {
            url: "ftp://camera/frame.jpg".to_string(),
            ..SourceConfig::default()
        };
        assert!(grabber_for(&config, Arc::new(crate::SystemClock)).is_err());
        assert!(grabber_for(&SourceConfig::default(), Arc::new(crate::SystemClock)).is_ok());
    }
}
