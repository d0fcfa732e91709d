use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime};

use super::encode::{ClipEncoder, MjpegAviEncoder};
use super::workers::WorkerPool;
use super::{new_clip_id, Clip, ClipDraft, ClipSettings, ClipSummary, DetectionMethod};
use crate::detect::MotionDetector;
use crate::error::ClipError;
use crate::frame::{Frame, FrameBuffer};
use crate::ingest::{sleep_while_running, FrameFeed, LatestFrame};
use crate::rounds::{RoundId, RoundRegistry};
use crate::storage::ClipStore;
use crate::{utc, Clock};

const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(5);
const POST_ROLL_POLL: Duration = Duration::from_millis(100);
/// Slack on top of the nominal post-roll before extraction proceeds anyway.
const POST_ROLL_GRACE: Duration = Duration::from_secs(1);
/// Buffered history this close to the clip duration counts as a full window.
const MANUAL_SPAN_TOLERANCE: Duration = Duration::from_secs(1);

// ----------------------------------------------------------------------------
// Status
// ----------------------------------------------------------------------------

/// Point-in-time view of the processor for health and status consumers.
#[derive(Clone, Debug, Serialize)]
pub struct ProcessorStatus {
    pub running: bool,
    /// Stop was requested but the ingestion thread has not left its loop yet.
    pub stopping: bool,
    pub last_detection_time: Option<DateTime<Utc>>,
    pub motion_counter: u32,
    pub frames_ingested: u64,
    pub detections: u64,
    pub clips_created: u64,
    pub clip_failures: u64,
    pub pending_jobs: usize,
    pub buffered_frames: usize,
    pub buffer_capacity: usize,
    pub buffer_bytes: usize,
    pub last_frame_time: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct StatusBoard {
    running: AtomicBool,
    stopping: AtomicBool,
    last_detection: Mutex<Option<SystemTime>>,
    motion_counter: AtomicU32,
    frames_ingested: AtomicU64,
    detections: AtomicU64,
    clips_created: AtomicU64,
    clip_failures: AtomicU64,
    pending_jobs: Arc<AtomicUsize>,
}

impl StatusBoard {
    fn record_detection(&self, at: SystemTime) {
        self.detections.fetch_add(1, Ordering::SeqCst);
        *self
            .last_detection
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(at);
    }

    fn last_detection(&self) -> Option<SystemTime> {
        *self
            .last_detection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn record_outcome(&self, clips: u64, failures: u64) {
        self.clips_created.fetch_add(clips, Ordering::SeqCst);
        self.clip_failures.fetch_add(failures, Ordering::SeqCst);
    }
}

// ----------------------------------------------------------------------------
// Pipeline: window -> encode -> persist, per round
// ----------------------------------------------------------------------------

struct ClipPipeline {
    settings: ClipSettings,
    buffer: Arc<FrameBuffer>,
    rounds: Arc<dyn RoundRegistry>,
    store: Arc<dyn ClipStore>,
    encoder: Arc<dyn ClipEncoder>,
    clock: Arc<dyn Clock>,
    status: StatusBoard,
}

/// Clips and failures of one detection or trigger.
#[derive(Default)]
struct EventOutcome {
    clips: Vec<Clip>,
    failures: usize,
}

impl ClipPipeline {
    /// Encode `frames` and persist one clip for `round_id`.
    fn create_for_round(
        &self,
        frames: &[Frame],
        round_id: &str,
        detected_at: SystemTime,
        method: DetectionMethod,
    ) -> Result<Clip> {
        let poster_frame = frames
            .get(frames.len() / 2)
            .ok_or_else(|| anyhow!("no frames to encode"))?;
        let video = self
            .encoder
            .encode_video(frames, self.settings.target_fps)
            .context("encode video")?;
        let poster = self
            .encoder
            .encode_poster(poster_frame)
            .context("encode poster")?;

        let draft = ClipDraft {
            id: new_clip_id(),
            round_id: round_id.to_string(),
            hole_number: self.settings.hole_number,
            camera_id: self.settings.camera_id.clone(),
            duration_seconds: self.settings.duration_seconds(frames.len()),
            frame_count: frames.len() as u32,
            video_sha256: hex::encode(Sha256::digest(&video)),
            video_extension: self.encoder.video_extension(),
            detected_at: utc(detected_at),
            detection_method: method,
        };
        let artifacts = self
            .store
            .persist(&video, &poster, &draft)
            .context("persist artifacts")?;
        let clip = draft.into_clip(artifacts.clone(), utc(self.clock.now()));
        if let Err(e) = self.store.record(&clip) {
            if let Err(cleanup) = self.store.discard(&artifacts) {
                warn!("clip {}: unrecorded artifacts left behind: {:#}", clip.id, cleanup);
            }
            return Err(e.context("record clip"));
        }
        Ok(clip)
    }

    /// `create_for_round` with a panic in the encoder or store turned into an
    /// error for that round alone.
    fn create_isolated(
        &self,
        frames: &[Frame],
        round_id: &str,
        detected_at: SystemTime,
        method: DetectionMethod,
    ) -> Result<Clip> {
        panic::catch_unwind(AssertUnwindSafe(|| {
            self.create_for_round(frames, round_id, detected_at, method)
        }))
        .unwrap_or_else(|payload| {
            Err(anyhow!(
                "clip creation panicked: {}",
                panic_message(payload.as_ref())
            ))
        })
    }

    /// Clip job for a detection at `detected_at`, fanned out to `rounds`.
    fn run_detection(&self, detected_at: SystemTime, rounds: &BTreeSet<RoundId>) -> EventOutcome {
        self.await_post_roll(detected_at);

        let mut outcome = EventOutcome::default();
        for round_id in rounds {
            let frames = self.buffer.window(detected_at, self.settings.duration);
            if frames.is_empty() {
                warn!("round {}: no buffered frames around detection; skipped", round_id);
                outcome.failures += 1;
                continue;
            }
            let created = self.create_isolated(
                &frames,
                round_id,
                detected_at,
                DetectionMethod::MotionDetection,
            );
            match created {
                Ok(clip) => {
                    info!(
                        "round {}: clip {} created ({} frames, {}s)",
                        round_id, clip.id, clip.frame_count, clip.duration_seconds
                    );
                    outcome.clips.push(clip);
                }
                Err(e) => {
                    warn!("round {}: clip creation failed: {:#}", round_id, e);
                    outcome.failures += 1;
                }
            }
        }
        self.status
            .record_outcome(outcome.clips.len() as u64, outcome.failures as u64);
        outcome
    }

    /// Wait until the trailing half of the clip has had time to arrive.
    fn await_post_roll(&self, detected_at: SystemTime) {
        if !self.settings.post_roll {
            return;
        }
        let half = self.settings.duration / 2;
        let deadline = detected_at + half;
        let started = Instant::now();
        while started.elapsed() < half + POST_ROLL_GRACE {
            match deadline.duration_since(self.clock.now()) {
                Ok(remaining) if !remaining.is_zero() => {
                    thread::sleep(remaining.min(POST_ROLL_POLL));
                }
                _ => return,
            }
        }
        debug!("post-roll wait gave up at {:?}", half + POST_ROLL_GRACE);
    }

    /// Frames for a manual clip ending at `now`.
    ///
    /// Buffered history is used when it covers the clip duration; otherwise the
    /// latest frame is repeated to the nominal frame count. The second value is
    /// true for the repeated-frame fallback.
    fn manual_window(&self, latest: &Frame, now: SystemTime) -> (Vec<Frame>, bool) {
        let duration = self.settings.duration;
        let centre = now.checked_sub(duration / 2).unwrap_or(now);
        let history = self.buffer.window(centre, duration);
        if let (Some(first), Some(last)) = (history.first(), history.last()) {
            let span = last
                .captured_at()
                .duration_since(first.captured_at())
                .unwrap_or_default();
            if span + MANUAL_SPAN_TOLERANCE >= duration {
                return (history, false);
            }
        }

        let count = self.settings.nominal_frames().max(1);
        let interval = self.settings.frame_interval();
        let start = now.checked_sub(duration).unwrap_or(now);
        let frames = (0..count)
            .map(|i| latest.restamped(start + interval * i as u32))
            .collect();
        (frames, true)
    }
}

// ----------------------------------------------------------------------------
// Control surface
// ----------------------------------------------------------------------------

/// Cloneable handle for status reads and manual triggers.
///
/// Safe to use from request-serving threads while the ingestion loop runs.
#[derive(Clone)]
pub struct AssemblerControl {
    pipeline: Arc<ClipPipeline>,
    latest: Option<LatestFrame>,
}

impl AssemblerControl {
    pub fn status(&self) -> ProcessorStatus {
        let status = &self.pipeline.status;
        ProcessorStatus {
            running: status.running.load(Ordering::SeqCst),
            stopping: status.stopping.load(Ordering::SeqCst),
            last_detection_time: status.last_detection().map(utc),
            motion_counter: status.motion_counter.load(Ordering::SeqCst),
            frames_ingested: status.frames_ingested.load(Ordering::SeqCst),
            detections: status.detections.load(Ordering::SeqCst),
            clips_created: status.clips_created.load(Ordering::SeqCst),
            clip_failures: status.clip_failures.load(Ordering::SeqCst),
            pending_jobs: status.pending_jobs.load(Ordering::SeqCst),
            buffered_frames: self.pipeline.buffer.len(),
            buffer_capacity: self.pipeline.buffer.capacity(),
            buffer_bytes: self.pipeline.buffer.memory_bytes(),
            last_frame_time: self.latest_frame().map(|f| utc(f.captured_at())),
        }
    }

    /// Published frame if there is one, else the newest buffered frame.
    pub fn latest_frame(&self) -> Option<Frame> {
        self.latest
            .as_ref()
            .and_then(LatestFrame::get)
            .or_else(|| self.pipeline.buffer.latest())
    }

    /// Latest frame as a JPEG, encoded like clip posters.
    pub fn latest_jpeg(&self) -> Result<Option<Vec<u8>>> {
        match self.latest_frame() {
            Some(frame) => Ok(Some(self.pipeline.encoder.encode_poster(&frame)?)),
            None => Ok(None),
        }
    }

    /// Time since the latest frame was captured, on the pipeline clock.
    pub fn frame_age(&self) -> Option<Duration> {
        let frame = self.latest_frame()?;
        Some(
            self.pipeline
                .clock
                .now()
                .duration_since(frame.captured_at())
                .unwrap_or_default(),
        )
    }

    /// Create a `manual` clip for every active round, synchronously.
    ///
    /// Fails with `ClipError::NoFrameAvailable` before touching storage when
    /// nothing has been published or buffered yet.
    pub fn trigger_manual_clip(&self) -> Result<ClipSummary> {
        let latest = self.latest_frame().ok_or(ClipError::NoFrameAvailable)?;
        let pipeline = &self.pipeline;
        let now = pipeline.clock.now();
        let rounds = pipeline
            .rounds
            .active_round_ids()
            .context("query active rounds")?;
        let (frames, synthesized) = pipeline.manual_window(&latest, now);
        info!(
            "manual trigger: {} frames ({}) for {} active rounds",
            frames.len(),
            if synthesized { "repeated latest frame" } else { "buffered" },
            rounds.len()
        );

        let mut outcome = EventOutcome::default();
        for round_id in &rounds {
            match pipeline.create_isolated(&frames, round_id, now, DetectionMethod::Manual) {
                Ok(clip) => outcome.clips.push(clip),
                Err(e) => {
                    warn!("round {}: manual clip failed: {:#}", round_id, e);
                    outcome.failures += 1;
                }
            }
        }
        pipeline
            .status
            .record_outcome(outcome.clips.len() as u64, outcome.failures as u64);

        Ok(ClipSummary {
            triggered_at: utc(now),
            frame_count: frames.len(),
            synthesized,
            rounds: rounds.len(),
            clips: outcome.clips,
            failures: outcome.failures,
        })
    }
}

// ----------------------------------------------------------------------------
// Assembler
// ----------------------------------------------------------------------------

struct IngestThread {
    running: Arc<AtomicBool>,
    done: Receiver<()>,
    join: JoinHandle<()>,
    pool: Arc<WorkerPool>,
}

/// One camera's processor: ingestion loop, detector and clip workers.
///
/// Frames come from a `FrameFeed`; every frame is buffered and classified on a
/// dedicated thread. A fire queries the active rounds at that moment and hands
/// a clip job to the worker pool, so persistence never stalls ingestion.
pub struct ClipAssembler {
    control: AssemblerControl,
    detector: Arc<Mutex<MotionDetector>>,
    ingest: Option<IngestThread>,
}

impl ClipAssembler {
    pub fn new(
        settings: ClipSettings,
        detector: MotionDetector,
        buffer: Arc<FrameBuffer>,
        rounds: Arc<dyn RoundRegistry>,
        store: Arc<dyn ClipStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let encoder = Arc::new(MjpegAviEncoder::new(settings.jpeg_quality));
        let pipeline = ClipPipeline {
            settings,
            buffer,
            rounds,
            store,
            encoder,
            clock,
            status: StatusBoard::default(),
        };
        Self {
            control: AssemblerControl {
                pipeline: Arc::new(pipeline),
                latest: None,
            },
            detector: Arc::new(Mutex::new(detector)),
            ingest: None,
        }
    }

    fn pipeline_mut(&mut self) -> Option<&mut ClipPipeline> {
        Arc::get_mut(&mut self.control.pipeline)
    }

    /// Replace the video/poster encoder. Only effective before the first
    /// `control()` clone or `start`.
    pub fn with_encoder(mut self, encoder: Arc<dyn ClipEncoder>) -> Self {
        match self.pipeline_mut() {
            Some(pipeline) => pipeline.encoder = encoder,
            None => warn!("encoder not replaced: assembler already shared"),
        }
        self
    }

    /// Source manual triggers and frame-age reporting from `latest`.
    pub fn with_latest_frame(mut self, latest: LatestFrame) -> Self {
        self.control.latest = Some(latest);
        self
    }

    pub fn settings(&self) -> &ClipSettings {
        &self.control.pipeline.settings
    }

    pub fn control(&self) -> AssemblerControl {
        self.control.clone()
    }

    pub fn status(&self) -> ProcessorStatus {
        self.control.status()
    }

    pub fn trigger_manual_clip(&self) -> Result<ClipSummary> {
        self.control.trigger_manual_clip()
    }

    /// Start the ingestion loop and the clip workers.
    pub fn start(&mut self, feed: Box<dyn FrameFeed>) -> Result<()> {
        if self.ingest.is_some() {
            if self.control.pipeline.status.running.load(Ordering::SeqCst) {
                return Err(ClipError::AlreadyRunning.into());
            }
            // The previous loop died; reap it before starting over.
            self.stop()?;
        }

        let pipeline = Arc::clone(&self.control.pipeline);
        let settings = &pipeline.settings;
        let pool = Arc::new(WorkerPool::new(
            "clip-worker",
            settings.workers,
            settings.queue_depth,
            Arc::clone(&pipeline.status.pending_jobs),
        )?);

        let running = Arc::new(AtomicBool::new(true));
        let (done_tx, done) = mpsc::channel();
        pipeline.status.running.store(true, Ordering::SeqCst);

        let thread_pipeline = Arc::clone(&pipeline);
        let thread_pool = Arc::clone(&pool);
        let thread_running = Arc::clone(&running);
        let detector = Arc::clone(&self.detector);
        let spawned = thread::Builder::new()
            .name("shot-ingest".to_string())
            .spawn(move || {
                let mut feed = feed;
                let result = panic::catch_unwind(AssertUnwindSafe(|| {
                    let mut detector = match detector.lock() {
                        Ok(guard) => guard,
                        Err(poisoned) => {
                            // A previous loop died mid-frame.
                            let mut guard = poisoned.into_inner();
                            guard.reset();
                            guard
                        }
                    };
                    ingest_loop(
                        &thread_pipeline,
                        &mut detector,
                        feed.as_mut(),
                        &thread_pool,
                        &thread_running,
                    )
                }));
                match result {
                    Ok(Ok(())) => info!("ingestion loop stopped"),
                    Ok(Err(e)) => error!("ingestion loop failed: {:#}", e),
                    Err(_) => error!("ingestion loop panicked; processor needs a restart"),
                }
                thread_pipeline.status.running.store(false, Ordering::SeqCst);
                thread_pipeline.status.stopping.store(false, Ordering::SeqCst);
                let _ = done_tx.send(());
            });

        let join = match spawned {
            Ok(join) => join,
            Err(e) => {
                pipeline.status.running.store(false, Ordering::SeqCst);
                if let Ok(pool) = Arc::try_unwrap(pool) {
                    pool.shutdown();
                }
                return Err(anyhow!("failed to spawn ingestion thread: {}", e));
            }
        };

        info!(
            "clip assembler started: camera={} hole={} clip={}s@{}fps",
            settings.camera_id,
            settings.hole_number,
            settings.duration.as_secs(),
            settings.target_fps
        );
        self.ingest = Some(IngestThread {
            running,
            done,
            join,
            pool,
        });
        Ok(())
    }

    /// Stop ingestion, then drain queued clip jobs.
    ///
    /// The ingestion thread gets `stop_timeout` to exit. If it is still inside
    /// its loop after that, the handle is kept, `status()` reports `running`
    /// and `stopping`, and an error is returned; call `stop` again later to
    /// finish. `start` refuses to run a second loop meanwhile.
    pub fn stop(&mut self) -> Result<()> {
        let Some(ingest) = self.ingest.take() else {
            return Ok(());
        };
        let status = &self.control.pipeline.status;
        ingest.running.store(false, Ordering::SeqCst);
        if status.running.load(Ordering::SeqCst) {
            status.stopping.store(true, Ordering::SeqCst);
        }

        let timeout = self.control.pipeline.settings.stop_timeout;
        if let Err(RecvTimeoutError::Timeout) = ingest.done.recv_timeout(timeout) {
            self.ingest = Some(ingest);
            return Err(anyhow!(
                "ingestion thread did not stop within {:?}; still stopping",
                timeout
            ));
        }
        if ingest.join.join().is_err() {
            warn!("ingestion thread exited by panic");
        }

        match Arc::try_unwrap(ingest.pool) {
            Ok(pool) => {
                let pending = pool.pending();
                if pending > 0 {
                    info!("waiting for {} clip jobs", pending);
                }
                pool.shutdown();
            }
            Err(_) => warn!("clip workers still in use; not waiting for queued jobs"),
        }
        status.running.store(false, Ordering::SeqCst);
        status.stopping.store(false, Ordering::SeqCst);
        Ok(())
    }
}

impl Drop for ClipAssembler {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!("clip assembler stop failed: {:#}", e);
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

fn ingest_loop(
    pipeline: &Arc<ClipPipeline>,
    detector: &mut MotionDetector,
    feed: &mut dyn FrameFeed,
    pool: &WorkerPool,
    running: &AtomicBool,
) -> Result<()> {
    let idle = pipeline.settings.frame_interval();
    let mut last_health_log = Instant::now();

    while running.load(Ordering::SeqCst) {
        match feed.next_frame() {
            Some(frame) => ingest_frame(pipeline, detector, pool, frame)?,
            None => sleep_while_running(running, idle),
        }

        if last_health_log.elapsed() >= HEALTH_LOG_INTERVAL {
            let status = &pipeline.status;
            let age = pipeline
                .buffer
                .latest()
                .and_then(|f| pipeline.clock.now().duration_since(f.captured_at()).ok());
            info!(
                "ingest health: frames={} buffered={} counter={} detections={} frame_age={:?}",
                status.frames_ingested.load(Ordering::SeqCst),
                pipeline.buffer.len(),
                detector.counter(),
                status.detections.load(Ordering::SeqCst),
                age
            );
            last_health_log = Instant::now();
        }
    }
    Ok(())
}

fn ingest_frame(
    pipeline: &Arc<ClipPipeline>,
    detector: &mut MotionDetector,
    pool: &WorkerPool,
    frame: Frame,
) -> Result<()> {
    let status = &pipeline.status;
    status.frames_ingested.fetch_add(1, Ordering::SeqCst);
    pipeline.buffer.add(frame.clone());

    let fired = detector.classify(&frame);
    status
        .motion_counter
        .store(detector.counter(), Ordering::SeqCst);
    if !fired {
        return Ok(());
    }

    let detected_at = frame.captured_at();
    status.record_detection(detected_at);

    // Rounds are resolved now; rounds activated later do not get this shot.
    let rounds = match pipeline.rounds.active_round_ids() {
        Ok(rounds) => rounds,
        Err(e) => {
            warn!("swing detected but active rounds unavailable: {:#}", e);
            return Ok(());
        }
    };
    info!(
        "swing detected at {} for {} active rounds",
        utc(detected_at).to_rfc3339(),
        rounds.len()
    );
    if rounds.is_empty() {
        return Ok(());
    }

    let round_count = rounds.len() as u64;
    let job_pipeline = Arc::clone(pipeline);
    let submitted = pool.submit(Box::new(move || {
        job_pipeline.run_detection(detected_at, &rounds);
    }));
    match submitted {
        Ok(()) => Ok(()),
        Err(e) if matches!(e.downcast_ref::<ClipError>(), Some(ClipError::QueueFull(_))) => {
            warn!("dropping detection: {:#}", e);
            status.clip_failures.fetch_add(round_count, Ordering::SeqCst);
            Ok(())
        }
        Err(e) => Err(e),
    }
}
