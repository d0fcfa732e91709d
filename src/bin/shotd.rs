//! shotd - swing clipper daemon for one camera
//!
//! This daemon:
//! 1. Reads frames from the configured snapshot/MJPEG endpoint on its own thread
//! 2. Buffers recent frames and runs the motion detector on each one
//! 3. On a detected swing, writes one clip per active round (video, poster, row)
//! 4. Serves the loopback control API (health, status, manual trigger)

use anyhow::Result;
use std::sync::{mpsc, Arc};

use shot_clipper::{
    api::{ApiConfig, ApiServer},
    config::ShotdConfig,
    ingest::grabber_for,
    ClipAssembler, ClipStore, Clock, FilesystemClipStore, FrameBuffer, FrameSource,
    LatestFrameFeed, MotionDetector, RoundRegistry, SqliteRoundRegistry, SystemClock,
};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cfg = ShotdConfig::load()?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let store = Arc::new(FilesystemClipStore::open(&cfg.clips_dir, &cfg.db_path)?);
    let rounds: Arc<dyn RoundRegistry> = Arc::new(SqliteRoundRegistry::open(&cfg.db_path)?);

    let grabber = grabber_for(&cfg.source, clock.clone())?;
    let source = FrameSource::new(grabber, clock.clone(), &cfg.source).spawn()?;

    let detector = MotionDetector::new(cfg.detector.clone())?;
    let buffer = Arc::new(FrameBuffer::new(cfg.buffer_frames));
    let mut assembler = ClipAssembler::new(
        cfg.clip.clone(),
        detector,
        buffer,
        rounds,
        store.clone(),
        clock,
    )
    .with_latest_frame(source.latest());
    assembler.start(Box::new(LatestFrameFeed::new(source.latest())))?;

    let api_config = ApiConfig {
        addr: cfg.api_addr.clone(),
    };
    let clip_store: Arc<dyn ClipStore> = store;
    let api_handle = ApiServer::new(api_config, assembler.control(), clip_store).spawn()?;

    log::info!(
        "shotd running. source={} db={} clips={}",
        cfg.source.url,
        cfg.db_path,
        cfg.clips_dir.display()
    );
    log::info!(
        "detector: threshold={} frames={} cooldown={}s; buffer {} frames",
        cfg.detector.motion_threshold,
        cfg.detector.consecutive_frames,
        cfg.detector.cooldown.as_secs(),
        cfg.buffer_frames
    );

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .expect("error setting Ctrl-C handler");

    log::info!("shotd waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping...");

    api_handle.stop()?;
    let assembler_stopped = assembler.stop();
    source.stop()?;
    assembler_stopped
}
