//! shot_demo - end-to-end synthetic run of the swing clipper

use anyhow::{anyhow, Result};
use clap::Parser;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use shot_clipper::ingest::{SourceConfig, SyntheticConfig};
use shot_clipper::{
    ClipAssembler, ClipSettings, ClipStore, Clock, DetectorConfig, FilesystemClipStore,
    FrameBuffer, FrameSource, LatestFrameFeed, MotionDetector, StaticRoundRegistry,
    SyntheticGrabber, SystemClock,
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// How long to run the synthetic camera.
    #[arg(long, default_value_t = 12)]
    seconds: u64,
    /// Frames per second for the synthetic source.
    #[arg(long, default_value_t = 10)]
    fps: u32,
    /// Clip length in seconds.
    #[arg(long, default_value_t = 4)]
    clip_secs: u64,
    /// Active round ids (repeatable).
    #[arg(long = "round", default_values_t = vec!["demo_round".to_string()])]
    rounds: Vec<String>,
    /// Output directory for clips and the database.
    #[arg(long, default_value = "demo_out")]
    out: String,
    /// Also create a manual clip before stopping.
    #[arg(long)]
    manual: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    if args.fps == 0 {
        return Err(anyhow!("fps must be >= 1"));
    }
    if args.clip_secs == 0 {
        return Err(anyhow!("clip-secs must be >= 1"));
    }

    let out_dir = PathBuf::from(&args.out);
    fs::create_dir_all(&out_dir)?;
    let db_path = out_dir.join("demo_shots.db");
    let db_path = db_path
        .to_str()
        .ok_or_else(|| anyhow!("output path is not valid UTF-8"))?;
    let store = Arc::new(FilesystemClipStore::open(out_dir.join("clips"), db_path)?);

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let source_config = SourceConfig {
        url: "stub://demo".to_string(),
        poll_interval: Duration::from_secs(1) / args.fps,
        ..SourceConfig::default()
    };
    // One swing every four seconds, after a settling cycle.
    let grabber = SyntheticGrabber::new(SyntheticConfig {
        width: 320,
        height: 180,
        swing_every: u64::from(args.fps) * 4,
        swing_frames: u64::from(args.fps / 2).max(4),
        ..SyntheticConfig::default()
    });
    let source = FrameSource::new(Box::new(grabber), clock.clone(), &source_config).spawn()?;

    let settings = ClipSettings {
        duration: Duration::from_secs(args.clip_secs),
        target_fps: args.fps,
        camera_id: "demo_camera".to_string(),
        ..ClipSettings::default()
    };
    let detector = MotionDetector::new(DetectorConfig {
        cooldown: Duration::from_secs(2),
        ..DetectorConfig::default()
    })?;
    let capacity = settings.nominal_frames() * 2;
    let mut assembler = ClipAssembler::new(
        settings,
        detector,
        Arc::new(FrameBuffer::new(capacity)),
        Arc::new(StaticRoundRegistry::new(args.rounds.clone())),
        store.clone(),
        clock,
    )
    .with_latest_frame(source.latest());
    assembler.start(Box::new(LatestFrameFeed::new(source.latest())))?;

    println!(
        "running synthetic camera for {}s at {} fps (rounds: {})",
        args.seconds,
        args.fps,
        args.rounds.join(", ")
    );
    std::thread::sleep(Duration::from_secs(args.seconds));

    if args.manual {
        let summary = assembler.trigger_manual_clip()?;
        println!(
            "manual trigger: {} clips from {} frames (repeated latest frame: {})",
            summary.clips.len(),
            summary.frame_count,
            summary.synthesized
        );
    }

    assembler.stop()?;
    source.stop()?;
    let status = assembler.status();

    println!(
        "frames={} detections={} clips={} failures={}",
        status.frames_ingested, status.detections, status.clips_created, status.clip_failures
    );
    for round_id in &args.rounds {
        for clip in store.clips_for_round(round_id)? {
            println!("{}", serde_json::to_string(&clip)?);
        }
    }
    println!("output written to {}", out_dir.display());
    Ok(())
}
