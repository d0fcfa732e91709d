use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::clip::ClipSettings;
use crate::detect::DetectorConfig;
use crate::frame::DEFAULT_BUFFER_FRAMES;
use crate::ingest::{SourceConfig, SourceMode};

const DEFAULT_DB_PATH: &str = "shots.db";
const DEFAULT_CLIPS_DIR: &str = "clips";
const DEFAULT_API_ADDR: &str = "127.0.0.1:8790";

#[derive(Debug, Deserialize, Default)]
struct ShotdConfigFile {
    source: Option<SourceConfigFile>,
    detector: Option<DetectorConfigFile>,
    clip: Option<ClipConfigFile>,
    camera: Option<CameraConfigFile>,
    storage: Option<StorageConfigFile>,
    api: Option<ApiConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct SourceConfigFile {
    url: Option<String>,
    mode: Option<String>,
    poll_interval_ms: Option<u64>,
    max_width: Option<u32>,
    timeout_secs: Option<u64>,
    backoff_floor_ms: Option<u64>,
    backoff_ceiling_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectorConfigFile {
    motion_threshold: Option<f64>,
    consecutive_frames: Option<u32>,
    cooldown_secs: Option<u64>,
    var_threshold: Option<f32>,
    learning_rate: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
struct ClipConfigFile {
    duration_secs: Option<u64>,
    target_fps: Option<u32>,
    buffer_frames: Option<usize>,
    workers: Option<usize>,
    queue_depth: Option<usize>,
    post_roll: Option<bool>,
    jpeg_quality: Option<u8>,
    stop_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct CameraConfigFile {
    camera_id: Option<String>,
    hole_number: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct StorageConfigFile {
    db_path: Option<String>,
    clips_dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfigFile {
    addr: Option<String>,
}

/// Resolved `shotd` configuration: defaults, then `SHOT_CONFIG`, then env.
#[derive(Debug, Clone)]
pub struct ShotdConfig {
    pub source: SourceConfig,
    pub detector: DetectorConfig,
    pub clip: ClipSettings,
    pub buffer_frames: usize,
    pub db_path: String,
    pub clips_dir: PathBuf,
    pub api_addr: String,
}

impl ShotdConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("SHOT_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: ShotdConfigFile) -> Result<Self> {
        let source_defaults = SourceConfig::default();
        let source_file = file.source.unwrap_or_default();
        let mode = match source_file.mode.as_deref() {
            Some(mode) => mode.parse::<SourceMode>()?,
            None => source_defaults.mode,
        };
        let source = SourceConfig {
            url: source_file.url.unwrap_or(source_defaults.url),
            mode,
            poll_interval: source_file
                .poll_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(source_defaults.poll_interval),
            max_width: source_file.max_width.unwrap_or(source_defaults.max_width),
            timeout: source_file
                .timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(source_defaults.timeout),
            backoff_floor: source_file
                .backoff_floor_ms
                .map(Duration::from_millis)
                .unwrap_or(source_defaults.backoff_floor),
            backoff_ceiling: source_file
                .backoff_ceiling_ms
                .map(Duration::from_millis)
                .unwrap_or(source_defaults.backoff_ceiling),
        };

        let detector_defaults = DetectorConfig::default();
        let detector_file = file.detector.unwrap_or_default();
        let detector = DetectorConfig {
            motion_threshold: detector_file
                .motion_threshold
                .unwrap_or(detector_defaults.motion_threshold),
            consecutive_frames: detector_file
                .consecutive_frames
                .unwrap_or(detector_defaults.consecutive_frames),
            cooldown: detector_file
                .cooldown_secs
                .map(Duration::from_secs)
                .unwrap_or(detector_defaults.cooldown),
            var_threshold: detector_file
                .var_threshold
                .unwrap_or(detector_defaults.var_threshold),
            learning_rate: detector_file
                .learning_rate
                .unwrap_or(detector_defaults.learning_rate),
        };

        let clip_defaults = ClipSettings::default();
        let clip_file = file.clip.unwrap_or_default();
        let camera_file = file.camera.unwrap_or_default();
        let clip = ClipSettings {
            duration: clip_file
                .duration_secs
                .map(Duration::from_secs)
                .unwrap_or(clip_defaults.duration),
            target_fps: clip_file.target_fps.unwrap_or(clip_defaults.target_fps),
            camera_id: camera_file.camera_id.unwrap_or(clip_defaults.camera_id),
            hole_number: camera_file.hole_number.unwrap_or(clip_defaults.hole_number),
            workers: clip_file.workers.unwrap_or(clip_defaults.workers),
            queue_depth: clip_file.queue_depth.unwrap_or(clip_defaults.queue_depth),
            post_roll: clip_file.post_roll.unwrap_or(clip_defaults.post_roll),
            stop_timeout: clip_file
                .stop_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(clip_defaults.stop_timeout),
            jpeg_quality: clip_file.jpeg_quality.unwrap_or(clip_defaults.jpeg_quality),
        };

        let storage = file.storage.unwrap_or_default();
        Ok(Self {
            source,
            detector,
            clip,
            buffer_frames: clip_file.buffer_frames.unwrap_or(DEFAULT_BUFFER_FRAMES),
            db_path: storage
                .db_path
                .unwrap_or_else(|| DEFAULT_DB_PATH.to_string()),
            clips_dir: storage
                .clips_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CLIPS_DIR)),
            api_addr: file
                .api
                .and_then(|api| api.addr)
                .unwrap_or_else(|| DEFAULT_API_ADDR.to_string()),
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(url) = env_string("SHOT_SOURCE_URL") {
            self.source.url = url;
        }
        if let Some(addr) = env_string("SHOT_API_ADDR") {
            self.api_addr = addr;
        }
        if let Some(path) = env_string("SHOT_DB_PATH") {
            self.db_path = path;
        }
        if let Some(dir) = env_string("SHOT_CLIPS_DIR") {
            self.clips_dir = PathBuf::from(dir);
        }
        if let Some(camera_id) = env_string("SHOT_CAMERA_ID") {
            self.clip.camera_id = camera_id;
        }
        if let Some(hole) = env_string("SHOT_HOLE_NUMBER") {
            self.clip.hole_number = hole
                .parse()
                .map_err(|_| anyhow!("SHOT_HOLE_NUMBER must be a positive integer"))?;
        }
        if let Some(threshold) = env_string("SHOT_MOTION_THRESHOLD") {
            self.detector.motion_threshold = threshold
                .parse()
                .map_err(|_| anyhow!("SHOT_MOTION_THRESHOLD must be a number"))?;
        }
        if let Some(frames) = env_string("SHOT_CONSECUTIVE_FRAMES") {
            self.detector.consecutive_frames = frames
                .parse()
                .map_err(|_| anyhow!("SHOT_CONSECUTIVE_FRAMES must be an integer"))?;
        }
        if let Some(cooldown) = env_string("SHOT_COOLDOWN_SECS") {
            let seconds: u64 = cooldown.parse().map_err(|_| {
                anyhow!("SHOT_COOLDOWN_SECS must be an integer number of seconds")
            })?;
            self.detector.cooldown = Duration::from_secs(seconds);
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        self.detector.validate()?;
        if self.clip.target_fps == 0 {
            return Err(anyhow!("clip.target_fps must be greater than zero"));
        }
        if self.clip.duration.is_zero() {
            return Err(anyhow!("clip.duration_secs must be greater than zero"));
        }
        if self.buffer_frames == 0 {
            return Err(anyhow!("clip.buffer_frames must be greater than zero"));
        }
        if self.clip.workers == 0 || self.clip.queue_depth == 0 {
            return Err(anyhow!("clip.workers and clip.queue_depth must be at least 1"));
        }
        if !(1..=100).contains(&self.clip.jpeg_quality) {
            return Err(anyhow!("clip.jpeg_quality must be between 1 and 100"));
        }
        if self.source.backoff_floor.is_zero()
            || self.source.backoff_ceiling < self.source.backoff_floor
        {
            return Err(anyhow!(
                "source.backoff_floor_ms must be positive and not above backoff_ceiling_ms"
            ));
        }
        if self.clip.camera_id.trim().is_empty() {
            return Err(anyhow!("camera.camera_id must not be empty"));
        }
        if self.source.url.trim().is_empty() {
            return Err(anyhow!("source.url must not be empty"));
        }
        if self.buffer_frames < self.clip.nominal_frames() {
            log::warn!(
                "buffer holds {} frames but a clip needs {}; clips will be truncated",
                self.buffer_frames,
                self.clip.nominal_frames()
            );
        }
        Ok(())
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn read_config_file(path: &Path) -> Result<ShotdConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}
