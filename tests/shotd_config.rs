use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use tempfile::{Builder, NamedTempFile};

use shot_clipper::config::ShotdConfig;
use shot_clipper::ingest::SourceMode;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "SHOT_CONFIG",
        "SHOT_SOURCE_URL",
        "SHOT_API_ADDR",
        "SHOT_DB_PATH",
        "SHOT_CLIPS_DIR",
        "SHOT_CAMERA_ID",
        "SHOT_HOLE_NUMBER",
        "SHOT_MOTION_THRESHOLD",
        "SHOT_CONSECUTIVE_FRAMES",
        "SHOT_COOLDOWN_SECS",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn defaults_without_file_or_env() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = ShotdConfig::load().expect("load defaults");
    assert_eq!(cfg.detector.motion_threshold, 5000.0);
    assert_eq!(cfg.detector.consecutive_frames, 3);
    assert_eq!(cfg.detector.cooldown, Duration::from_secs(10));
    assert_eq!(cfg.clip.duration, Duration::from_secs(10));
    assert_eq!(cfg.clip.target_fps, 30);
    assert_eq!(cfg.clip.camera_id, "lexington_hole_1");
    assert_eq!(cfg.clip.hole_number, 1);
    assert_eq!(cfg.buffer_frames, 300);
    assert_eq!(cfg.source.max_width, 1280);
    assert_eq!(cfg.source.poll_interval, Duration::from_millis(500));
    assert_eq!(cfg.source.mode, SourceMode::Snapshot);
    assert_eq!(cfg.source.backoff_floor, Duration::from_secs(1));
    assert_eq!(cfg.source.backoff_ceiling, Duration::from_secs(20));
    assert_eq!(cfg.clip.jpeg_quality, 85);
}

#[test]
fn loads_config_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{
        "source": {
            "url": "http://10.0.0.5/capture",
            "mode": "mjpeg",
            "poll_interval_ms": 250,
            "max_width": 960,
            "timeout_secs": 4,
            "backoff_floor_ms": 500,
            "backoff_ceiling_ms": 8000
        },
        "detector": {
            "motion_threshold": 7500,
            "consecutive_frames": 4,
            "cooldown_secs": 15
        },
        "clip": {
            "duration_secs": 8,
            "target_fps": 25,
            "buffer_frames": 250,
            "workers": 3,
            "queue_depth": 4,
            "post_roll": false,
            "jpeg_quality": 70,
            "stop_timeout_secs": 2
        },
        "camera": {
            "camera_id": "augusta_hole_12",
            "hole_number": 12
        },
        "storage": {
            "db_path": "prod_shots.db",
            "clips_dir": "/var/lib/shots/clips"
        },
        "api": {
            "addr": "0.0.0.0:9100"
        }
    }"#;
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");

    std::env::set_var("SHOT_CONFIG", file.path());
    std::env::set_var("SHOT_HOLE_NUMBER", "13");
    std::env::set_var("SHOT_COOLDOWN_SECS", "20");
    std::env::set_var("SHOT_CLIPS_DIR", "/tmp/override_clips");

    let cfg = ShotdConfig::load().expect("load config");

    assert_eq!(cfg.source.url, "http://10.0.0.5/capture");
    assert_eq!(cfg.source.mode, SourceMode::Mjpeg);
    assert_eq!(cfg.source.poll_interval, Duration::from_millis(250));
    assert_eq!(cfg.source.max_width, 960);
    assert_eq!(cfg.source.timeout, Duration::from_secs(4));
    assert_eq!(cfg.source.backoff_floor, Duration::from_millis(500));
    assert_eq!(cfg.source.backoff_ceiling, Duration::from_secs(8));
    assert_eq!(cfg.detector.motion_threshold, 7500.0);
    assert_eq!(cfg.detector.consecutive_frames, 4);
    assert_eq!(cfg.detector.cooldown, Duration::from_secs(20));
    assert_eq!(cfg.clip.duration, Duration::from_secs(8));
    assert_eq!(cfg.clip.target_fps, 25);
    assert_eq!(cfg.clip.workers, 3);
    assert_eq!(cfg.clip.queue_depth, 4);
    assert!(!cfg.clip.post_roll);
    assert_eq!(cfg.clip.jpeg_quality, 70);
    assert_eq!(cfg.clip.stop_timeout, Duration::from_secs(2));
    assert_eq!(cfg.buffer_frames, 250);
    assert_eq!(cfg.clip.camera_id, "augusta_hole_12");
    assert_eq!(cfg.clip.hole_number, 13);
    assert_eq!(cfg.db_path, "prod_shots.db");
    assert_eq!(cfg.clips_dir, PathBuf::from("/tmp/override_clips"));
    assert_eq!(cfg.api_addr, "0.0.0.0:9100");

    clear_env();
}

#[test]
fn toml_config_files_are_accepted() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = Builder::new().suffix(".toml").tempfile().expect("temp config");
    let toml = r#"
        [camera]
        camera_id = "pebble_hole_7"
        hole_number = 7

        [detector]
        motion_threshold = 3000.0
    "#;
    std::io::Write::write_all(&mut file, toml.as_bytes()).expect("write config");
    std::env::set_var("SHOT_CONFIG", file.path());

    let cfg = ShotdConfig::load().expect("load toml config");
    assert_eq!(cfg.clip.camera_id, "pebble_hole_7");
    assert_eq!(cfg.clip.hole_number, 7);
    assert_eq!(cfg.detector.motion_threshold, 3000.0);

    clear_env();
}

#[test]
fn rejects_invalid_detector_settings() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("SHOT_MOTION_THRESHOLD", "0");
    assert!(ShotdConfig::load().is_err());
    clear_env();

    std::env::set_var("SHOT_CONSECUTIVE_FRAMES", "0");
    assert!(ShotdConfig::load().is_err());
    clear_env();

    std::env::set_var("SHOT_HOLE_NUMBER", "first");
    assert!(ShotdConfig::load().is_err());
    clear_env();
}

#[test]
fn rejects_unknown_source_mode_and_zero_fps() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    std::io::Write::write_all(&mut file, br#"{"source": {"mode": "rtsp"}}"#).expect("write");
    std::env::set_var("SHOT_CONFIG", file.path());
    assert!(ShotdConfig::load().is_err());

    for bad in [
        r#"{"clip": {"target_fps": 0}}"#,
        r#"{"clip": {"jpeg_quality": 0}}"#,
        r#"{"source": {"backoff_floor_ms": 5000, "backoff_ceiling_ms": 1000}}"#,
    ] {
        let mut file = NamedTempFile::new().expect("temp config");
        std::io::Write::write_all(&mut file, bad.as_bytes()).expect("write");
        std::env::set_var("SHOT_CONFIG", file.path());
        assert!(ShotdConfig::load().is_err(), "{}", bad);
    }

    clear_env();
}
