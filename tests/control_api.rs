use anyhow::Result;
use image::{Rgb, RgbImage};
use serde_json::Value;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant, SystemTime};
use tempfile::tempdir;

use shot_clipper::api::{ApiConfig, ApiHandle, ApiServer};
use shot_clipper::{
    ClipAssembler, ClipEncoder, ClipSettings, ClipStore, DetectorConfig, FilesystemClipStore,
    Frame, FrameBuffer, LatestFrame, LatestFrameFeed, MjpegAviEncoder, MotionDetector,
    StaticRoundRegistry, SystemClock,
};

/// Blocks video encodes until `open` is set.
struct HeldEncoder {
    open: Arc<AtomicBool>,
    inner: MjpegAviEncoder,
}

impl ClipEncoder for HeldEncoder {
    fn video_extension(&self) -> &'static str {
        self.inner.video_extension()
    }

    fn encode_video(&self, frames: &[Frame], fps: u32) -> Result<Vec<u8>> {
        while !self.open.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(5));
        }
        self.inner.encode_video(frames, fps)
    }

    fn encode_poster(&self, frame: &Frame) -> Result<Vec<u8>> {
        self.inner.encode_poster(frame)
    }
}

fn send(addr: std::net::SocketAddr, method: &str, path: &str) -> Result<(String, Vec<u8>)> {
    let mut stream = TcpStream::connect(addr)?;
    stream.set_read_timeout(Some(Duration::from_secs(10)))?;
    let request = format!(
        "{method} {path} HTTP/1.1\r\nHost: localhost\r\nContent-Length: 0\r\n\r\n",
        method = method,
        path = path
    );
    stream.write_all(request.as_bytes())?;
    read_response(&mut stream)
}

fn read_response(stream: &mut TcpStream) -> Result<(String, Vec<u8>)> {
    let mut response = Vec::new();
    stream.read_to_end(&mut response)?;
    let split = response
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .unwrap_or(response.len());
    let headers = String::from_utf8_lossy(&response[..split]).to_string();
    let body = response.get(split + 4..).unwrap_or_default().to_vec();
    Ok((headers, body))
}

struct TestApi {
    _dir: tempfile::TempDir,
    store: Arc<FilesystemClipStore>,
    latest: LatestFrame,
    assembler: ClipAssembler,
    api_handle: Option<ApiHandle>,
}

impl TestApi {
    fn new(start_assembler: bool) -> Result<Self> {
        Self::build(start_assembler, None)
    }

    fn build(start_assembler: bool, encoder: Option<Arc<dyn ClipEncoder>>) -> Result<Self> {
        let dir = tempdir()?;
        let db_path = dir.path().join("shots.db");
        let store = Arc::new(FilesystemClipStore::open(
            dir.path().join("clips"),
            &db_path.to_string_lossy(),
        )?);
        let latest = LatestFrame::new();
        let settings = ClipSettings {
            duration: Duration::from_secs(2),
            target_fps: 10,
            camera_id: "api_cam".to_string(),
            ..ClipSettings::default()
        };
        let assembler = ClipAssembler::new(
            settings,
            MotionDetector::new(DetectorConfig::default())?,
            Arc::new(FrameBuffer::new(50)),
            Arc::new(StaticRoundRegistry::new(["r1", "r2"])),
            store.clone(),
            Arc::new(SystemClock),
        )
        .with_latest_frame(latest.clone());
        let mut assembler = match encoder {
            Some(encoder) => assembler.with_encoder(encoder),
            None => assembler,
        };
        if start_assembler {
            assembler.start(Box::new(LatestFrameFeed::new(latest.clone())))?;
        }

        let clip_store: Arc<dyn ClipStore> = store.clone();
        let api_config = ApiConfig {
            addr: "127.0.0.1:0".to_string(),
        };
        let api_handle = ApiServer::new(api_config, assembler.control(), clip_store).spawn()?;
        Ok(Self {
            _dir: dir,
            store,
            latest,
            assembler,
            api_handle: Some(api_handle),
        })
    }

    fn publish_frame(&self) {
        let image = RgbImage::from_pixel(32, 24, Rgb([30, 120, 40]));
        self.latest.publish(Frame::new(image, SystemTime::now()));
    }

    fn addr(&self) -> std::net::SocketAddr {
        self.api_handle.as_ref().expect("api handle").addr
    }

    fn request(&self, method: &str, path: &str) -> Result<(String, Vec<u8>)> {
        send(self.addr(), method, path)
    }

    fn json(&self, method: &str, path: &str) -> Result<(String, Value)> {
        let (headers, body) = self.request(method, path)?;
        Ok((headers, serde_json::from_slice(&body)?))
    }
}

impl Drop for TestApi {
    fn drop(&mut self) {
        if let Some(handle) = self.api_handle.take() {
            let _ = handle.stop();
        }
        let _ = self.assembler.stop();
    }
}

#[test]
fn health_reflects_running_and_frame_age() -> Result<()> {
    let stopped = TestApi::new(false)?;
    let (headers, body) = stopped.json("GET", "/health")?;
    assert!(headers.starts_with("HTTP/1.1 200"));
    assert_eq!(body["status"], "stopped");
    assert_eq!(body["running"], false);
    assert!(body["frame_age_ms"].is_null());

    let api = TestApi::new(true)?;
    let (_, body) = api.json("GET", "/health")?;
    assert_eq!(body["status"], "stale");
    assert_eq!(body["running"], true);

    api.publish_frame();
    let (_, body) = api.json("GET", "/health")?;
    assert_eq!(body["status"], "ok");
    assert!(body["frame_age_ms"].as_u64().is_some());
    Ok(())
}

#[test]
fn status_and_stats_are_json() -> Result<()> {
    let api = TestApi::new(true)?;
    let (headers, status) = api.json("GET", "/status")?;
    assert!(headers.contains("Content-Type: application/json"));
    assert_eq!(status["running"], true);
    assert_eq!(status["detections"], 0);
    assert_eq!(status["clips_created"], 0);
    assert!(status["last_detection_time"].is_null());

    let (_, stats) = api.json("GET", "/clips/stats")?;
    assert_eq!(stats["total_clips"], 0);
    assert_eq!(stats["recent_clip_ids"], Value::Array(Vec::new()));
    Ok(())
}

#[test]
fn trigger_without_frame_is_unavailable() -> Result<()> {
    let api = TestApi::new(false)?;
    let (headers, body) = api.json("POST", "/clips/trigger")?;
    assert!(headers.starts_with("HTTP/1.1 503"));
    assert_eq!(body["error"], "no_frame_available");
    assert_eq!(api.store.stats()?.total_clips, 0);

    let (headers, _) = api.request("GET", "/frame/latest")?;
    assert!(headers.starts_with("HTTP/1.1 503"));
    Ok(())
}

#[test]
fn trigger_with_frame_creates_manual_clips() -> Result<()> {
    let api = TestApi::new(false)?;
    api.publish_frame();

    let (headers, body) = api.json("POST", "/clips/trigger")?;
    assert!(headers.starts_with("HTTP/1.1 200"), "{}", headers);
    assert_eq!(body["synthesized"], true);
    assert_eq!(body["frame_count"], 20);
    assert_eq!(body["rounds"], 2);
    assert_eq!(body["failures"], 0);
    let clips = body["clips"].as_array().expect("clips array");
    assert_eq!(clips.len(), 2);
    for clip in clips {
        assert_eq!(clip["detection_method"], "manual");
        assert_eq!(clip["auto_generated"], false);
        assert_eq!(clip["camera_id"], "api_cam");
        assert_eq!(clip["duration_seconds"], 2);
        let locator = clip["video_locator"].as_str().expect("locator");
        assert!(api.store.artifact_exists(locator));
    }

    let (_, stats) = api.json("GET", "/clips/stats")?;
    assert_eq!(stats["total_clips"], 2);
    assert_eq!(stats["recent_clip_ids"].as_array().map(Vec::len), Some(2));
    Ok(())
}

#[test]
fn latest_frame_is_served_as_jpeg() -> Result<()> {
    let api = TestApi::new(false)?;
    api.publish_frame();
    let (headers, body) = api.request("GET", "/frame/latest")?;
    assert!(headers.starts_with("HTTP/1.1 200"));
    assert!(headers.contains("Content-Type: image/jpeg"));
    assert_eq!(&body[..2], &[0xFF, 0xD8]);
    Ok(())
}

#[test]
fn wrong_method_and_unknown_path() -> Result<()> {
    let api = TestApi::new(false)?;
    let (headers, body) = api.json("GET", "/clips/trigger")?;
    assert!(headers.starts_with("HTTP/1.1 405"));
    assert_eq!(body["error"], "method_not_allowed");

    let (headers, _) = api.request("DELETE", "/status")?;
    assert!(headers.starts_with("HTTP/1.1 405"));

    let (headers, body) = api.json("GET", "/clips/everything")?;
    assert!(headers.starts_with("HTTP/1.1 404"));
    assert_eq!(body["error"], "not_found");
    Ok(())
}

#[test]
fn health_answers_while_a_trigger_is_encoding() -> Result<()> {
    let open = Arc::new(AtomicBool::new(false));
    let encoder: Arc<dyn ClipEncoder> = Arc::new(HeldEncoder {
        open: open.clone(),
        inner: MjpegAviEncoder::default(),
    });
    let api = TestApi::build(false, Some(encoder))?;
    api.publish_frame();

    let addr = api.addr();
    let trigger = thread::spawn(move || send(addr, "POST", "/clips/trigger"));
    thread::sleep(Duration::from_millis(100));

    let asked = Instant::now();
    let (headers, body) = api.json("GET", "/health")?;
    assert!(headers.starts_with("HTTP/1.1 200"));
    assert_eq!(body["status"], "stopped");
    assert!(asked.elapsed() < Duration::from_secs(2));
    assert!(!trigger.is_finished());
    let (headers, _) = api.request("GET", "/status")?;
    assert!(headers.starts_with("HTTP/1.1 200"));

    open.store(true, Ordering::SeqCst);
    let (headers, body) = trigger.join().expect("trigger thread")?;
    assert!(headers.starts_with("HTTP/1.1 200"), "{}", headers);
    let body: Value = serde_json::from_slice(&body)?;
    assert_eq!(body["clips"].as_array().map(Vec::len), Some(2));
    Ok(())
}

#[test]
fn malformed_request_line_is_rejected() -> Result<()> {
    let api = TestApi::new(false)?;
    let mut stream = TcpStream::connect(api.addr())?;
    stream.write_all(b"NONSENSE\r\n\r\n")?;
    let (headers, body) = read_response(&mut stream)?;
    assert!(headers.starts_with("HTTP/1.1 400"), "{}", headers);
    let body: Value = serde_json::from_slice(&body)?;
    assert_eq!(body["error"], "bad_request");
    Ok(())
}

#[test]
fn status_reports_buffer_and_stop_state() -> Result<()> {
    let api = TestApi::new(false)?;
    let (_, status) = api.json("GET", "/status")?;
    assert_eq!(status["stopping"], false);
    assert_eq!(status["buffer_capacity"], 50);
    assert_eq!(status["buffer_bytes"], 0);
    Ok(())
}
