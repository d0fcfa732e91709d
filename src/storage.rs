//! Clip persistence.
//!
//! Storage happens in two steps so a clip record never points at bytes that
//! were not written: `persist` stores the video and poster and hands back their
//! locators, then `record` inserts the clip row. When `record` fails the
//! caller hands the locators to `discard` so no unreferenced artifacts remain.
//!
//! - `FilesystemClipStore`: artifacts under a clips directory, rows in SQLite.
//! - `InMemoryClipStore`: everything in memory, with per-round failure
//!   injection for tests.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::clip::{Clip, ClipDraft, DetectionMethod};

/// Number of clip ids reported by `stats`.
pub const RECENT_CLIPS: usize = 5;

/// URL prefix under which filesystem artifacts are served.
pub const CLIP_LOCATOR_PREFIX: &str = "/clips/";

/// Where the video and poster of one clip ended up.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredArtifacts {
    pub video_locator: String,
    pub poster_locator: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ClipStats {
    pub total_clips: usize,
    /// Newest first.
    pub recent_clip_ids: Vec<String>,
}

pub trait ClipStore: Send + Sync {
    /// Store the artifacts of `draft` and return their locators.
    fn persist(&self, video: &[u8], poster: &[u8], draft: &ClipDraft) -> Result<StoredArtifacts>;

    /// Insert the clip record. Ids are unique.
    fn record(&self, clip: &Clip) -> Result<()>;

    /// Remove artifacts returned by `persist` that never got a record.
    /// Artifacts already gone are not an error.
    fn discard(&self, artifacts: &StoredArtifacts) -> Result<()>;

    /// Clips recorded for `round_id`, oldest first.
    fn clips_for_round(&self, round_id: &str) -> Result<Vec<Clip>>;

    fn stats(&self) -> Result<ClipStats>;
}

fn artifact_names(draft: &ClipDraft) -> Result<(String, String)> {
    if draft.id.is_empty()
        || !draft
            .id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(anyhow!("clip id '{}' is not a safe file name", draft.id));
    }
    Ok((
        format!("{}.{}", draft.id, draft.video_extension),
        format!("{}_poster.jpg", draft.id),
    ))
}

fn format_time(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_time(value: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)
        .with_context(|| format!("bad timestamp '{}'", value))?
        .with_timezone(&Utc))
}

// ----------------------------------------------------------------------------
// Filesystem + SQLite
// ----------------------------------------------------------------------------

pub struct FilesystemClipStore {
    clips_dir: PathBuf,
    conn: Mutex<Connection>,
}

impl FilesystemClipStore {
    pub fn open(clips_dir: impl AsRef<Path>, db_path: &str) -> Result<Self> {
        let clips_dir = clips_dir.as_ref().to_path_buf();
        fs::create_dir_all(&clips_dir)
            .with_context(|| format!("create clips dir {}", clips_dir.display()))?;
        let conn = Connection::open(db_path)?;
        let store = Self {
            clips_dir,
            conn: Mutex::new(conn),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_schema(&self) -> Result<()> {
        self.conn().execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS clips (
              seq INTEGER PRIMARY KEY AUTOINCREMENT,
              id TEXT NOT NULL UNIQUE,
              round_id TEXT NOT NULL,
              hole_number INTEGER NOT NULL,
              camera_id TEXT NOT NULL,
              video_locator TEXT NOT NULL,
              poster_locator TEXT NOT NULL,
              duration_seconds INTEGER NOT NULL,
              frame_count INTEGER NOT NULL,
              video_sha256 TEXT NOT NULL,
              created_at TEXT NOT NULL,
              detected_at TEXT NOT NULL,
              auto_generated INTEGER NOT NULL,
              detection_method TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_clips_round ON clips(round_id);
            "#,
        )?;
        Ok(())
    }

    pub fn clips_dir(&self) -> &Path {
        &self.clips_dir
    }

    /// Filesystem path for a `/clips/<file>` locator.
    pub fn artifact_path(&self, locator: &str) -> Option<PathBuf> {
        let name = locator.strip_prefix(CLIP_LOCATOR_PREFIX)?;
        if name.is_empty() || name.contains('/') || name.contains("..") {
            return None;
        }
        Some(self.clips_dir.join(name))
    }

    pub fn artifact_exists(&self, locator: &str) -> bool {
        self.artifact_path(locator)
            .map(|path| path.is_file())
            .unwrap_or(false)
    }
}

impl ClipStore for FilesystemClipStore {
    fn persist(&self, video: &[u8], poster: &[u8], draft: &ClipDraft) -> Result<StoredArtifacts> {
        let (video_name, poster_name) = artifact_names(draft)?;
        let video_path = self.clips_dir.join(&video_name);
        let poster_path = self.clips_dir.join(&poster_name);
        if video_path.exists() || poster_path.exists() {
            return Err(anyhow!("artifacts for clip {} already exist", draft.id));
        }

        write_atomic(&video_path, video)
            .with_context(|| format!("write {}", video_path.display()))?;
        if let Err(e) = write_atomic(&poster_path, poster) {
            let _ = fs::remove_file(&video_path);
            return Err(e.context(format!("write {}", poster_path.display())));
        }

        Ok(StoredArtifacts {
            video_locator: format!("{}{}", CLIP_LOCATOR_PREFIX, video_name),
            poster_locator: format!("{}{}", CLIP_LOCATOR_PREFIX, poster_name),
        })
    }

    fn record(&self, clip: &Clip) -> Result<()> {
        self.conn().execute(
            r#"
            INSERT INTO clips(
              id, round_id, hole_number, camera_id, video_locator, poster_locator,
              duration_seconds, frame_count, video_sha256, created_at, detected_at,
              auto_generated, detection_method
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            "#,
            params![
                clip.id,
                clip.round_id,
                clip.hole_number,
                clip.camera_id,
                clip.video_locator,
                clip.poster_locator,
                clip.duration_seconds,
                clip.frame_count,
                clip.video_sha256,
                format_time(&clip.created_at),
                format_time(&clip.detected_at),
                clip.auto_generated,
                clip.detection_method.as_str(),
            ],
        )?;
        Ok(())
    }

    fn discard(&self, artifacts: &StoredArtifacts) -> Result<()> {
        let mut first_err = None;
        for locator in [&artifacts.video_locator, &artifacts.poster_locator] {
            let Some(path) = self.artifact_path(locator) else {
                first_err.get_or_insert(anyhow!("'{}' is not a clip locator", locator));
                continue;
            };
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    first_err.get_or_insert(anyhow!("remove {}: {}", path.display(), e));
                }
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    fn clips_for_round(&self, round_id: &str) -> Result<Vec<Clip>> {
        let rows = {
            let conn = self.conn();
            let mut stmt = conn.prepare(
                r#"
                SELECT id, round_id, hole_number, camera_id, video_locator, poster_locator,
                       duration_seconds, frame_count, video_sha256, created_at, detected_at,
                       auto_generated, detection_method
                FROM clips WHERE round_id = ?1 ORDER BY seq ASC
                "#,
            )?;
            let rows = stmt
                .query_map(params![round_id], ClipRow::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };
        rows.into_iter().map(ClipRow::into_clip).collect()
    }

    fn stats(&self) -> Result<ClipStats> {
        let conn = self.conn();
        let total: i64 = conn.query_row("SELECT COUNT(*) FROM clips", [], |row| row.get(0))?;
        let mut stmt = conn.prepare("SELECT id FROM clips ORDER BY seq DESC LIMIT ?1")?;
        let recent_clip_ids = stmt
            .query_map(params![RECENT_CLIPS as i64], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ClipStats {
            total_clips: total as usize,
            recent_clip_ids,
        })
    }
}

struct ClipRow {
    id: String,
    round_id: String,
    hole_number: u32,
    camera_id: String,
    video_locator: String,
    poster_locator: String,
    duration_seconds: u32,
    frame_count: u32,
    video_sha256: String,
    created_at: String,
    detected_at: String,
    auto_generated: bool,
    detection_method: String,
}

impl ClipRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            round_id: row.get(1)?,
            hole_number: row.get(2)?,
            camera_id: row.get(3)?,
            video_locator: row.get(4)?,
            poster_locator: row.get(5)?,
            duration_seconds: row.get(6)?,
            frame_count: row.get(7)?,
            video_sha256: row.get(8)?,
            created_at: row.get(9)?,
            detected_at: row.get(10)?,
            auto_generated: row.get(11)?,
            detection_method: row.get(12)?,
        })
    }

    fn into_clip(self) -> Result<Clip> {
        Ok(Clip {
            id: self.id,
            round_id: self.round_id,
            hole_number: self.hole_number,
            camera_id: self.camera_id,
            video_locator: self.video_locator,
            poster_locator: self.poster_locator,
            duration_seconds: self.duration_seconds,
            frame_count: self.frame_count,
            video_sha256: self.video_sha256,
            created_at: parse_time(&self.created_at)?,
            detected_at: parse_time(&self.detected_at)?,
            auto_generated: self.auto_generated,
            detection_method: self.detection_method.parse::<DetectionMethod>()?,
        })
    }
}

fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let tmp_path = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp_path)?;
        file.write_all(data)?;
        file.sync_all()?;
    }
    fs::rename(tmp_path, path)?;
    Ok(())
}

// ----------------------------------------------------------------------------
// In-memory
// ----------------------------------------------------------------------------

pub const MEMORY_LOCATOR_PREFIX: &str = "mem://clips/";

#[derive(Default)]
struct MemoryState {
    artifacts: HashMap<String, Vec<u8>>,
    clips: Vec<Clip>,
    failing_rounds: HashSet<String>,
    failing_records: HashSet<String>,
}

/// Store kept entirely in memory.
#[derive(Default)]
pub struct InMemoryClipStore {
    state: Mutex<MemoryState>,
}

impl InMemoryClipStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make every `persist` for `round_id` fail.
    pub fn fail_round(&self, round_id: impl Into<String>) {
        self.state().failing_rounds.insert(round_id.into());
    }

    /// Make every `record` for `round_id` fail after its artifacts are stored.
    pub fn fail_records(&self, round_id: impl Into<String>) {
        self.state().failing_records.insert(round_id.into());
    }

    /// Every recorded clip, in insertion order.
    pub fn clips(&self) -> Vec<Clip> {
        self.state().clips.clone()
    }

    pub fn artifact(&self, locator: &str) -> Option<Vec<u8>> {
        self.state().artifacts.get(locator).cloned()
    }

    pub fn artifact_count(&self) -> usize {
        self.state().artifacts.len()
    }
}

impl ClipStore for InMemoryClipStore {
    fn persist(&self, video: &[u8], poster: &[u8], draft: &ClipDraft) -> Result<StoredArtifacts> {
        let (video_name, poster_name) = artifact_names(draft)?;
        let mut state = self.state();
        if state.failing_rounds.contains(&draft.round_id) {
            return Err(anyhow!("storage unavailable for round {}", draft.round_id));
        }
        let video_locator = format!("{}{}", MEMORY_LOCATOR_PREFIX, video_name);
        let poster_locator = format!("{}{}", MEMORY_LOCATOR_PREFIX, poster_name);
        if state.artifacts.contains_key(&video_locator) {
            return Err(anyhow!("artifacts for clip {} already exist", draft.id));
        }
        state.artifacts.insert(video_locator.clone(), video.to_vec());
        state.artifacts.insert(poster_locator.clone(), poster.to_vec());
        Ok(StoredArtifacts {
            video_locator,
            poster_locator,
        })
    }

    fn record(&self, clip: &Clip) -> Result<()> {
        let mut state = self.state();
        if state.failing_records.contains(&clip.round_id) {
            return Err(anyhow!("clip table unavailable for round {}", clip.round_id));
        }
        if state.clips.iter().any(|c| c.id == clip.id) {
            return Err(anyhow!("clip {} already recorded", clip.id));
        }
        state.clips.push(clip.clone());
        Ok(())
    }

    fn discard(&self, artifacts: &StoredArtifacts) -> Result<()> {
        let mut state = self.state();
        state.artifacts.remove(&artifacts.video_locator);
        state.artifacts.remove(&artifacts.poster_locator);
        Ok(())
    }

    fn clips_for_round(&self, round_id: &str) -> Result<Vec<Clip>> {
        Ok(self
            .state()
            .clips
            .iter()
            .filter(|c| c.round_id == round_id)
            .cloned()
            .collect())
    }

    fn stats(&self) -> Result<ClipStats> {
        let state = self.state();
        Ok(ClipStats {
            total_clips: state.clips.len(),
            recent_clip_ids: state
                .clips
                .iter()
                .rev()
                .take(RECENT_CLIPS)
                .map(|c| c.id.clone())
                .collect(),
        })
    }
}
