//! Active-round lookup.
//!
//! Rounds belong to the wider application; this crate only asks which ones are
//! active at the moment a swing is detected.

use anyhow::{anyhow, Result};
use rusqlite::{Connection, OpenFlags};
use std::collections::BTreeSet;
use std::sync::{Mutex, RwLock};

pub type RoundId = String;

pub const ACTIVE_STATUS: &str = "active";

pub trait RoundRegistry: Send + Sync {
    /// Ids of rounds whose status is active right now.
    fn active_round_ids(&self) -> Result<BTreeSet<RoundId>>;
}

/// Reads `rounds(id, status)` from the application database.
pub struct SqliteRoundRegistry {
    conn: Mutex<Connection>,
}

impl SqliteRoundRegistry {
    /// Open the shared database, creating a minimal `rounds` table when absent.
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS rounds (
              id TEXT PRIMARY KEY,
              status TEXT NOT NULL
            );
            "#,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an existing database without write access.
    pub fn open_read_only(db_path: &str) -> Result<Self> {
        let conn = Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl RoundRegistry for SqliteRoundRegistry {
    fn active_round_ids(&self) -> Result<BTreeSet<RoundId>> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| anyhow!("round registry lock poisoned"))?;
        let mut stmt = conn.prepare("SELECT id FROM rounds WHERE status = ?1")?;
        let ids = stmt
            .query_map([ACTIVE_STATUS], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<BTreeSet<_>>>()?;
        Ok(ids)
    }
}

/// In-memory registry for tests and the synthetic demo.
#[derive(Default)]
pub struct StaticRoundRegistry {
    active: RwLock<BTreeSet<RoundId>>,
}

impl StaticRoundRegistry {
    pub fn new<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<RoundId>,
    {
        Self {
            active: RwLock::new(ids.into_iter().map(Into::into).collect()),
        }
    }

    pub fn activate(&self, id: impl Into<RoundId>) {
        if let Ok(mut active) = self.active.write() {
            active.insert(id.into());
        }
    }

    pub fn deactivate(&self, id: &str) {
        if let Ok(mut active) = self.active.write() {
            active.remove(id);
        }
    }
}

impl RoundRegistry for StaticRoundRegistry {
    fn active_round_ids(&self) -> Result<BTreeSet<RoundId>> {
        let active = self
            .active
            .read()
            .map_err(|_| anyhow!("round registry lock poisoned"))?;
        Ok(active.clone())
    }
}
