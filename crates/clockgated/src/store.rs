use serde::Serialize;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;
use tokio_rusqlite::Connection;

use clockgate_core::{transition, ActivityType, AttendanceError, AttendanceState};

use crate::submit::ClockReceipt;

/// Number of clock results kept locally.
pub const RECENT_LIMIT: u32 = 10;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] tokio_rusqlite::Error),
    #[error("rusqlite error: {0}")]
    Rusqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Transition(#[from] AttendanceError),
}

/// A cached clock result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClockRecord {
    pub id: String,
    pub staff_name: Option<String>,
    pub activity: String,
    pub date: Option<String>,
    pub time: Option<String>,
    pub confidence: Option<f64>,
    pub on_time: Option<bool>,
    pub warning: Option<String>,
    pub verified_after_timeout: bool,
    pub recorded_at: String,
}

/// SQLite cache of recent clock results and the last known attendance
/// state per staff member.
///
/// The backend owns the authoritative attendance record. The mirror here is
/// only used to check transitions locally and is advanced through
/// [`transition`], never written directly.
#[derive(Clone)]
pub struct ClockLogStore {
    conn: Connection,
}

impl ClockLogStore {
    /// Open (or create) the database at the given path and run migrations.
    pub async fn open(db_path: &Path) -> Result<Self, StoreError> {
        if db_path != Path::new(":memory:") {
            if let Some(parent) = db_path.parent() {
                std::fs::create_dir_all(parent).ok();
            }
        }

        let conn = Connection::open(db_path).await?;

        conn.call(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 CREATE TABLE IF NOT EXISTS clock_log (
                     id TEXT PRIMARY KEY,
                     staff_name TEXT,
                     activity TEXT NOT NULL,
                     date TEXT,
                     time TEXT,
                     confidence REAL,
                     on_time INTEGER,
                     warning TEXT,
                     verified INTEGER NOT NULL DEFAULT 0,
                     recorded_at TEXT NOT NULL
                 );
                 CREATE INDEX IF NOT EXISTS idx_clock_log_recorded ON clock_log(recorded_at);
                 CREATE TABLE IF NOT EXISTS attendance_state (
                     staff_name TEXT PRIMARY KEY,
                     state TEXT NOT NULL,
                     last_activity TEXT NOT NULL,
                     updated_at TEXT NOT NULL
                 );",
            )?;
            Ok(())
        })
        .await?;

        Ok(Self { conn })
    }

    /// Cache a successful clock result, keeping only the most recent
    /// [`RECENT_LIMIT`] entries. Returns the generated record ID.
    pub async fn record_success(&self, activity: ActivityType, receipt: &ClockReceipt) -> Result<String, StoreError> {
        let id = uuid::Uuid::new_v4().to_string();
        let recorded_at = chrono::Utc::now().to_rfc3339();
        let tv = receipt.time_validation.clone().unwrap_or_default();

        let id_clone = id.clone();
        let staff_name = receipt.staff_name.clone();
        let date = receipt.date.clone();
        let time = receipt.time.clone();
        let confidence = receipt.confidence.map(f64::from);
        let verified = receipt.verified_after_timeout;
        let activity = activity.as_str();

        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "INSERT INTO clock_log (id, staff_name, activity, date, time, confidence, on_time, warning, verified, recorded_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                    rusqlite::params![
                        id_clone,
                        staff_name,
                        activity,
                        date,
                        time,
                        confidence,
                        tv.is_on_time,
                        tv.warning,
                        verified,
                        recorded_at
                    ],
                )?;
                tx.execute(
                    "DELETE FROM clock_log WHERE id NOT IN (
                         SELECT id FROM clock_log ORDER BY recorded_at DESC, rowid DESC LIMIT ?1
                     )",
                    [RECENT_LIMIT],
                )?;
                tx.commit()?;
                Ok(())
            })
            .await?;

        Ok(id)
    }

    /// Last known attendance state for a staff member (`OUT` if unknown).
    pub async fn current_state(&self, staff_name: &str) -> Result<AttendanceState, StoreError> {
        let staff_name = staff_name.to_string();
        let state: Option<String> = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare("SELECT state FROM attendance_state WHERE staff_name = ?1")?;
                let mut rows = stmt.query([staff_name])?;
                Ok(match rows.next()? {
                    Some(row) => Some(row.get(0)?),
                    None => None,
                })
            })
            .await?;

        match state {
            Some(s) => Ok(AttendanceState::from_str(&s)?),
            None => Ok(AttendanceState::default()),
        }
    }

    /// Advance the mirrored state for `staff_name` by `activity`.
    ///
    /// An illegal transition leaves the mirror untouched and is returned as
    /// [`StoreError::Transition`].
    pub async fn advance_state(&self, staff_name: &str, activity: ActivityType) -> Result<AttendanceState, StoreError> {
        let current = self.current_state(staff_name).await?;
        let next = transition(current, activity)?;

        let staff_name = staff_name.to_string();
        let updated_at = chrono::Utc::now().to_rfc3339();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO attendance_state (staff_name, state, last_activity, updated_at)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(staff_name) DO UPDATE SET
                         state = excluded.state,
                         last_activity = excluded.last_activity,
                         updated_at = excluded.updated_at",
                    rusqlite::params![staff_name, next.as_str(), activity.as_str(), updated_at],
                )?;
                Ok(())
            })
            .await?;

        Ok(next)
    }

    /// Most recent clock results, newest first.
    pub async fn recent(&self, limit: u32) -> Result<Vec<ClockRecord>, StoreError> {
        let limit = limit.min(RECENT_LIMIT);
        let records = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, staff_name, activity, date, time, confidence, on_time, warning, verified, recorded_at
                     FROM clock_log ORDER BY recorded_at DESC, rowid DESC LIMIT ?1",
                )?;
                let rows = stmt
                    .query_map([limit], |row| {
                        Ok(ClockRecord {
                            id: row.get(0)?,
                            staff_name: row.get(1)?,
                            activity: row.get(2)?,
                            date: row.get(3)?,
                            time: row.get(4)?,
                            confidence: row.get(5)?,
                            on_time: row.get(6)?,
                            warning: row.get(7)?,
                            verified_after_timeout: row.get(8)?,
                            recorded_at: row.get(9)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        Ok(records)
    }

    pub async fn count(&self) -> Result<u64, StoreError> {
        let count = self
            .conn
            .call(|conn| {
                let count: u64 = conn.query_row("SELECT COUNT(*) FROM clock_log", [], |row| row.get(0))?;
                Ok(count)
            })
            .await?;
        Ok(count)
    }
}
