//! SQLite-backed attendance store.
//!
//! One connection behind a mutex, shared by the D-Bus handlers (gallery
//! reload, enrollment, listings) and the recognition thread (attendance and
//! unknown-track writes). WAL mode keeps external readers (reports, backups)
//! from blocking those writes.

use chrono::{DateTime, Utc};
use headcount_core::config::{DEDUP_INTERVAL_KEY, MATCH_THRESHOLD_KEY};
use headcount_core::store::{StoredIdentity, StoredUnknownTrack};
use headcount_core::{
    AttendanceEvent, AttendanceStore, Profile, RecognitionConfig, StoreError, SubjectId,
    SubjectKind,
};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use serde::Serialize;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS known_identities (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    display_name  TEXT NOT NULL,
    age           INTEGER,
    sex           TEXT,
    ethnicity     TEXT,
    phone         TEXT,
    features      BLOB NOT NULL,
    enrolled_at   TEXT NOT NULL,
    active        INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS unknown_tracks (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    temporary_code    TEXT UNIQUE NOT NULL,
    features          BLOB NOT NULL,
    first_seen_at     TEXT NOT NULL,
    last_seen_at      TEXT NOT NULL,
    occurrence_count  INTEGER NOT NULL DEFAULT 1,
    resolved          INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS attendance (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    subject_id    INTEGER NOT NULL,
    subject_kind  TEXT NOT NULL CHECK (subject_kind IN ('known', 'unknown')),
    recorded_at   TEXT NOT NULL,
    confidence    REAL NOT NULL
);

CREATE INDEX IF NOT EXISTS attendance_recorded_at ON attendance (recorded_at);

CREATE TABLE IF NOT EXISTS config (
    key          TEXT PRIMARY KEY,
    value        TEXT NOT NULL,
    description  TEXT
);

INSERT OR IGNORE INTO config (key, value, description)
    VALUES ('match_threshold', '0.6', 'Cosine similarity a query must exceed to match (0, 1]');
INSERT OR IGNORE INTO config (key, value, description)
    VALUES ('dedup_interval_secs', '5', 'Minimum seconds between attendance records for one person');
";

/// One attendance row with the subject's display name (known) or
/// temporary code (unknown) resolved.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportRow {
    pub subject_id: SubjectId,
    pub subject_kind: SubjectKind,
    /// `None` when the subject row no longer exists.
    pub label: Option<String>,
    pub recorded_at: DateTime<Utc>,
    pub confidence: f32,
}

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Unavailable(format!("create {}: {e}", parent.display()))
            })?;
        }
        let conn = Connection::open(path)
            .map_err(|e| StoreError::Unavailable(format!("open {}: {e}", path.display())))?;
        conn.pragma_update(None, "journal_mode", "WAL").map_err(query_err)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA).map_err(query_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Write both recognition settings. Takes effect on the next config
    /// reload.
    pub fn save_recognition_config(&self, config: &RecognitionConfig) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction().map_err(query_err)?;
        upsert_config(&tx, MATCH_THRESHOLD_KEY, &config.match_threshold.to_string())?;
        upsert_config(&tx, DEDUP_INTERVAL_KEY, &config.dedup_interval.as_secs_f64().to_string())?;
        tx.commit().map_err(query_err)
    }

    pub fn set_identity_active(&self, id: SubjectId, active: bool) -> Result<(), StoreError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE known_identities SET active = ?2 WHERE id = ?1",
                params![id, active],
            )
            .map_err(query_err)?;
        if changed == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    /// Most recent attendance records, newest first.
    pub fn recent_attendance(&self, limit: u32) -> Result<Vec<AttendanceEvent>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT subject_id, subject_kind, recorded_at, confidence
                 FROM attendance ORDER BY recorded_at DESC, id DESC LIMIT ?1",
            )
            .map_err(query_err)?;
        let rows = stmt
            .query_map(params![limit], |row| {
                let subject_id: SubjectId = row.get(0)?;
                let kind: String = row.get(1)?;
                let timestamp: DateTime<Utc> = row.get(2)?;
                let confidence: f64 = row.get(3)?;
                Ok((subject_id, kind, timestamp, confidence))
            })
            .map_err(query_err)?;

        let mut events = Vec::new();
        for row in rows {
            let (subject_id, kind, timestamp, confidence) = row.map_err(query_err)?;
            let Some(subject_kind) = SubjectKind::from_db_str(&kind) else {
                tracing::warn!(subject_id, kind = %kind, "skipping attendance row with unknown subject kind");
                continue;
            };
            events.push(AttendanceEvent {
                subject_id,
                subject_kind,
                timestamp,
                confidence: confidence as f32,
            });
        }
        Ok(events)
    }

    /// Attendance in `[from, to)`, oldest first, with names and temporary
    /// codes filled in.
    pub fn attendance_report(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<ReportRow>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT a.subject_id, a.subject_kind,
                        COALESCE(k.display_name, u.temporary_code),
                        a.recorded_at, a.confidence
                 FROM attendance a
                 LEFT JOIN known_identities k
                        ON a.subject_kind = 'known' AND k.id = a.subject_id
                 LEFT JOIN unknown_tracks u
                        ON a.subject_kind = 'unknown' AND u.id = a.subject_id
                 WHERE a.recorded_at >= ?1 AND a.recorded_at < ?2
                 ORDER BY a.recorded_at, a.id",
            )
            .map_err(query_err)?;
        let rows = stmt
            .query_map(params![from, to], |row| {
                let subject_id: SubjectId = row.get(0)?;
                let kind: String = row.get(1)?;
                let label: Option<String> = row.get(2)?;
                let recorded_at: DateTime<Utc> = row.get(3)?;
                let confidence: f64 = row.get(4)?;
                Ok((subject_id, kind, label, recorded_at, confidence))
            })
            .map_err(query_err)?;

        let mut report = Vec::new();
        for row in rows {
            let (subject_id, kind, label, recorded_at, confidence) = row.map_err(query_err)?;
            let Some(subject_kind) = SubjectKind::from_db_str(&kind) else {
                continue;
            };
            report.push(ReportRow {
                subject_id,
                subject_kind,
                label,
                recorded_at,
                confidence: confidence as f32,
            });
        }
        Ok(report)
    }
}

fn upsert_config(conn: &Connection, key: &str, value: &str) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO config (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, value],
    )
    .map_err(query_err)?;
    Ok(())
}

fn query_err(e: rusqlite::Error) -> StoreError {
    match &e {
        rusqlite::Error::SqliteFailure(err, _) if err.code == ErrorCode::ConstraintViolation => {
            StoreError::Conflict(e.to_string())
        }
        rusqlite::Error::SqliteFailure(err, _)
            if matches!(
                err.code,
                ErrorCode::CannotOpen | ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
            ) =>
        {
            StoreError::Unavailable(e.to_string())
        }
        _ => StoreError::Query(e.to_string()),
    }
}

impl AttendanceStore for SqliteStore {
    fn list_active_known_identities(&self) -> Result<Vec<StoredIdentity>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT id, display_name, age, sex, ethnicity, phone, features
                 FROM known_identities WHERE active = 1 ORDER BY id",
            )
            .map_err(query_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok(StoredIdentity {
                    id: row.get(0)?,
                    display_name: row.get(1)?,
                    profile: Profile {
                        age: row.get(2)?,
                        sex: row.get(3)?,
                        ethnicity: row.get(4)?,
                        phone: row.get(5)?,
                    },
                    features: row.get(6)?,
                })
            })
            .map_err(query_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(query_err)
    }

    fn insert_known_identity(
        &self,
        display_name: &str,
        profile: &Profile,
        features: &[u8],
    ) -> Result<SubjectId, StoreError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO known_identities (display_name, age, sex, ethnicity, phone, features, enrolled_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                display_name,
                profile.age,
                profile.sex,
                profile.ethnicity,
                profile.phone,
                features,
                Utc::now(),
            ],
        )
        .map_err(query_err)?;
        Ok(conn.last_insert_rowid())
    }

    fn insert_unknown_track(
        &self,
        temporary_code: &str,
        features: &[u8],
        seen_at: DateTime<Utc>,
    ) -> Result<SubjectId, StoreError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO unknown_tracks (temporary_code, features, first_seen_at, last_seen_at)
             VALUES (?1, ?2, ?3, ?3)",
            params![temporary_code, features, seen_at],
        )
        .map_err(query_err)?;
        Ok(conn.last_insert_rowid())
    }

    fn list_open_unknown_tracks(&self) -> Result<Vec<StoredUnknownTrack>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT id, temporary_code, features, first_seen_at, last_seen_at, occurrence_count, resolved
                 FROM unknown_tracks WHERE resolved = 0
                 ORDER BY occurrence_count DESC, last_seen_at DESC, id",
            )
            .map_err(query_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok(StoredUnknownTrack {
                    id: row.get(0)?,
                    temporary_code: row.get(1)?,
                    features: row.get(2)?,
                    first_seen_at: row.get(3)?,
                    last_seen_at: row.get(4)?,
                    occurrence_count: row.get(5)?,
                    resolved: row.get(6)?,
                })
            })
            .map_err(query_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(query_err)
    }

    fn bump_unknown_track(&self, id: SubjectId, seen_at: DateTime<Utc>) -> Result<(), StoreError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE unknown_tracks
                 SET last_seen_at = MAX(last_seen_at, ?2), occurrence_count = occurrence_count + 1
                 WHERE id = ?1 AND resolved = 0",
                params![id, seen_at],
            )
            .map_err(query_err)?;
        if changed == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    fn resolve_unknown_track(&self, id: SubjectId) -> Result<(), StoreError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE unknown_tracks SET resolved = 1 WHERE id = ?1 AND resolved = 0",
                params![id],
            )
            .map_err(query_err)?;
        if changed == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    fn promote_unknown_track(
        &self,
        id: SubjectId,
        display_name: &str,
        profile: &Profile,
    ) -> Result<SubjectId, StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction().map_err(query_err)?;
        let features: Vec<u8> = tx
            .query_row(
                "SELECT features FROM unknown_tracks WHERE id = ?1 AND resolved = 0",
                params![id],
                |row| row.get(0),
            )
            .optional()
            .map_err(query_err)?
            .ok_or(StoreError::NotFound(id))?;
        tx.execute(
            "INSERT INTO known_identities (display_name, age, sex, ethnicity, phone, features, enrolled_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                display_name,
                profile.age,
                profile.sex,
                profile.ethnicity,
                profile.phone,
                features,
                Utc::now(),
            ],
        )
        .map_err(query_err)?;
        let identity_id = tx.last_insert_rowid();
        tx.execute("UPDATE unknown_tracks SET resolved = 1 WHERE id = ?1", params![id])
            .map_err(query_err)?;
        tx.commit().map_err(query_err)?;
        Ok(identity_id)
    }

    fn record_attendance(&self, event: &AttendanceEvent) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "INSERT INTO attendance (subject_id, subject_kind, recorded_at, confidence)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    event.subject_id,
                    event.subject_kind.as_str(),
                    event.timestamp,
                    event.confidence as f64,
                ],
            )
            .map_err(query_err)?;
        Ok(())
    }

    fn get_config(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.conn()
            .query_row("SELECT value FROM config WHERE key = ?1", params![key], |row| row.get(0))
            .optional()
            .map_err(query_err)
    }
}
