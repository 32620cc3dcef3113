//! Rotation Ledger
//!
//! Persistent record of completed rotations, so operators can see what
//! was served when after the rotator exits.

use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::replica::ReplicaIdentity;
use crate::rotation::RotationRecord;

/// Rotation history backed by SQLite
pub struct RotationLedger {
    /// Database connection
    conn: Mutex<Connection>,
}

impl RotationLedger {
    /// Create or open the ledger database
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Self::init(Connection::open(path)?)
    }

    /// Ledger that lives only as long as the process
    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS rotations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                sequence INTEGER NOT NULL,
                source INTEGER NOT NULL,
                from_replica INTEGER NOT NULL,
                to_replica INTEGER NOT NULL,
                started_at TEXT NOT NULL,
                completed_at TEXT NOT NULL
            );
            "#,
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Append a completed rotation
    pub async fn record(&self, record: &RotationRecord) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO rotations (sequence, source, from_replica, to_replica, started_at, completed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.sequence as i64,
                record.source.server_id(),
                record.from.server_id(),
                record.to.server_id(),
                record.started_at.to_rfc3339(),
                record.completed_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Most recent rotations, newest first
    pub async fn history(&self, limit: usize) -> Result<Vec<RotationRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT sequence, source, from_replica, to_replica, started_at, completed_at
             FROM rotations ORDER BY id DESC LIMIT ?1",
        )?;

        let rows = stmt.query_map(params![limit as i64], row_to_raw)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(raw_to_record(row?)?);
        }
        Ok(records)
    }

    /// The last completed rotation, if any
    pub async fn last(&self) -> Result<Option<RotationRecord>> {
        let conn = self.conn.lock().await;
        let raw = conn
            .query_row(
                "SELECT sequence, source, from_replica, to_replica, started_at, completed_at
                 FROM rotations ORDER BY id DESC LIMIT 1",
                [],
                row_to_raw,
            )
            .optional()?;
        raw.map(raw_to_record).transpose()
    }
}

type RawRow = (i64, u32, u32, u32, String, String);

fn row_to_raw(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn parse_time(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::Ledger(format!("bad timestamp {:?}: {}", value, e)))
}

fn raw_to_record(raw: RawRow) -> Result<RotationRecord> {
    let (sequence, source, from, to, started_at, completed_at) = raw;
    Ok(RotationRecord {
        sequence: sequence as u64,
        source: ReplicaIdentity::new(source),
        from: ReplicaIdentity::new(from),
        to: ReplicaIdentity::new(to),
        started_at: parse_time(&started_at)?,
        completed_at: parse_time(&completed_at)?,
    })
}
