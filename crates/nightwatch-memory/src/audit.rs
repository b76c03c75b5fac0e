//! Append-only audit log.
//!
//! Persists every auditable [`SafetyEvent`] to a local SQLite database.
//! Rows are immutable: `BEFORE UPDATE` and `BEFORE DELETE` triggers abort any
//! attempt to change history, including from outside this crate.
//!
//! # Storage layout
//!
//! | column    | type    | description                                   |
//! |-----------|---------|-----------------------------------------------|
//! | seq       | INTEGER | Monotonic insertion order                     |
//! | id        | TEXT    | UUID of the originating bus event             |
//! | timestamp | TEXT    | RFC-3339 event time (UTC)                     |
//! | source    | TEXT    | Component that emitted the event              |
//! | category  | TEXT    | `veto`, `emergency`, `confirmation`, ...      |
//! | tag       | TEXT    | Veto reason, tool name or emergency kind      |
//! | summary   | TEXT    | Human-readable one-liner                      |
//! | detail    | TEXT    | Full event payload as JSON                    |
//!
//! # Example
//!
//! ```rust
//! use nightwatch_memory::audit::AuditLog;
//! use nightwatch_types::{ClearedBy, Event, SafetyEvent};
//!
//! let log = AuditLog::open_in_memory().unwrap();
//! let event = Event::new(
//!     "nightwatch-runtime::supervisor",
//!     SafetyEvent::VetoCleared {
//!         reason: "wind".into(),
//!         by: ClearedBy::Override {
//!             operator: "alice".into(),
//!             justification: "anemometer iced".into(),
//!         },
//!     },
//! );
//! log.record(&event).unwrap();
//!
//! let entries = log.recent(10).unwrap();
//! assert_eq!(entries[0].tag, "wind");
//! assert!(entries[0].detail.to_string().contains("anemometer iced"));
//! ```

use std::path::Path;

use chrono::{DateTime, Utc};
use nightwatch_types::{AuditCategory, Event, SafetyError, SafetyEvent};
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

// ─────────────────────────────────────────────────────────────────────────────
// Error type
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum AuditError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Corrupt audit row {seq}: {details}")]
    Corrupt { seq: i64, details: String },
}

impl From<AuditError> for SafetyError {
    fn from(err: AuditError) -> Self {
        SafetyError::Audit(err.to_string())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// AuditEntry
// ─────────────────────────────────────────────────────────────────────────────

/// One persisted audit row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Insertion order; `0` until the entry is stored.
    pub seq: i64,
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub source: String,
    pub category: AuditCategory,
    pub tag: String,
    pub summary: String,
    pub detail: serde_json::Value,
}

impl AuditEntry {
    /// Build an entry for `event`, or `None` when its payload is not audited.
    pub fn from_event(event: &Event) -> Result<Option<Self>, AuditError> {
        let Some(category) = event.payload.audit_category() else {
            return Ok(None);
        };
        Ok(Some(Self {
            seq: 0,
            id: event.id,
            timestamp: event.timestamp,
            source: event.source.clone(),
            category,
            tag: event.payload.tag(),
            summary: event.payload.to_string(),
            detail: serde_json::to_value(&event.payload)?,
        }))
    }

    /// Decode the stored payload.
    pub fn payload(&self) -> Result<SafetyEvent, AuditError> {
        Ok(serde_json::from_value(self.detail.clone())?)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// AuditLog
// ─────────────────────────────────────────────────────────────────────────────

/// SQLite-backed append-only audit log. Owned by the supervisor loop, which
/// is its only writer.
pub struct AuditLog {
    conn: Connection,
}

impl AuditLog {
    /// Open (or create) a persistent SQLite database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AuditError> {
        let conn = Connection::open(path)?;
        let log = Self { conn };
        log.init_schema()?;
        Ok(log)
    }

    /// Open a temporary in-memory database (useful for testing).
    pub fn open_in_memory() -> Result<Self, AuditError> {
        let conn = Connection::open_in_memory()?;
        let log = Self { conn };
        log.init_schema()?;
        Ok(log)
    }

    fn init_schema(&self) -> Result<(), AuditError> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS audit_log (
                seq       INTEGER PRIMARY KEY AUTOINCREMENT,
                id        TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                source    TEXT NOT NULL,
                category  TEXT NOT NULL,
                tag       TEXT NOT NULL,
                summary   TEXT NOT NULL,
                detail    TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS audit_log_tag ON audit_log (tag);
            CREATE TRIGGER IF NOT EXISTS audit_log_no_update
                BEFORE UPDATE ON audit_log
            BEGIN
                SELECT RAISE(ABORT, 'audit log is append-only');
            END;
            CREATE TRIGGER IF NOT EXISTS audit_log_no_delete
                BEFORE DELETE ON audit_log
            BEGIN
                SELECT RAISE(ABORT, 'audit log is append-only');
            END;",
        )?;
        Ok(())
    }

    /// Persist `event` if its payload is auditable. Returns the new row's
    /// sequence number.
    pub fn record(&self, event: &Event) -> Result<Option<i64>, AuditError> {
        match AuditEntry::from_event(event)? {
            Some(entry) => self.append(&entry).map(Some),
            None => Ok(None),
        }
    }

    /// Append a prepared entry. Its `seq` is ignored.
    pub fn append(&self, entry: &AuditEntry) -> Result<i64, AuditError> {
        self.conn.execute(
            "INSERT INTO audit_log (id, timestamp, source, category, tag, summary, detail)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                entry.id.to_string(),
                entry.timestamp.to_rfc3339(),
                entry.source,
                entry.category.as_str(),
                entry.tag,
                entry.summary,
                serde_json::to_string(&entry.detail)?,
            ],
        )?;
        let seq = self.conn.last_insert_rowid();
        debug!(seq, category = entry.category.as_str(), tag = %entry.tag, "audit entry written");
        Ok(seq)
    }

    /// The newest `limit` entries, oldest first.
    pub fn recent(&self, limit: usize) -> Result<Vec<AuditEntry>, AuditError> {
        let mut entries = self.query(
            "SELECT seq, id, timestamp, source, category, tag, summary, detail
             FROM audit_log ORDER BY seq DESC LIMIT ?1",
            params![limit as i64],
        )?;
        entries.reverse();
        Ok(entries)
    }

    /// Every entry carrying `tag`, oldest first.
    pub fn by_tag(&self, tag: &str) -> Result<Vec<AuditEntry>, AuditError> {
        self.query(
            "SELECT seq, id, timestamp, source, category, tag, summary, detail
             FROM audit_log WHERE tag = ?1 ORDER BY seq ASC",
            params![tag],
        )
    }

    /// Every entry in `category`, oldest first.
    pub fn by_category(&self, category: AuditCategory) -> Result<Vec<AuditEntry>, AuditError> {
        self.query(
            "SELECT seq, id, timestamp, source, category, tag, summary, detail
             FROM audit_log WHERE category = ?1 ORDER BY seq ASC",
            params![category.as_str()],
        )
    }

    pub fn len(&self) -> Result<usize, AuditError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM audit_log", [], |row| row.get(0))?;
        Ok(count.max(0) as usize)
    }

    pub fn is_empty(&self) -> Result<bool, AuditError> {
        Ok(self.len()? == 0)
    }

    fn query(&self, sql: &str, args: impl rusqlite::Params) -> Result<Vec<AuditEntry>, AuditError> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(args, |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, String>(7)?,
            ))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (seq, id, timestamp, source, category, tag, summary, detail) = row?;
            let corrupt = |details: String| AuditError::Corrupt { seq, details };
            entries.push(AuditEntry {
                seq,
                id: Uuid::parse_str(&id).map_err(|e| corrupt(e.to_string()))?,
                timestamp: timestamp
                    .parse::<DateTime<Utc>>()
                    .map_err(|e| corrupt(e.to_string()))?,
                source,
                category: AuditCategory::parse(&category)
                    .ok_or_else(|| corrupt(format!("unknown category '{category}'")))?,
                tag,
                summary,
                detail: serde_json::from_str(&detail)?,
            });
        }
        Ok(entries)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
