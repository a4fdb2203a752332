//! SQLite-backed credential store and attempt recorder.
//!
//! One connection behind a mutex, WAL journal. Encodings are stored as
//! little-endian `f64` blobs of exactly `ENCODING_DIM` values. Credential
//! expiry is kept in Unix nanoseconds so the strict expiry comparison sees
//! the same instant that was enrolled; attempt and bookkeeping timestamps are
//! Unix milliseconds. Lookups always read the current row, so reference
//! updates are visible to the next call.

use crate::recorder::{AttemptRecord, AttemptRecorder, AttemptStatus, StorageError};
use crate::store::{CredentialStore, StoreError};
use crate::types::{Credential, FaceEncoding, ENCODING_DIM};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS credentials (
    id                 INTEGER PRIMARY KEY AUTOINCREMENT,
    full_name          TEXT    NOT NULL,
    qr_token           TEXT    NOT NULL UNIQUE,
    qr_valid_until     INTEGER NOT NULL,
    reference_encoding BLOB,
    updated_at         INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS attempts (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    status      TEXT    NOT NULL,
    employee_id INTEGER,
    confidence  REAL    NOT NULL,
    recorded_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS attempts_recorded_at ON attempts (recorded_at);
";

/// Fields written when a credential is created.
#[derive(Debug, Clone)]
pub struct NewCredentialRow {
    pub full_name: String,
    pub qr_token: String,
    pub qr_valid_until: DateTime<Utc>,
    pub reference_encoding: Option<FaceEncoding>,
}

/// Partial update; `None` leaves a column untouched.
#[derive(Debug, Clone, Default)]
pub struct CredentialChanges {
    pub full_name: Option<String>,
    pub qr_token: Option<String>,
    pub qr_valid_until: Option<DateTime<Utc>>,
    pub reference_encoding: Option<FaceEncoding>,
}

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Unavailable("connection lock poisoned".into()))
    }

    pub fn insert_credential(&self, row: &NewCredentialRow) -> Result<i64, StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO credentials (full_name, qr_token, qr_valid_until, reference_encoding, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                row.full_name,
                row.qr_token,
                to_nanos(row.qr_valid_until)?,
                row.reference_encoding.as_ref().map(encoding_to_blob),
                Utc::now().timestamp_millis(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Apply `changes` to credential `id` in one statement.
    pub fn update_credential(&self, id: i64, changes: &CredentialChanges) -> Result<(), StoreError> {
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE credentials SET
                full_name          = COALESCE(?2, full_name),
                qr_token           = COALESCE(?3, qr_token),
                qr_valid_until     = COALESCE(?4, qr_valid_until),
                reference_encoding = COALESCE(?5, reference_encoding),
                updated_at         = ?6
             WHERE id = ?1",
            params![
                id,
                changes.full_name,
                changes.qr_token,
                changes.qr_valid_until.map(to_nanos).transpose()?,
                changes.reference_encoding.as_ref().map(encoding_to_blob),
                Utc::now().timestamp_millis(),
            ],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    /// Delete credentials by id or token. Returns the number of rows removed.
    pub fn delete_credentials(&self, ids: &[i64], tokens: &[String]) -> Result<usize, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut removed = 0;
        for id in ids {
            removed += tx.execute("DELETE FROM credentials WHERE id = ?1", params![id])?;
        }
        for token in tokens {
            removed += tx.execute("DELETE FROM credentials WHERE qr_token = ?1", params![token])?;
        }
        tx.commit()?;
        Ok(removed)
    }

    /// Attempts recorded at or after `since`, oldest first.
    pub fn attempts_since(&self, since: DateTime<Utc>) -> Result<Vec<AttemptRecord>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT status, employee_id, confidence, recorded_at
             FROM attempts WHERE recorded_at >= ?1 ORDER BY recorded_at, id",
        )?;
        let rows = stmt.query_map(params![since.timestamp_millis()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<i64>>(1)?,
                row.get::<_, f64>(2)?,
                row.get::<_, i64>(3)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (status, employee_id, confidence, recorded_at) = row?;
            let status = status.parse::<AttemptStatus>().map_err(StoreError::CorruptRow)?;
            records.push(AttemptRecord {
                status,
                employee_id,
                confidence,
                timestamp: from_millis(recorded_at)?,
            });
        }
        Ok(records)
    }

    /// Delete attempts recorded strictly before `cutoff`.
    pub fn prune_attempts(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let conn = self.conn()?;
        let removed = conn.execute(
            "DELETE FROM attempts WHERE recorded_at < ?1",
            params![cutoff.timestamp_millis()],
        )?;
        Ok(removed)
    }
}

impl CredentialStore for SqliteStore {
    fn lookup(&self, qr_token: &str) -> Result<Option<Credential>, StoreError> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT id, full_name, qr_token, qr_valid_until, reference_encoding
                 FROM credentials WHERE qr_token = ?1",
                params![qr_token],
                raw_credential,
            )
            .optional()
            .map_err(column_error)?;
        row.map(RawCredential::into_credential).transpose()
    }
}

impl AttemptRecorder for SqliteStore {
    fn append(&self, record: &AttemptRecord) -> Result<(), StorageError> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| StorageError::Unavailable("connection lock poisoned".into()))?;
        conn.execute(
            "INSERT INTO attempts (status, employee_id, confidence, recorded_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                record.status.as_str(),
                record.employee_id,
                record.confidence,
                record.timestamp.timestamp_millis(),
            ],
        )?;
        Ok(())
    }
}

/// Credential row before blob and timestamp validation.
struct RawCredential {
    id: i64,
    full_name: String,
    qr_token: String,
    qr_valid_until: i64,
    reference_encoding: Option<Vec<u8>>,
}

fn raw_credential(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawCredential> {
    Ok(RawCredential {
        id: row.get(0)?,
        full_name: row.get(1)?,
        qr_token: row.get(2)?,
        qr_valid_until: row.get(3)?,
        reference_encoding: row.get(4)?,
    })
}

impl RawCredential {
    fn into_credential(self) -> Result<Credential, StoreError> {
        let reference_encoding = match self.reference_encoding {
            Some(blob) => Some(blob_to_encoding(&blob).ok_or(StoreError::MalformedEncoding {
                id: self.id,
                bytes: blob.len(),
            })?),
            None => None,
        };
        Ok(Credential {
            id: self.id,
            full_name: self.full_name,
            qr_token: self.qr_token,
            qr_valid_until: DateTime::from_timestamp_nanos(self.qr_valid_until),
            reference_encoding,
        })
    }
}

fn encoding_to_blob(encoding: &FaceEncoding) -> Vec<u8> {
    encoding.values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Decode a blob; `None` unless it holds exactly `ENCODING_DIM` values.
fn blob_to_encoding(blob: &[u8]) -> Option<FaceEncoding> {
    if blob.len() != ENCODING_DIM * 8 {
        return None;
    }
    let values = blob
        .chunks_exact(8)
        .map(|chunk| {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(chunk);
            f64::from_le_bytes(buf)
        })
        .collect();
    Some(FaceEncoding::new(values))
}

fn to_nanos(t: DateTime<Utc>) -> Result<i64, StoreError> {
    t.timestamp_nanos_opt().ok_or(StoreError::InvalidTimestamp(t.timestamp()))
}

/// Column values of the wrong SQLite type mean the row itself is corrupt.
fn column_error(err: rusqlite::Error) -> StoreError {
    match err {
        rusqlite::Error::InvalidColumnType(..)
        | rusqlite::Error::FromSqlConversionFailure(..)
        | rusqlite::Error::IntegralValueOutOfRange(..) => StoreError::CorruptRow(err.to_string()),
        other => StoreError::Database(other),
    }
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(ms).ok_or(StoreError::InvalidTimestamp(ms))
}
