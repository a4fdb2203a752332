//! Audit trail: one append-only record per verification attempt.

use crate::decision::ReasonCode;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use thiserror::Error;

/// Status stored with each attempt.
///
/// Mirrors [`ReasonCode`] plus internal codes for infrastructure and
/// data-integrity faults that the caller only sees as a plain denial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttemptStatus {
    Success,
    InvalidQr,
    ExpiredQr,
    CameraError,
    NoFace,
    MultipleFaces,
    FaceMismatch,
    StoreUnavailable,
    CredentialInvalid,
    ReferenceInvalid,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::InvalidQr => "INVALID_QR",
            Self::ExpiredQr => "EXPIRED_QR",
            Self::CameraError => "CAMERA_ERROR",
            Self::NoFace => "NO_FACE",
            Self::MultipleFaces => "MULTIPLE_FACES",
            Self::FaceMismatch => "FACE_MISMATCH",
            Self::StoreUnavailable => "STORE_UNAVAILABLE",
            Self::CredentialInvalid => "CREDENTIAL_INVALID",
            Self::ReferenceInvalid => "REFERENCE_INVALID",
        }
    }
}

impl From<ReasonCode> for AttemptStatus {
    fn from(reason: ReasonCode) -> Self {
        match reason {
            ReasonCode::InvalidQr => Self::InvalidQr,
            ReasonCode::ExpiredQr => Self::ExpiredQr,
            ReasonCode::CameraError => Self::CameraError,
            ReasonCode::NoFace => Self::NoFace,
            ReasonCode::MultipleFaces => Self::MultipleFaces,
            ReasonCode::FaceMismatch => Self::FaceMismatch,
        }
    }
}

impl FromStr for AttemptStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "SUCCESS" => Self::Success,
            "INVALID_QR" => Self::InvalidQr,
            "EXPIRED_QR" => Self::ExpiredQr,
            "CAMERA_ERROR" => Self::CameraError,
            "NO_FACE" => Self::NoFace,
            "MULTIPLE_FACES" => Self::MultipleFaces,
            "FACE_MISMATCH" => Self::FaceMismatch,
            "STORE_UNAVAILABLE" => Self::StoreUnavailable,
            "CREDENTIAL_INVALID" => Self::CredentialInvalid,
            "REFERENCE_INVALID" => Self::ReferenceInvalid,
            other => return Err(format!("unknown attempt status: {other}")),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub status: AttemptStatus,
    /// `None` when the token did not resolve to a credential.
    pub employee_id: Option<i64>,
    pub confidence: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("audit storage unavailable: {0}")]
    Unavailable(String),
}

/// Durable, append-only sink for attempt records.
///
/// Delivery is at-least-once: callers may retry a failed append, so a
/// record can be stored twice but must never be silently dropped.
pub trait AttemptRecorder: Send + Sync {
    fn append(&self, record: &AttemptRecord) -> Result<(), StorageError>;
}

/// Recorder keeping attempts in memory.
#[derive(Default)]
pub struct InMemoryAttemptRecorder {
    records: Mutex<Vec<AttemptRecord>>,
    failures_left: AtomicUsize,
}

impl InMemoryAttemptRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` appends fail.
    pub fn fail_next(&self, count: usize) {
        self.failures_left.store(count, Ordering::SeqCst);
    }

    pub fn records(&self) -> Vec<AttemptRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

impl AttemptRecorder for InMemoryAttemptRecorder {
    fn append(&self, record: &AttemptRecord) -> Result<(), StorageError> {
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StorageError::Unavailable("injected append failure".into()));
        }
        self.records
            .lock()
            .map_err(|_| StorageError::Unavailable("record buffer lock poisoned".into()))?
            .push(record.clone());
        Ok(())
    }
}
