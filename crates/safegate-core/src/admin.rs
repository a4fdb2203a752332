//! Credential administration: enrollment, updates, removal, audit queries.
//!
//! Reference photos are turned into encodings here; a photo is accepted only
//! when exactly one face is found in it.

use crate::encoder::{EncoderError, FaceAnalysis, FaceAnalyzer};
use crate::frame::{CapturedFrame, FrameError};
use crate::matcher::{FaceMatcher, MatchError};
use crate::recorder::AttemptRecord;
use crate::sqlite::{CredentialChanges, NewCredentialRow, SqliteStore};
use crate::store::StoreError;
use crate::types::FaceEncoding;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AdminError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("reference photo error: {0}")]
    Photo(#[from] FrameError),
    #[error("encoder error: {0}")]
    Encoder(#[from] EncoderError),
    #[error("reference encoding rejected: {0}")]
    Encoding(#[from] MatchError),
    #[error("no face found in reference photo")]
    NoFace,
    #[error("reference photo contains {0} faces; exactly one is required")]
    MultipleFaces(usize),
    #[error("prune requires explicit confirmation")]
    PruneNotConfirmed,
}

/// A credential to enroll.
#[derive(Debug, Clone, Deserialize)]
pub struct NewCredential {
    pub full_name: String,
    /// Generated (UUID v4) when absent.
    pub qr_token: Option<String>,
    pub qr_valid_until: DateTime<Utc>,
    pub reference_photo_base64: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CredentialUpdate {
    pub id: i64,
    pub full_name: Option<String>,
    pub qr_token: Option<String>,
    pub qr_valid_until: Option<DateTime<Utc>>,
    /// A new photo always replaces the stored reference encoding. Blank
    /// strings in any field leave that field unchanged.
    pub reference_photo_base64: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EnrolledCredential {
    pub id: i64,
    pub qr_token: String,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct EnrollReport {
    pub added_count: usize,
    pub added: Vec<EnrolledCredential>,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct UpdateReport {
    pub modified_count: usize,
    pub errors: Vec<String>,
}

pub struct CredentialAdmin {
    store: Arc<SqliteStore>,
    analyzer: Arc<dyn FaceAnalyzer>,
}

impl CredentialAdmin {
    pub fn new(store: Arc<SqliteStore>, analyzer: Arc<dyn FaceAnalyzer>) -> Self {
        Self { store, analyzer }
    }

    pub fn enroll(&self, new: &NewCredential) -> Result<EnrolledCredential, AdminError> {
        let reference_encoding = non_blank(&new.reference_photo_base64)
            .map(|photo| self.encode_reference(photo))
            .transpose()?;

        let qr_token = match non_blank(&new.qr_token) {
            Some(token) => token.to_string(),
            None => uuid::Uuid::new_v4().to_string(),
        };

        let id = self.store.insert_credential(&NewCredentialRow {
            full_name: new.full_name.clone(),
            qr_token: qr_token.clone(),
            qr_valid_until: new.qr_valid_until,
            reference_encoding,
        })?;

        tracing::info!(id, full_name = %new.full_name, "credential enrolled");
        Ok(EnrolledCredential { id, qr_token })
    }

    /// Enroll every entry; failures are reported per entry and skipped.
    pub fn enroll_bulk(&self, entries: &[NewCredential]) -> EnrollReport {
        let mut report = EnrollReport::default();
        for entry in entries {
            match self.enroll(entry) {
                Ok(enrolled) => report.added.push(enrolled),
                Err(err) => {
                    tracing::warn!(full_name = %entry.full_name, error = %err, "enrollment rejected");
                    report.errors.push(format!("{}: {err}", entry.full_name));
                }
            }
        }
        report.added_count = report.added.len();
        report
    }

    pub fn update(&self, update: &CredentialUpdate) -> Result<(), AdminError> {
        let reference_encoding = non_blank(&update.reference_photo_base64)
            .map(|photo| self.encode_reference(photo))
            .transpose()?;

        let changes = CredentialChanges {
            full_name: non_blank(&update.full_name).map(str::to_string),
            qr_token: non_blank(&update.qr_token).map(str::to_string),
            qr_valid_until: update.qr_valid_until,
            reference_encoding,
        };
        self.store.update_credential(update.id, &changes)?;

        tracing::info!(
            id = update.id,
            reference_replaced = changes.reference_encoding.is_some(),
            "credential updated"
        );
        Ok(())
    }

    pub fn update_bulk(&self, updates: &[CredentialUpdate]) -> UpdateReport {
        let mut report = UpdateReport::default();
        for update in updates {
            match self.update(update) {
                Ok(()) => report.modified_count += 1,
                Err(err) => {
                    tracing::warn!(id = update.id, error = %err, "update rejected");
                    report.errors.push(format!("credential {}: {err}", update.id));
                }
            }
        }
        report
    }

    pub fn remove(&self, ids: &[i64], tokens: &[String]) -> Result<usize, AdminError> {
        let removed = self.store.delete_credentials(ids, tokens)?;
        tracing::info!(removed, "credentials removed");
        Ok(removed)
    }

    pub fn attempts_since(&self, since: DateTime<Utc>) -> Result<Vec<AttemptRecord>, AdminError> {
        Ok(self.store.attempts_since(since)?)
    }

    /// Delete audit records older than `cutoff`. Refuses unless `confirm`.
    pub fn prune_attempts(&self, cutoff: DateTime<Utc>, confirm: bool) -> Result<usize, AdminError> {
        if !confirm {
            return Err(AdminError::PruneNotConfirmed);
        }
        let removed = self.store.prune_attempts(cutoff)?;
        tracing::info!(removed, cutoff = %cutoff, "audit records pruned");
        Ok(removed)
    }

    fn encode_reference(&self, photo_base64: &str) -> Result<FaceEncoding, AdminError> {
        let frame = CapturedFrame::from_base64(photo_base64)?;
        match self.analyzer.analyze(frame.into_image())? {
            FaceAnalysis::Single(encoding) => {
                FaceMatcher::validate(&encoding)?;
                Ok(encoding)
            }
            FaceAnalysis::NoFace => Err(AdminError::NoFace),
            multiple => Err(AdminError::MultipleFaces(multiple.face_count())),
        }
    }
}

/// `None` for absent and whitespace-only values.
fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.trim().is_empty())
}
