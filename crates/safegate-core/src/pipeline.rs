//! Access decision pipeline.
//!
//! Linear, fail-fast state machine: token resolution, image decode, face
//! analysis, 1:1 comparison. The first failing stage is terminal and every
//! terminal state other than a biometric match denies access.

use crate::decision::{Fault, ReasonCode, VerificationDecision};
use crate::encoder::{EncoderError, FaceAnalysis, FaceAnalyzer};
use crate::frame::{CapturedFrame, ImagePayload};
use crate::matcher::{FaceMatcher, DEFAULT_MATCH_THRESHOLD};
use crate::recorder::{AttemptRecord, AttemptRecorder, AttemptStatus};
use crate::store::{CredentialStore, StoreError};
use crate::types::FaceEncoding;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::str::FromStr;
use std::sync::Arc;

/// How long the door stays unlocked after a grant.
pub const DEFAULT_UNLOCK_DURATION_MS: u64 = 5000;
/// Append attempts per audit record before giving up.
pub const DEFAULT_AUDIT_ATTEMPTS: u32 = 3;

/// What to do when more than one face is in the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MultiFacePolicy {
    /// Deny with `MULTIPLE_FACES`.
    Reject,
    /// Compare the first (most confident) face only.
    FirstDetected,
}

impl FromStr for MultiFacePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reject" => Ok(Self::Reject),
            "first" | "first_detected" => Ok(Self::FirstDetected),
            other => Err(format!("unknown multi-face policy: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub match_threshold: f64,
    pub unlock_duration_ms: u64,
    pub multi_face_policy: MultiFacePolicy,
    /// Record undecodable frames in the audit trail.
    pub audit_camera_errors: bool,
    pub audit_attempts: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            match_threshold: DEFAULT_MATCH_THRESHOLD,
            unlock_duration_ms: DEFAULT_UNLOCK_DURATION_MS,
            multi_face_policy: MultiFacePolicy::Reject,
            audit_camera_errors: true,
            audit_attempts: DEFAULT_AUDIT_ATTEMPTS,
        }
    }
}

/// A terminal state before auditing.
struct Outcome {
    decision: VerificationDecision,
    status: AttemptStatus,
    employee_id: Option<i64>,
    confidence: f64,
    audited: bool,
}

impl Outcome {
    fn denied(reason: ReasonCode, employee_id: Option<i64>) -> Self {
        Self {
            decision: VerificationDecision::denied(reason),
            status: reason.into(),
            employee_id,
            confidence: 0.0,
            audited: true,
        }
    }

    fn fault(mut self, fault: Fault, status: AttemptStatus) -> Self {
        self.decision = self.decision.with_fault(fault);
        self.status = status;
        self
    }

    fn unaudited(mut self) -> Self {
        self.audited = false;
        self
    }
}

pub struct AccessPipeline {
    credentials: Arc<dyn CredentialStore>,
    recorder: Arc<dyn AttemptRecorder>,
    analyzer: Arc<dyn FaceAnalyzer>,
    matcher: FaceMatcher,
    config: PipelineConfig,
}

impl AccessPipeline {
    pub fn new(
        credentials: Arc<dyn CredentialStore>,
        recorder: Arc<dyn AttemptRecorder>,
        analyzer: Arc<dyn FaceAnalyzer>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            credentials,
            recorder,
            analyzer,
            matcher: FaceMatcher::new(config.match_threshold),
            config,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Decide whether the bearer of `qr_token` shown in `payload` may enter.
    ///
    /// Always returns a decision. The attempt is appended to the audit trail
    /// on every path except unaudited camera errors; an audit failure is
    /// reported as a fault and never changes the decision.
    pub fn verify(&self, qr_token: &str, payload: ImagePayload, captured_at: DateTime<Utc>) -> VerificationDecision {
        let outcome = self.evaluate(qr_token, &payload, captured_at);
        let mut decision = outcome.decision;

        if outcome.audited {
            let record = AttemptRecord {
                status: outcome.status,
                employee_id: outcome.employee_id,
                confidence: outcome.confidence,
                timestamp: captured_at,
            };
            if !self.record(&record) {
                decision = decision.with_fault(Fault::AuditWriteFailed);
            }
        }

        tracing::info!(
            granted = decision.is_granted(),
            reason = decision.reason().map(|r| r.as_str()).unwrap_or("NONE"),
            status = outcome.status.as_str(),
            employee_id = ?outcome.employee_id,
            confidence = ?decision.confidence(),
            "access decision"
        );

        decision
    }

    fn evaluate(&self, qr_token: &str, payload: &ImagePayload, captured_at: DateTime<Utc>) -> Outcome {
        // Stage 1: token resolution, before any image work.
        let credential = match self.credentials.lookup(qr_token) {
            Ok(Some(credential)) => credential,
            Ok(None) => return Outcome::denied(ReasonCode::InvalidQr, None),
            Err(StoreError::MalformedEncoding { id, bytes }) => {
                tracing::error!(
                    fault = Fault::MalformedReference.as_str(),
                    employee_id = id,
                    bytes,
                    "stored reference encoding is corrupt"
                );
                return Outcome::denied(ReasonCode::FaceMismatch, Some(id))
                    .fault(Fault::MalformedReference, AttemptStatus::ReferenceInvalid);
            }
            Err(err @ (StoreError::CorruptRow(_) | StoreError::InvalidTimestamp(_))) => {
                tracing::error!(
                    fault = Fault::CorruptCredential.as_str(),
                    error = %err,
                    "credential row is corrupt; denying"
                );
                return Outcome::denied(ReasonCode::InvalidQr, None)
                    .fault(Fault::CorruptCredential, AttemptStatus::CredentialInvalid);
            }
            Err(err) => {
                tracing::error!(
                    fault = Fault::StoreUnavailable.as_str(),
                    error = %err,
                    "credential lookup failed; denying"
                );
                return Outcome::denied(ReasonCode::InvalidQr, None)
                    .fault(Fault::StoreUnavailable, AttemptStatus::StoreUnavailable);
            }
        };
        let employee_id = Some(credential.id);

        if credential.is_expired_at(captured_at) {
            return Outcome::denied(ReasonCode::ExpiredQr, employee_id);
        }

        let reference = match self.reference_of(credential.id, credential.reference_encoding.as_ref()) {
            Some(reference) => reference,
            None => {
                return Outcome::denied(ReasonCode::FaceMismatch, employee_id)
                    .fault(Fault::MalformedReference, AttemptStatus::ReferenceInvalid)
            }
        };

        // Stage 2: decode.
        let frame = match CapturedFrame::decode(payload) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::warn!(error = %err, employee_id = credential.id, "captured frame rejected");
                return self.camera_error(employee_id);
            }
        };

        // Stage 3: face analysis.
        let analysis = match self.analyzer.analyze(frame.into_image()) {
            Ok(analysis) => analysis,
            Err(EncoderError::Timeout(limit)) => {
                tracing::error!(
                    fault = Fault::EncoderTimeout.as_str(),
                    timeout_ms = limit.as_millis() as u64,
                    "face encoder missed its deadline"
                );
                return self.camera_error(employee_id).fault(Fault::EncoderTimeout, AttemptStatus::CameraError);
            }
            Err(err) => {
                tracing::error!(fault = Fault::EncoderFailure.as_str(), error = %err, "face encoder failed");
                return self.camera_error(employee_id).fault(Fault::EncoderFailure, AttemptStatus::CameraError);
            }
        };

        let live = match analysis {
            FaceAnalysis::NoFace => return Outcome::denied(ReasonCode::NoFace, employee_id),
            FaceAnalysis::Single(encoding) => encoding,
            FaceAnalysis::Multiple(all) => match self.config.multi_face_policy {
                MultiFacePolicy::Reject => return Outcome::denied(ReasonCode::MultipleFaces, employee_id),
                MultiFacePolicy::FirstDetected => {
                    tracing::warn!(faces = all.len(), "multiple faces in frame; comparing the first");
                    match all.into_iter().next() {
                        Some(first) => first,
                        None => return Outcome::denied(ReasonCode::NoFace, employee_id),
                    }
                }
            },
        };

        // Stage 4: 1:1 comparison.
        let result = match self.matcher.verify(reference, &live) {
            Ok(result) => result,
            Err(err) => {
                tracing::error!(fault = Fault::EncoderFailure.as_str(), error = %err, "live encoding is malformed");
                return self.camera_error(employee_id).fault(Fault::EncoderFailure, AttemptStatus::CameraError);
            }
        };

        tracing::debug!(distance = result.distance, threshold = self.matcher.threshold(), "face compared");

        if result.matched {
            Outcome {
                decision: VerificationDecision::granted(
                    &credential.full_name,
                    result.confidence,
                    self.config.unlock_duration_ms,
                ),
                status: AttemptStatus::Success,
                employee_id,
                confidence: result.confidence,
                audited: true,
            }
        } else {
            Outcome {
                decision: VerificationDecision::mismatch(result.confidence),
                status: AttemptStatus::FaceMismatch,
                employee_id,
                confidence: result.confidence,
                audited: true,
            }
        }
    }

    /// The credential's reference encoding, if present and usable.
    fn reference_of<'a>(&self, id: i64, reference: Option<&'a FaceEncoding>) -> Option<&'a FaceEncoding> {
        let Some(reference) = reference else {
            tracing::error!(
                fault = Fault::MalformedReference.as_str(),
                employee_id = id,
                "credential has no reference encoding"
            );
            return None;
        };
        if let Err(err) = FaceMatcher::validate(reference) {
            tracing::error!(
                fault = Fault::MalformedReference.as_str(),
                employee_id = id,
                error = %err,
                "stored reference encoding is malformed"
            );
            return None;
        }
        Some(reference)
    }

    fn camera_error(&self, employee_id: Option<i64>) -> Outcome {
        let outcome = Outcome::denied(ReasonCode::CameraError, employee_id);
        if self.config.audit_camera_errors {
            outcome
        } else {
            outcome.unaudited()
        }
    }

    /// Append with bounded retries. Returns false once every attempt failed.
    fn record(&self, record: &AttemptRecord) -> bool {
        let attempts = self.config.audit_attempts.max(1);
        for attempt in 1..=attempts {
            match self.recorder.append(record) {
                Ok(()) => return true,
                Err(err) => tracing::warn!(attempt, error = %err, "audit append failed"),
            }
        }
        tracing::error!(
            fault = Fault::AuditWriteFailed.as_str(),
            status = record.status.as_str(),
            employee_id = ?record.employee_id,
            "attempt could not be recorded"
        );
        false
    }
}
