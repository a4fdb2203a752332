//! Access decision taxonomy and the immutable decision returned to callers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable denial codes. Absence of a code means access was granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReasonCode {
    InvalidQr,
    ExpiredQr,
    CameraError,
    NoFace,
    MultipleFaces,
    FaceMismatch,
}

impl ReasonCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidQr => "INVALID_QR",
            Self::ExpiredQr => "EXPIRED_QR",
            Self::CameraError => "CAMERA_ERROR",
            Self::NoFace => "NO_FACE",
            Self::MultipleFaces => "MULTIPLE_FACES",
            Self::FaceMismatch => "FACE_MISMATCH",
        }
    }

    /// Message shown at the gate for this denial.
    pub fn message(&self) -> &'static str {
        match self {
            Self::InvalidQr => "Invalid or inactive QR code.",
            Self::ExpiredQr => "Pass has expired.",
            Self::CameraError => "Video data error.",
            Self::NoFace => "No face detected. Look at the camera.",
            Self::MultipleFaces => "More than one face detected. Step up alone.",
            Self::FaceMismatch => "Biometric verification failed.",
        }
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Infrastructure or data-integrity problems hit while deciding.
///
/// Never part of the wire decision; surfaced to operators through logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Fault {
    StoreUnavailable,
    CorruptCredential,
    AuditWriteFailed,
    MalformedReference,
    EncoderTimeout,
    EncoderFailure,
}

impl Fault {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StoreUnavailable => "store_unavailable",
            Self::CorruptCredential => "corrupt_credential",
            Self::AuditWriteFailed => "audit_write_failed",
            Self::MalformedReference => "malformed_reference",
            Self::EncoderTimeout => "encoder_timeout",
            Self::EncoderFailure => "encoder_failure",
        }
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The sole output of the access pipeline.
///
/// Constructors are crate-private: a granted decision can only come out of
/// the pipeline's match branch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VerificationDecision {
    #[serde(rename = "access_granted")]
    granted: bool,
    message: String,
    #[serde(rename = "confidence_score", skip_serializing_if = "Option::is_none")]
    confidence: Option<f64>,
    #[serde(rename = "door_unlock_duration_ms", skip_serializing_if = "Option::is_none")]
    unlock_duration_ms: Option<u64>,
    #[serde(rename = "error_code", skip_serializing_if = "Option::is_none")]
    reason: Option<ReasonCode>,
    #[serde(skip)]
    faults: Vec<Fault>,
}

impl VerificationDecision {
    pub(crate) fn granted(full_name: &str, confidence: f64, unlock_duration_ms: u64) -> Self {
        Self {
            granted: true,
            message: format!("Welcome, {full_name}"),
            confidence: Some(confidence),
            unlock_duration_ms: Some(unlock_duration_ms),
            reason: None,
            faults: Vec::new(),
        }
    }

    pub(crate) fn denied(reason: ReasonCode) -> Self {
        Self {
            granted: false,
            message: reason.message().to_string(),
            confidence: None,
            unlock_duration_ms: None,
            reason: Some(reason),
            faults: Vec::new(),
        }
    }

    pub(crate) fn mismatch(confidence: f64) -> Self {
        Self {
            confidence: Some(confidence),
            ..Self::denied(ReasonCode::FaceMismatch)
        }
    }

    pub(crate) fn with_fault(mut self, fault: Fault) -> Self {
        if !self.faults.contains(&fault) {
            self.faults.push(fault);
        }
        self
    }

    pub fn is_granted(&self) -> bool {
        self.granted
    }

    pub fn reason(&self) -> Option<ReasonCode> {
        self.reason
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn confidence(&self) -> Option<f64> {
        self.confidence
    }

    pub fn unlock_duration_ms(&self) -> Option<u64> {
        self.unlock_duration_ms
    }

    /// Operational faults observed while producing this decision.
    pub fn faults(&self) -> &[Fault] {
        &self.faults
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_granted_wire_shape() {
        let decision = VerificationDecision::granted("Jan Kowalski", 0.7, 5000);
        let value: serde_json::Value = serde_json::from_str(&decision.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "access_granted": true,
                "message": "Welcome, Jan Kowalski",
                "confidence_score": 0.7,
                "door_unlock_duration_ms": 5000,
            })
        );
    }

    #[test]
    fn test_denied_wire_shape_omits_optional_fields() {
        let decision = VerificationDecision::denied(ReasonCode::ExpiredQr)
            .with_fault(Fault::AuditWriteFailed);
        let value: serde_json::Value = serde_json::from_str(&decision.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "access_granted": false,
                "message": "Pass has expired.",
                "error_code": "EXPIRED_QR",
            })
        );
        assert_eq!(decision.faults(), &[Fault::AuditWriteFailed]);
    }

    #[test]
    fn test_mismatch_carries_confidence() {
        let decision = VerificationDecision::mismatch(0.4);
        assert!(!decision.is_granted());
        assert_eq!(decision.reason(), Some(ReasonCode::FaceMismatch));
        assert_eq!(decision.confidence(), Some(0.4));
        assert_eq!(decision.unlock_duration_ms(), None);
    }

    #[test]
    fn test_reason_codes_are_stable_strings() {
        for code in [
            ReasonCode::InvalidQr,
            ReasonCode::ExpiredQr,
            ReasonCode::CameraError,
            ReasonCode::NoFace,
            ReasonCode::MultipleFaces,
            ReasonCode::FaceMismatch,
        ] {
            assert_eq!(serde_json::to_value(code).unwrap(), json!(code.as_str()));
        }
    }

    #[test]
    fn test_duplicate_fault_recorded_once() {
        let decision = VerificationDecision::denied(ReasonCode::CameraError)
            .with_fault(Fault::EncoderTimeout)
            .with_fault(Fault::EncoderTimeout);
        assert_eq!(decision.faults().len(), 1);
    }
}
