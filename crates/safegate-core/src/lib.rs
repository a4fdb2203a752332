//! safegate-core: two-factor physical access decisions.
//!
//! Combines a possession factor (QR token) with a biometric factor (a live
//! face matched 1:1 against the token holder's reference encoding) into a
//! single fail-secure access decision.

pub mod admin;
pub mod decision;
pub mod detector;
pub mod encoder;
pub mod frame;
pub mod matcher;
pub mod pipeline;
pub mod recognizer;
pub mod recorder;
pub mod sqlite;
pub mod store;
pub mod types;

pub use decision::{Fault, ReasonCode, VerificationDecision};
pub use encoder::{BiometricEncoder, EncoderError, FaceAnalysis, FaceAnalyzer, OnnxFaceEncoder};
pub use frame::{CapturedFrame, FrameError, ImagePayload};
pub use matcher::{FaceMatcher, MatchError, MatchResult};
pub use pipeline::{AccessPipeline, MultiFacePolicy, PipelineConfig};
pub use recorder::{AttemptRecord, AttemptRecorder, AttemptStatus, StorageError};
pub use sqlite::SqliteStore;
pub use store::{CredentialStore, StoreError};
pub use types::{BoundingBox, Credential, FaceEncoding, ENCODING_DIM};

/// Default directory for the detection and encoding ONNX models.
pub fn default_model_dir() -> std::path::PathBuf {
    std::path::PathBuf::from("/usr/share/safegate/models")
}
