use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use safegate_core::admin::{AdminError, CredentialAdmin, CredentialUpdate, NewCredential};
use safegate_core::{AccessPipeline, ImagePayload};
use serde::Deserialize;
use zbus::{fdo, interface};

use crate::config::Config;
use crate::engine::EngineStats;

/// Payload of `Remove`: credentials to delete by id and/or token.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RemoveRequest {
    ids: Vec<i64>,
    tokens: Vec<String>,
}

/// D-Bus interface for the SafeGate access daemon.
///
/// Bus name: org.safegate.Gate1
/// Object path: /org/safegate/Gate1
pub struct GateService {
    pipeline: Arc<AccessPipeline>,
    admin: Arc<CredentialAdmin>,
    config: Arc<Config>,
    engine_stats: Arc<EngineStats>,
    started: Instant,
}

impl GateService {
    pub fn new(
        pipeline: Arc<AccessPipeline>,
        admin: Arc<CredentialAdmin>,
        config: Arc<Config>,
        engine_stats: Arc<EngineStats>,
    ) -> Self {
        Self {
            pipeline,
            admin,
            config,
            engine_stats,
            started: Instant::now(),
        }
    }
}

#[interface(name = "org.safegate.Gate1")]
impl GateService {
    /// Verify a QR token together with a face image.
    ///
    /// `captured_at` is RFC 3339; empty means now. Returns the decision JSON.
    async fn verify(&self, qr_token: &str, image_base64: &str, captured_at: &str) -> fdo::Result<String> {
        let captured_at = if captured_at.trim().is_empty() {
            Utc::now()
        } else {
            parse_timestamp(captured_at)?
        };
        tracing::debug!(captured_at = %captured_at, "verify requested");

        let pipeline = self.pipeline.clone();
        let qr_token = qr_token.to_owned();
        let payload = ImagePayload::Base64(image_base64.to_owned());
        let decision = blocking(move || pipeline.verify(&qr_token, payload, captured_at)).await?;

        decision
            .to_json()
            .map_err(|e| fdo::Error::Failed(format!("encoding decision: {e}")))
    }

    /// Enroll a JSON array of credentials. Returns the enrollment report.
    async fn enroll(&self, credentials_json: &str) -> fdo::Result<String> {
        let entries: Vec<NewCredential> = parse_json(credentials_json)?;
        tracing::info!(count = entries.len(), "enroll requested");

        let admin = self.admin.clone();
        let report = blocking(move || admin.enroll_bulk(&entries)).await?;
        to_json(&report)
    }

    /// Apply a JSON array of credential updates. Returns the update report.
    async fn update(&self, updates_json: &str) -> fdo::Result<String> {
        let updates: Vec<CredentialUpdate> = parse_json(updates_json)?;
        tracing::info!(count = updates.len(), "update requested");

        let admin = self.admin.clone();
        let report = blocking(move || admin.update_bulk(&updates)).await?;
        to_json(&report)
    }

    /// Remove credentials given `{"ids": [..], "tokens": [..]}`.
    async fn remove(&self, request_json: &str) -> fdo::Result<u32> {
        let request: RemoveRequest = parse_json(request_json)?;
        tracing::info!(ids = ?request.ids, tokens = request.tokens.len(), "remove requested");

        let admin = self.admin.clone();
        let removed = blocking(move || admin.remove(&request.ids, &request.tokens))
            .await?
            .map_err(admin_error)?;
        Ok(removed as u32)
    }

    /// Audit records at or after `since`, oldest first, as a JSON array.
    async fn attempts(&self, since: &str) -> fdo::Result<String> {
        let since = parse_timestamp(since)?;
        let admin = self.admin.clone();
        let records = blocking(move || admin.attempts_since(since))
            .await?
            .map_err(admin_error)?;
        to_json(&records)
    }

    /// Delete audit records older than `cutoff`. Requires `confirm`.
    async fn prune_attempts(&self, cutoff: &str, confirm: bool) -> fdo::Result<u64> {
        let cutoff = parse_timestamp(cutoff)?;
        let admin = self.admin.clone();
        let removed = blocking(move || admin.prune_attempts(cutoff, confirm))
            .await?
            .map_err(admin_error)?;
        Ok(removed as u64)
    }

    /// Return daemon status information.
    async fn status(&self) -> fdo::Result<String> {
        let pipeline = self.pipeline.config();
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "uptime_secs": self.started.elapsed().as_secs(),
            "db_path": self.config.db_path,
            "model_dir": self.config.model_dir,
            "match_threshold": pipeline.match_threshold,
            "unlock_duration_ms": pipeline.unlock_duration_ms,
            "multi_face_policy": format!("{:?}", pipeline.multi_face_policy),
            "audit_camera_errors": pipeline.audit_camera_errors,
            "encoder_timeout_ms": self.config.encoder_timeout.as_millis() as u64,
            "frames_processed": self.engine_stats.processed.load(Ordering::Relaxed),
            "frames_expired": self.engine_stats.expired.load(Ordering::Relaxed),
        })
        .to_string())
    }
}

/// Run blocking pipeline or store work off the async executor.
async fn blocking<T, F>(f: F) -> fdo::Result<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| fdo::Error::Failed(format!("worker task failed: {e}")))
}

fn parse_timestamp(text: &str) -> fdo::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text.trim())
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| fdo::Error::InvalidArgs(format!("invalid RFC 3339 timestamp {text:?}: {e}")))
}

fn parse_json<T: serde::de::DeserializeOwned>(text: &str) -> fdo::Result<T> {
    serde_json::from_str(text).map_err(|e| fdo::Error::InvalidArgs(format!("invalid JSON: {e}")))
}

fn to_json<T: serde::Serialize>(value: &T) -> fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| fdo::Error::Failed(format!("encoding response: {e}")))
}

fn admin_error(err: AdminError) -> fdo::Error {
    match err {
        AdminError::PruneNotConfirmed => fdo::Error::InvalidArgs(err.to_string()),
        other => {
            tracing::error!(error = %other, "admin operation failed");
            fdo::Error::Failed(other.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FileConfig;
    use chrono::TimeZone;
    use image::RgbImage;
    use safegate_core::encoder::{EncoderError, FaceAnalysis, FaceAnalyzer};
    use safegate_core::{FaceEncoding, PipelineConfig, SqliteStore, ENCODING_DIM};

    /// Every frame contains one face at a fixed encoding.
    struct OneFace;

    impl FaceAnalyzer for OneFace {
        fn analyze(&self, _image: RgbImage) -> Result<FaceAnalysis, EncoderError> {
            Ok(FaceAnalysis::Single(FaceEncoding::new(vec![0.05; ENCODING_DIM])))
        }
    }

    fn photo_base64() -> String {
        use base64::{engine::general_purpose, Engine as _};
        use image::{DynamicImage, ImageFormat, Rgb};
        use std::io::Cursor;

        let img = RgbImage::from_pixel(16, 16, Rgb([90, 90, 90]));
        let mut bytes = Vec::new();
        DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        format!("data:image/png;base64,{}", general_purpose::STANDARD.encode(bytes))
    }

    fn service() -> GateService {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let analyzer: Arc<dyn FaceAnalyzer> = Arc::new(OneFace);
        let pipeline = Arc::new(AccessPipeline::new(
            store.clone(),
            store.clone(),
            analyzer.clone(),
            PipelineConfig::default(),
        ));
        let admin = Arc::new(CredentialAdmin::new(store, analyzer));
        let config = Arc::new(Config::resolve(FileConfig::default(), |_| None));
        GateService::new(pipeline, admin, config, Arc::new(EngineStats::default()))
    }

    #[test]
    fn test_parse_timestamp() {
        let parsed = parse_timestamp("2026-03-14T10:30:00+01:00").unwrap();
        assert_eq!(parsed, Utc.with_ymd_and_hms(2026, 3, 14, 9, 30, 0).unwrap());
        assert!(parse_timestamp("yesterday").is_err());
    }

    #[test]
    fn test_remove_request_defaults() {
        let request: RemoveRequest = parse_json(r#"{"tokens": ["abc"]}"#).unwrap();
        assert!(request.ids.is_empty());
        assert_eq!(request.tokens, vec!["abc".to_string()]);
    }

    #[tokio::test]
    async fn test_enroll_then_verify() {
        let service = service();
        let enroll = format!(
            r#"[{{"full_name": "Jan Kowalski", "qr_token": "gate-token", "qr_valid_until": "2030-01-01T00:00:00Z", "reference_photo_base64": "{}"}}]"#,
            photo_base64()
        );
        let report: serde_json::Value = serde_json::from_str(&service.enroll(&enroll).await.unwrap()).unwrap();
        assert_eq!(report["added_count"], 1);

        let decision: serde_json::Value = serde_json::from_str(
            &service
                .verify("gate-token", &photo_base64(), "2026-03-14T09:30:00Z")
                .await
                .unwrap(),
        )
        .unwrap();
        assert_eq!(decision["access_granted"], true);
        assert_eq!(decision["message"], "Welcome, Jan Kowalski");
        assert_eq!(decision["door_unlock_duration_ms"], 5000);
        assert_eq!(decision["confidence_score"], 1.0);
    }

    #[tokio::test]
    async fn test_verify_bad_base64_is_camera_error() {
        let service = service();
        let enroll = r#"[{"full_name": "Anna Nowak", "qr_token": "t1", "qr_valid_until": "2030-01-01T00:00:00Z"}]"#;
        service.enroll(enroll).await.unwrap();
        let update = format!(r#"[{{"id": 1, "reference_photo_base64": "{}"}}]"#, photo_base64());
        service.update(&update).await.unwrap();

        let json = service.verify("t1", "!!!", "").await.unwrap();
        let decision: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(decision["access_granted"], false);
        assert_eq!(decision["error_code"], "CAMERA_ERROR");
    }

    #[tokio::test]
    async fn test_verify_rejects_bad_timestamp() {
        let service = service();
        let err = service.verify("t", "", "not-a-time").await.unwrap_err();
        assert!(matches!(err, fdo::Error::InvalidArgs(_)));
    }

    #[tokio::test]
    async fn test_prune_requires_confirm() {
        let service = service();
        let err = service
            .prune_attempts("2026-01-01T00:00:00Z", false)
            .await
            .unwrap_err();
        assert!(matches!(err, fdo::Error::InvalidArgs(_)));
        assert_eq!(service.prune_attempts("2026-01-01T00:00:00Z", true).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_remove_and_attempts() {
        let service = service();
        let enroll = r#"[
            {"full_name": "A", "qr_token": "a", "qr_valid_until": "2030-01-01T00:00:00Z"},
            {"full_name": "B", "qr_token": "b", "qr_valid_until": "2030-01-01T00:00:00Z"}
        ]"#;
        service.enroll(enroll).await.unwrap();
        service.verify("zzz", "", "2026-03-14T09:30:00Z").await.unwrap();

        assert_eq!(service.remove(r#"{"tokens": ["a", "b"]}"#).await.unwrap(), 2);

        let records: serde_json::Value =
            serde_json::from_str(&service.attempts("2026-03-14T00:00:00Z").await.unwrap()).unwrap();
        assert_eq!(records.as_array().unwrap().len(), 1);
        assert_eq!(records[0]["status"], "INVALID_QR");
    }

    #[tokio::test]
    async fn test_status_reports_config() {
        let status: serde_json::Value = serde_json::from_str(&service().status().await.unwrap()).unwrap();
        assert_eq!(status["match_threshold"], 0.5);
        assert_eq!(status["frames_processed"], 0);
    }
}
