use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use safegate_core::{MultiFacePolicy, PipelineConfig};
use serde::Deserialize;

/// Which D-Bus bus the daemon registers on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    System,
    Session,
}

/// Daemon configuration.
///
/// Sources, lowest precedence first: built-in defaults, the TOML file named
/// by `SAFEGATE_CONFIG`, then `SAFEGATE_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Euclidean distance below which faces match.
    ///
    /// SFace encodings are L2-normalized, so distances fall in [0, 2] and the
    /// model's own operating point sits near 1.128. The 0.5 default is strict
    /// for these vectors and should be calibrated against enrolled staff
    /// before deployment.
    pub match_threshold: f64,
    /// Unlock window reported on a grant.
    pub unlock_duration_ms: u64,
    /// Longest the pipeline waits for the encoder engine.
    pub encoder_timeout: Duration,
    pub multi_face_policy: MultiFacePolicy,
    /// Whether camera errors are written to the audit trail.
    pub audit_camera_errors: bool,
    pub bus: BusKind,
}

/// Optional overrides read from the TOML file.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub model_dir: Option<PathBuf>,
    pub db_path: Option<PathBuf>,
    pub match_threshold: Option<f64>,
    pub unlock_duration_ms: Option<u64>,
    pub encoder_timeout_ms: Option<u64>,
    pub multi_face_policy: Option<MultiFacePolicy>,
    pub audit_camera_errors: Option<bool>,
    pub bus: Option<BusKind>,
}

impl FileConfig {
    pub fn read(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing config file {}", path.display()))
    }
}

impl Config {
    /// Load from `SAFEGATE_CONFIG` (if set) and the process environment.
    pub fn load() -> Result<Self> {
        let file = match std::env::var_os("SAFEGATE_CONFIG") {
            Some(path) => FileConfig::read(Path::new(&path))?,
            None => FileConfig::default(),
        };
        Ok(Self::resolve(file, |key| std::env::var(key).ok()))
    }

    /// Merge file values and environment lookups over the defaults.
    ///
    /// Unparsable environment values fall back to the file value or default.
    pub fn resolve(file: FileConfig, env: impl Fn(&str) -> Option<String>) -> Self {
        let data_dir = env("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let home = env("HOME").unwrap_or_else(|| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("safegate");

        let defaults = PipelineConfig::default();

        Self {
            model_dir: env("SAFEGATE_MODEL_DIR")
                .map(PathBuf::from)
                .or(file.model_dir)
                .unwrap_or_else(safegate_core::default_model_dir),
            db_path: env("SAFEGATE_DB_PATH")
                .map(PathBuf::from)
                .or(file.db_path)
                .unwrap_or_else(|| data_dir.join("safegate.db")),
            match_threshold: env_parse(&env, "SAFEGATE_MATCH_THRESHOLD")
                .or(file.match_threshold)
                .unwrap_or(defaults.match_threshold),
            unlock_duration_ms: env_parse(&env, "SAFEGATE_UNLOCK_DURATION_MS")
                .or(file.unlock_duration_ms)
                .unwrap_or(defaults.unlock_duration_ms),
            encoder_timeout: Duration::from_millis(
                env_parse(&env, "SAFEGATE_ENCODER_TIMEOUT_MS")
                    .or(file.encoder_timeout_ms)
                    .unwrap_or(3000),
            ),
            multi_face_policy: env_parse(&env, "SAFEGATE_MULTI_FACE_POLICY")
                .or(file.multi_face_policy)
                .unwrap_or(defaults.multi_face_policy),
            audit_camera_errors: env("SAFEGATE_AUDIT_CAMERA_ERRORS")
                .map(|v| v.trim() != "0")
                .or(file.audit_camera_errors)
                .unwrap_or(defaults.audit_camera_errors),
            bus: match env("SAFEGATE_BUS").as_deref() {
                Some("session") => BusKind::Session,
                Some("system") => BusKind::System,
                _ => file.bus.unwrap_or(BusKind::System),
            },
        }
    }

    pub fn pipeline(&self) -> PipelineConfig {
        PipelineConfig {
            match_threshold: self.match_threshold,
            unlock_duration_ms: self.unlock_duration_ms,
            multi_face_policy: self.multi_face_policy,
            audit_camera_errors: self.audit_camera_errors,
            ..PipelineConfig::default()
        }
    }

    /// Path to the UltraFace detection model.
    pub fn detector_model_path(&self) -> String {
        self.model_dir
            .join("version-RFB-320.onnx")
            .to_string_lossy()
            .into_owned()
    }

    /// Path to the SFace recognition model.
    pub fn recognizer_model_path(&self) -> String {
        self.model_dir
            .join("face_recognition_sface_2021dec.onnx")
            .to_string_lossy()
            .into_owned()
    }
}

fn env_parse<T: FromStr>(env: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    env(key).and_then(|v| v.trim().parse().ok())
}
