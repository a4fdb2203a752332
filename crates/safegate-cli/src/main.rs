use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Duration, Utc};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};

#[zbus::proxy(
    interface = "org.safegate.Gate1",
    default_service = "org.safegate.Gate1",
    default_path = "/org/safegate/Gate1"
)]
trait Gate {
    async fn verify(&self, qr_token: &str, image_base64: &str, captured_at: &str) -> zbus::Result<String>;
    async fn enroll(&self, credentials_json: &str) -> zbus::Result<String>;
    async fn update(&self, updates_json: &str) -> zbus::Result<String>;
    async fn remove(&self, request_json: &str) -> zbus::Result<u32>;
    async fn attempts(&self, since: &str) -> zbus::Result<String>;
    async fn prune_attempts(&self, cutoff: &str, confirm: bool) -> zbus::Result<u64>;
    async fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "safegate", about = "SafeGate access control CLI")]
struct Cli {
    /// Talk to a daemon on the session bus instead of the system bus
    #[arg(long, global = true)]
    session: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a QR token and face image against the gate
    Verify {
        /// Token read from the QR code
        token: String,
        /// Captured face image (JPEG or PNG)
        image: PathBuf,
        /// Capture time, RFC 3339 (default: now)
        #[arg(long)]
        at: Option<DateTime<Utc>>,
    },
    /// Enroll a new credential
    Enroll {
        #[arg(short, long)]
        name: String,
        /// Last instant the QR token is accepted, RFC 3339
        #[arg(long)]
        valid_until: DateTime<Utc>,
        /// QR token (default: generated)
        #[arg(long)]
        token: Option<String>,
        /// Reference photo containing exactly one face
        #[arg(long)]
        photo: Option<PathBuf>,
    },
    /// Change an enrolled credential
    Update {
        id: i64,
        #[arg(short, long)]
        name: Option<String>,
        #[arg(long)]
        token: Option<String>,
        #[arg(long)]
        valid_until: Option<DateTime<Utc>>,
        /// New reference photo; replaces the stored encoding
        #[arg(long)]
        photo: Option<PathBuf>,
    },
    /// Remove credentials by id or token
    Remove {
        #[arg(long = "id")]
        ids: Vec<i64>,
        #[arg(long = "token")]
        tokens: Vec<String>,
    },
    /// Show access attempts
    Logs {
        /// Earliest attempt to show, RFC 3339 (default: 24 hours ago)
        #[arg(long)]
        since: Option<DateTime<Utc>>,
    },
    /// Delete access attempts recorded before a cutoff
    Prune {
        /// RFC 3339 cutoff
        #[arg(long)]
        before: DateTime<Utc>,
        /// Actually delete
        #[arg(long)]
        yes: bool,
    },
    /// Show daemon status
    Status,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let conn = if cli.session {
        zbus::Connection::session().await
    } else {
        zbus::Connection::system().await
    }
    .context("connecting to D-Bus")?;
    tracing::debug!(session = cli.session, "connected to D-Bus");
    let gate = GateProxy::new(&conn)
        .await
        .context("safegated is not reachable")?;

    match cli.command {
        Commands::Verify { token, image, at } => {
            let image = read_base64(&image)?;
            let at = at.map(|t| t.to_rfc3339()).unwrap_or_default();
            let decision: Value = serde_json::from_str(&gate.verify(&token, &image, &at).await?)?;
            println!("{}", serde_json::to_string_pretty(&decision)?);
            if decision["access_granted"] != true {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Enroll {
            name,
            valid_until,
            token,
            photo,
        } => {
            let photo = photo.as_deref().map(read_base64).transpose()?;
            let request = json!([{
                "full_name": name,
                "qr_token": token,
                "qr_valid_until": valid_until,
                "reference_photo_base64": photo,
            }]);
            let report: Value = serde_json::from_str(&gate.enroll(&request.to_string()).await?)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if report["added_count"] == 0 {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Update {
            id,
            name,
            token,
            valid_until,
            photo,
        } => {
            let photo = photo.as_deref().map(read_base64).transpose()?;
            let request = json!([{
                "id": id,
                "full_name": name,
                "qr_token": token,
                "qr_valid_until": valid_until,
                "reference_photo_base64": photo,
            }]);
            let report: Value = serde_json::from_str(&gate.update(&request.to_string()).await?)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if report["modified_count"] == 0 {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Remove { ids, tokens } => {
            if ids.is_empty() && tokens.is_empty() {
                anyhow::bail!("nothing to remove: pass --id or --token");
            }
            let request = json!({ "ids": ids, "tokens": tokens });
            let removed = gate.remove(&request.to_string()).await?;
            println!("Removed {removed} credential(s)");
        }
        Commands::Logs { since } => {
            let since = since.unwrap_or_else(|| Utc::now() - Duration::hours(24));
            let records: Vec<Value> = serde_json::from_str(&gate.attempts(&since.to_rfc3339()).await?)?;
            if records.is_empty() {
                println!("No attempts since {since}");
            }
            for record in &records {
                println!(
                    "{}  {:<18} employee={:<6} confidence={}",
                    record["timestamp"].as_str().unwrap_or("?"),
                    record["status"].as_str().unwrap_or("?"),
                    record["employee_id"]
                        .as_i64()
                        .map(|id| id.to_string())
                        .unwrap_or_else(|| "-".into()),
                    record["confidence"],
                );
            }
        }
        Commands::Prune { before, yes } => {
            if !yes {
                anyhow::bail!("refusing to prune without --yes");
            }
            let removed = gate.prune_attempts(&before.to_rfc3339(), true).await?;
            println!("Pruned {removed} attempt(s) recorded before {before}");
        }
        Commands::Status => {
            let status: Value = serde_json::from_str(&gate.status().await?)?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn read_base64(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    Ok(general_purpose::STANDARD.encode(bytes))
}
