use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use image::RgbImage;
use safegate_core::encoder::{self, BiometricEncoder, EncoderError, FaceAnalysis, FaceAnalyzer};

/// A frame waiting for the engine thread.
struct EngineRequest {
    image: RgbImage,
    /// The caller has given up after this instant.
    deadline: Instant,
    reply: mpsc::SyncSender<Result<FaceAnalysis, EncoderError>>,
}

/// Counters exposed through `Status()`.
#[derive(Debug, Default)]
pub struct EngineStats {
    pub processed: AtomicU64,
    pub expired: AtomicU64,
}

/// Clone-safe handle to the engine thread.
///
/// Every call blocks for at most `timeout`; requests the engine picks up
/// after their deadline are dropped unprocessed.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    timeout: Duration,
    stats: Arc<EngineStats>,
}

impl EngineHandle {
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn stats(&self) -> Arc<EngineStats> {
        self.stats.clone()
    }
}

impl FaceAnalyzer for EngineHandle {
    fn analyze(&self, image: RgbImage) -> Result<FaceAnalysis, EncoderError> {
        let deadline = Instant::now() + self.timeout;
        let (reply_tx, reply_rx) = mpsc::sync_channel(1);
        self.tx
            .send(EngineRequest {
                image,
                deadline,
                reply: reply_tx,
            })
            .map_err(|_| EncoderError::Unavailable("engine thread exited".into()))?;

        match reply_rx.recv_timeout(self.timeout) {
            Ok(result) => result,
            Err(mpsc::RecvTimeoutError::Timeout) => Err(EncoderError::Timeout(self.timeout)),
            // The engine drops the reply sender when it skips an expired request.
            Err(mpsc::RecvTimeoutError::Disconnected) if Instant::now() >= deadline => {
                Err(EncoderError::Timeout(self.timeout))
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                Err(EncoderError::Unavailable("engine thread exited".into()))
            }
        }
    }
}

/// Spawn the engine on a dedicated OS thread that owns `encoder`.
///
/// Requests are served one at a time in arrival order. The thread exits once
/// every handle is dropped.
pub fn spawn_engine(mut encoder: Box<dyn BiometricEncoder + Send>, timeout: Duration) -> EngineHandle {
    let (tx, rx) = mpsc::channel::<EngineRequest>();
    let stats = Arc::new(EngineStats::default());
    let thread_stats = stats.clone();

    std::thread::Builder::new()
        .name("safegate-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Ok(req) = rx.recv() {
                if Instant::now() >= req.deadline {
                    thread_stats.expired.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!("dropping frame whose caller already timed out");
                    continue;
                }
                let started = Instant::now();
                let result = encoder::analyze(encoder.as_mut(), &req.image);
                thread_stats.processed.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    faces = result.as_ref().map(FaceAnalysis::face_count).ok(),
                    "frame analyzed"
                );
                let _ = req.reply.send(result);
            }
            tracing::info!("engine thread exiting");
        })
        .expect("failed to spawn engine thread");

    EngineHandle { tx, timeout, stats }
}
