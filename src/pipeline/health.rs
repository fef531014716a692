//! Health monitoring and metrics for the sender pipeline

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::traits::PipelineEvent;

/// Health metrics for a running pipeline
///
/// Tracks counters and timestamps used to monitor pipeline health.
/// All fields use atomic operations for thread-safe access.
pub struct PipelineHealth {
    /// Number of frames dropped due to backpressure
    pub frame_drops: AtomicU64,

    /// Number of transport write errors
    pub network_errors: AtomicU64,

    /// Timestamp (as Unix microseconds) of the last successfully sent frame
    pub last_frame_time: AtomicU64,

    /// Number of frames successfully sent
    pub frames_processed: AtomicU64,

    /// Total bytes of data sent
    pub bytes_processed: AtomicU64,

    /// Number of keyframes sent
    pub keyframes_processed: AtomicU64,
}

impl PipelineHealth {
    /// Create a new health metrics instance
    pub fn new() -> Self {
        Self {
            frame_drops: AtomicU64::new(0),
            network_errors: AtomicU64::new(0),
            last_frame_time: AtomicU64::new(now_micros()),
            frames_processed: AtomicU64::new(0),
            bytes_processed: AtomicU64::new(0),
            keyframes_processed: AtomicU64::new(0),
        }
    }

    /// Record a dropped frame
    pub fn record_frame_drop(&self) {
        self.frame_drops.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a transport write error
    pub fn record_network_error(&self) {
        self.network_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a successfully sent frame
    pub fn record_frame(&self, size: usize, is_keyframe: bool) {
        self.last_frame_time.store(now_micros(), Ordering::Relaxed);
        self.frames_processed.fetch_add(1, Ordering::Relaxed);
        self.bytes_processed
            .fetch_add(size as u64, Ordering::Relaxed);
        if is_keyframe {
            self.keyframes_processed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Get the number of frame drops
    pub fn frame_drops(&self) -> u64 {
        self.frame_drops.load(Ordering::Relaxed)
    }

    /// Get the number of transport write errors
    pub fn network_errors(&self) -> u64 {
        self.network_errors.load(Ordering::Relaxed)
    }

    /// Get the number of frames sent
    pub fn frames_processed(&self) -> u64 {
        self.frames_processed.load(Ordering::Relaxed)
    }

    /// Get the total bytes sent
    pub fn bytes_processed(&self) -> u64 {
        self.bytes_processed.load(Ordering::Relaxed)
    }

    /// Get the number of keyframes sent
    pub fn keyframes_processed(&self) -> u64 {
        self.keyframes_processed.load(Ordering::Relaxed)
    }

    /// Calculate the frame drop rate as a percentage
    pub fn frame_drop_rate(&self) -> f64 {
        let drops = self.frame_drops();
        let processed = self.frames_processed();
        if processed == 0 {
            return 0.0;
        }
        (drops as f64 / processed as f64) * 100.0
    }

    /// Check if the pipeline has stalled (no frames for given duration)
    pub fn is_stalled(&self, threshold: Duration) -> bool {
        let last_frame = self.last_frame_time.load(Ordering::Relaxed);
        let elapsed_micros = now_micros().saturating_sub(last_frame);
        elapsed_micros > threshold.as_micros() as u64
    }

    /// Get a summary of health metrics
    pub fn summary(&self) -> HealthSummary {
        HealthSummary {
            frames_processed: self.frames_processed(),
            frame_drops: self.frame_drops(),
            network_errors: self.network_errors(),
            bytes_processed: self.bytes_processed(),
            keyframes_processed: self.keyframes_processed(),
            frame_drop_rate: self.frame_drop_rate(),
        }
    }
}

impl Default for PipelineHealth {
    fn default() -> Self {
        Self::new()
    }
}

fn now_micros() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Snapshot of health metrics
#[derive(Debug, Clone)]
pub struct HealthSummary {
    pub frames_processed: u64,
    pub frame_drops: u64,
    pub network_errors: u64,
    pub bytes_processed: u64,
    pub keyframes_processed: u64,
    pub frame_drop_rate: f64,
}

impl std::fmt::Display for HealthSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Health: {} frames ({} drops, {:.2}%), {} network errors, {} bytes, {} keyframes",
            self.frames_processed,
            self.frame_drops,
            self.frame_drop_rate,
            self.network_errors,
            self.bytes_processed,
            self.keyframes_processed
        )
    }
}

/// Watches pipeline health and raises a runtime failure when the pipeline
/// stalls, so the session manager can tear the cast down instead of hanging.
pub struct HealthMonitor {
    health: Arc<PipelineHealth>,
    event_tx: mpsc::Sender<PipelineEvent>,
    check_interval: Duration,
    stall_threshold: Duration,
}

impl HealthMonitor {
    pub fn new(health: Arc<PipelineHealth>, event_tx: mpsc::Sender<PipelineEvent>) -> Self {
        Self {
            health,
            event_tx,
            check_interval: Duration::from_secs(5),
            stall_threshold: Duration::from_secs(5),
        }
    }

    /// Configure the check interval
    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    /// Configure the stall threshold
    pub fn with_stall_threshold(mut self, threshold: Duration) -> Self {
        self.stall_threshold = threshold;
        self
    }

    /// Run the monitor until cancellation or until a stall is reported.
    pub async fn run(self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.check_interval);
        interval.tick().await; // the immediate first tick would always pass

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = interval.tick() => {
                    if self.health.is_stalled(self.stall_threshold) {
                        let _ = self
                            .event_tx
                            .send(PipelineEvent::RuntimeFailure(format!(
                                "pipeline stalled for {:?}",
                                self.stall_threshold
                            )))
                            .await;
                        return;
                    }
                }
            }
        }
    }
}
