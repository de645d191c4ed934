//! Health monitoring and metrics for pipeline

use std::sync::atomic::{AtomicU64, Ordering};

/// Health metrics for a pipeline
///
/// Counters shared between the controller and the pose sampling loop.
/// All fields use atomic operations for thread-safe access.
pub struct PipelineHealth {
    /// Sampling cycles that ran an estimate
    pub cycles_run: AtomicU64,

    /// Sampling cycles skipped because no frame was decodable yet
    pub cycles_skipped: AtomicU64,

    /// Failed pose estimates
    pub estimate_failures: AtomicU64,

    /// Poses drawn onto the overlay
    pub poses_rendered: AtomicU64,

    /// Recording chunks accepted into the buffer
    pub chunks_recorded: AtomicU64,

    /// Total bytes accepted into the recording buffer
    pub bytes_recorded: AtomicU64,

    /// Chunks of size zero dropped on arrival
    pub empty_chunks: AtomicU64,
}

impl PipelineHealth {
    /// Create a new health metrics instance
    pub fn new() -> Self {
        Self {
            cycles_run: AtomicU64::new(0),
            cycles_skipped: AtomicU64::new(0),
            estimate_failures: AtomicU64::new(0),
            poses_rendered: AtomicU64::new(0),
            chunks_recorded: AtomicU64::new(0),
            bytes_recorded: AtomicU64::new(0),
            empty_chunks: AtomicU64::new(0),
        }
    }

    pub fn record_cycle(&self) {
        self.cycles_run.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_skipped_cycle(&self) {
        self.cycles_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_estimate_failure(&self) {
        self.estimate_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a pose drawn onto the overlay
    pub fn record_pose(&self) {
        self.poses_rendered.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a recording chunk; empty ones are only counted as such
    pub fn record_chunk(&self, size: usize) {
        if size == 0 {
            self.empty_chunks.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.chunks_recorded.fetch_add(1, Ordering::Relaxed);
        self.bytes_recorded.fetch_add(size as u64, Ordering::Relaxed);
    }

    pub fn cycles_run(&self) -> u64 {
        self.cycles_run.load(Ordering::Relaxed)
    }

    pub fn cycles_skipped(&self) -> u64 {
        self.cycles_skipped.load(Ordering::Relaxed)
    }

    pub fn estimate_failures(&self) -> u64 {
        self.estimate_failures.load(Ordering::Relaxed)
    }

    pub fn poses_rendered(&self) -> u64 {
        self.poses_rendered.load(Ordering::Relaxed)
    }

    pub fn chunks_recorded(&self) -> u64 {
        self.chunks_recorded.load(Ordering::Relaxed)
    }

    pub fn bytes_recorded(&self) -> u64 {
        self.bytes_recorded.load(Ordering::Relaxed)
    }

    pub fn empty_chunks(&self) -> u64 {
        self.empty_chunks.load(Ordering::Relaxed)
    }

    /// Share of sampling cycles whose estimate failed, as a percentage
    pub fn failure_rate(&self) -> f64 {
        let runs = self.cycles_run();
        if runs == 0 {
            return 0.0;
        }
        (self.estimate_failures() as f64 / runs as f64) * 100.0
    }

    /// Get a summary of health metrics
    pub fn summary(&self) -> HealthSummary {
        HealthSummary {
            cycles_run: self.cycles_run(),
            cycles_skipped: self.cycles_skipped(),
            estimate_failures: self.estimate_failures(),
            failure_rate: self.failure_rate(),
            poses_rendered: self.poses_rendered(),
            chunks_recorded: self.chunks_recorded(),
            bytes_recorded: self.bytes_recorded(),
        }
    }
}

impl Default for PipelineHealth {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of health metrics
#[derive(Debug, Clone)]
pub struct HealthSummary {
    pub cycles_run: u64,
    pub cycles_skipped: u64,
    pub estimate_failures: u64,
    pub failure_rate: f64,
    pub poses_rendered: u64,
    pub chunks_recorded: u64,
    pub bytes_recorded: u64,
}

impl std::fmt::Display for HealthSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Health: {} pose cycles ({} skipped, {} failures, {:.2}%), {} poses drawn, {} chunks / {} bytes recorded",
            self.cycles_run,
            self.cycles_skipped,
            self.estimate_failures,
            self.failure_rate,
            self.poses_rendered,
            self.chunks_recorded,
            self.bytes_recorded
        )
    }
}
