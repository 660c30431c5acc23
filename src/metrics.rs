//! Metrics and observability for accelerator sessions

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Session-wide counters
#[derive(Default)]
pub struct Metrics {
    pub total_dispatches: AtomicU64,
    pub successful_dispatches: AtomicU64,
    pub failed_dispatches: AtomicU64,
    pub total_latency_ms: AtomicU64,

    // Per-operation counters
    pub image_kernel_count: AtomicU64,
    pub audio_kernel_count: AtomicU64,
    pub fft_count: AtomicU64,

    // Host/device transfers
    pub push_count: AtomicU64,
    pub pull_count: AtomicU64,
    pub bytes_pushed: AtomicU64,
    pub bytes_pulled: AtomicU64,
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record_dispatch(&self, op: &str, success: bool, latency_ms: u64) {
        self.total_dispatches.fetch_add(1, Ordering::Relaxed);

        if success {
            self.successful_dispatches.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_dispatches.fetch_add(1, Ordering::Relaxed);
        }

        self.total_latency_ms.fetch_add(latency_ms, Ordering::Relaxed);

        match op {
            "image.kernel" => self.image_kernel_count.fetch_add(1, Ordering::Relaxed),
            "audio.kernel" => self.audio_kernel_count.fetch_add(1, Ordering::Relaxed),
            "audio.fft" => self.fft_count.fetch_add(1, Ordering::Relaxed),
            _ => 0,
        };
    }

    pub fn record_push(&self, bytes: u64) {
        self.push_count.fetch_add(1, Ordering::Relaxed);
        self.bytes_pushed.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_pull(&self, bytes: u64) {
        self.pull_count.fetch_add(1, Ordering::Relaxed);
        self.bytes_pulled.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let total = self.total_dispatches.load(Ordering::Relaxed);
        let successful = self.successful_dispatches.load(Ordering::Relaxed);
        let failed = self.failed_dispatches.load(Ordering::Relaxed);
        let total_latency = self.total_latency_ms.load(Ordering::Relaxed);

        MetricsSnapshot {
            total_dispatches: total,
            successful_dispatches: successful,
            failed_dispatches: failed,
            error_rate: if total > 0 { failed as f64 / total as f64 } else { 0.0 },
            avg_latency_ms: if total > 0 { total_latency / total } else { 0 },
            operations: OperationMetrics {
                image_kernels: self.image_kernel_count.load(Ordering::Relaxed),
                audio_kernels: self.audio_kernel_count.load(Ordering::Relaxed),
                ffts: self.fft_count.load(Ordering::Relaxed),
            },
            transfers: TransferMetrics {
                pushes: self.push_count.load(Ordering::Relaxed),
                pulls: self.pull_count.load(Ordering::Relaxed),
                bytes_pushed: self.bytes_pushed.load(Ordering::Relaxed),
                bytes_pulled: self.bytes_pulled.load(Ordering::Relaxed),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub total_dispatches: u64,
    pub successful_dispatches: u64,
    pub failed_dispatches: u64,
    pub error_rate: f64,
    pub avg_latency_ms: u64,
    pub operations: OperationMetrics,
    pub transfers: TransferMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationMetrics {
    pub image_kernels: u64,
    pub audio_kernels: u64,
    pub ffts: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferMetrics {
    pub pushes: u64,
    pub pulls: u64,
    pub bytes_pushed: u64,
    pub bytes_pulled: u64,
}

/// Timer for tracking dispatch latency
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn new() -> Self {
        Self { start: Instant::now() }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_counts() {
        let metrics = Metrics::new();
        metrics.record_dispatch("audio.kernel", true, 10);
        metrics.record_dispatch("audio.fft", false, 30);
        metrics.record_push(1024);
        metrics.record_pull(512);

        let snap = metrics.snapshot();

        assert_eq!(snap.total_dispatches, 2);
        assert_eq!(snap.failed_dispatches, 1);
        assert_eq!(snap.error_rate, 0.5);
        assert_eq!(snap.avg_latency_ms, 20);
        assert_eq!(snap.operations.audio_kernels, 1);
        assert_eq!(snap.operations.ffts, 1);
        assert_eq!(snap.transfers.bytes_pushed, 1024);
        assert_eq!(snap.transfers.pulls, 1);
    }

    #[test]
    fn test_empty_snapshot() {
        let snap = Metrics::new().snapshot();
        assert_eq!(snap.error_rate, 0.0);
        assert_eq!(snap.avg_latency_ms, 0);
    }
}
