//! Readiness and per-stage counters.

use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Message counters for one consumer.
#[derive(Debug, Default)]
pub struct StageStats {
    received: AtomicU64,
    succeeded: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    malformed: AtomicU64,
}

impl StageStats {
    /// A delivery arrived.
    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    /// A delivery was handled and acknowledged.
    pub fn record_succeeded(&self) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
    }

    /// A delivery was requeued for another attempt.
    pub fn record_retried(&self) {
        self.retried.fetch_add(1, Ordering::Relaxed);
    }

    /// A delivery was moved to the dead-letter queue.
    pub fn record_dead_lettered(&self) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    /// A delivery could not be decoded.
    pub fn record_malformed(&self) {
        self.malformed.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy the counters.
    pub fn snapshot(&self) -> StageSnapshot {
        StageSnapshot {
            received: self.received.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`StageStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StageSnapshot {
    /// Deliveries received.
    pub received: u64,
    /// Deliveries handled successfully.
    pub succeeded: u64,
    /// Deliveries requeued.
    pub retried: u64,
    /// Deliveries dead-lettered.
    pub dead_lettered: u64,
    /// Deliveries that failed to decode.
    pub malformed: u64,
}

/// Shared health state for every stage of the pipeline.
#[derive(Debug, Default)]
pub struct Health {
    ready: AtomicBool,
    /// Detection stage counters.
    pub detection: Arc<StageStats>,
    /// Enrichment stage counters.
    pub enrichment: Arc<StageStats>,
    /// Status consumer counters (descriptions).
    pub status: Arc<StageStats>,
    /// Status consumer counters (failure notices).
    pub failures: Arc<StageStats>,
}

impl Health {
    /// Mark the pipeline ready after warmup.
    pub fn set_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
    }

    /// Whether warmup has completed.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Serializable report of readiness and counters.
    pub fn report(&self) -> HealthReport {
        HealthReport {
            ready: self.is_ready(),
            detection: self.detection.snapshot(),
            enrichment: self.enrichment.snapshot(),
            status: self.status.snapshot(),
            failures: self.failures.snapshot(),
        }
    }
}

/// Health snapshot suitable for a liveness/readiness probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    /// Warmup completed.
    pub ready: bool,
    /// Detection stage counters.
    pub detection: StageSnapshot,
    /// Enrichment stage counters.
    pub enrichment: StageSnapshot,
    /// Status consumer counters.
    pub status: StageSnapshot,
    /// Failure notice counters.
    pub failures: StageSnapshot,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_reflects_counters() {
        let health = Health::default();
        assert!(!health.report().ready);

        health.detection.record_received();
        health.detection.record_succeeded();
        health.set_ready();

        let report = health.report();
        assert!(report.ready);
        assert_eq!(report.detection.received, 1);
        assert_eq!(report.detection.succeeded, 1);
        assert_eq!(report.enrichment, StageSnapshot::default());
    }
}
