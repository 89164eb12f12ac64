//! Global atomic counters for toolforge observability.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event (e.g. when the CLI exits).

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Lightweight atomic counters: no allocations, no locking.
pub struct Metrics {
    requests_handled: AtomicU64,
    artifacts_synthesized: AtomicU64,
    validation_faults: AtomicU64,
    sandbox_runs: AtomicU64,
    tools_reused: AtomicU64,
    breaker_trips: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            requests_handled: AtomicU64::new(0),
            artifacts_synthesized: AtomicU64::new(0),
            validation_faults: AtomicU64::new(0),
            sandbox_runs: AtomicU64::new(0),
            tools_reused: AtomicU64::new(0),
            breaker_trips: AtomicU64::new(0),
        }
    }

    pub fn inc_requests(&self) {
        self.requests_handled.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "requests_handled", "counter incremented");
    }

    pub fn inc_synthesized(&self) {
        self.artifacts_synthesized.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "artifacts_synthesized", "counter incremented");
    }

    pub fn inc_validation_faults(&self) {
        self.validation_faults.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "validation_faults", "counter incremented");
    }

    pub fn inc_sandbox_runs(&self) {
        self.sandbox_runs.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "sandbox_runs", "counter incremented");
    }

    pub fn inc_reused(&self) {
        self.tools_reused.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "tools_reused", "counter incremented");
    }

    pub fn inc_breaker_trips(&self) {
        self.breaker_trips.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "breaker_trips", "counter incremented");
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            requests_handled = self.requests_handled(),
            artifacts_synthesized = self.artifacts_synthesized(),
            validation_faults = self.validation_faults(),
            sandbox_runs = self.sandbox_runs(),
            tools_reused = self.tools_reused(),
            breaker_trips = self.breaker_trips(),
        );
    }

    pub fn requests_handled(&self) -> u64 {
        self.requests_handled.load(Ordering::Relaxed)
    }

    pub fn artifacts_synthesized(&self) -> u64 {
        self.artifacts_synthesized.load(Ordering::Relaxed)
    }

    pub fn validation_faults(&self) -> u64 {
        self.validation_faults.load(Ordering::Relaxed)
    }

    pub fn sandbox_runs(&self) -> u64 {
        self.sandbox_runs.load(Ordering::Relaxed)
    }

    pub fn tools_reused(&self) -> u64 {
        self.tools_reused.load(Ordering::Relaxed)
    }

    pub fn breaker_trips(&self) -> u64 {
        self.breaker_trips.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        self.requests_handled.store(0, Ordering::Relaxed);
        self.artifacts_synthesized.store(0, Ordering::Relaxed);
        self.validation_faults.store(0, Ordering::Relaxed);
        self.sandbox_runs.store(0, Ordering::Relaxed);
        self.tools_reused.store(0, Ordering::Relaxed);
        self.breaker_trips.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_increment() {
        let m = Metrics::new();
        assert_eq!(m.requests_handled(), 0);
        m.inc_requests();
        m.inc_requests();
        assert_eq!(m.requests_handled(), 2);

        m.inc_sandbox_runs();
        assert_eq!(m.sandbox_runs(), 1);

        m.inc_reused();
        m.inc_breaker_trips();
        m.inc_breaker_trips();
        assert_eq!(m.tools_reused(), 1);
        assert_eq!(m.breaker_trips(), 2);
    }

    #[test]
    fn reset_zeroes_all() {
        let m = Metrics::new();
        m.inc_requests();
        m.inc_synthesized();
        m.inc_validation_faults();
        m.reset();
        assert_eq!(m.requests_handled(), 0);
        assert_eq!(m.artifacts_synthesized(), 0);
        assert_eq!(m.validation_faults(), 0);
    }
}
