//! Circuit breaker over consecutive execution faults.
//!
//! State lives in atomics and changes only through compare-and-swap, so
//! concurrent requests share one breaker without a lock. While open, every
//! admission is rejected until `recovery_timeout` has passed; then exactly
//! one request is admitted as a trial and its first execution decides
//! whether the breaker closes or re-opens.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::BreakerSection;
use crate::metrics::METRICS;
use crate::obs;

const CLOSED: u8 = 0;
const OPEN: u8 = 1;
const HALF_OPEN: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            OPEN => BreakerState::Open,
            HALF_OPEN => BreakerState::HalfOpen,
            _ => BreakerState::Closed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

/// Result of asking the breaker to admit a request.
#[derive(Debug)]
pub enum Admission {
    Closed,
    /// The single half-open trial. Resolve it with the first execution outcome.
    Trial(TrialPermit),
    Rejected { consecutive_failures: u32 },
}

#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    recovery_timeout: Duration,
    window: Duration,
    epoch: Instant,
    state: AtomicU8,
    consecutive: AtomicU32,
    last_failure_ms: AtomicU64,
    opened_at_ms: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, recovery_timeout: Duration, window: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            recovery_timeout,
            window,
            epoch: Instant::now(),
            state: AtomicU8::new(CLOSED),
            consecutive: AtomicU32::new(0),
            last_failure_ms: AtomicU64::new(0),
            opened_at_ms: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &BreakerSection) -> Self {
        Self::new(
            config.failure_threshold,
            Duration::from_millis(config.recovery_timeout_ms),
            Duration::from_millis(config.window_ms),
        )
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    pub fn state(&self) -> BreakerState {
        BreakerState::from_raw(self.state.load(Ordering::Acquire))
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive.load(Ordering::Acquire)
    }

    pub fn admit(self: &Arc<Self>) -> Admission {
        match self.state() {
            BreakerState::Closed => Admission::Closed,
            BreakerState::HalfOpen => self.rejected(),
            BreakerState::Open => {
                let opened = self.opened_at_ms.load(Ordering::Acquire);
                let elapsed = self.now_ms().saturating_sub(opened);
                if elapsed < self.recovery_timeout.as_millis() as u64 {
                    return self.rejected();
                }
                match self.state.compare_exchange(
                    OPEN,
                    HALF_OPEN,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => {
                        obs::emit_breaker_state(
                            BreakerState::HalfOpen.as_str(),
                            self.consecutive_failures(),
                        );
                        Admission::Trial(TrialPermit {
                            breaker: Arc::clone(self),
                            resolved: false,
                        })
                    }
                    Err(_) => self.rejected(),
                }
            }
        }
    }

    /// Whether a request already admitted may keep executing.
    pub fn is_open(&self) -> bool {
        self.state() != BreakerState::Closed
    }

    fn rejected(&self) -> Admission {
        Admission::Rejected {
            consecutive_failures: self.consecutive_failures(),
        }
    }

    /// Successful execution outside a trial.
    pub fn record_success(&self) {
        if self.state() == BreakerState::Closed {
            self.consecutive.store(0, Ordering::Release);
        }
    }

    /// Execution fault outside a trial.
    pub fn record_failure(&self) {
        let count = self.bump_failures();
        if count >= self.failure_threshold && self.state() == BreakerState::Closed {
            self.trip(CLOSED, count);
        }
    }

    fn bump_failures(&self) -> u32 {
        let now = self.now_ms();
        let last = self.last_failure_ms.swap(now, Ordering::AcqRel);
        let stale = now.saturating_sub(last) > self.window.as_millis() as u64;
        let mut current = self.consecutive.load(Ordering::Acquire);
        loop {
            let next = if current > 0 && stale {
                1
            } else {
                current.saturating_add(1)
            };
            match self.consecutive.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }

    /// Move `from` -> open. The timestamp is stored before the state flips.
    fn trip(&self, from: u8, failures: u32) {
        self.opened_at_ms.store(self.now_ms(), Ordering::Release);
        if self
            .state
            .compare_exchange(from, OPEN, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        METRICS.inc_breaker_trips();
        warn!(failures, "circuit breaker opened");
        obs::emit_breaker_state(BreakerState::Open.as_str(), failures);
    }
}

/// The one request admitted while half-open.
///
/// Dropping an unresolved permit (the trial never reached execution)
/// returns the breaker to open with its recovery timeout already elapsed,
/// so the next request becomes the trial.
#[derive(Debug)]
pub struct TrialPermit {
    breaker: Arc<CircuitBreaker>,
    resolved: bool,
}

impl TrialPermit {
    pub fn resolve(mut self, success: bool) {
        self.resolved = true;
        let breaker = &self.breaker;
        if success {
            breaker.consecutive.store(0, Ordering::Release);
            if breaker
                .state
                .compare_exchange(HALF_OPEN, CLOSED, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                info!("circuit breaker closed after successful trial");
                obs::emit_breaker_state(BreakerState::Closed.as_str(), 0);
            }
        } else {
            let count = breaker.bump_failures();
            breaker.trip(HALF_OPEN, count);
        }
    }
}

impl Drop for TrialPermit {
    fn drop(&mut self) {
        if !self.resolved {
            let _ = self.breaker.state.compare_exchange(
                HALF_OPEN,
                OPEN,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
        }
    }
}
