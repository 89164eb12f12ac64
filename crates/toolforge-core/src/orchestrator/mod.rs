//! Orchestrator: the per-request state machine and its shared guards.
//!
//! - [`controller`] drives a request through the phases
//! - [`state`] holds phases, transitions, and diagnostics
//! - [`breaker`] is the cross-request circuit breaker
//! - [`backoff`] computes retry delays
//! - [`verify`] scores execution results

pub mod backoff;
pub mod breaker;
pub mod controller;
pub mod state;
pub mod verify;

pub use backoff::RetryPolicy;
pub use breaker::{Admission, BreakerState, CircuitBreaker, TrialPermit};
pub use controller::{Orchestrator, SharedContext, TaskOutcome, TaskStatus};
pub use state::{AgentState, Diagnostic, Phase, Transition};
pub use verify::{verify, Verification};
