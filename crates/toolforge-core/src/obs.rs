//! Structured observability hooks for the request lifecycle.
//!
//! This module provides:
//! - Request-scoped tracing spans via the `RequestSpan` RAII guard
//! - Emission functions for key events: request start/finish, phase
//!   transitions, gate verdicts, sandbox runs, breaker changes, registrations
//!
//! Events are emitted at `info!` level unless noted; filter with `RUST_LOG`.

use tracing::{debug, info, warn};

use crate::domain::ValidationFault;

/// RAII guard that enters a request-scoped tracing span.
///
/// # Example
///
/// ```ignore
/// let _span = RequestSpan::enter("6f1c...");
/// // every event below carries request_id
/// ```
pub struct RequestSpan {
    _span: tracing::span::EnteredSpan,
}

impl RequestSpan {
    pub fn enter(request_id: &str) -> Self {
        let span = tracing::info_span!("toolforge.request", request_id = %request_id);
        Self {
            _span: span.entered(),
        }
    }
}

/// Build (but do not enter) the request span, for instrumenting futures.
pub fn request_span(request_id: &str) -> tracing::Span {
    tracing::info_span!("toolforge.request", request_id = %request_id)
}

pub fn emit_request_started(request_id: &str, description: &str) {
    info!(event = "request.started", request_id = %request_id, description = %description);
}

pub fn emit_request_finished(request_id: &str, status: &str, attempts: u32, duration_ms: u64) {
    info!(
        event = "request.finished",
        request_id = %request_id,
        status = %status,
        attempts = attempts,
        duration_ms = duration_ms,
    );
}

pub fn emit_phase_transition(from: &str, to: &str, note: &str) {
    debug!(event = "phase.transition", from = %from, to = %to, note = %note);
}

pub fn emit_gate_verdict(artifact: &str, gate: &str, fault: Option<&ValidationFault>) {
    match fault {
        None => debug!(event = "gate.passed", artifact = %artifact, gate = %gate),
        Some(fault) => info!(
            event = "gate.fault",
            artifact = %artifact,
            gate = %gate,
            fault = %fault,
        ),
    }
}

pub fn emit_sandbox_finished(execution_id: &str, status: &str, wall_ms: u64, cpu_ms: u64) {
    info!(
        event = "sandbox.finished",
        execution_id = %execution_id,
        status = %status,
        wall_ms = wall_ms,
        cpu_ms = cpu_ms,
    );
}

pub fn emit_breaker_state(state: &str, consecutive_failures: u32) {
    warn!(
        event = "breaker.state",
        state = %state,
        consecutive_failures = consecutive_failures,
    );
}

pub fn emit_tool_registered(tool_id: &str, digest: &str) {
    info!(event = "tool.registered", tool_id = %tool_id, digest = %digest);
}

/// Registration failures never fail the request; they are logged here.
pub fn emit_registration_failed(name: &str, error: &dyn std::fmt::Display) {
    warn!(event = "tool.registration_failed", name = %name, error = %error);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_span_create() {
        let _span = RequestSpan::enter("test-request-id");
        emit_phase_transition("RECEIVED", "PLANNING", "");
    }
}
