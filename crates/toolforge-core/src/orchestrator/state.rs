//! Per-request state machine: phases, transitions, and the audit trail.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::domain::Fault;
use crate::obs;
use crate::planner::PlanStep;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Received,
    Planning,
    Synthesizing,
    Validating,
    Executing,
    Verifying,
    Responding,
    Degraded,
    Failed,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Received => "RECEIVED",
            Phase::Planning => "PLANNING",
            Phase::Synthesizing => "SYNTHESIZING",
            Phase::Validating => "VALIDATING",
            Phase::Executing => "EXECUTING",
            Phase::Verifying => "VERIFYING",
            Phase::Responding => "RESPONDING",
            Phase::Degraded => "DEGRADED",
            Phase::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Responding | Phase::Degraded | Phase::Failed)
    }

    pub fn can_transition_to(&self, next: Phase) -> bool {
        use Phase::*;
        match (*self, next) {
            (from, Failed) => !from.is_terminal(),
            (Received, Planning | Executing | Degraded) => true,
            (Planning, Synthesizing) => true,
            (Synthesizing, Validating | Planning | Degraded) => true,
            (Validating, Executing | Synthesizing) => true,
            (Executing, Verifying | Planning | Degraded) => true,
            (Verifying, Responding | Degraded) => true,
            _ => false,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub from: Phase,
    pub to: Phase,
    pub at: DateTime<Utc>,
    pub note: String,
}

/// A fault together with where in the request it happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub phase: Phase,
    /// Execution attempt (1-based); 0 before the first attempt.
    pub attempt: u32,
    pub fault: Fault,
}

/// Everything the orchestrator knows about one request.
#[derive(Debug, Clone, Serialize)]
pub struct AgentState {
    request_id: Uuid,
    phase: Phase,
    history: Vec<Transition>,
    pub retry_count: u32,
    pub repair_count: u32,
    pub last_confidence: Option<f64>,
    faults: Vec<Diagnostic>,
    plans: Vec<PlanStep>,
}

impl AgentState {
    pub fn new(request_id: Uuid) -> Self {
        Self {
            request_id,
            phase: Phase::Received,
            history: Vec::new(),
            retry_count: 0,
            repair_count: 0,
            last_confidence: None,
            faults: Vec::new(),
            plans: Vec::new(),
        }
    }

    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Append-only record of every transition taken.
    pub fn history(&self) -> &[Transition] {
        &self.history
    }

    pub fn faults(&self) -> &[Diagnostic] {
        &self.faults
    }

    pub fn plans(&self) -> &[PlanStep] {
        &self.plans
    }

    pub fn transition(&mut self, to: Phase, note: impl Into<String>) {
        let note = note.into();
        let legal = self.phase.can_transition_to(to);
        debug_assert!(legal, "illegal transition {} -> {}", self.phase, to);
        if !legal {
            warn!(from = %self.phase, to = %to, "unexpected phase transition");
        }
        obs::emit_phase_transition(self.phase.as_str(), to.as_str(), &note);
        self.history.push(Transition {
            from: self.phase,
            to,
            at: Utc::now(),
            note,
        });
        self.phase = to;
    }

    pub fn record_fault(&mut self, attempt: u32, fault: Fault) {
        self.faults.push(Diagnostic {
            phase: self.phase,
            attempt,
            fault,
        });
    }

    pub fn record_plan(&mut self, step: PlanStep) {
        self.last_confidence = Some(step.confidence);
        self.plans.push(step);
    }

    pub fn into_parts(self) -> (Vec<Transition>, Vec<Diagnostic>, Vec<PlanStep>) {
        (self.history, self.faults, self.plans)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ExecutionFault, TimeoutKind};

    #[test]
    fn happy_path_is_legal() {
        let path = [
            Phase::Received,
            Phase::Planning,
            Phase::Synthesizing,
            Phase::Validating,
            Phase::Executing,
            Phase::Verifying,
            Phase::Responding,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{:?}", pair);
        }
    }

    #[test]
    fn terminal_phases_are_final() {
        for terminal in [Phase::Responding, Phase::Degraded, Phase::Failed] {
            assert!(terminal.is_terminal());
            assert!(!terminal.can_transition_to(Phase::Failed));
            assert!(!terminal.can_transition_to(Phase::Planning));
        }
        assert!(!Phase::Validating.can_transition_to(Phase::Responding));
    }

    #[test]
    fn history_records_each_transition() {
        let mut state = AgentState::new(Uuid::new_v4());
        state.transition(Phase::Planning, "direct");
        state.transition(Phase::Synthesizing, "");
        state.record_fault(
            1,
            Fault::from(ExecutionFault::Terminated),
        );
        state.transition(Phase::Failed, "cancelled");

        let history = state.history();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].from, Phase::Received);
        assert_eq!(history[2].to, Phase::Failed);
        assert_eq!(state.faults()[0].phase, Phase::Synthesizing);
    }

    #[test]
    fn phases_serialize_in_upper_case() {
        assert_eq!(
            serde_json::to_value(Phase::Executing).unwrap(),
            serde_json::json!("EXECUTING")
        );
    }

    #[test]
    fn timeout_diagnostic_round_trips_through_json() {
        let diag = Diagnostic {
            phase: Phase::Executing,
            attempt: 2,
            fault: Fault::from(ExecutionFault::Timeout {
                limit: TimeoutKind::Wall,
                limit_ms: 60_000,
            }),
        };

        let json = serde_json::to_value(&diag).unwrap();
        assert_eq!(json["fault"]["type"], "execution");
        assert_eq!(json["fault"]["kind"], "timeout");
        assert_eq!(json["fault"]["limit"], "wall");

        let back: Diagnostic = serde_json::from_value(json).unwrap();
        assert_eq!(back, diag);
    }
}
