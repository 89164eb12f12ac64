//! Validation pipeline: four ordered, short-circuiting gates.
//!
//! 1. [`structural`] parses the source and locates the entry point
//! 2. [`policy`] resolves imports against the allow and deny sets
//! 3. [`security`] rejects dangerous call and attribute patterns
//! 4. [`contract`] checks declared types against the task's io hints
//!
//! The pipeline is pure. A gate that faults ends the report; later gates
//! never see the artifact.

pub mod contract;
pub mod policy;
pub mod security;
pub mod structural;
pub mod syntax;

use serde::{Deserialize, Serialize};
use toolforge_store::SourceDigest;

use crate::domain::{CandidateArtifact, IoSpec, ValidatedArtifact, ValidationFault};
use crate::obs;

pub use policy::{ModuleVerdict, ValidationPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateKind {
    Structural,
    Policy,
    Security,
    Contract,
}

impl GateKind {
    pub const ORDER: [GateKind; 4] = [
        GateKind::Structural,
        GateKind::Policy,
        GateKind::Security,
        GateKind::Contract,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            GateKind::Structural => "structural",
            GateKind::Policy => "policy",
            GateKind::Security => "security",
            GateKind::Contract => "contract",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum GateOutcome {
    Pass,
    Fault { fault: ValidationFault },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateVerdict {
    pub gate: GateKind,
    #[serde(flatten)]
    pub outcome: GateOutcome,
}

/// Ordered gate verdicts for exactly one artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub artifact_digest: SourceDigest,
    pub verdicts: Vec<GateVerdict>,
}

impl ValidationReport {
    /// True when all four gates ran and passed.
    pub fn is_clean(&self) -> bool {
        self.verdicts.len() == GateKind::ORDER.len()
            && self
                .verdicts
                .iter()
                .all(|v| matches!(v.outcome, GateOutcome::Pass))
    }

    pub fn fault(&self) -> Option<&ValidationFault> {
        self.verdicts.iter().find_map(|v| match &v.outcome {
            GateOutcome::Fault { fault } => Some(fault),
            GateOutcome::Pass => None,
        })
    }

    /// Clear `artifact` for execution if this report is clean and was
    /// produced for it.
    pub fn approve(&self, artifact: &CandidateArtifact) -> Option<ValidatedArtifact> {
        if !self.is_clean() || &self.artifact_digest != artifact.digest() {
            return None;
        }
        let contract = artifact.contract()?.clone();
        Some(ValidatedArtifact::approved(artifact, contract))
    }
}

/// The four gates, configured with one import policy.
#[derive(Debug, Clone, Default)]
pub struct ValidationPipeline {
    policy: ValidationPolicy,
}

impl ValidationPipeline {
    pub fn new(policy: ValidationPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &ValidationPolicy {
        &self.policy
    }

    pub fn validate(&self, artifact: &CandidateArtifact, io: &IoSpec) -> ValidationReport {
        let mut report = ValidationReport {
            artifact_digest: artifact.digest().clone(),
            verdicts: Vec::with_capacity(GateKind::ORDER.len()),
        };

        let index = match structural::check(artifact.source()) {
            Ok(index) => {
                record(&mut report, GateKind::Structural, Ok(()));
                index
            }
            Err(fault) => {
                record(&mut report, GateKind::Structural, Err(fault));
                return report;
            }
        };

        if !record(&mut report, GateKind::Policy, policy::check(&index, &self.policy)) {
            return report;
        }
        if !record(&mut report, GateKind::Security, security::check(&index)) {
            return report;
        }

        let contract_result = match index.contract() {
            Some(contract) => contract::check(&contract, io),
            None => Err(ValidationFault::Contract {
                expected: "entry point".to_string(),
                declared: "none".to_string(),
            }),
        };
        record(&mut report, GateKind::Contract, contract_result);
        report
    }
}

/// Append a verdict; returns whether the gate passed.
fn record(
    report: &mut ValidationReport,
    gate: GateKind,
    result: Result<(), ValidationFault>,
) -> bool {
    let passed = result.is_ok();
    obs::emit_gate_verdict(
        report.artifact_digest.short(),
        gate.as_str(),
        result.as_ref().err(),
    );
    let outcome = match result {
        Ok(()) => GateOutcome::Pass,
        Err(fault) => GateOutcome::Fault { fault },
    };
    report.verdicts.push(GateVerdict { gate, outcome });
    passed
}
