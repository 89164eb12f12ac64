//! Candidate and validated artifacts.
//!
//! A [`CandidateArtifact`] is whatever the synthesizer produced. The only way
//! to obtain a [`ValidatedArtifact`], which is what the sandbox accepts, is
//! through a fault-free [`ValidationReport`](crate::validation::ValidationReport)
//! or by loading a record the registry already holds.

use serde::{Deserialize, Serialize};
use toolforge_store::{ArtifactContract, SourceDigest, ToolRecord};

use crate::planner::Strategy;
use crate::validation::syntax::SourceIndex;

/// Where a candidate came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub strategy: Strategy,
    /// Execution attempt (1-based) the candidate was produced for.
    pub attempt: u32,
    /// Repair round within that attempt; 0 for the first synthesis.
    pub repair: u32,
}

/// Synthesized source plus its declared contract. Immutable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateArtifact {
    source: String,
    contract: Option<ArtifactContract>,
    provenance: Provenance,
    digest: SourceDigest,
}

impl CandidateArtifact {
    /// Wrap source text, reading the contract from its entry point.
    ///
    /// The contract is `None` when the source does not parse or has no
    /// public top-level function; the structural gate reports why.
    pub fn new(source: impl Into<String>, provenance: Provenance) -> Self {
        let source = source.into();
        let contract = SourceIndex::parse(&source)
            .ok()
            .and_then(|index| index.contract());
        let digest = SourceDigest::of(&source);
        Self {
            source,
            contract,
            provenance,
            digest,
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn contract(&self) -> Option<&ArtifactContract> {
        self.contract.as_ref()
    }

    pub fn provenance(&self) -> Provenance {
        self.provenance
    }

    pub fn digest(&self) -> &SourceDigest {
        &self.digest
    }
}

/// An artifact cleared to run in the sandbox.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidatedArtifact {
    source: String,
    contract: ArtifactContract,
    digest: SourceDigest,
}

impl ValidatedArtifact {
    pub(crate) fn approved(candidate: &CandidateArtifact, contract: ArtifactContract) -> Self {
        Self {
            source: candidate.source.clone(),
            contract,
            digest: candidate.digest.clone(),
        }
    }

    /// Registered records passed every gate before they were stored.
    pub(crate) fn from_record(record: &ToolRecord) -> Self {
        Self {
            source: record.source.clone(),
            contract: record.metadata.contract.clone(),
            digest: record.metadata.source_digest.clone(),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn contract(&self) -> &ArtifactContract {
        &self.contract
    }

    pub fn entry_point(&self) -> &str {
        &self.contract.entry_point
    }

    pub fn digest(&self) -> &SourceDigest {
        &self.digest
    }
}
