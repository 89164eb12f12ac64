//! Toolforge Core Library
//!
//! On-demand tool synthesis for autonomous agents: a task is planned,
//! synthesized into a small Python program, gated by static validation,
//! executed in a resource-bounded sandbox, verified, and cataloged for reuse.
//!
//! ## Layers
//!
//! - [`synthesis`]: candidate generation behind the `Synthesizer` trait
//! - [`validation`]: structural, policy, security, and contract gates
//! - [`sandbox`]: isolated execution behind the `SandboxBackend` trait
//! - [`registry`]: versioned catalog with search and usage stats
//! - [`planner`]: strategy selection and episodic memory
//! - [`orchestrator`]: the per-request state machine, retry, circuit breaker

pub mod config;
pub mod domain;
pub mod fakes;
pub mod metrics;
pub mod obs;
pub mod orchestrator;
pub mod planner;
pub mod registry;
pub mod sandbox;
pub mod synthesis;
pub mod telemetry;
pub mod validation;

pub use config::{AgentConfig, ConfigError, RegistryConfig};

pub use domain::{
    CandidateArtifact, ExecutionFault, Fault, FaultKind, IoSpec, IoType, Provenance,
    SourceLocation, TaskRequest, TimeoutKind, ValidatedArtifact, ValidationFault,
};

pub use orchestrator::{
    CircuitBreaker, Diagnostic, Orchestrator, Phase, SharedContext, TaskOutcome, TaskStatus,
};

pub use planner::{EpisodicMemory, Fingerprint, PlanStep, Planner, Strategy};

pub use registry::{
    NewTool, RegistryError, RegistryResult, SearchQuery, SearchResults, SuccessRatePolicy,
    ToolRegistry,
};

pub use sandbox::{
    ExecutionId, ExecutionPolicy, ExecutionResult, ProcessSandbox, ResourceUsage, SandboxBackend,
};

pub use synthesis::{
    GeminiConfig, GeminiSynthesizer, SynthesisError, SynthesisSpec, Synthesizer,
    TemplateSynthesizer,
};

pub use validation::{ValidationPipeline, ValidationPolicy, ValidationReport};

pub use toolforge_store::{SourceDigest, ToolId, ToolMetadata, ToolRecord, Version};
