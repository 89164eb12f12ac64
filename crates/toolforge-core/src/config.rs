//! Agent configuration.
//!
//! One immutable [`AgentConfig`] is built at startup from TOML, with
//! `TOOLFORGE_*` environment overrides, and handed to the orchestrator.
//! Every section is `#[serde(default)]`, so a partial file is valid.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::registry::search::SearchWeights;
use crate::registry::stats::SuccessRatePolicy;
use crate::sandbox::ExecutionPolicy;
use crate::validation::policy::{
    ValidationPolicy, STANDARD_ALLOWED, STANDARD_DENIED, STANDARD_NETWORK,
};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {key}: {value}")]
    InvalidEnv { key: String, value: String },

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    /// Direct-strategy confidence below this escalates to multi-path search.
    pub confidence_threshold: f64,
    /// Verification score at or above this responds with success.
    pub acceptance_threshold: f64,
    /// Minimum search score for reusing a registered tool.
    pub reuse_threshold: f64,
    /// Total execution attempts per request.
    pub max_retries: u32,
    /// Validation repairs per request.
    pub max_repair_attempts: u32,
    pub max_concurrent_requests: usize,
    pub synthesis_timeout_ms: u64,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.7,
            acceptance_threshold: 0.6,
            reuse_threshold: 0.75,
            max_retries: 3,
            max_repair_attempts: 3,
            max_concurrent_requests: 4,
            synthesis_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerSection {
    pub search_width: usize,
    pub search_depth: usize,
    /// Lessons kept per task fingerprint.
    pub episodic_limit: usize,
}

impl Default for PlannerSection {
    fn default() -> Self {
        Self {
            search_width: 3,
            search_depth: 2,
            episodic_limit: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// Fraction of the delay randomized in either direction.
    pub jitter: f64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            initial_delay_ms: 500,
            max_delay_ms: 10_000,
            multiplier: 2.0,
            jitter: 0.25,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxSection {
    pub cpu_time_limit_secs: u64,
    pub memory_limit_bytes: u64,
    pub wall_time_limit_ms: u64,
    pub network_enabled: bool,
    pub allowed_hosts: Vec<String>,
    pub interpreter: String,
    /// Parent of per-execution scratch directories. System temp when unset.
    pub work_dir: Option<PathBuf>,
}

impl Default for SandboxSection {
    fn default() -> Self {
        let policy = ExecutionPolicy::default();
        Self {
            cpu_time_limit_secs: policy.cpu_time_limit_secs,
            memory_limit_bytes: policy.memory_limit_bytes,
            wall_time_limit_ms: policy.wall_time_limit_ms,
            network_enabled: policy.network_enabled,
            allowed_hosts: policy.allowed_hosts,
            interpreter: "python3".to_string(),
            work_dir: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationSection {
    pub allowed_modules: Vec<String>,
    pub denied_modules: Vec<String>,
    pub network_modules: Vec<String>,
}

impl Default for ValidationSection {
    fn default() -> Self {
        let owned = |items: &[&str]| items.iter().map(|s| (*s).to_string()).collect();
        Self {
            allowed_modules: owned(STANDARD_ALLOWED),
            denied_modules: owned(STANDARD_DENIED),
            network_modules: owned(STANDARD_NETWORK),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSection {
    pub failure_threshold: u32,
    pub recovery_timeout_ms: u64,
    /// Failures older than this no longer count toward the threshold.
    pub window_ms: u64,
}

impl Default for BreakerSection {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_ms: 60_000,
            window_ms: 300_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Registry root. In-memory when unset.
    pub path: Option<PathBuf>,
    pub success_rate: SuccessRatePolicy,
    pub weights: SearchWeights,
    pub recency_half_life_days: f64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            path: None,
            success_rate: SuccessRatePolicy::default(),
            weights: SearchWeights::default(),
            recency_half_life_days: 30.0,
        }
    }
}

/// Complete agent configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub agent: AgentSection,
    pub planner: PlannerSection,
    pub retry: RetrySection,
    pub sandbox: SandboxSection,
    pub validation: ValidationSection,
    pub breaker: BreakerSection,
    pub registry: RegistryConfig,
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

impl AgentConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Defaults overlaid with the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Overlay `TOOLFORGE_*` variables read through `lookup`.
    pub fn apply_env(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        macro_rules! overlay {
            ($key:literal, $field:expr) => {
                if let Some(value) = lookup($key) {
                    $field = parse_env($key, &value)?;
                }
            };
        }

        overlay!("TOOLFORGE_CONFIDENCE_THRESHOLD", self.agent.confidence_threshold);
        overlay!("TOOLFORGE_ACCEPTANCE_THRESHOLD", self.agent.acceptance_threshold);
        overlay!("TOOLFORGE_REUSE_THRESHOLD", self.agent.reuse_threshold);
        overlay!("TOOLFORGE_MAX_RETRIES", self.agent.max_retries);
        overlay!("TOOLFORGE_MAX_REPAIR_ATTEMPTS", self.agent.max_repair_attempts);
        overlay!("TOOLFORGE_MAX_CONCURRENT_REQUESTS", self.agent.max_concurrent_requests);
        overlay!("TOOLFORGE_SYNTHESIS_TIMEOUT_MS", self.agent.synthesis_timeout_ms);
        overlay!("TOOLFORGE_CPU_TIME_LIMIT_SECS", self.sandbox.cpu_time_limit_secs);
        overlay!("TOOLFORGE_MEMORY_LIMIT_BYTES", self.sandbox.memory_limit_bytes);
        overlay!("TOOLFORGE_WALL_TIME_LIMIT_MS", self.sandbox.wall_time_limit_ms);
        overlay!("TOOLFORGE_NETWORK_ENABLED", self.sandbox.network_enabled);
        overlay!("TOOLFORGE_INTERPRETER", self.sandbox.interpreter);
        overlay!("TOOLFORGE_FAILURE_THRESHOLD", self.breaker.failure_threshold);
        overlay!("TOOLFORGE_RECOVERY_TIMEOUT_MS", self.breaker.recovery_timeout_ms);

        if let Some(value) = lookup("TOOLFORGE_ALLOWED_MODULES") {
            self.validation.allowed_modules = parse_list(&value);
        }
        if let Some(value) = lookup("TOOLFORGE_DENIED_MODULES") {
            self.validation.denied_modules = parse_list(&value);
        }
        if let Some(value) = lookup("TOOLFORGE_REGISTRY_PATH") {
            self.registry.path = Some(PathBuf::from(value));
        }
        if let Some(value) = lookup("TOOLFORGE_WORK_DIR") {
            self.sandbox.work_dir = Some(PathBuf::from(value));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let unit = |name: &str, v: f64| {
            if (0.0..=1.0).contains(&v) {
                Ok(())
            } else {
                Err(ConfigError::Invalid(format!("{name} must be in [0, 1], got {v}")))
            }
        };
        unit("agent.confidence_threshold", self.agent.confidence_threshold)?;
        unit("agent.acceptance_threshold", self.agent.acceptance_threshold)?;
        unit("agent.reuse_threshold", self.agent.reuse_threshold)?;
        unit("retry.jitter", self.retry.jitter)?;

        if self.agent.max_retries == 0 {
            return Err(ConfigError::Invalid(
                "agent.max_retries must be at least 1".into(),
            ));
        }
        if self.agent.max_concurrent_requests == 0 {
            return Err(ConfigError::Invalid(
                "agent.max_concurrent_requests must be at least 1".into(),
            ));
        }
        if self.planner.search_width == 0 || self.planner.search_depth == 0 {
            return Err(ConfigError::Invalid(
                "planner search width and depth must be at least 1".into(),
            ));
        }
        if self.retry.multiplier < 1.0 {
            return Err(ConfigError::Invalid(format!(
                "retry.multiplier must be >= 1, got {}",
                self.retry.multiplier
            )));
        }
        if self.retry.max_delay_ms < self.retry.initial_delay_ms {
            return Err(ConfigError::Invalid(
                "retry.max_delay_ms is below retry.initial_delay_ms".into(),
            ));
        }
        if self.sandbox.wall_time_limit_ms == 0 || self.sandbox.cpu_time_limit_secs == 0 {
            return Err(ConfigError::Invalid("sandbox limits must be non-zero".into()));
        }
        if self.sandbox.interpreter.trim().is_empty() {
            return Err(ConfigError::Invalid("sandbox.interpreter is empty".into()));
        }
        if self.breaker.failure_threshold == 0 {
            return Err(ConfigError::Invalid(
                "breaker.failure_threshold must be at least 1".into(),
            ));
        }
        if self.registry.recency_half_life_days <= 0.0 {
            return Err(ConfigError::Invalid(
                "registry.recency_half_life_days must be positive".into(),
            ));
        }
        self.registry
            .success_rate
            .validate()
            .map_err(|e| ConfigError::Invalid(format!("registry.success_rate: {e}")))
    }

    pub fn execution_policy(&self) -> ExecutionPolicy {
        ExecutionPolicy::default()
            .with_cpu_time_limit_secs(self.sandbox.cpu_time_limit_secs)
            .with_memory_limit_bytes(self.sandbox.memory_limit_bytes)
            .with_wall_time_limit(std::time::Duration::from_millis(
                self.sandbox.wall_time_limit_ms,
            ))
            .with_network(
                self.sandbox.network_enabled,
                self.sandbox.allowed_hosts.clone(),
            )
    }

    pub fn validation_policy(&self) -> ValidationPolicy {
        let set = |v: &Vec<String>| v.iter().cloned().collect();
        ValidationPolicy {
            allowed: set(&self.validation.allowed_modules),
            denied: set(&self.validation.denied_modules),
            network_modules: set(&self.validation.network_modules),
            network_enabled: self.sandbox.network_enabled,
        }
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Invalid(e.to_string()))
    }
}
