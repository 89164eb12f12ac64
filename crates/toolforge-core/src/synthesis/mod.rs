//! Candidate synthesis: turning a task description into source text.
//!
//! The generator is a black box behind [`Synthesizer`]. Two adapters ship
//! with the crate: [`TemplateSynthesizer`] (offline keyword templates) and
//! [`GeminiSynthesizer`] (HTTP).

pub mod gemini;
pub mod template;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::IoSpec;
use crate::planner::Strategy;

pub use gemini::{GeminiConfig, GeminiSynthesizer};
pub use template::TemplateSynthesizer;

/// Everything a synthesizer is told about one candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthesisSpec {
    pub task_description: String,
    #[serde(default)]
    pub io_hints: IoSpec,
    /// Diagnostic from the previous candidate, when repairing.
    #[serde(default)]
    pub repair_feedback: Option<String>,
    /// Planner guidance and lessons from earlier failures.
    #[serde(default)]
    pub guidance: Vec<String>,
    pub strategy: Strategy,
    /// Which multi-path leaf produced this spec; 0 otherwise.
    #[serde(default)]
    pub variant: u32,
}

impl SynthesisSpec {
    pub fn new(task_description: impl Into<String>, io_hints: IoSpec, strategy: Strategy) -> Self {
        Self {
            task_description: task_description.into(),
            io_hints,
            repair_feedback: None,
            guidance: Vec::new(),
            strategy,
            variant: 0,
        }
    }

    pub fn with_feedback(mut self, feedback: impl Into<String>) -> Self {
        self.repair_feedback = Some(feedback.into());
        self
    }

    pub fn with_guidance(mut self, guidance: Vec<String>) -> Self {
        self.guidance = guidance;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SynthesisError {
    #[error("no template matches task: {0}")]
    Unsupported(String),

    #[error("API key not configured (set {0})")]
    MissingApiKey(&'static str),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("generator returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("generator returned no text")]
    EmptyResponse,
}

/// Produces candidate source text.
#[async_trait]
pub trait Synthesizer: Send + Sync {
    fn name(&self) -> &str;

    async fn synthesize(&self, spec: &SynthesisSpec) -> Result<String, SynthesisError>;
}

/// Remove a surrounding Markdown code fence and any prose before the code.
pub fn strip_code_fences(text: &str) -> String {
    let mut code = text.trim();
    if let Some(open) = code.find("```") {
        let after = &code[open + 3..];
        // Skip the info string (`python`, `py`, ...) on the fence line.
        let body_start = after.find('\n').map(|i| i + 1).unwrap_or(after.len());
        let body = &after[body_start..];
        code = match body.find("```") {
            Some(close) => &body[..close],
            None => body,
        };
    }

    let lines: Vec<&str> = code.lines().collect();
    let start = lines
        .iter()
        .position(|line| {
            let line = line.trim_start();
            line.starts_with("def ")
                || line.starts_with("import ")
                || line.starts_with("from ")
                || line.starts_with('@')
        })
        .unwrap_or(0);
    let mut out = lines[start..].join("\n").trim().to_string();
    out.push('\n');
    out
}
