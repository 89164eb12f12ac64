//! Planner: strategy selection and synthesis-spec construction.
//!
//! Strategies escalate `Direct -> MultiPathSearch -> ReflectiveRetry` and
//! never regress within one request. The caller carries the floor between
//! calls in [`PlanContext`].

pub mod memory;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::AgentConfig;
use crate::domain::{Fault, TaskRequest};
use crate::registry::tokenize;
use crate::synthesis::SynthesisSpec;

pub use memory::{EpisodicMemory, Episode, Fingerprint, Outcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Direct,
    MultiPathSearch,
    ReflectiveRetry,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Direct => "direct",
            Strategy::MultiPathSearch => "multi_path_search",
            Strategy::ReflectiveRetry => "reflective_retry",
        }
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One planning decision. Kept in the audit history only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    pub strategy: Strategy,
    pub spec: SynthesisSpec,
    pub confidence: f64,
    /// Leaves scored by a multi-path search; 1 otherwise.
    pub explored: usize,
}

/// What the planner knows about the request so far.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlanContext<'a> {
    pub retry_count: u32,
    /// Strongest strategy already used for this request.
    pub floor: Option<Strategy>,
    pub last_fault: Option<&'a Fault>,
}

struct Approach {
    guidance: &'static str,
    keywords: &'static [&'static str],
}

const APPROACHES: &[Approach] = &[
    Approach {
        guidance: "Prefer Python built-ins (sum, max, min, sorted, len) over hand-written logic",
        keywords: &["sum", "max", "min", "sort", "average", "mean", "count", "total"],
    },
    Approach {
        guidance: "Iterate explicitly and keep intermediate state in local variables",
        keywords: &["each", "loop", "iterate", "accumulate", "fibonacci", "factorial"],
    },
    Approach {
        guidance: "Treat the argument as text and use str methods",
        keywords: &["text", "string", "word", "character", "reverse", "palindrome"],
    },
    Approach {
        guidance: "Check the shape of the argument before computing and fail with a clear message",
        keywords: &["validate", "check", "parse", "dict", "json"],
    },
];

const REFINEMENTS: &[&str] = &[
    "Handle empty input without raising",
    "Return exactly the annotated type",
    "Avoid recursion and unbounded loops",
];

pub struct Planner {
    confidence_threshold: f64,
    search_width: usize,
    search_depth: usize,
    episodic_limit: usize,
    memory: Arc<EpisodicMemory>,
}

impl Planner {
    pub fn new(config: &AgentConfig, memory: Arc<EpisodicMemory>) -> Self {
        Self {
            confidence_threshold: config.agent.confidence_threshold,
            search_width: config.planner.search_width.max(1),
            search_depth: config.planner.search_depth.max(1),
            episodic_limit: config.planner.episodic_limit,
            memory,
        }
    }

    pub fn memory(&self) -> &Arc<EpisodicMemory> {
        &self.memory
    }

    /// Confidence that a single direct synthesis will succeed.
    ///
    /// Starts at 0.75, rises with recorded successes for the same task, and
    /// drops with each recorded failure.
    pub fn direct_confidence(&self, fingerprint: &Fingerprint) -> f64 {
        let (successes, failures) = self.memory.counts(fingerprint);
        let mut confidence = 0.75;
        if successes > 0 {
            confidence += 0.1;
        }
        confidence -= 0.15 * failures as f64;
        confidence.clamp(0.05, 0.95)
    }

    /// Strategy for the next plan. Never below `ctx.floor`.
    pub fn select(&self, ctx: &PlanContext<'_>, direct_confidence: f64) -> Strategy {
        let searched = ctx.floor >= Some(Strategy::MultiPathSearch);
        let rule = if ctx.last_fault.is_some() && searched {
            Strategy::ReflectiveRetry
        } else if ctx.retry_count > 0 || direct_confidence < self.confidence_threshold {
            Strategy::MultiPathSearch
        } else {
            Strategy::Direct
        };
        ctx.floor.map_or(rule, |floor| rule.max(floor))
    }

    pub fn plan(&self, task: &TaskRequest, ctx: &PlanContext<'_>) -> PlanStep {
        let fingerprint = Fingerprint::of(&task.description);
        let direct = self.direct_confidence(&fingerprint);
        let strategy = self.select(ctx, direct);
        let base = SynthesisSpec::new(&task.description, task.io.clone(), strategy);

        let step = match strategy {
            Strategy::Direct => PlanStep {
                strategy,
                spec: base,
                confidence: direct,
                explored: 1,
            },
            Strategy::MultiPathSearch => self.multi_path(base, direct),
            Strategy::ReflectiveRetry => self.reflective(base, &fingerprint, direct, ctx.last_fault),
        };
        debug!(
            strategy = %step.strategy,
            confidence = step.confidence,
            explored = step.explored,
            "plan selected"
        );
        step
    }

    /// Score `width x depth` leaves and keep the most confident one.
    fn multi_path(&self, base: SynthesisSpec, direct: f64) -> PlanStep {
        let words = tokenize(&base.task_description);
        let mut best: Option<(f64, u32, Vec<String>)> = None;
        let mut explored = 0;

        for (w, approach) in APPROACHES.iter().cycle().take(self.search_width).enumerate() {
            let relevant = approach
                .keywords
                .iter()
                .any(|k| words.iter().any(|word| word == k));
            for d in 1..=self.search_depth {
                explored += 1;
                let mut score = direct + 0.05 * d as f64 - 0.02 * w as f64;
                if relevant {
                    score += 0.1;
                }
                let score = score.clamp(0.0, 1.0);
                if best.as_ref().map_or(true, |(s, _, _)| score > *s) {
                    let mut guidance = vec![approach.guidance.to_string()];
                    guidance.extend(
                        REFINEMENTS
                            .iter()
                            .cycle()
                            .take(d)
                            .map(|r| (*r).to_string()),
                    );
                    let variant = (w * self.search_depth + d) as u32;
                    best = Some((score, variant, guidance));
                }
            }
        }

        let (confidence, variant, guidance) = best.unwrap_or((direct, 0, Vec::new()));
        let mut spec = base.with_guidance(guidance);
        spec.variant = variant;
        PlanStep {
            strategy: Strategy::MultiPathSearch,
            spec,
            confidence,
            explored,
        }
    }

    /// Fold recorded lessons and the latest fault into the synthesis request.
    fn reflective(
        &self,
        base: SynthesisSpec,
        fingerprint: &Fingerprint,
        direct: f64,
        last_fault: Option<&Fault>,
    ) -> PlanStep {
        let lessons = self.memory.lessons(fingerprint, self.episodic_limit);
        let mut spec = base.with_guidance(lessons);
        if let Some(fault) = last_fault {
            spec = spec.with_feedback(fault.to_string());
        }
        PlanStep {
            strategy: Strategy::ReflectiveRetry,
            confidence: direct.max(0.5),
            explored: 1,
            spec,
        }
    }
}
