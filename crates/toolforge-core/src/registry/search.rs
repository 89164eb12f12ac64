//! Registry search: lexical overlap, recency, and success rate.
//!
//! Scores are computed from the in-memory metadata index only. Sources are
//! loaded lazily, one per item, when a caller iterates the results.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use toolforge_store::{StorageResult, ToolMetadata, ToolRecord, ToolStore};

use crate::domain::{IoSpec, IoType};

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "by", "compute", "for", "from", "given", "in", "is", "of", "on",
    "return", "returns", "the", "to", "with",
];

/// Relative weights of the score components.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchWeights {
    pub lexical: f64,
    pub recency: f64,
    pub success: f64,
    /// Share of the lexical score contributed by the name.
    pub name: f64,
    pub description: f64,
    pub tags: f64,
}

impl Default for SearchWeights {
    fn default() -> Self {
        Self {
            lexical: 0.6,
            recency: 0.2,
            success: 0.2,
            name: 0.5,
            description: 0.3,
            tags: 0.2,
        }
    }
}

/// Lowercased content words with plural `s` stripped.
pub fn tokenize(text: &str) -> Vec<String> {
    let mut seen = BTreeSet::new();
    text.split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_ascii_lowercase())
        .filter(|t| !STOPWORDS.contains(&t.as_str()))
        .map(|t| {
            if t.len() > 3 && t.ends_with('s') && !t.ends_with("ss") {
                t[..t.len() - 1].to_string()
            } else {
                t
            }
        })
        .filter(|t| seen.insert(t.clone()))
        .collect()
}

fn overlap(query: &[String], field: &[String]) -> f64 {
    if query.is_empty() {
        return 0.0;
    }
    let hits = query.iter().filter(|q| field.contains(q)).count();
    hits as f64 / query.len() as f64
}

/// A search request.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchQuery {
    pub text: String,
    pub io: Option<IoSpec>,
    pub limit: usize,
    pub include_deprecated: bool,
}

impl SearchQuery {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            io: None,
            limit: 10,
            include_deprecated: false,
        }
    }

    pub fn with_io(mut self, io: IoSpec) -> Self {
        if !io.is_empty() {
            self.io = Some(io);
        }
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn include_deprecated(mut self, include: bool) -> Self {
        self.include_deprecated = include;
        self
    }
}

fn slot_matches(expected: Option<&IoType>, declared: Option<&str>) -> bool {
    match (expected, declared) {
        (None, _) | (_, None) => true,
        (Some(expected), Some(declared)) => expected.accepts(&IoType::parse(declared)),
    }
}

fn io_matches(meta: &ToolMetadata, io: &IoSpec) -> bool {
    slot_matches(io.input_type.as_ref(), meta.contract.input_type.as_deref())
        && slot_matches(io.output_type.as_ref(), meta.contract.output_type.as_deref())
}

/// One ranked hit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredTool {
    pub metadata: ToolMetadata,
    pub score: f64,
    pub lexical: f64,
}

/// Score a tool against query tokens. `None` when nothing matches lexically.
pub fn score(
    meta: &ToolMetadata,
    query: &[String],
    weights: &SearchWeights,
    half_life_days: f64,
    now: DateTime<Utc>,
) -> Option<ScoredTool> {
    let lexical = if query.is_empty() {
        0.0
    } else {
        let name = tokenize(&meta.name);
        let description = tokenize(&meta.description);
        let tags: Vec<String> = meta.tags.iter().flat_map(|t| tokenize(t)).collect();
        weights.name * overlap(query, &name)
            + weights.description * overlap(query, &description)
            + weights.tags * overlap(query, &tags)
    };
    if !query.is_empty() && lexical <= 0.0 {
        return None;
    }
    let age_days = (now - meta.created_at).num_seconds().max(0) as f64 / 86_400.0;
    let recency = if half_life_days > 0.0 {
        0.5f64.powf(age_days / half_life_days)
    } else {
        1.0
    };
    let score = weights.lexical * lexical
        + weights.recency * recency
        + weights.success * meta.success_rate;
    Some(ScoredTool {
        metadata: meta.clone(),
        score,
        lexical,
    })
}

/// Rank candidate metadata for `query`. An empty query ranks everything.
pub fn rank<'a>(
    candidates: impl IntoIterator<Item = &'a ToolMetadata>,
    query: &SearchQuery,
    weights: &SearchWeights,
    half_life_days: f64,
    now: DateTime<Utc>,
) -> Vec<ScoredTool> {
    let tokens = tokenize(&query.text);
    let mut hits: Vec<ScoredTool> = candidates
        .into_iter()
        .filter(|m| query.include_deprecated || !m.deprecated)
        .filter(|m| query.io.as_ref().map_or(true, |io| io_matches(m, io)))
        .filter_map(|m| score(m, &tokens, weights, half_life_days, now))
        .collect();
    hits.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| b.metadata.version.cmp(&a.metadata.version))
            .then_with(|| a.metadata.id.cmp(&b.metadata.id))
    });
    hits.truncate(query.limit);
    hits
}

/// Ranked hits over a store. Finite, bounded by the query limit, and
/// restartable: each call to [`iter`](Self::iter) starts from the top.
pub struct SearchResults {
    store: Arc<dyn ToolStore>,
    hits: Vec<ScoredTool>,
}

impl SearchResults {
    pub(crate) fn new(store: Arc<dyn ToolStore>, hits: Vec<ScoredTool>) -> Self {
        Self { store, hits }
    }

    /// Ranked metadata, without loading any source.
    pub fn hits(&self) -> &[ScoredTool] {
        &self.hits
    }

    pub fn len(&self) -> usize {
        self.hits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }

    pub fn first(&self) -> Option<&ScoredTool> {
        self.hits.first()
    }

    /// Lazily load full records in rank order.
    pub fn iter(&self) -> impl Iterator<Item = (f64, StorageResult<ToolRecord>)> + '_ {
        self.hits
            .iter()
            .map(move |hit| (hit.score, self.store.load(&hit.metadata.id)))
    }
}
