//! Episodic memory of outcomes per task fingerprint.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::domain::{Fault, FaultKind};

/// SHA-256 hex of a normalized task description.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Case and whitespace differences do not change the fingerprint.
    pub fn of(description: &str) -> Self {
        let normalized = description
            .split_whitespace()
            .map(str::to_lowercase)
            .collect::<Vec<_>>()
            .join(" ");
        Self(hex::encode(Sha256::digest(normalized.as_bytes())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0[..12.min(self.0.len())])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Episode {
    pub outcome: Outcome,
    pub fault_kind: Option<FaultKind>,
    /// What to avoid next time. Only failures carry one.
    pub lesson: Option<String>,
    pub at: DateTime<Utc>,
}

/// Fingerprints kept by [`EpisodicMemory::new`].
pub const DEFAULT_FINGERPRINTS: usize = 4096;

#[derive(Debug, Default)]
struct Slot {
    touched: u64,
    episodes: VecDeque<Episode>,
}

#[derive(Debug, Default)]
struct Episodes {
    clock: u64,
    slots: HashMap<Fingerprint, Slot>,
}

/// Process-wide, bounded per fingerprint and in the number of fingerprints.
/// Oldest episodes are evicted first; past the fingerprint cap the least
/// recently touched fingerprint goes.
#[derive(Debug)]
pub struct EpisodicMemory {
    limit: usize,
    fingerprints: usize,
    inner: Mutex<Episodes>,
}

impl Default for EpisodicMemory {
    fn default() -> Self {
        Self::new(5)
    }
}

impl EpisodicMemory {
    pub fn new(limit: usize) -> Self {
        Self::with_capacity(limit, DEFAULT_FINGERPRINTS)
    }

    pub fn with_capacity(limit: usize, fingerprints: usize) -> Self {
        Self {
            limit: limit.max(1),
            fingerprints: fingerprints.max(1),
            inner: Mutex::new(Episodes::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Episodes> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, fingerprint: &Fingerprint, episode: Episode) {
        let mut inner = self.lock();
        inner.clock += 1;
        let now = inner.clock;

        if !inner.slots.contains_key(fingerprint) && inner.slots.len() >= self.fingerprints {
            let stalest = inner
                .slots
                .iter()
                .min_by_key(|(_, slot)| slot.touched)
                .map(|(fp, _)| fp.clone());
            if let Some(stalest) = stalest {
                inner.slots.remove(&stalest);
            }
        }

        let slot = inner.slots.entry(fingerprint.clone()).or_default();
        slot.touched = now;
        slot.episodes.push_back(episode);
        while slot.episodes.len() > self.limit {
            slot.episodes.pop_front();
        }
    }

    /// Number of fingerprints with at least one episode.
    pub fn len(&self) -> usize {
        self.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn record_success(&self, fingerprint: &Fingerprint) {
        self.push(
            fingerprint,
            Episode {
                outcome: Outcome::Success,
                fault_kind: None,
                lesson: None,
                at: Utc::now(),
            },
        );
    }

    pub fn record_failure(&self, fingerprint: &Fingerprint, fault: &Fault) {
        let kind = fault.kind();
        self.push(
            fingerprint,
            Episode {
                outcome: Outcome::Failure,
                fault_kind: Some(kind),
                lesson: Some(format!("Avoid {kind} in similar tasks: {fault}")),
                at: Utc::now(),
            },
        );
    }

    /// Most recent episodes first, at most `limit`.
    pub fn relevant(&self, fingerprint: &Fingerprint, limit: usize) -> Vec<Episode> {
        self.lock()
            .slots
            .get(fingerprint)
            .map(|slot| slot.episodes.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default()
    }

    /// Lessons from recent failures, most recent first.
    pub fn lessons(&self, fingerprint: &Fingerprint, limit: usize) -> Vec<String> {
        self.relevant(fingerprint, limit)
            .into_iter()
            .filter_map(|e| e.lesson)
            .collect()
    }

    pub fn counts(&self, fingerprint: &Fingerprint) -> (usize, usize) {
        self.lock()
            .slots
            .get(fingerprint)
            .map(|slot| {
                let q = &slot.episodes;
                let successes = q.iter().filter(|e| e.outcome == Outcome::Success).count();
                (successes, q.len() - successes)
            })
            .unwrap_or((0, 0))
    }
}
