//! Tool registry: versioned catalog of artifacts that executed successfully.
//!
//! # Modules
//!
//! - [`search`]: scoring and lazy result iteration
//! - [`stats`]: `SuccessRatePolicy`
//! - [`error`]: `RegistryError` / `RegistryResult`
//!
//! Reads are served from an in-memory metadata snapshot that is swapped
//! whole after every mutation. Writes for one name are serialized by a
//! per-name lock and reach the store before the snapshot changes.

pub mod error;
pub mod search;
pub mod stats;

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use chrono::Utc;
use toolforge_store::fakes::MemoryToolStore;
use toolforge_store::{
    validate_name, FsToolStore, StorageError, ToolId, ToolMetadata, ToolRecord, ToolStore, Version,
};
use tracing::debug;

use crate::config::RegistryConfig;
use crate::domain::ValidatedArtifact;
use crate::obs;
use crate::validation::contract::is_backward_compatible;

pub use error::{RegistryError, RegistryResult};
pub use search::{tokenize, ScoredTool, SearchQuery, SearchResults, SearchWeights};
pub use stats::SuccessRatePolicy;

type Index = BTreeMap<ToolId, ToolMetadata>;

/// Caller-supplied metadata for a registration.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTool {
    pub name: String,
    pub description: String,
    pub tags: Vec<String>,
}

impl NewTool {
    /// Tags default to the description's content words.
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        let description = description.into();
        Self {
            name: name.into(),
            tags: tokenize(&description),
            description,
        }
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }
}

pub struct ToolRegistry {
    store: Arc<dyn ToolStore>,
    config: RegistryConfig,
    index: RwLock<Arc<Index>>,
    name_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.snapshot().len())
            .finish()
    }
}

fn not_found(id: &ToolId) -> impl FnOnce(StorageError) -> RegistryError + '_ {
    move |e| match e {
        StorageError::NotFound { .. } => RegistryError::NotFound(id.to_string()),
        other => RegistryError::Storage(other),
    }
}

impl ToolRegistry {
    /// Open over `store`, loading every persisted record's metadata.
    pub fn open(store: Arc<dyn ToolStore>, config: RegistryConfig) -> RegistryResult<Self> {
        let index: Index = store
            .list_metadata()?
            .into_iter()
            .map(|m| (m.id.clone(), m))
            .collect();
        debug!(tools = index.len(), "registry opened");
        Ok(Self {
            store,
            config,
            index: RwLock::new(Arc::new(index)),
            name_locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn open_dir(root: impl AsRef<Path>, config: RegistryConfig) -> RegistryResult<Self> {
        let store = FsToolStore::open(root)?;
        Self::open(Arc::new(store), config)
    }

    pub fn in_memory(config: RegistryConfig) -> Self {
        Self {
            store: Arc::new(MemoryToolStore::new()),
            config,
            index: RwLock::new(Arc::new(Index::new())),
            name_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Registry from config: on disk when `path` is set, else in memory.
    pub fn from_config(config: RegistryConfig) -> RegistryResult<Self> {
        match config.path.clone() {
            Some(path) => Self::open_dir(path, config),
            None => Ok(Self::in_memory(config)),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    fn snapshot(&self) -> Arc<Index> {
        Arc::clone(&self.index.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn publish(&self, metadata: ToolMetadata) {
        let mut guard = self.index.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = Index::clone(&guard);
        next.insert(metadata.id.clone(), metadata);
        *guard = Arc::new(next);
    }

    /// Run `f` holding the write lock for `name`. The lock entry is dropped
    /// from the table once no other caller holds or waits on it.
    fn with_name_lock<T>(
        &self,
        name: &str,
        f: impl FnOnce() -> RegistryResult<T>,
    ) -> RegistryResult<T> {
        let lock = {
            let mut locks = self.name_locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(name.to_string()).or_default())
        };
        let out = {
            let _held = lock.lock().unwrap_or_else(PoisonError::into_inner);
            f()
        };

        let mut locks = self.name_locks.lock().unwrap_or_else(PoisonError::into_inner);
        drop(lock);
        if locks.get(name).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(name);
        }
        out
    }

    #[cfg(test)]
    fn name_lock_entries(&self) -> usize {
        self.name_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Re-read one name's records from the store into the snapshot.
    fn refresh_name(&self, name: &str) -> RegistryResult<()> {
        let fresh: Vec<ToolMetadata> = self
            .store
            .list_metadata()?
            .into_iter()
            .filter(|m| m.name == name)
            .collect();
        for metadata in fresh {
            self.publish(metadata);
        }
        Ok(())
    }

    /// Register a validated artifact under `tool.name`.
    ///
    /// A new name starts at `0.1.0`. Against the latest version, a
    /// compatible contract bumps the patch and an incompatible one bumps the
    /// minor. Registering the latest version's exact source and contract
    /// again returns that record unchanged.
    pub fn register(
        &self,
        artifact: &ValidatedArtifact,
        tool: NewTool,
    ) -> RegistryResult<ToolRecord> {
        validate_name(&tool.name).map_err(|_| RegistryError::InvalidName(tool.name.clone()))?;
        let name = tool.name.clone();
        self.with_name_lock(&name, || self.register_locked(artifact, tool))
    }

    fn register_locked(
        &self,
        artifact: &ValidatedArtifact,
        tool: NewTool,
    ) -> RegistryResult<ToolRecord> {
        let latest = self.latest_including_deprecated(&tool.name);
        let version = match &latest {
            None => Version::INITIAL,
            Some(prev) => {
                if prev.source_digest == *artifact.digest() && prev.contract == *artifact.contract()
                {
                    debug!(tool_id = %prev.id, "identical artifact already registered");
                    return Ok(self.store.load(&prev.id)?);
                }
                if is_backward_compatible(&prev.contract, artifact.contract()) {
                    prev.version.bump_patch()
                } else {
                    prev.version.bump_minor()
                }
            }
        };

        let id = ToolId::new(&tool.name, version)
            .map_err(|_| RegistryError::InvalidName(tool.name.clone()))?;
        let record = ToolRecord {
            metadata: ToolMetadata {
                id: id.clone(),
                name: tool.name.clone(),
                version,
                description: tool.description,
                tags: tool.tags,
                contract: artifact.contract().clone(),
                source_digest: artifact.digest().clone(),
                usage_count: 0,
                success_rate: 1.0,
                created_at: Utc::now(),
                deprecated: false,
                deprecated_at: None,
                deprecation_reason: None,
            },
            source: artifact.source().to_string(),
        };

        match self.store.insert(&record) {
            Ok(()) => {}
            Err(StorageError::AlreadyExists { .. }) => {
                // Another process wrote this version; pick up its records.
                self.refresh_name(&tool.name)?;
                return Err(RegistryError::Conflict {
                    name: tool.name,
                    version: version.to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        }

        self.publish(record.metadata.clone());
        obs::emit_tool_registered(&id.to_string(), record.metadata.source_digest.as_str());
        Ok(record)
    }

    pub fn get(&self, id: &ToolId) -> RegistryResult<ToolRecord> {
        self.store.load(id).map_err(not_found(id))
    }

    pub fn get_metadata(&self, id: &ToolId) -> RegistryResult<ToolMetadata> {
        self.snapshot()
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    pub fn search(&self, query: &SearchQuery) -> SearchResults {
        let snapshot = self.snapshot();
        let hits = search::rank(
            snapshot.values(),
            query,
            &self.config.weights,
            self.config.recency_half_life_days,
            Utc::now(),
        );
        SearchResults::new(Arc::clone(&self.store), hits)
    }

    /// Record one use of `id`.
    pub fn update_stats(&self, id: &ToolId, success: bool) -> RegistryResult<ToolMetadata> {
        self.mutate(id, |meta| {
            meta.success_rate =
                self.config
                    .success_rate
                    .apply(meta.success_rate, meta.usage_count, success);
            meta.usage_count += 1;
        })
    }

    /// Mark `id` deprecated. It stays retrievable by `get`.
    pub fn deprecate(&self, id: &ToolId, reason: Option<String>) -> RegistryResult<ToolMetadata> {
        self.mutate(id, |meta| {
            if !meta.deprecated {
                meta.deprecated = true;
                meta.deprecated_at = Some(Utc::now());
                meta.deprecation_reason = reason;
            }
        })
    }

    fn mutate(
        &self,
        id: &ToolId,
        change: impl FnOnce(&mut ToolMetadata),
    ) -> RegistryResult<ToolMetadata> {
        self.with_name_lock(id.name(), || {
            let mut metadata = self.store.load_metadata(id).map_err(not_found(id))?;
            change(&mut metadata);
            self.store.save_metadata(&metadata)?;
            self.publish(metadata.clone());
            Ok(metadata)
        })
    }

    /// Metadata of every tool, ordered by id.
    pub fn list(&self, include_deprecated: bool) -> Vec<ToolMetadata> {
        self.snapshot()
            .values()
            .filter(|m| include_deprecated || !m.deprecated)
            .cloned()
            .collect()
    }

    /// Every version of `name`, oldest first.
    pub fn versions(&self, name: &str) -> Vec<ToolMetadata> {
        let mut versions: Vec<ToolMetadata> = self
            .snapshot()
            .values()
            .filter(|m| m.name == name)
            .cloned()
            .collect();
        versions.sort_by_key(|m| m.version);
        versions
    }

    /// Highest non-deprecated version of `name`.
    pub fn latest(&self, name: &str) -> Option<ToolMetadata> {
        self.versions(name).into_iter().rev().find(|m| !m.deprecated)
    }

    fn latest_including_deprecated(&self, name: &str) -> Option<ToolMetadata> {
        self.versions(name).pop()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{CandidateArtifact, IoSpec, Provenance};
    use crate::planner::Strategy;
    use crate::validation::ValidationPipeline;

    fn validated(source: &str) -> ValidatedArtifact {
        let candidate = CandidateArtifact::new(
            source,
            Provenance {
                strategy: Strategy::Direct,
                attempt: 1,
                repair: 0,
            },
        );
        ValidationPipeline::default()
            .validate(&candidate, &IoSpec::default())
            .approve(&candidate)
            .unwrap()
    }

    const SUM: &str = "def sum_list(numbers: list) -> int:\n    return sum(numbers)\n";

    #[test]
    fn first_registration_is_initial_version() {
        let registry = ToolRegistry::in_memory(RegistryConfig::default());
        let record = registry
            .register(&validated(SUM), NewTool::new("sum_list", "sum of a list"))
            .unwrap();
        assert_eq!(record.metadata.version, Version::INITIAL);
        assert_eq!(record.id().to_string(), "sum_list@0.1.0");
        assert_eq!(record.metadata.usage_count, 0);
        assert!(!record.metadata.tags.is_empty());
    }

    #[test]
    fn idle_name_locks_are_released() {
        let registry = ToolRegistry::in_memory(RegistryConfig::default());
        for name in ["sum_list", "sum_list_b", "sum_list_c"] {
            let record = registry
                .register(&validated(SUM), NewTool::new(name, "sum of a list"))
                .unwrap();
            registry.update_stats(record.id(), true).unwrap();
        }
        assert_eq!(registry.len(), 3);
        assert_eq!(registry.name_lock_entries(), 0);
    }

    #[test]
    fn identical_registration_is_idempotent() {
        let registry = ToolRegistry::in_memory(RegistryConfig::default());
        let a = registry
            .register(&validated(SUM), NewTool::new("sum_list", "sum"))
            .unwrap();
        let b = registry
            .register(&validated(SUM), NewTool::new("sum_list", "sum"))
            .unwrap();
        assert_eq!(a.id(), b.id());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn invalid_name_is_rejected() {
        let registry = ToolRegistry::in_memory(RegistryConfig::default());
        let err = registry
            .register(&validated(SUM), NewTool::new("../etc", "sum"))
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidName(_)));
    }

    #[test]
    fn update_stats_counts_uses() {
        let registry = ToolRegistry::in_memory(RegistryConfig {
            success_rate: SuccessRatePolicy::RunningAverage,
            ..RegistryConfig::default()
        });
        let record = registry
            .register(&validated(SUM), NewTool::new("sum_list", "sum"))
            .unwrap();
        registry.update_stats(record.id(), true).unwrap();
        let meta = registry.update_stats(record.id(), false).unwrap();
        assert_eq!(meta.usage_count, 2);
        assert!((meta.success_rate - 0.5).abs() < 1e-12);
        assert_eq!(registry.get_metadata(record.id()).unwrap(), meta);
    }

    #[test]
    fn deprecated_tool_still_retrievable() {
        let registry = ToolRegistry::in_memory(RegistryConfig::default());
        let record = registry
            .register(&validated(SUM), NewTool::new("sum_list", "sum of numbers"))
            .unwrap();
        registry
            .deprecate(record.id(), Some("superseded".into()))
            .unwrap();

        assert!(registry.get(record.id()).unwrap().metadata.deprecated);
        assert!(registry.list(false).is_empty());
        assert_eq!(registry.list(true).len(), 1);
        assert!(registry.latest("sum_list").is_none());
        assert!(registry.search(&SearchQuery::new("sum numbers")).is_empty());
    }

    #[test]
    fn unknown_id_is_not_found() {
        let registry = ToolRegistry::in_memory(RegistryConfig::default());
        let id: ToolId = "missing@0.1.0".parse().unwrap();
        assert!(matches!(registry.get(&id), Err(RegistryError::NotFound(_))));
        assert!(matches!(
            registry.update_stats(&id, true),
            Err(RegistryError::NotFound(_))
        ));
    }
}
