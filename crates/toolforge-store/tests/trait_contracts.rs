//! Trait contract tests for ToolStore.
//!
//! Every check runs against both the in-memory fake and the filesystem
//! store. Any conforming implementation must pass these.

use chrono::Utc;
use toolforge_store::fakes::MemoryToolStore;
use toolforge_store::{
    ArtifactContract, FsToolStore, SourceDigest, StorageError, ToolId, ToolMetadata, ToolRecord,
    ToolStore, Version,
};

fn record(name: &str, version: Version, source: &str) -> ToolRecord {
    ToolRecord {
        metadata: ToolMetadata {
            id: ToolId::new(name, version).unwrap(),
            name: name.to_string(),
            version,
            description: format!("{name} tool"),
            tags: vec![],
            contract: ArtifactContract {
                entry_point: name.to_string(),
                input_type: None,
                output_type: None,
            },
            source_digest: SourceDigest::of(source),
            usage_count: 0,
            success_rate: 1.0,
            created_at: Utc::now(),
            deprecated: false,
            deprecated_at: None,
            deprecation_reason: None,
        },
        source: source.to_string(),
    }
}

fn with_each_store(check: impl Fn(&dyn ToolStore)) {
    check(&MemoryToolStore::new());

    let dir = tempfile::tempdir().unwrap();
    let fs = FsToolStore::open(dir.path()).unwrap();
    check(&fs);
}

// ===========================================================================
// insert / load
// ===========================================================================

#[test]
fn insert_then_load_round_trip() {
    with_each_store(|store| {
        let rec = record("sum_list", Version::INITIAL, "def sum_list(x):\n    return sum(x)\n");
        store.insert(&rec).unwrap();
        assert_eq!(store.load(rec.id()).unwrap(), rec);
        assert_eq!(store.load_source(rec.id()).unwrap(), rec.source);
    });
}

#[test]
fn insert_same_id_twice_conflicts() {
    with_each_store(|store| {
        let rec = record("dup", Version::INITIAL, "def dup(x): return x\n");
        store.insert(&rec).unwrap();

        let mut other = record("dup", Version::INITIAL, "def dup(x): return 2 * x\n");
        other.metadata.description = "different".to_string();
        let err = store.insert(&other).unwrap_err();
        assert!(matches!(err, StorageError::AlreadyExists { .. }));

        // First writer's artifact is untouched.
        assert_eq!(store.load(rec.id()).unwrap().source, rec.source);
    });
}

#[test]
fn load_missing_is_not_found() {
    with_each_store(|store| {
        let id = ToolId::new("ghost", Version::INITIAL).unwrap();
        assert!(matches!(
            store.load(&id),
            Err(StorageError::NotFound { .. })
        ));
        assert!(matches!(
            store.load_metadata(&id),
            Err(StorageError::NotFound { .. })
        ));
    });
}

// ===========================================================================
// save_metadata
// ===========================================================================

#[test]
fn save_metadata_updates_only_metadata() {
    with_each_store(|store| {
        let rec = record("count", Version::INITIAL, "def count(x): return len(x)\n");
        store.insert(&rec).unwrap();

        let mut meta = rec.metadata.clone();
        meta.usage_count = 7;
        meta.success_rate = 0.5;
        meta.deprecated = true;
        store.save_metadata(&meta).unwrap();

        let loaded = store.load(rec.id()).unwrap();
        assert_eq!(loaded.metadata.usage_count, 7);
        assert!(loaded.metadata.deprecated);
        assert_eq!(loaded.source, rec.source);
    });
}

#[test]
fn save_metadata_for_missing_is_not_found() {
    with_each_store(|store| {
        let rec = record("nope", Version::INITIAL, "def nope(x): return x\n");
        assert!(matches!(
            store.save_metadata(&rec.metadata),
            Err(StorageError::NotFound { .. })
        ));
    });
}

// ===========================================================================
// list_metadata
// ===========================================================================

#[test]
fn list_returns_every_version() {
    with_each_store(|store| {
        store
            .insert(&record("a", Version::INITIAL, "def a(x): return x\n"))
            .unwrap();
        store
            .insert(&record("a", Version::new(0, 1, 1), "def a(x): return x + 0\n"))
            .unwrap();
        store
            .insert(&record("b", Version::INITIAL, "def b(x): return x\n"))
            .unwrap();

        let mut ids: Vec<String> = store
            .list_metadata()
            .unwrap()
            .into_iter()
            .map(|m| m.id.to_string())
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["a@0.1.0", "a@0.1.1", "b@0.1.0"]);
    });
}

#[test]
fn list_empty_store() {
    with_each_store(|store| {
        assert!(store.list_metadata().unwrap().is_empty());
    });
}
