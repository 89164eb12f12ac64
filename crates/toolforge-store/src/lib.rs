//! toolforge-store: durable storage for synthesized tools
//!
//! This crate is the persistence layer of toolforge. It owns the on-disk
//! format of tool records and nothing else: versioning, search, and stats
//! policy live in `toolforge-core`'s registry.
//!
//! ## Layer 0 - Data/Persistence
//!
//! Focus: atomic writes, immutable artifacts, listing without loading sources.
//!
//! ## Key Components
//!
//! - `ToolStore`: backend-agnostic storage trait
//! - `FsToolStore`: one directory per tool id, `metadata.json` + `artifact.py`
//! - `MemoryToolStore`: in-memory fake for tests

mod error;
pub mod fakes;
mod fs_store;
pub mod storage_traits;

pub use error::{StorageError, StorageResult};
pub use fs_store::FsToolStore;
pub use storage_traits::{
    validate_name, ArtifactContract, SourceDigest, ToolId, ToolMetadata, ToolRecord, ToolStore,
    Version,
};
