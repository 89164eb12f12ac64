//! Storage trait definitions for toolforge
//!
//! - `ToolStore`: durable, per-id storage of tool metadata and artifact source
//! - `ToolId` / `Version`: the `name@major.minor.patch` addressing scheme
//! - `ToolMetadata` / `ToolRecord`: the persisted record types
//!
//! The trait is synchronous and backend-agnostic. An in-memory fake is
//! provided for testing via the `fakes` module.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{StorageError, StorageResult};

// ---------------------------------------------------------------------------
// SourceDigest
// ---------------------------------------------------------------------------

/// SHA-256 hex digest of an artifact's source text.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SourceDigest(String);

impl SourceDigest {
    pub fn of(source: &str) -> Self {
        SourceDigest(hex::encode(Sha256::digest(source.as_bytes())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form (first 12 hex chars).
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl TryFrom<String> for SourceDigest {
    type Error = StorageError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        if s.len() != 64 || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(StorageError::Serialization(format!("invalid digest: {s}")));
        }
        Ok(SourceDigest(s.to_ascii_lowercase()))
    }
}

impl From<SourceDigest> for String {
    fn from(d: SourceDigest) -> Self {
        d.0
    }
}

impl fmt::Display for SourceDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Version
// ---------------------------------------------------------------------------

/// Semantic version of a tool. Ordering is numeric per component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl Version {
    /// Version assigned to the first record of a new name.
    pub const INITIAL: Version = Version {
        major: 0,
        minor: 1,
        patch: 0,
    };

    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    pub fn bump_minor(self) -> Self {
        Self {
            major: self.major,
            minor: self.minor + 1,
            patch: 0,
        }
    }

    pub fn bump_patch(self) -> Self {
        Self {
            patch: self.patch + 1,
            ..self
        }
    }
}

impl FromStr for Version {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('.').collect();
        if parts.len() != 3 {
            return Err(StorageError::InvalidVersion(s.to_string()));
        }
        let parse = |p: &str| {
            p.parse::<u64>()
                .map_err(|_| StorageError::InvalidVersion(s.to_string()))
        };
        Ok(Version::new(parse(parts[0])?, parse(parts[1])?, parse(parts[2])?))
    }
}

impl TryFrom<String> for Version {
    type Error = StorageError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Version> for String {
    fn from(v: Version) -> Self {
        v.to_string()
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

// ---------------------------------------------------------------------------
// ToolId
// ---------------------------------------------------------------------------

/// Tool identifier of the form `name@major.minor.patch`.
///
/// Names are restricted to ASCII alphanumerics and `_` so an id is always a
/// safe single path component.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ToolId {
    name: String,
    version: Version,
}

impl ToolId {
    pub fn new(name: impl Into<String>, version: Version) -> StorageResult<Self> {
        let name = name.into();
        validate_name(&name)?;
        Ok(Self { name, version })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> Version {
        self.version
    }
}

/// Check that `name` is usable as the name half of a [`ToolId`].
pub fn validate_name(name: &str) -> StorageResult<()> {
    let valid = !name.is_empty()
        && name.len() <= 64
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(StorageError::InvalidId(name.to_string()))
    }
}

impl FromStr for ToolId {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, version) = s
            .split_once('@')
            .ok_or_else(|| StorageError::InvalidId(s.to_string()))?;
        let version = version
            .parse()
            .map_err(|_| StorageError::InvalidId(s.to_string()))?;
        ToolId::new(name, version).map_err(|_| StorageError::InvalidId(s.to_string()))
    }
}

impl TryFrom<String> for ToolId {
    type Error = StorageError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<ToolId> for String {
    fn from(id: ToolId) -> Self {
        id.to_string()
    }
}

impl fmt::Display for ToolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Declared calling contract of an artifact, read from its entry point.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactContract {
    /// Name of the public top-level function invoked by the sandbox
    pub entry_point: String,
    /// Annotation text of the first parameter, if any
    pub input_type: Option<String>,
    /// Return annotation text, if any
    pub output_type: Option<String>,
}

/// Everything persisted about a tool except its source text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolMetadata {
    pub id: ToolId,
    pub name: String,
    pub version: Version,
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub contract: ArtifactContract,
    pub source_digest: SourceDigest,
    #[serde(default)]
    pub usage_count: u64,
    pub success_rate: f64,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub deprecated: bool,
    #[serde(default)]
    pub deprecated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub deprecation_reason: Option<String>,
}

/// A registered tool: metadata plus the immutable artifact source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolRecord {
    pub metadata: ToolMetadata,
    pub source: String,
}

impl ToolRecord {
    pub fn id(&self) -> &ToolId {
        &self.metadata.id
    }
}

// ---------------------------------------------------------------------------
// ToolStore
// ---------------------------------------------------------------------------

/// Durable storage of tool records, one unit per [`ToolId`].
///
/// Guarantees:
/// - `insert` never overwrites: a second insert of the same id fails with
///   `StorageError::AlreadyExists`.
/// - The source stored by `insert` is never modified afterwards; only
///   metadata is rewritten by `save_metadata`.
/// - Every mutation is durable when the call returns.
/// - `list_metadata` never reads artifact sources.
pub trait ToolStore: Send + Sync {
    /// Persist a new record.
    fn insert(&self, record: &ToolRecord) -> StorageResult<()>;

    /// Replace the metadata of an existing record. `NotFound` if absent.
    fn save_metadata(&self, metadata: &ToolMetadata) -> StorageResult<()>;

    fn load_metadata(&self, id: &ToolId) -> StorageResult<ToolMetadata>;

    fn load_source(&self, id: &ToolId) -> StorageResult<String>;

    /// Load a full record, checking the source against its recorded digest.
    fn load(&self, id: &ToolId) -> StorageResult<ToolRecord> {
        let metadata = self.load_metadata(id)?;
        let source = self.load_source(id)?;
        let actual = SourceDigest::of(&source);
        if actual != metadata.source_digest {
            return Err(StorageError::DigestMismatch {
                id: id.to_string(),
                expected: metadata.source_digest.to_string(),
                actual: actual.to_string(),
            });
        }
        Ok(ToolRecord { metadata, source })
    }

    /// Metadata of every stored record, in no particular order.
    fn list_metadata(&self) -> StorageResult<Vec<ToolMetadata>>;
}
