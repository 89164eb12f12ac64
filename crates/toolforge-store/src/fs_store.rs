use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::error::{StorageError, StorageResult};
use crate::storage_traits::{ToolId, ToolMetadata, ToolRecord, ToolStore};

const METADATA_FILE: &str = "metadata.json";
const ARTIFACT_FILE: &str = "artifact.py";

/// Filesystem-backed tool store.
///
/// Layout: `<root>/tools/<name@version>/{metadata.json, artifact.py}`.
///
/// `metadata.json` is written last and acts as the commit marker: a tool
/// directory without it is an interrupted insert and is ignored by listing.
pub struct FsToolStore {
    tools_dir: PathBuf,
}

impl FsToolStore {
    /// Open a store rooted at `root`. Creates `root/tools/` if needed.
    pub fn open(root: impl AsRef<Path>) -> StorageResult<Self> {
        let tools_dir = root.as_ref().join("tools");
        fs::create_dir_all(&tools_dir)?;
        Ok(Self { tools_dir })
    }

    pub fn tools_dir(&self) -> &Path {
        &self.tools_dir
    }

    fn tool_dir(&self, id: &ToolId) -> PathBuf {
        self.tools_dir.join(id.to_string())
    }

    fn not_found(id: &ToolId) -> impl Fn(std::io::Error) -> StorageError + '_ {
        move |e| {
            if e.kind() == ErrorKind::NotFound {
                StorageError::NotFound { id: id.to_string() }
            } else {
                StorageError::Io(e)
            }
        }
    }
}

/// Atomic write: temp file in the same directory, fsync, rename, fsync dir.
fn write_atomic(dir: &Path, file_name: &str, data: &[u8]) -> StorageResult<()> {
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(dir.join(file_name)).map_err(|e| e.error)?;
    sync_dir(dir)
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> StorageResult<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> StorageResult<()> {
    Ok(())
}

impl ToolStore for FsToolStore {
    fn insert(&self, record: &ToolRecord) -> StorageResult<()> {
        let id = record.id();
        let dir = self.tool_dir(id);

        // create_dir (not create_dir_all) makes the id claim exclusive.
        match fs::create_dir(&dir) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                if dir.join(METADATA_FILE).exists() {
                    return Err(StorageError::AlreadyExists { id: id.to_string() });
                }
                warn!(tool_id = %id, "reclaiming interrupted tool directory");
            }
            Err(e) => return Err(e.into()),
        }
        sync_dir(&self.tools_dir)?;

        write_atomic(&dir, ARTIFACT_FILE, record.source.as_bytes())?;
        let metadata = serde_json::to_vec_pretty(&record.metadata)?;
        write_atomic(&dir, METADATA_FILE, &metadata)?;

        debug!(tool_id = %id, digest = %record.metadata.source_digest.short(), "tool inserted");
        Ok(())
    }

    fn save_metadata(&self, metadata: &ToolMetadata) -> StorageResult<()> {
        let dir = self.tool_dir(&metadata.id);
        if !dir.join(METADATA_FILE).exists() {
            return Err(StorageError::NotFound {
                id: metadata.id.to_string(),
            });
        }
        let data = serde_json::to_vec_pretty(metadata)?;
        write_atomic(&dir, METADATA_FILE, &data)
    }

    fn load_metadata(&self, id: &ToolId) -> StorageResult<ToolMetadata> {
        let path = self.tool_dir(id).join(METADATA_FILE);
        let data = fs::read(&path).map_err(Self::not_found(id))?;
        Ok(serde_json::from_slice(&data)?)
    }

    fn load_source(&self, id: &ToolId) -> StorageResult<String> {
        let dir = self.tool_dir(id);
        if !dir.join(METADATA_FILE).exists() {
            return Err(StorageError::NotFound { id: id.to_string() });
        }
        fs::read_to_string(dir.join(ARTIFACT_FILE)).map_err(Self::not_found(id))
    }

    fn list_metadata(&self) -> StorageResult<Vec<ToolMetadata>> {
        let mut out = Vec::new();
        for entry in fs::read_dir(&self.tools_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let path = entry.path().join(METADATA_FILE);
            let data = match fs::read(&path) {
                Ok(data) => data,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            match serde_json::from_slice::<ToolMetadata>(&data) {
                Ok(meta) => out.push(meta),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable metadata"),
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage_traits::{ArtifactContract, SourceDigest, Version};
    use chrono::Utc;

    fn make_store() -> (tempfile::TempDir, FsToolStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FsToolStore::open(dir.path()).unwrap();
        (dir, store)
    }

    fn record(name: &str, version: Version, source: &str) -> ToolRecord {
        let id = ToolId::new(name, version).unwrap();
        ToolRecord {
            metadata: ToolMetadata {
                id,
                name: name.to_string(),
                version,
                description: "test tool".to_string(),
                tags: vec!["test".to_string()],
                contract: ArtifactContract {
                    entry_point: name.to_string(),
                    input_type: Some("list".to_string()),
                    output_type: Some("int".to_string()),
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

    #[test]
    fn layout_on_disk() {
        let (dir, store) = make_store();
        let rec = record("sum_list", Version::INITIAL, "def sum_list(x): return sum(x)\n");
        store.insert(&rec).unwrap();

        let tool_dir = dir.path().join("tools").join("sum_list@0.1.0");
        assert!(tool_dir.join("metadata.json").is_file());
        assert_eq!(
            fs::read_to_string(tool_dir.join("artifact.py")).unwrap(),
            rec.source
        );
    }

    #[test]
    fn no_temp_files_left_behind() {
        let (dir, store) = make_store();
        let rec = record("sum_list", Version::INITIAL, "def sum_list(x): return sum(x)\n");
        store.insert(&rec).unwrap();
        store.save_metadata(&rec.metadata).unwrap();

        let tool_dir = dir.path().join("tools").join("sum_list@0.1.0");
        let mut names: Vec<String> = fs::read_dir(tool_dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, vec!["artifact.py", "metadata.json"]);
    }

    #[test]
    fn interrupted_insert_is_invisible_and_reclaimable() {
        let (dir, store) = make_store();
        let rec = record("half", Version::INITIAL, "def half(x): return x / 2\n");
        let tool_dir = dir.path().join("tools").join("half@0.1.0");
        fs::create_dir(&tool_dir).unwrap();
        fs::write(tool_dir.join("artifact.py"), "partial").unwrap();

        assert!(store.list_metadata().unwrap().is_empty());
        assert!(matches!(
            store.load_source(rec.id()),
            Err(StorageError::NotFound { .. })
        ));

        store.insert(&rec).unwrap();
        assert_eq!(store.load(rec.id()).unwrap(), rec);
    }

    #[test]
    fn tampered_source_is_detected() {
        let (dir, store) = make_store();
        let rec = record("echo", Version::INITIAL, "def echo(x): return x\n");
        store.insert(&rec).unwrap();
        fs::write(
            dir.path().join("tools").join("echo@0.1.0").join("artifact.py"),
            "def echo(x): return None\n",
        )
        .unwrap();

        assert!(matches!(
            store.load(rec.id()),
            Err(StorageError::DigestMismatch { .. })
        ));
    }

    #[test]
    fn reopen_sees_existing_records() {
        let (dir, store) = make_store();
        store
            .insert(&record("a", Version::INITIAL, "def a(x): return x\n"))
            .unwrap();
        drop(store);

        let reopened = FsToolStore::open(dir.path()).unwrap();
        let listed = reopened.list_metadata().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id.to_string(), "a@0.1.0");
    }
}
