//! Artifact directory management.
//!
//! Layout under the index root:
//!
//! ```text
//! <index_root>/
//!   active/doc-<id>-g<generation>/   committed index generations
//!   staging/<id>-<uuid>/              in-progress builds
//! ```
//!
//! [`FileManager::inspect`] reports the state of each artifact in a
//! directory; recovery classifies damage from that report.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::artifacts::{
    self, ArtifactClass, Checksums, ChunkStats, Manifest, ARTIFACTS, CHECKSUMS, CHUNKS, MANIFEST,
    STATS, VECTORS,
};
use crate::error::StoreError;

const ACTIVE_DIR: &str = "active";
const STAGING_DIR: &str = "staging";
const PROBE_FILE: &str = ".probe";

/// State of one artifact file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactState {
    Ok,
    Missing,
    Empty,
    Invalid(String),
}

impl ArtifactState {
    pub fn is_ok(&self) -> bool {
        matches!(self, ArtifactState::Ok)
    }
}

/// Per-artifact verification of one index directory.
#[derive(Debug, Clone)]
pub struct Inspection {
    pub dir_exists: bool,
    pub artifacts: BTreeMap<&'static str, ArtifactState>,
    /// Parsed manifest, when it was readable.
    pub manifest: Option<Manifest>,
}

impl Inspection {
    pub fn all_ok(&self) -> bool {
        self.dir_exists && self.artifacts.values().all(ArtifactState::is_ok)
    }

    pub fn state(&self, name: &str) -> &ArtifactState {
        self.artifacts.get(name).unwrap_or(&ArtifactState::Missing)
    }

    /// Names of artifacts of `class` that are not ok.
    pub fn bad_of_class(&self, class: ArtifactClass) -> Vec<&'static str> {
        ARTIFACTS
            .iter()
            .filter(|(_, c)| *c == class)
            .map(|(name, _)| *name)
            .filter(|name| !self.state(name).is_ok())
            .collect()
    }

    pub fn missing(&self) -> Vec<String> {
        self.artifacts
            .iter()
            .filter(|(_, s)| matches!(s, ArtifactState::Missing))
            .map(|(n, _)| n.to_string())
            .collect()
    }

    /// Artifacts that exist but failed a check, with the reason.
    pub fn invalid(&self) -> Vec<String> {
        self.artifacts
            .iter()
            .filter_map(|(n, s)| match s {
                ArtifactState::Empty => Some(format!("{n}: empty")),
                ArtifactState::Invalid(reason) => Some(format!("{n}: {reason}")),
                _ => None,
            })
            .collect()
    }
}

/// Filesystem side of the index store.
#[derive(Debug, Clone)]
pub struct FileManager {
    root: PathBuf,
}

impl FileManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn active_dir(&self) -> PathBuf {
        self.root.join(ACTIVE_DIR)
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.root.join(STAGING_DIR)
    }

    /// Create `active/` and `staging/` if missing.
    pub async fn ensure_layout(&self) -> Result<(), StoreError> {
        for dir in [self.active_dir(), self.staging_dir()] {
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|e| StoreError::io(&dir, e))?;
        }
        Ok(())
    }

    /// Whether the storage root can be written to.
    pub async fn is_accessible(&self) -> bool {
        if tokio::fs::create_dir_all(&self.root).await.is_err() {
            return false;
        }
        let probe = self.root.join(PROBE_FILE);
        let ok = tokio::fs::write(&probe, b"ok").await.is_ok();
        let _ = tokio::fs::remove_file(&probe).await;
        ok
    }

    /// Existence plus basic integrity of every artifact in `dir`.
    pub async fn verify_index_files(&self, dir: &Path) -> bool {
        self.inspect(dir).await.all_ok()
    }

    /// Check each artifact: present, non-empty, parseable, consistent with
    /// the manifest, and matching `checksums.json` when that is readable.
    pub async fn inspect(&self, dir: &Path) -> Inspection {
        let mut inspection = Inspection {
            dir_exists: tokio::fs::metadata(dir)
                .await
                .map(|m| m.is_dir())
                .unwrap_or(false),
            artifacts: BTreeMap::new(),
            manifest: None,
        };
        if !inspection.dir_exists {
            for (name, _) in ARTIFACTS {
                inspection.artifacts.insert(name, ArtifactState::Missing);
            }
            return inspection;
        }

        let mut contents: BTreeMap<&'static str, Vec<u8>> = BTreeMap::new();
        for (name, _) in ARTIFACTS {
            let state = match tokio::fs::read(dir.join(name)).await {
                Ok(bytes) if bytes.is_empty() => ArtifactState::Empty,
                Ok(bytes) => {
                    contents.insert(name, bytes);
                    ArtifactState::Ok
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => ArtifactState::Missing,
                Err(e) => ArtifactState::Invalid(format!("unreadable: {e}")),
            };
            inspection.artifacts.insert(name, state);
        }

        let manifest = contents
            .get(MANIFEST)
            .map(|bytes| serde_json::from_slice::<Manifest>(bytes));
        match manifest {
            Some(Ok(m)) => inspection.manifest = Some(m),
            Some(Err(e)) => {
                inspection
                    .artifacts
                    .insert(MANIFEST, ArtifactState::Invalid(e.to_string()));
            }
            None => {}
        }

        if let Some(bytes) = contents.get(VECTORS) {
            let state = match artifacts::read_vectors_header(bytes) {
                Ok(header) => match &inspection.manifest {
                    Some(m) if header.count != m.chunk_count || header.dims != m.dims => {
                        ArtifactState::Invalid(format!(
                            "holds {}×{} but manifest expects {}×{}",
                            header.count, header.dims, m.chunk_count, m.dims
                        ))
                    }
                    _ => ArtifactState::Ok,
                },
                Err(reason) => ArtifactState::Invalid(reason),
            };
            inspection.artifacts.insert(VECTORS, state);
        }

        if let Some(bytes) = contents.get(CHUNKS) {
            let state = match serde_json::from_slice::<Vec<serde_json::Value>>(bytes) {
                Ok(chunks) => match &inspection.manifest {
                    Some(m) if chunks.len() != m.chunk_count => ArtifactState::Invalid(format!(
                        "holds {} chunks but manifest expects {}",
                        chunks.len(),
                        m.chunk_count
                    )),
                    _ => ArtifactState::Ok,
                },
                Err(e) => ArtifactState::Invalid(e.to_string()),
            };
            inspection.artifacts.insert(CHUNKS, state);
        }

        if let Some(bytes) = contents.get(STATS) {
            if let Err(e) = serde_json::from_slice::<ChunkStats>(bytes) {
                inspection
                    .artifacts
                    .insert(STATS, ArtifactState::Invalid(e.to_string()));
            }
        }

        if let Some(bytes) = contents.get(CHECKSUMS) {
            match serde_json::from_slice::<Checksums>(bytes) {
                Ok(checksums) => {
                    for (name, expected) in &checksums.files {
                        let Some(&(key, _)) = ARTIFACTS.iter().find(|(n, _)| *n == name.as_str()) else {
                            continue;
                        };
                        let Some(actual) = contents.get(&key) else {
                            continue;
                        };
                        if inspection.state(key).is_ok() && artifacts::sha256_hex(actual) != *expected
                        {
                            inspection.artifacts.insert(
                                key,
                                ArtifactState::Invalid("checksum mismatch".to_string()),
                            );
                        }
                    }
                }
                Err(e) => {
                    inspection
                        .artifacts
                        .insert(CHECKSUMS, ArtifactState::Invalid(e.to_string()));
                }
            }
        }

        debug!(dir = %dir.display(), ok = inspection.all_ok(), "inspected index directory");
        inspection
    }

    /// Directories under `active/`.
    pub async fn list_active(&self) -> Result<Vec<PathBuf>, StoreError> {
        list_dirs(&self.active_dir()).await
    }

    /// Remove every directory under `active/` not in `referenced`.
    ///
    /// Callers must make sure no build is in flight: a build commits its
    /// directory before the registry points at it.
    pub async fn cleanup_orphaned(&self, referenced: &HashSet<PathBuf>) -> Result<usize, StoreError> {
        let mut removed = 0;
        for dir in self.list_active().await? {
            if referenced.contains(&dir) {
                continue;
            }
            self.remove_dir(&dir).await?;
            info!(dir = %dir.display(), "removed orphaned index directory");
            removed += 1;
        }
        Ok(removed)
    }

    /// Remove leftover staging directories from interrupted builds.
    pub async fn purge_staging(&self) -> Result<usize, StoreError> {
        let dirs = list_dirs(&self.staging_dir()).await?;
        for dir in &dirs {
            self.remove_dir(dir).await?;
        }
        if !dirs.is_empty() {
            warn!(count = dirs.len(), "purged leftover staging directories");
        }
        Ok(dirs.len())
    }

    /// Remove a directory tree; a directory that is already gone is fine.
    pub async fn remove_dir(&self, dir: &Path) -> Result<(), StoreError> {
        match tokio::fs::remove_dir_all(dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::io(dir, e)),
        }
    }
}

async fn list_dirs(parent: &Path) -> Result<Vec<PathBuf>, StoreError> {
    let mut entries = match tokio::fs::read_dir(parent).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(StoreError::io(parent, e)),
    };
    let mut dirs = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| StoreError::io(parent, e))?
    {
        let is_dir = entry
            .file_type()
            .await
            .map(|t| t.is_dir())
            .unwrap_or(false);
        if is_dir {
            dirs.push(entry.path());
        }
    }
    dirs.sort();
    Ok(dirs)
}
