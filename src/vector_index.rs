//! Storage locations for index generations.
//!
//! Every build writes into a private staging directory. Committing renames
//! it to `active/doc-<id>-g<generation>`; until then nothing a reader can
//! reach has changed. When that name is still held by another record (a
//! deleted id's directory shared through dedup, then the id reused), the
//! staging token is appended to keep the new generation apart.
//!
//! A [`StagingDir`] that is dropped without being committed removes
//! itself, which covers both failed and cancelled builds.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rag_lifecycle_core::models::DocumentId;
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::file_manager::FileManager;
use crate::registry::IndexRegistry;

/// A build's private output directory.
#[derive(Debug)]
pub struct StagingDir {
    path: PathBuf,
    token: String,
    committed: bool,
}

impl StagingDir {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StagingDir {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        match std::fs::remove_dir_all(&self.path) {
            Ok(()) => debug!(dir = %self.path.display(), "discarded staging directory"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(dir = %self.path.display(), error = %e, "failed to remove staging directory"),
        }
    }
}

pub struct VectorIndexManager {
    files: Arc<FileManager>,
    registry: IndexRegistry,
}

impl VectorIndexManager {
    pub fn new(files: Arc<FileManager>, registry: IndexRegistry) -> Self {
        Self { files, registry }
    }

    pub fn files(&self) -> &FileManager {
        &self.files
    }

    pub fn registry(&self) -> &IndexRegistry {
        &self.registry
    }

    /// Final location of a generation.
    pub fn location_for(&self, document_id: DocumentId, generation: u64) -> PathBuf {
        self.files
            .active_dir()
            .join(format!("doc-{document_id}-g{generation}"))
    }

    /// Allocate a fresh staging directory for one build attempt.
    pub async fn stage(&self, document_id: DocumentId) -> Result<StagingDir, StoreError> {
        let token = uuid::Uuid::new_v4().simple().to_string();
        let path = self
            .files
            .staging_dir()
            .join(format!("{document_id}-{token}"));
        tokio::fs::create_dir_all(&path)
            .await
            .map_err(|e| StoreError::io(&path, e))?;
        Ok(StagingDir {
            path,
            token,
            committed: false,
        })
    }

    /// Move a staged build to its active location.
    ///
    /// A leftover directory at the target that no record references (from
    /// an earlier crash) is replaced. One that is still referenced is left
    /// alone and the generation lands at a name suffixed with the staging
    /// token instead.
    pub async fn commit(
        &self,
        mut staging: StagingDir,
        document_id: DocumentId,
        generation: u64,
    ) -> Result<PathBuf, StoreError> {
        let mut target = self.location_for(document_id, generation);
        let active = self.files.active_dir();
        tokio::fs::create_dir_all(&active)
            .await
            .map_err(|e| StoreError::io(&active, e))?;

        if tokio::fs::metadata(&target).await.is_ok() {
            if self.registry.references(&target).await? > 0 {
                let taken = target;
                target = active.join(format!(
                    "doc-{document_id}-g{generation}-{}",
                    staging.token
                ));
                debug!(taken = %taken.display(), dir = %target.display(), "commit target in use");
            } else {
                warn!(dir = %target.display(), "replacing unreferenced directory at commit target");
                self.files.remove_dir(&target).await?;
            }
        }

        tokio::fs::rename(&staging.path, &target)
            .await
            .map_err(|e| StoreError::io(&target, e))?;
        staging.committed = true;
        debug!(document_id, generation, dir = %target.display(), "committed index generation");
        Ok(target)
    }

    /// Remove a directory no record points at any more. Returns whether it
    /// was removed; shared directories are kept.
    pub async fn retire(&self, path: &Path) -> Result<bool, StoreError> {
        if self.registry.references(path).await? > 0 {
            debug!(dir = %path.display(), "directory still referenced, not retiring");
            return Ok(false);
        }
        self.files.remove_dir(path).await?;
        info!(dir = %path.display(), "retired index directory");
        Ok(true)
    }

    /// Remove a document's record and retire its directory.
    pub async fn delete_document(&self, document_id: DocumentId) -> Result<bool, StoreError> {
        let Some(record) = self.registry.get(document_id).await? else {
            return Ok(false);
        };
        self.registry.delete(document_id).await?;
        if let Some(path) = &record.storage_path {
            self.retire(path).await?;
        }
        info!(document_id, "deleted index");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::registry::ReadyIndex;
    use crate::{db, migrate};
    use tempfile::TempDir;

    async fn manager(tmp: &TempDir) -> VectorIndexManager {
        let config = Config::for_root(tmp.path());
        let pool = db::connect(&config).await.unwrap();
        migrate::run_migrations(&pool).await.unwrap();
        let files = Arc::new(FileManager::new(&config.storage.index_root));
        files.ensure_layout().await.unwrap();
        VectorIndexManager::new(files, IndexRegistry::new(pool))
    }

    #[tokio::test]
    async fn test_dropped_staging_is_removed() {
        let tmp = TempDir::new().unwrap();
        let mgr = manager(&tmp).await;
        let staging = mgr.stage(1).await.unwrap();
        let path = staging.path().to_path_buf();
        std::fs::write(path.join("vectors.bin"), b"partial").unwrap();
        assert!(path.exists());
        drop(staging);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_commit_moves_to_active() {
        let tmp = TempDir::new().unwrap();
        let mgr = manager(&tmp).await;
        let staging = mgr.stage(5).await.unwrap();
        std::fs::write(staging.path().join("manifest.json"), b"{}").unwrap();
        let staged = staging.path().to_path_buf();

        let target = mgr.commit(staging, 5, 2).await.unwrap();
        assert_eq!(target, mgr.location_for(5, 2));
        assert!(target.join("manifest.json").exists());
        assert!(!staged.exists());
    }

    #[tokio::test]
    async fn test_commit_steps_around_shared_target() {
        let tmp = TempDir::new().unwrap();
        let mgr = manager(&tmp).await;
        // Document 5 built g1, document 6 shares it, then 5 is deleted.
        let shared = mgr.location_for(5, 1);
        std::fs::create_dir_all(&shared).unwrap();
        std::fs::write(shared.join("manifest.json"), b"old").unwrap();
        for id in [5, 6] {
            mgr.registry()
                .mark_ready(
                    id,
                    ReadyIndex {
                        storage_path: &shared,
                        generation: 1,
                        chunk_count: 1,
                        content_hash: "h",
                        file_hash: "f",
                    },
                )
                .await
                .unwrap();
        }
        assert!(mgr.delete_document(5).await.unwrap());
        assert!(shared.exists());

        // The reused id builds its own generation 1.
        let staging = mgr.stage(5).await.unwrap();
        std::fs::write(staging.path().join("manifest.json"), b"new").unwrap();
        let staged = staging.path().to_path_buf();
        let target = mgr.commit(staging, 5, 1).await.unwrap();

        assert_ne!(target, shared);
        assert!(target
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("doc-5-g1-"));
        assert!(!staged.exists());
        assert_eq!(std::fs::read(target.join("manifest.json")).unwrap(), b"new");
        assert_eq!(std::fs::read(shared.join("manifest.json")).unwrap(), b"old");
        assert_eq!(
            mgr.registry().get(6).await.unwrap().unwrap().storage_path,
            Some(shared)
        );
    }

    #[tokio::test]
    async fn test_commit_replaces_unreferenced_leftover() {
        let tmp = TempDir::new().unwrap();
        let mgr = manager(&tmp).await;
        let leftover = mgr.location_for(5, 1);
        std::fs::create_dir_all(&leftover).unwrap();
        std::fs::write(leftover.join("stale"), b"x").unwrap();

        let staging = mgr.stage(5).await.unwrap();
        let target = mgr.commit(staging, 5, 1).await.unwrap();
        assert_eq!(target, leftover);
        assert!(!target.join("stale").exists());
    }

    #[tokio::test]
    async fn test_retire_keeps_shared_directory() {
        let tmp = TempDir::new().unwrap();
        let mgr = manager(&tmp).await;
        let shared = mgr.location_for(1, 1);
        std::fs::create_dir_all(&shared).unwrap();
        for id in [1, 2] {
            mgr.registry()
                .mark_ready(
                    id,
                    ReadyIndex {
                        storage_path: &shared,
                        generation: 1,
                        chunk_count: 1,
                        content_hash: "h",
                        file_hash: "f",
                    },
                )
                .await
                .unwrap();
        }

        assert!(mgr.delete_document(1).await.unwrap());
        assert!(shared.exists());
        assert!(mgr.delete_document(2).await.unwrap());
        assert!(!shared.exists());
        assert!(!mgr.delete_document(2).await.unwrap());
    }
}
