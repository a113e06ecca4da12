//! Index builds.
//!
//! ```text
//! hash source ──▶ up to date? ──yes──▶ return existing record
//!      │                no
//!      ▼
//! identical content indexed elsewhere? ──yes──▶ point record at that directory
//!      │                no
//!      ▼
//! chunk ──▶ embed (batched, retried) ──▶ write to staging ──▶ commit ──▶ mark ready
//! ```
//!
//! Nothing a reader can see changes until the final registry update, so a
//! failure at any step leaves the previous ready generation in place.
//! Callers serialize builds per document.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use rag_lifecycle_core::chunk::{chunk_text, ChunkConfig, StrategyKind};
use rag_lifecycle_core::embedding::EmbeddingProvider;
use rag_lifecycle_core::models::{Chunk, Document, IndexRecord};
use tracing::{debug, info, warn};

use crate::artifacts::{self, IndexArtifacts, Manifest, MANIFEST_VERSION};
use crate::error::IndexError;
use crate::hashing::{ContentHashService, FileHashes};
use crate::registry::ReadyIndex;
use crate::retry::RetryPolicy;
use crate::vector_index::VectorIndexManager;

/// Result of [`IndexBuilder::build`].
#[derive(Debug, Clone)]
pub struct BuildOutcome {
    pub record: IndexRecord,
    /// No embedding work was done.
    pub reused: bool,
}

#[derive(Debug, Clone)]
pub struct BuilderSettings {
    pub strategy: StrategyKind,
    pub chunk_config: ChunkConfig,
    pub batch_size: usize,
    pub retry: RetryPolicy,
}

pub struct IndexBuilder {
    vectors: Arc<VectorIndexManager>,
    embedder: Arc<dyn EmbeddingProvider>,
    hasher: ContentHashService,
    settings: BuilderSettings,
}

impl IndexBuilder {
    pub fn new(
        vectors: Arc<VectorIndexManager>,
        embedder: Arc<dyn EmbeddingProvider>,
        settings: BuilderSettings,
    ) -> Self {
        Self {
            vectors,
            embedder,
            hasher: ContentHashService::default(),
            settings,
        }
    }

    /// Build (or reuse) the index for `document`.
    ///
    /// With `overwrite = false` an existing ready index whose content hash
    /// still matches is returned as is, and a ready index of another
    /// document with identical content is shared instead of re-embedding.
    pub async fn build(
        &self,
        document: &Document,
        overwrite: bool,
    ) -> Result<BuildOutcome, IndexError> {
        let hashes = self.hash_source(document).await?;
        let registry = self.vectors.registry();
        let existing = registry.get(document.id).await?;

        if let Some(record) = &existing {
            if !overwrite
                && record.is_ready()
                && record.content_hash.as_deref() == Some(hashes.content_hash.as_str())
            {
                info!(
                    document_id = document.id,
                    generation = record.generation,
                    "index is up to date"
                );
                return Ok(BuildOutcome {
                    record: record.clone(),
                    reused: true,
                });
            }
        }

        if !overwrite {
            if let Some(record) = self.reuse_identical(document, &hashes, existing.as_ref()).await? {
                return Ok(BuildOutcome {
                    record,
                    reused: true,
                });
            }
        }

        let has_index = existing
            .as_ref()
            .is_some_and(|r| r.storage_path.is_some());
        if existing.is_none() {
            registry
                .insert_building(document.id, &hashes.content_hash, &hashes.file_hash)
                .await?;
        }

        info!(document_id = document.id, overwrite, "building index");
        let result = self
            .build_from_source(document, &hashes, existing.as_ref(), None)
            .await;

        if let Err(e) = &result {
            warn!(document_id = document.id, error = %e, "index build failed");
            if !has_index {
                if let Err(e) = registry.delete(document.id).await {
                    warn!(document_id = document.id, error = %e, "failed to drop unfinished record");
                }
            }
        }
        result.map(|record| BuildOutcome {
            record,
            reused: false,
        })
    }

    /// Rebuild from source, re-embedding only chunks whose text is not
    /// already in the current generation. Commits a new generation.
    pub async fn partial_rebuild(
        &self,
        record: &IndexRecord,
        document: &Document,
    ) -> Result<IndexRecord, IndexError> {
        let hashes = self.hash_source(document).await?;
        let reusable = match &record.storage_path {
            Some(path) => self.reusable_vectors(path).await,
            None => HashMap::new(),
        };
        info!(
            document_id = document.id,
            reusable = reusable.len(),
            "partial rebuild"
        );
        self.build_from_source(document, &hashes, Some(record), Some(&reusable))
            .await
    }

    async fn hash_source(&self, document: &Document) -> Result<FileHashes, IndexError> {
        self.hasher
            .hash(&document.path)
            .await
            .map_err(|source| IndexError::Unreadable {
                path: document.path.clone(),
                source,
            })
    }

    /// Share the directory of another document with identical content.
    async fn reuse_identical(
        &self,
        document: &Document,
        hashes: &FileHashes,
        existing: Option<&IndexRecord>,
    ) -> Result<Option<IndexRecord>, IndexError> {
        let registry = self.vectors.registry();
        let Some(source) = registry
            .find_ready_by_content_hash(&hashes.content_hash, document.id)
            .await?
        else {
            return Ok(None);
        };
        let Some(path) = source.storage_path.as_deref() else {
            return Ok(None);
        };
        if !self.vectors.files().verify_index_files(path).await {
            debug!(source_document = source.document_id, "identical index failed verification, not reusing");
            return Ok(None);
        }
        match artifacts::read_manifest(path).await {
            Ok(manifest) if manifest.model == self.embedder.model_name() => {}
            _ => return Ok(None),
        }

        let generation = existing.map_or(0, |r| r.generation) + 1;
        let record = registry
            .mark_ready(
                document.id,
                ReadyIndex {
                    storage_path: path,
                    generation,
                    chunk_count: source.chunk_count,
                    content_hash: &hashes.content_hash,
                    file_hash: &hashes.file_hash,
                },
            )
            .await?;
        self.retire_previous(existing, path).await;
        info!(
            document_id = document.id,
            source_document = source.document_id,
            generation,
            "reused identical index"
        );
        Ok(Some(record))
    }

    async fn build_from_source(
        &self,
        document: &Document,
        hashes: &FileHashes,
        existing: Option<&IndexRecord>,
        reusable: Option<&HashMap<String, Vec<f32>>>,
    ) -> Result<IndexRecord, IndexError> {
        let text = tokio::fs::read_to_string(&document.path)
            .await
            .map_err(|source| IndexError::Unreadable {
                path: document.path.clone(),
                source,
            })?;
        if self.hasher.hash_text(&text) != hashes.content_hash {
            return Err(IndexError::SourceChanged(document.id));
        }
        let chunks = chunk_text(&text, self.settings.strategy, &self.settings.chunk_config)?;
        if chunks.is_empty() {
            return Err(IndexError::EmptyDocument(document.id));
        }

        // The guard removes the directory if anything below fails or the
        // future is dropped.
        let staging = self.vectors.stage(document.id).await?;
        let (vectors, reused) = self.embed_chunks(&chunks, reusable).await?;
        let dims = vectors.first().map_or(self.embedder.dims(), Vec::len);
        let generation = existing.map_or(0, |r| r.generation) + 1;
        let chunk_count = chunks.len();

        let manifest = Manifest {
            format_version: MANIFEST_VERSION,
            document_id: document.id,
            generation,
            content_hash: hashes.content_hash.clone(),
            file_hash: hashes.file_hash.clone(),
            strategy: self.settings.strategy,
            chunk_config: self.settings.chunk_config.clone(),
            model: self.embedder.model_name().to_string(),
            dims,
            chunk_count,
            chunk_hashes: chunks.iter().map(|c| c.hash.clone()).collect(),
            created_at: Utc::now(),
        };

        artifacts::write_index(
            staging.path(),
            &IndexArtifacts {
                manifest,
                chunks,
                vectors,
            },
        )
        .await?;
        let path = self.vectors.commit(staging, document.id, generation).await?;

        let record = self
            .vectors
            .registry()
            .mark_ready(
                document.id,
                ReadyIndex {
                    storage_path: &path,
                    generation,
                    chunk_count,
                    content_hash: &hashes.content_hash,
                    file_hash: &hashes.file_hash,
                },
            )
            .await?;
        self.retire_previous(existing, &path).await;

        info!(
            document_id = document.id,
            generation,
            chunks = chunk_count,
            reused_vectors = reused,
            "index ready"
        );
        Ok(record)
    }

    /// Embed every chunk not covered by `reusable`, in batches.
    async fn embed_chunks(
        &self,
        chunks: &[Chunk],
        reusable: Option<&HashMap<String, Vec<f32>>>,
    ) -> Result<(Vec<Vec<f32>>, usize), IndexError> {
        let mut slots: Vec<Option<Vec<f32>>> = chunks
            .iter()
            .map(|c| reusable.and_then(|r| r.get(&c.hash).cloned()))
            .collect();
        let reused = slots.iter().filter(|s| s.is_some()).count();
        let pending: Vec<usize> = (0..chunks.len()).filter(|&i| slots[i].is_none()).collect();

        let mut expected_dims = slots
            .iter()
            .flatten()
            .map(Vec::len)
            .next()
            .or(Some(self.embedder.dims()).filter(|&d| d > 0));

        for batch in pending.chunks(self.settings.batch_size.max(1)) {
            let texts: Vec<String> = batch.iter().map(|&i| chunks[i].text.clone()).collect();
            let embedder = &self.embedder;
            let inputs = &texts;
            let output = self
                .settings
                .retry
                .run("embed", move || embedder.embed(inputs))
                .await?;

            if output.len() != batch.len() {
                return Err(IndexError::VectorCount {
                    expected: batch.len(),
                    got: output.len(),
                });
            }
            for (&i, vector) in batch.iter().zip(output) {
                let expected = *expected_dims.get_or_insert(vector.len());
                if vector.is_empty() || vector.len() != expected {
                    return Err(IndexError::VectorDims {
                        expected,
                        got: vector.len(),
                    });
                }
                slots[i] = Some(vector);
            }
            debug!(batch = batch.len(), "embedded batch");
        }

        Ok((slots.into_iter().flatten().collect(), reused))
    }

    /// Vectors of the generation at `path`, keyed by chunk hash. Empty when
    /// the artifacts are unusable or were made by a different model.
    async fn reusable_vectors(&self, path: &Path) -> HashMap<String, Vec<f32>> {
        let manifest = match artifacts::read_manifest(path).await {
            Ok(m) => m,
            Err(e) => {
                debug!(dir = %path.display(), error = %e, "no reusable vectors");
                return HashMap::new();
            }
        };
        if manifest.model != self.embedder.model_name() {
            return HashMap::new();
        }
        match artifacts::read_vectors(path).await {
            Ok((header, vectors)) if header.count == manifest.chunk_hashes.len() => {
                manifest.chunk_hashes.into_iter().zip(vectors).collect()
            }
            Ok(_) => HashMap::new(),
            Err(e) => {
                debug!(dir = %path.display(), error = %e, "no reusable vectors");
                HashMap::new()
            }
        }
    }

    /// Retire the directory the record pointed at before this build.
    async fn retire_previous(&self, previous: Option<&IndexRecord>, current: &Path) {
        let Some(old) = previous.and_then(|r| r.storage_path.as_deref()) else {
            return;
        };
        if old == current {
            return;
        }
        if let Err(e) = self.vectors.retire(old).await {
            warn!(dir = %old.display(), error = %e, "failed to retire previous generation");
        }
    }
}
