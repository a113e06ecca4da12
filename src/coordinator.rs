//! The lifecycle facade.
//!
//! Concurrency model:
//!
//! - **Builds** (including rebuilds and repairs) take a per-document
//!   `tokio::sync::Mutex`, so at most one is in flight per document. A
//!   caller that waited for the lock while another build finished gets
//!   that build's result instead of starting its own.
//! - **Queries** take no build lock. They read whichever generation the
//!   registry currently points at; a rebuild only swaps that pointer after
//!   its new generation is complete, so readers see the old generation
//!   until the swap.
//! - **Orphan cleanup** needs exclusive access to `active/` and is skipped
//!   while any build holds the maintenance lock for reading.
//!
//! Before a query is served from an index that is not in memory (or whose
//! record is not `ready`) the index is analyzed, and damaged indexes get
//! one repair attempt.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use rag_lifecycle_core::embedding::EmbeddingProvider;
use rag_lifecycle_core::llm::LlmProvider;
use rag_lifecycle_core::models::{
    BuildResult, CacheMetrics, Document, DocumentId, HealthReport, IndexRecord, IndexStatus,
    QueryParams, QueryResult, RecoveryResult, Severity, StatusReport,
};
use rag_lifecycle_core::repository::DocumentRepository;
use sqlx::SqlitePool;
use tokio::sync::{Mutex as AsyncMutex, RwLock as AsyncRwLock};
use tracing::{info, warn};

use crate::builder::{BuilderSettings, IndexBuilder};
use crate::cache::RAGCacheService;
use crate::config::Config;
use crate::error::{IndexError, ProcessingError, QueryError};
use crate::file_manager::FileManager;
use crate::query::{LoadedStats, QueryEngine};
use crate::recovery::RecoveryService;
use crate::registry::IndexRegistry;
use crate::vector_index::VectorIndexManager;
use crate::{db, migrate};

/// Marks a document as rebuilding for as long as it lives.
struct RebuildMark<'a> {
    set: &'a Mutex<HashSet<DocumentId>>,
    id: DocumentId,
}

impl<'a> RebuildMark<'a> {
    fn new(set: &'a Mutex<HashSet<DocumentId>>, id: DocumentId) -> Self {
        set.lock().unwrap_or_else(|e| e.into_inner()).insert(id);
        Self { set, id }
    }
}

impl Drop for RebuildMark<'_> {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.id);
    }
}

pub struct Coordinator {
    config: Config,
    repository: Arc<dyn DocumentRepository>,
    vectors: Arc<VectorIndexManager>,
    builder: Arc<IndexBuilder>,
    engine: QueryEngine,
    recovery: RecoveryService,
    cache: RAGCacheService,
    locks: Mutex<HashMap<DocumentId, Arc<AsyncMutex<()>>>>,
    rebuilding: Mutex<HashSet<DocumentId>>,
    maintenance: AsyncRwLock<()>,
}

impl Coordinator {
    /// Connect to the configured database, migrate, and reconcile state
    /// left by an earlier crash.
    pub async fn open(
        config: Config,
        repository: Arc<dyn DocumentRepository>,
        embedder: Arc<dyn EmbeddingProvider>,
        llm: Arc<dyn LlmProvider>,
    ) -> Result<Self> {
        let pool = db::connect(&config).await?;
        migrate::run_migrations(&pool).await?;
        Self::with_pool(config, pool, repository, embedder, llm).await
    }

    /// Like [`open`](Self::open) with an already migrated pool.
    pub async fn with_pool(
        config: Config,
        pool: SqlitePool,
        repository: Arc<dyn DocumentRepository>,
        embedder: Arc<dyn EmbeddingProvider>,
        llm: Arc<dyn LlmProvider>,
    ) -> Result<Self> {
        let files = Arc::new(FileManager::new(&config.storage.index_root));
        files.ensure_layout().await?;
        let registry = IndexRegistry::new(pool);
        let vectors = Arc::new(VectorIndexManager::new(files.clone(), registry.clone()));

        let staged = files.purge_staging().await?;
        let unfinished = registry.delete_unfinished().await?;
        if unfinished > 0 {
            warn!(count = unfinished, "dropped records of interrupted first builds");
        }

        let builder = Arc::new(IndexBuilder::new(
            vectors.clone(),
            embedder.clone(),
            BuilderSettings {
                strategy: config.chunking.strategy,
                chunk_config: config.chunking.chunk_config(),
                batch_size: config.embedding.batch_size,
                retry: config.embedding.retry_policy(),
            },
        ));
        let engine = QueryEngine::new(
            registry,
            embedder,
            llm,
            config.embedding.retry_policy(),
            config.llm.retry_policy(),
            config.retrieval.clone(),
            config.query_engine.clone(),
        );
        let recovery = RecoveryService::new(
            vectors.clone(),
            builder.clone(),
            repository.clone(),
            config.recovery.critical_ratio,
        );
        let cache = RAGCacheService::new(&config.cache);

        info!(
            index_root = %config.storage.index_root.display(),
            purged_staging = staged,
            "coordinator ready"
        );
        Ok(Self {
            config,
            repository,
            vectors,
            builder,
            engine,
            recovery,
            cache,
            locks: Mutex::new(HashMap::new()),
            rebuilding: Mutex::new(HashSet::new()),
            maintenance: AsyncRwLock::new(()),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn lock_for(&self, document_id: DocumentId) -> Arc<AsyncMutex<()>> {
        self.locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(document_id)
            .or_default()
            .clone()
    }

    fn is_rebuilding(&self, document_id: DocumentId) -> bool {
        self.rebuilding
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&document_id)
    }

    async fn document(&self, document_id: DocumentId) -> Result<Document, IndexError> {
        self.repository
            .get(document_id)
            .await?
            .ok_or(IndexError::DocumentNotFound(document_id))
    }

    async fn ready_record(&self, document_id: DocumentId) -> Result<Option<IndexRecord>, ProcessingError> {
        Ok(self
            .vectors
            .registry()
            .get(document_id)
            .await?
            .filter(IndexRecord::is_ready))
    }

    /// Drop cached answers and loaded indexes of superseded generations.
    fn after_swap(&self, document_id: DocumentId, generation: u64) {
        self.cache.purge_stale(document_id, generation);
        self.engine.evict_stale(document_id, generation);
    }

    /// Build the document's index, or reuse an up-to-date or identical one.
    pub async fn build_index(
        &self,
        document_id: DocumentId,
        overwrite: bool,
    ) -> Result<BuildResult, ProcessingError> {
        let document = self.document(document_id).await?;
        let _maintenance = self.maintenance.read().await;

        let lock = self.lock_for(document_id);
        let seen = self.ready_record(document_id).await?.map(|r| r.generation);
        let _guard = lock.lock().await;

        if let Some(current) = self.ready_record(document_id).await? {
            if seen != Some(current.generation) {
                info!(
                    document_id,
                    generation = current.generation,
                    "build finished while waiting, reusing its result"
                );
                return Ok(BuildResult::from_record(&current, true));
            }
        }

        let _mark = RebuildMark::new(&self.rebuilding, document_id);
        let outcome = self.builder.build(&document, overwrite).await?;
        self.after_swap(document_id, outcome.record.generation);
        Ok(BuildResult::from_record(&outcome.record, outcome.reused))
    }

    /// Rebuild from source unconditionally.
    pub async fn rebuild_index(&self, document_id: DocumentId) -> Result<BuildResult, ProcessingError> {
        self.build_index(document_id, true).await
    }

    /// Answer a question from the document's current ready generation.
    pub async fn query(
        &self,
        document_id: DocumentId,
        text: &str,
        params: &QueryParams,
    ) -> Result<QueryResult, ProcessingError> {
        if text.trim().is_empty() {
            return Err(QueryError::EmptyQuery.into());
        }
        let mut record = self
            .vectors
            .registry()
            .get(document_id)
            .await?
            .filter(|r| r.storage_path.is_some() && r.status != IndexStatus::Building)
            .ok_or(QueryError::NotReady(document_id))?;

        if record.status != IndexStatus::Ready || !self.engine.is_loaded(document_id, record.generation)
        {
            record = self.ensure_servable(record).await?;
        }

        if let Some(answer) = self.cache.get(document_id, text, params, record.generation) {
            return Ok(QueryResult {
                answer: answer.text,
                sources: answer.sources,
                cache_hit: true,
                generation: record.generation,
            });
        }

        let (answer, generation) = self.engine.query_record(&record, text, params).await?;
        self.cache
            .put(document_id, text, params, generation, answer.clone());
        Ok(QueryResult {
            answer: answer.text,
            sources: answer.sources,
            cache_hit: false,
            generation,
        })
    }

    /// Analyze a cold or non-ready index and repair it once if needed.
    async fn ensure_servable(&self, record: IndexRecord) -> Result<IndexRecord, ProcessingError> {
        let document_id = record.document_id;
        let report = self.recovery.analyze(&record).await?;
        let severity = report.severity;
        if severity == Severity::None && record.status == IndexStatus::Ready {
            return Ok(record);
        }

        // Minor damage touches only derived files a query never reads.
        let servable_anyway = severity <= Severity::Minor;
        let degraded = || -> ProcessingError {
            QueryError::Degraded {
                document_id,
                severity,
            }
            .into()
        };

        if !self.config.recovery.auto_repair {
            return if servable_anyway { Ok(record) } else { Err(degraded()) };
        }

        let _maintenance = self.maintenance.read().await;
        let lock = self.lock_for(document_id);
        let Ok(_guard) = lock.try_lock() else {
            warn!(document_id, %severity, "repair skipped, a build is in progress");
            return if servable_anyway { Ok(record) } else { Err(degraded()) };
        };

        let _mark = RebuildMark::new(&self.rebuilding, document_id);
        match self.recovery.recover(document_id, false).await {
            Ok(result) => {
                self.after_swap(document_id, result.generation);
                self.ready_record(document_id)
                    .await?
                    .ok_or_else(|| QueryError::NotReady(document_id).into())
            }
            Err(e) => {
                warn!(document_id, %severity, error = %e, "automatic repair failed");
                self.engine.evict(document_id);
                self.cache.clear(Some(document_id));
                Err(degraded())
            }
        }
    }

    pub async fn get_status(&self, document_id: DocumentId) -> Result<StatusReport, ProcessingError> {
        let rebuilding = self.is_rebuilding(document_id);
        let report = match self.vectors.registry().get(document_id).await? {
            Some(record) => StatusReport {
                document_id,
                status: record.status,
                generation: record.generation,
                chunk_count: record.chunk_count,
                storage_path: record.storage_path,
                rebuilding,
            },
            None => StatusReport {
                document_id,
                status: IndexStatus::Absent,
                generation: 0,
                chunk_count: 0,
                storage_path: None,
                rebuilding,
            },
        };
        Ok(report)
    }

    /// Analyze and repair one index; `force_rebuild` rebuilds regardless.
    pub async fn recover(
        &self,
        document_id: DocumentId,
        force_rebuild: bool,
    ) -> Result<RecoveryResult, ProcessingError> {
        let _maintenance = self.maintenance.read().await;
        let lock = self.lock_for(document_id);
        let _guard = lock.lock().await;
        let _mark = RebuildMark::new(&self.rebuilding, document_id);

        match self.recovery.recover(document_id, force_rebuild).await {
            Ok(result) => {
                self.after_swap(document_id, result.generation);
                Ok(result)
            }
            Err(e) => {
                self.engine.evict(document_id);
                self.cache.clear(Some(document_id));
                Err(e.into())
            }
        }
    }

    pub async fn health_check(&self) -> Result<HealthReport, ProcessingError> {
        Ok(self.recovery.health_check().await?)
    }

    pub fn cache_stats(&self) -> CacheMetrics {
        self.cache.stats()
    }

    /// Clear cached answers for one document or all of them.
    pub fn clear_cache(&self, document_id: Option<DocumentId>) -> usize {
        let removed = self.cache.clear(document_id);
        info!(?document_id, removed, "cleared response cache");
        removed
    }

    pub fn loaded_stats(&self) -> LoadedStats {
        self.engine.loaded_stats()
    }

    /// Remove a document's index record, its directory (unless shared),
    /// loaded generations, and cached answers.
    pub async fn delete_document(&self, document_id: DocumentId) -> Result<bool, ProcessingError> {
        let _maintenance = self.maintenance.read().await;
        let lock = self.lock_for(document_id);
        let _guard = lock.lock().await;

        let deleted = self.vectors.delete_document(document_id).await?;
        self.engine.evict(document_id);
        self.cache.clear(Some(document_id));
        Ok(deleted)
    }

    /// Remove directories under `active/` that no record references.
    /// Returns `None` when skipped because builds are in flight.
    pub async fn cleanup_orphans(&self) -> Result<Option<usize>, ProcessingError> {
        let Ok(_exclusive) = self.maintenance.try_write() else {
            warn!("builds in flight, skipping orphan cleanup");
            return Ok(None);
        };
        let referenced = self.vectors.registry().referenced_paths().await?;
        let removed = self.vectors.files().cleanup_orphaned(&referenced).await?;
        info!(removed, "orphan cleanup complete");
        Ok(Some(removed))
    }
}
