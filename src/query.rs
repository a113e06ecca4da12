//! Retrieval-augmented queries over a loaded index generation.
//!
//! Loaded indexes live in an in-memory LRU keyed by
//! `(document_id, generation)`, bounded by both entry count and an
//! approximate byte budget. A swap to a new generation makes the old key
//! unreachable; the coordinator evicts it after a build.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use rag_lifecycle_core::embedding::{top_k_similar, EmbeddingProvider};
use rag_lifecycle_core::error::ProviderError;
use rag_lifecycle_core::llm::{build_prompt, LlmProvider};
use rag_lifecycle_core::models::{
    Answer, Chunk, DocumentId, IndexRecord, QueryParams, SourceAttribution,
};
use tracing::{debug, info, warn};

use crate::artifacts;
use crate::config::{QueryEngineConfig, RetrievalConfig};
use crate::error::{QueryError, StoreError};
use crate::registry::IndexRegistry;
use crate::retry::RetryPolicy;

const EXCERPT_CHARS: usize = 200;
const NO_CONTEXT_ANSWER: &str = "No passage in the document is relevant to the question.";

/// One generation held in memory.
#[derive(Debug)]
pub struct LoadedIndex {
    pub document_id: DocumentId,
    pub generation: u64,
    pub dims: usize,
    pub chunks: Vec<Chunk>,
    pub vectors: Vec<Vec<f32>>,
    /// Approximate heap footprint.
    pub bytes: usize,
}

impl LoadedIndex {
    fn estimate_bytes(chunks: &[Chunk], vectors: &[Vec<f32>]) -> usize {
        let text: usize = chunks.iter().map(|c| c.text.len() + c.hash.len()).sum();
        let vecs: usize = vectors.iter().map(|v| v.len() * std::mem::size_of::<f32>()).sum();
        text + vecs
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadedStats {
    pub indexes: usize,
    pub bytes: usize,
}

struct Slot {
    index: Arc<LoadedIndex>,
    last_access: u64,
}

#[derive(Default)]
struct LoadedSet {
    slots: HashMap<(DocumentId, u64), Slot>,
    bytes: usize,
    clock: u64,
}

impl LoadedSet {
    fn touch(&mut self, key: (DocumentId, u64)) -> Option<Arc<LoadedIndex>> {
        self.clock += 1;
        let clock = self.clock;
        self.slots.get_mut(&key).map(|slot| {
            slot.last_access = clock;
            slot.index.clone()
        })
    }

    fn remove_where(&mut self, pred: impl Fn(&(DocumentId, u64)) -> bool) -> usize {
        let keys: Vec<_> = self.slots.keys().filter(|k| pred(k)).copied().collect();
        for key in &keys {
            if let Some(slot) = self.slots.remove(key) {
                self.bytes -= slot.index.bytes;
            }
        }
        keys.len()
    }

    /// Evict least recently used entries until `incoming` more bytes and
    /// one more entry fit.
    fn make_room(&mut self, incoming: usize, limits: &QueryEngineConfig) {
        while !self.slots.is_empty()
            && (self.slots.len() >= limits.max_loaded_indexes.max(1)
                || self.bytes + incoming > limits.max_loaded_bytes)
        {
            let Some(oldest) = self
                .slots
                .iter()
                .min_by_key(|(_, s)| s.last_access)
                .map(|(k, _)| *k)
            else {
                break;
            };
            if let Some(slot) = self.slots.remove(&oldest) {
                self.bytes -= slot.index.bytes;
                debug!(
                    document_id = oldest.0,
                    generation = oldest.1,
                    "evicted loaded index"
                );
            }
        }
    }
}

pub struct QueryEngine {
    registry: IndexRegistry,
    embedder: Arc<dyn EmbeddingProvider>,
    llm: Arc<dyn LlmProvider>,
    embed_retry: RetryPolicy,
    llm_retry: RetryPolicy,
    retrieval: RetrievalConfig,
    limits: QueryEngineConfig,
    loaded: Mutex<LoadedSet>,
}

impl QueryEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: IndexRegistry,
        embedder: Arc<dyn EmbeddingProvider>,
        llm: Arc<dyn LlmProvider>,
        embed_retry: RetryPolicy,
        llm_retry: RetryPolicy,
        retrieval: RetrievalConfig,
        limits: QueryEngineConfig,
    ) -> Self {
        Self {
            registry,
            embedder,
            llm,
            embed_retry,
            llm_retry,
            retrieval,
            limits,
            loaded: Mutex::new(LoadedSet::default()),
        }
    }

    /// Answer `text` against the current ready generation of a document.
    pub async fn query(
        &self,
        document_id: DocumentId,
        text: &str,
        params: &QueryParams,
    ) -> Result<Answer, QueryError> {
        let record = self
            .registry
            .get(document_id)
            .await?
            .filter(IndexRecord::is_ready)
            .ok_or(QueryError::NotReady(document_id))?;
        self.query_record(&record, text, params)
            .await
            .map(|(answer, _)| answer)
    }

    /// Answer against the generation `record` points at. Returns the answer
    /// and the generation that actually served it, which differs from
    /// `record.generation` only when a swap happened mid-load.
    pub async fn query_record(
        &self,
        record: &IndexRecord,
        text: &str,
        params: &QueryParams,
    ) -> Result<(Answer, u64), QueryError> {
        if text.trim().is_empty() {
            return Err(QueryError::EmptyQuery);
        }
        let index = self.load_current(record).await?;

        let top_k = params.top_k.unwrap_or(self.retrieval.top_k).max(1);
        let min_score = params.min_score.or(self.retrieval.min_score);

        let query_vector = self.embed_query(text, index.dims).await?;
        let hits: Vec<(usize, f32)> = top_k_similar(&query_vector, &index.vectors, top_k)
            .into_iter()
            .filter(|(_, score)| min_score.map_or(true, |m| *score >= m))
            .collect();

        if hits.is_empty() {
            debug!(document_id = record.document_id, "no passage passed min_score");
            return Ok((
                Answer {
                    text: NO_CONTEXT_ANSWER.to_string(),
                    sources: Vec::new(),
                },
                index.generation,
            ));
        }

        let passages: Vec<&str> = hits
            .iter()
            .map(|(i, _)| index.chunks[*i].text.as_str())
            .collect();
        let prompt = build_prompt(text, &passages);
        let llm = &self.llm;
        let prompt_ref = prompt.as_str();
        let completion = self
            .llm_retry
            .run("complete", move || llm.complete(prompt_ref))
            .await?;

        let sources = hits
            .iter()
            .map(|&(i, score)| {
                let chunk = &index.chunks[i];
                SourceAttribution {
                    chunk_index: chunk.index,
                    score,
                    start: chunk.start,
                    end: chunk.end,
                    excerpt: excerpt(&chunk.text),
                }
            })
            .collect();

        info!(
            document_id = record.document_id,
            generation = index.generation,
            sources = hits.len(),
            "answered query"
        );
        Ok((
            Answer {
                text: completion,
                sources,
            },
            index.generation,
        ))
    }

    async fn embed_query(&self, text: &str, dims: usize) -> Result<Vec<f32>, QueryError> {
        let embedder = &self.embedder;
        let input = vec![text.to_string()];
        let input_ref = &input;
        let mut vectors = self
            .embed_retry
            .run("embed query", move || embedder.embed(input_ref))
            .await?;
        let vector = vectors
            .pop()
            .ok_or_else(|| ProviderError::Fatal("no vector returned for query".to_string()))?;
        if vector.len() != dims {
            return Err(ProviderError::Fatal(format!(
                "query vector has {} dimensions, index has {dims}",
                vector.len()
            ))
            .into());
        }
        Ok(vector)
    }

    /// Load the record's generation. If that fails because a swap retired
    /// the directory in the meantime, load the generation now current.
    async fn load_current(&self, record: &IndexRecord) -> Result<Arc<LoadedIndex>, QueryError> {
        let document_id = record.document_id;
        match self.load(record).await {
            Ok(index) => Ok(index),
            Err(source) => {
                let current = self.registry.get(document_id).await?;
                match current {
                    Some(current)
                        if current.is_ready()
                            && (current.generation != record.generation
                                || current.storage_path != record.storage_path) =>
                    {
                        debug!(
                            document_id,
                            from = record.generation,
                            to = current.generation,
                            "generation swapped during load"
                        );
                        self.load(&current)
                            .await
                            .map_err(|source| QueryError::Load {
                                document_id,
                                source,
                            })
                    }
                    _ => Err(QueryError::Load {
                        document_id,
                        source,
                    }),
                }
            }
        }
    }

    async fn load(&self, record: &IndexRecord) -> Result<Arc<LoadedIndex>, StoreError> {
        let key = (record.document_id, record.generation);
        let cached = self.lock().touch(key);
        if let Some(index) = cached {
            return Ok(index);
        }

        let dir = record
            .storage_path
            .as_deref()
            .ok_or_else(|| StoreError::corrupt("index_records", "record has no storage path"))?;
        let artifacts = artifacts::load_index(dir).await?;
        let bytes = LoadedIndex::estimate_bytes(&artifacts.chunks, &artifacts.vectors);
        let index = Arc::new(LoadedIndex {
            document_id: record.document_id,
            generation: record.generation,
            dims: artifacts.manifest.dims,
            chunks: artifacts.chunks,
            vectors: artifacts.vectors,
            bytes,
        });

        let mut loaded = self.lock();
        if let Some(existing) = loaded.touch(key) {
            return Ok(existing);
        }
        if bytes > self.limits.max_loaded_bytes {
            warn!(
                document_id = record.document_id,
                bytes, "index exceeds loaded byte budget, serving without caching"
            );
            return Ok(index);
        }
        loaded.make_room(bytes, &self.limits);
        let clock = loaded.clock;
        loaded.bytes += bytes;
        loaded.slots.insert(
            key,
            Slot {
                index: index.clone(),
                last_access: clock,
            },
        );
        debug!(
            document_id = record.document_id,
            generation = record.generation,
            bytes,
            "loaded index"
        );
        Ok(index)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LoadedSet> {
        self.loaded.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_loaded(&self, document_id: DocumentId, generation: u64) -> bool {
        self.lock().slots.contains_key(&(document_id, generation))
    }

    /// Drop every loaded generation of a document.
    pub fn evict(&self, document_id: DocumentId) -> usize {
        self.lock().remove_where(|(id, _)| *id == document_id)
    }

    /// Drop loaded generations of a document other than `keep`.
    pub fn evict_stale(&self, document_id: DocumentId, keep: u64) -> usize {
        self.lock()
            .remove_where(|(id, generation)| *id == document_id && *generation != keep)
    }

    pub fn loaded_stats(&self) -> LoadedStats {
        let loaded = self.lock();
        LoadedStats {
            indexes: loaded.slots.len(),
            bytes: loaded.bytes,
        }
    }
}

fn excerpt(text: &str) -> String {
    let trimmed = text.trim();
    match trimmed.char_indices().nth(EXCERPT_CHARS) {
        Some((cut, _)) => format!("{}…", &trimmed[..cut]),
        None => trimmed.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::{IndexArtifacts, Manifest, MANIFEST_VERSION};
    use crate::config::Config;
    use crate::embedding::HashEmbedder;
    use crate::llm::ExtractiveLlm;
    use crate::registry::ReadyIndex;
    use crate::{db, migrate};
    use chrono::Utc;
    use rag_lifecycle_core::chunk::{chunk_text, ChunkConfig, StrategyKind};
    use std::path::Path;
    use std::time::Duration;
    use tempfile::TempDir;

    const TEXT: &str = "The registry maps each document to one directory. \
                        Swaps replace that mapping in a single update. \
                        Bread is baked in an oven at high heat.";

    async fn write_generation(
        registry: &IndexRegistry,
        root: &Path,
        document_id: DocumentId,
        generation: u64,
        text: &str,
    ) -> IndexRecord {
        let embedder = HashEmbedder::new(64);
        let config = ChunkConfig {
            max_chunk_size: 60,
            overlap: 0,
            min_chunk_size: 10,
            preserve_citations: false,
        };
        let chunks = chunk_text(text, StrategyKind::Sentence, &config).unwrap();
        let vectors: Vec<Vec<f32>> = chunks.iter().map(|c| embedder.embed_one(&c.text)).collect();
        let dir = root.join(format!("doc-{document_id}-g{generation}"));
        std::fs::create_dir_all(&dir).unwrap();
        let manifest = Manifest {
            format_version: MANIFEST_VERSION,
            document_id,
            generation,
            content_hash: "c".to_string(),
            file_hash: "f".to_string(),
            strategy: StrategyKind::Sentence,
            chunk_config: config,
            model: "hash-64".to_string(),
            dims: 64,
            chunk_count: chunks.len(),
            chunk_hashes: chunks.iter().map(|c| c.hash.clone()).collect(),
            created_at: Utc::now(),
        };
        let chunk_count = chunks.len();
        artifacts::write_index(
            &dir,
            &IndexArtifacts {
                manifest,
                chunks,
                vectors,
            },
        )
        .await
        .unwrap();
        registry
            .mark_ready(
                document_id,
                ReadyIndex {
                    storage_path: &dir,
                    generation,
                    chunk_count,
                    content_hash: "c",
                    file_hash: "f",
                },
            )
            .await
            .unwrap()
    }

    async fn engine(tmp: &TempDir, limits: QueryEngineConfig) -> (QueryEngine, IndexRegistry) {
        let pool = db::connect(&Config::for_root(tmp.path())).await.unwrap();
        migrate::run_migrations(&pool).await.unwrap();
        let registry = IndexRegistry::new(pool);
        let retry = RetryPolicy::new(0, Duration::ZERO);
        let engine = QueryEngine::new(
            registry.clone(),
            Arc::new(HashEmbedder::new(64)),
            Arc::new(ExtractiveLlm),
            retry,
            retry,
            RetrievalConfig::default(),
            limits,
        );
        (engine, registry)
    }

    #[tokio::test]
    async fn test_query_returns_ranked_sources() {
        let tmp = TempDir::new().unwrap();
        let (engine, registry) = engine(&tmp, QueryEngineConfig::default()).await;
        write_generation(&registry, tmp.path(), 1, 1, TEXT).await;

        let answer = engine
            .query(1, "How are swaps applied to the registry mapping?", &QueryParams::with_top_k(2))
            .await
            .unwrap();
        assert_eq!(answer.sources.len(), 2);
        assert!(answer.sources[0].score >= answer.sources[1].score);
        assert!(answer.sources[0].excerpt.contains("Swaps") || answer.sources[0].excerpt.contains("registry"));
        assert!(!answer.text.is_empty());
        assert!(engine.is_loaded(1, 1));
    }

    #[tokio::test]
    async fn test_query_without_ready_index() {
        let tmp = TempDir::new().unwrap();
        let (engine, registry) = engine(&tmp, QueryEngineConfig::default()).await;
        assert!(matches!(
            engine.query(9, "anything", &QueryParams::default()).await,
            Err(QueryError::NotReady(9))
        ));
        registry.insert_building(9, "c", "f").await.unwrap();
        assert!(matches!(
            engine.query(9, "anything", &QueryParams::default()).await,
            Err(QueryError::NotReady(9))
        ));
    }

    #[tokio::test]
    async fn test_empty_query_rejected() {
        let tmp = TempDir::new().unwrap();
        let (engine, registry) = engine(&tmp, QueryEngineConfig::default()).await;
        write_generation(&registry, tmp.path(), 1, 1, TEXT).await;
        assert!(matches!(
            engine.query(1, "  \n", &QueryParams::default()).await,
            Err(QueryError::EmptyQuery)
        ));
    }

    #[tokio::test]
    async fn test_min_score_filters_everything() {
        let tmp = TempDir::new().unwrap();
        let (engine, registry) = engine(&tmp, QueryEngineConfig::default()).await;
        write_generation(&registry, tmp.path(), 1, 1, TEXT).await;
        let params = QueryParams {
            top_k: Some(3),
            min_score: Some(1.5),
        };
        let answer = engine.query(1, "registry", &params).await.unwrap();
        assert!(answer.sources.is_empty());
        assert_eq!(answer.text, NO_CONTEXT_ANSWER);
    }

    #[tokio::test]
    async fn test_stale_record_follows_swap() {
        let tmp = TempDir::new().unwrap();
        let (engine, registry) = engine(&tmp, QueryEngineConfig::default()).await;
        let old = write_generation(&registry, tmp.path(), 1, 1, TEXT).await;
        write_generation(&registry, tmp.path(), 1, 2, TEXT).await;
        std::fs::remove_dir_all(old.storage_path.as_deref().unwrap()).unwrap();

        let (_, served) = engine
            .query_record(&old, "registry", &QueryParams::default())
            .await
            .unwrap();
        assert_eq!(served, 2);
    }

    #[tokio::test]
    async fn test_unloadable_index_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let (engine, registry) = engine(&tmp, QueryEngineConfig::default()).await;
        let record = write_generation(&registry, tmp.path(), 1, 1, TEXT).await;
        let dir = record.storage_path.unwrap();
        std::fs::write(dir.join(artifacts::VECTORS), b"garbage").unwrap();
        assert!(matches!(
            engine.query(1, "registry", &QueryParams::default()).await,
            Err(QueryError::Load { document_id: 1, .. })
        ));
    }

    #[tokio::test]
    async fn test_lru_bounded_by_count() {
        let tmp = TempDir::new().unwrap();
        let limits = QueryEngineConfig {
            max_loaded_indexes: 2,
            ..QueryEngineConfig::default()
        };
        let (engine, registry) = engine(&tmp, limits).await;
        for id in 1..=3 {
            write_generation(&registry, tmp.path(), id, 1, TEXT).await;
        }
        let p = QueryParams::default();
        engine.query(1, "registry", &p).await.unwrap();
        engine.query(2, "registry", &p).await.unwrap();
        engine.query(1, "registry", &p).await.unwrap();
        engine.query(3, "registry", &p).await.unwrap();

        assert!(engine.is_loaded(1, 1));
        assert!(!engine.is_loaded(2, 1));
        assert!(engine.is_loaded(3, 1));
        assert_eq!(engine.loaded_stats().indexes, 2);

        assert_eq!(engine.evict(1), 1);
        assert!(!engine.is_loaded(1, 1));
        assert_eq!(engine.loaded_stats().indexes, 1);
    }

    #[tokio::test]
    async fn test_byte_budget() {
        let tmp = TempDir::new().unwrap();
        let limits = QueryEngineConfig {
            max_loaded_indexes: 16,
            max_loaded_bytes: 1,
        };
        let (engine, registry) = engine(&tmp, limits).await;
        write_generation(&registry, tmp.path(), 1, 1, TEXT).await;
        engine.query(1, "registry", &QueryParams::default()).await.unwrap();
        assert!(!engine.is_loaded(1, 1));
        assert_eq!(engine.loaded_stats(), LoadedStats::default());
    }

    #[test]
    fn test_excerpt_truncates_on_char_boundary() {
        let long = "é".repeat(EXCERPT_CHARS + 10);
        let e = excerpt(&long);
        assert!(e.ends_with('…'));
        assert_eq!(e.chars().count(), EXCERPT_CHARS + 1);
        assert_eq!(excerpt("  short "), "short");
    }
}
