//! Integration tests for the document index lifecycle.
//!
//! These drive a [`Coordinator`] end-to-end with instrumented providers:
//! builds, deduplication, concurrent builds, generation swaps under load,
//! corruption repair, health reporting, and the response cache.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rag_lifecycle::artifacts::{CHECKSUMS, CHUNKS, STATS, VECTORS};
use rag_lifecycle::config::Config;
use rag_lifecycle::coordinator::Coordinator;
use rag_lifecycle::embedding::HashEmbedder;
use rag_lifecycle::error::{ProcessingError, QueryError};
use rag_lifecycle::file_manager::FileManager;
use rag_lifecycle_core::chunk::StrategyKind;
use rag_lifecycle_core::embedding::EmbeddingProvider;
use rag_lifecycle_core::error::ProviderError;
use rag_lifecycle_core::llm::LlmProvider;
use rag_lifecycle_core::models::{
    Document, DocumentId, HealthStatus, IndexStatus, QueryParams, RepairAction, Severity,
};
use rag_lifecycle_core::repository::InMemoryDocumentRepository;
use tempfile::TempDir;
use tokio::sync::Notify;

// ─── Test Providers ─────────────────────────────────────────────────

/// Hash embedder that counts document batches and can fail or stall them.
///
/// Query embeddings are single texts; every test document chunks into
/// several pieces, so a batch of more than one text is a build.
struct TestEmbedder {
    inner: HashEmbedder,
    batches: AtomicUsize,
    fail_batches: AtomicBool,
    gated: AtomicBool,
    gate: Notify,
    delay: Duration,
}

impl TestEmbedder {
    fn new() -> Self {
        Self::with_delay(Duration::ZERO)
    }

    fn with_delay(delay: Duration) -> Self {
        Self {
            inner: HashEmbedder::new(64),
            batches: AtomicUsize::new(0),
            fail_batches: AtomicBool::new(false),
            gated: AtomicBool::new(false),
            gate: Notify::new(),
            delay,
        }
    }

    fn batches(&self) -> usize {
        self.batches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EmbeddingProvider for TestEmbedder {
    fn model_name(&self) -> &str {
        self.inner.model_name()
    }

    fn dims(&self) -> usize {
        self.inner.dims()
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        if texts.len() > 1 {
            self.batches.fetch_add(1, Ordering::SeqCst);
            if self.fail_batches.load(Ordering::SeqCst) {
                return Err(ProviderError::Fatal("embedding service rejected the batch".into()));
            }
            if self.gated.load(Ordering::SeqCst) {
                self.gate.notified().await;
            }
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
        }
        self.inner.embed(texts).await
    }
}

/// LLM that answers with a fixed string and counts calls.
struct ScriptedLlm {
    calls: AtomicUsize,
}

impl ScriptedLlm {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmProvider for ScriptedLlm {
    fn model_name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, prompt: &str) -> Result<String, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        assert!(prompt.contains("[1] "), "prompt carries no context");
        Ok("Scripted answer [1].".to_string())
    }
}

// ─── Harness ────────────────────────────────────────────────────────

struct Harness {
    tmp: TempDir,
    repo: Arc<InMemoryDocumentRepository>,
    embedder: Arc<TestEmbedder>,
    llm: Arc<ScriptedLlm>,
    coordinator: Coordinator,
}

fn test_config(tmp: &TempDir) -> Config {
    let mut config = Config::for_root(tmp.path());
    config.chunking.strategy = StrategyKind::Sentence;
    config.chunking.max_chunk_size = 100;
    config.chunking.overlap = 10;
    config.chunking.min_chunk_size = 40;
    config
}

async fn harness_with(embedder: TestEmbedder) -> Harness {
    let tmp = TempDir::new().unwrap();
    let repo = Arc::new(InMemoryDocumentRepository::new());
    let embedder = Arc::new(embedder);
    let llm = Arc::new(ScriptedLlm {
        calls: AtomicUsize::new(0),
    });
    let coordinator = Coordinator::open(test_config(&tmp), repo.clone(), embedder.clone(), llm.clone())
        .await
        .unwrap();
    Harness {
        tmp,
        repo,
        embedder,
        llm,
        coordinator,
    }
}

async fn harness() -> Harness {
    harness_with(TestEmbedder::new()).await
}

/// A 60-character sentence about `topic`, without digits or citations.
fn sentence(topic: &str) -> String {
    let mut s = format!("The {topic} section");
    while s.len() < 59 {
        s.push_str(" more");
    }
    s.truncate(59);
    s.push('.');
    s
}

/// Three sentences; chunks into exactly three pieces under `test_config`.
fn three_part_text(topics: [&str; 3]) -> String {
    topics.map(sentence).join(" ")
}

impl Harness {
    fn add_doc(&self, id: DocumentId, text: &str) -> std::path::PathBuf {
        let path = self.tmp.path().join(format!("doc{id}.txt"));
        std::fs::write(&path, text).unwrap();
        self.repo.insert(Document::new(id, &path));
        path
    }

    fn staging_entries(&self) -> usize {
        let staging = FileManager::new(&self.coordinator.config().storage.index_root).staging_dir();
        std::fs::read_dir(staging).unwrap().count()
    }

    async fn index_dir(&self, id: DocumentId) -> std::path::PathBuf {
        self.coordinator
            .get_status(id)
            .await
            .unwrap()
            .storage_path
            .unwrap()
    }
}

fn params() -> QueryParams {
    QueryParams::default()
}

// ─── Build and Query ────────────────────────────────────────────────

#[tokio::test]
async fn test_document_lifecycle_end_to_end() {
    let h = harness().await;
    h.add_doc(42, &three_part_text(["alpha", "beta", "gamma"]));

    let built = h.coordinator.build_index(42, false).await.unwrap();
    assert_eq!(built.status, IndexStatus::Ready);
    assert_eq!(built.generation, 1);
    assert_eq!(built.chunk_count, 3);
    assert!(!built.reused);
    let first_dir = h.index_dir(42).await;

    let answer = h
        .coordinator
        .query(42, "What is in the beta section?", &params())
        .await
        .unwrap();
    assert!(!answer.cache_hit);
    assert_eq!(answer.generation, 1);
    assert!(!answer.sources.is_empty());
    assert_eq!(answer.answer, "Scripted answer [1].");

    let again = h
        .coordinator
        .query(42, "  what is in the BETA   section? ", &params())
        .await
        .unwrap();
    assert!(again.cache_hit);
    assert_eq!(again.answer, answer.answer);
    assert_eq!(h.llm.calls(), 1);

    let rebuilt = h.coordinator.rebuild_index(42).await.unwrap();
    assert_eq!(rebuilt.generation, 2);
    assert!(!rebuilt.reused);
    assert!(!first_dir.exists());

    let after = h
        .coordinator
        .query(42, "What is in the beta section?", &params())
        .await
        .unwrap();
    assert!(!after.cache_hit);
    assert_eq!(after.generation, 2);
    assert_eq!(h.llm.calls(), 2);

    let status = h.coordinator.get_status(42).await.unwrap();
    assert_eq!(status.status, IndexStatus::Ready);
    assert_eq!(status.generation, 2);
    assert!(!status.rebuilding);
}

#[tokio::test]
async fn test_up_to_date_index_is_not_rebuilt() {
    let h = harness().await;
    h.add_doc(1, &three_part_text(["north", "south", "east"]));
    h.coordinator.build_index(1, false).await.unwrap();

    let second = h.coordinator.build_index(1, false).await.unwrap();
    assert!(second.reused);
    assert_eq!(second.generation, 1);
    assert_eq!(h.embedder.batches(), 1);
}

#[tokio::test]
async fn test_changed_document_gets_new_generation() {
    let h = harness().await;
    let path = h.add_doc(1, &three_part_text(["north", "south", "east"]));
    h.coordinator.build_index(1, false).await.unwrap();

    std::fs::write(&path, three_part_text(["north", "south", "west"])).unwrap();
    let result = h.coordinator.build_index(1, false).await.unwrap();
    assert!(!result.reused);
    assert_eq!(result.generation, 2);
}

#[tokio::test]
async fn test_identical_documents_share_one_index() {
    let h = harness().await;
    let text = three_part_text(["shared", "common", "same"]);
    h.add_doc(1, &text);
    h.add_doc(2, &text);

    h.coordinator.build_index(1, false).await.unwrap();
    assert_eq!(h.embedder.batches(), 1);

    let second = h.coordinator.build_index(2, false).await.unwrap();
    assert!(second.reused);
    assert_eq!(second.status, IndexStatus::Ready);
    assert_eq!(h.embedder.batches(), 1);
    let shared = h.index_dir(1).await;
    assert_eq!(h.index_dir(2).await, shared);

    assert!(h.coordinator.delete_document(1).await.unwrap());
    assert!(shared.exists());
    let answer = h
        .coordinator
        .query(2, "What is in the common section?", &params())
        .await
        .unwrap();
    assert_eq!(answer.generation, 1);
}

#[tokio::test]
async fn test_concurrent_builds_embed_once() {
    let h = harness_with(TestEmbedder::with_delay(Duration::from_millis(50))).await;
    h.add_doc(7, &three_part_text(["red", "green", "blue"]));

    let c = &h.coordinator;
    let (a, b, d, e) = tokio::join!(
        c.build_index(7, false),
        c.build_index(7, false),
        c.build_index(7, false),
        c.build_index(7, false),
    );
    let results = [a.unwrap(), b.unwrap(), d.unwrap(), e.unwrap()];
    assert!(results.iter().all(|r| r.generation == 1));
    assert_eq!(results.iter().filter(|r| !r.reused).count(), 1);
    assert_eq!(h.embedder.batches(), 1);
}

#[tokio::test]
async fn test_rebuild_swaps_without_disturbing_readers() {
    let h = harness().await;
    h.add_doc(42, &three_part_text(["alpha", "beta", "gamma"]));
    h.coordinator.build_index(42, false).await.unwrap();

    h.embedder.gated.store(true, Ordering::SeqCst);
    let c = &h.coordinator;
    let reader = async {
        while !c.get_status(42).await.unwrap().rebuilding {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let served = c
            .query(42, "What is in the gamma section?", &params())
            .await
            .unwrap();
        h.embedder.gate.notify_one();
        served
    };
    let (rebuilt, served) = tokio::join!(c.rebuild_index(42), reader);

    assert_eq!(served.generation, 1);
    assert_eq!(rebuilt.unwrap().generation, 2);

    let after = c
        .query(42, "What is in the gamma section?", &params())
        .await
        .unwrap();
    assert_eq!(after.generation, 2);
    assert!(!after.cache_hit);
    assert_eq!(c.loaded_stats().indexes, 1);
}

#[tokio::test]
async fn test_failed_rebuild_keeps_previous_generation() {
    let h = harness().await;
    h.add_doc(42, &three_part_text(["alpha", "beta", "gamma"]));
    h.coordinator.build_index(42, false).await.unwrap();
    let dir = h.index_dir(42).await;

    h.embedder.fail_batches.store(true, Ordering::SeqCst);
    let err = h.coordinator.rebuild_index(42).await.unwrap_err();
    assert!(matches!(err, ProcessingError::Index(_)), "unexpected error: {err}");

    let status = h.coordinator.get_status(42).await.unwrap();
    assert_eq!(status.status, IndexStatus::Ready);
    assert_eq!(status.generation, 1);
    assert_eq!(status.storage_path.as_deref(), Some(dir.as_path()));
    assert!(dir.exists());

    assert_eq!(h.staging_entries(), 0);

    let answer = h
        .coordinator
        .query(42, "What is in the alpha section?", &params())
        .await
        .unwrap();
    assert_eq!(answer.generation, 1);
}

#[tokio::test]
async fn test_cancelled_rebuild_discards_staging() {
    let h = harness().await;
    h.add_doc(42, &three_part_text(["alpha", "beta", "gamma"]));
    h.coordinator.build_index(42, false).await.unwrap();
    let dir = h.index_dir(42).await;

    h.embedder.gated.store(true, Ordering::SeqCst);
    let mut rebuild = Box::pin(h.coordinator.rebuild_index(42));
    let staged = tokio::time::timeout(Duration::from_secs(5), async {
        tokio::select! {
            _ = &mut rebuild => panic!("rebuild finished while the embedder was gated"),
            n = async {
                loop {
                    let n = h.staging_entries();
                    if n > 0 {
                        return n;
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            } => n,
        }
    })
    .await
    .expect("rebuild never reached staging");
    assert_eq!(staged, 1);
    assert!(h.coordinator.get_status(42).await.unwrap().rebuilding);

    // Dropping the future cancels the rebuild mid-embedding.
    drop(rebuild);
    assert_eq!(h.staging_entries(), 0);

    let status = h.coordinator.get_status(42).await.unwrap();
    assert_eq!(status.status, IndexStatus::Ready);
    assert_eq!(status.generation, 1);
    assert!(!status.rebuilding);
    assert_eq!(status.storage_path.as_deref(), Some(dir.as_path()));

    h.embedder.gated.store(false, Ordering::SeqCst);
    let answer = h
        .coordinator
        .query(42, "What is in the alpha section?", &params())
        .await
        .unwrap();
    assert_eq!(answer.generation, 1);
}

#[tokio::test]
async fn test_failed_commit_keeps_previous_generation() {
    let h = harness().await;
    h.add_doc(42, &three_part_text(["alpha", "beta", "gamma"]));
    h.coordinator.build_index(42, false).await.unwrap();
    let dir = h.index_dir(42).await;

    // A plain file squatting on the next generation's directory name makes
    // the rename into active/ fail after every artifact is written.
    let blocker = dir.with_file_name("doc-42-g2");
    std::fs::write(&blocker, b"not a directory").unwrap();

    let err = h.coordinator.rebuild_index(42).await.unwrap_err();
    assert!(matches!(err, ProcessingError::Index(_)), "unexpected error: {err}");
    assert_eq!(h.embedder.batches(), 2);
    assert_eq!(h.staging_entries(), 0);

    let status = h.coordinator.get_status(42).await.unwrap();
    assert_eq!(status.status, IndexStatus::Ready);
    assert_eq!(status.generation, 1);
    assert_eq!(status.storage_path.as_deref(), Some(dir.as_path()));
    assert!(dir.exists());

    let answer = h
        .coordinator
        .query(42, "What is in the alpha section?", &params())
        .await
        .unwrap();
    assert_eq!(answer.generation, 1);
}

// ─── Corruption and Repair ──────────────────────────────────────────

#[tokio::test]
async fn test_minor_damage_is_repaired_in_place() {
    let h = harness().await;
    h.add_doc(42, &three_part_text(["alpha", "beta", "gamma"]));
    h.coordinator.build_index(42, false).await.unwrap();
    let dir = h.index_dir(42).await;
    std::fs::remove_file(dir.join(STATS)).unwrap();

    let result = h.coordinator.recover(42, false).await.unwrap();
    assert_eq!(result.severity, Severity::Minor);
    assert_eq!(result.action, RepairAction::RegenerateArtifacts);
    assert_eq!(result.generation, 1);
    assert_eq!(result.new_status, IndexStatus::Ready);
    assert!(dir.join(STATS).exists());
}

#[tokio::test]
async fn test_moderate_damage_rebuilds_reusing_vectors() {
    let h = harness().await;
    h.add_doc(42, &three_part_text(["alpha", "beta", "gamma"]));
    h.coordinator.build_index(42, false).await.unwrap();
    let dir = h.index_dir(42).await;
    std::fs::remove_file(dir.join(STATS)).unwrap();
    std::fs::remove_file(dir.join(CHECKSUMS)).unwrap();

    let result = h.coordinator.recover(42, false).await.unwrap();
    assert_eq!(result.severity, Severity::Moderate);
    assert_eq!(result.action, RepairAction::PartialRebuild);
    assert_eq!(result.generation, 2);
    assert_eq!(h.embedder.batches(), 1);
    assert!(!dir.exists());
}

#[tokio::test]
async fn test_severe_damage_rebuilds_from_source() {
    let h = harness().await;
    h.add_doc(42, &three_part_text(["alpha", "beta", "gamma"]));
    h.coordinator.build_index(42, false).await.unwrap();
    let dir = h.index_dir(42).await;
    std::fs::write(dir.join(VECTORS), b"not vectors").unwrap();

    let result = h.coordinator.recover(42, false).await.unwrap();
    assert_eq!(result.severity, Severity::Severe);
    assert_eq!(result.action, RepairAction::FullRebuild);
    assert_eq!(result.generation, 2);
    assert_eq!(h.embedder.batches(), 2);
}

#[tokio::test]
async fn test_query_repairs_damaged_index() {
    let h = harness().await;
    h.add_doc(42, &three_part_text(["alpha", "beta", "gamma"]));
    h.coordinator.build_index(42, false).await.unwrap();
    let dir = h.index_dir(42).await;
    std::fs::write(dir.join(CHUNKS), b"[]").unwrap();

    let answer = h
        .coordinator
        .query(42, "What is in the alpha section?", &params())
        .await
        .unwrap();
    assert_eq!(answer.generation, 2);
    assert!(!answer.sources.is_empty());
    assert_eq!(
        h.coordinator.get_status(42).await.unwrap().status,
        IndexStatus::Ready
    );
}

#[tokio::test]
async fn test_query_fails_when_repair_is_impossible() {
    let h = harness().await;
    let source = h.add_doc(42, &three_part_text(["alpha", "beta", "gamma"]));
    h.coordinator.build_index(42, false).await.unwrap();
    let dir = h.index_dir(42).await;
    std::fs::write(dir.join(VECTORS), b"not vectors").unwrap();
    std::fs::remove_file(source).unwrap();

    let err = h
        .coordinator
        .query(42, "What is in the alpha section?", &params())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ProcessingError::Query(QueryError::Degraded {
            document_id: 42,
            severity: Severity::Severe,
        })
    ));
    assert_eq!(
        h.coordinator.get_status(42).await.unwrap().status,
        IndexStatus::Corrupted
    );
}

#[tokio::test]
async fn test_health_check_reports_overall_status() {
    let h = harness().await;
    h.add_doc(1, &three_part_text(["north", "south", "east"]));
    h.add_doc(2, &three_part_text(["alpha", "beta", "gamma"]));
    h.add_doc(3, &three_part_text(["red", "green", "blue"]));
    for id in 1..=3 {
        h.coordinator.build_index(id, false).await.unwrap();
    }

    let report = h.coordinator.health_check().await.unwrap();
    assert_eq!(report.overall_status, HealthStatus::Healthy);
    assert_eq!(report.per_document.len(), 3);

    std::fs::remove_file(h.index_dir(1).await.join(STATS)).unwrap();
    let report = h.coordinator.health_check().await.unwrap();
    assert_eq!(report.overall_status, HealthStatus::Degraded);
    assert_eq!(
        h.coordinator.get_status(1).await.unwrap().status,
        IndexStatus::Degraded
    );

    // Minor damage is served and repaired on first use.
    let answer = h
        .coordinator
        .query(1, "What is in the south section?", &params())
        .await
        .unwrap();
    assert_eq!(answer.generation, 1);
    assert_eq!(
        h.coordinator.get_status(1).await.unwrap().status,
        IndexStatus::Ready
    );

    std::fs::write(h.index_dir(2).await.join(VECTORS), b"x").unwrap();
    std::fs::write(h.index_dir(3).await.join(VECTORS), b"x").unwrap();
    let report = h.coordinator.health_check().await.unwrap();
    assert_eq!(report.overall_status, HealthStatus::Critical);
    assert_eq!(
        h.coordinator.get_status(2).await.unwrap().status,
        IndexStatus::Corrupted
    );
}

// ─── Response Cache ─────────────────────────────────────────────────

#[tokio::test]
async fn test_cache_is_keyed_by_params_and_clearable() {
    let h = harness().await;
    h.add_doc(42, &three_part_text(["alpha", "beta", "gamma"]));
    h.coordinator.build_index(42, false).await.unwrap();
    let question = "What is in the beta section?";

    let one = QueryParams::with_top_k(1);
    let two = QueryParams::with_top_k(2);
    assert!(!h.coordinator.query(42, question, &one).await.unwrap().cache_hit);
    assert!(!h.coordinator.query(42, question, &two).await.unwrap().cache_hit);
    assert!(h.coordinator.query(42, question, &one).await.unwrap().cache_hit);

    let stats = h.coordinator.cache_stats();
    assert_eq!(stats.entries, 2);
    assert_eq!(stats.hits, 1);

    assert_eq!(h.coordinator.clear_cache(Some(42)), 2);
    assert!(!h.coordinator.query(42, question, &one).await.unwrap().cache_hit);
    assert_eq!(h.llm.calls(), 3);
}
