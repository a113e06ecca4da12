//! `ragctl` command implementations.
//!
//! Each `run_*` function opens what it needs from the configuration,
//! performs one coordinator operation, and prints the result to stdout,
//! either as aligned `key: value` lines or as JSON with `--json`.

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use rag_lifecycle_core::models::{DocumentId, QueryParams};
use serde::Serialize;
use tracing::warn;

use crate::config::{load_config, Config};
use crate::coordinator::Coordinator;
use crate::documents::SqliteDocumentRepository;
use crate::embedding::create_provider;
use crate::file_manager::FileManager;
use crate::llm::create_llm;
use crate::{db, migrate};

/// A coordinator plus the document table it reads from.
pub struct App {
    pub coordinator: Coordinator,
    pub documents: Arc<SqliteDocumentRepository>,
}

pub async fn open_app(config: &Config) -> Result<App> {
    let pool = db::connect(config).await?;
    migrate::run_migrations(&pool).await?;
    let documents = Arc::new(SqliteDocumentRepository::new(pool.clone()));
    if !config.embedding.is_enabled() {
        warn!("embedding provider is disabled; builds and queries will fail");
    }
    let embedder = create_provider(&config.embedding)?;
    let llm = create_llm(&config.llm)?;
    let coordinator =
        Coordinator::with_pool(config.clone(), pool, documents.clone(), embedder, llm).await?;
    Ok(App {
        coordinator,
        documents,
    })
}

fn emit<T: Serialize>(json: bool, value: &T, human: impl FnOnce(&T)) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        human(value);
    }
    Ok(())
}

/// Default configuration written by `ragctl init`.
pub fn default_config_toml(root: &Path) -> String {
    format!(
        r#"[db]
path = "{root}/rag.sqlite"

[storage]
index_root = "{root}/indexes"

[chunking]
strategy = "hybrid"
max_chunk_size = 1024
overlap = 128
min_chunk_size = 256
preserve_citations = true

[embedding]
# "hash" works offline; "openai" needs OPENAI_API_KEY, model, and dims.
provider = "hash"
dims = 256
batch_size = 64

[llm]
# "extractive" works offline; "openai" needs OPENAI_API_KEY and model.
provider = "extractive"

[retrieval]
top_k = 5

[cache]
enabled = true
ttl_secs = 3600
max_entries = 1000

[recovery]
critical_ratio = 0.5
auto_repair = true
"#,
        root = root.display()
    )
}

/// Write a default config if none exists, then create the database and
/// index layout.
pub async fn run_init(config_path: &Path, root: &Path) -> Result<()> {
    if !config_path.exists() {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        std::fs::write(config_path, default_config_toml(root))
            .with_context(|| format!("Failed to write {}", config_path.display()))?;
        println!("Wrote default config to {}", config_path.display());
    }

    let config = load_config(config_path)?;
    let pool = db::connect(&config).await?;
    migrate::run_migrations(&pool).await?;
    FileManager::new(&config.storage.index_root)
        .ensure_layout()
        .await?;
    pool.close().await;
    println!("Database and index storage initialized.");
    Ok(())
}

pub async fn run_add(config: &Config, path: &Path, title: Option<&str>, json: bool) -> Result<()> {
    let path = tokio::fs::canonicalize(path)
        .await
        .with_context(|| format!("Cannot read {}", path.display()))?;
    let app = open_app(config).await?;
    let document = app.documents.add(&path, title).await?;
    emit(json, &document, |d| {
        println!("added document {} ({})", d.id, d.path.display());
    })
}

pub async fn run_build(config: &Config, id: DocumentId, overwrite: bool, json: bool) -> Result<()> {
    let app = open_app(config).await?;
    let result = app.coordinator.build_index(id, overwrite).await?;
    emit(json, &result, |r| {
        println!("document:    {}", r.document_id);
        println!("status:      {}", r.status);
        println!("generation:  {}", r.generation);
        println!("chunks:      {}", r.chunk_count);
        println!("reused:      {}", r.reused);
    })
}

pub async fn run_query(
    config: &Config,
    id: DocumentId,
    text: &str,
    params: QueryParams,
    json: bool,
) -> Result<()> {
    let app = open_app(config).await?;
    let result = app.coordinator.query(id, text, &params).await?;
    emit(json, &result, |r| {
        println!("{}", r.answer);
        println!();
        println!("--- Sources (generation {}) ---", r.generation);
        for source in &r.sources {
            println!(
                "[chunk {}] score {:.3}, bytes {}..{}",
                source.chunk_index, source.score, source.start, source.end
            );
            println!("  {}", source.excerpt);
        }
    })
}

pub async fn run_status(config: &Config, id: DocumentId, json: bool) -> Result<()> {
    let app = open_app(config).await?;
    let status = app.coordinator.get_status(id).await?;
    emit(json, &status, |s| {
        println!("document:    {}", s.document_id);
        println!("status:      {}", s.status);
        println!("generation:  {}", s.generation);
        println!("chunks:      {}", s.chunk_count);
        if let Some(path) = &s.storage_path {
            println!("path:        {}", path.display());
        }
    })
}

pub async fn run_recover(config: &Config, id: DocumentId, force_rebuild: bool, json: bool) -> Result<()> {
    let app = open_app(config).await?;
    let result = app.coordinator.recover(id, force_rebuild).await?;
    emit(json, &result, |r| {
        println!("document:    {}", r.document_id);
        println!("severity:    {}", r.severity);
        println!("action:      {}", r.action);
        println!("status:      {}", r.new_status);
        println!("generation:  {}", r.generation);
    })
}

pub async fn run_health(config: &Config, json: bool) -> Result<()> {
    let app = open_app(config).await?;
    let report = app.coordinator.health_check().await?;
    emit(json, &report, |r| {
        println!("overall:     {}", r.overall_status);
        println!("storage:     {}", if r.storage_accessible { "accessible" } else { "inaccessible" });
        for d in &r.per_document {
            println!(
                "  doc {:>6}  g{:<4} {:<10} {:<9} {}",
                d.document_id, d.generation, d.status, d.severity, d.recommended_action
            );
        }
    })
}

pub async fn run_cache_stats(config: &Config, json: bool) -> Result<()> {
    let app = open_app(config).await?;
    let stats = app.coordinator.cache_stats();
    if !json {
        eprintln!("note: the response cache is per process; a fresh ragctl process starts empty");
    }
    emit(json, &stats, |s| {
        println!("entries:       {}", s.entries);
        println!("hits:          {}", s.hits);
        println!("misses:        {}", s.misses);
        println!("hit rate:      {:.1}%", s.hit_rate() * 100.0);
        println!("evictions:     {}", s.evictions);
        println!("expirations:   {}", s.expirations);
        println!("invalidations: {}", s.invalidations);
    })
}

pub async fn run_cache_clear(config: &Config, document: Option<DocumentId>) -> Result<()> {
    let app = open_app(config).await?;
    let removed = app.coordinator.clear_cache(document);
    println!("removed {removed} cached answers");
    Ok(())
}

/// Delete a document's index and its registration.
pub async fn run_delete(config: &Config, id: DocumentId) -> Result<()> {
    let app = open_app(config).await?;
    let had_index = app.coordinator.delete_document(id).await?;
    let had_document = app.documents.remove(id).await?;
    if !had_index && !had_document {
        bail!("document {} not found", id);
    }
    println!("deleted document {id}");
    Ok(())
}

pub async fn run_cleanup(config: &Config) -> Result<()> {
    let app = open_app(config).await?;
    match app.coordinator.cleanup_orphans().await? {
        Some(removed) => println!("removed {removed} orphaned index directories"),
        None => println!("builds in progress, cleanup skipped"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config_parses_and_validates() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("ragctl.toml");
        std::fs::write(&path, default_config_toml(tmp.path())).unwrap();
        let config = load_config(&path).unwrap();
        assert_eq!(config.db.path, tmp.path().join("rag.sqlite"));
        assert_eq!(config.embedding.provider, "hash");
        assert_eq!(config.llm.provider, "extractive");
    }

    #[tokio::test]
    async fn test_init_add_build() {
        let tmp = TempDir::new().unwrap();
        let config_path = tmp.path().join("config/ragctl.toml");
        run_init(&config_path, tmp.path()).await.unwrap();
        let config = load_config(&config_path).unwrap();

        let doc = tmp.path().join("doc.txt");
        std::fs::write(&doc, "The CLI registers documents. Then it builds their indexes.").unwrap();
        run_add(&config, &doc, Some("Doc"), false).await.unwrap();

        let app = open_app(&config).await.unwrap();
        let result = app.coordinator.build_index(1, false).await.unwrap();
        assert_eq!(result.generation, 1);
    }
}
