//! TOML configuration.
//!
//! ```toml
//! [db]
//! path = "./data/rag.sqlite"
//!
//! [storage]
//! index_root = "./data/indexes"
//!
//! [chunking]
//! strategy = "hybrid"
//! max_chunk_size = 1024
//! overlap = 128
//!
//! [embedding]
//! provider = "openai"
//! model = "text-embedding-3-small"
//! dims = 1536
//!
//! [llm]
//! provider = "openai"
//! model = "gpt-4o-mini"
//! ```
//!
//! Every section except `[db]` and `[storage]` may be omitted.

use anyhow::{Context, Result};
use rag_lifecycle_core::chunk::{ChunkConfig, StrategyKind};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::retry::RetryPolicy;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub query_engine: QueryEngineConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Holds `active/` and `staging/` artifact directories.
    pub index_root: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_strategy")]
    pub strategy: StrategyKind,
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: usize,
    #[serde(default = "default_overlap")]
    pub overlap: usize,
    #[serde(default = "default_min_chunk_size")]
    pub min_chunk_size: usize,
    #[serde(default = "default_true")]
    pub preserve_citations: bool,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            strategy: default_strategy(),
            max_chunk_size: default_max_chunk_size(),
            overlap: default_overlap(),
            min_chunk_size: default_min_chunk_size(),
            preserve_citations: true,
        }
    }
}

impl ChunkingConfig {
    pub fn chunk_config(&self) -> ChunkConfig {
        ChunkConfig {
            max_chunk_size: self.max_chunk_size,
            overlap: self.overlap,
            min_chunk_size: self.min_chunk_size,
            preserve_citations: self.preserve_citations,
        }
    }
}

fn default_strategy() -> StrategyKind {
    StrategyKind::Hybrid
}
fn default_max_chunk_size() -> usize {
    1024
}
fn default_overlap() -> usize {
    128
}
fn default_min_chunk_size() -> usize {
    256
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// First backoff delay; doubles per attempt up to 2^5 times this.
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            dims: None,
            batch_size: 64,
            max_retries: 5,
            timeout_secs: 30,
            retry_base_ms: 1000,
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, Duration::from_millis(self.retry_base_ms))
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_retry_base_ms() -> u64 {
    1000
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_llm_retries")]
    pub max_retries: u32,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            max_tokens: default_max_tokens(),
            max_retries: default_llm_retries(),
            timeout_secs: default_llm_timeout_secs(),
            retry_base_ms: default_retry_base_ms(),
        }
    }
}

impl LlmConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, Duration::from_millis(self.retry_base_ms))
    }
}

fn default_max_tokens() -> u32 {
    512
}
fn default_llm_retries() -> u32 {
    3
}
fn default_llm_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default)]
    pub min_score: Option<f32>,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            min_score: None,
        }
    }
}

fn default_top_k() -> usize {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: default_ttl_secs(),
            max_entries: default_max_entries(),
        }
    }
}

fn default_ttl_secs() -> u64 {
    3600
}
fn default_max_entries() -> usize {
    1000
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueryEngineConfig {
    /// Loaded indexes kept in memory.
    #[serde(default = "default_max_loaded_indexes")]
    pub max_loaded_indexes: usize,
    /// Approximate byte budget for loaded vectors and chunk text.
    #[serde(default = "default_max_loaded_bytes")]
    pub max_loaded_bytes: usize,
}

impl Default for QueryEngineConfig {
    fn default() -> Self {
        Self {
            max_loaded_indexes: default_max_loaded_indexes(),
            max_loaded_bytes: default_max_loaded_bytes(),
        }
    }
}

fn default_max_loaded_indexes() -> usize {
    16
}
fn default_max_loaded_bytes() -> usize {
    256 * 1024 * 1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct RecoveryConfig {
    /// Fraction of severely damaged indexes at which overall health
    /// becomes critical.
    #[serde(default = "default_critical_ratio")]
    pub critical_ratio: f64,
    /// Repair a damaged index once before failing a query on it.
    #[serde(default = "default_true")]
    pub auto_repair: bool,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            critical_ratio: default_critical_ratio(),
            auto_repair: true,
        }
    }
}

fn default_critical_ratio() -> f64 {
    0.5
}

impl Config {
    /// Default configuration with the database and indexes under `root`.
    pub fn for_root(root: &Path) -> Self {
        Self {
            db: DbConfig {
                path: root.join("rag.sqlite"),
            },
            storage: StorageConfig {
                index_root: root.join("indexes"),
            },
            chunking: ChunkingConfig::default(),
            embedding: EmbeddingConfig::default(),
            llm: LlmConfig::default(),
            retrieval: RetrievalConfig::default(),
            cache: CacheConfig::default(),
            query_engine: QueryEngineConfig::default(),
            recovery: RecoveryConfig::default(),
        }
    }

    /// Check value ranges and provider requirements.
    pub fn validate(&self) -> Result<()> {
        // Validate chunking
        self.chunking
            .chunk_config()
            .validate()
            .with_context(|| "Invalid [chunking] section")?;

        // Validate retrieval
        if self.retrieval.top_k < 1 {
            anyhow::bail!("retrieval.top_k must be >= 1");
        }

        // Validate recovery
        if !(self.recovery.critical_ratio > 0.0 && self.recovery.critical_ratio <= 1.0) {
            anyhow::bail!("recovery.critical_ratio must be in (0.0, 1.0]");
        }

        if self.cache.enabled && self.cache.max_entries == 0 {
            anyhow::bail!("cache.max_entries must be > 0 when the cache is enabled");
        }

        if self.query_engine.max_loaded_indexes == 0 {
            anyhow::bail!("query_engine.max_loaded_indexes must be > 0");
        }

        // Validate embedding
        if self.embedding.batch_size == 0 {
            anyhow::bail!("embedding.batch_size must be > 0");
        }

        match self.embedding.provider.as_str() {
            "disabled" => {}
            "openai" => {
                if self.embedding.model.is_none() {
                    anyhow::bail!("embedding.model must be specified when provider is 'openai'");
                }
                if self.embedding.dims.is_none() || self.embedding.dims == Some(0) {
                    anyhow::bail!("embedding.dims must be > 0 when provider is 'openai'");
                }
            }
            "hash" => {
                if self.embedding.dims == Some(0) {
                    anyhow::bail!("embedding.dims must be > 0 when provider is 'hash'");
                }
            }
            other => anyhow::bail!(
                "Unknown embedding provider: '{}'. Must be disabled, openai, or hash.",
                other
            ),
        }

        // Validate llm
        match self.llm.provider.as_str() {
            "disabled" | "extractive" => {}
            "openai" => {
                if self.llm.model.is_none() {
                    anyhow::bail!("llm.model must be specified when provider is 'openai'");
                }
            }
            other => anyhow::bail!(
                "Unknown llm provider: '{}'. Must be disabled, openai, or extractive.",
                other
            ),
        }

        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.validate()?;

    Ok(config)
}
