//! Error types shared by the core crate.
//!
//! The application crate wraps these in its own index/query/recovery
//! taxonomy; they are kept here because the traits that return them
//! ([`ChunkingStrategy`](crate::chunk::ChunkingStrategy),
//! [`EmbeddingProvider`](crate::embedding::EmbeddingProvider),
//! [`LlmProvider`](crate::llm::LlmProvider),
//! [`DocumentRepository`](crate::repository::DocumentRepository)) live here.

use thiserror::Error;

/// Chunking errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChunkError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("unknown chunking strategy: {0}")]
    UnknownStrategy(String),
}

/// Errors returned by embedding and LLM providers.
///
/// The split between [`Transient`](ProviderError::Transient) and
/// [`Fatal`](ProviderError::Fatal) drives the retry policy: only transient
/// failures are retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// Rate limiting, server errors, timeouts, dropped connections.
    #[error("transient provider failure: {0}")]
    Transient(String),

    /// Client errors, malformed responses, missing credentials.
    #[error("provider failure: {0}")]
    Fatal(String),

    #[error("provider is disabled")]
    Disabled,
}

impl ProviderError {
    /// Whether a retry has a chance of succeeding.
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Transient(_))
    }
}

/// Errors returned by a [`DocumentRepository`](crate::repository::DocumentRepository).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RepositoryError {
    #[error("repository backend error: {0}")]
    Backend(String),
}
