//! # RAG Lifecycle Core
//!
//! Runtime-free logic for RAG Lifecycle: data models, chunking strategies,
//! provider capability traits, the document repository abstraction, and
//! vector utilities.
//!
//! This crate contains no tokio, sqlx, or filesystem I/O. Everything that
//! touches disk or the network lives in the `rag-lifecycle` crate.

pub mod chunk;
pub mod embedding;
pub mod error;
pub mod llm;
pub mod models;
pub mod repository;

pub use chunk::{ChunkConfig, ChunkingStrategy, StrategyKind};
pub use embedding::EmbeddingProvider;
pub use error::{ChunkError, ProviderError, RepositoryError};
pub use llm::LlmProvider;
pub use repository::{DocumentRepository, InMemoryDocumentRepository};
