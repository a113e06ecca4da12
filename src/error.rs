//! Error taxonomy for the lifecycle subsystem.
//!
//! Each component returns its own error type; [`ProcessingError`] is the
//! common base that every one of them converts into.
//!
//! | Type | Raised by |
//! |------|-----------|
//! | [`StoreError`] | registry, file manager, artifact I/O |
//! | [`IndexError`] | index builds and rebuilds |
//! | [`QueryError`] | query engine and coordinator queries |
//! | [`RecoveryError`] | corruption repair |
//!
//! Setup code (configuration, database connection, CLI) uses `anyhow`.

use std::path::PathBuf;

use rag_lifecycle_core::error::{ChunkError, ProviderError, RepositoryError};
use rag_lifecycle_core::models::{DocumentId, RepairAction, Severity};
use thiserror::Error;

/// Persistence failures: SQLite, filesystem, artifact encoding.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt artifact {artifact}: {reason}")]
    Corrupt { artifact: String, reason: String },

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StoreError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn corrupt(artifact: impl Into<String>, reason: impl Into<String>) -> Self {
        StoreError::Corrupt {
            artifact: artifact.into(),
            reason: reason.into(),
        }
    }
}

/// Build and rebuild failures. A failed build never touches the previous
/// ready index.
#[derive(Error, Debug)]
pub enum IndexError {
    #[error("document {0} not found")]
    DocumentNotFound(DocumentId),

    #[error("document source {} is unreadable: {source}", path.display())]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("document {0} has no indexable text")]
    EmptyDocument(DocumentId),

    #[error("document {0} changed on disk while it was being indexed")]
    SourceChanged(DocumentId),

    #[error("embedding provider returned {got} vectors for {expected} inputs")]
    VectorCount { expected: usize, got: usize },

    #[error("embedding provider returned a {got}-dimensional vector, expected {expected}")]
    VectorDims { expected: usize, got: usize },

    #[error(transparent)]
    Chunking(#[from] ChunkError),

    #[error("embedding failed: {0}")]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Query failures. These are surfaced to the caller, never replaced by a
/// degraded answer.
#[derive(Error, Debug)]
pub enum QueryError {
    #[error("no ready index for document {0}")]
    NotReady(DocumentId),

    #[error("query text is empty")]
    EmptyQuery,

    #[error("failed to load index for document {document_id}: {source}")]
    Load {
        document_id: DocumentId,
        #[source]
        source: StoreError,
    },

    #[error("index for document {document_id} is damaged ({severity}) and could not be repaired")]
    Degraded {
        document_id: DocumentId,
        severity: Severity,
    },

    #[error("provider failed: {0}")]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Repair failures.
#[derive(Error, Debug)]
pub enum RecoveryError {
    #[error("no index record for document {0}")]
    NoRecord(DocumentId),

    #[error("{action} failed for document {document_id}: {source}")]
    RepairFailed {
        document_id: DocumentId,
        action: RepairAction,
        #[source]
        source: Box<IndexError>,
    },

    #[error("repair of document {document_id} left the index unverified")]
    Unverified { document_id: DocumentId },

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Base error for every lifecycle operation.
#[derive(Error, Debug)]
pub enum ProcessingError {
    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Query(#[from] QueryError),

    #[error(transparent)]
    Recovery(#[from] RecoveryError),

    #[error(transparent)]
    Store(#[from] StoreError),
}
