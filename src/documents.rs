//! SQLite-backed [`DocumentRepository`] over the `documents` table.
//!
//! Documents are registered by path; their content is read from disk at
//! build time, so the table only holds identity and metadata.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use rag_lifecycle_core::error::RepositoryError;
use rag_lifecycle_core::models::{Document, DocumentId};
use rag_lifecycle_core::repository::DocumentRepository;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

#[derive(Debug, Clone)]
pub struct SqliteDocumentRepository {
    pool: SqlitePool,
}

fn backend(e: impl std::fmt::Display) -> RepositoryError {
    RepositoryError::Backend(e.to_string())
}

impl SqliteDocumentRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Register a document and return it with its assigned id.
    pub async fn add(&self, path: &Path, title: Option<&str>) -> Result<Document, RepositoryError> {
        let now = Utc::now().timestamp();
        let result = sqlx::query(
            "INSERT INTO documents (path, title, metadata_json, created_at, updated_at) \
             VALUES (?, ?, '{}', ?, ?)",
        )
        .bind(path.to_string_lossy().into_owned())
        .bind(title)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        let id = result.last_insert_rowid();
        self.get(id)
            .await?
            .ok_or_else(|| backend(format!("document {id} vanished after insert")))
    }

    pub async fn remove(&self, id: DocumentId) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(result.rows_affected() > 0)
    }
}

fn document_from_row(row: &SqliteRow) -> Result<Document, RepositoryError> {
    let path: String = row.try_get("path").map_err(backend)?;
    let metadata: String = row.try_get("metadata_json").map_err(backend)?;
    Ok(Document {
        id: row.try_get("id").map_err(backend)?,
        path: PathBuf::from(path),
        title: row.try_get("title").map_err(backend)?,
        content_hash: None,
        file_hash: None,
        metadata: serde_json::from_str(&metadata).unwrap_or(serde_json::Value::Null),
    })
}

#[async_trait]
impl DocumentRepository for SqliteDocumentRepository {
    async fn get(&self, id: DocumentId) -> Result<Option<Document>, RepositoryError> {
        let row = sqlx::query("SELECT id, path, title, metadata_json FROM documents WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        row.map(|r| document_from_row(&r)).transpose()
    }

    async fn list_ids(&self) -> Result<Vec<DocumentId>, RepositoryError> {
        sqlx::query_scalar("SELECT id FROM documents ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(backend)
    }
}
