//! Index registry: the `index_records` table.
//!
//! Holds exactly one [`IndexRecord`] per document. The registry is the
//! authoritative mapping from document to artifact directory; a swap to a
//! new generation is a single `UPDATE` of that mapping.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rag_lifecycle_core::models::{DocumentId, IndexRecord, IndexStatus};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::error::StoreError;

const COLUMNS: &str = "document_id, storage_path, status, chunk_count, generation, \
                       content_hash, file_hash, created_at, updated_at";

/// Values written when a generation becomes ready.
#[derive(Debug, Clone)]
pub struct ReadyIndex<'a> {
    pub storage_path: &'a Path,
    pub generation: u64,
    pub chunk_count: usize,
    pub content_hash: &'a str,
    pub file_hash: &'a str,
}

#[derive(Debug, Clone)]
pub struct IndexRegistry {
    pool: SqlitePool,
}

impl IndexRegistry {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, document_id: DocumentId) -> Result<Option<IndexRecord>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM index_records WHERE document_id = ?"
        ))
        .bind(document_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| record_from_row(&r)).transpose()
    }

    /// All records ordered by document id.
    pub async fn list(&self) -> Result<Vec<IndexRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM index_records ORDER BY document_id"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(record_from_row).collect()
    }

    /// Insert a `building` record with no storage path. Fails if a record
    /// already exists.
    pub async fn insert_building(
        &self,
        document_id: DocumentId,
        content_hash: &str,
        file_hash: &str,
    ) -> Result<IndexRecord, StoreError> {
        let now = Utc::now().timestamp();
        sqlx::query(
            "INSERT INTO index_records (document_id, storage_path, status, chunk_count, generation, \
             content_hash, file_hash, created_at, updated_at) VALUES (?, NULL, ?, 0, 0, ?, ?, ?, ?)",
        )
        .bind(document_id)
        .bind(IndexStatus::Building.as_str())
        .bind(content_hash)
        .bind(file_hash)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        self.require(document_id).await
    }

    /// Point the record at a committed generation and mark it ready,
    /// creating the record if needed.
    pub async fn mark_ready(
        &self,
        document_id: DocumentId,
        ready: ReadyIndex<'_>,
    ) -> Result<IndexRecord, StoreError> {
        let now = Utc::now().timestamp();
        sqlx::query(
            "INSERT INTO index_records (document_id, storage_path, status, chunk_count, generation, \
             content_hash, file_hash, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(document_id) DO UPDATE SET \
               storage_path = excluded.storage_path, \
               status = excluded.status, \
               chunk_count = excluded.chunk_count, \
               generation = excluded.generation, \
               content_hash = excluded.content_hash, \
               file_hash = excluded.file_hash, \
               updated_at = excluded.updated_at",
        )
        .bind(document_id)
        .bind(ready.storage_path.to_string_lossy().into_owned())
        .bind(IndexStatus::Ready.as_str())
        .bind(ready.chunk_count as i64)
        .bind(ready.generation as i64)
        .bind(ready.content_hash)
        .bind(ready.file_hash)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        self.require(document_id).await
    }

    /// Change only the status. Returns `false` when no record exists.
    pub async fn set_status(
        &self,
        document_id: DocumentId,
        status: IndexStatus,
    ) -> Result<bool, StoreError> {
        let result =
            sqlx::query("UPDATE index_records SET status = ?, updated_at = ? WHERE document_id = ?")
                .bind(status.as_str())
                .bind(Utc::now().timestamp())
                .bind(document_id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Change the status only if the record is still at `generation`.
    pub async fn set_status_at(
        &self,
        document_id: DocumentId,
        generation: u64,
        status: IndexStatus,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE index_records SET status = ?, updated_at = ? \
             WHERE document_id = ? AND generation = ?",
        )
        .bind(status.as_str())
        .bind(Utc::now().timestamp())
        .bind(document_id)
        .bind(generation as i64)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete(&self, document_id: DocumentId) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM index_records WHERE document_id = ?")
            .bind(document_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// A ready record of another document with the same content hash.
    pub async fn find_ready_by_content_hash(
        &self,
        content_hash: &str,
        exclude: DocumentId,
    ) -> Result<Option<IndexRecord>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM index_records \
             WHERE content_hash = ? AND status = ? AND storage_path IS NOT NULL AND document_id != ? \
             ORDER BY generation DESC, document_id LIMIT 1"
        ))
        .bind(content_hash)
        .bind(IndexStatus::Ready.as_str())
        .bind(exclude)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| record_from_row(&r)).transpose()
    }

    /// Number of records whose storage path is `path`.
    pub async fn references(&self, path: &Path) -> Result<i64, StoreError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM index_records WHERE storage_path = ?")
                .bind(path.to_string_lossy().into_owned())
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    /// Every storage path some record points at.
    pub async fn referenced_paths(&self) -> Result<HashSet<PathBuf>, StoreError> {
        let paths: Vec<String> = sqlx::query_scalar(
            "SELECT DISTINCT storage_path FROM index_records WHERE storage_path IS NOT NULL",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(paths.into_iter().map(PathBuf::from).collect())
    }

    /// Drop `building` records that never got a storage path (left by a
    /// crash during a first build).
    pub async fn delete_unfinished(&self) -> Result<u64, StoreError> {
        let result =
            sqlx::query("DELETE FROM index_records WHERE status = ? AND storage_path IS NULL")
                .bind(IndexStatus::Building.as_str())
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }

    async fn require(&self, document_id: DocumentId) -> Result<IndexRecord, StoreError> {
        self.get(document_id)
            .await?
            .ok_or(StoreError::Db(sqlx::Error::RowNotFound))
    }
}

fn timestamp(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

fn record_from_row(row: &SqliteRow) -> Result<IndexRecord, StoreError> {
    let status: String = row.try_get("status")?;
    let status = status
        .parse::<IndexStatus>()
        .map_err(|reason| StoreError::corrupt("index_records", reason))?;
    let storage_path: Option<String> = row.try_get("storage_path")?;
    let chunk_count: i64 = row.try_get("chunk_count")?;
    let generation: i64 = row.try_get("generation")?;

    Ok(IndexRecord {
        document_id: row.try_get("document_id")?,
        storage_path: storage_path.map(PathBuf::from),
        status,
        chunk_count: chunk_count.max(0) as usize,
        generation: generation.max(0) as u64,
        content_hash: row.try_get("content_hash")?,
        file_hash: row.try_get("file_hash")?,
        created_at: timestamp(row.try_get("created_at")?),
        updated_at: timestamp(row.try_get("updated_at")?),
    })
}
