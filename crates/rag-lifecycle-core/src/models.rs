//! Core data models used throughout RAG Lifecycle.
//!
//! These types describe documents, index records, chunks, and the result
//! shapes returned by the coordinator's public operations.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::chunk::StrategyKind;

/// Identifier of a document in the external document repository.
pub type DocumentId = i64;

/// A source document, as supplied by the document repository.
///
/// The lifecycle subsystem treats documents as read-only input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: DocumentId,
    pub path: PathBuf,
    pub title: Option<String>,
    #[serde(default)]
    pub content_hash: Option<String>,
    #[serde(default)]
    pub file_hash: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl Document {
    pub fn new(id: DocumentId, path: impl Into<PathBuf>) -> Self {
        Self {
            id,
            path: path.into(),
            title: None,
            content_hash: None,
            file_hash: None,
            metadata: serde_json::Value::Null,
        }
    }
}

/// Lifecycle state of a document's index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexStatus {
    Absent,
    Building,
    Ready,
    Degraded,
    Corrupted,
}

impl IndexStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexStatus::Absent => "absent",
            IndexStatus::Building => "building",
            IndexStatus::Ready => "ready",
            IndexStatus::Degraded => "degraded",
            IndexStatus::Corrupted => "corrupted",
        }
    }
}

impl fmt::Display for IndexStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IndexStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "absent" => Ok(IndexStatus::Absent),
            "building" => Ok(IndexStatus::Building),
            "ready" => Ok(IndexStatus::Ready),
            "degraded" => Ok(IndexStatus::Degraded),
            "corrupted" => Ok(IndexStatus::Corrupted),
            other => Err(format!("unknown index status: {other}")),
        }
    }
}

/// One row of the index registry. There is at most one record per document.
///
/// `storage_path` points at a complete, readable artifact directory
/// whenever `status` is [`IndexStatus::Ready`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexRecord {
    pub document_id: DocumentId,
    pub storage_path: Option<PathBuf>,
    pub status: IndexStatus,
    pub chunk_count: usize,
    /// Bumped on every successful build or rebuild.
    pub generation: u64,
    pub content_hash: Option<String>,
    pub file_hash: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl IndexRecord {
    pub fn is_ready(&self) -> bool {
        self.status == IndexStatus::Ready && self.storage_path.is_some()
    }
}

/// A chunk of a document's text.
///
/// `start` and `end` are byte offsets into the source text; sizes and
/// overlaps are measured in characters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub index: usize,
    pub text: String,
    pub start: usize,
    pub end: usize,
    pub strategy: StrategyKind,
    /// Set when the cut was moved so that a citation would not be split.
    #[serde(default)]
    pub citation_boundary: bool,
    /// SHA-256 of `text`.
    pub hash: String,
}

impl Chunk {
    pub fn char_len(&self) -> usize {
        self.text.chars().count()
    }
}

/// How badly a persisted index is damaged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    None,
    Minor,
    Moderate,
    Severe,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::None => "none",
            Severity::Minor => "minor",
            Severity::Moderate => "moderate",
            Severity::Severe => "severe",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Repair applied (or recommended) for a given severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairAction {
    None,
    RegenerateArtifacts,
    PartialRebuild,
    FullRebuild,
}

impl RepairAction {
    pub fn for_severity(severity: Severity) -> Self {
        match severity {
            Severity::None => RepairAction::None,
            Severity::Minor => RepairAction::RegenerateArtifacts,
            Severity::Moderate => RepairAction::PartialRebuild,
            Severity::Severe => RepairAction::FullRebuild,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RepairAction::None => "none",
            RepairAction::RegenerateArtifacts => "regenerate_artifacts",
            RepairAction::PartialRebuild => "partial_rebuild",
            RepairAction::FullRebuild => "full_rebuild",
        }
    }
}

impl fmt::Display for RepairAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of analysing one document's persisted index. Never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorruptionReport {
    pub document_id: DocumentId,
    pub severity: Severity,
    /// Artifact names that do not exist.
    pub missing: Vec<String>,
    /// Artifact names that exist but failed an integrity check.
    pub invalid: Vec<String>,
    /// Disagreements between the registry record and the manifest.
    pub mismatches: Vec<String>,
    pub recommended_action: RepairAction,
}

impl CorruptionReport {
    pub fn healthy(document_id: DocumentId) -> Self {
        Self {
            document_id,
            severity: Severity::None,
            missing: Vec::new(),
            invalid: Vec::new(),
            mismatches: Vec::new(),
            recommended_action: RepairAction::None,
        }
    }
}

/// Caller-supplied retrieval parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryParams {
    /// Number of chunks to retrieve. Falls back to the configured default.
    #[serde(default)]
    pub top_k: Option<usize>,
    /// Drop retrieved chunks scoring below this cosine similarity.
    #[serde(default)]
    pub min_score: Option<f32>,
}

impl QueryParams {
    pub fn with_top_k(top_k: usize) -> Self {
        Self {
            top_k: Some(top_k),
            min_score: None,
        }
    }

    /// Stable textual form used in cache keys.
    pub fn canonical(&self) -> String {
        let top_k = self
            .top_k
            .map(|k| k.to_string())
            .unwrap_or_else(|| "-".to_string());
        let min_score = self
            .min_score
            .map(|s| format!("{:08x}", s.to_bits()))
            .unwrap_or_else(|| "-".to_string());
        format!("top_k={top_k};min_score={min_score}")
    }
}

/// Which chunk an answer drew on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceAttribution {
    pub chunk_index: usize,
    pub score: f32,
    pub start: usize,
    pub end: usize,
    pub excerpt: String,
}

/// Answer payload produced by the query engine and held in the cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Answer {
    pub text: String,
    pub sources: Vec<SourceAttribution>,
}

/// Outcome of `build_index` / `rebuild_index`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildResult {
    pub document_id: DocumentId,
    pub status: IndexStatus,
    pub generation: u64,
    pub chunk_count: usize,
    /// True when no embedding work was done (existing or deduplicated index).
    pub reused: bool,
}

impl BuildResult {
    pub fn from_record(record: &IndexRecord, reused: bool) -> Self {
        Self {
            document_id: record.document_id,
            status: record.status,
            generation: record.generation,
            chunk_count: record.chunk_count,
            reused,
        }
    }
}

/// Outcome of a coordinator query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub answer: String,
    pub sources: Vec<SourceAttribution>,
    pub cache_hit: bool,
    pub generation: u64,
}

/// Current state of one document's index as seen by the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub document_id: DocumentId,
    pub status: IndexStatus,
    pub generation: u64,
    pub chunk_count: usize,
    pub storage_path: Option<PathBuf>,
    /// A build for this document is in flight. Queries keep using the
    /// last ready generation until it completes.
    pub rebuilding: bool,
}

/// Outcome of a recovery attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryResult {
    pub document_id: DocumentId,
    pub severity: Severity,
    pub action: RepairAction,
    pub new_status: IndexStatus,
    pub generation: u64,
}

/// Aggregated health of all indexes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Critical,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Critical => "critical",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentHealth {
    pub document_id: DocumentId,
    pub status: IndexStatus,
    pub severity: Severity,
    pub generation: u64,
    pub recommended_action: RepairAction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub overall_status: HealthStatus,
    pub storage_accessible: bool,
    pub per_document: Vec<DocumentHealth>,
    pub checked_at: DateTime<Utc>,
}

/// Response-cache counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheMetrics {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub invalidations: u64,
    pub entries: usize,
}

impl CacheMetrics {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}
