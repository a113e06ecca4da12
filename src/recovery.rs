//! Corruption analysis and repair.
//!
//! ```text
//! healthy ──analyze──▶ minor ────▶ regenerate artifacts ─┐
//!                 ├──▶ moderate ─▶ partial rebuild ──────┤──▶ verify ──▶ healthy
//!                 └──▶ severe ───▶ full rebuild ─────────┘       │
//!                                                                ▼ (failed)
//!                                            next action in chain, then corrupted
//! ```
//!
//! | Severity | Condition |
//! |----------|-----------|
//! | none | every artifact ok, record agrees with manifest |
//! | minor | exactly one of `stats.json` / `checksums.json` bad |
//! | moderate | both of those bad, `chunks.json` bad, or record/manifest mismatch; source readable |
//! | severe | no directory, `manifest.json` or `vectors.bin` bad, or moderate with unreadable source |
//!
//! A failed repair moves to the next action (regenerate → partial rebuild →
//! full rebuild). When the full rebuild fails the record is marked
//! `corrupted`. Callers hold the per-document build lock.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use rag_lifecycle_core::models::{
    CorruptionReport, Document, DocumentHealth, DocumentId, HealthReport, HealthStatus,
    IndexRecord, IndexStatus, RecoveryResult, RepairAction, Severity,
};
use rag_lifecycle_core::repository::DocumentRepository;
use tracing::{debug, error, info, warn};

use crate::artifacts::{self, ArtifactClass, ARTIFACTS, CHUNKS, MANIFEST, VECTORS};
use crate::builder::IndexBuilder;
use crate::error::{IndexError, RecoveryError, StoreError};
use crate::vector_index::VectorIndexManager;

const ESCALATION: [RepairAction; 3] = [
    RepairAction::RegenerateArtifacts,
    RepairAction::PartialRebuild,
    RepairAction::FullRebuild,
];

pub struct RecoveryService {
    vectors: Arc<VectorIndexManager>,
    builder: Arc<IndexBuilder>,
    repository: Arc<dyn DocumentRepository>,
    critical_ratio: f64,
}

/// Status a record should carry after analysis.
pub fn status_for(severity: Severity) -> IndexStatus {
    match severity {
        Severity::None => IndexStatus::Ready,
        Severity::Minor | Severity::Moderate => IndexStatus::Degraded,
        Severity::Severe => IndexStatus::Corrupted,
    }
}

/// Aggregate per-document severities into one health status.
pub fn overall_health(
    storage_accessible: bool,
    severities: &[Severity],
    critical_ratio: f64,
) -> HealthStatus {
    if !storage_accessible {
        return HealthStatus::Critical;
    }
    if severities.iter().all(|s| *s == Severity::None) {
        return HealthStatus::Healthy;
    }
    let severe = severities.iter().filter(|s| **s == Severity::Severe).count();
    let ratio = severe as f64 / severities.len() as f64;
    let partial = severities
        .iter()
        .any(|s| matches!(s, Severity::Minor | Severity::Moderate));
    if partial && ratio < critical_ratio {
        HealthStatus::Degraded
    } else {
        HealthStatus::Critical
    }
}

impl RecoveryService {
    pub fn new(
        vectors: Arc<VectorIndexManager>,
        builder: Arc<IndexBuilder>,
        repository: Arc<dyn DocumentRepository>,
        critical_ratio: f64,
    ) -> Self {
        Self {
            vectors,
            builder,
            repository,
            critical_ratio,
        }
    }

    /// Classify the damage to a record's artifact directory.
    pub async fn analyze(&self, record: &IndexRecord) -> Result<CorruptionReport, RecoveryError> {
        let document_id = record.document_id;
        let mut report = CorruptionReport::healthy(document_id);

        let Some(dir) = record.storage_path.as_deref() else {
            report.missing = ARTIFACTS.iter().map(|(n, _)| n.to_string()).collect();
            report.mismatches.push("record has no storage path".to_string());
            return Ok(finish(report, Severity::Severe));
        };

        let inspection = self.vectors.files().inspect(dir).await;
        report.missing = inspection.missing();
        report.invalid = inspection.invalid();

        if !inspection.dir_exists
            || !inspection.state(MANIFEST).is_ok()
            || !inspection.state(VECTORS).is_ok()
        {
            return Ok(finish(report, Severity::Severe));
        }

        if let Some(manifest) = &inspection.manifest {
            // A shared (deduplicated) directory carries the generation of
            // the document that built it.
            if manifest.document_id == document_id && manifest.generation != record.generation {
                report.mismatches.push(format!(
                    "generation: record {} manifest {}",
                    record.generation, manifest.generation
                ));
            }
            if manifest.chunk_count != record.chunk_count {
                report.mismatches.push(format!(
                    "chunk_count: record {} manifest {}",
                    record.chunk_count, manifest.chunk_count
                ));
            }
            if record.content_hash.as_deref() != Some(manifest.content_hash.as_str()) {
                report.mismatches.push("content_hash differs".to_string());
            }
        }

        let non_critical = inspection.bad_of_class(ArtifactClass::NonCritical).len();
        let moderate =
            non_critical >= 2 || !inspection.state(CHUNKS).is_ok() || !report.mismatches.is_empty();

        let severity = if moderate {
            if self.source_readable(document_id).await? {
                Severity::Moderate
            } else {
                Severity::Severe
            }
        } else if non_critical == 1 {
            Severity::Minor
        } else {
            Severity::None
        };
        Ok(finish(report, severity))
    }

    async fn source_readable(&self, document_id: DocumentId) -> Result<bool, RecoveryError> {
        let Some(document) = self.repository.get(document_id).await? else {
            return Ok(false);
        };
        Ok(tokio::fs::File::open(&document.path).await.is_ok())
    }

    /// Analyze and repair one document's index.
    ///
    /// With `force_rebuild` the index is rebuilt from source whatever its
    /// state. A healthy index is left alone.
    pub async fn recover(
        &self,
        document_id: DocumentId,
        force_rebuild: bool,
    ) -> Result<RecoveryResult, RecoveryError> {
        let registry = self.vectors.registry();
        let record = registry
            .get(document_id)
            .await?
            .ok_or(RecoveryError::NoRecord(document_id))?;
        let report = self.analyze(&record).await?;
        let severity = report.severity;

        if severity == Severity::None && !force_rebuild {
            let mut status = record.status;
            if status != IndexStatus::Ready
                && registry
                    .set_status_at(document_id, record.generation, IndexStatus::Ready)
                    .await?
            {
                status = IndexStatus::Ready;
            }
            debug!(document_id, "index healthy, nothing to repair");
            return Ok(RecoveryResult {
                document_id,
                severity,
                action: RepairAction::None,
                new_status: status,
                generation: record.generation,
            });
        }

        if severity != Severity::None {
            registry
                .set_status_at(document_id, record.generation, status_for(severity))
                .await?;
        }
        warn!(
            document_id,
            %severity,
            missing = ?report.missing,
            invalid = ?report.invalid,
            mismatches = ?report.mismatches,
            force_rebuild,
            "repairing index"
        );

        let first = if force_rebuild {
            RepairAction::FullRebuild
        } else {
            report.recommended_action
        };
        let start = ESCALATION.iter().position(|a| *a == first).unwrap_or(0);
        let document = self.repository.get(document_id).await?;

        let mut failure = None;
        for &action in &ESCALATION[start..] {
            match self.apply(action, &record, document.as_ref()).await {
                Ok(repaired) => {
                    let verified = match repaired.storage_path.as_deref() {
                        Some(dir) => self.vectors.files().verify_index_files(dir).await,
                        None => false,
                    };
                    if verified {
                        info!(
                            document_id,
                            %action,
                            generation = repaired.generation,
                            "index repaired"
                        );
                        return Ok(RecoveryResult {
                            document_id,
                            severity,
                            action,
                            new_status: repaired.status,
                            generation: repaired.generation,
                        });
                    }
                    warn!(document_id, %action, "repaired index failed verification");
                    failure = Some(RecoveryError::Unverified { document_id });
                }
                Err(e) => {
                    warn!(document_id, %action, error = %e, "repair action failed");
                    failure = Some(RecoveryError::RepairFailed {
                        document_id,
                        action,
                        source: Box::new(e),
                    });
                }
            }
        }

        registry.set_status(document_id, IndexStatus::Corrupted).await?;
        error!(document_id, "all repair actions failed, index marked corrupted");
        Err(failure.unwrap_or(RecoveryError::Unverified { document_id }))
    }

    async fn apply(
        &self,
        action: RepairAction,
        record: &IndexRecord,
        document: Option<&Document>,
    ) -> Result<IndexRecord, IndexError> {
        let document_id = record.document_id;
        match action {
            RepairAction::None => Ok(record.clone()),
            RepairAction::RegenerateArtifacts => {
                let dir = record.storage_path.as_deref().ok_or_else(|| {
                    StoreError::corrupt("index_records", "record has no storage path")
                })?;
                self.regenerate_artifacts(dir).await?;
                let registry = self.vectors.registry();
                registry
                    .set_status_at(document_id, record.generation, IndexStatus::Ready)
                    .await?;
                registry
                    .get(document_id)
                    .await?
                    .ok_or(IndexError::DocumentNotFound(document_id))
            }
            RepairAction::PartialRebuild => {
                let document = document.ok_or(IndexError::DocumentNotFound(document_id))?;
                self.builder.partial_rebuild(record, document).await
            }
            RepairAction::FullRebuild => {
                let document = document.ok_or(IndexError::DocumentNotFound(document_id))?;
                Ok(self.builder.build(document, true).await?.record)
            }
        }
    }

    /// Rewrite `stats.json` and `checksums.json` from the other artifacts.
    /// Refuses when the directory is not otherwise intact.
    pub async fn regenerate_artifacts(&self, dir: &Path) -> Result<(), StoreError> {
        let chunks = artifacts::read_chunks(dir).await?;
        artifacts::load_index(dir).await?;
        artifacts::write_stats(dir, &chunks).await?;
        artifacts::write_checksums(dir).await?;
        if !self.vectors.files().verify_index_files(dir).await {
            return Err(StoreError::corrupt(
                dir.display().to_string(),
                "still damaged after regenerating artifacts",
            ));
        }
        debug!(dir = %dir.display(), "regenerated derived artifacts");
        Ok(())
    }

    /// Analyze every record and aggregate.
    ///
    /// Record statuses are updated to match the analysis, but only for
    /// records whose generation did not change meanwhile.
    pub async fn health_check(&self) -> Result<HealthReport, RecoveryError> {
        let storage_accessible = self.vectors.files().is_accessible().await;
        let records = self.vectors.registry().list().await?;

        let mut per_document = Vec::with_capacity(records.len());
        for record in &records {
            // A first build in flight (or abandoned by a crash) has nothing
            // on disk to judge yet.
            let report = if record.status == IndexStatus::Building && record.storage_path.is_none() {
                CorruptionReport::healthy(record.document_id)
            } else {
                self.analyze(record).await?
            };
            let mut status = record.status;
            let wanted = status_for(report.severity);
            let settled = matches!(
                status,
                IndexStatus::Ready | IndexStatus::Degraded | IndexStatus::Corrupted
            );
            if settled
                && wanted != status
                && self
                    .vectors
                    .registry()
                    .set_status_at(record.document_id, record.generation, wanted)
                    .await?
            {
                status = wanted;
            }
            per_document.push(DocumentHealth {
                document_id: record.document_id,
                status,
                severity: report.severity,
                generation: record.generation,
                recommended_action: report.recommended_action,
            });
        }

        let severities: Vec<Severity> = per_document.iter().map(|d| d.severity).collect();
        let overall_status = overall_health(storage_accessible, &severities, self.critical_ratio);
        info!(
            %overall_status,
            documents = per_document.len(),
            storage_accessible,
            "health check complete"
        );
        Ok(HealthReport {
            overall_status,
            storage_accessible,
            per_document,
            checked_at: Utc::now(),
        })
    }
}

fn finish(mut report: CorruptionReport, severity: Severity) -> CorruptionReport {
    report.severity = severity;
    report.recommended_action = RepairAction::for_severity(severity);
    report
}
