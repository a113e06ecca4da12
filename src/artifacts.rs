//! On-disk index artifact format.
//!
//! One index generation is a directory holding five files:
//!
//! | File | Class | Content |
//! |------|-------|---------|
//! | `manifest.json` | critical | identity, hashes, chunking setup, model, per-chunk hashes |
//! | `vectors.bin` | critical | `RAGV` header then `count × dims` little-endian `f32` |
//! | `chunks.json` | recoverable | chunk texts, offsets, flags |
//! | `stats.json` | non-critical | chunk size statistics |
//! | `checksums.json` | non-critical | SHA-256 of the three files above |
//!
//! `vectors.bin` header layout (16 bytes, little-endian):
//!
//! ```text
//! 0..4   magic   b"RAGV"
//! 4..8   version u32 = 1
//! 8..12  dims    u32
//! 12..16 count   u32
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use rag_lifecycle_core::chunk::{ChunkConfig, StrategyKind};
use rag_lifecycle_core::embedding::{blob_to_vec, vec_to_blob};
use rag_lifecycle_core::models::{Chunk, DocumentId};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::StoreError;

pub const MANIFEST: &str = "manifest.json";
pub const VECTORS: &str = "vectors.bin";
pub const CHUNKS: &str = "chunks.json";
pub const STATS: &str = "stats.json";
pub const CHECKSUMS: &str = "checksums.json";

pub const VECTORS_MAGIC: &[u8; 4] = b"RAGV";
pub const VECTORS_VERSION: u32 = 1;
pub const VECTORS_HEADER_LEN: usize = 16;
pub const MANIFEST_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactClass {
    /// Without it the index cannot be served or rebuilt incrementally.
    Critical,
    /// Can be regenerated from the source document.
    Recoverable,
    /// Can be regenerated from the other artifacts.
    NonCritical,
}

/// Every artifact with its class, in write order.
pub const ARTIFACTS: [(&str, ArtifactClass); 5] = [
    (MANIFEST, ArtifactClass::Critical),
    (VECTORS, ArtifactClass::Critical),
    (CHUNKS, ArtifactClass::Recoverable),
    (STATS, ArtifactClass::NonCritical),
    (CHECKSUMS, ArtifactClass::NonCritical),
];

/// Files covered by `checksums.json`.
pub const CHECKSUMMED: [&str; 3] = [MANIFEST, VECTORS, CHUNKS];

pub fn class_of(name: &str) -> Option<ArtifactClass> {
    ARTIFACTS
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, class)| *class)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub format_version: u32,
    pub document_id: DocumentId,
    pub generation: u64,
    pub content_hash: String,
    pub file_hash: String,
    pub strategy: StrategyKind,
    pub chunk_config: ChunkConfig,
    pub model: String,
    pub dims: usize,
    pub chunk_count: usize,
    /// SHA-256 of each chunk's text, in chunk order.
    pub chunk_hashes: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkStats {
    pub count: usize,
    pub total_chars: usize,
    pub min_chars: usize,
    pub max_chars: usize,
    pub mean_chars: f64,
    pub citation_boundaries: usize,
}

impl ChunkStats {
    pub fn from_chunks(chunks: &[Chunk]) -> Self {
        let sizes: Vec<usize> = chunks.iter().map(Chunk::char_len).collect();
        let total: usize = sizes.iter().sum();
        Self {
            count: chunks.len(),
            total_chars: total,
            min_chars: sizes.iter().copied().min().unwrap_or(0),
            max_chars: sizes.iter().copied().max().unwrap_or(0),
            mean_chars: if chunks.is_empty() {
                0.0
            } else {
                total as f64 / chunks.len() as f64
            },
            citation_boundaries: chunks.iter().filter(|c| c.citation_boundary).count(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Checksums {
    pub files: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VectorsHeader {
    pub dims: usize,
    pub count: usize,
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Encode vectors into the `vectors.bin` format.
pub fn encode_vectors(dims: usize, vectors: &[Vec<f32>]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(VECTORS_HEADER_LEN + vectors.len() * dims * 4);
    bytes.extend_from_slice(VECTORS_MAGIC);
    bytes.extend_from_slice(&VECTORS_VERSION.to_le_bytes());
    bytes.extend_from_slice(&(dims as u32).to_le_bytes());
    bytes.extend_from_slice(&(vectors.len() as u32).to_le_bytes());
    for v in vectors {
        bytes.extend_from_slice(&vec_to_blob(v));
    }
    bytes
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

/// Validate the header and overall length of a `vectors.bin` payload.
pub fn read_vectors_header(bytes: &[u8]) -> Result<VectorsHeader, String> {
    if bytes.len() < VECTORS_HEADER_LEN {
        return Err(format!("{} bytes is shorter than the header", bytes.len()));
    }
    if &bytes[0..4] != VECTORS_MAGIC {
        return Err("bad magic".to_string());
    }
    let version = read_u32(bytes, 4);
    if version != VECTORS_VERSION {
        return Err(format!("unsupported version {version}"));
    }
    let header = VectorsHeader {
        dims: read_u32(bytes, 8) as usize,
        count: read_u32(bytes, 12) as usize,
    };
    let expected = header
        .dims
        .checked_mul(header.count)
        .and_then(|n| n.checked_mul(4))
        .and_then(|n| n.checked_add(VECTORS_HEADER_LEN))
        .ok_or_else(|| "header size overflows".to_string())?;
    if bytes.len() != expected {
        return Err(format!(
            "length {} does not match header ({} vectors × {} dims)",
            bytes.len(),
            header.count,
            header.dims
        ));
    }
    Ok(header)
}

/// Decode a `vectors.bin` payload.
pub fn decode_vectors(bytes: &[u8]) -> Result<(VectorsHeader, Vec<Vec<f32>>), String> {
    let header = read_vectors_header(bytes)?;
    let body = &bytes[VECTORS_HEADER_LEN..];
    let vectors = if header.dims == 0 {
        vec![Vec::new(); header.count]
    } else {
        body.chunks_exact(header.dims * 4).map(blob_to_vec).collect()
    };
    Ok((header, vectors))
}

/// Everything written for one index generation.
#[derive(Debug, Clone)]
pub struct IndexArtifacts {
    pub manifest: Manifest,
    pub chunks: Vec<Chunk>,
    pub vectors: Vec<Vec<f32>>,
}

/// Write all five artifacts into `dir`, which must already exist.
pub async fn write_index(dir: &Path, artifacts: &IndexArtifacts) -> Result<(), StoreError> {
    let manifest = serde_json::to_vec_pretty(&artifacts.manifest)?;
    let vectors = encode_vectors(artifacts.manifest.dims, &artifacts.vectors);
    let chunks = serde_json::to_vec(&artifacts.chunks)?;

    write_file(dir, MANIFEST, &manifest).await?;
    write_file(dir, VECTORS, &vectors).await?;
    write_file(dir, CHUNKS, &chunks).await?;
    write_stats(dir, &artifacts.chunks).await?;
    write_checksums(dir).await?;
    Ok(())
}

/// Regenerate `stats.json` from the chunk list.
pub async fn write_stats(dir: &Path, chunks: &[Chunk]) -> Result<(), StoreError> {
    let stats = serde_json::to_vec_pretty(&ChunkStats::from_chunks(chunks))?;
    write_file(dir, STATS, &stats).await
}

/// Regenerate `checksums.json` from the files currently on disk.
pub async fn write_checksums(dir: &Path) -> Result<(), StoreError> {
    let mut checksums = Checksums::default();
    for name in CHECKSUMMED {
        let bytes = read_file(dir, name).await?;
        checksums.files.insert(name.to_string(), sha256_hex(&bytes));
    }
    let body = serde_json::to_vec_pretty(&checksums)?;
    write_file(dir, CHECKSUMS, &body).await
}

/// Write via a temporary file and rename, so readers never see a
/// half-written artifact.
pub async fn write_file(dir: &Path, name: &str, bytes: &[u8]) -> Result<(), StoreError> {
    let tmp = dir.join(format!(".{name}.tmp"));
    let path = dir.join(name);
    tokio::fs::write(&tmp, bytes)
        .await
        .map_err(|e| StoreError::io(&tmp, e))?;
    tokio::fs::rename(&tmp, &path)
        .await
        .map_err(|e| StoreError::io(&path, e))
}

pub async fn read_file(dir: &Path, name: &str) -> Result<Vec<u8>, StoreError> {
    let path = dir.join(name);
    tokio::fs::read(&path)
        .await
        .map_err(|e| StoreError::io(&path, e))
}

pub async fn read_manifest(dir: &Path) -> Result<Manifest, StoreError> {
    let bytes = read_file(dir, MANIFEST).await?;
    serde_json::from_slice(&bytes).map_err(|e| StoreError::corrupt(MANIFEST, e.to_string()))
}

pub async fn read_chunks(dir: &Path) -> Result<Vec<Chunk>, StoreError> {
    let bytes = read_file(dir, CHUNKS).await?;
    serde_json::from_slice(&bytes).map_err(|e| StoreError::corrupt(CHUNKS, e.to_string()))
}

pub async fn read_vectors(dir: &Path) -> Result<(VectorsHeader, Vec<Vec<f32>>), StoreError> {
    let bytes = read_file(dir, VECTORS).await?;
    decode_vectors(&bytes).map_err(|reason| StoreError::corrupt(VECTORS, reason))
}

/// Load the artifacts a query needs and check they agree with each other.
pub async fn load_index(dir: &Path) -> Result<IndexArtifacts, StoreError> {
    let manifest = read_manifest(dir).await?;
    let (header, vectors) = read_vectors(dir).await?;
    let chunks = read_chunks(dir).await?;

    if header.count != manifest.chunk_count || header.dims != manifest.dims {
        return Err(StoreError::corrupt(
            VECTORS,
            format!(
                "holds {}×{} but manifest expects {}×{}",
                header.count, header.dims, manifest.chunk_count, manifest.dims
            ),
        ));
    }
    if chunks.len() != manifest.chunk_count {
        return Err(StoreError::corrupt(
            CHUNKS,
            format!(
                "holds {} chunks but manifest expects {}",
                chunks.len(),
                manifest.chunk_count
            ),
        ));
    }

    Ok(IndexArtifacts {
        manifest,
        chunks,
        vectors,
    })
}
