//! Content fingerprints for deduplication.
//!
//! Two hashes are computed in a single streamed pass over the file:
//!
//! - **file hash**: SHA-256 of the raw bytes.
//! - **content hash**: SHA-256 of the bytes with every run of ASCII
//!   whitespace collapsed to one space and leading/trailing whitespace
//!   dropped. Re-saving a document with different line endings or
//!   indentation keeps the same content hash.
//!
//! Files are read in fixed-size blocks and never loaded whole.

use std::path::Path;

use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

/// Default read block size (64 KiB).
pub const BLOCK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHashes {
    pub file_hash: String,
    pub content_hash: String,
}

/// Streams files through SHA-256.
#[derive(Debug, Clone)]
pub struct ContentHashService {
    block_size: usize,
}

impl Default for ContentHashService {
    fn default() -> Self {
        Self {
            block_size: BLOCK_SIZE,
        }
    }
}

impl ContentHashService {
    pub fn with_block_size(block_size: usize) -> Self {
        Self {
            block_size: block_size.max(1),
        }
    }

    /// Compute `(file_hash, content_hash)` for the file at `path`.
    pub async fn hash(&self, path: &Path) -> std::io::Result<FileHashes> {
        let mut file = tokio::fs::File::open(path).await?;
        let mut buf = vec![0u8; self.block_size];
        let mut raw = Sha256::new();
        let mut normalized = NormalizingHasher::default();

        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            raw.update(&buf[..n]);
            normalized.update(&buf[..n]);
        }

        Ok(FileHashes {
            file_hash: format!("{:x}", raw.finalize()),
            content_hash: normalized.finish(),
        })
    }

    /// Content hash of in-memory text; equal to the content hash of a file
    /// holding the same text.
    pub fn hash_text(&self, text: &str) -> String {
        let mut normalized = NormalizingHasher::default();
        normalized.update(text.as_bytes());
        normalized.finish()
    }
}

/// Whitespace-normalizing hasher. State carries across block boundaries.
#[derive(Default)]
struct NormalizingHasher {
    hasher: Sha256,
    seen_content: bool,
    pending_space: bool,
    out: Vec<u8>,
}

impl NormalizingHasher {
    fn update(&mut self, block: &[u8]) {
        self.out.clear();
        for &b in block {
            if b.is_ascii_whitespace() {
                self.pending_space = self.seen_content;
                continue;
            }
            if self.pending_space {
                self.out.push(b' ');
                self.pending_space = false;
            }
            self.out.push(b);
            self.seen_content = true;
        }
        self.hasher.update(&self.out);
    }

    fn finish(self) -> String {
        format!("{:x}", self.hasher.finalize())
    }
}
