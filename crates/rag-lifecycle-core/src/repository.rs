//! Document repository abstraction.
//!
//! Documents are owned by an external repository; the lifecycle subsystem
//! only reads them. [`InMemoryDocumentRepository`] backs tests and
//! embedded use; the app crate adds a SQLite implementation.

use std::collections::BTreeMap;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::error::RepositoryError;
use crate::models::{Document, DocumentId};

/// Read access to source documents.
#[async_trait]
pub trait DocumentRepository: Send + Sync {
    /// Fetch a document by id.
    async fn get(&self, id: DocumentId) -> Result<Option<Document>, RepositoryError>;

    /// List all document ids, ascending.
    async fn list_ids(&self) -> Result<Vec<DocumentId>, RepositoryError>;
}

/// In-memory repository for tests and embedded use.
pub struct InMemoryDocumentRepository {
    docs: RwLock<BTreeMap<DocumentId, Document>>,
}

impl InMemoryDocumentRepository {
    pub fn new() -> Self {
        Self {
            docs: RwLock::new(BTreeMap::new()),
        }
    }

    /// Insert or replace a document.
    pub fn insert(&self, doc: Document) {
        let mut docs = self.docs.write().unwrap_or_else(|e| e.into_inner());
        docs.insert(doc.id, doc);
    }

    /// Remove a document, returning it if it was present.
    pub fn remove(&self, id: DocumentId) -> Option<Document> {
        let mut docs = self.docs.write().unwrap_or_else(|e| e.into_inner());
        docs.remove(&id)
    }
}

impl Default for InMemoryDocumentRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocumentRepository for InMemoryDocumentRepository {
    async fn get(&self, id: DocumentId) -> Result<Option<Document>, RepositoryError> {
        let docs = self.docs.read().unwrap_or_else(|e| e.into_inner());
        Ok(docs.get(&id).cloned())
    }

    async fn list_ids(&self) -> Result<Vec<DocumentId>, RepositoryError> {
        let docs = self.docs.read().unwrap_or_else(|e| e.into_inner());
        Ok(docs.keys().copied().collect())
    }
}
