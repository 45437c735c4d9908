use std::sync::Arc;
use tokio::sync::{RwLock, RwLockWriteGuard};

use super::{DocumentStore, LexicalIndex, LexicalSnapshot, StoreSnapshot, VectorIndex, VectorSnapshot};

/// Snapshots of the vector index, the lexical index and the document store
/// that belong to the same publication.
#[derive(Clone)]
pub struct ReadView {
    pub vectors: Arc<dyn VectorSnapshot>,
    pub lexical: Arc<dyn LexicalSnapshot>,
    pub documents: Arc<StoreSnapshot>,
}

/// The stores that together hold the ingested guidelines.
///
/// Ingestion swaps all three while holding the publication lock for writing;
/// [`GuidelineCorpus::read_view`] takes its snapshots under the same lock for
/// reading.
pub struct GuidelineCorpus {
    vectors: Arc<dyn VectorIndex>,
    lexical: Arc<dyn LexicalIndex>,
    documents: Arc<dyn DocumentStore>,
    publication: RwLock<()>,
}

impl GuidelineCorpus {
    pub fn new(
        vectors: Arc<dyn VectorIndex>,
        lexical: Arc<dyn LexicalIndex>,
        documents: Arc<dyn DocumentStore>,
    ) -> Self {
        Self {
            vectors,
            lexical,
            documents,
            publication: RwLock::new(()),
        }
    }

    pub fn vectors(&self) -> &Arc<dyn VectorIndex> {
        &self.vectors
    }

    pub fn lexical(&self) -> &Arc<dyn LexicalIndex> {
        &self.lexical
    }

    pub fn documents(&self) -> &Arc<dyn DocumentStore> {
        &self.documents
    }

    /// One consistent view for the lifetime of a request.
    pub async fn read_view(&self) -> ReadView {
        let _guard = self.publication.read().await;
        ReadView {
            vectors: self.vectors.snapshot(),
            lexical: self.lexical.snapshot(),
            documents: self.documents.snapshot(),
        }
    }

    /// Exclusive access for swapping in a new publication. Views cannot be
    /// taken while the guard is held.
    pub async fn lock_publication(&self) -> RwLockWriteGuard<'_, ()> {
        self.publication.write().await
    }
}
