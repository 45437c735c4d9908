use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use super::DocumentStore;
use crate::types::{ChunkMetadata, GuidelineMetadata, PopulationType, SectionKind};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredChunk {
    pub chunk_id: String,
    pub document_id: String,
    pub text: String,
    pub metadata: ChunkMetadata,
}

/// Metadata lookup criteria. Unset fields match everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetadataFilter {
    pub document_id: Option<String>,
    /// Case-insensitive organization name ("WHO", "nice").
    pub organization: Option<String>,
    pub section_kind: Option<SectionKind>,
    /// Matches chunks tagged with the population and chunks with no population restriction.
    pub population: Option<PopulationType>,
    pub year_from: Option<i32>,
}

impl MetadataFilter {
    pub fn matches(&self, chunk: &StoredChunk) -> bool {
        if let Some(ref id) = self.document_id {
            if &chunk.document_id != id {
                return false;
            }
        }
        if let Some(ref org) = self.organization {
            if !chunk.metadata.organization.eq_ignore_ascii_case(org) {
                return false;
            }
        }
        if let Some(kind) = self.section_kind {
            if chunk.metadata.section_kind != kind {
                return false;
            }
        }
        if let Some(population) = self.population {
            if !chunk.metadata.is_population_neutral() && !chunk.metadata.population_tags.contains(&population) {
                return false;
            }
        }
        if let Some(from) = self.year_from {
            if chunk.metadata.year.map_or(true, |y| y < from) {
                return false;
            }
        }
        true
    }
}

/// Immutable view of every ingested guideline.
#[derive(Debug, Default)]
pub struct StoreSnapshot {
    version: u64,
    chunks: HashMap<String, Arc<StoredChunk>>,
    documents: BTreeMap<String, GuidelineMetadata>,
    chunk_ids_by_document: BTreeMap<String, Vec<String>>,
}

impl StoreSnapshot {
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn chunk(&self, chunk_id: &str) -> Option<&Arc<StoredChunk>> {
        self.chunks.get(chunk_id)
    }

    pub fn document(&self, document_id: &str) -> Option<&GuidelineMetadata> {
        self.documents.get(document_id)
    }

    pub fn documents(&self) -> impl Iterator<Item = &GuidelineMetadata> {
        self.documents.values()
    }

    /// Number of chunks currently held for `document_id`.
    pub fn chunks_of(&self, document_id: &str) -> usize {
        self.chunk_ids_by_document.get(document_id).map_or(0, Vec::len)
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn document_count(&self) -> usize {
        self.documents.len()
    }

    /// Chunks matching `filter`, in document then ingestion order.
    pub fn search_by_metadata(&self, filter: &MetadataFilter, limit: usize) -> Vec<Arc<StoredChunk>> {
        self.chunk_ids_by_document
            .values()
            .flatten()
            .filter_map(|id| self.chunks.get(id))
            .filter(|chunk| filter.matches(chunk))
            .take(limit)
            .cloned()
            .collect()
    }

    fn with_document(&self, metadata: GuidelineMetadata, chunks: Vec<StoredChunk>) -> Self {
        let mut next_chunks = self.chunks.clone();
        let mut next_ids = self.chunk_ids_by_document.clone();
        let document_id = metadata.document_id.clone();

        if let Some(old_ids) = next_ids.remove(&document_id) {
            for id in old_ids {
                next_chunks.remove(&id);
            }
        }

        let ids: Vec<String> = chunks.iter().map(|c| c.chunk_id.clone()).collect();
        for chunk in chunks {
            next_chunks.insert(chunk.chunk_id.clone(), Arc::new(chunk));
        }
        next_ids.insert(document_id.clone(), ids);

        let mut next_documents = self.documents.clone();
        next_documents.insert(document_id, metadata);

        Self {
            version: self.version + 1,
            chunks: next_chunks,
            documents: next_documents,
            chunk_ids_by_document: next_ids,
        }
    }
}

/// In-memory document store publishing whole snapshots.
#[derive(Debug, Default)]
pub struct GuidelineStore {
    current: RwLock<Arc<StoreSnapshot>>,
}

impl GuidelineStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DocumentStore for GuidelineStore {
    fn snapshot(&self) -> Arc<StoreSnapshot> {
        self.current.read().clone()
    }

    fn replace_document(&self, metadata: GuidelineMetadata, chunks: Vec<StoredChunk>) {
        // Hold the write lock while building so concurrent replacements never drop each other.
        let mut current = self.current.write();
        let next = current.with_document(metadata, chunks);
        tracing::debug!(version = next.version, chunks = next.chunk_count(), "Published document store snapshot");
        *current = Arc::new(next);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::GuidelineChunk;

    fn guideline(id: &str, org: &str, populations: Vec<PopulationType>) -> GuidelineMetadata {
        GuidelineMetadata {
            document_id: id.into(),
            title: format!("{} guideline", org),
            organization: org.into(),
            year: Some(2021),
            populations,
            ..Default::default()
        }
    }

    fn stored(meta: &GuidelineMetadata, chunk_id: &str, section: &str, text: &str) -> StoredChunk {
        let chunk = GuidelineChunk {
            chunk_id: chunk_id.into(),
            text: text.into(),
            section: section.into(),
            page_number: Some(1),
            population_tags: vec![],
        };
        StoredChunk {
            chunk_id: chunk_id.into(),
            document_id: meta.document_id.clone(),
            text: text.into(),
            metadata: ChunkMetadata::from_guideline(meta, &chunk),
        }
    }

    #[test]
    fn test_snapshot_is_isolated_from_later_writes() {
        let store = GuidelineStore::new();
        let who = guideline("who", "WHO", vec![]);
        store.replace_document(who.clone(), vec![stored(&who, "c1", "Recommendations", "one")]);

        let before = store.snapshot();
        store.replace_document(who.clone(), vec![stored(&who, "c2", "Recommendations", "two")]);
        let after = store.snapshot();

        assert!(before.chunk("c1").is_some());
        assert!(before.chunk("c2").is_none());
        assert!(after.chunk("c1").is_none());
        assert_eq!(after.chunk("c2").unwrap().text, "two");
        assert_eq!(after.document_count(), 1);
        assert!(after.version() > before.version());
    }

    #[test]
    fn test_search_by_metadata() {
        let store = GuidelineStore::new();
        let who = guideline("who", "WHO", vec![]);
        let rcog = guideline("rcog", "RCOG", vec![PopulationType::Pregnant]);
        store.replace_document(
            who.clone(),
            vec![
                stored(&who, "w1", "Recommendations", "a"),
                stored(&who, "w2", "Background", "b"),
            ],
        );
        store.replace_document(rcog.clone(), vec![stored(&rcog, "r1", "Contraindications", "c")]);
        let snapshot = store.snapshot();

        let filter = MetadataFilter {
            organization: Some("who".into()),
            section_kind: Some(SectionKind::Recommendation),
            ..Default::default()
        };
        let hits = snapshot.search_by_metadata(&filter, 10);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk_id, "w1");

        let filter = MetadataFilter {
            population: Some(PopulationType::Pediatric),
            ..Default::default()
        };
        let ids: Vec<String> = snapshot
            .search_by_metadata(&filter, 10)
            .iter()
            .map(|c| c.chunk_id.clone())
            .collect();
        assert!(!ids.contains(&"r1".to_string()));
        assert_eq!(ids.len(), 2);
    }
}
