use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tantivy::collector::TopDocs;
use tantivy::query::QueryParser;
use tantivy::schema::{self, Schema, Value as TantivyValue, STORED, STRING, TEXT};
use tantivy::{doc, Index, IndexReader, IndexWriter, ReloadPolicy, Searcher, TantivyDocument};

use crate::storage::{LexicalIndex, LexicalSnapshot, SearchHit};

/// BM25 keyword index over chunk text.
///
/// Writes are staged and committed without touching the reader; searches keep
/// seeing the previous commit until [`LexicalIndex::publish`] reloads it.
pub struct TextSearch {
    index: Index,
    reader: IndexReader,
    writer: parking_lot::Mutex<IndexWriter>,
    id_field: schema::Field,
    document_field: schema::Field,
    text_field: schema::Field,
}

impl TextSearch {
    /// Build the canonical schema. `id` and `document_id` must be STRING
    /// (indexed, not tokenized) so that `delete_term` lookups work correctly.
    fn build_schema() -> (Schema, schema::Field, schema::Field, schema::Field) {
        let mut sb = Schema::builder();
        let id_field = sb.add_text_field("id", STRING | STORED);
        let document_field = sb.add_text_field("document_id", STRING | STORED);
        let text_field = sb.add_text_field("text", TEXT);
        (sb.build(), id_field, document_field, text_field)
    }

    /// An existing index needs rebuilding when it was created with another schema.
    fn needs_schema_migration(index: &Index) -> bool {
        let schema = index.schema();
        ["id", "document_id"].iter().any(|name| match schema.get_field(name) {
            Ok(field) => !schema.get_field_entry(field).is_indexed(),
            Err(_) => true,
        }) || schema.get_field("text").is_err()
    }

    /// Index held entirely in memory.
    pub fn in_memory() -> Result<Self> {
        let (schema, id_field, document_field, text_field) = Self::build_schema();
        let index = Index::create_in_ram(schema);
        let writer = index
            .writer_with_num_threads(1, 20_000_000)
            .context("Failed to create Tantivy writer")?;
        Self::from_parts(index, writer, id_field, document_field, text_field)
    }

    /// Index persisted under `path`, created on first use.
    pub fn open(path: &Path) -> Result<Self> {
        let index_path = path.join("tantivy_index");
        std::fs::create_dir_all(&index_path)
            .with_context(|| format!("Failed to create index dir {}", index_path.display()))?;

        let (schema, id_field, document_field, text_field) = Self::build_schema();

        let needs_rebuild = {
            let dir = tantivy::directory::MmapDirectory::open(&index_path)?;
            if Index::exists(&dir)? {
                let existing = Index::open_in_dir(&index_path)?;
                let migrate = Self::needs_schema_migration(&existing);
                drop(existing);
                migrate
            } else {
                false
            }
        };

        let index = if needs_rebuild {
            tracing::warn!(
                path = %index_path.display(),
                "Lexical index has an incompatible schema, rebuilding. Guidelines must be re-indexed."
            );
            std::fs::remove_dir_all(&index_path)?;
            std::fs::create_dir_all(&index_path)?;
            Index::create_in_dir(&index_path, schema)?
        } else {
            let dir = tantivy::directory::MmapDirectory::open(&index_path)?;
            if Index::exists(&dir)? {
                Index::open_in_dir(&index_path)?
            } else {
                Index::create_in_dir(&index_path, schema)?
            }
        };

        let writer = index
            .writer(50_000_000)
            .context("Failed to create Tantivy writer")?;
        Self::from_parts(index, writer, id_field, document_field, text_field)
    }

    fn from_parts(
        index: Index,
        writer: IndexWriter,
        id_field: schema::Field,
        document_field: schema::Field,
        text_field: schema::Field,
    ) -> Result<Self> {
        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()
            .context("Failed to create Tantivy reader")?;

        Ok(Self {
            index,
            reader,
            writer: parking_lot::Mutex::new(writer),
            id_field,
            document_field,
            text_field,
        })
    }

    pub fn search(&self, terms: &[String], k: usize) -> Result<Vec<SearchHit>> {
        self.pinned().search(terms, k)
    }

    /// Searcher over the currently loaded commit.
    pub fn pinned(&self) -> PinnedSearcher {
        PinnedSearcher {
            searcher: self.reader.searcher(),
            index: self.index.clone(),
            id_field: self.id_field,
            text_field: self.text_field,
        }
    }

    pub fn index_chunk(&self, chunk_id: &str, document_id: &str, text: &str) -> Result<()> {
        let writer = self.writer.lock();
        writer.add_document(doc!(
            self.id_field => chunk_id,
            self.document_field => document_id,
            self.text_field => text,
        ))?;
        Ok(())
    }

    pub fn delete_document(&self, document_id: &str) {
        let writer = self.writer.lock();
        let term = tantivy::Term::from_field_text(self.document_field, document_id);
        writer.delete_term(term);
    }

    /// Persist staged writes. Searchers keep the previous view.
    pub fn commit(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        writer.commit().context("Tantivy commit failed")?;
        Ok(())
    }

    /// Drop writes made since the last commit.
    pub fn rollback(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        writer.rollback().context("Tantivy rollback failed")?;
        Ok(())
    }

    /// Make committed writes visible to searches.
    pub fn reload(&self) -> Result<()> {
        self.reader.reload().context("Tantivy reader reload failed")?;
        Ok(())
    }

    pub fn count(&self) -> usize {
        self.reader.searcher().num_docs() as usize
    }

    /// Remove every document and make the empty index visible.
    pub fn clear(&self) -> Result<()> {
        {
            let mut writer = self.writer.lock();
            writer.delete_all_documents().context("Tantivy delete_all_documents failed")?;
            writer.commit().context("Tantivy commit failed")?;
        }
        self.reload()
    }
}

/// A tantivy searcher fixed to one commit. Reloads of the owning
/// [`TextSearch`] do not change what it sees.
pub struct PinnedSearcher {
    searcher: Searcher,
    index: Index,
    id_field: schema::Field,
    text_field: schema::Field,
}

impl PinnedSearcher {
    pub fn search(&self, terms: &[String], k: usize) -> Result<Vec<SearchHit>> {
        // Keep only word characters so user text never reaches the query grammar.
        let query: String = terms
            .iter()
            .flat_map(|t| t.split(|c: char| !c.is_alphanumeric()))
            .filter(|w| !w.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        if query.is_empty() || k == 0 {
            return Ok(Vec::new());
        }

        let query_parser = QueryParser::for_index(&self.index, vec![self.text_field]);
        let parsed_query = match query_parser.parse_query(&query) {
            Ok(q) => q,
            Err(_) => query_parser.parse_query(&format!("\"{}\"", query))?,
        };

        let top_docs = self.searcher.search(&parsed_query, &TopDocs::with_limit(k))?;

        let mut results = Vec::with_capacity(top_docs.len());
        for (score, doc_address) in top_docs {
            let doc = self.searcher.doc::<TantivyDocument>(doc_address)?;
            if let Some(id_text) = doc.get_first(self.id_field).and_then(|v| v.as_str()) {
                results.push(SearchHit {
                    chunk_id: id_text.to_string(),
                    score,
                });
            }
        }

        Ok(results)
    }
}

#[async_trait]
impl LexicalSnapshot for PinnedSearcher {
    async fn query(&self, terms: &[String], k: usize) -> Result<Vec<SearchHit>> {
        self.search(terms, k)
    }
}

#[async_trait]
impl LexicalIndex for TextSearch {
    fn snapshot(&self) -> Arc<dyn LexicalSnapshot> {
        Arc::new(self.pinned())
    }

    async fn upsert(&self, chunk_id: &str, document_id: &str, text: &str) -> Result<()> {
        self.index_chunk(chunk_id, document_id, text)
    }

    async fn remove_document(&self, document_id: &str) -> Result<()> {
        self.delete_document(document_id);
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        TextSearch::commit(self)
    }

    async fn publish(&self) -> Result<()> {
        self.reload()
    }

    async fn discard(&self) -> Result<()> {
        self.rollback()
    }

    fn len(&self) -> usize {
        self.count()
    }
}
