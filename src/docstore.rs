//! Document/search store contract.
//!
//! The full-text index holding the corpus is an external collaborator; the
//! pipelines only need filtered id retrieval, per-document word occurrences,
//! and document hydration. [`MemoryDocumentStore`] is the in-process
//! implementation used by tests and embedders.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{Error, Result};
use crate::models::{Document, WordStats};
use crate::scorer::{ngrams, tokenize};

/// Per-document word occurrences: document id → word → counts.
pub type Occurrences = HashMap<String, HashMap<String, WordStats>>;

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Ids of documents carrying `tag_id`, optionally restricted by a text
    /// query and a modification window. Sorted ascending by id.
    ///
    /// The `modified_after` bound is inclusive: a document stamped exactly at
    /// the watermark counts as changed.
    async fn document_ids_by_tag(
        &self,
        tag_id: &str,
        query: Option<&str>,
        modified_after: Option<DateTime<Utc>>,
        modified_before: Option<DateTime<Utc>>,
    ) -> Result<Vec<String>>;

    /// Word-occurrence counts for each requested document over `fields`,
    /// using word n-grams of size `n_gram`.
    async fn word_occurrences(
        &self,
        document_ids: &[String],
        fields: &[String],
        n_gram: u8,
    ) -> Result<Occurrences>;

    async fn documents_by_ids(&self, ids: &[String]) -> Result<Vec<Document>>;

    /// Subset of `ids` matching a text query (used by recommendation
    /// filtering and weight queries).
    async fn matching_ids(&self, ids: &[String], query: &str) -> Result<HashSet<String>>;
}

/// Fetch word occurrences in batches, backing off when the store reports
/// overload: halve the batch, wait, retry. A failure at batch size one
/// escalates to `ResourceExhausted`.
pub async fn word_occurrences_batched(
    store: &dyn DocumentStore,
    document_ids: &[String],
    fields: &[String],
    n_gram: u8,
    batch_size: usize,
    backoff: Duration,
) -> Result<Occurrences> {
    let mut occurrences = Occurrences::new();
    let mut batch = batch_size.max(1);
    let mut cursor = 0;

    while cursor < document_ids.len() {
        let end = (cursor + batch).min(document_ids.len());
        match store
            .word_occurrences(&document_ids[cursor..end], fields, n_gram)
            .await
        {
            Ok(chunk) => {
                occurrences.extend(chunk);
                cursor = end;
            }
            Err(Error::Upstream(msg)) => {
                if batch == 1 {
                    return Err(Error::ResourceExhausted(format!(
                        "document store overloaded at minimum batch size: {msg}"
                    )));
                }
                batch = (batch / 2).max(1);
                tracing::warn!(batch, "document store overloaded, retrying with smaller batch");
                tokio::time::sleep(backoff).await;
            }
            Err(e) => return Err(e),
        }
    }

    Ok(occurrences)
}

/// In-memory document store. Word statistics are recomputed from the current
/// contents on every call, so edits are visible to the next build.
#[derive(Default)]
pub struct MemoryDocumentStore {
    documents: RwLock<HashMap<String, Document>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, document: Document) {
        self.documents
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(document.id.clone(), document);
    }

    pub fn remove(&self, id: &str) {
        self.documents
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
    }

    fn terms(document: &Document, fields: &[String], n_gram: u8) -> Vec<String> {
        let mut text = String::new();
        for field in fields {
            match field.as_str() {
                "body" => {
                    text.push_str(&document.body);
                    text.push(' ');
                }
                "title" => {
                    if let Some(title) = &document.title {
                        text.push_str(title);
                        text.push(' ');
                    }
                }
                _ => {}
            }
        }
        ngrams(&tokenize(&text), n_gram as usize)
    }

    fn matches_query(document: &Document, query: &str) -> bool {
        let query = query.to_lowercase();
        document.body.to_lowercase().contains(&query)
            || document
                .title
                .as_deref()
                .is_some_and(|t| t.to_lowercase().contains(&query))
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn document_ids_by_tag(
        &self,
        tag_id: &str,
        query: Option<&str>,
        modified_after: Option<DateTime<Utc>>,
        modified_before: Option<DateTime<Utc>>,
    ) -> Result<Vec<String>> {
        let documents = self.documents.read().unwrap_or_else(|e| e.into_inner());
        let mut ids: Vec<String> = documents
            .values()
            .filter(|d| d.tag_id == tag_id)
            .filter(|d| query.is_none_or(|q| Self::matches_query(d, q)))
            .filter(|d| modified_after.is_none_or(|t| d.modified_at >= t))
            .filter(|d| modified_before.is_none_or(|t| d.modified_at <= t))
            .map(|d| d.id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn word_occurrences(
        &self,
        document_ids: &[String],
        fields: &[String],
        n_gram: u8,
    ) -> Result<Occurrences> {
        let documents = self.documents.read().unwrap_or_else(|e| e.into_inner());

        // Corpus-wide term counts over every document in the store.
        let mut corpus: HashMap<String, u64> = HashMap::new();
        for document in documents.values() {
            for term in Self::terms(document, fields, n_gram) {
                *corpus.entry(term).or_insert(0) += 1;
            }
        }

        let mut occurrences = Occurrences::new();
        for id in document_ids {
            let Some(document) = documents.get(id) else {
                continue;
            };
            let mut local: HashMap<String, u64> = HashMap::new();
            for term in Self::terms(document, fields, n_gram) {
                *local.entry(term).or_insert(0) += 1;
            }
            let stats = local
                .into_iter()
                .map(|(term, local_count)| {
                    let corpus_count = corpus.get(&term).copied().unwrap_or(local_count);
                    (
                        term,
                        WordStats {
                            corpus_count,
                            local_count,
                        },
                    )
                })
                .collect();
            occurrences.insert(id.clone(), stats);
        }
        Ok(occurrences)
    }

    async fn documents_by_ids(&self, ids: &[String]) -> Result<Vec<Document>> {
        let documents = self.documents.read().unwrap_or_else(|e| e.into_inner());
        Ok(ids.iter().filter_map(|id| documents.get(id).cloned()).collect())
    }

    async fn matching_ids(&self, ids: &[String], query: &str) -> Result<HashSet<String>> {
        let documents = self.documents.read().unwrap_or_else(|e| e.into_inner());
        Ok(ids
            .iter()
            .filter(|id| {
                documents
                    .get(*id)
                    .is_some_and(|d| Self::matches_query(d, query))
            })
            .cloned()
            .collect())
    }
}
