//! Full similarity build (`Index`).
//!
//! For every tag in the recorded filter, score each document against a
//! per-document base dictionary (the tag's global dictionary restricted to
//! the document's own words) and against the global dictionary, then rank
//! every sibling by how its base/global score ratio compares to the pivot's.
//! The resulting bounded neighbor lists replace whatever the store held.
//!
//! The build is all-or-nothing per service: cancellation or failure discards
//! every edge written so far.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use chrono::Utc;
use futures::stream::{self, StreamExt};

use crate::docstore::{word_occurrences_batched, Occurrences};
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::models::{IndexFilter, Process, ProcessKind, ServiceStatus, SimilarityEntry};
use crate::process::JobContext;
use crate::scorer::{Dictionary, Scorer};
use crate::simstore::EdgeKey;

/// One document's analyzed signal: its term stream (each term repeated by
/// local frequency) and the set of distinct terms.
pub(crate) struct DocumentSignal {
    pub terms: Vec<String>,
    pub words: BTreeSet<String>,
}

/// Everything needed to compute similarity edges inside one tag.
pub(crate) struct TagContext {
    pub global: Dictionary,
    pub docs: HashMap<String, DocumentSignal>,
}

impl TagContext {
    pub fn from_occurrences(global: Dictionary, occurrences: &Occurrences) -> Self {
        let docs = occurrences
            .iter()
            .map(|(id, words)| {
                // Stable term order: repeated builds must sum scores in the
                // same order to produce identical floats.
                let mut sorted: Vec<_> = words.iter().collect();
                sorted.sort_by(|a, b| a.0.cmp(b.0));
                let mut terms = Vec::new();
                let mut distinct = BTreeSet::new();
                for (word, stats) in sorted {
                    for _ in 0..stats.local_count {
                        terms.push(word.clone());
                    }
                    distinct.insert(word.clone());
                }
                (
                    id.clone(),
                    DocumentSignal {
                        terms,
                        words: distinct,
                    },
                )
            })
            .collect();
        Self { global, docs }
    }

    /// The tag's global dictionary restricted to the document's own words.
    /// None when the intersection is empty.
    fn base_dictionary(&self, signal: &DocumentSignal) -> Option<Dictionary> {
        let base: Dictionary = self
            .global
            .iter()
            .filter(|(word, _)| signal.words.contains(*word))
            .map(|(word, weight)| (word.clone(), *weight))
            .collect();
        (!base.is_empty()).then_some(base)
    }

    /// All forward edges from `doc_id`, sorted descending, at most `max`.
    /// None when the pivot has no reliable signal.
    pub fn edges_for(
        &self,
        doc_id: &str,
        scorer: &dyn Scorer,
        max: usize,
    ) -> Option<Vec<SimilarityEntry>> {
        let (base, base_score, global_score) = self.pivot(doc_id, scorer)?;

        let mut entries: Vec<SimilarityEntry> = self
            .docs
            .iter()
            .filter(|(id, _)| id.as_str() != doc_id)
            .filter_map(|(id, sibling)| {
                pair_similarity(scorer, &base, base_score, global_score, &self.global, sibling)
                    .map(|score| SimilarityEntry {
                        neighbor_id: id.clone(),
                        score,
                    })
            })
            .collect();

        entries.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.neighbor_id.cmp(&b.neighbor_id))
        });
        entries.truncate(max);
        Some(entries)
    }

    /// Directional similarity from one document to another, with `from` as
    /// the pivot owning the base dictionary.
    pub fn similarity_between(&self, scorer: &dyn Scorer, from: &str, to: &str) -> Option<f64> {
        let (base, base_score, global_score) = self.pivot(from, scorer)?;
        let target = self.docs.get(to)?;
        pair_similarity(scorer, &base, base_score, global_score, &self.global, target)
    }

    /// Distinct words of `doc_id`'s base dictionary, for reverse-repair
    /// intersection checks.
    pub fn base_words(&self, doc_id: &str) -> Option<BTreeSet<String>> {
        let signal = self.docs.get(doc_id)?;
        let base = self.base_dictionary(signal)?;
        Some(base.into_keys().collect())
    }

    fn pivot(&self, doc_id: &str, scorer: &dyn Scorer) -> Option<(Dictionary, f64, f64)> {
        let signal = self.docs.get(doc_id)?;
        let base = self.base_dictionary(signal)?;
        let base_score = scorer.score_terms(&signal.terms, &base, 1.0);
        let global_score = scorer.score_terms(&signal.terms, &self.global, 1.0);
        if base_score <= 0.0 || global_score <= 0.0 {
            return None;
        }
        Some((base, base_score, global_score))
    }
}

fn pair_similarity(
    scorer: &dyn Scorer,
    base: &Dictionary,
    base_score: f64,
    global_score: f64,
    global: &Dictionary,
    sibling: &DocumentSignal,
) -> Option<f64> {
    if !sibling.words.iter().any(|w| base.contains_key(w)) {
        return None;
    }
    let sibling_base = scorer.score_terms(&sibling.terms, base, 1.0);
    let sibling_global = scorer.score_terms(&sibling.terms, global, 1.0);
    if sibling_base <= 0.0 || sibling_global <= 0.0 {
        return None;
    }
    let similarity = (sibling_base / base_score) / (sibling_global / global_score);
    (similarity > 0.0).then_some(similarity)
}

impl Engine {
    /// Start a full Index run over `tag_ids` (defaults to every tag the
    /// service was prepared with), optionally narrowed by a text query. The
    /// filter and a fresh index timestamp are recorded up front; documents
    /// stamped after that timestamp are deferred to the next partial run. A
    /// failed or cancelled run restores the previous filter and discards
    /// every edge.
    pub async fn index(
        &self,
        service_id: &str,
        tag_ids: Option<Vec<String>>,
        query: Option<String>,
    ) -> Result<Process> {
        let service = self
            .ensure_status(service_id, &[ServiceStatus::Active])
            .await?;
        let runtime = self.cache.get(service_id).ok_or_else(|| {
            Error::InvalidState(format!("service {service_id} is not activation-cached"))
        })?;

        let tag_ids = tag_ids.unwrap_or_else(|| runtime.settings.tag_ids.clone());
        for tag in &tag_ids {
            if !runtime.settings.tag_ids.contains(tag) {
                return Err(Error::Validation(format!(
                    "tag {tag} is not covered by this service"
                )));
            }
        }

        let previous_filter = service.index_filter.clone();
        let filter = IndexFilter {
            tag_ids,
            query,
            indexed_at: Utc::now(),
        };
        self.services
            .set_index_filter(service_id, Some(&filter))
            .await?;
        self.services
            .set_status(service_id, ServiceStatus::Busy)
            .await?;

        let process = match self
            .orchestrator
            .create(
                ProcessKind::Index,
                service_id,
                "full similarity build",
                serde_json::to_value(&filter)?,
            )
            .await
        {
            Ok(process) => process,
            Err(e) => {
                self.services
                    .set_index_filter(service_id, previous_filter.as_ref())
                    .await?;
                self.services
                    .set_status(service_id, ServiceStatus::Active)
                    .await?;
                return Err(e);
            }
        };

        let engine = self.clone();
        let sid = service_id.to_string();
        self.orchestrator.spawn(process.id, move |ctx| async move {
            let outcome = engine.run_index(&ctx, &sid, &filter).await;
            if outcome.is_err() {
                if let Err(e) = engine.similarities.delete_all_for_service(&sid).await {
                    tracing::error!(service = %sid, error = %e, "failed to discard edges after aborted index");
                }
                if let Err(e) = engine
                    .services
                    .set_index_filter(&sid, previous_filter.as_ref())
                    .await
                {
                    tracing::error!(service = %sid, error = %e, "failed to restore index filter");
                }
            }
            if let Err(e) = engine
                .services
                .set_status(&sid, ServiceStatus::Active)
                .await
            {
                tracing::error!(service = %sid, error = %e, "failed to restore service to active");
            }
            outcome
        });

        Ok(process)
    }

    async fn run_index(
        &self,
        ctx: &JobContext,
        service_id: &str,
        filter: &IndexFilter,
    ) -> Result<Option<String>> {
        let runtime = self.cache.get(service_id).ok_or_else(|| {
            Error::InvalidState(format!("service {service_id} is not activation-cached"))
        })?;
        let settings = &runtime.settings;

        // First pass: resolve document ids per tag so progress has a total.
        let mut per_tag_ids = Vec::new();
        let mut total = 0usize;
        for tag_id in &filter.tag_ids {
            ctx.checkpoint()?;
            let Some(tag_runtime) = runtime.tags.get(tag_id) else {
                continue;
            };
            if tag_runtime.subset.is_empty() {
                tracing::debug!(service = %service_id, tag = %tag_id, "tag has no signal, skipped");
                continue;
            }
            // Bounded at the recorded timestamp: documents stamped after the
            // run started belong to the next partial pass.
            let ids = self
                .documents
                .document_ids_by_tag(tag_id, filter.query.as_deref(), None, Some(filter.indexed_at))
                .await?;
            total += ids.len();
            per_tag_ids.push((tag_id.clone(), ids));
        }

        let mut processed = 0usize;
        for (tag_id, ids) in per_tag_ids {
            ctx.checkpoint()?;
            let occurrences = word_occurrences_batched(
                self.documents.as_ref(),
                &ids,
                &settings.fields,
                settings.n_gram,
                self.config.indexing.batch_size,
                Duration::from_millis(self.config.indexing.retry_backoff_ms),
            )
            .await?;
            let build = TagContext::from_occurrences(
                runtime.tags[&tag_id].dictionary.clone(),
                &occurrences,
            );

            processed = self
                .replace_tag_edges(ctx, service_id, &tag_id, &build, &ids, processed, total)
                .await?;
        }

        Ok(Some(format!("{total} documents indexed")))
    }

    /// Fan the per-document edge computation out over the bounded worker
    /// pool, replacing each key's list as results complete. Progress is
    /// throttled to once per `progress_every` documents.
    #[allow(clippy::too_many_arguments)]
    async fn replace_tag_edges(
        &self,
        ctx: &JobContext,
        service_id: &str,
        tag_id: &str,
        build: &TagContext,
        ids: &[String],
        mut processed: usize,
        total: usize,
    ) -> Result<usize> {
        let max = self.config.indexing.max_neighbors;
        // Each unit of work owns its id; borrowing them from the slice would
        // tie the worker futures to the iterator's lifetime.
        let mut results = stream::iter(ids.to_vec())
            .map(|doc_id| async move {
                if ctx.cancel_token().is_cancelled() {
                    return Err(Error::Cancelled);
                }
                if let Some(entries) = build.edges_for(&doc_id, self.scorer.as_ref(), max) {
                    self.similarities
                        .replace(&EdgeKey::new(service_id, tag_id, &doc_id), &entries)
                        .await?;
                }
                Ok(())
            })
            .buffer_unordered(self.config.indexing.parallelism);

        // Drain the whole fan-out even after a failure so in-flight writes
        // finish before the caller discards them.
        let mut first_error = None;
        while let Some(result) = results.next().await {
            match result {
                Ok(()) => {
                    processed += 1;
                    if processed % self.config.indexing.progress_every == 0 && total > 0 {
                        ctx.progress(((processed * 100) / total) as u8).await?;
                    }
                }
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(processed),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::engine::tests::{test_engine, wait_terminal};
    use crate::models::{Document, PrcSettings, ProcessStatus, ServiceKind};
    use crate::scorer::FrequencyScorer;
    use chrono::Utc;

    fn doc(id: &str, tag: &str, body: &str) -> Document {
        Document {
            id: id.into(),
            tag_id: tag.into(),
            title: None,
            body: body.into(),
            modified_at: Utc::now(),
        }
    }

    pub(crate) async fn active_engine(
        tags: &[&str],
    ) -> (
        tempfile::TempDir,
        Engine,
        std::sync::Arc<crate::docstore::MemoryDocumentStore>,
    ) {
        let (dir, engine, docs) = test_engine().await;
        engine
            .create_service(Some("svc"), ServiceKind::Prc, None)
            .await
            .unwrap();
        let settings = PrcSettings {
            tag_ids: tags.iter().map(|t| t.to_string()).collect(),
            fields: vec!["body".into()],
            n_gram: 1,
            compression: 0.0,
        };
        let process = engine.prepare("svc", settings).await.unwrap();
        assert_eq!(
            wait_terminal(&engine, process.id).await.status,
            ProcessStatus::Finished
        );
        let process = engine.activate("svc").await.unwrap();
        assert_eq!(
            wait_terminal(&engine, process.id).await.status,
            ProcessStatus::Finished
        );
        (dir, engine, docs)
    }

    #[tokio::test]
    async fn full_build_links_documents_sharing_rare_words() {
        let (_dir, engine, _docs) = {
            let (dir, engine, docs) = test_engine().await;
            docs.upsert(doc("d1", "t1", "ferris crab mascot"));
            docs.upsert(doc("d2", "t1", "ferris crab language"));
            docs.upsert(doc("d3", "t1", "unrelated gardening prose"));
            engine
                .create_service(Some("svc"), ServiceKind::Prc, None)
                .await
                .unwrap();
            let settings = PrcSettings {
                tag_ids: vec!["t1".into()],
                fields: vec!["body".into()],
                n_gram: 1,
                compression: 0.0,
            };
            let p = engine.prepare("svc", settings).await.unwrap();
            wait_terminal(&engine, p.id).await;
            let p = engine.activate("svc").await.unwrap();
            wait_terminal(&engine, p.id).await;
            (dir, engine, docs)
        };

        let process = engine.index("svc", None, None).await.unwrap();
        let done = wait_terminal(&engine, process.id).await;
        assert_eq!(done.status, ProcessStatus::Finished);
        assert_eq!(done.percent, 100);

        let service = engine.get_service("svc").await.unwrap();
        assert_eq!(service.status, ServiceStatus::Active);
        assert!(service.index_filter.is_some());

        let edges = engine
            .similarities
            .read_top_n(&EdgeKey::new("svc", "t1", "d1"), None)
            .await
            .unwrap();
        assert!(edges.iter().any(|e| e.neighbor_id == "d2"));
        // d3 shares no word with d1's base dictionary.
        assert!(!edges.iter().any(|e| e.neighbor_id == "d3"));
    }

    #[tokio::test]
    async fn index_requires_active_and_known_tags() {
        let (_dir, engine, _docs) = test_engine().await;
        engine
            .create_service(Some("svc"), ServiceKind::Prc, None)
            .await
            .unwrap();
        assert!(matches!(
            engine.index("svc", None, None).await,
            Err(Error::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn index_rejects_uncovered_tags() {
        let (_dir, engine, docs) = active_engine(&["t1"]).await;
        docs.upsert(doc("d1", "t1", "rust"));
        assert!(matches!(
            engine.index("svc", Some(vec!["t9".into()]), None).await,
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn similarity_is_relative_to_global_commonality() {
        // d2 matches d1's own vocabulary exactly; d3 shares only the weak
        // word and carries extra signal outside d1's base dictionary.
        let mut occurrences = Occurrences::new();
        for (id, words) in [
            ("d1", vec![("rare", 2u64, 4u64), ("common", 1, 50)]),
            ("d2", vec![("rare", 2, 4), ("common", 1, 50)]),
            ("d3", vec![("common", 3, 50), ("noise", 2, 10)]),
        ] {
            occurrences.insert(
                id.to_string(),
                words
                    .into_iter()
                    .map(|(w, local, corpus)| {
                        (
                            w.to_string(),
                            crate::models::WordStats {
                                corpus_count: corpus,
                                local_count: local,
                            },
                        )
                    })
                    .collect(),
            );
        }

        let mut global = Dictionary::new();
        global.insert("rare".into(), 2.0);
        global.insert("common".into(), 0.1);
        global.insert("noise".into(), 0.5);
        let build = TagContext::from_occurrences(global, &occurrences);

        let edges = build.edges_for("d1", &FrequencyScorer, 10).unwrap();
        assert_eq!(edges[0].neighbor_id, "d2");
        let d2 = edges.iter().find(|e| e.neighbor_id == "d2").unwrap();
        let d3 = edges.iter().find(|e| e.neighbor_id == "d3").unwrap();
        assert!(d2.score > d3.score);

        // Directional: with d3 as pivot the pair still has positive score.
        let reverse = build.similarity_between(&FrequencyScorer, "d3", "d1");
        assert!(reverse.is_some_and(|s| s > 0.0));
    }

    #[test]
    fn empty_signal_produces_no_edges() {
        let occurrences = Occurrences::new();
        let build = TagContext::from_occurrences(Dictionary::new(), &occurrences);
        assert!(build.edges_for("missing", &FrequencyScorer, 10).is_none());
    }
}
