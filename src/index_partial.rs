//! Incremental maintenance (`IndexPartial`).
//!
//! Recomputes forward edges for documents changed since the recorded
//! watermark, then repairs the reverse direction: any sibling whose pair with
//! a changed document gained, lost, or re-scored an edge gets that single
//! entry removed, conditionally reinserted, and its list trimmed back to the
//! bound. Completed tags keep their reconciled edges even when a later tag
//! fails; the watermark only advances after the whole run succeeds.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};

use crate::docstore::word_occurrences_batched;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::index::TagContext;
use crate::models::{IndexFilter, Process, ProcessKind, ServiceStatus, SimilarityEntry};
use crate::process::JobContext;
use crate::simstore::EdgeKey;

impl Engine {
    /// Start an IndexPartial run. Requires a completed full Index: the
    /// recorded filter supplies the tag set, query and watermark.
    pub async fn index_partial(&self, service_id: &str) -> Result<Process> {
        let service = self
            .ensure_status(service_id, &[ServiceStatus::Active])
            .await?;
        if self.cache.get(service_id).is_none() {
            return Err(Error::InvalidState(format!(
                "service {service_id} is not activation-cached"
            )));
        }
        let filter = service.index_filter.clone().ok_or_else(|| {
            Error::InvalidState(format!(
                "service {service_id} has no completed full index to maintain"
            ))
        })?;

        self.services
            .set_status(service_id, ServiceStatus::Busy)
            .await?;
        let process = match self
            .orchestrator
            .create(
                ProcessKind::IndexPartial,
                service_id,
                "incremental similarity maintenance",
                serde_json::to_value(&filter)?,
            )
            .await
        {
            Ok(process) => process,
            Err(e) => {
                self.services
                    .set_status(service_id, ServiceStatus::Active)
                    .await?;
                return Err(e);
            }
        };

        // Watermark target: documents modified from now on belong to the
        // next run, even if they slip in while this one is still working.
        let run_start = Utc::now();

        let engine = self.clone();
        let sid = service_id.to_string();
        self.orchestrator.spawn(process.id, move |ctx| async move {
            let outcome = engine
                .run_index_partial(&ctx, &sid, &filter, run_start)
                .await;
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

    async fn run_index_partial(
        &self,
        ctx: &JobContext,
        service_id: &str,
        filter: &IndexFilter,
        run_start: DateTime<Utc>,
    ) -> Result<Option<String>> {
        let runtime = self.cache.get(service_id).ok_or_else(|| {
            Error::InvalidState(format!("service {service_id} is not activation-cached"))
        })?;
        let settings = &runtime.settings;

        // First pass: find what changed per tag. The comparison universe is
        // the full current document set, changed or not.
        let mut work = Vec::new();
        let mut total_changed = 0usize;
        for tag_id in &filter.tag_ids {
            ctx.checkpoint()?;
            let Some(tag_runtime) = runtime.tags.get(tag_id) else {
                continue;
            };
            if tag_runtime.subset.is_empty() {
                continue;
            }
            let changed = self
                .documents
                .document_ids_by_tag(
                    tag_id,
                    filter.query.as_deref(),
                    Some(filter.indexed_at),
                    None,
                )
                .await?;
            if changed.is_empty() {
                continue;
            }
            let all = self
                .documents
                .document_ids_by_tag(tag_id, filter.query.as_deref(), None, None)
                .await?;
            total_changed += changed.len();
            work.push((tag_id.clone(), changed, all));
        }

        let mut processed = 0usize;
        for (tag_id, changed, all) in work {
            ctx.checkpoint()?;
            let occurrences = word_occurrences_batched(
                self.documents.as_ref(),
                &all,
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
                .reconcile_tag(
                    ctx,
                    service_id,
                    &tag_id,
                    &build,
                    &changed,
                    processed,
                    total_changed,
                )
                .await?;
            tracing::debug!(service = %service_id, tag = %tag_id, changed = changed.len(), "tag reconciled");
        }

        // Every tag succeeded: advance the watermark to the run's start.
        let advanced = IndexFilter {
            indexed_at: run_start,
            ..filter.clone()
        };
        self.services
            .set_index_filter(service_id, Some(&advanced))
            .await?;

        Ok(Some(format!(
            "{total_changed} changed documents reconciled"
        )))
    }

    #[allow(clippy::too_many_arguments)]
    async fn reconcile_tag(
        &self,
        ctx: &JobContext,
        service_id: &str,
        tag_id: &str,
        build: &TagContext,
        changed: &[String],
        mut processed: usize,
        total: usize,
    ) -> Result<usize> {
        let mut results = stream::iter(changed.to_vec())
            .map(|doc_id| async move {
                if ctx.cancel_token().is_cancelled() {
                    return Err(Error::Cancelled);
                }
                self.reconcile_document(service_id, tag_id, build, &doc_id)
                    .await
            })
            .buffer_unordered(self.config.indexing.parallelism);

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

    /// Phase one replaces the changed document's own list; phase two repairs
    /// the reverse direction on every sibling whose pair score moved.
    async fn reconcile_document(
        &self,
        service_id: &str,
        tag_id: &str,
        build: &TagContext,
        doc_id: &str,
    ) -> Result<()> {
        let max = self.config.indexing.max_neighbors;
        let key = EdgeKey::new(service_id, tag_id, doc_id);

        let new_edges = build
            .edges_for(doc_id, self.scorer.as_ref(), max)
            .unwrap_or_default();
        let old_edges = self.similarities.read_top_n(&key, None).await?;

        let new_scores: HashMap<&str, f64> = new_edges
            .iter()
            .map(|e| (e.neighbor_id.as_str(), e.score))
            .collect();
        let unchanged: HashSet<&str> = old_edges
            .iter()
            .filter(|e| {
                new_scores
                    .get(e.neighbor_id.as_str())
                    .is_some_and(|s| (s - e.score).abs() < f64::EPSILON)
            })
            .map(|e| e.neighbor_id.as_str())
            .collect();

        let mut candidates: BTreeSet<String> = BTreeSet::new();
        for edge in old_edges.iter().chain(new_edges.iter()) {
            if !unchanged.contains(edge.neighbor_id.as_str()) {
                candidates.insert(edge.neighbor_id.clone());
            }
        }

        self.similarities.replace(&key, &new_edges).await?;

        let pivot_base_words = build.base_words(doc_id);
        for sibling_id in candidates {
            let sibling_key = EdgeKey::new(service_id, tag_id, &sibling_id);
            self.similarities.remove(&sibling_key, doc_id).await?;

            let shares_signal = match (&pivot_base_words, build.base_words(&sibling_id)) {
                (Some(pivot), Some(sibling)) => sibling.intersection(pivot).next().is_some(),
                _ => false,
            };
            if shares_signal {
                if let Some(score) =
                    build.similarity_between(self.scorer.as_ref(), &sibling_id, doc_id)
                {
                    self.similarities
                        .append_if_absent(
                            &sibling_key,
                            &SimilarityEntry {
                                neighbor_id: doc_id.to_string(),
                                score,
                            },
                        )
                        .await?;
                }
            }
            self.similarities.trim_to_max(&sibling_key, max).await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::wait_terminal;
    use crate::index::tests::active_engine;
    use crate::models::{Document, ProcessStatus};

    fn doc(id: &str, tag: &str, body: &str) -> Document {
        Document {
            id: id.into(),
            tag_id: tag.into(),
            title: None,
            body: body.into(),
            modified_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn partial_requires_a_prior_full_index() {
        let (_dir, engine, docs) = active_engine(&["t1"]).await;
        docs.upsert(doc("d1", "t1", "rust"));
        assert!(matches!(
            engine.index_partial("svc").await,
            Err(Error::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn edit_repairs_both_directions_and_advances_the_watermark() {
        let (_dir, engine, docs) = active_engine(&["t1"]).await;
        docs.upsert(doc("d1", "t1", "ferris crab mascot"));
        docs.upsert(doc("d2", "t1", "ferris crab language"));
        docs.upsert(doc("d3", "t1", "gardening prose entirely"));

        // Re-prepare so the dictionary covers the corpus, then full build.
        engine.deactivate("svc").await.unwrap();
        let p = engine
            .prepare(
                "svc",
                crate::models::PrcSettings {
                    tag_ids: vec!["t1".into()],
                    fields: vec!["body".into()],
                    n_gram: 1,
                    compression: 0.0,
                },
            )
            .await
            .unwrap();
        wait_terminal(&engine, p.id).await;
        let p = engine.activate("svc").await.unwrap();
        wait_terminal(&engine, p.id).await;
        let p = engine.index("svc", None, None).await.unwrap();
        assert_eq!(
            wait_terminal(&engine, p.id).await.status,
            ProcessStatus::Finished
        );

        let before = engine
            .get_service("svc")
            .await
            .unwrap()
            .index_filter
            .unwrap();

        // d1 had no edge to d3 before the edit.
        let d1_edges = engine
            .similarities
            .read_top_n(&EdgeKey::new("svc", "t1", "d1"), None)
            .await
            .unwrap();
        assert!(!d1_edges.iter().any(|e| e.neighbor_id == "d3"));

        // Edit d3 so it now shares the rare words.
        docs.upsert(doc("d3", "t1", "ferris crab gardening"));

        let p = engine.index_partial("svc").await.unwrap();
        let done = wait_terminal(&engine, p.id).await;
        assert_eq!(done.status, ProcessStatus::Finished);

        // Forward: d3 gained edges to d1 and d2.
        let d3_edges = engine
            .similarities
            .read_top_n(&EdgeKey::new("svc", "t1", "d3"), None)
            .await
            .unwrap();
        assert!(d3_edges.iter().any(|e| e.neighbor_id == "d1"));
        assert!(d3_edges.iter().any(|e| e.neighbor_id == "d2"));

        // Reverse repair: d1's list now references d3 even though d1 itself
        // did not change.
        let d1_edges = engine
            .similarities
            .read_top_n(&EdgeKey::new("svc", "t1", "d1"), None)
            .await
            .unwrap();
        assert!(d1_edges.iter().any(|e| e.neighbor_id == "d3"));

        let after = engine
            .get_service("svc")
            .await
            .unwrap()
            .index_filter
            .unwrap();
        assert!(after.indexed_at > before.indexed_at);
    }

    #[tokio::test]
    async fn no_changes_means_a_cheap_finish() {
        let (_dir, engine, docs) = active_engine(&["t1"]).await;
        docs.upsert(doc("d1", "t1", "ferris crab"));

        // Full build first; afterwards nothing changes.
        engine.deactivate("svc").await.unwrap();
        let p = engine
            .prepare(
                "svc",
                crate::models::PrcSettings {
                    tag_ids: vec!["t1".into()],
                    fields: vec!["body".into()],
                    n_gram: 1,
                    compression: 0.0,
                },
            )
            .await
            .unwrap();
        wait_terminal(&engine, p.id).await;
        let p = engine.activate("svc").await.unwrap();
        wait_terminal(&engine, p.id).await;
        let p = engine.index("svc", None, None).await.unwrap();
        wait_terminal(&engine, p.id).await;

        // Wait out the watermark so the upsert above is older than it.
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        let p = engine.index_partial("svc").await.unwrap();
        let done = wait_terminal(&engine, p.id).await;
        assert_eq!(done.status, ProcessStatus::Finished);
        assert_eq!(
            done.result.as_deref(),
            Some("0 changed documents reconciled")
        );
    }
}
