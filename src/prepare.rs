//! Prepare: build per-tag word subsets and write them to artifact files.
//!
//! Prepare is the only operation that talks to the document store for whole
//! tags at once; everything downstream (activation, index builds) works from
//! the artifacts it leaves behind.

use std::collections::BTreeMap;
use std::time::Duration;

use crate::artifacts;
use crate::docstore::{word_occurrences_batched, Occurrences};
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::models::{
    PrcSettings, Process, ProcessKind, ServiceKind, ServiceStatus, TagSubset, TagWordStats,
};
use crate::process::JobContext;

impl Engine {
    /// Start a Prepare run. The service must be `new` (or `prepared`, for a
    /// re-prepare with different settings); it is `busy` while the job runs
    /// and lands on `prepared`, or back on `new` when the job fails or is
    /// cancelled.
    pub async fn prepare(&self, service_id: &str, settings: PrcSettings) -> Result<Process> {
        settings.validate()?;
        let service = self
            .ensure_status(service_id, &[ServiceStatus::New, ServiceStatus::Prepared])
            .await?;
        if service.kind != ServiceKind::Prc {
            return Err(Error::InvalidState(format!(
                "service {service_id} is a {} service, prepare applies to prc services",
                service.kind.as_str()
            )));
        }

        self.services
            .set_status(service_id, ServiceStatus::Busy)
            .await?;
        let process = match self
            .orchestrator
            .create(
                ProcessKind::Prepare,
                service_id,
                "build per-tag word subsets",
                serde_json::to_value(&settings)?,
            )
            .await
        {
            Ok(process) => process,
            Err(e) => {
                self.services
                    .set_status(service_id, service.status)
                    .await?;
                return Err(e);
            }
        };

        let engine = self.clone();
        let sid = service_id.to_string();
        self.orchestrator.spawn(process.id, move |ctx| async move {
            let outcome = engine.run_prepare(&ctx, &sid, &settings).await;
            match &outcome {
                Ok(_) => {
                    engine
                        .services
                        .set_status(&sid, ServiceStatus::Prepared)
                        .await?;
                }
                Err(_) => {
                    if let Err(e) = artifacts::delete_service_artifacts(&engine.config, &sid) {
                        tracing::error!(service = %sid, error = %e, "failed to clean artifacts after prepare failure");
                    }
                    if let Err(e) = engine.services.set_status(&sid, ServiceStatus::New).await {
                        tracing::error!(service = %sid, error = %e, "failed to roll service back to new");
                    }
                }
            }
            outcome
        });

        Ok(process)
    }

    async fn run_prepare(
        &self,
        ctx: &JobContext,
        service_id: &str,
        settings: &PrcSettings,
    ) -> Result<Option<String>> {
        // A re-prepare must not inherit artifacts from the previous settings.
        artifacts::delete_service_artifacts(&self.config, service_id)?;

        let total = settings.tag_ids.len();
        for (done, tag_id) in settings.tag_ids.iter().enumerate() {
            ctx.checkpoint()?;

            let ids = self
                .documents
                .document_ids_by_tag(tag_id, None, None, None)
                .await?;
            let occurrences = word_occurrences_batched(
                self.documents.as_ref(),
                &ids,
                &settings.fields,
                settings.n_gram,
                self.config.indexing.batch_size,
                Duration::from_millis(self.config.indexing.retry_backoff_ms),
            )
            .await?;

            let subset = build_subset(&occurrences);
            artifacts::write_subset(&self.config, service_id, tag_id, &subset)?;
            tracing::debug!(service = %service_id, tag = %tag_id, words = subset.words.len(), "tag subset written");

            ctx.progress((((done + 1) * 100) / total) as u8).await?;
        }

        self.services.set_settings(service_id, settings).await?;
        Ok(Some(format!("{total} tag subsets written")))
    }
}

/// Fold per-document occurrences into one per-tag subset: a word's tag count
/// is the sum of its local counts across the tag's documents, and its corpus
/// count comes from the store.
fn build_subset(occurrences: &Occurrences) -> TagSubset {
    let mut words: BTreeMap<String, TagWordStats> = BTreeMap::new();
    for document_words in occurrences.values() {
        for (word, stats) in document_words {
            let entry = words.entry(word.clone()).or_insert(TagWordStats {
                corpus_count: stats.corpus_count,
                tag_count: 0,
            });
            entry.corpus_count = entry.corpus_count.max(stats.corpus_count);
            entry.tag_count += stats.local_count;
        }
    }
    TagSubset { words }
}
