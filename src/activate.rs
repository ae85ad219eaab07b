//! Activate: pin a prepared service's subsets and dictionaries in memory.

use std::collections::HashMap;

use crate::artifacts;
use crate::cache::{available_memory, estimated_footprint, ServiceRuntime, TagRuntime};
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::models::{PrcSettings, Process, ProcessKind, ServiceStatus};
use crate::process::JobContext;

impl Engine {
    /// Start an Activate run. The service must be `prepared`; it is `busy`
    /// while subsets load and lands on `active`, or back on `prepared` when
    /// loading fails or the memory guard refuses it.
    pub async fn activate(&self, service_id: &str) -> Result<Process> {
        let service = self
            .ensure_status(service_id, &[ServiceStatus::Prepared])
            .await?;
        let settings = service.settings.clone().ok_or_else(|| {
            Error::InvalidState(format!(
                "service {service_id} has no settings, run prepare first"
            ))
        })?;

        self.services
            .set_status(service_id, ServiceStatus::Busy)
            .await?;
        let process = match self
            .orchestrator
            .create(
                ProcessKind::Activate,
                service_id,
                "load subsets and dictionaries into memory",
                serde_json::Value::Null,
            )
            .await
        {
            Ok(process) => process,
            Err(e) => {
                self.services
                    .set_status(service_id, ServiceStatus::Prepared)
                    .await?;
                return Err(e);
            }
        };

        let engine = self.clone();
        let sid = service_id.to_string();
        self.orchestrator.spawn(process.id, move |ctx| async move {
            let outcome = engine.run_activate(&ctx, &sid, &settings).await;
            match &outcome {
                Ok(_) => {
                    engine
                        .services
                        .set_status(&sid, ServiceStatus::Active)
                        .await?;
                }
                Err(_) => {
                    engine.cache.remove(&sid);
                    if let Err(e) = engine
                        .services
                        .set_status(&sid, ServiceStatus::Prepared)
                        .await
                    {
                        tracing::error!(service = %sid, error = %e, "failed to roll service back to prepared");
                    }
                }
            }
            outcome
        });

        Ok(process)
    }

    async fn run_activate(
        &self,
        ctx: &JobContext,
        service_id: &str,
        settings: &PrcSettings,
    ) -> Result<Option<String>> {
        let artifact_bytes = artifacts::total_size(&self.config, service_id)?;
        let needed = estimated_footprint(artifact_bytes, &self.config.activation);
        let available = available_memory(&self.config.activation);
        if needed > available {
            return Err(Error::ResourceExhausted(format!(
                "activation needs an estimated {needed} bytes, only {available} available"
            )));
        }

        let total = settings.tag_ids.len();
        let mut tags = HashMap::with_capacity(total);
        for (done, tag_id) in settings.tag_ids.iter().enumerate() {
            ctx.checkpoint()?;
            let subset = artifacts::read_subset(&self.config, service_id, tag_id)?;
            let dictionary = self.scorer.build_dictionary(&subset, settings.compression);
            tags.insert(tag_id.clone(), TagRuntime { subset, dictionary });
            ctx.progress((((done + 1) * 100) / total) as u8).await?;
        }

        self.cache.insert(
            service_id,
            ServiceRuntime {
                settings: settings.clone(),
                tags,
            },
        );
        Ok(Some(format!("{total} tags activated")))
    }

    /// Drop an active service's in-memory state. Synchronous: nothing slow
    /// happens here, so no process record is created.
    pub async fn deactivate(&self, service_id: &str) -> Result<()> {
        self.ensure_status(service_id, &[ServiceStatus::Active])
            .await?;
        self.cache.remove(service_id);
        self.services
            .set_status(service_id, ServiceStatus::Prepared)
            .await
    }
}
