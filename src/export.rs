//! Dictionary export (`ExportDictionaries`).
//!
//! Writes every tag's weighted dictionary of an active service to JSON files
//! so the weights can be inspected offline. Export reads only the activation
//! cache; nothing is rolled back on failure beyond the service status.

use std::path::PathBuf;

use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::models::{Process, ProcessKind, ServiceStatus};
use crate::process::JobContext;

impl Engine {
    /// Start a dictionary export. Files land in `out_dir` (defaults to
    /// `<artifacts.dir>/<service>/exports`), one `<tag>.dictionary.json`
    /// per tag.
    pub async fn export_dictionaries(
        &self,
        service_id: &str,
        out_dir: Option<PathBuf>,
    ) -> Result<Process> {
        self.ensure_status(service_id, &[ServiceStatus::Active])
            .await?;
        if self.cache.get(service_id).is_none() {
            return Err(Error::InvalidState(format!(
                "service {service_id} is not activation-cached"
            )));
        }

        let out_dir = out_dir.unwrap_or_else(|| {
            crate::artifacts::service_dir(&self.config, service_id).join("exports")
        });

        self.services
            .set_status(service_id, ServiceStatus::Busy)
            .await?;
        let process = match self
            .orchestrator
            .create(
                ProcessKind::ExportDictionaries,
                service_id,
                "export tag dictionaries",
                serde_json::json!({ "out_dir": out_dir.display().to_string() }),
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

        let engine = self.clone();
        let sid = service_id.to_string();
        self.orchestrator.spawn(process.id, move |ctx| async move {
            let outcome = engine.run_export(&ctx, &sid, &out_dir).await;
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

    async fn run_export(
        &self,
        ctx: &JobContext,
        service_id: &str,
        out_dir: &std::path::Path,
    ) -> Result<Option<String>> {
        let runtime = self.cache.get(service_id).ok_or_else(|| {
            Error::InvalidState(format!("service {service_id} is not activation-cached"))
        })?;
        std::fs::create_dir_all(out_dir)?;

        let total = runtime.tags.len();
        for (done, (tag_id, tag_runtime)) in runtime.tags.iter().enumerate() {
            ctx.checkpoint()?;
            let path = out_dir.join(format!("{tag_id}.dictionary.json"));
            std::fs::write(&path, serde_json::to_vec_pretty(&tag_runtime.dictionary)?)?;
            ctx.progress((((done + 1) * 100) / total.max(1)) as u8).await?;
        }

        Ok(Some(format!("{total} dictionaries exported")))
    }
}
