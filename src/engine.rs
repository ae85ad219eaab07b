//! Engine facade.
//!
//! Owns every collaborator (stores, orchestrator, activation cache, scorer)
//! and exposes the service lifecycle as methods. The operation bodies live in
//! their own modules (`prepare`, `activate`, `index`, `index_partial`,
//! `recommend`, `export`) as further `impl Engine` blocks.

use std::sync::Arc;

use sqlx::SqlitePool;
use uuid::Uuid;

use crate::artifacts;
use crate::cache::ActivationCache;
use crate::config::Config;
use crate::docstore::DocumentStore;
use crate::error::{Error, Result};
use crate::models::{Process, ProcessKind, Service, ServiceKind, ServiceStatus};
use crate::process::Orchestrator;
use crate::scorer::{FrequencyScorer, Scorer};
use crate::simstore::{SimilarityStore, SqliteSimilarityStore};
use crate::store::{ProcessStore, ServiceStore};

#[derive(Clone)]
pub struct Engine {
    pub(crate) config: Arc<Config>,
    pub(crate) services: ServiceStore,
    pub(crate) orchestrator: Orchestrator,
    pub(crate) cache: Arc<ActivationCache>,
    pub(crate) documents: Arc<dyn DocumentStore>,
    pub(crate) similarities: Arc<dyn SimilarityStore>,
    pub(crate) scorer: Arc<dyn Scorer>,
}

impl Engine {
    pub fn new(config: Config, pool: SqlitePool, documents: Arc<dyn DocumentStore>) -> Self {
        let similarities: Arc<dyn SimilarityStore> =
            Arc::new(SqliteSimilarityStore::new(pool.clone()));
        Self::with_stores(config, pool, documents, similarities, Arc::new(FrequencyScorer))
    }

    pub fn with_stores(
        config: Config,
        pool: SqlitePool,
        documents: Arc<dyn DocumentStore>,
        similarities: Arc<dyn SimilarityStore>,
        scorer: Arc<dyn Scorer>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            services: ServiceStore::new(pool.clone()),
            orchestrator: Orchestrator::new(ProcessStore::new(pool)),
            cache: Arc::new(ActivationCache::new()),
            documents,
            similarities,
            scorer,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    // ---- service registry ----

    pub async fn create_service(
        &self,
        id: Option<&str>,
        kind: ServiceKind,
        alias: Option<&str>,
    ) -> Result<Service> {
        let generated;
        let id = match id {
            Some(id) if !id.is_empty() => id,
            _ => {
                generated = Uuid::new_v4().to_string();
                &generated
            }
        };
        self.services.create(id, kind, alias).await
    }

    pub async fn get_service(&self, id: &str) -> Result<Service> {
        self.services.get(id).await
    }

    pub async fn list_services(&self) -> Result<Vec<Service>> {
        self.services.list().await
    }

    /// Remove a service and everything it owns: cache entry, similarity
    /// edges, artifact files, then the record itself. Busy services cannot
    /// be deleted while their operation runs.
    pub async fn delete_service(&self, id: &str) -> Result<()> {
        let service = self.services.get(id).await?;
        if service.status == ServiceStatus::Busy {
            return Err(Error::InvalidState(format!(
                "service {id} is busy, cancel its process first"
            )));
        }
        self.cache.remove(id);
        self.similarities.delete_all_for_service(id).await?;
        artifacts::delete_service_artifacts(&self.config, id)?;
        self.services.delete(id).await
    }

    // ---- process access ----

    pub async fn get_process(&self, id: Uuid) -> Result<Process> {
        self.orchestrator.store().get(id).await
    }

    pub async fn list_processes(&self, object_id: Option<&str>) -> Result<Vec<Process>> {
        self.orchestrator.store().list(object_id).await
    }

    pub async fn cancel_process(&self, id: Uuid) -> Result<()> {
        self.orchestrator.cancel(id).await
    }

    // ---- startup reconciliation ----

    /// Crash recovery: force-error stale process records, then settle every
    /// service stuck in `Busy` according to what its last process was doing.
    /// An interrupted Prepare never finished writing artifacts, so the
    /// service rolls back to `New` and the partial artifacts are deleted;
    /// any later process kind means the service had already reached a
    /// loadable state, so it settles on `Active`.
    pub async fn recover(&self) -> Result<()> {
        let recovered = self.orchestrator.recover().await?;
        if !recovered.is_empty() {
            tracing::warn!(count = recovered.len(), "recovered stale processes");
        }

        for id in self.services.busy_ids().await? {
            let last_kind = self
                .orchestrator
                .store()
                .last_for(&id)
                .await?
                .map(|p| p.kind);
            let status = match last_kind {
                Some(ProcessKind::Prepare) | None => {
                    artifacts::delete_service_artifacts(&self.config, &id)?;
                    self.cache.remove(&id);
                    ServiceStatus::New
                }
                Some(_) => ServiceStatus::Active,
            };
            tracing::warn!(service = %id, status = status.as_str(), "settled busy service");
            self.services.set_status(&id, status).await?;
        }
        Ok(())
    }

    // ---- shared gating helper ----

    /// Load the service and check it is in one of the expected states.
    pub(crate) async fn ensure_status(
        &self,
        id: &str,
        expected: &[ServiceStatus],
    ) -> Result<Service> {
        let service = self.services.get(id).await?;
        if !expected.contains(&service.status) {
            return Err(Error::InvalidState(format!(
                "service {id} is {}, expected one of {:?}",
                service.status.as_str(),
                expected.iter().map(|s| s.as_str()).collect::<Vec<_>>()
            )));
        }
        Ok(service)
    }
}
