//! Background process orchestrator.
//!
//! Every long-running operation gets a durable process record plus, while it
//! runs in this instance, a live entry holding its cancellation token. Jobs
//! observe cancellation cooperatively through [`JobContext::checkpoint`];
//! `cancel` only signals and returns immediately.
//!
//! After a crash the live map is empty but records may still read
//! `in_progress`/`cancelling`; [`Orchestrator::recover`] force-errors them.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::{Process, ProcessKind, ProcessStatus};
use crate::store::ProcessStore;

struct RunningJob {
    cancel: CancellationToken,
    handle: tokio::task::JoinHandle<()>,
}

struct Inner {
    store: ProcessStore,
    live: Mutex<HashMap<Uuid, RunningJob>>,
}

#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

/// Handle a job body uses to talk back to its orchestrator.
pub struct JobContext {
    pub id: Uuid,
    orchestrator: Orchestrator,
    cancel: CancellationToken,
}

impl JobContext {
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Cancellation checkpoint. Job bodies call this between units of work;
    /// the resulting `Cancelled` error unwinds to the orchestrator, which
    /// records the terminal state.
    pub fn checkpoint(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    pub async fn progress(&self, percent: u8) -> Result<()> {
        self.orchestrator.changed(self.id, percent).await
    }

    pub async fn add_error(&self, message: &str) -> Result<()> {
        self.orchestrator.add_error(self.id, message).await
    }
}

impl Orchestrator {
    pub fn new(store: ProcessStore) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                live: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn store(&self) -> &ProcessStore {
        &self.inner.store
    }

    /// Create the durable record for a new process, initially `in_progress`
    /// at zero percent.
    pub async fn create(
        &self,
        kind: ProcessKind,
        object_id: &str,
        description: &str,
        init_snapshot: serde_json::Value,
    ) -> Result<Process> {
        let process = Process {
            id: Uuid::new_v4(),
            kind,
            object_id: object_id.to_string(),
            description: description.to_string(),
            status: ProcessStatus::InProgress,
            percent: 0,
            started_at: Utc::now(),
            ended_at: None,
            errors: Vec::new(),
            result: None,
            init_snapshot,
        };
        self.inner.store.create(&process).await?;
        Ok(process)
    }

    /// Run a job body on a background task. Returns immediately; the task
    /// records the terminal state when the body returns.
    pub fn spawn<F, Fut>(&self, id: Uuid, job: F)
    where
        F: FnOnce(JobContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Option<String>>> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let (registered_tx, registered_rx) = tokio::sync::oneshot::channel();

        let orchestrator = self.clone();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            // Held back until the live entry exists, so completion always
            // finds it.
            let _ = registered_rx.await;
            let ctx = JobContext {
                id,
                orchestrator: orchestrator.clone(),
                cancel: token,
            };
            let outcome = job(ctx).await;
            orchestrator.complete(id, outcome).await;
        });

        self.lock_live().insert(id, RunningJob { cancel, handle });
        let _ = registered_tx.send(());
    }

    pub fn is_live(&self, id: Uuid) -> bool {
        self.lock_live()
            .get(&id)
            .is_some_and(|job| !job.handle.is_finished())
    }

    /// Progress update. Percent never decreases, and updates arriving after
    /// the process left the live map are dropped silently.
    pub async fn changed(&self, id: Uuid, percent: u8) -> Result<()> {
        if !self.is_live(id) {
            return Ok(());
        }
        let mut process = self.inner.store.get(id).await?;
        if process.status.is_terminal() {
            return Ok(());
        }
        let next = percent.min(100);
        if next > process.percent {
            process.percent = next;
            self.inner.store.update(&process).await?;
        }
        Ok(())
    }

    /// Append a non-fatal error line to a running process.
    pub async fn add_error(&self, id: Uuid, message: &str) -> Result<()> {
        let mut process = self.inner.store.get(id).await?;
        if process.status.is_terminal() {
            return Ok(());
        }
        process.errors.push(message.to_string());
        self.inner.store.update(&process).await
    }

    /// Signal cancellation and mark the record `cancelling`. Does not wait
    /// for the job to notice; a process that already reached a terminal
    /// state is left alone.
    pub async fn cancel(&self, id: Uuid) -> Result<()> {
        let mut process = self.inner.store.get(id).await?;
        if process.status.is_terminal() {
            return Ok(());
        }
        process.status = ProcessStatus::Cancelling;
        self.inner.store.update(&process).await?;

        let token = self.lock_live().get(&id).map(|j| j.cancel.clone());
        if let Some(token) = token {
            token.cancel();
        }
        Ok(())
    }

    /// Force-error every process still marked live in durable storage but
    /// not actually running here. Called once at startup.
    pub async fn recover(&self) -> Result<Vec<Process>> {
        let mut recovered = Vec::new();
        for mut process in self.inner.store.stale().await? {
            if self.is_live(process.id) {
                continue;
            }
            process.status = ProcessStatus::Error;
            process.errors.push(Error::Interrupted.to_string());
            process.ended_at = Some(Utc::now());
            self.inner.store.update(&process).await?;
            tracing::warn!(id = %process.id, kind = process.kind.as_str(), "recovered stale process");
            recovered.push(process);
        }
        Ok(recovered)
    }

    async fn complete(&self, id: Uuid, outcome: Result<Option<String>>) {
        self.lock_live().remove(&id);
        let recorded = match outcome {
            Ok(result) => self.mark_finished(id, result).await,
            Err(e) if e.is_cancelled() => self.mark_cancelled(id).await,
            Err(e) => {
                tracing::error!(%id, error = %e, "process failed");
                self.mark_error(id, e.user_message()).await
            }
        };
        if let Err(e) = recorded {
            tracing::error!(%id, error = %e, "failed to record process outcome");
        }
    }

    async fn mark_finished(&self, id: Uuid, result: Option<String>) -> Result<()> {
        let mut process = self.inner.store.get(id).await?;
        process.status = ProcessStatus::Finished;
        process.percent = 100;
        process.ended_at = Some(Utc::now());
        process.result = result;
        self.inner.store.update(&process).await
    }

    async fn mark_cancelled(&self, id: Uuid) -> Result<()> {
        let mut process = self.inner.store.get(id).await?;
        process.status = ProcessStatus::Cancelled;
        process.ended_at = Some(Utc::now());
        self.inner.store.update(&process).await
    }

    /// The record always carries the generic notice; the domain message,
    /// when the failure has one, follows as its own line.
    async fn mark_error(&self, id: Uuid, message: Option<String>) -> Result<()> {
        let mut process = self.inner.store.get(id).await?;
        process.status = ProcessStatus::Error;
        process.errors.push("unexpected error".to_string());
        if let Some(message) = message {
            process.errors.push(message);
        }
        process.ended_at = Some(Utc::now());
        self.inner.store.update(&process).await
    }

    fn lock_live(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, RunningJob>> {
        self.inner.live.lock().unwrap_or_else(|e| e.into_inner())
    }
}
