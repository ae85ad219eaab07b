//! Durable service and process stores backed by SQLite.
//!
//! Both stores are thin row mappers: the state machine itself is enforced by
//! the engine and the orchestrator, which are the only writers.

use chrono::{DateTime, TimeZone, Utc};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::{
    IndexFilter, PrcSettings, Process, ProcessKind, ProcessStatus, Service, ServiceKind,
    ServiceStatus,
};

#[derive(Clone)]
pub struct ServiceStore {
    pool: SqlitePool,
}

impl ServiceStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, id: &str, kind: ServiceKind, alias: Option<&str>) -> Result<Service> {
        sqlx::query(
            "INSERT INTO services (id, kind, status, alias, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(id)
        .bind(kind.as_str())
        .bind(ServiceStatus::New.as_str())
        .bind(alias)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;

        self.get(id).await
    }

    pub async fn get(&self, id: &str) -> Result<Service> {
        let row = sqlx::query(
            "SELECT id, kind, status, alias, settings_json, index_filter_json FROM services WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| Error::NotFound(format!("service {id}")))?;

        let process_ids: Vec<String> = sqlx::query_scalar(
            "SELECT id FROM processes WHERE object_id = ? ORDER BY started_at ASC, id ASC",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        let kind: String = row.get("kind");
        let status: String = row.get("status");
        let settings_json: Option<String> = row.get("settings_json");
        let filter_json: Option<String> = row.get("index_filter_json");

        Ok(Service {
            id: row.get("id"),
            kind: ServiceKind::parse(&kind)
                .ok_or_else(|| Error::Validation(format!("unknown service kind '{kind}'")))?,
            status: ServiceStatus::parse(&status)
                .ok_or_else(|| Error::Validation(format!("unknown service status '{status}'")))?,
            alias: row.get("alias"),
            settings: settings_json
                .map(|s| serde_json::from_str::<PrcSettings>(&s))
                .transpose()?,
            index_filter: filter_json
                .map(|s| serde_json::from_str::<IndexFilter>(&s))
                .transpose()?,
            process_ids: process_ids
                .into_iter()
                .filter_map(|s| Uuid::parse_str(&s).ok())
                .collect(),
        })
    }

    pub async fn list(&self) -> Result<Vec<Service>> {
        let ids: Vec<String> = sqlx::query_scalar("SELECT id FROM services ORDER BY created_at ASC")
            .fetch_all(&self.pool)
            .await?;

        let mut services = Vec::with_capacity(ids.len());
        for id in ids {
            services.push(self.get(&id).await?);
        }
        Ok(services)
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        let affected = sqlx::query("DELETE FROM services WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        if affected == 0 {
            return Err(Error::NotFound(format!("service {id}")));
        }
        Ok(())
    }

    pub async fn set_status(&self, id: &str, status: ServiceStatus) -> Result<()> {
        sqlx::query("UPDATE services SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_settings(&self, id: &str, settings: &PrcSettings) -> Result<()> {
        sqlx::query("UPDATE services SET settings_json = ? WHERE id = ?")
            .bind(serde_json::to_string(settings)?)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_index_filter(&self, id: &str, filter: Option<&IndexFilter>) -> Result<()> {
        let json = filter.map(serde_json::to_string).transpose()?;
        sqlx::query("UPDATE services SET index_filter_json = ? WHERE id = ?")
            .bind(json)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Ids of services stuck in `Busy` (used by crash recovery).
    pub async fn busy_ids(&self) -> Result<Vec<String>> {
        let ids: Vec<String> = sqlx::query_scalar("SELECT id FROM services WHERE status = ?")
            .bind(ServiceStatus::Busy.as_str())
            .fetch_all(&self.pool)
            .await?;
        Ok(ids)
    }
}

#[derive(Clone)]
pub struct ProcessStore {
    pool: SqlitePool,
}

impl ProcessStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, process: &Process) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO processes (id, kind, object_id, description, status, percent, started_at, ended_at, errors_json, result, init_json)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(process.id.to_string())
        .bind(process.kind.as_str())
        .bind(&process.object_id)
        .bind(&process.description)
        .bind(process.status.as_str())
        .bind(process.percent as i64)
        .bind(process.started_at.timestamp_millis())
        .bind(process.ended_at.map(|t| t.timestamp_millis()))
        .bind(serde_json::to_string(&process.errors)?)
        .bind(&process.result)
        .bind(serde_json::to_string(&process.init_snapshot)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn update(&self, process: &Process) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE processes
            SET status = ?, percent = ?, ended_at = ?, errors_json = ?, result = ?
            WHERE id = ?
            "#,
        )
        .bind(process.status.as_str())
        .bind(process.percent as i64)
        .bind(process.ended_at.map(|t| t.timestamp_millis()))
        .bind(serde_json::to_string(&process.errors)?)
        .bind(&process.result)
        .bind(process.id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get(&self, id: Uuid) -> Result<Process> {
        let row = sqlx::query("SELECT * FROM processes WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::NotFound(format!("process {id}")))?;

        row_to_process(&row)
    }

    pub async fn list(&self, object_id: Option<&str>) -> Result<Vec<Process>> {
        let rows = match object_id {
            Some(oid) => {
                sqlx::query(
                    "SELECT * FROM processes WHERE object_id = ? ORDER BY started_at ASC, id ASC",
                )
                .bind(oid)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query("SELECT * FROM processes ORDER BY started_at ASC, id ASC")
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        rows.iter().map(row_to_process).collect()
    }

    /// Processes still marked live in durable storage. Only non-empty after
    /// a crash; recovery force-errors them.
    pub async fn stale(&self) -> Result<Vec<Process>> {
        let rows = sqlx::query("SELECT * FROM processes WHERE status IN (?, ?)")
            .bind(ProcessStatus::InProgress.as_str())
            .bind(ProcessStatus::Cancelling.as_str())
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(row_to_process).collect()
    }

    /// The most recent process ever run against an object, if any.
    pub async fn last_for(&self, object_id: &str) -> Result<Option<Process>> {
        let row = sqlx::query(
            "SELECT * FROM processes WHERE object_id = ? ORDER BY started_at DESC, id DESC LIMIT 1",
        )
        .bind(object_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_process).transpose()
    }
}

fn row_to_process(row: &sqlx::sqlite::SqliteRow) -> Result<Process> {
    let id: String = row.get("id");
    let kind: String = row.get("kind");
    let status: String = row.get("status");
    let errors_json: String = row.get("errors_json");
    let init_json: String = row.get("init_json");
    let started_at: i64 = row.get("started_at");
    let ended_at: Option<i64> = row.get("ended_at");
    let percent: i64 = row.get("percent");

    Ok(Process {
        id: Uuid::parse_str(&id).map_err(|e| Error::Validation(format!("bad process id: {e}")))?,
        kind: ProcessKind::parse(&kind)
            .ok_or_else(|| Error::Validation(format!("unknown process kind '{kind}'")))?,
        object_id: row.get("object_id"),
        description: row.get("description"),
        status: ProcessStatus::parse(&status)
            .ok_or_else(|| Error::Validation(format!("unknown process status '{status}'")))?,
        percent: percent.clamp(0, 100) as u8,
        started_at: millis_to_utc(started_at),
        ended_at: ended_at.map(millis_to_utc),
        errors: serde_json::from_str(&errors_json)?,
        result: row.get("result"),
        init_snapshot: serde_json::from_str(&init_json)?,
    })
}

fn millis_to_utc(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis).single().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    async fn test_pool() -> (tempfile::TempDir, SqlitePool) {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::rooted_at(dir.path());
        let pool = crate::db::connect(&config).await.unwrap();
        crate::migrate::run_migrations(&pool).await.unwrap();
        (dir, pool)
    }

    #[tokio::test]
    async fn service_lifecycle_round_trip() {
        let (_dir, pool) = test_pool().await;
        let store = ServiceStore::new(pool.clone());

        let service = store.create("svc-1", ServiceKind::Prc, Some("news")).await.unwrap();
        assert_eq!(service.status, ServiceStatus::New);
        assert_eq!(service.alias.as_deref(), Some("news"));
        assert!(service.process_ids.is_empty());

        store.set_status("svc-1", ServiceStatus::Prepared).await.unwrap();
        let settings = PrcSettings {
            tag_ids: vec!["politics".into()],
            fields: vec!["body".into()],
            n_gram: 1,
            compression: 0.0,
        };
        store.set_settings("svc-1", &settings).await.unwrap();

        let reloaded = store.get("svc-1").await.unwrap();
        assert_eq!(reloaded.status, ServiceStatus::Prepared);
        assert_eq!(reloaded.settings.unwrap().tag_ids, vec!["politics"]);

        store.delete("svc-1").await.unwrap();
        assert!(matches!(store.get("svc-1").await, Err(Error::NotFound(_))));
        pool.close().await;
    }

    #[tokio::test]
    async fn process_round_trip_and_stale() {
        let (_dir, pool) = test_pool().await;
        let store = ProcessStore::new(pool.clone());

        let mut process = Process {
            id: Uuid::new_v4(),
            kind: ProcessKind::Index,
            object_id: "svc-1".into(),
            description: "full index".into(),
            status: ProcessStatus::InProgress,
            percent: 0,
            started_at: Utc::now(),
            ended_at: None,
            errors: vec![],
            result: None,
            init_snapshot: serde_json::json!({"tags": ["a"]}),
        };
        store.create(&process).await.unwrap();

        let stale = store.stale().await.unwrap();
        assert_eq!(stale.len(), 1);

        process.status = ProcessStatus::Finished;
        process.percent = 100;
        process.ended_at = Some(Utc::now());
        process.result = Some("ok".into());
        store.update(&process).await.unwrap();

        assert!(store.stale().await.unwrap().is_empty());
        let reloaded = store.get(process.id).await.unwrap();
        assert_eq!(reloaded.status, ProcessStatus::Finished);
        assert_eq!(reloaded.percent, 100);
        assert!(reloaded.ended_at.is_some());
        pool.close().await;
    }
}
