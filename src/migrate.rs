use anyhow::Result;
use sqlx::SqlitePool;

pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    // Registered services and their lifecycle state
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS services (
            id TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            status TEXT NOT NULL,
            alias TEXT,
            settings_json TEXT,
            index_filter_json TEXT,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Durable history of every background process
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS processes (
            id TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            object_id TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            status TEXT NOT NULL,
            percent INTEGER NOT NULL DEFAULT 0,
            started_at INTEGER NOT NULL,
            ended_at INTEGER,
            errors_json TEXT NOT NULL DEFAULT '[]',
            result TEXT,
            init_json TEXT NOT NULL DEFAULT 'null'
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Bounded sorted neighbor lists keyed by (service, tag, document)
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS similarity_edges (
            service_id TEXT NOT NULL,
            tag_id TEXT NOT NULL,
            document_id TEXT NOT NULL,
            neighbor_id TEXT NOT NULL,
            score REAL NOT NULL,
            PRIMARY KEY (service_id, tag_id, document_id, neighbor_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_processes_object_id ON processes(object_id, started_at)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_processes_status ON processes(status)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_edges_key ON similarity_edges(service_id, tag_id, document_id, score DESC)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::rooted_at(dir.path());
        let pool = crate::db::connect(&config).await.unwrap();

        run_migrations(&pool).await.unwrap();
        run_migrations(&pool).await.unwrap();

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM services")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 0);
        pool.close().await;
    }
}
