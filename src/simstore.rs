//! Similarity store adapter.
//!
//! Each key (service, tag, document) maps to a bounded list of
//! (neighbor, score) entries, ordered descending by score. Mutations are
//! serializable per key; different keys may be mutated concurrently.

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::Result;
use crate::models::SimilarityEntry;

/// Key of one stored neighbor list.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EdgeKey {
    pub service_id: String,
    pub tag_id: String,
    pub document_id: String,
}

impl EdgeKey {
    pub fn new(service_id: &str, tag_id: &str, document_id: &str) -> Self {
        Self {
            service_id: service_id.to_string(),
            tag_id: tag_id.to_string(),
            document_id: document_id.to_string(),
        }
    }
}

#[async_trait]
pub trait SimilarityStore: Send + Sync {
    /// Atomically replace the whole list stored under `key`.
    async fn replace(&self, key: &EdgeKey, entries: &[SimilarityEntry]) -> Result<()>;

    /// Insert an entry unless the neighbor is already present.
    async fn append_if_absent(&self, key: &EdgeKey, entry: &SimilarityEntry) -> Result<()>;

    /// Remove one neighbor from the list, if present.
    async fn remove(&self, key: &EdgeKey, neighbor_id: &str) -> Result<()>;

    /// Drop the lowest-scored entries until at most `max` remain.
    async fn trim_to_max(&self, key: &EdgeKey, max: usize) -> Result<()>;

    /// Top `n` entries by descending score; all entries when `n` is None.
    async fn read_top_n(&self, key: &EdgeKey, n: Option<usize>) -> Result<Vec<SimilarityEntry>>;

    /// Discard every list belonging to a service.
    async fn delete_all_for_service(&self, service_id: &str) -> Result<()>;
}

/// SQLite-backed store, one row per edge.
#[derive(Clone)]
pub struct SqliteSimilarityStore {
    pool: SqlitePool,
}

impl SqliteSimilarityStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SimilarityStore for SqliteSimilarityStore {
    async fn replace(&self, key: &EdgeKey, entries: &[SimilarityEntry]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "DELETE FROM similarity_edges WHERE service_id = ? AND tag_id = ? AND document_id = ?",
        )
        .bind(&key.service_id)
        .bind(&key.tag_id)
        .bind(&key.document_id)
        .execute(&mut *tx)
        .await?;

        for entry in entries {
            sqlx::query(
                "INSERT INTO similarity_edges (service_id, tag_id, document_id, neighbor_id, score) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&key.service_id)
            .bind(&key.tag_id)
            .bind(&key.document_id)
            .bind(&entry.neighbor_id)
            .bind(entry.score)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn append_if_absent(&self, key: &EdgeKey, entry: &SimilarityEntry) -> Result<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO similarity_edges (service_id, tag_id, document_id, neighbor_id, score) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&key.service_id)
        .bind(&key.tag_id)
        .bind(&key.document_id)
        .bind(&entry.neighbor_id)
        .bind(entry.score)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove(&self, key: &EdgeKey, neighbor_id: &str) -> Result<()> {
        sqlx::query(
            "DELETE FROM similarity_edges WHERE service_id = ? AND tag_id = ? AND document_id = ? AND neighbor_id = ?",
        )
        .bind(&key.service_id)
        .bind(&key.tag_id)
        .bind(&key.document_id)
        .bind(neighbor_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn trim_to_max(&self, key: &EdgeKey, max: usize) -> Result<()> {
        sqlx::query(
            r#"
            DELETE FROM similarity_edges
            WHERE service_id = ? AND tag_id = ? AND document_id = ?
              AND neighbor_id NOT IN (
                SELECT neighbor_id FROM similarity_edges
                WHERE service_id = ? AND tag_id = ? AND document_id = ?
                ORDER BY score DESC, neighbor_id ASC
                LIMIT ?
              )
            "#,
        )
        .bind(&key.service_id)
        .bind(&key.tag_id)
        .bind(&key.document_id)
        .bind(&key.service_id)
        .bind(&key.tag_id)
        .bind(&key.document_id)
        .bind(max as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn read_top_n(&self, key: &EdgeKey, n: Option<usize>) -> Result<Vec<SimilarityEntry>> {
        let limit = n.map(|n| n as i64).unwrap_or(-1);
        let rows = sqlx::query(
            r#"
            SELECT neighbor_id, score FROM similarity_edges
            WHERE service_id = ? AND tag_id = ? AND document_id = ?
            ORDER BY score DESC, neighbor_id ASC
            LIMIT ?
            "#,
        )
        .bind(&key.service_id)
        .bind(&key.tag_id)
        .bind(&key.document_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| SimilarityEntry {
                neighbor_id: row.get("neighbor_id"),
                score: row.get("score"),
            })
            .collect())
    }

    async fn delete_all_for_service(&self, service_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM similarity_edges WHERE service_id = ?")
            .bind(service_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// In-memory store for tests. Lists are kept sorted descending by score.
#[derive(Default)]
pub struct MemorySimilarityStore {
    lists: Mutex<HashMap<EdgeKey, Vec<SimilarityEntry>>>,
}

impl MemorySimilarityStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_lists(&self) -> std::sync::MutexGuard<'_, HashMap<EdgeKey, Vec<SimilarityEntry>>> {
        self.lists.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn sort_entries(entries: &mut [SimilarityEntry]) {
    entries.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.neighbor_id.cmp(&b.neighbor_id))
    });
}

#[async_trait]
impl SimilarityStore for MemorySimilarityStore {
    async fn replace(&self, key: &EdgeKey, entries: &[SimilarityEntry]) -> Result<()> {
        let mut sorted = entries.to_vec();
        sort_entries(&mut sorted);
        self.lock_lists().insert(key.clone(), sorted);
        Ok(())
    }

    async fn append_if_absent(&self, key: &EdgeKey, entry: &SimilarityEntry) -> Result<()> {
        let mut lists = self.lock_lists();
        let list = lists.entry(key.clone()).or_default();
        if !list.iter().any(|e| e.neighbor_id == entry.neighbor_id) {
            list.push(entry.clone());
            sort_entries(list);
        }
        Ok(())
    }

    async fn remove(&self, key: &EdgeKey, neighbor_id: &str) -> Result<()> {
        let mut lists = self.lock_lists();
        if let Some(list) = lists.get_mut(key) {
            list.retain(|e| e.neighbor_id != neighbor_id);
        }
        Ok(())
    }

    async fn trim_to_max(&self, key: &EdgeKey, max: usize) -> Result<()> {
        let mut lists = self.lock_lists();
        if let Some(list) = lists.get_mut(key) {
            list.truncate(max);
        }
        Ok(())
    }

    async fn read_top_n(&self, key: &EdgeKey, n: Option<usize>) -> Result<Vec<SimilarityEntry>> {
        let lists = self.lock_lists();
        let list = lists.get(key).cloned().unwrap_or_default();
        Ok(match n {
            Some(n) => list.into_iter().take(n).collect(),
            None => list,
        })
    }

    async fn delete_all_for_service(&self, service_id: &str) -> Result<()> {
        self.lock_lists()
            .retain(|key, _| key.service_id != service_id);
        Ok(())
    }
}
