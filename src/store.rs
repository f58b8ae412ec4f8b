//! Deduplicated incident store with a derived vector index.
//!
//! SQLite is the source of truth; the in-memory [`VectorIndex`] is derived
//! from it and rebuilt on load. Every mutation touches both within one
//! logical operation: the store row and vector row commit in a single
//! transaction, and the index is updated only after the commit succeeds,
//! so a crash can never leave a half-written incident.
//!
//! Writes are serialized per `event_id` (at most one concurrent writer per
//! key, concurrent across distinct keys). Reads take a shared lock on the
//! index snapshot; a concurrent ingest may or may not be visible to an
//! in-flight query. That is eventual consistency by design, not a bug.

use serde::Serialize;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::embedding::{blob_to_vec, vec_to_blob, EmbeddingEncoder};
use crate::error::AssistError;
use crate::index::{Metric, VectorIndex};
use crate::models::{IncidentRecord, Query, RetrievalResult, RetrievedIncident};

/// Verification that the store and its persisted vectors agree.
#[derive(Debug, Clone, Serialize)]
pub struct ConsistencyReport {
    pub incidents: usize,
    pub vectors: usize,
    /// Incidents without a persisted vector (recoverable via rebuild).
    pub missing_vectors: Vec<String>,
    /// Vectors whose incident row is gone.
    pub orphaned_vectors: Vec<String>,
}

impl ConsistencyReport {
    pub fn is_consistent(&self) -> bool {
        self.missing_vectors.is_empty() && self.orphaned_vectors.is_empty()
    }
}

pub struct IncidentStore {
    pool: SqlitePool,
    index: RwLock<VectorIndex>,
    write_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl IncidentStore {
    /// Load all persisted incidents, rebuild the in-memory index, and
    /// verify store/vector consistency.
    pub async fn open(
        pool: SqlitePool,
        metric: Metric,
    ) -> Result<(Self, ConsistencyReport), AssistError> {
        let rows = sqlx::query(
            r#"
            SELECT i.event_id, i.created_at, v.embedding
            FROM incidents i
            LEFT JOIN incident_vectors v ON v.event_id = i.event_id
            "#,
        )
        .fetch_all(&pool)
        .await?;

        let mut index = VectorIndex::new(metric);
        for row in &rows {
            let event_id: String = row.get("event_id");
            let created_at: i64 = row.get("created_at");
            if let Some(blob) = row.get::<Option<Vec<u8>>, _>("embedding") {
                index.insert(event_id, blob_to_vec(&blob), created_at);
            }
        }

        let report = consistency_of(&pool).await?;

        if report.is_consistent() {
            info!(incidents = report.incidents, "incident store loaded");
        } else {
            warn!(
                missing = report.missing_vectors.len(),
                orphaned = report.orphaned_vectors.len(),
                "store/index inconsistency detected; run rebuild"
            );
        }

        Ok((
            Self {
                pool,
                index: RwLock::new(index),
                write_locks: Mutex::new(HashMap::new()),
            },
            report,
        ))
    }

    /// Re-verify store/vector agreement against the current database
    /// state. Used at load and by the status surface.
    pub async fn check_consistency(&self) -> Result<ConsistencyReport, AssistError> {
        consistency_of(&self.pool).await
    }

    async fn key_lock(&self, event_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.write_locks.lock().await;
        // Entries only the map still references belong to finished
        // writers; drop them so the map stays bounded by in-flight writes.
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        locks
            .entry(event_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    #[cfg(test)]
    pub(crate) async fn write_lock_count(&self) -> usize {
        self.write_locks.lock().await.len()
    }

    /// Insert a new incident, or no-op when `event_id` already exists.
    ///
    /// Returns whether the record was newly created. The incident row and
    /// its vector commit atomically; the index is updated after commit.
    pub async fn upsert(
        &self,
        event_id: &str,
        embedding: &[f32],
        raw_text: &str,
        metadata: &HashMap<String, String>,
        created_at: i64,
        model: &str,
    ) -> Result<bool, AssistError> {
        let lock = self.key_lock(event_id).await;
        let _guard = lock.lock().await;

        let exists: Option<i64> = sqlx::query_scalar("SELECT 1 FROM incidents WHERE event_id = ?")
            .bind(event_id)
            .fetch_optional(&self.pool)
            .await?;
        if exists.is_some() {
            return Ok(false);
        }

        let metadata_json =
            serde_json::to_string(metadata).unwrap_or_else(|_| "{}".to_string());

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO incidents (event_id, raw_text, metadata_json, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(event_id)
        .bind(raw_text)
        .bind(&metadata_json)
        .bind(created_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO incident_vectors (event_id, model, dims, embedding) VALUES (?, ?, ?, ?)",
        )
        .bind(event_id)
        .bind(model)
        .bind(embedding.len() as i64)
        .bind(vec_to_blob(embedding))
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        self.index
            .write()
            .await
            .insert(event_id.to_string(), embedding.to_vec(), created_at);

        Ok(true)
    }

    /// Delete an incident from both store and index atomically.
    pub async fn remove(&self, event_id: &str) -> Result<(), AssistError> {
        let lock = self.key_lock(event_id).await;
        let _guard = lock.lock().await;

        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM incident_vectors WHERE event_id = ?")
            .bind(event_id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM incidents WHERE event_id = ?")
            .bind(event_id)
            .execute(&mut *tx)
            .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(AssistError::NotFound(event_id.to_string()));
        }
        tx.commit().await?;

        self.index.write().await.remove(event_id);
        Ok(())
    }

    /// Return up to `k` nearest incidents under the index metric, with
    /// optional post-retrieval filters from the query.
    ///
    /// When filters are set the search scans the whole index and filters
    /// before taking `k`, so a near-but-filtered hit cannot crowd out a
    /// matching one. Reflects the index state at the time of the call;
    /// fewer than `k` results is not an error, an empty index is.
    pub async fn query(
        &self,
        embedding: &[f32],
        k: usize,
        filters: Option<&Query>,
    ) -> Result<RetrievalResult, AssistError> {
        let has_filters = filters
            .map(|q| q.since.is_some() || q.severity.is_some())
            .unwrap_or(false);

        let hits = {
            let index = self.index.read().await;
            let fetch_k = if has_filters { index.len() } else { k };
            index.search(embedding, fetch_k)?
        };

        let mut result = RetrievalResult::default();
        for hit in hits {
            if result.hits.len() == k {
                break;
            }
            let Some(record) = self.get(&hit.event_id).await? else {
                // Index ahead of a concurrent remove; skip the stale hit.
                continue;
            };

            if let Some(q) = filters {
                if let Some(since) = q.since {
                    if record.created_at < since {
                        continue;
                    }
                }
                if let Some(severity) = &q.severity {
                    if record.metadata.get("severity") != Some(severity) {
                        continue;
                    }
                }
            }

            result.hits.push(RetrievedIncident {
                record,
                similarity: hit.score,
            });
        }

        Ok(result)
    }

    pub async fn get(&self, event_id: &str) -> Result<Option<IncidentRecord>, AssistError> {
        let row = sqlx::query(
            r#"
            SELECT i.event_id, i.raw_text, i.metadata_json, i.created_at, v.embedding
            FROM incidents i
            LEFT JOIN incident_vectors v ON v.event_id = i.event_id
            WHERE i.event_id = ?
            "#,
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| {
            let metadata_json: String = row.get("metadata_json");
            IncidentRecord {
                event_id: row.get("event_id"),
                raw_text: row.get("raw_text"),
                metadata: serde_json::from_str(&metadata_json).unwrap_or_default(),
                created_at: row.get("created_at"),
                embedding: row
                    .get::<Option<Vec<u8>>, _>("embedding")
                    .map(|b| blob_to_vec(&b))
                    .unwrap_or_default(),
            }
        }))
    }

    pub async fn count(&self) -> Result<i64, AssistError> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM incidents")
            .fetch_one(&self.pool)
            .await?)
    }

    pub async fn index_len(&self) -> usize {
        self.index.read().await.len()
    }

    /// Append a resolution note to an incident's metadata. This is the only
    /// path by which a delivered recommendation is persisted.
    pub async fn log_resolution(&self, event_id: &str, note: &str) -> Result<(), AssistError> {
        let lock = self.key_lock(event_id).await;
        let _guard = lock.lock().await;

        let Some(mut record) = self.get(event_id).await? else {
            return Err(AssistError::NotFound(event_id.to_string()));
        };
        record
            .metadata
            .insert("resolution".to_string(), note.to_string());
        let metadata_json =
            serde_json::to_string(&record.metadata).unwrap_or_else(|_| "{}".to_string());

        sqlx::query("UPDATE incidents SET metadata_json = ? WHERE event_id = ?")
            .bind(&metadata_json)
            .bind(event_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Recovery path: drop all persisted vectors and the in-memory index,
    /// then replay every store record through the encoder. Returns the
    /// number of re-indexed incidents.
    pub async fn rebuild(
        &self,
        encoder: &dyn EmbeddingEncoder,
    ) -> Result<usize, AssistError> {
        let rows = sqlx::query("SELECT event_id, raw_text, created_at FROM incidents")
            .fetch_all(&self.pool)
            .await?;

        sqlx::query("DELETE FROM incident_vectors")
            .execute(&self.pool)
            .await?;

        let metric = self.index.read().await.metric();
        let mut fresh = VectorIndex::new(metric);

        for row in &rows {
            let event_id: String = row.get("event_id");
            let raw_text: String = row.get("raw_text");
            let created_at: i64 = row.get("created_at");

            let embedding = encoder.encode(&raw_text).await?;
            sqlx::query(
                "INSERT INTO incident_vectors (event_id, model, dims, embedding) VALUES (?, ?, ?, ?)",
            )
            .bind(&event_id)
            .bind(encoder.model_name())
            .bind(embedding.len() as i64)
            .bind(vec_to_blob(&embedding))
            .execute(&self.pool)
            .await?;

            fresh.insert(event_id, embedding, created_at);
        }

        let count = fresh.len();
        *self.index.write().await = fresh;
        info!(incidents = count, "index rebuilt from store");
        Ok(count)
    }
}

async fn consistency_of(pool: &SqlitePool) -> Result<ConsistencyReport, AssistError> {
    let incidents: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM incidents")
        .fetch_one(pool)
        .await?;
    let vectors: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM incident_vectors")
        .fetch_one(pool)
        .await?;

    let missing_vectors: Vec<String> = sqlx::query_scalar(
        r#"
        SELECT i.event_id
        FROM incidents i
        LEFT JOIN incident_vectors v ON v.event_id = i.event_id
        WHERE v.event_id IS NULL
        "#,
    )
    .fetch_all(pool)
    .await?;

    let orphaned_vectors: Vec<String> = sqlx::query_scalar(
        r#"
        SELECT v.event_id
        FROM incident_vectors v
        LEFT JOIN incidents i ON i.event_id = v.event_id
        WHERE i.event_id IS NULL
        "#,
    )
    .fetch_all(pool)
    .await?;

    Ok(ConsistencyReport {
        incidents: incidents as usize,
        vectors: vectors as usize,
        missing_vectors,
        orphaned_vectors,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EmbeddingConfig;
    use crate::db;
    use crate::embedding::HashEncoder;
    use crate::migrate;
    use tempfile::TempDir;

    async fn open_store() -> (TempDir, IncidentStore) {
        let tmp = TempDir::new().unwrap();
        let pool = db::connect(&tmp.path().join("triage.sqlite")).await.unwrap();
        migrate::run_migrations(&pool).await.unwrap();
        let (store, report) = IncidentStore::open(pool, Metric::Cosine).await.unwrap();
        assert!(report.is_consistent());
        (tmp, store)
    }

    fn meta(severity: &str) -> HashMap<String, String> {
        HashMap::from([("severity".to_string(), severity.to_string())])
    }

    async fn encode(text: &str) -> Vec<f32> {
        HashEncoder::new(&EmbeddingConfig::default())
            .encode(text)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_upsert_idempotent() {
        let (_tmp, store) = open_store().await;
        let vec = encode("disk full on node-3").await;

        let created = store
            .upsert("evt-1", &vec, "disk full on node-3", &meta("high"), 100, "token-hash")
            .await
            .unwrap();
        assert!(created);

        let created_again = store
            .upsert("evt-1", &vec, "disk full on node-3", &meta("high"), 100, "token-hash")
            .await
            .unwrap();
        assert!(!created_again);

        assert_eq!(store.count().await.unwrap(), 1);
        assert_eq!(store.index_len().await, 1);
    }

    #[tokio::test]
    async fn test_query_returns_nearest_record() {
        let (_tmp, store) = open_store().await;
        let disk = encode("disk full on node-3").await;
        let cert = encode("tls certificate expired on ingress gateway").await;

        store
            .upsert("evt-disk", &disk, "disk full on node-3", &meta("high"), 100, "token-hash")
            .await
            .unwrap();
        store
            .upsert("evt-cert", &cert, "tls certificate expired on ingress gateway", &meta("low"), 200, "token-hash")
            .await
            .unwrap();

        let query_vec = encode("disk full alert node-3").await;
        let result = store.query(&query_vec, 1, None).await.unwrap();
        assert_eq!(result.hits.len(), 1);
        assert_eq!(result.hits[0].record.event_id, "evt-disk");
        assert!(result.hits[0].similarity > 0.5);
    }

    #[tokio::test]
    async fn test_bounded_k_with_small_store() {
        let (_tmp, store) = open_store().await;
        let a = encode("dns resolution failures in staging").await;
        let b = encode("oom kills on batch workers").await;
        store
            .upsert("evt-a", &a, "dns resolution failures in staging", &meta("low"), 1, "token-hash")
            .await
            .unwrap();
        store
            .upsert("evt-b", &b, "oom kills on batch workers", &meta("low"), 2, "token-hash")
            .await
            .unwrap();

        let result = store.query(&a, 5, None).await.unwrap();
        assert_eq!(result.hits.len(), 2);
    }

    #[tokio::test]
    async fn test_remove_then_never_returned() {
        let (_tmp, store) = open_store().await;
        let vec = encode("disk full on node-3").await;
        store
            .upsert("evt-1", &vec, "disk full on node-3", &meta("high"), 100, "token-hash")
            .await
            .unwrap();

        store.remove("evt-1").await.unwrap();
        let err = store.query(&vec, 1, None).await.unwrap_err();
        assert_eq!(err.category(), "index_empty");

        let err = store.remove("evt-1").await.unwrap_err();
        assert_eq!(err.category(), "not_found");
    }

    #[tokio::test]
    async fn test_severity_filter() {
        let (_tmp, store) = open_store().await;
        let a = encode("disk full on node-3").await;
        let b = encode("disk nearly full on node-7").await;
        store
            .upsert("evt-a", &a, "disk full on node-3", &meta("high"), 1, "token-hash")
            .await
            .unwrap();
        store
            .upsert("evt-b", &b, "disk nearly full on node-7", &meta("low"), 2, "token-hash")
            .await
            .unwrap();

        let q = Query {
            text: String::new(),
            since: None,
            severity: Some("high".to_string()),
        };
        let result = store.query(&a, 5, Some(&q)).await.unwrap();
        assert_eq!(result.event_ids(), vec!["evt-a".to_string()]);
    }

    #[tokio::test]
    async fn test_filter_reaches_past_nearest_hits() {
        let (_tmp, store) = open_store().await;
        let near = encode("disk full on node-3").await;
        let far = encode("disk usage growing on node-7 worker").await;
        store
            .upsert("evt-near", &near, "disk full on node-3", &meta("low"), 1, "token-hash")
            .await
            .unwrap();
        store
            .upsert("evt-far", &far, "disk usage growing on node-7 worker", &meta("high"), 2, "token-hash")
            .await
            .unwrap();

        // The single nearest hit is low severity; a high-severity query
        // with k=1 must still find the match further down the ranking.
        let query_vec = encode("disk full on node-3").await;
        let q = Query {
            text: String::new(),
            since: None,
            severity: Some("high".to_string()),
        };
        let result = store.query(&query_vec, 1, Some(&q)).await.unwrap();
        assert_eq!(result.event_ids(), vec!["evt-far".to_string()]);
    }

    #[tokio::test]
    async fn test_rebuild_restores_index() {
        let (tmp, store) = open_store().await;
        let vec = encode("disk full on node-3").await;
        store
            .upsert("evt-1", &vec, "disk full on node-3", &meta("high"), 100, "token-hash")
            .await
            .unwrap();
        drop(store);

        // Simulate vector loss, then reopen and rebuild from the store.
        let pool = db::connect(&tmp.path().join("triage.sqlite")).await.unwrap();
        sqlx::query("DELETE FROM incident_vectors")
            .execute(&pool)
            .await
            .unwrap();

        let (store, report) = IncidentStore::open(pool, Metric::Cosine).await.unwrap();
        assert!(!report.is_consistent());
        assert_eq!(report.missing_vectors, vec!["evt-1".to_string()]);

        let encoder = HashEncoder::new(&EmbeddingConfig::default());
        let rebuilt = store.rebuild(&encoder).await.unwrap();
        assert_eq!(rebuilt, 1);

        let result = store.query(&vec, 1, None).await.unwrap();
        assert_eq!(result.hits[0].record.event_id, "evt-1");
    }

    #[tokio::test]
    async fn test_write_lock_map_stays_bounded() {
        let (_tmp, store) = open_store().await;
        for i in 0..20 {
            let text = format!("event number {}", i);
            let vec = encode(&text).await;
            store
                .upsert(&format!("evt-{}", i), &vec, &text, &meta("low"), i, "token-hash")
                .await
                .unwrap();
        }
        // Finished writers leave at most their own entry behind.
        assert!(store.write_lock_count().await <= 1);
    }

    #[tokio::test]
    async fn test_log_resolution_persists_metadata() {
        let (_tmp, store) = open_store().await;
        let vec = encode("disk full on node-3").await;
        store
            .upsert("evt-1", &vec, "disk full on node-3", &meta("high"), 100, "token-hash")
            .await
            .unwrap();

        store
            .log_resolution("evt-1", "rotated logs and expanded the volume")
            .await
            .unwrap();

        let record = store.get("evt-1").await.unwrap().unwrap();
        assert_eq!(
            record.metadata.get("resolution").map(String::as_str),
            Some("rotated logs and expanded the volume")
        );
    }
}
