//! Vector store backends
//!
//! The store owns the user-scope check: documents belonging to another
//! user never leave it, whatever filter the caller supplies. Dimension is
//! fixed at initialisation; a mismatched vector is a configuration error,
//! not a request error.

use crate::error::{OrchestratorError, Result};
use crate::models::{EmbeddingRecord, RetrievalDocument};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::PgPool;
use sqlx::Row;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{OnceCell, RwLock};
use tracing::info;

/// Dimension used with external embedding providers.
pub const EXTERNAL_EMBEDDING_DIM: usize = 1536;

#[async_trait]
pub trait VectorStore: Send + Sync {
    fn dimension(&self) -> usize;

    /// Insert or replace the embedding row for an insight.
    async fn upsert(&self, record: EmbeddingRecord) -> Result<()>;

    /// Cosine top-K over the user's own embeddings, best first. `limit` is
    /// floored at 1.
    async fn search(
        &self,
        user_id: &str,
        query: &[f32],
        limit: usize,
    ) -> Result<Vec<RetrievalDocument>>;
}

fn check_dimension(expected: usize, got: usize) -> Result<()> {
    if expected == got {
        Ok(())
    } else {
        Err(OrchestratorError::Internal(format!(
            "embedding dimension mismatch: store is {expected}, vector is {got}"
        )))
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

fn to_document(id: String, user_id: String, metadata: &Value, score: f64) -> RetrievalDocument {
    let content = metadata
        .get("story")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let mut enriched = metadata.clone();
    if let Some(map) = enriched.as_object_mut() {
        map.insert("score".to_string(), Value::from(score));
    }

    RetrievalDocument {
        id,
        user_id,
        content,
        metadata: enriched,
    }
}

//
// ================= In-Memory Backend =================
//

pub struct InMemoryVectorStore {
    dimension: usize,
    rows: Arc<RwLock<HashMap<String, EmbeddingRecord>>>,
}

impl InMemoryVectorStore {
    pub fn new(dimension: usize) -> Self {
        info!(dimension, "Vector store backend: in-memory");
        Self {
            dimension,
            rows: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn upsert(&self, record: EmbeddingRecord) -> Result<()> {
        check_dimension(self.dimension, record.vector.len())?;
        let mut rows = self.rows.write().await;
        rows.insert(record.id.clone(), record);
        Ok(())
    }

    async fn search(
        &self,
        user_id: &str,
        query: &[f32],
        limit: usize,
    ) -> Result<Vec<RetrievalDocument>> {
        check_dimension(self.dimension, query.len())?;
        let rows = self.rows.read().await;

        let mut scored: Vec<(f64, &EmbeddingRecord)> = rows
            .values()
            .filter(|record| record.user_id == user_id)
            .map(|record| (cosine_similarity(query, &record.vector) as f64, record))
            .collect();

        scored.sort_by(|a, b| b.0.total_cmp(&a.0).then_with(|| a.1.id.cmp(&b.1.id)));
        scored.truncate(limit.max(1));

        Ok(scored
            .into_iter()
            .map(|(score, record)| {
                to_document(
                    record.id.clone(),
                    record.user_id.clone(),
                    &record.metadata,
                    score,
                )
            })
            .collect())
    }
}

//
// ================= Postgres Backend =================
//

/// pgvector-backed store with an HNSW cosine index.
pub struct PgVectorStore {
    pool: PgPool,
    dimension: usize,
    schema_ready: Arc<OnceCell<()>>,
}

impl PgVectorStore {
    pub fn new(pool: PgPool, dimension: usize) -> Self {
        info!(dimension, "Vector store backend: postgres");
        Self {
            pool,
            dimension,
            schema_ready: Arc::new(OnceCell::new()),
        }
    }

    async fn ensure_schema(&self) -> Result<()> {
        let pool = self.pool.clone();
        let dimension = self.dimension;
        self.schema_ready
            .get_or_try_init(|| async move {
                sqlx::query("CREATE EXTENSION IF NOT EXISTS vector;")
                    .execute(&pool)
                    .await?;

                // The column dimension is part of the DDL, so a process
                // configured for a different dimension fails here instead
                // of serving mixed-dimension rows.
                sqlx::query(&format!(
                    r#"
                    CREATE TABLE IF NOT EXISTS insight_embeddings (
                      id TEXT PRIMARY KEY,
                      user_id TEXT NOT NULL,
                      embedding vector({dimension}) NOT NULL,
                      metadata JSONB NOT NULL DEFAULT '{{}}'::jsonb
                    );
                    "#
                ))
                .execute(&pool)
                .await?;

                sqlx::query(
                    r#"
                    CREATE INDEX IF NOT EXISTS idx_insight_embeddings_ann
                    ON insight_embeddings USING hnsw (embedding vector_cosine_ops);
                    "#,
                )
                .execute(&pool)
                .await?;

                sqlx::query(
                    r#"
                    CREATE INDEX IF NOT EXISTS idx_insight_embeddings_user
                    ON insight_embeddings (user_id);
                    "#,
                )
                .execute(&pool)
                .await?;

                Ok::<(), sqlx::Error>(())
            })
            .await
            .map_err(|e| {
                OrchestratorError::Internal(format!("vector schema init failed: {}", e))
            })?;
        Ok(())
    }
}

#[async_trait]
impl VectorStore for PgVectorStore {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn upsert(&self, record: EmbeddingRecord) -> Result<()> {
        check_dimension(self.dimension, record.vector.len())?;
        self.ensure_schema().await?;

        sqlx::query(
            r#"
            INSERT INTO insight_embeddings (id, user_id, embedding, metadata)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO UPDATE SET
              user_id = EXCLUDED.user_id,
              embedding = EXCLUDED.embedding,
              metadata = EXCLUDED.metadata
            "#,
        )
        .bind(&record.id)
        .bind(&record.user_id)
        .bind(pgvector::Vector::from(record.vector.clone()))
        .bind(&record.metadata)
        .execute(&self.pool)
        .await
        .map_err(OrchestratorError::Database)?;
        Ok(())
    }

    async fn search(
        &self,
        user_id: &str,
        query: &[f32],
        limit: usize,
    ) -> Result<Vec<RetrievalDocument>> {
        check_dimension(self.dimension, query.len())?;
        self.ensure_schema().await?;

        let rows = sqlx::query(
            r#"
            SELECT id, user_id, metadata, 1 - (embedding <=> $1) AS score
            FROM insight_embeddings
            WHERE user_id = $2
            ORDER BY embedding <=> $1
            LIMIT $3
            "#,
        )
        .bind(pgvector::Vector::from(query.to_vec()))
        .bind(user_id)
        .bind(limit.max(1) as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(OrchestratorError::Database)?;

        let mut documents = Vec::with_capacity(rows.len());
        for row in rows {
            let row_user: String = row.try_get("user_id").map_err(OrchestratorError::Database)?;
            // The SQL already filters; this guards against query drift.
            if row_user != user_id {
                continue;
            }
            let id: String = row.try_get("id").map_err(OrchestratorError::Database)?;
            let metadata: Value = row.try_get("metadata").map_err(OrchestratorError::Database)?;
            let score: f64 = row.try_get("score").map_err(OrchestratorError::Database)?;
            documents.push(to_document(id, row_user, &metadata, score));
        }
        Ok(documents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(id: &str, user_id: &str, vector: Vec<f32>) -> EmbeddingRecord {
        EmbeddingRecord {
            id: id.to_string(),
            user_id: user_id.to_string(),
            vector,
            metadata: json!({
                "userId": user_id,
                "month": "2024-05",
                "story": format!("story for {id}"),
            }),
        }
    }

    #[tokio::test]
    async fn test_search_is_scoped_to_user() {
        let store = InMemoryVectorStore::new(3);
        store
            .upsert(record("a:2024-05", "user-a", vec![1.0, 0.0, 0.0]))
            .await
            .unwrap();
        store
            .upsert(record("b:2024-05", "user-b", vec![1.0, 0.0, 0.0]))
            .await
            .unwrap();

        let results = store.search("user-a", &[1.0, 0.0, 0.0], 10).await.unwrap();
        assert_eq!(results.len(), 1);
        assert!(results.iter().all(|d| d.user_id == "user-a"));
    }

    #[tokio::test]
    async fn test_search_orders_by_similarity() {
        let store = InMemoryVectorStore::new(3);
        store
            .upsert(record("u:2024-03", "u", vec![0.0, 1.0, 0.0]))
            .await
            .unwrap();
        store
            .upsert(record("u:2024-04", "u", vec![0.6, 0.8, 0.0]))
            .await
            .unwrap();
        store
            .upsert(record("u:2024-05", "u", vec![1.0, 0.0, 0.0]))
            .await
            .unwrap();

        let results = store.search("u", &[1.0, 0.0, 0.0], 2).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].id, "u:2024-05");
        assert_eq!(results[1].id, "u:2024-04");
        let first_score = results[0].metadata["score"].as_f64().unwrap();
        let second_score = results[1].metadata["score"].as_f64().unwrap();
        assert!(first_score >= second_score);
    }

    #[tokio::test]
    async fn test_limit_floors_at_one() {
        let store = InMemoryVectorStore::new(2);
        store
            .upsert(record("u:2024-05", "u", vec![1.0, 0.0]))
            .await
            .unwrap();
        let results = store.search("u", &[1.0, 0.0], 0).await.unwrap();
        assert_eq!(results.len(), 1);
    }

    #[tokio::test]
    async fn test_dimension_mismatch_is_fatal() {
        let store = InMemoryVectorStore::new(7);
        let err = store
            .upsert(record("u:2024-05", "u", vec![1.0, 0.0]))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Internal(_)));

        let err = store.search("u", &[1.0], 3).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Internal(_)));
    }

    #[tokio::test]
    async fn test_upsert_replaces_row() {
        let store = InMemoryVectorStore::new(2);
        store
            .upsert(record("u:2024-05", "u", vec![1.0, 0.0]))
            .await
            .unwrap();
        store
            .upsert(record("u:2024-05", "u", vec![0.0, 1.0]))
            .await
            .unwrap();

        let results = store.search("u", &[0.0, 1.0], 5).await.unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].metadata["score"].as_f64().unwrap() > 0.99);
    }

    #[test]
    fn test_cosine_similarity_zero_vector() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
    }
}
