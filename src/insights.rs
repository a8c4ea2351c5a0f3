//! Insight pipeline: compute, persist, embed
//!
//! The KPI engine itself is pure; this is the single place its results are
//! written. One call writes the insight row and its embedding together so
//! the two can never diverge for a `(user, month)`.

use crate::error::Result;
use crate::governor::RequestContext;
use crate::kpi::{self, MonthlyComputeInput};
use crate::memory::VectorStore;
use crate::models::{EmbeddingRecord, MonthlyInsight};
use crate::providers::{EmbedOptions, ModelGateway};
use crate::store::DataStore;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info};

/// Provider name that selects the built-in KPI feature embedding.
pub const INTERNAL_EMBEDDER: &str = "internal";

pub struct InsightPipeline {
    store: Arc<dyn DataStore>,
    vector: Arc<dyn VectorStore>,
    gateway: Arc<dyn ModelGateway>,
    embedding_provider: String,
}

impl InsightPipeline {
    pub fn new(
        store: Arc<dyn DataStore>,
        vector: Arc<dyn VectorStore>,
        gateway: Arc<dyn ModelGateway>,
        embedding_provider: String,
    ) -> Self {
        Self {
            store,
            vector,
            gateway,
            embedding_provider,
        }
    }

    pub fn store(&self) -> Arc<dyn DataStore> {
        self.store.clone()
    }

    pub fn vector(&self) -> Arc<dyn VectorStore> {
        self.vector.clone()
    }

    fn uses_internal_embedder(&self) -> bool {
        self.embedding_provider == INTERNAL_EMBEDDER
    }

    /// Embed arbitrary query text for retrieval. The internal embedder has
    /// no text model, so queries resolve to a neutral vector there and
    /// ranking falls back to recency-free uniform scores.
    pub async fn embed_query(&self, text: &str, ctx: &RequestContext) -> Result<Vec<f32>> {
        if self.uses_internal_embedder() {
            return Ok(vec![0.0; self.vector.dimension()]);
        }
        let outcome = self
            .gateway
            .embed(
                &[text.to_string()],
                &EmbedOptions {
                    provider: Some(self.embedding_provider.clone()),
                    model: None,
                },
                ctx,
            )
            .await?;
        Ok(kpi::l2_normalize(
            outcome.embeddings.into_iter().next().unwrap_or_default(),
        ))
    }

    /// Compute the monthly insight and persist both the row and its
    /// embedding. Upserts replace prior values for the `(user, month)`.
    pub async fn compute_and_store(
        &self,
        input: &MonthlyComputeInput,
        ctx: &RequestContext,
    ) -> Result<MonthlyInsight> {
        ctx.checkpoint()?;

        let facts = kpi::aggregate(input);
        let insight = kpi::compute_monthly(input);

        let vector = if self.uses_internal_embedder() {
            kpi::fallback_embedding(&facts)
        } else {
            let outcome = self
                .gateway
                .embed(
                    &[insight.story.clone()],
                    &EmbedOptions {
                        provider: Some(self.embedding_provider.clone()),
                        model: None,
                    },
                    ctx,
                )
                .await?;
            kpi::l2_normalize(outcome.embeddings.into_iter().next().unwrap_or_default())
        };

        let kpi_values: serde_json::Map<String, serde_json::Value> = insight
            .kpis
            .iter()
            .map(|(key, kpi)| (key.clone(), json!(kpi.value)))
            .collect();

        let record = EmbeddingRecord {
            id: insight.id.clone(),
            user_id: insight.user_id.clone(),
            vector,
            metadata: json!({
                "userId": insight.user_id,
                "month": insight.month,
                "story": insight.story,
                "kpis": kpi_values,
            }),
        };

        self.store.upsert_insight(&insight).await?;
        self.vector.upsert(record).await?;

        info!(
            user = %insight.user_id,
            month = %insight.month,
            "Monthly insight stored"
        );
        debug!(kpis = insight.kpis.len(), "Insight KPI set size");

        Ok(insight)
    }
}
