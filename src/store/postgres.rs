//! Postgres-backed store
//!
//! Runtime-bound queries over a lazily connected pool; the schema is
//! ensured once per process before the first statement runs.

use super::{
    DataStore, IdempotencyDecision, IDEMPOTENCY_LOCK_TTL_SECS, IDEMPOTENCY_RECORD_TTL_SECS,
};
use crate::error::{OrchestratorError, Result};
use crate::models::{
    Customer, IdempotencyRecord, MonthlyInsight, NewTransaction, Tenant, Transaction,
    TransactionKind,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::info;
use uuid::Uuid;

pub struct PgStore {
    pool: PgPool,
    schema_ready: Arc<OnceCell<()>>,
}

impl PgStore {
    pub fn connect_lazy(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect_lazy(url)
            .map_err(OrchestratorError::Database)?;

        info!("Data store backend: postgres");

        Ok(Self {
            pool,
            schema_ready: Arc::new(OnceCell::new()),
        })
    }

    /// Shared pool, reused by the vector store so both ride one
    /// connection budget.
    pub fn pool(&self) -> PgPool {
        self.pool.clone()
    }

    async fn ensure_schema(&self) -> Result<()> {
        let pool = self.pool.clone();
        self.schema_ready
            .get_or_try_init(|| async move {
                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS tenants (
                      id UUID PRIMARY KEY,
                      slug TEXT NOT NULL UNIQUE,
                      metadata JSONB NOT NULL DEFAULT '{}'::jsonb
                    );
                    "#,
                )
                .execute(&pool)
                .await?;

                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS customers (
                      id UUID PRIMARY KEY,
                      tenant_id UUID NOT NULL REFERENCES tenants(id),
                      external_reference TEXT NOT NULL,
                      metadata JSONB NOT NULL DEFAULT '{}'::jsonb,
                      UNIQUE (tenant_id, external_reference)
                    );
                    "#,
                )
                .execute(&pool)
                .await?;

                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS transactions (
                      id UUID PRIMARY KEY,
                      tenant_id UUID NOT NULL,
                      customer_id UUID NOT NULL,
                      amount NUMERIC(20,2) NOT NULL,
                      currency TEXT NOT NULL,
                      kind TEXT NOT NULL,
                      category TEXT,
                      description TEXT,
                      occurred_at TIMESTAMPTZ NOT NULL,
                      metadata JSONB NOT NULL DEFAULT '{}'::jsonb,
                      idempotency_handle TEXT NOT NULL,
                      UNIQUE (tenant_id, idempotency_handle)
                    );
                    "#,
                )
                .execute(&pool)
                .await?;

                sqlx::query(
                    r#"
                    CREATE INDEX IF NOT EXISTS idx_transactions_scope_time
                    ON transactions (tenant_id, customer_id, occurred_at DESC);
                    "#,
                )
                .execute(&pool)
                .await?;

                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS monthly_insights (
                      id TEXT PRIMARY KEY,
                      user_id TEXT NOT NULL,
                      month TEXT NOT NULL,
                      kpis JSONB NOT NULL,
                      story TEXT NOT NULL,
                      created_at TIMESTAMPTZ NOT NULL,
                      UNIQUE (user_id, month)
                    );
                    "#,
                )
                .execute(&pool)
                .await?;

                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS idempotency_records (
                      id UUID PRIMARY KEY,
                      tenant_id UUID NOT NULL,
                      key TEXT NOT NULL,
                      request_hash TEXT NOT NULL,
                      response_payload JSONB,
                      locked_at TIMESTAMPTZ,
                      created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                      expires_at TIMESTAMPTZ,
                      UNIQUE (tenant_id, key)
                    );
                    "#,
                )
                .execute(&pool)
                .await?;

                Ok::<(), sqlx::Error>(())
            })
            .await
            .map_err(|e| OrchestratorError::Internal(format!("schema init failed: {}", e)))?;
        Ok(())
    }
}

fn decode_tenant(row: &PgRow) -> Result<Tenant> {
    Ok(Tenant {
        id: row.try_get("id").map_err(OrchestratorError::Database)?,
        slug: row.try_get("slug").map_err(OrchestratorError::Database)?,
        metadata: row.try_get("metadata").map_err(OrchestratorError::Database)?,
    })
}

fn decode_customer(row: &PgRow) -> Result<Customer> {
    Ok(Customer {
        id: row.try_get("id").map_err(OrchestratorError::Database)?,
        tenant_id: row
            .try_get("tenant_id")
            .map_err(OrchestratorError::Database)?,
        external_reference: row
            .try_get("external_reference")
            .map_err(OrchestratorError::Database)?,
        metadata: row.try_get("metadata").map_err(OrchestratorError::Database)?,
    })
}

fn decode_transaction(row: &PgRow) -> Result<Transaction> {
    let kind_raw: String = row.try_get("kind").map_err(OrchestratorError::Database)?;
    let kind = TransactionKind::parse(&kind_raw)
        .ok_or_else(|| OrchestratorError::Internal(format!("unknown transaction kind {kind_raw}")))?;

    Ok(Transaction {
        id: row.try_get("id").map_err(OrchestratorError::Database)?,
        tenant_id: row
            .try_get("tenant_id")
            .map_err(OrchestratorError::Database)?,
        customer_id: row
            .try_get("customer_id")
            .map_err(OrchestratorError::Database)?,
        amount: row
            .try_get::<Decimal, _>("amount")
            .map_err(OrchestratorError::Database)?,
        currency: row.try_get("currency").map_err(OrchestratorError::Database)?,
        kind,
        category: row.try_get("category").map_err(OrchestratorError::Database)?,
        description: row
            .try_get("description")
            .map_err(OrchestratorError::Database)?,
        occurred_at: row
            .try_get("occurred_at")
            .map_err(OrchestratorError::Database)?,
        metadata: row.try_get("metadata").map_err(OrchestratorError::Database)?,
        idempotency_handle: row
            .try_get("idempotency_handle")
            .map_err(OrchestratorError::Database)?,
    })
}

fn decode_insight(row: &PgRow) -> Result<MonthlyInsight> {
    let kpis: Value = row.try_get("kpis").map_err(OrchestratorError::Database)?;
    Ok(MonthlyInsight {
        id: row.try_get("id").map_err(OrchestratorError::Database)?,
        user_id: row.try_get("user_id").map_err(OrchestratorError::Database)?,
        month: row.try_get("month").map_err(OrchestratorError::Database)?,
        kpis: serde_json::from_value(kpis)?,
        story: row.try_get("story").map_err(OrchestratorError::Database)?,
        created_at: row
            .try_get("created_at")
            .map_err(OrchestratorError::Database)?,
    })
}

#[async_trait]
impl DataStore for PgStore {
    async fn ensure_tenant(&self, slug: &str) -> Result<Tenant> {
        self.ensure_schema().await?;
        let row = sqlx::query(
            r#"
            INSERT INTO tenants (id, slug, metadata)
            VALUES ($1, $2, '{}'::jsonb)
            ON CONFLICT (slug) DO UPDATE SET slug = EXCLUDED.slug
            RETURNING id, slug, metadata
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(slug)
        .fetch_one(&self.pool)
        .await
        .map_err(OrchestratorError::Database)?;
        decode_tenant(&row)
    }

    async fn ensure_customer(
        &self,
        tenant_id: Uuid,
        external_reference: &str,
    ) -> Result<Customer> {
        self.ensure_schema().await?;
        let row = sqlx::query(
            r#"
            INSERT INTO customers (id, tenant_id, external_reference, metadata)
            VALUES ($1, $2, $3, '{}'::jsonb)
            ON CONFLICT (tenant_id, external_reference)
              DO UPDATE SET external_reference = EXCLUDED.external_reference
            RETURNING id, tenant_id, external_reference, metadata
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(tenant_id)
        .bind(external_reference)
        .fetch_one(&self.pool)
        .await
        .map_err(OrchestratorError::Database)?;
        decode_customer(&row)
    }

    async fn customer(&self, customer_id: Uuid) -> Result<Option<Customer>> {
        self.ensure_schema().await?;
        let row = sqlx::query(
            "SELECT id, tenant_id, external_reference, metadata FROM customers WHERE id = $1",
        )
        .bind(customer_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(OrchestratorError::Database)?;
        row.as_ref().map(decode_customer).transpose()
    }

    async fn update_customer_metadata(
        &self,
        customer_id: Uuid,
        metadata: Value,
    ) -> Result<Customer> {
        self.ensure_schema().await?;
        let row = sqlx::query(
            r#"
            UPDATE customers SET metadata = $2 WHERE id = $1
            RETURNING id, tenant_id, external_reference, metadata
            "#,
        )
        .bind(customer_id)
        .bind(metadata)
        .fetch_optional(&self.pool)
        .await
        .map_err(OrchestratorError::Database)?;
        row.as_ref()
            .map(decode_customer)
            .transpose()?
            .ok_or_else(|| OrchestratorError::NotFound("customer not found".into()))
    }

    async fn customers_for_tenant(&self, tenant_id: Uuid) -> Result<Vec<Customer>> {
        self.ensure_schema().await?;
        let rows = sqlx::query(
            r#"
            SELECT id, tenant_id, external_reference, metadata
            FROM customers WHERE tenant_id = $1
            ORDER BY external_reference ASC
            "#,
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await
        .map_err(OrchestratorError::Database)?;
        rows.iter().map(decode_customer).collect()
    }

    async fn insert_transaction(&self, new: NewTransaction) -> Result<(Transaction, bool)> {
        self.ensure_schema().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO transactions
              (id, tenant_id, customer_id, amount, currency, kind, category,
               description, occurred_at, metadata, idempotency_handle)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (tenant_id, idempotency_handle) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(new.tenant_id)
        .bind(new.customer_id)
        .bind(new.amount)
        .bind(&new.currency)
        .bind(new.kind.to_string())
        .bind(&new.category)
        .bind(&new.description)
        .bind(new.occurred_at)
        .bind(&new.metadata)
        .bind(&new.idempotency_handle)
        .execute(&self.pool)
        .await
        .map_err(OrchestratorError::Database)?;

        let created = inserted.rows_affected() > 0;

        let row = sqlx::query(
            r#"
            SELECT id, tenant_id, customer_id, amount, currency, kind, category,
                   description, occurred_at, metadata, idempotency_handle
            FROM transactions
            WHERE tenant_id = $1 AND idempotency_handle = $2
            "#,
        )
        .bind(new.tenant_id)
        .bind(&new.idempotency_handle)
        .fetch_one(&self.pool)
        .await
        .map_err(OrchestratorError::Database)?;

        Ok((decode_transaction(&row)?, created))
    }

    async fn transactions_for_month(
        &self,
        tenant_id: Uuid,
        customer_id: Uuid,
        month: &str,
    ) -> Result<Vec<Transaction>> {
        self.ensure_schema().await?;
        let rows = sqlx::query(
            r#"
            SELECT id, tenant_id, customer_id, amount, currency, kind, category,
                   description, occurred_at, metadata, idempotency_handle
            FROM transactions
            WHERE tenant_id = $1 AND customer_id = $2
              AND to_char(occurred_at AT TIME ZONE 'UTC', 'YYYY-MM') = $3
            ORDER BY occurred_at ASC
            "#,
        )
        .bind(tenant_id)
        .bind(customer_id)
        .bind(month)
        .fetch_all(&self.pool)
        .await
        .map_err(OrchestratorError::Database)?;
        rows.iter().map(decode_transaction).collect()
    }

    async fn recent_transactions(
        &self,
        tenant_id: Uuid,
        customer_id: Uuid,
        limit: usize,
    ) -> Result<Vec<Transaction>> {
        self.ensure_schema().await?;
        let rows = sqlx::query(
            r#"
            SELECT id, tenant_id, customer_id, amount, currency, kind, category,
                   description, occurred_at, metadata, idempotency_handle
            FROM transactions
            WHERE tenant_id = $1 AND customer_id = $2
            ORDER BY occurred_at DESC
            LIMIT $3
            "#,
        )
        .bind(tenant_id)
        .bind(customer_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(OrchestratorError::Database)?;
        rows.iter().map(decode_transaction).collect()
    }

    async fn upsert_insight(&self, insight: &MonthlyInsight) -> Result<()> {
        self.ensure_schema().await?;
        sqlx::query(
            r#"
            INSERT INTO monthly_insights (id, user_id, month, kpis, story, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (user_id, month) DO UPDATE SET
              kpis = EXCLUDED.kpis,
              story = EXCLUDED.story,
              created_at = EXCLUDED.created_at
            "#,
        )
        .bind(&insight.id)
        .bind(&insight.user_id)
        .bind(&insight.month)
        .bind(serde_json::to_value(&insight.kpis)?)
        .bind(&insight.story)
        .bind(insight.created_at)
        .execute(&self.pool)
        .await
        .map_err(OrchestratorError::Database)?;
        Ok(())
    }

    async fn insight_by_id(&self, id: &str) -> Result<Option<MonthlyInsight>> {
        self.ensure_schema().await?;
        let row = sqlx::query(
            "SELECT id, user_id, month, kpis, story, created_at FROM monthly_insights WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(OrchestratorError::Database)?;
        row.as_ref().map(decode_insight).transpose()
    }

    async fn insight(&self, user_id: &str, month: &str) -> Result<Option<MonthlyInsight>> {
        self.insight_by_id(&MonthlyInsight::insight_id(user_id, month))
            .await
    }

    async fn insights_for_user(&self, user_id: &str) -> Result<Vec<MonthlyInsight>> {
        self.ensure_schema().await?;
        let rows = sqlx::query(
            r#"
            SELECT id, user_id, month, kpis, story, created_at
            FROM monthly_insights
            WHERE user_id = $1
            ORDER BY month DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(OrchestratorError::Database)?;
        rows.iter().map(decode_insight).collect()
    }

    async fn begin_idempotent(
        &self,
        tenant_id: Uuid,
        key: &str,
        request_hash: &str,
    ) -> Result<IdempotencyDecision> {
        self.ensure_schema().await?;
        let now = Utc::now();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(OrchestratorError::Database)?;

        let existing = sqlx::query(
            r#"
            SELECT request_hash, response_payload, expires_at
            FROM idempotency_records
            WHERE tenant_id = $1 AND key = $2
            FOR UPDATE
            "#,
        )
        .bind(tenant_id)
        .bind(key)
        .fetch_optional(&mut *tx)
        .await
        .map_err(OrchestratorError::Database)?;

        if let Some(row) = existing {
            let stored_hash: String = row
                .try_get("request_hash")
                .map_err(OrchestratorError::Database)?;
            let payload: Option<Value> = row
                .try_get("response_payload")
                .map_err(OrchestratorError::Database)?;
            let expires_at: Option<DateTime<Utc>> = row
                .try_get("expires_at")
                .map_err(OrchestratorError::Database)?;
            let expired = expires_at.map(|e| e < now).unwrap_or(false);

            if !expired {
                if stored_hash != request_hash {
                    tx.rollback().await.map_err(OrchestratorError::Database)?;
                    return Ok(IdempotencyDecision::Conflict);
                }
                if let Some(payload) = payload {
                    tx.rollback().await.map_err(OrchestratorError::Database)?;
                    return Ok(IdempotencyDecision::Replay(payload));
                }
            }
        }

        sqlx::query(
            r#"
            INSERT INTO idempotency_records
              (id, tenant_id, key, request_hash, response_payload, locked_at, created_at, expires_at)
            VALUES ($1, $2, $3, $4, NULL, $5, $5, $6)
            ON CONFLICT (tenant_id, key) DO UPDATE SET
              request_hash = EXCLUDED.request_hash,
              response_payload = NULL,
              locked_at = EXCLUDED.locked_at,
              expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(tenant_id)
        .bind(key)
        .bind(request_hash)
        .bind(now)
        .bind(now + ChronoDuration::seconds(IDEMPOTENCY_LOCK_TTL_SECS))
        .execute(&mut *tx)
        .await
        .map_err(OrchestratorError::Database)?;

        tx.commit().await.map_err(OrchestratorError::Database)?;
        Ok(IdempotencyDecision::Fresh)
    }

    async fn complete_idempotent(
        &self,
        tenant_id: Uuid,
        key: &str,
        payload: &Value,
    ) -> Result<()> {
        self.ensure_schema().await?;
        sqlx::query(
            r#"
            UPDATE idempotency_records
            SET response_payload = $3, locked_at = NULL, expires_at = $4
            WHERE tenant_id = $1 AND key = $2
            "#,
        )
        .bind(tenant_id)
        .bind(key)
        .bind(payload)
        .bind(Utc::now() + ChronoDuration::seconds(IDEMPOTENCY_RECORD_TTL_SECS))
        .execute(&self.pool)
        .await
        .map_err(OrchestratorError::Database)?;
        Ok(())
    }

    async fn release_idempotent(&self, tenant_id: Uuid, key: &str) -> Result<()> {
        self.ensure_schema().await?;
        sqlx::query(
            "UPDATE idempotency_records SET locked_at = NULL WHERE tenant_id = $1 AND key = $2",
        )
        .bind(tenant_id)
        .bind(key)
        .execute(&self.pool)
        .await
        .map_err(OrchestratorError::Database)?;
        Ok(())
    }

    async fn idempotency_record(
        &self,
        tenant_id: Uuid,
        key: &str,
    ) -> Result<Option<IdempotencyRecord>> {
        self.ensure_schema().await?;
        let row = sqlx::query(
            r#"
            SELECT id, tenant_id, key, request_hash, response_payload,
                   locked_at, created_at, expires_at
            FROM idempotency_records
            WHERE tenant_id = $1 AND key = $2
            "#,
        )
        .bind(tenant_id)
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(OrchestratorError::Database)?;

        row.map(|row| {
            Ok(IdempotencyRecord {
                id: row.try_get("id").map_err(OrchestratorError::Database)?,
                tenant_id: row
                    .try_get("tenant_id")
                    .map_err(OrchestratorError::Database)?,
                key: row.try_get("key").map_err(OrchestratorError::Database)?,
                request_hash: row
                    .try_get("request_hash")
                    .map_err(OrchestratorError::Database)?,
                response_payload: row
                    .try_get("response_payload")
                    .map_err(OrchestratorError::Database)?,
                locked_at: row
                    .try_get("locked_at")
                    .map_err(OrchestratorError::Database)?,
                created_at: row
                    .try_get("created_at")
                    .map_err(OrchestratorError::Database)?,
                expires_at: row
                    .try_get("expires_at")
                    .map_err(OrchestratorError::Database)?,
            })
        })
        .transpose()
    }
}
