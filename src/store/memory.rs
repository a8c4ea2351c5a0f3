//! In-memory store for development and tests
//!
//! Single lock around the whole state so multi-map operations stay atomic.

use super::{
    DataStore, IdempotencyDecision, IDEMPOTENCY_LOCK_TTL_SECS, IDEMPOTENCY_RECORD_TTL_SECS,
};
use crate::error::{OrchestratorError, Result};
use crate::models::{
    Customer, IdempotencyRecord, MonthlyInsight, NewTransaction, Tenant, Transaction,
};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct MemoryInner {
    tenants: HashMap<String, Tenant>,
    customers: HashMap<Uuid, Customer>,
    /// `(tenant, external_reference)` → customer id
    customer_index: HashMap<(Uuid, String), Uuid>,
    transactions: HashMap<Uuid, Transaction>,
    /// `(tenant, idempotency_handle)` → transaction id
    transaction_index: HashMap<(Uuid, String), Uuid>,
    insights: HashMap<String, MonthlyInsight>,
    idempotency: HashMap<(Uuid, String), IdempotencyRecord>,
}

pub struct InMemoryStore {
    inner: Arc<RwLock<MemoryInner>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(MemoryInner::default())),
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DataStore for InMemoryStore {
    async fn ensure_tenant(&self, slug: &str) -> Result<Tenant> {
        let mut inner = self.inner.write().await;
        let tenant = inner
            .tenants
            .entry(slug.to_string())
            .or_insert_with(|| Tenant {
                id: Uuid::new_v4(),
                slug: slug.to_string(),
                metadata: json!({}),
            });
        Ok(tenant.clone())
    }

    async fn ensure_customer(
        &self,
        tenant_id: Uuid,
        external_reference: &str,
    ) -> Result<Customer> {
        let mut inner = self.inner.write().await;
        let key = (tenant_id, external_reference.to_string());

        if let Some(id) = inner.customer_index.get(&key) {
            let customer = inner
                .customers
                .get(id)
                .cloned()
                .ok_or_else(|| OrchestratorError::Internal("customer index desync".into()))?;
            return Ok(customer);
        }

        let customer = Customer {
            id: Uuid::new_v4(),
            tenant_id,
            external_reference: external_reference.to_string(),
            metadata: json!({}),
        };
        inner.customer_index.insert(key, customer.id);
        inner.customers.insert(customer.id, customer.clone());
        Ok(customer)
    }

    async fn customer(&self, customer_id: Uuid) -> Result<Option<Customer>> {
        let inner = self.inner.read().await;
        Ok(inner.customers.get(&customer_id).cloned())
    }

    async fn update_customer_metadata(
        &self,
        customer_id: Uuid,
        metadata: Value,
    ) -> Result<Customer> {
        let mut inner = self.inner.write().await;
        let customer = inner
            .customers
            .get_mut(&customer_id)
            .ok_or_else(|| OrchestratorError::NotFound("customer not found".into()))?;
        customer.metadata = metadata;
        Ok(customer.clone())
    }

    async fn customers_for_tenant(&self, tenant_id: Uuid) -> Result<Vec<Customer>> {
        let inner = self.inner.read().await;
        let mut customers: Vec<Customer> = inner
            .customers
            .values()
            .filter(|c| c.tenant_id == tenant_id)
            .cloned()
            .collect();
        customers.sort_by(|a, b| a.external_reference.cmp(&b.external_reference));
        Ok(customers)
    }

    async fn insert_transaction(&self, new: NewTransaction) -> Result<(Transaction, bool)> {
        let mut inner = self.inner.write().await;
        let key = (new.tenant_id, new.idempotency_handle.clone());

        if let Some(existing_id) = inner.transaction_index.get(&key) {
            let existing = inner
                .transactions
                .get(existing_id)
                .cloned()
                .ok_or_else(|| OrchestratorError::Internal("transaction index desync".into()))?;
            return Ok((existing, false));
        }

        let transaction = Transaction {
            id: Uuid::new_v4(),
            tenant_id: new.tenant_id,
            customer_id: new.customer_id,
            amount: new.amount,
            currency: new.currency,
            kind: new.kind,
            category: new.category,
            description: new.description,
            occurred_at: new.occurred_at,
            metadata: new.metadata,
            idempotency_handle: new.idempotency_handle,
        };
        inner.transaction_index.insert(key, transaction.id);
        inner.transactions.insert(transaction.id, transaction.clone());
        Ok((transaction, true))
    }

    async fn transactions_for_month(
        &self,
        tenant_id: Uuid,
        customer_id: Uuid,
        month: &str,
    ) -> Result<Vec<Transaction>> {
        let inner = self.inner.read().await;
        let mut rows: Vec<Transaction> = inner
            .transactions
            .values()
            .filter(|t| {
                t.tenant_id == tenant_id
                    && t.customer_id == customer_id
                    && t.occurred_at.format("%Y-%m").to_string() == month
            })
            .cloned()
            .collect();
        rows.sort_by_key(|t| t.occurred_at);
        Ok(rows)
    }

    async fn recent_transactions(
        &self,
        tenant_id: Uuid,
        customer_id: Uuid,
        limit: usize,
    ) -> Result<Vec<Transaction>> {
        let inner = self.inner.read().await;
        let mut rows: Vec<Transaction> = inner
            .transactions
            .values()
            .filter(|t| t.tenant_id == tenant_id && t.customer_id == customer_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.occurred_at.cmp(&a.occurred_at));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn upsert_insight(&self, insight: &MonthlyInsight) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.insights.insert(insight.id.clone(), insight.clone());
        Ok(())
    }

    async fn insight_by_id(&self, id: &str) -> Result<Option<MonthlyInsight>> {
        let inner = self.inner.read().await;
        Ok(inner.insights.get(id).cloned())
    }

    async fn insight(&self, user_id: &str, month: &str) -> Result<Option<MonthlyInsight>> {
        self.insight_by_id(&MonthlyInsight::insight_id(user_id, month))
            .await
    }

    async fn insights_for_user(&self, user_id: &str) -> Result<Vec<MonthlyInsight>> {
        let inner = self.inner.read().await;
        let mut rows: Vec<MonthlyInsight> = inner
            .insights
            .values()
            .filter(|i| i.user_id == user_id)
            .cloned()
            .collect();
        // YYYY-MM sorts chronologically as text.
        rows.sort_by(|a, b| b.month.cmp(&a.month));
        Ok(rows)
    }

    async fn begin_idempotent(
        &self,
        tenant_id: Uuid,
        key: &str,
        request_hash: &str,
    ) -> Result<IdempotencyDecision> {
        let mut inner = self.inner.write().await;
        let now = Utc::now();
        let slot = (tenant_id, key.to_string());

        if let Some(record) = inner.idempotency.get(&slot) {
            let expired = record.expires_at.map(|e| e < now).unwrap_or(false);
            if !expired {
                if record.request_hash != request_hash {
                    return Ok(IdempotencyDecision::Conflict);
                }
                if let Some(payload) = &record.response_payload {
                    return Ok(IdempotencyDecision::Replay(payload.clone()));
                }
                // In-flight with the same hash: take over the lock.
            }
        }

        inner.idempotency.insert(
            slot,
            IdempotencyRecord {
                id: Uuid::new_v4(),
                tenant_id,
                key: key.to_string(),
                request_hash: request_hash.to_string(),
                response_payload: None,
                locked_at: Some(now),
                created_at: now,
                expires_at: Some(now + ChronoDuration::seconds(IDEMPOTENCY_LOCK_TTL_SECS)),
            },
        );
        Ok(IdempotencyDecision::Fresh)
    }

    async fn complete_idempotent(
        &self,
        tenant_id: Uuid,
        key: &str,
        payload: &Value,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        let now = Utc::now();
        if let Some(record) = inner.idempotency.get_mut(&(tenant_id, key.to_string())) {
            record.response_payload = Some(payload.clone());
            record.locked_at = None;
            record.expires_at = Some(now + ChronoDuration::seconds(IDEMPOTENCY_RECORD_TTL_SECS));
        }
        Ok(())
    }

    async fn release_idempotent(&self, tenant_id: Uuid, key: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        if let Some(record) = inner.idempotency.get_mut(&(tenant_id, key.to_string())) {
            // Keep the record so hash conflicts stay detectable, but drop the
            // lock so retries may run.
            record.locked_at = None;
        }
        Ok(())
    }

    async fn idempotency_record(
        &self,
        tenant_id: Uuid,
        key: &str,
    ) -> Result<Option<IdempotencyRecord>> {
        let inner = self.inner.read().await;
        Ok(inner.idempotency.get(&(tenant_id, key.to_string())).cloned())
    }
}
