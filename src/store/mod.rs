//! Persistence layer
//!
//! One trait over tenants, customers, transactions, monthly insights, and
//! idempotency records. Two backends: Postgres for deployments, in-memory
//! for development and tests. Selection follows the configured database URL.

use crate::error::Result;
use crate::models::{
    Customer, IdempotencyRecord, MonthlyInsight, NewTransaction, Tenant, Transaction,
};
use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

pub mod memory;
pub mod postgres;

pub use memory::InMemoryStore;
pub use postgres::PgStore;

/// How long an in-flight idempotency lock stays valid before another caller
/// may take it over.
pub const IDEMPOTENCY_LOCK_TTL_SECS: i64 = 300;

/// Retention for completed idempotency records.
pub const IDEMPOTENCY_RECORD_TTL_SECS: i64 = 86_400;

/// Outcome of attempting to claim an idempotency slot.
#[derive(Debug, Clone, PartialEq)]
pub enum IdempotencyDecision {
    /// No usable record existed; the caller holds the lock and must run.
    Fresh,
    /// A completed record with the same request hash exists.
    Replay(Value),
    /// A record with a different request hash exists.
    Conflict,
}

#[async_trait]
pub trait DataStore: Send + Sync {
    // ---- tenancy ----

    /// Load or lazily create the tenant row for a slug.
    async fn ensure_tenant(&self, slug: &str) -> Result<Tenant>;

    /// Load or lazily create the customer row for `(tenant, external_reference)`.
    async fn ensure_customer(&self, tenant_id: Uuid, external_reference: &str)
        -> Result<Customer>;

    async fn customer(&self, customer_id: Uuid) -> Result<Option<Customer>>;

    async fn update_customer_metadata(
        &self,
        customer_id: Uuid,
        metadata: Value,
    ) -> Result<Customer>;

    async fn customers_for_tenant(&self, tenant_id: Uuid) -> Result<Vec<Customer>>;

    // ---- transactions ----

    /// Insert a transaction. The `(tenant, idempotency_handle)` pair is a
    /// uniqueness barrier: when it already exists the stored row is returned
    /// and the flag is `false`.
    async fn insert_transaction(&self, new: NewTransaction) -> Result<(Transaction, bool)>;

    async fn transactions_for_month(
        &self,
        tenant_id: Uuid,
        customer_id: Uuid,
        month: &str,
    ) -> Result<Vec<Transaction>>;

    async fn recent_transactions(
        &self,
        tenant_id: Uuid,
        customer_id: Uuid,
        limit: usize,
    ) -> Result<Vec<Transaction>>;

    // ---- insights ----

    /// Replace the insight for `(user, month)`.
    async fn upsert_insight(&self, insight: &MonthlyInsight) -> Result<()>;

    async fn insight_by_id(&self, id: &str) -> Result<Option<MonthlyInsight>>;

    async fn insight(&self, user_id: &str, month: &str) -> Result<Option<MonthlyInsight>>;

    /// All insights for a user, most recent month first.
    async fn insights_for_user(&self, user_id: &str) -> Result<Vec<MonthlyInsight>>;

    async fn latest_insight(&self, user_id: &str) -> Result<Option<MonthlyInsight>> {
        Ok(self.insights_for_user(user_id).await?.into_iter().next())
    }

    // ---- idempotency ----

    /// Claim the `(tenant, key)` slot: insert-or-take-over with the lock
    /// semantics of the invocation protocol.
    async fn begin_idempotent(
        &self,
        tenant_id: Uuid,
        key: &str,
        request_hash: &str,
    ) -> Result<IdempotencyDecision>;

    /// Persist the serialised response and clear the lock.
    async fn complete_idempotent(&self, tenant_id: Uuid, key: &str, payload: &Value)
        -> Result<()>;

    /// Clear the lock without persisting a response (resolver failure);
    /// later retries are allowed.
    async fn release_idempotent(&self, tenant_id: Uuid, key: &str) -> Result<()>;

    /// Introspection hook used by tests and the replay path.
    async fn idempotency_record(
        &self,
        tenant_id: Uuid,
        key: &str,
    ) -> Result<Option<IdempotencyRecord>>;
}
