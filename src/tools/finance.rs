//! Canonical finance tool set
//!
//! `transactions.create`, `transactions.list`, `insights.compute`,
//! `insights.list`, `health.score`, `actions.suggest`, `simulations.run`.
//! Inputs are typed serde structs; unexpected fields fail validation at
//! the boundary.

use super::{Tool, ToolCall, ToolRegistry};
use crate::actions;
use crate::error::{OrchestratorError, Result};
use crate::health;
use crate::ingest::parse_amount;
use crate::insights::InsightPipeline;
use crate::kpi::{self, Balances, KpiTransaction, MonthlyComputeInput, PreviousSnapshot};
use crate::models::{MonthlyInsight, NewTransaction, TransactionKind};
use crate::simulator;
use crate::store::DataStore;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;

const DEFAULT_LIST_LIMIT: usize = 50;
const MAX_LIST_LIMIT: usize = 200;

/// Derived idempotency keys are truncated to this many hex chars.
const DERIVED_KEY_LEN: usize = 24;

fn parse_input<T: DeserializeOwned>(input: &Value) -> Result<T> {
    serde_json::from_value(input.clone()).map_err(|e| {
        OrchestratorError::validation("invalid tool input", vec![e.to_string()])
    })
}

fn parse_occurred_at(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(timestamp) = raw.parse::<DateTime<Utc>>() {
        return Some(timestamp);
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Load an insight by explicit id, by month, or fall back to the latest,
/// always scoped to the calling user.
async fn load_insight(
    store: &Arc<dyn DataStore>,
    owner: &str,
    insight_id: Option<&str>,
    month: Option<&str>,
) -> Result<MonthlyInsight> {
    let insight = if let Some(id) = insight_id {
        store.insight_by_id(id).await?
    } else if let Some(month) = month {
        kpi::validate_month(month)?;
        store.insight(owner, month).await?
    } else {
        store.latest_insight(owner).await?
    };

    match insight {
        Some(insight) if insight.user_id == owner => Ok(insight),
        // A foreign id reads as absent, never as someone else's data.
        _ => Err(OrchestratorError::NotFound("insight not found".into())),
    }
}

//
// ================= transactions.create =================
//

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
struct CreateTransactionInput {
    transaction: TransactionPayload,
    #[serde(default)]
    idempotency_key: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransactionPayload {
    amount: Option<Value>,
    currency: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    category: Option<String>,
    description: Option<String>,
    merchant: Option<String>,
    notes: Option<String>,
    occurred_at: Option<String>,
    #[serde(default)]
    raw_text: Option<String>,
}

struct ValidatedTransaction {
    amount: Decimal,
    currency: String,
    kind: TransactionKind,
    category: Option<String>,
    description: Option<String>,
    merchant: Option<String>,
    occurred_at: DateTime<Utc>,
    occurred_at_raw: String,
    description_or_notes: String,
}

fn validate_transaction(payload: &TransactionPayload) -> Result<ValidatedTransaction> {
    let mut issues = Vec::new();

    let amount = match &payload.amount {
        None => {
            issues.push("transaction.amount is required".to_string());
            Decimal::ZERO
        }
        Some(raw) => match parse_amount(raw) {
            Ok(amount) if amount != Decimal::ZERO => amount,
            Ok(_) => {
                issues.push("transaction.amount must be non-zero".to_string());
                Decimal::ZERO
            }
            Err(_) => {
                issues.push(format!("transaction.amount is not a number: {raw}"));
                Decimal::ZERO
            }
        },
    };

    let currency = payload
        .currency
        .clone()
        .unwrap_or_else(|| kpi::DEFAULT_CURRENCY.to_string())
        .to_uppercase();
    if currency.len() != 3 || !currency.bytes().all(|b| b.is_ascii_alphabetic()) {
        issues.push(format!("transaction.currency must be ISO 4217: {currency}"));
    }

    let kind = match payload.kind.as_deref() {
        None => TransactionKind::Expense,
        Some(raw) => TransactionKind::parse(raw).unwrap_or_else(|| {
            issues.push(format!("transaction.type is unknown: {raw}"));
            TransactionKind::Expense
        }),
    };

    let occurred_at_raw = payload.occurred_at.clone().unwrap_or_default();
    let occurred_at = if occurred_at_raw.is_empty() {
        Utc::now()
    } else {
        match parse_occurred_at(&occurred_at_raw) {
            Some(timestamp) => timestamp,
            None => {
                issues.push(format!(
                    "transaction.occurredAt is not a date: {occurred_at_raw}"
                ));
                Utc::now()
            }
        }
    };

    if !issues.is_empty() {
        return Err(OrchestratorError::validation("invalid transaction", issues));
    }

    // Income flows in positive; everything else is an outflow.
    let signed = match kind {
        TransactionKind::Income => amount.abs(),
        _ => -amount.abs(),
    };

    let description = payload
        .description
        .clone()
        .or_else(|| payload.notes.clone())
        .or_else(|| payload.raw_text.clone());
    let description_or_notes = description.clone().unwrap_or_default();

    Ok(ValidatedTransaction {
        amount: signed.round_dp(2),
        currency,
        kind,
        category: payload.category.clone(),
        description,
        merchant: payload.merchant.clone(),
        occurred_at,
        occurred_at_raw,
        description_or_notes,
    })
}

pub struct CreateTransactionTool {
    store: Arc<dyn DataStore>,
}

impl CreateTransactionTool {
    fn derived_key(&self, call: &ToolCall, validated: &ValidatedTransaction) -> String {
        let mut hasher = Sha256::new();
        hasher.update(call.auth.tenant_id.to_string().as_bytes());
        hasher.update(call.auth.customer_id.to_string().as_bytes());
        hasher.update(validated.occurred_at_raw.as_bytes());
        hasher.update(validated.amount.to_string().as_bytes());
        hasher.update(validated.description_or_notes.as_bytes());
        hex::encode(hasher.finalize())[..DERIVED_KEY_LEN].to_string()
    }
}

#[async_trait]
impl Tool for CreateTransactionTool {
    fn name(&self) -> &'static str {
        "transactions.create"
    }

    fn description(&self) -> &'static str {
        "Record a transaction with exactly-once semantics"
    }

    /// Explicit key when supplied, otherwise one derived from the payload
    /// so accidental duplicates collapse onto the same slot.
    fn idempotency_key(&self, call: &ToolCall) -> Option<String> {
        let input: CreateTransactionInput = parse_input(&call.input).ok()?;
        if let Some(key) = input.idempotency_key {
            return Some(key);
        }
        let validated = validate_transaction(&input.transaction).ok()?;
        Some(self.derived_key(call, &validated))
    }

    async fn resolve(&self, call: &ToolCall) -> Result<Value> {
        let input: CreateTransactionInput = parse_input(&call.input)?;
        let validated = validate_transaction(&input.transaction)?;

        let key = input
            .idempotency_key
            .clone()
            .unwrap_or_else(|| self.derived_key(call, &validated));

        let mut metadata = json!({});
        if let Some(merchant) = &validated.merchant {
            metadata["merchant"] = json!(merchant);
        }

        let (transaction, created) = self
            .store
            .insert_transaction(NewTransaction {
                tenant_id: call.auth.tenant_id,
                customer_id: call.auth.customer_id,
                amount: validated.amount,
                currency: validated.currency,
                kind: validated.kind,
                category: validated.category,
                description: validated.description,
                occurred_at: validated.occurred_at,
                metadata,
                idempotency_handle: key.clone(),
            })
            .await?;

        Ok(json!({
            "transaction": transaction,
            "created": created,
            "idempotency": { "key": key, "replayed": false },
        }))
    }
}

//
// ================= transactions.list =================
//

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
struct ListTransactionsInput {
    #[serde(default)]
    month: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
}

pub struct ListTransactionsTool {
    store: Arc<dyn DataStore>,
}

#[async_trait]
impl Tool for ListTransactionsTool {
    fn name(&self) -> &'static str {
        "transactions.list"
    }

    fn description(&self) -> &'static str {
        "List the caller's transactions, optionally for one month"
    }

    async fn resolve(&self, call: &ToolCall) -> Result<Value> {
        let input: ListTransactionsInput = parse_input(&call.input)?;
        let limit = input.limit.unwrap_or(DEFAULT_LIST_LIMIT).min(MAX_LIST_LIMIT);

        let transactions = match &input.month {
            Some(month) => {
                kpi::validate_month(month)?;
                self.store
                    .transactions_for_month(call.auth.tenant_id, call.auth.customer_id, month)
                    .await?
            }
            None => {
                self.store
                    .recent_transactions(call.auth.tenant_id, call.auth.customer_id, limit)
                    .await?
            }
        };

        let count = transactions.len();
        Ok(json!({
            "transactions": transactions,
            "count": count,
        }))
    }
}

//
// ================= insights.compute =================
//

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
struct ComputeInsightInput {
    month: String,
    #[serde(default)]
    transactions: Option<Vec<InsightRow>>,
    #[serde(default)]
    balances: Option<Balances>,
    #[serde(default)]
    goals: Option<BTreeMap<String, f64>>,
    #[serde(default)]
    previous: Option<PreviousSnapshot>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InsightRow {
    amount: Value,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    currency: Option<String>,
}

pub struct ComputeInsightTool {
    pipeline: Arc<InsightPipeline>,
}

#[async_trait]
impl Tool for ComputeInsightTool {
    fn name(&self) -> &'static str {
        "insights.compute"
    }

    fn description(&self) -> &'static str {
        "Compute and persist the monthly KPI insight"
    }

    async fn resolve(&self, call: &ToolCall) -> Result<Value> {
        let input: ComputeInsightInput = parse_input(&call.input)?;
        kpi::validate_month(&input.month)?;

        let store = self.pipeline.store();
        let owner = call.auth.insight_owner();

        let transactions: Vec<KpiTransaction> = match input.transactions {
            Some(rows) => {
                let mut parsed = Vec::with_capacity(rows.len());
                for (index, row) in rows.iter().enumerate() {
                    let amount = parse_amount(&row.amount).map_err(|_| {
                        OrchestratorError::validation(
                            "invalid transaction row",
                            vec![format!("transactions[{index}].amount is not a number")],
                        )
                    })?;
                    let kind = TransactionKind::parse(&row.kind).ok_or_else(|| {
                        OrchestratorError::validation(
                            "invalid transaction row",
                            vec![format!(
                                "transactions[{index}].type is unknown: {}",
                                row.kind
                            )],
                        )
                    })?;
                    parsed.push(KpiTransaction {
                        amount,
                        kind,
                        category: row.category.clone(),
                        currency: row.currency.clone(),
                    });
                }
                parsed
            }
            None => store
                .transactions_for_month(call.auth.tenant_id, call.auth.customer_id, &input.month)
                .await?
                .iter()
                .map(KpiTransaction::from)
                .collect(),
        };

        // Customer-declared goals apply first; request goals override.
        let mut goals = store
            .customer(call.auth.customer_id)
            .await?
            .map(|customer| customer.kpi_goals())
            .unwrap_or_default();
        if let Some(request_goals) = input.goals {
            goals.extend(request_goals);
        }

        let insight = self
            .pipeline
            .compute_and_store(
                &MonthlyComputeInput {
                    user_id: owner,
                    month: input.month,
                    transactions,
                    balances: input.balances,
                    goals,
                    previous: input.previous,
                },
                &call.ctx,
            )
            .await?;

        Ok(json!({ "insight": insight }))
    }
}

//
// ================= insights.list =================
//

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
struct ListInsightsInput {
    #[serde(default)]
    limit: Option<usize>,
}

pub struct ListInsightsTool {
    store: Arc<dyn DataStore>,
}

#[async_trait]
impl Tool for ListInsightsTool {
    fn name(&self) -> &'static str {
        "insights.list"
    }

    fn description(&self) -> &'static str {
        "List stored monthly insights, newest first"
    }

    async fn resolve(&self, call: &ToolCall) -> Result<Value> {
        let input: ListInsightsInput = parse_input(&call.input)?;
        let mut insights = self
            .store
            .insights_for_user(&call.auth.insight_owner())
            .await?;
        if let Some(limit) = input.limit {
            insights.truncate(limit.max(1));
        }
        Ok(json!({ "insights": insights }))
    }
}

//
// ================= health.score =================
//

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
struct ScoreInput {
    #[serde(default)]
    month: Option<String>,
}

pub struct HealthScoreTool {
    store: Arc<dyn DataStore>,
}

#[async_trait]
impl Tool for HealthScoreTool {
    fn name(&self) -> &'static str {
        "health.score"
    }

    fn description(&self) -> &'static str {
        "Score financial health from a stored monthly insight"
    }

    async fn resolve(&self, call: &ToolCall) -> Result<Value> {
        let input: ScoreInput = parse_input(&call.input)?;
        let insight = load_insight(
            &self.store,
            &call.auth.insight_owner(),
            None,
            input.month.as_deref(),
        )
        .await?;
        let score = health::score(&insight.kpis);
        Ok(json!({ "month": insight.month, "score": score }))
    }
}

//
// ================= actions.suggest =================
//

pub struct SuggestActionsTool {
    store: Arc<dyn DataStore>,
}

#[async_trait]
impl Tool for SuggestActionsTool {
    fn name(&self) -> &'static str {
        "actions.suggest"
    }

    fn description(&self) -> &'static str {
        "Suggest next actions from a stored monthly insight"
    }

    async fn resolve(&self, call: &ToolCall) -> Result<Value> {
        let input: ScoreInput = parse_input(&call.input)?;
        let insight = load_insight(
            &self.store,
            &call.auth.insight_owner(),
            None,
            input.month.as_deref(),
        )
        .await?;
        let score = health::score(&insight.kpis);
        let suggestions = actions::suggest(&insight.kpis, &score);
        Ok(json!({ "month": insight.month, "actions": suggestions }))
    }
}

//
// ================= simulations.run =================
//

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
struct SimulationInput {
    #[serde(default)]
    insight_id: Option<String>,
    #[serde(default)]
    month: Option<String>,
    actions: Vec<String>,
}

pub struct RunSimulationTool {
    store: Arc<dyn DataStore>,
}

#[async_trait]
impl Tool for RunSimulationTool {
    fn name(&self) -> &'static str {
        "simulations.run"
    }

    fn description(&self) -> &'static str {
        "Project KPIs and health after applying selected actions"
    }

    async fn resolve(&self, call: &ToolCall) -> Result<Value> {
        let input: SimulationInput = parse_input(&call.input)?;
        let insight = load_insight(
            &self.store,
            &call.auth.insight_owner(),
            input.insight_id.as_deref(),
            input.month.as_deref(),
        )
        .await?;

        let result = simulator::simulate(&insight, &input.actions);
        Ok(json!({
            "insight": result.projected_insight,
            "score": result.projected_health,
            "adjustments": result.adjustments,
        }))
    }
}

//
// ================= Registration =================
//

pub fn register_finance_tools(
    registry: &mut ToolRegistry,
    store: Arc<dyn DataStore>,
    pipeline: Arc<InsightPipeline>,
) {
    registry.register(Arc::new(CreateTransactionTool {
        store: store.clone(),
    }));
    registry.register(Arc::new(ListTransactionsTool {
        store: store.clone(),
    }));
    registry.register(Arc::new(ComputeInsightTool { pipeline }));
    registry.register(Arc::new(ListInsightsTool {
        store: store.clone(),
    }));
    registry.register(Arc::new(HealthScoreTool {
        store: store.clone(),
    }));
    registry.register(Arc::new(SuggestActionsTool {
        store: store.clone(),
    }));
    registry.register(Arc::new(RunSimulationTool { store }));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::governor::RequestContext;
    use crate::insights::INTERNAL_EMBEDDER;
    use crate::kpi::INTERNAL_EMBEDDING_DIM;
    use crate::memory::InMemoryVectorStore;
    use crate::models::AuthenticatedUser;
    use crate::providers::testing::ScriptedGateway;
    use crate::store::InMemoryStore;
    use crate::tools::ToolStatus;
    use std::time::Duration;
    use uuid::Uuid;

    struct Fixture {
        registry: ToolRegistry,
        store: Arc<InMemoryStore>,
        auth: AuthenticatedUser,
    }

    fn fixture() -> Fixture {
        let store: Arc<InMemoryStore> = Arc::new(InMemoryStore::new());
        let data_store: Arc<dyn DataStore> = store.clone();
        let vector = Arc::new(InMemoryVectorStore::new(INTERNAL_EMBEDDING_DIM));
        let gateway = Arc::new(ScriptedGateway::new(vec![]));
        let pipeline = Arc::new(InsightPipeline::new(
            data_store.clone(),
            vector,
            gateway,
            INTERNAL_EMBEDDER.into(),
        ));

        let mut registry = ToolRegistry::new(data_store.clone());
        register_finance_tools(&mut registry, data_store, pipeline);

        Fixture {
            registry,
            store,
            auth: AuthenticatedUser {
                user_id: "user-1".into(),
                tenant_id: Uuid::new_v4(),
                customer_id: Uuid::new_v4(),
                roles: vec![],
            },
        }
    }

    fn call(fixture: &Fixture, input: Value) -> ToolCall {
        ToolCall {
            auth: fixture.auth.clone(),
            input,
            ctx: RequestContext::new(Duration::from_secs(5)),
        }
    }

    #[tokio::test]
    async fn test_create_transaction_idempotent_replay() {
        let fixture = fixture();
        let input = json!({
            "transaction": {
                "amount": 125000,
                "currency": "IDR",
                "type": "expense",
                "merchant": "warung",
                "occurredAt": "2024-05-11T08:00:00Z",
                "description": "lunch",
            },
            "idempotencyKey": "chat-123",
        });

        let first = fixture
            .registry
            .invoke("transactions.create", &call(&fixture, input.clone()))
            .await
            .unwrap();
        assert!(first.succeeded());
        assert!(!first.replayed);
        let first_id = first.output.as_ref().unwrap()["transaction"]["id"].clone();

        let second = fixture
            .registry
            .invoke("transactions.create", &call(&fixture, input))
            .await
            .unwrap();
        assert!(second.replayed);
        assert_eq!(
            second.output.as_ref().unwrap()["transaction"]["id"],
            first_id
        );
        assert_eq!(
            second.output.as_ref().unwrap()["idempotency"]["replayed"],
            true
        );
    }

    #[tokio::test]
    async fn test_create_transaction_derives_key_when_missing() {
        let fixture = fixture();
        let input = json!({
            "transaction": {
                "amount": "RM42.50",
                "type": "expense",
                "occurredAt": "2024-05-11",
                "notes": "nasi lemak",
            },
        });

        let first = fixture
            .registry
            .invoke("transactions.create", &call(&fixture, input.clone()))
            .await
            .unwrap();
        assert!(first.succeeded());
        let key = first.output.as_ref().unwrap()["idempotency"]["key"]
            .as_str()
            .unwrap()
            .to_string();
        assert_eq!(key.len(), DERIVED_KEY_LEN);

        // Same payload, no explicit key: collapses onto the derived slot.
        let second = fixture
            .registry
            .invoke("transactions.create", &call(&fixture, input))
            .await
            .unwrap();
        assert!(second.replayed);
    }

    #[tokio::test]
    async fn test_create_transaction_validation_issues() {
        let fixture = fixture();
        let input = json!({
            "transaction": { "currency": "RINGGIT", "type": "barter" },
        });

        let result = fixture
            .registry
            .invoke("transactions.create", &call(&fixture, input))
            .await
            .unwrap();
        assert_eq!(result.status, ToolStatus::Error);
        let error = result.error.unwrap();
        assert_eq!(error.code, "VALIDATION_ERROR");
        let issues = error.details.unwrap()["issues"].as_array().unwrap().len();
        assert!(issues >= 3);
    }

    #[tokio::test]
    async fn test_unknown_top_level_field_is_rejected() {
        let fixture = fixture();
        let input = json!({
            "transaction": { "amount": 10 },
            "idempotency_key_typo": "x",
        });
        let result = fixture
            .registry
            .invoke("transactions.create", &call(&fixture, input))
            .await
            .unwrap();
        assert_eq!(result.status, ToolStatus::Error);
        assert_eq!(result.error.unwrap().code, "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_insights_compute_then_score_and_actions() {
        let fixture = fixture();

        let compute = fixture
            .registry
            .invoke(
                "insights.compute",
                &call(
                    &fixture,
                    json!({
                        "month": "2024-05",
                        "transactions": [
                            { "amount": 15000000, "type": "income" },
                            { "amount": -850000, "type": "expense", "category": "groceries" },
                            { "amount": -500000, "type": "investment" },
                        ],
                    }),
                ),
            )
            .await
            .unwrap();
        assert!(compute.succeeded(), "{:?}", compute.error);
        let insight = &compute.output.as_ref().unwrap()["insight"];
        assert_eq!(insight["month"], "2024-05");

        let score = fixture
            .registry
            .invoke("health.score", &call(&fixture, json!({})))
            .await
            .unwrap();
        assert!(score.succeeded());
        let total = score.output.as_ref().unwrap()["score"]["total"]
            .as_f64()
            .unwrap();
        assert!((0.0..=1.0).contains(&total));

        let suggest = fixture
            .registry
            .invoke("actions.suggest", &call(&fixture, json!({ "month": "2024-05" })))
            .await
            .unwrap();
        assert!(suggest.succeeded());
        let actions = suggest.output.as_ref().unwrap()["actions"]
            .as_array()
            .unwrap();
        assert!(!actions.is_empty());
    }

    #[tokio::test]
    async fn test_score_without_insight_is_not_found() {
        let fixture = fixture();
        let result = fixture
            .registry
            .invoke("health.score", &call(&fixture, json!({})))
            .await
            .unwrap();
        assert_eq!(result.status, ToolStatus::Error);
        assert_eq!(result.error.unwrap().code, "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_simulation_runs_from_stored_insight() {
        let fixture = fixture();
        fixture
            .registry
            .invoke(
                "insights.compute",
                &call(
                    &fixture,
                    json!({
                        "month": "2024-05",
                        "transactions": [
                            { "amount": 10000000, "type": "income" },
                            { "amount": -9000000, "type": "expense", "category": "rent" },
                        ],
                    }),
                ),
            )
            .await
            .unwrap();

        let result = fixture
            .registry
            .invoke(
                "simulations.run",
                &call(&fixture, json!({ "actions": ["improve-savings"] })),
            )
            .await
            .unwrap();
        assert!(result.succeeded());
        let output = result.output.unwrap();
        let savings = output["insight"]["kpis"]["savingsRate"]["value"]
            .as_f64()
            .unwrap();
        assert!((savings - 0.13).abs() < 1e-9);
        assert!(output["adjustments"]["improve-savings"].as_f64().unwrap() > 0.0);
    }

    #[tokio::test]
    async fn test_simulation_rejects_foreign_insight_id() {
        let fixture = fixture();
        // An insight stored under a different owner.
        fixture
            .store
            .upsert_insight(&MonthlyInsight {
                id: "someone-else:2024-05".into(),
                user_id: "someone-else".into(),
                month: "2024-05".into(),
                kpis: Default::default(),
                story: String::new(),
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        let result = fixture
            .registry
            .invoke(
                "simulations.run",
                &call(
                    &fixture,
                    json!({ "insightId": "someone-else:2024-05", "actions": [] }),
                ),
            )
            .await
            .unwrap();
        assert_eq!(result.status, ToolStatus::Error);
        assert_eq!(result.error.unwrap().code, "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_transactions_list_by_month() {
        let fixture = fixture();
        fixture
            .registry
            .invoke(
                "transactions.create",
                &call(
                    &fixture,
                    json!({
                        "transaction": {
                            "amount": 50,
                            "type": "expense",
                            "occurredAt": "2024-05-02",
                            "description": "kopi",
                        },
                    }),
                ),
            )
            .await
            .unwrap();

        let listed = fixture
            .registry
            .invoke(
                "transactions.list",
                &call(&fixture, json!({ "month": "2024-05" })),
            )
            .await
            .unwrap();
        assert!(listed.succeeded());
        assert_eq!(listed.output.as_ref().unwrap()["count"], 1);

        let other_month = fixture
            .registry
            .invoke(
                "transactions.list",
                &call(&fixture, json!({ "month": "2024-06" })),
            )
            .await
            .unwrap();
        assert_eq!(other_month.output.as_ref().unwrap()["count"], 0);
    }
}
