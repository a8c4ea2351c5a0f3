//! Core data models for the orchestration engine

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

//
// ================= Tenancy =================
//

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub id: Uuid,
    pub slug: String,
    #[serde(default)]
    pub metadata: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Customer {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub external_reference: String,
    #[serde(default)]
    pub metadata: Value,
}

impl Customer {
    /// Privacy opt-in for cohort benchmarking and the leaderboard.
    pub fn allows_benchmarking(&self) -> bool {
        self.metadata
            .pointer("/preferences/allowBenchmarking")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn region(&self) -> String {
        self.metadata
            .pointer("/profile/region")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string()
    }

    pub fn income_band(&self) -> String {
        self.metadata
            .pointer("/profile/incomeBand")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string()
    }

    /// Per-KPI goal overrides stored under `preferences.goals`.
    pub fn kpi_goals(&self) -> BTreeMap<String, f64> {
        self.metadata
            .pointer("/preferences/goals")
            .and_then(Value::as_object)
            .map(|map| {
                map.iter()
                    .filter_map(|(k, v)| v.as_f64().map(|g| (k.clone(), g)))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Identity resolved from a verified bearer token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthenticatedUser {
    /// Token subject (the tenant-scoped external reference).
    pub user_id: String,
    pub tenant_id: Uuid,
    pub customer_id: Uuid,
    pub roles: Vec<String>,
}

impl AuthenticatedUser {
    /// Key under which insights, embeddings, and aliases are stored.
    pub fn insight_owner(&self) -> String {
        self.customer_id.to_string()
    }
}

//
// ================= Transactions =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransactionKind {
    Income,
    Expense,
    Investment,
    Debt,
    Transfer,
}

impl TransactionKind {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "income" => Some(Self::Income),
            "expense" => Some(Self::Expense),
            "investment" => Some(Self::Investment),
            "debt" => Some(Self::Debt),
            "transfer" => Some(Self::Transfer),
            _ => None,
        }
    }
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Income => "income",
            Self::Expense => "expense",
            Self::Investment => "investment",
            Self::Debt => "debt",
            Self::Transfer => "transfer",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub customer_id: Uuid,
    /// Signed fixed-point amount; arithmetic stays decimal through the KPI
    /// aggregation boundary.
    pub amount: Decimal,
    /// ISO 4217 code.
    pub currency: String,
    pub kind: TransactionKind,
    pub category: Option<String>,
    pub description: Option<String>,
    pub occurred_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Value,
    /// Deduplication handle, unique per tenant.
    pub idempotency_handle: String,
}

/// Insert payload for a transaction row.
#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub tenant_id: Uuid,
    pub customer_id: Uuid,
    pub amount: Decimal,
    pub currency: String,
    pub kind: TransactionKind,
    pub category: Option<String>,
    pub description: Option<String>,
    pub occurred_at: DateTime<Utc>,
    pub metadata: Value,
    pub idempotency_handle: String,
}

//
// ================= Idempotency =================
//

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub key: String,
    pub request_hash: String,
    pub response_payload: Option<Value>,
    pub locked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

//
// ================= KPIs & Insights =================
//

pub mod kpi_keys {
    pub const INCOME: &str = "income";
    pub const EXPENSES: &str = "expenses";
    pub const INVESTMENTS: &str = "investments";
    pub const DEBT_PAYMENTS: &str = "debtPayments";
    pub const CASH_FLOW: &str = "cashFlow";
    pub const SAVINGS_RATE: &str = "savingsRate";
    pub const INVESTMENT_RATE: &str = "investmentRate";
    pub const DEBT_TO_INCOME: &str = "debtToIncome";
    pub const EXPENSE_RATIO: &str = "expenseRatio";
    pub const DEBT_OUTSTANDING: &str = "debtOutstanding";
    pub const NET_WORTH: &str = "netWorth";
    pub const TOP_EXPENSE_CATEGORY: &str = "topExpenseCategory";
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum KpiUnit {
    Currency,
    Ratio,
    Percentage,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Kpi {
    pub key: String,
    pub label: String,
    pub value: f64,
    pub unit: KpiUnit,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delta: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub goal: Option<f64>,
}

impl Kpi {
    pub fn new(key: &str, label: &str, value: f64, unit: KpiUnit) -> Self {
        Self {
            key: key.to_string(),
            label: label.to_string(),
            value,
            unit,
            delta: None,
            goal: None,
        }
    }

    pub fn with_goal(mut self, goal: Option<f64>) -> Self {
        self.goal = goal;
        self
    }
}

pub type KpiSet = BTreeMap<String, Kpi>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonthlyInsight {
    /// `{owner}:{month}`
    pub id: String,
    pub user_id: String,
    /// `YYYY-MM`
    pub month: String,
    pub kpis: KpiSet,
    pub story: String,
    pub created_at: DateTime<Utc>,
}

impl MonthlyInsight {
    pub fn insight_id(user_id: &str, month: &str) -> String {
        format!("{}:{}", user_id, month)
    }

    pub fn kpi_value(&self, key: &str) -> f64 {
        self.kpis.get(key).map(|k| k.value).unwrap_or(0.0)
    }
}

//
// ================= Health =================
//

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthComponent {
    pub key: String,
    pub label: String,
    pub score: f64,
    pub weight: f64,
    pub rationale: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthScore {
    /// Weighted total in `[0, 1]`.
    pub total: f64,
    pub components: Vec<HealthComponent>,
    pub notes: Vec<String>,
}

//
// ================= Suggested Actions =================
//

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuggestedAction {
    /// Stable identifier consumed by the simulator.
    pub id: String,
    pub title: String,
    pub description: String,
    pub category: String,
    pub rationale: String,
    pub expected_impact: String,
}

//
// ================= Vector Memory =================
//

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    /// Equals the insight id.
    pub id: String,
    pub user_id: String,
    /// L2-normalised, fixed dimension per store.
    pub vector: Vec<f32>,
    pub metadata: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalDocument {
    pub id: String,
    pub user_id: String,
    pub content: String,
    pub metadata: Value,
}

//
// ================= Conversation =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
            timestamp: None,
            metadata: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
            timestamp: None,
            metadata: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
            timestamp: None,
            metadata: None,
        }
    }
}

/// Most recent user turn in a conversation.
pub fn latest_user_message(conversation: &[ChatMessage]) -> Option<&ChatMessage> {
    conversation
        .iter()
        .rev()
        .find(|m| m.role == MessageRole::User)
}

//
// ================= Intent & Plan =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    RecordTransaction,
    BudgetSummary,
    GeneralQuestion,
    Unknown,
}

impl Intent {
    pub fn parse(raw: &str) -> Self {
        match raw.trim() {
            "record_transaction" => Self::RecordTransaction,
            "budget_summary" => Self::BudgetSummary,
            "general_question" => Self::GeneralQuestion,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::RecordTransaction => "record_transaction",
            Self::BudgetSummary => "budget_summary",
            Self::GeneralQuestion => "general_question",
            Self::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StepKind {
    Retrieval,
    Llm,
    Tool,
    Synthesis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    pub id: String,
    pub kind: StepKind,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub intent: Intent,
    pub steps: Vec<PlanStep>,
}
