//! Monthly KPI computation
//!
//! `compute_monthly` is a pure function: the same input always yields the
//! same KPI set, story, and fallback embedding. Amount arithmetic stays in
//! decimal up to the aggregate boundary; ratios are floats from there on.

use crate::error::{OrchestratorError, Result};
use crate::models::{kpi_keys, Kpi, KpiSet, KpiUnit, MonthlyInsight, Transaction, TransactionKind};
use chrono::Utc;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Story length post-conditions, in characters.
const STORY_MIN_CHARS: usize = 200;
const STORY_MAX_CHARS: usize = 400;

/// Home-market fallback when a transaction set carries no currency.
pub const DEFAULT_CURRENCY: &str = "MYR";

/// Dimension of the internal fallback embedding.
pub const INTERNAL_EMBEDDING_DIM: usize = 7;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Balances {
    #[serde(default)]
    pub cash: Decimal,
    #[serde(default)]
    pub investments: Decimal,
    #[serde(default)]
    pub debt: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviousSnapshot {
    #[serde(default)]
    pub net_worth: f64,
}

/// Minimal transaction view the engine aggregates over.
#[derive(Debug, Clone)]
pub struct KpiTransaction {
    pub amount: Decimal,
    pub kind: TransactionKind,
    pub category: Option<String>,
    pub currency: Option<String>,
}

impl From<&Transaction> for KpiTransaction {
    fn from(tx: &Transaction) -> Self {
        Self {
            amount: tx.amount,
            kind: tx.kind,
            category: tx.category.clone(),
            currency: Some(tx.currency.clone()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MonthlyComputeInput {
    pub user_id: String,
    /// `YYYY-MM`
    pub month: String,
    pub transactions: Vec<KpiTransaction>,
    pub balances: Option<Balances>,
    /// Declared per-KPI goals; keys are canonical KPI keys.
    pub goals: BTreeMap<String, f64>,
    pub previous: Option<PreviousSnapshot>,
}

/// Aggregate facts the KPI set, story, and embedding are derived from.
#[derive(Debug, Clone)]
pub struct KpiFacts {
    pub month: String,
    pub currency: String,
    pub income: f64,
    pub expenses: f64,
    pub investments: f64,
    pub debt_payments: f64,
    pub cash_flow: f64,
    pub savings_rate: f64,
    pub investment_rate: f64,
    pub expense_ratio: f64,
    pub debt_outstanding: f64,
    pub debt_to_income: f64,
    pub net_worth: f64,
    pub top_category_label: String,
    pub top_category_share: f64,
}

pub fn clamp(x: f64, lo: f64, hi: f64) -> f64 {
    x.max(lo).min(hi)
}

/// Validate a `YYYY-MM` month string.
pub fn validate_month(month: &str) -> Result<()> {
    let bytes = month.as_bytes();
    let well_formed = bytes.len() == 7
        && bytes[..4].iter().all(u8::is_ascii_digit)
        && bytes[4] == b'-'
        && bytes[5..].iter().all(u8::is_ascii_digit);
    let in_range = well_formed
        && month[5..]
            .parse::<u8>()
            .map(|m| (1..=12).contains(&m))
            .unwrap_or(false);
    if in_range {
        Ok(())
    } else {
        Err(OrchestratorError::validation(
            "month must be YYYY-MM",
            vec![format!("invalid month: {month}")],
        ))
    }
}

fn dominant_currency(transactions: &[KpiTransaction]) -> String {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for tx in transactions {
        if let Some(currency) = tx.currency.as_deref() {
            *counts.entry(currency).or_default() += 1;
        }
    }
    counts
        .into_iter()
        .max_by_key(|(_, count)| *count)
        .map(|(currency, _)| currency.to_string())
        .unwrap_or_else(|| DEFAULT_CURRENCY.to_string())
}

/// Derive the aggregate facts for a month. Sums run in decimal; each sum
/// uses the absolute amount so signed inputs aggregate consistently.
pub fn aggregate(input: &MonthlyComputeInput) -> KpiFacts {
    let mut income = Decimal::ZERO;
    let mut expenses = Decimal::ZERO;
    let mut investments = Decimal::ZERO;
    let mut debt_payments = Decimal::ZERO;
    let mut by_category: BTreeMap<String, Decimal> = BTreeMap::new();

    for tx in &input.transactions {
        let amount = tx.amount.abs();
        match tx.kind {
            TransactionKind::Income => income += amount,
            TransactionKind::Expense => {
                expenses += amount;
                if let Some(category) = tx.category.as_deref() {
                    let category = category.trim().to_lowercase();
                    if !category.is_empty() {
                        *by_category.entry(category).or_insert(Decimal::ZERO) += amount;
                    }
                }
            }
            TransactionKind::Investment => investments += amount,
            TransactionKind::Debt => debt_payments += amount,
            TransactionKind::Transfer => {}
        }
    }

    let cash_flow = income - expenses - investments - debt_payments;

    let income_f = income.to_f64().unwrap_or(0.0);
    let expenses_f = expenses.to_f64().unwrap_or(0.0);
    let investments_f = investments.to_f64().unwrap_or(0.0);
    let debt_payments_f = debt_payments.to_f64().unwrap_or(0.0);
    let cash_flow_f = cash_flow.to_f64().unwrap_or(0.0);

    let balances = input.balances.clone().unwrap_or_default();
    let debt_outstanding = balances.debt.to_f64().unwrap_or(0.0);
    let net_worth = balances.cash.to_f64().unwrap_or(0.0)
        + balances.investments.to_f64().unwrap_or(0.0)
        - debt_outstanding;

    let (savings_rate, investment_rate, expense_ratio, debt_to_income) = if income_f > 0.0 {
        (
            clamp((income_f - expenses_f) / income_f, 0.0, 1.5),
            clamp(investments_f / income_f, 0.0, 1.5),
            clamp(expenses_f / income_f, 0.0, 2.0),
            clamp(debt_outstanding / income_f, 0.0, 2.0),
        )
    } else {
        (0.0, 0.0, 0.0, 0.0)
    };

    // Highest expense share; ties resolve to the alphabetically first
    // category because iteration order is sorted.
    let (top_category_label, top_category_share) = if expenses > Decimal::ZERO
        && !by_category.is_empty()
    {
        let mut best = ("general expenses".to_string(), 0.0);
        for (category, total) in &by_category {
            let share = (total / expenses).to_f64().unwrap_or(0.0);
            if share > best.1 {
                best = (category.clone(), share);
            }
        }
        best
    } else {
        ("general expenses".to_string(), 0.0)
    };

    KpiFacts {
        month: input.month.clone(),
        currency: dominant_currency(&input.transactions),
        income: income_f,
        expenses: expenses_f,
        investments: investments_f,
        debt_payments: debt_payments_f,
        cash_flow: cash_flow_f,
        savings_rate,
        investment_rate,
        expense_ratio,
        debt_outstanding,
        debt_to_income,
        net_worth,
        top_category_label,
        top_category_share,
    }
}

fn currency_kpi(key: &str, label: &str, value: f64) -> Kpi {
    Kpi::new(key, label, value, KpiUnit::Currency)
}

fn ratio_kpi(key: &str, label: &str, value: f64) -> Kpi {
    Kpi::new(key, label, value, KpiUnit::Ratio)
}

/// Build the canonical KPI set from facts. Declared goals attach to their
/// KPI; undeclared goals stay unset and downstream rules use their own
/// defaults.
pub fn kpis_from_facts(facts: &KpiFacts, goals: &BTreeMap<String, f64>) -> KpiSet {
    let mut net_worth = currency_kpi(kpi_keys::NET_WORTH, "Net worth", facts.net_worth);
    // Delta is only reported for net worth, against the previous snapshot.
    net_worth.delta = None;

    let top_category = Kpi::new(
        kpi_keys::TOP_EXPENSE_CATEGORY,
        &facts.top_category_label,
        facts.top_category_share,
        KpiUnit::Percentage,
    );

    let mut kpis: KpiSet = BTreeMap::new();
    for kpi in [
        currency_kpi(kpi_keys::INCOME, "Income", facts.income),
        currency_kpi(kpi_keys::EXPENSES, "Expenses", facts.expenses),
        currency_kpi(kpi_keys::INVESTMENTS, "Investments", facts.investments),
        currency_kpi(kpi_keys::DEBT_PAYMENTS, "Debt payments", facts.debt_payments),
        currency_kpi(kpi_keys::CASH_FLOW, "Cash flow", facts.cash_flow),
        ratio_kpi(kpi_keys::SAVINGS_RATE, "Savings rate", facts.savings_rate),
        ratio_kpi(
            kpi_keys::INVESTMENT_RATE,
            "Investment rate",
            facts.investment_rate,
        ),
        ratio_kpi(kpi_keys::EXPENSE_RATIO, "Expense ratio", facts.expense_ratio),
        ratio_kpi(
            kpi_keys::DEBT_TO_INCOME,
            "Debt-to-income",
            facts.debt_to_income,
        ),
        currency_kpi(
            kpi_keys::DEBT_OUTSTANDING,
            "Outstanding debt",
            facts.debt_outstanding,
        ),
        net_worth,
        top_category,
    ] {
        let goal = goals.get(&kpi.key).copied();
        kpis.insert(kpi.key.clone(), kpi.with_goal(goal));
    }
    kpis
}

/// Reconstruct facts from a stored KPI set; the simulator edits facts and
/// re-derives the set from them.
pub fn facts_from_kpis(kpis: &KpiSet, month: &str, currency: &str) -> KpiFacts {
    let value = |key: &str| kpis.get(key).map(|k| k.value).unwrap_or(0.0);
    let top = kpis.get(kpi_keys::TOP_EXPENSE_CATEGORY);

    KpiFacts {
        month: month.to_string(),
        currency: currency.to_string(),
        income: value(kpi_keys::INCOME),
        expenses: value(kpi_keys::EXPENSES),
        investments: value(kpi_keys::INVESTMENTS),
        debt_payments: value(kpi_keys::DEBT_PAYMENTS),
        cash_flow: value(kpi_keys::CASH_FLOW),
        savings_rate: value(kpi_keys::SAVINGS_RATE),
        investment_rate: value(kpi_keys::INVESTMENT_RATE),
        expense_ratio: value(kpi_keys::EXPENSE_RATIO),
        debt_outstanding: value(kpi_keys::DEBT_OUTSTANDING),
        debt_to_income: value(kpi_keys::DEBT_TO_INCOME),
        net_worth: value(kpi_keys::NET_WORTH),
        top_category_label: top
            .map(|k| k.label.clone())
            .unwrap_or_else(|| "general expenses".to_string()),
        top_category_share: top.map(|k| k.value).unwrap_or(0.0),
    }
}

//
// ================= Formatting & Story =================
//

/// `MYR 15,000,000` style: whole units with thousands separators.
pub fn format_amount(currency: &str, value: f64) -> String {
    let rounded = value.round() as i64;
    let negative = rounded < 0;
    let digits = rounded.unsigned_abs().to_string();

    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }

    if negative {
        format!("{} -{}", currency, grouped)
    } else {
        format!("{} {}", currency, grouped)
    }
}

fn format_percent(ratio: f64) -> String {
    format!("{}%", (ratio * 100.0).round() as i64)
}

/// Deterministic three-sentence narrative with enforced length bounds:
/// shorter stories are `.`-padded to 200 chars, longer ones are
/// ellipsis-truncated at 400.
pub fn build_story(facts: &KpiFacts) -> String {
    enforce_story_bounds(render_story(facts))
}

/// The raw narrative before length enforcement. Exposed so projections can
/// append a suffix first.
pub fn render_story(facts: &KpiFacts) -> String {
    format!(
        "In {month}, {income} came in against {expenses} of spending, with {investments} \
         put into investments and {debt} toward debt, leaving a net cash flow of {cash_flow}. \
         The savings rate landed at {savings} while {investing} of income went to investments. \
         The largest expense share was {category} at {share} of total spending.",
        month = facts.month,
        income = format_amount(&facts.currency, facts.income),
        expenses = format_amount(&facts.currency, facts.expenses),
        investments = format_amount(&facts.currency, facts.investments),
        debt = format_amount(&facts.currency, facts.debt_payments),
        cash_flow = format_amount(&facts.currency, facts.cash_flow),
        savings = format_percent(facts.savings_rate),
        investing = format_percent(facts.investment_rate),
        category = facts.top_category_label,
        share = format_percent(facts.top_category_share),
    )
}

pub fn enforce_story_bounds(mut story: String) -> String {
    let len = story.chars().count();
    if len < STORY_MIN_CHARS {
        story.extend(std::iter::repeat('.').take(STORY_MIN_CHARS - len));
    } else if len > STORY_MAX_CHARS {
        story = story.chars().take(STORY_MAX_CHARS - 1).collect();
        story.push('…');
    }
    story
}

//
// ================= Fallback Embedding =================
//

/// 7-dimensional feature vector used when no external embedder is
/// configured: scaled money flows then bounded rates, L2-normalised.
pub fn fallback_embedding(facts: &KpiFacts) -> Vec<f32> {
    let scale = facts
        .income
        .max(facts.expenses)
        .max(facts.cash_flow.abs())
        .max(1.0);

    let vector = vec![
        clamp(facts.income / scale, -1.0, 1.0) as f32,
        clamp(facts.expenses / scale, -1.0, 1.0) as f32,
        clamp(facts.cash_flow / scale, -1.0, 1.0) as f32,
        clamp(facts.savings_rate, 0.0, 1.0) as f32,
        clamp(facts.investment_rate, 0.0, 1.0) as f32,
        clamp(facts.debt_to_income, 0.0, 1.0) as f32,
        clamp(facts.expense_ratio, 0.0, 1.0) as f32,
    ];
    l2_normalize(vector)
}

/// Normalise to unit length; the zero vector stays zero.
pub fn l2_normalize(vector: Vec<f32>) -> Vec<f32> {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        vector.into_iter().map(|x| x / norm).collect()
    } else {
        vector
    }
}

//
// ================= Entry Point =================
//

/// Compute the monthly insight. Referentially transparent apart from
/// `created_at`.
pub fn compute_monthly(input: &MonthlyComputeInput) -> MonthlyInsight {
    let facts = aggregate(input);
    let kpis = {
        let mut kpis = kpis_from_facts(&facts, &input.goals);
        if let (Some(previous), Some(net_worth)) =
            (&input.previous, kpis.get_mut(kpi_keys::NET_WORTH))
        {
            net_worth.delta = Some(net_worth.value - previous.net_worth);
        }
        kpis
    };
    let story = build_story(&facts);

    MonthlyInsight {
        id: MonthlyInsight::insight_id(&input.user_id, &input.month),
        user_id: input.user_id.clone(),
        month: input.month.clone(),
        kpis,
        story,
        created_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn tx(amount: Decimal, kind: TransactionKind, category: Option<&str>) -> KpiTransaction {
        KpiTransaction {
            amount,
            kind,
            category: category.map(String::from),
            currency: None,
        }
    }

    fn sample_input() -> MonthlyComputeInput {
        MonthlyComputeInput {
            user_id: "u-1".into(),
            month: "2024-05".into(),
            transactions: vec![
                tx(dec!(15000000), TransactionKind::Income, None),
                tx(dec!(-850000), TransactionKind::Expense, Some("groceries")),
                tx(dec!(-500000), TransactionKind::Investment, None),
            ],
            balances: None,
            goals: BTreeMap::new(),
            previous: None,
        }
    }

    #[test]
    fn test_monthly_aggregation_literals() {
        let insight = compute_monthly(&sample_input());

        assert_eq!(insight.kpi_value(kpi_keys::INCOME), 15_000_000.0);
        assert_eq!(insight.kpi_value(kpi_keys::EXPENSES), 850_000.0);
        assert_eq!(insight.kpi_value(kpi_keys::INVESTMENTS), 500_000.0);
        assert_eq!(insight.kpi_value(kpi_keys::CASH_FLOW), 13_650_000.0);
        assert!((insight.kpi_value(kpi_keys::SAVINGS_RATE) - 0.943).abs() < 1e-2);
        assert!((insight.kpi_value(kpi_keys::INVESTMENT_RATE) - 0.033).abs() < 1e-2);

        let top = insight.kpis.get(kpi_keys::TOP_EXPENSE_CATEGORY).unwrap();
        assert_eq!(top.label, "groceries");
        assert_eq!(top.value, 1.0);
    }

    #[test]
    fn test_cash_flow_identity() {
        let insight = compute_monthly(&sample_input());
        let computed = insight.kpi_value(kpi_keys::INCOME)
            - insight.kpi_value(kpi_keys::EXPENSES)
            - insight.kpi_value(kpi_keys::INVESTMENTS)
            - insight.kpi_value(kpi_keys::DEBT_PAYMENTS);
        assert!((insight.kpi_value(kpi_keys::CASH_FLOW) - computed).abs() < 1e-9);
    }

    #[test]
    fn test_zero_income_rates() {
        let input = MonthlyComputeInput {
            transactions: vec![tx(dec!(-100), TransactionKind::Expense, Some("food"))],
            ..sample_input()
        };
        let insight = compute_monthly(&input);
        assert_eq!(insight.kpi_value(kpi_keys::SAVINGS_RATE), 0.0);
        assert_eq!(insight.kpi_value(kpi_keys::INVESTMENT_RATE), 0.0);
        assert_eq!(insight.kpi_value(kpi_keys::EXPENSE_RATIO), 0.0);
        assert_eq!(insight.kpi_value(kpi_keys::DEBT_TO_INCOME), 0.0);
    }

    #[test]
    fn test_story_length_bounds() {
        let short = compute_monthly(&sample_input());
        let len = short.story.chars().count();
        assert!((200..=400).contains(&len), "story length {len}");

        // An extreme category name forces the truncation path.
        let long_category = "x".repeat(500);
        let input = MonthlyComputeInput {
            transactions: vec![
                tx(dec!(1000), TransactionKind::Income, None),
                tx(dec!(-900), TransactionKind::Expense, Some(long_category.as_str())),
            ],
            ..sample_input()
        };
        let long = compute_monthly(&input);
        assert_eq!(long.story.chars().count(), 400);
        assert!(long.story.ends_with('…'));
    }

    #[test]
    fn test_fallback_embedding_is_normalised() {
        let facts = aggregate(&sample_input());
        let vector = fallback_embedding(&facts);
        assert_eq!(vector.len(), INTERNAL_EMBEDDING_DIM);
        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-6);

        let zero = fallback_embedding(&facts_from_kpis(&BTreeMap::new(), "2024-05", "MYR"));
        assert_eq!(zero.len(), INTERNAL_EMBEDDING_DIM);
    }

    #[test]
    fn test_compute_is_deterministic() {
        let input = sample_input();
        let a = compute_monthly(&input);
        let b = compute_monthly(&input);
        assert_eq!(
            serde_json::to_string(&a.kpis).unwrap(),
            serde_json::to_string(&b.kpis).unwrap()
        );
        assert_eq!(a.story, b.story);
    }

    #[test]
    fn test_net_worth_delta_and_balances() {
        let input = MonthlyComputeInput {
            balances: Some(Balances {
                cash: dec!(10000),
                investments: dec!(5000),
                debt: dec!(2000),
            }),
            previous: Some(PreviousSnapshot { net_worth: 10_000.0 }),
            ..sample_input()
        };
        let insight = compute_monthly(&input);
        let net_worth = insight.kpis.get(kpi_keys::NET_WORTH).unwrap();
        assert_eq!(net_worth.value, 13_000.0);
        assert_eq!(net_worth.delta, Some(3_000.0));
        assert_eq!(insight.kpi_value(kpi_keys::DEBT_OUTSTANDING), 2_000.0);
    }

    #[test]
    fn test_month_validation() {
        assert!(validate_month("2024-05").is_ok());
        assert!(validate_month("2024-13").is_err());
        assert!(validate_month("2024-5").is_err());
        assert!(validate_month("may-2024").is_err());
    }

    #[test]
    fn test_format_amount_grouping() {
        assert_eq!(format_amount("MYR", 15000000.0), "MYR 15,000,000");
        assert_eq!(format_amount("IDR", 125000.49), "IDR 125,000");
        assert_eq!(format_amount("MYR", -1234.0), "MYR -1,234");
        assert_eq!(format_amount("MYR", 0.0), "MYR 0");
    }
}
