//! Suggested-action rules
//!
//! Rules fire in a fixed order and each stable id appears at most once.
//! The ids are part of the public contract: the simulator keys its deltas
//! off them.

use crate::models::{kpi_keys, HealthScore, Kpi, KpiSet, SuggestedAction};

pub const ACTION_IMPROVE_SAVINGS: &str = "improve-savings";
pub const ACTION_OPTIMIZE_EXPENSES: &str = "optimize-expenses";
pub const ACTION_ACCELERATE_DEBT: &str = "accelerate-debt";
pub const ACTION_BOOST_INVESTMENTS: &str = "boost-investments";
pub const ACTION_GROW_INCOME: &str = "grow-income";
pub const ACTION_STAY_THE_COURSE: &str = "stay-the-course";

pub const DEFAULT_SAVINGS_RATE_GOAL: f64 = 0.2;
pub const DEFAULT_EXPENSE_RATIO_GOAL: f64 = 0.5;
pub const DEFAULT_DEBT_TO_INCOME_GOAL: f64 = 0.35;
pub const DEFAULT_INVESTMENT_RATE_GOAL: f64 = 0.15;

fn kpi<'a>(kpis: &'a KpiSet, key: &str) -> Option<&'a Kpi> {
    kpis.get(key)
}

fn value(kpis: &KpiSet, key: &str) -> f64 {
    kpi(kpis, key).map(|k| k.value).unwrap_or(0.0)
}

fn goal_or(kpis: &KpiSet, key: &str, fallback: f64) -> f64 {
    kpi(kpis, key).and_then(|k| k.goal).unwrap_or(fallback)
}

fn points(ratio: f64) -> f64 {
    ratio * 100.0
}

/// Category multiplier applied to both the monetary impact and the score
/// delta of an action.
pub fn category_multiplier(category: &str) -> f64 {
    match category {
        "income" => 0.25,
        "expense" => 0.30,
        "debt" => 0.22,
        "investment" => 0.18,
        "savings" => 0.20,
        _ => 0.20,
    }
}

/// Monetary impact and projected score delta for an action category.
/// `impact = max(|cashFlow|, income * 0.05, 100) * k`,
/// `score_delta = min(0.15, (1 - total) * k)`.
pub fn derive_impact(category: &str, kpis: &KpiSet, health: &HealthScore) -> (f64, f64) {
    let k = category_multiplier(category);
    let cash_flow = value(kpis, kpi_keys::CASH_FLOW);
    let income = value(kpis, kpi_keys::INCOME);

    let impact = cash_flow.abs().max(income * 0.05).max(100.0) * k;
    let score_delta = ((1.0 - health.total) * k).min(0.15);
    (impact, score_delta)
}

pub fn suggest(kpis: &KpiSet, health: &HealthScore) -> Vec<SuggestedAction> {
    let mut actions = Vec::new();

    let savings_rate = value(kpis, kpi_keys::SAVINGS_RATE);
    let savings_goal = goal_or(kpis, kpi_keys::SAVINGS_RATE, DEFAULT_SAVINGS_RATE_GOAL);
    if savings_rate < savings_goal {
        actions.push(SuggestedAction {
            id: ACTION_IMPROVE_SAVINGS.to_string(),
            title: "Improve your savings rate".to_string(),
            description: "Set aside a fixed slice of income before spending starts.".to_string(),
            category: "savings".to_string(),
            rationale: format!(
                "Savings rate of {:.1}% sits {:.1} points below the {:.1}% target",
                points(savings_rate),
                points(savings_goal - savings_rate),
                points(savings_goal),
            ),
            expected_impact: "Moves spending into savings and lifts monthly cash flow"
                .to_string(),
        });
    }

    let expense_ratio = value(kpis, kpi_keys::EXPENSE_RATIO);
    let expense_goal = goal_or(kpis, kpi_keys::EXPENSE_RATIO, DEFAULT_EXPENSE_RATIO_GOAL);
    if expense_ratio > expense_goal {
        actions.push(SuggestedAction {
            id: ACTION_OPTIMIZE_EXPENSES.to_string(),
            title: "Trim recurring expenses".to_string(),
            description: "Review the biggest expense categories for cuts of around 5%."
                .to_string(),
            category: "expense".to_string(),
            rationale: format!(
                "Spending takes {:.1}% of income, {:.1} points over the {:.1}% ceiling",
                points(expense_ratio),
                points(expense_ratio - expense_goal),
                points(expense_goal),
            ),
            expected_impact: "A 5% expense cut flows straight into cash flow".to_string(),
        });
    }

    let debt_ratio = value(kpis, kpi_keys::DEBT_TO_INCOME);
    let debt_goal = goal_or(kpis, kpi_keys::DEBT_TO_INCOME, DEFAULT_DEBT_TO_INCOME_GOAL);
    if debt_ratio > debt_goal {
        actions.push(SuggestedAction {
            id: ACTION_ACCELERATE_DEBT.to_string(),
            title: "Accelerate debt repayment".to_string(),
            description: "Direct spare cash flow at the most expensive outstanding debt."
                .to_string(),
            category: "debt".to_string(),
            rationale: format!(
                "Debt-to-income of {:.2} exceeds the {:.2} threshold by {:.2}",
                debt_ratio,
                debt_goal,
                debt_ratio - debt_goal,
            ),
            expected_impact: "Shrinks outstanding debt about 5% per month".to_string(),
        });
    }

    let investment_rate = value(kpis, kpi_keys::INVESTMENT_RATE);
    let investment_goal = goal_or(
        kpis,
        kpi_keys::INVESTMENT_RATE,
        DEFAULT_INVESTMENT_RATE_GOAL,
    );
    if investment_rate < investment_goal {
        actions.push(SuggestedAction {
            id: ACTION_BOOST_INVESTMENTS.to_string(),
            title: "Boost monthly investing".to_string(),
            description: "Automate an extra transfer of about 2% of income into investments."
                .to_string(),
            category: "investment".to_string(),
            rationale: format!(
                "Investment rate of {:.1}% trails the {:.1}% target by {:.1} points",
                points(investment_rate),
                points(investment_goal),
                points(investment_goal - investment_rate),
            ),
            expected_impact: "Compounds net worth while cash flow stays positive".to_string(),
        });
    }

    let income = value(kpis, kpi_keys::INCOME);
    let cash_flow_score = health
        .components
        .iter()
        .find(|c| c.key == kpi_keys::CASH_FLOW)
        .map(|c| c.score)
        .unwrap_or(0.5);
    if income > 0.0 && cash_flow_score < 0.5 {
        actions.push(SuggestedAction {
            id: ACTION_GROW_INCOME.to_string(),
            title: "Grow your income".to_string(),
            description: "Cash flow is negative; a side income or raise closes the gap fastest."
                .to_string(),
            category: "income".to_string(),
            rationale: format!(
                "Cash flow score of {:.3} is below the 0.5 break-even mark",
                cash_flow_score,
            ),
            expected_impact: "A 3% income lift raises every downstream rate".to_string(),
        });
    }

    if actions.is_empty() {
        actions.push(SuggestedAction {
            id: ACTION_STAY_THE_COURSE.to_string(),
            title: "Stay the course".to_string(),
            description: "Every tracked indicator is on target this month.".to_string(),
            category: "savings".to_string(),
            rationale: format!(
                "All KPI targets met with a health score of {:.3}",
                health.total,
            ),
            expected_impact: "Keeping the current plan compounds existing gains".to_string(),
        });
    }

    actions
}
