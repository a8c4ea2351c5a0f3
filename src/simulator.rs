//! What-if simulation
//!
//! Applies fixed per-action deltas to a copy of an insight, re-derives the
//! dependent KPIs from primitives, re-scores health, and regenerates the
//! narrative with a "(projected)" suffix. Unknown action ids are no-ops
//! recorded with a zero adjustment.

use crate::actions::{
    ACTION_ACCELERATE_DEBT, ACTION_BOOST_INVESTMENTS, ACTION_GROW_INCOME,
    ACTION_IMPROVE_SAVINGS, ACTION_OPTIMIZE_EXPENSES,
};
use crate::health;
use crate::kpi::{
    clamp, enforce_story_bounds, facts_from_kpis, kpis_from_facts, render_story, KpiFacts,
    DEFAULT_CURRENCY,
};
use crate::models::{kpi_keys, HealthScore, MonthlyInsight};
use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize)]
pub struct SimulationResult {
    pub projected_insight: MonthlyInsight,
    pub projected_health: HealthScore,
    /// Monetary adjustment applied per selected action id; zero for ids
    /// the simulator does not recognise.
    pub adjustments: BTreeMap<String, f64>,
}

fn recompute_rates(facts: &mut KpiFacts) {
    if facts.income > 0.0 {
        facts.savings_rate = clamp((facts.income - facts.expenses) / facts.income, 0.0, 1.5);
        facts.investment_rate = clamp(facts.investments / facts.income, 0.0, 1.5);
        facts.expense_ratio = clamp(facts.expenses / facts.income, 0.0, 2.0);
        facts.debt_to_income = clamp(facts.debt_outstanding / facts.income, 0.0, 2.0);
    } else {
        facts.savings_rate = 0.0;
        facts.investment_rate = 0.0;
        facts.expense_ratio = 0.0;
        facts.debt_to_income = 0.0;
    }
}

/// Recompute every derived KPI from primitives so the set stays internally
/// consistent after a batch of action deltas.
fn refresh_derived(facts: &mut KpiFacts) {
    facts.cash_flow =
        facts.income - facts.expenses - facts.investments - facts.debt_payments;
    recompute_rates(facts);
}

fn apply_action(facts: &mut KpiFacts, action_id: &str) -> f64 {
    match action_id {
        ACTION_IMPROVE_SAVINGS => {
            let before = facts.savings_rate;
            let after = clamp(before + 0.03, 0.0, 0.8);
            // The equivalent amount moves from expenses into cash flow.
            let moved = facts.income * (after - before);
            facts.expenses -= moved;
            facts.cash_flow += moved;
            facts.savings_rate = after;
            moved
        }
        ACTION_OPTIMIZE_EXPENSES => {
            let saved = facts.expenses * 0.05;
            facts.expenses -= saved;
            facts.cash_flow += saved;
            recompute_rates(facts);
            saved
        }
        ACTION_ACCELERATE_DEBT => {
            let repaid = facts.debt_outstanding * 0.05;
            facts.debt_outstanding -= repaid;
            recompute_rates(facts);
            repaid
        }
        ACTION_BOOST_INVESTMENTS => {
            let added = facts.income * 0.02;
            facts.investments += added;
            facts.cash_flow -= added;
            recompute_rates(facts);
            added
        }
        ACTION_GROW_INCOME => {
            let gained = facts.income * 0.03;
            facts.income += gained;
            facts.cash_flow =
                facts.income - facts.expenses - facts.investments - facts.debt_payments;
            recompute_rates(facts);
            gained
        }
        _ => 0.0,
    }
}

pub fn simulate(insight: &MonthlyInsight, action_ids: &[String]) -> SimulationResult {
    let mut facts = facts_from_kpis(&insight.kpis, &insight.month, DEFAULT_CURRENCY);

    let mut adjustments = BTreeMap::new();
    for action_id in action_ids {
        let adjustment = apply_action(&mut facts, action_id);
        adjustments.insert(action_id.clone(), adjustment);
    }

    refresh_derived(&mut facts);

    // Goals and the net-worth delta survive the projection unchanged.
    let goals: BTreeMap<String, f64> = insight
        .kpis
        .values()
        .filter_map(|kpi| kpi.goal.map(|g| (kpi.key.clone(), g)))
        .collect();
    let mut kpis = kpis_from_facts(&facts, &goals);
    if let (Some(original), Some(projected)) = (
        insight.kpis.get(kpi_keys::NET_WORTH),
        kpis.get_mut(kpi_keys::NET_WORTH),
    ) {
        projected.delta = original.delta;
    }

    let projected_health = health::score(&kpis);
    let story = enforce_story_bounds(format!("{} (projected)", render_story(&facts)));

    SimulationResult {
        projected_insight: MonthlyInsight {
            id: insight.id.clone(),
            user_id: insight.user_id.clone(),
            month: insight.month.clone(),
            kpis,
            story,
            created_at: Utc::now(),
        },
        projected_health,
        adjustments,
    }
}
