//! Financial health scoring
//!
//! Pure function over a KPI set: four weighted component scores in [0, 1],
//! each with a short rationale. Notes surface KPIs missing their declared
//! goal, or the weakest component when every goal holds.

use crate::models::{kpi_keys, HealthComponent, HealthScore, KpiSet};
use crate::kpi::clamp;

pub const WEIGHT_CASH_FLOW: f64 = 0.35;
pub const WEIGHT_SAVINGS_RATE: f64 = 0.25;
pub const WEIGHT_DEBT_TO_INCOME: f64 = 0.20;
pub const WEIGHT_INVESTMENT_RATE: f64 = 0.20;

fn round3(x: f64) -> f64 {
    (x * 1000.0).round() / 1000.0
}

fn kpi_value(kpis: &KpiSet, key: &str) -> f64 {
    kpis.get(key).map(|k| k.value).unwrap_or(0.0)
}

/// Cash-flow score: neutral 0.5 without income, otherwise the cash-flow
/// margin mapped from [-1, 1] onto [0, 1].
fn score_cash_flow(income: f64, cash_flow: f64) -> f64 {
    if income <= 0.0 {
        0.5
    } else {
        clamp((cash_flow / income + 1.0) / 2.0, 0.0, 1.0)
    }
}

fn score_savings_rate(savings_rate: f64) -> f64 {
    clamp(savings_rate, 0.0, 1.0)
}

/// Debt score: debt-free is a perfect 1, everything above erodes linearly.
fn score_debt_to_income(debt_ratio: f64) -> f64 {
    if debt_ratio <= 0.0 {
        1.0
    } else {
        clamp(1.0 - debt_ratio, 0.0, 1.0)
    }
}

/// Investment score saturates at a 30% investment rate.
fn score_investment_rate(investment_rate: f64) -> f64 {
    clamp(investment_rate / 0.3, 0.0, 1.0)
}

/// Whether a KPI misses its declared goal. Rate targets are floors for
/// savings and investing, ceilings for spending and debt.
fn fails_goal(key: &str, value: f64, goal: f64) -> bool {
    match key {
        kpi_keys::SAVINGS_RATE | kpi_keys::INVESTMENT_RATE | kpi_keys::INCOME
        | kpi_keys::CASH_FLOW | kpi_keys::NET_WORTH => value < goal,
        _ => value > goal,
    }
}

pub fn score(kpis: &KpiSet) -> HealthScore {
    let income = kpi_value(kpis, kpi_keys::INCOME);
    let cash_flow = kpi_value(kpis, kpi_keys::CASH_FLOW);
    let savings_rate = kpi_value(kpis, kpi_keys::SAVINGS_RATE);
    let debt_to_income = kpi_value(kpis, kpi_keys::DEBT_TO_INCOME);
    let investment_rate = kpi_value(kpis, kpi_keys::INVESTMENT_RATE);

    let components = vec![
        HealthComponent {
            key: kpi_keys::CASH_FLOW.to_string(),
            label: "Cash flow".to_string(),
            score: round3(score_cash_flow(income, cash_flow)),
            weight: WEIGHT_CASH_FLOW,
            rationale: if income <= 0.0 {
                "No income this month, cash flow scored neutral".to_string()
            } else {
                format!(
                    "Cash flow is {:.0}% of income",
                    (cash_flow / income) * 100.0
                )
            },
        },
        HealthComponent {
            key: kpi_keys::SAVINGS_RATE.to_string(),
            label: "Savings rate".to_string(),
            score: round3(score_savings_rate(savings_rate)),
            weight: WEIGHT_SAVINGS_RATE,
            rationale: format!("Saving {:.1}% of income", savings_rate * 100.0),
        },
        HealthComponent {
            key: kpi_keys::DEBT_TO_INCOME.to_string(),
            label: "Debt load".to_string(),
            score: round3(score_debt_to_income(debt_to_income)),
            weight: WEIGHT_DEBT_TO_INCOME,
            rationale: if debt_to_income <= 0.0 {
                "No outstanding debt".to_string()
            } else {
                format!("Debt is {:.1}x monthly income", debt_to_income)
            },
        },
        HealthComponent {
            key: kpi_keys::INVESTMENT_RATE.to_string(),
            label: "Investment rate".to_string(),
            score: round3(score_investment_rate(investment_rate)),
            weight: WEIGHT_INVESTMENT_RATE,
            rationale: format!("Investing {:.1}% of income", investment_rate * 100.0),
        },
    ];

    let total = components.iter().map(|c| c.weight * c.score).sum::<f64>();

    let mut notes: Vec<String> = kpis
        .values()
        .filter_map(|kpi| {
            let goal = kpi.goal?;
            if fails_goal(&kpi.key, kpi.value, goal) {
                Some(format!(
                    "{} at {:.2} missed its goal of {:.2}",
                    kpi.label, kpi.value, goal
                ))
            } else {
                None
            }
        })
        .collect();

    if notes.is_empty() {
        if let Some(weakest) = components
            .iter()
            .min_by(|a, b| a.score.total_cmp(&b.score))
        {
            notes.push(format!("{} is the weakest component", weakest.label));
        }
    }

    HealthScore {
        total,
        components,
        notes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Kpi, KpiUnit};
    use std::collections::BTreeMap;

    fn kpis(entries: &[(&str, f64)]) -> KpiSet {
        entries
            .iter()
            .map(|(key, value)| {
                (
                    key.to_string(),
                    Kpi::new(key, key, *value, KpiUnit::Ratio),
                )
            })
            .collect()
    }

    #[test]
    fn test_total_is_weighted_sum() {
        let set = kpis(&[
            ("income", 10_000.0),
            ("cashFlow", 2_000.0),
            ("savingsRate", 0.2),
            ("debtToIncome", 0.5),
            ("investmentRate", 0.15),
        ]);
        let health = score(&set);

        let expected: f64 = health
            .components
            .iter()
            .map(|c| c.weight * c.score)
            .sum();
        assert!((health.total - expected).abs() < 1e-3);
        assert!((0.0..=1.0).contains(&health.total));
    }

    #[test]
    fn test_zero_income_neutral_cash_flow() {
        let health = score(&kpis(&[("income", 0.0), ("cashFlow", 0.0)]));
        let cash_flow = &health.components[0];
        assert_eq!(cash_flow.key, "cashFlow");
        assert_eq!(cash_flow.score, 0.5);
    }

    #[test]
    fn test_debt_free_scores_perfect() {
        let health = score(&kpis(&[("income", 100.0), ("debtToIncome", 0.0)]));
        let debt = health
            .components
            .iter()
            .find(|c| c.key == "debtToIncome")
            .unwrap();
        assert_eq!(debt.score, 1.0);
    }

    #[test]
    fn test_investment_rate_saturates() {
        let health = score(&kpis(&[("income", 100.0), ("investmentRate", 0.45)]));
        let invest = health
            .components
            .iter()
            .find(|c| c.key == "investmentRate")
            .unwrap();
        assert_eq!(invest.score, 1.0);
    }

    #[test]
    fn test_notes_prefer_failed_goals() {
        let mut set = kpis(&[("income", 10_000.0), ("cashFlow", 5_000.0)]);
        set.insert(
            "savingsRate".to_string(),
            Kpi::new("savingsRate", "Savings rate", 0.1, KpiUnit::Ratio)
                .with_goal(Some(0.2)),
        );
        let health = score(&set);
        assert!(health.notes[0].contains("Savings rate"));
        assert!(health.notes[0].contains("0.20"));

        // Without declared goals the weakest component is named instead.
        let health = score(&kpis(&[("income", 10_000.0), ("cashFlow", 5_000.0)]));
        assert_eq!(health.notes.len(), 1);
        assert!(health.notes[0].contains("weakest"));
    }

    #[test]
    fn test_component_scores_are_rounded() {
        let health = score(&kpis(&[
            ("income", 3.0),
            ("cashFlow", 1.0),
            ("savingsRate", 1.0 / 3.0),
        ]));
        for component in &health.components {
            let scaled = component.score * 1000.0;
            assert!((scaled - scaled.round()).abs() < 1e-9);
        }
    }
}
