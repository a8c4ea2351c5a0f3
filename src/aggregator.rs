//! Privacy-preserving cohort aggregation
//!
//! Benchmarks and the leaderboard read only customers who opted in, and
//! the caller must be opted in themselves. Identities never leave the
//! module: every row is keyed by a deterministic emoji+hex alias, the
//! requester's own row included.

use crate::error::{OrchestratorError, Result};
use crate::health;
use crate::models::{kpi_keys, AuthenticatedUser, Customer, MonthlyInsight};
use crate::store::DataStore;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Alias emoji pool: ten neutral symbols, configurable in one place.
pub const ALIAS_EMOJI: [&str; 10] = ["🌱", "🌊", "🌙", "⭐", "🍀", "🦉", "🐢", "🐝", "🌵", "⛰️"];

const LEADERBOARD_LIMIT: usize = 10;

/// `emoji(hash[0] mod pool) ∥ hash[1..7]` over the SHA-256 hex of the
/// user id.
pub fn alias_for(user_id: &str) -> String {
    let hash = hex::encode(Sha256::digest(user_id.as_bytes()));
    let index = usize::from_str_radix(&hash[0..1], 16).unwrap_or(0) % ALIAS_EMOJI.len();
    format!("{}{}", ALIAS_EMOJI[index], &hash[1..7])
}

#[derive(Debug, Clone, Serialize)]
pub struct CohortKey {
    pub region: String,
    pub income_band: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CohortMetrics {
    pub income_avg: f64,
    pub savings_rate_avg: f64,
    pub sample_size: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct CohortBenchmark {
    pub cohort: CohortKey,
    pub metrics: CohortMetrics,
}

#[derive(Debug, Clone, Serialize)]
pub struct LeaderboardEntry {
    pub alias: String,
    pub score: f64,
    pub region: String,
    pub income_band: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RequesterRank {
    pub alias: String,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LeaderboardView {
    pub leaderboard: Vec<LeaderboardEntry>,
    pub you: RequesterRank,
}

pub struct Aggregator {
    store: Arc<dyn DataStore>,
}

impl Aggregator {
    pub fn new(store: Arc<dyn DataStore>) -> Self {
        Self { store }
    }

    /// The caller's own opt-in gates every read in this module.
    async fn require_opt_in(&self, auth: &AuthenticatedUser) -> Result<Customer> {
        let customer = self
            .store
            .customer(auth.customer_id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound("customer not found".into()))?;
        if !customer.allows_benchmarking() {
            return Err(OrchestratorError::BenchmarkOptInRequired);
        }
        Ok(customer)
    }

    /// Every opted-in customer of the tenant with their latest insight.
    async fn opted_in_latest(
        &self,
        auth: &AuthenticatedUser,
    ) -> Result<Vec<(Customer, MonthlyInsight)>> {
        let customers = self.store.customers_for_tenant(auth.tenant_id).await?;
        let mut rows = Vec::new();
        for customer in customers {
            if !customer.allows_benchmarking() {
                continue;
            }
            if let Some(insight) = self
                .store
                .latest_insight(&customer.id.to_string())
                .await?
            {
                rows.push((customer, insight));
            }
        }
        debug!(sample = rows.len(), "Opted-in cohort rows loaded");
        Ok(rows)
    }

    pub async fn benchmarks(&self, auth: &AuthenticatedUser) -> Result<Vec<CohortBenchmark>> {
        self.require_opt_in(auth).await?;

        let rows = self.opted_in_latest(auth).await?;
        let mut cohorts: BTreeMap<(String, String), Vec<&MonthlyInsight>> = BTreeMap::new();
        for (customer, insight) in &rows {
            let key = (customer.region(), customer.income_band());
            cohorts.entry(key).or_default().push(insight);
        }

        Ok(cohorts
            .into_iter()
            .map(|((region, income_band), insights)| {
                let sample_size = insights.len();
                let income_avg = insights
                    .iter()
                    .map(|i| i.kpi_value(kpi_keys::INCOME))
                    .sum::<f64>()
                    / sample_size as f64;
                let savings_rate_avg = insights
                    .iter()
                    .map(|i| i.kpi_value(kpi_keys::SAVINGS_RATE))
                    .sum::<f64>()
                    / sample_size as f64;

                CohortBenchmark {
                    cohort: CohortKey {
                        region,
                        income_band,
                    },
                    metrics: CohortMetrics {
                        income_avg,
                        savings_rate_avg,
                        sample_size,
                    },
                }
            })
            .collect())
    }

    pub async fn leaderboard(&self, auth: &AuthenticatedUser) -> Result<LeaderboardView> {
        self.require_opt_in(auth).await?;

        let rows = self.opted_in_latest(auth).await?;
        let owner = auth.insight_owner();

        let mut entries: Vec<LeaderboardEntry> = rows
            .iter()
            .map(|(customer, insight)| {
                let score = (health::score(&insight.kpis).total * 100.0).round();
                LeaderboardEntry {
                    alias: alias_for(&customer.id.to_string()),
                    score,
                    region: customer.region(),
                    income_band: customer.income_band(),
                }
            })
            .collect();

        entries.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.alias.cmp(&b.alias)));

        // The requester appears under their alias like everyone else,
        // never under a "You" label.
        let you_score = rows
            .iter()
            .find(|(customer, _)| customer.id == auth.customer_id)
            .map(|(_, insight)| (health::score(&insight.kpis).total * 100.0).round())
            .unwrap_or(0.0);
        let you = RequesterRank {
            alias: alias_for(&owner),
            score: you_score,
        };

        entries.truncate(LEADERBOARD_LIMIT);
        Ok(LeaderboardView {
            leaderboard: entries,
            you,
        })
    }
}
