//! Chat-turn orchestration
//!
//! INPUT → CLASSIFY → PLAN → EXECUTE → ASSEMBLE
//!
//! One turn per request; no state survives outside the persistence layer.

use crate::actions;
use crate::classifier;
use crate::error::Result;
use crate::executor::PlanExecutor;
use crate::governor::RequestContext;
use crate::health;
use crate::insights::InsightPipeline;
use crate::models::{
    AuthenticatedUser, ChatMessage, Intent, KpiSet, Plan, SuggestedAction,
};
use crate::planner::{plan_request, CLARIFIER_FOLLOWUP};
use crate::providers::ops::{LlmOps, OrchestratorOptions};
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

/// Assembled result of one conversational turn.
#[derive(Debug, Clone)]
pub struct ChatTurn {
    pub reply: String,
    pub kpis: Option<KpiSet>,
    pub actions: Option<Vec<SuggestedAction>>,
    pub followup: Option<String>,
    pub intent: Intent,
    pub confidence: f64,
    pub plan: Plan,
    pub result_data: Option<Value>,
}

pub struct Orchestrator {
    llm: LlmOps,
    executor: PlanExecutor,
    pipeline: Arc<InsightPipeline>,
}

impl Orchestrator {
    pub fn new(llm: LlmOps, executor: PlanExecutor, pipeline: Arc<InsightPipeline>) -> Self {
        Self {
            llm,
            executor,
            pipeline,
        }
    }

    pub async fn chat_turn(
        &self,
        auth: &AuthenticatedUser,
        conversation: &[ChatMessage],
        options: &OrchestratorOptions,
        ctx: &RequestContext,
    ) -> Result<ChatTurn> {
        let classification =
            classifier::classify(&self.llm, conversation, &options.classification, ctx).await?;

        info!(
            intent = %classification.intent,
            confidence = classification.confidence,
            "Turn classified"
        );

        let planned = plan_request(classification);
        let demoted = planned.demote_tools;

        let state = self
            .executor
            .execute(auth, conversation, &planned, options, ctx)
            .await?;

        // The month-level view rides along on every turn: latest stored
        // KPIs plus the actions they currently suggest.
        let latest = self
            .pipeline
            .store()
            .latest_insight(&auth.insight_owner())
            .await?;
        let (kpis, suggested) = match latest {
            Some(insight) => {
                let score = health::score(&insight.kpis);
                let suggested = actions::suggest(&insight.kpis, &score);
                (Some(insight.kpis), Some(suggested))
            }
            None => (None, None),
        };

        let followup = if demoted {
            Some(CLARIFIER_FOLLOWUP.to_string())
        } else {
            state
                .result_data
                .as_ref()
                .and_then(|data| data.get("followUps"))
                .and_then(Value::as_array)
                .and_then(|follow_ups| follow_ups.first())
                .and_then(Value::as_str)
                .map(String::from)
        };

        Ok(ChatTurn {
            reply: state
                .final_message
                .unwrap_or_else(|| crate::executor::UNKNOWN_INTENT_REPLY.to_string()),
            kpis,
            actions: suggested,
            followup,
            intent: planned.plan.intent,
            confidence: planned.classification.confidence,
            plan: planned.plan,
            result_data: state.result_data,
        })
    }
}
