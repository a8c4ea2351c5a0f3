//! Plan executor
//!
//! Walks the plan strictly in order over a request-scoped state bag. Each
//! step writes its result exactly once before any dependent step runs;
//! unmet dependencies are fatal. Tool failures land in `tool_results` and
//! synthesis decides what the user sees.

use crate::error::{OrchestratorError, Result};
use crate::governor::RequestContext;
use crate::insights::InsightPipeline;
use crate::kpi::DEFAULT_CURRENCY;
use crate::models::{
    latest_user_message, AuthenticatedUser, ChatMessage, Intent, PlanStep, RetrievalDocument,
    StepKind,
};
use crate::planner::{step_ids, PlannedRequest};
use crate::providers::ops::{
    LlmOps, MonthlySummary, OrchestratorOptions, SummarizeRequest, TransactionDraft,
};
use crate::tools::{ToolCall, ToolInvocation, ToolRegistry};
use chrono::Utc;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

pub const UNKNOWN_INTENT_REPLY: &str =
    "I'm not sure how to help with that yet, but I'm learning more every day!";

const PERSIST_FAILURE_REPLY: &str =
    "Sorry, I couldn't save that transaction just now. Nothing was recorded, \
     so feel free to try again.";

/// Request-scoped execution state; discarded when the turn completes.
#[derive(Debug, Default)]
pub struct ExecutionState {
    pub retrieved_documents: Vec<RetrievalDocument>,
    pub step_results: HashMap<String, Value>,
    pub tool_results: Vec<ToolInvocation>,
    pub final_message: Option<String>,
    pub result_data: Option<Value>,
}

impl ExecutionState {
    fn record_step(&mut self, step_id: &str, value: Value) {
        // Write-once: plans with duplicate ids are rejected upstream, so a
        // second write would be an executor bug.
        debug_assert!(!self.step_results.contains_key(step_id));
        self.step_results.insert(step_id.to_string(), value);
    }
}

pub struct PlanExecutor {
    llm: LlmOps,
    pipeline: Arc<InsightPipeline>,
    tools: Arc<ToolRegistry>,
}

impl PlanExecutor {
    pub fn new(llm: LlmOps, pipeline: Arc<InsightPipeline>, tools: Arc<ToolRegistry>) -> Self {
        Self {
            llm,
            pipeline,
            tools,
        }
    }

    pub async fn execute(
        &self,
        auth: &AuthenticatedUser,
        conversation: &[ChatMessage],
        planned: &PlannedRequest,
        options: &OrchestratorOptions,
        ctx: &RequestContext,
    ) -> Result<ExecutionState> {
        let mut state = ExecutionState::default();

        for step in &planned.plan.steps {
            ctx.checkpoint()?;

            let missing: Vec<&String> = step
                .depends_on
                .iter()
                .filter(|dep| !state.step_results.contains_key(*dep))
                .collect();
            if !missing.is_empty() {
                return Err(OrchestratorError::DependencyUnmet(format!(
                    "step {} requires unmet steps {:?}",
                    step.id, missing
                )));
            }

            debug!(step = %step.id, kind = ?step.kind, "Executing plan step");

            match step.kind {
                StepKind::Retrieval => {
                    self.run_retrieval(auth, conversation, step, options, ctx, &mut state)
                        .await?;
                }
                StepKind::Llm => {
                    self.run_llm(auth, conversation, step, options, ctx, &mut state)
                        .await?;
                }
                StepKind::Tool => {
                    self.run_tool(auth, planned, step, ctx, &mut state).await?;
                }
                StepKind::Synthesis => {
                    self.run_synthesis(auth, conversation, planned.plan.intent, step, options, ctx, &mut state)
                        .await?;
                }
            }
        }

        // Synthesis fallback: a plan must never end without a reply.
        if state.final_message.is_none() {
            state.final_message = Some(UNKNOWN_INTENT_REPLY.to_string());
        }

        Ok(state)
    }

    async fn run_retrieval(
        &self,
        auth: &AuthenticatedUser,
        conversation: &[ChatMessage],
        step: &PlanStep,
        options: &OrchestratorOptions,
        ctx: &RequestContext,
        state: &mut ExecutionState,
    ) -> Result<()> {
        let query = step
            .input
            .as_ref()
            .and_then(|input| input.get("query"))
            .and_then(Value::as_str)
            .map(String::from)
            .or_else(|| latest_user_message(conversation).map(|m| m.content.clone()))
            .unwrap_or_default();

        let owner = auth.insight_owner();
        let outcome = async {
            let vector = self.pipeline.embed_query(&query, ctx).await?;
            self.pipeline
                .vector()
                .search(&owner, &vector, options.retrieval.limit)
                .await
        }
        .await;

        match outcome {
            Ok(documents) => {
                // The store already scopes by user; this re-filter guards
                // against a misbehaving backend.
                let documents: Vec<RetrievalDocument> = documents
                    .into_iter()
                    .filter(|d| d.user_id == owner)
                    .collect();
                state.record_step(&step.id, json!({ "documents": documents.len() }));
                state.retrieved_documents = documents;
                Ok(())
            }
            Err(OrchestratorError::Cancelled) => Err(OrchestratorError::Cancelled),
            Err(error) => {
                // Retrieval is best-effort; synthesis handles the empty set.
                warn!(%error, "Retrieval failed, continuing without context");
                state.record_step(&step.id, json!({ "documents": 0, "error": error.to_string() }));
                Ok(())
            }
        }
    }

    async fn run_llm(
        &self,
        auth: &AuthenticatedUser,
        conversation: &[ChatMessage],
        step: &PlanStep,
        options: &OrchestratorOptions,
        ctx: &RequestContext,
        state: &mut ExecutionState,
    ) -> Result<()> {
        let action = step.action.as_deref().unwrap_or(step.id.as_str());
        match action {
            step_ids::EXTRACT_TRANSACTION => {
                let text = latest_user_message(conversation)
                    .map(|m| m.content.clone())
                    .unwrap_or_default();
                let draft = self
                    .llm
                    .extract_transaction(&text, &options.extraction, ctx)
                    .await?;
                state.record_step(&step.id, serde_json::to_value(&draft)?);
                Ok(())
            }
            step_ids::SUMMARIZE_MONTH => {
                let month = step
                    .input
                    .as_ref()
                    .and_then(|input| input.get("month"))
                    .and_then(Value::as_str)
                    .map(String::from)
                    .unwrap_or_else(|| Utc::now().format("%Y-%m").to_string());

                let transactions = self
                    .pipeline
                    .store()
                    .transactions_for_month(auth.tenant_id, auth.customer_id, &month)
                    .await?;
                let transaction_rows: Vec<String> = transactions
                    .iter()
                    .map(|tx| {
                        format!(
                            "{} | {} | {}",
                            tx.occurred_at.format("%Y-%m-%d"),
                            tx.description.as_deref().unwrap_or("-"),
                            tx.amount
                        )
                    })
                    .collect();
                let context: Vec<String> = state
                    .retrieved_documents
                    .iter()
                    .map(|d| d.content.clone())
                    .collect();

                let summary = self
                    .llm
                    .summarize_month(
                        &SummarizeRequest {
                            month,
                            transaction_rows,
                            context,
                            tone: None,
                        },
                        &options.summarization,
                        ctx,
                    )
                    .await?;
                state.record_step(&step.id, serde_json::to_value(&summary)?);
                Ok(())
            }
            other => Err(OrchestratorError::Internal(format!(
                "unknown llm action {other}"
            ))),
        }
    }

    async fn run_tool(
        &self,
        auth: &AuthenticatedUser,
        planned: &PlannedRequest,
        step: &PlanStep,
        ctx: &RequestContext,
        state: &mut ExecutionState,
    ) -> Result<()> {
        let tool_name = step.tool.as_deref().unwrap_or_default();

        if planned.demote_tools {
            // Low-confidence turns never cause side effects.
            let invocation =
                ToolInvocation::skipped(tool_name, "Tool execution disabled below the confidence floor");
            state.record_step(&step.id, serde_json::to_value(&invocation)?);
            state.tool_results.push(invocation);
            return Ok(());
        }

        let mut input = step.input.clone().unwrap_or_else(|| json!({}));
        if tool_name == "transactions.create" {
            if let Some(draft) = state.step_results.get(step_ids::EXTRACT_TRANSACTION) {
                input["transaction"] = draft.clone();
            }
        }

        let invocation = self
            .tools
            .invoke(
                tool_name,
                &ToolCall {
                    auth: auth.clone(),
                    input,
                    ctx: ctx.clone(),
                },
            )
            .await?;

        state.record_step(
            &step.id,
            invocation
                .output
                .clone()
                .unwrap_or_else(|| serde_json::to_value(&invocation).unwrap_or_default()),
        );
        state.tool_results.push(invocation);
        Ok(())
    }

    async fn run_synthesis(
        &self,
        _auth: &AuthenticatedUser,
        conversation: &[ChatMessage],
        intent: Intent,
        step: &PlanStep,
        options: &OrchestratorOptions,
        ctx: &RequestContext,
        state: &mut ExecutionState,
    ) -> Result<()> {
        let message = match intent {
            Intent::RecordTransaction => self.synthesize_recorded(state)?,
            Intent::BudgetSummary => {
                let summary: Option<MonthlySummary> = state
                    .step_results
                    .get(step_ids::SUMMARIZE_MONTH)
                    .cloned()
                    .and_then(|value| serde_json::from_value(value).ok());
                match summary {
                    Some(summary) => {
                        state.result_data = Some(json!({
                            "summary": summary.summary,
                            "highlights": summary.highlights,
                            "savingsOpportunities": summary.savings_opportunities,
                            "followUps": summary.follow_ups,
                        }));
                        summary.summary
                    }
                    None => UNKNOWN_INTENT_REPLY.to_string(),
                }
            }
            Intent::GeneralQuestion => {
                let question = latest_user_message(conversation)
                    .map(|m| m.content.clone())
                    .unwrap_or_default();
                self.llm
                    .answer_with_context(
                        &question,
                        &state.retrieved_documents,
                        &options.summarization,
                        ctx,
                    )
                    .await?
            }
            Intent::Unknown => UNKNOWN_INTENT_REPLY.to_string(),
        };

        state.record_step(&step.id, json!({ "message": message }));
        state.final_message = Some(message);
        Ok(())
    }

    fn synthesize_recorded(&self, state: &mut ExecutionState) -> Result<String> {
        let persisted = state
            .tool_results
            .iter()
            .find(|invocation| invocation.tool == "transactions.create");

        match persisted {
            Some(invocation) if invocation.succeeded() => {
                let draft: TransactionDraft = state
                    .step_results
                    .get(step_ids::EXTRACT_TRANSACTION)
                    .cloned()
                    .and_then(|value| serde_json::from_value(value).ok())
                    .unwrap_or_default();

                let currency = draft
                    .currency
                    .unwrap_or_else(|| DEFAULT_CURRENCY.to_string());
                let amount = draft.amount.unwrap_or(0.0);
                let merchant = draft
                    .merchant
                    .unwrap_or_else(|| "the merchant".to_string());
                let occurred_at = draft
                    .occurred_at
                    .unwrap_or_else(|| "the specified date".to_string());

                state.result_data = invocation.output.clone();

                Ok(format!(
                    "Got it! I've recorded {} {:.2} for {} on {}. Anything else you need?",
                    currency, amount, merchant, occurred_at
                ))
            }
            _ => {
                // Persist failed or was demoted; apologise, record nothing.
                state.result_data = Some(json!({ "code": null }));
                Ok(PERSIST_FAILURE_REPLY.to_string())
            }
        }
    }
}
