//! Intent → plan mapping
//!
//! Plans are small dependency DAGs (≤ 4 nodes) built from a fixed mapping
//! per intent; execution is strictly sequential. Step ids are globally
//! unique so `depends_on` references stay unambiguous.

use crate::models::{Intent, Plan, PlanStep, StepKind};
use crate::providers::ops::IntentClassification;
use serde_json::json;

/// Below this confidence the response must carry a single clarifying
/// follow-up and tool steps are demoted to no-ops.
pub const CONFIDENCE_FLOOR: f64 = 0.4;

pub const CLARIFIER_FOLLOWUP: &str =
    "Could you clarify your request so I can recommend the right action?";

/// Step ids referenced across the executor.
pub mod step_ids {
    pub const EXTRACT_TRANSACTION: &str = "extract-transaction";
    pub const PERSIST_TRANSACTION: &str = "persist-transaction";
    pub const RETRIEVE_CONTEXT: &str = "retrieve-context";
    pub const SUMMARIZE_MONTH: &str = "summarize-month";
    pub const RESPOND_USER: &str = "respond-user";
}

#[derive(Debug, Clone)]
pub struct PlannedRequest {
    pub classification: IntentClassification,
    pub plan: Plan,
    /// True when confidence fell below the floor; the executor skips every
    /// tool step and the response carries the clarifier.
    pub demote_tools: bool,
}

fn step(id: &str, kind: StepKind, description: &str) -> PlanStep {
    PlanStep {
        id: id.to_string(),
        kind,
        description: description.to_string(),
        action: None,
        tool: None,
        input: None,
        depends_on: Vec::new(),
    }
}

/// Fixed plan shape per intent.
pub fn build_plan(intent: Intent) -> Plan {
    let steps = match intent {
        Intent::RecordTransaction => vec![
            PlanStep {
                action: Some(step_ids::EXTRACT_TRANSACTION.to_string()),
                ..step(
                    step_ids::EXTRACT_TRANSACTION,
                    StepKind::Llm,
                    "Extract the transaction from the user message",
                )
            },
            PlanStep {
                tool: Some("transactions.create".to_string()),
                depends_on: vec![step_ids::EXTRACT_TRANSACTION.to_string()],
                input: Some(json!({})),
                ..step(
                    step_ids::PERSIST_TRANSACTION,
                    StepKind::Tool,
                    "Persist the extracted transaction",
                )
            },
            step(
                step_ids::RESPOND_USER,
                StepKind::Synthesis,
                "Confirm the recorded transaction",
            ),
        ],
        Intent::BudgetSummary => vec![
            step(
                step_ids::RETRIEVE_CONTEXT,
                StepKind::Retrieval,
                "Retrieve prior months from vector memory",
            ),
            PlanStep {
                action: Some(step_ids::SUMMARIZE_MONTH.to_string()),
                ..step(
                    step_ids::SUMMARIZE_MONTH,
                    StepKind::Llm,
                    "Summarise the current month",
                )
            },
            step(
                step_ids::RESPOND_USER,
                StepKind::Synthesis,
                "Deliver the monthly summary",
            ),
        ],
        Intent::GeneralQuestion => vec![
            step(
                step_ids::RETRIEVE_CONTEXT,
                StepKind::Retrieval,
                "Retrieve relevant context from vector memory",
            ),
            step(
                step_ids::RESPOND_USER,
                StepKind::Synthesis,
                "Answer from retrieved context",
            ),
        ],
        Intent::Unknown => vec![step(
            step_ids::RESPOND_USER,
            StepKind::Synthesis,
            "Ask for clarification",
        )],
    };

    Plan { intent, steps }
}

pub fn plan_request(classification: IntentClassification) -> PlannedRequest {
    let plan = build_plan(classification.intent);
    let demote_tools = classification.confidence < CONFIDENCE_FLOOR;
    PlannedRequest {
        classification,
        plan,
        demote_tools,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classification(intent: Intent, confidence: f64) -> IntentClassification {
        IntentClassification {
            intent,
            confidence,
            reasoning: None,
        }
    }

    #[test]
    fn test_record_transaction_plan_shape() {
        let plan = build_plan(Intent::RecordTransaction);
        let ids: Vec<&str> = plan.steps.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(
            ids,
            vec!["extract-transaction", "persist-transaction", "respond-user"]
        );

        let persist = &plan.steps[1];
        assert_eq!(persist.kind, StepKind::Tool);
        assert_eq!(persist.tool.as_deref(), Some("transactions.create"));
        assert_eq!(persist.depends_on, vec!["extract-transaction"]);
    }

    #[test]
    fn test_budget_summary_plan_shape() {
        let plan = build_plan(Intent::BudgetSummary);
        let kinds: Vec<StepKind> = plan.steps.iter().map(|s| s.kind).collect();
        assert_eq!(
            kinds,
            vec![StepKind::Retrieval, StepKind::Llm, StepKind::Synthesis]
        );
    }

    #[test]
    fn test_unknown_plan_is_single_synthesis() {
        let plan = build_plan(Intent::Unknown);
        assert_eq!(plan.steps.len(), 1);
        assert_eq!(plan.steps[0].kind, StepKind::Synthesis);
    }

    #[test]
    fn test_low_confidence_demotes_tools() {
        let planned = plan_request(classification(Intent::RecordTransaction, 0.2));
        assert!(planned.demote_tools);

        let planned = plan_request(classification(Intent::RecordTransaction, 0.92));
        assert!(!planned.demote_tools);

        // The floor itself is not below the floor.
        let planned = plan_request(classification(Intent::RecordTransaction, 0.4));
        assert!(!planned.demote_tools);
    }

    #[test]
    fn test_step_ids_are_unique_per_plan() {
        for intent in [
            Intent::RecordTransaction,
            Intent::BudgetSummary,
            Intent::GeneralQuestion,
            Intent::Unknown,
        ] {
            let plan = build_plan(intent);
            let mut ids: Vec<&String> = plan.steps.iter().map(|s| &s.id).collect();
            ids.sort();
            ids.dedup();
            assert_eq!(ids.len(), plan.steps.len());
        }
    }
}
