//! Typed LLM operations over the provider router
//!
//! Each operation sends a strict-JSON instruction, coerces the model output
//! (first `{` to last `}`), and validates into a typed struct. A single
//! retry with a tightened directive runs before `MODEL_OUTPUT_INVALID`
//! surfaces.

use crate::error::{OrchestratorError, Result};
use crate::governor::RequestContext;
use crate::models::{ChatMessage, Intent, RetrievalDocument};
use crate::providers::{ChatOptions, ModelGateway};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

const STRICT_JSON_DIRECTIVE: &str =
    "Respond with strict JSON only. No prose, no markdown fences, no commentary.";

//
// ================= Options =================
//

fn default_retrieval_limit() -> usize {
    3
}

/// Per-operation provider overrides. Unknown fields are rejected at the
/// boundary rather than silently ignored.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct StepOptions {
    pub provider: Option<String>,
    pub model: Option<String>,
    pub temperature: Option<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct RetrievalOptions {
    pub provider: Option<String>,
    pub model: Option<String>,
    #[serde(default = "default_retrieval_limit")]
    pub limit: usize,
}

impl Default for RetrievalOptions {
    fn default() -> Self {
        Self {
            provider: None,
            model: None,
            limit: default_retrieval_limit(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct OrchestratorOptions {
    #[serde(default)]
    pub classification: StepOptions,
    #[serde(default)]
    pub extraction: StepOptions,
    #[serde(default)]
    pub summarization: StepOptions,
    #[serde(default)]
    pub retrieval: RetrievalOptions,
}

impl StepOptions {
    fn chat_options(&self) -> ChatOptions {
        ChatOptions {
            provider: self.provider.clone(),
            model: self.model.clone(),
            temperature: self.temperature,
            max_tokens: None,
        }
    }
}

//
// ================= Typed Outputs =================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentClassification {
    pub intent: Intent,
    /// In `[0, 1]`.
    pub confidence: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionDraft {
    pub amount: Option<f64>,
    pub currency: Option<String>,
    pub occurred_at: Option<String>,
    pub merchant: Option<String>,
    pub category: Option<String>,
    pub notes: Option<String>,
    pub description: Option<String>,
    /// The verbatim user text the draft was extracted from.
    #[serde(default)]
    pub raw_text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonthlySummary {
    pub summary: String,
    #[serde(default)]
    pub highlights: Vec<String>,
    #[serde(default)]
    pub savings_opportunities: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub follow_ups: Option<Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct SummarizeRequest {
    pub month: String,
    /// Pre-formatted `date | description | amount` rows.
    pub transaction_rows: Vec<String>,
    pub context: Vec<String>,
    pub tone: Option<String>,
}

//
// ================= JSON Coercion =================
//

/// Locate the first `{` and last `}` and parse the slice as JSON. Models
/// habitually wrap payloads in fences or preambles; everything outside the
/// braces is noise.
pub fn coerce_json(text: &str) -> Result<Value> {
    let start = text.find('{');
    let end = text.rfind('}');
    if let (Some(start), Some(end)) = (start, end) {
        if start < end {
            if let Ok(value) = serde_json::from_str(&text[start..=end]) {
                return Ok(value);
            }
        }
    }
    Err(OrchestratorError::ModelOutputInvalid(format!(
        "no parseable JSON object in model output ({} chars)",
        text.chars().count()
    )))
}

//
// ================= Operations =================
//

pub struct LlmOps {
    gateway: Arc<dyn ModelGateway>,
}

impl LlmOps {
    pub fn new(gateway: Arc<dyn ModelGateway>) -> Self {
        Self { gateway }
    }

    pub fn gateway(&self) -> Arc<dyn ModelGateway> {
        self.gateway.clone()
    }

    /// Chat expecting a JSON object back. One retry with a tightened
    /// strict-JSON system directive before the failure surfaces.
    async fn chat_json(
        &self,
        mut messages: Vec<ChatMessage>,
        options: &ChatOptions,
        ctx: &RequestContext,
    ) -> Result<Value> {
        let outcome = self.gateway.chat(&messages, options, ctx).await?;
        match coerce_json(&outcome.message.content) {
            Ok(value) => Ok(value),
            Err(first_failure) => {
                warn!(%first_failure, "Model output failed JSON coercion, retrying strict");
                messages.insert(0, ChatMessage::system(STRICT_JSON_DIRECTIVE));
                let outcome = self.gateway.chat(&messages, options, ctx).await?;
                coerce_json(&outcome.message.content)
            }
        }
    }

    pub async fn classify_intent(
        &self,
        conversation: &[ChatMessage],
        options: &StepOptions,
        ctx: &RequestContext,
    ) -> Result<IntentClassification> {
        let system = ChatMessage::system(
            r#"You classify the latest user message of a personal-finance conversation.
Intents:
- record_transaction: the user describes money spent or received and wants it logged
- budget_summary: the user asks how their month or budget is going
- general_question: any other finance question
- unknown: anything else

Return JSON: {"intent": "...", "confidence": 0.0-1.0, "reasoning": "..."}"#,
        );

        let mut messages = vec![system];
        messages.extend(conversation.iter().cloned());

        let value = self
            .chat_json(messages, &options.chat_options(), ctx)
            .await?;

        let intent = value
            .get("intent")
            .and_then(Value::as_str)
            .map(Intent::parse)
            .unwrap_or(Intent::Unknown);
        let confidence = value
            .get("confidence")
            .and_then(Value::as_f64)
            .unwrap_or(0.0)
            .clamp(0.0, 1.0);
        let reasoning = value
            .get("reasoning")
            .and_then(Value::as_str)
            .map(String::from);

        debug!(%intent, confidence, "Intent classified");

        Ok(IntentClassification {
            intent,
            confidence,
            reasoning,
        })
    }

    pub async fn extract_transaction(
        &self,
        text: &str,
        options: &StepOptions,
        ctx: &RequestContext,
    ) -> Result<TransactionDraft> {
        let system = ChatMessage::system(
            r#"Extract one financial transaction from the user message.
Return JSON with any of these fields you can determine:
{"amount": number, "currency": "ISO-4217", "occurredAt": "ISO-8601",
 "merchant": "...", "category": "...", "notes": "...", "description": "..."}
Amounts are positive numbers. Omit fields you cannot determine."#,
        );

        let value = self
            .chat_json(
                vec![system, ChatMessage::user(text)],
                &options.chat_options(),
                ctx,
            )
            .await?;

        let mut draft: TransactionDraft = serde_json::from_value(value)
            .map_err(|e| OrchestratorError::ModelOutputInvalid(e.to_string()))?;
        draft.raw_text = text.to_string();
        Ok(draft)
    }

    pub async fn summarize_month(
        &self,
        request: &SummarizeRequest,
        options: &StepOptions,
        ctx: &RequestContext,
    ) -> Result<MonthlySummary> {
        let tone = request.tone.as_deref().unwrap_or("supportive and concise");
        let system = ChatMessage::system(format!(
            r#"You are a personal-finance assistant. Summarise the user's month.
Tone: {tone}.
Return JSON:
{{"summary": "...", "highlights": ["..."], "savingsOpportunities": ["..."], "followUps": ["..."]}}"#
        ));

        let mut prompt = format!(
            "Month: {}\n\nTransactions (date | description | amount):\n{}",
            request.month,
            request.transaction_rows.join("\n"),
        );
        if !request.context.is_empty() {
            prompt.push_str("\n\nEarlier months for comparison:\n");
            prompt.push_str(&request.context.join("\n"));
        }

        let value = self
            .chat_json(
                vec![system, ChatMessage::user(prompt)],
                &options.chat_options(),
                ctx,
            )
            .await?;

        let summary: MonthlySummary = serde_json::from_value(value)
            .map_err(|e| OrchestratorError::ModelOutputInvalid(e.to_string()))?;
        if summary.summary.trim().is_empty() {
            return Err(OrchestratorError::ModelOutputInvalid(
                "summary field is empty".into(),
            ));
        }
        Ok(summary)
    }

    /// Free-form answer constrained to the retrieved context. Without any
    /// context the model is told to say so instead of inventing history.
    pub async fn answer_with_context(
        &self,
        question: &str,
        documents: &[RetrievalDocument],
        options: &StepOptions,
        ctx: &RequestContext,
    ) -> Result<String> {
        let context_block = if documents.is_empty() {
            "No stored financial context is available for this user.".to_string()
        } else {
            documents
                .iter()
                .map(|d| format!("- {}", d.content))
                .collect::<Vec<_>>()
                .join("\n")
        };

        let system = ChatMessage::system(format!(
            r#"You are a personal-finance assistant. Answer only from the stored
context below. If the context does not cover the question, say that you
have no stored data on it. Never invent figures.

Stored context:
{context_block}"#
        ));

        let outcome = self
            .gateway
            .chat(
                &[system, ChatMessage::user(question)],
                &options.chat_options(),
                ctx,
            )
            .await?;

        Ok(outcome.message.content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::testing::ScriptedGateway;
    use std::time::Duration;

    fn ctx() -> RequestContext {
        RequestContext::new(Duration::from_secs(5))
    }

    #[test]
    fn test_coerce_json_recovers_from_fences() {
        let wrapped = "Sure! Here you go:\n```json\n{\"intent\": \"budget_summary\"}\n```";
        let value = coerce_json(wrapped).unwrap();
        assert_eq!(value["intent"], "budget_summary");

        assert!(coerce_json("no braces here").is_err());
        assert!(coerce_json("{ broken json").is_err());
    }

    #[tokio::test]
    async fn test_classify_intent_happy_path() {
        let gateway = Arc::new(ScriptedGateway::new(vec![Ok(
            r#"{"intent": "record_transaction", "confidence": 0.92, "reasoning": "spend phrase"}"#
                .to_string(),
        )]));
        let ops = LlmOps::new(gateway);

        let result = ops
            .classify_intent(
                &[ChatMessage::user("I spent RM20 on lunch")],
                &StepOptions::default(),
                &ctx(),
            )
            .await
            .unwrap();

        assert_eq!(result.intent, Intent::RecordTransaction);
        assert!((result.confidence - 0.92).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_classify_retries_once_then_succeeds() {
        let gateway = Arc::new(ScriptedGateway::new(vec![
            Ok("I think the intent is budget_summary".to_string()),
            Ok(r#"{"intent": "budget_summary", "confidence": 0.8}"#.to_string()),
        ]));
        let ops = LlmOps::new(gateway.clone());

        let result = ops
            .classify_intent(
                &[ChatMessage::user("how is my month")],
                &StepOptions::default(),
                &ctx(),
            )
            .await
            .unwrap();

        assert_eq!(result.intent, Intent::BudgetSummary);
        assert_eq!(gateway.remaining(), 0);
    }

    #[tokio::test]
    async fn test_double_coercion_failure_surfaces() {
        let gateway = Arc::new(ScriptedGateway::new(vec![
            Ok("nope".to_string()),
            Ok("still nope".to_string()),
        ]));
        let ops = LlmOps::new(gateway);

        let err = ops
            .classify_intent(
                &[ChatMessage::user("hello")],
                &StepOptions::default(),
                &ctx(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::ModelOutputInvalid(_)));
    }

    #[tokio::test]
    async fn test_extract_appends_raw_text() {
        let gateway = Arc::new(ScriptedGateway::new(vec![Ok(
            r#"{"amount": 125000, "currency": "IDR", "merchant": "warung"}"#.to_string(),
        )]));
        let ops = LlmOps::new(gateway);

        let draft = ops
            .extract_transaction(
                "I spent IDR 125000 on lunch today",
                &StepOptions::default(),
                &ctx(),
            )
            .await
            .unwrap();

        assert_eq!(draft.amount, Some(125000.0));
        assert_eq!(draft.currency.as_deref(), Some("IDR"));
        assert_eq!(draft.raw_text, "I spent IDR 125000 on lunch today");
    }

    #[tokio::test]
    async fn test_summarize_rejects_empty_summary() {
        let gateway = Arc::new(ScriptedGateway::new(vec![Ok(
            r#"{"summary": "", "highlights": []}"#.to_string(),
        )]));
        let ops = LlmOps::new(gateway);

        let err = ops
            .summarize_month(
                &SummarizeRequest {
                    month: "2024-05".into(),
                    transaction_rows: vec![],
                    context: vec![],
                    tone: None,
                },
                &StepOptions::default(),
                &ctx(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::ModelOutputInvalid(_)));
    }

    #[test]
    fn test_unknown_option_fields_are_rejected() {
        let raw = serde_json::json!({
            "classification": { "provider": "openai", "modelName": "typo" }
        });
        let parsed: std::result::Result<OrchestratorOptions, _> = serde_json::from_value(raw);
        assert!(parsed.is_err());
    }
}
