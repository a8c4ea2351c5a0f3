//! Intent classification
//!
//! The model classifies the latest user turn; when no chat provider is
//! reachable a deterministic keyword pass keeps the engine answering, with
//! confidence capped low enough that side-effecting flows stay gated.

use crate::error::{OrchestratorError, Result};
use crate::governor::RequestContext;
use crate::models::{latest_user_message, ChatMessage, Intent};
use crate::providers::ops::{IntentClassification, LlmOps, StepOptions};
use tracing::warn;

/// Ceiling for heuristic confidence. Below the planner's clarifier floor
/// lies `unknown`; well-matched keywords land between the two.
pub const HEURISTIC_CONFIDENCE_CAP: f64 = 0.55;

/// Static keyword lists — zero allocation
const RECORD_KEYWORDS: &[&str] = &[
    "spent", "paid", "bought", "purchase", "received", "salary", "got paid",
    "record", "log", "spend", "transfer",
];

const SUMMARY_KEYWORDS: &[&str] = &[
    "summary", "summarize", "overview", "budget", "this month", "my month",
    "how much did i", "spending report", "recap",
];

const QUESTION_KEYWORDS: &[&str] = &[
    "what", "how", "why", "should i", "explain", "tell me", "can i afford",
    "is it", "advice",
];

fn score(text: &str, keywords: &[&str]) -> usize {
    keywords.iter().filter(|kw| text.contains(**kw)).count()
}

fn has_money_marker(text: &str) -> bool {
    text.chars().any(|c| c.is_ascii_digit())
        || ["rm", "myr", "idr", "usd", "$"].iter().any(|m| text.contains(m))
}

/// Deterministic fallback classifier.
pub fn classify_keywords(text: &str) -> IntentClassification {
    let lowered = text.to_lowercase();

    let record = score(&lowered, RECORD_KEYWORDS);
    let summary = score(&lowered, SUMMARY_KEYWORDS);
    let question = score(&lowered, QUESTION_KEYWORDS);

    let (intent, strength) = if record > 0 && has_money_marker(&lowered) {
        (Intent::RecordTransaction, record + 1)
    } else if summary > 0 && summary >= question {
        (Intent::BudgetSummary, summary)
    } else if question > 0 {
        (Intent::GeneralQuestion, question)
    } else {
        (Intent::Unknown, 0)
    };

    let confidence = match strength {
        0 => 0.3,
        1 => 0.45,
        _ => HEURISTIC_CONFIDENCE_CAP,
    };

    IntentClassification {
        intent,
        confidence,
        reasoning: Some("keyword heuristic".to_string()),
    }
}

/// Classify the conversation, preferring the model and degrading to the
/// keyword pass only when every provider attempt is exhausted.
pub async fn classify(
    llm: &LlmOps,
    conversation: &[ChatMessage],
    options: &StepOptions,
    ctx: &RequestContext,
) -> Result<IntentClassification> {
    match llm.classify_intent(conversation, options, ctx).await {
        Ok(classification) => Ok(classification),
        Err(OrchestratorError::ProviderUnavailable(reason)) => {
            warn!(%reason, "Classifier provider unavailable, using keyword fallback");
            let text = latest_user_message(conversation)
                .map(|m| m.content.as_str())
                .unwrap_or_default();
            Ok(classify_keywords(text))
        }
        Err(error) => Err(error),
    }
}
