//! Provider router for chat and embeddings
//!
//! A uniform facade over multiple model vendors. Each provider is a small
//! capability record (endpoint, header builder, payload builder, response
//! parser) selected by name; adding a provider never touches callers.
//! Calls retry with exponential backoff, honour the request deadline, and
//! abort on cancellation.

pub mod ops;

use crate::config::{Config, ProviderCredentials};
use crate::error::{truncate_message, OrchestratorError, Result};
use crate::governor::RequestContext;
use crate::models::{ChatMessage, MessageRole};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Retry schedule: `MAX_ATTEMPTS` tries, initial delay doubling each time.
pub const MAX_ATTEMPTS: u32 = 3;
pub const BACKOFF_FACTOR: u32 = 2;
pub const CHAT_INITIAL_DELAY: Duration = Duration::from_millis(250);
pub const EMBED_INITIAL_DELAY: Duration = Duration::from_millis(200);

/// Embedding pre-processing limits.
pub const EMBED_MAX_CHARS: usize = 400;
pub const EMBED_BATCH_SIZE: usize = 32;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
}

#[derive(Debug, Clone, Default)]
pub struct ChatOptions {
    pub provider: Option<String>,
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Default)]
pub struct EmbedOptions {
    pub provider: Option<String>,
    pub model: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ChatOutcome {
    pub provider: String,
    pub model: String,
    pub message: ChatMessage,
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone)]
pub struct EmbedOutcome {
    pub provider: String,
    pub model: String,
    pub embeddings: Vec<Vec<f32>>,
}

/// Seam the orchestrator talks through; scripted in tests.
#[async_trait]
pub trait ModelGateway: Send + Sync {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
        ctx: &RequestContext,
    ) -> Result<ChatOutcome>;

    async fn embed(
        &self,
        texts: &[String],
        options: &EmbedOptions,
        ctx: &RequestContext,
    ) -> Result<EmbedOutcome>;
}

//
// ================= Provider Capability Records =================
//

struct ProviderSpec {
    name: &'static str,
    default_chat_model: &'static str,
    default_embed_model: Option<&'static str>,
    chat_endpoint: fn(&ProviderCredentials) -> String,
    embed_endpoint: Option<fn(&ProviderCredentials) -> String>,
    headers: fn(&ProviderCredentials) -> Vec<(&'static str, String)>,
    chat_payload: fn(&[ChatMessage], &ChatOptions, &str) -> Value,
    parse_chat: fn(&Value) -> Result<(String, Option<Usage>)>,
    embed_payload: Option<fn(&[String], &str) -> Value>,
    parse_embed: Option<fn(&Value) -> Result<Vec<Vec<f32>>>>,
}

fn role_name(role: MessageRole) -> &'static str {
    match role {
        MessageRole::System => "system",
        MessageRole::User => "user",
        MessageRole::Assistant => "assistant",
    }
}

fn openai_style_messages(messages: &[ChatMessage]) -> Value {
    Value::Array(
        messages
            .iter()
            .map(|m| json!({ "role": role_name(m.role), "content": m.content }))
            .collect(),
    )
}

fn malformed(provider: &str, what: &str) -> OrchestratorError {
    OrchestratorError::ProviderUnavailable(format!("{provider}: malformed response ({what})"))
}

// ---- openai ----

fn openai_chat_endpoint(creds: &ProviderCredentials) -> String {
    let base = creds.endpoint.as_deref().unwrap_or("https://api.openai.com");
    format!("{}/v1/chat/completions", base.trim_end_matches('/'))
}

fn openai_embed_endpoint(creds: &ProviderCredentials) -> String {
    let base = creds.endpoint.as_deref().unwrap_or("https://api.openai.com");
    format!("{}/v1/embeddings", base.trim_end_matches('/'))
}

fn bearer_headers(creds: &ProviderCredentials) -> Vec<(&'static str, String)> {
    vec![(
        "Authorization",
        format!("Bearer {}", creds.api_key.clone().unwrap_or_default()),
    )]
}

fn openai_chat_payload(messages: &[ChatMessage], options: &ChatOptions, model: &str) -> Value {
    json!({
        "model": model,
        "messages": openai_style_messages(messages),
        "temperature": options.temperature.unwrap_or(0.2),
        "max_tokens": options.max_tokens.unwrap_or(1024),
    })
}

fn openai_parse_chat(body: &Value) -> Result<(String, Option<Usage>)> {
    let content = body
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .ok_or_else(|| malformed("openai", "choices[0].message.content"))?
        .to_string();
    let usage = body.get("usage").map(|u| Usage {
        prompt_tokens: u.get("prompt_tokens").and_then(Value::as_u64).map(|v| v as u32),
        completion_tokens: u
            .get("completion_tokens")
            .and_then(Value::as_u64)
            .map(|v| v as u32),
    });
    Ok((content, usage))
}

fn openai_embed_payload(texts: &[String], model: &str) -> Value {
    json!({ "model": model, "input": texts })
}

fn openai_parse_embed(body: &Value) -> Result<Vec<Vec<f32>>> {
    let data = body
        .get("data")
        .and_then(Value::as_array)
        .ok_or_else(|| malformed("openai", "data"))?;
    let mut rows: Vec<(usize, Vec<f32>)> = Vec::with_capacity(data.len());
    for item in data {
        let index = item.get("index").and_then(Value::as_u64).unwrap_or(0) as usize;
        let vector = item
            .get("embedding")
            .and_then(Value::as_array)
            .ok_or_else(|| malformed("openai", "data[].embedding"))?
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        rows.push((index, vector));
    }
    rows.sort_by_key(|(index, _)| *index);
    Ok(rows.into_iter().map(|(_, vector)| vector).collect())
}

// ---- anthropic ----

fn anthropic_chat_endpoint(creds: &ProviderCredentials) -> String {
    let base = creds
        .endpoint
        .as_deref()
        .unwrap_or("https://api.anthropic.com");
    format!("{}/v1/messages", base.trim_end_matches('/'))
}

fn anthropic_headers(creds: &ProviderCredentials) -> Vec<(&'static str, String)> {
    vec![
        ("x-api-key", creds.api_key.clone().unwrap_or_default()),
        ("anthropic-version", "2023-06-01".to_string()),
    ]
}

fn anthropic_chat_payload(messages: &[ChatMessage], options: &ChatOptions, model: &str) -> Value {
    let system = messages
        .iter()
        .filter(|m| m.role == MessageRole::System)
        .map(|m| m.content.as_str())
        .collect::<Vec<_>>()
        .join("\n");
    let turns: Vec<Value> = messages
        .iter()
        .filter(|m| m.role != MessageRole::System)
        .map(|m| json!({ "role": role_name(m.role), "content": m.content }))
        .collect();
    json!({
        "model": model,
        "max_tokens": options.max_tokens.unwrap_or(1024),
        "temperature": options.temperature.unwrap_or(0.2),
        "system": system,
        "messages": turns,
    })
}

fn anthropic_parse_chat(body: &Value) -> Result<(String, Option<Usage>)> {
    let content = body
        .pointer("/content/0/text")
        .and_then(Value::as_str)
        .ok_or_else(|| malformed("anthropic", "content[0].text"))?
        .to_string();
    let usage = body.get("usage").map(|u| Usage {
        prompt_tokens: u.get("input_tokens").and_then(Value::as_u64).map(|v| v as u32),
        completion_tokens: u
            .get("output_tokens")
            .and_then(Value::as_u64)
            .map(|v| v as u32),
    });
    Ok((content, usage))
}

// ---- fireworks ----

fn fireworks_chat_endpoint(creds: &ProviderCredentials) -> String {
    let base = creds
        .endpoint
        .as_deref()
        .unwrap_or("https://api.fireworks.ai/inference");
    format!("{}/v1/chat/completions", base.trim_end_matches('/'))
}

// ---- ollama ----

fn ollama_base(creds: &ProviderCredentials) -> String {
    creds
        .endpoint
        .clone()
        .unwrap_or_else(|| "http://127.0.0.1:11434".to_string())
}

fn ollama_chat_endpoint(creds: &ProviderCredentials) -> String {
    format!("{}/api/chat", ollama_base(creds).trim_end_matches('/'))
}

fn ollama_embed_endpoint(creds: &ProviderCredentials) -> String {
    format!("{}/api/embed", ollama_base(creds).trim_end_matches('/'))
}

fn ollama_headers(_creds: &ProviderCredentials) -> Vec<(&'static str, String)> {
    Vec::new()
}

fn ollama_chat_payload(messages: &[ChatMessage], options: &ChatOptions, model: &str) -> Value {
    json!({
        "model": model,
        "messages": openai_style_messages(messages),
        "stream": false,
        "options": {
            "temperature": options.temperature.unwrap_or(0.2),
            "num_predict": options.max_tokens.unwrap_or(1024),
        },
    })
}

fn ollama_parse_chat(body: &Value) -> Result<(String, Option<Usage>)> {
    let content = body
        .pointer("/message/content")
        .and_then(Value::as_str)
        .ok_or_else(|| malformed("ollama", "message.content"))?
        .to_string();
    Ok((content, None))
}

fn ollama_embed_payload(texts: &[String], model: &str) -> Value {
    json!({ "model": model, "input": texts })
}

fn ollama_parse_embed(body: &Value) -> Result<Vec<Vec<f32>>> {
    body.get("embeddings")
        .and_then(Value::as_array)
        .ok_or_else(|| malformed("ollama", "embeddings"))?
        .iter()
        .map(|row| {
            row.as_array()
                .ok_or_else(|| malformed("ollama", "embeddings[]"))
                .map(|values| values.iter().map(|v| v.as_f64().unwrap_or(0.0) as f32).collect())
        })
        .collect()
}

static PROVIDERS: &[ProviderSpec] = &[
    ProviderSpec {
        name: "openai",
        default_chat_model: "gpt-4o-mini",
        default_embed_model: Some("text-embedding-3-small"),
        chat_endpoint: openai_chat_endpoint,
        embed_endpoint: Some(openai_embed_endpoint),
        headers: bearer_headers,
        chat_payload: openai_chat_payload,
        parse_chat: openai_parse_chat,
        embed_payload: Some(openai_embed_payload),
        parse_embed: Some(openai_parse_embed),
    },
    ProviderSpec {
        name: "anthropic",
        default_chat_model: "claude-3-5-sonnet-20241022",
        default_embed_model: None,
        chat_endpoint: anthropic_chat_endpoint,
        embed_endpoint: None,
        headers: anthropic_headers,
        chat_payload: anthropic_chat_payload,
        parse_chat: anthropic_parse_chat,
        embed_payload: None,
        parse_embed: None,
    },
    ProviderSpec {
        name: "fireworks",
        default_chat_model: "accounts/fireworks/models/llama-v3p1-8b-instruct",
        default_embed_model: None,
        chat_endpoint: fireworks_chat_endpoint,
        embed_endpoint: None,
        headers: bearer_headers,
        chat_payload: openai_chat_payload,
        parse_chat: openai_parse_chat,
        embed_payload: None,
        parse_embed: None,
    },
    ProviderSpec {
        name: "ollama",
        default_chat_model: "gemma3:1b",
        default_embed_model: Some("nomic-embed-text"),
        chat_endpoint: ollama_chat_endpoint,
        embed_endpoint: Some(ollama_embed_endpoint),
        headers: ollama_headers,
        chat_payload: ollama_chat_payload,
        parse_chat: ollama_parse_chat,
        embed_payload: Some(ollama_embed_payload),
        parse_embed: Some(ollama_parse_embed),
    },
];

fn spec_for(name: &str) -> Result<&'static ProviderSpec> {
    PROVIDERS
        .iter()
        .find(|spec| spec.name == name)
        .ok_or_else(|| {
            OrchestratorError::validation(
                "unknown provider",
                vec![format!("no provider named {name}")],
            )
        })
}

//
// ================= Router =================
//

/// Connection-pooled router over the provider registry.
pub struct ProviderRouter {
    client: Client,
    config: Arc<Config>,
}

impl ProviderRouter {
    pub fn new(config: Arc<Config>) -> Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(8)
            .build()
            .map_err(OrchestratorError::Http)?;
        Ok(Self { client, config })
    }

    /// One HTTP attempt bounded by the deadline and cancellation signal.
    /// Network failures and non-2xx responses are both retryable errors.
    async fn dispatch(
        &self,
        url: &str,
        headers: &[(&'static str, String)],
        payload: &Value,
        op_timeout: Duration,
        ctx: &RequestContext,
    ) -> Result<Value> {
        ctx.checkpoint()?;

        let mut request = self
            .client
            .post(url)
            .timeout(ctx.remaining().min(op_timeout))
            .json(payload);
        for (name, value) in headers {
            request = request.header(*name, value);
        }

        let response = tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(OrchestratorError::Cancelled),
            result = request.send() => result.map_err(|e| {
                OrchestratorError::ProviderUnavailable(truncate_message(&e.to_string(), 200))
            })?,
        };

        let status = response.status();
        let body: Value = tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(OrchestratorError::Cancelled),
            result = response.json() => result.map_err(|e| {
                OrchestratorError::ProviderUnavailable(truncate_message(&e.to_string(), 200))
            })?,
        };

        if !status.is_success() {
            return Err(OrchestratorError::ProviderUnavailable(truncate_message(
                &format!("HTTP {}: {}", status, body),
                200,
            )));
        }

        Ok(body)
    }

    async fn call_with_retry(
        &self,
        url: &str,
        headers: &[(&'static str, String)],
        payload: &Value,
        op_timeout: Duration,
        initial_delay: Duration,
        ctx: &RequestContext,
    ) -> Result<Value> {
        let mut delay = initial_delay;
        let mut last_error = OrchestratorError::ProviderUnavailable("no attempts made".into());

        for attempt in 1..=MAX_ATTEMPTS {
            match self.dispatch(url, headers, payload, op_timeout, ctx).await {
                Ok(body) => return Ok(body),
                Err(OrchestratorError::Cancelled) => return Err(OrchestratorError::Cancelled),
                Err(error) => {
                    warn!(attempt, %error, "Provider call failed");
                    last_error = error;
                    if attempt < MAX_ATTEMPTS {
                        ctx.sleep(delay).await?;
                        delay *= BACKOFF_FACTOR;
                    }
                }
            }
        }

        Err(last_error)
    }
}

#[async_trait]
impl ModelGateway for ProviderRouter {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
        ctx: &RequestContext,
    ) -> Result<ChatOutcome> {
        let provider = options
            .provider
            .clone()
            .unwrap_or_else(|| self.config.default_chat_provider.clone());
        let spec = spec_for(&provider)?;
        let creds = self.config.credentials(&provider);
        let model = options
            .model
            .clone()
            .unwrap_or_else(|| spec.default_chat_model.to_string());

        let url = (spec.chat_endpoint)(&creds);
        let headers = (spec.headers)(&creds);
        let payload = (spec.chat_payload)(messages, options, &model);

        info!(provider = %provider, model = %model, "Calling chat provider");

        let body = self
            .call_with_retry(
                &url,
                &headers,
                &payload,
                self.config.chat_timeout,
                CHAT_INITIAL_DELAY,
                ctx,
            )
            .await?;

        let (content, usage) = (spec.parse_chat)(&body)?;
        debug!(provider = %provider, chars = content.len(), "Chat response received");

        Ok(ChatOutcome {
            provider,
            model,
            message: ChatMessage::assistant(content),
            usage,
        })
    }

    async fn embed(
        &self,
        texts: &[String],
        options: &EmbedOptions,
        ctx: &RequestContext,
    ) -> Result<EmbedOutcome> {
        let provider = options
            .provider
            .clone()
            .unwrap_or_else(|| self.config.default_embedding_provider.clone());
        let spec = spec_for(&provider)?;
        let (embed_endpoint, embed_payload, parse_embed) = match (
            spec.embed_endpoint,
            spec.embed_payload,
            spec.parse_embed,
        ) {
            (Some(endpoint), Some(payload), Some(parse)) => (endpoint, payload, parse),
            _ => {
                return Err(OrchestratorError::validation(
                    "provider does not serve embeddings",
                    vec![format!("{provider} has no embedding endpoint")],
                ))
            }
        };

        let creds = self.config.credentials(&provider);
        let model = options
            .model
            .clone()
            .unwrap_or_else(|| spec.default_embed_model.unwrap_or_default().to_string());

        // Trim, truncate, and deduplicate before batching; a reverse index
        // restores the caller's order afterwards.
        let prepared: Vec<String> = texts
            .iter()
            .map(|t| t.trim().chars().take(EMBED_MAX_CHARS).collect())
            .collect();

        let mut unique: Vec<String> = Vec::new();
        let mut seen: HashMap<String, usize> = HashMap::new();
        let mut reverse: Vec<usize> = Vec::with_capacity(prepared.len());
        for text in &prepared {
            let slot = *seen.entry(text.clone()).or_insert_with(|| {
                unique.push(text.clone());
                unique.len() - 1
            });
            reverse.push(slot);
        }

        info!(
            provider = %provider,
            total = texts.len(),
            unique = unique.len(),
            "Calling embedding provider"
        );

        let url = embed_endpoint(&creds);
        let headers = (spec.headers)(&creds);

        let mut unique_vectors: Vec<Vec<f32>> = Vec::with_capacity(unique.len());
        for batch in unique.chunks(EMBED_BATCH_SIZE) {
            let payload = embed_payload(batch, &model);
            let body = self
                .call_with_retry(
                    &url,
                    &headers,
                    &payload,
                    self.config.embed_timeout,
                    EMBED_INITIAL_DELAY,
                    ctx,
                )
                .await?;
            let vectors = parse_embed(&body)?;
            if vectors.len() != batch.len() {
                return Err(OrchestratorError::ProviderUnavailable(format!(
                    "{provider}: embedding count mismatch ({} for {})",
                    vectors.len(),
                    batch.len()
                )));
            }
            unique_vectors.extend(vectors);
        }

        let embeddings = reverse
            .into_iter()
            .map(|slot| unique_vectors[slot].clone())
            .collect();

        Ok(EmbedOutcome {
            provider,
            model,
            embeddings,
        })
    }
}

//
// ================= Test Support =================
//

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Gateway that replays a script of canned chat responses and serves a
    /// fixed embedding for every text.
    pub struct ScriptedGateway {
        responses: Mutex<VecDeque<Result<String>>>,
        pub embed_dimension: usize,
    }

    impl ScriptedGateway {
        pub fn new(responses: Vec<Result<String>>) -> Self {
            Self {
                responses: Mutex::new(responses.into_iter().collect()),
                embed_dimension: 7,
            }
        }

        pub fn remaining(&self) -> usize {
            self.responses.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ModelGateway for ScriptedGateway {
        async fn chat(
            &self,
            _messages: &[ChatMessage],
            _options: &ChatOptions,
            _ctx: &RequestContext,
        ) -> Result<ChatOutcome> {
            let next = self
                .responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| {
                    Err(OrchestratorError::ProviderUnavailable(
                        "script exhausted".into(),
                    ))
                })?;
            Ok(ChatOutcome {
                provider: "scripted".into(),
                model: "scripted".into(),
                message: ChatMessage::assistant(next),
                usage: None,
            })
        }

        async fn embed(
            &self,
            texts: &[String],
            _options: &EmbedOptions,
            _ctx: &RequestContext,
        ) -> Result<EmbedOutcome> {
            let mut vector = vec![0.0f32; self.embed_dimension];
            vector[0] = 1.0;
            Ok(EmbedOutcome {
                provider: "scripted".into(),
                model: "scripted".into(),
                embeddings: texts.iter().map(|_| vector.clone()).collect(),
            })
        }
    }
}
