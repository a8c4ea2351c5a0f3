//! Tool trait, registry, and idempotent invocation
//!
//! Tools are named, side-effecting operations with typed input. Invocation
//! goes through one protocol: validate, claim the `(tenant, key)` slot,
//! replay or conflict on an existing record, otherwise run the resolver
//! and persist its output.

pub mod finance;

use crate::error::{OrchestratorError, Result};
use crate::governor::RequestContext;
use crate::models::AuthenticatedUser;
use crate::store::{DataStore, IdempotencyDecision};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// One tool call: resolved identity plus raw input.
#[derive(Debug, Clone)]
pub struct ToolCall {
    pub auth: AuthenticatedUser,
    pub input: Value,
    pub ctx: RequestContext,
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;

    /// Idempotency key for this call. The default reads `idempotencyKey`
    /// from the input; tools may derive one instead.
    fn idempotency_key(&self, call: &ToolCall) -> Option<String> {
        call.input
            .get("idempotencyKey")
            .and_then(Value::as_str)
            .map(String::from)
    }

    async fn resolve(&self, call: &ToolCall) -> Result<Value>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    Ok,
    Error,
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolInvocation {
    pub tool: String,
    pub status: ToolStatus,
    pub replayed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolError>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ToolInvocation {
    fn ok(tool: &str, replayed: bool, output: Value) -> Self {
        Self {
            tool: tool.to_string(),
            status: ToolStatus::Ok,
            replayed,
            output: Some(output),
            error: None,
        }
    }

    fn failed(tool: &str, error: &OrchestratorError) -> Self {
        Self {
            tool: tool.to_string(),
            status: ToolStatus::Error,
            replayed: false,
            output: None,
            error: Some(ToolError {
                code: error.code().to_string(),
                message: error.to_string(),
                details: error.details(),
            }),
        }
    }

    pub fn skipped(tool: &str, reason: &str) -> Self {
        Self {
            tool: tool.to_string(),
            status: ToolStatus::Skipped,
            replayed: false,
            output: None,
            error: Some(ToolError {
                code: "SKIPPED".to_string(),
                message: reason.to_string(),
                details: None,
            }),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == ToolStatus::Ok
    }
}

/// `SHA256(canonicalJSON(payload))` as lowercase hex. `serde_json` keeps
/// object keys sorted, which makes its compact encoding canonical here.
pub fn request_hash(payload: &Value) -> String {
    let canonical = serde_json::to_string(payload).unwrap_or_default();
    hex::encode(Sha256::digest(canonical.as_bytes()))
}

/// Registry of named tools sharing one invocation protocol.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    store: Arc<dyn DataStore>,
}

impl ToolRegistry {
    pub fn new(store: Arc<dyn DataStore>) -> Self {
        Self {
            tools: HashMap::new(),
            store,
        }
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Invoke a tool under the idempotency protocol. Tool failures come
    /// back as an errored invocation rather than an `Err`; only
    /// cancellation propagates, leaving the locked record to expire.
    pub async fn invoke(&self, name: &str, call: &ToolCall) -> Result<ToolInvocation> {
        let Some(tool) = self.get(name) else {
            return Ok(ToolInvocation::skipped(name, "Tool handler not registered"));
        };

        call.ctx.checkpoint()?;

        let Some(key) = tool.idempotency_key(call) else {
            // No key: plain invocation without the dedup barrier.
            return Ok(match tool.resolve(call).await {
                Ok(output) => ToolInvocation::ok(name, false, output),
                Err(OrchestratorError::Cancelled) => return Err(OrchestratorError::Cancelled),
                Err(error) => {
                    warn!(tool = name, %error, "Tool resolver failed");
                    ToolInvocation::failed(name, &error)
                }
            });
        };

        let hash = request_hash(&call.input);
        let decision = self
            .store
            .begin_idempotent(call.auth.tenant_id, &key, &hash)
            .await?;

        match decision {
            IdempotencyDecision::Conflict => {
                let error = OrchestratorError::IdempotencyConflict(format!(
                    "key {key} was used with a different payload"
                ));
                Ok(ToolInvocation::failed(name, &error))
            }
            IdempotencyDecision::Replay(mut payload) => {
                debug!(tool = name, key = %key, "Replaying completed invocation");
                mark_replayed(&mut payload);
                Ok(ToolInvocation::ok(name, true, payload))
            }
            IdempotencyDecision::Fresh => match tool.resolve(call).await {
                Ok(output) => {
                    self.store
                        .complete_idempotent(call.auth.tenant_id, &key, &output)
                        .await?;
                    Ok(ToolInvocation::ok(name, false, output))
                }
                Err(OrchestratorError::Cancelled) => {
                    // The locked record is left in place; it times out via
                    // its expiry rather than recording a cancelled result.
                    Err(OrchestratorError::Cancelled)
                }
                Err(error) => {
                    warn!(tool = name, key = %key, %error, "Tool resolver failed");
                    self.store
                        .release_idempotent(call.auth.tenant_id, &key)
                        .await?;
                    Ok(ToolInvocation::failed(name, &error))
                }
            },
        }
    }
}

/// Replayed payloads that report their own idempotency state get the flag
/// flipped so callers see `replayed: true` on every response after the
/// first.
fn mark_replayed(payload: &mut Value) {
    if let Some(idempotency) = payload
        .as_object_mut()
        .and_then(|map| map.get_mut("idempotency"))
        .and_then(Value::as_object_mut)
    {
        idempotency.insert("replayed".to_string(), Value::Bool(true));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use uuid::Uuid;

    struct CountingTool {
        runs: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl Tool for CountingTool {
        fn name(&self) -> &'static str {
            "test.counter"
        }

        fn description(&self) -> &'static str {
            "Counts invocations"
        }

        async fn resolve(&self, _call: &ToolCall) -> Result<Value> {
            let run = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail {
                return Err(OrchestratorError::Internal("boom".into()));
            }
            Ok(json!({ "run": run, "idempotency": { "replayed": false } }))
        }
    }

    fn call(input: Value) -> ToolCall {
        ToolCall {
            auth: AuthenticatedUser {
                user_id: "u-1".into(),
                tenant_id: Uuid::new_v4(),
                customer_id: Uuid::new_v4(),
                roles: vec![],
            },
            input,
            ctx: RequestContext::new(Duration::from_secs(5)),
        }
    }

    fn registry(tool: Arc<dyn Tool>) -> ToolRegistry {
        let mut registry = ToolRegistry::new(Arc::new(InMemoryStore::new()));
        registry.register(tool);
        registry
    }

    #[tokio::test]
    async fn test_replay_returns_identical_payload() {
        let tool = Arc::new(CountingTool {
            runs: AtomicUsize::new(0),
            fail: false,
        });
        let registry = registry(tool.clone());
        let call = call(json!({ "idempotencyKey": "k-1", "value": 7 }));

        let first = registry.invoke("test.counter", &call).await.unwrap();
        assert!(first.succeeded());
        assert!(!first.replayed);

        let second = registry.invoke("test.counter", &call).await.unwrap();
        assert!(second.succeeded());
        assert!(second.replayed);
        assert_eq!(second.output.as_ref().unwrap()["run"], 1);
        assert_eq!(
            second.output.as_ref().unwrap()["idempotency"]["replayed"],
            true
        );
        assert_eq!(tool.runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_same_key_different_payload_conflicts() {
        let tool = Arc::new(CountingTool {
            runs: AtomicUsize::new(0),
            fail: false,
        });
        let registry = registry(tool);

        let first = registry
            .invoke(
                "test.counter",
                &call(json!({ "idempotencyKey": "k-1", "value": 1 })),
            )
            .await
            .unwrap();
        assert!(first.succeeded());

        let second = registry
            .invoke(
                "test.counter",
                &call(json!({ "idempotencyKey": "k-1", "value": 2 })),
            )
            .await
            .unwrap();
        assert_eq!(second.status, ToolStatus::Error);
        assert_eq!(
            second.error.as_ref().unwrap().code,
            "IDEMPOTENCY_CONFLICT"
        );
    }

    #[tokio::test]
    async fn test_failed_resolver_releases_lock_for_retry() {
        let store = Arc::new(InMemoryStore::new());
        let mut registry = ToolRegistry::new(store.clone());
        registry.register(Arc::new(CountingTool {
            runs: AtomicUsize::new(0),
            fail: true,
        }));

        let call = call(json!({ "idempotencyKey": "k-2" }));
        let result = registry.invoke("test.counter", &call).await.unwrap();
        assert_eq!(result.status, ToolStatus::Error);

        let record = store
            .idempotency_record(call.auth.tenant_id, "k-2")
            .await
            .unwrap()
            .unwrap();
        assert!(record.locked_at.is_none());
        assert!(record.response_payload.is_none());
    }

    #[tokio::test]
    async fn test_unregistered_tool_is_skipped() {
        let registry = ToolRegistry::new(Arc::new(InMemoryStore::new()));
        let result = registry
            .invoke("no.such.tool", &call(json!({})))
            .await
            .unwrap();
        assert_eq!(result.status, ToolStatus::Skipped);
        assert_eq!(
            result.error.as_ref().unwrap().message,
            "Tool handler not registered"
        );
    }

    #[test]
    fn test_request_hash_is_order_insensitive() {
        let a = json!({ "b": 2, "a": 1 });
        let b = json!({ "a": 1, "b": 2 });
        assert_eq!(request_hash(&a), request_hash(&b));
        assert_ne!(request_hash(&a), request_hash(&json!({ "a": 1, "b": 3 })));
    }
}
