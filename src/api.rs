//! REST API for the orchestration engine
//!
//! Routes live under `/v1`; `/api/v1` mirrors the same router for older
//! clients. Responses are JSON everywhere, with an optional SSE rendering
//! of the chat turn. Errors use one envelope: `{code, message, details?}`.

use crate::actions;
use crate::aggregator::Aggregator;
use crate::auth::IdentityResolver;
use crate::config::Config;
use crate::error::{OrchestratorError, Result};
use crate::governor::{RequestContext, RequestGovernor, RouteClass};
use crate::health;
use crate::ingest;
use crate::insights::{InsightPipeline, INTERNAL_EMBEDDER};
use crate::kpi::{self, INTERNAL_EMBEDDING_DIM};
use crate::memory::vector::EXTERNAL_EMBEDDING_DIM;
use crate::memory::{InMemoryVectorStore, PgVectorStore, VectorStore};
use crate::models::{
    AuthenticatedUser, ChatMessage, MessageRole, MonthlyInsight, NewTransaction,
};
use crate::orchestrator::{ChatTurn, Orchestrator};
use crate::providers::ops::{LlmOps, OrchestratorOptions};
use crate::providers::{ModelGateway, ProviderRouter};
use crate::store::{DataStore, InMemoryStore, PgStore};
use crate::tools::finance::register_finance_tools;
use crate::tools::{ToolCall, ToolError, ToolRegistry};
use crate::executor::PlanExecutor;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::info;

//
// ================= State & Construction =================
//

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn DataStore>,
    pub resolver: Arc<IdentityResolver>,
    pub governor: Arc<RequestGovernor>,
    pub orchestrator: Arc<Orchestrator>,
    pub tools: Arc<ToolRegistry>,
    pub aggregator: Arc<Aggregator>,
    pub pipeline: Arc<InsightPipeline>,
}

/// Wire every component from configuration. The database URL selects the
/// Postgres backends; without one the in-memory pair serves development.
pub fn build_state(config: Config) -> Result<AppState> {
    let config = Arc::new(config);

    let dimension = if config.default_embedding_provider == INTERNAL_EMBEDDER {
        INTERNAL_EMBEDDING_DIM
    } else {
        EXTERNAL_EMBEDDING_DIM
    };

    let (store, vector): (Arc<dyn DataStore>, Arc<dyn VectorStore>) = match &config.database_url
    {
        Some(url) => {
            let pg = PgStore::connect_lazy(url)?;
            let pool = pg.pool();
            (Arc::new(pg), Arc::new(PgVectorStore::new(pool, dimension)))
        }
        None => {
            info!("Data store backend: in-memory");
            (
                Arc::new(InMemoryStore::new()),
                Arc::new(InMemoryVectorStore::new(dimension)),
            )
        }
    };

    let gateway: Arc<dyn ModelGateway> = Arc::new(ProviderRouter::new(config.clone())?);
    build_state_with(config, store, vector, gateway)
}

/// Assembly seam shared by production wiring and tests (which inject a
/// scripted gateway and in-memory stores).
pub fn build_state_with(
    config: Arc<Config>,
    store: Arc<dyn DataStore>,
    vector: Arc<dyn VectorStore>,
    gateway: Arc<dyn ModelGateway>,
) -> Result<AppState> {
    let pipeline = Arc::new(InsightPipeline::new(
        store.clone(),
        vector,
        gateway.clone(),
        config.default_embedding_provider.clone(),
    ));

    let mut registry = ToolRegistry::new(store.clone());
    register_finance_tools(&mut registry, store.clone(), pipeline.clone());
    let tools = Arc::new(registry);

    let orchestrator = Arc::new(Orchestrator::new(
        LlmOps::new(gateway.clone()),
        PlanExecutor::new(LlmOps::new(gateway), pipeline.clone(), tools.clone()),
        pipeline.clone(),
    ));

    Ok(AppState {
        resolver: Arc::new(IdentityResolver::new(
            config.auth_secret.clone(),
            store.clone(),
        )),
        governor: Arc::new(RequestGovernor::new()),
        aggregator: Arc::new(Aggregator::new(store.clone())),
        config,
        store,
        orchestrator,
        tools,
        pipeline,
    })
}

//
// ================= Error Envelope =================
//

fn status_for_code(code: &str) -> StatusCode {
    match code {
        "VALIDATION_ERROR" => StatusCode::BAD_REQUEST,
        "AUTH_REQUIRED" | "AUTH_INVALID" => StatusCode::UNAUTHORIZED,
        "BENCHMARK_OPT_IN_REQUIRED" => StatusCode::FORBIDDEN,
        "NOT_FOUND" => StatusCode::NOT_FOUND,
        "IDEMPOTENCY_CONFLICT" => StatusCode::CONFLICT,
        "RATE_LIMIT" => StatusCode::TOO_MANY_REQUESTS,
        "MODEL_OUTPUT_INVALID" => StatusCode::BAD_GATEWAY,
        "PROVIDER_UNAVAILABLE" => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_envelope(err: &OrchestratorError) -> Value {
    let mut envelope = json!({
        "code": err.code(),
        "message": err.to_string(),
    });
    if let Some(details) = err.details() {
        envelope["details"] = details;
    }
    envelope
}

impl IntoResponse for OrchestratorError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(error_envelope(&self))).into_response()
    }
}

/// Convert an errored tool invocation into the HTTP envelope.
fn tool_error_response(error: &ToolError) -> Response {
    let mut envelope = json!({ "code": error.code, "message": error.message });
    if let Some(details) = &error.details {
        envelope["details"] = details.clone();
    }
    (status_for_code(&error.code), Json(envelope)).into_response()
}

//
// ================= Request Helpers =================
//

async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<AuthenticatedUser> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));
    state.resolver.resolve(bearer).await
}

fn remote_addr(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(|value| value.trim().to_string())
        .unwrap_or_else(|| "local".to_string())
}

async fn admit(
    state: &AppState,
    route: RouteClass,
    auth: &AuthenticatedUser,
    headers: &HeaderMap,
) -> Result<()> {
    state
        .governor
        .admit(route, &auth.insight_owner(), &remote_addr(headers))
        .await
}

fn request_ctx(state: &AppState) -> RequestContext {
    RequestContext::new(state.config.request_timeout)
}

fn wants_sse(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.contains("text/event-stream"))
        .unwrap_or(false)
}

async fn run_tool(
    state: &AppState,
    name: &str,
    auth: AuthenticatedUser,
    input: Value,
    ctx: RequestContext,
) -> std::result::Result<Value, Response> {
    let invocation = state
        .tools
        .invoke(name, &ToolCall { auth, input, ctx })
        .await
        .map_err(IntoResponse::into_response)?;

    if let Some(output) = invocation.output {
        Ok(output)
    } else {
        let error = invocation.error.unwrap_or(ToolError {
            code: "INTERNAL_ERROR".to_string(),
            message: "tool produced no output".to_string(),
            details: None,
        });
        Err(tool_error_response(&error))
    }
}

//
// ================= Health =================
//

async fn healthz() -> Json<Value> {
    Json(json!({ "ok": true }))
}

//
// ================= Chat =================
//

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct IncomingMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ChatBody {
    conversation: Vec<IncomingMessage>,
    #[serde(default)]
    options: Option<OrchestratorOptions>,
}

fn parse_conversation(body: &ChatBody) -> Result<Vec<ChatMessage>> {
    if body.conversation.is_empty() {
        return Err(OrchestratorError::validation(
            "conversation is empty",
            vec!["at least one message is required".into()],
        ));
    }

    body.conversation
        .iter()
        .enumerate()
        .map(|(index, message)| {
            let role = match message.role.as_str() {
                "system" => MessageRole::System,
                "user" => MessageRole::User,
                "assistant" => MessageRole::Assistant,
                other => {
                    return Err(OrchestratorError::validation(
                        "invalid message role",
                        vec![format!("conversation[{index}].role is unknown: {other}")],
                    ))
                }
            };
            Ok(ChatMessage {
                role,
                content: message.content.clone(),
                timestamp: None,
                metadata: None,
            })
        })
        .collect()
}

fn chat_turn_json(turn: &ChatTurn) -> Value {
    let mut payload = json!({ "reply": turn.reply });
    if let Some(kpis) = &turn.kpis {
        payload["kpis"] = json!(kpis);
    }
    if let Some(actions) = &turn.actions {
        payload["actions"] = json!(actions);
    }
    if let Some(followup) = &turn.followup {
        payload["followup"] = json!(followup);
    }
    payload
}

/// Word-preserving reply chunks for SSE delivery.
fn chunk_reply(reply: &str, max_chars: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    for word in reply.split_whitespace() {
        if !current.is_empty() && current.chars().count() + word.chars().count() + 1 > max_chars {
            chunks.push(current.clone());
            current.clear();
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(word);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

async fn chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ChatBody>,
) -> Response {
    let auth = match authenticate(&state, &headers).await {
        Ok(auth) => auth,
        Err(err) => return err.into_response(),
    };
    if let Err(err) = admit(&state, RouteClass::Chat, &auth, &headers).await {
        return err.into_response();
    }

    let conversation = match parse_conversation(&body) {
        Ok(conversation) => conversation,
        Err(err) => return err.into_response(),
    };
    let options = body.options.unwrap_or_default();
    let ctx = request_ctx(&state);

    if wants_sse(&headers) {
        return chat_sse(state, auth, conversation, options, ctx).into_response();
    }

    match state
        .orchestrator
        .chat_turn(&auth, &conversation, &options, &ctx)
        .await
    {
        Ok(turn) => Json(chat_turn_json(&turn)).into_response(),
        Err(err) => err.into_response(),
    }
}

/// SSE rendering of a chat turn: `intent`, `plan`, `chunk`×N, `result`,
/// `metadata`, `done`; failures deliver `error` then `done`.
fn chat_sse(
    state: AppState,
    auth: AuthenticatedUser,
    conversation: Vec<ChatMessage>,
    options: OrchestratorOptions,
    ctx: RequestContext,
) -> Sse<impl futures_util::Stream<Item = std::result::Result<Event, Infallible>>> {
    let stream = async_stream::stream! {
        match state
            .orchestrator
            .chat_turn(&auth, &conversation, &options, &ctx)
            .await
        {
            Ok(turn) => {
                yield Ok(Event::default().event("intent").data(
                    json!({ "intent": turn.intent, "confidence": turn.confidence }).to_string(),
                ));
                yield Ok(Event::default()
                    .event("plan")
                    .data(json!({ "steps": turn.plan.steps }).to_string()));
                for chunk in chunk_reply(&turn.reply, 64) {
                    yield Ok(Event::default()
                        .event("chunk")
                        .data(json!({ "text": chunk }).to_string()));
                }
                yield Ok(Event::default()
                    .event("result")
                    .data(chat_turn_json(&turn).to_string()));
                yield Ok(Event::default().event("metadata").data(
                    json!({
                        "intent": turn.intent,
                        "confidence": turn.confidence,
                        "steps": turn.plan.steps.len(),
                    })
                    .to_string(),
                ));
            }
            Err(err) => {
                yield Ok(Event::default()
                    .event("error")
                    .data(error_envelope(&err).to_string()));
            }
        }
        yield Ok(Event::default().event("done").data("{}"));
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}

//
// ================= Insights & Score =================
//

#[derive(Debug, Deserialize)]
struct MonthQuery {
    month: Option<String>,
}

async fn get_insight(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<MonthQuery>,
) -> Response {
    let auth = match authenticate(&state, &headers).await {
        Ok(auth) => auth,
        Err(err) => return err.into_response(),
    };
    let Some(month) = query.month else {
        return OrchestratorError::validation(
            "month query parameter is required",
            vec!["expected ?month=YYYY-MM".into()],
        )
        .into_response();
    };
    if let Err(err) = kpi::validate_month(&month) {
        return err.into_response();
    }

    match state.store.insight(&auth.insight_owner(), &month).await {
        Ok(Some(insight)) => {
            Json(json!({ "kpis": insight.kpis, "story": insight.story })).into_response()
        }
        Ok(None) => OrchestratorError::NotFound("insight not found".into()).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn compute_insight(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let auth = match authenticate(&state, &headers).await {
        Ok(auth) => auth,
        Err(err) => return err.into_response(),
    };
    if let Err(err) = admit(&state, RouteClass::InsightsCompute, &auth, &headers).await {
        return err.into_response();
    }

    let ctx = request_ctx(&state);
    let output = match run_tool(&state, "insights.compute", auth, body, ctx).await {
        Ok(output) => output,
        Err(response) => return response,
    };

    let insight: MonthlyInsight = match serde_json::from_value(output["insight"].clone()) {
        Ok(insight) => insight,
        Err(err) => return OrchestratorError::from(err).into_response(),
    };

    let score = health::score(&insight.kpis);
    let suggestions = actions::suggest(&insight.kpis, &score);
    let enriched: Vec<Value> = suggestions
        .iter()
        .map(|action| {
            let (impact, score_delta) = actions::derive_impact(&action.category, &insight.kpis, &score);
            json!({
                "id": action.id,
                "title": action.title,
                "description": action.description,
                "category": action.category,
                "rationale": action.rationale,
                "impact_myr": (impact * 100.0).round() / 100.0,
                "score_delta": (score_delta * 1000.0).round() / 1000.0,
            })
        })
        .collect();

    Json(json!({
        "insight": { "kpis": insight.kpis, "story": insight.story },
        "score": score,
        "actions": enriched,
    }))
    .into_response()
}

async fn get_score(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<MonthQuery>,
) -> Response {
    let auth = match authenticate(&state, &headers).await {
        Ok(auth) => auth,
        Err(err) => return err.into_response(),
    };

    let ctx = request_ctx(&state);
    let input = match query.month {
        Some(month) => json!({ "month": month }),
        None => json!({}),
    };
    let output = match run_tool(&state, "health.score", auth, input, ctx).await {
        Ok(output) => output,
        Err(response) => return response,
    };

    let total = output["score"]["total"].as_f64().unwrap_or(0.0);
    Json(json!({
        "score": (total * 100.0).round(),
        "components": output["score"]["components"],
        "notes": output["score"]["notes"],
    }))
    .into_response()
}

//
// ================= Simulation =================
//

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
struct SimulateBody {
    #[serde(default)]
    insight_id: Option<String>,
    actions: Vec<String>,
}

async fn simulate(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<SimulateBody>,
) -> Response {
    let auth = match authenticate(&state, &headers).await {
        Ok(auth) => auth,
        Err(err) => return err.into_response(),
    };
    if let Err(err) = admit(&state, RouteClass::Simulate, &auth, &headers).await {
        return err.into_response();
    }

    let ctx = request_ctx(&state);
    let mut input = json!({ "actions": body.actions });
    if let Some(insight_id) = body.insight_id {
        input["insightId"] = json!(insight_id);
    }

    let output = match run_tool(&state, "simulations.run", auth, input, ctx).await {
        Ok(output) => output,
        Err(response) => return response,
    };

    let total = output["score"]["total"].as_f64().unwrap_or(0.0);
    Json(json!({
        "kpis": output["insight"]["kpis"],
        "score": {
            "score": (total * 100.0).round(),
            "components": output["score"]["components"],
            "notes": output["score"]["notes"],
        },
        "adjustments": output["adjustments"],
    }))
    .into_response()
}

//
// ================= CSV Upload =================
//

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct UploadCsvBody {
    month: String,
    csv: String,
}

async fn upload_csv(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<UploadCsvBody>,
) -> Response {
    let auth = match authenticate(&state, &headers).await {
        Ok(auth) => auth,
        Err(err) => return err.into_response(),
    };
    if let Err(err) = admit(&state, RouteClass::UploadCsv, &auth, &headers).await {
        return err.into_response();
    }
    if let Err(err) = kpi::validate_month(&body.month) {
        return err.into_response();
    }

    // Full statement validates before anything is written.
    let rows = match ingest::parse_csv(&body.csv) {
        Ok(rows) => rows,
        Err(err) => return err.into_response(),
    };

    let mut ingested = 0usize;
    let mut batches = Vec::new();
    for (batch_number, chunk) in ingest::batch_rows(&rows) {
        for row in chunk {
            let handle = ingest_handle(&auth, row);
            let insert = state
                .store
                .insert_transaction(NewTransaction {
                    tenant_id: auth.tenant_id,
                    customer_id: auth.customer_id,
                    amount: row.amount,
                    currency: kpi::DEFAULT_CURRENCY.to_string(),
                    kind: row.kind,
                    category: row.category.clone(),
                    description: Some(row.description.clone()),
                    occurred_at: row
                        .date
                        .and_hms_opt(0, 0, 0)
                        .map(|naive| naive.and_utc())
                        .unwrap_or_else(chrono::Utc::now),
                    metadata: json!({ "source": "csv" }),
                    idempotency_handle: handle,
                })
                .await;
            match insert {
                Ok((_, created)) => {
                    if created {
                        ingested += 1;
                    }
                }
                Err(err) => return err.into_response(),
            }
        }
        batches.push(json!({
            "batch": batch_number,
            "rowCount": chunk.len(),
            "month": body.month,
        }));
    }

    info!(rows = rows.len(), ingested, "CSV statement ingested");

    Json(json!({ "ingestedCount": ingested, "batches": batches })).into_response()
}

/// Rows dedupe on content: re-uploading the same statement inserts nothing.
fn ingest_handle(auth: &AuthenticatedUser, row: &ingest::CsvRow) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(b"csv");
    hasher.update(auth.customer_id.to_string().as_bytes());
    hasher.update(row.date.to_string().as_bytes());
    hasher.update(row.description.as_bytes());
    hasher.update(row.amount.to_string().as_bytes());
    hex::encode(hasher.finalize())[..24].to_string()
}

//
// ================= Benchmarks & Leaderboard =================
//

async fn benchmarks(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let auth = match authenticate(&state, &headers).await {
        Ok(auth) => auth,
        Err(err) => return err.into_response(),
    };
    match state.aggregator.benchmarks(&auth).await {
        Ok(cohorts) => Json(json!({ "cohorts": cohorts })).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn leaderboard(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let auth = match authenticate(&state, &headers).await {
        Ok(auth) => auth,
        Err(err) => return err.into_response(),
    };
    match state.aggregator.leaderboard(&auth).await {
        Ok(view) => Json(json!(view)).into_response(),
        Err(err) => err.into_response(),
    }
}

//
// ================= Preferences =================
//

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PreferencesBody {
    preferences: PreferencesPatch,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PreferencesPatch {
    #[serde(default)]
    categories: Option<Value>,
    #[serde(default)]
    notifications: Option<Value>,
    #[serde(default)]
    goals: Option<Value>,
}

async fn get_preferences(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let auth = match authenticate(&state, &headers).await {
        Ok(auth) => auth,
        Err(err) => return err.into_response(),
    };
    if let Err(err) = admit(&state, RouteClass::Preferences, &auth, &headers).await {
        return err.into_response();
    }

    match state.store.customer(auth.customer_id).await {
        Ok(Some(customer)) => {
            let preferences = customer
                .metadata
                .get("preferences")
                .cloned()
                .unwrap_or_else(|| json!({}));
            Json(json!({ "preferences": preferences })).into_response()
        }
        Ok(None) => OrchestratorError::NotFound("customer not found".into()).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn set_preferences(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<PreferencesBody>,
) -> Response {
    let auth = match authenticate(&state, &headers).await {
        Ok(auth) => auth,
        Err(err) => return err.into_response(),
    };
    if let Err(err) = admit(&state, RouteClass::Preferences, &auth, &headers).await {
        return err.into_response();
    }

    let customer = match state.store.customer(auth.customer_id).await {
        Ok(Some(customer)) => customer,
        Ok(None) => {
            return OrchestratorError::NotFound("customer not found".into()).into_response()
        }
        Err(err) => return err.into_response(),
    };

    let mut metadata = customer.metadata.clone();
    if !metadata.is_object() {
        metadata = json!({});
    }
    if let Some(map) = metadata.as_object_mut() {
        let preferences = map
            .entry("preferences")
            .or_insert_with(|| json!({}));
        if let Some(object) = preferences.as_object_mut() {
            if let Some(categories) = body.preferences.categories {
                object.insert("categories".to_string(), categories);
            }
            if let Some(notifications) = body.preferences.notifications {
                object.insert("notifications".to_string(), notifications);
            }
            if let Some(goals) = body.preferences.goals {
                object.insert("goals".to_string(), goals);
            }
        }
    }

    match state
        .store
        .update_customer_metadata(auth.customer_id, metadata)
        .await
    {
        Ok(updated) => {
            let preferences = updated
                .metadata
                .get("preferences")
                .cloned()
                .unwrap_or_else(|| json!({}));
            Json(json!({ "preferences": preferences })).into_response()
        }
        Err(err) => err.into_response(),
    }
}

//
// ================= Router & Server =================
//

fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/chat", post(chat))
        .route("/insights", get(get_insight).post(compute_insight))
        .route("/score", get(get_score))
        .route("/simulate", post(simulate))
        .route("/upload-csv", post(upload_csv))
        .route("/benchmarks", get(benchmarks))
        .route("/leaderboard", get(leaderboard))
        .route("/preferences", get(get_preferences).post(set_preferences))
}

pub fn create_router(state: AppState) -> Router {
    // `/v1` is authoritative; `/api/v1` mirrors it for older clients.
    Router::new()
        .nest("/v1", api_routes())
        .nest("/api/v1", api_routes())
        .with_state(state)
        .layer(CorsLayer::permissive())
}

pub async fn start_server(
    state: AppState,
    port: u16,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let router = create_router(state);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    info!("API server listening on http://0.0.0.0:{}", port);

    axum::serve(listener, router).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{mint_token, TokenClaims};
    use crate::providers::testing::ScriptedGateway;
    use axum::body::Body;
    use axum::http::Request;
    use chrono::Utc;
    use tower::util::ServiceExt;

    const SECRET: &str = "api-test-secret";

    fn test_state(responses: Vec<crate::error::Result<String>>) -> AppState {
        let mut config = Config::default();
        config.auth_secret = SECRET.into();
        build_state_with(
            Arc::new(config),
            Arc::new(InMemoryStore::new()),
            Arc::new(InMemoryVectorStore::new(INTERNAL_EMBEDDING_DIM)),
            Arc::new(ScriptedGateway::new(responses)),
        )
        .unwrap()
    }

    fn token(subject: &str) -> String {
        mint_token(
            SECRET,
            &TokenClaims {
                sub: subject.into(),
                tenant_id: "acme".into(),
                exp: Utc::now().timestamp() + 3600,
                sid: None,
                roles: None,
            },
        )
        .unwrap()
    }

    fn request(method: &str, uri: &str, subject: Option<&str>, body: Option<Value>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(subject) = subject {
            builder = builder.header("Authorization", format!("Bearer {}", token(subject)));
        }
        match body {
            Some(body) => builder
                .header("Content-Type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn insights_body() -> Value {
        json!({
            "month": "2024-05",
            "transactions": [
                { "amount": 15000000, "type": "income" },
                { "amount": -850000, "type": "expense", "category": "groceries" },
                { "amount": -500000, "type": "investment" },
            ],
        })
    }

    #[tokio::test]
    async fn test_healthz_is_public() {
        let router = create_router(test_state(vec![]));
        let response = router
            .oneshot(request("GET", "/v1/healthz", None, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["ok"], true);
    }

    #[tokio::test]
    async fn test_api_v1_mirror_serves_same_routes() {
        let router = create_router(test_state(vec![]));
        let response = router
            .oneshot(request("GET", "/api/v1/healthz", None, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_missing_token_is_401_envelope() {
        let router = create_router(test_state(vec![]));
        let response = router
            .oneshot(request("GET", "/v1/insights?month=2024-05", None, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(response).await["code"], "AUTH_REQUIRED");
    }

    #[tokio::test]
    async fn test_insights_compute_and_fetch_roundtrip() {
        let router = create_router(test_state(vec![]));

        let response = router
            .clone()
            .oneshot(request(
                "POST",
                "/v1/insights",
                Some("user-1"),
                Some(insights_body()),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["insight"]["kpis"]["cashFlow"]["value"], 13650000.0);
        assert!(body["score"]["total"].as_f64().unwrap() > 0.0);
        let first_action = &body["actions"][0];
        assert!(first_action["impact_myr"].as_f64().is_some());
        assert!(first_action["score_delta"].as_f64().is_some());

        let response = router
            .oneshot(request(
                "GET",
                "/v1/insights?month=2024-05",
                Some("user-1"),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        let story = body["story"].as_str().unwrap();
        assert!((200..=400).contains(&story.chars().count()));
    }

    #[tokio::test]
    async fn test_missing_insight_is_404() {
        let router = create_router(test_state(vec![]));
        let response = router
            .oneshot(request(
                "GET",
                "/v1/insights?month=2020-01",
                Some("user-1"),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await["code"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_score_scales_to_hundred() {
        let router = create_router(test_state(vec![]));
        router
            .clone()
            .oneshot(request(
                "POST",
                "/v1/insights",
                Some("user-1"),
                Some(insights_body()),
            ))
            .await
            .unwrap();

        let response = router
            .oneshot(request("GET", "/v1/score?month=2024-05", Some("user-1"), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        let score = body["score"].as_f64().unwrap();
        assert!((0.0..=100.0).contains(&score));
        assert_eq!(body["components"].as_array().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_simulate_improve_savings() {
        let router = create_router(test_state(vec![]));
        router
            .clone()
            .oneshot(request(
                "POST",
                "/v1/insights",
                Some("user-1"),
                Some(json!({
                    "month": "2024-05",
                    "transactions": [
                        { "amount": 10000000, "type": "income" },
                        { "amount": -9000000, "type": "expense", "category": "rent" },
                    ],
                })),
            ))
            .await
            .unwrap();

        let response = router
            .oneshot(request(
                "POST",
                "/v1/simulate",
                Some("user-1"),
                Some(json!({ "actions": ["improve-savings"] })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        let savings = body["kpis"]["savingsRate"]["value"].as_f64().unwrap();
        assert!((savings - 0.13).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_upload_csv_batches_and_dedupes() {
        let router = create_router(test_state(vec![]));

        let csv = "date,description,amount,type,category\n\
                   2024-05-01,kopi,-12.50,expense,food\n\
                   2024-05-02,salary,5000,income,\n";
        let body = json!({ "month": "2024-05", "csv": csv });

        let response = router
            .clone()
            .oneshot(request("POST", "/v1/upload-csv", Some("user-1"), Some(body.clone())))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let payload = body_json(response).await;
        assert_eq!(payload["ingestedCount"], 2);
        assert_eq!(payload["batches"][0]["batch"], 1);
        assert_eq!(payload["batches"][0]["rowCount"], 2);

        // Re-uploading the identical statement inserts nothing new.
        let response = router
            .oneshot(request("POST", "/v1/upload-csv", Some("user-1"), Some(body)))
            .await
            .unwrap();
        let payload = body_json(response).await;
        assert_eq!(payload["ingestedCount"], 0);
    }

    #[tokio::test]
    async fn test_upload_csv_over_cap_rejected() {
        let router = create_router(test_state(vec![]));
        let mut csv = String::from("date,description,amount,type,category\n");
        for i in 0..(ingest::CSV_MAX_ROWS + 1) {
            csv.push_str(&format!("2024-05-01,row {i},-1,expense,misc\n"));
        }

        let response = router
            .oneshot(request(
                "POST",
                "/v1/upload-csv",
                Some("user-1"),
                Some(json!({ "month": "2024-05", "csv": csv })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["code"], "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_benchmarks_require_opt_in() {
        let router = create_router(test_state(vec![]));
        // Touch an endpoint first so the customer row exists.
        router
            .clone()
            .oneshot(request("GET", "/v1/preferences", Some("user-b"), None))
            .await
            .unwrap();

        let response = router
            .oneshot(request("GET", "/v1/benchmarks", Some("user-b"), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            body_json(response).await["code"],
            "BENCHMARK_OPT_IN_REQUIRED"
        );
    }

    #[tokio::test]
    async fn test_preferences_roundtrip_feeds_goals() {
        let router = create_router(test_state(vec![]));

        let response = router
            .clone()
            .oneshot(request(
                "POST",
                "/v1/preferences",
                Some("user-1"),
                Some(json!({
                    "preferences": { "goals": { "savingsRate": 0.5 } }
                })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["preferences"]["goals"]["savingsRate"], 0.5);

        let response = router
            .oneshot(request("GET", "/v1/preferences", Some("user-1"), None))
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["preferences"]["goals"]["savingsRate"], 0.5);
    }

    #[tokio::test]
    async fn test_chat_low_confidence_clarifier() {
        let state = test_state(vec![
            Ok(r#"{"intent": "record_transaction", "confidence": 0.2}"#.to_string()),
            Ok(r#"{"amount": 5}"#.to_string()),
        ]);
        let router = create_router(state);

        let response = router
            .oneshot(request(
                "POST",
                "/v1/chat",
                Some("user-1"),
                Some(json!({
                    "conversation": [
                        { "role": "user", "content": "maybe something with money?" }
                    ]
                })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(
            body["followup"],
            "Could you clarify your request so I can recommend the right action?"
        );
    }

    #[tokio::test]
    async fn test_chat_rejects_unknown_role() {
        let router = create_router(test_state(vec![]));
        let response = router
            .oneshot(request(
                "POST",
                "/v1/chat",
                Some("user-1"),
                Some(json!({
                    "conversation": [{ "role": "wizard", "content": "hi" }]
                })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_rate_limit_envelope_carries_retry_after() {
        let router = create_router(test_state(vec![]));
        let body = json!({ "month": "2024-05", "csv": "date,description,amount,type,category\n" });

        for _ in 0..3 {
            router
                .clone()
                .oneshot(request("POST", "/v1/upload-csv", Some("user-1"), Some(body.clone())))
                .await
                .unwrap();
        }
        let response = router
            .oneshot(request("POST", "/v1/upload-csv", Some("user-1"), Some(body)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let payload = body_json(response).await;
        assert_eq!(payload["code"], "RATE_LIMIT");
        assert!(payload["details"]["retryAfter"].as_u64().unwrap() >= 1);
    }

    #[test]
    fn test_chunk_reply_preserves_words() {
        let reply = "Got it! I've recorded IDR 125000.00 for the merchant on 2024-05-11.";
        let chunks = chunk_reply(reply, 24);
        assert!(chunks.len() > 1);
        assert_eq!(chunks.join(" "), reply);
        assert!(chunks.iter().all(|c| c.chars().count() <= 24));
    }

    #[test]
    fn test_batch_size_constant_alignment() {
        // The upload response advertises batches of at most this size.
        assert_eq!(ingest::CSV_BATCH_SIZE, 500);
    }
}
