use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::broadcast;

use crate::automation::trigger::{ConversationContext, RuleScope, TriggerRule};
use crate::automation::types::{ActionType, AutomationEvent, TriggerType};
use crate::automation::{
    AutomationConfig, AutomationConfigPatch, AutomationEngine, EngineEvent, EngineState,
    QueuedDecision,
};
use crate::database::AutomationDatabase;
use crate::datastore::{ChangeKind, EventQuery, TranscriptLine};
use crate::learning::{ConfidenceAdjustment, LearningMetrics, OptimizationRecommendation};
use crate::mood::{Mood, MoodChangeResult, MoodLogEntry, MoodSnapshot, MoodSource, MoodStats, Movement};
use crate::runtime::BackendRuntime;

#[derive(Clone)]
pub struct ServerState {
    pub engine: Arc<AutomationEngine>,
    pub db: Arc<AutomationDatabase>,
    pub auth: BackendAuthConfig,
    pub ws_events: broadcast::Sender<ApiEventEnvelope>,
}

#[derive(Debug, Clone)]
pub struct BackendAuthConfig {
    mode: AuthMode,
    token: Option<String>,
}

impl BackendAuthConfig {
    pub fn required(token: impl Into<String>) -> Self {
        Self {
            mode: AuthMode::Required,
            token: Some(token.into()),
        }
    }

    pub fn disabled() -> Self {
        Self {
            mode: AuthMode::Disabled,
            token: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthMode {
    Required,
    Disabled,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApiEventEnvelope {
    pub event_type: String,
    pub emitted_at: DateTime<Utc>,
    pub payload: Value,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Deserialize)]
struct LimitQuery {
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct SetMoodRequest {
    mood: Mood,
    #[serde(default = "manual_source")]
    source: MoodSource,
    duration_minutes: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct SetMovementRequest {
    movement: Movement,
    #[serde(default = "manual_source")]
    source: MoodSource,
}

fn manual_source() -> MoodSource {
    MoodSource::Manual
}

#[derive(Debug, Deserialize)]
struct ConversationRequest {
    active: bool,
}

#[derive(Debug, Deserialize)]
struct TranscriptRequest {
    text: String,
    #[serde(default = "full_confidence")]
    confidence: f64,
    speaker: Option<String>,
}

fn full_confidence() -> f64 {
    1.0
}

#[derive(Debug, Deserialize)]
struct TableChangeRequest {
    kind: ChangeKind,
    #[serde(default)]
    row: Value,
}

#[derive(Debug, Deserialize)]
struct ManualTriggerRequest {
    action_type: ActionType,
    #[serde(default)]
    params: Value,
    #[serde(default)]
    context: Value,
}

#[derive(Debug, Serialize)]
struct DecisionIdResponse {
    decision_id: String,
}

#[derive(Debug, Serialize)]
struct QueuedResponse {
    decision_ids: Vec<String>,
}

#[derive(Debug, Serialize)]
struct AcceptedResponse {
    accepted: bool,
}

#[derive(Debug, Deserialize)]
struct SegmentRequest {
    segment: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AdjustRequest {
    action_type: ActionType,
    confidence: f64,
    #[serde(default = "keyword_trigger")]
    trigger_type: TriggerType,
}

fn keyword_trigger() -> TriggerType {
    TriggerType::Keyword
}

#[derive(Debug, Deserialize, Serialize)]
struct LearningRateBody {
    learning_rate: f64,
}

#[derive(Debug, Serialize)]
struct RefreshResponse {
    events_loaded: usize,
}

#[derive(Debug, Serialize)]
struct DeletedResponse {
    deleted: bool,
}

pub async fn serve_backend(
    runtime: BackendRuntime,
    event_rx: flume::Receiver<EngineEvent>,
) -> Result<()> {
    let bind_addr = std::env::var("AUTODIRECTOR_BACKEND_BIND")
        .unwrap_or_else(|_| "127.0.0.1:8787".to_string())
        .parse::<SocketAddr>()
        .context("Invalid AUTODIRECTOR_BACKEND_BIND (expected host:port)")?;

    let auth = load_auth_config()?;
    let (ws_events, _) = broadcast::channel(512);

    let state = Arc::new(ServerState {
        engine: runtime.engine.clone(),
        db: runtime.database.clone(),
        auth,
        ws_events: ws_events.clone(),
    });

    spawn_event_bridge(event_rx, ws_events);
    runtime.spawn_background();

    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind backend server to {}", bind_addr))?;
    tracing::info!("Auto-director backend listening on http://{}", bind_addr);
    axum::serve(listener, app)
        .await
        .context("Backend server failed")?;
    Ok(())
}

pub fn build_router(state: Arc<ServerState>) -> Router {
    let protected = Router::new()
        .route("/health", get(health))
        .route("/state", get(get_state))
        .route("/config", get(get_config).put(update_config))
        .route("/emergency-stop", post(emergency_stop))
        .route("/resume", post(resume))
        .route("/show/start", post(start_show))
        .route("/show/segment", post(start_segment))
        .route("/show/scope", put(set_scope))
        .route("/mood", get(get_mood).put(set_mood))
        .route("/mood/movement", put(set_movement))
        .route("/mood/conversation", put(set_conversation))
        .route("/mood/override", axum::routing::delete(clear_override))
        .route("/mood/stats", get(get_mood_stats))
        .route("/mood/log", get(get_mood_log))
        .route("/transcripts", get(list_transcripts).post(add_transcript))
        .route("/context", post(submit_context))
        .route("/tables/:table/changes", post(publish_table_change))
        .route("/triggers/manual", post(manual_trigger))
        .route("/queue", get(get_queue))
        .route("/events", get(list_events))
        .route("/events/:id", get(get_event))
        .route("/events/:id/approve", post(approve_event))
        .route("/events/:id/reject", post(reject_event))
        .route("/rules", get(list_rules).post(create_rule))
        .route(
            "/rules/:id",
            get(get_rule).put(replace_rule).delete(delete_rule),
        )
        .route("/learning/metrics", get(get_metrics))
        .route("/learning/recommendations", get(get_recommendations))
        .route("/learning/adjustments", get(get_adjustments))
        .route("/learning/adjust", post(adjust_confidence))
        .route("/learning/rate", get(get_learning_rate).put(set_learning_rate))
        .route("/learning/refresh", post(refresh_learning))
        .route("/learning/export/csv", get(export_csv))
        .route("/learning/export/json", get(export_json))
        .route("/ws/events", get(ws_events_route))
        .with_state(state.clone())
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    Router::new().nest("/v1", protected)
}

fn spawn_event_bridge(
    event_rx: flume::Receiver<EngineEvent>,
    ws_events: broadcast::Sender<ApiEventEnvelope>,
) {
    tokio::spawn(async move {
        while let Ok(event) = event_rx.recv_async().await {
            let envelope = map_engine_event(event);
            let _ = ws_events.send(envelope);
        }
    });
}

fn map_engine_event(event: EngineEvent) -> ApiEventEnvelope {
    match event {
        EngineEvent::EventRecorded(event) => envelope("event_recorded", to_payload(&event)),
        EngineEvent::EventResolved(event) => envelope("event_resolved", to_payload(&event)),
        EngineEvent::MoodChanged(snapshot) => envelope("mood_changed", to_payload(&snapshot)),
        EngineEvent::ConfigChanged(config) => envelope("config_changed", to_payload(&config)),
        EngineEvent::EmergencyStop { active } => {
            envelope("emergency_stop", json!({ "active": active }))
        }
        EngineEvent::ShowStarted { started_at, scope } => envelope(
            "show_started",
            json!({ "started_at": started_at, "scope": scope }),
        ),
        EngineEvent::SegmentStarted {
            started_at,
            segment,
        } => envelope(
            "segment_started",
            json!({ "started_at": started_at, "segment": segment }),
        ),
        EngineEvent::Error(error) => envelope("error", json!({ "error": error })),
    }
}

fn to_payload<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or_else(|_| json!({}))
}

fn envelope(event_type: &str, payload: Value) -> ApiEventEnvelope {
    ApiEventEnvelope {
        event_type: event_type.to_string(),
        emitted_at: Utc::now(),
        payload,
    }
}

fn load_auth_config() -> Result<BackendAuthConfig> {
    let mode = parse_auth_mode(std::env::var("AUTODIRECTOR_BACKEND_AUTH_MODE").ok())?;
    let token = std::env::var("AUTODIRECTOR_BACKEND_TOKEN")
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty());

    if mode == AuthMode::Required && token.is_none() {
        return Err(anyhow!(
            "AUTODIRECTOR_BACKEND_TOKEN is required when auth mode is 'required'"
        ));
    }
    if mode == AuthMode::Disabled {
        tracing::warn!("Backend auth mode is disabled; all API routes are unauthenticated");
    }

    Ok(BackendAuthConfig { mode, token })
}

fn parse_auth_mode(raw: Option<String>) -> Result<AuthMode> {
    let normalized = raw
        .unwrap_or_else(|| "required".to_string())
        .trim()
        .to_ascii_lowercase();
    match normalized.as_str() {
        "" | "required" | "on" | "enabled" | "true" => Ok(AuthMode::Required),
        "disabled" | "off" | "false" => Ok(AuthMode::Disabled),
        other => Err(anyhow!(
            "Invalid AUTODIRECTOR_BACKEND_AUTH_MODE '{}'. Expected 'required' or 'disabled'",
            other
        )),
    }
}

async fn auth_middleware(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    request: axum::extract::Request,
    next: Next,
) -> Result<Response, StatusCode> {
    authorize(&headers, &state.auth)?;
    Ok(next.run(request).await)
}

fn authorize(headers: &HeaderMap, auth: &BackendAuthConfig) -> Result<(), StatusCode> {
    if auth.mode == AuthMode::Disabled {
        return Ok(());
    }
    let Some(token) = auth.token.as_deref() else {
        return Err(StatusCode::UNAUTHORIZED);
    };

    let Some(raw_header) = headers.get(header::AUTHORIZATION) else {
        return Err(StatusCode::UNAUTHORIZED);
    };
    let Ok(auth_value) = raw_header.to_str() else {
        return Err(StatusCode::UNAUTHORIZED);
    };
    let expected = format!("Bearer {}", token);
    if auth_value.trim() != expected {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(())
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

// ---- engine control ----

async fn get_state(
    State(state): State<Arc<ServerState>>,
) -> Result<Json<EngineState>, (StatusCode, String)> {
    state.engine.state().await.map(Json).map_err(internal_error)
}

async fn get_config(State(state): State<Arc<ServerState>>) -> Json<AutomationConfig> {
    Json(state.engine.config().await)
}

async fn update_config(
    State(state): State<Arc<ServerState>>,
    Json(patch): Json<AutomationConfigPatch>,
) -> Result<Json<AutomationConfig>, (StatusCode, String)> {
    state
        .engine
        .update_config(&patch)
        .await
        .map(Json)
        .map_err(bad_request)
}

async fn emergency_stop(
    State(state): State<Arc<ServerState>>,
) -> Result<Json<AutomationConfig>, (StatusCode, String)> {
    state
        .engine
        .emergency_stop()
        .await
        .map(Json)
        .map_err(internal_error)
}

async fn resume(
    State(state): State<Arc<ServerState>>,
) -> Result<Json<AutomationConfig>, (StatusCode, String)> {
    state.engine.resume().await.map(Json).map_err(internal_error)
}

async fn start_show(
    State(state): State<Arc<ServerState>>,
    Json(scope): Json<RuleScope>,
) -> Result<Json<EngineState>, (StatusCode, String)> {
    state.engine.start_show(scope).await.map_err(internal_error)?;
    state.engine.state().await.map(Json).map_err(internal_error)
}

async fn start_segment(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<SegmentRequest>,
) -> Result<Json<EngineState>, (StatusCode, String)> {
    state.engine.start_segment(body.segment).await;
    state.engine.state().await.map(Json).map_err(internal_error)
}

async fn set_scope(
    State(state): State<Arc<ServerState>>,
    Json(scope): Json<RuleScope>,
) -> Json<RuleScope> {
    state.engine.set_scope(scope.clone()).await;
    Json(scope)
}

// ---- mood ----

async fn get_mood(
    State(state): State<Arc<ServerState>>,
) -> Result<Json<MoodSnapshot>, (StatusCode, String)> {
    state
        .engine
        .mood()
        .snapshot()
        .await
        .map(Json)
        .map_err(internal_error)
}

async fn set_mood(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<SetMoodRequest>,
) -> Json<MoodChangeResult> {
    Json(
        state
            .engine
            .set_mood(body.mood, body.source, body.duration_minutes)
            .await,
    )
}

async fn set_movement(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<SetMovementRequest>,
) -> Json<MoodChangeResult> {
    Json(state.engine.set_movement(body.movement, body.source).await)
}

async fn set_conversation(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<ConversationRequest>,
) -> Result<Json<MoodSnapshot>, (StatusCode, String)> {
    let mood = state.engine.mood();
    mood.set_conversation_active(body.active).await;
    mood.snapshot().await.map(Json).map_err(internal_error)
}

async fn clear_override(
    State(state): State<Arc<ServerState>>,
) -> Result<Json<MoodSnapshot>, (StatusCode, String)> {
    let mood = state.engine.mood();
    mood.clear_manual_override().await;
    mood.snapshot().await.map(Json).map_err(internal_error)
}

async fn get_mood_stats(
    State(state): State<Arc<ServerState>>,
) -> Result<Json<MoodStats>, (StatusCode, String)> {
    state
        .engine
        .mood()
        .mood_stats()
        .await
        .map(Json)
        .map_err(internal_error)
}

async fn get_mood_log(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<Vec<MoodLogEntry>>, (StatusCode, String)> {
    let limit = clamp_limit(query.limit, 50, 1, 1000);
    state.db.get_mood_log(limit).map(Json).map_err(internal_error)
}

// ---- signals ----

async fn list_transcripts(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<Vec<TranscriptLine>>, (StatusCode, String)> {
    let limit = clamp_limit(query.limit, 50, 1, 1000);
    state
        .db
        .recent_transcripts(limit)
        .map(Json)
        .map_err(internal_error)
}

/// Stored, then picked up by the transcript listener through the change feed.
async fn add_transcript(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<TranscriptRequest>,
) -> Result<Json<TranscriptLine>, (StatusCode, String)> {
    let text = body.text.trim();
    if text.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "text cannot be empty".to_string()));
    }
    state
        .db
        .insert_transcript(text, body.confidence, body.speaker.as_deref())
        .map(Json)
        .map_err(internal_error)
}

async fn submit_context(
    State(state): State<Arc<ServerState>>,
    Json(context): Json<ConversationContext>,
) -> Result<Json<QueuedResponse>, (StatusCode, String)> {
    let decision_ids = state
        .engine
        .process_context(&context)
        .await
        .map_err(internal_error)?;
    Ok(Json(QueuedResponse { decision_ids }))
}

/// Lets external producers push row changes into the change feed.
async fn publish_table_change(
    State(state): State<Arc<ServerState>>,
    Path(table): Path<String>,
    Json(body): Json<TableChangeRequest>,
) -> Json<AcceptedResponse> {
    state.db.publish_change(&table, body.kind, body.row);
    Json(AcceptedResponse { accepted: true })
}

async fn manual_trigger(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<ManualTriggerRequest>,
) -> Result<Json<DecisionIdResponse>, (StatusCode, String)> {
    let decision_id = state
        .engine
        .manual_trigger(body.action_type, body.params, body.context)
        .await
        .map_err(internal_error)?;
    Ok(Json(DecisionIdResponse { decision_id }))
}

async fn get_queue(
    State(state): State<Arc<ServerState>>,
) -> Result<Json<Vec<QueuedDecision>>, (StatusCode, String)> {
    state.engine.queued().map(Json).map_err(internal_error)
}

// ---- event log ----

async fn list_events(
    State(state): State<Arc<ServerState>>,
    Query(mut query): Query<EventQuery>,
) -> Result<Json<Vec<AutomationEvent>>, (StatusCode, String)> {
    query.limit = Some(clamp_limit(query.limit, 100, 1, 1000));
    state
        .engine
        .recent_events(&query)
        .await
        .map(Json)
        .map_err(internal_error)
}

async fn get_event(
    State(state): State<Arc<ServerState>>,
    Path(event_id): Path<String>,
) -> Result<Json<AutomationEvent>, (StatusCode, String)> {
    state
        .db
        .find_event(&event_id)
        .map_err(internal_error)?
        .map(Json)
        .ok_or_else(|| not_found(format!("event '{}' not found", event_id)))
}

async fn approve_event(
    State(state): State<Arc<ServerState>>,
    Path(event_id): Path<String>,
) -> Result<Json<AutomationEvent>, (StatusCode, String)> {
    state
        .engine
        .approve_suggestion(&event_id)
        .await
        .map_err(internal_error)?
        .map(Json)
        .ok_or_else(|| not_pending(&event_id))
}

async fn reject_event(
    State(state): State<Arc<ServerState>>,
    Path(event_id): Path<String>,
) -> Result<Json<AutomationEvent>, (StatusCode, String)> {
    state
        .engine
        .reject_suggestion(&event_id)
        .await
        .map_err(internal_error)?
        .map(Json)
        .ok_or_else(|| not_pending(&event_id))
}

// ---- rules ----

async fn list_rules(
    State(state): State<Arc<ServerState>>,
) -> Result<Json<Vec<TriggerRule>>, (StatusCode, String)> {
    state
        .db
        .get_trigger_rules(false)
        .map(Json)
        .map_err(internal_error)
}

async fn get_rule(
    State(state): State<Arc<ServerState>>,
    Path(rule_id): Path<String>,
) -> Result<Json<TriggerRule>, (StatusCode, String)> {
    state
        .db
        .find_trigger_rule(&rule_id)
        .map_err(internal_error)?
        .map(Json)
        .ok_or_else(|| not_found(format!("rule '{}' not found", rule_id)))
}

async fn create_rule(
    State(state): State<Arc<ServerState>>,
    Json(mut rule): Json<TriggerRule>,
) -> Result<Json<TriggerRule>, (StatusCode, String)> {
    if rule.id.trim().is_empty() {
        rule.id = uuid::Uuid::new_v4().to_string();
    }
    save_rule(&state, rule)
}

async fn replace_rule(
    State(state): State<Arc<ServerState>>,
    Path(rule_id): Path<String>,
    Json(mut rule): Json<TriggerRule>,
) -> Result<Json<TriggerRule>, (StatusCode, String)> {
    let existing = state
        .db
        .find_trigger_rule(&rule_id)
        .map_err(internal_error)?
        .ok_or_else(|| not_found(format!("rule '{}' not found", rule_id)))?;
    rule.id = rule_id;
    rule.created_at = existing.created_at;
    rule.current_execution_count = existing.current_execution_count;
    save_rule(&state, rule)
}

fn save_rule(
    state: &ServerState,
    mut rule: TriggerRule,
) -> Result<Json<TriggerRule>, (StatusCode, String)> {
    rule.validate().map_err(bad_request)?;
    rule.updated_at = Utc::now();
    state
        .db
        .upsert_trigger_rule(&rule)
        .map_err(internal_error)?;
    Ok(Json(rule))
}

async fn delete_rule(
    State(state): State<Arc<ServerState>>,
    Path(rule_id): Path<String>,
) -> Result<Json<DeletedResponse>, (StatusCode, String)> {
    let deleted = state
        .db
        .remove_trigger_rule(&rule_id)
        .map_err(internal_error)?;
    if !deleted {
        return Err(not_found(format!("rule '{}' not found", rule_id)));
    }
    Ok(Json(DeletedResponse { deleted }))
}

// ---- learning ----

async fn get_metrics(State(state): State<Arc<ServerState>>) -> Json<LearningMetrics> {
    Json(state.engine.metrics().await)
}

async fn get_recommendations(
    State(state): State<Arc<ServerState>>,
) -> Json<Vec<OptimizationRecommendation>> {
    Json(state.engine.recommendations().await)
}

async fn get_adjustments(
    State(state): State<Arc<ServerState>>,
) -> Json<Vec<ConfidenceAdjustment>> {
    Json(state.engine.adjustment_history().await)
}

async fn adjust_confidence(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<AdjustRequest>,
) -> Json<ConfidenceAdjustment> {
    Json(
        state
            .engine
            .adjust_confidence(body.action_type, body.confidence, body.trigger_type)
            .await,
    )
}

async fn get_learning_rate(State(state): State<Arc<ServerState>>) -> Json<LearningRateBody> {
    Json(LearningRateBody {
        learning_rate: state.engine.learning_rate().await,
    })
}

async fn set_learning_rate(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<LearningRateBody>,
) -> Json<LearningRateBody> {
    Json(LearningRateBody {
        learning_rate: state.engine.set_learning_rate(body.learning_rate).await,
    })
}

async fn refresh_learning(
    State(state): State<Arc<ServerState>>,
) -> Result<Json<RefreshResponse>, (StatusCode, String)> {
    let events_loaded = state
        .engine
        .refresh_learning()
        .await
        .map_err(internal_error)?;
    Ok(Json(RefreshResponse { events_loaded }))
}

async fn export_csv(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/csv; charset=utf-8")],
        state.engine.export_metrics_csv().await,
    )
}

async fn export_json(State(state): State<Arc<ServerState>>) -> Result<Response, (StatusCode, String)> {
    let body = state
        .engine
        .export_events_json()
        .await
        .map_err(internal_error)?;
    Ok(([(header::CONTENT_TYPE, "application/json")], body).into_response())
}

// ---- websocket ----

async fn ws_events_route(
    State(state): State<Arc<ServerState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_events_socket(state, socket))
}

async fn handle_events_socket(state: Arc<ServerState>, mut socket: WebSocket) {
    let mut rx = state.ws_events.subscribe();

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(event) => {
                        let payload = match serde_json::to_string(&event) {
                            Ok(serialized) => serialized,
                            Err(error) => {
                                tracing::warn!("Failed to serialize websocket event: {}", error);
                                continue;
                            }
                        };
                        if socket.send(Message::Text(payload)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!("Websocket client lagged by {} events", skipped);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            incoming = socket.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }
}

fn clamp_limit(value: Option<usize>, default: usize, min: usize, max: usize) -> usize {
    value.unwrap_or(default).clamp(min, max)
}

fn not_found(message: String) -> (StatusCode, String) {
    (StatusCode::NOT_FOUND, message)
}

fn not_pending(event_id: &str) -> (StatusCode, String) {
    (
        StatusCode::CONFLICT,
        format!("event '{}' is not a pending suggestion", event_id),
    )
}

fn bad_request(error: anyhow::Error) -> (StatusCode, String) {
    (StatusCode::BAD_REQUEST, format!("{:#}", error))
}

fn internal_error(error: anyhow::Error) -> (StatusCode, String) {
    (StatusCode::INTERNAL_SERVER_ERROR, error.to_string())
}
