//! REST API Server for the CRM chat assistant
//!
//! Exposes sessions, chat and record maintenance over HTTP and mounts the
//! HTML chat page from [`crate::interface`].

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{AppConfig, DataSourceKind};
use crate::data::{CrmClient, DataSource, RecordStore};
use crate::error::AssistantError;
use crate::handler::{BriefKind, HandlerConfig, QueryHandler};
use crate::interface;
use crate::llm::{GroqClient, LlmClient};
use crate::memory::{SessionRegistry, SharedSession, UserProfile};
use crate::models::{FollowUpState, ProposalStatus, RecordSet};
use crate::retrieval::KeywordMatcher;

/// =============================
/// Request Models
/// =============================

#[derive(Debug, Default, Deserialize)]
pub struct CreateSessionRequest {
    pub display_name: Option<String>,
    /// Restrict the session to one record owner
    pub owner: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct MessageRequest {
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct BriefRequest {
    pub kind: String,
    pub focus: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub chat_id: Option<String>,
    pub owner: Option<String>,
    pub display_name: Option<String>,
    pub messages: Vec<ChatMessage>,
}

#[derive(Debug, Deserialize)]
pub struct OwnerQuery {
    pub owner: Option<String>,
}

/// Filters for `GET /api/records`
#[derive(Debug, Default, Deserialize)]
pub struct RecordQuery {
    /// `proposals` or `follow_ups`; both kinds when absent
    pub kind: Option<String>,
    /// Proposal status, or `overdue` / `open` for follow-ups. Needs `kind`.
    pub status: Option<String>,
    pub owner: Option<String>,
}

/// =============================
/// Response Wrapper
/// =============================

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse {
    pub success: bool,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
    pub timestamp: String,
}

impl ApiResponse {
    pub fn success<T: Serialize>(data: T) -> Self {
        Self {
            success: true,
            data: serde_json::to_value(data).ok(),
            error: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

type ApiResult = (StatusCode, Json<ApiResponse>);

fn ok<T: Serialize>(data: T) -> ApiResult {
    (StatusCode::OK, Json(ApiResponse::success(data)))
}

fn fail(error: &AssistantError) -> ApiResult {
    let status = match error {
        AssistantError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        AssistantError::SessionNotFound(_) => StatusCode::NOT_FOUND,
        AssistantError::SessionConflict(_) => StatusCode::CONFLICT,
        AssistantError::SourceUnavailable(_) | AssistantError::CsvError(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        e if e.is_upstream() => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };

    let message = if error.is_upstream() {
        error.user_message()
    } else {
        error.to_string()
    };

    (status, Json(ApiResponse::error(message)))
}

/// =============================
/// API State
/// =============================

#[derive(Clone)]
pub struct ApiState {
    pub handler: QueryHandler,
    pub sessions: Arc<SessionRegistry>,
}

impl ApiState {
    pub fn new(handler: QueryHandler, sessions: Arc<SessionRegistry>) -> Self {
        Self { handler, sessions }
    }

    /// Wire up the production components from configuration and load the
    /// initial records. A record load failure is logged and the server
    /// starts with an empty set; a reload can recover later.
    pub async fn bootstrap(config: &AppConfig) -> crate::Result<Self> {
        let credentials = config.get_credentials();

        let source = match &config.data_source {
            DataSourceKind::Files {
                proposals,
                follow_ups,
                delimiter,
            } => DataSource::Files {
                proposals: proposals.clone(),
                follow_ups: follow_ups.clone(),
                delimiter: *delimiter,
            },
            DataSourceKind::Crm {
                base_url,
                auth_url,
                timeout,
            } => {
                let crm_credentials = credentials.crm.clone().ok_or_else(|| {
                    AssistantError::CredentialMissing("ZOHO_CLIENT_ID".to_string())
                })?;
                let client = CrmClient::new(base_url, auth_url, crm_credentials, *timeout)?;
                if let Err(e) = client.test_connection().await {
                    warn!("CRM connection check failed: {}", e);
                }
                DataSource::Crm(client)
            }
        };

        let records = RecordStore::new(source);
        match records.reload().await {
            Ok(report) => info!(
                proposals = report.proposals_loaded,
                follow_ups = report.follow_ups_loaded,
                malformed = report.malformed_count(),
                "Records loaded"
            ),
            Err(e) => warn!("Starting with no records: {}", e),
        }

        let llm: Arc<dyn LlmClient> =
            Arc::new(GroqClient::new(&config.llm, credentials.llm_api_key.clone())?);
        info!(model = %config.llm.model, "LLM client ready");

        let handler = QueryHandler::new(
            records,
            Arc::new(KeywordMatcher::new()),
            llm,
            HandlerConfig::from(config),
        );
        let sessions = Arc::new(SessionRegistry::new(
            config.memory_max_turns,
            config.session_idle_timeout,
        ));

        Ok(Self::new(handler, sessions))
    }

    pub async fn session(&self, session_id: Uuid) -> crate::Result<SharedSession> {
        self.sessions
            .get(session_id)
            .await
            .ok_or(AssistantError::SessionNotFound(session_id))
    }
}

/// Build a profile from optional owner / display name inputs
pub fn profile_from(owner: Option<&str>, display_name: Option<&str>) -> UserProfile {
    let owner = owner.map(str::trim).filter(|o| !o.is_empty());
    let display_name = display_name.map(str::trim).filter(|n| !n.is_empty());

    let mut profile = match owner {
        Some(owner) => UserProfile::owner(owner),
        None => UserProfile::admin(),
    };
    if let Some(name) = display_name {
        profile.display_name = name.to_string();
    }
    profile
}

fn stable_uuid_from_string(input: &str) -> Uuid {
    use sha2::{Digest, Sha256};

    let hash = Sha256::digest(input.as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&hash[..16]);

    // Set UUID version (4) and variant (RFC4122) bits.
    bytes[6] = (bytes[6] & 0x0f) | 0x40;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;

    Uuid::from_bytes(bytes)
}

/// A supplied chat id maps to the same session every time; no id starts a
/// brand new conversation.
fn chat_session_id(value: Option<&str>) -> Uuid {
    match value.map(str::trim) {
        Some(v) if !v.is_empty() => {
            Uuid::parse_str(v).unwrap_or_else(|_| stable_uuid_from_string(v))
        }
        _ => Uuid::new_v4(),
    }
}

/// =============================
/// Health & Status
/// =============================

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

async fn status(State(state): State<ApiState>) -> ApiResult {
    let records = state.handler.records();
    let snapshot = records.snapshot().await;
    let report = records.last_report().await;
    let llm = state.handler.llm();

    let llm_error = llm.ping().await.err().map(|e| e.to_string());

    ok(serde_json::json!({
        "llm": {
            "provider": llm.provider(),
            "reachable": llm_error.is_none(),
            "error": llm_error,
        },
        "records": {
            "source": records.source().map(|s| s.describe()),
            "proposals": snapshot.proposals.len(),
            "follow_ups": snapshot.follow_ups.len(),
            "malformed_rows": report.malformed_count(),
        },
        "active_sessions": state.sessions.len().await,
    }))
}

/// =============================
/// Sessions
/// =============================

async fn create_session(
    State(state): State<ApiState>,
    body: Option<Json<CreateSessionRequest>>,
) -> ApiResult {
    let req = body.map(|Json(req)| req).unwrap_or_default();
    let profile = profile_from(req.owner.as_deref(), req.display_name.as_deref());
    let session_id = state.sessions.create(profile.clone()).await;

    ok(serde_json::json!({
        "session_id": session_id,
        "profile": profile,
        "role": profile.role(),
    }))
}

async fn end_session(State(state): State<ApiState>, Path(session_id): Path<Uuid>) -> ApiResult {
    if state.sessions.end(session_id).await {
        ok(serde_json::json!({ "session_id": session_id, "ended": true }))
    } else {
        fail(&AssistantError::SessionNotFound(session_id))
    }
}

async fn post_message(
    State(state): State<ApiState>,
    Path(session_id): Path<Uuid>,
    Json(req): Json<MessageRequest>,
) -> ApiResult {
    let session = match state.session(session_id).await {
        Ok(session) => session,
        Err(e) => return fail(&e),
    };

    let mut context = session.lock().await;
    match state.handler.answer(&req.message, &mut context).await {
        Ok(answer) => ok(answer),
        Err(e) => fail(&e),
    }
}

async fn transcript(State(state): State<ApiState>, Path(session_id): Path<Uuid>) -> ApiResult {
    let session = match state.session(session_id).await {
        Ok(session) => session,
        Err(e) => return fail(&e),
    };

    let context = session.lock().await;
    let turns: Vec<_> = context.memory.transcript().cloned().collect();

    ok(serde_json::json!({
        "session_id": session_id,
        "profile": context.profile,
        "turns": turns,
    }))
}

async fn create_brief(
    State(state): State<ApiState>,
    Path(session_id): Path<Uuid>,
    Json(req): Json<BriefRequest>,
) -> ApiResult {
    let kind: BriefKind = match req.kind.parse() {
        Ok(kind) => kind,
        Err(e) => return fail(&e),
    };
    let session = match state.session(session_id).await {
        Ok(session) => session,
        Err(e) => return fail(&e),
    };

    let context = session.lock().await;
    let brief = state
        .handler
        .brief(kind, req.focus.as_deref(), &context)
        .await;

    ok(brief)
}

/// =============================
/// Chat Endpoint
/// =============================

/// Stateless-client chat: the session is keyed by `chat_id` and only the
/// last user message is answered; prior turns come from server memory.
async fn chat_handler(State(state): State<ApiState>, Json(req): Json<ChatRequest>) -> ApiResult {
    let Some(user_msg) = req.messages.iter().rev().find(|m| m.role == "user") else {
        return (
            StatusCode::BAD_REQUEST,
            Json(ApiResponse::error("No user message found".into())),
        );
    };

    let session_id = chat_session_id(req.chat_id.as_deref());
    let profile = profile_from(req.owner.as_deref(), req.display_name.as_deref());
    info!(%session_id, "chat_handler");

    let session = match state.sessions.get_or_create(session_id, profile).await {
        Ok(session) => session,
        Err(e) => return fail(&e),
    };
    let mut context = session.lock().await;

    match state.handler.answer(&user_msg.content, &mut context).await {
        Ok(answer) => ok(serde_json::json!({
            "chat_id": session_id,
            "answer": answer.text,
            "upstream_failed": answer.upstream_failed,
            "matched_records": answer.matched_records,
        })),
        Err(e) => fail(&e),
    }
}

/// =============================
/// Records
/// =============================

async fn records_summary(State(state): State<ApiState>, Query(query): Query<OwnerQuery>) -> ApiResult {
    let snapshot = state.handler.records().snapshot().await;
    let owner = query.owner.as_deref().map(str::trim).filter(|o| !o.is_empty());
    let summary = snapshot
        .scoped_to(owner)
        .summary(chrono::Utc::now().date_naive());

    ok(serde_json::json!({
        "owner": owner,
        "owners": snapshot.owners(),
        "summary": summary,
    }))
}

fn filter_records(
    records: &RecordSet,
    query: &RecordQuery,
    today: chrono::NaiveDate,
) -> crate::Result<serde_json::Value> {
    let kind = query.kind.as_deref().map(|k| k.trim().to_lowercase()).filter(|k| !k.is_empty());
    let status = query.status.as_deref().map(str::trim).filter(|s| !s.is_empty());
    let owner = query.owner.as_deref().map(str::trim).filter(|o| !o.is_empty());

    let (with_proposals, with_follow_ups) = match kind.as_deref() {
        None if status.is_some() => {
            return Err(AssistantError::InvalidInput(
                "a status filter needs kind=proposals or kind=follow_ups".to_string(),
            ))
        }
        None => (true, true),
        Some("proposals" | "proposal") => (true, false),
        Some("follow_ups" | "follow-ups" | "followups" | "follow_up") => (false, true),
        Some(other) => {
            return Err(AssistantError::InvalidInput(format!(
                "unknown record kind '{}', expected proposals or follow_ups",
                other
            )))
        }
    };

    let mut body = serde_json::Map::new();
    if with_proposals {
        let status = status
            .map(str::parse::<ProposalStatus>)
            .transpose()
            .map_err(AssistantError::InvalidInput)?;
        body.insert(
            "proposals".to_string(),
            serde_json::to_value(records.proposals_with(status, owner))?,
        );
    }
    if with_follow_ups {
        let state = status
            .map(str::parse::<FollowUpState>)
            .transpose()
            .map_err(AssistantError::InvalidInput)?;
        body.insert(
            "follow_ups".to_string(),
            serde_json::to_value(records.follow_ups_with(state, owner, today))?,
        );
    }
    Ok(serde_json::Value::Object(body))
}

async fn list_records(State(state): State<ApiState>, Query(query): Query<RecordQuery>) -> ApiResult {
    let snapshot = state.handler.records().snapshot().await;
    match filter_records(&snapshot, &query, chrono::Utc::now().date_naive()) {
        Ok(body) => ok(body),
        Err(e) => fail(&e),
    }
}

async fn reload_records(State(state): State<ApiState>) -> ApiResult {
    match state.handler.records().reload().await {
        Ok(report) => ok(report),
        Err(e) => fail(&e),
    }
}

/// =============================
/// Router
/// =============================

pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/status", get(status))
        .route("/api/sessions", post(create_session))
        .route("/api/sessions/:id", axum::routing::delete(end_session))
        .route("/api/sessions/:id/messages", post(post_message))
        .route("/api/sessions/:id/transcript", get(transcript))
        .route("/api/sessions/:id/briefs", post(create_brief))
        .route("/api/chat", post(chat_handler))
        .route("/api/records", get(list_records))
        .route("/api/records/summary", get(records_summary))
        .route("/api/records/reload", post(reload_records))
        .merge(interface::routes())
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// =============================
/// Server Startup
/// =============================

pub async fn start_server(
    state: ApiState,
    port: u16,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let router = create_router(state);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    info!("API Server listening on http://0.0.0.0:{}", port);
    info!("Local: http://127.0.0.1:{}", port);

    axum::serve(listener, router).await?;

    Ok(())
}
