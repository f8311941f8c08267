//! Control Plane Surface (§4.7): the HTTP + SSE API other processes (a CLI,
//! a dashboard, another gateway instance) use to observe and drive this
//! gateway. Every handler returns the `{ok, data|error}` envelope; auth and
//! mutation rate limiting are enforced by middleware wrapped around the
//! whole router.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::extract::{ConnectInfo, Path as AxumPath, Query, State};
use axum::http::{HeaderMap, Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use futures_util::stream::{self, Stream};
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tower_http::cors::CorsLayer;
use tracing::warn;

use crate::error::{to_error_body, GatewayError};
use crate::gateway::GatewayRuntime;
use crate::observability::redact::redact_value;
use crate::orchestration::TurnInput;
use crate::provider::rate_limits::SlidingWindow;
use crate::security::validate_session_id;

/// Request body size cap (§4.7): anything larger is rejected before the
/// handler sees it, and the connection is dropped rather than drained.
const MAX_BODY_BYTES: usize = 512_000;
const MUTATION_RATE_WINDOW_SECS: u64 = 60;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum Scope {
    Read,
    Admin,
}

#[derive(Default)]
struct RateLimiters {
    windows: Mutex<HashMap<String, SlidingWindow>>,
}

impl RateLimiters {
    /// `key` combines scope + remote address + a short token prefix so a
    /// single caller's bad token can't exhaust another caller's budget.
    async fn check_and_record(&self, key: &str, max_per_minute: u64) -> bool {
        let mut windows = self.windows.lock().await;
        let window = windows
            .entry(key.to_string())
            .or_insert_with(|| SlidingWindow::new(MUTATION_RATE_WINDOW_SECS, max_per_minute.max(1)));
        let now = Utc::now();
        if window.is_limited(now) {
            return false;
        }
        window.record(now);
        true
    }
}

pub struct ControlState {
    pub runtime: Arc<GatewayRuntime>,
    limiters: RateLimiters,
}

impl ControlState {
    pub fn new(runtime: Arc<GatewayRuntime>) -> Arc<Self> {
        Arc::new(Self {
            runtime,
            limiters: RateLimiters::default(),
        })
    }
}

fn ok_body(data: Value) -> Json<Value> {
    Json(json!({"ok": true, "data": data}))
}

fn err_response(err: anyhow::Error) -> Response {
    let (status, body) = to_error_body(&err);
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(json!({"ok": false, "error": body}))).into_response()
}

fn is_loopback(addr: &SocketAddr) -> bool {
    match addr.ip() {
        IpAddr::V4(v4) => v4.is_loopback(),
        IpAddr::V6(v6) => v6.is_loopback(),
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|s| s.trim().to_string())
}

/// Resolve the scope a request is authorized for, or `None` to reject it.
/// Loopback callers skip auth entirely when `allow_loopback_without_auth`
/// is set; everyone else needs a bearer token matching an admin or read
/// token configured in `[control]`.
fn authorize(
    state: &ControlState,
    remote: Option<SocketAddr>,
    headers: &HeaderMap,
) -> Option<Scope> {
    let control = &state.runtime.config.control;
    if state.runtime.config.allow_loopback_without_auth {
        if let Some(addr) = remote {
            if is_loopback(&addr) {
                return Some(Scope::Admin);
            }
        }
    }
    let token = bearer_token(headers)?;
    if control.admin_tokens.iter().any(|t| t == &token) {
        return Some(Scope::Admin);
    }
    if control.read_tokens.iter().any(|t| t == &token) {
        return Some(Scope::Read);
    }
    None
}

/// Auth + body-cap + mutation rate-limit middleware. `/healthz` bypasses
/// this layer entirely (wired separately in `build_router`).
async fn guard(
    State(state): State<Arc<ControlState>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let remote = req.extensions().get::<ConnectInfo<SocketAddr>>().map(|c| c.0);
    let headers = req.headers().clone();
    let method = req.method().clone();
    let uri = req.uri().clone();

    let Some(scope) = authorize(&state, remote, &headers) else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"ok": false, "error": {"code": "unauthorized", "message": "missing or invalid bearer token"}})),
        )
            .into_response();
    };

    let is_mutation = matches!(method.as_str(), "POST" | "PUT" | "PATCH" | "DELETE");
    if scope == Scope::Read && is_mutation {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({"ok": false, "error": {"code": "policy_denied", "message": "read-scoped token cannot perform mutations"}})),
        )
            .into_response();
    }

    if is_mutation {
        let token_prefix: String = bearer_token(&headers)
            .map(|t| t.chars().take(8).collect())
            .unwrap_or_else(|| "loopback".to_string());
        let remote_label = remote.map(|a| a.ip().to_string()).unwrap_or_else(|| "unknown".to_string());
        let key = format!("{scope:?}:{remote_label}:{token_prefix}");
        let rate_limit = state.runtime.hot_config.read().await.mutation_rate_limit_per_minute;
        let allowed = state.limiters.check_and_record(&key, rate_limit).await;
        if !allowed {
            return (
                StatusCode::TOO_MANY_REQUESTS,
                Json(json!({"ok": false, "error": {"code": "rate_limited", "message": "mutation rate limit exceeded"}})),
            )
                .into_response();
        }
    }

    let (parts, body) = req.into_parts();
    let bytes = match to_bytes(body, MAX_BODY_BYTES).await {
        Ok(b) => b,
        Err(_) => {
            return (
                StatusCode::PAYLOAD_TOO_LARGE,
                Json(json!({"ok": false, "error": {"code": "validation_error", "message": "request body exceeds 512000 bytes"}})),
            )
                .into_response();
        }
    };
    let req = Request::from_parts(parts, Body::from(bytes));
    let _ = uri;
    next.run(req).await
}

pub fn build_router(state: Arc<ControlState>) -> Router {
    let protected = Router::new()
        .route("/status", get(status))
        .route("/events", get(events_sse))
        .route("/sessions", get(list_sessions).post(create_session))
        .route(
            "/sessions/{id}",
            get(get_session).delete(delete_session),
        )
        .route("/sessions/{id}/rename", post(rename_session))
        .route("/sessions/{id}/switch", post(switch_session))
        .route("/sessions/{id}/route", post(set_session_route))
        .route("/sessions/{id}/skills", post(set_session_skills))
        .route("/sessions/retention", get(retention_candidates))
        .route("/sessions/prune", post(prune_sessions))
        .route("/chat/send", post(chat_send))
        .route("/providers/status", get(providers_status))
        .route("/subagents/start", post(submit_subagent))
        .route("/subagents/jobs", get(list_subagents))
        .route("/subagents/jobs/{id}", get(get_subagent))
        .route("/subagents/jobs/{id}/cancel", post(cancel_subagent))
        .route("/subagents/jobs/{id}/logs", get(subagent_logs))
        .route("/runtime/restart", post(runtime_restart))
        .route("/backup/create", post(backup_create))
        .route("/backup/restore", post(backup_restore))
        .layer(middleware::from_fn_with_state(state.clone(), guard));

    Router::new()
        .route("/healthz", get(healthz))
        .merge(protected)
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind the control plane to `host:port` (`port: 0` asks the OS for one)
/// and serve it on a background task. Returns the address actually bound,
/// so `GatewayRuntime::start` can record it for `/status`.
pub async fn serve(state: Arc<ControlState>, host: &str, port: u16) -> anyhow::Result<SocketAddr> {
    let router = build_router(state)
        .into_make_service_with_connect_info::<SocketAddr>();
    let listener = tokio::net::TcpListener::bind((host, port)).await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, router).await {
            tracing::error!(error = %err, "control plane server exited");
        }
    });
    Ok(addr)
}

/// Unauthenticated liveness/readiness probe (§4.7): reports only
/// `{status, degradedReasons}`, never session content, so it stays safe
/// to expose to a container orchestrator before any token exists.
async fn healthz(State(state): State<Arc<ControlState>>) -> impl IntoResponse {
    let snapshot = state.runtime.status().await;
    Json(json!({"ok": true, "data": {"status": snapshot.status, "degradedReasons": snapshot.degraded_reasons}}))
}

async fn status(State(state): State<Arc<ControlState>>) -> impl IntoResponse {
    let snapshot = state.runtime.status().await;
    ok_body(serde_json::to_value(snapshot).unwrap_or(Value::Null))
}

async fn events_sse(
    State(state): State<Arc<ControlState>>,
) -> Sse<impl Stream<Item = Result<Event, std::convert::Infallible>>> {
    let snapshot = state.runtime.status().await;
    let recent: Vec<Value> = state
        .runtime
        .events
        .recent()
        .iter()
        .map(|event| json!({"id": event.id, "name": event.name, "payload": redact_value(&event.payload), "at": event.at}))
        .collect();
    let snapshot_data = json!({"status": snapshot, "events": recent});
    let snapshot_event = Event::default()
        .event("snapshot")
        .data(snapshot_data.to_string());
    let rx = state.runtime.events.subscribe();

    let live = stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let data = json!({"id": event.id, "name": event.name, "payload": redact_value(&event.payload), "at": event.at});
                    let sse_event = Event::default()
                        .id(event.id.to_string())
                        .event("runtime")
                        .data(data.to_string());
                    return Some((Ok::<Event, std::convert::Infallible>(sse_event), rx));
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return None,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
            }
        }
    });

    let combined = stream::once(async move { Ok(snapshot_event) }).chain(live);
    Sse::new(combined).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)).text("keepalive"))
}

#[derive(Debug, Deserialize)]
struct ListSessionsQuery {
    limit: Option<usize>,
}

async fn list_sessions(
    State(state): State<Arc<ControlState>>,
    Query(q): Query<ListSessionsQuery>,
) -> Response {
    match state.runtime.session_store.list_index().await {
        Ok(mut entries) => {
            entries.sort_by(|a, b| b.last_activity_at.cmp(&a.last_activity_at));
            if let Some(limit) = q.limit {
                entries.truncate(limit.max(1));
            }
            ok_body(json!({"sessions": entries})).into_response()
        }
        Err(err) => err_response(err),
    }
}

#[derive(Debug, Deserialize)]
struct CreateSessionBody {
    #[serde(rename = "sessionId")]
    session_id: String,
    #[serde(rename = "fromSessionId")]
    from_session_id: Option<String>,
}

/// `POST /sessions` — create a fresh session, optionally carrying a
/// continuity summary over from `fromSessionId` (§4.9). The continuity
/// job runs after the new session is durably saved and is best-effort:
/// its failure is logged but never turns session creation into an error.
async fn create_session(
    State(state): State<Arc<ControlState>>,
    Json(body): Json<CreateSessionBody>,
) -> Response {
    if let Err(err) = validate_session_id(&body.session_id) {
        return err_response(err);
    }
    let record = crate::storage::SessionRecord {
        session_id: body.session_id.clone(),
        active_provider_id: None,
        pending_provider_id: None,
        history: Vec::new(),
        metadata: crate::storage::SessionMetadata {
            created_at: Utc::now(),
            last_activity_at: Utc::now(),
            title: None,
            origin: None,
            provider_route_id: None,
            skill_injection_mode: None,
        },
        revision: 0,
        updated_at: Utc::now(),
    };
    let saved = match state.runtime.session_store.save_session_record(record).await {
        Ok(saved) => saved,
        Err(err) => return err_response(err),
    };

    if let Some(source_id) = body.from_session_id {
        let continuity = state.runtime.continuity.clone();
        let target_id = body.session_id.clone();
        tokio::spawn(async move {
            if let Err(err) = continuity.carry_over(&source_id, &target_id).await {
                warn!(error = %err, source_id, target_id, "continuity carry-over failed");
            }
        });
    }

    ok_body(serde_json::to_value(saved).unwrap_or(Value::Null)).into_response()
}

async fn get_session(
    State(state): State<Arc<ControlState>>,
    AxumPath(id): AxumPath<String>,
) -> Response {
    if let Err(err) = validate_session_id(&id) {
        return err_response(err);
    }
    match state.runtime.session_store.load_session_record(&id).await {
        Ok(Ok(record)) => ok_body(serde_json::to_value(record).unwrap_or(Value::Null)).into_response(),
        Ok(Err(diag)) => err_response(
            GatewayError::InvalidSession(format!("session quarantined: {}", diag.reason)).into(),
        ),
        Err(err) => err_response(err),
    }
}

async fn delete_session(
    State(state): State<Arc<ControlState>>,
    AxumPath(id): AxumPath<String>,
) -> Response {
    if let Err(err) = validate_session_id(&id) {
        return err_response(err);
    }
    match state.runtime.session_store.delete_session(&id).await {
        Ok(()) => ok_body(json!({"deleted": id})).into_response(),
        Err(err) => err_response(err),
    }
}

#[derive(Debug, Deserialize)]
struct RenameSessionBody {
    #[serde(rename = "newId")]
    new_id: String,
    #[serde(default)]
    overwrite: bool,
}

async fn rename_session(
    State(state): State<Arc<ControlState>>,
    AxumPath(id): AxumPath<String>,
    Json(body): Json<RenameSessionBody>,
) -> Response {
    match state
        .runtime
        .session_store
        .rename_session(&id, &body.new_id, body.overwrite)
        .await
    {
        Ok(()) => ok_body(json!({"renamed": {"from": id, "to": body.new_id}})).into_response(),
        Err(err) => err_response(err),
    }
}

/// Load a session record, surfacing quarantine as `invalid_session` the
/// same way `get_session` does, so the three mutation endpoints below
/// share one failure shape.
async fn load_mutable_session(
    state: &ControlState,
    id: &str,
) -> Result<crate::storage::SessionRecord, Response> {
    if let Err(err) = validate_session_id(id) {
        return Err(err_response(err));
    }
    match state.runtime.session_store.load_session_record(id).await {
        Ok(Ok(record)) => Ok(record),
        Ok(Err(diag)) => Err(err_response(
            GatewayError::InvalidSession(format!("session quarantined: {}", diag.reason)).into(),
        )),
        Err(err) => Err(err_response(err)),
    }
}

#[derive(Debug, Deserialize)]
struct SwitchSessionBody {
    channel: String,
    #[serde(rename = "workspaceId")]
    workspace_id: Option<String>,
    #[serde(rename = "accountId")]
    account_id: Option<String>,
    #[serde(rename = "chatId")]
    chat_id: Option<String>,
    #[serde(rename = "userId")]
    user_id: Option<String>,
    #[serde(rename = "threadId")]
    thread_id: Option<String>,
}

/// `POST /sessions/{id}/switch` — rebind the session's channel identity
/// without touching history or revision semantics beyond the normal
/// save-record bump.
async fn switch_session(
    State(state): State<Arc<ControlState>>,
    AxumPath(id): AxumPath<String>,
    Json(body): Json<SwitchSessionBody>,
) -> Response {
    let mut record = match load_mutable_session(&state, &id).await {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    record.metadata.origin = Some(crate::storage::SessionOrigin {
        channel: body.channel,
        workspace_id: body.workspace_id,
        account_id: body.account_id,
        chat_id: body.chat_id,
        user_id: body.user_id,
        thread_id: body.thread_id,
    });
    match state.runtime.session_store.save_session_record(record).await {
        Ok(saved) => ok_body(serde_json::to_value(saved).unwrap_or(Value::Null)).into_response(),
        Err(err) => err_response(err),
    }
}

#[derive(Debug, Deserialize)]
struct SetRouteBody {
    #[serde(rename = "providerRouteId")]
    provider_route_id: Option<String>,
}

/// `POST /sessions/{id}/route` — pin (or clear, when omitted) the
/// provider route this session's future turns are addressed to.
async fn set_session_route(
    State(state): State<Arc<ControlState>>,
    AxumPath(id): AxumPath<String>,
    Json(body): Json<SetRouteBody>,
) -> Response {
    let mut record = match load_mutable_session(&state, &id).await {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    record.metadata.provider_route_id = body.provider_route_id;
    match state.runtime.session_store.save_session_record(record).await {
        Ok(saved) => ok_body(serde_json::to_value(saved).unwrap_or(Value::Null)).into_response(),
        Err(err) => err_response(err),
    }
}

#[derive(Debug, Deserialize)]
struct SetSkillsBody {
    #[serde(rename = "skillInjectionMode")]
    skill_injection_mode: Option<crate::storage::SkillInjectionMode>,
}

/// `POST /sessions/{id}/skills` — override (or clear) the skill
/// injection mode for this session only, leaving the global default
/// untouched.
async fn set_session_skills(
    State(state): State<Arc<ControlState>>,
    AxumPath(id): AxumPath<String>,
    Json(body): Json<SetSkillsBody>,
) -> Response {
    let mut record = match load_mutable_session(&state, &id).await {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    record.metadata.skill_injection_mode = body.skill_injection_mode;
    match state.runtime.session_store.save_session_record(record).await {
        Ok(saved) => ok_body(serde_json::to_value(saved).unwrap_or(Value::Null)).into_response(),
        Err(err) => err_response(err),
    }
}

#[derive(Debug, Deserialize)]
struct RetentionQuery {
    #[serde(rename = "olderThanDays")]
    older_than_days: Option<u32>,
}

async fn retention_candidates(
    State(state): State<Arc<ControlState>>,
    Query(q): Query<RetentionQuery>,
) -> Response {
    let default_days = state.runtime.hot_config.read().await.session_prune_days;
    let days = q.older_than_days.unwrap_or(default_days);
    match state.runtime.session_store.retention_candidates(days).await {
        Ok(candidates) => ok_body(json!({"candidates": candidates})).into_response(),
        Err(err) => err_response(err),
    }
}

#[derive(Debug, Deserialize)]
struct PruneBody {
    #[serde(rename = "olderThanDays")]
    older_than_days: Option<u32>,
    #[serde(rename = "dryRun", default)]
    dry_run: bool,
}

async fn prune_sessions(
    State(state): State<Arc<ControlState>>,
    Json(body): Json<PruneBody>,
) -> Response {
    let default_days = state.runtime.hot_config.read().await.session_prune_days;
    let days = body.older_than_days.unwrap_or(default_days);
    match state.runtime.session_store.prune(days, body.dry_run).await {
        Ok(report) => ok_body(serde_json::to_value(report).unwrap_or(Value::Null)).into_response(),
        Err(err) => err_response(err),
    }
}

#[derive(Debug, Deserialize)]
struct ChatSendBody {
    #[serde(rename = "sessionId")]
    session_id: String,
    text: String,
    #[serde(rename = "providerId")]
    provider_id: Option<String>,
}

/// Submit a turn into the session's orchestration lane. The lane may be
/// running queue/steer/collect semantics — this endpoint only guarantees
/// enqueue, not synchronous completion; poll `/sessions/{id}` or subscribe
/// to `/events` for the result.
async fn chat_send(
    State(state): State<Arc<ControlState>>,
    Json(body): Json<ChatSendBody>,
) -> Response {
    if let Err(err) = validate_session_id(&body.session_id) {
        return err_response(err);
    }
    let input = TurnInput {
        text: body.text,
        provider_id: body.provider_id,
    };
    state
        .runtime
        .lanes
        .ensure_lane(&body.session_id, crate::orchestration::LaneMode::Queue, 16, crate::orchestration::DropPolicy::Old, 0)
        .await;
    match state.runtime.lanes.submit(&body.session_id, input).await {
        Ok(started) => ok_body(json!({"accepted": true, "startedImmediately": started})).into_response(),
        Err(err) => err_response(err.into()),
    }
}

/// Never echoes credential material: only the profile id, provider, and
/// credential *kind* cross the control-plane boundary.
async fn providers_status(State(state): State<Arc<ControlState>>) -> Response {
    let profiles = state.runtime.auth_store.list().await;
    let safe: Vec<Value> = profiles
        .iter()
        .map(|p| {
            json!({
                "id": p.id,
                "provider": p.provider,
                "credentialKind": match &p.credential {
                    crate::auth::Credential::ApiKey { .. } => "api_key",
                    crate::auth::Credential::Token { .. } => "token",
                    crate::auth::Credential::Oauth { .. } => "oauth",
                },
                "createdAt": p.created_at,
                "updatedAt": p.updated_at,
            })
        })
        .collect();
    ok_body(json!({"profiles": safe})).into_response()
}

#[derive(Debug, Deserialize)]
struct ListSubagentsQuery {
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
    limit: Option<usize>,
}

async fn list_subagents(
    State(state): State<Arc<ControlState>>,
    Query(q): Query<ListSubagentsQuery>,
) -> Response {
    let jobs = state
        .runtime
        .subagents
        .list(q.session_id.as_deref(), q.limit.unwrap_or(50))
        .await;
    ok_body(json!({"jobs": jobs})).into_response()
}

#[derive(Debug, Deserialize)]
struct SubmitSubagentBody {
    #[serde(rename = "sessionId")]
    session_id: String,
    input: Value,
    #[serde(rename = "providerId")]
    provider_id: Option<String>,
    #[serde(rename = "timeoutMs")]
    timeout_ms: Option<u64>,
}

async fn submit_subagent(
    State(state): State<Arc<ControlState>>,
    Json(body): Json<SubmitSubagentBody>,
) -> Response {
    let timeout_ms = body.timeout_ms.unwrap_or(state.runtime.config.subagent_timeout_ms);
    match state
        .runtime
        .subagents
        .submit(&body.session_id, body.input, body.provider_id, timeout_ms)
        .await
    {
        Ok(job) => ok_body(serde_json::to_value(job).unwrap_or(Value::Null)).into_response(),
        Err(err) => err_response(err.into()),
    }
}

async fn get_subagent(
    State(state): State<Arc<ControlState>>,
    AxumPath(id): AxumPath<String>,
) -> Response {
    match state.runtime.subagents.get(&id).await {
        Some(job) => ok_body(serde_json::to_value(job).unwrap_or(Value::Null)).into_response(),
        None => err_response(GatewayError::NotFound(format!("subagent job {id}")).into()),
    }
}

async fn cancel_subagent(
    State(state): State<Arc<ControlState>>,
    AxumPath(id): AxumPath<String>,
) -> Response {
    match state.runtime.subagents.cancel(&id).await {
        Ok(()) => ok_body(json!({"cancelled": id})).into_response(),
        Err(err) => err_response(err.into()),
    }
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    limit: Option<usize>,
}

async fn subagent_logs(
    State(state): State<Arc<ControlState>>,
    AxumPath(id): AxumPath<String>,
    Query(q): Query<LogsQuery>,
) -> Response {
    match state.runtime.subagents.tail_logs(&id, q.limit.unwrap_or(200)).await {
        Ok(lines) => ok_body(json!({"lines": lines})).into_response(),
        Err(err) => err_response(err.into()),
    }
}

#[derive(Debug, Deserialize)]
struct RestartBody {
    intent: crate::restart::RestartIntent,
    reason: Option<String>,
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
    #[serde(rename = "providerId")]
    provider_id: Option<String>,
    #[serde(rename = "dryRun", default)]
    dry_run: bool,
}

struct AutoApprove;
#[async_trait::async_trait]
impl crate::restart::ApprovalHook for AutoApprove {
    async fn approve(&self, _request: &crate::restart::RestartRequest) -> bool {
        true
    }
}

/// Mirrors `main.rs`'s CLI checkpoint: best-effort `git status` on the
/// workspace if it's a git repo, and `ok: true` (no checkpoint to take) if
/// it isn't.
struct WorkspaceCheckpoint {
    workspace_dir: std::path::PathBuf,
}
#[async_trait::async_trait]
impl crate::restart::GitCheckpoint for WorkspaceCheckpoint {
    async fn checkpoint(&self) -> crate::restart::GitCheckpointResult {
        match git2::Repository::discover(&self.workspace_dir) {
            Ok(repo) => {
                let ok = repo.statuses(None).is_ok();
                crate::restart::GitCheckpointResult { ok }
            }
            Err(_) => crate::restart::GitCheckpointResult { ok: true },
        }
    }
}

/// `POST /runtime/restart` — the control-plane facing edge of the §4.6
/// restart pipeline (§10.6): honors the caller's `dryRun` and, when
/// executing, runs the same git-checkpoint-then-exit(42) path `drost restart`
/// runs from the CLI.
async fn runtime_restart(
    State(state): State<Arc<ControlState>>,
    Json(body): Json<RestartBody>,
) -> Response {
    let request = crate::restart::RestartRequest {
        intent: body.intent,
        reason: body.reason,
        session_id: body.session_id,
        provider_id: body.provider_id,
        dry_run: body.dry_run,
    };
    let checkpoint = WorkspaceCheckpoint {
        workspace_dir: state.runtime.config.workspace_dir.clone(),
    };
    match state
        .runtime
        .restart
        .request_restart(request, &AutoApprove, &checkpoint, &crate::restart::RealProcessExit)
        .await
    {
        Ok(outcome) => ok_body(serde_json::to_value(outcome).unwrap_or(Value::Null)).into_response(),
        Err(err) => {
            warn!(error = %err, "restart request failed");
            err_response(err.into())
        }
    }
}

/// `POST /backup/create` — snapshot the session store, subagent job
/// logs, and auth/config files into a new `backups/backup-<t>/` subtree.
async fn backup_create(State(state): State<Arc<ControlState>>) -> Response {
    match state.runtime.backup.create().await {
        Ok(summary) => ok_body(serde_json::to_value(summary).unwrap_or(Value::Null)).into_response(),
        Err(err) => err_response(err),
    }
}

#[derive(Debug, Deserialize)]
struct BackupRestoreBody {
    id: String,
}

/// `POST /backup/restore` — overwrite live state from a prior snapshot.
/// Callers are expected to stop the gateway first; this endpoint does not
/// pause in-flight orchestration lanes or subagent jobs itself.
async fn backup_restore(
    State(state): State<Arc<ControlState>>,
    Json(body): Json<BackupRestoreBody>,
) -> Response {
    match state.runtime.backup.restore(&body.id).await {
        Ok(()) => ok_body(json!({"restored": body.id})).into_response(),
        Err(err) => err_response(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_ipv4_is_detected() {
        let addr: SocketAddr = "127.0.0.1:9001".parse().unwrap();
        assert!(is_loopback(&addr));
        let addr: SocketAddr = "10.0.0.5:9001".parse().unwrap();
        assert!(!is_loopback(&addr));
    }

    #[test]
    fn bearer_token_parses_authorization_header() {
        let mut headers = HeaderMap::new();
        headers.insert(axum::http::header::AUTHORIZATION, "Bearer abc123".parse().unwrap());
        assert_eq!(bearer_token(&headers), Some("abc123".to_string()));
    }
}
