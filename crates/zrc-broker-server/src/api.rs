use axum::{
    extract::{rejection::JsonRejection, ConnectInfo, Path, Query, Request, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Instant};
use tracing::{error, warn};

use zrc_broker::errors::BrokerError;
use zrc_broker::token::SessionClaims;
use zrc_broker::{
    CreateSessionRequest, PolicySnapshot, SessionBroker, SessionStatus, SignalRole, SignalType,
};

use crate::{
    auth::{extract_bearer_token, OperatorKeys},
    metrics::BrokerMetrics,
    rate_limit::{RateLimiter, RequestClass},
};

#[derive(Clone)]
pub struct AppState {
    pub broker: Arc<SessionBroker>,
    pub operator_keys: OperatorKeys,
    pub rate_limiter: RateLimiter,
    pub metrics: Arc<BrokerMetrics>,
    pub started_at: Instant,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route(
            "/v1/signal",
            post(post_signal).get(get_signal).delete(delete_signal),
        )
        .route("/v1/agent/poll", get(agent_poll))
        .route("/v1/sessions", post(create_session))
        .route("/v1/sessions/:id", get(get_session))
        .route("/v1/sessions/:id/status", post(update_session_status))
        .route("/v1/sessions/:id/token", post(refresh_session_token))
        .route("/health", get(get_health))
        .route("/metrics", get(get_metrics))
        .layer(middleware::from_fn_with_state(state.clone(), track_requests))
        .with_state(state)
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug)]
pub enum ApiError {
    Broker(BrokerError),
    RateLimited { retry_after: u64 },
    BadRequest(String),
}

impl From<BrokerError> for ApiError {
    fn from(e: BrokerError) -> Self {
        ApiError::Broker(e)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

fn broker_status(e: &BrokerError) -> StatusCode {
    match e {
        BrokerError::AuthenticationFailure => StatusCode::UNAUTHORIZED,
        BrokerError::AuthorizationFailure => StatusCode::FORBIDDEN,
        BrokerError::NotFound(_) => StatusCode::NOT_FOUND,
        BrokerError::InvalidTransition(_) | BrokerError::Conflict(_) => StatusCode::CONFLICT,
        BrokerError::Validation(_) => StatusCode::BAD_REQUEST,
        BrokerError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
        BrokerError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Broker(e) => {
                let status = broker_status(&e);
                if status == StatusCode::INTERNAL_SERVER_ERROR {
                    error!(code = e.code(), error = %e, "request failed");
                } else {
                    warn!(code = e.code(), status = status.as_u16(), "request rejected");
                }
                (
                    status,
                    Json(json!({ "success": false, "error": e.public_message() })),
                )
                    .into_response()
            }
            ApiError::RateLimited { retry_after } => {
                let mut response = (
                    StatusCode::TOO_MANY_REQUESTS,
                    Json(json!({ "success": false, "error": "rate limit exceeded" })),
                )
                    .into_response();
                response
                    .headers_mut()
                    .insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
                response
            }
            ApiError::BadRequest(msg) => (
                StatusCode::BAD_REQUEST,
                Json(json!({ "success": false, "error": msg })),
            )
                .into_response(),
        }
    }
}

async fn rate_limit(state: &AppState, addr: SocketAddr, class: RequestClass) -> Result<(), ApiError> {
    state
        .rate_limiter
        .check(addr.ip(), class)
        .await
        .map_err(|retry_after| {
            warn!(ip = %addr.ip(), class = class.as_str(), "rate limit exceeded");
            ApiError::RateLimited { retry_after }
        })
}

fn bearer_claims(
    state: &AppState,
    headers: &HeaderMap,
    session_id: &str,
) -> Result<SessionClaims, ApiError> {
    let token = extract_bearer_token(headers.get(header::AUTHORIZATION))
        .ok_or(ApiError::Broker(BrokerError::AuthenticationFailure))?;
    Ok(state.broker.verify_token_for_session(token, session_id)?)
}

// ============================================================================
// Middleware
// ============================================================================

/// Latency and status accounting for every request.
pub async fn track_requests(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let start = Instant::now();
    let response = next.run(req).await;

    state
        .metrics
        .request_latency
        .observe(start.elapsed().as_secs_f64());

    let status = response.status();
    if status.is_client_error() || status.is_server_error() {
        state.metrics.error_counts.inc();
    }
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => state.metrics.auth_failures.inc(),
        StatusCode::TOO_MANY_REQUESTS => state.metrics.rate_limit_hits.inc(),
        _ => {}
    }

    response
}

// ============================================================================
// Signalling relay
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostSignalBody {
    pub session_id: String,
    pub token: String,
    #[serde(rename = "type")]
    pub signal_type: SignalType,
    pub data: Value,
    pub sender: SignalRole,
}

// POST /v1/signal
pub async fn post_signal(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    body: Result<Json<PostSignalBody>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    rate_limit(&state, addr, RequestClass::Signal).await?;
    let Json(body) = body?;

    let claims = state
        .broker
        .verify_token_for_session(&body.token, &body.session_id)?;
    if claims.role != body.sender {
        return Err(BrokerError::AuthorizationFailure.into());
    }

    let receipt = state
        .broker
        .relay()
        .post(&body.session_id, body.signal_type, body.data, body.sender)
        .await
        .map_err(BrokerError::from)?;

    state.metrics.signals_posted.inc();
    state.metrics.signals_evicted.inc_by(receipt.evicted as f64);

    Ok(Json(json!({ "success": true, "timestamp": receipt.timestamp })))
}

// GET /v1/signal?sessionId=..&token=..&since=0&role=agent
pub async fn get_signal(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Value>, ApiError> {
    rate_limit(&state, addr, RequestClass::Signal).await?;

    let role: SignalRole = params
        .get("role")
        .ok_or_else(|| ApiError::BadRequest("missing role".to_string()))?
        .parse()
        .map_err(ApiError::BadRequest)?;
    let since: u64 = match params.get("since") {
        Some(raw) if !raw.is_empty() => raw
            .parse()
            .map_err(|_| ApiError::BadRequest("invalid since".to_string()))?,
        _ => 0,
    };

    let session_id = params.get("sessionId").map(String::as_str).unwrap_or_default();
    let token = params.get("token").map(String::as_str).unwrap_or_default();
    let claims = state.broker.verify_token_for_session(token, session_id)?;
    if claims.role != role {
        return Err(BrokerError::AuthorizationFailure.into());
    }

    let messages = state
        .broker
        .relay()
        .poll(session_id, since, role)
        .await
        .map_err(BrokerError::from)?;
    state.metrics.signals_delivered.inc_by(messages.len() as f64);

    Ok(Json(json!({ "success": true, "data": messages })))
}

// DELETE /v1/signal?sessionId=..&token=..
pub async fn delete_signal(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Value>, ApiError> {
    rate_limit(&state, addr, RequestClass::Signal).await?;

    let session_id = params.get("sessionId").map(String::as_str).unwrap_or_default();
    let token = params.get("token").map(String::as_str).unwrap_or_default();
    state.broker.verify_token_for_session(token, session_id)?;

    state
        .broker
        .relay()
        .clear(session_id)
        .await
        .map_err(BrokerError::from)?;

    Ok(Json(json!({ "success": true })))
}

// ============================================================================
// Agent poll
// ============================================================================

// GET /v1/agent/poll
pub async fn agent_poll(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    rate_limit(&state, addr, RequestClass::AgentPoll).await?;
    state.metrics.agent_polls.inc();

    let credential = extract_bearer_token(headers.get(header::AUTHORIZATION)).unwrap_or_default();
    let source = addr.ip().to_string();

    match state.broker.agent_poll(credential, Some(&source)).await? {
        Some(assignment) => Ok((StatusCode::OK, Json(assignment)).into_response()),
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

// ============================================================================
// Sessions
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionBody {
    pub asset_id: String,
    #[serde(default)]
    pub operator_name: Option<String>,
    #[serde(default)]
    pub policy: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateStatusBody {
    pub status: SessionStatus,
}

// POST /v1/sessions
pub async fn create_session(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Result<Json<CreateSessionBody>, JsonRejection>,
) -> Result<Response, ApiError> {
    rate_limit(&state, addr, RequestClass::Operator).await?;

    let key = extract_bearer_token(headers.get(header::AUTHORIZATION)).unwrap_or_default();
    let Some(operator) = state.operator_keys.authenticate(key) else {
        let source = addr.ip().to_string();
        if let Err(e) = state
            .broker
            .audit()
            .authentication_failed("operator_api", "invalid api key", Some(&source))
            .await
        {
            warn!(error = %e, "failed to record authentication_failed audit event");
        }
        return Err(BrokerError::AuthenticationFailure.into());
    };
    let Json(body) = body?;

    let created = state
        .broker
        .create_session(CreateSessionRequest {
            org_id: operator.org_id,
            asset_id: body.asset_id,
            operator_user_id: operator.user_id,
            operator_name: body.operator_name.unwrap_or(operator.user_name),
            policy: body.policy.map(PolicySnapshot::new).unwrap_or_default(),
        })
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "success": true,
            "session": created.session,
            "token": created.token,
            "iceServers": created.ice_servers,
        })),
    )
        .into_response())
}

// GET /v1/sessions/:id
pub async fn get_session(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    rate_limit(&state, addr, RequestClass::Operator).await?;
    let claims = bearer_claims(&state, &headers, &session_id)?;

    let session = state.broker.get_session(&claims.org, &session_id).await?;
    Ok(Json(json!({ "success": true, "session": session })))
}

// POST /v1/sessions/:id/status
pub async fn update_session_status(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    body: Result<Json<UpdateStatusBody>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    rate_limit(&state, addr, RequestClass::Operator).await?;
    let claims = bearer_claims(&state, &headers, &session_id)?;
    let Json(body) = body?;

    let session = state
        .broker
        .transition(&session_id, &claims.org, body.status)
        .await?;
    Ok(Json(json!({ "success": true, "session": session })))
}

// POST /v1/sessions/:id/token
pub async fn refresh_session_token(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    rate_limit(&state, addr, RequestClass::Operator).await?;
    let claims = bearer_claims(&state, &headers, &session_id)?;

    let (token, refreshed) = state.broker.refresh_token(&claims).await?;
    Ok(Json(json!({
        "success": true,
        "token": token,
        "expiresAt": refreshed.exp,
    })))
}

// ============================================================================
// Operations
// ============================================================================

// GET /health
pub async fn get_health(State(state): State<AppState>) -> Response {
    let response = json!({
        "status": "healthy",
        "uptime_seconds": state.started_at.elapsed().as_secs_f64(),
        "version": env!("CARGO_PKG_VERSION"),
    });

    (StatusCode::OK, Json(response)).into_response()
}

// GET /metrics
pub async fn get_metrics(State(state): State<AppState>) -> Response {
    state.metrics.observe_relay(state.broker.relay().stats());
    let prometheus = state.metrics.export_prometheus();
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        prometheus,
    )
        .into_response()
}
