//! HTTP relay surface over the adaptive poller.
//!
//! Routes:
//! - `GET  /`                 current token with pattern metadata
//! - `GET  /keys/:provider`   `api_key` / `expires_in` format for remote fetchers
//! - `GET  /stats`            pattern statistics
//! - `POST /force-poll`       immediate out-of-schedule fetch
//! - `GET  /health`           liveness plus token age
//!
//! Auth policy: routes that hand out the credential require the bearer token
//! when one is configured; `/stats` and `/health` stay open for monitoring.
//! Every route is rate limited per peer address.

use anyhow::{Context, Result};
use axum::{
    extract::{ConnectInfo, Path, Request, State},
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use http::{header, StatusCode};
use serde_json::json;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::auth::{AuthGuard, RateLimiter};
use crate::error::RelayError;
use crate::poller::{AdaptivePoller, PollerStats, TokenSnapshot};
use crate::provider::response::MIN_EXPIRES_IN_SECS;

/// Rotation period assumed until the poller has learned one.
pub const NOMINAL_ROTATION_SECS: f64 = 1800.0;

#[derive(Clone)]
pub struct AppState {
    poller: Arc<AdaptivePoller>,
    auth: Option<Arc<AuthGuard>>,
    rate_limiter: Arc<RateLimiter>,
}

impl AppState {
    pub fn new(
        poller: Arc<AdaptivePoller>,
        auth: Option<AuthGuard>,
        rate_limit_per_minute: usize,
    ) -> Self {
        Self {
            poller,
            auth: auth.map(Arc::new),
            rate_limiter: Arc::new(RateLimiter::new(rate_limit_per_minute, 60)),
        }
    }
}

// ── Errors ──────────────────────────────────────────────────────────

struct ApiError(RelayError);

impl From<RelayError> for ApiError {
    fn from(e: RelayError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0 {
            RelayError::NoCredentialYet => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::BAD_GATEWAY,
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

// ── Router ──────────────────────────────────────────────────────────

pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/", get(get_token))
        .route("/keys/:provider", get(get_provider_key))
        .route("/force-poll", post(force_poll))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    let open = Router::new()
        .route("/stats", get(get_stats))
        .route("/health", get(health));

    protected
        .merge(open)
        .layer(middleware::from_fn_with_state(state.clone(), rate_limit))
        .with_state(state)
}

async fn require_auth(State(state): State<AppState>, req: Request, next: Next) -> Response {
    if let Some(guard) = &state.auth {
        let header = req
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok());
        if !guard.validate_header(header) {
            warn!(path = %req.uri().path(), "Request rejected — invalid or missing bearer token");
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "error": "Authentication required — send Authorization: Bearer <token>" })),
            )
                .into_response();
        }
    }
    next.run(req).await
}

async fn rate_limit(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let caller = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "anonymous".into());

    if let Err(retry_after) = state.rate_limiter.check(&caller) {
        warn!(caller = %caller, path = %req.uri().path(), "Rate limited");
        return (
            StatusCode::TOO_MANY_REQUESTS,
            [(header::RETRY_AFTER, retry_after.to_string())],
            Json(json!({ "error": format!("Rate limited — retry after {} seconds", retry_after) })),
        )
            .into_response();
    }
    next.run(req).await
}

// ── Handlers ────────────────────────────────────────────────────────

async fn get_token(State(state): State<AppState>) -> Result<Json<TokenSnapshot>, ApiError> {
    Ok(Json(state.poller.snapshot()?))
}

/// Remaining lifetime for a key of the given age: the learned cadence once
/// the pattern is trusted, the nominal 30 minutes before that.
pub fn remaining_lifetime(snapshot: &TokenSnapshot) -> f64 {
    let cadence = snapshot.learned_interval.unwrap_or(NOMINAL_ROTATION_SECS);
    (cadence - snapshot.age_seconds).max(MIN_EXPIRES_IN_SECS)
}

async fn get_provider_key(
    State(state): State<AppState>,
    Path(provider): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let snap = state.poller.snapshot()?;

    Ok(Json(json!({
        "api_key": snap.token,
        "expires_in": remaining_lifetime(&snap),
        "provider": provider,
        "type": "rotating_token",
        "metadata": {
            "confidence_level": snap.confidence_level,
            "age_seconds": snap.age_seconds,
            "last_refresh": snap.last_refresh,
            "polling_strategy": snap.polling_strategy.as_str(),
        }
    })))
}

async fn get_stats(State(state): State<AppState>) -> Json<PollerStats> {
    Json(state.poller.stats())
}

async fn force_poll(State(state): State<AppState>) -> Response {
    match state.poller.force_refresh().await {
        Ok(token) => Json(json!({ "api_key": token, "forced": true })).into_response(),
        Err(e) => (StatusCode::BAD_GATEWAY, Json(json!({ "error": e.to_string() }))).into_response(),
    }
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    match state.poller.snapshot() {
        Ok(snap) => Json(json!({
            "status": "healthy",
            "has_token": !snap.token.is_empty(),
            "token_age": snap.age_seconds,
            "last_refresh": snap.last_refresh,
        })),
        Err(e) => Json(json!({
            "status": "unhealthy",
            "error": e.to_string(),
        })),
    }
}

// ── Server ──────────────────────────────────────────────────────────

pub struct Server {
    bind: String,
    state: AppState,
}

impl Server {
    pub fn new(bind: impl Into<String>, state: AppState) -> Self {
        Self {
            bind: bind.into(),
            state,
        }
    }

    /// Serve until `shutdown` resolves.
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(&self.bind)
            .await
            .with_context(|| format!("Failed to bind {}", self.bind))?;
        info!(addr = %listener.local_addr()?, "🔑 KeyRelay server listening");

        axum::serve(
            listener,
            router(self.state).into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .await
        .context("HTTP server failed")?;

        Ok(())
    }
}
