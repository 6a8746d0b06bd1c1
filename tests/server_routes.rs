use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::Router;
use chrono::Utc;
use http::{header, Request, StatusCode};
use keyrelay::auth::AuthGuard;
use keyrelay::server::{router, AppState};
use keyrelay::{AdaptivePoller, CredentialSource, ManualClock, RelayError, Result};
use serde_json::Value;
use tower::ServiceExt;

/// Returns `tok-<n>` where n bumps on every `rotate()`.
struct StepSource {
    generation: AtomicUsize,
    fail: bool,
}

#[async_trait]
impl CredentialSource for StepSource {
    async fn fetch(&self) -> Result<String> {
        if self.fail {
            return Err(RelayError::CredentialSource("exit status 1".into()));
        }
        Ok(format!("tok-{}", self.generation.load(Ordering::SeqCst)))
    }
}

struct Harness {
    poller: Arc<AdaptivePoller>,
    clock: Arc<ManualClock>,
    source: Arc<StepSource>,
}

impl Harness {
    fn new(fail: bool) -> Self {
        let source = Arc::new(StepSource {
            generation: AtomicUsize::new(0),
            fail,
        });
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let poller = Arc::new(AdaptivePoller::with_clock(source.clone(), clock.clone()));
        Self {
            poller,
            clock,
            source,
        }
    }

    fn app(&self, token: Option<&str>, rate_limit: usize) -> Router {
        let auth = token.map(AuthGuard::new);
        router(AppState::new(self.poller.clone(), auth, rate_limit))
    }

    fn rotate(&self) {
        self.source.generation.fetch_add(1, Ordering::SeqCst);
    }
}

async fn call(app: Router, method: &str, uri: &str, bearer: Option<&str>) -> (StatusCode, Value) {
    let mut req = Request::builder().method(method).uri(uri);
    if let Some(token) = bearer {
        req = req.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }
    let resp = app.oneshot(req.body(Body::empty()).unwrap()).await.unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

#[tokio::test]
async fn test_token_route_unavailable_before_first_fetch() {
    let h = Harness::new(false);
    let (status, body) = call(h.app(None, 100), "GET", "/", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(body["error"].as_str().unwrap().contains("no credential"));

    let (status, _) = call(h.app(None, 100), "GET", "/keys/anthropic", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_token_route_returns_snapshot() {
    let h = Harness::new(false);
    h.poller.poll_once().await.unwrap();
    h.clock.advance(42.0);

    let (status, body) = call(h.app(None, 100), "GET", "/", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["token"], "tok-0");
    assert_eq!(body["confidence_level"], 0);
    assert_eq!(body["polling_interval"], 30);
    assert!((body["age_seconds"].as_f64().unwrap() - 42.0).abs() < 1e-6);
    assert!(body["learned_interval"].is_null());
    assert_eq!(body["polling_strategy"], "discovery");
}

#[tokio::test]
async fn test_provider_route_uses_nominal_cadence_before_confidence() {
    let h = Harness::new(false);
    h.poller.poll_once().await.unwrap();
    h.clock.advance(300.0);

    let (status, body) = call(h.app(None, 100), "GET", "/keys/anthropic", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["api_key"], "tok-0");
    assert_eq!(body["provider"], "anthropic");
    assert_eq!(body["type"], "rotating_token");
    assert_eq!(body["expires_in"].as_f64().unwrap(), 1500.0);
    assert_eq!(body["metadata"]["polling_strategy"], "discovery");
}

#[tokio::test]
async fn test_provider_route_uses_learned_cadence() {
    let h = Harness::new(false);
    h.poller.poll_once().await.unwrap();
    for _ in 0..3 {
        h.clock.advance(600.0);
        h.rotate();
        h.poller.poll_once().await.unwrap();
    }
    h.clock.advance(200.0);

    let (status, body) = call(h.app(None, 100), "GET", "/keys/anthropic", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["api_key"], "tok-3");
    assert_eq!(body["expires_in"].as_f64().unwrap(), 400.0);
    assert_eq!(body["metadata"]["confidence_level"], 3);
    assert_eq!(body["metadata"]["polling_strategy"], "adaptive");

    let (_, body) = call(h.app(None, 100), "GET", "/", None).await;
    assert_eq!(body["learned_interval"].as_f64().unwrap(), 600.0);
}

#[tokio::test]
async fn test_credential_routes_require_bearer_when_configured() {
    let h = Harness::new(false);
    h.poller.poll_once().await.unwrap();

    let (status, _) = call(h.app(Some("s3cret"), 100), "GET", "/", None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let (status, _) = call(h.app(Some("s3cret"), 100), "GET", "/keys/x", Some("wrong")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let (status, _) = call(h.app(Some("s3cret"), 100), "POST", "/force-poll", None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = call(h.app(Some("s3cret"), 100), "GET", "/", Some("s3cret")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["token"], "tok-0");
}

#[tokio::test]
async fn test_monitoring_routes_stay_open() {
    let h = Harness::new(false);

    let (status, body) = call(h.app(Some("s3cret"), 100), "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "unhealthy");

    let (status, body) = call(h.app(Some("s3cret"), 100), "GET", "/stats", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["pattern_confidence"], 0);
    assert_eq!(body["current_polling_strategy"], "discovery");

    h.poller.poll_once().await.unwrap();
    let (_, body) = call(h.app(Some("s3cret"), 100), "GET", "/health", None).await;
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["has_token"], true);
}

#[tokio::test]
async fn test_force_poll_records_rotation() {
    let h = Harness::new(false);
    h.poller.poll_once().await.unwrap();
    h.clock.advance(90.0);
    h.rotate();

    let (status, body) = call(h.app(None, 100), "POST", "/force-poll", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["api_key"], "tok-1");
    assert_eq!(body["forced"], true);
    assert_eq!(h.poller.snapshot().unwrap().refresh_intervals, vec![90]);
}

#[tokio::test]
async fn test_force_poll_failure_is_bad_gateway() {
    let h = Harness::new(true);
    let (status, body) = call(h.app(None, 100), "POST", "/force-poll", None).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert!(body["error"].as_str().unwrap().contains("exit status 1"));
}

#[tokio::test]
async fn test_rate_limit_returns_retry_after() {
    let h = Harness::new(false);
    let app = h.app(None, 2);

    for _ in 0..2 {
        let (status, _) = call(app.clone(), "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
    }

    let resp = app
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    let retry: u64 = resp.headers()[header::RETRY_AFTER]
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!((1..=60).contains(&retry));
}
