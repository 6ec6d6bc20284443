//! Recording stub HTTP server for integration tests
//!
//! Stands in for the ingress and authentication backends: telemetry POSTs
//! are recorded (params, headers, body, arrival time) and answered with a
//! programmable status sequence (204 once the sequence is exhausted); the
//! auth endpoints hand out counted tokens so tests can assert exactly how
//! many logins and token fetches happened.

#![allow(dead_code)] // each test binary uses a different subset

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Clone, Debug)]
pub struct RecordedRequest {
    pub params: HashMap<String, String>,
    pub authorization: Option<String>,
    pub content_encoding: Option<String>,
    pub body: Vec<u8>,
    pub at: Instant,
    pub status: u16,
}

#[derive(Default)]
pub struct ServerState {
    pub telemetry: Mutex<Vec<RecordedRequest>>,
    pub statuses: Mutex<VecDeque<u16>>,
    pub logins: AtomicUsize,
    pub access_tokens: AtomicUsize,
    pub refreshes: AtomicUsize,
    pub logouts: AtomicUsize,
    pub api_calls: Mutex<Vec<Option<String>>>,
}

pub struct StubServer {
    pub state: Arc<ServerState>,
    pub addr: SocketAddr,
}

static INIT_TRACING: std::sync::Once = std::sync::Once::new();

pub async fn start() -> StubServer {
    INIT_TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
    let state = Arc::new(ServerState::default());
    let app = Router::new()
        .route("/telemetry", post(ingest))
        .route("/auth/login", post(login))
        .route("/auth/accesstoken", get(access_token))
        .route("/auth/refreshtoken", get(refresh_token))
        .route("/auth/logout", post(logout))
        .route("/v1/ping", get(ping))
        .with_state(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind stub server");
    let addr = listener.local_addr().expect("stub server addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    StubServer { state, addr }
}

impl StubServer {
    pub fn telemetry_url(&self) -> String {
        format!("http://{}/telemetry", self.addr)
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Queue the statuses the ingress endpoint will answer with, in order.
    /// Once the queue runs dry every request gets 204.
    pub fn push_statuses(&self, statuses: &[u16]) {
        self.state.statuses.lock().extend(statuses.iter().copied());
    }

    pub fn telemetry_requests(&self) -> Vec<RecordedRequest> {
        self.state.telemetry.lock().clone()
    }

    pub fn telemetry_count(&self) -> usize {
        self.state.telemetry.lock().len()
    }

    pub async fn wait_for_telemetry(&self, count: usize, timeout: std::time::Duration) {
        let deadline = Instant::now() + timeout;
        while self.telemetry_count() < count {
            assert!(
                Instant::now() < deadline,
                "timed out waiting for {count} telemetry requests, saw {}",
                self.telemetry_count()
            );
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }
}

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

async fn ingest(
    State(state): State<Arc<ServerState>>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let status = state.statuses.lock().pop_front().unwrap_or(204);
    state.telemetry.lock().push(RecordedRequest {
        params,
        authorization: header(&headers, "authorization"),
        content_encoding: header(&headers, "content-encoding"),
        body: body.to_vec(),
        at: Instant::now(),
        status,
    });
    StatusCode::from_u16(status).unwrap_or(StatusCode::NO_CONTENT)
}

async fn login(
    State(state): State<Arc<ServerState>>,
    Json(_credentials): Json<serde_json::Value>,
) -> (StatusCode, String) {
    let n = state.logins.fetch_add(1, Ordering::SeqCst) + 1;
    (StatusCode::OK, format!("refresh-{n}"))
}

async fn access_token(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
) -> (StatusCode, String) {
    if header(&headers, "authorization")
        .map(|h| h.starts_with("Bearer ") && h.contains("refresh-"))
        != Some(true)
    {
        return (StatusCode::UNAUTHORIZED, "missing refresh token".to_string());
    }
    let n = state.access_tokens.fetch_add(1, Ordering::SeqCst) + 1;
    (StatusCode::OK, format!("access-{n}"))
}

async fn refresh_token(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
) -> (StatusCode, String) {
    if header(&headers, "authorization")
        .map(|h| h.starts_with("Bearer ") && h.contains("refresh-"))
        != Some(true)
    {
        return (StatusCode::UNAUTHORIZED, "missing refresh token".to_string());
    }
    let n = state.refreshes.fetch_add(1, Ordering::SeqCst) + 1;
    (StatusCode::OK, format!("rotated-refresh-{n}"))
}

async fn logout(State(state): State<Arc<ServerState>>) -> StatusCode {
    state.logouts.fetch_add(1, Ordering::SeqCst);
    StatusCode::NO_CONTENT
}

async fn ping(State(state): State<Arc<ServerState>>, headers: HeaderMap) -> (StatusCode, String) {
    state.api_calls.lock().push(header(&headers, "authorization"));
    (StatusCode::OK, "pong".to_string())
}
