//! Common test utilities.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, Response, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use tokio::sync::oneshot;
use tower::ServiceExt;

use relay_core::backend::{source_from_channel, source_from_iter, source_from_results};
use relay_core::backend::ModelInfo;
use relay_core::{
    LlmBackend, LlmRequest, RegistryConfig, RelayError, SessionId, SessionRegistry, TokenSource,
};
use relay_daemon::{build_app, AppState};

/// Producer that hands out pre-scripted token sources in order
#[derive(Default)]
pub struct ScriptedBackend {
    scripts: Mutex<VecDeque<TokenSource<String>>>,
    requests: Mutex<Vec<LlmRequest>>,
    unhealthy: AtomicBool,
    gate: Mutex<Option<oneshot::Receiver<()>>>,
}

impl ScriptedBackend {
    pub fn set_unhealthy(&self) {
        self.unhealthy.store(true, Ordering::SeqCst);
    }

    pub fn push(&self, source: TokenSource<String>) {
        self.scripts.lock().unwrap().push_back(source);
    }

    pub fn push_tokens(&self, tokens: &[&str]) {
        self.push(source_from_iter(
            tokens.iter().map(|t| (*t).to_string()).collect::<Vec<_>>(),
        ));
    }

    pub fn push_failing(&self, tokens: &[&str], error: &str) {
        let mut items: Vec<Result<String, RelayError>> =
            tokens.iter().map(|t| Ok((*t).to_string())).collect();
        items.push(Err(RelayError::producer(error)));
        self.push(source_from_results(items));
    }

    /// Script a source fed by the returned sender
    pub fn push_channel(&self) -> tokio::sync::mpsc::Sender<Result<String, RelayError>> {
        let (tx, rx) = tokio::sync::mpsc::channel(16);
        self.push(source_from_channel(rx));
        tx
    }

    /// Park the next `stream_tokens` call until the returned sender fires
    pub fn hold_next(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        *self.gate.lock().unwrap() = Some(rx);
        tx
    }

    pub fn requests(&self) -> Vec<LlmRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl LlmBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn health_check(&self) -> bool {
        !self.unhealthy.load(Ordering::SeqCst)
    }

    async fn stream_tokens(&self, request: &LlmRequest) -> anyhow::Result<TokenSource<String>> {
        self.requests.lock().unwrap().push(request.clone());
        let gate = self.gate.lock().unwrap().take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        self.scripts
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| anyhow::anyhow!("connection refused"))
    }

    async fn list_models(&self) -> anyhow::Result<Vec<ModelInfo>> {
        Ok(Vec::new())
    }
}

pub struct TestApp {
    pub state: AppState,
    pub backend: Arc<ScriptedBackend>,
}

impl TestApp {
    pub fn new() -> Self {
        let backend = Arc::new(ScriptedBackend::default());
        let registry = SessionRegistry::new(RegistryConfig { idle_timeout: None });
        let state = AppState::new(registry, backend.clone(), "test-model");
        Self { state, backend }
    }

    pub fn router(&self) -> Router {
        build_app(self.state.clone())
    }

    pub async fn get(&self, uri: &str) -> Response<Body> {
        self.router()
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    pub async fn post(&self, uri: &str) -> Response<Body> {
        self.router()
            .oneshot(Request::post(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    pub async fn post_json(&self, uri: &str, body: serde_json::Value) -> Response<Body> {
        self.router().oneshot(json_request(uri, &body)).await.unwrap()
    }

    /// Create a session and return its id
    pub async fn create(&self, id: &str) -> SessionId {
        let response = self
            .post_json(
                "/api/v1/sessions",
                serde_json::json!({"prompt": "hi", "session_id": id}),
            )
            .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        SessionId::from(id)
    }

    /// Wait until the registry reports `expected` references
    pub async fn wait_for_refs(&self, id: &SessionId, expected: Option<u32>) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while self.state.registry.ref_count(id).await != expected {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("ref count reached");
    }
}

pub fn json_request(uri: &str, body: &serde_json::Value) -> Request<Body> {
    Request::post(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub async fn body_bytes(response: Response<Body>) -> Vec<u8> {
    response
        .into_body()
        .collect()
        .await
        .unwrap()
        .to_bytes()
        .to_vec()
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}
