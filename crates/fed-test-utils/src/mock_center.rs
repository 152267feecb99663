//! A scriptable in-process FDSN data center.
//!
//! Tests register a [`ScriptedResponse`] per path; the server records every
//! request it sees. `fail_attempts` makes the first N hits of a path return
//! 500 so retry behavior can be exercised; `delay` holds the response to
//! exercise timeouts.

use axum::{
    Router,
    body::Body,
    extract::{Request, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ScriptedResponse {
    pub status: u16,
    pub content_type: String,
    pub body: Vec<u8>,
    /// The first N hits of this path answer 500 regardless of the script.
    pub fail_attempts: u32,
    /// Hold the response this long before answering.
    pub delay: Duration,
}

impl ScriptedResponse {
    pub fn ok(content_type: &str, body: impl Into<Vec<u8>>) -> Self {
        ScriptedResponse {
            status: 200,
            content_type: content_type.to_owned(),
            body: body.into(),
            fail_attempts: 0,
            delay: Duration::ZERO,
        }
    }

    pub fn status(status: u16) -> Self {
        ScriptedResponse {
            status,
            content_type: "text/plain".to_owned(),
            body: Vec::new(),
            fail_attempts: 0,
            delay: Duration::ZERO,
        }
    }

    pub fn with_fail_attempts(mut self, n: u32) -> Self {
        self.fail_attempts = n;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// One request as seen by the mock.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub query: Option<String>,
    pub body: String,
}

#[derive(Default)]
struct Inner {
    scripts: Mutex<HashMap<String, ScriptedResponse>>,
    hits: Mutex<HashMap<String, u32>>,
    requests: Mutex<Vec<RecordedRequest>>,
}

pub struct MockCenter {
    addr: SocketAddr,
    inner: Arc<Inner>,
}

impl MockCenter {
    /// Bind to an ephemeral port and start serving.
    pub async fn start() -> std::io::Result<Self> {
        let inner = Arc::new(Inner::default());
        let router = Router::new()
            .fallback(handle)
            .with_state(Arc::clone(&inner));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });
        Ok(MockCenter { addr, inner })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Full URL for a path on this mock.
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Register the response for a path.
    pub fn script(&self, path: &str, response: ScriptedResponse) {
        self.inner
            .scripts
            .lock()
            .unwrap()
            .insert(path.to_owned(), response);
    }

    /// How many times a path was hit.
    pub fn hits(&self, path: &str) -> u32 {
        *self.inner.hits.lock().unwrap().get(path).unwrap_or(&0)
    }

    /// Everything received so far, in arrival order.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.inner.requests.lock().unwrap().clone()
    }
}

async fn handle(State(inner): State<Arc<Inner>>, request: Request) -> Response {
    let method = request.method().to_string();
    let path = request.uri().path().to_owned();
    let query = request.uri().query().map(str::to_owned);
    let body_bytes = axum::body::to_bytes(request.into_body(), usize::MAX)
        .await
        .unwrap_or_default();

    inner.requests.lock().unwrap().push(RecordedRequest {
        method,
        path: path.clone(),
        query,
        body: String::from_utf8_lossy(&body_bytes).into_owned(),
    });

    let hit = {
        let mut hits = inner.hits.lock().unwrap();
        let count = hits.entry(path.clone()).or_insert(0);
        *count += 1;
        *count
    };

    let script = inner.scripts.lock().unwrap().get(&path).cloned();
    let Some(script) = script else {
        return StatusCode::NOT_FOUND.into_response();
    };

    if hit <= script.fail_attempts {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    if !script.delay.is_zero() {
        tokio::time::sleep(script.delay).await;
    }

    Response::builder()
        .status(script.status)
        .header(header::CONTENT_TYPE, script.content_type)
        .body(Body::from(script.body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}
