//! A canned routing resolver.
//!
//! Serves `/eidaws/routing/1/query` with a fixed set of route groups in the
//! `post` output format, or 204 when configured with none.

use axum::{
    Router,
    extract::State,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use fdsn_proto::wire::{RouteGroup, render_route_post};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct Inner {
    groups: Mutex<Vec<RouteGroup>>,
}

pub struct MockRouting {
    addr: SocketAddr,
    inner: Arc<Inner>,
}

impl MockRouting {
    pub async fn start() -> std::io::Result<Self> {
        let inner = Arc::new(Inner::default());
        let router = Router::new()
            .route("/eidaws/routing/1/query", get(handle).post(handle))
            .with_state(Arc::clone(&inner));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });
        Ok(MockRouting { addr, inner })
    }

    /// The resolver query URL to hand to the federator.
    pub fn query_url(&self) -> String {
        format!("http://{}/eidaws/routing/1/query", self.addr)
    }

    /// Answer subsequent queries with these groups.
    pub fn set_routes(&self, groups: Vec<RouteGroup>) {
        *self.inner.groups.lock().unwrap() = groups;
    }

    /// Answer subsequent queries with 204.
    pub fn set_no_match(&self) {
        self.inner.groups.lock().unwrap().clear();
    }
}

async fn handle(State(inner): State<Arc<Inner>>) -> Response {
    let groups = inner.groups.lock().unwrap().clone();
    if groups.is_empty() {
        return StatusCode::NO_CONTENT.into_response();
    }
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        render_route_post(&groups),
    )
        .into_response()
}
