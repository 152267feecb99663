pub mod db;
pub mod harvest;
pub mod http;
pub mod repo;
pub mod state;

pub use state::AppState;

use axum::{Router, routing::get};

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route(
            "/eidaws/routing/1/query",
            get(http::routing::query_get).post(http::routing::query_post),
        )
        .route("/eidaws/routing/1/version", get(http::routing::version))
        .route("/healthz", get(health::healthz))
        .route("/readyz", get(health::readyz))
        .with_state(state)
}

mod health {
    use axum::response::IntoResponse;
    pub async fn healthz() -> impl IntoResponse {
        "ok"
    }
    pub async fn readyz() -> impl IntoResponse {
        "ok"
    }
}
