pub mod arena;
pub mod config;
pub mod decompose;
pub mod dispatch;
pub mod http;
pub mod merge;
pub mod routing;
pub mod state;

pub use config::{FailurePolicy, FederatorConfig};
pub use state::AppState;

use axum::{Router, routing::get};

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route(
            "/fdsnws/station/1/query",
            get(http::query::station_get).post(http::query::station_post),
        )
        .route("/fdsnws/station/1/version", get(http::query::version))
        .route(
            "/fdsnws/dataselect/1/query",
            get(http::query::dataselect_get).post(http::query::dataselect_post),
        )
        .route("/fdsnws/dataselect/1/version", get(http::query::version))
        .route(
            "/eidaws/wfcatalog/1/query",
            get(http::query::wfcatalog_get).post(http::query::wfcatalog_post),
        )
        .route("/eidaws/wfcatalog/1/version", get(http::query::version))
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
