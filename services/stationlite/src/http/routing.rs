//! `/eidaws/routing/1/query` — the resolver surface over the catalog.
//!
//! GET carries the selector vocabulary plus `service` and `format`;
//! POST carries `service=`/`format=` header lines plus one epoch per line.
//! No matching route yields 204 with an empty body.

use crate::http::response::{bad_request, internal_error, no_content};
use crate::repo::resolve;
use crate::state::AppState;
use axum::{
    extract::{Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use fdsn_proto::service::{OutputFormat, Service};
use fdsn_proto::stream::StreamEpoch;
use fdsn_proto::wire::{self, RouteGroup};
use fdsn_proto::parse::parse_selectors;
use tracing::{debug, warn};

pub async fn version() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        concat!(env!("CARGO_PKG_VERSION"), "\n"),
    )
}

/// `GET /eidaws/routing/1/query`
pub async fn query_get(
    State(state): State<AppState>,
    Query(pairs): Query<Vec<(String, String)>>,
) -> Response {
    let mut service = Service::Dataselect;
    let mut format = OutputFormat::Post;
    let mut selector_pairs = Vec::with_capacity(pairs.len());

    for (name, value) in pairs {
        match name.trim().to_lowercase().as_str() {
            "service" => match value.trim().parse() {
                Ok(s) => service = s,
                Err(e) => return bad_request(e.to_string()),
            },
            "format" => match value.trim().parse() {
                Ok(f) => format = f,
                Err(e) => return bad_request(e.to_string()),
            },
            _ => selector_pairs.push((name, value)),
        }
    }

    let selectors = match parse_selectors(&selector_pairs) {
        Ok(s) => s,
        Err(e) => return bad_request(e.to_string()),
    };

    respond(&state, service, format, &selectors).await
}

/// `POST /eidaws/routing/1/query`
pub async fn query_post(State(state): State<AppState>, body: String) -> Response {
    let mut service = Service::Dataselect;
    let mut format = OutputFormat::Post;
    let mut selectors: Vec<StreamEpoch> = Vec::new();

    for (idx, raw) in body.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        if let Some((name, value)) = line.split_once('=') {
            match name.trim().to_lowercase().as_str() {
                "service" => match value.trim().parse() {
                    Ok(s) => service = s,
                    Err(e) => return bad_request(e.to_string()),
                },
                "format" => match value.trim().parse() {
                    Ok(f) => format = f,
                    Err(e) => return bad_request(e.to_string()),
                },
                other => return bad_request(format!("unknown parameter '{other}'")),
            }
            continue;
        }
        match StreamEpoch::parse_post_line(line) {
            Ok(e) => selectors.push(e),
            Err(e) => return bad_request(format!("line {}: {}", idx + 1, e)),
        }
    }

    if selectors.is_empty() {
        return bad_request("request names no stream epochs");
    }

    respond(&state, service, format, &selectors).await
}

async fn respond(
    state: &AppState,
    service: Service,
    format: OutputFormat,
    selectors: &[StreamEpoch],
) -> Response {
    let groups = match resolve::resolve(&state.pool, selectors, service).await {
        Ok(g) => g,
        Err(e) => {
            warn!(error = %e, "resolve query failed");
            return internal_error(e);
        }
    };
    debug!(
        service = %service,
        selectors = selectors.len(),
        endpoints = groups.len(),
        "resolved"
    );

    if groups.is_empty() {
        return no_content();
    }
    render(format, &groups)
}

fn render(format: OutputFormat, groups: &[RouteGroup]) -> Response {
    let (content_type, body) = match format {
        OutputFormat::Post => ("text/plain; charset=utf-8", wire::render_route_post(groups)),
        OutputFormat::Get => ("text/plain; charset=utf-8", wire::render_route_get(groups)),
        OutputFormat::Json => ("application/json", wire::render_route_json(groups)),
    };
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, content_type)],
        body,
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn groups() -> Vec<RouteGroup> {
        vec![RouteGroup {
            url: "http://eth.example/fdsnws/dataselect/1/query".to_owned(),
            epochs: vec![
                StreamEpoch::new("CH", "AAA", "", "HHZ").with_window(
                    Some(Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap()),
                    Some(Utc.with_ymd_and_hms(2020, 1, 2, 0, 0, 0).unwrap()),
                ),
            ],
        }]
    }

    #[test]
    fn post_format_is_text_plain() {
        let response = render(OutputFormat::Post, &groups());
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/plain; charset=utf-8"
        );
    }

    #[test]
    fn json_format_is_application_json() {
        let response = render(OutputFormat::Json, &groups());
        assert_eq!(response.headers()[header::CONTENT_TYPE], "application/json");
    }
}
