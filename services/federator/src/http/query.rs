//! The federated query surface.
//!
//! One driver runs every request: parse → resolve routes → decompose →
//! dispatch under the job's arena → evaluate the failure policy → stream
//! the merged body. Status mapping: 400 client input, 204 nothing matched
//! or nothing returned, 502 upstream failure surfaced, 503 job deadline,
//! 500 internal.

use crate::decompose;
use crate::dispatch::{self, CompletedPart, PartState};
use crate::http::response::{
    bad_gateway, bad_request, internal_error, no_content, service_unavailable,
};
use crate::merge;
use crate::state::AppState;
use axum::{
    body::Body,
    extract::{Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use fdsn_proto::parse::{self, FdsnRequest};
use fdsn_proto::service::Service;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{info, warn};

const ERRORS_HEADER: &str = "x-federator-errors";
const FEDERATED_BY: &str = concat!("federator/", env!("CARGO_PKG_VERSION"));

pub async fn version() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        concat!(env!("CARGO_PKG_VERSION"), "\n"),
    )
}

// ---------------------------------------------------------------------------
// Handlers (one pair per service)
// ---------------------------------------------------------------------------

pub async fn station_get(
    State(state): State<AppState>,
    Query(pairs): Query<Vec<(String, String)>>,
) -> Response {
    run(state, Service::Station, Input::Get(pairs)).await
}

pub async fn station_post(State(state): State<AppState>, body: String) -> Response {
    run(state, Service::Station, Input::Post(body)).await
}

pub async fn dataselect_get(
    State(state): State<AppState>,
    Query(pairs): Query<Vec<(String, String)>>,
) -> Response {
    run(state, Service::Dataselect, Input::Get(pairs)).await
}

pub async fn dataselect_post(State(state): State<AppState>, body: String) -> Response {
    run(state, Service::Dataselect, Input::Post(body)).await
}

pub async fn wfcatalog_get(
    State(state): State<AppState>,
    Query(pairs): Query<Vec<(String, String)>>,
) -> Response {
    run(state, Service::Wfcatalog, Input::Get(pairs)).await
}

pub async fn wfcatalog_post(State(state): State<AppState>, body: String) -> Response {
    run(state, Service::Wfcatalog, Input::Post(body)).await
}

enum Input {
    Get(Vec<(String, String)>),
    Post(String),
}

// ---------------------------------------------------------------------------
// Job driver
// ---------------------------------------------------------------------------

async fn run(state: AppState, service: Service, input: Input) -> Response {
    let original_post = matches!(input, Input::Post(_));
    let parsed = match &input {
        Input::Get(pairs) => parse::parse_get(service, pairs),
        Input::Post(body) => parse::parse_post(service, body),
    };
    let request = match parsed {
        Ok(request) => request,
        Err(e) => return bad_request(e.to_string()),
    };

    let groups = match state.routing.resolve(&request).await {
        Ok(groups) => groups,
        Err(e) => {
            warn!(error = %e, "routing resolution failed");
            return internal_error(e);
        }
    };
    if groups.is_empty() {
        return no_content();
    }

    let subrequests = decompose::decompose(&groups, &request, original_post, &state.cfg);
    info!(
        service = %service,
        endpoints = groups.len(),
        subrequests = subrequests.len(),
        "job admitted"
    );

    let job = match state.arena.new_job() {
        Ok(job) => Arc::new(job),
        Err(e) => return internal_error(format!("spool arena: {e}")),
    };

    let parts = dispatch::run_job(
        state.http.clone(),
        Arc::clone(&state.limits),
        Arc::clone(&job),
        subrequests,
        Arc::clone(&state.cfg),
    )
    .await;

    finish(&state, service, &request, job, parts)
}

fn finish(
    state: &AppState,
    service: Service,
    request: &FdsnRequest,
    job: Arc<crate::arena::JobArena>,
    parts: Vec<CompletedPart>,
) -> Response {
    let failures: Vec<&CompletedPart> =
        parts.iter().filter(|p| !p.state.is_success()).collect();

    if state.cfg.failure_policy == crate::config::FailurePolicy::AllOrNothing
        && !failures.is_empty()
    {
        job.cleanup();
        return failure_response(&failures);
    }

    let spools = merge::ok_spools(&parts);
    if spools.is_empty() {
        job.cleanup();
        if failures.is_empty() {
            // Every part was an empty success.
            return no_content();
        }
        if parts.iter().any(|p| p.state.is_success()) {
            // Empty successes next to failures: nothing to merge.
            return with_diagnostics(no_content(), state, &failures);
        }
        return failure_response(&failures);
    }

    let kind = merge::merge_kind(service, &request.options);
    let stream = merge::merged_stream(kind, spools, job);

    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, merge::content_type(kind));
    if !failures.is_empty() {
        builder = builder.header(ERRORS_HEADER, failure_summary(&failures));
    }
    match builder.body(Body::from_stream(stream)) {
        Ok(response) => with_diagnostics(response, state, &[]),
        Err(e) => internal_error(e),
    }
}

/// Attach the identification and cache headers, plus the per-endpoint
/// diagnostics when `failures` is non-empty.
fn with_diagnostics(
    mut response: Response,
    state: &AppState,
    failures: &[&CompletedPart],
) -> Response {
    let headers = response.headers_mut();
    if let Ok(value) = FEDERATED_BY.parse() {
        headers.insert("x-federated-by", value);
    }
    if let Some(cache_control) = &state.cfg.cache_control {
        if let Ok(value) = cache_control.parse() {
            headers.insert(header::CACHE_CONTROL, value);
        }
    }
    if !failures.is_empty() {
        if let Ok(value) = failure_summary(failures).parse() {
            headers.insert(ERRORS_HEADER, value);
        }
    }
    response
}

/// 503 when the job deadline killed the work, 502 for surfaced upstream
/// failures; the body lists the offending endpoints.
fn failure_response(failures: &[&CompletedPart]) -> Response {
    let mut detail = String::from("upstream failures:\n");
    for part in failures {
        detail.push_str(&format!(
            "{}: {}\n",
            part.request.endpoint,
            part.state.label()
        ));
    }
    if failures.iter().any(|p| p.state == PartState::Timeout) {
        service_unavailable(detail)
    } else {
        bad_gateway(detail)
    }
}

/// `endpoint=state` pairs for the diagnostic header, deduplicated.
fn failure_summary(failures: &[&CompletedPart]) -> String {
    let entries: BTreeSet<String> = failures
        .iter()
        .map(|p| format!("{}={}", endpoint_label(&p.request.endpoint), p.state.label()))
        .collect();
    entries.into_iter().collect::<Vec<_>>().join(", ")
}

/// Short label for an endpoint: the first hostname label, or the whole
/// authority when the host is numeric.
fn endpoint_label(url: &str) -> String {
    let rest = url.split("://").nth(1).unwrap_or(url);
    let authority = rest.split('/').next().unwrap_or(rest);
    let host = authority.split(':').next().unwrap_or(authority);
    if host.chars().any(|c| c.is_ascii_alphabetic()) {
        host.split('.').next().unwrap_or(host).to_owned()
    } else {
        authority.to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_label_shortens_hostnames() {
        assert_eq!(
            endpoint_label("http://eth.example/fdsnws/dataselect/1/query"),
            "eth"
        );
        assert_eq!(endpoint_label("https://bgr.example:8443/q"), "bgr");
    }

    #[test]
    fn endpoint_label_keeps_numeric_authorities() {
        assert_eq!(
            endpoint_label("http://127.0.0.1:40001/q"),
            "127.0.0.1:40001"
        );
    }

    #[test]
    fn failure_summary_dedupes() {
        use crate::decompose::{Method, SubRequest};
        let sub = SubRequest {
            endpoint: "http://eth.example/q".to_owned(),
            method: Method::Get,
            query: None,
            body: None,
            epochs: vec![],
        };
        let a = CompletedPart {
            request: sub.clone(),
            state: PartState::ServerError("status 500".to_owned()),
            spool: None,
            bytes: 0,
            attempts: 3,
        };
        let b = CompletedPart {
            request: sub,
            state: PartState::ServerError("status 502".to_owned()),
            spool: None,
            bytes: 0,
            attempts: 3,
        };
        assert_eq!(failure_summary(&[&a, &b]), "eth=5xx");
    }
}
