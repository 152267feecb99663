//! Client side of the routing resolver.
//!
//! The federator ships the client's selectors to the resolver in the `post`
//! input grammar and gets back endpoint groups in the `post` output format.

use fdsn_proto::parse::FdsnRequest;
use fdsn_proto::time::{far_future, far_past, format_time};
use fdsn_proto::wire::{RouteGroup, RoutePostError, parse_route_post};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum RoutingError {
    #[error("resolver unreachable: {0}")]
    Http(#[from] reqwest::Error),
    #[error("resolver answered status {0}")]
    Status(u16),
    #[error("resolver answered malformed routes: {0}")]
    Parse(#[from] RoutePostError),
}

#[derive(Clone)]
pub struct RoutingClient {
    http: reqwest::Client,
    url: String,
}

impl RoutingClient {
    pub fn new(http: reqwest::Client, url: String) -> Self {
        RoutingClient { http, url }
    }

    /// Resolve the request's selectors; an empty vec means no route matched.
    pub async fn resolve(&self, request: &FdsnRequest) -> Result<Vec<RouteGroup>, RoutingError> {
        let body = resolve_body(request);
        let response = self.http.post(&self.url).body(body).send().await?;
        let status = response.status();
        if status.as_u16() == 204 {
            return Ok(Vec::new());
        }
        if !status.is_success() {
            return Err(RoutingError::Status(status.as_u16()));
        }
        let text = response.text().await?;
        let groups = parse_route_post(&text)?;
        debug!(endpoints = groups.len(), "routes resolved");
        Ok(groups)
    }
}

/// The resolver's POST input: service/format headers plus one selector per
/// line. Unbounded selector windows are widened to the sentinel interval.
fn resolve_body(request: &FdsnRequest) -> String {
    let mut body = format!("service={}\nformat=post\n", request.service);
    for e in &request.epochs {
        body.push_str(&format!(
            "{} {} {} {} {} {}\n",
            e.network,
            e.station,
            e.location_token(),
            e.channel,
            format_time(e.start.unwrap_or_else(far_past)),
            format_time(e.end.unwrap_or_else(far_future)),
        ));
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use fdsn_proto::parse::parse_get;
    use fdsn_proto::service::Service;

    #[test]
    fn resolve_body_carries_service_and_selectors() {
        let request = parse_get(
            Service::Dataselect,
            &[
                ("net".to_owned(), "CH".to_owned()),
                ("sta".to_owned(), "AAA".to_owned()),
                ("start".to_owned(), "2020-01-01".to_owned()),
                ("end".to_owned(), "2020-01-02".to_owned()),
            ],
        )
        .unwrap();
        let body = resolve_body(&request);
        let mut lines = body.lines();
        assert_eq!(lines.next(), Some("service=dataselect"));
        assert_eq!(lines.next(), Some("format=post"));
        let selector = lines.next().unwrap();
        assert!(selector.starts_with("CH AAA -- *"));
        assert!(selector.contains("2020-01-01T00:00:00.000000"));
    }

    #[test]
    fn unbounded_windows_use_sentinels() {
        let request = parse_get(
            Service::Station,
            &[("net".to_owned(), "CH".to_owned())],
        )
        .unwrap();
        let body = resolve_body(&request);
        let selector = body.lines().nth(2).unwrap();
        assert!(selector.contains("1900-01-01T00:00:00.000000"));
        assert!(selector.contains("2500-01-01T00:00:00.000000"));
    }
}
