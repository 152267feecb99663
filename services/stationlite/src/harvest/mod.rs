//! Catalog harvesting.
//!
//! For each data center: fetch its routing configuration, enumerate the
//! concrete channels behind every routed pattern via `fdsnws-station`
//! level=channel, normalize into batch rows, and swap the batch in
//! atomically. One center's failure never touches its prior state and never
//! stops the others.

pub mod routing_xml;
pub mod station_xml;

use crate::repo::batch::{self, CodeEpoch, HarvestBatch, HarvestRow, StalePolicy};
use chrono::Utc;
use fdsn_proto::service::Service;
use fdsn_proto::time::far_future;
use routing_xml::RouteEntry;
use sqlx::PgPool;
use station_xml::NetworkEpoch;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// Errors and retry policy
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("HTTP: {0}")]
    Http(#[from] reqwest::Error),
    #[error("upstream status {status} from {url}")]
    Status { url: String, status: u16 },
    #[error("malformed XML: {0}")]
    Xml(String),
    #[error(transparent)]
    Batch(#[from] batch::BatchError),
}

impl HarvestError {
    /// Transport errors and upstream 5xx are worth another attempt;
    /// everything else is not.
    fn retriable(&self) -> bool {
        match self {
            HarvestError::Http(_) => true,
            HarvestError::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// Exponential backoff bounded by attempts and a total deadline.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub deadline: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            backoff_base: Duration::from_millis(500),
            deadline: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        self.backoff_base * 2u32.saturating_pow(attempt.saturating_sub(1))
    }
}

// ---------------------------------------------------------------------------
// Fetching
// ---------------------------------------------------------------------------

async fn fetch_once(client: &reqwest::Client, url: &str) -> Result<String, HarvestError> {
    let response = client.get(url).send().await?;
    let status = response.status();
    if status.as_u16() == 204 {
        return Ok(String::new());
    }
    if !status.is_success() {
        return Err(HarvestError::Status {
            url: url.to_owned(),
            status: status.as_u16(),
        });
    }
    Ok(response.text().await?)
}

/// Fetch a document, retrying per the policy.
pub async fn fetch_with_retry(
    client: &reqwest::Client,
    url: &str,
    policy: &RetryPolicy,
) -> Result<String, HarvestError> {
    let started = Instant::now();
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match fetch_once(client, url).await {
            Ok(text) => return Ok(text),
            Err(e) => {
                let backoff = policy.backoff_for(attempt);
                let out_of_budget = attempt >= policy.max_attempts
                    || started.elapsed() + backoff >= policy.deadline;
                if !e.retriable() || out_of_budget {
                    return Err(e);
                }
                warn!(url, attempt, error = %e, "fetch failed, backing off");
                tokio::time::sleep(backoff).await;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Center harvest
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct HarvestSummary {
    pub center_id: String,
    pub routes: usize,
}

/// Harvest one data center identified by its routing-configuration URL.
///
/// `center_filter` skips the center unless its id matches.
pub async fn harvest_center(
    client: &reqwest::Client,
    pool: &PgPool,
    routing_url: &str,
    policy: &RetryPolicy,
    stale: StalePolicy,
    center_filter: Option<&str>,
) -> Result<Option<HarvestSummary>, HarvestError> {
    let config_xml = fetch_with_retry(client, routing_url, policy).await?;
    let config = routing_xml::parse_routing_config(&config_xml)?;

    if let Some(filter) = center_filter {
        if config.center_id != filter {
            return Ok(None);
        }
    }

    let mut rows: Vec<HarvestRow> = Vec::new();
    for entry in &config.routes {
        let Some(station_url) = entry
            .services
            .iter()
            .find(|s| s.service == Service::Station)
            .map(|s| s.url.clone())
        else {
            warn!(
                center = %config.center_id,
                pattern = %entry.network,
                "route has no station endpoint, cannot enumerate channels"
            );
            continue;
        };

        let url = station_query_url(&station_url, entry);
        let xml = fetch_with_retry(client, &url, policy).await?;
        if xml.trim().is_empty() {
            continue;
        }
        let networks = station_xml::parse_station_xml(&xml)?;
        rows.extend(build_rows(entry, &networks));
    }

    dedupe(&mut rows);
    let batch = HarvestBatch {
        center_id: config.center_id.clone(),
        routing_url: routing_url.to_owned(),
        rows,
    };
    let routes = batch.rows.len();
    batch::upsert_batch(pool, &batch, stale, Utc::now()).await?;
    info!(center = %config.center_id, routes, "harvest batch applied");

    Ok(Some(HarvestSummary {
        center_id: config.center_id,
        routes,
    }))
}

/// The level=channel enumeration query for one routed pattern.
fn station_query_url(base: &str, entry: &RouteEntry) -> String {
    let loc = if entry.location.is_empty() {
        "--"
    } else {
        &entry.location
    };
    format!(
        "{base}?net={}&sta={}&loc={loc}&cha={}&level=channel",
        entry.network, entry.station, entry.channel
    )
}

/// Cross the enumerated channel epochs with the entry's service endpoints.
fn build_rows(entry: &RouteEntry, networks: &[NetworkEpoch]) -> Vec<HarvestRow> {
    let mut rows = Vec::new();
    for net in networks {
        for sta in &net.stations {
            for cha in &sta.channels {
                for sroute in &entry.services {
                    rows.push(HarvestRow {
                        service: sroute.service,
                        url: sroute.url.clone(),
                        network: CodeEpoch {
                            code: net.code.clone(),
                            start: net.start,
                            end: net.end.unwrap_or_else(far_future),
                        },
                        station: CodeEpoch {
                            code: sta.code.clone(),
                            start: sta.start,
                            end: sta.end.unwrap_or_else(far_future),
                        },
                        location: cha.location.clone(),
                        channel: CodeEpoch {
                            code: cha.code.clone(),
                            start: cha.start,
                            end: cha.end.unwrap_or_else(far_future),
                        },
                        route_start: sroute.start.unwrap_or(cha.start),
                        route_end: sroute.end.unwrap_or_else(far_future),
                    });
                }
            }
        }
    }
    rows
}

/// Overlapping route patterns enumerate the same channels; identical rows
/// collapse to one.
fn dedupe(rows: &mut Vec<HarvestRow>) {
    rows.sort_by(|a, b| {
        (
            a.service,
            &a.url,
            &a.network.code,
            &a.station.code,
            &a.location,
            &a.channel.code,
            a.channel.start,
            a.route_start,
        )
            .cmp(&(
                b.service,
                &b.url,
                &b.network.code,
                &b.station.code,
                &b.location,
                &b.channel.code,
                b.channel.start,
                b.route_start,
            ))
    });
    rows.dedup();
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use routing_xml::ServiceRoute;
    use station_xml::{ChannelEpoch, StationEpoch};

    fn at(y: i32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, 1, 1, 0, 0, 0).unwrap()
    }

    fn entry() -> RouteEntry {
        RouteEntry {
            network: "CH".to_owned(),
            station: "*".to_owned(),
            location: "*".to_owned(),
            channel: "*".to_owned(),
            services: vec![
                ServiceRoute {
                    service: Service::Station,
                    url: "http://eth.example/fdsnws/station/1/query".to_owned(),
                    priority: 1,
                    start: None,
                    end: None,
                },
                ServiceRoute {
                    service: Service::Dataselect,
                    url: "http://eth.example/fdsnws/dataselect/1/query".to_owned(),
                    priority: 1,
                    start: Some(at(2000)),
                    end: None,
                },
            ],
        }
    }

    fn networks() -> Vec<NetworkEpoch> {
        vec![NetworkEpoch {
            code: "CH".to_owned(),
            start: at(1980),
            end: None,
            stations: vec![StationEpoch {
                code: "AAA".to_owned(),
                start: at(1999),
                end: None,
                channels: vec![ChannelEpoch {
                    location: String::new(),
                    code: "HHZ".to_owned(),
                    start: at(1999),
                    end: None,
                }],
            }],
        }]
    }

    #[test]
    fn build_rows_crosses_channels_with_services() {
        let rows = build_rows(&entry(), &networks());
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].service, Service::Station);
        assert_eq!(rows[1].service, Service::Dataselect);
        // Route validity falls back to the channel epoch when unspecified.
        assert_eq!(rows[0].route_start, at(1999));
        assert_eq!(rows[1].route_start, at(2000));
        assert_eq!(rows[0].route_end, far_future());
    }

    #[test]
    fn dedupe_collapses_identical_rows() {
        let mut rows = build_rows(&entry(), &networks());
        rows.extend(build_rows(&entry(), &networks()));
        dedupe(&mut rows);
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn station_query_url_encodes_pattern() {
        let url = station_query_url("http://eth.example/fdsnws/station/1/query", &entry());
        assert_eq!(
            url,
            "http://eth.example/fdsnws/station/1/query?net=CH&sta=*&loc=*&cha=*&level=channel"
        );
    }

    #[test]
    fn station_query_url_renders_empty_location_as_dashes() {
        let mut e = entry();
        e.location = String::new();
        let url = station_query_url("http://x/q", &e);
        assert!(url.contains("loc=--"));
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let policy = RetryPolicy {
            max_attempts: 4,
            backoff_base: Duration::from_millis(100),
            deadline: Duration::from_secs(60),
        };
        assert_eq!(policy.backoff_for(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(200));
        assert_eq!(policy.backoff_for(3), Duration::from_millis(400));
    }

    #[test]
    fn status_errors_retriable_only_above_500() {
        let server = HarvestError::Status {
            url: "u".to_owned(),
            status: 503,
        };
        let client = HarvestError::Status {
            url: "u".to_owned(),
            status: 404,
        };
        assert!(server.retriable());
        assert!(!client.retriable());
        assert!(!HarvestError::Xml("x".to_owned()).retriable());
    }
}
