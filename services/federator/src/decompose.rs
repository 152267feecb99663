//! Request decomposition: resolver groups → per-endpoint sub-requests.
//!
//! Pure translation. POST is chosen when the original request was POST or
//! the group exceeds the GET threshold; POST bodies split into chunks below
//! the configured byte and epoch ceilings; non-selector options propagate
//! verbatim into every sub-request.

use crate::config::FederatorConfig;
use chrono::{DateTime, Utc};
use fdsn_proto::parse::FdsnRequest;
use fdsn_proto::stream::StreamEpoch;
use fdsn_proto::time::format_time;
use fdsn_proto::wire::{RouteGroup, render_post_body};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

/// One upstream request to issue.
#[derive(Debug, Clone)]
pub struct SubRequest {
    pub endpoint: String,
    pub method: Method,
    /// Encoded query string for GET.
    pub query: Option<String>,
    /// Line-block body for POST.
    pub body: Option<String>,
    /// The concrete epochs this sub-request covers.
    pub epochs: Vec<StreamEpoch>,
}

impl SubRequest {
    pub fn full_url(&self) -> String {
        match &self.query {
            Some(q) => format!("{}?{}", self.endpoint, q),
            None => self.endpoint.clone(),
        }
    }

    /// Merge ordering: lexicographic SEED id, then start time, of the
    /// first covered epoch.
    pub fn order_key(&self) -> (String, DateTime<Utc>) {
        self.epochs
            .first()
            .map(|e| (e.seed_id(), e.start.unwrap_or(DateTime::<Utc>::MIN_UTC)))
            .unwrap_or_else(|| (String::new(), DateTime::<Utc>::MIN_UTC))
    }
}

/// Translate resolved groups into sub-request descriptors.
pub fn decompose(
    groups: &[RouteGroup],
    request: &FdsnRequest,
    original_post: bool,
    cfg: &FederatorConfig,
) -> Vec<SubRequest> {
    let mut out = Vec::new();
    for group in groups {
        if !original_post && group.epochs.len() <= cfg.get_epoch_threshold {
            for epoch in &group.epochs {
                out.push(SubRequest {
                    endpoint: group.url.clone(),
                    method: Method::Get,
                    query: Some(get_query(epoch, request)),
                    body: None,
                    epochs: vec![epoch.clone()],
                });
            }
            continue;
        }

        let options_len = request
            .options
            .iter()
            .map(|(k, v)| k.len() + v.len() + 2)
            .sum();
        for chunk in chunk_epochs(&group.epochs, options_len, cfg) {
            let body = render_post_body(&request.options, &chunk);
            out.push(SubRequest {
                endpoint: group.url.clone(),
                method: Method::Post,
                query: None,
                body: Some(body),
                epochs: chunk,
            });
        }
    }
    out
}

fn get_query(epoch: &StreamEpoch, request: &FdsnRequest) -> String {
    let mut q = format!(
        "net={}&sta={}&loc={}&cha={}",
        epoch.network,
        epoch.station,
        epoch.location_token(),
        epoch.channel
    );
    if let Some(start) = epoch.start {
        q.push_str("&start=");
        q.push_str(&format_time(start));
    }
    if let Some(end) = epoch.end {
        q.push_str("&end=");
        q.push_str(&format_time(end));
    }
    for (name, value) in request.options.iter() {
        q.push('&');
        q.push_str(name);
        q.push('=');
        q.push_str(value);
    }
    q
}

/// Split a group's epochs so each chunk's rendered body stays below the
/// byte ceiling and the epoch ceiling.
fn chunk_epochs(
    epochs: &[StreamEpoch],
    options_len: usize,
    cfg: &FederatorConfig,
) -> Vec<Vec<StreamEpoch>> {
    let mut chunks: Vec<Vec<StreamEpoch>> = Vec::new();
    let mut current: Vec<StreamEpoch> = Vec::new();
    let mut size = options_len;

    for epoch in epochs {
        let line_len = epoch.to_post_line().len() + 1;
        let over_bytes = size + line_len > cfg.post_byte_ceiling;
        let over_count = current.len() >= cfg.post_epoch_ceiling;
        if !current.is_empty() && (over_bytes || over_count) {
            chunks.push(std::mem::take(&mut current));
            size = options_len;
        }
        current.push(epoch.clone());
        size += line_len;
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}
