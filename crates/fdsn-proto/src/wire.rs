//! Line-block wire formats shared by the resolver and the federator.
//!
//! The resolver's `post` output format doubles as the federator's upstream
//! POST body grammar, so render and parse live together here.

use crate::service::ServiceOptions;
use crate::stream::{LineError, StreamEpoch};
use serde::Serialize;
use thiserror::Error;

// ---------------------------------------------------------------------------
// POST body (upstream requests)
// ---------------------------------------------------------------------------

/// Render option header lines plus epoch lines, newline-terminated.
pub fn render_post_body(options: &ServiceOptions, epochs: &[StreamEpoch]) -> String {
    let mut out = String::new();
    for (k, v) in options.iter() {
        out.push_str(k);
        out.push('=');
        out.push_str(v);
        out.push('\n');
    }
    for e in epochs {
        out.push_str(&e.to_post_line());
        out.push('\n');
    }
    out
}

// ---------------------------------------------------------------------------
// Route groups
// ---------------------------------------------------------------------------

/// One resolved endpoint and the concrete epochs it serves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteGroup {
    pub url: String,
    pub epochs: Vec<StreamEpoch>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RoutePostError {
    #[error("line {line}: expected an endpoint URL, got '{got}'")]
    ExpectedUrl { line: usize, got: String },
    #[error("line {line}: {source}")]
    Line { line: usize, source: LineError },
    #[error("endpoint block at line {line} has no epochs")]
    EmptyBlock { line: usize },
}

/// Render resolver `post` output: one block per endpoint, first line the
/// URL, one epoch per following line, blank line between blocks.
pub fn render_route_post(groups: &[RouteGroup]) -> String {
    let mut out = String::new();
    for (i, g) in groups.iter().enumerate() {
        if i > 0 {
            out.push('\n');
        }
        out.push_str(&g.url);
        out.push('\n');
        for e in &g.epochs {
            out.push_str(&e.to_post_line());
            out.push('\n');
        }
    }
    out
}

/// Parse resolver `post` output back into route groups.
pub fn parse_route_post(body: &str) -> Result<Vec<RouteGroup>, RoutePostError> {
    let mut groups: Vec<RouteGroup> = Vec::new();
    let mut current: Option<(usize, RouteGroup)> = None;

    for (idx, raw) in body.lines().enumerate() {
        let line = raw.trim();
        let line_no = idx + 1;
        if line.is_empty() {
            if let Some((at, g)) = current.take() {
                if g.epochs.is_empty() {
                    return Err(RoutePostError::EmptyBlock { line: at });
                }
                groups.push(g);
            }
            continue;
        }
        match &mut current {
            None => {
                if !is_url(line) {
                    return Err(RoutePostError::ExpectedUrl {
                        line: line_no,
                        got: line.to_owned(),
                    });
                }
                current = Some((
                    line_no,
                    RouteGroup {
                        url: line.to_owned(),
                        epochs: Vec::new(),
                    },
                ));
            }
            Some((_, g)) => {
                let epoch = StreamEpoch::parse_post_line(line)
                    .map_err(|source| RoutePostError::Line { line: line_no, source })?;
                g.epochs.push(epoch);
            }
        }
    }

    if let Some((at, g)) = current.take() {
        if g.epochs.is_empty() {
            return Err(RoutePostError::EmptyBlock { line: at });
        }
        groups.push(g);
    }
    Ok(groups)
}

/// Render resolver `get` output: one fully-encoded GET URL per epoch.
pub fn render_route_get(groups: &[RouteGroup]) -> String {
    let mut out = String::new();
    for g in groups {
        for e in &g.epochs {
            out.push_str(&g.url);
            out.push_str("?net=");
            out.push_str(&e.network);
            out.push_str("&sta=");
            out.push_str(&e.station);
            out.push_str("&loc=");
            out.push_str(e.location_token());
            out.push_str("&cha=");
            out.push_str(&e.channel);
            if let Some(start) = e.start {
                out.push_str("&start=");
                out.push_str(&crate::time::format_time(start));
            }
            out.push_str("&end=");
            out.push_str(&crate::time::format_time(
                e.end.unwrap_or_else(crate::time::far_future),
            ));
            out.push('\n');
        }
    }
    out
}

#[derive(Serialize)]
struct JsonGroup<'a> {
    url: &'a str,
    streams: Vec<JsonStream<'a>>,
}

#[derive(Serialize)]
struct JsonStream<'a> {
    net: &'a str,
    sta: &'a str,
    loc: &'a str,
    cha: &'a str,
    start: String,
    end: String,
}

/// Render resolver `json` output: `[{url, streams: [...]}, ...]`.
pub fn render_route_json(groups: &[RouteGroup]) -> String {
    let view: Vec<JsonGroup<'_>> = groups
        .iter()
        .map(|g| JsonGroup {
            url: &g.url,
            streams: g
                .epochs
                .iter()
                .map(|e| JsonStream {
                    net: &e.network,
                    sta: &e.station,
                    loc: e.location_token(),
                    cha: &e.channel,
                    start: e.start.map(crate::time::format_time).unwrap_or_default(),
                    end: crate::time::format_time(e.end.unwrap_or_else(crate::time::far_future)),
                })
                .collect(),
        })
        .collect();
    serde_json::to_string(&view).unwrap_or_else(|_| "[]".to_owned())
}

fn is_url(s: &str) -> bool {
    s.starts_with("http://") || s.starts_with("https://")
}
