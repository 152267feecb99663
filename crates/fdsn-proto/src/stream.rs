//! Stream epochs: SEED identifier fields plus a half-open UTC interval.
//!
//! The atomic routing unit is `(net, sta, loc, cha, [t1, t2))`. Code fields
//! may carry the FDSN wildcards `*` and `?` until resolution; after
//! resolution every epoch is concrete. The empty location code is stored as
//! the empty string and rendered as `--` on the wire.

use crate::time::{self, TimeError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::cmp::Ordering;
use std::fmt;

/// One SEED stream selector or concrete epoch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamEpoch {
    pub network: String,
    pub station: String,
    pub location: String,
    pub channel: String,
    /// Interval start; `None` means unbounded below (selectors only).
    pub start: Option<DateTime<Utc>>,
    /// Interval end; `None` means open-ended.
    pub end: Option<DateTime<Utc>>,
}

impl StreamEpoch {
    /// Build an epoch from raw code tokens, normalizing case and the
    /// `--` empty-location marker.
    pub fn new(net: &str, sta: &str, loc: &str, cha: &str) -> Self {
        StreamEpoch {
            network: net.trim().to_uppercase(),
            station: sta.trim().to_uppercase(),
            location: normalize_location(loc),
            channel: cha.trim().to_uppercase(),
            start: None,
            end: None,
        }
    }

    pub fn with_window(mut self, start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Self {
        self.start = start;
        self.end = end;
        self
    }

    /// True if any code field still carries a wildcard.
    pub fn has_wildcards(&self) -> bool {
        [&self.network, &self.station, &self.location, &self.channel]
            .iter()
            .any(|f| f.contains('*') || f.contains('?'))
    }

    /// The location code as carried on the wire: `--` for empty.
    pub fn location_token(&self) -> &str {
        if self.location.is_empty() { "--" } else { &self.location }
    }

    /// SEED identifier `NET.STA.LOC.CHA` (empty location kept empty).
    pub fn seed_id(&self) -> String {
        format!(
            "{}.{}.{}.{}",
            self.network, self.station, self.location, self.channel
        )
    }

    /// Intersect this epoch's interval with `[start, end)`.
    ///
    /// Returns `None` when the intersection is empty. `None` bounds are
    /// treated as unbounded on that side.
    pub fn intersect(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Option<StreamEpoch> {
        let lo = match (self.start, start) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        let hi = match (self.end, end) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        if let (Some(lo), Some(hi)) = (lo, hi) {
            if lo >= hi {
                return None;
            }
        }
        Some(self.clone().with_window(lo, hi))
    }

    /// Ordering key `(net, sta, loc, cha, start)` used for resolver output
    /// and merge ordering.
    pub fn sort_key(&self) -> (String, String, String, String, DateTime<Utc>) {
        (
            self.network.clone(),
            self.station.clone(),
            self.location.clone(),
            self.channel.clone(),
            self.start.unwrap_or(DateTime::<Utc>::MIN_UTC),
        )
    }

    /// Render as a POST line: `NET STA LOC CHA START END`.
    ///
    /// Callers serialize resolved epochs, which always carry a start. An
    /// open end renders as the far-future sentinel.
    pub fn to_post_line(&self) -> String {
        let start = self.start.map(time::format_time).unwrap_or_default();
        let end = time::format_time(self.end.unwrap_or_else(time::far_future));
        format!(
            "{} {} {} {} {} {}",
            self.network,
            self.station,
            self.location_token(),
            self.channel,
            start,
            end
        )
    }

    /// Parse one POST body line: `NET STA LOC CHA START [END]`.
    pub fn parse_post_line(line: &str) -> Result<StreamEpoch, LineError> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() < 5 || tokens.len() > 6 {
            return Err(LineError::FieldCount(tokens.len()));
        }
        for (i, t) in tokens[..4].iter().enumerate() {
            if !is_code_token(t) {
                return Err(LineError::BadCode {
                    field: CODE_FIELDS[i],
                    token: (*t).to_owned(),
                });
            }
        }
        let start = time::parse_time(tokens[4]).map_err(LineError::BadTime)?;
        let end = match tokens.get(5) {
            Some(t) => Some(time::parse_time(t).map_err(LineError::BadTime)?),
            None => None,
        };
        if let Some(end) = end {
            if start >= end {
                return Err(LineError::EmptyWindow);
            }
        }
        Ok(StreamEpoch::new(tokens[0], tokens[1], tokens[2], tokens[3])
            .with_window(Some(start), end))
    }
}

impl PartialOrd for StreamEpoch {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for StreamEpoch {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

impl fmt::Display for StreamEpoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_post_line())
    }
}

const CODE_FIELDS: [&str; 4] = ["network", "station", "location", "channel"];

/// Error for a single POST epoch line; the body parser attaches line numbers.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum LineError {
    #[error("expected 5 or 6 fields, got {0}")]
    FieldCount(usize),
    #[error("invalid {field} code '{token}'")]
    BadCode { field: &'static str, token: String },
    #[error("{0}")]
    BadTime(TimeError),
    #[error("start must precede end")]
    EmptyWindow,
}

fn normalize_location(loc: &str) -> String {
    let loc = loc.trim();
    if loc == "--" {
        String::new()
    } else {
        loc.to_uppercase()
    }
}

/// SEED code tokens: alphanumerics plus the FDSN wildcards, or `--`.
fn is_code_token(t: &str) -> bool {
    t == "--"
        || (!t.is_empty()
            && t.chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '*' || c == '?'))
}
