//! Request decoding for the two inbound shapes.
//!
//! GET: FDSN query parameters (`net`, `sta`, `loc`, `cha`, `start`, `end`
//! plus service-specific options), long and short names accepted,
//! comma-separated code lists expanded by cross product.
//!
//! POST: `key=value` header lines set request-wide options; every other
//! non-blank line names one stream epoch (`NET STA LOC CHA START [END]`,
//! `--` for the empty location). Errors carry 1-based line numbers.

use crate::service::{OptionError, Service, ServiceOptions};
use crate::stream::{LineError, StreamEpoch};
use crate::time::{self, TimeError};
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Hard cap on selectors produced by one request's cross product.
const MAX_SELECTORS: usize = 1000;

/// A decoded client request: canonical selectors plus validated options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FdsnRequest {
    pub service: Service,
    pub epochs: Vec<StreamEpoch>,
    pub options: ServiceOptions,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("{0}")]
    Option(#[from] OptionError),
    #[error("parameter '{param}': {source}")]
    Time { param: &'static str, source: TimeError },
    #[error("start must strictly precede end")]
    EmptyWindow,
    #[error("line {line}: {source}")]
    Line { line: usize, source: LineError },
    #[error("request names no stream epochs")]
    NoSelectors,
    #[error("selector lists expand to more than {MAX_SELECTORS} epochs")]
    TooManySelectors,
}

// ---------------------------------------------------------------------------
// GET
// ---------------------------------------------------------------------------

/// Decode GET query parameters into an [`FdsnRequest`].
pub fn parse_get(service: Service, pairs: &[(String, String)]) -> Result<FdsnRequest, ParseError> {
    let mut nets = None;
    let mut stas = None;
    let mut locs = None;
    let mut chas = None;
    let mut start = None;
    let mut end = None;
    let mut options = ServiceOptions::new();

    for (name, value) in pairs {
        let name = name.trim().to_lowercase();
        let value = value.trim();
        match name.as_str() {
            "net" | "network" => nets = Some(split_codes(value)),
            "sta" | "station" => stas = Some(split_codes(value)),
            "loc" | "location" => locs = Some(split_codes(value)),
            "cha" | "channel" => chas = Some(split_codes(value)),
            "start" | "starttime" => {
                start = Some(time::parse_time(value).map_err(|source| ParseError::Time {
                    param: "start",
                    source,
                })?);
            }
            "end" | "endtime" => {
                end = Some(time::parse_time(value).map_err(|source| ParseError::Time {
                    param: "end",
                    source,
                })?);
            }
            _ => options.insert(service, &name, value)?,
        }
    }

    if let (Some(start), Some(end)) = (start, end) {
        if start >= end {
            return Err(ParseError::EmptyWindow);
        }
    }

    let epochs = cross_product(
        nets.unwrap_or_else(|| vec!["*".to_owned()]),
        stas.unwrap_or_else(|| vec!["*".to_owned()]),
        locs.unwrap_or_else(|| vec!["*".to_owned()]),
        chas.unwrap_or_else(|| vec!["*".to_owned()]),
        start,
        end,
    )?;

    Ok(FdsnRequest {
        service,
        epochs,
        options,
    })
}

/// Decode selector-only query parameters (`net/sta/loc/cha/start/end` and
/// their long forms). Any other parameter name is rejected; the routing
/// resolver layers its own `service`/`format` handling on top of this.
pub fn parse_selectors(pairs: &[(String, String)]) -> Result<Vec<StreamEpoch>, ParseError> {
    let mut nets = None;
    let mut stas = None;
    let mut locs = None;
    let mut chas = None;
    let mut start = None;
    let mut end = None;

    for (name, value) in pairs {
        let name = name.trim().to_lowercase();
        let value = value.trim();
        match name.as_str() {
            "net" | "network" => nets = Some(split_codes(value)),
            "sta" | "station" => stas = Some(split_codes(value)),
            "loc" | "location" => locs = Some(split_codes(value)),
            "cha" | "channel" => chas = Some(split_codes(value)),
            "start" | "starttime" => {
                start = Some(time::parse_time(value).map_err(|source| ParseError::Time {
                    param: "start",
                    source,
                })?);
            }
            "end" | "endtime" => {
                end = Some(time::parse_time(value).map_err(|source| ParseError::Time {
                    param: "end",
                    source,
                })?);
            }
            _ => return Err(ParseError::Option(OptionError::Unknown(name))),
        }
    }

    if let (Some(start), Some(end)) = (start, end) {
        if start >= end {
            return Err(ParseError::EmptyWindow);
        }
    }

    cross_product(
        nets.unwrap_or_else(|| vec!["*".to_owned()]),
        stas.unwrap_or_else(|| vec!["*".to_owned()]),
        locs.unwrap_or_else(|| vec!["*".to_owned()]),
        chas.unwrap_or_else(|| vec!["*".to_owned()]),
        start,
        end,
    )
}

// ---------------------------------------------------------------------------
// POST
// ---------------------------------------------------------------------------

/// Decode a POST line-block body into an [`FdsnRequest`].
pub fn parse_post(service: Service, body: &str) -> Result<FdsnRequest, ParseError> {
    let mut options = ServiceOptions::new();
    let mut epochs = Vec::new();

    for (idx, raw) in body.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        if let Some((name, value)) = split_option_line(line) {
            options.insert(service, name, value)?;
            continue;
        }
        let epoch = StreamEpoch::parse_post_line(line).map_err(|source| ParseError::Line {
            line: idx + 1,
            source,
        })?;
        epochs.push(epoch);
    }

    if epochs.is_empty() {
        return Err(ParseError::NoSelectors);
    }
    if epochs.len() > MAX_SELECTORS {
        return Err(ParseError::TooManySelectors);
    }

    Ok(FdsnRequest {
        service,
        epochs,
        options,
    })
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Comma-separated code list; an empty value reads as the wildcard.
fn split_codes(value: &str) -> Vec<String> {
    let codes: Vec<String> = value
        .split(',')
        .map(|c| c.trim().to_owned())
        .filter(|c| !c.is_empty())
        .collect();
    if codes.is_empty() {
        vec!["*".to_owned()]
    } else {
        codes
    }
}

/// A `key=value` header line; epoch lines never contain `=`.
fn split_option_line(line: &str) -> Option<(&str, &str)> {
    let (name, value) = line.split_once('=')?;
    Some((name.trim(), value.trim()))
}

fn cross_product(
    nets: Vec<String>,
    stas: Vec<String>,
    locs: Vec<String>,
    chas: Vec<String>,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
) -> Result<Vec<StreamEpoch>, ParseError> {
    let count = nets
        .len()
        .saturating_mul(stas.len())
        .saturating_mul(locs.len())
        .saturating_mul(chas.len());
    if count == 0 {
        return Err(ParseError::NoSelectors);
    }
    if count > MAX_SELECTORS {
        return Err(ParseError::TooManySelectors);
    }

    let mut out = Vec::with_capacity(count);
    for n in &nets {
        for s in &stas {
            for l in &locs {
                for c in &chas {
                    out.push(StreamEpoch::new(n, s, l, c).with_window(start, end));
                }
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn pairs(kv: &[(&str, &str)]) -> Vec<(String, String)> {
        kv.iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    #[test]
    fn get_single_selector() {
        let req = parse_get(
            Service::Station,
            &pairs(&[
                ("net", "CH"),
                ("sta", "AAA"),
                ("start", "2020-01-01T00:00:00"),
                ("end", "2020-01-02T00:00:00"),
                ("level", "channel"),
            ]),
        )
        .unwrap();
        assert_eq!(req.epochs.len(), 1);
        assert_eq!(req.epochs[0].seed_id(), "CH.AAA.*.*");
        assert_eq!(req.options.get("level"), Some("channel"));
    }

    #[test]
    fn get_long_parameter_names() {
        let req = parse_get(
            Service::Dataselect,
            &pairs(&[
                ("network", "CH"),
                ("station", "AAA"),
                ("starttime", "2020-01-01"),
                ("endtime", "2020-01-02"),
            ]),
        )
        .unwrap();
        assert_eq!(req.epochs[0].network, "CH");
        assert!(req.epochs[0].start.is_some());
    }

    #[test]
    fn get_comma_lists_cross_product() {
        let req = parse_get(
            Service::Dataselect,
            &pairs(&[("net", "CH,GR"), ("sta", "AAA,BFO"), ("cha", "HHZ")]),
        )
        .unwrap();
        assert_eq!(req.epochs.len(), 4);
    }

    #[test]
    fn get_unknown_parameter_fails() {
        let err = parse_get(Service::Station, &pairs(&[("levle", "channel")])).unwrap_err();
        assert!(matches!(err, ParseError::Option(OptionError::Unknown(_))));
    }

    #[test]
    fn get_equal_or_inverted_window_fails() {
        for (s, e) in [
            ("2020-01-01T00:00:00", "2020-01-01T00:00:00"),
            ("2020-01-02T00:00:00", "2020-01-01T00:00:00"),
        ] {
            let err =
                parse_get(Service::Station, &pairs(&[("start", s), ("end", e)])).unwrap_err();
            assert_eq!(err, ParseError::EmptyWindow);
        }
    }

    #[test]
    fn get_wildcards_are_preserved() {
        let req = parse_get(Service::Station, &pairs(&[("net", "C*"), ("sta", "A?A")])).unwrap();
        assert!(req.epochs[0].has_wildcards());
        assert_eq!(req.epochs[0].network, "C*");
    }

    #[test]
    fn post_basic_two_lines() {
        let body = "quality=B\n\
                    CH AAA -- HHZ 2020-01-01T00:00:00 2020-01-01T01:00:00\n\
                    GR BFO -- HHZ 2020-01-01T00:00:00 2020-01-01T01:00:00\n";
        let req = parse_post(Service::Dataselect, body).unwrap();
        assert_eq!(req.epochs.len(), 2);
        assert_eq!(req.options.get("quality"), Some("B"));
    }

    #[test]
    fn post_line_numbers_in_errors() {
        let body = "CH AAA -- HHZ 2020-01-01T00:00:00 2020-01-01T01:00:00\n\
                    CH AAA -- HHZ not-a-time\n";
        let err = parse_post(Service::Dataselect, body).unwrap_err();
        match err {
            ParseError::Line { line, .. } => assert_eq!(line, 2),
            other => panic!("expected Line error, got {other:?}"),
        }
    }

    #[test]
    fn post_options_only_is_an_error() {
        let err = parse_post(Service::Dataselect, "quality=B\n").unwrap_err();
        assert_eq!(err, ParseError::NoSelectors);
    }

    #[test]
    fn post_selector_header_is_rejected() {
        let body = "net=CH\nCH AAA -- HHZ 2020-01-01T00:00:00 2020-01-01T01:00:00\n";
        let err = parse_post(Service::Dataselect, body).unwrap_err();
        assert!(matches!(err, ParseError::Option(OptionError::Unknown(_))));
    }

    #[test]
    fn post_round_trip_preserves_epochs_and_options() {
        let body = "quality=B\n\
                    GR BFO -- HHZ 2020-01-01T00:00:00 2020-01-01T01:00:00\n\
                    CH AAA -- HHZ 2020-01-01T00:00:00 2020-01-01T01:00:00\n";
        let req = parse_post(Service::Dataselect, body).unwrap();

        let mut rendered = String::new();
        for (k, v) in req.options.iter() {
            rendered.push_str(&format!("{k}={v}\n"));
        }
        for e in &req.epochs {
            rendered.push_str(&e.to_post_line());
            rendered.push('\n');
        }

        let back = parse_post(Service::Dataselect, &rendered).unwrap();
        let mut a = req.epochs.clone();
        let mut b = back.epochs.clone();
        a.sort();
        b.sort();
        assert_eq!(a, b);
        assert_eq!(req.options, back.options);
    }

    #[test]
    fn get_defaults_to_full_wildcard_selector() {
        let req = parse_get(
            Service::Station,
            &pairs(&[("start", "2020-01-01"), ("end", "2020-01-02")]),
        )
        .unwrap();
        assert_eq!(req.epochs.len(), 1);
        assert_eq!(req.epochs[0].seed_id(), "*.*.*.*");
    }

    #[test]
    fn cross_product_cap() {
        let many = (0..40).map(|i| format!("N{i}")).collect::<Vec<_>>().join(",");
        let err = parse_get(
            Service::Station,
            &pairs(&[("net", &many), ("sta", &many)]),
        )
        .unwrap_err();
        assert_eq!(err, ParseError::TooManySelectors);
    }

    #[test]
    fn start_time_window_is_applied_to_all_selectors() {
        let start = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        let req = parse_get(
            Service::Station,
            &pairs(&[("net", "CH,GR"), ("start", "2020-01-01")]),
        )
        .unwrap();
        assert!(req.epochs.iter().all(|e| e.start == Some(start)));
    }
}
