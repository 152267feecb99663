//! Routing resolution: expand wildcards against known channels, intersect
//! epochs with the request window, group by endpoint URL.
//!
//! The SQL narrows candidates (LIKE patterns, coarse window overlap); the
//! exact interval arithmetic and the output ordering are done here so they
//! can be tested without a database.

use chrono::{DateTime, Utc};
use fdsn_proto::stream::StreamEpoch;
use fdsn_proto::service::Service;
use fdsn_proto::wire::RouteGroup;
use sqlx::{PgPool, Row};
use std::collections::BTreeMap;

/// One candidate routing fact fetched from the store.
#[derive(Debug, Clone)]
pub struct RouteRow {
    pub url: String,
    pub network: String,
    pub station: String,
    pub location: String,
    pub channel: String,
    pub channel_start: DateTime<Utc>,
    pub channel_end: DateTime<Utc>,
    pub route_start: DateTime<Utc>,
    pub route_end: DateTime<Utc>,
}

/// Resolve selectors for one service into endpoint groups.
///
/// Endpoints are ordered by URL; epochs within a group by
/// `(net, sta, loc, cha, start)` with overlapping epochs of the same
/// stream coalesced.
pub async fn resolve(
    pool: &PgPool,
    selectors: &[StreamEpoch],
    service: Service,
) -> Result<Vec<RouteGroup>, sqlx::Error> {
    let mut pairs: Vec<(String, StreamEpoch)> = Vec::new();
    for sel in selectors {
        let rows = fetch_candidates(pool, sel, service).await?;
        for row in &rows {
            if let Some(epoch) = intersect_row(row, sel.start, sel.end) {
                pairs.push((row.url.clone(), epoch));
            }
        }
    }
    Ok(group_routes(pairs))
}

async fn fetch_candidates(
    pool: &PgPool,
    sel: &StreamEpoch,
    service: Service,
) -> Result<Vec<RouteRow>, sqlx::Error> {
    let rows = sqlx::query(
        r#"SELECT ep.url, n.code AS net, s.code AS sta, c.location AS loc, c.code AS cha,
                  c.start_time AS cha_start, c.end_time AS cha_end,
                  r.start_time AS route_start, r.end_time AS route_end
           FROM routes r
           JOIN channels c ON c.channel_id = r.channel_id
           JOIN stations s ON s.station_id = c.station_id
           JOIN networks n ON n.network_id = s.network_id
           JOIN endpoints ep ON ep.endpoint_id = r.endpoint_id
           WHERE ep.service = $1
             AND n.code LIKE $2 ESCAPE '\'
             AND s.code LIKE $3 ESCAPE '\'
             AND c.location LIKE $4 ESCAPE '\'
             AND c.code LIKE $5 ESCAPE '\'
             AND ($6::timestamptz IS NULL OR r.end_time > $6)
             AND ($7::timestamptz IS NULL OR r.start_time < $7)
             AND ($6::timestamptz IS NULL OR c.end_time > $6)
             AND ($7::timestamptz IS NULL OR c.start_time < $7)"#,
    )
    .bind(service.as_str())
    .bind(like_pattern(&sel.network))
    .bind(like_pattern(&sel.station))
    .bind(like_pattern(&sel.location))
    .bind(like_pattern(&sel.channel))
    .bind(sel.start)
    .bind(sel.end)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|r| RouteRow {
            url: r.get("url"),
            network: r.get("net"),
            station: r.get("sta"),
            location: r.get("loc"),
            channel: r.get("cha"),
            channel_start: r.get("cha_start"),
            channel_end: r.get("cha_end"),
            route_start: r.get("route_start"),
            route_end: r.get("route_end"),
        })
        .collect())
}

/// Translate FDSN wildcards to a SQL LIKE pattern with `\` escaping.
pub fn like_pattern(code: &str) -> String {
    let mut out = String::with_capacity(code.len());
    for c in code.chars() {
        match c {
            '*' => out.push('%'),
            '?' => out.push('_'),
            '%' | '_' | '\\' => {
                out.push('\\');
                out.push(c);
            }
            other => out.push(other),
        }
    }
    out
}

/// Intersect channel epoch, routing validity, and request window.
pub fn intersect_row(
    row: &RouteRow,
    win_start: Option<DateTime<Utc>>,
    win_end: Option<DateTime<Utc>>,
) -> Option<StreamEpoch> {
    let mut lo = row.channel_start.max(row.route_start);
    if let Some(ws) = win_start {
        lo = lo.max(ws);
    }
    let mut hi = row.channel_end.min(row.route_end);
    if let Some(we) = win_end {
        hi = hi.min(we);
    }
    if lo >= hi {
        return None;
    }
    Some(
        StreamEpoch::new(&row.network, &row.station, &row.location, &row.channel)
            .with_window(Some(lo), Some(hi)),
    )
}

/// Group epochs by endpoint URL, sort, and coalesce overlapping epochs of
/// the same stream.
pub fn group_routes(pairs: Vec<(String, StreamEpoch)>) -> Vec<RouteGroup> {
    let mut by_url: BTreeMap<String, Vec<StreamEpoch>> = BTreeMap::new();
    for (url, epoch) in pairs {
        by_url.entry(url).or_default().push(epoch);
    }

    by_url
        .into_iter()
        .map(|(url, mut epochs)| {
            epochs.sort();
            RouteGroup {
                url,
                epochs: coalesce(epochs),
            }
        })
        .collect()
}

/// Merge overlapping or abutting epochs of the same stream. Input must be
/// sorted by `(net, sta, loc, cha, start)`.
fn coalesce(epochs: Vec<StreamEpoch>) -> Vec<StreamEpoch> {
    let mut out: Vec<StreamEpoch> = Vec::with_capacity(epochs.len());
    for e in epochs {
        match out.last_mut() {
            Some(prev)
                if prev.network == e.network
                    && prev.station == e.station
                    && prev.location == e.location
                    && prev.channel == e.channel
                    && prev.end >= e.start =>
            {
                if e.end > prev.end {
                    prev.end = e.end;
                }
            }
            _ => out.push(e),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2020, 1, 1, h, 0, 0).unwrap()
    }

    fn row(url: &str, sta: &str, cs: u32, ce: u32, rs: u32, re: u32) -> RouteRow {
        RouteRow {
            url: url.to_owned(),
            network: "CH".to_owned(),
            station: sta.to_owned(),
            location: String::new(),
            channel: "HHZ".to_owned(),
            channel_start: at(cs),
            channel_end: at(ce),
            route_start: at(rs),
            route_end: at(re),
        }
    }

    #[test]
    fn like_pattern_translates_wildcards() {
        assert_eq!(like_pattern("CH"), "CH");
        assert_eq!(like_pattern("C*"), "C%");
        assert_eq!(like_pattern("HH?"), "HH_");
        assert_eq!(like_pattern("*"), "%");
    }

    #[test]
    fn like_pattern_escapes_sql_metacharacters() {
        assert_eq!(like_pattern("A%B"), "A\\%B");
        assert_eq!(like_pattern("A_B"), "A\\_B");
        assert_eq!(like_pattern("A\\B"), "A\\\\B");
    }

    #[test]
    fn intersect_row_takes_narrowest_interval() {
        let r = row("u", "AAA", 0, 10, 2, 8);
        let e = intersect_row(&r, Some(at(4)), Some(at(20))).unwrap();
        assert_eq!(e.start, Some(at(4)));
        assert_eq!(e.end, Some(at(8)));
    }

    #[test]
    fn intersect_row_empty_is_none() {
        let r = row("u", "AAA", 0, 5, 0, 5);
        assert!(intersect_row(&r, Some(at(5)), Some(at(10))).is_none());
        let disjoint = row("u", "AAA", 0, 3, 4, 8);
        assert!(intersect_row(&disjoint, None, None).is_none());
    }

    #[test]
    fn intersect_row_result_within_window() {
        let r = row("u", "AAA", 0, 23, 0, 23);
        let e = intersect_row(&r, Some(at(3)), Some(at(7))).unwrap();
        assert!(e.start.unwrap() >= at(3));
        assert!(e.end.unwrap() <= at(7));
    }

    #[test]
    fn groups_sorted_by_url_epochs_by_stream() {
        let e1 = intersect_row(&row("http://b.example/q", "AAA", 0, 4, 0, 4), None, None).unwrap();
        let e2 = intersect_row(&row("http://a.example/q", "BBB", 0, 4, 0, 4), None, None).unwrap();
        let e3 = intersect_row(&row("http://a.example/q", "AAA", 0, 4, 0, 4), None, None).unwrap();
        let groups = group_routes(vec![
            ("http://b.example/q".to_owned(), e1),
            ("http://a.example/q".to_owned(), e2),
            ("http://a.example/q".to_owned(), e3),
        ]);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].url, "http://a.example/q");
        assert_eq!(groups[0].epochs[0].station, "AAA");
        assert_eq!(groups[0].epochs[1].station, "BBB");
    }

    #[test]
    fn overlapping_epochs_of_one_stream_coalesce() {
        let a = intersect_row(&row("u", "AAA", 0, 5, 0, 5), None, None).unwrap();
        let b = intersect_row(&row("u", "AAA", 3, 9, 3, 9), None, None).unwrap();
        let groups = group_routes(vec![("u".to_owned(), a), ("u".to_owned(), b)]);
        assert_eq!(groups[0].epochs.len(), 1);
        assert_eq!(groups[0].epochs[0].start, Some(at(0)));
        assert_eq!(groups[0].epochs[0].end, Some(at(9)));
    }

    #[test]
    fn disjoint_epochs_of_one_stream_stay_separate() {
        let a = intersect_row(&row("u", "AAA", 0, 2, 0, 2), None, None).unwrap();
        let b = intersect_row(&row("u", "AAA", 5, 9, 5, 9), None, None).unwrap();
        let groups = group_routes(vec![("u".to_owned(), a), ("u".to_owned(), b)]);
        assert_eq!(groups[0].epochs.len(), 2);
    }

    #[test]
    fn distinct_streams_never_coalesce() {
        let a = intersect_row(&row("u", "AAA", 0, 5, 0, 5), None, None).unwrap();
        let b = intersect_row(&row("u", "BBB", 3, 9, 3, 9), None, None).unwrap();
        let groups = group_routes(vec![("u".to_owned(), a), ("u".to_owned(), b)]);
        assert_eq!(groups[0].epochs.len(), 2);
    }
}
