//! Harvest batch ingestion.
//!
//! One batch carries everything harvested from one data center. The swap-in
//! is a single transaction: natural-key upserts for networks, stations,
//! channels, endpoints, and routes, then stale-route handling for routes of
//! that center absent from the batch. Readers on the pool never observe a
//! partial batch.

use chrono::{DateTime, Utc};
use fdsn_proto::service::Service;
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use thiserror::Error;
use tracing::debug;

// ---------------------------------------------------------------------------
// Batch rows
// ---------------------------------------------------------------------------

/// A code plus its validity epoch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeEpoch {
    pub code: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// One routing fact: a concrete channel epoch served by one endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarvestRow {
    pub service: Service,
    pub url: String,
    pub network: CodeEpoch,
    pub station: CodeEpoch,
    pub location: String,
    pub channel: CodeEpoch,
    pub route_start: DateTime<Utc>,
    pub route_end: DateTime<Utc>,
}

/// Everything harvested from one data center.
#[derive(Debug, Clone)]
pub struct HarvestBatch {
    pub center_id: String,
    pub routing_url: String,
    pub rows: Vec<HarvestRow>,
}

/// What happens to routes of this center that the batch no longer carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StalePolicy {
    /// Close their validity at the harvest timestamp (default).
    EndDate,
    /// Remove them outright.
    Delete,
}

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("structural: {0}")]
    Structural(String),
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Structural validation applied before any database work. A failure here
/// aborts the center's batch without touching the store.
pub fn validate(batch: &HarvestBatch) -> Result<(), BatchError> {
    let mut seen: HashMap<(String, String, String, String, DateTime<Utc>), DateTime<Utc>> =
        HashMap::new();

    for row in &batch.rows {
        for (what, epoch) in [
            ("network", &row.network),
            ("station", &row.station),
            ("channel", &row.channel),
        ] {
            if epoch.start >= epoch.end {
                return Err(BatchError::Structural(format!(
                    "{what} '{}' epoch ends before it starts",
                    epoch.code
                )));
            }
        }
        if row.route_start >= row.route_end {
            return Err(BatchError::Structural(format!(
                "route for {}.{} ends before it starts",
                row.network.code, row.station.code
            )));
        }

        let key = (
            row.network.code.clone(),
            row.station.code.clone(),
            row.location.clone(),
            row.channel.code.clone(),
            row.channel.start,
        );
        match seen.get(&key) {
            Some(end) if *end != row.channel.end => {
                return Err(BatchError::Structural(format!(
                    "duplicated channel epoch {}.{}.{}.{} starting {}",
                    key.0, key.1, key.2, key.3, key.4
                )));
            }
            _ => {
                seen.insert(key, row.channel.end);
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Upsert
// ---------------------------------------------------------------------------

/// Atomically swap one center's batch into the catalog.
pub async fn upsert_batch(
    pool: &PgPool,
    batch: &HarvestBatch,
    policy: StalePolicy,
    harvested_at: DateTime<Utc>,
) -> Result<(), BatchError> {
    validate(batch)?;

    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"INSERT INTO data_centers (center_id, routing_url, harvested_at)
           VALUES ($1, $2, $3)
           ON CONFLICT (center_id)
           DO UPDATE SET routing_url = EXCLUDED.routing_url,
                         harvested_at = EXCLUDED.harvested_at"#,
    )
    .bind(&batch.center_id)
    .bind(&batch.routing_url)
    .bind(harvested_at)
    .execute(&mut *tx)
    .await?;

    let mut kept_routes: Vec<i64> = Vec::with_capacity(batch.rows.len());

    for row in &batch.rows {
        let endpoint_id: i64 = sqlx::query(
            r#"INSERT INTO endpoints (center_id, service, url)
               VALUES ($1, $2, $3)
               ON CONFLICT (service, url)
               DO UPDATE SET center_id = EXCLUDED.center_id
               RETURNING endpoint_id"#,
        )
        .bind(&batch.center_id)
        .bind(row.service.as_str())
        .bind(&row.url)
        .fetch_one(&mut *tx)
        .await?
        .get("endpoint_id");

        let network_id: i64 = sqlx::query(
            r#"INSERT INTO networks (code, start_time, end_time)
               VALUES ($1, $2, $3)
               ON CONFLICT (code, start_time)
               DO UPDATE SET end_time = EXCLUDED.end_time
               RETURNING network_id"#,
        )
        .bind(&row.network.code)
        .bind(row.network.start)
        .bind(row.network.end)
        .fetch_one(&mut *tx)
        .await?
        .get("network_id");

        let station_id: i64 = sqlx::query(
            r#"INSERT INTO stations (network_id, code, start_time, end_time)
               VALUES ($1, $2, $3, $4)
               ON CONFLICT (network_id, code, start_time)
               DO UPDATE SET end_time = EXCLUDED.end_time
               RETURNING station_id"#,
        )
        .bind(network_id)
        .bind(&row.station.code)
        .bind(row.station.start)
        .bind(row.station.end)
        .fetch_one(&mut *tx)
        .await?
        .get("station_id");

        let channel_id: i64 = sqlx::query(
            r#"INSERT INTO channels (station_id, location, code, start_time, end_time)
               VALUES ($1, $2, $3, $4, $5)
               ON CONFLICT (station_id, location, code, start_time)
               DO UPDATE SET end_time = EXCLUDED.end_time
               RETURNING channel_id"#,
        )
        .bind(station_id)
        .bind(&row.location)
        .bind(&row.channel.code)
        .bind(row.channel.start)
        .bind(row.channel.end)
        .fetch_one(&mut *tx)
        .await?
        .get("channel_id");

        let route_id: i64 = sqlx::query(
            r#"INSERT INTO routes (channel_id, endpoint_id, start_time, end_time)
               VALUES ($1, $2, $3, $4)
               ON CONFLICT (channel_id, endpoint_id, start_time)
               DO UPDATE SET end_time = EXCLUDED.end_time
               RETURNING route_id"#,
        )
        .bind(channel_id)
        .bind(endpoint_id)
        .bind(row.route_start)
        .bind(row.route_end)
        .fetch_one(&mut *tx)
        .await?
        .get("route_id");

        kept_routes.push(route_id);
    }

    match policy {
        StalePolicy::Delete => {
            let deleted = sqlx::query(
                r#"DELETE FROM routes
                   WHERE endpoint_id IN
                         (SELECT endpoint_id FROM endpoints WHERE center_id = $1)
                     AND NOT (route_id = ANY($2))"#,
            )
            .bind(&batch.center_id)
            .bind(&kept_routes)
            .execute(&mut *tx)
            .await?
            .rows_affected();
            debug!(center = %batch.center_id, deleted, "stale routes removed");
        }
        StalePolicy::EndDate => {
            let closed = sqlx::query(
                r#"UPDATE routes SET end_time = $3
                   WHERE endpoint_id IN
                         (SELECT endpoint_id FROM endpoints WHERE center_id = $1)
                     AND NOT (route_id = ANY($2))
                     AND end_time > $3"#,
            )
            .bind(&batch.center_id)
            .bind(&kept_routes)
            .bind(harvested_at)
            .execute(&mut *tx)
            .await?
            .rows_affected();
            debug!(center = %batch.center_id, closed, "stale routes end-dated");
        }
    }

    tx.commit().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use fdsn_proto::time::far_future;

    fn at(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2020, 1, 1, h, 0, 0).unwrap()
    }

    fn epoch(code: &str) -> CodeEpoch {
        CodeEpoch {
            code: code.to_owned(),
            start: at(0),
            end: far_future(),
        }
    }

    fn valid_row() -> HarvestRow {
        HarvestRow {
            service: Service::Dataselect,
            url: "http://eth.example/fdsnws/dataselect/1/query".to_owned(),
            network: epoch("CH"),
            station: epoch("AAA"),
            location: String::new(),
            channel: epoch("HHZ"),
            route_start: at(0),
            route_end: far_future(),
        }
    }

    fn batch(rows: Vec<HarvestRow>) -> HarvestBatch {
        HarvestBatch {
            center_id: "eth".to_owned(),
            routing_url: "http://eth.example/routing.xml".to_owned(),
            rows,
        }
    }

    #[test]
    fn valid_batch_passes() {
        assert!(validate(&batch(vec![valid_row()])).is_ok());
    }

    #[test]
    fn inverted_channel_epoch_is_structural() {
        let mut row = valid_row();
        row.channel.start = at(2);
        row.channel.end = at(1);
        let err = validate(&batch(vec![row])).unwrap_err();
        assert!(matches!(err, BatchError::Structural(_)));
    }

    #[test]
    fn inverted_route_epoch_is_structural() {
        let mut row = valid_row();
        row.route_start = far_future();
        let err = validate(&batch(vec![row])).unwrap_err();
        assert!(matches!(err, BatchError::Structural(_)));
    }

    #[test]
    fn conflicting_duplicate_channel_epoch_is_structural() {
        let a = valid_row();
        let mut b = valid_row();
        b.channel.end = at(5);
        let err = validate(&batch(vec![a, b])).unwrap_err();
        assert!(matches!(err, BatchError::Structural(_)));
    }

    #[test]
    fn identical_duplicate_rows_are_tolerated() {
        // The same channel epoch routed to two services is legitimate.
        let a = valid_row();
        let mut b = valid_row();
        b.service = Service::Station;
        b.url = "http://eth.example/fdsnws/station/1/query".to_owned();
        assert!(validate(&batch(vec![a, b])).is_ok());
    }
}
