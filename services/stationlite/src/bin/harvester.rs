use clap::Parser;
use stationlite::db;
use stationlite::harvest::{self, RetryPolicy};
use stationlite::repo::batch::{BatchError, StalePolicy};
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Refresh the routing catalog from upstream routing configurations.
#[derive(Parser, Debug)]
#[command(name = "harvester", version)]
struct Args {
    /// Postgres catalog URL.
    database_url: String,

    /// Routing-configuration source URL; repeat once per data center.
    #[arg(long = "routing", required = true)]
    routing: Vec<String>,

    /// Only harvest the center with this id.
    #[arg(long)]
    center: Option<String>,

    /// Per-fetch retry attempts.
    #[arg(long, default_value_t = 3)]
    max_attempts: u32,

    /// Backoff base in milliseconds (doubles per attempt).
    #[arg(long, default_value_t = 500)]
    backoff_base_ms: u64,

    /// Total per-fetch retry deadline in seconds.
    #[arg(long, default_value_t = 300)]
    deadline_secs: u64,

    /// Remove stale routes instead of end-dating them.
    #[arg(long)]
    delete_stale: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .init();

    let policy = RetryPolicy {
        max_attempts: args.max_attempts.max(1),
        backoff_base: Duration::from_millis(args.backoff_base_ms),
        deadline: Duration::from_secs(args.deadline_secs),
    };
    let stale = if args.delete_stale {
        StalePolicy::Delete
    } else {
        StalePolicy::EndDate
    };

    let pool = match db::create_pool(&args.database_url).await {
        Ok(pool) => pool,
        Err(e) => {
            error!(error = %e, "cannot reach the catalog");
            std::process::exit(2);
        }
    };
    if let Err(e) = db::run_migrations(&pool).await {
        error!(error = %e, "migrations failed");
        std::process::exit(2);
    }

    let client = reqwest::Client::new();
    let mut harvested = 0usize;
    for routing_url in &args.routing {
        match harvest::harvest_center(
            &client,
            &pool,
            routing_url,
            &policy,
            stale,
            args.center.as_deref(),
        )
        .await
        {
            Ok(Some(summary)) => {
                info!(center = %summary.center_id, routes = summary.routes, "harvested");
                harvested += 1;
            }
            Ok(None) => {
                info!(url = %routing_url, "skipped by center filter");
            }
            // The catalog going away is fatal; a single center failing is not.
            Err(harvest::HarvestError::Batch(BatchError::Db(e))) => {
                error!(url = %routing_url, error = %e, "catalog write failed");
                std::process::exit(2);
            }
            Err(e) => {
                warn!(url = %routing_url, error = %e, "center harvest failed, prior state kept");
            }
        }
    }

    info!(harvested, total = args.routing.len(), "harvest run complete");
}
