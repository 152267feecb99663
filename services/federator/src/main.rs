use clap::Parser;
use federator::config::{FailurePolicy, FederatorConfig};
use federator::{AppState, arena::Arena};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// FDSN federation gateway.
#[derive(Parser, Debug)]
#[command(name = "federator", version)]
struct Args {
    /// Bind address, e.g. 0.0.0.0:8080
    #[arg(long, default_value = "0.0.0.0:8080")]
    bind: String,

    /// Routing resolver query URL.
    #[arg(long)]
    routing_url: String,

    /// Root directory for per-job spool arenas.
    #[arg(long, default_value = "/var/tmp/federator")]
    temp_dir: PathBuf,

    /// Global cap on in-flight sub-requests.
    #[arg(long, default_value_t = 16)]
    max_in_flight: usize,

    /// Cap on in-flight sub-requests per endpoint.
    #[arg(long, default_value_t = 4)]
    per_endpoint_max: usize,

    /// Whole-job deadline in seconds.
    #[arg(long, default_value_t = 300)]
    job_deadline_secs: u64,

    /// Per-attempt upstream timeout in seconds.
    #[arg(long, default_value_t = 30)]
    request_timeout_secs: u64,

    /// Attempts per sub-request on 5xx/transport errors.
    #[arg(long, default_value_t = 3)]
    max_attempts: u32,

    /// Backoff base in milliseconds (doubles per attempt).
    #[arg(long, default_value_t = 250)]
    backoff_base_ms: u64,

    /// 'best-effort' or 'all-or-nothing'.
    #[arg(long, default_value = "best-effort")]
    failure_policy: FailurePolicy,

    /// POST body ceiling per upstream sub-request, in bytes.
    #[arg(long, default_value_t = 100 * 1024)]
    post_byte_ceiling: usize,

    /// Epoch-count ceiling per upstream POST sub-request.
    #[arg(long, default_value_t = 500)]
    post_epoch_ceiling: usize,

    /// Soft cap on total spooled bytes.
    #[arg(long, default_value_t = 1024 * 1024 * 1024)]
    arena_quota_bytes: u64,

    /// Purge orphaned spool arenas older than this many seconds.
    #[arg(long, default_value_t = 3600)]
    arena_max_age_secs: u64,

    /// Cache-Control for federated responses; 'none' omits the header.
    #[arg(long, default_value = "no-store")]
    cache_control: String,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .init();

    let bind: SocketAddr = match args.bind.parse() {
        Ok(addr) => addr,
        Err(e) => {
            error!(bind = %args.bind, error = %e, "invalid bind address");
            std::process::exit(1);
        }
    };

    let cfg = FederatorConfig {
        routing_url: args.routing_url,
        temp_dir: args.temp_dir,
        max_in_flight: args.max_in_flight,
        per_endpoint_max: args.per_endpoint_max,
        job_deadline: Duration::from_secs(args.job_deadline_secs),
        request_timeout: Duration::from_secs(args.request_timeout_secs),
        max_attempts: args.max_attempts.max(1),
        backoff_base: Duration::from_millis(args.backoff_base_ms),
        failure_policy: args.failure_policy,
        post_byte_ceiling: args.post_byte_ceiling,
        post_epoch_ceiling: args.post_epoch_ceiling.max(1),
        get_epoch_threshold: 1,
        arena_quota_bytes: args.arena_quota_bytes,
        arena_max_age: Duration::from_secs(args.arena_max_age_secs),
        cache_control: match args.cache_control.as_str() {
            "" | "none" => None,
            other => Some(other.to_owned()),
        },
    };

    let purge_age = cfg.arena_max_age;
    let state = match AppState::new(cfg) {
        Ok(state) => state,
        Err(e) => {
            error!(error = %e, "cannot initialize the spool arena");
            std::process::exit(3);
        }
    };
    let _purge = Arena::spawn_purge(
        Arc::clone(&state.arena),
        Duration::from_secs(60),
        purge_age,
    );

    let router = federator::build_router(state);
    let listener = match tokio::net::TcpListener::bind(bind).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(addr = %bind, error = %e, "failed to bind");
            std::process::exit(3);
        }
    };
    info!(addr = %bind, "federator listening");
    if let Err(e) = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!(error = %e, "server error");
        std::process::exit(3);
    }
    info!("federator shut down gracefully");
}

/// Waits for SIGTERM or Ctrl-C (SIGINT) and returns to trigger graceful shutdown.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { tracing::info!("received Ctrl+C, shutting down"); },
        _ = terminate => { tracing::info!("received SIGTERM, shutting down"); },
    }
}
