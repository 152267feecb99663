use clap::Parser;
use stationlite::{AppState, db};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// StationLite routing resolver server.
#[derive(Parser, Debug)]
#[command(name = "stationlite", version)]
struct Args {
    /// Bind address, e.g. 0.0.0.0:8081
    #[arg(long, default_value = "0.0.0.0:8081")]
    bind: String,

    /// Postgres catalog URL.
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .init();

    info!("connecting to catalog...");
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
    info!("migrations applied");

    let state = AppState::new(pool);
    let router = stationlite::build_router(state);
    let listener = match tokio::net::TcpListener::bind(&args.bind).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(addr = %args.bind, error = %e, "failed to bind");
            std::process::exit(3);
        }
    };
    info!(addr = %args.bind, "resolver listening");
    if let Err(e) = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!(error = %e, "server error");
        std::process::exit(3);
    }
    info!("resolver shut down gracefully");
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
