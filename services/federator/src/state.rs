use crate::arena::Arena;
use crate::config::FederatorConfig;
use crate::dispatch::DispatchLimits;
use crate::routing::RoutingClient;
use std::sync::Arc;

/// Shared handle passed to every federator handler. Holds the explicit
/// configuration value and the process-wide dispatch resources.
#[derive(Clone)]
pub struct AppState {
    pub cfg: Arc<FederatorConfig>,
    pub http: reqwest::Client,
    pub routing: RoutingClient,
    pub limits: Arc<DispatchLimits>,
    pub arena: Arc<Arena>,
}

impl AppState {
    pub fn new(cfg: FederatorConfig) -> std::io::Result<Self> {
        let arena = Arena::open(cfg.temp_dir.clone(), cfg.arena_quota_bytes)?;
        // Crash-recovery sweep of arenas orphaned by a previous run.
        arena.sweep_older_than(cfg.arena_max_age)?;
        let http = reqwest::Client::new();
        let routing = RoutingClient::new(http.clone(), cfg.routing_url.clone());
        let limits = DispatchLimits::new(cfg.max_in_flight, cfg.per_endpoint_max);
        Ok(AppState {
            cfg: Arc::new(cfg),
            http,
            routing,
            limits,
            arena,
        })
    }
}
