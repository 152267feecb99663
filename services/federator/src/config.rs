//! Federator configuration.
//!
//! One explicit value, built in `main` from CLI flags and passed into the
//! constructor; workers receive it through their job context. There is no
//! process-wide configuration singleton.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// What a terminal sub-request failure does to the rest of the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Fold failures into a 200 with the successful parts only.
    BestEffort,
    /// First terminal failure cancels the rest and fails the job.
    AllOrNothing,
}

impl FromStr for FailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "best-effort" => Ok(FailurePolicy::BestEffort),
            "all-or-nothing" => Ok(FailurePolicy::AllOrNothing),
            other => Err(format!(
                "unknown failure policy '{other}' (expected 'best-effort' or 'all-or-nothing')"
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FederatorConfig {
    /// Routing resolver query URL.
    pub routing_url: String,
    /// Root directory for per-job spool arenas.
    pub temp_dir: PathBuf,
    /// Global cap on in-flight sub-requests.
    pub max_in_flight: usize,
    /// Cap on in-flight sub-requests per endpoint.
    pub per_endpoint_max: usize,
    /// Whole-job deadline.
    pub job_deadline: Duration,
    /// Per-attempt deadline, further bounded by the remaining job deadline.
    pub request_timeout: Duration,
    /// Attempts per sub-request on 5xx/transport errors.
    pub max_attempts: u32,
    /// Backoff base; doubles per attempt.
    pub backoff_base: Duration,
    pub failure_policy: FailurePolicy,
    /// POST body ceiling per sub-request.
    pub post_byte_ceiling: usize,
    /// Epoch-count ceiling per POST sub-request.
    pub post_epoch_ceiling: usize,
    /// Groups at or below this epoch count go out as GETs.
    pub get_epoch_threshold: usize,
    /// Soft cap on total spooled bytes; dispatch waits below it.
    pub arena_quota_bytes: u64,
    /// Orphaned arenas older than this are purged.
    pub arena_max_age: Duration,
    /// `Cache-Control` emitted on federated responses; `None` emits nothing.
    pub cache_control: Option<String>,
}

impl Default for FederatorConfig {
    fn default() -> Self {
        FederatorConfig {
            routing_url: String::new(),
            temp_dir: std::env::temp_dir().join("federator"),
            max_in_flight: 16,
            per_endpoint_max: 4,
            job_deadline: Duration::from_secs(300),
            request_timeout: Duration::from_secs(30),
            max_attempts: 3,
            backoff_base: Duration::from_millis(250),
            failure_policy: FailurePolicy::BestEffort,
            post_byte_ceiling: 100 * 1024,
            post_epoch_ceiling: 500,
            get_epoch_threshold: 1,
            arena_quota_bytes: 1024 * 1024 * 1024,
            arena_max_age: Duration::from_secs(3600),
            cache_control: Some("no-store".to_owned()),
        }
    }
}
