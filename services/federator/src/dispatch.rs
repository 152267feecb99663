//! Concurrent dispatch and spooling.
//!
//! A job's sub-requests run as tokio tasks under two caps: a process-wide
//! in-flight limit and a per-endpoint limit. Bodies stream chunk-by-chunk
//! into the job's arena; nothing is accumulated in memory. Cancellation is
//! a watch flag observed between I/O steps; a dropped job (client gone)
//! reads as cancelled.
//!
//! # Sub-request states
//! `pending → in-flight → {ok, no-data, client-error, server-error,
//! timeout, cancelled}`. 5xx and transport errors re-enter `pending` with
//! backoff until `max_attempts`; 4xx is terminal for the sub-request only;
//! an upstream 204 is the empty success `no-data`.

use crate::arena::JobArena;
use crate::config::{FailurePolicy, FederatorConfig};
use crate::decompose::{Method, SubRequest};
use futures_util::StreamExt;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Limits
// ---------------------------------------------------------------------------

/// Process-wide admission caps, shared by all jobs.
pub struct DispatchLimits {
    global: Arc<Semaphore>,
    per_endpoint_max: usize,
    per_endpoint: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl DispatchLimits {
    pub fn new(max_in_flight: usize, per_endpoint_max: usize) -> Arc<Self> {
        Arc::new(DispatchLimits {
            global: Arc::new(Semaphore::new(max_in_flight.max(1))),
            per_endpoint_max: per_endpoint_max.max(1),
            per_endpoint: Mutex::new(HashMap::new()),
        })
    }

    fn global_sem(&self) -> Arc<Semaphore> {
        Arc::clone(&self.global)
    }

    fn endpoint_sem(&self, url: &str) -> Arc<Semaphore> {
        let mut map = self.per_endpoint.lock().unwrap();
        Arc::clone(
            map.entry(url.to_owned())
                .or_insert_with(|| Arc::new(Semaphore::new(self.per_endpoint_max))),
        )
    }
}

// ---------------------------------------------------------------------------
// Part states
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartState {
    Ok,
    /// Upstream 204: an empty success.
    NoData,
    ClientError(u16),
    ServerError(String),
    Timeout,
    Cancelled,
}

impl PartState {
    pub fn is_success(&self) -> bool {
        matches!(self, PartState::Ok | PartState::NoData)
    }

    /// Short label for the diagnostic response header.
    pub fn label(&self) -> &'static str {
        match self {
            PartState::Ok => "ok",
            PartState::NoData => "nodata",
            PartState::ClientError(_) => "4xx",
            PartState::ServerError(_) => "5xx",
            PartState::Timeout => "timeout",
            PartState::Cancelled => "cancelled",
        }
    }
}

/// A sub-request that reached a terminal state.
#[derive(Debug)]
pub struct CompletedPart {
    pub request: SubRequest,
    pub state: PartState,
    pub spool: Option<PathBuf>,
    pub bytes: u64,
    pub attempts: u32,
}

// ---------------------------------------------------------------------------
// Job execution
// ---------------------------------------------------------------------------

/// Run every sub-request of one job to a terminal state.
///
/// Returns the parts sorted by merge order. In all-or-nothing mode the
/// first terminal failure raises the cancel flag for the rest.
pub async fn run_job(
    http: reqwest::Client,
    limits: Arc<DispatchLimits>,
    job: Arc<JobArena>,
    requests: Vec<SubRequest>,
    cfg: Arc<FederatorConfig>,
) -> Vec<CompletedPart> {
    let deadline = Instant::now() + cfg.job_deadline;
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let mut set: JoinSet<CompletedPart> = JoinSet::new();

    for (index, request) in requests.into_iter().enumerate() {
        let http = http.clone();
        let limits = Arc::clone(&limits);
        let job = Arc::clone(&job);
        let cfg = Arc::clone(&cfg);
        let cancel = cancel_rx.clone();
        set.spawn(async move {
            run_sub_request(http, limits, job, cfg, request, index, deadline, cancel).await
        });
    }
    drop(cancel_rx);

    let mut parts = Vec::new();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(part) => {
                debug!(
                    endpoint = %part.request.endpoint,
                    state = part.state.label(),
                    attempts = part.attempts,
                    bytes = part.bytes,
                    "sub-request finished"
                );
                if cfg.failure_policy == FailurePolicy::AllOrNothing && !part.state.is_success() {
                    let _ = cancel_tx.send(true);
                }
                parts.push(part);
            }
            Err(e) => warn!(error = %e, "sub-request task failed"),
        }
    }

    parts.sort_by_key(|p| p.request.order_key());
    parts
}

/// Resolve once the cancel flag is raised or the job handle is gone.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow() {
            return;
        }
        if cancel.changed().await.is_err() {
            return;
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_sub_request(
    http: reqwest::Client,
    limits: Arc<DispatchLimits>,
    job: Arc<JobArena>,
    cfg: Arc<FederatorConfig>,
    request: SubRequest,
    index: usize,
    deadline: Instant,
    mut cancel: watch::Receiver<bool>,
) -> CompletedPart {
    let complete = |state: PartState, spool: Option<PathBuf>, bytes: u64, attempts: u32| {
        CompletedPart {
            request: request.clone(),
            state,
            spool,
            bytes,
            attempts,
        }
    };

    // FIFO admission under the global cap, then the endpoint cap, then the
    // arena quota. Cancellation can arrive while queued.
    let _global = tokio::select! {
        biased;
        _ = cancelled(&mut cancel) => return complete(PartState::Cancelled, None, 0, 0),
        permit = limits.global_sem().acquire_owned() => match permit {
            Ok(permit) => permit,
            Err(_) => return complete(PartState::Cancelled, None, 0, 0),
        },
    };
    let _endpoint = tokio::select! {
        biased;
        _ = cancelled(&mut cancel) => return complete(PartState::Cancelled, None, 0, 0),
        permit = limits.endpoint_sem(&request.endpoint).acquire_owned() => match permit {
            Ok(permit) => permit,
            Err(_) => return complete(PartState::Cancelled, None, 0, 0),
        },
    };
    tokio::select! {
        biased;
        _ = cancelled(&mut cancel) => return complete(PartState::Cancelled, None, 0, 0),
        () = job.below_quota() => {}
    }

    let mut attempts = 0u32;
    loop {
        attempts += 1;
        let now = Instant::now();
        if now >= deadline {
            return complete(PartState::Timeout, None, 0, attempts);
        }
        let attempt_deadline = now + cfg.request_timeout.min(deadline - now);

        match attempt(&http, &job, index, &request, attempt_deadline, &mut cancel).await {
            AttemptOutcome::Ok { spool, bytes } => {
                return complete(PartState::Ok, Some(spool), bytes, attempts);
            }
            AttemptOutcome::NoData => return complete(PartState::NoData, None, 0, attempts),
            AttemptOutcome::ClientError(code) => {
                return complete(PartState::ClientError(code), None, 0, attempts);
            }
            AttemptOutcome::Timeout => return complete(PartState::Timeout, None, 0, attempts),
            AttemptOutcome::Cancelled => return complete(PartState::Cancelled, None, 0, attempts),
            AttemptOutcome::Disk(message) => {
                return complete(PartState::ServerError(message), None, 0, attempts);
            }
            AttemptOutcome::Retriable(message) => {
                if attempts >= cfg.max_attempts {
                    return complete(PartState::ServerError(message), None, 0, attempts);
                }
                let backoff = cfg.backoff_base * 2u32.saturating_pow(attempts - 1);
                if Instant::now() + backoff >= deadline {
                    return complete(PartState::ServerError(message), None, 0, attempts);
                }
                warn!(endpoint = %request.endpoint, attempts, error = %message, "retrying");
                tokio::select! {
                    biased;
                    _ = cancelled(&mut cancel) => {
                        return complete(PartState::Cancelled, None, 0, attempts);
                    }
                    () = tokio::time::sleep(backoff) => {}
                }
            }
        }
    }
}

enum AttemptOutcome {
    Ok { spool: PathBuf, bytes: u64 },
    NoData,
    ClientError(u16),
    Timeout,
    Cancelled,
    /// 5xx or transport error; the retry policy decides.
    Retriable(String),
    /// Local spool write failure; terminal server-error.
    Disk(String),
}

async fn attempt(
    http: &reqwest::Client,
    job: &JobArena,
    index: usize,
    request: &SubRequest,
    attempt_deadline: Instant,
    cancel: &mut watch::Receiver<bool>,
) -> AttemptOutcome {
    let builder = match request.method {
        Method::Get => http.get(request.full_url()),
        Method::Post => http
            .post(&request.endpoint)
            .header(reqwest::header::CONTENT_TYPE, "text/plain")
            .body(request.body.clone().unwrap_or_default()),
    };

    let response = tokio::select! {
        biased;
        _ = cancelled(cancel) => return AttemptOutcome::Cancelled,
        sent = tokio::time::timeout_at(attempt_deadline, builder.send()) => match sent {
            Err(_) => return AttemptOutcome::Timeout,
            Ok(Err(e)) => return AttemptOutcome::Retriable(e.to_string()),
            Ok(Ok(response)) => response,
        }
    };

    let status = response.status();
    if status.as_u16() == 204 {
        return AttemptOutcome::NoData;
    }
    if status.is_client_error() {
        return AttemptOutcome::ClientError(status.as_u16());
    }
    if !status.is_success() {
        return AttemptOutcome::Retriable(format!("upstream status {}", status.as_u16()));
    }

    let spool = job.spool_path(index);
    let mut file = match tokio::fs::File::create(&spool).await {
        Ok(file) => file,
        Err(e) => return AttemptOutcome::Disk(format!("spool create: {e}")),
    };

    let discard = |spool: &PathBuf| {
        let _ = std::fs::remove_file(spool);
    };

    let mut stream = response.bytes_stream();
    let mut bytes = 0u64;
    loop {
        let chunk = tokio::select! {
            biased;
            _ = cancelled(cancel) => {
                discard(&spool);
                return AttemptOutcome::Cancelled;
            }
            next = tokio::time::timeout_at(attempt_deadline, stream.next()) => match next {
                Err(_) => {
                    discard(&spool);
                    return AttemptOutcome::Timeout;
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    discard(&spool);
                    return AttemptOutcome::Retriable(e.to_string());
                }
                Ok(Some(Ok(chunk))) => chunk,
            }
        };
        if let Err(e) = file.write_all(&chunk).await {
            discard(&spool);
            return AttemptOutcome::Disk(format!("spool write: {e}"));
        }
        bytes += chunk.len() as u64;
        job.charge(chunk.len() as u64);
    }

    if let Err(e) = file.flush().await {
        discard(&spool);
        return AttemptOutcome::Disk(format!("spool flush: {e}"));
    }
    AttemptOutcome::Ok { spool, bytes }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_labels_for_header() {
        assert_eq!(PartState::Ok.label(), "ok");
        assert_eq!(PartState::ServerError("boom".to_owned()).label(), "5xx");
        assert_eq!(PartState::ClientError(404).label(), "4xx");
        assert_eq!(PartState::Timeout.label(), "timeout");
        assert_eq!(PartState::Cancelled.label(), "cancelled");
        assert_eq!(PartState::NoData.label(), "nodata");
    }

    #[test]
    fn success_covers_ok_and_nodata_only() {
        assert!(PartState::Ok.is_success());
        assert!(PartState::NoData.is_success());
        assert!(!PartState::ClientError(400).is_success());
        assert!(!PartState::Timeout.is_success());
    }

    #[test]
    fn endpoint_semaphores_are_shared_per_url() {
        let limits = DispatchLimits::new(8, 2);
        let a = limits.endpoint_sem("http://eth.example/q");
        let b = limits.endpoint_sem("http://eth.example/q");
        let c = limits.endpoint_sem("http://bgr.example/q");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(a.available_permits(), 2);
    }

    #[tokio::test]
    async fn cancelled_resolves_when_sender_drops() {
        let (tx, mut rx) = watch::channel(false);
        drop(tx);
        tokio::time::timeout(std::time::Duration::from_millis(100), cancelled(&mut rx))
            .await
            .expect("dropped sender must read as cancelled");
    }

    #[tokio::test]
    async fn cancelled_resolves_on_flag() {
        let (tx, mut rx) = watch::channel(false);
        let waiter = tokio::spawn(async move {
            cancelled(&mut rx).await;
        });
        tx.send(true).unwrap();
        tokio::time::timeout(std::time::Duration::from_millis(100), waiter)
            .await
            .expect("raised flag must read as cancelled")
            .unwrap();
    }
}
