//! Temp-file arena: scoped spool storage with guaranteed release.
//!
//! One directory per job, named by a random token, under a root the arena
//! owns. A job's arena is removed on every exit path: explicit cleanup, the
//! `Drop` fallback, the startup sweep, and the periodic purge of orphans.
//! A soft byte quota applies backpressure to the dispatcher.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, SystemTime};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

pub struct Arena {
    root: PathBuf,
    quota_limit: u64,
    quota_used: AtomicU64,
    freed: Notify,
}

impl Arena {
    /// Create (or adopt) the arena root.
    pub fn open(root: impl Into<PathBuf>, quota_bytes: u64) -> io::Result<Arc<Self>> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Arc::new(Arena {
            root,
            quota_limit: quota_bytes,
            quota_used: AtomicU64::new(0),
            freed: Notify::new(),
        }))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Allocate a fresh job directory.
    pub fn new_job(self: &Arc<Self>) -> io::Result<JobArena> {
        let token = Uuid::new_v4().simple().to_string();
        let dir = self.root.join(token);
        std::fs::create_dir(&dir)?;
        Ok(JobArena {
            arena: Arc::clone(self),
            dir,
            charged: AtomicU64::new(0),
            cleaned: AtomicBool::new(false),
        })
    }

    /// Wait until spooled bytes drop below the soft quota.
    pub async fn below_quota(&self) {
        loop {
            // Register before checking so a release between the check and
            // the await is not lost.
            let freed = self.freed.notified();
            if self.quota_used.load(Ordering::Acquire) < self.quota_limit {
                return;
            }
            freed.await;
        }
    }

    fn charge(&self, bytes: u64) {
        self.quota_used.fetch_add(bytes, Ordering::AcqRel);
    }

    fn release(&self, bytes: u64) {
        self.quota_used.fetch_sub(bytes, Ordering::AcqRel);
        self.freed.notify_waiters();
    }

    pub fn quota_used(&self) -> u64 {
        self.quota_used.load(Ordering::Acquire)
    }

    /// Remove job directories older than `age`. Used for the startup sweep
    /// of crash-orphaned arenas and by the periodic purge.
    pub fn sweep_older_than(&self, age: Duration) -> io::Result<usize> {
        let cutoff = SystemTime::now()
            .checked_sub(age)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let mut removed = 0;
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let modified = entry.metadata()?.modified()?;
            if modified < cutoff {
                match std::fs::remove_dir_all(entry.path()) {
                    Ok(()) => removed += 1,
                    Err(e) => warn!(path = %entry.path().display(), error = %e, "purge failed"),
                }
            }
        }
        if removed > 0 {
            debug!(removed, "orphaned arenas purged");
        }
        Ok(removed)
    }

    /// Background purge loop.
    pub fn spawn_purge(arena: Arc<Arena>, interval: Duration, max_age: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = arena.sweep_older_than(max_age) {
                    warn!(error = %e, "arena purge sweep failed");
                }
            }
        })
    }
}

/// The spool directory owned by one job.
pub struct JobArena {
    arena: Arc<Arena>,
    dir: PathBuf,
    charged: AtomicU64,
    cleaned: AtomicBool,
}

impl JobArena {
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Spool file path for one sub-request.
    pub fn spool_path(&self, index: usize) -> PathBuf {
        self.dir.join(format!("part-{index:04}.spool"))
    }

    /// Account bytes written into this arena against the quota.
    pub fn charge(&self, bytes: u64) {
        self.charged.fetch_add(bytes, Ordering::AcqRel);
        self.arena.charge(bytes);
    }

    pub async fn below_quota(&self) {
        self.arena.below_quota().await;
    }

    /// Remove the directory and release the quota charge. Idempotent.
    pub fn cleanup(&self) {
        if self.cleaned.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = std::fs::remove_dir_all(&self.dir) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(dir = %self.dir.display(), error = %e, "arena cleanup failed");
            }
        }
        let charged = self.charged.swap(0, Ordering::AcqRel);
        if charged > 0 {
            self.arena.release(charged);
        }
    }
}

impl Drop for JobArena {
    fn drop(&mut self) {
        self.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_arena(quota: u64) -> (tempfile::TempDir, Arc<Arena>) {
        let tmp = tempfile::tempdir().unwrap();
        let arena = Arena::open(tmp.path().join("spool"), quota).unwrap();
        (tmp, arena)
    }

    #[test]
    fn job_dirs_are_unique() {
        let (_tmp, arena) = test_arena(u64::MAX);
        let a = arena.new_job().unwrap();
        let b = arena.new_job().unwrap();
        assert_ne!(a.dir(), b.dir());
        assert!(a.dir().is_dir());
        assert!(b.dir().is_dir());
    }

    #[test]
    fn cleanup_removes_dir_and_releases_quota() {
        let (_tmp, arena) = test_arena(u64::MAX);
        let job = arena.new_job().unwrap();
        std::fs::write(job.spool_path(0), b"0123456789").unwrap();
        job.charge(10);
        assert_eq!(arena.quota_used(), 10);

        let dir = job.dir().to_owned();
        job.cleanup();
        assert!(!dir.exists());
        assert_eq!(arena.quota_used(), 0);

        // Idempotent.
        job.cleanup();
        assert_eq!(arena.quota_used(), 0);
    }

    #[test]
    fn drop_cleans_up() {
        let (_tmp, arena) = test_arena(u64::MAX);
        let dir = {
            let job = arena.new_job().unwrap();
            std::fs::write(job.spool_path(0), b"x").unwrap();
            job.charge(1);
            job.dir().to_owned()
        };
        assert!(!dir.exists());
        assert_eq!(arena.quota_used(), 0);
    }

    #[test]
    fn sweep_removes_only_old_dirs() {
        let (_tmp, arena) = test_arena(u64::MAX);
        let job = arena.new_job().unwrap();
        // Everything is fresh, nothing to purge.
        assert_eq!(arena.sweep_older_than(Duration::from_secs(3600)).unwrap(), 0);
        // With a zero age, the job directory is fair game.
        assert_eq!(arena.sweep_older_than(Duration::ZERO).unwrap(), 1);
        assert!(!job.dir().exists());
    }

    #[tokio::test]
    async fn below_quota_blocks_until_release() {
        let (_tmp, arena) = test_arena(8);
        let job = arena.new_job().unwrap();
        job.charge(8);

        let waiter = {
            let arena = Arc::clone(&arena);
            tokio::spawn(async move { arena.below_quota().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        job.cleanup();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("quota waiter should wake after release")
            .unwrap();
    }

    #[tokio::test]
    async fn below_quota_is_immediate_under_limit() {
        let (_tmp, arena) = test_arena(100);
        tokio::time::timeout(Duration::from_millis(100), arena.below_quota())
            .await
            .expect("should not block under quota");
    }
}
