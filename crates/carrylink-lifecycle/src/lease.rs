//! Per-match lease: a keyed async mutex with a bounded wait.
//!
//! Mutations on one match run one at a time; distinct matches never
//! contend. Waiting longer than the configured bound fails with
//! `LeaseTimeout` instead of queueing forever behind a hung request.
//! Idle locks are dropped from the map when their last holder lets go.

use std::sync::Arc;
use std::time::Duration;

use carrylink_types::{CarrylinkError, MatchId, Result};
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

type LockMap = DashMap<MatchId, Arc<Mutex<()>>>;

/// Registry of per-match locks.
pub struct MatchLeases {
    locks: Arc<LockMap>,
    wait: Duration,
}

impl MatchLeases {
    #[must_use]
    pub fn new(wait: Duration) -> Self {
        Self {
            locks: Arc::new(DashMap::new()),
            wait,
        }
    }

    /// Wait (at most the configured bound) for exclusive access to `match_id`.
    ///
    /// # Errors
    /// [`CarrylinkError::LeaseTimeout`] if another request holds the lease
    /// for longer than the wait bound.
    pub async fn acquire(&self, match_id: MatchId) -> Result<MatchLease> {
        let lock = self.locks.entry(match_id).or_default().clone();
        match tokio::time::timeout(self.wait, lock.lock_owned()).await {
            Ok(guard) => Ok(MatchLease {
                match_id,
                guard: Some(guard),
                locks: Arc::clone(&self.locks),
            }),
            Err(_) => {
                release_idle(&self.locks, match_id);
                let waited_ms = u64::try_from(self.wait.as_millis()).unwrap_or(u64::MAX);
                tracing::warn!(%match_id, waited_ms, "match lease wait timed out");
                Err(CarrylinkError::LeaseTimeout { match_id, waited_ms })
            }
        }
    }

    /// Number of matches with a held or awaited lease.
    #[must_use]
    pub fn active(&self) -> usize {
        self.locks.len()
    }
}

/// Exclusive access to one match until dropped.
pub struct MatchLease {
    match_id: MatchId,
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<LockMap>,
}

impl MatchLease {
    #[must_use]
    pub fn match_id(&self) -> MatchId {
        self.match_id
    }
}

impl Drop for MatchLease {
    fn drop(&mut self) {
        drop(self.guard.take());
        release_idle(&self.locks, self.match_id);
    }
}

/// Remove the lock for `match_id` if nobody holds or awaits it.
fn release_idle(locks: &LockMap, match_id: MatchId) {
    locks.remove_if(&match_id, |_, lock| Arc::strong_count(lock) == 1);
}
