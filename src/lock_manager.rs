// =============================================================================
// Resource Lock Manager — non-blocking, self-expiring exclusive locks
// =============================================================================
//
// At most one live lock exists per resource. A second acquire on a held
// resource fails immediately with `LockBusy`; nothing ever queues. A lock
// whose TTL has elapsed is reclaimed by the next acquire, so a crashed holder
// costs at most one TTL.
//
// The read-check-mutate sequence runs inside a single DashMap entry guard,
// which locks only the shard holding that resource.
// =============================================================================

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::errors::LockBusy;

/// A granted lock. The `token` identifies this particular grant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceLock {
    pub resource_id: String,
    pub holder_id: String,
    pub token: Uuid,
    pub acquired_at: Instant,
    pub acquired_at_utc: DateTime<Utc>,
    pub ttl: Duration,
}

impl ResourceLock {
    /// `None` when the TTL reaches past what `Instant` can represent; such a
    /// lock never expires on its own.
    pub fn expires_at(&self) -> Option<Instant> {
        self.acquired_at.checked_add(self.ttl)
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.expires_at().is_some_and(|at| now >= at)
    }

    pub fn remaining(&self, now: Instant) -> Duration {
        match self.expires_at() {
            Some(at) => at.saturating_duration_since(now),
            None => Duration::MAX,
        }
    }
}

/// Serialisable view of a held lock for operational dashboards.
#[derive(Debug, Clone, Serialize)]
pub struct LockInfo {
    pub resource_id: String,
    pub holder_id: String,
    pub acquired_at: DateTime<Utc>,
    pub ttl_ms: u64,
    pub remaining_ms: u64,
}

#[derive(Debug)]
pub struct LockManager {
    locks: DashMap<String, ResourceLock>,
    default_ttl: Duration,
}

impl LockManager {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            locks: DashMap::new(),
            default_ttl,
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    // -------------------------------------------------------------------------
    // Acquire / release
    // -------------------------------------------------------------------------

    pub fn try_acquire(
        &self,
        resource_id: &str,
        holder_id: &str,
        ttl: Duration,
    ) -> Result<ResourceLock, LockBusy> {
        self.try_acquire_at(resource_id, holder_id, ttl, Instant::now())
    }

    /// Grant the lock unless a live lock exists. An expired lock is replaced.
    pub fn try_acquire_at(
        &self,
        resource_id: &str,
        holder_id: &str,
        ttl: Duration,
        now: Instant,
    ) -> Result<ResourceLock, LockBusy> {
        let grant = ResourceLock {
            resource_id: resource_id.to_string(),
            holder_id: holder_id.to_string(),
            token: Uuid::new_v4(),
            acquired_at: now,
            acquired_at_utc: Utc::now(),
            ttl,
        };

        match self.locks.entry(resource_id.to_string()) {
            Entry::Occupied(mut held) => {
                if !held.get().is_expired(now) {
                    let current = held.get();
                    debug!(
                        resource_id,
                        requester = holder_id,
                        holder = %current.holder_id,
                        "lock busy"
                    );
                    return Err(LockBusy {
                        resource_id: resource_id.to_string(),
                        holder_id: current.holder_id.clone(),
                        expires_in: current.remaining(now),
                    });
                }
                warn!(
                    resource_id,
                    stale_holder = %held.get().holder_id,
                    new_holder = holder_id,
                    "reclaiming expired lock"
                );
                held.insert(grant.clone());
            }
            Entry::Vacant(slot) => {
                slot.insert(grant.clone());
            }
        }

        debug!(resource_id, holder = holder_id, ttl_ms = ttl.as_millis() as u64, "lock acquired");
        Ok(grant)
    }

    /// Release a lock. Only the exact grant (matching token) is removed, so a
    /// holder whose lock expired and was reclaimed cannot release the new one.
    pub fn release(&self, lock: &ResourceLock) -> bool {
        let removed = self
            .locks
            .remove_if(&lock.resource_id, |_, held| held.token == lock.token)
            .is_some();
        if removed {
            debug!(resource_id = %lock.resource_id, holder = %lock.holder_id, "lock released");
        } else {
            info!(
                resource_id = %lock.resource_id,
                holder = %lock.holder_id,
                "release ignored — lock no longer held by this grant"
            );
        }
        removed
    }

    // -------------------------------------------------------------------------
    // Inspection
    // -------------------------------------------------------------------------

    /// Holder of the live lock on `resource_id`, if any.
    pub fn holder_at(&self, resource_id: &str, now: Instant) -> Option<ResourceLock> {
        self.locks
            .get(resource_id)
            .filter(|l| !l.is_expired(now))
            .map(|l| l.clone())
    }

    /// Whether `lock` is still the live grant for its resource.
    pub fn is_held_by(&self, lock: &ResourceLock, now: Instant) -> bool {
        self.holder_at(&lock.resource_id, now)
            .map(|held| held.token == lock.token)
            .unwrap_or(false)
    }

    pub fn held_locks(&self) -> Vec<ResourceLock> {
        self.held_locks_at(Instant::now())
    }

    /// All live locks, sorted by resource.
    pub fn held_locks_at(&self, now: Instant) -> Vec<ResourceLock> {
        let mut held: Vec<ResourceLock> = self
            .locks
            .iter()
            .filter(|e| !e.value().is_expired(now))
            .map(|e| e.value().clone())
            .collect();
        held.sort_by(|a, b| a.resource_id.cmp(&b.resource_id));
        held
    }

    pub fn lock_infos(&self) -> Vec<LockInfo> {
        let now = Instant::now();
        self.held_locks_at(now)
            .into_iter()
            .map(|l| LockInfo {
                remaining_ms: l.remaining(now).as_millis() as u64,
                ttl_ms: l.ttl.as_millis() as u64,
                acquired_at: l.acquired_at_utc,
                holder_id: l.holder_id,
                resource_id: l.resource_id,
            })
            .collect()
    }

    /// Drop expired locks. Returns how many were reaped.
    pub fn purge_expired_at(&self, now: Instant) -> usize {
        let before = self.locks.len();
        self.locks.retain(|_, l| !l.is_expired(now));
        let reaped = before.saturating_sub(self.locks.len());
        if reaped > 0 {
            info!(reaped, "expired locks purged");
        }
        reaped
    }

    pub fn purge_expired(&self) -> usize {
        self.purge_expired_at(Instant::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};

    const TTL: Duration = Duration::from_secs(30);

    #[test]
    fn second_acquire_is_busy() {
        let mgr = LockManager::new(TTL);
        let now = Instant::now();
        let lock = mgr.try_acquire_at("BTCUSDT", "worker-1", TTL, now).unwrap();
        let busy = mgr.try_acquire_at("BTCUSDT", "worker-2", TTL, now).unwrap_err();
        assert_eq!(busy.holder_id, "worker-1");
        assert_eq!(busy.expires_in, TTL);

        assert!(mgr.release(&lock));
        assert!(mgr.try_acquire_at("BTCUSDT", "worker-2", TTL, now).is_ok());
    }

    #[test]
    fn different_resources_do_not_conflict() {
        let mgr = LockManager::new(TTL);
        assert!(mgr.try_acquire("BTCUSDT", "w1", TTL).is_ok());
        assert!(mgr.try_acquire("ETHUSDT", "w1", TTL).is_ok());
        assert_eq!(mgr.held_locks().len(), 2);
    }

    #[test]
    fn concurrent_acquires_yield_exactly_one_winner() {
        let mgr = Arc::new(LockManager::new(TTL));
        let workers = 32;
        let barrier = Arc::new(Barrier::new(workers));

        let results: Vec<bool> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..workers)
                .map(|i| {
                    let mgr = Arc::clone(&mgr);
                    let barrier = Arc::clone(&barrier);
                    scope.spawn(move || {
                        barrier.wait();
                        mgr.try_acquire("BTCUSDT", &format!("worker-{i}"), TTL).is_ok()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(results.iter().filter(|ok| **ok).count(), 1);
        assert_eq!(results.iter().filter(|ok| !**ok).count(), workers - 1);
    }

    #[test]
    fn lock_is_reclaimed_after_ttl_and_not_before() {
        let mgr = LockManager::new(TTL);
        let t0 = Instant::now();
        mgr.try_acquire_at("BTCUSDT", "crashed", TTL, t0).unwrap();

        let just_before = t0 + TTL - Duration::from_millis(1);
        assert!(mgr.try_acquire_at("BTCUSDT", "next", TTL, just_before).is_err());

        let lock = mgr.try_acquire_at("BTCUSDT", "next", TTL, t0 + TTL).unwrap();
        assert_eq!(lock.holder_id, "next");
    }

    #[test]
    fn stale_holder_cannot_release_reclaimed_lock() {
        let mgr = LockManager::new(TTL);
        let t0 = Instant::now();
        let stale = mgr.try_acquire_at("BTCUSDT", "slow", TTL, t0).unwrap();
        let fresh = mgr.try_acquire_at("BTCUSDT", "fast", TTL, t0 + TTL).unwrap();

        assert!(!mgr.release(&stale));
        assert!(mgr.is_held_by(&fresh, t0 + TTL));
        assert!(mgr.release(&fresh));
        assert!(!mgr.release(&fresh));
    }

    #[test]
    fn unrepresentable_ttl_never_expires() {
        let mgr = LockManager::new(TTL);
        let t0 = Instant::now();
        let lock = mgr.try_acquire_at("BTCUSDT", "w", Duration::MAX, t0).unwrap();
        assert_eq!(lock.expires_at(), None);
        assert!(!lock.is_expired(t0 + Duration::from_secs(86_400 * 365)));

        let busy = mgr.try_acquire_at("BTCUSDT", "other", TTL, t0).unwrap_err();
        assert_eq!(busy.expires_in, Duration::MAX);
        assert_eq!(mgr.lock_infos().len(), 1);
        assert!(mgr.release(&lock));
    }

    #[test]
    fn held_locks_skip_expired_and_purge_reaps_them() {
        let mgr = LockManager::new(TTL);
        let t0 = Instant::now();
        mgr.try_acquire_at("A", "w", Duration::from_secs(1), t0).unwrap();
        mgr.try_acquire_at("B", "w", TTL, t0).unwrap();

        let later = t0 + Duration::from_secs(2);
        let held = mgr.held_locks_at(later);
        assert_eq!(held.len(), 1);
        assert_eq!(held[0].resource_id, "B");

        assert_eq!(mgr.purge_expired_at(later), 1);
        assert_eq!(mgr.purge_expired_at(later), 0);
    }
}
