//! Worker leases.
//!
//! A lease is created or refreshed whenever a worker polls or reports, and
//! lapses if neither happens within the lease timeout. Revoking a lease hands
//! its assignment back to the build queue for requeueing.

use crate::{OperationName, Platform};
use core::fmt;
use core::time::Duration;
use std::collections::HashMap;
use tokio::time::Instant;

/// Identity a worker chooses for itself.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for WorkerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for WorkerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug)]
pub(crate) struct WorkerLease {
    pub(crate) id: WorkerId,
    pub(crate) platform: Platform,
    pub(crate) assignment: Option<OperationName>,
    pub(crate) expires_at: Instant,
}

pub(crate) struct WorkerPool {
    leases: HashMap<WorkerId, WorkerLease>,
    lease_timeout: Duration,
}

impl WorkerPool {
    pub(crate) fn new(lease_timeout: Duration) -> Self {
        Self {
            leases: HashMap::new(),
            lease_timeout,
        }
    }

    /// Registers a worker, or refreshes its lease and declared platform.
    pub(crate) fn refresh(
        &mut self,
        id: &WorkerId,
        platform: Platform,
        now: Instant,
    ) -> &mut WorkerLease {
        let expires_at = now + self.lease_timeout;
        let lease = self
            .leases
            .entry(id.clone())
            .or_insert_with(|| WorkerLease {
                id: id.clone(),
                platform: Platform::new(),
                assignment: None,
                expires_at,
            });
        lease.platform = platform;
        lease.expires_at = expires_at;
        lease
    }

    /// Extends an existing lease without touching its platform. Returns
    /// `None` if the worker holds no lease.
    pub(crate) fn touch(&mut self, id: &WorkerId, now: Instant) -> Option<&mut WorkerLease> {
        let lease = self.leases.get_mut(id)?;
        lease.expires_at = now + self.lease_timeout;
        Some(lease)
    }

    pub(crate) fn get_mut(&mut self, id: &WorkerId) -> Option<&mut WorkerLease> {
        self.leases.get_mut(id)
    }

    /// Removes and returns every lease that lapsed at or before `now`.
    pub(crate) fn drain_expired(&mut self, now: Instant) -> Vec<WorkerLease> {
        let expired: Vec<WorkerId> = self
            .leases
            .values()
            .filter(|lease| lease.expires_at <= now)
            .map(|lease| lease.id.clone())
            .collect();

        expired
            .iter()
            .filter_map(|id| self.leases.remove(id))
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.leases.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn refresh_extends_lease_and_replaces_platform() {
        let mut pool = WorkerPool::new(Duration::from_secs(10));
        let id = WorkerId::from("w1");
        let start = Instant::now();

        pool.refresh(&id, Platform::new().with_property("os", "linux"), start);
        let lease = pool.refresh(&id, Platform::new(), start + Duration::from_secs(5));

        assert_eq!(lease.expires_at, start + Duration::from_secs(15));
        assert!(lease.platform.is_empty());
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn drain_expired_only_returns_lapsed_leases() {
        let mut pool = WorkerPool::new(Duration::from_secs(10));
        let start = Instant::now();

        pool.refresh(&"old".into(), Platform::new(), start);
        pool.refresh(&"new".into(), Platform::new(), start + Duration::from_secs(5));

        let expired = pool.drain_expired(start + Duration::from_secs(10));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id.as_str(), "old");
        assert_eq!(pool.len(), 1);

        assert!(pool.touch(&"old".into(), start).is_none());
        assert!(pool.touch(&"new".into(), start).is_some());
    }
}
