//! Live worker registry
//!
//! Maps a stable worker identity to the backend connection currently bound
//! to it and the instant it expires unless refreshed. A sorted snapshot of
//! the live workers is rebuilt whenever membership changes, and requests are
//! assigned with `snapshot[xxh32(key) % len]`.
//!
//! This is plain hash-mod sharding: any membership change reshuffles most
//! key assignments.

use crate::broker::ConnId;
use parking_lot::Mutex;
use sliceio_common::WorkerIdentity;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use xxhash_rust::xxh32::xxh32;

/// 32-bit routing hash of a request key
#[must_use]
pub fn key_hash(key: &[u8]) -> u32 {
    xxh32(key, 0)
}

/// Registration of one worker
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WorkerEntry {
    /// Backend connection the worker is reachable on
    pub conn_id: ConnId,
    /// The worker is purged once this instant has passed
    pub expiry: Instant,
}

#[derive(Default)]
struct Inner {
    workers: BTreeMap<WorkerIdentity, WorkerEntry>,
    /// Selectable backends, ordered by identity
    selectable: Vec<(WorkerIdentity, ConnId)>,
}

impl Inner {
    fn rebuild(&mut self) {
        self.selectable = self
            .workers
            .iter()
            .map(|(identity, entry)| (identity.clone(), entry.conn_id))
            .collect();
    }
}

/// Registry of live workers
pub struct WorkerRegistry {
    expiry: Duration,
    inner: Mutex<Inner>,
}

impl WorkerRegistry {
    /// Create a registry whose entries live for `expiry` after each refresh
    #[must_use]
    pub fn new(expiry: Duration) -> Self {
        Self {
            expiry,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Record a liveness signal from `identity` on connection `conn_id`.
    ///
    /// Returns true when the worker was not registered before.
    pub fn set_worker_ready(&self, identity: &WorkerIdentity, conn_id: ConnId) -> bool {
        self.set_worker_ready_at(identity, conn_id, Instant::now())
    }

    pub fn set_worker_ready_at(
        &self,
        identity: &WorkerIdentity,
        conn_id: ConnId,
        now: Instant,
    ) -> bool {
        let expiry = now + self.expiry;
        let mut inner = self.inner.lock();

        if let Some(entry) = inner.workers.get_mut(identity) {
            entry.expiry = expiry;
            if entry.conn_id != conn_id {
                debug!(worker = %identity, old = entry.conn_id, new = conn_id, "Worker rebound to new connection");
                entry.conn_id = conn_id;
                inner.rebuild();
            }
            return false;
        }

        inner
            .workers
            .insert(identity.clone(), WorkerEntry { conn_id, expiry });
        inner.rebuild();
        debug!(worker = %identity, conn_id, live = inner.workers.len(), "Worker registered");
        true
    }

    /// Remove every worker whose expiry has passed
    pub fn purge(&self) -> Vec<WorkerIdentity> {
        self.purge_at(Instant::now())
    }

    pub fn purge_at(&self, now: Instant) -> Vec<WorkerIdentity> {
        let mut inner = self.inner.lock();
        let expired: Vec<WorkerIdentity> = inner
            .workers
            .iter()
            .filter(|(_, entry)| now > entry.expiry)
            .map(|(identity, _)| identity.clone())
            .collect();

        for identity in &expired {
            inner.workers.remove(identity);
            warn!(worker = %identity, "Worker expired, purging");
        }
        inner.rebuild();
        expired
    }

    /// Pick the worker for a request key; `None` when no worker is live
    #[must_use]
    pub fn choose_worker(&self, key: &[u8]) -> Option<(WorkerIdentity, ConnId)> {
        let inner = self.inner.lock();
        if inner.selectable.is_empty() {
            return None;
        }
        let index = key_hash(key) as usize % inner.selectable.len();
        inner.selectable.get(index).cloned()
    }

    /// Drop a worker if it is still bound to `conn_id`
    pub fn remove(&self, identity: &WorkerIdentity, conn_id: ConnId) -> bool {
        let mut inner = self.inner.lock();
        let bound = inner
            .workers
            .get(identity)
            .is_some_and(|entry| entry.conn_id == conn_id);
        if bound {
            inner.workers.remove(identity);
            inner.rebuild();
        }
        bound
    }

    /// Drop every worker bound to a closed connection
    pub fn remove_connection(&self, conn_id: ConnId) -> Vec<WorkerIdentity> {
        let mut inner = self.inner.lock();
        let bound: Vec<WorkerIdentity> = inner
            .workers
            .iter()
            .filter(|(_, entry)| entry.conn_id == conn_id)
            .map(|(identity, _)| identity.clone())
            .collect();
        if !bound.is_empty() {
            for identity in &bound {
                inner.workers.remove(identity);
            }
            inner.rebuild();
        }
        bound
    }

    /// Current selectable snapshot, ordered by identity
    #[must_use]
    pub fn workers(&self) -> Vec<(WorkerIdentity, ConnId)> {
        self.inner.lock().selectable.clone()
    }

    #[must_use]
    pub fn get(&self, identity: &WorkerIdentity) -> Option<WorkerEntry> {
        self.inner.lock().workers.get(identity).copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().workers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
