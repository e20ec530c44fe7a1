use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::{CoordinationStore, LeaseId, RenewalAck, RenewalStream, renewal_channel};
use crate::error::{StoreError, StoreResult};

const DEFAULT_MAX_VALUE_SIZE: usize = 3 * 512 * 1024;
const MIN_RENEWAL_INTERVAL: Duration = Duration::from_millis(100);

/// In-process coordination store with real lease semantics.
///
/// Leases expire on tokio time, so tests can drive expiry with a paused clock.
/// Every opened renewal stream is backed by a task that refreshes the lease at a
/// third of its TTL until the lease is revoked, the store is closed or renewals
/// are severed with [`MemoryStore::sever_renewals`].
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Debug, Default)]
struct Inner {
    next_lease_id: LeaseId,
    leases: HashMap<LeaseId, Lease>,
    /// Expired leases still watched by a keepalive, with the number of watchers
    expired: HashMap<LeaseId, usize>,
    entries: BTreeMap<String, Entry>,
    renewals_severed: bool,
    closed: bool,
}

#[derive(Debug)]
struct Lease {
    ttl: i64,
    deadline: Instant,
    keepalives: Vec<JoinHandle<()>>,
}

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    lease_id: LeaseId,
}

impl Inner {
    fn ensure_open(&self) -> StoreResult<()> {
        if self.closed {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }

    fn purge_expired(&mut self, now: Instant) {
        let expired: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        for lease_id in expired {
            let Some(lease) = self.remove_lease(lease_id) else {
                continue;
            };
            let watchers = lease
                .keepalives
                .iter()
                .filter(|handle| !handle.is_finished())
                .count();
            if watchers > 0 {
                self.expired.insert(lease_id, watchers);
            }
            tracing::debug!(lease_id, "Lease expired");
        }
    }

    // Each watcher reports the expiry once; the id is forgotten after the last one
    fn take_expired(&mut self, lease_id: LeaseId) -> bool {
        match self.expired.get_mut(&lease_id) {
            Some(watchers) if *watchers > 1 => {
                *watchers -= 1;
                true
            }
            Some(_) => {
                self.expired.remove(&lease_id);
                true
            }
            None => false,
        }
    }

    fn remove_lease(&mut self, lease_id: LeaseId) -> Option<Lease> {
        let lease = self.leases.remove(&lease_id)?;
        self.entries.retain(|_, entry| entry.lease_id != lease_id);
        Some(lease)
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Value stored at `key`, if its lease is still alive
    pub async fn get(&self, key: &str) -> Option<String> {
        let mut inner = self.inner.lock().await;
        inner.purge_expired(Instant::now());
        inner.entries.get(key).map(|entry| entry.value.clone())
    }

    /// Lease a key is attached to
    pub async fn lease_of(&self, key: &str) -> Option<LeaseId> {
        let mut inner = self.inner.lock().await;
        inner.purge_expired(Instant::now());
        inner.entries.get(key).map(|entry| entry.lease_id)
    }

    /// All live keys starting with `prefix`, in order
    pub async fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let mut inner = self.inner.lock().await;
        inner.purge_expired(Instant::now());
        inner
            .entries
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect()
    }

    /// Whether `lease_id` is currently alive
    pub async fn is_lease_active(&self, lease_id: LeaseId) -> bool {
        let mut inner = self.inner.lock().await;
        inner.purge_expired(Instant::now());
        inner.leases.contains_key(&lease_id)
    }

    pub async fn is_closed(&self) -> bool {
        self.inner.lock().await.closed
    }

    /// Stop all keepalives as if the connection to the store was lost.
    ///
    /// Open renewal streams close on their next tick; leases then expire once
    /// their TTL elapses.
    pub async fn sever_renewals(&self) {
        self.inner.lock().await.renewals_severed = true;
    }

    /// Allow new renewal streams again after [`MemoryStore::sever_renewals`]
    pub async fn resume_renewals(&self) {
        self.inner.lock().await.renewals_severed = false;
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn grant(&self, ttl_seconds: i64) -> StoreResult<LeaseId> {
        if ttl_seconds <= 0 {
            return Err(StoreError::InvalidTtl(ttl_seconds));
        }
        let mut inner = self.inner.lock().await;
        inner.ensure_open()?;

        inner.next_lease_id += 1;
        let lease_id = inner.next_lease_id;
        inner.leases.insert(
            lease_id,
            Lease {
                ttl: ttl_seconds,
                deadline: Instant::now() + ttl_duration(ttl_seconds),
                keepalives: Vec::new(),
            },
        );
        Ok(lease_id)
    }

    async fn put(&self, key: &str, value: &str, lease_id: LeaseId) -> StoreResult<()> {
        if value.len() > DEFAULT_MAX_VALUE_SIZE {
            return Err(StoreError::ValueTooLarge {
                size: value.len(),
                limit: DEFAULT_MAX_VALUE_SIZE,
            });
        }
        let mut inner = self.inner.lock().await;
        inner.ensure_open()?;
        inner.purge_expired(Instant::now());

        if !inner.leases.contains_key(&lease_id) {
            return Err(StoreError::LeaseNotFound(lease_id));
        }
        inner.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                lease_id,
            },
        );
        Ok(())
    }

    async fn open_renewal_stream(&self, lease_id: LeaseId) -> StoreResult<RenewalStream> {
        let mut inner = self.inner.lock().await;
        inner.ensure_open()?;
        if inner.renewals_severed {
            return Err(StoreError::Unavailable("renewals severed".to_string()));
        }
        let now = Instant::now();
        inner.purge_expired(now);

        let lease = inner
            .leases
            .get_mut(&lease_id)
            .ok_or(StoreError::LeaseNotFound(lease_id))?;
        lease.deadline = now + ttl_duration(lease.ttl);
        let first = RenewalAck {
            lease_id,
            ttl: lease.ttl,
        };

        let (tx, stream) = renewal_channel();
        // The receiver is fresh and the channel buffered, so this cannot fail.
        let _ = tx.try_send(first);

        let handle = tokio::spawn(keep_lease_alive(self.inner.clone(), lease_id, lease.ttl, tx));
        lease.keepalives.retain(|handle| !handle.is_finished());
        lease.keepalives.push(handle);
        Ok(stream)
    }

    async fn revoke(&self, lease_id: LeaseId) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        inner.ensure_open()?;
        inner.purge_expired(Instant::now());

        match inner.remove_lease(lease_id) {
            Some(lease) => {
                for handle in lease.keepalives {
                    handle.abort();
                }
            }
            None => tracing::debug!(lease_id, "Lease already expired or revoked"),
        }
        Ok(())
    }

    async fn close(&self) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        inner.ensure_open()?;
        inner.closed = true;
        for lease in inner.leases.values_mut() {
            for handle in lease.keepalives.drain(..) {
                handle.abort();
            }
        }
        Ok(())
    }
}

async fn keep_lease_alive(
    inner: Arc<Mutex<Inner>>,
    lease_id: LeaseId,
    ttl_seconds: i64,
    tx: mpsc::Sender<RenewalAck>,
) {
    let interval = (ttl_duration(ttl_seconds) / 3).max(MIN_RENEWAL_INTERVAL);
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = tx.closed() => return,
        }

        let ack = {
            let mut guard = inner.lock().await;
            let inner = &mut *guard;
            if inner.closed || inner.renewals_severed {
                return;
            }
            let now = Instant::now();
            inner.purge_expired(now);
            if let Some(lease) = inner.leases.get_mut(&lease_id) {
                lease.deadline = now + ttl_duration(lease.ttl);
                RenewalAck {
                    lease_id,
                    ttl: lease.ttl,
                }
            } else if inner.take_expired(lease_id) {
                RenewalAck { lease_id, ttl: 0 }
            } else {
                return;
            }
        };

        if ack.is_expired() {
            // Last message on this stream, wait for room
            let _ = tx.send(ack).await;
            return;
        }
        // Renewal never waits on the consumer; unread acks are dropped
        match tx.try_send(ack) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                tracing::trace!(lease_id, "Renewal stream full, dropping ack");
            }
            Err(TrySendError::Closed(_)) => return,
        }
    }
}

fn ttl_duration(ttl_seconds: i64) -> Duration {
    Duration::from_secs(ttl_seconds.max(0) as u64)
}
