//! Coordination store interfaces
//!
//! A [`CoordinationStore`] grants leases, stores keys attached to them and
//! reports lease renewals as a stream of [`RenewalAck`]s. The stream ends when
//! the lease is revoked, expires or the connection to the store is lost.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::error::StoreResult;

pub mod etcd;
pub mod memory;

pub use etcd::EtcdStore;
pub use memory::MemoryStore;

/// Opaque lease identifier assigned by the store
pub type LeaseId = i64;

/// Acknowledgement that a lease was renewed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenewalAck {
    pub lease_id: LeaseId,
    /// Remaining time-to-live in seconds; zero or less means the lease is gone
    pub ttl: i64,
}

impl RenewalAck {
    pub fn is_expired(&self) -> bool {
        self.ttl <= 0
    }
}

/// Stream of renewal acknowledgements for a single lease
pub type RenewalStream = ReceiverStream<RenewalAck>;

const RENEWAL_CHANNEL_SIZE: usize = 16;

/// Create the sending half used by a store and the stream handed to the register.
pub fn renewal_channel() -> (mpsc::Sender<RenewalAck>, RenewalStream) {
    let (tx, rx) = mpsc::channel(RENEWAL_CHANNEL_SIZE);
    (tx, ReceiverStream::new(rx))
}

/// Client side of a lease-based coordination store
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait CoordinationStore: Send + Sync + 'static {
    /// Request a lease with the given time-to-live in seconds
    async fn grant(&self, ttl_seconds: i64) -> StoreResult<LeaseId>;

    /// Write `value` at `key`, attached to `lease_id`
    async fn put(&self, key: &str, value: &str, lease_id: LeaseId) -> StoreResult<()>;

    /// Start keeping `lease_id` alive and stream the acknowledgements
    async fn open_renewal_stream(&self, lease_id: LeaseId) -> StoreResult<RenewalStream>;

    /// Revoke `lease_id`, deleting every key attached to it.
    ///
    /// Revoking a lease that already expired or was revoked succeeds.
    async fn revoke(&self, lease_id: LeaseId) -> StoreResult<()>;

    /// Release the underlying connection
    async fn close(&self) -> StoreResult<()>;
}

#[async_trait]
impl<T: CoordinationStore + ?Sized> CoordinationStore for Box<T> {
    async fn grant(&self, ttl_seconds: i64) -> StoreResult<LeaseId> {
        (**self).grant(ttl_seconds).await
    }

    async fn put(&self, key: &str, value: &str, lease_id: LeaseId) -> StoreResult<()> {
        (**self).put(key, value, lease_id).await
    }

    async fn open_renewal_stream(&self, lease_id: LeaseId) -> StoreResult<RenewalStream> {
        (**self).open_renewal_stream(lease_id).await
    }

    async fn revoke(&self, lease_id: LeaseId) -> StoreResult<()> {
        (**self).revoke(lease_id).await
    }

    async fn close(&self) -> StoreResult<()> {
        (**self).close().await
    }
}
