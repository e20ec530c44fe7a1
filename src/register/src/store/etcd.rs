//! etcd v3 backed coordination store

use std::time::Duration;

use async_trait::async_trait;
use common::config::StoreConfig;
use etcd_client::{Client, ConnectOptions, LeaseKeepAliveStream, LeaseKeeper, PutOptions};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::{CoordinationStore, LeaseId, RenewalAck, RenewalStream, renewal_channel};
use crate::error::{StoreError, StoreResult};

/// etcd rejects requests above 1.5 MiB by default
const MAX_VALUE_SIZE: usize = 3 * 512 * 1024;
const MIN_RENEWAL_INTERVAL: Duration = Duration::from_millis(500);

/// Coordination store backed by an etcd cluster
pub struct EtcdStore {
    client: RwLock<Option<Client>>,
    keepalives: Mutex<Vec<JoinHandle<()>>>,
}

impl EtcdStore {
    /// Connect to the configured etcd endpoints
    pub async fn connect(config: &StoreConfig) -> StoreResult<Self> {
        let mut options = ConnectOptions::new().with_connect_timeout(config.dial_timeout);
        if let Some(username) = &config.username {
            let password = config.password.clone().unwrap_or_default();
            options = options.with_user(username.clone(), password);
        }

        debug!(endpoints = ?config.endpoints, "Connecting to etcd");
        let client = Client::connect(&config.endpoints, Some(options))
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        Ok(Self::from_client(client))
    }

    /// Wrap an already connected client
    pub fn from_client(client: Client) -> Self {
        Self {
            client: RwLock::new(Some(client)),
            keepalives: Mutex::new(Vec::new()),
        }
    }

    // etcd clients are cheap handles over a shared channel
    async fn client(&self) -> StoreResult<Client> {
        self.client.read().await.clone().ok_or(StoreError::Closed)
    }
}

#[async_trait]
impl CoordinationStore for EtcdStore {
    async fn grant(&self, ttl_seconds: i64) -> StoreResult<LeaseId> {
        if ttl_seconds <= 0 {
            return Err(StoreError::InvalidTtl(ttl_seconds));
        }
        let mut client = self.client().await?;
        let response = client.lease_grant(ttl_seconds, None).await?;
        trace!(lease_id = response.id(), ttl = response.ttl(), "Lease granted");
        Ok(response.id())
    }

    async fn put(&self, key: &str, value: &str, lease_id: LeaseId) -> StoreResult<()> {
        if value.len() > MAX_VALUE_SIZE {
            return Err(StoreError::ValueTooLarge {
                size: value.len(),
                limit: MAX_VALUE_SIZE,
            });
        }
        let mut client = self.client().await?;
        let options = PutOptions::new().with_lease(lease_id);
        client.put(key, value, Some(options)).await?;
        Ok(())
    }

    async fn open_renewal_stream(&self, lease_id: LeaseId) -> StoreResult<RenewalStream> {
        let mut client = self.client().await?;
        let (mut keeper, mut responses) = client.lease_keep_alive(lease_id).await?;

        // The first round trip fails fast for leases that are already gone
        let first = renew(&mut keeper, &mut responses).await?;
        if first.is_expired() {
            return Err(StoreError::LeaseNotFound(lease_id));
        }

        let (tx, stream) = renewal_channel();
        let handle = tokio::spawn(keep_lease_alive(keeper, responses, first, tx));
        let mut keepalives = self.keepalives.lock().await;
        keepalives.retain(|handle| !handle.is_finished());
        keepalives.push(handle);
        Ok(stream)
    }

    async fn revoke(&self, lease_id: LeaseId) -> StoreResult<()> {
        let mut client = self.client().await?;
        match client.lease_revoke(lease_id).await {
            Ok(_) => Ok(()),
            Err(e) if is_lease_not_found(&e) => {
                debug!(lease_id, "Lease already expired or revoked");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn close(&self) -> StoreResult<()> {
        for handle in self.keepalives.lock().await.drain(..) {
            handle.abort();
        }
        match self.client.write().await.take() {
            Some(_client) => {
                debug!("etcd client released");
                Ok(())
            }
            None => Err(StoreError::Closed),
        }
    }
}

impl Drop for EtcdStore {
    fn drop(&mut self) {
        for handle in self.keepalives.get_mut().drain(..) {
            handle.abort();
        }
    }
}

async fn renew(
    keeper: &mut LeaseKeeper,
    responses: &mut LeaseKeepAliveStream,
) -> StoreResult<RenewalAck> {
    keeper.keep_alive().await?;
    match responses.message().await? {
        Some(response) => Ok(RenewalAck {
            lease_id: response.id(),
            ttl: response.ttl(),
        }),
        None => Err(StoreError::Unavailable(
            "keep-alive response stream closed".to_string(),
        )),
    }
}

/// Renews at a third of the remaining TTL and forwards acknowledgements.
///
/// Renewal never waits for the stream to be read: acks that do not fit are
/// dropped. Dropping `tx` on exit closes the renewal stream.
async fn keep_lease_alive(
    mut keeper: LeaseKeeper,
    mut responses: LeaseKeepAliveStream,
    first: RenewalAck,
    tx: mpsc::Sender<RenewalAck>,
) {
    let lease_id = first.lease_id;
    let mut ack = first;
    loop {
        if ack.is_expired() {
            warn!(lease_id, "Lease expired");
            let _ = tx.send(ack).await;
            return;
        }
        match tx.try_send(ack) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => trace!(lease_id, "Renewal stream full, dropping ack"),
            Err(TrySendError::Closed(_)) => {
                debug!(lease_id, "Renewal stream dropped, stopping keep-alive");
                return;
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(renewal_interval(ack.ttl)) => {}
            _ = tx.closed() => {
                debug!(lease_id, "Renewal stream dropped, stopping keep-alive");
                return;
            }
        }

        match renew(&mut keeper, &mut responses).await {
            Ok(next) => ack = next,
            Err(e) => {
                warn!(lease_id, error = %e, "Lease keep-alive failed");
                return;
            }
        }
    }
}

fn renewal_interval(ttl_seconds: i64) -> Duration {
    let ttl = Duration::from_secs(ttl_seconds.max(0) as u64);
    (ttl / 3).max(MIN_RENEWAL_INTERVAL)
}

fn is_lease_not_found(err: &etcd_client::Error) -> bool {
    matches!(err, etcd_client::Error::GRpcStatus(status) if status.code() == tonic::Code::NotFound)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_renewal_interval_is_a_third_of_ttl() {
        assert_eq!(renewal_interval(6), Duration::from_secs(2));
        assert_eq!(renewal_interval(5), Duration::from_secs(5) / 3);
    }

    #[test]
    fn test_renewal_interval_has_a_floor() {
        assert_eq!(renewal_interval(1), MIN_RENEWAL_INTERVAL);
        assert_eq!(renewal_interval(0), MIN_RENEWAL_INTERVAL);
        assert_eq!(renewal_interval(-3), MIN_RENEWAL_INTERVAL);
    }

    #[test]
    fn test_lease_not_found_detection() {
        let not_found = etcd_client::Error::GRpcStatus(tonic::Status::not_found(
            "etcdserver: requested lease not found",
        ));
        assert!(is_lease_not_found(&not_found));

        let unavailable =
            etcd_client::Error::GRpcStatus(tonic::Status::unavailable("connection refused"));
        assert!(!is_lease_not_found(&unavailable));
    }
}
