//! Lease-based registration of a single service instance.
//!
//! A [`LeaseRegister`] walks one instance through
//! `Unregistered → LeaseGranted → Published → Renewing` and ends a lease in
//! `Revoked`, `Expired` or `ConnectionLost`. Renewals are consumed by a
//! [`RenewalListener`] taken from the register once it is `Renewing`.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use common::Endpoint;
use common::config::RegistrationConfig;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{Instrument, Span, debug, error, info, warn};

use crate::error::{RegisterError, RegisterResult, StoreError, StoreResult};
use crate::key::registration_key;
use crate::listener::{LeaseEnd, RenewalListener};
use crate::store::{CoordinationStore, LeaseId, RenewalStream};

/// Lifecycle of a registration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    Unregistered,
    LeaseGranted,
    Published,
    Renewing,
    /// `close()` is revoking the lease
    Revoking,
    Revoked,
    Expired,
    ConnectionLost,
}

impl RegistrationState {
    /// The lease this state refers to is gone for good
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RegistrationState::Revoked
                | RegistrationState::Expired
                | RegistrationState::ConnectionLost
        )
    }
}

impl std::fmt::Display for RegistrationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RegistrationState::Unregistered => "unregistered",
            RegistrationState::LeaseGranted => "lease_granted",
            RegistrationState::Published => "published",
            RegistrationState::Renewing => "renewing",
            RegistrationState::Revoking => "revoking",
            RegistrationState::Revoked => "revoked",
            RegistrationState::Expired => "expired",
            RegistrationState::ConnectionLost => "connection_lost",
        };
        write!(f, "{s}")
    }
}

/// Parameters of a registration
#[derive(Debug, Clone)]
pub struct RegisterSettings {
    pub base_path: String,
    pub service_name: String,
    pub ttl: Duration,
    /// Upper bound for each store call
    pub default_timeout: Duration,
    /// Revoke the granted lease when a later registration step fails
    pub revoke_on_publish_failure: bool,
}

impl From<&RegistrationConfig> for RegisterSettings {
    fn from(config: &RegistrationConfig) -> Self {
        Self {
            base_path: config.base_path.clone(),
            service_name: config.service_name.clone(),
            ttl: config.ttl,
            default_timeout: config.default_timeout,
            revoke_on_publish_failure: config.revoke_on_publish_failure,
        }
    }
}

/// Owns the registration of one service instance in a coordination store.
///
/// The register holds at most one live lease. `register()` and `close()` take
/// `&mut self`, so a single owner drives the lifecycle; the renewal listener
/// reports lease loss back through the shared state channel.
pub struct LeaseRegister<S> {
    store: S,
    settings: RegisterSettings,
    endpoint: Option<Endpoint>,
    lease_id: Option<LeaseId>,
    renewals: Option<RenewalStream>,
    state: Arc<watch::Sender<RegistrationState>>,
    closed: bool,
    span: Span,
}

impl<S: CoordinationStore> LeaseRegister<S> {
    pub fn new(store: S, settings: RegisterSettings, endpoint: Option<Endpoint>) -> Self {
        let span = tracing::info_span!(
            "lease_register",
            service = %settings.service_name,
            endpoint = %endpoint.as_ref().map(ToString::to_string).unwrap_or_default(),
        );
        let (state, _) = watch::channel(RegistrationState::Unregistered);
        Self {
            store,
            settings,
            endpoint,
            lease_id: None,
            renewals: None,
            state: Arc::new(state),
            closed: false,
            span,
        }
    }

    /// Log under `span` instead of the default `lease_register` span
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn state(&self) -> RegistrationState {
        *self.state.borrow()
    }

    /// Observe state transitions, including lease loss seen by the listener
    pub fn subscribe(&self) -> watch::Receiver<RegistrationState> {
        self.state.subscribe()
    }

    /// Lease currently held, set only while renewing
    pub fn lease_id(&self) -> Option<LeaseId> {
        self.lease_id
    }

    pub fn endpoint(&self) -> Option<&Endpoint> {
        self.endpoint.as_ref()
    }

    pub fn settings(&self) -> &RegisterSettings {
        &self.settings
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Key the endpoint is published under
    pub fn key(&self) -> Option<String> {
        self.endpoint.as_ref().map(|endpoint| {
            registration_key(&self.settings.base_path, &self.settings.service_name, endpoint)
        })
    }

    /// Grant a lease, publish the endpoint under it and open the renewal stream.
    ///
    /// Configuration problems are reported before the store is contacted. Store
    /// failures are returned as-is; nothing is retried.
    pub async fn register(&mut self) -> RegisterResult<()> {
        let span = self.span.clone();
        self.try_register().instrument(span).await
    }

    async fn try_register(&mut self) -> RegisterResult<()> {
        if self.closed {
            return Err(RegisterError::Closed);
        }
        let endpoint = self.validate()?.clone();

        match (self.state(), self.lease_id) {
            (RegistrationState::Renewing | RegistrationState::Revoking, Some(lease_id)) => {
                return Err(RegisterError::AlreadyRegistered(lease_id));
            }
            (RegistrationState::Unregistered, _) => {}
            (previous, _) => {
                debug!(%previous, "Starting a new registration cycle");
                self.lease_id = None;
                self.renewals = None;
                self.state.send_replace(RegistrationState::Unregistered);
            }
        }

        let key = registration_key(&self.settings.base_path, &self.settings.service_name, &endpoint);
        let value = endpoint.to_json()?;
        let ttl_seconds = i64::try_from(self.settings.ttl.as_secs()).unwrap_or(i64::MAX);

        debug!(ttl = ttl_seconds, "Requesting lease");
        let lease_id = match self.bounded(self.store.grant(ttl_seconds)).await {
            Ok(lease_id) => lease_id,
            Err(e) => {
                error!(error = %e, "Lease grant failed");
                return Err(e.into());
            }
        };
        self.state.send_replace(RegistrationState::LeaseGranted);
        debug!(lease_id, "Lease granted");

        if let Err(e) = self.bounded(self.store.put(&key, &value, lease_id)).await {
            error!(lease_id, key = %key, error = %e, "Publishing endpoint failed");
            self.compensate(lease_id).await;
            return Err(e.into());
        }
        self.state.send_replace(RegistrationState::Published);
        debug!(lease_id, key = %key, "Endpoint published");

        let renewals = match self.bounded(self.store.open_renewal_stream(lease_id)).await {
            Ok(renewals) => renewals,
            Err(e) => {
                error!(lease_id, error = %e, "Opening lease renewal stream failed");
                self.compensate(lease_id).await;
                return Err(e.into());
            }
        };

        self.lease_id = Some(lease_id);
        self.renewals = Some(renewals);
        self.state.send_replace(RegistrationState::Renewing);
        info!(lease_id, key = %key, "Registration succeeded");
        Ok(())
    }

    fn validate(&self) -> RegisterResult<&Endpoint> {
        if self.settings.base_path.is_empty() {
            return Err(RegisterError::Configuration(
                "base path must be non-empty".to_string(),
            ));
        }
        if self.settings.service_name.is_empty() {
            return Err(RegisterError::Configuration(
                "service name must be non-empty".to_string(),
            ));
        }
        let endpoint = self
            .endpoint
            .as_ref()
            .ok_or_else(|| RegisterError::Configuration("endpoint must be set".to_string()))?;
        if endpoint.address().is_empty() {
            return Err(RegisterError::Configuration(
                "endpoint address must be non-empty".to_string(),
            ));
        }
        Ok(endpoint)
    }

    // Best-effort cleanup of a lease whose registration did not complete. Without
    // it the lease and any published key live until the TTL runs out.
    async fn compensate(&self, lease_id: LeaseId) {
        if !self.settings.revoke_on_publish_failure {
            return;
        }
        match self.bounded(self.store.revoke(lease_id)).await {
            Ok(()) => info!(lease_id, "Revoked lease of failed registration"),
            Err(e) => warn!(lease_id, error = %e, "Revoking lease of failed registration failed"),
        }
    }

    /// Take the renewal stream and wrap it in a listener.
    ///
    /// Only available after a successful `register()`, once per lease.
    pub fn listener(&mut self) -> RegisterResult<RenewalListener> {
        let lease_id = self.lease_id.ok_or(RegisterError::NotRegistered)?;
        let renewals = self.renewals.take().ok_or(RegisterError::NotRegistered)?;
        Ok(RenewalListener::new(
            lease_id,
            renewals,
            self.state.clone(),
            self.span.clone(),
        ))
    }

    /// Spawn the renewal listener as a background task
    pub fn spawn_listener(&mut self) -> RegisterResult<JoinHandle<LeaseEnd>> {
        Ok(self.listener()?.spawn())
    }

    /// Revoke the held lease and release the store connection.
    ///
    /// The connection is released even when the revoke fails; both failures
    /// are reported in [`RegisterError::Shutdown`].
    pub async fn close(&mut self) -> RegisterResult<()> {
        let span = self.span.clone();
        self.try_close().instrument(span).await
    }

    async fn try_close(&mut self) -> RegisterResult<()> {
        if self.closed {
            return Err(RegisterError::Closed);
        }
        self.closed = true;

        let revoke = match self.lease_id.take() {
            Some(lease_id) => {
                self.state.send_replace(RegistrationState::Revoking);
                match self.bounded(self.store.revoke(lease_id)).await {
                    Ok(()) => {
                        self.state.send_replace(RegistrationState::Revoked);
                        info!(lease_id, "Lease revoked");
                        None
                    }
                    Err(e) => {
                        error!(lease_id, error = %e, "Lease revoke failed");
                        // Closing the connection ends the renewal stream; the lease
                        // is no longer kept alive and will run out on its own
                        self.state.send_replace(RegistrationState::ConnectionLost);
                        Some(e)
                    }
                }
            }
            None => {
                debug!("No lease held, skipping revoke");
                None
            }
        };
        self.renewals = None;

        let connection = match self.bounded(self.store.close()).await {
            Ok(()) => {
                debug!("Store connection closed");
                None
            }
            Err(e) => {
                error!(error = %e, "Closing store connection failed");
                Some(e)
            }
        };

        match (revoke, connection) {
            (None, None) => Ok(()),
            (revoke, connection) => Err(RegisterError::Shutdown { revoke, connection }),
        }
    }

    async fn bounded<T>(&self, call: impl Future<Output = StoreResult<T>>) -> StoreResult<T> {
        let timeout = self.settings.default_timeout;
        tokio::time::timeout(timeout, call)
            .await
            .unwrap_or(Err(StoreError::Timeout(timeout)))
    }
}
