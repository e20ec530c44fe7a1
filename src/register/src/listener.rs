use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{Instrument, Span, debug, error, info};

use crate::lease::RegistrationState;
use crate::store::{LeaseId, RenewalStream};

/// How a kept-alive lease ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseEnd {
    /// The register revoked the lease during shutdown
    Revoked,
    /// The store reported the lease as expired
    Expired,
    /// Renewals stopped arriving without the lease being revoked
    ConnectionLost,
}

impl From<LeaseEnd> for RegistrationState {
    fn from(end: LeaseEnd) -> Self {
        match end {
            LeaseEnd::Revoked => RegistrationState::Revoked,
            LeaseEnd::Expired => RegistrationState::Expired,
            LeaseEnd::ConnectionLost => RegistrationState::ConnectionLost,
        }
    }
}

/// Drains the renewal stream of one lease until it closes.
///
/// Renewals are only observed; the store keeps the TTL bookkeeping. The end of
/// the stream is the signal that the lease is no longer kept alive. Nothing is
/// re-registered here; callers decide what to do with the returned [`LeaseEnd`].
pub struct RenewalListener {
    lease_id: LeaseId,
    renewals: RenewalStream,
    state: Arc<watch::Sender<RegistrationState>>,
    span: Span,
}

impl RenewalListener {
    pub(crate) fn new(
        lease_id: LeaseId,
        renewals: RenewalStream,
        state: Arc<watch::Sender<RegistrationState>>,
        span: Span,
    ) -> Self {
        Self {
            lease_id,
            renewals,
            state,
            span,
        }
    }

    pub fn lease_id(&self) -> LeaseId {
        self.lease_id
    }

    /// Run on the current task until the renewal stream closes
    pub async fn run(self) -> LeaseEnd {
        let span = self.span.clone();
        self.listen().instrument(span).await
    }

    /// Run as a background task
    pub fn spawn(self) -> JoinHandle<LeaseEnd> {
        tokio::spawn(self.run())
    }

    async fn listen(mut self) -> LeaseEnd {
        let lease_id = self.lease_id;
        let mut renewals: u64 = 0;
        let mut expired = false;

        while let Some(ack) = self.renewals.next().await {
            if ack.is_expired() {
                expired = true;
                debug!(lease_id, "Store reported lease expiry");
                continue;
            }
            renewals += 1;
            debug!(lease_id, ttl = ack.ttl, renewals, "Lease renewed");
        }

        let end = match *self.state.borrow() {
            RegistrationState::Revoking | RegistrationState::Revoked => LeaseEnd::Revoked,
            _ if expired => LeaseEnd::Expired,
            _ => LeaseEnd::ConnectionLost,
        };

        // Only a lease that is still considered live moves to a failure state
        self.state.send_if_modified(|state| {
            if *state == RegistrationState::Renewing && end != LeaseEnd::Revoked {
                *state = end.into();
                true
            } else {
                false
            }
        });

        match end {
            LeaseEnd::Revoked => info!(lease_id, renewals, "Renewal stream closed after revoke"),
            LeaseEnd::Expired => error!(lease_id, renewals, "Lease expired"),
            LeaseEnd::ConnectionLost => {
                error!(lease_id, renewals, "Lease renewal stream closed unexpectedly")
            }
        }
        end
    }
}
