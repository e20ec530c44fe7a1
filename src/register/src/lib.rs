//! Lease-based service registration.
//!
//! Publishes a service endpoint into a coordination store under a lease, keeps
//! the lease alive, and revokes it on shutdown.

pub mod error;
pub mod key;
pub mod lease;
pub mod listener;
pub mod store;

pub use error::{RegisterError, RegisterResult, StoreError, StoreResult};
pub use key::{registration_key, sanitize_service_name, service_prefix};
pub use lease::{LeaseRegister, RegisterSettings, RegistrationState};
pub use listener::{LeaseEnd, RenewalListener};
pub use store::{CoordinationStore, EtcdStore, LeaseId, MemoryStore, RenewalAck, RenewalStream};

#[cfg(any(test, feature = "testing"))]
pub use store::MockCoordinationStore;
