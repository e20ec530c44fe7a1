use std::fmt;
use std::time::Duration;

use crate::store::LeaseId;

/// Errors reported by a coordination store backend
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Coordination store unavailable: {0}")]
    Unavailable(String),

    #[error("Store call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Lease {0} not found")]
    LeaseNotFound(LeaseId),

    #[error("Invalid lease TTL: {0}s")]
    InvalidTtl(i64),

    #[error("Value of {size} bytes exceeds the {limit} byte limit")]
    ValueTooLarge { size: usize, limit: usize },

    #[error("Store connection closed")]
    Closed,

    #[error("etcd error: {0}")]
    Etcd(#[from] etcd_client::Error),
}

/// Errors reported by the lease register
#[derive(Debug, thiserror::Error)]
pub enum RegisterError {
    #[error("Invalid registration configuration: {0}")]
    Configuration(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Already registered with lease {0}")]
    AlreadyRegistered(LeaseId),

    #[error("No active registration")]
    NotRegistered,

    #[error("Register has been closed")]
    Closed,

    #[error("Shutdown failed: {}", ShutdownFailure::new(.revoke, .connection))]
    Shutdown {
        revoke: Option<StoreError>,
        connection: Option<StoreError>,
    },
}

struct ShutdownFailure<'a> {
    revoke: &'a Option<StoreError>,
    connection: &'a Option<StoreError>,
}

impl<'a> ShutdownFailure<'a> {
    fn new(revoke: &'a Option<StoreError>, connection: &'a Option<StoreError>) -> Self {
        Self { revoke, connection }
    }
}

impl fmt::Display for ShutdownFailure<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.revoke, self.connection) {
            (Some(revoke), Some(connection)) => {
                write!(f, "revoke: {revoke}; connection close: {connection}")
            }
            (Some(revoke), None) => write!(f, "revoke: {revoke}"),
            (None, Some(connection)) => write!(f, "connection close: {connection}"),
            (None, None) => write!(f, "unknown"),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
pub type RegisterResult<T> = Result<T, RegisterError>;
