//! Error types for dialing, connection creation and pool operations

use std::sync::Arc;
use std::time::Duration;

/// Failure of a single dial attempt
#[derive(Debug, thiserror::Error)]
pub enum DialError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Dial timed out after {0:?}")]
    Timeout(Duration),

    #[error("Could not resolve endpoint: {0}")]
    Resolve(String),

    #[error("Endpoint refused connection: {0}")]
    Refused(String),
}

/// Failure of a full create-with-retry sequence
#[derive(Debug, thiserror::Error)]
pub enum FactoryError {
    #[error("Failed to connect to {endpoint_id} after {attempts} attempt(s): {last}")]
    Exhausted {
        endpoint_id: String,
        attempts: u32,
        #[source]
        last: DialError,
    },

    #[error("Connection attempt to {endpoint_id} cancelled after {attempts} attempt(s)")]
    Cancelled { endpoint_id: String, attempts: u32 },
}

impl FactoryError {
    pub fn endpoint_id(&self) -> &str {
        match self {
            FactoryError::Exhausted { endpoint_id, .. } => endpoint_id,
            FactoryError::Cancelled { endpoint_id, .. } => endpoint_id,
        }
    }

    /// Number of dial attempts made before giving up
    pub fn attempts(&self) -> u32 {
        match self {
            FactoryError::Exhausted { attempts, .. } => *attempts,
            FactoryError::Cancelled { attempts, .. } => *attempts,
        }
    }
}

/// Error types for connection pool operations
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Connection pool is closed")]
    Closed,

    #[error("Endpoint id must not be empty")]
    InvalidEndpointId,

    #[error("Invalid pool configuration: {0}")]
    InvalidConfig(String),

    /// Shared by every caller that was waiting on the same dial
    #[error(transparent)]
    Connect(Arc<FactoryError>),

    #[error("Release without matching borrow on {endpoint_id}")]
    MismatchedRelease { endpoint_id: String },

    #[error("Registry is busy")]
    Busy,
}

impl From<FactoryError> for PoolError {
    fn from(e: FactoryError) -> Self {
        PoolError::Connect(Arc::new(e))
    }
}

impl PoolError {
    /// The failed create sequence behind a [`PoolError::Connect`]
    pub fn connect_error(&self) -> Option<&FactoryError> {
        match self {
            PoolError::Connect(e) => Some(e.as_ref()),
            _ => None,
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, PoolError::Closed)
    }
}
