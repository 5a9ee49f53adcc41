//! Client error types

use std::time::Duration;

use thiserror::Error;

/// Why a connection is not available
///
/// `Clone` so that every caller waiting on one shared attempt can be handed
/// the same failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Connection attempt timed out after {0:?}")]
    Timeout(Duration),

    #[error("Connection closed")]
    Closed,

    #[error("Client has been shut down")]
    Shutdown,
}
