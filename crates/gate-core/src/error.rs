//! Error kinds shared by the gateway crates.

use thiserror::Error;

use crate::traits::StorageError;

/// Gateway error.
///
/// Transport, decode and route errors are fatal to the connection that
/// produced them. Encode and persistence errors never close a connection.
#[derive(Debug, Error)]
pub enum GateError {
    /// Unknown session id, user id or message identifier.
    #[error("not found: {0}")]
    NotFound(String),
    /// Malformed frame or envelope, or an unregistered inbound identifier.
    #[error("decode error: {0}")]
    Decode(String),
    /// A decoded message has no registered destination.
    #[error("route error: {0}")]
    Route(String),
    /// Outbound value type was never registered for marshaling.
    #[error("encode error: {0}")]
    Encode(String),
    /// Read or write failure on the underlying connection.
    #[error("transport error: {0}")]
    Transport(String),
    /// Storage call failed.
    #[error("persistence error: {0}")]
    Persistence(#[from] StorageError),
    /// Invalid gateway configuration.
    #[error("config error: {0}")]
    Config(String),
    /// The directory bus has shut down.
    #[error("directory bus closed")]
    BusClosed,
}

impl GateError {
    /// Whether this is a not-found error.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl From<std::io::Error> for GateError {
    fn from(e: std::io::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, GateError>;
