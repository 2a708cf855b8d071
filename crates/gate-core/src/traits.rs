//! Core traits for connections, storage and lifecycle listeners.

use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::{GateError, Session};

/// A framed transport connection.
///
/// Implementations exchange whole messages; framing, queueing and
/// backpressure live behind this trait.
#[async_trait]
pub trait Conn: Send + Sync {
    /// Read the next whole message.
    ///
    /// Blocks until a message arrives. Any error means the connection is
    /// unusable.
    async fn read_msg(&self) -> Result<Bytes, GateError>;

    /// Queue one message made of `frames` for writing.
    ///
    /// Does not wait for the bytes to reach the socket.
    fn write_msg(&self, frames: Vec<Bytes>) -> Result<(), GateError>;

    /// Local socket address.
    fn local_addr(&self) -> SocketAddr;

    /// Remote socket address.
    fn remote_addr(&self) -> SocketAddr;

    /// Network name of the transport ("tcp", "ws").
    fn network(&self) -> &'static str;

    /// Flush queued writes, then shut the connection down.
    fn close(&self);

    /// Drop the connection immediately, discarding queued writes.
    fn destroy(&self);
}

/// Storage error.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Storage error: {0}")]
    Internal(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Persistence for bound sessions, keyed by user id.
#[async_trait]
pub trait SessionStorage: Send + Sync {
    /// Persist the session image of a bound user.
    ///
    /// Called after every settings mutation while bound.
    async fn store(&self, user_id: &str, session: &Session) -> Result<(), StorageError>;

    /// Forcibly delete a user's session image.
    async fn delete(&self, user_id: &str) -> Result<(), StorageError>;

    /// Fetch a user's last persisted session image, if any.
    ///
    /// Used on bind to seed settings.
    async fn query(&self, user_id: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Liveness ping for a connected user.
    ///
    /// Lets the backend extend the image's expiry. The call cadence is the
    /// caller's business.
    async fn heartbeat(&self, user_id: &str);
}

/// Listener for session-level connect/disconnect events.
pub trait SessionLearner: Send + Sync {
    /// A session became live on this gateway.
    fn connect(&self, session: &Session);

    /// A live session's connection went away.
    fn disconnect(&self, session: &Session);
}
