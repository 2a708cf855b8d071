//! Backend-side proxy for one live session.

use bytes::Bytes;
use gate_core::{GateError, Result, Session};

use crate::DirectoryBus;

/// A session snapshot plus the bus to mutate the live original.
///
/// Remote operations refresh the snapshot from the directory's reply.
#[derive(Clone)]
pub struct SessionHandle {
    bus: DirectoryBus,
    session: Session,
}

impl SessionHandle {
    #[must_use]
    pub const fn new(bus: DirectoryBus, session: Session) -> Self {
        Self { bus, session }
    }

    /// Rebuild a handle from a serialized session image.
    ///
    /// # Errors
    /// Returns a decode error if the image is unreadable.
    pub fn from_bytes(bus: DirectoryBus, data: &[u8]) -> Result<Self> {
        let session = Session::from_bytes(data)
            .map_err(|e| GateError::Decode(e.to_string()))?;
        Ok(Self::new(bus, session))
    }

    /// The local snapshot.
    #[must_use]
    pub const fn session(&self) -> &Session {
        &self.session
    }

    /// Read a setting from the local snapshot.
    #[must_use]
    pub fn get(&self, key: &str) -> &str {
        self.session.get(key)
    }

    #[must_use]
    pub fn is_guest(&self) -> bool {
        self.session.is_guest()
    }

    fn session_id(&self) -> String {
        self.session.session_id().to_string()
    }

    /// Refresh the snapshot from the live session.
    ///
    /// # Errors
    /// Returns not-found if the session is gone.
    pub async fn update(&mut self) -> Result<()> {
        self.session = self.bus.update(&self.session_id()).await?;
        Ok(())
    }

    /// # Errors
    /// Returns not-found if the session is gone.
    pub async fn bind(&mut self, user_id: &str) -> Result<()> {
        self.session = self.bus.bind(&self.session_id(), user_id).await?;
        Ok(())
    }

    /// # Errors
    /// Returns not-found if the session is gone.
    pub async fn unbind(&mut self) -> Result<()> {
        self.session = self.bus.unbind(&self.session_id()).await?;
        Ok(())
    }

    /// Replace the live settings with the local snapshot's settings.
    ///
    /// # Errors
    /// Returns not-found if the session is gone.
    pub async fn push(&mut self) -> Result<()> {
        let settings = self.session.settings().cloned().unwrap_or_default();
        self.session = self.bus.push(&self.session_id(), settings).await?;
        Ok(())
    }

    /// Upsert one setting on the live session.
    ///
    /// # Errors
    /// Returns not-found if the session is gone.
    pub async fn set(&mut self, key: &str, value: &str) -> Result<()> {
        self.session = self.bus.set(&self.session_id(), key, value).await?;
        Ok(())
    }

    /// Upsert one setting on the local snapshot only.
    pub fn set_local(&mut self, key: &str, value: &str) {
        self.session.set(key, value);
    }

    /// Set locally, then push every local setting.
    ///
    /// # Errors
    /// Returns not-found if the session is gone.
    pub async fn set_push(&mut self, key: &str, value: &str) -> Result<()> {
        self.set_local(key, value);
        self.push().await
    }

    /// # Errors
    /// Returns not-found if the session is gone.
    pub async fn remove(&mut self, key: &str) -> Result<()> {
        self.session = self.bus.remove(&self.session_id(), key).await?;
        Ok(())
    }

    /// # Errors
    /// Returns not-found if the session is gone.
    pub async fn send(&self, data: Bytes) -> Result<()> {
        self.bus.send(&self.session_id(), data).await
    }

    /// # Errors
    /// Returns bus-closed if the request could not be queued.
    pub async fn send_nr(&self, data: Bytes) -> Result<()> {
        self.bus.send_nr(&self.session_id(), data).await
    }

    /// Send to a comma-separated list of sessions on this session's gateway.
    ///
    /// # Errors
    /// Returns bus-closed.
    pub async fn send_batch(&self, session_ids: &str, data: Bytes) -> Result<usize> {
        self.bus.send_batch(session_ids, data).await
    }

    /// Whether `user_id` is connected to this session's gateway.
    ///
    /// # Errors
    /// Returns not-found if the user has no session on that gateway.
    pub async fn is_connect(&self, user_id: &str) -> Result<bool> {
        self.bus.is_connect(&self.session_id(), user_id).await
    }

    /// # Errors
    /// Returns not-found if the session is gone.
    pub async fn close(&self) -> Result<()> {
        self.bus.close(&self.session_id()).await
    }
}
