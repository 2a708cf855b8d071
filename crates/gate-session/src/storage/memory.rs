//! In-memory session storage.

use std::{
    collections::HashMap,
    sync::RwLock,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use gate_core::{Session, SessionStorage, StorageError};

struct StoredImage {
    bytes: Vec<u8>,
    last_seen: Instant,
}

/// In-memory storage implementation.
///
/// Useful for development and single-process deployments.
/// Data is lost on restart.
pub struct MemoryStorage {
    images: RwLock<HashMap<String, StoredImage>>,
}

impl MemoryStorage {
    /// Create a new in-memory storage.
    #[must_use]
    pub fn new() -> Self {
        Self {
            images: RwLock::new(HashMap::new()),
        }
    }

    /// Number of stored session images.
    #[must_use]
    pub fn len(&self) -> usize {
        self.images.read().map_or(0, |images| images.len())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Evict images whose last store or heartbeat is older than `ttl`.
    ///
    /// Returns the number of evicted images.
    ///
    /// # Errors
    /// Returns error if the store lock is poisoned.
    pub fn expire_idle(&self, ttl: Duration) -> Result<usize, StorageError> {
        let mut images = self
            .images
            .write()
            .map_err(|e| StorageError::Internal(e.to_string()))?;

        let before = images.len();
        images.retain(|_, image| image.last_seen.elapsed() <= ttl);
        Ok(before - images.len())
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionStorage for MemoryStorage {
    async fn store(&self, user_id: &str, session: &Session) -> Result<(), StorageError> {
        let bytes = session.to_bytes()?;

        self.images
            .write()
            .map_err(|e| StorageError::Internal(e.to_string()))?
            .insert(
                user_id.to_string(),
                StoredImage {
                    bytes,
                    last_seen: Instant::now(),
                },
            );

        Ok(())
    }

    async fn delete(&self, user_id: &str) -> Result<(), StorageError> {
        self.images
            .write()
            .map_err(|e| StorageError::Internal(e.to_string()))?
            .remove(user_id);

        Ok(())
    }

    async fn query(&self, user_id: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self
            .images
            .read()
            .map_err(|e| StorageError::Internal(e.to_string()))?
            .get(user_id)
            .map(|image| image.bytes.clone()))
    }

    async fn heartbeat(&self, user_id: &str) {
        if let Ok(mut images) = self.images.write() {
            if let Some(image) = images.get_mut(user_id) {
                image.last_seen = Instant::now();
            }
        }
    }
}
