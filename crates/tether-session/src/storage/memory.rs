//! In-memory identity storage.

use std::sync::RwLock;

use async_trait::async_trait;
use tether_core::{IdentityStore, InstanceId, StorageError};

/// In-memory storage implementation.
///
/// Useful for tests and ephemeral clients.
/// The identity is lost on restart.
#[derive(Debug, Default)]
pub struct MemoryIdentityStore {
    id: RwLock<Option<InstanceId>>,
}

impl MemoryIdentityStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that already holds `id`.
    #[must_use]
    pub fn with_id(id: InstanceId) -> Self {
        Self {
            id: RwLock::new(Some(id)),
        }
    }
}

#[async_trait]
impl IdentityStore for MemoryIdentityStore {
    async fn load(&self) -> Result<Option<InstanceId>, StorageError> {
        Ok(*self
            .id
            .read()
            .map_err(|e| StorageError::Unavailable(e.to_string()))?)
    }

    async fn save(&self, id: InstanceId) -> Result<(), StorageError> {
        *self
            .id
            .write()
            .map_err(|e| StorageError::Unavailable(e.to_string()))? = Some(id);
        Ok(())
    }

    async fn clear(&self) -> Result<(), StorageError> {
        self.id
            .write()
            .map_err(|e| StorageError::Unavailable(e.to_string()))?
            .take();
        Ok(())
    }
}
