//! Durable instance identity.

use std::fmt;

use tether_core::{IdentityStore, InstanceId, StorageError};

/// The identity this process presents to the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionIdentity {
    id: InstanceId,
    durable: bool,
}

impl SessionIdentity {
    /// Return the stored identity, creating and persisting one on first use.
    ///
    /// Storage failures never abort startup: the process falls back to an
    /// identity that lives only as long as the process, and says so in the log.
    pub async fn get_or_create(store: &dyn IdentityStore) -> Self {
        match store.load().await {
            Ok(Some(id)) => {
                tracing::debug!(instance_id = %id, "Loaded stored instance identity");
                return Self { id, durable: true };
            }
            Ok(None) => {}
            Err(StorageError::Corrupt(detail)) => {
                tracing::warn!(%detail, "Stored instance identity is corrupt, issuing a new one");
            }
            Err(e) => {
                let id = InstanceId::generate();
                tracing::warn!(
                    instance_id = %id,
                    error = %e,
                    "Identity storage unavailable, running with an ephemeral identity"
                );
                return Self { id, durable: false };
            }
        }

        let id = InstanceId::generate();
        match store.save(id).await {
            Ok(()) => {
                tracing::info!(instance_id = %id, "Created instance identity");
                Self { id, durable: true }
            }
            Err(e) => {
                tracing::warn!(
                    instance_id = %id,
                    error = %e,
                    "Failed to persist instance identity, running with an ephemeral identity"
                );
                Self { id, durable: false }
            }
        }
    }

    /// Identity that is never persisted.
    #[must_use]
    pub fn ephemeral() -> Self {
        Self {
            id: InstanceId::generate(),
            durable: false,
        }
    }

    #[must_use]
    pub const fn id(&self) -> InstanceId {
        self.id
    }

    /// Whether the identity survives a restart.
    #[must_use]
    pub const fn is_durable(&self) -> bool {
        self.durable
    }
}

impl fmt::Display for SessionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.id.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::storage::MemoryIdentityStore;

    struct BrokenStore;

    #[async_trait]
    impl IdentityStore for BrokenStore {
        async fn load(&self) -> Result<Option<InstanceId>, StorageError> {
            Err(StorageError::Unavailable("disk gone".into()))
        }

        async fn save(&self, _id: InstanceId) -> Result<(), StorageError> {
            Err(StorageError::Unavailable("disk gone".into()))
        }

        async fn clear(&self) -> Result<(), StorageError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn creates_once_then_reuses() {
        let store = MemoryIdentityStore::new();
        let first = SessionIdentity::get_or_create(&store).await;
        let second = SessionIdentity::get_or_create(&store).await;
        assert!(first.is_durable());
        assert_eq!(first, second);
        assert_eq!(store.load().await.unwrap(), Some(first.id()));
    }

    #[tokio::test]
    async fn clearing_storage_issues_new_identity() {
        let store = MemoryIdentityStore::new();
        let first = SessionIdentity::get_or_create(&store).await;
        store.clear().await.unwrap();
        let second = SessionIdentity::get_or_create(&store).await;
        assert_ne!(first.id(), second.id());
    }

    #[tokio::test]
    async fn unavailable_storage_degrades() {
        let identity = SessionIdentity::get_or_create(&BrokenStore).await;
        assert!(!identity.is_durable());
    }

    #[cfg(feature = "file")]
    #[tokio::test]
    async fn survives_restart_with_file_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("id");
        let first =
            SessionIdentity::get_or_create(&crate::storage::FileIdentityStore::new(&path)).await;
        let second =
            SessionIdentity::get_or_create(&crate::storage::FileIdentityStore::new(&path)).await;
        assert_eq!(first.id(), second.id());
    }
}
