//! Core traits for identity storage and command handling.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::{Command, Envelope};

/// Durable identifier of one client installation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(Uuid);

impl InstanceId {
    /// Generate a fresh random id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse a stored id.
    ///
    /// # Errors
    /// Returns error if `raw` is not a UUID.
    pub fn parse(raw: &str) -> Result<Self, StorageError> {
        Uuid::parse_str(raw.trim())
            .map(Self)
            .map_err(|e| StorageError::Corrupt(format!("{raw:?}: {e}")))
    }

    /// Underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Storage error.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Storage unavailable: {0}")]
    Unavailable(String),
    #[error("Stored identity is corrupt: {0}")]
    Corrupt(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Trait for durable identity backends.
#[async_trait]
pub trait IdentityStore: Send + Sync {
    /// Load the stored identity, if any.
    async fn load(&self) -> Result<Option<InstanceId>, StorageError>;

    /// Persist an identity, replacing any previous one.
    async fn save(&self, id: InstanceId) -> Result<(), StorageError>;

    /// Forget the stored identity.
    async fn clear(&self) -> Result<(), StorageError>;
}

/// Handler error.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("Invalid payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),
    #[error("Command rejected: {0}")]
    Rejected(String),
    #[error("Handler failed: {0}")]
    Internal(String),
}

/// Trait for command handlers registered with the router.
///
/// Returning `Some(value)` sends `value` back as the response to a
/// correlated request. Handlers run in their own task and must not assume
/// any ordering relative to other handlers.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Handle one command.
    async fn handle(
        &self,
        envelope: &Envelope,
        command: &Command,
    ) -> Result<Option<Value>, HandlerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_id_parse_roundtrip() {
        let id = InstanceId::generate();
        assert_eq!(InstanceId::parse(&format!("{id}\n")).unwrap(), id);
    }

    #[test]
    fn instance_id_rejects_garbage() {
        assert!(matches!(
            InstanceId::parse("not-a-uuid"),
            Err(StorageError::Corrupt(_))
        ));
    }
}
