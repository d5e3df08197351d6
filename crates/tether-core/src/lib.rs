//! Core abstractions for the tether command bridge.
//!
//! This crate provides the fundamental building blocks:
//! - `Envelope` - The wire message unit
//! - `Command` - Tagged union of inbound commands and their result payloads
//! - `TetherConfig` / `ConfigHandle` - Configuration with change notification
//! - `ResourceLockTable` - Advisory TTL locks for handlers
//! - Identity storage and command handler traits

pub mod command;
pub mod config;
pub mod envelope;
pub mod locks;
pub mod traits;

pub use command::{Command, ExecutionMode, ExecutionReport, Outcome};
pub use config::{ConfigHandle, TetherConfig};
pub use envelope::Envelope;
pub use locks::ResourceLockTable;
pub use traits::{CommandHandler, HandlerError, IdentityStore, InstanceId, StorageError};
