//! Durable session identity for the tether command bridge.
//!
//! Provides:
//! - `SessionIdentity` - Get-or-create the instance id presented to the controller
//! - Storage implementations (memory, file)

pub mod identity;
pub mod storage;

pub use identity::SessionIdentity;
