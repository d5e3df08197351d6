//! Identity storage implementations.

pub mod memory;

#[cfg(feature = "file")]
pub mod file;

#[cfg(feature = "file")]
pub use file::FileIdentityStore;
pub use memory::MemoryIdentityStore;
