//! Resilient WebSocket session for the tether command bridge.
//!
//! Provides:
//! - Wire protocol helpers (session address, handshake, liveness)
//! - Connection lifecycle state machine
//! - Reconnect backoff policy and heartbeat monitor
//! - Message router with request correlation and isolated handlers
//! - Session actor (`Session::start` / `SessionHandle`)

pub mod connection;
pub mod error;
pub mod heartbeat;
pub mod protocol;
pub mod reconnect;
pub mod router;
pub mod session;

pub use connection::{Connection, ConnectionState, TransitionError};
pub use error::{RequestError, TransportError};
pub use heartbeat::HeartbeatMonitor;
pub use reconnect::{Backoff, ReconnectPolicy};
pub use router::{DisconnectHook, MessageRouter, Routed};
pub use session::{Session, SessionHandle};
