//! Bounded, sandboxed script execution for tether.
//!
//! Provides:
//! - Lexical safety classification behind the `Classifier` trait
//! - A Rhai sandbox with a message-passing document capability bridge
//! - Job control with first-settle-wins timeout and abort
//! - The `execute.*` command handler

pub mod classifier;
pub mod executor;
pub mod handlers;
pub mod job;
pub mod sandbox;

pub use classifier::{Classifier, LexicalClassifier, SafetyVerdict};
pub use executor::{ExecError, Executor};
pub use handlers::{EXECUTE_KINDS, ExecuteHandler};
pub use job::{JobControl, Terminal};
pub use sandbox::{DocOp, Document};
