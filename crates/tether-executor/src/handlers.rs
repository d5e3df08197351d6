//! Router-facing handler for the `execute.*` commands.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tether_core::{Command, CommandHandler, Envelope, HandlerError, envelope::kinds};

use crate::Executor;

/// Command types served by [`ExecuteHandler`].
pub const EXECUTE_KINDS: &[&str] = &[kinds::EXECUTE_CODE, kinds::EXECUTE_PING, kinds::EXECUTE_ABORT];

/// Dispatches `execute.code`, `execute.ping` and `execute.abort` to an [`Executor`].
#[derive(Clone)]
pub struct ExecuteHandler {
    executor: Arc<Executor>,
}

impl ExecuteHandler {
    #[must_use]
    pub const fn new(executor: Arc<Executor>) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl CommandHandler for ExecuteHandler {
    fn name(&self) -> &'static str {
        "execute"
    }

    async fn handle(
        &self,
        _envelope: &Envelope,
        command: &Command,
    ) -> Result<Option<Value>, HandlerError> {
        let reply = match command {
            Command::ExecuteCode(request) => {
                serde_json::to_value(self.executor.execute(request.clone()).await)?
            }
            Command::ExecutePing => serde_json::to_value(self.executor.health())?,
            Command::ExecuteAbort(abort) => {
                serde_json::to_value(self.executor.abort(&abort.execution_id))?
            }
            Command::Other(kind) => {
                return Err(HandlerError::Rejected(format!(
                    "{kind} is not an execute command"
                )));
            }
        };
        Ok(Some(reply))
    }
}
