//! Typed commands and their result payloads.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::envelope::{Envelope, kinds};

/// Version advertised by the health probe.
pub const API_VERSION: &str = "1.0";

/// Request to run a script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteCode {
    /// Script source.
    pub code: String,
    /// Wall-clock limit; the configured default applies when absent.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Caller-chosen id used for abort and result correlation.
    #[serde(default)]
    pub execution_id: Option<String>,
    /// Explicit opt-in to full-trust execution.
    #[serde(rename = "unsafe", default)]
    pub full_trust: bool,
    /// Advisory lock taken for the duration of the run.
    #[serde(default)]
    pub resource_key: Option<String>,
}

/// Request to abort a running script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteAbort {
    /// Execution to abort.
    pub execution_id: String,
}

/// Inbound commands, tagged by envelope type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `execute.code`
    ExecuteCode(ExecuteCode),
    /// `execute.ping`
    ExecutePing,
    /// `execute.abort`
    ExecuteAbort(ExecuteAbort),
    /// Any type without a built-in payload shape; handlers read the envelope.
    Other(String),
}

impl Command {
    /// Parse the command carried by an envelope.
    ///
    /// # Errors
    /// Returns error if a known command type has a malformed payload.
    pub fn from_envelope(envelope: &Envelope) -> Result<Self, serde_json::Error> {
        Ok(match envelope.kind.as_str() {
            kinds::EXECUTE_CODE => Self::ExecuteCode(envelope.payload_as()?),
            kinds::EXECUTE_PING => Self::ExecutePing,
            kinds::EXECUTE_ABORT => Self::ExecuteAbort(envelope.payload_as()?),
            other => Self::Other(other.to_string()),
        })
    }

    /// Registry tag for this command.
    #[must_use]
    pub fn tag(&self) -> &str {
        match self {
            Self::ExecuteCode(_) => kinds::EXECUTE_CODE,
            Self::ExecutePing => kinds::EXECUTE_PING,
            Self::ExecuteAbort(_) => kinds::EXECUTE_ABORT,
            Self::Other(kind) => kind,
        }
    }
}

/// Execution mode as reported on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecutionMode {
    /// Constrained capability surface.
    #[serde(rename = "safe")]
    Constrained,
    /// Unrestricted host access.
    #[serde(rename = "unsafe")]
    FullTrust,
}

impl ExecutionMode {
    /// Mode requested by a command.
    #[must_use]
    pub const fn for_request(full_trust: bool) -> Self {
        if full_trust { Self::FullTrust } else { Self::Constrained }
    }
}

/// Terminal outcome of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Outcome {
    /// Script returned a value.
    Completed,
    /// Script raised an error.
    Failed,
    /// Script exceeded its wall-clock limit.
    TimedOut,
    /// Script was aborted on request.
    Aborted,
    /// Execution never started.
    Rejected,
}

/// Result payload for `execute.code`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionReport {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub execution_id: String,
    pub mode: ExecutionMode,
    pub outcome: Outcome,
}

impl ExecutionReport {
    /// Successful completion.
    #[must_use]
    pub fn completed(execution_id: impl Into<String>, mode: ExecutionMode, result: Value) -> Self {
        Self {
            success: true,
            result: Some(result),
            error: None,
            execution_id: execution_id.into(),
            mode,
            outcome: Outcome::Completed,
        }
    }

    /// Any non-successful outcome.
    #[must_use]
    pub fn unsuccessful(
        execution_id: impl Into<String>,
        mode: ExecutionMode,
        outcome: Outcome,
        error: impl Into<String>,
    ) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(error.into()),
            execution_id: execution_id.into(),
            mode,
            outcome,
        }
    }
}

/// Result payload for `execute.ping`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub healthy: bool,
    pub api_version: String,
    pub features: Vec<String>,
}

/// Result payload for `execute.abort`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbortReport {
    pub aborted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}
