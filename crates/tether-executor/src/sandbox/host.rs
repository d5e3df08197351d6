//! Host capabilities registered only in full-trust mode.

use std::{process::Command, sync::Arc};

use rhai::{Dynamic, Engine, EvalAltResult};
use thiserror::Error;

use super::runtime_error;
use crate::job::JobControl;

/// Command line parse error.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandParseError {
    #[error("Command line cannot be parsed: {0}")]
    Invalid(String),
    #[error("Command line is empty after parsing")]
    Empty,
}

/// Parsed command parts (program + args).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandParts {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandParts {
    /// Split a shell-style command line.
    ///
    /// # Errors
    /// Returns error on unbalanced quotes or an empty line.
    pub fn parse(cmdline: &str) -> Result<Self, CommandParseError> {
        let mut parts =
            shlex::split(cmdline).ok_or_else(|| CommandParseError::Invalid(cmdline.to_string()))?;
        if parts.is_empty() {
            return Err(CommandParseError::Empty);
        }
        let program = parts.remove(0);
        Ok(Self {
            program,
            args: parts,
        })
    }
}

/// Register environment, filesystem and process access.
pub(crate) fn register(engine: &mut Engine, control: Arc<JobControl>) {
    engine.register_fn("env", |name: &str| -> Dynamic {
        std::env::var(name).map_or(Dynamic::UNIT, Dynamic::from)
    });

    engine.register_fn(
        "read_file",
        |path: &str| -> Result<String, Box<EvalAltResult>> {
            std::fs::read_to_string(path).map_err(|e| runtime_error(format!("read_file {path}: {e}")))
        },
    );

    engine.register_fn(
        "write_file",
        |path: &str, contents: &str| -> Result<(), Box<EvalAltResult>> {
            std::fs::write(path, contents).map_err(|e| runtime_error(format!("write_file {path}: {e}")))
        },
    );

    engine.register_fn(
        "exec",
        |cmdline: &str| -> Result<rhai::Map, Box<EvalAltResult>> {
            let parts = CommandParts::parse(cmdline).map_err(|e| runtime_error(e.to_string()))?;
            tracing::debug!(program = %parts.program, args = ?parts.args, "Full-trust exec");
            let output = Command::new(&parts.program)
                .args(&parts.args)
                .output()
                .map_err(|e| runtime_error(format!("exec {}: {e}", parts.program)))?;

            let mut result = rhai::Map::new();
            result.insert(
                "status".into(),
                Dynamic::from(i64::from(output.status.code().unwrap_or(-1))),
            );
            result.insert(
                "stdout".into(),
                Dynamic::from(String::from_utf8_lossy(&output.stdout).into_owned()),
            );
            result.insert(
                "stderr".into(),
                Dynamic::from(String::from_utf8_lossy(&output.stderr).into_owned()),
            );
            Ok(result)
        },
    );

    engine.register_fn("aborted", move || control.is_cancelled());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_quoted_arguments() {
        let parts = CommandParts::parse(r#"echo "hello world" -n"#).unwrap();
        assert_eq!(parts.program, "echo");
        assert_eq!(parts.args, vec!["hello world".to_string(), "-n".to_string()]);
    }

    #[test]
    fn rejects_empty_and_unbalanced() {
        assert_eq!(CommandParts::parse("   "), Err(CommandParseError::Empty));
        assert!(matches!(
            CommandParts::parse("echo \"open"),
            Err(CommandParseError::Invalid(_))
        ));
    }
}
