//! Per-execution control block.
//!
//! Completion, timeout, abort and connection loss all race to settle the
//! same job. The first `settle` wins; every later one is a no-op. Settling
//! also fires the cancellation token handed to the sandbox.

use std::{sync::OnceLock, time::Duration};

use tether_core::{ExecutionMode, Outcome};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// How a job ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Terminal {
    Completed,
    Failed,
    TimedOut,
    Aborted(String),
    ConnectionLost,
}

impl Terminal {
    /// Wire outcome for this terminal state.
    #[must_use]
    pub const fn outcome(&self) -> Outcome {
        match self {
            Self::Completed => Outcome::Completed,
            Self::Failed | Self::ConnectionLost => Outcome::Failed,
            Self::TimedOut => Outcome::TimedOut,
            Self::Aborted(_) => Outcome::Aborted,
        }
    }
}

/// Shared state of one running execution.
#[derive(Debug)]
pub struct JobControl {
    execution_id: String,
    mode: ExecutionMode,
    started_at: Instant,
    terminal: OnceLock<Terminal>,
    token: CancellationToken,
}

impl JobControl {
    #[must_use]
    pub fn new(execution_id: impl Into<String>, mode: ExecutionMode) -> Self {
        Self {
            execution_id: execution_id.into(),
            mode,
            started_at: Instant::now(),
            terminal: OnceLock::new(),
            token: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    #[must_use]
    pub const fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// Time since the job was created.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Record the terminal state. Returns `false` if the job was already settled.
    pub fn settle(&self, terminal: Terminal) -> bool {
        let won = self.terminal.set(terminal).is_ok();
        if won {
            self.token.cancel();
        }
        won
    }

    /// Terminal state, once settled.
    #[must_use]
    pub fn terminal(&self) -> Option<&Terminal> {
        self.terminal.get()
    }

    /// Whether the job has been settled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the job is settled.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_settle_wins() {
        let job = JobControl::new("e1", ExecutionMode::Constrained);
        assert!(job.terminal().is_none());
        assert!(job.settle(Terminal::Completed));
        assert!(!job.settle(Terminal::Aborted("late".into())));
        assert!(!job.settle(Terminal::TimedOut));
        assert_eq!(job.terminal(), Some(&Terminal::Completed));
        assert!(job.is_cancelled());
    }

    #[test]
    fn timeout_after_abort_is_noop() {
        let job = JobControl::new("e2", ExecutionMode::FullTrust);
        assert!(job.settle(Terminal::Aborted("operator".into())));
        assert!(!job.settle(Terminal::TimedOut));
        assert_eq!(job.terminal().map(Terminal::outcome), Some(Outcome::Aborted));
    }

    #[tokio::test]
    async fn concurrent_settles_have_one_winner() {
        let job = std::sync::Arc::new(JobControl::new("e3", ExecutionMode::Constrained));
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let job = std::sync::Arc::clone(&job);
                tokio::spawn(async move {
                    if i % 2 == 0 {
                        job.settle(Terminal::TimedOut)
                    } else {
                        job.settle(Terminal::Aborted(format!("abort {i}")))
                    }
                })
            })
            .collect();

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        job.cancelled().await;
    }
}
