//! Bounded execution of untrusted scripts.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use serde_json::Value;
use tether_core::{
    ConfigHandle, ExecutionMode, ExecutionReport, Outcome, ResourceLockTable,
    command::{AbortReport, ExecuteCode, HealthReport, API_VERSION},
};
use thiserror::Error;
use tokio::{
    sync::{Semaphore, oneshot},
    time::Instant,
};
use uuid::Uuid;

use crate::{
    classifier::{Classifier, LexicalClassifier},
    job::{JobControl, Terminal},
    sandbox::{Bridge, Document, ScriptContext, run_script},
};

/// Execution error. Every variant maps to exactly one wire [`Outcome`].
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("Unsafe code rejected: {0}")]
    Unsafe(String),
    #[error("Full-trust execution is disabled")]
    FullTrustDisabled,
    #[error("Code is {size} bytes, limit is {limit}")]
    TooLarge { size: usize, limit: usize },
    #[error("Execution {0} is already running")]
    DuplicateId(String),
    #[error("Resource {0} is busy")]
    ResourceBusy(String),
    #[error("Too many concurrent executions (max {max})")]
    ConcurrencyLimit { max: usize },
    #[error("Script error: {0}")]
    Script(String),
    #[error("Result is not representable as JSON: {0}")]
    Unserializable(String),
    #[error("Sandbox failure: {0}")]
    Sandbox(String),
    #[error("Execution interrupted")]
    Interrupted,
    #[error("Connection lost during execution")]
    ConnectionLost,
    #[error("Timed out after {0} ms")]
    TimedOut(u64),
    #[error("Aborted: {0}")]
    Aborted(String),
}

impl ExecError {
    /// Wire outcome for this error.
    #[must_use]
    pub const fn outcome(&self) -> Outcome {
        match self {
            Self::Unsafe(_)
            | Self::FullTrustDisabled
            | Self::TooLarge { .. }
            | Self::DuplicateId(_)
            | Self::ResourceBusy(_)
            | Self::ConcurrencyLimit { .. } => Outcome::Rejected,
            Self::Script(_)
            | Self::Unserializable(_)
            | Self::Sandbox(_)
            | Self::Interrupted
            | Self::ConnectionLost => Outcome::Failed,
            Self::TimedOut(_) => Outcome::TimedOut,
            Self::Aborted(_) => Outcome::Aborted,
        }
    }
}

/// Removes a job from the registry when execution returns.
struct Registration<'a> {
    executor: &'a Executor,
    execution_id: String,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        let mut jobs = self.executor.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        jobs.remove(&self.execution_id);
        self.executor
            .recent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .finished(&self.execution_id);
    }
}

/// How long settled ids and early aborts are remembered.
const RECENT_WINDOW: Duration = Duration::from_secs(10);

/// Ids seen outside the running set within [`RECENT_WINDOW`].
///
/// Commands are handled in separate tasks, so an `execute.abort` can overtake
/// the `execute.code` it targets; the abort is parked here until it starts.
#[derive(Default)]
struct RecentIds {
    finished: HashMap<String, Instant>,
    aborted_early: HashMap<String, Instant>,
}

impl RecentIds {
    fn prune(&mut self) {
        let now = Instant::now();
        self.finished.retain(|_, at| now.duration_since(*at) < RECENT_WINDOW);
        self.aborted_early.retain(|_, at| now.duration_since(*at) < RECENT_WINDOW);
    }

    fn finished(&mut self, execution_id: &str) {
        self.prune();
        self.aborted_early.remove(execution_id);
        self.finished.insert(execution_id.to_string(), Instant::now());
    }
}

/// Releases a resource lock when execution returns.
struct HeldResource<'a> {
    locks: &'a ResourceLockTable,
    key: String,
}

impl Drop for HeldResource<'_> {
    fn drop(&mut self) {
        self.locks.release(&self.key);
    }
}

/// Runs `execute.code` jobs and tracks them for abort.
pub struct Executor {
    config: ConfigHandle,
    classifier: Arc<dyn Classifier>,
    locks: Arc<ResourceLockTable>,
    document: Document,
    jobs: Mutex<HashMap<String, Arc<JobControl>>>,
    recent: Mutex<RecentIds>,
    permits: Arc<Semaphore>,
    max_concurrent: usize,
}

impl Executor {
    /// Create an executor with the lexical classifier and an empty document.
    #[must_use]
    pub fn new(config: ConfigHandle, locks: Arc<ResourceLockTable>) -> Self {
        let max_concurrent = config.current().executor.max_concurrent;
        Self {
            config,
            classifier: Arc::new(LexicalClassifier::new()),
            locks,
            document: Document::default(),
            jobs: Mutex::new(HashMap::new()),
            recent: Mutex::new(RecentIds::default()),
            permits: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
        }
    }

    /// Replace the safety classifier.
    #[must_use]
    pub fn with_classifier(mut self, classifier: Arc<dyn Classifier>) -> Self {
        self.classifier = classifier;
        self
    }

    /// Replace the document scripts operate on.
    #[must_use]
    pub fn with_document(mut self, document: Document) -> Self {
        self.document = document;
        self
    }

    /// Document exposed to scripts.
    #[must_use]
    pub const fn document(&self) -> &Document {
        &self.document
    }

    /// Ids of running executions, sorted.
    #[must_use]
    pub fn running(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// Run one command to its terminal outcome.
    pub async fn execute(&self, request: ExecuteCode) -> ExecutionReport {
        let execution_id = request
            .execution_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let mode = ExecutionMode::for_request(request.full_trust);

        match self.run(&execution_id, mode, request).await {
            Ok(result) => {
                tracing::info!(%execution_id, ?mode, "Execution completed");
                ExecutionReport::completed(execution_id, mode, result)
            }
            Err(err) => {
                let outcome = err.outcome();
                tracing::info!(%execution_id, ?mode, ?outcome, error = %err, "Execution did not complete");
                ExecutionReport::unsuccessful(execution_id, mode, outcome, err.to_string())
            }
        }
    }

    async fn run(
        &self,
        execution_id: &str,
        mode: ExecutionMode,
        request: ExecuteCode,
    ) -> Result<Value, ExecError> {
        let config = self.config.current();
        let limits = &config.executor;

        if request.code.len() > limits.max_code_bytes {
            return Err(ExecError::TooLarge {
                size: request.code.len(),
                limit: limits.max_code_bytes,
            });
        }

        match mode {
            ExecutionMode::FullTrust if !config.allow_full_trust => {
                return Err(ExecError::FullTrustDisabled);
            }
            ExecutionMode::FullTrust => {
                tracing::warn!(%execution_id, "Running script with full trust");
            }
            ExecutionMode::Constrained => {
                let verdict = self.classifier.classify(&request.code);
                if !verdict.safe {
                    return Err(ExecError::Unsafe(
                        verdict.reason.unwrap_or_else(|| "unsafe code".to_string()),
                    ));
                }
            }
        }

        let control = Arc::new(JobControl::new(execution_id, mode));
        let _registration = self.register(&control)?;

        let _resource = match request.resource_key {
            Some(key) => {
                if !self.locks.acquire_if_free(key.as_str()) {
                    return Err(ExecError::ResourceBusy(key));
                }
                Some(HeldResource {
                    locks: &self.locks,
                    key,
                })
            }
            None => None,
        };

        let permit = Arc::clone(&self.permits)
            .try_acquire_owned()
            .map_err(|_| ExecError::ConcurrencyLimit {
                max: self.max_concurrent,
            })?;

        let timeout = limits.timeout_for(request.timeout_ms);
        let (bridge, mut calls) = Bridge::channel();
        let ctx = ScriptContext {
            control: Arc::clone(&control),
            bridge,
            max_operations: limits.max_operations,
        };

        let (done_tx, mut done_rx) = oneshot::channel();
        let code = request.code;
        std::thread::Builder::new()
            .name(format!("tether-exec-{execution_id}"))
            .spawn(move || {
                let _permit = permit;
                let _ = done_tx.send(run_script(&code, &ctx));
            })
            .map_err(|e| ExecError::Sandbox(e.to_string()))?;

        tracing::debug!(%execution_id, ?mode, timeout_ms = millis(timeout), "Execution started");

        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                biased;
                () = control.cancelled() => break,
                () = &mut deadline => {
                    control.settle(Terminal::TimedOut);
                    break;
                }
                finished = &mut done_rx => {
                    let result = finished
                        .unwrap_or_else(|_| Err(ExecError::Sandbox("script thread exited".to_string())));
                    let terminal = if result.is_ok() { Terminal::Completed } else { Terminal::Failed };
                    if control.settle(terminal) {
                        return result;
                    }
                    break;
                }
                Some(call) = calls.recv() => {
                    let _ = call.reply.send(self.document.apply(call.op));
                }
            }
        }

        Err(match control.terminal() {
            Some(Terminal::TimedOut) => ExecError::TimedOut(millis(timeout)),
            Some(Terminal::Aborted(reason)) => ExecError::Aborted(reason.clone()),
            Some(Terminal::ConnectionLost) => ExecError::ConnectionLost,
            Some(Terminal::Completed | Terminal::Failed) | None => ExecError::Interrupted,
        })
    }

    fn register(&self, control: &Arc<JobControl>) -> Result<Registration<'_>, ExecError> {
        let execution_id = control.execution_id().to_string();
        let mut jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        if jobs.contains_key(&execution_id) {
            return Err(ExecError::DuplicateId(execution_id));
        }
        {
            let mut recent = self.recent.lock().unwrap_or_else(PoisonError::into_inner);
            recent.prune();
            if recent.aborted_early.remove(&execution_id).is_some() {
                tracing::info!(%execution_id, "Abort arrived before start");
                return Err(ExecError::Aborted("aborted before start".to_string()));
            }
            recent.finished.remove(&execution_id);
        }
        jobs.insert(execution_id.clone(), Arc::clone(control));
        Ok(Registration {
            executor: self,
            execution_id,
        })
    }

    /// Abort a running execution. Idempotent.
    ///
    /// An id that is neither running nor recently finished is remembered for
    /// a short window, so a command that starts just after its abort arrives
    /// settles as aborted.
    pub fn abort(&self, execution_id: &str) -> AbortReport {
        let job = {
            let jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
            let job = jobs.get(execution_id).cloned();
            if job.is_none() {
                let mut recent = self.recent.lock().unwrap_or_else(PoisonError::into_inner);
                recent.prune();
                if recent.finished.contains_key(execution_id) {
                    return AbortReport {
                        aborted: false,
                        reason: Some("execution already finished".to_string()),
                    };
                }
                recent
                    .aborted_early
                    .insert(execution_id.to_string(), Instant::now());
            }
            job
        };

        match job {
            Some(job) if job.settle(Terminal::Aborted("aborted by request".to_string())) => {
                tracing::info!(%execution_id, elapsed_ms = millis(job.elapsed()), "Execution aborted");
                AbortReport {
                    aborted: true,
                    reason: None,
                }
            }
            Some(_) => AbortReport {
                aborted: false,
                reason: Some("execution already finished".to_string()),
            },
            None => AbortReport {
                aborted: false,
                reason: Some(format!("no running execution {execution_id}")),
            },
        }
    }

    /// Terminate every running job after the connection dropped.
    ///
    /// Returns the number of jobs this call settled.
    pub fn fail_all_connection_lost(&self) -> usize {
        let jobs: Vec<Arc<JobControl>> = self
            .jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        let settled = jobs
            .iter()
            .filter(|job| job.settle(Terminal::ConnectionLost))
            .count();
        if settled > 0 {
            tracing::warn!(jobs = settled, "Connection lost; terminated running executions");
        }
        settled
    }

    /// Health probe payload.
    #[must_use]
    pub fn health(&self) -> HealthReport {
        let mut features: Vec<String> = ["constrained", "abort", "timeout", "resourceLock"]
            .into_iter()
            .map(String::from)
            .collect();
        if self.config.current().allow_full_trust {
            features.push("fullTrust".to_string());
        }
        HealthReport {
            healthy: true,
            api_version: API_VERSION.to_string(),
            features,
        }
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use serde_json::json;
    use tether_core::TetherConfig;

    use super::*;

    fn executor_with(edit: impl FnOnce(&mut TetherConfig)) -> Arc<Executor> {
        let mut config = TetherConfig::default();
        edit(&mut config);
        Arc::new(Executor::new(
            ConfigHandle::new(config),
            Arc::new(ResourceLockTable::default()),
        ))
    }

    fn executor() -> Arc<Executor> {
        executor_with(|_| {})
    }

    fn request(code: &str, id: &str) -> ExecuteCode {
        ExecuteCode {
            code: code.to_string(),
            timeout_ms: None,
            execution_id: Some(id.to_string()),
            full_trust: false,
            resource_key: None,
        }
    }

    #[tokio::test]
    async fn completes_with_json_result() {
        let exec = executor();
        let report = exec.execute(request("40 + 2", "e1")).await;
        assert!(report.success);
        assert_eq!(report.outcome, Outcome::Completed);
        assert_eq!(report.result, Some(json!(42)));
        assert_eq!(report.mode, ExecutionMode::Constrained);
        assert!(exec.running().is_empty());
    }

    #[tokio::test]
    async fn generates_execution_id_when_absent() {
        let exec = executor();
        let mut req = request("1", "unused");
        req.execution_id = None;
        let report = exec.execute(req).await;
        assert!(Uuid::parse_str(&report.execution_id).is_ok());
    }

    #[tokio::test]
    async fn short_timeout_wins_over_long_sleep() {
        let exec = executor();
        let mut req = request("sleep(5000); 1", "slow");
        req.timeout_ms = Some(100);

        let started = Instant::now();
        let report = exec.execute(req).await;
        let elapsed = started.elapsed();

        assert_eq!(report.outcome, Outcome::TimedOut);
        assert!(!report.success);
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_secs(2), "took {elapsed:?}");
    }

    #[tokio::test]
    async fn window_assignment_is_rejected() {
        let exec = executor();
        let report = exec.execute(request("window.location = 'x'", "w")).await;
        assert_eq!(report.outcome, Outcome::Rejected);
        assert!(report.error.unwrap().contains("window"));
    }

    #[tokio::test]
    async fn script_error_is_failure() {
        let exec = executor();
        let report = exec.execute(request(r#"throw "nope""#, "f")).await;
        assert_eq!(report.outcome, Outcome::Failed);
        assert!(report.error.unwrap().contains("nope"));
    }

    #[tokio::test]
    async fn full_trust_requires_configuration() {
        let exec = executor();
        let mut req = request(r#"env("HOME")"#, "ft");
        req.full_trust = true;
        let report = exec.execute(req.clone()).await;
        assert_eq!(report.outcome, Outcome::Rejected);
        assert_eq!(report.mode, ExecutionMode::FullTrust);

        let exec = executor_with(|c| c.allow_full_trust = true);
        let report = exec.execute(req).await;
        assert_eq!(report.outcome, Outcome::Completed);
    }

    #[tokio::test]
    async fn oversized_code_is_rejected() {
        let exec = executor_with(|c| c.executor.max_code_bytes = 8);
        let report = exec.execute(request("1 + 1 + 1 + 1", "big")).await;
        assert_eq!(report.outcome, Outcome::Rejected);
        assert!(report.error.unwrap().contains("limit is 8"));
    }

    #[tokio::test]
    async fn abort_running_then_noop() {
        let exec = executor();
        let mut req = request("sleep(10000); 1", "a1");
        req.timeout_ms = Some(20_000);

        let running = Arc::clone(&exec);
        let task = tokio::spawn(async move { running.execute(req).await });
        while exec.running().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert!(exec.abort("a1").aborted);
        let report = task.await.unwrap();
        assert_eq!(report.outcome, Outcome::Aborted);

        let again = exec.abort("a1");
        assert!(!again.aborted);
        assert!(again.reason.is_some());
    }

    #[tokio::test]
    async fn abort_after_completion_is_noop() {
        let exec = executor();
        let report = exec.execute(request("7", "done")).await;
        assert_eq!(report.outcome, Outcome::Completed);
        assert!(!exec.abort("done").aborted);
    }

    #[tokio::test]
    async fn abort_before_start_cancels_late_command() {
        let exec = executor();
        let report = exec.abort("early");
        assert!(!report.aborted);

        let report = exec.execute(request("sleep(5000); 1", "early")).await;
        assert_eq!(report.outcome, Outcome::Aborted);
        assert!(report.error.unwrap().contains("before start"));

        // the parked abort is consumed once
        let report = exec.execute(request("2", "early")).await;
        assert_eq!(report.outcome, Outcome::Completed);
    }

    #[tokio::test]
    async fn abort_after_completion_does_not_poison_reuse() {
        let exec = executor();
        assert_eq!(exec.execute(request("1", "again")).await.outcome, Outcome::Completed);
        let report = exec.abort("again");
        assert!(!report.aborted);
        assert_eq!(report.reason.as_deref(), Some("execution already finished"));
        assert_eq!(exec.execute(request("2", "again")).await.outcome, Outcome::Completed);
    }

    #[tokio::test]
    async fn concurrent_executions_are_independent() {
        let exec = executor();
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let exec = Arc::clone(&exec);
                tokio::spawn(async move {
                    exec.execute(request(&format!("sleep({}); {i} * 10", 40 - i * 10), &format!("c{i}")))
                        .await
                })
            })
            .collect();

        for (i, handle) in handles.into_iter().enumerate() {
            let report = handle.await.unwrap();
            assert_eq!(report.execution_id, format!("c{i}"));
            assert_eq!(report.result, Some(json!(i * 10)));
        }
    }

    #[tokio::test]
    async fn busy_resource_is_rejected_and_released_after() {
        let exec = executor();
        exec.locks.acquire("tab:1");

        let mut req = request("1", "r1");
        req.resource_key = Some("tab:1".to_string());
        let report = exec.execute(req.clone()).await;
        assert_eq!(report.outcome, Outcome::Rejected);
        assert!(report.error.unwrap().contains("tab:1"));

        exec.locks.release("tab:1");
        let report = exec.execute(req).await;
        assert_eq!(report.outcome, Outcome::Completed);
        assert!(!exec.locks.has("tab:1"));
    }

    #[tokio::test]
    async fn concurrency_cap_rejects_excess() {
        let exec = executor_with(|c| c.executor.max_concurrent = 1);
        let mut slow = request("sleep(10000); 1", "slow");
        slow.timeout_ms = Some(20_000);

        let running = Arc::clone(&exec);
        let task = tokio::spawn(async move { running.execute(slow).await });
        while exec.running().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let report = exec.execute(request("1", "fast")).await;
        assert_eq!(report.outcome, Outcome::Rejected);

        exec.abort("slow");
        assert_eq!(task.await.unwrap().outcome, Outcome::Aborted);
    }

    #[tokio::test]
    async fn duplicate_running_id_is_rejected() {
        let exec = executor();
        let mut slow = request("sleep(10000); 1", "dup");
        slow.timeout_ms = Some(20_000);

        let running = Arc::clone(&exec);
        let task = tokio::spawn(async move { running.execute(slow).await });
        while exec.running().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let report = exec.execute(request("1", "dup")).await;
        assert_eq!(report.outcome, Outcome::Rejected);
        assert!(report.error.unwrap().contains("already running"));

        exec.abort("dup");
        task.await.unwrap();
    }

    #[tokio::test]
    async fn connection_loss_fails_running_jobs() {
        let exec = executor();
        let mut slow = request("sleep(10000); 1", "lost");
        slow.timeout_ms = Some(20_000);

        let running = Arc::clone(&exec);
        let task = tokio::spawn(async move { running.execute(slow).await });
        while exec.running().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert_eq!(exec.fail_all_connection_lost(), 1);
        let report = task.await.unwrap();
        assert_eq!(report.outcome, Outcome::Failed);
        assert!(report.error.unwrap().contains("Connection lost"));
    }

    #[tokio::test]
    async fn scripts_share_the_document() {
        let exec = executor();
        exec.execute(request(r#"doc_set("/count", 1)"#, "w1")).await;
        let report = exec
            .execute(request(r#"doc_set("/count", doc_get("/count") + 1); doc_get("/count")"#, "w2"))
            .await;
        assert_eq!(report.result, Some(json!(2)));
        assert_eq!(exec.document().snapshot()["count"], 2);
    }

    #[test]
    fn health_advertises_full_trust_only_when_allowed() {
        assert!(!executor().health().features.contains(&"fullTrust".to_string()));
        let exec = executor_with(|c| c.allow_full_trust = true);
        let health = exec.health();
        assert!(health.healthy);
        assert_eq!(health.api_version, API_VERSION);
        assert!(health.features.contains(&"fullTrust".to_string()));
    }
}
