//! Script isolation boundary.
//!
//! Every job gets a fresh Rhai engine on its own OS thread. In constrained
//! mode the engine sees nothing but the document capabilities, and those
//! reach the host only as [`DocOp`] messages answered over a channel. The
//! script never holds a reference to host state.

pub mod document;
pub mod host;

use std::{sync::Arc, time::Duration};

use rhai::{Dynamic, Engine, EvalAltResult, Position};
use serde_json::Value;
use tether_core::ExecutionMode;
use tokio::sync::{mpsc, oneshot};

pub use document::{DocError, DocOp, Document};

use crate::{ExecError, job::JobControl};

const SLEEP_SLICE: Duration = Duration::from_millis(10);

/// A capability call waiting for the host to answer.
#[derive(Debug)]
pub struct CapabilityCall {
    pub op: DocOp,
    pub reply: oneshot::Sender<Result<Value, DocError>>,
}

/// Script-side end of the capability channel.
#[derive(Debug, Clone)]
pub struct Bridge {
    tx: mpsc::UnboundedSender<CapabilityCall>,
}

impl Bridge {
    /// Create a bridge and the receiver the host services.
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<CapabilityCall>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Send a call and block the script thread until the host replies.
    fn call(&self, op: DocOp) -> Result<Dynamic, Box<EvalAltResult>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(CapabilityCall { op, reply })
            .map_err(|_| runtime_error("execution has ended"))?;
        let value = rx
            .blocking_recv()
            .map_err(|_| runtime_error("execution has ended"))?
            .map_err(|e| runtime_error(e.to_string()))?;
        rhai::serde::to_dynamic(value)
    }
}

/// Everything a script thread needs.
pub struct ScriptContext {
    pub control: Arc<JobControl>,
    pub bridge: Bridge,
    pub max_operations: u64,
}

/// Evaluate `code` and convert its value to JSON.
///
/// Blocks the calling thread; run it on a dedicated thread.
///
/// # Errors
/// Returns error if the script fails, is interrupted, or returns a value
/// that has no JSON form.
pub fn run_script(code: &str, ctx: &ScriptContext) -> Result<Value, ExecError> {
    let engine = build_engine(ctx);
    let result = engine.eval::<Dynamic>(code).map_err(script_error)?;
    rhai::serde::from_dynamic::<Value>(&result).map_err(|e| ExecError::Unserializable(e.to_string()))
}

fn build_engine(ctx: &ScriptContext) -> Engine {
    let mut engine = Engine::new();
    let mode = ctx.control.mode();
    let execution_id = ctx.control.execution_id().to_string();

    {
        let execution_id = execution_id.clone();
        engine.on_print(move |text| tracing::info!(%execution_id, "script: {text}"));
    }
    {
        let execution_id = execution_id.clone();
        engine.on_debug(move |text, _source, pos| {
            tracing::debug!(%execution_id, %pos, "script: {text}");
        });
    }
    engine.register_fn("log", move |text: &str| {
        tracing::info!(%execution_id, "script: {text}");
    });

    register_document(&mut engine, &ctx.bridge);

    {
        let control = Arc::clone(&ctx.control);
        engine.register_fn("sleep", move |ms: i64| {
            let total = Duration::from_millis(u64::try_from(ms).unwrap_or(0));
            let start = std::time::Instant::now();
            while start.elapsed() < total {
                if control.is_cancelled() {
                    break;
                }
                std::thread::sleep(SLEEP_SLICE.min(total.saturating_sub(start.elapsed())));
            }
        });
    }

    match mode {
        ExecutionMode::Constrained => {
            engine
                .set_module_resolver(rhai::module_resolvers::DummyModuleResolver::new())
                .disable_symbol("eval")
                .disable_symbol("import");
            engine
                .set_max_operations(ctx.max_operations)
                .set_max_call_levels(64)
                .set_max_expr_depths(64, 32)
                .set_max_string_size(1 << 20)
                .set_max_array_size(100_000)
                .set_max_map_size(100_000);

            let control = Arc::clone(&ctx.control);
            engine.on_progress(move |_ops| {
                control
                    .is_cancelled()
                    .then(|| Dynamic::from("cancelled"))
            });
        }
        ExecutionMode::FullTrust => {
            host::register(&mut engine, Arc::clone(&ctx.control));
        }
    }

    engine
}

fn register_document(engine: &mut Engine, bridge: &Bridge) {
    let b = bridge.clone();
    engine.register_fn("doc_get", move |pointer: &str| {
        b.call(DocOp::Get {
            pointer: pointer.to_string(),
        })
    });

    let b = bridge.clone();
    engine.register_fn(
        "doc_set",
        move |pointer: &str, value: Dynamic| -> Result<Dynamic, Box<EvalAltResult>> {
            let value = rhai::serde::from_dynamic::<Value>(&value)?;
            b.call(DocOp::Set {
                pointer: pointer.to_string(),
                value,
            })
        },
    );

    let b = bridge.clone();
    engine.register_fn("doc_remove", move |pointer: &str| {
        b.call(DocOp::Remove {
            pointer: pointer.to_string(),
        })
    });

    let b = bridge.clone();
    engine.register_fn(
        "doc_query",
        move |pointer: &str, key: &str, value: Dynamic| -> Result<Dynamic, Box<EvalAltResult>> {
            let value = rhai::serde::from_dynamic::<Value>(&value)?;
            b.call(DocOp::Query {
                pointer: pointer.to_string(),
                key: key.to_string(),
                value,
            })
        },
    );

    let b = bridge.clone();
    engine.register_fn("doc_keys", move |pointer: &str| {
        b.call(DocOp::Keys {
            pointer: pointer.to_string(),
        })
    });
}

fn script_error(err: Box<EvalAltResult>) -> ExecError {
    match *err {
        EvalAltResult::ErrorTerminated(..) => ExecError::Interrupted,
        EvalAltResult::ErrorTooManyOperations(..) => {
            ExecError::Script("operation budget exhausted".to_string())
        }
        other => ExecError::Script(other.to_string()),
    }
}

pub(crate) fn runtime_error(message: impl Into<String>) -> Box<EvalAltResult> {
    EvalAltResult::ErrorRuntime(message.into().into(), Position::NONE).into()
}
