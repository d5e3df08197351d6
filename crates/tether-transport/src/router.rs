//! Inbound envelope routing.
//!
//! Decodes text frames, resolves correlated responses, and fans commands
//! out to registered handlers. Each handler runs in its own task; a failing
//! or panicking handler is logged and never affects the router or its peers.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError, RwLock},
};

use serde_json::json;
use tether_core::{Command, CommandHandler, Envelope, envelope::kinds};
use tokio::{
    sync::{mpsc, oneshot},
    time::Instant,
};

use crate::protocol;

/// Outbound queue the router replies through; one per physical connection.
pub type Outbox = mpsc::UnboundedSender<Envelope>;

/// Callback run each time a connection ends.
pub type DisconnectHook = Box<dyn Fn() + Send + Sync>;

/// What happened to one inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Routed {
    /// Not a valid envelope.
    Malformed,
    /// Stamped with another session's id.
    ForeignSession,
    /// `helloAck`, `pong` or `connected`; the caller owns these.
    Reserved(Envelope),
    /// Answered an outstanding request.
    Resolved,
    /// Response with no waiter (late or duplicate).
    Unmatched,
    /// Handed to this many handlers.
    Dispatched(usize),
    /// No handler registered for the type.
    Unhandled,
}

struct PendingRequest {
    issued_at: Instant,
    reply: oneshot::Sender<Envelope>,
}

/// Handler registry and pending-request table.
#[derive(Default)]
pub struct MessageRouter {
    handlers: RwLock<HashMap<String, Vec<Arc<dyn CommandHandler>>>>,
    wildcard: RwLock<Vec<Arc<dyn CommandHandler>>>,
    pending: Mutex<HashMap<String, PendingRequest>>,
    disconnect_hooks: RwLock<Vec<DisconnectHook>>,
}

impl MessageRouter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a handler for one command type.
    pub fn register(&self, kind: impl Into<String>, handler: Arc<dyn CommandHandler>) {
        let kind = kind.into();
        tracing::debug!(%kind, handler = handler.name(), "Registering handler");
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(kind)
            .or_default()
            .push(handler);
    }

    /// Add a handler that sees every non-reserved command.
    pub fn register_wildcard(&self, handler: Arc<dyn CommandHandler>) {
        tracing::debug!(handler = handler.name(), "Registering wildcard handler");
        self.wildcard
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handler);
    }

    /// Run `hook` every time a connection ends, before any reconnect.
    pub fn on_disconnect(&self, hook: impl Fn() + Send + Sync + 'static) {
        self.disconnect_hooks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Box::new(hook));
    }

    /// Track an outgoing request. The receiver yields the matching response.
    pub fn track(&self, id: impl Into<String>) -> oneshot::Receiver<Envelope> {
        let (reply, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                id.into(),
                PendingRequest {
                    issued_at: Instant::now(),
                    reply,
                },
            );
        rx
    }

    /// Forget a request, e.g. after its timeout fired.
    pub fn untrack(&self, id: &str) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
            .is_some()
    }

    /// Number of outstanding requests.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Drop every outstanding request; waiters observe a closed channel.
    pub fn fail_pending(&self) -> usize {
        let drained: Vec<_> = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        if !drained.is_empty() {
            tracing::warn!(count = drained.len(), "Failing outstanding requests");
        }
        drained.len()
    }

    /// A connection ended: fail outstanding requests and run disconnect hooks.
    pub fn connection_lost(&self) -> usize {
        let failed = self.fail_pending();
        for hook in self
            .disconnect_hooks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
        {
            hook();
        }
        failed
    }

    /// Resolve the waiter for `envelope.id`, if any. At most once per id.
    fn resolve(&self, envelope: Envelope) -> Result<(), Envelope> {
        let entry = envelope.id.as_deref().and_then(|id| {
            self.pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(id)
        });
        match entry {
            Some(pending) => {
                tracing::trace!(id = ?envelope.id, latency = ?pending.issued_at.elapsed(), "Request resolved");
                let _ = pending.reply.send(envelope);
                Ok(())
            }
            None => Err(envelope),
        }
    }

    /// Route one inbound text frame.
    pub fn route(&self, text: &str, session_id: &str, outbox: &Outbox) -> Routed {
        let envelope = match Envelope::decode(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(error = %e, "Dropping malformed envelope");
                return Routed::Malformed;
            }
        };

        if !envelope.belongs_to(session_id) {
            tracing::warn!(
                kind = %envelope.kind,
                foreign = envelope.session_id.as_deref().unwrap_or_default(),
                "Dropping envelope for another session"
            );
            return Routed::ForeignSession;
        }

        if kinds::is_reserved(&envelope.kind) {
            return Routed::Reserved(envelope);
        }

        let envelope = match self.resolve(envelope) {
            Ok(()) => return Routed::Resolved,
            Err(envelope) => envelope,
        };

        if envelope.kind == kinds::RESPONSE {
            tracing::debug!(id = ?envelope.id, "Dropping response with no waiter");
            return Routed::Unmatched;
        }

        self.dispatch(envelope, outbox)
    }

    fn handlers_for(&self, kind: &str) -> Vec<Arc<dyn CommandHandler>> {
        let mut handlers = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(kind)
            .cloned()
            .unwrap_or_default();
        handlers.extend(
            self.wildcard
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .iter()
                .cloned(),
        );
        handlers
    }

    fn dispatch(&self, envelope: Envelope, outbox: &Outbox) -> Routed {
        let handlers = self.handlers_for(&envelope.kind);
        if handlers.is_empty() {
            tracing::warn!(kind = %envelope.kind, "No handler for command type");
            return Routed::Unhandled;
        }

        let command = match Command::from_envelope(&envelope) {
            Ok(command) => Arc::new(command),
            Err(e) => {
                tracing::warn!(kind = %envelope.kind, error = %e, "Invalid command payload");
                if let Some(id) = envelope.id.as_deref() {
                    let reply = Envelope::response(
                        id,
                        json!({ "success": false, "error": format!("Invalid payload: {e}"), "outcome": "rejected" }),
                    );
                    let _ = outbox.send(reply);
                }
                return Routed::Dispatched(0);
            }
        };

        let envelope = Arc::new(envelope);
        let count = handlers.len();
        for handler in handlers {
            spawn_handler(handler, Arc::clone(&envelope), Arc::clone(&command), outbox.clone());
        }
        Routed::Dispatched(count)
    }
}

/// Run one handler in its own task, supervised for errors and panics.
fn spawn_handler(
    handler: Arc<dyn CommandHandler>,
    envelope: Arc<Envelope>,
    command: Arc<Command>,
    outbox: Outbox,
) {
    let name = handler.name();
    let kind = envelope.kind.clone();
    let id = envelope.id.clone();

    let task = tokio::spawn(async move { handler.handle(&envelope, &command).await });

    tokio::spawn(async move {
        let reply = match task.await {
            Ok(Ok(Some(value))) => id.as_deref().map(|id| Envelope::response(id, value)),
            Ok(Ok(None)) => None,
            Ok(Err(e)) => {
                tracing::error!(handler = name, %kind, error = %e, "Handler failed");
                id.as_deref()
                    .map(|id| protocol::error_response(id, &e.to_string()))
            }
            Err(e) if e.is_panic() => {
                tracing::error!(handler = name, %kind, "Handler panicked");
                id.as_deref()
                    .map(|id| protocol::error_response(id, "handler panicked"))
            }
            Err(e) => {
                tracing::warn!(handler = name, %kind, error = %e, "Handler task cancelled");
                None
            }
        };
        if let Some(reply) = reply {
            if outbox.send(reply).is_err() {
                tracing::warn!(handler = name, %kind, ?id, "Connection gone; reply dropped");
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use serde_json::Value;
    use tether_core::HandlerError;

    use super::*;

    struct Echo;

    #[async_trait]
    impl CommandHandler for Echo {
        fn name(&self) -> &'static str {
            "echo"
        }

        async fn handle(
            &self,
            envelope: &Envelope,
            _command: &Command,
        ) -> Result<Option<Value>, HandlerError> {
            Ok(Some(envelope.payload_value()))
        }
    }

    #[derive(Default)]
    struct Counter(AtomicUsize);

    #[async_trait]
    impl CommandHandler for Counter {
        fn name(&self) -> &'static str {
            "counter"
        }

        async fn handle(
            &self,
            _envelope: &Envelope,
            _command: &Command,
        ) -> Result<Option<Value>, HandlerError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(None)
        }
    }

    struct Panics;

    #[async_trait]
    impl CommandHandler for Panics {
        fn name(&self) -> &'static str {
            "panics"
        }

        async fn handle(
            &self,
            _envelope: &Envelope,
            _command: &Command,
        ) -> Result<Option<Value>, HandlerError> {
            panic!("handler bug");
        }
    }

    fn setup() -> (Arc<MessageRouter>, Outbox, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(MessageRouter::new()), tx, rx)
    }

    #[tokio::test]
    async fn malformed_and_foreign_are_dropped() {
        let (router, outbox, _rx) = setup();
        assert_eq!(router.route("not json", "me", &outbox), Routed::Malformed);
        assert_eq!(
            router.route(r#"{"type":"x","sessionId":"other"}"#, "me", &outbox),
            Routed::ForeignSession
        );
    }

    #[tokio::test]
    async fn reserved_types_are_returned() {
        let (router, outbox, _rx) = setup();
        router.register_wildcard(Arc::new(Counter::default()));
        let routed = router.route(r#"{"type":"helloAck","sessionId":"me"}"#, "me", &outbox);
        assert!(matches!(routed, Routed::Reserved(env) if env.kind == "helloAck"));
        assert!(matches!(
            router.route(r#"{"type":"pong"}"#, "me", &outbox),
            Routed::Reserved(_)
        ));
    }

    #[tokio::test]
    async fn response_resolves_exactly_once() {
        let (router, outbox, _rx) = setup();
        let rx = router.track("r1");
        let frame = r#"{"type":"response","id":"r1","ok":true}"#;

        assert_eq!(router.route(frame, "me", &outbox), Routed::Resolved);
        assert_eq!(router.route(frame, "me", &outbox), Routed::Unmatched);
        assert_eq!(rx.await.unwrap().payload["ok"], true);
        assert_eq!(router.pending_count(), 0);
    }

    #[tokio::test]
    async fn untracked_request_ignores_late_answer() {
        let (router, outbox, _rx) = setup();
        let rx = router.track("r2");
        assert!(router.untrack("r2"));
        assert_eq!(
            router.route(r#"{"type":"response","id":"r2"}"#, "me", &outbox),
            Routed::Unmatched
        );
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn fail_pending_closes_waiters() {
        let (router, _outbox, _rx) = setup();
        let a = router.track("a");
        let b = router.track("b");
        assert_eq!(router.fail_pending(), 2);
        assert!(a.await.is_err());
        assert!(b.await.is_err());
    }

    #[tokio::test]
    async fn connection_lost_runs_hooks_after_failing_requests() {
        let (router, _outbox, _rx) = setup();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        router.on_disconnect(move || {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        let waiter = router.track("a");

        assert_eq!(router.connection_lost(), 1);
        assert!(waiter.await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        assert_eq!(router.connection_lost(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn replies_to_correlated_commands() {
        let (router, outbox, mut rx) = setup();
        router.register("echo.me", Arc::new(Echo));
        assert_eq!(
            router.route(r#"{"type":"echo.me","id":"c1","value":5}"#, "me", &outbox),
            Routed::Dispatched(1)
        );
        let reply = rx.recv().await.unwrap();
        assert_eq!(reply.kind, "response");
        assert_eq!(reply.id.as_deref(), Some("c1"));
        assert_eq!(reply.payload["value"], 5);
    }

    #[tokio::test]
    async fn fans_out_to_type_and_wildcard() {
        let (router, outbox, _rx) = setup();
        let typed = Arc::new(Counter::default());
        let wild = Arc::new(Counter::default());
        router.register("dom.click", Arc::clone(&typed) as Arc<dyn CommandHandler>);
        router.register("dom.click", Arc::clone(&typed) as Arc<dyn CommandHandler>);
        router.register_wildcard(Arc::clone(&wild) as Arc<dyn CommandHandler>);

        assert_eq!(router.route(r#"{"type":"dom.click"}"#, "me", &outbox), Routed::Dispatched(3));
        assert_eq!(router.route(r#"{"type":"dom.scroll"}"#, "me", &outbox), Routed::Dispatched(1));

        for _ in 0..100 {
            if typed.0.load(Ordering::SeqCst) == 2 && wild.0.load(Ordering::SeqCst) == 2 {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("handlers did not all run");
    }

    #[tokio::test]
    async fn panicking_handler_is_isolated() {
        let (router, outbox, mut rx) = setup();
        router.register("work", Arc::new(Panics));
        router.register("work", Arc::new(Echo));

        assert_eq!(
            router.route(r#"{"type":"work","id":"p1","n":1}"#, "me", &outbox),
            Routed::Dispatched(2)
        );

        let mut replies = vec![rx.recv().await.unwrap(), rx.recv().await.unwrap()];
        replies.sort_by_key(|r| r.payload.contains_key("success"));
        assert_eq!(replies[0].payload["n"], 1);
        assert_eq!(replies[1].payload["success"], false);
    }

    #[tokio::test]
    async fn unhandled_and_bad_payload() {
        let (router, outbox, mut rx) = setup();
        assert_eq!(router.route(r#"{"type":"nobody"}"#, "me", &outbox), Routed::Unhandled);

        router.register(kinds::EXECUTE_ABORT, Arc::new(Counter::default()));
        assert_eq!(
            router.route(r#"{"type":"execute.abort","id":"b1"}"#, "me", &outbox),
            Routed::Dispatched(0)
        );
        let reply = rx.recv().await.unwrap();
        assert_eq!(reply.id.as_deref(), Some("b1"));
        assert_eq!(reply.payload["outcome"], "rejected");
    }
}
