//! Session actor.
//!
//! One task per client owns the socket, heartbeat and reconnect loop, and
//! keeps a single instance identity across physical connections. Callers
//! talk to it through a [`SessionHandle`].

use std::{sync::Arc, time::Duration};

use futures::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use serde_json::Value;
use tether_core::{
    ConfigHandle, Envelope, TetherConfig, config::parse_server_url, envelope::kinds,
};
use tether_session::SessionIdentity;
use tokio::{
    net::TcpStream,
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, tungstenite::Message};
use uuid::Uuid;

use crate::{
    connection::{Connection, ConnectionState},
    error::{RequestError, TransportError},
    heartbeat::HeartbeatMonitor,
    protocol,
    reconnect::{Backoff, ReconnectPolicy},
    router::{MessageRouter, Routed},
};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Sink = SplitSink<Socket, Message>;

const CLOSE_GRACE: Duration = Duration::from_secs(1);

enum SessionCommand {
    Send {
        envelope: Envelope,
        ack: oneshot::Sender<Result<(), TransportError>>,
    },
    Shutdown,
}

/// Why one connection cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CycleEnd {
    Shutdown,
    /// `server_url` changed; reconnect immediately.
    Retarget,
    /// Failed to establish, or dropped after establishing.
    Lost,
}

enum Wait {
    Elapsed,
    Retarget,
    Shutdown,
}

/// Entry point for starting a session actor.
pub struct Session;

impl Session {
    /// Spawn the session actor. It connects immediately and keeps
    /// reconnecting until [`SessionHandle::shutdown`].
    #[must_use]
    pub fn start(
        config: ConfigHandle,
        identity: SessionIdentity,
        router: Arc<MessageRouter>,
    ) -> SessionHandle {
        let connection = Connection::new();
        let state = connection.subscribe();
        let (ready_tx, ready_rx) = watch::channel(false);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();

        let actor = SessionActor {
            config_rx: config.subscribe(),
            identity,
            session_id: identity.to_string(),
            router: Arc::clone(&router),
            connection,
            ready: ready_tx,
            commands: commands_rx,
            backoff: Backoff::new(),
        };
        let task = tokio::spawn(actor.run());

        SessionHandle {
            identity,
            commands: commands_tx,
            state,
            ready: ready_rx,
            router,
            config,
            task,
        }
    }
}

/// Caller-side handle to a running session.
pub struct SessionHandle {
    identity: SessionIdentity,
    commands: mpsc::UnboundedSender<SessionCommand>,
    state: watch::Receiver<ConnectionState>,
    ready: watch::Receiver<bool>,
    router: Arc<MessageRouter>,
    config: ConfigHandle,
    task: JoinHandle<()>,
}

impl SessionHandle {
    #[must_use]
    pub const fn identity(&self) -> SessionIdentity {
        self.identity
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Observe connection state changes.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Whether the current connection has completed the handshake.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// Wait until a connection completes the handshake.
    ///
    /// # Errors
    /// Returns error if the session stops first.
    pub async fn ready(&self) -> Result<(), TransportError> {
        let mut ready = self.ready.clone();
        ready
            .wait_for(|ready| *ready)
            .await
            .map(|_| ())
            .map_err(|_| TransportError::Shutdown)
    }

    /// Send an uncorrelated envelope.
    ///
    /// # Errors
    /// Returns `NotConnected` before the handshake completes; messages are
    /// never queued for a later connection.
    pub async fn notify(&self, envelope: Envelope) -> Result<(), TransportError> {
        let (ack, rx) = oneshot::channel();
        self.commands
            .send(SessionCommand::Send { envelope, ack })
            .map_err(|_| TransportError::Shutdown)?;
        rx.await.map_err(|_| TransportError::Shutdown)?
    }

    /// Send a correlated request and wait for its response.
    ///
    /// Uses the configured request timeout when `timeout` is `None`.
    ///
    /// # Errors
    /// Returns error if sending fails, the timeout fires, or the connection
    /// drops before the response arrives.
    pub async fn request(
        &self,
        kind: &str,
        payload: Value,
        timeout: Option<Duration>,
    ) -> Result<Envelope, RequestError> {
        let id = Uuid::new_v4().to_string();
        let timeout = timeout.unwrap_or_else(|| self.config.current().request_timeout());
        let response = self.router.track(id.as_str());

        let envelope = Envelope::new(kind).with_id(id.as_str()).with_payload(payload);
        if let Err(e) = self.notify(envelope).await {
            self.router.untrack(&id);
            return Err(e.into());
        }

        match tokio::time::timeout(timeout, response).await {
            Ok(Ok(envelope)) => Ok(envelope),
            Ok(Err(_)) => Err(RequestError::ConnectionLost),
            Err(_) => {
                self.router.untrack(&id);
                Err(RequestError::Timeout {
                    id,
                    timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                })
            }
        }
    }

    /// Close the connection and stop reconnecting.
    pub async fn shutdown(self) {
        let _ = self.commands.send(SessionCommand::Shutdown);
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "Session task failed");
        }
    }
}

struct SessionActor {
    config_rx: watch::Receiver<TetherConfig>,
    identity: SessionIdentity,
    session_id: String,
    router: Arc<MessageRouter>,
    connection: Connection,
    ready: watch::Sender<bool>,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    backoff: Backoff,
}

impl SessionActor {
    async fn run(mut self) {
        tracing::info!(session_id = %self.session_id, durable = self.identity.is_durable(), "Session starting");

        loop {
            let config = self.config_rx.borrow_and_update().clone();
            let delay = self.backoff.delay(&ReconnectPolicy::from_config(&config.reconnect));
            if !delay.is_zero() {
                tracing::info!(
                    session_id = %self.session_id,
                    attempt = self.backoff.attempt(),
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "Reconnecting after backoff"
                );
                match self.wait_offline(delay, &config.server_url).await {
                    Wait::Elapsed => {}
                    Wait::Retarget => {
                        self.backoff.reset();
                        continue;
                    }
                    Wait::Shutdown => break,
                }
            }

            let begin = if self.connection.state() == ConnectionState::Idle {
                self.connection.connect().map(|_| ())
            } else {
                self.connection.reconnect()
            };
            if let Err(e) = begin {
                tracing::error!(session_id = %self.session_id, error = %e, "Cannot start connection attempt");
                break;
            }

            let end = self.cycle(&config).await;
            self.on_disconnect();
            match end {
                CycleEnd::Shutdown => break,
                CycleEnd::Retarget => self.backoff.reset(),
                CycleEnd::Lost => self.backoff.on_failure(),
            }
        }

        self.on_disconnect();
        tracing::info!(session_id = %self.session_id, "Session stopped");
    }

    /// Sit out a backoff delay while still answering callers.
    async fn wait_offline(&mut self, delay: Duration, server_url: &str) -> Wait {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                () = &mut sleep => return Wait::Elapsed,
                cmd = self.commands.recv() => match cmd {
                    None | Some(SessionCommand::Shutdown) => return Wait::Shutdown,
                    Some(SessionCommand::Send { ack, .. }) => {
                        let _ = ack.send(Err(TransportError::NotConnected));
                    }
                },
                Ok(()) = self.config_rx.changed() => {
                    if self.retargeted(server_url) {
                        return Wait::Retarget;
                    }
                }
            }
        }
    }

    /// One physical connection: connect, handshake, serve until it ends.
    async fn cycle(&mut self, config: &TetherConfig) -> CycleEnd {
        let url = match parse_server_url(&config.server_url) {
            Ok(base) => protocol::session_url(&base, &self.identity.id()),
            Err(e) => {
                tracing::error!(session_id = %self.session_id, error = %e, "Invalid server url");
                self.set_state(ConnectionState::Closed);
                return CycleEnd::Lost;
            }
        };
        let deadline = Instant::now() + config.handshake_timeout();
        tracing::info!(session_id = %self.session_id, %url, "Connecting");

        let connecting = tokio::time::timeout_at(deadline, tokio_tungstenite::connect_async(url.as_str()));
        tokio::pin!(connecting);

        let socket = loop {
            tokio::select! {
                result = &mut connecting => match result {
                    Ok(Ok((socket, _response))) => break socket,
                    Ok(Err(e)) => {
                        tracing::warn!(session_id = %self.session_id, error = %e, "Connection failed");
                        self.set_state(ConnectionState::Closed);
                        return CycleEnd::Lost;
                    }
                    Err(_) => {
                        tracing::warn!(session_id = %self.session_id, "Connection attempt timed out");
                        self.set_state(ConnectionState::Closed);
                        return CycleEnd::Lost;
                    }
                },
                cmd = self.commands.recv() => match cmd {
                    None | Some(SessionCommand::Shutdown) => {
                        self.set_state(ConnectionState::Closed);
                        return CycleEnd::Shutdown;
                    }
                    Some(SessionCommand::Send { ack, .. }) => {
                        let _ = ack.send(Err(TransportError::NotConnected));
                    }
                },
                Ok(()) = self.config_rx.changed() => {
                    if self.retargeted(&config.server_url) {
                        self.set_state(ConnectionState::Closed);
                        return CycleEnd::Retarget;
                    }
                }
            }
        };

        self.set_state(ConnectionState::Open);
        self.serve(socket, config, deadline).await
    }

    async fn serve(&mut self, socket: Socket, config: &TetherConfig, deadline: Instant) -> CycleEnd {
        let (mut sink, mut stream) = socket.split();
        let mut heartbeat = HeartbeatMonitor::from_config(&config.heartbeat);
        let period = heartbeat.interval().max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let handshake = tokio::time::sleep_until(deadline);
        tokio::pin!(handshake);
        let mut established = false;
        // Dropped with this connection, so late handler replies never reach a later one.
        let (outbox_tx, mut outbox) = mpsc::unbounded_channel();

        if let Err(e) = self.send(&mut sink, protocol::hello(&self.identity.id())).await {
            tracing::warn!(session_id = %self.session_id, error = %e, "Failed to send hello");
            self.set_state(ConnectionState::Closed);
            return CycleEnd::Lost;
        }

        let end = loop {
            tokio::select! {
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        heartbeat.record_traffic();
                        let routed = self.router.route(text.as_str(), &self.session_id, &outbox_tx);
                        if let Routed::Reserved(envelope) = routed {
                            if envelope.kind == kinds::HELLO_ACK && !established {
                                established = true;
                                self.backoff.on_open();
                                self.ready.send_replace(true);
                                tracing::info!(session_id = %self.session_id, "Handshake complete");
                            }
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        tracing::info!(session_id = %self.session_id, ?frame, "Controller closed the connection");
                        break CycleEnd::Lost;
                    }
                    Some(Ok(_)) => heartbeat.record_traffic(),
                    Some(Err(e)) => {
                        tracing::warn!(session_id = %self.session_id, error = %e, "WebSocket error");
                        break CycleEnd::Lost;
                    }
                    None => break CycleEnd::Lost,
                },
                () = &mut handshake, if !established => {
                    tracing::warn!(session_id = %self.session_id, "Handshake timed out");
                    break CycleEnd::Lost;
                }
                _ = ticker.tick() => {
                    if heartbeat.is_expired() {
                        tracing::warn!(
                            session_id = %self.session_id,
                            silence = ?heartbeat.silence(),
                            "Heartbeat expired"
                        );
                        break CycleEnd::Lost;
                    }
                    if self.send(&mut sink, protocol::ping()).await.is_err() {
                        break CycleEnd::Lost;
                    }
                }
                cmd = self.commands.recv() => match cmd {
                    None | Some(SessionCommand::Shutdown) => break CycleEnd::Shutdown,
                    Some(SessionCommand::Send { envelope, ack }) => {
                        if !established {
                            let _ = ack.send(Err(TransportError::NotConnected));
                            continue;
                        }
                        let result = self.send(&mut sink, envelope).await;
                        let failed = result.is_err();
                        let _ = ack.send(result);
                        if failed {
                            break CycleEnd::Lost;
                        }
                    }
                },
                Some(envelope) = outbox.recv() => {
                    if !established {
                        Self::drop_reply(&envelope);
                    } else if let Err(e) = self.send(&mut sink, envelope).await {
                        tracing::warn!(session_id = %self.session_id, error = %e, "Failed to send reply");
                        break CycleEnd::Lost;
                    }
                }
                Ok(()) = self.config_rx.changed() => {
                    if self.retargeted(&config.server_url) {
                        break CycleEnd::Retarget;
                    }
                }
            }
        };

        drop(outbox);
        match end {
            CycleEnd::Shutdown | CycleEnd::Retarget => {
                self.set_state(ConnectionState::Closing);
                let _ = sink.send(Message::Close(None)).await;
                self.await_close(&mut stream).await;
                let _ = sink.close().await;
                self.set_state(ConnectionState::Closed);
            }
            CycleEnd::Lost => self.set_state(ConnectionState::Closed),
        }
        end
    }

    /// Wait for the peer to acknowledge our close frame, bounded by `CLOSE_GRACE`.
    async fn await_close(&self, stream: &mut SplitStream<Socket>) {
        let drain = async {
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        };
        if tokio::time::timeout(CLOSE_GRACE, drain).await.is_err() {
            tracing::debug!(session_id = %self.session_id, "Peer did not confirm close");
        }
    }

    async fn send(&self, sink: &mut Sink, envelope: Envelope) -> Result<(), TransportError> {
        let text = envelope.with_session(self.session_id.as_str()).encode()?;
        sink.send(Message::Text(text.into()))
            .await
            .map_err(|e| TransportError::Socket(e.to_string()))
    }

    fn set_state(&self, to: ConnectionState) {
        match self.connection.transition(to) {
            Ok(()) => tracing::info!(session_id = %self.session_id, state = %to, "Connection state"),
            Err(e) => tracing::error!(session_id = %self.session_id, error = %e, "Connection state machine violated"),
        }
    }

    fn retargeted(&mut self, current: &str) -> bool {
        let next = self.config_rx.borrow_and_update().server_url.clone();
        if next == current {
            return false;
        }
        tracing::info!(session_id = %self.session_id, from = %current, to = %next, "Server url changed");
        true
    }

    fn on_disconnect(&self) {
        self.ready.send_replace(false);
        self.router.connection_lost();
    }

    fn drop_reply(envelope: &Envelope) {
        tracing::warn!(id = ?envelope.id, kind = %envelope.kind, "Not connected; dropping reply");
    }
}
