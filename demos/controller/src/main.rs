//! Demo controller for tether sessions.
//!
//! Run with: cargo run -p tether-controller
//!
//! Clients connect to `ws://<bind>/session/<instance-id>`. Commands are
//! issued over HTTP:
//!
//! ```text
//! curl localhost:8765/sessions
//! curl -XPOST localhost:8765/sessions/<id>/execute -d '{"code":"40 + 2"}'
//! curl -XPOST localhost:8765/sessions/<id>/abort/<execution-id>
//! curl -XPOST localhost:8765/ping
//! ```

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};

use axum::{
    Json, Router,
    extract::{
        Path, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use clap::Parser;
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tether_core::{Envelope, envelope::kinds};
use tokio::sync::{RwLock, broadcast, mpsc, oneshot};
use tokio_stream::wrappers::BroadcastStream;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

const COMMAND_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Parser, Debug)]
#[command(name = "tether-controller", about = "Accept tether sessions and issue commands")]
struct Args {
    /// Address to listen on.
    #[arg(long, env = "TETHER_CONTROLLER_BIND", default_value = "127.0.0.1:8765")]
    bind: SocketAddr,
}

type Pending = Arc<Mutex<HashMap<String, oneshot::Sender<Envelope>>>>;

/// A connected client.
struct SessionLink {
    outbound: mpsc::UnboundedSender<Envelope>,
    pending: Pending,
}

#[derive(Clone)]
struct AppState {
    sessions: Arc<RwLock<HashMap<String, SessionLink>>>,
    broadcast: broadcast::Sender<Envelope>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=debug".into()),
        )
        .init();

    let args = Args::parse();
    let (broadcast, _) = broadcast::channel(64);
    let state = AppState {
        sessions: Arc::new(RwLock::new(HashMap::new())),
        broadcast,
    };

    let app = Router::new()
        .route("/session/{id}", get(ws_handler))
        .route("/sessions", get(list_sessions))
        .route("/sessions/{id}/execute", post(execute))
        .route("/sessions/{id}/abort/{execution_id}", post(abort))
        .route("/ping", post(ping_all))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!("Controller listening on ws://{}", args.bind);
    axum::serve(listener, app).await?;
    Ok(())
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, id, state))
}

async fn handle_socket(socket: WebSocket, session_id: String, state: AppState) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();
    let pending: Pending = Arc::default();
    let mut broadcasts = BroadcastStream::new(state.broadcast.subscribe());

    let replaced = state.sessions.write().await.insert(
        session_id.clone(),
        SessionLink {
            outbound: tx.clone(),
            pending: Arc::clone(&pending),
        },
    );
    if replaced.is_some() {
        tracing::info!(session = %session_id, "Session reconnected, replacing previous link");
    }

    let send_task = tokio::spawn({
        let session_id = session_id.clone();
        async move {
            loop {
                let envelope = tokio::select! {
                    Some(envelope) = rx.recv() => envelope,
                    Some(Ok(envelope)) = broadcasts.next() => envelope,
                    else => break,
                };
                let envelope = envelope.with_session(session_id.as_str());
                let text = match envelope.encode() {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::error!("Failed to serialize envelope: {e}");
                        continue;
                    }
                };
                if ws_sender.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
        }
    });

    while let Some(msg) = ws_receiver.next().await {
        let text = match msg {
            Ok(Message::Text(t)) => t,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::warn!(session = %session_id, "WebSocket error: {e}");
                break;
            }
        };

        let envelope = match Envelope::decode(text.as_str()) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(session = %session_id, "Invalid client message: {e}");
                continue;
            }
        };

        match envelope.kind.as_str() {
            kinds::HELLO => {
                tracing::info!(session = %session_id, "Session hello");
                let _ = tx.send(Envelope::new(kinds::HELLO_ACK));
            }
            kinds::PING => {
                let _ = tx.send(Envelope::new(kinds::PONG));
            }
            kinds::RESPONSE => {
                let waiter = envelope
                    .id
                    .as_deref()
                    .and_then(|id| lock(&pending).remove(id));
                match waiter {
                    Some(waiter) => {
                        let _ = waiter.send(envelope);
                    }
                    None => tracing::info!(
                        session = %session_id,
                        payload = %envelope.payload_value(),
                        "Uncorrelated response"
                    ),
                }
            }
            other => tracing::info!(
                session = %session_id,
                kind = other,
                payload = %envelope.payload_value(),
                "Client message"
            ),
        }
    }

    send_task.abort();
    let mut sessions = state.sessions.write().await;
    if sessions
        .get(&session_id)
        .is_some_and(|link| link.outbound.same_channel(&tx))
    {
        sessions.remove(&session_id);
    }
    tracing::info!(session = %session_id, "Session disconnected");
}

async fn list_sessions(State(state): State<AppState>) -> Json<Vec<String>> {
    let mut ids: Vec<String> = state.sessions.read().await.keys().cloned().collect();
    ids.sort();
    Json(ids)
}

async fn execute(
    Path(id): Path<String>,
    State(state): State<AppState>,
    Json(payload): Json<Value>,
) -> Result<Json<Value>, (StatusCode, String)> {
    let envelope = Envelope::new(kinds::EXECUTE_CODE).with_payload(payload);
    send_command(&state, &id, envelope).await
}

async fn abort(
    Path((id, execution_id)): Path<(String, String)>,
    State(state): State<AppState>,
) -> Result<Json<Value>, (StatusCode, String)> {
    let envelope = Envelope::new(kinds::EXECUTE_ABORT).with_field("executionId", execution_id);
    send_command(&state, &id, envelope).await
}

async fn ping_all(State(state): State<AppState>) -> Json<Value> {
    let reached = state
        .broadcast
        .send(Envelope::new(kinds::EXECUTE_PING))
        .unwrap_or(0);
    Json(json!({ "reached": reached }))
}

async fn send_command(
    state: &AppState,
    session_id: &str,
    envelope: Envelope,
) -> Result<Json<Value>, (StatusCode, String)> {
    let request_id = Uuid::new_v4().to_string();
    let (reply_tx, reply_rx) = oneshot::channel();

    {
        let sessions = state.sessions.read().await;
        let link = sessions
            .get(session_id)
            .ok_or((StatusCode::NOT_FOUND, format!("no session {session_id}")))?;
        lock(&link.pending).insert(request_id.clone(), reply_tx);
        if link.outbound.send(envelope.with_id(request_id.as_str())).is_err() {
            lock(&link.pending).remove(&request_id);
            return Err((StatusCode::GONE, "session closed".to_string()));
        }
    }

    match tokio::time::timeout(COMMAND_TIMEOUT, reply_rx).await {
        Ok(Ok(reply)) => Ok(Json(reply.payload_value())),
        Ok(Err(_)) => Err((StatusCode::GONE, "session disconnected".to_string())),
        Err(_) => {
            if let Some(link) = state.sessions.read().await.get(session_id) {
                lock(&link.pending).remove(&request_id);
            }
            Err((StatusCode::GATEWAY_TIMEOUT, "no response".to_string()))
        }
    }
}

fn lock(pending: &Pending) -> std::sync::MutexGuard<'_, HashMap<String, oneshot::Sender<Envelope>>> {
    pending
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}
