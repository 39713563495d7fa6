//! SSE-over-WebSocket bridge.
//!
//! The ingress buffers and compresses chunked HTTP responses, which stalls
//! server-sent events until the stream ends. WebSocket frames are relayed
//! as they arrive, so chat clients send their request over a socket and the
//! bridge performs the streaming POST on their behalf:
//!
//! ```text
//! client --chat--> bridge --POST, Accept: text/event-stream--> app server
//! client <--start, chunk*, done | error-- bridge <--data: ... frames--
//! ```
//!
//! Each connection runs a reader loop, a writer task fed by a bounded channel,
//! and at most one chat session task at a time.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket, rejection::WebSocketUpgradeRejection},
    },
    http::{StatusCode, header::CONTENT_TYPE},
    response::{IntoResponse, Response},
    routing::get,
};
use futures::{SinkExt, StreamExt};
use ingress_protocol::{BridgeMessage, ChatPayload, ClientMessage, SseLineDecoder};
use log::{debug, error, info, warn};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::instrument;
use uuid::Uuid;

use crate::config::BridgeConfig;
use crate::error::BridgeError;

/// Answer to plain HTTP requests on the bridge port.
pub const BANNER: &str = "WebSocket proxy for AI chat streaming";

/// Lifecycle of the chat session on one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatState {
    Idle,
    /// Request sent, waiting for the upstream status line.
    AwaitingUpstream,
    Streaming,
    Done,
    Error,
    /// The client went away mid-session.
    Cancelled,
}

impl ChatState {
    /// Whether a session is in flight.
    pub fn is_active(self) -> bool {
        matches!(self, Self::AwaitingUpstream | Self::Streaming)
    }

    pub fn can_transition_to(self, next: ChatState) -> bool {
        use ChatState::*;
        matches!(
            (self, next),
            (Idle | Done | Error | Cancelled, AwaitingUpstream)
                | (AwaitingUpstream, Streaming | Error | Cancelled)
                | (Streaming, Done | Error | Cancelled)
        )
    }
}

/// Shared by every connection.
#[derive(Clone)]
pub struct BridgeState {
    http: reqwest::Client,
    config: Arc<BridgeConfig>,
}

impl BridgeState {
    pub fn new(config: BridgeConfig) -> Result<Self> {
        // The app server is local; never route to it through an environment proxy.
        let http = reqwest::Client::builder()
            .no_proxy()
            .build()
            .context("building upstream HTTP client")?;
        Ok(Self {
            http,
            config: Arc::new(config),
        })
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }
}

pub fn router(state: BridgeState) -> Router {
    Router::new()
        .route("/health", get(health))
        .fallback(entry)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind the configured address and run until `shutdown` fires.
pub async fn serve(config: BridgeConfig, shutdown: CancellationToken) -> Result<()> {
    let addr = config.listen_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding bridge listener on {addr}"))?;
    serve_listener(listener, config, shutdown).await
}

pub async fn serve_listener(
    listener: TcpListener,
    config: BridgeConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    let addr = listener
        .local_addr()
        .context("reading bridge listener address")?;
    info!(
        "WebSocket bridge listening on {}, streaming from {}",
        addr,
        config.chat_url()
    );

    let app = router(BridgeState::new(config)?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .context("bridge server error")?;

    info!("WebSocket bridge stopped");
    Ok(())
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Any path upgrades to a WebSocket; plain requests get the banner.
async fn entry(
    State(state): State<BridgeState>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    match ws {
        Ok(ws) => ws.on_upgrade(move |socket| handle_socket(socket, state)),
        Err(_) => (StatusCode::OK, [(CONTENT_TYPE, "text/plain")], BANNER).into_response(),
    }
}

/// Per-connection handles shared between the reader loop and chat sessions.
struct Connection {
    id: String,
    state: BridgeState,
    out: mpsc::Sender<BridgeMessage>,
    chat: Arc<watch::Sender<ChatState>>,
    cancel: CancellationToken,
}

impl Connection {
    async fn send(&self, message: BridgeMessage) {
        if self.out.send(message).await.is_err() {
            debug!("[{}] Writer closed, dropping message", self.id);
        }
    }

    async fn handle_text(&self, text: &str) {
        let message = match serde_json::from_str::<ClientMessage>(text) {
            Ok(message) => message,
            Err(err) => {
                warn!("[{}] Invalid client message: {}", self.id, err);
                self.send(BridgeMessage::error(BridgeError::from(err).to_string()))
                    .await;
                return;
            }
        };

        match message {
            ClientMessage::Ping => self.send(BridgeMessage::Pong).await,
            ClientMessage::Chat { payload } => self.start_chat(payload).await,
            ClientMessage::Unknown => {
                debug!("[{}] Ignoring unknown message type: {}", self.id, text);
            }
        }
    }

    async fn start_chat(&self, payload: ChatPayload) {
        if !transition(&self.chat, ChatState::AwaitingUpstream) {
            warn!("[{}] Chat request while a session is active", self.id);
            self.send(BridgeMessage::error(BridgeError::Busy.to_string()))
                .await;
            return;
        }

        info!(
            "[{}] Chat request with {} message(s)",
            self.id,
            payload.messages.len()
        );
        tokio::spawn(run_chat(
            self.id.clone(),
            self.state.clone(),
            payload,
            self.out.clone(),
            self.chat.clone(),
            self.cancel.clone(),
        ));
    }
}

/// Move to `next` if the state machine allows it.
fn transition(chat: &watch::Sender<ChatState>, next: ChatState) -> bool {
    chat.send_if_modified(|current| {
        if current.can_transition_to(next) {
            *current = next;
            true
        } else {
            false
        }
    })
}

async fn handle_socket(socket: WebSocket, state: BridgeState) {
    let conn_id = Uuid::new_v4().to_string();
    info!("[{}] Client connected", conn_id);

    let (mut sender, mut receiver) = socket.split();
    let (out, mut outbound) = mpsc::channel::<BridgeMessage>(state.config().outbound_buffer.max(1));

    // Single writer keeps outbound messages in order.
    let writer_id = conn_id.clone();
    let writer = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            let json = match serde_json::to_string(&message) {
                Ok(json) => json,
                Err(err) => {
                    error!("[{}] Failed to serialize message: {}", writer_id, err);
                    continue;
                }
            };
            if sender.send(Message::Text(json.into())).await.is_err() {
                debug!("[{}] Client send failed, stopping writer", writer_id);
                break;
            }
        }
    });

    let (chat, _) = watch::channel(ChatState::Idle);
    let conn = Connection {
        id: conn_id.clone(),
        state,
        out,
        chat: Arc::new(chat),
        cancel: CancellationToken::new(),
    };

    while let Some(frame) = receiver.next().await {
        match frame {
            Ok(Message::Text(text)) => conn.handle_text(text.as_str()).await,
            Ok(Message::Binary(data)) => match std::str::from_utf8(&data) {
                Ok(text) => conn.handle_text(text).await,
                Err(err) => {
                    warn!("[{}] Binary message is not UTF-8: {}", conn_id, err);
                    conn.send(BridgeMessage::error(BridgeError::from(err).to_string()))
                        .await;
                }
            },
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Ok(Message::Close(_)) => {
                debug!("[{}] Client sent close", conn_id);
                break;
            }
            Err(err) => {
                warn!("[{}] WebSocket error: {}", conn_id, err);
                break;
            }
        }
    }

    conn.cancel.cancel();
    writer.abort();
    info!(
        "[{}] Client disconnected (chat state: {:?})",
        conn_id,
        *conn.chat.borrow()
    );
}

enum ChatOutcome {
    Completed,
    ClientGone,
}

#[instrument(skip_all, fields(conn = %conn_id))]
async fn run_chat(
    conn_id: String,
    state: BridgeState,
    payload: ChatPayload,
    out: mpsc::Sender<BridgeMessage>,
    chat: Arc<watch::Sender<ChatState>>,
    cancel: CancellationToken,
) {
    let outcome = tokio::select! {
        _ = cancel.cancelled() => Ok(ChatOutcome::ClientGone),
        result = stream_chat(&conn_id, &state, &payload, &out, &chat) => result,
    };

    // State first, so a client reacting to `done` can start the next chat.
    match outcome {
        Ok(ChatOutcome::Completed) => {
            transition(&chat, ChatState::Done);
            debug!("[{}] Chat stream complete", conn_id);
            let _ = out.send(BridgeMessage::Done).await;
        }
        Ok(ChatOutcome::ClientGone) => {
            transition(&chat, ChatState::Cancelled);
            info!("[{}] Client gone, upstream stream released", conn_id);
        }
        Err(err) => {
            transition(&chat, ChatState::Error);
            warn!("[{}] Chat failed: {}", conn_id, err);
            let _ = out.send(BridgeMessage::error(err.to_string())).await;
        }
    }
}

/// POST the chat request and relay every SSE `data:` line as a message.
async fn stream_chat(
    conn_id: &str,
    state: &BridgeState,
    payload: &ChatPayload,
    out: &mpsc::Sender<BridgeMessage>,
    chat: &watch::Sender<ChatState>,
) -> Result<ChatOutcome, BridgeError> {
    let response = state
        .http
        .post(state.config().chat_url())
        .header(reqwest::header::ACCEPT, "text/event-stream")
        .json(&payload.upstream_body())
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        return Err(BridgeError::UpstreamStatus {
            status: status.as_u16(),
            reason: status.canonical_reason().unwrap_or("Unknown").to_string(),
        });
    }

    transition(chat, ChatState::Streaming);
    if out.send(BridgeMessage::Start).await.is_err() {
        return Ok(ChatOutcome::ClientGone);
    }

    let mut decoder = SseLineDecoder::new();
    let mut body = response.bytes_stream();
    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        if out.is_closed() {
            return Ok(ChatOutcome::ClientGone);
        }
        for line in decoder.feed(&chunk) {
            let Some(message) = BridgeMessage::from_sse_line(&line) else {
                continue;
            };
            if out.send(message).await.is_err() {
                return Ok(ChatOutcome::ClientGone);
            }
        }
    }

    if let Some(partial) = decoder.finish() {
        debug!(
            "[{}] Discarding unterminated SSE line ({} bytes)",
            conn_id,
            partial.len()
        );
    }
    Ok(ChatOutcome::Completed)
}
