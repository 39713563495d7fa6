//! Client-side chat transports.
//!
//! Chat clients expect a streaming HTTP response carrying SSE frames. Behind
//! the ingress that response would arrive in one piece, so
//! [`WebSocketTransport`] talks to the bridge instead and rebuilds the SSE
//! byte stream from its messages. [`RoutingTransport`] sends chat requests
//! that way and everything else through plain HTTP.

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::{self, BoxStream};
use futures::{SinkExt, StreamExt};
use ingress_protocol::{BridgeMessage, ChatPayload, ClientMessage};
use log::{debug, info, warn};
use regex::Regex;
use reqwest::header::{CACHE_CONTROL, CONNECTION, CONTENT_TYPE, HeaderMap, HeaderValue};
use reqwest::{Method, StatusCode, Url};
use tokio::sync::mpsc;
use tokio::time::{Instant, timeout_at};
use tokio_stream::wrappers::ReceiverStream;
use tokio_tungstenite::tungstenite::Message;

use crate::error::TransportError;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// URL pattern of requests that go over the WebSocket.
pub const DEFAULT_CHAT_PATTERN: &str = "/api/chat";

/// Bridge endpoint below the page's ingress prefix.
pub const DEFAULT_WS_ENDPOINT: &str = "/api/chat/ws";

static INGRESS_PREFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(/api/hassio_ingress/[^/]+)").expect("ingress prefix pattern is valid")
});

pub type ByteStream = BoxStream<'static, Result<Bytes, TransportError>>;

/// An outgoing request, as a chat client would hand it to `fetch`.
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

impl TransportRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            url: url.into(),
            headers: HeaderMap::new(),
            body: None,
        }
    }

    pub fn post_json(url: impl Into<String>, body: &serde_json::Value) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Self {
            method: Method::POST,
            url: url.into(),
            headers,
            body: Some(Bytes::from(body.to_string())),
        }
    }
}

/// Status, headers and a body that arrives incrementally.
pub struct StreamingResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    body: ByteStream,
}

impl std::fmt::Debug for StreamingResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

impl StreamingResponse {
    pub fn new(status: StatusCode, headers: HeaderMap, body: ByteStream) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    /// Next body chunk, `None` once the stream has ended.
    pub async fn chunk(&mut self) -> Option<Result<Bytes, TransportError>> {
        self.body.next().await
    }

    pub fn into_body(self) -> ByteStream {
        self.body
    }

    /// Read the rest of the body.
    pub async fn bytes(mut self) -> Result<Bytes, TransportError> {
        let mut buf = BytesMut::new();
        while let Some(chunk) = self.body.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf.freeze())
    }

    pub async fn text(self) -> Result<String, TransportError> {
        let bytes = self.bytes().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

/// Something that can turn a request into a streaming response.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn send(&self, request: TransportRequest) -> Result<StreamingResponse, TransportError>;
}

// ============================================================================
// HTTP
// ============================================================================

/// Plain network fetch.
#[derive(Debug, Clone, Default)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ChatTransport for HttpTransport {
    async fn send(&self, request: TransportRequest) -> Result<StreamingResponse, TransportError> {
        let mut builder = self
            .client
            .request(request.method, &request.url)
            .headers(request.headers);
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(TransportError::from))
            .boxed();
        Ok(StreamingResponse::new(status, headers, body))
    }
}

// ============================================================================
// WebSocket
// ============================================================================

/// When a WebSocket call hands its response back to the caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ResolveOn {
    /// As soon as the socket is open and the request is sent. The caller can
    /// read right away; an upstream failure shows up as a stream error.
    #[default]
    Open,
    /// Once the bridge acknowledged the upstream response with `start`. An
    /// upstream failure fails the call itself.
    Start,
}

/// Sends one chat request per socket and rebuilds the SSE stream.
#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    url: String,
    timeout: Duration,
    resolve_on: ResolveOn,
}

impl WebSocketTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            timeout: DEFAULT_TIMEOUT,
            resolve_on: ResolveOn::default(),
        }
    }

    /// Ceiling for the whole exchange, measured from the call.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_resolve_on(mut self, resolve_on: ResolveOn) -> Self {
        self.resolve_on = resolve_on;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

/// What a bridge frame means for the response stream.
#[derive(Debug)]
enum Step {
    Started,
    Emit(Bytes),
    Finish,
    Fail(TransportError),
    Ignore,
}

fn decode_frame(frame: Message) -> Step {
    let text = match frame {
        Message::Text(text) => text,
        Message::Close(_) => return Step::Finish,
        _ => return Step::Ignore,
    };

    match serde_json::from_str::<BridgeMessage>(text.as_str()) {
        Ok(BridgeMessage::Start) => Step::Started,
        Ok(message @ (BridgeMessage::Chunk { .. } | BridgeMessage::Raw { .. })) => message
            .to_sse_frame()
            .map_or(Step::Ignore, |frame| Step::Emit(Bytes::from(frame))),
        Ok(BridgeMessage::Done) => Step::Finish,
        Ok(BridgeMessage::Error { error }) => Step::Fail(TransportError::Remote(error)),
        Ok(BridgeMessage::Pong) => Step::Ignore,
        Ok(BridgeMessage::Unknown) => {
            debug!("Ignoring unknown bridge message: {}", text.as_str());
            Step::Ignore
        }
        Err(err) => {
            warn!("Ignoring unparseable bridge frame: {}", err);
            Step::Ignore
        }
    }
}

fn sse_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
    headers
}

#[async_trait]
impl ChatTransport for WebSocketTransport {
    async fn send(&self, request: TransportRequest) -> Result<StreamingResponse, TransportError> {
        let deadline = Instant::now() + self.timeout;
        let payload: ChatPayload =
            serde_json::from_slice(request.body.as_deref().unwrap_or_default())?;

        debug!("Connecting to {}", self.url);
        let (socket, _) = timeout_at(deadline, tokio_tungstenite::connect_async(self.url.as_str()))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(TransportError::Connect)?;
        let (mut sink, mut source) = socket.split();

        let chat = serde_json::to_string(&ClientMessage::Chat { payload })?;
        sink.send(Message::Text(chat.into())).await?;

        // Frames that arrived while waiting for `start`.
        let mut early = Vec::new();
        if self.resolve_on == ResolveOn::Start {
            loop {
                let frame = match timeout_at(deadline, source.next()).await {
                    Ok(frame) => frame,
                    Err(_) => {
                        let _ = sink.close().await;
                        return Err(TransportError::Timeout);
                    }
                };
                match frame {
                    None => return Err(TransportError::Closed),
                    Some(Err(err)) => return Err(TransportError::Socket(err)),
                    Some(Ok(frame)) => match decode_frame(frame) {
                        Step::Started => break,
                        Step::Emit(bytes) => early.push(Ok(bytes)),
                        Step::Finish => {
                            let _ = sink.close().await;
                            let body = stream::iter(early).boxed();
                            return Ok(StreamingResponse::new(StatusCode::OK, sse_headers(), body));
                        }
                        Step::Fail(err) => {
                            let _ = sink.close().await;
                            return Err(err);
                        }
                        Step::Ignore => {}
                    },
                }
            }
        }

        let (tx, rx) = mpsc::channel(32);
        let url = self.url.clone();
        tokio::spawn(async move {
            let failure = loop {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => {
                        info!("Chat request to {} timed out, closing socket", url);
                        break Some(TransportError::Timeout);
                    }
                    _ = tx.closed() => {
                        debug!("Response dropped, closing socket to {}", url);
                        break None;
                    }
                    frame = source.next() => match frame {
                        None => break None,
                        Some(Err(err)) => break Some(TransportError::Socket(err)),
                        Some(Ok(frame)) => match decode_frame(frame) {
                            Step::Emit(bytes) => {
                                if tx.send(Ok(bytes)).await.is_err() {
                                    break None;
                                }
                            }
                            Step::Finish => break None,
                            Step::Fail(err) => break Some(err),
                            Step::Started | Step::Ignore => {}
                        },
                    },
                }
            };

            // Close before reporting so the socket is gone once the caller sees the error.
            let _ = sink.close().await;
            if let Some(err) = failure {
                let _ = tx.send(Err(err)).await;
            }
        });

        let body = stream::iter(early)
            .chain(ReceiverStream::new(rx))
            .boxed();
        Ok(StreamingResponse::new(StatusCode::OK, sse_headers(), body))
    }
}

// ============================================================================
// Routing
// ============================================================================

#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Bridge endpoint path, appended to the page's ingress prefix.
    pub ws_endpoint: String,
    /// Requests whose URL path contains this go over the WebSocket.
    pub chat_pattern: String,
    pub timeout: Duration,
    pub resolve_on: ResolveOn,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            ws_endpoint: DEFAULT_WS_ENDPOINT.to_string(),
            chat_pattern: DEFAULT_CHAT_PATTERN.to_string(),
            timeout: DEFAULT_TIMEOUT,
            resolve_on: ResolveOn::default(),
        }
    }
}

/// Sends `POST` chat requests over the WebSocket and everything else over HTTP.
#[derive(Clone)]
pub struct RoutingTransport {
    chat: Arc<dyn ChatTransport>,
    fallback: Arc<dyn ChatTransport>,
    chat_pattern: String,
}

impl RoutingTransport {
    pub fn new(
        chat: Arc<dyn ChatTransport>,
        fallback: Arc<dyn ChatTransport>,
        chat_pattern: impl Into<String>,
    ) -> Self {
        Self {
            chat,
            fallback,
            chat_pattern: chat_pattern.into(),
        }
    }

    /// Transports for a client running on `page_url`.
    pub fn for_page(page_url: &str, config: &TransportConfig) -> Result<Self, TransportError> {
        let ws = WebSocketTransport::new(websocket_url(page_url, &config.ws_endpoint)?)
            .with_timeout(config.timeout)
            .with_resolve_on(config.resolve_on);
        Ok(Self::new(
            Arc::new(ws),
            Arc::new(HttpTransport::default()),
            config.chat_pattern.clone(),
        ))
    }

    pub fn is_chat_request(&self, request: &TransportRequest) -> bool {
        request.method == Method::POST && url_path(&request.url).contains(&self.chat_pattern)
    }
}

#[async_trait]
impl ChatTransport for RoutingTransport {
    async fn send(&self, request: TransportRequest) -> Result<StreamingResponse, TransportError> {
        if self.is_chat_request(&request) {
            self.chat.send(request).await
        } else {
            self.fallback.send(request).await
        }
    }
}

fn url_path(url: &str) -> &str {
    if let Some(after_scheme) = url.split_once("://").map(|(_, rest)| rest) {
        let path = after_scheme
            .find('/')
            .map_or("", |start| &after_scheme[start..]);
        return path.split(['?', '#']).next().unwrap_or(path);
    }
    url.split(['?', '#']).next().unwrap_or(url)
}

/// The `/api/hassio_ingress/{token}` part of a page path, if any.
pub fn ingress_prefix(path: &str) -> Option<&str> {
    INGRESS_PREFIX
        .captures(path)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

/// WebSocket URL of `endpoint` as seen from `page_url`: same host and port,
/// `ws`/`wss` matching the page scheme, below the page's ingress prefix.
pub fn websocket_url(page_url: &str, endpoint: &str) -> Result<String, TransportError> {
    let url = Url::parse(page_url)
        .map_err(|err| TransportError::InvalidUrl(format!("{page_url}: {err}")))?;
    let scheme = match url.scheme() {
        "https" => "wss",
        "http" => "ws",
        other => {
            return Err(TransportError::InvalidUrl(format!(
                "{page_url}: unsupported scheme {other}"
            )));
        }
    };
    let host = url
        .host_str()
        .ok_or_else(|| TransportError::InvalidUrl(format!("{page_url}: missing host")))?;
    let authority = match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };
    let prefix = ingress_prefix(url.path()).unwrap_or("");
    let endpoint = endpoint.trim_start_matches('/');
    Ok(format!("{scheme}://{authority}{prefix}/{endpoint}"))
}
