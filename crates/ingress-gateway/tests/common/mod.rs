//! Test utilities: a fake app server and helpers that run the gateway
//! services on ephemeral ports.
#![allow(dead_code)]

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    Json, Router,
    body::{Body, Bytes},
    extract::{
        State,
        ws::{Message as AxumMessage, WebSocket, WebSocketUpgrade},
    },
    http::{HeaderMap, StatusCode, header},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
};
use futures::{SinkExt, StreamExt, stream};
use ingress_gateway::config::{BridgeConfig, ProxyConfig};
use ingress_gateway::{bridge, proxy};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, tungstenite::Message};
use tokio_util::sync::CancellationToken;

pub type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const INGRESS: &str = "/api/hassio_ingress/abc";

pub const PAGE: &str = r#"<html><head><link href="/a.css"></head><body><script src="/_next/x.js"></script></body></html>"#;

pub const PAGE_REWRITTEN: &str = concat!(
    r#"<html><head><base href="/api/hassio_ingress/abc/"><link href="/api/hassio_ingress/abc/a.css"></head>"#,
    r#"<body><script src="/api/hassio_ingress/abc/_next/x.js"></script></body></html>"#
);

/// Two text deltas, as served by `POST /api/chat`.
pub const TWO_FRAMES: &str = concat!(
    "data: {\"type\":\"text-delta\",\"delta\":\"Hal\"}\n\n",
    "data: {\"type\":\"text-delta\",\"delta\":\"lo\"}\n\n",
);

/// Served by `POST /stream/api/chat` in awkwardly split pieces.
pub const MIXED_STREAM: &str = concat!(
    "data: {\"type\":\"start\",\"messageId\":\"m1\"}\n\n",
    "data: {\"type\":\"text-delta\",\"id\":\"0\",\"delta\":\"Grüße \"}\n\n",
    "data: {\"type\":\"text-delta\",\"id\":\"0\",\"delta\":\"aus der Küche 🍲\"}\n\n",
    "data: {\"type\":\"finish\",\"usage\":{\"tokens\":[1,2,3]},\"ok\":true,\"n\":null}\n\n",
    "data: [DONE]\n\n",
);

/// Everything the fake app server observed.
#[derive(Clone, Default)]
pub struct Recorded {
    pub chat_bodies: Arc<Mutex<Vec<Value>>>,
    pub chat_accept: Arc<Mutex<Vec<String>>>,
    pub slow_stream_dropped: Arc<AtomicBool>,
}

impl Recorded {
    pub fn chat_bodies(&self) -> Vec<Value> {
        self.chat_bodies.lock().unwrap().clone()
    }

    pub fn chat_accept(&self) -> Vec<String> {
        self.chat_accept.lock().unwrap().clone()
    }

    /// Wait until the slow chat stream's body has been dropped by the server.
    pub async fn wait_for_slow_stream_drop(&self) -> bool {
        for _ in 0..250 {
            if self.slow_stream_dropped.load(Ordering::SeqCst) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }
}

pub struct FakeUpstream {
    pub addr: SocketAddr,
    pub recorded: Recorded,
    shutdown: CancellationToken,
}

impl FakeUpstream {
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }
}

impl Drop for FakeUpstream {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Sets the flag when dropped, i.e. when the server stops reading the stream.
struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

fn record_chat(recorded: &Recorded, headers: &HeaderMap, body: Value) {
    let accept = headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    recorded.chat_accept.lock().unwrap().push(accept);
    recorded.chat_bodies.lock().unwrap().push(body);
}

fn sse(body: Body) -> Response {
    (
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        body,
    )
        .into_response()
}

async fn chat(
    State(recorded): State<Recorded>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    record_chat(&recorded, &headers, body);
    sse(Body::from(TWO_FRAMES))
}

async fn chat_unavailable(
    State(recorded): State<Recorded>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    record_chat(&recorded, &headers, body);
    (StatusCode::SERVICE_UNAVAILABLE, "model offline").into_response()
}

/// `MIXED_STREAM` cut mid-line and mid-character, with pauses so the pieces
/// arrive as separate reads.
async fn chat_split(
    State(recorded): State<Recorded>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    record_chat(&recorded, &headers, body);
    let bytes = MIXED_STREAM.as_bytes();
    let emoji = MIXED_STREAM.find('🍲').unwrap();
    let umlaut = MIXED_STREAM.find('ü').unwrap();
    let cuts = [7, umlaut + 1, emoji + 2, emoji + 3, bytes.len() - 3];

    let mut pieces = Vec::new();
    let mut start = 0;
    for cut in cuts {
        pieces.push(Bytes::copy_from_slice(&bytes[start..cut]));
        start = cut;
    }
    pieces.push(Bytes::copy_from_slice(&bytes[start..]));

    let stream = stream::iter(pieces).then(|piece| async move {
        tokio::time::sleep(Duration::from_millis(15)).await;
        Ok::<_, Infallible>(piece)
    });
    sse(Body::from_stream(stream))
}

/// Never-ending stream, one frame every 20ms.
async fn chat_slow(
    State(recorded): State<Recorded>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    record_chat(&recorded, &headers, body);
    let flag = DropFlag(recorded.slow_stream_dropped.clone());
    let stream = stream::unfold((flag, 0u64), |(flag, n)| async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        let frame = Bytes::from(format!("data: {{\"n\":{n}}}\n\n"));
        Some((Ok::<_, Infallible>(frame), (flag, n + 1)))
    });
    sse(Body::from_stream(stream))
}

async fn page() -> Html<&'static str> {
    Html(PAGE)
}

/// Same page without a content-length, so it is sent chunked.
async fn page_chunked() -> Response {
    let halves = [&PAGE[..20], &PAGE[20..]]
        .map(|s| Ok::<_, Infallible>(Bytes::from_static(s.as_bytes())));
    (
        [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
        Body::from_stream(stream::iter(halves)),
    )
        .into_response()
}

async fn page_gzip() -> Response {
    (
        [
            (header::CONTENT_TYPE, "text/html"),
            (header::CONTENT_ENCODING, "gzip"),
        ],
        PAGE,
    )
        .into_response()
}

async fn data() -> Json<Value> {
    Json(serde_json::json!({ "href": "/not-html", "items": [1, 2, 3] }))
}

async fn echo_host(headers: HeaderMap) -> String {
    headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

async fn echo_body(body: Bytes) -> Bytes {
    body
}

async fn echo_ws(ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(|mut socket: WebSocket| async move {
        while let Some(Ok(msg)) = socket.recv().await {
            match msg {
                AxumMessage::Text(text) => {
                    if socket.send(AxumMessage::Text(text)).await.is_err() {
                        break;
                    }
                }
                AxumMessage::Close(_) => break,
                _ => {}
            }
        }
    })
}

pub async fn spawn_upstream() -> FakeUpstream {
    let recorded = Recorded::default();
    let app = Router::new()
        .route("/", get(page))
        .route("/chunked", get(page_chunked))
        .route("/gzip", get(page_gzip))
        .route("/data.json", get(data))
        .route("/echo-host", get(echo_host))
        .route("/echo", post(echo_body))
        .route("/ws", get(echo_ws))
        .route("/api/chat", post(chat))
        .route("/unavailable/api/chat", post(chat_unavailable))
        .route("/stream/api/chat", post(chat_split))
        .route("/slow/api/chat", post(chat_slow))
        .with_state(recorded.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(token.cancelled_owned())
            .await
            .unwrap();
    });

    FakeUpstream {
        addr,
        recorded,
        shutdown,
    }
}

/// A port nothing listens on.
pub async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

pub fn proxy_config(upstream_port: u16) -> ProxyConfig {
    ProxyConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        upstream_host: "127.0.0.1".to_string(),
        upstream_port,
        retry_delay_ms: 50,
        ..ProxyConfig::default()
    }
}

pub fn bridge_config(upstream: &FakeUpstream, chat_path: &str) -> BridgeConfig {
    BridgeConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        upstream_url: upstream.url(),
        chat_path: chat_path.to_string(),
        ..BridgeConfig::default()
    }
}

/// A running service; stopped when dropped.
pub struct Service {
    pub addr: SocketAddr,
    shutdown: CancellationToken,
}

impl Service {
    pub fn http_url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn ws_url(&self, path: &str) -> String {
        format!("ws://{}{}", self.addr, path)
    }
}

impl Drop for Service {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

pub async fn spawn_proxy(config: ProxyConfig) -> Service {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    tokio::spawn(proxy::serve_listener(listener, config, shutdown.clone()));
    Service { addr, shutdown }
}

pub async fn spawn_bridge(config: BridgeConfig) -> Service {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    tokio::spawn(bridge::serve_listener(listener, config, shutdown.clone()));
    Service { addr, shutdown }
}

pub fn http_client() -> reqwest::Client {
    reqwest::Client::builder().no_proxy().build().unwrap()
}

pub async fn connect(url: &str) -> WsClient {
    let (ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    ws
}

pub async fn send_json(ws: &mut WsClient, value: Value) {
    ws.send(Message::Text(value.to_string().into())).await.unwrap();
}

pub async fn send_text(ws: &mut WsClient, text: &str) {
    ws.send(Message::Text(text.to_string().into())).await.unwrap();
}

pub async fn send_binary(ws: &mut WsClient, data: &[u8]) {
    ws.send(Message::Binary(data.to_vec().into())).await.unwrap();
}

/// Next JSON text message, skipping control frames.
pub async fn recv_json(ws: &mut WsClient) -> Value {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for a message")
            .expect("socket closed")
            .expect("socket error");
        match frame {
            Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
            Message::Close(frame) => panic!("socket closed: {frame:?}"),
            _ => continue,
        }
    }
}

/// Read messages until one of type `kind` arrives; returns it.
pub async fn recv_until(ws: &mut WsClient, kind: &str) -> Value {
    loop {
        let message = recv_json(ws).await;
        if message["type"] == kind {
            return message;
        }
    }
}

pub fn chat_message(text: &str) -> Value {
    serde_json::json!({
        "type": "chat",
        "payload": {
            "messages": [{ "role": "user", "parts": [{ "type": "text", "text": text }] }]
        }
    })
}
