//! Client transport tests against a live bridge.

use std::sync::Arc;
use std::time::Duration;

use axum::{Router, extract::ws::WebSocketUpgrade, response::Response, routing::any};
use bytes::BytesMut;
use ingress_gateway::TransportError;
use ingress_gateway::transport::{
    ChatTransport, HttpTransport, ResolveOn, RoutingTransport, TransportConfig, TransportRequest,
    WebSocketTransport,
};
use reqwest::StatusCode;
use reqwest::header;
use serde_json::json;
use tokio::net::TcpListener;

mod common;
use common::{MIXED_STREAM, TWO_FRAMES};

fn chat_request() -> TransportRequest {
    TransportRequest::post_json(
        "http://localhost/api/chat",
        &json!({ "id": "c1", "messages": [{ "role": "user", "parts": [] }] }),
    )
}

/// WebSocket server that accepts connections and never answers.
async fn spawn_silent_bridge() -> String {
    async fn silent(ws: WebSocketUpgrade) -> Response {
        ws.on_upgrade(|mut socket| async move { while socket.recv().await.is_some() {} })
    }

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, Router::new().route("/ws", any(silent)))
            .await
            .unwrap();
    });
    format!("ws://{addr}/ws")
}

/// The rebuilt SSE body is byte-identical to what the app server sent,
/// however the upstream reads were split.
#[tokio::test]
async fn test_sse_bytes_survive_the_round_trip() {
    let upstream = common::spawn_upstream().await;
    let bridge = common::spawn_bridge(common::bridge_config(&upstream, "/stream/api/chat")).await;
    let transport = WebSocketTransport::new(bridge.ws_url("/api/chat/ws"));

    let response = transport.send(chat_request()).await.unwrap();
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.headers[header::CONTENT_TYPE], "text/event-stream");
    assert_eq!(response.headers[header::CACHE_CONTROL], "no-cache");
    assert_eq!(response.headers[header::CONNECTION], "keep-alive");

    let body = response.bytes().await.unwrap();
    assert_eq!(body, MIXED_STREAM.as_bytes());
}

/// Waiting for `start` gives the same stream.
#[tokio::test]
async fn test_resolve_on_start_streams_chunks() {
    let upstream = common::spawn_upstream().await;
    let bridge = common::spawn_bridge(common::bridge_config(&upstream, "/api/chat")).await;
    let transport =
        WebSocketTransport::new(bridge.ws_url("/")).with_resolve_on(ResolveOn::Start);

    let mut response = transport.send(chat_request()).await.unwrap();
    let mut body = BytesMut::new();
    while let Some(chunk) = response.chunk().await {
        body.extend_from_slice(&chunk.unwrap());
    }
    assert_eq!(body.freeze(), TWO_FRAMES.as_bytes());
}

/// With the default policy an upstream failure surfaces as a stream error.
#[tokio::test]
async fn test_upstream_error_fails_the_stream() {
    let upstream = common::spawn_upstream().await;
    let bridge =
        common::spawn_bridge(common::bridge_config(&upstream, "/unavailable/api/chat")).await;
    let transport = WebSocketTransport::new(bridge.ws_url("/"));

    let response = transport.send(chat_request()).await.unwrap();
    match response.text().await {
        Err(TransportError::Remote(message)) => {
            assert_eq!(message, "HTTP 503: Service Unavailable")
        }
        other => panic!("expected remote error, got {other:?}"),
    }
}

/// Waiting for `start` turns an upstream failure into a call error.
#[tokio::test]
async fn test_upstream_error_fails_the_call_when_resolving_on_start() {
    let upstream = common::spawn_upstream().await;
    let bridge =
        common::spawn_bridge(common::bridge_config(&upstream, "/unavailable/api/chat")).await;
    let transport =
        WebSocketTransport::new(bridge.ws_url("/")).with_resolve_on(ResolveOn::Start);

    match transport.send(chat_request()).await {
        Err(TransportError::Remote(message)) => {
            assert_eq!(message, "HTTP 503: Service Unavailable")
        }
        other => panic!("expected remote error, got {other:?}"),
    }
}

/// A silent bridge times the stream out.
#[tokio::test]
async fn test_timeout_fails_the_stream() {
    let url = spawn_silent_bridge().await;
    let transport = WebSocketTransport::new(url).with_timeout(Duration::from_millis(300));

    let mut response = transport.send(chat_request()).await.unwrap();
    let chunk = tokio::time::timeout(Duration::from_secs(5), response.chunk())
        .await
        .expect("stream did not time out");
    assert!(matches!(chunk, Some(Err(TransportError::Timeout))));
    assert!(response.chunk().await.is_none());
}

#[tokio::test]
async fn test_timeout_fails_the_call_when_resolving_on_start() {
    let url = spawn_silent_bridge().await;
    let transport = WebSocketTransport::new(url)
        .with_timeout(Duration::from_millis(300))
        .with_resolve_on(ResolveOn::Start);

    let result = tokio::time::timeout(Duration::from_secs(5), transport.send(chat_request()))
        .await
        .expect("call did not time out");
    assert!(matches!(result, Err(TransportError::Timeout)));
}

/// Connecting to nothing is a connection error.
#[tokio::test]
async fn test_connect_failure() {
    let port = common::closed_port().await;
    let transport = WebSocketTransport::new(format!("ws://127.0.0.1:{port}/ws"));
    assert!(matches!(
        transport.send(chat_request()).await,
        Err(TransportError::Connect(_))
    ));
}

/// Dropping the response closes the socket, which stops the upstream read.
#[tokio::test]
async fn test_dropping_the_response_cancels_upstream() {
    let upstream = common::spawn_upstream().await;
    let bridge = common::spawn_bridge(common::bridge_config(&upstream, "/slow/api/chat")).await;
    let transport = WebSocketTransport::new(bridge.ws_url("/"));

    let mut response = transport.send(chat_request()).await.unwrap();
    let first = response.chunk().await.unwrap().unwrap();
    assert_eq!(first, "data: {\"n\":0}\n\n".as_bytes());
    drop(response);

    assert!(upstream.recorded.wait_for_slow_stream_drop().await);
}

/// Chat posts go over the WebSocket, everything else over HTTP.
#[tokio::test]
async fn test_routing_transport_splits_traffic() {
    let upstream = common::spawn_upstream().await;
    let bridge = common::spawn_bridge(common::bridge_config(&upstream, "/api/chat")).await;

    let transport = RoutingTransport::new(
        Arc::new(WebSocketTransport::new(bridge.ws_url("/api/chat/ws"))),
        Arc::new(HttpTransport::new(common::http_client())),
        "/api/chat",
    );

    let chat = transport
        .send(TransportRequest::post_json(
            format!("{}/api/chat", upstream.url()),
            &json!({ "messages": [] }),
        ))
        .await
        .unwrap();
    assert_eq!(chat.text().await.unwrap(), TWO_FRAMES);

    let data = transport
        .send(TransportRequest::get(format!("{}/data.json", upstream.url())))
        .await
        .unwrap();
    assert_eq!(data.status, StatusCode::OK);
    assert_eq!(
        data.text().await.unwrap(),
        r#"{"href":"/not-html","items":[1,2,3]}"#
    );

    // The chat went through the bridge exactly once.
    assert_eq!(upstream.recorded.chat_bodies().len(), 1);
}

/// A client on an ingress page reaches the bridge below the same prefix.
#[tokio::test]
async fn test_routing_transport_for_ingress_page() {
    let upstream = common::spawn_upstream().await;
    let bridge = common::spawn_bridge(common::bridge_config(&upstream, "/api/chat")).await;
    let page = bridge.http_url("/api/hassio_ingress/tok/chat");

    let transport = RoutingTransport::for_page(&page, &TransportConfig::default()).unwrap();
    let response = transport
        .send(TransportRequest::post_json(
            bridge.http_url("/api/hassio_ingress/tok/api/chat"),
            &json!({ "messages": [] }),
        ))
        .await
        .unwrap();
    assert_eq!(response.text().await.unwrap(), TWO_FRAMES);
}
