use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;
use tokio_tungstenite::tungstenite;

use crate::proxy;

/// Failures while forwarding a request through the reverse proxy.
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("upstream unavailable after {attempts} attempt(s): {source}")]
    Upstream {
        attempts: u32,
        #[source]
        source: hyper_util::client::legacy::Error,
    },

    #[error("failed to read upstream body: {0}")]
    Body(#[from] hyper::Error),

    #[error("upstream HTML is not valid UTF-8: {0}")]
    NotUtf8(#[from] std::string::FromUtf8Error),

    #[error("invalid upstream URI: {0}")]
    InvalidUri(#[from] axum::http::uri::InvalidUri),

    #[error("invalid header value: {0}")]
    InvalidHeader(#[from] axum::http::header::InvalidHeaderValue),
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    code: &'static str,
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let code = match &self {
            ProxyError::Upstream { .. } => return proxy::fallback_response(),
            ProxyError::Body(_) => "UPSTREAM_BODY",
            ProxyError::NotUtf8(_) => "REWRITE_FAILED",
            ProxyError::InvalidUri(_) => "INVALID_URI",
            ProxyError::InvalidHeader(_) => "INVALID_HEADER",
        };

        let body = ErrorResponse {
            error: self.to_string(),
            code,
        };

        (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
    }
}

/// Failures of a bridged chat session. Each is reported to the client as one
/// `error` message; the WebSocket stays open.
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("{0}")]
    InvalidMessage(#[from] serde_json::Error),

    #[error("message is not valid UTF-8: {0}")]
    NotUtf8(#[from] std::str::Utf8Error),

    #[error("HTTP {status}: {reason}")]
    UpstreamStatus { status: u16, reason: String },

    #[error("{0}")]
    Upstream(#[from] reqwest::Error),

    #[error("chat request already in progress")]
    Busy,
}

/// Failures of a client-side chat transport call or its response stream.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("WebSocket connection failed: {0}")]
    Connect(#[source] tungstenite::Error),

    #[error("WebSocket error: {0}")]
    Socket(#[from] tungstenite::Error),

    #[error("request body is not a chat payload: {0}")]
    InvalidBody(#[from] serde_json::Error),

    #[error("{0}")]
    Remote(String),

    #[error("WebSocket request timeout")]
    Timeout,

    #[error("WebSocket closed before the chat stream started")]
    Closed,

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
}
