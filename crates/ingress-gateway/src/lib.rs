//! Ingress-compatible streaming gateway.
//!
//! Two services sit in front of an app server that is published below a
//! runtime-assigned ingress path:
//!
//! - [`proxy`]: reverse proxy that rewrites root-relative URLs in HTML so the
//!   app works below the prefix, and passes everything else through.
//! - [`bridge`]: WebSocket endpoint that performs streaming chat requests and
//!   relays the SSE frames as individual messages, because the ingress buffers
//!   chunked responses.
//!
//! [`transport`] is the client half of the bridge protocol.

pub mod bridge;
pub mod config;
pub mod error;
pub mod proxy;
pub mod rewrite;
pub mod transport;

pub use config::{AppConfig, BridgeConfig, ProxyConfig};
pub use error::{BridgeError, ProxyError, TransportError};
pub use transport::{
    ChatTransport, HttpTransport, ResolveOn, RoutingTransport, StreamingResponse,
    TransportRequest, WebSocketTransport,
};
