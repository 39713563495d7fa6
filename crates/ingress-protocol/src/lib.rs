//! Wire protocol for tunnelling chat token streams through a WebSocket.
//!
//! The hosting platform's ingress compresses plain HTTP responses, which buffers
//! server-sent events until the stream ends. WebSocket frames pass through it
//! untouched, so chat streams are re-framed:
//!
//! ```text
//! Chat client <--[WS: ClientMessage / BridgeMessage]--> Bridge <--[HTTP POST, SSE]--> App server
//! ```
//!
//! This crate holds the pieces both ends of that WebSocket agree on:
//!
//! - [`ClientMessage`] and [`BridgeMessage`], the JSON text frames.
//! - [`sse`], the incremental line decoder for the upstream byte stream and the
//!   `data: ...` frame encoder used to rebuild it on the client side.

pub mod messages;
pub mod sse;

pub use messages::{BridgeMessage, ChatPayload, ClientMessage};
pub use sse::SseLineDecoder;
