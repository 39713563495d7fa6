//! Incremental SSE line decoding and `data:` frame encoding.
//!
//! Upstream bodies arrive in arbitrary chunks. A chunk may end in the middle
//! of a line or in the middle of a multi-byte UTF-8 character, so bytes are
//! buffered until a `\n` completes the line and only then decoded. `\n` never
//! occurs inside a multi-byte sequence, which makes per-line decoding
//! equivalent to decoding the whole stream at once.

/// Prefix of an SSE data line as emitted by the chat endpoint.
pub const DATA_PREFIX: &str = "data: ";

/// Splits a byte stream into complete SSE lines.
#[derive(Debug, Default)]
pub struct SseLineDecoder {
    pending: Vec<u8>,
}

impl SseLineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the next chunk and return every line it completed, in order.
    ///
    /// The trailing partial line stays buffered and is prefixed onto the next
    /// chunk.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        let mut rest = chunk;
        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            self.pending.extend_from_slice(&rest[..pos]);
            lines.push(decode_line(&self.pending));
            self.pending.clear();
            rest = &rest[pos + 1..];
        }
        self.pending.extend_from_slice(rest);
        lines
    }

    /// Number of bytes waiting for a line terminator.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Take whatever partial line is left once the stream has ended.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let line = decode_line(&self.pending);
        self.pending.clear();
        Some(line)
    }
}

fn decode_line(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

/// Payload of a `data: ` line, or `None` for other lines and blank payloads.
pub fn data_payload(line: &str) -> Option<&str> {
    line.strip_prefix(DATA_PREFIX)
        .filter(|data| !data.trim().is_empty())
}

/// Encode a payload as one SSE event.
pub fn encode_data_frame(payload: &str) -> String {
    format!("{DATA_PREFIX}{payload}\n\n")
}
