//! JSON text-frame codec for the ptymux boundary events.
//!
//! Wire format: one WebSocket text frame = one JSON object (see [`messages`]).
//!
//! [`messages`]: crate::messages

use crate::error::{MuxError, MuxResult};
use crate::messages::{ClientMessage, ServerMessage};

/// Largest client frame accepted (1 MiB). Keystroke traffic is tiny; anything
/// bigger is a misbehaving client.
pub const MAX_FRAME_SIZE: usize = 1_048_576;

/// Encode a server event into a text frame.
pub fn encode_server(msg: &ServerMessage) -> MuxResult<String> {
    Ok(serde_json::to_string(msg)?)
}

/// Decode a client text frame into a typed event.
pub fn decode_client(frame: &str) -> MuxResult<ClientMessage> {
    if frame.len() > MAX_FRAME_SIZE {
        return Err(MuxError::InvalidMessage(format!(
            "frame too large: {} bytes (max {})",
            frame.len(),
            MAX_FRAME_SIZE
        )));
    }
    Ok(serde_json::from_str(frame)?)
}

/// Incremental UTF-8 decoder for PTY output.
///
/// PTY reads split the byte stream at arbitrary points, so a multi-byte
/// character may straddle two reads. The trailing incomplete sequence is held
/// back until the next push; invalid sequences become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Stream {
    pending: Vec<u8>,
}

impl Utf8Stream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes and return every complete character decoded so far.
    pub fn push(&mut self, data: &[u8]) -> String {
        let mut input = std::mem::take(&mut self.pending);
        input.extend_from_slice(data);

        let mut out = String::with_capacity(input.len());
        let mut rest = &input[..];
        loop {
            match std::str::from_utf8(rest) {
                Ok(s) => {
                    out.push_str(s);
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    out.push_str(std::str::from_utf8(valid).unwrap_or_default());
                    match e.error_len() {
                        Some(n) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[n..];
                        }
                        None => {
                            self.pending = after.to_vec();
                            break;
                        }
                    }
                }
            }
        }
        out
    }

    /// Bytes held back waiting for the rest of a character.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}
