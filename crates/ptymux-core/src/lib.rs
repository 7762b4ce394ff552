//! ptymux-core: Shared protocol library for ptymux.
//!
//! Provides the JSON boundary events exchanged between the server and its
//! browser clients, the text-frame codec, a streaming UTF-8 decoder for PTY
//! output, and the common error type.

pub mod codec;
pub mod error;
pub mod messages;

// Re-export commonly used items at crate root.
pub use codec::{decode_client, encode_server, Utf8Stream};
pub use error::{MuxError, MuxResult};
pub use messages::{ClientMessage, ServerMessage, SessionSummary};
