//! Session management: PTY lifecycle, naming, scrollback.

pub mod manager;
pub mod pty;
pub mod ring_buffer;

pub use manager::{RegistrySettings, Session, SessionRegistry, SessionState};
pub use pty::{NativePtySpawner, PtyProcess, PtySpawner, SpawnRequest};
pub use ring_buffer::ScrollbackBuffer;
