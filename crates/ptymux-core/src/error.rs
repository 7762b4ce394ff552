use thiserror::Error;

/// Errors produced by the ptymux core and its adapters.
#[derive(Debug, Error)]
pub enum MuxError {
    #[error("codec error: {0}")]
    Codec(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("spawn failed: {0}")]
    Spawn(String),

    #[error("pty error: {0}")]
    Pty(String),

    #[error("session limit ({0}) reached")]
    SessionLimit(usize),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for MuxError {
    fn from(e: serde_json::Error) -> Self {
        MuxError::Codec(e.to_string())
    }
}

pub type MuxResult<T> = Result<T, MuxError>;
