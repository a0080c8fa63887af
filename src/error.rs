use thiserror::Error;

/// Crate-wide error type, one variant family per component.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WAL error: {0}")]
    Wal(String),

    #[error("offset error: {0}")]
    Offset(String),

    #[error("block store error: {0}")]
    BlockStore(String),

    #[error("state store error: {0}")]
    StateStore(String),

    #[error("receiver tracker error: {0}")]
    Receiver(String),

    #[error("sink error: {0}")]
    Sink(String),

    #[error("source error: {0}")]
    Source(String),

    #[error("query execution error: {0}")]
    Query(Box<crate::streaming::QueryException>),

    #[error("serialization error: {0}")]
    Serialization(String),

    /// A contract violation that indicates a caller bug, not a
    /// transient condition. Never retried internally.
    #[error("programming error: {0}")]
    Programming(String),
}

impl From<bincode::error::EncodeError> for CoreError {
    fn from(e: bincode::error::EncodeError) -> Self {
        CoreError::Serialization(e.to_string())
    }
}

impl From<bincode::error::DecodeError> for CoreError {
    fn from(e: bincode::error::DecodeError) -> Self {
        CoreError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
