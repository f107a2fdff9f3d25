use thiserror::Error;

use crate::log::{LogIndex, ServerId, Term};

#[derive(Error, Debug)]
pub enum RaftError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt record: {0}")]
    Corruption(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("not the leader (known leader: {leader_hint:?})")]
    NotLeader { leader_hint: Option<ServerId> },

    #[error("stale term: observed {observed}, local term is {local}")]
    StaleTerm { observed: Term, local: Term },

    #[error("log mismatch, responder last log index {last_log_index}")]
    LogMismatch { last_log_index: LogIndex },

    #[error("quorum not reached before the deadline")]
    QuorumTimeout,

    #[error("a snapshot operation is already in progress")]
    SnapshotBusy,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("node is shutting down")]
    Shutdown,
}

pub type Result<T> = std::result::Result<T, RaftError>;

// Error conversions for common error types

impl From<bincode::error::EncodeError> for RaftError {
    fn from(e: bincode::error::EncodeError) -> Self {
        RaftError::Serialization(e.to_string())
    }
}

impl From<bincode::error::DecodeError> for RaftError {
    fn from(e: bincode::error::DecodeError) -> Self {
        RaftError::Serialization(e.to_string())
    }
}
