//! Error types for the concept storage engine

use std::io;
use thiserror::Error;

/// Why a two-phase commit was aborted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnAbortReason {
    /// The transaction exceeded its timeout
    Timeout,
    /// A participant voted NO during prepare
    ParticipantRefused,
    /// A participant could not be reached
    Network,
}

impl std::fmt::Display for TxnAbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout => write!(f, "timeout"),
            Self::ParticipantRefused => write!(f, "participant refused"),
            Self::Network => write!(f, "network"),
        }
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("concept not found")]
    NotFound,

    #[error("already exists")]
    AlreadyExists,

    #[error("vector dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("corrupt storage: {0}")]
    Corrupt(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("deadline elapsed")]
    Timeout,

    #[error("transaction aborted: {0}")]
    TxnAborted(TxnAbortReason),

    #[error("capacity exceeded: {0}")]
    Capacity(String),

    #[error("store is read-only")]
    ReadOnly,

    #[error("store has in-flight operations")]
    InUse,
}

pub type Result<T> = std::result::Result<T, StoreError>;

impl From<rmp_serde::encode::Error> for StoreError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        StoreError::Corrupt(format!("WAL encode: {}", e))
    }
}

impl From<rmp_serde::decode::Error> for StoreError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        StoreError::Corrupt(format!("WAL decode: {}", e))
    }
}
