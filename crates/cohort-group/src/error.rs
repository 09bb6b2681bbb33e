//! Group error types

use thiserror::Error;

use cohort_core::types::MemberId;

/// Result type for group operations
pub type GroupResult<T> = Result<T, GroupError>;

/// Group-related errors
#[derive(Error, Debug)]
pub enum GroupError {
    #[error("Already joined")]
    AlreadyJoined,

    #[error("Group manager is stopped")]
    Stopped,

    #[error("Send to non-existent member {0}")]
    MemberNotFound(MemberId),

    #[error("Send to not ready member {0}")]
    MemberNotReady(MemberId),

    #[error("Channel {0} is closed")]
    ChannelClosed(u64),

    #[error("Connect to {0} timed out")]
    ConnectTimeout(String),

    #[error("Unknown host: {0}")]
    UnknownHost(String),

    #[error("Max connections exceeded on {0}")]
    MaxConnectionsExceeded(String),

    #[error("Protocol stack mismatch: expected {expected}, got {got}")]
    StackMismatch { expected: String, got: String },

    #[error("Received response from {from} which is not awaited")]
    UnexpectedResponse { from: MemberId },

    #[error("Responses still pending from {0} member(s)")]
    ResponsesPending(usize),

    #[error("Timed out waiting for responses from {missing:?}")]
    ResponseTimeout { missing: Vec<MemberId> },

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Core error: {0}")]
    Core(#[from] cohort_core::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}
