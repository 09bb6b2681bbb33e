//! Error types for Cohort

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid node address: {0}")]
    InvalidNodeAddress(String),

    #[error("Duplicate node in configuration: {0}")]
    DuplicateNode(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Message kind mismatch: expected {expected}, got {got}")]
    KindMismatch { expected: String, got: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn code(&self) -> &'static str {
        match self {
            Error::InvalidNodeAddress(_) => "InvalidNodeAddress",
            Error::DuplicateNode(_) => "DuplicateNode",
            Error::InvalidConfig(_) => "InvalidConfig",
            Error::KindMismatch { .. } => "KindMismatch",
            Error::Serialization(_) => "Serialization",
            Error::Io(_) => "Io",
            Error::Other(_) => "Internal",
        }
    }
}
