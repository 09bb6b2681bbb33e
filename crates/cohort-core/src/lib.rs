//! Cohort Core Library
//!
//! Identity, message envelope and configuration types shared by the Cohort
//! group-communication layer and its binaries.

pub mod config;
pub mod error;
pub mod types;

pub use config::CohortConfig;
pub use error::{Error, Result};

/// Cohort version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Version of the group handshake protocol announced to peers
pub const PROTOCOL_VERSION: u32 = 1;

/// Default client-facing port of a node
pub const DEFAULT_PORT: u16 = 9510;

/// Offset from the client-facing port to the group port when none is given
pub const DEFAULT_GROUP_PORT_OFFSET: u16 = 20;
