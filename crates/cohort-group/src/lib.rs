//! Cohort Group - membership, admission and synchronous messaging
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        GroupManager                          │
//! │  send / send-all / send-and-wait, listeners, zap, shutdown   │
//! ├──────────────┬───────────────┬──────────────┬────────────────┤
//! │  Discovery   │  Handshake    │   Member     │   Response     │
//! │              │  (per channel)│   Registry   │   Aggregator   │
//! │ - backoff    │ - announce    │ - one entry  │ - correlation  │
//! │ - workers    │ - tie-break   │   per member │ - liveness     │
//! │ - reconcile  │ - watchdog    │ - ready flag │   re-checks    │
//! ├──────────────┴───────────────┴──────────────┴────────────────┤
//! │                Transport (TCP or in-memory)                  │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Features
//!
//! - **Static discovery**: every configured peer is dialled until it joins
//! - **Deterministic admission**: simultaneous connections yield one member
//! - **Synchronous sends**: wait until every recipient answered or died
//! - **Fencing**: zap requests that survive reconnection

pub mod discovery;
pub mod error;
pub mod events;
mod handshake;
pub mod manager;
pub mod member;
pub mod memory;
pub mod metrics;
pub mod response;
pub mod tcp;
pub mod transport;
pub mod zap;

pub use discovery::{BackoffKind, DiscoveryService, DiscoveryStatus, PeerSet};
pub use error::{GroupError, GroupResult};
pub use events::{GroupEventsListener, GroupMessageListener};
pub use handshake::{is_high_priority, HandshakeOutcome, HandshakeState};
pub use manager::{GroupConfig, GroupManager, GroupManagerBuilder};
pub use member::{GroupMember, MemberSnapshot};
pub use memory::{MemoryNetwork, MemoryTransport};
pub use response::GroupResponse;
pub use tcp::{TcpTransport, TcpTransportConfig};
pub use transport::{Channel, ChannelId, Frame, HandshakeMessage, Transport, TransportEvent};
pub use zap::{codes, DefaultZapNodeRequestProcessor, ZapNodeRequestProcessor, ZapRequest};

// Re-export types from core
pub use cohort_core::types::{
    GroupMessage, GroupPayload, MemberId, MessageId, MessageKind, NodeIdentity, WeightGenerator,
    WeightVector,
};
