//! Transport seam for node-to-node channels
//!
//! The group layer never touches sockets directly. A [`Transport`] opens and
//! accepts [`Channel`]s and reports their lifecycle and inbound frames as
//! [`TransportEvent`]s. Delivery on one channel is reliable and in order;
//! nothing is promised across channels.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use cohort_core::types::{GroupMessage, MemberId, WeightVector};

use crate::error::GroupResult;

/// Transport-local channel identifier
pub type ChannelId = u64;

/// Invoked once a frame has been handed to the wire
pub type SentCallback = Box<dyn FnOnce() + Send + 'static>;

/// Shared handle to an open channel
pub type ChannelRef = Arc<dyn Channel>;

/// Sink the transport reports events into
pub type TransportEvents = mpsc::UnboundedSender<TransportEvent>;

/// Messages exchanged while admitting a peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HandshakeMessage {
    Announce {
        identity: MemberId,
        protocol_version: u32,
        weights: WeightVector,
    },
    Ok,
    Deny,
    Ack,
}

/// Unit of transfer on a channel
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "frame", content = "body", rename_all = "snake_case")]
pub enum Frame {
    Handshake(HandshakeMessage),
    Group(GroupMessage),
}

impl Frame {
    pub fn encode(&self) -> GroupResult<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn decode(data: &[u8]) -> GroupResult<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// One bidirectional connection to a peer
pub trait Channel: Send + Sync + fmt::Debug {
    fn id(&self) -> ChannelId;

    fn remote_addr(&self) -> String;

    /// Whether the channel still has a live endpoint on both sides
    fn is_open(&self) -> bool;

    /// Queue a frame for delivery; fails once the channel is closed
    fn send(&self, frame: Frame, sent: Option<SentCallback>) -> GroupResult<()>;

    /// Close the channel. Idempotent; a `ChannelRemoved` event follows.
    fn close(&self);
}

/// Lifecycle and data events reported by a transport
pub enum TransportEvent {
    /// An inbound channel was accepted
    ChannelCreated(ChannelRef),
    /// A frame arrived on a channel
    Received { channel: ChannelRef, frame: Frame },
    /// A channel was closed or lost, reported once per channel
    ChannelRemoved(ChannelRef),
}

impl fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportEvent::ChannelCreated(c) => write!(f, "ChannelCreated({})", c.id()),
            TransportEvent::Received { channel, .. } => write!(f, "Received({})", channel.id()),
            TransportEvent::ChannelRemoved(c) => write!(f, "ChannelRemoved({})", c.id()),
        }
    }
}

/// Opens and accepts channels between group members
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Start accepting inbound channels on `listen_port`.
    ///
    /// All events, including those of channels later opened with
    /// [`Transport::connect`], are reported into `events`.
    async fn start(&self, listen_port: u16, events: TransportEvents) -> GroupResult<()>;

    /// Open an outbound channel
    async fn connect(&self, host: &str, port: u16) -> GroupResult<ChannelRef>;

    /// Stop accepting and close every channel
    async fn shutdown(&self);
}
