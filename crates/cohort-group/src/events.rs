//! Listener seams for membership changes and inbound messages

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::warn;

use cohort_core::types::{GroupMessage, MemberId};

/// Observer of members joining and leaving
pub trait GroupEventsListener: Send + Sync {
    fn node_joined(&self, id: &MemberId);

    fn node_left(&self, id: &MemberId);
}

/// Handler for one message kind
pub trait GroupMessageListener: Send + Sync {
    fn message_received(&self, from: &MemberId, msg: GroupMessage);
}

impl<F> GroupMessageListener for F
where
    F: Fn(&MemberId, GroupMessage) + Send + Sync,
{
    fn message_received(&self, from: &MemberId, msg: GroupMessage) {
        self(from, msg)
    }
}

/// Forwards every message into a channel
pub struct RouteToSink {
    sink: mpsc::UnboundedSender<GroupMessage>,
}

impl RouteToSink {
    pub fn new(sink: mpsc::UnboundedSender<GroupMessage>) -> Arc<Self> {
        Arc::new(Self { sink })
    }
}

impl GroupMessageListener for RouteToSink {
    fn message_received(&self, from: &MemberId, msg: GroupMessage) {
        let kind = msg.kind().clone();
        if self.sink.send(msg).is_err() {
            warn!("Dropping {} from {}: route receiver is gone", kind, from);
        }
    }
}

/// Identity comparison for listener handles
pub(crate) fn same_listener<T: ?Sized>(a: &Arc<T>, b: &Arc<T>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}
