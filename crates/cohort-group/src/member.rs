//! Admitted members and the registry that holds them

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

use cohort_core::types::MemberId;

use crate::error::{GroupError, GroupResult};
use crate::transport::{ChannelId, ChannelRef, Frame, SentCallback};

/// A peer admitted by the handshake
pub struct GroupMember {
    local: MemberId,
    peer: MemberId,
    channel: ChannelRef,
    high_priority: bool,
    ready: AtomicBool,
    joined_event_fired: AtomicBool,
    joined_at: DateTime<Utc>,
}

impl GroupMember {
    pub fn new(local: MemberId, peer: MemberId, channel: ChannelRef, high_priority: bool) -> Self {
        Self {
            local,
            peer,
            channel,
            high_priority,
            ready: AtomicBool::new(false),
            joined_event_fired: AtomicBool::new(false),
            joined_at: Utc::now(),
        }
    }

    pub fn local_id(&self) -> &MemberId {
        &self.local
    }

    pub fn peer_id(&self) -> &MemberId {
        &self.peer
    }

    pub fn channel(&self) -> &ChannelRef {
        &self.channel
    }

    pub fn channel_id(&self) -> ChannelId {
        self.channel.id()
    }

    /// Whether this side won the admission tie-break
    pub fn is_high_priority(&self) -> bool {
        self.high_priority
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Release);
    }

    /// Record that `node_joined` fired; true only for the first call
    pub fn mark_joined_event_fired(&self) -> bool {
        !self.joined_event_fired.swap(true, Ordering::AcqRel)
    }

    pub fn is_joined_event_fired(&self) -> bool {
        self.joined_event_fired.load(Ordering::Acquire)
    }

    pub fn is_connected(&self) -> bool {
        self.channel.is_open()
    }

    pub fn send(&self, frame: Frame, sent: Option<SentCallback>) -> GroupResult<()> {
        self.channel.send(frame, sent)
    }

    pub fn snapshot(&self) -> MemberSnapshot {
        MemberSnapshot {
            id: self.peer.to_string(),
            name: self.peer.name().to_string(),
            channel: self.channel.id(),
            remote_addr: self.channel.remote_addr(),
            ready: self.is_ready(),
            joined: self.is_joined_event_fired(),
            high_priority: self.high_priority,
            joined_at: self.joined_at,
        }
    }
}

impl fmt::Debug for GroupMember {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GroupMember")
            .field("peer", &self.peer)
            .field("channel", &self.channel.id())
            .field("ready", &self.is_ready())
            .field("high_priority", &self.high_priority)
            .finish()
    }
}

/// Diagnostic view of one member
#[derive(Debug, Clone, Serialize)]
pub struct MemberSnapshot {
    pub id: String,
    pub name: String,
    pub channel: ChannelId,
    pub remote_addr: String,
    pub ready: bool,
    pub joined: bool,
    pub high_priority: bool,
    pub joined_at: DateTime<Utc>,
}

/// Members keyed by identity, at most one entry per identity
#[derive(Default)]
pub struct MemberRegistry {
    members: RwLock<HashMap<MemberId, Arc<GroupMember>>>,
}

impl MemberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `member` unless its identity is already present.
    ///
    /// This is the single point where admission races resolve.
    pub fn try_insert(&self, member: Arc<GroupMember>) -> GroupResult<()> {
        use std::collections::hash_map::Entry;

        match self.members.write().entry(member.peer_id().clone()) {
            Entry::Occupied(existing) => Err(GroupError::Internal(format!(
                "{} already admitted on channel {}",
                existing.key(),
                existing.get().channel_id()
            ))),
            Entry::Vacant(slot) => {
                slot.insert(member);
                Ok(())
            }
        }
    }

    /// Remove the entry for `id` only if it still uses `channel`
    pub fn remove_if_same(&self, id: &MemberId, channel: ChannelId) -> Option<Arc<GroupMember>> {
        let mut members = self.members.write();
        match members.get(id) {
            Some(member) if member.channel_id() == channel => members.remove(id),
            _ => None,
        }
    }

    pub fn get(&self, id: &MemberId) -> Option<Arc<GroupMember>> {
        self.members.read().get(id).cloned()
    }

    pub fn contains(&self, id: &MemberId) -> bool {
        self.members.read().contains_key(id)
    }

    pub fn find_by_name(&self, name: &str) -> Vec<Arc<GroupMember>> {
        self.members
            .read()
            .values()
            .filter(|m| m.peer_id().name() == name)
            .cloned()
            .collect()
    }

    pub fn find_by_channel(&self, channel: ChannelId) -> Option<Arc<GroupMember>> {
        self.members
            .read()
            .values()
            .find(|m| m.channel_id() == channel)
            .cloned()
    }

    /// Ready members accepted by `filter`
    pub fn ready_members<F>(&self, filter: F) -> Vec<Arc<GroupMember>>
    where
        F: Fn(&MemberId) -> bool,
    {
        self.members
            .read()
            .values()
            .filter(|m| m.is_ready() && filter(m.peer_id()))
            .cloned()
            .collect()
    }

    pub fn all(&self) -> Vec<Arc<GroupMember>> {
        self.members.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.members.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.read().is_empty()
    }
}

impl fmt::Debug for MemberRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.members.read().keys()).finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::transport::Channel;

    #[derive(Debug)]
    pub(crate) struct StubChannel {
        pub id: ChannelId,
        pub open: AtomicBool,
        /// Frames accepted by `send`
        pub sent: std::sync::atomic::AtomicUsize,
    }

    impl StubChannel {
        pub fn new(id: ChannelId) -> Arc<Self> {
            Arc::new(Self {
                id,
                open: AtomicBool::new(true),
                sent: Default::default(),
            })
        }
    }

    impl Channel for StubChannel {
        fn id(&self) -> ChannelId {
            self.id
        }

        fn remote_addr(&self) -> String {
            "stub:0".to_string()
        }

        fn is_open(&self) -> bool {
            self.open.load(Ordering::Acquire)
        }

        fn send(&self, _frame: Frame, sent: Option<SentCallback>) -> GroupResult<()> {
            if !self.is_open() {
                return Err(GroupError::ChannelClosed(self.id));
            }
            self.sent.fetch_add(1, Ordering::AcqRel);
            if let Some(sent) = sent {
                sent();
            }
            Ok(())
        }

        fn close(&self) {
            self.open.store(false, Ordering::Release);
        }
    }

    fn member(peer: &MemberId, channel: ChannelId) -> Arc<GroupMember> {
        Arc::new(GroupMember::new(
            MemberId::new("local:1"),
            peer.clone(),
            StubChannel::new(channel),
            true,
        ))
    }

    #[test]
    fn test_single_entry_per_identity() {
        let registry = MemberRegistry::new();
        let peer = MemberId::new("peer:1");

        assert!(registry.try_insert(member(&peer, 1)).is_ok());
        assert!(registry.try_insert(member(&peer, 2)).is_err());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(&peer).unwrap().channel_id(), 1);
    }

    #[test]
    fn test_remove_only_same_channel() {
        let registry = MemberRegistry::new();
        let peer = MemberId::new("peer:1");
        registry.try_insert(member(&peer, 1)).unwrap();

        assert!(registry.remove_if_same(&peer, 2).is_none());
        assert!(registry.contains(&peer));
        assert!(registry.remove_if_same(&peer, 1).is_some());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_ready_filter() {
        let registry = MemberRegistry::new();
        let a = MemberId::new("a:1");
        let b = MemberId::new("b:1");
        let ma = member(&a, 1);
        registry.try_insert(Arc::clone(&ma)).unwrap();
        registry.try_insert(member(&b, 2)).unwrap();

        assert!(registry.ready_members(|_| true).is_empty());
        ma.set_ready(true);
        let ready = registry.ready_members(|_| true);
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].peer_id(), &a);
        assert!(registry.ready_members(|id| id == &b).is_empty());
        assert_eq!(registry.find_by_name("b:1").len(), 1);
    }

    #[test]
    fn test_joined_event_fires_once() {
        let m = member(&MemberId::new("a:1"), 1);
        assert!(m.mark_joined_event_fired());
        assert!(!m.mark_joined_event_fired());
    }
}
