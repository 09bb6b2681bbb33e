//! Group manager - the facade upstream components talk to
//!
//! Responsibilities:
//! - Start the transport and discovery on `join`
//! - Run a handshake for every channel and own the member registry
//! - Serve point-to-point, broadcast and synchronous sends
//! - Dispatch inbound messages to responses or registered listeners
//! - Fence members through the zap policy

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use cohort_core::config::GroupConfigSection;
use cohort_core::types::{
    DefaultWeightGenerator, GroupMessage, GroupPayload, MemberId, MessageId, MessageKind,
    NodeIdentity, WeightGenerator, WeightVector,
};
use cohort_core::CohortConfig;

use crate::discovery::{Connector, DiscoveryConfig, DiscoveryService, PeerSet};
use crate::error::{GroupError, GroupResult};
use crate::events::{same_listener, GroupEventsListener, GroupMessageListener, RouteToSink};
use crate::handshake::{self, HandshakeContext, HandshakeHandle, HandshakeOutcome};
use crate::member::{GroupMember, MemberRegistry};
use crate::metrics;
use crate::response::{GroupResponse, MemberLiveness, MemberState};
use crate::tcp::{TcpTransport, TcpTransportConfig};
use crate::transport::{ChannelId, ChannelRef, Frame, HandshakeMessage, Transport, TransportEvent};
use crate::zap::{codes, DefaultZapNodeRequestProcessor, ZapNodeRequestProcessor, ZapRequest};

/// Runtime configuration of a group manager
#[derive(Debug, Clone)]
pub struct GroupConfig {
    /// Pause between discovery passes
    pub discovery_interval: Duration,
    /// Time a channel has to complete the handshake
    pub handshake_timeout: Duration,
    /// Liveness re-check cadence of synchronous sends
    pub response_recheck: Duration,
    /// Overall bound on synchronous sends, none by default
    pub response_timeout: Option<Duration>,
    /// Concurrent outbound connection attempts
    pub discovery_workers: usize,
    /// Capacity of the inbound message queue
    pub dispatch_queue_size: usize,
    /// Peer accepted in addition to the configured ones (`host[:port]`)
    pub relay_peer: Option<String>,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            discovery_interval: Duration::from_secs(1),
            handshake_timeout: Duration::from_secs(10),
            response_recheck: Duration::from_secs(5),
            response_timeout: None,
            discovery_workers: 4,
            dispatch_queue_size: 1024,
            relay_peer: None,
        }
    }
}

impl From<&GroupConfigSection> for GroupConfig {
    fn from(section: &GroupConfigSection) -> Self {
        Self {
            discovery_interval: Duration::from_millis(section.discovery_interval_ms),
            handshake_timeout: Duration::from_millis(section.handshake_timeout_ms),
            response_recheck: Duration::from_secs(section.response_recheck_secs),
            response_timeout: section.response_timeout_secs.map(Duration::from_secs),
            discovery_workers: section.discovery_workers,
            dispatch_queue_size: section.dispatch_queue_size,
            relay_peer: section.relay_peer.clone(),
        }
    }
}

/// Membership and messaging for one node of the group
pub struct GroupManager {
    inner: Arc<GroupInner>,
}

pub(crate) struct GroupInner {
    me: Weak<GroupInner>,
    local: NodeIdentity,
    local_id: MemberId,
    config: GroupConfig,
    transport: Arc<dyn Transport>,
    weights: Arc<dyn WeightGenerator>,
    discovery: Arc<DiscoveryService>,
    members: MemberRegistry,
    handshakes: Mutex<HashMap<ChannelId, HandshakeHandle>>,
    pending: Mutex<HashMap<MessageId, Arc<GroupResponse>>>,
    listeners: RwLock<HashMap<MessageKind, Arc<dyn GroupMessageListener>>>,
    event_listeners: RwLock<Vec<Arc<dyn GroupEventsListener>>>,
    zap_processor: RwLock<Arc<dyn ZapNodeRequestProcessor>>,
    fenced: RwLock<HashSet<MemberId>>,
    joined: AtomicBool,
    stopped: CancellationToken,
}

impl GroupManager {
    /// Create a manager for `local` on top of `transport`
    pub fn new(
        local: NodeIdentity,
        config: GroupConfig,
        transport: Arc<dyn Transport>,
        weights: Arc<dyn WeightGenerator>,
    ) -> Self {
        let zap_processor: Arc<dyn ZapNodeRequestProcessor> =
            Arc::new(DefaultZapNodeRequestProcessor::new(Arc::clone(&weights)));
        let local_id = MemberId::for_node(&local);

        let inner = Arc::new_cyclic(|me: &Weak<GroupInner>| {
            let connector: Weak<dyn Connector> = me.clone();
            let discovery = Arc::new(DiscoveryService::new(
                local.clone(),
                DiscoveryConfig {
                    interval: config.discovery_interval,
                    workers: config.discovery_workers,
                },
                PeerSet::default(),
                connector,
            ));
            let discovery_listener: Arc<dyn GroupEventsListener> = discovery.clone();

            GroupInner {
                me: me.clone(),
                local,
                local_id,
                config,
                transport,
                weights,
                discovery,
                members: MemberRegistry::new(),
                handshakes: Mutex::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
                listeners: RwLock::new(HashMap::new()),
                event_listeners: RwLock::new(vec![discovery_listener]),
                zap_processor: RwLock::new(zap_processor),
                fenced: RwLock::new(HashSet::new()),
                joined: AtomicBool::new(false),
                stopped: CancellationToken::new(),
            }
        });

        Self { inner }
    }

    /// Create a manager over TCP from a loaded configuration
    pub fn from_config(config: &CohortConfig) -> GroupResult<Self> {
        config.validate()?;
        GroupManagerBuilder::new(config.local_node())
            .config(GroupConfig::from(&config.group))
            .transport(Arc::new(TcpTransport::new(TcpTransportConfig::from(
                &config.group,
            ))))
            .base_weights(config.group.weights.clone())
            .build()
    }

    /// Start listening and discovering the given nodes.
    ///
    /// `nodes` is the configured group and may include this node. A second
    /// call fails with [`GroupError::AlreadyJoined`] and changes nothing.
    pub async fn join(&self, nodes: &[NodeIdentity]) -> GroupResult<()> {
        let inner = &self.inner;
        if inner.stopped.is_cancelled() {
            return Err(GroupError::Stopped);
        }
        if inner.joined.swap(true, Ordering::AcqRel) {
            return Err(GroupError::AlreadyJoined);
        }

        let result = async {
            inner.discovery.setup_nodes(nodes)?;
            let (events_tx, events_rx) = mpsc::unbounded_channel();
            inner
                .transport
                .start(inner.local.group_port, events_tx)
                .await?;
            inner.start_event_loop(events_rx);
            inner.discovery.start();
            Ok::<(), GroupError>(())
        }
        .await;

        match &result {
            Ok(()) => info!(
                "{} joined the group with {} configured node(s)",
                inner.local_id,
                nodes.len()
            ),
            Err(e) => {
                error!("Failed to join the group: {}", e);
                inner.joined.store(false, Ordering::Release);
            }
        }
        result
    }

    /// Open one channel to `target` (`host:port[:group_port]`) outside of
    /// the discovery cycle and wait for the handshake.
    pub async fn directed_join(&self, target: &str) -> GroupResult<MemberId> {
        let node: NodeIdentity = target.parse()?;
        self.inner.ensure_running()?;
        self.inner.discovery.peers().add(node.clone());

        let mut outcome = self.inner.open_channel(&node).await?;
        let outcome = outcome
            .wait_for(|o| *o != HandshakeOutcome::Pending)
            .await
            .map(|o| o.clone())
            .unwrap_or(HandshakeOutcome::Failed);

        match outcome {
            HandshakeOutcome::Admitted(id) => Ok(id),
            _ => Err(GroupError::Transport(format!(
                "handshake with {} did not complete",
                node
            ))),
        }
    }

    /// Close every member and stop discovering; the listener stays up
    pub async fn disconnect(&self) {
        info!("Disconnecting {} from the group", self.inner.local_id);
        self.inner.discovery.stop().await;
        for member in self.inner.members.all() {
            self.inner.close_member_entry(&member);
        }
    }

    /// Stop everything; pending synchronous sends return [`GroupError::Stopped`]
    pub async fn shutdown(&self) {
        if self.inner.stopped.is_cancelled() {
            return;
        }
        info!("Shutting down group manager for {}", self.inner.local_id);
        self.inner.stopped.cancel();
        self.disconnect().await;
        self.inner.transport.shutdown().await;
        self.inner.handshakes.lock().clear();
        info!("Group manager stopped");
    }

    pub fn send_all(&self, msg: &GroupMessage) -> GroupResult<()> {
        self.inner.ensure_running()?;
        self.inner.send_all_filtered(msg, |_| true);
        Ok(())
    }

    /// Send to the ready members among `targets`
    pub fn send_all_to(&self, msg: &GroupMessage, targets: &HashSet<MemberId>) -> GroupResult<()> {
        self.inner.ensure_running()?;
        self.inner.send_all_filtered(msg, |id| targets.contains(id));
        Ok(())
    }

    /// Send to the ready members whose server name is in `names`
    pub fn send_to_names(&self, names: &[&str], msg: &GroupMessage) -> GroupResult<()> {
        self.inner.ensure_running()?;
        self.inner
            .send_all_filtered(msg, |id| names.contains(&id.name()));
        Ok(())
    }

    pub fn send_to(&self, id: &MemberId, msg: &GroupMessage) -> GroupResult<()> {
        self.inner.send_to(id, msg, None)
    }

    /// Like [`GroupManager::send_to`]; `sent` runs once the message is on the wire
    pub fn send_to_with_sent_callback<F>(
        &self,
        id: &MemberId,
        msg: &GroupMessage,
        sent: F,
    ) -> GroupResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.send_to(id, msg, Some(Box::new(sent)))
    }

    /// Send to every ready member and wait until each answered or died
    pub async fn send_all_and_wait_for_response(
        &self,
        msg: &GroupMessage,
    ) -> GroupResult<Arc<GroupResponse>> {
        self.inner.send_and_wait(msg, |_| true).await
    }

    pub async fn send_all_and_wait_for_response_to(
        &self,
        msg: &GroupMessage,
        targets: &HashSet<MemberId>,
    ) -> GroupResult<Arc<GroupResponse>> {
        self.inner
            .send_and_wait(msg, |id| targets.contains(id))
            .await
    }

    pub async fn send_to_names_and_wait_for_response(
        &self,
        names: &[&str],
        msg: &GroupMessage,
    ) -> GroupResult<Arc<GroupResponse>> {
        self.inner
            .send_and_wait(msg, |id| names.contains(&id.name()))
            .await
    }

    /// Send to one member and wait for its answer; `None` if it died first
    pub async fn send_to_and_wait_for_response(
        &self,
        id: &MemberId,
        msg: &GroupMessage,
    ) -> GroupResult<Option<GroupMessage>> {
        let member = self
            .inner
            .members
            .get(id)
            .ok_or_else(|| GroupError::MemberNotFound(id.clone()))?;
        if !member.is_ready() {
            return Err(GroupError::MemberNotReady(id.clone()));
        }

        let response = self.inner.send_and_wait(msg, |m| m == id).await?;
        response.response_from(id)
    }

    /// Handle messages of `kind`; replaces any earlier handler
    pub fn register_for_messages(&self, kind: MessageKind, listener: Arc<dyn GroupMessageListener>) {
        if let Some(_previous) = self.inner.listeners.write().insert(kind.clone(), listener) {
            warn!("Replacing the listener registered for {}", kind);
        }
    }

    /// Forward messages of `kind` into `sink`
    pub fn route_messages(&self, kind: MessageKind, sink: mpsc::UnboundedSender<GroupMessage>) {
        self.register_for_messages(kind, RouteToSink::new(sink));
    }

    pub fn register_for_group_events(&self, listener: Arc<dyn GroupEventsListener>) {
        self.inner.event_listeners.write().push(listener);
    }

    pub fn unregister_for_group_events(&self, listener: &Arc<dyn GroupEventsListener>) -> bool {
        let mut listeners = self.inner.event_listeners.write();
        let before = listeners.len();
        listeners.retain(|l| !same_listener(l, listener));
        listeners.len() < before
    }

    pub fn set_zap_node_request_processor(&self, processor: Arc<dyn ZapNodeRequestProcessor>) {
        *self.inner.zap_processor.write() = processor;
    }

    /// Fence `id`. The identity stays fenced even if the request is dropped.
    pub fn zap_node(&self, id: &MemberId, code: i32, reason: &str) {
        self.inner.zap_node(id, code, reason);
    }

    pub fn is_fenced(&self, id: &MemberId) -> bool {
        self.inner.fenced.read().contains(id)
    }

    pub fn fenced_members(&self) -> Vec<MemberId> {
        self.inner.fenced.read().iter().cloned().collect()
    }

    pub fn is_node_connected(&self, id: &MemberId) -> bool {
        self.inner
            .members
            .get(id)
            .map_or(false, |m| m.is_ready() && m.is_connected())
    }

    pub fn is_server_connected(&self, name: &str) -> bool {
        self.inner.discovery.is_server_connected(name)
    }

    pub fn close_member(&self, id: &MemberId) {
        if let Some(member) = self.inner.members.get(id) {
            self.inner.close_member_entry(&member);
        }
    }

    pub fn close_member_by_name(&self, name: &str) {
        for member in self.inner.members.find_by_name(name) {
            self.inner.close_member_entry(&member);
        }
    }

    /// Identities of the ready members
    pub fn members(&self) -> Vec<MemberId> {
        let mut members: Vec<_> = self
            .inner
            .members
            .ready_members(|_| true)
            .iter()
            .map(|m| m.peer_id().clone())
            .collect();
        members.sort();
        members
    }

    pub fn local_member_id(&self) -> &MemberId {
        &self.inner.local_id
    }

    pub fn local_node(&self) -> &NodeIdentity {
        &self.inner.local
    }

    /// Configured group, changes are picked up by discovery
    pub fn peers(&self) -> &PeerSet {
        self.inner.discovery.peers()
    }

    pub fn local_weights(&self) -> WeightVector {
        self.inner.weights.generate()
    }

    /// Diagnostic snapshot of members, peers and fenced identities
    pub fn state_map(&self) -> serde_json::Value {
        let mut members: Vec<_> = self
            .inner
            .members
            .all()
            .iter()
            .map(|m| m.snapshot())
            .collect();
        members.sort_by(|a, b| a.id.cmp(&b.id));
        let mut fenced: Vec<_> = self
            .inner
            .fenced
            .read()
            .iter()
            .map(|id| id.to_string())
            .collect();
        fenced.sort();

        json!({
            "local": self.inner.local_id.to_string(),
            "joined": self.inner.joined.load(Ordering::Acquire),
            "stopped": self.inner.stopped.is_cancelled(),
            "members": members,
            "peers": self.inner.discovery.snapshot(),
            "fenced": fenced,
        })
    }
}

impl Drop for GroupManager {
    fn drop(&mut self) {
        self.inner.stopped.cancel();
        self.inner.discovery.halt();
    }
}

impl fmt::Debug for GroupManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GroupManager")
            .field("local", &self.inner.local_id)
            .field("members", &self.inner.members.len())
            .field("joined", &self.inner.joined.load(Ordering::Relaxed))
            .field("stopped", &self.inner.stopped.is_cancelled())
            .finish()
    }
}

type Inbound = (MemberId, GroupMessage);

impl GroupInner {
    fn ensure_running(&self) -> GroupResult<()> {
        if self.stopped.is_cancelled() {
            return Err(GroupError::Stopped);
        }
        Ok(())
    }

    /// Consume transport events and feed handshakes and the dispatcher
    fn start_event_loop(self: &Arc<Self>, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
        let (dispatch_tx, mut dispatch_rx) =
            mpsc::channel::<Inbound>(self.config.dispatch_queue_size.max(1));

        let me = Arc::downgrade(self);
        let stopped = self.stopped.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = stopped.cancelled() => break,
                    event = events.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                let Some(inner) = me.upgrade() else {
                    break;
                };

                match event {
                    TransportEvent::ChannelCreated(channel) => {
                        debug!(
                            "Inbound channel {} from {}",
                            channel.id(),
                            channel.remote_addr()
                        );
                        inner.handshake_for(&channel);
                    }
                    TransportEvent::Received {
                        channel,
                        frame: Frame::Handshake(msg),
                    } => {
                        if channel.is_open() {
                            inner.deliver_handshake(&channel, msg);
                        }
                    }
                    TransportEvent::Received {
                        channel,
                        frame: Frame::Group(msg),
                    } => match inner.members.find_by_channel(channel.id()) {
                        Some(member) => {
                            let from = member.peer_id().clone();
                            drop(inner);
                            if dispatch_tx.send((from, msg)).await.is_err() {
                                break;
                            }
                        }
                        None => {
                            warn!(
                                "Dropping {} received on channel {} from a non-member",
                                msg.kind(),
                                channel.id()
                            );
                        }
                    },
                    TransportEvent::ChannelRemoved(channel) => inner.channel_removed(&channel),
                }
            }
            debug!("Group event loop stopped");
        });

        let me = Arc::downgrade(self);
        let stopped = self.stopped.clone();
        tokio::spawn(async move {
            loop {
                let (from, msg) = tokio::select! {
                    _ = stopped.cancelled() => break,
                    inbound = dispatch_rx.recv() => match inbound {
                        Some(inbound) => inbound,
                        None => break,
                    },
                };
                let Some(inner) = me.upgrade() else {
                    break;
                };
                inner.dispatch(from, msg);
            }
            debug!("Group dispatcher stopped");
        });
    }

    fn handshake_for(&self, channel: &ChannelRef) -> Option<watch::Receiver<HandshakeOutcome>> {
        if !channel.is_open() {
            debug!("Channel {} closed before its handshake started", channel.id());
            return None;
        }
        let me = self.me.upgrade()?;
        let mut handshakes = self.handshakes.lock();
        let handle = handshakes
            .entry(channel.id())
            .or_insert_with(|| handshake::spawn(&me, Arc::clone(channel)));
        Some(handle.outcome())
    }

    fn deliver_handshake(&self, channel: &ChannelRef, msg: HandshakeMessage) {
        let Some(me) = self.me.upgrade() else {
            return;
        };
        self.handshakes
            .lock()
            .entry(channel.id())
            .or_insert_with(|| handshake::spawn(&me, Arc::clone(channel)))
            .deliver(msg);
    }

    fn channel_removed(&self, channel: &ChannelRef) {
        debug!("Channel {} removed", channel.id());
        if let Some(handle) = self.handshakes.lock().remove(&channel.id()) {
            handle.disconnected();
        }
    }

    fn dispatch(&self, from: MemberId, mut msg: GroupMessage) {
        msg.set_sender(from.clone());

        if let Some(request) = msg.in_response_to() {
            let pending = self.pending.lock().get(&request).cloned();
            if let Some(pending) = pending {
                let kind = msg.kind().clone();
                // unexpected responders are logged by the aggregator
                if pending.add_response_from(&from, msg).is_err() {
                    metrics::record_message_dropped(kind.as_str());
                }
                return;
            }
        }

        if msg.kind() == &ZapRequest::KIND {
            self.incoming_zap(&from, &msg);
            return;
        }

        let listener = self.listeners.read().get(msg.kind()).cloned();
        match listener {
            Some(listener) => listener.message_received(&from, msg),
            None => {
                error!(
                    "No listener registered for {} from {}, dropping it",
                    msg.kind(),
                    from
                );
                metrics::record_message_dropped(msg.kind().as_str());
            }
        }
    }

    fn send_all_filtered<F>(&self, msg: &GroupMessage, filter: F) -> Vec<MemberId>
    where
        F: Fn(&MemberId) -> bool,
    {
        let mut sent = Vec::new();
        for member in self.members.all() {
            if !filter(member.peer_id()) {
                continue;
            }
            if !member.is_ready() {
                warn!("Skipping {} for {}: member not ready", msg.kind(), member.peer_id());
                continue;
            }
            match member.send(Frame::Group(msg.clone()), None) {
                Ok(()) => sent.push(member.peer_id().clone()),
                Err(e) => warn!("Failed to send {} to {}: {}", msg.kind(), member.peer_id(), e),
            }
        }
        sent
    }

    fn send_to(
        &self,
        id: &MemberId,
        msg: &GroupMessage,
        sent: Option<crate::transport::SentCallback>,
    ) -> GroupResult<()> {
        self.ensure_running()?;
        let member = self
            .members
            .get(id)
            .ok_or_else(|| GroupError::MemberNotFound(id.clone()))?;

        if !member.is_ready() {
            warn!("Send of {} to not ready member {}, closing it", msg.kind(), id);
            self.close_member_entry(&member);
            return Err(GroupError::MemberNotReady(id.clone()));
        }
        member.send(Frame::Group(msg.clone()), sent)
    }

    async fn send_and_wait<F>(&self, msg: &GroupMessage, filter: F) -> GroupResult<Arc<GroupResponse>>
    where
        F: Fn(&MemberId) -> bool,
    {
        self.ensure_running()?;
        let targets = self.members.ready_members(filter);
        let response = Arc::new(GroupResponse::new(
            msg.id(),
            targets.iter().map(|m| m.peer_id().clone()),
        ));
        self.pending.lock().insert(msg.id(), Arc::clone(&response));

        for member in &targets {
            if let Err(e) = member.send(Frame::Group(msg.clone()), None) {
                warn!("Failed to send {} to {}: {}", msg.kind(), member.peer_id(), e);
                self.close_member_entry(member);
            }
        }

        let started = Instant::now();
        let result = response
            .wait_for_responses(
                self,
                self.config.response_recheck,
                self.config.response_timeout,
                &self.stopped,
            )
            .await;
        self.pending.lock().remove(&msg.id());
        metrics::record_response_wait(started.elapsed().as_secs_f64());

        result.map(|()| response)
    }

    /// Remove the member's entry if it still owns its channel, then close the channel
    fn close_member_entry(&self, member: &Arc<GroupMember>) {
        member.set_ready(false);
        let removed = self
            .members
            .remove_if_same(member.peer_id(), member.channel_id())
            .is_some();

        if removed {
            let id = member.peer_id();
            if member.is_joined_event_fired() {
                info!("Member {} left the group", id);
                metrics::record_member_left(self.members.len());
                self.fire_node_event(id, false);
            } else {
                debug!("Closed {} before it joined", id);
            }

            let pending: Vec<_> = self.pending.lock().values().cloned().collect();
            for response in pending {
                response.notify_member_dead(id);
            }
        }

        member.channel().close();
    }

    fn fire_node_event(&self, id: &MemberId, joined: bool) {
        let listeners = self.event_listeners.read().clone();
        for listener in listeners {
            if joined {
                listener.node_joined(id);
            } else {
                listener.node_left(id);
            }
        }
    }

    fn zap_node(&self, id: &MemberId, code: i32, reason: &str) {
        self.fenced.write().insert(id.clone());

        let Some(member) = self.members.get(id) else {
            warn!("Ignoring zap request for {}: not a member", id);
            return;
        };

        let processor = self.zap_processor.read().clone();
        if !processor.accept_outgoing_zap_node_request(id, code, reason) {
            warn!("Zap policy declined the request for {} ({})", id, reason);
            return;
        }

        let request = ZapRequest {
            code,
            reason: reason.to_string(),
            weights: processor.current_node_weights(),
        };
        let sent = GroupMessage::new(&request)
            .map_err(GroupError::from)
            .and_then(|msg| member.send(Frame::Group(msg), None));
        match sent {
            Ok(()) => {
                metrics::record_zap_sent(code);
                warn!(
                    "Sent zap request to {} ({}): {}",
                    id,
                    codes::describe(code),
                    reason
                );
            }
            Err(e) => warn!("Failed to send zap request to {}: {}", id, e),
        }
    }

    fn incoming_zap(&self, from: &MemberId, msg: &GroupMessage) {
        match msg.payload::<ZapRequest>() {
            Ok(request) => {
                metrics::record_zap_received(request.code);
                let processor = self.zap_processor.read().clone();
                processor.incoming_zap_node_request(
                    from,
                    request.code,
                    &request.reason,
                    &request.weights,
                );
            }
            Err(e) => error!("Malformed zap request from {}: {}", from, e),
        }
    }

    /// The relay is accepted by its exact name, or by a channel whose remote
    /// host and port are both the relay's
    fn is_relay_peer(&self, peer: &MemberId, remote_addr: &str) -> bool {
        let Some(relay) = self.config.relay_peer.as_deref() else {
            return false;
        };
        if peer.name() == relay {
            return true;
        }

        let Some((relay_host, relay_port)) = relay_location(relay) else {
            return false;
        };
        remote_addr
            .rsplit_once(':')
            .and_then(|(host, port)| port.parse::<u16>().ok().map(|port| (host, port)))
            .map_or(false, |(host, port)| host == relay_host && port == relay_port)
    }
}

impl HandshakeContext for GroupInner {
    fn local_member_id(&self) -> &MemberId {
        &self.local_id
    }

    fn local_weights(&self) -> WeightVector {
        self.weights.generate()
    }

    fn handshake_timeout(&self) -> Duration {
        self.config.handshake_timeout
    }

    fn is_valid_peer(&self, peer: &MemberId, remote_addr: &str) -> bool {
        self.discovery.is_valid_cluster_node(peer.name()) || self.is_relay_peer(peer, remote_addr)
    }

    fn retire_stale_member(&self, peer: &MemberId) {
        for member in self.members.find_by_name(peer.name()) {
            if member.peer_id() != peer && !member.is_connected() {
                info!(
                    "{} reconnected as {}, dropping the old incarnation",
                    member.peer_id(),
                    peer
                );
                self.close_member_entry(&member);
            }
        }
    }

    fn try_add_member(&self, member: Arc<GroupMember>) -> bool {
        match self.members.try_insert(member) {
            Ok(()) => true,
            Err(e) => {
                debug!("Member insert refused: {}", e);
                false
            }
        }
    }

    fn close_member(&self, member: &Arc<GroupMember>) {
        self.close_member_entry(member);
    }

    fn handshake_finished(&self, channel: ChannelId) {
        self.handshakes.lock().remove(&channel);
    }

    fn member_admitted(&self, member: &Arc<GroupMember>) {
        let id = member.peer_id();
        if member.mark_joined_event_fired() {
            info!(
                "Member {} joined the group over channel {}",
                id,
                member.channel_id()
            );
            metrics::record_member_joined(self.members.len());
            self.fire_node_event(id, true);
        }

        if self.fenced.read().contains(id) {
            warn!("Previously fenced {} is back, fencing it again", id);
            self.zap_node(id, codes::COMMUNICATION_ERROR, "Aborting the fenced node");
        }
    }
}

impl MemberLiveness for GroupInner {
    fn member_state(&self, id: &MemberId) -> MemberState {
        match self.members.get(id) {
            None => MemberState::Missing,
            Some(member) if !member.is_connected() => MemberState::NoReceiver,
            Some(_) => MemberState::Live,
        }
    }

    fn close_dead(&self, id: &MemberId) {
        if let Some(member) = self.members.get(id) {
            self.close_member_entry(&member);
        }
    }
}

/// `(host, port)` of a relay given as `host[:port[:group_port]]`
fn relay_location(relay: &str) -> Option<(String, u16)> {
    if !relay.contains(':') {
        return Some((relay.to_string(), cohort_core::DEFAULT_PORT));
    }
    relay.parse::<NodeIdentity>().ok().map(|node| (node.host, node.port))
}

#[async_trait]
impl Connector for GroupInner {
    async fn open_channel(
        &self,
        node: &NodeIdentity,
    ) -> GroupResult<watch::Receiver<HandshakeOutcome>> {
        self.ensure_running()?;
        let channel = self.transport.connect(&node.host, node.group_port).await?;
        debug!("Outbound channel {} to {}", channel.id(), node);
        self.handshake_for(&channel).ok_or_else(|| {
            if channel.is_open() {
                GroupError::Stopped
            } else {
                GroupError::ChannelClosed(channel.id())
            }
        })
    }
}

/// Builder for GroupManager
pub struct GroupManagerBuilder {
    local: NodeIdentity,
    config: GroupConfig,
    transport: Option<Arc<dyn Transport>>,
    weights: Option<Arc<dyn WeightGenerator>>,
    base_weights: Vec<i64>,
    zap_processor: Option<Arc<dyn ZapNodeRequestProcessor>>,
}

impl GroupManagerBuilder {
    pub fn new(local: NodeIdentity) -> Self {
        Self {
            local,
            config: GroupConfig::default(),
            transport: None,
            weights: None,
            base_weights: Vec::new(),
            zap_processor: None,
        }
    }

    pub fn config(mut self, config: GroupConfig) -> Self {
        self.config = config;
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Use a custom weight generator instead of the default one
    pub fn weights(mut self, weights: Arc<dyn WeightGenerator>) -> Self {
        self.weights = Some(weights);
        self
    }

    /// Base weights of the default weight generator
    pub fn base_weights(mut self, base: Vec<i64>) -> Self {
        self.base_weights = base;
        self
    }

    pub fn zap_processor(mut self, processor: Arc<dyn ZapNodeRequestProcessor>) -> Self {
        self.zap_processor = Some(processor);
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.config.handshake_timeout = timeout;
        self
    }

    pub fn discovery_interval(mut self, interval: Duration) -> Self {
        self.config.discovery_interval = interval;
        self
    }

    pub fn response_recheck(mut self, recheck: Duration) -> Self {
        self.config.response_recheck = recheck;
        self
    }

    pub fn relay_peer(mut self, relay: impl Into<String>) -> Self {
        self.config.relay_peer = Some(relay.into());
        self
    }

    pub fn build(self) -> GroupResult<GroupManager> {
        let transport = self
            .transport
            .ok_or_else(|| GroupError::InvalidConfig("a transport is required".to_string()))?;
        if self.config.handshake_timeout.is_zero() || self.config.response_recheck.is_zero() {
            return Err(GroupError::InvalidConfig(
                "handshake timeout and response recheck must be positive".to_string(),
            ));
        }
        let weights = self
            .weights
            .unwrap_or_else(|| Arc::new(DefaultWeightGenerator::new(self.base_weights)));

        let manager = GroupManager::new(self.local, self.config, transport, weights);
        if let Some(processor) = self.zap_processor {
            manager.set_zap_node_request_processor(processor);
        }
        Ok(manager)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::member::tests::StubChannel;
    use crate::memory::{MemoryNetwork, MemoryTransport};
    use crate::metrics::tests::CounterRecorder;
    use crate::transport::Channel;
    use serde::{Deserialize, Serialize};

    fn manager(network: &Arc<MemoryNetwork>, host: &str) -> GroupManager {
        GroupManagerBuilder::new(NodeIdentity::new(host, 9510, 9530))
            .transport(Arc::new(MemoryTransport::new(Arc::clone(network), host)))
            .build()
            .unwrap()
    }

    fn relayed(network: &Arc<MemoryNetwork>, relay: &str) -> GroupManager {
        GroupManagerBuilder::new(NodeIdentity::new("a", 9510, 9530))
            .transport(Arc::new(MemoryTransport::new(Arc::clone(network), "a")))
            .relay_peer(relay)
            .build()
            .unwrap()
    }

    /// Put a member on a stub channel straight into the registry
    fn stub_member(
        manager: &GroupManager,
        name: &str,
        channel: ChannelId,
        ready: bool,
    ) -> (MemberId, Arc<StubChannel>) {
        let id = MemberId::new(name);
        let stub = StubChannel::new(channel);
        let member = Arc::new(GroupMember::new(
            manager.local_member_id().clone(),
            id.clone(),
            stub.clone(),
            true,
        ));
        member.set_ready(ready);
        manager.inner.members.try_insert(member).unwrap();
        (id, stub)
    }

    fn ping() -> GroupMessage {
        GroupMessage::raw(MessageKind::from_static("test.ping"), json!({}))
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[derive(Serialize, Deserialize)]
    struct Pong {
        ok: bool,
    }

    impl GroupPayload for Pong {
        const KIND: MessageKind = MessageKind::from_static("test.pong");
    }

    #[derive(Default)]
    struct LeftLog(Mutex<Vec<MemberId>>);

    impl GroupEventsListener for LeftLog {
        fn node_joined(&self, _id: &MemberId) {}
        fn node_left(&self, id: &MemberId) {
            self.0.lock().push(id.clone());
        }
    }

    #[test]
    fn test_config_from_section() {
        let section = GroupConfigSection {
            response_timeout_secs: Some(30),
            relay_peer: Some("relay:9510".to_string()),
            ..Default::default()
        };
        let config = GroupConfig::from(&section);
        assert_eq!(config.discovery_interval, Duration::from_secs(1));
        assert_eq!(config.handshake_timeout, Duration::from_secs(10));
        assert_eq!(config.response_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.relay_peer.as_deref(), Some("relay:9510"));
    }

    #[test]
    fn test_builder_requires_transport() {
        let result = GroupManagerBuilder::new(NodeIdentity::new("a", 9510, 9530)).build();
        assert!(matches!(result, Err(GroupError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_join_twice() {
        let network = MemoryNetwork::new();
        let a = manager(&network, "a");
        let nodes = vec![NodeIdentity::new("a", 9510, 9530)];

        a.join(&nodes).await.unwrap();
        assert!(matches!(a.join(&nodes).await, Err(GroupError::AlreadyJoined)));
        assert!(network.is_listening("a", 9530));
        a.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_join_can_be_retried() {
        let network = MemoryNetwork::new();
        let a = manager(&network, "a");
        let b = NodeIdentity::new("b", 9510, 9530);

        assert!(a.join(&[b.clone(), b.clone()]).await.is_err());
        assert!(a.join(&[b]).await.is_ok());
        a.shutdown().await;
    }

    #[tokio::test]
    async fn test_send_to_absent_member() {
        let network = MemoryNetwork::new();
        let a = manager(&network, "a");
        let ghost = MemberId::new("ghost:9510");
        let msg = GroupMessage::raw(MessageKind::from_static("test.ping"), json!({}));

        assert!(matches!(
            a.send_to(&ghost, &msg),
            Err(GroupError::MemberNotFound(_))
        ));
        assert!(a.members().is_empty());
        assert!(!a.is_node_connected(&ghost));
    }

    #[tokio::test]
    async fn test_zap_absent_member_still_fenced() {
        let network = MemoryNetwork::new();
        let a = manager(&network, "a");
        let ghost = MemberId::new("ghost:9510");

        a.zap_node(&ghost, codes::SPLIT_BRAIN, "test");
        assert!(a.is_fenced(&ghost));
        assert_eq!(a.state_map()["fenced"][0], json!(ghost.to_string()));
    }

    #[tokio::test]
    async fn test_listener_replacement_and_unregister() {
        let network = MemoryNetwork::new();
        let a = manager(&network, "a");
        let kind = MessageKind::from_static("test.ping");

        let (tx1, _rx1) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();
        a.route_messages(kind.clone(), tx1);
        a.route_messages(kind.clone(), tx2);
        assert_eq!(a.inner.listeners.read().len(), 1);

        struct Noop;
        impl GroupEventsListener for Noop {
            fn node_joined(&self, _id: &MemberId) {}
            fn node_left(&self, _id: &MemberId) {}
        }
        let listener: Arc<dyn GroupEventsListener> = Arc::new(Noop);
        a.register_for_group_events(Arc::clone(&listener));
        assert!(a.unregister_for_group_events(&listener));
        assert!(!a.unregister_for_group_events(&listener));
    }

    #[tokio::test]
    async fn test_sends_fail_after_shutdown() {
        let network = MemoryNetwork::new();
        let a = manager(&network, "a");
        a.join(&[]).await.unwrap();
        a.shutdown().await;

        let msg = GroupMessage::raw(MessageKind::from_static("test.ping"), json!({}));
        assert!(matches!(a.send_all(&msg), Err(GroupError::Stopped)));
        assert!(matches!(
            a.send_all_and_wait_for_response(&msg).await,
            Err(GroupError::Stopped)
        ));
        assert!(matches!(a.join(&[]).await, Err(GroupError::Stopped)));
    }

    #[tokio::test]
    async fn test_relay_peer_requires_host_and_port() {
        let network = MemoryNetwork::new();
        let a = relayed(&network, "relay:9510");
        let inner = &a.inner;

        assert!(inner.is_relay_peer(&MemberId::new("relay:9510"), "10.0.0.9:40312"));
        assert!(inner.is_relay_peer(&MemberId::new("proxy:1"), "relay:9510"));
        assert!(!inner.is_relay_peer(&MemberId::new("relay:7777"), "relay:0"));
        assert!(!inner.is_relay_peer(&MemberId::new("relay:7777"), "relay:7777"));
        assert!(!inner.is_relay_peer(&MemberId::new("proxy:1"), "other:9510"));
        assert!(!inner.is_relay_peer(&MemberId::new("proxy:1"), "relay"));
        assert!(!inner.is_valid_peer(&MemberId::new("relay:7777"), "relay:0"));
        assert!(inner.is_valid_peer(&MemberId::new("relay:9510"), "relay:0"));

        let bare = relayed(&network, "relay");
        assert!(bare.inner.is_relay_peer(&MemberId::new("proxy:1"), "relay:9510"));
        assert!(!bare.inner.is_relay_peer(&MemberId::new("relay:9510"), "relay:0"));
        assert!(!bare.inner.is_relay_peer(&MemberId::new("proxy:1"), "relay:7777"));

        let full = relayed(&network, "relay:9510:9530");
        assert!(full.inner.is_relay_peer(&MemberId::new("proxy:1"), "relay:9510"));
        assert!(!full.inner.is_relay_peer(&MemberId::new("proxy:1"), "relay:9530"));

        let unset = manager(&network, "a");
        assert!(!unset.inner.is_relay_peer(&MemberId::new("relay:9510"), "relay:9510"));
    }

    #[tokio::test]
    async fn test_send_to_unready_member_closes_it() {
        let network = MemoryNetwork::new();
        let a = manager(&network, "a");
        let (id, channel) = stub_member(&a, "b:9510", 1, false);

        assert!(matches!(
            a.send_to(&id, &ping()),
            Err(GroupError::MemberNotReady(_))
        ));
        assert!(!a.inner.members.contains(&id));
        assert!(!channel.is_open());
        assert_eq!(channel.sent.load(Ordering::Acquire), 0);
    }

    #[tokio::test]
    async fn test_send_all_skips_unready_members() {
        let network = MemoryNetwork::new();
        let a = manager(&network, "a");
        let (_ready, ready_channel) = stub_member(&a, "b:9510", 1, true);
        let (unready, unready_channel) = stub_member(&a, "c:9510", 2, false);

        a.send_all(&ping()).unwrap();
        a.send_to_names(&["b:9510", "c:9510"], &ping()).unwrap();

        assert_eq!(ready_channel.sent.load(Ordering::Acquire), 2);
        assert_eq!(unready_channel.sent.load(Ordering::Acquire), 0);
        assert!(a.inner.members.contains(&unready));
        assert!(unready_channel.is_open());
    }

    #[tokio::test]
    async fn test_sent_callback_invoked() {
        let network = MemoryNetwork::new();
        let a = manager(&network, "a");
        let (id, channel) = stub_member(&a, "b:9510", 1, true);

        let sent = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&sent);
        a.send_to_with_sent_callback(&id, &ping(), move || flag.store(true, Ordering::Release))
            .unwrap();

        assert!(sent.load(Ordering::Acquire));
        assert_eq!(channel.sent.load(Ordering::Acquire), 1);
    }

    #[tokio::test]
    async fn test_new_incarnation_retires_stale_member() {
        let network = MemoryNetwork::new();
        let a = manager(&network, "a");
        a.inner
            .discovery
            .setup_nodes(&[
                NodeIdentity::new("a", 9510, 9530),
                NodeIdentity::new("b", 9510, 9530),
            ])
            .unwrap();
        let left = Arc::new(LeftLog::default());
        a.register_for_group_events(left.clone());

        let (stale, stale_channel) = stub_member(&a, "b:9510", 1, true);
        assert!(a.inner.members.get(&stale).unwrap().mark_joined_event_fired());
        stale_channel.close();

        let channel: ChannelRef = StubChannel::new(2);
        assert!(a.inner.handshake_for(&channel).is_some());
        a.inner.deliver_handshake(
            &channel,
            HandshakeMessage::Announce {
                identity: MemberId::new("b:9510"),
                protocol_version: cohort_core::PROTOCOL_VERSION,
                weights: WeightVector::default(),
            },
        );
        settle().await;

        assert!(!a.inner.members.contains(&stale));
        assert_eq!(*left.0.lock(), vec![stale.clone()]);
        assert!(a
            .inner
            .members
            .find_by_name("b:9510")
            .iter()
            .all(|m| m.peer_id() != &stale));
    }

    #[tokio::test]
    async fn test_failed_handshake_leaves_no_entry() {
        let network = MemoryNetwork::new();
        let a = manager(&network, "a");

        let channel: ChannelRef = StubChannel::new(3);
        assert!(a.inner.handshake_for(&channel).is_some());
        assert_eq!(a.inner.handshakes.lock().len(), 1);

        a.inner.deliver_handshake(&channel, HandshakeMessage::Deny);
        settle().await;
        assert!(a.inner.handshakes.lock().is_empty());
        assert!(!channel.is_open());

        let closed: ChannelRef = StubChannel::new(4);
        closed.close();
        assert!(a.inner.handshake_for(&closed).is_none());
        assert!(a.inner.handshakes.lock().is_empty());
    }

    #[tokio::test]
    async fn test_unexpected_response_counted_as_dropped() {
        let network = MemoryNetwork::new();
        let a = manager(&network, "a");
        let (tx, mut rx) = mpsc::unbounded_channel();
        a.route_messages(Pong::KIND, tx);

        let request = ping();
        let awaited = MemberId::new("b:9510");
        let response = Arc::new(GroupResponse::new(request.id(), [awaited.clone()]));
        a.inner
            .pending
            .lock()
            .insert(request.id(), Arc::clone(&response));

        let reply = GroupMessage::response_to(&request, &Pong { ok: true }).unwrap();
        let recorder = CounterRecorder::new(crate::metrics::names::MESSAGES_DROPPED_TOTAL);
        ::metrics::with_local_recorder(&recorder, || {
            a.inner.dispatch(MemberId::new("c:9510"), reply)
        });

        assert_eq!(recorder.total(), 1);
        assert_eq!(response.outstanding(), vec![awaited]);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_drop_halts_discovery() {
        let network = MemoryNetwork::new();
        let a = manager(&network, "a");
        a.join(&[
            NodeIdentity::new("a", 9510, 9530),
            NodeIdentity::new("b", 9510, 9530),
        ])
        .await
        .unwrap();

        let discovery = Arc::clone(&a.inner.discovery);
        let stopped = a.inner.stopped.clone();
        assert!(!discovery.is_stopped());

        drop(a);
        assert!(discovery.is_stopped());
        assert!(stopped.is_cancelled());
    }
}
