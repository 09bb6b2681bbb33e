//! Peer discovery
//!
//! Keeps one state machine per configured peer and periodically opens
//! outbound channels to every peer that is neither a member nor backing off.
//! Connection attempts run on a bounded worker queue; at most one attempt
//! per peer is in flight. Failures are logged (rate limited) and retried
//! according to the peer's backoff; they never reach the caller of `join`.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use cohort_core::types::{MemberId, NodeIdentity};

use crate::error::{GroupError, GroupResult};
use crate::events::GroupEventsListener;
use crate::handshake::HandshakeOutcome;
use crate::metrics;

/// Consecutive failures retried on every pass before slowing down
const FAST_RETRY_ATTEMPTS: u32 = 60;

/// Passes skipped between attempts once fast retries are used up
const SLOW_RETRY_INTERVALS: u32 = 60;

/// Retry period for failures that are unlikely to clear quickly
const LONG_RETRY: Duration = Duration::from_secs(300);

/// Minimum gap between two warnings about the same peer
const WARN_INTERVAL: Duration = Duration::from_secs(60);

/// Discovery configuration
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Pause between discovery passes
    pub interval: Duration,
    /// Concurrent connection attempts
    pub workers: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            workers: 4,
        }
    }
}

/// Why the last attempt to reach a peer failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    Timeout,
    MaxConnections,
    UnknownHost,
    StackMismatch,
    Io,
    Other,
}

impl BackoffKind {
    pub fn from_error(err: &GroupError) -> Self {
        match err {
            GroupError::ConnectTimeout(_) => BackoffKind::Timeout,
            GroupError::MaxConnectionsExceeded(_) => BackoffKind::MaxConnections,
            GroupError::UnknownHost(_) => BackoffKind::UnknownHost,
            GroupError::StackMismatch { .. } => BackoffKind::StackMismatch,
            GroupError::Io(_) => BackoffKind::Io,
            _ => BackoffKind::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BackoffKind::Timeout => "timeout",
            BackoffKind::MaxConnections => "max_connections",
            BackoffKind::UnknownHost => "unknown_host",
            BackoffKind::StackMismatch => "stack_mismatch",
            BackoffKind::Io => "io",
            BackoffKind::Other => "other",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "reason")]
pub enum DiscoveryStatus {
    Idle,
    Connecting,
    Connected,
    Backoff(BackoffKind),
    Member,
}

/// Connection state of one configured peer
#[derive(Debug, Clone)]
pub struct DiscoveryStateMachine {
    node: NodeIdentity,
    status: DiscoveryStatus,
    bad_count: u32,
    last_attempt: Option<Instant>,
    last_warning: Option<Instant>,
}

impl DiscoveryStateMachine {
    pub fn new(node: NodeIdentity) -> Self {
        Self {
            node,
            status: DiscoveryStatus::Idle,
            bad_count: 0,
            last_attempt: None,
            last_warning: None,
        }
    }

    pub fn node(&self) -> &NodeIdentity {
        &self.node
    }

    pub fn status(&self) -> DiscoveryStatus {
        self.status
    }

    pub fn bad_count(&self) -> u32 {
        self.bad_count
    }

    pub fn is_time_to_connect(&self, now: Instant, interval: Duration) -> bool {
        let elapsed = self
            .last_attempt
            .map(|at| now.saturating_duration_since(at))
            .unwrap_or(Duration::MAX);

        match self.status {
            DiscoveryStatus::Idle => true,
            DiscoveryStatus::Connecting | DiscoveryStatus::Member => false,
            // admitted but never joined: the handshake died after the outcome was published
            DiscoveryStatus::Connected => elapsed >= interval * SLOW_RETRY_INTERVALS,
            DiscoveryStatus::Backoff(BackoffKind::UnknownHost)
            | DiscoveryStatus::Backoff(BackoffKind::StackMismatch) => elapsed >= LONG_RETRY,
            DiscoveryStatus::Backoff(_) => {
                self.bad_count < FAST_RETRY_ATTEMPTS || elapsed >= interval * SLOW_RETRY_INTERVALS
            }
        }
    }

    pub fn start_connecting(&mut self, now: Instant) {
        self.status = DiscoveryStatus::Connecting;
        self.last_attempt = Some(now);
    }

    /// The channel is up and the handshake admitted the peer
    pub fn connected(&mut self) {
        self.bad_count = 0;
        if self.status != DiscoveryStatus::Member {
            self.status = DiscoveryStatus::Connected;
        }
    }

    /// Record a failed attempt; true when a warning is due
    pub fn failed(&mut self, kind: BackoffKind, now: Instant) -> bool {
        if self.status == DiscoveryStatus::Member {
            return false;
        }
        self.bad_count = self.bad_count.saturating_add(1);
        self.status = DiscoveryStatus::Backoff(kind);

        let due = self
            .last_warning
            .map_or(true, |at| now.saturating_duration_since(at) >= WARN_INTERVAL);
        if due {
            self.last_warning = Some(now);
        }
        due
    }

    /// Attempt abandoned before it started
    pub fn reset(&mut self) {
        if self.status == DiscoveryStatus::Connecting {
            self.status = DiscoveryStatus::Idle;
        }
    }

    pub fn member_joined(&mut self) {
        self.status = DiscoveryStatus::Member;
        self.bad_count = 0;
    }

    pub fn member_left(&mut self) {
        if self.status == DiscoveryStatus::Member {
            self.status = DiscoveryStatus::Idle;
        }
    }
}

/// The configured group, shared with whoever may change it at runtime
#[derive(Clone, Default)]
pub struct PeerSet {
    nodes: Arc<RwLock<HashSet<NodeIdentity>>>,
}

impl PeerSet {
    pub fn new(nodes: impl IntoIterator<Item = NodeIdentity>) -> Self {
        Self {
            nodes: Arc::new(RwLock::new(nodes.into_iter().collect())),
        }
    }

    pub fn snapshot(&self) -> HashSet<NodeIdentity> {
        self.nodes.read().clone()
    }

    /// Replace the configured nodes
    pub fn update(&self, nodes: impl IntoIterator<Item = NodeIdentity>) {
        *self.nodes.write() = nodes.into_iter().collect();
    }

    pub fn add(&self, node: NodeIdentity) -> bool {
        self.nodes.write().insert(node)
    }

    pub fn remove(&self, node: &NodeIdentity) -> bool {
        self.nodes.write().remove(node)
    }

    pub fn contains_name(&self, name: &str) -> bool {
        self.nodes.read().iter().any(|n| n.server_name() == name)
    }

    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }
}

impl fmt::Debug for PeerSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.nodes.read().iter()).finish()
    }
}

/// Opens an outbound channel and starts its handshake
#[async_trait]
pub(crate) trait Connector: Send + Sync + 'static {
    async fn open_channel(
        &self,
        node: &NodeIdentity,
    ) -> GroupResult<watch::Receiver<HandshakeOutcome>>;
}

/// Diagnostic view of one peer
#[derive(Debug, Clone, Serialize)]
pub struct PeerSnapshot {
    pub node: String,
    #[serde(flatten)]
    pub status: DiscoveryStatus,
    pub bad_count: u32,
}

/// Discovery service for the configured group
pub struct DiscoveryService {
    /// This node
    local: NodeIdentity,
    config: DiscoveryConfig,
    /// Configured group, may include this node
    peers: PeerSet,
    /// One state machine per peer other than this node
    machines: RwLock<HashMap<NodeIdentity, DiscoveryStateMachine>>,
    /// Peers with an attempt in flight
    connecting: Mutex<HashSet<NodeIdentity>>,
    /// Members reported joined
    joined: RwLock<HashSet<MemberId>>,
    connector: Weak<dyn Connector>,
    shutdown: CancellationToken,
    started: AtomicBool,
}

impl DiscoveryService {
    pub(crate) fn new(
        local: NodeIdentity,
        config: DiscoveryConfig,
        peers: PeerSet,
        connector: Weak<dyn Connector>,
    ) -> Self {
        Self {
            local,
            config,
            peers,
            machines: RwLock::new(HashMap::new()),
            connecting: Mutex::new(HashSet::new()),
            joined: RwLock::new(HashSet::new()),
            connector,
            shutdown: CancellationToken::new(),
            started: AtomicBool::new(false),
        }
    }

    /// Create one state machine per configured node except this one
    pub fn setup_nodes(&self, nodes: &[NodeIdentity]) -> GroupResult<()> {
        let mut seen = HashSet::new();
        for node in nodes {
            if !seen.insert(node.clone()) {
                return Err(cohort_core::Error::DuplicateNode(node.server_name()).into());
            }
        }

        let mut machines = self.machines.write();
        machines.clear();
        for node in nodes.iter().filter(|n| **n != self.local) {
            machines.insert(node.clone(), DiscoveryStateMachine::new(node.clone()));
        }
        self.peers.update(seen);

        info!(
            "Discovery set up for {} peer(s) of {}",
            machines.len(),
            self.local
        );
        Ok(())
    }

    /// Start the periodic discovery loop and its workers
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }

        let workers = self.config.workers.max(1);
        let (queue, mut queue_rx) = mpsc::channel::<NodeIdentity>(workers * 4);

        let service = Arc::clone(self);
        tokio::spawn(async move {
            let semaphore = Arc::new(Semaphore::new(workers));
            loop {
                let node = tokio::select! {
                    _ = service.shutdown.cancelled() => break,
                    node = queue_rx.recv() => match node {
                        Some(node) => node,
                        None => break,
                    },
                };
                let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                    break;
                };
                let service = Arc::clone(&service);
                tokio::spawn(async move {
                    service.connect_node(node).await;
                    drop(permit);
                });
            }
            debug!("Discovery workers stopped");
        });

        let service = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(service.config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = service.shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        service.discovery_pass(&queue);
                        service.reconcile();
                    }
                }
            }
            info!("Discovery loop stopped");
        });
    }

    /// Cancel the discovery loop and its workers without waiting
    pub(crate) fn halt(&self) {
        self.shutdown.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Stop discovering and give in-flight attempts a moment to finish
    pub async fn stop(&self) {
        self.halt();
        for _ in 0..20 {
            if self.connecting.lock().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    fn discovery_pass(&self, queue: &mpsc::Sender<NodeIdentity>) {
        let now = Instant::now();
        let mut due = Vec::new();
        {
            let mut machines = self.machines.write();
            let mut connecting = self.connecting.lock();
            for machine in machines.values_mut() {
                if !machine.is_time_to_connect(now, self.config.interval) {
                    continue;
                }
                if !connecting.insert(machine.node().clone()) {
                    debug!("Discovery for {} is in progress, skipping", machine.node());
                    continue;
                }
                machine.start_connecting(now);
                due.push(machine.node().clone());
            }
        }

        for node in due {
            if let Err(e) = queue.try_send(node) {
                let node = match e {
                    mpsc::error::TrySendError::Full(node) | mpsc::error::TrySendError::Closed(node) => node,
                };
                debug!("Discovery queue busy, deferring {}", node);
                self.connecting.lock().remove(&node);
                if let Some(machine) = self.machines.write().get_mut(&node) {
                    machine.reset();
                }
            }
        }
    }

    async fn connect_node(&self, node: NodeIdentity) {
        let result = match self.connector.upgrade() {
            Some(connector) => Self::attempt(connector.as_ref(), &node).await,
            None => Err(GroupError::Stopped),
        };

        if let Some(machine) = self.machines.write().get_mut(&node) {
            match result {
                Ok(()) => {
                    debug!("Connected to {}", node);
                    machine.connected();
                }
                Err(e) => {
                    let kind = BackoffKind::from_error(&e);
                    metrics::record_connect_failure(kind.as_str());
                    if machine.failed(kind, Instant::now()) {
                        warn!(
                            "Failed to connect to {} ({} consecutive): {}",
                            node,
                            machine.bad_count(),
                            e
                        );
                    } else {
                        debug!("Failed to connect to {}: {}", node, e);
                    }
                }
            }
        }
        self.connecting.lock().remove(&node);
    }

    async fn attempt(connector: &dyn Connector, node: &NodeIdentity) -> GroupResult<()> {
        let mut outcome = connector.open_channel(node).await?;
        let result = outcome
            .wait_for(|o| *o != HandshakeOutcome::Pending)
            .await
            .map(|o| o.clone())
            .unwrap_or(HandshakeOutcome::Failed);

        match result {
            HandshakeOutcome::Admitted(_) => Ok(()),
            _ => Err(GroupError::Transport(format!(
                "handshake with {} did not complete",
                node
            ))),
        }
    }

    /// Align the state machines with the configured peers.
    ///
    /// Only runs while fewer or more members are joined than configured.
    fn reconcile(&self) {
        let configured = self.peers.snapshot();
        let expected = configured.iter().filter(|n| **n != self.local).count();
        if self.joined.read().len() == expected {
            return;
        }

        let mut machines = self.machines.write();
        for node in configured.iter().filter(|n| **n != self.local) {
            if !machines.contains_key(node) {
                info!("Discovered new group node {}", node);
                machines.insert(node.clone(), DiscoveryStateMachine::new(node.clone()));
            }
        }
        machines.retain(|node, _| {
            let keep = configured.contains(node);
            if !keep {
                info!("Node {} is no longer part of the group", node);
            }
            keep
        });
    }

    /// Whether `name` is this node or one of the configured peers
    pub fn is_valid_cluster_node(&self, name: &str) -> bool {
        self.local.server_name() == name || self.peers.contains_name(name)
    }

    /// Whether a member with server name `name` is joined
    pub fn is_server_connected(&self, name: &str) -> bool {
        self.joined.read().iter().any(|m| m.name() == name)
    }

    pub fn joined_count(&self) -> usize {
        self.joined.read().len()
    }

    pub fn peers(&self) -> &PeerSet {
        &self.peers
    }

    pub fn status_of(&self, node: &NodeIdentity) -> Option<DiscoveryStatus> {
        self.machines.read().get(node).map(|m| m.status())
    }

    pub fn snapshot(&self) -> Vec<PeerSnapshot> {
        let mut peers: Vec<_> = self
            .machines
            .read()
            .values()
            .map(|m| PeerSnapshot {
                node: m.node().server_name(),
                status: m.status(),
                bad_count: m.bad_count(),
            })
            .collect();
        peers.sort_by(|a, b| a.node.cmp(&b.node));
        peers
    }
}

impl GroupEventsListener for DiscoveryService {
    fn node_joined(&self, id: &MemberId) {
        self.joined.write().insert(id.clone());
        for machine in self.machines.write().values_mut() {
            if id.is_incarnation_of(machine.node()) {
                machine.member_joined();
            }
        }
    }

    fn node_left(&self, id: &MemberId) {
        self.joined.write().remove(id);
        for machine in self.machines.write().values_mut() {
            if id.is_incarnation_of(machine.node()) {
                machine.member_left();
            }
        }
    }
}

impl fmt::Debug for DiscoveryService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiscoveryService")
            .field("local", &self.local)
            .field("peers", &self.machines.read().len())
            .field("joined", &self.joined.read().len())
            .finish()
    }
}
