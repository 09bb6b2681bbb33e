//! Per-channel admission handshake
//!
//! Every channel, inbound or outbound, is driven by one handshake task that
//! consumes the channel's handshake frames and disconnect notification in
//! order. Both sides announce their identity and weights; the side with the
//! greater weights (ties broken by member identity) is high priority and
//! performs the registry insert first, so two nodes that connect to each
//! other simultaneously end up with a single member entry per pair.
//!
//! ```text
//! Start -> IdentityExchange -> Admission -> Acknowledged -> Success
//!              \                  \              \
//!               +------------------+--------------+--> Failure
//! ```

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use cohort_core::types::{MemberId, WeightVector};
use cohort_core::PROTOCOL_VERSION;

use crate::member::GroupMember;
use crate::metrics;
use crate::transport::{ChannelId, ChannelRef, Frame, HandshakeMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Start,
    IdentityExchange,
    Admission,
    Acknowledged,
    Success,
    Failure,
}

/// Result of a handshake as seen by whoever opened the channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeOutcome {
    Pending,
    Admitted(MemberId),
    Failed,
}

/// Whether the local side wins the admission tie-break
pub fn is_high_priority(
    local_weights: &WeightVector,
    local: &MemberId,
    peer_weights: &WeightVector,
    peer: &MemberId,
) -> bool {
    match local_weights.cmp(peer_weights) {
        std::cmp::Ordering::Equal => local > peer,
        ordering => ordering.is_gt(),
    }
}

/// What a handshake needs from the group it admits members into
pub(crate) trait HandshakeContext: Send + Sync + 'static {
    fn local_member_id(&self) -> &MemberId;

    fn local_weights(&self) -> WeightVector;

    fn handshake_timeout(&self) -> Duration;

    /// Whether `peer` may join, given the channel's remote address
    fn is_valid_peer(&self, peer: &MemberId, remote_addr: &str) -> bool;

    /// Drop an earlier incarnation of `peer` whose channel is gone
    fn retire_stale_member(&self, peer: &MemberId);

    /// Conditional registry insert; false when the identity is present
    fn try_add_member(&self, member: Arc<GroupMember>) -> bool;

    /// Standard member teardown
    fn close_member(&self, member: &Arc<GroupMember>);

    /// The handshake completed for `member`
    fn member_admitted(&self, member: &Arc<GroupMember>);

    /// The handshake on `channel` reached Failure and its task is exiting
    fn handshake_finished(&self, channel: ChannelId);
}

pub(crate) enum HandshakeEvent {
    Message(HandshakeMessage),
    Disconnected,
}

/// Handle to a running handshake task
pub(crate) struct HandshakeHandle {
    events: mpsc::UnboundedSender<HandshakeEvent>,
    outcome: watch::Receiver<HandshakeOutcome>,
}

impl HandshakeHandle {
    pub fn deliver(&self, msg: HandshakeMessage) {
        let _ = self.events.send(HandshakeEvent::Message(msg));
    }

    pub fn disconnected(&self) {
        let _ = self.events.send(HandshakeEvent::Disconnected);
    }

    pub fn outcome(&self) -> watch::Receiver<HandshakeOutcome> {
        self.outcome.clone()
    }
}

/// Start the handshake for `channel`
pub(crate) fn spawn<C: HandshakeContext>(ctx: &Arc<C>, channel: ChannelRef) -> HandshakeHandle {
    let (events, events_rx) = mpsc::unbounded_channel();
    let (outcome_tx, outcome) = watch::channel(HandshakeOutcome::Pending);

    let handshake = Handshake {
        ctx: Arc::downgrade(ctx),
        local: ctx.local_member_id().clone(),
        local_weights: ctx.local_weights(),
        channel,
        peer: None,
        high_priority: false,
        member: None,
        state: HandshakeState::Start,
        outcome: outcome_tx,
    };
    let timeout = ctx.handshake_timeout();
    tokio::spawn(handshake.run(events_rx, timeout));

    HandshakeHandle { events, outcome }
}

struct Handshake<C> {
    ctx: Weak<C>,
    local: MemberId,
    local_weights: WeightVector,
    channel: ChannelRef,
    peer: Option<MemberId>,
    high_priority: bool,
    member: Option<Arc<GroupMember>>,
    state: HandshakeState,
    outcome: watch::Sender<HandshakeOutcome>,
}

impl<C: HandshakeContext> Handshake<C> {
    async fn run(mut self, mut events: mpsc::UnboundedReceiver<HandshakeEvent>, timeout: Duration) {
        let watchdog = sleep_until(Instant::now() + timeout);
        tokio::pin!(watchdog);

        self.start();

        while self.state != HandshakeState::Failure {
            let armed = self.state != HandshakeState::Success;
            tokio::select! {
                _ = &mut watchdog, if armed => {
                    warn!(
                        "Handshake on channel {} ({}) not done after {:?} in state {:?}",
                        self.channel.id(),
                        self.channel.remote_addr(),
                        timeout,
                        self.state
                    );
                    self.fail();
                }
                event = events.recv() => match event {
                    Some(HandshakeEvent::Message(msg)) => self.on_message(msg),
                    Some(HandshakeEvent::Disconnected) | None => {
                        debug!("Channel {} disconnected in state {:?}", self.channel.id(), self.state);
                        self.fail();
                    }
                },
            }
        }
    }

    fn transition(&mut self, next: HandshakeState) {
        debug!(
            "Handshake on channel {}: {:?} -> {:?}",
            self.channel.id(),
            self.state,
            next
        );
        self.state = next;
    }

    fn send(&mut self, msg: HandshakeMessage) -> bool {
        match self.channel.send(Frame::Handshake(msg), None) {
            Ok(()) => true,
            Err(e) => {
                warn!("Handshake send on channel {} failed: {}", self.channel.id(), e);
                self.fail();
                false
            }
        }
    }

    fn start(&mut self) {
        self.transition(HandshakeState::IdentityExchange);
        self.send(HandshakeMessage::Announce {
            identity: self.local.clone(),
            protocol_version: PROTOCOL_VERSION,
            weights: self.local_weights.clone(),
        });
    }

    fn on_message(&mut self, msg: HandshakeMessage) {
        match (self.state, msg) {
            (
                HandshakeState::IdentityExchange,
                HandshakeMessage::Announce {
                    identity,
                    protocol_version,
                    weights,
                },
            ) => self.on_announce(identity, protocol_version, weights),
            (HandshakeState::Admission, HandshakeMessage::Ok) => self.on_admission_ok(),
            (HandshakeState::Acknowledged, HandshakeMessage::Ack) => self.succeed(),
            (HandshakeState::Success, msg) => {
                warn!(
                    "Ignoring {:?} on channel {} after handshake completed",
                    msg,
                    self.channel.id()
                );
            }
            (state, msg) => {
                if msg != HandshakeMessage::Deny {
                    warn!(
                        "Unexpected {:?} on channel {} in state {:?}",
                        msg,
                        self.channel.id(),
                        state
                    );
                }
                self.fail();
            }
        }
    }

    fn on_announce(&mut self, peer: MemberId, protocol_version: u32, peer_weights: WeightVector) {
        let Some(ctx) = self.ctx.upgrade() else {
            self.fail();
            return;
        };

        if protocol_version != PROTOCOL_VERSION {
            warn!(
                "Rejecting {}: protocol version {} (ours {})",
                peer, protocol_version, PROTOCOL_VERSION
            );
            self.fail();
            return;
        }
        if peer.same_location(&self.local) {
            warn!("Rejecting connection to self from {}", peer);
            self.fail();
            return;
        }
        if !ctx.is_valid_peer(&peer, &self.channel.remote_addr()) {
            warn!(
                "Rejecting {} from {}: not a configured group member",
                peer,
                self.channel.remote_addr()
            );
            self.fail();
            return;
        }

        ctx.retire_stale_member(&peer);

        self.high_priority = is_high_priority(&self.local_weights, &self.local, &peer_weights, &peer);
        debug!(
            "Channel {}: {} is {} priority against {}",
            self.channel.id(),
            self.local,
            if self.high_priority { "high" } else { "low" },
            peer
        );
        self.peer = Some(peer);
        self.transition(HandshakeState::Admission);

        if self.high_priority {
            if self.admit(&ctx) {
                self.send(HandshakeMessage::Ok);
            } else {
                self.send(HandshakeMessage::Deny);
                self.fail();
            }
        }
    }

    fn on_admission_ok(&mut self) {
        if !self.high_priority {
            let Some(ctx) = self.ctx.upgrade() else {
                self.fail();
                return;
            };
            if !self.admit(&ctx) {
                self.send(HandshakeMessage::Deny);
                self.fail();
                return;
            }
            if !self.send(HandshakeMessage::Ok) {
                return;
            }
        }
        self.acknowledge();
    }

    /// Insert the peer into the registry
    fn admit(&mut self, ctx: &Arc<C>) -> bool {
        let Some(peer) = self.peer.clone() else {
            return false;
        };
        let member = Arc::new(GroupMember::new(
            self.local.clone(),
            peer.clone(),
            Arc::clone(&self.channel),
            self.high_priority,
        ));
        if ctx.try_add_member(Arc::clone(&member)) {
            self.member = Some(member);
            true
        } else {
            info!(
                "{} is already a member, denying channel {}",
                peer,
                self.channel.id()
            );
            false
        }
    }

    fn acknowledge(&mut self) {
        let Some(member) = self.member.clone() else {
            self.fail();
            return;
        };
        self.transition(HandshakeState::Acknowledged);
        member.set_ready(true);
        self.outcome
            .send_replace(HandshakeOutcome::Admitted(member.peer_id().clone()));
        self.send(HandshakeMessage::Ack);
    }

    fn succeed(&mut self) {
        let (Some(ctx), Some(member)) = (self.ctx.upgrade(), self.member.clone()) else {
            self.fail();
            return;
        };
        self.transition(HandshakeState::Success);
        ctx.member_admitted(&member);
    }

    fn fail(&mut self) {
        if self.state == HandshakeState::Failure {
            return;
        }
        if self.state != HandshakeState::Success {
            metrics::record_handshake_failure();
        }
        self.transition(HandshakeState::Failure);
        self.outcome.send_replace(HandshakeOutcome::Failed);

        let ctx = self.ctx.upgrade();
        match (self.member.take(), &ctx) {
            (Some(member), Some(ctx)) => ctx.close_member(&member),
            _ => self.channel.close(),
        }
        if let Some(ctx) = ctx {
            ctx.handshake_finished(self.channel.id());
        }
    }
}

impl<C> fmt::Debug for Handshake<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handshake")
            .field("channel", &self.channel.id())
            .field("peer", &self.peer)
            .field("state", &self.state)
            .finish()
    }
}
