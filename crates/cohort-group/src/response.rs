//! Correlated response collection for synchronous sends

use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use cohort_core::types::{GroupMessage, MemberId, MessageId};

use crate::error::{GroupError, GroupResult};

/// What the registry knows about an awaited responder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberState {
    /// No longer a member
    Missing,
    /// Member whose channel is open
    Live,
    /// Member whose channel can no longer deliver
    NoReceiver,
}

/// Registry view used while waiting
pub trait MemberLiveness: Send + Sync {
    fn member_state(&self, id: &MemberId) -> MemberState;

    /// Tear down a member that can no longer answer
    fn close_dead(&self, id: &MemberId);
}

#[derive(Default)]
struct ResponseState {
    waiting_for: HashSet<MemberId>,
    responses: Vec<GroupMessage>,
    dead: Vec<MemberId>,
    done: bool,
}

/// Responses awaited for one outgoing request.
///
/// The set of awaited members only shrinks: a member leaves it by answering
/// or by being declared dead, so once the wait completes every expected
/// member is accounted for exactly once.
pub struct GroupResponse {
    request_id: MessageId,
    state: Mutex<ResponseState>,
    notify: Notify,
}

impl GroupResponse {
    pub fn new(request_id: MessageId, expected: impl IntoIterator<Item = MemberId>) -> Self {
        Self {
            request_id,
            state: Mutex::new(ResponseState {
                waiting_for: expected.into_iter().collect(),
                ..Default::default()
            }),
            notify: Notify::new(),
        }
    }

    pub fn request_id(&self) -> MessageId {
        self.request_id
    }

    /// Members that have neither answered nor died yet
    pub fn outstanding(&self) -> Vec<MemberId> {
        self.state.lock().waiting_for.iter().cloned().collect()
    }

    pub fn is_complete(&self) -> bool {
        self.state.lock().waiting_for.is_empty()
    }

    pub fn add_response_from(&self, from: &MemberId, msg: GroupMessage) -> GroupResult<()> {
        let mut state = self.state.lock();
        if !state.waiting_for.remove(from) {
            error!(
                "Response to {} from {} which is not awaited",
                self.request_id, from
            );
            return Err(GroupError::UnexpectedResponse { from: from.clone() });
        }
        state.responses.push(msg);
        let complete = state.waiting_for.is_empty();
        drop(state);

        if complete {
            self.notify.notify_waiters();
        }
        Ok(())
    }

    pub fn notify_member_dead(&self, id: &MemberId) {
        let mut state = self.state.lock();
        if state.waiting_for.remove(id) {
            debug!("Request {}: {} is gone", self.request_id, id);
            state.dead.push(id.clone());
        }
        let complete = state.waiting_for.is_empty();
        drop(state);

        if complete {
            self.notify.notify_waiters();
        }
    }

    /// Suspend until every awaited member answered or died.
    ///
    /// Every `recheck` the outstanding members are validated against the
    /// registry: members that left are written off and members whose
    /// channel is gone are closed. Without a `limit` there is no deadline.
    pub async fn wait_for_responses(
        &self,
        liveness: &dyn MemberLiveness,
        recheck: Duration,
        limit: Option<Duration>,
        cancel: &CancellationToken,
    ) -> GroupResult<()> {
        let deadline = limit.map(|l| Instant::now() + l);

        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_complete() {
                self.state.lock().done = true;
                return Ok(());
            }
            if cancel.is_cancelled() {
                return Err(GroupError::Stopped);
            }

            let window = match deadline {
                Some(deadline) => {
                    let left = deadline.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        let missing = self.outstanding();
                        warn!(
                            "Gave up waiting for responses to {} from {:?}",
                            self.request_id, missing
                        );
                        return Err(GroupError::ResponseTimeout { missing });
                    }
                    recheck.min(left)
                }
                None => recheck,
            };

            tokio::select! {
                _ = &mut notified => continue,
                _ = cancel.cancelled() => return Err(GroupError::Stopped),
                _ = tokio::time::sleep(window) => {}
            }

            self.revalidate(liveness);
        }
    }

    fn revalidate(&self, liveness: &dyn MemberLiveness) {
        let outstanding = self.outstanding();
        if outstanding.is_empty() {
            return;
        }
        info!(
            "Still waiting for responses to {} from {:?}",
            self.request_id, outstanding
        );

        for id in outstanding {
            match liveness.member_state(&id) {
                MemberState::Live => {}
                MemberState::Missing => {
                    warn!("{} is no longer a member, not waiting for it", id);
                    self.notify_member_dead(&id);
                }
                MemberState::NoReceiver => {
                    warn!("{} has no receiver, closing it", id);
                    liveness.close_dead(&id);
                    self.notify_member_dead(&id);
                }
            }
        }
    }

    pub fn responses(&self) -> GroupResult<Vec<GroupMessage>> {
        let state = self.completed()?;
        Ok(state.responses.clone())
    }

    pub fn response_from(&self, id: &MemberId) -> GroupResult<Option<GroupMessage>> {
        let state = self.completed()?;
        Ok(state
            .responses
            .iter()
            .find(|m| m.sender() == Some(id))
            .cloned())
    }

    pub fn dead_members(&self) -> GroupResult<Vec<MemberId>> {
        let state = self.completed()?;
        Ok(state.dead.clone())
    }

    fn completed(&self) -> GroupResult<parking_lot::MutexGuard<'_, ResponseState>> {
        let state = self.state.lock();
        if !state.done {
            return Err(GroupError::ResponsesPending(state.waiting_for.len()));
        }
        Ok(state)
    }
}

impl fmt::Debug for GroupResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("GroupResponse")
            .field("request_id", &self.request_id)
            .field("waiting_for", &state.waiting_for.len())
            .field("responses", &state.responses.len())
            .field("dead", &state.dead.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;

    use cohort_core::types::MessageKind;

    #[derive(Default)]
    struct FakeRegistry {
        states: Mutex<HashMap<MemberId, MemberState>>,
        closed: Mutex<Vec<MemberId>>,
    }

    impl MemberLiveness for FakeRegistry {
        fn member_state(&self, id: &MemberId) -> MemberState {
            self.states
                .lock()
                .get(id)
                .copied()
                .unwrap_or(MemberState::Missing)
        }

        fn close_dead(&self, id: &MemberId) {
            self.closed.lock().push(id.clone());
        }
    }

    fn reply_from(from: &MemberId) -> GroupMessage {
        let mut msg = GroupMessage::raw(MessageKind::from_static("test.reply"), serde_json::json!({}));
        msg.set_sender(from.clone());
        msg
    }

    #[tokio::test]
    async fn test_all_respond() {
        let a = MemberId::new("a:1");
        let b = MemberId::new("b:1");
        let response = Arc::new(GroupResponse::new(MessageId::new(), [a.clone(), b.clone()]));
        let registry = FakeRegistry::default();

        assert!(matches!(
            response.responses(),
            Err(GroupError::ResponsesPending(2))
        ));

        let responder = Arc::clone(&response);
        let (ra, rb) = (a.clone(), b.clone());
        tokio::spawn(async move {
            responder.add_response_from(&ra, reply_from(&ra)).unwrap();
            responder.add_response_from(&rb, reply_from(&rb)).unwrap();
        });

        response
            .wait_for_responses(&registry, Duration::from_secs(5), None, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(response.responses().unwrap().len(), 2);
        assert!(response.response_from(&a).unwrap().is_some());
        assert!(response.dead_members().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unexpected_responder() {
        let a = MemberId::new("a:1");
        let response = GroupResponse::new(MessageId::new(), [a.clone()]);
        let stranger = MemberId::new("x:1");

        assert!(matches!(
            response.add_response_from(&stranger, reply_from(&stranger)),
            Err(GroupError::UnexpectedResponse { .. })
        ));
        response.add_response_from(&a, reply_from(&a)).unwrap();
        assert!(matches!(
            response.add_response_from(&a, reply_from(&a)),
            Err(GroupError::UnexpectedResponse { .. })
        ));
    }

    #[tokio::test]
    async fn test_dead_member_accounted() {
        let a = MemberId::new("a:1");
        let b = MemberId::new("b:1");
        let response = GroupResponse::new(MessageId::new(), [a.clone(), b.clone()]);
        let registry = FakeRegistry::default();

        response.add_response_from(&a, reply_from(&a)).unwrap();
        response.notify_member_dead(&b);
        response.notify_member_dead(&a);

        response
            .wait_for_responses(&registry, Duration::from_secs(5), None, &CancellationToken::new())
            .await
            .unwrap();

        let responses = response.responses().unwrap();
        let dead = response.dead_members().unwrap();
        assert_eq!(responses.len() + dead.len(), 2);
        assert_eq!(dead, vec![b]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recheck_closes_member_without_receiver() {
        let a = MemberId::new("a:1");
        let b = MemberId::new("b:1");
        let response = GroupResponse::new(MessageId::new(), [a.clone(), b.clone()]);
        let registry = FakeRegistry::default();
        registry.states.lock().insert(a.clone(), MemberState::NoReceiver);

        response
            .wait_for_responses(&registry, Duration::from_secs(5), None, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(*registry.closed.lock(), vec![a.clone()]);
        let mut dead = response.dead_members().unwrap();
        dead.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(dead, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_optional_deadline() {
        let a = MemberId::new("a:1");
        let response = GroupResponse::new(MessageId::new(), [a.clone()]);
        let registry = FakeRegistry::default();
        registry.states.lock().insert(a.clone(), MemberState::Live);

        let result = response
            .wait_for_responses(
                &registry,
                Duration::from_secs(5),
                Some(Duration::from_secs(12)),
                &CancellationToken::new(),
            )
            .await;

        match result {
            Err(GroupError::ResponseTimeout { missing }) => assert_eq!(missing, vec![a]),
            other => panic!("Unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stop_ends_wait() {
        let a = MemberId::new("a:1");
        let response = GroupResponse::new(MessageId::new(), [a]);
        let registry = FakeRegistry::default();
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert!(matches!(
            response
                .wait_for_responses(&registry, Duration::from_secs(5), None, &cancel)
                .await,
            Err(GroupError::Stopped)
        ));
    }
}
