//! Fencing ("zap") of members suspected of breaking cluster invariants

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use cohort_core::types::{GroupPayload, MemberId, MessageKind, WeightGenerator, WeightVector};

/// Reason codes carried by a zap request
pub mod codes {
    pub const COMMUNICATION_ERROR: i32 = 1;
    pub const PROGRAM_ERROR: i32 = 2;
    pub const NODE_JOINED_WITH_DIRTY_DB: i32 = 3;
    pub const COMMUNICATION_TO_ACTIVE_ERROR: i32 = 4;
    pub const SPLIT_BRAIN: i32 = 255;

    pub fn describe(code: i32) -> &'static str {
        match code {
            COMMUNICATION_ERROR => "COMMUNICATION_ERROR",
            PROGRAM_ERROR => "PROGRAM_ERROR",
            NODE_JOINED_WITH_DIRTY_DB => "NODE_JOINED_WITH_DIRTY_DB",
            COMMUNICATION_TO_ACTIVE_ERROR => "COMMUNICATION_TO_ACTIVE_ERROR",
            SPLIT_BRAIN => "SPLIT_BRAIN",
            _ => "UNKNOWN",
        }
    }
}

/// Request asking a member to take itself out of the group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZapRequest {
    pub code: i32,
    pub reason: String,
    /// Weights of the requesting node at the time of the request
    pub weights: WeightVector,
}

impl GroupPayload for ZapRequest {
    const KIND: MessageKind = MessageKind::from_static("cohort.zap");
}

/// Observer of incoming zap requests
pub trait ZapEventListener: Send + Sync {
    fn fire_zap_event(&self, from: &MemberId, code: i32, reason: &str);
}

impl<F> ZapEventListener for F
where
    F: Fn(&MemberId, i32, &str) + Send + Sync,
{
    fn fire_zap_event(&self, from: &MemberId, code: i32, reason: &str) {
        self(from, code, reason)
    }
}

/// Policy consulted when fencing members
pub trait ZapNodeRequestProcessor: Send + Sync {
    /// Whether a zap request to `target` may go out
    fn accept_outgoing_zap_node_request(&self, target: &MemberId, code: i32, reason: &str) -> bool;

    /// Handle a zap request received from `from`
    fn incoming_zap_node_request(
        &self,
        from: &MemberId,
        code: i32,
        reason: &str,
        weights: &WeightVector,
    );

    /// Weights to put on outgoing requests
    fn current_node_weights(&self) -> WeightVector;

    fn add_zap_event_listener(&self, listener: Arc<dyn ZapEventListener>);
}

/// Exit hook taking the reason code
pub type ExitHook = Arc<dyn Fn(i32) + Send + Sync>;

/// Accepts every outgoing request and exits the process on an incoming one
pub struct DefaultZapNodeRequestProcessor {
    weights: Arc<dyn WeightGenerator>,
    listeners: RwLock<Vec<Arc<dyn ZapEventListener>>>,
    exit: ExitHook,
}

impl DefaultZapNodeRequestProcessor {
    pub fn new(weights: Arc<dyn WeightGenerator>) -> Self {
        Self::with_exit_hook(weights, Arc::new(|code| std::process::exit(code)))
    }

    pub fn with_exit_hook(weights: Arc<dyn WeightGenerator>, exit: ExitHook) -> Self {
        Self {
            weights,
            listeners: RwLock::new(Vec::new()),
            exit,
        }
    }
}

impl ZapNodeRequestProcessor for DefaultZapNodeRequestProcessor {
    fn accept_outgoing_zap_node_request(&self, _target: &MemberId, _code: i32, _reason: &str) -> bool {
        true
    }

    fn incoming_zap_node_request(
        &self,
        from: &MemberId,
        code: i32,
        reason: &str,
        weights: &WeightVector,
    ) {
        error!(
            "Fenced by {} ({}): {} [their weights {}, ours {}]",
            from,
            codes::describe(code),
            reason,
            weights,
            self.weights.generate()
        );
        for listener in self.listeners.read().iter() {
            listener.fire_zap_event(from, code, reason);
        }
        info!("Exiting with code {}", code);
        (self.exit)(code);
    }

    fn current_node_weights(&self) -> WeightVector {
        self.weights.generate()
    }

    fn add_zap_event_listener(&self, listener: Arc<dyn ZapEventListener>) {
        self.listeners.write().push(listener);
    }
}

impl fmt::Debug for DefaultZapNodeRequestProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DefaultZapNodeRequestProcessor")
            .field("listeners", &self.listeners.read().len())
            .finish()
    }
}
