//! Group message envelope
//!
//! Every application message travels in a [`GroupMessage`] envelope tagged
//! with a stable [`MessageKind`]. Listeners are keyed by kind and hydrate the
//! payload into its concrete type with [`GroupMessage::payload`].

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use uuid::Uuid;

use super::member::MemberId;
use crate::error::{Error, Result};

/// Correlation id of a group message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable wire tag naming a payload type
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageKind(Cow<'static, str>);

impl MessageKind {
    pub const fn from_static(kind: &'static str) -> Self {
        Self(Cow::Borrowed(kind))
    }

    pub fn new(kind: impl Into<String>) -> Self {
        Self(Cow::Owned(kind.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A payload type that can travel inside a [`GroupMessage`]
pub trait GroupPayload: Serialize + DeserializeOwned + Send + 'static {
    const KIND: MessageKind;
}

/// Envelope for application messages exchanged between members
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupMessage {
    kind: MessageKind,
    id: MessageId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    in_response_to: Option<MessageId>,
    /// Filled in by the receiving side, never sent
    #[serde(skip)]
    sender: Option<MemberId>,
    payload: serde_json::Value,
}

impl GroupMessage {
    /// Wrap a typed payload in a fresh envelope
    pub fn new<T: GroupPayload>(payload: &T) -> Result<Self> {
        Ok(Self::raw(T::KIND, serde_json::to_value(payload)?))
    }

    /// Build an envelope from an already encoded payload
    pub fn raw(kind: MessageKind, payload: serde_json::Value) -> Self {
        Self {
            kind,
            id: MessageId::new(),
            in_response_to: None,
            sender: None,
            payload,
        }
    }

    /// Build a response correlated with `request`
    pub fn response_to<T: GroupPayload>(request: &GroupMessage, payload: &T) -> Result<Self> {
        let mut msg = Self::new(payload)?;
        msg.in_response_to = Some(request.id);
        Ok(msg)
    }

    pub fn kind(&self) -> &MessageKind {
        &self.kind
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    pub fn in_response_to(&self) -> Option<MessageId> {
        self.in_response_to
    }

    /// Member this message was received from
    pub fn sender(&self) -> Option<&MemberId> {
        self.sender.as_ref()
    }

    pub fn set_sender(&mut self, sender: MemberId) {
        self.sender = Some(sender);
    }

    pub fn payload_value(&self) -> &serde_json::Value {
        &self.payload
    }

    /// Hydrate the payload into its concrete type
    pub fn payload<T: GroupPayload>(&self) -> Result<T> {
        if self.kind != T::KIND {
            return Err(Error::KindMismatch {
                expected: T::KIND.to_string(),
                got: self.kind.to_string(),
            });
        }
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}
