//! Messages, destinations and per-consumer interest state.

use bytes::Bytes;
use num_derive::FromPrimitive;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{StoreError, StoreResult};
use crate::types::{ConsumerId, DestinationId, MessageId};

/// A persisted message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub payload: Bytes,
    pub properties: BTreeMap<String, String>,
    pub timestamp_ms: i64,
    pub persistent: bool,
}

impl Message {
    pub fn new(id: impl Into<MessageId>, payload: impl Into<Bytes>) -> Self {
        Self {
            id: id.into(),
            payload: payload.into(),
            properties: BTreeMap::new(),
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            persistent: true,
        }
    }

    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    /// Bytes charged against destination limits.
    pub fn size(&self) -> u64 {
        self.payload.len() as u64
    }
}

/// Delivery state of a message for one consumer.
///
/// States only move forward: `Routed -> Delivered -> Acknowledged`.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    FromPrimitive,
    Serialize,
    Deserialize,
)]
pub enum InterestState {
    Routed = 0,
    Delivered = 1,
    Acknowledged = 2,
}

impl InterestState {
    /// Whether `next` is reachable from `self`. Staying put is allowed.
    pub fn can_advance_to(self, next: InterestState) -> bool {
        next >= self
    }

    pub fn is_acknowledged(self) -> bool {
        self == InterestState::Acknowledged
    }
}

/// A consumer and its delivery state for one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerState {
    pub consumer: ConsumerId,
    pub state: InterestState,
}

impl ConsumerState {
    pub fn new(consumer: ConsumerId, state: InterestState) -> Self {
        Self { consumer, state }
    }

    pub fn routed(consumer: ConsumerId) -> Self {
        Self::new(consumer, InterestState::Routed)
    }
}

/// Reject state lists that mention the same consumer twice.
pub(crate) fn check_unique_consumers(
    message: &MessageId,
    states: &[ConsumerState],
) -> StoreResult<()> {
    for (i, s) in states.iter().enumerate() {
        if states[..i].iter().any(|p| p.consumer == s.consumer) {
            return Err(StoreError::BadRequest(format!(
                "consumer {} listed twice for message {}",
                s.consumer, message
            )));
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DestinationKind {
    Queue,
    Topic,
}

/// Limits enforced when storing messages into a destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DestinationLimits {
    pub max_messages: Option<u64>,
    pub max_bytes: Option<u64>,
}

/// Persisted destination descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationInfo {
    pub id: DestinationId,
    pub kind: DestinationKind,
    pub temporary: bool,
    pub limits: DestinationLimits,
    pub created_at_ms: i64,
}

impl DestinationInfo {
    pub fn queue(name: &str) -> Self {
        Self::new(DestinationId::queue(name), DestinationKind::Queue)
    }

    pub fn topic(name: &str) -> Self {
        Self::new(DestinationId::topic(name), DestinationKind::Topic)
    }

    fn new(id: DestinationId, kind: DestinationKind) -> Self {
        Self {
            id,
            kind,
            temporary: false,
            limits: DestinationLimits::default(),
            created_at_ms: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn with_limits(mut self, limits: DestinationLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn temporary(mut self) -> Self {
        self.temporary = true;
        self
    }
}

/// Message count and byte usage of a destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StorageInfo {
    pub message_count: u64,
    pub byte_count: u64,
}
