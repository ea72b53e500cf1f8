//! Type-safe identifiers for persisted broker state.
//!
//! These newtypes keep broker ids, message ids and destination names from
//! being mixed up even though several of them share the same underlying
//! representation.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a broker in the cluster.
///
/// Broker ids are opaque strings assigned by configuration (for example
/// `broker-1`). They are the keys of the shared broker table and the value
/// stored in a broker row's takeover marker.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BrokerId(pub String);

impl BrokerId {
    /// Create a new broker id.
    pub fn new(id: impl Into<String>) -> Self {
        BrokerId(id.into())
    }

    /// Borrow the raw id.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for BrokerId {
    fn from(value: &str) -> Self {
        BrokerId(value.to_string())
    }
}

impl From<String> for BrokerId {
    fn from(value: String) -> Self {
        BrokerId(value)
    }
}

impl fmt::Display for BrokerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A store session: one generation of ownership over a partition.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct SessionId(pub u64);

impl SessionId {
    #[inline]
    pub const fn new(value: u64) -> Self {
        SessionId(value)
    }

    #[inline]
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a partition of persisted state.
///
/// A partition is named after the store session that created it, so the
/// numeric value of a partition id and of its originating session are equal.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct PartitionId(pub u64);

impl PartitionId {
    #[inline]
    pub const fn new(value: u64) -> Self {
        PartitionId(value)
    }

    #[inline]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// The store session this partition belongs to.
    #[inline]
    pub const fn session(self) -> SessionId {
        SessionId(self.0)
    }
}

impl From<SessionId> for PartitionId {
    fn from(session: SessionId) -> Self {
        PartitionId(session.0)
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique name of a destination.
///
/// Queues and topics share one namespace, so the kind is encoded as a
/// prefix: `Q:orders` is the queue `orders`, `T:prices` the topic `prices`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DestinationId(pub String);

impl DestinationId {
    const QUEUE_PREFIX: &'static str = "Q:";
    const TOPIC_PREFIX: &'static str = "T:";

    pub fn queue(name: &str) -> Self {
        DestinationId(format!("{}{}", Self::QUEUE_PREFIX, name))
    }

    pub fn topic(name: &str) -> Self {
        DestinationId(format!("{}{}", Self::TOPIC_PREFIX, name))
    }

    /// Destination name without the kind prefix.
    pub fn name(&self) -> &str {
        self.0
            .strip_prefix(Self::QUEUE_PREFIX)
            .or_else(|| self.0.strip_prefix(Self::TOPIC_PREFIX))
            .unwrap_or(&self.0)
    }

    pub fn is_queue(&self) -> bool {
        self.0.starts_with(Self::QUEUE_PREFIX)
    }

    pub fn is_topic(&self) -> bool {
        self.0.starts_with(Self::TOPIC_PREFIX)
    }
}

impl fmt::Display for DestinationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// System message id, unique within a destination.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        MessageId(id.into())
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for MessageId {
    fn from(value: &str) -> Self {
        MessageId(value.to_string())
    }
}

impl From<String> for MessageId {
    fn from(value: String) -> Self {
        MessageId(value)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a consumer (or durable subscription) holding interest in
/// a message.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ConsumerId(pub u64);

impl ConsumerId {
    #[inline]
    pub const fn new(value: u64) -> Self {
        ConsumerId(value)
    }

    #[inline]
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a transaction.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct TransactionId(pub u64);

impl TransactionId {
    #[inline]
    pub const fn new(value: u64) -> Self {
        TransactionId(value)
    }

    #[inline]
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
