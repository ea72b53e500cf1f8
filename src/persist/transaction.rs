//! Transaction lifecycle and classification.
//!
//! # State Transitions
//!
//! ```text
//! Created -> Started -> { Failed | Incomplete | Complete } -> Prepared -> Committed
//!               |                     |                          |
//!               +---------------------+--------------------------+--> RolledBack
//! ```
//!
//! `Committed` and `RolledBack` are terminal. Commit is only legal from
//! `Prepared`; rollback is legal from every state between `Started` and
//! `Prepared`. The allowed moves are listed explicitly in
//! [`TransactionState::successors`] rather than derived from ordinals.
//!
//! # Classification
//!
//! - **Local**: owned and decided by this broker.
//! - **Cluster**: decided by this broker, with participant brokers tracked as
//!   [`TransactionBroker`] entries. The transaction is resolved only when every
//!   participant reports completion.
//! - **Remote**: owned by another (home) broker. Only the acknowledgements and
//!   the home broker address are kept here; the local broker never decides
//!   the outcome.

use num_derive::FromPrimitive;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{StoreError, StoreResult};
use crate::types::{BrokerId, ConsumerId, DestinationId, MessageId, SessionId, TransactionId};

/// State of a transaction.
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
pub enum TransactionState {
    Created = 0,
    Started = 1,
    Failed = 2,
    Incomplete = 3,
    Complete = 4,
    Prepared = 5,
    Committed = 6,
    RolledBack = 7,
}

impl TransactionState {
    /// States reachable in one step.
    pub fn successors(self) -> &'static [TransactionState] {
        use TransactionState::*;
        match self {
            Created => &[Started],
            Started => &[Failed, Incomplete, Complete, RolledBack],
            Failed | Incomplete | Complete => &[Prepared, RolledBack],
            Prepared => &[Committed, RolledBack],
            Committed | RolledBack => &[],
        }
    }

    pub fn can_transition_to(self, next: TransactionState) -> bool {
        self.successors().contains(&next)
    }

    pub fn is_terminal(self) -> bool {
        self.successors().is_empty()
    }

    /// Fail with `InvalidTransition` unless `from -> to` is allowed.
    pub fn check_transition(
        txn: TransactionId,
        from: TransactionState,
        to: TransactionState,
    ) -> StoreResult<()> {
        if from.can_transition_to(to) {
            Ok(())
        } else {
            Err(StoreError::InvalidTransition { txn, from, to })
        }
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransactionState::Created => "CREATED",
            TransactionState::Started => "STARTED",
            TransactionState::Failed => "FAILED",
            TransactionState::Incomplete => "INCOMPLETE",
            TransactionState::Complete => "COMPLETE",
            TransactionState::Prepared => "PREPARED",
            TransactionState::Committed => "COMMITTED",
            TransactionState::RolledBack => "ROLLEDBACK",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionType {
    Local,
    Cluster,
    Remote,
}

/// A participant of a cluster transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionBroker {
    pub broker: BrokerId,
    /// Store session of the participant when the transaction was recorded.
    pub session: Option<SessionId>,
    pub completed: bool,
}

impl TransactionBroker {
    pub fn new(broker: BrokerId) -> Self {
        Self {
            broker,
            session: None,
            completed: false,
        }
    }

    pub fn completed(mut self) -> Self {
        self.completed = true;
        self
    }
}

/// A message consumed inside a transaction but not yet committed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransactionAck {
    pub destination: DestinationId,
    pub message: MessageId,
    pub consumer: ConsumerId,
}

impl TransactionAck {
    pub fn new(destination: DestinationId, message: MessageId, consumer: ConsumerId) -> Self {
        Self {
            destination,
            message,
            consumer,
        }
    }
}

/// Snapshot of a persisted transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionInfo {
    pub id: TransactionId,
    pub state: TransactionState,
    pub kind: TransactionType,
    /// Participants. Empty unless `kind` is `Cluster`.
    pub participants: Vec<TransactionBroker>,
    /// Owning broker. Set only when `kind` is `Remote`.
    pub home_broker: Option<BrokerId>,
    pub created_at_ms: i64,
}

impl TransactionInfo {
    pub fn local(id: TransactionId, state: TransactionState) -> Self {
        Self {
            id,
            state,
            kind: TransactionType::Local,
            participants: Vec::new(),
            home_broker: None,
            created_at_ms: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn cluster(
        id: TransactionId,
        state: TransactionState,
        participants: Vec<TransactionBroker>,
    ) -> Self {
        Self {
            kind: TransactionType::Cluster,
            participants,
            ..Self::local(id, state)
        }
    }

    pub fn remote(id: TransactionId, state: TransactionState, home_broker: BrokerId) -> Self {
        Self {
            kind: TransactionType::Remote,
            home_broker: Some(home_broker),
            ..Self::local(id, state)
        }
    }

    /// True once every participant reported completion. Always true for
    /// non-cluster transactions.
    pub fn all_participants_completed(&self) -> bool {
        self.participants.iter().all(|p| p.completed)
    }

    pub fn incomplete_participants(&self) -> impl Iterator<Item = &TransactionBroker> {
        self.participants.iter().filter(|p| !p.completed)
    }
}

/// Counts of state referencing a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransactionUsage {
    /// Messages whose removal waits for this transaction to commit.
    pub pending_removals: usize,
    /// Acknowledgements recorded under this transaction.
    pub acks: usize,
}
