//! The per-partition store contract.
//!
//! A [`PartitionedStore`] owns the messages, consumer interest states,
//! destinations and transactions of one partition. Every broker has exactly
//! one primary partition; in partition mode it may hold further partitions
//! that can be migrated to other brokers.
//!
//! # Backends
//!
//! | Backend | Type | Data operations |
//! |---------|------|-----------------|
//! | `NoPersist` | [`NoPersistPartition`](super::NoPersistPartition) | `Unsupported` |
//! | `Memory` | [`MemoryPartition`](super::MemoryPartition) | in memory |
//! | `File` | [`MemoryPartition`](super::MemoryPartition) | in memory, journaled |
//!
//! # Conventions
//!
//! - `sync = true` returns only once the change is durable.
//! - Unknown ids fail with `NotFound`, duplicate creates with `Conflict`.
//! - Accessors return owned snapshots; mutating a returned value never
//!   changes stored state.
//! - Every call registers with the partition's drain guard for its whole
//!   duration and fails with `Closed` after [`close`](PartitionedStore::close).

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use super::config::StoreType;
use super::message::{ConsumerState, DestinationInfo, InterestState, Message, StorageInfo};
use super::transaction::{
    TransactionAck, TransactionBroker, TransactionInfo, TransactionState, TransactionUsage,
};
use crate::error::StoreResult;
use crate::types::{BrokerId, ConsumerId, DestinationId, MessageId, PartitionId, TransactionId};

pub trait PartitionedStore: Send + Sync + fmt::Debug {
    // -------------------------------------------------------------------------
    // Identity
    // -------------------------------------------------------------------------

    fn partition_id(&self) -> PartitionId;

    /// The owning broker's primary partition. Primary partitions never move.
    fn is_primary(&self) -> bool;

    fn backend(&self) -> StoreType;

    // -------------------------------------------------------------------------
    // Messages
    // -------------------------------------------------------------------------

    /// Store a message, optionally with the interest states of its consumers.
    ///
    /// Fails with `Conflict` if the destination already holds the id.
    fn store_message(
        &self,
        destination: &DestinationId,
        message: Message,
        states: Option<&[ConsumerState]>,
        sync: bool,
    ) -> StoreResult<()>;

    /// Remove a message and all of its interest states.
    ///
    /// With `on_rollback` a missing message is not an error: rollback may
    /// race with a removal that already happened.
    fn remove_message(
        &self,
        destination: &DestinationId,
        id: &MessageId,
        sync: bool,
        on_rollback: bool,
    ) -> StoreResult<()>;

    /// Move a message from `from` to `to`, replacing its interest states.
    ///
    /// The message ends up in exactly one of the two destinations: it is
    /// written to `to` first and removed from `from` second, and a failure
    /// of either step removes the partial copy from `to`.
    fn move_message(
        &self,
        message: Message,
        from: &DestinationId,
        to: &DestinationId,
        states: &[ConsumerState],
        sync: bool,
    ) -> StoreResult<()>;

    /// Remove every message of a destination, returning how many went.
    fn remove_all_messages(&self, destination: &DestinationId, sync: bool) -> StoreResult<usize>;

    fn message(&self, destination: &DestinationId, id: &MessageId) -> StoreResult<Message>;

    fn has_message(&self, destination: &DestinationId, id: &MessageId) -> StoreResult<bool>;

    /// Messages of a destination ordered by timestamp.
    fn messages(&self, destination: &DestinationId) -> StoreResult<Vec<Message>>;

    fn message_count(&self, destination: &DestinationId) -> StoreResult<u64>;

    fn message_storage_info(&self, destination: &DestinationId) -> StoreResult<StorageInfo>;

    /// Every stored message as `(destination, message)`.
    fn all_message_locations(&self) -> StoreResult<Vec<(DestinationId, MessageId)>>;

    // -------------------------------------------------------------------------
    // Interest states
    // -------------------------------------------------------------------------

    /// Add consumers to a stored message. Fails with `Conflict` if any of
    /// them is already present, in which case nothing is added.
    fn store_interest_states(
        &self,
        destination: &DestinationId,
        id: &MessageId,
        states: &[ConsumerState],
        sync: bool,
    ) -> StoreResult<()>;

    /// Advance one consumer's state. Returns true if the message was removed.
    ///
    /// States only move forward; setting the current state again is a no-op.
    /// When `is_last_ack` is set and every consumer is acknowledged, the
    /// message is removed, or, if `txn` is still open, marked for removal at
    /// commit.
    #[allow(clippy::too_many_arguments)]
    fn update_interest_state(
        &self,
        destination: &DestinationId,
        id: &MessageId,
        consumer: ConsumerId,
        state: InterestState,
        sync: bool,
        txn: Option<TransactionId>,
        is_last_ack: bool,
    ) -> StoreResult<bool>;

    fn interest_state(
        &self,
        destination: &DestinationId,
        id: &MessageId,
        consumer: ConsumerId,
    ) -> StoreResult<InterestState>;

    fn interest_states(
        &self,
        destination: &DestinationId,
        id: &MessageId,
    ) -> StoreResult<Vec<ConsumerState>>;

    /// True if at least one consumer acknowledged the message.
    fn has_message_been_acked(&self, destination: &DestinationId, id: &MessageId)
    -> StoreResult<bool>;

    // -------------------------------------------------------------------------
    // Destinations
    // -------------------------------------------------------------------------

    fn store_destination(&self, info: DestinationInfo, sync: bool) -> StoreResult<()>;

    fn update_destination(&self, info: DestinationInfo, sync: bool) -> StoreResult<()>;

    /// Remove a destination together with its messages.
    fn remove_destination(&self, id: &DestinationId, sync: bool) -> StoreResult<()>;

    fn destination(&self, id: &DestinationId) -> StoreResult<DestinationInfo>;

    fn all_destinations(&self) -> StoreResult<Vec<DestinationInfo>>;

    // -------------------------------------------------------------------------
    // Transactions
    // -------------------------------------------------------------------------

    fn store_transaction(
        &self,
        id: TransactionId,
        state: TransactionState,
        sync: bool,
    ) -> StoreResult<()>;

    fn store_cluster_transaction(
        &self,
        id: TransactionId,
        state: TransactionState,
        participants: Vec<TransactionBroker>,
        sync: bool,
    ) -> StoreResult<()>;

    /// Record a transaction owned by `home_broker`. Only its acknowledgements
    /// are kept here.
    fn store_remote_transaction(
        &self,
        id: TransactionId,
        state: TransactionState,
        acks: Vec<TransactionAck>,
        home_broker: BrokerId,
        sync: bool,
    ) -> StoreResult<()>;

    /// Remove a transaction. Without `remove_acks` a transaction that still
    /// has acknowledgements is kept. A cluster transaction is kept until all
    /// participants completed.
    fn remove_transaction(&self, id: TransactionId, remove_acks: bool, sync: bool)
    -> StoreResult<()>;

    /// Move a local or cluster transaction to `state`.
    ///
    /// Committing removes the messages whose last acknowledgement was made
    /// under the transaction; rolling back returns those acknowledgements to
    /// `Delivered`.
    fn update_transaction_state(
        &self,
        id: TransactionId,
        state: TransactionState,
        sync: bool,
    ) -> StoreResult<()>;

    /// Replace the participant list of a cluster transaction.
    fn update_cluster_transaction(
        &self,
        id: TransactionId,
        participants: Vec<TransactionBroker>,
        sync: bool,
    ) -> StoreResult<()>;

    /// Mark `broker` as completed, provided the transaction is in `expected`.
    fn update_cluster_transaction_broker_state(
        &self,
        id: TransactionId,
        expected: TransactionState,
        broker: &BrokerId,
        sync: bool,
    ) -> StoreResult<()>;

    /// Apply the home broker's decision to a remote transaction.
    fn update_remote_transaction(
        &self,
        id: TransactionId,
        state: TransactionState,
        acks: Vec<TransactionAck>,
        home_broker: BrokerId,
        sync: bool,
    ) -> StoreResult<()>;

    fn transaction_state(&self, id: TransactionId) -> StoreResult<TransactionState>;

    fn transaction_info(&self, id: TransactionId) -> StoreResult<TransactionInfo>;

    fn cluster_transaction_brokers(&self, id: TransactionId)
    -> StoreResult<Vec<TransactionBroker>>;

    fn remote_transaction_home_broker(&self, id: TransactionId) -> StoreResult<Option<BrokerId>>;

    fn all_transactions(&self) -> StoreResult<Vec<TransactionInfo>>;

    /// States of local and cluster transactions.
    fn all_transaction_states(&self) -> StoreResult<HashMap<TransactionId, TransactionState>>;

    fn all_remote_transaction_states(
        &self,
    ) -> StoreResult<HashMap<TransactionId, TransactionState>>;

    fn transaction_usage(&self, id: TransactionId) -> StoreResult<TransactionUsage>;

    // -------------------------------------------------------------------------
    // Transaction acknowledgements
    // -------------------------------------------------------------------------

    fn store_transaction_ack(
        &self,
        id: TransactionId,
        ack: TransactionAck,
        sync: bool,
    ) -> StoreResult<()>;

    fn remove_transaction_acks(&self, id: TransactionId, sync: bool) -> StoreResult<()>;

    fn transaction_acks(&self, id: TransactionId) -> StoreResult<Vec<TransactionAck>>;

    fn all_transaction_acks(&self) -> StoreResult<HashMap<TransactionId, Vec<TransactionAck>>>;

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Stop admitting calls and wait for in-flight ones to finish.
    fn close(&self);

    fn is_closed(&self) -> bool;

    /// Key/value summary for diagnostics.
    fn debug_state(&self) -> BTreeMap<String, String>;
}
