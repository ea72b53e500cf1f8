//! In-memory partition data and the partition handle over it.
//!
//! [`PartitionData`] is the persisted state of one partition and lives in the
//! shared [`StoreDatabase`]; it outlives any broker that opens it.
//! [`MemoryPartition`] is one broker's open handle on that data.
//!
//! # Locking
//!
//! Each table is a `DashMap`, so operations on distinct keys run in
//! parallel and operations on the same key serialize on its shard lock.
//! Nested locks are always taken in the order
//!
//! ```text
//! journal gate -> ownership gate -> destinations -> messages -> transactions
//! ```
//!
//! and never two entries of the same map at once.
//!
//! # Fencing
//!
//! A handle remembers the partition epoch it was opened at. Ownership moves
//! bump the epoch, after which writes through the old handle fail with
//! `Fenced`. Writes check the epoch under the shared side of the ownership
//! gate and the bump takes the exclusive side, so no write that passed the
//! check lands after the owner switch.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::debug;

use super::config::StoreType;
use super::database::StoreDatabase;
use super::drain::DrainGuard;
use super::message::{
    ConsumerState, DestinationInfo, InterestState, Message, StorageInfo, check_unique_consumers,
};
use super::metrics;
use super::partition::PartitionedStore;
use super::sync::{read, write};
use super::transaction::{
    TransactionAck, TransactionBroker, TransactionInfo, TransactionState, TransactionType,
    TransactionUsage,
};
use super::txn_log::{AppendScope, LogRecord, PartitionSnapshot};
use crate::error::{Entity, Status, StoreError, StoreResult};
use crate::types::{BrokerId, ConsumerId, DestinationId, MessageId, PartitionId, TransactionId};

/// Interest of one consumer in one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterestEntry {
    pub state: InterestState,
    /// Transaction the acknowledgement was made under.
    pub ack_txn: Option<TransactionId>,
}

/// A stored message with its consumers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub message: Message,
    pub interests: BTreeMap<ConsumerId, InterestEntry>,
    /// Fully acknowledged; removed when this transaction commits.
    pub pending_removal: Option<TransactionId>,
}

impl MessageRecord {
    fn new(message: Message, states: &[ConsumerState]) -> Self {
        let interests = states
            .iter()
            .map(|s| {
                (
                    s.consumer,
                    InterestEntry {
                        state: s.state,
                        ack_txn: None,
                    },
                )
            })
            .collect();
        Self {
            message,
            interests,
            pending_removal: None,
        }
    }

    fn references(&self, txn: TransactionId) -> bool {
        self.pending_removal == Some(txn) || self.interests.values().any(|i| i.ack_txn == Some(txn))
    }
}

/// A stored transaction with its acknowledgements.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub info: TransactionInfo,
    pub acks: Vec<TransactionAck>,
}

#[derive(Debug, Clone)]
struct DestinationEntry {
    info: DestinationInfo,
    usage: StorageInfo,
}

type MessageKey = (DestinationId, MessageId);

fn message_key(destination: &DestinationId, id: &MessageId) -> MessageKey {
    (destination.clone(), id.clone())
}

fn message_not_found(destination: &DestinationId, id: &MessageId) -> StoreError {
    StoreError::not_found(Entity::Message, format!("{}/{}", destination, id))
}

fn log_with(
    journal: Option<&AppendScope<'_>>,
    sync: bool,
    record: impl FnOnce() -> LogRecord,
) -> StoreResult<()> {
    match journal {
        Some(scope) => scope.append(&record(), sync),
        None => Ok(()),
    }
}

fn check_capacity(
    dest: &DestinationEntry,
    destination: &DestinationId,
    size: u64,
) -> StoreResult<()> {
    let limits = dest.info.limits;
    let full = match (limits.max_messages, limits.max_bytes) {
        (Some(max), _) if dest.usage.message_count >= max => {
            Some(format!("message limit {} reached", max))
        }
        (_, Some(max)) if dest.usage.byte_count + size > max => {
            Some(format!("byte limit {} reached", max))
        }
        _ => None,
    };
    match full {
        Some(reason) => Err(StoreError::DestinationFull {
            destination: destination.clone(),
            reason,
        }),
        None => Ok(()),
    }
}

/// Persisted state of one partition.
#[derive(Debug)]
pub struct PartitionData {
    id: PartitionId,
    epoch: AtomicU64,
    owner_gate: RwLock<()>,
    destinations: DashMap<DestinationId, DestinationEntry>,
    messages: DashMap<MessageKey, MessageRecord>,
    transactions: DashMap<TransactionId, TransactionRecord>,
}

impl PartitionData {
    pub(crate) fn new(id: PartitionId) -> Self {
        Self {
            id,
            epoch: AtomicU64::new(0),
            owner_gate: RwLock::new(()),
            destinations: DashMap::new(),
            messages: DashMap::new(),
            transactions: DashMap::new(),
        }
    }

    pub fn id(&self) -> PartitionId {
        self.id
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Invalidate every handle opened so far. Waits for writes that already
    /// passed their epoch check.
    pub(crate) fn bump_epoch(&self) -> u64 {
        let _gate = write(&self.owner_gate);
        self.epoch.fetch_add(1, Ordering::AcqRel) + 1
    }

    // =========================================================================
    // Messages
    // =========================================================================

    fn store_message(
        &self,
        journal: Option<&AppendScope<'_>>,
        destination: &DestinationId,
        message: Message,
        states: &[ConsumerState],
        sync: bool,
    ) -> StoreResult<()> {
        check_unique_consumers(&message.id, states)?;
        let mut dest = self
            .destinations
            .get_mut(destination)
            .ok_or_else(|| StoreError::not_found(Entity::Destination, destination))?;

        let size = message.size();
        check_capacity(&dest, destination, size)?;

        match self.messages.entry(message_key(destination, &message.id)) {
            Entry::Occupied(_) => Err(StoreError::already_exists(
                Entity::Message,
                format!("{}/{}", destination, message.id),
            )),
            Entry::Vacant(slot) => {
                let record = MessageRecord::new(message, states);
                log_with(journal, sync, || LogRecord::PutMessage {
                    partition: self.id,
                    destination: destination.clone(),
                    record: record.clone(),
                })?;
                slot.insert(record);
                dest.usage.message_count += 1;
                dest.usage.byte_count += size;
                Ok(())
            }
        }
    }

    /// Delete a message if present, returning whether it was.
    fn delete_message(
        &self,
        journal: Option<&AppendScope<'_>>,
        destination: &DestinationId,
        id: &MessageId,
        sync: bool,
    ) -> StoreResult<bool> {
        let size = match self.messages.entry(message_key(destination, id)) {
            Entry::Vacant(_) => return Ok(false),
            Entry::Occupied(e) => {
                log_with(journal, sync, || LogRecord::DeleteMessage {
                    partition: self.id,
                    destination: destination.clone(),
                    id: id.clone(),
                })?;
                e.remove().message.size()
            }
        };
        self.release_usage(destination, size);
        Ok(true)
    }

    fn release_usage(&self, destination: &DestinationId, size: u64) {
        if let Some(mut dest) = self.destinations.get_mut(destination) {
            dest.usage.message_count = dest.usage.message_count.saturating_sub(1);
            dest.usage.byte_count = dest.usage.byte_count.saturating_sub(size);
        }
    }

    fn remove_message(
        &self,
        journal: Option<&AppendScope<'_>>,
        destination: &DestinationId,
        id: &MessageId,
        sync: bool,
        on_rollback: bool,
    ) -> StoreResult<()> {
        if self.delete_message(journal, destination, id, sync)? || on_rollback {
            Ok(())
        } else {
            Err(message_not_found(destination, id))
        }
    }

    /// Move a message between destinations of this partition.
    ///
    /// The removal from `from` and the insert into `to` are journaled as one
    /// batch line, so a failed or torn write leaves the message where it was.
    /// The target destination stays locked throughout, which keeps stores
    /// into it out until the copy is in place.
    fn move_message(
        &self,
        journal: Option<&AppendScope<'_>>,
        message: Message,
        from: &DestinationId,
        to: &DestinationId,
        states: &[ConsumerState],
        sync: bool,
    ) -> StoreResult<()> {
        let id = message.id.clone();
        check_unique_consumers(&id, states)?;
        if from == to {
            return Err(StoreError::already_exists(
                Entity::Message,
                format!("{}/{}", to, id),
            ));
        }

        let size = message.size();
        let removed_size = {
            let mut dest = self
                .destinations
                .get_mut(to)
                .ok_or_else(|| StoreError::not_found(Entity::Destination, to))?;
            check_capacity(&dest, to, size)?;
            if self.messages.contains_key(&message_key(to, &id)) {
                return Err(StoreError::already_exists(
                    Entity::Message,
                    format!("{}/{}", to, id),
                ));
            }

            let record = MessageRecord::new(message, states);
            let removed_size = match self.messages.entry(message_key(from, &id)) {
                Entry::Vacant(_) => return Err(message_not_found(from, &id)),
                Entry::Occupied(source) => {
                    log_with(journal, sync, || LogRecord::Batch {
                        records: vec![
                            LogRecord::DeleteMessage {
                                partition: self.id,
                                destination: from.clone(),
                                id: id.clone(),
                            },
                            LogRecord::PutMessage {
                                partition: self.id,
                                destination: to.clone(),
                                record: record.clone(),
                            },
                        ],
                    })?;
                    source.remove().message.size()
                }
            };
            self.messages.insert(message_key(to, &id), record);
            dest.usage.message_count += 1;
            dest.usage.byte_count += size;
            removed_size
        };
        self.release_usage(from, removed_size);
        debug!(partition = %self.id, message = %id, from = %from, to = %to, "Moved message");
        Ok(())
    }

    fn remove_all_messages(
        &self,
        journal: Option<&AppendScope<'_>>,
        destination: &DestinationId,
        sync: bool,
    ) -> StoreResult<usize> {
        if !self.destinations.contains_key(destination) {
            return Err(StoreError::not_found(Entity::Destination, destination));
        }
        let ids: Vec<MessageId> = self
            .messages
            .iter()
            .filter(|r| &r.key().0 == destination)
            .map(|r| r.key().1.clone())
            .collect();
        let mut removed = 0;
        for id in &ids {
            if self.delete_message(journal, destination, id, sync)? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn message(&self, destination: &DestinationId, id: &MessageId) -> StoreResult<Message> {
        self.messages
            .get(&message_key(destination, id))
            .map(|r| r.message.clone())
            .ok_or_else(|| message_not_found(destination, id))
    }

    fn messages(&self, destination: &DestinationId) -> StoreResult<Vec<Message>> {
        if !self.destinations.contains_key(destination) {
            return Err(StoreError::not_found(Entity::Destination, destination));
        }
        let mut messages: Vec<Message> = self
            .messages
            .iter()
            .filter(|r| &r.key().0 == destination)
            .map(|r| r.message.clone())
            .collect();
        messages.sort_by(|a, b| {
            a.timestamp_ms
                .cmp(&b.timestamp_ms)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(messages)
    }

    fn storage_info(&self, destination: &DestinationId) -> StoreResult<StorageInfo> {
        self.destinations
            .get(destination)
            .map(|d| d.usage)
            .ok_or_else(|| StoreError::not_found(Entity::Destination, destination))
    }

    pub(crate) fn message_locations(&self) -> Vec<(DestinationId, MessageId)> {
        let mut locations: Vec<_> = self.messages.iter().map(|r| r.key().clone()).collect();
        locations.sort();
        locations
    }

    // =========================================================================
    // Interest states
    // =========================================================================

    fn add_interest_states(
        &self,
        journal: Option<&AppendScope<'_>>,
        destination: &DestinationId,
        id: &MessageId,
        states: &[ConsumerState],
        sync: bool,
    ) -> StoreResult<()> {
        check_unique_consumers(id, states)?;
        let mut entry = self
            .messages
            .get_mut(&message_key(destination, id))
            .ok_or_else(|| message_not_found(destination, id))?;
        if let Some(dup) = states.iter().find(|s| entry.interests.contains_key(&s.consumer)) {
            return Err(StoreError::already_exists(
                Entity::InterestState,
                format!("{}/{}", id, dup.consumer),
            ));
        }
        let mut updated = entry.clone();
        for s in states {
            updated.interests.insert(
                s.consumer,
                InterestEntry {
                    state: s.state,
                    ack_txn: None,
                },
            );
        }
        log_with(journal, sync, || LogRecord::PutMessage {
            partition: self.id,
            destination: destination.clone(),
            record: updated.clone(),
        })?;
        *entry = updated;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn update_interest_state(
        &self,
        journal: Option<&AppendScope<'_>>,
        destination: &DestinationId,
        id: &MessageId,
        consumer: ConsumerId,
        new_state: InterestState,
        sync: bool,
        txn: Option<TransactionId>,
        is_last_ack: bool,
    ) -> StoreResult<bool> {
        let removed_size = match self.messages.entry(message_key(destination, id)) {
            Entry::Vacant(_) => return Err(message_not_found(destination, id)),
            Entry::Occupied(mut e) => {
                let current = e.get().interests.get(&consumer).copied().ok_or_else(|| {
                    StoreError::not_found(Entity::InterestState, format!("{}/{}", id, consumer))
                })?;
                if !current.state.can_advance_to(new_state) {
                    return Err(StoreError::InvalidInterestTransition {
                        message: id.clone(),
                        consumer,
                        from: current.state,
                        to: new_state,
                    });
                }
                if current.state == new_state {
                    return Ok(false);
                }

                // Read under the message lock so a concurrent commit either
                // sees the pending mark or is seen here as committed.
                let txn_state = match txn {
                    Some(t) => Some(self.transaction_state(t)?),
                    None => None,
                };
                if txn_state == Some(TransactionState::RolledBack) {
                    return Err(StoreError::Precondition(format!(
                        "transaction {} has been rolled back",
                        txn.map(|t| t.to_string()).unwrap_or_default()
                    )));
                }

                let mut updated = e.get().clone();
                updated.interests.insert(
                    consumer,
                    InterestEntry {
                        state: new_state,
                        ack_txn: if new_state.is_acknowledged() {
                            txn
                        } else {
                            current.ack_txn
                        },
                    },
                );
                let all_acked = updated
                    .interests
                    .values()
                    .all(|i| i.state.is_acknowledged());

                if is_last_ack && all_acked && txn_state.is_none_or(|s| s == TransactionState::Committed) {
                    log_with(journal, sync, || LogRecord::DeleteMessage {
                        partition: self.id,
                        destination: destination.clone(),
                        id: id.clone(),
                    })?;
                    Some(e.remove().message.size())
                } else {
                    if is_last_ack && all_acked {
                        updated.pending_removal = txn;
                    }
                    log_with(journal, sync, || LogRecord::PutMessage {
                        partition: self.id,
                        destination: destination.clone(),
                        record: updated.clone(),
                    })?;
                    e.insert(updated);
                    None
                }
            }
        };

        match removed_size {
            Some(size) => {
                self.release_usage(destination, size);
                debug!(partition = %self.id, destination = %destination, message = %id, "Removed fully acknowledged message");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn interest_states(
        &self,
        destination: &DestinationId,
        id: &MessageId,
    ) -> StoreResult<Vec<ConsumerState>> {
        self.messages
            .get(&message_key(destination, id))
            .map(|r| {
                r.interests
                    .iter()
                    .map(|(c, i)| ConsumerState::new(*c, i.state))
                    .collect()
            })
            .ok_or_else(|| message_not_found(destination, id))
    }

    // =========================================================================
    // Destinations
    // =========================================================================

    fn store_destination(
        &self,
        journal: Option<&AppendScope<'_>>,
        info: DestinationInfo,
        sync: bool,
    ) -> StoreResult<()> {
        match self.destinations.entry(info.id.clone()) {
            Entry::Occupied(_) => Err(StoreError::already_exists(Entity::Destination, &info.id)),
            Entry::Vacant(slot) => {
                log_with(journal, sync, || LogRecord::PutDestination {
                    partition: self.id,
                    info: info.clone(),
                })?;
                slot.insert(DestinationEntry {
                    info,
                    usage: StorageInfo::default(),
                });
                Ok(())
            }
        }
    }

    fn update_destination(
        &self,
        journal: Option<&AppendScope<'_>>,
        info: DestinationInfo,
        sync: bool,
    ) -> StoreResult<()> {
        let mut entry = self
            .destinations
            .get_mut(&info.id)
            .ok_or_else(|| StoreError::not_found(Entity::Destination, &info.id))?;
        log_with(journal, sync, || LogRecord::PutDestination {
            partition: self.id,
            info: info.clone(),
        })?;
        entry.info = info;
        Ok(())
    }

    fn remove_destination(
        &self,
        journal: Option<&AppendScope<'_>>,
        id: &DestinationId,
        sync: bool,
    ) -> StoreResult<()> {
        self.remove_all_messages(journal, id, sync)?;
        match self.destinations.entry(id.clone()) {
            Entry::Vacant(_) => Err(StoreError::not_found(Entity::Destination, id)),
            Entry::Occupied(e) => {
                log_with(journal, sync, || LogRecord::DeleteDestination {
                    partition: self.id,
                    id: id.clone(),
                })?;
                e.remove();
                Ok(())
            }
        }
    }

    fn destination(&self, id: &DestinationId) -> StoreResult<DestinationInfo> {
        self.destinations
            .get(id)
            .map(|d| d.info.clone())
            .ok_or_else(|| StoreError::not_found(Entity::Destination, id))
    }

    pub(crate) fn all_destinations(&self) -> Vec<DestinationInfo> {
        let mut all: Vec<_> = self.destinations.iter().map(|d| d.info.clone()).collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    // =========================================================================
    // Transactions
    // =========================================================================

    fn insert_transaction(
        &self,
        journal: Option<&AppendScope<'_>>,
        record: TransactionRecord,
        sync: bool,
    ) -> StoreResult<()> {
        match self.transactions.entry(record.info.id) {
            Entry::Occupied(_) => Err(StoreError::already_exists(
                Entity::Transaction,
                record.info.id,
            )),
            Entry::Vacant(slot) => {
                log_with(journal, sync, || LogRecord::PutTransaction {
                    partition: self.id,
                    record: record.clone(),
                })?;
                slot.insert(record);
                Ok(())
            }
        }
    }

    /// Apply `change` to a copy of the record and store it once it succeeds.
    fn modify_transaction(
        &self,
        journal: Option<&AppendScope<'_>>,
        id: TransactionId,
        sync: bool,
        change: impl FnOnce(&mut TransactionRecord) -> StoreResult<()>,
    ) -> StoreResult<()> {
        let mut entry = self
            .transactions
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found(Entity::Transaction, id))?;
        let mut updated = entry.clone();
        change(&mut updated)?;
        log_with(journal, sync, || LogRecord::PutTransaction {
            partition: self.id,
            record: updated.clone(),
        })?;
        *entry = updated;
        Ok(())
    }

    fn remove_transaction(
        &self,
        journal: Option<&AppendScope<'_>>,
        id: TransactionId,
        remove_acks: bool,
        sync: bool,
    ) -> StoreResult<()> {
        match self.transactions.entry(id) {
            Entry::Vacant(_) => Err(StoreError::not_found(Entity::Transaction, id)),
            Entry::Occupied(e) => {
                let record = e.get();
                if !record.info.all_participants_completed() {
                    let waiting: Vec<String> = record
                        .info
                        .incomplete_participants()
                        .map(|p| p.broker.to_string())
                        .collect();
                    return Err(StoreError::Precondition(format!(
                        "cluster transaction {} waits for {}",
                        id,
                        waiting.join(", ")
                    )));
                }
                if !remove_acks && !record.acks.is_empty() {
                    return Err(StoreError::Precondition(format!(
                        "transaction {} still has {} acknowledgements",
                        id,
                        record.acks.len()
                    )));
                }
                log_with(journal, sync, || LogRecord::DeleteTransaction {
                    partition: self.id,
                    id,
                })?;
                e.remove();
                Ok(())
            }
        }
    }

    fn update_transaction_state(
        &self,
        journal: Option<&AppendScope<'_>>,
        id: TransactionId,
        state: TransactionState,
        sync: bool,
    ) -> StoreResult<()> {
        self.modify_transaction(journal, id, sync, |record| {
            if record.info.kind == TransactionType::Remote {
                return Err(StoreError::NotAllowed(format!(
                    "transaction {} is owned by {}",
                    id,
                    record
                        .info
                        .home_broker
                        .as_ref()
                        .map(BrokerId::to_string)
                        .unwrap_or_default()
                )));
            }
            TransactionState::check_transition(id, record.info.state, state)?;
            record.info.state = state;
            Ok(())
        })?;

        match state {
            TransactionState::Committed => self.resolve_messages(journal, id, true, sync),
            TransactionState::RolledBack => self.resolve_messages(journal, id, false, sync),
            _ => Ok(()),
        }
    }

    /// Settle the messages acknowledged under `txn` once it reached a final
    /// state.
    fn resolve_messages(
        &self,
        journal: Option<&AppendScope<'_>>,
        txn: TransactionId,
        committed: bool,
        sync: bool,
    ) -> StoreResult<()> {
        let keys: Vec<MessageKey> = self
            .messages
            .iter()
            .filter(|r| r.references(txn))
            .map(|r| r.key().clone())
            .collect();

        let mut purged = 0usize;
        for key in keys {
            let released = match self.messages.entry(key.clone()) {
                Entry::Vacant(_) => None,
                Entry::Occupied(mut e) => {
                    if committed && e.get().pending_removal == Some(txn) {
                        log_with(journal, sync, || LogRecord::DeleteMessage {
                            partition: self.id,
                            destination: key.0.clone(),
                            id: key.1.clone(),
                        })?;
                        Some(e.remove().message.size())
                    } else {
                        let mut updated = e.get().clone();
                        if updated.pending_removal == Some(txn) {
                            updated.pending_removal = None;
                        }
                        for interest in updated.interests.values_mut() {
                            if interest.ack_txn == Some(txn) {
                                interest.ack_txn = None;
                                if !committed {
                                    interest.state = InterestState::Delivered;
                                }
                            }
                        }
                        log_with(journal, sync, || LogRecord::PutMessage {
                            partition: self.id,
                            destination: key.0.clone(),
                            record: updated.clone(),
                        })?;
                        e.insert(updated);
                        None
                    }
                }
            };
            if let Some(size) = released {
                self.release_usage(&key.0, size);
                purged += 1;
            }
        }
        debug!(partition = %self.id, txn = %txn, committed, purged, "Resolved transaction messages");
        Ok(())
    }

    fn transaction_state(&self, id: TransactionId) -> StoreResult<TransactionState> {
        self.transaction_info(id).map(|info| info.state)
    }

    pub(crate) fn transaction_info(&self, id: TransactionId) -> StoreResult<TransactionInfo> {
        self.transactions
            .get(&id)
            .map(|r| r.info.clone())
            .ok_or_else(|| StoreError::not_found(Entity::Transaction, id))
    }

    pub(crate) fn all_transactions(&self) -> Vec<TransactionInfo> {
        let mut all: Vec<_> = self.transactions.iter().map(|r| r.info.clone()).collect();
        all.sort_by_key(|info| info.id);
        all
    }

    fn transaction_states(&self, remote: bool) -> HashMap<TransactionId, TransactionState> {
        self.transactions
            .iter()
            .filter(|r| (r.info.kind == TransactionType::Remote) == remote)
            .map(|r| (r.info.id, r.info.state))
            .collect()
    }

    fn transaction_usage(&self, id: TransactionId) -> StoreResult<TransactionUsage> {
        let acks = self
            .transactions
            .get(&id)
            .map(|r| r.acks.len())
            .ok_or_else(|| StoreError::not_found(Entity::Transaction, id))?;
        let pending_removals = self
            .messages
            .iter()
            .filter(|r| r.pending_removal == Some(id))
            .count();
        Ok(TransactionUsage {
            pending_removals,
            acks,
        })
    }

    // =========================================================================
    // Replay and snapshot
    // =========================================================================

    pub(crate) fn apply_destination(&self, info: DestinationInfo) {
        match self.destinations.entry(info.id.clone()) {
            Entry::Occupied(mut e) => e.get_mut().info = info,
            Entry::Vacant(slot) => {
                slot.insert(DestinationEntry {
                    info,
                    usage: StorageInfo::default(),
                });
            }
        }
    }

    pub(crate) fn apply_delete_destination(&self, id: &DestinationId) {
        self.messages.retain(|key, _| &key.0 != id);
        self.destinations.remove(id);
    }

    /// Fails if the destination is unknown; usage is fixed up by
    /// [`recount`](Self::recount).
    pub(crate) fn apply_message(
        &self,
        destination: DestinationId,
        record: MessageRecord,
    ) -> StoreResult<()> {
        if !self.destinations.contains_key(&destination) {
            return Err(StoreError::not_found(Entity::Destination, &destination));
        }
        self.messages
            .insert((destination, record.message.id.clone()), record);
        Ok(())
    }

    pub(crate) fn apply_delete_message(&self, destination: &DestinationId, id: &MessageId) {
        self.messages.remove(&message_key(destination, id));
    }

    pub(crate) fn apply_transaction(&self, record: TransactionRecord) {
        self.transactions.insert(record.info.id, record);
    }

    pub(crate) fn apply_delete_transaction(&self, id: TransactionId) {
        self.transactions.remove(&id);
    }

    /// Recompute destination usage from the stored messages.
    pub(crate) fn recount(&self) {
        let mut usage: HashMap<DestinationId, StorageInfo> = HashMap::new();
        for r in self.messages.iter() {
            let u = usage.entry(r.key().0.clone()).or_default();
            u.message_count += 1;
            u.byte_count += r.message.size();
        }
        for mut dest in self.destinations.iter_mut() {
            let counted = usage.remove(dest.key()).unwrap_or_default();
            dest.usage = counted;
        }
    }

    pub(crate) fn snapshot(&self) -> PartitionSnapshot {
        let mut messages: Vec<(DestinationId, MessageRecord)> = self
            .messages
            .iter()
            .map(|r| (r.key().0.clone(), r.value().clone()))
            .collect();
        messages.sort_by(|a, b| (&a.0, &a.1.message.id).cmp(&(&b.0, &b.1.message.id)));
        let mut transactions: Vec<TransactionRecord> =
            self.transactions.iter().map(|r| r.value().clone()).collect();
        transactions.sort_by_key(|r| r.info.id);
        PartitionSnapshot {
            id: self.id,
            destinations: self.all_destinations(),
            messages,
            transactions,
        }
    }

    pub(crate) fn counts(&self) -> (usize, usize, usize) {
        (
            self.destinations.len(),
            self.messages.len(),
            self.transactions.len(),
        )
    }
}

// =============================================================================
// Handle
// =============================================================================

/// One broker's open handle on a partition.
#[derive(Debug)]
pub struct MemoryPartition {
    db: Arc<StoreDatabase>,
    data: Arc<PartitionData>,
    opened_epoch: u64,
    primary: bool,
    drain: DrainGuard,
}

fn observe<T>(operation: &'static str, result: StoreResult<T>) -> StoreResult<T> {
    let status = match &result {
        Ok(_) => Status::Ok,
        Err(e) => e.status(),
    };
    metrics::record_operation(operation, status);
    result
}

impl MemoryPartition {
    pub(crate) fn open(db: Arc<StoreDatabase>, data: Arc<PartitionData>, primary: bool) -> Self {
        let opened_epoch = data.epoch();
        Self {
            db,
            data,
            opened_epoch,
            primary,
            drain: DrainGuard::new("partition"),
        }
    }

    pub fn epoch(&self) -> u64 {
        self.opened_epoch
    }

    fn check_epoch(&self) -> StoreResult<()> {
        let current = self.data.epoch();
        if current != self.opened_epoch {
            return Err(StoreError::Fenced {
                partition: self.data.id(),
                expected_epoch: self.opened_epoch,
                current_epoch: current,
            });
        }
        Ok(())
    }

    /// Run a write: registered, fenced, journaled.
    fn mutate<T>(
        &self,
        operation: &'static str,
        f: impl FnOnce(Option<&AppendScope<'_>>) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let result = (|| {
            let _permit = self.drain.enter()?;
            let scope = self.db.append_scope();
            let _owner = read(&self.data.owner_gate);
            self.check_epoch()?;
            f(scope.as_ref())
        })();
        self.db.maybe_checkpoint();
        observe(operation, result)
    }

    fn query<T>(&self, f: impl FnOnce(&PartitionData) -> StoreResult<T>) -> StoreResult<T> {
        let _permit = self.drain.enter()?;
        f(&self.data)
    }
}

impl PartitionedStore for MemoryPartition {
    fn partition_id(&self) -> PartitionId {
        self.data.id()
    }

    fn is_primary(&self) -> bool {
        self.primary
    }

    fn backend(&self) -> StoreType {
        self.db.store_type()
    }

    fn store_message(
        &self,
        destination: &DestinationId,
        message: Message,
        states: Option<&[ConsumerState]>,
        sync: bool,
    ) -> StoreResult<()> {
        self.mutate("store_message", |j| {
            self.data
                .store_message(j, destination, message, states.unwrap_or(&[]), sync)
        })
    }

    fn remove_message(
        &self,
        destination: &DestinationId,
        id: &MessageId,
        sync: bool,
        on_rollback: bool,
    ) -> StoreResult<()> {
        self.mutate("remove_message", |j| {
            self.data
                .remove_message(j, destination, id, sync, on_rollback)
        })
    }

    fn move_message(
        &self,
        message: Message,
        from: &DestinationId,
        to: &DestinationId,
        states: &[ConsumerState],
        sync: bool,
    ) -> StoreResult<()> {
        self.mutate("move_message", |j| {
            self.data.move_message(j, message, from, to, states, sync)
        })
    }

    fn remove_all_messages(&self, destination: &DestinationId, sync: bool) -> StoreResult<usize> {
        self.mutate("remove_all_messages", |j| {
            self.data.remove_all_messages(j, destination, sync)
        })
    }

    fn message(&self, destination: &DestinationId, id: &MessageId) -> StoreResult<Message> {
        self.query(|d| d.message(destination, id))
    }

    fn has_message(&self, destination: &DestinationId, id: &MessageId) -> StoreResult<bool> {
        self.query(|d| Ok(d.messages.contains_key(&message_key(destination, id))))
    }

    fn messages(&self, destination: &DestinationId) -> StoreResult<Vec<Message>> {
        self.query(|d| d.messages(destination))
    }

    fn message_count(&self, destination: &DestinationId) -> StoreResult<u64> {
        self.query(|d| d.storage_info(destination).map(|u| u.message_count))
    }

    fn message_storage_info(&self, destination: &DestinationId) -> StoreResult<StorageInfo> {
        self.query(|d| d.storage_info(destination))
    }

    fn all_message_locations(&self) -> StoreResult<Vec<(DestinationId, MessageId)>> {
        self.query(|d| Ok(d.message_locations()))
    }

    fn store_interest_states(
        &self,
        destination: &DestinationId,
        id: &MessageId,
        states: &[ConsumerState],
        sync: bool,
    ) -> StoreResult<()> {
        self.mutate("store_interest_states", |j| {
            self.data
                .add_interest_states(j, destination, id, states, sync)
        })
    }

    fn update_interest_state(
        &self,
        destination: &DestinationId,
        id: &MessageId,
        consumer: ConsumerId,
        state: InterestState,
        sync: bool,
        txn: Option<TransactionId>,
        is_last_ack: bool,
    ) -> StoreResult<bool> {
        self.mutate("update_interest_state", |j| {
            self.data.update_interest_state(
                j,
                destination,
                id,
                consumer,
                state,
                sync,
                txn,
                is_last_ack,
            )
        })
    }

    fn interest_state(
        &self,
        destination: &DestinationId,
        id: &MessageId,
        consumer: ConsumerId,
    ) -> StoreResult<InterestState> {
        self.query(|d| {
            d.interest_states(destination, id)?
                .into_iter()
                .find(|s| s.consumer == consumer)
                .map(|s| s.state)
                .ok_or_else(|| {
                    StoreError::not_found(Entity::InterestState, format!("{}/{}", id, consumer))
                })
        })
    }

    fn interest_states(
        &self,
        destination: &DestinationId,
        id: &MessageId,
    ) -> StoreResult<Vec<ConsumerState>> {
        self.query(|d| d.interest_states(destination, id))
    }

    fn has_message_been_acked(
        &self,
        destination: &DestinationId,
        id: &MessageId,
    ) -> StoreResult<bool> {
        self.query(|d| {
            Ok(d.interest_states(destination, id)?
                .iter()
                .any(|s| s.state.is_acknowledged()))
        })
    }

    fn store_destination(&self, info: DestinationInfo, sync: bool) -> StoreResult<()> {
        self.mutate("store_destination", |j| {
            self.data.store_destination(j, info, sync)
        })
    }

    fn update_destination(&self, info: DestinationInfo, sync: bool) -> StoreResult<()> {
        self.mutate("update_destination", |j| {
            self.data.update_destination(j, info, sync)
        })
    }

    fn remove_destination(&self, id: &DestinationId, sync: bool) -> StoreResult<()> {
        self.mutate("remove_destination", |j| {
            self.data.remove_destination(j, id, sync)
        })
    }

    fn destination(&self, id: &DestinationId) -> StoreResult<DestinationInfo> {
        self.query(|d| d.destination(id))
    }

    fn all_destinations(&self) -> StoreResult<Vec<DestinationInfo>> {
        self.query(|d| Ok(d.all_destinations()))
    }

    fn store_transaction(
        &self,
        id: TransactionId,
        state: TransactionState,
        sync: bool,
    ) -> StoreResult<()> {
        self.mutate("store_transaction", |j| {
            let record = TransactionRecord {
                info: TransactionInfo::local(id, state),
                acks: Vec::new(),
            };
            self.data.insert_transaction(j, record, sync)
        })
    }

    fn store_cluster_transaction(
        &self,
        id: TransactionId,
        state: TransactionState,
        participants: Vec<TransactionBroker>,
        sync: bool,
    ) -> StoreResult<()> {
        self.mutate("store_cluster_transaction", |j| {
            let record = TransactionRecord {
                info: TransactionInfo::cluster(id, state, participants),
                acks: Vec::new(),
            };
            self.data.insert_transaction(j, record, sync)
        })
    }

    fn store_remote_transaction(
        &self,
        id: TransactionId,
        state: TransactionState,
        acks: Vec<TransactionAck>,
        home_broker: BrokerId,
        sync: bool,
    ) -> StoreResult<()> {
        self.mutate("store_remote_transaction", |j| {
            let record = TransactionRecord {
                info: TransactionInfo::remote(id, state, home_broker),
                acks,
            };
            self.data.insert_transaction(j, record, sync)
        })
    }

    fn remove_transaction(
        &self,
        id: TransactionId,
        remove_acks: bool,
        sync: bool,
    ) -> StoreResult<()> {
        self.mutate("remove_transaction", |j| {
            self.data.remove_transaction(j, id, remove_acks, sync)
        })
    }

    fn update_transaction_state(
        &self,
        id: TransactionId,
        state: TransactionState,
        sync: bool,
    ) -> StoreResult<()> {
        self.mutate("update_transaction_state", |j| {
            self.data.update_transaction_state(j, id, state, sync)
        })
    }

    fn update_cluster_transaction(
        &self,
        id: TransactionId,
        participants: Vec<TransactionBroker>,
        sync: bool,
    ) -> StoreResult<()> {
        self.mutate("update_cluster_transaction", |j| {
            self.data.modify_transaction(j, id, sync, |record| {
                if record.info.kind != TransactionType::Cluster {
                    return Err(StoreError::BadRequest(format!(
                        "transaction {} is not a cluster transaction",
                        id
                    )));
                }
                record.info.participants = participants;
                Ok(())
            })
        })
    }

    fn update_cluster_transaction_broker_state(
        &self,
        id: TransactionId,
        expected: TransactionState,
        broker: &BrokerId,
        sync: bool,
    ) -> StoreResult<()> {
        self.mutate("update_cluster_transaction_broker_state", |j| {
            self.data.modify_transaction(j, id, sync, |record| {
                if record.info.state != expected {
                    return Err(StoreError::Precondition(format!(
                        "transaction {} is {}, expected {}",
                        id, record.info.state, expected
                    )));
                }
                let participant = record
                    .info
                    .participants
                    .iter_mut()
                    .find(|p| &p.broker == broker)
                    .ok_or_else(|| {
                        StoreError::not_found(Entity::Broker, format!("{} in transaction {}", broker, id))
                    })?;
                participant.completed = true;
                Ok(())
            })
        })
    }

    fn update_remote_transaction(
        &self,
        id: TransactionId,
        state: TransactionState,
        acks: Vec<TransactionAck>,
        home_broker: BrokerId,
        sync: bool,
    ) -> StoreResult<()> {
        self.mutate("update_remote_transaction", |j| {
            self.data.modify_transaction(j, id, sync, |record| {
                if record.info.kind != TransactionType::Remote {
                    return Err(StoreError::BadRequest(format!(
                        "transaction {} is not a remote transaction",
                        id
                    )));
                }
                record.info.state = state;
                record.info.home_broker = Some(home_broker);
                record.acks = acks;
                Ok(())
            })
        })
    }

    fn transaction_state(&self, id: TransactionId) -> StoreResult<TransactionState> {
        self.query(|d| d.transaction_state(id))
    }

    fn transaction_info(&self, id: TransactionId) -> StoreResult<TransactionInfo> {
        self.query(|d| d.transaction_info(id))
    }

    fn cluster_transaction_brokers(
        &self,
        id: TransactionId,
    ) -> StoreResult<Vec<TransactionBroker>> {
        self.query(|d| d.transaction_info(id).map(|info| info.participants))
    }

    fn remote_transaction_home_broker(&self, id: TransactionId) -> StoreResult<Option<BrokerId>> {
        self.query(|d| d.transaction_info(id).map(|info| info.home_broker))
    }

    fn all_transactions(&self) -> StoreResult<Vec<TransactionInfo>> {
        self.query(|d| Ok(d.all_transactions()))
    }

    fn all_transaction_states(&self) -> StoreResult<HashMap<TransactionId, TransactionState>> {
        self.query(|d| Ok(d.transaction_states(false)))
    }

    fn all_remote_transaction_states(
        &self,
    ) -> StoreResult<HashMap<TransactionId, TransactionState>> {
        self.query(|d| Ok(d.transaction_states(true)))
    }

    fn transaction_usage(&self, id: TransactionId) -> StoreResult<TransactionUsage> {
        self.query(|d| d.transaction_usage(id))
    }

    fn store_transaction_ack(
        &self,
        id: TransactionId,
        ack: TransactionAck,
        sync: bool,
    ) -> StoreResult<()> {
        self.mutate("store_transaction_ack", |j| {
            self.data.modify_transaction(j, id, sync, |record| {
                if record.acks.contains(&ack) {
                    return Err(StoreError::already_exists(
                        Entity::Transaction,
                        format!(
                            "{} ack of {}/{} by {}",
                            id, ack.destination, ack.message, ack.consumer
                        ),
                    ));
                }
                record.acks.push(ack);
                Ok(())
            })
        })
    }

    fn remove_transaction_acks(&self, id: TransactionId, sync: bool) -> StoreResult<()> {
        self.mutate("remove_transaction_acks", |j| {
            self.data.modify_transaction(j, id, sync, |record| {
                record.acks.clear();
                Ok(())
            })
        })
    }

    fn transaction_acks(&self, id: TransactionId) -> StoreResult<Vec<TransactionAck>> {
        self.query(|d| {
            d.transactions
                .get(&id)
                .map(|r| r.acks.clone())
                .ok_or_else(|| StoreError::not_found(Entity::Transaction, id))
        })
    }

    fn all_transaction_acks(&self) -> StoreResult<HashMap<TransactionId, Vec<TransactionAck>>> {
        self.query(|d| {
            Ok(d.transactions
                .iter()
                .filter(|r| !r.acks.is_empty())
                .map(|r| (r.info.id, r.acks.clone()))
                .collect())
        })
    }

    fn close(&self) {
        if self.drain.close_and_wait() {
            debug!(partition = %self.data.id(), "Closed partition");
        }
    }

    fn is_closed(&self) -> bool {
        self.drain.is_closed()
    }

    fn debug_state(&self) -> BTreeMap<String, String> {
        let (destinations, messages, transactions) = self.data.counts();
        BTreeMap::from([
            ("partition".to_string(), self.data.id().to_string()),
            ("backend".to_string(), self.backend().as_str().to_string()),
            ("primary".to_string(), self.primary.to_string()),
            ("epoch".to_string(), self.opened_epoch.to_string()),
            ("closed".to_string(), self.drain.is_closed().to_string()),
            ("in_flight".to_string(), self.drain.in_progress().to_string()),
            ("destinations".to_string(), destinations.to_string()),
            ("messages".to_string(), messages.to_string()),
            ("transactions".to_string(), transactions.to_string()),
        ])
    }
}
