//! Placeholder partition for brokers that keep no persistent data.
//!
//! Only identity and empty metadata listings are answered; every data
//! operation fails with `Unsupported`.

use std::collections::{BTreeMap, HashMap};

use super::config::StoreType;
use super::drain::DrainGuard;
use super::message::{ConsumerState, DestinationInfo, InterestState, Message, StorageInfo};
use super::partition::PartitionedStore;
use super::transaction::{
    TransactionAck, TransactionBroker, TransactionInfo, TransactionState, TransactionUsage,
};
use crate::error::{StoreError, StoreResult};
use crate::types::{BrokerId, ConsumerId, DestinationId, MessageId, PartitionId, TransactionId};

const BACKEND: &str = "no-persist";

fn unsupported<T>(operation: &'static str) -> StoreResult<T> {
    Err(StoreError::Unsupported {
        operation,
        backend: BACKEND,
    })
}

#[derive(Debug)]
pub struct NoPersistPartition {
    id: PartitionId,
    drain: DrainGuard,
}

impl NoPersistPartition {
    pub fn new(id: PartitionId) -> Self {
        Self {
            id,
            drain: DrainGuard::new("partition"),
        }
    }

    /// Register the call, then fail as unsupported.
    fn reject<T>(&self, operation: &'static str) -> StoreResult<T> {
        let _permit = self.drain.enter()?;
        unsupported(operation)
    }

    fn empty<T: Default>(&self) -> StoreResult<T> {
        let _permit = self.drain.enter()?;
        Ok(T::default())
    }
}

impl PartitionedStore for NoPersistPartition {
    fn partition_id(&self) -> PartitionId {
        self.id
    }

    fn is_primary(&self) -> bool {
        false
    }

    fn backend(&self) -> StoreType {
        StoreType::NoPersist
    }

    fn store_message(
        &self,
        _destination: &DestinationId,
        _message: Message,
        _states: Option<&[ConsumerState]>,
        _sync: bool,
    ) -> StoreResult<()> {
        self.reject("store_message")
    }

    fn remove_message(
        &self,
        _destination: &DestinationId,
        _id: &MessageId,
        _sync: bool,
        _on_rollback: bool,
    ) -> StoreResult<()> {
        self.reject("remove_message")
    }

    fn move_message(
        &self,
        _message: Message,
        _from: &DestinationId,
        _to: &DestinationId,
        _states: &[ConsumerState],
        _sync: bool,
    ) -> StoreResult<()> {
        self.reject("move_message")
    }

    fn remove_all_messages(&self, _destination: &DestinationId, _sync: bool) -> StoreResult<usize> {
        self.reject("remove_all_messages")
    }

    fn message(&self, _destination: &DestinationId, _id: &MessageId) -> StoreResult<Message> {
        self.reject("message")
    }

    fn has_message(&self, _destination: &DestinationId, _id: &MessageId) -> StoreResult<bool> {
        self.reject("has_message")
    }

    fn messages(&self, _destination: &DestinationId) -> StoreResult<Vec<Message>> {
        self.reject("messages")
    }

    fn message_count(&self, _destination: &DestinationId) -> StoreResult<u64> {
        self.reject("message_count")
    }

    fn message_storage_info(&self, _destination: &DestinationId) -> StoreResult<StorageInfo> {
        self.empty()
    }

    fn all_message_locations(&self) -> StoreResult<Vec<(DestinationId, MessageId)>> {
        self.empty()
    }

    fn store_interest_states(
        &self,
        _destination: &DestinationId,
        _id: &MessageId,
        _states: &[ConsumerState],
        _sync: bool,
    ) -> StoreResult<()> {
        self.reject("store_interest_states")
    }

    fn update_interest_state(
        &self,
        _destination: &DestinationId,
        _id: &MessageId,
        _consumer: ConsumerId,
        _state: InterestState,
        _sync: bool,
        _txn: Option<TransactionId>,
        _is_last_ack: bool,
    ) -> StoreResult<bool> {
        self.reject("update_interest_state")
    }

    fn interest_state(
        &self,
        _destination: &DestinationId,
        _id: &MessageId,
        _consumer: ConsumerId,
    ) -> StoreResult<InterestState> {
        self.reject("interest_state")
    }

    fn interest_states(
        &self,
        _destination: &DestinationId,
        _id: &MessageId,
    ) -> StoreResult<Vec<ConsumerState>> {
        self.reject("interest_states")
    }

    fn has_message_been_acked(
        &self,
        _destination: &DestinationId,
        _id: &MessageId,
    ) -> StoreResult<bool> {
        self.reject("has_message_been_acked")
    }

    fn store_destination(&self, _info: DestinationInfo, _sync: bool) -> StoreResult<()> {
        self.reject("store_destination")
    }

    fn update_destination(&self, _info: DestinationInfo, _sync: bool) -> StoreResult<()> {
        self.reject("update_destination")
    }

    fn remove_destination(&self, _id: &DestinationId, _sync: bool) -> StoreResult<()> {
        self.reject("remove_destination")
    }

    fn destination(&self, _id: &DestinationId) -> StoreResult<DestinationInfo> {
        self.reject("destination")
    }

    fn all_destinations(&self) -> StoreResult<Vec<DestinationInfo>> {
        self.empty()
    }

    fn store_transaction(
        &self,
        _id: TransactionId,
        _state: TransactionState,
        _sync: bool,
    ) -> StoreResult<()> {
        self.reject("store_transaction")
    }

    fn store_cluster_transaction(
        &self,
        _id: TransactionId,
        _state: TransactionState,
        _participants: Vec<TransactionBroker>,
        _sync: bool,
    ) -> StoreResult<()> {
        self.reject("store_cluster_transaction")
    }

    fn store_remote_transaction(
        &self,
        _id: TransactionId,
        _state: TransactionState,
        _acks: Vec<TransactionAck>,
        _home_broker: BrokerId,
        _sync: bool,
    ) -> StoreResult<()> {
        self.reject("store_remote_transaction")
    }

    fn remove_transaction(
        &self,
        _id: TransactionId,
        _remove_acks: bool,
        _sync: bool,
    ) -> StoreResult<()> {
        self.reject("remove_transaction")
    }

    fn update_transaction_state(
        &self,
        _id: TransactionId,
        _state: TransactionState,
        _sync: bool,
    ) -> StoreResult<()> {
        self.reject("update_transaction_state")
    }

    fn update_cluster_transaction(
        &self,
        _id: TransactionId,
        _participants: Vec<TransactionBroker>,
        _sync: bool,
    ) -> StoreResult<()> {
        self.reject("update_cluster_transaction")
    }

    fn update_cluster_transaction_broker_state(
        &self,
        _id: TransactionId,
        _expected: TransactionState,
        _broker: &BrokerId,
        _sync: bool,
    ) -> StoreResult<()> {
        self.reject("update_cluster_transaction_broker_state")
    }

    fn update_remote_transaction(
        &self,
        _id: TransactionId,
        _state: TransactionState,
        _acks: Vec<TransactionAck>,
        _home_broker: BrokerId,
        _sync: bool,
    ) -> StoreResult<()> {
        self.reject("update_remote_transaction")
    }

    fn transaction_state(&self, _id: TransactionId) -> StoreResult<TransactionState> {
        self.reject("transaction_state")
    }

    fn transaction_info(&self, _id: TransactionId) -> StoreResult<TransactionInfo> {
        self.reject("transaction_info")
    }

    fn cluster_transaction_brokers(
        &self,
        _id: TransactionId,
    ) -> StoreResult<Vec<TransactionBroker>> {
        self.reject("cluster_transaction_brokers")
    }

    fn remote_transaction_home_broker(&self, _id: TransactionId) -> StoreResult<Option<BrokerId>> {
        self.reject("remote_transaction_home_broker")
    }

    fn all_transactions(&self) -> StoreResult<Vec<TransactionInfo>> {
        self.empty()
    }

    fn all_transaction_states(&self) -> StoreResult<HashMap<TransactionId, TransactionState>> {
        self.empty()
    }

    fn all_remote_transaction_states(
        &self,
    ) -> StoreResult<HashMap<TransactionId, TransactionState>> {
        self.empty()
    }

    fn transaction_usage(&self, _id: TransactionId) -> StoreResult<TransactionUsage> {
        self.reject("transaction_usage")
    }

    fn store_transaction_ack(
        &self,
        _id: TransactionId,
        _ack: TransactionAck,
        _sync: bool,
    ) -> StoreResult<()> {
        self.reject("store_transaction_ack")
    }

    fn remove_transaction_acks(&self, _id: TransactionId, _sync: bool) -> StoreResult<()> {
        self.reject("remove_transaction_acks")
    }

    fn transaction_acks(&self, _id: TransactionId) -> StoreResult<Vec<TransactionAck>> {
        self.reject("transaction_acks")
    }

    fn all_transaction_acks(&self) -> StoreResult<HashMap<TransactionId, Vec<TransactionAck>>> {
        self.empty()
    }

    fn close(&self) {
        self.drain.close_and_wait();
    }

    fn is_closed(&self) -> bool {
        self.drain.is_closed()
    }

    fn debug_state(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("partition".to_string(), self.id.to_string()),
            ("backend".to_string(), StoreType::NoPersist.as_str().to_string()),
            ("closed".to_string(), self.drain.is_closed().to_string()),
        ])
    }
}
