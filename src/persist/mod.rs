//! Durable state of a message broker cluster.
//!
//! Brokers of one HA cluster share a [`StoreDatabase`]. Each broker opens a
//! [`Store`] on it, which loads the broker's partitions: one primary
//! partition for the broker's current session, plus any partitions it took
//! over or received by migration.
//!
//! # Architecture
//!
//! ```text
//!   ┌──────────┐      ┌──────────┐      ┌──────────┐
//!   │ Store A  │      │ Store B  │      │ Store C  │
//!   │ P1*, P4  │      │ P2*      │      │ P3*      │   * primary
//!   └────┬─────┘      └────┬─────┘      └────┬─────┘
//!        │                 │                 │
//!        └─────────────────┼─────────────────┘
//!                          ▼
//!                 ┌─────────────────┐
//!                 │  StoreDatabase  │  brokers, sessions, partitions,
//!                 │                 │  properties, change records
//!                 └────────┬────────┘
//!                          ▼
//!                 ┌─────────────────┐
//!                 │ journal/snapshot│  File backend only
//!                 └─────────────────┘
//! ```
//!
//! # Failover
//!
//! A broker that stops heartbeating is taken over by exactly one peer. The
//! winner of [`Store::get_takeover_lock`] moves the target's sessions to
//! itself with [`Store::take_over_broker_store`] and fences every handle
//! the target still has open.
//!
//! # Usage
//!
//! ```rust
//! use mqpersist::persist::{Message, StoreConfig, StoreManager};
//! use mqpersist::types::DestinationId;
//! use mqpersist::persist::DestinationInfo;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = StoreManager::new(StoreConfig::for_broker("broker-a"))?;
//! let store = manager.get_store()?;
//! let partition = store.primary_partition()?;
//!
//! let orders = DestinationId::queue("orders");
//! partition.store_destination(DestinationInfo::queue("orders"), true)?;
//! partition.store_message(&orders, Message::new("m1", "hello"), None, true)?;
//! assert_eq!(partition.message_count(&orders)?, 1);
//!
//! manager.release_store(true)?;
//! # Ok(())
//! # }
//! ```

mod broker_table;
mod change_log;
mod config;
mod database;
mod drain;
mod exclusive;
mod manager;
mod memory;
mod message;
pub mod metrics;
mod migration;
mod no_persist;
mod partition;
pub mod retry;
mod store;
pub(crate) mod sync;
mod takeover;
mod transaction;
mod txn_log;

pub use broker_table::{BrokerInfo, BrokerState, BrokerTable, StoreSession, TakeoverLockRequest};
pub use change_log::{
    ChangeLogCursor, ChangeRecord, ChangeRecordDraft, ChangeRecordKind, ChangeRecordLog,
    ReplayStats,
};
pub use config::{StoreConfig, StoreType};
pub use database::{ConfigChangeRecord, StoreDatabase};
pub use drain::{DrainGuard, OpPermit};
pub use exclusive::{ExclusiveGuard, ExclusiveLocks, ExclusiveRequest};
pub use manager::StoreManager;
pub use memory::{
    InterestEntry, MemoryPartition, MessageRecord, PartitionData, TransactionRecord,
};
pub use message::{
    ConsumerState, DestinationInfo, DestinationKind, DestinationLimits, InterestState, Message,
    StorageInfo,
};
pub use migration::{
    ArrivalRecord, ClusterNotifier, MigrationOutcome, NotificationKind, NotificationRecord,
    PartitionListener,
};
pub use no_persist::NoPersistPartition;
pub use partition::PartitionedStore;
pub use store::Store;
pub use takeover::{TakeoverStage, TakeoverStoreInfo, TakeoverTracker};
pub use transaction::{
    TransactionAck, TransactionBroker, TransactionInfo, TransactionState, TransactionType,
    TransactionUsage,
};
pub use txn_log::{
    AppendScope, CheckpointScope, JournalSnapshot, LogRecord, PartitionSnapshot, Recovery, TxnLog,
};
