//! # mqpersist
//! Durable state layer for a clustered message broker.
//!
//! Brokers keep their messages, per-consumer delivery states, destinations
//! and transactions in partitioned stores. Brokers of one HA cluster share a
//! backing database; when a broker dies, one peer takes over its store, and
//! in partition mode individual partitions can be migrated between brokers.
//!
//! ## Getting started
//!
//! ```rust
//! use mqpersist::prelude::*;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = StoreManager::new(StoreConfig::for_broker("broker-a"))?;
//! let store = manager.get_store()?;
//! let partition = store.primary_partition()?;
//!
//! let orders = DestinationId::queue("orders");
//! let consumer = ConsumerId::new(1);
//! partition.store_destination(DestinationInfo::queue("orders"), true)?;
//! partition.store_message(
//!     &orders,
//!     Message::new("m1", "hello"),
//!     Some(&[ConsumerState::routed(consumer)][..]),
//!     true,
//! )?;
//!
//! // The last acknowledgement removes the message.
//! let removed = partition.update_interest_state(
//!     &orders,
//!     &MessageId::new("m1"),
//!     consumer,
//!     InterestState::Acknowledged,
//!     true,
//!     None,
//!     true,
//! )?;
//! assert!(removed);
//! # Ok(())
//! # }
//! ```
//!
//! ## Backends
//!
//! | `STORE_TYPE` | Behaviour |
//! |--------------|-----------|
//! | `nopersist` | Metadata only, data operations fail with `Unsupported` |
//! | `memory` | Shared in-process state |
//! | `file` | Memory state with a write-ahead journal under `DATA_PATH` |
//!
//! See [`persist`] for the failover and migration protocols and
//! [`error`] for the status vocabulary.

#![forbid(unsafe_code)]

pub mod constants;
pub mod error;
pub mod persist;
pub mod telemetry;
pub mod types;

pub mod prelude {
    //! Common imports.
    pub use crate::error::{ErrorKind, Status, StoreError, StoreResult};
    pub use crate::persist::{
        BrokerInfo, BrokerState, ConsumerState, DestinationInfo, InterestState, Message,
        PartitionedStore, Store, StoreConfig, StoreDatabase, StoreManager, StoreType,
        TakeoverLockRequest, TakeoverTracker, TransactionState,
    };
    pub use crate::types::{
        BrokerId, ConsumerId, DestinationId, MessageId, PartitionId, SessionId, TransactionId,
    };

    pub use bytes;
}
