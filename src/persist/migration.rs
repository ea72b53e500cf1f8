//! Partition migration and cluster notifications.
//!
//! A non-primary partition can be handed to another broker:
//!
//! ```text
//! source                                   target
//!   close partition
//!   move session ─────────────► (owned, not loaded)
//!   bump epoch, arrival record
//!   notify ───────────────────► partition_arrived(Some(id))
//!                                  attach, clear arrival record
//! ```
//!
//! The move is committed before the cluster transport is told about it. A
//! notification that still fails after retries is persisted and re-sent by
//! [`Store::retry_pending_notifications`]; it never undoes the move.

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::exclusive::ExclusiveRequest;
use super::metrics;
use super::retry;
use super::store::Store;
use super::sync::now_ms;
use crate::error::{Entity, StoreError, StoreResult};
use crate::types::{BrokerId, PartitionId};

/// Cluster transport callbacks. Calls are fire-and-forget from the store's
/// point of view: a failure is retried, then persisted.
pub trait ClusterNotifier: Send + Sync {
    fn notify_partition_arrival(&self, target: &BrokerId, partition: PartitionId) -> StoreResult<()>;

    fn notify_takeover_complete(&self, taken_over: &BrokerId, by: &BrokerId) -> StoreResult<()>;
}

/// Observer of the partition directory.
pub trait PartitionListener: Send + Sync {
    fn partition_added(&self, partition: PartitionId);

    fn partition_removed(&self, partition: PartitionId);
}

/// A partition on its way to `to`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArrivalRecord {
    pub partition: PartitionId,
    pub from: BrokerId,
    pub to: BrokerId,
    pub at_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationKind {
    PartitionArrival {
        partition: PartitionId,
        target: BrokerId,
    },
    TakeoverComplete {
        taken_over: BrokerId,
        by: BrokerId,
    },
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotificationKind::PartitionArrival { partition, target } => {
                write!(f, "arrival of partition {} at {}", partition, target)
            }
            NotificationKind::TakeoverComplete { taken_over, by } => {
                write!(f, "takeover of {} by {}", taken_over, by)
            }
        }
    }
}

/// A notification that could not be delivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub id: Uuid,
    pub kind: NotificationKind,
    pub origin: BrokerId,
    pub created_at_ms: i64,
}

impl NotificationRecord {
    pub fn new(origin: BrokerId, kind: NotificationKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            origin,
            created_at_ms: now_ms(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationOutcome {
    /// The target was told about the partition.
    Completed,
    /// The partition moved but the target was not reached. A retry record
    /// was persisted.
    NotificationPending,
}

fn dispatch(notifier: &dyn ClusterNotifier, kind: &NotificationKind) -> StoreResult<()> {
    match kind {
        NotificationKind::PartitionArrival { partition, target } => {
            notifier.notify_partition_arrival(target, *partition)
        }
        NotificationKind::TakeoverComplete { taken_over, by } => {
            notifier.notify_takeover_complete(taken_over, by)
        }
    }
}

impl Store {
    /// Send `kind` with the notification retry policy. Returns false if it
    /// was not delivered; a retry record is persisted when possible.
    ///
    /// Called after the store change it announces is committed, so nothing
    /// here fails the caller.
    pub(super) fn send_notification(&self, kind: NotificationKind) -> bool {
        let Some(notifier) = self.notifier() else {
            return true;
        };
        let result = retry::with_notification_policy(
            || dispatch(notifier.as_ref(), &kind),
            StoreError::is_retriable,
        );
        let Err(e) = result else {
            return true;
        };
        warn!(notification = %kind, error = %e, "Cluster notification failed, persisting for retry");
        let record = NotificationRecord::new(self.broker_id.clone(), kind);
        if let Err(e) = self.db.add_notification(record.clone()) {
            error!(notification = %record.kind, error = %e, "Failed to persist notification retry record");
        }
        metrics::set_pending_notifications(self.db.pending_notifications().len());
        false
    }

    /// Hand partition `id` to `target`.
    ///
    /// Requires partition mode with migration enabled. The primary partition
    /// never moves. The partition is closed here first and the expected
    /// arrival is recorded before ownership changes; if either step fails the
    /// partition is reattached locally and nothing has moved.
    pub fn migrate_partition(&self, id: PartitionId, target: &BrokerId) -> StoreResult<MigrationOutcome> {
        let _permit = self.drain.enter()?;
        let _guard = self.exclusive.try_acquire(ExclusiveRequest::MigrateStore)?;

        if !self.config.partition_mode {
            return Err(StoreError::Precondition(
                "partition mode is not enabled".to_string(),
            ));
        }
        if !self.config.partition_migratable {
            return Err(StoreError::Precondition(
                "partitions are not migratable".to_string(),
            ));
        }
        if !self.is_ready() {
            return Err(StoreError::NotReady);
        }
        if target == &self.broker_id {
            return Err(StoreError::BadRequest(format!(
                "partition {} is already owned by {}",
                id, target
            )));
        }
        if self.db.brokers().get(target).is_none() {
            return Err(StoreError::not_found(Entity::Broker, target));
        }

        let partition = self.loaded_partition(id)?;
        if partition.is_primary() {
            return Err(StoreError::Precondition(format!(
                "partition {} is the primary partition of {}",
                id, self.broker_id
            )));
        }

        info!(partition = %id, from = %self.broker_id, to = %target, "Migrating partition");
        self.detach_partition(id);

        let arrival = ArrivalRecord {
            partition: id,
            from: self.broker_id.clone(),
            to: target.clone(),
            at_ms: now_ms(),
        };
        if let Err(e) = self.db.put_arrival(arrival) {
            warn!(partition = %id, error = %e, "Failed to record partition arrival, reattaching");
            self.attach_partition(id, false);
            metrics::record_migration("failed");
            return Err(e);
        }

        let moved = self
            .db
            .with_journal(|j| self.db.brokers().move_session(j, id.session(), target));
        if let Err(e) = moved {
            warn!(partition = %id, error = %e, "Partition migration failed, reattaching");
            if let Err(clear) = self.db.remove_arrival(id) {
                warn!(partition = %id, error = %clear, "Failed to clear arrival record");
            }
            self.attach_partition(id, false);
            metrics::record_migration("failed");
            return Err(e);
        }
        self.db.bump_epoch(id);

        let delivered = self.send_notification(NotificationKind::PartitionArrival {
            partition: id,
            target: target.clone(),
        });
        let outcome = if delivered {
            MigrationOutcome::Completed
        } else {
            MigrationOutcome::NotificationPending
        };
        metrics::record_migration(match outcome {
            MigrationOutcome::Completed => "completed",
            MigrationOutcome::NotificationPending => "notification_pending",
        });
        info!(partition = %id, to = %target, outcome = ?outcome, "Partition migrated");
        Ok(outcome)
    }

    /// Attach partitions this broker owns but has not loaded.
    ///
    /// With `Some(id)` only that partition is attached; it must be owned by
    /// this broker. With `None` every owned, unloaded session is attached.
    /// Returns the partitions that were attached.
    pub fn partition_arrived(&self, id: Option<PartitionId>) -> StoreResult<Vec<PartitionId>> {
        let _permit = self.drain.enter()?;
        if !self.is_ready() {
            return Err(StoreError::NotReady);
        }

        let candidates = match id {
            Some(id) => {
                let session = self
                    .db
                    .brokers()
                    .session(id.session())
                    .ok_or_else(|| StoreError::not_found(Entity::Partition, id))?;
                if session.broker != self.broker_id {
                    return Err(StoreError::NotAllowed(format!(
                        "partition {} is owned by {}",
                        id, session.broker
                    )));
                }
                vec![id]
            }
            None => self
                .db
                .brokers()
                .sessions_by_broker(&self.broker_id)
                .into_iter()
                .map(|s| PartitionId::from(s.id))
                .collect(),
        };

        let loaded = self.partition_ids();
        let mut attached = Vec::new();
        for id in candidates {
            if loaded.contains(&id) {
                continue;
            }
            self.attach_partition(id, false);
            if let Err(e) = self.db.remove_arrival(id) {
                warn!(partition = %id, error = %e, "Failed to clear arrival record");
            }
            attached.push(id);
        }
        if !attached.is_empty() {
            info!(broker_id = %self.broker_id, partitions = ?attached, "Partitions arrived");
        }
        Ok(attached)
    }

    /// Re-send notifications this broker persisted earlier. Returns how many
    /// were delivered.
    pub fn retry_pending_notifications(&self) -> StoreResult<usize> {
        let _permit = self.drain.enter()?;
        let Some(notifier) = self.notifier() else {
            return Ok(0);
        };

        let mut delivered = 0;
        for record in self.db.pending_notifications() {
            if record.origin != self.broker_id {
                continue;
            }
            match dispatch(notifier.as_ref(), &record.kind) {
                Ok(()) => {
                    self.db.remove_notification(record.id)?;
                    delivered += 1;
                }
                Err(e) => {
                    warn!(notification = %record.kind, error = %e, "Notification retry failed");
                }
            }
        }
        metrics::set_pending_notifications(self.db.pending_notifications().len());
        Ok(delivered)
    }

    pub fn pending_notifications(&self) -> StoreResult<Vec<NotificationRecord>> {
        let _permit = self.drain.enter()?;
        Ok(self.db.pending_notifications())
    }
}
