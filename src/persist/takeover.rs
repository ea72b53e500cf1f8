//! HA takeover of a failed broker's store.
//!
//! # Protocol
//!
//! ```text
//! 1. get_takeover_lock     one conditional update on the target row:
//!                          heartbeat and state must match what the caller
//!                          observed and nobody may hold the marker yet
//! 2. take_over_broker_store  collect the target's data, move its sessions,
//!                          fence its partitions, mark the takeover complete
//! 3. notify                tell the cluster; failures are persisted
//! ```
//!
//! The takeover marker written in step 1 is the fencing token. A broker
//! whose row carries it refuses to open its store and its heartbeats are
//! rejected. If step 2 fails the marker stays in place and the target is
//! left in `FailoverStarted` until
//! [`restore_on_takeover_fail`](Store::restore_on_takeover_fail) runs.
//!
//! # Forced Takeover
//!
//! `force` ignores an existing marker. Two brokers can then both believe
//! they own the target's data. Nothing here prevents that; operators must
//! make sure the previous claimant is gone.

use num_derive::FromPrimitive;
use num_traits::FromPrimitive as _;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use tracing::{info, warn};

use super::broker_table::{BrokerInfo, StoreSession, TakeoverLockRequest};
use super::message::DestinationInfo;
use super::metrics;
use super::migration::NotificationKind;
use super::store::Store;
use super::sync::{lock, now_ms};
use super::transaction::{TransactionInfo, TransactionType};
use crate::error::{StoreError, StoreResult};
use crate::types::{BrokerId, DestinationId, MessageId, PartitionId};

/// Progress of a takeover, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, FromPrimitive)]
#[repr(u8)]
pub enum TakeoverStage {
    BeforeGetLock = 0,
    AfterGetLock = 1,
    BeforeTakeStore = 2,
    BeforeSwitchOwner = 3,
    AfterSwitchOwner = 4,
    AfterTakeStore = 5,
}

impl fmt::Display for TakeoverStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TakeoverStage::BeforeGetLock => "before get lock",
            TakeoverStage::AfterGetLock => "after get lock",
            TakeoverStage::BeforeTakeStore => "before take store",
            TakeoverStage::BeforeSwitchOwner => "before switch owner",
            TakeoverStage::AfterSwitchOwner => "after switch owner",
            TakeoverStage::AfterTakeStore => "after take store",
        };
        f.write_str(name)
    }
}

/// Shared progress record of one takeover.
///
/// Another thread may [`cancel`](TakeoverTracker::cancel) the takeover; the
/// cancellation is honoured at the next stage boundary up to the ownership
/// switch. Once sessions have changed owner the takeover runs to the end.
#[derive(Debug)]
pub struct TakeoverTracker {
    target: BrokerId,
    stage: AtomicU8,
    cancelled: AtomicBool,
}

impl TakeoverTracker {
    pub fn new(target: BrokerId) -> Self {
        Self {
            target,
            stage: AtomicU8::new(TakeoverStage::BeforeGetLock as u8),
            cancelled: AtomicBool::new(false),
        }
    }

    pub fn target(&self) -> &BrokerId {
        &self.target
    }

    pub fn stage(&self) -> TakeoverStage {
        TakeoverStage::from_u8(self.stage.load(Ordering::Acquire))
            .unwrap_or(TakeoverStage::BeforeGetLock)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Enter `stage`, failing if the takeover was cancelled.
    pub fn advance(&self, stage: TakeoverStage) -> StoreResult<()> {
        if self.is_cancelled() {
            return Err(StoreError::NotAllowed(format!(
                "takeover of {} was cancelled",
                self.target
            )));
        }
        self.mark(stage);
        Ok(())
    }

    fn mark(&self, stage: TakeoverStage) {
        self.stage.store(stage as u8, Ordering::Release);
    }
}

/// What a takeover transferred.
#[derive(Debug, Clone)]
pub struct TakeoverStoreInfo {
    pub target: BrokerId,
    /// The target's row as it was before the lock was taken.
    pub saved_broker_info: BrokerInfo,
    pub lock_acquired_at_ms: i64,
    pub destinations: Vec<DestinationInfo>,
    pub messages: Vec<(DestinationId, MessageId)>,
    pub local_transactions: Vec<TransactionInfo>,
    pub cluster_transactions: Vec<TransactionInfo>,
    pub remote_transactions: Vec<TransactionInfo>,
    pub sessions: Vec<StoreSession>,
    pub partitions: Vec<PartitionId>,
}

impl TakeoverStoreInfo {
    fn new(saved: BrokerInfo) -> Self {
        Self {
            target: saved.id.clone(),
            lock_acquired_at_ms: now_ms(),
            saved_broker_info: saved,
            destinations: Vec::new(),
            messages: Vec::new(),
            local_transactions: Vec::new(),
            cluster_transactions: Vec::new(),
            remote_transactions: Vec::new(),
            sessions: Vec::new(),
            partitions: Vec::new(),
        }
    }
}

impl Store {
    /// Claim the takeover lock on `request.target`.
    ///
    /// Returns the target's row as it was before the claim. A lost race
    /// fails with [`StoreError::TakeoverLock`] carrying the row that beat
    /// the request.
    pub fn get_takeover_lock(&self, request: &TakeoverLockRequest) -> StoreResult<BrokerInfo> {
        let _permit = self.drain.enter()?;
        if request.new_broker != self.broker_id {
            return Err(StoreError::BadRequest(format!(
                "takeover lock requested for {} on store of {}",
                request.new_broker, self.broker_id
            )));
        }
        if request.target == self.broker_id {
            return Err(StoreError::BadRequest(format!(
                "broker {} cannot take over itself",
                self.broker_id
            )));
        }
        if request.force {
            warn!(
                target_broker = %request.target,
                requester = %self.broker_id,
                "Forced takeover lock requested, an existing claim will be ignored"
            );
        }

        let result = self
            .db
            .with_journal(|j| self.db.brokers().try_takeover_lock(j, request));
        match result {
            Ok((saved, updated)) => {
                metrics::record_takeover_lock(if request.force { "forced" } else { "acquired" });
                info!(
                    target_broker = %request.target,
                    by = %self.broker_id,
                    state = %updated.state,
                    "Takeover lock acquired"
                );
                lock(&self.takeover_locks).insert(request.target.clone(), saved.clone());
                Ok(saved)
            }
            Err(e) => {
                if matches!(e, StoreError::TakeoverLock(_)) {
                    metrics::record_takeover_lock("contested");
                    info!(target_broker = %request.target, by = %self.broker_id, error = %e, "Takeover lock contested");
                }
                Err(e)
            }
        }
    }

    /// Take over the store of `target`, whose lock this broker holds.
    ///
    /// Sessions of the target move to this broker and become non-primary
    /// partitions here. Handles the target still has open are fenced. On
    /// failure the error carries the stage reached and the target stays
    /// marked as being taken over.
    pub fn take_over_broker_store(
        &self,
        target: &BrokerId,
        tracker: &TakeoverTracker,
    ) -> StoreResult<TakeoverStoreInfo> {
        let _permit = self.drain.enter()?;
        let saved = lock(&self.takeover_locks).get(target).cloned().ok_or_else(|| {
            StoreError::NotAllowed(format!(
                "broker {} does not hold the takeover lock on {}",
                self.broker_id, target
            ))
        })?;
        tracker.mark(TakeoverStage::AfterGetLock);

        let result = self.transfer_store(saved, tracker);
        match result {
            Ok(taken) => {
                lock(&self.takeover_locks).remove(target);
                metrics::record_takeover("completed");
                info!(
                    target_broker = %target,
                    by = %self.broker_id,
                    partitions = taken.partitions.len(),
                    destinations = taken.destinations.len(),
                    messages = taken.messages.len(),
                    "Broker store taken over"
                );
                self.send_notification(NotificationKind::TakeoverComplete {
                    taken_over: target.clone(),
                    by: self.broker_id.clone(),
                });
                Ok(taken)
            }
            Err(e) => {
                let stage = tracker.stage();
                metrics::record_takeover("incomplete");
                warn!(target_broker = %target, stage = %stage, error = %e, "Takeover incomplete");
                Err(StoreError::TakeoverIncomplete {
                    target: target.clone(),
                    stage,
                    source: Box::new(e),
                })
            }
        }
    }

    fn transfer_store(
        &self,
        saved: BrokerInfo,
        tracker: &TakeoverTracker,
    ) -> StoreResult<TakeoverStoreInfo> {
        let target = saved.id.clone();
        tracker.advance(TakeoverStage::BeforeTakeStore)?;

        let current = self.db.brokers().get(&target).ok_or_else(|| {
            StoreError::Precondition(format!("broker {} disappeared during takeover", target))
        })?;
        if current.takeover_broker.as_ref() != Some(&self.broker_id) {
            return Err(StoreError::Precondition(format!(
                "takeover marker of {} is no longer held by {}",
                target, self.broker_id
            )));
        }

        let mut taken = TakeoverStoreInfo::new(saved);
        taken.sessions = self.db.brokers().sessions_by_broker(&target);
        for session in &taken.sessions {
            let id = PartitionId::from(session.id);
            taken.partitions.push(id);
            let Some(data) = self.db.find_partition(id) else {
                continue;
            };
            taken.destinations.extend(data.all_destinations());
            taken.messages.extend(data.message_locations());
            for txn in data.all_transactions() {
                match txn.kind {
                    TransactionType::Local => taken.local_transactions.push(txn),
                    TransactionType::Cluster => taken.cluster_transactions.push(txn),
                    TransactionType::Remote => taken.remote_transactions.push(txn),
                }
            }
        }

        tracker.advance(TakeoverStage::BeforeSwitchOwner)?;
        self.db.with_journal(|j| {
            self.db
                .brokers()
                .take_over_sessions(j, &self.broker_id, &target)
        })?;
        for id in &taken.partitions {
            self.db.bump_epoch(*id);
        }
        tracker.mark(TakeoverStage::AfterSwitchOwner);

        self.db.with_journal(|j| {
            self.db
                .brokers()
                .complete_takeover(j, &target, &self.broker_id)
        })?;
        if self.is_ready() {
            for id in &taken.partitions {
                self.attach_partition(*id, false);
            }
        }
        tracker.mark(TakeoverStage::AfterTakeStore);
        Ok(taken)
    }

    /// Abandon a takeover of `target` this broker started: the marker is
    /// cleared, the saved heartbeat restored and the row set to
    /// `FailoverFailed`.
    pub fn restore_on_takeover_fail(&self, target: &BrokerId) -> StoreResult<BrokerInfo> {
        let _permit = self.drain.enter()?;
        let saved = lock(&self.takeover_locks).get(target).cloned().ok_or_else(|| {
            StoreError::NotAllowed(format!(
                "broker {} holds no takeover lock on {}",
                self.broker_id, target
            ))
        })?;
        let restored = self.db.with_journal(|j| {
            self.db.brokers().restore_on_takeover_fail(
                j,
                target,
                &self.broker_id,
                saved.heartbeat_ms,
            )
        })?;
        lock(&self.takeover_locks).remove(target);
        metrics::record_takeover("restored");
        Ok(restored)
    }

    /// Targets this broker holds a takeover lock on.
    pub fn held_takeover_locks(&self) -> Vec<BrokerId> {
        lock(&self.takeover_locks).keys().cloned().collect()
    }
}
