//! Change-record log for clusters without a master broker.
//!
//! Configuration changes (brokers joining, destinations and durable
//! subscriptions created or removed) are appended with increasing sequence
//! numbers. Every broker replays the log through a [`ChangeLogCursor`] and
//! applies each distinct change once.
//!
//! # Reset Record
//!
//! Sequence 1 is always the reset record. It carries a UUID identifying this
//! incarnation of the log; appends must name it, and a cursor that sees a
//! different UUID discards its position and replays from the start.
//!
//! # Lock Records
//!
//! A record with `lock` set claims its uniqueness key for its origin broker,
//! a lightweight lease. Another broker's claim on the same key fails until a
//! non-lock record for the key releases it.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};
use uuid::Uuid;

use super::metrics;
use super::sync::{lock, now_ms};
use super::txn_log::{AppendScope, LogRecord, TxnLog};
use crate::constants::CHANGE_LOG_RESET_SEQ;
use crate::error::{Entity, StoreError, StoreResult};
use crate::types::BrokerId;

const RESET_KEY: &str = "__reset__";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeRecordKind {
    Reset,
    AddBroker,
    RemoveBroker,
    AddDestination,
    RemoveDestination,
    AddDurable,
    RemoveDurable,
}

impl fmt::Display for ChangeRecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub seq: u64,
    /// Uniqueness key; replaying a key already applied with the same kind is
    /// a no-op.
    pub ukey: String,
    pub kind: ChangeRecordKind,
    pub payload: Bytes,
    pub timestamp_ms: i64,
    /// Exclusive claim on `ukey`.
    pub lock: bool,
    pub origin: BrokerId,
    pub reset_uuid: Uuid,
}

/// A record to append. The log assigns the sequence number.
#[derive(Debug, Clone)]
pub struct ChangeRecordDraft {
    pub ukey: String,
    pub kind: ChangeRecordKind,
    pub payload: Bytes,
    pub lock: bool,
    pub origin: BrokerId,
    /// Reset UUID the writer last saw.
    pub reset_uuid: Uuid,
}

impl ChangeRecordDraft {
    pub fn new(
        ukey: impl Into<String>,
        kind: ChangeRecordKind,
        payload: impl Into<Bytes>,
        origin: BrokerId,
        reset_uuid: Uuid,
    ) -> Self {
        Self {
            ukey: ukey.into(),
            kind,
            payload: payload.into(),
            lock: false,
            origin,
            reset_uuid,
        }
    }

    /// Turn the record into a claim on its key.
    pub fn claim(mut self) -> Self {
        self.lock = true;
        self
    }
}

#[derive(Debug, Default)]
struct LogState {
    records: Vec<ChangeRecord>,
    next_seq: u64,
    lock_id: Option<String>,
}

impl LogState {
    fn reset_record(&self) -> Option<&ChangeRecord> {
        self.records
            .first()
            .filter(|r| r.kind == ChangeRecordKind::Reset)
    }
}

/// Persisted image of the change-record log.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeLogSnapshot {
    pub records: Vec<ChangeRecord>,
    pub lock_id: Option<String>,
}

fn log(journal: Option<&AppendScope<'_>>, record: LogRecord) -> StoreResult<()> {
    match journal {
        Some(scope) => scope.append(&record, true),
        None => Ok(()),
    }
}

fn install_reset(state: &mut LogState, reset: ChangeRecord, lock_id: Option<String>) {
    state.records.clear();
    state.next_seq = reset.seq + 1;
    state.records.push(reset);
    state.lock_id = lock_id;
}

/// The log itself. With a journal every change is written ahead, so the
/// sequence, the reset UUID and the table lock survive a restart.
#[derive(Debug, Default)]
pub struct ChangeRecordLog {
    state: Mutex<LogState>,
    journal: Option<Arc<TxnLog>>,
}

impl ChangeRecordLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn journaled(journal: Option<Arc<TxnLog>>) -> Self {
        Self {
            state: Mutex::default(),
            journal,
        }
    }

    /// Run `f` on the locked state inside a journal append scope.
    fn write_with<T>(
        &self,
        f: impl FnOnce(&mut LogState, Option<&AppendScope<'_>>) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let scope = self.journal.as_deref().map(TxnLog::begin_append);
        let mut state = lock(&self.state);
        f(&mut state, scope.as_ref())
    }

    /// Seed an empty log. With `lock_id` the table stays locked against
    /// appends until [`unlock`](Self::unlock) is called with the same id.
    pub fn insert_reset_record(
        &self,
        origin: &BrokerId,
        lock_id: Option<String>,
    ) -> StoreResult<Uuid> {
        self.write_with(|state, journal| {
            if let Some(existing) = state.reset_record() {
                return Err(StoreError::already_exists(
                    Entity::ChangeRecord,
                    format!("reset {}", existing.reset_uuid),
                ));
            }
            Self::seed(state, journal, origin, lock_id)
        })
    }

    /// Drop every record and start a new incarnation.
    pub fn reset(&self, origin: &BrokerId, lock_id: Option<String>) -> StoreResult<Uuid> {
        self.write_with(|state, journal| {
            let dropped = state.records.len();
            let uuid = Self::seed(state, journal, origin, lock_id)?;
            info!(reset_uuid = %uuid, dropped, "Change-record log reset");
            Ok(uuid)
        })
    }

    fn seed(
        state: &mut LogState,
        journal: Option<&AppendScope<'_>>,
        origin: &BrokerId,
        lock_id: Option<String>,
    ) -> StoreResult<Uuid> {
        let reset = ChangeRecord {
            seq: CHANGE_LOG_RESET_SEQ,
            ukey: RESET_KEY.to_string(),
            kind: ChangeRecordKind::Reset,
            payload: Bytes::new(),
            timestamp_ms: now_ms(),
            lock: false,
            origin: origin.clone(),
            reset_uuid: Uuid::new_v4(),
        };
        let uuid = reset.reset_uuid;
        log(
            journal,
            LogRecord::ResetChangeLog {
                reset: reset.clone(),
                lock_id: lock_id.clone(),
            },
        )?;
        install_reset(state, reset, lock_id);
        Ok(uuid)
    }

    pub fn reset_uuid(&self) -> Option<Uuid> {
        lock(&self.state).reset_record().map(|r| r.reset_uuid)
    }

    pub fn lock_id(&self) -> Option<String> {
        lock(&self.state).lock_id.clone()
    }

    /// Replace the table lock if it currently equals `expected`.
    pub fn set_lock_id(&self, expected: Option<&str>, new: Option<String>) -> StoreResult<()> {
        self.write_with(|state, journal| {
            if state.lock_id.as_deref() != expected {
                return Err(StoreError::Precondition(format!(
                    "change-record table lock is {:?}, expected {:?}",
                    state.lock_id, expected
                )));
            }
            log(
                journal,
                LogRecord::SetChangeLogLock {
                    lock_id: new.clone(),
                },
            )?;
            state.lock_id = new;
            Ok(())
        })
    }

    pub fn unlock(&self, lock_id: &str) -> StoreResult<()> {
        self.set_lock_id(Some(lock_id), None)
    }

    /// Append a record and return its sequence number.
    pub fn append(&self, draft: ChangeRecordDraft) -> StoreResult<u64> {
        self.write_with(|state, journal| {
            let current = state.reset_record().map(|r| r.reset_uuid).ok_or_else(|| {
                StoreError::Precondition("change-record log has no reset record".into())
            })?;
            if draft.reset_uuid != current {
                return Err(StoreError::Precondition(format!(
                    "stale reset {} (current {})",
                    draft.reset_uuid, current
                )));
            }
            if let Some(lock_id) = &state.lock_id {
                return Err(StoreError::Precondition(format!(
                    "change-record table is locked by {}",
                    lock_id
                )));
            }
            if draft.lock {
                let holder = state
                    .records
                    .iter()
                    .rev()
                    .find(|r| r.ukey == draft.ukey && r.kind != ChangeRecordKind::Reset)
                    .filter(|r| r.lock && r.origin != draft.origin);
                if let Some(holder) = holder {
                    return Err(StoreError::already_exists(
                        Entity::ChangeRecord,
                        format!("claim on {} by {}", draft.ukey, holder.origin),
                    ));
                }
            }

            let record = ChangeRecord {
                seq: state.next_seq,
                ukey: draft.ukey,
                kind: draft.kind,
                payload: draft.payload,
                timestamp_ms: now_ms(),
                lock: draft.lock,
                origin: draft.origin,
                reset_uuid: current,
            };
            log(
                journal,
                LogRecord::PutChangeRecord {
                    record: record.clone(),
                },
            )?;
            let seq = record.seq;
            debug!(seq, ukey = %record.ukey, kind = %record.kind, lock = record.lock, "Appended change record");
            state.next_seq += 1;
            state.records.push(record);
            Ok(seq)
        })
    }

    /// The reset record followed by every record after `seq`.
    pub fn records_since(&self, seq: u64) -> Vec<ChangeRecord> {
        let state = lock(&self.state);
        Self::collect_since(&state, seq)
    }

    /// Like [`records_since`](Self::records_since), but starts from the
    /// beginning when the log was reset since the reader last saw
    /// `reset_uuid`. Sequence numbers restart after a reset, so a stale
    /// position would hide new records.
    pub fn records_after(&self, reset_uuid: Option<Uuid>, seq: u64) -> Vec<ChangeRecord> {
        let state = lock(&self.state);
        let current = state.reset_record().map(|r| r.reset_uuid);
        let from = if current.is_some() && current == reset_uuid {
            seq
        } else {
            0
        };
        Self::collect_since(&state, from)
    }

    fn collect_since(state: &LogState, seq: u64) -> Vec<ChangeRecord> {
        let mut out: Vec<ChangeRecord> = state.reset_record().cloned().into_iter().collect();
        out.extend(
            state
                .records
                .iter()
                .filter(|r| r.kind != ChangeRecordKind::Reset && r.seq > seq)
                .cloned(),
        );
        out
    }

    pub fn latest_seq(&self) -> u64 {
        lock(&self.state).records.last().map_or(0, |r| r.seq)
    }

    pub fn len(&self) -> usize {
        lock(&self.state).records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // =========================================================================
    // Replay
    // =========================================================================

    pub(crate) fn snapshot(&self) -> ChangeLogSnapshot {
        let state = lock(&self.state);
        ChangeLogSnapshot {
            records: state.records.clone(),
            lock_id: state.lock_id.clone(),
        }
    }

    pub(crate) fn restore(&self, snapshot: ChangeLogSnapshot) {
        let mut state = lock(&self.state);
        state.next_seq = snapshot.records.last().map_or(0, |r| r.seq + 1);
        state.records = snapshot.records;
        state.lock_id = snapshot.lock_id;
    }

    pub(crate) fn apply_reset(&self, reset: ChangeRecord, lock_id: Option<String>) {
        install_reset(&mut lock(&self.state), reset, lock_id);
    }

    /// Re-insert a journaled record. Replaying one that is already present
    /// is a no-op.
    pub(crate) fn apply_record(&self, record: ChangeRecord) -> StoreResult<()> {
        let mut state = lock(&self.state);
        let current = state.reset_record().map(|r| r.reset_uuid);
        if current != Some(record.reset_uuid) {
            return Err(StoreError::Precondition(format!(
                "change record {} belongs to reset {}",
                record.seq, record.reset_uuid
            )));
        }
        if state.records.iter().any(|r| r.seq == record.seq) {
            return Ok(());
        }
        state.next_seq = state.next_seq.max(record.seq + 1);
        state.records.push(record);
        state.records.sort_by_key(|r| r.seq);
        Ok(())
    }

    pub(crate) fn apply_lock(&self, lock_id: Option<String>) {
        lock(&self.state).lock_id = lock_id;
    }
}

/// Result of one [`ChangeLogCursor::replay`] pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReplayStats {
    pub applied: usize,
    pub skipped: usize,
    /// The cursor started over because the log was reset.
    pub reset: bool,
}

/// A reader's position in the change-record log.
#[derive(Debug, Clone, Default)]
pub struct ChangeLogCursor {
    last_applied: u64,
    reset_uuid: Option<Uuid>,
    applied: HashMap<String, ChangeRecordKind>,
}

impl ChangeLogCursor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_applied(&self) -> u64 {
        self.last_applied
    }

    pub fn reset_uuid(&self) -> Option<Uuid> {
        self.reset_uuid
    }

    /// Fetch what is new in `log` and [`replay`](Self::replay) it.
    pub fn sync<F>(&mut self, log: &ChangeRecordLog, apply: F) -> StoreResult<ReplayStats>
    where
        F: FnMut(&ChangeRecord) -> StoreResult<()>,
    {
        let records = log.records_after(self.reset_uuid, self.last_applied);
        self.replay(&records, apply)
    }

    /// Apply records strictly in sequence order.
    ///
    /// Records at or below the position are skipped. A record whose key was
    /// already applied with the same kind advances the position without
    /// calling `apply`. An error from `apply` stops the pass and leaves the
    /// position before the failed record.
    pub fn replay<F>(&mut self, records: &[ChangeRecord], mut apply: F) -> StoreResult<ReplayStats>
    where
        F: FnMut(&ChangeRecord) -> StoreResult<()>,
    {
        let mut ordered: Vec<&ChangeRecord> = records.iter().collect();
        ordered.sort_by_key(|r| r.seq);

        let mut stats = ReplayStats::default();
        for record in ordered {
            if record.kind == ChangeRecordKind::Reset {
                if self.reset_uuid != Some(record.reset_uuid) {
                    info!(reset_uuid = %record.reset_uuid, "Change-record cursor starting over");
                    self.reset_uuid = Some(record.reset_uuid);
                    self.last_applied = record.seq;
                    self.applied.clear();
                    stats.reset = true;
                    metrics::record_change_record("reset");
                }
                continue;
            }
            if self.reset_uuid != Some(record.reset_uuid) {
                return Err(StoreError::Precondition(format!(
                    "change record {} belongs to reset {}",
                    record.seq, record.reset_uuid
                )));
            }
            if record.seq <= self.last_applied {
                continue;
            }
            if self.applied.get(&record.ukey) == Some(&record.kind) {
                self.last_applied = record.seq;
                stats.skipped += 1;
                metrics::record_change_record("skipped");
                continue;
            }
            apply(record)?;
            self.applied.insert(record.ukey.clone(), record.kind);
            self.last_applied = record.seq;
            stats.applied += 1;
            metrics::record_change_record("applied");
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn draft(
        log: &ChangeRecordLog,
        key: &str,
        kind: ChangeRecordKind,
        origin: &str,
    ) -> ChangeRecordDraft {
        ChangeRecordDraft::new(
            key,
            kind,
            Bytes::from_static(b"{}"),
            BrokerId::new(origin),
            log.reset_uuid().unwrap(),
        )
    }

    #[test]
    fn test_append_requires_reset_record() {
        let log = ChangeRecordLog::new();
        let err = log
            .append(ChangeRecordDraft::new(
                "Q:a",
                ChangeRecordKind::AddDestination,
                Bytes::new(),
                BrokerId::new("b1"),
                Uuid::new_v4(),
            ))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PreconditionFailed);
    }

    #[test]
    fn test_sequence_starts_after_reset() {
        let log = ChangeRecordLog::new();
        log.insert_reset_record(&BrokerId::new("b1"), None).unwrap();
        let seq = log
            .append(draft(&log, "Q:a", ChangeRecordKind::AddDestination, "b1"))
            .unwrap();
        assert_eq!(seq, CHANGE_LOG_RESET_SEQ + 1);
        assert!(
            log.insert_reset_record(&BrokerId::new("b2"), None)
                .is_err()
        );
    }

    #[test]
    fn test_stale_reset_uuid_rejected() {
        let log = ChangeRecordLog::new();
        log.insert_reset_record(&BrokerId::new("b1"), None).unwrap();
        let stale = draft(&log, "Q:a", ChangeRecordKind::AddDestination, "b1");
        log.reset(&BrokerId::new("b1"), None).unwrap();
        assert!(log.append(stale).is_err());
    }

    #[test]
    fn test_locked_table_rejects_appends() {
        let log = ChangeRecordLog::new();
        log.insert_reset_record(&BrokerId::new("b1"), Some("seed".into()))
            .unwrap();
        assert!(
            log.append(draft(&log, "Q:a", ChangeRecordKind::AddDestination, "b1"))
                .is_err()
        );
        assert!(log.unlock("other").is_err());
        log.unlock("seed").unwrap();
        assert!(
            log.append(draft(&log, "Q:a", ChangeRecordKind::AddDestination, "b1"))
                .is_ok()
        );
    }

    #[test]
    fn test_claims_conflict_until_released() {
        let log = ChangeRecordLog::new();
        log.insert_reset_record(&BrokerId::new("b1"), None).unwrap();
        log.append(draft(&log, "durable:x", ChangeRecordKind::AddDurable, "b1").claim())
            .unwrap();

        let err = log
            .append(draft(&log, "durable:x", ChangeRecordKind::AddDurable, "b2").claim())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);

        log.append(draft(&log, "durable:x", ChangeRecordKind::RemoveDurable, "b1"))
            .unwrap();
        assert!(
            log.append(draft(&log, "durable:x", ChangeRecordKind::AddDurable, "b2").claim())
                .is_ok()
        );
    }

    #[test]
    fn test_records_since_includes_reset() {
        let log = ChangeRecordLog::new();
        log.insert_reset_record(&BrokerId::new("b1"), None).unwrap();
        for key in ["a", "b", "c"] {
            log.append(draft(&log, key, ChangeRecordKind::AddDestination, "b1"))
                .unwrap();
        }
        let since = log.records_since(3);
        assert_eq!(since.len(), 2);
        assert_eq!(since[0].kind, ChangeRecordKind::Reset);
        assert_eq!(since[1].seq, 4);
    }

    #[test]
    fn test_cursor_stops_at_failure() {
        let log = ChangeRecordLog::new();
        log.insert_reset_record(&BrokerId::new("b1"), None).unwrap();
        for key in ["a", "b"] {
            log.append(draft(&log, key, ChangeRecordKind::AddDestination, "b1"))
                .unwrap();
        }
        let mut cursor = ChangeLogCursor::new();
        let err = cursor
            .replay(&log.records_since(0), |r| {
                if r.ukey == "b" {
                    Err(StoreError::Unavailable("transport".into()))
                } else {
                    Ok(())
                }
            })
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unavailable);
        assert_eq!(cursor.last_applied(), 2);

        let stats = cursor
            .replay(&log.records_since(cursor.last_applied()), |_| Ok(()))
            .unwrap();
        assert_eq!(stats.applied, 1);
        assert_eq!(cursor.last_applied(), 3);
    }
}
