//! The shared backing store.
//!
//! A [`StoreDatabase`] holds everything the brokers of one HA cluster share:
//! the broker and session tables, partition data, global properties, config
//! change records, the change-record log and pending cluster notifications.
//! Each broker's [`Store`](super::Store) is a handle over an
//! `Arc<StoreDatabase>`.
//!
//! With `StoreType::File` every change is written ahead to a journal under
//! the data path, and the database is rebuilt from the snapshot and journal
//! when it is opened again.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

use super::broker_table::BrokerTable;
use super::change_log::ChangeRecordLog;
use super::config::{StoreConfig, StoreType};
use super::memory::PartitionData;
use super::migration::{ArrivalRecord, NotificationRecord};
use super::sync::{lock, now_ms, read, write};
use super::txn_log::{AppendScope, JournalSnapshot, LogRecord, PartitionSnapshot, Recovery, TxnLog};
use crate::error::{LoadErrors, LoadSection, StoreResult};
use crate::types::PartitionId;

/// A configuration change stored while a master broker is elected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigChangeRecord {
    pub id: Uuid,
    pub timestamp_ms: i64,
    pub payload: Bytes,
    /// Supersedes every earlier record.
    pub reset: bool,
}

#[derive(Debug)]
pub struct StoreDatabase {
    store_type: StoreType,
    brokers: BrokerTable,
    partitions: RwLock<HashMap<PartitionId, Arc<PartitionData>>>,
    properties: RwLock<BTreeMap<String, String>>,
    config_records: Mutex<Vec<ConfigChangeRecord>>,
    change_log: ChangeRecordLog,
    arrivals: Mutex<BTreeMap<PartitionId, ArrivalRecord>>,
    notifications: Mutex<Vec<NotificationRecord>>,
    journal: Option<Arc<TxnLog>>,
    load_errors: Mutex<LoadErrors>,
}

impl StoreDatabase {
    fn with_type(store_type: StoreType, journal: Option<TxnLog>) -> Self {
        let journal = journal.map(Arc::new);
        Self {
            store_type,
            brokers: BrokerTable::new(),
            partitions: RwLock::new(HashMap::new()),
            properties: RwLock::new(BTreeMap::new()),
            config_records: Mutex::new(Vec::new()),
            change_log: ChangeRecordLog::journaled(journal.clone()),
            arrivals: Mutex::new(BTreeMap::new()),
            notifications: Mutex::new(Vec::new()),
            journal,
            load_errors: Mutex::new(LoadErrors::default()),
        }
    }

    /// A database that lives only as long as the process.
    pub fn in_memory() -> Self {
        Self::with_type(StoreType::Memory, None)
    }

    /// A database whose partitions keep no data.
    pub fn no_persist() -> Self {
        Self::with_type(StoreType::NoPersist, None)
    }

    /// Open the database described by `config`, replaying the journal for a
    /// file store.
    pub fn open(config: &StoreConfig) -> StoreResult<Self> {
        match config.store_type {
            StoreType::NoPersist => Ok(Self::no_persist()),
            StoreType::Memory => Ok(Self::in_memory()),
            StoreType::File => {
                let (journal, recovery) =
                    TxnLog::open(&config.data_path, config.journal_checkpoint_bytes)?;
                let db = Self::with_type(StoreType::File, Some(journal));
                db.replay(recovery);
                Ok(db)
            }
        }
    }

    pub fn store_type(&self) -> StoreType {
        self.store_type
    }

    pub fn brokers(&self) -> &BrokerTable {
        &self.brokers
    }

    pub fn change_log(&self) -> &ChangeRecordLog {
        &self.change_log
    }

    /// Shared side of the journal gate, `None` without a journal.
    pub fn append_scope(&self) -> Option<AppendScope<'_>> {
        self.journal.as_deref().map(TxnLog::begin_append)
    }

    /// Make journal appends fail, for exercising error paths.
    #[cfg(test)]
    pub(crate) fn fail_journal_appends(&self, fail: bool) {
        if let Some(journal) = &self.journal {
            journal.fail_appends(fail);
        }
    }

    /// Run `f` under an append scope, then checkpoint if the journal grew
    /// past its limit.
    pub(crate) fn with_journal<T>(
        &self,
        f: impl FnOnce(Option<&AppendScope<'_>>) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let result = {
            let scope = self.append_scope();
            f(scope.as_ref())
        };
        self.maybe_checkpoint();
        result
    }

    // =========================================================================
    // Partitions
    // =========================================================================

    /// Data of partition `id`, created empty on first use.
    pub fn partition_data(&self, id: PartitionId) -> Arc<PartitionData> {
        if let Some(data) = read(&self.partitions).get(&id) {
            return data.clone();
        }
        write(&self.partitions)
            .entry(id)
            .or_insert_with(|| Arc::new(PartitionData::new(id)))
            .clone()
    }

    pub fn find_partition(&self, id: PartitionId) -> Option<Arc<PartitionData>> {
        read(&self.partitions).get(&id).cloned()
    }

    /// Fence every handle open on `id`.
    pub(crate) fn bump_epoch(&self, id: PartitionId) -> u64 {
        self.partition_data(id).bump_epoch()
    }

    // =========================================================================
    // Properties
    // =========================================================================

    pub fn property(&self, name: &str) -> Option<String> {
        read(&self.properties).get(name).cloned()
    }

    pub fn all_properties(&self) -> BTreeMap<String, String> {
        read(&self.properties).clone()
    }

    /// Set a property, or remove it with `None`.
    pub fn update_property(&self, name: &str, value: Option<String>, sync: bool) -> StoreResult<()> {
        self.with_journal(|journal| {
            let mut properties = write(&self.properties);
            if let Some(scope) = journal {
                scope.append(
                    &LogRecord::PutProperty {
                        name: name.to_string(),
                        value: value.clone(),
                    },
                    sync,
                )?;
            }
            match value {
                Some(v) => properties.insert(name.to_string(), v),
                None => properties.remove(name),
            };
            Ok(())
        })
    }

    // =========================================================================
    // Config change records
    // =========================================================================

    /// Append a config change record. A reset record replaces all earlier
    /// ones. Timestamps are strictly increasing.
    pub fn add_config_record(
        &self,
        payload: Bytes,
        reset: bool,
        sync: bool,
    ) -> StoreResult<ConfigChangeRecord> {
        self.with_journal(|journal| {
            let mut records = lock(&self.config_records);
            let last = records.last().map_or(i64::MIN, |r| r.timestamp_ms);
            let record = ConfigChangeRecord {
                id: Uuid::new_v4(),
                timestamp_ms: now_ms().max(last.saturating_add(1)),
                payload,
                reset,
            };
            if let Some(scope) = journal {
                if reset {
                    scope.append(&LogRecord::ClearConfigRecords, sync)?;
                }
                scope.append(
                    &LogRecord::PutConfigRecord {
                        record: record.clone(),
                    },
                    sync,
                )?;
            }
            if reset {
                records.clear();
            }
            records.push(record.clone());
            Ok(record)
        })
    }

    /// Records newer than `timestamp_ms`, oldest first.
    pub fn config_records_since(&self, timestamp_ms: i64) -> Vec<ConfigChangeRecord> {
        lock(&self.config_records)
            .iter()
            .filter(|r| r.timestamp_ms > timestamp_ms)
            .cloned()
            .collect()
    }

    pub fn all_config_records(&self) -> Vec<ConfigChangeRecord> {
        lock(&self.config_records).clone()
    }

    pub fn clear_config_records(&self, sync: bool) -> StoreResult<()> {
        self.with_journal(|journal| {
            let mut records = lock(&self.config_records);
            if let Some(scope) = journal {
                scope.append(&LogRecord::ClearConfigRecords, sync)?;
            }
            records.clear();
            Ok(())
        })
    }

    // =========================================================================
    // Migration bookkeeping
    // =========================================================================

    pub(crate) fn put_arrival(&self, record: ArrivalRecord) -> StoreResult<()> {
        self.with_journal(|journal| {
            let mut arrivals = lock(&self.arrivals);
            if let Some(scope) = journal {
                scope.append(
                    &LogRecord::PutArrival {
                        record: record.clone(),
                    },
                    true,
                )?;
            }
            arrivals.insert(record.partition, record);
            Ok(())
        })
    }

    pub(crate) fn remove_arrival(&self, partition: PartitionId) -> StoreResult<Option<ArrivalRecord>> {
        self.with_journal(|journal| {
            let mut arrivals = lock(&self.arrivals);
            if !arrivals.contains_key(&partition) {
                return Ok(None);
            }
            if let Some(scope) = journal {
                scope.append(&LogRecord::DeleteArrival { partition }, true)?;
            }
            Ok(arrivals.remove(&partition))
        })
    }

    pub fn arrival(&self, partition: PartitionId) -> Option<ArrivalRecord> {
        lock(&self.arrivals).get(&partition).cloned()
    }

    pub fn all_arrivals(&self) -> Vec<ArrivalRecord> {
        lock(&self.arrivals).values().cloned().collect()
    }

    pub(crate) fn add_notification(&self, record: NotificationRecord) -> StoreResult<()> {
        self.with_journal(|journal| {
            let mut pending = lock(&self.notifications);
            if let Some(scope) = journal {
                scope.append(
                    &LogRecord::PutNotification {
                        record: record.clone(),
                    },
                    true,
                )?;
            }
            pending.retain(|n| n.id != record.id);
            pending.push(record);
            Ok(())
        })
    }

    pub(crate) fn remove_notification(&self, id: Uuid) -> StoreResult<()> {
        self.with_journal(|journal| {
            let mut pending = lock(&self.notifications);
            if let Some(scope) = journal {
                scope.append(&LogRecord::DeleteNotification { id }, true)?;
            }
            pending.retain(|n| n.id != id);
            Ok(())
        })
    }

    /// Notifications waiting to be re-sent, oldest first.
    pub fn pending_notifications(&self) -> Vec<NotificationRecord> {
        lock(&self.notifications).clone()
    }

    // =========================================================================
    // Checkpoint and recovery
    // =========================================================================

    /// Write a snapshot and truncate the journal. No-op without a journal.
    pub fn checkpoint(&self) -> StoreResult<()> {
        self.checkpoint_if(|_| true)
    }

    /// Checkpoint once the journal is past its size limit. Failures are
    /// logged; the journal keeps growing and the next write tries again.
    pub(crate) fn maybe_checkpoint(&self) {
        let Some(journal) = &self.journal else {
            return;
        };
        if !journal.needs_checkpoint() {
            return;
        }
        if let Err(e) = self.checkpoint_if(TxnLog::needs_checkpoint) {
            warn!(error = %e, "Journal checkpoint failed");
        }
    }

    fn checkpoint_if(&self, due: impl FnOnce(&TxnLog) -> bool) -> StoreResult<()> {
        let Some(journal) = &self.journal else {
            return Ok(());
        };
        let scope = journal.begin_checkpoint();
        // Another writer may have checkpointed while we waited for the gate.
        if !due(journal.as_ref()) {
            return Ok(());
        }
        scope.rotate(&self.snapshot())
    }

    /// Image of the whole database.
    pub fn snapshot(&self) -> JournalSnapshot {
        let (brokers, sessions) = self.brokers.snapshot();
        let mut partitions: Vec<PartitionSnapshot> = read(&self.partitions)
            .values()
            .map(|data| data.snapshot())
            .collect();
        partitions.sort_by_key(|p| p.id);
        JournalSnapshot {
            brokers,
            sessions,
            partitions,
            properties: self.all_properties(),
            config_records: self.all_config_records(),
            arrivals: self.all_arrivals(),
            notifications: self.pending_notifications(),
            change_log: self.change_log.snapshot(),
        }
    }

    /// Problems found while replaying persisted state. Drains the list.
    pub fn take_load_errors(&self) -> LoadErrors {
        std::mem::take(&mut *lock(&self.load_errors))
    }

    fn replay(&self, recovery: Recovery) {
        let Recovery {
            snapshot,
            records,
            mut errors,
        } = recovery;

        if let Some(snapshot) = snapshot {
            self.apply_snapshot(snapshot, &mut errors);
        }
        let replayed = records.len();
        for record in records {
            self.apply(record, &mut errors);
        }
        for data in read(&self.partitions).values() {
            data.recount();
        }

        info!(
            partitions = read(&self.partitions).len(),
            replayed,
            skipped = errors.len(),
            "Store database recovered"
        );
        if !errors.is_empty() {
            warn!(error = %errors, "Some persisted entries were skipped");
        }
        lock(&self.load_errors).extend(errors);
    }

    fn apply_snapshot(&self, snapshot: JournalSnapshot, errors: &mut LoadErrors) {
        for info in snapshot.brokers {
            self.brokers.apply_broker(info);
        }
        for session in snapshot.sessions {
            self.brokers.apply_session(session);
        }
        for partition in snapshot.partitions {
            let data = self.partition_data(partition.id);
            for info in partition.destinations {
                data.apply_destination(info);
            }
            for (destination, record) in partition.messages {
                let key = format!("{}/{}/{}", partition.id, destination, record.message.id);
                if let Err(e) = data.apply_message(destination, record) {
                    errors.push(LoadSection::Messages, key, e);
                }
            }
            for record in partition.transactions {
                data.apply_transaction(record);
            }
        }
        *write(&self.properties) = snapshot.properties;
        *lock(&self.config_records) = snapshot.config_records;
        *lock(&self.arrivals) = snapshot
            .arrivals
            .into_iter()
            .map(|a| (a.partition, a))
            .collect();
        *lock(&self.notifications) = snapshot.notifications;
        self.change_log.restore(snapshot.change_log);
    }

    fn apply(&self, record: LogRecord, errors: &mut LoadErrors) {
        match record {
            LogRecord::PutBroker { info } => self.brokers.apply_broker(info),
            LogRecord::DeleteBroker { id } => self.brokers.apply_delete_broker(&id),
            LogRecord::PutSession { session } => self.brokers.apply_session(session),
            LogRecord::PutDestination { partition, info } => {
                self.partition_data(partition).apply_destination(info)
            }
            LogRecord::DeleteDestination { partition, id } => {
                self.partition_data(partition).apply_delete_destination(&id)
            }
            LogRecord::PutMessage {
                partition,
                destination,
                record,
            } => {
                let key = format!("{}/{}/{}", partition, destination, record.message.id);
                if let Err(e) = self
                    .partition_data(partition)
                    .apply_message(destination, record)
                {
                    errors.push(LoadSection::Messages, key, e);
                }
            }
            LogRecord::DeleteMessage {
                partition,
                destination,
                id,
            } => self
                .partition_data(partition)
                .apply_delete_message(&destination, &id),
            LogRecord::PutTransaction { partition, record } => {
                self.partition_data(partition).apply_transaction(record)
            }
            LogRecord::DeleteTransaction { partition, id } => {
                self.partition_data(partition).apply_delete_transaction(id)
            }
            LogRecord::PutProperty { name, value } => {
                let mut properties = write(&self.properties);
                match value {
                    Some(v) => properties.insert(name, v),
                    None => properties.remove(&name),
                };
            }
            LogRecord::PutConfigRecord { record } => {
                let mut records = lock(&self.config_records);
                records.retain(|r| r.id != record.id);
                records.push(record);
                records.sort_by_key(|r| r.timestamp_ms);
            }
            LogRecord::ClearConfigRecords => lock(&self.config_records).clear(),
            LogRecord::PutArrival { record } => {
                lock(&self.arrivals).insert(record.partition, record);
            }
            LogRecord::DeleteArrival { partition } => {
                lock(&self.arrivals).remove(&partition);
            }
            LogRecord::PutNotification { record } => {
                let mut pending = lock(&self.notifications);
                pending.retain(|n| n.id != record.id);
                pending.push(record);
            }
            LogRecord::DeleteNotification { id } => {
                lock(&self.notifications).retain(|n| n.id != id);
            }
            LogRecord::ResetChangeLog { reset, lock_id } => {
                self.change_log.apply_reset(reset, lock_id)
            }
            LogRecord::PutChangeRecord { record } => {
                let key = format!("seq {}", record.seq);
                if let Err(e) = self.change_log.apply_record(record) {
                    errors.push(LoadSection::ChangeRecords, key, e);
                }
            }
            LogRecord::SetChangeLogLock { lock_id } => self.change_log.apply_lock(lock_id),
            LogRecord::Batch { records } => {
                for record in records {
                    self.apply(record, errors);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_data_is_shared() {
        let db = StoreDatabase::in_memory();
        let a = db.partition_data(PartitionId::new(7));
        let b = db.partition_data(PartitionId::new(7));
        assert!(Arc::ptr_eq(&a, &b));
        assert!(db.find_partition(PartitionId::new(8)).is_none());
    }

    #[test]
    fn test_properties_set_and_remove() {
        let db = StoreDatabase::in_memory();
        db.update_property("mq.x", Some("1".into()), false).unwrap();
        assert_eq!(db.property("mq.x").as_deref(), Some("1"));
        db.update_property("mq.x", None, false).unwrap();
        assert_eq!(db.property("mq.x"), None);
    }

    #[test]
    fn test_config_records_ordered_and_reset() {
        let db = StoreDatabase::in_memory();
        let first = db
            .add_config_record(Bytes::from_static(b"a"), false, false)
            .unwrap();
        let second = db
            .add_config_record(Bytes::from_static(b"b"), false, false)
            .unwrap();
        assert!(second.timestamp_ms > first.timestamp_ms);
        assert_eq!(db.config_records_since(first.timestamp_ms), vec![second]);

        db.add_config_record(Bytes::from_static(b"c"), true, false)
            .unwrap();
        assert_eq!(db.all_config_records().len(), 1);
    }

    #[test]
    fn test_checkpoint_without_journal_is_noop() {
        let db = StoreDatabase::in_memory();
        assert!(db.checkpoint().is_ok());
        assert!(db.take_load_errors().is_empty());
    }
}
