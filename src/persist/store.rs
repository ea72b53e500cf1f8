//! Broker-level store handle.
//!
//! A [`Store`] is one broker's view of the shared [`StoreDatabase`]. It owns
//! the partition directory, the broker row and sessions of its broker, and
//! the drain guard that gates every store-level call.
//!
//! # Lifecycle
//!
//! ```text
//! Store::new ──► load_partitions ──► (ready) ──► close
//!    │                                   │
//!    └─ registers broker, revival check  └─ takeover / migration
//! ```
//!
//! Partition accessors fail with `NotReady` until
//! [`load_partitions`](Store::load_partitions) has run.

use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info, warn};

use super::broker_table::{BrokerInfo, BrokerState, StoreSession};
use super::change_log::ChangeRecordLog;
use super::config::{StoreConfig, StoreType};
use super::database::{ConfigChangeRecord, StoreDatabase};
use super::drain::DrainGuard;
use super::exclusive::{ExclusiveLocks, ExclusiveRequest};
use super::memory::MemoryPartition;
use super::metrics;
use super::migration::{ClusterNotifier, PartitionListener};
use super::no_persist::NoPersistPartition;
use super::partition::PartitionedStore;
use super::sync::{lock, now_ms, read, write};
use crate::constants::MASTER_BROKER_PROPERTY;
use crate::error::{Entity, LoadErrors, StoreError, StoreResult};
use crate::types::{BrokerId, PartitionId, SessionId};

pub struct Store {
    pub(super) broker_id: BrokerId,
    pub(super) config: StoreConfig,
    pub(super) db: Arc<StoreDatabase>,
    pub(super) drain: DrainGuard,
    pub(super) partitions: RwLock<BTreeMap<PartitionId, Arc<dyn PartitionedStore>>>,
    primary: RwLock<Option<PartitionId>>,
    ready: AtomicBool,
    listeners: RwLock<Vec<Arc<dyn PartitionListener>>>,
    notifier: RwLock<Option<Arc<dyn ClusterNotifier>>>,
    /// Rows saved when this broker took a takeover lock, keyed by target.
    pub(super) takeover_locks: Mutex<HashMap<BrokerId, BrokerInfo>>,
    pub(super) exclusive: ExclusiveLocks,
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("broker_id", &self.broker_id)
            .field("store_type", &self.db.store_type())
            .field("partitions", &read(&self.partitions).len())
            .field("ready", &self.ready.load(Ordering::Acquire))
            .field("closed", &self.drain.is_closed())
            .finish()
    }
}

impl Store {
    /// Register this broker with the database and make sure it has a
    /// current session. Partitions are not loaded yet.
    ///
    /// A broker whose row is still being taken over refuses to start: the
    /// taking broker owns its data. A row whose takeover completed is reset
    /// and the broker starts over with a fresh session.
    pub fn new(config: StoreConfig, db: Arc<StoreDatabase>) -> StoreResult<Self> {
        config.check()?;
        let broker_id = config.broker_id.clone();

        db.with_journal(|j| {
            let brokers = db.brokers();
            let row = match brokers.get(&broker_id) {
                None => brokers.add_broker(
                    j,
                    BrokerInfo::new(
                        broker_id.clone(),
                        config.broker_url.clone(),
                        config.protocol_version,
                    ),
                )?,
                Some(row) if row.state == BrokerState::FailoverStarted => {
                    let by = row
                        .takeover_broker
                        .as_ref()
                        .map(ToString::to_string)
                        .unwrap_or_else(|| "another broker".to_string());
                    warn!(broker_id = %broker_id, by = %by, "Broker is being taken over, refusing to open store");
                    return Err(StoreError::NotAllowed(format!(
                        "broker {} is being taken over by {}",
                        broker_id, by
                    )));
                }
                Some(row) if row.state.is_failover() => {
                    info!(broker_id = %broker_id, state = %row.state, "Broker was taken over, starting with a fresh session");
                    brokers.reset_takeover(j, &broker_id)?
                }
                Some(row) => row,
            };

            brokers.set_url(j, &broker_id, &config.broker_url, config.protocol_version)?;
            if brokers.current_session(&broker_id).is_none() {
                brokers.create_session(j, &broker_id, &broker_id, true)?;
            }
            if row.state != BrokerState::Operating {
                brokers.update_state(j, &broker_id, BrokerState::Operating, row.state)?;
            }
            brokers.update_heartbeat(j, &broker_id, None)?;
            Ok(())
        })?;

        info!(
            broker_id = %broker_id,
            store_type = %config.store_type,
            partition_mode = config.partition_mode,
            "Store registered"
        );

        Ok(Self {
            broker_id,
            config,
            db,
            drain: DrainGuard::new("store"),
            partitions: RwLock::new(BTreeMap::new()),
            primary: RwLock::new(None),
            ready: AtomicBool::new(false),
            listeners: RwLock::new(Vec::new()),
            notifier: RwLock::new(None),
            takeover_locks: Mutex::new(HashMap::new()),
            exclusive: ExclusiveLocks::new(),
        })
    }

    /// [`new`](Store::new) followed by [`load_partitions`](Store::load_partitions).
    pub fn open(config: StoreConfig, db: Arc<StoreDatabase>) -> StoreResult<Self> {
        let store = Self::new(config, db)?;
        store.load_partitions()?;
        Ok(store)
    }

    pub fn broker_id(&self) -> &BrokerId {
        &self.broker_id
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn database(&self) -> &Arc<StoreDatabase> {
        &self.db
    }

    pub fn store_type(&self) -> StoreType {
        self.db.store_type()
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn set_notifier(&self, notifier: Arc<dyn ClusterNotifier>) {
        *write(&self.notifier) = Some(notifier);
    }

    pub(super) fn notifier(&self) -> Option<Arc<dyn ClusterNotifier>> {
        read(&self.notifier).clone()
    }

    pub fn add_listener(&self, listener: Arc<dyn PartitionListener>) {
        write(&self.listeners).push(listener);
    }

    // =========================================================================
    // Partition directory
    // =========================================================================

    /// Open every session this broker owns as a partition and mark the
    /// store ready. The current session becomes the primary partition.
    pub fn load_partitions(&self) -> StoreResult<()> {
        let _permit = self.drain.enter()?;
        let current = self.db.brokers().current_session(&self.broker_id).ok_or_else(|| {
            StoreError::Precondition(format!("broker {} has no current session", self.broker_id))
        })?;
        *write(&self.primary) = Some(PartitionId::from(current));

        for session in self.db.brokers().sessions_by_broker(&self.broker_id) {
            let id = PartitionId::from(session.id);
            if read(&self.partitions).contains_key(&id) {
                continue;
            }
            self.attach_partition(id, session.current);
        }

        self.ready.store(true, Ordering::Release);
        let loaded = read(&self.partitions).len();
        metrics::set_loaded_partitions(loaded);
        info!(broker_id = %self.broker_id, primary = %current, partitions = loaded, "Store partitions loaded");
        Ok(())
    }

    fn check_ready(&self) -> StoreResult<()> {
        if !self.is_ready() {
            return Err(StoreError::NotReady);
        }
        Ok(())
    }

    pub fn primary_partition(&self) -> StoreResult<Arc<dyn PartitionedStore>> {
        let _permit = self.drain.enter()?;
        self.check_ready()?;
        let id = read(&self.primary).ok_or(StoreError::NotReady)?;
        self.loaded_partition(id)
    }

    pub fn store_partition(&self, id: PartitionId) -> StoreResult<Arc<dyn PartitionedStore>> {
        let _permit = self.drain.enter()?;
        self.check_ready()?;
        self.loaded_partition(id)
    }

    pub fn all_store_partitions(&self) -> StoreResult<Vec<Arc<dyn PartitionedStore>>> {
        let _permit = self.drain.enter()?;
        self.check_ready()?;
        Ok(read(&self.partitions).values().cloned().collect())
    }

    pub fn partition_ids(&self) -> Vec<PartitionId> {
        read(&self.partitions).keys().copied().collect()
    }

    pub(super) fn loaded_partition(&self, id: PartitionId) -> StoreResult<Arc<dyn PartitionedStore>> {
        read(&self.partitions)
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found(Entity::Partition, id))
    }

    fn open_partition(&self, id: PartitionId, primary: bool) -> Arc<dyn PartitionedStore> {
        match self.db.store_type() {
            StoreType::NoPersist => Arc::new(NoPersistPartition::new(id)),
            StoreType::Memory | StoreType::File => Arc::new(MemoryPartition::open(
                self.db.clone(),
                self.db.partition_data(id),
                primary,
            )),
        }
    }

    /// Open `id` and add it to the directory, replacing any stale handle.
    pub(super) fn attach_partition(&self, id: PartitionId, primary: bool) -> Arc<dyn PartitionedStore> {
        let partition = self.open_partition(id, primary);
        let previous = write(&self.partitions).insert(id, partition.clone());
        if let Some(stale) = previous {
            stale.close();
        }
        debug!(broker_id = %self.broker_id, partition = %id, primary, "Partition attached");
        for listener in read(&self.listeners).iter() {
            listener.partition_added(id);
        }
        metrics::set_loaded_partitions(read(&self.partitions).len());
        partition
    }

    /// Remove `id` from the directory and close it.
    pub(super) fn detach_partition(&self, id: PartitionId) -> Option<Arc<dyn PartitionedStore>> {
        let removed = write(&self.partitions).remove(&id)?;
        removed.close();
        debug!(broker_id = %self.broker_id, partition = %id, "Partition detached");
        for listener in read(&self.listeners).iter() {
            listener.partition_removed(id);
        }
        metrics::set_loaded_partitions(read(&self.partitions).len());
        Some(removed)
    }

    // =========================================================================
    // Properties and config change records
    // =========================================================================

    pub fn property(&self, name: &str) -> StoreResult<Option<String>> {
        let _permit = self.drain.enter()?;
        Ok(self.db.property(name))
    }

    pub fn all_properties(&self) -> StoreResult<BTreeMap<String, String>> {
        let _permit = self.drain.enter()?;
        Ok(self.db.all_properties())
    }

    /// Set a property, or remove it with `None`.
    pub fn update_property(&self, name: &str, value: Option<&str>, sync: bool) -> StoreResult<()> {
        let _permit = self.drain.enter()?;
        if name.is_empty() {
            return Err(StoreError::BadRequest("property name is empty".to_string()));
        }
        self.db.update_property(name, value.map(str::to_string), sync)
    }

    pub fn store_config_change_record(
        &self,
        payload: Bytes,
        reset: bool,
        sync: bool,
    ) -> StoreResult<ConfigChangeRecord> {
        let _permit = self.drain.enter()?;
        self.db.add_config_record(payload, reset, sync)
    }

    /// Records newer than `timestamp_ms`, oldest first.
    pub fn config_change_records_since(&self, timestamp_ms: i64) -> StoreResult<Vec<ConfigChangeRecord>> {
        let _permit = self.drain.enter()?;
        Ok(self.db.config_records_since(timestamp_ms))
    }

    pub fn all_config_change_records(&self) -> StoreResult<Vec<ConfigChangeRecord>> {
        let _permit = self.drain.enter()?;
        Ok(self.db.all_config_records())
    }

    pub fn clear_config_change_records(&self, sync: bool) -> StoreResult<()> {
        let _permit = self.drain.enter()?;
        self.db.clear_config_records(sync)
    }

    /// Record `new_master` as the cluster's master broker and return the
    /// previous one.
    pub fn change_master_broker(&self, new_master: &BrokerId) -> StoreResult<Option<String>> {
        let _permit = self.drain.enter()?;
        let _guard = self.exclusive.try_acquire(ExclusiveRequest::ChangeMasterBroker)?;
        if self.db.brokers().get(new_master).is_none() {
            return Err(StoreError::not_found(Entity::Broker, new_master));
        }
        let previous = self.db.property(MASTER_BROKER_PROPERTY);
        self.db
            .update_property(MASTER_BROKER_PROPERTY, Some(new_master.to_string()), true)?;
        info!(previous = ?previous, new_master = %new_master, "Master broker changed");
        Ok(previous)
    }

    pub fn master_broker(&self) -> StoreResult<Option<BrokerId>> {
        let _permit = self.drain.enter()?;
        Ok(self.db.property(MASTER_BROKER_PROPERTY).map(BrokerId::from))
    }

    pub fn change_log(&self) -> &ChangeRecordLog {
        self.db.change_log()
    }

    // =========================================================================
    // Broker table
    // =========================================================================

    pub fn add_broker_info(&self, info: BrokerInfo) -> StoreResult<BrokerInfo> {
        let _permit = self.drain.enter()?;
        self.db.with_journal(|j| self.db.brokers().add_broker(j, info))
    }

    pub fn broker_info(&self, id: &BrokerId) -> StoreResult<BrokerInfo> {
        let _permit = self.drain.enter()?;
        self.db
            .brokers()
            .get(id)
            .ok_or_else(|| StoreError::not_found(Entity::Broker, id))
    }

    pub fn all_broker_infos(&self) -> StoreResult<Vec<BrokerInfo>> {
        let _permit = self.drain.enter()?;
        Ok(self.db.brokers().all())
    }

    pub fn broker_infos_by_state(&self, state: BrokerState) -> StoreResult<Vec<BrokerInfo>> {
        let _permit = self.drain.enter()?;
        Ok(self.db.brokers().by_state(state))
    }

    pub fn remove_broker(&self, id: &BrokerId) -> StoreResult<()> {
        let _permit = self.drain.enter()?;
        if id == &self.broker_id {
            return Err(StoreError::NotAllowed(format!(
                "broker {} cannot remove its own row",
                id
            )));
        }
        self.db.with_journal(|j| self.db.brokers().remove(j, id))
    }

    pub fn update_broker_state(
        &self,
        id: &BrokerId,
        new_state: BrokerState,
        expected: BrokerState,
    ) -> StoreResult<BrokerInfo> {
        let _permit = self.drain.enter()?;
        self.db
            .with_journal(|j| self.db.brokers().update_state(j, id, new_state, expected))
    }

    pub fn update_broker_url(&self, id: &BrokerId, url: &str, version: u32) -> StoreResult<BrokerInfo> {
        let _permit = self.drain.enter()?;
        self.db
            .with_journal(|j| self.db.brokers().set_url(j, id, url, version))
    }

    /// Write a new heartbeat for `id` and return it.
    pub fn update_broker_heartbeat(&self, id: &BrokerId, expected_last: Option<i64>) -> StoreResult<i64> {
        let _permit = self.drain.enter()?;
        self.db
            .with_journal(|j| self.db.brokers().update_heartbeat(j, id, expected_last))
    }

    /// This broker's periodic beacon. Fails once the broker has been taken
    /// over.
    pub fn heartbeat(&self) -> StoreResult<i64> {
        let last = self.broker_heartbeat(&self.broker_id)?;
        self.update_broker_heartbeat(&self.broker_id, Some(last))
    }

    pub fn broker_heartbeat(&self, id: &BrokerId) -> StoreResult<i64> {
        self.broker_info(id).map(|info| info.heartbeat_ms)
    }

    pub fn all_broker_heartbeats(&self) -> StoreResult<BTreeMap<BrokerId, i64>> {
        Ok(self
            .all_broker_infos()?
            .into_iter()
            .map(|info| (info.id, info.heartbeat_ms))
            .collect())
    }

    pub fn is_being_taken_over(&self, id: &BrokerId) -> StoreResult<bool> {
        self.broker_info(id).map(|info| info.is_being_taken_over())
    }

    /// Other brokers whose heartbeat is older than the configured timeout
    /// and that nobody is taking over yet.
    pub fn stale_brokers(&self) -> StoreResult<Vec<BrokerInfo>> {
        let now = now_ms();
        Ok(self
            .all_broker_infos()?
            .into_iter()
            .filter(|b| b.id != self.broker_id)
            .filter(|b| !b.is_being_taken_over())
            .filter(|b| b.is_heartbeat_stale(now, self.config.heartbeat_timeout))
            .collect())
    }

    // =========================================================================
    // Store sessions
    // =========================================================================

    pub fn create_store_session(&self, broker: &BrokerId, current: bool) -> StoreResult<StoreSession> {
        let _permit = self.drain.enter()?;
        self.db.with_journal(|j| {
            self.db
                .brokers()
                .create_session(j, broker, &self.broker_id, current)
        })
    }

    pub fn current_session(&self) -> StoreResult<SessionId> {
        let _permit = self.drain.enter()?;
        self.db
            .brokers()
            .current_session(&self.broker_id)
            .ok_or_else(|| StoreError::not_found(Entity::Session, &self.broker_id))
    }

    fn session(&self, id: SessionId) -> StoreResult<StoreSession> {
        self.db
            .brokers()
            .session(id)
            .ok_or_else(|| StoreError::not_found(Entity::Session, id))
    }

    pub fn store_session_owner(&self, id: SessionId) -> StoreResult<BrokerId> {
        let _permit = self.drain.enter()?;
        self.session(id).map(|s| s.broker)
    }

    pub fn store_session_creator(&self, id: SessionId) -> StoreResult<BrokerId> {
        let _permit = self.drain.enter()?;
        self.session(id).map(|s| s.creator)
    }

    pub fn owns_store_session(&self, id: SessionId) -> StoreResult<bool> {
        let _permit = self.drain.enter()?;
        Ok(self
            .db
            .brokers()
            .session(id)
            .is_some_and(|s| s.broker == self.broker_id))
    }

    pub fn sessions_by_broker(&self, broker: &BrokerId) -> StoreResult<Vec<StoreSession>> {
        let _permit = self.drain.enter()?;
        Ok(self.db.brokers().sessions_by_broker(broker))
    }

    /// Hand a non-current session to `target` without touching loaded
    /// partitions. Migration uses [`migrate_partition`](Store::migrate_partition).
    pub fn move_store_session(&self, id: SessionId, target: &BrokerId) -> StoreResult<StoreSession> {
        let _permit = self.drain.enter()?;
        self.db
            .with_journal(|j| self.db.brokers().move_session(j, id, target))
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Stop admitting calls, wait for in-flight ones, then close every
    /// partition. With `cleanup` the journal is compacted.
    pub fn close(&self, cleanup: bool) -> StoreResult<()> {
        if !self.drain.close_and_wait() {
            return Ok(());
        }
        let partitions: Vec<_> = std::mem::take(&mut *write(&self.partitions))
            .into_values()
            .collect();
        for partition in &partitions {
            partition.close();
        }
        self.ready.store(false, Ordering::Release);
        metrics::set_loaded_partitions(0);
        info!(broker_id = %self.broker_id, partitions = partitions.len(), cleanup, "Store closed");

        if cleanup {
            self.db.checkpoint()?;
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.drain.is_closed()
    }

    /// Snapshot the database and truncate the journal.
    pub fn checkpoint(&self) -> StoreResult<()> {
        let _permit = self.drain.enter()?;
        self.db.checkpoint()
    }

    /// Entries skipped while the database was recovered.
    pub fn take_load_errors(&self) -> LoadErrors {
        self.db.take_load_errors()
    }

    pub fn debug_state(&self) -> BTreeMap<String, String> {
        let mut state = BTreeMap::new();
        state.insert("broker".to_string(), self.broker_id.to_string());
        state.insert("store_type".to_string(), self.db.store_type().to_string());
        state.insert("ready".to_string(), self.is_ready().to_string());
        state.insert("closed".to_string(), self.is_closed().to_string());
        state.insert("in_progress".to_string(), self.drain.in_progress().to_string());
        if let Some(primary) = *read(&self.primary) {
            state.insert("primary".to_string(), primary.to_string());
        }
        state.insert(
            "partitions".to_string(),
            self.partition_ids()
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(","),
        );
        state.insert(
            "pending_notifications".to_string(),
            self.db.pending_notifications().len().to_string(),
        );
        if let Some(request) = self.exclusive.current() {
            state.insert("exclusive".to_string(), request.to_string());
        }
        state.insert(
            "held_takeover_locks".to_string(),
            lock(&self.takeover_locks).len().to_string(),
        );
        state
    }
}
