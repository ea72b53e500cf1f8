//! Broker and store-session tables shared by every broker on one database.
//!
//! The broker row is the only cross-broker coordination point. Every
//! conditional update on it (heartbeat, state, takeover lock) is evaluated
//! and applied under the table mutex, which makes each of them a single
//! atomic compare-and-swap.
//!
//! # Fencing
//!
//! `takeover_broker` is the fencing token. It is set by
//! [`BrokerTable::try_takeover_lock`] and stays set until the taken-over
//! broker restarts and resets it, or until the takeover is explicitly
//! abandoned with [`BrokerTable::restore_on_takeover_fail`]. While it is set,
//! conditional heartbeats and state changes from the former owner fail.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::sync::{lock, now_ms};
use super::txn_log::{AppendScope, LogRecord};
use crate::error::{Entity, StoreError, StoreResult, TakeoverLockError, TakeoverLockReason};
use crate::types::{BrokerId, SessionId};

/// Operational state recorded in a broker row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BrokerState {
    Initialized,
    Operating,
    QuiesceStarted,
    QuiesceCompleted,
    ShutdownStarted,
    ShutdownFailover,
    ShutdownComplete,
    FailoverPending,
    FailoverStarted,
    FailoverComplete,
    FailoverProcessed,
    FailoverFailed,
}

impl BrokerState {
    /// Another broker owns (or is acquiring) this broker's data.
    pub fn is_failover(self) -> bool {
        matches!(
            self,
            BrokerState::FailoverStarted
                | BrokerState::FailoverComplete
                | BrokerState::FailoverProcessed
        )
    }

    pub fn is_active(self) -> bool {
        matches!(
            self,
            BrokerState::Operating | BrokerState::QuiesceStarted | BrokerState::QuiesceCompleted
        )
    }
}

impl fmt::Display for BrokerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// One row of the broker table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerInfo {
    pub id: BrokerId,
    pub url: String,
    pub version: u32,
    pub state: BrokerState,
    /// Current store session, which is also the broker's primary partition.
    pub session: Option<SessionId>,
    pub heartbeat_ms: i64,
    /// Broker holding the takeover lock on this row.
    pub takeover_broker: Option<BrokerId>,
}

impl BrokerInfo {
    pub fn new(id: BrokerId, url: impl Into<String>, version: u32) -> Self {
        Self {
            id,
            url: url.into(),
            version,
            state: BrokerState::Initialized,
            session: None,
            heartbeat_ms: now_ms(),
            takeover_broker: None,
        }
    }

    /// True when the last heartbeat is older than `timeout` at `now_ms`.
    pub fn is_heartbeat_stale(&self, now_ms: i64, timeout: Duration) -> bool {
        now_ms.saturating_sub(self.heartbeat_ms) > timeout.as_millis() as i64
    }

    pub fn is_being_taken_over(&self) -> bool {
        self.takeover_broker.is_some()
    }
}

/// One generation of ownership over a partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreSession {
    pub id: SessionId,
    /// Broker currently owning the session's partition.
    pub broker: BrokerId,
    /// The owner's primary session.
    pub current: bool,
    pub creator: BrokerId,
    pub created_at_ms: i64,
}

/// Arguments of a takeover lock attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TakeoverLockRequest {
    pub new_broker: BrokerId,
    pub target: BrokerId,
    /// Heartbeat the caller observed when it judged the target dead.
    pub last_heartbeat: i64,
    /// State the caller observed.
    pub expected_state: BrokerState,
    pub new_heartbeat: i64,
    pub new_state: BrokerState,
    /// Ignore an existing takeover marker.
    ///
    /// Only safe when the operator knows the previous claimant is gone:
    /// nothing else fences it out.
    pub force: bool,
}

impl TakeoverLockRequest {
    /// Lock request conditioned on the row as `observed`.
    pub fn new(new_broker: BrokerId, observed: &BrokerInfo) -> Self {
        Self {
            new_broker,
            target: observed.id.clone(),
            last_heartbeat: observed.heartbeat_ms,
            expected_state: observed.state,
            new_heartbeat: now_ms(),
            new_state: BrokerState::FailoverStarted,
            force: false,
        }
    }

    pub fn forced(mut self) -> Self {
        self.force = true;
        self
    }
}

#[derive(Debug, Default)]
struct TableState {
    brokers: BTreeMap<BrokerId, BrokerInfo>,
    sessions: BTreeMap<SessionId, StoreSession>,
    next_session: u64,
}

impl TableState {
    fn broker(&self, id: &BrokerId) -> StoreResult<&BrokerInfo> {
        self.brokers
            .get(id)
            .ok_or_else(|| StoreError::not_found(Entity::Broker, id))
    }

    fn next_session_id(&self) -> SessionId {
        SessionId::new(self.next_session + 1)
    }
}

#[derive(Debug, Default)]
pub struct BrokerTable {
    state: Mutex<TableState>,
}

fn log(journal: Option<&AppendScope<'_>>, record: LogRecord) -> StoreResult<()> {
    match journal {
        Some(scope) => scope.append(&record, true),
        None => Ok(()),
    }
}

fn put_broker(
    state: &mut TableState,
    journal: Option<&AppendScope<'_>>,
    info: BrokerInfo,
) -> StoreResult<BrokerInfo> {
    log(journal, LogRecord::PutBroker { info: info.clone() })?;
    state.brokers.insert(info.id.clone(), info.clone());
    Ok(info)
}

fn put_session(
    state: &mut TableState,
    journal: Option<&AppendScope<'_>>,
    session: StoreSession,
) -> StoreResult<StoreSession> {
    log(
        journal,
        LogRecord::PutSession {
            session: session.clone(),
        },
    )?;
    state.sessions.insert(session.id, session.clone());
    Ok(session)
}

impl BrokerTable {
    pub fn new() -> Self {
        Self::default()
    }

    // =========================================================================
    // Brokers
    // =========================================================================

    pub fn add_broker(
        &self,
        journal: Option<&AppendScope<'_>>,
        info: BrokerInfo,
    ) -> StoreResult<BrokerInfo> {
        let mut state = lock(&self.state);
        if state.brokers.contains_key(&info.id) {
            return Err(StoreError::already_exists(Entity::Broker, &info.id));
        }
        info!(broker_id = %info.id, url = %info.url, "Added broker");
        put_broker(&mut state, journal, info)
    }

    pub fn get(&self, id: &BrokerId) -> Option<BrokerInfo> {
        lock(&self.state).brokers.get(id).cloned()
    }

    pub fn all(&self) -> Vec<BrokerInfo> {
        lock(&self.state).brokers.values().cloned().collect()
    }

    pub fn by_state(&self, broker_state: BrokerState) -> Vec<BrokerInfo> {
        lock(&self.state)
            .brokers
            .values()
            .filter(|b| b.state == broker_state)
            .cloned()
            .collect()
    }

    pub fn remove(&self, journal: Option<&AppendScope<'_>>, id: &BrokerId) -> StoreResult<()> {
        let mut state = lock(&self.state);
        state.broker(id)?;
        log(journal, LogRecord::DeleteBroker { id: id.clone() })?;
        state.brokers.remove(id);
        info!(broker_id = %id, "Removed broker");
        Ok(())
    }

    /// Move `id` from `expected` to `new_state`.
    ///
    /// Fails if the stored state differs or the row is being taken over.
    pub fn update_state(
        &self,
        journal: Option<&AppendScope<'_>>,
        id: &BrokerId,
        new_state: BrokerState,
        expected: BrokerState,
    ) -> StoreResult<BrokerInfo> {
        let mut state = lock(&self.state);
        let current = state.broker(id)?;
        if let Some(by) = &current.takeover_broker {
            return Err(StoreError::Precondition(format!(
                "broker {} is being taken over by {}",
                id, by
            )));
        }
        if current.state != expected {
            return Err(StoreError::Precondition(format!(
                "broker {} is {}, expected {}",
                id, current.state, expected
            )));
        }
        let mut updated = current.clone();
        updated.state = new_state;
        debug!(broker_id = %id, from = %expected, to = %new_state, "Broker state updated");
        put_broker(&mut state, journal, updated)
    }

    /// Write a new heartbeat and return it.
    ///
    /// Heartbeats are strictly increasing per row. With `expected_last` the
    /// update is conditional on the stored heartbeat and on the row not being
    /// taken over.
    pub fn update_heartbeat(
        &self,
        journal: Option<&AppendScope<'_>>,
        id: &BrokerId,
        expected_last: Option<i64>,
    ) -> StoreResult<i64> {
        let mut state = lock(&self.state);
        let current = state.broker(id)?;
        if let Some(expected) = expected_last {
            if current.heartbeat_ms != expected {
                return Err(StoreError::Precondition(format!(
                    "heartbeat of broker {} is {}, expected {}",
                    id, current.heartbeat_ms, expected
                )));
            }
            if current.state.is_failover() || current.takeover_broker.is_some() {
                warn!(broker_id = %id, state = %current.state, "Heartbeat rejected, broker has been taken over");
                return Err(StoreError::Precondition(format!(
                    "broker {} has been taken over",
                    id
                )));
            }
        }
        let mut updated = current.clone();
        updated.heartbeat_ms = now_ms().max(current.heartbeat_ms + 1);
        let heartbeat = updated.heartbeat_ms;
        put_broker(&mut state, journal, updated)?;
        Ok(heartbeat)
    }

    pub fn set_url(
        &self,
        journal: Option<&AppendScope<'_>>,
        id: &BrokerId,
        url: &str,
        version: u32,
    ) -> StoreResult<BrokerInfo> {
        let mut state = lock(&self.state);
        let mut updated = state.broker(id)?.clone();
        if updated.url == url && updated.version == version {
            return Ok(updated);
        }
        updated.url = url.to_string();
        updated.version = version;
        put_broker(&mut state, journal, updated)
    }

    // =========================================================================
    // Takeover
    // =========================================================================

    /// Conditionally claim the takeover lock on `request.target`.
    ///
    /// Returns the row before and after the update. A rejected attempt
    /// carries the row as it was when the condition was evaluated.
    pub fn try_takeover_lock(
        &self,
        journal: Option<&AppendScope<'_>>,
        request: &TakeoverLockRequest,
    ) -> StoreResult<(BrokerInfo, BrokerInfo)> {
        let mut state = lock(&self.state);
        let current = state.broker(&request.target)?;

        let reason = match &current.takeover_broker {
            Some(by) if !request.force => Some(TakeoverLockReason::AlreadyTakenOver(by.clone())),
            _ if current.state != request.expected_state => Some(TakeoverLockReason::StateChanged),
            _ if current.heartbeat_ms != request.last_heartbeat => {
                Some(TakeoverLockReason::HeartbeatChanged)
            }
            _ => None,
        };
        if let Some(reason) = reason {
            return Err(TakeoverLockError {
                target: request.target.clone(),
                requester: request.new_broker.clone(),
                reason,
                current: current.clone(),
            }
            .into());
        }

        let saved = current.clone();
        let mut updated = saved.clone();
        updated.state = request.new_state;
        updated.heartbeat_ms = request.new_heartbeat;
        updated.takeover_broker = Some(request.new_broker.clone());
        let updated = put_broker(&mut state, journal, updated)?;
        Ok((saved, updated))
    }

    /// Mark a takeover by `by` as finished.
    pub fn complete_takeover(
        &self,
        journal: Option<&AppendScope<'_>>,
        target: &BrokerId,
        by: &BrokerId,
    ) -> StoreResult<BrokerInfo> {
        let mut state = lock(&self.state);
        let current = state.broker(target)?;
        if current.takeover_broker.as_ref() != Some(by)
            || current.state != BrokerState::FailoverStarted
        {
            return Err(StoreError::Precondition(format!(
                "broker {} is not being taken over by {}",
                target, by
            )));
        }
        let mut updated = current.clone();
        updated.state = BrokerState::FailoverComplete;
        put_broker(&mut state, journal, updated)
    }

    /// Clear the takeover marker of a broker whose takeover finished, so the
    /// broker can start again with a fresh session.
    pub fn reset_takeover(
        &self,
        journal: Option<&AppendScope<'_>>,
        id: &BrokerId,
    ) -> StoreResult<BrokerInfo> {
        let mut state = lock(&self.state);
        let current = state.broker(id)?;
        if !matches!(
            current.state,
            BrokerState::FailoverComplete | BrokerState::FailoverProcessed
        ) {
            return Err(StoreError::Precondition(format!(
                "broker {} is {}, takeover has not completed",
                id, current.state
            )));
        }
        let mut updated = current.clone();
        updated.takeover_broker = None;
        updated.state = BrokerState::Initialized;
        updated.session = None;
        updated.heartbeat_ms = now_ms().max(current.heartbeat_ms + 1);
        info!(broker_id = %id, "Reset takeover marker");
        put_broker(&mut state, journal, updated)
    }

    /// Abandon a takeover started by `by`, restoring the heartbeat saved at
    /// lock time.
    pub fn restore_on_takeover_fail(
        &self,
        journal: Option<&AppendScope<'_>>,
        target: &BrokerId,
        by: &BrokerId,
        saved_heartbeat: i64,
    ) -> StoreResult<BrokerInfo> {
        let mut state = lock(&self.state);
        let current = state.broker(target)?;
        if current.takeover_broker.as_ref() != Some(by)
            || current.state != BrokerState::FailoverStarted
        {
            return Err(StoreError::Precondition(format!(
                "broker {} has no takeover in progress by {}",
                target, by
            )));
        }
        let mut updated = current.clone();
        updated.takeover_broker = None;
        updated.heartbeat_ms = saved_heartbeat;
        updated.state = BrokerState::FailoverFailed;
        warn!(target_broker = %target, by = %by, "Takeover abandoned, broker row restored");
        put_broker(&mut state, journal, updated)
    }

    // =========================================================================
    // Sessions
    // =========================================================================

    /// Create a session owned by `broker`. A current session demotes the
    /// broker's previous current session and is recorded in the broker row.
    ///
    /// All of it is journaled as one batch before the table changes, so a
    /// failed write leaves the previous current session in place.
    pub fn create_session(
        &self,
        journal: Option<&AppendScope<'_>>,
        broker: &BrokerId,
        creator: &BrokerId,
        current: bool,
    ) -> StoreResult<StoreSession> {
        let mut state = lock(&self.state);
        let mut row = state.broker(broker)?.clone();

        let session = StoreSession {
            id: state.next_session_id(),
            broker: broker.clone(),
            current,
            creator: creator.clone(),
            created_at_ms: now_ms(),
        };
        let mut sessions = vec![session.clone()];
        if current {
            sessions.extend(
                state
                    .sessions
                    .values()
                    .filter(|s| s.current && &s.broker == broker)
                    .map(|s| StoreSession {
                        current: false,
                        ..s.clone()
                    }),
            );
            row.session = Some(session.id);
        }

        let mut records: Vec<LogRecord> = sessions
            .iter()
            .map(|s| LogRecord::PutSession { session: s.clone() })
            .collect();
        if current {
            records.push(LogRecord::PutBroker { info: row.clone() });
        }
        log(journal, LogRecord::Batch { records })?;

        state.next_session = session.id.value();
        for s in sessions {
            state.sessions.insert(s.id, s);
        }
        if current {
            state.brokers.insert(row.id.clone(), row);
        }
        info!(broker_id = %broker, session = %session.id, current, "Created store session");
        Ok(session)
    }

    pub fn session(&self, id: SessionId) -> Option<StoreSession> {
        lock(&self.state).sessions.get(&id).cloned()
    }

    pub fn sessions_by_broker(&self, broker: &BrokerId) -> Vec<StoreSession> {
        lock(&self.state)
            .sessions
            .values()
            .filter(|s| &s.broker == broker)
            .cloned()
            .collect()
    }

    pub fn current_session(&self, broker: &BrokerId) -> Option<SessionId> {
        lock(&self.state)
            .sessions
            .values()
            .find(|s| s.current && &s.broker == broker)
            .map(|s| s.id)
    }

    /// Hand a non-current session to `target`.
    pub fn move_session(
        &self,
        journal: Option<&AppendScope<'_>>,
        id: SessionId,
        target: &BrokerId,
    ) -> StoreResult<StoreSession> {
        let mut state = lock(&self.state);
        state.broker(target)?;
        let mut session = state
            .sessions
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found(Entity::Session, id))?;
        if session.current {
            return Err(StoreError::Precondition(format!(
                "session {} is the current session of {}",
                id, session.broker
            )));
        }
        session.broker = target.clone();
        put_session(&mut state, journal, session)
    }

    /// Move every session of `target` to `new_owner`, demoting them.
    pub fn take_over_sessions(
        &self,
        journal: Option<&AppendScope<'_>>,
        new_owner: &BrokerId,
        target: &BrokerId,
    ) -> StoreResult<Vec<StoreSession>> {
        let mut state = lock(&self.state);
        let owned: Vec<StoreSession> = state
            .sessions
            .values()
            .filter(|s| &s.broker == target)
            .cloned()
            .collect();
        let moved: Vec<StoreSession> = owned
            .into_iter()
            .map(|s| StoreSession {
                broker: new_owner.clone(),
                current: false,
                ..s
            })
            .collect();
        if moved.is_empty() {
            return Ok(moved);
        }
        log(
            journal,
            LogRecord::Batch {
                records: moved
                    .iter()
                    .map(|s| LogRecord::PutSession { session: s.clone() })
                    .collect(),
            },
        )?;
        for s in &moved {
            state.sessions.insert(s.id, s.clone());
        }
        Ok(moved)
    }

    // =========================================================================
    // Replay
    // =========================================================================

    pub(crate) fn apply_broker(&self, info: BrokerInfo) {
        lock(&self.state).brokers.insert(info.id.clone(), info);
    }

    pub(crate) fn apply_delete_broker(&self, id: &BrokerId) {
        lock(&self.state).brokers.remove(id);
    }

    pub(crate) fn apply_session(&self, session: StoreSession) {
        let mut state = lock(&self.state);
        state.next_session = state.next_session.max(session.id.value());
        state.sessions.insert(session.id, session);
    }

    pub(crate) fn snapshot(&self) -> (Vec<BrokerInfo>, Vec<StoreSession>) {
        let state = lock(&self.state);
        (
            state.brokers.values().cloned().collect(),
            state.sessions.values().cloned().collect(),
        )
    }
}
