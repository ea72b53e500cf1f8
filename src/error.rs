//! Store errors and the shared status vocabulary.
//!
//! Every fallible store operation returns [`StoreResult`]. Errors are a single
//! enum, [`StoreError`], with structured variants. Callers that only need to
//! branch on the category use [`StoreError::kind`]; protocol and admin layers
//! that answer with a status code use [`StoreError::status`].
//!
//! # Status Mapping
//!
//! | Kind | Status |
//! |------|--------|
//! | `NotFound` | 404 |
//! | `Conflict` | 409 |
//! | `Unsupported` | 405 |
//! | `NotAllowed` | 405 |
//! | `PreconditionFailed` | 412 |
//! | `BadRequest` | 400 |
//! | `Unavailable` | 503 |
//! | `IoFailure` | 500 |
//!
//! # Takeover Errors
//!
//! A lost takeover race is reported as [`StoreError::TakeoverLock`], which
//! carries the broker row as it looked when the conditional update was
//! rejected. A failure after the lock was taken is reported as
//! [`StoreError::TakeoverIncomplete`] with the stage that was reached; the
//! target stays marked as being taken over until it is explicitly restored.
//!
//! # Bulk Load
//!
//! Startup replay does not stop at the first bad entry. Problems are collected
//! into [`LoadErrors`] and the offending entries are skipped.

use num_derive::FromPrimitive;
use num_traits::FromPrimitive as _;
use std::fmt;
use std::io;
use thiserror::Error;

use crate::persist::{
    BrokerInfo, ExclusiveRequest, InterestState, TakeoverStage, TransactionState,
};
use crate::types::{BrokerId, ConsumerId, DestinationId, MessageId, PartitionId, TransactionId};

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Status codes shared with the protocol and admin layers.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, FromPrimitive, Default)]
pub enum Status {
    #[default]
    Ok = 200,
    BadRequest = 400,
    NotFound = 404,
    /// The operation is not allowed in the current state or by this backend.
    NotAllowed = 405,
    Conflict = 409,
    PreconditionFailed = 412,
    Error = 500,
    Unavailable = 503,
}

impl Status {
    /// Numeric status code.
    pub fn code(self) -> u16 {
        self as u16
    }

    /// Decode a numeric status code.
    pub fn from_code(code: u16) -> Option<Self> {
        Status::from_u16(code)
    }

    pub fn is_ok(self) -> bool {
        self == Status::Ok
    }

    /// Label used in metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Ok => "ok",
            Status::BadRequest => "bad_request",
            Status::NotFound => "not_found",
            Status::NotAllowed => "not_allowed",
            Status::Conflict => "conflict",
            Status::PreconditionFailed => "precondition_failed",
            Status::Error => "error",
            Status::Unavailable => "unavailable",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code(), self.as_str())
    }
}

/// Coarse classification of a [`StoreError`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    Unsupported,
    PreconditionFailed,
    NotAllowed,
    Unavailable,
    BadRequest,
    IoFailure,
}

impl ErrorKind {
    pub fn status(self) -> Status {
        match self {
            ErrorKind::NotFound => Status::NotFound,
            ErrorKind::Conflict => Status::Conflict,
            ErrorKind::Unsupported | ErrorKind::NotAllowed => Status::NotAllowed,
            ErrorKind::PreconditionFailed => Status::PreconditionFailed,
            ErrorKind::Unavailable => Status::Unavailable,
            ErrorKind::BadRequest => Status::BadRequest,
            ErrorKind::IoFailure => Status::Error,
        }
    }
}

/// Kind of record an error refers to.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Entity {
    Message,
    Destination,
    Transaction,
    InterestState,
    Broker,
    Session,
    Partition,
    Property,
    ChangeRecord,
    ArrivalRecord,
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Entity::Message => "message",
            Entity::Destination => "destination",
            Entity::Transaction => "transaction",
            Entity::InterestState => "interest state",
            Entity::Broker => "broker",
            Entity::Session => "store session",
            Entity::Partition => "partition",
            Entity::Property => "property",
            Entity::ChangeRecord => "change record",
            Entity::ArrivalRecord => "arrival record",
        };
        f.write_str(name)
    }
}

/// Why a takeover lock could not be acquired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TakeoverLockReason {
    /// The stored state differs from the expected state.
    StateChanged,
    /// The stored heartbeat differs from the last observed heartbeat.
    HeartbeatChanged,
    /// Another broker already holds the takeover token.
    AlreadyTakenOver(BrokerId),
}

impl fmt::Display for TakeoverLockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TakeoverLockReason::StateChanged => f.write_str("broker state changed"),
            TakeoverLockReason::HeartbeatChanged => f.write_str("broker heartbeat changed"),
            TakeoverLockReason::AlreadyTakenOver(by) => {
                write!(f, "already being taken over by {}", by)
            }
        }
    }
}

/// A contested takeover attempt.
///
/// `current` is the broker row observed when the conditional update was
/// rejected. For the losers of a race this is the winner's post-state.
#[derive(Debug, Clone, Error)]
#[error("broker {requester} failed to take the takeover lock on {target}: {reason}")]
pub struct TakeoverLockError {
    pub target: BrokerId,
    pub requester: BrokerId,
    pub reason: TakeoverLockReason,
    pub current: BrokerInfo,
}

/// Errors returned by the store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The addressed record does not exist.
    #[error("{entity} {id} not found")]
    NotFound { entity: Entity, id: String },

    /// A record with the same key already exists.
    #[error("{entity} {id} already exists")]
    AlreadyExists { entity: Entity, id: String },

    /// Consumer state may only move forward.
    #[error(
        "interest state of message {message} for consumer {consumer} cannot move from {from:?} to {to:?}"
    )]
    InvalidInterestTransition {
        message: MessageId,
        consumer: ConsumerId,
        from: InterestState,
        to: InterestState,
    },

    /// The transaction table does not allow this transition.
    #[error("transaction {txn} cannot move from {from} to {to}")]
    InvalidTransition {
        txn: TransactionId,
        from: TransactionState,
        to: TransactionState,
    },

    /// The backend does not implement the operation.
    #[error("{operation} is not supported by the {backend} store")]
    Unsupported {
        operation: &'static str,
        backend: &'static str,
    },

    /// The store or partition has been closed.
    #[error("store accessed after closed")]
    Closed,

    /// Partitions have not been loaded yet.
    #[error("store partitions are not ready")]
    NotReady,

    /// A required condition on stored state does not hold.
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// The caller is not allowed to perform the operation.
    #[error("not allowed: {0}")]
    NotAllowed(String),

    /// The request itself is malformed.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// A destination limit would be exceeded.
    #[error("destination {destination} is full: {reason}")]
    DestinationFull {
        destination: DestinationId,
        reason: String,
    },

    /// A collaborator (usually the cluster transport) cannot be reached.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Ownership of the partition moved after this handle was opened.
    #[error(
        "partition {partition} fenced: handle opened at epoch {expected_epoch}, current epoch {current_epoch}"
    )]
    Fenced {
        partition: PartitionId,
        expected_epoch: u64,
        current_epoch: u64,
    },

    /// Lost a takeover race.
    #[error(transparent)]
    TakeoverLock(Box<TakeoverLockError>),

    /// The takeover lock was held but the transfer did not finish.
    #[error("takeover of {target} stopped at {stage}: {source}")]
    TakeoverIncomplete {
        target: BrokerId,
        stage: TakeoverStage,
        #[source]
        source: Box<StoreError>,
    },

    /// Another exclusive request is in progress.
    #[error("{0} is already in progress")]
    ExclusiveLockHeld(ExclusiveRequest),

    /// Journal or snapshot I/O failed.
    #[error("I/O error while {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    /// A journal entry could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

impl StoreError {
    pub fn not_found(entity: Entity, id: impl fmt::Display) -> Self {
        StoreError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn already_exists(entity: Entity, id: impl fmt::Display) -> Self {
        StoreError::AlreadyExists {
            entity,
            id: id.to_string(),
        }
    }

    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        StoreError::Io {
            context: context.into(),
            source,
        }
    }

    /// Category of the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::NotFound { .. } => ErrorKind::NotFound,

            StoreError::AlreadyExists { .. } => ErrorKind::Conflict,
            StoreError::InvalidInterestTransition { .. } => ErrorKind::Conflict,
            StoreError::TakeoverLock(_) => ErrorKind::Conflict,

            StoreError::InvalidTransition { .. } => ErrorKind::PreconditionFailed,
            StoreError::NotReady => ErrorKind::PreconditionFailed,
            StoreError::Precondition(_) => ErrorKind::PreconditionFailed,
            StoreError::ExclusiveLockHeld(_) => ErrorKind::PreconditionFailed,

            StoreError::Unsupported { .. } => ErrorKind::Unsupported,

            StoreError::Closed => ErrorKind::NotAllowed,
            StoreError::NotAllowed(_) => ErrorKind::NotAllowed,
            StoreError::Fenced { .. } => ErrorKind::NotAllowed,

            StoreError::BadRequest(_) => ErrorKind::BadRequest,
            StoreError::Config(_) => ErrorKind::BadRequest,

            StoreError::DestinationFull { .. } => ErrorKind::Unavailable,
            StoreError::Unavailable(_) => ErrorKind::Unavailable,

            StoreError::TakeoverIncomplete { source, .. } => source.kind(),

            StoreError::Io { .. } => ErrorKind::IoFailure,
            StoreError::Serde(_) => ErrorKind::IoFailure,
        }
    }

    /// Status code for the error.
    pub fn status(&self) -> Status {
        self.kind().status()
    }

    /// Whether retrying the same call may succeed.
    pub fn is_retriable(&self) -> bool {
        match self {
            StoreError::Io { source, .. } => matches!(
                source.kind(),
                io::ErrorKind::Interrupted
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::TimedOut
                    | io::ErrorKind::ResourceBusy
            ),
            StoreError::Unavailable(_) => true,
            StoreError::DestinationFull { .. } => true,
            StoreError::ExclusiveLockHeld(_) => true,
            StoreError::TakeoverIncomplete { source, .. } => source.is_retriable(),

            // Fix the state or the request before retrying.
            StoreError::NotFound { .. }
            | StoreError::AlreadyExists { .. }
            | StoreError::InvalidInterestTransition { .. }
            | StoreError::InvalidTransition { .. }
            | StoreError::Unsupported { .. }
            | StoreError::Closed
            | StoreError::NotReady
            | StoreError::Precondition(_)
            | StoreError::NotAllowed(_)
            | StoreError::BadRequest(_)
            | StoreError::Fenced { .. }
            | StoreError::TakeoverLock(_)
            | StoreError::Serde(_)
            | StoreError::Config(_) => false,
        }
    }

    /// Snapshot attached to a lost takeover race.
    pub fn takeover_snapshot(&self) -> Option<&BrokerInfo> {
        match self {
            StoreError::TakeoverLock(e) => Some(&e.current),
            StoreError::TakeoverIncomplete { source, .. } => source.takeover_snapshot(),
            _ => None,
        }
    }
}

impl From<io::Error> for StoreError {
    fn from(e: io::Error) -> Self {
        StoreError::io("accessing store files", e)
    }
}

impl From<TakeoverLockError> for StoreError {
    fn from(e: TakeoverLockError) -> Self {
        StoreError::TakeoverLock(Box::new(e))
    }
}

/// Section of persisted state an entry was loaded from.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum LoadSection {
    Snapshot,
    Journal,
    Brokers,
    Sessions,
    Destinations,
    Messages,
    Transactions,
    Properties,
    ConfigRecords,
    ChangeRecords,
    Notifications,
}

/// One entry that failed to load.
#[derive(Debug)]
pub struct LoadError {
    pub section: LoadSection,
    /// Key or position of the entry (for example `line 12`).
    pub key: String,
    pub error: StoreError,
}

/// Problems collected while replaying persisted state.
#[derive(Debug, Default, Error)]
#[error("{} persisted entries failed to load", .entries.len())]
pub struct LoadErrors {
    entries: Vec<LoadError>,
}

impl LoadErrors {
    pub fn push(&mut self, section: LoadSection, key: impl Into<String>, error: StoreError) {
        self.entries.push(LoadError {
            section,
            key: key.into(),
            error,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LoadError> {
        self.entries.iter()
    }

    pub fn in_section(&self, section: LoadSection) -> impl Iterator<Item = &LoadError> {
        self.entries.iter().filter(move |e| e.section == section)
    }

    pub fn extend(&mut self, other: LoadErrors) {
        self.entries.extend(other.entries);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_round_trip() {
        for status in [
            Status::Ok,
            Status::BadRequest,
            Status::NotFound,
            Status::NotAllowed,
            Status::Conflict,
            Status::PreconditionFailed,
            Status::Error,
            Status::Unavailable,
        ] {
            assert_eq!(Status::from_code(status.code()), Some(status));
        }
        assert_eq!(Status::from_code(418), None);
    }

    #[test]
    fn test_kind_to_status() {
        let e = StoreError::not_found(Entity::Message, "m1");
        assert_eq!(e.kind(), ErrorKind::NotFound);
        assert_eq!(e.status(), Status::NotFound);

        let e = StoreError::already_exists(Entity::Destination, "Q:a");
        assert_eq!(e.status(), Status::Conflict);

        let e = StoreError::Unsupported {
            operation: "store_message",
            backend: "no-persist",
        };
        assert_eq!(e.kind(), ErrorKind::Unsupported);
        assert_eq!(e.status(), Status::NotAllowed);

        assert_eq!(StoreError::Closed.status(), Status::NotAllowed);
        assert_eq!(StoreError::NotReady.status(), Status::PreconditionFailed);
    }

    #[test]
    fn test_invalid_transition_is_precondition() {
        let e = StoreError::InvalidTransition {
            txn: TransactionId::new(1),
            from: TransactionState::Started,
            to: TransactionState::Committed,
        };
        assert_eq!(e.kind(), ErrorKind::PreconditionFailed);
        assert!(e.to_string().contains("STARTED"));
    }

    #[test]
    fn test_incomplete_takeover_inherits_kind() {
        let e = StoreError::TakeoverIncomplete {
            target: BrokerId::new("a"),
            stage: TakeoverStage::BeforeSwitchOwner,
            source: Box::new(StoreError::io(
                "writing journal",
                io::Error::new(io::ErrorKind::TimedOut, "slow disk"),
            )),
        };
        assert_eq!(e.kind(), ErrorKind::IoFailure);
        assert!(e.is_retriable());
    }

    #[test]
    fn test_io_retriable_by_kind() {
        let timed_out = StoreError::io("x", io::Error::new(io::ErrorKind::TimedOut, "t"));
        assert!(timed_out.is_retriable());
        let denied = StoreError::io("x", io::Error::new(io::ErrorKind::PermissionDenied, "p"));
        assert!(!denied.is_retriable());
    }

    #[test]
    fn test_load_errors_collects_by_section() {
        let mut errors = LoadErrors::default();
        assert!(errors.is_empty());
        errors.push(
            LoadSection::Journal,
            "line 3",
            StoreError::BadRequest("truncated".into()),
        );
        errors.push(
            LoadSection::Messages,
            "Q:a/m1",
            StoreError::not_found(Entity::Destination, "Q:a"),
        );
        assert_eq!(errors.len(), 2);
        assert_eq!(errors.in_section(LoadSection::Journal).count(), 1);
        assert_eq!(errors.to_string(), "2 persisted entries failed to load");
    }
}
