//! Write-ahead journal backing the file store.
//!
//! The journal is a JSON-lines file of after-images: every line fully
//! describes the new value of one record (or its deletion). Replaying the
//! snapshot followed by the journal therefore reproduces the state regardless
//! of how many times a line is applied.
//!
//! # Locking
//!
//! ```text
//! appenders:   gate.read()  -> record lock -> writer mutex
//! checkpoint:  gate.write() -> record locks (read) -> writer mutex
//! ```
//!
//! Appenders share the gate, so they run concurrently and only serialize on
//! the file writer. A checkpoint takes the gate exclusively: once it holds the
//! gate no append is half done, so the snapshot it writes matches the journal
//! it truncates. Appenders take the gate before any record lock, so a waiting
//! appender never holds a lock the checkpoint needs.
//!
//! # Recovery
//!
//! A line that cannot be decoded (typically the torn last line after a crash)
//! is recorded in [`LoadErrors`] and skipped.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};

use super::broker_table::{BrokerInfo, StoreSession};
use super::change_log::{ChangeLogSnapshot, ChangeRecord};
use super::database::ConfigChangeRecord;
use super::memory::{MessageRecord, TransactionRecord};
use super::message::DestinationInfo;
use super::metrics;
use super::migration::{ArrivalRecord, NotificationRecord};
use super::retry;
use super::sync::{lock, read, write};
use crate::constants::{JOURNAL_FILE_NAME, SNAPSHOT_FILE_NAME, SNAPSHOT_TMP_FILE_NAME};
use crate::error::{LoadErrors, LoadSection, StoreError, StoreResult};
use crate::types::{BrokerId, DestinationId, MessageId, PartitionId, TransactionId};

/// One journal line.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum LogRecord {
    PutBroker {
        info: BrokerInfo,
    },
    DeleteBroker {
        id: BrokerId,
    },
    PutSession {
        session: StoreSession,
    },
    PutDestination {
        partition: PartitionId,
        info: DestinationInfo,
    },
    DeleteDestination {
        partition: PartitionId,
        id: DestinationId,
    },
    PutMessage {
        partition: PartitionId,
        destination: DestinationId,
        record: MessageRecord,
    },
    DeleteMessage {
        partition: PartitionId,
        destination: DestinationId,
        id: MessageId,
    },
    PutTransaction {
        partition: PartitionId,
        record: TransactionRecord,
    },
    DeleteTransaction {
        partition: PartitionId,
        id: TransactionId,
    },
    PutProperty {
        name: String,
        value: Option<String>,
    },
    PutConfigRecord {
        record: ConfigChangeRecord,
    },
    ClearConfigRecords,
    PutArrival {
        record: ArrivalRecord,
    },
    DeleteArrival {
        partition: PartitionId,
    },
    PutNotification {
        record: NotificationRecord,
    },
    DeleteNotification {
        id: uuid::Uuid,
    },
    /// Drops every change record and installs a new reset record.
    ResetChangeLog {
        reset: ChangeRecord,
        lock_id: Option<String>,
    },
    PutChangeRecord {
        record: ChangeRecord,
    },
    SetChangeLogLock {
        lock_id: Option<String>,
    },
    /// Several after-images that must apply together. One line, so a torn
    /// write loses all of them.
    Batch {
        records: Vec<LogRecord>,
    },
}

/// Persisted state of one partition inside a snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PartitionSnapshot {
    pub id: PartitionId,
    pub destinations: Vec<DestinationInfo>,
    pub messages: Vec<(DestinationId, MessageRecord)>,
    pub transactions: Vec<TransactionRecord>,
}

/// Full database image written at checkpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JournalSnapshot {
    pub brokers: Vec<BrokerInfo>,
    pub sessions: Vec<StoreSession>,
    pub partitions: Vec<PartitionSnapshot>,
    pub properties: BTreeMap<String, String>,
    pub config_records: Vec<ConfigChangeRecord>,
    pub arrivals: Vec<ArrivalRecord>,
    pub notifications: Vec<NotificationRecord>,
    #[serde(default)]
    pub change_log: ChangeLogSnapshot,
}

/// What was found on disk when the journal was opened.
#[derive(Debug, Default)]
pub struct Recovery {
    pub snapshot: Option<JournalSnapshot>,
    pub records: Vec<LogRecord>,
    pub errors: LoadErrors,
}

#[derive(Debug)]
struct LogWriter {
    file: BufWriter<File>,
    bytes: u64,
}

#[derive(Debug)]
pub struct TxnLog {
    dir: PathBuf,
    gate: RwLock<()>,
    writer: Mutex<LogWriter>,
    checkpoint_bytes: u64,
    #[cfg(test)]
    fail_appends: std::sync::atomic::AtomicBool,
}

/// Shared side of the journal gate. Held across "append, then apply".
#[derive(Debug)]
pub struct AppendScope<'a> {
    log: &'a TxnLog,
    _shared: RwLockReadGuard<'a, ()>,
}

/// Exclusive side of the journal gate.
#[derive(Debug)]
pub struct CheckpointScope<'a> {
    log: &'a TxnLog,
    _exclusive: RwLockWriteGuard<'a, ()>,
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

impl TxnLog {
    /// Open (creating if needed) the journal in `dir` and read back what it
    /// holds.
    pub fn open(dir: &Path, checkpoint_bytes: u64) -> StoreResult<(Self, Recovery)> {
        retry::with_storage_policy(|| fs::create_dir_all(dir), is_transient)
            .map_err(|e| StoreError::io(format!("creating {}", dir.display()), e))?;

        let mut recovery = Recovery {
            snapshot: read_snapshot(dir)?,
            ..Recovery::default()
        };

        let journal_path = dir.join(JOURNAL_FILE_NAME);
        let bytes = read_journal(&journal_path, &mut recovery)?;

        let file = retry::with_storage_policy(
            || {
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&journal_path)
            },
            is_transient,
        )
        .map_err(|e| StoreError::io(format!("opening {}", journal_path.display()), e))?;

        info!(
            dir = %dir.display(),
            records = recovery.records.len(),
            has_snapshot = recovery.snapshot.is_some(),
            skipped = recovery.errors.len(),
            "Opened journal"
        );

        let log = Self {
            dir: dir.to_path_buf(),
            gate: RwLock::new(()),
            writer: Mutex::new(LogWriter {
                file: BufWriter::new(file),
                bytes,
            }),
            checkpoint_bytes,
            #[cfg(test)]
            fail_appends: std::sync::atomic::AtomicBool::new(false),
        };
        Ok((log, recovery))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Bytes appended since the last checkpoint.
    pub fn size(&self) -> u64 {
        lock(&self.writer).bytes
    }

    pub fn needs_checkpoint(&self) -> bool {
        self.size() >= self.checkpoint_bytes
    }

    pub fn begin_append(&self) -> AppendScope<'_> {
        AppendScope {
            log: self,
            _shared: read(&self.gate),
        }
    }

    pub fn begin_checkpoint(&self) -> CheckpointScope<'_> {
        CheckpointScope {
            log: self,
            _exclusive: write(&self.gate),
        }
    }

    /// Make every append fail until switched off again.
    #[cfg(test)]
    pub(crate) fn fail_appends(&self, fail: bool) {
        self.fail_appends
            .store(fail, std::sync::atomic::Ordering::SeqCst);
    }

    #[cfg(test)]
    fn check_append(&self) -> StoreResult<()> {
        if self.fail_appends.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(StoreError::io(
                "appending to journal",
                io::Error::other("append disabled"),
            ));
        }
        Ok(())
    }

    #[cfg(not(test))]
    fn check_append(&self) -> StoreResult<()> {
        Ok(())
    }
}

impl AppendScope<'_> {
    /// Append one record. With `sync` the call returns only after the data
    /// reached stable storage.
    pub fn append(&self, record: &LogRecord, sync: bool) -> StoreResult<()> {
        self.log.check_append()?;
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let mut writer = lock(&self.log.writer);
        writer
            .file
            .write_all(&line)
            .and_then(|_| writer.file.flush())
            .map_err(|e| StoreError::io("appending to journal", e))?;
        if sync {
            writer
                .file
                .get_ref()
                .sync_data()
                .map_err(|e| StoreError::io("syncing journal", e))?;
        }
        writer.bytes += line.len() as u64;
        metrics::record_journal_append(line.len());
        Ok(())
    }
}

impl CheckpointScope<'_> {
    /// Replace the snapshot with `snapshot` and empty the journal.
    ///
    /// The snapshot is written to a temporary file and renamed into place, so
    /// a crash leaves either the old or the new snapshot. A crash between the
    /// rename and the truncate replays journal lines that are already in the
    /// snapshot, which after-images make harmless.
    pub fn rotate(&self, snapshot: &JournalSnapshot) -> StoreResult<()> {
        let dir = &self.log.dir;
        let tmp = dir.join(SNAPSHOT_TMP_FILE_NAME);
        let target = dir.join(SNAPSHOT_FILE_NAME);

        let data = serde_json::to_vec(snapshot)?;
        let mut file =
            File::create(&tmp).map_err(|e| StoreError::io("creating snapshot", e))?;
        file.write_all(&data)
            .and_then(|_| file.sync_all())
            .map_err(|e| StoreError::io("writing snapshot", e))?;
        fs::rename(&tmp, &target).map_err(|e| StoreError::io("installing snapshot", e))?;

        let mut writer = lock(&self.log.writer);
        writer
            .file
            .flush()
            .and_then(|_| writer.file.get_ref().set_len(0))
            .and_then(|_| writer.file.get_ref().sync_all())
            .map_err(|e| StoreError::io("truncating journal", e))?;
        let dropped = writer.bytes;
        writer.bytes = 0;

        metrics::record_journal_checkpoint();
        info!(
            dir = %dir.display(),
            snapshot_bytes = data.len(),
            journal_bytes = dropped,
            "Journal checkpointed"
        );
        Ok(())
    }
}

fn read_snapshot(dir: &Path) -> StoreResult<Option<JournalSnapshot>> {
    let path = dir.join(SNAPSHOT_FILE_NAME);
    match fs::read(&path) {
        Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StoreError::io(format!("reading {}", path.display()), e)),
    }
}

/// Decode the journal, returning its size in bytes.
fn read_journal(path: &Path, recovery: &mut Recovery) -> StoreResult<u64> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(StoreError::io(format!("reading {}", path.display()), e)),
    };

    let mut bytes = 0u64;
    let mut reader = BufReader::new(file);
    let mut buf = Vec::new();
    let mut line_no = 0usize;
    loop {
        buf.clear();
        let n = reader
            .read_until(b'\n', &mut buf)
            .map_err(|e| StoreError::io(format!("reading {}", path.display()), e))?;
        if n == 0 {
            break;
        }
        bytes += n as u64;
        line_no += 1;

        let line = buf.strip_suffix(b"\n").unwrap_or(&buf);
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        match serde_json::from_slice::<LogRecord>(line) {
            Ok(record) => recovery.records.push(record),
            Err(e) => {
                warn!(line = line_no, error = %e, "Skipping undecodable journal line");
                recovery
                    .errors
                    .push(LoadSection::Journal, format!("line {}", line_no), e.into());
            }
        }
    }
    debug!(path = %path.display(), lines = line_no, "Read journal");
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn property(name: &str, value: &str) -> LogRecord {
        LogRecord::PutProperty {
            name: name.to_string(),
            value: Some(value.to_string()),
        }
    }

    #[test]
    fn test_append_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (log, recovery) = TxnLog::open(dir.path(), 1024 * 1024).unwrap();
            assert!(recovery.records.is_empty());
            assert!(recovery.snapshot.is_none());
            let scope = log.begin_append();
            scope.append(&property("a", "1"), true).unwrap();
            scope.append(&property("b", "2"), false).unwrap();
            assert!(log.size() > 0);
        }

        let (_log, recovery) = TxnLog::open(dir.path(), 1024 * 1024).unwrap();
        assert_eq!(recovery.records.len(), 2);
        assert!(recovery.errors.is_empty());
    }

    #[test]
    fn test_torn_line_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (log, _) = TxnLog::open(dir.path(), 1024 * 1024).unwrap();
            log.begin_append().append(&property("a", "1"), true).unwrap();
        }
        let mut file = OpenOptions::new()
            .append(true)
            .open(dir.path().join(JOURNAL_FILE_NAME))
            .unwrap();
        file.write_all(br#"{"op":"put_prop"#).unwrap();
        drop(file);

        let (_log, recovery) = TxnLog::open(dir.path(), 1024 * 1024).unwrap();
        assert_eq!(recovery.records.len(), 1);
        assert_eq!(recovery.errors.len(), 1);
        assert_eq!(recovery.errors.in_section(LoadSection::Journal).count(), 1);
    }

    #[test]
    fn test_rotate_writes_snapshot_and_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let (log, _) = TxnLog::open(dir.path(), 16).unwrap();
        log.begin_append().append(&property("a", "1"), false).unwrap();
        assert!(log.needs_checkpoint());

        let mut snapshot = JournalSnapshot::default();
        snapshot.properties.insert("a".to_string(), "1".to_string());
        log.begin_checkpoint().rotate(&snapshot).unwrap();
        assert_eq!(log.size(), 0);
        assert!(!log.needs_checkpoint());
        drop(log);

        let (_log, recovery) = TxnLog::open(dir.path(), 16).unwrap();
        assert!(recovery.records.is_empty());
        let snapshot = recovery.snapshot.unwrap();
        assert_eq!(snapshot.properties.get("a").map(String::as_str), Some("1"));
    }
}
