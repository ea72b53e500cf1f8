//! Centralized storage and HA constants.
//!
//! Defaults for [`StoreConfig`](crate::persist::StoreConfig) and the fixed
//! names used on disk live here so they can be changed in one place.
//!
//! # Categories
//!
//! - **Broker Constants**: identity and heartbeat defaults
//! - **Journal Constants**: file names and checkpoint thresholds
//! - **Change Log Constants**: reserved sequence numbers
//! - **Property Names**: well-known global property keys

// =============================================================================
// Broker Constants
// =============================================================================

/// Broker id used when none is configured.
pub const DEFAULT_BROKER_ID: &str = "broker-0";

/// Broker URL used when none is configured.
pub const DEFAULT_BROKER_URL: &str = "mq://localhost:7676";

/// Store protocol version written into new broker rows.
pub const DEFAULT_PROTOCOL_VERSION: u32 = 500;

/// How often a live broker refreshes its heartbeat (milliseconds).
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 5_000;

/// Heartbeat age after which a broker is considered failed (milliseconds).
///
/// Must be larger than [`DEFAULT_HEARTBEAT_INTERVAL_MS`].
pub const DEFAULT_HEARTBEAT_TIMEOUT_MS: u64 = 30_000;

// =============================================================================
// Journal Constants
// =============================================================================

/// Default location of the file-backed store.
pub const DEFAULT_DATA_PATH: &str = "/tmp/mqpersist-data";

/// Name of the append-only journal inside the data directory.
pub const JOURNAL_FILE_NAME: &str = "journal.log";

/// Name of the checkpoint snapshot inside the data directory.
pub const SNAPSHOT_FILE_NAME: &str = "snapshot.json";

/// Temporary name the snapshot is written to before being renamed.
pub const SNAPSHOT_TMP_FILE_NAME: &str = "snapshot.json.tmp";

/// Journal size that triggers an automatic checkpoint (64 MiB).
pub const DEFAULT_JOURNAL_CHECKPOINT_BYTES: u64 = 64 * 1024 * 1024;

// =============================================================================
// Change Log Constants
// =============================================================================

/// Sequence number of the reset record that heads every change-record log.
pub const CHANGE_LOG_RESET_SEQ: u64 = 1;

// =============================================================================
// Property Names
// =============================================================================

/// Global property holding the currently elected master broker.
pub const MASTER_BROKER_PROPERTY: &str = "mq.cluster.masterbroker";
