//! Configuration for a broker's store.
//!
//! # Environment Variables
//!
//! | Variable | Default | Meaning |
//! |----------|---------|---------|
//! | `BROKER_ID` | `broker-0` | Id of this broker in the broker table |
//! | `BROKER_URL` | `mq://localhost:7676` | Address advertised to other brokers |
//! | `STORE_PROTOCOL_VERSION` | `500` | Version written into the broker row |
//! | `STORE_TYPE` | `memory` | `nopersist`, `memory` or `file` |
//! | `DATA_PATH` | `/tmp/mqpersist-data` | Directory of the file store |
//! | `PARTITION_MODE` | `false` | Enable per-session partitions |
//! | `PARTITION_MIGRATABLE` | `false` | Allow partitions to move between brokers |
//! | `BROKER_HEARTBEAT_INTERVAL_MS` | `5000` | Heartbeat period |
//! | `BROKER_HEARTBEAT_TIMEOUT_MS` | `30000` | Age after which a heartbeat is stale |
//! | `JOURNAL_CHECKPOINT_BYTES` | `67108864` | Journal size that triggers a checkpoint |

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::constants::{
    DEFAULT_BROKER_ID, DEFAULT_BROKER_URL, DEFAULT_DATA_PATH, DEFAULT_HEARTBEAT_INTERVAL_MS,
    DEFAULT_HEARTBEAT_TIMEOUT_MS, DEFAULT_JOURNAL_CHECKPOINT_BYTES, DEFAULT_PROTOCOL_VERSION,
};
use crate::error::{StoreError, StoreResult};
use crate::types::BrokerId;

/// Backend used for partition data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreType {
    /// Metadata only; data operations are unsupported.
    NoPersist,
    /// Process-local state shared by every broker on the same database.
    #[default]
    Memory,
    /// Memory state backed by a write-ahead journal and snapshots on disk.
    File,
}

impl StoreType {
    pub fn as_str(self) -> &'static str {
        match self {
            StoreType::NoPersist => "nopersist",
            StoreType::Memory => "memory",
            StoreType::File => "file",
        }
    }
}

impl std::fmt::Display for StoreType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StoreType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "nopersist" | "none" => Ok(StoreType::NoPersist),
            "memory" | "mem" => Ok(StoreType::Memory),
            "file" => Ok(StoreType::File),
            other => Err(format!("unknown store type '{}'", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub broker_id: BrokerId,
    pub broker_url: String,
    pub protocol_version: u32,
    pub store_type: StoreType,
    pub data_path: PathBuf,
    /// Each store session is loaded as its own partition.
    pub partition_mode: bool,
    /// Non-primary partitions may be migrated to other brokers.
    pub partition_migratable: bool,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub journal_checkpoint_bytes: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            broker_id: BrokerId::new(DEFAULT_BROKER_ID),
            broker_url: DEFAULT_BROKER_URL.to_string(),
            protocol_version: DEFAULT_PROTOCOL_VERSION,
            store_type: StoreType::default(),
            data_path: PathBuf::from(DEFAULT_DATA_PATH),
            partition_mode: false,
            partition_migratable: false,
            heartbeat_interval: Duration::from_millis(DEFAULT_HEARTBEAT_INTERVAL_MS),
            heartbeat_timeout: Duration::from_millis(DEFAULT_HEARTBEAT_TIMEOUT_MS),
            journal_checkpoint_bytes: DEFAULT_JOURNAL_CHECKPOINT_BYTES,
        }
    }
}

impl StoreConfig {
    /// Default configuration for the given broker.
    pub fn for_broker(broker_id: impl Into<BrokerId>) -> Self {
        let broker_id = broker_id.into();
        Self {
            broker_url: format!("mq://{}:7676", broker_id),
            broker_id,
            ..Self::default()
        }
    }

    /// Enable partition mode and migration.
    pub fn with_partitions(mut self, migratable: bool) -> Self {
        self.partition_mode = true;
        self.partition_migratable = migratable;
        self
    }

    pub fn with_store_type(mut self, store_type: StoreType) -> Self {
        self.store_type = store_type;
        self
    }

    pub fn with_data_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.data_path = path.into();
        self
    }

    /// Validate the configuration, returning every problem found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.broker_id.as_str().trim().is_empty() {
            errors.push("broker_id must not be empty".to_string());
        }

        if self.broker_url.trim().is_empty() {
            errors.push("broker_url must not be empty".to_string());
        }

        if self.heartbeat_interval.is_zero() {
            errors.push("heartbeat_interval must be greater than 0".to_string());
        }

        // A broker must get several beats in before it is declared dead.
        if self.heartbeat_interval >= self.heartbeat_timeout {
            errors.push(format!(
                "heartbeat_interval ({:?}) must be less than heartbeat_timeout ({:?})",
                self.heartbeat_interval, self.heartbeat_timeout
            ));
        }

        if self.partition_migratable && !self.partition_mode {
            errors.push("partition_migratable requires partition_mode".to_string());
        }

        if self.store_type == StoreType::File && self.data_path.as_os_str().is_empty() {
            errors.push("data_path must be set when store_type is file".to_string());
        }

        if self.journal_checkpoint_bytes == 0 {
            errors.push("journal_checkpoint_bytes must be greater than 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// [`validate`](Self::validate) folded into a single store error.
    pub fn check(&self) -> StoreResult<()> {
        self.validate()
            .map_err(|errors| StoreError::Config(errors.join("; ")))
    }

    /// Create configuration from environment variables.
    ///
    /// See the module documentation for the variables and their defaults.
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        let defaults = Self::default();

        let broker_id = std::env::var("BROKER_ID")
            .map(BrokerId::new)
            .unwrap_or(defaults.broker_id);

        let broker_url = std::env::var("BROKER_URL").unwrap_or(defaults.broker_url);

        let protocol_version = std::env::var("STORE_PROTOCOL_VERSION")
            .ok()
            .map(|v| v.parse::<u32>())
            .transpose()
            .map_err(|e| format!("Invalid STORE_PROTOCOL_VERSION: {}", e))?
            .unwrap_or(defaults.protocol_version);

        let store_type = std::env::var("STORE_TYPE")
            .ok()
            .map(|v| v.parse::<StoreType>())
            .transpose()
            .map_err(|e| format!("Invalid STORE_TYPE: {}", e))?
            .unwrap_or(defaults.store_type);

        let data_path = std::env::var("DATA_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.data_path);

        let partition_mode = std::env::var("PARTITION_MODE")
            .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
            .unwrap_or(defaults.partition_mode);

        let partition_migratable = std::env::var("PARTITION_MIGRATABLE")
            .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
            .unwrap_or(defaults.partition_migratable);

        let heartbeat_interval = std::env::var("BROKER_HEARTBEAT_INTERVAL_MS")
            .ok()
            .map(|v| v.parse::<u64>())
            .transpose()
            .map_err(|e| format!("Invalid BROKER_HEARTBEAT_INTERVAL_MS: {}", e))?
            .map(Duration::from_millis)
            .unwrap_or(defaults.heartbeat_interval);

        let heartbeat_timeout = std::env::var("BROKER_HEARTBEAT_TIMEOUT_MS")
            .ok()
            .map(|v| v.parse::<u64>())
            .transpose()
            .map_err(|e| format!("Invalid BROKER_HEARTBEAT_TIMEOUT_MS: {}", e))?
            .map(Duration::from_millis)
            .unwrap_or(defaults.heartbeat_timeout);

        let journal_checkpoint_bytes = std::env::var("JOURNAL_CHECKPOINT_BYTES")
            .ok()
            .map(|v| v.parse::<u64>())
            .transpose()
            .map_err(|e| format!("Invalid JOURNAL_CHECKPOINT_BYTES: {}", e))?
            .unwrap_or(defaults.journal_checkpoint_bytes);

        Ok(Self {
            broker_id,
            broker_url,
            protocol_version,
            store_type,
            data_path,
            partition_mode,
            partition_migratable,
            heartbeat_interval,
            heartbeat_timeout,
            journal_checkpoint_bytes,
        })
    }
}
