//! Integration tests for StoreConfig.
//!
//! These tests verify StoreConfig validation logic and defaults.

use std::path::PathBuf;
use std::time::Duration;

use mqpersist::constants::{DEFAULT_DATA_PATH, DEFAULT_PROTOCOL_VERSION};
use mqpersist::error::{ErrorKind, StoreError};
use mqpersist::persist::{StoreConfig, StoreType};
use mqpersist::types::BrokerId;

// ============================================================================
// StoreType Tests
// ============================================================================

#[test]
fn test_store_type_default() {
    assert_eq!(StoreType::default(), StoreType::Memory);
}

#[test]
fn test_store_type_display_parses_back() {
    for store_type in [StoreType::NoPersist, StoreType::Memory, StoreType::File] {
        let parsed: StoreType = store_type.to_string().parse().unwrap();
        assert_eq!(parsed, store_type);
    }
}

#[test]
fn test_store_type_unknown() {
    let err = "jdbc".parse::<StoreType>().unwrap_err();
    assert!(err.contains("jdbc"));
}

// ============================================================================
// Defaults
// ============================================================================

#[test]
fn test_store_config_default() {
    let config = StoreConfig::default();
    assert_eq!(config.protocol_version, DEFAULT_PROTOCOL_VERSION);
    assert_eq!(config.data_path, PathBuf::from(DEFAULT_DATA_PATH));
    assert!(config.heartbeat_interval < config.heartbeat_timeout);
    assert!(config.validate().is_ok());
    assert!(config.check().is_ok());
}

#[test]
fn test_for_broker_and_builders() {
    let config = StoreConfig::for_broker("east-1")
        .with_partitions(true)
        .with_store_type(StoreType::File)
        .with_data_path("/srv/mq");

    assert_eq!(config.broker_id, BrokerId::new("east-1"));
    assert_eq!(config.broker_url, "mq://east-1:7676");
    assert!(config.partition_mode);
    assert!(config.partition_migratable);
    assert_eq!(config.store_type, StoreType::File);
    assert_eq!(config.data_path, PathBuf::from("/srv/mq"));
    assert!(config.validate().is_ok());
}

#[test]
fn test_partitions_without_migration() {
    let config = StoreConfig::for_broker("a").with_partitions(false);
    assert!(config.partition_mode);
    assert!(!config.partition_migratable);
    assert!(config.validate().is_ok());
}

// ============================================================================
// Validation
// ============================================================================

#[test]
fn test_empty_identity_rejected() {
    let mut config = StoreConfig::for_broker("a");
    config.broker_id = BrokerId::new("  ");
    config.broker_url = String::new();

    let errors = config.validate().unwrap_err();
    assert_eq!(errors.len(), 2);
    assert!(errors.iter().any(|e| e.contains("broker_id")));
    assert!(errors.iter().any(|e| e.contains("broker_url")));
}

#[test]
fn test_zero_heartbeat_interval_rejected() {
    let mut config = StoreConfig::for_broker("a");
    config.heartbeat_interval = Duration::ZERO;

    let errors = config.validate().unwrap_err();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("heartbeat_interval must be greater than 0"));
}

#[test]
fn test_interval_must_be_below_timeout() {
    let mut config = StoreConfig::for_broker("a");
    config.heartbeat_interval = Duration::from_secs(10);
    config.heartbeat_timeout = Duration::from_secs(10);

    let errors = config.validate().unwrap_err();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("heartbeat_timeout"));

    config.heartbeat_timeout = Duration::from_secs(11);
    assert!(config.validate().is_ok());
}

#[test]
fn test_migratable_requires_partition_mode() {
    let mut config = StoreConfig::for_broker("a");
    config.partition_migratable = true;

    let errors = config.validate().unwrap_err();
    assert_eq!(
        errors,
        vec!["partition_migratable requires partition_mode".to_string()]
    );
}

#[test]
fn test_file_store_needs_data_path() {
    let config = StoreConfig::for_broker("a")
        .with_store_type(StoreType::File)
        .with_data_path("");
    let errors = config.validate().unwrap_err();
    assert!(errors[0].contains("data_path"));

    // Other backends ignore the path.
    let config = StoreConfig::for_broker("a").with_data_path("");
    assert!(config.validate().is_ok());
}

#[test]
fn test_zero_checkpoint_threshold_rejected() {
    let mut config = StoreConfig::for_broker("a");
    config.journal_checkpoint_bytes = 0;
    assert!(config.validate().is_err());
}

#[test]
fn test_check_folds_errors_into_config_error() {
    let mut config = StoreConfig::for_broker("a");
    config.partition_migratable = true;
    config.journal_checkpoint_bytes = 0;

    let err = config.check().unwrap_err();
    assert!(matches!(err, StoreError::Config(_)));
    assert_eq!(err.kind(), ErrorKind::BadRequest);
    let message = err.to_string();
    assert!(message.starts_with("configuration error:"));
    assert!(message.contains("partition_mode; journal_checkpoint_bytes"));
}
