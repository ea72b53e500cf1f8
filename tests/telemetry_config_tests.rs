//! Tests for LogFormat and logging setup.

use mqpersist::telemetry::{LogFormat, init_logging, init_test_logging};

#[test]
fn test_log_format_copy() {
    let format = LogFormat::Json;
    let copied = format;
    assert_eq!(format, copied);
}

#[test]
fn test_log_format_parse_is_case_insensitive() {
    assert_eq!("Json".parse::<LogFormat>().unwrap(), LogFormat::Json);
    assert_eq!("PRETTY".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
}

#[test]
fn test_second_global_subscriber_is_rejected() {
    init_test_logging();
    // A subscriber is already installed for this process.
    assert!(init_logging(LogFormat::Json).is_err());
    assert!(init_logging(LogFormat::Pretty).is_err());
}
