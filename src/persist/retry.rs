//! Retry policies for calls that leave the store.
//!
//! Store mutations themselves are never retried here: a conditional update
//! that lost a race must surface to the caller. Retries are reserved for
//! collaborators whose failure is usually transient, such as the cluster
//! transport and journal file creation.
//!
//! # Available Policies
//!
//! | Policy | Min Delay | Max Delay | Retries | Use Case |
//! |--------|-----------|-----------|---------|----------|
//! | `notification_policy` | 10ms | 1s | 5 | Cluster notifications |
//! | `storage_policy` | 10ms | 500ms | 3 | Journal and snapshot files |
//!
//! # Example
//!
//! ```rust
//! use mqpersist::persist::retry;
//!
//! let mut calls = 0;
//! let result: Result<u32, std::io::Error> = retry::with_storage_policy(
//!     || {
//!         calls += 1;
//!         Ok(7)
//!     },
//!     |e: &std::io::Error| e.kind() == std::io::ErrorKind::Interrupted,
//! );
//! assert_eq!(result.unwrap(), 7);
//! ```

use std::time::Duration;

use backon::{BlockingRetryable, ExponentialBuilder};

use super::metrics::RETRY_ATTEMPTS;

/// Policy for cluster transport notifications.
///
/// A notification that keeps failing is persisted as a retry record by the
/// caller, so the policy gives up after a handful of attempts.
pub fn notification_policy() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(10))
        .with_max_delay(Duration::from_secs(1))
        .with_max_times(5)
        .with_jitter()
}

/// Policy for journal and snapshot file operations.
pub fn storage_policy() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(10))
        .with_max_delay(Duration::from_millis(500))
        .with_max_times(3)
        .with_jitter()
}

/// Run a blocking operation with the notification policy.
pub fn with_notification_policy<F, T, E, C>(operation: F, condition: C) -> Result<T, E>
where
    F: FnMut() -> Result<T, E>,
    E: std::fmt::Display,
    C: FnMut(&E) -> bool,
{
    run("notification", notification_policy(), operation, condition)
}

/// Run a blocking operation with the storage policy.
pub fn with_storage_policy<F, T, E, C>(operation: F, condition: C) -> Result<T, E>
where
    F: FnMut() -> Result<T, E>,
    E: std::fmt::Display,
    C: FnMut(&E) -> bool,
{
    run("storage", storage_policy(), operation, condition)
}

fn run<F, T, E, C>(
    policy_name: &'static str,
    policy: ExponentialBuilder,
    operation: F,
    condition: C,
) -> Result<T, E>
where
    F: FnMut() -> Result<T, E>,
    E: std::fmt::Display,
    C: FnMut(&E) -> bool,
{
    let mut attempt = 0u32;
    let result = operation
        .retry(policy)
        .when(condition)
        .notify(|e: &E, delay: Duration| {
            attempt += 1;
            record_retry_attempt(policy_name, attempt);
            tracing::debug!(
                policy = policy_name,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %e,
                "Retrying"
            );
        })
        .call();

    match &result {
        Ok(_) => record_retry_success(policy_name),
        Err(_) => record_retry_exhausted(policy_name),
    }
    result
}

/// Record a retry attempt for metrics.
pub fn record_retry_attempt(policy_name: &str, attempt: u32) {
    RETRY_ATTEMPTS
        .with_label_values(&[policy_name, "attempt"])
        .inc();

    tracing::debug!(policy = policy_name, attempt, "Retry attempt");
}

/// Record a retry exhaustion (the last attempt failed).
pub fn record_retry_exhausted(policy_name: &str) {
    RETRY_ATTEMPTS
        .with_label_values(&[policy_name, "exhausted"])
        .inc();

    tracing::warn!(policy = policy_name, "Retry policy exhausted");
}

/// Record a retry success.
pub fn record_retry_success(policy_name: &str) {
    RETRY_ATTEMPTS
        .with_label_values(&[policy_name, "success"])
        .inc();
}
