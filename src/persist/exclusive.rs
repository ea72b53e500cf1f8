//! Process-wide exclusive administrative requests.
//!
//! Requests such as changing the master broker or migrating a store
//! partition must not overlap. Only one runs at a time; a second request
//! fails immediately instead of queueing.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Mutex;
use std::time::Instant;
use tracing::debug;

use super::sync::lock;
use crate::error::{StoreError, StoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExclusiveRequest {
    ChangeMasterBroker,
    MigrateStore,
}

impl fmt::Display for ExclusiveRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExclusiveRequest::ChangeMasterBroker => f.write_str("change master broker"),
            ExclusiveRequest::MigrateStore => f.write_str("migrate store"),
        }
    }
}

#[derive(Debug, Default)]
pub struct ExclusiveLocks {
    held: Mutex<Option<(ExclusiveRequest, Instant)>>,
}

/// Held exclusive request. Released on drop.
#[must_use = "the exclusive request is released as soon as the guard is dropped"]
#[derive(Debug)]
pub struct ExclusiveGuard<'a> {
    locks: &'a ExclusiveLocks,
    request: ExclusiveRequest,
}

impl ExclusiveLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the lock for `request`, failing with
    /// [`StoreError::ExclusiveLockHeld`] if any request is in progress.
    pub fn try_acquire(&self, request: ExclusiveRequest) -> StoreResult<ExclusiveGuard<'_>> {
        let mut held = lock(&self.held);
        if let Some((current, since)) = *held {
            debug!(
                requested = %request,
                held = %current,
                held_for_ms = since.elapsed().as_millis() as u64,
                "Exclusive request rejected"
            );
            return Err(StoreError::ExclusiveLockHeld(current));
        }
        *held = Some((request, Instant::now()));
        Ok(ExclusiveGuard {
            locks: self,
            request,
        })
    }

    /// Request currently in progress, if any.
    pub fn current(&self) -> Option<ExclusiveRequest> {
        lock(&self.held).map(|(request, _)| request)
    }
}

impl ExclusiveGuard<'_> {
    pub fn request(&self) -> ExclusiveRequest {
        self.request
    }
}

impl Drop for ExclusiveGuard<'_> {
    fn drop(&mut self) {
        *lock(&self.locks.held) = None;
    }
}
