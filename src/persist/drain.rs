//! In-flight operation gate used for cooperative shutdown.
//!
//! Every store call takes an [`OpPermit`] from the [`DrainGuard`] before it
//! touches state. The permit is released when it is dropped, on every exit
//! path including `?` returns and panics.
//!
//! Closing is two steps under one lock: the closed flag is set so that no new
//! permits are handed out, then the caller blocks until the in-flight count
//! reaches zero.
//!
//! ```text
//! let _permit = guard.enter()?;   // Err(Closed) once closing started
//! do_work();
//! // permit dropped here, close_and_wait() may return
//! ```

use std::sync::{Condvar, Mutex};
use std::time::Instant;

use super::metrics;
use super::sync::lock;
use crate::error::{StoreError, StoreResult};

#[derive(Debug, Default)]
struct DrainState {
    closed: bool,
    in_progress: usize,
}

/// Counts in-flight operations and blocks shutdown until they finish.
#[derive(Debug)]
pub struct DrainGuard {
    scope: &'static str,
    state: Mutex<DrainState>,
    drained: Condvar,
}

/// Registration of one in-flight operation.
#[must_use = "the operation is deregistered as soon as the permit is dropped"]
#[derive(Debug)]
pub struct OpPermit<'a> {
    guard: &'a DrainGuard,
}

impl DrainGuard {
    /// `scope` labels the guard in metrics (`store`, `partition`).
    pub fn new(scope: &'static str) -> Self {
        Self {
            scope,
            state: Mutex::new(DrainState::default()),
            drained: Condvar::new(),
        }
    }

    /// Register an operation. Fails with [`StoreError::Closed`] once closing
    /// has started.
    pub fn enter(&self) -> StoreResult<OpPermit<'_>> {
        let mut state = lock(&self.state);
        if state.closed {
            return Err(StoreError::Closed);
        }
        state.in_progress += 1;
        metrics::IN_FLIGHT_OPERATIONS.inc();
        Ok(OpPermit { guard: self })
    }

    /// Reject new operations and wait for in-flight ones to finish.
    ///
    /// Returns `false` if the guard was already closed.
    pub fn close_and_wait(&self) -> bool {
        let started = Instant::now();
        let mut state = lock(&self.state);
        let first = !state.closed;
        state.closed = true;
        while state.in_progress > 0 {
            state = self
                .drained
                .wait(state)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
        drop(state);
        if first {
            metrics::record_drain_wait(self.scope, started.elapsed().as_secs_f64());
        }
        first
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }

    pub fn in_progress(&self) -> usize {
        lock(&self.state).in_progress
    }

    fn exit(&self) {
        let mut state = lock(&self.state);
        state.in_progress -= 1;
        metrics::IN_FLIGHT_OPERATIONS.dec();
        if state.in_progress == 0 {
            self.drained.notify_all();
        }
    }
}

impl Drop for OpPermit<'_> {
    fn drop(&mut self) {
        self.guard.exit();
    }
}
