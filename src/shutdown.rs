//! Cooperative shutdown signal.
//!
//! Both agent loops sleep through [`Shutdown::wait_timeout`], so a trigger
//! interrupts any pending interval or backoff delay immediately.

use crate::storage::acquire_lock;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct Inner {
    triggered: Mutex<bool>,
    changed: Condvar,
}

/// Cloneable handle to a one-shot shutdown flag.
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    inner: Arc<Inner>,
}

impl Shutdown {
    /// Creates an untriggered signal.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests shutdown and wakes every waiter.
    pub fn trigger(&self) {
        let mut triggered = acquire_lock(&self.inner.triggered);
        if !*triggered {
            *triggered = true;
            tracing::info!("Shutdown requested");
        }
        self.inner.changed.notify_all();
    }

    /// Returns `true` once shutdown has been requested.
    #[must_use]
    pub fn is_triggered(&self) -> bool {
        *acquire_lock(&self.inner.triggered)
    }

    /// Sleeps for `timeout` unless shutdown is requested first.
    ///
    /// Returns `true` if shutdown was requested.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut triggered = acquire_lock(&self.inner.triggered);
        while !*triggered {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            triggered = match self.inner.changed.wait_timeout(triggered, remaining) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        *triggered
    }

    /// Blocks until shutdown is requested.
    pub fn wait(&self) {
        let mut triggered = acquire_lock(&self.inner.triggered);
        while !*triggered {
            triggered = match self.inner.changed.wait(triggered) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
    }
}
