//! Cancellation and deadline propagation for lifecycle operations.
//!
//! Every suspension point of the runtime (FIFO open, rendezvous poll,
//! post-start wait, cgroup drain) takes a `Context` and either completes,
//! observes a cancellation, or runs into the deadline.

use crate::error::{Error, Result};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

#[derive(Clone, Debug, Default)]
pub struct Context {
    deadline: Option<Instant>,
    cancelled: Arc<AtomicBool>,
}

impl Context {
    /// A context without deadline that can only be ended by `cancel`.
    pub fn new() -> Self {
        Self::default()
    }

    /// A context that expires `timeout` from now.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    /// A context that expires at `deadline`.
    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
            cancelled: Arc::default(),
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left until the deadline, `None` if the context is unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Signal cancellation to every operation sharing this context.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn expired(&self) -> bool {
        matches!(self.deadline, Some(d) if Instant::now() >= d)
    }

    /// Fail with `Error::Timeout` if the context is cancelled or expired.
    pub fn ensure_active(&self, operation: &'static str) -> Result<()> {
        if self.is_cancelled() || self.expired() {
            return Err(Error::Timeout(operation));
        }
        Ok(())
    }

    /// Sleep for one poll interval, bounded by the deadline, then re-check
    /// the context. The building block of every polling loop.
    pub async fn tick(&self, interval: Duration, operation: &'static str) -> Result<()> {
        self.ensure_active(operation)?;
        let nap = match self.remaining() {
            Some(remaining) => interval.min(remaining),
            None => interval,
        };
        tokio::time::sleep(nap).await;
        self.ensure_active(operation)
    }
}
