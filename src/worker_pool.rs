//! The global pool of adapter slots.
//!
//! Every adapter invocation, from every page of every document, must hold a
//! slot while it runs. This caps the number of recognizers competing for
//! CPU, memory and remote API quota.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::prelude::*;

/// A bounded pool of adapter slots.
///
/// Cloning is cheap, and clones share the same slots. Waiters are served in
/// FIFO order, because Tokio's [`Semaphore`] is fair.
#[derive(Clone, Debug)]
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
}

impl WorkerPool {
    /// Create a pool with `size` slots.
    pub fn new(size: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(size.max(1))),
        }
    }

    /// The number of slots not currently held.
    #[cfg(test)]
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Wait for a free slot. The slot is released when the returned
    /// [`WorkerSlot`] is dropped, whether the work finished, failed, panicked
    /// or was cancelled.
    #[instrument(level = "trace", skip_all)]
    pub async fn acquire(&self) -> Result<WorkerSlot> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .context("worker pool was closed")?;
        Ok(WorkerSlot { _permit: permit })
    }
}

/// A held slot in a [`WorkerPool`].
#[derive(Debug)]
pub struct WorkerSlot {
    _permit: OwnedSemaphorePermit,
}
