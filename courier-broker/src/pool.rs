//! Bounded pool running distribution workers on the tokio runtime.

use crate::error::{BrokerError, BrokerResult};
use courier_core::config::DispatchSettings;
use std::{future::Future, sync::Arc};
use tokio::{runtime::Handle, sync::Semaphore, task::JoinHandle};
use tracing::trace;

/// Spawns worker tasks, at most `max_workers` of them running at a time.
///
/// [`execute`](Self::execute) never blocks: the task is spawned right away
/// and waits for a permit on the runtime.
#[derive(Debug, Clone)]
pub struct DispatchPool {
    handle: Handle,
    permits: Arc<Semaphore>,
    max_workers: usize,
}

impl DispatchPool {
    /// Create a pool on the current tokio runtime
    ///
    /// # Errors
    ///
    /// - `BrokerError::Internal` if called outside a tokio runtime
    /// - `BrokerError::InvalidArgument` if `max_workers` is zero
    pub fn new(max_workers: usize) -> BrokerResult<Self> {
        let handle = Handle::try_current()
            .map_err(|e| BrokerError::internal(format!("dispatch pool needs a tokio runtime: {e}")))?;
        Self::with_handle(handle, max_workers)
    }

    /// Create a pool on an explicit runtime
    ///
    /// # Errors
    ///
    /// Returns `BrokerError::InvalidArgument` if `max_workers` is zero
    pub fn with_handle(handle: Handle, max_workers: usize) -> BrokerResult<Self> {
        if max_workers == 0 {
            return Err(BrokerError::invalid_argument("max_workers must be greater than 0"));
        }
        Ok(Self { handle, permits: Arc::new(Semaphore::new(max_workers)), max_workers })
    }

    /// Create a pool from the dispatch settings
    ///
    /// # Errors
    ///
    /// See [`new`](Self::new).
    pub fn from_settings(settings: &DispatchSettings) -> BrokerResult<Self> {
        Self::new(settings.max_workers)
    }

    /// Run `task` once a worker slot is free. Returns immediately.
    pub fn execute<F>(&self, task: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permits = Arc::clone(&self.permits);
        self.handle.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                trace!("Dispatch pool closed, dropping task");
                return;
            };
            task.await;
        })
    }

    /// Configured worker limit
    #[must_use]
    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Worker slots currently free
    #[must_use]
    pub fn available_workers(&self) -> usize {
        self.permits.available_permits()
    }

    /// Refuse further tasks. Running tasks finish; queued ones are dropped.
    pub fn close(&self) {
        self.permits.close();
    }

    /// Whether [`close`](Self::close) was called
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.permits.is_closed()
    }
}
