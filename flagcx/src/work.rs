use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use tokio::task::JoinHandle;

use crate::device::DeviceAdapter;
use crate::error::{FlagcxError, Result};
use crate::fabric::GroupHealth;
use crate::types::Rank;

/// Lifecycle of a [`Work`]. `Completed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl WorkStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => WorkStatus::Pending,
            1 => WorkStatus::InProgress,
            2 => WorkStatus::Completed,
            _ => WorkStatus::Failed,
        }
    }
}

/// Handle to an issued collective or non-blocking point-to-point operation.
///
/// The operation runs on a spawned task. [`wait`](Self::wait) consumes the
/// handle and reports the outcome; [`is_completed`](Self::is_completed)
/// polls without blocking. Buffers referenced by the operation must stay
/// alive and untouched until `wait` returns.
///
/// Dropping a handle that was never waited on aborts the task so it cannot
/// write into memory the caller may already have freed.
pub struct Work {
    operation: &'static str,
    rank: Rank,
    status: Arc<AtomicU8>,
    inner: Option<JoinHandle<Result<()>>>,
}

impl Work {
    pub(crate) fn spawn<F>(
        operation: &'static str,
        rank: Rank,
        health: Arc<GroupHealth>,
        adapter: Arc<dyn DeviceAdapter>,
        fut: F,
    ) -> Self
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let status = Arc::new(AtomicU8::new(WorkStatus::Pending as u8));
        let task_status = Arc::clone(&status);
        let inner = tokio::spawn(async move {
            task_status.store(WorkStatus::InProgress as u8, Ordering::Release);
            let mut result = fut.await;
            if result.is_ok() && adapter.capabilities().default_stream_dispatch {
                result = adapter.synchronize(0);
            }
            match &result {
                Ok(()) => task_status.store(WorkStatus::Completed as u8, Ordering::Release),
                Err(e) => {
                    if e.is_fatal_to_group() {
                        health.mark_broken(&e.to_string());
                    }
                    tracing::debug!(operation, error = %e, "work failed");
                    task_status.store(WorkStatus::Failed as u8, Ordering::Release);
                }
            }
            result
        });
        Self {
            operation,
            rank,
            status,
            inner: Some(inner),
        }
    }

    pub fn operation(&self) -> &'static str {
        self.operation
    }

    pub fn status(&self) -> WorkStatus {
        WorkStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// True once the operation reached a terminal state, successful or not.
    pub fn is_completed(&self) -> bool {
        matches!(self.status(), WorkStatus::Completed | WorkStatus::Failed)
    }

    pub fn is_success(&self) -> bool {
        self.status() == WorkStatus::Completed
    }

    /// Wait for the operation and propagate its error, if any.
    pub async fn wait(mut self) -> Result<()> {
        let Some(handle) = self.inner.take() else {
            return Ok(());
        };
        match handle.await {
            Ok(result) => result,
            Err(e) => {
                self.status
                    .store(WorkStatus::Failed as u8, Ordering::Release);
                Err(FlagcxError::transfer(
                    self.operation,
                    self.rank,
                    format!("operation task ended abnormally: {e}"),
                ))
            }
        }
    }
}

impl std::fmt::Debug for Work {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Work")
            .field("operation", &self.operation)
            .field("status", &self.status())
            .finish()
    }
}

impl Drop for Work {
    fn drop(&mut self) {
        if let Some(handle) = &self.inner {
            handle.abort();
        }
    }
}

/// Wait for every handle, in order. All are awaited even after a failure;
/// the first error is returned.
pub async fn wait_all(works: impl IntoIterator<Item = Work>) -> Result<()> {
    let mut first_err = None;
    for w in works {
        if let Err(e) = w.wait().await
            && first_err.is_none()
        {
            first_err = Some(e);
        }
    }
    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
