//! Execution contexts owned by a client.
//!
//! [`WorkerGroup`] runs operation tasks; [`CompressionPool`] runs block
//! serialization and compression off the network task. Both shut down
//! idempotently and wait for their work before returning.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::debug;

use super::{ChError, ChResult};

/// Tasks spawned for client operations.
#[derive(Debug, Default)]
pub struct WorkerGroup {
    tasks: Mutex<JoinSet<()>>,
    closed: AtomicBool,
}

impl WorkerGroup {
    pub fn new() -> Self {
        Self::default()
    }

    fn tasks(&self) -> MutexGuard<'_, JoinSet<()>> {
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Spawn onto the current tokio runtime.
    pub fn spawn<F>(&self, task: F) -> ChResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks();
        // Checked under the lock so nothing slips in after shutdown took the set.
        if self.closed.load(Ordering::Acquire) {
            return Err(ChError::ClientClosed);
        }
        while tasks.try_join_next().is_some() {}
        tasks.spawn(task);
        Ok(())
    }

    pub fn active(&self) -> usize {
        self.tasks().len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Abort running tasks and wait until every one has stopped.
    pub async fn shutdown(&self) {
        let mut tasks = {
            let mut guard = self.tasks();
            self.closed.store(true, Ordering::Release);
            std::mem::take(&mut *guard)
        };
        if !tasks.is_empty() {
            debug!(tasks = tasks.len(), "stopping worker tasks");
        }
        tasks.shutdown().await;
    }
}

/// Bounded pool for CPU-bound block encoding.
#[derive(Debug)]
pub struct CompressionPool {
    permits: Arc<Semaphore>,
    width: u32,
}

impl CompressionPool {
    pub fn new(threads: usize) -> Self {
        let width = threads.clamp(1, Semaphore::MAX_PERMITS.min(u32::MAX as usize));
        Self {
            permits: Arc::new(Semaphore::new(width)),
            width: width as u32,
        }
    }

    pub fn width(&self) -> usize {
        self.width as usize
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Run `job` on the blocking pool once a permit is free.
    ///
    /// The permit travels with the job, so a caller that stops waiting
    /// still holds back [`shutdown`](Self::shutdown) until the job ends.
    pub async fn run<F, R>(&self, job: F) -> ChResult<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ChError::ClientClosed)?;
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            job()
        })
        .await
        .map_err(|e| ChError::Task(e.to_string()))
    }

    /// Wait for in-flight jobs, then refuse new ones.
    pub async fn shutdown(&self) {
        if let Ok(all) = self.permits.acquire_many(self.width).await {
            self.permits.close();
            drop(all);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.permits.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_worker_group_rejects_after_shutdown() {
        let group = WorkerGroup::new();
        group.spawn(async {}).unwrap();
        group.shutdown().await;
        group.shutdown().await;
        assert!(group.is_closed());
        assert!(matches!(group.spawn(async {}), Err(ChError::ClientClosed)));
    }

    #[tokio::test]
    async fn test_shutdown_stops_pending_tasks() {
        let group = WorkerGroup::new();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        group
            .spawn(async move {
                let _tx = tx;
                std::future::pending::<()>().await;
            })
            .unwrap();
        group.shutdown().await;
        // Aborting the task dropped its sender.
        assert!(rx.await.is_err());
        assert_eq!(group.active(), 0);
    }

    #[tokio::test]
    async fn test_compression_pool_runs_jobs() {
        let pool = CompressionPool::new(2);
        let out = pool.run(|| 21 * 2).await.unwrap();
        assert_eq!(out, 42);
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test]
    async fn test_compression_shutdown_waits_for_jobs() {
        let pool = Arc::new(CompressionPool::new(1));
        let worker = pool.clone();
        let job = tokio::spawn(async move {
            worker
                .run(|| {
                    std::thread::sleep(Duration::from_millis(50));
                    7
                })
                .await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        pool.shutdown().await;
        assert!(job.await.unwrap().is_ok());
        assert!(pool.is_closed());
        assert!(matches!(pool.run(|| ()).await, Err(ChError::ClientClosed)));
        pool.shutdown().await;
    }
}
