//! Bounded task pool for batch passes
//!
//! `submit` waits for a free slot before spawning, so a producer can never
//! run more than `workers` tasks ahead of completion.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::error;

use crate::error::ServiceError;

/// Aggregated outcome of every task submitted to a pool
#[derive(Debug)]
pub struct PoolReport<T> {
    pub completed: Vec<T>,
    pub failures: Vec<String>,
}

impl<T> PoolReport<T> {
    pub fn failed(&self) -> usize {
        self.failures.len()
    }
}

pub struct WorkerPool<T> {
    label: &'static str,
    semaphore: Arc<Semaphore>,
    tasks: JoinSet<Result<T, ServiceError>>,
    report: PoolReport<T>,
}

impl<T: Send + 'static> WorkerPool<T> {
    pub fn new(label: &'static str, workers: usize) -> Self {
        Self {
            label,
            semaphore: Arc::new(Semaphore::new(workers.max(1))),
            tasks: JoinSet::new(),
            report: PoolReport {
                completed: Vec::new(),
                failures: Vec::new(),
            },
        }
    }

    /// Spawn `task` once a worker slot is free
    pub async fn submit<F>(&mut self, task: F)
    where
        F: Future<Output = Result<T, ServiceError>> + Send + 'static,
    {
        let permit = match self.semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(e) => {
                self.report.failures.push(e.to_string());
                return;
            }
        };

        self.tasks.spawn(async move {
            let result = task.await;
            drop(permit);
            result
        });

        // Collect finished tasks so results do not pile up in the set
        while let Some(joined) = self.tasks.try_join_next() {
            self.collect(joined);
        }
    }

    fn collect(&mut self, joined: Result<Result<T, ServiceError>, tokio::task::JoinError>) {
        match joined {
            Ok(Ok(value)) => self.report.completed.push(value),
            Ok(Err(e)) => {
                error!(pool = self.label, error = %e, "Worker task failed");
                self.report.failures.push(e.to_string());
            }
            Err(e) => {
                error!(pool = self.label, error = %e, "Worker task panicked");
                self.report.failures.push(e.to_string());
            }
        }
    }

    /// Wait for every submitted task
    pub async fn join_all(mut self) -> PoolReport<T> {
        while let Some(joined) = self.tasks.join_next().await {
            self.collect(joined);
        }
        self.report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_collects_results_and_failures() {
        let mut pool = WorkerPool::new("test", 2);
        for i in 0..5u32 {
            pool.submit(async move {
                if i == 3 {
                    Err(StoreError::InvalidRow("bad chunk".into()).into())
                } else {
                    Ok(i)
                }
            })
            .await;
        }

        let report = pool.join_all().await;
        let mut completed = report.completed.clone();
        completed.sort_unstable();
        assert_eq!(completed, vec![0, 1, 2, 4]);
        assert_eq!(report.failed(), 1);
    }

    #[tokio::test]
    async fn test_never_exceeds_worker_count() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut pool = WorkerPool::new("test", 3);

        for _ in 0..12 {
            let running = running.clone();
            let peak = peak.clone();
            pool.submit(async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        }

        let report = pool.join_all().await;
        assert_eq!(report.completed.len(), 12);
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }
}
