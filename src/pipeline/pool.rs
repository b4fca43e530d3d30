//! Bounded worker pool with barrier-style fan-in.

use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex as TokioMutex};

#[derive(Debug, Error)]
#[error("task panicked: {0}")]
pub struct TaskPanicked(pub String);

#[derive(Debug, Clone, Copy)]
pub struct WorkerPool {
    workers: usize,
}

impl WorkerPool {
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Run `job` over every item with at most `workers` jobs in flight and
    /// wait for all of them.
    ///
    /// Results come back in input order whatever the completion order. A
    /// panicking job is reported as [`TaskPanicked`] for its item only.
    pub async fn run_all<I, T, F, Fut>(
        &self,
        items: Vec<I>,
        job: F,
    ) -> Vec<(I, Result<T, TaskPanicked>)>
    where
        I: Clone + Send + 'static,
        T: Send + 'static,
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        let count = items.len();
        let (tx, rx) = mpsc::channel::<(usize, I)>(count.max(1));
        let rx = Arc::new(TokioMutex::new(rx));
        let (result_tx, mut result_rx) =
            mpsc::unbounded_channel::<(usize, Result<T, TaskPanicked>)>();
        let job = Arc::new(job);

        let mut worker_handles = Vec::new();
        for _ in 0..self.workers.min(count) {
            let worker_rx = Arc::clone(&rx);
            let result_tx = result_tx.clone();
            let job = Arc::clone(&job);

            let handle = tokio::spawn(async move {
                loop {
                    let next = worker_rx.lock().await.recv().await;
                    let Some((index, item)) = next else {
                        break;
                    };
                    let outcome = tokio::spawn(job(item))
                        .await
                        .map_err(|e| TaskPanicked(e.to_string()));
                    if let Err(e) = &outcome {
                        tracing::warn!("Worker task {} failed: {}", index, e);
                    }
                    if result_tx.send((index, outcome)).is_err() {
                        break;
                    }
                }
            });
            worker_handles.push(handle);
        }
        drop(result_tx);

        for (index, item) in items.iter().cloned().enumerate() {
            if tx.send((index, item)).await.is_err() {
                break;
            }
        }
        drop(tx);

        let mut slots: Vec<Option<Result<T, TaskPanicked>>> = (0..count).map(|_| None).collect();
        while let Some((index, outcome)) = result_rx.recv().await {
            slots[index] = Some(outcome);
        }
        for handle in worker_handles {
            if let Err(e) = handle.await {
                tracing::warn!("Worker failed: {}", e);
            }
        }

        items
            .into_iter()
            .zip(slots)
            .map(|(item, slot)| {
                let outcome = slot.unwrap_or_else(|| {
                    Err(TaskPanicked("worker exited before the task ran".into()))
                });
                (item, outcome)
            })
            .collect()
    }
}
