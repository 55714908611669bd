//! Queue workers with graceful shutdown
//!
//! `QueueManager::start` runs until the process ends. A `QueueWorker` runs
//! the same loop but can be stopped: shutdown is only observed between
//! jobs, so a claimed job always reaches its terminal call.

use crate::error::Result;
use crate::manager::{ExecuteOutcome, QueueManager};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::time::sleep;

/// A single worker polling one queue
pub struct QueueWorker {
    manager: QueueManager,
    queue: String,
    shutdown_tx: mpsc::Sender<()>,
}

impl QueueWorker {
    /// Create a new worker for `queue`
    pub fn new(manager: QueueManager, queue: impl Into<String>) -> (Self, mpsc::Receiver<()>) {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        (
            Self {
                manager,
                queue: queue.into(),
                shutdown_tx,
            },
            shutdown_rx,
        )
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Handle for requesting shutdown once the worker has been moved into a task
    pub fn shutdown_handle(&self) -> mpsc::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Run the worker until shutdown is requested
    ///
    /// After a processed job the next one is claimed immediately. An empty
    /// queue or a failed iteration waits for the driver's polling delay.
    /// Drivers without a polling delay get a single pass. Configuration
    /// errors are returned before the loop starts.
    pub async fn start(self, mut shutdown_rx: mpsc::Receiver<()>) -> Result<()> {
        let driver = self.manager.use_queue(Some(&self.queue))?;
        let Some(delay) = driver.polling_delay() else {
            if let Err(e) = self.manager.execute(Some(&self.queue)).await {
                tracing::error!(queue = %self.queue, error = %e, "Queue execution failed");
            }
            return Ok(());
        };

        tracing::info!(queue = %self.queue, driver = driver.kind(), "Queue worker started");

        loop {
            let drained = match self.manager.execute(Some(&self.queue)).await {
                Ok(ExecuteOutcome::Empty) => false,
                Ok(outcome) => {
                    tracing::trace!(queue = %self.queue, ?outcome, "Job processed");
                    true
                }
                Err(e) => {
                    tracing::error!(queue = %self.queue, error = %e, "Queue execution failed");
                    false
                }
            };

            if drained {
                match shutdown_rx.try_recv() {
                    Ok(()) | Err(TryRecvError::Disconnected) => break,
                    Err(TryRecvError::Empty) => continue,
                }
            }

            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = sleep(delay) => {},
            }
        }

        tracing::info!(queue = %self.queue, "Queue worker stopped");
        Ok(())
    }

    /// Request shutdown of this worker
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(()).await;
    }
}

/// One worker per queue, shut down together
pub struct WorkerPool {
    workers: Vec<(String, tokio::task::JoinHandle<Result<()>>)>,
    shutdown_txs: Vec<mpsc::Sender<()>>,
}

impl WorkerPool {
    /// Spawn a worker for each queue name
    pub fn new<I, S>(manager: &QueueManager, queues: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut workers = Vec::new();
        let mut shutdown_txs = Vec::new();

        for queue in queues {
            let (worker, shutdown_rx) = QueueWorker::new(manager.clone(), queue);
            let name = worker.queue().to_string();
            shutdown_txs.push(worker.shutdown_handle());

            let handle = tokio::spawn(worker.start(shutdown_rx));
            workers.push((name, handle));
        }

        Self {
            workers,
            shutdown_txs,
        }
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Shutdown all workers gracefully
    ///
    /// Sends shutdown signals to all workers and waits for them to finish
    /// their current jobs.
    pub async fn shutdown(self) {
        tracing::info!("Shutting down worker pool...");

        for shutdown_tx in self.shutdown_txs {
            let _ = shutdown_tx.send(()).await;
        }

        for (queue, worker) in self.workers {
            match worker.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!(queue = %queue, error = %e, "Queue worker exited with error"),
                Err(e) => tracing::error!(queue = %queue, error = %e, "Queue worker task failed"),
            }
        }

        tracing::info!("Worker pool shut down");
    }
}
