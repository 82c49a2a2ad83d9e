//! Bounded-parallelism worker pool coupling one producer with N consumers.
//!
//! The producer feeds a bounded queue; workers pull from it. The first error
//! (from the producer, a consumer, or a panicking task) wins: nothing queued
//! after that is started, and items already in flight are dropped at their
//! next suspension point. Later errors are discarded.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Producer side of the pool queue.
pub struct WorkQueue<T> {
    tx: mpsc::Sender<T>,
    cancel: CancellationToken,
}

impl<T> WorkQueue<T> {
    /// Enqueues `item`, waiting while the queue is full.
    ///
    /// Returns `false` once the pool has stopped; the producer should return.
    pub async fn put(&self, item: T) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            sent = self.tx.send(item) => sent.is_ok(),
        }
    }
}

/// Worker pool configuration.
#[derive(Debug, Clone, Copy)]
pub struct WorkerPool {
    workers: usize,
    queue_depth: usize,
}

impl WorkerPool {
    /// Creates a pool of `workers` consumers with a queue as deep as the
    /// worker count.
    pub fn new(workers: usize) -> Self {
        let workers = workers.max(1);
        Self {
            workers,
            queue_depth: workers,
        }
    }

    pub fn with_queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth.max(1);
        self
    }

    /// Runs `producer` and the workers to completion.
    ///
    /// Returns the first error observed, or `Ok(())` once every produced
    /// item has been consumed.
    pub async fn run<T, P, PF, C, CF, E>(&self, producer: P, consumer: C) -> Result<(), E>
    where
        T: Send + 'static,
        P: FnOnce(WorkQueue<T>) -> PF,
        PF: Future<Output = Result<(), E>> + Send + 'static,
        C: Fn(T) -> CF + Send + Sync + 'static,
        CF: Future<Output = Result<(), E>> + Send + 'static,
        E: From<JoinError> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel::<T>(self.queue_depth);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let cancel = CancellationToken::new();
        let first_error: Arc<Mutex<Option<E>>> = Arc::new(Mutex::new(None));
        let consumer = Arc::new(consumer);

        let mut tasks = JoinSet::new();

        for worker in 0..self.workers {
            let rx = Arc::clone(&rx);
            let cancel = cancel.clone();
            let first_error = Arc::clone(&first_error);
            let consumer = Arc::clone(&consumer);
            tasks.spawn(async move {
                loop {
                    let item = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => None,
                        item = async { rx.lock().await.recv().await } => item,
                    };
                    let Some(item) = item else { break };
                    if cancel.is_cancelled() {
                        break;
                    }
                    let result = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        result = consumer(item) => result,
                    };
                    if let Err(e) = result {
                        record_error(&first_error, &cancel, e);
                    }
                }
                debug!(worker, "pool worker exiting");
            });
        }

        let queue = WorkQueue {
            tx,
            cancel: cancel.clone(),
        };
        let produce = producer(queue);
        {
            let cancel = cancel.clone();
            let first_error = Arc::clone(&first_error);
            tasks.spawn(async move {
                if let Err(e) = produce.await {
                    record_error(&first_error, &cancel, e);
                }
            });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                record_error(&first_error, &cancel, E::from(e));
            }
        }

        let mut slot = first_error.lock().unwrap_or_else(PoisonError::into_inner);
        match slot.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn record_error<E>(slot: &Mutex<Option<E>>, cancel: &CancellationToken, error: E) {
    let mut slot = slot.lock().unwrap_or_else(PoisonError::into_inner);
    if slot.is_none() {
        *slot = Some(error);
    }
    cancel.cancel();
}
