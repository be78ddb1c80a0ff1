//! Background work queue for dispatch runs.
//!
//! Callers hand off a unit of work and return immediately. A single consumer
//! executes units strictly one after another in FIFO order.

use std::future::Future;

use async_trait::async_trait;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::NotificationError;

/// Default capacity of the bounded work channel.
pub const DEFAULT_WORK_QUEUE_CAPACITY: usize = 1024;

/// A unit of background work. Receives the queue's shutdown token.
pub type WorkItem = Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, ()> + Send>;

/// Boxes an async closure into a [`WorkItem`].
pub fn work_item<F, Fut>(f: F) -> WorkItem
where
    F: FnOnce(CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Box::new(move |cancel| f(cancel).boxed())
}

#[async_trait]
pub trait BackgroundQueue: Send + Sync {
    /// Enqueues a unit of work without waiting for it to run.
    ///
    /// # Errors
    ///
    /// `QueueFull` when the queue is at capacity, `QueueClosed` after shutdown.
    async fn enqueue(&self, work: WorkItem) -> Result<(), NotificationError>;
}

/// Bounded queue drained by one consumer task.
#[derive(Clone)]
pub struct BackgroundWorkQueue {
    sender: mpsc::Sender<WorkItem>,
    shutdown: CancellationToken,
}

impl BackgroundWorkQueue {
    /// Starts the consumer. It stops pulling once `shutdown` is cancelled; the
    /// unit being executed sees the same token and winds down on its own.
    pub fn start(capacity: usize, shutdown: CancellationToken) -> (Self, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let handle = tokio::spawn(consume(receiver, shutdown.clone()));
        (Self { sender, shutdown }, handle)
    }
}

#[async_trait]
impl BackgroundQueue for BackgroundWorkQueue {
    async fn enqueue(&self, work: WorkItem) -> Result<(), NotificationError> {
        if self.shutdown.is_cancelled() {
            return Err(NotificationError::QueueClosed);
        }

        self.sender.try_send(work).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => NotificationError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => NotificationError::QueueClosed,
        })
    }
}

async fn consume(mut receiver: mpsc::Receiver<WorkItem>, shutdown: CancellationToken) {
    info!("Background work queue started");
    let mut completed = 0u64;

    loop {
        let work = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            work = receiver.recv() => match work {
                Some(work) => work,
                None => break,
            },
        };

        // Spawned so a panicking unit cannot take the consumer down with it.
        let result = tokio::spawn(work(shutdown.clone())).await;
        match result {
            Ok(()) => {
                completed += 1;
                debug!(completed, "Background work item finished");
            }
            Err(e) => error!(error = %e, "Background work item panicked"),
        }
    }

    receiver.close();
    let mut dropped = 0usize;
    while receiver.try_recv().is_ok() {
        dropped += 1;
    }
    info!(completed, dropped, "Background work queue stopped");
}

/// Runs each unit to completion inside `enqueue`. Intended for tests.
#[derive(Debug, Clone, Default)]
pub struct InlineWorkQueue {
    cancel: CancellationToken,
}

impl InlineWorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Units run with this token instead of a fresh one.
    pub fn with_token(cancel: CancellationToken) -> Self {
        Self { cancel }
    }
}

#[async_trait]
impl BackgroundQueue for InlineWorkQueue {
    async fn enqueue(&self, work: WorkItem) -> Result<(), NotificationError> {
        work(self.cancel.clone()).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::{Mutex, Notify};

    fn recording_item(log: Arc<Mutex<Vec<usize>>>, n: usize) -> WorkItem {
        work_item(move |_cancel| async move {
            tokio::time::sleep(Duration::from_millis(2)).await;
            log.lock().await.push(n);
        })
    }

    fn noop() -> WorkItem {
        work_item(|_| async {})
    }

    #[tokio::test]
    async fn test_units_run_in_fifo_order() {
        let shutdown = CancellationToken::new();
        let (queue, handle) = BackgroundWorkQueue::start(16, shutdown.clone());
        let log = Arc::new(Mutex::new(Vec::new()));
        let done = Arc::new(Notify::new());

        for n in 0..5 {
            queue.enqueue(recording_item(log.clone(), n)).await.unwrap();
        }
        let signal = done.clone();
        queue
            .enqueue(work_item(move |_| async move { signal.notify_one() }))
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), done.notified())
            .await
            .unwrap();
        assert_eq!(*log.lock().await, vec![0, 1, 2, 3, 4]);

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_full_queue_rejects_without_blocking() {
        let shutdown = CancellationToken::new();
        let (queue, handle) = BackgroundWorkQueue::start(1, shutdown.clone());
        let gate = Arc::new(Notify::new());
        let started = Arc::new(Notify::new());

        let (g, s) = (gate.clone(), started.clone());
        queue
            .enqueue(work_item(move |_| async move {
                s.notify_one();
                g.notified().await;
            }))
            .await
            .unwrap();
        started.notified().await;

        // consumer is busy: one slot fills, the next is rejected
        queue.enqueue(noop()).await.unwrap();
        let err = queue.enqueue(noop()).await.unwrap_err();
        assert!(matches!(err, NotificationError::QueueFull));

        gate.notify_one();
        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_after_shutdown() {
        let shutdown = CancellationToken::new();
        let (queue, handle) = BackgroundWorkQueue::start(4, shutdown.clone());
        shutdown.cancel();
        handle.await.unwrap();

        let err = queue.enqueue(noop()).await.unwrap_err();
        assert!(matches!(err, NotificationError::QueueClosed));
    }

    #[tokio::test]
    async fn test_panicking_unit_does_not_stop_consumer() {
        let shutdown = CancellationToken::new();
        let (queue, handle) = BackgroundWorkQueue::start(4, shutdown.clone());
        let ran = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(Notify::new());

        queue
            .enqueue(work_item(|_| async {
                if true {
                    panic!("boom");
                }
            }))
            .await
            .unwrap();
        let (r, d) = (ran.clone(), done.clone());
        queue
            .enqueue(work_item(move |_| async move {
                r.fetch_add(1, Ordering::SeqCst);
                d.notify_one();
            }))
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), done.notified())
            .await
            .unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_inline_queue_runs_immediately() {
        let ran = Arc::new(AtomicUsize::new(0));
        let r = ran.clone();
        InlineWorkQueue::new()
            .enqueue(work_item(move |_| async move {
                r.fetch_add(1, Ordering::SeqCst);
            }))
            .await
            .unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
