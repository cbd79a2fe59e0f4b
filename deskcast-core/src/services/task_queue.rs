//! Per-service deferred task queue.
//!
//! Each service that needs one gets a lazily-created queue: a tokio
//! worker draining boxed closures in FIFO order, each optionally
//! delayed. Queues exist so event notifications and housekeeping run
//! off the producing thread.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

type QueuedFn = Box<dyn FnOnce() + Send + 'static>;

struct QueuedTask {
    run: QueuedFn,
    delay: Duration,
}

/// Handle to one service's task worker.
pub struct TaskQueue {
    tx: mpsc::UnboundedSender<QueuedTask>,
    token: CancellationToken,
}

impl TaskQueue {
    /// Spawn the queue worker. Must be called within a tokio runtime.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let (tx, mut rx) = mpsc::unbounded_channel::<QueuedTask>();
        let token = CancellationToken::new();
        let worker_token = token.clone();

        tokio::spawn(async move {
            debug!(queue = %name, "task queue started");
            loop {
                tokio::select! {
                    biased;
                    _ = worker_token.cancelled() => break,
                    task = rx.recv() => {
                        let Some(task) = task else { break };
                        if !task.delay.is_zero() {
                            tokio::time::sleep(task.delay).await;
                        }
                        (task.run)();
                    }
                }
            }
            debug!(queue = %name, "task queue stopped");
        });

        Self { tx, token }
    }

    /// Enqueue a closure to run after `delay_us` microseconds.
    /// Returns `false` once the queue has shut down.
    pub fn enqueue_task<F>(&self, f: F, delay_us: u64) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.tx
            .send(QueuedTask {
                run: Box::new(f),
                delay: Duration::from_micros(delay_us),
            })
            .is_ok()
    }

    /// Stop the worker. Queued tasks that have not started are
    /// discarded.
    pub fn shutdown(&self) {
        self.token.cancel();
    }
}

impl Drop for TaskQueue {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn runs_tasks_in_order() {
        let queue = TaskQueue::new("test");
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));

        for i in 0..3 {
            let log = Arc::clone(&log);
            queue.enqueue_task(move || log.lock().unwrap().push(i), 0);
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn honors_delay() {
        let queue = TaskQueue::new("test");
        let counter = Arc::new(AtomicUsize::new(0));

        let c = Arc::clone(&counter);
        queue.enqueue_task(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }, 80_000);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0, "still delayed");

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn enqueue_after_shutdown_fails() {
        let queue = TaskQueue::new("test");
        queue.shutdown();
        tokio::time::sleep(Duration::from_millis(20)).await;
        // The worker is gone; the send may still succeed into the
        // channel buffer, but nothing will run it.
        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        queue.enqueue_task(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }, 0);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }
}
