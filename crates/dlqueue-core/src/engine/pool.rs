//! Worker pool - bounded concurrency for transfers
//!
//! Every admitted item holds one semaphore permit from the moment its
//! transfer is resumed until its completion signal fires. A single
//! admission task hands out permits in scheduling order.

use crate::engine::item::{DownloadItem, ItemOutcome};
use dlqueue_types::{ConcurrencyMode, TaskId};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

struct Job {
    task_id: TaskId,
    item: Weak<DownloadItem>,
    signal: oneshot::Receiver<ItemOutcome>,
}

impl Job {
    /// Nothing left to run: the item is gone or already terminal
    fn is_stale(&self) -> bool {
        self.item
            .upgrade()
            .map_or(true, |item| item.state().is_terminal())
    }
}

pub struct WorkerPool {
    limit: usize,
    semaphore: Arc<Semaphore>,
    jobs: mpsc::UnboundedSender<Job>,
    pending: Arc<AtomicUsize>,
}

impl WorkerPool {
    /// Create a pool and start its admission task on `runtime`
    pub fn new(mode: ConcurrencyMode, runtime: &Handle) -> Self {
        let limit = mode.limit();
        let semaphore = Arc::new(Semaphore::new(limit));
        let pending = Arc::new(AtomicUsize::new(0));
        let (jobs, rx) = mpsc::unbounded_channel();

        runtime.spawn(admit(rx, semaphore.clone(), pending.clone(), runtime.clone()));

        Self {
            limit,
            semaphore,
            jobs,
            pending,
        }
    }

    /// Queue `item` for a worker slot. Returns false if the item was already
    /// scheduled or has finished.
    pub fn schedule(&self, item: &Arc<DownloadItem>) -> bool {
        let Some(signal) = item.take_completion_signal() else {
            return false;
        };
        if !item.mark_scheduled() {
            return false;
        }

        self.pending.fetch_add(1, Ordering::SeqCst);
        let job = Job {
            task_id: item.task_id(),
            item: Arc::downgrade(item),
            signal,
        };
        if self.jobs.send(job).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            warn!("Worker pool is shut down, dropping {}", item.task_id());
            return false;
        }
        true
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Slots currently held by transfers
    pub fn occupied(&self) -> usize {
        self.limit - self.semaphore.available_permits()
    }

    /// Jobs waiting for a slot
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }
}

async fn admit(
    mut rx: mpsc::UnboundedReceiver<Job>,
    semaphore: Arc<Semaphore>,
    pending: Arc<AtomicUsize>,
    runtime: Handle,
) {
    while let Some(job) = rx.recv().await {
        if job.is_stale() {
            pending.fetch_sub(1, Ordering::SeqCst);
            debug!("Skipping {}: finished before admission", job.task_id);
            continue;
        }

        let permit = match semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };
        pending.fetch_sub(1, Ordering::SeqCst);
        runtime.spawn(occupy(job, permit));
    }
    debug!("Worker pool admission stopped");
}

async fn occupy(job: Job, permit: OwnedSemaphorePermit) {
    let started = match job.item.upgrade() {
        Some(item) => item.start(),
        None => false,
    };

    if started {
        match job.signal.await {
            Ok(outcome) => debug!("Worker for {} released: {:?}", job.task_id, outcome),
            Err(_) => debug!("Worker for {} released: item dropped", job.task_id),
        }
    }

    drop(permit);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::transport::{TransferOperation, Transport, TransportEvents};
    use dlqueue_types::{DownloadRequest, ItemState};
    use parking_lot::Mutex;
    use std::time::Duration;
    use url::Url;

    struct RecordingOperation {
        task_id: TaskId,
        started: Arc<Mutex<Vec<TaskId>>>,
    }

    impl TransferOperation for RecordingOperation {
        fn resume(&self) {
            self.started.lock().push(self.task_id);
        }

        fn cancel(&self) {}
    }

    #[derive(Default)]
    struct RecordingTransport {
        started: Arc<Mutex<Vec<TaskId>>>,
    }

    impl Transport for RecordingTransport {
        fn create_operation(&self, _source: &Url, events: TransportEvents) -> Arc<dyn TransferOperation> {
            Arc::new(RecordingOperation {
                task_id: events.task_id(),
                started: self.started.clone(),
            })
        }
    }

    fn items(transport: &RecordingTransport, count: u64) -> Vec<Arc<DownloadItem>> {
        let (tx, _rx) = mpsc::unbounded_channel();
        (0..count)
            .map(|i| {
                let request = DownloadRequest::new(
                    format!("r{}", i),
                    Url::parse("https://example.com/f").ok(),
                    format!("f{}", i),
                );
                Arc::new(DownloadItem::new(request, TaskId(i), transport, &tx).unwrap())
            })
            .collect()
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_serial_runs_one_at_a_time_in_order() {
        let transport = RecordingTransport::default();
        let pool = WorkerPool::new(ConcurrencyMode::Serial, &Handle::current());
        let items = items(&transport, 3);
        for item in &items {
            assert!(pool.schedule(item));
        }
        assert!(!pool.schedule(&items[0]));

        wait_until(|| transport.started.lock().len() == 1).await;
        assert_eq!(pool.occupied(), 1);
        assert_eq!(pool.pending(), 2);
        assert_eq!(items[1].state(), ItemState::Scheduled);

        items[0].cancel();
        wait_until(|| transport.started.lock().len() == 2).await;
        items[1].cancel();
        wait_until(|| transport.started.lock().len() == 3).await;
        items[2].cancel();
        wait_until(|| pool.occupied() == 0).await;

        assert_eq!(*transport.started.lock(), vec![TaskId(0), TaskId(1), TaskId(2)]);
    }

    #[tokio::test]
    async fn test_parallel_limit() {
        let transport = RecordingTransport::default();
        let pool = WorkerPool::new(ConcurrencyMode::Parallel { max: 2 }, &Handle::current());
        let items = items(&transport, 5);
        for item in &items {
            pool.schedule(item);
        }

        wait_until(|| transport.started.lock().len() == 2).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(transport.started.lock().len(), 2);
        assert_eq!(pool.occupied(), 2);

        for item in &items {
            item.cancel();
        }
        wait_until(|| pool.occupied() == 0 && pool.pending() == 0).await;
        // Cancelled before admission: never resumed
        assert_eq!(transport.started.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_dropped_item_frees_slot() {
        let transport = RecordingTransport::default();
        let pool = WorkerPool::new(ConcurrencyMode::Serial, &Handle::current());
        let mut items = items(&transport, 2);
        for item in &items {
            pool.schedule(item);
        }
        wait_until(|| transport.started.lock().len() == 1).await;

        // Drop the running item without firing its completion
        items.remove(0);
        wait_until(|| transport.started.lock().len() == 2).await;
        items[0].cancel();
        wait_until(|| pool.occupied() == 0).await;
    }
}
