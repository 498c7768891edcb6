//! Queue Manager - the orchestrator
//!
//! This is the top-level coordinator that:
//! - Validates and deduplicates incoming requests
//! - Admits items to the worker pool in submission order
//! - Turns transport events into observer notifications
//! - Removes items once they reach a terminal state

use crate::engine::item::DownloadItem;
use crate::engine::pool::WorkerPool;
use crate::engine::transport::{TransferHandle, Transport, TransportEvent, TransportEventKind};
use crate::error::QueueError;
use crate::naming::DownloadsDirectory;
use crate::observers::{ObserverCallbacks, ObserverSet};
use crate::registry::ConcurrentRegistry;
use crate::storage::{FileStore, LocalFileStore};
use dlqueue_types::{DownloadMode, DownloadRequest, DownloadedFile, QueueConfig, QueueEvent, TaskId};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

/// What `enqueue` did with a request
#[derive(Debug, Clone, PartialEq)]
pub enum Enqueued {
    /// Admitted to the worker pool
    Scheduled(TransferHandle),
    /// A file with the requested name already exists and was reused
    Reused(DownloadedFile),
    /// An item for the same destination is already in flight
    Deduplicated,
}

/// Download queue that coordinates all transfers
#[derive(Clone)]
pub struct QueueManager {
    inner: Arc<Inner>,
}

struct Inner {
    config: QueueConfig,
    registry: ConcurrentRegistry<Arc<DownloadItem>>,
    pool: WorkerPool,
    observers: ObserverSet,
    directory: DownloadsDirectory,
    transport: Arc<dyn Transport>,
    /// Sink cloned into every transfer operation
    transport_tx: mpsc::UnboundedSender<TransportEvent>,
    /// Event broadcaster
    event_tx: broadcast::Sender<QueueEvent>,
    /// Most recent item failure; advisory only
    last_error: Mutex<Option<Arc<QueueError>>>,
    next_task: AtomicU64,
}

impl QueueManager {
    /// Create a queue on the current tokio runtime, writing to the local disk
    pub fn new(config: QueueConfig, transport: Arc<dyn Transport>) -> Result<Self, QueueError> {
        let delivery = Handle::try_current().map_err(|e| QueueError::Runtime(e.to_string()))?;
        Ok(Self::with_parts(
            config,
            transport,
            Arc::new(LocalFileStore::new()),
            delivery,
        ))
    }

    /// Create a queue with an explicit file store and delivery runtime.
    ///
    /// Workers and transport callbacks run on `delivery`.
    pub fn with_parts(
        config: QueueConfig,
        transport: Arc<dyn Transport>,
        store: Arc<dyn FileStore>,
        delivery: Handle,
    ) -> Self {
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let (event_tx, _) = broadcast::channel(config.event_capacity.max(1));
        let pool = WorkerPool::new(config.mode, &delivery);
        let directory = DownloadsDirectory::new(&config, store);

        info!(
            "Starting download queue in {:?} (limit {})",
            directory.path(),
            pool.limit()
        );

        let inner = Arc::new(Inner {
            config,
            registry: ConcurrentRegistry::new(),
            pool,
            observers: ObserverSet::new(),
            directory,
            transport,
            transport_tx,
            event_tx,
            last_error: Mutex::new(None),
            next_task: AtomicU64::new(1),
        });

        delivery.spawn(dispatch(Arc::downgrade(&inner), transport_rx));

        Self { inner }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    /// Subscribe to queue events
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.inner.event_tx.subscribe()
    }

    // ========================================================================
    // Observers
    // ========================================================================

    /// Register callbacks that live as long as `disposer`
    pub fn register<D>(&self, disposer: &Arc<D>, callbacks: ObserverCallbacks)
    where
        D: Send + Sync + 'static,
    {
        self.inner.observers.register(disposer, callbacks);
    }

    pub fn unregister<D>(&self, disposer: &Arc<D>) {
        self.inner.observers.unregister(disposer);
    }

    // ========================================================================
    // Queue Operations
    // ========================================================================

    /// Add a download to the queue
    pub async fn enqueue(&self, request: DownloadRequest) -> Result<Enqueued, QueueError> {
        let inner = &self.inner;
        if inner.registry.is_empty() {
            *inner.last_error.lock() = None;
        }

        let task_id = TaskId(inner.next_task.fetch_add(1, Ordering::SeqCst));
        let item = match DownloadItem::new(request, task_id, inner.transport.as_ref(), &inner.transport_tx) {
            Ok(item) => Arc::new(item),
            Err(e) => {
                warn!("Rejected download request: {}", e);
                return Err(e);
            }
        };
        let request = item.request();

        match request.mode {
            DownloadMode::ReuseIfExists => {
                if let Some(file) = inner.directory.existing_file(&request.destination_name).await {
                    info!("Reusing {:?} for {}", file.relative_path(), request.id);
                    inner.observers.notify_finished(request, item.handle(), &file);
                    inner.publish(QueueEvent::Finished {
                        id: request.id.clone(),
                        task_id,
                        file: file.clone(),
                    });
                    item.cancel();
                    return Ok(Enqueued::Reused(file));
                }

                let name = &request.destination_name;
                let inserted = inner
                    .registry
                    .insert_unless(item.clone(), |active| &active.request().destination_name == name);
                if !inserted {
                    debug!("{} is already downloading, dropping {}", name, request.id);
                    item.cancel();
                    return Ok(Enqueued::Deduplicated);
                }
            }
            DownloadMode::AlwaysCreate => {
                inner.registry.insert(item.clone());
            }
        }

        inner.admit(&item);
        Ok(Enqueued::Scheduled(item.handle().clone()))
    }

    /// Enqueue each request in order; a failure does not stop the rest
    pub async fn enqueue_multiple<I>(&self, requests: I) -> Vec<Result<Enqueued, QueueError>>
    where
        I: IntoIterator<Item = DownloadRequest>,
    {
        let mut results = Vec::new();
        for request in requests {
            results.push(self.enqueue(request).await);
        }
        results
    }

    /// Cancel every active download with this id. Returns how many were cancelled.
    pub fn cancel(&self, id: &str) -> usize {
        let inner = &self.inner;
        let removal = inner.registry.remove_where(|item| item.request().id == id);

        for item in &removal.removed {
            inner.cancel_item(item);
        }
        if removal.drained {
            if let Some(last) = removal.removed.last() {
                inner.announce_drained(last);
            }
        }
        removal.removed.len()
    }

    /// Cancel everything and empty the queue
    pub fn cancel_all(&self) {
        let items = self.inner.registry.remove_all();
        info!("Cancelling all {} downloads", items.len());
        for item in &items {
            self.inner.cancel_item(item);
        }
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn is_downloading(&self, id: &str) -> bool {
        self.inner.registry.contains(|item| item.request().id == id)
    }

    /// Handles of all active downloads, in admission order
    pub fn active_handles(&self) -> Vec<TransferHandle> {
        self.inner.registry.map(|item| item.handle().clone())
    }

    /// Handle of the first active download with this id
    pub fn handle_for(&self, id: &str) -> Option<TransferHandle> {
        self.inner
            .registry
            .first_where(|item| item.request().id == id)
            .map(|item| item.handle().clone())
    }

    pub fn active_count(&self) -> usize {
        self.inner.registry.count()
    }

    /// Worker slots currently held by transfers
    pub fn running_count(&self) -> usize {
        self.inner.pool.occupied()
    }

    /// Admitted downloads still waiting for a worker slot
    pub fn waiting_count(&self) -> usize {
        self.inner.pool.pending()
    }

    /// Last error recorded since the queue was last empty
    pub fn last_error(&self) -> Option<Arc<QueueError>> {
        self.inner.last_error.lock().clone()
    }

    // ========================================================================
    // Files
    // ========================================================================

    pub fn downloads_dir(&self) -> &Path {
        self.inner.directory.path()
    }

    pub fn absolute_path(&self, file: &DownloadedFile) -> PathBuf {
        file.absolute_path(self.inner.directory.root())
    }

    /// Remove every file in the downloads directory
    pub async fn clean_directory(&self) -> Result<(), QueueError> {
        self.inner.directory.clean().await
    }

    pub async fn remove_file(&self, file: &DownloadedFile) -> Result<(), QueueError> {
        self.inner.directory.remove(file).await
    }

    /// The already downloaded file called `name`, if any
    pub async fn existing_file(&self, name: &str) -> Option<DownloadedFile> {
        self.inner.directory.existing_file(name).await
    }
}

impl Inner {
    fn publish(&self, event: QueueEvent) {
        let _ = self.event_tx.send(event);
    }

    fn admit(&self, item: &Arc<DownloadItem>) {
        let request = item.request();
        if !self.pool.schedule(item) {
            warn!("Could not schedule {} ({})", request.id, item.task_id());
        }
        info!("Queued {} as {}", request.id, item.task_id());
        self.observers.notify_progress(request, item.handle());
        self.publish(QueueEvent::Queued {
            id: request.id.clone(),
            task_id: item.task_id(),
        });
    }

    fn cancel_item(&self, item: &DownloadItem) {
        if item.cancel() {
            self.publish(QueueEvent::Cancelled {
                id: item.request().id.clone(),
                task_id: item.task_id(),
            });
        }
    }

    async fn handle_event(&self, event: TransportEvent) {
        let Some(item) = self
            .registry
            .first_where(|item| item.task_id() == event.task_id)
        else {
            debug!("Ignoring event for inactive {}", event.task_id);
            return;
        };

        match event.kind {
            TransportEventKind::Progress { written, total } => {
                item.handle().record_progress(written, total);
                self.observers.notify_progress(item.request(), item.handle());
                self.publish(QueueEvent::Progress {
                    id: item.request().id.clone(),
                    task_id: item.task_id(),
                    progress: item.handle().progress(),
                });
            }
            TransportEventKind::TemporaryComplete(temp) => {
                if item.state().is_terminal() {
                    return;
                }
                // Awaited inline: relocations run one at a time, so AlwaysCreate
                // name selection never hands two items the same free name
                match item.relocate(&temp, &self.directory).await {
                    Ok(file) => self.finish_item(&item, file),
                    Err(e) => self.fail_item(&item, e),
                }
                self.retire(&item);
            }
            TransportEventKind::Failed(e) => {
                self.fail_item(&item, QueueError::Transport(e));
                self.retire(&item);
            }
        }
    }

    fn finish_item(&self, item: &DownloadItem, file: DownloadedFile) {
        if !item.finish(file.clone()) {
            return;
        }
        info!("Download completed: {} -> {:?}", item.request().id, file.relative_path());
        self.observers.notify_finished(item.request(), item.handle(), &file);
        self.publish(QueueEvent::Finished {
            id: item.request().id.clone(),
            task_id: item.task_id(),
            file,
        });
    }

    fn fail_item(&self, item: &DownloadItem, e: QueueError) {
        let e = Arc::new(e);
        if !item.fail(e.clone()) {
            return;
        }
        error!("Download failed: {} - {}", item.request().id, e);
        *self.last_error.lock() = Some(e.clone());
        self.observers.notify_error(item.request(), item.handle(), &e);
        self.publish(QueueEvent::Failed {
            id: item.request().id.clone(),
            task_id: item.task_id(),
            error: e.to_string(),
        });
    }

    /// Drop a terminal item from the registry
    fn retire(&self, item: &DownloadItem) {
        let task_id = item.task_id();
        let removal = self.registry.remove_where(|active| active.task_id() == task_id);
        if removal.drained {
            self.announce_drained(item);
        }
    }

    fn announce_drained(&self, item: &DownloadItem) {
        let last_error = self.last_error.lock().clone();
        info!("Download queue drained");
        if let Some(e) = &last_error {
            self.observers.notify_error(item.request(), item.handle(), e);
        }
        self.publish(QueueEvent::Drained {
            last_error: last_error.map(|e| e.to_string()),
        });
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        for item in self.registry.remove_all() {
            item.cancel();
        }
    }
}

/// Deliver transport events to the queue, one at a time
async fn dispatch(inner: Weak<Inner>, mut rx: mpsc::UnboundedReceiver<TransportEvent>) {
    while let Some(event) = rx.recv().await {
        let Some(queue) = inner.upgrade() else {
            break;
        };
        queue.handle_event(event).await;
    }
    debug!("Transport event dispatch stopped");
}
