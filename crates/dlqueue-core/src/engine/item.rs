//! Download item - one queued request bound to its transfer operation
//!
//! The item owns the completion signal that releases its worker slot.
//! The sender sits behind a `Mutex<Option<_>>` and is taken on first use,
//! so every terminal path fires it at most once. Dropping an unfired item
//! drops the sender, which the worker also treats as terminal.

use crate::engine::transport::{TransferHandle, Transport, TransportEvent, TransportEvents};
use crate::error::QueueError;
use crate::naming::{is_plain_name, DownloadsDirectory};
use dlqueue_types::{DownloadRequest, DownloadedFile, ItemState, TaskId};
use parking_lot::Mutex;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

/// How an item left the queue
#[derive(Debug, Clone)]
pub enum ItemOutcome {
    Completed(DownloadedFile),
    Cancelled,
    Failed(Arc<QueueError>),
}

pub struct DownloadItem {
    request: DownloadRequest,
    handle: TransferHandle,
    completion: Mutex<Option<oneshot::Sender<ItemOutcome>>>,
    signal: Mutex<Option<oneshot::Receiver<ItemOutcome>>>,
    /// Set once the file has been moved into the downloads directory
    completed: AtomicBool,
}

impl DownloadItem {
    /// Create the item and its (not yet started) transfer operation
    pub fn new(
        request: DownloadRequest,
        task_id: TaskId,
        transport: &dyn Transport,
        events_tx: &mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Self, QueueError> {
        let source = request
            .source
            .as_ref()
            .ok_or_else(|| QueueError::InvalidRequest {
                id: request.id.clone(),
            })?;
        if !is_plain_name(&request.destination_name) {
            return Err(QueueError::InvalidDestination {
                id: request.id.clone(),
                name: request.destination_name.clone(),
            });
        }

        let events = TransportEvents::new(task_id, events_tx.clone());
        let operation = transport.create_operation(source, events);
        let (tx, rx) = oneshot::channel();

        Ok(Self {
            request,
            handle: TransferHandle::new(task_id, operation),
            completion: Mutex::new(Some(tx)),
            signal: Mutex::new(Some(rx)),
            completed: AtomicBool::new(false),
        })
    }

    pub fn request(&self) -> &DownloadRequest {
        &self.request
    }

    pub fn handle(&self) -> &TransferHandle {
        &self.handle
    }

    pub fn task_id(&self) -> TaskId {
        self.handle.task_id()
    }

    pub fn state(&self) -> ItemState {
        self.handle.state()
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    /// Receiver side of the completion signal; handed out once
    pub(crate) fn take_completion_signal(&self) -> Option<oneshot::Receiver<ItemOutcome>> {
        self.signal.lock().take()
    }

    pub(crate) fn mark_scheduled(&self) -> bool {
        self.handle.transition(ItemState::Scheduled)
    }

    /// Move to `Running` and resume the transfer
    pub(crate) fn start(&self) -> bool {
        if !self.handle.transition(ItemState::Running) {
            return false;
        }
        debug!("Resuming {} for {}", self.task_id(), self.request.id);
        self.handle.resume();
        true
    }

    /// Cancel the item, the transfer and release the worker slot.
    ///
    /// Returns false if the item had already reached a terminal state.
    pub fn cancel(&self) -> bool {
        if !self.handle.transition(ItemState::Cancelled) {
            return false;
        }
        info!("Cancelling {} ({})", self.request.id, self.task_id());
        self.handle.cancel();
        self.complete(ItemOutcome::Cancelled);
        true
    }

    pub(crate) fn fail(&self, error: Arc<QueueError>) -> bool {
        if !self.handle.transition(ItemState::Failed) {
            return false;
        }
        self.complete(ItemOutcome::Failed(error));
        true
    }

    pub(crate) fn finish(&self, file: DownloadedFile) -> bool {
        if !self.handle.transition(ItemState::Completed) {
            return false;
        }
        self.complete(ItemOutcome::Completed(file));
        true
    }

    /// Move the finished temp file to its destination and apply attributes.
    ///
    /// An existing file at the destination is never replaced. If the move
    /// fails the file stays where the transport left it.
    pub(crate) async fn relocate(
        &self,
        temp: &Path,
        directory: &DownloadsDirectory,
    ) -> Result<DownloadedFile, QueueError> {
        let name = &self.request.destination_name;
        let destination = match directory.resolve_destination(name, self.request.mode).await {
            Ok(path) => path,
            Err(QueueError::FileSystem(source)) => {
                return Err(QueueError::Relocation {
                    path: directory.path().join(name),
                    source,
                })
            }
            Err(e) => return Err(e),
        };

        let file = DownloadedFile::from_absolute(&destination, directory.root()).ok_or_else(|| {
            QueueError::Relocation {
                path: destination.clone(),
                source: io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "destination is outside the root directory",
                ),
            }
        })?;

        let store = directory.store();
        store
            .move_file(temp, &destination)
            .await
            .map_err(|source| QueueError::Relocation {
                path: destination.clone(),
                source,
            })?;

        if let Some(attributes) = &self.request.attributes {
            store
                .set_attributes(&destination, attributes)
                .await
                .map_err(|source| QueueError::Relocation {
                    path: destination.clone(),
                    source,
                })?;
        }

        self.completed.store(true, Ordering::Release);
        info!("Moved {} into {:?}", self.request.id, destination);
        Ok(file)
    }

    fn complete(&self, outcome: ItemOutcome) -> bool {
        match self.completion.lock().take() {
            Some(tx) => {
                // The worker may have stopped listening; the slot is free either way
                let _ = tx.send(outcome);
                true
            }
            None => false,
        }
    }
}

impl PartialEq for DownloadItem {
    fn eq(&self, other: &Self) -> bool {
        self.request == other.request && self.handle == other.handle
    }
}

impl std::fmt::Debug for DownloadItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadItem")
            .field("request", &self.request)
            .field("handle", &self.handle)
            .field("completed", &self.is_completed())
            .finish()
    }
}
