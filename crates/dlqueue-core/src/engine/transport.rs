//! Transport seam - the collaborator that moves the bytes
//!
//! A transport turns a source URL into a cancellable operation and reports
//! back through [`TransportEvents`]. Events are tagged with the task id the
//! queue assigned, which is the only link between an operation and its item.

use crate::error::TransportError;
use dlqueue_types::{ItemState, TaskId, TransferProgress};
use parking_lot::Mutex;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use url::Url;

/// What happened to a transfer
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEventKind {
    Progress { written: u64, total: Option<u64> },
    /// All data received into a temporary file, waiting to be moved
    TemporaryComplete(PathBuf),
    Failed(TransportError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransportEvent {
    pub task_id: TaskId,
    pub kind: TransportEventKind,
}

/// Callback sink handed to a transport for one operation
#[derive(Debug, Clone)]
pub struct TransportEvents {
    task_id: TaskId,
    tx: mpsc::UnboundedSender<TransportEvent>,
}

impl TransportEvents {
    pub(crate) fn new(task_id: TaskId, tx: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self { task_id, tx }
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn progress(&self, written: u64, total: Option<u64>) {
        self.send(TransportEventKind::Progress { written, total });
    }

    pub fn temporary_complete(&self, location: PathBuf) {
        self.send(TransportEventKind::TemporaryComplete(location));
    }

    pub fn failed(&self, error: TransportError) {
        self.send(TransportEventKind::Failed(error));
    }

    fn send(&self, kind: TransportEventKind) {
        // The queue may already be gone; nobody is left to tell
        let _ = self.tx.send(TransportEvent {
            task_id: self.task_id,
            kind,
        });
    }
}

/// A single cancellable transfer
pub trait TransferOperation: Send + Sync + 'static {
    /// Begin (or continue) the transfer
    fn resume(&self);

    /// Abort the transfer. May be a no-op or surface later as a failure.
    fn cancel(&self);
}

/// Factory for transfer operations
pub trait Transport: Send + Sync + 'static {
    fn create_operation(&self, source: &Url, events: TransportEvents) -> Arc<dyn TransferOperation>;
}

/// Shared view of one transfer: identity, lifecycle state and progress
#[derive(Clone)]
pub struct TransferHandle {
    task_id: TaskId,
    operation: Arc<dyn TransferOperation>,
    status: Arc<HandleStatus>,
}

struct HandleStatus {
    state: Mutex<ItemState>,
    progress: Mutex<TransferProgress>,
}

impl TransferHandle {
    pub(crate) fn new(task_id: TaskId, operation: Arc<dyn TransferOperation>) -> Self {
        Self {
            task_id,
            operation,
            status: Arc::new(HandleStatus {
                state: Mutex::new(ItemState::Created),
                progress: Mutex::new(TransferProgress::default()),
            }),
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn state(&self) -> ItemState {
        *self.status.state.lock()
    }

    pub fn progress(&self) -> TransferProgress {
        *self.status.progress.lock()
    }

    /// Apply a lifecycle step. Returns false if it is not legal from the
    /// current state.
    pub(crate) fn transition(&self, next: ItemState) -> bool {
        let mut state = self.status.state.lock();
        if !state.can_transition_to(next) {
            return false;
        }
        *state = next;
        true
    }

    pub(crate) fn record_progress(&self, written: u64, total: Option<u64>) {
        *self.status.progress.lock() = TransferProgress { written, total };
    }

    pub(crate) fn resume(&self) {
        self.operation.resume();
    }

    pub(crate) fn cancel(&self) {
        self.operation.cancel();
    }
}

impl PartialEq for TransferHandle {
    fn eq(&self, other: &Self) -> bool {
        self.task_id == other.task_id
    }
}

impl Eq for TransferHandle {}

impl fmt::Debug for TransferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferHandle")
            .field("task_id", &self.task_id)
            .field("state", &self.state())
            .field("progress", &self.progress())
            .finish()
    }
}
