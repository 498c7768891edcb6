//! Observer broadcast
//!
//! Observers are keyed by a caller-owned disposer and hold only a weak
//! reference to it: once the disposer is dropped its callbacks stop firing
//! and the entry is pruned on the next broadcast. Notification snapshots the
//! table and releases the lock before calling anything, so callbacks may
//! register or unregister freely.

use crate::engine::TransferHandle;
use crate::error::QueueError;
use dlqueue_types::{DownloadRequest, DownloadedFile};
use parking_lot::Mutex;
use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

pub type ProgressCallback = Arc<dyn Fn(&DownloadRequest, &TransferHandle) + Send + Sync>;
pub type FinishedCallback =
    Arc<dyn Fn(&DownloadRequest, &TransferHandle, &DownloadedFile) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(&DownloadRequest, &TransferHandle, &QueueError) + Send + Sync>;

/// Callbacks for one observer; all optional
#[derive(Clone, Default)]
pub struct ObserverCallbacks {
    pub on_progress: Option<ProgressCallback>,
    pub on_finished: Option<FinishedCallback>,
    pub on_error: Option<ErrorCallback>,
}

impl ObserverCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(&DownloadRequest, &TransferHandle) + Send + Sync + 'static,
    {
        self.on_progress = Some(Arc::new(callback));
        self
    }

    pub fn on_finished<F>(mut self, callback: F) -> Self
    where
        F: Fn(&DownloadRequest, &TransferHandle, &DownloadedFile) + Send + Sync + 'static,
    {
        self.on_finished = Some(Arc::new(callback));
        self
    }

    pub fn on_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(&DownloadRequest, &TransferHandle, &QueueError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(callback));
        self
    }
}

struct Entry {
    key: usize,
    disposer: Weak<dyn Any + Send + Sync>,
    active: Arc<AtomicBool>,
    callbacks: ObserverCallbacks,
}

/// A live observer, captured for one broadcast
struct Live {
    _disposer: Arc<dyn Any + Send + Sync>,
    active: Arc<AtomicBool>,
    callbacks: ObserverCallbacks,
}

/// Registration table of observers
#[derive(Default)]
pub struct ObserverSet {
    entries: Mutex<Vec<Entry>>,
}

fn key_of<D>(disposer: &Arc<D>) -> usize {
    Arc::as_ptr(disposer) as *const () as usize
}

impl ObserverSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callbacks` for the lifetime of `disposer`. Registering the
    /// same disposer again replaces its callbacks.
    pub fn register<D>(&self, disposer: &Arc<D>, callbacks: ObserverCallbacks)
    where
        D: Send + Sync + 'static,
    {
        let key = key_of(disposer);
        let strong: Arc<dyn Any + Send + Sync> = disposer.clone();
        let entry = Entry {
            key,
            disposer: Arc::downgrade(&strong),
            active: Arc::new(AtomicBool::new(true)),
            callbacks,
        };

        let mut entries = self.entries.lock();
        entries.retain(|existing| {
            let replaced = existing.key == key;
            if replaced {
                existing.active.store(false, Ordering::Release);
            }
            !replaced && existing.disposer.strong_count() > 0
        });
        entries.push(entry);
    }

    pub fn unregister<D>(&self, disposer: &Arc<D>) {
        let key = key_of(disposer);
        self.entries.lock().retain(|entry| {
            if entry.key == key {
                entry.active.store(false, Ordering::Release);
                false
            } else {
                true
            }
        });
    }

    /// Number of observers whose disposer is still alive
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .iter()
            .filter(|entry| entry.disposer.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn notify_progress(&self, request: &DownloadRequest, handle: &TransferHandle) {
        for live in self.live() {
            if let Some(callback) = &live.callbacks.on_progress {
                if live.active.load(Ordering::Acquire) {
                    callback(request, handle);
                }
            }
        }
    }

    pub fn notify_finished(
        &self,
        request: &DownloadRequest,
        handle: &TransferHandle,
        file: &DownloadedFile,
    ) {
        for live in self.live() {
            if let Some(callback) = &live.callbacks.on_finished {
                if live.active.load(Ordering::Acquire) {
                    callback(request, handle, file);
                }
            }
        }
    }

    pub fn notify_error(&self, request: &DownloadRequest, handle: &TransferHandle, error: &QueueError) {
        for live in self.live() {
            if let Some(callback) = &live.callbacks.on_error {
                if live.active.load(Ordering::Acquire) {
                    callback(request, handle, error);
                }
            }
        }
    }

    /// Snapshot live observers in registration order, pruning dead ones
    fn live(&self) -> Vec<Live> {
        let mut entries = self.entries.lock();
        entries.retain(|entry| entry.disposer.strong_count() > 0);
        entries
            .iter()
            .filter_map(|entry| {
                entry.disposer.upgrade().map(|disposer| Live {
                    _disposer: disposer,
                    active: entry.active.clone(),
                    callbacks: entry.callbacks.clone(),
                })
            })
            .collect()
    }
}
