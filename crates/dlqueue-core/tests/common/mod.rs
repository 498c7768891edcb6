//! Shared fixtures for queue integration tests

#![allow(dead_code)]

use dlqueue_core::dlqueue_types::{DownloadRequest, DownloadedFile, TaskId};
use dlqueue_core::{
    ObserverCallbacks, QueueError, TransferOperation, Transport, TransportError, TransportEvents,
};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use url::Url;

/// What an operation does once resumed
#[derive(Debug, Clone, Copy)]
pub enum Behavior {
    /// Wait for the test to drive it
    Manual,
    /// Write a small file and report completion after `delay`
    Complete { delay: Duration },
    /// Report a network failure after `delay`
    Fail { delay: Duration },
}

#[derive(Default)]
pub struct Counters {
    pub created: AtomicUsize,
    pub resumed: AtomicUsize,
    pub cancelled: AtomicUsize,
    pub running: AtomicUsize,
    pub max_running: AtomicUsize,
}

pub struct MockTransport {
    behavior: Behavior,
    temp_dir: PathBuf,
    runtime: Handle,
    pub counters: Arc<Counters>,
    operations: Mutex<Vec<Arc<MockOperation>>>,
    resumed_order: Arc<Mutex<Vec<TaskId>>>,
}

impl MockTransport {
    pub fn new(behavior: Behavior, temp_dir: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            temp_dir: temp_dir.into(),
            runtime: Handle::current(),
            counters: Arc::new(Counters::default()),
            operations: Mutex::new(Vec::new()),
            resumed_order: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn operation(&self, task_id: TaskId) -> Option<Arc<MockOperation>> {
        self.operations
            .lock()
            .iter()
            .find(|op| op.events.task_id() == task_id)
            .cloned()
    }

    /// Task ids in the order their transfers were resumed
    pub fn resumed_order(&self) -> Vec<TaskId> {
        self.resumed_order.lock().clone()
    }

    pub fn resumed(&self) -> usize {
        self.counters.resumed.load(Ordering::SeqCst)
    }

    pub fn cancelled(&self) -> usize {
        self.counters.cancelled.load(Ordering::SeqCst)
    }

    pub fn running(&self) -> usize {
        self.counters.running.load(Ordering::SeqCst)
    }

    pub fn max_running(&self) -> usize {
        self.counters.max_running.load(Ordering::SeqCst)
    }
}

impl Transport for MockTransport {
    fn create_operation(&self, _source: &Url, events: TransportEvents) -> Arc<dyn TransferOperation> {
        self.counters.created.fetch_add(1, Ordering::SeqCst);
        let op = Arc::new_cyclic(|me| MockOperation {
            me: me.clone(),
            temp_path: self.temp_dir.join(format!("{}.part", events.task_id().0)),
            events,
            behavior: self.behavior,
            runtime: self.runtime.clone(),
            counters: self.counters.clone(),
            resumed_order: self.resumed_order.clone(),
            running: AtomicBool::new(false),
        });
        self.operations.lock().push(op.clone());
        op
    }
}

pub struct MockOperation {
    me: Weak<MockOperation>,
    pub events: TransportEvents,
    pub temp_path: PathBuf,
    behavior: Behavior,
    runtime: Handle,
    counters: Arc<Counters>,
    resumed_order: Arc<Mutex<Vec<TaskId>>>,
    running: AtomicBool,
}

impl MockOperation {
    /// Write `contents` to the temp file and report completion
    pub fn complete(&self, contents: &[u8]) {
        if let Some(parent) = self.temp_path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&self.temp_path, contents).unwrap();
        self.stop();
        self.events.progress(contents.len() as u64, Some(contents.len() as u64));
        self.events.temporary_complete(self.temp_path.clone());
    }

    /// Report completion at a location where nothing was written
    pub fn complete_missing(&self) {
        self.stop();
        self.events.temporary_complete(self.temp_path.with_extension("missing"));
    }

    pub fn fail(&self, error: TransportError) {
        self.stop();
        self.events.failed(error);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            self.counters.running.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl TransferOperation for MockOperation {
    fn resume(&self) {
        self.counters.resumed.fetch_add(1, Ordering::SeqCst);
        self.resumed_order.lock().push(self.events.task_id());
        if !self.running.swap(true, Ordering::SeqCst) {
            let now = self.counters.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.counters.max_running.fetch_max(now, Ordering::SeqCst);
        }

        let Some(op) = self.me.upgrade() else {
            return;
        };
        match self.behavior {
            Behavior::Manual => {}
            Behavior::Complete { delay } => {
                self.runtime.spawn(async move {
                    tokio::time::sleep(delay).await;
                    let body = format!("payload {}", op.events.task_id());
                    op.complete(body.as_bytes());
                });
            }
            Behavior::Fail { delay } => {
                self.runtime.spawn(async move {
                    tokio::time::sleep(delay).await;
                    op.fail(TransportError::Network("connection reset".to_string()));
                });
            }
        }
    }

    fn cancel(&self) {
        self.counters.cancelled.fetch_add(1, Ordering::SeqCst);
        self.stop();
    }
}

/// One observer notification
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Progress(String),
    Finished(String, DownloadedFile),
    Error(String, String),
}

/// Observer that writes every notification into a shared log
#[derive(Default)]
pub struct Recorder {
    records: Arc<Mutex<Vec<Record>>>,
}

impl Recorder {
    pub fn callbacks(&self) -> ObserverCallbacks {
        let progress = self.records.clone();
        let finished = self.records.clone();
        let failed = self.records.clone();
        ObserverCallbacks::new()
            .on_progress(move |request: &DownloadRequest, _| {
                progress.lock().push(Record::Progress(request.id.clone()));
            })
            .on_finished(move |request, _, file| {
                finished
                    .lock()
                    .push(Record::Finished(request.id.clone(), file.clone()));
            })
            .on_error(move |request, _, error: &QueueError| {
                failed
                    .lock()
                    .push(Record::Error(request.id.clone(), error.to_string()));
            })
    }

    pub fn records(&self) -> Vec<Record> {
        self.records.lock().clone()
    }

    pub fn finished(&self) -> Vec<(String, DownloadedFile)> {
        self.records()
            .into_iter()
            .filter_map(|record| match record {
                Record::Finished(id, file) => Some((id, file)),
                _ => None,
            })
            .collect()
    }

    pub fn errors(&self) -> Vec<(String, String)> {
        self.records()
            .into_iter()
            .filter_map(|record| match record {
                Record::Error(id, error) => Some((id, error)),
                _ => None,
            })
            .collect()
    }
}

/// Route library logs to the test output; `RUST_LOG` filters them
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn request(id: &str, name: &str) -> DownloadRequest {
    DownloadRequest::new(id, Url::parse(&format!("https://example.com/{}", name)).ok(), name)
}

/// Poll `condition` until it holds, failing the test after ~5s
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}
