//! dlqueue Core - Download Queue Engine
//!
//! This crate runs a queue of file downloads on a bounded worker pool.
//! It deduplicates requests, moves finished transfers into a downloads
//! directory and reports progress to registered observers.

mod error;
mod naming;
mod observers;
mod registry;
mod storage;

pub mod engine;

pub use engine::{
    DownloadItem, Enqueued, HttpTransport, ItemOutcome, QueueManager, TransferHandle,
    TransferOperation, Transport, TransportEvent, TransportEventKind, TransportEvents, WorkerPool,
};
pub use error::*;
pub use naming::*;
pub use observers::*;
pub use registry::*;
pub use storage::*;

pub use dlqueue_types;
