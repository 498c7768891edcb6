//! Download Engine - queue, workers and transports
//!
//! This module implements the download queue with:
//! - Bounded serial or parallel execution
//! - Submission-order admission
//! - Exactly-once completion per item
//! - A pluggable transport seam with an HTTP implementation

mod http;
mod item;
mod manager;
mod pool;
mod transport;

pub use http::*;
pub use item::*;
pub use manager::*;
pub use pool::*;
pub use transport::*;
