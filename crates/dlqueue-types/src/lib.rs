//! Shared types for dlqueue
//!
//! This crate contains the plain data structures used by the queue engine
//! and by anything that consumes its events.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use url::Url;

// ============================================================================
// Request Types
// ============================================================================

/// How the destination file name is chosen when a request is enqueued
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadMode {
    /// Always download, appending `(n)` to the name if the file exists
    AlwaysCreate,
    /// Reuse an already downloaded file with the same name
    #[default]
    ReuseIfExists,
}

/// A request to download one resource into the downloads directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadRequest {
    /// Caller-chosen identifier, not required to be unique
    pub id: String,
    /// Where the bytes come from
    pub source: Option<Url>,
    /// Preferred file name (may gain a suffix under `AlwaysCreate`)
    pub destination_name: String,
    pub mode: DownloadMode,
    /// Attributes applied to the file after it has been moved into place
    #[serde(default)]
    pub attributes: Option<BTreeMap<String, String>>,
}

impl DownloadRequest {
    pub fn new(
        id: impl Into<String>,
        source: Option<Url>,
        destination_name: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            source,
            destination_name: destination_name.into(),
            mode: DownloadMode::default(),
            attributes: None,
        }
    }

    pub fn with_mode(mut self, mode: DownloadMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_attributes(mut self, attributes: BTreeMap<String, String>) -> Self {
        self.attributes = Some(attributes);
        self
    }
}

// ============================================================================
// Item Types
// ============================================================================

/// Identifier the queue assigns to every transport operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Lifecycle of a queued download
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemState {
    Created,
    Scheduled,
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl ItemState {
    /// Terminal states are absorbing
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ItemState::Completed | ItemState::Cancelled | ItemState::Failed
        )
    }

    /// Whether moving from `self` to `next` is a legal lifecycle step
    pub fn can_transition_to(&self, next: ItemState) -> bool {
        match (self, next) {
            (ItemState::Created, ItemState::Scheduled) => true,
            (ItemState::Scheduled, ItemState::Running) => true,
            (ItemState::Running, ItemState::Completed) => true,
            (current, ItemState::Cancelled | ItemState::Failed) => !current.is_terminal(),
            _ => false,
        }
    }
}

/// Bytes received so far for one transfer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferProgress {
    pub written: u64,
    pub total: Option<u64>,
}

impl TransferProgress {
    /// Percentage complete, or 0 when the total is unknown
    pub fn percent(&self) -> f64 {
        match self.total {
            Some(total) if total > 0 => (self.written as f64 / total as f64) * 100.0,
            _ => 0.0,
        }
    }
}

// ============================================================================
// File Types
// ============================================================================

/// A downloaded file, stored relative to the queue's root directory
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DownloadedFile {
    relative_path: PathBuf,
}

impl DownloadedFile {
    pub fn new(relative_path: impl Into<PathBuf>) -> Self {
        Self {
            relative_path: relative_path.into(),
        }
    }

    /// Build from an absolute path. Returns `None` if `path` is not under `root`.
    pub fn from_absolute(path: &Path, root: &Path) -> Option<Self> {
        path.strip_prefix(root).ok().map(|relative| Self {
            relative_path: relative.to_path_buf(),
        })
    }

    pub fn relative_path(&self) -> &Path {
        &self.relative_path
    }

    /// Resolve against `root`; nothing is cached
    pub fn absolute_path(&self, root: &Path) -> PathBuf {
        root.join(&self.relative_path)
    }
}

// ============================================================================
// Configuration Types
// ============================================================================

/// Serial or bounded-parallel execution of downloads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConcurrencyMode {
    Serial,
    Parallel { max: u32 },
}

impl ConcurrencyMode {
    /// Number of downloads allowed to transfer at once (never below 1)
    pub fn limit(&self) -> usize {
        match self {
            ConcurrencyMode::Serial => 1,
            ConcurrencyMode::Parallel { max } => (*max as usize).max(1),
        }
    }
}

impl Default for ConcurrencyMode {
    fn default() -> Self {
        ConcurrencyMode::Parallel { max: 25 }
    }
}

/// Queue configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    pub mode: ConcurrencyMode,
    /// Root that every `DownloadedFile` is relative to
    pub root_dir: PathBuf,
    /// Name of the downloads directory inside `root_dir`
    pub base_directory_name: String,
    /// Capacity of the broadcast event channel
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_event_capacity() -> usize {
    1000
}

impl QueueConfig {
    pub fn new(mode: ConcurrencyMode, root_dir: impl Into<PathBuf>) -> Self {
        Self {
            mode,
            root_dir: root_dir.into(),
            ..Self::default()
        }
    }

    /// `root_dir/base_directory_name`
    pub fn downloads_dir(&self) -> PathBuf {
        self.root_dir.join(&self.base_directory_name)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            mode: ConcurrencyMode::default(),
            root_dir: dirs::document_dir().unwrap_or_else(|| PathBuf::from(".")),
            base_directory_name: "Downloads".to_string(),
            event_capacity: default_event_capacity(),
        }
    }
}

// ============================================================================
// Event Types
// ============================================================================

/// Events published by the queue to subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum QueueEvent {
    Queued {
        id: String,
        task_id: TaskId,
    },
    Progress {
        id: String,
        task_id: TaskId,
        progress: TransferProgress,
    },
    Finished {
        id: String,
        task_id: TaskId,
        file: DownloadedFile,
    },
    Failed {
        id: String,
        task_id: TaskId,
        error: String,
    },
    Cancelled {
        id: String,
        task_id: TaskId,
    },
    /// The queue ran empty; carries the last recorded error, if any
    Drained {
        last_error: Option<String>,
    },
}
