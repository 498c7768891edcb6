//! HTTP transport backed by reqwest
//!
//! Each operation streams the response body into a uniquely named `.part`
//! file under the transport's temp directory. The queue moves that file
//! into place once the operation reports it complete.

use crate::engine::transport::{TransferOperation, Transport, TransportEvents};
use crate::error::{QueueError, TransportError};
use futures::StreamExt;
use reqwest::Client;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

const PROGRESS_INTERVAL: Duration = Duration::from_millis(300);

pub struct HttpTransport {
    client: Client,
    temp_dir: PathBuf,
    runtime: Handle,
}

impl HttpTransport {
    /// Create a transport on the current tokio runtime
    pub fn new(temp_dir: impl Into<PathBuf>) -> Result<Self, QueueError> {
        let runtime = Handle::try_current().map_err(|e| QueueError::Runtime(e.to_string()))?;
        let client = Client::builder()
            .user_agent(concat!("dlqueue/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(TransportError::from)?;

        Ok(Self::with_client(client, temp_dir, runtime))
    }

    pub fn with_client(client: Client, temp_dir: impl Into<PathBuf>, runtime: Handle) -> Self {
        Self {
            client,
            temp_dir: temp_dir.into(),
            runtime,
        }
    }

    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }
}

impl Transport for HttpTransport {
    fn create_operation(&self, source: &Url, events: TransportEvents) -> Arc<dyn TransferOperation> {
        Arc::new(HttpOperation {
            client: self.client.clone(),
            url: source.clone(),
            temp_path: self.temp_dir.join(format!("{}.part", Uuid::new_v4())),
            events,
            cancel: CancellationToken::new(),
            started: AtomicBool::new(false),
            runtime: self.runtime.clone(),
        })
    }
}

struct HttpOperation {
    client: Client,
    url: Url,
    temp_path: PathBuf,
    events: TransportEvents,
    cancel: CancellationToken,
    started: AtomicBool,
    runtime: Handle,
}

impl TransferOperation for HttpOperation {
    fn resume(&self) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }

        let client = self.client.clone();
        let url = self.url.clone();
        let temp_path = self.temp_path.clone();
        let events = self.events.clone();
        let cancel = self.cancel.clone();

        self.runtime.spawn(async move {
            info!("Starting download {}: {}", events.task_id(), url);
            let result = tokio::select! {
                _ = cancel.cancelled() => Err(TransportError::Cancelled),
                result = fetch(&client, &url, &temp_path, &events) => result,
            };

            match result {
                Ok(()) => events.temporary_complete(temp_path),
                Err(e) => {
                    if let Err(remove) = tokio::fs::remove_file(&temp_path).await {
                        if remove.kind() != std::io::ErrorKind::NotFound {
                            warn!("Could not remove {:?}: {}", temp_path, remove);
                        }
                    }
                    debug!("Download {} stopped: {}", events.task_id(), e);
                    events.failed(e);
                }
            }
        });
    }

    fn cancel(&self) {
        self.cancel.cancel();
    }
}

async fn fetch(
    client: &Client,
    url: &Url,
    temp_path: &Path,
    events: &TransportEvents,
) -> Result<(), TransportError> {
    if let Some(parent) = temp_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let response = client.get(url.as_str()).send().await?.error_for_status()?;
    let total = response.content_length();
    let mut file = tokio::fs::File::create(temp_path).await?;
    events.progress(0, total);

    let mut stream = response.bytes_stream();
    let mut written = 0u64;
    let mut last_emit = tokio::time::Instant::now();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;

        // Throttled; the final count is always sent below
        if last_emit.elapsed() >= PROGRESS_INTERVAL {
            events.progress(written, total);
            last_emit = tokio::time::Instant::now();
        }
    }

    file.flush().await?;
    file.sync_all().await?;
    events.progress(written, total);

    info!("Download {} received {} bytes", events.task_id(), written);
    Ok(())
}
