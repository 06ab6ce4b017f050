//! Transfer engine
//!
//! A `Transfer` moves the bytes of one download. It never touches the task
//! registry directly: every progress, completion or failure report goes
//! through a `TransferSink` into the manager's inbox, so all state changes
//! happen in one place, in order.

use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::types::{TaskId, TaskProgress};
use crate::providers::ProviderError;

/// What a running transfer reports back
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    Progress(TaskProgress),
    Complete,
    Failed(String),
}

/// A transfer report addressed to one task
#[derive(Debug, Clone, PartialEq)]
pub struct TransferMessage {
    pub task_id: TaskId,
    pub event: TransferEvent,
}

/// Reporting handle given to a transfer when it starts
#[derive(Debug, Clone)]
pub struct TransferSink {
    task_id: TaskId,
    tx: mpsc::UnboundedSender<TransferMessage>,
}

impl TransferSink {
    pub fn new(task_id: TaskId, tx: mpsc::UnboundedSender<TransferMessage>) -> Self {
        Self { task_id, tx }
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Report bytes written so far; `total` is `None` when the length is unknown
    pub fn progress(&self, done: u64, total: Option<u64>) {
        self.send(TransferEvent::Progress(TaskProgress::from_bytes(done, total)));
    }

    pub fn complete(&self) {
        self.send(TransferEvent::Complete);
    }

    pub fn fail(&self, message: impl Into<String>) {
        self.send(TransferEvent::Failed(message.into()));
    }

    fn send(&self, event: TransferEvent) {
        // Receiver gone means the manager shut down; nothing left to inform.
        let _ = self.tx.send(TransferMessage {
            task_id: self.task_id,
            event,
        });
    }
}

/// A backend-specific byte mover
pub trait Transfer: Send {
    /// Begin moving bytes. Reports flow through `sink` until a terminal report.
    fn start(&mut self, sink: TransferSink);

    /// Stop moving bytes. A cancelled transfer reports nothing further.
    fn cancel(&mut self);
}

/// Body of a download: an optional length plus a chunk stream
pub struct ByteSource {
    pub total: Option<u64>,
    pub stream: BoxStream<'static, Result<Bytes, ProviderError>>,
}

/// Deferred request that yields the download body
pub type SourceOpener = Box<dyn FnOnce() -> BoxFuture<'static, Result<ByteSource, ProviderError>> + Send>;

/// Streams a `ByteSource` into a local file on a tokio task
pub struct StreamTransfer {
    opener: Option<SourceOpener>,
    destination: PathBuf,
    overwrite: bool,
    token: CancellationToken,
}

impl StreamTransfer {
    pub fn new(opener: SourceOpener, destination: impl Into<PathBuf>, overwrite: bool) -> Self {
        Self {
            opener: Some(opener),
            destination: destination.into(),
            overwrite,
            token: CancellationToken::new(),
        }
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }
}

impl Transfer for StreamTransfer {
    fn start(&mut self, sink: TransferSink) {
        let Some(opener) = self.opener.take() else {
            warn!("Transfer for {:?} already started", self.destination);
            return;
        };
        let destination = self.destination.clone();
        let overwrite = self.overwrite;
        let token = self.token.clone();

        tokio::spawn(async move {
            let created = Arc::new(AtomicBool::new(false));
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    if created.load(Ordering::SeqCst) {
                        let _ = fs::remove_file(&destination).await;
                    }
                    debug!("Transfer to {:?} cancelled", destination);
                }
                result = write_to_file(opener, &destination, overwrite, &sink, created.clone()) => {
                    match result {
                        Ok(()) => sink.complete(),
                        Err(e) => {
                            if created.load(Ordering::SeqCst) {
                                let _ = fs::remove_file(&destination).await;
                            }
                            sink.fail(e.to_string());
                        }
                    }
                }
            }
        });
    }

    fn cancel(&mut self) {
        self.token.cancel();
    }
}

async fn write_to_file(
    opener: SourceOpener,
    destination: &Path,
    overwrite: bool,
    sink: &TransferSink,
    created: Arc<AtomicBool>,
) -> Result<(), ProviderError> {
    if !overwrite && fs::try_exists(destination).await? {
        return Err(ProviderError::TransferFailed(format!(
            "File already exists: {}",
            destination.display()
        )));
    }
    if let Some(parent) = destination.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }

    let ByteSource { total, mut stream } = opener().await?;
    let mut file = fs::File::create(destination).await?;
    created.store(true, Ordering::SeqCst);

    let mut done: u64 = 0;
    sink.progress(done, total);
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        done += chunk.len() as u64;
        sink.progress(done, total);
    }
    file.flush().await?;
    Ok(())
}
