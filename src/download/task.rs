//! Download task state machine

use chrono::Utc;
use std::path::PathBuf;
use tracing::debug;

use super::transfer::{Transfer, TransferEvent, TransferSink};
use super::types::{TaskId, TaskInfo, TaskProgress, TaskStatus};
use crate::providers::DriveType;

/// Status change produced by applying a transfer event
#[derive(Debug, Clone, PartialEq)]
pub enum TaskTransition {
    Progress(TaskProgress),
    Completed,
    Failed(String),
}

/// One download: its public snapshot plus the transfer moving its bytes
pub struct DownloadTask {
    info: TaskInfo,
    transfer: Option<Box<dyn Transfer>>,
}

impl DownloadTask {
    pub fn new(
        file_id: impl Into<String>,
        drive_type: DriveType,
        cloud_path: impl Into<String>,
        local_path: impl Into<PathBuf>,
        file_name: impl Into<String>,
        transfer: Box<dyn Transfer>,
    ) -> Self {
        Self {
            info: TaskInfo {
                id: TaskId::new(),
                file_id: file_id.into(),
                drive_type,
                cloud_path: cloud_path.into(),
                local_path: local_path.into(),
                file_name: file_name.into(),
                progress: TaskProgress::default(),
                overwrite_existing: false,
                status: TaskStatus::BeginDownload,
                error: None,
                created_at: Utc::now(),
            },
            transfer: Some(transfer),
        }
    }

    pub fn id(&self) -> TaskId {
        self.info.id
    }

    pub fn info(&self) -> &TaskInfo {
        &self.info
    }

    pub fn status(&self) -> TaskStatus {
        self.info.status
    }

    pub fn drive_type(&self) -> DriveType {
        self.info.drive_type
    }

    pub fn file_id(&self) -> &str {
        &self.info.file_id
    }

    pub fn set_overwrite_existing(&mut self, overwrite: bool) {
        self.info.overwrite_existing = overwrite;
    }

    /// Hand the sink to the transfer. Only a fresh task starts.
    pub fn start(&mut self, sink: TransferSink) {
        if self.info.status != TaskStatus::BeginDownload {
            return;
        }
        if let Some(transfer) = self.transfer.as_mut() {
            transfer.start(sink);
        }
    }

    /// Move to Cancel and stop the transfer. Returns false for terminal tasks.
    pub fn cancel(&mut self) -> bool {
        if self.info.status.is_terminal() {
            return false;
        }
        self.info.status = TaskStatus::Cancel;
        self.sever();
        true
    }

    /// Apply a transfer report. Reports for terminal tasks are dropped.
    pub fn apply(&mut self, event: TransferEvent) -> Option<TaskTransition> {
        if self.info.status.is_terminal() {
            debug!("Ignoring {:?} for finished task {}", event, self.info.id);
            return None;
        }
        match event {
            TransferEvent::Progress(progress) => {
                self.info.status = TaskStatus::Downloading;
                self.info.progress = progress;
                Some(TaskTransition::Progress(progress))
            }
            TransferEvent::Complete => {
                self.info.status = TaskStatus::Complete;
                self.info.progress = TaskProgress::Fraction(1.0);
                self.transfer = None;
                Some(TaskTransition::Completed)
            }
            TransferEvent::Failed(message) => {
                self.info.status = TaskStatus::Error;
                self.info.error = Some(message.clone());
                self.transfer = None;
                Some(TaskTransition::Failed(message))
            }
        }
    }

    /// Detach the transfer, cancelling it if still attached
    pub fn sever(&mut self) {
        if let Some(mut transfer) = self.transfer.take() {
            transfer.cancel();
        }
    }
}

impl Drop for DownloadTask {
    fn drop(&mut self) {
        self.sever();
    }
}
