//! Download task value types

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::ops::BitOr;
use std::path::PathBuf;
use uuid::Uuid;

use crate::providers::DriveType;

/// Process-unique identity of a download task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Download task status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Queued, transfer not yet reporting
    BeginDownload,
    Downloading,
    Complete,
    Cancel,
    Error,
}

impl TaskStatus {
    /// Complete, Cancel and Error never transition again
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Complete | TaskStatus::Cancel | TaskStatus::Error)
    }

    /// BeginDownload or Downloading
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStatus::BeginDownload => write!(f, "Waiting"),
            TaskStatus::Downloading => write!(f, "Downloading"),
            TaskStatus::Complete => write!(f, "Download complete"),
            TaskStatus::Cancel => write!(f, "Download cancel"),
            TaskStatus::Error => write!(f, "Download error"),
        }
    }
}

/// Progress of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskProgress {
    /// Fraction in [0, 1]
    Fraction(f32),
    /// Total length unknown
    Indeterminate,
}

impl TaskProgress {
    /// Sentinel used by `as_raw` for unknown progress
    pub const UNKNOWN: f32 = -1.0;

    /// Negative values mean the length is unknown
    pub fn from_raw(value: f32) -> Self {
        if value < 0.0 || value.is_nan() {
            TaskProgress::Indeterminate
        } else {
            TaskProgress::Fraction(value.min(1.0))
        }
    }

    pub fn from_bytes(done: u64, total: Option<u64>) -> Self {
        match total {
            Some(total) if total > 0 => TaskProgress::Fraction((done as f64 / total as f64).min(1.0) as f32),
            Some(_) => TaskProgress::Fraction(1.0),
            None => TaskProgress::Indeterminate,
        }
    }

    pub fn as_raw(&self) -> f32 {
        match self {
            TaskProgress::Fraction(f) => *f,
            TaskProgress::Indeterminate => Self::UNKNOWN,
        }
    }

    pub fn is_indeterminate(&self) -> bool {
        matches!(self, TaskProgress::Indeterminate)
    }
}

impl Default for TaskProgress {
    fn default() -> Self {
        TaskProgress::Fraction(0.0)
    }
}

impl fmt::Display for TaskProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskProgress::Fraction(v) => write!(f, "{}%", (v * 100.0).round() as u32),
            TaskProgress::Indeterminate => write!(f, "Unknown progress"),
        }
    }
}

/// Snapshot of a download task, carried by events and returned to callers
#[derive(Debug, Clone, Serialize)]
pub struct TaskInfo {
    pub id: TaskId,
    pub file_id: String,
    pub drive_type: DriveType,
    /// Path of the file on the drive
    pub cloud_path: String,
    /// Where the downloaded file is written
    pub local_path: PathBuf,
    pub file_name: String,
    pub progress: TaskProgress,
    pub overwrite_existing: bool,
    pub status: TaskStatus,
    /// Failure message when `status` is `Error`
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Selects which terminal tasks a cleanup removes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleanupMask(u8);

impl CleanupMask {
    pub const COMPLETE: CleanupMask = CleanupMask(0b001);
    pub const CANCEL: CleanupMask = CleanupMask(0b010);
    pub const ERROR: CleanupMask = CleanupMask(0b100);
    pub const ALL: CleanupMask = CleanupMask(0b111);

    pub fn matches(&self, status: TaskStatus) -> bool {
        let bit = match status {
            TaskStatus::Complete => Self::COMPLETE.0,
            TaskStatus::Cancel => Self::CANCEL.0,
            TaskStatus::Error => Self::ERROR.0,
            TaskStatus::BeginDownload | TaskStatus::Downloading => return false,
        };
        self.0 & bit != 0
    }
}

impl Default for CleanupMask {
    fn default() -> Self {
        Self::ALL
    }
}

impl BitOr for CleanupMask {
    type Output = CleanupMask;

    fn bitor(self, rhs: Self) -> Self::Output {
        CleanupMask(self.0 | rhs.0)
    }
}
