//! Download tasks
//!
//! - `types`: identity, status, progress and cleanup selection
//! - `task`: the per-download state machine
//! - `transfer`: the byte-moving side and its reporting channel

pub mod task;
pub mod transfer;
pub mod types;

pub use task::{DownloadTask, TaskTransition};
pub use transfer::{ByteSource, SourceOpener, StreamTransfer, Transfer, TransferEvent, TransferMessage, TransferSink};
pub use types::{CleanupMask, TaskId, TaskInfo, TaskProgress, TaskStatus};
