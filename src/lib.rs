// CloudDrive - browse and download files across interchangeable cloud drives
// One active backend, a breadcrumb of the current folder and a download registry

pub mod config;
pub mod download;
pub mod error;
pub mod events;
pub mod manager;
pub mod node;
pub mod providers;

#[cfg(test)]
mod testing;

pub use config::DriveConfig;
pub use download::{CleanupMask, TaskId, TaskInfo, TaskProgress, TaskStatus};
pub use error::DriveError;
pub use events::{DriveEvent, EventChannel};
pub use manager::{DriveManager, Listing, ListingReply};
pub use node::{MetadataNode, NodeRef};
pub use providers::{AuthPresenter, AuthState, BrowserPresenter, DriveBackend, DriveType, ProviderError};
