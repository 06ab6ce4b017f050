//! Drive events and subscriber registry
//!
//! Observers subscribe per channel. Each channel holds at most one
//! subscriber: registering again replaces the previous one.

use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::download::{TaskInfo, TaskProgress};
use crate::error::DriveError;
use crate::node::NodeRef;

/// Notification emitted by the drive manager
#[derive(Debug, Clone)]
pub enum DriveEvent {
    /// Current directory changed; `current` is `None` at root
    DirectoryChanged { current: Option<NodeRef>, is_root: bool },
    /// A task was added to the registry
    TaskBegun(TaskInfo),
    /// The task's transfer was started
    TaskStarted(TaskInfo),
    TaskProgress { task: TaskInfo, progress: TaskProgress },
    TaskComplete(TaskInfo),
    TaskError { task: TaskInfo, error: DriveError },
    TaskCancelled(TaskInfo),
    /// The task left the registry; `index` is the position it held
    TaskEnded { task: TaskInfo, index: usize },
}

/// Subscription channel of an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventChannel {
    Directory,
    Task,
}

impl DriveEvent {
    pub fn channel(&self) -> EventChannel {
        match self {
            DriveEvent::DirectoryChanged { .. } => EventChannel::Directory,
            _ => EventChannel::Task,
        }
    }
}

/// One subscriber per channel
#[derive(Debug, Default)]
pub struct Subscribers {
    senders: HashMap<EventChannel, mpsc::UnboundedSender<DriveEvent>>,
}

impl Subscribers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber for `channel`, replacing any previous one
    pub fn subscribe(&mut self, channel: EventChannel) -> mpsc::UnboundedReceiver<DriveEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        if self.senders.insert(channel, tx).is_some() {
            debug!("Replaced {:?} subscriber", channel);
        }
        rx
    }

    pub fn unsubscribe(&mut self, channel: EventChannel) {
        self.senders.remove(&channel);
    }

    pub fn is_subscribed(&self, channel: EventChannel) -> bool {
        self.senders.contains_key(&channel)
    }

    /// Deliver to the channel's subscriber. A closed receiver is pruned.
    pub fn emit(&mut self, event: DriveEvent) {
        let channel = event.channel();
        if let Some(tx) = self.senders.get(&channel) {
            if tx.send(event).is_err() {
                warn!("{:?} subscriber went away, dropping it", channel);
                self.senders.remove(&channel);
            }
        }
    }
}
