//! Drive Manager - single-backend drive orchestration
//!
//! The manager holds the active drive backend, the current position in the
//! drive (as a breadcrumb chain of metadata nodes) and the registry of
//! download tasks. Listing results and transfer reports arrive as messages in
//! the manager's inbox and are applied one at a time by `process_next` /
//! `process_pending`, so every change to navigation or task state happens on
//! the caller's control flow, in arrival order.

use std::path::Path;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::DriveConfig;
use crate::download::{
    CleanupMask, DownloadTask, TaskId, TaskInfo, TaskStatus, TaskTransition, TransferMessage,
    TransferSink,
};
use crate::error::DriveError;
use crate::events::{DriveEvent, EventChannel, Subscribers};
use crate::node::{apply_navigation, NodeRef};
use crate::providers::{
    AuthPresenter, AuthState, BackendFactory, DefaultBackendFactory, DriveBackend, DriveType,
    ProviderError,
};

/// Children of a listed folder
#[derive(Debug, Clone)]
pub struct Listing {
    /// The listed folder, `None` for the drive root
    pub target: Option<NodeRef>,
    pub children: Vec<NodeRef>,
}

/// Pending answer to a `list` call
#[derive(Debug)]
pub struct ListingReply {
    rx: oneshot::Receiver<Result<Listing, DriveError>>,
}

impl ListingReply {
    fn ready(result: Result<Listing, DriveError>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        Self { rx }
    }

    /// Take the answer if the manager has already applied it
    pub fn try_take(&mut self) -> Option<Result<Listing, DriveError>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(abandoned())),
        }
    }

    /// Wait for the answer. Someone must keep driving the manager's inbox.
    pub async fn wait(self) -> Result<Listing, DriveError> {
        self.rx.await.unwrap_or_else(|_| Err(abandoned()))
    }
}

fn abandoned() -> DriveError {
    DriveError::Internal("Listing was abandoned".to_string())
}

/// A finished backend listing waiting to be applied
struct ListingDone {
    generation: u64,
    target: Option<NodeRef>,
    result: Result<Vec<NodeRef>, ProviderError>,
    reply: oneshot::Sender<Result<Listing, DriveError>>,
}

enum Inbound {
    Listing(ListingDone),
    Transfer(TransferMessage),
}

/// Drive orchestrator
pub struct DriveManager {
    factory: Box<dyn BackendFactory>,
    backend: Option<Arc<dyn DriveBackend>>,
    /// `None` means at root
    current: Option<NodeRef>,
    is_querying: bool,
    /// Bumped whenever the backend changes; older listings are not applied
    generation: u64,
    /// Newest first
    tasks: Vec<DownloadTask>,
    auto_clean: bool,
    subscribers: Subscribers,
    listing_tx: mpsc::UnboundedSender<ListingDone>,
    listing_rx: mpsc::UnboundedReceiver<ListingDone>,
    transfer_tx: mpsc::UnboundedSender<TransferMessage>,
    transfer_rx: mpsc::UnboundedReceiver<TransferMessage>,
}

impl DriveManager {
    /// Manager building backends from `config`
    pub fn new(config: DriveConfig) -> Self {
        let auto_clean = config.auto_clean;
        Self::with_factory(Box::new(DefaultBackendFactory::new(config)), auto_clean)
    }

    pub fn with_factory(factory: Box<dyn BackendFactory>, auto_clean: bool) -> Self {
        let (listing_tx, listing_rx) = mpsc::unbounded_channel();
        let (transfer_tx, transfer_rx) = mpsc::unbounded_channel();
        Self {
            factory,
            backend: None,
            current: None,
            is_querying: false,
            generation: 0,
            tasks: Vec::new(),
            auto_clean,
            subscribers: Subscribers::new(),
            listing_tx,
            listing_rx,
            transfer_tx,
            transfer_rx,
        }
    }

    // ============ Subscribers ============

    /// Register the single subscriber of `channel`, replacing any previous one
    pub fn subscribe(&mut self, channel: EventChannel) -> mpsc::UnboundedReceiver<DriveEvent> {
        self.subscribers.subscribe(channel)
    }

    pub fn unsubscribe(&mut self, channel: EventChannel) {
        self.subscribers.unsubscribe(channel);
    }

    // ============ Backend ============

    /// Select the active drive. `None` logs out of the current one.
    pub fn set_backend(&mut self, drive_type: Option<DriveType>) -> Result<(), DriveError> {
        let Some(drive_type) = drive_type else {
            if self.backend.is_some() {
                self.logout();
            }
            return Ok(());
        };

        if self.drive_type() == Some(drive_type) {
            debug!("{} already active", drive_type);
            return Ok(());
        }

        let backend = self.factory.create(drive_type)?;
        info!("Switched drive to {}", drive_type);
        self.backend = Some(backend);
        self.reset_navigation();
        Ok(())
    }

    pub fn backend(&self) -> Option<Arc<dyn DriveBackend>> {
        self.backend.clone()
    }

    pub fn drive_type(&self) -> Option<DriveType> {
        self.backend.as_ref().map(|b| b.drive_type())
    }

    /// Identity string of the active drive, empty when none
    pub fn drive_type_string(&self) -> &'static str {
        self.backend.as_ref().map(|b| b.drive_type_string()).unwrap_or("")
    }

    pub async fn authorize(&self, presenter: &dyn AuthPresenter) -> Result<AuthState, DriveError> {
        let backend = self.backend.clone().ok_or(DriveError::BackendNotSet)?;
        let state = backend.authorize(presenter).await;
        match &state {
            AuthState::Success => info!("Authorized with {}", backend.drive_type()),
            AuthState::Cancel => info!("Authorization with {} cancelled", backend.drive_type()),
            AuthState::Error(e) => warn!("Authorization with {} failed: {}", backend.drive_type(), e),
        }
        Ok(state)
    }

    /// Forward an authorization redirect to the active backend
    pub fn handle_redirect(&self, url: &Url) -> bool {
        self.backend
            .as_ref()
            .map(|b| b.handle_redirect(url))
            .unwrap_or(false)
    }

    // ============ Navigation ============

    pub fn current(&self) -> Option<NodeRef> {
        self.current.clone()
    }

    pub fn is_root(&self) -> bool {
        self.current.is_none()
    }

    pub fn is_querying(&self) -> bool {
        self.is_querying
    }

    /// Folders from the top of the drive down to the current one
    pub fn breadcrumbs(&self) -> Vec<NodeRef> {
        self.current.as_ref().map(|c| c.breadcrumbs()).unwrap_or_default()
    }

    /// Request the children of `target` (`None` = root).
    ///
    /// Returns `None` when another listing is still in flight; the request is
    /// dropped, not queued. On success the current position moves to `target`.
    pub fn list(&mut self, target: Option<NodeRef>) -> Option<ListingReply> {
        if self.is_querying {
            debug!("Listing already in flight, dropping request");
            return None;
        }
        let Some(backend) = self.backend.clone() else {
            return Some(ListingReply::ready(Err(DriveError::BackendNotSet)));
        };
        if target.as_ref().is_some_and(|t| !t.is_folder) {
            return Some(ListingReply::ready(Err(DriveError::Internal(
                "Can not list contents of a file".to_string(),
            ))));
        }

        self.is_querying = true;
        let (reply, rx) = oneshot::channel();
        let generation = self.generation;
        let inbox = self.listing_tx.clone();

        tokio::spawn(async move {
            let result = backend.list_children(target.as_ref()).await;
            let _ = inbox.send(ListingDone {
                generation,
                target,
                result,
                reply,
            });
        });

        Some(ListingReply { rx })
    }

    /// `list` and drive the inbox until its answer is applied
    pub async fn navigate(&mut self, target: Option<NodeRef>) -> Option<Result<Listing, DriveError>> {
        let mut reply = self.list(target)?;
        loop {
            if let Some(result) = reply.try_take() {
                return Some(result);
            }
            if !self.process_next().await {
                return Some(Err(abandoned()));
            }
        }
    }

    /// List the parent of the current folder. No-op at root.
    pub fn go_to_parent(&mut self) -> Option<ListingReply> {
        let current = self.current.as_ref()?;
        let parent = current.previous();
        self.list(parent)
    }

    fn finish_listing(&mut self, done: ListingDone) {
        let ListingDone {
            generation,
            target,
            result,
            reply,
        } = done;

        if generation != self.generation {
            debug!("Listing finished after drive change, not applying it");
            let _ = reply.send(
                result
                    .map(|children| Listing { target, children })
                    .map_err(DriveError::from),
            );
            return;
        }

        self.is_querying = false;
        let outcome = match result {
            Ok(children) => {
                self.current = apply_navigation(self.current.as_ref(), target.clone());
                debug!(
                    "Now at {} ({} entries)",
                    self.current.as_ref().map(|c| c.display_path()).unwrap_or_else(|| "/".to_string()),
                    children.len()
                );
                self.emit_directory_changed();
                Ok(Listing { target, children })
            }
            Err(e) => {
                if e.is_recoverable() {
                    info!("Listing interrupted, can be retried: {}", e);
                } else {
                    warn!("Listing failed: {}", e);
                }
                Err(DriveError::from(e))
            }
        };
        let _ = reply.send(outcome);
    }

    fn reset_navigation(&mut self) {
        self.current = None;
        self.is_querying = false;
        self.generation += 1;
        self.emit_directory_changed();
    }

    fn emit_directory_changed(&mut self) {
        let event = DriveEvent::DirectoryChanged {
            current: self.current.clone(),
            is_root: self.current.is_none(),
        };
        self.subscribers.emit(event);
    }

    // ============ Downloads ============

    /// Register and start a download of `node` into `local_path`
    pub fn start_download(&mut self, node: &NodeRef, local_path: impl AsRef<Path>) -> Result<TaskId, DriveError> {
        let backend = self.backend.clone().ok_or(DriveError::BackendNotSet)?;
        if node.is_folder {
            return Err(DriveError::Internal("Download item is folder not file".to_string()));
        }
        if node.file_id.is_empty() {
            return Err(DriveError::Internal(format!(
                "File {} has no identifier on {}",
                node.name,
                backend.drive_type()
            )));
        }

        let drive_type = backend.drive_type();
        let duplicate = self.tasks.iter().any(|t| {
            t.drive_type() == drive_type && t.file_id() == node.file_id && t.status().is_active()
        });
        if duplicate {
            return Err(DriveError::DownloadExists(format!(
                "Download file {} from {} already in downloading, can not make duplicate download at same time",
                node.name, drive_type
            )));
        }

        let mut task = backend.create_download_task(node, local_path.as_ref());
        task.set_overwrite_existing(true);
        let id = task.id();
        info!("Queued download of {} from {}", node.name, drive_type);

        self.tasks.insert(0, task);
        self.subscribers.emit(DriveEvent::TaskBegun(self.tasks[0].info().clone()));

        self.tasks[0].start(TransferSink::new(id, self.transfer_tx.clone()));
        self.subscribers.emit(DriveEvent::TaskStarted(self.tasks[0].info().clone()));
        Ok(id)
    }

    /// Cancel a running task. Returns false if unknown or already finished.
    pub fn cancel_download(&mut self, id: TaskId) -> bool {
        let Some(index) = self.task_index(id) else {
            return false;
        };
        if !self.tasks[index].cancel() {
            return false;
        }
        info!("Cancelled download of {}", self.tasks[index].info().file_name);
        self.subscribers.emit(DriveEvent::TaskCancelled(self.tasks[index].info().clone()));
        if self.auto_clean {
            self.evict(index);
        }
        true
    }

    /// Remove a task from the registry, cancelling it first if still running
    pub fn remove_task(&mut self, id: TaskId) -> bool {
        let Some(index) = self.task_index(id) else {
            return false;
        };
        if self.tasks[index].cancel() {
            self.subscribers.emit(DriveEvent::TaskCancelled(self.tasks[index].info().clone()));
        }
        self.evict(index);
        true
    }

    /// Remove every finished task whose status is selected by `mask`
    pub fn cleanup(&mut self, mask: CleanupMask) -> usize {
        let mut removed = 0;
        let mut index = 0;
        while index < self.tasks.len() {
            if mask.matches(self.tasks[index].status()) {
                self.evict(index);
                removed += 1;
            } else {
                index += 1;
            }
        }
        if removed > 0 {
            debug!("Cleaned up {} tasks", removed);
        }
        removed
    }

    /// Drop every finished task to free memory
    pub fn handle_low_memory(&mut self) -> usize {
        self.cleanup(CleanupMask::ALL)
    }

    /// Turning auto-clean on also sweeps tasks that already finished
    pub fn set_auto_clean(&mut self, auto_clean: bool) {
        self.auto_clean = auto_clean;
        if auto_clean {
            self.cleanup(CleanupMask::ALL);
        }
    }

    pub fn auto_clean(&self) -> bool {
        self.auto_clean
    }

    /// Snapshots of every task, newest first
    pub fn tasks(&self) -> Vec<TaskInfo> {
        self.tasks.iter().map(|t| t.info().clone()).collect()
    }

    pub fn task(&self, id: TaskId) -> Option<TaskInfo> {
        self.tasks.iter().find(|t| t.id() == id).map(|t| t.info().clone())
    }

    pub fn task_index(&self, id: TaskId) -> Option<usize> {
        self.tasks.iter().position(|t| t.id() == id)
    }

    /// True if a task of `drive_type` is transferring right now
    pub fn has_active_download(&self, drive_type: DriveType) -> bool {
        self.tasks
            .iter()
            .any(|t| t.drive_type() == drive_type && t.status() == TaskStatus::Downloading)
    }

    fn handle_transfer(&mut self, message: TransferMessage) {
        let Some(index) = self.task_index(message.task_id) else {
            debug!("Dropping report for removed task {}", message.task_id);
            return;
        };
        let Some(transition) = self.tasks[index].apply(message.event) else {
            return;
        };

        let task = self.tasks[index].info().clone();
        match transition {
            TaskTransition::Progress(progress) => {
                self.subscribers.emit(DriveEvent::TaskProgress { task, progress });
                return;
            }
            TaskTransition::Completed => {
                info!("Download of {} complete", task.file_name);
                self.subscribers.emit(DriveEvent::TaskComplete(task));
            }
            TaskTransition::Failed(message) => {
                warn!("Download of {} failed: {}", task.file_name, message);
                self.subscribers.emit(DriveEvent::TaskError {
                    task,
                    error: DriveError::DownloadFailed(message),
                });
            }
        }

        if self.auto_clean {
            self.evict(index);
        }
    }

    /// Remove the task at `index`, severing its transfer
    fn evict(&mut self, index: usize) {
        let mut task = self.tasks.remove(index);
        task.sever();
        self.subscribers.emit(DriveEvent::TaskEnded {
            task: task.info().clone(),
            index,
        });
    }

    // ============ Inbox ============

    /// Wait for the next listing result or transfer report and apply it.
    /// Returns false once no more messages can arrive.
    pub async fn process_next(&mut self) -> bool {
        let inbound = tokio::select! {
            Some(done) = self.listing_rx.recv() => Inbound::Listing(done),
            Some(message) = self.transfer_rx.recv() => Inbound::Transfer(message),
            else => return false,
        };
        self.dispatch(inbound);
        true
    }

    /// Apply every message already in the inbox without waiting
    pub fn process_pending(&mut self) -> usize {
        let mut applied = 0;
        loop {
            let inbound = if let Ok(done) = self.listing_rx.try_recv() {
                Inbound::Listing(done)
            } else if let Ok(message) = self.transfer_rx.try_recv() {
                Inbound::Transfer(message)
            } else {
                return applied;
            };
            self.dispatch(inbound);
            applied += 1;
        }
    }

    /// Drive the inbox until no task is running
    pub async fn wait_for_downloads(&mut self) {
        while self.tasks.iter().any(|t| t.status().is_active()) {
            if !self.process_next().await {
                break;
            }
        }
    }

    fn dispatch(&mut self, inbound: Inbound) {
        match inbound {
            Inbound::Listing(done) => self.finish_listing(done),
            Inbound::Transfer(message) => self.handle_transfer(message),
        }
    }

    // ============ Lifecycle ============

    /// Cancel and remove the active drive's tasks, drop its credentials and
    /// return to root with no drive selected
    pub fn logout(&mut self) {
        let Some(backend) = self.backend.take() else {
            debug!("Logout with no drive selected");
            return;
        };
        let drive_type = backend.drive_type();

        let mut index = 0;
        while index < self.tasks.len() {
            if self.tasks[index].drive_type() != drive_type {
                index += 1;
                continue;
            }
            if self.tasks[index].cancel() {
                self.subscribers.emit(DriveEvent::TaskCancelled(self.tasks[index].info().clone()));
            }
            self.evict(index);
        }

        backend.logout();
        info!("Logged out of {}", drive_type);
        self.reset_navigation();
    }

    /// Stop every transfer regardless of drive and drop the backend
    pub fn shutdown(&mut self) {
        info!("Shutting down drive manager with {} tasks", self.tasks.len());
        for mut task in self.tasks.drain(..) {
            task.cancel();
            task.sever();
        }
        self.backend = None;
        self.current = None;
        self.is_querying = false;
        self.generation += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::TaskProgress;
    use crate::node::MetadataNode;
    use crate::testing::{ScriptedBackend, ScriptedFactory};

    fn manager_with(backends: &[Arc<ScriptedBackend>]) -> DriveManager {
        DriveManager::with_factory(Box::new(ScriptedFactory::new(backends)), false)
    }

    fn folder(id: &str, name: &str) -> NodeRef {
        MetadataNode::folder(id, name, format!("/{}", name), false)
    }

    fn file(id: &str, name: &str) -> NodeRef {
        MetadataNode::file(id, name, format!("/{}", name), true, Some(10), None)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<DriveEvent>) -> Vec<DriveEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    /// Manager on a Dropbox script with one downloadable file
    fn download_fixture() -> (DriveManager, Arc<ScriptedBackend>, NodeRef) {
        let backend = ScriptedBackend::new(DriveType::Dropbox);
        let mut manager = manager_with(&[backend.clone()]);
        manager.set_backend(Some(DriveType::Dropbox)).unwrap();
        (manager, backend, file("id:x", "x.pdf"))
    }

    #[tokio::test]
    async fn test_breadcrumb_scenario() {
        let backend = ScriptedBackend::new(DriveType::Dropbox);
        let a = MetadataNode::folder("id:a", "A", "/A", true);
        let b = MetadataNode::folder("id:b", "B", "/A/B", false);
        backend.script_listing("", Ok(vec![a.clone()]));
        backend.script_listing("id:a", Ok(vec![b.clone()]));
        backend.script_listing("id:b", Ok(vec![]));

        let mut manager = manager_with(&[backend]);
        manager.set_backend(Some(DriveType::Dropbox)).unwrap();

        let root = manager.navigate(None).await.unwrap().unwrap();
        assert!(manager.is_root());
        let opened_a = root.children[0].clone();

        manager.navigate(Some(opened_a)).await.unwrap().unwrap();
        let current = manager.current().unwrap();
        assert_eq!(current.name, "A");
        assert!(current.previous().is_none());

        manager.navigate(Some(b.clone())).await.unwrap().unwrap();
        let current = manager.current().unwrap();
        assert_eq!(current.name, "B");
        assert_eq!(current.previous().unwrap().name, "A");
        assert_eq!(manager.breadcrumbs().len(), 2);

        manager.navigate(Some(a.clone())).await.unwrap().unwrap();
        let current = manager.current().unwrap();
        assert_eq!(current.name, "A");
        assert!(!current.chain_contains(&b));
        assert!(b.previous().is_none());
    }

    #[tokio::test]
    async fn test_go_to_parent() {
        let backend = ScriptedBackend::new(DriveType::Dropbox);
        let a = MetadataNode::folder("id:a", "A", "/A", true);
        let b = MetadataNode::folder("id:b", "B", "/A/B", false);
        backend.script_listing("", Ok(vec![a.clone()]));
        backend.script_listing("id:a", Ok(vec![b.clone()]));
        backend.script_listing("id:b", Ok(vec![]));

        let mut manager = manager_with(&[backend]);
        manager.set_backend(Some(DriveType::Dropbox)).unwrap();
        assert!(manager.go_to_parent().is_none());

        manager.navigate(Some(a.clone())).await.unwrap().unwrap();
        manager.navigate(Some(b)).await.unwrap().unwrap();

        let reply = manager.go_to_parent().unwrap();
        while manager.is_querying() {
            manager.process_next().await;
        }
        reply.wait().await.unwrap();
        assert!(Arc::ptr_eq(&manager.current().unwrap(), &a));

        manager.go_to_parent().unwrap();
        while manager.is_querying() {
            manager.process_next().await;
        }
        assert!(manager.is_root());
    }

    #[tokio::test]
    async fn test_listing_errors_reach_caller() {
        let backend = ScriptedBackend::new(DriveType::Dropbox);
        let mut manager = manager_with(&[backend]);

        let err = manager.navigate(None).await.unwrap().unwrap_err();
        assert_eq!(err, DriveError::BackendNotSet);

        manager.set_backend(Some(DriveType::Dropbox)).unwrap();
        let err = manager.navigate(Some(file("id:f", "f.txt"))).await.unwrap().unwrap_err();
        assert_eq!(err, DriveError::Internal("Can not list contents of a file".to_string()));
        assert!(!manager.is_querying());
    }

    #[tokio::test]
    async fn test_failed_listing_leaves_position() {
        let backend = ScriptedBackend::new(DriveType::Dropbox);
        let a = folder("id:a", "A");
        backend.script_listing("id:a", Ok(vec![]));
        backend.script_listing("id:broken", Err("folder vanished".to_string()));

        let mut manager = manager_with(&[backend]);
        manager.set_backend(Some(DriveType::Dropbox)).unwrap();
        manager.navigate(Some(a.clone())).await.unwrap().unwrap();
        let mut dir_events = manager.subscribe(EventChannel::Directory);

        let err = manager.navigate(Some(folder("id:broken", "broken"))).await.unwrap().unwrap_err();
        assert_eq!(err, DriveError::Internal("folder vanished".to_string()));
        assert!(Arc::ptr_eq(&manager.current().unwrap(), &a));
        assert!(drain(&mut dir_events).is_empty());
    }

    #[tokio::test]
    async fn test_second_listing_while_querying_is_dropped() {
        let backend = ScriptedBackend::new(DriveType::Dropbox);
        backend.script_listing("", Ok(vec![folder("id:a", "A")]));
        let release = backend.hold_next_listing();

        let mut manager = manager_with(&[backend.clone()]);
        manager.set_backend(Some(DriveType::Dropbox)).unwrap();
        let mut dir_events = manager.subscribe(EventChannel::Directory);

        let reply = manager.list(None);
        assert!(reply.is_some());
        assert!(manager.is_querying());
        assert!(manager.list(None).is_none());
        assert!(manager.list(Some(folder("id:a", "A"))).is_none());
        assert!(drain(&mut dir_events).is_empty());

        release.send(()).unwrap();
        assert!(manager.process_next().await);
        assert!(!manager.is_querying());
        let listing = reply.unwrap().wait().await.unwrap();
        assert_eq!(listing.children.len(), 1);
        assert_eq!(backend.list_calls(), 1);
        assert_eq!(drain(&mut dir_events).len(), 1);
    }

    #[tokio::test]
    async fn test_stale_listing_not_applied_after_switch() {
        let dropbox = ScriptedBackend::new(DriveType::Dropbox);
        let drive = ScriptedBackend::new(DriveType::GoogleDrive);
        let a = folder("id:a", "A");
        dropbox.script_listing("id:a", Ok(vec![]));
        let release = dropbox.hold_next_listing();

        let mut manager = manager_with(&[dropbox, drive]);
        manager.set_backend(Some(DriveType::Dropbox)).unwrap();
        let reply = manager.list(Some(a)).unwrap();

        manager.set_backend(Some(DriveType::GoogleDrive)).unwrap();
        assert!(!manager.is_querying());
        release.send(()).unwrap();
        manager.process_next().await;

        assert!(reply.wait().await.is_ok());
        assert!(manager.is_root());
        assert_eq!(manager.drive_type(), Some(DriveType::GoogleDrive));
    }

    #[tokio::test]
    async fn test_set_backend_switch_and_none() {
        let dropbox = ScriptedBackend::new(DriveType::Dropbox);
        let mut manager = manager_with(&[dropbox.clone()]);
        assert_eq!(manager.drive_type_string(), "");

        manager.set_backend(Some(DriveType::Dropbox)).unwrap();
        assert_eq!(manager.drive_type_string(), "DropBox");
        let first = manager.backend().unwrap();
        manager.set_backend(Some(DriveType::Dropbox)).unwrap();
        assert!(Arc::ptr_eq(&first, &manager.backend().unwrap()));

        assert!(manager.set_backend(Some(DriveType::Local)).is_err());
        assert_eq!(manager.drive_type(), Some(DriveType::Dropbox));

        manager.set_backend(None).unwrap();
        assert!(manager.backend().is_none());
        assert_eq!(dropbox.logout_calls(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_download_rejected() {
        let (mut manager, _backend, x) = download_fixture();
        manager.start_download(&x, "/tmp/dl").unwrap();
        let err = manager.start_download(&x, "/tmp/dl").unwrap_err();
        assert!(matches!(err, DriveError::DownloadExists(_)));
        assert!(err.to_string().contains("x.pdf"));
        assert_eq!(manager.tasks().len(), 1);
    }

    #[tokio::test]
    async fn test_same_file_other_drive_is_not_duplicate() {
        let dropbox = ScriptedBackend::new(DriveType::Dropbox);
        let drive = ScriptedBackend::new(DriveType::GoogleDrive);
        let mut manager = manager_with(&[dropbox, drive]);
        let x = file("same-id", "x.pdf");

        manager.set_backend(Some(DriveType::Dropbox)).unwrap();
        manager.start_download(&x, "/tmp/dl").unwrap();
        manager.set_backend(Some(DriveType::GoogleDrive)).unwrap();
        manager.start_download(&x, "/tmp/dl").unwrap();
        assert_eq!(manager.tasks().len(), 2);
    }

    #[tokio::test]
    async fn test_start_download_preconditions() {
        let backend = ScriptedBackend::new(DriveType::Dropbox);
        let mut manager = manager_with(&[backend]);
        assert_eq!(
            manager.start_download(&file("id:x", "x"), "/tmp").unwrap_err(),
            DriveError::BackendNotSet
        );

        manager.set_backend(Some(DriveType::Dropbox)).unwrap();
        assert_eq!(
            manager.start_download(&folder("id:a", "A"), "/tmp").unwrap_err(),
            DriveError::Internal("Download item is folder not file".to_string())
        );
        assert!(matches!(
            manager.start_download(&file("", "x"), "/tmp"),
            Err(DriveError::Internal(_))
        ));
        assert!(manager.tasks().is_empty());
    }

    #[tokio::test]
    async fn test_download_lifecycle_events() {
        let (mut manager, backend, x) = download_fixture();
        let mut events = manager.subscribe(EventChannel::Task);

        let id = manager.start_download(&x, "/tmp/dl").unwrap();
        let task = manager.task(id).unwrap();
        assert!(task.overwrite_existing);
        assert_eq!(task.status, TaskStatus::BeginDownload);

        let sink = backend.sink("id:x").unwrap();
        sink.progress(5, Some(10));
        sink.complete();
        assert_eq!(manager.process_pending(), 2);

        let events = drain(&mut events);
        assert!(matches!(events[0], DriveEvent::TaskBegun(_)));
        assert!(matches!(events[1], DriveEvent::TaskStarted(_)));
        assert!(matches!(
            events[2],
            DriveEvent::TaskProgress { progress: TaskProgress::Fraction(p), .. } if p == 0.5
        ));
        assert!(matches!(events[3], DriveEvent::TaskComplete(_)));
        assert_eq!(events.len(), 4);

        let task = manager.task(id).unwrap();
        assert_eq!(task.status, TaskStatus::Complete);
        assert_eq!(task.progress, TaskProgress::Fraction(1.0));
    }

    #[tokio::test]
    async fn test_indeterminate_progress_is_not_zero() {
        let (mut manager, backend, x) = download_fixture();
        let id = manager.start_download(&x, "/tmp/dl").unwrap();
        backend.sink("id:x").unwrap().progress(100, None);
        manager.process_pending();
        let task = manager.task(id).unwrap();
        assert_eq!(task.status, TaskStatus::Downloading);
        assert_eq!(task.progress.to_string(), "Unknown progress");
    }

    #[tokio::test]
    async fn test_cancel_wins_over_racing_completion() {
        let (mut manager, backend, x) = download_fixture();
        let id = manager.start_download(&x, "/tmp/dl").unwrap();
        let sink = backend.sink("id:x").unwrap();
        sink.progress(4, Some(10));
        manager.process_pending();

        let mut events = manager.subscribe(EventChannel::Task);
        assert!(manager.cancel_download(id));
        assert!(backend.was_cancelled("id:x"));
        sink.complete();
        manager.process_pending();

        let task = manager.task(id).unwrap();
        assert_eq!(task.status, TaskStatus::Cancel);
        assert_eq!(task.progress, TaskProgress::Fraction(0.4));
        let events = drain(&mut events);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], DriveEvent::TaskCancelled(_)));
        assert!(!manager.cancel_download(id));
    }

    #[tokio::test]
    async fn test_transfer_failure_reports_error_once() {
        let (mut manager, backend, x) = download_fixture();
        let mut events = manager.subscribe(EventChannel::Task);
        let id = manager.start_download(&x, "/tmp/dl").unwrap();
        let sink = backend.sink("id:x").unwrap();
        sink.fail("connection reset");
        sink.fail("connection reset again");
        manager.process_pending();

        let errors: Vec<DriveError> = drain(&mut events)
            .into_iter()
            .filter_map(|e| match e {
                DriveEvent::TaskError { error, .. } => Some(error),
                _ => None,
            })
            .collect();
        assert_eq!(errors, vec![DriveError::DownloadFailed("connection reset".to_string())]);
        assert_eq!(manager.task(id).unwrap().status, TaskStatus::Error);
        assert_eq!(manager.task(id).unwrap().error.as_deref(), Some("connection reset"));
    }

    #[tokio::test]
    async fn test_finished_download_can_restart() {
        let (mut manager, backend, x) = download_fixture();
        manager.start_download(&x, "/tmp/dl").unwrap();
        backend.sink("id:x").unwrap().complete();
        manager.process_pending();
        assert!(manager.start_download(&x, "/tmp/dl").is_ok());
        assert_eq!(manager.tasks().len(), 2);
    }

    #[tokio::test]
    async fn test_newest_task_first() {
        let (mut manager, _backend, x) = download_fixture();
        let first = manager.start_download(&x, "/tmp/dl").unwrap();
        let second = manager.start_download(&file("id:y", "y.pdf"), "/tmp/dl").unwrap();
        assert_eq!(manager.task_index(second), Some(0));
        assert_eq!(manager.task_index(first), Some(1));
    }

    #[tokio::test]
    async fn test_auto_clean_evicts_on_terminal() {
        let backend = ScriptedBackend::new(DriveType::Dropbox);
        let mut manager = DriveManager::with_factory(Box::new(ScriptedFactory::new(&[backend.clone()])), true);
        manager.set_backend(Some(DriveType::Dropbox)).unwrap();
        let mut events = manager.subscribe(EventChannel::Task);

        let id = manager.start_download(&file("id:x", "x.pdf"), "/tmp/dl").unwrap();
        backend.sink("id:x").unwrap().complete();
        manager.process_pending();

        assert!(manager.task(id).is_none());
        let last = drain(&mut events).pop().unwrap();
        assert!(matches!(last, DriveEvent::TaskEnded { index: 0, .. }));

        let id = manager.start_download(&file("id:y", "y.pdf"), "/tmp/dl").unwrap();
        manager.cancel_download(id);
        assert!(manager.tasks().is_empty());
    }

    #[tokio::test]
    async fn test_enabling_auto_clean_sweeps_finished_tasks() {
        let (mut manager, backend, x) = download_fixture();
        manager.start_download(&x, "/tmp/dl").unwrap();
        let running = manager.start_download(&file("id:y", "y.pdf"), "/tmp/dl").unwrap();
        backend.sink("id:x").unwrap().complete();
        manager.process_pending();
        assert_eq!(manager.tasks().len(), 2);

        manager.set_auto_clean(true);
        assert!(manager.auto_clean());
        let remaining = manager.tasks();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, running);
    }

    #[tokio::test]
    async fn test_cleanup_mask_selects_states() {
        let (mut manager, backend, _) = download_fixture();
        let done = manager.start_download(&file("id:1", "1"), "/tmp/dl").unwrap();
        let cancelled = manager.start_download(&file("id:2", "2"), "/tmp/dl").unwrap();
        let failed = manager.start_download(&file("id:3", "3"), "/tmp/dl").unwrap();
        let running = manager.start_download(&file("id:4", "4"), "/tmp/dl").unwrap();
        backend.sink("id:1").unwrap().complete();
        backend.sink("id:3").unwrap().fail("boom");
        manager.process_pending();
        manager.cancel_download(cancelled);

        assert_eq!(manager.cleanup(CleanupMask::COMPLETE | CleanupMask::ERROR), 2);
        assert!(manager.task(done).is_none());
        assert!(manager.task(failed).is_none());
        assert!(manager.task(cancelled).is_some());

        assert_eq!(manager.handle_low_memory(), 1);
        let remaining = manager.tasks();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, running);
    }

    #[tokio::test]
    async fn test_remove_running_task_cancels_first() {
        let (mut manager, backend, x) = download_fixture();
        let older = manager.start_download(&file("id:y", "y.pdf"), "/tmp/dl").unwrap();
        let id = manager.start_download(&x, "/tmp/dl").unwrap();
        let mut events = manager.subscribe(EventChannel::Task);

        assert!(manager.remove_task(older));
        assert!(backend.was_cancelled("id:y"));
        let events = drain(&mut events);
        assert!(matches!(events[0], DriveEvent::TaskCancelled(_)));
        assert!(matches!(events[1], DriveEvent::TaskEnded { index: 1, .. }));
        assert_eq!(manager.task_index(id), Some(0));
        assert!(!manager.remove_task(older));
    }

    #[tokio::test]
    async fn test_logout_purges_active_drive_tasks() {
        let dropbox = ScriptedBackend::new(DriveType::Dropbox);
        let drive = ScriptedBackend::new(DriveType::GoogleDrive);
        dropbox.script_listing("id:a", Ok(vec![]));
        let mut manager = manager_with(&[dropbox.clone(), drive.clone()]);

        manager.set_backend(Some(DriveType::GoogleDrive)).unwrap();
        let kept = manager.start_download(&file("g1", "g.pdf"), "/tmp/dl").unwrap();

        manager.set_backend(Some(DriveType::Dropbox)).unwrap();
        manager.navigate(Some(folder("id:a", "A"))).await.unwrap().unwrap();
        manager.start_download(&file("d1", "d1.pdf"), "/tmp/dl").unwrap();
        manager.start_download(&file("d2", "d2.pdf"), "/tmp/dl").unwrap();
        dropbox.sink("d1").unwrap().progress(1, Some(2));
        manager.process_pending();
        assert!(manager.has_active_download(DriveType::Dropbox));
        assert!(!manager.has_active_download(DriveType::GoogleDrive));

        let mut dir_events = manager.subscribe(EventChannel::Directory);
        manager.logout();

        assert!(manager.tasks().iter().all(|t| t.drive_type != DriveType::Dropbox));
        assert!(manager.task(kept).is_some());
        assert!(manager.current().is_none());
        assert!(manager.backend().is_none());
        assert!(dropbox.was_cancelled("d1"));
        assert!(dropbox.was_cancelled("d2"));
        assert_eq!(dropbox.logout_calls(), 1);
        assert_eq!(drive.logout_calls(), 0);
        assert!(matches!(
            drain(&mut dir_events).as_slice(),
            [DriveEvent::DirectoryChanged { current: None, is_root: true }]
        ));
    }

    #[tokio::test]
    async fn test_removed_task_reports_are_ignored() {
        let (mut manager, backend, x) = download_fixture();
        let id = manager.start_download(&x, "/tmp/dl").unwrap();
        let sink = backend.sink("id:x").unwrap();
        manager.remove_task(id);
        sink.progress(1, Some(2));
        sink.complete();
        assert_eq!(manager.process_pending(), 2);
        assert!(manager.tasks().is_empty());
    }

    #[tokio::test]
    async fn test_last_subscriber_wins() {
        let (mut manager, _backend, x) = download_fixture();
        let mut first = manager.subscribe(EventChannel::Task);
        let mut second = manager.subscribe(EventChannel::Task);
        manager.start_download(&x, "/tmp/dl").unwrap();
        assert!(drain(&mut first).is_empty());
        assert_eq!(drain(&mut second).len(), 2);
    }

    #[tokio::test]
    async fn test_shutdown_stops_every_transfer() {
        let dropbox = ScriptedBackend::new(DriveType::Dropbox);
        let drive = ScriptedBackend::new(DriveType::GoogleDrive);
        let mut manager = manager_with(&[dropbox.clone(), drive.clone()]);
        manager.set_backend(Some(DriveType::GoogleDrive)).unwrap();
        manager.start_download(&file("g1", "g.pdf"), "/tmp/dl").unwrap();
        manager.set_backend(Some(DriveType::Dropbox)).unwrap();
        manager.start_download(&file("d1", "d.pdf"), "/tmp/dl").unwrap();

        manager.shutdown();
        assert!(manager.tasks().is_empty());
        assert!(manager.backend().is_none());
        assert!(drive.was_cancelled("g1"));
        assert!(dropbox.was_cancelled("d1"));
    }

    #[tokio::test]
    async fn test_local_drive_end_to_end() {
        let root = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        std::fs::create_dir(root.path().join("Docs")).unwrap();
        std::fs::write(root.path().join("Docs").join("notes.txt"), "remember the milk").unwrap();

        let config = DriveConfig {
            local_root: Some(root.path().to_path_buf()),
            download_dir: out.path().to_path_buf(),
            ..DriveConfig::default()
        };
        let mut manager = DriveManager::new(config);
        manager.set_backend(Some(DriveType::Local)).unwrap();

        struct Unused;
        impl AuthPresenter for Unused {
            fn present(&self, _auth_url: &str) -> Result<(), ProviderError> {
                Ok(())
            }
        }
        assert_eq!(manager.authorize(&Unused).await.unwrap(), AuthState::Success);

        let root_listing = manager.navigate(None).await.unwrap().unwrap();
        let docs = root_listing.children[0].clone();
        let listing = manager.navigate(Some(docs)).await.unwrap().unwrap();
        let notes = listing.children[0].clone();
        assert_eq!(manager.current().unwrap().display_path(), "/Docs");

        let mut events = manager.subscribe(EventChannel::Task);
        let id = manager.start_download(&notes, out.path()).unwrap();
        manager.wait_for_downloads().await;

        assert_eq!(manager.task(id).unwrap().status, TaskStatus::Complete);
        let written = std::fs::read_to_string(out.path().join("notes.txt")).unwrap();
        assert_eq!(written, "remember the milk");
        assert!(drain(&mut events)
            .iter()
            .any(|e| matches!(e, DriveEvent::TaskComplete(_))));
    }
}
