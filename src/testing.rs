//! Scripted drive backend for manager tests

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use url::Url;

use crate::download::{DownloadTask, Transfer, TransferSink};
use crate::node::NodeRef;
use crate::providers::{
    AuthPresenter, AuthState, BackendFactory, DriveBackend, DriveType, ProviderError,
};

#[derive(Default)]
struct Script {
    /// Keyed by parent file id, "" for root
    listings: HashMap<String, Result<Vec<NodeRef>, String>>,
    gate: Option<oneshot::Receiver<()>>,
    sinks: Vec<(String, TransferSink)>,
    cancelled: Vec<String>,
}

/// Backend answering listings from a script and handing transfer sinks to the test
pub(crate) struct ScriptedBackend {
    drive_type: DriveType,
    script: Arc<Mutex<Script>>,
    list_calls: AtomicUsize,
    logout_calls: AtomicUsize,
}

impl ScriptedBackend {
    pub(crate) fn new(drive_type: DriveType) -> Arc<Self> {
        Arc::new(Self {
            drive_type,
            script: Arc::new(Mutex::new(Script::default())),
            list_calls: AtomicUsize::new(0),
            logout_calls: AtomicUsize::new(0),
        })
    }

    pub(crate) fn script_listing(&self, parent_id: &str, result: Result<Vec<NodeRef>, String>) {
        self.script.lock().unwrap().listings.insert(parent_id.to_string(), result);
    }

    /// The next listing waits until the returned sender fires
    pub(crate) fn hold_next_listing(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.script.lock().unwrap().gate = Some(rx);
        tx
    }

    /// Sink of the most recently started transfer for `file_id`
    pub(crate) fn sink(&self, file_id: &str) -> Option<TransferSink> {
        self.script
            .lock()
            .unwrap()
            .sinks
            .iter()
            .rev()
            .find(|(id, _)| id == file_id)
            .map(|(_, sink)| sink.clone())
    }

    pub(crate) fn was_cancelled(&self, file_id: &str) -> bool {
        self.script.lock().unwrap().cancelled.iter().any(|id| id == file_id)
    }

    pub(crate) fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn logout_calls(&self) -> usize {
        self.logout_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DriveBackend for ScriptedBackend {
    fn drive_type(&self) -> DriveType {
        self.drive_type
    }

    async fn authorize(&self, _presenter: &dyn AuthPresenter) -> AuthState {
        AuthState::Success
    }

    fn handle_redirect(&self, _url: &Url) -> bool {
        false
    }

    async fn list_children(&self, parent: Option<&NodeRef>) -> Result<Vec<NodeRef>, ProviderError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let gate = self.script.lock().unwrap().gate.take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        let key = parent.map(|p| p.file_id.clone()).unwrap_or_default();
        match self.script.lock().unwrap().listings.get(&key) {
            Some(Ok(children)) => Ok(children.clone()),
            Some(Err(message)) => Err(ProviderError::Other(message.clone())),
            None => Err(ProviderError::NotFound(key)),
        }
    }

    fn create_download_task(&self, node: &NodeRef, local_dir: &Path) -> DownloadTask {
        let transfer = ScriptedTransfer {
            file_id: node.file_id.clone(),
            script: Arc::clone(&self.script),
        };
        DownloadTask::new(
            node.file_id.clone(),
            self.drive_type,
            node.path.clone(),
            local_dir.join(&node.name),
            node.name.clone(),
            Box::new(transfer),
        )
    }

    fn logout(&self) {
        self.logout_calls.fetch_add(1, Ordering::SeqCst);
    }
}

struct ScriptedTransfer {
    file_id: String,
    script: Arc<Mutex<Script>>,
}

impl Transfer for ScriptedTransfer {
    fn start(&mut self, sink: TransferSink) {
        self.script.lock().unwrap().sinks.push((self.file_id.clone(), sink));
    }

    fn cancel(&mut self) {
        self.script.lock().unwrap().cancelled.push(self.file_id.clone());
    }
}

/// Factory returning the same scripted instance for each drive type
pub(crate) struct ScriptedFactory {
    backends: HashMap<DriveType, Arc<ScriptedBackend>>,
}

impl ScriptedFactory {
    pub(crate) fn new(backends: &[Arc<ScriptedBackend>]) -> Self {
        Self {
            backends: backends.iter().map(|b| (b.drive_type, Arc::clone(b))).collect(),
        }
    }
}

impl BackendFactory for ScriptedFactory {
    fn create(&self, drive_type: DriveType) -> Result<Arc<dyn DriveBackend>, ProviderError> {
        self.backends
            .get(&drive_type)
            .map(|b| Arc::clone(b) as Arc<dyn DriveBackend>)
            .ok_or_else(|| ProviderError::InvalidConfig(format!("{} is not scripted", drive_type)))
    }
}
