//! Local directory backend
//!
//! Serves a directory on this machine as a drive. Node ids are paths relative
//! to the configured root, using `/` separators.

use async_trait::async_trait;
use futures_util::StreamExt;
use std::path::{Component, Path, PathBuf};
use tokio_util::io::ReaderStream;
use tracing::debug;
use url::Url;

use super::{child_path, local_file_name, AuthPresenter, AuthState, DriveBackend, DriveType, ProviderError};
use crate::download::{ByteSource, DownloadTask, SourceOpener, StreamTransfer};
use crate::node::{MetadataNode, NodeRef};

/// Reject ids that could escape the root
fn validate_relative(id: &str) -> Result<(), ProviderError> {
    if id.contains('\0') {
        return Err(ProviderError::InvalidConfig("Path contains null bytes".to_string()));
    }
    for component in Path::new(id).components() {
        if matches!(component, Component::ParentDir | Component::RootDir | Component::Prefix(_)) {
            return Err(ProviderError::InvalidConfig(format!("Path escapes drive root: {}", id)));
        }
    }
    Ok(())
}

/// Drive backed by a local directory
#[derive(Debug, Clone)]
pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, id: &str) -> Result<PathBuf, ProviderError> {
        validate_relative(id)?;
        Ok(if id.is_empty() { self.root.clone() } else { self.root.join(id) })
    }
}

#[async_trait]
impl DriveBackend for LocalBackend {
    fn drive_type(&self) -> DriveType {
        DriveType::Local
    }

    async fn authorize(&self, _presenter: &dyn AuthPresenter) -> AuthState {
        if self.root.is_dir() {
            AuthState::Success
        } else {
            AuthState::Error(format!("Drive root {} is not a directory", self.root.display()))
        }
    }

    fn handle_redirect(&self, _url: &Url) -> bool {
        false
    }

    async fn list_children(&self, parent: Option<&NodeRef>) -> Result<Vec<NodeRef>, ProviderError> {
        let parent_id = parent.map(|p| p.file_id.as_str()).unwrap_or("");
        let dir = self.resolve(parent_id)?;

        let mut entries = tokio::fs::read_dir(&dir).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ProviderError::NotFound(dir.display().to_string()),
            _ => ProviderError::IoError(e),
        })?;

        let mut nodes = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let id = if parent_id.is_empty() {
                name.clone()
            } else {
                format!("{}/{}", parent_id, name)
            };
            let path = child_path(parent, &name);
            let metadata = entry.metadata().await?;

            let node = if metadata.is_dir() {
                MetadataNode::folder(id, name, path, parent.is_none())
            } else {
                let modified = metadata
                    .modified()
                    .ok()
                    .map(|t| chrono::DateTime::<chrono::Utc>::from(t).to_rfc3339());
                MetadataNode::file(id, name, path, parent.is_none(), Some(metadata.len()), modified)
            };
            nodes.push(node);
        }

        nodes.sort_by(|a, b| b.is_folder.cmp(&a.is_folder).then_with(|| a.name.cmp(&b.name)));
        debug!("Listed {} entries in {:?}", nodes.len(), dir);
        Ok(nodes)
    }

    fn create_download_task(&self, node: &NodeRef, local_dir: &Path) -> DownloadTask {
        let local_path = local_dir.join(local_file_name(&node.name));
        let source = self.resolve(&node.file_id);

        let opener: SourceOpener = Box::new(move || {
            Box::pin(async move {
                let source = source?;
                let file = tokio::fs::File::open(&source).await?;
                let total = file.metadata().await?.len();
                let stream = ReaderStream::new(file)
                    .map(|chunk| chunk.map_err(ProviderError::from))
                    .boxed();
                Ok(ByteSource { total: Some(total), stream })
            })
        });

        DownloadTask::new(
            node.file_id.clone(),
            DriveType::Local,
            node.path.clone(),
            local_path.clone(),
            node.name.clone(),
            Box::new(StreamTransfer::new(opener, local_path, true)),
        )
    }

    fn logout(&self) {}
}
