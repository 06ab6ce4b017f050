//! Drive Backends Module
//!
//! Every cloud drive implements the `DriveBackend` trait, so the drive
//! manager can browse and download without knowing which service it talks to.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │             DriveBackend Trait              │
//! │  authorize, list_children, download, logout │
//! └─────────────────────────────────────────────┘
//!                      │
//!        ┌─────────────┼─────────────┐
//!        ▼             ▼             ▼
//!   ┌─────────┐   ┌─────────┐   ┌─────────┐
//!   │ Dropbox │   │ GDrive  │   │  Local  │
//!   └─────────┘   └─────────┘   └─────────┘
//! ```

pub mod types;
pub mod oauth2;
pub mod google_drive;
pub mod dropbox;
pub mod local;

pub use types::*;
pub use google_drive::GoogleDriveBackend;
pub use dropbox::DropboxBackend;
pub use local::LocalBackend;
pub use oauth2::{OAuth2Manager, OAuthConfig};

use async_trait::async_trait;
use futures_util::StreamExt;
use std::path::{Component, Path};
use std::sync::Arc;
use tracing::info;
use url::Url;

use crate::config::DriveConfig;
use crate::download::{ByteSource, DownloadTask};
use crate::node::NodeRef;

/// Shows an authorization URL to the user
pub trait AuthPresenter: Send + Sync {
    fn present(&self, auth_url: &str) -> Result<(), ProviderError>;
}

/// Opens the authorization URL in the system browser
#[derive(Debug, Default, Clone, Copy)]
pub struct BrowserPresenter;

impl AuthPresenter for BrowserPresenter {
    fn present(&self, auth_url: &str) -> Result<(), ProviderError> {
        info!("Opening browser for authorization");
        open::that(auth_url).map_err(|e| {
            ProviderError::Other(format!("Failed to open browser: {}. Visit {} manually", e, auth_url))
        })
    }
}

/// Unified drive backend trait
///
/// A backend knows how to authorize against its service, list the children
/// of a folder node and build a download task for a file node. It holds no
/// navigation state; the manager owns that.
#[async_trait]
pub trait DriveBackend: Send + Sync {
    /// Get the drive type tag
    fn drive_type(&self) -> DriveType;

    /// Stable identity string of the drive type
    fn drive_type_string(&self) -> &'static str {
        self.drive_type().as_str()
    }

    /// Run the authorization flow. Backends without accounts succeed at once.
    async fn authorize(&self, presenter: &dyn AuthPresenter) -> AuthState;

    /// Feed a redirect URL into a pending authorization.
    /// Returns true if the URL belonged to this backend's flow.
    fn handle_redirect(&self, url: &Url) -> bool;

    /// List the children of `parent`, or of the drive root when `None`.
    /// Children come back unlinked; the manager links the breadcrumb.
    async fn list_children(&self, parent: Option<&NodeRef>) -> Result<Vec<NodeRef>, ProviderError>;

    /// Build an unstarted download of `node` into `local_dir`
    fn create_download_task(&self, node: &NodeRef, local_dir: &Path) -> DownloadTask;

    /// Drop credentials. Idempotent.
    fn logout(&self);
}

/// Send a download request and expose its body as a `ByteSource`
pub(crate) async fn open_http_source(request: reqwest::RequestBuilder) -> Result<ByteSource, ProviderError> {
    let response = request
        .send()
        .await
        .map_err(|e| ProviderError::NetworkError(e.to_string()))?;

    if !response.status().is_success() {
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(ProviderError::NotFound(sanitize_api_error(&text)));
        }
        return Err(ProviderError::ServerError(format!("{}: {}", status, sanitize_api_error(&text))));
    }

    let total = response.content_length();
    let stream = response
        .bytes_stream()
        .map(|chunk| chunk.map_err(|e| ProviderError::NetworkError(e.to_string())))
        .boxed();
    Ok(ByteSource { total, stream })
}

/// Display path of a child named `name` under `parent`
pub(crate) fn child_path(parent: Option<&NodeRef>, name: &str) -> String {
    match parent {
        Some(parent) => format!("{}/{}", parent.path.trim_end_matches('/'), name),
        None => format!("/{}", name),
    }
}

/// Name to write a downloaded file under: the last normal path component of
/// the remote `name`. Separators, dot segments and NUL bytes never reach the
/// local filesystem.
pub(crate) fn local_file_name(name: &str) -> String {
    const FALLBACK: &str = "download";

    let cleaned: String = name.chars().filter(|c| *c != '\0').collect();
    let Some(segment) = cleaned
        .rsplit(|c| c == '/' || c == '\\')
        .find(|s| !s.is_empty() && *s != "." && *s != "..")
    else {
        return FALLBACK.to_string();
    };

    let mut components = Path::new(segment).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => segment.to_string(),
        _ => FALLBACK.to_string(),
    }
}

/// Builds backends on demand when the manager switches drives
pub trait BackendFactory: Send + Sync {
    fn create(&self, drive_type: DriveType) -> Result<Arc<dyn DriveBackend>, ProviderError>;
}

/// Factory backed by the drive configuration file
#[derive(Debug, Clone)]
pub struct DefaultBackendFactory {
    config: DriveConfig,
}

impl DefaultBackendFactory {
    pub fn new(config: DriveConfig) -> Self {
        Self { config }
    }
}

impl BackendFactory for DefaultBackendFactory {
    fn create(&self, drive_type: DriveType) -> Result<Arc<dyn DriveBackend>, ProviderError> {
        let port = self.config.oauth_redirect_port;
        match drive_type {
            DriveType::GoogleDrive => {
                let app = self.config.google_drive.as_ref().ok_or_else(|| {
                    ProviderError::InvalidConfig("Google Drive client_id is not configured".to_string())
                })?;
                let oauth = OAuthConfig::google(&app.client_id, app.client_secret.as_deref(), port);
                let backend = GoogleDriveBackend::new(oauth);
                if let Some(token) = &app.access_token {
                    backend.seed_access_token(token);
                }
                Ok(Arc::new(backend))
            }
            DriveType::Dropbox => {
                let app = self.config.dropbox.as_ref().ok_or_else(|| {
                    ProviderError::InvalidConfig("Dropbox app key is not configured".to_string())
                })?;
                let oauth = OAuthConfig::dropbox(&app.client_id, app.client_secret.as_deref(), port);
                let backend = DropboxBackend::new(oauth);
                if let Some(token) = &app.access_token {
                    backend.seed_access_token(token);
                }
                Ok(Arc::new(backend))
            }
            DriveType::Local => {
                let root = self.config.local_root.as_ref().ok_or_else(|| {
                    ProviderError::InvalidConfig("local_root is not configured".to_string())
                })?;
                Ok(Arc::new(LocalBackend::new(root)))
            }
        }
    }
}
