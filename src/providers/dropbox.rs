//! Dropbox Backend
//!
//! Lists folders and downloads files through the Dropbox API v2.
//! Uses OAuth2 for authentication.

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use secrecy::ExposeSecret;
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use tracing::info;
use url::Url;

use super::{
    child_path, local_file_name, open_http_source, sanitize_api_error, AuthPresenter, AuthState, DriveBackend,
    DriveType, ProviderError,
    oauth2::{OAuth2Manager, OAuthConfig},
};
use crate::download::{DownloadTask, SourceOpener, StreamTransfer};
use crate::node::{MetadataNode, NodeRef};

/// Dropbox API endpoints
const API_BASE: &str = "https://api.dropboxapi.com/2";
const CONTENT_BASE: &str = "https://content.dropboxapi.com/2";

/// Dropbox file metadata
#[derive(Debug, Deserialize)]
struct DropboxMetadata {
    #[serde(rename = ".tag")]
    tag: String,
    name: String,
    path_display: Option<String>,
    id: Option<String>,
    #[serde(default)]
    size: Option<u64>,
    server_modified: Option<String>,
}

/// List folder response
#[derive(Debug, Deserialize)]
struct ListFolderResult {
    entries: Vec<DropboxMetadata>,
    cursor: String,
    has_more: bool,
}

impl DropboxMetadata {
    fn into_node(self, parent: Option<&NodeRef>) -> NodeRef {
        let path = self
            .path_display
            .unwrap_or_else(|| child_path(parent, &self.name));
        let file_id = self.id.unwrap_or_default();
        if self.tag == "folder" {
            MetadataNode::folder(file_id, self.name, path, parent.is_none())
        } else {
            MetadataNode::file(file_id, self.name, path, parent.is_none(), self.size, self.server_modified)
        }
    }
}

/// Dropbox API path argument for a node: its id when known, else its path
fn api_path(node: &MetadataNode) -> String {
    if node.file_id.is_empty() {
        node.path.clone()
    } else {
        node.file_id.clone()
    }
}

/// Dropbox backend
pub struct DropboxBackend {
    oauth: Arc<OAuth2Manager>,
    client: reqwest::Client,
}

impl DropboxBackend {
    pub fn new(config: OAuthConfig) -> Self {
        Self {
            oauth: Arc::new(OAuth2Manager::new(config)),
            client: reqwest::Client::new(),
        }
    }

    /// Use a pre-issued access token instead of the browser flow
    pub fn seed_access_token(&self, token: &str) {
        self.oauth.seed_access_token(token);
    }

    /// Make API call with RPC style
    async fn rpc_call<T: serde::de::DeserializeOwned>(
        &self,
        endpoint: &str,
        body: &serde_json::Value,
    ) -> Result<T, ProviderError> {
        let url = format!("{}/{}", API_BASE, endpoint);
        let token = self.oauth.get_valid_token().await?;

        let response = self
            .client
            .post(&url)
            .bearer_auth(token.expose_secret())
            .header(CONTENT_TYPE, "application/json")
            .body(body.to_string())
            .send()
            .await
            .map_err(|e| ProviderError::NetworkError(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();

            if text.contains("path/not_found") {
                return Err(ProviderError::NotFound(sanitize_api_error(&text)));
            }
            if status == reqwest::StatusCode::UNAUTHORIZED {
                return Err(ProviderError::AuthenticationFailed(sanitize_api_error(&text)));
            }
            return Err(ProviderError::ServerError(format!(
                "API error {}: {}",
                status,
                sanitize_api_error(&text)
            )));
        }

        response
            .json()
            .await
            .map_err(|e| ProviderError::ParseError(e.to_string()))
    }

    async fn list_folder_all(&self, path: &str) -> Result<Vec<DropboxMetadata>, ProviderError> {
        let body = serde_json::json!({
            "path": path,
            "recursive": false,
            "include_deleted": false,
            "include_mounted_folders": true
        });

        let mut result: ListFolderResult = self.rpc_call("files/list_folder", &body).await?;
        let mut all_entries = result.entries;

        while result.has_more {
            let continue_body = serde_json::json!({ "cursor": result.cursor });
            result = self.rpc_call("files/list_folder/continue", &continue_body).await?;
            all_entries.extend(result.entries);
        }

        Ok(all_entries)
    }
}

#[async_trait]
impl DriveBackend for DropboxBackend {
    fn drive_type(&self) -> DriveType {
        DriveType::Dropbox
    }

    async fn authorize(&self, presenter: &dyn AuthPresenter) -> AuthState {
        self.oauth.authorize(presenter).await
    }

    fn handle_redirect(&self, url: &Url) -> bool {
        self.oauth.handle_redirect(url)
    }

    async fn list_children(&self, parent: Option<&NodeRef>) -> Result<Vec<NodeRef>, ProviderError> {
        // Dropbox addresses the root as the empty path
        let path = parent.map(|p| api_path(p)).unwrap_or_default();
        let entries = self.list_folder_all(&path).await?;
        Ok(entries
            .into_iter()
            .filter(|e| e.tag == "file" || e.tag == "folder")
            .map(|e| e.into_node(parent))
            .collect())
    }

    fn create_download_task(&self, node: &NodeRef, local_dir: &Path) -> DownloadTask {
        let local_path = local_dir.join(local_file_name(&node.name));
        let arg = serde_json::json!({ "path": api_path(node) }).to_string();
        let url = format!("{}/files/download", CONTENT_BASE);
        let client = self.client.clone();
        let oauth = Arc::clone(&self.oauth);

        let opener: SourceOpener = Box::new(move || {
            Box::pin(async move {
                let token = oauth.get_valid_token().await?;
                let request = client
                    .post(&url)
                    .bearer_auth(token.expose_secret())
                    .header("Dropbox-API-Arg", arg);
                open_http_source(request).await
            })
        });

        DownloadTask::new(
            node.file_id.clone(),
            DriveType::Dropbox,
            node.path.clone(),
            local_path.clone(),
            node.name.clone(),
            Box::new(StreamTransfer::new(opener, local_path, true)),
        )
    }

    fn logout(&self) {
        self.oauth.clear();
        info!("Logged out of Dropbox");
    }
}
