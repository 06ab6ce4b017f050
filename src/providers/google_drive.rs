//! Google Drive Backend
//!
//! Lists folders and downloads files through the Drive API v3.
//! Uses OAuth2 for authentication.

use async_trait::async_trait;
use secrecy::ExposeSecret;
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};
use url::Url;

use super::{
    child_path, local_file_name, open_http_source, sanitize_api_error, AuthPresenter, AuthState, DriveBackend,
    DriveType, ProviderError,
    oauth2::{OAuth2Manager, OAuthConfig},
};
use crate::download::{DownloadTask, SourceOpener, StreamTransfer};
use crate::node::{MetadataNode, NodeRef};

/// Google Drive API base URL
const DRIVE_API_BASE: &str = "https://www.googleapis.com/drive/v3";
const FOLDER_MIME: &str = "application/vnd.google-apps.folder";
const ROOT_ID: &str = "root";

/// Google Drive file metadata from API
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFile {
    id: String,
    name: String,
    mime_type: String,
    #[serde(default)]
    size: Option<String>,
    modified_time: Option<String>,
}

/// Google Drive file list response
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFileList {
    files: Vec<DriveFile>,
    next_page_token: Option<String>,
}

impl DriveFile {
    fn into_node(self, parent: Option<&NodeRef>) -> NodeRef {
        let path = child_path(parent, &self.name);
        if self.mime_type == FOLDER_MIME {
            MetadataNode::folder(self.id, self.name, path, parent.is_none())
        } else {
            let size = self.size.as_deref().and_then(|s| s.parse().ok());
            MetadataNode::file(self.id, self.name, path, parent.is_none(), size, self.modified_time)
        }
    }
}

/// Google Drive backend
pub struct GoogleDriveBackend {
    oauth: Arc<OAuth2Manager>,
    client: reqwest::Client,
}

impl GoogleDriveBackend {
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

    /// List files in a folder by ID, following page tokens
    async fn list_folder(&self, folder_id: &str) -> Result<Vec<DriveFile>, ProviderError> {
        let query = format!("'{}' in parents and trashed=false", folder_id.replace('\'', "\\'"));
        let mut all_files = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut url = format!(
                "{}/files?q={}&fields=files(id,name,mimeType,size,modifiedTime),nextPageToken&pageSize=1000&orderBy=folder,name",
                DRIVE_API_BASE,
                urlencoding::encode(&query)
            );
            if let Some(ref token) = page_token {
                url.push_str(&format!("&pageToken={}", urlencoding::encode(token)));
            }

            let token = self.oauth.get_valid_token().await?;
            let response = self
                .client
                .get(&url)
                .bearer_auth(token.expose_secret())
                .send()
                .await
                .map_err(|e| ProviderError::NetworkError(e.to_string()))?;

            if !response.status().is_success() {
                let status = response.status();
                let text = response.text().await.unwrap_or_default();
                if status == reqwest::StatusCode::NOT_FOUND {
                    return Err(ProviderError::NotFound(folder_id.to_string()));
                }
                return Err(ProviderError::ServerError(format!(
                    "API error {}: {}",
                    status,
                    sanitize_api_error(&text)
                )));
            }

            let list: DriveFileList = response
                .json()
                .await
                .map_err(|e| ProviderError::ParseError(e.to_string()))?;

            all_files.extend(list.files);

            match list.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        debug!("Listed {} entries in Google Drive folder {}", all_files.len(), folder_id);
        Ok(all_files)
    }
}

#[async_trait]
impl DriveBackend for GoogleDriveBackend {
    fn drive_type(&self) -> DriveType {
        DriveType::GoogleDrive
    }

    async fn authorize(&self, presenter: &dyn AuthPresenter) -> AuthState {
        self.oauth.authorize(presenter).await
    }

    fn handle_redirect(&self, url: &Url) -> bool {
        self.oauth.handle_redirect(url)
    }

    async fn list_children(&self, parent: Option<&NodeRef>) -> Result<Vec<NodeRef>, ProviderError> {
        let folder_id = parent.map(|p| p.file_id.as_str()).unwrap_or(ROOT_ID);
        let files = self.list_folder(folder_id).await?;
        Ok(files.into_iter().map(|f| f.into_node(parent)).collect())
    }

    fn create_download_task(&self, node: &NodeRef, local_dir: &Path) -> DownloadTask {
        let local_path = local_dir.join(local_file_name(&node.name));
        let url = format!("{}/files/{}?alt=media", DRIVE_API_BASE, urlencoding::encode(&node.file_id));
        let client = self.client.clone();
        let oauth = Arc::clone(&self.oauth);

        let opener: SourceOpener = Box::new(move || {
            Box::pin(async move {
                let token = oauth.get_valid_token().await?;
                open_http_source(client.get(&url).bearer_auth(token.expose_secret())).await
            })
        });

        DownloadTask::new(
            node.file_id.clone(),
            DriveType::GoogleDrive,
            node.path.clone(),
            local_path.clone(),
            node.name.clone(),
            Box::new(StreamTransfer::new(opener, local_path, true)),
        )
    }

    fn logout(&self) {
        self.oauth.clear();
        info!("Logged out of Google Drive");
    }
}
