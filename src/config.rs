// CloudDrive Configuration Module
// Persistent drive configuration storage with environment overrides

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::providers::DriveType;

/// Default port of the local OAuth2 redirect listener
pub const DEFAULT_REDIRECT_PORT: u16 = 53682;

/// OAuth2 application registration for one cloud drive
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct OAuthAppConfig {
    /// OAuth2 client id (Dropbox: app key)
    pub client_id: String,
    /// OAuth2 client secret; PKCE-only apps leave it unset
    #[serde(default)]
    pub client_secret: Option<String>,
    /// Pre-issued access token that skips the browser flow
    #[serde(default)]
    pub access_token: Option<String>,
}

/// Drive configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DriveConfig {
    /// Where downloads land when no directory is given
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
    /// Evict tasks from the registry as soon as they finish
    #[serde(default)]
    pub auto_clean: bool,
    /// Port of the local OAuth2 redirect listener
    #[serde(default = "default_redirect_port")]
    pub oauth_redirect_port: u16,
    #[serde(default)]
    pub google_drive: Option<OAuthAppConfig>,
    #[serde(default)]
    pub dropbox: Option<OAuthAppConfig>,
    /// Directory served by the local drive
    #[serde(default)]
    pub local_root: Option<PathBuf>,
}

fn default_download_dir() -> PathBuf {
    dirs::download_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("CloudDrive")
}

fn default_redirect_port() -> u16 {
    DEFAULT_REDIRECT_PORT
}

impl Default for DriveConfig {
    fn default() -> Self {
        Self {
            download_dir: default_download_dir(),
            auto_clean: false,
            oauth_redirect_port: DEFAULT_REDIRECT_PORT,
            google_drive: None,
            dropbox: None,
            local_root: None,
        }
    }
}

impl DriveConfig {
    /// Whether the factory has what it needs to build `drive_type`
    pub fn is_configured(&self, drive_type: DriveType) -> bool {
        match drive_type {
            DriveType::GoogleDrive => self.google_drive.is_some(),
            DriveType::Dropbox => self.dropbox.is_some(),
            DriveType::Local => self.local_root.is_some(),
        }
    }
}

/// Get the path to the config file
pub fn get_config_path() -> PathBuf {
    let config_dir = dirs::config_dir()
        .unwrap_or_else(|| dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")));
    config_dir.join("clouddrive").join("config.json")
}

/// Load configuration from the default location
pub fn load_config() -> DriveConfig {
    load_config_from(&get_config_path())
}

/// Load configuration from `path`, falling back to defaults
pub fn load_config_from(path: &Path) -> DriveConfig {
    if path.exists() {
        match fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(config) => return config,
                Err(e) => {
                    tracing::warn!("Failed to parse drive config: {}", e);
                }
            },
            Err(e) => {
                tracing::warn!("Failed to read drive config: {}", e);
            }
        }
    }

    DriveConfig::default()
}

/// Save configuration to `path`
pub fn save_config(config: &DriveConfig, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
    }

    let content = serde_json::to_string_pretty(config)
        .map_err(|e| format!("Failed to serialize config: {}", e))?;

    fs::write(path, content)
        .map_err(|e| format!("Failed to write config: {}", e))?;

    tracing::info!("Drive config saved to {:?}", path);
    Ok(())
}

/// Validate configuration
pub fn validate_config(config: &DriveConfig) -> Result<(), String> {
    if config.download_dir.as_os_str().is_empty() {
        return Err("Download directory cannot be empty".to_string());
    }

    if config.oauth_redirect_port == 0 {
        return Err("OAuth redirect port cannot be 0".to_string());
    }

    for (name, app) in [("Google Drive", &config.google_drive), ("Dropbox", &config.dropbox)] {
        if let Some(app) = app {
            if app.client_id.trim().is_empty() {
                return Err(format!("{} requires a client_id", name));
            }
        }
    }

    if let Some(root) = &config.local_root {
        if !root.is_dir() {
            return Err(format!("Local root {:?} is not a directory", root));
        }
    }

    Ok(())
}

/// Apply `CLOUDDRIVE_*` environment variables on top of `config`
pub fn apply_env_overrides(config: &mut DriveConfig) {
    apply_overrides(config, |key| std::env::var(key).ok().filter(|v| !v.is_empty()));
}

fn apply_overrides(config: &mut DriveConfig, lookup: impl Fn(&str) -> Option<String>) {
    fn app_entry(
        slot: &mut Option<OAuthAppConfig>,
        id: Option<String>,
        secret: Option<String>,
        token: Option<String>,
    ) {
        if id.is_none() && secret.is_none() && token.is_none() {
            return;
        }
        let app = slot.get_or_insert_with(OAuthAppConfig::default);
        if let Some(id) = id {
            app.client_id = id;
        }
        if secret.is_some() {
            app.client_secret = secret;
        }
        if token.is_some() {
            app.access_token = token;
        }
    }

    app_entry(
        &mut config.google_drive,
        lookup("CLOUDDRIVE_GOOGLE_CLIENT_ID"),
        lookup("CLOUDDRIVE_GOOGLE_CLIENT_SECRET"),
        lookup("CLOUDDRIVE_GOOGLE_TOKEN"),
    );
    app_entry(
        &mut config.dropbox,
        lookup("CLOUDDRIVE_DROPBOX_APP_KEY"),
        lookup("CLOUDDRIVE_DROPBOX_APP_SECRET"),
        lookup("CLOUDDRIVE_DROPBOX_TOKEN"),
    );
    if let Some(root) = lookup("CLOUDDRIVE_LOCAL_ROOT") {
        config.local_root = Some(PathBuf::from(root));
    }
    if let Some(dir) = lookup("CLOUDDRIVE_DOWNLOAD_DIR") {
        config.download_dir = PathBuf::from(dir);
    }
}
