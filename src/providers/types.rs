//! Shared types for drive backends
//!
//! This module contains the types shared by every drive backend: the drive
//! type tag, authorization outcome and the backend error type.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Supported drive backend types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriveType {
    /// Dropbox (OAuth2)
    Dropbox,
    /// Google Drive (OAuth2)
    GoogleDrive,
    /// A local directory served as a drive
    Local,
}

impl fmt::Display for DriveType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriveType::Dropbox => write!(f, "Dropbox"),
            DriveType::GoogleDrive => write!(f, "Google Drive"),
            DriveType::Local => write!(f, "Local"),
        }
    }
}

impl DriveType {
    /// Stable identity string of the drive type
    pub fn as_str(&self) -> &'static str {
        match self {
            DriveType::Dropbox => "DropBox",
            DriveType::GoogleDrive => "GoogleDrive",
            DriveType::Local => "Local",
        }
    }

    /// Check if this drive requires OAuth2 authorization
    pub fn requires_oauth2(&self) -> bool {
        matches!(self, DriveType::Dropbox | DriveType::GoogleDrive)
    }

    /// All drive types that can be selected
    pub fn all() -> [DriveType; 3] {
        [DriveType::Dropbox, DriveType::GoogleDrive, DriveType::Local]
    }
}

impl FromStr for DriveType {
    type Err = ProviderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "dropbox" => Ok(DriveType::Dropbox),
            "googledrive" | "google_drive" | "gdrive" | "google" => Ok(DriveType::GoogleDrive),
            "local" => Ok(DriveType::Local),
            other => Err(ProviderError::NotSupported(format!("Unknown drive type: {}", other))),
        }
    }
}

/// Outcome of an authorization attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthState {
    Success,
    Cancel,
    Error(String),
}

impl AuthState {
    pub fn is_success(&self) -> bool {
        matches!(self, AuthState::Success)
    }
}

/// Backend error type
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Not connected to drive")]
    NotConnected,

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Path not found: {0}")]
    NotFound(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Operation not supported: {0}")]
    NotSupported(String),

    #[error("Transfer failed: {0}")]
    TransferFailed(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl ProviderError {
    /// Check if this error is transient. The core never retries on its own,
    /// callers may re-initiate.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ProviderError::NetworkError(_) | ProviderError::NotConnected
        )
    }
}

/// Trim an API error body to something safe to show and log
pub fn sanitize_api_error(body: &str) -> String {
    const MAX_LEN: usize = 300;
    let trimmed = body.trim();
    if trimmed.chars().count() <= MAX_LEN {
        return trimmed.to_string();
    }
    let cut: String = trimmed.chars().take(MAX_LEN).collect();
    format!("{}...", cut)
}
