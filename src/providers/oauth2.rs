//! OAuth2 Authentication Module
//!
//! Authorization code flow with PKCE for the cloud drives. The auth URL is
//! handed to an `AuthPresenter`; the flow then waits until the redirect comes
//! back through `handle_redirect`. Tokens live in memory for the lifetime of
//! the backend and are dropped on logout.

use oauth2::{
    basic::BasicClient, AuthUrl, AuthorizationCode, ClientId, ClientSecret,
    CsrfToken, EndpointNotSet, EndpointSet, PkceCodeChallenge, PkceCodeVerifier,
    RedirectUrl, RefreshToken, Scope, TokenResponse, TokenUrl,
};
use secrecy::{ExposeSecret, SecretString};
use std::sync::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use url::Url;

use super::{AuthPresenter, AuthState, DriveType, ProviderError};

/// Configured OAuth2 client with auth and token endpoints set (v5 typestates)
type ConfiguredClient = BasicClient<EndpointSet, EndpointNotSet, EndpointNotSet, EndpointNotSet, EndpointSet>;

/// Error wrapper for the oauth2 HTTP client adapter
#[derive(Debug)]
struct OAuth2TransportError(String);

impl std::fmt::Display for OAuth2TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for OAuth2TransportError {}

/// Async HTTP client adapter for oauth2 v5.
/// oauth2's built-in reqwest support targets reqwest 0.12; this crate uses 0.13.
struct OAuth2HttpClient;

impl<'c> oauth2::AsyncHttpClient<'c> for OAuth2HttpClient {
    type Error = oauth2::HttpClientError<OAuth2TransportError>;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<oauth2::HttpResponse, Self::Error>> + Send + Sync + 'c>,
    >;

    fn call(&'c self, request: oauth2::HttpRequest) -> Self::Future {
        Box::pin(async move {
            let client = reqwest::Client::builder()
                .redirect(reqwest::redirect::Policy::none())
                .build()
                .map_err(|e| oauth2::HttpClientError::Other(e.to_string()))?;

            let method = reqwest::Method::from_bytes(request.method().as_str().as_bytes())
                .unwrap_or(reqwest::Method::POST);
            let url = request.uri().to_string();

            let mut builder = client.request(method, &url);
            for (name, value) in request.headers() {
                builder = builder.header(name.as_str(), value.as_bytes());
            }
            builder = builder.body(request.into_body());

            let response = builder.send().await
                .map_err(|e| oauth2::HttpClientError::Other(e.to_string()))?;

            let status_code = response.status().as_u16();
            let headers = response.headers().clone();
            let body = response.bytes().await
                .map_err(|e| oauth2::HttpClientError::Other(e.to_string()))?;

            let mut http_response = http::Response::builder()
                .status(http::StatusCode::from_u16(status_code).unwrap_or(http::StatusCode::INTERNAL_SERVER_ERROR));
            for (name, value) in headers.iter() {
                http_response = http_response.header(name.as_str(), value.as_bytes());
            }
            http_response
                .body(body.to_vec())
                .map_err(|e| oauth2::HttpClientError::Other(e.to_string()))
        })
    }
}

/// OAuth2 configuration for a drive
#[derive(Debug, Clone)]
pub struct OAuthConfig {
    pub drive_type: DriveType,
    pub client_id: String,
    pub client_secret: Option<String>,
    pub auth_url: String,
    pub token_url: String,
    pub scopes: Vec<String>,
    pub redirect_uri: String,
    /// Extra query parameters for the authorization URL
    pub extra_auth_params: Vec<(String, String)>,
}

impl OAuthConfig {
    /// Google Drive, read-only access
    pub fn google(client_id: &str, client_secret: Option<&str>, port: u16) -> Self {
        Self {
            drive_type: DriveType::GoogleDrive,
            client_id: client_id.to_string(),
            client_secret: client_secret.map(str::to_string),
            auth_url: "https://accounts.google.com/o/oauth2/v2/auth".to_string(),
            token_url: "https://oauth2.googleapis.com/token".to_string(),
            scopes: vec!["https://www.googleapis.com/auth/drive.readonly".to_string()],
            redirect_uri: format!("http://127.0.0.1:{}/callback", port),
            extra_auth_params: vec![("access_type".to_string(), "offline".to_string())],
        }
    }

    /// Dropbox, metadata and content read access
    pub fn dropbox(client_id: &str, client_secret: Option<&str>, port: u16) -> Self {
        Self {
            drive_type: DriveType::Dropbox,
            client_id: client_id.to_string(),
            client_secret: client_secret.map(str::to_string),
            auth_url: "https://www.dropbox.com/oauth2/authorize".to_string(),
            token_url: "https://api.dropboxapi.com/oauth2/token".to_string(),
            scopes: vec![
                "files.metadata.read".to_string(),
                "files.content.read".to_string(),
            ],
            redirect_uri: format!("http://127.0.0.1:{}/callback", port),
            extra_auth_params: vec![("token_access_type".to_string(), "offline".to_string())],
        }
    }
}

/// Tokens held for an authorized drive
#[derive(Debug, Clone)]
pub struct StoredTokens {
    pub access_token: SecretString,
    pub refresh_token: Option<SecretString>,
    /// Unix timestamp
    pub expires_at: Option<i64>,
}

impl StoredTokens {
    /// Check if token is expired (with 5 min buffer)
    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at <= chrono::Utc::now().timestamp() + 300,
            None => false,
        }
    }
}

/// What the redirect carried back to the waiting flow
#[derive(Debug)]
enum RedirectOutcome {
    Code(String),
    Denied,
    Failed(String),
}

struct PendingAuth {
    state: String,
    verifier: PkceCodeVerifier,
    reply: oneshot::Sender<RedirectOutcome>,
}

/// OAuth2 flow and token holder for one drive
pub struct OAuth2Manager {
    config: OAuthConfig,
    tokens: Mutex<Option<StoredTokens>>,
    pending: Mutex<Option<PendingAuth>>,
    /// Verifier of a flow whose code arrived, awaiting token exchange
    exchange: Mutex<Option<PkceCodeVerifier>>,
}

impl OAuth2Manager {
    pub fn new(config: OAuthConfig) -> Self {
        Self {
            config,
            tokens: Mutex::new(None),
            pending: Mutex::new(None),
            exchange: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &OAuthConfig {
        &self.config
    }

    /// Install a long-lived access token, skipping the browser flow
    pub fn seed_access_token(&self, token: &str) {
        *self.lock_tokens() = Some(StoredTokens {
            access_token: SecretString::from(token.to_string()),
            refresh_token: None,
            expires_at: None,
        });
    }

    pub fn has_tokens(&self) -> bool {
        self.lock_tokens().is_some()
    }

    /// Run the authorization flow through `presenter`
    pub async fn authorize(&self, presenter: &dyn AuthPresenter) -> AuthState {
        let existing = self.lock_tokens().clone();
        if let Some(tokens) = existing {
            if !tokens.is_expired() || tokens.refresh_token.is_some() {
                debug!("{} already authorized", self.config.drive_type);
                return AuthState::Success;
            }
        }

        let (auth_url, rx) = match self.start_auth_flow() {
            Ok(started) => started,
            Err(e) => return AuthState::Error(e.to_string()),
        };

        if let Err(e) = presenter.present(&auth_url) {
            self.lock_pending().take();
            return AuthState::Error(e.to_string());
        }

        let outcome = match rx.await {
            Ok(outcome) => outcome,
            // Flow was dropped by logout or replaced by a newer one
            Err(_) => return AuthState::Cancel,
        };

        match outcome {
            RedirectOutcome::Code(code) => match self.complete_auth_flow(&code).await {
                Ok(()) => AuthState::Success,
                Err(e) => AuthState::Error(e.to_string()),
            },
            RedirectOutcome::Denied => {
                info!("Authorization for {} cancelled by user", self.config.drive_type);
                AuthState::Cancel
            }
            RedirectOutcome::Failed(message) => AuthState::Error(message),
        }
    }

    /// Generate the auth URL and park the PKCE verifier until the redirect
    fn start_auth_flow(&self) -> Result<(String, oneshot::Receiver<RedirectOutcome>), ProviderError> {
        let client = self.create_client()?;
        let (pkce_challenge, pkce_verifier) = PkceCodeChallenge::new_random_sha256();

        let (auth_url, csrf_token) = {
            let mut auth_builder = client
                .authorize_url(CsrfToken::new_random)
                .set_pkce_challenge(pkce_challenge);

            for scope in &self.config.scopes {
                auth_builder = auth_builder.add_scope(Scope::new(scope.clone()));
            }

            for (key, value) in &self.config.extra_auth_params {
                auth_builder = auth_builder.add_extra_param(key, value);
            }

            auth_builder.url()
        };

        let (tx, rx) = oneshot::channel();
        let previous = self.lock_pending().replace(PendingAuth {
            state: csrf_token.secret().clone(),
            verifier: pkce_verifier,
            reply: tx,
        });
        if previous.is_some() {
            warn!("Replacing unfinished authorization for {}", self.config.drive_type);
        }

        info!("OAuth2 auth URL generated for {}", self.config.drive_type);
        Ok((auth_url.to_string(), rx))
    }

    /// Route a redirect to the pending flow. Returns false if it is not ours.
    pub fn handle_redirect(&self, url: &Url) -> bool {
        if !self.is_redirect_url(url) {
            return false;
        }
        let Some(pending) = self.lock_pending().take() else {
            debug!("Redirect for {} with no pending authorization", self.config.drive_type);
            return false;
        };

        let mut code = None;
        let mut state = None;
        let mut error = None;
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "code" => code = Some(value.into_owned()),
                "state" => state = Some(value.into_owned()),
                "error" => error = Some(value.into_owned()),
                _ => {}
            }
        }

        let outcome = match (error, code) {
            (Some(err), _) if err == "access_denied" => RedirectOutcome::Denied,
            (Some(err), _) => RedirectOutcome::Failed(format!("OAuth error: {}", err)),
            (None, _) if state.as_deref() != Some(pending.state.as_str()) => {
                RedirectOutcome::Failed("Invalid state token - authorization flow expired or invalid".to_string())
            }
            (None, Some(code)) => {
                *self.lock_verifier_slot() = Some(pending.verifier);
                RedirectOutcome::Code(code)
            }
            (None, None) => RedirectOutcome::Failed("Missing code".to_string()),
        };

        let _ = pending.reply.send(outcome);
        true
    }

    fn is_redirect_url(&self, url: &Url) -> bool {
        let Ok(expected) = Url::parse(&self.config.redirect_uri) else {
            return false;
        };
        url.scheme() == expected.scheme()
            && url.host_str() == expected.host_str()
            && url.path() == expected.path()
            && (expected.port() == Some(0) || url.port_or_known_default() == expected.port_or_known_default())
    }

    /// Exchange the authorization code for tokens
    async fn complete_auth_flow(&self, code: &str) -> Result<(), ProviderError> {
        let verifier = self.lock_verifier_slot().take().ok_or_else(|| {
            ProviderError::AuthenticationFailed("Authorization flow expired".to_string())
        })?;
        let client = self.create_client()?;

        let token_result = client
            .exchange_code(AuthorizationCode::new(code.to_string()))
            .set_pkce_verifier(verifier)
            .request_async(&OAuth2HttpClient)
            .await
            .map_err(|e| ProviderError::AuthenticationFailed(format!("Token exchange failed: {}", e)))?;

        let expires_at = token_result
            .expires_in()
            .map(|d| chrono::Utc::now().timestamp() + d.as_secs() as i64);

        *self.lock_tokens() = Some(StoredTokens {
            access_token: SecretString::from(token_result.access_token().secret().clone()),
            refresh_token: token_result.refresh_token().map(|t| SecretString::from(t.secret().clone())),
            expires_at,
        });

        info!("OAuth2 tokens obtained for {}", self.config.drive_type);
        Ok(())
    }

    /// Refresh access token using refresh token
    async fn refresh_tokens(&self, refresh_token: &SecretString) -> Result<StoredTokens, ProviderError> {
        let client = self.create_client()?;

        let token_result = client
            .exchange_refresh_token(&RefreshToken::new(refresh_token.expose_secret().to_string()))
            .request_async(&OAuth2HttpClient)
            .await
            .map_err(|e| ProviderError::AuthenticationFailed(format!("Token refresh failed: {}", e)))?;

        let expires_at = token_result
            .expires_in()
            .map(|d| chrono::Utc::now().timestamp() + d.as_secs() as i64);

        let tokens = StoredTokens {
            access_token: SecretString::from(token_result.access_token().secret().clone()),
            // Keep old refresh token if not returned
            refresh_token: token_result
                .refresh_token()
                .map(|t| SecretString::from(t.secret().clone()))
                .or_else(|| Some(refresh_token.clone())),
            expires_at,
        };
        *self.lock_tokens() = Some(tokens.clone());

        info!("OAuth2 tokens refreshed for {}", self.config.drive_type);
        Ok(tokens)
    }

    /// Get valid access token (refreshing if needed)
    pub async fn get_valid_token(&self) -> Result<SecretString, ProviderError> {
        let tokens = self.lock_tokens().clone().ok_or_else(|| {
            ProviderError::AuthenticationFailed(format!("Not authorized with {}", self.config.drive_type))
        })?;

        if !tokens.is_expired() {
            return Ok(tokens.access_token);
        }
        match tokens.refresh_token {
            Some(ref refresh_token) => Ok(self.refresh_tokens(refresh_token).await?.access_token),
            None => Err(ProviderError::AuthenticationFailed(
                "Token expired and no refresh token available".to_string(),
            )),
        }
    }

    /// Drop tokens and abandon any unfinished flow
    pub fn clear(&self) {
        self.lock_tokens().take();
        self.lock_pending().take();
        self.lock_verifier_slot().take();
        info!("Tokens cleared for {}", self.config.drive_type);
    }

    /// Create OAuth2 client from config (v5 builder API)
    fn create_client(&self) -> Result<ConfiguredClient, ProviderError> {
        let config = &self.config;
        let client_id = ClientId::new(config.client_id.clone());

        let auth_url = AuthUrl::new(config.auth_url.clone())
            .map_err(|e| ProviderError::InvalidConfig(format!("Invalid auth URL: {}", e)))?;

        let token_url = TokenUrl::new(config.token_url.clone())
            .map_err(|e| ProviderError::InvalidConfig(format!("Invalid token URL: {}", e)))?;

        let redirect_url = RedirectUrl::new(config.redirect_uri.clone())
            .map_err(|e| ProviderError::InvalidConfig(format!("Invalid redirect URL: {}", e)))?;

        let mut client = BasicClient::new(client_id)
            .set_auth_uri(auth_url)
            .set_token_uri(token_url)
            .set_redirect_uri(redirect_url);

        if let Some(ref secret) = config.client_secret {
            client = client.set_client_secret(ClientSecret::new(secret.clone()));
        }

        Ok(client)
    }

    fn lock_tokens(&self) -> std::sync::MutexGuard<'_, Option<StoredTokens>> {
        self.tokens.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, Option<PendingAuth>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_verifier_slot(&self) -> std::sync::MutexGuard<'_, Option<PkceCodeVerifier>> {
        self.exchange.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Bind the OAuth2 callback listener (0 = ephemeral port).
/// Returns the listener and the actual port assigned by the OS.
pub async fn bind_callback_listener(port: u16) -> Result<(TcpListener, u16), ProviderError> {
    let listener = TcpListener::bind(format!("127.0.0.1:{}", port))
        .await
        .map_err(|e| ProviderError::Other(format!("Failed to bind callback server on port {}: {}", port, e)))?;

    let actual_port = listener
        .local_addr()
        .map(|a| a.port())
        .map_err(|e| ProviderError::Other(format!("Failed to get local port: {}", e)))?;

    info!("OAuth callback listener bound on port {}", actual_port);
    Ok((listener, actual_port))
}

/// Wait for one redirect on an already-bound listener and return its full URL
pub async fn wait_for_redirect(listener: TcpListener) -> Result<Url, ProviderError> {
    let port = listener
        .local_addr()
        .map(|a| a.port())
        .map_err(|e| ProviderError::Other(format!("Failed to get local port: {}", e)))?;

    let (mut socket, _) = listener
        .accept()
        .await
        .map_err(|e| ProviderError::Other(format!("Failed to accept connection: {}", e)))?;

    let mut buffer = vec![0u8; 4096];
    let n = socket
        .read(&mut buffer)
        .await
        .map_err(|e| ProviderError::Other(format!("Failed to read request: {}", e)))?;

    let request = String::from_utf8_lossy(&buffer[..n]);
    let url = parse_redirect_request(&request, port)?;

    let response = "HTTP/1.1 200 OK\r\n\
        Content-Type: text/html; charset=utf-8\r\n\
        Connection: close\r\n\r\n\
        <!DOCTYPE html><html><head><meta charset=\"utf-8\"><title>CloudDrive</title></head>\
        <body><h1>Authorization received</h1><p>You can close this window.</p></body></html>";

    socket
        .write_all(response.as_bytes())
        .await
        .map_err(|e| ProviderError::Other(format!("Failed to send response: {}", e)))?;

    Ok(url)
}

/// Rebuild the redirect URL from the request line: `GET /callback?code=x HTTP/1.1`
fn parse_redirect_request(request: &str, port: u16) -> Result<Url, ProviderError> {
    let first_line = request
        .lines()
        .next()
        .ok_or_else(|| ProviderError::AuthenticationFailed("Empty request".to_string()))?;

    let target = first_line
        .split_whitespace()
        .nth(1)
        .ok_or_else(|| ProviderError::AuthenticationFailed("Invalid request format".to_string()))?;

    Url::parse(&format!("http://127.0.0.1:{}{}", port, target))
        .map_err(|e| ProviderError::AuthenticationFailed(format!("Invalid redirect: {}", e)))
}
