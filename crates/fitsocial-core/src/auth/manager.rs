//! Session facade used by front-end code.
//!
//! `SessionManager` owns the credential store and the gateway. Login and
//! logout go straight to the transport; everything else goes through the
//! gateway's refresh protocol.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::credentials::CredentialStore;
use super::session::{LoginResponse, NewAccount, ProfileChanges, SessionEvent, UserProfile};
use crate::api::{ApiError, ApiRequest, Gateway, GatewaySettings, HttpTransport, Transport};
use crate::config::Config;

pub const LOGIN_PATH: &str = "/auth/login";
pub const REGISTER_PATH: &str = "/auth/register";
pub const PROFILE_PATH: &str = "/auth/user";

const DEFAULT_LOGIN_ERROR: &str = "Invalid email or password";
const DEFAULT_REGISTER_ERROR: &str = "Registration failed";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("{0}")]
    InvalidCredentials(String),

    #[error("Not logged in")]
    NotAuthenticated,

    #[error("Unable to connect to server: {0}")]
    Network(String),

    #[error(transparent)]
    Api(#[from] ApiError),
}

impl AuthError {
    fn from_transport(e: ApiError) -> Self {
        match e {
            ApiError::Network(message) => AuthError::Network(message),
            other => AuthError::Api(other),
        }
    }
}

pub struct SessionManager {
    store: Arc<CredentialStore>,
    gateway: Gateway,
    restored: bool,
}

impl SessionManager {
    /// Build the HTTP transport and credential store described by `config`.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let transport = HttpTransport::with_timeout(&config.api_base_url, config.request_timeout())?;
        let store = CredentialStore::from_config(config)?;
        Ok(Self::new(
            Arc::new(store),
            Arc::new(transport),
            config.gateway_settings(),
        ))
    }

    /// Wire the facade together and restore whatever session the store holds.
    ///
    /// A partial session is cleared here, before anything can act on it.
    pub fn new(
        store: Arc<CredentialStore>,
        transport: Arc<dyn Transport>,
        settings: GatewaySettings,
    ) -> Self {
        let stored = store.read();
        let restored = if stored.is_complete() {
            info!(user = ?stored.user.as_ref().map(|u| &u.username), "Session restored");
            true
        } else {
            if !stored.is_empty() {
                warn!(?stored, "Stored session is incomplete, clearing it");
                store.clear();
            }
            false
        };

        let gateway = Gateway::new(transport, Arc::clone(&store), settings);
        Self {
            store,
            gateway,
            restored,
        }
    }

    pub fn gateway(&self) -> &Gateway {
        &self.gateway
    }

    pub fn store(&self) -> &CredentialStore {
        &self.store
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.gateway.subscribe()
    }

    /// Whether construction found a complete stored session.
    pub fn was_restored(&self) -> bool {
        self.restored
    }

    pub fn current_user(&self) -> Option<UserProfile> {
        self.store.read().user
    }

    pub fn is_authenticated(&self) -> bool {
        self.store.read().is_complete()
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<UserProfile, AuthError> {
        if email.is_empty() || password.is_empty() {
            return Err(AuthError::InvalidCredentials(
                "Email and password required".to_string(),
            ));
        }

        let request = ApiRequest::post(LOGIN_PATH)
            .json(&serde_json::json!({ "email": email, "password": password }))?;
        let response = self
            .gateway
            .send_plain(request)
            .await
            .map_err(AuthError::from_transport)?;

        if response.status.is_client_error() {
            let message = response
                .message()
                .unwrap_or_else(|| DEFAULT_LOGIN_ERROR.to_string());
            warn!(status = response.status.as_u16(), "Login rejected");
            return Err(AuthError::InvalidCredentials(message));
        }

        let session = response.error_for_status()?.json::<LoginResponse>()?.into_session();
        let user = session.user.clone();
        self.store.write(session);

        info!(user = %user.username, "Login successful");
        self.gateway.emit(SessionEvent::LoggedIn(user.clone()));
        Ok(user)
    }

    /// Create an account. Does not log in.
    pub async fn register(&self, account: &NewAccount) -> Result<UserProfile, AuthError> {
        let request = ApiRequest::post(REGISTER_PATH).json(account)?;
        let response = self
            .gateway
            .send_plain(request)
            .await
            .map_err(AuthError::from_transport)?;

        if response.status.is_client_error() {
            let message = response
                .message()
                .unwrap_or_else(|| DEFAULT_REGISTER_ERROR.to_string());
            return Err(AuthError::InvalidCredentials(message));
        }

        let user = response.error_for_status()?.json::<UserProfile>()?;
        info!(user = %user.username, "Account registered");
        Ok(user)
    }

    /// Revoke the refresh token server-side if possible, then clear locally.
    pub async fn logout(&self) {
        if let Some(refresh_token) = self.store.read().refresh_token {
            match self.gateway.revoke(&refresh_token).await {
                Ok(()) => debug!("Server-side session revoked"),
                Err(e) => warn!(error = %e, "Server-side logout failed, clearing local session anyway"),
            }
        }

        self.store.clear();
        info!("Logged out");
        self.gateway.emit(SessionEvent::LoggedOut);
    }

    /// Merge `changes` into the cached user. Tokens are left untouched.
    pub fn update_profile(&self, changes: ProfileChanges) -> Result<UserProfile, AuthError> {
        let user = self
            .store
            .update_user(|user| changes.apply_to(user))
            .ok_or(AuthError::NotAuthenticated)?;
        debug!(user = %user.username, "Cached profile updated");
        self.gateway.emit(SessionEvent::ProfileUpdated(user.clone()));
        Ok(user)
    }

    /// Send a profile edit to the server, then cache what it answered.
    pub async fn save_profile(&self, changes: ProfileChanges) -> Result<UserProfile, AuthError> {
        let current = self.current_user().ok_or(AuthError::NotAuthenticated)?;
        let changes = changes.diff_against(&current);
        if changes.is_empty() {
            debug!("No profile changes to save");
            return Ok(current);
        }

        let saved: UserProfile = self.gateway.put_json(PROFILE_PATH, &changes).await?;
        self.update_profile(ProfileChanges {
            username: Some(saved.username),
            avatar_url: saved.avatar_url,
        })
    }

    /// Upload an avatar image, returning the path to store on the profile.
    pub async fn upload_avatar(
        &self,
        file_name: &str,
        content_type: &str,
        data: Vec<u8>,
    ) -> Result<String, AuthError> {
        let uploaded = self.gateway.upload_file(file_name, content_type, data).await?;
        Ok(uploaded.path())
    }
}
