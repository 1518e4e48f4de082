use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Cached profile of the logged-in user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[cfg_attr(feature = "ts", ts(export))]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    #[serde(alias = "_id")]
    pub id: String,
    pub username: String,
    pub email: String,
    #[serde(default, alias = "avatar", skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

/// Fresh credentials minted by a refresh exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
}

/// A complete session: both tokens and the cached user.
///
/// Writers only accept this type, so a partial session cannot be stored.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionData {
    pub access_token: String,
    pub refresh_token: String,
    pub user: UserProfile,
}

impl SessionData {
    pub fn with_tokens(&self, pair: TokenPair) -> Self {
        Self {
            access_token: pair.access_token,
            refresh_token: pair.refresh_token,
            user: self.user.clone(),
        }
    }
}

// Tokens never reach the logs.
impl std::fmt::Debug for SessionData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionData")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .field("user", &self.user)
            .finish()
    }
}

/// Whatever durable storage currently holds. Any field may be missing.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct StoredSession {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub user: Option<UserProfile>,
}

impl StoredSession {
    pub fn is_empty(&self) -> bool {
        self.access_token.is_none() && self.refresh_token.is_none() && self.user.is_none()
    }

    pub fn is_complete(&self) -> bool {
        self.access_token.is_some() && self.refresh_token.is_some() && self.user.is_some()
    }

    pub fn complete(self) -> Option<SessionData> {
        match (self.access_token, self.refresh_token, self.user) {
            (Some(access_token), Some(refresh_token), Some(user)) => Some(SessionData {
                access_token,
                refresh_token,
                user,
            }),
            _ => None,
        }
    }
}

impl From<SessionData> for StoredSession {
    fn from(data: SessionData) -> Self {
        Self {
            access_token: Some(data.access_token),
            refresh_token: Some(data.refresh_token),
            user: Some(data.user),
        }
    }
}

impl std::fmt::Debug for StoredSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoredSession")
            .field("has_access_token", &self.access_token.is_some())
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("user", &self.user)
            .finish()
    }
}

/// Lifecycle notifications broadcast to every subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    LoggedIn(UserProfile),
    Refreshed,
    ProfileUpdated(UserProfile),
    LoggedOut,
    /// The session was torn down without the user asking for it.
    Invalidated {
        reason: String,
        at: DateTime<Utc>,
    },
}

/// Fields a profile edit may change. `None` leaves the field as is.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[cfg_attr(feature = "ts", ts(export))]
pub struct ProfileChanges {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(rename = "avatar", skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

impl ProfileChanges {
    pub fn is_empty(&self) -> bool {
        self.username.is_none() && self.avatar_url.is_none()
    }

    /// Keep only the fields that differ from `user`.
    pub fn diff_against(self, user: &UserProfile) -> Self {
        Self {
            username: self.username.filter(|name| *name != user.username),
            avatar_url: self
                .avatar_url
                .filter(|avatar| user.avatar_url.as_deref() != Some(avatar.as_str())),
        }
    }

    pub fn apply_to(&self, user: &mut UserProfile) {
        if let Some(ref username) = self.username {
            user.username = username.clone();
        }
        if let Some(ref avatar) = self.avatar_url {
            user.avatar_url = Some(avatar.clone());
        }
    }
}

/// Sign-up form payload.
#[derive(Clone, Serialize)]
pub struct NewAccount {
    pub username: String,
    pub email: String,
    pub password: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

impl std::fmt::Debug for NewAccount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NewAccount")
            .field("username", &self.username)
            .field("email", &self.email)
            .field("avatar", &self.avatar)
            .finish_non_exhaustive()
    }
}

/// `POST /auth/login` response.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct LoginResponse {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(alias = "_id")]
    pub id: String,
    pub username: String,
    pub email: String,
    #[serde(default)]
    pub avatar: Option<String>,
}

impl LoginResponse {
    pub fn into_session(self) -> SessionData {
        SessionData {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            user: UserProfile {
                id: self.id,
                username: self.username,
                email: self.email,
                avatar_url: self.avatar.filter(|a| !a.is_empty()),
            },
        }
    }
}
