//! Authentication module for managing the user session.
//!
//! This module provides:
//! - `CredentialStore`: durable storage of the token pair and cached user
//! - `SessionManager`: login, logout and profile updates for front-end code
//!
//! The session survives restarts until logout or a failed token refresh.

pub mod credentials;
pub mod manager;
pub mod session;

pub use credentials::{CredentialStore, FileBackend, KeyringBackend, SessionBackend, StoreError};
pub use manager::{AuthError, SessionManager};
pub use session::{
    NewAccount, ProfileChanges, SessionData, SessionEvent, StoredSession, TokenPair, UserProfile,
};
