//! Core library for the FitSocial client.
//!
//! - `auth`: credential store, session model, and the `SessionManager` facade
//! - `api`: request types, HTTP transport, the refreshing `Gateway`, endpoints
//! - `models`: payload types for posts, comments, likes, chat and uploads
//! - `config`: on-disk configuration and data directory resolution

pub mod api;
pub mod auth;
pub mod config;
pub mod models;

#[cfg(test)]
pub(crate) mod testing;

pub use api::{ApiError, ApiRequest, ApiResponse, Gateway, GatewaySettings, HttpTransport, Transport};
pub use auth::{
    AuthError, CredentialStore, NewAccount, ProfileChanges, SessionData, SessionEvent,
    SessionManager, StoreError, StoredSession, TokenPair, UserProfile,
};
pub use config::{Config, StorageKind};
