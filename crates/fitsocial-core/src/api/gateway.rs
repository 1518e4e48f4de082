//! Authenticated request gateway.
//!
//! Every authenticated call goes through `Gateway::call`, which attaches the
//! current access token and handles 401 responses with a shared refresh:
//!
//! 1. The first call to see a 401 while the session is valid opens a refresh
//!    episode and spawns the refresh exchange.
//! 2. Calls that see a 401 while the episode is open join its queue.
//! 3. When the exchange settles, the store is updated (or cleared) first, then
//!    the episode is closed and every queued call is released with the outcome.
//! 4. Each released call retries once. A retry that is rejected again
//!    invalidates the session instead of refreshing a second time.
//!
//! Store updates and invalidation are keyed on the refresh token of the
//! session they belong to. A late refresh or retry never touches a session
//! that replaced it in the meantime.
//!
//! The refresh runs in its own task, so cancelling or dropping the call that
//! opened an episode never cancels the exchange the other callers wait on.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info, warn};

use super::request::{ApiRequest, ApiResponse};
use super::transport::Transport;
use super::ApiError;
use crate::auth::{CredentialStore, SessionEvent, TokenPair};

pub const REFRESH_PATH: &str = "/auth/refresh";
pub const LOGOUT_PATH: &str = "/auth/logout";

/// Default bound on one refresh exchange.
const REFRESH_TIMEOUT_SECS: u64 = 10;

/// Default bound on the best-effort server-side logout.
const LOGOUT_TIMEOUT_SECS: u64 = 5;

/// Buffer size for the session event channel.
/// Events are rare lifecycle transitions, 16 leaves plenty of headroom.
const EVENT_BUFFER_SIZE: usize = 16;

#[derive(Debug, Clone, Copy)]
pub struct GatewaySettings {
    pub refresh_timeout: Duration,
    pub logout_timeout: Duration,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            refresh_timeout: Duration::from_secs(REFRESH_TIMEOUT_SECS),
            logout_timeout: Duration::from_secs(LOGOUT_TIMEOUT_SECS),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
enum RefreshFailure {
    #[error("refresh rejected with status {0}")]
    Rejected(StatusCode),

    #[error("refresh response was malformed: {0}")]
    Malformed(String),

    #[error("refresh failed: {0}")]
    Network(String),

    #[error("refresh timed out")]
    TimedOut,

    #[error("session ended while refreshing")]
    SessionGone,
}

/// The rotated pair on success.
type RefreshOutcome = Result<TokenPair, RefreshFailure>;

struct Waiter {
    ticket: u64,
    tx: oneshot::Sender<RefreshOutcome>,
}

/// The single in-flight refresh and the callers waiting on it.
struct PendingRefresh {
    episode: u64,
    waiters: Vec<Waiter>,
}

#[derive(Default)]
struct Coordinator {
    pending: Option<PendingRefresh>,
    next_ticket: u64,
    episodes: u64,
}

/// How a call that saw a 401 proceeds.
enum Admission<'a> {
    Queued(QueueTicket<'a>),
    /// The token changed while the call was in flight; retry with this pair.
    Rotated(TokenPair),
    NoSession,
}

/// A place in a refresh queue. Dropping it leaves the queue.
struct QueueTicket<'a> {
    inner: &'a Inner,
    ticket: u64,
    episode: u64,
    rx: oneshot::Receiver<RefreshOutcome>,
}

impl QueueTicket<'_> {
    async fn wait(&mut self) -> RefreshOutcome {
        match (&mut self.rx).await {
            Ok(outcome) => outcome,
            Err(_) => Err(RefreshFailure::Network("refresh task ended without an outcome".to_string())),
        }
    }
}

impl Drop for QueueTicket<'_> {
    fn drop(&mut self) {
        let mut coordinator = self.inner.coordinator();
        if let Some(pending) = coordinator.pending.as_mut() {
            let before = pending.waiters.len();
            pending.waiters.retain(|w| w.ticket != self.ticket);
            if pending.waiters.len() < before {
                debug!(episode = self.episode, ticket = self.ticket, "Left refresh queue");
            }
        }
    }
}

struct Inner {
    transport: Arc<dyn Transport>,
    store: Arc<CredentialStore>,
    settings: GatewaySettings,
    coordinator: Mutex<Coordinator>,
    events: broadcast::Sender<SessionEvent>,
}

impl Inner {
    fn coordinator(&self) -> MutexGuard<'_, Coordinator> {
        self.coordinator.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    async fn exchange(&self, refresh_token: &str) -> Result<TokenPair, RefreshFailure> {
        let request = ApiRequest::post(REFRESH_PATH)
            .json(&serde_json::json!({ "refreshToken": refresh_token }))
            .map_err(|e| RefreshFailure::Malformed(e.to_string()))?;

        let response = self
            .transport
            .send(request)
            .await
            .map_err(|e| RefreshFailure::Network(e.to_string()))?;

        if !response.status.is_success() {
            return Err(RefreshFailure::Rejected(response.status));
        }

        response
            .json::<TokenPair>()
            .map_err(|e| RefreshFailure::Malformed(e.to_string()))
    }

    /// Exchange `refresh_token` and settle the episode.
    ///
    /// Only the session holding `refresh_token` is updated or invalidated.
    async fn run_refresh(self: Arc<Self>, episode: u64, refresh_token: String) {
        let exchanged = match tokio::time::timeout(
            self.settings.refresh_timeout,
            self.exchange(&refresh_token),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(RefreshFailure::TimedOut),
        };

        let outcome = match exchanged {
            Ok(pair) => {
                if self.store.replace_tokens(&refresh_token, pair.clone()) {
                    info!(episode, "Token refresh succeeded");
                    self.emit(SessionEvent::Refreshed);
                    Ok(pair)
                } else {
                    // Nobody holds the rotated pair now.
                    self.spawn_revoke(pair.refresh_token);
                    Err(RefreshFailure::SessionGone)
                }
            }
            Err(failure) => Err(failure),
        };

        if let Err(ref failure) = outcome {
            warn!(episode, reason = %failure, "Token refresh failed");
            self.invalidate(&refresh_token, failure.to_string());
        }

        let waiters = {
            let mut coordinator = self.coordinator();
            match coordinator.pending.take() {
                Some(pending) if pending.episode == episode => pending.waiters,
                other => {
                    coordinator.pending = other;
                    Vec::new()
                }
            }
        };

        debug!(episode, released = waiters.len(), "Refresh episode closed");
        for waiter in waiters {
            // A receiver that is gone was cancelled after the drain.
            let _ = waiter.tx.send(outcome.clone());
        }
    }

    /// Tear down the session holding `refresh_token`: clear it locally,
    /// revoke it server-side and tell subscribers.
    ///
    /// Does nothing if the store already holds another session or none.
    fn invalidate(self: &Arc<Self>, refresh_token: &str, reason: String) {
        if self.store.clear_if(refresh_token).is_none() {
            debug!(reason = %reason, "Session already cleared or replaced");
            return;
        }

        warn!(reason = %reason, "Session invalidated");
        self.spawn_revoke(refresh_token.to_string());
        self.emit(SessionEvent::Invalidated {
            reason,
            at: Utc::now(),
        });
    }

    /// Best-effort server-side revoke that nobody waits on.
    fn spawn_revoke(self: &Arc<Self>, refresh_token: String) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = inner.revoke(&refresh_token).await {
                debug!(error = %e, "Background revoke failed");
            }
        });
    }

    async fn revoke(&self, refresh_token: &str) -> Result<(), ApiError> {
        let request = ApiRequest::post(LOGOUT_PATH)
            .json(&serde_json::json!({ "refreshToken": refresh_token }))?;

        match tokio::time::timeout(self.settings.logout_timeout, self.transport.send(request)).await {
            Ok(response) => response?.error_for_status().map(|_| ()),
            Err(_) => Err(ApiError::Network("logout request timed out".to_string())),
        }
    }
}

/// Single entry point for authenticated API calls.
#[derive(Clone)]
pub struct Gateway {
    inner: Arc<Inner>,
}

impl Gateway {
    pub fn new(
        transport: Arc<dyn Transport>,
        store: Arc<CredentialStore>,
        settings: GatewaySettings,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER_SIZE);
        Self {
            inner: Arc::new(Inner {
                transport,
                store,
                settings,
                coordinator: Mutex::new(Coordinator::default()),
                events,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    pub(crate) fn emit(&self, event: SessionEvent) {
        self.inner.emit(event);
    }

    pub fn settings(&self) -> GatewaySettings {
        self.inner.settings
    }

    /// Whether a refresh exchange is in flight.
    pub fn refresh_pending(&self) -> bool {
        self.inner.coordinator().pending.is_some()
    }

    /// Calls currently waiting on the in-flight refresh.
    pub fn queued_requests(&self) -> usize {
        self.inner
            .coordinator()
            .pending
            .as_ref()
            .map(|p| p.waiters.len())
            .unwrap_or(0)
    }

    /// Send an authenticated request, refreshing the session on a 401.
    pub async fn call(&self, request: ApiRequest) -> Result<ApiResponse, ApiError> {
        cancellable(&request, self.dispatch(&request)).await
    }

    /// One round trip without a bearer token or the refresh protocol.
    pub async fn send_plain(&self, request: ApiRequest) -> Result<ApiResponse, ApiError> {
        let request = request.with_bearer(None)?;
        cancellable(&request, self.inner.transport.send(request.clone())).await
    }

    /// Ask the server to revoke a refresh token, bounded by the logout timeout.
    pub(crate) async fn revoke(&self, refresh_token: &str) -> Result<(), ApiError> {
        self.inner.revoke(refresh_token).await
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.call(ApiRequest::get(path)).await?.json()
    }

    pub async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T, ApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.call(ApiRequest::post(path).json(body)?).await?.json()
    }

    pub async fn put_json<B, T>(&self, path: &str, body: &B) -> Result<T, ApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.call(ApiRequest::put(path).json(body)?).await?.json()
    }

    pub async fn delete(&self, path: &str) -> Result<(), ApiError> {
        self.call(ApiRequest::delete(path)).await.map(|_| ())
    }

    async fn send_with(&self, request: &ApiRequest, token: Option<&str>) -> Result<ApiResponse, ApiError> {
        self.inner.transport.send(request.with_bearer(token)?).await
    }

    async fn dispatch(&self, request: &ApiRequest) -> Result<ApiResponse, ApiError> {
        let sent_token = self.inner.store.access_token();
        let response = self.send_with(request, sent_token.as_deref()).await?;
        if !response.is_auth_failure() {
            return response.error_for_status();
        }

        let pair = match self.admit(sent_token.as_deref()) {
            Admission::NoSession => {
                debug!(path = %request.path, "Authorization failure without a session");
                return Err(ApiError::Unauthorized);
            }
            Admission::Rotated(pair) => {
                debug!(path = %request.path, "Token rotated while request was in flight");
                pair
            }
            Admission::Queued(mut ticket) => match ticket.wait().await {
                Ok(pair) => pair,
                Err(failure) => return Err(ApiError::SessionInvalidated(failure.to_string())),
            },
        };

        let retry = self.send_with(request, Some(&pair.access_token)).await?;
        if retry.is_auth_failure() {
            warn!(path = %request.path, "Refreshed token was rejected");
            self.inner
                .invalidate(&pair.refresh_token, "refreshed token was rejected".to_string());
            return Err(ApiError::SessionInvalidated(
                "refreshed token was rejected".to_string(),
            ));
        }
        retry.error_for_status()
    }

    /// Decide how a call that saw a 401 for `sent_token` continues.
    ///
    /// Runs entirely under the coordinator lock, so two callers can never both
    /// observe "no refresh pending" and open two episodes.
    fn admit(&self, sent_token: Option<&str>) -> Admission<'_> {
        let mut coordinator = self.inner.coordinator();

        if coordinator.pending.is_none() {
            let Some(session) = self.inner.store.read().complete() else {
                return Admission::NoSession;
            };
            if Some(session.access_token.as_str()) != sent_token {
                return Admission::Rotated(TokenPair {
                    access_token: session.access_token,
                    refresh_token: session.refresh_token,
                });
            }

            coordinator.episodes += 1;
            let episode = coordinator.episodes;
            coordinator.pending = Some(PendingRefresh {
                episode,
                waiters: Vec::new(),
            });
            info!(episode, "Starting token refresh");
            tokio::spawn(Arc::clone(&self.inner).run_refresh(episode, session.refresh_token));
        }

        let ticket = coordinator.next_ticket;
        coordinator.next_ticket += 1;
        let (tx, rx) = oneshot::channel();

        let Some(pending) = coordinator.pending.as_mut() else {
            return Admission::NoSession;
        };
        pending.waiters.push(Waiter { ticket, tx });
        let episode = pending.episode;
        debug!(episode, ticket, queued = pending.waiters.len(), "Waiting on token refresh");

        Admission::Queued(QueueTicket {
            inner: &self.inner,
            ticket,
            episode,
            rx,
        })
    }
}

async fn cancellable<F>(request: &ApiRequest, call: F) -> Result<ApiResponse, ApiError>
where
    F: Future<Output = Result<ApiResponse, ApiError>>,
{
    match request.cancel.as_ref() {
        Some(cancel) => tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(path = %request.path, "Request cancelled");
                Err(ApiError::Cancelled)
            }
            result = call => result,
        },
        None => call.await,
    }
}
