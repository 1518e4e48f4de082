//! Scripted in-process API server for gateway and facade tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::BoxFuture;
use futures::FutureExt;
use reqwest::{Method, StatusCode};
use serde_json::{json, Value};
use tokio::sync::Semaphore;

use crate::api::request::RequestBody;
use crate::api::{ApiError, ApiRequest, ApiResponse, Gateway, GatewaySettings, Transport};
use crate::auth::{CredentialStore, SessionData, UserProfile};

pub const EMAIL: &str = "runner@example.com";
pub const PASSWORD: &str = "hunter2";

/// Enough for every refresh a single test can start.
const RELEASED_PERMITS: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogoutMode {
    Ok,
    Error,
    Hang,
}

struct FakeState {
    generation: u32,
    access_valid: bool,
    reject_all: bool,
    reject_refresh: bool,
    refresh_calls: usize,
    login_calls: usize,
    requests: Vec<(String, Option<String>)>,
    revoked: Vec<String>,
    offline: HashSet<String>,
    held: HashSet<String>,
    logout_mode: LogoutMode,
}

pub struct FakeServer {
    state: Mutex<FakeState>,
    gated: AtomicBool,
    refresh_gate: Semaphore,
    path_gate: Semaphore,
}

pub fn user() -> UserProfile {
    UserProfile {
        id: "u1".to_string(),
        username: "runner".to_string(),
        email: EMAIL.to_string(),
        avatar_url: Some("/public/runner.png".to_string()),
    }
}

fn morning_run() -> Value {
    json!({
        "_id": "p1",
        "title": "Morning run",
        "content": "10k before breakfast",
        "owner": "u1",
        "image": "/public/run.png",
        "date": "2024-03-01T07:00:00.000Z",
    })
}

fn json_response(status: StatusCode, body: Value) -> ApiResponse {
    ApiResponse::new(status, body.to_string())
}

impl FakeServer {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState {
                generation: 1,
                access_valid: true,
                reject_all: false,
                reject_refresh: false,
                refresh_calls: 0,
                login_calls: 0,
                requests: Vec::new(),
                revoked: Vec::new(),
                offline: HashSet::new(),
                held: HashSet::new(),
                logout_mode: LogoutMode::Ok,
            }),
            gated: AtomicBool::new(false),
            refresh_gate: Semaphore::new(0),
            path_gate: Semaphore::new(0),
        }
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn expire_access_token(&self) {
        self.state().access_valid = false;
    }

    pub fn reject_all_tokens(&self) {
        self.state().reject_all = true;
    }

    pub fn reject_refresh(&self) {
        self.state().reject_refresh = true;
    }

    pub fn fail_transport(&self, path: &str) {
        self.state().offline.insert(path.to_string());
    }

    pub fn set_logout_mode(&self, mode: LogoutMode) {
        self.state().logout_mode = mode;
    }

    /// Hold refresh exchanges until `release_refresh`.
    pub fn gate_refresh(&self) {
        self.gated.store(true, Ordering::SeqCst);
    }

    pub fn release_refresh(&self) {
        self.gated.store(false, Ordering::SeqCst);
        self.refresh_gate.add_permits(RELEASED_PERMITS);
    }

    /// Hold requests to `path` after recording them, before checking the token.
    pub fn hold_path(&self, path: &str) {
        self.state().held.insert(path.to_string());
    }

    pub fn release_path(&self, path: &str) {
        self.state().held.remove(path);
        self.path_gate.add_permits(RELEASED_PERMITS);
    }

    pub fn refresh_calls(&self) -> usize {
        self.state().refresh_calls
    }

    pub fn login_calls(&self) -> usize {
        self.state().login_calls
    }

    pub fn request_count(&self) -> usize {
        self.state().requests.len()
    }

    pub fn revoked(&self) -> Vec<String> {
        self.state().revoked.clone()
    }

    pub fn tokens_seen(&self, path: &str) -> Vec<Option<String>> {
        self.state()
            .requests
            .iter()
            .filter(|(p, _)| p == path)
            .map(|(_, token)| token.clone())
            .collect()
    }

    fn authorized(state: &FakeState, token: Option<&str>) -> bool {
        let expected = format!("access-{}", state.generation);
        state.access_valid && !state.reject_all && token == Some(expected.as_str())
    }

    async fn handle(&self, request: ApiRequest) -> Result<ApiResponse, ApiError> {
        let token = request.bearer().map(str::to_string);
        let body = match request.body {
            RequestBody::Json(ref value) => value.clone(),
            _ => Value::Null,
        };
        let held = {
            let mut state = self.state();
            state.requests.push((request.path.clone(), token.clone()));
            if state.offline.contains(&request.path) {
                return Err(ApiError::Network("connection refused".to_string()));
            }
            state.held.contains(&request.path)
        };
        if held {
            if let Ok(permit) = self.path_gate.acquire().await {
                permit.forget();
            }
        }

        match (request.method.clone(), request.path.as_str()) {
            (Method::POST, "/auth/login") => Ok(self.login(&body)),
            (Method::POST, "/auth/register") => Ok(Self::register(&body)),
            (Method::POST, "/auth/refresh") => Ok(self.refresh(&body).await),
            (Method::POST, "/auth/logout") => self.logout(&body).await,
            (method, path) => Ok(self.resource(method, path, &request, token.as_deref(), &body)),
        }
    }

    fn login(&self, body: &Value) -> ApiResponse {
        let mut state = self.state();
        state.login_calls += 1;
        if body["email"] != EMAIL || body["password"] != PASSWORD {
            return json_response(
                StatusCode::UNAUTHORIZED,
                json!({ "message": "Invalid email or password" }),
            );
        }
        state.access_valid = true;
        let generation = state.generation;
        json_response(
            StatusCode::OK,
            json!({
                "accessToken": format!("access-{}", generation),
                "refreshToken": format!("refresh-{}", generation),
                "_id": "u1",
                "username": "runner",
                "email": EMAIL,
                "avatar": "/public/runner.png",
            }),
        )
    }

    fn register(body: &Value) -> ApiResponse {
        if body["username"] == "taken" {
            return json_response(
                StatusCode::BAD_REQUEST,
                json!({ "message": "Username already exists" }),
            );
        }
        json_response(
            StatusCode::CREATED,
            json!({
                "_id": "u2",
                "username": body["username"],
                "email": body["email"],
                "avatar": body["avatar"],
            }),
        )
    }

    async fn refresh(&self, body: &Value) -> ApiResponse {
        self.state().refresh_calls += 1;
        if self.gated.load(Ordering::SeqCst) {
            // Held until released; the permit is intentionally not returned.
            if let Ok(permit) = self.refresh_gate.acquire().await {
                permit.forget();
            }
        }

        let mut state = self.state();
        let expected = format!("refresh-{}", state.generation);
        if state.reject_refresh || body["refreshToken"] != expected.as_str() {
            return json_response(StatusCode::UNAUTHORIZED, json!({ "message": "Invalid refresh token" }));
        }
        state.generation += 1;
        state.access_valid = true;
        json_response(
            StatusCode::OK,
            json!({
                "accessToken": format!("access-{}", state.generation),
                "refreshToken": format!("refresh-{}", state.generation),
            }),
        )
    }

    async fn logout(&self, body: &Value) -> Result<ApiResponse, ApiError> {
        let mode = {
            let mut state = self.state();
            if let Some(token) = body["refreshToken"].as_str() {
                state.revoked.push(token.to_string());
            }
            state.logout_mode
        };
        match mode {
            LogoutMode::Ok => Ok(ApiResponse::new(StatusCode::NO_CONTENT, Vec::new())),
            LogoutMode::Error => Ok(ApiResponse::new(StatusCode::INTERNAL_SERVER_ERROR, "down")),
            LogoutMode::Hang => std::future::pending().await,
        }
    }

    fn resource(
        &self,
        method: Method,
        path: &str,
        request: &ApiRequest,
        token: Option<&str>,
        body: &Value,
    ) -> ApiResponse {
        let state = self.state();
        if !Self::authorized(&state, token) {
            return json_response(StatusCode::UNAUTHORIZED, json!({ "message": "Unauthorized" }));
        }

        match (method, path) {
            (_, "/boom") => ApiResponse::new(StatusCode::INTERNAL_SERVER_ERROR, "exploded"),
            (_, "/missing") => ApiResponse::new(StatusCode::NOT_FOUND, "no such thing"),
            (Method::GET, "/posts") => json_response(StatusCode::OK, json!([morning_run()])),
            (Method::GET, "/posts/p1") => json_response(StatusCode::OK, morning_run()),
            (Method::GET, "/posts/nope") => ApiResponse::new(StatusCode::NOT_FOUND, "no such post"),
            (Method::POST, "/posts") => json_response(
                StatusCode::CREATED,
                json!({
                    "_id": "p2",
                    "title": body["title"],
                    "content": body["content"],
                    "owner": "u1",
                    "image": body["image"],
                }),
            ),
            (Method::PUT, "/posts/p1") => {
                let mut post = morning_run();
                for field in ["title", "content", "image"] {
                    if let Some(value) = body.get(field) {
                        post[field] = value.clone();
                    }
                }
                json_response(StatusCode::OK, post)
            }
            (Method::POST, "/comments") => json_response(
                StatusCode::CREATED,
                json!({
                    "_id": "c1",
                    "owner": body["username"],
                    "comment": body["comment"],
                    "postId": body["postId"],
                }),
            ),
            (Method::PUT, "/auth/user") => {
                let mut profile = serde_json::to_value(user()).unwrap_or(Value::Null);
                if let Some(name) = body.get("username") {
                    profile["username"] = name.clone();
                }
                if let Some(avatar) = body.get("avatar") {
                    profile["avatarUrl"] = avatar.clone();
                }
                json_response(StatusCode::OK, profile)
            }
            (Method::POST, "/file") => {
                let name = request
                    .query
                    .iter()
                    .find(|(k, _)| k == "file")
                    .map(|(_, v)| v.clone())
                    .unwrap_or_default();
                json_response(
                    StatusCode::OK,
                    json!({ "url": format!("http://localhost:3000/public/{}", name) }),
                )
            }
            (Method::POST, "/likes") => json_response(
                StatusCode::CREATED,
                json!({ "owner": "u1", "postId": body["postId"] }),
            ),
            (Method::POST, "/chat") => json_response(
                StatusCode::CREATED,
                json!({ "content": body["content"], "owner": "u1", "username": body["username"] }),
            ),
            _ => json_response(StatusCode::OK, json!({ "ok": true })),
        }
    }
}

impl Transport for FakeServer {
    fn send(&self, request: ApiRequest) -> BoxFuture<'_, Result<ApiResponse, ApiError>> {
        self.handle(request).boxed()
    }
}

/// A store, fake server and gateway wired together.
pub struct TestSession {
    pub server: Arc<FakeServer>,
    pub store: Arc<CredentialStore>,
    pub gateway: Gateway,
    pub dir: tempfile::TempDir,
}

impl TestSession {
    pub fn anonymous() -> Self {
        Self::build(false, GatewaySettings::default())
    }

    pub fn logged_in() -> Self {
        Self::build(true, GatewaySettings::default())
    }

    pub fn logged_in_with(settings: GatewaySettings) -> Self {
        Self::build(true, settings)
    }

    fn build(logged_in: bool, settings: GatewaySettings) -> Self {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let store = Arc::new(CredentialStore::file(dir.path()));
        if logged_in {
            store.write(SessionData {
                access_token: "access-1".to_string(),
                refresh_token: "refresh-1".to_string(),
                user: user(),
            });
        }
        let server = Arc::new(FakeServer::new());
        let transport: Arc<dyn Transport> = server.clone();
        let gateway = Gateway::new(transport, Arc::clone(&store), settings);
        Self {
            server,
            store,
            gateway,
            dir,
        }
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        self.server.clone()
    }
}
