//! Common test infrastructure
//!
//! [`TestServer`] spawns an in-process fake of the media API on a random
//! port. Its state is shared with the test so fixtures can be seeded and
//! server-side effects asserted directly.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::net::TcpListener;

use mediacheck::config::{Config, ProbeConfig, RemoteConfig, StorageConfig, SyncConfig};

pub const PASSWORD: &str = "correct-horse";

#[derive(Default)]
pub struct FakeApi {
    /// username → password
    pub users: HashMap<String, String>,
    pub media: Vec<Value>,
    /// (owner, record) with a flat `media_id`; nested on read
    pub user_media: Vec<(String, Value)>,
    next_id: i64,
}

impl FakeApi {
    fn allocate_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn media_by_id(&self, id: i64) -> Option<&Value> {
        self.media.iter().find(|m| m["id"] == id)
    }
}

#[derive(Clone)]
struct AppState {
    api: Arc<Mutex<FakeApi>>,
    healthy: Arc<AtomicBool>,
}

fn token_for(username: &str) -> String {
    format!("tok-{username}")
}

/// Resolve the `Authorization: Token …` header to a username.
fn authorize(state: &AppState, headers: &HeaderMap) -> Result<String, Response> {
    let unauthorized = || {
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "detail": "Invalid token." })),
        )
            .into_response()
    };
    let header = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(unauthorized)?;
    let token = header.strip_prefix("Token ").ok_or_else(unauthorized)?;
    let api = state.api.lock().unwrap();
    api.users
        .keys()
        .find(|u| token_for(u) == token)
        .cloned()
        .ok_or_else(unauthorized)
}

async fn health(State(state): State<AppState>) -> StatusCode {
    if state.healthy.load(Ordering::SeqCst) {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn register(State(state): State<AppState>, Json(body): Json<Value>) -> Response {
    let username = body["username"].as_str().unwrap_or_default().to_string();
    let password = body["password"].as_str().unwrap_or_default().to_string();
    let mut api = state.api.lock().unwrap();
    if api.users.contains_key(&username) {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "username": ["A user with that username already exists."] })),
        )
            .into_response();
    }
    api.users.insert(username.clone(), password);
    (StatusCode::CREATED, Json(json!({ "username": username }))).into_response()
}

async fn token_auth(State(state): State<AppState>, Json(body): Json<Value>) -> Response {
    let username = body["username"].as_str().unwrap_or_default();
    let password = body["password"].as_str().unwrap_or_default();
    let api = state.api.lock().unwrap();
    match api.users.get(username) {
        Some(stored) if stored == password => {
            Json(json!({ "token": token_for(username) })).into_response()
        }
        _ => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "non_field_errors": ["Unable to log in with provided credentials."] })),
        )
            .into_response(),
    }
}

async fn list_media(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(resp) = authorize(&state, &headers) {
        return resp;
    }
    let api = state.api.lock().unwrap();
    Json(Value::Array(api.media.clone())).into_response()
}

async fn create_media(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(mut body): Json<Value>,
) -> Response {
    if let Err(resp) = authorize(&state, &headers) {
        return resp;
    }
    let mut api = state.api.lock().unwrap();
    // Unique title enforced by the database; surfaces as a 500
    if api.media.iter().any(|m| m["title"] == body["title"]) {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "title": ["media with this title already exists."] })),
        )
            .into_response();
    }
    let id = api.allocate_id();
    body["id"] = json!(id);
    if body.get("created_at").is_none() {
        body["created_at"] = json!("2024-03-01T12:00:00Z");
    }
    api.media.push(body.clone());
    (StatusCode::CREATED, Json(body)).into_response()
}

async fn delete_media(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Response {
    if let Err(resp) = authorize(&state, &headers) {
        return resp;
    }
    let mut api = state.api.lock().unwrap();
    let before = api.media.len();
    api.media.retain(|m| m["id"] != id);
    if api.media.len() == before {
        return (StatusCode::NOT_FOUND, Json(json!({ "detail": "Not found." }))).into_response();
    }
    api.user_media.retain(|(_, r)| r["media_id"] != id);
    StatusCode::NO_CONTENT.into_response()
}

async fn list_user_media(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let user = match authorize(&state, &headers) {
        Ok(user) => user,
        Err(resp) => return resp,
    };
    let api = state.api.lock().unwrap();
    let records: Vec<Value> = api
        .user_media
        .iter()
        .filter(|(owner, _)| *owner == user)
        .map(|(_, record)| {
            let mut read = record.clone();
            if let Some(media_id) = record["media_id"].as_i64() {
                read["media"] = api.media_by_id(media_id).cloned().unwrap_or(Value::Null);
                if let Some(obj) = read.as_object_mut() {
                    obj.remove("media_id");
                }
            }
            read
        })
        .collect();
    Json(Value::Array(records)).into_response()
}

async fn create_user_media(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(mut body): Json<Value>,
) -> Response {
    let user = match authorize(&state, &headers) {
        Ok(user) => user,
        Err(resp) => return resp,
    };
    let mut api = state.api.lock().unwrap();
    let Some(media_id) = body["media_id"].as_i64() else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "media_id": ["This field is required."] })),
        )
            .into_response();
    };
    if api.media_by_id(media_id).is_none() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "media_id": [format!("Invalid pk \"{media_id}\" - object does not exist.")] })),
        )
            .into_response();
    }
    let id = api.allocate_id();
    body["id"] = json!(id);
    api.user_media.push((user, body.clone()));
    (StatusCode::CREATED, Json(body)).into_response()
}

async fn update_user_media(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(mut body): Json<Value>,
) -> Response {
    let user = match authorize(&state, &headers) {
        Ok(user) => user,
        Err(resp) => return resp,
    };
    let mut api = state.api.lock().unwrap();
    let Some((_, record)) = api
        .user_media
        .iter_mut()
        .find(|(owner, r)| *owner == user && r["id"] == id)
    else {
        return (StatusCode::NOT_FOUND, Json(json!({ "detail": "Not found." }))).into_response();
    };
    body["id"] = json!(id);
    *record = body.clone();
    Json(body).into_response()
}

async fn delete_user_media(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Response {
    let user = match authorize(&state, &headers) {
        Ok(user) => user,
        Err(resp) => return resp,
    };
    let mut api = state.api.lock().unwrap();
    let before = api.user_media.len();
    api.user_media.retain(|(owner, r)| !(*owner == user && r["id"] == id));
    if api.user_media.len() == before {
        return (StatusCode::NOT_FOUND, Json(json!({ "detail": "Not found." }))).into_response();
    }
    StatusCode::NO_CONTENT.into_response()
}

fn make_app(state: AppState) -> Router {
    Router::new()
        .route("/health/", get(health))
        .route("/register/", post(register))
        .route("/api-token-auth/", post(token_auth))
        .route("/api/media/", get(list_media).post(create_media))
        .route("/api/media/{id}/", axum::routing::delete(delete_media))
        .route("/api/user-media/", get(list_user_media).post(create_user_media))
        .route(
            "/api/user-media/{id}/",
            put(update_user_media).delete(delete_user_media),
        )
        .with_state(state)
}

/// Fake API server on a random port.
///
/// Shuts down when dropped.
pub struct TestServer {
    pub base_url: String,
    pub api: Arc<Mutex<FakeApi>>,
    healthy: Arc<AtomicBool>,
    _shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl TestServer {
    pub async fn spawn() -> Self {
        let api = Arc::new(Mutex::new(FakeApi::default()));
        let healthy = Arc::new(AtomicBool::new(true));
        let app = make_app(AppState {
            api: api.clone(),
            healthy: healthy.clone(),
        });

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind to random port");
        let port = listener
            .local_addr()
            .expect("Failed to get local address")
            .port();

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    shutdown_rx.await.ok();
                })
                .await
                .expect("Server failed");
        });

        Self {
            base_url: format!("http://127.0.0.1:{port}"),
            api,
            healthy,
            _shutdown_tx: Some(shutdown_tx),
        }
    }

    /// Client configuration pointing at this server, with the store in `dir`.
    pub fn config(&self, dir: &TempDir) -> Config {
        config_for(&self.base_url, dir)
    }

    /// Make the health endpoint fail, so the probe reports offline.
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn add_user(&self, username: &str) {
        self.api
            .lock()
            .unwrap()
            .users
            .insert(username.to_string(), PASSWORD.to_string());
    }

    pub fn token(&self, username: &str) -> String {
        token_for(username)
    }

    pub fn seed_media(&self, title: &str) -> i64 {
        let mut api = self.api.lock().unwrap();
        let id = api.allocate_id();
        api.media.push(json!({
            "id": id,
            "title": title,
            "media_type": "cinema",
            "quotes": [],
            "created_at": "2024-01-01T00:00:00Z",
        }));
        id
    }

    pub fn seed_state(&self, owner: &str, media_id: i64, state: u8, score: Option<u8>, updated_at: &str) -> i64 {
        let mut api = self.api.lock().unwrap();
        let id = api.allocate_id();
        api.user_media.push((
            owner.to_string(),
            json!({
                "id": id,
                "media_id": media_id,
                "state": state,
                "score": score,
                "updated_at": updated_at,
            }),
        ));
        id
    }

    /// Insert a record exactly as given, bypassing validation.
    pub fn seed_raw_state(&self, owner: &str, record: Value) {
        self.api
            .lock()
            .unwrap()
            .user_media
            .push((owner.to_string(), record));
    }

    pub fn media_titles(&self) -> Vec<String> {
        self.api
            .lock()
            .unwrap()
            .media
            .iter()
            .filter_map(|m| m["title"].as_str().map(String::from))
            .collect()
    }

    pub fn states_for(&self, owner: &str) -> Vec<Value> {
        self.api
            .lock()
            .unwrap()
            .user_media
            .iter()
            .filter(|(o, _)| o == owner)
            .map(|(_, r)| r.clone())
            .collect()
    }
}

pub fn config_for(base_url: &str, dir: &TempDir) -> Config {
    Config {
        remote: RemoteConfig {
            base_url: base_url.to_string(),
            request_timeout_secs: 2,
            connect_timeout_secs: 1,
            ..RemoteConfig::default()
        },
        probe: ProbeConfig {
            timeout_ms: 500,
            ..ProbeConfig::default()
        },
        sync: SyncConfig::default(),
        storage: StorageConfig {
            db_path: Some(dir.path().join("store.redb").to_string_lossy().into_owned()),
        },
    }
}
