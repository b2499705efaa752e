use async_trait::async_trait;
use reqwest::{header, Client as HttpClient, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use super::{RemoteApi, RemoteUserMedia, UserMediaPayload};
use crate::config::RemoteConfig;
use crate::error::{Error, Result};
use crate::models::{Media, UserMediaState};

const REGISTER_PATH: &str = "/register/";
const TOKEN_AUTH_PATH: &str = "/api-token-auth/";
const MEDIA_PATH: &str = "/api/media/";
const USER_MEDIA_PATH: &str = "/api/user-media/";

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: String,
}

/// Collections come back either bare or wrapped in a paginated envelope.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ListBody<T> {
    Plain(Vec<T>),
    Paged { results: Vec<T> },
}

impl<T> ListBody<T> {
    fn into_vec(self) -> Vec<T> {
        match self {
            ListBody::Plain(items) | ListBody::Paged { results: items } => items,
        }
    }
}

/// reqwest client for the media API.
pub struct HttpRemote {
    http: HttpClient,
    base_url: String,
    auth_scheme: String,
}

impl HttpRemote {
    pub fn new(config: &RemoteConfig) -> Result<Self> {
        let http = HttpClient::builder()
            .timeout(config.request_timeout())
            .connect_timeout(config.connect_timeout())
            .user_agent(concat!("mediacheck/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::RemoteUnavailable(format!("failed to build http client: {e}")))?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            auth_scheme: config.auth_scheme.clone(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn item_url(&self, collection: &str, id: i64) -> String {
        format!("{}{}{}/", self.base_url, collection, id)
    }

    fn authed(&self, request: RequestBuilder, token: &str) -> RequestBuilder {
        request.header(header::AUTHORIZATION, format!("{} {}", self.auth_scheme, token))
    }

    /// Send and read the whole body. Transport failures and timeouts are
    /// `RemoteUnavailable`; status handling is left to the caller.
    async fn send(&self, request: RequestBuilder) -> Result<(StatusCode, String)> {
        let response = request.send().await.map_err(unavailable)?;
        let status = response.status();
        let body = response.text().await.map_err(unavailable)?;
        debug!("remote responded {}", status);
        Ok((status, body))
    }

    async fn send_ok(
        &self,
        request: RequestBuilder,
        entity: &'static str,
        id: &str,
    ) -> Result<String> {
        let (status, body) = self.send(request).await?;
        if status.is_success() {
            Ok(body)
        } else {
            Err(classify(status, &body, entity, id))
        }
    }
}

fn unavailable(e: reqwest::Error) -> Error {
    Error::RemoteUnavailable(e.to_string())
}

/// First message of a DRF field error (`{"title": ["..."]}`), ignoring `detail`.
fn field_error(body: &str) -> Option<(String, String)> {
    let value: Value = serde_json::from_str(body).ok()?;
    value
        .as_object()?
        .iter()
        .filter(|(field, _)| field.as_str() != "detail")
        .find_map(|(field, messages)| {
            let message = match messages {
                Value::String(s) => Some(s.clone()),
                Value::Array(items) => items.iter().find_map(|m| m.as_str()).map(String::from),
                _ => None,
            }?;
            Some((field.clone(), message))
        })
}

/// `{"detail": "..."}`, or the raw body when it is not JSON.
fn detail(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("detail").and_then(|d| d.as_str()).map(String::from))
        .unwrap_or_else(|| body.trim().chars().take(200).collect())
}

/// Map a non-success response onto the error taxonomy.
fn classify(status: StatusCode, body: &str, entity: &'static str, id: &str) -> Error {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Error::Auth(detail(body)),
        StatusCode::NOT_FOUND => Error::not_found(entity, id),
        // Duplicate titles surface as a 500 carrying a field error
        _ => match field_error(body) {
            Some((field, message)) => Error::Validation { field, message },
            None => Error::Server {
                status: status.as_u16(),
                message: detail(body),
            },
        },
    }
}

#[async_trait]
impl RemoteApi for HttpRemote {
    async fn authenticate(&self, username: &str, password: &str) -> Result<String> {
        let request = self
            .http
            .post(self.url(TOKEN_AUTH_PATH))
            .json(&json!({ "username": username, "password": password }));

        let body = match self.send_ok(request, "user", username).await {
            Ok(body) => body,
            // DRF answers bad credentials with a 400 non-field error
            Err(Error::Validation { field, message }) if field == "non_field_errors" => {
                return Err(Error::Auth(message));
            }
            Err(e) => return Err(e),
        };

        let response: TokenResponse = serde_json::from_str(&body)?;
        Ok(response.token)
    }

    async fn register(&self, username: &str, password: &str) -> Result<()> {
        let request = self
            .http
            .post(self.url(REGISTER_PATH))
            .json(&json!({ "username": username, "password": password }));
        self.send_ok(request, "user", username).await?;
        Ok(())
    }

    async fn list_media(&self, token: &str) -> Result<Vec<Media>> {
        let request = self.authed(self.http.get(self.url(MEDIA_PATH)), token);
        let body = self.send_ok(request, "media", "").await?;
        let list: ListBody<Media> = serde_json::from_str(&body)?;
        Ok(list.into_vec())
    }

    async fn create_media(&self, token: &str, media: &Media) -> Result<Media> {
        let request = self.authed(self.http.post(self.url(MEDIA_PATH)), token).json(media);
        let body = self.send_ok(request, "media", &media.title).await?;
        let mut created: Media = serde_json::from_str(&body)?;
        created.local_id = media.local_id;
        Ok(created)
    }

    async fn delete_media(&self, token: &str, id: i64) -> Result<()> {
        let request = self.authed(self.http.delete(self.item_url(MEDIA_PATH, id)), token);
        self.send_ok(request, "media", &id.to_string()).await?;
        Ok(())
    }

    async fn list_user_media(&self, token: &str) -> Result<Vec<RemoteUserMedia>> {
        let request = self.authed(self.http.get(self.url(USER_MEDIA_PATH)), token);
        let body = self.send_ok(request, "user media", "").await?;
        let list: ListBody<RemoteUserMedia> = serde_json::from_str(&body)?;
        Ok(list.into_vec())
    }

    async fn create_user_media(&self, token: &str, state: &UserMediaState) -> Result<UserMediaState> {
        let request = self
            .authed(self.http.post(self.url(USER_MEDIA_PATH)), token)
            .json(&UserMediaPayload::from(state));
        let body = self
            .send_ok(request, "media", &state.media_id.to_string())
            .await?;
        let saved: RemoteUserMedia = serde_json::from_str(&body)?;
        Ok(UserMediaState {
            id: saved.id.or(state.id),
            ..state.clone()
        })
    }

    async fn update_user_media(&self, token: &str, state: &UserMediaState) -> Result<UserMediaState> {
        let Some(id) = state.id else {
            return Err(Error::not_found("user media", format!("media {}", state.media_id)));
        };
        let request = self
            .authed(self.http.put(self.item_url(USER_MEDIA_PATH, id)), token)
            .json(&UserMediaPayload::from(state));
        self.send_ok(request, "user media", &id.to_string()).await?;
        Ok(state.clone())
    }

    async fn delete_user_media(&self, token: &str, id: i64) -> Result<()> {
        let request = self.authed(self.http.delete(self.item_url(USER_MEDIA_PATH, id)), token);
        self.send_ok(request, "user media", &id.to_string()).await?;
        Ok(())
    }
}
