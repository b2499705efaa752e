pub mod http;

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::Result;
use crate::models::{ConsumptionState, Media, Timestamp, UserMediaState};

pub use http::HttpRemote;

/// A user-media record as the API returns it.
///
/// Reads nest the related media under `media`; older payloads carry a flat
/// `media_id`. Either may be missing on malformed rows, so nothing here is
/// required and [`RemoteUserMedia::into_state`] decides what is usable.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RemoteUserMedia {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub media_id: Option<i64>,
    #[serde(default)]
    pub media: Option<serde_json::Value>,
    #[serde(default, deserialize_with = "lenient_state")]
    pub state: Option<ConsumptionState>,
    #[serde(default, deserialize_with = "lenient_score")]
    pub score: Option<u8>,
    #[serde(default)]
    pub added_at: Option<Timestamp>,
    #[serde(default)]
    pub updated_at: Option<Timestamp>,
}

/// Scores may come back as floats (`9.0`); anything outside 1..=10 is dropped.
fn lenient_score<'de, D>(deserializer: D) -> std::result::Result<Option<u8>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(raw
        .and_then(|v| v.as_f64())
        .map(|f| f.round())
        .filter(|f| (1.0..=10.0).contains(f))
        .map(|f| f as u8))
}

/// Unknown state codes read as absent rather than failing the whole collection.
fn lenient_state<'de, D>(deserializer: D) -> std::result::Result<Option<ConsumptionState>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(raw
        .and_then(|v| v.as_u64())
        .and_then(|n| u8::try_from(n).ok())
        .and_then(|n| ConsumptionState::try_from(n).ok()))
}

impl RemoteUserMedia {
    /// The referenced media id, from the flat field or the nested media.
    pub fn media_id(&self) -> Option<i64> {
        self.media_id.or_else(|| {
            self.media
                .as_ref()
                .and_then(|m| m.get("id"))
                .and_then(|id| id.as_i64())
        })
    }

    /// Convert to a local state. `None` when the media reference is missing.
    pub fn into_state(self) -> Option<UserMediaState> {
        let media_id = self.media_id()?;
        let state = self.state.unwrap_or_default();
        Some(UserMediaState {
            id: self.id,
            media_id,
            state,
            score: if state == ConsumptionState::Check { None } else { self.score },
            added_at: self.added_at,
            updated_at: self.updated_at.unwrap_or(Timestamp::EPOCH),
        })
    }
}

/// Body sent when creating or updating a user-media record.
#[derive(Debug, Serialize)]
pub struct UserMediaPayload {
    pub media_id: i64,
    pub state: ConsumptionState,
    pub score: Option<u8>,
    pub updated_at: Timestamp,
}

impl From<&UserMediaState> for UserMediaPayload {
    fn from(state: &UserMediaState) -> Self {
        Self {
            media_id: state.media_id,
            state: state.state,
            score: state.score,
            updated_at: state.updated_at,
        }
    }
}

/// The remote media-tracking API.
///
/// Implementations never touch local state. Calls that need authentication
/// take the session token explicitly.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// Exchange credentials for an auth token.
    async fn authenticate(&self, username: &str, password: &str) -> Result<String>;

    /// Create a server account.
    async fn register(&self, username: &str, password: &str) -> Result<()>;

    // === Media ===

    async fn list_media(&self, token: &str) -> Result<Vec<Media>>;

    /// Create a media item; the returned copy carries the server id.
    async fn create_media(&self, token: &str, media: &Media) -> Result<Media>;

    async fn delete_media(&self, token: &str, id: i64) -> Result<()>;

    // === User media ===

    async fn list_user_media(&self, token: &str) -> Result<Vec<RemoteUserMedia>>;

    async fn create_user_media(&self, token: &str, state: &UserMediaState) -> Result<UserMediaState>;

    async fn update_user_media(&self, token: &str, state: &UserMediaState) -> Result<UserMediaState>;

    async fn delete_user_media(&self, token: &str, id: i64) -> Result<()>;
}
