//! Local persisted cache.
//!
//! - [`RedbStore`]: redb-backed tables for media, per-user media state,
//!   users and sync bookkeeping (on disk or in memory)
//!
//! The façade and the reconciler hold an `Arc<dyn LocalStore>` and all
//! persistence goes through it.

pub mod local;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{Media, MediaWithUserData, Timestamp, User, UserMediaState};

pub use local::RedbStore;

/// Identifies a media row: by server id once synced, by local key before.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaRef {
    Server(i64),
    Local(u64),
}

impl std::fmt::Display for MediaRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaRef::Server(id) => write!(f, "{id}"),
            MediaRef::Local(key) => write!(f, "local-{key}"),
        }
    }
}

/// Parses the [`Display`](std::fmt::Display) form: `12` or `local-3`.
impl std::str::FromStr for MediaRef {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim();
        match s.strip_prefix("local-") {
            Some(key) => key
                .parse()
                .map(MediaRef::Local)
                .map_err(|_| format!("invalid local media key: {s}")),
            None => s
                .parse()
                .map(MediaRef::Server)
                .map_err(|_| format!("expected a media id or local-<key>, got: {s}")),
        }
    }
}

/// A delete applied locally that still has to reach the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tombstone {
    Media(i64),
    UserMedia(i64),
}

impl Tombstone {
    pub(crate) fn encode(&self) -> String {
        match self {
            Tombstone::Media(id) => format!("media:{id}"),
            Tombstone::UserMedia(id) => format!("user-media:{id}"),
        }
    }

    pub(crate) fn decode(s: &str) -> Option<Self> {
        let (kind, id) = s.split_once(':')?;
        let id = id.parse().ok()?;
        match kind {
            "media" => Some(Tombstone::Media(id)),
            "user-media" => Some(Tombstone::UserMedia(id)),
            _ => None,
        }
    }
}

/// CRUD contract of the local cache.
///
/// Per-user data (states, watermark, tombstones) is keyed by username; the
/// media catalog is shared.
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Human-readable backend name (e.g., "redb", "redb-memory").
    fn backend_name(&self) -> &str;

    // ── Media ────────────────────────────────────────────────────────

    async fn get_media(&self) -> Result<Vec<Media>>;

    async fn find_media(&self, media: MediaRef) -> Result<Option<Media>>;

    /// Insert a media row and return it with its local key set. A row with
    /// the same server id is replaced instead of duplicated.
    async fn add_media(&self, media: &Media) -> Result<Media>;

    /// Upsert by local key, else by server id.
    async fn update_media(&self, media: &Media) -> Result<Media>;

    /// Record the server id for a row created while unsynced.
    async fn assign_media_id(&self, local_id: u64, server_id: i64) -> Result<()>;

    /// Delete a media row and every state referencing it. Returns whether
    /// the row existed.
    async fn delete_media(&self, media: MediaRef) -> Result<bool>;

    // ── User media ───────────────────────────────────────────────────

    async fn get_user_media(&self, username: &str) -> Result<Vec<UserMediaState>>;

    async fn user_media_for(&self, username: &str, media_id: i64) -> Result<Option<UserMediaState>>;

    /// Insert or replace the state for `state.media_id`. At most one state
    /// exists per (user, media).
    async fn add_user_media(&self, username: &str, state: &UserMediaState) -> Result<()>;

    /// Replace an existing state. Fails with `NotFound` if there is none.
    async fn update_user_media(&self, username: &str, state: &UserMediaState) -> Result<()>;

    async fn delete_user_media(&self, username: &str, media_id: i64) -> Result<bool>;

    /// Left join of the catalog with the user's states.
    async fn get_media_with_user_data(&self, username: &str) -> Result<Vec<MediaWithUserData>>;

    // ── Users ────────────────────────────────────────────────────────

    /// Save (or replace) a user and make it the current user.
    async fn save_user(&self, user: &User) -> Result<()>;

    async fn get_user(&self, username: &str) -> Result<Option<User>>;

    async fn get_current_user(&self) -> Result<Option<User>>;

    async fn clear_current_user(&self) -> Result<()>;

    async fn get_offline_users(&self) -> Result<Vec<User>>;

    async fn update_user_status(&self, username: &str, is_offline: bool) -> Result<()>;

    async fn remove_user(&self, username: &str) -> Result<bool>;

    // ── Sync bookkeeping ─────────────────────────────────────────────

    /// Last successful sync for `username`, if any.
    async fn watermark(&self, username: &str) -> Result<Option<Timestamp>>;

    async fn set_watermark(&self, username: &str, at: Timestamp) -> Result<()>;

    async fn add_tombstone(&self, username: &str, tombstone: Tombstone) -> Result<()>;

    async fn tombstones(&self, username: &str) -> Result<Vec<Tombstone>>;

    async fn clear_tombstone(&self, username: &str, tombstone: Tombstone) -> Result<()>;
}
