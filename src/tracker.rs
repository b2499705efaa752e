//! Online-aware façade.
//!
//! Every operation asks the probe first. Online, it talks to the remote and
//! mirrors the result into the store; offline, or when the remote turns out to
//! be unreachable mid-call, it works against the store alone and leaves the
//! rest to the next sync.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Context;
use argon2::password_hash::{PasswordHash, PasswordVerifier, SaltString};
use argon2::{Argon2, PasswordHasher};
use rand_core::{OsRng, RngCore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Config, SyncConfig};
use crate::error::{Error, Result};
use crate::models::{
    validate_score, ConsumptionState, Media, MediaDraft, MediaWithUserData, Timestamp, User,
    UserMediaState,
};
use crate::probe::{ConnectivityProbe, HttpProbe};
use crate::remote::{HttpRemote, RemoteApi};
use crate::session::{Session, SessionContext};
use crate::store::{LocalStore, MediaRef, RedbStore, Tombstone};
use crate::sync::{Reconciler, SyncOutcome};

const OFFLINE_TOKEN_PREFIX: &str = "offline-";

/// Snapshot for status displays.
#[derive(Debug, Clone)]
pub struct TrackerStatus {
    pub session: Option<Session>,
    pub online: bool,
    pub last_sync: Option<Timestamp>,
    pub unsynced_media: usize,
    pub pending_deletes: usize,
    pub offline_accounts: Vec<String>,
}

pub struct Tracker {
    store: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteApi>,
    probe: Arc<dyn ConnectivityProbe>,
    reconciler: Reconciler,
    session: SessionContext,
    sync_on_list: bool,
}

impl Tracker {
    pub fn new(
        store: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteApi>,
        probe: Arc<dyn ConnectivityProbe>,
        sync: &SyncConfig,
    ) -> Self {
        let reconciler = Reconciler::new(store.clone(), remote.clone(), sync.conflict_policy);
        Self {
            store,
            remote,
            probe,
            reconciler,
            session: SessionContext::new(),
            sync_on_list: sync.sync_on_list,
        }
    }

    /// Open the configured store and build the HTTP remote and probe.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let path = config.storage.resolve_db_path()?;
        let store = RedbStore::open(&path)
            .with_context(|| format!("Failed to open store at {}", path.display()))?;
        let remote = HttpRemote::new(&config.remote).context("Failed to create API client")?;
        let probe = HttpProbe::new(&config.remote, &config.probe);
        debug!("store: {} at {}", store.backend_name(), path.display());

        Ok(Self::new(
            Arc::new(store),
            Arc::new(remote),
            Arc::new(probe),
            &config.sync,
        ))
    }

    /// Replace the connectivity probe.
    pub fn with_probe(mut self, probe: Arc<dyn ConnectivityProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn session(&self) -> Option<Session> {
        self.session.get()
    }

    pub async fn is_online(&self) -> bool {
        self.probe.is_online().await
    }

    /// Local-only accounts never talk to the server until upgraded.
    async fn remote_ready(&self, session: &Session) -> bool {
        !session.is_offline && self.probe.is_online().await
    }

    fn start_session(&self, user: &User) -> Session {
        let session = Session::from(user);
        self.session.set(session.clone());
        session
    }

    // ── Accounts ─────────────────────────────────────────────────────

    pub async fn login(&self, username: &str, password: &str) -> Result<Session> {
        let cached = self.store.get_user(username).await?;
        let local_only = cached.as_ref().is_some_and(|u| u.is_offline);

        if !local_only && self.probe.is_online().await {
            match self.remote.authenticate(username, password).await {
                Ok(token) => {
                    let user = User {
                        username: username.to_string(),
                        token,
                        password_hash: None,
                        is_offline: false,
                        last_login: Timestamp::now(),
                    };
                    self.store.save_user(&user).await?;
                    info!("logged in as {}", username);
                    return Ok(self.start_session(&user));
                }
                Err(e) if e.is_unavailable() => {
                    warn!("remote unavailable during login, trying cached account: {}", e);
                }
                Err(e) => return Err(e),
            }
        }

        let Some(mut user) = cached else {
            return Err(Error::Auth(format!(
                "no cached account for {username}; connect to the server to log in"
            )));
        };
        if let Some(hash) = &user.password_hash {
            verify_password(password, hash)?;
        }
        user.last_login = Timestamp::now();
        self.store.save_user(&user).await?;
        info!("logged in as {} (offline)", username);
        Ok(self.start_session(&user))
    }

    /// Register and log in. Offline, creates a local-only account.
    pub async fn register(&self, username: &str, password: &str) -> Result<Session> {
        if self.probe.is_online().await {
            match self.remote.register(username, password).await {
                Ok(()) => {
                    let token = self.remote.authenticate(username, password).await?;
                    let user = User {
                        username: username.to_string(),
                        token,
                        password_hash: None,
                        is_offline: false,
                        last_login: Timestamp::now(),
                    };
                    self.store.save_user(&user).await?;
                    info!("registered {}", username);
                    return Ok(self.start_session(&user));
                }
                Err(e) if e.is_unavailable() => {
                    warn!("remote unavailable during registration, creating local account: {}", e);
                }
                Err(e) => return Err(e),
            }
        }

        if self.store.get_user(username).await?.is_some() {
            return Err(Error::validation(
                "username",
                "A user with that username already exists.",
            ));
        }
        let user = User {
            username: username.to_string(),
            token: offline_token(),
            password_hash: Some(hash_password(password)?),
            is_offline: true,
            last_login: Timestamp::now(),
        };
        self.store.save_user(&user).await?;
        info!("registered {} as a local-only account", username);
        Ok(self.start_session(&user))
    }

    pub async fn logout(&self) -> Result<()> {
        self.session.clear();
        self.store.clear_current_user().await
    }

    /// Resume the session of the last logged-in user, if any.
    pub async fn restore_session(&self) -> Result<Option<Session>> {
        let user = self.store.get_current_user().await?;
        Ok(user.map(|u| self.start_session(&u)))
    }

    /// Turn the current local-only account into a server account and push
    /// everything recorded under it.
    pub async fn upgrade_offline_account(&self, password: &str) -> Result<Session> {
        let session = self.session.require()?;
        if !session.is_offline {
            return Err(Error::validation(
                "account",
                "This account is already linked to the server.",
            ));
        }
        let user = self
            .store
            .get_user(&session.username)
            .await?
            .ok_or(Error::NoSession)?;
        if let Some(hash) = &user.password_hash {
            verify_password(password, hash)?;
        }
        if !self.probe.is_online().await {
            return Err(Error::RemoteUnavailable(
                "connect to the server to upgrade this account".to_string(),
            ));
        }

        match self.remote.register(&user.username, password).await {
            Ok(()) => {}
            // Registered from another device already; the credentials decide
            Err(Error::Validation { field, .. }) if field == "username" => {
                debug!("{} already exists remotely, authenticating", user.username);
            }
            Err(e) => return Err(e),
        }
        let token = self.remote.authenticate(&user.username, password).await?;

        let upgraded = User {
            token,
            last_login: Timestamp::now(),
            ..user
        };
        self.store.save_user(&upgraded).await?;
        self.store.update_user_status(&upgraded.username, false).await?;
        let upgraded = User {
            is_offline: false,
            password_hash: None,
            ..upgraded
        };
        let session = self.start_session(&upgraded);
        info!("upgraded {} to a server account", session.username);

        if let Err(e) = self.reconciler.sync(&session).await {
            warn!("initial sync after upgrade failed: {}", e);
        }
        Ok(session)
    }

    // ── Media ────────────────────────────────────────────────────────

    /// The catalog. Online it is the server's list plus anything still
    /// waiting to be pushed.
    pub async fn media(&self) -> Result<Vec<Media>> {
        let session = self.session.require()?;
        if self.remote_ready(&session).await {
            match self.remote.list_media(&session.token).await {
                Ok(mut media) => {
                    let pending = self.store.get_media().await?;
                    media.extend(pending.into_iter().filter(|m| !m.is_synced()));
                    return Ok(media);
                }
                Err(e) => warn!("listing media remotely failed, using local cache: {}", e),
            }
        }
        self.store.get_media().await
    }

    /// Catalog joined with the user's states, always served from the store.
    pub async fn media_with_user_data(&self) -> Result<Vec<MediaWithUserData>> {
        let session = self.session.require()?;
        if self.sync_on_list && self.remote_ready(&session).await {
            match self.reconciler.sync(&session).await {
                Ok(outcome) => debug!("sync before listing: {:?}", outcome),
                Err(e) => warn!("sync before listing failed, showing local data: {}", e),
            }
        }
        self.store.get_media_with_user_data(&session.username).await
    }

    pub async fn add_media(&self, draft: MediaDraft) -> Result<Media> {
        let media = draft.validate()?;
        let session = self.session.require()?;
        let catalog = self.store.get_media().await?;
        let duplicate = |synced_too: bool| {
            catalog
                .iter()
                .any(|m| m.title == media.title && (synced_too || !m.is_synced()))
        };
        // An unsynced copy would collide with the server row on the next push
        if duplicate(false) {
            return Err(duplicate_title());
        }

        if self.remote_ready(&session).await {
            match self.remote.create_media(&session.token, &media).await {
                Ok(created) => return self.store.add_media(&created).await,
                Err(e) if e.is_unavailable() => {
                    warn!("remote unavailable, storing '{}' unsynced: {}", media.title, e);
                }
                Err(e) => return Err(e),
            }
        }

        if duplicate(true) {
            return Err(duplicate_title());
        }
        let stored = self.store.add_media(&media).await?;
        debug!("'{}' stored locally as {:?}", stored.title, stored.local_id);
        Ok(stored)
    }

    /// Delete a media item and every state referencing it.
    pub async fn delete_media(&self, media: MediaRef) -> Result<()> {
        let session = self.session.require()?;
        let local = self.store.find_media(media).await?;
        let server_id = match (&local, media) {
            (Some(found), _) => found.id,
            (None, MediaRef::Server(id)) => Some(id),
            (None, MediaRef::Local(_)) => return Err(Error::not_found("media", media)),
        };

        if let Some(id) = server_id {
            let pushed = if self.remote_ready(&session).await {
                match self.remote.delete_media(&session.token, id).await {
                    Ok(()) => true,
                    Err(Error::NotFound { .. }) if local.is_some() => true,
                    Err(e) if e.is_unavailable() => {
                        warn!("remote unavailable, deleting media {} locally: {}", id, e);
                        false
                    }
                    Err(e) => return Err(e),
                }
            } else {
                false
            };
            if !pushed {
                self.store
                    .add_tombstone(&session.username, Tombstone::Media(id))
                    .await?;
            }
        }

        self.store.delete_media(media).await?;
        Ok(())
    }

    // ── User media ───────────────────────────────────────────────────

    /// The user's states, at most one per media.
    pub async fn user_media_states(&self) -> Result<Vec<UserMediaState>> {
        let session = self.session.require()?;
        if self.remote_ready(&session).await {
            match self.remote.list_user_media(&session.token).await {
                Ok(remote) => {
                    let mut newest: BTreeMap<i64, UserMediaState> = BTreeMap::new();
                    for row in remote {
                        let row_id = row.id;
                        let Some(state) = row.into_state() else {
                            warn!("ignoring remote user media {:?} without media_id", row_id);
                            continue;
                        };
                        let replace = newest
                            .get(&state.media_id)
                            .map_or(true, |kept| state.updated_at > kept.updated_at);
                        if replace {
                            newest.insert(state.media_id, state);
                        }
                    }
                    return Ok(newest.into_values().collect());
                }
                Err(e) => warn!("listing states remotely failed, using local cache: {}", e),
            }
        }
        self.store.get_user_media(&session.username).await
    }

    /// Record a state for a media item, merging into any existing one.
    pub async fn add_user_media_state(&self, state: UserMediaState) -> Result<UserMediaState> {
        let session = self.session.require()?;
        let media_id = self.resolve_media_id(MediaRef::Server(state.media_id)).await?;
        let current = self
            .store
            .user_media_for(&session.username, media_id)
            .await?
            .unwrap_or_else(|| UserMediaState::new(media_id));
        let merged = merge_state(current, &state)?;
        self.persist_and_push(&session, merged).await
    }

    /// Replace an existing state. Fails with `NotFound` when there is none.
    pub async fn update_user_media_state(&self, state: UserMediaState) -> Result<UserMediaState> {
        let session = self.session.require()?;
        let current = self
            .store
            .user_media_for(&session.username, state.media_id)
            .await?
            .ok_or_else(|| Error::not_found("user media", format!("media {}", state.media_id)))?;
        let merged = merge_state(current, &state)?;
        self.persist_and_push(&session, merged).await
    }

    /// Remove the user's state for a media item. Returns whether one existed.
    pub async fn delete_user_media_state(&self, media: MediaRef) -> Result<bool> {
        let session = self.session.require()?;
        let media_id = self.resolve_media_id(media).await?;
        let Some(existing) = self.store.user_media_for(&session.username, media_id).await? else {
            return Ok(false);
        };

        if let Some(id) = existing.id {
            let pushed = if self.remote_ready(&session).await {
                match self.remote.delete_user_media(&session.token, id).await {
                    Ok(()) | Err(Error::NotFound { .. }) => true,
                    Err(e) if e.is_unavailable() => {
                        warn!("remote unavailable, deleting state {} locally: {}", id, e);
                        false
                    }
                    Err(e) => return Err(e),
                }
            } else {
                false
            };
            if !pushed {
                self.store
                    .add_tombstone(&session.username, Tombstone::UserMedia(id))
                    .await?;
            }
        }

        self.store.delete_user_media(&session.username, media_id).await
    }

    /// Change the consumption state. Resetting to `Check` clears the score.
    pub async fn set_state(&self, media: MediaRef, state: ConsumptionState) -> Result<UserMediaState> {
        let session = self.session.require()?;
        let media_id = self.resolve_media_id(media).await?;
        let mut current = self
            .store
            .user_media_for(&session.username, media_id)
            .await?
            .unwrap_or_else(|| UserMediaState::new(media_id));
        current.set_state(state);
        self.persist_and_push(&session, current).await
    }

    /// Set or clear the score. Scoring needs a state other than `Check`.
    pub async fn set_score(&self, media: MediaRef, score: Option<u8>) -> Result<UserMediaState> {
        let session = self.session.require()?;
        let media_id = self.resolve_media_id(media).await?;
        let mut current = self
            .store
            .user_media_for(&session.username, media_id)
            .await?
            .unwrap_or_else(|| UserMediaState::new(media_id));
        if score.is_some() && current.state == ConsumptionState::Check {
            return Err(Error::validation(
                "score",
                "Mark the media as checked, viewing or done before scoring it.",
            ));
        }
        current.set_score(score)?;
        self.persist_and_push(&session, current).await
    }

    /// Server id of a locally known media item.
    async fn resolve_media_id(&self, media: MediaRef) -> Result<i64> {
        let found = self
            .store
            .find_media(media)
            .await?
            .ok_or_else(|| Error::not_found("media", media))?;
        found.id.ok_or(Error::Unsynced(found.title))
    }

    /// Write locally first, then try the server. A local write stands even
    /// when the push fails; the next sync retries it.
    async fn persist_and_push(&self, session: &Session, state: UserMediaState) -> Result<UserMediaState> {
        self.store.add_user_media(&session.username, &state).await?;
        if !self.remote_ready(session).await {
            debug!("offline, state for media {} kept for the next sync", state.media_id);
            return Ok(state);
        }

        match self.reconciler.push_state(&session.token, &state).await {
            Ok(saved) => {
                if saved.id != state.id {
                    self.store.add_user_media(&session.username, &saved).await?;
                }
                Ok(saved)
            }
            Err(e) if e.is_unavailable() => {
                warn!("remote unavailable, state for media {} kept locally: {}", state.media_id, e);
                Ok(state)
            }
            Err(e) => Err(e),
        }
    }

    // ── Sync ─────────────────────────────────────────────────────────

    /// Run a push-then-pull pass when the remote is reachable.
    pub async fn sync(&self) -> Result<SyncOutcome> {
        let session = self.session.require()?;
        if !self.remote_ready(&session).await {
            debug!("skipping sync for {}: offline", session.username);
            return Ok(SyncOutcome::Offline);
        }
        self.reconciler.sync(&session).await
    }

    /// Run [`Tracker::sync`] on a background task. `on_done` is skipped when
    /// `cancel` fired before the pass finished; the pass itself still runs
    /// to completion.
    pub fn spawn_sync<F>(self: &Arc<Self>, cancel: CancellationToken, on_done: F) -> JoinHandle<()>
    where
        F: FnOnce(Result<SyncOutcome>) + Send + 'static,
    {
        let tracker = Arc::clone(self);
        tokio::spawn(async move {
            let result = tracker.sync().await;
            if cancel.is_cancelled() {
                debug!("sync finished after its caller went away, dropping result");
                return;
            }
            on_done(result);
        })
    }

    pub async fn status(&self) -> Result<TrackerStatus> {
        let session = self.session.get();
        let online = self.probe.is_online().await;
        let (last_sync, pending_deletes) = match &session {
            Some(s) => (
                self.store.watermark(&s.username).await?,
                self.store.tombstones(&s.username).await?.len(),
            ),
            None => (None, 0),
        };
        let unsynced_media = self
            .store
            .get_media()
            .await?
            .iter()
            .filter(|m| !m.is_synced())
            .count();
        let offline_accounts = self
            .store
            .get_offline_users()
            .await?
            .into_iter()
            .map(|u| u.username)
            .collect();

        Ok(TrackerStatus {
            session,
            online,
            last_sync,
            unsynced_media,
            pending_deletes,
            offline_accounts,
        })
    }
}

/// Apply the caller's state and score onto the stored record.
fn merge_state(mut current: UserMediaState, incoming: &UserMediaState) -> Result<UserMediaState> {
    let score = validate_score(incoming.score)?;
    current.id = current.id.or(incoming.id);
    current.added_at = current.added_at.or(incoming.added_at);
    current.state = incoming.state;
    current.score = if incoming.state == ConsumptionState::Check {
        None
    } else {
        score
    };
    current.touch();
    Ok(current)
}

fn duplicate_title() -> Error {
    Error::validation("title", "media with this title already exists.")
}

fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| Error::validation("password", e.to_string()))?
        .to_string();
    Ok(hash)
}

fn verify_password(password: &str, hash: &str) -> Result<()> {
    let parsed = PasswordHash::new(hash).map_err(|e| Error::Auth(e.to_string()))?;
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .map_err(|_| Error::Auth("invalid credentials".to_string()))
}

/// Stand-in token for accounts the server does not know yet.
fn offline_token() -> String {
    let mut bytes = [0u8; 20];
    OsRng.fill_bytes(&mut bytes);
    let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
    format!("{OFFLINE_TOKEN_PREFIX}{hex}")
}
