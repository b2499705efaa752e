//! redb-backed local store.
//!
//! Tables:
//!   media:       local key (u64)         → JSON Media
//!   user_media:  "{user}:{media_id}"     → JSON UserMediaState
//!   users:       username                → JSON User
//!   meta:        "current_user"          → username
//!                "next_media_key"        → next unused media key
//!                "last_sync:{user}"      → RFC 3339 watermark
//!   tombstones:  "{user}:{kind}:{id}"    → epoch ms of the local delete
//!
//! Keying user_media by (user, media_id) makes the one-state-per-media
//! invariant structural: a second write for the same media replaces the first.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use redb::backends::InMemoryBackend;
use redb::{Database, ReadableTable, TableDefinition};

use super::{LocalStore, MediaRef, Tombstone};
use crate::error::{Error, Result};
use crate::models::{Media, MediaWithUserData, Timestamp, User, UserMediaState};

const MEDIA: TableDefinition<u64, &[u8]> = TableDefinition::new("media");
const USER_MEDIA: TableDefinition<&str, &[u8]> = TableDefinition::new("user_media");
const USERS: TableDefinition<&str, &[u8]> = TableDefinition::new("users");
const META: TableDefinition<&str, &str> = TableDefinition::new("meta");
const TOMBSTONES: TableDefinition<&str, i64> = TableDefinition::new("tombstones");

const CURRENT_USER_KEY: &str = "current_user";
const NEXT_MEDIA_KEY: &str = "next_media_key";

fn user_media_key(username: &str, media_id: i64) -> String {
    format!("{username}:{media_id}")
}

/// Inverse of [`user_media_key`]. Splits on the last ':' so usernames may contain one.
fn split_user_media_key(key: &str) -> Option<(&str, i64)> {
    let (user, id) = key.rsplit_once(':')?;
    Some((user, id.parse().ok()?))
}

fn watermark_key(username: &str) -> String {
    format!("last_sync:{username}")
}

fn tombstone_key(username: &str, tombstone: Tombstone) -> String {
    format!("{username}:{}", tombstone.encode())
}

fn decode_media(key: u64, bytes: &[u8]) -> Result<Media> {
    let mut media: Media = serde_json::from_slice(bytes)?;
    media.local_id = Some(key);
    Ok(media)
}

fn find_key_by_server_id<T>(table: &T, server_id: i64) -> Result<Option<u64>>
where
    T: ReadableTable<u64, &'static [u8]>,
{
    for entry in table.iter()? {
        let (key, value) = entry?;
        let media = decode_media(key.value(), value.value())?;
        if media.id == Some(server_id) {
            return Ok(Some(key.value()));
        }
    }
    Ok(None)
}

pub struct RedbStore {
    db: Database,
    backend: &'static str,
}

impl RedbStore {
    /// Open or create an on-disk store.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| Error::Store(redb::Error::Io(e)))?;
            }
        }
        let db = Database::create(path)?;
        Self::init(db, "redb")
    }

    /// Ephemeral store that lives as long as the value.
    pub fn in_memory() -> Result<Self> {
        let db = Database::builder().create_with_backend(InMemoryBackend::new())?;
        Self::init(db, "redb-memory")
    }

    fn init(db: Database, backend: &'static str) -> Result<Self> {
        // Ensure tables exist
        let txn = db.begin_write()?;
        {
            txn.open_table(MEDIA)?;
            txn.open_table(USER_MEDIA)?;
            txn.open_table(USERS)?;
            txn.open_table(META)?;
            txn.open_table(TOMBSTONES)?;
        }
        txn.commit()?;
        Ok(Self { db, backend })
    }

    fn read_all_media(&self) -> Result<Vec<Media>> {
        let rtxn = self.db.begin_read()?;
        let table = rtxn.open_table(MEDIA)?;
        let mut media = Vec::new();
        for entry in table.iter()? {
            let (key, value) = entry?;
            media.push(decode_media(key.value(), value.value())?);
        }
        Ok(media)
    }

    fn read_media(&self, media: MediaRef) -> Result<Option<Media>> {
        let rtxn = self.db.begin_read()?;
        let table = rtxn.open_table(MEDIA)?;
        let key = match media {
            MediaRef::Local(key) => Some(key),
            MediaRef::Server(id) => find_key_by_server_id(&table, id)?,
        };
        let Some(key) = key else {
            return Ok(None);
        };
        let value = table.get(key)?;
        match value {
            Some(value) => Ok(Some(decode_media(key, value.value())?)),
            None => Ok(None),
        }
    }

    /// Write `media` under an existing key when one matches, else under a new key.
    fn write_media(&self, media: &Media, prefer_key: Option<u64>) -> Result<Media> {
        let json = serde_json::to_vec(media)?;
        let txn = self.db.begin_write()?;
        let key = {
            let mut table = txn.open_table(MEDIA)?;
            let existing = match prefer_key {
                Some(key) if table.get(key)?.is_some() => Some(key),
                _ => match media.id {
                    Some(id) => find_key_by_server_id(&table, id)?,
                    None => None,
                },
            };
            let key = match existing {
                Some(key) => key,
                None => {
                    // Keys are never reused, so a stale `local-N` cannot name a newer row
                    let mut meta = txn.open_table(META)?;
                    let counter = meta
                        .get(NEXT_MEDIA_KEY)?
                        .and_then(|v| v.value().parse::<u64>().ok());
                    let after_last = table.last()?.map(|(k, _)| k.value() + 1).unwrap_or(1);
                    let key = counter.map_or(after_last, |next| next.max(after_last));
                    let next = (key + 1).to_string();
                    meta.insert(NEXT_MEDIA_KEY, next.as_str())?;
                    key
                }
            };
            table.insert(key, json.as_slice())?;
            key
        };
        txn.commit()?;

        let mut stored = media.clone();
        stored.local_id = Some(key);
        Ok(stored)
    }

    fn read_user_media(&self, username: &str) -> Result<Vec<UserMediaState>> {
        let rtxn = self.db.begin_read()?;
        let table = rtxn.open_table(USER_MEDIA)?;
        let mut states = Vec::new();
        for entry in table.iter()? {
            let (key, value) = entry?;
            match split_user_media_key(key.value()) {
                Some((user, _)) if user == username => {
                    states.push(serde_json::from_slice(value.value())?);
                }
                _ => {}
            }
        }
        Ok(states)
    }

    fn read_user(&self, username: &str) -> Result<Option<User>> {
        let rtxn = self.db.begin_read()?;
        let table = rtxn.open_table(USERS)?;
        let value = table.get(username)?;
        match value {
            Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
            None => Ok(None),
        }
    }

    fn write_user(&self, user: &User, make_current: bool) -> Result<()> {
        let json = serde_json::to_vec(user)?;
        let txn = self.db.begin_write()?;
        {
            let mut users = txn.open_table(USERS)?;
            users.insert(user.username.as_str(), json.as_slice())?;
            if make_current {
                let mut meta = txn.open_table(META)?;
                meta.insert(CURRENT_USER_KEY, user.username.as_str())?;
            }
        }
        txn.commit()?;
        Ok(())
    }

    fn read_meta(&self, key: &str) -> Result<Option<String>> {
        let rtxn = self.db.begin_read()?;
        let table = rtxn.open_table(META)?;
        let value = table.get(key)?.map(|v| v.value().to_string());
        Ok(value)
    }
}

#[async_trait]
impl LocalStore for RedbStore {
    fn backend_name(&self) -> &str {
        self.backend
    }

    async fn get_media(&self) -> Result<Vec<Media>> {
        self.read_all_media()
    }

    async fn find_media(&self, media: MediaRef) -> Result<Option<Media>> {
        self.read_media(media)
    }

    async fn add_media(&self, media: &Media) -> Result<Media> {
        self.write_media(media, None)
    }

    async fn update_media(&self, media: &Media) -> Result<Media> {
        self.write_media(media, media.local_id)
    }

    async fn assign_media_id(&self, local_id: u64, server_id: i64) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(MEDIA)?;
            let mut media = match table.get(local_id)? {
                Some(value) => decode_media(local_id, value.value())?,
                None => return Err(Error::not_found("media", MediaRef::Local(local_id))),
            };
            media.id = Some(server_id);
            let json = serde_json::to_vec(&media)?;
            table.insert(local_id, json.as_slice())?;
        }
        txn.commit()?;
        Ok(())
    }

    async fn delete_media(&self, media: MediaRef) -> Result<bool> {
        let txn = self.db.begin_write()?;
        let existed = {
            let mut table = txn.open_table(MEDIA)?;
            let found = match media {
                MediaRef::Local(key) => match table.get(key)? {
                    Some(value) => Some((key, decode_media(key, value.value())?.id)),
                    None => None,
                },
                MediaRef::Server(id) => find_key_by_server_id(&table, id)?.map(|k| (k, Some(id))),
            };

            match found {
                Some((key, server_id)) => {
                    table.remove(key)?;
                    // Cascade: no state may outlive its media
                    if let Some(server_id) = server_id {
                        let mut states = txn.open_table(USER_MEDIA)?;
                        let dangling: Vec<String> = states
                            .iter()?
                            .filter_map(|entry| match entry {
                                Ok((k, _)) => match split_user_media_key(k.value()) {
                                    Some((_, media_id)) if media_id == server_id => {
                                        Some(Ok(k.value().to_string()))
                                    }
                                    _ => None,
                                },
                                Err(e) => Some(Err(e)),
                            })
                            .collect::<std::result::Result<_, _>>()?;
                        for key in dangling {
                            states.remove(key.as_str())?;
                        }
                    }
                    true
                }
                None => false,
            }
        };
        txn.commit()?;
        Ok(existed)
    }

    async fn get_user_media(&self, username: &str) -> Result<Vec<UserMediaState>> {
        self.read_user_media(username)
    }

    async fn user_media_for(&self, username: &str, media_id: i64) -> Result<Option<UserMediaState>> {
        let rtxn = self.db.begin_read()?;
        let table = rtxn.open_table(USER_MEDIA)?;
        let key = user_media_key(username, media_id);
        let value = table.get(key.as_str())?;
        match value {
            Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
            None => Ok(None),
        }
    }

    async fn add_user_media(&self, username: &str, state: &UserMediaState) -> Result<()> {
        let json = serde_json::to_vec(state)?;
        let key = user_media_key(username, state.media_id);
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(USER_MEDIA)?;
            table.insert(key.as_str(), json.as_slice())?;
        }
        txn.commit()?;
        Ok(())
    }

    async fn update_user_media(&self, username: &str, state: &UserMediaState) -> Result<()> {
        let json = serde_json::to_vec(state)?;
        let key = user_media_key(username, state.media_id);
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(USER_MEDIA)?;
            if table.get(key.as_str())?.is_none() {
                return Err(Error::not_found("user media", state.media_id));
            }
            table.insert(key.as_str(), json.as_slice())?;
        }
        txn.commit()?;
        Ok(())
    }

    async fn delete_user_media(&self, username: &str, media_id: i64) -> Result<bool> {
        let key = user_media_key(username, media_id);
        let txn = self.db.begin_write()?;
        let existed = {
            let mut table = txn.open_table(USER_MEDIA)?;
            let removed = table.remove(key.as_str())?.is_some();
            removed
        };
        txn.commit()?;
        Ok(existed)
    }

    async fn get_media_with_user_data(&self, username: &str) -> Result<Vec<MediaWithUserData>> {
        let media = self.read_all_media()?;
        let states: HashMap<i64, UserMediaState> = self
            .read_user_media(username)?
            .into_iter()
            .map(|s| (s.media_id, s))
            .collect();

        Ok(media
            .into_iter()
            .map(|media| {
                let state = media.id.and_then(|id| states.get(&id));
                MediaWithUserData {
                    user_state: state.map(|s| s.state),
                    user_score: state.and_then(|s| s.score),
                    media,
                }
            })
            .collect())
    }

    async fn save_user(&self, user: &User) -> Result<()> {
        self.write_user(user, true)
    }

    async fn get_user(&self, username: &str) -> Result<Option<User>> {
        self.read_user(username)
    }

    async fn get_current_user(&self) -> Result<Option<User>> {
        match self.read_meta(CURRENT_USER_KEY)? {
            Some(username) => self.read_user(&username),
            None => Ok(None),
        }
    }

    async fn clear_current_user(&self) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut meta = txn.open_table(META)?;
            meta.remove(CURRENT_USER_KEY)?;
        }
        txn.commit()?;
        Ok(())
    }

    async fn get_offline_users(&self) -> Result<Vec<User>> {
        let rtxn = self.db.begin_read()?;
        let table = rtxn.open_table(USERS)?;
        let mut users = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            let user: User = serde_json::from_slice(value.value())?;
            if user.is_offline {
                users.push(user);
            }
        }
        Ok(users)
    }

    async fn update_user_status(&self, username: &str, is_offline: bool) -> Result<()> {
        let mut user = self
            .read_user(username)?
            .ok_or_else(|| Error::not_found("user", username))?;
        user.is_offline = is_offline;
        if !is_offline {
            user.password_hash = None;
        }
        self.write_user(&user, false)
    }

    async fn remove_user(&self, username: &str) -> Result<bool> {
        let txn = self.db.begin_write()?;
        let existed = {
            let mut users = txn.open_table(USERS)?;
            let existed = users.remove(username)?.is_some();
            let mut meta = txn.open_table(META)?;
            let is_current = meta
                .get(CURRENT_USER_KEY)?
                .map(|v| v.value() == username)
                .unwrap_or(false);
            if is_current {
                meta.remove(CURRENT_USER_KEY)?;
            }
            existed
        };
        txn.commit()?;
        Ok(existed)
    }

    async fn watermark(&self, username: &str) -> Result<Option<Timestamp>> {
        match self.read_meta(&watermark_key(username))? {
            Some(raw) => match raw.parse() {
                Ok(ts) => Ok(Some(ts)),
                Err(e) => {
                    // Treat as never synced; the next pass rewrites it
                    tracing::warn!("Ignoring corrupt watermark for {}: {}", username, e);
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    async fn set_watermark(&self, username: &str, at: Timestamp) -> Result<()> {
        let key = watermark_key(username);
        let value = at.to_rfc3339();
        let txn = self.db.begin_write()?;
        {
            let mut meta = txn.open_table(META)?;
            meta.insert(key.as_str(), value.as_str())?;
        }
        txn.commit()?;
        Ok(())
    }

    async fn add_tombstone(&self, username: &str, tombstone: Tombstone) -> Result<()> {
        let key = tombstone_key(username, tombstone);
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(TOMBSTONES)?;
            table.insert(key.as_str(), Timestamp::now().as_millis())?;
        }
        txn.commit()?;
        Ok(())
    }

    async fn tombstones(&self, username: &str) -> Result<Vec<Tombstone>> {
        let prefix = format!("{username}:");
        let rtxn = self.db.begin_read()?;
        let table = rtxn.open_table(TOMBSTONES)?;
        let mut found = Vec::new();
        for entry in table.iter()? {
            let (key, _) = entry?;
            if let Some(t) = key.value().strip_prefix(&prefix).and_then(Tombstone::decode) {
                found.push(t);
            }
        }
        Ok(found)
    }

    async fn clear_tombstone(&self, username: &str, tombstone: Tombstone) -> Result<()> {
        let key = tombstone_key(username, tombstone);
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(TOMBSTONES)?;
            table.remove(key.as_str())?;
        }
        txn.commit()?;
        Ok(())
    }
}
