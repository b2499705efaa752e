//! Reconciliation between the local store and the remote collections.
//!
//! A pass is either a pull (`sync_down`), a push (`sync_up`) or both
//! (`sync`, push first so local edits reach the server before the watermark
//! moves past them). The per-user watermark marks the start of the last pass
//! that completed.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::ConflictPolicy;
use crate::error::{Error, Result};
use crate::models::{Media, Timestamp, UserMediaState};
use crate::remote::RemoteApi;
use crate::session::Session;
use crate::store::{LocalStore, MediaRef, Tombstone};

/// What a pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub media_inserted: usize,
    pub media_updated: usize,
    pub states_inserted: usize,
    pub states_updated: usize,
    pub duplicates_collapsed: usize,
    pub skipped_malformed: usize,
    pub skipped_tombstoned: usize,
    pub media_pushed: usize,
    /// Unsynced media whose title already existed remotely, folded into the server row.
    pub media_merged: usize,
    pub deletes_pushed: usize,
    pub states_pushed: usize,
    pub push_failures: usize,
}

impl SyncReport {
    pub fn pulled(&self) -> usize {
        self.media_inserted + self.media_updated + self.states_inserted + self.states_updated
    }

    pub fn pushed(&self) -> usize {
        self.media_pushed + self.deletes_pushed + self.states_pushed
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Completed(SyncReport),
    /// Another pass was in flight; this trigger was collapsed into it.
    AlreadyRunning,
    /// Nothing attempted: the remote is unreachable or the account is local-only.
    Offline,
}

pub struct Reconciler {
    store: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteApi>,
    policy: ConflictPolicy,
    in_flight: Mutex<()>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn LocalStore>, remote: Arc<dyn RemoteApi>, policy: ConflictPolicy) -> Self {
        Self {
            store,
            remote,
            policy,
            in_flight: Mutex::new(()),
        }
    }

    pub fn policy(&self) -> ConflictPolicy {
        self.policy
    }

    /// Pull both remote collections into the store.
    ///
    /// All-or-nothing with respect to the watermark: any fetch or store
    /// failure aborts the pass and leaves the watermark where it was.
    pub async fn sync_down(&self, session: &Session) -> Result<SyncOutcome> {
        let Ok(_guard) = self.in_flight.try_lock() else {
            debug!("sync already in flight, collapsing pull");
            return Ok(SyncOutcome::AlreadyRunning);
        };
        require_remote_account(session)?;

        let started = Timestamp::now();
        let t_last = self.last_sync(session).await?;
        let mut report = SyncReport::default();
        self.pull(session, t_last, started, &mut report).await?;
        self.store.set_watermark(&session.username, started).await?;

        info!(
            "pulled {} records for {} ({} skipped)",
            report.pulled(),
            session.username,
            report.skipped_malformed + report.skipped_tombstoned
        );
        Ok(SyncOutcome::Completed(report))
    }

    /// Push local changes made since the last sync.
    ///
    /// Per-record failures are logged and counted, and the watermark advances
    /// regardless. Losing the connection mid-pass aborts it instead.
    pub async fn sync_up(&self, session: &Session) -> Result<SyncOutcome> {
        let Ok(_guard) = self.in_flight.try_lock() else {
            debug!("sync already in flight, collapsing push");
            return Ok(SyncOutcome::AlreadyRunning);
        };
        require_remote_account(session)?;

        let started = Timestamp::now();
        let t_last = self.last_sync(session).await?;
        let mut report = SyncReport::default();
        self.push(session, t_last, &mut report).await?;
        self.store.set_watermark(&session.username, started).await?;

        info!(
            "pushed {} records for {} ({} failed)",
            report.pushed(),
            session.username,
            report.push_failures
        );
        Ok(SyncOutcome::Completed(report))
    }

    /// Push, then pull, against a single watermark reading.
    pub async fn sync(&self, session: &Session) -> Result<SyncOutcome> {
        let Ok(_guard) = self.in_flight.try_lock() else {
            debug!("sync already in flight, collapsing trigger");
            return Ok(SyncOutcome::AlreadyRunning);
        };
        require_remote_account(session)?;

        let started = Timestamp::now();
        let t_last = self.last_sync(session).await?;
        let mut report = SyncReport::default();
        self.push(session, t_last, &mut report).await?;
        self.pull(session, t_last, started, &mut report).await?;
        self.store.set_watermark(&session.username, started).await?;

        info!(
            "synced {}: pushed {}, pulled {}, {} push failures",
            session.username,
            report.pushed(),
            report.pulled(),
            report.push_failures
        );
        Ok(SyncOutcome::Completed(report))
    }

    async fn last_sync(&self, session: &Session) -> Result<Timestamp> {
        Ok(self
            .store
            .watermark(&session.username)
            .await?
            .unwrap_or(Timestamp::EPOCH))
    }

    async fn pull(
        &self,
        session: &Session,
        t_last: Timestamp,
        started: Timestamp,
        report: &mut SyncReport,
    ) -> Result<()> {
        let user = session.username.as_str();

        // Both snapshots first: a failed fetch must not leave a half-applied pass
        let remote_media = self.remote.list_media(&session.token).await?;
        let remote_states = self.remote.list_user_media(&session.token).await?;
        let tombstones: HashSet<Tombstone> = self.store.tombstones(user).await?.into_iter().collect();

        for media in remote_media {
            let Some(id) = media.id else {
                warn!("skipping remote media '{}' without id", media.title);
                report.skipped_malformed += 1;
                continue;
            };
            if tombstones.contains(&Tombstone::Media(id)) {
                report.skipped_tombstoned += 1;
                continue;
            }

            match self.store.find_media(MediaRef::Server(id)).await? {
                None => {
                    self.store.add_media(&media).await?;
                    report.media_inserted += 1;
                }
                Some(local) => {
                    let changed = !local.same_content(&media);
                    let eligible = match self.policy {
                        ConflictPolicy::PerRecord => true,
                        ConflictPolicy::Watermark => media.created_at.is_some_and(|c| c > t_last),
                    };
                    if changed && eligible {
                        let mut updated = media;
                        updated.local_id = local.local_id;
                        self.store.update_media(&updated).await?;
                        report.media_updated += 1;
                    }
                }
            }
        }

        // The server may hold several rows per media; keep the newest
        let mut latest: BTreeMap<i64, UserMediaState> = BTreeMap::new();
        for remote in remote_states {
            if let Some(id) = remote.id {
                if tombstones.contains(&Tombstone::UserMedia(id)) {
                    report.skipped_tombstoned += 1;
                    continue;
                }
            }
            let remote_id = remote.id;
            let Some(state) = remote.into_state() else {
                warn!("skipping remote user media {:?} without media_id", remote_id);
                report.skipped_malformed += 1;
                continue;
            };
            match latest.get(&state.media_id) {
                Some(existing) => {
                    report.duplicates_collapsed += 1;
                    if state.updated_at > existing.updated_at {
                        latest.insert(state.media_id, state);
                    }
                }
                None => {
                    latest.insert(state.media_id, state);
                }
            }
        }

        for (media_id, state) in latest {
            if self.store.find_media(MediaRef::Server(media_id)).await?.is_none() {
                warn!("skipping user media for unknown media {}", media_id);
                report.skipped_malformed += 1;
                continue;
            }

            match self.store.user_media_for(user, media_id).await? {
                None => {
                    self.store.add_user_media(user, &state).await?;
                    report.states_inserted += 1;
                }
                Some(mut local) => {
                    let remote_wins = match self.policy {
                        ConflictPolicy::PerRecord => state.updated_at > local.updated_at,
                        ConflictPolicy::Watermark => state.updated_at > t_last,
                    };
                    if remote_wins {
                        if state != local {
                            self.store.add_user_media(user, &state).await?;
                            report.states_updated += 1;
                        }
                    } else if local.id.is_none() && state.id.is_some() {
                        // Local edit wins but the row already exists remotely, where
                        // a create is refused. Stamp it past this pass so the next
                        // push sends it as an update.
                        local.id = state.id;
                        if local.state != state.state || local.score != state.score {
                            local.updated_at = Timestamp::next_after(Some(started.max(local.updated_at)));
                            debug!("state for media {} queued as an update of {:?}", media_id, local.id);
                        }
                        self.store.add_user_media(user, &local).await?;
                    }
                }
            }
        }

        Ok(())
    }

    async fn push(&self, session: &Session, t_last: Timestamp, report: &mut SyncReport) -> Result<()> {
        let user = session.username.as_str();
        let token = session.token.as_str();

        // Media created while offline; states can only reference them once they have ids
        let unsynced = self.store.get_media().await?.into_iter().filter(|m| !m.is_synced());
        let mut remote_catalog: Option<Vec<Media>> = None;
        for media in unsynced {
            match self.remote.create_media(token, &media).await {
                Ok(created) => match (media.local_id, created.id) {
                    (Some(local_id), Some(server_id)) => {
                        self.store.assign_media_id(local_id, server_id).await?;
                        debug!("media '{}' synced as {}", media.title, server_id);
                        report.media_pushed += 1;
                    }
                    _ => {
                        warn!("server accepted media '{}' without returning an id", media.title);
                        report.push_failures += 1;
                    }
                },
                Err(e) if e.is_unavailable() => return Err(e),
                Err(Error::Validation { field, message }) if field == "title" => {
                    if remote_catalog.is_none() {
                        remote_catalog = Some(self.remote.list_media(token).await?);
                    }
                    let existing = remote_catalog
                        .iter()
                        .flatten()
                        .find(|m| m.title == media.title)
                        .and_then(|m| m.id);
                    match (media.local_id, existing) {
                        (Some(local_id), Some(server_id)) => {
                            self.merge_unsynced_media(local_id, server_id).await?;
                            info!("media '{}' already on the server as {}, merged", media.title, server_id);
                            report.media_merged += 1;
                        }
                        _ => {
                            warn!("failed to push media '{}': title: {}", media.title, message);
                            report.push_failures += 1;
                        }
                    }
                }
                Err(e) => {
                    warn!("failed to push media '{}': {}", media.title, e);
                    report.push_failures += 1;
                }
            }
        }

        for tombstone in self.store.tombstones(user).await? {
            let result = match tombstone {
                Tombstone::Media(id) => self.remote.delete_media(token, id).await,
                Tombstone::UserMedia(id) => self.remote.delete_user_media(token, id).await,
            };
            match result {
                Ok(()) | Err(Error::NotFound { .. }) => {
                    self.store.clear_tombstone(user, tombstone).await?;
                    report.deletes_pushed += 1;
                }
                Err(e) if e.is_unavailable() => return Err(e),
                Err(e) => {
                    warn!("failed to push delete {:?}: {}", tombstone, e);
                    report.push_failures += 1;
                }
            }
        }

        for state in self.store.get_user_media(user).await? {
            if state.updated_at <= t_last {
                continue;
            }
            match self.push_state(token, &state).await {
                Ok(saved) => {
                    if saved.id != state.id {
                        self.store.add_user_media(user, &saved).await?;
                    }
                    report.states_pushed += 1;
                }
                Err(e) if e.is_unavailable() => return Err(e),
                Err(e) => {
                    warn!("failed to push state for media {}: {}", state.media_id, e);
                    report.push_failures += 1;
                }
            }
        }

        Ok(())
    }

    /// Point an unsynced row at an existing server row. If an earlier pull
    /// already stored that server row, the unsynced copy is dropped instead.
    async fn merge_unsynced_media(&self, local_id: u64, server_id: i64) -> Result<()> {
        match self.store.find_media(MediaRef::Server(server_id)).await? {
            Some(_) => {
                self.store.delete_media(MediaRef::Local(local_id)).await?;
            }
            None => self.store.assign_media_id(local_id, server_id).await?,
        }
        Ok(())
    }

    /// Send one state: update when it has a server id, create otherwise.
    pub(crate) async fn push_state(&self, token: &str, state: &UserMediaState) -> Result<UserMediaState> {
        match state.id {
            Some(_) => match self.remote.update_user_media(token, state).await {
                // The server lost the row; recreate it
                Err(Error::NotFound { .. }) => {
                    let fresh = UserMediaState {
                        id: None,
                        ..state.clone()
                    };
                    self.remote.create_user_media(token, &fresh).await
                }
                other => other,
            },
            None => self.remote.create_user_media(token, state).await,
        }
    }
}

fn require_remote_account(session: &Session) -> Result<()> {
    if session.is_offline {
        return Err(Error::Auth(format!(
            "{} is a local-only account; upgrade it before syncing",
            session.username
        )));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::{ConsumptionState, MediaType};
    use crate::remote::RemoteUserMedia;
    use crate::store::RedbStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
    use std::sync::Mutex as StdMutex;

    /// In-memory stand-in for the API.
    #[derive(Default)]
    pub(crate) struct MockRemote {
        pub media: StdMutex<Vec<Media>>,
        pub states: StdMutex<Vec<RemoteUserMedia>>,
        pub deleted: StdMutex<Vec<Tombstone>>,
        pub reject_states_for: StdMutex<HashSet<i64>>,
        pub down: AtomicBool,
        pub next_id: AtomicI64,
    }

    impl MockRemote {
        fn check(&self) -> Result<()> {
            if self.down.load(Ordering::SeqCst) {
                return Err(Error::RemoteUnavailable("connection refused".into()));
            }
            Ok(())
        }

        fn allocate_id(&self) -> i64 {
            self.next_id.fetch_add(1, Ordering::SeqCst) + 100
        }

        pub fn with_media(self, id: i64, title: &str) -> Self {
            self.media.lock().unwrap().push(media(Some(id), title));
            self
        }

        pub fn with_state(self, id: i64, media_id: i64, state: u8, score: Option<u8>, updated_at: &str) -> Self {
            self.states.lock().unwrap().push(RemoteUserMedia {
                id: Some(id),
                media_id: Some(media_id),
                state: Some(ConsumptionState::try_from(state).unwrap()),
                score,
                updated_at: Some(updated_at.parse().unwrap()),
                ..RemoteUserMedia::default()
            });
            self
        }
    }

    #[async_trait]
    impl RemoteApi for MockRemote {
        async fn authenticate(&self, _username: &str, password: &str) -> Result<String> {
            self.check()?;
            if password == "wrong" {
                return Err(Error::Auth("Unable to log in".into()));
            }
            Ok("token-abc".to_string())
        }

        async fn register(&self, _username: &str, _password: &str) -> Result<()> {
            self.check()
        }

        async fn list_media(&self, _token: &str) -> Result<Vec<Media>> {
            self.check()?;
            Ok(self.media.lock().unwrap().clone())
        }

        async fn create_media(&self, _token: &str, media: &Media) -> Result<Media> {
            self.check()?;
            let mut items = self.media.lock().unwrap();
            if items.iter().any(|m| m.title == media.title) {
                return Err(Error::validation("title", "media with this title already exists."));
            }
            let mut created = media.clone();
            created.id = Some(self.allocate_id());
            created.local_id = None;
            items.push(created.clone());
            created.local_id = media.local_id;
            Ok(created)
        }

        async fn delete_media(&self, _token: &str, id: i64) -> Result<()> {
            self.check()?;
            let mut items = self.media.lock().unwrap();
            let before = items.len();
            items.retain(|m| m.id != Some(id));
            if items.len() == before {
                return Err(Error::not_found("media", id));
            }
            self.deleted.lock().unwrap().push(Tombstone::Media(id));
            Ok(())
        }

        async fn list_user_media(&self, _token: &str) -> Result<Vec<RemoteUserMedia>> {
            self.check()?;
            Ok(self.states.lock().unwrap().clone())
        }

        async fn create_user_media(&self, _token: &str, state: &UserMediaState) -> Result<UserMediaState> {
            self.check()?;
            if self.reject_states_for.lock().unwrap().contains(&state.media_id) {
                return Err(Error::validation("media_id", "Invalid pk"));
            }
            let saved = UserMediaState {
                id: Some(self.allocate_id()),
                ..state.clone()
            };
            self.states.lock().unwrap().push(remote_from(&saved));
            Ok(saved)
        }

        async fn update_user_media(&self, _token: &str, state: &UserMediaState) -> Result<UserMediaState> {
            self.check()?;
            let mut states = self.states.lock().unwrap();
            let Some(slot) = states.iter_mut().find(|s| s.id == state.id) else {
                return Err(Error::not_found("user media", state.id.unwrap_or_default()));
            };
            *slot = remote_from(state);
            Ok(state.clone())
        }

        async fn delete_user_media(&self, _token: &str, id: i64) -> Result<()> {
            self.check()?;
            self.states.lock().unwrap().retain(|s| s.id != Some(id));
            self.deleted.lock().unwrap().push(Tombstone::UserMedia(id));
            Ok(())
        }
    }

    fn remote_from(state: &UserMediaState) -> RemoteUserMedia {
        RemoteUserMedia {
            id: state.id,
            media_id: Some(state.media_id),
            media: None,
            state: Some(state.state),
            score: state.score,
            added_at: state.added_at,
            updated_at: Some(state.updated_at),
        }
    }

    pub(crate) fn media(id: Option<i64>, title: &str) -> Media {
        Media {
            id,
            local_id: None,
            title: title.to_string(),
            media_type: MediaType::Cinema,
            url: None,
            plot: None,
            chapters: None,
            quotes: Vec::new(),
            created_at: Some("2024-01-01T00:00:00Z".parse().unwrap()),
        }
    }

    fn session() -> Session {
        Session {
            username: "john_doe".to_string(),
            token: "token-abc".to_string(),
            is_offline: false,
        }
    }

    fn setup(remote: MockRemote, policy: ConflictPolicy) -> (Arc<RedbStore>, Arc<MockRemote>, Reconciler) {
        let store = Arc::new(RedbStore::in_memory().unwrap());
        let remote = Arc::new(remote);
        let reconciler = Reconciler::new(store.clone(), remote.clone(), policy);
        (store, remote, reconciler)
    }

    fn completed(outcome: SyncOutcome) -> SyncReport {
        match outcome {
            SyncOutcome::Completed(report) => report,
            other => panic!("expected a completed pass, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_pull_into_empty_store() {
        let remote = MockRemote::default()
            .with_media(1, "Dune")
            .with_state(1, 1, 0, None, "2024-01-01T00:00:00Z");
        let (store, _, reconciler) = setup(remote, ConflictPolicy::PerRecord);
        let before = Timestamp::now();

        let report = completed(reconciler.sync_down(&session()).await.unwrap());
        assert_eq!(report.media_inserted, 1);
        assert_eq!(report.states_inserted, 1);

        let media = store.get_media().await.unwrap();
        assert_eq!(media.len(), 1);
        assert_eq!(media[0].id, Some(1));
        assert_eq!(media[0].title, "Dune");

        let states = store.get_user_media("john_doe").await.unwrap();
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].state, ConsumptionState::Check);
        assert_eq!(states[0].updated_at, "2024-01-01T00:00:00Z".parse().unwrap());

        let watermark = store.watermark("john_doe").await.unwrap().unwrap();
        assert!(watermark >= before);
    }

    #[tokio::test]
    async fn test_remote_newer_than_watermark_overwrites() {
        for policy in [ConflictPolicy::PerRecord, ConflictPolicy::Watermark] {
            let remote = MockRemote::default()
                .with_media(1, "Dune")
                .with_state(5, 1, 3, Some(9), "2024-02-01");
            let (store, _, reconciler) = setup(remote, policy);
            store.add_media(&media(Some(1), "Dune")).await.unwrap();
            let local = UserMediaState {
                id: Some(5),
                media_id: 1,
                state: ConsumptionState::Check,
                score: None,
                added_at: None,
                updated_at: "2024-01-01".parse().unwrap(),
            };
            store.add_user_media("john_doe", &local).await.unwrap();
            store
                .set_watermark("john_doe", "2024-01-15".parse().unwrap())
                .await
                .unwrap();

            reconciler.sync_down(&session()).await.unwrap();

            let state = store.user_media_for("john_doe", 1).await.unwrap().unwrap();
            assert_eq!(state.state, ConsumptionState::Done, "{policy:?}");
            assert_eq!(state.score, Some(9), "{policy:?}");
        }
    }

    #[tokio::test]
    async fn test_per_record_keeps_newer_local_state() {
        let remote = MockRemote::default()
            .with_media(1, "Dune")
            .with_state(5, 1, 1, None, "2024-01-01");
        let (store, _, reconciler) = setup(remote, ConflictPolicy::PerRecord);
        store.add_media(&media(Some(1), "Dune")).await.unwrap();
        let local = UserMediaState {
            id: Some(5),
            media_id: 1,
            state: ConsumptionState::Done,
            score: Some(7),
            added_at: None,
            updated_at: "2024-03-01".parse().unwrap(),
        };
        store.add_user_media("john_doe", &local).await.unwrap();

        let report = completed(reconciler.sync_down(&session()).await.unwrap());
        assert_eq!(report.states_updated, 0);
        assert_eq!(store.user_media_for("john_doe", 1).await.unwrap(), Some(local));
    }

    #[tokio::test]
    async fn test_pull_is_idempotent() {
        let remote = MockRemote::default()
            .with_media(1, "Dune")
            .with_media(2, "Naruto")
            .with_state(1, 1, 2, Some(6), "2024-01-01")
            .with_state(2, 2, 3, Some(9), "2024-01-02");
        let (store, _, reconciler) = setup(remote, ConflictPolicy::PerRecord);

        reconciler.sync_down(&session()).await.unwrap();
        let media = store.get_media().await.unwrap();
        let states = store.get_user_media("john_doe").await.unwrap();

        let report = completed(reconciler.sync_down(&session()).await.unwrap());
        assert_eq!(report.pulled(), 0);
        assert_eq!(store.get_media().await.unwrap(), media);
        assert_eq!(store.get_user_media("john_doe").await.unwrap(), states);
    }

    #[tokio::test]
    async fn test_malformed_state_is_skipped() {
        let remote = MockRemote::default()
            .with_media(1, "Dune")
            .with_state(2, 1, 1, None, "2024-01-01");
        remote.states.lock().unwrap().insert(
            0,
            RemoteUserMedia {
                id: Some(1),
                state: Some(ConsumptionState::Done),
                ..RemoteUserMedia::default()
            },
        );
        let (store, _, reconciler) = setup(remote, ConflictPolicy::PerRecord);

        let report = completed(reconciler.sync_down(&session()).await.unwrap());
        assert_eq!(report.skipped_malformed, 1);
        assert_eq!(report.states_inserted, 1);

        let states = store.get_user_media("john_doe").await.unwrap();
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].id, Some(2));
    }

    #[tokio::test]
    async fn test_duplicate_remote_states_collapse_to_newest() {
        let remote = MockRemote::default()
            .with_media(1, "Dune")
            .with_state(1, 1, 1, None, "2024-01-01")
            .with_state(2, 1, 3, Some(8), "2024-02-01")
            .with_state(3, 1, 2, None, "2024-01-15");
        let (store, _, reconciler) = setup(remote, ConflictPolicy::PerRecord);

        let report = completed(reconciler.sync_down(&session()).await.unwrap());
        assert_eq!(report.duplicates_collapsed, 2);

        let states = store.get_user_media("john_doe").await.unwrap();
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].id, Some(2));
        assert_eq!(states[0].state, ConsumptionState::Done);
    }

    #[tokio::test]
    async fn test_failed_pull_keeps_watermark() {
        let remote = MockRemote::default().with_media(1, "Dune");
        remote.down.store(true, Ordering::SeqCst);
        let (store, _, reconciler) = setup(remote, ConflictPolicy::PerRecord);

        let err = reconciler.sync_down(&session()).await.unwrap_err();
        assert!(err.is_unavailable());
        assert!(store.watermark("john_doe").await.unwrap().is_none());
        assert!(store.get_media().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_push_assigns_server_ids() {
        let (store, remote, reconciler) = setup(MockRemote::default(), ConflictPolicy::PerRecord);
        let local = store.add_media(&media(None, "Blame!")).await.unwrap();
        assert!(!local.is_synced());

        let report = completed(reconciler.sync_up(&session()).await.unwrap());
        assert_eq!(report.media_pushed, 1);

        let synced = store
            .find_media(MediaRef::Local(local.local_id.unwrap()))
            .await
            .unwrap()
            .unwrap();
        let server_id = synced.id.expect("server id assigned");
        assert!(remote
            .media
            .lock()
            .unwrap()
            .iter()
            .any(|m| m.id == Some(server_id) && m.title == "Blame!"));
    }

    #[tokio::test]
    async fn test_push_continues_past_failed_record() {
        let (store, remote, reconciler) = setup(MockRemote::default(), ConflictPolicy::PerRecord);
        remote.reject_states_for.lock().unwrap().insert(1);
        for id in [1, 2] {
            store.add_media(&media(Some(id), &format!("m{id}"))).await.unwrap();
            let mut state = UserMediaState::new(id);
            state.set_state(ConsumptionState::Viewing);
            store.add_user_media("john_doe", &state).await.unwrap();
        }

        let report = completed(reconciler.sync_up(&session()).await.unwrap());
        assert_eq!(report.states_pushed, 1);
        assert_eq!(report.push_failures, 1);
        assert!(store.watermark("john_doe").await.unwrap().is_some());

        let pushed = store.user_media_for("john_doe", 2).await.unwrap().unwrap();
        assert!(pushed.id.is_some());
        let rejected = store.user_media_for("john_doe", 1).await.unwrap().unwrap();
        assert!(rejected.id.is_none());
    }

    #[tokio::test]
    async fn test_push_only_sends_changes_after_watermark() {
        let remote = MockRemote::default()
            .with_media(1, "Dune")
            .with_state(5, 1, 1, None, "2024-01-01");
        let (store, remote, reconciler) = setup(remote, ConflictPolicy::PerRecord);
        reconciler.sync_down(&session()).await.unwrap();

        let report = completed(reconciler.sync_up(&session()).await.unwrap());
        assert_eq!(report.states_pushed, 0);

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let mut state = store.user_media_for("john_doe", 1).await.unwrap().unwrap();
        state.set_state(ConsumptionState::Done);
        store.add_user_media("john_doe", &state).await.unwrap();

        let report = completed(reconciler.sync_up(&session()).await.unwrap());
        assert_eq!(report.states_pushed, 1);
        let remote_state = remote.states.lock().unwrap()[0].clone();
        assert_eq!(remote_state.state, Some(ConsumptionState::Done));
    }

    #[tokio::test]
    async fn test_unavailable_push_does_not_advance_watermark() {
        let (store, remote, reconciler) = setup(MockRemote::default(), ConflictPolicy::PerRecord);
        store.add_media(&media(None, "Akira")).await.unwrap();
        remote.down.store(true, Ordering::SeqCst);

        assert!(reconciler.sync_up(&session()).await.unwrap_err().is_unavailable());
        assert!(store.watermark("john_doe").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_tombstones_are_pushed_and_respected() {
        let remote = MockRemote::default()
            .with_media(1, "Dune")
            .with_media(2, "Akira");
        let (store, remote, reconciler) = setup(remote, ConflictPolicy::PerRecord);
        store.add_tombstone("john_doe", Tombstone::Media(2)).await.unwrap();
        store.add_tombstone("john_doe", Tombstone::Media(99)).await.unwrap();

        // A pull alone must not resurrect the deleted row
        let report = completed(reconciler.sync_down(&session()).await.unwrap());
        assert_eq!(report.skipped_tombstoned, 1);
        assert!(store.find_media(MediaRef::Server(2)).await.unwrap().is_none());

        let report = completed(reconciler.sync(&session()).await.unwrap());
        assert_eq!(report.deletes_pushed, 2);
        assert!(store.tombstones("john_doe").await.unwrap().is_empty());
        assert_eq!(*remote.deleted.lock().unwrap(), vec![Tombstone::Media(2)]);
    }

    #[tokio::test]
    async fn test_refused_create_is_sent_as_update_next_pass() {
        // Another device already stored an older state for this media
        let remote = MockRemote::default()
            .with_media(1, "Dune")
            .with_state(5, 1, 1, None, "2024-01-01");
        let (store, remote, reconciler) = setup(remote, ConflictPolicy::PerRecord);
        store.add_media(&media(Some(1), "Dune")).await.unwrap();
        let mut local = UserMediaState::new(1);
        local.set_state(ConsumptionState::Done);
        store.add_user_media("john_doe", &local).await.unwrap();
        remote.reject_states_for.lock().unwrap().insert(1);
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let first = completed(reconciler.sync(&session()).await.unwrap());
        assert_eq!(first.push_failures, 1);
        let kept = store.user_media_for("john_doe", 1).await.unwrap().unwrap();
        assert_eq!(kept.state, ConsumptionState::Done);
        assert_eq!(kept.id, Some(5));

        remote.reject_states_for.lock().unwrap().clear();
        let second = completed(reconciler.sync(&session()).await.unwrap());
        assert_eq!(second.states_pushed, 1);

        let states = remote.states.lock().unwrap().clone();
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].id, Some(5));
        assert_eq!(states[0].state, Some(ConsumptionState::Done));
    }

    #[tokio::test]
    async fn test_unsynced_media_with_taken_title_merges() {
        let (store, remote, reconciler) = setup(
            MockRemote::default().with_media(1, "Dune"),
            ConflictPolicy::PerRecord,
        );
        store.add_media(&media(None, "Dune")).await.unwrap();

        let report = completed(reconciler.sync(&session()).await.unwrap());
        assert_eq!(report.media_merged, 1);
        assert_eq!(report.push_failures, 0);

        for _ in 0..2 {
            completed(reconciler.sync(&session()).await.unwrap());
        }
        let rows = store.get_media().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, Some(1));
        assert_eq!(remote.media.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unsynced_duplicate_of_pulled_media_is_dropped() {
        let (store, _, reconciler) = setup(
            MockRemote::default().with_media(1, "Dune"),
            ConflictPolicy::PerRecord,
        );
        let pending = store.add_media(&media(None, "Dune")).await.unwrap();
        reconciler.sync_down(&session()).await.unwrap();
        assert_eq!(store.get_media().await.unwrap().len(), 2);

        let report = completed(reconciler.sync_up(&session()).await.unwrap());
        assert_eq!(report.media_merged, 1);
        assert!(store
            .find_media(MediaRef::Local(pending.local_id.unwrap()))
            .await
            .unwrap()
            .is_none());
        let rows = store.get_media().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows.iter().all(|m| m.is_synced()));
    }

    #[tokio::test]
    async fn test_overlapping_sync_collapses() {
        let (_, _, reconciler) = setup(MockRemote::default(), ConflictPolicy::PerRecord);
        let _held = reconciler.in_flight.lock().await;
        assert_eq!(reconciler.sync(&session()).await.unwrap(), SyncOutcome::AlreadyRunning);
        assert_eq!(reconciler.sync_down(&session()).await.unwrap(), SyncOutcome::AlreadyRunning);
    }

    #[tokio::test]
    async fn test_offline_account_is_refused() {
        let (_, _, reconciler) = setup(MockRemote::default(), ConflictPolicy::PerRecord);
        let offline = Session {
            is_offline: true,
            ..session()
        };
        assert!(matches!(reconciler.sync(&offline).await, Err(Error::Auth(_))));
    }
}
