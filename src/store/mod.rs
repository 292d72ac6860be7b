//! The synchronization store.
//!
//! [`SyncStore`] owns the in-memory note collection. Every local mutation is
//! committed synchronously under a short lock and returns at once; remote
//! writes run as tracked tasks whose outcomes come back through
//! [`SyncStore::reconcile`], the same entry point the realtime listener uses.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::config::AppConfig;
use crate::gateway::{GatewayError, RemoteNotes};
use crate::model::{generate_public_slug, normalize_tag, Note, NoteColor, NotePatch, SortMode};
use crate::realtime::{self, Subscription};
use crate::storage::LocalState;

mod persist;
mod state;

pub use persist::PersistedState;
pub use state::{Reconcile, StoreState};

use state::{FollowUp, WriteJob, WriteKind};

const HAS_SYNCED_FLAG: &str = "has_synced_to_cloud";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("user not authenticated")]
    Unauthenticated,
    #[error("note {0} not found")]
    NoteNotFound(String),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreOptions {
    pub page_size: usize,
    pub storage_key: String,
    pub storage_version: u32,
    pub default_sort: SortMode,
}

impl StoreOptions {
    pub fn versioned_key(&self) -> String {
        format!("{}:v{}", self.storage_key, self.storage_version)
    }
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for StoreOptions {
    fn from(config: &AppConfig) -> Self {
        Self {
            page_size: config.sync.page_size,
            storage_key: config.sync.storage_key.clone(),
            storage_version: config.sync.storage_version,
            default_sort: config.default_sort,
        }
    }
}

/// Counts from one pass over the pending set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepSummary {
    pub synced: usize,
    pub failed: usize,
    pub skipped: usize,
}

#[derive(Clone)]
pub struct SyncStore {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<StoreState>,
    gateway: RemoteNotes,
    options: StoreOptions,
    local: Option<LocalState>,
    synced_this_session: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncStore {
    /// Store without persistence; state lives only as long as the process.
    pub fn new(gateway: RemoteNotes, options: StoreOptions) -> Self {
        let state = StoreState::new(options.default_sort);
        Self::assemble(gateway, options, None, state)
    }

    /// Store backed by `local`, initialised from its snapshot. A missing or
    /// unreadable snapshot starts an empty collection.
    pub fn with_local_state(gateway: RemoteNotes, options: StoreOptions, local: LocalState) -> Self {
        let key = options.versioned_key();
        let restored = match local.read(&key) {
            Ok(Some(raw)) => PersistedState::decode(&raw, options.storage_version),
            Ok(None) => None,
            Err(err) => {
                tracing::warn!(error = %format!("{err:#}"), "reading persisted notes failed");
                None
            }
        };
        let state = match restored {
            Some(snapshot) => {
                tracing::debug!(
                    notes = snapshot.notes.len(),
                    pending = snapshot.pending.len(),
                    "restored persisted notes"
                );
                StoreState::from_snapshot(snapshot)
            }
            None => StoreState::new(options.default_sort),
        };
        Self::assemble(gateway, options, Some(local), state)
    }

    fn assemble(
        gateway: RemoteNotes,
        options: StoreOptions,
        local: Option<LocalState>,
        state: StoreState,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(state),
                gateway,
                options,
                local,
                synced_this_session: AtomicBool::new(false),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn options(&self) -> &StoreOptions {
        &self.inner.options
    }

    /// Runs `read` against the current state under the lock.
    pub fn read<R>(&self, read: impl FnOnce(&StoreState) -> R) -> R {
        read(&*self.inner.state.lock())
    }

    pub fn notes(&self) -> Vec<Note> {
        self.read(|state| state.notes().cloned().collect())
    }

    pub fn note(&self, id: &str) -> Option<Note> {
        self.read(|state| state.note(id).cloned())
    }

    pub fn active_note(&self) -> Option<Note> {
        self.read(|state| state.active_note().cloned())
    }

    pub fn filtered_notes(&self) -> Vec<Note> {
        self.read(|state| state.filtered_notes().into_iter().cloned().collect())
    }

    pub fn all_tags(&self) -> Vec<String> {
        self.read(StoreState::all_tags)
    }

    pub fn pending_ids(&self) -> Vec<String> {
        self.read(|state| state.pending.iter().cloned().collect())
    }

    pub fn is_offline(&self) -> bool {
        self.read(|state| state.offline)
    }

    pub fn is_loading(&self) -> bool {
        self.read(|state| state.loading)
    }

    pub fn has_more(&self) -> bool {
        self.read(|state| state.has_more)
    }

    pub fn page(&self) -> usize {
        self.read(|state| state.page)
    }

    pub fn sort_mode(&self) -> SortMode {
        self.read(|state| state.sort_mode)
    }

    /// Creates an empty local note, makes it active and starts its remote
    /// creation. Returns the local id.
    pub fn create_note(&self) -> String {
        let id = self.commit(|state| state.insert_local(Note::empty()));
        tracing::info!(note_id = %id, "note created");
        self.dispatch(&id);
        id
    }

    /// Copies content, tags, colour and flags into a new local note. The copy
    /// is unowned and unpublished.
    pub fn duplicate_note(&self, id: &str) -> Result<String, StoreError> {
        let copy_id = self
            .commit(|state| {
                let source = state.note(id)?;
                let mut copy = Note::empty();
                copy.title = format!("{} (copy)", source.title);
                copy.content = source.content.clone();
                copy.tags = source.tags.clone();
                copy.color = source.color;
                copy.is_pinned = source.is_pinned;
                copy.is_archived = source.is_archived;
                Some(state.insert_local(copy))
            })
            .ok_or_else(|| StoreError::NoteNotFound(id.to_string()))?;
        tracing::info!(source = id, note_id = %copy_id, "note duplicated");
        self.dispatch(&copy_id);
        Ok(copy_id)
    }

    pub fn update_note(&self, id: &str, patch: NotePatch) -> Result<(), StoreError> {
        if !self.commit(|state| state.update(id, &patch)) {
            return Err(StoreError::NoteNotFound(id.to_string()));
        }
        self.dispatch(id);
        Ok(())
    }

    /// Removes the note locally, then deletes the remote row without waiting.
    pub fn delete_note(&self, id: &str) -> Result<(), StoreError> {
        let removed = self
            .commit(|state| state.remove(id))
            .ok_or_else(|| StoreError::NoteNotFound(id.to_string()))?;
        tracing::info!(note_id = id, "note deleted");
        if !removed.is_local_only() {
            self.spawn_remote_delete(removed.id);
        }
        Ok(())
    }

    pub fn toggle_pin(&self, id: &str) -> Result<(), StoreError> {
        self.mutate(id, |note| {
            note.is_pinned = !note.is_pinned;
            true
        })
    }

    pub fn toggle_archive(&self, id: &str) -> Result<(), StoreError> {
        self.mutate(id, |note| {
            note.is_archived = !note.is_archived;
            true
        })
    }

    pub fn set_color(&self, id: &str, color: NoteColor) -> Result<(), StoreError> {
        self.mutate(id, |note| {
            note.color = color;
            true
        })
    }

    /// Adds a normalised tag. Blank input and tags already present are no-ops.
    pub fn add_tag(&self, id: &str, tag: &str) -> Result<(), StoreError> {
        let tag = normalize_tag(tag);
        self.mutate(id, |note| match tag {
            Some(tag) if !note.tags.contains(&tag) => {
                note.tags.push(tag);
                true
            }
            _ => false,
        })
    }

    pub fn remove_tag(&self, id: &str, tag: &str) -> Result<(), StoreError> {
        self.mutate(id, |note| {
            let before = note.tags.len();
            note.tags.retain(|existing| existing != tag);
            note.tags.len() != before
        })
    }

    /// Publishes or unpublishes a note and returns the new public state. The
    /// first publish assigns a slug; later toggles reuse it.
    pub fn toggle_public(&self, id: &str) -> Result<bool, StoreError> {
        if self.inner.gateway.current_account().is_none() {
            return Err(StoreError::Unauthenticated);
        }
        let mut public = false;
        self.mutate(id, |note| {
            public = !note.is_public;
            if public && note.public_slug.as_deref().map_or(true, str::is_empty) {
                note.public_slug = Some(generate_public_slug());
            }
            note.is_public = public;
            true
        })?;
        tracing::info!(note_id = id, public, "sharing changed");
        Ok(public)
    }

    pub fn set_active(&self, id: Option<&str>) -> Result<(), StoreError> {
        if self.commit(|state| state.set_active(id)) {
            Ok(())
        } else {
            Err(StoreError::NoteNotFound(id.unwrap_or_default().to_string()))
        }
    }

    /// Changes the search text and refetches from page 1 in the background.
    pub fn set_search_text(&self, text: impl Into<String>) {
        let text = text.into();
        let changed = self.commit(|state| {
            if state.search == text {
                false
            } else {
                state.search = text;
                true
            }
        });
        if changed {
            let store = self.clone();
            self.spawn_tracked(async move {
                if let Err(err) = store.fetch_notes(true).await {
                    tracing::warn!(%err, "search refetch failed");
                }
            });
        }
    }

    pub fn set_tag_filter(&self, tag: Option<String>) {
        self.commit(|state| state.tag_filter = tag);
    }

    pub fn set_show_archived(&self, show: bool) {
        self.commit(|state| state.show_archived = show);
    }

    pub fn set_sort_mode(&self, sort_mode: SortMode) {
        self.commit(|state| state.sort_mode = sort_mode);
    }

    /// Going back online starts a sweep of the pending set.
    pub fn set_offline(&self, offline: bool) {
        let was_offline = self.commit(|state| std::mem::replace(&mut state.offline, offline));
        if was_offline == offline {
            return;
        }
        tracing::info!(offline, "connectivity changed");
        if !offline {
            let store = self.clone();
            self.spawn_tracked(async move {
                let summary = store.sync_pending().await;
                tracing::debug!(?summary, "pending sweep after reconnect");
            });
        }
    }

    /// Single reconciliation entry point for realtime events and for the
    /// outcomes of this store's own remote writes.
    pub fn reconcile(&self, change: Reconcile) {
        match self.commit(|state| state.reconcile(change)) {
            Some(FollowUp::Write(id)) => self.dispatch(&id),
            Some(FollowUp::DeleteOrphan(id)) => {
                tracing::debug!(note_id = %id, "removing row created for a deleted note");
                self.spawn_remote_delete(id);
            }
            None => {}
        }
    }

    /// Writes every pending note, one at a time. Notes with a write already
    /// in flight, or confirmed since the sweep started, are skipped; a failure
    /// leaves the note pending and moves on.
    pub async fn sync_pending(&self) -> SweepSummary {
        let mut summary = SweepSummary::default();
        if self.inner.gateway.current_account().is_none() {
            return summary;
        }
        let ids = self.read(|state| {
            if state.offline {
                Vec::new()
            } else {
                state.pending.iter().cloned().collect::<Vec<_>>()
            }
        });
        for id in ids {
            let claimed = self.inner.state.lock().claim_pending_write(&id);
            let Some(job) = claimed else {
                summary.skipped += 1;
                continue;
            };
            let outcome = self.perform(job).await;
            if matches!(outcome, Reconcile::Failed { .. }) {
                summary.failed += 1;
            } else {
                summary.synced += 1;
            }
            self.reconcile(outcome);
        }
        if summary != SweepSummary::default() {
            tracing::info!(
                synced = summary.synced,
                failed = summary.failed,
                skipped = summary.skipped,
                "pending sweep finished"
            );
        }
        summary
    }

    /// Loads a page for the current search text. A reset starts over at
    /// page 1; otherwise the current page is reloaded and merged.
    pub async fn fetch_notes(&self, reset: bool) -> Result<(), StoreError> {
        let page = if reset { 1 } else { self.page() };
        self.fetch_page(page, reset).await
    }

    pub async fn fetch_more_notes(&self) -> Result<(), StoreError> {
        let next = self.read(|state| (!state.loading && state.has_more).then(|| state.page + 1));
        match next {
            Some(page) => self.fetch_page(page, false).await,
            None => Ok(()),
        }
    }

    async fn fetch_page(&self, page: usize, reset: bool) -> Result<(), StoreError> {
        if self.inner.gateway.current_account().is_none() {
            tracing::debug!("not signed in, skipping fetch");
            return Ok(());
        }
        let page_size = self.inner.options.page_size;
        let search = self.commit(|state| {
            state.loading = true;
            state.search.clone()
        });
        let fetched = self.inner.gateway.fetch_page(page, page_size, &search).await;
        let result = self.commit(|state| {
            state.loading = false;
            match fetched {
                Ok(found) if state.search == search => {
                    state.apply_page(page, page_size, found, reset);
                    Ok(())
                }
                Ok(_) => {
                    tracing::debug!(page, "discarding page fetched for an older search");
                    Ok(())
                }
                Err(err) => Err(err),
            }
        });
        result.map_err(|err| {
            tracing::warn!(%err, page, "fetching notes failed");
            StoreError::from(err)
        })
    }

    /// Pushes notes created before sign-in, then reloads from the backend.
    /// Runs once per persisted state; returns whether it ran.
    pub async fn sync_local_to_cloud(&self) -> Result<bool, StoreError> {
        if self.inner.gateway.current_account().is_none() || self.is_offline() {
            return Ok(false);
        }
        if self.has_synced() {
            return Ok(false);
        }
        let local_ids = self.read(|state| {
            state
                .notes()
                .filter(|note| note.is_local_only())
                .map(|note| note.id.clone())
                .collect::<Vec<_>>()
        });
        tracing::info!(count = local_ids.len(), "pushing local notes after sign-in");
        for id in local_ids {
            let claimed = self.inner.state.lock().claim_write(&id);
            if let Some(job) = claimed {
                let outcome = self.perform(job).await;
                self.reconcile(outcome);
            }
        }
        self.fetch_notes(true).await?;
        self.mark_synced();
        Ok(true)
    }

    /// Starts feeding the backend's change feed into [`Self::reconcile`].
    /// Must be called from within a tokio runtime.
    pub fn subscribe_realtime(&self) -> Subscription {
        realtime::listen(self.clone(), self.inner.gateway.subscribe())
    }

    /// Waits for every tracked background task, including follow-ups spawned
    /// while waiting.
    pub async fn settle(&self) {
        loop {
            let running = std::mem::take(&mut *self.inner.tasks.lock());
            if running.is_empty() {
                break;
            }
            for handle in running {
                if let Err(err) = handle.await {
                    if err.is_panic() {
                        tracing::error!(%err, "background sync task panicked");
                    }
                }
            }
        }
    }

    fn mutate<F>(&self, id: &str, edit: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut Note) -> bool,
    {
        match self.commit(|state| state.mutate(id, edit)) {
            None => Err(StoreError::NoteNotFound(id.to_string())),
            Some(true) => {
                self.dispatch(id);
                Ok(())
            }
            Some(false) => Ok(()),
        }
    }

    /// Applies `change` under the lock and persists the result before
    /// releasing it, so snapshots are written in commit order.
    fn commit<R>(&self, change: impl FnOnce(&mut StoreState) -> R) -> R {
        let mut state = self.inner.state.lock();
        let result = change(&mut *state);
        if let Some(local) = &self.inner.local {
            let snapshot = state.snapshot(self.inner.options.storage_version);
            let written = snapshot
                .encode()
                .map_err(anyhow::Error::from)
                .and_then(|raw| local.write(&self.inner.options.versioned_key(), &raw));
            if let Err(err) = written {
                tracing::warn!(error = %format!("{err:#}"), "persisting notes failed");
            }
        }
        result
    }

    /// Starts a remote write for `id` unless offline, signed out, or one is
    /// already running for it.
    fn dispatch(&self, id: &str) {
        if self.inner.gateway.current_account().is_none() || current_runtime().is_none() {
            return;
        }
        let claimed = self.inner.state.lock().claim_write(id);
        let Some(job) = claimed else {
            return;
        };
        let store = self.clone();
        self.spawn_tracked(async move {
            let outcome = store.perform(job).await;
            store.reconcile(outcome);
        });
    }

    async fn perform(&self, job: WriteJob) -> Reconcile {
        let WriteJob {
            id,
            kind,
            patch,
            revision,
        } = job;
        match kind {
            WriteKind::Create => match self.inner.gateway.create(&patch).await {
                Ok(row) => {
                    tracing::info!(local_id = %id, note_id = %row.id, "note stored remotely");
                    Reconcile::Created {
                        local_id: id,
                        row,
                        revision,
                    }
                }
                Err(err) => {
                    tracing::warn!(%err, note_id = %id, "remote create failed, note stays pending");
                    Reconcile::Failed { id }
                }
            },
            WriteKind::Update => match self.inner.gateway.update(&id, &patch).await {
                Ok(_) => {
                    tracing::debug!(note_id = %id, "note saved remotely");
                    Reconcile::Saved { id, revision }
                }
                Err(err) => {
                    tracing::warn!(%err, note_id = %id, "remote update failed, note stays pending");
                    Reconcile::Failed { id }
                }
            },
        }
    }

    fn spawn_remote_delete(&self, id: String) {
        if self.inner.gateway.current_account().is_none() || self.is_offline() {
            return;
        }
        let gateway = self.inner.gateway.clone();
        self.spawn_tracked(async move {
            if let Err(err) = gateway.delete(&id).await {
                tracing::warn!(%err, note_id = %id, "remote delete failed");
            }
        });
    }

    /// Outside a tokio runtime the task is dropped; affected notes stay
    /// pending for the next sweep.
    fn spawn_tracked<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Some(runtime) = current_runtime() else {
            return;
        };
        let handle = runtime.spawn(task);
        let mut tasks = self.inner.tasks.lock();
        tasks.retain(|running| !running.is_finished());
        tasks.push(handle);
    }

    fn has_synced(&self) -> bool {
        match &self.inner.local {
            Some(local) => local.flag(HAS_SYNCED_FLAG).unwrap_or_else(|err| {
                tracing::warn!(error = %format!("{err:#}"), "reading sync flag failed");
                false
            }),
            None => self.inner.synced_this_session.load(Ordering::Acquire),
        }
    }

    fn mark_synced(&self) {
        self.inner.synced_this_session.store(true, Ordering::Release);
        if let Some(local) = &self.inner.local {
            if let Err(err) = local.set_flag(HAS_SYNCED_FLAG, true) {
                tracing::warn!(error = %format!("{err:#}"), "recording sync flag failed");
            }
        }
    }
}

fn current_runtime() -> Option<Handle> {
    match Handle::try_current() {
        Ok(handle) => Some(handle),
        Err(_) => {
            tracing::warn!("no async runtime, background sync skipped");
            None
        }
    }
}
