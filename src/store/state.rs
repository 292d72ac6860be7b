use std::collections::{HashMap, HashSet};

use indexmap::{IndexMap, IndexSet};

use crate::gateway::NotePage;
use crate::model::{Note, NotePatch, NoteRow, SortMode};
use crate::realtime::ChangeEvent;
use crate::store::persist::PersistedState;
use crate::view::{self, ViewFilter};

/// An externally sourced change, folded into the collection by id.
///
/// Realtime pushes and the confirmations of the store's own remote writes
/// travel through the same variant set so there is a single merge path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconcile {
    Remote(ChangeEvent),
    Created {
        local_id: String,
        row: NoteRow,
        revision: u64,
    },
    Saved {
        id: String,
        revision: u64,
    },
    Failed {
        id: String,
    },
}

/// Remote work that a reconciliation asks the async layer to start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum FollowUp {
    /// The note changed while its write was in flight; send the latest state.
    Write(String),
    /// A create finished for a note deleted in the meantime.
    DeleteOrphan(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriteKind {
    Create,
    Update,
}

/// Snapshot of a note handed to one remote write.
#[derive(Debug, Clone)]
pub(crate) struct WriteJob {
    pub id: String,
    pub kind: WriteKind,
    pub patch: NotePatch,
    pub revision: u64,
}

#[derive(Debug, Clone)]
pub struct StoreState {
    pub(crate) notes: IndexMap<String, Note>,
    pub(crate) active_id: Option<String>,
    pub(crate) search: String,
    pub(crate) tag_filter: Option<String>,
    pub(crate) show_archived: bool,
    pub(crate) sort_mode: SortMode,
    pub(crate) loading: bool,
    pub(crate) offline: bool,
    pub(crate) pending: IndexSet<String>,
    pub(crate) in_flight: HashSet<String>,
    pub(crate) page: usize,
    pub(crate) has_more: bool,
    revisions: HashMap<String, u64>,
    next_revision: u64,
}

impl StoreState {
    pub fn new(sort_mode: SortMode) -> Self {
        Self {
            notes: IndexMap::new(),
            active_id: None,
            search: String::new(),
            tag_filter: None,
            show_archived: false,
            sort_mode,
            loading: false,
            offline: false,
            pending: IndexSet::new(),
            in_flight: HashSet::new(),
            page: 1,
            has_more: true,
            revisions: HashMap::new(),
            next_revision: 0,
        }
    }

    pub(crate) fn from_snapshot(snapshot: PersistedState) -> Self {
        let mut state = Self::new(snapshot.sort_mode);
        for note in snapshot.notes {
            if !state.notes.contains_key(&note.id) {
                state.notes.insert(note.id.clone(), note);
            }
        }
        state.pending = snapshot
            .pending
            .into_iter()
            .filter(|id| state.notes.contains_key(id))
            .collect();
        state
    }

    pub(crate) fn snapshot(&self, version: u32) -> PersistedState {
        PersistedState {
            version,
            notes: self.notes.values().cloned().collect(),
            sort_mode: self.sort_mode,
            pending: self.pending.iter().cloned().collect(),
        }
    }

    pub fn notes(&self) -> impl Iterator<Item = &Note> {
        self.notes.values()
    }

    pub fn note(&self, id: &str) -> Option<&Note> {
        self.notes.get(id)
    }

    pub fn active_note(&self) -> Option<&Note> {
        self.active_id.as_deref().and_then(|id| self.notes.get(id))
    }

    pub fn is_pending(&self, id: &str) -> bool {
        self.pending.contains(id)
    }

    pub fn filtered_notes(&self) -> Vec<&Note> {
        let filter = ViewFilter {
            search: &self.search,
            tag: self.tag_filter.as_deref(),
            show_archived: self.show_archived,
        };
        view::filtered_notes(self.notes.values(), &filter, self.sort_mode)
    }

    pub fn all_tags(&self) -> Vec<String> {
        view::all_tags(self.notes.values())
    }

    /// Puts a new local note at the front, makes it active and queues it.
    pub(crate) fn insert_local(&mut self, note: Note) -> String {
        let id = note.id.clone();
        self.notes.shift_insert(0, id.clone(), note);
        self.active_id = Some(id.clone());
        self.mark_dirty(&id);
        id
    }

    /// Single mutation path: runs `edit`, and when it reports a change stamps
    /// `updated_at` and queues the note. `None` when the note is unknown.
    pub(crate) fn mutate<F>(&mut self, id: &str, edit: F) -> Option<bool>
    where
        F: FnOnce(&mut Note) -> bool,
    {
        let note = self.notes.get_mut(id)?;
        if !edit(note) {
            return Some(false);
        }
        note.touch();
        self.mark_dirty(id);
        Some(true)
    }

    pub(crate) fn update(&mut self, id: &str, patch: &NotePatch) -> bool {
        self.mutate(id, |note| {
            note.apply_patch(patch);
            true
        })
        .is_some()
    }

    pub(crate) fn remove(&mut self, id: &str) -> Option<Note> {
        let note = self.notes.shift_remove(id)?;
        self.pending.shift_remove(id);
        self.revisions.remove(id);
        if self.active_id.as_deref() == Some(id) {
            self.active_id = self.notes.keys().next().cloned();
        }
        Some(note)
    }

    pub(crate) fn set_active(&mut self, id: Option<&str>) -> bool {
        match id {
            None => {
                self.active_id = None;
                true
            }
            Some(id) if self.notes.contains_key(id) => {
                self.active_id = Some(id.to_string());
                true
            }
            Some(_) => false,
        }
    }

    /// Reserves `id` for one remote write and snapshots what to send.
    pub(crate) fn claim_write(&mut self, id: &str) -> Option<WriteJob> {
        if self.offline || self.in_flight.contains(id) {
            return None;
        }
        let note = self.notes.get(id)?;
        let kind = if note.is_local_only() {
            WriteKind::Create
        } else {
            WriteKind::Update
        };
        let patch = NotePatch::from_note(note);
        let revision = *self.revisions.entry(id.to_string()).or_insert(0);
        self.in_flight.insert(id.to_string());
        Some(WriteJob {
            id: id.to_string(),
            kind,
            patch,
            revision,
        })
    }

    /// [`claim_write`](Self::claim_write) for sweeps: a note confirmed since
    /// the sweep listed it is no longer pending and is left alone.
    pub(crate) fn claim_pending_write(&mut self, id: &str) -> Option<WriteJob> {
        if !self.pending.contains(id) {
            return None;
        }
        self.claim_write(id)
    }

    pub(crate) fn reconcile(&mut self, change: Reconcile) -> Option<FollowUp> {
        match change {
            Reconcile::Remote(event) => {
                self.apply_remote(event);
                None
            }
            Reconcile::Created {
                local_id,
                row,
                revision,
            } => {
                self.in_flight.remove(&local_id);
                if !self.notes.contains_key(&local_id) {
                    return Some(FollowUp::DeleteOrphan(row.id));
                }
                let id = row.id.clone();
                self.rekey(&local_id, &row);
                self.confirm_write(&id, revision)
            }
            Reconcile::Saved { id, revision } => {
                self.in_flight.remove(&id);
                self.confirm_write(&id, revision)
            }
            Reconcile::Failed { id } => {
                self.in_flight.remove(&id);
                None
            }
        }
    }

    fn apply_remote(&mut self, event: ChangeEvent) {
        match event {
            ChangeEvent::Inserted(row) => {
                if !self.notes.contains_key(&row.id) {
                    let id = row.id.clone();
                    self.notes.shift_insert(0, id, Note::from(row));
                }
            }
            ChangeEvent::Updated(row) => {
                if let Some(note) = self.notes.get_mut(&row.id) {
                    note.merge_remote(&row);
                }
            }
            ChangeEvent::Deleted { id } => {
                self.remove(&id);
            }
        }
    }

    fn confirm_write(&mut self, id: &str, revision: u64) -> Option<FollowUp> {
        if !self.notes.contains_key(id) {
            return None;
        }
        if self.revisions.get(id) == Some(&revision) {
            self.pending.shift_remove(id);
            self.revisions.remove(id);
            None
        } else if self.pending.contains(id) {
            Some(FollowUp::Write(id.to_string()))
        } else {
            None
        }
    }

    /// Moves a note from its local id to the backend id everywhere the id is
    /// referenced. An echo of the same row that beat the confirmation here is
    /// dropped in favour of the local copy.
    fn rekey(&mut self, old: &str, row: &NoteRow) {
        let new_id = row.id.clone();
        let Some((mut index, _, mut note)) = self.notes.shift_remove_full(old) else {
            return;
        };
        if let Some((echo_index, _, _)) = self.notes.shift_remove_full(&new_id) {
            if echo_index < index {
                index -= 1;
            }
        }
        note.id = new_id.clone();
        note.owner = row.owner_ref.clone();
        let index = index.min(self.notes.len());
        self.notes.shift_insert(index, new_id.clone(), note);

        if let Some(position) = self.pending.get_index_of(old) {
            self.pending.shift_remove(old);
            self.pending.shift_insert(position, new_id.clone());
        }
        if self.in_flight.remove(old) {
            self.in_flight.insert(new_id.clone());
        }
        if let Some(revision) = self.revisions.remove(old) {
            self.revisions.insert(new_id.clone(), revision);
        }
        if self.active_id.as_deref() == Some(old) {
            self.active_id = Some(new_id);
        }
    }

    /// Folds one fetched page in. A reset replaces the collection but keeps
    /// notes with unsynced local changes; later pages append.
    pub(crate) fn apply_page(&mut self, page: usize, page_size: usize, found: NotePage, reset: bool) {
        let fetched = found.rows.len();
        if reset {
            let mut next: IndexMap<String, Note> = self
                .notes
                .iter()
                .filter(|(id, _)| self.pending.contains(*id))
                .map(|(id, note)| (id.clone(), note.clone()))
                .collect();
            for row in found.rows {
                if !next.contains_key(&row.id) {
                    next.insert(row.id.clone(), Note::from(row));
                }
            }
            self.notes = next;
        } else {
            for row in found.rows {
                match self.notes.get_mut(&row.id) {
                    Some(note) if !self.pending.contains(&row.id) => note.merge_remote(&row),
                    Some(_) => {}
                    None => {
                        self.notes.insert(row.id.clone(), Note::from(row));
                    }
                }
            }
        }
        self.page = page;
        let seen_in_scope = page.saturating_sub(1) * page_size + fetched;
        self.has_more = seen_in_scope < found.total;
        if let Some(active) = &self.active_id {
            if !self.notes.contains_key(active) {
                self.active_id = None;
            }
        }
    }

    fn mark_dirty(&mut self, id: &str) {
        self.next_revision += 1;
        self.revisions.insert(id.to_string(), self.next_revision);
        self.pending.insert(id.to_string());
    }
}
