use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::gateway::{BackendError, NoteBackend, NotePage};
use crate::model::{NotePatch, NoteRow};
use crate::realtime::WireChange;
use crate::storage::SqliteBackend;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    SelectAll,
    SelectPage,
    Insert,
    Update,
    Delete,
    SelectPublic,
}

/// In-memory SQLite backend that counts calls per operation and can be told
/// to fail the next few attempts of one.
pub struct ScriptedBackend {
    inner: SqliteBackend,
    calls: Mutex<HashMap<Op, usize>>,
    failures: Mutex<HashMap<Op, (usize, Option<u16>)>>,
    updates: Mutex<Vec<(String, NotePatch)>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self {
            inner: SqliteBackend::in_memory().expect("in-memory backend"),
            calls: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            updates: Mutex::new(Vec::new()),
        }
    }

    pub fn fail_next(&self, op: Op, times: usize, status: Option<u16>) {
        self.failures.lock().insert(op, (times, status));
    }

    pub fn calls(&self, op: Op) -> usize {
        self.calls.lock().get(&op).copied().unwrap_or(0)
    }

    /// Update patches that reached the database, in arrival order.
    pub fn updates(&self) -> Vec<(String, NotePatch)> {
        self.updates.lock().clone()
    }

    fn enter(&self, op: Op) -> Result<(), BackendError> {
        *self.calls.lock().entry(op).or_insert(0) += 1;
        let mut failures = self.failures.lock();
        match failures.get_mut(&op) {
            Some((remaining, status)) if *remaining > 0 => {
                *remaining -= 1;
                Err(BackendError::new(*status, format!("scripted {op:?} failure")))
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl NoteBackend for ScriptedBackend {
    async fn select_all(&self) -> Result<Vec<NoteRow>, BackendError> {
        self.enter(Op::SelectAll)?;
        self.inner.select_all().await
    }

    async fn select_page(
        &self,
        offset: usize,
        limit: usize,
        search: Option<&str>,
    ) -> Result<NotePage, BackendError> {
        self.enter(Op::SelectPage)?;
        self.inner.select_page(offset, limit, search).await
    }

    async fn insert(&self, owner: &str, patch: &NotePatch) -> Result<NoteRow, BackendError> {
        self.enter(Op::Insert)?;
        self.inner.insert(owner, patch).await
    }

    async fn update(&self, id: &str, patch: &NotePatch) -> Result<NoteRow, BackendError> {
        self.enter(Op::Update)?;
        let row = self.inner.update(id, patch).await?;
        self.updates.lock().push((id.to_string(), patch.clone()));
        Ok(row)
    }

    async fn delete(&self, id: &str) -> Result<(), BackendError> {
        self.enter(Op::Delete)?;
        self.inner.delete(id).await
    }

    async fn select_public(&self, slug: &str) -> Result<Option<NoteRow>, BackendError> {
        self.enter(Op::SelectPublic)?;
        self.inner.select_public(slug).await
    }

    fn subscribe(&self) -> broadcast::Receiver<WireChange> {
        self.inner.subscribe()
    }
}
