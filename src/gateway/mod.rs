//! Remote note gateway.
//!
//! [`NoteBackend`] is the raw capability exposed by the hosted database (row
//! storage plus a change feed). [`RemoteNotes`] layers account attribution and
//! the retry policy over it; the sync store only ever talks to `RemoteNotes`.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::model::{NotePatch, NoteRow};
use crate::realtime::WireChange;
use crate::retry::{RetryPolicy, Retryable};

mod account;

pub use account::{AccountProvider, SessionAccount};

/// Failure reported by the backend, optionally carrying an HTTP-like status.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct BackendError {
    pub status: Option<u16>,
    pub message: String,
}

impl BackendError {
    pub fn new(status: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(Some(404), message)
    }

    /// Connection-level failure without a status code.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(None, message)
    }
}

impl Retryable for BackendError {
    fn status(&self) -> Option<u16> {
        self.status
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    #[error("user not authenticated")]
    Unauthenticated,
    #[error("note not found")]
    NotFound,
    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl Retryable for GatewayError {
    fn status(&self) -> Option<u16> {
        match self {
            GatewayError::Unauthenticated => Some(401),
            GatewayError::NotFound => Some(404),
            GatewayError::Backend(err) => err.status,
        }
    }
}

/// One page of rows plus the row count of the whole search scope.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NotePage {
    pub rows: Vec<NoteRow>,
    pub total: usize,
}

#[async_trait]
pub trait NoteBackend: Send + Sync {
    /// Every row, most recently updated first.
    async fn select_all(&self) -> Result<Vec<NoteRow>, BackendError>;

    /// Rows `offset..offset + limit`, most recently updated first, optionally
    /// restricted to rows whose title or content contains `search`
    /// (case-insensitive).
    async fn select_page(
        &self,
        offset: usize,
        limit: usize,
        search: Option<&str>,
    ) -> Result<NotePage, BackendError>;

    async fn insert(&self, owner: &str, patch: &NotePatch) -> Result<NoteRow, BackendError>;

    async fn update(&self, id: &str, patch: &NotePatch) -> Result<NoteRow, BackendError>;

    async fn delete(&self, id: &str) -> Result<(), BackendError>;

    /// Row carrying `slug`, but only while it is flagged public.
    async fn select_public(&self, slug: &str) -> Result<Option<NoteRow>, BackendError>;

    /// Row-level change feed for the notes relation.
    fn subscribe(&self) -> broadcast::Receiver<WireChange>;
}

#[derive(Clone)]
pub struct RemoteNotes {
    backend: Arc<dyn NoteBackend>,
    accounts: Arc<dyn AccountProvider>,
    policy: RetryPolicy,
}

impl RemoteNotes {
    pub fn new(
        backend: Arc<dyn NoteBackend>,
        accounts: Arc<dyn AccountProvider>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            backend,
            accounts,
            policy,
        }
    }

    pub fn current_account(&self) -> Option<String> {
        self.accounts.current_account()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WireChange> {
        self.backend.subscribe()
    }

    pub async fn fetch_all(&self) -> Result<Vec<NoteRow>, GatewayError> {
        let rows = self
            .policy
            .run_observed(
                |err: &BackendError, attempt: u32| {
                    tracing::warn!(%err, attempt, "retrying fetch_all")
                },
                || self.backend.select_all(),
            )
            .await?;
        Ok(rows)
    }

    /// `page` is 1-based. An empty `search` matches every row.
    pub async fn fetch_page(
        &self,
        page: usize,
        page_size: usize,
        search: &str,
    ) -> Result<NotePage, GatewayError> {
        let offset = page.saturating_sub(1) * page_size;
        let search = Some(search).filter(|s| !s.is_empty());
        let result = self
            .policy
            .run_observed(
                |err: &BackendError, attempt: u32| {
                    tracing::warn!(%err, attempt, page, "retrying fetch_page")
                },
                || self.backend.select_page(offset, page_size, search),
            )
            .await?;
        Ok(result)
    }

    /// Creates a row owned by the signed-in account. Without one this fails
    /// before any attempt is made.
    pub async fn create(&self, patch: &NotePatch) -> Result<NoteRow, GatewayError> {
        let owner = self
            .accounts
            .current_account()
            .ok_or(GatewayError::Unauthenticated)?;
        let row = self
            .policy
            .run_observed(
                |err: &BackendError, attempt: u32| {
                    tracing::warn!(%err, attempt, "syncing note, retrying create")
                },
                || self.backend.insert(&owner, patch),
            )
            .await?;
        Ok(row)
    }

    pub async fn update(&self, id: &str, patch: &NotePatch) -> Result<NoteRow, GatewayError> {
        let row = self
            .policy
            .run_observed(
                |err: &BackendError, attempt: u32| {
                    tracing::warn!(%err, attempt, note_id = id, "retrying update")
                },
                || self.backend.update(id, patch),
            )
            .await?;
        Ok(row)
    }

    pub async fn delete(&self, id: &str) -> Result<(), GatewayError> {
        self.policy
            .run_observed(
                |err: &BackendError, attempt: u32| {
                    tracing::warn!(%err, attempt, note_id = id, "retrying delete")
                },
                || self.backend.delete(id),
            )
            .await?;
        Ok(())
    }

    /// Public read path. Private and missing notes are indistinguishable.
    pub async fn fetch_public(&self, slug: &str) -> Result<NoteRow, GatewayError> {
        let found = self
            .policy
            .run(|| self.backend.select_public(slug))
            .await;
        match found {
            Ok(Some(row)) => Ok(row),
            Ok(None) => Err(GatewayError::NotFound),
            Err(err) if err.status == Some(404) => Err(GatewayError::NotFound),
            Err(err) => Err(err.into()),
        }
    }
}
