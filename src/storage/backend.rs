use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use time::OffsetDateTime;
use tokio::sync::broadcast;
use uuid::Uuid;

use super::{open_file, schema};
use crate::gateway::{BackendError, NoteBackend, NotePage};
use crate::model::{NoteColor, NotePatch, NoteRow};
use crate::realtime::WireChange;

const CHANGE_FEED_CAPACITY: usize = 256;
const ROW_COLUMNS: &str = "id, owner_ref, title, content, tags, created_at, updated_at, \
                           is_pinned, is_archived, color, public_slug, is_public";
const SEARCH_FILTER: &str =
    "(?1 IS NULL OR title LIKE ?1 ESCAPE '\\' OR content LIKE ?1 ESCAPE '\\')";

/// Relational notes backend on SQLite, publishing a row-level change feed
/// for every write it accepts.
#[derive(Clone)]
pub struct SqliteBackend {
    conn: Arc<Mutex<Connection>>,
    changes: broadcast::Sender<WireChange>,
}

impl SqliteBackend {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = open_file(path)?;
        schema::apply_backend(&conn)?;
        Ok(Self::from_connection(conn))
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("opening in-memory backend")?;
        schema::apply_backend(&conn)?;
        Ok(Self::from_connection(conn))
    }

    fn from_connection(conn: Connection) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Self {
            conn: Arc::new(Mutex::new(conn)),
            changes,
        }
    }

    fn with_conn<T, F>(&self, f: F) -> Result<T, BackendError>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T>,
    {
        let conn = self.conn.lock();
        f(&conn).map_err(map_sqlite_error)
    }

    fn emit(&self, change: WireChange) {
        // Nobody listening is fine.
        let _ = self.changes.send(change);
    }

    fn fetch_row(conn: &Connection, id: &str) -> rusqlite::Result<Option<NoteRow>> {
        conn.query_row(
            &format!("SELECT {ROW_COLUMNS} FROM notes WHERE id = ?1"),
            params![id],
            read_row,
        )
        .optional()
    }

    fn write_row(conn: &Connection, row: &NoteRow) -> rusqlite::Result<()> {
        conn.execute(
            "INSERT INTO notes (id, owner_ref, title, content, tags, created_at, updated_at,
                                is_pinned, is_archived, color, public_slug, is_public)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
             ON CONFLICT(id) DO UPDATE SET
                title = excluded.title,
                content = excluded.content,
                tags = excluded.tags,
                updated_at = excluded.updated_at,
                is_pinned = excluded.is_pinned,
                is_archived = excluded.is_archived,
                color = excluded.color,
                public_slug = excluded.public_slug,
                is_public = excluded.is_public",
            params![
                row.id,
                row.owner_ref,
                row.title,
                row.content,
                encode_tags(&row.tags),
                to_nanos(row.created_at),
                to_nanos(row.updated_at),
                row.is_pinned,
                row.is_archived,
                row.color.as_ref(),
                row.public_slug,
                row.is_public,
            ],
        )?;
        Ok(())
    }
}

#[async_trait]
impl NoteBackend for SqliteBackend {
    async fn select_all(&self) -> Result<Vec<NoteRow>, BackendError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {ROW_COLUMNS} FROM notes ORDER BY updated_at DESC, id"
            ))?;
            let rows = stmt
                .query_map([], read_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    async fn select_page(
        &self,
        offset: usize,
        limit: usize,
        search: Option<&str>,
    ) -> Result<NotePage, BackendError> {
        let pattern = search.map(|term| format!("%{}%", escape_like(term)));
        self.with_conn(|conn| {
            let total: i64 = conn.query_row(
                &format!("SELECT COUNT(*) FROM notes WHERE {SEARCH_FILTER}"),
                params![pattern],
                |row| row.get(0),
            )?;
            let mut stmt = conn.prepare(&format!(
                "SELECT {ROW_COLUMNS} FROM notes
                 WHERE {SEARCH_FILTER}
                 ORDER BY updated_at DESC, id
                 LIMIT ?2 OFFSET ?3"
            ))?;
            let rows = stmt
                .query_map(params![pattern, limit as i64, offset as i64], read_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(NotePage {
                rows,
                total: total.max(0) as usize,
            })
        })
    }

    async fn insert(&self, owner: &str, patch: &NotePatch) -> Result<NoteRow, BackendError> {
        let now = OffsetDateTime::now_utc();
        let mut row = NoteRow {
            id: Uuid::new_v4().to_string(),
            owner_ref: Some(owner.to_string()),
            title: String::new(),
            content: String::new(),
            tags: Vec::new(),
            created_at: now,
            updated_at: now,
            is_pinned: false,
            is_archived: false,
            color: NoteColor::Default,
            public_slug: None,
            is_public: false,
        };
        apply_patch(&mut row, patch);
        self.with_conn(|conn| Self::write_row(conn, &row))?;
        tracing::debug!(note_id = %row.id, owner, "backend inserted note");
        self.emit(WireChange::insert(&row));
        Ok(row)
    }

    async fn update(&self, id: &str, patch: &NotePatch) -> Result<NoteRow, BackendError> {
        let row = self.with_conn(|conn| {
            let Some(mut row) = Self::fetch_row(conn, id)? else {
                return Ok(None);
            };
            apply_patch(&mut row, patch);
            row.updated_at = OffsetDateTime::now_utc().max(row.updated_at);
            Self::write_row(conn, &row)?;
            Ok(Some(row))
        })?;
        let row = row.ok_or_else(|| BackendError::not_found(format!("note {id} not found")))?;
        self.emit(WireChange::update(&row));
        Ok(row)
    }

    async fn delete(&self, id: &str) -> Result<(), BackendError> {
        let removed =
            self.with_conn(|conn| conn.execute("DELETE FROM notes WHERE id = ?1", params![id]))?;
        if removed > 0 {
            self.emit(WireChange::delete(id));
        }
        Ok(())
    }

    async fn select_public(&self, slug: &str) -> Result<Option<NoteRow>, BackendError> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!(
                    "SELECT {ROW_COLUMNS} FROM notes WHERE public_slug = ?1 AND is_public = 1"
                ),
                params![slug],
                read_row,
            )
            .optional()
        })
    }

    fn subscribe(&self) -> broadcast::Receiver<WireChange> {
        self.changes.subscribe()
    }
}

fn apply_patch(row: &mut NoteRow, patch: &NotePatch) {
    if let Some(title) = &patch.title {
        row.title = title.clone();
    }
    if let Some(content) = &patch.content {
        row.content = content.clone();
    }
    if let Some(tags) = &patch.tags {
        row.tags = tags.clone();
    }
    if let Some(pinned) = patch.is_pinned {
        row.is_pinned = pinned;
    }
    if let Some(archived) = patch.is_archived {
        row.is_archived = archived;
    }
    if let Some(color) = patch.color {
        row.color = color;
    }
    if let Some(slug) = &patch.public_slug {
        row.public_slug = Some(slug.clone());
    }
    if let Some(public) = patch.is_public {
        row.is_public = public;
    }
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<NoteRow> {
    let tags: String = row.get(4)?;
    let color: String = row.get(9)?;
    Ok(NoteRow {
        id: row.get(0)?,
        owner_ref: row.get(1)?,
        title: row.get(2)?,
        content: row.get(3)?,
        tags: serde_json::from_str(&tags).unwrap_or_default(),
        created_at: from_nanos(row.get(5)?),
        updated_at: from_nanos(row.get(6)?),
        is_pinned: row.get(7)?,
        is_archived: row.get(8)?,
        color: NoteColor::from_str(&color).unwrap_or_default(),
        public_slug: row.get(10)?,
        is_public: row.get(11)?,
    })
}

fn encode_tags(tags: &[String]) -> String {
    serde_json::to_string(tags).unwrap_or_else(|_| "[]".to_string())
}

fn to_nanos(ts: OffsetDateTime) -> i64 {
    i64::try_from(ts.unix_timestamp_nanos()).unwrap_or(i64::MAX)
}

fn from_nanos(nanos: i64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(nanos))
        .unwrap_or(OffsetDateTime::UNIX_EPOCH)
}

fn escape_like(term: &str) -> String {
    let mut escaped = String::with_capacity(term.len());
    for ch in term.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

fn map_sqlite_error(err: rusqlite::Error) -> BackendError {
    match &err {
        rusqlite::Error::SqliteFailure(failure, _)
            if failure.code == ErrorCode::ConstraintViolation =>
        {
            BackendError::new(Some(409), err.to_string())
        }
        rusqlite::Error::SqliteFailure(failure, _)
            if matches!(
                failure.code,
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
            ) =>
        {
            BackendError::new(Some(503), err.to_string())
        }
        _ => BackendError::new(Some(500), err.to_string()),
    }
}
