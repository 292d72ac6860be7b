use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use time::OffsetDateTime;

mod backend;
mod schema;

pub use backend::SqliteBackend;

/// Local, per-device persistence: the store snapshot and session flags.
#[derive(Clone)]
pub struct LocalState {
    conn: Arc<Mutex<Connection>>,
    path: Option<Arc<PathBuf>>,
}

impl LocalState {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = open_file(path)?;
        schema::apply_local(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(Arc::new(path.to_path_buf())),
        })
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("opening in-memory local state")?;
        schema::apply_local(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
        })
    }

    pub fn database_path(&self) -> Option<&Path> {
        self.path.as_deref().map(PathBuf::as_path)
    }

    pub fn read(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT value FROM local_state WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()
        .with_context(|| format!("reading local state {key}"))
    }

    pub fn write(&self, key: &str, value: &str) -> Result<()> {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO local_state (key, value, written_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, written_at = excluded.written_at",
            params![key, value, now],
        )
        .with_context(|| format!("writing local state {key}"))?;
        Ok(())
    }

    pub fn flag(&self, name: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let enabled: Option<i64> = conn
            .query_row(
                "SELECT enabled FROM session_flags WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("reading flag {name}"))?;
        Ok(enabled.unwrap_or(0) != 0)
    }

    pub fn set_flag(&self, name: &str, enabled: bool) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO session_flags (name, enabled) VALUES (?1, ?2)
             ON CONFLICT(name) DO UPDATE SET enabled = excluded.enabled",
            params![name, if enabled { 1 } else { 0 }],
        )
        .with_context(|| format!("writing flag {name}"))?;
        Ok(())
    }
}

fn open_file(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating data directory {}", parent.display()))?;
    }
    let conn =
        Connection::open(path).with_context(|| format!("opening database {}", path.display()))?;
    prepare_connection(&conn)?;
    Ok(conn)
}

fn prepare_connection(conn: &Connection) -> Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL")
        .context("setting journal_mode=WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")
        .context("setting synchronous=NORMAL")?;
    conn.busy_timeout(std::time::Duration::from_secs(5))
        .context("setting busy timeout")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn values_survive_reopening_the_file() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let path = temp.path().join("data").join("local-state.db");
        {
            let state = LocalState::open(&path)?;
            state.write("snapshot:v1", "{\"notes\":[]}")?;
            state.write("snapshot:v1", "{\"notes\":[1]}")?;
            state.set_flag("has_synced_to_cloud", true)?;
        }
        let state = LocalState::open(&path)?;
        assert_eq!(state.database_path(), Some(path.as_path()));
        assert_eq!(
            state.read("snapshot:v1")?.as_deref(),
            Some("{\"notes\":[1]}")
        );
        assert!(state.flag("has_synced_to_cloud")?);
        Ok(())
    }

    #[test]
    fn missing_keys_read_as_absent_and_writes_overwrite() -> anyhow::Result<()> {
        let state = LocalState::in_memory()?;
        assert_eq!(state.read("nope")?, None);
        assert!(!state.flag("nope")?);
        state.write("k", "v")?;
        state.write("k", "w")?;
        assert_eq!(state.read("k")?.as_deref(), Some("w"));
        Ok(())
    }
}
