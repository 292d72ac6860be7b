use anyhow::{Context, Result};
use rusqlite::Connection;

/// Key/value table holding the persisted store snapshot and session flags.
pub fn apply_local(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS local_state (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            written_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS session_flags (
            name TEXT PRIMARY KEY,
            enabled INTEGER NOT NULL DEFAULT 0
        );
        "#,
    )
    .context("applying local state schema")?;
    Ok(())
}

/// Notes relation as the remote backend stores it. Timestamps are unix nanos.
pub fn apply_backend(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS notes (
            id TEXT PRIMARY KEY,
            owner_ref TEXT,
            title TEXT NOT NULL DEFAULT '',
            content TEXT NOT NULL DEFAULT '',
            tags TEXT NOT NULL DEFAULT '[]',
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            is_pinned INTEGER NOT NULL DEFAULT 0,
            is_archived INTEGER NOT NULL DEFAULT 0,
            color TEXT NOT NULL DEFAULT 'default',
            public_slug TEXT UNIQUE,
            is_public INTEGER NOT NULL DEFAULT 0
        );

        CREATE INDEX IF NOT EXISTS notes_updated_at ON notes(updated_at DESC);
        CREATE INDEX IF NOT EXISTS notes_owner_ref ON notes(owner_ref);
        "#,
    )
    .context("applying backend schema")?;
    Ok(())
}
