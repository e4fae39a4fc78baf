use std::fs;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use yrs::Doc;

use super::{apply_stored_state, encode_doc_state, ContentStore, PersistenceAdapter};

const MIGRATION_V1_SQL: &str = r#"
CREATE TABLE document_states (
    name        TEXT PRIMARY KEY,
    state       BLOB NOT NULL,
    updated_at  TEXT NOT NULL
);

CREATE TABLE document_contents (
    name        TEXT PRIMARY KEY,
    content     TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);
"#;

const MIGRATIONS: &[(i64, &str)] = &[(1, MIGRATION_V1_SQL)];

/// SQLite-backed document store.
///
/// Keeps binary CRDT state and the text projection in separate tables so the
/// projection can be read without a CRDT library.
#[derive(Debug)]
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create database parent directory `{}`", parent.display())
            })?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("failed to open document database at `{}`", path.display()))?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")
            .context("failed to configure sqlite pragmas for document database")?;

        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory database")?;
        Self::from_connection(conn)
    }

    fn from_connection(mut conn: Connection) -> Result<Self> {
        ensure_migration_table(&conn)?;
        apply_pending_migrations(&mut conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn schema_version(&self) -> Result<i64> {
        current_schema_version(&*self.connection()?)
    }

    pub fn load_state(&self, name: &str) -> Result<Option<Vec<u8>>> {
        self.connection()?
            .query_row("SELECT state FROM document_states WHERE name = ?1", [name], |row| {
                row.get(0)
            })
            .optional()
            .with_context(|| format!("failed to load state for `{name}`"))
    }

    pub fn store_state(&self, name: &str, state: &[u8]) -> Result<()> {
        self.connection()?
            .execute(
                "INSERT INTO document_states (name, state, updated_at)
                 VALUES (?1, ?2, datetime('now'))
                 ON CONFLICT(name) DO UPDATE SET
                     state = excluded.state,
                     updated_at = excluded.updated_at",
                params![name, state],
            )
            .with_context(|| format!("failed to store state for `{name}`"))?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn load_content(&self, name: &str) -> Result<Option<String>> {
        self.connection()?
            .query_row("SELECT content FROM document_contents WHERE name = ?1", [name], |row| {
                row.get(0)
            })
            .optional()
            .with_context(|| format!("failed to load content for `{name}`"))
    }

    fn connection(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| anyhow!("document database lock poisoned"))
    }
}

impl PersistenceAdapter for SqliteStore {
    fn bind_state(&self, name: &str, doc: &Doc) -> Result<()> {
        match self.load_state(name)? {
            Some(state) => apply_stored_state(doc, &state),
            None => Ok(()),
        }
    }

    fn write_state(&self, name: &str, doc: &Doc) -> Result<()> {
        self.store_state(name, &encode_doc_state(doc))
    }
}

impl ContentStore for SqliteStore {
    fn upsert_content(&self, name: &str, content: &str) -> Result<()> {
        self.connection()?
            .execute(
                "INSERT INTO document_contents (name, content, updated_at)
                 VALUES (?1, ?2, datetime('now'))
                 ON CONFLICT(name) DO UPDATE SET
                     content = excluded.content,
                     updated_at = excluded.updated_at",
                params![name, content],
            )
            .with_context(|| format!("failed to upsert content for `{name}`"))?;
        Ok(())
    }
}

fn ensure_migration_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS schema_migrations (
            version     INTEGER PRIMARY KEY,
            applied_at  TEXT NOT NULL
        );
        ",
    )
    .context("failed to ensure schema_migrations table exists")
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| row.get(0))
        .context("failed to read current schema version")
}

fn apply_pending_migrations(conn: &mut Connection) -> Result<()> {
    let mut current_version = current_schema_version(conn)?;

    for (version, sql) in MIGRATIONS {
        if *version <= current_version {
            continue;
        }

        let tx = conn.transaction().context("failed to start migration transaction")?;
        tx.execute_batch(sql)
            .with_context(|| format!("failed to apply document database migration v{version}"))?;
        tx.execute(
            "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, datetime('now'))",
            params![version],
        )
        .with_context(|| format!("failed to record migration v{version}"))?;
        tx.commit().with_context(|| format!("failed to commit migration v{version}"))?;
        current_version = *version;
    }

    Ok(())
}
