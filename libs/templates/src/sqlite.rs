//! SQLite-backed template store.
//!
//! Persists installed templates so a restarted node does not reinstall
//! templates that are already current.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use crate::error::StoreError;
use crate::spec::IndexTemplateSpec;
use crate::store::{InstalledTemplate, TemplateStore};

/// SQLite template store.
pub struct SqliteTemplateStore {
    conn: Mutex<Connection>,
}

impl SqliteTemplateStore {
    /// Open or create a store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        Self::with_connection(conn)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS index_templates (
                name TEXT PRIMARY KEY,
                version INTEGER,
                body TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );
            "#,
        )?;
        debug!("Template store schema initialized");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Stored body of a template.
    pub fn body(&self, name: &str) -> Result<Option<serde_json::Value>, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        let body: Option<String> = conn
            .query_row(
                "SELECT body FROM index_templates WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        body.map(|b| serde_json::from_str(&b))
            .transpose()
            .map_err(Into::into)
    }

    /// Write a template without a version check, as an older release would.
    pub fn put_unversioned(&self, name: &str, body: &serde_json::Value) -> Result<(), StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        conn.execute(
            r#"
            INSERT INTO index_templates (name, version, body, updated_at)
            VALUES (?1, NULL, ?2, ?3)
            ON CONFLICT(name) DO UPDATE SET
                version = NULL,
                body = excluded.body,
                updated_at = excluded.updated_at
            "#,
            params![name, serde_json::to_string(body)?, chrono::Utc::now().timestamp()],
        )?;
        Ok(())
    }
}

fn lookup(conn: &Connection, name: &str) -> Result<InstalledTemplate, StoreError> {
    let row: Option<Option<u32>> = conn
        .query_row(
            "SELECT version FROM index_templates WHERE name = ?1",
            params![name],
            |row| row.get(0),
        )
        .optional()?;
    Ok(match row {
        Some(version) => InstalledTemplate::Present { version },
        None => InstalledTemplate::Missing,
    })
}

impl TemplateStore for SqliteTemplateStore {
    fn installed(&self, name: &str) -> Result<InstalledTemplate, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        lookup(&conn, name)
    }

    fn compare_and_put(
        &self,
        template: &IndexTemplateSpec,
        expected: InstalledTemplate,
    ) -> Result<bool, StoreError> {
        let body = serde_json::to_string(&template.to_json())?;
        let mut conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        let tx = conn.transaction()?;

        if lookup(&tx, &template.name)? != expected {
            return Ok(false);
        }

        tx.execute(
            r#"
            INSERT INTO index_templates (name, version, body, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(name) DO UPDATE SET
                version = excluded.version,
                body = excluded.body,
                updated_at = excluded.updated_at
            "#,
            params![
                template.name,
                template.version,
                body,
                chrono::Utc::now().timestamp()
            ],
        )?;
        tx.commit()?;

        debug!(template = %template.name, version = template.version, "Template stored");
        Ok(true)
    }
}
