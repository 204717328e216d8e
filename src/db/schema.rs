//! Database schema definitions

use rusqlite::{Connection, OptionalExtension};
use tracing::{info, warn};

use crate::error::{sql, StorageError};

/// Current schema version
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema
pub fn init_schema(conn: &Connection) -> Result<(), StorageError> {
    let current_version = get_schema_version(conn)?;

    if current_version == 0 {
        info!("Creating new contact schema v{}", SCHEMA_VERSION);
        conn.execute_batch(CONTACTS_SCHEMA)
            .map_err(sql("Failed to create contacts table"))?;
        conn.execute_batch(INDEXES_SCHEMA)
            .map_err(sql("Failed to create indexes"))?;
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else if current_version < SCHEMA_VERSION {
        warn!(
            "Schema v{} is older than v{}; no migrations are defined, stamping current version",
            current_version, SCHEMA_VERSION
        );
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else {
        info!("Contact schema is up to date (v{})", current_version);
    }

    Ok(())
}

/// Get current schema version (0 if not initialized)
fn get_schema_version(conn: &Connection) -> Result<i32, StorageError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
        [],
    )
    .map_err(sql("Failed to create schema_version table"))?;

    let version: Option<i32> = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
        .optional()
        .map_err(sql("Failed to read schema_version"))?;

    Ok(version.unwrap_or(0))
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<(), StorageError> {
    conn.execute("DELETE FROM schema_version", [])
        .map_err(sql("Failed to clear schema_version"))?;
    conn.execute("INSERT INTO schema_version (version) VALUES (?)", [version])
        .map_err(sql("Failed to set schema_version"))?;
    Ok(())
}

const CONTACTS_SCHEMA: &str = r#"
-- One row per (email, phone) observation
CREATE TABLE IF NOT EXISTS contacts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    email TEXT,
    phone_number TEXT,
    link_precedence TEXT NOT NULL CHECK (link_precedence IN ('primary', 'secondary')),
    linked_id INTEGER REFERENCES contacts(id),

    -- RFC 3339, UTC, microsecond precision (text order = time order)
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    deleted_at TEXT,

    CHECK (email IS NOT NULL OR phone_number IS NOT NULL),
    CHECK (linked_id IS NULL OR linked_id <> id),
    CHECK (
        (link_precedence = 'primary' AND linked_id IS NULL)
        OR (link_precedence = 'secondary' AND linked_id IS NOT NULL)
    )
);
"#;

const INDEXES_SCHEMA: &str = r#"
CREATE INDEX IF NOT EXISTS idx_contacts_email ON contacts(email) WHERE deleted_at IS NULL;
CREATE INDEX IF NOT EXISTS idx_contacts_phone ON contacts(phone_number) WHERE deleted_at IS NULL;
CREATE INDEX IF NOT EXISTS idx_contacts_linked ON contacts(linked_id) WHERE deleted_at IS NULL;
CREATE INDEX IF NOT EXISTS idx_contacts_created ON contacts(created_at, id);
"#;
