//! SQLite contact store
//!
//! ## Tables
//!
//! - `contacts` - one row per (email, phone) observation, linked into
//!   primary/secondary identity groups
//! - `schema_version` - schema stamp
//!
//! A [`ContactDb`] owns one connection behind a mutex. Several handles may
//! open the same file; SQLite's locking plus the retry wrapper in the
//! service layer coordinates them.

pub mod schema;
pub mod contacts;

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use rusqlite::{Connection, Transaction, TransactionBehavior};
use serde::Serialize;
use tracing::{debug, info};

use crate::error::{sql, StorageError};

/// SQLite database for contacts
pub struct ContactDb {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl ContactDb {
    /// Open or create the contact database at `path`
    pub fn open(path: &Path, busy_timeout: Duration) -> Result<Self, StorageError> {
        info!("Opening contact database at {:?}", path);

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path).map_err(sql("Failed to open SQLite"))?;

        conn.busy_timeout(busy_timeout)
            .map_err(sql("Failed to set busy timeout"))?;

        // WAL lets readers proceed while an identify transaction holds the write lock
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA foreign_keys=ON;")
            .map_err(sql("Failed to set PRAGMA"))?;

        let db = Self {
            conn: Mutex::new(conn),
            path: Some(path.to_path_buf()),
        };
        db.init_schema()?;

        Ok(db)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self, StorageError> {
        debug!("Opening in-memory contact database");

        let conn = Connection::open_in_memory()
            .map_err(sql("Failed to open in-memory SQLite"))?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")
            .map_err(sql("Failed to set PRAGMA"))?;

        let db = Self {
            conn: Mutex::new(conn),
            path: None,
        };
        db.init_schema()?;

        Ok(db)
    }

    /// Database file, `None` when in memory
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Create or stamp the schema under the writer lock, so handles opening
    /// a fresh file together see one another's work.
    fn init_schema(&self) -> Result<(), StorageError> {
        self.with_write_transaction(|tx| schema::init_schema(tx))
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StorageError> {
        self.conn
            .lock()
            .map_err(|e| StorageError::Storage(format!("Lock poisoned: {}", e)))
    }

    /// Run a read against the connection outside any explicit transaction
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, StorageError>
    where
        F: FnOnce(&Connection) -> Result<T, StorageError>,
    {
        let conn = self.lock()?;
        f(&conn)
    }

    /// Run `f` inside a write transaction taken up front (`BEGIN IMMEDIATE`).
    ///
    /// Holding the writer lock from the first read makes the transaction
    /// serializable. Any error rolls everything back.
    pub fn with_write_transaction<F, T>(&self, f: F) -> Result<T, StorageError>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T, StorageError>,
    {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(sql("Failed to begin transaction"))?;

        let value = f(&tx)?;

        tx.commit().map_err(sql("Failed to commit transaction"))?;
        Ok(value)
    }

    /// Run `f` inside a deferred read transaction (one consistent snapshot)
    pub fn with_read_transaction<F, T>(&self, f: F) -> Result<T, StorageError>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T, StorageError>,
    {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Deferred)
            .map_err(sql("Failed to begin read transaction"))?;

        let value = f(&tx)?;

        tx.finish().map_err(sql("Failed to finish read transaction"))?;
        Ok(value)
    }

    /// Close the underlying connection
    pub fn close(self) -> Result<(), StorageError> {
        let conn = self
            .conn
            .into_inner()
            .map_err(|e| StorageError::Storage(format!("Lock poisoned: {}", e)))?;

        conn.close()
            .map_err(|(_, e)| sql("Failed to close database")(e))?;

        info!("Contact database closed");
        Ok(())
    }

    /// Get contact statistics
    pub fn stats(&self) -> Result<ContactStats, StorageError> {
        self.with_read_transaction(|conn| {
            let count = |query: &str| -> Result<u64, StorageError> {
                conn.query_row(query, [], |row| row.get::<_, i64>(0))
                    .map(|n| n as u64)
                    .map_err(sql("Stats query failed"))
            };

            let total_contacts = count("SELECT COUNT(*) FROM contacts WHERE deleted_at IS NULL")?;
            let primary_contacts = count(
                "SELECT COUNT(*) FROM contacts WHERE deleted_at IS NULL AND link_precedence = 'primary'",
            )?;
            let secondary_contacts = count(
                "SELECT COUNT(*) FROM contacts WHERE deleted_at IS NULL AND link_precedence = 'secondary'",
            )?;
            let unique_emails = count(
                "SELECT COUNT(DISTINCT email) FROM contacts WHERE deleted_at IS NULL AND email IS NOT NULL",
            )?;
            let unique_phones = count(
                "SELECT COUNT(DISTINCT phone_number) FROM contacts WHERE deleted_at IS NULL AND phone_number IS NOT NULL",
            )?;

            // Every group has exactly one primary
            let contact_groups = primary_contacts;
            let avg_contacts_per_group = if contact_groups > 0 {
                ((total_contacts as f64 / contact_groups as f64) * 100.0).round() / 100.0
            } else {
                0.0
            };

            Ok(ContactStats {
                total_contacts,
                primary_contacts,
                secondary_contacts,
                unique_emails,
                unique_phones,
                contact_groups,
                avg_contacts_per_group,
            })
        })
    }
}

/// Contact statistics
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactStats {
    pub total_contacts: u64,
    pub primary_contacts: u64,
    pub secondary_contacts: u64,
    pub unique_emails: u64,
    pub unique_phones: u64,
    pub contact_groups: u64,
    pub avg_contacts_per_group: f64,
}

// Re-exports
pub use contacts::{ContactId, ContactRow, ContactStore, LinkPrecedence, NewContact};
