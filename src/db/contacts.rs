//! Contact rows and the queries the reconciliation engine runs against them.
//!
//! All queries exclude soft-deleted rows and return rows ordered by
//! `(created_at, id)` so results are deterministic inside a transaction.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, Type, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::error::{sql, StorageError};

// =============================================================================
// Types
// =============================================================================

pub type ContactId = i64;

/// Role of a contact inside its identity group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkPrecedence {
    Primary,
    Secondary,
}

impl LinkPrecedence {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkPrecedence::Primary => "primary",
            LinkPrecedence::Secondary => "secondary",
        }
    }
}

impl std::fmt::Display for LinkPrecedence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ToSql for LinkPrecedence {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for LinkPrecedence {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value.as_str()? {
            "primary" => Ok(LinkPrecedence::Primary),
            "secondary" => Ok(LinkPrecedence::Secondary),
            other => Err(FromSqlError::Other(
                format!("unknown link_precedence '{}'", other).into(),
            )),
        }
    }
}

/// Contact row from database
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactRow {
    pub id: ContactId,
    pub email: Option<String>,
    pub phone_number: Option<String>,
    pub linked_id: Option<ContactId>,
    pub link_precedence: LinkPrecedence,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl ContactRow {
    pub fn is_primary(&self) -> bool {
        self.link_precedence == LinkPrecedence::Primary
    }

    /// The primary this contact belongs to (itself when primary)
    pub fn root_id(&self) -> ContactId {
        match self.link_precedence {
            LinkPrecedence::Primary => self.id,
            LinkPrecedence::Secondary => self.linked_id.unwrap_or(self.id),
        }
    }

    /// Creation order key: earliest `created_at`, then lowest id
    pub fn creation_key(&self) -> (DateTime<Utc>, ContactId) {
        (self.created_at, self.id)
    }
}

/// Input for creating a contact. Id and timestamps are assigned by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewContact {
    pub email: Option<String>,
    pub phone_number: Option<String>,
    pub linked_id: Option<ContactId>,
}

impl NewContact {
    pub fn primary(email: Option<&str>, phone_number: Option<&str>) -> Self {
        Self {
            email: email.map(str::to_string),
            phone_number: phone_number.map(str::to_string),
            linked_id: None,
        }
    }

    pub fn secondary(email: Option<&str>, phone_number: Option<&str>, primary_id: ContactId) -> Self {
        Self {
            email: email.map(str::to_string),
            phone_number: phone_number.map(str::to_string),
            linked_id: Some(primary_id),
        }
    }

    pub fn link_precedence(&self) -> LinkPrecedence {
        if self.linked_id.is_some() {
            LinkPrecedence::Secondary
        } else {
            LinkPrecedence::Primary
        }
    }
}

// =============================================================================
// Timestamps
// =============================================================================

/// Fixed-width RFC 3339 so that text comparison in SQL matches time order
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn now_timestamp() -> String {
    format_timestamp(&Utc::now())
}

// =============================================================================
// Queries
// =============================================================================

const CONTACT_COLUMNS: &str = "id, email, phone_number, linked_id, link_precedence,
    created_at, updated_at, deleted_at";

fn map_row(row: &Row<'_>) -> rusqlite::Result<ContactRow> {
    let created_at: String = row.get(5)?;
    let updated_at: String = row.get(6)?;
    let deleted_at: Option<String> = row.get(7)?;

    Ok(ContactRow {
        id: row.get(0)?,
        email: row.get(1)?,
        phone_number: row.get(2)?,
        linked_id: row.get(3)?,
        link_precedence: row.get(4)?,
        created_at: parse_timestamp(5, &created_at)?,
        updated_at: parse_timestamp(6, &updated_at)?,
        deleted_at: deleted_at.map(|d| parse_timestamp(7, &d)).transpose()?,
    })
}

fn query_contacts<P: rusqlite::Params>(
    conn: &Connection,
    query: &str,
    params: P,
) -> Result<Vec<ContactRow>, StorageError> {
    let mut stmt = conn
        .prepare_cached(query)
        .map_err(sql("Failed to prepare contact query"))?;

    let rows = stmt
        .query_map(params, map_row)
        .map_err(sql("Failed to query contacts"))?;

    rows.collect::<Result<Vec<_>, _>>()
        .map_err(sql("Failed to read contact row"))
}

/// Get a non-deleted contact by id
pub fn get_contact(conn: &Connection, id: ContactId) -> Result<Option<ContactRow>, StorageError> {
    let query = format!(
        "SELECT {} FROM contacts WHERE id = ? AND deleted_at IS NULL",
        CONTACT_COLUMNS
    );

    conn.query_row(&query, params![id], map_row)
        .optional()
        .map_err(sql("Failed to get contact"))
}

/// Contacts whose email or phone equals the given values. An absent side is
/// not matched at all.
pub fn find_by_email_or_phone(
    conn: &Connection,
    email: Option<&str>,
    phone_number: Option<&str>,
) -> Result<Vec<ContactRow>, StorageError> {
    let base = format!("SELECT {} FROM contacts WHERE deleted_at IS NULL", CONTACT_COLUMNS);

    match (email, phone_number) {
        (Some(email), Some(phone)) => query_contacts(
            conn,
            &format!("{} AND (email = ?1 OR phone_number = ?2) ORDER BY created_at, id", base),
            params![email, phone],
        ),
        (Some(email), None) => query_contacts(
            conn,
            &format!("{} AND email = ?1 ORDER BY created_at, id", base),
            params![email],
        ),
        (None, Some(phone)) => query_contacts(
            conn,
            &format!("{} AND phone_number = ?1 ORDER BY created_at, id", base),
            params![phone],
        ),
        (None, None) => Ok(Vec::new()),
    }
}

/// The root plus every contact linking directly to it
pub fn find_group(conn: &Connection, root_id: ContactId) -> Result<Vec<ContactRow>, StorageError> {
    query_contacts(
        conn,
        &format!(
            "SELECT {} FROM contacts
             WHERE deleted_at IS NULL AND (id = ?1 OR linked_id = ?1)
             ORDER BY created_at, id",
            CONTACT_COLUMNS
        ),
        params![root_id],
    )
}

/// All non-deleted contacts, primaries first, then by creation
pub fn list_contacts(conn: &Connection) -> Result<Vec<ContactRow>, StorageError> {
    query_contacts(
        conn,
        &format!(
            "SELECT {} FROM contacts WHERE deleted_at IS NULL
             ORDER BY link_precedence ASC, created_at ASC, id ASC",
            CONTACT_COLUMNS
        ),
        [],
    )
}

/// Creation timestamp for a new row: the wall clock, but never earlier than
/// any row already stored, so a clock stepping back cannot reorder a group.
fn next_created_at(conn: &Connection) -> Result<String, StorageError> {
    let now = now_timestamp();
    let latest: Option<String> = conn
        .query_row("SELECT MAX(created_at) FROM contacts", [], |row| row.get(0))
        .map_err(sql("Failed to read latest created_at"))?;

    // fixed-width format, so text order is time order
    Ok(match latest {
        Some(latest) if latest > now => latest,
        _ => now,
    })
}

/// Insert a contact and return it as stored
pub fn insert_contact(conn: &Connection, input: &NewContact) -> Result<ContactRow, StorageError> {
    let now = next_created_at(conn)?;

    conn.execute(
        "INSERT INTO contacts (email, phone_number, linked_id, link_precedence, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?)",
        params![
            input.email,
            input.phone_number,
            input.linked_id,
            input.link_precedence(),
            now,
            now,
        ],
    )
    .map_err(sql("Failed to insert contact"))?;

    let id = conn.last_insert_rowid();
    get_contact(conn, id)?
        .ok_or_else(|| StorageError::Storage(format!("Inserted contact {} not readable", id)))
}

/// Turn a primary into a secondary of `primary_id`
pub fn demote_to_secondary(
    conn: &Connection,
    id: ContactId,
    primary_id: ContactId,
) -> Result<(), StorageError> {
    let rows = conn
        .execute(
            "UPDATE contacts
             SET link_precedence = ?1, linked_id = ?2, updated_at = ?3
             WHERE id = ?4 AND deleted_at IS NULL",
            params![LinkPrecedence::Secondary, primary_id, now_timestamp(), id],
        )
        .map_err(sql("Failed to demote contact"))?;

    if rows == 0 {
        return Err(StorageError::InvariantViolation(format!(
            "Contact {} disappeared during merge",
            id
        )));
    }

    Ok(())
}

/// Repoint every contact linked to `from_root` at `to_root`.
///
/// Soft-deleted rows are repointed too so no chain survives an undelete.
pub fn relink_secondaries(
    conn: &Connection,
    from_root: ContactId,
    to_root: ContactId,
) -> Result<usize, StorageError> {
    conn.execute(
        "UPDATE contacts SET linked_id = ?1, updated_at = ?2 WHERE linked_id = ?3",
        params![to_root, now_timestamp(), from_root],
    )
    .map_err(sql("Failed to relink secondaries"))
}

// =============================================================================
// Repository interface
// =============================================================================

/// Operations the reconciliation engine needs from the contact store.
///
/// Implementations must run every call inside the caller's transaction.
pub trait ContactStore {
    fn find_by_email_or_phone(
        &self,
        email: Option<&str>,
        phone_number: Option<&str>,
    ) -> Result<Vec<ContactRow>, StorageError>;

    fn find_group(&self, root_id: ContactId) -> Result<Vec<ContactRow>, StorageError>;

    fn insert(&self, contact: &NewContact) -> Result<ContactRow, StorageError>;

    fn demote_to_secondary(&self, id: ContactId, primary_id: ContactId) -> Result<(), StorageError>;

    fn relink_secondaries(&self, from_root: ContactId, to_root: ContactId) -> Result<usize, StorageError>;
}

impl ContactStore for Connection {
    fn find_by_email_or_phone(
        &self,
        email: Option<&str>,
        phone_number: Option<&str>,
    ) -> Result<Vec<ContactRow>, StorageError> {
        find_by_email_or_phone(self, email, phone_number)
    }

    fn find_group(&self, root_id: ContactId) -> Result<Vec<ContactRow>, StorageError> {
        find_group(self, root_id)
    }

    fn insert(&self, contact: &NewContact) -> Result<ContactRow, StorageError> {
        insert_contact(self, contact)
    }

    fn demote_to_secondary(&self, id: ContactId, primary_id: ContactId) -> Result<(), StorageError> {
        demote_to_secondary(self, id, primary_id)
    }

    fn relink_secondaries(&self, from_root: ContactId, to_root: ContactId) -> Result<usize, StorageError> {
        relink_secondaries(self, from_root, to_root)
    }
}
