//! Contact Hub - identity reconciliation for customer contacts
//!
//! Links contact observations (email, phone number) that belong to the same
//! person into identity groups: one primary contact, the earliest seen, and
//! any number of secondaries pointing straight at it.
//!
//! ## Identify
//!
//! Each observation is reconciled inside one SQLite write transaction:
//!
//! 1. match live contacts by email or phone
//! 2. no match: create a primary
//! 3. resolve the groups the matches belong to
//! 4. more than one group: keep the oldest primary, demote the others and
//!    repoint their secondaries
//! 5. create a secondary when the observation carries a new email or phone
//! 6. project the group into `{primaryContactId, emails, phoneNumbers, secondaryContactIds}`
//!
//! ## Storage Layout
//!
//! ```text
//! ~/.local/share/contact-hub/
//! ├── contacts.db        # SQLite (WAL)
//! └── config.toml        # Configuration
//! ```

pub mod config;
pub mod db;
pub mod error;
pub mod invariants;
pub mod observation;
pub mod reconcile;
pub mod services;
pub mod views;

// Re-exports
pub use config::{Config, RetryPolicy};
pub use db::{ContactDb, ContactId, ContactRow, ContactStats, LinkPrecedence};
pub use error::StorageError;
pub use observation::Observation;
pub use reconcile::{IdentifyResponse, IdentifyResult};
pub use services::{ContactEvent, ContactService, EventBus, Services};
