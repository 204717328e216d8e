//! Service layer for contact-hub
//!
//! ```text
//! Caller (CLI / transport)
//!     ↓
//! ContactService (transaction boundary, retry, events)
//!     ↓
//! reconcile (identity algorithm over ContactStore)
//!     ↓
//! db/contacts.rs → SQLite
//! ```

pub mod events;
pub mod contact_service;

pub use events::{ContactEvent, EventBus, EventListener};
pub use contact_service::ContactService;

use crate::config::RetryPolicy;
use crate::db::ContactDb;
use std::sync::Arc;

/// Service container for dependency injection
pub struct Services {
    pub contacts: Arc<ContactService>,
    pub events: Arc<EventBus>,
}

impl Services {
    /// Create all services over one store handle
    pub fn new(db: Arc<ContactDb>, retry: RetryPolicy) -> Self {
        let events = Arc::new(EventBus::new());

        Self {
            contacts: Arc::new(ContactService::new(db, events.clone(), retry)),
            events,
        }
    }
}
