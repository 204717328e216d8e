//! Contact service - the identify transaction and read projections
//!
//! Wraps the reconciliation engine in one write transaction per call,
//! retries the whole transaction on lock contention, and emits events once
//! the transaction has committed.

use std::sync::Arc;
use std::thread;

use tracing::{debug, error, warn};

use crate::config::RetryPolicy;
use crate::db::{contacts, ContactDb, ContactRow, ContactStats};
use crate::error::StorageError;
use crate::invariants;
use crate::observation::Observation;
use crate::reconcile::{self, IdentifyResult, Reconciliation};
use crate::views::{self, ContactGroup, HierarchyEntry};

use super::events::{ContactEvent, EventBus};

/// Contact service for identity reconciliation
pub struct ContactService {
    db: Arc<ContactDb>,
    events: Arc<EventBus>,
    retry: RetryPolicy,
}

impl ContactService {
    pub fn new(db: Arc<ContactDb>, events: Arc<EventBus>, retry: RetryPolicy) -> Self {
        Self { db, events, retry }
    }

    // =========================================================================
    // Identify
    // =========================================================================

    /// Reconcile an (email, phone) observation and return its group
    pub fn identify(
        &self,
        email: Option<String>,
        phone_number: Option<String>,
    ) -> Result<IdentifyResult, StorageError> {
        let observation = Observation::new(email, phone_number)?;
        self.identify_observation(&observation)
    }

    /// Reconcile an already-parsed observation
    pub fn identify_observation(&self, observation: &Observation) -> Result<IdentifyResult, StorageError> {
        let outcome = self.run_with_retry(observation).map_err(|e| {
            if let StorageError::InvariantViolation(detail) = &e {
                error!(detail = %detail, "Identity invariant violated");
            }
            e
        })?;

        self.emit_events(&outcome);
        Ok(outcome.result)
    }

    fn run_with_retry(&self, observation: &Observation) -> Result<Reconciliation, StorageError> {
        let mut attempt = 1;

        loop {
            let result = self
                .db
                .with_write_transaction(|tx| reconcile::reconcile(&**tx, observation));

            match result {
                Err(e) if e.is_transient() && attempt < self.retry.max_attempts => {
                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        attempt,
                        max_attempts = self.retry.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Identify transaction conflicted, retrying"
                    );
                    thread::sleep(delay);
                    attempt += 1;
                }
                Err(e) if e.is_transient() => {
                    return Err(StorageError::Storage(format!(
                        "Gave up after {} attempts: {}",
                        attempt, e
                    )));
                }
                other => return other,
            }
        }
    }

    fn emit_events(&self, outcome: &Reconciliation) {
        if let Some(merge) = &outcome.merge {
            self.events.emit(ContactEvent::GroupsMerged {
                primary_id: merge.primary_id,
                demoted_ids: merge.demoted_ids.clone(),
            });
        }

        if let Some(contact) = &outcome.created {
            debug!(id = contact.id, precedence = %contact.link_precedence, "New contact committed");
            self.events.emit(ContactEvent::ContactCreated {
                id: contact.id,
                link_precedence: contact.link_precedence,
                linked_id: contact.linked_id,
            });
        }
    }

    // =========================================================================
    // Read Operations
    // =========================================================================

    /// All live contacts, primaries first
    pub fn list_contacts(&self) -> Result<Vec<ContactRow>, StorageError> {
        self.db.with_conn(contacts::list_contacts)
    }

    /// Primaries with their secondaries
    pub fn list_groups(&self) -> Result<Vec<ContactGroup>, StorageError> {
        Ok(views::group_contacts(&self.list_contacts()?))
    }

    pub fn hierarchy(&self) -> Result<Vec<HierarchyEntry>, StorageError> {
        Ok(views::hierarchy(&self.list_contacts()?))
    }

    pub fn stats(&self) -> Result<ContactStats, StorageError> {
        self.db.stats()
    }

    /// Every invariant violation currently in the store
    pub fn audit(&self) -> Result<Vec<String>, StorageError> {
        let all = self.db.with_read_transaction(|tx| contacts::list_contacts(tx))?;
        Ok(invariants::audit(&all))
    }
}
