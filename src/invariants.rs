//! Structural checks over a snapshot of live contacts.
//!
//! After every identify call the store must satisfy:
//! - each group has exactly one primary, and it is the earliest created member
//! - secondaries link straight to a primary (no chains), never to themselves
//! - every contact carries an email or a phone number
//! - no (email, phone) pair repeats inside a group

use std::collections::{HashMap, HashSet};

use crate::db::{ContactId, ContactRow};
use crate::error::StorageError;

/// Every violation found in `contacts` (soft-deleted rows are ignored)
pub fn audit(contacts: &[ContactRow]) -> Vec<String> {
    let live: Vec<&ContactRow> = contacts.iter().filter(|c| c.deleted_at.is_none()).collect();
    let by_id: HashMap<ContactId, &ContactRow> = live.iter().map(|c| (c.id, *c)).collect();
    let mut violations = Vec::new();

    for c in &live {
        if c.email.is_none() && c.phone_number.is_none() {
            violations.push(format!("contact {} has neither email nor phone", c.id));
        }
        if c.linked_id == Some(c.id) {
            violations.push(format!("contact {} links to itself", c.id));
        }

        match (c.is_primary(), c.linked_id) {
            (true, Some(target)) => {
                violations.push(format!("primary {} has linked_id {}", c.id, target));
            }
            (false, None) => {
                violations.push(format!("secondary {} has no linked_id", c.id));
            }
            (false, Some(target)) => match by_id.get(&target) {
                None => violations.push(format!(
                    "secondary {} links to missing contact {}",
                    c.id, target
                )),
                Some(t) if !t.is_primary() => violations.push(format!(
                    "secondary {} links to secondary {} (chain)",
                    c.id, target
                )),
                Some(_) => {}
            },
            (true, None) => {}
        }
    }

    let mut groups: HashMap<ContactId, Vec<&ContactRow>> = HashMap::new();
    for &c in &live {
        groups.entry(c.root_id()).or_default().push(c);
    }

    for (root, members) in &groups {
        let Some(primary) = by_id.get(root).filter(|p| p.is_primary()) else {
            continue; // reported above as a dangling link or chain
        };

        if let Some(earlier) = members
            .iter()
            .find(|m| m.creation_key() < primary.creation_key())
        {
            violations.push(format!(
                "contact {} is older than its primary {}",
                earlier.id, primary.id
            ));
        }

        let mut pairs = HashSet::new();
        for m in members {
            if !pairs.insert((m.email.as_deref(), m.phone_number.as_deref())) {
                violations.push(format!(
                    "group {} repeats pair ({:?}, {:?})",
                    root, m.email, m.phone_number
                ));
            }
        }
    }

    violations
}

/// Fail on the first violation
pub fn check(contacts: &[ContactRow]) -> Result<(), StorageError> {
    match audit(contacts).into_iter().next() {
        Some(violation) => Err(StorageError::InvariantViolation(violation)),
        None => Ok(()),
    }
}
