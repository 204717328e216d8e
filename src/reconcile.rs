//! Identity reconciliation.
//!
//! Given one observation, find every identity group it touches, merge the
//! groups when it touches more than one, add a secondary when it carries
//! information the group has not seen, and project the group into an
//! [`IdentifyResult`].
//!
//! Every function here runs against a [`ContactStore`] that the caller has
//! already placed inside a single write transaction.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::db::{ContactId, ContactRow, ContactStore, NewContact};
use crate::error::StorageError;
use crate::observation::Observation;

/// Consolidated view of one identity group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentifyResult {
    pub primary_contact_id: ContactId,
    pub emails: Vec<String>,
    pub phone_numbers: Vec<String>,
    pub secondary_contact_ids: Vec<ContactId>,
}

/// Wire envelope: `{ "contact": { ... } }`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentifyResponse {
    pub contact: IdentifyResult,
}

impl From<IdentifyResult> for IdentifyResponse {
    fn from(contact: IdentifyResult) -> Self {
        Self { contact }
    }
}

/// Groups folded into one by a single observation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeSummary {
    pub primary_id: ContactId,
    pub demoted_ids: Vec<ContactId>,
    pub relinked: usize,
}

/// Everything one identify call did
#[derive(Debug, Clone)]
pub struct Reconciliation {
    pub result: IdentifyResult,
    pub created: Option<ContactRow>,
    pub merge: Option<MergeSummary>,
}

/// Reconcile one observation against the store
pub fn reconcile<S>(store: &S, observation: &Observation) -> Result<Reconciliation, StorageError>
where
    S: ContactStore + ?Sized,
{
    let email = observation.email();
    let phone = observation.phone_number();

    let matches = store.find_by_email_or_phone(email, phone)?;

    if matches.is_empty() {
        let contact = store.insert(&NewContact::primary(email, phone))?;
        debug!(id = contact.id, "No match, created primary contact");

        let result = project(std::slice::from_ref(&contact))?;
        return Ok(Reconciliation {
            result,
            created: Some(contact),
            merge: None,
        });
    }

    let roots = distinct_roots(&matches);
    debug!(matches = matches.len(), roots = ?roots, "Resolved matching groups");

    let (mut group, merge) = if roots.len() == 1 {
        (store.find_group(roots[0])?, None)
    } else {
        let (group, summary) = merge_groups(store, &roots)?;
        (group, Some(summary))
    };

    let created = if needs_new_secondary(&group, email, phone) {
        let primary_id = group_primary(&group)?.id;
        let contact = store.insert(&NewContact::secondary(email, phone, primary_id))?;
        debug!(id = contact.id, primary_id, "Observation adds information, created secondary");
        group.push(contact.clone());
        Some(contact)
    } else {
        None
    };

    let result = project(&group)?;

    Ok(Reconciliation {
        result,
        created,
        merge,
    })
}

/// Group roots of the matched contacts, in first-seen order
fn distinct_roots(matches: &[ContactRow]) -> Vec<ContactId> {
    let mut roots = Vec::new();
    for contact in matches {
        let root = contact.root_id();
        if !roots.contains(&root) {
            roots.push(root);
        }
    }
    roots
}

/// Fold several groups under the earliest-created primary.
///
/// Losers are demoted and their secondaries repointed straight at the
/// winner, so no chain is ever written.
fn merge_groups<S>(store: &S, roots: &[ContactId]) -> Result<(Vec<ContactRow>, MergeSummary), StorageError>
where
    S: ContactStore + ?Sized,
{
    let mut primaries = Vec::with_capacity(roots.len());
    for &root in roots {
        let group = store.find_group(root)?;
        let primary = group
            .into_iter()
            .find(|c| c.id == root && c.is_primary())
            .ok_or_else(|| {
                StorageError::InvariantViolation(format!("Group root {} is not a live primary", root))
            })?;
        primaries.push(primary);
    }

    // Earliest created_at wins; equal timestamps fall back to the lowest id
    primaries.sort_by_key(ContactRow::creation_key);

    let winner = primaries[0].id;
    let mut demoted_ids = Vec::with_capacity(primaries.len() - 1);
    let mut relinked = 0;

    for loser in &primaries[1..] {
        store.demote_to_secondary(loser.id, winner)?;
        relinked += store.relink_secondaries(loser.id, winner)?;
        demoted_ids.push(loser.id);
    }

    info!(
        primary_id = winner,
        demoted = ?demoted_ids,
        relinked,
        "Merged identity groups"
    );

    let group = store.find_group(winner)?;

    Ok((
        group,
        MergeSummary {
            primary_id: winner,
            demoted_ids,
            relinked,
        },
    ))
}

/// Whether the observation carries something the group has not recorded.
///
/// An exact (email, phone) pair, nulls included, never creates a contact.
/// Otherwise a value missing from every member does, even if the two
/// requested values already sit on different members.
pub fn needs_new_secondary(group: &[ContactRow], email: Option<&str>, phone: Option<&str>) -> bool {
    let exact = group
        .iter()
        .any(|c| c.email.as_deref() == email && c.phone_number.as_deref() == phone);
    if exact {
        return false;
    }

    let new_email = email.is_some_and(|e| !group.iter().any(|c| c.email.as_deref() == Some(e)));
    let new_phone = phone.is_some_and(|p| !group.iter().any(|c| c.phone_number.as_deref() == Some(p)));

    new_email || new_phone
}

fn group_primary(group: &[ContactRow]) -> Result<&ContactRow, StorageError> {
    let mut primaries = group.iter().filter(|c| c.is_primary());
    match (primaries.next(), primaries.next()) {
        (Some(primary), None) => Ok(primary),
        (None, _) => Err(StorageError::InvariantViolation(
            "Identity group has no primary contact".into(),
        )),
        (Some(a), Some(b)) => Err(StorageError::InvariantViolation(format!(
            "Identity group has two primaries ({} and {})",
            a.id, b.id
        ))),
    }
}

/// Project a group (in creation order) into the response shape
pub fn project(group: &[ContactRow]) -> Result<IdentifyResult, StorageError> {
    let primary = group_primary(group)?;

    if let Some(stray) = group
        .iter()
        .find(|c| !c.is_primary() && c.linked_id != Some(primary.id))
    {
        return Err(StorageError::InvariantViolation(format!(
            "Contact {} links to {:?} instead of primary {}",
            stray.id, stray.linked_id, primary.id
        )));
    }

    let emails = primary_first(
        group.iter().filter_map(|c| c.email.as_deref()),
        primary.email.as_deref(),
    );
    let phone_numbers = primary_first(
        group.iter().filter_map(|c| c.phone_number.as_deref()),
        primary.phone_number.as_deref(),
    );

    let secondary_contact_ids = group
        .iter()
        .filter(|c| !c.is_primary())
        .map(|c| c.id)
        .collect();

    Ok(IdentifyResult {
        primary_contact_id: primary.id,
        emails,
        phone_numbers,
        secondary_contact_ids,
    })
}

/// Deduplicate keeping first-seen order, then move `lead` to the front
fn primary_first<'a>(values: impl Iterator<Item = &'a str>, lead: Option<&str>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for value in values {
        if !out.iter().any(|v| v == value) {
            out.push(value.to_string());
        }
    }

    if let Some(lead) = lead {
        if let Some(pos) = out.iter().position(|v| v == lead) {
            let value = out.remove(pos);
            out.insert(0, value);
        }
    }

    out
}
