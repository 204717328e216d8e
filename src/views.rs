//! Read-only projections over the contact store
//!
//! These group contacts by `link_precedence`/`linked_id` for listing and
//! dashboards. They add no invariants and tolerate slightly stale reads.

use std::collections::HashMap;

use serde::Serialize;

use crate::db::{ContactId, ContactRow};

/// A primary with the secondaries that link to it
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactGroup {
    pub primary: ContactRow,
    pub secondaries: Vec<ContactRow>,
}

/// Values seen anywhere in a group, primary's first
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsolidatedData {
    pub emails: Vec<String>,
    pub phone_numbers: Vec<String>,
    pub total_contacts: usize,
}

/// One entry of the primary/secondary hierarchy
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HierarchyEntry {
    pub primary_contact: ContactRow,
    pub secondary_contacts: Vec<ContactRow>,
    pub consolidated_data: ConsolidatedData,
}

/// Group contacts under their primaries.
///
/// Groups come out in primary creation order; secondaries in creation
/// order. Secondaries whose primary is not in `contacts` are dropped.
pub fn group_contacts(contacts: &[ContactRow]) -> Vec<ContactGroup> {
    let mut primaries: Vec<&ContactRow> = contacts
        .iter()
        .filter(|c| c.deleted_at.is_none() && c.is_primary())
        .collect();
    primaries.sort_by_key(|c| c.creation_key());

    let mut secondaries: HashMap<ContactId, Vec<&ContactRow>> = HashMap::new();
    for c in contacts.iter().filter(|c| c.deleted_at.is_none() && !c.is_primary()) {
        if let Some(root) = c.linked_id {
            secondaries.entry(root).or_default().push(c);
        }
    }

    primaries
        .into_iter()
        .map(|primary| {
            let mut members = secondaries.remove(&primary.id).unwrap_or_default();
            members.sort_by_key(|c| c.creation_key());
            ContactGroup {
                primary: primary.clone(),
                secondaries: members.into_iter().cloned().collect(),
            }
        })
        .collect()
}

/// Hierarchy view with consolidated emails and phone numbers per group
pub fn hierarchy(contacts: &[ContactRow]) -> Vec<HierarchyEntry> {
    group_contacts(contacts)
        .into_iter()
        .map(|group| {
            let members = || std::iter::once(&group.primary).chain(group.secondaries.iter());
            let emails = dedup(members().filter_map(|c| c.email.as_deref()));
            let phone_numbers = dedup(members().filter_map(|c| c.phone_number.as_deref()));
            let total_contacts = 1 + group.secondaries.len();

            HierarchyEntry {
                consolidated_data: ConsolidatedData {
                    emails,
                    phone_numbers,
                    total_contacts,
                },
                primary_contact: group.primary,
                secondary_contacts: group.secondaries,
            }
        })
        .collect()
}

fn dedup<'a>(values: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for value in values {
        if !out.iter().any(|v| v == value) {
            out.push(value.to_string());
        }
    }
    out
}
