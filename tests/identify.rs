//! Integration tests for identify reconciliation
//!
//! Each test runs against a fresh in-memory store through the service layer.

use std::sync::Arc;

use contact_hub::db::{contacts, NewContact};
use contact_hub::{
    ContactDb, ContactEvent, ContactRow, IdentifyResult, LinkPrecedence, RetryPolicy, Services,
    StorageError,
};
use rusqlite::params;

fn setup() -> (Services, Arc<ContactDb>) {
    let db = Arc::new(ContactDb::open_in_memory().expect("in-memory db"));
    (Services::new(Arc::clone(&db), RetryPolicy::default()), db)
}

fn identify(services: &Services, email: Option<&str>, phone: Option<&str>) -> IdentifyResult {
    services
        .contacts
        .identify(email.map(String::from), phone.map(String::from))
        .expect("identify")
}

fn all_contacts(services: &Services) -> Vec<ContactRow> {
    services.contacts.list_contacts().unwrap()
}

fn by_id(services: &Services, id: i64) -> ContactRow {
    all_contacts(services)
        .into_iter()
        .find(|c| c.id == id)
        .expect("contact exists")
}

fn assert_clean(services: &Services) {
    let violations = services.contacts.audit().unwrap();
    assert!(violations.is_empty(), "invariant violations: {:?}", violations);
}

#[test]
fn test_new_primary_on_empty_store() {
    let (services, _db) = setup();

    let result = identify(&services, Some("a@x.com"), Some("111"));

    let stored = all_contacts(&services);
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].link_precedence, LinkPrecedence::Primary);
    assert_eq!(result.primary_contact_id, stored[0].id);
    assert_eq!(result.emails, vec!["a@x.com"]);
    assert_eq!(result.phone_numbers, vec!["111"]);
    assert!(result.secondary_contact_ids.is_empty());
}

#[test]
fn test_partial_match_creates_secondary() {
    let (services, _db) = setup();
    let first = identify(&services, Some("a@x.com"), Some("111"));

    let result = identify(&services, Some("a@x.com"), Some("222"));

    assert_eq!(result.primary_contact_id, first.primary_contact_id);
    assert_eq!(result.emails, vec!["a@x.com"]);
    assert_eq!(result.phone_numbers, vec!["111", "222"]);
    assert_eq!(result.secondary_contact_ids.len(), 1);

    let secondary = by_id(&services, result.secondary_contact_ids[0]);
    assert_eq!(secondary.link_precedence, LinkPrecedence::Secondary);
    assert_eq!(secondary.linked_id, Some(first.primary_contact_id));
    assert_eq!(secondary.phone_number.as_deref(), Some("222"));
    assert_clean(&services);
}

#[test]
fn test_existing_pair_creates_nothing() {
    let (services, _db) = setup();
    identify(&services, Some("a@x.com"), Some("111"));
    identify(&services, Some("a@x.com"), Some("222"));

    identify(&services, Some("a@x.com"), Some("111"));
    identify(&services, Some("a@x.com"), Some("222"));

    assert_eq!(all_contacts(&services).len(), 2);
}

#[test]
fn test_identify_is_idempotent() {
    let (services, _db) = setup();
    identify(&services, Some("a@x.com"), Some("111"));
    identify(&services, Some("b@x.com"), Some("111"));

    let first = identify(&services, Some("b@x.com"), Some("111"));
    let count = all_contacts(&services).len();
    let second = identify(&services, Some("b@x.com"), Some("111"));

    assert_eq!(first, second);
    assert_eq!(all_contacts(&services).len(), count);
}

#[test]
fn test_single_side_observations() {
    let (services, _db) = setup();
    let base = identify(&services, Some("a@x.com"), Some("111"));

    // known email alone: nothing new
    let by_email = identify(&services, Some("a@x.com"), None);
    assert_eq!(by_email, base);

    // known phone alone: nothing new
    let by_phone = identify(&services, None, Some("111"));
    assert_eq!(by_phone, base);
    assert_eq!(all_contacts(&services).len(), 1);

    // unknown phone alone: a new primary with a null email
    let fresh = identify(&services, None, Some("999"));
    assert_ne!(fresh.primary_contact_id, base.primary_contact_id);
    assert!(fresh.emails.is_empty());
    assert_eq!(by_id(&services, fresh.primary_contact_id).email, None);
}

#[test]
fn test_split_fields_in_one_group_create_nothing() {
    let (services, _db) = setup();
    identify(&services, Some("a@x.com"), Some("111"));
    identify(&services, Some("b@x.com"), Some("111"));
    identify(&services, Some("b@x.com"), Some("222"));
    assert_eq!(all_contacts(&services).len(), 3);

    // email on one member, phone on another, same group
    let result = identify(&services, Some("a@x.com"), Some("222"));

    assert_eq!(all_contacts(&services).len(), 3);
    assert_eq!(result.emails, vec!["a@x.com", "b@x.com"]);
    assert_eq!(result.phone_numbers, vec!["111", "222"]);
}

#[test]
fn test_merge_demotes_newer_primary() {
    let (services, _db) = setup();
    let a = identify(&services, Some("a@x.com"), Some("111"));
    let b = identify(&services, Some("b@x.com"), Some("222"));
    let b_secondary = identify(&services, Some("b@x.com"), Some("333"));
    assert_eq!(b_secondary.primary_contact_id, b.primary_contact_id);
    let b2_id = b_secondary.secondary_contact_ids[0];

    let result = identify(&services, Some("a@x.com"), Some("222"));

    assert_eq!(result.primary_contact_id, a.primary_contact_id);
    assert_eq!(result.emails, vec!["a@x.com", "b@x.com"]);
    assert_eq!(result.phone_numbers, vec!["111", "222", "333"]);
    assert_eq!(result.secondary_contact_ids, vec![b.primary_contact_id, b2_id]);

    let demoted = by_id(&services, b.primary_contact_id);
    assert_eq!(demoted.link_precedence, LinkPrecedence::Secondary);
    assert_eq!(demoted.linked_id, Some(a.primary_contact_id));
    assert!(demoted.updated_at > demoted.created_at);

    // flattened, not chained through the demoted primary
    assert_eq!(by_id(&services, b2_id).linked_id, Some(a.primary_contact_id));

    // both values were already known, so no new contact
    assert_eq!(all_contacts(&services).len(), 3);
    assert_clean(&services);
}

#[test]
fn test_merge_fires_even_when_pair_exists() {
    let (services, db) = setup();
    let a = identify(&services, Some("a@x.com"), Some("111"));
    let b = identify(&services, Some("b@x.com"), Some("222"));

    // A member of B's group already holds the exact pair that will be observed
    let c = db
        .with_write_transaction(|tx| {
            contacts::insert_contact(
                tx,
                &NewContact::secondary(Some("a@x.com"), Some("222"), b.primary_contact_id),
            )
        })
        .unwrap();

    let result = identify(&services, Some("a@x.com"), Some("222"));

    assert_eq!(result.primary_contact_id, a.primary_contact_id);
    assert_eq!(result.secondary_contact_ids, vec![b.primary_contact_id, c.id]);
    assert_eq!(by_id(&services, c.id).linked_id, Some(a.primary_contact_id));
    assert_eq!(all_contacts(&services).len(), 3);
}

#[test]
fn test_merge_cascade_keeps_one_hop_links() {
    let (services, _db) = setup();
    let a = identify(&services, Some("a@x.com"), Some("1"));
    identify(&services, Some("b@x.com"), Some("2"));
    identify(&services, Some("b@x.com"), Some("3"));
    identify(&services, Some("a@x.com"), Some("2"));
    let c = identify(&services, Some("c@x.com"), Some("4"));
    identify(&services, Some("c@x.com"), Some("5"));

    // phone 3 belongs to A's group (via the merged B), email c to C's group
    let result = identify(&services, Some("c@x.com"), Some("3"));

    assert_eq!(result.primary_contact_id, a.primary_contact_id);
    assert!(result.secondary_contact_ids.contains(&c.primary_contact_id));
    assert_eq!(result.emails, vec!["a@x.com", "b@x.com", "c@x.com"]);

    let stored = all_contacts(&services);
    assert_eq!(stored.iter().filter(|c| c.link_precedence == LinkPrecedence::Primary).count(), 1);
    assert!(stored
        .iter()
        .filter(|c| c.id != a.primary_contact_id)
        .all(|c| c.linked_id == Some(a.primary_contact_id)));
    assert_clean(&services);
}

#[test]
fn test_merge_then_new_email() {
    let (services, _db) = setup();
    let a = identify(&services, Some("a@x.com"), None);
    let b = identify(&services, None, Some("222"));

    let result = identify(&services, Some("a@x.com"), Some("222"));

    // groups merge; both values are already known, so nothing is created
    assert_eq!(result.primary_contact_id, a.primary_contact_id);
    assert_eq!(result.secondary_contact_ids.len(), 1);
    assert_eq!(result.secondary_contact_ids[0], b.primary_contact_id);
    assert_eq!(all_contacts(&services).len(), 2);

    let result = identify(&services, Some("z@x.com"), Some("222"));
    assert_eq!(result.secondary_contact_ids.len(), 2);
    assert_eq!(result.emails, vec!["a@x.com", "z@x.com"]);
}

#[test]
fn test_invalid_input_writes_nothing() {
    let (services, _db) = setup();

    let err = services.contacts.identify(None, None).unwrap_err();
    assert!(matches!(err, StorageError::InvalidInput(_)));

    let err = services
        .contacts
        .identify(Some("   ".into()), Some(String::new()))
        .unwrap_err();
    assert!(matches!(err, StorageError::InvalidInput(_)));

    assert!(all_contacts(&services).is_empty());
}

#[test]
fn test_soft_deleted_contacts_are_ignored() {
    let (services, db) = setup();
    let old = identify(&services, Some("a@x.com"), Some("111"));

    db.with_write_transaction(|tx| {
        tx.execute(
            "UPDATE contacts SET deleted_at = '2024-01-01T00:00:00.000000Z' WHERE id = ?",
            params![old.primary_contact_id],
        )
        .map_err(|e| StorageError::Storage(e.to_string()))
    })
    .unwrap();

    let fresh = identify(&services, Some("a@x.com"), Some("111"));
    assert_ne!(fresh.primary_contact_id, old.primary_contact_id);
    assert!(fresh.secondary_contact_ids.is_empty());
    assert_eq!(all_contacts(&services).len(), 1);
}

#[test]
fn test_clock_step_back_keeps_primary_oldest() {
    let (services, db) = setup();
    let a = identify(&services, Some("a@x.com"), Some("111"));

    // primary stamped ahead of the current clock
    db.with_write_transaction(|tx| {
        tx.execute(
            "UPDATE contacts SET created_at = '2999-01-01T00:00:00.000000Z' WHERE id = ?",
            params![a.primary_contact_id],
        )
        .map_err(|e| StorageError::Storage(e.to_string()))
    })
    .unwrap();

    let result = identify(&services, Some("a@x.com"), Some("222"));
    assert_eq!(result.primary_contact_id, a.primary_contact_id);

    let secondary = by_id(&services, result.secondary_contact_ids[0]);
    let primary = by_id(&services, a.primary_contact_id);
    assert!(secondary.creation_key() > primary.creation_key());
    assert_clean(&services);
}

#[test]
fn test_events_follow_commits() {
    let (services, _db) = setup();
    let mut events = services.events.subscribe();

    let a = identify(&services, Some("a@x.com"), Some("111"));
    let b = identify(&services, Some("b@x.com"), Some("222"));
    let _ = services.contacts.identify(None, None);
    identify(&services, Some("a@x.com"), Some("222"));

    let received: Vec<ContactEvent> = std::iter::from_fn(|| events.try_recv().ok()).collect();
    assert_eq!(
        received,
        vec![
            ContactEvent::ContactCreated {
                id: a.primary_contact_id,
                link_precedence: LinkPrecedence::Primary,
                linked_id: None,
            },
            ContactEvent::ContactCreated {
                id: b.primary_contact_id,
                link_precedence: LinkPrecedence::Primary,
                linked_id: None,
            },
            ContactEvent::GroupsMerged {
                primary_id: a.primary_contact_id,
                demoted_ids: vec![b.primary_contact_id],
            },
        ]
    );
}

#[test]
fn test_projections_after_merge() {
    let (services, _db) = setup();
    identify(&services, Some("a@x.com"), Some("111"));
    identify(&services, Some("a@x.com"), Some("222"));
    identify(&services, Some("c@x.com"), Some("333"));

    let groups = services.contacts.list_groups().unwrap();
    assert_eq!(groups.len(), 2);
    assert_eq!(groups[0].secondaries.len(), 1);
    assert!(groups[1].secondaries.is_empty());

    let hierarchy = services.contacts.hierarchy().unwrap();
    assert_eq!(hierarchy[0].consolidated_data.phone_numbers, vec!["111", "222"]);
    assert_eq!(hierarchy[0].consolidated_data.total_contacts, 2);

    let stats = services.contacts.stats().unwrap();
    assert_eq!(stats.total_contacts, 3);
    assert_eq!(stats.primary_contacts, 2);
    assert_eq!(stats.secondary_contacts, 1);
    assert_eq!(stats.unique_emails, 2);
    assert_eq!(stats.unique_phones, 3);
    assert_eq!(stats.contact_groups, 2);
    assert_eq!(stats.avg_contacts_per_group, 1.5);
}

#[test]
fn test_response_shape() {
    let (services, _db) = setup();
    let result = identify(&services, Some("a@x.com"), Some("111"));

    let json = serde_json::to_value(contact_hub::IdentifyResponse::from(result)).unwrap();
    assert!(json["contact"]["primaryContactId"].is_i64());
    assert_eq!(json["contact"]["emails"][0], "a@x.com");
    assert_eq!(json["contact"]["phoneNumbers"][0], "111");
    assert!(json["contact"]["secondaryContactIds"].as_array().unwrap().is_empty());
}
