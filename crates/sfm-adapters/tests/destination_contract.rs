use std::sync::Arc;

use sfm_adapters::{Destination, DestinationError, InMemoryDestination, STATUS};
use sfm_core::{EntityType, FieldMap, FieldValue, NAME, SF_ID};

fn fields(pairs: &[(&str, &str)]) -> FieldMap {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), FieldValue::text(*v)))
        .collect()
}

fn destination() -> Arc<dyn Destination> {
    Arc::new(InMemoryDestination::new())
}

#[tokio::test]
async fn created_records_are_found_by_attribute() {
    let dest = destination();
    let created = dest
        .create(EntityType::Agent, &fields(&[(SF_ID, "A1"), (NAME, "Agent One")]))
        .await
        .unwrap();

    let found = dest.find_by(EntityType::Agent, SF_ID, "A1").await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id, created.id);
    assert!(dest.find_by(EntityType::Iso, SF_ID, "A1").await.unwrap().is_empty());
}

#[tokio::test]
async fn update_merges_into_the_stored_record() {
    let dest = destination();
    let user = dest
        .create(EntityType::User, &fields(&[(NAME, "EMP1"), (STATUS, "Inactive")]))
        .await
        .unwrap();

    let updated = dest
        .update_attributes(&user, &fields(&[(STATUS, "Active")]))
        .await
        .unwrap();
    assert_eq!(updated.attribute(STATUS), Some("Active"));
    assert_eq!(updated.name(), Some("EMP1"));
    assert!(dest.find_users_by_status("Inactive").await.unwrap().is_empty());
}

#[tokio::test]
async fn associations_are_visible_from_both_sides() {
    let dest = destination();
    let iso = dest.create(EntityType::Iso, &fields(&[(NAME, "Acme")])).await.unwrap();
    let agent = dest.create(EntityType::Agent, &fields(&[(NAME, "A")])).await.unwrap();
    dest.associate(&agent, &iso).await.unwrap();

    let agents = dest.related(&iso, EntityType::Agent).await.unwrap();
    assert_eq!(agents.len(), 1);
    assert_eq!(agents[0].id, agent.id);
    let isos = dest.related(&agent, EntityType::Iso).await.unwrap();
    assert_eq!(isos[0].id, iso.id);
}

#[tokio::test]
async fn unknown_records_are_rejected() {
    let dest = InMemoryDestination::new();
    let ghost = sfm_core::DestinationHandle::new(EntityType::Merchant, "merchant-9", FieldMap::new());
    let err = dest
        .update_attributes(&ghost, &FieldMap::new())
        .await
        .unwrap_err();
    assert!(matches!(err, DestinationError::UnknownRecord { .. }));
    assert!(dest.calls().await.is_empty());
}
