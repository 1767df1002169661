//! Interchange files back into transformed records and junction tables.

use chrono::NaiveDate;
use sfm_core::headers::{apply_system_prefix, assemble, normalize_all};
use sfm_core::{
    transform, EntityType, Extract, JunctionKind, JunctionResolver, JunctionTable,
    LinkPolicy, RawRecord, RunMode, TransformError, TransformedRecord, SYSTEM_FIELDS,
};
use sfm_storage::{InterchangeStore, InterchangeTable};
use tracing::{error, info};

use crate::config::FailurePolicy;
use crate::error::MigrationError;
use crate::report::RecordOutcome;

/// Normalized, system-prefixed rows of one interchange table.
pub fn normalize_table(table: InterchangeTable) -> Vec<RawRecord> {
    let headers = normalize_all(&table.headers);
    table
        .rows
        .into_iter()
        .map(|row| apply_system_prefix(assemble(&headers, row), SYSTEM_FIELDS))
        .collect()
}

/// Transformed rows of one entity plus the rows rejected before reconciliation.
#[derive(Debug, Default)]
pub struct LoadedEntity {
    pub records: Vec<TransformedRecord>,
    pub rejected: Vec<RecordOutcome>,
}

/// Reads and transforms one entity file. A row without an `Id` aborts under
/// `FailFast` and is reported as failed under `Continue`.
pub async fn load_entity(
    store: &InterchangeStore,
    mode: RunMode,
    date: NaiveDate,
    entity: EntityType,
    policy: FailurePolicy,
) -> Result<LoadedEntity, MigrationError> {
    let table = store.read_extract(mode, date, Extract::Entity(entity)).await?;
    let mut loaded = LoadedEntity::default();
    for (index, raw) in normalize_table(table).into_iter().enumerate() {
        match transform(entity, raw) {
            Ok(record) => loaded.records.push(record),
            Err(TransformError::MissingReconciliationKey { .. }) => {
                let err = MigrationError::MissingReconciliationKey {
                    entity,
                    row: index + 1,
                };
                if policy == FailurePolicy::FailFast {
                    return Err(err);
                }
                error!(entity = %entity, error = %err, "row rejected; continuing");
                loaded.rejected.push(RecordOutcome::failed("", &err));
            }
            Err(other) => return Err(other.into()),
        }
    }
    info!(
        entity = %entity,
        records = loaded.records.len(),
        rejected = loaded.rejected.len(),
        "loaded"
    );
    Ok(loaded)
}

/// Junction rows keep their relation columns unprefixed.
pub async fn load_junctions(
    store: &InterchangeStore,
    mode: RunMode,
    date: NaiveDate,
    policy: LinkPolicy,
) -> Result<JunctionResolver, MigrationError> {
    let mut resolver = JunctionResolver::new(policy);
    for kind in [JunctionKind::MerchantPaymentMethod, JunctionKind::MerchantEmail] {
        let table = store.read_extract(mode, date, Extract::Junction(kind)).await?;
        let table = JunctionTable::from_records(kind, &normalize_table(table));
        info!(kind = ?kind, pairs = table.len(), "loaded junction table");
        resolver.load(table);
    }
    Ok(resolver)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sfm_core::FieldValue;
    use tempfile::tempdir;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2012, 7, 7).unwrap()
    }

    fn row(pairs: &[(&str, &str)]) -> RawRecord {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn entity_rows_are_normalized_prefixed_and_transformed() {
        let dir = tempdir().expect("tempdir");
        let store = InterchangeStore::new(dir.path());
        store
            .write_extract(
                RunMode::Full,
                date(),
                Extract::Entity(EntityType::Agent),
                &[row(&[
                    ("Id", "A1"),
                    ("Name", "Agent One"),
                    ("ISO_Company__c", "I1"),
                    ("CreatedDate", "2012-07-01T10:00:00.000+0000"),
                ])],
            )
            .await
            .unwrap();

        let loaded = load_entity(&store, RunMode::Full, date(), EntityType::Agent, FailurePolicy::FailFast)
            .await
            .unwrap();
        assert!(loaded.rejected.is_empty());
        assert_eq!(loaded.records.len(), 1);
        let agent = &loaded.records[0];
        assert_eq!(agent.sf_id(), "A1");
        assert_eq!(agent.text("sf_iso"), Some("I1"));
        assert!(matches!(agent.get("sf_createddate"), Some(FieldValue::DateTime(_))));
        assert!(agent.get("id").is_none());
        assert!(agent.get("iso_company").is_none());
        assert!(agent.get("phone").unwrap().is_null());
    }

    #[tokio::test]
    async fn missing_file_aborts_with_its_path() {
        let dir = tempdir().expect("tempdir");
        let store = InterchangeStore::new(dir.path());
        let err = load_entity(&store, RunMode::Incremental, date(), EntityType::Iso, FailurePolicy::Continue)
            .await
            .unwrap_err();
        match err {
            MigrationError::MissingInterchangeFile { path } => {
                assert!(path.ends_with("update/2012-07-07/ISOs__c_export.csv"))
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    async fn write_agents_with_keyless_row(store: &InterchangeStore) {
        store
            .write_extract(
                RunMode::Full,
                date(),
                Extract::Entity(EntityType::Agent),
                &[
                    row(&[("Id", "A1"), ("Name", "Agent One")]),
                    row(&[("Id", ""), ("Name", "Nobody")]),
                    row(&[("Id", "A3"), ("Name", "Agent Three")]),
                ],
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn keyless_row_is_rejected_under_continue() {
        let dir = tempdir().expect("tempdir");
        let store = InterchangeStore::new(dir.path());
        write_agents_with_keyless_row(&store).await;

        let loaded = load_entity(&store, RunMode::Full, date(), EntityType::Agent, FailurePolicy::Continue)
            .await
            .unwrap();
        let ids: Vec<&str> = loaded.records.iter().map(|r| r.sf_id()).collect();
        assert_eq!(ids, vec!["A1", "A3"]);
        assert_eq!(loaded.rejected.len(), 1);
        match &loaded.rejected[0] {
            RecordOutcome::Failed { sf_id, reason } => {
                assert_eq!(sf_id, "");
                assert_eq!(reason, "agent row 2 has no sf_id reconciliation key");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn keyless_row_aborts_under_fail_fast() {
        let dir = tempdir().expect("tempdir");
        let store = InterchangeStore::new(dir.path());
        write_agents_with_keyless_row(&store).await;

        let err = load_entity(&store, RunMode::Full, date(), EntityType::Agent, FailurePolicy::FailFast)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            MigrationError::MissingReconciliationKey { entity: EntityType::Agent, row: 2 }
        ));
        assert!(err.is_record_level());
    }

    #[tokio::test]
    async fn junctions_load_with_policy() {
        let dir = tempdir().expect("tempdir");
        let store = InterchangeStore::new(dir.path());
        store
            .write_extract(
                RunMode::Full,
                date(),
                Extract::Junction(JunctionKind::MerchantPaymentMethod),
                &[
                    row(&[("Id", "J1"), ("Merchant__c", "M1"), ("Payment_Methods__c", "PM1")]),
                    row(&[("Id", "J2"), ("Merchant__c", "M1"), ("Payment_Methods__c", "PM2")]),
                ],
            )
            .await
            .unwrap();
        store
            .write_extract(
                RunMode::Full,
                date(),
                Extract::Junction(JunctionKind::MerchantEmail),
                &[row(&[("Id", "J3"), ("Merchant_Name__c", "M1"), ("Email__c", "E1")])],
            )
            .await
            .unwrap();

        let resolver = load_junctions(&store, RunMode::Full, date(), LinkPolicy::All)
            .await
            .unwrap();
        assert_eq!(
            resolver.linked(JunctionKind::MerchantPaymentMethod, "M1"),
            vec!["PM1", "PM2"]
        );
        assert_eq!(
            resolver.find_linked_id(JunctionKind::MerchantEmail, "M1"),
            Ok("E1")
        );
    }
}
