//! Create-or-update decision per record plus the direct associations and
//! companion users hanging off the create path.
//!
//! Stages run in [`LOAD_ORDER`]; each stage resolves its associations against
//! records persisted by earlier stages.

use std::collections::{BTreeMap, HashMap};

use sfm_adapters::{Destination, DestinationError, LAST_NAME, STATUS};
use sfm_core::{
    DestinationHandle, EntityType, FieldMap, FieldValue, JunctionKind, JunctionResolver, RunMode,
    TransformedRecord, ASSIGNED_USER_ID, NAME, SF_ID,
};
use tracing::{debug, error, info, warn};

use crate::config::{FailurePolicy, UserDefaults};
use crate::error::MigrationError;
use crate::report::{RecordOutcome, SkippedAssociation, StageReport};

pub const LOAD_ORDER: [EntityType; 6] = [
    EntityType::Email,
    EntityType::PaymentMethod,
    EntityType::Iso,
    EntityType::Agent,
    EntityType::Merchant,
    EntityType::SettlementBankAccount,
];

/// Handles created during the run, grouped by type in processing order.
#[derive(Debug, Default)]
pub struct EntityPools {
    pools: BTreeMap<EntityType, Vec<DestinationHandle>>,
    by_key: HashMap<(EntityType, String), DestinationHandle>,
}

impl EntityPools {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, handle: DestinationHandle) {
        if let Some(sf_id) = handle.sf_id() {
            self.by_key
                .insert((handle.entity, sf_id.to_string()), handle.clone());
        }
        self.pools.entry(handle.entity).or_default().push(handle);
    }

    pub fn get(&self, entity: EntityType) -> &[DestinationHandle] {
        self.pools.get(&entity).map(Vec::as_slice).unwrap_or_default()
    }

    /// Handle created earlier in this run for the same reconciliation key.
    pub fn created(&self, entity: EntityType, sf_id: &str) -> Option<&DestinationHandle> {
        self.by_key.get(&(entity, sf_id.to_string()))
    }

    pub fn len(&self, entity: EntityType) -> usize {
        self.get(entity).len()
    }
}

/// Field holding the external login for a companion user.
fn login_field(entity: EntityType) -> Option<&'static str> {
    match entity {
        EntityType::Iso => Some("emerchantpay_iso_id"),
        EntityType::Agent => Some("emerchantpay_agent_id"),
        _ => None,
    }
}

pub struct ReconciliationEngine<'a> {
    destination: &'a dyn Destination,
    junctions: &'a JunctionResolver,
    users: &'a UserDefaults,
    mode: RunMode,
    policy: FailurePolicy,
    groups_created: usize,
}

impl<'a> ReconciliationEngine<'a> {
    pub fn new(
        destination: &'a dyn Destination,
        junctions: &'a JunctionResolver,
        users: &'a UserDefaults,
        mode: RunMode,
        policy: FailurePolicy,
    ) -> Self {
        Self {
            destination,
            junctions,
            users,
            mode,
            policy,
            groups_created: 0,
        }
    }

    pub fn groups_created(&self) -> usize {
        self.groups_created
    }

    /// Reconciles one entity stage. Record-level failures follow the failure policy.
    pub async fn reconcile_stage(
        &mut self,
        entity: EntityType,
        records: &[TransformedRecord],
        pools: &mut EntityPools,
    ) -> Result<StageReport, MigrationError> {
        let mut report = StageReport::new(entity);
        for record in records {
            match self.reconcile_record(record, pools).await {
                Ok(outcome) => report.record(outcome),
                Err(err) if err.is_record_level() && self.policy == FailurePolicy::Continue => {
                    error!(entity = %entity, sf_id = record.sf_id(), error = %err, "record failed; continuing");
                    report.record(RecordOutcome::failed(record.sf_id(), &err));
                }
                Err(err) => {
                    error!(entity = %entity, sf_id = record.sf_id(), error = %err, "record failed; aborting run");
                    return Err(err);
                }
            }
        }
        info!(
            entity = %entity,
            created = report.created,
            updated = report.updated,
            skipped = report.skipped,
            failed = report.failed,
            "stage complete"
        );
        Ok(report)
    }

    pub async fn reconcile_record(
        &mut self,
        record: &TransformedRecord,
        pools: &mut EntityPools,
    ) -> Result<RecordOutcome, MigrationError> {
        if let Some(existing) = pools.created(record.entity(), record.sf_id()).cloned() {
            debug!(sf_id = record.sf_id(), "repeated key in batch; updating");
            return self.update(record, &existing).await;
        }
        match self.mode {
            RunMode::Full => self.create(record, pools).await,
            RunMode::Incremental => {
                let mut matches = self
                    .destination
                    .find_by(record.entity(), SF_ID, record.sf_id())
                    .await
                    .map_err(|e| MigrationError::write_failure(record.entity(), record.sf_id(), "find", e))?;
                match matches.len() {
                    0 => self.create(record, pools).await,
                    1 => {
                        let target = matches.remove(0);
                        self.update(record, &target).await
                    }
                    n => Err(MigrationError::AmbiguousReconciliationTarget {
                        entity: record.entity(),
                        sf_id: record.sf_id().to_string(),
                        matches: n,
                    }),
                }
            }
        }
    }

    async fn update(
        &self,
        record: &TransformedRecord,
        target: &DestinationHandle,
    ) -> Result<RecordOutcome, MigrationError> {
        let updated = self
            .destination
            .update_attributes(target, &record.fields_for_update())
            .await
            .map_err(|e| MigrationError::write_failure(record.entity(), record.sf_id(), "update", e))?;
        Ok(RecordOutcome::Updated {
            sf_id: record.sf_id().to_string(),
            id: updated.id,
        })
    }

    async fn create(
        &mut self,
        record: &TransformedRecord,
        pools: &mut EntityPools,
    ) -> Result<RecordOutcome, MigrationError> {
        let entity = record.entity();
        let mut handle = self
            .destination
            .create(entity, record.fields())
            .await
            .map_err(|e| MigrationError::write_failure(entity, record.sf_id(), "create", e))?;

        let mut skipped = Vec::new();
        match entity {
            EntityType::Agent => {
                self.attach(&handle, record, EntityType::Iso, record.text("sf_iso"), &mut skipped)
                    .await?;
            }
            EntityType::Merchant => {
                self.attach_merchant(&mut handle, record, &mut skipped).await?;
            }
            EntityType::SettlementBankAccount => {
                self.attach(
                    &handle,
                    record,
                    EntityType::Merchant,
                    record.text("sf_merchant"),
                    &mut skipped,
                )
                .await?;
            }
            _ => {}
        }

        if entity == EntityType::Iso {
            match record.name() {
                Some(name) => {
                    self.ensure_security_group(name)
                        .await
                        .map_err(|e| MigrationError::write_failure(entity, record.sf_id(), "security_group", e))?;
                }
                None => warn!(sf_id = record.sf_id(), "ISO has no name; no security group"),
            }
        }

        if let Some(login_field) = login_field(entity) {
            let user = self.materialize_user(&mut handle, record, login_field).await?;
            pools.push(user);
        }

        let id = handle.id.clone();
        pools.push(handle);
        Ok(RecordOutcome::Created {
            sf_id: record.sf_id().to_string(),
            id,
            skipped,
        })
    }

    async fn attach_merchant(
        &self,
        handle: &mut DestinationHandle,
        record: &TransformedRecord,
        skipped: &mut Vec<SkippedAssociation>,
    ) -> Result<(), MigrationError> {
        for (kind, target) in [
            (JunctionKind::MerchantPaymentMethod, EntityType::PaymentMethod),
            (JunctionKind::MerchantEmail, EntityType::Email),
        ] {
            for linked in self.junctions.linked(kind, record.sf_id()) {
                self.attach(handle, record, target, Some(linked), skipped)
                    .await?;
            }
        }

        let agent = self
            .attach(handle, record, EntityType::Agent, record.text("sf_agent"), skipped)
            .await?;
        let Some(user_id) = agent
            .as_ref()
            .and_then(|a| a.attribute(ASSIGNED_USER_ID))
            .map(ToString::to_string)
        else {
            return Ok(());
        };

        let mut patch = FieldMap::new();
        patch.insert(ASSIGNED_USER_ID.to_string(), FieldValue::text(user_id));
        *handle = self
            .destination
            .update_attributes(handle, &patch)
            .await
            .map_err(|e| MigrationError::write_failure(EntityType::Merchant, record.sf_id(), "inherit_user", e))?;
        Ok(())
    }

    /// Links `handle` to the `target` record keyed `key`. An absent target is skipped.
    async fn attach(
        &self,
        handle: &DestinationHandle,
        record: &TransformedRecord,
        target: EntityType,
        key: Option<&str>,
        skipped: &mut Vec<SkippedAssociation>,
    ) -> Result<Option<DestinationHandle>, MigrationError> {
        let entity = record.entity();
        let found = match key {
            Some(key) => self
                .destination
                .find_by(target, SF_ID, key)
                .await
                .map_err(|e| MigrationError::write_failure(entity, record.sf_id(), "find", e))?,
            None => Vec::new(),
        };
        if found.len() > 1 {
            warn!(
                sf_id = record.sf_id(),
                target = %target,
                key,
                matches = found.len(),
                "several association targets; using the first"
            );
        }
        let Some(target_handle) = found.into_iter().next() else {
            warn!(sf_id = record.sf_id(), target = %target, key, "association target not found; skipping");
            skipped.push(SkippedAssociation {
                target,
                key: key.map(ToString::to_string),
            });
            return Ok(None);
        };
        self.destination
            .associate(handle, &target_handle)
            .await
            .map_err(|e| MigrationError::write_failure(entity, record.sf_id(), "associate", e))?;
        Ok(Some(target_handle))
    }

    async fn ensure_security_group(
        &mut self,
        name: &str,
    ) -> Result<DestinationHandle, DestinationError> {
        if let Some(group) = self.destination.find_security_group_by_name(name).await? {
            return Ok(group);
        }
        let mut fields = FieldMap::new();
        fields.insert(NAME.to_string(), FieldValue::text(name));
        let group = self
            .destination
            .create(EntityType::SecurityGroup, &fields)
            .await?;
        self.groups_created += 1;
        info!(group = name, "created security group");
        Ok(group)
    }

    pub fn companion_user_fields(&self, record: &TransformedRecord, login_field: &str) -> FieldMap {
        let user_name = record
            .text(login_field)
            .unwrap_or(self.users.login_fallback.as_str());
        let mut fields = FieldMap::new();
        fields.insert("user_name".to_string(), FieldValue::text(user_name));
        fields.insert(
            LAST_NAME.to_string(),
            FieldValue::text(record.name().unwrap_or_default()),
        );
        fields.insert("type_c".to_string(), FieldValue::text(record.entity().as_str()));
        fields.insert(
            "email1".to_string(),
            FieldValue::text(self.users.contact_email.as_str()),
        );
        fields.insert(STATUS.to_string(), FieldValue::text(self.users.status.as_str()));
        fields.insert("system_generated_password".to_string(), FieldValue::text("0"));
        fields
    }

    /// Creates the owner's portal user and points the owner's assigned user at it.
    async fn materialize_user(
        &self,
        owner: &mut DestinationHandle,
        record: &TransformedRecord,
        login_field: &str,
    ) -> Result<DestinationHandle, MigrationError> {
        let failed = |source: DestinationError| MigrationError::CompanionUserFailed {
            entity: record.entity(),
            sf_id: record.sf_id().to_string(),
            source,
        };
        let user = self
            .destination
            .create(EntityType::User, &self.companion_user_fields(record, login_field))
            .await
            .map_err(failed)?;

        let mut patch = FieldMap::new();
        patch.insert(ASSIGNED_USER_ID.to_string(), FieldValue::text(user.id.as_str()));
        *owner = self
            .destination
            .update_attributes(owner, &patch)
            .await
            .map_err(failed)?;
        debug!(owner = %owner.label(), user = %user.label(), "companion user linked");
        Ok(user)
    }
}
