//! In-process destination used by tests and dry runs.

use std::collections::{BTreeSet, HashMap, HashSet};

use async_trait::async_trait;
use sfm_core::{DestinationHandle, EntityType, FieldMap};
use tokio::sync::Mutex;
use tracing::debug;

use crate::{Destination, DestinationError};

/// Mutating call observed by the in-memory destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DestinationCall {
    Create { entity: EntityType, id: String },
    Update { entity: EntityType, id: String },
    Associate { left: String, right: String },
}

#[derive(Debug, Default)]
struct State {
    next_id: HashMap<EntityType, u64>,
    records: HashMap<EntityType, Vec<DestinationHandle>>,
    associations: BTreeSet<(String, String)>,
    calls: Vec<DestinationCall>,
    failing_creates: HashSet<EntityType>,
}

impl State {
    fn allocate(&mut self, entity: EntityType, attributes: FieldMap) -> DestinationHandle {
        let counter = self.next_id.entry(entity).or_insert(0);
        *counter += 1;
        let handle = DestinationHandle::new(entity, format!("{entity}-{counter}"), attributes);
        self.records.entry(entity).or_default().push(handle.clone());
        handle
    }

    fn find_mut(&mut self, entity: EntityType, id: &str) -> Option<&mut DestinationHandle> {
        self.records
            .get_mut(&entity)
            .and_then(|records| records.iter_mut().find(|r| r.id == id))
    }

    fn find(&self, label: &str) -> Option<&DestinationHandle> {
        self.records
            .values()
            .flatten()
            .find(|r| r.label() == label)
    }
}

fn pair(left: &DestinationHandle, right: &DestinationHandle) -> (String, String) {
    let (a, b) = (left.label(), right.label());
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

/// Ids are `<entity>-<n>`, allocated per entity type. Associations are undirected.
#[derive(Debug, Default)]
pub struct InMemoryDestination {
    state: Mutex<State>,
}

impl InMemoryDestination {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a pre-existing record without logging a call.
    pub async fn seed(&self, entity: EntityType, fields: FieldMap) -> DestinationHandle {
        self.state.lock().await.allocate(entity, fields)
    }

    /// Makes every later `create` of `entity` fail.
    pub async fn fail_creates_of(&self, entity: EntityType) {
        self.state.lock().await.failing_creates.insert(entity);
    }

    pub async fn calls(&self) -> Vec<DestinationCall> {
        self.state.lock().await.calls.clone()
    }

    pub async fn records(&self, entity: EntityType) -> Vec<DestinationHandle> {
        self.state
            .lock()
            .await
            .records
            .get(&entity)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn count(&self, entity: EntityType) -> usize {
        self.state
            .lock()
            .await
            .records
            .get(&entity)
            .map_or(0, Vec::len)
    }

    pub async fn are_associated(&self, left: &DestinationHandle, right: &DestinationHandle) -> bool {
        self.state.lock().await.associations.contains(&pair(left, right))
    }

    pub async fn association_count(&self) -> usize {
        self.state.lock().await.associations.len()
    }

    pub async fn creates_of(&self, entity: EntityType) -> usize {
        self.calls()
            .await
            .iter()
            .filter(|c| matches!(c, DestinationCall::Create { entity: e, .. } if *e == entity))
            .count()
    }

    pub async fn updates_of(&self, entity: EntityType) -> usize {
        self.calls()
            .await
            .iter()
            .filter(|c| matches!(c, DestinationCall::Update { entity: e, .. } if *e == entity))
            .count()
    }
}

#[async_trait]
impl Destination for InMemoryDestination {
    async fn create(
        &self,
        entity: EntityType,
        fields: &FieldMap,
    ) -> Result<DestinationHandle, DestinationError> {
        let mut state = self.state.lock().await;
        if state.failing_creates.contains(&entity) {
            return Err(DestinationError::Rejected {
                entity,
                operation: "create",
                message: "create disabled".to_string(),
            });
        }
        let handle = state.allocate(entity, fields.clone());
        state.calls.push(DestinationCall::Create {
            entity,
            id: handle.id.clone(),
        });
        debug!(record = %handle.label(), "created");
        Ok(handle)
    }

    async fn update_attributes(
        &self,
        handle: &DestinationHandle,
        fields: &FieldMap,
    ) -> Result<DestinationHandle, DestinationError> {
        let mut state = self.state.lock().await;
        let stored = state
            .find_mut(handle.entity, &handle.id)
            .ok_or_else(|| DestinationError::UnknownRecord {
                entity: handle.entity,
                id: handle.id.clone(),
            })?;
        for (key, value) in fields {
            stored.set_attribute(key.clone(), value.clone());
        }
        let updated = stored.clone();
        state.calls.push(DestinationCall::Update {
            entity: handle.entity,
            id: handle.id.clone(),
        });
        Ok(updated)
    }

    async fn find_by(
        &self,
        entity: EntityType,
        attribute: &str,
        value: &str,
    ) -> Result<Vec<DestinationHandle>, DestinationError> {
        let state = self.state.lock().await;
        Ok(state
            .records
            .get(&entity)
            .map(|records| {
                records
                    .iter()
                    .filter(|r| {
                        r.attributes
                            .get(attribute)
                            .and_then(|v| v.to_wire_string())
                            .is_some_and(|v| v == value)
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn associate(
        &self,
        left: &DestinationHandle,
        right: &DestinationHandle,
    ) -> Result<(), DestinationError> {
        let mut state = self.state.lock().await;
        for handle in [left, right] {
            if state.find_mut(handle.entity, &handle.id).is_none() {
                return Err(DestinationError::UnknownRecord {
                    entity: handle.entity,
                    id: handle.id.clone(),
                });
            }
        }
        let key = pair(left, right);
        state.calls.push(DestinationCall::Associate {
            left: key.0.clone(),
            right: key.1.clone(),
        });
        state.associations.insert(key);
        Ok(())
    }

    async fn related(
        &self,
        handle: &DestinationHandle,
        target: EntityType,
    ) -> Result<Vec<DestinationHandle>, DestinationError> {
        let state = self.state.lock().await;
        let label = handle.label();
        let mut out = Vec::new();
        for (a, b) in &state.associations {
            let other = if *a == label {
                b
            } else if *b == label {
                a
            } else {
                continue;
            };
            if let Some(found) = state.find(other).filter(|r| r.entity == target) {
                out.push(found.clone());
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sfm_core::{FieldValue, SF_ID};

    fn fields(sf_id: &str) -> FieldMap {
        let mut f = FieldMap::new();
        f.insert(SF_ID.into(), FieldValue::text(sf_id));
        f
    }

    #[tokio::test]
    async fn ids_are_allocated_per_entity() {
        let dest = InMemoryDestination::new();
        let a = dest.create(EntityType::Iso, &fields("I1")).await.unwrap();
        let b = dest.create(EntityType::Agent, &fields("A1")).await.unwrap();
        let c = dest.create(EntityType::Iso, &fields("I2")).await.unwrap();
        assert_eq!(a.id, "iso-1");
        assert_eq!(b.id, "agent-1");
        assert_eq!(c.id, "iso-2");
    }

    #[tokio::test]
    async fn associations_are_undirected_and_deduplicated() {
        let dest = InMemoryDestination::new();
        let iso = dest.create(EntityType::Iso, &fields("I1")).await.unwrap();
        let agent = dest.create(EntityType::Agent, &fields("A1")).await.unwrap();
        dest.associate(&agent, &iso).await.unwrap();
        dest.associate(&iso, &agent).await.unwrap();
        assert_eq!(dest.association_count().await, 1);
        assert!(dest.are_associated(&iso, &agent).await);

        let isos = dest.related(&agent, EntityType::Iso).await.unwrap();
        assert_eq!(isos.len(), 1);
        assert_eq!(isos[0].id, iso.id);
        assert!(dest.related(&agent, EntityType::Merchant).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn updates_merge_attributes() {
        let dest = InMemoryDestination::new();
        let seeded = dest.seed(EntityType::Agent, fields("A1")).await;
        let mut patch = FieldMap::new();
        patch.insert("phone".into(), FieldValue::text("555"));
        let updated = dest.update_attributes(&seeded, &patch).await.unwrap();
        assert_eq!(updated.attribute("phone"), Some("555"));
        assert_eq!(updated.sf_id(), Some("A1"));

        let found = dest.find_by(EntityType::Agent, SF_ID, "A1").await.unwrap();
        assert_eq!(found[0].attribute("phone"), Some("555"));
        assert_eq!(
            dest.calls().await,
            vec![DestinationCall::Update {
                entity: EntityType::Agent,
                id: "agent-1".into()
            }]
        );
    }

    #[tokio::test]
    async fn unknown_records_and_disabled_creates_fail() {
        let dest = InMemoryDestination::new();
        let ghost = DestinationHandle::new(EntityType::Iso, "iso-9", FieldMap::new());
        assert!(matches!(
            dest.update_attributes(&ghost, &FieldMap::new()).await,
            Err(DestinationError::UnknownRecord { .. })
        ));

        dest.fail_creates_of(EntityType::User).await;
        assert!(matches!(
            dest.create(EntityType::User, &FieldMap::new()).await,
            Err(DestinationError::Rejected { operation: "create", .. })
        ));
        assert_eq!(dest.count(EntityType::User).await, 0);
    }
}
