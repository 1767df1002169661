//! Security group membership, replayed from the ISO -> Agent -> Merchant chain
//! once every load stage has finished.

use sfm_adapters::{Destination, DestinationError};
use sfm_core::{DestinationHandle, EntityType, JunctionKind, JunctionResolver, SF_ID};
use tracing::{debug, error, info, warn};

use crate::config::FailurePolicy;
use crate::error::MigrationError;
use crate::reconcile::EntityPools;
use crate::report::{PropagationReport, RecordOutcome};

pub const ISO_ROLE: &str = "isos";
pub const AGENT_ROLE: &str = "agents";

pub struct GroupPropagator<'a> {
    destination: &'a dyn Destination,
    junctions: &'a JunctionResolver,
    policy: FailurePolicy,
}

impl<'a> GroupPropagator<'a> {
    pub fn new(
        destination: &'a dyn Destination,
        junctions: &'a JunctionResolver,
        policy: FailurePolicy,
    ) -> Self {
        Self {
            destination,
            junctions,
            policy,
        }
    }

    /// Runs the ISO, Agent and Merchant passes in that order.
    pub async fn propagate(&self, pools: &EntityPools) -> Result<PropagationReport, MigrationError> {
        let mut report = PropagationReport::default();

        for iso in pools.get(EntityType::Iso) {
            let result = self.propagate_iso(iso, &mut report).await;
            self.settle(iso, result, &mut report)?;
        }
        for agent in pools.get(EntityType::Agent) {
            let result = self.propagate_agent(agent, &mut report).await;
            self.settle(agent, result, &mut report)?;
        }
        for merchant in pools.get(EntityType::Merchant) {
            let result = self.propagate_merchant(merchant, &mut report).await;
            self.settle(merchant, result, &mut report)?;
        }

        info!(
            isos = report.isos,
            agents = report.agents,
            merchants = report.merchants,
            skipped_agents = report.skipped_agents,
            skipped_merchants = report.skipped_merchants,
            associations = report.associations,
            missing = report.missing,
            "group propagation complete"
        );
        Ok(report)
    }

    fn settle(
        &self,
        handle: &DestinationHandle,
        result: Result<(), MigrationError>,
        report: &mut PropagationReport,
    ) -> Result<(), MigrationError> {
        match result {
            Ok(()) => Ok(()),
            Err(err) if err.is_record_level() && self.policy == FailurePolicy::Continue => {
                error!(record = %handle.label(), error = %err, "propagation failed; continuing");
                report
                    .failures
                    .push(RecordOutcome::failed(handle.sf_id().unwrap_or(&handle.id), &err));
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn propagate_iso(
        &self,
        iso: &DestinationHandle,
        report: &mut PropagationReport,
    ) -> Result<(), MigrationError> {
        let Some(name) = iso.name() else {
            warn!(record = %iso.label(), "ISO has no name; not propagated");
            return Ok(());
        };
        let Some(group) = self.group(iso, name, report).await? else {
            return Ok(());
        };
        self.link(iso, iso, &group, report).await?;
        self.link_user_and_role(iso, name, ISO_ROLE, &group, report)
            .await?;
        report.isos += 1;
        Ok(())
    }

    async fn propagate_agent(
        &self,
        agent: &DestinationHandle,
        report: &mut PropagationReport,
    ) -> Result<(), MigrationError> {
        let Some(iso) = self.first_related(agent, agent, EntityType::Iso).await? else {
            debug!(record = %agent.label(), "agent has no ISO; skipped");
            report.skipped_agents += 1;
            return Ok(());
        };
        let Some(iso_name) = iso.name() else {
            report.skipped_agents += 1;
            return Ok(());
        };
        let Some(group) = self.group(agent, iso_name, report).await? else {
            return Ok(());
        };
        self.link(agent, agent, &group, report).await?;
        match agent.name() {
            Some(name) => {
                self.link_user_and_role(agent, name, AGENT_ROLE, &group, report)
                    .await?
            }
            None => warn!(record = %agent.label(), "agent has no name; user not linked"),
        }
        report.agents += 1;
        Ok(())
    }

    async fn propagate_merchant(
        &self,
        merchant: &DestinationHandle,
        report: &mut PropagationReport,
    ) -> Result<(), MigrationError> {
        let iso = match self
            .first_related(merchant, merchant, EntityType::Agent)
            .await?
        {
            Some(agent) => {
                self.first_related(merchant, &agent, EntityType::Iso)
                    .await?
            }
            None => None,
        };
        let Some(iso_name) = iso.as_ref().and_then(|i| i.name()) else {
            report.skipped_merchants += 1;
            return Ok(());
        };
        let Some(group) = self.group(merchant, iso_name, report).await? else {
            return Ok(());
        };
        self.link(merchant, merchant, &group, report).await?;

        if let Some(sf_id) = merchant.sf_id() {
            for (kind, target) in [
                (JunctionKind::MerchantEmail, EntityType::Email),
                (JunctionKind::MerchantPaymentMethod, EntityType::PaymentMethod),
            ] {
                for linked in self.junctions.linked(kind, sf_id) {
                    for record in self.find(merchant, target, SF_ID, linked).await? {
                        self.link(merchant, &record, &group, report).await?;
                    }
                }
            }
            let banks = self
                .find(merchant, EntityType::SettlementBankAccount, "sf_merchant", sf_id)
                .await?;
            for bank in &banks {
                self.link(merchant, bank, &group, report).await?;
            }
        }
        report.merchants += 1;
        Ok(())
    }

    async fn link_user_and_role(
        &self,
        owner: &DestinationHandle,
        user_last_name: &str,
        role_name: &str,
        group: &DestinationHandle,
        report: &mut PropagationReport,
    ) -> Result<(), MigrationError> {
        let user = self
            .destination
            .find_user_by_last_name(user_last_name)
            .await
            .map_err(|e| failure(owner, "find_user", e))?;
        match user {
            Some(user) => self.link(owner, &user, group, report).await?,
            None => {
                warn!(record = %owner.label(), user = user_last_name, "companion user not found");
                report.missing += 1;
            }
        }

        let role = self
            .destination
            .find_role_by_name(role_name)
            .await
            .map_err(|e| failure(owner, "find_role", e))?;
        match role {
            Some(role) => self.link(owner, &role, group, report).await?,
            None => {
                warn!(role = role_name, "role not found");
                report.missing += 1;
            }
        }
        Ok(())
    }

    async fn group(
        &self,
        owner: &DestinationHandle,
        name: &str,
        report: &mut PropagationReport,
    ) -> Result<Option<DestinationHandle>, MigrationError> {
        let group = self
            .destination
            .find_security_group_by_name(name)
            .await
            .map_err(|e| failure(owner, "find_group", e))?;
        if group.is_none() {
            warn!(record = %owner.label(), group = name, "security group not found");
            report.missing += 1;
        }
        Ok(group)
    }

    async fn first_related(
        &self,
        owner: &DestinationHandle,
        from: &DestinationHandle,
        target: EntityType,
    ) -> Result<Option<DestinationHandle>, MigrationError> {
        Ok(self
            .destination
            .related(from, target)
            .await
            .map_err(|e| failure(owner, "related", e))?
            .into_iter()
            .next())
    }

    async fn find(
        &self,
        owner: &DestinationHandle,
        entity: EntityType,
        attribute: &str,
        value: &str,
    ) -> Result<Vec<DestinationHandle>, MigrationError> {
        self.destination
            .find_by(entity, attribute, value)
            .await
            .map_err(|e| failure(owner, "find", e))
    }

    async fn link(
        &self,
        owner: &DestinationHandle,
        member: &DestinationHandle,
        group: &DestinationHandle,
        report: &mut PropagationReport,
    ) -> Result<(), MigrationError> {
        self.destination
            .associate(member, group)
            .await
            .map_err(|e| failure(owner, "associate_group", e))?;
        report.associations += 1;
        Ok(())
    }
}

fn failure(owner: &DestinationHandle, operation: &'static str, source: DestinationError) -> MigrationError {
    MigrationError::write_failure(
        owner.entity,
        owner.sf_id().unwrap_or(&owner.id),
        operation,
        source,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use sfm_adapters::InMemoryDestination;
    use sfm_core::{FieldMap, FieldValue, JunctionTable, NAME};

    fn fields(pairs: &[(&str, &str)]) -> FieldMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), FieldValue::text(*v)))
            .collect()
    }

    struct World {
        dest: InMemoryDestination,
        pools: EntityPools,
    }

    async fn world() -> World {
        let dest = InMemoryDestination::new();
        let mut pools = EntityPools::new();
        dest.seed(EntityType::Role, fields(&[(NAME, ISO_ROLE)])).await;
        dest.seed(EntityType::Role, fields(&[(NAME, AGENT_ROLE)])).await;
        dest.seed(EntityType::SecurityGroup, fields(&[(NAME, "Acme")])).await;
        dest.seed(EntityType::User, fields(&[("last_name", "Acme")])).await;
        dest.seed(EntityType::User, fields(&[("last_name", "Agent One")])).await;

        let iso = dest.seed(EntityType::Iso, fields(&[(SF_ID, "I1"), (NAME, "Acme")])).await;
        let agent = dest.seed(EntityType::Agent, fields(&[(SF_ID, "A1"), (NAME, "Agent One")])).await;
        let lone_agent = dest.seed(EntityType::Agent, fields(&[(SF_ID, "A2"), (NAME, "Lone")])).await;
        let merchant = dest.seed(EntityType::Merchant, fields(&[(SF_ID, "M1"), (NAME, "Shop")])).await;
        let orphan = dest.seed(EntityType::Merchant, fields(&[(SF_ID, "M2"), (NAME, "Orphan")])).await;
        dest.seed(EntityType::Email, fields(&[(SF_ID, "E1")])).await;
        dest.seed(EntityType::PaymentMethod, fields(&[(SF_ID, "PM1")])).await;
        dest.seed(EntityType::SettlementBankAccount, fields(&[(SF_ID, "B1"), ("sf_merchant", "M1")])).await;
        dest.seed(EntityType::SettlementBankAccount, fields(&[(SF_ID, "B2"), ("sf_merchant", "M1")])).await;

        dest.associate(&agent, &iso).await.unwrap();
        dest.associate(&merchant, &agent).await.unwrap();

        for handle in [iso, agent, lone_agent, merchant, orphan] {
            pools.push(handle);
        }
        World { dest, pools }
    }

    fn junctions() -> JunctionResolver {
        let mut resolver = JunctionResolver::default();
        let mut apm = JunctionTable::new(JunctionKind::MerchantPaymentMethod);
        apm.insert("M1", "PM1");
        resolver.load(apm);
        let mut emails = JunctionTable::new(JunctionKind::MerchantEmail);
        emails.insert("M1", "E1");
        resolver.load(emails);
        resolver
    }

    #[tokio::test]
    async fn three_pass_propagation_links_the_whole_chain() {
        let World { dest, pools } = world().await;
        let junctions = junctions();
        let propagator = GroupPropagator::new(&dest, &junctions, FailurePolicy::FailFast);
        let report = propagator.propagate(&pools).await.unwrap();

        assert_eq!((report.isos, report.agents, report.merchants), (1, 1, 1));
        assert_eq!((report.skipped_agents, report.skipped_merchants), (1, 1));
        assert_eq!(report.missing, 0);

        let group = dest.find_security_group_by_name("Acme").await.unwrap().unwrap();
        for (entity, expected) in [
            (EntityType::Iso, 1),
            (EntityType::Agent, 1),
            (EntityType::Merchant, 1),
            (EntityType::Email, 1),
            (EntityType::PaymentMethod, 1),
            (EntityType::SettlementBankAccount, 2),
            (EntityType::User, 2),
            (EntityType::Role, 2),
        ] {
            let members = dest.related(&group, entity).await.unwrap();
            assert_eq!(members.len(), expected, "{entity} members");
        }
    }

    #[tokio::test]
    async fn missing_group_is_counted_not_fatal() {
        let dest = InMemoryDestination::new();
        let iso = dest
            .seed(EntityType::Iso, fields(&[(SF_ID, "I9"), (NAME, "Nowhere")]))
            .await;
        let mut pools = EntityPools::new();
        pools.push(iso);
        let junctions = JunctionResolver::default();
        let report = GroupPropagator::new(&dest, &junctions, FailurePolicy::FailFast)
            .propagate(&pools)
            .await
            .unwrap();
        assert_eq!(report.missing, 1);
        assert_eq!(report.isos, 0);
        assert_eq!(dest.association_count().await, 0);
    }

    #[tokio::test]
    async fn merchant_pass_links_every_record_sharing_a_junction_key() {
        let World { dest, pools } = world().await;
        dest.seed(EntityType::Email, fields(&[(SF_ID, "E1"), (NAME, "copy")])).await;
        let junctions = junctions();
        GroupPropagator::new(&dest, &junctions, FailurePolicy::FailFast)
            .propagate(&pools)
            .await
            .unwrap();

        let group = dest.find_security_group_by_name("Acme").await.unwrap().unwrap();
        let emails = dest.related(&group, EntityType::Email).await.unwrap();
        assert_eq!(emails.len(), 2);
    }
}
