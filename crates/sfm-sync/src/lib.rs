//! Migration pipeline orchestration: export, staged reconciliation, group
//! propagation and the optional user activation step.

use std::path::{Path, PathBuf};

use chrono::{Duration, NaiveDate, Utc};
use sfm_adapters::{Destination, Notifier, RecordSource};
use sfm_core::RunMode;
use sfm_storage::InterchangeStore;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod activation;
pub mod config;
pub mod error;
pub mod export;
pub mod groups;
pub mod load;
pub mod reconcile;
pub mod report;

pub use config::{Credentials, FailurePolicy, MigrationConfig, MigrationSettings};
pub use error::MigrationError;
pub use reconcile::{EntityPools, ReconciliationEngine, LOAD_ORDER};
pub use report::{RunReport, RunStatus};

use crate::groups::GroupPropagator;
use crate::load::{load_entity, load_junctions};

/// `<root>/<YYYY-MM-DD>`, shared by the run log and the run report.
pub fn dated_dir(root: &Path, date: NaiveDate) -> PathBuf {
    root.join(date.format("%Y-%m-%d").to_string())
}

#[derive(Debug, Clone, Copy)]
pub struct RunOptions {
    pub mode: RunMode,
    pub date: NaiveDate,
    pub skip_export: bool,
    pub send_mail: bool,
}

pub struct MigrationPipeline {
    config: MigrationConfig,
    settings: MigrationSettings,
    store: InterchangeStore,
    destination: Box<dyn Destination>,
    source: Option<Box<dyn RecordSource>>,
    notifier: Option<Box<dyn Notifier>>,
}

impl MigrationPipeline {
    pub fn new(
        config: MigrationConfig,
        settings: MigrationSettings,
        destination: Box<dyn Destination>,
    ) -> Self {
        let store = InterchangeStore::new(config.csv_dir.clone());
        Self {
            config,
            settings,
            store,
            destination,
            source: None,
            notifier: None,
        }
    }

    pub fn with_source(mut self, source: Box<dyn RecordSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_notifier(mut self, notifier: Box<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn destination(&self) -> &dyn Destination {
        self.destination.as_ref()
    }

    pub fn report_dir(&self, date: NaiveDate) -> PathBuf {
        dated_dir(&self.config.log_dir, date)
    }

    /// Runs every phase inside a `migration_run` span. Aborts are recorded on the report.
    pub async fn run(&self, options: RunOptions) -> RunReport {
        let run_id = Uuid::new_v4();
        let span = info_span!("migration_run", run_id = %run_id, mode = %options.mode);
        async move {
            let mut report = RunReport::new(run_id, options.mode, self.settings.failure_policy);
            info!(csv_dir = %self.config.csv_dir.display(), date = %options.date, "migration started");
            match self.execute(&options, &mut report).await {
                Ok(()) => {
                    report.finish();
                    info!(failed = report.failed_records(), "migration finished");
                }
                Err(err) => {
                    error!(error = %err, "migration aborted");
                    report.abort(&err);
                }
            }
            report
        }
        .instrument(span)
        .await
    }

    async fn execute(&self, options: &RunOptions, report: &mut RunReport) -> Result<(), MigrationError> {
        if !options.skip_export {
            match self.source.as_deref() {
                Some(source) => {
                    let since = match options.mode {
                        RunMode::Full => None,
                        RunMode::Incremental => Some(
                            Utc::now()
                                - Duration::hours(i64::from(self.settings.incremental_window_hours)),
                        ),
                    };
                    let files = export::export_all(source, &self.store, options.mode, options.date, since)
                        .instrument(info_span!("export"))
                        .await?;
                    report.exported_files = files.into_iter().map(|f| f.path).collect();
                }
                None => warn!("no source configured; importing existing interchange files"),
            }
        }

        let junctions = load_junctions(
            &self.store,
            options.mode,
            options.date,
            self.settings.junction_policy,
        )
        .await?;

        let mut engine = ReconciliationEngine::new(
            self.destination.as_ref(),
            &junctions,
            &self.settings.user_defaults,
            options.mode,
            self.settings.failure_policy,
        );
        let mut pools = EntityPools::new();
        for entity in LOAD_ORDER {
            let span = info_span!("entity", entity = %entity);
            let loaded = load_entity(
                &self.store,
                options.mode,
                options.date,
                entity,
                self.settings.failure_policy,
            )
            .instrument(span.clone())
            .await?;
            let mut stage = engine
                .reconcile_stage(entity, &loaded.records, &mut pools)
                .instrument(span)
                .await?;
            for outcome in loaded.rejected {
                stage.record(outcome);
            }
            report.stages.push(stage);
        }
        report.security_groups_created = engine.groups_created();

        let propagation = GroupPropagator::new(
            self.destination.as_ref(),
            &junctions,
            self.settings.failure_policy,
        )
        .propagate(&pools)
        .instrument(info_span!("propagation"))
        .await?;
        report.propagation = Some(propagation);

        if options.send_mail {
            match self.notifier.as_deref() {
                Some(notifier) => {
                    let activation = activation::activate_inactive_users(
                        self.destination.as_ref(),
                        notifier,
                        &self.settings.user_defaults,
                        &self.settings.notification,
                    )
                    .instrument(info_span!("activation"))
                    .await?;
                    report.activation = Some(activation);
                }
                None => warn!("mail requested but no notifier configured"),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dated_dir_uses_iso_dates() {
        let date = NaiveDate::from_ymd_opt(2012, 7, 7).unwrap();
        assert_eq!(
            dated_dir(Path::new("/var/log/sugarcrm"), date),
            PathBuf::from("/var/log/sugarcrm/2012-07-07")
        );
    }
}
