//! Per-run report written next to the run's log file.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sfm_core::{EntityType, RunMode};
use tokio::fs;
use uuid::Uuid;

use crate::config::FailurePolicy;
use crate::error::MigrationError;

/// Direct association that could not be made because its target is absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedAssociation {
    pub target: EntityType,
    pub key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RecordOutcome {
    Created {
        sf_id: String,
        id: String,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        skipped: Vec<SkippedAssociation>,
    },
    Updated {
        sf_id: String,
        id: String,
    },
    Failed {
        sf_id: String,
        reason: String,
    },
}

impl RecordOutcome {
    pub fn failed(sf_id: &str, err: &MigrationError) -> Self {
        RecordOutcome::Failed {
            sf_id: sf_id.to_string(),
            reason: err.to_string(),
        }
    }

    pub fn sf_id(&self) -> &str {
        match self {
            RecordOutcome::Created { sf_id, .. }
            | RecordOutcome::Updated { sf_id, .. }
            | RecordOutcome::Failed { sf_id, .. } => sf_id,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StageReport {
    pub entity: EntityType,
    pub created: usize,
    pub updated: usize,
    pub skipped: usize,
    pub failed: usize,
    pub outcomes: Vec<RecordOutcome>,
}

impl StageReport {
    pub fn new(entity: EntityType) -> Self {
        Self {
            entity,
            created: 0,
            updated: 0,
            skipped: 0,
            failed: 0,
            outcomes: Vec::new(),
        }
    }

    pub fn record(&mut self, outcome: RecordOutcome) {
        match &outcome {
            RecordOutcome::Created { skipped, .. } => {
                self.created += 1;
                self.skipped += skipped.len();
            }
            RecordOutcome::Updated { .. } => self.updated += 1,
            RecordOutcome::Failed { .. } => self.failed += 1,
        }
        self.outcomes.push(outcome);
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PropagationReport {
    pub isos: usize,
    pub agents: usize,
    pub merchants: usize,
    pub skipped_agents: usize,
    pub skipped_merchants: usize,
    pub associations: usize,
    /// Groups, users or roles the propagator expected but could not find.
    pub missing: usize,
    pub failures: Vec<RecordOutcome>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActivatedUser {
    pub id: String,
    pub user_name: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ActivationReport {
    pub activated: Vec<ActivatedUser>,
    pub notification_failures: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    CompletedWithFailures,
    Aborted,
}

impl RunStatus {
    pub fn exit_code(&self) -> u8 {
        match self {
            RunStatus::Succeeded => 0,
            RunStatus::Aborted => 1,
            RunStatus::CompletedWithFailures => 2,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub mode: RunMode,
    pub failure_policy: FailurePolicy,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exported_files: Vec<PathBuf>,
    pub stages: Vec<StageReport>,
    pub security_groups_created: usize,
    pub propagation: Option<PropagationReport>,
    pub activation: Option<ActivationReport>,
    pub aborted: Option<String>,
}

impl RunReport {
    pub fn new(run_id: Uuid, mode: RunMode, failure_policy: FailurePolicy) -> Self {
        Self {
            run_id,
            mode,
            failure_policy,
            started_at: Utc::now(),
            finished_at: None,
            exported_files: Vec::new(),
            stages: Vec::new(),
            security_groups_created: 0,
            propagation: None,
            activation: None,
            aborted: None,
        }
    }

    pub fn stage(&self, entity: EntityType) -> Option<&StageReport> {
        self.stages.iter().find(|s| s.entity == entity)
    }

    pub fn failed_records(&self) -> usize {
        let stage_failures: usize = self.stages.iter().map(|s| s.failed).sum();
        let propagation_failures = self.propagation.as_ref().map_or(0, |p| p.failures.len());
        stage_failures + propagation_failures
    }

    pub fn status(&self) -> RunStatus {
        if self.aborted.is_some() {
            RunStatus::Aborted
        } else if self.failed_records() > 0 {
            RunStatus::CompletedWithFailures
        } else {
            RunStatus::Succeeded
        }
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    pub fn abort(&mut self, err: &MigrationError) {
        self.aborted = Some(err.to_string());
        self.finish();
    }

    /// Writes `run_<run_id>.json` into `dir`.
    pub async fn write_to(&self, dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(dir)
            .await
            .with_context(|| format!("creating report dir {}", dir.display()))?;
        let path = dir.join(format!("run_{}.json", self.run_id));
        let bytes = serde_json::to_vec_pretty(self).context("serializing run report")?;
        fs::write(&path, bytes)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(path)
    }
}
