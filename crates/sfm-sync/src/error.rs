use std::path::PathBuf;

use sfm_adapters::{DestinationError, SourceError};
use sfm_core::{CatalogError, EntityType, TransformError};
use sfm_storage::StorageError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("entity type `{0}` is not registered in the field catalog")]
    UnknownEntityType(EntityType),
    #[error("interchange file {path} is missing")]
    MissingInterchangeFile { path: PathBuf },
    #[error("{matches} destination {entity} records share sf_id {sf_id}")]
    AmbiguousReconciliationTarget {
        entity: EntityType,
        sf_id: String,
        matches: usize,
    },
    #[error("{operation} failed for {entity} {sf_id}: {source}")]
    DestinationWriteFailure {
        entity: EntityType,
        sf_id: String,
        operation: &'static str,
        #[source]
        source: DestinationError,
    },
    #[error("companion user for {entity} {sf_id} could not be materialized: {source}")]
    CompanionUserFailed {
        entity: EntityType,
        sf_id: String,
        #[source]
        source: DestinationError,
    },
    #[error("{entity} row {row} has no sf_id reconciliation key")]
    MissingReconciliationKey { entity: EntityType, row: usize },
    #[error("export failed: {0}")]
    Export(#[from] SourceError),
    #[error(transparent)]
    Transform(TransformError),
    #[error(transparent)]
    Storage(StorageError),
}

impl MigrationError {
    pub fn write_failure(
        entity: EntityType,
        sf_id: &str,
        operation: &'static str,
        source: DestinationError,
    ) -> Self {
        MigrationError::DestinationWriteFailure {
            entity,
            sf_id: sf_id.to_string(),
            operation,
            source,
        }
    }

    /// Failures scoped to a single record; everything else aborts the run.
    pub fn is_record_level(&self) -> bool {
        matches!(
            self,
            MigrationError::MissingReconciliationKey { .. }
                | MigrationError::AmbiguousReconciliationTarget { .. }
                | MigrationError::DestinationWriteFailure { .. }
                | MigrationError::CompanionUserFailed { .. }
        )
    }
}

impl From<CatalogError> for MigrationError {
    fn from(err: CatalogError) -> Self {
        match err {
            CatalogError::UnknownEntityType(entity) => MigrationError::UnknownEntityType(entity),
        }
    }
}

impl From<StorageError> for MigrationError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::MissingInterchangeFile { path } => {
                MigrationError::MissingInterchangeFile { path }
            }
            StorageError::Catalog(err) => err.into(),
            other => MigrationError::Storage(other),
        }
    }
}

impl From<TransformError> for MigrationError {
    fn from(err: TransformError) -> Self {
        match err {
            TransformError::Catalog(err) => err.into(),
            other => MigrationError::Transform(other),
        }
    }
}
