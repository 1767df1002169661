//! Collaborator contracts for the migration plus their implementations.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sfm_core::{CatalogError, DestinationHandle, EntityType, Extract, FieldMap, RawRecord, NAME};
use sfm_storage::HttpError;
use thiserror::Error;

pub mod memory;
pub mod outbox;
pub mod salesforce;
pub mod sugarcrm;

pub use memory::{DestinationCall, InMemoryDestination};
pub use outbox::OutboxNotifier;
pub use salesforce::{SalesforceConfig, SalesforceSource};
pub use sugarcrm::{md5_hex, SugarCrmConfig, SugarCrmDestination};

/// Destination attribute holding a user's display name.
pub const LAST_NAME: &str = "last_name";
pub const STATUS: &str = "status";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Http(#[from] HttpError),
    #[error("source authentication failed: {0}")]
    Auth(String),
    #[error("unexpected source response: {0}")]
    Decode(String),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

#[derive(Debug, Error)]
pub enum DestinationError {
    #[error(transparent)]
    Http(#[from] HttpError),
    #[error("destination login failed: {0}")]
    Login(String),
    #[error("destination rejected {operation} on {entity}: {message}")]
    Rejected {
        entity: EntityType,
        operation: &'static str,
        message: String,
    },
    #[error("{entity} record {id} does not exist")]
    UnknownRecord { entity: EntityType, id: String },
    #[error("unexpected destination response: {0}")]
    Decode(String),
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("failed to serialize message: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Delivery(#[from] anyhow::Error),
}

/// Paging record fetch over the source CRM.
#[async_trait]
pub trait RecordSource: Send + Sync {
    async fn fetch_all(&self, extract: Extract) -> Result<Vec<RawRecord>, SourceError>;

    async fn fetch_modified_since(
        &self,
        extract: Extract,
        since: DateTime<Utc>,
    ) -> Result<Vec<RawRecord>, SourceError>;
}

/// Typed create/update/find/associate primitives of the destination CRM.
#[async_trait]
pub trait Destination: Send + Sync {
    async fn create(
        &self,
        entity: EntityType,
        fields: &FieldMap,
    ) -> Result<DestinationHandle, DestinationError>;

    /// Merges `fields` into the stored record and returns the refreshed handle.
    async fn update_attributes(
        &self,
        handle: &DestinationHandle,
        fields: &FieldMap,
    ) -> Result<DestinationHandle, DestinationError>;

    /// Records of `entity` whose `attribute` equals `value`, in storage order.
    async fn find_by(
        &self,
        entity: EntityType,
        attribute: &str,
        value: &str,
    ) -> Result<Vec<DestinationHandle>, DestinationError>;

    async fn associate(
        &self,
        left: &DestinationHandle,
        right: &DestinationHandle,
    ) -> Result<(), DestinationError>;

    /// Records of type `target` associated with `handle`.
    async fn related(
        &self,
        handle: &DestinationHandle,
        target: EntityType,
    ) -> Result<Vec<DestinationHandle>, DestinationError>;

    async fn find_security_group_by_name(
        &self,
        name: &str,
    ) -> Result<Option<DestinationHandle>, DestinationError> {
        Ok(self
            .find_by(EntityType::SecurityGroup, NAME, name)
            .await?
            .into_iter()
            .next())
    }

    async fn find_users_by_status(
        &self,
        status: &str,
    ) -> Result<Vec<DestinationHandle>, DestinationError> {
        self.find_by(EntityType::User, STATUS, status).await
    }

    async fn find_user_by_last_name(
        &self,
        last_name: &str,
    ) -> Result<Option<DestinationHandle>, DestinationError> {
        Ok(self
            .find_by(EntityType::User, LAST_NAME, last_name)
            .await?
            .into_iter()
            .next())
    }

    async fn find_role_by_name(
        &self,
        name: &str,
    ) -> Result<Option<DestinationHandle>, DestinationError> {
        Ok(self
            .find_by(EntityType::Role, NAME, name)
            .await?
            .into_iter()
            .next())
    }
}

#[async_trait]
impl<T: Destination + ?Sized> Destination for Arc<T> {
    async fn create(
        &self,
        entity: EntityType,
        fields: &FieldMap,
    ) -> Result<DestinationHandle, DestinationError> {
        (**self).create(entity, fields).await
    }

    async fn update_attributes(
        &self,
        handle: &DestinationHandle,
        fields: &FieldMap,
    ) -> Result<DestinationHandle, DestinationError> {
        (**self).update_attributes(handle, fields).await
    }

    async fn find_by(
        &self,
        entity: EntityType,
        attribute: &str,
        value: &str,
    ) -> Result<Vec<DestinationHandle>, DestinationError> {
        (**self).find_by(entity, attribute, value).await
    }

    async fn associate(
        &self,
        left: &DestinationHandle,
        right: &DestinationHandle,
    ) -> Result<(), DestinationError> {
        (**self).associate(left, right).await
    }

    async fn related(
        &self,
        handle: &DestinationHandle,
        target: EntityType,
    ) -> Result<Vec<DestinationHandle>, DestinationError> {
        (**self).related(handle, target).await
    }
}

/// Welcome message handed to a [`Notifier`] when a portal user is activated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WelcomeMessage {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub user_name: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

impl WelcomeMessage {
    pub fn new(
        from: impl Into<String>,
        to: impl Into<String>,
        subject: impl Into<String>,
        user_name: &str,
        password: &str,
    ) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            subject: subject.into(),
            user_name: user_name.to_string(),
            body: format!("Your username is {user_name} and your password is {password}"),
            created_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Returns once the message has been accepted for delivery.
    async fn send(&self, message: &WelcomeMessage) -> Result<(), NotifyError>;
}
