//! Core domain model for the Salesforce to SugarCRM record migration.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub mod catalog;
pub mod headers;
pub mod junction;
pub mod transform;

pub use catalog::{fields_for, CatalogError, Extract, SYSTEM_FIELDS};
pub use junction::{JunctionError, JunctionKind, JunctionResolver, JunctionTable, LinkPolicy};
pub use transform::{transform, TransformError};

/// Reconciliation key carried by every transformed record.
pub const SF_ID: &str = "sf_id";
pub const NAME: &str = "name";
pub const ASSIGNED_USER_ID: &str = "assigned_user_id";

/// Closed set of record kinds handled by the migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Iso,
    Agent,
    Merchant,
    SettlementBankAccount,
    PaymentMethod,
    Email,
    SecurityGroup,
    User,
    /// ACL role attached to security groups during propagation.
    Role,
}

impl EntityType {
    pub const ALL: [EntityType; 9] = [
        EntityType::Iso,
        EntityType::Agent,
        EntityType::Merchant,
        EntityType::SettlementBankAccount,
        EntityType::PaymentMethod,
        EntityType::Email,
        EntityType::SecurityGroup,
        EntityType::User,
        EntityType::Role,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Iso => "iso",
            EntityType::Agent => "agent",
            EntityType::Merchant => "merchant",
            EntityType::SettlementBankAccount => "settlement_bank_account",
            EntityType::PaymentMethod => "payment_method",
            EntityType::Email => "email",
            EntityType::SecurityGroup => "security_group",
            EntityType::User => "user",
            EntityType::Role => "role",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Full load on the first run, delta syncs afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Full,
    Incremental,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::Full => "full",
            RunMode::Incremental => "incremental",
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Destination-side field value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldValue {
    Null,
    Text(String),
    DateTime(DateTime<Utc>),
    Date(NaiveDate),
}

impl FieldValue {
    pub fn text(value: impl Into<String>) -> Self {
        FieldValue::Text(value.into())
    }

    /// Empty interchange cells are read back as nulls.
    pub fn from_raw(value: String) -> Self {
        if value.is_empty() {
            FieldValue::Null
        } else {
            FieldValue::Text(value)
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// String form sent over the destination wire. `None` for nulls.
    pub fn to_wire_string(&self) -> Option<String> {
        match self {
            FieldValue::Null => None,
            FieldValue::Text(s) => Some(s.clone()),
            FieldValue::DateTime(dt) => Some(dt.format("%Y-%m-%d %H:%M:%S").to_string()),
            FieldValue::Date(d) => Some(d.format("%Y-%m-%d").to_string()),
        }
    }
}

pub type FieldMap = BTreeMap<String, FieldValue>;

/// One extracted source row: source field name to string value.
pub type RawRecord = BTreeMap<String, String>;

/// A source row reshaped into the destination schema, keyed by `sf_id`.
#[derive(Debug, Clone, PartialEq)]
pub struct TransformedRecord {
    entity: EntityType,
    sf_id: String,
    fields: FieldMap,
}

impl TransformedRecord {
    pub fn new(entity: EntityType, fields: FieldMap) -> Result<Self, TransformError> {
        let sf_id = fields
            .get(SF_ID)
            .and_then(FieldValue::as_text)
            .filter(|s| !s.trim().is_empty())
            .map(ToString::to_string)
            .ok_or(TransformError::MissingReconciliationKey { entity })?;
        Ok(Self {
            entity,
            sf_id,
            fields,
        })
    }

    pub fn entity(&self) -> EntityType {
        self.entity
    }

    pub fn sf_id(&self) -> &str {
        &self.sf_id
    }

    pub fn fields(&self) -> &FieldMap {
        &self.fields
    }

    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.fields.get(key)
    }

    /// Non-empty text value of `key`.
    pub fn text(&self, key: &str) -> Option<&str> {
        self.get(key)
            .and_then(FieldValue::as_text)
            .filter(|s| !s.is_empty())
    }

    pub fn name(&self) -> Option<&str> {
        self.text(NAME)
    }

    /// Field map for an update call; the destination cannot store nulls.
    pub fn fields_for_update(&self) -> FieldMap {
        self.fields
            .iter()
            .map(|(k, v)| {
                let v = if v.is_null() {
                    FieldValue::text("")
                } else {
                    v.clone()
                };
                (k.clone(), v)
            })
            .collect()
    }
}

/// Reference to a persisted destination record with a snapshot of its attributes.
#[derive(Debug, Clone, PartialEq)]
pub struct DestinationHandle {
    pub entity: EntityType,
    pub id: String,
    pub attributes: FieldMap,
}

impl DestinationHandle {
    pub fn new(entity: EntityType, id: impl Into<String>, attributes: FieldMap) -> Self {
        Self {
            entity,
            id: id.into(),
            attributes,
        }
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes
            .get(key)
            .and_then(FieldValue::as_text)
            .filter(|s| !s.is_empty())
    }

    pub fn name(&self) -> Option<&str> {
        self.attribute(NAME)
    }

    pub fn sf_id(&self) -> Option<&str> {
        self.attribute(SF_ID)
    }

    pub fn set_attribute(&mut self, key: impl Into<String>, value: FieldValue) {
        self.attributes.insert(key.into(), value);
    }

    /// `entity:id`, used in logs and reports.
    pub fn label(&self) -> String {
        format!("{}:{}", self.entity, self.id)
    }
}
