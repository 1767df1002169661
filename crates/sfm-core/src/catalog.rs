//! Static field catalog shared by the export and import phases.
//!
//! Field order is the column order of the interchange files, so both sides of
//! the file boundary must read it from here.

use serde::Serialize;
use thiserror::Error;

use crate::junction::JunctionKind;
use crate::EntityType;

/// Salesforce-generated fields, already normalized. They get the `sf_` prefix on import.
pub const SYSTEM_FIELDS: &[&str] = &[
    "id",
    "isdeleted",
    "createddate",
    "createdbyid",
    "lastmodifieddate",
    "lastmodifiedbyid",
    "systemmodstamp",
    "lastactivitydate",
    "ownerid",
    "region",
    "recruiter",
];

const ISO_FIELDS: &[&str] = &[
    "Id",
    "Name",
    "IsDeleted",
    "CreatedDate",
    "CreatedById",
    "LastModifiedDate",
    "LastModifiedById",
    "SystemModstamp",
    "OwnerId",
    "Emerchantpay_ISO_ID__c",
    "Email__c",
    "Phone__c",
    "Status__c",
    "Country__c",
    "General_Conventional_Chargeback_Fee__c",
    "General_Conventional_Commission_Fee__c",
    "General_Conventional_Transaction_Fee__c",
    "General_Non_Conventional_Chargeback_Fee__c",
    "General_Non_Conventional_Commission_Fee__c",
    "General_Non_Conventional_Transaction_Fee__c",
];

const AGENT_FIELDS: &[&str] = &[
    "Id",
    "Name",
    "IsDeleted",
    "CreatedDate",
    "CreatedById",
    "LastModifiedDate",
    "LastModifiedById",
    "SystemModstamp",
    "OwnerId",
    "Emerchantpay_Agent_ID__c",
    "ISO_Company__c",
    "Email__c",
    "Phone__c",
    "Status__c",
    "Commission_Split__c",
];

const MERCHANT_FIELDS: &[&str] = &[
    "Id",
    "Name",
    "IsDeleted",
    "CreatedDate",
    "CreatedById",
    "LastModifiedDate",
    "LastModifiedById",
    "SystemModstamp",
    "LastActivityDate",
    "OwnerId",
    "Agents__c",
    "URL__c",
    "Additional_URL__c",
    "Region__c",
    "Merchant_Status__c",
    "Industry",
    "Phone",
    "BillingCountry",
];

const SETTLEMENT_BANK_ACCOUNT_FIELDS: &[&str] = &[
    "Id",
    "Name",
    "IsDeleted",
    "CreatedDate",
    "CreatedById",
    "LastModifiedDate",
    "LastModifiedById",
    "SystemModstamp",
    "ISO__c",
    "Contract__c",
    "Merchant_2__c",
    "Recruiter__c",
    "Region__c",
    "Bank_Name__c",
    "Account_Holder__c",
    "IBAN__c",
    "SWIFT__c",
    "Currency__c",
];

const PAYMENT_METHOD_FIELDS: &[&str] = &[
    "Id",
    "Name",
    "IsDeleted",
    "CreatedDate",
    "CreatedById",
    "LastModifiedDate",
    "LastModifiedById",
    "SystemModstamp",
    "Type__c",
    "Status__c",
    "Description__c",
];

const EMAIL_FIELDS: &[&str] = &[
    "Id",
    "Name",
    "IsDeleted",
    "CreatedDate",
    "CreatedById",
    "LastModifiedDate",
    "LastModifiedById",
    "SystemModstamp",
    "ccrmbasic__Contact__c",
    "ccrmbasic__To__c",
    "ccrmbasic__CC__c",
    "ccrmbasic__Subject__c",
    "ccrmbasic__Body__c",
];

const MERCHANT_TO_APM_FIELDS: &[&str] = &["Id", "Merchant__c", "Payment_Methods__c"];

const EMAIL_ASSOCIATION_FIELDS: &[&str] = &["Id", "Merchant_Name__c", "Email__c"];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CatalogError {
    #[error("entity type `{0}` is not registered in the field catalog")]
    UnknownEntityType(EntityType),
}

/// Ordered source field names for an entity type.
pub fn fields_for(entity: EntityType) -> Result<&'static [&'static str], CatalogError> {
    match entity {
        EntityType::Iso => Ok(ISO_FIELDS),
        EntityType::Agent => Ok(AGENT_FIELDS),
        EntityType::Merchant => Ok(MERCHANT_FIELDS),
        EntityType::SettlementBankAccount => Ok(SETTLEMENT_BANK_ACCOUNT_FIELDS),
        EntityType::PaymentMethod => Ok(PAYMENT_METHOD_FIELDS),
        EntityType::Email => Ok(EMAIL_FIELDS),
        EntityType::SecurityGroup | EntityType::User | EntityType::Role => {
            Err(CatalogError::UnknownEntityType(entity))
        }
    }
}

pub fn junction_fields(kind: JunctionKind) -> &'static [&'static str] {
    match kind {
        JunctionKind::MerchantPaymentMethod => MERCHANT_TO_APM_FIELDS,
        JunctionKind::MerchantEmail => EMAIL_ASSOCIATION_FIELDS,
    }
}

/// One source object extracted into its own interchange file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Extract {
    Entity(EntityType),
    Junction(JunctionKind),
}

impl Extract {
    pub const EXPORT_ORDER: [Extract; 8] = [
        Extract::Entity(EntityType::Iso),
        Extract::Entity(EntityType::Agent),
        Extract::Entity(EntityType::Merchant),
        Extract::Entity(EntityType::PaymentMethod),
        Extract::Entity(EntityType::SettlementBankAccount),
        Extract::Junction(JunctionKind::MerchantPaymentMethod),
        Extract::Entity(EntityType::Email),
        Extract::Junction(JunctionKind::MerchantEmail),
    ];

    /// Source object API name; also the interchange file stem.
    pub fn object_name(&self) -> Result<&'static str, CatalogError> {
        match self {
            Extract::Entity(entity) => match entity {
                EntityType::Iso => Ok("ISOs__c"),
                EntityType::Agent => Ok("Agent__c"),
                EntityType::Merchant => Ok("Account"),
                EntityType::SettlementBankAccount => Ok("Banks__c"),
                EntityType::PaymentMethod => Ok("Payment_Methods__c"),
                EntityType::Email => Ok("ccrmbasic__Email__c"),
                other => Err(CatalogError::UnknownEntityType(*other)),
            },
            Extract::Junction(JunctionKind::MerchantPaymentMethod) => Ok("MerchantToAPM__c"),
            Extract::Junction(JunctionKind::MerchantEmail) => Ok("Email_Association__c"),
        }
    }

    pub fn fields(&self) -> Result<&'static [&'static str], CatalogError> {
        match self {
            Extract::Entity(entity) => fields_for(*entity),
            Extract::Junction(kind) => Ok(junction_fields(*kind)),
        }
    }
}
