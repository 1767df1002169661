//! Source header normalization.

use crate::RawRecord;

/// Suffix Salesforce appends to custom field names.
pub const CUSTOM_FIELD_SUFFIX: &str = "__c";

/// Namespace prefix for Salesforce-generated fields on the destination side.
pub const SYSTEM_PREFIX: &str = "sf_";

/// `ISO_Company__c` -> `iso_company`, `LastModifiedDate` -> `lastmodifieddate`.
pub fn normalize(raw_header: &str) -> String {
    raw_header
        .strip_suffix(CUSTOM_FIELD_SUFFIX)
        .unwrap_or(raw_header)
        .to_lowercase()
}

pub fn normalize_all<S: AsRef<str>>(headers: &[S]) -> Vec<String> {
    headers.iter().map(|h| normalize(h.as_ref())).collect()
}

/// Renames every system field present in `record` to `sf_<field>`.
///
/// Prefixed keys are never members of `system_fields`, so a second pass is a no-op.
pub fn apply_system_prefix(mut record: RawRecord, system_fields: &[&str]) -> RawRecord {
    for field in system_fields {
        if let Some(value) = record.remove(*field) {
            record.insert(format!("{SYSTEM_PREFIX}{field}"), value);
        }
    }
    record
}

/// Zips a normalized header row with one data row. Short rows yield empty values.
pub fn assemble(headers: &[String], row: Vec<String>) -> RawRecord {
    let mut values = row.into_iter();
    headers
        .iter()
        .map(|h| (h.clone(), values.next().unwrap_or_default()))
        .collect()
}
