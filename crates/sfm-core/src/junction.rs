//! Emulated many-to-many links between merchants and payment methods / emails.
//!
//! The destination has no junction entity for these relations, so the junction
//! extracts are held in memory for the duration of a run and only queried.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::RawRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JunctionKind {
    MerchantPaymentMethod,
    MerchantEmail,
}

impl JunctionKind {
    /// Normalized column holding the merchant id.
    pub fn merchant_key(&self) -> &'static str {
        match self {
            JunctionKind::MerchantPaymentMethod => "merchant",
            JunctionKind::MerchantEmail => "merchant_name",
        }
    }

    /// Normalized column holding the linked record id.
    pub fn linked_key(&self) -> &'static str {
        match self {
            JunctionKind::MerchantPaymentMethod => "payment_methods",
            JunctionKind::MerchantEmail => "email",
        }
    }
}

/// Which links of a merchant with several entries are used.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkPolicy {
    /// Only the first pair seen for a merchant, in extract order.
    #[default]
    First,
    All,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JunctionError {
    #[error("no {kind:?} link for merchant {merchant_id}")]
    NotFound {
        kind: JunctionKind,
        merchant_id: String,
    },
}

/// Indexed multimap: merchant id to linked ids in insertion order.
#[derive(Debug, Clone)]
pub struct JunctionTable {
    kind: JunctionKind,
    links: HashMap<String, Vec<String>>,
    pairs: usize,
}

impl JunctionTable {
    pub fn new(kind: JunctionKind) -> Self {
        Self {
            kind,
            links: HashMap::new(),
            pairs: 0,
        }
    }

    /// Builds the table from normalized junction rows; rows missing either id are ignored.
    pub fn from_records(kind: JunctionKind, records: &[RawRecord]) -> Self {
        let mut table = Self::new(kind);
        for record in records {
            let merchant = record.get(kind.merchant_key()).map(|s| s.trim());
            let linked = record.get(kind.linked_key()).map(|s| s.trim());
            if let (Some(merchant), Some(linked)) = (merchant, linked) {
                if !merchant.is_empty() && !linked.is_empty() {
                    table.insert(merchant, linked);
                }
            }
        }
        table
    }

    pub fn kind(&self) -> JunctionKind {
        self.kind
    }

    pub fn insert(&mut self, merchant_id: impl Into<String>, linked_id: impl Into<String>) {
        self.links
            .entry(merchant_id.into())
            .or_default()
            .push(linked_id.into());
        self.pairs += 1;
    }

    /// First linked id recorded for `merchant_id`.
    pub fn find_linked_id(&self, merchant_id: &str) -> Result<&str, JunctionError> {
        self.linked_ids(merchant_id)
            .first()
            .map(String::as_str)
            .ok_or_else(|| JunctionError::NotFound {
                kind: self.kind,
                merchant_id: merchant_id.to_string(),
            })
    }

    pub fn linked_ids(&self, merchant_id: &str) -> &[String] {
        self.links
            .get(merchant_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn resolve(&self, merchant_id: &str, policy: LinkPolicy) -> Vec<&str> {
        let ids = self.linked_ids(merchant_id).iter().map(String::as_str);
        match policy {
            LinkPolicy::First => ids.take(1).collect(),
            LinkPolicy::All => ids.collect(),
        }
    }

    /// Number of pairs loaded, duplicates included.
    pub fn len(&self) -> usize {
        self.pairs
    }

    pub fn is_empty(&self) -> bool {
        self.pairs == 0
    }
}

/// Both junction tables plus the policy used when a merchant has several links.
#[derive(Debug, Clone)]
pub struct JunctionResolver {
    payment_methods: JunctionTable,
    emails: JunctionTable,
    policy: LinkPolicy,
}

impl Default for JunctionResolver {
    fn default() -> Self {
        Self::new(LinkPolicy::default())
    }
}

impl JunctionResolver {
    pub fn new(policy: LinkPolicy) -> Self {
        Self {
            payment_methods: JunctionTable::new(JunctionKind::MerchantPaymentMethod),
            emails: JunctionTable::new(JunctionKind::MerchantEmail),
            policy,
        }
    }

    pub fn policy(&self) -> LinkPolicy {
        self.policy
    }

    pub fn load(&mut self, table: JunctionTable) {
        match table.kind() {
            JunctionKind::MerchantPaymentMethod => self.payment_methods = table,
            JunctionKind::MerchantEmail => self.emails = table,
        }
    }

    pub fn table(&self, kind: JunctionKind) -> &JunctionTable {
        match kind {
            JunctionKind::MerchantPaymentMethod => &self.payment_methods,
            JunctionKind::MerchantEmail => &self.emails,
        }
    }

    pub fn find_linked_id(&self, kind: JunctionKind, merchant_id: &str) -> Result<&str, JunctionError> {
        self.table(kind).find_linked_id(merchant_id)
    }

    /// Linked ids for `merchant_id` under the configured policy.
    pub fn linked(&self, kind: JunctionKind, merchant_id: &str) -> Vec<&str> {
        self.table(kind).resolve(merchant_id, self.policy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apm_rows(pairs: &[(&str, &str)]) -> Vec<RawRecord> {
        pairs
            .iter()
            .map(|(m, pm)| {
                let mut r = RawRecord::new();
                r.insert("merchant".into(), m.to_string());
                r.insert("payment_methods".into(), pm.to_string());
                r
            })
            .collect()
    }

    #[test]
    fn first_match_wins_deterministically() {
        let table = JunctionTable::from_records(
            JunctionKind::MerchantPaymentMethod,
            &apm_rows(&[("M1", "PM1"), ("M2", "PM9"), ("M1", "PM2")]),
        );
        for _ in 0..3 {
            assert_eq!(table.find_linked_id("M1"), Ok("PM1"));
        }
        assert_eq!(table.len(), 3);
        assert_eq!(table.resolve("M1", LinkPolicy::All), vec!["PM1", "PM2"]);
        assert_eq!(table.resolve("M1", LinkPolicy::First), vec!["PM1"]);
    }

    #[test]
    fn unknown_merchant_is_not_found() {
        let table = JunctionTable::from_records(
            JunctionKind::MerchantPaymentMethod,
            &apm_rows(&[("M1", "PM1")]),
        );
        assert_eq!(
            table.find_linked_id("M404"),
            Err(JunctionError::NotFound {
                kind: JunctionKind::MerchantPaymentMethod,
                merchant_id: "M404".into(),
            })
        );
        assert!(table.resolve("M404", LinkPolicy::All).is_empty());
    }

    #[test]
    fn rows_without_ids_are_ignored() {
        let table = JunctionTable::from_records(
            JunctionKind::MerchantPaymentMethod,
            &apm_rows(&[("", "PM1"), ("M1", " ")]),
        );
        assert!(table.is_empty());
    }

    #[test]
    fn resolver_routes_by_kind_and_policy() {
        let mut email = RawRecord::new();
        email.insert("merchant_name".into(), "M1".into());
        email.insert("email".into(), "E1".into());
        let mut resolver = JunctionResolver::new(LinkPolicy::First);
        resolver.load(JunctionTable::from_records(JunctionKind::MerchantEmail, &[email]));
        assert_eq!(resolver.linked(JunctionKind::MerchantEmail, "M1"), vec!["E1"]);
        assert!(resolver
            .linked(JunctionKind::MerchantPaymentMethod, "M1")
            .is_empty());
    }
}
