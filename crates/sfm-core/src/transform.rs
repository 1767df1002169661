//! Per-entity reshaping of source rows into the destination schema.
//!
//! Each entity type has a [`TransformRules`]: renames, then derivations, then
//! drops. The same rules apply to every row of a batch. Missing optional
//! keys never fail a row; they surface as nulls.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use thiserror::Error;
use tracing::warn;

use crate::catalog::CatalogError;
use crate::{EntityType, FieldMap, FieldValue, RawRecord, TransformedRecord};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransformError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error("{entity} record has no sf_id reconciliation key")]
    MissingReconciliationKey { entity: EntityType },
}

pub type Derive = fn(&FieldMap) -> FieldValue;

#[derive(Clone, Copy)]
pub struct Derivation {
    pub target: &'static str,
    pub derive: Derive,
}

#[derive(Clone, Copy)]
pub struct TransformRules {
    pub renames: &'static [(&'static str, &'static str)],
    pub derivations: &'static [Derivation],
    pub drops: &'static [&'static str],
}

const DATETIME_FIELDS: &[&str] = &["sf_createddate", "sf_lastmodifieddate"];
const DATE_FIELDS: &[&str] = &["sf_lastactivitydate"];

static ISO_RULES: TransformRules = TransformRules {
    renames: &[
        ("general_conventional_chargeback_fee", "general_c_chargeback_fee"),
        ("general_conventional_commission_fee", "general_c_commission_fee"),
        ("general_conventional_transaction_fee", "general_c_transaction_fee"),
        ("general_non_conventional_chargeback_fee", "general_nc_chargeback_fee"),
        ("general_non_conventional_commission_fee", "general_nc_commission_fee"),
        ("general_non_conventional_transaction_fee", "general_nc_transaction_fee"),
    ],
    derivations: &[],
    drops: &[],
};

static AGENT_RULES: TransformRules = TransformRules {
    renames: &[("iso_company", "sf_iso")],
    derivations: &[],
    drops: &[],
};

static MERCHANT_RULES: TransformRules = TransformRules {
    renames: &[("agents", "sf_agent")],
    derivations: &[
        Derivation {
            target: "url",
            derive: derive_url,
        },
        Derivation {
            target: "additional_url",
            derive: derive_additional_url,
        },
    ],
    drops: &["sf_lastactivitydate", "sf_lastmodifieddate", "sf_region"],
};

static SETTLEMENT_BANK_ACCOUNT_RULES: TransformRules = TransformRules {
    renames: &[
        ("iso", "sf_iso"),
        ("contract", "sf_contract"),
        ("merchant_2", "sf_merchant"),
    ],
    derivations: &[],
    drops: &["sf_recruiter", "sf_region"],
};

static PAYMENT_METHOD_RULES: TransformRules = TransformRules {
    renames: &[],
    derivations: &[],
    drops: &[],
};

static EMAIL_RULES: TransformRules = TransformRules {
    renames: &[
        ("ccrmbasic__to", "receiver"),
        ("ccrmbasic__cc", "cc"),
        ("ccrmbasic__subject", "subject"),
        ("ccrmbasic__contact", "sf_contact"),
    ],
    derivations: &[Derivation {
        target: "body",
        derive: derive_email_body,
    }],
    drops: &["ccrmbasic__body"],
};

pub fn rules_for(entity: EntityType) -> Result<&'static TransformRules, CatalogError> {
    match entity {
        EntityType::Iso => Ok(&ISO_RULES),
        EntityType::Agent => Ok(&AGENT_RULES),
        EntityType::Merchant => Ok(&MERCHANT_RULES),
        EntityType::SettlementBankAccount => Ok(&SETTLEMENT_BANK_ACCOUNT_RULES),
        EntityType::PaymentMethod => Ok(&PAYMENT_METHOD_RULES),
        EntityType::Email => Ok(&EMAIL_RULES),
        other => Err(CatalogError::UnknownEntityType(other)),
    }
}

impl TransformRules {
    pub fn apply(&self, mut fields: FieldMap) -> FieldMap {
        for (old, new) in self.renames {
            let value = fields.remove(*old).unwrap_or(FieldValue::Null);
            fields.insert((*new).to_string(), value);
        }
        for derivation in self.derivations {
            let value = (derivation.derive)(&fields);
            fields.insert(derivation.target.to_string(), value);
        }
        for key in self.drops {
            fields.remove(*key);
        }
        fields
    }
}

/// Reshapes one normalized, prefixed source row.
pub fn transform(entity: EntityType, raw: RawRecord) -> Result<TransformedRecord, TransformError> {
    let rules = rules_for(entity)?;
    let fields: FieldMap = raw
        .into_iter()
        .map(|(k, v)| (k, FieldValue::from_raw(v)))
        .collect();
    let mut fields = rules.apply(fields);
    coerce_dates(&mut fields);
    TransformedRecord::new(entity, fields)
}

fn text_of<'a>(fields: &'a FieldMap, key: &str) -> Option<&'a str> {
    fields.get(key).and_then(FieldValue::as_text)
}

fn derive_url(fields: &FieldMap) -> FieldValue {
    FieldValue::text(strip_html(text_of(fields, "url").unwrap_or_default()))
}

fn derive_additional_url(fields: &FieldMap) -> FieldValue {
    FieldValue::text(strip_html(
        text_of(fields, "additional_url").unwrap_or_default(),
    ))
}

fn derive_email_body(fields: &FieldMap) -> FieldValue {
    match text_of(fields, "ccrmbasic__body") {
        Some(body) => FieldValue::text(escape_quotes(body)),
        None => FieldValue::Null,
    }
}

/// Removes markup tags and the line breaks that open each line. Line starts are
/// those of the input; an unterminated `<` is kept.
pub fn strip_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut pos = 0;
    while pos < input.len() {
        let rest = &input[pos..];
        if rest.starts_with('<') {
            if let Some(close) = rest.find('>') {
                pos += close + 1;
                continue;
            }
        }
        if pos == 0 || input.as_bytes()[pos - 1] == b'\n' {
            let breaks = rest.len() - rest.trim_start_matches(['\n', '\r']).len();
            if breaks > 0 {
                pos += breaks;
                continue;
            }
        }
        let Some(ch) = rest.chars().next() else {
            break;
        };
        out.push(ch);
        pos += ch.len_utf8();
    }
    out
}

/// Replaces quote characters with their entity form.
pub fn escape_quotes(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '\'' => out.push_str("&apos;"),
            '"' => out.push_str("&quot;"),
            other => out.push(other),
        }
    }
    out
}

fn coerce_dates(fields: &mut FieldMap) {
    for key in DATETIME_FIELDS {
        if let Some(value) = fields.get_mut(*key) {
            if let Some(parsed) = value.as_text().and_then(parse_datetime) {
                *value = FieldValue::DateTime(parsed);
            } else if !value.is_null() {
                warn!(field = *key, "unparseable datetime kept as text");
            }
        }
    }
    for key in DATE_FIELDS {
        if let Some(value) = fields.get_mut(*key) {
            if let Some(parsed) = value.as_text().and_then(parse_date) {
                *value = FieldValue::Date(parsed);
            } else if !value.is_null() {
                warn!(field = *key, "unparseable date kept as text");
            }
        }
    }
}

/// Accepts RFC 3339, Salesforce's `+0000` offset form, and plain `Y-m-d H:M:S`.
pub fn parse_datetime(input: &str) -> Option<DateTime<Utc>> {
    let input = input.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(input) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_str(input, "%Y-%m-%dT%H:%M:%S%.f%z") {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(input, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|dt| dt.and_utc())
}

pub fn parse_date(input: &str) -> Option<NaiveDate> {
    let input = input.trim();
    NaiveDate::parse_from_str(input, "%Y-%m-%d")
        .ok()
        .or_else(|| parse_datetime(input).map(|dt| dt.date_naive()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SF_ID;

    fn raw(pairs: &[(&str, &str)]) -> RawRecord {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn iso_fee_schema_is_split_into_discrete_fields() {
        let record = transform(
            EntityType::Iso,
            raw(&[
                (SF_ID, "I1"),
                ("name", "Acme"),
                ("general_conventional_chargeback_fee", "5"),
                ("general_non_conventional_chargeback_fee", "7"),
            ]),
        )
        .unwrap();
        assert_eq!(record.text("general_c_chargeback_fee"), Some("5"));
        assert_eq!(record.text("general_nc_chargeback_fee"), Some("7"));
        assert!(record.get("general_conventional_chargeback_fee").is_none());
        assert!(record.get("general_non_conventional_chargeback_fee").is_none());
        // absent source fee columns still produce the destination keys
        assert!(record.get("general_c_commission_fee").unwrap().is_null());
    }

    #[test]
    fn email_body_keeps_no_raw_quotes() {
        let record = transform(
            EntityType::Email,
            raw(&[
                (SF_ID, "E1"),
                ("ccrmbasic__to", "ops@example.com"),
                ("ccrmbasic__body", r#"O'Brien says "hi""#),
            ]),
        )
        .unwrap();
        let body = record.text("body").unwrap();
        assert!(!body.contains('\''));
        assert!(!body.contains('"'));
        assert_eq!(body, "O&apos;Brien says &quot;hi&quot;");
        assert_eq!(record.text("receiver"), Some("ops@example.com"));
        assert!(record.get("ccrmbasic__body").is_none());
    }

    #[test]
    fn email_without_body_yields_null_body() {
        let record = transform(EntityType::Email, raw(&[(SF_ID, "E2")])).unwrap();
        assert!(record.get("body").unwrap().is_null());
    }

    #[test]
    fn merchant_urls_are_stripped_and_obsolete_keys_dropped() {
        let record = transform(
            EntityType::Merchant,
            raw(&[
                (SF_ID, "M1"),
                ("agents", "A1"),
                ("url", "\r\n<a href=\"x\">shop.example.com</a>"),
                ("sf_region", "EU"),
                ("sf_lastactivitydate", "2012-07-01"),
                ("sf_lastmodifieddate", "2012-07-07T10:00:00.000+0000"),
            ]),
        )
        .unwrap();
        assert_eq!(record.text("url"), Some("shop.example.com"));
        assert_eq!(record.get("additional_url"), Some(&FieldValue::text("")));
        assert_eq!(record.text("sf_agent"), Some("A1"));
        assert!(record.get("agents").is_none());
        assert!(record.get("sf_region").is_none());
        assert!(record.get("sf_lastactivitydate").is_none());
        assert!(record.get("sf_lastmodifieddate").is_none());
    }

    #[test]
    fn bank_account_relations_are_renamed() {
        let record = transform(
            EntityType::SettlementBankAccount,
            raw(&[
                (SF_ID, "B1"),
                ("merchant_2", "M1"),
                ("iso", "I1"),
                ("sf_recruiter", "R"),
            ]),
        )
        .unwrap();
        assert_eq!(record.text("sf_merchant"), Some("M1"));
        assert_eq!(record.text("sf_iso"), Some("I1"));
        assert!(record.get("sf_recruiter").is_none());
        assert!(record.get("merchant_2").is_none());
    }

    #[test]
    fn system_dates_are_coerced() {
        let record = transform(
            EntityType::Agent,
            raw(&[
                (SF_ID, "A1"),
                ("sf_createddate", "2012-07-07T10:00:00.000+0000"),
                ("sf_lastmodifieddate", "not a date"),
            ]),
        )
        .unwrap();
        assert!(matches!(
            record.get("sf_createddate"),
            Some(FieldValue::DateTime(_))
        ));
        assert_eq!(record.text("sf_lastmodifieddate"), Some("not a date"));
    }

    #[test]
    fn unknown_types_and_missing_keys_fail() {
        assert!(matches!(
            transform(EntityType::User, raw(&[(SF_ID, "U1")])),
            Err(TransformError::Catalog(CatalogError::UnknownEntityType(
                EntityType::User
            )))
        ));
        assert!(matches!(
            transform(EntityType::Agent, raw(&[("name", "x")])),
            Err(TransformError::MissingReconciliationKey { .. })
        ));
    }

    #[test]
    fn strip_html_keeps_unterminated_markup() {
        assert_eq!(strip_html("a < b"), "a < b");
        assert_eq!(strip_html("<b>bold</b> text"), "bold text");
    }

    #[test]
    fn strip_html_drops_line_breaks_at_every_line_start() {
        assert_eq!(
            strip_html("\r\nhttp://a.example\n\n\r\nhttp://b.example"),
            "http://a.example\nhttp://b.example"
        );
        assert_eq!(strip_html("<p>one</p>\n\n<p>two</p>"), "one\ntwo");
        assert_eq!(strip_html("a\r\n\r\nb"), "a\r\nb");
    }
}
