//! Salesforce REST source: OAuth password grant plus paged SOQL queries.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Deserialize;
use serde_json::{Map, Value as JsonValue};
use sfm_core::{EntityType, Extract, RawRecord};
use sfm_storage::{ensure_success, HttpError};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::{RecordSource, SourceError};

fn default_api_version() -> String {
    "58.0".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct SalesforceConfig {
    pub login_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub username: String,
    pub password: String,
    #[serde(default = "default_api_version")]
    pub api_version: String,
}

#[derive(Debug, Clone, Deserialize)]
struct Session {
    access_token: String,
    instance_url: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryPage {
    done: bool,
    #[serde(default)]
    next_records_url: Option<String>,
    records: Vec<Map<String, JsonValue>>,
}

/// Rows of these objects are only useful when their relation field is set.
pub fn extract_filter(extract: Extract) -> Option<&'static str> {
    match extract {
        Extract::Entity(EntityType::Merchant) => Some("Agents__c != null"),
        Extract::Entity(EntityType::Email) => Some("ccrmbasic__Contact__c != null"),
        _ => None,
    }
}

pub fn soql_for(extract: Extract, since: Option<DateTime<Utc>>) -> Result<String, SourceError> {
    let object = extract.object_name()?;
    let fields = extract.fields()?.join(", ");
    let mut predicates = Vec::new();
    if let Some(filter) = extract_filter(extract) {
        predicates.push(filter.to_string());
    }
    if let Some(since) = since {
        predicates.push(format!(
            "LastModifiedDate >= {}",
            since.to_rfc3339_opts(SecondsFormat::Secs, true)
        ));
    }
    let mut query = format!("SELECT {fields} FROM {object}");
    if !predicates.is_empty() {
        query.push_str(" WHERE ");
        query.push_str(&predicates.join(" AND "));
    }
    Ok(query)
}

/// Flattens one query result row onto the catalog fields; nulls become empty strings.
pub fn record_from_json(fields: &[&str], row: &Map<String, JsonValue>) -> RawRecord {
    fields
        .iter()
        .map(|field| {
            let value = match row.get(*field) {
                None | Some(JsonValue::Null) => String::new(),
                Some(JsonValue::String(s)) => s.clone(),
                Some(other) => other.to_string(),
            };
            (field.to_string(), value)
        })
        .collect()
}

pub struct SalesforceSource {
    http: reqwest::Client,
    config: SalesforceConfig,
    session: Mutex<Option<Session>>,
}

impl SalesforceSource {
    pub fn new(http: reqwest::Client, config: SalesforceConfig) -> Self {
        Self {
            http,
            config,
            session: Mutex::new(None),
        }
    }

    async fn session(&self) -> Result<Session, SourceError> {
        let mut guard = self.session.lock().await;
        if let Some(session) = guard.as_ref() {
            return Ok(session.clone());
        }
        let url = format!(
            "{}/services/oauth2/token",
            self.config.login_url.trim_end_matches('/')
        );
        let resp = self
            .http
            .post(&url)
            .form(&[
                ("grant_type", "password"),
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
                ("username", self.config.username.as_str()),
                ("password", self.config.password.as_str()),
            ])
            .send()
            .await
            .map_err(HttpError::from)?;
        let resp = ensure_success(resp)
            .await
            .map_err(|err| SourceError::Auth(err.to_string()))?;
        let session: Session = resp
            .json()
            .await
            .map_err(|err| SourceError::Decode(err.to_string()))?;
        info!(instance = %session.instance_url, "authenticated against source");
        *guard = Some(session.clone());
        Ok(session)
    }

    async fn query(&self, extract: Extract, soql: &str) -> Result<Vec<RawRecord>, SourceError> {
        let session = self.session().await?;
        let fields = extract.fields()?;
        let base = session.instance_url.trim_end_matches('/');
        let mut url = format!("{base}/services/data/v{}/query", self.config.api_version);
        let mut first = true;
        let mut records = Vec::new();

        loop {
            let mut request = self.http.get(&url).bearer_auth(&session.access_token);
            if first {
                request = request.query(&[("q", soql)]);
            }
            let resp = request.send().await.map_err(HttpError::from)?;
            let page: QueryPage = ensure_success(resp)
                .await?
                .json()
                .await
                .map_err(|err| SourceError::Decode(err.to_string()))?;
            records.extend(page.records.iter().map(|row| record_from_json(fields, row)));
            debug!(extract = ?extract, fetched = records.len(), "fetched page");

            match (page.done, page.next_records_url) {
                (false, Some(next)) => {
                    url = format!("{base}{next}");
                    first = false;
                }
                _ => break,
            }
        }
        Ok(records)
    }
}

#[async_trait]
impl RecordSource for SalesforceSource {
    async fn fetch_all(&self, extract: Extract) -> Result<Vec<RawRecord>, SourceError> {
        let soql = soql_for(extract, None)?;
        self.query(extract, &soql).await
    }

    async fn fetch_modified_since(
        &self,
        extract: Extract,
        since: DateTime<Utc>,
    ) -> Result<Vec<RawRecord>, SourceError> {
        let soql = soql_for(extract, Some(since))?;
        self.query(extract, &soql).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use sfm_core::JunctionKind;

    #[test]
    fn merchant_query_filters_on_agent_relation() {
        let soql = soql_for(Extract::Entity(EntityType::Merchant), None).unwrap();
        assert!(soql.starts_with("SELECT Id, Name, "));
        assert!(soql.ends_with(" FROM Account WHERE Agents__c != null"));
    }

    #[test]
    fn incremental_query_adds_modification_window() {
        let since = Utc.with_ymd_and_hms(2012, 7, 6, 8, 0, 0).single().unwrap();
        let soql = soql_for(Extract::Entity(EntityType::Email), Some(since)).unwrap();
        assert!(soql.ends_with(
            "FROM ccrmbasic__Email__c WHERE ccrmbasic__Contact__c != null AND LastModifiedDate >= 2012-07-06T08:00:00Z"
        ));

        let soql = soql_for(Extract::Junction(JunctionKind::MerchantPaymentMethod), Some(since)).unwrap();
        assert_eq!(
            soql,
            "SELECT Id, Merchant__c, Payment_Methods__c FROM MerchantToAPM__c WHERE LastModifiedDate >= 2012-07-06T08:00:00Z"
        );
    }

    #[test]
    fn json_rows_flatten_to_strings() {
        let row: Map<String, JsonValue> = serde_json::from_str(
            r#"{"attributes":{"type":"ISOs__c"},"Id":"a01","Name":null,"IsDeleted":false,"Phone__c":12}"#,
        )
        .unwrap();
        let record = record_from_json(&["Id", "Name", "IsDeleted", "Phone__c", "Email__c"], &row);
        assert_eq!(record["Id"], "a01");
        assert_eq!(record["Name"], "");
        assert_eq!(record["IsDeleted"], "false");
        assert_eq!(record["Phone__c"], "12");
        assert_eq!(record["Email__c"], "");
        assert!(!record.contains_key("attributes"));
    }
}
