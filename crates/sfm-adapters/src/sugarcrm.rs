//! SugarCRM v4.1 REST destination.
//!
//! Every call is a form POST to `service/v4_1/rest.php` carrying the method
//! name and a positional JSON `rest_data` array. Custom modules are prefixed
//! `emp_`; relationship links are named after the lowercased target module.

use async_trait::async_trait;
use md5::{Digest, Md5};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use sfm_core::{DestinationHandle, EntityType, FieldMap, FieldValue};
use sfm_storage::{ensure_success, HttpError};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::{Destination, DestinationError};

const PAGE_SIZE: u64 = 200;
const APPLICATION: &str = "sf-migrate";

#[derive(Debug, Clone, Deserialize)]
pub struct SugarCrmConfig {
    pub url: String,
    pub username: String,
    pub password: String,
}

/// Lowercase hex MD5, the digest SugarCRM expects for passwords.
pub fn md5_hex(input: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

pub fn module_name(entity: EntityType) -> &'static str {
    match entity {
        EntityType::Iso => "emp_ISO",
        EntityType::Agent => "emp_Agent",
        EntityType::Merchant => "emp_Merchant",
        EntityType::SettlementBankAccount => "emp_SettlementBankAccount",
        EntityType::PaymentMethod => "emp_PaymentMethod",
        EntityType::Email => "emp_Email",
        EntityType::SecurityGroup => "SecurityGroups",
        EntityType::User => "Users",
        EntityType::Role => "ACLRoles",
    }
}

pub fn link_name(entity: EntityType) -> String {
    module_name(entity).to_lowercase()
}

/// `get_entry_list` filter; single quotes cannot be escaped on this transport.
pub fn equality_query(entity: EntityType, attribute: &str, value: &str) -> String {
    format!(
        "{}.{} = '{}'",
        link_name(entity),
        attribute,
        value.replace('\'', "")
    )
}

fn name_value_list(fields: &FieldMap, id: Option<&str>) -> JsonValue {
    let mut entries: Vec<JsonValue> = fields
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_wire_string()
                .map(|value| json!({ "name": name, "value": value }))
        })
        .collect();
    if let Some(id) = id {
        entries.push(json!({ "name": "id", "value": id }));
    }
    JsonValue::Array(entries)
}

/// Parses one `entry_list` element into a handle.
pub fn handle_from_entry(entity: EntityType, entry: &JsonValue) -> Option<DestinationHandle> {
    let id = entry.get("id")?.as_str()?;
    let mut attributes = FieldMap::new();
    if let Some(values) = entry.get("name_value_list").and_then(JsonValue::as_object) {
        for (key, pair) in values {
            let value = pair
                .get("value")
                .and_then(JsonValue::as_str)
                .map(|s| FieldValue::from_raw(s.to_string()))
                .unwrap_or(FieldValue::Null);
            attributes.insert(key.clone(), value);
        }
    }
    Some(DestinationHandle::new(entity, id, attributes))
}

/// Sugar reports failures as `{"name": .., "number": .., "description": ..}` with a 200 status.
/// Counters in `get_entry_list` replies arrive as numbers or numeric strings.
fn counter(body: &JsonValue, key: &str) -> Option<u64> {
    match body.get(key)? {
        JsonValue::Number(n) => n.as_u64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Offset of the next `get_entry_list` page, or `None` once `total_count` is reached.
/// Without a total, a short page ends the listing.
fn next_page_offset(body: &JsonValue, offset: u64, fetched: u64) -> Option<u64> {
    if fetched == 0 {
        return None;
    }
    let next = counter(body, "next_offset").unwrap_or(offset + fetched);
    if next <= offset {
        return None;
    }
    match counter(body, "total_count") {
        Some(total) => (next < total).then_some(next),
        None => (fetched >= PAGE_SIZE).then_some(next),
    }
}

fn check_fault(body: &JsonValue) -> Option<String> {
    let number = body.get("number")?;
    let description = body
        .get("description")
        .and_then(JsonValue::as_str)
        .unwrap_or_default();
    Some(format!("{number}: {description}"))
}

pub struct SugarCrmDestination {
    http: reqwest::Client,
    config: SugarCrmConfig,
    session: Mutex<Option<String>>,
}

impl SugarCrmDestination {
    pub fn new(http: reqwest::Client, config: SugarCrmConfig) -> Self {
        Self {
            http,
            config,
            session: Mutex::new(None),
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/service/v4_1/rest.php", self.config.url.trim_end_matches('/'))
    }

    async fn post(&self, method: &str, rest_data: JsonValue) -> Result<JsonValue, DestinationError> {
        let rest_data = rest_data.to_string();
        let resp = self
            .http
            .post(self.endpoint())
            .form(&[
                ("method", method),
                ("input_type", "JSON"),
                ("response_type", "JSON"),
                ("rest_data", rest_data.as_str()),
            ])
            .send()
            .await
            .map_err(HttpError::from)?;
        let body: JsonValue = ensure_success(resp)
            .await?
            .json()
            .await
            .map_err(|err| DestinationError::Decode(format!("{method}: {err}")))?;
        Ok(body)
    }

    async fn session_id(&self) -> Result<String, DestinationError> {
        let mut guard = self.session.lock().await;
        if let Some(id) = guard.as_ref() {
            return Ok(id.clone());
        }
        let body = self
            .post(
                "login",
                json!([
                    {
                        "user_name": self.config.username,
                        "password": md5_hex(&self.config.password),
                    },
                    APPLICATION,
                    [],
                ]),
            )
            .await?;
        if let Some(fault) = check_fault(&body) {
            return Err(DestinationError::Login(fault));
        }
        let id = body
            .get("id")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| DestinationError::Login("no session id in response".to_string()))?
            .to_string();
        info!(url = %self.config.url, "logged in to destination");
        *guard = Some(id.clone());
        Ok(id)
    }

    async fn call(
        &self,
        entity: EntityType,
        operation: &'static str,
        method: &str,
        args: Vec<JsonValue>,
    ) -> Result<JsonValue, DestinationError> {
        let session = self.session_id().await?;
        let mut rest_data = vec![JsonValue::String(session)];
        rest_data.extend(args);
        let body = self.post(method, JsonValue::Array(rest_data)).await?;
        if let Some(message) = check_fault(&body) {
            return Err(DestinationError::Rejected {
                entity,
                operation,
                message,
            });
        }
        Ok(body)
    }

    async fn set_entry(
        &self,
        entity: EntityType,
        operation: &'static str,
        fields: &FieldMap,
        id: Option<&str>,
    ) -> Result<String, DestinationError> {
        let body = self
            .call(
                entity,
                operation,
                "set_entry",
                vec![
                    json!(module_name(entity)),
                    name_value_list(fields, id),
                ],
            )
            .await?;
        body.get("id")
            .and_then(JsonValue::as_str)
            .map(ToString::to_string)
            .ok_or_else(|| DestinationError::Decode(format!("set_entry on {entity} returned no id")))
    }

    fn entries(entity: EntityType, body: &JsonValue) -> Vec<DestinationHandle> {
        body.get("entry_list")
            .and_then(JsonValue::as_array)
            .map(|list| {
                list.iter()
                    .filter_map(|entry| handle_from_entry(entity, entry))
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl Destination for SugarCrmDestination {
    async fn create(
        &self,
        entity: EntityType,
        fields: &FieldMap,
    ) -> Result<DestinationHandle, DestinationError> {
        let id = self.set_entry(entity, "create", fields, None).await?;
        debug!(entity = %entity, id = %id, "created");
        Ok(DestinationHandle::new(entity, id, fields.clone()))
    }

    async fn update_attributes(
        &self,
        handle: &DestinationHandle,
        fields: &FieldMap,
    ) -> Result<DestinationHandle, DestinationError> {
        self.set_entry(handle.entity, "update", fields, Some(handle.id.as_str()))
            .await?;
        let mut updated = handle.clone();
        for (key, value) in fields {
            updated.set_attribute(key.clone(), value.clone());
        }
        Ok(updated)
    }

    async fn find_by(
        &self,
        entity: EntityType,
        attribute: &str,
        value: &str,
    ) -> Result<Vec<DestinationHandle>, DestinationError> {
        let query = equality_query(entity, attribute, value);
        let mut offset = 0u64;
        let mut found = Vec::new();
        loop {
            let body = self
                .call(
                    entity,
                    "find",
                    "get_entry_list",
                    vec![
                        json!(module_name(entity)),
                        json!(query),
                        json!(""),
                        json!(offset),
                        json!([]),
                        json!([]),
                        json!(PAGE_SIZE),
                        json!(0),
                        json!(false),
                    ],
                )
                .await?;
            let page = Self::entries(entity, &body);
            let fetched = page.len() as u64;
            found.extend(page);
            match next_page_offset(&body, offset, fetched) {
                Some(next) => offset = next,
                None => break,
            }
        }
        Ok(found)
    }

    async fn associate(
        &self,
        left: &DestinationHandle,
        right: &DestinationHandle,
    ) -> Result<(), DestinationError> {
        let body = self
            .call(
                left.entity,
                "associate",
                "set_relationship",
                vec![
                    json!(module_name(left.entity)),
                    json!(left.id),
                    json!(link_name(right.entity)),
                    json!([right.id]),
                    json!([]),
                    json!(0),
                ],
            )
            .await?;
        let failed = body.get("failed").and_then(JsonValue::as_u64).unwrap_or(0);
        if failed > 0 {
            return Err(DestinationError::Rejected {
                entity: left.entity,
                operation: "associate",
                message: format!("relationship {} -> {} not created", left.label(), right.label()),
            });
        }
        Ok(())
    }

    async fn related(
        &self,
        handle: &DestinationHandle,
        target: EntityType,
    ) -> Result<Vec<DestinationHandle>, DestinationError> {
        let body = self
            .call(
                handle.entity,
                "related",
                "get_relationships",
                vec![
                    json!(module_name(handle.entity)),
                    json!(handle.id),
                    json!(link_name(target)),
                    json!(""),
                    json!([]),
                    json!([]),
                    json!(0),
                ],
            )
            .await?;
        Ok(Self::entries(target, &body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_digest_is_lowercase_md5() {
        assert_eq!(md5_hex("password"), "5f4dcc3b5aa765d61d8327deb882cf99");
    }

    #[test]
    fn queries_target_the_module_table_without_quotes() {
        assert_eq!(
            equality_query(EntityType::SecurityGroup, "name", "O'Hara Ltd"),
            "securitygroups.name = 'OHara Ltd'"
        );
        assert_eq!(
            equality_query(EntityType::Iso, "sf_id", "a07I1"),
            "emp_iso.sf_id = 'a07I1'"
        );
    }

    #[test]
    fn name_value_lists_skip_nulls_and_carry_the_id() {
        let mut fields = FieldMap::new();
        fields.insert("name".into(), FieldValue::text("Acme"));
        fields.insert("phone".into(), FieldValue::Null);
        let list = name_value_list(&fields, Some("abc"));
        assert_eq!(
            list,
            json!([{"name": "name", "value": "Acme"}, {"name": "id", "value": "abc"}])
        );
    }

    #[test]
    fn entries_parse_into_handles() {
        let entry = json!({
            "id": "u-1",
            "module_name": "Users",
            "name_value_list": {
                "last_name": {"name": "last_name", "value": "Acme"},
                "status": {"name": "status", "value": ""}
            }
        });
        let handle = handle_from_entry(EntityType::User, &entry).unwrap();
        assert_eq!(handle.id, "u-1");
        assert_eq!(handle.attribute("last_name"), Some("Acme"));
        assert_eq!(handle.attributes.get("status"), Some(&FieldValue::Null));
        assert!(handle_from_entry(EntityType::User, &json!({"module_name": "Users"})).is_none());
    }

    #[test]
    fn faults_are_detected() {
        assert_eq!(
            check_fault(&json!({"name": "Invalid Login", "number": 10, "description": "Login attempt failed"})),
            Some("10: Login attempt failed".to_string())
        );
        assert!(check_fault(&json!({"id": "s1"})).is_none());
    }

    #[test]
    fn paging_follows_total_count_past_short_pages() {
        let capped = json!({"result_count": 100, "total_count": "250", "next_offset": 100});
        assert_eq!(next_page_offset(&capped, 0, 100), Some(100));

        let last = json!({"result_count": 50, "total_count": 250, "next_offset": 250});
        assert_eq!(next_page_offset(&last, 200, 50), None);

        let empty = json!({"result_count": 0, "total_count": "250", "next_offset": 250});
        assert_eq!(next_page_offset(&empty, 250, 0), None);
    }

    #[test]
    fn paging_without_total_stops_on_a_short_page() {
        assert_eq!(next_page_offset(&json!({}), 0, PAGE_SIZE), Some(PAGE_SIZE));
        assert_eq!(next_page_offset(&json!({}), 0, 10), None);
        assert_eq!(next_page_offset(&json!({"next_offset": 0}), 0, PAGE_SIZE), None);
    }
}
