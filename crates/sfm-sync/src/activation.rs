//! Welcome mail and activation for inactive portal users.

use rand::RngCore;
use sfm_adapters::{md5_hex, Destination, Notifier, WelcomeMessage, STATUS};
use sfm_core::{FieldMap, FieldValue};
use tracing::{info, warn};

use crate::config::{NotificationSettings, UserDefaults};
use crate::error::MigrationError;
use crate::report::{ActivatedUser, ActivationReport};

pub const ACTIVE: &str = "Active";

/// Twelve lowercase hex characters.
pub fn generate_password() -> String {
    let mut bytes = [0u8; 6];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Users are only activated once their welcome message has been accepted.
pub async fn activate_inactive_users(
    destination: &dyn Destination,
    notifier: &dyn Notifier,
    users: &UserDefaults,
    settings: &NotificationSettings,
) -> Result<ActivationReport, MigrationError> {
    let mut report = ActivationReport::default();
    let inactive = destination
        .find_users_by_status(&users.status)
        .await
        .map_err(|e| MigrationError::write_failure(sfm_core::EntityType::User, &users.status, "find", e))?;
    info!(users = inactive.len(), "activating inactive users");

    for user in inactive {
        let user_name = user.attribute("user_name").unwrap_or_default().to_string();
        let to = user
            .attribute("email1")
            .unwrap_or(users.contact_email.as_str())
            .to_string();
        let password = generate_password();
        let message = WelcomeMessage::new(
            settings.from.as_str(),
            to,
            settings.subject.as_str(),
            &user_name,
            &password,
        );

        if let Err(err) = notifier.send(&message).await {
            warn!(user = %user.label(), error = %err, "welcome message not accepted; user left inactive");
            report.notification_failures += 1;
            continue;
        }

        let mut patch = FieldMap::new();
        patch.insert("user_hash".to_string(), FieldValue::text(md5_hex(&password)));
        patch.insert(STATUS.to_string(), FieldValue::text(ACTIVE));
        destination
            .update_attributes(&user, &patch)
            .await
            .map_err(|e| MigrationError::write_failure(user.entity, &user.id, "activate", e))?;
        info!(user = %user.label(), user_name = %user_name, "user activated");
        report.activated.push(ActivatedUser {
            id: user.id.clone(),
            user_name,
        });
    }
    Ok(report)
}
