//! Environment defaults and the YAML credentials file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sfm_adapters::{SalesforceConfig, SugarCrmConfig};
use sfm_core::LinkPolicy;
use sfm_storage::HttpClientConfig;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("config file has no `{0}` section")]
    MissingSection(&'static str),
}

#[derive(Debug, Clone)]
pub struct MigrationConfig {
    pub csv_dir: PathBuf,
    pub log_dir: PathBuf,
    pub config_file: Option<PathBuf>,
    pub http_timeout_secs: u64,
    pub user_agent: String,
}

impl MigrationConfig {
    pub fn from_env() -> Self {
        Self {
            csv_dir: std::env::var("SFM_CSV_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("/var/sugarcrm/csv")),
            log_dir: std::env::var("SFM_LOG_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("/var/log/sugarcrm")),
            config_file: std::env::var("SFM_CONFIG_FILE").ok().map(PathBuf::from),
            http_timeout_secs: std::env::var("SFM_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            user_agent: std::env::var("SFM_USER_AGENT")
                .unwrap_or_else(|_| format!("sf-migrate/{}", env!("CARGO_PKG_VERSION"))),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
        }
    }

    /// Parsed config file, or built-in settings when none is configured.
    pub fn load_credentials(&self) -> Result<Credentials, ConfigError> {
        match &self.config_file {
            Some(path) => Credentials::load(path),
            None => Ok(Credentials::default()),
        }
    }
}

/// First record failure aborts the run, or is recorded and skipped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    #[default]
    FailFast,
    Continue,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Credentials {
    #[serde(default)]
    pub salesforce: Option<SalesforceConfig>,
    #[serde(default)]
    pub sugarcrm: Option<SugarCrmConfig>,
    #[serde(default)]
    pub migration: MigrationSettings,
}

impl Credentials {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn salesforce(&self) -> Result<&SalesforceConfig, ConfigError> {
        self.salesforce
            .as_ref()
            .ok_or(ConfigError::MissingSection("salesforce"))
    }

    pub fn sugarcrm(&self) -> Result<&SugarCrmConfig, ConfigError> {
        self.sugarcrm
            .as_ref()
            .ok_or(ConfigError::MissingSection("sugarcrm"))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MigrationSettings {
    pub failure_policy: FailurePolicy,
    pub junction_policy: LinkPolicy,
    pub incremental_window_hours: u32,
    pub user_defaults: UserDefaults,
    pub notification: NotificationSettings,
}

impl Default for MigrationSettings {
    fn default() -> Self {
        Self {
            failure_policy: FailurePolicy::default(),
            junction_policy: LinkPolicy::default(),
            incremental_window_hours: 24,
            user_defaults: UserDefaults::default(),
            notification: NotificationSettings::default(),
        }
    }
}

/// Fixed values stamped onto every companion user.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UserDefaults {
    pub login_fallback: String,
    pub contact_email: String,
    pub status: String,
}

impl Default for UserDefaults {
    fn default() -> Self {
        Self {
            login_fallback: "EMP".to_string(),
            contact_email: "mail@example.com".to_string(),
            status: "Inactive".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotificationSettings {
    pub from: String,
    pub subject: String,
    /// Defaults to `<csv_dir>/outbox`.
    pub outbox_dir: Option<PathBuf>,
}

impl Default for NotificationSettings {
    fn default() -> Self {
        Self {
            from: "agent_portal@example.com".to_string(),
            subject: "Welcome to the Agent Portal".to_string(),
            outbox_dir: None,
        }
    }
}
