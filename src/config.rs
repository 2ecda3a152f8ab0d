use std::{env, fmt::Display, net::SocketAddr, str::FromStr, time::Duration};

use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{0} not set")]
    Missing(&'static str),

    #[error("invalid {key} value: {message}")]
    Invalid { key: &'static str, message: String },
}

/// Process-wide settings, read once at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub database_url: String,
    pub database_max_connections: u32,
    /// Bearer token the operator UI presents on every admin request.
    pub admin_api_key: String,
    /// Externally reachable base URL of this service; webhook targets are derived from it.
    pub public_base_url: String,
    pub records_api_base: String,
    pub records_api_key: String,
    pub records_api_version: String,
    pub records_webhook_secret: Option<String>,
    pub voice_api_base: String,
    pub voice_api_key: String,
    pub voice_webhook_secret: Option<String>,
    pub sync_max_attempts: u32,
    pub sync_retry_base: Duration,
    pub sync_queue_capacity: usize,
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        Ok(Self {
            bind_addr: try_load("BIND_ADDR", "0.0.0.0:3000")?,
            database_url: required("DATABASE_URL")?,
            database_max_connections: try_load("DATABASE_MAX_CONNECTIONS", "10")?,
            admin_api_key: required("ADMIN_API_KEY")?,
            public_base_url: required("PUBLIC_BASE_URL")?
                .trim_end_matches('/')
                .to_string(),
            records_api_base: required("RECORDS_API_BASE")?
                .trim_end_matches('/')
                .to_string(),
            records_api_key: required("RECORDS_API_KEY")?,
            records_api_version: try_load(
                "RECORDS_API_VERSION",
                "application/vnd.Nexhealth+json;version=2",
            )?,
            records_webhook_secret: optional("RECORDS_WEBHOOK_SECRET"),
            voice_api_base: required("VOICE_API_BASE")?
                .trim_end_matches('/')
                .to_string(),
            voice_api_key: required("VOICE_API_KEY")?,
            voice_webhook_secret: optional("VOICE_WEBHOOK_SECRET"),
            sync_max_attempts: try_load("SYNC_MAX_ATTEMPTS", "3")?,
            sync_retry_base: Duration::from_millis(try_load("SYNC_RETRY_BASE_MS", "500")?),
            sync_queue_capacity: try_load("SYNC_QUEUE_CAPACITY", "256")?,
        })
    }

    pub fn voice_webhook_url(&self) -> String {
        format!("{}/webhook/voice-platform", self.public_base_url)
    }

    pub fn records_webhook_url(&self) -> String {
        format!("{}/webhook/scheduling", self.public_base_url)
    }
}

fn optional(key: &'static str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn required(key: &'static str) -> Result<String, ConfigError> {
    optional(key).ok_or(ConfigError::Missing(key))
}

fn try_load<T: FromStr>(key: &'static str, default: &str) -> Result<T, ConfigError>
where
    T::Err: Display,
{
    optional(key)
        .unwrap_or_else(|| {
            info!("{key} not set, using default: {default}");
            default.to_string()
        })
        .parse()
        .map_err(|e: T::Err| ConfigError::Invalid {
            key,
            message: e.to_string(),
        })
}

#[cfg(test)]
impl Config {
    pub fn for_tests(records_api_base: &str, voice_api_base: &str) -> Self {
        Self {
            bind_addr: ([127, 0, 0, 1], 0).into(),
            database_url: "postgres://localhost/receptionist_test".to_string(),
            database_max_connections: 1,
            admin_api_key: "admin-key".to_string(),
            public_base_url: "https://receptionist.test".to_string(),
            records_api_base: records_api_base.trim_end_matches('/').to_string(),
            records_api_key: "records-key".to_string(),
            records_api_version: "application/vnd.Nexhealth+json;version=2".to_string(),
            records_webhook_secret: Some("records-secret".to_string()),
            voice_api_base: voice_api_base.trim_end_matches('/').to_string(),
            voice_api_key: "voice-key".to_string(),
            voice_webhook_secret: Some("voice-secret".to_string()),
            sync_max_attempts: 3,
            sync_retry_base: Duration::from_millis(10),
            sync_queue_capacity: 16,
        }
    }
}
