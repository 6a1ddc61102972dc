use serde::{Deserialize, Serialize};
use std::net::IpAddr;

use crate::cache::OutputLayout;
use crate::converter::AriaConfig;
use crate::orchestrator::OrchestratorConfig;
use crate::storage::StorageConfig;

/// Root configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub aria: AriaConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub layout: OutputLayout,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> IpAddr {
    IpAddr::from([127, 0, 0, 1])
}

fn default_port() -> u16 {
    8080
}

/// Sanitized config for API responses (secrets redacted)
#[derive(Debug, Clone, Serialize)]
pub struct SanitizedConfig {
    pub server: ServerConfig,
    pub aria: SanitizedAriaConfig,
    pub storage: SanitizedStorageConfig,
    pub orchestrator: OrchestratorConfig,
    pub layout: OutputLayout,
}

/// Sanitized aria config (password hidden)
#[derive(Debug, Clone, Serialize)]
pub struct SanitizedAriaConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executable: Option<String>,
    pub username: String,
    pub password_configured: bool,
    pub auth_settle_ms: u64,
    pub extra_args: Vec<String>,
}

/// Sanitized storage config (token hidden)
#[derive(Debug, Clone, Serialize)]
pub struct SanitizedStorageConfig {
    pub endpoint: String,
    pub bucket: String,
    pub access_token_configured: bool,
    pub folder_prefix: String,
    pub request_timeout_secs: u64,
}

impl From<&Config> for SanitizedConfig {
    fn from(config: &Config) -> Self {
        Self {
            server: config.server.clone(),
            aria: SanitizedAriaConfig {
                executable: config
                    .aria
                    .executable
                    .as_ref()
                    .map(|p| p.display().to_string()),
                username: config.aria.username.clone(),
                password_configured: !config.aria.password.is_empty(),
                auth_settle_ms: config.aria.auth_settle_ms,
                extra_args: config.aria.extra_args.clone(),
            },
            storage: SanitizedStorageConfig {
                endpoint: config.storage.endpoint.clone(),
                bucket: config.storage.bucket.clone(),
                access_token_configured: config
                    .storage
                    .access_token
                    .as_ref()
                    .is_some_and(|t| !t.is_empty()),
                folder_prefix: config.storage.folder_prefix.clone(),
                request_timeout_secs: config.storage.request_timeout_secs,
            },
            orchestrator: config.orchestrator.clone(),
            layout: config.layout.clone(),
        }
    }
}
