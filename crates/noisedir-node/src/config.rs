//! Configuration management.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use noisedir_crypto::keypair::{KeyPair, KeyPairError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::engine::CountryPolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid server private key: {0}")]
    Key(#[from] KeyPairError),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Server configuration. Every field corresponds to a documented external
/// configuration option (environment variable or TOML key).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub database_path: PathBuf,

    /// 64-character hex X25519 private scalar for the server's long-term key.
    pub server_private_key: String,

    /// Maximum age a pending update request may reach before it is treated
    /// as expired, in seconds. Default: 3 days.
    pub pending_request_max_age_seconds: u64,

    pub require_authorization: bool,
    pub accounting_url: String,
    pub accounting_apisecret: String,

    /// When non-empty, only these calling codes (as plain integers) may
    /// register a phone number (allow-list mode).
    pub sms_allowed_countries: Vec<u16>,
    /// When `sms_allowed_countries` is empty, these calling codes are
    /// rejected and everything else is accepted (deny-list mode, the default).
    pub sms_blacklisted_countries: Vec<u16>,

    /// Bypasses challenge dispatch entirely; every item is treated as
    /// already verified. Used in tests and controlled deployments.
    pub shallow_verification: bool,

    pub default_from_email: String,
    pub sendsms_default_from_phone: String,

    /// Scheme+host used to build absolute confirm/deny/review URLs in
    /// dispatched challenges. Ambient addition: the original source ran
    /// behind a configured WSGI host, which this standalone binary has no
    /// equivalent of.
    pub public_base_url: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".parse().unwrap(),
            database_path: PathBuf::from("noisedir.db"),
            server_private_key: String::new(),
            pending_request_max_age_seconds: 3 * 24 * 60 * 60,
            require_authorization: false,
            accounting_url: "http://localhost:1234".to_string(),
            accounting_apisecret: String::new(),
            sms_allowed_countries: Vec::new(),
            sms_blacklisted_countries: default_blacklisted_countries(),
            shallow_verification: false,
            default_from_email: "no-reply@example.com".to_string(),
            sendsms_default_from_phone: String::new(),
            public_base_url: "http://localhost:8080".to_string(),
        }
    }
}

/// Deny-list of calling codes, taken from the original deployment's
/// `SMS_BLACKLISTED_COUNTRIES` setting.
fn default_blacklisted_countries() -> Vec<u16> {
    vec![
        53, 98, 850, 249, 963, 33, 20, 374, 994, 257, 225, 291, 224, 245, 964, 967, 242, 961, 231,
        218, 95, 232, 263, 252, 211, 216, 380, 375, 236,
    ]
}

impl ServerConfig {
    /// Load configuration from environment variables, then an optional TOML
    /// overlay named by `NOISEDIR_CONFIG`.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("NOISEDIR_LISTEN_ADDR") {
            config.listen_addr = addr
                .parse()
                .map_err(|e| ConfigError::Invalid(format!("invalid listen_addr: {e}")))?;
        }
        if let Ok(path) = std::env::var("NOISEDIR_DATABASE_PATH") {
            config.database_path = PathBuf::from(path);
        }
        if let Ok(key) = std::env::var("NOISEDIR_SERVER_PRIVATE_KEY") {
            config.server_private_key = key;
        }
        if let Ok(secs) = std::env::var("NOISEDIR_PENDING_REQUEST_MAX_AGE_SECONDS") {
            config.pending_request_max_age_seconds = secs
                .parse()
                .map_err(|_| ConfigError::Invalid("invalid pending_request_max_age_seconds".into()))?;
        }
        if let Ok(flag) = std::env::var("NOISEDIR_REQUIRE_AUTHORIZATION") {
            config.require_authorization = flag.parse().unwrap_or(false);
        }
        if let Ok(url) = std::env::var("NOISEDIR_ACCOUNTING_URL") {
            config.accounting_url = url;
        }
        if let Ok(secret) = std::env::var("NOISEDIR_ACCOUNTING_APISECRET") {
            config.accounting_apisecret = secret;
        }
        if let Ok(flag) = std::env::var("NOISEDIR_FACET_SHALLOW_VERIFICATION") {
            config.shallow_verification = flag.parse().unwrap_or(false);
        }
        if let Ok(email) = std::env::var("NOISEDIR_DEFAULT_FROM_EMAIL") {
            config.default_from_email = email;
        }
        if let Ok(phone) = std::env::var("NOISEDIR_SENDSMS_DEFAULT_FROM_PHONE") {
            config.sendsms_default_from_phone = phone;
        }
        if let Ok(url) = std::env::var("NOISEDIR_PUBLIC_BASE_URL") {
            config.public_base_url = url;
        }

        if let Ok(config_path) = std::env::var("NOISEDIR_CONFIG") {
            config.load_from_toml(&config_path)?;
        }

        config.validate()?;
        Ok(config)
    }

    fn load_from_toml(&mut self, path: &str) -> Result<(), ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let toml_config: toml::Value = toml::from_str(&content)?;

        if let Some(addr) = toml_config.get("listen_addr").and_then(|v| v.as_str()) {
            self.listen_addr = addr
                .parse()
                .map_err(|e| ConfigError::Invalid(format!("invalid listen_addr in TOML: {e}")))?;
        }
        if let Some(path) = toml_config.get("database_path").and_then(|v| v.as_str()) {
            self.database_path = PathBuf::from(path);
        }
        if let Some(key) = toml_config.get("server_private_key").and_then(|v| v.as_str()) {
            self.server_private_key = key.to_string();
        }
        if let Some(secs) = toml_config
            .get("pending_request_max_age_seconds")
            .and_then(|v| v.as_integer())
        {
            self.pending_request_max_age_seconds = secs as u64;
        }
        if let Some(flag) = toml_config.get("require_authorization").and_then(|v| v.as_bool()) {
            self.require_authorization = flag;
        }
        if let Some(url) = toml_config.get("accounting_url").and_then(|v| v.as_str()) {
            self.accounting_url = url.to_string();
        }
        if let Some(secret) = toml_config.get("accounting_apisecret").and_then(|v| v.as_str()) {
            self.accounting_apisecret = secret.to_string();
        }
        if let Some(list) = toml_config.get("sms_allowed_countries").and_then(|v| v.as_array()) {
            self.sms_allowed_countries = list
                .iter()
                .filter_map(|v| v.as_integer().map(|n| n as u16))
                .collect();
        }
        if let Some(list) = toml_config
            .get("sms_blacklisted_countries")
            .and_then(|v| v.as_array())
        {
            self.sms_blacklisted_countries = list
                .iter()
                .filter_map(|v| v.as_integer().map(|n| n as u16))
                .collect();
        }
        if let Some(flag) = toml_config
            .get("shallow_verification")
            .and_then(|v| v.as_bool())
        {
            self.shallow_verification = flag;
        }
        if let Some(email) = toml_config.get("default_from_email").and_then(|v| v.as_str()) {
            self.default_from_email = email.to_string();
        }
        if let Some(phone) = toml_config
            .get("sendsms_default_from_phone")
            .and_then(|v| v.as_str())
        {
            self.sendsms_default_from_phone = phone.to_string();
        }
        if let Some(url) = toml_config.get("public_base_url").and_then(|v| v.as_str()) {
            self.public_base_url = url.to_string();
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server_private_key.is_empty() {
            return Err(ConfigError::Invalid(
                "server_private_key must be set".to_string(),
            ));
        }
        KeyPair::from_hex(&self.server_private_key)?;

        if self.require_authorization && self.accounting_apisecret.is_empty() {
            return Err(ConfigError::Invalid(
                "accounting_apisecret must be set when require_authorization is enabled".into(),
            ));
        }

        Ok(())
    }

    pub fn server_keypair(&self) -> KeyPair {
        KeyPair::from_hex(&self.server_private_key)
            .expect("validate() already confirmed this parses")
    }

    pub fn pending_request_max_age(&self) -> Duration {
        Duration::from_secs(self.pending_request_max_age_seconds)
    }

    pub fn country_policy(&self) -> CountryPolicy {
        if !self.sms_allowed_countries.is_empty() {
            CountryPolicy::Allow(self.sms_allowed_countries.iter().copied().collect())
        } else {
            CountryPolicy::Deny(self.sms_blacklisted_countries.iter().copied().collect())
        }
    }
}
