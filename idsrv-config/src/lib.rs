//! Configuration loading for the identity server key management host

use serde::Deserialize;
use std::env;
use std::fmt;
use std::time::Duration;

const DAY: u64 = 24 * 60 * 60;
const HOUR: u64 = 60 * 60;

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Console,
}

impl LogFormat {
    fn parse(value: &str) -> Result<Self, config::ConfigError> {
        match value.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "console" | "pretty" => Ok(Self::Console),
            other => Err(config::ConfigError::Message(format!(
                "LOG_FORMAT must be 'json' or 'console', got '{}'",
                other
            ))),
        }
    }
}

/// An older key-encryption key kept so existing data stays readable
#[derive(Clone, Deserialize)]
pub struct RetiredProtectionKey {
    pub id: String,
    pub secret: String,
}

impl fmt::Debug for RetiredProtectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetiredProtectionKey")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

/// Key management configuration
#[derive(Clone, Deserialize)]
pub struct KeyManagementConfig {
    pub database_url: String,
    pub activation_delay: Duration,
    pub expiration: Duration,
    pub retirement: Duration,
    pub rotation_interval: Duration,
    pub cache_ttl: Duration,
    pub pregenerate: bool,
    /// Hex key or passphrase; `None` means the host must refuse to start
    pub protection_key: Option<String>,
    pub protection_key_id: String,
    pub retired_protection_keys: Vec<RetiredProtectionKey>,
    pub data_protection_key_lifetime: Duration,
    pub log_level: Option<String>,
    pub log_format: LogFormat,
}

impl fmt::Debug for KeyManagementConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyManagementConfig")
            .field("database_url", &self.database_url)
            .field("activation_delay", &self.activation_delay)
            .field("expiration", &self.expiration)
            .field("retirement", &self.retirement)
            .field("rotation_interval", &self.rotation_interval)
            .field("cache_ttl", &self.cache_ttl)
            .field("pregenerate", &self.pregenerate)
            .field("protection_key", &self.protection_key.as_ref().map(|_| "<redacted>"))
            .field("protection_key_id", &self.protection_key_id)
            .field("retired_protection_keys", &self.retired_protection_keys)
            .field("data_protection_key_lifetime", &self.data_protection_key_lifetime)
            .field("log_level", &self.log_level)
            .field("log_format", &self.log_format)
            .finish()
    }
}

impl KeyManagementConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, config::ConfigError> {
        // Load .env file if it exists
        let _ = dotenvy::dotenv();

        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, config::ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        // Blank values count as unset
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let log_format = match var("LOG_FORMAT") {
            Some(value) => LogFormat::parse(value.trim())?,
            None => LogFormat::Console,
        };

        let retired_protection_keys = match var("PROTECTION_RETIRED_KEYS") {
            Some(value) => parse_retired_keys(&value)?,
            None => Vec::new(),
        };

        Ok(Self {
            database_url: var("DATABASE_URL").unwrap_or_else(|| "idsrv.db".to_string()),
            activation_delay: seconds(&var, "KEY_ACTIVATION_DELAY_SECS", 14 * DAY)?,
            expiration: seconds(&var, "KEY_EXPIRATION_SECS", 90 * DAY)?,
            retirement: seconds(&var, "KEY_RETIREMENT_SECS", 14 * DAY)?,
            rotation_interval: seconds(&var, "KEY_ROTATION_INTERVAL_SECS", HOUR)?,
            cache_ttl: seconds(&var, "KEY_CACHE_TTL_SECS", HOUR)?,
            pregenerate: flag(&var, "KEY_PREGENERATE")?,
            protection_key: var("PROTECTION_KEY"),
            protection_key_id: var("PROTECTION_KEY_ID").unwrap_or_else(|| "default".to_string()),
            retired_protection_keys,
            data_protection_key_lifetime: seconds(
                &var,
                "DATA_PROTECTION_KEY_LIFETIME_SECS",
                90 * DAY,
            )?,
            log_level: Some(var("LOG_LEVEL").unwrap_or_else(|| "info".to_string())),
            log_format,
        })
    }

    /// Get log level, defaulting to "info"
    pub fn log_level(&self) -> &str {
        self.log_level.as_deref().unwrap_or("info")
    }
}

fn seconds<F>(var: &F, name: &str, default: u64) -> Result<Duration, config::ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match var(name) {
        Some(value) => value
            .trim()
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|_| {
                config::ConfigError::Message(format!(
                    "{} must be a whole number of seconds, got '{}'",
                    name, value
                ))
            }),
        None => Ok(Duration::from_secs(default)),
    }
}

fn flag<F>(var: &F, name: &str) -> Result<bool, config::ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(value) = var(name) else {
        return Ok(false);
    };
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(config::ConfigError::Message(format!(
            "{} must be a boolean, got '{}'",
            name, value
        ))),
    }
}

/// Parse `id:secret,id:secret`
fn parse_retired_keys(value: &str) -> Result<Vec<RetiredProtectionKey>, config::ConfigError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| match entry.split_once(':') {
            Some((id, secret)) if !id.trim().is_empty() && !secret.trim().is_empty() => {
                Ok(RetiredProtectionKey {
                    id: id.trim().to_string(),
                    secret: secret.trim().to_string(),
                })
            }
            _ => Err(config::ConfigError::Message(
                "PROTECTION_RETIRED_KEYS entries must look like 'id:secret'".to_string(),
            )),
        })
        .collect()
}
