//! Shared wiring for the key management binaries

use anyhow::{Context, Result};
use idsrv_config::{KeyManagementConfig, LogFormat};
use idsrv_keys::{KeyManagementOptions, KeyPolicy, ProtectionKey, RotationSchedule};

/// Initialize logging in the format the configuration asks for
pub fn init_host_logging(service_name: &str, config: &KeyManagementConfig) {
    match config.log_format {
        LogFormat::Json => idsrv_logging::init_logging(service_name, config.log_level()),
        LogFormat::Console => idsrv_logging::init_console_logging(service_name, config.log_level()),
    }
}

/// Build key management options from loaded configuration
///
/// A missing protection key is not an error here; `init_key_management`
/// rejects it so both binaries fail the same way.
pub fn key_management_options(config: &KeyManagementConfig) -> Result<KeyManagementOptions> {
    let policy = KeyPolicy::new(config.activation_delay, config.expiration, config.retirement)
        .with_pregenerate(config.pregenerate);
    let schedule = RotationSchedule::new(policy, config.rotation_interval, config.cache_ttl);

    let mut options = KeyManagementOptions::new(config.database_url.clone(), schedule);
    options.data_protection_key_lifetime = config.data_protection_key_lifetime;

    if let Some(secret) = &config.protection_key {
        let key = ProtectionKey::from_secret(config.protection_key_id.clone(), secret)
            .context("Invalid PROTECTION_KEY")?;
        options = options.with_protection_key(key);
    }

    for retired in &config.retired_protection_keys {
        let key = ProtectionKey::from_secret(retired.id.clone(), &retired.secret)
            .with_context(|| format!("Invalid retired protection key '{}'", retired.id))?;
        options = options.with_retired_protection_key(key);
    }

    Ok(options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use idsrv_keys::{init_key_management, KeyError, ProtectionError};
    use std::collections::HashMap;
    use std::time::Duration;

    fn config(vars: &[(&str, &str)]) -> KeyManagementConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        KeyManagementConfig::from_lookup(|name| vars.get(name).cloned()).unwrap()
    }

    #[test]
    fn test_options_follow_config() {
        let options = key_management_options(&config(&[
            ("DATABASE_URL", ":memory:"),
            ("KEY_ACTIVATION_DELAY_SECS", "20"),
            ("KEY_EXPIRATION_SECS", "40"),
            ("KEY_RETIREMENT_SECS", "80"),
            ("KEY_ROTATION_INTERVAL_SECS", "5"),
            ("KEY_CACHE_TTL_SECS", "10"),
            ("KEY_PREGENERATE", "1"),
            ("PROTECTION_KEY", "passphrase"),
            ("PROTECTION_KEY_ID", "kek-1"),
            ("PROTECTION_RETIRED_KEYS", "kek-0:older passphrase"),
            ("DATA_PROTECTION_KEY_LIFETIME_SECS", "3600"),
        ]))
        .unwrap();

        assert_eq!(options.connection_string, ":memory:");
        assert_eq!(options.schedule.policy.activation_delay, Duration::from_secs(20));
        assert!(options.schedule.policy.pregenerate);
        assert_eq!(options.schedule.rotation_interval, Duration::from_secs(5));
        assert_eq!(options.schedule.cache_ttl, Duration::from_secs(10));
        assert_eq!(options.protection_key.as_ref().unwrap().id(), "kek-1");
        assert_eq!(options.retired_protection_keys.len(), 1);
        assert_eq!(options.retired_protection_keys[0].id(), "kek-0");
        assert_eq!(options.data_protection_key_lifetime, Duration::from_secs(3600));
    }

    #[tokio::test]
    async fn test_missing_protection_key_refuses_to_start() {
        let options = key_management_options(&config(&[("DATABASE_URL", ":memory:")])).unwrap();
        assert!(options.protection_key.is_none());

        assert!(matches!(
            init_key_management(options).await,
            Err(KeyError::Protection(ProtectionError::NoProtectionKeyConfigured))
        ));
    }

    #[tokio::test]
    async fn test_default_cache_ttl_against_short_activation_is_rejected() {
        // default TTL is an hour, longer than the activation delay
        let options = key_management_options(&config(&[
            ("DATABASE_URL", ":memory:"),
            ("KEY_ACTIVATION_DELAY_SECS", "60"),
            ("PROTECTION_KEY", "passphrase"),
        ]))
        .unwrap();

        assert!(matches!(
            init_key_management(options).await,
            Err(KeyError::PolicyViolation(_))
        ));
    }
}
