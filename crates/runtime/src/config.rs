//! Process configuration resolved from the environment.
//!
//! The core consumes exactly two environment values: the at-rest encryption
//! key and an optional log verbosity directive. Everything else an operator
//! can tune lives in the catalog's settings row.

use std::env;
use std::path::PathBuf;

use thiserror::Error;

use crate::crypto::{self, KeyVault};

/// Environment variable for the tracing env-filter directive.
pub const LOG_ENV: &str = "FLOTILLA_LOG";

/// Environment variable overriding the catalog database path.
pub const DB_PATH_ENV: &str = "FLOTILLA_DB";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: &'static str, reason: String },
}

/// Runtime configuration for one process.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Base64-encoded 256-bit key for the vault.
    pub secret_key: String,
    /// True when the built-in development key is in use.
    pub default_key_in_use: bool,
    /// Tracing filter directive (e.g. `info`, `flotilla_runtime=debug`).
    pub log_filter: String,
    /// Path of the SQLite catalog.
    pub catalog_path: PathBuf,
}

impl RuntimeConfig {
    /// Resolve configuration from the environment.
    ///
    /// A missing or empty `FLOTILLA_SECRET_KEY` selects the development
    /// fallback key; a present but undecodable one is an error rather than a
    /// silent downgrade.
    pub fn from_env() -> Result<Self, ConfigError> {
        let (secret_key, default_key_in_use) = match env::var(crypto::SECRET_KEY_ENV) {
            Ok(value) if !value.trim().is_empty() => (value, false),
            _ => (crypto::DEV_FALLBACK_KEY.to_string(), true),
        };

        KeyVault::new(&secret_key).map_err(|e| ConfigError::InvalidValue {
            key: crypto::SECRET_KEY_ENV,
            reason: e.to_string(),
        })?;

        let log_filter = env::var(LOG_ENV).unwrap_or_else(|_| "info".to_string());
        let catalog_path = env::var(DB_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_catalog_path());

        Ok(Self {
            secret_key,
            default_key_in_use,
            log_filter,
            catalog_path,
        })
    }

    /// Emit the mandatory startup warning when the fallback key is active.
    pub fn warn_if_default_key(&self) {
        if self.default_key_in_use {
            tracing::warn!(
                "{} is not set; secrets are sealed with the built-in development \
                 key and are NOT protected — set it before storing credentials",
                crypto::SECRET_KEY_ENV
            );
        }
    }
}

/// Default catalog path: `<platform data dir>/flotilla/catalog.db`.
pub fn default_catalog_path() -> PathBuf {
    let base = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
    base.join("flotilla").join("catalog.db")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn falls_back_to_dev_key_when_unset() {
        env::remove_var(crypto::SECRET_KEY_ENV);
        env::remove_var(LOG_ENV);
        env::remove_var(DB_PATH_ENV);

        let config = RuntimeConfig::from_env().unwrap();
        assert!(config.default_key_in_use);
        assert_eq!(config.secret_key, crypto::DEV_FALLBACK_KEY);
        assert_eq!(config.log_filter, "info");
    }

    #[test]
    #[serial]
    fn reads_explicit_values() {
        let key = KeyVault::generate_key();
        env::set_var(crypto::SECRET_KEY_ENV, &key);
        env::set_var(LOG_ENV, "debug");
        env::set_var(DB_PATH_ENV, "/tmp/flotilla-test/catalog.db");

        let config = RuntimeConfig::from_env().unwrap();
        assert!(!config.default_key_in_use);
        assert_eq!(config.secret_key, key);
        assert_eq!(config.log_filter, "debug");
        assert_eq!(
            config.catalog_path,
            PathBuf::from("/tmp/flotilla-test/catalog.db")
        );

        env::remove_var(crypto::SECRET_KEY_ENV);
        env::remove_var(LOG_ENV);
        env::remove_var(DB_PATH_ENV);
    }

    #[test]
    #[serial]
    fn rejects_undecodable_key() {
        env::set_var(crypto::SECRET_KEY_ENV, "definitely-not-base64!!!");
        let result = RuntimeConfig::from_env();
        env::remove_var(crypto::SECRET_KEY_ENV);
        assert!(result.is_err());
    }

    #[test]
    fn default_path_ends_with_catalog_db() {
        let path = default_catalog_path();
        assert!(path.ends_with("flotilla/catalog.db"));
    }
}
