//! Runtime configuration.
//!
//! Values are opaque to the crate and only checked for non-emptiness (and
//! namespace shape). `FleConfig::from_env` reads the `FLE_*` variables; the
//! defaults match a local development deployment.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::FleError;
use crate::key_vault::KeyAlias;
use crate::store::Namespace;

/// Default per-operation deadline.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq)]
pub struct FleConfig {
    pub connection_string: String,
    /// Logical database holding the application's records.
    pub database: String,
    /// Collection whose documents carry encrypted fields.
    pub collection: String,
    pub key_vault_database: String,
    pub key_vault_collection: String,
    pub key_alias: String,
    pub kms_provider: String,
    pub master_key_path: PathBuf,
    /// Schema-analysis helper the driver spawns for query planning.
    pub helper_spawn_path: PathBuf,
    pub operation_timeout: Duration,
}

impl Default for FleConfig {
    fn default() -> Self {
        Self {
            connection_string: "mongodb://localhost:27017".to_string(),
            database: "fhir".to_string(),
            collection: "patients".to_string(),
            key_vault_database: "encryption".to_string(),
            key_vault_collection: "__keyVault".to_string(),
            key_alias: "patient-key-v1".to_string(),
            kms_provider: "local".to_string(),
            master_key_path: PathBuf::from("master-key.txt"),
            helper_spawn_path: PathBuf::from("/usr/local/bin/mongocryptd"),
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
        }
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

impl FleConfig {
    /// Read configuration from the environment, falling back to defaults for
    /// unset variables.
    ///
    /// | variable                    | field                  |
    /// |-----------------------------|------------------------|
    /// | `FLE_CONNECTION_STRING`     | `connection_string`    |
    /// | `FLE_DATABASE`              | `database`             |
    /// | `FLE_COLLECTION`            | `collection`           |
    /// | `FLE_KEY_VAULT_DATABASE`    | `key_vault_database`   |
    /// | `FLE_KEY_VAULT_COLLECTION`  | `key_vault_collection` |
    /// | `FLE_KEY_ALIAS`             | `key_alias`            |
    /// | `FLE_KMS_PROVIDER`          | `kms_provider`         |
    /// | `FLE_MASTER_KEY_PATH`       | `master_key_path`      |
    /// | `FLE_HELPER_SPAWN_PATH`     | `helper_spawn_path`    |
    /// | `FLE_OPERATION_TIMEOUT_MS`  | `operation_timeout`    |
    pub fn from_env() -> Result<Self, FleError> {
        let defaults = Self::default();
        let timeout = match env_string("FLE_OPERATION_TIMEOUT_MS") {
            Some(raw) => raw
                .parse::<u64>()
                .ok()
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis)
                .ok_or_else(|| FleError::Config(format!("invalid FLE_OPERATION_TIMEOUT_MS '{raw}'")))?,
            None => defaults.operation_timeout,
        };

        let config = Self {
            connection_string: env_string("FLE_CONNECTION_STRING").unwrap_or(defaults.connection_string),
            database: env_string("FLE_DATABASE").unwrap_or(defaults.database),
            collection: env_string("FLE_COLLECTION").unwrap_or(defaults.collection),
            key_vault_database: env_string("FLE_KEY_VAULT_DATABASE").unwrap_or(defaults.key_vault_database),
            key_vault_collection: env_string("FLE_KEY_VAULT_COLLECTION")
                .unwrap_or(defaults.key_vault_collection),
            key_alias: env_string("FLE_KEY_ALIAS").unwrap_or(defaults.key_alias),
            kms_provider: env_string("FLE_KMS_PROVIDER").unwrap_or(defaults.kms_provider),
            master_key_path: env_string("FLE_MASTER_KEY_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.master_key_path),
            helper_spawn_path: env_string("FLE_HELPER_SPAWN_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.helper_spawn_path),
            operation_timeout: timeout,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check every value is non-empty and the namespaces are well formed.
    pub fn validate(&self) -> Result<(), FleError> {
        let required = [
            ("connection string", self.connection_string.as_str()),
            ("kms provider", self.kms_provider.as_str()),
        ];
        for (what, value) in required {
            if value.trim().is_empty() {
                return Err(FleError::Config(format!("empty {what}")));
            }
        }
        if self.master_key_path.as_os_str().is_empty() {
            return Err(FleError::Config("empty master key path".into()));
        }
        if self.helper_spawn_path.as_os_str().is_empty() {
            return Err(FleError::Config("empty helper spawn path".into()));
        }
        if self.operation_timeout.is_zero() {
            return Err(FleError::Config("zero operation timeout".into()));
        }
        self.records_namespace()?;
        self.key_vault_namespace()?;
        self.alias()?;
        Ok(())
    }

    pub fn records_namespace(&self) -> Result<Namespace, FleError> {
        Namespace::new(self.database.clone(), self.collection.clone())
    }

    pub fn key_vault_namespace(&self) -> Result<Namespace, FleError> {
        Namespace::new(self.key_vault_database.clone(), self.key_vault_collection.clone())
    }

    pub fn alias(&self) -> Result<KeyAlias, FleError> {
        KeyAlias::new(self.key_alias.clone())
    }
}
