//! Daemon configuration.
//!
//! Configuration is a TOML file with three sections: `[storage]` for the
//! persisted policy layout, `[sync]` for the remote policy source, and
//! `[service]` for the bus-facing identity. Every field has a default that
//! matches the reference deployment, so an empty file (or no file at all)
//! yields a runnable configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// The TOML could not be parsed.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Top-level daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DaemonConfig {
    /// Persisted policy storage layout.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Remote policy source.
    #[serde(default)]
    pub sync: SyncConfig,

    /// Bus-facing service identity.
    #[serde(default)]
    pub service: ServiceConfig,
}

impl DaemonConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }
}

/// Persisted policy storage layout.
///
/// Synced policies live as one JSON document per `*.policy` file inside
/// [`policy_dir`](Self::policy_dir). The default and self policies are
/// well-known files outside that directory; both must exist at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root state directory.
    #[serde(default = "default_storage_dir")]
    pub dir: PathBuf,

    /// Directory of synced policy files. Defaults to `<dir>/policies`.
    #[serde(default)]
    pub policy_dir: Option<PathBuf>,

    /// Path of the default policy file. Defaults to `<dir>/default.policy`.
    #[serde(default)]
    pub default_policy: Option<PathBuf>,

    /// Path of the daemon's own policy file. Defaults to `<dir>/napd.policy`.
    #[serde(default)]
    pub self_policy: Option<PathBuf>,
}

impl StorageConfig {
    /// Directory holding the synced policy files.
    #[must_use]
    pub fn policy_dir(&self) -> PathBuf {
        self.policy_dir
            .clone()
            .unwrap_or_else(|| self.dir.join("policies"))
    }

    /// Path of the default policy file.
    #[must_use]
    pub fn default_policy_path(&self) -> PathBuf {
        self.default_policy
            .clone()
            .unwrap_or_else(|| self.dir.join("default.policy"))
    }

    /// Path of the daemon's own policy file.
    #[must_use]
    pub fn self_policy_path(&self) -> PathBuf {
        self.self_policy
            .clone()
            .unwrap_or_else(|| self.dir.join("napd.policy"))
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dir: default_storage_dir(),
            policy_dir: None,
            default_policy: None,
            self_policy: None,
        }
    }
}

/// Remote policy source settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Endpoint serving the policy set as a JSON array.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Basic-auth user name; empty disables authentication.
    #[serde(default)]
    pub username: String,

    /// Basic-auth password.
    #[serde(default)]
    pub password: String,

    /// Age of the local policy storage, in seconds, beyond which a request
    /// triggers a resync before resolving.
    #[serde(default = "default_staleness_secs")]
    pub staleness_secs: u64,
}

impl SyncConfig {
    /// Staleness threshold as a [`Duration`].
    #[must_use]
    pub const fn staleness(&self) -> Duration {
        Duration::from_secs(self.staleness_secs)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            username: String::new(),
            password: String::new(),
            staleness_secs: default_staleness_secs(),
        }
    }
}

/// Bus-facing service identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Well-known service name the daemon claims on the bus.
    #[serde(default = "default_service_name")]
    pub name: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
        }
    }
}

fn default_storage_dir() -> PathBuf {
    PathBuf::from("/var/lib/napd")
}

fn default_endpoint() -> String {
    "http://127.0.0.1:9000/update_policies".to_owned()
}

const fn default_staleness_secs() -> u64 {
    10
}

fn default_service_name() -> String {
    "org.automotive.napd1".to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_reference_defaults() {
        let config = DaemonConfig::from_toml("").expect("empty config parses");
        assert_eq!(config.storage.dir, PathBuf::from("/var/lib/napd"));
        assert_eq!(
            config.storage.policy_dir(),
            PathBuf::from("/var/lib/napd/policies")
        );
        assert_eq!(
            config.storage.default_policy_path(),
            PathBuf::from("/var/lib/napd/default.policy")
        );
        assert_eq!(
            config.storage.self_policy_path(),
            PathBuf::from("/var/lib/napd/napd.policy")
        );
        assert_eq!(config.sync.staleness(), Duration::from_secs(10));
        assert!(config.sync.username.is_empty());
        assert_eq!(config.service.name, "org.automotive.napd1");
    }

    #[test]
    fn sections_override_defaults() {
        let config = DaemonConfig::from_toml(
            r#"
            [storage]
            dir = "/tmp/napd"
            policy_dir = "/tmp/elsewhere"

            [sync]
            endpoint = "https://policies.example/v1"
            username = "head-unit"
            password = "secret"
            staleness_secs = 30

            [service]
            name = "org.example.policy1"
            "#,
        )
        .expect("valid config");

        assert_eq!(config.storage.policy_dir(), PathBuf::from("/tmp/elsewhere"));
        assert_eq!(
            config.storage.default_policy_path(),
            PathBuf::from("/tmp/napd/default.policy")
        );
        assert_eq!(config.sync.endpoint, "https://policies.example/v1");
        assert_eq!(config.sync.staleness(), Duration::from_secs(30));
        assert_eq!(config.service.name, "org.example.policy1");
    }

    #[test]
    fn invalid_toml_is_a_parse_error() {
        let err = DaemonConfig::from_toml("storage = 3").expect_err("must fail");
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
