use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

const CONFIG_FILE_NAME: &str = "config.toml";

/// Engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sync: SyncConfig,
    pub discovery: DiscoveryConfig,
    pub remote: RemoteConfig,
}

/// Library synchronization settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Differing ids per kind above which incremental reconciliation is skipped
    pub reconcile_threshold: usize,
    /// Quiet period before the mirror is written to the cache
    pub save_debounce_ms: u64,
    /// Start a full reload as soon as the library is found outdated
    pub auto_reload_outdated: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            reconcile_threshold: 50,
            save_debounce_ms: 3000,
            auto_reload_outdated: false,
        }
    }
}

impl SyncConfig {
    pub fn save_debounce(&self) -> Duration {
        Duration::from_millis(self.save_debounce_ms)
    }
}

/// Local network discovery settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub enabled: bool,
    /// Zeroconf service type advertised by hosts
    pub service_type: String,
    /// Delay before re-browsing after a resolver failure
    pub restart_delay_ms: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            service_type: "_xbmc-jsonrpc-h._tcp.local.".to_string(),
            restart_delay_ms: 2000,
        }
    }
}

/// Remote host connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub request_timeout_secs: u64,
    /// Notification port assumed when discovery does not advertise one
    pub default_tcp_port: u16,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 10,
            default_tcp_port: 9090,
        }
    }
}

impl Config {
    /// Get the configuration file path
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to get config directory")?
            .join("drift-host");

        fs::create_dir_all(&config_dir)
            .context("Failed to create config directory")?;

        Ok(config_dir.join(CONFIG_FILE_NAME))
    }

    /// Load configuration from file, or create default if not exists
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;

        if path.exists() {
            let contents = fs::read_to_string(&path)
                .context("Failed to read config file")?;

            let config: Config = toml::from_str(&contents)
                .context("Failed to parse config file")?;

            Ok(config)
        } else {
            let config = Config::default();
            config.save()?;
            Ok(config)
        }
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;

        let contents = toml::to_string_pretty(self)
            .context("Failed to serialize config")?;

        fs::write(&path, contents)
            .context("Failed to write config file")?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.sync.reconcile_threshold, 50);
        assert_eq!(config.sync.save_debounce(), Duration::from_secs(3));
        assert!(!config.sync.auto_reload_outdated);
        assert!(config.discovery.enabled);
        assert_eq!(config.discovery.service_type, "_xbmc-jsonrpc-h._tcp.local.");
        assert_eq!(config.remote.request_timeout_secs, 10);
        assert_eq!(config.remote.default_tcp_port, 9090);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let partial_toml = r#"
[sync]
reconcile_threshold = 10
"#;

        let config: Config = toml::from_str(partial_toml).unwrap();

        assert_eq!(config.sync.reconcile_threshold, 10);
        assert_eq!(config.sync.save_debounce_ms, 3000);
        assert!(config.discovery.enabled);
    }

    #[test]
    fn test_full_config_parsing() {
        let full_toml = r#"
[sync]
reconcile_threshold = 200
save_debounce_ms = 500
auto_reload_outdated = true

[discovery]
enabled = false
service_type = "_custom._tcp.local."
restart_delay_ms = 100

[remote]
request_timeout_secs = 3
default_tcp_port = 9999
"#;

        let config: Config = toml::from_str(full_toml).unwrap();

        assert_eq!(config.sync.reconcile_threshold, 200);
        assert_eq!(config.sync.save_debounce(), Duration::from_millis(500));
        assert!(config.sync.auto_reload_outdated);
        assert!(!config.discovery.enabled);
        assert_eq!(config.discovery.service_type, "_custom._tcp.local.");
        assert_eq!(config.discovery.restart_delay_ms, 100);
        assert_eq!(config.remote.request_timeout_secs, 3);
        assert_eq!(config.remote.default_tcp_port, 9999);
    }

    #[test]
    fn test_serialize_deserialize_roundtrip() {
        let config = Config::default();
        let serialized = toml::to_string_pretty(&config).unwrap();
        let deserialized: Config = toml::from_str(&serialized).unwrap();

        assert_eq!(config.sync.reconcile_threshold, deserialized.sync.reconcile_threshold);
        assert_eq!(config.discovery.service_type, deserialized.discovery.service_type);
    }

    #[test]
    fn test_invalid_toml_returns_error() {
        let invalid_toml = "this is not valid [[ toml";
        let result: Result<Config, _> = toml::from_str(invalid_toml);
        assert!(result.is_err());
    }
}
