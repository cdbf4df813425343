//! Configuration file for the dhtnat CLI.

use dhtnat::{Contact, NodeId, PuncherConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// CLI configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Local node
    #[serde(default)]
    pub node: NodeConfig,
    /// Rendezvous candidates
    #[serde(default)]
    pub rendezvous: RendezvousConfig,
    /// Logging
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Puncher timers and limits
    #[serde(default)]
    pub puncher: PuncherConfig,
}

/// Local node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// UDP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Node ID (64 hex chars); derived from the bound address if absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
}

/// Rendezvous candidates
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RendezvousConfig {
    /// Peers as `ip:port` or `hex-id@ip:port`
    #[serde(default)]
    pub peers: Vec<String>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level or `EnvFilter` directive
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_listen_addr() -> String {
    "0.0.0.0:7400".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            node_id: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, contents)?;
        Ok(())
    }

    /// Default config path
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("dhtnat/config.toml")
    }

    /// Load from `path`, writing defaults there if missing
    ///
    /// # Errors
    ///
    /// Returns an error if reading or creating the config fails.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            let config = Self::default();
            config.save(path)?;
            Ok(config)
        }
    }

    /// Listen address as `SocketAddr`
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be parsed.
    pub fn parse_listen_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.node.listen_addr.parse()?)
    }

    /// Configured node ID
    ///
    /// # Errors
    ///
    /// Returns an error if the ID is not 64 hex characters.
    pub fn node_id(&self) -> anyhow::Result<Option<NodeId>> {
        self.node
            .node_id
            .as_deref()
            .map(|hex| hex.parse::<NodeId>().map_err(anyhow::Error::msg))
            .transpose()
    }

    /// Rendezvous peers as contacts
    ///
    /// # Errors
    ///
    /// Returns an error naming the first peer that does not parse.
    pub fn rendezvous_contacts(&self) -> anyhow::Result<Vec<Contact>> {
        self.rendezvous
            .peers
            .iter()
            .map(|peer| {
                peer.parse::<Contact>()
                    .map_err(|e| anyhow::anyhow!("Rendezvous peer '{peer}': {e}"))
            })
            .collect()
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.parse_listen_addr()?;
        self.node_id()?;
        self.rendezvous_contacts()?;

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        self.puncher.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.node.listen_addr, "0.0.0.0:7400");
        assert!(config.rendezvous.peers.is_empty());
        assert_eq!(config.puncher, PuncherConfig::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();

        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());
        config.logging.level = "debug".to_string();

        config.rendezvous.peers = vec!["not-an-addr".to_string()];
        assert!(config.validate().is_err());
        config.rendezvous.peers = vec!["203.0.113.7:7400".to_string()];
        assert!(config.validate().is_ok());

        config.node.node_id = Some("abcd".to_string());
        assert!(config.validate().is_err());
        config.node.node_id = None;

        config.puncher.max_candidates = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [rendezvous]
            peers = ["203.0.113.7:7400"]

            [puncher]
            session_deadline = 5000
            "#,
        )
        .unwrap();
        assert_eq!(config.node.listen_addr, "0.0.0.0:7400");
        assert_eq!(config.puncher.session_deadline, Duration::from_secs(5));
        assert_eq!(
            config.puncher.candidate_timeout,
            PuncherConfig::default().candidate_timeout
        );
        assert_eq!(config.rendezvous_contacts().unwrap().len(), 1);
    }

    #[test]
    fn test_load_or_default_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dhtnat/config.toml");

        let created = Config::load_or_default(&path).unwrap();
        assert!(path.exists());
        assert_eq!(created.node.listen_addr, "0.0.0.0:7400");

        let mut edited = created;
        edited.logging.level = "debug".to_string();
        edited.save(&path).unwrap();
        let reloaded = Config::load_or_default(&path).unwrap();
        assert_eq!(reloaded.logging.level, "debug");
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/config.toml");

        let mut config = Config::default();
        config.rendezvous.peers = vec!["198.51.100.4:7400".to_string()];
        config.puncher.max_served_bindings = 2;
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.rendezvous.peers, config.rendezvous.peers);
        assert_eq!(loaded.puncher.max_served_bindings, 2);
    }
}
