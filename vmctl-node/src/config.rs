//! Configuration management for the Node Daemon.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use vmctl_provision::{directory::DEFAULT_DEFINITIONS_DIR, parse_freshness, ProvisionerSettings};

use crate::cli::Args;

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/vmctl/node.yaml";

/// Main configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// REST API configuration
    pub server: ServerConfig,
    /// VM definition storage
    pub storage: StorageConfig,
    /// Template image cache
    pub cache: CacheConfig,
    /// virsh / qemu-img invocation
    pub hypervisor: HypervisorConfig,
    /// Guest agent operations
    pub guest: GuestConfig,
    /// Lifecycle event delivery
    pub events: EventsConfig,
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(anyhow::anyhow!("Config file not found: {}", path.display()));
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Apply CLI argument and environment overrides to the configuration.
    pub fn with_cli_overrides(mut self, args: &Args) -> Self {
        if let Some(ref listen) = args.listen {
            self.server.listen_address = listen.clone();
        }

        if let Some(ref token) = args.auth_token {
            self.server.auth_token = Some(token.clone());
        }

        if let Some(ref dir) = args.definitions_dir {
            self.storage.definitions_dir = dir.clone();
        }

        if let Some(ref dir) = args.cache_dir {
            self.cache.dir = Some(dir.clone());
        }

        if let Some(ref secs) = args.cache_seconds {
            self.cache.freshness_secs = Some(secs.clone());
        }

        if let Some(ref uri) = args.libvirt_uri {
            self.hypervisor.connect_uri = Some(uri.clone());
        }

        if let Some(ref url) = args.webhook_url {
            self.events.webhook_url = Some(url.clone());
        }

        if let Some(ref node_id) = args.node_id {
            self.events.node_id = Some(node_id.clone());
        }

        self
    }

    /// Settings for the provisioning pipeline.
    pub fn provisioner_settings(&self) -> ProvisionerSettings {
        ProvisionerSettings {
            definitions_dir: PathBuf::from(&self.storage.definitions_dir),
            cache_dir: self
                .cache
                .dir
                .as_deref()
                .map(str::trim)
                .filter(|d| !d.is_empty())
                .map(PathBuf::from),
            cache_freshness: parse_freshness(self.cache.freshness_secs.as_deref()),
            connect_uri: self
                .hypervisor
                .connect_uri
                .clone()
                .filter(|uri| !uri.trim().is_empty()),
            guest_exec_timeout: Duration::from_secs(self.guest.exec_timeout_secs),
            exec_allowlist: self.guest.exec_allowlist.clone(),
        }
    }
}

/// REST API configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to listen on
    pub listen_address: String,
    /// Bearer token; every route except /health fails closed while unset
    pub auth_token: Option<String>,
    /// Include captured stderr of failed commands in error responses
    pub expose_command_output: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0:8080".to_string(),
            auth_token: None,
            expose_command_output: false,
        }
    }
}

/// VM definition storage.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub definitions_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            definitions_dir: DEFAULT_DEFINITIONS_DIR.to_string(),
        }
    }
}

/// Template image cache.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Cache directory; templates are downloaded per request when unset
    pub dir: Option<String>,
    /// Freshness window in seconds, kept as text like the environment value
    #[serde(deserialize_with = "string_or_number")]
    pub freshness_secs: Option<String>,
}

/// External tool invocation.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HypervisorConfig {
    /// Libvirt connection URI; virsh's own default when unset
    pub connect_uri: Option<String>,
    /// Deadline for each external command
    pub command_timeout_secs: u64,
    /// Deadline for each template download
    pub download_timeout_secs: u64,
}

impl Default for HypervisorConfig {
    fn default() -> Self {
        Self {
            connect_uri: None,
            command_timeout_secs: vmctl_provision::runner::DEFAULT_COMMAND_TIMEOUT.as_secs(),
            download_timeout_secs: vmctl_provision::cache::DEFAULT_DOWNLOAD_TIMEOUT.as_secs(),
        }
    }
}

impl HypervisorConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }
}

/// Guest agent operations.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GuestConfig {
    /// Guest programs the generic exec endpoint may run
    pub exec_allowlist: Vec<String>,
    /// Deadline for a guest command to exit
    pub exec_timeout_secs: u64,
}

impl Default for GuestConfig {
    fn default() -> Self {
        Self {
            exec_allowlist: Vec::new(),
            exec_timeout_secs: vmctl_provision::domain::DEFAULT_GUEST_EXEC_TIMEOUT.as_secs(),
        }
    }
}

/// Lifecycle event delivery.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    /// Webhook endpoint; events are only logged when unset
    pub webhook_url: Option<String>,
    /// Node ID reported in payloads
    pub node_id: Option<String>,
}

impl EventsConfig {
    /// Get the node ID, falling back to the hostname.
    pub fn get_node_id(&self) -> String {
        self.node_id.clone().unwrap_or_else(|| {
            hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "unknown".to_string())
        })
    }
}

fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(u64),
    }

    Ok(Option::<Raw>::deserialize(deserializer)?.map(|raw| match raw {
        Raw::Text(text) => text,
        Raw::Number(n) => n.to_string(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.listen_address, "0.0.0.0:8080");
        assert!(config.server.auth_token.is_none());
        assert!(!config.server.expose_command_output);

        let settings = config.provisioner_settings();
        assert_eq!(settings.definitions_dir, PathBuf::from("/var/lib/vmctl/vms"));
        assert!(settings.cache_dir.is_none());
        assert_eq!(settings.cache_freshness, Duration::from_secs(604_800));
        assert!(settings.exec_allowlist.is_empty());
    }

    #[test]
    fn test_load_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.yaml");
        std::fs::write(
            &path,
            r#"
server:
  listen_address: "127.0.0.1:9000"
  auth_token: "secret"
cache:
  dir: /var/cache/vmctl
  freshness_secs: 60
hypervisor:
  connect_uri: "qemu:///system"
guest:
  exec_allowlist: ["/usr/bin/uptime"]
"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.server.listen_address, "127.0.0.1:9000");
        assert_eq!(config.server.auth_token.as_deref(), Some("secret"));
        assert_eq!(config.hypervisor.command_timeout_secs, 120);

        let settings = config.provisioner_settings();
        assert_eq!(settings.cache_dir, Some(PathBuf::from("/var/cache/vmctl")));
        assert_eq!(settings.cache_freshness, Duration::from_secs(60));
        assert_eq!(settings.connect_uri.as_deref(), Some("qemu:///system"));
        assert_eq!(settings.exec_allowlist, vec!["/usr/bin/uptime".to_string()]);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(Config::load("/nonexistent/vmctl/node.yaml").is_err());
    }

    #[test]
    fn test_cli_overrides() {
        let args = Args::try_parse_from([
            "vmctl-node",
            "--listen",
            "127.0.0.1:7000",
            "--cache-seconds",
            "0",
            "--definitions-dir",
            "/srv/vms",
            "--node-id",
            "node-a",
        ])
        .unwrap();

        let config = Config::default().with_cli_overrides(&args);
        assert_eq!(config.server.listen_address, "127.0.0.1:7000");
        assert_eq!(config.events.get_node_id(), "node-a");

        let settings = config.provisioner_settings();
        assert_eq!(settings.definitions_dir, PathBuf::from("/srv/vms"));
        assert_eq!(settings.cache_freshness, Duration::ZERO);
    }
}
