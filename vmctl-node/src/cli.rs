//! Command-line argument parsing.

use clap::Parser;
use vmctl_common::LogFormat;

/// vmctl Node Daemon - single-host VM provisioning API
#[derive(Parser, Debug)]
#[command(name = "vmctl-node")]
#[command(about = "vmctl Node Daemon - single-host VM provisioning API")]
#[command(version)]
pub struct Args {
    /// Path to configuration file (optional, defaults used if not found)
    #[arg(short, long)]
    pub config: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    pub log_level: String,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,

    /// Listen address for the REST API
    #[arg(long, env = "LISTEN_ADDRESS")]
    pub listen: Option<String>,

    /// Directory holding one subdirectory per VM
    #[arg(long, env = "DEFINITIONS_DIR")]
    pub definitions_dir: Option<String>,

    /// Template image cache directory (caching is disabled when unset)
    #[arg(long, env = "CACHE_DIR")]
    pub cache_dir: Option<String>,

    /// Template cache freshness window in seconds
    #[arg(long, env = "CACHE_SECONDS")]
    pub cache_seconds: Option<String>,

    /// Libvirt connection URI passed to virsh (e.g., qemu:///system)
    #[arg(long, env = "LIBVIRT_URI")]
    pub libvirt_uri: Option<String>,

    /// Bearer token required on every API route except /health
    #[arg(long, env = "AUTH_TOKEN", hide_env_values = true)]
    pub auth_token: Option<String>,

    /// URL receiving lifecycle event webhooks
    #[arg(long, env = "WEBHOOK_URL")]
    pub webhook_url: Option<String>,

    /// Node ID reported in webhook payloads (defaults to the hostname)
    #[arg(long, env = "NODE_ID")]
    pub node_id: Option<String>,
}
