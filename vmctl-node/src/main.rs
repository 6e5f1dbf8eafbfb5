//! # vmctl Node Daemon
//!
//! The Node Daemon runs on each hypervisor host and provisions virtual
//! machines through `virsh`, `qemu-img` and `genisoimage`, exposing the
//! provisioning pipeline as a bearer-authenticated REST API.
//!
//! ## Features
//! - VM provisioning from cached template images
//! - Lifecycle control (start, stop, reboot, pause, delete)
//! - cloud-init customization images
//! - Guest agent commands and snapshots
//! - Lifecycle event webhooks
//!
//! ## Usage
//! ```bash
//! vmctl-node --config /etc/vmctl/node.yaml
//! ```

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

mod cli;
mod config;
mod http_server;
mod server;
mod webhook;

use cli::Args;
use config::{Config, DEFAULT_CONFIG_PATH};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let args = Args::parse();

    // Initialize logging
    vmctl_common::init_logging_with_format(&args.log_level, args.log_format)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting vmctl Node Daemon"
    );

    // Load configuration
    let config = match &args.config {
        Some(config_path) => {
            // Explicit config file provided
            match Config::load(config_path) {
                Ok(cfg) => {
                    info!(config_path = %config_path, "Configuration loaded");
                    cfg.with_cli_overrides(&args)
                }
                Err(e) => {
                    error!(error = %e, path = %config_path, "Failed to load configuration");
                    return Err(e);
                }
            }
        }
        None => {
            // Try default location, fall back to CLI-only config
            match Config::load(DEFAULT_CONFIG_PATH) {
                Ok(cfg) => {
                    info!(config_path = %DEFAULT_CONFIG_PATH, "Configuration loaded from default location");
                    cfg.with_cli_overrides(&args)
                }
                Err(_) => {
                    info!("No config file found, using CLI arguments and defaults");
                    Config::default().with_cli_overrides(&args)
                }
            }
        }
    };

    info!(
        listen = %config.server.listen_address,
        definitions_dir = %config.storage.definitions_dir,
        "Node daemon configured"
    );

    if let Err(e) = server::run(config).await {
        error!(error = %e, "Server failed");
        return Err(e);
    }

    Ok(())
}
