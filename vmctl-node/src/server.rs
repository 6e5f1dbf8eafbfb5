//! Daemon wiring and lifecycle.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use vmctl_provision::{EventSink, HttpFetcher, Provisioner, SystemRunner};

use crate::config::Config;
use crate::http_server::{run_http_server, AppState};
use crate::webhook::{LogSink, WebhookNotifier};

/// Build the provisioning pipeline described by `config`.
pub fn build_provisioner(config: &Config) -> Result<Provisioner> {
    let runner = Arc::new(SystemRunner::new(config.hypervisor.command_timeout()));
    let fetcher = Arc::new(
        HttpFetcher::new(config.hypervisor.download_timeout())
            .context("Failed to build template download client")?,
    );

    let events: Arc<dyn EventSink> = match config.events.webhook_url.as_deref() {
        Some(url) if !url.trim().is_empty() => {
            let node_id = config.events.get_node_id();
            info!(url = %url, node_id = %node_id, "Webhook notifications enabled");
            Arc::new(WebhookNotifier::new(url, node_id)?)
        }
        _ => {
            info!("No webhook configured, lifecycle events are only logged");
            Arc::new(LogSink)
        }
    };

    let settings = config.provisioner_settings();
    info!(
        definitions_dir = %settings.definitions_dir.display(),
        cache_dir = ?settings.cache_dir,
        cache_freshness_secs = settings.cache_freshness.as_secs(),
        connect_uri = ?settings.connect_uri,
        exec_allowlist = settings.exec_allowlist.len(),
        "Provisioner configured"
    );

    Ok(Provisioner::from_settings(settings, runner, fetcher).with_events(events))
}

/// Run the REST API until it fails.
pub async fn run(config: Config) -> Result<()> {
    let provisioner = build_provisioner(&config)?;

    let addr: std::net::SocketAddr = config
        .server
        .listen_address
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid listen address: {}", e))?;

    let state = Arc::new(AppState {
        provisioner: Arc::new(provisioner),
        auth_token: config.server.auth_token.clone(),
        expose_command_output: config.server.expose_command_output,
    });

    run_http_server(addr, state).await
}
