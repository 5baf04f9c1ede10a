use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use hookrelay::{run_tunnel, ClientConfig};
use hookrelay_common::TunnelError;

/// hookrelay - receive public webhooks on a private machine
#[derive(Parser, Debug)]
#[command(name = "hookrelay")]
#[command(about = "Forward webhooks from a public relay to a local service")]
struct Cli {
    /// Relay base URL (e.g. https://relay.example.com)
    #[arg(short, long, env = "HOOKRELAY_SERVER")]
    server: Option<String>,

    /// Shared token (env://VAR, file:///path, or literal)
    #[arg(short, long, env = "HOOKRELAY_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Local URL that receives the webhooks (e.g. http://127.0.0.1:3000/hook)
    #[arg(short, long, env = "HOOKRELAY_FORWARD_URL")]
    forward_url: Option<String>,

    /// Relay tunnel endpoint path
    #[arg(long, env = "HOOKRELAY_TUNNEL_PATH")]
    tunnel_path: Option<String>,

    /// Seconds allowed for each local call
    #[arg(long, env = "HOOKRELAY_LOCAL_TIMEOUT")]
    local_timeout: Option<u64>,

    /// Append the webhook's path and query to the forward URL
    #[arg(long)]
    preserve_path: bool,

    /// CA certificate to trust for the relay (env://, file://, path, or PEM)
    #[arg(long, env = "HOOKRELAY_CA_CERT")]
    ca_cert: Option<String>,

    /// Seconds to wait before reconnecting
    #[arg(long)]
    reconnect_delay: Option<u64>,

    /// Config file (defaults to ~/.config/hookrelay/client.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Exit instead of reconnecting when the tunnel drops
    #[arg(long)]
    once: bool,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn to_config(&self) -> ClientConfig {
        ClientConfig {
            server: self.server.clone(),
            token: self.token.clone(),
            forward_url: self.forward_url.clone(),
            tunnel_path: self.tunnel_path.clone(),
            local_timeout_secs: self.local_timeout,
            preserve_path: self.preserve_path.then_some(true),
            ca_cert: self.ca_cert.clone(),
            reconnect_delay_secs: self.reconnect_delay,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Install rustls crypto provider before any TLS operations
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(format!("hookrelay={}", level).parse()?)
                .add_directive(format!("hookrelay_common={}", level).parse()?),
        )
        .init();

    let config_path = cli.config.clone().unwrap_or_else(ClientConfig::default_path);
    let file_config = ClientConfig::try_load(&config_path)?;
    if file_config.is_some() {
        tracing::info!("Loaded config from {}", config_path.display());
    }

    let settings = cli
        .to_config()
        .or(file_config.unwrap_or_default())
        .resolve()
        .context("Invalid configuration")?;

    tracing::info!(
        "Relaying {} -> {}",
        settings.server_url,
        settings.forward_url
    );

    loop {
        let result = run_tunnel(&settings, shutdown_signal()).await;
        match result {
            Ok(()) => break,
            Err(TunnelError::Auth(reason)) => {
                anyhow::bail!("Relay refused the tunnel: {}. Check the token", reason);
            }
            Err(e) if cli.once => {
                return Err(e).context("Tunnel failed");
            }
            Err(e) => {
                tracing::error!("Tunnel error: {}", e);
                tracing::info!("Reconnecting in {:?}...", settings.reconnect_delay);
                tokio::select! {
                    _ = tokio::time::sleep(settings.reconnect_delay) => {}
                    _ = shutdown_signal() => break,
                }
            }
        }
    }

    tracing::info!("Client shutdown complete");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM");
        }
    }
}
