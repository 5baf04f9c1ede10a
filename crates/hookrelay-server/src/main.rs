use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_rustls::TlsAcceptor;
use tracing_subscriber::EnvFilter;

use hookrelay_server::{ConnectionRegistry, RelayConfig, RelayServer};

/// Webhook relay - receives public webhooks and tunnels them to a client
#[derive(Parser, Debug)]
#[command(name = "hookrelay-server")]
#[command(about = "Public relay that forwards webhooks through a reverse tunnel")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "relay.toml")]
    config: String,

    /// Interface to bind (IP or hostname)
    #[arg(long, env = "HOOKRELAY_HOST")]
    host: Option<String>,

    /// Port for webhooks and tunnel handshakes
    #[arg(short, long, env = "HOOKRELAY_PORT")]
    port: Option<u16>,

    /// Path inbound webhooks are accepted on
    #[arg(long, alias = "http-endpoint", env = "HOOKRELAY_WEBHOOK_PATH")]
    webhook_path: Option<String>,

    /// Path tunnel clients connect to
    #[arg(long, env = "HOOKRELAY_TUNNEL_PATH")]
    tunnel_path: Option<String>,

    /// Shared token (env://VAR, file:///path, or literal)
    #[arg(short, long, env = "HOOKRELAY_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Seconds to wait for the tunnel client to answer
    #[arg(long, env = "HOOKRELAY_FORWARD_TIMEOUT_SECS")]
    forward_timeout: Option<u64>,

    /// Certificate PEM for serving HTTPS (env://, file://, path, or PEM)
    #[arg(long, env = "HOOKRELAY_TLS_CERT")]
    tls_cert: Option<String>,

    /// Private key PEM for serving HTTPS
    #[arg(long, env = "HOOKRELAY_TLS_KEY", hide_env_values = true)]
    tls_key: Option<String>,
}

impl Args {
    /// Flags given on the command line, as config overrides
    fn overrides(&self) -> RelayConfig {
        RelayConfig {
            host: self.host.clone(),
            port: self.port,
            webhook_path: self.webhook_path.clone(),
            tunnel_path: self.tunnel_path.clone(),
            token: self.token.clone(),
            forward_timeout_secs: self.forward_timeout,
            tls_cert: self.tls_cert.clone(),
            tls_key: self.tls_key.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Install crypto provider before any TLS operations
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("hookrelay_server=info".parse()?)
                .add_directive("hookrelay_common=info".parse()?),
        )
        .init();

    let args = Args::parse();
    tracing::info!("Starting relay with config: {}", args.config);

    let config = RelayConfig::load_and_resolve(&args.config, args.overrides())
        .with_context(|| format!("Failed to load config from {}", args.config))?;

    let tls_acceptor = match &config.tls {
        Some((cert_pem, key_pem)) => {
            let tls_config = hookrelay_common::tls::server_config_from_pem(cert_pem, key_pem)
                .context("Failed to load TLS configuration")?;
            tracing::info!("TLS enabled");
            Some(TlsAcceptor::from(Arc::new(tls_config)))
        }
        None => {
            tracing::info!("TLS disabled (plain HTTP)");
            None
        }
    };

    let addr = config.listen_addr().await?;
    let registry = ConnectionRegistry::new();
    let server = RelayServer::new(config.settings(), registry.clone(), tls_acceptor);

    tokio::select! {
        result = server.run(addr) => {
            tracing::error!("Relay stopped: {:?}", result);
            result?;
        }
        _ = shutdown_signal() => {
            tracing::info!("Shutdown signal received, closing tunnel...");
        }
    }

    registry.shutdown();
    tracing::info!("Relay shutdown complete");
    Ok(())
}

/// Wait for shutdown signals (SIGTERM, SIGINT)
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_become_overrides() {
        let args = Args::try_parse_from([
            "hookrelay-server",
            "--host",
            "localhost",
            "--port",
            "9000",
            "--http-endpoint",
            "/hooks",
            "--token",
            "s3cret",
        ])
        .unwrap();

        let overrides = args.overrides();
        assert_eq!(overrides.host.as_deref(), Some("localhost"));
        assert_eq!(overrides.port, Some(9000));
        assert_eq!(overrides.webhook_path.as_deref(), Some("/hooks"));
        assert_eq!(overrides.token.as_deref(), Some("s3cret"));
        assert_eq!(args.config, "relay.toml");

        let resolved = RelayConfig::default().resolve_with(overrides).unwrap();
        assert_eq!(resolved.webhook_path, "/hooks");
    }
}
