//! Relay configuration with environment variable priority
//!
//! Configuration is resolved in this order (first found wins):
//! 1. Command-line flags
//! 2. Environment variables (HOOKRELAY_*)
//! 3. Config file (relay.toml)
//! 4. Default values (where applicable)

use std::env;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use hookrelay_common::secret;

use crate::server::RelaySettings;

/// Environment variable prefix
const ENV_PREFIX: &str = "HOOKRELAY";

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 8080;
const DEFAULT_WEBHOOK_PATH: &str = "/webhook";
const DEFAULT_TUNNEL_PATH: &str = "/ws";
const DEFAULT_FORWARD_TIMEOUT_SECS: u64 = 30;

/// Relay configuration (parsed from TOML, can be overridden by env)
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct RelayConfig {
    /// Interface to bind
    pub host: Option<String>,

    /// Port for webhooks and tunnel handshakes
    pub port: Option<u16>,

    /// Path inbound webhooks are accepted on
    #[serde(alias = "http_endpoint")]
    pub webhook_path: Option<String>,

    /// Path tunnel clients connect to
    pub tunnel_path: Option<String>,

    /// Shared bearer token (env://, file://, absolute path, or literal)
    #[serde(alias = "auth_token")]
    pub token: Option<String>,

    /// Seconds to wait for the tunnel client to answer
    pub forward_timeout_secs: Option<u64>,

    /// Certificate PEM for serving HTTPS (env://, file://, path, or PEM)
    pub tls_cert: Option<String>,

    /// Private key PEM for serving HTTPS
    pub tls_key: Option<String>,
}

/// Resolved relay configuration with actual secret values
#[derive(Debug)]
pub struct ResolvedRelayConfig {
    pub host: String,
    pub port: u16,
    pub webhook_path: String,
    pub tunnel_path: String,
    pub token: String,
    pub forward_timeout: Duration,
    /// `(cert_pem, key_pem)` when HTTPS is enabled
    pub tls: Option<(String, String)>,
}

/// Get environment variable with prefix
fn get_env(name: &str) -> Option<String> {
    env::var(format!("{}_{}", ENV_PREFIX, name)).ok()
}

fn get_env_parsed<T: std::str::FromStr>(name: &str) -> anyhow::Result<Option<T>> {
    match get_env(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| anyhow::anyhow!("Invalid value for {}_{}: '{}'", ENV_PREFIX, name, raw)),
        None => Ok(None),
    }
}

fn validate_path(kind: &str, path: &str) -> anyhow::Result<()> {
    if !path.starts_with('/') {
        anyhow::bail!("{} must start with '/', got '{}'", kind, path);
    }
    Ok(())
}

impl RelayConfig {
    /// Load configuration from a TOML file (optional)
    pub fn load(path: &str) -> Self {
        if Path::new(path).exists() {
            match std::fs::read_to_string(path) {
                Ok(content) => match toml::from_str(&content) {
                    Ok(config) => {
                        tracing::info!("Loaded config from {}", path);
                        return config;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to parse {}: {}", path, e);
                    }
                },
                Err(e) => {
                    tracing::warn!("Failed to read {}: {}", path, e);
                }
            }
        }
        Self::default()
    }

    /// Resolve configuration from environment variables first, then config file
    pub fn resolve(self) -> anyhow::Result<ResolvedRelayConfig> {
        self.resolve_with(RelayConfig::default())
    }

    /// Resolve with `overrides` (command-line flags) ahead of the environment
    pub fn resolve_with(self, overrides: RelayConfig) -> anyhow::Result<ResolvedRelayConfig> {
        let host = overrides
            .host
            .or_else(|| get_env("HOST"))
            .or(self.host)
            .unwrap_or_else(|| DEFAULT_HOST.to_string());

        let port = match overrides.port {
            Some(port) => Some(port),
            None => get_env_parsed::<u16>("PORT")?,
        }
        .or(self.port)
        .unwrap_or(DEFAULT_PORT);
        if port == 0 {
            anyhow::bail!("Port must be between 1 and 65535");
        }

        let webhook_path = overrides
            .webhook_path
            .or_else(|| get_env("WEBHOOK_PATH"))
            .or(self.webhook_path)
            .unwrap_or_else(|| DEFAULT_WEBHOOK_PATH.to_string());
        validate_path("Webhook path", &webhook_path)?;

        let tunnel_path = overrides
            .tunnel_path
            .or_else(|| get_env("TUNNEL_PATH"))
            .or(self.tunnel_path)
            .unwrap_or_else(|| DEFAULT_TUNNEL_PATH.to_string());
        validate_path("Tunnel path", &tunnel_path)?;

        if webhook_path == tunnel_path {
            anyhow::bail!("Webhook path and tunnel path must differ ('{}')", webhook_path);
        }

        let forward_timeout_secs = match overrides.forward_timeout_secs {
            Some(secs) => Some(secs),
            None => get_env_parsed::<u64>("FORWARD_TIMEOUT_SECS")?,
        }
        .or(self.forward_timeout_secs)
            .unwrap_or(DEFAULT_FORWARD_TIMEOUT_SECS);
        if forward_timeout_secs == 0 {
            anyhow::bail!("Forward timeout must be at least one second");
        }

        // Token: flag > ENV > ENV_FILE > config > required
        let token_source = overrides
            .token
            .or_else(|| get_env("TOKEN"))
            .or_else(|| get_env("TOKEN_FILE").map(|f| format!("file://{}", f)))
            .or(self.token)
            .ok_or_else(|| {
                anyhow::anyhow!("Token required. Set HOOKRELAY_TOKEN, HOOKRELAY_TOKEN_FILE, or token in config")
            })?;
        let token = secret::resolve_str(&token_source)
            .map_err(|e| anyhow::anyhow!("Failed to resolve token: {}", e))?;
        if token.is_empty() {
            anyhow::bail!("Token must not be empty");
        }

        let tls_cert = overrides
            .tls_cert
            .or_else(|| get_env("TLS_CERT"))
            .or(self.tls_cert);
        let tls_key = overrides
            .tls_key
            .or_else(|| get_env("TLS_KEY"))
            .or(self.tls_key);
        let tls = match (tls_cert, tls_key) {
            (Some(cert), Some(key)) => {
                let cert_pem = secret::resolve_str(&cert)
                    .map_err(|e| anyhow::anyhow!("Failed to resolve TLS certificate: {}", e))?;
                let key_pem = secret::resolve_str(&key)
                    .map_err(|e| anyhow::anyhow!("Failed to resolve TLS key: {}", e))?;
                Some((cert_pem, key_pem))
            }
            (None, None) => None,
            _ => anyhow::bail!("Both tls_cert and tls_key are required to serve HTTPS"),
        };

        Ok(ResolvedRelayConfig {
            host,
            port,
            webhook_path,
            tunnel_path,
            token,
            forward_timeout: Duration::from_secs(forward_timeout_secs),
            tls,
        })
    }

    /// Load config file and resolve it under flag and environment overrides
    pub fn load_and_resolve(
        path: &str,
        overrides: RelayConfig,
    ) -> anyhow::Result<ResolvedRelayConfig> {
        Self::load(path).resolve_with(overrides)
    }
}

impl ResolvedRelayConfig {
    /// Resolve `host` (an IP or a hostname such as `localhost`) to a bind address
    pub async fn listen_addr(&self) -> anyhow::Result<SocketAddr> {
        tokio::net::lookup_host((self.host.as_str(), self.port))
            .await
            .map_err(|e| anyhow::anyhow!("Invalid listen address {}:{}: {}", self.host, self.port, e))?
            .next()
            .ok_or_else(|| anyhow::anyhow!("{} did not resolve to any address", self.host))
    }

    pub fn settings(&self) -> RelaySettings {
        RelaySettings {
            webhook_path: self.webhook_path.clone(),
            tunnel_path: self.tunnel_path.clone(),
            token: self.token.clone(),
            forward_timeout: self.forward_timeout,
        }
    }
}
