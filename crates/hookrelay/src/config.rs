//! Tunnel client configuration
//!
//! Connection settings can live in `~/.config/hookrelay/client.toml`;
//! command-line flags (and their `HOOKRELAY_*` env fallbacks) take
//! precedence over anything in the file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use hookrelay_common::{secret, TunnelError};

const DEFAULT_TUNNEL_PATH: &str = "/ws";
const DEFAULT_LOCAL_TIMEOUT_SECS: u64 = 25;
const DEFAULT_RECONNECT_DELAY_SECS: u64 = 5;

/// Client configuration as read from a file or assembled from flags
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Relay base URL (http://, https://, ws:// or wss://)
    #[serde(alias = "server_url")]
    pub server: Option<String>,

    /// Shared bearer token (env://, file://, absolute path, or literal)
    #[serde(alias = "auth_token")]
    pub token: Option<String>,

    /// Local base URL that forwarded requests are sent to
    #[serde(alias = "forward_endpoint")]
    pub forward_url: Option<String>,

    /// Path of the relay's tunnel endpoint
    pub tunnel_path: Option<String>,

    /// Seconds allowed for each local call
    pub local_timeout_secs: Option<u64>,

    /// Append the inbound request's path and query to `forward_url`
    pub preserve_path: Option<bool>,

    /// CA certificate PEM to trust instead of the public roots
    pub ca_cert: Option<String>,

    /// Seconds to wait before reconnecting
    pub reconnect_delay_secs: Option<u64>,
}

/// Fully resolved client settings
#[derive(Debug, Clone)]
pub struct ClientSettings {
    /// Relay base URL, `http://` or `https://`, no trailing slash
    pub server_url: String,
    pub tunnel_path: String,
    pub token: String,
    pub forward_url: String,
    pub local_timeout: Duration,
    pub preserve_path: bool,
    pub ca_cert_pem: Option<String>,
    pub reconnect_delay: Duration,
}

impl ClientConfig {
    /// Get the default config directory path
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("hookrelay")
    }

    /// Get the default config file path
    pub fn default_path() -> PathBuf {
        Self::config_dir().join("client.toml")
    }

    /// Load configuration from a specific path
    pub fn load(path: &Path) -> Result<Self, TunnelError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            TunnelError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        toml::from_str(&content)
            .map_err(|e| TunnelError::Config(format!("Failed to parse {}: {}", path.display(), e)))
    }

    /// Load the file if it exists
    pub fn try_load(path: &Path) -> Result<Option<Self>, TunnelError> {
        if path.exists() {
            Self::load(path).map(Some)
        } else {
            Ok(None)
        }
    }

    /// Fill every unset field from `fallback`
    pub fn or(self, fallback: ClientConfig) -> ClientConfig {
        ClientConfig {
            server: self.server.or(fallback.server),
            token: self.token.or(fallback.token),
            forward_url: self.forward_url.or(fallback.forward_url),
            tunnel_path: self.tunnel_path.or(fallback.tunnel_path),
            local_timeout_secs: self.local_timeout_secs.or(fallback.local_timeout_secs),
            preserve_path: self.preserve_path.or(fallback.preserve_path),
            ca_cert: self.ca_cert.or(fallback.ca_cert),
            reconnect_delay_secs: self.reconnect_delay_secs.or(fallback.reconnect_delay_secs),
        }
    }

    /// Validate, apply defaults and resolve secrets
    pub fn resolve(self) -> Result<ClientSettings, TunnelError> {
        let server = self.server.ok_or_else(|| {
            TunnelError::Config("Relay URL required. Use --server or set server in config".into())
        })?;
        let server_url = normalize_server_url(&server)?;

        let forward_url = self.forward_url.ok_or_else(|| {
            TunnelError::Config(
                "Forward URL required. Use --forward-url (e.g. http://127.0.0.1:3000/hook)".into(),
            )
        })?;
        if !(forward_url.starts_with("http://") || forward_url.starts_with("https://")) {
            return Err(TunnelError::Config(format!(
                "Forward URL must be http:// or https://, got '{}'",
                forward_url
            )));
        }

        let token_source = self.token.ok_or_else(|| {
            TunnelError::Config("Token required. Use --token or set token in config".into())
        })?;
        let token = secret::resolve_str(&token_source)?;
        if token.is_empty() {
            return Err(TunnelError::Config("Token must not be empty".into()));
        }

        let tunnel_path = self
            .tunnel_path
            .unwrap_or_else(|| DEFAULT_TUNNEL_PATH.to_string());
        if !tunnel_path.starts_with('/') {
            return Err(TunnelError::Config(format!(
                "Tunnel path must start with '/', got '{}'",
                tunnel_path
            )));
        }

        let local_timeout_secs = self.local_timeout_secs.unwrap_or(DEFAULT_LOCAL_TIMEOUT_SECS);
        if local_timeout_secs == 0 {
            return Err(TunnelError::Config(
                "Local timeout must be at least one second".into(),
            ));
        }

        let ca_cert_pem = self
            .ca_cert
            .map(|source| secret::resolve_str(&source))
            .transpose()?;

        Ok(ClientSettings {
            server_url,
            tunnel_path,
            token,
            forward_url,
            local_timeout: Duration::from_secs(local_timeout_secs),
            preserve_path: self.preserve_path.unwrap_or(false),
            ca_cert_pem,
            reconnect_delay: Duration::from_secs(
                self.reconnect_delay_secs
                    .unwrap_or(DEFAULT_RECONNECT_DELAY_SECS),
            ),
        })
    }
}

impl ClientSettings {
    /// Full URL of the relay's tunnel endpoint
    pub fn tunnel_url(&self) -> String {
        format!("{}{}", self.server_url, self.tunnel_path)
    }
}

/// Map websocket-style schemes onto HTTP and drop any trailing slash
fn normalize_server_url(raw: &str) -> Result<String, TunnelError> {
    let trimmed = raw.trim().trim_end_matches('/');
    let normalized = if let Some(rest) = trimmed.strip_prefix("wss://") {
        format!("https://{}", rest)
    } else if let Some(rest) = trimmed.strip_prefix("ws://") {
        format!("http://{}", rest)
    } else if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        return Err(TunnelError::Config(format!(
            "Relay URL must start with http://, https://, ws:// or wss://, got '{}'",
            raw
        )));
    };
    Ok(normalized)
}
