//! Secret references used in configuration
//!
//! Tokens and PEM material can be given inline or pointed at:
//!
//! - `env://VAR_NAME` reads an environment variable
//! - `file:///path/to/file` (or a bare absolute path) reads a file
//! - anything else is taken literally

use std::path::PathBuf;
use std::str::FromStr;

use crate::TunnelError;

#[derive(Debug, Clone, PartialEq)]
pub enum SecretRef {
    Plain(String),
    Env { var_name: String },
    File { path: PathBuf },
}

impl SecretRef {
    /// Backend name for logging
    pub fn backend_name(&self) -> &'static str {
        match self {
            SecretRef::Plain(_) => "plain",
            SecretRef::Env { .. } => "env",
            SecretRef::File { .. } => "file",
        }
    }

    /// Resolve to the secret value, trimmed of surrounding whitespace
    pub fn resolve(&self) -> Result<String, TunnelError> {
        tracing::debug!(backend = self.backend_name(), "Resolving secret");

        let value = match self {
            SecretRef::Plain(value) => value.clone(),
            SecretRef::Env { var_name } => std::env::var(var_name).map_err(|_| {
                TunnelError::Config(format!("Environment variable '{}' not set", var_name))
            })?,
            SecretRef::File { path } => std::fs::read_to_string(path).map_err(|e| {
                TunnelError::Config(format!("Failed to read '{}': {}", path.display(), e))
            })?,
        };

        Ok(value.trim().to_string())
    }
}

impl FromStr for SecretRef {
    type Err = TunnelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(var_name) = s.strip_prefix("env://") {
            if var_name.is_empty() {
                return Err(TunnelError::Config(format!(
                    "Invalid secret reference '{}': missing variable name",
                    s
                )));
            }
            Ok(SecretRef::Env {
                var_name: var_name.to_string(),
            })
        } else if let Some(path) = s.strip_prefix("file://") {
            if path.is_empty() {
                return Err(TunnelError::Config(format!(
                    "Invalid secret reference '{}': missing path",
                    s
                )));
            }
            Ok(SecretRef::File {
                path: PathBuf::from(path),
            })
        } else if s.starts_with('/') && !s.contains('\n') {
            Ok(SecretRef::File {
                path: PathBuf::from(s),
            })
        } else {
            Ok(SecretRef::Plain(s.to_string()))
        }
    }
}

/// Parse and resolve a secret reference in one step
pub fn resolve_str(source: &str) -> Result<String, TunnelError> {
    source.parse::<SecretRef>()?.resolve()
}
