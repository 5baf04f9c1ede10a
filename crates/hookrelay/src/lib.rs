//! hookrelay tunnel client
//!
//! Keeps one authenticated connection open to a relay and executes every
//! request the relay pushes through it against a local HTTP service.

pub mod config;
pub mod connector;
pub mod forwarder;

use std::future::Future;

use hookrelay_common::TunnelError;

pub use config::{ClientConfig, ClientSettings};
pub use connector::{dial, TunnelConnection};
pub use forwarder::LocalForwarder;

/// Dial the relay and serve the tunnel until it drops or `shutdown` fires
pub async fn run_tunnel<F>(settings: &ClientSettings, shutdown: F) -> Result<(), TunnelError>
where
    F: Future<Output = ()>,
{
    let forwarder = LocalForwarder::new(
        settings.forward_url.clone(),
        settings.preserve_path,
        settings.local_timeout,
    )?;

    tracing::info!("Connecting to {}...", settings.tunnel_url());
    let io = dial(settings).await?;
    TunnelConnection::new(io, forwarder).run(shutdown).await
}
