//! hookrelay relay
//!
//! Accepts inbound webhook calls on a public endpoint and pushes each one
//! through the single authenticated tunnel client, replaying the client's
//! answer to the original caller.

pub mod config;
mod connection;
pub mod forwarder;
mod registry;
pub mod server;
pub mod session;

pub use config::{RelayConfig, ResolvedRelayConfig};
pub use connection::TunnelConnection;
pub use forwarder::{Forwarder, ParsedRequest, DEFAULT_FORWARD_TIMEOUT};
pub use registry::ConnectionRegistry;
pub use server::{RelayServer, RelaySettings};
