mod error;
mod headers;
pub mod secret;
pub mod tls;

pub use error::TunnelError;
pub use headers::is_hop_by_hop;
pub use secret::SecretRef;
