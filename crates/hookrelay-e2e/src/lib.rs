//! End-to-end test utilities for hookrelay
//!
//! Runs a real relay on an ephemeral port together with either the real
//! tunnel client or a hand-driven protocol client, plus a local HTTP
//! service for the client to forward to.

pub mod certificates;
pub mod harness;
pub mod mock_service;
pub mod raw_client;
pub mod test_client;

pub use certificates::TestCertificates;
pub use harness::{RelayOptions, TestRelay};
pub use mock_service::{MockHttpService, RecordedRequest};
pub use raw_client::RawTunnelClient;
pub use test_client::TestTunnelClient;
