//! Relay harness for end-to-end tests
//!
//! Starts a complete relay on an ephemeral port, optionally behind TLS
//! with generated certificates.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;

use hookrelay::ClientSettings;
use hookrelay_server::{ConnectionRegistry, RelayServer, RelaySettings};

use crate::certificates::TestCertificates;

/// Token every harness relay expects
pub const TEST_TOKEN: &str = "e2e-shared-token";

#[derive(Debug, Clone)]
pub struct RelayOptions {
    pub forward_timeout: Duration,
    pub tls: bool,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            forward_timeout: Duration::from_secs(10),
            tls: false,
        }
    }
}

/// A running relay
pub struct TestRelay {
    pub addr: SocketAddr,
    pub registry: Arc<ConnectionRegistry>,
    /// Present when the relay serves HTTPS
    pub certs: Option<Arc<TestCertificates>>,
    handle: JoinHandle<()>,
}

impl TestRelay {
    pub async fn start() -> Self {
        Self::start_with(RelayOptions::default()).await
    }

    pub async fn start_with(options: RelayOptions) -> Self {
        let certs = options.tls.then(|| Arc::new(TestCertificates::generate()));
        let tls_acceptor = certs.as_ref().map(|certs| {
            let config = hookrelay_common::tls::server_config_from_pem(
                &certs.server_cert_pem,
                &certs.server_key_pem,
            )
            .expect("Failed to load relay TLS config");
            TlsAcceptor::from(Arc::new(config))
        });

        let settings = RelaySettings {
            webhook_path: "/webhook".to_string(),
            tunnel_path: "/ws".to_string(),
            token: TEST_TOKEN.to_string(),
            forward_timeout: options.forward_timeout,
        };

        let registry = ConnectionRegistry::new();
        let server = RelayServer::new(settings, registry.clone(), tls_acceptor);

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind relay");
        let addr = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            if let Err(e) = server.run_with_listener(listener).await {
                tracing::error!("Relay error: {}", e);
            }
        });

        Self {
            addr,
            registry,
            certs,
            handle,
        }
    }

    /// `http://127.0.0.1:<port>` (or https)
    pub fn base_url(&self) -> String {
        let scheme = if self.certs.is_some() { "https" } else { "http" };
        format!("{}://{}", scheme, self.addr)
    }

    pub fn webhook_url(&self) -> String {
        format!("{}/webhook", self.base_url())
    }

    /// HTTP client for callers, trusting the relay's CA when TLS is on
    pub fn http_client(&self) -> reqwest::Client {
        let mut builder = reqwest::Client::builder();
        if let Some(certs) = &self.certs {
            let ca = reqwest::Certificate::from_pem(certs.ca_cert_pem.as_bytes())
                .expect("Failed to parse CA");
            builder = builder.add_root_certificate(ca);
        }
        builder.build().expect("Failed to build HTTP client")
    }

    /// Settings for a tunnel client that forwards to `forward_url`
    pub fn client_settings(&self, forward_url: &str) -> ClientSettings {
        ClientSettings {
            server_url: self.base_url(),
            tunnel_path: "/ws".to_string(),
            token: TEST_TOKEN.to_string(),
            forward_url: forward_url.to_string(),
            local_timeout: Duration::from_secs(5),
            preserve_path: false,
            ca_cert_pem: self.certs.as_ref().map(|c| c.ca_cert_pem.clone()),
            reconnect_delay: Duration::from_millis(100),
        }
    }

    /// Id of the active tunnel connection
    pub fn active_connection_id(&self) -> Option<u64> {
        self.registry.current().map(|c| c.id())
    }

    /// Poll until `condition` holds, panicking after a few seconds
    pub async fn wait_until(&self, what: &str, condition: impl Fn(&ConnectionRegistry) -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !condition(&self.registry) {
            if tokio::time::Instant::now() > deadline {
                panic!("Timed out waiting for {}", what);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Drop for TestRelay {
    fn drop(&mut self) {
        self.handle.abort();
        self.registry.shutdown();
    }
}
