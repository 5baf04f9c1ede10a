use std::io::Cursor;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use rustls_pemfile::{certs, private_key};

use crate::TunnelError;

/// Load certificates from PEM content
pub fn load_certs_from_pem(pem_content: &str) -> Result<Vec<CertificateDer<'static>>, TunnelError> {
    let mut cursor = Cursor::new(pem_content.as_bytes());
    let certs = certs(&mut cursor)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TunnelError::Certificate(format!("Failed to parse certificates: {}", e)))?;

    if certs.is_empty() {
        return Err(TunnelError::Certificate(
            "No certificates found in PEM content".to_string(),
        ));
    }
    Ok(certs)
}

/// Load a private key from PEM content
pub fn load_private_key_from_pem(pem_content: &str) -> Result<PrivateKeyDer<'static>, TunnelError> {
    let mut cursor = Cursor::new(pem_content.as_bytes());
    private_key(&mut cursor)
        .map_err(|e| TunnelError::Certificate(format!("Failed to parse private key: {}", e)))?
        .ok_or_else(|| TunnelError::Certificate("No private key found in PEM content".to_string()))
}

/// Build the relay's TLS config (server certificate only, no client auth)
pub fn server_config_from_pem(cert_pem: &str, key_pem: &str) -> Result<ServerConfig, TunnelError> {
    let certs = load_certs_from_pem(cert_pem)?;
    let key = load_private_key_from_pem(key_pem)?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| TunnelError::Tls(format!("Failed to build server config: {}", e)))?;

    // The tunnel handshake is an HTTP/1.1 upgrade
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(config)
}

/// Build the tunnel client's TLS config
///
/// Trusts `ca_pem` when given (private relays), the bundled web PKI roots
/// otherwise.
pub fn client_config(ca_pem: Option<&str>) -> Result<ClientConfig, TunnelError> {
    let root_store = match ca_pem {
        Some(pem) => {
            let mut store = RootCertStore::empty();
            for cert in load_certs_from_pem(pem)? {
                store.add(cert).map_err(|e| {
                    TunnelError::Certificate(format!("Failed to add CA certificate: {}", e))
                })?;
            }
            store
        }
        None => RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        },
    };

    tracing::debug!(roots = root_store.len(), "Built client root store");

    let mut config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(config)
}
