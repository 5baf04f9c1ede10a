//! Test certificate generation using rcgen
//!
//! Produces a private CA and a relay certificate for `localhost` /
//! `127.0.0.1`, so HTTPS relays can be exercised without fixture files.

use std::net::{IpAddr, Ipv4Addr};

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, Issuer, KeyPair,
};

/// A CA plus a relay certificate it signed
#[derive(Clone)]
pub struct TestCertificates {
    /// CA certificate PEM (what tunnel clients and callers trust)
    pub ca_cert_pem: String,
    /// Relay certificate PEM
    pub server_cert_pem: String,
    /// Relay private key PEM
    pub server_key_pem: String,
}

impl TestCertificates {
    pub fn generate() -> Self {
        let ca_key = KeyPair::generate().expect("Failed to generate CA key");

        let mut ca_params = CertificateParams::default();
        ca_params.distinguished_name = {
            let mut dn = DistinguishedName::new();
            dn.push(DnType::CommonName, "hookrelay Test CA");
            dn
        };
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        ca_params.key_usages = vec![
            rcgen::KeyUsagePurpose::KeyCertSign,
            rcgen::KeyUsagePurpose::CrlSign,
        ];

        let ca_cert = ca_params
            .clone()
            .self_signed(&ca_key)
            .expect("Failed to create CA cert");
        let ca_issuer = Issuer::new(ca_params, ca_key);

        let server_key = KeyPair::generate().expect("Failed to generate relay key");
        let mut server_params = CertificateParams::default();
        server_params.distinguished_name = {
            let mut dn = DistinguishedName::new();
            dn.push(DnType::CommonName, "localhost");
            dn
        };
        server_params.subject_alt_names = vec![
            rcgen::SanType::DnsName("localhost".try_into().unwrap()),
            rcgen::SanType::IpAddress(IpAddr::V4(Ipv4Addr::LOCALHOST)),
        ];
        server_params.key_usages = vec![
            rcgen::KeyUsagePurpose::DigitalSignature,
            rcgen::KeyUsagePurpose::KeyEncipherment,
        ];
        server_params.extended_key_usages = vec![rcgen::ExtendedKeyUsagePurpose::ServerAuth];

        let server_cert = server_params
            .signed_by(&server_key, &ca_issuer)
            .expect("Failed to create relay cert");

        Self {
            ca_cert_pem: ca_cert.pem(),
            server_cert_pem: server_cert.pem(),
            server_key_pem: server_key.serialize_pem(),
        }
    }
}
