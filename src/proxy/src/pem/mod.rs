//! Self-signed CA + server certificate generation (spec §4.I), used by the
//! `gen-pem` subcommand and (when the `tls` feature is enabled) by the
//! listener to bootstrap a default certificate.
//!
//! Grounded on `examples/original_source/pkg/generatepem/generatepem.go`
//! for the key-type-selection rules and certificate template, and on
//! `examples/dotindustries-warpgrid/crates/warpgrid-cluster/src/tls.rs` for
//! idiomatic `rcgen` 0.13 usage (`CertificateParams::default()`,
//! `self_signed`/`signed_by`, `SanType`).

use std::net::IpAddr;
use std::time::{Duration, SystemTime};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair, KeyUsagePurpose,
    SanType,
};
use rsa::pkcs8::EncodePrivateKey;
use thiserror::Error;

use crate::config::PemConfig;

#[cfg(feature = "tls")]
use tokio_rustls::rustls;

#[derive(Debug, Error)]
pub enum PemError {
    #[error("unrecognized elliptic curve: {0:?}")]
    UnrecognizedCurve(String),
    #[error("failed to generate private key: {0}")]
    KeyGeneration(String),
    #[error("certificate generation failed: {0}")]
    Certificate(#[from] rcgen::Error),
    #[cfg(feature = "tls")]
    #[error("malformed PEM block: {0}")]
    MalformedPem(String),
    #[cfg(feature = "tls")]
    #[error("failed to build TLS server config: {0}")]
    Rustls(#[from] rustls::Error),
}

/// A certificate, its private key, and its public key, each PEM-encoded —
/// mirrors the Go source's `Pems{Cert, Key, Public}`.
#[derive(Debug, Clone)]
pub struct PemTriple {
    pub cert: String,
    pub key: String,
    pub public: String,
}

/// Generates a CA certificate and a server certificate issued by it,
/// both signed with the *same* key pair — reproducing the original
/// source's `Generate()`, which reuses one `priv` for both templates.
/// This is a deliberate compatibility choice, not a recommended TLS
/// topology; see `DESIGN.md`.
pub fn generate(config: &PemConfig) -> Result<(PemTriple, PemTriple), PemError> {
    let key_pair = generate_key_pair(config)?;
    let is_rsa = config.ecdsa_curve.is_empty() && !config.ed25519;

    let mut key_usages = vec![KeyUsagePurpose::DigitalSignature];
    if is_rsa {
        key_usages.push(KeyUsagePurpose::KeyEncipherment);
    }

    let not_before = SystemTime::now();
    let not_after = not_before + Duration::from_secs(config.valid_for_days as u64 * 24 * 3600);

    let mut dn = DistinguishedName::new();
    dn.push(DnType::OrganizationName, "Acme Co");

    let mut server_params = CertificateParams::default();
    server_params.distinguished_name = dn.clone();
    server_params.key_usages = key_usages.clone();
    server_params.extended_key_usages = vec![rcgen::ExtendedKeyUsagePurpose::ServerAuth];
    server_params.not_before = not_before.into();
    server_params.not_after = not_after.into();
    server_params.subject_alt_names = host_sans(&config.host)?;

    let mut ca_params = server_params.clone();
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    let mut ca_key_usages = key_usages;
    ca_key_usages.push(KeyUsagePurpose::KeyCertSign);
    ca_params.key_usages = ca_key_usages;

    let ca_cert = ca_params.self_signed(&key_pair)?;
    let server_cert = server_params.signed_by(&key_pair, &ca_cert, &key_pair)?;

    let public_pem = to_pem("PUBLIC KEY", &key_pair.public_key_der());
    let key_pem = key_pair.serialize_pem();

    let ca = PemTriple {
        cert: ca_cert.pem(),
        key: key_pem.clone(),
        public: public_pem.clone(),
    };
    let server = PemTriple {
        cert: server_cert.pem(),
        key: key_pem,
        public: public_pem,
    };
    Ok((ca, server))
}

fn generate_key_pair(config: &PemConfig) -> Result<KeyPair, PemError> {
    match config.ecdsa_curve.as_str() {
        "" => {
            if config.ed25519 {
                KeyPair::generate_for(&rcgen::PKCS_ED25519)
                    .map_err(|e| PemError::KeyGeneration(e.to_string()))
            } else {
                generate_rsa_key_pair(config.rsa_bits)
            }
        }
        "P256" => KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
            .map_err(|e| PemError::KeyGeneration(e.to_string())),
        "P384" => KeyPair::generate_for(&rcgen::PKCS_ECDSA_P384_SHA384)
            .map_err(|e| PemError::KeyGeneration(e.to_string())),
        // `ring` (rcgen's crypto backend) has no P224/P521 support; the
        // original source's Go implementation covers both via stdlib
        // `crypto/elliptic`, but there is no equivalent-fidelity Rust
        // path without vendoring a second elliptic-curve backend.
        other => Err(PemError::UnrecognizedCurve(other.to_string())),
    }
}

fn generate_rsa_key_pair(bits: usize) -> Result<KeyPair, PemError> {
    let mut rng = rand::rngs::OsRng;
    let private_key = rsa::RsaPrivateKey::new(&mut rng, bits)
        .map_err(|e| PemError::KeyGeneration(e.to_string()))?;
    let der = private_key
        .to_pkcs8_der()
        .map_err(|e| PemError::KeyGeneration(e.to_string()))?;
    KeyPair::from_der_and_sign_algo(der.as_bytes(), &rcgen::PKCS_RSA_SHA256)
        .map_err(|e| PemError::KeyGeneration(e.to_string()))
}

fn host_sans(host: &str) -> Result<Vec<SanType>, PemError> {
    let mut sans = Vec::new();
    for entry in host.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        if let Ok(ip) = entry.parse::<IpAddr>() {
            sans.push(SanType::IpAddress(ip));
        } else {
            let dns = entry
                .to_string()
                .try_into()
                .map_err(|_| PemError::KeyGeneration(format!("invalid DNS name: {entry}")))?;
            sans.push(SanType::DnsName(dns));
        }
    }
    Ok(sans)
}

/// Builds a `rustls::ServerConfig` from a [`PemTriple`]'s cert and key,
/// for the listener's bootstrap TLS identity. There is no client-cert
/// verification — the source never asks the backend for one either.
///
/// No `rustls-pemfile` dependency exists in this workspace, so PEM blocks
/// are decoded by hand, symmetric with [`to_pem`]'s encoder above.
#[cfg(feature = "tls")]
pub fn to_server_config(server: &PemTriple) -> Result<rustls::ServerConfig, PemError> {
    use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

    let cert_der = CertificateDer::from(decode_pem_block(&server.cert)?);
    let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(decode_pem_block(&server.key)?));

    let config = rustls::ServerConfig::builder_with_provider(
        rustls::crypto::ring::default_provider().into(),
    )
    .with_safe_default_protocol_versions()?
    .with_no_client_auth()
    .with_single_cert(vec![cert_der], key_der)?;
    Ok(config)
}

#[cfg(feature = "tls")]
fn decode_pem_block(pem: &str) -> Result<Vec<u8>, PemError> {
    let body: String = pem
        .lines()
        .filter(|line| !line.starts_with("-----"))
        .collect();
    STANDARD
        .decode(body)
        .map_err(|e| PemError::MalformedPem(e.to_string()))
}

fn to_pem(label: &str, der: &[u8]) -> String {
    let encoded = STANDARD.encode(der);
    let mut out = format!("-----BEGIN {label}-----\n");
    for chunk in encoded.as_bytes().chunks(64) {
        out.push_str(std::str::from_utf8(chunk).expect("base64 alphabet is ascii"));
        out.push('\n');
    }
    out.push_str(&format!("-----END {label}-----\n"));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(ecdsa_curve: &str, ed25519: bool) -> PemConfig {
        PemConfig {
            host: "localhost,127.0.0.1".to_string(),
            valid_for_days: 1,
            rsa_bits: 2048,
            ecdsa_curve: ecdsa_curve.to_string(),
            ed25519,
        }
    }

    #[test]
    fn rsa_pair_has_cert_key_and_public_pem_blocks() {
        let (ca, server) = generate(&config("", false)).unwrap();
        assert!(ca.cert.contains("BEGIN CERTIFICATE"));
        assert!(ca.key.contains("BEGIN PRIVATE KEY"));
        assert!(ca.public.contains("BEGIN PUBLIC KEY"));
        assert!(server.cert.contains("BEGIN CERTIFICATE"));
        assert_ne!(ca.cert, server.cert);
    }

    #[test]
    fn ed25519_pair_generates() {
        let (ca, server) = generate(&config("", true)).unwrap();
        assert!(ca.cert.contains("BEGIN CERTIFICATE"));
        assert!(server.cert.contains("BEGIN CERTIFICATE"));
    }

    #[test]
    fn p256_curve_generates() {
        let (ca, _server) = generate(&config("P256", false)).unwrap();
        assert!(ca.cert.contains("BEGIN CERTIFICATE"));
    }

    #[test]
    fn unrecognized_curve_is_rejected() {
        let err = generate(&config("P999", false)).unwrap_err();
        assert!(matches!(err, PemError::UnrecognizedCurve(_)));
    }

    #[cfg(feature = "tls")]
    #[test]
    fn server_triple_builds_a_rustls_config() {
        let (_ca, server) = generate(&config("", false)).unwrap();
        to_server_config(&server).unwrap();
    }
}
