//! TLS material loading and per-host certificate selection.
//!
//! Every declared host may carry its own certificate pair; SNI picks the
//! matching one and anything else falls back to the default host's pair.
//! Client certificates are never validated against a CA; they are captured
//! during the handshake so write authorization can check the fingerprint.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use rustls::crypto::aws_lc_rs;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::{DigitallySignedStruct, DistinguishedName, SignatureScheme};
use sha2::{Digest, Sha256};
use smol_str::SmolStr;

use crate::config::Config;
use crate::error::ServerError;

/// Build the rustls server configuration for the current [`Config`].
///
/// `request_client_certs` is set when a fingerprint authorizer is
/// registered; without one the handshake never asks for a certificate.
pub fn server_config(
    config: &Config,
    request_client_certs: bool,
) -> Result<Arc<rustls::ServerConfig>, ServerError> {
    let mut by_host = HashMap::new();
    let mut cache: HashMap<(String, String), Arc<CertifiedKey>> = HashMap::new();
    for host in &config.hosts {
        let cache_key = (
            host.cert_file.display().to_string(),
            host.key_file.display().to_string(),
        );
        let key = match cache.get(&cache_key) {
            Some(key) => key.clone(),
            None => {
                let key = Arc::new(load_certified_key(&host.cert_file, &host.key_file)?);
                cache.insert(cache_key, key.clone());
                key
            }
        };
        by_host.insert(host.name.to_string(), key);
    }
    let default = by_host
        .get(config.default_host().as_str())
        .cloned()
        .ok_or_else(|| ServerError::Certificate("no default certificate".into()))?;
    let resolver = Arc::new(HostCertResolver { by_host, default });

    let builder = rustls::ServerConfig::builder();
    let tls = if request_client_certs {
        builder
            .with_client_cert_verifier(Arc::new(CaptureClientCert::new()))
            .with_cert_resolver(resolver)
    } else {
        builder.with_no_client_auth().with_cert_resolver(resolver)
    };
    Ok(Arc::new(tls))
}

/// Load a PEM certificate chain and private key into a signing key.
pub fn load_certified_key(
    cert_file: &Path,
    key_file: &Path,
) -> Result<CertifiedKey, ServerError> {
    let cert_pem = std::fs::read(cert_file).map_err(|err| {
        ServerError::Certificate(SmolStr::new(format!("{}: {err}", cert_file.display())))
    })?;
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_pem.as_slice())
        .collect::<Result<_, _>>()
        .map_err(|err| {
            ServerError::Certificate(SmolStr::new(format!("{}: {err}", cert_file.display())))
        })?;
    if certs.is_empty() {
        return Err(ServerError::Certificate(SmolStr::new(format!(
            "{}: no certificates found",
            cert_file.display()
        ))));
    }
    let key_pem = std::fs::read(key_file).map_err(|err| {
        ServerError::Certificate(SmolStr::new(format!("{}: {err}", key_file.display())))
    })?;
    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut key_pem.as_slice())
        .map_err(|err| {
            ServerError::Certificate(SmolStr::new(format!("{}: {err}", key_file.display())))
        })?
        .ok_or_else(|| {
            ServerError::Certificate(SmolStr::new(format!(
                "{}: no private key found",
                key_file.display()
            )))
        })?;
    let signing_key = aws_lc_rs::sign::any_supported_type(&key)
        .map_err(|err| ServerError::Certificate(SmolStr::new(err.to_string())))?;
    Ok(CertifiedKey::new(certs, signing_key))
}

/// SHA-256 fingerprint of a DER certificate, `sha256:` prefixed, lowercase hex.
#[must_use]
pub fn fingerprint(der: &[u8]) -> String {
    let digest = Sha256::digest(der);
    let mut out = String::with_capacity(7 + digest.len() * 2);
    out.push_str("sha256:");
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

struct HostCertResolver {
    by_host: HashMap<String, Arc<CertifiedKey>>,
    default: Arc<CertifiedKey>,
}

impl std::fmt::Debug for HostCertResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostCertResolver")
            .field("hosts", &self.by_host.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ResolvesServerCert for HostCertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        match client_hello.server_name() {
            Some(name) => Some(
                self.by_host
                    .get(name)
                    .cloned()
                    .unwrap_or_else(|| self.default.clone()),
            ),
            None => Some(self.default.clone()),
        }
    }
}

/// Accepts any client certificate so its fingerprint reaches authorization.
struct CaptureClientCert {
    provider: Arc<rustls::crypto::CryptoProvider>,
}

impl CaptureClientCert {
    fn new() -> Self {
        Self {
            provider: Arc::new(aws_lc_rs::default_provider()),
        }
    }
}

impl std::fmt::Debug for CaptureClientCert {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureClientCert").finish()
    }
}

impl ClientCertVerifier for CaptureClientCert {
    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        false
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
