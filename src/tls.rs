//! TLS client configuration for `ldaps://` and StartTLS: native roots, an optional
//! extra CA bundle, or no verification at all.

use crate::config::TlsConfig;
use anyhow::{Context, Result};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls_pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use rustls_pemfile::certs;
use std::fs;
use std::io::BufReader;
use std::sync::Arc;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

/// Accepts any server certificate. Only reachable through `skip_verify`.
#[derive(Debug)]
struct InsecureServerVerifier;

impl ServerCertVerifier for InsecureServerVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::ED25519,
        ]
    }
}

/// Build the rustls client config described by `tls` (native roots when `None`).
pub fn client_config(tls: Option<&TlsConfig>) -> Result<Arc<ClientConfig>> {
    let skip_verify = tls.map(|t| t.skip_verify).unwrap_or(false);
    if skip_verify {
        warn!("TLS certificate verification is disabled");
        let mut config = ClientConfig::builder()
            .with_root_certificates(RootCertStore::empty())
            .with_no_client_auth();
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(InsecureServerVerifier));
        return Ok(Arc::new(config));
    }

    let mut root_store = RootCertStore::empty();
    let extra = match tls.and_then(|t| t.ca_file.as_deref()) {
        Some(path) => load_ca_file(path)?,
        None => Vec::new(),
    };
    let have_extra = !extra.is_empty();
    for cert in extra {
        root_store.add(cert).context("Add CA certificate")?;
    }
    match rustls_native_certs::load_native_certs() {
        Ok(native) => {
            let (added, ignored) = root_store.add_parsable_certificates(native);
            debug!("Loaded {} native root certificates ({} ignored)", added, ignored);
        }
        // An explicit CA bundle is enough on hosts without a system store
        Err(e) if have_extra => warn!("Failed to load system CA certs: {}", e),
        Err(e) => return Err(e).context("Load system CA certs"),
    }

    let config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

pub fn connector(tls: Option<&TlsConfig>) -> Result<TlsConnector> {
    Ok(TlsConnector::from(client_config(tls)?))
}

/// Name presented in SNI and checked against the certificate. An IP literal is
/// accepted as-is.
pub fn server_name(host: &str) -> Result<ServerName<'static>> {
    let name = ServerName::try_from(host)
        .with_context(|| format!("Invalid TLS server name: {}", host))?;
    Ok(name.to_owned())
}

fn load_ca_file(path: &str) -> Result<Vec<CertificateDer<'static>>> {
    let file = fs::File::open(path).with_context(|| format!("Open CA file: {}", path))?;
    let mut reader = BufReader::new(file);
    let found: Vec<CertificateDer<'static>> = certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .context("Parse PEM certificates")?;
    if found.is_empty() {
        anyhow::bail!("No certificates found in {}", path);
    }
    Ok(found)
}
