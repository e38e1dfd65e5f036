//! QUIC transport: a `quinn` endpoint secured with a self-managed TLS identity.
//!
//! Every bidirectional QUIC stream a peer opens is one relay stream. The
//! server identity is a PEM certificate/key pair on disk; when none exists a
//! self-signed ECDSA P-256 certificate for `localhost`/`127.0.0.1` is created
//! and saved, and its SHA-256 fingerprint is what clients pin.

use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use quinn::crypto::rustls::{QuicClientConfig, QuicServerConfig};
use quinn::{Connection, Endpoint, VarInt};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use sha2::{Digest, Sha256};
use tracing::info;

use super::Session;

/// ALPN protocol identifier spoken by relay clients.
pub const ALPN: &[u8] = b"quic-relay/1";

/// Names the generated certificate is valid for.
pub const SELF_SIGNED_NAMES: [&str; 2] = ["localhost", "127.0.0.1"];

/// Certificate and private key the server presents.
pub struct TlsIdentity {
    cert: CertificateDer<'static>,
    key: PrivateKeyDer<'static>,
}

impl TlsIdentity {
    /// Loads the PEM pair at `cert_path`/`key_path`, or generates and saves a
    /// self-signed one if either file is missing.
    pub fn load_or_generate(cert_path: &Path, key_path: &Path) -> Result<Self> {
        if cert_path.exists() && key_path.exists() {
            let identity = Self::load(cert_path, key_path)?;
            info!(cert = %cert_path.display(), "loaded existing certificate");
            return Ok(identity);
        }

        let names: Vec<String> = SELF_SIGNED_NAMES.iter().map(|name| name.to_string()).collect();
        let generated = rcgen::generate_simple_self_signed(names)
            .context("failed to generate self-signed certificate")?;

        fs::write(cert_path, generated.cert.pem())
            .with_context(|| format!("failed to write {}", cert_path.display()))?;
        fs::write(key_path, generated.key_pair.serialize_pem())
            .with_context(|| format!("failed to write {}", key_path.display()))?;
        info!(cert = %cert_path.display(), "generated self-signed certificate");

        Ok(Self {
            cert: generated.cert.der().clone(),
            key: PrivatePkcs8KeyDer::from(generated.key_pair.serialize_der()).into(),
        })
    }

    pub fn load(cert_path: &Path, key_path: &Path) -> Result<Self> {
        let cert = CertificateDer::from_pem_file(cert_path)
            .map_err(|err| anyhow!("failed to read {}: {err:?}", cert_path.display()))?;
        let key = PrivateKeyDer::from_pem_file(key_path)
            .map_err(|err| anyhow!("failed to read {}: {err:?}", key_path.display()))?;
        Ok(Self { cert, key })
    }

    pub fn certificate(&self) -> &CertificateDer<'static> {
        &self.cert
    }

    /// Base64 SHA-256 of the DER certificate.
    pub fn fingerprint(&self) -> String {
        BASE64.encode(Sha256::digest(self.cert.as_ref()))
    }

    fn server_config(&self) -> Result<quinn::ServerConfig> {
        let mut crypto = rustls::ServerConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_protocol_versions(&[&rustls::version::TLS13])?
        .with_no_client_auth()
        .with_single_cert(vec![self.cert.clone()], self.key.clone_key())
        .context("invalid certificate or key")?;
        crypto.alpn_protocols = vec![ALPN.to_vec()];

        Ok(quinn::ServerConfig::with_crypto(Arc::new(
            QuicServerConfig::try_from(crypto)?,
        )))
    }
}

/// Binds a server endpoint on `addr` presenting `identity`.
pub fn bind_endpoint(addr: SocketAddr, identity: &TlsIdentity) -> Result<Endpoint> {
    let endpoint = Endpoint::server(identity.server_config()?, addr)
        .with_context(|| format!("failed to bind {addr}"))?;
    Ok(endpoint)
}

/// Client configuration that trusts exactly `cert`.
pub fn client_config(cert: &CertificateDer<'static>) -> Result<quinn::ClientConfig> {
    let mut roots = rustls::RootCertStore::empty();
    roots.add(cert.clone()).context("certificate rejected")?;

    let mut crypto = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_protocol_versions(&[&rustls::version::TLS13])?
    .with_root_certificates(roots)
    .with_no_client_auth();
    crypto.alpn_protocols = vec![ALPN.to_vec()];

    Ok(quinn::ClientConfig::new(Arc::new(
        QuicClientConfig::try_from(crypto)?,
    )))
}

/// An established QUIC connection acting as a relay session.
pub struct QuicSession {
    connection: Connection,
}

impl QuicSession {
    pub fn new(connection: Connection) -> Self {
        Self { connection }
    }
}

#[async_trait::async_trait]
impl Session for QuicSession {
    type SendStream = quinn::SendStream;
    type RecvStream = quinn::RecvStream;

    async fn accept_stream(&self) -> Result<(Self::SendStream, Self::RecvStream)> {
        let (send, recv) = self.connection.accept_bi().await?;
        Ok((send, recv))
    }

    fn remote_label(&self) -> String {
        self.connection.remote_address().to_string()
    }

    fn close(&self, reason: &str) {
        self.connection.close(VarInt::from_u32(0), reason.as_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_identity_is_persisted_and_reloaded() {
        let dir = tempfile::tempdir().unwrap();
        let cert_path = dir.path().join("cert.pem");
        let key_path = dir.path().join("key.pem");

        let generated = TlsIdentity::load_or_generate(&cert_path, &key_path).unwrap();
        assert!(cert_path.is_file());
        assert!(key_path.is_file());

        let reloaded = TlsIdentity::load_or_generate(&cert_path, &key_path).unwrap();
        assert_eq!(generated.certificate(), reloaded.certificate());
        assert_eq!(generated.fingerprint(), reloaded.fingerprint());
    }

    #[test]
    fn fingerprint_is_base64_sha256() {
        let dir = tempfile::tempdir().unwrap();
        let identity =
            TlsIdentity::load_or_generate(&dir.path().join("c.pem"), &dir.path().join("k.pem"))
                .unwrap();
        let fingerprint = identity.fingerprint();
        assert_eq!(fingerprint.len(), 44);
        assert_eq!(BASE64.decode(fingerprint).unwrap().len(), 32);
    }

    #[tokio::test]
    async fn endpoint_binds_and_client_config_builds() {
        let dir = tempfile::tempdir().unwrap();
        let identity =
            TlsIdentity::load_or_generate(&dir.path().join("c.pem"), &dir.path().join("k.pem"))
                .unwrap();

        let endpoint = bind_endpoint("127.0.0.1:0".parse().unwrap(), &identity).unwrap();
        assert_ne!(endpoint.local_addr().unwrap().port(), 0);
        client_config(identity.certificate()).unwrap();
        endpoint.close(VarInt::from_u32(0), b"done");
    }
}
