//! rustls configurations built from an Identity snapshot.
//!
//! The server side wraps the webpki client verifier so every accepted
//! client certificate must also carry a SPIFFE ID URI SAN; the client side
//! replaces hostname verification entirely, verifying the chain against
//! the identity's trust roots and (optionally) pinning the server's SPIFFE
//! ID. Authorization beyond SVID verification stays with the ACL layer.

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::verify_server_cert_signed_by_trust_anchor;
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::server::{ParsedCertificate, WebPkiClientVerifier};
use rustls::{
    ClientConfig, DigitallySignedStruct, DistinguishedName, RootCertStore, ServerConfig,
    SignatureScheme,
};
use thiserror::Error;

use crate::identity::{spiffe_id_from_cert, Identity, IdentityError};
use crate::spiffe_id::SpiffeId;

#[derive(Debug, Error)]
pub enum TlsError {
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error("TLS configuration error: {0}")]
    Rustls(#[from] rustls::Error),
    #[error("client verifier error: {0}")]
    Verifier(#[from] rustls::server::VerifierBuilderError),
}

fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::aws_lc_rs::default_provider())
}

/// Server-side TLS for one identity snapshot: serve the SVID chain,
/// require client certificates, and verify they are SVIDs chaining to the
/// identity's trust roots. ALPN is pinned to h2 for gRPC.
pub fn server_config(identity: &Identity) -> Result<ServerConfig, TlsError> {
    let provider = crypto_provider();
    let roots = Arc::new(identity.root_store()?);
    let webpki = WebPkiClientVerifier::builder_with_provider(roots, provider.clone()).build()?;
    let verifier = Arc::new(SvidClientVerifier { inner: webpki });

    let mut config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_client_cert_verifier(verifier)
        .with_single_cert(identity.cert_chain().to_vec(), identity.private_key())?;
    config.alpn_protocols = vec![b"h2".to_vec()];
    Ok(config)
}

/// Client-side TLS for one identity snapshot. When `expected_server` is
/// set the server must present exactly that SPIFFE ID; otherwise any SVID
/// chaining to the trust roots is accepted.
pub fn client_config(
    identity: &Identity,
    expected_server: Option<SpiffeId>,
) -> Result<ClientConfig, TlsError> {
    let provider = crypto_provider();
    let verifier = Arc::new(SpiffeServerVerifier {
        roots: identity.root_store()?,
        expected: expected_server,
        supported: provider.signature_verification_algorithms,
    });

    let mut config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_client_auth_cert(identity.cert_chain().to_vec(), identity.private_key())?;
    config.alpn_protocols = vec![b"h2".to_vec()];
    config.enable_sni = false;
    Ok(config)
}

/// Wraps the webpki client verifier with an SVID check: the leaf must
/// carry a URI SAN that parses as a SPIFFE ID.
#[derive(Debug)]
struct SvidClientVerifier {
    inner: Arc<dyn ClientCertVerifier>,
}

impl ClientCertVerifier for SvidClientVerifier {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        self.inner.root_hint_subjects()
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        let verified = self.inner.verify_client_cert(end_entity, intermediates, now)?;
        if spiffe_id_from_cert(end_entity).is_none() {
            return Err(rustls::Error::General(
                "client certificate is not an X.509 SVID".to_string(),
            ));
        }
        Ok(verified)
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

/// Verifies the server chain against the trust roots and checks the URI
/// SAN instead of a DNS hostname; SVIDs do not carry DNS names.
#[derive(Debug)]
struct SpiffeServerVerifier {
    roots: RootCertStore,
    expected: Option<SpiffeId>,
    supported: WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for SpiffeServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let cert = ParsedCertificate::try_from(end_entity)?;
        verify_server_cert_signed_by_trust_anchor(
            &cert,
            &self.roots,
            intermediates,
            now,
            self.supported.all,
        )?;

        let id = spiffe_id_from_cert(end_entity).ok_or_else(|| {
            rustls::Error::General("server certificate is not an X.509 SVID".to_string())
        })?;
        if let Some(expected) = &self.expected {
            if *expected != id {
                return Err(rustls::Error::General(format!(
                    "server presented SPIFFE ID {id}, expected {expected}"
                )));
            }
        }
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.supported)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.supported)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.supported.supported_schemes()
    }
}
