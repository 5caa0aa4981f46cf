//! Identity snapshots: the connector's own certificate chain, private key,
//! and trust bundles, in the DER forms the TLS stack consumes.

use std::collections::BTreeMap;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::RootCertStore;
use thiserror::Error;
use x509_parser::prelude::GeneralName;

use crate::config::FileSource;
use crate::spiffe_id::SpiffeId;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to decode PEM material: {0}")]
    Pem(std::io::Error),
    #[error("no certificate found in SVID cert material")]
    NoCertificate,
    #[error("no private key found in SVID key material")]
    NoPrivateKey,
    #[error("unsupported private key: {0}")]
    Key(String),
    #[error("no CA certificates found in trust bundle material")]
    EmptyBundle,
    #[error("SVID leaf certificate has no SPIFFE ID URI SAN")]
    MissingSpiffeId,
    #[error("no SVID source configured")]
    NoSource,
    #[error("workload API error: {0}")]
    WorkloadApi(String),
    #[error("failed to watch SVID files: {0}")]
    Watch(String),
    #[error("failed to build trust root store: {0}")]
    RootStore(rustls::Error),
}

/// An immutable snapshot of the process identity. Snapshots are replaced
/// whole behind swappable handles, never mutated in place.
pub struct Identity {
    cert_chain: Vec<CertificateDer<'static>>,
    private_key: PrivateKeyDer<'static>,
    trust_bundles: BTreeMap<String, Vec<CertificateDer<'static>>>,
    spiffe_id: SpiffeId,
}

impl Identity {
    /// Build an identity from PEM-encoded material: a CA bundle, an SVID
    /// certificate chain (leaf first), and the matching private key.
    pub fn from_pem(ca: &[u8], cert: &[u8], key: &[u8]) -> Result<Self, IdentityError> {
        let cert_chain = parse_pem_certs(cert)?;
        if cert_chain.is_empty() {
            return Err(IdentityError::NoCertificate);
        }
        let authorities = parse_pem_certs(ca)?;
        if authorities.is_empty() {
            return Err(IdentityError::EmptyBundle);
        }
        let private_key = parse_pem_key(key)?;

        let spiffe_id =
            spiffe_id_from_cert(&cert_chain[0]).ok_or(IdentityError::MissingSpiffeId)?;
        let mut trust_bundles = BTreeMap::new();
        trust_bundles.insert(spiffe_id.trust_domain().to_string(), authorities);

        Ok(Self {
            cert_chain,
            private_key,
            trust_bundles,
            spiffe_id,
        })
    }

    /// Build an identity from DER material as delivered by the Workload
    /// API: a leaf-first chain, a PKCS#8 key, and per-domain bundles.
    pub fn from_der_parts(
        cert_chain: Vec<Vec<u8>>,
        pkcs8_key: Vec<u8>,
        bundles: BTreeMap<String, Vec<Vec<u8>>>,
    ) -> Result<Self, IdentityError> {
        let cert_chain: Vec<CertificateDer<'static>> =
            cert_chain.into_iter().map(CertificateDer::from).collect();
        if cert_chain.is_empty() {
            return Err(IdentityError::NoCertificate);
        }
        let trust_bundles: BTreeMap<String, Vec<CertificateDer<'static>>> = bundles
            .into_iter()
            .map(|(domain, certs)| {
                (
                    domain,
                    certs.into_iter().map(CertificateDer::from).collect(),
                )
            })
            .collect();
        if trust_bundles.values().all(|certs| certs.is_empty()) {
            return Err(IdentityError::EmptyBundle);
        }
        let spiffe_id =
            spiffe_id_from_cert(&cert_chain[0]).ok_or(IdentityError::MissingSpiffeId)?;

        Ok(Self {
            cert_chain,
            private_key: PrivateKeyDer::from(PrivatePkcs8KeyDer::from(pkcs8_key)),
            trust_bundles,
            spiffe_id,
        })
    }

    /// Read and parse the three PEM files of a file-backed SVID source.
    pub fn load_files(source: &FileSource) -> Result<Self, IdentityError> {
        let read = |path: &std::path::Path| {
            std::fs::read(path).map_err(|source| IdentityError::Read {
                path: path.display().to_string(),
                source,
            })
        };
        let ca = read(&source.trust_domain_ca)?;
        let cert = read(&source.svid_cert)?;
        let key = read(&source.svid_key)?;
        Self::from_pem(&ca, &cert, &key)
    }

    pub fn cert_chain(&self) -> &[CertificateDer<'static>] {
        &self.cert_chain
    }

    /// A fresh copy of the private key for handing to a TLS config.
    pub fn private_key(&self) -> PrivateKeyDer<'static> {
        self.private_key.clone_key()
    }

    pub fn trust_bundles(&self) -> &BTreeMap<String, Vec<CertificateDer<'static>>> {
        &self.trust_bundles
    }

    /// The SPIFFE ID carried in the leaf certificate's URI SAN.
    pub fn spiffe_id(&self) -> &SpiffeId {
        &self.spiffe_id
    }

    /// All trust roots across every trust domain, as a rustls root store.
    pub fn root_store(&self) -> Result<RootCertStore, IdentityError> {
        let mut roots = RootCertStore::empty();
        for cert in self.trust_bundles.values().flatten() {
            roots
                .add(cert.clone())
                .map_err(IdentityError::RootStore)?;
        }
        Ok(roots)
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("spiffe_id", &self.spiffe_id)
            .field("cert_chain_len", &self.cert_chain.len())
            .field("trust_domains", &self.trust_bundles.keys())
            .finish_non_exhaustive()
    }
}

fn parse_pem_certs(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, IdentityError> {
    let mut reader = std::io::BufReader::new(pem);
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(IdentityError::Pem)
}

fn parse_pem_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>, IdentityError> {
    let mut reader = std::io::BufReader::new(pem);
    rustls_pemfile::private_key(&mut reader)
        .map_err(IdentityError::Pem)?
        .ok_or(IdentityError::NoPrivateKey)
}

/// Extract a SPIFFE ID from a certificate's URI SAN, if present and valid.
pub fn spiffe_id_from_cert(cert: &CertificateDer<'_>) -> Option<SpiffeId> {
    let (_, parsed) = x509_parser::parse_x509_certificate(cert.as_ref()).ok()?;
    let san = parsed.subject_alternative_name().ok()??;
    san.value.general_names.iter().find_map(|name| match name {
        GeneralName::URI(uri) => SpiffeId::parse(uri).ok(),
        _ => None,
    })
}


#[cfg(test)]
mod tests {
    use super::test_certs::{issue_svid, test_ca};
    use super::*;

    #[test]
    fn builds_identity_from_pem_material() {
        let ca = test_ca();
        let svid = issue_svid(&ca, "spiffe://example.com/server");

        let identity = Identity::from_pem(
            ca.ca_pem.as_bytes(),
            svid.cert_pem.as_bytes(),
            svid.key_pem.as_bytes(),
        )
        .unwrap();

        assert_eq!(identity.spiffe_id().as_str(), "spiffe://example.com/server");
        assert_eq!(identity.cert_chain().len(), 1);
        assert_eq!(
            identity.trust_bundles().keys().collect::<Vec<_>>(),
            vec!["example.com"]
        );
        assert!(!identity.root_store().unwrap().is_empty());
    }

    #[test]
    fn rejects_material_without_uri_san() {
        let ca = test_ca();
        // A cert without a SPIFFE URI SAN is not an SVID.
        let mut params = rcgen::CertificateParams::new(vec!["localhost".to_string()]);
        params.distinguished_name = rcgen::DistinguishedName::new();
        let cert = rcgen::Certificate::from_params(params).unwrap();
        let cert_pem = cert.serialize_pem_with_signer(&ca.cert).unwrap();
        let key_pem = cert.serialize_private_key_pem();

        let err = Identity::from_pem(
            ca.ca_pem.as_bytes(),
            cert_pem.as_bytes(),
            key_pem.as_bytes(),
        )
        .unwrap_err();
        assert!(matches!(err, IdentityError::MissingSpiffeId));
    }

    #[test]
    fn rejects_empty_material() {
        let ca = test_ca();
        let svid = issue_svid(&ca, "spiffe://example.com/server");

        let err = Identity::from_pem(b"", svid.cert_pem.as_bytes(), svid.key_pem.as_bytes())
            .unwrap_err();
        assert!(matches!(err, IdentityError::EmptyBundle));

        let err = Identity::from_pem(ca.ca_pem.as_bytes(), b"", svid.key_pem.as_bytes())
            .unwrap_err();
        assert!(matches!(err, IdentityError::NoCertificate));

        let err = Identity::from_pem(
            ca.ca_pem.as_bytes(),
            svid.cert_pem.as_bytes(),
            b"",
        )
        .unwrap_err();
        assert!(matches!(err, IdentityError::NoPrivateKey));
    }

    #[test]
    fn extracts_spiffe_id_from_uri_san() {
        let ca = test_ca();
        let svid = issue_svid(&ca, "spiffe://example.com/client");
        let identity = Identity::from_pem(
            ca.ca_pem.as_bytes(),
            svid.cert_pem.as_bytes(),
            svid.key_pem.as_bytes(),
        )
        .unwrap();

        let extracted = spiffe_id_from_cert(&identity.cert_chain()[0]).unwrap();
        assert_eq!(extracted.as_str(), "spiffe://example.com/client");
    }
}
