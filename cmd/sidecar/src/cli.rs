use std::path::PathBuf;

use anyhow::bail;
use clap::Parser;

use connector_core::config::{FileSource, SvidSources, WorkloadApiSource};

#[derive(Parser)]
#[command(name = "spiffe-connector-sidecar")]
#[command(about = "SVID to external credential sidecar")]
#[command(version)]
pub struct Cli {
    /// Address and port to connect to the SPIFFE connector server
    #[arg(
        short = 's',
        long = "server-address",
        env = "SPIFFE_CONNECTOR_SERVER_ADDRESS",
        default_value = "localhost:9090"
    )]
    pub server_address: String,

    /// Expected SPIFFE ID of the SPIFFE connector server
    #[arg(
        long = "server-spiffe-id",
        env = "SPIFFE_CONNECTOR_SERVER_SPIFFE_ID"
    )]
    pub server_spiffe_id: Option<String>,

    /// Path to SPIFFE workload API socket
    #[arg(
        short = 'w',
        long = "workload-api-socket",
        env = "SPIFFE_CONNECTOR_WORKLOAD_API_SOCKET",
        conflicts_with_all = ["tls_cert_file", "tls_key_file", "trusted_ca_file"]
    )]
    pub workload_api_socket: Option<String>,

    /// Path to X509 SVID cert file
    #[arg(
        long = "tls-cert-file",
        env = "SPIFFE_CONNECTOR_TLS_CERT_FILE",
        requires_all = ["tls_key_file", "trusted_ca_file"]
    )]
    pub tls_cert_file: Option<PathBuf>,

    /// Path to X509 SVID private key file
    #[arg(
        long = "tls-key-file",
        env = "SPIFFE_CONNECTOR_TLS_KEY_FILE",
        requires_all = ["tls_cert_file", "trusted_ca_file"]
    )]
    pub tls_key_file: Option<PathBuf>,

    /// Path to CAs that are trusted to sign SVIDs
    #[arg(
        long = "trusted-ca-file",
        env = "SPIFFE_CONNECTOR_TRUSTED_CA_FILE",
        requires_all = ["tls_cert_file", "tls_key_file"]
    )]
    pub trusted_ca_file: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short = 'd', long = "debug")]
    pub debug: bool,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }

    pub fn is_debug_enabled(&self) -> bool {
        self.debug
    }

    /// The sidecar's own SVID source: either the workload API socket or
    /// the cert/key/CA file triple.
    pub fn svid_sources(&self) -> anyhow::Result<SvidSources> {
        if let Some(socket_path) = &self.workload_api_socket {
            return Ok(SvidSources {
                workload_api: Some(WorkloadApiSource {
                    socket_path: socket_path.clone(),
                }),
                ..Default::default()
            });
        }
        match (&self.tls_cert_file, &self.tls_key_file, &self.trusted_ca_file) {
            (Some(cert), Some(key), Some(ca)) => Ok(SvidSources {
                files: Some(FileSource {
                    trust_domain_ca: ca.clone(),
                    svid_cert: cert.clone(),
                    svid_key: key.clone(),
                }),
                ..Default::default()
            }),
            _ => bail!(
                "either --workload-api-socket or all of --tls-cert-file, \
                 --tls-key-file and --trusted-ca-file must be set"
            ),
        }
    }
}
