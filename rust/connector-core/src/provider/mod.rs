//! Pluggable upstream credential issuers.

mod aws_sts;
mod google_iam;

pub use aws_sts::{AwsStsAssumeRoleOptions, AwsStsAssumeRoleProvider};
pub use google_iam::{GoogleIamServiceAccountKeyOptions, GoogleIamServiceAccountKeyProvider};

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::proto::Credential;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("failed to parse supplied endpoint: {0}")]
    EndpointParse(#[from] url::ParseError),
    #[error("supplied endpoint value should have http(s) scheme: {0:?}")]
    EndpointScheme(String),
    #[error("supplied endpoint value should have host set")]
    EndpointHost,
    #[error("supplied endpoint value should not have path set")]
    EndpointPath,
    #[error("provider ping failed: {0}")]
    Ping(String),
    #[error("failed to get temporary credentials from STS: {0}")]
    Sts(String),
    #[error("failed to create service account key: {0}")]
    GoogleKey(String),
    #[error("failed to obtain Google access token: {0}")]
    GoogleToken(String),
    #[error("failed to decode service account key data: {0}")]
    Decode(#[from] base64::DecodeError),
    #[error("failed to parse credential expiry: {0}")]
    Expiry(#[from] chrono::ParseError),
    #[error("upstream request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{0}")]
    Upstream(String),
}

/// A credential issuer identified by a stable name. `ping` is a cheap
/// reachability check used for readiness reporting only; it is never a
/// precondition of issuance.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    async fn ping(&self) -> Result<(), ProviderError>;

    async fn get_credential(&self, object_reference: &str)
        -> Result<Credential, ProviderError>;
}

/// A validated custom endpoint: the URL to hand to the upstream client and
/// the `host:port` to dial for reachability pings.
#[derive(Debug, Clone)]
pub(crate) struct ValidatedEndpoint {
    pub url: String,
    pub ping_host: String,
}

/// Custom endpoints must be http(s) URLs with a host and no path. The ping
/// port falls back to the scheme default when the URL carries none.
pub(crate) fn validate_endpoint(raw: &str) -> Result<ValidatedEndpoint, ProviderError> {
    let parsed = url::Url::parse(raw)?;
    let scheme = parsed.scheme();
    if scheme != "http" && scheme != "https" {
        return Err(ProviderError::EndpointScheme(raw.to_string()));
    }
    let host = match parsed.host_str() {
        Some(host) if !host.is_empty() => host.to_string(),
        _ => return Err(ProviderError::EndpointHost),
    };
    if !matches!(parsed.path(), "" | "/") {
        return Err(ProviderError::EndpointPath);
    }
    let port = parsed
        .port()
        .unwrap_or(if scheme == "https" { 443 } else { 80 });

    Ok(ValidatedEndpoint {
        url: raw.to_string(),
        ping_host: format!("{host}:{port}"),
    })
}

const PING_TIMEOUT: Duration = Duration::from_secs(3);

/// TCP-dial the host with a short timeout. Does not test authn/authz.
pub(crate) async fn ping_host(host: &str) -> Result<(), ProviderError> {
    match tokio::time::timeout(PING_TIMEOUT, tokio::net::TcpStream::connect(host)).await {
        Err(_) => Err(ProviderError::Ping(format!("timed out dialing {host}"))),
        Ok(Err(e)) => Err(ProviderError::Ping(format!("{host}: {e}"))),
        Ok(Ok(_)) => Ok(()),
    }
}
