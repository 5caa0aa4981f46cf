//! Short-lived AWS credentials via STS AssumeRole.

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};

use crate::proto::{Credential, File};

use super::{ping_host, validate_endpoint, Provider, ProviderError};

// From https://docs.aws.amazon.com/STS/latest/APIReference/welcome.html
const DEFAULT_PING_HOST: &str = "sts.amazonaws.com:443";
const DEFAULT_DURATION_SECONDS: i32 = 3600;

/// The session name is a label only; many sessions may share it.
const ROLE_SESSION_NAME: &str = "spiffe-connector";

#[derive(Debug, Clone, Default)]
pub struct AwsStsAssumeRoleOptions {
    /// Custom STS endpoint, used to point at test doubles.
    pub endpoint: Option<String>,
    /// Used when `endpoint` is set; defaults to us-east-1.
    pub region: Option<String>,
    /// How long issued credentials stay valid. Durations above one hour
    /// may be blocked by organisation settings upstream.
    pub duration_seconds: Option<i32>,
}

#[derive(Debug)]
pub struct AwsStsAssumeRoleProvider {
    client: aws_sdk_sts::Client,
    ping_host: String,
    duration_seconds: i32,
}

impl AwsStsAssumeRoleProvider {
    pub async fn new(options: AwsStsAssumeRoleOptions) -> Result<Self, ProviderError> {
        let mut ping_host = DEFAULT_PING_HOST.to_string();
        let mut loader = aws_config::defaults(BehaviorVersion::latest());

        if let Some(raw) = &options.endpoint {
            let endpoint = validate_endpoint(raw)?;
            ping_host = endpoint.ping_host;
            // A region must be set alongside a custom endpoint.
            let region = options
                .region
                .clone()
                .unwrap_or_else(|| "us-east-1".to_string());
            loader = loader.endpoint_url(endpoint.url).region(Region::new(region));
        } else if let Some(region) = options.region.clone() {
            loader = loader.region(Region::new(region));
        }

        let config = loader.load().await;
        Ok(Self {
            client: aws_sdk_sts::Client::new(&config),
            ping_host,
            duration_seconds: options
                .duration_seconds
                .unwrap_or(DEFAULT_DURATION_SECONDS),
        })
    }
}

#[async_trait]
impl Provider for AwsStsAssumeRoleProvider {
    fn name(&self) -> &str {
        "AWSSTSAssumeRoleProvider"
    }

    async fn ping(&self) -> Result<(), ProviderError> {
        ping_host(&self.ping_host).await
    }

    /// Assume the role named by `object_reference` (an ARN). The connector
    /// must itself be allowed to AssumeRole on the target.
    async fn get_credential(
        &self,
        object_reference: &str,
    ) -> Result<Credential, ProviderError> {
        let result = self
            .client
            .assume_role()
            .role_arn(object_reference)
            .role_session_name(ROLE_SESSION_NAME)
            .duration_seconds(self.duration_seconds)
            .send()
            .await
            .map_err(|e| {
                ProviderError::Sts(aws_sdk_sts::error::DisplayErrorContext(&e).to_string())
            })?;

        let credentials = result
            .credentials()
            .ok_or_else(|| ProviderError::Sts("response contained no credentials".to_string()))?;

        let credentials_file = format!(
            "[default]\naws_access_key_id = {}\naws_secret_access_key = {}\naws_session_token = {}\n",
            credentials.access_key_id(),
            credentials.secret_access_key(),
            credentials.session_token(),
        );

        let expiration = credentials.expiration();
        Ok(Credential {
            not_after: Some(prost_types::Timestamp {
                seconds: expiration.secs(),
                nanos: expiration.subsec_nanos() as i32,
            }),
            files: vec![File {
                path: "~/.aws/credentials".to_string(),
                mode: 0o644,
                contents: credentials_file.into_bytes(),
            }],
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{SecondsFormat, Utc};
    use serial_test::serial;
    use std::io::Read;
    use std::time::{Duration, SystemTime};

    fn assume_role_response(expiration: &str) -> String {
        format!(
            r#"<AssumeRoleResponse xmlns="https://sts.amazonaws.com/doc/2011-06-15/">
  <AssumeRoleResult>
    <Credentials>
      <AccessKeyId>keyid</AccessKeyId>
      <SecretAccessKey>secretkey</SecretAccessKey>
      <SessionToken>sessiontoken</SessionToken>
      <Expiration>{expiration}</Expiration>
    </Credentials>
    <AssumedRoleUser>
      <AssumedRoleId>AROA:spiffe-connector</AssumedRoleId>
      <Arn>arn:aws:sts::123456789012:assumed-role/test/spiffe-connector</Arn>
    </AssumedRoleUser>
  </AssumeRoleResult>
  <ResponseMetadata>
    <RequestId>01234567-89ab-cdef-0123-456789abcdef</RequestId>
  </ResponseMetadata>
</AssumeRoleResponse>
"#
        )
    }

    /// Serve one canned AssumeRole response, returning the endpoint and a
    /// handle that yields the request body.
    fn mock_sts(body: String) -> (String, std::thread::JoinHandle<String>) {
        let server = tiny_http::Server::http("127.0.0.1:0").unwrap();
        let addr = server.server_addr().to_ip().unwrap();
        let handle = std::thread::spawn(move || {
            let mut request = server.recv().unwrap();
            let mut request_body = String::new();
            request
                .as_reader()
                .read_to_string(&mut request_body)
                .unwrap();
            let response = tiny_http::Response::from_string(body).with_header(
                tiny_http::Header::from_bytes(&b"Content-Type"[..], &b"text/xml"[..]).unwrap(),
            );
            request.respond(response).unwrap();
            request_body
        });
        (format!("http://{addr}"), handle)
    }

    fn set_test_credentials() {
        std::env::set_var("AWS_ACCESS_KEY_ID", "test-access-key");
        std::env::set_var("AWS_SECRET_ACCESS_KEY", "test-secret-key");
        std::env::set_var("AWS_EC2_METADATA_DISABLED", "true");
    }

    #[tokio::test]
    #[serial]
    async fn round_trips_credentials_from_mock_upstream() {
        set_test_credentials();
        let expiration = (Utc::now() + chrono::Duration::hours(1))
            .to_rfc3339_opts(SecondsFormat::Secs, true);
        let (endpoint, request_body) = mock_sts(assume_role_response(&expiration));

        let provider = AwsStsAssumeRoleProvider::new(AwsStsAssumeRoleOptions {
            endpoint: Some(endpoint),
            ..Default::default()
        })
        .await
        .unwrap();

        let credential = provider
            .get_credential("arn:aws:iam::123456789012:role/test")
            .await
            .unwrap();

        assert_eq!(credential.files.len(), 1);
        let file = &credential.files[0];
        assert_eq!(file.path, "~/.aws/credentials");
        assert_eq!(file.mode, 0o644);
        let contents = String::from_utf8(file.contents.clone()).unwrap();
        assert!(
            contents.starts_with("[default]\naws_access_key_id = keyid\n"),
            "unexpected credentials file: {contents}"
        );
        assert!(contents.contains("aws_secret_access_key = secretkey"));
        assert!(contents.contains("aws_session_token = sessiontoken"));

        // not_after tracks the mock's Expiration to within a few seconds.
        let not_after = SystemTime::try_from(credential.not_after.unwrap()).unwrap();
        let expected = SystemTime::now() + Duration::from_secs(3600);
        let skew = match not_after.duration_since(expected) {
            Ok(ahead) => ahead,
            Err(e) => e.duration(),
        };
        assert!(skew < Duration::from_secs(5), "skew too large: {skew:?}");

        let body = request_body.join().unwrap();
        assert!(body.contains("Action=AssumeRole"));
        assert!(body.contains("RoleSessionName=spiffe-connector"));
        assert!(body.contains("DurationSeconds=3600"));
    }

    #[tokio::test]
    #[serial]
    async fn upstream_error_is_surfaced() {
        set_test_credentials();
        let server = tiny_http::Server::http("127.0.0.1:0").unwrap();
        let addr = server.server_addr().to_ip().unwrap();
        std::thread::spawn(move || {
            if let Ok(request) = server.recv() {
                let _ = request.respond(
                    tiny_http::Response::from_string("access denied").with_status_code(403),
                );
            }
        });

        let provider = AwsStsAssumeRoleProvider::new(AwsStsAssumeRoleOptions {
            endpoint: Some(format!("http://{addr}")),
            ..Default::default()
        })
        .await
        .unwrap();

        let err = provider
            .get_credential("arn:aws:iam::123456789012:role/test")
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Sts(_)));
        assert!(err
            .to_string()
            .starts_with("failed to get temporary credentials from STS"));
    }

    #[tokio::test]
    async fn rejects_invalid_endpoints() {
        for endpoint in ["ftp://host", "https://host/path", "https://"] {
            let err = AwsStsAssumeRoleProvider::new(AwsStsAssumeRoleOptions {
                endpoint: Some(endpoint.to_string()),
                ..Default::default()
            })
            .await
            .unwrap_err();
            assert!(
                matches!(
                    err,
                    ProviderError::EndpointScheme(_)
                        | ProviderError::EndpointHost
                        | ProviderError::EndpointPath
                        | ProviderError::EndpointParse(_)
                ),
                "unexpected error for {endpoint}: {err}"
            );
        }
    }
}
