//! Google service-account keys via the IAM REST API.

use std::path::PathBuf;

use async_trait::async_trait;
use base64::prelude::{Engine as _, BASE64_STANDARD};
use serde::{Deserialize, Serialize};

use crate::proto::{Credential, File};

use super::{ping_host, validate_endpoint, Provider, ProviderError};

const DEFAULT_BASE_URL: &str = "https://iam.googleapis.com";
const DEFAULT_PING_HOST: &str = "iam.googleapis.com:443";
const TOKEN_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";

#[derive(Debug, Clone, Default)]
pub struct GoogleIamServiceAccountKeyOptions {
    /// Custom IAM endpoint, used to point at test doubles.
    pub endpoint: Option<String>,
    /// Service-account credentials used to authenticate against the API.
    /// Falls back to $GOOGLE_APPLICATION_CREDENTIALS.
    pub credentials_file: Option<PathBuf>,
}

/// The fields of an application-default-credentials JSON file this
/// provider needs to mint access tokens.
#[derive(Debug, Clone, Deserialize)]
struct ApplicationCredentials {
    client_email: String,
    private_key: String,
    token_uri: String,
}

#[derive(Serialize)]
struct TokenClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Deserialize)]
struct ServiceAccountKey {
    #[serde(rename = "privateKeyData")]
    private_key_data: String,
    #[serde(rename = "validBeforeTime", default)]
    valid_before_time: Option<String>,
}

#[derive(Debug)]
pub struct GoogleIamServiceAccountKeyProvider {
    http: reqwest::Client,
    base_url: String,
    ping_host: String,
    credentials: Option<ApplicationCredentials>,
}

impl GoogleIamServiceAccountKeyProvider {
    pub fn new(options: GoogleIamServiceAccountKeyOptions) -> Result<Self, ProviderError> {
        let (base_url, ping_host) = match &options.endpoint {
            Some(raw) => {
                let endpoint = validate_endpoint(raw)?;
                (
                    endpoint.url.trim_end_matches('/').to_string(),
                    endpoint.ping_host,
                )
            }
            None => (DEFAULT_BASE_URL.to_string(), DEFAULT_PING_HOST.to_string()),
        };

        let credentials_path = options.credentials_file.clone().or_else(|| {
            std::env::var_os("GOOGLE_APPLICATION_CREDENTIALS").map(PathBuf::from)
        });
        let credentials = match credentials_path {
            Some(path) => {
                let raw = std::fs::read(&path).map_err(|e| {
                    ProviderError::GoogleToken(format!(
                        "failed to read credentials file {}: {e}",
                        path.display()
                    ))
                })?;
                let parsed: ApplicationCredentials =
                    serde_json::from_slice(&raw).map_err(|e| {
                        ProviderError::GoogleToken(format!(
                            "failed to parse credentials file {}: {e}",
                            path.display()
                        ))
                    })?;
                Some(parsed)
            }
            None => {
                log::warn!(
                    "no Google application credentials configured; \
                     IAM requests will be sent unauthenticated"
                );
                None
            }
        };

        Ok(Self {
            http: reqwest::Client::new(),
            base_url,
            ping_host,
            credentials,
        })
    }

    /// Exchange a signed service-account JWT for an OAuth access token.
    async fn access_token(&self) -> Result<Option<String>, ProviderError> {
        let Some(creds) = &self.credentials else {
            return Ok(None);
        };

        let now = chrono::Utc::now().timestamp();
        let claims = TokenClaims {
            iss: &creds.client_email,
            scope: TOKEN_SCOPE,
            aud: &creds.token_uri,
            iat: now,
            exp: now + 3600,
        };
        let key = jsonwebtoken::EncodingKey::from_rsa_pem(creds.private_key.as_bytes())
            .map_err(|e| ProviderError::GoogleToken(format!("invalid private key: {e}")))?;
        let assertion = jsonwebtoken::encode(
            &jsonwebtoken::Header::new(jsonwebtoken::Algorithm::RS256),
            &claims,
            &key,
        )
        .map_err(|e| ProviderError::GoogleToken(format!("failed to sign JWT: {e}")))?;

        let response = self
            .http
            .post(&creds.token_uri)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", assertion.as_str()),
            ])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(ProviderError::GoogleToken(format!(
                "token endpoint returned {}",
                response.status()
            )));
        }
        let token: TokenResponse = response.json().await?;
        Ok(Some(token.access_token))
    }
}

#[async_trait]
impl Provider for GoogleIamServiceAccountKeyProvider {
    fn name(&self) -> &str {
        "GoogleIAMServiceAccountKeyProvider"
    }

    async fn ping(&self) -> Result<(), ProviderError> {
        ping_host(&self.ping_host).await
    }

    /// Create a key for the service account named by `object_reference`
    /// (an email). The `-` project segment lets upstream infer the project
    /// from the account itself.
    async fn get_credential(
        &self,
        object_reference: &str,
    ) -> Result<Credential, ProviderError> {
        let url = format!(
            "{}/v1/projects/-/serviceAccounts/{}/keys",
            self.base_url, object_reference
        );
        let mut request = self.http.post(&url).json(&serde_json::json!({}));
        if let Some(token) = self.access_token().await? {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(ProviderError::GoogleKey(format!(
                "upstream returned {}",
                response.status()
            )));
        }
        let key: ServiceAccountKey = response.json().await?;

        let contents = BASE64_STANDARD.decode(key.private_key_data)?;
        let not_after = key
            .valid_before_time
            .as_deref()
            .map(chrono::DateTime::parse_from_rfc3339)
            .transpose()?
            .map(|t| prost_types::Timestamp {
                seconds: t.timestamp(),
                nanos: t.timestamp_subsec_nanos() as i32,
            });

        Ok(Credential {
            not_after,
            files: vec![File {
                path: "key.json".to_string(),
                mode: 0o644,
                contents,
            }],
            ..Default::default()
        })
    }
}
