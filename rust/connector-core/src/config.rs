//! Configuration model and structural validation.
//!
//! The config file is YAML; validation accumulates every problem it finds
//! so operators see the full list at once instead of fixing one error per
//! reload attempt.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::spiffe_id::{MatchPrincipal, SpiffeIdError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub spiffe: SpiffeConfig,
    #[serde(default)]
    pub acls: Vec<Acl>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpiffeConfig {
    pub svid_sources: SvidSources,
}

/// Exactly one of the three sources must be configured.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SvidSources {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workload_api: Option<WorkloadApiSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files: Option<FileSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_memory: Option<InMemorySource>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadApiSource {
    pub socket_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileSource {
    pub trust_domain_ca: PathBuf,
    pub svid_cert: PathBuf,
    pub svid_key: PathBuf,
}

/// PEM material held in memory, used by tests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InMemorySource {
    pub trust_domain_ca: String,
    pub svid_cert: String,
    pub svid_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Acl {
    pub match_principal: String,
    #[serde(default)]
    pub credentials: Vec<CredentialRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialRef {
    pub provider: String,
    pub object_reference: String,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("principal {principal:?} is invalid: {reason}")]
    InvalidPrincipal {
        principal: String,
        reason: SpiffeIdError,
    },
    #[error("duplicate principal matching rule {principal} (seen {count} times)")]
    DuplicatePrincipal { principal: String, count: usize },
    #[error("duplicate provider {provider:?} for principal {principal:?} (seen {count} times)")]
    DuplicateProvider {
        provider: String,
        principal: String,
        count: usize,
    },
    #[error("exactly one SVID source must be configured, found {count}")]
    SvidSourceCount { count: usize },
}

/// All validation errors found in one pass, displayed comma-joined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationErrors(pub Vec<ConfigError>);

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for err in &self.0 {
            if !first {
                f.write_str(", ")?;
            }
            first = false;
            write!(f, "{err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationErrors {}

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error("config validation failed: {0}")]
    Invalid(ValidationErrors),
}

impl Config {
    /// Structural validation. Errors are accumulated, never short-circuited.
    pub fn validate(&self) -> Result<(), Vec<ConfigError>> {
        let mut errors = Vec::new();

        for acl in &self.acls {
            if let Err(reason) = MatchPrincipal::parse(&acl.match_principal) {
                errors.push(ConfigError::InvalidPrincipal {
                    principal: acl.match_principal.clone(),
                    reason,
                });
            }

            let mut seen_providers: BTreeMap<&str, usize> = BTreeMap::new();
            for cred in &acl.credentials {
                *seen_providers.entry(cred.provider.as_str()).or_insert(0) += 1;
            }
            for (provider, count) in seen_providers {
                if count > 1 {
                    errors.push(ConfigError::DuplicateProvider {
                        provider: provider.to_string(),
                        principal: acl.match_principal.clone(),
                        count,
                    });
                }
            }
        }

        let mut seen_principals: BTreeMap<&str, usize> = BTreeMap::new();
        for acl in &self.acls {
            *seen_principals
                .entry(acl.match_principal.as_str())
                .or_insert(0) += 1;
        }
        for (principal, count) in seen_principals {
            if count > 1 {
                errors.push(ConfigError::DuplicatePrincipal {
                    principal: principal.to_string(),
                    count,
                });
            }
        }

        let sources = &self.spiffe.svid_sources;
        let count = [
            sources.workload_api.is_some(),
            sources.files.is_some(),
            sources.in_memory.is_some(),
        ]
        .iter()
        .filter(|present| **present)
        .count();
        if count != 1 {
            errors.push(ConfigError::SvidSourceCount { count });
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Read, decode, and validate the config file at `path`.
pub fn load_config(path: &Path) -> Result<Config, ConfigLoadError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigLoadError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_config(&contents, path)
}

fn parse_config(contents: &str, path: &Path) -> Result<Config, ConfigLoadError> {
    let config: Config =
        serde_yaml::from_str(contents).map_err(|source| ConfigLoadError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
    config
        .validate()
        .map_err(|errors| ConfigLoadError::Invalid(ValidationErrors(errors)))?;
    Ok(config)
}
