use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use log::{info, warn};

use connector_core::provider::{
    AwsStsAssumeRoleOptions, AwsStsAssumeRoleProvider, GoogleIamServiceAccountKeyOptions,
    GoogleIamServiceAccountKeyProvider, Provider,
};

use crate::cli::Cli;

/// Sets up logging and parses command line arguments
pub fn setup_logging_and_parse_args() -> Cli {
    let args = Cli::parse_args();

    let log_level = if args.is_debug_enabled() {
        "debug"
    } else {
        "info"
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    info!("spiffe-connector starting up");
    args
}

/// The closed set of providers credentials may reference, keyed by the
/// name used in ACL credential entries.
pub async fn default_providers() -> Result<HashMap<String, Arc<dyn Provider>>> {
    let mut providers: HashMap<String, Arc<dyn Provider>> = HashMap::new();

    let aws = AwsStsAssumeRoleProvider::new(AwsStsAssumeRoleOptions::default())
        .await
        .context("failed to construct AWS STS provider")?;
    providers.insert(aws.name().to_string(), Arc::new(aws));

    let google =
        GoogleIamServiceAccountKeyProvider::new(GoogleIamServiceAccountKeyOptions::default())
            .context("failed to construct Google IAM provider")?;
    providers.insert(google.name().to_string(), Arc::new(google));

    Ok(providers)
}

/// Readiness check only: a failed ping is logged, never fatal, and never
/// gates issuance.
pub async fn ping_providers(providers: &HashMap<String, Arc<dyn Provider>>) {
    for provider in providers.values() {
        match provider.ping().await {
            Ok(()) => info!("provider {} is reachable", provider.name()),
            Err(e) => warn!("provider {} ping failed: {e}", provider.name()),
        }
    }
}
