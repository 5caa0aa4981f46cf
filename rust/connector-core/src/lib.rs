//! Core library for the spiffe-connector: config model and validation,
//! principal matching, SVID sources, credential providers, the credential
//! cache, and the shared TLS plumbing used by both the server and sidecar.

pub mod cache;
pub mod config;
pub mod identity;
pub mod principal;
pub mod provider;
pub mod source;
pub mod spiffe_id;
pub mod state;
pub mod tls;
pub mod watch;

pub mod proto {
    tonic::include_proto!("spiffe_connector");
}
