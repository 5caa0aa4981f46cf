pub mod cli;
pub mod materialize;
pub mod sidecar;
