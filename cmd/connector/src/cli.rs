use std::path::PathBuf;

use clap::Parser;

#[derive(Parser)]
#[command(name = "spiffe-connector")]
#[command(about = "SVID to external credential helper")]
#[command(version)]
pub struct Cli {
    /// Path to config file
    #[arg(
        short = 'c',
        long = "config-file",
        visible_alias = "config",
        env = "SPIFFE_CONNECTOR_CONFIG_FILE",
        value_name = "FILE"
    )]
    pub config_file: PathBuf,

    /// Address and port to serve gRPC on
    #[arg(
        long = "listen-address",
        env = "SPIFFE_CONNECTOR_LISTEN_ADDRESS",
        default_value = "[::]:9090"
    )]
    pub listen_address: String,

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
}
