use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "xguardd", about = "Multi-node proxy-abuse guardian")]
pub struct Cli {
    /// Path to the guardian configuration file.
    #[arg(long)]
    pub config: PathBuf,

    /// Log filter (e.g. debug, info, xguard_engine=debug). Falls back to
    /// XGUARD_LOG_LEVEL, then "info".
    #[arg(long)]
    pub log_level: Option<String>,
}

impl Cli {
    pub fn effective_log_level(&self) -> String {
        self.log_level
            .clone()
            .or_else(|| std::env::var("XGUARD_LOG_LEVEL").ok())
            .unwrap_or_else(|| "info".to_string())
    }
}
