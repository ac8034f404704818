use clap::Parser;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "toolgate",
    version,
    about = "Budget-gated MCP gateway that routes tools across backend MCP servers"
)]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, default_value = "config/toolgate.json")]
    pub config: PathBuf,

    /// HTTP listen address (overrides the config file).
    #[arg(long)]
    pub listen: Option<String>,

    /// Log filter (e.g. "info", "toolgate=debug").
    #[arg(long, default_value = "info")]
    pub log_level: String,
}
