use clap::Parser;
use std::path::PathBuf;

use manifold::client_config::ClientKind;

#[derive(Parser)]
#[command(
    name = "manifold",
    version,
    about = "Multiplexing MCP proxy with per-backend endpoints and access control"
)]
pub struct Cli {
    /// JSON file declaring the backends ({"mcpServers": {...}}).
    #[arg(short, long)]
    pub config: PathBuf,

    /// AI client flavor to generate a configuration for.
    #[arg(short = 't', long, value_enum, default_value = "gemini")]
    pub client: ClientKind,

    /// Directory to write the generated client configuration into.
    /// Printed to stdout when omitted.
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Name for this proxy instance.
    #[arg(short, long, default_value = "manifold")]
    pub name: String,

    /// Log filter (e.g. "info", "manifold=debug").
    #[arg(long, default_value = "info")]
    pub log_level: String,
}
