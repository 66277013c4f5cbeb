//! xdcc-get: download packets from XDCC bots.
//!
//! ```text
//! xdcc-get [--config <path>] <bot> <packet>...
//! ```
//!
//! Packets are numbers or ranges (`5`, `#5`, `5-7`).

mod app;
mod config;
mod irc;

use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;
use xdcc_protocol::PacketSpecifier;

/// What to download, from the command line.
#[derive(Parser, Debug, Clone, PartialEq, Eq)]
#[command(name = "xdcc-get")]
#[command(about = "Download packets from XDCC bots", version, long_about = None)]
pub struct Args {
    /// Configuration file; defaults to the per-user config path
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Nick of the XDCC bot
    pub bot: String,

    /// Packets to request: `5`, `#5` or a range such as `5-7`
    #[arg(required = true)]
    pub packets: Vec<PacketSpecifier>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Logs go to stderr; stdout may carry a streamed file.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting xdcc-get");

    let config = config::Config::load(args.config.as_deref())?;
    tracing::info!(host = %config.host, bot = %args.bot, "configuration loaded");

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(app::run(config, args))?;

    tracing::info!("xdcc-get finished");
    Ok(())
}
