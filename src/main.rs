mod cli;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use tessera::config::TesseraConfig;
use tessera::server;

#[derive(Parser)]
#[command(name = "tessera", version, about = "Persistent memory and hybrid retrieval for AI assistants")]
struct Cli {
    /// Config file (defaults to ~/.tessera/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the MCP server
    Serve {
        /// Override `server.transport` (stdio or http)
        #[arg(long)]
        transport: Option<String>,
    },
    /// Check database integrity and print a health report
    Doctor,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => TesseraConfig::load_from(path)?,
        None => TesseraConfig::load()?,
    };

    // Log to stderr so stdout stays clean for MCP JSON-RPC.
    let filter = EnvFilter::try_new(&config.server.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Serve { transport } => {
            if let Some(transport) = transport {
                config.server.transport = transport;
            }
            server::serve(config).await?;
        }
        Command::Doctor => cli::doctor(&config)?,
    }

    Ok(())
}
