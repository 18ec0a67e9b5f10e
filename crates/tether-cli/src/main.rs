//! Operator CLI for Tether
//!
//! Manages the persisted node identity, queries the broker HTTP surface and
//! runs an in-memory demonstration of the broker-to-peer handoff.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;
mod config;
mod prompt;

use commands::{broker, demo::DemoCommand, identity};

#[derive(Parser)]
#[command(name = "tether")]
#[command(about = "Tether - broker rendezvous and single-peer handoff", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file path
    #[arg(short, long, global = true, default_value = ".tether/config.toml")]
    config: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Show this node's id and whitelist
    Whoami,

    /// Set this node's id, prompting when omitted
    SetId {
        /// New identifier
        id: Option<String>,
    },

    /// Set the admission whitelist, prompting when omitted
    Whitelist {
        /// Comma-separated peer ids, `*` for anyone
        list: Option<String>,
    },

    /// List peers the broker reports as visible to us
    Peers,

    /// Post a chat message to the broker lobby
    Lobby {
        /// Message text
        message: String,
    },

    /// Run two nodes over an in-memory broker and show the handoff
    Demo(DemoCommand),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt().with_env_filter(log_level).init();

    match cli.command {
        Commands::Demo(cmd) => {
            commands::demo::run(cmd).await?;
        }

        Commands::Whoami => {
            let config = config::load_config(&cli.config)?;
            identity::whoami(&config)?;
        }

        Commands::SetId { id } => {
            let config = config::load_config(&cli.config)?;
            identity::set_id(&config, id.as_deref())?;
        }

        Commands::Whitelist { list } => {
            let config = config::load_config(&cli.config)?;
            identity::set_whitelist(&config, list.as_deref())?;
        }

        Commands::Peers => {
            let config = config::load_config(&cli.config)?;
            broker::list_peers(&config).await?;
        }

        Commands::Lobby { message } => {
            let config = config::load_config(&cli.config)?;
            broker::post_lobby(&config, &message).await?;
        }
    }

    Ok(())
}
