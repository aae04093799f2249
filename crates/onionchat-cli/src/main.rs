//! onionchat command-line interface
//!
//! A terminal client for friend-based messaging over Tor onion services.
//! The engine identity is created on first run and kept in the data
//! directory.

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

/// onionchat - peer-to-peer messaging over Tor
#[derive(Parser)]
#[command(name = "onionchat")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Data directory path
    #[arg(short, long, env = "ONIONCHAT_DATA_DIR", default_value = "~/.onionchat")]
    data_dir: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the peer address to share with friends (creates an identity on first run)
    Address,

    /// Extract the public key from a peer address
    Parse {
        /// 76-character peer address
        address: String,
    },

    /// Connect to Tor and start an interactive session
    Run {
        /// Tor SOCKS5 proxy port
        #[arg(long, env = "ONIONCHAT_SOCKS_PORT", default_value = "9050")]
        socks_port: u16,

        /// Tor control port
        #[arg(long, env = "ONIONCHAT_CONTROL_PORT", default_value = "9051")]
        control_port: u16,

        /// Local port the hidden service forwards to
        #[arg(long, env = "ONIONCHAT_SERVICE_PORT", default_value = "9878")]
        service_port: u16,

        /// Launch this Tor binary instead of using a running Tor
        #[arg(long, env = "ONIONCHAT_TOR_BINARY")]
        tor_binary: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let data_dir = shellexpand::tilde(&cli.data_dir).to_string();

    match cli.command.unwrap_or(Commands::Address) {
        Commands::Address => {
            commands::show_address(&data_dir).await?;
        }
        Commands::Parse { address } => {
            commands::parse_address(&address)?;
        }
        Commands::Run {
            socks_port,
            control_port,
            service_port,
            tor_binary,
        } => {
            let options = commands::RunOptions {
                socks_port,
                control_port,
                service_port,
                tor_binary: tor_binary.map(|p| shellexpand::tilde(&p).to_string()),
            };
            commands::run(&data_dir, options).await?;
        }
    }

    Ok(())
}
