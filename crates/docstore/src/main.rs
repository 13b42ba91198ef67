//! docstore - document store over a message bus
//!
//! Single binary that provides:
//! - An embedded document database with change feeds
//! - The store pattern contract on a TCP message bus
//! - `act`/`subscribe` client commands for talking to a running server

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod cli;
mod config;
mod server;

use server::DocStoreServer;

#[derive(Parser)]
#[command(name = "docstore")]
#[command(author, version, about = "docstore - document store over a message bus", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the docstore server
    Serve {
        /// Configuration file path (TOML or JSON)
        #[arg(short, long, default_value = "docstore.toml", env = "DOCSTORE_CONFIG")]
        config: String,
    },

    /// Send one pattern and print the reply
    Act {
        /// Server address
        #[arg(short, long, default_value = "127.0.0.1:4222", env = "DOCSTORE_ADDRESS")]
        address: String,

        /// Reply timeout in milliseconds
        #[arg(short, long, default_value_t = 5000)]
        timeout: u64,

        /// Pattern as a JSON object
        pattern: String,
    },

    /// Send a streaming pattern and print every reply
    Subscribe {
        /// Server address
        #[arg(short, long, default_value = "127.0.0.1:4222", env = "DOCSTORE_ADDRESS")]
        address: String,

        /// Pattern as a JSON object
        pattern: String,
    },

    /// Show version information
    Version,
}

fn init_tracing(json: bool) -> Result<()> {
    let filter = EnvFilter::from_default_env().add_directive("docstore=info".parse()?);
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config } => {
            let (settings, from_file) = config::load(&config).await?;
            init_tracing(settings.logging.json)?;
            if from_file {
                info!("Loaded configuration from {}", config);
            } else {
                warn!("Config file {} not found, using defaults", config);
            }

            info!("Starting docstore server...");
            let server = DocStoreServer::new(settings).await?;

            // Handle shutdown gracefully
            let shutdown = async {
                tokio::signal::ctrl_c().await.ok();
                info!("Shutdown signal received");
            };

            tokio::select! {
                result = server.run() => result?,
                () = shutdown => {}
            }
            server.shutdown().await?;
        }

        Commands::Act {
            address,
            timeout,
            pattern,
        } => {
            init_tracing(false)?;
            cli::act(&address, &pattern, timeout).await?;
        }

        Commands::Subscribe { address, pattern } => {
            init_tracing(false)?;
            cli::subscribe(&address, &pattern).await?;
        }

        Commands::Version => {
            println!("docstore version {}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
