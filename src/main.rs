//! wsmux - command-line client for wsmux servers
//!
//! Negotiates with a server, issues requests through it and opens tunnels,
//! all over a single multiplexed WebSocket.

mod commands;

use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use wsmux_client::{Client, ClientConfig, ConfigError};

#[derive(Parser)]
#[command(name = "wsmux")]
#[command(about = "Issue HTTP requests and open WebSocket tunnels through a wsmux server")]
#[command(version)]
struct Cli {
    /// Server base URL (overrides config and WSMUX_SERVER)
    #[arg(short, long)]
    server: Option<String>,

    /// YAML config file (defaults to $WSMUX_CONFIG if set)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Negotiation and handshake timeout in seconds
    #[arg(long)]
    connect_timeout: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Print the server's capabilities as JSON
    Capabilities,

    /// Issue one request and print the response body
    Fetch {
        /// Target URL
        url: String,

        /// Request method
        #[arg(short = 'X', long, default_value = "GET")]
        method: String,

        /// Request header, as 'Name: value' (repeatable)
        #[arg(short = 'H', long = "header")]
        headers: Vec<String>,

        /// Request body (or @file to read from file)
        #[arg(short, long)]
        data: Option<String>,

        /// Print the status line and headers before the body
        #[arg(short, long)]
        include: bool,
    },

    /// Open a tunnel, send stdin lines as text messages and print replies
    Tunnel {
        /// Remote WebSocket URL
        url: String,

        /// Requested sub-protocol (repeatable)
        #[arg(short, long = "protocol")]
        protocols: Vec<String>,

        /// Upgrade request header, as 'Name: value' (repeatable)
        #[arg(short = 'H', long = "header")]
        headers: Vec<String>,
    },
}

fn load_config(cli: &Cli) -> Result<ClientConfig, ConfigError> {
    let mut config = match &cli.config {
        Some(path) => {
            let mut config = ClientConfig::from_file(path)?;
            config.apply_env_overrides();
            config
        }
        None => ClientConfig::load()?,
    };

    if let Some(ref server) = cli.server {
        config.server = server.clone();
    }
    if let Some(secs) = cli.connect_timeout {
        config.connect_timeout_secs = secs;
    }

    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}: {}", "Config error".red(), e);
            std::process::exit(2);
        }
    };
    tracing::debug!(server = %config.server, "using server");
    let client = Client::new(config)?;

    match cli.command {
        Commands::Tunnel {
            url,
            protocols,
            headers,
        } => {
            let headers = commands::parse_headers(&headers)?;
            if let Err(e) = commands::run_tunnel(&client, &url, protocols, headers).await {
                eprintln!("{}: {}", "Error".red(), e);
                std::process::exit(1);
            }
        }
        command => match commands::execute(&client, command).await {
            Ok(output) => println!("{}", output),
            Err(e) => {
                eprintln!("{}: {}", "Error".red(), e);
                std::process::exit(1);
            }
        },
    }

    client.close().await?;
    Ok(())
}
