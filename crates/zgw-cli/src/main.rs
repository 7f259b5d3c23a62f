//! zgw-cli - Command-line tester for the zonal gateway
//!
//! Speaks the gateway's diagnostic protocol over TCP: routing activation
//! first, then plain UDS request/response. `pack` and `inspect` work on
//! container files and need no gateway.

mod client;
mod commands;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::client::TesterLink;

#[derive(Parser)]
#[command(name = "zgw-cli")]
#[command(version, about = "Zonal gateway diagnostic tester")]
struct Cli {
    /// Gateway endpoint
    #[arg(
        short,
        long,
        env = "ZGW_GATEWAY",
        default_value = "127.0.0.1:13400"
    )]
    gateway: String,

    /// Tester logical address (hex or decimal)
    #[arg(long, default_value = "0x0E80", value_parser = parse_u16)]
    source: u16,

    /// Logical address of the addressed device
    #[arg(short, long, default_value = "0x0201", value_parser = parse_u16)]
    target: u16,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Read a data identifier
    ReadDid {
        /// Identifier, e.g. 0xF190
        #[arg(value_parser = parse_u16)]
        did: u16,
    },

    /// Start a routine and report its status byte
    Routine {
        /// Routine identifier, e.g. 0xF005
        #[arg(value_parser = parse_u16)]
        id: u16,
    },

    /// Download a container file into the gateway's staging area
    Flash {
        /// Container file built with `pack`
        file: PathBuf,
    },

    /// Build a firmware container from one or more target descriptions
    Pack {
        /// Output container file
        #[arg(short, long)]
        out: PathBuf,

        /// Container id
        #[arg(long, default_value = "1")]
        id: u32,

        /// Container name (at most 32 ASCII characters)
        #[arg(long, default_value = "update")]
        name: String,

        /// Target description `<id>:<version>:<firmware file>` with an
        /// optional dependency list `:<dep id>@<min version>,...`; the
        /// first target is the routing target
        #[arg(required = true)]
        targets: Vec<String>,
    },

    /// Print a container file's header, targets and checksum state
    Inspect {
        /// Container file
        file: PathBuf,

        /// JSON output
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "zgw_cli=debug,zgw_doip=debug"
    } else {
        "warn"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    match &cli.command {
        Commands::ReadDid { did } => {
            let mut link = TesterLink::connect(&cli.gateway, cli.source, cli.target).await?;
            commands::read_did(&mut link, *did).await?;
        }

        Commands::Routine { id } => {
            let mut link = TesterLink::connect(&cli.gateway, cli.source, cli.target).await?;
            commands::routine(&mut link, *id).await?;
        }

        Commands::Flash { file } => {
            let mut link = TesterLink::connect(&cli.gateway, cli.source, cli.target).await?;
            commands::flash(&mut link, file).await?;
        }

        Commands::Pack {
            out,
            id,
            name,
            targets,
        } => {
            commands::pack(out, *id, name, targets)?;
        }

        Commands::Inspect { file, json } => {
            commands::inspect(file, *json)?;
        }
    }

    Ok(())
}

/// Parses a hex value like "0x0202" or a plain decimal.
fn parse_u16(s: &str) -> Result<u16, String> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u16::from_str_radix(hex, 16).map_err(|e| e.to_string())
    } else {
        s.parse::<u16>().map_err(|e| e.to_string())
    }
}
