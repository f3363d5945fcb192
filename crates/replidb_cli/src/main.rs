//! replidb CLI
//!
//! Offline tools for replidb log directories.
//!
//! # Commands
//!
//! - `segments` - List log segments with their LSN range and size
//! - `dump` - Print log entries
//! - `verify` - Check every entry and report the first corruption
//! - `recover` - Compute the LSN a replay would resume at

mod commands;

use clap::{Parser, Subcommand, ValueEnum};
use replidb_core::Lsn;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// replidb command-line log tools.
#[derive(Parser)]
#[command(name = "replidb")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the log directory
    #[arg(global = true, short, long)]
    log_dir: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Format {
    /// Human-readable text.
    Text,
    /// Pretty-printed JSON.
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// List log segments
    Segments {
        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        format: Format,
    },

    /// Dump log entries
    Dump {
        /// Skip entries before this LSN (view.sequence)
        #[arg(long, value_parser = parse_lsn)]
        from: Option<Lsn>,

        /// Maximum number of entries to print
        #[arg(long)]
        limit: Option<usize>,

        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        format: Format,
    },

    /// Verify every log entry
    Verify,

    /// Compute the LSN a replay from FROM would resume at
    Recover {
        /// First LSN not reflected in any checkpoint (view.sequence)
        #[arg(long, value_parser = parse_lsn, default_value = "0.0")]
        from: Lsn,
    },

    /// Show version information
    Version,
}

fn parse_lsn(text: &str) -> Result<Lsn, String> {
    Lsn::parse(text).ok_or_else(|| format!("invalid LSN {text:?}, expected view.sequence"))
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    tracing::debug!(log_dir = ?cli.log_dir, "replidb cli started");

    match cli.command {
        Commands::Segments { format } => {
            let dir = cli.log_dir.ok_or("log directory required for segments")?;
            commands::segments::run(&dir, format)?;
        }
        Commands::Dump {
            from,
            limit,
            format,
        } => {
            let dir = cli.log_dir.ok_or("log directory required for dump")?;
            commands::dump::run(&dir, from, limit, format)?;
        }
        Commands::Verify => {
            let dir = cli.log_dir.ok_or("log directory required for verify")?;
            commands::verify::run(&dir)?;
        }
        Commands::Recover { from } => {
            let dir = cli.log_dir.ok_or("log directory required for recover")?;
            commands::recover::run(&dir, from)?;
        }
        Commands::Version => {
            println!("replidb CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("replidb Core v{}", replidb_core::VERSION);
        }
    }

    Ok(())
}
