//! tidelog CLI
//!
//! Command-line tools for tidelog commit log directories.
//!
//! # Commands
//!
//! - `inspect` - List segments with sizes, compression ratios and watermarks
//! - `verify` - Replay every segment and report what could be recovered
//! - `dump` - Print the mutations stored in the log
//! - `stress` - Run the multi-writer stress harness against a fresh directory

mod commands;
mod error;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// tidelog command-line commit log tools.
#[derive(Parser)]
#[command(name = "tidelog")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the commit log directory
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List segments with sizes, compression ratios and discard watermarks
    Inspect {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Replay every segment and report recovered, discarded and lost data
    Verify {
        /// File holding the 32-byte encryption key
        #[arg(short, long)]
        key_file: Option<PathBuf>,

        /// Fail on the first damaged segment instead of skipping it
        #[arg(short, long)]
        strict: bool,
    },

    /// Print the mutations stored in the log
    Dump {
        /// Maximum number of mutations to print
        #[arg(short, long)]
        limit: Option<usize>,

        /// Only dump this segment id
        #[arg(short, long)]
        segment: Option<u64>,

        /// Include mutations covered by discard watermarks
        #[arg(short, long)]
        all: bool,

        /// File holding the 32-byte encryption key
        #[arg(short, long)]
        key_file: Option<PathBuf>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Run the stress harness against an empty directory
    Stress {
        /// Concurrent writers
        #[arg(long, default_value = "4")]
        writers: usize,

        /// Mutations per writer
        #[arg(long, default_value = "250")]
        mutations: usize,

        /// Value size in bytes
        #[arg(long, default_value = "1024")]
        payload: usize,

        /// Draw value sizes uniformly from 0..=payload
        #[arg(long)]
        random_payload: bool,

        /// Tables to spread mutations over
        #[arg(long, default_value = "1")]
        tables: u32,

        /// Discard the first half of the writes before writing the rest
        #[arg(long)]
        discarded: bool,

        /// Sync mode (periodic, batch, group)
        #[arg(long, default_value = "batch")]
        sync: String,

        /// Compression (none, lz4, snappy, zstd)
        #[arg(long, default_value = "none")]
        compression: String,

        /// Segment size in bytes
        #[arg(long, default_value = "33554432")]
        segment_size: u32,

        /// Seed for payload generation
        #[arg(long, default_value = "0")]
        seed: u64,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Inspect { format } => {
            let path = cli.path.ok_or("Log path required for inspect")?;
            commands::inspect::run(&path, &format)?;
        }
        Commands::Verify { key_file, strict } => {
            let path = cli.path.ok_or("Log path required for verify")?;
            commands::verify::run(&path, key_file.as_deref(), strict)?;
        }
        Commands::Dump {
            limit,
            segment,
            all,
            key_file,
            format,
        } => {
            let path = cli.path.ok_or("Log path required for dump")?;
            let options = commands::dump::DumpOptions {
                limit,
                segment,
                include_discarded: all,
                json: format == "json",
            };
            commands::dump::run(&path, key_file.as_deref(), &options)?;
        }
        Commands::Stress {
            writers,
            mutations,
            payload,
            random_payload,
            tables,
            discarded,
            sync,
            compression,
            segment_size,
            seed,
            format,
        } => {
            let path = cli.path.ok_or("Log path required for stress")?;
            let options = commands::stress::StressOptions {
                writers,
                mutations,
                payload,
                random_payload,
                tables,
                discarded,
                sync,
                compression,
                segment_size,
                seed,
                json: format == "json",
            };
            commands::stress::run(&path, &options)?;
        }
        Commands::Version => {
            println!("tidelog CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
