use anyhow::Result;
use clap::{Parser, Subcommand};

mod commands;
mod utils;

/// Command-line client for the rust-ccnd daemon
#[derive(Parser)]
#[clap(author, version, about)]
struct Cli {
    /// Sets the level of verbosity
    #[clap(short, long, global = true)]
    verbose: bool,

    /// Subcommand to execute
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send an Interest and print the matching ContentObject
    Interest {
        /// Name to request (URI format, e.g. /a/b)
        name: String,

        /// Timeout in milliseconds
        #[clap(short, long, default_value = "4000")]
        timeout: u64,

        /// Scope (0 = local only, 1 = same host, 2+ = network)
        #[clap(short, long)]
        scope: Option<u64>,

        /// Accept stale answers
        #[clap(long)]
        stale: bool,
    },

    /// Publish a ContentObject into the daemon's store
    Publish {
        /// Name to publish under (URI format)
        name: String,

        /// Content to publish (string)
        content: String,

        /// FreshnessSeconds after which the object goes stale
        #[clap(short, long)]
        freshness: Option<u64>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut builder = env_logger::Builder::from_default_env();
    if cli.verbose {
        builder.filter_level(log::LevelFilter::Debug);
    }
    builder.init();

    match cli.command {
        Commands::Interest {
            name,
            timeout,
            scope,
            stale,
        } => commands::interest::send_interest(&name, timeout, scope, stale),
        Commands::Publish {
            name,
            content,
            freshness,
        } => commands::publish::publish(&name, &content, freshness),
    }
}
