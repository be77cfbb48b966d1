use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use rust_ccnd_core::{Config, Daemon};

/// CCN forwarding daemon
#[derive(Parser)]
#[clap(author, version, about)]
struct Cli {
    /// Sets the level of verbosity
    #[clap(short, long)]
    verbose: bool,

    /// Content-store soft capacity in entries (overrides CCND_CAP)
    #[clap(long)]
    capacity: Option<usize>,

    /// Byte budget for interest stuffing (overrides CCND_MTU)
    #[clap(long)]
    mtu: Option<usize>,

    /// Per-subsystem debug bitmask (overrides CCND_DEBUG)
    #[clap(short, long)]
    debug: Option<u32>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut builder = env_logger::Builder::from_default_env();
    if cli.verbose {
        builder.filter_level(log::LevelFilter::Debug);
    }
    builder.init();

    let mut cfg = Config::from_env();
    if let Some(capacity) = cli.capacity {
        cfg.capacity = capacity;
    }
    if let Some(mtu) = cli.mtu {
        cfg.mtu = mtu.min(rust_ccnd_core::config::MAX_MTU);
    }
    if let Some(debug) = cli.debug {
        cfg.debug = debug;
    }

    let mut daemon = Daemon::new(cfg);
    daemon.bind().context("ccnd initialization failed")?;
    daemon.run().context("ccnd main loop failed")?;
    info!("exiting.");
    Ok(())
}
