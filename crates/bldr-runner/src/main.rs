use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use log::{info, LevelFilter};
use tokio::sync::mpsc;

use bldr_runner::build::BuildManager;
use bldr_runner::config::RunnerConfig;
use bldr_runner::devserver::DevServerManager;
use bldr_runner::ports::PortAllocator;
use bldr_runner::transport::Transport;
use bldr_runner::tunnel::TunnelManager;

/// Exit code for configuration errors, as opposed to runtime failures.
const EXIT_MISCONFIGURED: i32 = 2;

/// Depth of the event buffer toward the control plane. Fills only while
/// disconnected; senders block, pausing builds, until the reconnect drains
/// it.
const OUTBOUND_BUFFER_SIZE: usize = 1024;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "bldr-runner - executes AI builds and streams events to the control plane",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Override the config file path
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// Reduce output to only errors
    #[arg(short, long, action = clap::ArgAction::SetTrue, global = true)]
    quiet: bool,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Connect to the control plane and serve builds
    Run,
    /// Print the effective configuration
    Config,
}

fn main() {
    let cli = Cli::parse();

    init_logging(&cli.common);

    let config = match RunnerConfig::load(cli.common.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            let _ = writeln!(io::stderr(), "configuration error: {err:#}");
            std::process::exit(EXIT_MISCONFIGURED);
        }
    };

    let result = match cli.command {
        Command::Run => run(config),
        Command::Config => {
            println!("{:#?}", config);
            Ok(())
        }
    };

    if let Err(err) = result {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

fn init_logging(opts: &CommonOpts) {
    let level = if opts.quiet {
        LevelFilter::Error
    } else {
        match opts.verbose {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    };

    env_logger::Builder::from_env(env_logger::Env::default())
        .filter_level(level)
        .init();
}

#[tokio::main]
async fn run(config: RunnerConfig) -> Result<()> {
    let config = Arc::new(config);
    info!(
        "bldr-runner {} starting as {} ({} concurrent builds)",
        env!("CARGO_PKG_VERSION"),
        config.runner_id,
        config.max_builds
    );

    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER_SIZE);

    let ports = Arc::new(PortAllocator::new(
        config.port_range_start,
        config.port_range_len,
    ));
    let tunnels = TunnelManager::new(config.clone(), ports.clone(), outbound_tx.clone());
    let devservers = DevServerManager::new(ports.clone(), tunnels.clone(), outbound_tx.clone());
    let builds = BuildManager::new(config.clone(), outbound_tx.clone(), devservers);

    // The transport owns the reconnect loop; it only returns when the
    // credential is rejected or the process is shutting down.
    Transport::new(config, builds, outbound_rx).run().await
}
