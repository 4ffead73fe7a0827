use std::io::{self, Write};
use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use log::{info, LevelFilter};
use tokio::net::TcpListener;

use bldr::api::{self, AppState};
use bldr::config::AppConfig;
use bldr::db::Database;

/// Exit code for configuration errors, as opposed to runtime failures.
const EXIT_MISCONFIGURED: i32 = 2;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "bldr - control plane for AI-driven code generation builds",
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
    /// Run the control plane server
    Serve(ServeCommand),
    /// Print the effective configuration
    Config,
}

#[derive(Debug, Args)]
struct ServeCommand {
    /// Override the listen host
    #[arg(long)]
    host: Option<String>,
    /// Override the listen port
    #[arg(long)]
    port: Option<u16>,
    /// Override the database path
    #[arg(long, value_name = "PATH")]
    database: Option<PathBuf>,
}

fn main() {
    let cli = Cli::parse();

    init_logging(&cli.common);

    let config = match AppConfig::load(cli.common.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            let _ = writeln!(io::stderr(), "configuration error: {err:#}");
            std::process::exit(EXIT_MISCONFIGURED);
        }
    };

    let result = match cli.command {
        Command::Serve(cmd) => run_serve(config, cmd),
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
    let (level, directive) = if opts.quiet {
        (LevelFilter::Error, "error")
    } else {
        match opts.verbose {
            0 => (LevelFilter::Info, "info"),
            1 => (LevelFilter::Debug, "debug"),
            _ => (LevelFilter::Trace, "trace"),
        }
    };

    // The fmt subscriber takes both `tracing` events (HTTP trace layer)
    // and, through its log bridge, the `log` macros used in services.
    // env_logger backstops binaries and tests where a subscriber is
    // already installed or absent.
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(directive));
    let subscriber_installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .is_ok();

    if !subscriber_installed {
        let _ = env_logger::Builder::from_env(env_logger::Env::default())
            .filter_level(level)
            .try_init();
    }
}

#[tokio::main]
async fn run_serve(mut config: AppConfig, cmd: ServeCommand) -> Result<()> {
    if let Some(host) = cmd.host {
        config.host = host;
    }
    if let Some(port) = cmd.port {
        config.port = port;
    }
    if let Some(database) = cmd.database {
        config.database_path = database;
    }

    if config.local_mode {
        info!("Local mode: all actions attributed to the dev user");
    }

    // DB unreachable at startup is fatal; the supervisor restarts us.
    let db = Database::new(&config.database_path)
        .await
        .context("opening database")?;

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .context("parsing listen address")?;

    let state = AppState::new(config, db);
    let router = api::create_router(state);

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    info!("bldr control plane listening on {}", addr);

    axum::serve(listener, router)
        .await
        .context("serving HTTP")?;

    Ok(())
}
