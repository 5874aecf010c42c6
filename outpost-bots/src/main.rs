//! outpost: run a fleet of bot sessions from a config file.
//!
//! Reads `config/outpost.toml` (or `--config`), connects every enabled bot
//! one after another, then takes operator commands on stdin. Type `help`
//! for the command list; `exit` or Ctrl-C drains the queues and disconnects.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use outpost_sdk::client::{Keepalive, LineTransport};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use outpost_bots::config::{Config, DEFAULT_CONFIG_PATH, secs};
use outpost_bots::console::{Console, Flow};
use outpost_bots::manager::{Fleet, FleetOptions};

#[derive(Parser)]
#[command(name = "outpost", about = "Resilient game-server bot fleet")]
struct Args {
    /// Config file
    #[arg(long, env = "OUTPOST_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Seconds between connects when starting several bots
    #[arg(long, env = "OUTPOST_CONNECT_INTERVAL_SECS", default_value_t = 6)]
    connect_interval_secs: u64,

    /// Seconds each queue may take to drain on shutdown
    #[arg(long, env = "OUTPOST_SHUTDOWN_TIMEOUT_SECS", default_value_t = 30)]
    shutdown_timeout_secs: u64,

    /// TCP connect timeout towards the protocol bridge
    #[arg(long, default_value_t = 10)]
    connect_timeout_secs: u64,

    /// Ping the bridge after this many silent seconds
    #[arg(long, default_value_t = 60)]
    keepalive_secs: u64,

    /// Drop a connection after this many silent seconds
    #[arg(long, default_value_t = 120)]
    read_timeout_secs: u64,

    /// Do not connect enabled bots at startup
    #[arg(long)]
    no_auto_connect: bool,
}

fn init_tracing() -> Result<()> {
    // JSON logs when OUTPOST_LOG_JSON=1, human-readable otherwise
    let json_logs = std::env::var("OUTPOST_LOG_JSON").unwrap_or_default() == "1";
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("outpost_bots=info,outpost_sdk=info,outpost=info"))?;
    if json_logs {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;
    std::panic::set_hook(Box::new(|info| {
        tracing::error!(panic = %info, "Panic caught, continuing");
    }));

    let args = Args::parse();

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(path = %args.config.display(), error = %e, "Cannot load config");
            return Err(e).context("loading config");
        }
    };
    let (specs, errors) = config.resolve();
    for e in &errors {
        tracing::error!(error = %e, "Bot skipped");
    }
    if specs.is_empty() {
        tracing::error!(path = %args.config.display(), "No usable bots configured");
        bail!("no usable bots in {}", args.config.display());
    }

    let transport = Arc::new(LineTransport {
        connect_timeout: secs(args.connect_timeout_secs),
        keepalive: Keepalive {
            interval: secs(args.keepalive_secs.max(1)),
            timeout: secs(args.read_timeout_secs.max(1)),
        },
    });
    let fleet = Arc::new(Fleet::build(
        &config,
        specs,
        transport,
        FleetOptions {
            connect_interval: secs(args.connect_interval_secs),
            shutdown_timeout: secs(args.shutdown_timeout_secs),
        },
    ));

    if !args.no_auto_connect {
        let fleet = fleet.clone();
        tokio::spawn(async move { fleet.connect_enabled().await });
    }

    let mut console = Console::new(fleet.clone());
    if let Some(tag) = console.selected() {
        println!("Selected {tag}. Type help for commands.");
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        tracing::error!(error = %e, "stdin read failed");
                        break;
                    }
                };
                match console.handle(&line).await {
                    Ok(Flow::Exit) => break,
                    Ok(Flow::Continue) => {}
                    Err(e) => tracing::error!(error = %format!("{e:#}"), "Command failed"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted");
                break;
            }
        }
    }

    fleet.shutdown().await;
    Ok(())
}
