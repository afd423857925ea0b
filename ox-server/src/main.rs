// Copyright 2025 the oxserver authors
//
// SPDX-License-Identifier: MIT

mod catalogue;
mod config;
mod devices;
mod handoff;
mod listener;
mod poller;
mod renderer;
mod server;
mod session;
mod stats;
mod vulkan;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{debug, info};
use tracing_subscriber::{util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Debug, Parser)]
#[command(name = "oxserver")]
#[command(about = "An OpenXR-style runtime server", long_about = None)]
struct Cli {
    /// Print the version.
    #[arg(short, long)]
    version: bool,
    /// Override the listening socket path.
    #[arg(long, value_name = "PATH")]
    socket: Option<PathBuf>,
    /// Bind using the supervisor's socket passing protocol (LISTEN_FDS).
    #[arg(long)]
    bind_systemd: bool,
    /// The path to a config file.
    #[arg(short = 'C', long, value_name = "FILE")]
    config: Option<PathBuf>,
    /// Run without a GPU.
    #[arg(long)]
    headless: bool,
    /// Exit when the active client disconnects.
    #[arg(long)]
    exit_on_disconnect: bool,
}

fn main() -> Result<()> {
    let args = Cli::parse();

    if args.version {
        println!("oxserver {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    init_logging()?;
    debug!(version = env!("CARGO_PKG_VERSION"), "starting up");

    let mut cfg =
        config::Config::load(args.config.as_deref()).context("failed to read config")?;

    // Command line flags win over everything.
    if let Some(socket) = args.socket {
        cfg.socket_path = socket;
    }
    cfg.bind_systemd |= args.bind_systemd;
    cfg.headless |= args.headless;
    cfg.exit_on_disconnect |= args.exit_on_disconnect;

    let mut srv = server::Server::init(cfg).context("server init")?;

    let closer = srv.closer();
    ctrlc::set_handler(move || {
        debug!("received SIGINT");
        closer.send(()).ok();
    })?;

    srv.run().context("server exited")?;

    info!("shut down cleanly");
    Ok(())
}

fn init_logging() -> Result<()> {
    use tracing_subscriber::layer::SubscriberExt;

    let printed_log = tracing_subscriber::fmt::layer().with_filter(
        EnvFilter::builder()
            .with_default_directive("oxserver=info".parse()?)
            .from_env_lossy(),
    );

    tracing_subscriber::registry().with(printed_log).init();

    Ok(())
}
