mod cli;
mod logging;

use anyhow::Context;
use clap::Parser;
use libcsi::Driver;
use tokio::signal::unix::{SignalKind, signal};
use tracing::info;

use cli::{Cli, Command};

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Some(Command::Version) = cli.command {
        println!("rkcsi {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    logging::init(cli.log_format);

    let driver = Driver::new(cli.driver_opts()).context("failed to initialize driver")?;

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    // Dropping the driver future on a signal closes the listener and
    // removes the socket file.
    tokio::select! {
        res = driver.run() => res.context("CSI server failed")?,
        _ = sigint.recv() => info!("received SIGINT, shutting down"),
        _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
    }
    Ok(())
}
