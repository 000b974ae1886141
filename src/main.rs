//! File Portal command line entry point

use anyhow::{Context, Result};
use clap::Parser;
use file_portal::{logger, ClientSession, Cli, Command, FailureBreakdown, PortalConfig, ServerSession};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{info, warn};

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => PortalConfig::from_file(path)?,
        None => PortalConfig::default(),
    };
    cli.apply_to(&mut config);
    config.validate().context("Invalid configuration")?;

    let _log_guard = logger::init_logger(&config.log_level, cli.log_file.as_deref())?;
    let shutdown = install_signal_handler()?;

    match cli.command {
        Command::Client { paths } => run_client(&config, paths, &shutdown),
        Command::Server { .. } => run_server(&config, &shutdown),
    }
}

fn run_client(config: &PortalConfig, paths: Vec<PathBuf>, shutdown: &AtomicBool) -> Result<()> {
    let mut session = ClientSession::attach(config).context("Client is not ready")?;
    let started = session.transfer_files(&paths);
    info!("Transmitting {} of {} files", started, paths.len());

    while session.status().is_active() {
        if !idle(config.poll_interval(), shutdown) {
            warn!("Interrupted with {} transfers in flight", session.live_workers());
            return Ok(());
        }
    }

    let stats = session.metrics().snapshot();
    let outcomes = session.wait();
    for outcome in &outcomes {
        if let Err(e) = &outcome.result {
            warn!("{}: {}", outcome.path.display(), e);
        }
    }

    let failures = FailureBreakdown::from_outcomes(&outcomes);
    if failures.unresponsive_peer > 0 {
        warn!("{} transfers lost to an unresponsive server", failures.unresponsive_peer);
    }
    info!(
        "Client completed: {} of {} attempted files delivered ({})",
        stats.completed,
        stats.attempted(),
        stats
    );
    Ok(())
}

fn run_server(config: &PortalConfig, shutdown: &AtomicBool) -> Result<()> {
    let mut session = ServerSession::new(config).context("Server is not ready")?;
    session.start()?;
    info!("Receiving files into {}", config.output_dir.display());

    while session.status().is_active() {
        if !idle(config.poll_interval(), shutdown) {
            session.stop()?;
        }
    }

    info!("Server stopped: {}", session.metrics().snapshot());
    Ok(())
}

/// Sleep for one poll interval; `false` if shutdown was requested meanwhile
fn idle(interval: Duration, shutdown: &AtomicBool) -> bool {
    let deadline = Instant::now() + interval;
    while Instant::now() < deadline {
        if shutdown.load(Ordering::SeqCst) {
            return false;
        }
        thread::sleep(Duration::from_millis(100).min(interval));
    }
    !shutdown.load(Ordering::SeqCst)
}

/// Flag raised on Ctrl-C; a second one exits immediately
fn install_signal_handler() -> Result<Arc<AtomicBool>> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = shutdown.clone();

    ctrlc::set_handler(move || {
        if flag.swap(true, Ordering::SeqCst) {
            warn!("Received second signal, forcing immediate exit");
            std::process::exit(1);
        }
        info!("Received shutdown signal");
    })
    .context("Failed to set signal handler")?;

    Ok(shutdown)
}
