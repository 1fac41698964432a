mod color;
mod config;
mod dispatcher;
mod indicator;
mod listener;
mod queue;
mod reporter;
mod state;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::thread;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::color::Color;
use crate::config::Overrides;
use crate::dispatcher::Dispatcher;
use crate::indicator::{Indicator, LogIndicator, SysfsGpioIndicator};
use crate::listener::Listener;
use crate::reporter::Reporter;
use crate::state::DashcamState;

/// Watchdog service that reports dashcam status on a tri-color light.
#[derive(Parser)]
#[command(name = "dashcam-watchdog", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Configuration file
    #[arg(short, long, default_value = config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// GPIO line of the red channel
    #[arg(short = 'r', long)]
    gpio_red: Option<u32>,

    /// GPIO line of the green channel
    #[arg(short = 'g', long)]
    gpio_green: Option<u32>,

    /// GPIO line of the blue channel
    #[arg(short = 'b', long)]
    gpio_blue: Option<u32>,

    /// Notification port
    #[arg(short, long)]
    port: Option<u16>,

    /// Log indicator changes instead of driving GPIO
    #[arg(long)]
    dry_run: bool,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Report a state to a running watchdog
    Send {
        /// State name, e.g. RECORDING
        state: DashcamState,

        /// Watchdog address
        #[arg(long, default_value = "127.0.0.1:5505")]
        addr: SocketAddr,
    },
}

#[tokio::main]
async fn main() {
    let mut cli = Cli::parse();
    init_logging(cli.verbose);

    let result = match cli.command.take() {
        Some(Command::Send { state, addr }) => send(state, addr).await,
        None => serve(cli).await,
    };

    if let Err(e) = result {
        error!("{e:#}");
        std::process::exit(1);
    }
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();
}

async fn send(state: DashcamState, addr: SocketAddr) -> Result<()> {
    let mut reporter = Reporter::connect(addr).await?;
    reporter.send(state).await?;
    info!(%state, %addr, "state reported");
    Ok(())
}

async fn serve(cli: Cli) -> Result<()> {
    // ── Configuration ─────────────────────────────────────────────────────────
    let mut config = config::load_or_default(&cli.config)?;
    config.apply(&Overrides {
        port: cli.port,
        red: cli.gpio_red,
        green: cli.gpio_green,
        blue: cli.gpio_blue,
    });
    let pins = config.indicator.pins();

    // ── Indicator ─────────────────────────────────────────────────────────────
    let mut indicator: Box<dyn Indicator> = if cli.dry_run {
        info!("Dry run: indicator changes are only logged");
        Box::new(LogIndicator)
    } else {
        Box::new(
            SysfsGpioIndicator::open(&config.indicator.gpio_root, pins)
                .context("Failed to initialise indicator lines")?,
        )
    };

    // ── Listener ──────────────────────────────────────────────────────────────
    let listener = bring_up(&mut indicator, config.listener.socket_addr()).await?;
    let addr = listener.local_addr()?;
    let framing = config.listener.framing;

    info!(
        %addr, ?framing, ?pins,
        "dashcam-watchdog v{} started",
        env!("CARGO_PKG_VERSION")
    );

    let (tx, rx) = queue::channel();
    tokio::spawn(listener.run(tx, framing));

    // ── Dispatcher ────────────────────────────────────────────────────────────
    // A plain thread: it blocks on the queue forever and must not hold up
    // runtime shutdown.
    let dispatcher = Dispatcher::new(indicator, rx);
    thread::Builder::new()
        .name("dispatcher".into())
        .spawn(move || dispatcher.run())
        .context("Failed to spawn dispatcher thread")?;

    shutdown_signal().await;
    info!("Shutting down");
    Ok(())
}

/// Shows red on `indicator`, then binds the notification socket. No producer
/// can connect before the light is claimed and red.
async fn bring_up<I: Indicator>(indicator: &mut I, addr: SocketAddr) -> Result<Listener> {
    indicator
        .set_color(Color::Red)
        .context("Failed to set initial indicator color")?;
    Listener::bind(addr).await
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
                return;
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable; only Ctrl+C stops the daemon")
            }
        }
    }
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Ctrl+C handler unavailable; running until killed");
        std::future::pending::<()>().await;
    }
}
