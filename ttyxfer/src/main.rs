//! ttyxfer - main entry point
//!
//! Speaks JSON-lines protocol records on stdin/stdout; logs go to stderr.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::{debug, info, warn};
use ttyxfer::daemon::shutdown::ShutdownCoordinator;
use ttyxfer::fs::LocalFs;
use ttyxfer::session::StaticConsent;
use ttyxfer::transport::JsonLinesTransport;
use ttyxfer::{utils, Config, DispatchError, SessionManager};

/// Outbound payload bytes produced per idle turn of the loop
const PUMP_BUDGET: usize = 64 * 1024;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Base directory for relative and `~` paths (overrides config)
    #[arg(long, value_name = "DIR")]
    home: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = Config::load(args.config.as_deref())?;
    if let Some(home) = args.home {
        config.transfer.home = Some(home);
    }

    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    let settings = config.engine_settings();
    info!(
        "Starting ttyxfer v{} (home: {}, consent: {:?}, bypass: {})",
        env!("CARGO_PKG_VERSION"),
        settings.home.display(),
        config.auth.consent,
        if settings.bypass_secret.is_some() { "enabled" } else { "disabled" }
    );

    let mut manager = SessionManager::new(
        Box::new(LocalFs::with_walk_options(config.walk_options())),
        Box::new(StaticConsent::new(config.auth.consent)),
        settings,
    );
    let mut transport = JsonLinesTransport::new(tokio::io::stdin(), tokio::io::stdout());

    let shutdown = ShutdownCoordinator::new();
    let mut shutdown_rx = shutdown.subscribe();
    let signals = tokio::spawn(async move { shutdown.wait_for_signal().await });

    loop {
        tokio::select! {
            biased;

            _ = shutdown_rx.recv() => {
                transport.send(manager.cancel_all()).await?;
                break;
            }

            inbound = transport.next_record() => match inbound {
                Some(Ok(record)) => match manager.handle_command(&record) {
                    Ok(replies) => transport.send(replies).await?,
                    Err(DispatchError::UnknownSession(id)) => debug!("Ignored command for unknown session {}", id),
                    Err(e) => warn!("{}", e),
                },
                Some(Err(e)) => warn!("Skipping unreadable input: {}", e),
                None => {
                    while manager.has_pending_output() {
                        transport.send(manager.pump(PUMP_BUDGET)).await?;
                    }
                    info!("Input closed, cancelling {} open sessions", manager.session_count());
                    transport.send(manager.cancel_all()).await?;
                    break;
                }
            },

            _ = std::future::ready(()), if manager.has_pending_output() => {
                transport.send(manager.pump(PUMP_BUDGET)).await?;
            }
        }
    }

    signals.abort();
    info!("Shutdown complete");
    Ok(())
}
