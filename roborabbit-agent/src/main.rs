//! RoboRabbit agent daemon.
//!
//! Keeps a broker connection alive according to a TOML configuration file
//! and logs what it consumes.
//!
//! Usage:
//!   roborabbit-agent --config /etc/roborabbit/broker.toml
//!
//! Signals (unix):
//!   SIGHUP   re-read the configuration and apply it
//!   SIGUSR1  log a JSON status snapshot (with --status-on-usr1)
//!   SIGUSR2  rebuild channels on the next watchdog tick

use std::sync::Arc;
use std::time::Duration;

// ---

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

// ---

use roborabbit_agent::{
    // ---
    Config,
    ConnectionManager,
    ConsumerStatus,
    FileConfigSource,
    ManagerContext,
    MessageLogger,
    UpdateQueue,
    Watchdog,
};
use roborabbit_amqp::AmqpConnector;

// ---------------------------------------------------------------------------
// main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ---

    let cfg = Config::parse();

    let no_color = std::env::var("EMACS").is_ok()
        || std::env::var("NO_COLOR").is_ok()
        || std::env::var("CARGO_TERM_COLOR").as_deref() == Ok("never")
        || !std::io::IsTerminal::is_terminal(&std::io::stdout());

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_ansi(!no_color)
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cfg.config.display(),
        "roborabbit-agent starting",
    );

    let ctx = ManagerContext::default();
    ctx.router.register(Arc::new(MessageLogger));

    let manager = ConnectionManager::new(
        Arc::new(FileConfigSource::new(cfg.config.clone())),
        Arc::new(AmqpConnector::default()),
        ctx,
        Duration::from_secs(cfg.close_timeout_secs),
    );

    let watchdog = Watchdog::new(Arc::clone(&manager));
    watchdog.spawn(Duration::from_secs(cfg.watchdog_initial_delay_secs));

    let updates = UpdateQueue::spawn(&manager);
    updates.request();

    #[cfg(unix)]
    spawn_signal_handlers(&manager, &watchdog, &updates, cfg.status_on_usr1)?;

    tokio::signal::ctrl_c().await?;
    info!("shutting down");

    watchdog.stop();
    if let Err(e) = manager.shutdown_with_wait().await {
        tracing::warn!("{e}");
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Signals
// ---------------------------------------------------------------------------

#[cfg(unix)]
fn spawn_signal_handlers(
    manager: &Arc<ConnectionManager>,
    watchdog: &Arc<Watchdog>,
    updates: &UpdateQueue,
    status_on_usr1: bool,
) -> anyhow::Result<()> {
    // ---
    use tokio::signal::unix::{signal, SignalKind};

    let mut hup = signal(SignalKind::hangup())?;
    let updates = updates.clone();
    tokio::spawn(async move {
        while hup.recv().await.is_some() {
            info!("SIGHUP, reloading configuration");
            if !updates.request() {
                break;
            }
        }
    });

    let mut usr2 = signal(SignalKind::user_defined2())?;
    let watchdog = Arc::clone(watchdog);
    tokio::spawn(async move {
        while usr2.recv().await.is_some() {
            info!("SIGUSR2, channel update on next watchdog tick");
            watchdog.request_channel_update();
        }
    });

    if status_on_usr1 {
        let mut usr1 = signal(SignalKind::user_defined1())?;
        let manager = Arc::clone(manager);
        tokio::spawn(async move {
            while usr1.recv().await.is_some() {
                log_status(&manager);
            }
        });
    }

    Ok(())
}

#[cfg(unix)]
fn log_status(manager: &ConnectionManager) {
    // ---
    let status = match ConsumerStatus::collect(manager) {
        Ok(status) => status,
        Err(e) => {
            tracing::warn!("status unavailable: {e}");
            return;
        }
    };
    match serde_json::to_string(&status) {
        Ok(json) => info!(
            alert = manager.monitor().is_activated(),
            healthy_for = %manager.monitor().spent_time(),
            "status {json}",
        ),
        Err(e) => tracing::warn!("status serialization failed: {e}"),
    }
}
