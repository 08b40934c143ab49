use std::sync::Arc;

use anyhow::Context;
use tokio::sync::mpsc;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

mod backends;
mod config;
mod control_tunnel;
mod error_payload;
mod game_service;
mod hoster;
mod hosting;
mod port_probe;
mod process_supervisor;
mod registry;
mod savefiles;
mod supervisor_support;
mod timer;

use backends::BackendContext;
use config::SlaveConfig;
use game_service::GameService;
use hoster::Hoster;
use hosting::HostingCoordinator;
use process_supervisor::ProcessSupervisor;
use registry::GameRegistry;

const USAGE: &str = "usage: clockwork-slave [backup <gameName> --preexec|--postexec]";

/// Logs go to stdout and to a daily rolling file in `log_dir`. The returned
/// guard flushes the file writer when dropped.
fn init_tracing(config: &SlaveConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stdout = tracing_subscriber::fmt::layer();

    match std::fs::create_dir_all(&config.log_dir) {
        Ok(()) => {
            let appender = tracing_appender::rolling::daily(&config.log_dir, "clockwork-slave.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(stdout)
                .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(writer))
                .init();
            Some(guard)
        }
        Err(e) => {
            tracing_subscriber::registry().with(filter).with(stdout).init();
            tracing::warn!(dir = %config.log_dir.display(), error = %e, "cannot create log dir; logging to stdout only");
            None
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Arc::new(SlaveConfig::load_from_env()?);
    let _log_guard = init_tracing(&config);

    let mut args = std::env::args().skip(1);
    match args.next().as_deref() {
        None => run(config).await,
        Some("backup") => {
            let (Some(game), Some(flag)) = (args.next(), args.next()) else {
                anyhow::bail!(USAGE);
            };
            let target = savefiles::run_backup_hook(&config, &game, &flag).await?;
            tracing::info!(game, target = %target.display(), "backup complete");
            Ok(())
        }
        Some(other) => anyhow::bail!("unknown command {other:?}; {USAGE}"),
    }
}

async fn run(config: Arc<SlaveConfig>) -> anyhow::Result<()> {
    let registry = GameRegistry::open(&config.game_data_save_path)
        .await
        .with_context(|| format!("open game data {}", config.game_data_save_path.display()))?;

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let supervisor = ProcessSupervisor::new(
        registry.clone(),
        events_tx,
        config.kill_policy(),
        config.port_probe_timeout(),
    );
    let ctx = BackendContext {
        config: Arc::clone(&config),
        supervisor: supervisor.clone(),
        hook_exe: std::env::current_exe().context("locate the slave executable")?,
    };
    let hosting = HostingCoordinator::new(ctx.clone(), config.game_host_delay());
    let hoster = Hoster::new(Arc::clone(&config), registry.clone());
    let service = GameService::new(ctx, hosting, hoster);

    tracing::info!(
        name = %config.name,
        games = registry.names().await.len(),
        ports = ?(config.game_port_range.first..=config.game_port_range.last),
        kill_attempts = supervisor.policy().max_attempts,
        "clockwork slave started"
    );

    let tunnel = control_tunnel::spawn(Arc::clone(&config), service, events_rx);

    tokio::signal::ctrl_c().await.context("listen for ctrl-c")?;
    tracing::info!("shutting down");
    if let Some(tunnel) = tunnel {
        tunnel.abort();
    }
    supervisor.shut_down_all().await;
    Ok(())
}
