use std::{collections::VecDeque, sync::Arc, time::Duration};

use tokio::sync::Mutex;

use crate::backends::{BackendContext, BackendError, backend_for};
use clockwork_process::GameRecord;

use crate::process_supervisor::{PortLease, SpawnError, SpawnedProcess};
use crate::registry::RegistryError;
use crate::timer::{self, TimerValue};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostingOutcome {
    /// The game was frozen with a live process; only its timer was restored.
    TimerRestored,
    AlreadyRunning,
    Spawned(SpawnedProcess),
}

#[derive(Debug, thiserror::Error)]
pub enum HostingError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Spawn(#[from] SpawnError),
    #[error("An error occurred when changing the current timer of the frozen game {name}: {source}")]
    TimerRestore {
        name: String,
        #[source]
        source: BackendError,
    },
}

/// Staggers spawns so a burst of host requests (a master reconnect, a slave
/// restart) does not start every game at once.
#[derive(Clone)]
pub struct HostingCoordinator {
    ctx: BackendContext,
    delay: Duration,
    queue: Arc<Mutex<VecDeque<u16>>>,
}

impl HostingCoordinator {
    pub fn new(ctx: BackendContext, delay: Duration) -> Self {
        Self {
            ctx,
            delay,
            queue: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    #[cfg(test)]
    pub async fn pending(&self) -> Vec<u16> {
        self.queue.lock().await.iter().copied().collect()
    }

    /// Hosts the game on `port`.
    ///
    /// A frozen game that is still running only gets its timer back, from
    /// the frozen snapshot or else from `timer`/`args`. A running game is
    /// left alone. Otherwise the spawn waits `delay` times the number of
    /// requests already queued, and falls back to the stored args.
    pub async fn request_hosting(
        &self,
        port: u16,
        args: Option<Vec<String>>,
        timer: Option<TimerValue>,
    ) -> Result<HostingOutcome, HostingError> {
        let registry = self.ctx.supervisor.registry();
        let record = registry.require(port).await?;

        if registry.is_running(port).await {
            if !record.frozen {
                tracing::info!(port, name = %record.name, "game is already running; cannot host over it");
                return Ok(HostingOutcome::AlreadyRunning);
            }

            let restore = record
                .frozen_timer
                .map(TimerValue::Seconds)
                .or(timer)
                .or(args.map(TimerValue::Args))
                .unwrap_or(TimerValue::Seconds(0));
            let lease = self.ctx.supervisor.lease(port).await;
            backend_for(record.game_type)
                .change_current_timer(&self.ctx, &lease, &record, &restore)
                .await
                .map_err(|source| {
                    tracing::error!(port, name = %record.name, error = %source, "failed to restore frozen timer");
                    HostingError::TimerRestore {
                        name: record.name.clone(),
                        source,
                    }
                })?;
            registry.clear_frozen(port).await?;
            tracing::info!(port, name = %record.name, seconds = restore.total_seconds(), "frozen timer restored");
            return Ok(HostingOutcome::TimerRestored);
        }

        let position = {
            let mut q = self.queue.lock().await;
            let pos = q.len();
            q.push_back(port);
            pos
        };
        let wait = self.delay * position as u32;
        tracing::debug!(port, position, wait_ms = wait.as_millis() as u64, "host request queued");
        tokio::time::sleep(wait).await;
        {
            let mut q = self.queue.lock().await;
            if let Some(i) = q.iter().position(|p| *p == port) {
                q.remove(i);
            }
        }

        let lease = self.ctx.supervisor.lease(port).await;
        let record = registry.require(port).await?;
        if registry.is_running(port).await {
            return Ok(HostingOutcome::AlreadyRunning);
        }
        let mut args = args.unwrap_or_else(|| record.args.clone());
        let backend = backend_for(record.game_type);
        let frozen_timer = record
            .frozen
            .then_some(record.frozen_timer)
            .flatten()
            .map(TimerValue::Seconds);
        let timer_in_args = match frozen_timer.as_ref().and_then(|t| backend.timer_launch_args(t)) {
            Some(extra) => {
                args.extend(extra);
                true
            }
            None => false,
        };
        let spawned = self.ctx.launch(&lease, &record, Some(args)).await?;

        if record.frozen {
            self.thaw_after_spawn(&lease, &record, frozen_timer.filter(|_| !timer_in_args))
                .await;
        }
        Ok(HostingOutcome::Spawned(spawned))
    }

    /// A frozen game that was not running (the slave restarted) gets its
    /// snapshot applied to the fresh process and loses the frozen mark. If
    /// the timer cannot be set the mark stays, so the next host retries.
    async fn thaw_after_spawn(&self, lease: &PortLease, record: &GameRecord, timer: Option<TimerValue>) {
        if let Some(timer) = timer {
            match backend_for(record.game_type)
                .change_current_timer(&self.ctx, lease, record, &timer)
                .await
            {
                Ok(()) | Err(BackendError::Unsupported(_)) => {}
                Err(e) => {
                    tracing::error!(port = record.port, name = %record.name, error = %e, "failed to restore frozen timer after spawn");
                    return;
                }
            }
        }
        match self.ctx.supervisor.registry().clear_frozen(record.port).await {
            Ok(()) => tracing::info!(port = record.port, name = %record.name, "frozen game hosted with its timer"),
            Err(e) => tracing::error!(port = record.port, name = %record.name, error = %e, "failed to clear frozen state"),
        }
    }

    /// Pauses the timers of all running games that have started, remembering
    /// the remaining time so the next host request can restore it.
    pub async fn freeze_all(&self) {
        let registry = self.ctx.supervisor.registry();
        for record in registry.records().await {
            if !registry.is_running(record.port).await {
                tracing::debug!(name = %record.name, "not running; no need to freeze");
                continue;
            }
            let current = match timer::read_timer(&self.ctx.config.status_page_path(&record.name)).await {
                Ok(t) => t,
                Err(e) => {
                    tracing::error!(name = %record.name, error = %e, "timer could not be parsed; cannot freeze");
                    continue;
                }
            };
            if current.turn == 0 {
                tracing::info!(name = %record.name, "game has not started; no need to freeze");
                continue;
            }

            let lease = self.ctx.supervisor.lease(record.port).await;
            let paused = TimerValue::from(current.paused());
            match backend_for(record.game_type)
                .change_current_timer(&self.ctx, &lease, &record, &paused)
                .await
            {
                Ok(()) => {}
                Err(BackendError::Unsupported(_)) => {
                    tracing::debug!(name = %record.name, "game type has no timer; not frozen");
                    continue;
                }
                Err(e) => {
                    tracing::error!(name = %record.name, error = %e, "failed to pause timer");
                    continue;
                }
            }
            if let Err(e) = registry.set_frozen(record.port, current.remaining_seconds()).await {
                tracing::error!(name = %record.name, error = %e, "failed to persist frozen state");
            } else {
                tracing::info!(name = %record.name, remaining = current.remaining_seconds(), "game frozen");
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::backends::test_support::fixture;
    use clockwork_process::GameType;

    fn free_port() -> u16 {
        let l = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
        l.local_addr().unwrap().port()
    }

    fn sleeper(port: u16, name: &str, game_type: GameType) -> GameRecord {
        GameRecord::new(
            port,
            name,
            game_type,
            vec!["-c".to_string(), "exec sleep 30".to_string()],
        )
    }

    #[tokio::test]
    async fn concurrent_requests_are_staggered() {
        let fx = fixture().await;
        let delay = Duration::from_millis(300);
        let hosting = HostingCoordinator::new(fx.ctx.clone(), delay);
        let registry = fx.ctx.supervisor.registry().clone();

        let ports: Vec<u16> = (0..3).map(|_| free_port()).collect();
        for (i, port) in ports.iter().enumerate() {
            registry
                .create(sleeper(*port, &format!("Game{i}"), GameType::Coe4))
                .await
                .unwrap();
        }

        let started = tokio::time::Instant::now();
        let tasks: Vec<_> = ports
            .iter()
            .map(|port| {
                let hosting = hosting.clone();
                let port = *port;
                tokio::spawn(async move {
                    let out = hosting.request_hosting(port, None, None).await.unwrap();
                    (out, started.elapsed())
                })
            })
            .collect();

        let mut elapsed = Vec::new();
        for t in tasks {
            let (out, took) = t.await.unwrap();
            assert!(matches!(out, HostingOutcome::Spawned(_)));
            elapsed.push(took);
        }
        elapsed.sort();
        assert!(elapsed[0] < Duration::from_millis(250), "{elapsed:?}");
        for (i, took) in elapsed.iter().enumerate() {
            assert!(*took >= delay * i as u32, "{elapsed:?}");
        }
        assert!(hosting.pending().await.is_empty());

        fx.ctx.supervisor.shut_down_all().await;
    }

    #[tokio::test]
    async fn running_game_is_not_hosted_twice() {
        let fx = fixture().await;
        let hosting = HostingCoordinator::new(fx.ctx.clone(), Duration::from_millis(10));
        let port = free_port();
        fx.ctx
            .supervisor
            .registry()
            .create(sleeper(port, "Foo", GameType::Coe4))
            .await
            .unwrap();

        let first = hosting.request_hosting(port, None, None).await.unwrap();
        let HostingOutcome::Spawned(spawned) = first else {
            panic!("expected a spawn, got {first:?}");
        };
        let again = hosting.request_hosting(port, None, None).await.unwrap();
        assert_eq!(again, HostingOutcome::AlreadyRunning);
        assert_eq!(
            fx.ctx.supervisor.registry().lock().await[&port]
                .process
                .as_ref()
                .map(|h| h.generation()),
            Some(spawned.generation)
        );
        fx.ctx.supervisor.kill(port).await.unwrap();
    }

    #[tokio::test]
    async fn frozen_running_game_gets_its_timer_back() {
        let fx = fixture().await;
        let hosting = HostingCoordinator::new(fx.ctx.clone(), Duration::from_millis(10));
        let port = free_port();
        let record = sleeper(port, "Foo", GameType::Dom5);
        let registry = fx.ctx.supervisor.registry().clone();
        registry.create(record.clone()).await.unwrap();
        let saves = fx.ctx.savedgames_dir(&record);
        std::fs::create_dir_all(&saves).unwrap();

        let HostingOutcome::Spawned(spawned) = hosting.request_hosting(port, None, None).await.unwrap() else {
            panic!("expected a spawn");
        };

        std::fs::create_dir_all(&fx.ctx.config.status_page_base_path).unwrap();
        std::fs::write(
            fx.ctx.config.status_page_path("Foo"),
            r#"<td class="blackbolddata" colspan="2">Foo, turn 4 (time left: 2 hours 5 minutes)</td>"#,
        )
        .unwrap();
        hosting.freeze_all().await;
        let frozen = registry.get(port).await.unwrap();
        assert!(frozen.frozen);
        assert_eq!(frozen.frozen_timer, Some(2 * 3600 + 5 * 60));
        assert_eq!(std::fs::read_to_string(saves.join("domcmd")).unwrap(), "settimeleft 0");

        let out = hosting.request_hosting(port, None, None).await.unwrap();
        assert_eq!(out, HostingOutcome::TimerRestored);
        assert_eq!(
            std::fs::read_to_string(saves.join("domcmd")).unwrap(),
            format!("settimeleft {}", 2 * 3600 + 5 * 60)
        );
        let thawed = registry.get(port).await.unwrap();
        assert!(!thawed.frozen);
        assert_eq!(thawed.frozen_timer, None);
        assert_eq!(
            registry.lock().await[&port].process.as_ref().map(|h| h.generation()),
            Some(spawned.generation)
        );
        fx.ctx.supervisor.kill(port).await.unwrap();
    }

    #[tokio::test]
    async fn stopped_frozen_game_is_spawned_and_thawed() {
        let fx = fixture().await;
        let hosting = HostingCoordinator::new(fx.ctx.clone(), Duration::from_millis(10));
        let port = free_port();
        let record = sleeper(port, "Foo", GameType::Dom5);
        let registry = fx.ctx.supervisor.registry().clone();
        registry.create(record.clone()).await.unwrap();
        let saves = fx.ctx.savedgames_dir(&record);
        std::fs::create_dir_all(&saves).unwrap();
        registry.set_frozen(port, 7200).await.unwrap();

        let first = hosting.request_hosting(port, None, None).await.unwrap();
        assert!(matches!(first, HostingOutcome::Spawned(_)), "{first:?}");
        assert_eq!(std::fs::read_to_string(saves.join("domcmd")).unwrap(), "settimeleft 7200");
        let thawed = registry.get(port).await.unwrap();
        assert!(!thawed.frozen);
        assert_eq!(thawed.frozen_timer, None);

        let again = hosting.request_hosting(port, None, None).await.unwrap();
        assert_eq!(again, HostingOutcome::AlreadyRunning);
        fx.ctx.supervisor.kill(port).await.unwrap();
    }

    #[tokio::test]
    async fn unknown_port_is_rejected() {
        let fx = fixture().await;
        let hosting = HostingCoordinator::new(fx.ctx.clone(), Duration::ZERO);
        let err = hosting.request_hosting(1, None, None).await.unwrap_err();
        assert!(matches!(err, HostingError::Registry(RegistryError::UnknownPort(1))));
    }
}
