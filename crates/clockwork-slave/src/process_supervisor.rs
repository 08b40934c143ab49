use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use clockwork_process::GameEvent;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::{ChildStdin, Command},
    sync::{Mutex, OwnedMutexGuard, mpsc, watch},
    task::JoinHandle,
};

use crate::port_probe::is_port_in_use;
use crate::registry::GameRegistry;
use crate::supervisor_support::signal_name;

/// How long the close observer waits for the exit status after both output
/// streams hit EOF before deciding the process closed its stdio while alive.
const STDIO_CLOSE_GRACE: Duration = Duration::from_millis(1500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KillPolicy {
    pub max_attempts: u32,
    pub attempt_delay: Duration,
    /// Hard cap on the whole kill, on top of the attempt count.
    pub max_total: Duration,
    pub graceful_signal: i32,
    /// Sent on the last attempt instead of `graceful_signal`.
    pub final_signal: i32,
}

impl Default for KillPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            attempt_delay: Duration::from_secs(3),
            max_total: Duration::from_secs(60),
            graceful_signal: libc::SIGTERM,
            final_signal: libc::SIGKILL,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("The path {} is incorrect. Cannot host game {name}.", .path.display())]
    MissingExecutable { name: String, path: PathBuf },
    #[error("No args were provided to host the game {0}.")]
    MissingArgs(String),
    #[error("The slave server has no data for the game on port {0}.")]
    UnknownGame(u16),
    #[error("The game {0} is already running; cannot host over it.")]
    AlreadyRunning(String),
    #[error("failed to launch {name}: {source}")]
    Launch {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum KillError {
    #[error("The game instance on port {port} is still not killed after {attempts} attempts.")]
    ProcessAlive { port: u16, attempts: u32 },
    #[error(
        "The game instance on port {port} was terminated, but the port is still in use after {attempts} attempts."
    )]
    PortStillBound { port: u16, attempts: u32 },
    #[error("Killing the game instance on port {port} timed out after {elapsed_ms}ms ({attempts} attempts); {failed}.")]
    Timeout {
        port: u16,
        attempts: u32,
        elapsed_ms: u64,
        failed: KillCheck,
    },
}

/// The check that had not passed when a kill gave up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillCheck {
    ProcessAlive,
    PortStillBound,
}

impl std::fmt::Display for KillCheck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KillCheck::ProcessAlive => f.write_str("the process is still alive"),
            KillCheck::PortStillBound => f.write_str("the process is gone but the port is still in use"),
        }
    }
}

impl KillError {
    pub fn port(&self) -> u16 {
        match self {
            KillError::ProcessAlive { port, .. }
            | KillError::PortStillBound { port, .. }
            | KillError::Timeout { port, .. } => *port,
        }
    }

    /// Whether the process was gone and only the port stayed bound.
    pub fn port_still_bound(&self) -> bool {
        matches!(
            self,
            KillError::PortStillBound { .. }
                | KillError::Timeout {
                    failed: KillCheck::PortStillBound,
                    ..
                }
        )
    }
}

/// One spawned game process. Owned by its `Game` entry in the registry.
#[derive(Debug)]
pub struct ProcessHandle {
    generation: u64,
    pid: Option<u32>,
    pgid: Option<i32>,
    kill_requested: bool,
    stdin: Option<ChildStdin>,
    streams: Option<JoinHandle<()>>,
}

impl ProcessHandle {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn kill_requested(&self) -> bool {
        self.kill_requested
    }

    /// Stops listening to the child's stdio so teardown does not produce a
    /// burst of stream events.
    fn destroy_streams(&mut self) {
        self.stdin.take();
        if let Some(task) = self.streams.take() {
            task.abort();
        }
    }

    fn signal(&self, sig: i32) -> bool {
        let Some(target) = self.pgid.map(|g| -g).or(self.pid.map(|p| p as i32)) else {
            return false;
        };
        #[cfg(unix)]
        {
            let rc = unsafe { libc::kill(target, sig) };
            rc == 0
        }
        #[cfg(not(unix))]
        {
            let _ = (target, sig);
            false
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpawnedProcess {
    pub generation: u64,
    pub pid: Option<u32>,
}

/// Exclusive right to operate on one port's process. Spawn, kill and restart
/// of the same game all go through one of these.
pub struct PortLease {
    port: u16,
    _guard: OwnedMutexGuard<()>,
}

#[cfg(target_os = "linux")]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    // If the slave dies, take the game down with it.
    let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &ExitStatus) -> Option<i32> {
    None
}

#[derive(Clone)]
pub struct ProcessSupervisor {
    registry: GameRegistry,
    events: mpsc::UnboundedSender<GameEvent>,
    policy: KillPolicy,
    probe_timeout: Duration,
    port_locks: Arc<Mutex<HashMap<u16, Arc<Mutex<()>>>>>,
    next_generation: Arc<AtomicU64>,
}

impl ProcessSupervisor {
    pub fn new(
        registry: GameRegistry,
        events: mpsc::UnboundedSender<GameEvent>,
        policy: KillPolicy,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            events,
            policy,
            probe_timeout,
            port_locks: Arc::new(Mutex::new(HashMap::new())),
            next_generation: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn registry(&self) -> &GameRegistry {
        &self.registry
    }

    pub fn policy(&self) -> KillPolicy {
        self.policy
    }

    pub async fn lease(&self, port: u16) -> PortLease {
        let lock = {
            let mut locks = self.port_locks.lock().await;
            locks.entry(port).or_default().clone()
        };
        PortLease {
            port,
            _guard: lock.lock_owned().await,
        }
    }

    #[cfg(test)]
    pub async fn spawn(
        &self,
        port: u16,
        exe: &Path,
        args: Option<Vec<String>>,
    ) -> Result<SpawnedProcess, SpawnError> {
        let lease = self.lease(port).await;
        self.spawn_leased(&lease, exe, args).await
    }

    pub async fn kill(&self, port: u16) -> Result<(), KillError> {
        let lease = self.lease(port).await;
        self.kill_leased(&lease).await
    }

    /// Kills the game and, if that fails, drops the handle anyway after a
    /// last SIGKILL to the process group.
    pub async fn nuke(&self, port: u16) {
        let lease = self.lease(port).await;
        self.nuke_leased(&lease).await;
    }

    /// Kills every game that has a process. Failures are logged, not returned.
    pub async fn shut_down_all(&self) {
        let ports: Vec<u16> = {
            let games = self.registry.lock().await;
            games
                .iter()
                .filter(|(_, g)| g.process.is_some())
                .map(|(port, _)| *port)
                .collect()
        };
        tracing::info!(count = ports.len(), "shutting down all games");

        let tasks: Vec<_> = ports
            .into_iter()
            .map(|port| {
                let sup = self.clone();
                tokio::spawn(async move {
                    if let Err(e) = sup.kill(port).await {
                        tracing::error!(port, error = %e, "failed to shut down game");
                    }
                })
            })
            .collect();
        for t in tasks {
            let _ = t.await;
        }
    }

    pub async fn spawn_leased(
        &self,
        lease: &PortLease,
        exe: &Path,
        args: Option<Vec<String>>,
    ) -> Result<SpawnedProcess, SpawnError> {
        let port = lease.port;
        let name = {
            let games = self.registry.lock().await;
            let game = games.get(&port).ok_or(SpawnError::UnknownGame(port))?;
            if game.process.is_some() {
                return Err(SpawnError::AlreadyRunning(game.record.name.clone()));
            }
            game.record.name.clone()
        };

        let Some(args) = args else {
            return Err(SpawnError::MissingArgs(name));
        };
        if exe.as_os_str().is_empty() || tokio::fs::metadata(exe).await.is_err() {
            return Err(SpawnError::MissingExecutable {
                name,
                path: exe.to_path_buf(),
            });
        }

        let mut cmd = Command::new(exe);
        cmd.args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        #[cfg(unix)]
        {
            unsafe {
                cmd.pre_exec(|| {
                    set_parent_death_signal()?;
                    if libc::setsid() == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let mut child = cmd.spawn().map_err(|source| SpawnError::Launch {
            name: name.clone(),
            source,
        })?;
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let pid = child.id();
        let pgid = pid.map(|p| p as i32);
        tracing::info!(port, name = %name, pid = ?pid, generation, exe = %exe.display(), "game process spawned");

        let (exit_tx, exit_rx) = watch::channel::<Option<ExitStatus>>(None);
        let streams = tokio::spawn(self.clone().observe_streams(
            port,
            generation,
            name.clone(),
            child.stdout.take(),
            child.stderr.take(),
            exit_rx,
        ));

        let handle = ProcessHandle {
            generation,
            pid,
            pgid,
            kill_requested: false,
            stdin: child.stdin.take(),
            streams: Some(streams),
        };

        {
            let mut games = self.registry.lock().await;
            match games.get_mut(&port) {
                Some(game) => game.process = Some(handle),
                None => {
                    drop(games);
                    tracing::warn!(port, name = %name, "game was deleted while spawning; killing the new process");
                    let mut handle = handle;
                    handle.destroy_streams();
                    handle.signal(libc::SIGKILL);
                    return Err(SpawnError::UnknownGame(port));
                }
            }
        }

        let sup = self.clone();
        tokio::spawn(async move {
            let res = child.wait().await;
            sup.observe_exit(port, generation, &name, res, exit_tx).await;
        });

        Ok(SpawnedProcess { generation, pid })
    }

    pub async fn kill_leased(&self, lease: &PortLease) -> Result<(), KillError> {
        let port = lease.port;
        let policy = self.policy;
        let started = tokio::time::Instant::now();
        let deadline = started + policy.max_total;

        let generation = {
            let games = self.registry.lock().await;
            match games.get(&port).and_then(|g| g.process.as_ref()) {
                Some(h) => h.generation,
                None => {
                    tracing::debug!(port, "kill requested but no process is attached");
                    return Ok(());
                }
            }
        };

        let mut handle_attached = true;
        let mut attempts = 0;
        while attempts < policy.max_attempts {
            attempts += 1;
            let sig = if attempts == policy.max_attempts {
                policy.final_signal
            } else {
                policy.graceful_signal
            };

            {
                let mut games = self.registry.lock().await;
                if let Some(h) = games
                    .get_mut(&port)
                    .and_then(|g| g.process.as_mut())
                    .filter(|h| h.generation == generation)
                {
                    h.destroy_streams();
                    h.kill_requested = true;
                    let sent = h.signal(sig);
                    tracing::info!(port, attempt = attempts, signal = signal_name(sig), sent, "kill attempt");
                }
            }

            let now = tokio::time::Instant::now();
            tokio::time::sleep(policy.attempt_delay.min(deadline.saturating_duration_since(now)))
                .await;

            handle_attached = self.handle_attached(port, generation).await;
            let port_bound = is_port_in_use(port, self.probe_timeout).await;
            if !handle_attached && !port_bound {
                tracing::info!(port, attempts, elapsed_ms = started.elapsed().as_millis() as u64, "game process killed");
                return Ok(());
            }
            tracing::debug!(port, attempt = attempts, handle_attached, port_bound, "kill not confirmed yet");

            if tokio::time::Instant::now() >= deadline {
                let err = KillError::Timeout {
                    port,
                    attempts,
                    elapsed_ms: started.elapsed().as_millis() as u64,
                    failed: if handle_attached {
                        KillCheck::ProcessAlive
                    } else {
                        KillCheck::PortStillBound
                    },
                };
                tracing::warn!(error = %err, "kill gave up");
                return Err(err);
            }
        }

        let err = if handle_attached {
            KillError::ProcessAlive { port, attempts }
        } else {
            KillError::PortStillBound { port, attempts }
        };
        tracing::warn!(error = %err, "kill gave up");
        Err(err)
    }

    pub async fn nuke_leased(&self, lease: &PortLease) {
        let Err(e) = self.kill_leased(lease).await else {
            return;
        };
        tracing::warn!(port = lease.port, error = %e, "kill failed; dropping the process handle");
        let mut games = self.registry.lock().await;
        if let Some(mut h) = games.get_mut(&lease.port).and_then(|g| g.process.take()) {
            h.destroy_streams();
            h.signal(libc::SIGKILL);
        }
    }

    async fn handle_attached(&self, port: u16, generation: u64) -> bool {
        let games = self.registry.lock().await;
        games
            .get(&port)
            .and_then(|g| g.process.as_ref())
            .is_some_and(|h| h.generation == generation)
    }

    /// Detaches the handle if it still belongs to `generation`. Returns whether
    /// a kill had been requested for it; `None` if something else already
    /// cleared or replaced it.
    async fn clear_handle(&self, port: u16, generation: u64) -> Option<bool> {
        let mut games = self.registry.lock().await;
        let game = games.get_mut(&port)?;
        if game.process.as_ref().map(|h| h.generation) != Some(generation) {
            return None;
        }
        game.process.take().map(|h| h.kill_requested)
    }

    fn emit(&self, event: GameEvent) {
        let _ = self.events.send(event);
    }

    async fn observe_exit(
        &self,
        port: u16,
        generation: u64,
        name: &str,
        res: std::io::Result<ExitStatus>,
        exit_tx: watch::Sender<Option<ExitStatus>>,
    ) {
        let status = match res {
            Ok(status) => status,
            Err(e) => {
                self.clear_handle(port, generation).await;
                tracing::error!(port, name, error = %e, "failed to wait for game process");
                self.emit(GameEvent::GameError {
                    name: name.to_string(),
                    error: e.to_string(),
                });
                return;
            }
        };

        // Already replaced or force-cleared means someone else took it down.
        let kill_requested = self.clear_handle(port, generation).await.unwrap_or(true);
        let _ = exit_tx.send(Some(status));

        let code = status.code();
        let signal = exit_signal(&status);
        if kill_requested {
            tracing::info!(port, name, ?code, signal = ?signal.map(signal_name), "game process terminated on request");
        } else if code == Some(0) {
            tracing::info!(port, name, "game exited without errors (perhaps the port was already in use)");
        } else if let Some(sig) = signal {
            tracing::error!(port, name, signal = signal_name(sig), "game process was abnormally terminated");
            self.emit(GameEvent::GameClosedUnexpectedly {
                name: name.to_string(),
                signal: Some(sig),
            });
        } else {
            tracing::error!(port, name, ?code, "game process exited with an error");
            self.emit(GameEvent::GameExited {
                name: name.to_string(),
                code,
            });
        }
    }

    async fn observe_streams(
        self,
        port: u16,
        generation: u64,
        name: String,
        stdout: Option<impl AsyncRead + Unpin>,
        stderr: Option<impl AsyncRead + Unpin>,
        mut exit_rx: watch::Receiver<Option<ExitStatus>>,
    ) {
        let out = async {
            let Some(out) = stdout else { return };
            let mut lines = BufReader::new(out).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => tracing::trace!(port, name = %name, "[stdout] {line}"),
                    Ok(None) => break,
                    Err(e) => {
                        self.stream_error(port, &name, "stdout", e);
                        break;
                    }
                }
            }
        };
        let err = async {
            let Some(err) = stderr else { return };
            let mut lines = BufReader::new(err).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        tracing::info!(port, name = %name, "[stderr] {line}");
                        self.emit(GameEvent::StderrData {
                            name: name.clone(),
                            data: line,
                        });
                    }
                    Ok(None) => break,
                    Err(e) => {
                        self.stream_error(port, &name, "stderr", e);
                        break;
                    }
                }
            }
        };
        tokio::join!(out, err);

        let status = tokio::time::timeout(STDIO_CLOSE_GRACE, exit_rx.wait_for(Option::is_some))
            .await
            .ok()
            .and_then(|r| r.ok().and_then(|s| *s));

        let still_attached = {
            let games = self.registry.lock().await;
            games
                .get(&port)
                .and_then(|g| g.process.as_ref())
                .is_some_and(|h| h.generation == generation && !h.kill_requested)
        };
        if !still_attached {
            return;
        }

        let code = status.as_ref().and_then(ExitStatus::code);
        let signal = status.as_ref().and_then(exit_signal);
        tracing::warn!(port, name = %name, ?code, ?signal, "game stdio closed");
        self.emit(GameEvent::StdioClosed { name, code, signal });
    }

    fn stream_error(&self, port: u16, name: &str, stream: &str, e: std::io::Error) {
        tracing::error!(port, name, stream, error = %e, "game stream error");
        self.emit(GameEvent::GameError {
            name: name.to_string(),
            error: format!("{stream}: {e}"),
        });
    }
}
