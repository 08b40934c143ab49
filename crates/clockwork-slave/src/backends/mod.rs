//! Game-type specific behaviour behind one trait.
//!
//! Dominions 4 and 5 share most of their file layout (`maps/`, `mods/`,
//! `savedgames/<name>/`), so the shared pieces live here as free functions.
//! Operations a game does not have return [`BackendError::Unsupported`].

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Arc,
    time::SystemTime,
};

use async_trait::async_trait;
use clockwork_process::{GameRecord, GameType};
use serde::{Deserialize, Serialize};

use crate::config::SlaveConfig;
use crate::process_supervisor::{KillError, PortLease, ProcessSupervisor, SpawnError, SpawnedProcess};
use crate::savefiles::{self, BackupKind, SAVE_EXTENSIONS};
use crate::supervisor_support::unix_ms;
use crate::timer::{TimerError, TimerValue};

mod coe4;
mod dom4;
mod dom5;

pub use coe4::Coe4Backend;
pub use dom4::Dom4Backend;
pub use dom5::Dom5Backend;

/// Turn files and score dumps above this are refused; chat attachments
/// cannot carry them.
pub const MAX_ATTACHMENT_BYTES: u64 = 8_000_000;

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("This game does not support the {0} function.")]
    Unsupported(&'static str),
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Kill(#[from] KillError),
    #[error(transparent)]
    Spawn(#[from] SpawnError),
    #[error(transparent)]
    Timer(#[from] TimerError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl BackendError {
    fn msg(s: impl Into<String>) -> Self {
        Self::Message(s.into())
    }
}

pub type BackendResult<T> = Result<T, BackendError>;

/// What every backend operation gets to work with.
#[derive(Clone)]
pub struct BackendContext {
    pub config: Arc<SlaveConfig>,
    pub supervisor: ProcessSupervisor,
    /// Executable the games call back into for `--preexec`/`--postexec`.
    pub hook_exe: PathBuf,
}

impl BackendContext {
    pub fn savedgames_dir(&self, game: &GameRecord) -> PathBuf {
        self.config.savedgames_dir(game.game_type, &game.name)
    }

    pub fn data_path(&self, game_type: GameType) -> &Path {
        &self.config.game_paths(game_type).data_path
    }

    /// Spawns `game` with `args` plus the flags its game type always needs.
    pub async fn launch(
        &self,
        lease: &PortLease,
        game: &GameRecord,
        args: Option<Vec<String>>,
    ) -> Result<SpawnedProcess, SpawnError> {
        let backend = backend_for(game.game_type);
        let exe = &self.config.game_paths(game.game_type).exe_path;
        let args = args.map(|mut a| {
            a.extend(backend.additional_args(self, &game.name));
            a
        });
        self.supervisor.spawn_leased(lease, exe, args).await
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRequest {
    pub timer: Option<TimerValue>,
    pub args: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NationStatus {
    pub nation_name: String,
    pub nation_nbr: i64,
    /// Differs from `nation_nbr` for disciples.
    pub pretender_nbr: i64,
    /// 0 AI, 1 human, 2 went AI this turn.
    pub controller: i64,
    pub ai_level: i64,
    /// 0 not checked, 1 marked unfinished, 2 done.
    pub turn_played: i64,
}

/// `statusdump.txt` keyed by nation file name (`mid_arco.2h`).
pub type StatusDump = BTreeMap<String, NationStatus>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stales {
    pub ai: Vec<String>,
    pub stales: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmittedPretender {
    pub name: String,
    pub filename: String,
}

#[async_trait]
pub trait GameBackend: Send + Sync {
    fn game_type(&self) -> GameType;

    /// Flags appended to every launch of this game type.
    fn additional_args(&self, ctx: &BackendContext, game_name: &str) -> Vec<String>;

    /// Flags that start the game with `timer` on its clock. `None` when the
    /// clock can only be set once the game is up.
    fn timer_launch_args(&self, _timer: &TimerValue) -> Option<Vec<String>> {
        None
    }

    async fn mod_list(&self, _ctx: &BackendContext) -> BackendResult<Vec<String>> {
        Err(BackendError::Unsupported("getModList"))
    }

    async fn map_list(&self, _ctx: &BackendContext) -> BackendResult<BTreeMap<String, usize>> {
        Err(BackendError::Unsupported("getMapList"))
    }

    async fn start(
        &self,
        _ctx: &BackendContext,
        _lease: &PortLease,
        _game: &GameRecord,
        _req: StartRequest,
    ) -> BackendResult<()> {
        Err(BackendError::Unsupported("start"))
    }

    async fn restart(&self, _ctx: &BackendContext, _lease: &PortLease, _game: &GameRecord) -> BackendResult<()> {
        Err(BackendError::Unsupported("restart"))
    }

    async fn change_current_timer(
        &self,
        _ctx: &BackendContext,
        _lease: &PortLease,
        _game: &GameRecord,
        _timer: &TimerValue,
    ) -> BackendResult<()> {
        Err(BackendError::Unsupported("changeCurrentTimer"))
    }

    async fn change_default_timer(
        &self,
        _ctx: &BackendContext,
        _game: &GameRecord,
        _default_minutes: u64,
        _current: &TimerValue,
    ) -> BackendResult<()> {
        Err(BackendError::Unsupported("changeDefaultTimer"))
    }

    async fn backup_savefiles(
        &self,
        _ctx: &BackendContext,
        _game: &GameRecord,
        _is_new_turn: bool,
        _turn: u32,
    ) -> BackendResult<PathBuf> {
        Err(BackendError::Unsupported("backupSavefiles"))
    }

    async fn rollback(
        &self,
        _ctx: &BackendContext,
        _lease: &PortLease,
        _game: &GameRecord,
        _turn: u32,
        _timer: Option<&TimerValue>,
    ) -> BackendResult<()> {
        Err(BackendError::Unsupported("rollback"))
    }

    async fn stales(&self, _ctx: &BackendContext, _game: &GameRecord, _last_hosted_ms: u64) -> BackendResult<Stales> {
        Err(BackendError::Unsupported("getStales"))
    }

    async fn dump(&self, _ctx: &BackendContext, _game: &GameRecord) -> BackendResult<StatusDump> {
        Err(BackendError::Unsupported("getDump"))
    }

    async fn submitted_pretenders(
        &self,
        _ctx: &BackendContext,
        _game: &GameRecord,
    ) -> BackendResult<Vec<SubmittedPretender>> {
        Err(BackendError::Unsupported("getSubmittedPretenders"))
    }

    async fn remove_pretender(&self, _ctx: &BackendContext, _game: &GameRecord, _nation_file: &str) -> BackendResult<()> {
        Err(BackendError::Unsupported("removePretender"))
    }

    async fn turn_file(&self, _ctx: &BackendContext, _game: &GameRecord, _nation_file: &str) -> BackendResult<Vec<u8>> {
        Err(BackendError::Unsupported("getTurnFile"))
    }

    async fn score_dump(&self, _ctx: &BackendContext, _game: &GameRecord) -> BackendResult<Vec<u8>> {
        Err(BackendError::Unsupported("getScoreDump"))
    }

    async fn last_hosted_time(&self, _ctx: &BackendContext, _game: &GameRecord) -> BackendResult<u64> {
        Err(BackendError::Unsupported("getLastHostedTime"))
    }

    async fn delete_savefiles(&self, ctx: &BackendContext, game: &GameRecord) -> BackendResult<String> {
        let dir = ctx.savedgames_dir(game);
        savefiles::delete_savedgames_dir(&dir).await?;
        Ok(format!("{}: deleted the save files.", game.name))
    }
}

static DOM4: Dom4Backend = Dom4Backend;
static DOM5: Dom5Backend = Dom5Backend;
static COE4: Coe4Backend = Coe4Backend;

pub fn backend_for(game_type: GameType) -> &'static dyn GameBackend {
    match game_type {
        GameType::Dom4 => &DOM4,
        GameType::Dom5 => &DOM5,
        GameType::Coe4 => &COE4,
    }
}

fn statuspage_arg(ctx: &BackendContext, game_name: &str) -> String {
    ctx.config.status_page_path(game_name).display().to_string()
}

fn backup_hook_args(ctx: &BackendContext, game_name: &str) -> Vec<String> {
    [BackupKind::LatestTurn, BackupKind::NewTurn]
        .into_iter()
        .flat_map(|kind| {
            [
                kind.flag().to_string(),
                savefiles::hook_command(&ctx.hook_exe, game_name, kind),
            ]
        })
        .collect()
}

/// Nation and pretender file names come from the master; keep them inside
/// the save directory.
fn plain_file_name(name: &str) -> BackendResult<&str> {
    let ok = !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\'])
        && !name.contains('\0');
    if ok {
        Ok(name)
    } else {
        Err(BackendError::msg(format!("Invalid file name: {name}")))
    }
}

async fn list_files_with_extension(dir: &Path, ext: &str) -> BackendResult<Vec<PathBuf>> {
    let mut rd = match tokio::fs::read_dir(dir).await {
        Ok(rd) => rd,
        Err(e) => {
            tracing::error!(path = %dir.display(), error = %e, "failed to read directory");
            return Err(BackendError::msg("This directory was not found on the server."));
        }
    };
    let mut out = Vec::new();
    while let Some(entry) = rd.next_entry().await.map_err(anyhow::Error::from)? {
        let name = entry.file_name().to_string_lossy().to_string();
        if name.to_ascii_lowercase().ends_with(ext) {
            out.push(entry.path());
        }
    }
    out.sort();
    Ok(out)
}

fn file_name_of(p: &Path) -> String {
    p.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

pub(crate) async fn dominions_mod_list(ctx: &BackendContext, game_type: GameType) -> BackendResult<Vec<String>> {
    let mods = list_files_with_extension(&ctx.data_path(game_type).join("mods"), ".dm").await?;
    Ok(mods.iter().map(|p| file_name_of(p)).collect())
}

/// Province count of a `.map` file: one `#terrain` line per province.
pub fn count_provinces(map: &str) -> usize {
    map.lines()
        .filter(|l| l.trim_start().to_ascii_lowercase().starts_with("#terrain"))
        .count()
}

pub(crate) async fn dominions_map_list(
    ctx: &BackendContext,
    game_type: GameType,
) -> BackendResult<BTreeMap<String, usize>> {
    let maps = list_files_with_extension(&ctx.data_path(game_type).join("maps"), ".map").await?;
    let mut out = BTreeMap::new();
    for p in maps {
        match tokio::fs::read(&p).await {
            Ok(raw) => {
                out.insert(file_name_of(&p), count_provinces(&String::from_utf8_lossy(&raw)));
            }
            Err(e) => tracing::warn!(path = %p.display(), error = %e, "skipping unreadable map"),
        }
    }
    Ok(out)
}

pub(crate) async fn read_attachment(path: &Path, what: &str) -> BackendResult<Vec<u8>> {
    let meta = match tokio::fs::metadata(path).await {
        Ok(m) => m,
        Err(_) => {
            tracing::warn!(path = %path.display(), "requested {what} does not exist");
            return Err(BackendError::msg(format!("The {what} does not exist.")));
        }
    };
    if meta.len() > MAX_ATTACHMENT_BYTES {
        let mb = meta.len() as f64 / 1_000_000.0;
        return Err(BackendError::msg(format!(
            "The {what} weighs {mb:.2}MB. It is too big to be sent."
        )));
    }
    tokio::fs::read(path).await.map_err(|e| {
        tracing::error!(path = %path.display(), error = %e, "failed to read {what}");
        BackendError::msg(format!("The contents of the {what} could not be read."))
    })
}

pub(crate) async fn dominions_last_hosted_time(ctx: &BackendContext, game: &GameRecord) -> BackendResult<u64> {
    let path = ctx.savedgames_dir(game).join("ftherlnd");
    let meta = tokio::fs::metadata(&path)
        .await
        .map_err(|e| BackendError::msg(format!("Could not read {}: {e}", path.display())))?;
    Ok(unix_ms(meta.modified().unwrap_or(SystemTime::UNIX_EPOCH)))
}

pub(crate) async fn dominions_backup(
    ctx: &BackendContext,
    game: &GameRecord,
    is_new_turn: bool,
    turn: u32,
) -> BackendResult<PathBuf> {
    let kind = if is_new_turn {
        BackupKind::NewTurn
    } else {
        BackupKind::LatestTurn
    };
    Ok(savefiles::backup_savefiles(&ctx.savedgames_dir(game), &ctx.config.backups, kind, &game.name, turn).await?)
}

/// Copies the backup of `turn` over the live save directory.
pub(crate) async fn dominions_restore(ctx: &BackendContext, game: &GameRecord, turn: u32) -> BackendResult<()> {
    let source = savefiles::find_rollback_source(&ctx.config.backups, &game.name, turn)
        .await
        .ok_or_else(|| BackendError::msg("No backup of the previous turn was found to be able to rollback."))?;
    let restored = savefiles::restore_backup(&source, &ctx.savedgames_dir(game)).await?;
    tracing::info!(game = %game.name, turn, restored, source = %source.display(), "savefiles rolled back");
    Ok(())
}

/// Wipes the turn files, then reboots the game on its stored args.
pub(crate) async fn dominions_restart(ctx: &BackendContext, lease: &PortLease, game: &GameRecord) -> BackendResult<()> {
    let dir = ctx.savedgames_dir(game);
    if tokio::fs::metadata(&dir).await.is_ok() {
        savefiles::delete_dir_contents(&dir, Some(SAVE_EXTENSIONS)).await?;
    }
    ctx.supervisor.kill_leased(lease).await.map_err(|e| {
        BackendError::msg(format!(
            "The data was restarted, but the game's process could not be killed to reboot it ({e}). Try to use the kill command to do so manually."
        ))
    })?;
    ctx.launch(lease, game, Some(game.args.clone())).await.map_err(|e| {
        BackendError::msg(format!(
            "The data was restarted, but the game's process could not be launched after killing it ({e}). Try to use the launch command to do so manually."
        ))
    })?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::registry::GameRegistry;
    use std::time::Duration;
    use tokio::sync::mpsc;

    pub struct Fixture {
        pub dir: tempfile::TempDir,
        pub ctx: BackendContext,
        pub events: mpsc::UnboundedReceiver<clockwork_process::GameEvent>,
    }

    pub async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = SlaveConfig::default();
        cfg.game_data_save_path = dir.path().join("games.json");
        cfg.status_page_base_path = dir.path().join("status");
        cfg.backups.root = dir.path().join("backups");
        for (paths, name) in [(&mut cfg.dom4, "dom4"), (&mut cfg.dom5, "dom5"), (&mut cfg.coe4, "coe4")] {
            paths.exe_path = PathBuf::from("/bin/sh");
            paths.data_path = dir.path().join(name);
        }
        let registry = GameRegistry::open(&cfg.game_data_save_path).await.unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let policy = crate::process_supervisor::KillPolicy {
            attempt_delay: Duration::from_millis(100),
            ..Default::default()
        };
        let supervisor = ProcessSupervisor::new(registry, tx, policy, Duration::from_millis(500));
        Fixture {
            ctx: BackendContext {
                config: Arc::new(cfg),
                supervisor,
                hook_exe: PathBuf::from("/usr/local/bin/clockwork-slave"),
            },
            dir,
            events: rx,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::fixture;
    use super::*;

    #[test]
    fn provinces_are_counted_from_terrain_lines() {
        let map = "#dom2title Test\n#terrain 1 0\n#terrain 2 4096\n  #TERRAIN 3 0\n#neighbour 1 2\n";
        assert_eq!(count_provinces(map), 3);
    }

    #[test]
    fn file_names_must_stay_in_save_dir() {
        assert!(plain_file_name("mid_arco.2h").is_ok());
        for bad in ["", "..", "../games.json", "a/b.2h", "a\\b"] {
            assert!(plain_file_name(bad).is_err(), "{bad}");
        }
    }

    #[tokio::test]
    async fn unsupported_operations_name_the_function() {
        let fx = fixture().await;
        let game = GameRecord::new(6000, "Foo", GameType::Coe4, vec![]);
        let err = backend_for(GameType::Coe4).dump(&fx.ctx, &game).await.unwrap_err();
        assert_eq!(err.to_string(), "This game does not support the getDump function.");
        let err = backend_for(GameType::Dom4).score_dump(&fx.ctx, &game).await.unwrap_err();
        assert!(matches!(err, BackendError::Unsupported("getScoreDump")));
    }

    #[tokio::test]
    async fn mod_and_map_lists_read_the_data_dir() {
        let fx = fixture().await;
        let data = fx.ctx.data_path(GameType::Dom5).to_path_buf();
        std::fs::create_dir_all(data.join("mods")).unwrap();
        std::fs::create_dir_all(data.join("maps")).unwrap();
        std::fs::write(data.join("mods/b.dm"), "").unwrap();
        std::fs::write(data.join("mods/a.DM"), "").unwrap();
        std::fs::write(data.join("mods/readme.txt"), "").unwrap();
        std::fs::write(data.join("maps/Small.map"), "#terrain 1 0\n#terrain 2 0\n").unwrap();
        std::fs::write(data.join("maps/Small.tga"), "").unwrap();

        let backend = backend_for(GameType::Dom5);
        assert_eq!(backend.mod_list(&fx.ctx).await.unwrap(), vec!["a.DM", "b.dm"]);
        let maps = backend.map_list(&fx.ctx).await.unwrap();
        assert_eq!(maps.len(), 1);
        assert_eq!(maps["Small.map"], 2);
    }

    #[tokio::test]
    async fn oversized_attachment_is_refused() {
        let fx = fixture().await;
        let p = fx.dir.path().join("big.trn");
        let f = std::fs::File::create(&p).unwrap();
        f.set_len(MAX_ATTACHMENT_BYTES + 1).unwrap();
        let err = read_attachment(&p, "turn file").await.unwrap_err();
        assert!(err.to_string().contains("too big"));

        let err = read_attachment(&fx.dir.path().join("none.trn"), "turn file").await.unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }
}
