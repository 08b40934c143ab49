use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Context;
use clockwork_process::{GameRecord, GameType};
use tokio::{
    io::AsyncWriteExt,
    sync::{Mutex, MutexGuard},
};

use crate::process_supervisor::ProcessHandle;

const MAX_NAME_LEN: usize = 24;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("This port is already being used by another game, please restart the hosting.")]
    PortInUse(u16),
    #[error("The game name {0} is already used by a different game. Please choose one that's free.")]
    NameInUse(String),
    #[error("The slave server has no data for the game on port {0}.")]
    UnknownPort(u16),
    #[error("The game's name and port do not match.")]
    NameMismatch(u16),
    #[error("{0}")]
    InvalidName(String),
    #[error("An error occurred when trying to save the game data: {0}")]
    Persist(#[source] std::io::Error),
}

/// One managed game. The record is what gets persisted; the process handle
/// only lives as long as this slave does.
#[derive(Debug)]
pub struct Game {
    pub record: GameRecord,
    pub(crate) process: Option<ProcessHandle>,
}

impl Game {
    fn new(record: GameRecord) -> Self {
        Self {
            record,
            process: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.process.as_ref().is_some_and(|p| !p.kill_requested())
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub adopted: Vec<u16>,
    pub updated: Vec<u16>,
    pub replaced: Vec<u16>,
    pub skipped: Vec<u16>,
}

/// Authoritative port -> game table, persisted as one JSON object keyed by
/// port on every mutation.
#[derive(Debug, Clone)]
pub struct GameRegistry {
    inner: Arc<Mutex<BTreeMap<u16, Game>>>,
    save_path: Arc<PathBuf>,
    save_lock: Arc<Mutex<()>>,
}

pub fn validate_name_format(name: &str) -> Result<(), RegistryError> {
    if name.is_empty() {
        return Err(RegistryError::InvalidName(
            "Game name MUST be specified.".to_string(),
        ));
    }
    if name.chars().count() > MAX_NAME_LEN {
        return Err(RegistryError::InvalidName(format!(
            "Game name {name} is too long. It must be within {MAX_NAME_LEN} characters."
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '~'))
    {
        return Err(RegistryError::InvalidName(format!(
            "The game name {name} contains invalid characters. Only letters, numbers, underscores and tildes are allowed."
        )));
    }
    if GameType::ALL
        .iter()
        .any(|t| t.as_str().eq_ignore_ascii_case(name))
    {
        return Err(RegistryError::InvalidName(
            "This is a reserved keyword, please choose a different one.".to_string(),
        ));
    }
    Ok(())
}

fn parse_games(raw: &[u8]) -> anyhow::Result<BTreeMap<u16, Game>> {
    let stored: BTreeMap<String, GameRecord> =
        serde_json::from_slice(raw).context("parse game data")?;
    let mut games = BTreeMap::new();
    for (key, record) in stored {
        if key.trim().parse::<u16>().ok() != Some(record.port) {
            tracing::warn!(key = %key, port = record.port, name = %record.name, "game data key does not match its port; using the record's port");
        }
        games.insert(record.port, Game::new(record));
    }
    Ok(games)
}

impl GameRegistry {
    /// Loads the registry from `path`, creating an empty `{}` file first if
    /// there is none.
    pub async fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create {}", parent.display()))?;
        }

        if tokio::fs::metadata(&path).await.is_err() {
            tracing::info!(path = %path.display(), "game data file not found; creating a new one");
            tokio::fs::write(&path, b"{}")
                .await
                .with_context(|| format!("create {}", path.display()))?;
        }

        let raw = tokio::fs::read(&path)
            .await
            .with_context(|| format!("read {}", path.display()))?;
        let games = parse_games(&raw).with_context(|| format!("load {}", path.display()))?;
        tracing::info!(count = games.len(), path = %path.display(), "game data loaded");

        Ok(Self {
            inner: Arc::new(Mutex::new(games)),
            save_path: Arc::new(path),
            save_lock: Arc::new(Mutex::new(())),
        })
    }

    pub(crate) async fn lock(&self) -> MutexGuard<'_, BTreeMap<u16, Game>> {
        self.inner.lock().await
    }

    pub async fn create(&self, record: GameRecord) -> Result<(), RegistryError> {
        validate_name_format(&record.name)?;
        {
            let mut games = self.inner.lock().await;
            if games.contains_key(&record.port) {
                return Err(RegistryError::PortInUse(record.port));
            }
            if games.values().any(|g| g.record.name_matches(&record.name)) {
                return Err(RegistryError::NameInUse(record.name));
            }
            tracing::info!(port = record.port, name = %record.name, game_type = %record.game_type, "game created");
            games.insert(record.port, Game::new(record));
        }
        self.persist().await
    }

    pub async fn delete(&self, port: u16) -> Result<GameRecord, RegistryError> {
        let removed = {
            let mut games = self.inner.lock().await;
            let game = games.remove(&port).ok_or(RegistryError::UnknownPort(port))?;
            if game.process.is_some() {
                tracing::warn!(port, name = %game.record.name, "deleting a game that still has a process attached");
            }
            game.record
        };
        tracing::info!(port, name = %removed.name, "game deleted");
        self.persist().await?;
        Ok(removed)
    }

    pub async fn get(&self, port: u16) -> Option<GameRecord> {
        self.inner.lock().await.get(&port).map(|g| g.record.clone())
    }

    pub async fn require(&self, port: u16) -> Result<GameRecord, RegistryError> {
        self.get(port).await.ok_or(RegistryError::UnknownPort(port))
    }

    /// Looks the game up by port and checks the caller's idea of its name.
    pub async fn require_named(&self, port: u16, name: &str) -> Result<GameRecord, RegistryError> {
        let rec = self.require(port).await?;
        if rec.name != name {
            return Err(RegistryError::NameMismatch(port));
        }
        Ok(rec)
    }

    pub async fn find_by_name(&self, name: &str) -> Option<GameRecord> {
        self.inner
            .lock()
            .await
            .values()
            .find(|g| g.record.name_matches(name))
            .map(|g| g.record.clone())
    }

    pub async fn names(&self) -> Vec<String> {
        self.inner
            .lock()
            .await
            .values()
            .map(|g| g.record.name.clone())
            .collect()
    }

    pub async fn used_ports(&self) -> Vec<u16> {
        self.inner.lock().await.keys().copied().collect()
    }

    pub async fn records(&self) -> Vec<GameRecord> {
        self.inner
            .lock()
            .await
            .values()
            .map(|g| g.record.clone())
            .collect()
    }

    pub async fn is_running(&self, port: u16) -> bool {
        self.inner
            .lock()
            .await
            .get(&port)
            .is_some_and(Game::is_running)
    }

    pub async fn update_args(&self, port: u16, args: Vec<String>) -> Result<(), RegistryError> {
        {
            let mut games = self.inner.lock().await;
            let game = games.get_mut(&port).ok_or(RegistryError::UnknownPort(port))?;
            game.record.args = args;
        }
        self.persist().await
    }

    pub async fn set_frozen(&self, port: u16, timer_secs: u64) -> Result<(), RegistryError> {
        {
            let mut games = self.inner.lock().await;
            let game = games.get_mut(&port).ok_or(RegistryError::UnknownPort(port))?;
            game.record.frozen = true;
            game.record.frozen_timer = Some(timer_secs);
        }
        self.persist().await
    }

    pub async fn clear_frozen(&self, port: u16) -> Result<(), RegistryError> {
        {
            let mut games = self.inner.lock().await;
            let game = games.get_mut(&port).ok_or(RegistryError::UnknownPort(port))?;
            game.record.frozen = false;
            game.record.frozen_timer = None;
        }
        self.persist().await
    }

    /// Ports whose local record disagrees with the master's about the game name.
    pub async fn mismatched_ports(&self, master: &[GameRecord]) -> Vec<u16> {
        let games = self.inner.lock().await;
        master
            .iter()
            .filter(|m| {
                games
                    .get(&m.port)
                    .is_some_and(|g| !g.record.name_matches(&m.name))
            })
            .map(|m| m.port)
            .collect()
    }

    /// Merges the master's view of this host's games into the local table.
    ///
    /// Matching names keep local frozen state; mismatching names take the
    /// master's record and drop the stale frozen snapshot and process.
    pub async fn reconcile(&self, master: Vec<GameRecord>) -> Result<ReconcileReport, RegistryError> {
        let mut report = ReconcileReport::default();
        {
            let mut games = self.inner.lock().await;
            for m in master {
                let name_taken_elsewhere = games
                    .iter()
                    .any(|(port, g)| *port != m.port && g.record.name_matches(&m.name));
                if name_taken_elsewhere {
                    tracing::warn!(port = m.port, name = %m.name, "master game name is used by another local port; skipping");
                    report.skipped.push(m.port);
                    continue;
                }

                match games.get_mut(&m.port) {
                    None => {
                        tracing::info!(port = m.port, name = %m.name, "adopting game known to master");
                        report.adopted.push(m.port);
                        let mut record = m;
                        record.frozen = false;
                        record.frozen_timer = None;
                        games.insert(record.port, Game::new(record));
                    }
                    Some(local) if local.record.name_matches(&m.name) => {
                        local.record.game_type = m.game_type;
                        if !m.args.is_empty() {
                            local.record.args = m.args;
                        }
                        report.updated.push(local.record.port);
                    }
                    Some(local) => {
                        tracing::warn!(
                            port = m.port,
                            local = %local.record.name,
                            master = %m.name,
                            "merged game names disagree; taking the master's record"
                        );
                        report.replaced.push(m.port);
                        let mut record = m;
                        record.frozen = false;
                        record.frozen_timer = None;
                        local.record = record;
                        local.process = None;
                    }
                }
            }
        }
        self.persist().await?;
        Ok(report)
    }

    /// Rewrites the whole game data file. The process handle never reaches disk.
    pub async fn persist(&self) -> Result<(), RegistryError> {
        // Held across snapshot and write so a later snapshot never lands
        // before an earlier one.
        let _guard = self.save_lock.lock().await;
        let snapshot: BTreeMap<String, GameRecord> = {
            let games = self.inner.lock().await;
            games
                .iter()
                .map(|(port, g)| (port.to_string(), g.record.clone()))
                .collect()
        };
        let data = serde_json::to_vec_pretty(&snapshot)
            .map_err(|e| RegistryError::Persist(std::io::Error::other(e)))?;

        let path = self.save_path.as_path();
        let tmp = path.with_extension("json.tmp");
        let write = async {
            let mut f = tokio::fs::File::create(&tmp).await?;
            f.write_all(&data).await?;
            f.flush().await?;
            drop(f);
            tokio::fs::rename(&tmp, path).await
        };
        write.await.map_err(|e| {
            tracing::error!(path = %path.display(), error = %e, "failed to save game data");
            RegistryError::Persist(e)
        })?;
        tracing::debug!(games = snapshot.len(), "game data saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(port: u16, name: &str) -> GameRecord {
        GameRecord::new(port, name, GameType::Dom5, vec!["--era".into(), "1".into()])
    }

    async fn registry(dir: &tempfile::TempDir) -> GameRegistry {
        GameRegistry::open(dir.path().join("games.json")).await.unwrap()
    }

    #[tokio::test]
    async fn open_creates_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(&dir).await;
        assert!(reg.records().await.is_empty());
        let raw = std::fs::read_to_string(dir.path().join("games.json")).unwrap();
        assert_eq!(raw.trim(), "{}");
    }

    #[tokio::test]
    async fn rejects_duplicate_port_and_name() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(&dir).await;
        reg.create(rec(6000, "Foo")).await.unwrap();

        let err = reg.create(rec(6000, "Bar")).await.unwrap_err();
        assert!(matches!(err, RegistryError::PortInUse(6000)));

        let err = reg.create(rec(6001, "fOO")).await.unwrap_err();
        assert!(matches!(err, RegistryError::NameInUse(_)));

        assert_eq!(reg.used_ports().await, vec![6000]);
    }

    #[tokio::test]
    async fn rejects_invalid_names_before_mutation() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(&dir).await;
        for bad in ["", "has space", "dom5", "a_name_that_is_way_too_long_x"] {
            let err = reg.create(rec(6000, bad)).await.unwrap_err();
            assert!(matches!(err, RegistryError::InvalidName(_)), "{bad}");
        }
        assert!(reg.records().await.is_empty());
    }

    #[test]
    fn tildes_are_allowed_and_named_in_the_message() {
        assert!(validate_name_format("Old~World_2").is_ok());
        let err = validate_name_format("bad-name").unwrap_err();
        assert!(err.to_string().contains("underscores and tildes"), "{err}");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_creates_all_reach_disk() {
        for round in 0..10 {
            let dir = tempfile::tempdir().unwrap();
            let reg = registry(&dir).await;
            let tasks: Vec<_> = (0..16u16)
                .map(|i| {
                    let reg = reg.clone();
                    tokio::spawn(async move { reg.create(rec(6000 + i, &format!("Game{i}"))).await })
                })
                .collect();
            for t in tasks {
                t.await.unwrap().unwrap();
            }

            let raw = std::fs::read_to_string(dir.path().join("games.json")).unwrap();
            let v: serde_json::Value = serde_json::from_str(&raw).unwrap();
            assert_eq!(v.as_object().unwrap().len(), 16, "round {round}");
        }
    }

    #[tokio::test]
    async fn persisted_table_round_trips_without_process() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(&dir).await;
        reg.create(rec(6000, "Foo")).await.unwrap();
        reg.create(GameRecord::new(6001, "Bar", GameType::Coe4, vec![]))
            .await
            .unwrap();
        reg.set_frozen(6000, 3600).await.unwrap();

        let raw = std::fs::read_to_string(dir.path().join("games.json")).unwrap();
        let v: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(v["6000"]["name"], "Foo");
        assert_eq!(v["6000"]["frozenTimer"], 3600);
        assert!(v["6000"].get("instance").is_none());

        let reopened = registry(&dir).await;
        assert_eq!(reopened.records().await, reg.records().await);
        let bar = reopened.get(6001).await.unwrap();
        assert_eq!(bar.game_type, GameType::Coe4);
        assert!(bar.args.is_empty());
    }

    #[tokio::test]
    async fn delete_and_lookups() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(&dir).await;
        reg.create(rec(6000, "Foo")).await.unwrap();

        assert_eq!(reg.find_by_name("FOO").await.unwrap().port, 6000);
        assert!(reg.require_named(6000, "Foo").await.is_ok());
        assert!(matches!(
            reg.require_named(6000, "Bar").await,
            Err(RegistryError::NameMismatch(6000))
        ));

        reg.delete(6000).await.unwrap();
        assert!(reg.get(6000).await.is_none());
        assert!(matches!(reg.delete(6000).await, Err(RegistryError::UnknownPort(6000))));
    }

    #[tokio::test]
    async fn reconcile_merges_master_state() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(&dir).await;
        reg.create(rec(6000, "Foo")).await.unwrap();
        reg.create(rec(6001, "Bar")).await.unwrap();
        reg.set_frozen(6000, 100).await.unwrap();
        reg.set_frozen(6001, 200).await.unwrap();

        let master = vec![
            GameRecord::new(6000, "foo", GameType::Dom5, vec!["--new".into()]),
            GameRecord::new(6001, "Other", GameType::Dom4, vec![]),
            GameRecord::new(6002, "Fresh", GameType::Dom5, vec![]),
        ];
        assert_eq!(reg.mismatched_ports(&master).await, vec![6001]);

        let report = reg.reconcile(master).await.unwrap();
        assert_eq!(report.updated, vec![6000]);
        assert_eq!(report.replaced, vec![6001]);
        assert_eq!(report.adopted, vec![6002]);

        let foo = reg.get(6000).await.unwrap();
        assert!(foo.frozen);
        assert_eq!(foo.args, vec!["--new".to_string()]);

        let other = reg.get(6001).await.unwrap();
        assert_eq!(other.name, "Other");
        assert!(!other.frozen);
        assert_eq!(other.frozen_timer, None);
    }
}
