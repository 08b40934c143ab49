use std::{
    collections::BTreeSet,
    path::{Component, Path, PathBuf},
    sync::Arc,
};

use clockwork_process::GameType;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::config::SlaveConfig;
use crate::registry::{GameRegistry, RegistryError, validate_name_format};

#[derive(Debug, thiserror::Error)]
pub enum HosterError {
    #[error("There are no free ports.")]
    NoFreePorts,
    #[error(transparent)]
    InvalidName(#[from] RegistryError),
    #[error("The game name {0} is already used by a different game. Please choose one that's free.")]
    NameUsed(String),
    #[error("The game type is incorrect. Cannot determine the path to validate the {0}.")]
    WrongGameType(&'static str),
    #[error("The map file could not be found.")]
    MapNotFound,
    #[error("The mod file {0} could not be found.")]
    ModNotFound(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReservedPort {
    pub port: u16,
    pub ip: String,
}

/// Assisted hosting: ports handed out to games that are still being set up,
/// and the checks run on their settings.
#[derive(Clone)]
pub struct Hoster {
    config: Arc<SlaveConfig>,
    registry: GameRegistry,
    reserved: Arc<Mutex<BTreeSet<u16>>>,
}

fn relative_inside(name: &str) -> Option<PathBuf> {
    let p = Path::new(name);
    let ok = !name.is_empty() && p.components().all(|c| matches!(c, Component::Normal(_)));
    ok.then(|| p.to_path_buf())
}

impl Hoster {
    pub fn new(config: Arc<SlaveConfig>, registry: GameRegistry) -> Self {
        Self {
            config,
            registry,
            reserved: Arc::new(Mutex::new(BTreeSet::new())),
        }
    }

    /// Hands out the lowest port in the configured range that no game uses
    /// and nobody else has reserved.
    pub async fn reserve_port(&self) -> Result<ReservedPort, HosterError> {
        let used: BTreeSet<u16> = self.registry.used_ports().await.into_iter().collect();
        let mut reserved = self.reserved.lock().await;
        let range = self.config.game_port_range;
        let port = (range.first..=range.last)
            .find(|p| !used.contains(p) && !reserved.contains(p))
            .ok_or(HosterError::NoFreePorts)?;
        reserved.insert(port);
        tracing::info!(port, "port reserved");
        Ok(ReservedPort {
            port,
            ip: self.config.ip.clone(),
        })
    }

    pub async fn release_port(&self, port: u16) -> bool {
        let released = self.reserved.lock().await.remove(&port);
        if released {
            tracing::info!(port, "port released");
        }
        released
    }

    pub async fn release_all(&self) {
        let mut reserved = self.reserved.lock().await;
        if !reserved.is_empty() {
            tracing::info!(count = reserved.len(), "releasing all reserved ports");
        }
        reserved.clear();
    }

    #[cfg(test)]
    pub async fn reserved_ports(&self) -> Vec<u16> {
        self.reserved.lock().await.iter().copied().collect()
    }

    /// A name is free if it is well formed, no game uses it (ignoring case)
    /// and no save directory by that name is left on disk.
    pub async fn check_game_name(&self, name: &str, game_type: GameType) -> Result<(), HosterError> {
        validate_name_format(name)?;
        if self.registry.find_by_name(name).await.is_some()
            || tokio::fs::metadata(self.config.savedgames_dir(game_type, name))
                .await
                .is_ok()
        {
            tracing::info!(name, "game name already used");
            return Err(HosterError::NameUsed(name.to_string()));
        }
        Ok(())
    }

    /// Returns the map's file name as it is spelled on disk.
    pub async fn validate_map(&self, mapfile: &str, game_type: GameType) -> Result<String, HosterError> {
        if game_type == GameType::Coe4 {
            return Err(HosterError::WrongGameType("map"));
        }
        let rel = relative_inside(mapfile).ok_or(HosterError::MapNotFound)?;
        let maps = self.config.game_paths(game_type).data_path.join("maps");
        let mut rd = tokio::fs::read_dir(&maps)
            .await
            .map_err(|_| HosterError::MapNotFound)?;
        let wanted = rel.to_string_lossy().to_lowercase();
        while let Ok(Some(entry)) = rd.next_entry().await {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.to_lowercase() == wanted {
                return Ok(name);
            }
        }
        Err(HosterError::MapNotFound)
    }

    pub async fn validate_mod(&self, mod_file: &str, game_type: GameType) -> Result<(), HosterError> {
        if game_type == GameType::Coe4 {
            return Err(HosterError::WrongGameType("mods"));
        }
        let rel = relative_inside(mod_file).ok_or_else(|| HosterError::ModNotFound(mod_file.to_string()))?;
        let path = self.config.game_paths(game_type).data_path.join("mods").join(rel);
        if tokio::fs::metadata(&path).await.is_err() {
            return Err(HosterError::ModNotFound(mod_file.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PortRange;
    use clockwork_process::GameRecord;

    async fn hoster(first: u16, last: u16) -> (tempfile::TempDir, Hoster) {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = SlaveConfig::default();
        cfg.game_port_range = PortRange { first, last };
        cfg.ip = "203.0.113.7".to_string();
        cfg.dom5.data_path = dir.path().join("dom5");
        let registry = GameRegistry::open(dir.path().join("games.json")).await.unwrap();
        (dir, Hoster::new(Arc::new(cfg), registry))
    }

    #[tokio::test]
    async fn reservation_skips_used_and_reserved_ports() {
        let (_dir, h) = hoster(6000, 6003).await;
        h.registry
            .create(GameRecord::new(6000, "Foo", GameType::Dom5, vec![]))
            .await
            .unwrap();

        let a = h.reserve_port().await.unwrap();
        assert_eq!(a, ReservedPort { port: 6001, ip: "203.0.113.7".to_string() });
        assert_eq!(h.reserve_port().await.unwrap().port, 6002);
        assert_eq!(h.reserve_port().await.unwrap().port, 6003);
        assert!(matches!(h.reserve_port().await, Err(HosterError::NoFreePorts)));

        assert!(h.release_port(6002).await);
        assert!(!h.release_port(6002).await);
        assert_eq!(h.reserve_port().await.unwrap().port, 6002);

        h.release_all().await;
        assert!(h.reserved_ports().await.is_empty());
    }

    #[tokio::test]
    async fn game_names_are_checked_against_games_and_saves() {
        let (dir, h) = hoster(6000, 6010).await;
        h.registry
            .create(GameRecord::new(6000, "Foo", GameType::Dom5, vec![]))
            .await
            .unwrap();
        std::fs::create_dir_all(dir.path().join("dom5/savedgames/Leftover")).unwrap();

        assert!(h.check_game_name("Bar", GameType::Dom5).await.is_ok());
        assert!(matches!(h.check_game_name("foo", GameType::Dom5).await, Err(HosterError::NameUsed(_))));
        assert!(matches!(
            h.check_game_name("Leftover", GameType::Dom5).await,
            Err(HosterError::NameUsed(_))
        ));
        assert!(matches!(
            h.check_game_name("bad name", GameType::Dom5).await,
            Err(HosterError::InvalidName(_))
        ));
    }

    #[tokio::test]
    async fn maps_match_case_insensitively_and_mods_must_exist() {
        let (dir, h) = hoster(6000, 6010).await;
        std::fs::create_dir_all(dir.path().join("dom5/maps")).unwrap();
        std::fs::create_dir_all(dir.path().join("dom5/mods/pack")).unwrap();
        std::fs::write(dir.path().join("dom5/maps/Cradle.map"), "").unwrap();
        std::fs::write(dir.path().join("dom5/mods/pack/balance.dm"), "").unwrap();

        assert_eq!(h.validate_map("cradle.MAP", GameType::Dom5).await.unwrap(), "Cradle.map");
        assert!(matches!(h.validate_map("none.map", GameType::Dom5).await, Err(HosterError::MapNotFound)));
        assert!(matches!(h.validate_map("x.map", GameType::Coe4).await, Err(HosterError::WrongGameType(_))));

        assert!(h.validate_mod("pack/balance.dm", GameType::Dom5).await.is_ok());
        assert!(h.validate_mod("../games.json", GameType::Dom5).await.is_err());
        assert!(h.validate_mod("missing.dm", GameType::Dom5).await.is_err());
    }
}
