use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use clockwork_process::GameType;
use serde::Deserialize;

use crate::process_supervisor::KillPolicy;
use crate::supervisor_support::{clamp_ms, env_string, env_u32, env_u64};

pub const DEFAULT_CONFIG_PATH: &str = "config.toml";

const DEFAULT_GAME_HOST_DELAY_MS: u64 = 3000;
const DEFAULT_PORT_PROBE_TIMEOUT_MS: u64 = 2000;
const DEFAULT_KILL_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_KILL_ATTEMPT_DELAY_MS: u64 = 3000;
const DEFAULT_KILL_MAX_TOTAL_MS: u64 = 60_000;

/// Static configuration of the slave. Deserialized from a TOML file; every
/// section is optional and falls back to its defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SlaveConfig {
    /// Name announced to the master server.
    pub name: String,
    pub token: String,
    /// Public address players connect to.
    pub ip: String,
    /// How many games this host accepts.
    pub capacity: u32,
    pub owner_discord_id: Option<String>,
    /// ws(s):// or http(s):// URL of the master server tunnel endpoint.
    pub master_url: String,
    pub game_port_range: PortRange,
    /// Stagger between queued host requests.
    pub game_host_delay_ms: u64,
    /// JSON file the game registry is persisted to.
    pub game_data_save_path: PathBuf,
    /// Directory where games write their `<name>_status` pages.
    pub status_page_base_path: PathBuf,
    pub log_dir: PathBuf,
    pub port_probe_timeout_ms: u64,
    /// Consecutive failed reconnects before all games are shut down.
    pub shutdown_after_failed_reconnects: u32,
    pub backups: BackupConfig,
    pub kill: KillConfig,
    pub dom4: GamePaths,
    pub dom5: GamePaths,
    pub coe4: GamePaths,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
pub struct PortRange {
    pub first: u16,
    pub last: u16,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    pub root: PathBuf,
    /// Snapshots taken right before a turn processes (`--preexec`).
    pub latest_turn_dir_name: String,
    /// Snapshots taken right after a turn processed (`--postexec`).
    pub new_turns_dir_name: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KillConfig {
    pub max_attempts: u32,
    pub attempt_delay_ms: u64,
    pub max_total_ms: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GamePaths {
    pub exe_path: PathBuf,
    /// Root holding `maps/`, `mods/` and `savedgames/`.
    pub data_path: PathBuf,
}

impl Default for SlaveConfig {
    fn default() -> Self {
        Self {
            name: "clockwork-slave".to_string(),
            token: String::new(),
            ip: "127.0.0.1".to_string(),
            capacity: 10,
            owner_discord_id: None,
            master_url: String::new(),
            game_port_range: PortRange::default(),
            game_host_delay_ms: DEFAULT_GAME_HOST_DELAY_MS,
            game_data_save_path: PathBuf::from("data/games.json"),
            status_page_base_path: PathBuf::from("data/statuspages"),
            log_dir: PathBuf::from("logs"),
            port_probe_timeout_ms: DEFAULT_PORT_PROBE_TIMEOUT_MS,
            shutdown_after_failed_reconnects: 5,
            backups: BackupConfig::default(),
            kill: KillConfig::default(),
            dom4: GamePaths::default(),
            dom5: GamePaths::default(),
            coe4: GamePaths::default(),
        }
    }
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            first: 6000,
            last: 6100,
        }
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("data/backups"),
            latest_turn_dir_name: "latest_turn".to_string(),
            new_turns_dir_name: "new_turns".to_string(),
        }
    }
}

impl Default for KillConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_KILL_MAX_ATTEMPTS,
            attempt_delay_ms: DEFAULT_KILL_ATTEMPT_DELAY_MS,
            max_total_ms: DEFAULT_KILL_MAX_TOTAL_MS,
        }
    }
}

impl SlaveConfig {
    /// Loads the config from `CLOCKWORK_CONFIG` (or `config.toml`), then
    /// applies `CLOCKWORK_*` environment overrides.
    pub fn load_from_env() -> anyhow::Result<Self> {
        let path = env_string("CLOCKWORK_CONFIG").unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
        let mut cfg = Self::load(Path::new(&path))?;
        cfg.apply_env_overrides();
        Ok(cfg)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            tracing::warn!(path = %path.display(), "config file not found; using defaults");
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("parse config {}", path.display()))
    }

    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        let cfg: Self = toml::from_str(raw)?;
        if cfg.game_port_range.first > cfg.game_port_range.last {
            anyhow::bail!(
                "game_port_range.first ({}) must not exceed game_port_range.last ({})",
                cfg.game_port_range.first,
                cfg.game_port_range.last
            );
        }
        Ok(cfg)
    }

    fn apply_env_overrides(&mut self) {
        if let Some(v) = env_string("CLOCKWORK_MASTER_URL") {
            self.master_url = v;
        }
        if let Some(v) = env_string("CLOCKWORK_TOKEN") {
            self.token = v;
        }
        if let Some(v) = env_string("CLOCKWORK_NAME") {
            self.name = v;
        }
        if let Some(v) = env_u64("CLOCKWORK_GAME_HOST_DELAY_MS") {
            self.game_host_delay_ms = v.clamp(0, 10 * 60 * 1000);
        }
        if let Some(v) = env_u64("CLOCKWORK_PORT_PROBE_TIMEOUT_MS") {
            self.port_probe_timeout_ms = v;
        }
        if let Some(v) = env_u32("CLOCKWORK_KILL_MAX_ATTEMPTS") {
            self.kill.max_attempts = v;
        }
        if let Some(v) = env_u64("CLOCKWORK_KILL_ATTEMPT_DELAY_MS") {
            self.kill.attempt_delay_ms = v;
        }
    }

    pub fn game_paths(&self, game_type: GameType) -> &GamePaths {
        match game_type {
            GameType::Dom4 => &self.dom4,
            GameType::Dom5 => &self.dom5,
            GameType::Coe4 => &self.coe4,
        }
    }

    pub fn status_page_path(&self, game_name: &str) -> PathBuf {
        self.status_page_base_path
            .join(format!("{game_name}_status"))
    }

    pub fn savedgames_dir(&self, game_type: GameType, game_name: &str) -> PathBuf {
        let paths = self.game_paths(game_type);
        match game_type {
            GameType::Coe4 => paths.data_path.join("saves").join(game_name),
            GameType::Dom4 | GameType::Dom5 => paths.data_path.join("savedgames").join(game_name),
        }
    }

    pub fn game_host_delay(&self) -> Duration {
        Duration::from_millis(self.game_host_delay_ms)
    }

    pub fn port_probe_timeout(&self) -> Duration {
        clamp_ms(self.port_probe_timeout_ms, 250, 30_000)
    }

    pub fn kill_policy(&self) -> KillPolicy {
        KillPolicy {
            max_attempts: self.kill.max_attempts.clamp(1, 20),
            attempt_delay: clamp_ms(self.kill.attempt_delay_ms, 10, 60_000),
            max_total: clamp_ms(self.kill.max_total_ms, 100, 10 * 60 * 1000),
            ..KillPolicy::default()
        }
    }
}
