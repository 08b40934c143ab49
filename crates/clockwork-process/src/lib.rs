use std::{fmt, str::FromStr};

/// Which game executable a managed game runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum GameType {
    Dom4,
    Dom5,
    Coe4,
}

impl GameType {
    pub const ALL: [GameType; 3] = [GameType::Dom4, GameType::Dom5, GameType::Coe4];

    pub fn as_str(self) -> &'static str {
        match self {
            GameType::Dom4 => "dom4",
            GameType::Dom5 => "dom5",
            GameType::Coe4 => "coe4",
        }
    }
}

impl fmt::Display for GameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown game type: {0:?} (expected dom4, dom5 or coe4)")]
pub struct ParseGameTypeError(pub String);

impl FromStr for GameType {
    type Err = ParseGameTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "dom4" => Ok(GameType::Dom4),
            "dom5" => Ok(GameType::Dom5),
            "coe4" => Ok(GameType::Coe4),
            _ => Err(ParseGameTypeError(s.to_string())),
        }
    }
}

impl TryFrom<String> for GameType {
    type Error = ParseGameTypeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<GameType> for String {
    fn from(value: GameType) -> Self {
        value.as_str().to_string()
    }
}

/// Persisted form of a managed game.
///
/// NOTE: There is deliberately no process field here. A live process is not
/// restorable across a slave restart, so it only ever exists in memory.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameRecord {
    pub port: u16,
    pub name: String,
    pub game_type: GameType,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub frozen: bool,
    /// Seconds left on the turn timer when the game was frozen.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frozen_timer: Option<u64>,
}

impl GameRecord {
    pub fn new(port: u16, name: impl Into<String>, game_type: GameType, args: Vec<String>) -> Self {
        Self {
            port,
            name: name.into(),
            game_type,
            args,
            frozen: false,
            frozen_timer: None,
        }
    }

    pub fn name_matches(&self, other: &str) -> bool {
        self.name.eq_ignore_ascii_case(other.trim())
    }
}

/// Unsolicited notifications sent to the master server.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "camelCase")]
pub enum GameEvent {
    GameError {
        name: String,
        error: String,
    },
    GameExited {
        name: String,
        code: Option<i32>,
    },
    GameClosedUnexpectedly {
        name: String,
        signal: Option<i32>,
    },
    StdioClosed {
        name: String,
        code: Option<i32>,
        signal: Option<i32>,
    },
    StderrData {
        name: String,
        data: String,
    },
}

impl GameEvent {
    pub fn game_name(&self) -> &str {
        match self {
            GameEvent::GameError { name, .. }
            | GameEvent::GameExited { name, .. }
            | GameEvent::GameClosedUnexpectedly { name, .. }
            | GameEvent::StdioClosed { name, .. }
            | GameEvent::StderrData { name, .. } => name,
        }
    }
}
