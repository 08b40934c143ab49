use std::path::Path;

use serde::{Deserialize, Serialize};

const CELL_OPEN: &str = r#"<td class="blackbolddata" colspan="2">"#;
const CELL_CLOSE: &str = "</td>";

#[derive(Debug, thiserror::Error)]
pub enum TimerError {
    #[error("There was an error reading the statuspage: {0}")]
    Read(#[source] std::io::Error),
    #[error("The statuspage does not contain turn information.")]
    Malformed,
}

/// Turn and remaining time of a game, as reported by its status page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Timer {
    pub turn: u32,
    pub days: u64,
    pub hours: u64,
    pub minutes: u64,
    pub seconds: u64,
    pub total_hours: u64,
    pub total_minutes: u64,
    pub total_seconds: u64,
    pub is_paused: bool,
}

impl Default for Timer {
    fn default() -> Self {
        Self::not_started()
    }
}

impl Timer {
    pub fn not_started() -> Self {
        Self {
            turn: 0,
            days: 0,
            hours: 0,
            minutes: 0,
            seconds: 0,
            total_hours: 0,
            total_minutes: 0,
            total_seconds: 0,
            is_paused: true,
        }
    }

    pub fn from_parts(turn: u32, days: u64, hours: u64, minutes: u64, seconds: u64) -> Self {
        let total_hours = days * 24 + hours;
        let total_minutes = total_hours * 60 + minutes;
        let total_seconds = total_minutes * 60 + seconds;
        Self {
            turn,
            days,
            hours,
            minutes,
            seconds,
            total_hours,
            total_minutes,
            total_seconds,
            is_paused: total_seconds == 0,
        }
    }

    pub fn from_seconds(turn: u32, secs: u64) -> Self {
        Self::from_parts(
            turn,
            secs / 86_400,
            (secs % 86_400) / 3600,
            (secs % 3600) / 60,
            secs % 60,
        )
    }

    pub fn paused(mut self) -> Self {
        self.is_paused = true;
        self
    }

    /// Remaining seconds, or 0 when paused.
    pub fn remaining_seconds(&self) -> u64 {
        if self.is_paused { 0 } else { self.total_seconds }
    }

    /// Command line flags that start a game with this much time on the clock.
    /// Rounds up to whole minutes/hours since that is all the games accept.
    pub fn to_exe_arguments(&self) -> Vec<String> {
        if self.is_paused {
            return Vec::new();
        }
        if self.total_hours == 0 && self.total_minutes == 0 && self.total_seconds > 0 {
            return vec!["--minutes".to_string(), "1".to_string()];
        }
        if self.total_hours == 0 && self.total_minutes > 0 {
            return vec!["--minutes".to_string(), self.total_minutes.to_string()];
        }
        if self.total_hours > 0 {
            return vec!["--hours".to_string(), (self.total_hours + 1).to_string()];
        }
        tracing::warn!(timer = ?self, "timer is not paused but has no time left");
        Vec::new()
    }
}

/// Parses the contents of a `<name>_status` page. Blank content means the
/// game has not started yet.
pub fn parse_status_page(content: &str) -> Result<Timer, TimerError> {
    if content.trim().is_empty() {
        return Ok(Timer::not_started());
    }

    let start = content.find(CELL_OPEN).ok_or(TimerError::Malformed)? + CELL_OPEN.len();
    let len = content[start..].find(CELL_CLOSE).ok_or(TimerError::Malformed)?;
    let cell = &content[start..start + len];
    // The cell starts with the game name, which cannot contain a comma.
    let (_, info) = cell.split_once(',').ok_or(TimerError::Malformed)?;

    let words: Vec<&str> = info
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();

    let turn = words
        .windows(2)
        .find(|w| w[0].eq_ignore_ascii_case("turn"))
        .and_then(|w| w[1].parse::<u32>().ok())
        .or_else(|| words.iter().find_map(|w| w.parse::<u32>().ok()))
        .ok_or(TimerError::Malformed)?;

    let (mut days, mut hours, mut minutes, mut seconds) = (0, 0, 0, 0);
    for w in words.windows(2) {
        let Ok(n) = w[0].parse::<u64>() else {
            continue;
        };
        let unit = w[1].to_ascii_lowercase();
        match unit.trim_end_matches('s') {
            "day" => days = n,
            "hour" => hours = n,
            "minute" => minutes = n,
            "second" => seconds = n,
            _ => {}
        }
    }

    Ok(Timer::from_parts(turn, days, hours, minutes, seconds))
}

pub async fn read_timer(status_page: &Path) -> Result<Timer, TimerError> {
    match tokio::fs::read_to_string(status_page).await {
        Ok(content) => parse_status_page(&content),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Timer::not_started()),
        Err(e) => {
            tracing::error!(path = %status_page.display(), error = %e, "failed to read statuspage");
            Err(TimerError::Read(e))
        }
    }
}

/// A timer as the master sends it: plain seconds, exe-style flags, or a
/// (possibly partial) timer object.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum TimerValue {
    Seconds(u64),
    Args(Vec<String>),
    Object(TimerSpec),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TimerSpec {
    pub is_paused: Option<bool>,
    pub total_seconds: Option<u64>,
    pub days: Option<u64>,
    pub hours: Option<u64>,
    pub minutes: Option<u64>,
    pub seconds: Option<u64>,
}

fn flag_value(args: &[String], flag: &str) -> Option<u64> {
    let i = args.iter().position(|a| a.eq_ignore_ascii_case(flag))?;
    let digits: String = args.get(i + 1)?.chars().filter(char::is_ascii_digit).collect();
    digits.parse().ok()
}

impl TimerValue {
    pub fn total_seconds(&self) -> u64 {
        match self {
            TimerValue::Seconds(s) => *s,
            TimerValue::Args(args) => {
                flag_value(args, "--hours").unwrap_or(0) * 3600
                    + flag_value(args, "--minutes").unwrap_or(0) * 60
            }
            TimerValue::Object(spec) => {
                if spec.is_paused == Some(true) {
                    return 0;
                }
                if let Some(total) = spec.total_seconds {
                    return total;
                }
                spec.days.unwrap_or(0) * 86_400
                    + spec.hours.unwrap_or(0) * 3600
                    + spec.minutes.unwrap_or(0) * 60
                    + spec.seconds.unwrap_or(0)
            }
        }
    }

    #[cfg(test)]
    pub fn is_paused(&self) -> bool {
        self.total_seconds() == 0
    }
}

impl From<Timer> for TimerValue {
    fn from(t: Timer) -> Self {
        TimerValue::Seconds(t.remaining_seconds())
    }
}
