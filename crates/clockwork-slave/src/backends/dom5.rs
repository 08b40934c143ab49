use std::{collections::BTreeMap, path::PathBuf, time::SystemTime};

use anyhow::Context;
use async_trait::async_trait;
use clockwork_process::{GameRecord, GameType};

use super::{
    BackendContext, BackendError, BackendResult, GameBackend, NationStatus, Stales, StartRequest, StatusDump,
    SubmittedPretender, backup_hook_args, plain_file_name, read_attachment, statuspage_arg,
};
use crate::process_supervisor::PortLease;
use crate::supervisor_support::unix_ms;
use crate::timer::TimerValue;

/// Dominions 5. Timers are changed live through the `domcmd` file the game
/// polls in its save directory.
pub struct Dom5Backend;

/// Parses `statusdump.txt`. Nation lines look like
/// `Nation\t5\t5\t1\t0\t0\tmid_arco\tArcoscephale\tGolden Era`.
pub fn parse_status_dump(raw: &str) -> StatusDump {
    let mut out = BTreeMap::new();
    for line in raw.lines() {
        let line = line.trim_end_matches('\r');
        let Some(mut rest) = line
            .get(..6)
            .filter(|p| p.eq_ignore_ascii_case("nation"))
            .map(|_| &line[6..])
        else {
            continue;
        };

        let mut nums = Vec::new();
        let file = loop {
            rest = rest.trim_start();
            let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
            let tok = &rest[..end];
            rest = &rest[end..];
            match tok.parse::<i64>() {
                Ok(n) => nums.push(n),
                Err(_) => break tok,
            }
        };
        if file.is_empty() || nums.len() < 5 {
            tracing::debug!(line, "skipping malformed statusdump line");
            continue;
        }

        let nation_name = rest.trim().replace('\t', ", ");
        out.insert(
            format!("{file}.2h"),
            NationStatus {
                nation_name,
                nation_nbr: nums[0],
                pretender_nbr: nums[1],
                controller: nums[2],
                ai_level: nums[3],
                turn_played: nums[4],
            },
        );
    }
    out
}

async fn read_dump(ctx: &BackendContext, game: &GameRecord) -> BackendResult<StatusDump> {
    let path = ctx.savedgames_dir(game).join("statusdump.txt");
    match tokio::fs::read_to_string(&path).await {
        Ok(raw) => Ok(parse_status_dump(&raw)),
        Err(e) => {
            tracing::warn!(game = %game.name, path = %path.display(), error = %e, "could not read the status dump");
            Err(BackendError::msg("Could not gather data from the dump file. Is the path incorrect?"))
        }
    }
}

async fn write_domcmd(ctx: &BackendContext, game: &GameRecord, cmd: &str) -> BackendResult<()> {
    let path = ctx.savedgames_dir(game).join("domcmd");
    tokio::fs::write(&path, cmd)
        .await
        .with_context(|| format!("write {}", path.display()))?;
    tracing::info!(game = %game.name, cmd, "domcmd written");
    Ok(())
}

#[async_trait]
impl GameBackend for Dom5Backend {
    fn game_type(&self) -> GameType {
        GameType::Dom5
    }

    fn additional_args(&self, ctx: &BackendContext, game_name: &str) -> Vec<String> {
        let mut args = vec![
            "--nosteam".to_string(),
            "--statuspage".to_string(),
            statuspage_arg(ctx, game_name),
        ];
        args.extend(backup_hook_args(ctx, game_name));
        args
    }

    async fn mod_list(&self, ctx: &BackendContext) -> BackendResult<Vec<String>> {
        super::dominions_mod_list(ctx, GameType::Dom5).await
    }

    async fn map_list(&self, ctx: &BackendContext) -> BackendResult<BTreeMap<String, usize>> {
        super::dominions_map_list(ctx, GameType::Dom5).await
    }

    async fn start(
        &self,
        ctx: &BackendContext,
        _lease: &PortLease,
        game: &GameRecord,
        req: StartRequest,
    ) -> BackendResult<()> {
        let secs = req.timer.as_ref().map(TimerValue::total_seconds).unwrap_or(0);
        write_domcmd(ctx, game, &format!("settimeleft {secs}")).await
    }

    async fn restart(&self, ctx: &BackendContext, lease: &PortLease, game: &GameRecord) -> BackendResult<()> {
        super::dominions_restart(ctx, lease, game).await
    }

    async fn change_current_timer(
        &self,
        ctx: &BackendContext,
        _lease: &PortLease,
        game: &GameRecord,
        timer: &TimerValue,
    ) -> BackendResult<()> {
        write_domcmd(ctx, game, &format!("settimeleft {}", timer.total_seconds())).await
    }

    async fn change_default_timer(
        &self,
        ctx: &BackendContext,
        game: &GameRecord,
        default_minutes: u64,
        current: &TimerValue,
    ) -> BackendResult<()> {
        // setinterval also resets the current turn's clock, so re-set it.
        let cmd = format!(
            "setinterval {default_minutes}\nsettimeleft {}",
            current.total_seconds()
        );
        write_domcmd(ctx, game, &cmd).await
    }

    async fn backup_savefiles(
        &self,
        ctx: &BackendContext,
        game: &GameRecord,
        is_new_turn: bool,
        turn: u32,
    ) -> BackendResult<PathBuf> {
        super::dominions_backup(ctx, game, is_new_turn, turn).await
    }

    async fn rollback(
        &self,
        ctx: &BackendContext,
        lease: &PortLease,
        game: &GameRecord,
        turn: u32,
        _timer: Option<&TimerValue>,
    ) -> BackendResult<()> {
        super::dominions_restore(ctx, game, turn).await?;
        ctx.supervisor.kill_leased(lease).await.map_err(|e| {
            BackendError::msg(format!(
                "The files were successfully rollbacked, but the game task could not be killed to reboot it ({e}). Try using the kill command."
            ))
        })?;
        ctx.launch(lease, game, Some(game.args.clone())).await.map_err(|e| {
            BackendError::msg(format!(
                "The files were successfully rollbacked, but the game task could not be launched after killing it ({e}). Try using the launch command."
            ))
        })?;
        Ok(())
    }

    async fn stales(&self, ctx: &BackendContext, game: &GameRecord, last_hosted_ms: u64) -> BackendResult<Stales> {
        let dump = read_dump(ctx, game).await?;
        let dir = ctx.savedgames_dir(game);
        let mut rd = tokio::fs::read_dir(&dir).await.map_err(|e| {
            BackendError::msg(format!(
                "An error occurred while reading the files of the game {} to check its stales: {e}",
                game.name
            ))
        })?;

        let mut out = Stales::default();
        while let Some(entry) = rd.next_entry().await.map_err(anyhow::Error::from)? {
            let file = entry.file_name().to_string_lossy().to_string();
            if !file.ends_with(".2h") {
                continue;
            }
            let Some(nation) = dump.get(&file) else {
                continue;
            };
            if nation.controller == 2 {
                out.ai.push(nation.nation_name.clone());
                continue;
            }
            if nation.controller != 1 || nation.turn_played != 0 {
                continue;
            }
            let modified = entry
                .metadata()
                .await
                .and_then(|m| m.modified())
                .map(unix_ms)
                .unwrap_or_else(|_| unix_ms(SystemTime::UNIX_EPOCH));
            if modified < last_hosted_ms {
                out.stales.push(nation.nation_name.clone());
            }
        }
        out.ai.sort();
        out.stales.sort();
        Ok(out)
    }

    async fn dump(&self, ctx: &BackendContext, game: &GameRecord) -> BackendResult<StatusDump> {
        read_dump(ctx, game).await
    }

    async fn submitted_pretenders(
        &self,
        ctx: &BackendContext,
        game: &GameRecord,
    ) -> BackendResult<Vec<SubmittedPretender>> {
        let dump = read_dump(ctx, game).await?;
        Ok(dump
            .into_iter()
            .filter(|(_, n)| n.controller == 1)
            .map(|(filename, n)| SubmittedPretender {
                name: n.nation_name,
                filename,
            })
            .collect())
    }

    async fn remove_pretender(&self, ctx: &BackendContext, game: &GameRecord, nation_file: &str) -> BackendResult<()> {
        let path = ctx.savedgames_dir(game).join(plain_file_name(nation_file)?);
        if tokio::fs::metadata(&path).await.is_err() {
            return Err(BackendError::msg(
                "Could not find the pretender file. Has it already been deleted? You can double-check in the lobby. If not, you can try rebooting the game.",
            ));
        }
        tokio::fs::remove_file(&path)
            .await
            .with_context(|| format!("delete {}", path.display()))?;
        tracing::info!(game = %game.name, nation_file, "pretender removed");
        Ok(())
    }

    async fn turn_file(&self, ctx: &BackendContext, game: &GameRecord, nation_file: &str) -> BackendResult<Vec<u8>> {
        let path = ctx.savedgames_dir(game).join(plain_file_name(nation_file)?);
        read_attachment(&path, "turn file").await
    }

    async fn score_dump(&self, ctx: &BackendContext, game: &GameRecord) -> BackendResult<Vec<u8>> {
        read_attachment(&ctx.savedgames_dir(game).join("scores.html"), "score file").await
    }

    async fn last_hosted_time(&self, ctx: &BackendContext, game: &GameRecord) -> BackendResult<u64> {
        super::dominions_last_hosted_time(ctx, game).await
    }
}
