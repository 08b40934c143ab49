use std::{collections::BTreeMap, path::PathBuf, time::SystemTime};

use async_trait::async_trait;
use clockwork_process::{GameRecord, GameType};

use super::{
    BackendContext, BackendError, BackendResult, GameBackend, Stales, StartRequest, backup_hook_args,
    statuspage_arg,
};
use crate::process_supervisor::PortLease;
use crate::supervisor_support::unix_ms;
use crate::timer::{Timer, TimerValue};

/// Dominions 4. It has no command file, so every timer change is a reboot
/// with new `--hours`/`--minutes` flags.
pub struct Dom4Backend;

fn timer_args(timer: &TimerValue) -> Vec<String> {
    Timer::from_seconds(0, timer.total_seconds()).to_exe_arguments()
}

#[async_trait]
impl GameBackend for Dom4Backend {
    fn game_type(&self) -> GameType {
        GameType::Dom4
    }

    fn additional_args(&self, ctx: &BackendContext, game_name: &str) -> Vec<String> {
        let mut args = vec!["--statuspage".to_string(), statuspage_arg(ctx, game_name)];
        args.extend(backup_hook_args(ctx, game_name));
        args
    }

    fn timer_launch_args(&self, timer: &TimerValue) -> Option<Vec<String>> {
        Some(timer_args(timer))
    }

    async fn mod_list(&self, ctx: &BackendContext) -> BackendResult<Vec<String>> {
        super::dominions_mod_list(ctx, GameType::Dom4).await
    }

    async fn map_list(&self, ctx: &BackendContext) -> BackendResult<BTreeMap<String, usize>> {
        super::dominions_map_list(ctx, GameType::Dom4).await
    }

    async fn start(
        &self,
        ctx: &BackendContext,
        lease: &PortLease,
        game: &GameRecord,
        req: StartRequest,
    ) -> BackendResult<()> {
        ctx.supervisor.kill_leased(lease).await?;
        let mut args = req.args.unwrap_or_else(|| game.args.clone());
        if let Some(timer) = &req.timer {
            args.extend(timer_args(timer));
        }
        ctx.launch(lease, game, Some(args))
            .await
            .map_err(|e| BackendError::msg(format!("An error occurred when trying to rehost the game to start it: {e}")))?;
        Ok(())
    }

    async fn restart(&self, ctx: &BackendContext, lease: &PortLease, game: &GameRecord) -> BackendResult<()> {
        super::dominions_restart(ctx, lease, game).await
    }

    async fn change_current_timer(
        &self,
        ctx: &BackendContext,
        lease: &PortLease,
        game: &GameRecord,
        timer: &TimerValue,
    ) -> BackendResult<()> {
        ctx.supervisor.kill_leased(lease).await?;
        let mut args = game.args.clone();
        args.extend(timer_args(timer));
        ctx.launch(lease, game, Some(args)).await.map_err(|e| {
            BackendError::msg(format!(
                "An error occurred when trying to rehost the game to change the current timer: {e}"
            ))
        })?;
        Ok(())
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
        timer: Option<&TimerValue>,
    ) -> BackendResult<()> {
        super::dominions_restore(ctx, game, turn).await?;
        let timer = timer.cloned().unwrap_or(TimerValue::Seconds(0));
        self.change_current_timer(ctx, lease, game, &timer).await.map_err(|e| {
            BackendError::msg(format!(
                "The files were successfully rollbacked, but the timer could not be set ({e}). Try doing it manually."
            ))
        })
    }

    /// Nation files not touched since the last turn was hosted.
    async fn stales(&self, ctx: &BackendContext, game: &GameRecord, last_hosted_ms: u64) -> BackendResult<Stales> {
        let dir = ctx.savedgames_dir(game);
        let mut rd = tokio::fs::read_dir(&dir).await.map_err(|e| {
            BackendError::msg(format!(
                "An error occurred while reading the save files of {} to check stales: {e}",
                game.name
            ))
        })?;
        let mut out = Stales::default();
        while let Some(entry) = rd.next_entry().await.map_err(anyhow::Error::from)? {
            let file = entry.file_name().to_string_lossy().to_string();
            if !file.ends_with(".2h") {
                continue;
            }
            let modified = entry
                .metadata()
                .await
                .and_then(|m| m.modified())
                .map(unix_ms)
                .unwrap_or_else(|_| unix_ms(SystemTime::UNIX_EPOCH));
            if modified < last_hosted_ms {
                out.stales.push(file);
            }
        }
        out.stales.sort();
        Ok(out)
    }

    async fn last_hosted_time(&self, ctx: &BackendContext, game: &GameRecord) -> BackendResult<u64> {
        super::dominions_last_hosted_time(ctx, game).await
    }
}
