use async_trait::async_trait;
use clockwork_process::{GameRecord, GameType};

use super::{BackendContext, BackendResult, GameBackend};
use crate::process_supervisor::PortLease;

/// Conquest of Elysium 4. Only hosting and save deletion are supported.
pub struct Coe4Backend;

#[async_trait]
impl GameBackend for Coe4Backend {
    fn game_type(&self) -> GameType {
        GameType::Coe4
    }

    fn additional_args(&self, ctx: &BackendContext, game_name: &str) -> Vec<String> {
        vec![format!(
            "--gamelog={}",
            ctx.config.status_page_path(game_name).display()
        )]
    }

    async fn restart(&self, ctx: &BackendContext, lease: &PortLease, game: &GameRecord) -> BackendResult<()> {
        ctx.supervisor.kill_leased(lease).await?;
        ctx.launch(lease, game, Some(game.args.clone())).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::fixture;
    use super::super::{BackendError, backend_for};
    use super::*;

    #[tokio::test]
    async fn game_log_is_the_only_extra_arg() {
        let fx = fixture().await;
        let args = Coe4Backend.additional_args(&fx.ctx, "Foo");
        assert_eq!(args.len(), 1);
        assert!(args[0].starts_with("--gamelog="));
        assert!(args[0].ends_with("Foo_status"));
    }

    #[tokio::test]
    async fn dominions_only_operations_are_unsupported() {
        let fx = fixture().await;
        let backend = backend_for(GameType::Coe4);
        assert!(matches!(
            backend.mod_list(&fx.ctx).await,
            Err(BackendError::Unsupported("getModList"))
        ));
        let game = GameRecord::new(6000, "Foo", GameType::Coe4, vec![]);
        assert!(matches!(
            backend.last_hosted_time(&fx.ctx, &game).await,
            Err(BackendError::Unsupported(_))
        ));
    }

    #[tokio::test]
    async fn save_dir_is_deleted() {
        let fx = fixture().await;
        let game = GameRecord::new(6000, "Foo", GameType::Coe4, vec![]);
        let dir = fx.ctx.savedgames_dir(&game);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("save.coe"), "").unwrap();
        let msg = Coe4Backend.delete_savefiles(&fx.ctx, &game).await.unwrap();
        assert!(msg.contains("Foo"));
        assert!(!dir.exists());
        assert!(dir.ends_with("saves/Foo"));
    }
}
