use std::path::{Path, PathBuf};

use anyhow::Context;

use crate::config::{BackupConfig, SlaveConfig};
use crate::registry::GameRegistry;
use crate::timer;

/// Extensions that make up a game's turn state. `""` matches files without
/// an extension (`ftherlnd`).
pub const SAVE_EXTENSIONS: &[&str] = &["", ".2h", ".trn"];

fn extension_of(file_name: &str) -> String {
    match file_name.rfind('.') {
        Some(i) => file_name[i..].to_ascii_lowercase(),
        None => String::new(),
    }
}

pub fn extension_matches(file_name: &str, filter: Option<&[&str]>) -> bool {
    let Some(filter) = filter else {
        return true;
    };
    let ext = extension_of(file_name);
    filter.iter().any(|f| f.eq_ignore_ascii_case(&ext))
}

/// Copies the files of `source` into `target`, creating `target` if needed.
/// Subdirectories are only followed when `deep` is set. Returns the number
/// of files copied.
pub async fn copy_dir(
    source: &Path,
    target: &Path,
    deep: bool,
    filter: Option<&[&str]>,
) -> anyhow::Result<usize> {
    if tokio::fs::metadata(source).await.is_err() {
        anyhow::bail!("The source path {} does not exist.", source.display());
    }

    let mut copied = 0;
    let mut pending = vec![(source.to_path_buf(), target.to_path_buf())];
    while let Some((src, dst)) = pending.pop() {
        tokio::fs::create_dir_all(&dst)
            .await
            .with_context(|| format!("create {}", dst.display()))?;
        let mut rd = tokio::fs::read_dir(&src)
            .await
            .with_context(|| format!("read dir {}", src.display()))?;
        while let Some(entry) = rd.next_entry().await? {
            let file_type = entry.file_type().await?;
            let name = entry.file_name().to_string_lossy().to_string();
            if file_type.is_dir() {
                if deep {
                    pending.push((entry.path(), dst.join(&name)));
                }
                continue;
            }
            if !extension_matches(&name, filter) {
                continue;
            }
            tokio::fs::copy(entry.path(), dst.join(&name))
                .await
                .with_context(|| format!("copy {} to {}", entry.path().display(), dst.display()))?;
            copied += 1;
        }
    }
    Ok(copied)
}

/// Deletes the files directly inside `path` that pass `filter`. Directories
/// are left alone.
pub async fn delete_dir_contents(path: &Path, filter: Option<&[&str]>) -> anyhow::Result<usize> {
    let mut rd = tokio::fs::read_dir(path)
        .await
        .with_context(|| format!("read dir {}", path.display()))?;
    let mut deleted = 0;
    while let Some(entry) = rd.next_entry().await? {
        if entry.file_type().await?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if !extension_matches(&name, filter) {
            continue;
        }
        tokio::fs::remove_file(entry.path())
            .await
            .with_context(|| format!("delete {}", entry.path().display()))?;
        deleted += 1;
    }
    Ok(deleted)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupKind {
    /// Taken right before a turn processes.
    LatestTurn,
    /// Taken right after a turn processed.
    NewTurn,
}

impl BackupKind {
    pub fn from_flag(flag: &str) -> Option<Self> {
        if flag.eq_ignore_ascii_case("--preexec") {
            Some(Self::LatestTurn)
        } else if flag.eq_ignore_ascii_case("--postexec") {
            Some(Self::NewTurn)
        } else {
            None
        }
    }

    pub fn flag(self) -> &'static str {
        match self {
            Self::LatestTurn => "--preexec",
            Self::NewTurn => "--postexec",
        }
    }

    fn dir_name(self, cfg: &BackupConfig) -> &str {
        match self {
            Self::LatestTurn => &cfg.latest_turn_dir_name,
            Self::NewTurn => &cfg.new_turns_dir_name,
        }
    }
}

pub fn backup_target(cfg: &BackupConfig, kind: BackupKind, game_name: &str, turn: u32) -> PathBuf {
    cfg.root
        .join(kind.dir_name(cfg))
        .join(game_name)
        .join(format!("Turn {turn}"))
}

pub async fn backup_savefiles(
    savedgames: &Path,
    cfg: &BackupConfig,
    kind: BackupKind,
    game_name: &str,
    turn: u32,
) -> anyhow::Result<PathBuf> {
    let target = backup_target(cfg, kind, game_name, turn);
    let copied = copy_dir(savedgames, &target, false, Some(SAVE_EXTENSIONS)).await?;
    tracing::info!(game = game_name, turn, kind = ?kind, copied, target = %target.display(), "savefiles backed up");
    Ok(target)
}

/// Pre-turn snapshots win over post-turn ones for the same turn number.
pub async fn find_rollback_source(cfg: &BackupConfig, game_name: &str, turn: u32) -> Option<PathBuf> {
    for kind in [BackupKind::LatestTurn, BackupKind::NewTurn] {
        let p = backup_target(cfg, kind, game_name, turn);
        if tokio::fs::metadata(&p).await.is_ok_and(|m| m.is_dir()) {
            return Some(p);
        }
    }
    None
}

pub async fn restore_backup(source: &Path, savedgames: &Path) -> anyhow::Result<usize> {
    copy_dir(source, savedgames, false, Some(SAVE_EXTENSIONS)).await
}

pub async fn delete_savedgames_dir(path: &Path) -> anyhow::Result<()> {
    tokio::fs::remove_dir_all(path)
        .await
        .with_context(|| format!("delete {}", path.display()))
}

/// Shell command a game runs through `--preexec` / `--postexec`.
pub fn hook_command(exe: &Path, game_name: &str, kind: BackupKind) -> String {
    format!("\"{}\" backup {game_name} {}", exe.display(), kind.flag())
}

/// Entry point of `clockwork-slave backup <game> --preexec|--postexec`.
pub async fn run_backup_hook(cfg: &SlaveConfig, game_name: &str, flag: &str) -> anyhow::Result<PathBuf> {
    let kind = BackupKind::from_flag(flag).with_context(|| {
        format!("Backup type received is invalid; expected --preexec or --postexec: {flag}")
    })?;
    tracing::info!(game = game_name, flag, "backup starting");

    let status_page = cfg.status_page_path(game_name);
    let content = tokio::fs::read_to_string(&status_page)
        .await
        .with_context(|| format!("read statuspage {}", status_page.display()))?;
    let mut turn = timer::parse_status_page(&content)
        .with_context(|| format!("parse statuspage {}", status_page.display()))?
        .turn;
    // The status page still shows the old turn right after processing.
    if kind == BackupKind::NewTurn {
        turn += 1;
    }

    let registry = GameRegistry::open(&cfg.game_data_save_path).await?;
    let game_type = registry
        .find_by_name(game_name)
        .await
        .map(|r| r.game_type)
        .with_context(|| format!("no game named {game_name} is registered"))?;

    let source = cfg.savedgames_dir(game_type, game_name);
    backup_savefiles(&source, &cfg.backups, kind, game_name, turn).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use clockwork_process::{GameRecord, GameType};

    fn touch(dir: &Path, name: &str) {
        std::fs::write(dir.join(name), name.as_bytes()).unwrap();
    }

    #[test]
    fn extension_filter_handles_bare_files() {
        assert!(extension_matches("ftherlnd", Some(SAVE_EXTENSIONS)));
        assert!(extension_matches("early_arco.2H", Some(SAVE_EXTENSIONS)));
        assert!(extension_matches("early_arco.trn", Some(SAVE_EXTENSIONS)));
        assert!(!extension_matches("scores.html", Some(SAVE_EXTENSIONS)));
        assert!(extension_matches("scores.html", None));
    }

    #[tokio::test]
    async fn copy_dir_applies_filter_and_depth() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        for f in ["ftherlnd", "a.2h", "a.trn", "domcmd.txt"] {
            touch(src.path(), f);
        }
        std::fs::create_dir(src.path().join("nested")).unwrap();
        touch(&src.path().join("nested"), "b.2h");

        let target = dst.path().join("Turn 3");
        let copied = copy_dir(src.path(), &target, false, Some(SAVE_EXTENSIONS)).await.unwrap();
        assert_eq!(copied, 3);
        assert!(target.join("ftherlnd").exists());
        assert!(!target.join("domcmd.txt").exists());
        assert!(!target.join("nested").exists());

        let deep_target = dst.path().join("deep");
        let copied = copy_dir(src.path(), &deep_target, true, None).await.unwrap();
        assert_eq!(copied, 5);
        assert!(deep_target.join("nested/b.2h").exists());
    }

    #[tokio::test]
    async fn copy_dir_requires_source() {
        let dst = tempfile::tempdir().unwrap();
        let err = copy_dir(&dst.path().join("missing"), dst.path(), false, None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[tokio::test]
    async fn delete_contents_keeps_other_files() {
        let dir = tempfile::tempdir().unwrap();
        for f in ["ftherlnd", "a.2h", "a.trn", "scores.html"] {
            touch(dir.path(), f);
        }
        let deleted = delete_dir_contents(dir.path(), Some(SAVE_EXTENSIONS)).await.unwrap();
        assert_eq!(deleted, 3);
        assert!(dir.path().join("scores.html").exists());
    }

    #[tokio::test]
    async fn rollback_prefers_latest_turn_backup() {
        let root = tempfile::tempdir().unwrap();
        let cfg = BackupConfig {
            root: root.path().to_path_buf(),
            ..BackupConfig::default()
        };
        assert_eq!(
            backup_target(&cfg, BackupKind::NewTurn, "Foo", 4),
            root.path().join("new_turns/Foo/Turn 4")
        );
        assert!(find_rollback_source(&cfg, "Foo", 4).await.is_none());

        std::fs::create_dir_all(backup_target(&cfg, BackupKind::NewTurn, "Foo", 4)).unwrap();
        assert_eq!(
            find_rollback_source(&cfg, "Foo", 4).await,
            Some(backup_target(&cfg, BackupKind::NewTurn, "Foo", 4))
        );

        std::fs::create_dir_all(backup_target(&cfg, BackupKind::LatestTurn, "Foo", 4)).unwrap();
        assert_eq!(
            find_rollback_source(&cfg, "Foo", 4).await,
            Some(backup_target(&cfg, BackupKind::LatestTurn, "Foo", 4))
        );
    }

    #[tokio::test]
    async fn hook_backs_up_into_next_turn_after_processing() {
        let base = tempfile::tempdir().unwrap();
        let mut cfg = SlaveConfig::default();
        cfg.game_data_save_path = base.path().join("games.json");
        cfg.status_page_base_path = base.path().join("status");
        cfg.backups.root = base.path().join("backups");
        cfg.dom5.data_path = base.path().join("dom5");

        let registry = GameRegistry::open(&cfg.game_data_save_path).await.unwrap();
        registry
            .create(GameRecord::new(6000, "Foo", GameType::Dom5, vec![]))
            .await
            .unwrap();

        std::fs::create_dir_all(&cfg.status_page_base_path).unwrap();
        std::fs::write(
            cfg.status_page_path("Foo"),
            r#"<td class="blackbolddata" colspan="2">Foo, turn 7 (time left: 2 hours)</td>"#,
        )
        .unwrap();
        let saves = cfg.savedgames_dir(GameType::Dom5, "Foo");
        std::fs::create_dir_all(&saves).unwrap();
        touch(&saves, "ftherlnd");

        let pre = run_backup_hook(&cfg, "Foo", "--preexec").await.unwrap();
        assert_eq!(pre, cfg.backups.root.join("latest_turn/Foo/Turn 7"));
        let post = run_backup_hook(&cfg, "Foo", "--POSTEXEC").await.unwrap();
        assert_eq!(post, cfg.backups.root.join("new_turns/Foo/Turn 8"));
        assert!(post.join("ftherlnd").exists());

        assert!(run_backup_hook(&cfg, "Foo", "--bogus").await.is_err());
    }

    #[test]
    fn hook_command_quotes_executable() {
        let cmd = hook_command(Path::new("/opt/clockwork slave/bin"), "Foo", BackupKind::LatestTurn);
        assert_eq!(cmd, "\"/opt/clockwork slave/bin\" backup Foo --preexec");
    }
}
