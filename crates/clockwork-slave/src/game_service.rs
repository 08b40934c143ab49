//! Request handlers for the master link. Each method name maps to one
//! handler that decodes its payload, checks the addressed game and calls
//! into the registry, the hosting queue, the supervisor or the game backend.

use base64::Engine;
use clockwork_process::{GameRecord, GameType};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::backends::{BackendContext, BackendError, StartRequest, backend_for};
use crate::error_payload::ErrorPayload;
use crate::hoster::{Hoster, HosterError};
use crate::hosting::{HostingCoordinator, HostingError, HostingOutcome};
use crate::process_supervisor::KillError;
use crate::registry::{ReconcileReport, RegistryError, validate_name_format};
use crate::supervisor_support::format_error_chain;
use crate::timer::{self, TimerError, TimerValue};

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("unknown method: {0}")]
    UnknownMethod(String),
    #[error("The request payload for {method} is invalid: {source}")]
    BadRequest {
        method: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("The request is missing the {0} field.")]
    Missing(&'static str),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Hoster(#[from] HosterError),
    #[error(transparent)]
    Hosting(#[from] HostingError),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Kill(#[from] KillError),
    #[error("An error occurred when getting {name}'s timer info: {source}")]
    TurnInfo {
        name: String,
        #[source]
        source: TimerError,
    },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ServiceError {
    pub fn code(&self) -> &'static str {
        match self {
            ServiceError::UnknownMethod(_) => "unknown_method",
            ServiceError::BadRequest { .. } | ServiceError::Missing(_) => "invalid_request",
            ServiceError::Registry(RegistryError::NameMismatch(_)) => "name_mismatch",
            ServiceError::Registry(RegistryError::UnknownPort(_)) => "unknown_game",
            ServiceError::Registry(_) => "registry",
            ServiceError::Hoster(_) => "hoster",
            ServiceError::Hosting(_) => "hosting",
            ServiceError::Backend(BackendError::Unsupported(_)) => "unsupported",
            ServiceError::Backend(_) => "game",
            ServiceError::Kill(_) => "kill",
            ServiceError::TurnInfo { .. } => "turn_info",
            ServiceError::Other(_) => "internal",
        }
    }

    pub fn to_payload(&self) -> ErrorPayload {
        let message = match self {
            ServiceError::Other(e) | ServiceError::Backend(BackendError::Other(e)) => format_error_chain(e),
            other => other.to_string(),
        };
        let hint = match self {
            ServiceError::Kill(e) if e.port_still_bound() => {
                Some(format!("Something else may be listening on port {}.", e.port()))
            }
            _ => None,
        };
        ErrorPayload::new(self.code(), message, hint)
    }
}

/// Union of the fields the master sends across all methods. Each handler
/// reads the ones it needs.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GameRequest {
    pub port: Option<u16>,
    pub name: Option<String>,
    pub game_type: Option<GameType>,
    pub args: Option<Vec<String>>,
    pub timer: Option<TimerValue>,
    pub current_timer: Option<TimerValue>,
    /// Minutes between turns.
    pub default_timer: Option<u64>,
    pub turn_nbr: Option<u32>,
    pub is_new_turn: Option<bool>,
    #[serde(alias = "nationFilename")]
    pub nation_file: Option<String>,
    pub last_hosted_time: Option<u64>,
    pub mapfile: Option<String>,
    #[serde(rename = "mod")]
    pub mod_file: Option<String>,
}

impl GameRequest {
    fn port(&self) -> Result<u16, ServiceError> {
        self.port.ok_or(ServiceError::Missing("port"))
    }

    fn name(&self) -> Result<&str, ServiceError> {
        self.name.as_deref().ok_or(ServiceError::Missing("name"))
    }

    fn game_type(&self) -> Result<GameType, ServiceError> {
        self.game_type.ok_or(ServiceError::Missing("gameType"))
    }

    fn nation_file(&self) -> Result<&str, ServiceError> {
        self.nation_file.as_deref().ok_or(ServiceError::Missing("nationFile"))
    }

    fn turn_nbr(&self) -> Result<u32, ServiceError> {
        self.turn_nbr.ok_or(ServiceError::Missing("turnNbr"))
    }
}

#[derive(Clone)]
pub struct GameService {
    ctx: BackendContext,
    hosting: HostingCoordinator,
    hoster: Hoster,
}

impl GameService {
    pub fn new(ctx: BackendContext, hosting: HostingCoordinator, hoster: Hoster) -> Self {
        Self { ctx, hosting, hoster }
    }

    pub fn hosting(&self) -> &HostingCoordinator {
        &self.hosting
    }

    pub fn hoster(&self) -> &Hoster {
        &self.hoster
    }

    pub fn context(&self) -> &BackendContext {
        &self.ctx
    }

    pub async fn hosted_game_names(&self) -> Vec<String> {
        self.ctx.supervisor.registry().names().await
    }

    /// Brings the registry in line with the master's list. Games whose port
    /// now belongs to a different game are shut down first.
    pub async fn reconcile(&self, master: Vec<GameRecord>) -> Result<ReconcileReport, ServiceError> {
        let registry = self.ctx.supervisor.registry();
        for port in registry.mismatched_ports(&master).await {
            tracing::warn!(port, "port is assigned to a different game by the master; shutting it down");
            self.ctx.supervisor.nuke(port).await;
        }
        Ok(registry.reconcile(master).await?)
    }

    pub async fn dispatch(&self, method: &str, payload: Value) -> Result<Value, ServiceError> {
        let req: GameRequest = if payload.is_null() {
            GameRequest::default()
        } else {
            serde_json::from_value(payload).map_err(|source| ServiceError::BadRequest {
                method: method.to_string(),
                source,
            })?
        };

        match method {
            "reservePort" => Ok(serde_json::to_value(self.hoster.reserve_port().await?).map_err(anyhow::Error::from)?),
            "releasePort" => {
                let released = self.hoster.release_port(req.port()?).await;
                Ok(json!({ "released": released }))
            }
            "checkGameName" => {
                self.hoster.check_game_name(req.name()?, req.game_type()?).await?;
                Ok(Value::Null)
            }
            "validateMap" => {
                let mapfile = req.mapfile.as_deref().ok_or(ServiceError::Missing("mapfile"))?;
                Ok(Value::String(self.hoster.validate_map(mapfile, req.game_type()?).await?))
            }
            "validateMod" => {
                let mod_file = req.mod_file.as_deref().ok_or(ServiceError::Missing("mod"))?;
                self.hoster.validate_mod(mod_file, req.game_type()?).await?;
                Ok(Value::Null)
            }
            "getModList" => Ok(json!(backend_for(req.game_type()?).mod_list(&self.ctx).await?)),
            "getMapList" => Ok(json!(backend_for(req.game_type()?).map_list(&self.ctx).await?)),
            "create" => self.create(req).await,
            "host" => self.host(req).await,
            "getDump" => {
                let game = self.ctx.supervisor.registry().require(req.port()?).await?;
                Ok(json!(backend_for(game.game_type).dump(&self.ctx, &game).await?))
            }
            _ => self.dispatch_named(method, req).await,
        }
    }

    async fn create(&self, req: GameRequest) -> Result<Value, ServiceError> {
        let port = req.port()?;
        let name = req.name()?;
        validate_name_format(name)?;
        let record = GameRecord::new(port, name, req.game_type()?, req.args.clone().unwrap_or_default());
        self.ctx.supervisor.registry().create(record).await?;
        self.hoster.release_port(port).await;
        tracing::info!(port, name, "game created");
        Ok(Value::Null)
    }

    async fn host(&self, req: GameRequest) -> Result<Value, ServiceError> {
        let port = req.port()?;
        let registry = self.ctx.supervisor.registry();
        let game = registry.require(port).await?;
        if req.name.as_deref().is_some_and(|name| name != game.name) {
            return Err(RegistryError::NameMismatch(port).into());
        }
        match self.hosting.request_hosting(port, req.args, req.timer).await? {
            HostingOutcome::AlreadyRunning => Ok(json!("The game is already up and running.")),
            HostingOutcome::TimerRestored => Ok(Value::Null),
            HostingOutcome::Spawned(p) => Ok(json!({ "pid": p.pid })),
        }
    }

    /// Methods addressed to one game by port that must also name it.
    async fn dispatch_named(&self, method: &str, req: GameRequest) -> Result<Value, ServiceError> {
        let known = matches!(
            method,
            "kill"
                | "nuke"
                | "deleteGameSavefiles"
                | "getLastHostedTime"
                | "deleteGameData"
                | "getTurnFile"
                | "getScoreDump"
                | "saveSettings"
                | "start"
                | "restart"
                | "backupSavefiles"
                | "rollback"
                | "changeCurrentTimer"
                | "changeDefaultTimer"
                | "getStales"
                | "getTurnInfo"
                | "getSubmittedPretenders"
                | "removePretender"
        );
        if !known {
            return Err(ServiceError::UnknownMethod(method.to_string()));
        }

        let port = req.port()?;
        let registry = self.ctx.supervisor.registry();
        let game = registry.require_named(port, req.name()?).await?;
        let backend = backend_for(game.game_type);
        let ctx = &self.ctx;
        let b64 = base64::engine::general_purpose::STANDARD;

        match method {
            "kill" => {
                ctx.supervisor.kill(port).await?;
                Ok(Value::Null)
            }
            "nuke" => {
                ctx.supervisor.nuke(port).await;
                Ok(Value::Null)
            }
            "deleteGameSavefiles" => {
                let lease = ctx.supervisor.lease(port).await;
                ctx.supervisor.kill_leased(&lease).await?;
                Ok(json!(backend.delete_savefiles(ctx, &game).await?))
            }
            "deleteGameData" => {
                let lease = ctx.supervisor.lease(port).await;
                ctx.supervisor.kill_leased(&lease).await?;
                registry.delete(port).await?;
                tracing::info!(port, name = %game.name, "game data deleted");
                Ok(Value::Null)
            }
            "getLastHostedTime" => Ok(json!(backend.last_hosted_time(ctx, &game).await?)),
            "getTurnFile" => {
                let bytes = backend.turn_file(ctx, &game, req.nation_file()?).await?;
                Ok(Value::String(b64.encode(bytes)))
            }
            "getScoreDump" => Ok(Value::String(b64.encode(backend.score_dump(ctx, &game).await?))),
            "saveSettings" => {
                let args = req.args.ok_or(ServiceError::Missing("args"))?;
                registry.update_args(port, args).await?;
                Ok(Value::Null)
            }
            "start" => {
                let lease = ctx.supervisor.lease(port).await;
                let start = StartRequest {
                    timer: req.timer,
                    args: req.args,
                };
                backend.start(ctx, &lease, &game, start).await?;
                Ok(Value::Null)
            }
            "restart" => {
                let lease = ctx.supervisor.lease(port).await;
                backend.restart(ctx, &lease, &game).await?;
                Ok(Value::Null)
            }
            "backupSavefiles" => {
                let turn = req.turn_nbr()?;
                let target = backend
                    .backup_savefiles(ctx, &game, req.is_new_turn.unwrap_or(false), turn)
                    .await?;
                Ok(Value::String(target.display().to_string()))
            }
            "rollback" => {
                let turn = req.turn_nbr()?;
                let lease = ctx.supervisor.lease(port).await;
                backend.rollback(ctx, &lease, &game, turn, req.timer.as_ref()).await?;
                Ok(Value::Null)
            }
            "changeCurrentTimer" => {
                let timer = req.timer.ok_or(ServiceError::Missing("timer"))?;
                let lease = ctx.supervisor.lease(port).await;
                backend.change_current_timer(ctx, &lease, &game, &timer).await?;
                Ok(Value::Null)
            }
            "changeDefaultTimer" => {
                // `timer` carries minutes here when `defaultTimer` is absent.
                let minutes = req
                    .default_timer
                    .or_else(|| req.timer.as_ref().map(TimerValue::total_seconds))
                    .ok_or(ServiceError::Missing("defaultTimer"))?;
                let current = req.current_timer.ok_or(ServiceError::Missing("currentTimer"))?;
                backend.change_default_timer(ctx, &game, minutes, &current).await?;
                Ok(Value::Null)
            }
            "getStales" => {
                let last_hosted = match req.last_hosted_time {
                    Some(t) => t,
                    None => backend.last_hosted_time(ctx, &game).await?,
                };
                Ok(json!(backend.stales(ctx, &game, last_hosted).await?))
            }
            "getTurnInfo" => {
                let t = timer::read_timer(&ctx.config.status_page_path(&game.name))
                    .await
                    .map_err(|source| ServiceError::TurnInfo {
                        name: game.name.clone(),
                        source,
                    })?;
                Ok(json!(t))
            }
            "getSubmittedPretenders" => Ok(json!(backend.submitted_pretenders(ctx, &game).await?)),
            "removePretender" => {
                backend.remove_pretender(ctx, &game, req.nation_file()?).await?;
                ctx.supervisor.kill(port).await?;
                self.hosting.request_hosting(port, None, None).await?;
                Ok(Value::Null)
            }
            _ => Err(ServiceError::UnknownMethod(method.to_string())),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::backends::test_support::{Fixture, fixture};

    fn free_port() -> u16 {
        let l = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
        l.local_addr().unwrap().port()
    }

    fn service(fx: &Fixture) -> GameService {
        let hosting = HostingCoordinator::new(fx.ctx.clone(), Duration::from_millis(10));
        let hoster = Hoster::new(Arc::clone(&fx.ctx.config), fx.ctx.supervisor.registry().clone());
        GameService::new(fx.ctx.clone(), hosting, hoster)
    }

    async fn create(svc: &GameService, port: u16, name: &str, game_type: &str) {
        svc.dispatch(
            "create",
            json!({
                "port": port,
                "name": name,
                "gameType": game_type,
                "args": ["-c", "exec sleep 30"],
            }),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn named_methods_reject_a_mismatched_name() {
        let fx = fixture().await;
        let svc = service(&fx);
        let port = free_port();
        create(&svc, port, "Foo", "dom5").await;

        let err = svc
            .dispatch("kill", json!({ "port": port, "name": "Bar" }))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Registry(RegistryError::NameMismatch(_))));
        assert_eq!(err.to_payload().message, "The game's name and port do not match.");
        assert_eq!(err.code(), "name_mismatch");

        assert_eq!(
            svc.dispatch("kill", json!({ "port": port, "name": "Foo" })).await.unwrap(),
            Value::Null
        );
    }

    #[tokio::test]
    async fn bad_requests_are_reported() {
        let fx = fixture().await;
        let svc = service(&fx);
        assert!(matches!(
            svc.dispatch("frobnicate", Value::Null).await,
            Err(ServiceError::UnknownMethod(_))
        ));
        assert!(matches!(
            svc.dispatch("kill", json!({ "name": "Foo" })).await,
            Err(ServiceError::Missing("port"))
        ));
        assert!(matches!(
            svc.dispatch("create", json!({ "port": "not a port" })).await,
            Err(ServiceError::BadRequest { .. })
        ));
        assert!(matches!(
            svc.dispatch("create", json!({ "port": 6000, "name": "bad name", "gameType": "dom5" })).await,
            Err(ServiceError::Registry(RegistryError::InvalidName(_)))
        ));
    }

    #[tokio::test]
    async fn created_game_takes_over_its_reservation() {
        let fx = fixture().await;
        let svc = service(&fx);
        let reserved = svc.dispatch("reservePort", Value::Null).await.unwrap();
        let port = reserved["port"].as_u64().unwrap() as u16;
        assert_eq!(svc.hoster().reserved_ports().await, vec![port]);

        create(&svc, port, "Foo", "dom5").await;
        assert!(svc.hoster().reserved_ports().await.is_empty());
        assert_eq!(svc.hosted_game_names().await, vec!["Foo".to_string()]);

        let err = svc
            .dispatch("create", json!({ "port": port, "name": "Bar", "gameType": "dom5" }))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Registry(RegistryError::PortInUse(_))));
    }

    #[tokio::test]
    async fn settings_turn_info_and_turn_files() {
        let fx = fixture().await;
        let svc = service(&fx);
        let port = free_port();
        create(&svc, port, "Foo", "dom5").await;

        svc.dispatch(
            "saveSettings",
            json!({ "port": port, "name": "Foo", "args": ["--era", "2"] }),
        )
        .await
        .unwrap();
        let record = fx.ctx.supervisor.registry().get(port).await.unwrap();
        assert_eq!(record.args, vec!["--era", "2"]);

        let info = svc
            .dispatch("getTurnInfo", json!({ "port": port, "name": "Foo" }))
            .await
            .unwrap();
        assert_eq!(info["turn"], 0);
        assert_eq!(info["isPaused"], true);

        let saves = fx.ctx.savedgames_dir(&record);
        std::fs::create_dir_all(&saves).unwrap();
        std::fs::write(saves.join("mid_ulm.trn"), "abc").unwrap();
        let file = svc
            .dispatch(
                "getTurnFile",
                json!({ "port": port, "name": "Foo", "nationFilename": "mid_ulm.trn" }),
            )
            .await
            .unwrap();
        assert_eq!(file, json!("YWJj"));
    }

    #[tokio::test]
    async fn host_then_delete_game_data() {
        let fx = fixture().await;
        let svc = service(&fx);
        let port = free_port();
        create(&svc, port, "Foo", "coe4").await;

        let hosted = svc.dispatch("host", json!({ "port": port, "name": "Foo" })).await.unwrap();
        assert!(hosted["pid"].is_u64());
        assert_eq!(
            svc.dispatch("host", json!({ "port": port })).await.unwrap(),
            json!("The game is already up and running.")
        );
        assert!(matches!(
            svc.dispatch("getStales", json!({ "port": port, "name": "Foo" })).await,
            Err(ServiceError::Backend(BackendError::Unsupported(_)))
        ));

        svc.dispatch("deleteGameData", json!({ "port": port, "name": "Foo" }))
            .await
            .unwrap();
        assert!(fx.ctx.supervisor.registry().get(port).await.is_none());
        assert!(matches!(
            svc.dispatch("host", json!({ "port": port })).await,
            Err(ServiceError::Hosting(HostingError::Registry(RegistryError::UnknownPort(_))))
                | Err(ServiceError::Registry(RegistryError::UnknownPort(_)))
        ));
    }

    #[tokio::test]
    async fn reconcile_shuts_down_games_on_reassigned_ports() {
        let fx = fixture().await;
        let svc = service(&fx);
        let port = free_port();
        create(&svc, port, "Foo", "coe4").await;
        svc.dispatch("host", json!({ "port": port, "name": "Foo" })).await.unwrap();
        assert!(fx.ctx.supervisor.registry().is_running(port).await);

        let report = svc
            .reconcile(vec![GameRecord::new(port, "Bar", GameType::Coe4, vec![])])
            .await
            .unwrap();
        assert_eq!(report.replaced, vec![port]);
        let registry = fx.ctx.supervisor.registry();
        assert!(!registry.is_running(port).await);
        assert_eq!(registry.get(port).await.unwrap().name, "Bar");
    }
}
