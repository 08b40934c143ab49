use std::{sync::Arc, time::Duration};

use clockwork_process::{GameEvent, GameRecord};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::{net::TcpStream, sync::mpsc, task::JoinHandle};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream,
    tungstenite::{Message as WsMessage, client::IntoClientRequest},
};
use tracing::{Instrument, info_span};

use crate::config::SlaveConfig;
use crate::error_payload::ErrorPayload;
use crate::game_service::GameService;
use crate::supervisor_support::format_error_chain;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "type")]
enum SlaveToMasterFrame {
    #[serde(rename = "hello")]
    Hello {
        name: String,
        #[serde(rename = "hostedGameNames")]
        hosted_game_names: Vec<String>,
        capacity: u32,
        token: String,
        ip: String,
        #[serde(rename = "ownerDiscordId")]
        owner_discord_id: Option<String>,
        #[serde(rename = "agentVersion")]
        agent_version: String,
    },
    #[serde(rename = "resp")]
    Resp {
        id: String,
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<ErrorPayload>,
    },
    #[serde(rename = "event")]
    Event(GameEvent),
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(tag = "type")]
enum MasterToSlaveFrame {
    #[serde(rename = "validated")]
    Validated {
        #[serde(default)]
        games: Option<Vec<GameRecord>>,
    },
    #[serde(rename = "req")]
    Req {
        id: String,
        method: String,
        #[serde(default)]
        payload: Value,
    },
    #[serde(other)]
    Unknown,
}

fn parse_ws_url(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    // Support http(s) URLs by converting to ws(s).
    if let Some(rest) = trimmed.strip_prefix("https://") {
        return Some(format!("wss://{rest}"));
    }
    if let Some(rest) = trimmed.strip_prefix("http://") {
        return Some(format!("ws://{rest}"));
    }
    Some(trimmed.to_string())
}

fn to_text(frame: &SlaveToMasterFrame) -> anyhow::Result<WsMessage> {
    Ok(WsMessage::Text(serde_json::to_string(frame)?.into()))
}

/// Starts the master link in the background. Returns `None` when no master
/// URL is configured.
pub fn spawn(
    config: Arc<SlaveConfig>,
    service: GameService,
    events: mpsc::UnboundedReceiver<GameEvent>,
) -> Option<JoinHandle<()>> {
    let Some(url) = parse_ws_url(&config.master_url) else {
        tracing::warn!("no master_url configured; not connecting to a master server");
        return None;
    };

    let span = info_span!("control_tunnel", node = %config.name, url = %url);
    Some(tokio::spawn(
        async move {
            let mut events = events;
            let mut backoff = INITIAL_BACKOFF;
            let mut failed_reconnects: u32 = 0;
            let mut games_shut_down = false;
            loop {
                match connect(&url, &config).await {
                    Ok(ws) => {
                        tracing::info!("connected to master server");
                        backoff = INITIAL_BACKOFF;
                        failed_reconnects = 0;
                        games_shut_down = false;

                        match serve(ws, &config, &service, &mut events).await {
                            Ok(()) => tracing::info!("master server closed the connection"),
                            Err(e) => {
                                tracing::warn!(error = %format_error_chain(&e), "control tunnel disconnected")
                            }
                        }
                        on_disconnect(&service).await;
                    }
                    Err(e) => {
                        failed_reconnects = failed_reconnects.saturating_add(1);
                        tracing::warn!(
                            error = %format_error_chain(&e),
                            attempt = failed_reconnects,
                            "could not connect to master server"
                        );
                        if failed_reconnects >= config.shutdown_after_failed_reconnects && !games_shut_down {
                            tracing::warn!(
                                attempts = failed_reconnects,
                                "unable to reconnect; shutting down games for safety"
                            );
                            service.context().supervisor.shut_down_all().await;
                            games_shut_down = true;
                        }
                        backoff = (backoff * 2).min(MAX_BACKOFF);
                    }
                }
                tokio::time::sleep(backoff).await;
            }
        }
        .instrument(span),
    ))
}

/// Reserved ports would otherwise stay reserved for hosting sessions the
/// master no longer knows about. Timers are paused until the master is back.
async fn on_disconnect(service: &GameService) {
    service.hoster().release_all().await;
    service.hosting().freeze_all().await;
}

async fn connect(url: &str, config: &SlaveConfig) -> anyhow::Result<WsStream> {
    let mut req = url.into_client_request()?;
    if !config.token.is_empty() {
        let value = format!("Bearer {}", config.token);
        req.headers_mut().insert("Authorization", value.parse()?);
    }
    let (ws, _) = tokio_tungstenite::connect_async(req).await?;
    Ok(ws)
}

async fn serve(
    ws: WsStream,
    config: &SlaveConfig,
    service: &GameService,
    events: &mut mpsc::UnboundedReceiver<GameEvent>,
) -> anyhow::Result<()> {
    let (mut sink, mut stream) = ws.split();

    let hello = SlaveToMasterFrame::Hello {
        name: config.name.clone(),
        hosted_game_names: service.hosted_game_names().await,
        capacity: config.capacity,
        token: config.token.clone(),
        ip: config.ip.clone(),
        owner_discord_id: config.owner_discord_id.clone(),
        agent_version: env!("CARGO_PKG_VERSION").to_string(),
    };
    sink.send(to_text(&hello)?).await?;

    // Handlers run on their own tasks; their responses come back here so
    // only this loop writes to the socket.
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<SlaveToMasterFrame>();

    loop {
        tokio::select! {
            msg = stream.next() => {
                let Some(msg) = msg else { break };
                match msg? {
                    WsMessage::Text(text) => {
                        let frame = serde_json::from_str::<MasterToSlaveFrame>(&text)
                            .unwrap_or(MasterToSlaveFrame::Unknown);
                        handle_frame(frame, service, &out_tx);
                    }
                    WsMessage::Close(_) => break,
                    _ => {}
                }
            }
            Some(frame) = out_rx.recv() => {
                sink.send(to_text(&frame)?).await?;
            }
            Some(event) = events.recv() => {
                tracing::debug!(game = event.game_name(), "forwarding game event");
                sink.send(to_text(&SlaveToMasterFrame::Event(event))?).await?;
            }
        }
    }

    Ok(())
}

fn handle_frame(
    frame: MasterToSlaveFrame,
    service: &GameService,
    out: &mpsc::UnboundedSender<SlaveToMasterFrame>,
) {
    match frame {
        MasterToSlaveFrame::Validated { games } => {
            tracing::info!("authentication validated by master server");
            let Some(games) = games else { return };
            // Reconciling may kill games; keep the socket loop serving meanwhile.
            let service = service.clone();
            tokio::spawn(
                async move {
                    match service.reconcile(games).await {
                        Ok(report) => tracing::info!(
                            adopted = report.adopted.len(),
                            updated = report.updated.len(),
                            replaced = report.replaced.len(),
                            skipped = report.skipped.len(),
                            "games reconciled with master"
                        ),
                        Err(e) => tracing::error!(error = %e, "failed to reconcile games with master"),
                    }
                }
                .instrument(info_span!("reconcile")),
            );
        }
        MasterToSlaveFrame::Req { id, method, payload } => {
            let service = service.clone();
            let out = out.clone();
            let span = info_span!("request", %id, %method);
            tokio::spawn(
                async move {
                    let resp = match service.dispatch(&method, payload).await {
                        Ok(payload) => SlaveToMasterFrame::Resp {
                            id,
                            ok: true,
                            payload: Some(payload),
                            error: None,
                        },
                        Err(e) => {
                            tracing::warn!(code = e.code(), error = %e, "request failed");
                            SlaveToMasterFrame::Resp {
                                id,
                                ok: false,
                                payload: None,
                                error: Some(e.to_payload()),
                            }
                        }
                    };
                    // The link may have dropped while the handler ran.
                    let _ = out.send(resp);
                }
                .instrument(span),
            );
        }
        MasterToSlaveFrame::Unknown => {}
    }
}
