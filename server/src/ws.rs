use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use plaza_shared::protocol::{ClientMsg, ServerMsg, SignalEnvelope};
use plaza_shared::PeerId;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, mpsc, oneshot, Semaphore};
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;

use crate::config::ServerConfig;
use crate::hub::{HubBroadcast, HubCommand};
use crate::rate_limit::MoveLimiter;

/// Pending inbound signals per session before further ones are dropped
const SIGNAL_QUEUE_DEPTH: usize = 64;

/// Shared app state passed to each WebSocket handler
#[derive(Clone)]
pub struct AppState {
    pub hub_tx: mpsc::Sender<HubCommand>,
    pub broadcast_tx: broadcast::Sender<HubBroadcast>,
    pub connection_semaphore: Arc<Semaphore>,
    pub max_message_bytes: usize,
    pub max_moves_per_sec: u32,
}

impl AppState {
    pub fn new(
        config: &ServerConfig,
        hub_tx: mpsc::Sender<HubCommand>,
        broadcast_tx: broadcast::Sender<HubBroadcast>,
    ) -> Self {
        Self {
            hub_tx,
            broadcast_tx,
            connection_semaphore: Arc::new(Semaphore::new(config.max_connections)),
            max_message_bytes: config.max_message_bytes,
            max_moves_per_sec: config.max_moves_per_sec,
        }
    }
}

/// `/ws` for sessions, everything else served from `static_dir` if given.
pub fn router(app_state: AppState, static_dir: Option<&str>) -> Router {
    let mut app = Router::new().route("/ws", get(ws_handler));
    if let Some(dir) = static_dir {
        app = app.fallback_service(ServeDir::new(dir));
    }
    app.layer(CorsLayer::permissive()).with_state(app_state)
}

/// HTTP handler for WebSocket upgrade
pub async fn ws_handler(ws: WebSocketUpgrade, State(app_state): State<AppState>) -> Response {
    let permit = match app_state.connection_semaphore.clone().try_acquire_owned() {
        Ok(permit) => permit,
        Err(_) => {
            tracing::warn!("Connection limit reached, refusing session");
            return StatusCode::SERVICE_UNAVAILABLE.into_response();
        }
    };

    // Oversized frames fail while reading instead of being buffered whole
    ws.max_message_size(app_state.max_message_bytes)
        .on_upgrade(move |socket| async move {
            handle_socket(socket, app_state).await;
            drop(permit);
        })
}

async fn handle_socket(socket: WebSocket, app_state: AppState) {
    let (mut sink, stream) = socket.split();

    // Subscribe before joining so no announcement issued after our
    // registration can be missed
    let broadcast_rx = app_state.broadcast_tx.subscribe();

    let (signal_tx, signal_rx) = mpsc::channel::<SignalEnvelope>(SIGNAL_QUEUE_DEPTH);
    let (resp_tx, resp_rx) = oneshot::channel();
    if app_state
        .hub_tx
        .send(HubCommand::Join {
            signal_tx,
            response: resp_tx,
        })
        .await
        .is_err()
    {
        tracing::error!("Failed to send Join command");
        return;
    }

    let (my_id, introduction) = match resp_rx.await {
        Ok(result) => result,
        Err(_) => {
            tracing::error!("Failed to receive introduction");
            return;
        }
    };

    tracing::info!("Session {} connected", my_id);

    if send_msg(&mut sink, &ServerMsg::Introduction(introduction)).await {
        run_session(&my_id, &app_state, sink, stream, broadcast_rx, signal_rx).await;
    }

    // Cleanup on disconnect
    let _ = app_state
        .hub_tx
        .send(HubCommand::Leave { id: my_id.clone() })
        .await;
    tracing::info!("Session {} disconnected", my_id);
}

async fn run_session(
    my_id: &PeerId,
    app_state: &AppState,
    mut sink: SplitSink<WebSocket, Message>,
    mut stream: futures_util::stream::SplitStream<WebSocket>,
    mut broadcast_rx: broadcast::Receiver<HubBroadcast>,
    mut signal_rx: mpsc::Receiver<SignalEnvelope>,
) {
    let mut limiter = MoveLimiter::new(app_state.max_moves_per_sec, Instant::now());

    loop {
        tokio::select! {
            // The hub queues a peer's signals before announcing its leave;
            // polling signals first keeps that order on the socket
            biased;

            // Server -> Client (addressed signals)
            Some(envelope) = signal_rx.recv() => {
                if !send_msg(&mut sink, &ServerMsg::Signal(envelope)).await {
                    break;
                }
            }

            // Server -> Client (broadcast)
            result = broadcast_rx.recv() => {
                match delivery_for(my_id, result) {
                    Delivery::Send(msg) => {
                        if !send_msg(&mut sink, &msg).await {
                            break;
                        }
                    }
                    Delivery::Skip => {}
                    Delivery::End => break,
                }
            }

            // Client -> Server
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if text.len() > app_state.max_message_bytes {
                            tracing::warn!(
                                "Session {} sent {} bytes, closing",
                                my_id,
                                text.len()
                            );
                            break;
                        }
                        let cmd = match serde_json::from_str::<ClientMsg>(&text) {
                            Ok(client_msg) => command_for(my_id, client_msg, &mut limiter),
                            Err(e) => {
                                tracing::debug!("Unparseable message from {}: {}", my_id, e);
                                None
                            }
                        };
                        if let Some(cmd) = cmd {
                            if app_state.hub_tx.send(cmd).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        tracing::debug!("Session {} transport error: {}", my_id, e);
                        break;
                    }
                    _ => {} // Ignore ping/pong/binary
                }
            }
        }
    }
}

/// Translate a parsed client message into a hub command. Moves over the
/// rate limit are dropped here.
fn command_for(my_id: &PeerId, msg: ClientMsg, limiter: &mut MoveLimiter) -> Option<HubCommand> {
    match msg {
        ClientMsg::Move(msg) => {
            if !limiter.allow(Instant::now()) {
                tracing::debug!("Session {} over move rate, dropped", my_id);
                return None;
            }
            Some(HubCommand::Move {
                id: my_id.clone(),
                msg,
            })
        }
        ClientMsg::Signal(mut envelope) => {
            // A session may only speak for its own peer
            if envelope.from != *my_id {
                tracing::debug!(
                    "Session {} signalled as {}, rewriting sender",
                    my_id,
                    envelope.from
                );
                envelope.from = my_id.clone();
            }
            Some(HubCommand::Signal(envelope))
        }
        ClientMsg::Data { payload } => Some(HubCommand::Data {
            from: my_id.clone(),
            payload,
        }),
    }
}

enum Delivery {
    Send(ServerMsg),
    Skip,
    End,
}

/// Decide what one broadcast receive means for the session. A lagged
/// receiver may have missed a join or leave, which no later message
/// repeats, so the session ends and the client rejoins from a fresh
/// introduction.
fn delivery_for(
    my_id: &PeerId,
    result: Result<HubBroadcast, broadcast::error::RecvError>,
) -> Delivery {
    match result {
        Ok(broadcast) => match outbound_for(my_id, broadcast) {
            Some(msg) => Delivery::Send(msg),
            None => Delivery::Skip,
        },
        Err(broadcast::error::RecvError::Lagged(n)) => {
            tracing::warn!("Session {} lagged by {} messages, closing", my_id, n);
            Delivery::End
        }
        Err(broadcast::error::RecvError::Closed) => Delivery::End,
    }
}

fn outbound_for(my_id: &PeerId, broadcast: HubBroadcast) -> Option<ServerMsg> {
    let msg = match broadcast {
        HubBroadcast::Positions(p) => ServerMsg::Positions((*p).clone()),
        HubBroadcast::PeerJoined(p) => {
            if p.id == *my_id {
                return None; // Not for the peer that joined
            }
            ServerMsg::PeerConnection((*p).clone())
        }
        HubBroadcast::PeerLeft(id) => ServerMsg::PeerDisconnection { id },
        HubBroadcast::Data(payload) => ServerMsg::Data {
            payload: (*payload).clone(),
        },
        HubBroadcast::Announce(text) => ServerMsg::ServerMessage {
            text: text.to_string(),
        },
    };
    Some(msg)
}

/// Returns false once the socket can no longer be written.
async fn send_msg(sink: &mut SplitSink<WebSocket, Message>, msg: &ServerMsg) -> bool {
    match serde_json::to_string(msg) {
        Ok(json) => sink.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            tracing::error!("Failed to serialize server message: {}", e);
            true
        }
    }
}
