use std::sync::mpsc::{self, Receiver, Sender};
use std::time::Duration;

use plaza_shared::protocol::{ClientMsg, ServerMsg, PROTOCOL_VERSION};

#[derive(Debug, Clone)]
pub enum NetEvent {
    Connected,
    Disconnected,
    Message(ServerMsg),
    ProtocolMismatch { server: u32, client: u32 },
}

pub const INITIAL_RECONNECT_DELAY: Duration = Duration::from_millis(1000);
pub const MAX_RECONNECT_DELAY: Duration = Duration::from_millis(30_000);

type CmdSender = tokio::sync::mpsc::UnboundedSender<ClientMsg>;
type CmdReceiver = tokio::sync::mpsc::UnboundedReceiver<ClientMsg>;

/// Websocket link to the plaza server, run on its own thread. Reconnects
/// with backoff until dropped.
pub struct ServerConnection {
    url: url::Url,
    event_rx: Receiver<NetEvent>,
    cmd_tx: CmdSender,
}

impl ServerConnection {
    pub fn connect(url: &str) -> Result<Self, url::ParseError> {
        let url = url::Url::parse(url)?;
        let (event_tx, event_rx) = mpsc::channel::<NetEvent>();
        let cmd_tx = spawn_network_thread(url.to_string(), event_tx);
        Ok(Self {
            url,
            event_rx,
            cmd_tx,
        })
    }

    pub fn url(&self) -> &url::Url {
        &self.url
    }

    pub fn poll_events(&mut self) -> Vec<NetEvent> {
        let mut out = Vec::new();
        while let Ok(evt) = self.event_rx.try_recv() {
            out.push(evt);
        }
        out
    }

    /// Queue a message. Anything queued before `NetEvent::Connected` is
    /// reported for the current connection is dropped unsent.
    pub fn send(&self, msg: ClientMsg) {
        let _ = self.cmd_tx.send(msg);
    }
}

pub fn next_backoff(delay: Duration) -> Duration {
    delay.mul_f32(1.5).min(MAX_RECONNECT_DELAY)
}

/// Drop every queued command. Returns `None` once the owner is gone.
fn discard_pending(cmd_rx: &mut CmdReceiver) -> Option<usize> {
    use tokio::sync::mpsc::error::TryRecvError;

    let mut dropped = 0;
    loop {
        match cmd_rx.try_recv() {
            Ok(_) => dropped += 1,
            Err(TryRecvError::Empty) => return Some(dropped),
            Err(TryRecvError::Disconnected) => return None,
        }
    }
}

fn spawn_network_thread(url: String, event_tx: Sender<NetEvent>) -> CmdSender {
    use futures_util::{SinkExt, StreamExt};
    use tokio_tungstenite::tungstenite::Message;

    let (cmd_tx, mut cmd_rx) = tokio::sync::mpsc::unbounded_channel::<ClientMsg>();

    std::thread::spawn(move || {
        let rt = match tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_io()
            .enable_time()
            .build()
        {
            Ok(rt) => rt,
            Err(e) => {
                tracing::error!("Failed to build network runtime: {}", e);
                return;
            }
        };

        rt.block_on(async move {
            let mut reconnect_delay = INITIAL_RECONNECT_DELAY;

            loop {
                let connect = tokio_tungstenite::connect_async(url.as_str()).await;

                let (ws_stream, _) = match connect {
                    Ok(x) => x,
                    Err(e) => {
                        tracing::debug!("Connect to {} failed: {}", url, e);
                        if discard_pending(&mut cmd_rx).is_none() {
                            return;
                        }
                        tokio::time::sleep(reconnect_delay).await;
                        reconnect_delay = next_backoff(reconnect_delay);
                        continue;
                    }
                };

                reconnect_delay = INITIAL_RECONNECT_DELAY;
                // Moves and signals queued while down belong to the old session
                match discard_pending(&mut cmd_rx) {
                    None => return,
                    Some(0) => {}
                    Some(n) => tracing::debug!("Dropped {} messages queued while disconnected", n),
                }
                if event_tx.send(NetEvent::Connected).is_err() {
                    return; // Owner gone
                }

                let (mut write, mut read) = ws_stream.split();
                let mut mismatch = false;

                loop {
                    tokio::select! {
                        biased;

                        cmd = cmd_rx.recv() => {
                            let Some(cmd) = cmd else {
                                let _ = write.close().await;
                                return;
                            };
                            if let Ok(text) = serde_json::to_string(&cmd) {
                                if write.send(Message::Text(text.into())).await.is_err() {
                                    break;
                                }
                            }
                        }

                        msg = read.next() => {
                            match msg {
                                Some(Ok(Message::Text(txt))) => {
                                    let server_msg = match serde_json::from_str::<ServerMsg>(&txt) {
                                        Ok(m) => m,
                                        Err(e) => {
                                            tracing::debug!("Unparseable server message: {}", e);
                                            continue;
                                        }
                                    };
                                    if let ServerMsg::Introduction(intro) = &server_msg {
                                        if intro.protocol_version != PROTOCOL_VERSION {
                                            let _ = event_tx.send(NetEvent::ProtocolMismatch {
                                                server: intro.protocol_version,
                                                client: PROTOCOL_VERSION,
                                            });
                                            let _ = write.close().await;
                                            mismatch = true;
                                            break;
                                        }
                                    }
                                    if event_tx.send(NetEvent::Message(server_msg)).is_err() {
                                        return;
                                    }
                                }
                                Some(Ok(Message::Close(_))) | None => break,
                                Some(Ok(_)) => {}
                                Some(Err(e)) => {
                                    tracing::debug!("Socket error: {}", e);
                                    break;
                                }
                            }
                        }
                    }
                }

                if event_tx.send(NetEvent::Disconnected).is_err() {
                    return;
                }
                // Same server, same version: retrying cannot help
                if mismatch {
                    tracing::warn!("Protocol mismatch with {}, not reconnecting", url);
                    return;
                }
                tokio::time::sleep(reconnect_delay).await;
                reconnect_delay = next_backoff(reconnect_delay);
            }
        });
    });

    cmd_tx
}
