use crate::broadcaster::TickBroadcaster;
use crate::config::ServerConfig;
use crate::registry::PeerRegistry;
use crate::relay::SignalRelay;
use plaza_shared::config::WorldConfig;
use plaza_shared::protocol::{
    IntroductionMsg, MoveMsg, PeerConnectionMsg, PositionsMsg, SignalEnvelope, PROTOCOL_VERSION,
};
use plaza_shared::PeerId;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};

/// Commands from sessions (and admin tooling) to the hub
pub enum HubCommand {
    Join {
        signal_tx: mpsc::Sender<SignalEnvelope>,
        response: oneshot::Sender<(PeerId, IntroductionMsg)>,
    },
    Leave {
        id: PeerId,
    },
    Move {
        id: PeerId,
        msg: MoveMsg,
    },
    Signal(SignalEnvelope),
    Data {
        from: PeerId,
        payload: serde_json::Value,
    },
    TeleportAll {
        position: [f64; 3],
    },
    Announce {
        text: String,
    },
}

/// Broadcasts from the hub to all sessions
#[derive(Debug, Clone)]
pub enum HubBroadcast {
    Positions(Arc<PositionsMsg>),
    PeerJoined(Arc<PeerConnectionMsg>),
    PeerLeft(PeerId),
    Data(Arc<serde_json::Value>),
    Announce(Arc<str>),
}

/// Owns the registry and the signal routes. Only the hub task touches it.
pub struct Hub {
    registry: PeerRegistry,
    relay: SignalRelay,
    broadcaster: TickBroadcaster,
    world: WorldConfig,
    broadcast_tx: broadcast::Sender<HubBroadcast>,
}

impl Hub {
    pub fn new(config: &ServerConfig, broadcast_tx: broadcast::Sender<HubBroadcast>) -> Self {
        Self {
            registry: PeerRegistry::new(config.name_prefix.clone()),
            relay: SignalRelay::new(),
            broadcaster: TickBroadcaster::new(config.tick_period()),
            world: config.world.clone(),
            broadcast_tx,
        }
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    pub fn broadcaster(&self) -> &TickBroadcaster {
        &self.broadcaster
    }

    pub fn on_tick(&mut self) -> usize {
        self.broadcaster.tick(&self.registry, &self.broadcast_tx)
    }

    pub fn handle(&mut self, cmd: HubCommand) {
        match cmd {
            HubCommand::Join {
                signal_tx,
                response,
            } => self.join(signal_tx, response),
            HubCommand::Leave { id } => self.leave(&id),
            HubCommand::Move { id, msg } => {
                if !self
                    .registry
                    .update(&id, &msg.position, &msg.rotation, msg.is_shouting)
                {
                    tracing::debug!("Dropped malformed move from {}", id);
                }
            }
            HubCommand::Signal(envelope) => {
                self.relay.relay(&self.registry, envelope);
            }
            HubCommand::Data { from, payload } => {
                tracing::debug!("Data from {}", from);
                let _ = self.broadcast_tx.send(HubBroadcast::Data(Arc::new(payload)));
            }
            HubCommand::TeleportAll { position } => {
                let moved = self.registry.teleport_all(position);
                tracing::info!("Teleported {} peers to {:?}", moved, position);
            }
            HubCommand::Announce { text } => {
                let _ = self.broadcast_tx.send(HubBroadcast::Announce(text.into()));
            }
        }
    }

    fn join(
        &mut self,
        signal_tx: mpsc::Sender<SignalEnvelope>,
        response: oneshot::Sender<(PeerId, IntroductionMsg)>,
    ) {
        let id = PeerId::new(uuid::Uuid::new_v4().to_string());
        let peer = self.registry.register(id.clone());
        self.relay.attach(id.clone(), signal_tx);

        let introduction = IntroductionMsg {
            protocol_version: PROTOCOL_VERSION,
            server_version: env!("CARGO_PKG_VERSION").to_string(),
            self_id: id.clone(),
            peers: self.registry.snapshot().to_roster(),
            state: self.world.clone(),
        };

        if response.send((id.clone(), introduction)).is_err() {
            // Session went away before it could learn its id
            self.registry.unregister(&id);
            self.relay.detach(&id);
            return;
        }

        tracing::info!(
            "Peer {} joined as {:?}, {} peer(s) connected",
            id,
            peer.name,
            self.registry.len()
        );
        let _ = self
            .broadcast_tx
            .send(HubBroadcast::PeerJoined(Arc::new(PeerConnectionMsg {
                id,
                peer: peer.to_wire(),
            })));
    }

    fn leave(&mut self, id: &PeerId) {
        self.relay.detach(id);
        if self.registry.unregister(id).is_some() {
            let _ = self.broadcast_tx.send(HubBroadcast::PeerLeft(id.clone()));
            tracing::info!(
                "Peer {} left, {} peer(s) connected",
                id,
                self.registry.len()
            );
        }
    }
}

/// Run the hub. Owns all shared state; sessions reach it only through
/// `cmd_rx`.
pub async fn run_hub(
    mut cmd_rx: mpsc::Receiver<HubCommand>,
    broadcast_tx: broadcast::Sender<HubBroadcast>,
    config: ServerConfig,
) {
    let mut hub = Hub::new(&config, broadcast_tx);
    let mut tick_interval = hub.broadcaster().interval();

    loop {
        tokio::select! {
            _ = tick_interval.tick() => {
                hub.on_tick();
            }

            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(cmd) => hub.handle(cmd),
                    None => break,
                }
            }
        }
    }

    tracing::info!("Hub ended");
}
