//! Client-side view of one plaza session.
//!
//! [`ClientSession`] consumes server messages and transport callbacks and
//! produces two queues: messages to write to the server socket and events
//! for the application (rendering, audio). It never performs I/O itself.

use crate::interpolator::SnapshotInterpolator;
use crate::lifecycle::{LinkAction, LinkManager, MediaHandle, TransportEvent, TransportFactory};
use plaza_shared::config::WorldConfig;
use plaza_shared::pose::Pose;
use plaza_shared::protocol::{ClientMsg, MoveMsg, PeerWire, ServerMsg, PROTOCOL_VERSION};
use plaza_shared::PeerId;
use std::collections::BTreeMap;

/// The local pose is reported once every this many render frames.
pub const POSE_SEND_EVERY_N_FRAMES: u64 = 10;

#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Introduced { self_id: PeerId, state: WorldConfig },
    PeerJoined { id: PeerId, peer: PeerWire },
    PeerLeft { id: PeerId },
    PeerStreamAvailable { id: PeerId, media: MediaHandle },
    Data(serde_json::Value),
    ServerMessage(String),
}

pub struct ClientSession<F: TransportFactory> {
    self_id: Option<PeerId>,
    world: Option<WorldConfig>,
    /// Remote peers only
    peers: BTreeMap<PeerId, PeerWire>,
    links: LinkManager<F>,
    interpolator: SnapshotInterpolator,
    frame: u64,
    outgoing: Vec<ClientMsg>,
    events: Vec<ClientEvent>,
}

impl<F: TransportFactory> ClientSession<F> {
    pub fn new(factory: F) -> Self {
        Self::with_interpolator(factory, SnapshotInterpolator::default())
    }

    pub fn with_interpolator(factory: F, interpolator: SnapshotInterpolator) -> Self {
        Self {
            self_id: None,
            world: None,
            peers: BTreeMap::new(),
            links: LinkManager::new(factory),
            interpolator,
            frame: 0,
            outgoing: Vec::new(),
            events: Vec::new(),
        }
    }

    pub fn self_id(&self) -> Option<&PeerId> {
        self.self_id.as_ref()
    }

    pub fn world(&self) -> Option<&WorldConfig> {
        self.world.as_ref()
    }

    pub fn peers(&self) -> &BTreeMap<PeerId, PeerWire> {
        &self.peers
    }

    pub fn links(&self) -> &LinkManager<F> {
        &self.links
    }

    pub fn interpolator(&self) -> &SnapshotInterpolator {
        &self.interpolator
    }

    pub fn rendered(&self, id: &PeerId) -> Option<Pose> {
        self.interpolator.rendered(id)
    }

    pub fn handle_server_msg(&mut self, msg: ServerMsg) {
        match msg {
            ServerMsg::Introduction(intro) => {
                if intro.protocol_version != PROTOCOL_VERSION {
                    tracing::warn!(
                        "Server speaks protocol {}, we speak {}",
                        intro.protocol_version,
                        PROTOCOL_VERSION
                    );
                }
                let self_id = intro.self_id;
                tracing::info!(
                    "Joined as {} (server {}, {} peers)",
                    self_id,
                    intro.server_version,
                    intro.peers.len()
                );

                self.interpolator.clear();
                self.peers = intro.peers;
                self.peers.remove(&self_id);
                for (id, peer) in &self.peers {
                    self.interpolator
                        .insert(id.clone(), Pose::new(peer.position, peer.rotation, peer.is_shouting));
                }
                self.links
                    .introduce(self_id.clone(), self.peers.keys().cloned().collect::<Vec<_>>());

                self.self_id = Some(self_id.clone());
                self.world = Some(intro.state.clone());
                self.frame = 0;
                self.events.push(ClientEvent::Introduced {
                    self_id,
                    state: intro.state,
                });
            }
            ServerMsg::PeerConnection(msg) => {
                if self.self_id.as_ref() == Some(&msg.id) {
                    return;
                }
                if self.peers.contains_key(&msg.id) {
                    tracing::debug!("Duplicate join for {}", msg.id);
                    return;
                }
                let peer = msg.peer;
                self.interpolator.insert(
                    msg.id.clone(),
                    Pose::new(peer.position, peer.rotation, peer.is_shouting),
                );
                self.peers.insert(msg.id.clone(), peer.clone());
                self.links.peer_joined(msg.id.clone());
                self.events.push(ClientEvent::PeerJoined { id: msg.id, peer });
            }
            ServerMsg::PeerDisconnection { id } => {
                // A link may exist without a roster entry if an offer arrived first
                self.links.peer_left(&id);
                self.interpolator.remove(&id);
                if self.peers.remove(&id).is_some() {
                    self.events.push(ClientEvent::PeerLeft { id });
                } else {
                    tracing::debug!("Leave for unknown peer {}", id);
                }
            }
            ServerMsg::Positions(snapshot) => self.interpolator.apply_snapshot(&snapshot),
            ServerMsg::Signal(envelope) => self.links.inbound_signal(envelope),
            ServerMsg::Data { payload } => self.events.push(ClientEvent::Data(payload)),
            ServerMsg::ServerMessage { text } => self.events.push(ClientEvent::ServerMessage(text)),
        }
        self.pump_links();
    }

    pub fn transport_event(&mut self, remote: &PeerId, generation: u64, event: TransportEvent) {
        self.links.transport_event(remote, generation, event);
        self.pump_links();
    }

    /// Called once per render frame with the local avatar's pose.
    pub fn on_frame(&mut self, local: Option<Pose>) {
        self.interpolator.advance_frame();
        if self.self_id.is_none() {
            return;
        }
        self.frame += 1;
        if self.frame % POSE_SEND_EVERY_N_FRAMES != 0 {
            return;
        }
        if let Some(pose) = local {
            self.outgoing.push(ClientMsg::Move(MoveMsg {
                position: pose.position.to_array().to_vec(),
                rotation: pose.rotation.to_array().to_vec(),
                is_shouting: pose.is_shouting,
            }));
        }
    }

    pub fn send_data(&mut self, payload: serde_json::Value) {
        self.outgoing.push(ClientMsg::Data { payload });
    }

    /// The server socket dropped. Every peer link goes with it; the next
    /// introduction starts from scratch.
    pub fn disconnected(&mut self) {
        self.links.close_all();
        self.links.take_actions();
        self.interpolator.clear();
        self.peers.clear();
        self.self_id = None;
        self.frame = 0;
        self.outgoing.clear();
    }

    pub fn drain_outgoing(&mut self) -> Vec<ClientMsg> {
        std::mem::take(&mut self.outgoing)
    }

    pub fn drain_events(&mut self) -> Vec<ClientEvent> {
        std::mem::take(&mut self.events)
    }

    fn pump_links(&mut self) {
        for action in self.links.take_actions() {
            match action {
                LinkAction::SendSignal(envelope) => self.outgoing.push(ClientMsg::Signal(envelope)),
                LinkAction::StreamAvailable { id, media } => {
                    self.events.push(ClientEvent::PeerStreamAvailable { id, media })
                }
            }
        }
    }
}
