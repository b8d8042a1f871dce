//! Per-remote-peer connection lifecycle.
//!
//! One [`PeerLink`] exists per remote id. Its role is fixed when it is
//! created: remotes present in the join-time roster are dialled
//! (`Initiator`), remotes learned later wait for an offer (`NonInitiator`).
//! The media stack itself sits behind [`PeerTransport`]; everything here is
//! synchronous and driven by the client's event loop.

use crate::handshake::HandshakeSignal;
use plaza_shared::protocol::SignalEnvelope;
use plaza_shared::PeerId;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Idle,
    Negotiating,
    Connected,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    NonInitiator,
}

/// Opaque reference to an inbound media stream, owned by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MediaHandle(pub String);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    #[error("connection lost: {0}")]
    ConnectionLost(String),
}

/// Asynchronous notifications from a transport. The transport reports them
/// together with the generation it was created with.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Handshake output produced later, e.g. a trickled ICE candidate
    LocalSignal(HandshakeSignal),
    /// The peer-to-peer channel is usable
    ChannelOpen,
    Stream(MediaHandle),
    Failed(TransportError),
    Closed,
}

/// The media stack for one remote peer.
pub trait PeerTransport {
    /// Begin negotiating. An initiator returns its offer here.
    fn start(&mut self, role: Role) -> Result<Vec<HandshakeSignal>, TransportError>;

    /// Feed one remote handshake message, returning any immediate replies.
    fn apply_remote(&mut self, signal: HandshakeSignal)
        -> Result<Vec<HandshakeSignal>, TransportError>;

    /// Release everything and drop pending callbacks. Called exactly once.
    fn close(&mut self);
}

pub trait TransportFactory {
    type Transport: PeerTransport;

    fn create(&mut self, remote: &PeerId, role: Role, generation: u64) -> Self::Transport;
}

/// Work produced for the rest of the client.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkAction {
    /// Hand to the signal relay
    SendSignal(SignalEnvelope),
    StreamAvailable { id: PeerId, media: MediaHandle },
}

struct PeerLink<T: PeerTransport> {
    role: Role,
    state: LinkState,
    generation: u64,
    transport: Option<T>,
    /// Stream announced before the channel opened
    pending_stream: Option<MediaHandle>,
}

impl<T: PeerTransport> PeerLink<T> {
    fn close(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.close();
        }
        self.pending_stream = None;
        self.state = LinkState::Closed;
    }
}

impl<T: PeerTransport> Drop for PeerLink<T> {
    fn drop(&mut self) {
        self.close();
    }
}

pub struct LinkManager<F: TransportFactory> {
    self_id: Option<PeerId>,
    factory: F,
    links: HashMap<PeerId, PeerLink<F::Transport>>,
    /// Remotes the server announced as gone. Signals they sent before
    /// leaving may still be in flight and must not reopen a link.
    departed: HashSet<PeerId>,
    next_generation: u64,
    actions: Vec<LinkAction>,
}

impl<F: TransportFactory> LinkManager<F> {
    pub fn new(factory: F) -> Self {
        Self {
            self_id: None,
            factory,
            links: HashMap::new(),
            departed: HashSet::new(),
            next_generation: 1,
            actions: Vec::new(),
        }
    }

    pub fn self_id(&self) -> Option<&PeerId> {
        self.self_id.as_ref()
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    pub fn state(&self, id: &PeerId) -> Option<LinkState> {
        self.links.get(id).map(|l| l.state)
    }

    pub fn role(&self, id: &PeerId) -> Option<Role> {
        self.links.get(id).map(|l| l.role)
    }

    pub fn generation(&self, id: &PeerId) -> Option<u64> {
        self.links.get(id).map(|l| l.generation)
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn take_actions(&mut self) -> Vec<LinkAction> {
        std::mem::take(&mut self.actions)
    }

    /// Apply the roster received at join time. Any links from a previous
    /// session are closed first; every listed remote is dialled.
    pub fn introduce(&mut self, self_id: PeerId, roster: impl IntoIterator<Item = PeerId>) {
        self.close_all();
        self.departed.clear();
        self.self_id = Some(self_id.clone());
        for id in roster {
            if id == self_id || self.links.contains_key(&id) {
                continue;
            }
            self.open(id, Role::Initiator);
        }
    }

    /// A remote joined after us. It will dial; we wait for its offer.
    pub fn peer_joined(&mut self, id: PeerId) {
        if self.self_id.is_none() || self.self_id.as_ref() == Some(&id) {
            return;
        }
        self.departed.remove(&id);
        // Its offer may have beaten the notification here
        if self.links.contains_key(&id) {
            return;
        }
        self.open(id, Role::NonInitiator);
    }

    pub fn peer_left(&mut self, id: &PeerId) {
        self.departed.insert(id.clone());
        if self.remove_link(id) {
            tracing::debug!("Closed link to {} (peer left)", id);
        }
    }

    pub fn close_all(&mut self) {
        for (_, mut link) in self.links.drain() {
            link.close();
        }
    }

    /// Dispatch a relayed envelope, creating a NonInitiator link if the
    /// sender is not known yet.
    pub fn inbound_signal(&mut self, envelope: SignalEnvelope) {
        let Some(self_id) = self.self_id.clone() else {
            tracing::debug!("Signal before introduction, ignored");
            return;
        };
        if envelope.to != self_id {
            tracing::warn!("Signal addressed to {}, not us", envelope.to);
            return;
        }
        let remote = envelope.from;
        if remote == self_id {
            return;
        }
        if self.departed.contains(&remote) {
            tracing::debug!("Signal from departed peer {} ignored", remote);
            return;
        }

        let signal = match HandshakeSignal::decode(&envelope.payload) {
            Ok(signal) => signal,
            Err(e) => {
                tracing::debug!("Ignoring signal from {}: {}", remote, e);
                return;
            }
        };

        if signal.is_offer() && self.is_dialling(&remote) {
            // Both sides dialled. The lower id keeps its offer.
            if self_id < remote {
                tracing::debug!("Offer glare with {}, keeping ours", remote);
                return;
            }
            tracing::debug!("Offer glare with {}, yielding", remote);
            self.remove_link(&remote);
        }

        if !self.links.contains_key(&remote) {
            self.open(remote.clone(), Role::NonInitiator);
        }

        let result = match self
            .links
            .get_mut(&remote)
            .and_then(|link| link.transport.as_mut())
        {
            Some(transport) => transport.apply_remote(signal),
            None => return,
        };
        self.after_transport_call(&remote, result);
    }

    /// Route a transport notification. Events from a transport that has
    /// since been closed or replaced are ignored.
    pub fn transport_event(&mut self, remote: &PeerId, generation: u64, event: TransportEvent) {
        if self.generation(remote) != Some(generation) {
            tracing::debug!("Stale transport event for {} ignored", remote);
            return;
        }

        match event {
            TransportEvent::LocalSignal(signal) => self.emit_signal(remote, &signal),
            TransportEvent::ChannelOpen => {
                let Some(link) = self.links.get_mut(remote) else {
                    return;
                };
                if link.state != LinkState::Negotiating {
                    return;
                }
                link.state = LinkState::Connected;
                tracing::info!("Peer connection to {} established", remote);
                if let Some(media) = link.pending_stream.take() {
                    self.actions.push(LinkAction::StreamAvailable {
                        id: remote.clone(),
                        media,
                    });
                }
            }
            TransportEvent::Stream(media) => {
                let Some(link) = self.links.get_mut(remote) else {
                    return;
                };
                match link.state {
                    LinkState::Connected => self.actions.push(LinkAction::StreamAvailable {
                        id: remote.clone(),
                        media,
                    }),
                    LinkState::Negotiating => link.pending_stream = Some(media),
                    LinkState::Idle | LinkState::Closed => {}
                }
            }
            TransportEvent::Failed(e) => {
                tracing::warn!("Peer connection to {} failed: {}", remote, e);
                self.remove_link(remote);
            }
            TransportEvent::Closed => {
                tracing::debug!("Peer connection to {} closed", remote);
                self.remove_link(remote);
            }
        }
    }

    fn is_dialling(&self, remote: &PeerId) -> bool {
        self.links.get(remote).is_some_and(|l| {
            l.role == Role::Initiator && l.state == LinkState::Negotiating
        })
    }

    fn open(&mut self, remote: PeerId, role: Role) {
        let generation = self.next_generation;
        self.next_generation += 1;

        let transport = self.factory.create(&remote, role, generation);
        let mut link = PeerLink {
            role,
            state: LinkState::Idle,
            generation,
            transport: Some(transport),
            pending_stream: None,
        };
        let result = match link.transport.as_mut() {
            Some(transport) => transport.start(role),
            None => Ok(Vec::new()),
        };
        link.state = LinkState::Negotiating;
        tracing::debug!("Opened {:?} link to {} (gen {})", role, remote, generation);

        self.links.insert(remote.clone(), link);
        self.after_transport_call(&remote, result);
    }

    fn after_transport_call(
        &mut self,
        remote: &PeerId,
        result: Result<Vec<HandshakeSignal>, TransportError>,
    ) {
        match result {
            Ok(signals) => {
                for signal in &signals {
                    self.emit_signal(remote, signal);
                }
            }
            Err(e) => {
                tracing::warn!("Handshake with {} failed: {}", remote, e);
                self.remove_link(remote);
            }
        }
    }

    fn emit_signal(&mut self, remote: &PeerId, signal: &HandshakeSignal) {
        let Some(self_id) = self.self_id.clone() else {
            return;
        };
        match signal.encode() {
            Ok(payload) => self.actions.push(LinkAction::SendSignal(SignalEnvelope {
                to: remote.clone(),
                from: self_id,
                payload,
            })),
            Err(e) => tracing::warn!("Could not encode {} for {}: {}", signal.kind(), remote, e),
        }
    }

    fn remove_link(&mut self, remote: &PeerId) -> bool {
        match self.links.remove(remote) {
            Some(mut link) => {
                link.close();
                true
            }
            None => false,
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{Call, MockFactory};
    use super::*;
    use serde_json::json;

    fn id(s: &str) -> PeerId {
        PeerId::from(s)
    }

    fn manager(self_id: &str, roster: &[&str]) -> LinkManager<MockFactory> {
        let mut m = LinkManager::new(MockFactory::default());
        m.introduce(id(self_id), roster.iter().map(|s| id(s)));
        m
    }

    fn signals(actions: &[LinkAction]) -> Vec<SignalEnvelope> {
        actions
            .iter()
            .filter_map(|a| match a {
                LinkAction::SendSignal(env) => Some(env.clone()),
                _ => None,
            })
            .collect()
    }

    fn kinds(envs: &[SignalEnvelope]) -> Vec<String> {
        envs.iter()
            .map(|e| e.payload["type"].as_str().unwrap_or("").to_string())
            .collect()
    }

    fn offer_from(from: &str, to: &str) -> SignalEnvelope {
        SignalEnvelope {
            to: id(to),
            from: id(from),
            payload: json!({"type": "offer", "sdp": "remote-offer"}),
        }
    }

    #[test]
    fn roster_entries_become_initiators_and_offer() {
        let mut m = manager("b", &["a", "b"]);
        assert_eq!(m.len(), 1);
        assert_eq!(m.role(&id("a")), Some(Role::Initiator));
        assert_eq!(m.state(&id("a")), Some(LinkState::Negotiating));

        let out = signals(&m.take_actions());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].to, id("a"));
        assert_eq!(out[0].from, id("b"));
        assert_eq!(kinds(&out), vec!["offer"]);
    }

    #[test]
    fn join_notification_creates_waiting_non_initiator() {
        let mut m = manager("a", &["a"]);
        m.peer_joined(id("b"));
        assert_eq!(m.role(&id("b")), Some(Role::NonInitiator));
        assert_eq!(m.state(&id("b")), Some(LinkState::Negotiating));
        assert!(m.take_actions().is_empty());
    }

    #[test]
    fn own_join_and_duplicate_join_are_ignored() {
        let mut m = manager("a", &["a"]);
        m.peer_joined(id("a"));
        m.peer_joined(id("b"));
        let generation = m.generation(&id("b"));
        m.peer_joined(id("b"));
        assert_eq!(m.len(), 1);
        assert_eq!(m.generation(&id("b")), generation);
    }

    #[test]
    fn pair_handshake_produces_exactly_one_offer() {
        // a joined first; b finds a in its roster, a hears of b via notification
        let mut a = manager("a", &["a"]);
        let mut b = manager("b", &["a", "b"]);
        a.peer_joined(id("b"));

        assert_eq!(b.role(&id("a")), Some(Role::Initiator));
        assert_eq!(a.role(&id("b")), Some(Role::NonInitiator));

        let mut all = Vec::new();
        for _ in 0..4 {
            let from_b = signals(&b.take_actions());
            let from_a = signals(&a.take_actions());
            all.extend(from_b.iter().cloned());
            all.extend(from_a.iter().cloned());
            for env in from_b {
                a.inbound_signal(env);
            }
            for env in from_a {
                b.inbound_signal(env);
            }
        }

        assert_eq!(kinds(&all), vec!["offer", "answer"]);
        assert_eq!(all.iter().filter(|e| e.payload["type"] == "offer").count(), 1);
        assert_eq!(a.role(&id("b")), Some(Role::NonInitiator));
        assert_eq!(b.role(&id("a")), Some(Role::Initiator));
    }

    #[test]
    fn signal_before_join_notification_creates_single_instance() {
        let mut m = manager("a", &["a"]);
        m.inbound_signal(offer_from("b", "a"));
        assert_eq!(m.role(&id("b")), Some(Role::NonInitiator));
        let generation = m.generation(&id("b"));

        m.peer_joined(id("b"));
        assert_eq!(m.len(), 1);
        assert_eq!(m.generation(&id("b")), generation);

        let out = signals(&m.take_actions());
        assert_eq!(kinds(&out), vec!["answer"]);
        assert_eq!(out[0].to, id("b"));
    }

    #[test]
    fn channel_open_connects_and_exposes_pending_stream() {
        let mut m = manager("b", &["a"]);
        m.take_actions();
        let generation = m.generation(&id("a")).unwrap();

        m.transport_event(&id("a"), generation, TransportEvent::Stream(MediaHandle("s1".into())));
        assert!(m.take_actions().is_empty());

        m.transport_event(&id("a"), generation, TransportEvent::ChannelOpen);
        assert_eq!(m.state(&id("a")), Some(LinkState::Connected));
        assert_eq!(
            m.take_actions(),
            vec![LinkAction::StreamAvailable {
                id: id("a"),
                media: MediaHandle("s1".into())
            }]
        );

        m.transport_event(&id("a"), generation, TransportEvent::Stream(MediaHandle("s2".into())));
        assert_eq!(m.take_actions().len(), 1);
    }

    #[test]
    fn trickled_candidates_are_wrapped_for_the_relay() {
        let mut m = manager("b", &["a"]);
        m.take_actions();
        let generation = m.generation(&id("a")).unwrap();
        m.transport_event(
            &id("a"),
            generation,
            TransportEvent::LocalSignal(HandshakeSignal::Candidate {
                candidate: crate::handshake::IceCandidate {
                    candidate: "candidate:1".into(),
                    sdp_mid: Some("0".into()),
                    sdp_m_line_index: Some(0),
                },
            }),
        );
        let out = signals(&m.take_actions());
        assert_eq!(kinds(&out), vec!["candidate"]);
        assert_eq!(out[0].from, id("b"));
    }

    #[test]
    fn peer_left_closes_once_and_reappearance_is_fresh() {
        let mut m = manager("a", &["a"]);
        m.peer_joined(id("b"));
        let first = m.generation(&id("b")).unwrap();

        m.peer_left(&id("b"));
        m.peer_left(&id("b"));
        assert_eq!(m.state(&id("b")), None);
        assert_eq!(m.factory().closes(&id("b")), 1);

        // Late callback from the closed instance
        m.transport_event(&id("b"), first, TransportEvent::ChannelOpen);
        assert!(m.take_actions().is_empty());

        m.peer_joined(id("b"));
        let second = m.generation(&id("b")).unwrap();
        assert_ne!(first, second);
        m.transport_event(&id("b"), first, TransportEvent::ChannelOpen);
        assert_eq!(m.state(&id("b")), Some(LinkState::Negotiating));
    }

    #[test]
    fn transport_failure_closes_link() {
        let mut m = manager("b", &["a"]);
        let generation = m.generation(&id("a")).unwrap();
        m.transport_event(&id("a"), generation, TransportEvent::ChannelOpen);
        m.transport_event(
            &id("a"),
            generation,
            TransportEvent::Failed(TransportError::ConnectionLost("ice".into())),
        );
        assert_eq!(m.state(&id("a")), None);
        assert_eq!(m.factory().closes(&id("a")), 1);
    }

    #[test]
    fn remote_close_ends_connected_link() {
        let mut m = manager("b", &["a"]);
        m.take_actions();
        let generation = m.generation(&id("a")).unwrap();
        m.transport_event(&id("a"), generation, TransportEvent::ChannelOpen);
        assert_eq!(m.state(&id("a")), Some(LinkState::Connected));

        m.transport_event(&id("a"), generation, TransportEvent::Closed);
        assert_eq!(m.state(&id("a")), None);
        assert!(m.is_empty());
        assert_eq!(m.factory().closes(&id("a")), 1);

        // A second close from the same transport is stale
        m.transport_event(&id("a"), generation, TransportEvent::Closed);
        assert_eq!(m.factory().closes(&id("a")), 1);
        assert!(m.take_actions().is_empty());
    }

    #[test]
    fn signal_in_flight_from_departed_peer_is_ignored() {
        let mut m = manager("a", &["x"]);
        m.take_actions();
        m.peer_left(&id("x"));

        m.inbound_signal(offer_from("x", "a"));
        assert!(m.is_empty());
        assert!(m.take_actions().is_empty());

        // Leave notification can also arrive for a peer we never linked
        m.peer_left(&id("y"));
        m.inbound_signal(offer_from("y", "a"));
        assert!(m.is_empty());
    }

    #[test]
    fn rejoin_after_leave_accepts_signals_again() {
        let mut m = manager("a", &["a"]);
        m.peer_left(&id("x"));
        m.peer_joined(id("x"));
        m.inbound_signal(offer_from("x", "a"));
        assert_eq!(m.role(&id("x")), Some(Role::NonInitiator));
        assert_eq!(kinds(&signals(&m.take_actions())), vec!["answer"]);
    }

    #[test]
    fn reintroduction_forgets_departed_peers() {
        let mut m = manager("a", &["x"]);
        m.peer_left(&id("x"));
        m.introduce(id("a2"), vec![id("a2")]);
        m.inbound_signal(offer_from("x", "a2"));
        assert_eq!(m.role(&id("x")), Some(Role::NonInitiator));
    }

    #[test]
    fn failed_start_leaves_no_instance() {
        let factory = MockFactory {
            fail_start: true,
            ..Default::default()
        };
        let mut m = LinkManager::new(factory);
        m.introduce(id("b"), vec![id("a")]);
        assert!(m.is_empty());
        assert!(m.take_actions().is_empty());
        assert_eq!(m.factory().closes(&id("a")), 1);
    }

    #[test]
    fn glare_is_resolved_by_lower_id() {
        // Both dialled each other
        let mut low = manager("a", &["b"]);
        let mut high = manager("b", &["a"]);
        let low_offer = signals(&low.take_actions()).remove(0);
        let high_offer = signals(&high.take_actions()).remove(0);

        low.inbound_signal(high_offer);
        assert_eq!(low.role(&id("b")), Some(Role::Initiator));
        assert!(low.take_actions().is_empty());

        high.inbound_signal(low_offer);
        assert_eq!(high.role(&id("a")), Some(Role::NonInitiator));
        assert_eq!(kinds(&signals(&high.take_actions())), vec!["answer"]);
        assert_eq!(high.factory().closes(&id("a")), 1);
    }

    #[test]
    fn malformed_or_misaddressed_signals_are_ignored() {
        let mut m = manager("a", &["a"]);
        m.inbound_signal(SignalEnvelope {
            to: id("a"),
            from: id("b"),
            payload: json!({"type": "renegotiate"}),
        });
        m.inbound_signal(offer_from("b", "someone-else"));
        assert!(m.is_empty());
        assert!(m.take_actions().is_empty());
    }

    #[test]
    fn signals_before_introduction_are_ignored() {
        let mut m = LinkManager::new(MockFactory::default());
        m.inbound_signal(offer_from("b", "a"));
        m.peer_joined(id("b"));
        assert!(m.is_empty());
    }

    #[test]
    fn reintroduction_closes_previous_links() {
        let mut m = manager("a", &["x", "y"]);
        m.introduce(id("a2"), vec![id("z")]);
        assert_eq!(m.factory().closes(&id("x")), 1);
        assert_eq!(m.factory().closes(&id("y")), 1);
        assert_eq!(m.len(), 1);
        assert_eq!(m.self_id(), Some(&id("a2")));
    }

    #[test]
    fn dropping_manager_releases_transports() {
        let factory = MockFactory::default();
        let calls = factory.calls.clone();
        {
            let mut m = LinkManager::new(factory);
            m.introduce(id("a"), vec![id("b"), id("c")]);
        }
        let closes = calls
            .borrow()
            .iter()
            .filter(|c| matches!(c, Call::Close(..)))
            .count();
        assert_eq!(closes, 2);
    }
}
