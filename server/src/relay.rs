use crate::registry::PeerRegistry;
use plaza_shared::protocol::SignalEnvelope;
use plaza_shared::PeerId;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// What happened to one relayed envelope. Never reported back to the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    Delivered,
    /// Destination is not registered (left mid-handshake, or never existed)
    UnknownDestination,
    /// Destination session is not draining its queue, or is shutting down
    Dropped,
}

/// Forwards handshake envelopes to exactly one session. The payload is
/// passed through untouched; nothing is buffered for absent peers.
#[derive(Default)]
pub struct SignalRelay {
    routes: HashMap<PeerId, mpsc::Sender<SignalEnvelope>>,
}

impl SignalRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&mut self, id: PeerId, tx: mpsc::Sender<SignalEnvelope>) {
        self.routes.insert(id, tx);
    }

    pub fn detach(&mut self, id: &PeerId) {
        self.routes.remove(id);
    }

    pub fn relay(&self, registry: &PeerRegistry, envelope: SignalEnvelope) -> RelayOutcome {
        if !registry.contains(&envelope.to) {
            tracing::warn!(
                "Signal from {} to unknown peer {}, dropped",
                envelope.from,
                envelope.to
            );
            return RelayOutcome::UnknownDestination;
        }
        let Some(route) = self.routes.get(&envelope.to) else {
            tracing::warn!("Peer {} has no signal route, dropped", envelope.to);
            return RelayOutcome::UnknownDestination;
        };

        let to = envelope.to.clone();
        match route.try_send(envelope) {
            Ok(()) => {
                tracing::debug!("Relayed signal to {}", to);
                RelayOutcome::Delivered
            }
            Err(TrySendError::Full(_)) => {
                tracing::warn!("Signal queue for {} full, dropped", to);
                RelayOutcome::Dropped
            }
            Err(TrySendError::Closed(_)) => RelayOutcome::Dropped,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(to: &str, from: &str) -> SignalEnvelope {
        SignalEnvelope {
            to: PeerId::from(to),
            from: PeerId::from(from),
            payload: json!({"type": "offer", "sdp": "v=0"}),
        }
    }

    #[test]
    fn delivers_payload_unchanged_to_destination_only() {
        let mut registry = PeerRegistry::new("User");
        registry.register(PeerId::from("a"));
        registry.register(PeerId::from("b"));

        let mut relay = SignalRelay::new();
        let (a_tx, mut a_rx) = mpsc::channel(4);
        let (b_tx, mut b_rx) = mpsc::channel(4);
        relay.attach(PeerId::from("a"), a_tx);
        relay.attach(PeerId::from("b"), b_tx);

        let env = envelope("b", "a");
        assert_eq!(relay.relay(&registry, env.clone()), RelayOutcome::Delivered);
        assert_eq!(b_rx.try_recv().unwrap(), env);
        assert!(a_rx.try_recv().is_err());
    }

    #[test]
    fn unknown_destination_produces_nothing() {
        let mut registry = PeerRegistry::new("User");
        registry.register(PeerId::from("a"));
        let mut relay = SignalRelay::new();
        let (a_tx, mut a_rx) = mpsc::channel(4);
        relay.attach(PeerId::from("a"), a_tx);

        assert_eq!(
            relay.relay(&registry, envelope("ghost", "a")),
            RelayOutcome::UnknownDestination
        );
        assert!(a_rx.try_recv().is_err());
    }

    #[test]
    fn unregistered_but_still_routed_peer_is_dropped() {
        let mut registry = PeerRegistry::new("User");
        registry.register(PeerId::from("b"));
        let mut relay = SignalRelay::new();
        let (b_tx, mut b_rx) = mpsc::channel(4);
        relay.attach(PeerId::from("b"), b_tx);
        registry.unregister(&PeerId::from("b"));

        assert_eq!(
            relay.relay(&registry, envelope("b", "a")),
            RelayOutcome::UnknownDestination
        );
        assert!(b_rx.try_recv().is_err());
    }

    #[test]
    fn full_queue_drops_without_blocking() {
        let mut registry = PeerRegistry::new("User");
        registry.register(PeerId::from("b"));
        let mut relay = SignalRelay::new();
        let (b_tx, _b_rx) = mpsc::channel(1);
        relay.attach(PeerId::from("b"), b_tx);

        assert_eq!(relay.relay(&registry, envelope("b", "a")), RelayOutcome::Delivered);
        assert_eq!(relay.relay(&registry, envelope("b", "a")), RelayOutcome::Dropped);
    }

    #[test]
    fn detached_route_is_dropped() {
        let mut registry = PeerRegistry::new("User");
        registry.register(PeerId::from("b"));
        let mut relay = SignalRelay::new();
        let (b_tx, _b_rx) = mpsc::channel(1);
        relay.attach(PeerId::from("b"), b_tx);
        relay.detach(&PeerId::from("b"));

        assert_eq!(
            relay.relay(&registry, envelope("b", "a")),
            RelayOutcome::UnknownDestination
        );
    }
}
