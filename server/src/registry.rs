use plaza_shared::protocol::{PeerWire, PoseWire, PositionsMsg};
use plaza_shared::{PeerId, IDENTITY_ROTATION, SPAWN_POSITION};
use std::collections::{BTreeMap, HashMap};

/// A connected participant and its last accepted pose.
#[derive(Debug, Clone, PartialEq)]
pub struct Peer {
    pub id: PeerId,
    pub name: String,
    pub position: [f64; 3],
    pub rotation: [f64; 4],
    pub is_shouting: bool,
}

impl Peer {
    pub fn to_wire(&self) -> PeerWire {
        PeerWire {
            name: self.name.clone(),
            position: self.position,
            rotation: self.rotation,
            is_shouting: self.is_shouting,
        }
    }

    pub fn to_pose_wire(&self) -> PoseWire {
        PoseWire::rounded(self.position, self.rotation, self.is_shouting)
    }
}

/// Copy of every registered peer taken at one instant.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    pub peers: BTreeMap<PeerId, Peer>,
}

impl Snapshot {
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        self.peers.contains_key(id)
    }

    pub fn to_positions(&self) -> PositionsMsg {
        PositionsMsg {
            positions: self
                .peers
                .iter()
                .map(|(id, p)| (id.clone(), p.to_pose_wire()))
                .collect(),
        }
    }

    pub fn to_roster(&self) -> BTreeMap<PeerId, PeerWire> {
        self.peers
            .iter()
            .map(|(id, p)| (id.clone(), p.to_wire()))
            .collect()
    }
}

/// Authoritative id -> peer table.
///
/// Owned by the hub task; every read and write goes through that one task,
/// so a snapshot can never observe a half-applied update.
pub struct PeerRegistry {
    peers: HashMap<PeerId, Peer>,
    name_prefix: String,
    /// Display names are never reused within one process
    next_name_index: u64,
}

impl PeerRegistry {
    pub fn new(name_prefix: impl Into<String>) -> Self {
        Self {
            peers: HashMap::new(),
            name_prefix: name_prefix.into(),
            next_name_index: 1,
        }
    }

    /// Add a peer with the default spawn pose and the next display name.
    /// Registering an id twice is a benign race: the existing record is
    /// returned untouched.
    pub fn register(&mut self, id: PeerId) -> Peer {
        if let Some(existing) = self.peers.get(&id) {
            tracing::warn!("Peer {} registered twice, keeping existing record", id);
            return existing.clone();
        }

        let name = format!("{} {}", self.name_prefix, self.next_name_index);
        self.next_name_index += 1;

        let peer = Peer {
            id: id.clone(),
            name,
            position: SPAWN_POSITION,
            rotation: IDENTITY_ROTATION,
            is_shouting: false,
        };
        self.peers.insert(id, peer.clone());
        peer
    }

    /// Apply a pose reported by the peer's own session.
    ///
    /// Returns false, leaving the record untouched, when the id is unknown or
    /// when `position`/`rotation` are not 3/4 finite numbers.
    pub fn update(
        &mut self,
        id: &PeerId,
        position: &[f64],
        rotation: &[f64],
        is_shouting: bool,
    ) -> bool {
        let Some(peer) = self.peers.get_mut(id) else {
            return false;
        };
        let (Some(position), Some(rotation)) = (finite_array::<3>(position), finite_array::<4>(rotation))
        else {
            return false;
        };

        peer.position = position;
        peer.rotation = rotation;
        peer.is_shouting = is_shouting;
        true
    }

    /// Remove a peer. Unknown ids are ignored.
    pub fn unregister(&mut self, id: &PeerId) -> Option<Peer> {
        self.peers.remove(id)
    }

    /// Move every peer to `position`, keeping orientation.
    pub fn teleport_all(&mut self, position: [f64; 3]) -> usize {
        if position.iter().any(|v| !v.is_finite()) {
            return 0;
        }
        for peer in self.peers.values_mut() {
            peer.position = position;
        }
        self.peers.len()
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            peers: self
                .peers
                .iter()
                .map(|(id, p)| (id.clone(), p.clone()))
                .collect(),
        }
    }

    pub fn get(&self, id: &PeerId) -> Option<&Peer> {
        self.peers.get(id)
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        self.peers.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

fn finite_array<const N: usize>(values: &[f64]) -> Option<[f64; N]> {
    let arr: [f64; N] = values.try_into().ok()?;
    arr.iter().all(|v| v.is_finite()).then_some(arr)
}
