use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use ts_rs::TS;

use crate::config::WorldConfig;
use crate::PeerId;

/// Protocol version - increment when making breaking changes.
pub const PROTOCOL_VERSION: u32 = 1;

// === Server -> Client ===

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export, export_to = "../../web/generated/")]
#[serde(tag = "type")]
pub enum ServerMsg {
    #[serde(rename = "introduction")]
    Introduction(IntroductionMsg),
    #[serde(rename = "peerConnection")]
    PeerConnection(PeerConnectionMsg),
    #[serde(rename = "peerDisconnection")]
    PeerDisconnection { id: PeerId },
    #[serde(rename = "positions")]
    Positions(PositionsMsg),
    #[serde(rename = "signal")]
    Signal(SignalEnvelope),
    #[serde(rename = "data")]
    Data {
        #[ts(type = "unknown")]
        payload: serde_json::Value,
    },
    #[serde(rename = "serverMessage")]
    ServerMessage { text: String },
}

/// Sent once, right after connect.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export, export_to = "../../web/generated/")]
#[serde(rename_all = "camelCase")]
pub struct IntroductionMsg {
    pub protocol_version: u32,
    pub server_version: String,
    pub self_id: PeerId,
    /// Every registered peer at join time, the new peer included.
    pub peers: BTreeMap<PeerId, PeerWire>,
    pub state: WorldConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export, export_to = "../../web/generated/")]
pub struct PeerConnectionMsg {
    pub id: PeerId,
    pub peer: PeerWire,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, TS)]
#[ts(export, export_to = "../../web/generated/")]
pub struct PositionsMsg {
    pub positions: BTreeMap<PeerId, PoseWire>,
}

/// Full peer record as announced on join.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "../../web/generated/")]
#[serde(rename_all = "camelCase")]
pub struct PeerWire {
    pub name: String,
    pub position: [f64; 3],
    pub rotation: [f64; 4],
    #[serde(default)]
    pub is_shouting: bool,
}

/// Per-peer entry of a positions broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "../../web/generated/")]
#[serde(rename_all = "camelCase")]
pub struct PoseWire {
    pub position: [f64; 3],
    pub rotation: [f64; 4],
    #[serde(default)]
    pub is_shouting: bool,
}

/// Handshake data addressed to one peer. The server never looks inside
/// `payload`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "../../web/generated/")]
pub struct SignalEnvelope {
    pub to: PeerId,
    pub from: PeerId,
    #[ts(type = "unknown")]
    pub payload: serde_json::Value,
}

// === Client -> Server ===

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export, export_to = "../../web/generated/")]
#[serde(tag = "type")]
pub enum ClientMsg {
    #[serde(rename = "move")]
    Move(MoveMsg),
    #[serde(rename = "signal")]
    Signal(SignalEnvelope),
    #[serde(rename = "data")]
    Data {
        #[ts(type = "unknown")]
        payload: serde_json::Value,
    },
}

/// Local pose report. Arity is checked by the registry, not here, so a
/// short array still parses and is then ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "../../web/generated/")]
#[serde(rename_all = "camelCase")]
pub struct MoveMsg {
    pub position: Vec<f64>,
    pub rotation: Vec<f64>,
    #[serde(default)]
    pub is_shouting: bool,
}

// === Conversion helpers ===

/// Round to 4 decimal places (sub-millimetre, roughly halves positions JSON)
#[inline]
pub fn round4(v: f64) -> f64 {
    (v * 10000.0).round() / 10000.0
}

impl PoseWire {
    pub fn rounded(position: [f64; 3], rotation: [f64; 4], is_shouting: bool) -> Self {
        Self {
            position: position.map(round4),
            rotation: rotation.map(round4),
            is_shouting,
        }
    }
}
