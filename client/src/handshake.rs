//! Decoding of the opaque signal payload into handshake messages.
//!
//! The relay treats payloads as blobs; only the lifecycle layer looks inside.
//! The JSON shape follows the browser's `RTCSessionDescriptionInit` /
//! `RTCIceCandidateInit`.

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("signal payload is not a handshake message: {0}")]
    Malformed(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default)]
    pub sdp_m_line_index: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum HandshakeSignal {
    Offer { sdp: String },
    Answer { sdp: String },
    Candidate { candidate: IceCandidate },
}

impl HandshakeSignal {
    pub fn decode(payload: &serde_json::Value) -> Result<Self, HandshakeError> {
        Ok(Self::deserialize(payload)?)
    }

    pub fn encode(&self) -> Result<serde_json::Value, HandshakeError> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn is_offer(&self) -> bool {
        matches!(self, HandshakeSignal::Offer { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            HandshakeSignal::Offer { .. } => "offer",
            HandshakeSignal::Answer { .. } => "answer",
            HandshakeSignal::Candidate { .. } => "candidate",
        }
    }
}
