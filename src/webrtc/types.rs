//! Signaling wire catalog and manager configuration.
//!
//! Messages are JSON objects with a `type` discriminator, exchanged as
//! WebSocket text frames. The shapes here must stay compatible with the
//! signaling server and the browser reader.

use crate::delivery::RETENTION_WINDOW;
use crate::uri::Role;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

/// Label for the per-peer log channel. Channels are ordered; submission
/// order is delivery order for any single reader.
pub const DATA_CHANNEL_LABEL: &str = "logs";

/// Ceiling for the reconnection-attempt counter.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Settle delay before electing against a freshly joined peer.
pub(crate) const JOIN_SETTLE_DELAY: Duration = Duration::from_secs(1);

/// Cadence of the fallback sweep for dead peer connections.
pub(crate) const STALE_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// A peer as announced by the signaling server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    #[serde(rename = "peerId")]
    pub peer_id: String,
    pub role: Role,
}

/// SDP description as carried in offer/answer messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSdp {
    #[serde(rename = "type")]
    pub kind: String,
    pub sdp: String,
}

/// ICE candidate as carried in signaling messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IceCandidateJson {
    pub candidate: String,
    #[serde(rename = "sdpMLineIndex", skip_serializing_if = "Option::is_none", default)]
    pub sdp_mline_index: Option<u16>,
    #[serde(rename = "sdpMid", skip_serializing_if = "Option::is_none", default)]
    pub sdp_mid: Option<String>,
}

/// Union of every message crossing the signaling socket.
///
/// Outbound relay messages carry `targetPeerId`; the server rewrites them to
/// `fromPeerId` on the way to the target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalMessage {
    AuthChallenge {
        nonce: String,
        timestamp: i64,
    },
    Auth {
        role: Role,
        proof: String,
        #[serde(
            rename = "defaultFields",
            skip_serializing_if = "Option::is_none",
            default
        )]
        default_fields: Option<Map<String, Value>>,
    },
    AuthSuccess {
        #[serde(rename = "peerId")]
        peer_id: String,
    },
    Error {
        message: String,
    },
    PeerDiscovery,
    PeerList {
        peers: Vec<PeerInfo>,
    },
    PeerJoined {
        #[serde(rename = "peerId")]
        peer_id: String,
        role: Role,
    },
    PeerDisconnected {
        #[serde(rename = "peerId")]
        peer_id: String,
    },
    WebrtcOffer {
        #[serde(
            rename = "targetPeerId",
            skip_serializing_if = "Option::is_none",
            default
        )]
        target_peer_id: Option<String>,
        #[serde(
            rename = "fromPeerId",
            skip_serializing_if = "Option::is_none",
            default
        )]
        from_peer_id: Option<String>,
        offer: SessionSdp,
    },
    WebrtcAnswer {
        #[serde(
            rename = "targetPeerId",
            skip_serializing_if = "Option::is_none",
            default
        )]
        target_peer_id: Option<String>,
        #[serde(
            rename = "fromPeerId",
            skip_serializing_if = "Option::is_none",
            default
        )]
        from_peer_id: Option<String>,
        answer: SessionSdp,
    },
    WebrtcIceCandidate {
        #[serde(
            rename = "targetPeerId",
            skip_serializing_if = "Option::is_none",
            default
        )]
        target_peer_id: Option<String>,
        #[serde(
            rename = "fromPeerId",
            skip_serializing_if = "Option::is_none",
            default
        )]
        from_peer_id: Option<String>,
        candidate: IceCandidateJson,
    },
}

impl SignalMessage {
    pub fn msg_type(&self) -> &'static str {
        match self {
            SignalMessage::AuthChallenge { .. } => "auth_challenge",
            SignalMessage::Auth { .. } => "auth",
            SignalMessage::AuthSuccess { .. } => "auth_success",
            SignalMessage::Error { .. } => "error",
            SignalMessage::PeerDiscovery => "peer_discovery",
            SignalMessage::PeerList { .. } => "peer_list",
            SignalMessage::PeerJoined { .. } => "peer_joined",
            SignalMessage::PeerDisconnected { .. } => "peer_disconnected",
            SignalMessage::WebrtcOffer { .. } => "webrtc_offer",
            SignalMessage::WebrtcAnswer { .. } => "webrtc_answer",
            SignalMessage::WebrtcIceCandidate { .. } => "webrtc_ice_candidate",
        }
    }
}

/// Tunables for a [`super::Manager`].
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// STUN servers used for candidate gathering. No TURN fallback.
    pub stun_servers: Vec<String>,
    /// Replay window for late-joining readers.
    pub retention: Duration,
    /// Extra fields attached to the `auth` message for the whole session.
    pub default_fields: Option<Map<String, Value>>,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            stun_servers: default_stun_servers(),
            retention: RETENTION_WINDOW,
            default_fields: None,
        }
    }
}

pub(crate) fn default_stun_servers() -> Vec<String> {
    vec![
        "stun:stun.l.google.com:19302".to_string(),
        "stun:stun.cloudflare.com:3478".to_string(),
    ]
}

/// Shortened peer id for log lines.
pub(crate) fn short_peer(id: &str) -> &str {
    &id[..8.min(id.len())]
}
