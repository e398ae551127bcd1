//! Peer connectivity: signaling handshake, discovery, and per-peer data
//! channels.
//!
//! Control plane: signaling socket → peer registry → per-peer connections.
//! Data plane: delivery buffer → open reader channels.

mod auth;
mod peer;
mod signaling;
mod types;


pub use signaling::Manager;
pub use types::{
    IceCandidateJson, ManagerOptions, PeerInfo, SessionSdp, SignalMessage, DATA_CHANNEL_LABEL,
    MAX_RECONNECT_ATTEMPTS,
};
