//! Appender-side log forwarding over authenticated peer-to-peer data
//! channels.
//!
//! An appender parses a connection string, authenticates against the
//! signaling service with an HMAC challenge proof, discovers reader peers,
//! and streams normalized log entries to them over ordered data channels.
//! Entries emitted before any reader is connected are retained for a bounded
//! window and replayed when a channel opens.

pub mod config;
pub mod delivery;
pub mod intercept;
pub mod observer;
pub mod uri;
pub mod webrtc;

pub use config::Config;
pub use delivery::{LogEntry, Severity, RETENTION_WINDOW};
pub use intercept::{parse_line, Tee};
pub use observer::Subscription;
pub use uri::{parse_connection_string, ConnectionInfo, ParseError, Role};
pub use webrtc::{Manager, ManagerOptions, PeerInfo, SignalMessage};
