//! Per-peer connection and data-channel lifecycle.
//!
//! A [`PeerLink`] owns exactly one `RTCPeerConnection` and at most one data
//! channel. Links never talk to each other; everything they observe is
//! reported back to the manager loop as a [`PeerEvent`].

use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use super::types::{
    short_peer, IceCandidateJson, SessionSdp, SignalMessage, DATA_CHANNEL_LABEL,
};
use crate::uri::Role;

/// Events raised by link callbacks and manager timers, all funneled into the
/// manager loop so state mutation stays single-threaded.
#[derive(Debug)]
pub(crate) enum PeerEvent {
    /// A usable path to the peer exists (channel open or connection up).
    Open { peer_id: String },
    /// The channel or connection went away.
    Closed { peer_id: String },
    /// A text frame arrived on the data channel.
    Message { peer_id: String, text: String },
    /// A settle delay elapsed; run initiator election for this peer.
    Elect { peer_id: String },
}

pub(crate) struct PeerLink {
    pub(crate) peer_id: String,
    /// Remote role. Guessed as reader when an offer arrives from a peer the
    /// registry does not know yet; corrected on the next registry update.
    role: RwLock<Role>,
    pc: Arc<RTCPeerConnection>,
    data_channel: Mutex<Option<Arc<RTCDataChannel>>>,
    /// Remote candidates that arrived before the remote description.
    pending_candidates: Mutex<Vec<RTCIceCandidateInit>>,
    outbound_tx: mpsc::UnboundedSender<String>,
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    writer_started: AtomicBool,
    connected: AtomicBool,
    signal_tx: mpsc::UnboundedSender<SignalMessage>,
    event_tx: mpsc::UnboundedSender<PeerEvent>,
}

impl PeerLink {
    pub(crate) async fn new(
        peer_id: String,
        role: Role,
        stun_servers: &[String],
        signal_tx: mpsc::UnboundedSender<SignalMessage>,
        event_tx: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<Self>> {
        let mut media = MediaEngine::default();
        media.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media)?;

        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers: Vec<RTCIceServer> = stun_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .collect();

        let config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let pc = Arc::new(api.new_peer_connection(config).await?);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        let link = Arc::new(Self {
            peer_id,
            role: RwLock::new(role),
            pc,
            data_channel: Mutex::new(None),
            pending_candidates: Mutex::new(Vec::new()),
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            writer_started: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            signal_tx,
            event_tx,
        });

        Self::install_handlers(&link);
        Ok(link)
    }

    fn install_handlers(link: &Arc<Self>) {
        // Forward local ICE candidates through signaling.
        let target = link.peer_id.clone();
        let signal_tx = link.signal_tx.clone();
        link.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let target = target.clone();
                let signal_tx = signal_tx.clone();
                Box::pin(async move {
                    let Some(candidate) = candidate else { return };
                    match candidate.to_json() {
                        Ok(init) => {
                            let _ = signal_tx.send(SignalMessage::WebrtcIceCandidate {
                                target_peer_id: Some(target),
                                from_peer_id: None,
                                candidate: IceCandidateJson {
                                    candidate: init.candidate,
                                    sdp_mline_index: init.sdp_mline_index,
                                    sdp_mid: init.sdp_mid,
                                },
                            });
                        }
                        Err(e) => warn!("failed to encode local ICE candidate: {e}"),
                    }
                })
            }));

        let peer_id = link.peer_id.clone();
        let event_tx = link.event_tx.clone();
        link.pc
            .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                let peer_id = peer_id.clone();
                let event_tx = event_tx.clone();
                Box::pin(async move {
                    info!("peer {} connection state: {state}", short_peer(&peer_id));
                    match state {
                        RTCPeerConnectionState::Connected => {
                            let _ = event_tx.send(PeerEvent::Open { peer_id });
                        }
                        RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed => {
                            let _ = event_tx.send(PeerEvent::Closed { peer_id });
                        }
                        _ => {}
                    }
                })
            }));

        // Answerer side: the initiator creates the channel, we adopt it.
        let weak: Weak<Self> = Arc::downgrade(link);
        link.pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(link) = weak.upgrade() {
                    debug!(
                        "peer {} announced data channel '{}'",
                        short_peer(&link.peer_id),
                        dc.label()
                    );
                    link.adopt_channel(dc);
                }
            })
        }));
    }

    /// Wire up channel callbacks and remember the handle for sends.
    fn adopt_channel(&self, dc: Arc<RTCDataChannel>) {
        let peer_id = self.peer_id.clone();
        let event_tx = self.event_tx.clone();
        dc.on_open(Box::new(move || {
            let _ = event_tx.send(PeerEvent::Open {
                peer_id: peer_id.clone(),
            });
            Box::pin(async {})
        }));

        let peer_id = self.peer_id.clone();
        let event_tx = self.event_tx.clone();
        dc.on_close(Box::new(move || {
            let _ = event_tx.send(PeerEvent::Closed {
                peer_id: peer_id.clone(),
            });
            Box::pin(async {})
        }));

        let peer_id = self.peer_id.clone();
        let event_tx = self.event_tx.clone();
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            if msg.is_string {
                match String::from_utf8(msg.data.to_vec()) {
                    Ok(text) => {
                        let _ = event_tx.send(PeerEvent::Message {
                            peer_id: peer_id.clone(),
                            text,
                        });
                    }
                    Err(_) => debug!("peer {} sent non-UTF-8 text frame", short_peer(&peer_id)),
                }
            }
            Box::pin(async {})
        }));

        if let Ok(mut slot) = self.data_channel.lock() {
            *slot = Some(dc);
        }
    }

    /// Initiator path: create the channel, produce the local offer.
    pub(crate) async fn offer(&self) -> Result<SessionSdp> {
        let init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let dc = self
            .pc
            .create_data_channel(DATA_CHANNEL_LABEL, Some(init))
            .await?;
        self.adopt_channel(dc);

        let offer = self.pc.create_offer(None).await?;
        self.pc.set_local_description(offer.clone()).await?;
        Ok(SessionSdp {
            kind: offer.sdp_type.to_string(),
            sdp: offer.sdp,
        })
    }

    /// Answerer path: apply the remote offer, produce the local answer.
    pub(crate) async fn handle_offer(&self, offer: &SessionSdp) -> Result<SessionSdp> {
        let desc = RTCSessionDescription::offer(offer.sdp.clone())?;
        self.pc.set_remote_description(desc).await?;
        self.apply_pending_candidates().await;

        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer.clone()).await?;
        Ok(SessionSdp {
            kind: answer.sdp_type.to_string(),
            sdp: answer.sdp,
        })
    }

    pub(crate) async fn handle_answer(&self, answer: &SessionSdp) -> Result<()> {
        let desc = RTCSessionDescription::answer(answer.sdp.clone())?;
        self.pc.set_remote_description(desc).await?;
        self.apply_pending_candidates().await;
        Ok(())
    }

    /// Apply a remote candidate, or queue it until the remote description
    /// lands.
    pub(crate) async fn add_candidate(&self, candidate: IceCandidateJson) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: None,
        };

        if self.pc.remote_description().await.is_none() {
            if let Ok(mut pending) = self.pending_candidates.lock() {
                debug!(
                    "peer {}: queueing candidate until remote description",
                    short_peer(&self.peer_id)
                );
                pending.push(init);
            }
            return Ok(());
        }

        self.pc.add_ice_candidate(init).await?;
        Ok(())
    }

    async fn apply_pending_candidates(&self) {
        let drained: Vec<RTCIceCandidateInit> = match self.pending_candidates.lock() {
            Ok(mut pending) => pending.drain(..).collect(),
            Err(_) => return,
        };
        for init in drained {
            if let Err(e) = self.pc.add_ice_candidate(init).await {
                warn!(
                    "peer {}: queued candidate rejected: {e}",
                    short_peer(&self.peer_id)
                );
            }
        }
    }

    /// Queue one serialized entry for this channel. Sends are drained in
    /// order by the writer task, so per-reader ordering follows submission
    /// order.
    pub(crate) fn enqueue(&self, line: &str) {
        let _ = self.outbound_tx.send(line.to_string());
    }

    /// Start draining the outbound queue once the channel is actually open.
    /// The peer connection reports `connected` before the channel finishes
    /// opening; sends issued in that window would fail and be lost, so lines
    /// queued earlier (e.g. a replay enqueued on connection-up) wait here.
    pub(crate) fn start_writer(&self) {
        let Some(dc) = self.data_channel.lock().ok().and_then(|slot| slot.clone()) else {
            return;
        };
        if dc.ready_state() != RTCDataChannelState::Open {
            return;
        }
        if self.writer_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(mut rx) = self.outbound_rx.lock().ok().and_then(|mut slot| slot.take()) else {
            return;
        };

        let peer_id = self.peer_id.clone();
        tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                // Failed sends are logged and the connection left alone;
                // teardown is driven by signaling and state transitions.
                if let Err(e) = dc.send_text(line).await {
                    warn!(
                        "peer {}: data channel send failed: {e}",
                        short_peer(&peer_id)
                    );
                }
            }
        });
    }

    /// Returns `true` on the first transition into the open state. The
    /// manager drives this through the delivery buffer's lock so the
    /// transition cannot interleave with a submission's target selection.
    pub(crate) fn mark_open(&self) -> bool {
        !self.connected.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn is_open(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub(crate) fn role(&self) -> Role {
        self.role.read().map(|r| *r).unwrap_or(Role::Reader)
    }

    pub(crate) fn set_role(&self, role: Role) {
        if let Ok(mut slot) = self.role.write() {
            *slot = role;
        }
    }

    pub(crate) fn connection_state(&self) -> RTCPeerConnectionState {
        self.pc.connection_state()
    }

    /// Best-effort close of channel and connection; errors suppressed.
    pub(crate) async fn close(&self) {
        let dc = self.data_channel.lock().ok().and_then(|mut slot| slot.take());
        if let Some(dc) = dc {
            let _ = dc.close().await;
        }
        let _ = self.pc.close().await;
    }
}
