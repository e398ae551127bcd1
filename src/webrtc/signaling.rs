//! Signaling-driven connection management.
//!
//! One socket task drives everything: it decodes signaling traffic, runs the
//! handshake, elects initiators, owns teardown, and replays the retention
//! buffer when a reader's channel opens. Link callbacks and timers report
//! back into the same task through [`PeerEvent`], so registry and link state
//! are only ever mutated from one place.

use anyhow::{bail, Context, Result};
use futures::{SinkExt, StreamExt};
use std::cell::Cell;
use std::collections::HashMap;
use std::ops::ControlFlow;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::io::AsyncRead;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{
    connect_async, connect_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, trace, warn};
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;

use super::auth::challenge_proof;
use super::peer::{PeerEvent, PeerLink};
use super::types::{
    short_peer, ManagerOptions, PeerInfo, SessionSdp, SignalMessage, JOIN_SETTLE_DELAY,
    MAX_RECONNECT_ATTEMPTS, STALE_SWEEP_INTERVAL,
};
use crate::delivery::{LogEntry, RetentionBuffer, Severity};
use crate::intercept::{self, Tee};
use crate::observer::{Registry, Subscription};
use crate::uri::{parse_connection_string, ConnectionInfo, Role};

type LogHandler = dyn Fn(&LogEntry) + Send + Sync;
type ConnectionHandler = dyn Fn(&str, bool) + Send + Sync;
type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Handle to a connected forwarding session.
///
/// Cheap to clone; every clone drives the same session. The handle stays
/// valid after [`Manager::disconnect`], but all sends become no-ops.
#[derive(Clone)]
pub struct Manager {
    inner: Arc<Inner>,
}

struct Inner {
    info: ConnectionInfo,
    options: ManagerOptions,
    /// Server-assigned id; set on `auth_success`, cleared by cleanup.
    peer_id: RwLock<Option<String>>,
    /// Currently-known peers by id.
    peers: RwLock<HashMap<String, Role>>,
    links: RwLock<HashMap<String, Arc<PeerLink>>>,
    buffer: RetentionBuffer,
    log_observers: Registry<LogHandler>,
    connection_observers: Registry<ConnectionHandler>,
    signal_tx: mpsc::UnboundedSender<SignalMessage>,
    event_tx: mpsc::UnboundedSender<PeerEvent>,
    attempts: AtomicU32,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
    connect_waiter: Mutex<Option<oneshot::Sender<Result<String, String>>>>,
}

impl Manager {
    /// Parse `url` and connect with default options.
    pub async fn connect(url: &str) -> Result<Manager> {
        Self::connect_opts(url, ManagerOptions::default()).await
    }

    /// Parse `url`, derive the signaling endpoint, and connect.
    ///
    /// Resolves once the handshake completes; rejects on a malformed
    /// connection string, socket failure, or a server-sent error.
    pub async fn connect_opts(url: &str, options: ManagerOptions) -> Result<Manager> {
        let info = parse_connection_string(url)?;
        let endpoint = signaling_url(&info);
        Self::connect_endpoint(&endpoint, info, options).await
    }

    /// Connect against an explicit signaling endpoint.
    ///
    /// Normally the endpoint is derived from the connection string
    /// (`wss://<host>/<publicToken?>`); this entry point exists for setups
    /// where the signaling service is reached through a different address
    /// than the advertised authority.
    pub async fn connect_endpoint(
        endpoint: &str,
        info: ConnectionInfo,
        options: ManagerOptions,
    ) -> Result<Manager> {
        let socket = open_socket(endpoint, &info).await?;
        info!("signaling socket open: {endpoint}");

        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let (connect_tx, connect_rx) = oneshot::channel();

        let retention = options.retention;
        let inner = Arc::new(Inner {
            info,
            options,
            peer_id: RwLock::new(None),
            peers: RwLock::new(HashMap::new()),
            links: RwLock::new(HashMap::new()),
            buffer: RetentionBuffer::new(retention),
            log_observers: Registry::new(),
            connection_observers: Registry::new(),
            signal_tx,
            event_tx,
            attempts: AtomicU32::new(0),
            closed: AtomicBool::new(false),
            shutdown,
            connect_waiter: Mutex::new(Some(connect_tx)),
        });

        tokio::spawn(run_loop(
            inner.clone(),
            socket,
            signal_rx,
            event_rx,
            shutdown_rx,
        ));

        match connect_rx.await {
            Ok(Ok(peer_id)) => {
                info!(
                    "authenticated as {} ({})",
                    short_peer(&peer_id),
                    inner.info.role
                );
                Ok(Manager { inner })
            }
            Ok(Err(message)) => bail!("{message}"),
            Err(_) => bail!("signaling connection closed during handshake"),
        }
    }

    /// Role this session authenticated as.
    pub fn role(&self) -> Role {
        self.inner.info.role
    }

    /// Server-assigned peer id, when authenticated.
    pub fn peer_id(&self) -> Option<String> {
        self.inner.peer_id.read().ok().and_then(|id| id.clone())
    }

    /// Snapshot of the currently-known peers.
    pub fn peers(&self) -> Vec<PeerInfo> {
        self.inner
            .peers
            .read()
            .map(|peers| {
                peers
                    .iter()
                    .map(|(peer_id, role)| PeerInfo {
                        peer_id: peer_id.clone(),
                        role: *role,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of peers with an open data channel.
    pub fn connection_count(&self) -> usize {
        self.inner
            .links
            .read()
            .map(|links| links.values().filter(|l| l.is_open()).count())
            .unwrap_or(0)
    }

    /// Entries currently held in the retention buffer.
    pub fn buffered_count(&self) -> usize {
        self.inner.buffer.len()
    }

    /// Socket-loss counter. There is no automatic retry loop; the counter
    /// exists for callers that implement their own.
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.attempts.load(Ordering::Relaxed)
    }

    pub fn max_reconnect_attempts() -> u32 {
        MAX_RECONNECT_ATTEMPTS
    }

    /// Buffer `entry` and broadcast it to every open reader channel.
    ///
    /// Never fails; a session in reader role warns and drops the entry.
    pub fn send_log(&self, entry: LogEntry) {
        if self.inner.info.role != Role::Appender {
            warn!("send_log ignored: session is connected in reader role");
            return;
        }
        self.inner.submit_entry(entry);
    }

    /// Feed one raw output line through parse, filter, and delivery.
    pub fn submit_line(&self, line: &str, default: Severity) {
        if intercept::should_skip(line) {
            return;
        }
        let entry = intercept::parse_line(line, default);
        if entry.message.is_empty() {
            return;
        }
        self.send_log(entry);
    }

    /// Tail a child's stdout/stderr, forwarding each line at severity
    /// info/error respectively. Returns immediately; tailing stops when the
    /// streams end.
    pub fn forward_streams<O, E>(&self, stdout: O, stderr: E)
    where
        O: AsyncRead + Unpin + Send + 'static,
        E: AsyncRead + Unpin + Send + 'static,
    {
        tokio::spawn(intercept::tail_lines(
            self.clone(),
            stdout,
            Severity::Info,
        ));
        tokio::spawn(intercept::tail_lines(
            self.clone(),
            stderr,
            Severity::Error,
        ));
    }

    /// Wrap a writer so its output is mirrored unchanged and forwarded.
    /// Dropping the tee restores plain writing.
    pub fn tee<W: std::io::Write>(&self, inner: W, default: Severity) -> Tee<W> {
        Tee::new(self.clone(), inner, default)
    }

    /// Register a log-arrival handler. Fires for locally submitted entries
    /// (appender) and entries received over a data channel (reader).
    pub fn on_log(&self, handler: impl Fn(&LogEntry) + Send + Sync + 'static) -> Subscription {
        self.inner.log_observers.insert(Arc::new(handler))
    }

    /// Register a connection-state handler, invoked with `(peer_id, connected)`.
    pub fn on_connection(
        &self,
        handler: impl Fn(&str, bool) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner.connection_observers.insert(Arc::new(handler))
    }

    /// Tear the session down: sweep timer, links, registry, socket. Safe to
    /// call more than once.
    pub fn disconnect(&self) {
        let _ = self.inner.shutdown.send(true);
        let inner = self.inner.clone();
        tokio::spawn(async move {
            inner.cleanup().await;
        });
    }

    pub(crate) fn in_submission(&self) -> bool {
        IN_SUBMISSION.with(|flag| flag.get())
    }
}

thread_local! {
    /// Set while a submission runs on the current thread. Tees consult it so
    /// writes produced inside the delivery path (an observer printing a
    /// diagnostic) pass through to their inner writer without re-entering
    /// delivery. Submissions happening concurrently on other threads do not
    /// affect each other.
    static IN_SUBMISSION: Cell<bool> = const { Cell::new(false) };
}

struct SubmissionGuard {
    prev: bool,
}

impl SubmissionGuard {
    fn enter() -> Self {
        let prev = IN_SUBMISSION.with(|flag| flag.replace(true));
        SubmissionGuard { prev }
    }
}

impl Drop for SubmissionGuard {
    fn drop(&mut self) {
        let prev = self.prev;
        IN_SUBMISSION.with(|flag| flag.set(prev));
    }
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("role", &self.inner.info.role)
            .field("host", &self.inner.info.host)
            .field("peer_id", &self.peer_id())
            .finish_non_exhaustive()
    }
}

/// Signaling endpoint derived from a connection string.
pub(crate) fn signaling_url(info: &ConnectionInfo) -> String {
    match &info.public_token {
        Some(token) => format!("wss://{}/{}", info.host, token),
        None => format!("wss://{}", info.host),
    }
}

async fn open_socket(endpoint: &str, info: &ConnectionInfo) -> Result<Socket> {
    let connect_err = |e| format!("failed to reach signaling server at {endpoint}: {e}");

    if endpoint.starts_with("wss://") && info.is_loopback() {
        // Local development servers run with self-signed certificates;
        // skip verification for loopback authorities only.
        let tls = native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true)
            .build()
            .context("failed to build TLS connector")?;
        let (socket, _) = connect_async_tls_with_config(
            endpoint,
            None,
            false,
            Some(Connector::NativeTls(tls)),
        )
        .await
        .map_err(|e| anyhow::anyhow!(connect_err(e)))?;
        Ok(socket)
    } else {
        let (socket, _) = connect_async(endpoint)
            .await
            .map_err(|e| anyhow::anyhow!(connect_err(e)))?;
        Ok(socket)
    }
}

async fn run_loop(
    inner: Arc<Inner>,
    socket: Socket,
    mut signal_rx: mpsc::UnboundedReceiver<SignalMessage>,
    mut event_rx: mpsc::UnboundedReceiver<PeerEvent>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let (mut write, mut read) = socket.split();
    let mut sweep = tokio::time::interval(STALE_SWEEP_INTERVAL);

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
            Some(msg) = signal_rx.recv() => {
                let json = match serde_json::to_string(&msg) {
                    Ok(json) => json,
                    Err(e) => {
                        error!("failed to encode {} message: {e}", msg.msg_type());
                        continue;
                    }
                };
                trace!("signaling send: {}", msg.msg_type());
                if let Err(e) = write.send(Message::Text(json)).await {
                    warn!("signaling send failed: {e}");
                    inner.note_socket_lost();
                    break;
                }
            }
            frame = read.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        if inner.handle_signal(&text).await.is_break() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("signaling socket closed");
                        inner.note_socket_lost();
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("signaling socket error: {e}");
                        inner.note_socket_lost();
                        break;
                    }
                }
            }
            Some(event) = event_rx.recv() => {
                inner.handle_peer_event(event).await;
            }
            _ = sweep.tick() => {
                inner.sweep_stale().await;
            }
        }
    }

    let _ = write.close().await;
    inner.cleanup().await;
}

impl Inner {
    fn send_signal(&self, msg: SignalMessage) {
        // Dropped silently once the socket task is gone.
        if self.signal_tx.send(msg).is_err() {
            debug!("signaling message dropped: socket not open");
        }
    }

    async fn handle_signal(&self, text: &str) -> ControlFlow<()> {
        let msg: SignalMessage = match serde_json::from_str(text) {
            Ok(msg) => msg,
            Err(e) => {
                debug!("undecodable signaling message: {e}");
                return ControlFlow::Continue(());
            }
        };
        trace!("signaling recv: {}", msg.msg_type());

        match msg {
            SignalMessage::AuthChallenge { nonce, timestamp } => {
                match challenge_proof(
                    &self.info.key,
                    self.info.token_str(),
                    self.info.role,
                    &nonce,
                    timestamp,
                ) {
                    Ok(proof) => {
                        self.send_signal(SignalMessage::Auth {
                            role: self.info.role,
                            proof,
                            default_fields: self.options.default_fields.clone(),
                        });
                    }
                    Err(e) => {
                        self.fail_connect(format!("cannot answer auth challenge: {e:#}"));
                        return ControlFlow::Break(());
                    }
                }
            }
            SignalMessage::AuthSuccess { peer_id } => {
                if let Ok(mut own) = self.peer_id.write() {
                    *own = Some(peer_id.clone());
                }
                self.send_signal(SignalMessage::PeerDiscovery);
                self.resolve_connect(peer_id);
            }
            SignalMessage::Error { message } => {
                if self.fail_connect(message.clone()) {
                    return ControlFlow::Break(());
                }
                // Post-handshake server errors are fatal to the session.
                error!("signaling server error: {message}");
                return ControlFlow::Break(());
            }
            SignalMessage::PeerList { peers } => {
                self.apply_peer_list(peers).await;
            }
            SignalMessage::PeerJoined { peer_id, role } => {
                debug!("peer joined: {} ({role})", short_peer(&peer_id));
                self.upsert_peer(&peer_id, role).await;
                // Let the just-joined peer finish its own handshake before
                // we elect and offer.
                let event_tx = self.event_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(JOIN_SETTLE_DELAY).await;
                    let _ = event_tx.send(PeerEvent::Elect { peer_id });
                });
            }
            SignalMessage::PeerDisconnected { peer_id } => {
                self.teardown(&peer_id, "peer disconnected").await;
            }
            SignalMessage::WebrtcOffer {
                from_peer_id: Some(from),
                offer,
                ..
            } => {
                self.handle_remote_offer(&from, &offer).await;
            }
            SignalMessage::WebrtcAnswer {
                from_peer_id: Some(from),
                answer,
                ..
            } => {
                let link = self.link(&from);
                match link {
                    Some(link) => {
                        if let Err(e) = link.handle_answer(&answer).await {
                            warn!("failed to apply answer from {}: {e:#}", short_peer(&from));
                        }
                    }
                    None => debug!("answer from unknown peer {}", short_peer(&from)),
                }
            }
            SignalMessage::WebrtcIceCandidate {
                from_peer_id: Some(from),
                candidate,
                ..
            } => match self.link(&from) {
                Some(link) => {
                    if let Err(e) = link.add_candidate(candidate).await {
                        warn!("candidate from {} rejected: {e:#}", short_peer(&from));
                    }
                }
                None => debug!("candidate for unknown peer {}", short_peer(&from)),
            },
            other => {
                debug!("ignoring unexpected {} message", other.msg_type());
            }
        }

        ControlFlow::Continue(())
    }

    async fn handle_peer_event(&self, event: PeerEvent) {
        match event {
            PeerEvent::Open { peer_id } => {
                let Some(link) = self.link(&peer_id) else {
                    return;
                };
                link.start_writer();
                // The open transition and backlog replay run under the
                // buffer lock, the same lock `submit_entry` selects its
                // broadcast targets under: a concurrent submission either
                // lands in the replayed snapshot or is broadcast after it.
                let replay = self.info.role == Role::Appender && link.role() == Role::Reader;
                let backlog = self.buffer.open_channel(
                    || link.mark_open(),
                    |line| {
                        if replay {
                            link.enqueue(line);
                        }
                    },
                );
                if let Some(backlog) = backlog {
                    info!(
                        "channel open to {} ({})",
                        short_peer(&peer_id),
                        link.role()
                    );
                    if replay && backlog > 0 {
                        debug!(
                            "replayed {backlog} buffered entries to {}",
                            short_peer(&peer_id)
                        );
                    }
                    self.notify_connection(&peer_id, true);
                }
            }
            PeerEvent::Closed { peer_id } => {
                self.teardown(&peer_id, "channel closed").await;
            }
            PeerEvent::Message { peer_id, text } => {
                match serde_json::from_str::<LogEntry>(&text) {
                    Ok(entry) => self.notify_log(&entry),
                    Err(e) => debug!(
                        "dropping undecodable entry from {}: {e}",
                        short_peer(&peer_id)
                    ),
                }
            }
            PeerEvent::Elect { peer_id } => {
                self.maybe_initiate(&peer_id).await;
            }
        }
    }

    /// Replace the registry with a `peer_list` snapshot, then reconcile
    /// link roles and run elections immediately.
    async fn apply_peer_list(&self, peers: Vec<PeerInfo>) {
        let own_id = self.peer_id.read().ok().and_then(|id| id.clone());
        if let Ok(mut registry) = self.peers.write() {
            registry.clear();
            for peer in &peers {
                if Some(&peer.peer_id) != own_id.as_ref() {
                    registry.insert(peer.peer_id.clone(), peer.role);
                }
            }
        }
        debug!("peer list: {} peers", peers.len());

        for peer in peers {
            if Some(&peer.peer_id) == own_id.as_ref() {
                continue;
            }
            self.reconcile_link_role(&peer.peer_id, peer.role).await;
            self.maybe_initiate(&peer.peer_id).await;
        }
    }

    async fn upsert_peer(&self, peer_id: &str, role: Role) {
        if let Ok(mut registry) = self.peers.write() {
            registry.insert(peer_id.to_string(), role);
        }
        self.reconcile_link_role(peer_id, role).await;
    }

    /// Correct a link created under the reader guess. If the correction
    /// reveals a same-role pair, the link is invalid and comes down.
    async fn reconcile_link_role(&self, peer_id: &str, role: Role) {
        let Some(link) = self.link(peer_id) else {
            return;
        };
        if role == self.info.role {
            self.teardown(peer_id, "same-role peer").await;
        } else if link.role() != role {
            debug!("correcting role of {} to {role}", short_peer(peer_id));
            link.set_role(role);
        }
    }

    /// Initiator election: the lexicographically smaller peer id creates the
    /// channel and drives the offer; the other side waits and answers. Only
    /// complementary roles connect.
    async fn maybe_initiate(&self, peer_id: &str) {
        let Some(own_id) = self.peer_id.read().ok().and_then(|id| id.clone()) else {
            return;
        };
        let Some(peer_role) = self
            .peers
            .read()
            .ok()
            .and_then(|peers| peers.get(peer_id).copied())
        else {
            return;
        };
        if peer_role == self.info.role {
            return;
        }
        if self
            .links
            .read()
            .map(|links| links.contains_key(peer_id))
            .unwrap_or(true)
        {
            return;
        }
        if own_id.as_str() >= peer_id {
            debug!("waiting for offer from {}", short_peer(peer_id));
            return;
        }

        debug!("initiating connection to {}", short_peer(peer_id));
        let link = match PeerLink::new(
            peer_id.to_string(),
            peer_role,
            &self.options.stun_servers,
            self.signal_tx.clone(),
            self.event_tx.clone(),
        )
        .await
        {
            Ok(link) => link,
            Err(e) => {
                warn!("failed to create connection to {}: {e:#}", short_peer(peer_id));
                return;
            }
        };
        if let Ok(mut links) = self.links.write() {
            links.insert(peer_id.to_string(), link.clone());
        }

        match link.offer().await {
            Ok(offer) => {
                self.send_signal(SignalMessage::WebrtcOffer {
                    target_peer_id: Some(peer_id.to_string()),
                    from_peer_id: None,
                    offer,
                });
            }
            Err(e) => {
                warn!("offer to {} failed: {e:#}", short_peer(peer_id));
                self.teardown(peer_id, "offer failed").await;
            }
        }
    }

    /// Answerer path. Creates the link opportunistically when the offer
    /// precedes any registry knowledge of the peer; the remote role defaults
    /// to reader until the registry says otherwise.
    async fn handle_remote_offer(&self, from: &str, offer: &SessionSdp) {
        let known_role = self
            .peers
            .read()
            .ok()
            .and_then(|peers| peers.get(from).copied());
        if known_role == Some(self.info.role) {
            debug!("ignoring offer from same-role peer {}", short_peer(from));
            return;
        }

        let link = match self.link(from) {
            Some(link) => link,
            None => {
                let guessed = known_role.unwrap_or(Role::Reader);
                if let Ok(mut registry) = self.peers.write() {
                    registry.entry(from.to_string()).or_insert(guessed);
                }
                let link = match PeerLink::new(
                    from.to_string(),
                    guessed,
                    &self.options.stun_servers,
                    self.signal_tx.clone(),
                    self.event_tx.clone(),
                )
                .await
                {
                    Ok(link) => link,
                    Err(e) => {
                        warn!(
                            "failed to create connection for offer from {}: {e:#}",
                            short_peer(from)
                        );
                        return;
                    }
                };
                if let Ok(mut links) = self.links.write() {
                    links.insert(from.to_string(), link.clone());
                }
                link
            }
        };

        match link.handle_offer(offer).await {
            Ok(answer) => {
                self.send_signal(SignalMessage::WebrtcAnswer {
                    target_peer_id: Some(from.to_string()),
                    from_peer_id: None,
                    answer,
                });
            }
            Err(e) => {
                warn!("failed to answer offer from {}: {e:#}", short_peer(from));
                self.teardown(from, "answer failed").await;
            }
        }
    }

    /// Common teardown path: drop the link and registry entry, close
    /// best-effort, notify observers.
    async fn teardown(&self, peer_id: &str, reason: &str) {
        let link = self
            .links
            .write()
            .ok()
            .and_then(|mut links| links.remove(peer_id));
        if let Ok(mut registry) = self.peers.write() {
            registry.remove(peer_id);
        }
        let Some(link) = link else {
            return;
        };

        debug!("tearing down {}: {reason}", short_peer(peer_id));
        let closing = link.clone();
        tokio::spawn(async move {
            closing.close().await;
        });
        self.notify_connection(peer_id, false);
    }

    /// Fallback sweep; the authoritative teardown signal is
    /// `peer_disconnected` from signaling.
    async fn sweep_stale(&self) {
        let stale: Vec<String> = self
            .links
            .read()
            .map(|links| {
                links
                    .values()
                    .filter(|link| {
                        matches!(
                            link.connection_state(),
                            RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed
                        )
                    })
                    .map(|link| link.peer_id.clone())
                    .collect()
            })
            .unwrap_or_default();

        for peer_id in stale {
            self.teardown(&peer_id, "stale connection").await;
        }
    }

    fn link(&self, peer_id: &str) -> Option<Arc<PeerLink>> {
        self.links
            .read()
            .ok()
            .and_then(|links| links.get(peer_id).cloned())
    }

    /// Buffer + broadcast. Targets are selected inside the buffer lock —
    /// the lock the channel-open transition also takes — so an entry either
    /// lands in a freshly opened channel's replayed snapshot or is broadcast
    /// to it directly, never both and never neither.
    fn submit_entry(&self, entry: LogEntry) {
        let _guard = SubmissionGuard::enter();

        let line = match serde_json::to_string(&entry) {
            Ok(line) => line,
            Err(e) => {
                error!("failed to serialize log entry: {e}");
                return;
            }
        };

        self.buffer.submit(line, |line| {
            let Ok(links) = self.links.read() else {
                return;
            };
            for link in links.values() {
                if link.is_open() && link.role() == Role::Reader {
                    link.enqueue(line);
                }
            }
        });

        self.notify_log(&entry);
    }

    fn notify_log(&self, entry: &LogEntry) {
        for handler in self.log_observers.snapshot() {
            if catch_unwind(AssertUnwindSafe(|| (*handler)(entry))).is_err() {
                error!("log observer panicked; continuing with remaining handlers");
            }
        }
    }

    fn notify_connection(&self, peer_id: &str, connected: bool) {
        for handler in self.connection_observers.snapshot() {
            if catch_unwind(AssertUnwindSafe(|| (*handler)(peer_id, connected))).is_err() {
                error!("connection observer panicked; continuing with remaining handlers");
            }
        }
    }

    fn note_socket_lost(&self) {
        let attempts = self.attempts.fetch_add(1, Ordering::Relaxed) + 1;
        warn!("signaling socket lost (attempt {attempts}/{MAX_RECONNECT_ATTEMPTS}); cleaning up");
    }

    fn fail_connect(&self, message: String) -> bool {
        let waiter = self
            .connect_waiter
            .lock()
            .ok()
            .and_then(|mut slot| slot.take());
        match waiter {
            Some(tx) => {
                let _ = tx.send(Err(message));
                true
            }
            None => false,
        }
    }

    fn resolve_connect(&self, peer_id: String) {
        let waiter = self
            .connect_waiter
            .lock()
            .ok()
            .and_then(|mut slot| slot.take());
        if let Some(tx) = waiter {
            let _ = tx.send(Ok(peer_id));
        }
    }

    /// Idempotent full cleanup: links, registry, identity, pending connect.
    async fn cleanup(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.fail_connect("signaling connection closed".to_string());

        let links: Vec<Arc<PeerLink>> = self
            .links
            .write()
            .map(|mut links| links.drain().map(|(_, link)| link).collect())
            .unwrap_or_default();
        if let Ok(mut registry) = self.peers.write() {
            registry.clear();
        }
        if let Ok(mut own) = self.peer_id.write() {
            *own = None;
        }

        for link in links {
            link.close().await;
        }
        info!("session closed");
    }
}
