//! Shared test infrastructure: a minimal in-process signaling server.
//!
//! Implements just enough of the protocol for integration tests: the
//! challenge/proof handshake, peer discovery broadcasts, and relaying of
//! offer/answer/candidate messages with `targetPeerId` rewritten to
//! `fromPeerId`.

use futures::{SinkExt, StreamExt};
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, tungstenite::Message};

type HmacSha256 = Hmac<Sha256>;

const CHALLENGE_TIMESTAMP: i64 = 1700000000;

struct Client {
    role: String,
    tx: mpsc::UnboundedSender<String>,
}

struct Shared {
    clients: Mutex<HashMap<String, Client>>,
    ids: Vec<String>,
    next_id: AtomicUsize,
    key: Vec<u8>,
    token: String,
    reject_auth: bool,
}

pub struct TestSignalServer {
    addr: SocketAddr,
    token: String,
    accept_task: tokio::task::JoinHandle<()>,
}

impl TestSignalServer {
    /// Start a server that assigns `ids` to clients in connection order and
    /// verifies proofs against `key_hex`/`token`.
    pub async fn start(ids: &[&str], key_hex: &str, token: &str) -> Self {
        Self::start_inner(ids, key_hex, token, false).await
    }

    /// Start a server that refuses every handshake.
    pub async fn start_rejecting(ids: &[&str], key_hex: &str, token: &str) -> Self {
        Self::start_inner(ids, key_hex, token, true).await
    }

    async fn start_inner(ids: &[&str], key_hex: &str, token: &str, reject_auth: bool) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind test signaling server");
        let addr = listener.local_addr().expect("local addr");

        let shared = Arc::new(Shared {
            clients: Mutex::new(HashMap::new()),
            ids: ids.iter().map(|s| s.to_string()).collect(),
            next_id: AtomicUsize::new(0),
            key: hex::decode(key_hex).expect("test key is hex"),
            token: token.to_string(),
            reject_auth,
        });

        let accept_shared = shared.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(handle_connection(stream, accept_shared.clone()));
            }
        });

        TestSignalServer {
            addr,
            token: token.to_string(),
            accept_task,
        }
    }

    /// `ws://` endpoint clients should connect to.
    pub fn endpoint(&self) -> String {
        format!("ws://{}/{}", self.addr, self.token)
    }
}

impl Drop for TestSignalServer {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

fn expected_proof(shared: &Shared, role: &str, nonce: &str) -> String {
    let payload = format!(
        "openpull-auth|v1|{}|{}|{}|{}",
        shared.token, role, nonce, CHALLENGE_TIMESTAMP
    );
    let mut mac = HmacSha256::new_from_slice(&shared.key).expect("hmac key");
    mac.update(payload.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

async fn handle_connection(stream: TcpStream, shared: Arc<Shared>) {
    let ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(_) => return,
    };
    let (mut write, mut read) = ws.split();

    let index = shared.next_id.fetch_add(1, Ordering::SeqCst);
    let peer_id = shared
        .ids
        .get(index)
        .cloned()
        .unwrap_or_else(|| format!("extra-{index}"));
    let nonce = format!("nonce-{peer_id}");

    // Outbound queue for this client; drained below alongside reads.
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let challenge = json!({
        "type": "auth_challenge",
        "nonce": nonce,
        "timestamp": CHALLENGE_TIMESTAMP,
    });
    if write.send(Message::Text(challenge.to_string())).await.is_err() {
        return;
    }

    let mut authed = false;

    loop {
        tokio::select! {
            Some(outgoing) = rx.recv() => {
                if write.send(Message::Text(outgoing)).await.is_err() {
                    break;
                }
            }
            frame = read.next() => {
                let text = match frame {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(_)) => break,
                };
                let Ok(msg) = serde_json::from_str::<Value>(&text) else {
                    continue;
                };
                let msg_type = msg.get("type").and_then(Value::as_str).unwrap_or("");

                match msg_type {
                    "auth" => {
                        let role = msg.get("role").and_then(Value::as_str).unwrap_or("");
                        let proof = msg.get("proof").and_then(Value::as_str).unwrap_or("");
                        if shared.reject_auth || proof != expected_proof(&shared, role, &nonce) {
                            let error = json!({"type": "error", "message": "authentication failed"});
                            let _ = write.send(Message::Text(error.to_string())).await;
                            continue;
                        }

                        shared.clients.lock().unwrap().insert(
                            peer_id.clone(),
                            Client {
                                role: role.to_string(),
                                tx: tx.clone(),
                            },
                        );
                        authed = true;

                        let success = json!({"type": "auth_success", "peerId": peer_id});
                        if write.send(Message::Text(success.to_string())).await.is_err() {
                            break;
                        }
                    }
                    "peer_discovery" if authed => {
                        let peers: Vec<Value> = {
                            let clients = shared.clients.lock().unwrap();
                            clients
                                .iter()
                                .map(|(id, c)| json!({"peerId": id, "role": c.role}))
                                .collect()
                        };

                        let list = json!({"type": "peer_list", "peers": peers});
                        if write.send(Message::Text(list.to_string())).await.is_err() {
                            break;
                        }

                        let own_role = shared
                            .clients
                            .lock()
                            .unwrap()
                            .get(&peer_id)
                            .map(|c| c.role.clone())
                            .unwrap_or_default();
                        let joined = json!({
                            "type": "peer_joined",
                            "peerId": peer_id,
                            "role": own_role,
                        });
                        broadcast_except(&shared, &peer_id, &joined.to_string());
                    }
                    "webrtc_offer" | "webrtc_answer" | "webrtc_ice_candidate" if authed => {
                        let Value::Object(mut obj) = msg else { continue };
                        let Some(target) = obj
                            .remove("targetPeerId")
                            .and_then(|v| v.as_str().map(|s| s.to_string()))
                        else {
                            continue;
                        };
                        obj.insert("fromPeerId".to_string(), Value::from(peer_id.clone()));
                        let forwarded = Value::Object(obj).to_string();

                        let clients = shared.clients.lock().unwrap();
                        if let Some(client) = clients.get(&target) {
                            let _ = client.tx.send(forwarded);
                        }
                    }
                    _ => {}
                }
            }
        }
    }

    if authed {
        shared.clients.lock().unwrap().remove(&peer_id);
        let gone = json!({"type": "peer_disconnected", "peerId": peer_id});
        broadcast_except(&shared, &peer_id, &gone.to_string());
    }
}

fn broadcast_except(shared: &Shared, except: &str, text: &str) {
    let clients = shared.clients.lock().unwrap();
    for (id, client) in clients.iter() {
        if id != except {
            let _ = client.tx.send(text.to_string());
        }
    }
}
