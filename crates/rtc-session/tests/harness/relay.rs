//! In-process signaling relay
//!
//! Behaves like the production relay as far as a session can tell: clients
//! are keyed by the `userId` query parameter, joins and leaves are announced
//! to the room, targeted envelopes are delivered to their target and
//! everything else goes to the other participants. Pings are answered by the
//! relay itself.

use async_trait::async_trait;
use parking_lot::Mutex;
use rtc_session::signaling::{Envelope, SignalingConnector, SignalingLink, SignalingMessage};
use rtc_session::{Error, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use url::Url;

struct Client {
    conn: u64,
    tx: mpsc::UnboundedSender<String>,
}

#[derive(Default)]
struct RelayState {
    clients: Mutex<HashMap<String, Client>>,
    log: Mutex<Vec<Envelope>>,
    connects: Mutex<Vec<String>>,
    refusing: AtomicBool,
    holding: AtomicBool,
    held: AtomicUsize,
    release: Notify,
    next_conn: AtomicU64,
}

impl RelayState {
    fn deliver(&self, user: &str, text: String) {
        if let Some(client) = self.clients.lock().get(user) {
            let _ = client.tx.send(text);
        }
    }

    fn broadcast_from(&self, sender: &str, text: &str) {
        for (user, client) in self.clients.lock().iter() {
            if user != sender {
                let _ = client.tx.send(text.to_string());
            }
        }
    }

    fn announce_leave(&self, user: &str) {
        if let Some(text) = encode(SignalingMessage::Leave {
            from: user.to_string(),
        }) {
            self.broadcast_from(user, &text);
        }
    }

    /// Remove `user` if it is still served by connection `conn`
    fn forget(&self, user: &str, conn: u64) -> bool {
        let mut clients = self.clients.lock();
        if clients.get(user).is_some_and(|c| c.conn == conn) {
            clients.remove(user);
            true
        } else {
            false
        }
    }
}

fn encode(msg: SignalingMessage) -> Option<String> {
    msg.into_envelope().and_then(|e| e.to_json()).ok()
}

/// Relay shared by every session of a test
#[derive(Default)]
pub struct MemoryRelay {
    state: Arc<RelayState>,
}

impl MemoryRelay {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Refuse (or accept again) new connections
    pub fn refuse(&self, refusing: bool) {
        self.state.refusing.store(refusing, Ordering::SeqCst);
    }

    /// Park new connections until released
    pub fn hold(&self, holding: bool) {
        self.state.holding.store(holding, Ordering::SeqCst);
        if !holding {
            self.state.release.notify_waiters();
        }
    }

    /// Connections currently parked by [`MemoryRelay::hold`]
    pub fn held_connects(&self) -> usize {
        self.state.held.load(Ordering::SeqCst)
    }

    /// Number of successful connections made by `user`
    pub fn connections(&self, user: &str) -> usize {
        self.state
            .connects
            .lock()
            .iter()
            .filter(|u| u.as_str() == user)
            .count()
    }

    pub fn is_connected(&self, user: &str) -> bool {
        self.state.clients.lock().contains_key(user)
    }

    /// Cut `user`'s transport as a network drop would
    pub fn drop_participant(&self, user: &str) {
        let removed = self.state.clients.lock().remove(user);
        if removed.is_some() {
            self.state.announce_leave(user);
        }
    }

    /// Push an envelope straight to `user`
    pub fn inject(&self, user: &str, msg: SignalingMessage) {
        let text = encode(msg).expect("encodable message");
        self.state.deliver(user, text);
    }

    /// Push raw text straight to `user`
    pub fn inject_raw(&self, user: &str, text: &str) {
        self.state.deliver(user, text.to_string());
    }

    /// Envelopes of type `kind` that `user` sent, in order
    pub fn sent_by(&self, user: &str, kind: &str) -> Vec<Envelope> {
        self.state
            .log
            .lock()
            .iter()
            .filter(|e| e.user_id == user && e.kind == kind)
            .cloned()
            .collect()
    }

    async fn route(
        state: Arc<RelayState>,
        user: String,
        conn: u64,
        mut rx: mpsc::UnboundedReceiver<String>,
    ) {
        while let Some(text) = rx.recv().await {
            let Ok(envelope) = Envelope::from_json(&text) else {
                continue;
            };
            state.log.lock().push(envelope.clone());

            match envelope.kind.as_str() {
                "ping" => {
                    if let Some(pong) = encode(SignalingMessage::Pong {
                        from: "relay".to_string(),
                        timestamp: envelope.timestamp,
                    }) {
                        state.deliver(&user, pong);
                    }
                }
                "pong" => {}
                "leave" => {
                    state.broadcast_from(&user, &text);
                    state.forget(&user, conn);
                }
                _ => match envelope.target_user_id.as_deref() {
                    Some(target) if !target.is_empty() => state.deliver(target, text),
                    _ => state.broadcast_from(&user, &text),
                },
            }
        }

        if state.forget(&user, conn) {
            state.announce_leave(&user);
        }
    }
}

#[async_trait]
impl SignalingConnector for MemoryRelay {
    async fn connect(&self, url: &str) -> Result<SignalingLink> {
        if self.state.holding.load(Ordering::SeqCst) {
            self.state.held.fetch_add(1, Ordering::SeqCst);
            loop {
                let released = self.state.release.notified();
                if !self.state.holding.load(Ordering::SeqCst) {
                    break;
                }
                released.await;
            }
            self.state.held.fetch_sub(1, Ordering::SeqCst);
        }

        if self.state.refusing.load(Ordering::SeqCst) {
            return Err(Error::WebSocketError("connection refused".to_string()));
        }

        let url = Url::parse(url).map_err(|e| Error::WebSocketError(e.to_string()))?;
        let user = url
            .query_pairs()
            .find(|(key, _)| key == "userId")
            .map(|(_, value)| value.into_owned())
            .ok_or_else(|| Error::WebSocketError("missing userId".to_string()))?;

        let conn = self.state.next_conn.fetch_add(1, Ordering::SeqCst);
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();

        {
            let mut clients = self.state.clients.lock();
            for present in clients.keys().filter(|u| *u != &user) {
                if let Some(text) = encode(SignalingMessage::Join {
                    from: present.clone(),
                }) {
                    let _ = in_tx.send(text);
                }
            }
            clients.insert(user.clone(), Client { conn, tx: in_tx });
        }
        self.state.connects.lock().push(user.clone());

        tokio::spawn(Self::route(Arc::clone(&self.state), user, conn, out_rx));

        Ok(SignalingLink {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}
