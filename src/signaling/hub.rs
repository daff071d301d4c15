// src/signaling/hub.rs
//! Peer registry and session routing
//!
//! One connection registers at most one peer. A peer takes part in at most
//! one session at a time; the hub records the partner on both sides so that
//! `bye`, `leave` and abrupt disconnects can notify the other party.
//!
//! The registry lock is never held while a message is handed to a
//! connection: every operation computes its deliveries under the lock and
//! sends them after releasing it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::messages::{required_str, Bye, NegotiationKind, Outbound, PeerInfo, Request};
use crate::error::SignalingError;

/// Queue feeding one connection's writer
pub type PeerSender = mpsc::UnboundedSender<Outbound>;

/// Handle of a connection attached to the hub
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

/// What the connection driver should do after a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ActiveSession {
    id: String,
    partner: String,
}

#[derive(Debug)]
struct PeerEntry {
    info: PeerInfo,
    connection: ConnectionId,
    session: Option<ActiveSession>,
}

#[derive(Debug)]
struct ConnectionEntry {
    tx: PeerSender,
    peer: Option<String>,
}

#[derive(Debug, Default)]
struct Registry {
    connections: HashMap<ConnectionId, ConnectionEntry>,
    peers: HashMap<String, PeerEntry>,
}

type Deliveries = Vec<(PeerSender, Outbound)>;

impl Registry {
    fn peer_sender(&self, peer_id: &str) -> Option<PeerSender> {
        let entry = self.peers.get(peer_id)?;
        self.connections.get(&entry.connection).map(|c| c.tx.clone())
    }

    fn registered_peer(&self, connection: ConnectionId) -> Result<String, SignalingError> {
        self.connections
            .get(&connection)
            .and_then(|c| c.peer.clone())
            .ok_or(SignalingError::NotRegistered)
    }

    /// A `peers` list for every registered peer, excluding itself
    fn peer_lists(&self) -> Deliveries {
        let mut all: Vec<PeerInfo> = self.peers.values().map(|p| p.info.clone()).collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));

        self.peers
            .values()
            .filter_map(|peer| {
                let tx = self.connections.get(&peer.connection)?.tx.clone();
                let others = all.iter().filter(|p| p.id != peer.info.id).cloned().collect();
                Some((tx, Outbound::Peers(others)))
            })
            .collect()
    }

    /// Drop a peer, telling its partner the session is over
    fn remove_peer(&mut self, peer_id: &str) -> Deliveries {
        let Some(entry) = self.peers.remove(peer_id) else {
            return Vec::new();
        };
        if let Some(conn) = self.connections.get_mut(&entry.connection) {
            conn.peer = None;
        }

        let mut deliveries = Vec::new();
        if let Some(session) = entry.session {
            if let Some(partner) = self.peers.get_mut(&session.partner) {
                if partner.session.as_ref().map(|s| &s.id) == Some(&session.id) {
                    partner.session = None;
                }
            }
            if let Some(tx) = self.peer_sender(&session.partner) {
                deliveries.push((
                    tx.clone(),
                    Outbound::Bye(Bye {
                        session_id: session.id.clone(),
                        from: peer_id.to_string(),
                        to: Some(session.partner.clone()),
                    }),
                ));
                deliveries.push((tx, Outbound::Leave(peer_id.to_string())));
            }
            info!("Session {} ended by departure of {}", session.id, peer_id);
        }

        deliveries.extend(self.peer_lists());
        deliveries
    }
}

/// Signaling hub shared by all connections
#[derive(Debug, Default)]
pub struct SignalingHub {
    registry: Mutex<Registry>,
    next_connection: AtomicU64,
}

impl SignalingHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a connection; `tx` feeds its writer
    pub fn connect(&self, tx: PeerSender) -> ConnectionId {
        let id = ConnectionId(self.next_connection.fetch_add(1, Ordering::Relaxed));
        self.registry
            .lock()
            .connections
            .insert(id, ConnectionEntry { tx, peer: None });
        debug!("Connection {:?} attached", id);
        id
    }

    /// Detach a connection, synthesizing a leave for its peer
    pub fn disconnect(&self, connection: ConnectionId) {
        let deliveries = {
            let mut registry = self.registry.lock();
            let peer = registry.connections.get(&connection).and_then(|c| c.peer.clone());
            let deliveries = match peer {
                Some(peer_id) => {
                    info!("Peer {} disconnected", peer_id);
                    registry.remove_peer(&peer_id)
                }
                None => Vec::new(),
            };
            registry.connections.remove(&connection);
            deliveries
        };
        deliver(deliveries);
    }

    /// Handle one text frame from `connection`
    pub fn handle_text(&self, connection: ConnectionId, text: &str) -> Flow {
        match Request::parse(text) {
            Ok(request) => self.handle(connection, request),
            Err(e) => {
                warn!("Closing connection {:?}: {}", connection, e);
                self.reply(connection, Outbound::error("unknown", &e));
                Flow::Close
            }
        }
    }

    /// Handle a parsed request; failures are answered with an `error` envelope
    pub fn handle(&self, connection: ConnectionId, request: Request) -> Flow {
        let kind = request.kind();
        let result = match request {
            Request::New(info) => self.register(connection, info).map(|_| Flow::Continue),
            Request::Negotiation(kind, data) => self.route(connection, kind, data).map(|_| Flow::Continue),
            Request::Bye(data) => self.bye(connection, &data).map(|_| Flow::Continue),
            Request::Leave => self.leave(connection).map(|_| Flow::Close),
            Request::Keepalive => {
                self.reply(connection, Outbound::Keepalive {});
                Ok(Flow::Continue)
            }
        };

        match result {
            Ok(flow) => flow,
            Err(e) => {
                debug!("{} from {:?} failed: {}", kind, connection, e);
                self.reply(connection, Outbound::error(kind, &e));
                if e.is_fatal() {
                    Flow::Close
                } else {
                    Flow::Continue
                }
            }
        }
    }

    /// Register the connection's peer; an empty id gets a fresh UUID
    pub fn register(&self, connection: ConnectionId, mut info: PeerInfo) -> Result<String, SignalingError> {
        if info.id.is_empty() {
            info.id = Uuid::new_v4().to_string();
        }

        let deliveries = {
            let mut registry = self.registry.lock();
            let conn = registry
                .connections
                .get(&connection)
                .ok_or(SignalingError::NotRegistered)?;
            if let Some(existing) = &conn.peer {
                return Err(SignalingError::AlreadyRegistered(existing.clone()));
            }
            if registry.peers.contains_key(&info.id) {
                return Err(SignalingError::DuplicatePeerId(info.id));
            }

            if let Some(conn) = registry.connections.get_mut(&connection) {
                conn.peer = Some(info.id.clone());
            }
            registry.peers.insert(
                info.id.clone(),
                PeerEntry {
                    info: info.clone(),
                    connection,
                    session: None,
                },
            );
            registry.peer_lists()
        };

        info!("Registered peer {} ({}, {})", info.id, info.name, info.user_agent);
        deliver(deliveries);
        Ok(info.id)
    }

    /// Forward an offer/answer/candidate to `data.to`, tagged with the sender.
    ///
    /// Only an offer opens a session. Answers and candidates are forwarded
    /// without touching session state, so trickled candidates arriving after
    /// a `bye` cannot revive a closed session.
    pub fn route(&self, connection: ConnectionId, kind: NegotiationKind, mut data: Value) -> Result<(), SignalingError> {
        let to = required_str(&data, "to")?.to_string();
        let session_id = required_str(&data, "session_id")?.to_string();

        let tx = {
            let mut registry = self.registry.lock();
            let from = registry.registered_peer(connection)?;
            let tx = registry
                .peer_sender(&to)
                .ok_or_else(|| SignalingError::PeerNotFound(to.clone()))?;

            let wanted = |partner: &str| ActiveSession {
                id: session_id.clone(),
                partner: partner.to_string(),
            };
            let own = registry.peers.get(&from).and_then(|p| p.session.clone());
            if own.as_ref().is_some_and(|s| *s != wanted(&to)) {
                return Err(SignalingError::PeerBusy(from));
            }
            let theirs = registry.peers.get(&to).and_then(|p| p.session.clone());
            if theirs.as_ref().is_some_and(|s| *s != wanted(&from)) {
                return Err(SignalingError::PeerBusy(to));
            }

            if kind == NegotiationKind::Offer {
                if own.is_none() {
                    debug!("Session {} opened between {} and {}", session_id, from, to);
                }
                if let Some(peer) = registry.peers.get_mut(&from) {
                    peer.session = Some(wanted(&to));
                }
                if let Some(peer) = registry.peers.get_mut(&to) {
                    peer.session = Some(wanted(&from));
                }
            }

            if let Some(obj) = data.as_object_mut() {
                obj.insert("from".to_string(), Value::String(from));
            }
            tx
        };

        tx.send(Outbound::negotiation(kind, data))
            .map_err(|_| SignalingError::PeerNotFound(to))
    }

    /// End the sender's session and notify its partner
    pub fn bye(&self, connection: ConnectionId, data: &Value) -> Result<(), SignalingError> {
        let session_id = required_str(data, "session_id")?.to_string();

        let delivery = {
            let mut registry = self.registry.lock();
            let from = registry.registered_peer(connection)?;
            let session = registry
                .peers
                .get(&from)
                .and_then(|p| p.session.clone())
                .filter(|s| s.id == session_id)
                .ok_or_else(|| SignalingError::NoActiveSession(session_id.clone()))?;

            if let Some(peer) = registry.peers.get_mut(&from) {
                peer.session = None;
            }
            if let Some(partner) = registry.peers.get_mut(&session.partner) {
                if partner.session.as_ref().map(|s| &s.id) == Some(&session.id) {
                    partner.session = None;
                }
            }
            info!("Session {} closed by {}", session.id, from);

            registry.peer_sender(&session.partner).map(|tx| {
                (
                    tx,
                    Outbound::Bye(Bye {
                        session_id: session.id.clone(),
                        from,
                        to: Some(session.partner.clone()),
                    }),
                )
            })
        };

        deliver(delivery.into_iter().collect());
        Ok(())
    }

    /// Explicit leave: unregister the peer and notify its partner
    pub fn leave(&self, connection: ConnectionId) -> Result<(), SignalingError> {
        let deliveries = {
            let mut registry = self.registry.lock();
            let peer_id = registry.registered_peer(connection)?;
            info!("Peer {} left", peer_id);
            registry.remove_peer(&peer_id)
        };
        deliver(deliveries);
        Ok(())
    }

    fn reply(&self, connection: ConnectionId, message: Outbound) {
        let tx = self.registry.lock().connections.get(&connection).map(|c| c.tx.clone());
        if let Some(tx) = tx {
            let _ = tx.send(message);
        }
    }

    /// Registered peers, sorted by id
    pub fn peers(&self) -> Vec<PeerInfo> {
        let mut peers: Vec<PeerInfo> = self.registry.lock().peers.values().map(|p| p.info.clone()).collect();
        peers.sort_by(|a, b| a.id.cmp(&b.id));
        peers
    }

    pub fn peer_count(&self) -> usize {
        self.registry.lock().peers.len()
    }

    pub fn connection_count(&self) -> usize {
        self.registry.lock().connections.len()
    }

    /// `(session_id, partner)` of a peer's active session
    pub fn session_of(&self, peer_id: &str) -> Option<(String, String)> {
        self.registry
            .lock()
            .peers
            .get(peer_id)
            .and_then(|p| p.session.clone())
            .map(|s| (s.id, s.partner))
    }
}

fn deliver(deliveries: Deliveries) {
    for (tx, message) in deliveries {
        // A closed queue means that connection is already tearing down
        let _ = tx.send(message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn attach(hub: &SignalingHub) -> (ConnectionId, UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (hub.connect(tx), rx)
    }

    fn drain(rx: &mut UnboundedReceiver<Outbound>) -> Vec<Outbound> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    fn peer(id: &str) -> PeerInfo {
        PeerInfo {
            id: id.into(),
            name: id.to_uppercase(),
            user_agent: "test".into(),
        }
    }

    #[test]
    fn test_register_broadcasts_peer_lists() {
        let hub = SignalingHub::new();
        let (a, mut rx_a) = attach(&hub);
        let (b, mut rx_b) = attach(&hub);

        hub.register(a, peer("a")).unwrap();
        assert_eq!(drain(&mut rx_a), vec![Outbound::Peers(vec![])]);

        hub.register(b, peer("b")).unwrap();
        assert_eq!(drain(&mut rx_a), vec![Outbound::Peers(vec![peer("b")])]);
        assert_eq!(drain(&mut rx_b), vec![Outbound::Peers(vec![peer("a")])]);
        assert_eq!(hub.peer_count(), 2);
    }

    #[test]
    fn test_register_rejects_duplicates_and_assigns_ids() {
        let hub = SignalingHub::new();
        let (a, _rx_a) = attach(&hub);
        let (b, _rx_b) = attach(&hub);

        hub.register(a, peer("a")).unwrap();
        assert_eq!(
            hub.register(b, peer("a")),
            Err(SignalingError::DuplicatePeerId("a".into()))
        );
        assert_eq!(
            hub.register(a, peer("c")),
            Err(SignalingError::AlreadyRegistered("a".into()))
        );

        let assigned = hub.register(b, peer("")).unwrap();
        assert!(Uuid::parse_str(&assigned).is_ok());
    }

    #[test]
    fn test_offer_is_forwarded_with_sender() {
        let hub = SignalingHub::new();
        let (a, mut rx_a) = attach(&hub);
        let (b, mut rx_b) = attach(&hub);
        hub.register(a, peer("a")).unwrap();
        hub.register(b, peer("b")).unwrap();
        drain(&mut rx_a);
        drain(&mut rx_b);

        let offer = json!({"to": "b", "session_id": "s1", "sdp": "v=0"});
        hub.route(a, NegotiationKind::Offer, offer).unwrap();

        assert_eq!(
            drain(&mut rx_b),
            vec![Outbound::Offer(json!({"to": "b", "session_id": "s1", "sdp": "v=0", "from": "a"}))]
        );
        assert_eq!(hub.session_of("a"), Some(("s1".into(), "b".into())));
        assert_eq!(hub.session_of("b"), Some(("s1".into(), "a".into())));
    }

    #[test]
    fn test_route_errors() {
        let hub = SignalingHub::new();
        let (a, _rx_a) = attach(&hub);
        let (b, _rx_b) = attach(&hub);
        let (c, _rx_c) = attach(&hub);

        let offer = json!({"to": "b", "session_id": "s1"});
        assert_eq!(
            hub.route(a, NegotiationKind::Offer, offer.clone()),
            Err(SignalingError::NotRegistered)
        );

        hub.register(a, peer("a")).unwrap();
        assert_eq!(
            hub.route(a, NegotiationKind::Offer, offer.clone()),
            Err(SignalingError::PeerNotFound("b".into()))
        );
        assert_eq!(
            hub.route(a, NegotiationKind::Offer, json!({"session_id": "s1"})),
            Err(SignalingError::MissingField("to"))
        );

        hub.register(b, peer("b")).unwrap();
        hub.register(c, peer("c")).unwrap();
        hub.route(a, NegotiationKind::Offer, offer).unwrap();

        // b is negotiating with a
        assert_eq!(
            hub.route(c, NegotiationKind::Offer, json!({"to": "b", "session_id": "s2"})),
            Err(SignalingError::PeerBusy("b".into()))
        );
    }

    #[test]
    fn test_late_candidate_does_not_reopen_session() {
        let hub = SignalingHub::new();
        let (a, mut rx_a) = attach(&hub);
        let (b, _rx_b) = attach(&hub);
        let (c, mut rx_c) = attach(&hub);
        hub.register(a, peer("a")).unwrap();
        hub.register(b, peer("b")).unwrap();
        hub.register(c, peer("c")).unwrap();

        hub.route(a, NegotiationKind::Offer, json!({"to": "b", "session_id": "s1"}))
            .unwrap();
        hub.bye(a, &json!({"session_id": "s1"})).unwrap();
        drain(&mut rx_a);

        // Trickled candidate after bye is still delivered
        hub.route(b, NegotiationKind::Candidate, json!({"to": "a", "session_id": "s1"}))
            .unwrap();
        assert_eq!(
            drain(&mut rx_a),
            vec![Outbound::Candidate(json!({"to": "a", "session_id": "s1", "from": "b"}))]
        );
        assert_eq!(hub.session_of("a"), None);
        assert_eq!(hub.session_of("b"), None);

        drain(&mut rx_c);
        hub.route(a, NegotiationKind::Offer, json!({"to": "c", "session_id": "s2"}))
            .unwrap();
        assert_eq!(hub.session_of("a"), Some(("s2".into(), "c".into())));
        assert_eq!(hub.session_of("c"), Some(("s2".into(), "a".into())));
        assert_eq!(drain(&mut rx_c).len(), 1);

        // A stale answer for s1 must not pull a away from c
        assert_eq!(
            hub.route(b, NegotiationKind::Answer, json!({"to": "a", "session_id": "s1"})),
            Err(SignalingError::PeerBusy("a".into()))
        );
        assert_eq!(hub.session_of("a"), Some(("s2".into(), "c".into())));
    }

    #[test]
    fn test_bye_clears_both_sides() {
        let hub = SignalingHub::new();
        let (a, _rx_a) = attach(&hub);
        let (b, mut rx_b) = attach(&hub);
        hub.register(a, peer("a")).unwrap();
        hub.register(b, peer("b")).unwrap();
        hub.route(a, NegotiationKind::Offer, json!({"to": "b", "session_id": "s1"}))
            .unwrap();
        drain(&mut rx_b);

        assert_eq!(
            hub.bye(a, &json!({"session_id": "other"})),
            Err(SignalingError::NoActiveSession("other".into()))
        );
        hub.bye(a, &json!({"session_id": "s1"})).unwrap();

        assert_eq!(
            drain(&mut rx_b),
            vec![Outbound::Bye(Bye {
                session_id: "s1".into(),
                from: "a".into(),
                to: Some("b".into()),
            })]
        );
        assert_eq!(hub.session_of("a"), None);
        assert_eq!(hub.session_of("b"), None);
    }

    #[test]
    fn test_disconnect_mid_session_notifies_partner() {
        let hub = SignalingHub::new();
        let (a, _rx_a) = attach(&hub);
        let (b, mut rx_b) = attach(&hub);
        hub.register(a, peer("a")).unwrap();
        hub.register(b, peer("b")).unwrap();
        hub.route(a, NegotiationKind::Offer, json!({"to": "b", "session_id": "s1"}))
            .unwrap();
        drain(&mut rx_b);

        hub.disconnect(a);

        let received = drain(&mut rx_b);
        assert_eq!(
            received,
            vec![
                Outbound::Bye(Bye {
                    session_id: "s1".into(),
                    from: "a".into(),
                    to: Some("b".into()),
                }),
                Outbound::Leave("a".into()),
                Outbound::Peers(vec![]),
            ]
        );
        assert_eq!(hub.session_of("b"), None);
        assert_eq!(hub.peer_count(), 1);
        assert_eq!(hub.connection_count(), 1);
    }

    #[test]
    fn test_handle_text_flow() {
        let hub = SignalingHub::new();
        let (a, mut rx_a) = attach(&hub);

        assert_eq!(hub.handle_text(a, r#"{"type":"keepalive"}"#), Flow::Continue);
        assert_eq!(drain(&mut rx_a), vec![Outbound::Keepalive {}]);

        let flow = hub.handle_text(a, r#"{"type":"offer","data":{"to":"b","session_id":"s"}}"#);
        assert_eq!(flow, Flow::Continue);
        assert_eq!(
            drain(&mut rx_a),
            vec![Outbound::error("offer", &SignalingError::NotRegistered)]
        );

        assert_eq!(hub.handle_text(a, r#"{"type":"new","data":{"id":"a"}}"#), Flow::Continue);
        assert_eq!(hub.handle_text(a, r#"{"type":"leave"}"#), Flow::Close);
        assert_eq!(hub.peer_count(), 0);

        assert_eq!(hub.handle_text(a, "{oops"), Flow::Close);
    }
}
