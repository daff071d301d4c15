// tests/turn_server.rs
//! End-to-end tests of the STUN/TURN engine over real UDP sockets on loopback.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::time::{sleep, timeout};

use rtc_gateway::stun::auth::long_term_key;
use rtc_gateway::stun::{AttributeType, AttributeValue, Message, MessageClass, MessageType, TransactionId, HEADER_SIZE};
use rtc_gateway::turn::{ChannelData, TurnListeners, TurnServer};
use rtc_gateway::{CredentialIssuer, TurnConfig};

const REALM: &str = "example.org";
const SECRET: &str = "integration-secret";

fn setup_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("debug")
        .with_test_writer()
        .try_init();
}

fn loopback() -> IpAddr {
    "127.0.0.1".parse().unwrap()
}

struct Harness {
    server: Arc<TurnServer>,
    listeners: TurnListeners,
    issuer: Arc<CredentialIssuer>,
}

impl Harness {
    async fn start(relay_ports: (u16, u16), reap_interval_secs: u64) -> Self {
        setup_test_logging();
        let config = TurnConfig {
            bind: loopback(),
            port: 0,
            public_ip: loopback(),
            realm: REALM.into(),
            shared_secret: SECRET.into(),
            relay_bind_ip: loopback(),
            relay_port_min: relay_ports.0,
            relay_port_max: relay_ports.1,
            reap_interval_secs,
            ..TurnConfig::default()
        };
        let issuer = Arc::new(CredentialIssuer::new(SECRET.as_bytes().to_vec(), REALM, vec![]));
        let server = Arc::new(TurnServer::new(config, issuer.clone()));
        let listeners = server.start().await.unwrap();
        Self {
            server,
            listeners,
            issuer,
        }
    }

    async fn client(&self, label: &str) -> Client {
        let credential = self.issuer.issue(label, 600).unwrap();
        Client::connect(self.listeners.udp_addr, credential.username, credential.password).await
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.listeners.abort();
    }
}

struct Client {
    socket: UdpSocket,
    server: SocketAddr,
    username: String,
    key: Vec<u8>,
    nonce: Option<Vec<u8>>,
}

impl Client {
    async fn connect(server: SocketAddr, username: String, password: String) -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let key = long_term_key(&username, REALM, &password);
        Self {
            socket,
            server,
            username,
            key,
            nonce: None,
        }
    }

    fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr().unwrap()
    }

    async fn send_raw(&self, raw: &[u8]) {
        self.socket.send_to(raw, self.server).await.unwrap();
    }

    /// Next datagram from the server, if one arrives in time
    async fn recv_raw(&self, wait: Duration) -> Option<Vec<u8>> {
        let mut buf = vec![0u8; 2048];
        match timeout(wait, self.socket.recv_from(&mut buf)).await {
            Ok(Ok((len, _))) => Some(buf[..len].to_vec()),
            _ => None,
        }
    }

    /// Response to `tid` with its raw bytes, skipping relayed traffic
    async fn response_raw(&self, tid: TransactionId) -> (Message, Vec<u8>) {
        loop {
            let raw = self
                .recv_raw(Duration::from_secs(2))
                .await
                .expect("no response from server");
            if let Ok(msg) = Message::decode(&raw) {
                if msg.transaction_id == tid {
                    return (msg, raw);
                }
            }
        }
    }

    async fn response(&self, tid: TransactionId) -> Message {
        self.response_raw(tid).await.0
    }

    async fn transact_unsigned(&self, request: Message) -> Message {
        let tid = request.transaction_id;
        self.send_raw(&request.encode(None, true).unwrap()).await;
        self.response(tid).await
    }

    /// Send with long-term credentials, fetching a nonce first if needed
    async fn transact(&mut self, request: Message) -> Message {
        if self.nonce.is_none() {
            let probe = Message::new(MessageType::AllocateRequest, TransactionId::new());
            let challenge = self.transact_unsigned(probe).await;
            assert_eq!(challenge.error_code().map(|(code, _)| code), Some(401));
            self.nonce = challenge.nonce().map(|n| n.to_vec());
        }

        let tid = request.transaction_id;
        let signed = request
            .with(AttributeType::Username, AttributeValue::Username(self.username.clone()))
            .with(AttributeType::Realm, AttributeValue::Realm(REALM.into()))
            .with(AttributeType::Nonce, AttributeValue::Nonce(self.nonce.clone().unwrap()));
        self.send_raw(&signed.encode(Some(&self.key), true).unwrap()).await;
        let (response, raw) = self.response_raw(tid).await;

        // Responses to authenticated requests are signed with the same key
        if response.message_type.class() == MessageClass::SuccessResponse {
            assert_eq!(response.verify_integrity(&self.key, &raw).ok(), Some(true));
        }
        response
    }

    async fn allocate(&mut self) -> Message {
        self.allocate_with(TransactionId::new(), None).await
    }

    async fn allocate_with(&mut self, tid: TransactionId, lifetime: Option<u32>) -> Message {
        let mut request = Message::new(MessageType::AllocateRequest, tid)
            .with(AttributeType::RequestedTransport, AttributeValue::RequestedTransport(17));
        if let Some(secs) = lifetime {
            request = request.with(AttributeType::Lifetime, AttributeValue::Lifetime(secs));
        }
        self.transact(request).await
    }

    async fn create_permission(&mut self, peer: SocketAddr) -> Message {
        let request = Message::new(MessageType::CreatePermissionRequest, TransactionId::new())
            .with(AttributeType::XorPeerAddress, AttributeValue::XorPeerAddress(peer));
        self.transact(request).await
    }

    async fn refresh(&mut self, lifetime: u32) -> Message {
        let request = Message::new(MessageType::RefreshRequest, TransactionId::new())
            .with(AttributeType::Lifetime, AttributeValue::Lifetime(lifetime));
        self.transact(request).await
    }

    async fn send_indication(&self, peer: SocketAddr, data: &'static [u8]) {
        let indication = Message::new(MessageType::SendIndication, TransactionId::new())
            .with(AttributeType::XorPeerAddress, AttributeValue::XorPeerAddress(peer))
            .with(AttributeType::Data, AttributeValue::Data(Bytes::from_static(data)));
        self.send_raw(&indication.encode(None, false).unwrap()).await;
    }
}

async fn recv_from_relay(peer: &UdpSocket, wait: Duration) -> Option<(Vec<u8>, SocketAddr)> {
    let mut buf = vec![0u8; 2048];
    match timeout(wait, peer.recv_from(&mut buf)).await {
        Ok(Ok((len, from))) => Some((buf[..len].to_vec(), from)),
        _ => None,
    }
}

fn error_code(msg: &Message) -> Option<u16> {
    msg.error_code().map(|(code, _)| code)
}

#[tokio::test]
async fn test_binding_reflects_source_address() {
    let harness = Harness::start((43000, 43009), 10).await;
    let client = harness.client("alice").await;

    let request = Message::new(MessageType::BindingRequest, TransactionId::new());
    let response = client.transact_unsigned(request).await;

    assert_eq!(response.message_type, MessageType::BindingResponse);
    assert_eq!(response.xor_mapped_address(), Some(client.local_addr()));
    assert_eq!(harness.server.stats().binding_requests, 1);
}

#[tokio::test]
async fn test_allocate_challenge_and_success() {
    let harness = Harness::start((43010, 43019), 10).await;
    let mut client = harness.client("alice").await;

    let unsigned = Message::new(MessageType::AllocateRequest, TransactionId::new())
        .with(AttributeType::RequestedTransport, AttributeValue::RequestedTransport(17));
    let challenge = client.transact_unsigned(unsigned).await;
    assert_eq!(challenge.message_type, MessageType::AllocateError);
    assert_eq!(error_code(&challenge), Some(401));
    assert_eq!(challenge.realm(), Some(REALM));
    assert!(challenge.nonce().is_some());

    let tid = TransactionId::new();
    let response = client.allocate_with(tid, Some(7200)).await;
    assert_eq!(response.message_type, MessageType::AllocateResponse);
    let relay = response.xor_relayed_address().unwrap();
    assert_eq!(relay.ip(), loopback());
    assert!((43010..=43019).contains(&relay.port()));
    // Clamped to the server maximum
    assert_eq!(response.lifetime(), Some(3600));
    assert_eq!(response.xor_mapped_address(), Some(client.local_addr()));

    // Retransmission replays the same allocation
    let replay = client.allocate_with(tid, None).await;
    assert_eq!(replay.xor_relayed_address(), Some(relay));

    // A new Allocate on the same 5-tuple is a mismatch
    let second = client.allocate().await;
    assert_eq!(error_code(&second), Some(437));
    assert_eq!(harness.server.allocations().len(), 1);
}

#[tokio::test]
async fn test_allocate_rejections() {
    let harness = Harness::start((43020, 43029), 10).await;

    // Expired credential
    let username = "1000:mallory".to_string();
    let password = harness.issuer.password_for(&username);
    let mut expired = Client::connect(harness.listeners.udp_addr, username, password).await;
    assert_eq!(error_code(&expired.allocate().await), Some(438));

    // Wrong password
    let credential = harness.issuer.issue("bob", 600).unwrap();
    let mut wrong = Client::connect(harness.listeners.udp_addr, credential.username, "nope".into()).await;
    assert_eq!(error_code(&wrong.allocate().await), Some(401));

    // Missing and unsupported transport
    let mut client = harness.client("carol").await;
    let bare = Message::new(MessageType::AllocateRequest, TransactionId::new());
    assert_eq!(error_code(&client.transact(bare).await), Some(400));
    let tcp = Message::new(MessageType::AllocateRequest, TransactionId::new())
        .with(AttributeType::RequestedTransport, AttributeValue::RequestedTransport(6));
    assert_eq!(error_code(&client.transact(tcp).await), Some(442));

    assert!(harness.server.allocations().is_empty());
    assert!(harness.server.stats().auth_failures >= 2);
}

#[tokio::test]
async fn test_relay_round_trip_with_permissions_and_channels() {
    let harness = Harness::start((43030, 43039), 10).await;
    let mut client = harness.client("alice").await;
    let relay = client.allocate().await.xor_relayed_address().unwrap();

    let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let peer_addr = peer.local_addr().unwrap();

    // No permission yet: nothing leaves the relay socket
    client.send_indication(peer_addr, b"blocked").await;
    assert!(recv_from_relay(&peer, Duration::from_millis(300)).await.is_none());
    assert_eq!(harness.server.stats().dropped_no_permission, 1);

    let response = client.create_permission(peer_addr).await;
    assert_eq!(response.message_type, MessageType::CreatePermissionResponse);

    client.send_indication(peer_addr, b"hello peer").await;
    let (payload, from) = recv_from_relay(&peer, Duration::from_secs(2)).await.unwrap();
    assert_eq!(payload, b"hello peer");
    assert_eq!(from, relay);

    // Peer to client arrives as a Data indication
    peer.send_to(b"hello client", relay).await.unwrap();
    let raw = client.recv_raw(Duration::from_secs(2)).await.unwrap();
    let data = Message::decode(&raw).unwrap();
    assert_eq!(data.message_type, MessageType::DataIndication);
    assert_eq!(data.xor_peer_addresses(), vec![peer_addr]);
    assert_eq!(data.data().map(|d| d.as_ref()), Some(&b"hello client"[..]));

    // After ChannelBind the same traffic uses ChannelData
    let bind = Message::new(MessageType::ChannelBindRequest, TransactionId::new())
        .with(AttributeType::ChannelNumber, AttributeValue::ChannelNumber(0x4000))
        .with(AttributeType::XorPeerAddress, AttributeValue::XorPeerAddress(peer_addr));
    let response = client.transact(bind).await;
    assert_eq!(response.message_type, MessageType::ChannelBindResponse);

    peer.send_to(b"on channel", relay).await.unwrap();
    let raw = client.recv_raw(Duration::from_secs(2)).await.unwrap();
    let frame = ChannelData::decode(&raw).unwrap();
    assert_eq!(frame.number, 0x4000);
    assert_eq!(&frame.data[..], b"on channel");

    let outbound = ChannelData::new(0x4000, Bytes::from_static(b"via channel")).encode(false);
    client.send_raw(&outbound).await;
    let (payload, _) = recv_from_relay(&peer, Duration::from_secs(2)).await.unwrap();
    assert_eq!(payload, b"via channel");

    // Invalid channel number
    let bad = Message::new(MessageType::ChannelBindRequest, TransactionId::new())
        .with(AttributeType::ChannelNumber, AttributeValue::ChannelNumber(0x3FFF))
        .with(AttributeType::XorPeerAddress, AttributeValue::XorPeerAddress(peer_addr));
    assert_eq!(error_code(&client.transact(bad).await), Some(400));

    let stats = harness.server.stats();
    assert_eq!(stats.packets_to_peers, 2);
    assert_eq!(stats.packets_to_clients, 2);
}

#[tokio::test]
async fn test_refresh_zero_releases_relay_port() {
    let harness = Harness::start((43040, 43040), 10).await;
    let mut client = harness.client("alice").await;
    let relay = client.allocate().await.xor_relayed_address().unwrap();
    assert_eq!(harness.server.allocations().relay_pool().in_use(), 1);

    let refreshed = client.refresh(1200).await;
    assert_eq!(refreshed.lifetime(), Some(1200));

    let deleted = client.refresh(0).await;
    assert_eq!(deleted.message_type, MessageType::RefreshResponse);
    assert_eq!(deleted.lifetime(), Some(0));
    assert!(harness.server.allocations().is_empty());
    assert_eq!(harness.server.allocations().relay_pool().in_use(), 0);

    // The port can be bound again right away
    let rebound = UdpSocket::bind(relay).await;
    assert!(rebound.is_ok());
    drop(rebound);

    assert_eq!(error_code(&client.refresh(600).await), Some(437));
}

#[tokio::test]
async fn test_reaper_expires_allocations() {
    let harness = Harness::start((43050, 43059), 1).await;
    let mut client = harness.client("alice").await;
    let response = client.allocate_with(TransactionId::new(), Some(1)).await;
    assert_eq!(response.lifetime(), Some(1));
    assert_eq!(harness.server.allocations().len(), 1);

    sleep(Duration::from_millis(2500)).await;

    assert!(harness.server.allocations().is_empty());
    assert_eq!(harness.server.allocations().relay_pool().in_use(), 0);
    assert_eq!(harness.server.stats().allocations_expired, 1);
}

#[tokio::test]
async fn test_expired_allocation_is_gone_before_reaping() {
    // Reaper interval far beyond the allocation lifetime
    let harness = Harness::start((43080, 43081), 60).await;
    let mut client = harness.client("alice").await;
    let first = client.allocate_with(TransactionId::new(), Some(1)).await;
    assert_eq!(first.lifetime(), Some(1));

    sleep(Duration::from_millis(1500)).await;
    assert_eq!(harness.server.allocations().len(), 1);

    assert_eq!(error_code(&client.refresh(600).await), Some(437));

    // A new Allocate on the same 5-tuple replaces the expired entry
    let second = client.allocate().await;
    assert_eq!(second.message_type, MessageType::AllocateResponse);
    assert_eq!(harness.server.allocations().len(), 1);
    assert_eq!(harness.server.stats().allocations_expired, 1);
}

#[tokio::test]
async fn test_malformed_and_unknown_attributes() {
    let harness = Harness::start((43060, 43069), 10).await;
    let client = harness.client("alice").await;

    client.send_raw(b"definitely not stun, just some garbage bytes").await;
    assert!(client.recv_raw(Duration::from_millis(300)).await.is_none());
    assert_eq!(harness.server.stats().malformed_messages, 1);

    let tid = TransactionId::new();
    let mut raw = Message::new(MessageType::BindingRequest, tid)
        .encode(None, false)
        .unwrap()
        .to_vec();
    raw.extend_from_slice(&[0x00, 0x18, 0x00, 0x01, 0x80, 0x00, 0x00, 0x00]);
    let body = (raw.len() - HEADER_SIZE) as u16;
    raw[2..4].copy_from_slice(&body.to_be_bytes());
    client.send_raw(&raw).await;

    let response = client.response(tid).await;
    assert_eq!(error_code(&response), Some(420));
    match response.get_attribute(AttributeType::UnknownAttributes).map(|a| &a.value) {
        Some(AttributeValue::UnknownAttributes(types)) => assert_eq!(types, &vec![0x0018]),
        other => panic!("unexpected UNKNOWN-ATTRIBUTES {:?}", other),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_allocations_stay_isolated() {
    const CLIENTS: usize = 16;
    let harness = Arc::new(Harness::start((43100, 43199), 10).await);

    let mut tasks = Vec::new();
    for i in 0..CLIENTS {
        let harness = harness.clone();
        tasks.push(tokio::spawn(async move {
            let mut client = harness.client(&format!("user{}", i)).await;
            let relay = client.allocate().await.xor_relayed_address().unwrap();
            let peer: SocketAddr = format!("10.0.0.{}:9000", i + 1).parse().unwrap();
            for round in 0..5 {
                let response = client.create_permission(peer).await;
                assert_eq!(response.message_type, MessageType::CreatePermissionResponse);
                let refreshed = client.refresh(600 + round).await;
                assert_eq!(refreshed.lifetime(), Some(600 + round));
            }
            (client.local_addr(), relay, peer)
        }));
    }

    let mut results = Vec::new();
    for task in tasks {
        results.push(task.await.unwrap());
    }

    let allocations = harness.server.allocations();
    assert_eq!(allocations.len(), CLIENTS);
    assert_eq!(allocations.relay_pool().in_use(), CLIENTS);

    let mut relay_ports: Vec<u16> = results.iter().map(|(_, relay, _)| relay.port()).collect();
    relay_ports.sort_unstable();
    relay_ports.dedup();
    assert_eq!(relay_ports.len(), CLIENTS);

    for (client_addr, relay, peer) in &results {
        let allocation = allocations.find_by_relay(*relay).unwrap();
        assert_eq!(allocation.five_tuple.client, *client_addr);
        assert_eq!(allocation.permission_count(), 1);
        let now = std::time::Instant::now();
        assert!(allocation.has_permission(peer.ip(), now));
        for (_, _, other) in results.iter().filter(|(_, _, p)| p != peer) {
            assert!(!allocation.has_permission(other.ip(), now));
        }
    }
}
