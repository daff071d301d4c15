// src/turn/server.rs
//! STUN/TURN server engine
//!
//! Request handling is stateless across transactions; all state lives in the
//! [`AllocationManager`]. Every inbound frame goes through
//! [`TurnServer::process`], which returns the reply to send back, if any.
//! Malformed input produces no reply.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tracing::{debug, error, info, instrument, trace, warn};

use super::allocation_manager::{AllocateOutcome, Allocation, AllocationManager, AllocationRequest};
use super::auth::TurnAuthenticator;
use super::channel_data::ChannelData;
use super::codec::TurnFrameCodec;
use super::relay_pool::RelayPortPool;
use super::{ClientSink, FiveTuple, TransportProtocol, TurnStats, TurnStatsSnapshot, TRANSPORT_UDP};
use crate::config::TurnConfig;
use crate::credentials::CredentialIssuer;
use crate::error::{GatewayResult, TurnError};
use crate::stun::protocol::MAX_MESSAGE_SIZE;
use crate::stun::{Attribute, AttributeType, AttributeValue, Message, MessageClass, MessageType, TransactionId};

/// Outbound frames buffered per TCP connection
const TCP_OUTBOUND_QUEUE: usize = 256;

/// Where a frame came from and how to reach its sender
#[derive(Debug, Clone)]
pub struct ClientContext {
    pub client: SocketAddr,
    pub server: SocketAddr,
    pub protocol: TransportProtocol,
    pub sink: ClientSink,
}

impl ClientContext {
    pub fn five_tuple(&self) -> FiveTuple {
        FiveTuple {
            client: self.client,
            server: self.server,
            protocol: self.protocol,
        }
    }
}

/// Tasks and bound addresses of a running server
#[derive(Debug)]
pub struct TurnListeners {
    pub udp_addr: SocketAddr,
    pub tcp_addr: Option<SocketAddr>,
    tasks: Vec<JoinHandle<()>>,
}

impl TurnListeners {
    /// Stop the listeners and the reaper
    pub fn abort(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// STUN/TURN server
#[derive(Debug)]
pub struct TurnServer {
    config: TurnConfig,
    allocations: Arc<AllocationManager>,
    auth: TurnAuthenticator,
    stats: Arc<TurnStats>,
}

impl TurnServer {
    pub fn new(config: TurnConfig, issuer: Arc<CredentialIssuer>) -> Self {
        let stats = Arc::new(TurnStats::default());
        let pool = RelayPortPool::new(config.relay_bind_ip, config.relay_port_min, config.relay_port_max);
        let allocations = Arc::new(AllocationManager::new(
            pool,
            config.public_ip,
            config.max_allocations_per_user,
            stats.clone(),
        ));
        let auth = TurnAuthenticator::new(issuer, config.nonce_lifetime());

        Self {
            config,
            allocations,
            auth,
            stats,
        }
    }

    pub fn allocations(&self) -> &Arc<AllocationManager> {
        &self.allocations
    }

    pub fn stats(&self) -> TurnStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn config(&self) -> &TurnConfig {
        &self.config
    }

    /// Bind the listeners and start the listener and reaper tasks
    pub async fn start(self: &Arc<Self>) -> GatewayResult<TurnListeners> {
        let udp = Arc::new(UdpSocket::bind(self.config.listen_addr()).await?);
        let udp_addr = udp.local_addr()?;
        info!("TURN UDP listener on {}", udp_addr);

        let mut tasks = vec![tokio::spawn(self.clone().run_udp(udp))];

        let tcp_addr = if self.config.enable_tcp {
            let listener = TcpListener::bind(SocketAddr::new(self.config.bind, udp_addr.port())).await?;
            let addr = listener.local_addr()?;
            info!("TURN TCP listener on {}", addr);
            tasks.push(tokio::spawn(self.clone().run_tcp(listener)));
            Some(addr)
        } else {
            None
        };

        tasks.push(self.spawn_reaper());

        Ok(TurnListeners {
            udp_addr,
            tcp_addr,
            tasks,
        })
    }

    async fn run_udp(self: Arc<Self>, socket: Arc<UdpSocket>) {
        let local_addr = match socket.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                error!("UDP listener has no local address: {}", e);
                return;
            }
        };
        let mut buf = vec![0u8; MAX_MESSAGE_SIZE];

        loop {
            let (len, src) = match socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    // ICMP errors surface here on some platforms
                    debug!("UDP receive error: {}", e);
                    continue;
                }
            };

            let ctx = ClientContext {
                client: src,
                server: local_addr,
                protocol: TransportProtocol::Udp,
                sink: ClientSink::Udp {
                    socket: socket.clone(),
                    client: src,
                },
            };

            if let Some(reply) = self.process(&buf[..len], &ctx).await {
                if let Err(e) = socket.send_to(&reply, src).await {
                    debug!("Failed to reply to {}: {}", src, e);
                }
            }
        }
    }

    async fn run_tcp(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, client)) => {
                    let server = self.clone();
                    tokio::spawn(async move {
                        server.handle_tcp_connection(stream, client).await;
                    });
                }
                Err(e) => {
                    warn!("TCP accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    #[instrument(skip(self, stream), level = "debug")]
    async fn handle_tcp_connection(self: Arc<Self>, stream: TcpStream, client: SocketAddr) {
        let local_addr = match stream.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                debug!("TCP connection without local address: {}", e);
                return;
            }
        };

        let (mut writer, mut frames) = Framed::new(stream, TurnFrameCodec::new()).split();
        let (tx, mut rx) = mpsc::channel::<Bytes>(TCP_OUTBOUND_QUEUE);

        let write_task = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if writer.send(frame).await.is_err() {
                    break;
                }
            }
        });

        let ctx = ClientContext {
            client,
            server: local_addr,
            protocol: TransportProtocol::Tcp,
            sink: ClientSink::Stream { tx: tx.clone() },
        };

        while let Some(frame) = frames.next().await {
            match frame {
                Ok(frame) => {
                    if let Some(reply) = self.process(&frame, &ctx).await {
                        if tx.send(reply).await.is_err() {
                            break;
                        }
                    }
                }
                Err(e) => {
                    debug!("Closing TCP connection from {}: {}", client, e);
                    break;
                }
            }
        }

        // Allocations outlive the connection; their sink simply stops delivering
        write_task.abort();
        debug!("TCP connection from {} closed", client);
    }

    fn spawn_reaper(self: &Arc<Self>) -> JoinHandle<()> {
        let allocations = self.allocations.clone();
        let period = self.config.reap_interval();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                allocations.reap_expired(Instant::now()).await;
            }
        })
    }

    /// Handle one inbound datagram or stream frame
    pub async fn process(&self, data: &[u8], ctx: &ClientContext) -> Option<Bytes> {
        if ChannelData::is_channel_data(data) {
            self.process_channel_data(data, ctx).await;
            return None;
        }

        match Message::decode(data) {
            Ok(message) => self.process_stun_message(message, data, ctx).await,
            Err(e) => {
                self.stats.malformed_messages.fetch_add(1, Ordering::Relaxed);
                trace!("Dropping malformed message from {}: {}", ctx.client, e);
                None
            }
        }
    }

    async fn process_stun_message(&self, request: Message, raw: &[u8], ctx: &ClientContext) -> Option<Bytes> {
        match request.message_type.class() {
            MessageClass::Request => {}
            MessageClass::Indication => {
                if request.message_type == MessageType::SendIndication {
                    self.handle_send_indication(&request, ctx).await;
                }
                return None;
            }
            // Responses are never addressed to the server
            MessageClass::SuccessResponse | MessageClass::ErrorResponse => return None,
        }

        if !request.unknown_attributes.is_empty() {
            let err = TurnError::UnknownAttributes(request.unknown_attributes.clone());
            return self.error_response(&request, &err, None, ctx);
        }

        if request.message_type == MessageType::BindingRequest {
            return self.handle_binding_request(&request, ctx);
        }

        let auth = match self.auth.authenticate(&request, raw, ctx.client.ip()) {
            Ok(auth) => auth,
            Err(e) => {
                self.stats.auth_failures.fetch_add(1, Ordering::Relaxed);
                debug!("Authentication of {:?} from {} failed: {}", request.message_type, ctx.client, e);
                return self.error_response(&request, &e, None, ctx);
            }
        };

        let result = match request.message_type {
            MessageType::AllocateRequest => self.handle_allocate_request(&request, &auth.username, ctx).await,
            MessageType::RefreshRequest => self.handle_refresh_request(&request, ctx).await,
            MessageType::CreatePermissionRequest => self.handle_create_permission_request(&request, ctx),
            MessageType::ChannelBindRequest => self.handle_channel_bind_request(&request, ctx),
            other => Err(TurnError::BadRequest(format!("unsupported request {:?}", other))),
        };

        match result {
            Ok(response) => self.signed_response(response, &auth.key),
            Err(e) => self.error_response(&request, &e, Some(&auth.key), ctx),
        }
    }

    /// Binding: reflect the observed source address
    fn handle_binding_request(&self, request: &Message, ctx: &ClientContext) -> Option<Bytes> {
        self.stats.binding_requests.fetch_add(1, Ordering::Relaxed);

        let response = request
            .reply(MessageClass::SuccessResponse)?
            .with(AttributeType::XorMappedAddress, AttributeValue::XorMappedAddress(ctx.client))
            .with(AttributeType::Software, AttributeValue::Software(self.config.software.clone()));

        self.encode_reply(&response, None)
    }

    /// Allocate (RFC 5766 Section 6)
    #[instrument(skip(self, request, ctx), fields(client = %ctx.client), level = "debug")]
    async fn handle_allocate_request(
        &self,
        request: &Message,
        username: &str,
        ctx: &ClientContext,
    ) -> Result<Message, TurnError> {
        let transport = request
            .requested_transport()
            .ok_or_else(|| TurnError::BadRequest("missing REQUESTED-TRANSPORT".into()))?;
        if transport != TRANSPORT_UDP {
            return Err(TurnError::UnsupportedTransport(transport));
        }

        let now = Instant::now();
        let lifetime = self.granted_lifetime(request.lifetime());
        let (outcome, relay_socket) = self
            .allocations
            .create_allocation(
                AllocationRequest {
                    five_tuple: ctx.five_tuple(),
                    username: username.to_string(),
                    transaction_id: request.transaction_id,
                    lifetime,
                    sink: ctx.sink.clone(),
                },
                now,
            )
            .await?;

        let allocation = match outcome {
            AllocateOutcome::Created(allocation) => {
                if let Some(socket) = relay_socket {
                    let task = spawn_relay(allocation.clone(), socket, self.stats.clone());
                    allocation.set_relay_task(task);
                }
                allocation
            }
            AllocateOutcome::Retransmit(allocation) => allocation,
        };

        let remaining = allocation.remaining_lifetime(now).as_secs() as u32;
        self.success(request)
            .map(|response| {
                response
                    .with(
                        AttributeType::XorRelayedAddress,
                        AttributeValue::XorRelayedAddress(allocation.relay_addr),
                    )
                    .with(AttributeType::Lifetime, AttributeValue::Lifetime(remaining))
                    .with(AttributeType::XorMappedAddress, AttributeValue::XorMappedAddress(ctx.client))
            })
    }

    /// Refresh (RFC 5766 Section 7); a zero lifetime deletes the allocation
    #[instrument(skip(self, request, ctx), fields(client = %ctx.client), level = "debug")]
    async fn handle_refresh_request(&self, request: &Message, ctx: &ClientContext) -> Result<Message, TurnError> {
        let five_tuple = ctx.five_tuple();

        let granted = match request.lifetime() {
            Some(0) => {
                self.allocations.delete_allocation(&five_tuple, Instant::now()).await?;
                0
            }
            requested => {
                let lifetime = self.granted_lifetime(requested);
                self.allocations
                    .refresh_allocation(&five_tuple, lifetime, Instant::now())?;
                lifetime.as_secs() as u32
            }
        };

        self.success(request)
            .map(|response| response.with(AttributeType::Lifetime, AttributeValue::Lifetime(granted)))
    }

    /// CreatePermission (RFC 5766 Section 9)
    #[instrument(skip(self, request, ctx), fields(client = %ctx.client), level = "debug")]
    fn handle_create_permission_request(&self, request: &Message, ctx: &ClientContext) -> Result<Message, TurnError> {
        let peers = request.xor_peer_addresses();
        if peers.is_empty() {
            return Err(TurnError::BadRequest("missing XOR-PEER-ADDRESS".into()));
        }

        let allocation = self.allocation_for(ctx)?;
        let now = Instant::now();
        for peer in &peers {
            allocation.install_permission(peer.ip(), now);
        }
        debug!("Installed {} permissions on {}", peers.len(), allocation.five_tuple);

        self.success(request)
    }

    /// ChannelBind (RFC 5766 Section 11)
    #[instrument(skip(self, request, ctx), fields(client = %ctx.client), level = "debug")]
    fn handle_channel_bind_request(&self, request: &Message, ctx: &ClientContext) -> Result<Message, TurnError> {
        let number = request
            .channel_number()
            .ok_or_else(|| TurnError::BadRequest("missing CHANNEL-NUMBER".into()))?;
        let peer = request
            .xor_peer_addresses()
            .first()
            .copied()
            .ok_or_else(|| TurnError::BadRequest("missing XOR-PEER-ADDRESS".into()))?;

        let allocation = self.allocation_for(ctx)?;
        allocation.bind_channel(number, peer, Instant::now())?;
        debug!("Bound channel 0x{:04X} to {} on {}", number, peer, allocation.five_tuple);

        self.success(request)
    }

    /// Send indication: relay DATA to a permitted peer, never answered
    async fn handle_send_indication(&self, indication: &Message, ctx: &ClientContext) {
        let Some(allocation) = self.allocations.lookup(&ctx.five_tuple(), Instant::now()) else {
            trace!("Send indication from {} without allocation", ctx.client);
            return;
        };
        let (Some(peer), Some(data)) = (indication.xor_peer_addresses().first().copied(), indication.data())
        else {
            trace!("Send indication from {} missing peer or data", ctx.client);
            return;
        };

        self.relay_to_peer(&allocation, peer, data).await;
    }

    /// ChannelData from the client
    async fn process_channel_data(&self, data: &[u8], ctx: &ClientContext) {
        let Some(frame) = ChannelData::decode(data) else {
            self.stats.malformed_messages.fetch_add(1, Ordering::Relaxed);
            return;
        };
        let Some(allocation) = self.allocations.lookup(&ctx.five_tuple(), Instant::now()) else {
            trace!("ChannelData from {} without allocation", ctx.client);
            return;
        };
        let Some(peer) = allocation.channel_peer(frame.number, Instant::now()) else {
            trace!("ChannelData on unbound channel 0x{:04X}", frame.number);
            return;
        };

        self.relay_to_peer(&allocation, peer, &frame.data).await;
    }

    async fn relay_to_peer(&self, allocation: &Allocation, peer: SocketAddr, data: &[u8]) {
        if !allocation.has_permission(peer.ip(), Instant::now()) {
            self.stats.dropped_no_permission.fetch_add(1, Ordering::Relaxed);
            debug!("{}", TurnError::Forbidden(peer.ip()));
            return;
        }
        let Some(socket) = allocation.relay_socket() else {
            return;
        };

        match socket.send_to(data, peer).await {
            Ok(sent) => {
                allocation.stats.packets_to_peer.fetch_add(1, Ordering::Relaxed);
                allocation.stats.bytes_to_peer.fetch_add(sent as u64, Ordering::Relaxed);
                self.stats.packets_to_peers.fetch_add(1, Ordering::Relaxed);
                self.stats.bytes_to_peers.fetch_add(sent as u64, Ordering::Relaxed);
            }
            Err(e) => debug!("Relay to {} failed: {}", peer, e),
        }
    }

    fn allocation_for(&self, ctx: &ClientContext) -> Result<Arc<Allocation>, TurnError> {
        self.allocations
            .lookup(&ctx.five_tuple(), Instant::now())
            .ok_or(TurnError::AllocationMismatch(ctx.client))
    }

    /// Requested lifetime, defaulted and clamped to the server maximum
    fn granted_lifetime(&self, requested: Option<u32>) -> Duration {
        requested
            .filter(|secs| *secs > 0)
            .map(|secs| Duration::from_secs(u64::from(secs)))
            .unwrap_or_else(|| self.config.default_lifetime())
            .min(self.config.max_lifetime())
    }

    fn success(&self, request: &Message) -> Result<Message, TurnError> {
        request
            .reply(MessageClass::SuccessResponse)
            .ok_or_else(|| TurnError::ServerError(format!("no response type for {:?}", request.message_type)))
    }

    fn signed_response(&self, response: Message, key: &[u8]) -> Option<Bytes> {
        let response = response.with(AttributeType::Software, AttributeValue::Software(self.config.software.clone()));
        self.encode_reply(&response, Some(key))
    }

    /// Error response; challenges carry REALM and a fresh NONCE
    fn error_response(
        &self,
        request: &Message,
        err: &TurnError,
        key: Option<&[u8]>,
        ctx: &ClientContext,
    ) -> Option<Bytes> {
        let (code, reason) = err.error_code();
        let mut response = request
            .reply(MessageClass::ErrorResponse)?
            .with(AttributeType::ErrorCode, AttributeValue::ErrorCode { code, reason: reason.to_string() });

        if let TurnError::UnknownAttributes(types) = err {
            response.add_attribute(Attribute::new(
                AttributeType::UnknownAttributes,
                AttributeValue::UnknownAttributes(types.clone()),
            ));
        }
        if err.needs_challenge() {
            let nonce = self.auth.challenge_nonce(ctx.client.ip());
            response = response
                .with(AttributeType::Realm, AttributeValue::Realm(self.auth.realm().to_string()))
                .with(AttributeType::Nonce, AttributeValue::Nonce(nonce.into_bytes()));
        }
        response = response.with(AttributeType::Software, AttributeValue::Software(self.config.software.clone()));

        debug!("{:?} from {} -> {} {}", request.message_type, ctx.client, code, err);
        self.encode_reply(&response, key)
    }

    fn encode_reply(&self, response: &Message, key: Option<&[u8]>) -> Option<Bytes> {
        match response.encode(key, true) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                error!("Failed to encode {:?}: {}", response.message_type, e);
                None
            }
        }
    }
}

/// Start the task relaying peer datagrams on `socket` back to the client
fn spawn_relay(allocation: Arc<Allocation>, socket: Arc<UdpSocket>, stats: Arc<TurnStats>) -> JoinHandle<()> {
    tokio::spawn(async move {
        relay_loop(allocation, socket, stats).await;
    })
}

async fn relay_loop(allocation: Arc<Allocation>, socket: Arc<UdpSocket>, stats: Arc<TurnStats>) {
    let mut buf = vec![0u8; MAX_MESSAGE_SIZE];
    let stream = allocation.sink.is_stream();

    loop {
        let (len, peer) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                debug!("Relay socket {} receive error: {}", allocation.relay_addr, e);
                continue;
            }
        };

        let channel = match allocation.admit_from_peer(peer, Instant::now()) {
            Some(channel) => channel,
            None => {
                stats.dropped_no_permission.fetch_add(1, Ordering::Relaxed);
                trace!("Dropping datagram from {} without permission", peer);
                continue;
            }
        };

        let payload = Bytes::copy_from_slice(&buf[..len]);
        let frame = match channel {
            Some(number) => ChannelData::new(number, payload).encode(stream),
            None => {
                let indication = Message::new(MessageType::DataIndication, TransactionId::new())
                    .with(AttributeType::XorPeerAddress, AttributeValue::XorPeerAddress(peer))
                    .with(AttributeType::Data, AttributeValue::Data(payload));
                match indication.encode(None, false) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        warn!("Failed to encode Data indication: {}", e);
                        continue;
                    }
                }
            }
        };

        match allocation.sink.send(frame).await {
            Ok(()) => {
                allocation.stats.packets_to_client.fetch_add(1, Ordering::Relaxed);
                allocation.stats.bytes_to_client.fetch_add(len as u64, Ordering::Relaxed);
                stats.packets_to_clients.fetch_add(1, Ordering::Relaxed);
                stats.bytes_to_clients.fetch_add(len as u64, Ordering::Relaxed);
            }
            Err(e) => trace!("Delivery to {} failed: {}", allocation.five_tuple, e),
        }
    }
}
