// src/turn/mod.rs
//! TURN relay (RFC 5766).
//!
//! The engine in [`server`] is transport agnostic: UDP datagrams and TCP
//! frames are both fed through [`TurnServer::process`], and replies towards
//! the client go out through the [`ClientSink`] recorded on each allocation.

pub mod allocation_manager;
pub mod auth;
pub mod channel_data;
pub mod codec;
pub mod relay_pool;
pub mod server;

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

pub use allocation_manager::{AllocateOutcome, Allocation, AllocationManager, AllocationRequest};
pub use auth::{AuthContext, TurnAuthenticator};
pub use channel_data::ChannelData;
pub use codec::TurnFrameCodec;
pub use relay_pool::RelayPortPool;
pub use server::{ClientContext, TurnListeners, TurnServer};

/// Lifetime of a permission (RFC 5766 Section 8)
pub const PERMISSION_LIFETIME: Duration = Duration::from_secs(300);

/// Lifetime of a channel binding (RFC 5766 Section 11)
pub const CHANNEL_BINDING_LIFETIME: Duration = Duration::from_secs(600);

/// Valid channel number range
pub const CHANNEL_NUMBER_MIN: u16 = 0x4000;
pub const CHANNEL_NUMBER_MAX: u16 = 0x7FFE;

/// IANA protocol number for UDP in REQUESTED-TRANSPORT
pub const TRANSPORT_UDP: u8 = 17;

/// Client-to-server transport of a 5-tuple
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportProtocol {
    Udp,
    Tcp,
}

impl fmt::Display for TransportProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportProtocol::Udp => write!(f, "udp"),
            TransportProtocol::Tcp => write!(f, "tcp"),
        }
    }
}

/// Client 5-tuple identifying an allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FiveTuple {
    pub client: SocketAddr,
    pub server: SocketAddr,
    pub protocol: TransportProtocol,
}

impl fmt::Display for FiveTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}->{}", self.protocol, self.client, self.server)
    }
}

/// Path back to the client that owns an allocation
#[derive(Debug, Clone)]
pub enum ClientSink {
    /// Datagrams sent from the listening socket
    Udp { socket: Arc<UdpSocket>, client: SocketAddr },
    /// Frames queued for the connection's writer task
    Stream { tx: mpsc::Sender<Bytes> },
}

impl ClientSink {
    pub async fn send(&self, data: Bytes) -> io::Result<()> {
        match self {
            ClientSink::Udp { socket, client } => socket.send_to(&data, *client).await.map(|_| ()),
            ClientSink::Stream { tx } => tx
                .send(data)
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "client stream closed")),
        }
    }

    /// ChannelData must be padded to 4 bytes on stream transports
    pub fn is_stream(&self) -> bool {
        matches!(self, ClientSink::Stream { .. })
    }
}

/// Server-wide counters
#[derive(Debug, Default)]
pub struct TurnStats {
    pub binding_requests: AtomicU64,
    pub allocations_created: AtomicU64,
    pub allocations_deleted: AtomicU64,
    pub allocations_expired: AtomicU64,
    pub auth_failures: AtomicU64,
    pub malformed_messages: AtomicU64,
    pub packets_to_peers: AtomicU64,
    pub bytes_to_peers: AtomicU64,
    pub packets_to_clients: AtomicU64,
    pub bytes_to_clients: AtomicU64,
    pub dropped_no_permission: AtomicU64,
}

/// Point-in-time copy of [`TurnStats`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TurnStatsSnapshot {
    pub binding_requests: u64,
    pub allocations_created: u64,
    pub allocations_deleted: u64,
    pub allocations_expired: u64,
    pub auth_failures: u64,
    pub malformed_messages: u64,
    pub packets_to_peers: u64,
    pub bytes_to_peers: u64,
    pub packets_to_clients: u64,
    pub bytes_to_clients: u64,
    pub dropped_no_permission: u64,
}

impl TurnStats {
    pub fn snapshot(&self) -> TurnStatsSnapshot {
        TurnStatsSnapshot {
            binding_requests: self.binding_requests.load(Ordering::Relaxed),
            allocations_created: self.allocations_created.load(Ordering::Relaxed),
            allocations_deleted: self.allocations_deleted.load(Ordering::Relaxed),
            allocations_expired: self.allocations_expired.load(Ordering::Relaxed),
            auth_failures: self.auth_failures.load(Ordering::Relaxed),
            malformed_messages: self.malformed_messages.load(Ordering::Relaxed),
            packets_to_peers: self.packets_to_peers.load(Ordering::Relaxed),
            bytes_to_peers: self.bytes_to_peers.load(Ordering::Relaxed),
            packets_to_clients: self.packets_to_clients.load(Ordering::Relaxed),
            bytes_to_clients: self.bytes_to_clients.load(Ordering::Relaxed),
            dropped_no_permission: self.dropped_no_permission.load(Ordering::Relaxed),
        }
    }
}

/// Whether `number` is a valid channel number
pub fn is_valid_channel_number(number: u16) -> bool {
    (CHANNEL_NUMBER_MIN..=CHANNEL_NUMBER_MAX).contains(&number)
}
