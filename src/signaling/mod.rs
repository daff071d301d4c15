// src/signaling/mod.rs
//! Signaling hub: peer registry and two-party negotiation routing over
//! WebSocket connections.

pub mod connection;
pub mod hub;
pub mod messages;

pub use connection::{serve_socket, ConnectionGuard};
pub use hub::{ConnectionId, Flow, PeerSender, SignalingHub};
pub use messages::{Bye, ErrorReply, NegotiationKind, Outbound, PeerInfo, Request};
