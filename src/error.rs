// src/error.rs
//! Error taxonomy for the gateway.
//!
//! Protocol-level failures of the TURN engine carry their STUN error code so
//! request handlers can turn them into error responses directly; signaling
//! failures carry the reason string sent back in an `error` envelope.

use std::io;
use std::net::{IpAddr, SocketAddr};
use thiserror::Error;

/// Top-level error type
#[derive(Debug, Error)]
pub enum GatewayError {
    /// STUN wire-format errors
    #[error("STUN error: {0}")]
    Stun(#[from] StunError),

    /// TURN protocol errors
    #[error("TURN error: {0}")]
    Turn(#[from] TurnError),

    /// Credential issuing / verification errors
    #[error("Credential error: {0}")]
    Credential(#[from] CredentialError),

    /// Signaling hub errors
    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),

    /// Network I/O errors
    #[error("Network I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON (de)serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration file could not be parsed
    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// Configuration is semantically invalid
    #[error("Configuration error: {0}")]
    Configuration(String),
}

/// Result alias used across the crate
pub type GatewayResult<T> = Result<T, GatewayError>;

/// STUN message format errors (RFC 5389).
///
/// Every variant means the datagram is garbage from the protocol's point of
/// view; the engine drops such input without replying.
#[derive(Debug, Error)]
pub enum StunError {
    /// Invalid magic cookie
    #[error("Invalid magic cookie: expected 0x2112A442, got 0x{0:08X}")]
    InvalidMagicCookie(u32),

    /// Message shorter than the fixed header
    #[error("Message too short: {0} bytes")]
    TooShort(usize),

    /// Declared length does not fit the datagram
    #[error("Declared length {declared} exceeds available {available} bytes")]
    LengthMismatch { declared: usize, available: usize },

    /// Message parsing error
    #[error("Failed to parse STUN message: {0}")]
    ParseError(String),

    /// Attribute parsing error
    #[error("Failed to parse attribute 0x{attr_type:04X}: {reason}")]
    AttributeParseError { attr_type: u16, reason: String },

    /// Missing required attribute
    #[error("Missing required attribute: {0}")]
    MissingAttribute(&'static str),

    /// Fingerprint mismatch
    #[error("FINGERPRINT check failed")]
    FingerprintCheckFailed,

    /// Invalid address family
    #[error("Invalid address family: {0}")]
    InvalidAddressFamily(u8),

    /// Unknown method/class combination
    #[error("Unknown message type: 0x{0:04X}")]
    UnknownMessageType(u16),

    /// HMAC could not be initialised
    #[error("Cryptographic error: {0}")]
    CryptographicError(String),
}

/// TURN request failures, each mapped onto a STUN error response.
#[derive(Debug, Error)]
pub enum TurnError {
    /// Request is malformed at the TURN level
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Missing or wrong credentials
    #[error("Unauthenticated: {0}")]
    Unauthenticated(String),

    /// Credential username decodes to an expiry in the past
    #[error("Credential expired")]
    ExpiredCredential,

    /// Nonce is unknown, expired, or bound to another client
    #[error("Stale nonce")]
    StaleNonce,

    /// Peer address not permitted
    #[error("Forbidden: no permission for {0}")]
    Forbidden(IpAddr),

    /// Request carries unknown comprehension-required attributes
    #[error("Unknown comprehension-required attributes: {0:?}")]
    UnknownAttributes(Vec<u16>),

    /// 5-tuple already holds an allocation, or holds none when one is needed
    #[error("Allocation mismatch for {0}")]
    AllocationMismatch(SocketAddr),

    /// Requested transport protocol is not relayed
    #[error("Unsupported transport protocol {0}")]
    UnsupportedTransport(u8),

    /// Quota or relay port exhaustion
    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    /// Channel number or peer already bound differently
    #[error("Channel binding conflict: {0}")]
    ChannelBindingConflict(String),

    /// Unexpected server-side failure
    #[error("Server error: {0}")]
    ServerError(String),
}

impl TurnError {
    /// STUN error code and reason phrase for the error response
    pub fn error_code(&self) -> (u16, &'static str) {
        match self {
            TurnError::BadRequest(_) => (400, "Bad Request"),
            TurnError::ChannelBindingConflict(_) => (400, "Bad Request"),
            TurnError::Unauthenticated(_) => (401, "Unauthorized"),
            TurnError::Forbidden(_) => (403, "Forbidden"),
            TurnError::UnknownAttributes(_) => (420, "Unknown Attribute"),
            TurnError::AllocationMismatch(_) => (437, "Allocation Mismatch"),
            TurnError::ExpiredCredential => (438, "Stale Credential"),
            TurnError::StaleNonce => (438, "Stale Nonce"),
            TurnError::UnsupportedTransport(_) => (442, "Unsupported Transport Protocol"),
            TurnError::QuotaExceeded(_) => (486, "Allocation Quota Reached"),
            TurnError::ServerError(_) => (500, "Server Error"),
        }
    }

    /// Whether the response should carry a fresh REALM/NONCE challenge
    pub fn needs_challenge(&self) -> bool {
        matches!(
            self,
            TurnError::Unauthenticated(_) | TurnError::ExpiredCredential | TurnError::StaleNonce
        )
    }
}

impl From<CredentialError> for TurnError {
    fn from(err: CredentialError) -> Self {
        match err {
            CredentialError::ExpiredCredential { .. } => TurnError::ExpiredCredential,
            other => TurnError::Unauthenticated(other.to_string()),
        }
    }
}

/// Credential issuer errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CredentialError {
    /// Username does not start with `<expiry>:`
    #[error("Invalid credential username: {0}")]
    InvalidCredential(String),

    /// Username expiry lies in the past
    #[error("Credential expired at {expiry} (now {now})")]
    ExpiredCredential { expiry: i64, now: i64 },

    /// Supplied password does not match
    #[error("Credential password mismatch")]
    PasswordMismatch,

    /// Label or ttl rejected at issue time
    #[error("Invalid credential request: {0}")]
    InvalidRequest(String),
}

/// Signaling hub errors. Except for `MalformedEnvelope`, all of them are
/// reported to the client and leave the connection open.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SignalingError {
    /// Target peer is not registered
    #[error("Peer {0} not found")]
    PeerNotFound(String),

    /// Connection sent a routed message before `new`
    #[error("Peer not registered on this connection")]
    NotRegistered,

    /// Connection already registered a peer
    #[error("Connection already registered as {0}")]
    AlreadyRegistered(String),

    /// Another connection owns this peer id
    #[error("Peer id {0} is already in use")]
    DuplicatePeerId(String),

    /// Target (or sender) is negotiating another session
    #[error("Peer {0} is busy in another session")]
    PeerBusy(String),

    /// `bye` without a matching active session
    #[error("No active session {0}")]
    NoActiveSession(String),

    /// Required field absent from `data`
    #[error("Missing field {0}")]
    MissingField(&'static str),

    /// Envelope is not valid JSON or has an unknown type; closes the connection
    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),
}

impl SignalingError {
    /// Reason code placed in the `error` envelope
    pub fn code(&self) -> &'static str {
        match self {
            SignalingError::PeerNotFound(_) => "PeerNotFound",
            SignalingError::NotRegistered => "NotRegistered",
            SignalingError::AlreadyRegistered(_) => "AlreadyRegistered",
            SignalingError::DuplicatePeerId(_) => "DuplicatePeerId",
            SignalingError::PeerBusy(_) => "PeerBusy",
            SignalingError::NoActiveSession(_) => "NoActiveSession",
            SignalingError::MissingField(_) => "MissingField",
            SignalingError::MalformedEnvelope(_) => "MalformedEnvelope",
        }
    }

    /// Whether this error terminates the connection
    pub fn is_fatal(&self) -> bool {
        matches!(self, SignalingError::MalformedEnvelope(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_turn_error_codes() {
        let addr: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        assert_eq!(TurnError::AllocationMismatch(addr).error_code().0, 437);
        assert_eq!(TurnError::QuotaExceeded("ports".into()).error_code().0, 486);
        assert_eq!(TurnError::ChannelBindingConflict("x".into()).error_code().0, 400);
        assert_eq!(TurnError::Unauthenticated("x".into()).error_code().0, 401);
        assert_eq!(TurnError::ExpiredCredential.error_code().0, 438);
    }

    #[test]
    fn test_credential_error_maps_to_turn_error() {
        let expired: TurnError = CredentialError::ExpiredCredential { expiry: 1, now: 2 }.into();
        assert!(matches!(expired, TurnError::ExpiredCredential));

        let invalid: TurnError = CredentialError::InvalidCredential("bob".into()).into();
        assert!(matches!(invalid, TurnError::Unauthenticated(_)));
        assert!(invalid.needs_challenge());
    }

    #[test]
    fn test_signaling_error_fatality() {
        assert!(SignalingError::MalformedEnvelope("x".into()).is_fatal());
        assert!(!SignalingError::PeerNotFound("b".into()).is_fatal());
        assert_eq!(SignalingError::PeerNotFound("b".into()).code(), "PeerNotFound");
    }
}
