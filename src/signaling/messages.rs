// src/signaling/messages.rs
//! Signaling envelopes
//!
//! Every frame is a JSON object `{"type": ..., "data": ...}`. Inbound frames
//! are parsed into [`Request`]; negotiation payloads stay opaque JSON so they
//! are forwarded unmodified. Outbound frames are [`Outbound`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SignalingError;

/// Peer as advertised in `new` and in `peers` lists
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub user_agent: String,
}

/// Raw inbound envelope
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
}

/// Negotiation message kinds routed between two peers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationKind {
    Offer,
    Answer,
    Candidate,
}

impl NegotiationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NegotiationKind::Offer => "offer",
            NegotiationKind::Answer => "answer",
            NegotiationKind::Candidate => "candidate",
        }
    }
}

/// Parsed inbound message
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    New(PeerInfo),
    Negotiation(NegotiationKind, Value),
    Bye(Value),
    Leave,
    Keepalive,
}

impl Request {
    /// Parse a text frame. Anything that is not a known envelope is
    /// `MalformedEnvelope`.
    pub fn parse(text: &str) -> Result<Self, SignalingError> {
        let envelope: Envelope =
            serde_json::from_str(text).map_err(|e| SignalingError::MalformedEnvelope(e.to_string()))?;

        match envelope.kind.as_str() {
            "new" => {
                let info = if envelope.data.is_null() {
                    PeerInfo {
                        id: String::new(),
                        name: String::new(),
                        user_agent: String::new(),
                    }
                } else {
                    serde_json::from_value(envelope.data)
                        .map_err(|e| SignalingError::MalformedEnvelope(e.to_string()))?
                };
                Ok(Request::New(info))
            }
            "offer" => Ok(Request::Negotiation(NegotiationKind::Offer, envelope.data)),
            "answer" => Ok(Request::Negotiation(NegotiationKind::Answer, envelope.data)),
            "candidate" => Ok(Request::Negotiation(NegotiationKind::Candidate, envelope.data)),
            "bye" => Ok(Request::Bye(envelope.data)),
            "leave" => Ok(Request::Leave),
            "keepalive" => Ok(Request::Keepalive),
            other => Err(SignalingError::MalformedEnvelope(format!("unknown type {}", other))),
        }
    }

    /// Envelope type, echoed in `error` replies
    pub fn kind(&self) -> &'static str {
        match self {
            Request::New(_) => "new",
            Request::Negotiation(kind, _) => kind.as_str(),
            Request::Bye(_) => "bye",
            Request::Leave => "leave",
            Request::Keepalive => "keepalive",
        }
    }
}

/// String field of a negotiation payload
pub fn required_str<'a>(data: &'a Value, field: &'static str) -> Result<&'a str, SignalingError> {
    data.get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or(SignalingError::MissingField(field))
}

/// Body of `bye`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bye {
    pub session_id: String,
    pub from: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
}

/// Body of `error`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReply {
    pub request: String,
    pub reason: String,
}

/// Messages sent by the hub
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum Outbound {
    Peers(Vec<PeerInfo>),
    Offer(Value),
    Answer(Value),
    Candidate(Value),
    Bye(Bye),
    Leave(String),
    Keepalive {},
    Error(ErrorReply),
}

impl Outbound {
    pub fn negotiation(kind: NegotiationKind, data: Value) -> Self {
        match kind {
            NegotiationKind::Offer => Outbound::Offer(data),
            NegotiationKind::Answer => Outbound::Answer(data),
            NegotiationKind::Candidate => Outbound::Candidate(data),
        }
    }

    pub fn error(request: &str, err: &SignalingError) -> Self {
        Outbound::Error(ErrorReply {
            request: request.to_string(),
            reason: err.code().to_string(),
        })
    }
}
