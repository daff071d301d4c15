// src/stun/mod.rs
//! STUN wire format and long-term credential primitives

pub mod auth;
pub mod protocol;

pub use auth::{constant_time_eq, long_term_key, NonceManager};
pub use protocol::{
    Attribute, AttributeType, AttributeValue, Message, MessageClass, MessageType, TransactionId,
    HEADER_SIZE, MAGIC_COOKIE,
};
