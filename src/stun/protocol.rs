// src/stun/protocol.rs
//! STUN message codec (RFC 5389) with the TURN attributes of RFC 5766

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use crc::{Crc, CRC_32_ISO_HDLC};
use rand::rngs::OsRng;
use rand::RngCore;

use super::auth::{compute_message_integrity_sha1, verify_message_integrity_sha1};
use crate::error::StunError;

/// STUN magic cookie
pub const MAGIC_COOKIE: u32 = 0x2112A442;

/// STUN header size (20 bytes)
pub const HEADER_SIZE: usize = 20;

/// Maximum STUN message size
pub const MAX_MESSAGE_SIZE: usize = 65536;

/// HMAC-SHA1 output length carried by MESSAGE-INTEGRITY
pub const MESSAGE_INTEGRITY_SIZE: usize = 20;

/// XOR constant applied to the FINGERPRINT CRC
pub const FINGERPRINT_XOR: u32 = 0x5354554E;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// STUN/TURN methods
pub const METHOD_BINDING: u16 = 0x001;
pub const METHOD_ALLOCATE: u16 = 0x003;
pub const METHOD_REFRESH: u16 = 0x004;
pub const METHOD_SEND: u16 = 0x006;
pub const METHOD_DATA: u16 = 0x007;
pub const METHOD_CREATE_PERMISSION: u16 = 0x008;
pub const METHOD_CHANNEL_BIND: u16 = 0x009;

/// STUN message types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MessageType {
    // Binding
    BindingRequest = 0x0001,
    BindingIndication = 0x0011,
    BindingResponse = 0x0101,
    BindingError = 0x0111,

    // Allocate (TURN)
    AllocateRequest = 0x0003,
    AllocateResponse = 0x0103,
    AllocateError = 0x0113,

    // Refresh (TURN)
    RefreshRequest = 0x0004,
    RefreshResponse = 0x0104,
    RefreshError = 0x0114,

    // Send (TURN)
    SendIndication = 0x0016,

    // Data (TURN)
    DataIndication = 0x0017,

    // CreatePermission (TURN)
    CreatePermissionRequest = 0x0008,
    CreatePermissionResponse = 0x0108,
    CreatePermissionError = 0x0118,

    // ChannelBind (TURN)
    ChannelBindRequest = 0x0009,
    ChannelBindResponse = 0x0109,
    ChannelBindError = 0x0119,
}

impl MessageType {
    /// Get message class (request, indication, response, error)
    pub fn class(&self) -> MessageClass {
        class_from_bits(*self as u16)
    }

    /// Get message method
    pub fn method(&self) -> u16 {
        method_from_bits(*self as u16)
    }

    /// Create from method and class
    pub fn from_method_class(method: u16, class: MessageClass) -> Option<Self> {
        if method > 0x0FFF {
            return None;
        }

        let m0 = method & 0x000F;
        let m1 = (method & 0x0070) << 1;
        let m2 = (method & 0x0F80) << 2;

        let class_bits = match class {
            MessageClass::Request => 0x0000,
            MessageClass::Indication => 0x0010,
            MessageClass::SuccessResponse => 0x0100,
            MessageClass::ErrorResponse => 0x0110,
        };

        Self::from_u16(m0 | m1 | m2 | class_bits)
    }

    fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x0001 => Some(Self::BindingRequest),
            0x0011 => Some(Self::BindingIndication),
            0x0101 => Some(Self::BindingResponse),
            0x0111 => Some(Self::BindingError),
            0x0003 => Some(Self::AllocateRequest),
            0x0103 => Some(Self::AllocateResponse),
            0x0113 => Some(Self::AllocateError),
            0x0004 => Some(Self::RefreshRequest),
            0x0104 => Some(Self::RefreshResponse),
            0x0114 => Some(Self::RefreshError),
            0x0016 => Some(Self::SendIndication),
            0x0017 => Some(Self::DataIndication),
            0x0008 => Some(Self::CreatePermissionRequest),
            0x0108 => Some(Self::CreatePermissionResponse),
            0x0118 => Some(Self::CreatePermissionError),
            0x0009 => Some(Self::ChannelBindRequest),
            0x0109 => Some(Self::ChannelBindResponse),
            0x0119 => Some(Self::ChannelBindError),
            _ => None,
        }
    }
}

fn class_from_bits(value: u16) -> MessageClass {
    match value & 0x0110 {
        0x0000 => MessageClass::Request,
        0x0010 => MessageClass::Indication,
        0x0100 => MessageClass::SuccessResponse,
        _ => MessageClass::ErrorResponse,
    }
}

fn method_from_bits(value: u16) -> u16 {
    (value & 0x000F) | ((value & 0x00E0) >> 1) | ((value & 0x3E00) >> 2)
}

/// STUN message class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageClass {
    Request,
    Indication,
    SuccessResponse,
    ErrorResponse,
}

/// STUN attribute types understood by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum AttributeType {
    // Comprehension-required (0x0000-0x7FFF)
    MappedAddress = 0x0001,
    Username = 0x0006,
    MessageIntegrity = 0x0008,
    ErrorCode = 0x0009,
    UnknownAttributes = 0x000A,
    Realm = 0x0014,
    Nonce = 0x0015,
    XorMappedAddress = 0x0020,

    // TURN attributes
    ChannelNumber = 0x000C,
    Lifetime = 0x000D,
    XorPeerAddress = 0x0012,
    Data = 0x0013,
    XorRelayedAddress = 0x0016,
    RequestedTransport = 0x0019,
    DontFragment = 0x001A,

    // Comprehension-optional (0x8000-0xFFFF)
    Software = 0x8022,
    Fingerprint = 0x8028,
}

impl AttributeType {
    /// Check if attribute is comprehension-required
    pub fn is_comprehension_required(&self) -> bool {
        (*self as u16) < 0x8000
    }

    fn from_u16(value: u16) -> Option<Self> {
        let attr_type = match value {
            0x0001 => Self::MappedAddress,
            0x0006 => Self::Username,
            0x0008 => Self::MessageIntegrity,
            0x0009 => Self::ErrorCode,
            0x000A => Self::UnknownAttributes,
            0x0014 => Self::Realm,
            0x0015 => Self::Nonce,
            0x0020 => Self::XorMappedAddress,
            0x000C => Self::ChannelNumber,
            0x000D => Self::Lifetime,
            0x0012 => Self::XorPeerAddress,
            0x0013 => Self::Data,
            0x0016 => Self::XorRelayedAddress,
            0x0019 => Self::RequestedTransport,
            0x001A => Self::DontFragment,
            0x8022 => Self::Software,
            0x8028 => Self::Fingerprint,
            _ => return None,
        };
        Some(attr_type)
    }
}

/// STUN transaction ID (96 bits)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionId([u8; 12]);

impl TransactionId {
    /// Generate new random transaction ID with cryptographically secure RNG
    pub fn new() -> Self {
        let mut id = [0u8; 12];
        OsRng.fill_bytes(&mut id);
        Self(id)
    }

    /// Create from bytes
    pub fn from_bytes(bytes: [u8; 12]) -> Self {
        Self(bytes)
    }

    /// Get as bytes
    pub fn as_bytes(&self) -> &[u8; 12] {
        &self.0
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

/// Quick check used to demultiplex STUN from ChannelData on a shared port
pub fn looks_like_stun(data: &[u8]) -> bool {
    data.len() >= HEADER_SIZE
        && data[0] & 0xC0 == 0
        && u32::from_be_bytes([data[4], data[5], data[6], data[7]]) == MAGIC_COOKIE
}

/// STUN message
#[derive(Debug, Clone)]
pub struct Message {
    pub message_type: MessageType,
    pub transaction_id: TransactionId,
    pub attributes: Vec<Attribute>,
    /// Comprehension-required attribute types the decoder did not understand
    pub unknown_attributes: Vec<u16>,
}

impl Message {
    /// Create new STUN message
    pub fn new(message_type: MessageType, transaction_id: TransactionId) -> Self {
        Self {
            message_type,
            transaction_id,
            attributes: Vec::new(),
            unknown_attributes: Vec::new(),
        }
    }

    /// Start a response to this message with the same method and transaction id
    pub fn reply(&self, class: MessageClass) -> Option<Message> {
        MessageType::from_method_class(self.message_type.method(), class)
            .map(|message_type| Message::new(message_type, self.transaction_id))
    }

    /// Add attribute to message
    pub fn add_attribute(&mut self, attribute: Attribute) {
        self.attributes.push(attribute);
    }

    /// Builder-style variant of [`Message::add_attribute`]
    pub fn with(mut self, attr_type: AttributeType, value: AttributeValue) -> Self {
        self.attributes.push(Attribute::new(attr_type, value));
        self
    }

    /// Get attribute by type
    pub fn get_attribute(&self, attr_type: AttributeType) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.attr_type == attr_type)
    }

    /// Get all attributes of a type
    pub fn get_attributes(&self, attr_type: AttributeType) -> Vec<&Attribute> {
        self.attributes.iter().filter(|a| a.attr_type == attr_type).collect()
    }

    pub fn has_attribute(&self, attr_type: AttributeType) -> bool {
        self.get_attribute(attr_type).is_some()
    }

    pub fn username(&self) -> Option<&str> {
        match self.get_attribute(AttributeType::Username).map(|a| &a.value) {
            Some(AttributeValue::Username(name)) => Some(name),
            _ => None,
        }
    }

    pub fn realm(&self) -> Option<&str> {
        match self.get_attribute(AttributeType::Realm).map(|a| &a.value) {
            Some(AttributeValue::Realm(realm)) => Some(realm),
            _ => None,
        }
    }

    pub fn nonce(&self) -> Option<&[u8]> {
        match self.get_attribute(AttributeType::Nonce).map(|a| &a.value) {
            Some(AttributeValue::Nonce(nonce)) => Some(nonce),
            _ => None,
        }
    }

    /// LIFETIME in seconds
    pub fn lifetime(&self) -> Option<u32> {
        match self.get_attribute(AttributeType::Lifetime).map(|a| &a.value) {
            Some(AttributeValue::Lifetime(secs)) => Some(*secs),
            _ => None,
        }
    }

    pub fn channel_number(&self) -> Option<u16> {
        match self.get_attribute(AttributeType::ChannelNumber).map(|a| &a.value) {
            Some(AttributeValue::ChannelNumber(number)) => Some(*number),
            _ => None,
        }
    }

    /// Protocol number from REQUESTED-TRANSPORT
    pub fn requested_transport(&self) -> Option<u8> {
        match self.get_attribute(AttributeType::RequestedTransport).map(|a| &a.value) {
            Some(AttributeValue::RequestedTransport(protocol)) => Some(*protocol),
            _ => None,
        }
    }

    pub fn data(&self) -> Option<&Bytes> {
        match self.get_attribute(AttributeType::Data).map(|a| &a.value) {
            Some(AttributeValue::Data(data)) => Some(data),
            _ => None,
        }
    }

    /// Every XOR-PEER-ADDRESS in order of appearance
    pub fn xor_peer_addresses(&self) -> Vec<SocketAddr> {
        self.attributes
            .iter()
            .filter_map(|a| match a.value {
                AttributeValue::XorPeerAddress(addr) => Some(addr),
                _ => None,
            })
            .collect()
    }

    pub fn xor_mapped_address(&self) -> Option<SocketAddr> {
        match self.get_attribute(AttributeType::XorMappedAddress).map(|a| &a.value) {
            Some(AttributeValue::XorMappedAddress(addr)) => Some(*addr),
            _ => None,
        }
    }

    pub fn xor_relayed_address(&self) -> Option<SocketAddr> {
        match self.get_attribute(AttributeType::XorRelayedAddress).map(|a| &a.value) {
            Some(AttributeValue::XorRelayedAddress(addr)) => Some(*addr),
            _ => None,
        }
    }

    /// ERROR-CODE as (code, reason)
    pub fn error_code(&self) -> Option<(u16, &str)> {
        match self.get_attribute(AttributeType::ErrorCode).map(|a| &a.value) {
            Some(AttributeValue::ErrorCode { code, reason }) => Some((*code, reason.as_str())),
            _ => None,
        }
    }

    /// Encode message to bytes, appending MESSAGE-INTEGRITY when a key is
    /// given and FINGERPRINT when requested
    pub fn encode(&self, integrity_key: Option<&[u8]>, fingerprint: bool) -> Result<Bytes, StunError> {
        let mut buf = BytesMut::with_capacity(512);

        buf.put_u16(self.message_type as u16);
        buf.put_u16(0); // Message length (will be set later)
        buf.put_u32(MAGIC_COOKIE);
        buf.put_slice(self.transaction_id.as_bytes());

        for attr in &self.attributes {
            // Integrity and fingerprint are computed below
            if matches!(attr.attr_type, AttributeType::MessageIntegrity | AttributeType::Fingerprint) {
                continue;
            }
            attr.encode(&mut buf, &self.transaction_id);
        }

        if let Some(key) = integrity_key {
            // Length must already account for the integrity attribute
            let msg_len = buf.len() - HEADER_SIZE + 4 + MESSAGE_INTEGRITY_SIZE;
            set_length(&mut buf, msg_len)?;

            let mac = compute_message_integrity_sha1(&buf, key)?;
            buf.put_u16(AttributeType::MessageIntegrity as u16);
            buf.put_u16(MESSAGE_INTEGRITY_SIZE as u16);
            buf.put_slice(&mac);
        }

        if fingerprint {
            let msg_len = buf.len() - HEADER_SIZE + 8;
            set_length(&mut buf, msg_len)?;

            let checksum = CRC32.checksum(&buf) ^ FINGERPRINT_XOR;
            buf.put_u16(AttributeType::Fingerprint as u16);
            buf.put_u16(4);
            buf.put_u32(checksum);
        }

        let msg_len = buf.len() - HEADER_SIZE;
        set_length(&mut buf, msg_len)?;

        Ok(buf.freeze())
    }

    /// Decode a message. Trailing bytes past the declared length are ignored;
    /// a FINGERPRINT, when present, must be valid.
    pub fn decode(raw: &[u8]) -> Result<Self, StunError> {
        if raw.len() < HEADER_SIZE {
            return Err(StunError::TooShort(raw.len()));
        }

        let mut header = &raw[..HEADER_SIZE];
        let msg_type_raw = header.get_u16();
        let msg_len = header.get_u16() as usize;
        let magic = header.get_u32();

        if magic != MAGIC_COOKIE {
            return Err(StunError::InvalidMagicCookie(magic));
        }
        if msg_type_raw & 0xC000 != 0 {
            return Err(StunError::ParseError(format!(
                "Leading bits set in message type 0x{:04X}",
                msg_type_raw
            )));
        }
        if msg_len % 4 != 0 {
            return Err(StunError::ParseError(format!("Length {} is not a multiple of 4", msg_len)));
        }
        if HEADER_SIZE + msg_len > raw.len() {
            return Err(StunError::LengthMismatch {
                declared: msg_len,
                available: raw.len() - HEADER_SIZE,
            });
        }

        let mut tid_bytes = [0u8; 12];
        header.copy_to_slice(&mut tid_bytes);
        let transaction_id = TransactionId::from_bytes(tid_bytes);

        let message_type = MessageType::from_method_class(
            method_from_bits(msg_type_raw),
            class_from_bits(msg_type_raw),
        )
        .ok_or(StunError::UnknownMessageType(msg_type_raw))?;

        let raw = &raw[..HEADER_SIZE + msg_len];
        let mut pos = HEADER_SIZE;
        let mut attributes = Vec::new();
        let mut unknown_attributes = Vec::new();
        let mut seen_integrity = false;

        while pos < raw.len() {
            if raw.len() - pos < 4 {
                return Err(StunError::ParseError("Incomplete attribute header".to_string()));
            }
            let attr_type_raw = u16::from_be_bytes([raw[pos], raw[pos + 1]]);
            let attr_len = u16::from_be_bytes([raw[pos + 2], raw[pos + 3]]) as usize;
            let value_start = pos + 4;
            let padded_end = value_start + padded_len(attr_len);

            if value_start + attr_len > raw.len() {
                return Err(StunError::AttributeParseError {
                    attr_type: attr_type_raw,
                    reason: format!("length {} overruns message", attr_len),
                });
            }
            let value = &raw[value_start..value_start + attr_len];

            if attr_type_raw == AttributeType::Fingerprint as u16 {
                if padded_end != raw.len() {
                    return Err(StunError::ParseError("FINGERPRINT is not the last attribute".into()));
                }
                if value.len() != 4 {
                    return Err(StunError::FingerprintCheckFailed);
                }
                let expected = u32::from_be_bytes([value[0], value[1], value[2], value[3]]);
                if CRC32.checksum(&raw[..pos]) ^ FINGERPRINT_XOR != expected {
                    return Err(StunError::FingerprintCheckFailed);
                }
                attributes.push(Attribute::new(AttributeType::Fingerprint, AttributeValue::Raw(value.to_vec())));
            } else if !seen_integrity {
                // Attributes after MESSAGE-INTEGRITY (other than FINGERPRINT) are ignored
                match AttributeType::from_u16(attr_type_raw) {
                    Some(attr_type) => {
                        attributes.push(Attribute::decode(attr_type, value, &transaction_id)?);
                        seen_integrity = attr_type == AttributeType::MessageIntegrity;
                    }
                    None if attr_type_raw < 0x8000 => unknown_attributes.push(attr_type_raw),
                    None => {}
                }
            }

            pos = padded_end.min(raw.len());
        }

        Ok(Self {
            message_type,
            transaction_id,
            attributes,
            unknown_attributes,
        })
    }

    /// Verify MESSAGE-INTEGRITY against the raw bytes the message was decoded from
    pub fn verify_integrity(&self, key: &[u8], raw_msg: &[u8]) -> Result<bool, StunError> {
        let attr = self
            .get_attribute(AttributeType::MessageIntegrity)
            .ok_or(StunError::MissingAttribute("MESSAGE-INTEGRITY"))?;

        let hash = match &attr.value {
            AttributeValue::Raw(hash) if hash.len() == MESSAGE_INTEGRITY_SIZE => hash,
            _ => return Ok(false),
        };

        let integrity_pos = find_attribute_position(raw_msg, AttributeType::MessageIntegrity)
            .ok_or(StunError::MissingAttribute("MESSAGE-INTEGRITY"))?;

        // Length field covers everything up to and including MESSAGE-INTEGRITY
        let mut verify_msg = raw_msg[..integrity_pos].to_vec();
        let new_len = (integrity_pos + 4 + MESSAGE_INTEGRITY_SIZE - HEADER_SIZE) as u16;
        verify_msg[2..4].copy_from_slice(&new_len.to_be_bytes());

        verify_message_integrity_sha1(&verify_msg, hash, key)
    }
}

fn set_length(buf: &mut BytesMut, msg_len: usize) -> Result<(), StunError> {
    let len = u16::try_from(msg_len)
        .map_err(|_| StunError::ParseError(format!("Message body of {} bytes too large", msg_len)))?;
    buf[2..4].copy_from_slice(&len.to_be_bytes());
    Ok(())
}

/// Offset of the first attribute of `attr_type` in a raw message
fn find_attribute_position(raw_msg: &[u8], attr_type: AttributeType) -> Option<usize> {
    let mut pos = HEADER_SIZE;

    while pos + 4 <= raw_msg.len() {
        let attr = u16::from_be_bytes([raw_msg[pos], raw_msg[pos + 1]]);
        let len = u16::from_be_bytes([raw_msg[pos + 2], raw_msg[pos + 3]]) as usize;

        if attr == attr_type as u16 {
            return Some(pos);
        }

        pos += 4 + padded_len(len);
    }

    None
}

/// Round up to the 4-byte attribute boundary
pub fn padded_len(len: usize) -> usize {
    (len + 3) & !3
}

/// STUN attribute
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub attr_type: AttributeType,
    pub value: AttributeValue,
}

/// STUN attribute values
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeValue {
    MappedAddress(SocketAddr),
    XorMappedAddress(SocketAddr),
    XorPeerAddress(SocketAddr),
    XorRelayedAddress(SocketAddr),
    Username(String),
    Realm(String),
    Nonce(Vec<u8>),
    Software(String),
    ErrorCode { code: u16, reason: String },
    UnknownAttributes(Vec<u16>),
    Lifetime(u32),
    ChannelNumber(u16),
    RequestedTransport(u8),
    Data(Bytes),
    Empty,
    Raw(Vec<u8>),
}

impl Attribute {
    /// Create new attribute
    pub fn new(attr_type: AttributeType, value: AttributeValue) -> Self {
        Self { attr_type, value }
    }

    /// Encode attribute including its padding
    pub fn encode(&self, buf: &mut BytesMut, tid: &TransactionId) {
        let start_pos = buf.len();

        buf.put_u16(self.attr_type as u16);
        buf.put_u16(0); // Length placeholder

        match &self.value {
            AttributeValue::MappedAddress(addr) => encode_address(buf, addr, false, tid),
            AttributeValue::XorMappedAddress(addr)
            | AttributeValue::XorPeerAddress(addr)
            | AttributeValue::XorRelayedAddress(addr) => encode_address(buf, addr, true, tid),
            AttributeValue::Username(text)
            | AttributeValue::Realm(text)
            | AttributeValue::Software(text) => buf.put_slice(text.as_bytes()),
            AttributeValue::Nonce(nonce) => buf.put_slice(nonce),
            AttributeValue::ErrorCode { code, reason } => {
                buf.put_u16(0); // Reserved
                buf.put_u8((code / 100) as u8);
                buf.put_u8((code % 100) as u8);
                buf.put_slice(reason.as_bytes());
            }
            AttributeValue::UnknownAttributes(attrs) => {
                for attr in attrs {
                    buf.put_u16(*attr);
                }
            }
            AttributeValue::Lifetime(secs) => buf.put_u32(*secs),
            AttributeValue::ChannelNumber(number) => {
                buf.put_u16(*number);
                buf.put_u16(0); // RFFU
            }
            AttributeValue::RequestedTransport(protocol) => {
                buf.put_u8(*protocol);
                buf.put_slice(&[0, 0, 0]); // RFFU
            }
            AttributeValue::Data(data) => buf.put_slice(data),
            AttributeValue::Empty => {}
            AttributeValue::Raw(data) => buf.put_slice(data),
        }

        let value_len = buf.len() - start_pos - 4;
        buf[start_pos + 2..start_pos + 4].copy_from_slice(&(value_len as u16).to_be_bytes());

        let padding = padded_len(value_len) - value_len;
        buf.put_bytes(0, padding);
    }

    /// Decode the value of a known attribute type
    pub fn decode(attr_type: AttributeType, value: &[u8], tid: &TransactionId) -> Result<Self, StunError> {
        let attr_type_raw = attr_type as u16;
        let too_short = |what: &str| StunError::AttributeParseError {
            attr_type: attr_type_raw,
            reason: format!("{} too short", what),
        };
        let utf8 = |what: &str| {
            String::from_utf8(value.to_vec()).map_err(|e| StunError::AttributeParseError {
                attr_type: attr_type_raw,
                reason: format!("invalid {}: {}", what, e),
            })
        };
        let mut buf = value;

        let decoded = match attr_type {
            AttributeType::MappedAddress => AttributeValue::MappedAddress(decode_address(value, false, tid)?),
            AttributeType::XorMappedAddress => AttributeValue::XorMappedAddress(decode_address(value, true, tid)?),
            AttributeType::XorPeerAddress => AttributeValue::XorPeerAddress(decode_address(value, true, tid)?),
            AttributeType::XorRelayedAddress => {
                AttributeValue::XorRelayedAddress(decode_address(value, true, tid)?)
            }
            AttributeType::Username => AttributeValue::Username(utf8("username")?),
            AttributeType::Realm => AttributeValue::Realm(utf8("realm")?),
            AttributeType::Software => AttributeValue::Software(utf8("software")?),
            AttributeType::Nonce => AttributeValue::Nonce(value.to_vec()),
            AttributeType::ErrorCode => {
                if buf.remaining() < 4 {
                    return Err(too_short("ERROR-CODE"));
                }
                buf.advance(2); // Skip reserved
                let class = (buf.get_u8() & 0x07) as u16;
                let number = buf.get_u8() as u16;
                let reason = String::from_utf8_lossy(buf).into_owned();
                AttributeValue::ErrorCode { code: class * 100 + number, reason }
            }
            AttributeType::UnknownAttributes => {
                let mut attrs = Vec::with_capacity(buf.remaining() / 2);
                while buf.remaining() >= 2 {
                    attrs.push(buf.get_u16());
                }
                AttributeValue::UnknownAttributes(attrs)
            }
            AttributeType::Lifetime => {
                if buf.remaining() < 4 {
                    return Err(too_short("LIFETIME"));
                }
                AttributeValue::Lifetime(buf.get_u32())
            }
            AttributeType::ChannelNumber => {
                if buf.remaining() < 4 {
                    return Err(too_short("CHANNEL-NUMBER"));
                }
                AttributeValue::ChannelNumber(buf.get_u16())
            }
            AttributeType::RequestedTransport => {
                if buf.remaining() < 4 {
                    return Err(too_short("REQUESTED-TRANSPORT"));
                }
                AttributeValue::RequestedTransport(buf.get_u8())
            }
            AttributeType::Data => AttributeValue::Data(Bytes::copy_from_slice(value)),
            AttributeType::DontFragment => AttributeValue::Empty,
            AttributeType::MessageIntegrity | AttributeType::Fingerprint => AttributeValue::Raw(value.to_vec()),
        };

        Ok(Self { attr_type, value: decoded })
    }
}

/// Encode a (possibly XOR-obfuscated) transport address
fn encode_address(buf: &mut BytesMut, addr: &SocketAddr, xor: bool, tid: &TransactionId) {
    buf.put_u8(0); // Reserved

    let port = if xor {
        addr.port() ^ (MAGIC_COOKIE >> 16) as u16
    } else {
        addr.port()
    };

    match addr.ip() {
        IpAddr::V4(ip) => {
            buf.put_u8(0x01);
            buf.put_u16(port);
            let mut ip_bytes = ip.octets();
            if xor {
                xor_in_place(&mut ip_bytes, tid);
            }
            buf.put_slice(&ip_bytes);
        }
        IpAddr::V6(ip) => {
            buf.put_u8(0x02);
            buf.put_u16(port);
            let mut ip_bytes = ip.octets();
            if xor {
                xor_in_place(&mut ip_bytes, tid);
            }
            buf.put_slice(&ip_bytes);
        }
    }
}

/// Decode a (possibly XOR-obfuscated) transport address
fn decode_address(value: &[u8], xor: bool, tid: &TransactionId) -> Result<SocketAddr, StunError> {
    if value.len() < 8 {
        return Err(StunError::ParseError("Address too short".to_string()));
    }

    let mut buf = value;
    buf.advance(1); // Skip reserved
    let family = buf.get_u8();
    let port_raw = buf.get_u16();
    let port = if xor {
        port_raw ^ (MAGIC_COOKIE >> 16) as u16
    } else {
        port_raw
    };

    match family {
        0x01 => {
            let mut ip_bytes = [0u8; 4];
            buf.copy_to_slice(&mut ip_bytes);
            if xor {
                xor_in_place(&mut ip_bytes, tid);
            }
            Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(ip_bytes)), port))
        }
        0x02 => {
            if buf.remaining() < 16 {
                return Err(StunError::ParseError("IPv6 address too short".to_string()));
            }
            let mut ip_bytes = [0u8; 16];
            buf.copy_to_slice(&mut ip_bytes);
            if xor {
                xor_in_place(&mut ip_bytes, tid);
            }
            Ok(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(ip_bytes)), port))
        }
        _ => Err(StunError::InvalidAddressFamily(family)),
    }
}

/// XOR address bytes with the magic cookie followed by the transaction id
fn xor_in_place(ip_bytes: &mut [u8], tid: &TransactionId) {
    let cookie = MAGIC_COOKIE.to_be_bytes();
    let key = cookie.iter().chain(tid.as_bytes().iter());
    for (byte, k) in ip_bytes.iter_mut().zip(key) {
        *byte ^= k;
    }
}
