// src/turn/channel_data.rs
//! ChannelData messages (RFC 5766 Section 11.4)

use bytes::{BufMut, Bytes, BytesMut};

use super::is_valid_channel_number;
use crate::stun::protocol::padded_len;

/// ChannelData header size
pub const CHANNEL_DATA_HEADER_SIZE: usize = 4;

/// A channel number followed by application data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelData {
    pub number: u16,
    pub data: Bytes,
}

impl ChannelData {
    pub fn new(number: u16, data: Bytes) -> Self {
        Self { number, data }
    }

    /// First two bits `01` distinguish ChannelData from STUN
    pub fn is_channel_data(raw: &[u8]) -> bool {
        raw.len() >= CHANNEL_DATA_HEADER_SIZE && (raw[0] & 0xC0) == 0x40
    }

    /// Parse ChannelData; the declared length must fit, padding is optional
    pub fn decode(raw: &[u8]) -> Option<Self> {
        if !Self::is_channel_data(raw) {
            return None;
        }
        let number = u16::from_be_bytes([raw[0], raw[1]]);
        if !is_valid_channel_number(number) {
            return None;
        }
        let len = u16::from_be_bytes([raw[2], raw[3]]) as usize;
        let end = CHANNEL_DATA_HEADER_SIZE + len;
        if end > raw.len() {
            return None;
        }
        Some(Self {
            number,
            data: Bytes::copy_from_slice(&raw[CHANNEL_DATA_HEADER_SIZE..end]),
        })
    }

    /// Encode, padding to a multiple of 4 when `pad` is set (stream transports)
    pub fn encode(&self, pad: bool) -> Bytes {
        let body = if pad { padded_len(self.data.len()) } else { self.data.len() };
        let mut buf = BytesMut::with_capacity(CHANNEL_DATA_HEADER_SIZE + body);
        buf.put_u16(self.number);
        buf.put_u16(self.data.len() as u16);
        buf.put_slice(&self.data);
        buf.put_bytes(0, body - self.data.len());
        buf.freeze()
    }

    /// Total frame size on a stream given the first four bytes
    pub fn stream_frame_len(header: &[u8]) -> usize {
        let len = u16::from_be_bytes([header[2], header[3]]) as usize;
        CHANNEL_DATA_HEADER_SIZE + padded_len(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_padding() {
        let msg = ChannelData::new(0x4001, Bytes::from_static(b"abcde"));
        let unpadded = msg.encode(false);
        assert_eq!(unpadded.len(), 9);
        assert_eq!(&unpadded[..4], &[0x40, 0x01, 0x00, 0x05]);

        let padded = msg.encode(true);
        assert_eq!(padded.len(), 12);
        assert_eq!(ChannelData::stream_frame_len(&padded), 12);
        assert_eq!(ChannelData::decode(&padded), Some(msg));
    }

    #[test]
    fn test_decode_rejects_bad_frames() {
        // Reserved channel range
        assert_eq!(ChannelData::decode(&[0x7F, 0xFF, 0x00, 0x00]), None);
        // Declared length exceeds buffer
        assert_eq!(ChannelData::decode(&[0x40, 0x00, 0x00, 0x08, 1, 2]), None);
        // STUN-looking first byte
        assert_eq!(ChannelData::decode(&[0x00, 0x01, 0x00, 0x00]), None);
    }
}
