// src/turn/codec.rs
//! Framing of STUN messages and ChannelData over stream transports

use std::io;

use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::channel_data::ChannelData;
use crate::stun::protocol::{HEADER_SIZE, MAX_MESSAGE_SIZE};

/// Splits a TCP byte stream into whole STUN or ChannelData frames
#[derive(Debug, Default, Clone, Copy)]
pub struct TurnFrameCodec;

impl TurnFrameCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for TurnFrameCodec {
    type Item = Bytes;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 4 {
            return Ok(None);
        }

        let frame_len = match src[0] & 0xC0 {
            0x00 => HEADER_SIZE + u16::from_be_bytes([src[2], src[3]]) as usize,
            0x40 => ChannelData::stream_frame_len(&src[..4]),
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unexpected frame lead byte 0x{:02X}", src[0]),
                ))
            }
        };

        if frame_len > MAX_MESSAGE_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame of {} bytes exceeds limit", frame_len),
            ));
        }

        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        Ok(Some(src.split_to(frame_len).freeze()))
    }
}

impl Encoder<Bytes> for TurnFrameCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(&item);
        Ok(())
    }
}
