// src/stun/channel.rs
//! ChannelData framing (RFC 8656 Section 12.4) and packet classification.

use bytes::{BufMut, Bytes, BytesMut};

use super::protocol::Message;
use crate::error::{StunError, StunResult};

/// ChannelData header size
pub const CHANNEL_HEADER_SIZE: usize = 4;

/// Lowest valid channel number
pub const MIN_CHANNEL_NUMBER: u16 = 0x4000;

/// Highest valid channel number
pub const MAX_CHANNEL_NUMBER: u16 = 0x7FFF;

/// Check channel number range
pub fn is_valid_channel_number(number: u16) -> bool {
    (MIN_CHANNEL_NUMBER..=MAX_CHANNEL_NUMBER).contains(&number)
}

/// ChannelData frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelData {
    pub number: u16,
    pub payload: Bytes,
}

impl ChannelData {
    pub fn new(number: u16, payload: Bytes) -> Self {
        Self { number, payload }
    }

    /// Decode a frame. Trailing padding beyond the declared length is ignored.
    pub fn decode(buf: &[u8]) -> StunResult<Self> {
        if buf.len() < CHANNEL_HEADER_SIZE {
            return Err(StunError::InvalidInput);
        }

        let number = u16::from_be_bytes([buf[0], buf[1]]);
        if !is_valid_channel_number(number) {
            return Err(StunError::InvalidInput);
        }

        let len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
        if CHANNEL_HEADER_SIZE + len > buf.len() {
            return Err(StunError::InvalidInput);
        }

        Ok(Self {
            number,
            payload: Bytes::copy_from_slice(&buf[CHANNEL_HEADER_SIZE..CHANNEL_HEADER_SIZE + len]),
        })
    }

    /// Encode, padding to a 4-byte boundary when `pad` is set (stream transports)
    pub fn encode(&self, pad: bool) -> Bytes {
        let padding = if pad {
            (4 - (self.payload.len() % 4)) % 4
        } else {
            0
        };

        let mut buf = BytesMut::with_capacity(CHANNEL_HEADER_SIZE + self.payload.len() + padding);
        buf.put_u16(self.number);
        buf.put_u16(self.payload.len() as u16);
        buf.put_slice(&self.payload);
        buf.put_bytes(0, padding);
        buf.freeze()
    }
}

/// A classified inbound packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Message(Message),
    ChannelData(ChannelData),
}

/// Classify by the two leading bits: `00` is STUN, `01` is ChannelData.
pub fn decode(buf: &[u8]) -> StunResult<Payload> {
    let first = *buf.first().ok_or(StunError::InvalidInput)?;
    match first >> 6 {
        0b00 => Message::decode(buf).map(Payload::Message),
        0b01 => ChannelData::decode(buf).map(Payload::ChannelData),
        _ => Err(StunError::InvalidInput),
    }
}
