//! Wire format of all messages. Every message occupies exactly one UDP datagram.
//!
//! Header (all numbers little endian):
//! ```ascii
//! 0: seq (i32) - -1 for unsequenced messages (ACK, KEEPALIVE)
//! 4: type and flags (u8):
//!     * bit 0-2: message type
//!     * bit 3:   RTT flag - the body starts with a 16 bit RTT timestamp
//! 5: body length (u16)
//! 7: body
//! ```
//!
//! Bodies:
//! ```ascii
//! HELLO:     version (u32), profile id (u8), [ack block]
//! ACK:       [rtt (u16)], ack block, receiver's buffered bytes (i32)
//! DATA:      [rtt (u16)], payload
//! CLOSE:     -
//! KEEPALIVE: receiver's buffered bytes (i32)
//! ```
//!
//! See [crate::acks] for the ack block.

use bitflags::bitflags;
use bytes::{BufMut, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::sync::Arc;
use crate::acks::{decode_acks, encode_acks, encoded_len, Ack};
use crate::buffers::buffer_pool::{Buffer, BufferPool};
use crate::error::WireError;
use crate::safe_converter::{PrecheckedCast, SafeCast};
use crate::util::buf_ext::BufExt;

pub const PROTOCOL_VERSION: u32 = 1;

pub const HEADER_LEN: usize = 7;
pub const RTT_LEN: usize = 2;
pub const MAX_BODY_LEN: usize = u16::MAX as usize;

/// sequence number in the header of messages that are not part of the sequenced stream
pub const UNSEQUENCED: i32 = -1;

const TYPE_MASK: u8 = 0b0000_0111;

#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
pub enum MessageType {
    Hello = 0,
    Ack = 1,
    Data = 2,
    Close = 3,
    KeepAlive = 4,
}

bitflags! {
    #[derive(Debug, PartialEq, Eq, Copy, Clone)]
    pub struct MessageFlags: u8 {
        const RTT = 0b0000_1000;
    }
}

/// Message type of an encoded message without decoding it, `None` if the header is incomplete
///  or the type unknown
pub fn peek_message_type(datagram: &[u8]) -> Option<MessageType> {
    if datagram.len() < HEADER_LEN {
        return None;
    }
    MessageType::try_from(datagram[4] & TYPE_MASK).ok()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hello {
    pub version: u32,
    pub profile_id: u8,
    /// the listener's HELLO acknowledges the dialer's HELLO
    pub ack: Option<Ack>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckBody {
    pub rtt: Option<u16>,
    pub acks: Vec<Ack>,
    pub rx_portal_size: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataBody<'a> {
    pub rtt: Option<u16>,
    pub payload: &'a [u8],
}

/// A decoded header on top of the pooled buffer holding the complete encoded message. Dropping
///  the message releases its handle on the buffer.
#[derive(Debug)]
pub struct WireMessage {
    pub seq: i32,
    pub message_type: MessageType,
    pub flags: MessageFlags,
    body_len: usize,
    buffer: Buffer,
}

impl WireMessage {
    pub fn new_hello(seq: i32, hello: &Hello, pool: &Arc<BufferPool>) -> Result<WireMessage, WireError> {
        let acks = hello.ack.as_slice();
        let acks_len = encoded_len(acks)?;

        Self::encode(pool, seq, MessageType::Hello, MessageFlags::empty(), 4 + 1 + acks_len, |buf| {
            buf.put_u32_le(hello.version);
            buf.put_u8(hello.profile_id);
            put_acks(buf, acks, acks_len)
        })
    }

    pub fn new_ack(acks: &[Ack], rx_portal_size: i32, rtt: Option<u16>, pool: &Arc<BufferPool>) -> Result<WireMessage, WireError> {
        let acks_len = encoded_len(acks)?;
        let body_len = rtt_len(rtt) + acks_len + 4;

        Self::encode(pool, UNSEQUENCED, MessageType::Ack, rtt_flags(rtt), body_len, |buf| {
            put_rtt(buf, rtt);
            put_acks(buf, acks, acks_len)?;
            buf.put_i32_le(rx_portal_size);
            Ok(())
        })
    }

    pub fn new_data(seq: i32, rtt: Option<u16>, payload: &[u8], pool: &Arc<BufferPool>) -> Result<WireMessage, WireError> {
        let body_len = rtt_len(rtt) + payload.len();

        Self::encode(pool, seq, MessageType::Data, rtt_flags(rtt), body_len, |buf| {
            put_rtt(buf, rtt);
            buf.put_slice(payload);
            Ok(())
        })
    }

    pub fn new_close(seq: i32, pool: &Arc<BufferPool>) -> Result<WireMessage, WireError> {
        Self::encode(pool, seq, MessageType::Close, MessageFlags::empty(), 0, |_| Ok(()))
    }

    pub fn new_keepalive(rx_portal_size: i32, pool: &Arc<BufferPool>) -> Result<WireMessage, WireError> {
        Self::encode(pool, UNSEQUENCED, MessageType::KeepAlive, MessageFlags::empty(), 4, |buf| {
            buf.put_i32_le(rx_portal_size);
            Ok(())
        })
    }

    fn encode(
        pool: &Arc<BufferPool>,
        seq: i32,
        message_type: MessageType,
        flags: MessageFlags,
        body_len: usize,
        put_body: impl FnOnce(&mut BytesMut) -> Result<(), WireError>,
    ) -> Result<WireMessage, WireError> {
        if body_len > MAX_BODY_LEN {
            return Err(WireError::Encoding(format!("body of {} bytes exceeds the maximum of {}", body_len, MAX_BODY_LEN)));
        }

        let mut buffer = pool.get();
        let capacity = buffer.capacity();
        if HEADER_LEN + body_len > capacity {
            return Err(WireError::Encoding(format!("{:?} message of {} bytes does not fit into a buffer of {} bytes", message_type, HEADER_LEN + body_len, capacity)));
        }

        let buf = buffer.data_mut()
            .ok_or_else(|| WireError::Encoding("freshly acquired buffer is shared".to_string()))?;
        buf.put_i32_le(seq);
        buf.put_u8(u8::from(message_type) | flags.bits());
        buf.put_u16_le(body_len.prechecked_cast());
        put_body(buf)?;

        Ok(WireMessage {
            seq,
            message_type,
            flags,
            body_len,
            buffer,
        })
    }

    /// Parses the header of a received datagram. The body is parsed on demand by the typed
    ///  accessors. Bytes after the declared body are ignored.
    pub fn decode(buffer: Buffer) -> Result<WireMessage, WireError> {
        let mut buf = buffer.as_ref();
        if buf.len() < HEADER_LEN {
            return Err(WireError::ShortBuffer { needed: HEADER_LEN, available: buf.len() });
        }

        let seq = buf.get_i32_le_checked()?;
        let type_and_flags = buf.get_u8_checked()?;
        let message_type = MessageType::try_from(type_and_flags & TYPE_MASK)
            .map_err(|_| WireError::UnknownMessageType(type_and_flags & TYPE_MASK))?;
        let flags = MessageFlags::from_bits_truncate(type_and_flags & !TYPE_MASK);
        let body_len: usize = buf.get_u16_le_checked()?.safe_cast();
        if buf.len() < body_len {
            return Err(WireError::Decoding(format!("declared body length {} exceeds the {} bytes received", body_len, buf.len())));
        }

        Ok(WireMessage {
            seq,
            message_type,
            flags,
            body_len,
            buffer,
        })
    }

    /// encoded length including the header
    pub fn len(&self) -> usize {
        HEADER_LEN + self.body_len
    }

    /// the encoded message, ready to be written to a socket
    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer.as_ref()[..self.len()]
    }

    pub fn body(&self) -> &[u8] {
        &self.buffer.as_ref()[HEADER_LEN..self.len()]
    }

    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }

    pub fn has_rtt(&self) -> bool {
        self.flags.contains(MessageFlags::RTT)
    }

    pub fn as_hello(&self) -> Result<Hello, WireError> {
        self.expect_type(MessageType::Hello)?;

        let mut body = self.body();
        let version = body.get_u32_le_checked()?;
        let profile_id = body.get_u8_checked()?;
        let ack = if body.is_empty() {
            None
        }
        else {
            let (acks, _) = decode_acks(body)?;
            acks.first().copied()
        };
        Ok(Hello { version, profile_id, ack })
    }

    pub fn as_ack(&self) -> Result<AckBody, WireError> {
        self.expect_type(MessageType::Ack)?;

        let (rtt, body) = self.split_rtt()?;
        let (acks, consumed) = decode_acks(body)?;
        let mut body = &body[consumed..];
        let rx_portal_size = body.get_i32_le_checked()?;
        Ok(AckBody { rtt, acks, rx_portal_size })
    }

    pub fn as_data(&self) -> Result<DataBody<'_>, WireError> {
        self.expect_type(MessageType::Data)?;

        let (rtt, payload) = self.split_rtt()?;
        Ok(DataBody { rtt, payload })
    }

    pub fn as_keepalive(&self) -> Result<i32, WireError> {
        self.expect_type(MessageType::KeepAlive)?;
        self.body().get_i32_le_checked()
    }

    fn expect_type(&self, message_type: MessageType) -> Result<(), WireError> {
        if self.message_type != message_type {
            return Err(WireError::Decoding(format!("expected {:?}, was {:?}", message_type, self.message_type)));
        }
        Ok(())
    }

    fn split_rtt(&self) -> Result<(Option<u16>, &[u8]), WireError> {
        let mut body = self.body();
        if self.has_rtt() {
            let rtt = body.get_u16_le_checked()?;
            Ok((Some(rtt), body))
        }
        else {
            Ok((None, body))
        }
    }
}

fn rtt_len(rtt: Option<u16>) -> usize {
    if rtt.is_some() { RTT_LEN } else { 0 }
}

fn rtt_flags(rtt: Option<u16>) -> MessageFlags {
    if rtt.is_some() { MessageFlags::RTT } else { MessageFlags::empty() }
}

fn put_rtt(buf: &mut BytesMut, rtt: Option<u16>) {
    if let Some(rtt) = rtt {
        buf.put_u16_le(rtt);
    }
}

fn put_acks(buf: &mut BytesMut, acks: &[Ack], acks_len: usize) -> Result<(), WireError> {
    let start = buf.len();
    buf.resize(start + acks_len, 0);
    encode_acks(acks, &mut buf[start..])?;
    Ok(())
}
