//! Datagram codec and sequence arithmetic for the UDP audio plane.
//!
//! Every datagram starts with a fixed header: 16-bit type tag, 32-bit client
//! id and a 16-bit sequence number. Server-to-client datagrams carry the
//! recipient's client id and a per-recipient outbound sequence counter.
//! Sequence comparison uses serial-number arithmetic so the 16-bit counter
//! wraps transparently.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::messages::DecodeError;

/// Size of the datagram header in bytes.
pub const UDP_HEADER_SIZE: usize = 8;
/// Receive buffer size; comfortably above any audio frame this protocol
/// carries.
pub const MAX_DATAGRAM_SIZE: usize = 2048;

/// Fixed datagram header fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpHeader {
    pub client_id: u32,
    pub sequence: u16,
}

/// Typed UDP message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UdpMessage {
    /// UDP liveness beacon; the first one from a client also latches its
    /// source port.
    Heartbeat,
    /// One compressed audio frame. The `tg` field is advisory; routing always
    /// uses the registry's talkgroup for the sending client.
    Audio { tg: u32, payload: Bytes },
    /// The talker is done; listeners should play out buffered samples.
    FlushSamples,
    /// Flush acknowledgement.
    AllSamplesFlushed,
    /// Message type without an explicit mapping; ignored on receipt.
    Unknown { type_id: u16 },
}

impl UdpMessage {
    /// Wire identifier of this message.
    pub fn type_id(&self) -> u16 {
        match self {
            UdpMessage::Heartbeat => 1,
            UdpMessage::Audio { .. } => 101,
            UdpMessage::FlushSamples => 102,
            UdpMessage::AllSamplesFlushed => 103,
            UdpMessage::Unknown { type_id } => *type_id,
        }
    }

    /// Serialize a complete datagram with the given header fields.
    pub fn encode(&self, header: UdpHeader) -> Bytes {
        let mut buf = BytesMut::with_capacity(UDP_HEADER_SIZE + 32);
        buf.put_u16(self.type_id());
        buf.put_u32(header.client_id);
        buf.put_u16(header.sequence);
        match self {
            UdpMessage::Heartbeat
            | UdpMessage::FlushSamples
            | UdpMessage::AllSamplesFlushed
            | UdpMessage::Unknown { .. } => {}
            UdpMessage::Audio { tg, payload } => {
                buf.put_u32(*tg);
                buf.put_u16(payload.len() as u16);
                buf.put_slice(payload);
            }
        }
        buf.freeze()
    }

    /// Decode a datagram into its header and typed message.
    pub fn decode(datagram: &[u8]) -> Result<(UdpHeader, UdpMessage), DecodeError> {
        let mut buf = datagram;
        if buf.len() < UDP_HEADER_SIZE {
            return Err(DecodeError::Truncated);
        }
        let type_id = buf.get_u16();
        let header = UdpHeader {
            client_id: buf.get_u32(),
            sequence: buf.get_u16(),
        };
        let msg = match type_id {
            1 => UdpMessage::Heartbeat,
            101 => {
                if buf.len() < 6 {
                    return Err(DecodeError::Truncated);
                }
                let tg = buf.get_u32();
                let len = buf.get_u16() as usize;
                if buf.len() < len {
                    return Err(DecodeError::Truncated);
                }
                let payload = Bytes::copy_from_slice(&buf[..len]);
                buf.advance(len);
                UdpMessage::Audio { tg, payload }
            }
            102 => UdpMessage::FlushSamples,
            103 => UdpMessage::AllSamplesFlushed,
            other => return Ok((header, UdpMessage::Unknown { type_id: other })),
        };
        if !buf.is_empty() {
            return Err(DecodeError::TrailingBytes(buf.len()));
        }
        Ok((header, msg))
    }
}

/// Outcome of comparing a received sequence number against the expected one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqCheck {
    /// Exactly the expected frame.
    InOrder,
    /// The frame is ahead of the expected one; earlier frames were lost and
    /// the window should resynchronize to `received + 1`.
    Lost,
    /// The frame is older than the expected one and must be dropped.
    Stale,
}

/// Classify `received` against `expected` with serial-number arithmetic.
pub fn check_sequence(expected: u16, received: u16) -> SeqCheck {
    let diff = received.wrapping_sub(expected);
    if diff == 0 {
        SeqCheck::InOrder
    } else if diff > 0x7FFF {
        SeqCheck::Stale
    } else {
        SeqCheck::Lost
    }
}
