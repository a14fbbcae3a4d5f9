//! Control-message codec for the framed TCP link.
//!
//! Every control frame on the wire is a 32-bit big-endian length followed by
//! a 16-bit type tag and the message body. The stateful [`FrameDecoder`]
//! retains partial reads across calls so fragmented frames never desynchronize
//! the stream. Unknown type tags decode to [`ControlMessage::Unknown`] and are
//! ignored by the session, which keeps old servers compatible with newer
//! clients.

use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Protocol revision advertised by the server.
pub const PROTOCOL_VERSION: ProtoVer = ProtoVer::new(2, 0);
/// Size of the frame length prefix in bytes.
pub const FRAME_HEADER_SIZE: usize = 4;
/// Upper bound on the type tag plus body of a single control frame.
pub const MAX_FRAME_SIZE: usize = 16384;

/// Negotiated protocol version of a peer.
///
/// Ordering is lexicographic on (major, minor), which is what version-range
/// broadcast filters rely on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ProtoVer {
    pub major: u16,
    pub minor: u16,
}

impl ProtoVer {
    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }

    /// Legacy clients speak major version 1 and have a fixed talkgroup.
    pub fn is_v1(&self) -> bool {
        self.major == 1
    }
}

impl std::fmt::Display for ProtoVer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Errors produced while decoding a message body.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    /// The body ended before all declared fields were present.
    #[error("truncated message body")]
    Truncated,
    /// The body was longer than the fields of the declared type.
    #[error("{0} trailing bytes after message body")]
    TrailingBytes(usize),
    /// A string field held invalid UTF-8.
    #[error("invalid utf-8 in string field")]
    InvalidUtf8,
}

/// Fully typed control message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// TCP liveness beacon, sent by a peer with nothing else to say.
    Heartbeat,
    /// Protocol version announcement; the server sends its own on accept and
    /// records the peer's in return.
    ProtoVer(ProtoVer),
    /// Random nonce the peer must sign to authenticate.
    AuthChallenge { nonce: Vec<u8> },
    /// HMAC over the challenge nonce, keyed with the callsign's shared secret.
    AuthResponse { callsign: String, digest: Vec<u8> },
    /// Authentication accepted.
    AuthOk,
    /// Human-readable error, usually followed by connection closure.
    Error { message: String },
    /// Post-auth bootstrap: the assigned client id and the connected nodes.
    ServerInfo { client_id: u32, nodes: Vec<String> },
    /// Connected node callsigns, sent on request.
    NodeList { nodes: Vec<String> },
    NodeJoined { callsign: String },
    NodeLeft { callsign: String },
    /// Talker notifications for legacy major-version-1 clients, which have an
    /// implicit talkgroup and therefore no TG field.
    TalkerStartV1 { callsign: String },
    TalkerStopV1 { callsign: String },
    /// Subscribe to a talkgroup; 0 leaves the current one.
    SelectTg { tg: u32 },
    /// Replace the set of passively monitored talkgroups.
    TgMonitor { tgs: Vec<u32> },
    TalkerStart { tg: u32, callsign: String },
    TalkerStop { tg: u32, callsign: String },
    /// Invitation to retune; 0 from a client asks for a random allocation.
    RequestQsy { tg: u32 },
    /// Message type without an explicit mapping; ignored on receipt.
    Unknown { type_id: u16 },
}

impl ControlMessage {
    /// Wire identifier of this message.
    pub fn type_id(&self) -> u16 {
        match self {
            ControlMessage::Heartbeat => 1,
            ControlMessage::ProtoVer(_) => 5,
            ControlMessage::AuthChallenge { .. } => 10,
            ControlMessage::AuthResponse { .. } => 11,
            ControlMessage::AuthOk => 12,
            ControlMessage::Error { .. } => 13,
            ControlMessage::ServerInfo { .. } => 100,
            ControlMessage::NodeList { .. } => 101,
            ControlMessage::NodeJoined { .. } => 102,
            ControlMessage::NodeLeft { .. } => 103,
            ControlMessage::TalkerStartV1 { .. } => 104,
            ControlMessage::TalkerStopV1 { .. } => 105,
            ControlMessage::SelectTg { .. } => 106,
            ControlMessage::TgMonitor { .. } => 107,
            ControlMessage::TalkerStart { .. } => 108,
            ControlMessage::TalkerStop { .. } => 109,
            ControlMessage::RequestQsy { .. } => 110,
            ControlMessage::Unknown { type_id } => *type_id,
        }
    }

    /// Serialize the type tag and body, without the frame length prefix.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u16(self.type_id());
        match self {
            ControlMessage::Heartbeat
            | ControlMessage::AuthOk
            | ControlMessage::Unknown { .. } => {}
            ControlMessage::ProtoVer(ver) => {
                buf.put_u16(ver.major);
                buf.put_u16(ver.minor);
            }
            ControlMessage::AuthChallenge { nonce } => put_blob(&mut buf, nonce),
            ControlMessage::AuthResponse { callsign, digest } => {
                put_string(&mut buf, callsign);
                put_blob(&mut buf, digest);
            }
            ControlMessage::Error { message } => put_string(&mut buf, message),
            ControlMessage::ServerInfo { client_id, nodes } => {
                buf.put_u32(*client_id);
                put_string_list(&mut buf, nodes);
            }
            ControlMessage::NodeList { nodes } => put_string_list(&mut buf, nodes),
            ControlMessage::NodeJoined { callsign }
            | ControlMessage::NodeLeft { callsign }
            | ControlMessage::TalkerStartV1 { callsign }
            | ControlMessage::TalkerStopV1 { callsign } => put_string(&mut buf, callsign),
            ControlMessage::SelectTg { tg } | ControlMessage::RequestQsy { tg } => {
                buf.put_u32(*tg)
            }
            ControlMessage::TgMonitor { tgs } => put_u32_list(&mut buf, tgs),
            ControlMessage::TalkerStart { tg, callsign }
            | ControlMessage::TalkerStop { tg, callsign } => {
                buf.put_u32(*tg);
                put_string(&mut buf, callsign);
            }
        }
        buf.freeze()
    }

    /// Serialize into a complete wire frame, length prefix included.
    pub fn encode_frame(&self) -> Bytes {
        let payload = self.encode();
        let mut frame = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload.len());
        frame.put_u32(payload.len() as u32);
        frame.extend_from_slice(&payload);
        frame.freeze()
    }

    /// Decode a frame payload (type tag plus body).
    ///
    /// A known type must consume its body exactly; leftover bytes are a
    /// [`DecodeError::TrailingBytes`] error. Unknown type tags succeed as
    /// [`ControlMessage::Unknown`] regardless of body contents.
    pub fn decode(frame: &[u8]) -> Result<Self, DecodeError> {
        let mut buf = frame;
        let type_id = get_u16(&mut buf)?;
        let msg = match type_id {
            1 => ControlMessage::Heartbeat,
            5 => ControlMessage::ProtoVer(ProtoVer::new(get_u16(&mut buf)?, get_u16(&mut buf)?)),
            10 => ControlMessage::AuthChallenge {
                nonce: get_blob(&mut buf)?,
            },
            11 => ControlMessage::AuthResponse {
                callsign: get_string(&mut buf)?,
                digest: get_blob(&mut buf)?,
            },
            12 => ControlMessage::AuthOk,
            13 => ControlMessage::Error {
                message: get_string(&mut buf)?,
            },
            100 => ControlMessage::ServerInfo {
                client_id: get_u32(&mut buf)?,
                nodes: get_string_list(&mut buf)?,
            },
            101 => ControlMessage::NodeList {
                nodes: get_string_list(&mut buf)?,
            },
            102 => ControlMessage::NodeJoined {
                callsign: get_string(&mut buf)?,
            },
            103 => ControlMessage::NodeLeft {
                callsign: get_string(&mut buf)?,
            },
            104 => ControlMessage::TalkerStartV1 {
                callsign: get_string(&mut buf)?,
            },
            105 => ControlMessage::TalkerStopV1 {
                callsign: get_string(&mut buf)?,
            },
            106 => ControlMessage::SelectTg {
                tg: get_u32(&mut buf)?,
            },
            107 => ControlMessage::TgMonitor {
                tgs: get_u32_list(&mut buf)?,
            },
            108 => ControlMessage::TalkerStart {
                tg: get_u32(&mut buf)?,
                callsign: get_string(&mut buf)?,
            },
            109 => ControlMessage::TalkerStop {
                tg: get_u32(&mut buf)?,
                callsign: get_string(&mut buf)?,
            },
            110 => ControlMessage::RequestQsy {
                tg: get_u32(&mut buf)?,
            },
            other => return Ok(ControlMessage::Unknown { type_id: other }),
        };
        if !buf.is_empty() {
            return Err(DecodeError::TrailingBytes(buf.len()));
        }
        Ok(msg)
    }
}

/// Stateful length-prefixed frame decoder.
///
/// Retains partial reads across `read_next` calls so that frames arriving
/// fragmented (or several per TCP segment) are reassembled correctly.
#[derive(Debug)]
pub struct FrameDecoder {
    rxbuf: Vec<u8>,
    rxcount: usize,
    frame_len: Option<usize>,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            rxbuf: vec![0u8; FRAME_HEADER_SIZE + MAX_FRAME_SIZE],
            rxcount: 0,
            frame_len: None,
        }
    }

    /// Read the next complete frame payload from `reader`.
    ///
    /// Returns `Ok(None)` on a clean EOF at a frame boundary. EOF inside a
    /// frame, or a declared length outside `1..=MAX_FRAME_SIZE`, is an error;
    /// a length violation cannot be resynchronized and the connection should
    /// be dropped.
    pub async fn read_next<R>(&mut self, reader: &mut R) -> io::Result<Option<Bytes>>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            let target = match self.frame_len {
                None => FRAME_HEADER_SIZE,
                Some(len) => FRAME_HEADER_SIZE + len,
            };

            if self.rxcount < target {
                let n = reader.read(&mut self.rxbuf[self.rxcount..target]).await?;
                if n == 0 {
                    if self.rxcount == 0 {
                        return Ok(None);
                    }
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed mid-frame",
                    ));
                }
                self.rxcount += n;
            }

            if self.frame_len.is_none() && self.rxcount >= FRAME_HEADER_SIZE {
                let len = u32::from_be_bytes([
                    self.rxbuf[0],
                    self.rxbuf[1],
                    self.rxbuf[2],
                    self.rxbuf[3],
                ]) as usize;
                if len < 2 || len > MAX_FRAME_SIZE {
                    self.rxcount = 0;
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("illegal frame length: {len} bytes"),
                    ));
                }
                self.frame_len = Some(len);
            }

            if let Some(len) = self.frame_len {
                if self.rxcount >= FRAME_HEADER_SIZE + len {
                    let payload =
                        Bytes::copy_from_slice(&self.rxbuf[FRAME_HEADER_SIZE..FRAME_HEADER_SIZE + len]);
                    self.rxcount = 0;
                    self.frame_len = None;
                    return Ok(Some(payload));
                }
            }
        }
    }
}

fn need(buf: &[u8], n: usize) -> Result<(), DecodeError> {
    if buf.len() < n {
        Err(DecodeError::Truncated)
    } else {
        Ok(())
    }
}

fn get_u16(buf: &mut &[u8]) -> Result<u16, DecodeError> {
    need(buf, 2)?;
    Ok(buf.get_u16())
}

fn get_u32(buf: &mut &[u8]) -> Result<u32, DecodeError> {
    need(buf, 4)?;
    Ok(buf.get_u32())
}

pub(crate) fn get_string(buf: &mut &[u8]) -> Result<String, DecodeError> {
    let raw = get_blob(buf)?;
    String::from_utf8(raw).map_err(|_| DecodeError::InvalidUtf8)
}

pub(crate) fn get_blob(buf: &mut &[u8]) -> Result<Vec<u8>, DecodeError> {
    let len = get_u16(buf)? as usize;
    need(buf, len)?;
    let mut out = vec![0u8; len];
    buf.copy_to_slice(&mut out);
    Ok(out)
}

fn get_u32_list(buf: &mut &[u8]) -> Result<Vec<u32>, DecodeError> {
    let count = get_u16(buf)? as usize;
    let mut out = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        out.push(get_u32(buf)?);
    }
    Ok(out)
}

fn get_string_list(buf: &mut &[u8]) -> Result<Vec<String>, DecodeError> {
    let count = get_u16(buf)? as usize;
    let mut out = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        out.push(get_string(buf)?);
    }
    Ok(out)
}

pub(crate) fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_u16(s.len() as u16);
    buf.put_slice(s.as_bytes());
}

pub(crate) fn put_blob(buf: &mut BytesMut, b: &[u8]) {
    buf.put_u16(b.len() as u16);
    buf.put_slice(b);
}

fn put_u32_list(buf: &mut BytesMut, items: &[u32]) {
    buf.put_u16(items.len() as u16);
    for item in items {
        buf.put_u32(*item);
    }
}

fn put_string_list(buf: &mut BytesMut, items: &[String]) {
    buf.put_u16(items.len() as u16);
    for item in items {
        put_string(buf, item);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncWriteExt};

    fn sample_messages() -> Vec<ControlMessage> {
        vec![
            ControlMessage::Heartbeat,
            ControlMessage::ProtoVer(ProtoVer::new(2, 0)),
            ControlMessage::AuthChallenge {
                nonce: vec![7u8; 20],
            },
            ControlMessage::AuthResponse {
                callsign: "SM0ABC".into(),
                digest: vec![0xAA; 32],
            },
            ControlMessage::AuthOk,
            ControlMessage::Error {
                message: "Access denied".into(),
            },
            ControlMessage::ServerInfo {
                client_id: 42,
                nodes: vec!["SM0ABC".into(), "LA1XYZ".into()],
            },
            ControlMessage::NodeList {
                nodes: vec!["SM0ABC".into()],
            },
            ControlMessage::NodeJoined {
                callsign: "LA1XYZ".into(),
            },
            ControlMessage::NodeLeft {
                callsign: "LA1XYZ".into(),
            },
            ControlMessage::TalkerStartV1 {
                callsign: "SM0ABC".into(),
            },
            ControlMessage::TalkerStopV1 {
                callsign: "SM0ABC".into(),
            },
            ControlMessage::SelectTg { tg: 100 },
            ControlMessage::TgMonitor {
                tgs: vec![1, 100, 240],
            },
            ControlMessage::TalkerStart {
                tg: 100,
                callsign: "SM0ABC".into(),
            },
            ControlMessage::TalkerStop {
                tg: 100,
                callsign: "SM0ABC".into(),
            },
            ControlMessage::RequestQsy { tg: 1000 },
        ]
    }

    #[test]
    fn roundtrip_all_message_types() {
        for msg in sample_messages() {
            let encoded = msg.encode();
            let decoded = ControlMessage::decode(&encoded).expect("decode should succeed");
            assert_eq!(decoded, msg, "roundtrip failed for {msg:?}");
        }
    }

    #[test]
    fn select_tg_has_expected_wire_bytes() {
        let frame = ControlMessage::SelectTg { tg: 100 }.encode_frame();
        assert_eq!(
            frame.as_ref(),
            &[0x00, 0x00, 0x00, 0x06, 0x00, 106, 0x00, 0x00, 0x00, 100]
        );
    }

    #[test]
    fn unknown_type_tag_is_preserved() {
        let decoded = ControlMessage::decode(&[0x7F, 0x01, 1, 2, 3]).unwrap();
        assert_eq!(decoded, ControlMessage::Unknown { type_id: 0x7F01 });
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut encoded = ControlMessage::SelectTg { tg: 5 }.encode().to_vec();
        encoded.push(0);
        assert_eq!(
            ControlMessage::decode(&encoded),
            Err(DecodeError::TrailingBytes(1))
        );
    }

    #[test]
    fn truncated_body_is_rejected() {
        let encoded = ControlMessage::TalkerStart {
            tg: 100,
            callsign: "SM0ABC".into(),
        }
        .encode();
        for cut in 2..encoded.len() {
            assert_eq!(
                ControlMessage::decode(&encoded[..cut]),
                Err(DecodeError::Truncated),
                "cut at {cut}"
            );
        }
    }

    #[test]
    fn string_field_rejects_invalid_utf8() {
        let mut buf = BytesMut::new();
        buf.put_u16(102); // NodeJoined
        buf.put_u16(2);
        buf.put_slice(&[0xFF, 0xFE]);
        assert_eq!(
            ControlMessage::decode(&buf),
            Err(DecodeError::InvalidUtf8)
        );
    }

    #[tokio::test]
    async fn decoder_reassembles_fragmented_frames() {
        let (mut tx, mut rx) = duplex(256);
        let first = ControlMessage::SelectTg { tg: 7 }.encode_frame();
        let second = ControlMessage::NodeJoined {
            callsign: "SM0ABC".into(),
        }
        .encode_frame();
        let mut wire = first.to_vec();
        wire.extend_from_slice(&second);

        let writer = tokio::spawn(async move {
            for chunk in wire.chunks(3) {
                tx.write_all(chunk).await.unwrap();
            }
            tx
        });

        let mut decoder = FrameDecoder::new();
        let frame = decoder.read_next(&mut rx).await.unwrap().unwrap();
        assert_eq!(
            ControlMessage::decode(&frame).unwrap(),
            ControlMessage::SelectTg { tg: 7 }
        );
        let frame = decoder.read_next(&mut rx).await.unwrap().unwrap();
        assert_eq!(
            ControlMessage::decode(&frame).unwrap(),
            ControlMessage::NodeJoined {
                callsign: "SM0ABC".into()
            }
        );

        drop(writer.await.unwrap());
        assert!(decoder.read_next(&mut rx).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn decoder_rejects_oversize_frame() {
        let (mut tx, mut rx) = duplex(64);
        tx.write_all(&((MAX_FRAME_SIZE as u32 + 1).to_be_bytes()))
            .await
            .unwrap();

        let mut decoder = FrameDecoder::new();
        let err = decoder.read_next(&mut rx).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn decoder_errors_on_eof_mid_frame() {
        let (mut tx, mut rx) = duplex(64);
        let frame = ControlMessage::AuthOk.encode_frame();
        tx.write_all(&frame[..frame.len() - 1]).await.unwrap();
        drop(tx);

        let mut decoder = FrameDecoder::new();
        let err = decoder.read_next(&mut rx).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
